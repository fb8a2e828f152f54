//! WebSocket fan-out hub.
//!
//! One task owns the client registry. Everything else talks to it through
//! [`HubHandle`], which only sends commands into that task. Each client gets a
//! bounded queue; the hub holds the only strong sender, so removing a client from
//! the registry is what closes its queue, and that can only happen once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::MetricsCache;
use crate::process::ProcessRanker;
use crate::types::{StatsPayload, WsMessage};

/// A serialised outbound frame, shared by every client it is sent to.
pub type Frame = Arc<str>;
pub type ClientId = String;

pub const DEFAULT_QUEUE: usize = 256;
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);
pub const BROADCAST_PROCESSES: usize = 10;
const COMMAND_BACKLOG: usize = 1024;

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub tick: Duration,
    pub queue: usize,
    pub process_cap: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            queue: DEFAULT_QUEUE,
            process_cap: BROADCAST_PROCESSES,
        }
    }
}

enum Command {
    Register {
        id: ClientId,
        seq: u64,
        tx: mpsc::Sender<Frame>,
    },
    Unregister {
        id: ClientId,
        seq: u64,
    },
    Broadcast(Frame),
    Count(oneshot::Sender<usize>),
    Shutdown,
}

/// A client's membership. Replies sent through it share the client's outbound queue
/// but never keep that queue open on their own.
#[derive(Debug, Clone)]
pub struct Registration {
    pub id: ClientId,
    seq: u64,
    reply: mpsc::WeakSender<Frame>,
}

impl Registration {
    /// Queues a frame for this client only. False if the queue is full or closed.
    pub fn reply(&self, frame: Frame) -> bool {
        match self.reply.upgrade() {
            Some(tx) => tx.try_send(frame).is_ok(),
            None => false,
        }
    }
}

#[derive(Clone)]
pub struct HubHandle {
    cmd: mpsc::Sender<Command>,
    next_seq: Arc<AtomicU64>,
    queue: usize,
}

impl HubHandle {
    /// Adds a client and returns its membership plus the receiving end of its queue.
    /// Registering an id that is already present replaces (and closes) the old queue.
    /// `None` once the hub has shut down.
    pub async fn register(&self, id: impl Into<ClientId>) -> Option<(Registration, mpsc::Receiver<Frame>)> {
        let id = id.into();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue);
        let reply = tx.downgrade();
        self.cmd
            .send(Command::Register {
                id: id.clone(),
                seq,
                tx,
            })
            .await
            .ok()?;
        Some((Registration { id, seq, reply }, rx))
    }

    /// Removes the client if this registration is still the current one for its id.
    /// Safe to call more than once.
    pub async fn unregister(&self, reg: &Registration) {
        let _ = self
            .cmd
            .send(Command::Unregister {
                id: reg.id.clone(),
                seq: reg.seq,
            })
            .await;
    }

    pub async fn broadcast(&self, frame: Frame) {
        let _ = self.cmd.send(Command::Broadcast(frame)).await;
    }

    /// Number of registered clients; 0 after shutdown.
    pub async fn client_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.cmd.send(Command::Count(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Drops every client queue and ends the hub task.
    pub async fn shutdown(&self) {
        let _ = self.cmd.send(Command::Shutdown).await;
    }
}

pub struct Hub {
    clients: HashMap<ClientId, (u64, mpsc::Sender<Frame>)>,
    rx: mpsc::Receiver<Command>,
    cmd: mpsc::WeakSender<Command>,
    cache: Arc<MetricsCache>,
    ranker: Arc<ProcessRanker>,
    cfg: HubConfig,
    gathering: Arc<AtomicBool>,
}

impl Hub {
    /// Spawns the control loop and returns a handle to it.
    pub fn spawn(
        cache: Arc<MetricsCache>,
        ranker: Arc<ProcessRanker>,
        cfg: HubConfig,
    ) -> (HubHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BACKLOG);
        let handle = HubHandle {
            cmd: tx.clone(),
            next_seq: Arc::new(AtomicU64::new(1)),
            queue: cfg.queue.max(1),
        };
        let hub = Hub {
            clients: HashMap::new(),
            rx,
            cmd: tx.downgrade(),
            cache,
            ranker,
            cfg,
            gathering: Arc::new(AtomicBool::new(false)),
        };
        (handle, tokio::spawn(hub.run()))
    }

    async fn run(mut self) {
        let period = self.cfg.tick.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(tick = ?period, queue = self.cfg.queue, "hub running");

        loop {
            tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(Command::Register { id, seq, tx }) => {
                        if self.clients.insert(id.clone(), (seq, tx)).is_some() {
                            debug!(client = %id, "replaced existing registration");
                        }
                        info!(client = %id, total = self.clients.len(), "client registered");
                    }
                    Some(Command::Unregister { id, seq }) => {
                        if self.clients.get(&id).is_some_and(|(s, _)| *s == seq) {
                            // Dropping the sender closes the queue.
                            self.clients.remove(&id);
                            info!(client = %id, total = self.clients.len(), "client unregistered");
                        }
                    }
                    Some(Command::Broadcast(frame)) => self.fan_out(frame),
                    Some(Command::Count(reply)) => {
                        let _ = reply.send(self.clients.len());
                    }
                    Some(Command::Shutdown) | None => break,
                },
                _ = ticker.tick() => self.on_tick(),
            }
        }

        let n = self.clients.len();
        self.clients.clear();
        info!(dropped = n, "hub stopped");
    }

    fn fan_out(&mut self, frame: Frame) {
        let mut closed = Vec::new();
        for (id, (_, tx)) in &self.clients {
            match tx.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(client = %id, "client queue full, frame dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(id.clone()),
            }
        }
        for id in closed {
            self.clients.remove(&id);
            debug!(client = %id, "removed client with closed queue");
        }
    }

    /// Gathers stats off the loop so a slow provider never stalls registration;
    /// the result comes back in as an ordinary broadcast.
    fn on_tick(&self) {
        if self.clients.is_empty() || self.gathering.swap(true, Ordering::AcqRel) {
            return;
        }
        let cache = Arc::clone(&self.cache);
        let ranker = Arc::clone(&self.ranker);
        let gathering = Arc::clone(&self.gathering);
        let cmd = self.cmd.clone();
        let cap = self.cfg.process_cap;
        tokio::spawn(async move {
            let frame = stats_frame(&cache, &ranker, cap).await;
            gathering.store(false, Ordering::Release);
            if let (Some(frame), Some(cmd)) = (frame, cmd.upgrade()) {
                let _ = cmd.send(Command::Broadcast(frame)).await;
            }
        });
    }
}

/// Current stats from the cache and the latest ranking pass. A failed kind is null.
pub async fn gather_stats(cache: &MetricsCache, ranker: &ProcessRanker, process_cap: usize) -> StatsPayload {
    let (cpu, memory, disk, network) =
        tokio::join!(cache.cpu(), cache.memory(), cache.disk(), cache.network());
    StatsPayload {
        cpu: cpu.ok(),
        memory: memory.ok(),
        disk: disk.ok(),
        network: network.ok(),
        processes: ranker.top(process_cap),
        timestamp: Utc::now(),
    }
}

async fn stats_frame(cache: &MetricsCache, ranker: &ProcessRanker, process_cap: usize) -> Option<Frame> {
    let data = gather_stats(cache, ranker, process_cap).await;
    let msg = WsMessage::Stats {
        timestamp: data.timestamp,
        data,
    };
    match serde_json::to_string(&msg) {
        Ok(js) => Some(js.into()),
        Err(e) => {
            warn!("cannot serialise stats: {e}");
            None
        }
    }
}
