//! Rolling in-memory history of CPU, memory, disk and network samples.
//!
//! The collector samples the provider directly (never the TTL cache) on its own
//! interval. Provider calls run with no lock held; the store's write lock is taken
//! only for the constant-time appends afterwards.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{AgentError, Result};
use crate::provider::{blocking, require_interfaces, SharedProvider};
use crate::rate::RateCalculator;
use crate::types::{CpuSample, DiskSample, HistoryWindow, MemorySample, NetworkSample};

pub const DEFAULT_CAPACITY: usize = 60;

/// Fixed-capacity FIFO; pushing past capacity drops the oldest entry.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    cap: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            items: VecDeque::with_capacity(cap),
            cap,
        }
    }

    pub fn push(&mut self, v: T) {
        if self.items.len() == self.cap {
            self.items.pop_front();
        }
        self.items.push_back(v);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }
}

pub trait Timestamped {
    fn timestamp(&self) -> DateTime<Utc>;
}

macro_rules! timestamped {
    ($($t:ty),*) => {
        $(impl Timestamped for $t {
            fn timestamp(&self) -> DateTime<Utc> {
                self.timestamp
            }
        })*
    };
}
timestamped!(CpuSample, MemorySample, DiskSample, NetworkSample);

impl<T: Timestamped + Clone> RingBuffer<T> {
    /// Samples with `since <= timestamp <= until`, oldest first.
    pub fn window(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> Vec<T> {
        self.items
            .iter()
            .filter(|s| {
                let ts = s.timestamp();
                ts >= since && ts <= until
            })
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HistoryKind {
    Cpu,
    Memory,
    Disk,
    Network,
}

impl HistoryKind {
    pub const ALL: [HistoryKind; 4] = [
        HistoryKind::Cpu,
        HistoryKind::Memory,
        HistoryKind::Disk,
        HistoryKind::Network,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            HistoryKind::Cpu => "cpu",
            HistoryKind::Memory => "memory",
            HistoryKind::Disk => "disk",
            HistoryKind::Network => "network",
        }
    }
}

impl fmt::Display for HistoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HistoryKind {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cpu" => Ok(HistoryKind::Cpu),
            "memory" => Ok(HistoryKind::Memory),
            "disk" => Ok(HistoryKind::Disk),
            "network" => Ok(HistoryKind::Network),
            other => Err(AgentError::InvalidMetric(other.to_string())),
        }
    }
}

/// One kind's samples for a window; serializes as a bare JSON array.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum HistorySeries {
    Cpu(Vec<CpuSample>),
    Memory(Vec<MemorySample>),
    Disk(Vec<DiskSample>),
    Network(Vec<NetworkSample>),
}

impl HistorySeries {
    pub fn len(&self) -> usize {
        match self {
            HistorySeries::Cpu(v) => v.len(),
            HistorySeries::Memory(v) => v.len(),
            HistorySeries::Disk(v) => v.len(),
            HistorySeries::Network(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Series {
    cpu: RingBuffer<CpuSample>,
    memory: RingBuffer<MemorySample>,
    disk: RingBuffer<DiskSample>,
    network: RingBuffer<NetworkSample>,
}

/// The four ring buffers behind one readers-writer lock.
pub struct HistoryStore {
    series: RwLock<Series>,
}

impl HistoryStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            series: RwLock::new(Series {
                cpu: RingBuffer::new(capacity),
                memory: RingBuffer::new(capacity),
                disk: RingBuffer::new(capacity),
                network: RingBuffer::new(capacity),
            }),
        }
    }

    pub fn push_cpu(&self, s: CpuSample) {
        self.write().cpu.push(s);
    }

    pub fn push_memory(&self, s: MemorySample) {
        self.write().memory.push(s);
    }

    pub fn push_disk(&self, s: DiskSample) {
        self.write().disk.push(s);
    }

    pub fn push_network(&self, s: NetworkSample) {
        self.write().network.push(s);
    }

    pub fn query_at(&self, kind: HistoryKind, window: Duration, now: DateTime<Utc>) -> HistorySeries {
        let since = cutoff(now, window);
        let s = self.read();
        match kind {
            HistoryKind::Cpu => HistorySeries::Cpu(s.cpu.window(since, now)),
            HistoryKind::Memory => HistorySeries::Memory(s.memory.window(since, now)),
            HistoryKind::Disk => HistorySeries::Disk(s.disk.window(since, now)),
            HistoryKind::Network => HistorySeries::Network(s.network.window(since, now)),
        }
    }

    pub fn window_at(&self, window: Duration, now: DateTime<Utc>) -> HistoryWindow {
        let since = cutoff(now, window);
        let s = self.read();
        HistoryWindow {
            cpu: s.cpu.window(since, now),
            memory: s.memory.window(since, now),
            disk: s.disk.window(since, now),
            network: s.network.window(since, now),
        }
    }

    pub fn latest_network(&self) -> Option<NetworkSample> {
        self.read().network.last().cloned()
    }

    pub fn len(&self, kind: HistoryKind) -> usize {
        let s = self.read();
        match kind {
            HistoryKind::Cpu => s.cpu.len(),
            HistoryKind::Memory => s.memory.len(),
            HistoryKind::Disk => s.disk.len(),
            HistoryKind::Network => s.network.len(),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Series> {
        self.series.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Series> {
        self.series.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn cutoff(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| now.checked_sub_signed(w))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Periodic sampler feeding a [`HistoryStore`]. Stopped until [`start`](Self::start).
pub struct HistoryCollector {
    provider: SharedProvider,
    store: HistoryStore,
    rates: Mutex<RateCalculator>,
    running: AtomicBool,
    generation: AtomicU64,
    ticks: AtomicU64,
}

impl HistoryCollector {
    pub fn new(provider: SharedProvider, capacity: usize) -> Self {
        Self {
            provider,
            store: HistoryStore::new(capacity),
            rates: Mutex::new(RateCalculator::new()),
            running: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &HistoryStore {
        &self.store
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Completed collection passes since construction.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Spawns the sampling loop. Returns `None` (and does nothing) if already running.
    /// The first sample is taken one `interval` after start.
    pub fn start(self: &Arc<Self>, interval: Duration) -> Option<JoinHandle<()>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("history collector already running");
            return None;
        }
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let this = Arc::clone(self);
        info!(?interval, "history collector started");
        Some(tokio::spawn(async move {
            let period = interval.max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !this.is_current(generation) {
                    break;
                }
                this.collect_once().await;
            }
            debug!(generation, "history loop exited");
        }))
    }

    /// Takes effect at the loop's next tick; an in-flight pass still completes.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!("history collector stopped");
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.is_running() && self.generation.load(Ordering::Acquire) == generation
    }

    /// One sampling pass. A failed kind is logged and skipped; the others still append.
    pub async fn collect_once(&self) {
        let now = Utc::now();
        let p = &self.provider;
        let (cpu, memory, disk, network) = tokio::join!(
            blocking(p, |p| p.cpu()),
            blocking(p, |p| p.memory()),
            blocking(p, |p| p.disk("/")),
            blocking(p, |p| p.network()),
        );

        let network = network.and_then(require_interfaces).map(|ifaces| {
            let sent = ifaces.iter().fold(0u64, |acc, i| acc.saturating_add(i.bytes_sent));
            let recv = ifaces.iter().fold(0u64, |acc, i| acc.saturating_add(i.bytes_recv));
            let (tx, rx) = self
                .rates
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .observe(sent, recv, Instant::now());
            NetworkSample {
                timestamp: now,
                bytes_sent: sent,
                bytes_recv: recv,
                bytes_sent_rate: tx,
                bytes_recv_rate: rx,
            }
        });

        match cpu {
            Ok(c) => self.store.push_cpu(CpuSample {
                timestamp: now,
                usage: c.usage_percent,
                per_core: c.per_core,
            }),
            Err(e) => warn!(kind = "cpu", "history sample skipped: {e}"),
        }
        match memory {
            Ok(m) => self.store.push_memory(MemorySample {
                timestamp: now,
                used_gb: m.used_gb,
                available_gb: m.available_gb,
                usage_percent: m.usage_percent,
            }),
            Err(e) => warn!(kind = "memory", "history sample skipped: {e}"),
        }
        match disk {
            Ok(d) => self.store.push_disk(DiskSample {
                timestamp: now,
                used_gb: d.used_gb,
                total_gb: d.total_gb,
                usage_percent: d.usage_percent,
            }),
            Err(e) => warn!(kind = "disk", "history sample skipped: {e}"),
        }
        match network {
            Ok(n) => self.store.push_network(n),
            Err(e) => warn!(kind = "network", "history sample skipped: {e}"),
        }
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Samples of `kind` no older than `window`, oldest first.
    pub fn history(&self, kind: HistoryKind, window: Duration) -> HistorySeries {
        self.store.query_at(kind, window, Utc::now())
    }

    pub fn window(&self, window: Duration) -> HistoryWindow {
        self.store.window_at(window, Utc::now())
    }

    pub fn latest_network(&self) -> Option<NetworkSample> {
        self.store.latest_network()
    }
}
