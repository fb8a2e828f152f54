//! Process ranking: collect every process, score it by CPU% + memory%, keep the top N.
//!
//! Collection goes through a [`ProcessSource`]; on Linux that reads `/proc` directly,
//! elsewhere it goes through sysinfo. Scoring and ordering are identical for both.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::types::ProcessStatus;

pub const DEFAULT_LIMIT: usize = 20;

/// Enumerates processes. Implementations may keep state between passes (CPU deltas).
pub trait ProcessSource: Send {
    fn name(&self) -> &'static str;
    fn collect(&mut self) -> Result<Vec<ProcessStatus>>;
}

/// The source for the platform this binary runs on.
pub fn platform_source() -> Box<dyn ProcessSource> {
    #[cfg(target_os = "linux")]
    {
        Box::new(ProcfsSource::new())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Box::new(SysinfoSource::new())
    }
}

pub fn score(p: &ProcessStatus) -> f64 {
    p.cpu_percent + p.mem_percent
}

/// Output of one ranking pass.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ProcessSnapshot {
    pub processes: Vec<ProcessStatus>,
    /// Sums over `processes` only, not over every process seen.
    pub total_cpu: f64,
    pub total_mem: f64,
    pub total_count: usize,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Sorts by descending score, keeping collection order among equal scores, then
/// truncates to `limit` and totals what is left.
pub fn rank(mut processes: Vec<ProcessStatus>, limit: usize) -> ProcessSnapshot {
    let total_count = processes.len();
    // sort_by is stable
    processes.sort_by(|a, b| score(b).total_cmp(&score(a)));
    processes.truncate(limit);
    let (total_cpu, total_mem) = processes
        .iter()
        .fold((0.0, 0.0), |(c, m), p| (c + p.cpu_percent, m + p.mem_percent));
    ProcessSnapshot {
        processes,
        total_cpu,
        total_mem,
        total_count,
        updated_at: Some(Utc::now()),
    }
}

/// Background ranker. Readers get the last completed pass and never wait on a running one.
pub struct ProcessRanker {
    source: Arc<Mutex<Box<dyn ProcessSource>>>,
    limit: usize,
    latest: RwLock<Arc<ProcessSnapshot>>,
    running: AtomicBool,
    generation: AtomicU64,
    passes: AtomicU64,
}

impl ProcessRanker {
    pub fn new(source: Box<dyn ProcessSource>, limit: usize) -> Self {
        info!(source = source.name(), limit, "process ranker created");
        Self {
            source: Arc::new(Mutex::new(source)),
            limit,
            latest: RwLock::new(Arc::new(ProcessSnapshot::default())),
            running: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            passes: AtomicU64::new(0),
        }
    }

    pub fn latest(&self) -> Arc<ProcessSnapshot> {
        self.latest
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// First `n` entries of the latest pass.
    pub fn top(&self, n: usize) -> Vec<ProcessStatus> {
        self.latest().processes.iter().take(n).cloned().collect()
    }

    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Runs one full collect/rank pass and publishes it. On failure the previous
    /// snapshot stays in place.
    pub async fn refresh(&self) -> Result<Arc<ProcessSnapshot>> {
        let source = Arc::clone(&self.source);
        let collected = tokio::task::spawn_blocking(move || {
            source.lock().unwrap_or_else(|e| e.into_inner()).collect()
        })
        .await??;
        let snapshot = Arc::new(rank(collected, self.limit));
        *self.latest.write().unwrap_or_else(|e| e.into_inner()) = Arc::clone(&snapshot);
        self.passes.fetch_add(1, Ordering::Relaxed);
        debug!(
            total = snapshot.total_count,
            kept = snapshot.processes.len(),
            "process snapshot published"
        );
        Ok(snapshot)
    }

    /// Spawns the ranking loop; the first pass runs immediately. No-op if already running.
    pub fn start(self: &Arc<Self>, interval: Duration) -> Option<JoinHandle<()>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("process ranker already running");
            return None;
        }
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let this = Arc::clone(self);
        info!(?interval, "process ranker started");
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !(this.is_running() && this.generation.load(Ordering::Acquire) == generation) {
                    break;
                }
                if let Err(e) = this.refresh().await {
                    warn!("process collection failed: {e}");
                }
            }
            debug!(generation, "process loop exited");
        }))
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!("process ranker stopped");
        }
    }
}

// ---------- Linux: /proc ----------

#[cfg(target_os = "linux")]
pub use procfs::ProcfsSource;

#[cfg(target_os = "linux")]
mod procfs {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    use crate::error::AgentError;

    const PAGE_SIZE: u64 = 4096;

    #[derive(Debug, Clone, PartialEq)]
    pub(super) struct ProcStat {
        pub name: String,
        pub state: String,
        pub jiffies: u64,
        pub rss_pages: u64,
    }

    /// Parses `/proc/<pid>/stat`. The command name may itself contain spaces and
    /// parentheses, so fields are located relative to the last `)`.
    pub(super) fn parse_stat(s: &str) -> Option<ProcStat> {
        let lpar = s.find('(')?;
        let rpar = s.rfind(')')?;
        let name = s.get(lpar + 1..rpar)?.to_string();
        let mut it = s.get(rpar + 1..)?.split_whitespace();
        let state = it.next()?.to_string();
        // utime is the 11th field after state, stime the next
        let utime = it.nth(10)?.parse::<u64>().ok()?;
        let stime = it.next()?.parse::<u64>().ok()?;
        // rss is the 9th field after stime
        let rss_pages = it.nth(8)?.parse::<u64>().ok()?;
        Some(ProcStat {
            name,
            state,
            jiffies: utime.saturating_add(stime),
            rss_pages,
        })
    }

    /// Sum of the first eight counters on the aggregate `cpu` line of `/proc/stat`.
    pub(super) fn parse_total_jiffies(s: &str) -> Option<u64> {
        let line = s.lines().find(|l| l.starts_with("cpu "))?;
        Some(
            line.split_whitespace()
                .skip(1)
                .take(8)
                .filter_map(|t| t.parse::<u64>().ok())
                .fold(0u64, u64::saturating_add),
        )
    }

    /// `MemTotal` from `/proc/meminfo`, in bytes.
    pub(super) fn parse_mem_total(s: &str) -> Option<u64> {
        let line = s.lines().find(|l| l.starts_with("MemTotal:"))?;
        let kb = line.split_whitespace().nth(1)?.parse::<u64>().ok()?;
        Some(kb * 1024)
    }

    pub(super) fn state_name(code: &str) -> String {
        match code {
            "R" => "running",
            "S" => "sleeping",
            "D" => "disk_sleep",
            "Z" => "zombie",
            "T" => "stopped",
            "t" => "tracing_stop",
            "W" => "paging",
            "X" | "x" => "dead",
            "K" => "wakekill",
            "P" => "parked",
            "I" => "idle",
            "" => "unknown",
            other => other,
        }
        .to_string()
    }

    /// Reads `/proc` directly. CPU% is the share of all-core jiffies a process used
    /// since the previous pass, so the first pass reports zero for everyone.
    pub struct ProcfsSource {
        root: PathBuf,
        last_total: u64,
        last_per_pid: HashMap<u32, u64>,
    }

    impl ProcfsSource {
        pub fn new() -> Self {
            Self::with_root("/proc")
        }

        pub fn with_root(root: impl Into<PathBuf>) -> Self {
            Self {
                root: root.into(),
                last_total: 0,
                last_per_pid: HashMap::new(),
            }
        }

        fn read(&self, rel: &str) -> Result<String> {
            fs::read_to_string(self.root.join(rel))
                .map_err(|e| AgentError::provider("processes", format!("{rel}: {e}")))
        }
    }

    impl Default for ProcfsSource {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ProcessSource for ProcfsSource {
        fn name(&self) -> &'static str {
            "procfs"
        }

        fn collect(&mut self) -> Result<Vec<ProcessStatus>> {
            let total_now = parse_total_jiffies(&self.read("stat")?)
                .ok_or_else(|| AgentError::provider("processes", "malformed stat"))?;
            let mem_total = parse_mem_total(&self.read("meminfo")?)
                .filter(|m| *m > 0)
                .ok_or_else(|| AgentError::provider("processes", "malformed meminfo"))?;

            let entries = fs::read_dir(&self.root)
                .map_err(|e| AgentError::provider("processes", e.to_string()))?;
            let mut pids: Vec<u32> = entries
                .filter_map(|e| e.ok())
                .filter_map(|e| e.file_name().to_str()?.parse::<u32>().ok())
                .collect();
            pids.sort_unstable();

            let dt = total_now.saturating_sub(self.last_total);
            let warm = self.last_total != 0 && dt > 0;
            let mut current = HashMap::with_capacity(pids.len());
            let mut out = Vec::with_capacity(pids.len());
            for pid in pids {
                // Processes can exit between listing and reading; skip them.
                let Some(stat) = fs::read_to_string(self.root.join(format!("{pid}/stat")))
                    .ok()
                    .and_then(|s| parse_stat(&s))
                else {
                    continue;
                };
                current.insert(pid, stat.jiffies);
                let cpu_percent = match self.last_per_pid.get(&pid) {
                    Some(prev) if warm => {
                        (stat.jiffies.saturating_sub(*prev) as f64 / dt as f64 * 100.0)
                            .clamp(0.0, 100.0)
                    }
                    _ => 0.0,
                };
                let rss = stat.rss_pages.saturating_mul(PAGE_SIZE);
                out.push(ProcessStatus {
                    pid,
                    name: stat.name,
                    cpu_percent,
                    mem_percent: rss as f64 / mem_total as f64 * 100.0,
                    status: state_name(&stat.state),
                });
            }
            self.last_total = total_now;
            self.last_per_pid = current;
            Ok(out)
        }
    }
}

// ---------- portable: sysinfo ----------

/// Portable source. CPU% is normalised to the whole machine (0..100).
pub struct SysinfoSource {
    sys: sysinfo::System,
}

impl SysinfoSource {
    pub fn new() -> Self {
        Self {
            sys: sysinfo::System::new(),
        }
    }
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

fn sysinfo_state(s: sysinfo::ProcessStatus) -> &'static str {
    use sysinfo::ProcessStatus as S;
    match s {
        S::Run => "running",
        S::Sleep => "sleeping",
        S::Idle => "idle",
        S::Stop => "stopped",
        S::Zombie => "zombie",
        S::Tracing => "tracing_stop",
        S::Dead => "dead",
        S::Wakekill => "wakekill",
        S::Waking => "waking",
        S::Parked => "parked",
        S::UninterruptibleDiskSleep => "disk_sleep",
        S::LockBlocked => "lock_blocked",
        #[allow(unreachable_patterns)]
        _ => "unknown",
    }
}

impl ProcessSource for SysinfoSource {
    fn name(&self) -> &'static str {
        "sysinfo"
    }

    fn collect(&mut self) -> Result<Vec<ProcessStatus>> {
        use sysinfo::{ProcessRefreshKind, ProcessesToUpdate};

        self.sys.refresh_memory();
        self.sys.refresh_cpu_usage();
        self.sys.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cpu().with_memory(),
        );
        let cores = self.sys.cpus().len().max(1) as f64;
        let mem_total = self.sys.total_memory().max(1) as f64;
        let mut out: Vec<ProcessStatus> = self
            .sys
            .processes()
            .values()
            .map(|p| ProcessStatus {
                pid: p.pid().as_u32(),
                name: p.name().to_string_lossy().into_owned(),
                cpu_percent: (p.cpu_usage() as f64 / cores).clamp(0.0, 100.0),
                mem_percent: p.memory() as f64 / mem_total * 100.0,
                status: sysinfo_state(p.status()).to_string(),
            })
            .collect();
        // HashMap iteration order is arbitrary; pid order keeps ties deterministic.
        out.sort_by_key(|p| p.pid);
        Ok(out)
    }
}
