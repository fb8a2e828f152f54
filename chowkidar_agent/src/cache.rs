//! Read-through TTL cache in front of the metrics provider.
//!
//! Each metric kind has its own slot. A hit is a read-lock and a clone. A miss takes
//! the slot's flight gate, re-checks freshness, and only then calls the provider, so
//! concurrent misses on one kind wait for the same fetch instead of duplicating it.
//! Provider calls never run under the entry lock, and failures are never cached.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::{debug, warn};

use crate::error::Result;
use crate::provider::{blocking, require_interfaces, SharedProvider};
use crate::rate::RateCalculator;
use crate::types::{
    AggregatedNetworkStatus, CpuInfo, CpuStatus, DirectoryInfo, DiskStatus, MemoryStatus, NetworkStatus,
};

pub const DEFAULT_TTL: Duration = Duration::from_secs(1);
pub const DEFAULT_DIRECTORIES_TTL: Duration = Duration::from_secs(30);
// Directory ranking is cached at this depth; callers slice it down.
const DIRECTORY_SLOTS: usize = 20;

struct CacheEntry<T> {
    value: T,
    at: Instant,
}

struct Slot<T> {
    entry: RwLock<Option<CacheEntry<T>>>,
    flight: Mutex<()>,
}

impl<T: Clone> Slot<T> {
    fn new() -> Self {
        Self {
            entry: RwLock::new(None),
            flight: Mutex::new(()),
        }
    }

    async fn fresh(&self, ttl: Duration) -> Option<T> {
        let guard = self.entry.read().await;
        guard
            .as_ref()
            .filter(|e| e.at.elapsed() < ttl)
            .map(|e| e.value.clone())
    }

    async fn get_or_fetch<F, Fut>(&self, ttl: Duration, fetch: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(v) = self.fresh(ttl).await {
            return Ok(v);
        }
        let _flight = self.flight.lock().await;
        // Someone ahead of us in the gate may have refreshed already.
        if let Some(v) = self.fresh(ttl).await {
            return Ok(v);
        }
        let value = fetch().await?;
        *self.entry.write().await = Some(CacheEntry {
            value: value.clone(),
            at: Instant::now(),
        });
        Ok(value)
    }

    async fn clear(&self) {
        *self.entry.write().await = None;
    }
}

pub struct MetricsCache {
    provider: SharedProvider,
    ttl_ms: AtomicU64,
    directories_ttl: Duration,
    cpu: Slot<CpuStatus>,
    memory: Slot<MemoryStatus>,
    disk: Slot<DiskStatus>,
    partitions: Slot<Vec<DiskStatus>>,
    network: Slot<AggregatedNetworkStatus>,
    directories: Slot<Vec<DirectoryInfo>>,
    cpu_info: OnceCell<CpuInfo>,
    rates: StdMutex<RateCalculator>,
}

impl MetricsCache {
    pub fn new(provider: SharedProvider) -> Self {
        Self::with_ttls(provider, DEFAULT_TTL, DEFAULT_DIRECTORIES_TTL)
    }

    pub fn with_ttls(provider: SharedProvider, ttl: Duration, directories_ttl: Duration) -> Self {
        Self {
            provider,
            ttl_ms: AtomicU64::new(ttl.as_millis() as u64),
            directories_ttl,
            cpu: Slot::new(),
            memory: Slot::new(),
            disk: Slot::new(),
            partitions: Slot::new(),
            network: Slot::new(),
            directories: Slot::new(),
            cpu_info: OnceCell::new(),
            rates: StdMutex::new(RateCalculator::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms.load(Ordering::Relaxed))
    }

    /// Affects freshness checks from now on; values already handed out are unaffected.
    pub fn set_ttl(&self, ttl: Duration) {
        self.ttl_ms.store(ttl.as_millis() as u64, Ordering::Relaxed);
    }

    pub async fn cpu(&self) -> Result<CpuStatus> {
        self.cpu
            .get_or_fetch(self.ttl(), || async {
                logged("cpu", blocking(&self.provider, |p| p.cpu()).await)
            })
            .await
    }

    /// Read on first success and kept for the process lifetime; `clear` keeps it too.
    pub async fn cpu_info(&self) -> Result<CpuInfo> {
        self.cpu_info
            .get_or_try_init(|| async {
                logged("cpu_info", blocking(&self.provider, |p| p.cpu_info()).await)
            })
            .await
            .cloned()
    }

    pub async fn memory(&self) -> Result<MemoryStatus> {
        self.memory
            .get_or_fetch(self.ttl(), || async {
                logged("memory", blocking(&self.provider, |p| p.memory()).await)
            })
            .await
    }

    /// Usage of the filesystem holding `/`.
    pub async fn disk(&self) -> Result<DiskStatus> {
        self.disk
            .get_or_fetch(self.ttl(), || async {
                logged("disk", blocking(&self.provider, |p| p.disk("/")).await)
            })
            .await
    }

    pub async fn partitions(&self) -> Result<Vec<DiskStatus>> {
        self.partitions
            .get_or_fetch(self.ttl(), || async {
                logged("partitions", blocking(&self.provider, |p| p.partitions()).await)
            })
            .await
    }

    /// Aggregated counters with rates. Each refresh advances the rate baseline once.
    pub async fn network(&self) -> Result<AggregatedNetworkStatus> {
        self.network
            .get_or_fetch(self.ttl(), || async {
                let interfaces = logged(
                    "network",
                    blocking(&self.provider, |p| p.network())
                        .await
                        .and_then(require_interfaces),
                )?;
                Ok(self.aggregate(interfaces, Instant::now()))
            })
            .await
    }

    pub async fn interfaces(&self) -> Result<Vec<NetworkStatus>> {
        self.network().await.map(|n| n.interfaces)
    }

    pub async fn top_directories(&self, limit: usize) -> Result<Vec<DirectoryInfo>> {
        let mut dirs = self
            .directories
            .get_or_fetch(self.directories_ttl, || async {
                logged(
                    "directories",
                    blocking(&self.provider, |p| p.top_directories(DIRECTORY_SLOTS)).await,
                )
            })
            .await?;
        dirs.truncate(limit);
        Ok(dirs)
    }

    pub async fn clear(&self) {
        self.cpu.clear().await;
        self.memory.clear().await;
        self.disk.clear().await;
        self.partitions.clear().await;
        self.network.clear().await;
        self.directories.clear().await;
    }

    fn aggregate(&self, interfaces: Vec<NetworkStatus>, now: Instant) -> AggregatedNetworkStatus {
        let mut agg = AggregatedNetworkStatus::from_interfaces(interfaces);
        let mut rates = self.rates.lock().unwrap_or_else(|e| e.into_inner());
        let (tx, rx) = rates.observe(agg.bytes_sent, agg.bytes_recv, now);
        agg.bytes_sent_rate = tx;
        agg.bytes_recv_rate = rx;
        debug!(tx_rate = tx, rx_rate = rx, "network cache refreshed");
        agg
    }
}

fn logged<T>(kind: &'static str, res: Result<T>) -> Result<T> {
    if let Err(e) = &res {
        warn!(kind, "metric refresh failed: {e}");
    }
    res
}
