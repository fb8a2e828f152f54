//! Metrics provider: blocking reads of the local host's CPU, memory, disk and network.
//!
//! Everything above this module treats the provider as opaque. Calls may take tens to
//! hundreds of milliseconds, so async code runs them on the blocking pool.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sysinfo::{CpuRefreshKind, Disks, Networks, System};
use tracing::debug;

use crate::error::{AgentError, Result};
use crate::types::{
    CpuInfo, CpuStatus, DirectoryInfo, DiskStatus, MemoryStatus, NetworkStatus, GB,
};

pub trait MetricsProvider: Send + Sync {
    fn cpu(&self) -> Result<CpuStatus>;
    fn cpu_info(&self) -> Result<CpuInfo>;
    fn memory(&self) -> Result<MemoryStatus>;
    fn disk(&self, path: &str) -> Result<DiskStatus>;
    fn partitions(&self) -> Result<Vec<DiskStatus>>;
    fn network(&self) -> Result<Vec<NetworkStatus>>;
    fn top_directories(&self, limit: usize) -> Result<Vec<DirectoryInfo>>;
}

pub type SharedProvider = Arc<dyn MetricsProvider>;

/// Runs a provider call off the async runtime.
pub async fn blocking<T, F>(provider: &SharedProvider, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn MetricsProvider) -> Result<T> + Send + 'static,
{
    let p = provider.clone();
    tokio::task::spawn_blocking(move || f(p.as_ref())).await?
}

// Directory scans stop at this depth below each top-level entry.
const DIR_SCAN_DEPTH: usize = 3;

/// Production provider backed by persistent sysinfo handles, so CPU usage is
/// measured against the previous refresh rather than a fresh zero baseline.
pub struct SysinfoProvider {
    sys: Mutex<System>,
    networks: Mutex<Networks>,
    disks: Mutex<Disks>,
}

impl SysinfoProvider {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        Self {
            sys: Mutex::new(sys),
            networks: Mutex::new(Networks::new_with_refreshed_list()),
            disks: Mutex::new(Disks::new_with_refreshed_list()),
        }
    }

    fn disk_statuses(&self) -> Vec<DiskStatus> {
        let mut disks = self.disks.lock().unwrap_or_else(|e| e.into_inner());
        disks.refresh(true);
        disks
            .list()
            .iter()
            .map(|d| {
                let total = d.total_space();
                let free = d.available_space();
                disk_status(
                    d.mount_point().to_string_lossy().into_owned(),
                    d.file_system().to_string_lossy().into_owned(),
                    total,
                    free,
                )
            })
            .collect()
    }
}

impl Default for SysinfoProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn disk_status(path: String, filesystem: String, total: u64, free: u64) -> DiskStatus {
    let used = total.saturating_sub(free);
    DiskStatus {
        path,
        total_gb: total as f64 / GB,
        used_gb: used as f64 / GB,
        free_gb: free as f64 / GB,
        usage_percent: percent(used, total),
        filesystem,
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

impl MetricsProvider for SysinfoProvider {
    fn cpu(&self) -> Result<CpuStatus> {
        let mut sys = self.sys.lock().unwrap_or_else(|e| e.into_inner());
        sys.refresh_cpu_usage();
        let per_core: Vec<f64> = sys.cpus().iter().map(|c| c.cpu_usage() as f64).collect();
        if per_core.is_empty() {
            return Err(AgentError::provider("cpu", "no cpus reported"));
        }
        Ok(CpuStatus {
            usage_percent: sys.global_cpu_usage() as f64,
            core_count: per_core.len(),
            per_core,
        })
    }

    fn cpu_info(&self) -> Result<CpuInfo> {
        let mut sys = self.sys.lock().unwrap_or_else(|e| e.into_inner());
        sys.refresh_cpu_list(CpuRefreshKind::nothing().with_frequency());
        let first = sys
            .cpus()
            .first()
            .ok_or_else(|| AgentError::provider("cpu_info", "no cpus reported"))?;
        Ok(describe_cpu(CpuDescription {
            brand: first.brand(),
            vendor: first.vendor_id(),
            arch: &System::cpu_arch(),
            mhz: first.frequency(),
            threads: sys.cpus().len(),
            physical: System::physical_core_count(),
        }))
    }

    fn memory(&self) -> Result<MemoryStatus> {
        let mut sys = self.sys.lock().unwrap_or_else(|e| e.into_inner());
        sys.refresh_memory();
        let total = sys.total_memory();
        if total == 0 {
            return Err(AgentError::provider("memory", "total memory is zero"));
        }
        let used = sys.used_memory();
        Ok(MemoryStatus {
            total_gb: total as f64 / GB,
            used_gb: used as f64 / GB,
            available_gb: sys.available_memory() as f64 / GB,
            usage_percent: percent(used, total),
        })
    }

    fn disk(&self, path: &str) -> Result<DiskStatus> {
        let path = if path.is_empty() { "/" } else { path };
        // The mount with the longest matching prefix holds `path`.
        self.disk_statuses()
            .into_iter()
            .filter(|d| Path::new(path).starts_with(&d.path))
            .max_by_key(|d| d.path.len())
            .map(|mut d| {
                d.path = path.to_string();
                d
            })
            .ok_or_else(|| AgentError::provider("disk", format!("no mount holds {path}")))
    }

    fn partitions(&self) -> Result<Vec<DiskStatus>> {
        Ok(self.disk_statuses())
    }

    fn network(&self) -> Result<Vec<NetworkStatus>> {
        let mut nets = self.networks.lock().unwrap_or_else(|e| e.into_inner());
        nets.refresh(true);
        let mut out: Vec<NetworkStatus> = nets
            .iter()
            .map(|(name, data)| NetworkStatus {
                interface: name.to_string(),
                bytes_sent: data.total_transmitted(),
                bytes_recv: data.total_received(),
                packets_sent: data.total_packets_transmitted(),
                packets_recv: data.total_packets_received(),
                errors_in: data.total_errors_on_received(),
                errors_out: data.total_errors_on_transmitted(),
                // sysinfo exposes no drop counters
                drops_in: 0,
                drops_out: 0,
                bytes_sent_gb: data.total_transmitted() as f64 / GB,
                bytes_recv_gb: data.total_received() as f64 / GB,
            })
            .collect();
        out.sort_by(|a, b| a.interface.cmp(&b.interface));
        Ok(out)
    }

    fn top_directories(&self, limit: usize) -> Result<Vec<DirectoryInfo>> {
        let root = dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("/"));
        Ok(rank_directories(&root, limit))
    }
}

/// Raw processor facts as the OS reports them.
pub struct CpuDescription<'a> {
    pub brand: &'a str,
    pub vendor: &'a str,
    pub arch: &'a str,
    pub mhz: u64,
    pub threads: usize,
    pub physical: Option<usize>,
}

/// Classifies the processor and fills in the fallbacks for blank fields.
pub fn describe_cpu(d: CpuDescription<'_>) -> CpuInfo {
    let arch = d.arch.to_ascii_lowercase();
    let vendor_lower = d.vendor.to_ascii_lowercase();
    let brand_lower = d.brand.to_ascii_lowercase();
    let is_arm = arch.starts_with("arm")
        || arch.starts_with("aarch64")
        || vendor_lower.contains("arm")
        || brand_lower.contains("apple");
    let is_x86 = !is_arm
        && (arch.contains("x86")
            || arch == "i686"
            || vendor_lower.contains("intel")
            || vendor_lower.contains("amd"));

    let vendor = match d.vendor.trim() {
        "" if is_arm => "ARM".to_string(),
        "" if is_x86 => "Unknown x86".to_string(),
        "" => "Unknown".to_string(),
        v => v.to_string(),
    };
    let family = if is_arm {
        "ARM64"
    } else if is_x86 {
        "x86/x64"
    } else {
        "Unknown"
    };
    let max_frequency = if d.mhz == 0 {
        "Unknown".to_string()
    } else {
        format!("{:.2} GHz", d.mhz as f64 / 1000.0)
    };

    CpuInfo {
        model_name: d.brand.trim().to_string(),
        architecture: format!("{vendor} / {family}"),
        vendor_id: vendor,
        cores: d.physical.filter(|&n| n > 0).unwrap_or(d.threads),
        threads: d.threads,
        max_frequency,
        is_arm,
        is_x86,
    }
}

/// An empty interface list carries no counters; treat it as a failed read so it never
/// becomes a rate baseline.
pub(crate) fn require_interfaces(ifaces: Vec<NetworkStatus>) -> Result<Vec<NetworkStatus>> {
    if ifaces.is_empty() {
        return Err(AgentError::provider("network", "no interfaces reported"));
    }
    Ok(ifaces)
}

/// Sizes every immediate subdirectory of `root` (bounded depth) and keeps the largest.
/// Unreadable directories are skipped rather than failing the whole scan.
pub fn rank_directories(root: &Path, limit: usize) -> Vec<DirectoryInfo> {
    let entries = match fs::read_dir(root) {
        Ok(e) => e,
        Err(e) => {
            debug!(root = %root.display(), "cannot read directory: {e}");
            return Vec::new();
        }
    };
    let mut sized: Vec<(PathBuf, u64)> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter(|e| e.file_name() != ".Trash")
        .map(|e| {
            let p = e.path();
            let size = dir_size(&p, 0, DIR_SCAN_DEPTH);
            (p, size)
        })
        .filter(|(_, size)| *size > 0)
        .collect();
    sized.sort_by(|a, b| b.1.cmp(&a.1));
    sized.truncate(limit);
    sized
        .into_iter()
        .map(|(p, size)| DirectoryInfo {
            path: p.to_string_lossy().into_owned(),
            size_gb: size as f64 / GB,
            size: format_bytes(size),
        })
        .collect()
}

fn dir_size(path: &Path, depth: usize, max_depth: usize) -> u64 {
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };
    let mut total = 0u64;
    for entry in entries.filter_map(|e| e.ok()) {
        let Ok(ft) = entry.file_type() else { continue };
        if ft.is_dir() {
            if depth < max_depth {
                total = total.saturating_add(dir_size(&entry.path(), depth + 1, max_depth));
            }
        } else if let Ok(meta) = entry.metadata() {
            total = total.saturating_add(meta.len());
        }
    }
    total
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GIB: u64 = MB * 1024;
    const TB: u64 = GIB * 1024;
    match bytes {
        b if b >= TB => format!("{:.1} TB", b as f64 / TB as f64),
        b if b >= GIB => format!("{:.1} GB", b as f64 / GIB as f64),
        b if b >= MB => format!("{:.1} MB", b as f64 / MB as f64),
        b if b >= KB => format!("{:.1} KB", b as f64 / KB as f64),
        b => format!("{b} B"),
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.0 GB");
    }

    #[test]
    fn directories_ranked_by_size() {
        let tmp = tempfile::tempdir().unwrap();
        let big = tmp.path().join("big");
        let small = tmp.path().join("small");
        let empty = tmp.path().join("empty");
        fs::create_dir_all(big.join("nested")).unwrap();
        fs::create_dir_all(&small).unwrap();
        fs::create_dir_all(&empty).unwrap();
        fs::write(big.join("nested").join("a.bin"), vec![0u8; 4096]).unwrap();
        fs::write(small.join("b.bin"), vec![0u8; 10]).unwrap();

        let ranked = rank_directories(tmp.path(), 5);
        assert_eq!(ranked.len(), 2, "empty directories are skipped");
        assert!(ranked[0].path.ends_with("big"));
        assert!(ranked[1].path.ends_with("small"));

        let one = rank_directories(tmp.path(), 1);
        assert_eq!(one.len(), 1);
    }

    #[test]
    fn missing_root_yields_nothing() {
        assert!(rank_directories(Path::new("/definitely/not/here"), 3).is_empty());
    }

    #[test]
    fn cpu_description_fills_blanks() {
        let x86 = describe_cpu(CpuDescription {
            brand: "Intel(R) Core(TM) i7-9700K CPU @ 3.60GHz ",
            vendor: "GenuineIntel",
            arch: "x86_64",
            mhz: 3_600,
            threads: 8,
            physical: Some(8),
        });
        assert!(x86.is_x86 && !x86.is_arm);
        assert_eq!(x86.model_name, "Intel(R) Core(TM) i7-9700K CPU @ 3.60GHz");
        assert_eq!(x86.architecture, "GenuineIntel / x86/x64");
        assert_eq!(x86.max_frequency, "3.60 GHz");

        let arm = describe_cpu(CpuDescription {
            brand: "Apple M2",
            vendor: "",
            arch: "arm64",
            mhz: 0,
            threads: 8,
            physical: None,
        });
        assert!(arm.is_arm && !arm.is_x86);
        assert_eq!(arm.vendor_id, "ARM");
        assert_eq!(arm.architecture, "ARM / ARM64");
        assert_eq!(arm.max_frequency, "Unknown");
        assert_eq!(arm.cores, 8);
    }

    #[test]
    fn empty_interface_list_is_an_error() {
        assert!(matches!(
            require_interfaces(Vec::new()),
            Err(AgentError::Provider { .. })
        ));
        let one = vec![NetworkStatus::default()];
        assert_eq!(require_interfaces(one).unwrap().len(), 1);
    }

    #[test]
    fn disk_percent_handles_zero_total() {
        let d = disk_status("/".into(), "tmpfs".into(), 0, 0);
        assert_eq!(d.usage_percent, 0.0);
    }
}
