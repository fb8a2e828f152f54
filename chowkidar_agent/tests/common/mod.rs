//! Fixtures shared by the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chowkidar_agent::auth::TokenAuthority;
use chowkidar_agent::config::Config;
use chowkidar_agent::error::{AgentError, Result};
use chowkidar_agent::process::ProcessSource;
use chowkidar_agent::provider::{describe_cpu, CpuDescription, MetricsProvider};
use chowkidar_agent::state::AppState;
use chowkidar_agent::types::{
    CpuInfo, CpuStatus, DirectoryInfo, DiskStatus, MemoryStatus, NetworkStatus, ProcessStatus,
};

pub const SECRET: &str = "integration-secret-integration-secret";

/// Fixed readings; cpu can be switched to fail.
#[derive(Default)]
pub struct StaticProvider {
    pub fail_cpu: AtomicBool,
}

impl MetricsProvider for StaticProvider {
    fn cpu(&self) -> Result<CpuStatus> {
        if self.fail_cpu.load(Ordering::SeqCst) {
            return Err(AgentError::provider("cpu", "unavailable"));
        }
        Ok(CpuStatus {
            usage_percent: 42.5,
            per_core: vec![40.0, 45.0],
            core_count: 2,
        })
    }

    fn cpu_info(&self) -> Result<CpuInfo> {
        Ok(describe_cpu(CpuDescription {
            brand: "Test CPU 3000",
            vendor: "AuthenticAMD",
            arch: "x86_64",
            mhz: 3_000,
            threads: 2,
            physical: Some(1),
        }))
    }

    fn memory(&self) -> Result<MemoryStatus> {
        Ok(MemoryStatus {
            total_gb: 8.0,
            used_gb: 2.0,
            available_gb: 6.0,
            usage_percent: 25.0,
        })
    }

    fn disk(&self, path: &str) -> Result<DiskStatus> {
        Ok(DiskStatus {
            path: path.to_string(),
            total_gb: 100.0,
            used_gb: 40.0,
            free_gb: 60.0,
            usage_percent: 40.0,
            filesystem: "ext4".into(),
        })
    }

    fn partitions(&self) -> Result<Vec<DiskStatus>> {
        Ok(vec![self.disk("/")?, self.disk("/boot")?])
    }

    fn network(&self) -> Result<Vec<NetworkStatus>> {
        Ok(vec![
            NetworkStatus {
                interface: "eth0".into(),
                bytes_sent: 1_000,
                bytes_recv: 2_000,
                ..Default::default()
            },
            NetworkStatus {
                interface: "lo".into(),
                bytes_sent: 10,
                bytes_recv: 10,
                ..Default::default()
            },
        ])
    }

    fn top_directories(&self, limit: usize) -> Result<Vec<DirectoryInfo>> {
        Ok((0..limit.min(3))
            .map(|i| DirectoryInfo {
                path: format!("/home/test/d{i}"),
                size_gb: 3.0 - i as f64,
                size: format!("{}.0 GB", 3 - i),
            })
            .collect())
    }
}

pub struct FixedProcesses;

impl ProcessSource for FixedProcesses {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn collect(&mut self) -> Result<Vec<ProcessStatus>> {
        let p = |pid: u32, name: &str, cpu: f64, mem: f64| ProcessStatus {
            pid,
            name: name.into(),
            cpu_percent: cpu,
            mem_percent: mem,
            status: "running".into(),
        };
        Ok(vec![
            p(10, "idle", 0.1, 0.1),
            p(11, "db", 30.0, 20.0),
            p(12, "web", 40.0, 10.0),
            p(13, "cron", 1.0, 0.5),
        ])
    }
}

pub fn config(extra: &[&str]) -> Config {
    use clap::Parser;
    let mut argv = vec!["chowkidar_agent"];
    argv.extend_from_slice(extra);
    Config::try_parse_from(argv).expect("valid test config")
}

pub fn authority() -> TokenAuthority {
    TokenAuthority::new(SECRET, std::time::Duration::from_secs(3600), "test-host")
}

pub fn start(provider: Arc<StaticProvider>, extra: &[&str]) -> (AppState, String) {
    let cfg = config(extra);
    let token = authority().issue().expect("token");
    let state = chowkidar_agent::start(&cfg, provider, Box::new(FixedProcesses), authority());
    (state, token)
}
