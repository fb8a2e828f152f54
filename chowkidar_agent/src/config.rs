//! Command line and environment configuration.

use std::time::Duration;

use clap::Parser;

use crate::hub::HubConfig;
use crate::security::DEFAULT_ORIGINS;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "chowkidar_agent",
    about = "Host metrics agent: REST snapshots, rolling history and WebSocket push",
    version
)]
pub struct Config {
    /// Full listen address (host:port). Overrides --host/--port.
    #[arg(long, env = "CHOWKIDAR_BIND_ADDR")]
    pub bind_addr: Option<String>,

    /// Listen host.
    #[arg(long, default_value = "127.0.0.1", env = "CHOWKIDAR_HOST")]
    pub host: String,

    /// Listen port.
    #[arg(short, long, default_value_t = 8080, env = "CHOWKIDAR_PORT")]
    pub port: u16,

    /// Print a freshly signed access token and exit.
    #[arg(long)]
    pub print_token: bool,

    /// HMAC secret for tokens. Defaults to a key persisted in ~/.chowkidar-secret-key.
    #[arg(long, env = "CHOWKIDAR_SECRET_KEY", hide_env_values = true)]
    pub secret_key: Option<String>,

    /// Token lifetime in hours.
    #[arg(long, default_value_t = 168, env = "CHOWKIDAR_TOKEN_TTL_HOURS")]
    pub token_ttl_hours: u64,

    /// Name embedded in tokens and reported to clients.
    #[arg(long, default_value = "chowkidar-agent", env = "CHOWKIDAR_SERVER_NAME")]
    pub server_name: String,

    /// Freshness of cached cpu/memory/disk/network readings.
    #[arg(long, default_value_t = 1000, env = "CHOWKIDAR_CACHE_TTL_MS")]
    pub cache_ttl_ms: u64,

    /// Freshness of the directory size ranking.
    #[arg(long, default_value_t = 30, env = "CHOWKIDAR_DIR_CACHE_TTL_SECS")]
    pub dir_cache_ttl_secs: u64,

    #[arg(long, default_value_t = 60, env = "CHOWKIDAR_HISTORY_INTERVAL_SECS")]
    pub history_interval_secs: u64,

    /// Samples retained per history series.
    #[arg(long, default_value_t = 60, env = "CHOWKIDAR_HISTORY_CAPACITY")]
    pub history_capacity: usize,

    #[arg(long, default_value_t = 1000, env = "CHOWKIDAR_PROCESS_INTERVAL_MS")]
    pub process_interval_ms: u64,

    /// Processes kept per ranking pass.
    #[arg(long, default_value_t = 20, env = "CHOWKIDAR_PROCESS_LIMIT")]
    pub process_limit: usize,

    /// Interval between WebSocket stats pushes.
    #[arg(long, default_value_t = 1000, env = "CHOWKIDAR_HUB_TICK_MS")]
    pub hub_tick_ms: u64,

    /// Outbound frames buffered per WebSocket client before drops.
    #[arg(long, default_value_t = 256, env = "CHOWKIDAR_CLIENT_QUEUE")]
    pub client_queue: usize,

    /// Requests per second allowed per client IP.
    #[arg(long, default_value_t = 100.0, env = "CHOWKIDAR_RATE_LIMIT_RPS")]
    pub rate_limit_rps: f64,

    #[arg(long, default_value_t = 200, env = "CHOWKIDAR_RATE_LIMIT_BURST")]
    pub rate_limit_burst: u32,

    /// Client IPs tracked by each rate limiter.
    #[arg(long, default_value_t = 10_000, env = "CHOWKIDAR_RATE_LIMIT_MAX_CLIENTS")]
    pub rate_limit_max_clients: usize,

    /// Extra browser origins allowed by CORS, comma separated. Host-only entries
    /// (`dash.example:9000`) match any scheme.
    #[arg(long, env = "CHOWKIDAR_ALLOWED_ORIGINS", value_delimiter = ',')]
    pub allowed_origins: Vec<String>,

    /// Log filter when RUST_LOG is unset, e.g. "info" or "chowkidar_agent=debug".
    #[arg(long, default_value = "info", env = "CHOWKIDAR_LOG")]
    pub log_level: String,
}

impl Config {
    /// `--bind-addr` if given, else `host:port`.
    pub fn bind_address(&self) -> String {
        match self.bind_addr.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(addr) => addr.to_string(),
            None if self.host.contains(':') && !self.host.starts_with('[') => {
                format!("[{}]:{}", self.host, self.port)
            }
            None => format!("{}:{}", self.host, self.port),
        }
    }

    /// Address to show in the startup banner; wildcard hosts read as localhost.
    pub fn display_address(&self) -> String {
        let bind = self.bind_address();
        let (host, port) = match bind.rsplit_once(':') {
            Some((h, p)) => (h.trim_start_matches('[').trim_end_matches(']'), p),
            None => (bind.as_str(), ""),
        };
        let host = match host {
            "0.0.0.0" | "::" | "" => "localhost",
            h => h,
        };
        if port.is_empty() {
            host.to_string()
        } else {
            format!("{host}:{port}")
        }
    }

    /// Local defaults, the agent's own address, then `--allowed-origins`.
    pub fn cors_origins(&self) -> Vec<String> {
        DEFAULT_ORIGINS
            .iter()
            .map(|o| o.to_string())
            .chain(std::iter::once(format!("http://{}", self.display_address())))
            .chain(self.allowed_origins.iter().map(|o| o.trim().to_string()))
            .filter(|o| !o.is_empty())
            .collect()
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_hours.saturating_mul(3600))
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn dir_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.dir_cache_ttl_secs)
    }

    pub fn history_interval(&self) -> Duration {
        Duration::from_secs(self.history_interval_secs.max(1))
    }

    pub fn process_interval(&self) -> Duration {
        Duration::from_millis(self.process_interval_ms.max(1))
    }

    pub fn hub(&self) -> HubConfig {
        HubConfig {
            tick: Duration::from_millis(self.hub_tick_ms.max(1)),
            queue: self.client_queue.max(1),
            ..HubConfig::default()
        }
    }
}
