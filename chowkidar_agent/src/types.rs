//! Data types sent to clients over REST and WebSocket.
//! Keep this module minimal and stable. It defines the wire format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CpuStatus {
    pub usage_percent: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub per_core: Vec<f64>,
    pub core_count: usize,
}

/// Static processor description; read once per process lifetime.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CpuInfo {
    pub model_name: String,
    pub vendor_id: String,
    pub architecture: String,
    /// Physical cores; falls back to `threads` when the OS does not say.
    pub cores: usize,
    pub threads: usize,
    /// "3.60 GHz", or "Unknown" when the OS reports no frequency.
    pub max_frequency: String,
    pub is_arm: bool,
    pub is_x86: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MemoryStatus {
    pub total_gb: f64,
    pub used_gb: f64,
    pub available_gb: f64,
    pub usage_percent: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DiskStatus {
    pub path: String,
    pub total_gb: f64,
    pub used_gb: f64,
    pub free_gb: f64,
    pub usage_percent: f64,
    pub filesystem: String,
}

/// Cumulative counters for one interface since it came up.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct NetworkStatus {
    pub interface: String,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub errors_in: u64,
    pub errors_out: u64,
    pub drops_in: u64,
    pub drops_out: u64,
    pub bytes_sent_gb: f64,
    pub bytes_recv_gb: f64,
}

/// Counters summed over every interface, plus throughput in bytes/sec.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct AggregatedNetworkStatus {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub bytes_sent_rate: f64,
    pub bytes_recv_rate: f64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub errors_in: u64,
    pub errors_out: u64,
    pub drops_in: u64,
    pub drops_out: u64,
    pub interfaces: Vec<NetworkStatus>,
}

impl AggregatedNetworkStatus {
    /// Sums per-interface counters. Rates are left at zero for the caller to fill.
    pub fn from_interfaces(interfaces: Vec<NetworkStatus>) -> Self {
        let mut agg = AggregatedNetworkStatus::default();
        for i in &interfaces {
            agg.bytes_sent = agg.bytes_sent.saturating_add(i.bytes_sent);
            agg.bytes_recv = agg.bytes_recv.saturating_add(i.bytes_recv);
            agg.packets_sent = agg.packets_sent.saturating_add(i.packets_sent);
            agg.packets_recv = agg.packets_recv.saturating_add(i.packets_recv);
            agg.errors_in = agg.errors_in.saturating_add(i.errors_in);
            agg.errors_out = agg.errors_out.saturating_add(i.errors_out);
            agg.drops_in = agg.drops_in.saturating_add(i.drops_in);
            agg.drops_out = agg.drops_out.saturating_add(i.drops_out);
        }
        agg.interfaces = interfaces;
        agg
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DirectoryInfo {
    pub path: String,
    pub size_gb: f64,
    /// Human-readable, e.g. "12.5 GB".
    pub size: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ProcessStatus {
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub status: String,
}

// ---------- history samples ----------

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CpuSample {
    pub timestamp: DateTime<Utc>,
    pub usage: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub per_core: Vec<f64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MemorySample {
    pub timestamp: DateTime<Utc>,
    pub used_gb: f64,
    pub available_gb: f64,
    pub usage_percent: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DiskSample {
    pub timestamp: DateTime<Utc>,
    pub used_gb: f64,
    pub total_gb: f64,
    pub usage_percent: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct NetworkSample {
    pub timestamp: DateTime<Utc>,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub bytes_sent_rate: f64,
    pub bytes_recv_rate: f64,
}

/// All four history series over one window, oldest first.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct HistoryWindow {
    pub cpu: Vec<CpuSample>,
    pub memory: Vec<MemorySample>,
    pub disk: Vec<DiskSample>,
    pub network: Vec<NetworkSample>,
}

// ---------- push channel ----------

/// Real-time stats pushed on every hub tick. A kind whose read failed is null.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StatsPayload {
    pub cpu: Option<CpuStatus>,
    pub memory: Option<MemoryStatus>,
    pub disk: Option<DiskStatus>,
    pub network: Option<AggregatedNetworkStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub processes: Vec<ProcessStatus>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AuthAccepted {
    pub server: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AuthRejected {
    pub error: String,
}

/// Frames exchanged on `/ws`, tagged by `type`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    Stats {
        timestamp: DateTime<Utc>,
        data: StatsPayload,
    },
    Auth {
        #[serde(default)]
        token: String,
    },
    AuthSuccess {
        timestamp: DateTime<Utc>,
        data: AuthAccepted,
    },
    AuthError {
        timestamp: DateTime<Utc>,
        data: AuthRejected,
    },
    Ping,
    Pong,
    Subscribe,
    Unsubscribe,
    Error {
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_sums_every_interface() {
        let agg = AggregatedNetworkStatus::from_interfaces(vec![
            NetworkStatus {
                interface: "eth0".into(),
                bytes_sent: 100,
                bytes_recv: 200,
                drops_in: 1,
                ..Default::default()
            },
            NetworkStatus {
                interface: "lo".into(),
                bytes_sent: 5,
                bytes_recv: 5,
                drops_in: 2,
                ..Default::default()
            },
        ]);
        assert_eq!(agg.bytes_sent, 105);
        assert_eq!(agg.bytes_recv, 205);
        assert_eq!(agg.drops_in, 3);
        assert_eq!(agg.interfaces.len(), 2);
        assert_eq!(agg.bytes_sent_rate, 0.0);
    }

    #[test]
    fn ws_frames_are_tagged_by_type() {
        let ping: WsMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(ping, WsMessage::Ping);

        let auth: WsMessage = serde_json::from_str(r#"{"type":"auth","token":"abc"}"#).unwrap();
        assert_eq!(
            auth,
            WsMessage::Auth {
                token: "abc".into()
            }
        );

        let js = serde_json::to_value(WsMessage::AuthError {
            timestamp: Utc::now(),
            data: AuthRejected {
                error: "invalid token".into(),
            },
        })
        .unwrap();
        assert_eq!(js["type"], "auth_error");
        assert_eq!(js["data"]["error"], "invalid token");
        assert!(js["timestamp"].is_string());

        let js = serde_json::to_value(WsMessage::AuthSuccess {
            timestamp: Utc::now(),
            data: AuthAccepted {
                server: "box".into(),
            },
        })
        .unwrap();
        assert_eq!(js["data"]["server"], "box");

        assert!(serde_json::from_str::<WsMessage>(r#"{"type":"reboot"}"#).is_err());
    }
}
