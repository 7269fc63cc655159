use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub used: f64,
    pub total: f64,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub cpu: f64,
    pub ram: ResourceUsage,
    pub disk: ResourceUsage,
    pub uptime: String,
    pub load_average: [f64; 3],
}

impl Metrics {
    /// Zeroed metrics carrying a placeholder uptime label.
    pub fn placeholder(uptime: &str) -> Self {
        Self {
            cpu: 0.0,
            ram: ResourceUsage::default(),
            disk: ResourceUsage::default(),
            uptime: uptime.to_string(),
            load_average: [0.0; 3],
        }
    }

    pub fn peak_percentage(&self) -> f64 {
        self.cpu.max(self.ram.percentage).max(self.disk.percentage)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::placeholder("-")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    UfwBlock,
    SshAttempt,
    AuthFailure,
    PortScan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: SecurityEventType,
    pub message: String,
    /// Capture time of the poll, not the time written in the log line.
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    pub pid: u32,
    pub name: String,
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub user: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandLog {
    pub id: String,
    pub command: String,
    pub output: String,
    pub timestamp: DateTime<Utc>,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Online,
    Offline,
    Warning,
    Unknown,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerStatus::Online => write!(f, "online"),
            ServerStatus::Offline => write!(f, "offline"),
            ServerStatus::Warning => write!(f, "warning"),
            ServerStatus::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Attempting,
    Success,
    HandshakeFailed,
    Disconnected,
    Error,
}

/// Why a collection attempt ended with the host reported offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OfflineReason {
    /// The SSH handshake or authentication was rejected.
    Handshake,
    #[default]
    Unreachable,
}

/// Everything gathered from one successful SSH session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostSnapshot {
    pub metrics: Metrics,
    pub os: String,
    pub kernel: String,
    pub security_events: Vec<SecurityEvent>,
    pub processes: Vec<Process>,
    pub command_logs: Vec<CommandLog>,
}

/// Outcome of a single executor call. Offline is data, not an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum MonitorResponse {
    Online(HostSnapshot),
    Offline {
        error: String,
        #[serde(skip)]
        reason: OfflineReason,
    },
}

impl MonitorResponse {
    pub fn offline(error: impl Into<String>, reason: OfflineReason) -> Self {
        MonitorResponse::Offline {
            error: error.into(),
            reason,
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, MonitorResponse::Online(_))
    }
}

/// Result of the lightweight reachability check.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum HealthResponse {
    Online {
        #[serde(skip_serializing_if = "Option::is_none")]
        ip: Option<String>,
        uptime: String,
    },
    Offline {
        error: String,
    },
}

/// Live, poll-refreshed view of one host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerState {
    pub status: ServerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_status: Option<ConnectionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_error: Option<String>,
    pub os: String,
    pub kernel: String,
    pub metrics: Metrics,
    pub security_events: Vec<SecurityEvent>,
    pub processes: Vec<Process>,
    pub command_logs: Vec<CommandLog>,
    pub last_updated: DateTime<Utc>,
}

impl ServerState {
    pub fn unknown() -> Self {
        Self {
            status: ServerStatus::Unknown,
            connection_status: None,
            connection_error: None,
            os: "Unknown".to_string(),
            kernel: "Unknown".to_string(),
            metrics: Metrics::default(),
            security_events: Vec::new(),
            processes: Vec::new(),
            command_logs: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    /// Transitional view shown while a manual refresh is running.
    pub fn resyncing() -> Self {
        Self {
            connection_status: Some(ConnectionStatus::Attempting),
            metrics: Metrics::placeholder("Resyncing..."),
            ..Self::unknown()
        }
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::unknown()
    }
}
