use specta::Type;

/// Lifecycle of the managed game-server process.
///
/// A live process handle exists iff the state is `Starting`, `Online` or `Stopping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    Offline,
    Starting,
    Online,
    Stopping,
}

impl ServerState {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerState::Offline => "offline",
            ServerState::Starting => "starting",
            ServerState::Online => "online",
            ServerState::Stopping => "stopping",
        }
    }

    pub fn is_active(self) -> bool {
        !matches!(self, ServerState::Offline)
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum TunnelState {
    NotInstalled,
    Idle,
    Running,
}

impl TunnelState {
    pub fn as_str(self) -> &'static str {
        match self {
            TunnelState::NotInstalled => "not_installed",
            TunnelState::Idle => "idle",
            TunnelState::Running => "running",
        }
    }
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "lowercase")]
pub enum LogCategory {
    Info,
    Warn,
    Error,
    Success,
    Player,
    World,
}

impl LogCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            LogCategory::Info => "info",
            LogCategory::Warn => "warn",
            LogCategory::Error => "error",
            LogCategory::Success => "success",
            LogCategory::Player => "player",
            LogCategory::World => "world",
        }
    }
}

impl std::fmt::Display for LogCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

/// One classified console line. `seq` is strictly increasing per buffer.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub seq: u64,
    pub timestamp_unix_ms: u64,
    pub category: LogCategory,
    pub message: String,
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStatus {
    pub state: TunnelState,
    pub java_address: Option<String>,
    pub bedrock_address: Option<String>,
    pub setup_url: Option<String>,
    pub approved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub state: ServerState,
    pub ready: bool,
    pub pid: Option<u32>,
    pub started_at_unix_ms: Option<u64>,
    pub uptime_secs: Option<u64>,
    pub last_exit_code: Option<i32>,
    pub tunnel: TunnelStatus,
}
