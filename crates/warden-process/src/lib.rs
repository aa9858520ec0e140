use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};

/// Health state of a supervised OS process.
///
/// Transitions are restricted to the graph encoded in [`ProcessState::can_transition_to`];
/// `Stopped` and `Crashed` are terminal for the lifetime of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    New,
    Running,
    Online,
    Frozen,
    Stopping,
    Stopped,
    Restarting,
    Failed,
    Crashed,
}

impl ProcessState {
    pub const ALL: [ProcessState; 9] = [
        ProcessState::New,
        ProcessState::Running,
        ProcessState::Online,
        ProcessState::Frozen,
        ProcessState::Stopping,
        ProcessState::Stopped,
        ProcessState::Restarting,
        ProcessState::Failed,
        ProcessState::Crashed,
    ];

    /// The process is up and owned by the state machine (not being shut down).
    pub fn is_running(self) -> bool {
        matches!(
            self,
            ProcessState::Running | ProcessState::Online | ProcessState::Frozen
        )
    }

    pub fn is_shutting_down(self) -> bool {
        matches!(self, ProcessState::Stopping | ProcessState::Restarting)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Crashed)
    }

    pub fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;

        match (self, next) {
            (New, Running) => true,
            // Gone before it was ever confirmed alive.
            (New, Failed) => true,

            (Running, Online | Frozen | Crashed) => true,
            (Online, Frozen | Crashed) => true,
            (Frozen, Running | Crashed) => true,

            (Running | Online | Frozen, Stopping | Restarting) => true,
            (Stopping, Stopped) => true,
            (Restarting, New) => true,

            (Failed, Crashed) => true,

            _ => false,
        }
    }

    pub fn successors(self) -> Vec<ProcessState> {
        Self::ALL
            .into_iter()
            .filter(|s| self.can_transition_to(*s))
            .collect()
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessState::New => "new",
            ProcessState::Running => "running",
            ProcessState::Online => "online",
            ProcessState::Frozen => "frozen",
            ProcessState::Stopping => "stopping",
            ProcessState::Stopped => "stopped",
            ProcessState::Restarting => "restarting",
            ProcessState::Failed => "failed",
            ProcessState::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// Connection parameters of a server instance, captured once when its handle is built.
#[derive(Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ServerInfos {
    pub instance: u32,
    pub title: String,
    pub port: u16,
    pub query_port: u16,
    pub rcon_port: u16,
    #[serde(default, skip_serializing)]
    pub rcon_password: String,
}

impl fmt::Debug for ServerInfos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let password = if self.rcon_password.is_empty() {
            ""
        } else {
            "<redacted>"
        };
        f.debug_struct("ServerInfos")
            .field("instance", &self.instance)
            .field("title", &self.title)
            .field("port", &self.port)
            .field("query_port", &self.query_port)
            .field("rcon_port", &self.rcon_port)
            .field("rcon_password", &password)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ResourceUsage {
    pub memory_bytes: u64,
    pub cpu_time: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProcessStatus {
    pub pid: u32,
    pub instance: Option<u32>,
    pub state: ProcessState,
    pub start_utc: DateTime<Utc>,
    pub online: bool,
    pub players: u32,
    pub max_players: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StateChange {
    pub pid: u32,
    pub instance: Option<u32>,
    pub from: ProcessState,
    pub to: ProcessState,
    pub at: DateTime<Utc>,
}
