use std::{sync::Arc, time::Duration};

use tokio::sync::{broadcast, watch};
use tracing::info;
use warden_process::{ProcessState, ProcessStatus, ServerInfos, StateChange};

use super::handle::{ProcessHandle, ServerInputs, SupervisionConfig};
use crate::{
    notify::{NotificationDispatcher, Notifier},
    os_process::OsProcess,
    query::QueryClient,
    rcon::RconClient,
};

pub const DEFAULT_SHUTDOWN_COMMAND: &str = "shutdown";

/// A supervised game server: the process state machine plus its query and
/// remote-console clients and the edge-triggered notifications.
///
/// Without a [`QueryClient`] the server never reaches `Online`; without an
/// [`RconClient`] the shutdown ladder starts at the close request.
pub struct ServerProcessHandle {
    core: ProcessHandle,
    infos: ServerInfos,
    query: Option<QueryClient>,
    rcon: Option<Arc<RconClient>>,
    notifications: NotificationDispatcher,
    shutdown_command: String,
}

impl std::fmt::Debug for ServerProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerProcessHandle")
            .field("core", &self.core)
            .field("infos", &self.infos)
            .field("query", &self.query.as_ref().map(QueryClient::addr))
            .field("rcon", &self.rcon.as_ref().map(|r| r.addr()))
            .finish_non_exhaustive()
    }
}

impl ServerProcessHandle {
    pub fn new(process: Arc<dyn OsProcess>, infos: ServerInfos, config: SupervisionConfig) -> Self {
        Self {
            core: ProcessHandle::build(process, Some(infos.instance), config),
            infos,
            query: None,
            rcon: None,
            notifications: NotificationDispatcher::new(Vec::new()),
            shutdown_command: DEFAULT_SHUTDOWN_COMMAND.to_string(),
        }
    }

    pub fn with_query(mut self, query: QueryClient) -> Self {
        self.query = Some(query);
        self
    }

    pub fn with_rcon(mut self, rcon: Arc<RconClient>) -> Self {
        self.rcon = Some(rcon);
        self
    }

    pub fn with_notifiers(mut self, notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        self.notifications = NotificationDispatcher::new(notifiers);
        self
    }

    pub fn with_shutdown_command(mut self, command: impl Into<String>) -> Self {
        self.shutdown_command = command.into();
        self
    }

    pub fn instance(&self) -> u32 {
        self.infos.instance
    }

    pub fn infos(&self) -> &ServerInfos {
        &self.infos
    }

    pub fn process(&self) -> &ProcessHandle {
        &self.core
    }

    pub fn rcon(&self) -> Option<&Arc<RconClient>> {
        self.rcon.as_ref()
    }

    pub fn notifications(&self) -> &NotificationDispatcher {
        &self.notifications
    }

    pub fn pid(&self) -> u32 {
        self.core.pid()
    }

    pub fn state(&self) -> ProcessState {
        self.core.state()
    }

    pub fn status(&self) -> ProcessStatus {
        self.core.status()
    }

    pub fn online(&self) -> bool {
        self.core.status().online
    }

    pub fn players(&self) -> u32 {
        self.core.status().players
    }

    pub fn max_players(&self) -> u32 {
        self.core.status().max_players
    }

    pub fn is_active(&self) -> bool {
        self.core.is_active()
    }

    pub fn watch(&self) -> watch::Receiver<ProcessStatus> {
        self.core.watch()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.core.subscribe()
    }

    pub async fn memory_usage(&self) -> u64 {
        self.core.memory_usage().await
    }

    pub async fn cpu_time(&self) -> Duration {
        self.core.cpu_time().await
    }

    pub async fn refresh(&self) -> ProcessState {
        let changes = self.core.refresh_with(self.inputs()).await;
        self.notify(&changes);
        self.state()
    }

    pub async fn stop(&self) {
        let changes = self
            .core
            .shutdown_with(ProcessState::Stopping, self.inputs())
            .await;
        self.notify(&changes);
    }

    pub async fn restart(&self) {
        let changes = self
            .core
            .shutdown_with(ProcessState::Restarting, self.inputs())
            .await;
        self.notify(&changes);
    }

    pub async fn kill(&self) {
        let changes = self.core.kill_with().await;
        self.notify(&changes);
    }

    /// Stops the background query loop and drops the RCON session.
    pub async fn detach(&self) {
        if let Some(q) = &self.query {
            q.stop();
        }
        if let Some(r) = &self.rcon {
            r.close().await;
        }
    }

    fn inputs(&self) -> ServerInputs<'_> {
        ServerInputs {
            rcon: self.rcon.as_deref(),
            shutdown_command: &self.shutdown_command,
            query: self.query.as_ref().map(QueryClient::snapshot),
        }
    }

    fn notify(&self, changes: &[StateChange]) {
        for change in changes {
            if let Some(n) = self.notifications.on_transition(change, &self.infos) {
                info!(instance = n.instance, kind = ?n.kind, "dispatching notification");
                self.notifications.dispatch(n);
            }
        }
    }
}
