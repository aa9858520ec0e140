use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::{
    sync::{Mutex, broadcast, watch},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warden_process::{ProcessState, ProcessStatus, ResourceUsage, StateChange};

use super::{
    escalation::{DEFAULT_SHUTDOWN_COOLDOWN, Rung, ShutdownLadder},
    machine::{Effect, Machine, Observation, ZombiePolicy},
};
use crate::{
    os_process::OsProcess, query::QuerySnapshot, rcon::RconClient, support::format_error_chain,
};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy)]
pub struct SupervisionConfig {
    /// Force-terminate a process declared a zombie.
    pub kill_zombies: bool,
    /// How long `Frozen` may persist before the process is declared crashed.
    pub zombie_check: Duration,
    /// Minimum spacing between graceful-shutdown attempts.
    pub shutdown_cooldown: Duration,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            kill_zombies: false,
            zombie_check: Duration::from_secs(60),
            shutdown_cooldown: DEFAULT_SHUTDOWN_COOLDOWN,
        }
    }
}

/// Extra inputs a server handle contributes to a refresh or shutdown.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ServerInputs<'a> {
    pub rcon: Option<&'a RconClient>,
    pub shutdown_command: &'a str,
    pub query: Option<QuerySnapshot>,
}

#[derive(Debug)]
struct Supervisor {
    machine: Machine,
    ladder: ShutdownLadder,
}

/// Supervises one externally launched OS process.
///
/// The state only advances when [`ProcessHandle::refresh`] (or a stop/kill
/// request) is called; there is no background task per handle. Calls are
/// serialized by an internal lock, so each refresh applies atomically.
pub struct ProcessHandle {
    process: Arc<dyn OsProcess>,
    pid: u32,
    instance: Option<u32>,
    start_utc: DateTime<Utc>,
    config: SupervisionConfig,
    sup: Mutex<Supervisor>,
    retired: AtomicBool,
    status: watch::Sender<ProcessStatus>,
    events: broadcast::Sender<StateChange>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("instance", &self.instance)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ProcessHandle {
    pub fn new(process: Arc<dyn OsProcess>, config: SupervisionConfig) -> Self {
        Self::build(process, None, config)
    }

    pub(crate) fn build(
        process: Arc<dyn OsProcess>,
        instance: Option<u32>,
        config: SupervisionConfig,
    ) -> Self {
        let pid = process.pid();
        let start_utc = Utc::now();
        let (status, _) = watch::channel(ProcessStatus {
            pid,
            instance,
            state: ProcessState::New,
            start_utc,
            online: false,
            players: 0,
            max_players: 0,
        });
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            process,
            pid,
            instance,
            start_utc,
            config,
            sup: Mutex::new(Supervisor {
                machine: Machine::new(),
                ladder: ShutdownLadder::new(config.shutdown_cooldown),
            }),
            retired: AtomicBool::new(false),
            status,
            events,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn instance(&self) -> Option<u32> {
        self.instance
    }

    pub fn start_utc(&self) -> DateTime<Utc> {
        self.start_utc
    }

    pub fn config(&self) -> SupervisionConfig {
        self.config
    }

    pub fn status(&self) -> ProcessStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ProcessState {
        self.status.borrow().state
    }

    pub fn watch(&self) -> watch::Receiver<ProcessStatus> {
        self.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }

    /// Whether the OS process may still be running under this handle.
    pub fn is_active(&self) -> bool {
        let state = self.state();
        match state {
            ProcessState::New => !self.retired.load(Ordering::Acquire),
            _ => state.is_running() || state.is_shutting_down(),
        }
    }

    pub async fn usage(&self) -> ResourceUsage {
        self.process.usage().await
    }

    pub async fn memory_usage(&self) -> u64 {
        self.usage().await.memory_bytes
    }

    pub async fn cpu_time(&self) -> Duration {
        self.usage().await.cpu_time
    }

    pub async fn refresh(&self) -> ProcessState {
        self.refresh_with(ServerInputs::default()).await;
        self.state()
    }

    /// Graceful stop. No-op unless the process is running.
    pub async fn stop(&self) {
        self.shutdown_with(ProcessState::Stopping, ServerInputs::default())
            .await;
    }

    pub async fn restart(&self) {
        self.shutdown_with(ProcessState::Restarting, ServerInputs::default())
            .await;
    }

    /// Force-terminates without walking the shutdown ladder.
    pub async fn kill(&self) {
        self.kill_with().await;
    }

    pub(crate) async fn refresh_with(&self, inputs: ServerInputs<'_>) -> Vec<StateChange> {
        let mut sup = self.sup.lock().await;
        let mut changes = Vec::new();
        if sup.machine.is_retired() || sup.machine.state().is_terminal() {
            return changes;
        }

        if let Some(q) = inputs.query
            && !sup.machine.state().is_shutting_down()
        {
            self.status.send_modify(|s| {
                s.online = q.online;
                s.players = q.players;
                s.max_players = q.max_players;
            });
        }

        let liveness = self.process.probe().await;
        let now = Instant::now();
        let obs = Observation {
            liveness,
            online: inputs.query.is_some_and(|q| q.online),
        };
        let step = sup.machine.step(obs, now, self.zombie_policy());
        if let Some(next) = step.next {
            self.transition(&mut sup, next, &mut changes);
        }

        match step.effect {
            Effect::None => {}
            Effect::KillZombie => {
                warn!(pid = self.pid, instance = ?self.instance, "killing zombie process");
                if let Err(e) = self.process.kill().await {
                    warn!(pid = self.pid, error = %format_error_chain(&e), "zombie kill failed");
                }
            }
            Effect::Shutdown => self.escalate(&mut sup, inputs, now).await,
        }
        changes
    }

    pub(crate) async fn shutdown_with(
        &self,
        target: ProcessState,
        inputs: ServerInputs<'_>,
    ) -> Vec<StateChange> {
        let mut sup = self.sup.lock().await;
        let mut changes = Vec::new();
        if sup.machine.is_retired() {
            return changes;
        }
        if sup.machine.state() == ProcessState::New {
            self.transition(&mut sup, ProcessState::Running, &mut changes);
        }
        if !sup.machine.state().is_running() {
            debug!(pid = self.pid, state = %sup.machine.state(), %target, "shutdown request ignored");
            return changes;
        }

        self.transition(&mut sup, target, &mut changes);
        sup.ladder.begin_episode();
        self.escalate(&mut sup, inputs, Instant::now()).await;
        changes
    }

    pub(crate) async fn kill_with(&self) -> Vec<StateChange> {
        let mut sup = self.sup.lock().await;
        let mut changes = Vec::new();
        let state = sup.machine.state();
        if sup.machine.is_retired() || state.is_terminal() || state == ProcessState::Failed {
            return changes;
        }

        if state.is_shutting_down() {
            if !sup.ladder.kill_tried() {
                self.force_kill(&mut sup).await;
            }
            return changes;
        }

        if state == ProcessState::New {
            self.transition(&mut sup, ProcessState::Running, &mut changes);
        }
        sup.ladder.begin_episode();
        self.force_kill(&mut sup).await;
        self.transition(&mut sup, ProcessState::Stopping, &mut changes);
        changes
    }

    fn zombie_policy(&self) -> ZombiePolicy {
        ZombiePolicy {
            kill_zombies: self.config.kill_zombies,
            zombie_check: self.config.zombie_check,
        }
    }

    async fn force_kill(&self, sup: &mut Supervisor) {
        info!(pid = self.pid, instance = ?self.instance, "force killing process");
        if let Err(e) = self.process.kill().await {
            warn!(pid = self.pid, error = %format_error_chain(&e), "kill failed");
        }
        sup.ladder.mark_killed(Instant::now());
    }

    async fn escalate(&self, sup: &mut Supervisor, inputs: ServerInputs<'_>, now: Instant) {
        if !sup.ladder.begin_attempt(now) {
            debug!(pid = self.pid, "shutdown attempt within cool-down; skipped");
            return;
        }

        while let Some(rung) = sup.ladder.next_rung(inputs.rcon.is_some()) {
            let delivered = match rung {
                Rung::Rcon => {
                    let Some(rcon) = inputs.rcon else {
                        continue;
                    };
                    match rcon
                        .send(inputs.shutdown_command, &CancellationToken::new())
                        .await
                    {
                        Ok(_) => true,
                        Err(e) => {
                            warn!(pid = self.pid, error = %e, "rcon shutdown failed");
                            false
                        }
                    }
                }
                Rung::CloseWindow => self.process.close_main_window().await,
                Rung::Kill => match self.process.kill().await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(pid = self.pid, error = %format_error_chain(&e), "kill failed");
                        false
                    }
                },
            };
            info!(pid = self.pid, instance = ?self.instance, ?rung, delivered, "shutdown step");
            if delivered {
                return;
            }
        }
    }

    fn transition(&self, sup: &mut Supervisor, next: ProcessState, changes: &mut Vec<StateChange>) {
        let from = sup.machine.state();
        if !sup.machine.apply(next, Instant::now()) {
            debug!(pid = self.pid, %from, to = %next, "transition refused");
            return;
        }
        if sup.machine.is_retired() {
            self.retired.store(true, Ordering::Release);
        }

        info!(pid = self.pid, instance = ?self.instance, %from, to = %next, "process state changed");
        self.status.send_modify(|s| {
            s.state = next;
            if !next.is_running() {
                s.online = false;
                s.players = 0;
                s.max_players = 0;
            }
        });

        let change = StateChange {
            pid: self.pid,
            instance: self.instance,
            from,
            to: next,
            at: Utc::now(),
        };
        // No subscribers is fine.
        let _ = self.events.send(change.clone());
        changes.push(change);
    }
}
