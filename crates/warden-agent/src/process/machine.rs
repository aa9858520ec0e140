use std::time::Duration;

use tokio::time::Instant;
use warden_process::ProcessState;

use crate::os_process::Liveness;

/// Inputs gathered by one refresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Observation {
    pub liveness: Liveness,
    /// The query protocol currently reports the server as online.
    pub online: bool,
}

/// Side effect the handle must carry out after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Effect {
    None,
    KillZombie,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Step {
    pub next: Option<ProcessState>,
    pub effect: Effect,
}

impl Step {
    const IDLE: Step = Step {
        next: None,
        effect: Effect::None,
    };

    fn to(next: ProcessState) -> Self {
        Self {
            next: Some(next),
            effect: Effect::None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ZombiePolicy {
    pub kill_zombies: bool,
    pub zombie_check: Duration,
}

/// Pure transition table. Knows nothing about I/O; the handle feeds it
/// observations and applies the returned step.
#[derive(Debug)]
pub(crate) struct Machine {
    state: ProcessState,
    frozen_since: Option<Instant>,
    retired: bool,
}

impl Machine {
    pub fn new() -> Self {
        Self {
            state: ProcessState::New,
            frozen_since: None,
            retired: false,
        }
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Set after `Restarting -> New`; the relaunch gets a fresh handle.
    pub fn is_retired(&self) -> bool {
        self.retired
    }

    /// Moves along one edge of the graph. Illegal edges are refused.
    pub fn apply(&mut self, next: ProcessState, now: Instant) -> bool {
        if self.retired || !self.state.can_transition_to(next) {
            return false;
        }
        if self.state == ProcessState::Restarting && next == ProcessState::New {
            self.retired = true;
        }
        self.frozen_since = (next == ProcessState::Frozen).then_some(now);
        self.state = next;
        true
    }

    pub fn step(&self, obs: Observation, now: Instant, policy: ZombiePolicy) -> Step {
        use ProcessState::*;

        if self.retired {
            return Step::IDLE;
        }

        match (self.state, obs.liveness) {
            (New, Liveness::Alive { .. }) => Step::to(Running),
            (New, Liveness::Gone) => Step::to(Failed),
            (Failed, _) => Step::to(Crashed),

            (Running | Online | Frozen, Liveness::Gone) => Step::to(Crashed),

            (Running | Online, Liveness::Alive { responding: false }) => Step::to(Frozen),
            (Running, Liveness::Alive { responding: true }) if obs.online => Step::to(Online),
            (Running | Online, Liveness::Alive { responding: true }) => Step::IDLE,

            (Frozen, Liveness::Alive { responding: true }) => Step::to(Running),
            (Frozen, Liveness::Alive { responding: false }) => {
                let since = self.frozen_since.unwrap_or(now);
                if now.saturating_duration_since(since) <= policy.zombie_check {
                    return Step::IDLE;
                }
                Step {
                    next: Some(Crashed),
                    effect: if policy.kill_zombies {
                        Effect::KillZombie
                    } else {
                        Effect::None
                    },
                }
            }

            (Stopping, Liveness::Gone) => Step::to(Stopped),
            (Restarting, Liveness::Gone) => Step::to(New),
            (Stopping | Restarting, Liveness::Alive { .. }) => Step {
                next: None,
                effect: Effect::Shutdown,
            },

            (Stopped | Crashed, _) => Step::IDLE,
        }
    }
}
