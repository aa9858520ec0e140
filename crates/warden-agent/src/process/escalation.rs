use std::time::Duration;

use tokio::time::Instant;

pub(crate) const DEFAULT_SHUTDOWN_COOLDOWN: Duration = Duration::from_secs(180);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rung {
    Rcon,
    CloseWindow,
    Kill,
}

/// Graceful-shutdown ladder: RCON `shutdown`, then a close request, then kill.
///
/// Each rung is latched once tried so it is not repeated within an episode, and
/// attempts are spaced by at least `cooldown`. When every rung has been tried the
/// latches clear and the next attempt starts again from the top.
#[derive(Debug)]
pub(crate) struct ShutdownLadder {
    cooldown: Duration,
    last_attempt: Option<Instant>,
    rcon_tried: bool,
    close_tried: bool,
    kill_tried: bool,
}

impl ShutdownLadder {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_attempt: None,
            rcon_tried: false,
            close_tried: false,
            kill_tried: false,
        }
    }

    /// A new stop/restart request. The cool-down clock is kept.
    pub fn begin_episode(&mut self) {
        self.rcon_tried = false;
        self.close_tried = false;
        self.kill_tried = false;
    }

    /// Returns false while the previous attempt is within the cool-down.
    pub fn begin_attempt(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_attempt
            && now.saturating_duration_since(last) < self.cooldown
        {
            return false;
        }
        if self.rcon_tried && self.close_tried && self.kill_tried {
            self.begin_episode();
        }
        self.last_attempt = Some(now);
        true
    }

    /// Latches and returns the next untried rung.
    pub fn next_rung(&mut self, has_rcon: bool) -> Option<Rung> {
        if has_rcon && !self.rcon_tried {
            self.rcon_tried = true;
            return Some(Rung::Rcon);
        }
        if !self.close_tried {
            self.close_tried = true;
            return Some(Rung::CloseWindow);
        }
        if !self.kill_tried {
            self.kill_tried = true;
            return Some(Rung::Kill);
        }
        None
    }

    pub fn kill_tried(&self) -> bool {
        self.kill_tried
    }

    /// Records an out-of-band kill so the ladder neither repeats it nor fires
    /// again before the cool-down.
    pub fn mark_killed(&mut self, now: Instant) {
        self.kill_tried = true;
        self.last_attempt = Some(now);
    }
}
