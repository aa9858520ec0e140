use std::{sync::Arc, time::Duration};

use futures_util::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use super::{SequenceLogger, TracingLogger};
use crate::{backup::BackupManager, launcher::Launcher};

/// Host callback for `MainAction`: receives the instance and the run's token.
pub type MainActionFn =
    Arc<dyn Fn(u32, CancellationToken) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Execution context shared by every action of one run.
#[derive(Clone)]
pub struct SequenceArgs {
    cancel: CancellationToken,
    reason: String,
    instance: u32,
    launcher: Arc<dyn Launcher>,
    backups: Option<Arc<dyn BackupManager>>,
    logger: Arc<dyn SequenceLogger>,
    main_action: Option<MainActionFn>,
    poll_interval: Duration,
}

impl std::fmt::Debug for SequenceArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceArgs")
            .field("instance", &self.instance)
            .field("reason", &self.reason)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("has_backups", &self.backups.is_some())
            .field("has_main_action", &self.main_action.is_some())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl SequenceArgs {
    pub fn builder(instance: u32, launcher: Arc<dyn Launcher>) -> SequenceArgsBuilder {
        SequenceArgsBuilder {
            args: SequenceArgs {
                cancel: CancellationToken::new(),
                reason: String::new(),
                instance,
                launcher,
                backups: None,
                logger: Arc::new(TracingLogger),
                main_action: None,
                poll_interval: DEFAULT_POLL_INTERVAL,
            },
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn instance(&self) -> u32 {
        self.instance
    }

    pub fn launcher(&self) -> &dyn Launcher {
        self.launcher.as_ref()
    }

    pub fn backups(&self) -> Option<&dyn BackupManager> {
        self.backups.as_deref()
    }

    pub fn logger(&self) -> &dyn SequenceLogger {
        self.logger.as_ref()
    }

    pub fn main_action(&self) -> Option<&MainActionFn> {
        self.main_action.as_ref()
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub(crate) fn set_cancel_token(&mut self, token: CancellationToken) {
        self.cancel = token;
    }

    /// Expands `{instance}` and `{reason}`.
    pub(crate) fn render(&self, template: &str) -> String {
        template
            .replace("{instance}", &self.instance.to_string())
            .replace("{reason}", &self.reason)
    }
}

pub struct SequenceArgsBuilder {
    args: SequenceArgs,
}

impl SequenceArgsBuilder {
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.args.reason = reason.into();
        self
    }

    pub fn backups(mut self, backups: Arc<dyn BackupManager>) -> Self {
        self.args.backups = Some(backups);
        self
    }

    pub fn logger(mut self, logger: Arc<dyn SequenceLogger>) -> Self {
        self.args.logger = logger;
        self
    }

    pub fn main_action<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(u32, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let action: MainActionFn = Arc::new(
            move |instance, token| -> BoxFuture<'static, anyhow::Result<()>> {
                Box::pin(f(instance, token))
            },
        );
        self.args.main_action = Some(action);
        self
    }

    pub fn poll_interval(mut self, every: Duration) -> Self {
        self.args.poll_interval = every.max(Duration::from_millis(10));
        self
    }

    pub fn build(self) -> SequenceArgs {
        self.args
    }
}
