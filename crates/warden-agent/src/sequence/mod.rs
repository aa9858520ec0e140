//! Data-driven automation: an ordered list of actions run against one instance.

mod action;
mod args;
mod runner;

pub use action::SequenceAction;
pub use args::{MainActionFn, SequenceArgs, SequenceArgsBuilder};
pub use runner::{NoProgress, ProgressSink, SequenceRunner};

use tracing::{error, warn};

use crate::support::format_error_chain;

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Sequence {
    pub name: String,
    #[serde(default)]
    pub actions: Vec<SequenceAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SequenceError {
    /// The run was aborted, either externally or by an action's failure policy.
    #[error("sequence cancelled: {reason}")]
    Cancelled { reason: String },
}

impl SequenceError {
    pub(crate) fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }
}

/// Structured log sink handed to sequence actions.
pub trait SequenceLogger: Send + Sync {
    fn error(&self, instance: u32, message: &str, err: Option<&anyhow::Error>);
    fn warning(&self, instance: u32, message: &str, err: Option<&anyhow::Error>);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl SequenceLogger for TracingLogger {
    fn error(&self, instance: u32, message: &str, err: Option<&anyhow::Error>) {
        match err {
            Some(e) => error!(instance, error = %format_error_chain(e), "{message}"),
            None => error!(instance, "{message}"),
        }
    }

    fn warning(&self, instance: u32, message: &str, err: Option<&anyhow::Error>) {
        match err {
            Some(e) => warn!(instance, error = %format_error_chain(e), "{message}"),
            None => warn!(instance, "{message}"),
        }
    }
}
