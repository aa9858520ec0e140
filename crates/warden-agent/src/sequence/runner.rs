use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::{Sequence, SequenceArgs, SequenceError};

/// Receives `(instance, completed, total)` after every action and `(instance, 0, 0)`
/// when the run ends.
pub trait ProgressSink: Send + Sync {
    fn report(&self, instance: u32, completed: usize, total: usize);
}

impl<F> ProgressSink for F
where
    F: Fn(u32, usize, usize) + Send + Sync,
{
    fn report(&self, instance: u32, completed: usize, total: usize) {
        self(instance, completed, total)
    }
}

/// Discards progress reports.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _instance: u32, _completed: usize, _total: usize) {}
}

/// Executes one [`Sequence`] strictly in order against one instance.
///
/// The runner owns the cancellation source; its token replaces whatever token
/// the [`SequenceArgs`] were built with.
pub struct SequenceRunner {
    sequence: Sequence,
    args: SequenceArgs,
    progress: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for SequenceRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceRunner")
            .field("sequence", &self.sequence.name)
            .field("actions", &self.sequence.actions.len())
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

impl SequenceRunner {
    pub fn new(sequence: Sequence, mut args: SequenceArgs, progress: impl ProgressSink + 'static) -> Self {
        let cancel = CancellationToken::new();
        args.set_cancel_token(cancel.clone());
        Self {
            sequence,
            args,
            progress: Arc::new(progress),
            cancel,
        }
    }

    pub fn sequence(&self) -> &Sequence {
        &self.sequence
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn execute_sequence(&self) -> Result<(), SequenceError> {
        let instance = self.args.instance();
        let span = info_span!("sequence", name = %self.sequence.name, instance);
        let res = self.run(instance).instrument(span).await;
        self.progress.report(instance, 0, 0);
        res
    }

    async fn run(&self, instance: u32) -> Result<(), SequenceError> {
        let actions = &self.sequence.actions;
        let total = actions.len();
        info!(total, reason = %self.args.reason(), "sequence started");

        for (i, action) in actions.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!(step = i + 1, kind = action.kind(), "sequence cancelled");
                return Err(SequenceError::cancelled(format!(
                    "cancelled before {} (step {} of {total})",
                    action.kind(),
                    i + 1
                )));
            }

            debug!(step = i + 1, total, kind = action.kind(), "running action");
            let res = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(SequenceError::cancelled(format!(
                    "cancelled during {} (step {} of {total})",
                    action.kind(),
                    i + 1
                ))),
                res = action.execute(&self.args) => res,
            };
            if let Err(e) = res {
                warn!(step = i + 1, kind = action.kind(), error = %e, "sequence aborted");
                return Err(e);
            }

            self.progress.report(instance, i + 1, total);
        }

        info!("sequence finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use tokio::time::Instant;

    use super::*;
    use crate::{
        launcher::ProcessRegistry,
        sequence::SequenceAction,
        testing::{CountingBackup, RecordingLogger, server_handle},
    };

    type Reports = Arc<Mutex<Vec<(u32, usize, usize)>>>;

    fn recorder() -> (Reports, impl ProgressSink + 'static) {
        let reports: Reports = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        (reports, move |instance: u32, done: usize, total: usize| {
            sink.lock().unwrap().push((instance, done, total));
        })
    }

    fn sequence(actions: Vec<SequenceAction>) -> Sequence {
        Sequence {
            name: "test".to_string(),
            actions,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_in_order_and_reports_progress() {
        let registry = ProcessRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = order.clone();
        let args = SequenceArgs::builder(3, Arc::new(registry))
            .main_action(move |instance, _| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(format!("main:{instance}"));
                    Ok(())
                }
            })
            .build();
        let (reports, sink) = recorder();
        let runner = SequenceRunner::new(
            sequence(vec![
                SequenceAction::Wait { seconds: 1 },
                SequenceAction::Wait { seconds: 2 },
                SequenceAction::MainAction,
            ]),
            args,
            sink,
        );

        let started = Instant::now();
        runner.execute_sequence().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(*order.lock().unwrap(), vec!["main:3"]);
        assert_eq!(
            *reports.lock().unwrap(),
            vec![(3, 1, 3), (3, 2, 3), (3, 3, 3), (3, 0, 0)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn wait_offline_failure_skips_backup_and_main_action() {
        let registry = ProcessRegistry::new();
        let (handle, _fake) = server_handle(1);
        handle.refresh().await;
        registry.insert(handle);

        let backups = Arc::new(CountingBackup::default());
        let main_calls = Arc::new(AtomicUsize::new(0));
        let calls = main_calls.clone();
        let args = SequenceArgs::builder(1, Arc::new(registry))
            .backups(backups.clone())
            .logger(Arc::new(RecordingLogger::default()))
            .main_action(move |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .build();
        let (reports, sink) = recorder();
        let runner = SequenceRunner::new(
            sequence(vec![
                SequenceAction::WaitOffline {
                    timeout_seconds: 5,
                    cancel_on_failure: true,
                },
                SequenceAction::BackupServerData {
                    max_age_seconds: 3600,
                    cancel_on_failure: true,
                },
                SequenceAction::MainAction,
            ]),
            args,
            sink,
        );

        let started = Instant::now();
        let err = runner.execute_sequence().await.unwrap_err();
        assert!(matches!(err, SequenceError::Cancelled { .. }));
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(backups.calls(), 0);
        assert_eq!(main_calls.load(Ordering::SeqCst), 0);
        assert_eq!(*reports.lock().unwrap(), vec![(1, 0, 0)]);
    }

    #[tokio::test]
    async fn soft_failure_continues_with_next_action() {
        let registry = ProcessRegistry::new();
        let logger = Arc::new(RecordingLogger::default());
        let main_calls = Arc::new(AtomicUsize::new(0));
        let calls = main_calls.clone();
        let args = SequenceArgs::builder(1, Arc::new(registry))
            .logger(logger.clone())
            .main_action(move |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .build();
        let (reports, sink) = recorder();
        let runner = SequenceRunner::new(
            sequence(vec![
                SequenceAction::RconCommand {
                    command: "shutdown".to_string(),
                    cancel_on_failure: false,
                },
                SequenceAction::MainAction,
            ]),
            args,
            sink,
        );

        runner.execute_sequence().await.unwrap();
        assert_eq!(main_calls.load(Ordering::SeqCst), 1);
        assert_eq!(logger.errors().len(), 1);
        assert!(logger.warnings().is_empty());
        assert_eq!(
            *reports.lock().unwrap(),
            vec![(1, 1, 2), (1, 2, 2), (1, 0, 0)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_mid_run_stops_further_actions() {
        let main_calls = Arc::new(AtomicUsize::new(0));
        let calls = main_calls.clone();
        let args = SequenceArgs::builder(1, Arc::new(ProcessRegistry::new()))
            .main_action(move |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .build();
        let (reports, sink) = recorder();
        let runner = Arc::new(SequenceRunner::new(
            sequence(vec![
                SequenceAction::Wait { seconds: 1 },
                SequenceAction::Wait { seconds: 60 },
                SequenceAction::MainAction,
            ]),
            args,
            sink,
        ));

        let task = tokio::spawn({
            let runner = runner.clone();
            async move { runner.execute_sequence().await }
        });
        tokio::time::sleep(Duration::from_secs(5)).await;
        runner.cancel();

        let err = task.await.unwrap().unwrap_err();
        let SequenceError::Cancelled { reason } = err;
        assert!(reason.contains("during Wait"), "{reason}");
        assert_eq!(main_calls.load(Ordering::SeqCst), 0);
        assert_eq!(*reports.lock().unwrap(), vec![(1, 1, 3), (1, 0, 0)]);
    }

    #[tokio::test]
    async fn pre_cancelled_runner_runs_nothing() {
        let main_calls = Arc::new(AtomicUsize::new(0));
        let calls = main_calls.clone();
        let args = SequenceArgs::builder(1, Arc::new(ProcessRegistry::new()))
            .main_action(move |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .build();
        let runner = SequenceRunner::new(
            sequence(vec![SequenceAction::MainAction]),
            args,
            NoProgress,
        );
        runner.cancel();
        assert!(runner.execute_sequence().await.is_err());
        assert_eq!(main_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn hard_failure_aborts_remaining_actions() {
        let main_calls = Arc::new(AtomicUsize::new(0));
        let calls = main_calls.clone();
        let args = SequenceArgs::builder(1, Arc::new(ProcessRegistry::new()))
            .logger(Arc::new(RecordingLogger::default()))
            .main_action(move |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .build();
        let runner = SequenceRunner::new(
            sequence(vec![
                SequenceAction::RconCommand {
                    command: "saveworld".to_string(),
                    cancel_on_failure: true,
                },
                SequenceAction::MainAction,
            ]),
            args,
            NoProgress,
        );
        let err = runner.execute_sequence().await.unwrap_err();
        assert!(err.to_string().contains("RconCommand"));
        assert_eq!(main_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn runner_token_reaches_actions() {
        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();
        let args = SequenceArgs::builder(1, Arc::new(ProcessRegistry::new()))
            .main_action(move |_, token: CancellationToken| {
                *slot.lock().unwrap() = Some(token);
                async { Ok(()) }
            })
            .build();
        let runner = SequenceRunner::new(
            sequence(vec![SequenceAction::MainAction]),
            args,
            NoProgress,
        );
        runner.execute_sequence().await.unwrap();

        let token = seen.lock().unwrap().take().unwrap();
        assert!(!token.is_cancelled());
        runner.cancel();
        assert!(token.is_cancelled());
    }
}
