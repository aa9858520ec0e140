use std::{collections::BTreeMap, time::Duration};

use anyhow::Context;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{SequenceArgs, SequenceError};
use crate::{notify::post_discord, support::http_client};

fn default_true() -> bool {
    true
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_rest_timeout() -> u64 {
    30
}

/// One step of a [`super::Sequence`], tagged by `type` when serialized.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum SequenceAction {
    Wait {
        seconds: u64,
    },
    WaitOnline {
        timeout_seconds: u64,
        #[serde(default)]
        cancel_on_failure: bool,
    },
    WaitOffline {
        timeout_seconds: u64,
        #[serde(default)]
        cancel_on_failure: bool,
    },
    RconCommand {
        command: String,
        #[serde(default)]
        cancel_on_failure: bool,
    },
    ExecuteProcess {
        filename: String,
        #[serde(default)]
        arguments: Vec<String>,
        #[serde(default = "default_true")]
        wait_for_exit: bool,
        #[serde(default = "default_true")]
        check_exit_code: bool,
        #[serde(default)]
        timeout_seconds: Option<u64>,
        #[serde(default)]
        cancel_on_failure: bool,
    },
    BackupServerData {
        max_age_seconds: u64,
        #[serde(default)]
        cancel_on_failure: bool,
    },
    DiscordWebHook {
        message: String,
        webhook_url: String,
        #[serde(default)]
        cancel_on_failure: bool,
    },
    #[serde(rename = "SendRESTQuery", alias = "SendRestQuery")]
    SendRestQuery {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default)]
        body: Option<String>,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default = "default_rest_timeout")]
        timeout_seconds: u64,
        #[serde(default)]
        cancel_on_failure: bool,
    },
    MainAction,
}

impl SequenceAction {
    pub fn kind(&self) -> &'static str {
        match self {
            SequenceAction::Wait { .. } => "Wait",
            SequenceAction::WaitOnline { .. } => "WaitOnline",
            SequenceAction::WaitOffline { .. } => "WaitOffline",
            SequenceAction::RconCommand { .. } => "RconCommand",
            SequenceAction::ExecuteProcess { .. } => "ExecuteProcess",
            SequenceAction::BackupServerData { .. } => "BackupServerData",
            SequenceAction::DiscordWebHook { .. } => "DiscordWebHook",
            SequenceAction::SendRestQuery { .. } => "SendRESTQuery",
            SequenceAction::MainAction => "MainAction",
        }
    }

    pub fn cancel_on_failure(&self) -> bool {
        match self {
            SequenceAction::Wait { .. } | SequenceAction::MainAction => false,
            SequenceAction::WaitOnline {
                cancel_on_failure, ..
            }
            | SequenceAction::WaitOffline {
                cancel_on_failure, ..
            }
            | SequenceAction::RconCommand {
                cancel_on_failure, ..
            }
            | SequenceAction::ExecuteProcess {
                cancel_on_failure, ..
            }
            | SequenceAction::BackupServerData {
                cancel_on_failure, ..
            }
            | SequenceAction::DiscordWebHook {
                cancel_on_failure, ..
            }
            | SequenceAction::SendRestQuery {
                cancel_on_failure, ..
            } => *cancel_on_failure,
        }
    }

    /// Runs the action. Recoverable failures are logged and swallowed unless the
    /// action cancels on failure, in which case the run is aborted.
    pub async fn execute(&self, args: &SequenceArgs) -> Result<(), SequenceError> {
        let res = match self {
            SequenceAction::Wait { seconds } => {
                tokio::time::sleep(Duration::from_secs(*seconds)).await;
                Ok(())
            }
            SequenceAction::WaitOnline {
                timeout_seconds, ..
            } => wait_until(args, *timeout_seconds, "online", |args| {
                args.launcher()
                    .server_process(args.instance())
                    .is_some_and(|p| p.online())
            })
            .await,
            SequenceAction::WaitOffline {
                timeout_seconds, ..
            } => wait_until(args, *timeout_seconds, "offline", |args| {
                !args.launcher().is_instance_active(args.instance())
            })
            .await,
            SequenceAction::RconCommand { command, .. } => rcon_command(args, command).await,
            SequenceAction::ExecuteProcess {
                filename,
                arguments,
                wait_for_exit,
                check_exit_code,
                timeout_seconds,
                ..
            } => {
                execute_process(
                    filename,
                    arguments,
                    *wait_for_exit,
                    *check_exit_code,
                    timeout_seconds.map(Duration::from_secs),
                )
                .await
            }
            SequenceAction::BackupServerData {
                max_age_seconds, ..
            } => backup(args, Duration::from_secs(*max_age_seconds)).await,
            SequenceAction::DiscordWebHook {
                message,
                webhook_url,
                ..
            } => post_discord(webhook_url, &args.render(message)).await,
            SequenceAction::SendRestQuery {
                url,
                method,
                body,
                headers,
                timeout_seconds,
                ..
            } => {
                send_rest_query(
                    url,
                    method,
                    body.as_deref(),
                    headers,
                    Duration::from_secs(*timeout_seconds),
                )
                .await
            }
            SequenceAction::MainAction => return main_action(args).await,
        };

        let Err(e) = res else {
            return Ok(());
        };
        let message = format!("{} action failed", self.kind());
        args.logger().error(args.instance(), &message, Some(&e));
        if self.cancel_on_failure() {
            return Err(SequenceError::cancelled(format!("{message}: {e:#}")));
        }
        Ok(())
    }
}

async fn wait_until<F>(args: &SequenceArgs, timeout_secs: u64, what: &str, done: F) -> anyhow::Result<()>
where
    F: Fn(&SequenceArgs) -> bool,
{
    // Timeouts beyond the clock's range never expire.
    let deadline = Instant::now().checked_add(Duration::from_secs(timeout_secs));
    loop {
        // Re-read the registry on every poll.
        if done(args) {
            return Ok(());
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            anyhow::bail!(
                "instance {} not {what} after {timeout_secs}s",
                args.instance()
            );
        }
        tokio::time::sleep(args.poll_interval()).await;
    }
}

async fn rcon_command(args: &SequenceArgs, command: &str) -> anyhow::Result<()> {
    let instance = args.instance();
    let process = args
        .launcher()
        .server_process(instance)
        .filter(|p| p.is_active())
        .ok_or_else(|| anyhow::anyhow!("instance {instance} is not running"))?;
    let rcon = process
        .rcon()
        .ok_or_else(|| anyhow::anyhow!("instance {instance} has no rcon attached"))?;

    let command = args.render(command);
    let response = rcon
        .send(&command, args.cancel_token())
        .await
        .with_context(|| format!("rcon command {command:?}"))?;
    info!(instance, %command, response = %response.trim(), "rcon command sent");
    Ok(())
}

async fn execute_process(
    filename: &str,
    arguments: &[String],
    wait_for_exit: bool,
    check_exit_code: bool,
    timeout: Option<Duration>,
) -> anyhow::Result<()> {
    let mut cmd = tokio::process::Command::new(filename);
    cmd.args(arguments).stdin(std::process::Stdio::null());
    // A cancelled run drops the future and with it the child.
    cmd.kill_on_drop(wait_for_exit);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn {filename}"))?;
    if !wait_for_exit {
        debug!(%filename, pid = ?child.id(), "process started; not waiting");
        return Ok(());
    }

    let status = match timeout {
        Some(t) => match tokio::time::timeout(t, child.wait()).await {
            Ok(res) => res,
            Err(_) => {
                let _ = child.start_kill();
                anyhow::bail!("{filename} did not exit within {}s", t.as_secs());
            }
        },
        None => child.wait().await,
    }
    .with_context(|| format!("wait for {filename}"))?;

    if check_exit_code && !status.success() {
        anyhow::bail!("{filename} exited with {status}");
    }
    debug!(%filename, %status, "process finished");
    Ok(())
}

async fn backup(args: &SequenceArgs, max_age: Duration) -> anyhow::Result<()> {
    let instance = args.instance();
    if args.launcher().is_instance_active(instance) {
        anyhow::bail!("instance {instance} is still running; refusing to back up");
    }
    let backups = args
        .backups()
        .ok_or_else(|| anyhow::anyhow!("no backup manager configured"))?;
    backups.perform_server_backup(instance, max_age).await
}

async fn send_rest_query(
    url: &str,
    method: &str,
    body: Option<&str>,
    headers: &BTreeMap<String, String>,
    timeout: Duration,
) -> anyhow::Result<()> {
    let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("invalid http method {method:?}"))?;
    let mut req = http_client().request(method.clone(), url).timeout(timeout);
    for (k, v) in headers {
        req = req.header(k.as_str(), v.as_str());
    }
    if let Some(body) = body {
        req = req.body(body.to_string());
    }

    let resp = req
        .send()
        .await
        .with_context(|| format!("{method} {url}"))?;
    let status = resp.status();
    if !status.is_success() {
        anyhow::bail!("{method} {url} returned {status}");
    }
    debug!(%method, %url, %status, "rest query sent");
    Ok(())
}

async fn main_action(args: &SequenceArgs) -> Result<(), SequenceError> {
    let instance = args.instance();
    let Some(action) = args.main_action() else {
        args.logger()
            .error(instance, "MainAction requested but no delegate is registered", None);
        return Ok(());
    };
    if let Err(e) = action(instance, args.cancel_token().clone()).await {
        args.logger().error(instance, "MainAction failed", Some(&e));
        return Err(SequenceError::cancelled(format!("MainAction failed: {e:#}")));
    }
    Ok(())
}
