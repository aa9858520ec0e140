use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::warn;
use warden_process::{ProcessState, ServerInfos, StateChange};

use crate::support::{format_error_chain, http_client};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    WentOnline,
    Crashed,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub instance: u32,
    pub title: String,
    pub pid: u32,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Fires each notification kind at most once per handle lifetime.
pub struct NotificationDispatcher {
    notifiers: Vec<Arc<dyn Notifier>>,
    online_notified: AtomicBool,
    crash_notified: AtomicBool,
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("notifiers", &self.notifiers.len())
            .field("online_notified", &self.online_notified())
            .field("crash_notified", &self.crash_notified())
            .finish()
    }
}

impl NotificationDispatcher {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self {
            notifiers,
            online_notified: AtomicBool::new(false),
            crash_notified: AtomicBool::new(false),
        }
    }

    pub fn online_notified(&self) -> bool {
        self.online_notified.load(Ordering::Acquire)
    }

    pub fn crash_notified(&self) -> bool {
        self.crash_notified.load(Ordering::Acquire)
    }

    /// Latches and builds the notification for a qualifying edge.
    pub(crate) fn on_transition(
        &self,
        change: &StateChange,
        infos: &ServerInfos,
    ) -> Option<Notification> {
        let (latch, kind) = match change.to {
            ProcessState::Online => (&self.online_notified, NotificationKind::WentOnline),
            ProcessState::Crashed => (&self.crash_notified, NotificationKind::Crashed),
            _ => return None,
        };
        latch
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(Notification {
            kind,
            instance: infos.instance,
            title: infos.title.clone(),
            pid: change.pid,
            at: change.at,
        })
    }

    /// Fire-and-forget delivery to every notifier.
    pub(crate) fn dispatch(&self, notification: Notification) {
        for notifier in &self.notifiers {
            let notifier = notifier.clone();
            let notification = notification.clone();
            tokio::spawn(async move {
                if let Err(e) = notifier.notify(&notification).await {
                    warn!(
                        instance = notification.instance,
                        kind = ?notification.kind,
                        error = %format_error_chain(&e),
                        "notification delivery failed"
                    );
                }
            });
        }
    }
}

pub(crate) async fn post_discord(url: &str, content: &str) -> anyhow::Result<()> {
    let resp = http_client()
        .post(url)
        .json(&serde_json::json!({ "content": content }))
        .send()
        .await
        .context("post discord webhook")?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("discord webhook returned {status}: {body}");
    }
    Ok(())
}

pub(crate) fn render_notification(template: &str, n: &Notification) -> String {
    template
        .replace("{title}", &n.title)
        .replace("{instance}", &n.instance.to_string())
        .replace("{pid}", &n.pid.to_string())
}

#[derive(Debug, Clone)]
pub struct DiscordWebhookNotifier {
    url: String,
    online_message: String,
    crash_message: String,
}

impl DiscordWebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            online_message: "{title} (instance {instance}) is online.".to_string(),
            crash_message: "{title} (instance {instance}) crashed.".to_string(),
        }
    }

    pub fn with_messages(mut self, online: impl Into<String>, crash: impl Into<String>) -> Self {
        self.online_message = online.into();
        self.crash_message = crash.into();
        self
    }

    fn message_for(&self, n: &Notification) -> String {
        let template = match n.kind {
            NotificationKind::WentOnline => &self.online_message,
            NotificationKind::Crashed => &self.crash_message,
        };
        render_notification(template, n)
    }
}

#[async_trait]
impl Notifier for DiscordWebhookNotifier {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        post_discord(&self.url, &self.message_for(notification)).await
    }
}

/// Forwards notifications to an in-process consumer.
#[derive(Debug, Clone)]
pub struct ChannelNotifier(pub mpsc::UnboundedSender<Notification>);

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        self.0
            .send(notification.clone())
            .map_err(|_| anyhow::anyhow!("notification receiver dropped"))
    }
}
