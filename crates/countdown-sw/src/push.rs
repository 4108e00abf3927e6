//! Push messages and notifications.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use countdown_core::{NotificationAction, NotificationConfig};
use tracing::{debug, warn};

/// An inbound push message.
#[derive(Debug, Clone, Default)]
pub struct PushMessage {
    data: Option<Bytes>,
}

impl PushMessage {
    pub fn new(data: Option<Bytes>) -> Self {
        Self { data }
    }

    /// A push carrying no payload.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn text_payload(text: &str) -> Self {
        Self::new(Some(Bytes::copy_from_slice(text.as_bytes())))
    }

    /// Payload as text. `None` when absent, empty or not valid UTF-8.
    pub fn text(&self) -> Option<String> {
        let data = self.data.as_ref()?;
        match std::str::from_utf8(data) {
            Ok(text) if !text.is_empty() => Some(text.to_string()),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Push payload is not UTF-8");
                None
            }
        }
    }
}

/// Unique identifier for a displayed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotificationId(u64);

impl NotificationId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// What to display for a push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationIntent {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub tag: String,
    pub require_interaction: bool,
    pub actions: Vec<NotificationAction>,
}

impl NotificationIntent {
    /// Build an intent; the configured default body stands in for missing text.
    pub fn from_push(message: &PushMessage, config: &NotificationConfig) -> Self {
        Self {
            title: config.title.clone(),
            body: message.text().unwrap_or_else(|| config.default_body.clone()),
            icon: config.icon.clone(),
            badge: config.badge.clone(),
            tag: config.tag.clone(),
            require_interaction: config.require_interaction,
            actions: config.actions.clone(),
        }
    }

    pub fn has_action(&self, action: &str) -> bool {
        self.actions.iter().any(|a| a.action == action)
    }
}

/// A notification on screen.
#[derive(Debug, Clone)]
pub struct Notification {
    pub id: NotificationId,
    pub intent: NotificationIntent,
    pub shown_at: Instant,
}

/// The platform's notification tray.
#[derive(Debug, Default)]
pub struct Notifications {
    shown: Vec<Notification>,
}

impl Notifications {
    pub fn new() -> Self {
        Self::default()
    }

    /// Display an intent. A notification with the same tag is replaced.
    pub fn show(&mut self, intent: NotificationIntent) -> NotificationId {
        if !intent.tag.is_empty() {
            self.shown.retain(|n| n.intent.tag != intent.tag);
        }
        let id = NotificationId::new();
        debug!(id = id.raw(), tag = %intent.tag, "Notification shown");
        self.shown.push(Notification {
            id,
            intent,
            shown_at: Instant::now(),
        });
        id
    }

    pub fn get(&self, id: NotificationId) -> Option<&Notification> {
        self.shown.iter().find(|n| n.id == id)
    }

    /// Dismiss a notification.
    pub fn close(&mut self, id: NotificationId) -> Option<Notification> {
        let index = self.shown.iter().position(|n| n.id == id)?;
        Some(self.shown.remove(index))
    }

    /// Notifications still on screen, oldest first.
    pub fn list(&self) -> &[Notification] {
        &self.shown
    }

    pub fn len(&self) -> usize {
        self.shown.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shown.is_empty()
    }
}
