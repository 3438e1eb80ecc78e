//! Best-effort fan-out of ledger events to connected staff.
//!
//! Engines publish through [`NotificationSink`] only after their transaction
//! has committed; a failed publish is logged and never surfaces to the caller.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use uuid::Uuid;

use crate::models::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Recipient {
    Role(Role),
    User(Uuid),
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub recipient: Recipient,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub title: String,
    pub message: String,
    pub related_id: Option<Uuid>,
    pub related_type: Option<&'static str>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn to_role(role: Role, kind: &'static str, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            recipient: Recipient::Role(role),
            kind,
            title: title.into(),
            message: message.into(),
            related_id: None,
            related_type: None,
            created_at: Utc::now(),
        }
    }

    pub fn related(mut self, related_type: &'static str, id: Uuid) -> Self {
        self.related_type = Some(related_type);
        self.related_id = Some(id);
        self
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("no live subscribers")]
    NoSubscribers,
}

pub trait NotificationSink: Send + Sync {
    /// Returns how many receivers the notification reached.
    fn publish(&self, notification: Notification) -> Result<usize, NotifyError>;
}

/// Publishes and swallows the outcome. Call only after a successful commit.
pub fn emit(sink: &dyn NotificationSink, notification: Notification) {
    let kind = notification.kind;
    match sink.publish(notification) {
        Ok(reached) => tracing::debug!(kind, reached, "notification published"),
        Err(e) => tracing::debug!(kind, error = %e, "notification dropped"),
    }
}

/// Process-local broadcast hub; one instance per server.
#[derive(Clone)]
pub struct NotificationHub {
    tx: broadcast::Sender<Arc<Notification>>,
}

impl NotificationHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self, role: Role, user_id: Uuid) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            role,
            user_id,
        }
    }
}

impl NotificationSink for NotificationHub {
    fn publish(&self, notification: Notification) -> Result<usize, NotifyError> {
        self.tx
            .send(Arc::new(notification))
            .map_err(|_| NotifyError::NoSubscribers)
    }
}

fn addressed_to(n: &Notification, role: Role, user_id: Uuid) -> bool {
    match n.recipient {
        Recipient::Role(r) => r == role,
        Recipient::User(id) => id == user_id,
    }
}

pub struct Subscription {
    rx: broadcast::Receiver<Arc<Notification>>,
    role: Role,
    user_id: Uuid,
}

impl Subscription {
    /// Next notification addressed to this subscriber; `None` once the hub
    /// is gone. Lagged receivers skip what they missed.
    #[cfg(test)]
    pub async fn recv(&mut self) -> Option<Arc<Notification>> {
        loop {
            match self.rx.recv().await {
                Ok(n) if addressed_to(&n, self.role, self.user_id) => return Some(n),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, user_id = %self.user_id, "notification subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Arc<Notification>> + Send + 'static {
        let Subscription { rx, role, user_id } = self;
        BroadcastStream::new(rx).filter_map(move |item| async move {
            match item {
                Ok(n) => addressed_to(&n, role, user_id).then_some(n),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, %user_id, "notification stream lagged");
                    None
                }
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records everything; optionally fails every publish.
    #[derive(Default)]
    pub struct RecordingSink {
        pub sent: Mutex<Vec<Notification>>,
        pub broken: bool,
    }

    impl RecordingSink {
        pub fn broken() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                broken: true,
            }
        }

        pub fn kinds(&self) -> Vec<&'static str> {
            self.sent.lock().unwrap().iter().map(|n| n.kind).collect()
        }
    }

    impl NotificationSink for RecordingSink {
        fn publish(&self, notification: Notification) -> Result<usize, NotifyError> {
            if self.broken {
                return Err(NotifyError::NoSubscribers);
            }
            self.sent.lock().unwrap().push(notification);
            Ok(1)
        }
    }
}
