//! Completion notifications for the node's owner.
//!
//! The coordinator publishes from the owner's own calls (`start`, `poll`,
//! `wait`, `terminate`), so subscribers always see notifications raised on
//! the owner's thread, in order.

use crate::node::NodeId;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::time::Duration;

const NOTIFY_CHANNEL_CAPACITY: usize = 64;

/// How an invocation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Finished { return_code: i32 },
    Terminated,
}

/// One invocation reached a terminal state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub node: NodeId,
    pub invocation: u64,
    pub kind: NotificationKind,
    /// Wall time since `start`
    pub elapsed: Duration,
}

impl Notification {
    pub fn is_finished(&self) -> bool {
        matches!(self.kind, NotificationKind::Finished { .. })
    }

    pub fn return_code(&self) -> Option<i32> {
        match self.kind {
            NotificationKind::Finished { return_code } => Some(return_code),
            NotificationKind::Terminated => None,
        }
    }
}

/// Fan-out of notifications to subscribers
#[derive(Default)]
pub struct NotificationHub {
    subscribers: Vec<Sender<Notification>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> Receiver<Notification> {
        let (tx, rx) = bounded(NOTIFY_CHANNEL_CAPACITY);
        self.subscribers.push(tx);
        rx
    }

    /// Send to every live subscriber, dropping the ones that went away
    pub fn publish(&mut self, notification: &Notification) {
        self.subscribers
            .retain(|tx| match tx.try_send(notification.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(
                        "Notification subscriber for node {} is full, dropping {:?}",
                        notification.node,
                        notification.kind
                    );
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
