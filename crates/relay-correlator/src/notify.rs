use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::Result;

/// Receiver side of correlation: wakes whatever waits on a correlation id.
pub trait WaitNotifyEngine: Send + Sync {
    /// Terminal result for `correlation_id`.
    fn done_with(&self, correlation_id: &str, data: &[u8]) -> Result<()>;
    /// Incremental update for `correlation_id`; may fire many times.
    fn progress_on(&self, correlation_id: &str, data: &[u8]) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Done,
    Progress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub correlation_id: String,
    pub kind: NotificationKind,
    pub data: Vec<u8>,
}

const CHANNEL_CAPACITY: usize = 64;
/// Above this many retained results, old ones are pruned.
const MAX_RETAINED: usize = 4096;
const RETENTION: Duration = Duration::from_secs(600);

/// In-process [`WaitNotifyEngine`]: one broadcast channel per correlation id.
///
/// Terminal results are also retained for a while, so a waiter that
/// subscribes after delivery still gets its answer.
#[derive(Default)]
pub struct NotifyHub {
    channels: DashMap<String, broadcast::Sender<Notification>>,
    completed: DashMap<String, (Notification, Instant)>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every notification for `correlation_id`.
    pub fn subscribe(&self, correlation_id: &str) -> broadcast::Receiver<Notification> {
        self.channels
            .entry(correlation_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Wait for the terminal notification of `correlation_id`.
    ///
    /// Returns at once when the result was delivered earlier; `None` on timeout.
    pub async fn wait_done(&self, correlation_id: &str, timeout: Duration) -> Option<Notification> {
        let mut rx = self.subscribe(correlation_id);
        if let Some(n) = self.take_completed(correlation_id) {
            drop(rx);
            self.release(correlation_id);
            return Some(n);
        }
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(n) if n.kind == NotificationKind::Done => return Some(n),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };
        let outcome = tokio::time::timeout(timeout, wait).await.ok().flatten();
        drop(rx);
        if outcome.is_some() {
            self.completed.remove(correlation_id);
        }
        self.release(correlation_id);
        outcome
    }

    /// Next notification of any kind for `correlation_id`, or `None` on timeout.
    ///
    /// Only notifications published after the call are seen, except a
    /// retained terminal result, which is returned (and kept) immediately.
    pub async fn next_event(&self, correlation_id: &str, timeout: Duration) -> Option<Notification> {
        let mut rx = self.subscribe(correlation_id);
        let retained = self
            .completed
            .get(correlation_id)
            .map(|entry| entry.value().0.clone());
        if retained.is_some() {
            drop(rx);
            self.release(correlation_id);
            return retained;
        }
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(n) => return Some(n),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };
        let outcome = tokio::time::timeout(timeout, wait).await.ok().flatten();
        drop(rx);
        self.release(correlation_id);
        outcome
    }

    /// Remove and return a retained terminal result without waiting.
    pub fn take_completed(&self, correlation_id: &str) -> Option<Notification> {
        self.completed
            .remove(correlation_id)
            .map(|(_, (n, _))| n)
    }

    /// Drop the channel of `correlation_id` once nobody listens on it.
    fn release(&self, correlation_id: &str) {
        self.channels
            .remove_if(correlation_id, |_, tx| tx.receiver_count() == 0);
    }

    /// Number of correlation ids with an open channel.
    pub fn subscriptions(&self) -> usize {
        self.channels.len()
    }

    pub fn retained(&self) -> usize {
        self.completed.len()
    }

    fn publish(&self, notification: Notification) {
        let sent = self
            .channels
            .get(&notification.correlation_id)
            .map(|tx| tx.send(notification.clone()).unwrap_or(0))
            .unwrap_or(0);
        debug!(
            correlation_id = %notification.correlation_id,
            kind = ?notification.kind,
            receivers = sent,
            "notification published"
        );
    }

    fn prune(&self) {
        if self.completed.len() > MAX_RETAINED {
            self.completed.retain(|_, (_, at)| at.elapsed() < RETENTION);
        }
    }
}

impl WaitNotifyEngine for NotifyHub {
    fn done_with(&self, correlation_id: &str, data: &[u8]) -> Result<()> {
        let notification = Notification {
            correlation_id: correlation_id.to_string(),
            kind: NotificationKind::Done,
            data: data.to_vec(),
        };
        self.prune();
        self.completed.insert(
            correlation_id.to_string(),
            (notification.clone(), Instant::now()),
        );
        self.publish(notification);
        self.channels.remove(correlation_id);
        Ok(())
    }

    fn progress_on(&self, correlation_id: &str, data: &[u8]) -> Result<()> {
        self.publish(Notification {
            correlation_id: correlation_id.to_string(),
            kind: NotificationKind::Progress,
            data: data.to_vec(),
        });
        Ok(())
    }
}
