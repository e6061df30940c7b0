//! History event pub/sub for long-poll tailers.
//!
//! `get_mutable_state` callers that already hold the current history tail
//! subscribe here and block until a persist advances `next_event_id` past
//! their expectation or closes the workflow. Subscriber lists are per
//! execution under a fine-grained lock; notification delivery is
//! best-effort and never blocks the persisting path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::EngineError;
use crate::WorkflowIdentifier;

/// Snapshot of history progress published after every successful persist.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEventNotification {
    pub identifier: WorkflowIdentifier,
    pub last_first_event_id: i64,
    pub next_event_id: i64,
    pub previous_started_event_id: Option<i64>,
    pub is_workflow_running: bool,
    pub timestamp_ms: i64,
}

type SubscriberMap =
    HashMap<WorkflowIdentifier, HashMap<u64, mpsc::UnboundedSender<HistoryEventNotification>>>;

pub struct HistoryEventNotifier {
    subscribers: Mutex<SubscriberMap>,
    next_subscriber_id: AtomicU64,
}

impl Default for HistoryEventNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryEventNotifier {
    pub fn new() -> Self {
        HistoryEventNotifier {
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to history progress for one execution. The caller must
    /// [`Self::unwatch`] with the returned subscriber ID on every exit path.
    pub fn watch(
        &self,
        identifier: &WorkflowIdentifier,
    ) -> Result<(u64, mpsc::UnboundedReceiver<HistoryEventNotification>), EngineError> {
        let subscriber_id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self
            .subscribers
            .lock()
            .map_err(|_| EngineError::internal("history event notifier lock poisoned"))?;
        subscribers
            .entry(identifier.clone())
            .or_default()
            .insert(subscriber_id, tx);
        Ok((subscriber_id, rx))
    }

    pub fn unwatch(&self, identifier: &WorkflowIdentifier, subscriber_id: u64) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return;
        };
        if let Some(entry) = subscribers.get_mut(identifier) {
            entry.remove(&subscriber_id);
            if entry.is_empty() {
                subscribers.remove(identifier);
            }
        }
    }

    /// Fan a notification out to every subscriber of the execution. Closed
    /// receivers are pruned in passing.
    pub fn notify_new_history_event(&self, notification: &HistoryEventNotification) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return;
        };
        let Some(entry) = subscribers.get_mut(&notification.identifier) else {
            return;
        };
        entry.retain(|subscriber_id, tx| {
            let delivered = tx.send(notification.clone()).is_ok();
            if !delivered {
                debug!(
                    subscriber_id,
                    workflow_id = %notification.identifier.workflow_id,
                    "pruning closed history event subscriber"
                );
            }
            delivered
        });
        if entry.is_empty() {
            subscribers.remove(&notification.identifier);
        }
    }

    pub fn subscriber_count(&self, identifier: &WorkflowIdentifier) -> usize {
        self.subscribers
            .lock()
            .map(|s| s.get(identifier).map(|e| e.len()).unwrap_or(0))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identifier() -> WorkflowIdentifier {
        WorkflowIdentifier::new("d", "wf", "run")
    }

    fn notification(next_event_id: i64) -> HistoryEventNotification {
        HistoryEventNotification {
            identifier: identifier(),
            last_first_event_id: 1,
            next_event_id,
            previous_started_event_id: None,
            is_workflow_running: true,
            timestamp_ms: 0,
        }
    }

    #[tokio::test]
    async fn watch_receives_notifications() {
        let notifier = HistoryEventNotifier::new();
        let (id, mut rx) = notifier.watch(&identifier()).unwrap();
        notifier.notify_new_history_event(&notification(5));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.next_event_id, 5);
        notifier.unwatch(&identifier(), id);
        assert_eq!(notifier.subscriber_count(&identifier()), 0);
    }

    #[tokio::test]
    async fn notifications_are_scoped_per_execution() {
        let notifier = HistoryEventNotifier::new();
        let other = WorkflowIdentifier::new("d", "wf-2", "run-2");
        let (_, mut rx) = notifier.watch(&other).unwrap();
        notifier.notify_new_history_event(&notification(5));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive() {
        let notifier = HistoryEventNotifier::new();
        let (_, mut rx1) = notifier.watch(&identifier()).unwrap();
        let (_, mut rx2) = notifier.watch(&identifier()).unwrap();
        notifier.notify_new_history_event(&notification(7));
        assert_eq!(rx1.recv().await.unwrap().next_event_id, 7);
        assert_eq!(rx2.recv().await.unwrap().next_event_id, 7);
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned_on_notify() {
        let notifier = HistoryEventNotifier::new();
        let (_, rx) = notifier.watch(&identifier()).unwrap();
        drop(rx);
        notifier.notify_new_history_event(&notification(3));
        assert_eq!(notifier.subscriber_count(&identifier()), 0);
    }
}
