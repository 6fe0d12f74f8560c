//! Retry Scheduler.
//!
//! A global min-heap keyed by `next_retry_at`. A single worker wakes on the
//! earliest deadline, moves due messages from `Failed` back to `Pending` in
//! the [`MessageBuffer`](crate::buffer::MessageBuffer), and notifies the
//! batcher. Grounded on `retry.rs`'s backoff-computation shape, generalized
//! from "retry one future" to "wake on the earliest of many scheduled
//! deadlines" — the worker-loop shape (`tokio::spawn` + sleep-until-deadline)
//! follows the same pattern `retry_with_backoff` uses internally.

use crate::buffer::MessageBuffer;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

#[derive(Debug, Clone, Eq, PartialEq)]
struct ScheduledRetry {
    due_at: Instant,
    user_id: String,
}

impl Ord for ScheduledRetry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due_at.cmp(&other.due_at)
    }
}

impl PartialOrd for ScheduledRetry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Notifies subscribers (the Batcher) that a user's buffer just had messages
/// moved back to `Pending` and is worth re-checking.
pub type RetryNotifier = mpsc::UnboundedSender<String>;

pub struct RetryScheduler {
    heap: Mutex<BinaryHeap<Reverse<ScheduledRetry>>>,
    buffer: Arc<MessageBuffer>,
    poll_interval: Duration,
}

impl RetryScheduler {
    pub fn new(buffer: Arc<MessageBuffer>, poll_interval: Duration) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            buffer,
            poll_interval,
        }
    }

    /// Schedule `user_id`'s buffer to be re-checked at `due_at`. Safe to call
    /// more than once for the same user — duplicate entries just resolve to
    /// extra no-op scans.
    pub async fn schedule(&self, user_id: String, due_at: Instant) {
        self.heap.lock().await.push(Reverse(ScheduledRetry { due_at, user_id }));
    }

    /// Run the worker loop: wake on the earliest deadline (or `poll_interval`
    /// if the heap is empty, so newly-nacked messages are still picked up),
    /// pop every due entry, move ready messages back to `Pending`, and notify
    /// `notify` so the Batcher re-checks that user.
    pub async fn run(self: Arc<Self>, notify: RetryNotifier, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            let sleep_for = {
                let heap = self.heap.lock().await;
                match heap.peek() {
                    Some(Reverse(next)) => next.due_at.saturating_duration_since(Instant::now()),
                    None => self.poll_interval,
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }

            self.drain_due(&notify).await;
        }
    }

    async fn drain_due(&self, notify: &RetryNotifier) {
        let now = Instant::now();
        let due_users: Vec<String> = {
            let mut heap = self.heap.lock().await;
            let mut users = Vec::new();
            while let Some(Reverse(entry)) = heap.peek() {
                if entry.due_at > now {
                    break;
                }
                let Reverse(entry) = heap.pop().unwrap();
                users.push(entry.user_id);
            }
            users
        };

        for user_id in due_users {
            let ids = self.buffer.due_for_retry(&user_id).await;
            if ids.is_empty() {
                continue;
            }
            self.buffer.requeue(&user_id, &ids).await;
            debug!(user_id = %user_id, count = ids.len(), "retry scheduler requeued messages");
            let _ = notify.send(user_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferConfig;
    use crate::buffer::OverflowPolicy;
    use crate::envelope::{Envelope, MessageType, Priority};

    #[tokio::test]
    async fn due_entry_requeues_and_notifies() {
        let buffer = Arc::new(MessageBuffer::new(BufferConfig::default(), OverflowPolicy::DropOldest));
        let envelope = Envelope::new(MessageType::ChatMessage, serde_json::json!({}), Priority::Normal, &[]);
        buffer.enqueue("u1", envelope).await.unwrap();
        let batch = buffer.take_batch("u1", 10).await;
        buffer.nack("u1", &[batch[0].message_id]).await;

        let scheduler = Arc::new(RetryScheduler::new(buffer.clone(), Duration::from_millis(5)));
        scheduler.schedule("u1".to_string(), Instant::now()).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        scheduler.drain_due(&tx).await;

        assert_eq!(rx.recv().await, Some("u1".to_string()));
        let pending = buffer.take_batch("u1", 10).await;
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn not_yet_due_entry_is_left_on_the_heap() {
        let buffer = Arc::new(MessageBuffer::new(BufferConfig::default(), OverflowPolicy::DropOldest));
        let scheduler = RetryScheduler::new(buffer, Duration::from_millis(5));
        scheduler.schedule("u1".to_string(), Instant::now() + Duration::from_secs(60)).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        scheduler.drain_due(&tx).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(scheduler.heap.lock().await.len(), 1);
    }
}
