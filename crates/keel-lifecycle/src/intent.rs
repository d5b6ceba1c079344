use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

/// An externally requested lifecycle action. Posted through the intent
/// queue; the driver task is the only consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Start,
    Stop,
    Restart,
    Reinstall,
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Intent::Start => write!(f, "start"),
            Intent::Stop => write!(f, "stop"),
            Intent::Restart => write!(f, "restart"),
            Intent::Reinstall => write!(f, "reinstall"),
        }
    }
}

/// Non-blocking, deduplicating intent queue.
///
/// Dedup rules against the pending tail:
/// - an identical pending intent absorbs the new one;
/// - `Start` replaces a pending `Stop` but is absorbed by a pending
///   `Restart` or `Reinstall` (both already end in a start);
/// - `Restart` replaces a pending `Start` or `Stop`, but never a pending
///   `Reinstall`;
/// - `Reinstall` replaces any pending intent;
/// - `Stop` replaces any pending intent.
#[derive(Clone, Default)]
pub struct IntentQueue {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    queue: Mutex<VecDeque<Intent>>,
    notify: Notify,
}

impl IntentQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, intent: Intent) {
        let mut queue = self.inner.queue.lock();
        match queue.back().copied() {
            None => queue.push_back(intent),
            Some(pending) => match dedup(pending, intent) {
                Dedup::Absorb => {
                    trace!(%intent, %pending, "intent absorbed by pending");
                }
                Dedup::Replace => {
                    trace!(%intent, %pending, "intent replaces pending");
                    *queue.back_mut().unwrap() = intent;
                }
                Dedup::Append => queue.push_back(intent),
            },
        }
        drop(queue);
        self.inner.notify.notify_one();
    }

    /// Push only when nothing is pending; used for internal retries so an
    /// external intent always wins over a retry.
    pub fn push_if_empty(&self, intent: Intent) {
        let mut queue = self.inner.queue.lock();
        if queue.is_empty() {
            queue.push_back(intent);
            drop(queue);
            self.inner.notify.notify_one();
        }
    }

    pub fn try_pop(&self) -> Option<Intent> {
        self.inner.queue.lock().pop_front()
    }

    pub async fn pop(&self) -> Intent {
        loop {
            if let Some(intent) = self.try_pop() {
                return intent;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Wait until an intent is pending without consuming it.
    pub async fn peeked(&self) -> Intent {
        loop {
            if let Some(intent) = self.inner.queue.lock().front().copied() {
                return intent;
            }
            self.inner.notify.notified().await;
        }
    }

    pub fn pending(&self) -> Vec<Intent> {
        self.inner.queue.lock().iter().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.queue.lock().is_empty()
    }
}

enum Dedup {
    /// Drop the new intent; the pending one covers it.
    Absorb,
    /// Overwrite the pending intent with the new one.
    Replace,
    /// Keep both.
    #[allow(dead_code)]
    Append,
}

fn dedup(pending: Intent, new: Intent) -> Dedup {
    use Intent::*;
    match (pending, new) {
        (a, b) if a == b => Dedup::Absorb,
        // A pending restart or reinstall already ends in a start.
        (Restart | Reinstall, Start) => Dedup::Absorb,
        // A restart never overrides a requested reinstall.
        (Reinstall, Restart) => Dedup::Absorb,
        (Stop, Start) => Dedup::Replace,
        (Start | Stop, Restart) => Dedup::Replace,
        (_, Reinstall) => Dedup::Replace,
        (_, Stop) => Dedup::Replace,
        (Start, Start) | (Restart, Restart) => Dedup::Absorb,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(q: &IntentQueue) -> Vec<Intent> {
        let mut out = Vec::new();
        while let Some(i) = q.try_pop() {
            out.push(i);
        }
        out
    }

    #[test]
    fn consecutive_identical_collapse() {
        let q = IntentQueue::new();
        q.push(Intent::Start);
        q.push(Intent::Start);
        assert_eq!(drain(&q), vec![Intent::Start]);
    }

    #[test]
    fn start_replaces_pending_stop() {
        let q = IntentQueue::new();
        q.push(Intent::Stop);
        q.push(Intent::Start);
        assert_eq!(drain(&q), vec![Intent::Start]);
    }

    #[test]
    fn restart_overrides_pending_start() {
        let q = IntentQueue::new();
        q.push(Intent::Start);
        q.push(Intent::Restart);
        assert_eq!(drain(&q), vec![Intent::Restart]);
    }

    #[test]
    fn restart_overrides_pending_stop() {
        let q = IntentQueue::new();
        q.push(Intent::Stop);
        q.push(Intent::Restart);
        assert_eq!(drain(&q), vec![Intent::Restart]);
    }

    #[test]
    fn reinstall_overrides_pending_restart() {
        let q = IntentQueue::new();
        q.push(Intent::Restart);
        q.push(Intent::Reinstall);
        assert_eq!(drain(&q), vec![Intent::Reinstall]);
    }

    #[test]
    fn restart_never_overrides_pending_reinstall() {
        let q = IntentQueue::new();
        q.push(Intent::Reinstall);
        q.push(Intent::Restart);
        assert_eq!(drain(&q), vec![Intent::Reinstall]);
    }

    #[test]
    fn start_absorbed_by_pending_reinstall() {
        let q = IntentQueue::new();
        q.push(Intent::Reinstall);
        q.push(Intent::Start);
        assert_eq!(drain(&q), vec![Intent::Reinstall]);
    }

    #[test]
    fn stop_replaces_pending_start() {
        let q = IntentQueue::new();
        q.push(Intent::Start);
        q.push(Intent::Stop);
        assert_eq!(drain(&q), vec![Intent::Stop]);
    }

    #[test]
    fn push_if_empty_never_overrides() {
        let q = IntentQueue::new();
        q.push(Intent::Stop);
        q.push_if_empty(Intent::Start);
        assert_eq!(drain(&q), vec![Intent::Stop]);
        q.push_if_empty(Intent::Start);
        assert_eq!(drain(&q), vec![Intent::Start]);
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let q = IntentQueue::new();
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.pop().await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        q.push(Intent::Start);
        assert_eq!(waiter.await.unwrap(), Intent::Start);
    }
}
