//! Event Ingestor
//!
//! Fans watch/poll adapter output in as [`IngestEvent`]s and dispatches
//! them to a registry of subscriber callbacks, serialized per dispatch
//! subject (a worker id or endpoint name) so a slow subscriber for one
//! worker never reorders events for another. A `SubscriptionId` keyed map
//! behind a `tokio::sync::RwLock`, plus the teacher's "one bounded channel per
//! logical stream, drop rather than block the producer" posture
//! (`scaler.rs`'s `tasks: VecDeque` spawn-and-drain loop) generalized here
//! to a bounded, drop-oldest-on-overflow queue per subject.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{event, Level};

use crate::models::IngestEvent;

use super::cancellation::CancellationToken;

/// Per-subject queue capacity; once full, the oldest queued event is
/// dropped to make room for the newest one rather than blocking the
/// publisher
const QUEUE_CAPACITY: usize = 1024;

/// A handle identifying a registered subscriber, used to unsubscribe later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Box<dyn Fn(IngestEvent) + Send + Sync>;

struct SubjectQueue {
    events: Mutex<VecDeque<IngestEvent>>,
    notify: Notify,
}

impl SubjectQueue {
    fn new() -> Self {
        SubjectQueue {
            events: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    async fn push(&self, event: IngestEvent) {
        let mut queue = self.events.lock().await;
        if queue.len() >= QUEUE_CAPACITY {
            queue.pop_front();
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }

    async fn drain(&self) -> Vec<IngestEvent> {
        let mut queue = self.events.lock().await;
        queue.drain(..).collect()
    }
}

/// Fans events in from any number of provider watch adapters and
/// dispatches them, in per-subject order, to every registered subscriber
pub struct EventIngestor {
    subscribers: Arc<RwLock<HashMap<SubscriptionId, Callback>>>,
    next_id: AtomicU64,
    subjects: Mutex<HashMap<String, Arc<SubjectQueue>>>,
    cancel: CancellationToken,
}

impl EventIngestor {
    #[must_use]
    pub fn new(cancel: CancellationToken) -> Self {
        EventIngestor {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            subjects: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    /// Register a callback invoked for every event, regardless of subject.
    /// Panics inside `callback` are caught and logged; they never take down
    /// the dispatch loop
    pub async fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(IngestEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.subscribers.write().await.insert(id, Box::new(callback));
        id
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.write().await.remove(&id);
    }

    /// Publish one event: route it to its subject's queue, spawning a
    /// dispatch loop for that subject the first time it's seen
    pub async fn publish(&self, event: IngestEvent) {
        let subject = event.subject().to_string();
        let queue = {
            let mut subjects = self.subjects.lock().await;
            if let Some(existing) = subjects.get(&subject) {
                existing.clone()
            } else {
                let queue = Arc::new(SubjectQueue::new());
                subjects.insert(subject.clone(), queue.clone());
                self.spawn_subject_dispatcher(subject, queue.clone());
                queue
            }
        };
        queue.push(event).await;
    }

    /// One dispatch loop per subject: drains the queue in FIFO order and
    /// calls every subscriber in turn, so a worker's events are never
    /// processed out of order relative to each other
    fn spawn_subject_dispatcher(&self, subject: String, queue: Arc<SubjectQueue>) {
        let subscribers = self.subscribers.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = queue.notify.notified() => {
                        for ev in queue.drain().await {
                            let subs = subscribers.read().await;
                            for callback in subs.values() {
                                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| callback(ev.clone())));
                                if let Err(panic) = outcome {
                                    let msg = panic
                                        .downcast_ref::<&str>()
                                        .map(|s| s.to_string())
                                        .or_else(|| panic.downcast_ref::<String>().cloned())
                                        .unwrap_or_else(|| "unknown panic".to_string());
                                    event!(Level::ERROR, subject = %subject, panic = %msg, "ingestor subscriber panicked, isolated");
                                }
                            }
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WorkerObservation;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn status_event(worker_id: &str) -> IngestEvent {
        IngestEvent::WorkerStatusChange(WorkerObservation {
            worker_id: worker_id.to_string(),
            endpoint: "e1".to_string(),
            phase: "Running".into(),
            status: "ok".into(),
            reason: None,
            message: None,
            ip: None,
            node: None,
            healthy: true,
            created_at: None,
            started_at: None,
        })
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let ingestor = EventIngestor::new(CancellationToken::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        ingestor.subscribe(move |_ev| { seen2.fetch_add(1, Ordering::SeqCst); }).await;
        ingestor.publish(status_event("w1")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn events_for_same_subject_dispatch_in_order() {
        let ingestor = EventIngestor::new(CancellationToken::new());
        let order = Arc::new(Mutex::new(Vec::new()));
        let order2 = order.clone();
        ingestor
            .subscribe(move |ev| {
                if let IngestEvent::WorkerStatusChange(obs) = ev {
                    let order2 = order2.clone();
                    tokio::spawn(async move {
                        order2.lock().await.push(obs.phase.clone());
                    });
                }
            })
            .await;
        for phase in ["Pending", "Running", "Running"] {
            let mut obs = match status_event("w1") {
                IngestEvent::WorkerStatusChange(o) => o,
                _ => unreachable!(),
            };
            obs.phase = phase.to_string();
            ingestor.publish(IngestEvent::WorkerStatusChange(obs)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*order.lock().await, vec!["Pending", "Running", "Running"]);
    }

    #[tokio::test]
    async fn a_panicking_subscriber_does_not_stop_dispatch() {
        let ingestor = EventIngestor::new(CancellationToken::new());
        let seen = Arc::new(AtomicUsize::new(0));
        ingestor.subscribe(|_ev| panic!("boom")).await;
        let seen2 = seen.clone();
        ingestor.subscribe(move |_ev| { seen2.fetch_add(1, Ordering::SeqCst); }).await;
        ingestor.publish(status_event("w1")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let ingestor = EventIngestor::new(CancellationToken::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let id = ingestor.subscribe(move |_ev| { seen2.fetch_add(1, Ordering::SeqCst); }).await;
        ingestor.unsubscribe(id).await;
        ingestor.publish(status_event("w1")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
