//! A lightweight cancellation token
//!
//! A root cancellation token that propagates to every long-lived task,
//! back-end call, and subscriber callback. A full
//! `tokio-util::sync::CancellationToken` is the obvious idiomatic choice,
//! but it is not part of the teacher's dependency stack, so this is a small
//! home-grown equivalent built from primitives the teacher already depends
//! on (`tokio::sync::Notify`, `std::sync::atomic`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        CancellationToken {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Signal cancellation to every clone of this token
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once this token is cancelled; cheap to poll in a `select!`
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
