//! Cancellation tokens.
//!
//! Workers never take the scheduler lock; cancellation reaches them through a
//! token carried by their pipe. Tokens form a tree: cancelling a parent
//! cancels every child, so a build-level token fans out to all workers spawned
//! on its behalf.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crossbeam::channel::{bounded, Receiver, Sender};

#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    waiters: Mutex<Vec<Sender<()>>>,
    children: Mutex<Vec<Weak<CancelInner>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Cancel this token and every child derived from it. Idempotent.
    pub fn cancel(&self) {
        cancel_inner(&self.inner);
    }

    /// Derive a child token. A child born of a cancelled parent is already
    /// cancelled.
    pub fn child(&self) -> CancelToken {
        let child = CancelToken::new();
        if self.is_cancelled() {
            child.cancel();
            return child;
        }
        self.inner
            .children
            .lock()
            .expect("cancel children lock poisoned")
            .push(Arc::downgrade(&child.inner));
        // cancel raced with registration: make sure the child observes it
        if self.is_cancelled() {
            child.cancel();
        }
        child
    }

    /// A receiver that becomes ready when the token is cancelled. If the
    /// token is already cancelled the receiver is ready immediately.
    pub fn subscribe(&self) -> Receiver<()> {
        let (tx, rx) = bounded(1);
        if self.is_cancelled() {
            let _ = tx.send(());
            return rx;
        }
        self.inner
            .waiters
            .lock()
            .expect("cancel waiters lock poisoned")
            .push(tx);
        if self.is_cancelled() {
            // raced: the cancel pass may have drained before our push
            notify_waiters(&self.inner);
        }
        rx
    }
}

fn cancel_inner(inner: &Arc<CancelInner>) {
    if inner.cancelled.swap(true, Ordering::AcqRel) {
        return;
    }
    notify_waiters(inner);
    let children = std::mem::take(
        &mut *inner
            .children
            .lock()
            .expect("cancel children lock poisoned"),
    );
    for child in children {
        if let Some(child) = child.upgrade() {
            cancel_inner(&child);
        }
    }
}

fn notify_waiters(inner: &Arc<CancelInner>) {
    let waiters = std::mem::take(
        &mut *inner
            .waiters
            .lock()
            .expect("cancel waiters lock poisoned"),
    );
    for tx in waiters {
        let _ = tx.try_send(());
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_idempotent() {
        let t = CancelToken::new();
        assert!(!t.is_cancelled());
        t.cancel();
        t.cancel();
        assert!(t.is_cancelled());
    }

    #[test]
    fn subscribe_fires_on_cancel() {
        let t = CancelToken::new();
        let rx = t.subscribe();
        assert!(rx.try_recv().is_err());
        t.cancel();
        assert!(rx.recv().is_ok());
    }

    #[test]
    fn subscribe_after_cancel_is_ready() {
        let t = CancelToken::new();
        t.cancel();
        assert!(t.subscribe().recv().is_ok());
    }

    #[test]
    fn child_inherits_cancellation() {
        let parent = CancelToken::new();
        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());

        let late = parent.child();
        assert!(late.is_cancelled());
    }

    #[test]
    fn child_cancel_does_not_reach_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
    }
}
