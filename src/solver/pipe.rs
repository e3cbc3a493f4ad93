//! The pipe: a one-request bidirectional channel between two endpoints.
//!
//! The sender (producer side) publishes interim updates and exactly one
//! completion; the receiver consumes the latest update and may cancel.
//! Status transitions are strictly monotonic. Completion callbacks never
//! run while the pipe's internal lock is held; they only signal the
//! scheduler's wake queue.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::core::cancel::CancelToken;

use super::error::SolveError;

/// Process-unique pipe identity. Edges match pipe updates against their
/// in-flight requests by id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipeId(u64);

impl PipeId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipeState {
    Initial,
    Running,
    Completed,
    Cancelled,
}

impl PipeState {
    pub fn done(self) -> bool {
        matches!(self, PipeState::Completed | PipeState::Cancelled)
    }
}

/// Snapshot of a pipe's visible state.
#[derive(Clone, Debug)]
pub struct PipeStatus<V: Clone> {
    pub state: PipeState,
    pub value: Option<V>,
    pub error: Option<Arc<SolveError>>,
}

impl<V: Clone> PipeStatus<V> {
    pub fn done(&self) -> bool {
        self.state.done()
    }
}

pub type PipeCallback = Arc<dyn Fn() + Send + Sync>;

struct PipeInner<V> {
    state: PipeState,
    value: Option<V>,
    error: Option<Arc<SolveError>>,
    fresh: bool,
}

struct PipeShared<Req, V> {
    id: PipeId,
    request: Req,
    token: CancelToken,
    inner: Mutex<PipeInner<V>>,
    on_send: Mutex<Option<PipeCallback>>,
    on_receive: Mutex<Option<PipeCallback>>,
}

impl<Req, V> PipeShared<Req, V> {
    fn fire_on_send(&self) {
        let cb = self.on_send.lock().expect("pipe callback lock").clone();
        if let Some(cb) = cb {
            cb();
        }
    }

    fn fire_on_receive(&self) {
        let cb = self.on_receive.lock().expect("pipe callback lock").clone();
        if let Some(cb) = cb {
            cb();
        }
    }
}

/// Both halves of one pipe.
pub struct Pipe<Req, V: Clone> {
    pub sender: PipeSender<Req, V>,
    pub receiver: PipeReceiver<Req, V>,
}

impl<Req, V: Clone> Pipe<Req, V> {
    pub fn new(request: Req) -> Self {
        let shared = Arc::new(PipeShared {
            id: PipeId::next(),
            request,
            token: CancelToken::new(),
            inner: Mutex::new(PipeInner {
                state: PipeState::Initial,
                value: None,
                error: None,
                fresh: false,
            }),
            on_send: Mutex::new(None),
            on_receive: Mutex::new(None),
        });
        Pipe {
            sender: PipeSender {
                shared: Arc::clone(&shared),
            },
            receiver: PipeReceiver { shared },
        }
    }
}

/// Producer half.
pub struct PipeSender<Req, V: Clone> {
    shared: Arc<PipeShared<Req, V>>,
}

impl<Req, V: Clone> Clone for PipeSender<Req, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<Req, V: Clone> PipeSender<Req, V> {
    pub fn id(&self) -> PipeId {
        self.shared.id
    }

    pub fn request(&self) -> &Req {
        &self.shared.request
    }

    pub fn status(&self) -> PipeStatus<V> {
        status(&self.shared)
    }

    /// Publish an interim (non-final) update. Returns false if the pipe is
    /// already done.
    pub fn update(&self, value: V) -> bool {
        {
            let mut inner = self.shared.inner.lock().expect("pipe lock poisoned");
            if inner.state.done() {
                return false;
            }
            inner.state = PipeState::Running;
            inner.value = Some(value);
            inner.fresh = true;
        }
        self.shared.fire_on_send();
        true
    }

    /// Complete the pipe with a value. Returns false (value not delivered)
    /// if the pipe is already done.
    pub fn finalize(&self, value: V) -> bool {
        {
            let mut inner = self.shared.inner.lock().expect("pipe lock poisoned");
            if inner.state.done() {
                return false;
            }
            inner.state = PipeState::Completed;
            inner.value = Some(value);
            inner.fresh = true;
        }
        self.shared.fire_on_send();
        true
    }

    /// Complete the pipe with an error.
    pub fn finalize_err(&self, error: Arc<SolveError>) -> bool {
        {
            let mut inner = self.shared.inner.lock().expect("pipe lock poisoned");
            if inner.state.done() {
                return false;
            }
            inner.state = PipeState::Completed;
            inner.error = Some(error);
            inner.fresh = true;
        }
        self.shared.fire_on_send();
        true
    }

    pub fn cancel(&self) {
        cancel(&self.shared);
    }

    pub(crate) fn set_on_send(&self, cb: PipeCallback) {
        *self.shared.on_send.lock().expect("pipe callback lock") = Some(cb);
    }
}

/// Consumer half.
pub struct PipeReceiver<Req, V: Clone> {
    shared: Arc<PipeShared<Req, V>>,
}

impl<Req, V: Clone> Clone for PipeReceiver<Req, V> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<Req, V: Clone> PipeReceiver<Req, V> {
    pub fn id(&self) -> PipeId {
        self.shared.id
    }

    pub fn request(&self) -> &Req {
        &self.shared.request
    }

    /// Consume the latest update. True when new data was observed since the
    /// previous call; always false once a done status has been consumed.
    pub fn receive(&self) -> bool {
        let mut inner = self.shared.inner.lock().expect("pipe lock poisoned");
        std::mem::take(&mut inner.fresh)
    }

    pub fn status(&self) -> PipeStatus<V> {
        status(&self.shared)
    }

    pub fn state(&self) -> PipeState {
        self.shared.inner.lock().expect("pipe lock poisoned").state
    }

    /// Take ownership of the delivered value, leaving the status empty. Used
    /// when the value carries resources with release obligations.
    pub fn take_value(&self) -> Option<V> {
        self.shared
            .inner
            .lock()
            .expect("pipe lock poisoned")
            .value
            .take()
    }

    pub fn cancel(&self) {
        cancel(&self.shared);
    }

    /// The token cancelled together with this pipe. Function-backed workers
    /// observe cancellation through it.
    pub fn token(&self) -> &CancelToken {
        &self.shared.token
    }

    pub(crate) fn set_on_receive(&self, cb: PipeCallback) {
        *self.shared.on_receive.lock().expect("pipe callback lock") = Some(cb);
    }
}

fn status<Req, V: Clone>(shared: &PipeShared<Req, V>) -> PipeStatus<V> {
    let inner = shared.inner.lock().expect("pipe lock poisoned");
    PipeStatus {
        state: inner.state,
        value: inner.value.clone(),
        error: inner.error.clone(),
    }
}

fn cancel<Req, V: Clone>(shared: &PipeShared<Req, V>) {
    let fired = {
        let mut inner = shared.inner.lock().expect("pipe lock poisoned");
        if inner.state.done() {
            false
        } else {
            inner.state = PipeState::Cancelled;
            inner.error = Some(Arc::new(SolveError::Cancelled));
            inner.fresh = true;
            true
        }
    };
    if fired {
        shared.token.cancel();
        shared.fire_on_send();
        shared.fire_on_receive();
    }
}

/// A pipe completed by a worker thread.
///
/// `start` spawns the worker; its return value finalizes the pipe. If the
/// pipe was cancelled first, the undelivered value is handed to `dispose`.
pub fn function_pipe<Req, V, F, D>(request: Req, f: F, dispose: D) -> (Pipe<Req, V>, impl FnOnce())
where
    Req: Send + Sync + 'static,
    V: Clone + Send + 'static,
    F: FnOnce(&CancelToken) -> Result<V, Arc<SolveError>> + Send + 'static,
    D: Fn(V) + Send + 'static,
{
    let pipe = Pipe::new(request);
    let sender = pipe.sender.clone();
    let token = pipe.receiver.token().clone();
    let start = move || {
        std::thread::spawn(move || match f(&token) {
            Ok(value) => {
                let delivered = sender.finalize(value.clone());
                if !delivered {
                    dispose(value);
                }
            }
            Err(err) => {
                sender.finalize_err(err);
            }
        });
    };
    (pipe, start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn update_then_finalize() {
        let pipe: Pipe<(), u32> = Pipe::new(());
        assert!(!pipe.receiver.receive());

        assert!(pipe.sender.update(1));
        assert!(pipe.receiver.receive());
        assert!(!pipe.receiver.receive());
        assert_eq!(pipe.receiver.status().state, PipeState::Running);

        assert!(pipe.sender.finalize(2));
        assert!(pipe.receiver.receive());
        let status = pipe.receiver.status();
        assert_eq!(status.state, PipeState::Completed);
        assert_eq!(status.value, Some(2));

        // completed: no new data, no further sends
        assert!(!pipe.receiver.receive());
        assert!(!pipe.sender.finalize(3));
        assert_eq!(pipe.receiver.status().value, Some(2));
    }

    #[test]
    fn cancel_is_idempotent_and_final() {
        let pipe: Pipe<(), u32> = Pipe::new(());
        pipe.receiver.cancel();
        pipe.receiver.cancel();
        let status = pipe.receiver.status();
        assert_eq!(status.state, PipeState::Cancelled);
        assert!(matches!(
            status.error.as_deref(),
            Some(SolveError::Cancelled)
        ));
        assert!(pipe.receiver.token().is_cancelled());
        // cancel after completion is a no-op
        let pipe2: Pipe<(), u32> = Pipe::new(());
        pipe2.sender.finalize(7);
        pipe2.receiver.cancel();
        assert_eq!(pipe2.receiver.status().state, PipeState::Completed);
    }

    #[test]
    fn callbacks_fire_on_the_right_side() {
        let pipe: Pipe<(), u32> = Pipe::new(());
        let sends = Arc::new(AtomicUsize::new(0));
        let receives = Arc::new(AtomicUsize::new(0));
        {
            let sends = Arc::clone(&sends);
            pipe.sender.set_on_send(Arc::new(move || {
                sends.fetch_add(1, Ordering::SeqCst);
            }));
        }
        {
            let receives = Arc::clone(&receives);
            pipe.receiver.set_on_receive(Arc::new(move || {
                receives.fetch_add(1, Ordering::SeqCst);
            }));
        }

        pipe.sender.update(1);
        assert_eq!(sends.load(Ordering::SeqCst), 1);
        assert_eq!(receives.load(Ordering::SeqCst), 0);

        pipe.sender.finalize(2);
        assert_eq!(sends.load(Ordering::SeqCst), 2);
        assert_eq!(receives.load(Ordering::SeqCst), 0);

        // cancel fires both exactly once
        let pipe2: Pipe<(), u32> = Pipe::new(());
        {
            let sends = Arc::clone(&sends);
            pipe2.sender.set_on_send(Arc::new(move || {
                sends.fetch_add(1, Ordering::SeqCst);
            }));
            let receives = Arc::clone(&receives);
            pipe2.receiver.set_on_receive(Arc::new(move || {
                receives.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pipe2.receiver.cancel();
        pipe2.receiver.cancel();
        assert_eq!(sends.load(Ordering::SeqCst), 3);
        assert_eq!(receives.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn function_pipe_delivers_result() {
        let (pipe, start) = function_pipe((), |_t| Ok(41u32 + 1), |_| {});
        start();
        // worker finalizes asynchronously
        for _ in 0..200 {
            if pipe.receiver.state().done() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        let status = pipe.receiver.status();
        assert_eq!(status.state, PipeState::Completed);
        assert_eq!(status.value, Some(42));
    }

    #[test]
    fn function_pipe_cancellation_reaches_worker_and_disposes() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let disposed2 = Arc::clone(&disposed);
        let (pipe, start) = function_pipe(
            (),
            |token: &CancelToken| {
                // block until cancelled, then report a late value
                let _ = token.subscribe().recv();
                Ok(7u32)
            },
            move |_v| {
                disposed2.fetch_add(1, Ordering::SeqCst);
            },
        );
        start();
        pipe.receiver.cancel();
        for _ in 0..200 {
            if disposed.load(Ordering::SeqCst) == 1 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        assert_eq!(pipe.receiver.status().state, PipeState::Cancelled);
    }

    #[test]
    fn take_value_empties_the_status() {
        let pipe: Pipe<(), u32> = Pipe::new(());
        pipe.sender.finalize(9);
        assert_eq!(pipe.receiver.take_value(), Some(9));
        assert_eq!(pipe.receiver.take_value(), None);
        assert!(pipe.receiver.status().value.is_none());
    }
}
