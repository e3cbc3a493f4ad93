//! The scheduler dispatcher.
//!
//! A single dedicated thread owns all edge state: it pops edges off a FIFO
//! wake queue and runs their `unpark` under the dispatch mutex. Workers and
//! consumers influence the loop only by completing pipes; pipe callbacks
//! touch nothing but the wake queue, so they can fire from any thread without
//! deadlocking the dispatcher.
//!
//! After every unpark the dispatcher prunes completed pipes, attempts an
//! index merge if the edge's keys changed, and checks two tripwires: an edge
//! returning with open incoming but no open outgoing (or the inverse) is an
//! algorithm bug in the state machine and fails the edge with an internal
//! error.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam::channel::bounded;

use crate::cache::CacheManager;
use crate::core::cancel::CancelToken;
use crate::core::digest::Digest;
use crate::core::vertex::{Edge, Vertex};

use super::debug;
use super::edge::{EdgeNode, EdgeRequest, EdgeStatus, PipeValue};
use super::error::SolveError;
use super::index::{EdgeId, GraphIndex, KeyIndex};
use super::metrics::Metrics;
use super::pipe::{Pipe, PipeId};

/// A solver pipe plus its endpoint edges. `target` is the producer, `from`
/// the consumer; a merge retargets them, so they sit behind their own locks.
pub(crate) struct EdgePipe {
    pub pipe: Pipe<EdgeRequest, PipeValue>,
    pub target: Mutex<Option<EdgeId>>,
    pub from: Mutex<Option<EdgeId>>,
}

impl EdgePipe {
    fn target_id(&self) -> Option<EdgeId> {
        *self.target.lock().expect("pipe target lock")
    }

    fn from_id(&self) -> Option<EdgeId> {
        *self.from.lock().expect("pipe from lock")
    }
}

struct WakeQueue {
    fifo: VecDeque<EdgeId>,
    pending: HashSet<EdgeId>,
    stopped: bool,
}

impl WakeQueue {
    fn pop(&mut self) -> Option<EdgeId> {
        let id = self.fifo.pop_front()?;
        self.pending.remove(&id);
        Some(id)
    }
}

pub(crate) struct SolverState {
    pub edges: HashMap<EdgeId, EdgeNode>,
    pub incoming: HashMap<EdgeId, Vec<Arc<EdgePipe>>>,
    pub outgoing: HashMap<EdgeId, Vec<Arc<EdgePipe>>>,
    pub graph: GraphIndex,
    pub keys: KeyIndex,
    cache: Arc<dyn CacheManager>,
    metrics: Arc<Metrics>,
}

impl SolverState {
    /// Live edge for this (vertex, output), created on first reference.
    /// Returns None when the vertex was never loaded into the graph.
    pub(crate) fn get_edge(&mut self, edge: &Edge) -> Option<EdgeId> {
        if let Some(id) = self.graph.edge(edge) {
            return Some(id);
        }
        let (vertex, op) = {
            let entry = self.graph.vertex(&edge.vertex.digest())?;
            (Arc::clone(&entry.vertex), Arc::clone(&entry.op))
        };
        let canonical = Edge::new(vertex, edge.output);
        let id = self.graph.alloc_id();
        let node = EdgeNode::new(
            id,
            canonical.clone(),
            op,
            Arc::clone(&self.cache),
            Arc::clone(&self.metrics),
        );
        self.graph.register_edge(&canonical, id);
        self.edges.insert(id, node);
        Some(id)
    }

    /// Destroy one edge: release what it owns and drop its index claims.
    pub(crate) fn destroy_edge(&mut self, id: EdgeId) {
        if let Some(mut node) = self.edges.remove(&id) {
            node.release_owned();
        }
        self.keys.release_edge(id);
        self.incoming.remove(&id);
        self.outgoing.remove(&id);
    }

    fn release_all(&mut self) {
        for pipes in self.outgoing.values() {
            for pipe in pipes {
                if !pipe.pipe.receiver.state().done() {
                    pipe.pipe.receiver.cancel();
                }
                if let Some(value) = pipe.pipe.receiver.take_value() {
                    value.release_resources();
                }
            }
        }
        for pipes in self.incoming.values() {
            for pipe in pipes {
                if !pipe.pipe.sender.status().state.done() {
                    pipe.pipe.sender.cancel();
                }
            }
        }
        self.incoming.clear();
        self.outgoing.clear();
        for (_, node) in self.edges.iter_mut() {
            node.release_owned();
        }
    }
}

pub(crate) struct SchedInner {
    state: Mutex<SolverState>,
    wakeq: Mutex<WakeQueue>,
    cond: Condvar,
    metrics: Arc<Metrics>,
}

/// Creates pipes on behalf of the edge currently being unparked.
pub(crate) struct PipeFactory<'a> {
    from: EdgeId,
    state: &'a mut SolverState,
    inner: &'a Arc<SchedInner>,
}

impl PipeFactory<'_> {
    /// Open a request pipe to the edge producing `target`.
    pub(crate) fn new_input_request(&mut self, target: &Edge, req: EdgeRequest) -> PipeId {
        let Some(target_id) = self.state.get_edge(target) else {
            debug::inconsistent_graph(target.vertex.name());
            let name = target.vertex.name().to_string();
            let digest = target.vertex.digest();
            return self.new_func_request(move |_token| {
                Err(Arc::new(SolveError::Internal(format!(
                    "failed to get edge: inconsistent graph state in edge {} {:?}",
                    name, digest
                ))))
            });
        };
        let edge_pipe = Arc::new(EdgePipe {
            pipe: Pipe::new(req),
            target: Mutex::new(Some(target_id)),
            from: Mutex::new(Some(self.from)),
        });
        install_callbacks(self.inner, &edge_pipe);
        let id = edge_pipe.pipe.receiver.id();
        self.state
            .incoming
            .entry(target_id)
            .or_default()
            .push(Arc::clone(&edge_pipe));
        self.state
            .outgoing
            .entry(self.from)
            .or_default()
            .push(edge_pipe);
        self.inner.signal(target_id);
        id
    }

    /// Spawn a worker whose completion finalizes a new pipe.
    pub(crate) fn new_func_request(
        &mut self,
        f: impl FnOnce(&CancelToken) -> Result<PipeValue, Arc<SolveError>> + Send + 'static,
    ) -> PipeId {
        let (pipe, start) = super::pipe::function_pipe(
            EdgeRequest {
                desired: EdgeStatus::Complete,
            },
            f,
            |value: PipeValue| value.release_resources(),
        );
        let edge_pipe = Arc::new(EdgePipe {
            pipe,
            target: Mutex::new(None),
            from: Mutex::new(Some(self.from)),
        });
        install_callbacks(self.inner, &edge_pipe);
        let id = edge_pipe.pipe.receiver.id();
        self.state
            .outgoing
            .entry(self.from)
            .or_default()
            .push(edge_pipe);
        start();
        id
    }

    /// Cancel one of the current edge's outgoing pipes (request escalation).
    pub(crate) fn cancel_outgoing_pipe(&mut self, id: PipeId) {
        if let Some(pipes) = self.state.outgoing.get(&self.from) {
            if let Some(pipe) = pipes.iter().find(|p| p.pipe.receiver.id() == id) {
                pipe.pipe.receiver.cancel();
            }
        }
    }
}

/// Wire a pipe's completion callbacks to the wake queue. Callbacks hold weak
/// references: a torn-down scheduler ignores late completions.
fn install_callbacks(inner: &Arc<SchedInner>, edge_pipe: &Arc<EdgePipe>) {
    let weak_inner = Arc::downgrade(inner);
    let weak_pipe = Arc::downgrade(edge_pipe);
    edge_pipe.pipe.sender.set_on_send(Arc::new({
        let weak_inner = weak_inner.clone();
        let weak_pipe = weak_pipe.clone();
        move || {
            if let (Some(inner), Some(pipe)) = (weak_inner.upgrade(), weak_pipe.upgrade()) {
                if let Some(from) = pipe.from_id() {
                    inner.signal(from);
                }
            }
        }
    }));
    edge_pipe.pipe.receiver.set_on_receive(Arc::new(move || {
        if let (Some(inner), Some(pipe)) = (weak_inner.upgrade(), weak_pipe.upgrade()) {
            if let Some(target) = pipe.target_id() {
                inner.signal(target);
            }
        }
    }));
}

impl SchedInner {
    /// Enqueue an edge for dispatch. Idempotent while the edge is pending.
    pub(crate) fn signal(&self, id: EdgeId) {
        let mut q = self.wakeq.lock().expect("wake queue lock poisoned");
        if q.stopped {
            return;
        }
        if q.pending.insert(id) {
            q.fifo.push_back(id);
            self.metrics.signals.increment();
            self.cond.notify_one();
        }
    }

    fn run_loop(self: Arc<Self>) {
        loop {
            let id = {
                let mut q = self.wakeq.lock().expect("wake queue lock poisoned");
                loop {
                    if q.stopped {
                        return;
                    }
                    if let Some(id) = q.pop() {
                        break id;
                    }
                    q = self.cond.wait(q).expect("wake queue lock poisoned");
                }
            };
            self.dispatch(id);
        }
    }

    fn dispatch(self: &Arc<Self>, id: EdgeId) {
        let mut st = self.state.lock().expect("solver state lock poisoned");
        let Some(mut node) = st.edges.remove(&id) else {
            return; // merged away or destroyed while queued
        };
        self.metrics.dispatches.increment();

        let incoming: Vec<Arc<EdgePipe>> = st.incoming.get(&id).cloned().unwrap_or_default();
        let outgoing: Vec<Arc<EdgePipe>> = st.outgoing.get(&id).cloned().unwrap_or_default();

        node.has_active_outgoing = false;
        let mut updates = Vec::new();
        for pipe in &outgoing {
            if pipe.pipe.receiver.receive() {
                updates.push(Arc::clone(pipe));
            }
            if !pipe.pipe.receiver.state().done() {
                node.has_active_outgoing = true;
            }
        }

        debug::pre_unpark(&node, incoming.len(), updates.len(), outgoing.len());
        {
            let mut pf = PipeFactory {
                from: id,
                state: &mut *st,
                inner: self,
            };
            node.unpark(&incoming, &updates, &outgoing, &mut pf);
        }
        debug::post_unpark(&node, incoming.len());

        let keys_changed = std::mem::take(&mut node.keys_did_change);
        st.edges.insert(id, node);

        let open_incoming = prune(&mut st.incoming, id, |p| !p.pipe.sender.status().state.done());
        let open_outgoing = prune(&mut st.outgoing, id, |p| !p.pipe.receiver.state().done());

        if keys_changed {
            self.try_merge(&mut st, id);
        }

        // post-unpark tripwires: these can only come from algorithm bugs in
        // unpark, never from external input
        if st.edges.contains_key(&id) {
            if open_incoming > 0 && open_outgoing == 0 {
                self.mark_failed(&mut st, id, "return leaving incoming open");
            } else if open_incoming == 0 && open_outgoing > 0 {
                self.mark_failed(&mut st, id, "return leaving outgoing open");
            }
        }
    }

    fn mark_failed(&self, st: &mut SolverState, id: EdgeId, msg: &str) {
        tracing::error!(id = ?id, msg, "scheduler tripwire");
        let incoming: Vec<Arc<EdgePipe>> = st.incoming.get(&id).cloned().unwrap_or_default();
        let outgoing: Vec<Arc<EdgePipe>> = st.outgoing.get(&id).cloned().unwrap_or_default();
        if let Some(node) = st.edges.get_mut(&id) {
            node.fail(Arc::new(SolveError::Internal(msg.to_string())));
            node.finalize_incoming(&incoming);
        }
        for pipe in &outgoing {
            if !pipe.pipe.receiver.state().done() {
                pipe.pipe.receiver.cancel();
            }
            if let Some(value) = pipe.pipe.receiver.take_value() {
                value.release_resources();
            }
        }
        prune(&mut st.incoming, id, |p| !p.pipe.sender.status().state.done());
        prune(&mut st.outgoing, id, |p| !p.pipe.receiver.state().done());
    }

    // ------------------------------------------------------------------
    // merge
    // ------------------------------------------------------------------

    fn try_merge(self: &Arc<Self>, st: &mut SolverState, id: EdgeId) {
        let Some(key) = st.edges.get(&id).and_then(|e| e.augmented_key()) else {
            return; // no index key until at least one key per dep is known
        };
        let Some(orig) = st.keys.load_or_store(&key, id) else {
            return;
        };
        if is_dep(st, id, orig) || is_dep(st, orig, id) {
            debug::merge_skipped(id, orig, "dependency");
            self.metrics.merges_skipped.increment();
            return;
        }
        let (Some(orig_edge), Some(own_edge)) = (
            st.edges.get(&orig).map(|e| e.edge.clone()),
            st.edges.get(&id).map(|e| e.edge.clone()),
        ) else {
            return;
        };
        let (mut dest, mut src) = (orig, id);
        if st.graph.has_owner(&orig_edge, &own_edge) {
            // the owned edge wins: its external consumer set is the larger one
            std::mem::swap(&mut dest, &mut src);
        }
        if !merge_allowed(st, dest, src) {
            debug::merge_skipped(src, dest, "options");
            self.metrics.merges_skipped.increment();
            return;
        }
        debug::merging_edges(src, dest);
        self.merge_to(st, dest, src);
        self.metrics.merges.increment();
    }

    /// Merge `src` into `dest`. The source edge is unreachable afterwards.
    fn merge_to(self: &Arc<Self>, st: &mut SolverState, dest: EdgeId, src: EdgeId) {
        let Some(mut src_node) = st.edges.remove(&src) else {
            return;
        };
        let folded = src_node.export_dep_keys();

        // consumers of src become consumers of dest
        let src_incoming = st.incoming.remove(&src).unwrap_or_default();
        for pipe in &src_incoming {
            *pipe.target.lock().expect("pipe target lock") = Some(dest);
        }
        st.incoming.entry(dest).or_default().extend(src_incoming);

        // src's outgoing work is abandoned; dest re-subscribes through its
        // own requests
        for pipe in st.outgoing.remove(&src).unwrap_or_default() {
            if !pipe.pipe.receiver.state().done() {
                pipe.pipe.receiver.cancel();
            }
            if let Some(value) = pipe.pipe.receiver.take_value() {
                value.release_resources();
            }
        }

        src_node.release_owned();
        st.keys.transfer(src, dest);
        st.graph.set_edge(src, dest);

        if let Some(dest_node) = st.edges.get_mut(&dest) {
            dest_node.absorb_secondary(folded);
        }
        if let Some(dest_node) = st.edges.get(&dest) {
            // dest may already be published: extend its cache associations
            dest_node.reexport_associations();
        }
        self.signal(dest);
    }
}

fn merge_allowed(st: &SolverState, dest: EdgeId, src: EdgeId) -> bool {
    let (Some(dest_node), Some(src_node)) = (st.edges.get(&dest), st.edges.get(&src)) else {
        return false;
    };
    let dest_opts = dest_node.edge.vertex.options();
    let src_opts = src_node.edge.vertex.options();
    if dest_opts.skip_merge || src_opts.skip_merge {
        return false;
    }
    // absorbing an ignore-cache edge into a cached one would weaken the
    // target's semantics
    if !dest_opts.ignore_cache && src_opts.ignore_cache {
        return false;
    }
    true
}

/// True when `b`'s vertex is reachable from `a`'s inputs: merging them would
/// create a cycle.
fn is_dep(st: &SolverState, a: EdgeId, b: EdgeId) -> bool {
    let (Some(a_node), Some(b_node)) = (st.edges.get(&a), st.edges.get(&b)) else {
        return false;
    };
    let target = b_node.edge.vertex.digest();
    let mut visited: HashSet<Digest> = HashSet::new();
    let mut stack: Vec<Arc<dyn Vertex>> = a_node
        .edge
        .vertex
        .inputs()
        .iter()
        .map(|e| Arc::clone(&e.vertex))
        .collect();
    while let Some(vertex) = stack.pop() {
        let digest = vertex.digest();
        if !visited.insert(digest) {
            continue;
        }
        if digest == target {
            return true;
        }
        stack.extend(vertex.inputs().iter().map(|e| Arc::clone(&e.vertex)));
    }
    false
}

fn prune(
    map: &mut HashMap<EdgeId, Vec<Arc<EdgePipe>>>,
    id: EdgeId,
    keep: impl Fn(&Arc<EdgePipe>) -> bool,
) -> usize {
    let Some(pipes) = map.get_mut(&id) else {
        return 0;
    };
    pipes.retain(keep);
    let open = pipes.len();
    if open == 0 {
        map.remove(&id);
    }
    open
}

/// The dispatcher: owns the loop thread and the solver state.
pub(crate) struct Scheduler {
    inner: Arc<SchedInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub(crate) fn new(cache: Arc<dyn CacheManager>, metrics: Arc<Metrics>) -> Self {
        let inner = Arc::new(SchedInner {
            state: Mutex::new(SolverState {
                edges: HashMap::new(),
                incoming: HashMap::new(),
                outgoing: HashMap::new(),
                graph: GraphIndex::default(),
                keys: KeyIndex::default(),
                cache,
                metrics: Arc::clone(&metrics),
            }),
            wakeq: Mutex::new(WakeQueue {
                fifo: VecDeque::new(),
                pending: HashSet::new(),
                stopped: false,
            }),
            cond: Condvar::new(),
            metrics,
        });
        let loop_inner = Arc::clone(&inner);
        let thread = std::thread::Builder::new()
            .name("kiln-dispatch".into())
            .spawn(move || loop_inner.run_loop())
            .expect("failed to spawn dispatcher thread");
        Self {
            inner,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Run state mutations under the dispatch mutex (graph loading, pruning).
    pub(crate) fn with_state<T>(&self, f: impl FnOnce(&mut SolverState) -> T) -> T {
        let mut st = self.inner.state.lock().expect("solver state lock poisoned");
        f(&mut st)
    }

    /// Evaluate an edge to a result, blocking until done or cancelled.
    pub(crate) fn build(
        &self,
        token: &CancelToken,
        edge: &Edge,
    ) -> Result<crate::core::artifact::CachedArtifact, Arc<SolveError>> {
        self.inner.metrics.builds.increment();
        let (done_rx, edge_pipe) = {
            let mut st = self.inner.state.lock().expect("solver state lock poisoned");
            let Some(id) = st.get_edge(edge) else {
                return Err(Arc::new(SolveError::Validation(format!(
                    "invalid request {:?} for build",
                    edge
                ))));
            };
            let edge_pipe = Arc::new(EdgePipe {
                pipe: Pipe::new(EdgeRequest {
                    desired: EdgeStatus::Complete,
                }),
                target: Mutex::new(Some(id)),
                from: Mutex::new(None),
            });
            // receiver-side events (cancel) wake the producer
            {
                let weak_inner = Arc::downgrade(&self.inner);
                let weak_pipe = Arc::downgrade(&edge_pipe);
                edge_pipe.pipe.receiver.set_on_receive(Arc::new(move || {
                    if let (Some(inner), Some(pipe)) = (weak_inner.upgrade(), weak_pipe.upgrade())
                    {
                        if let Some(target) = pipe.target_id() {
                            inner.signal(target);
                        }
                    }
                }));
            }
            let (done_tx, done_rx) = bounded(1);
            let receiver = edge_pipe.pipe.receiver.clone();
            edge_pipe.pipe.sender.set_on_send(Arc::new(move || {
                receiver.receive();
                if receiver.status().done() {
                    let _ = done_tx.try_send(());
                }
            }));
            st.incoming.entry(id).or_default().push(Arc::clone(&edge_pipe));
            self.inner.signal(id);
            (done_rx, edge_pipe)
        };

        let cancel_rx = token.subscribe();
        crossbeam::select! {
            recv(done_rx) -> _ => {}
            recv(cancel_rx) -> _ => {
                if token.is_cancelled() {
                    edge_pipe.pipe.receiver.cancel();
                }
                let _ = done_rx.recv();
            }
        }

        let status = edge_pipe.pipe.receiver.status();
        if let Some(err) = status.error {
            return Err(err);
        }
        match status.value {
            Some(PipeValue::State(snapshot)) => match snapshot.result {
                Some(result) => Ok(result.clone_cached()),
                None => Err(Arc::new(SolveError::Internal(
                    "build completed without a result".into(),
                ))),
            },
            other => Err(Arc::new(SolveError::Internal(format!(
                "build completed with unexpected payload: {:?}",
                other
            )))),
        }
    }

    /// Stop the dispatch loop and join its thread. Idempotent.
    pub(crate) fn stop(&self) {
        {
            let mut q = self.inner.wakeq.lock().expect("wake queue lock poisoned");
            q.stopped = true;
            self.inner.cond.notify_all();
        }
        if let Some(handle) = self.thread.lock().expect("thread slot lock").take() {
            let _ = handle.join();
        }
    }

    pub(crate) fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// Pending wakeups. Test and debugging aid.
    pub(crate) fn queued(&self) -> usize {
        self.inner
            .wakeq
            .lock()
            .expect("wake queue lock poisoned")
            .fifo
            .len()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
        let mut st = self.inner.state.lock().expect("solver state lock poisoned");
        st.release_all();
    }
}
