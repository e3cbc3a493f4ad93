//! The per-edge state machine.
//!
//! One `EdgeNode` drives a single (vertex, output) pair from first request to
//! published result: compute the cache map, collect input fast keys, look the
//! composite key up in the backend, compute slow keys from input content,
//! and finally load from cache or execute. All mutation happens inside
//! `unpark`, invoked only by the dispatcher; workers communicate back through
//! the pipes they complete.
//!
//! `unpark` must be idempotent-after-progress: invoked again with no new
//! updates it re-requests nothing.

use std::collections::HashSet;
use std::sync::Arc;

use crate::cache::{CacheManager, CacheRecord};
use crate::core::artifact::{sentinel_artifact, sentinel_digest, ArtifactRef, CachedArtifact};
use crate::core::digest::Digest;
use crate::core::key::{CacheKey, CacheKeyWithSelector, ExportableKey};
use crate::core::op::{CacheMap, Op};
use crate::core::vertex::{Edge, OutputIndex};

use super::debug;
use super::error::{ExecMounts, ExecSnapshot, SolveError};
use super::index::EdgeId;
use super::metrics::Metrics;
use super::pipe::PipeId;
use super::scheduler::{EdgePipe, PipeFactory};

/// Progress ladder of an edge. Monotonic; `Complete` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum EdgeStatus {
    /// No cache keys yet.
    Initial,
    /// Fast key assembled from input fast keys.
    CacheFast,
    /// Slow keys (input content digests) resolved.
    CacheSlow,
    /// Result or error published.
    Complete,
}

impl std::fmt::Display for EdgeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EdgeStatus::Initial => "initial",
            EdgeStatus::CacheFast => "cache-fast",
            EdgeStatus::CacheSlow => "cache-slow",
            EdgeStatus::Complete => "complete",
        };
        f.write_str(s)
    }
}

/// A consumer's interest in a producing edge.
#[derive(Clone, Copy, Debug)]
pub struct EdgeRequest {
    pub desired: EdgeStatus,
}

/// State published by an edge to its consumers, interim or final.
#[derive(Clone, Debug)]
pub struct EdgeSnapshot {
    pub state: EdgeStatus,
    /// The edge's current composite key plus backend match keys.
    pub keys: Vec<Arc<CacheKey>>,
    /// Alias view of the published result; consumers needing ownership call
    /// `clone_cached`.
    pub result: Option<CachedArtifact>,
}

/// Payload carried by solver pipes.
#[derive(Clone)]
pub(crate) enum PipeValue {
    /// Dep edge state (input request pipes).
    State(EdgeSnapshot),
    /// Result of the cache-map worker.
    CacheMap(Arc<CacheMap>),
    /// Result of a backend lookup worker.
    CacheLookup {
        records: Vec<Arc<CacheRecord>>,
        match_keys: Vec<Arc<CacheKey>>,
    },
    /// Result of a content-digest worker for one input.
    SlowKey { index: usize, digest: Digest },
    /// Result loaded from a cache record. The value owns the handle.
    Loaded {
        artifact: ArtifactRef,
        exported: ExportableKey,
        record: Arc<CacheRecord>,
    },
    /// Freshly executed and saved result. The value owns the handle.
    Executed {
        artifact: ArtifactRef,
        exported: ExportableKey,
        record: Arc<CacheRecord>,
    },
}

impl PipeValue {
    /// Release handles owned by an undelivered or unconsumed value.
    pub(crate) fn release_resources(&self) {
        match self {
            PipeValue::Loaded { artifact, .. } | PipeValue::Executed { artifact, .. } => {
                if !artifact.is_released() {
                    if let Err(err) = artifact.release() {
                        tracing::warn!(error = %err, "failed to release stranded artifact");
                    }
                }
            }
            _ => {}
        }
    }
}

impl std::fmt::Debug for PipeValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipeValue::State(s) => write!(f, "State({})", s.state),
            PipeValue::CacheMap(_) => f.write_str("CacheMap"),
            PipeValue::CacheLookup { records, match_keys } => {
                write!(f, "CacheLookup({} records, {} keys)", records.len(), match_keys.len())
            }
            PipeValue::SlowKey { index, .. } => write!(f, "SlowKey(input {})", index),
            PipeValue::Loaded { .. } => f.write_str("Loaded"),
            PipeValue::Executed { .. } => f.write_str("Executed"),
        }
    }
}

#[derive(Clone, Copy)]
struct OpenRequest {
    id: PipeId,
    desired: EdgeStatus,
}

/// Tracking for one declared input.
struct DepState {
    index: usize,
    target: Edge,
    req: Option<OpenRequest>,
    state: EdgeStatus,
    keys: Vec<Arc<CacheKey>>,
    result: Option<CachedArtifact>,
    err: Option<Arc<SolveError>>,
    slow_req: Option<PipeId>,
    slow_key: Option<Arc<CacheKey>>,
    /// Failed optional input substituted by the sentinel.
    sentinel: bool,
}

impl DepState {
    fn new(index: usize, target: Edge) -> Self {
        Self {
            index,
            target,
            req: None,
            state: EdgeStatus::Initial,
            keys: Vec::new(),
            result: None,
            err: None,
            slow_req: None,
            slow_key: None,
            sentinel: false,
        }
    }

    fn materialized(&self) -> bool {
        self.sentinel || self.result.is_some()
    }
}

pub(crate) struct EdgeNode {
    pub id: EdgeId,
    pub edge: Edge,
    op: Arc<dyn Op>,
    cache: Arc<dyn CacheManager>,
    metrics: Arc<Metrics>,

    state: EdgeStatus,
    deps: Vec<DepState>,
    cache_map: Option<Arc<CacheMap>>,

    cache_map_req: Option<PipeId>,
    lookup_req: Option<PipeId>,
    lookup_key: Option<Digest>,
    load_req: Option<PipeId>,
    exec_req: Option<PipeId>,

    /// Key ids already submitted for lookup.
    queried_key_ids: HashSet<Digest>,
    records: Vec<Arc<CacheRecord>>,
    record_ids: HashSet<String>,
    match_keys: Vec<Arc<CacheKey>>,

    current_key: Option<Arc<CacheKey>>,
    /// Extra per-dep key alternatives folded in from merged-away peers.
    secondary: Vec<(usize, CacheKeyWithSelector)>,

    result: Option<CachedArtifact>,
    saved_record: Option<Arc<CacheRecord>>,
    err: Option<Arc<SolveError>>,

    pub keys_did_change: bool,
    pub has_active_outgoing: bool,
    snapshot_dirty: bool,
}

impl EdgeNode {
    pub(crate) fn new(
        id: EdgeId,
        edge: Edge,
        op: Arc<dyn Op>,
        cache: Arc<dyn CacheManager>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let deps = edge
            .vertex
            .inputs()
            .iter()
            .enumerate()
            .map(|(i, input)| DepState::new(i, input.clone()))
            .collect();
        Self {
            id,
            edge,
            op,
            cache,
            metrics,
            state: EdgeStatus::Initial,
            deps,
            cache_map: None,
            cache_map_req: None,
            lookup_req: None,
            lookup_key: None,
            load_req: None,
            exec_req: None,
            queried_key_ids: HashSet::new(),
            records: Vec::new(),
            record_ids: HashSet::new(),
            match_keys: Vec::new(),
            current_key: None,
            secondary: Vec::new(),
            result: None,
            saved_record: None,
            err: None,
            keys_did_change: false,
            has_active_outgoing: false,
            snapshot_dirty: false,
        }
    }

    pub(crate) fn state(&self) -> EdgeStatus {
        self.state
    }

    pub(crate) fn vertex_name(&self) -> &str {
        self.edge.vertex.name()
    }

    /// Current composite key with secondary-exporter alternatives folded in.
    /// This is the key registered in the key index and saved under.
    pub(crate) fn augmented_key(&self) -> Option<Arc<CacheKey>> {
        let key = self.current_key.as_ref()?;
        if self.secondary.is_empty() {
            return Some(Arc::clone(key));
        }
        let mut sets = key.deps().to_vec();
        for (index, alt) in &self.secondary {
            if let Some(set) = sets.get_mut(*index) {
                set.push(alt.clone());
            }
        }
        Some(CacheKey::new(key.base(), key.output(), sets))
    }

    pub(crate) fn snapshot(&self) -> EdgeSnapshot {
        let mut keys = Vec::new();
        if let Some(key) = &self.current_key {
            keys.push(Arc::clone(key));
        }
        keys.extend(self.match_keys.iter().cloned());
        EdgeSnapshot {
            state: self.state,
            keys,
            result: self.result.clone(),
        }
    }

    /// Per-dep state needed by the merge protocol.
    pub(crate) fn export_dep_keys(&self) -> Vec<(usize, CacheKeyWithSelector)> {
        let mut out = Vec::new();
        for dep in &self.deps {
            let selector = self.dep_selector(dep.index);
            for key in &dep.keys {
                out.push((
                    dep.index,
                    CacheKeyWithSelector::new(Arc::clone(key), selector),
                ));
            }
            if let Some(slow) = &dep.slow_key {
                out.push((dep.index, CacheKeyWithSelector::new(Arc::clone(slow), None)));
            }
            if let Some(result) = &dep.result {
                for exported in result.cache_keys() {
                    out.push((
                        dep.index,
                        CacheKeyWithSelector::new(Arc::clone(&exported.key), selector),
                    ));
                }
            }
        }
        out
    }

    pub(crate) fn absorb_secondary(&mut self, folded: Vec<(usize, CacheKeyWithSelector)>) {
        if folded.is_empty() {
            return;
        }
        self.secondary.extend(folded);
        self.keys_did_change = true;
    }

    /// Re-register the augmented key's associations after a merge folded new
    /// alternatives into an already-published edge.
    pub(crate) fn reexport_associations(&self) {
        let (Some(record), Some(key)) = (&self.saved_record, self.augmented_key()) else {
            return;
        };
        for digest in key.index_digests() {
            if let Err(err) = self.cache.add_association(digest, record) {
                tracing::warn!(edge = %self.vertex_name(), error = %err, "secondary association failed");
            }
        }
    }

    /// Release everything this edge owns. Called when the edge is destroyed
    /// (merged away, pruned, or the solver shuts down).
    pub(crate) fn release_owned(&mut self) {
        if let Some(result) = self.result.take() {
            if !result.reference().is_released() {
                if let Err(err) = result.release() {
                    tracing::warn!(edge = %self.vertex_name(), error = %err, "result release failed");
                }
            }
        }
    }

    fn dep_selector(&self, index: usize) -> Option<Digest> {
        self.cache_map
            .as_ref()
            .and_then(|cm| cm.deps.get(index))
            .and_then(|d| d.selector)
    }

    fn needs_slow(&self, index: usize) -> bool {
        self.cache_map
            .as_ref()
            .and_then(|cm| cm.deps.get(index))
            .map(|d| d.content_digest.is_some())
            .unwrap_or(false)
    }

    fn slow_done(&self, dep: &DepState) -> bool {
        dep.sentinel || !self.needs_slow(dep.index) || dep.slow_key.is_some()
    }

    fn all_slow_done(&self) -> bool {
        self.deps.iter().all(|d| self.slow_done(d))
    }

    // ------------------------------------------------------------------
    // unpark
    // ------------------------------------------------------------------

    pub(crate) fn unpark(
        &mut self,
        incoming: &[Arc<EdgePipe>],
        updates: &[Arc<EdgePipe>],
        outgoing: &[Arc<EdgePipe>],
        pf: &mut PipeFactory<'_>,
    ) {
        self.process_updates(updates);
        self.assemble_keys();

        let desired = self.respond_to_incoming(incoming);

        if self.state == EdgeStatus::Complete {
            self.cancel_outgoing(outgoing);
            return;
        }

        let Some(desired) = desired else {
            // no open consumers: stop initiating work and drop what's in
            // flight; the edge stays available for future requests
            self.cancel_outgoing(outgoing);
            self.clear_inflight();
            return;
        };

        self.advance(desired, pf);
        self.broadcast_interim(incoming);
    }

    // ------------------------------------------------------------------
    // update ingestion
    // ------------------------------------------------------------------

    fn process_updates(&mut self, updates: &[Arc<EdgePipe>]) {
        for up in updates {
            let receiver = &up.pipe.receiver;
            let rid = receiver.id();
            if self.state == EdgeStatus::Complete {
                self.dispose_stale(up);
                continue;
            }
            if Some(rid) == self.cache_map_req {
                self.on_cache_map_update(up);
            } else if Some(rid) == self.lookup_req {
                self.on_lookup_update(up);
            } else if Some(rid) == self.load_req {
                self.on_load_update(up);
            } else if Some(rid) == self.exec_req {
                self.on_exec_update(up);
            } else if let Some(i) = self.dep_by_slow_req(rid) {
                self.on_slow_key_update(i, up);
            } else if let Some(i) = self.dep_by_req(rid) {
                self.on_dep_update(i, up);
            } else {
                self.dispose_stale(up);
            }
        }
    }

    fn dep_by_req(&self, id: PipeId) -> Option<usize> {
        self.deps
            .iter()
            .position(|d| d.req.map(|r| r.id) == Some(id))
    }

    fn dep_by_slow_req(&self, id: PipeId) -> Option<usize> {
        self.deps.iter().position(|d| d.slow_req == Some(id))
    }

    fn dispose_stale(&self, up: &Arc<EdgePipe>) {
        if let Some(value) = up.pipe.receiver.take_value() {
            tracing::trace!(edge = %self.vertex_name(), value = ?value, "disposing stale pipe value");
            value.release_resources();
        }
    }

    fn on_cache_map_update(&mut self, up: &Arc<EdgePipe>) {
        let receiver = &up.pipe.receiver;
        if !receiver.state().done() {
            return;
        }
        self.cache_map_req = None;
        let status = receiver.status();
        if let Some(err) = status.error {
            self.fail(err);
            return;
        }
        match receiver.take_value() {
            Some(PipeValue::CacheMap(map)) => {
                if map.deps.len() != self.deps.len() {
                    self.fail(Arc::new(SolveError::Internal(format!(
                        "cache map for {} declares {} deps, vertex has {}",
                        self.vertex_name(),
                        map.deps.len(),
                        self.deps.len()
                    ))));
                    return;
                }
                tracing::debug!(edge = %self.vertex_name(), digest = ?map.digest, "cache map ready");
                self.cache_map = Some(map);
                self.snapshot_dirty = true;
            }
            other => self.unexpected_value("cache-map", other),
        }
    }

    fn on_lookup_update(&mut self, up: &Arc<EdgePipe>) {
        let receiver = &up.pipe.receiver;
        if !receiver.state().done() {
            return;
        }
        self.lookup_req = None;
        self.lookup_key = None;
        let status = receiver.status();
        if let Some(err) = status.error {
            self.fail(err);
            return;
        }
        match receiver.take_value() {
            Some(PipeValue::CacheLookup { records, match_keys }) => {
                for record in records {
                    if self.record_ids.insert(record.id.clone()) {
                        self.records.push(record);
                    }
                }
                let known: HashSet<Digest> = self
                    .match_keys
                    .iter()
                    .map(|k| k.id())
                    .chain(self.current_key.iter().map(|k| k.id()))
                    .collect();
                let mut grew = false;
                for key in match_keys {
                    if !known.contains(&key.id()) {
                        self.match_keys.push(key);
                        grew = true;
                    }
                }
                if grew {
                    // match keys are part of the edge's identity: another
                    // edge may rendezvous on them
                    self.keys_did_change = true;
                    self.snapshot_dirty = true;
                }
                if !self.records.is_empty() {
                    self.metrics.cache_hits.increment();
                }
            }
            other => self.unexpected_value("cache-lookup", other),
        }
    }

    fn on_load_update(&mut self, up: &Arc<EdgePipe>) {
        let receiver = &up.pipe.receiver;
        if !receiver.state().done() {
            return;
        }
        self.load_req = None;
        let status = receiver.status();
        if let Some(err) = status.error {
            self.fail(err);
            return;
        }
        match receiver.take_value() {
            Some(PipeValue::Loaded {
                artifact,
                exported,
                record,
            }) => {
                tracing::debug!(edge = %self.vertex_name(), artifact = %artifact.id(), "result loaded from cache");
                self.publish(CachedArtifact::new(artifact, vec![exported]), record);
            }
            other => self.unexpected_value("cache-load", other),
        }
    }

    fn on_exec_update(&mut self, up: &Arc<EdgePipe>) {
        let receiver = &up.pipe.receiver;
        if !receiver.state().done() {
            return;
        }
        self.exec_req = None;
        let status = receiver.status();
        if let Some(err) = status.error {
            self.fail(err);
            return;
        }
        match receiver.take_value() {
            Some(PipeValue::Executed {
                artifact,
                exported,
                record,
            }) => {
                tracing::debug!(edge = %self.vertex_name(), artifact = %artifact.id(), "executed");
                self.metrics.execs_completed.increment();
                self.publish(CachedArtifact::new(artifact, vec![exported]), record);
            }
            other => self.unexpected_value("exec", other),
        }
    }

    fn on_slow_key_update(&mut self, dep_index: usize, up: &Arc<EdgePipe>) {
        let receiver = &up.pipe.receiver;
        if !receiver.state().done() {
            return;
        }
        self.deps[dep_index].slow_req = None;
        let status = receiver.status();
        if let Some(err) = status.error {
            self.fail(err);
            return;
        }
        match receiver.take_value() {
            Some(PipeValue::SlowKey { index, digest }) => {
                debug_assert_eq!(index, dep_index);
                tracing::debug!(edge = %self.vertex_name(), input = index, digest = ?digest, "slow key resolved");
                self.deps[dep_index].slow_key = Some(CacheKey::leaf(digest, OutputIndex(0)));
            }
            other => self.unexpected_value("slow-key", other),
        }
    }

    fn on_dep_update(&mut self, dep_index: usize, up: &Arc<EdgePipe>) {
        let receiver = &up.pipe.receiver;
        let status = receiver.status();
        let done = status.state.done();

        if let Some(err) = status.error {
            let dep = &mut self.deps[dep_index];
            dep.req = None;
            dep.err = Some(err);
            dep.state = EdgeStatus::Complete;
            // optionality resolves in assemble_keys once the cache map is in
            return;
        }

        if let Some(PipeValue::State(snap)) = status.value {
            let dep = &mut self.deps[dep_index];
            let keys_changed = dep.keys.len() != snap.keys.len()
                || dep
                    .keys
                    .iter()
                    .zip(snap.keys.iter())
                    .any(|(a, b)| a.id() != b.id());
            dep.state = snap.state;
            dep.keys = snap.keys;
            if dep.result.is_none() {
                dep.result = snap.result;
            }
            if keys_changed {
                self.snapshot_dirty = true;
            }
        }
        if done {
            self.deps[dep_index].req = None;
        }
    }

    fn unexpected_value(&mut self, what: &str, value: Option<PipeValue>) {
        if let Some(v) = &value {
            v.release_resources();
        }
        self.fail(Arc::new(SolveError::Internal(format!(
            "unexpected {} result for {}: {:?}",
            what,
            self.vertex_name(),
            value
        ))));
    }

    // ------------------------------------------------------------------
    // key assembly
    // ------------------------------------------------------------------

    fn assemble_keys(&mut self) {
        if self.err.is_some() || self.cache_map.is_none() {
            return;
        }
        self.resolve_dep_errors();
        if self.err.is_some() {
            return;
        }
        let cm = Arc::clone(self.cache_map.as_ref().expect("cache map checked above"));

        let mut sets: Vec<Vec<CacheKeyWithSelector>> = Vec::with_capacity(self.deps.len());
        for dep in &self.deps {
            let mut set = Vec::new();
            if dep.sentinel {
                set.push(CacheKeyWithSelector::new(
                    CacheKey::leaf(sentinel_digest(), OutputIndex(0)),
                    None,
                ));
            } else {
                let selector = cm.deps.get(dep.index).and_then(|d| d.selector);
                for key in &dep.keys {
                    set.push(CacheKeyWithSelector::new(Arc::clone(key), selector));
                }
                if let Some(result) = &dep.result {
                    for exported in result.cache_keys() {
                        set.push(CacheKeyWithSelector::new(
                            Arc::clone(&exported.key),
                            selector,
                        ));
                    }
                }
                if let Some(slow) = &dep.slow_key {
                    set.push(CacheKeyWithSelector::new(Arc::clone(slow), None));
                }
            }
            if set.is_empty() {
                return; // fast key needs at least one contribution per input
            }
            sets.push(set);
        }

        let key = CacheKey::new(cm.digest, self.edge.output, sets);
        let changed = self.current_key.as_ref().map(|k| k.id()) != Some(key.id());
        if changed {
            tracing::debug!(edge = %self.vertex_name(), key = ?key.id(), "cache key updated");
            self.current_key = Some(key);
            self.keys_did_change = true;
            self.snapshot_dirty = true;
        }
        if self.state == EdgeStatus::Initial {
            self.state = EdgeStatus::CacheFast;
            self.snapshot_dirty = true;
        }
    }

    /// Substitute sentinels for failed optional inputs; propagate the rest.
    fn resolve_dep_errors(&mut self) {
        let optional: Vec<bool> = {
            let cm = self.cache_map.as_ref().expect("caller checked cache map");
            self.deps
                .iter()
                .map(|d| cm.deps.get(d.index).map(|c| c.optional).unwrap_or(false))
                .collect()
        };
        let mut failure: Option<(usize, Arc<SolveError>)> = None;
        for (dep, optional) in self.deps.iter_mut().zip(optional) {
            let Some(err) = dep.err.take() else { continue };
            if optional {
                tracing::debug!(input = dep.index, error = %err, "optional input failed, using sentinel");
                dep.sentinel = true;
                dep.keys.clear();
                dep.slow_key = None;
                dep.result = Some(CachedArtifact::new(sentinel_artifact(), Vec::new()));
            } else if failure.is_none() {
                failure = Some((dep.index, err));
            }
        }
        if let Some((index, cause)) = failure {
            self.fail(Arc::new(SolveError::Dependency { index, cause }));
        }
    }

    // ------------------------------------------------------------------
    // responding to consumers
    // ------------------------------------------------------------------

    fn respond_to_incoming(&mut self, incoming: &[Arc<EdgePipe>]) -> Option<EdgeStatus> {
        let mut desired: Option<EdgeStatus> = None;
        for pipe in incoming {
            let sender = &pipe.pipe.sender;
            if sender.status().state.done() {
                continue;
            }
            if let Some(err) = &self.err {
                sender.finalize_err(Arc::clone(err));
                continue;
            }
            let want = sender.request().desired;
            if self.state >= want {
                sender.finalize(PipeValue::State(self.snapshot()));
                continue;
            }
            desired = Some(desired.map_or(want, |d| d.max(want)));
        }
        desired
    }

    fn broadcast_interim(&mut self, incoming: &[Arc<EdgePipe>]) {
        if !self.snapshot_dirty {
            return;
        }
        self.snapshot_dirty = false;
        let snapshot = self.snapshot();
        for pipe in incoming {
            let sender = &pipe.pipe.sender;
            if !sender.status().state.done() {
                sender.update(PipeValue::State(snapshot.clone()));
            }
        }
    }

    // ------------------------------------------------------------------
    // scheduling work
    // ------------------------------------------------------------------

    fn advance(&mut self, desired: EdgeStatus, pf: &mut PipeFactory<'_>) {
        if self.cache_map.is_none() {
            if self.cache_map_req.is_none() {
                self.spawn_cache_map(pf);
            }
            self.ensure_dep_requests(EdgeStatus::CacheFast, pf);
            return;
        }

        self.ensure_dep_requests(EdgeStatus::CacheFast, pf);
        let Some(key) = self.augmented_key() else {
            return; // waiting on input keys; dep requests are open
        };

        let ignore_cache = self.edge.vertex.options().ignore_cache;

        if !ignore_cache && self.lookup_req.is_none() && !self.queried_key_ids.contains(&key.id()) {
            self.spawn_lookup(Arc::clone(&key), pf);
        }
        let settled = ignore_cache
            || (self.lookup_req.is_none() && self.queried_key_ids.contains(&key.id()));
        let have_record = !ignore_cache && !self.records.is_empty();

        // serve from cache
        if desired == EdgeStatus::Complete
            && settled
            && have_record
            && self.load_req.is_none()
            && self.exec_req.is_none()
        {
            let record = Arc::clone(&self.records[0]);
            self.spawn_load(record, pf);
            return;
        }

        // slow phase: runs in parallel with an outstanding lookup. A record
        // match short-circuits it only for result consumers; a consumer that
        // wants slow keys themselves still gets them.
        if desired >= EdgeStatus::CacheSlow
            && self.state == EdgeStatus::CacheFast
            && (!have_record || desired == EdgeStatus::CacheSlow)
        {
            let pending = self.slow_phase(pf);
            if !pending && self.all_slow_done() {
                debug::edge_transition(self, EdgeStatus::CacheSlow);
                self.state = EdgeStatus::CacheSlow;
                self.snapshot_dirty = true;
            }
        }

        // execute
        if desired == EdgeStatus::Complete
            && self.state == EdgeStatus::CacheSlow
            && settled
            && !have_record
            && self.load_req.is_none()
            && self.exec_req.is_none()
        {
            if self.deps.iter().all(|d| d.materialized()) {
                self.spawn_exec(Arc::clone(&key), pf);
            } else {
                self.ensure_dep_requests(EdgeStatus::Complete, pf);
            }
        }
    }

    fn ensure_dep_requests(&mut self, needed: EdgeStatus, pf: &mut PipeFactory<'_>) {
        for dep in &mut self.deps {
            ensure_dep_request(dep, needed, pf);
        }
    }

    /// Drive slow-key computation. Returns true while work is outstanding.
    fn slow_phase(&mut self, pf: &mut PipeFactory<'_>) -> bool {
        let cm = Arc::clone(self.cache_map.as_ref().expect("cache map present"));
        let mut pending = false;
        for dep in &mut self.deps {
            let Some(content_digest) = cm.deps.get(dep.index).and_then(|d| d.content_digest.clone())
            else {
                continue;
            };
            if dep.sentinel || dep.slow_key.is_some() {
                continue;
            }
            pending = true;
            if dep.slow_req.is_some() {
                continue;
            }
            if dep.result.is_none() {
                // a slow key reads input content: materialize this dep
                ensure_dep_request(dep, EdgeStatus::Complete, pf);
                continue;
            }
            let result = dep.result.as_ref().expect("checked above");
            // content digests read the materialized input on a worker
            let index = dep.index;
            let input = result.reference().clone();
            let vertex = self.edge.vertex.name().to_string();
            let id = pf.new_func_request(move |token| {
                let digest = content_digest(token, &input).map_err(|cause| {
                    if token.is_cancelled() {
                        Arc::new(SolveError::Cancelled)
                    } else {
                        Arc::new(SolveError::ContentDigest {
                            vertex: vertex.clone(),
                            index,
                            cause,
                        })
                    }
                })?;
                Ok(PipeValue::SlowKey { index, digest })
            });
            dep.slow_req = Some(id);
        }
        pending
    }

    fn spawn_cache_map(&mut self, pf: &mut PipeFactory<'_>) {
        let op = Arc::clone(&self.op);
        let vertex = self.edge.vertex.name().to_string();
        let id = pf.new_func_request(move |token| {
            let map = op.cache_map(token).map_err(|cause| {
                if token.is_cancelled() {
                    Arc::new(SolveError::Cancelled)
                } else {
                    Arc::new(SolveError::CacheMap { vertex: vertex.clone(), cause })
                }
            })?;
            Ok(PipeValue::CacheMap(Arc::new(map)))
        });
        self.cache_map_req = Some(id);
    }

    fn spawn_lookup(&mut self, key: Arc<CacheKey>, pf: &mut PipeFactory<'_>) {
        self.queried_key_ids.insert(key.id());
        self.lookup_key = Some(key.id());
        let cache = Arc::clone(&self.cache);
        let id = pf.new_func_request(move |_token| {
            let records = cache
                .query(&key)
                .map_err(|e| Arc::new(SolveError::Cache(e)))?;
            let match_keys = cache
                .matches(&key)
                .map_err(|e| Arc::new(SolveError::Cache(e)))?;
            Ok(PipeValue::CacheLookup { records, match_keys })
        });
        self.lookup_req = Some(id);
    }

    fn spawn_load(&mut self, record: Arc<CacheRecord>, pf: &mut PipeFactory<'_>) {
        let cache = Arc::clone(&self.cache);
        let output = self.edge.output;
        let id = pf.new_func_request(move |_token| {
            let artifact = cache
                .load(&record, output)
                .map_err(|e| Arc::new(SolveError::Cache(e)))?;
            let exported = ExportableKey {
                key: Arc::clone(&record.key),
                cache_id: record.cache_id.clone(),
            };
            Ok(PipeValue::Loaded {
                artifact,
                exported,
                record,
            })
        });
        self.load_req = Some(id);
    }

    fn spawn_exec(&mut self, key: Arc<CacheKey>, pf: &mut PipeFactory<'_>) {
        let op = Arc::clone(&self.op);
        let cache = Arc::clone(&self.cache);
        let output = self.edge.output;
        let vertex = self.edge.vertex.name().to_string();
        let inputs: Vec<ArtifactRef> = self
            .deps
            .iter()
            .map(|d| {
                d.result
                    .as_ref()
                    .expect("deps materialized before exec")
                    .reference()
                    .clone()
            })
            .collect();
        self.metrics.execs_started.increment();
        tracing::info!(edge = %vertex, key = ?key.id(), "executing");
        let id = pf.new_func_request(move |token| {
            let outputs = op.exec(token, &inputs).map_err(|mut cause| {
                if token.is_cancelled() {
                    return Arc::new(SolveError::Cancelled);
                }
                let mounts = cause
                    .downcast_mut::<ExecMounts>()
                    .map(|m| std::mem::take(&mut m.0))
                    .unwrap_or_default();
                let snapshot_inputs = inputs.iter().map(|r| r.clone_ref()).collect();
                Arc::new(SolveError::Exec {
                    vertex: vertex.clone(),
                    cause,
                    snapshot: ExecSnapshot::new(snapshot_inputs, mounts),
                })
            })?;

            let mut outputs = outputs;
            if output.0 >= outputs.len() {
                for artifact in &outputs {
                    let _ = artifact.release();
                }
                return Err(Arc::new(SolveError::Internal(format!(
                    "{} produced {} outputs, output {} requested",
                    vertex,
                    outputs.len(),
                    output
                ))));
            }
            let artifact = outputs.swap_remove(output.0);
            // unselected outputs are never published: release them now
            for extra in outputs {
                if let Err(err) = extra.release() {
                    tracing::warn!(error = %err, "failed to release unselected output");
                }
            }

            match cache.save(&key, &artifact) {
                Ok(saved) => Ok(PipeValue::Executed {
                    artifact,
                    exported: saved.exported,
                    record: saved.record,
                }),
                Err(err) => {
                    let _ = artifact.release();
                    Err(Arc::new(SolveError::Cache(err)))
                }
            }
        });
        self.exec_req = Some(id);
    }

    // ------------------------------------------------------------------
    // terminal transitions
    // ------------------------------------------------------------------

    fn publish(&mut self, result: CachedArtifact, record: Arc<CacheRecord>) {
        debug_assert!(self.result.is_none(), "result published twice");
        self.result = Some(result);
        self.saved_record = Some(record);
        debug::edge_transition(self, EdgeStatus::Complete);
        self.state = EdgeStatus::Complete;
        self.snapshot_dirty = true;
    }

    pub(crate) fn fail(&mut self, err: Arc<SolveError>) {
        if self.err.is_some() || self.result.is_some() {
            return;
        }
        tracing::debug!(edge = %self.vertex_name(), error = %err, "edge failed");
        self.err = Some(err);
        debug::edge_transition(self, EdgeStatus::Complete);
        self.state = EdgeStatus::Complete;
        self.snapshot_dirty = true;
    }

    /// Finalize every open incoming pipe with the edge's terminal status.
    /// Used by the dispatcher's tripwire handling.
    pub(crate) fn finalize_incoming(&mut self, incoming: &[Arc<EdgePipe>]) {
        for pipe in incoming {
            let sender = &pipe.pipe.sender;
            if sender.status().state.done() {
                continue;
            }
            match &self.err {
                Some(err) => {
                    sender.finalize_err(Arc::clone(err));
                }
                None => {
                    sender.finalize(PipeValue::State(self.snapshot()));
                }
            }
        }
    }

    fn cancel_outgoing(&self, outgoing: &[Arc<EdgePipe>]) {
        for pipe in outgoing {
            let receiver = &pipe.pipe.receiver;
            if !receiver.state().done() {
                receiver.cancel();
            }
            // a worker may have completed between this unpark's receive pass
            // and the cancel: drain its value before the pipe is pruned
            if let Some(value) = receiver.take_value() {
                value.release_resources();
            }
        }
    }

    fn clear_inflight(&mut self) {
        self.cache_map_req = None;
        if self.lookup_req.take().is_some() {
            // the lookup never completed: allow a re-query for the same key
            if let Some(key_id) = self.lookup_key.take() {
                self.queried_key_ids.remove(&key_id);
            }
        }
        self.load_req = None;
        self.exec_req = None;
        for dep in &mut self.deps {
            dep.req = None;
            dep.slow_req = None;
        }
    }
}

/// Open or escalate one input request. One-request pipes are replaced on
/// escalation, never updated in place.
fn ensure_dep_request(dep: &mut DepState, needed: EdgeStatus, pf: &mut PipeFactory<'_>) {
    if dep.sentinel || dep.err.is_some() {
        return;
    }
    if needed == EdgeStatus::CacheFast && !dep.keys.is_empty() {
        return;
    }
    let satisfied = match needed {
        EdgeStatus::Complete => dep.result.is_some(),
        _ => dep.state >= needed,
    };
    if satisfied {
        return;
    }
    match dep.req {
        Some(open) if open.desired >= needed => return,
        Some(open) => {
            pf.cancel_outgoing_pipe(open.id);
            dep.req = None;
        }
        None => {}
    }
    let id = pf.new_input_request(&dep.target, EdgeRequest { desired: needed });
    dep.req = Some(OpenRequest { id, desired: needed });
}
