//! Verbose scheduler tracing.
//!
//! `KILN_SCHEDULER_DEBUG=1` turns on event tracing at the dispatch/unpark
//! boundary. The gate is read once per process; events go through `tracing`
//! at debug level on the `kiln::scheduler` target.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use super::edge::{EdgeNode, EdgeStatus};
use super::index::EdgeId;

const TARGET: &str = "kiln::scheduler";

static FORCED: AtomicBool = AtomicBool::new(false);

/// Turn the trace on regardless of the environment (config override).
pub(crate) fn force_enable() {
    FORCED.store(true, Ordering::Relaxed);
}

/// True when the verbose scheduler trace is enabled.
pub(crate) fn enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    FORCED.load(Ordering::Relaxed)
        || *ENABLED.get_or_init(|| {
            std::env::var("KILN_SCHEDULER_DEBUG")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false)
        })
}

pub(crate) fn pre_unpark(edge: &EdgeNode, incoming: usize, updates: usize, outgoing: usize) {
    if !enabled() {
        return;
    }
    tracing::debug!(
        target: TARGET,
        edge = %edge.vertex_name(),
        id = ?edge.id,
        state = %edge.state(),
        incoming,
        updates,
        outgoing,
        active_outgoing = edge.has_active_outgoing,
        ">> unpark"
    );
}

pub(crate) fn post_unpark(edge: &EdgeNode, incoming: usize) {
    if !enabled() {
        return;
    }
    tracing::debug!(
        target: TARGET,
        edge = %edge.vertex_name(),
        id = ?edge.id,
        state = %edge.state(),
        incoming,
        "<< unpark"
    );
}

pub(crate) fn edge_transition(edge: &EdgeNode, next: EdgeStatus) {
    if !enabled() {
        return;
    }
    tracing::debug!(
        target: TARGET,
        edge = %edge.vertex_name(),
        id = ?edge.id,
        from = %edge.state(),
        to = %next,
        "edge transition"
    );
}

pub(crate) fn merging_edges(src: EdgeId, dest: EdgeId) {
    if !enabled() {
        return;
    }
    tracing::debug!(target: TARGET, src = ?src, dest = ?dest, "merging edges");
}

pub(crate) fn merge_skipped(src: EdgeId, dest: EdgeId, reason: &str) {
    if !enabled() {
        return;
    }
    tracing::debug!(target: TARGET, src = ?src, dest = ?dest, reason, "merge skipped");
}

pub(crate) fn inconsistent_graph(vertex: &str) {
    if !enabled() {
        return;
    }
    tracing::debug!(target: TARGET, vertex, "inconsistent graph state");
}
