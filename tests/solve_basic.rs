//! End-to-end solves: cache miss then hit, structural dedup, error
//! propagation, release accounting.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use kiln::test_harness::Harness;
use kiln::{CancelToken, SolveError};

fn wait_quiescent(solver: &kiln::Solver) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if solver.queued_wakeups() == 0 {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("scheduler did not quiesce");
}

#[test]
fn single_vertex_miss_then_hit() {
    kiln::telemetry::init_default();
    let h = Harness::new();
    let v = h.vertex("v").build();

    // first run: empty cache, exec runs
    let solver = h.solver();
    let token = CancelToken::new();
    let result = solver.build(&token, &v.edge(0)).unwrap();
    assert_eq!(v.execs(), 1);
    assert_eq!(kiln::test_harness::artifact_data(result.reference()), b"v>");
    assert!(!result.cache_keys().is_empty());
    let first_id = result.id();
    result.release().unwrap();
    solver.stop();
    drop(solver);

    // second run: new scheduler instance, populated cache, exec not called
    let solver = h.solver();
    let result = solver.build(&token, &v.edge(0)).unwrap();
    assert_eq!(v.execs(), 1, "cache hit must not re-execute");
    assert_eq!(result.id(), first_id);
    assert_eq!(kiln::test_harness::artifact_data(result.reference()), b"v>");
    let metrics = solver.metrics();
    assert_eq!(metrics.execs_started, 0);
    assert!(metrics.cache_hits >= 1);
    result.release().unwrap();
}

#[test]
fn chain_builds_dependencies_first() {
    let h = Harness::new();
    let a = h.vertex("a").build();
    let b = h.vertex("b").input(a.edge(0)).build();
    let c = h.vertex("c").input(b.edge(0)).build();

    let solver = h.solver();
    let result = solver.build(&CancelToken::new(), &c.edge(0)).unwrap();
    assert_eq!(
        kiln::test_harness::artifact_data(result.reference()),
        b"c>b>a>"
    );
    assert_eq!(a.execs(), 1);
    assert_eq!(b.execs(), 1);
    assert_eq!(c.execs(), 1);
    result.release().unwrap();
}

#[test]
fn diamond_dedups_identical_vertex_digests() {
    let h = Harness::new();
    let a = h.vertex("a").build();
    // two distinct vertex instances with identical digests
    let mid1 = h.vertex("mid").input(a.edge(0)).build();
    let mid2 = h.vertex("mid").input(a.edge(0)).build();
    assert_eq!(mid1.digest(), mid2.digest());

    let t = h
        .vertex("t")
        .input(mid1.edge(0))
        .input(mid2.edge(0))
        .build();

    let solver = h.solver();
    let result = solver.build(&CancelToken::new(), &t.edge(0)).unwrap();
    assert_eq!(a.execs(), 1, "shared leaf built once");
    assert_eq!(mid1.execs(), 1, "deduped vertex built once");
    assert_eq!(h.total_execs.load(Ordering::SeqCst), 3);
    assert_eq!(
        kiln::test_harness::artifact_data(result.reference()),
        b"t>mid>a>mid>a>"
    );
    result.release().unwrap();
}

#[test]
fn unknown_edge_is_a_validation_error() {
    let h = Harness::new();
    let known = h.vertex("known").build();
    let unknown = h.vertex("unknown").build();

    let solver = h.solver();
    let job = solver.new_job("job-1").unwrap();
    job.load(&known.edge(0).vertex).unwrap();

    let err = job
        .build(&CancelToken::new(), &unknown.edge(0))
        .unwrap_err();
    assert!(matches!(*err, SolveError::Validation(_)), "got {err}");
    job.discard();
}

#[test]
fn duplicate_job_ids_are_rejected() {
    let h = Harness::new();
    let solver = h.solver();
    let job = solver.new_job("dup").unwrap();
    assert!(solver.new_job("dup").is_err());
    job.discard();
    // id is free again after discard
    solver.new_job("dup").unwrap().discard();
}

#[test]
fn exec_failure_carries_input_snapshot() {
    let h = Harness::new();
    let a = h.vertex("a").build();
    let b = h.vertex("b").build();
    let t = h
        .vertex("t")
        .input(a.edge(0))
        .input(b.edge(0))
        .exec_err("tool exited 1")
        .build();

    let solver = h.solver();
    let err = solver.build(&CancelToken::new(), &t.edge(0)).unwrap_err();
    let snapshot = err.exec_snapshot().expect("exec error carries snapshot");
    assert_eq!(snapshot.inputs().len(), 2);
    assert!(!snapshot.is_released());
    snapshot.release();
    snapshot.release(); // idempotent
    assert!(snapshot.is_released());
    assert!(err.to_string().contains("tool exited 1"));
}

#[test]
fn exec_failure_with_mounts_transfers_ownership() {
    use kiln::ExecMounts;
    use std::sync::Arc;

    let h = Harness::new();
    let a = h.vertex("a").build();
    let t = h
        .vertex("t")
        .input(a.edge(0))
        .exec_fn(Arc::new(|_token, inputs| {
            // fail with a mount handle in scope: ownership travels with the
            // error until the consumer releases the snapshot
            let mount = inputs[0].clone_ref();
            Err(anyhow::Error::new(ExecMounts(vec![mount])))
        }))
        .build();

    let solver = h.solver();
    let err = solver.build(&CancelToken::new(), &t.edge(0)).unwrap_err();
    let snapshot = err.exec_snapshot().expect("exec error carries snapshot");
    assert_eq!(snapshot.inputs().len(), 1);
    assert_eq!(snapshot.mounts().len(), 1);
    snapshot.release();

    // the crate-level wrapper preserves the classification
    let wrapped: kiln::Error = err.into();
    assert!(!wrapped.is_cancelled());
    assert!(wrapped.to_string().contains("execution of t failed"));
}

#[test]
fn dependency_failure_propagates() {
    let h = Harness::new();
    let bad = h.vertex("bad").exec_err("boom").build();
    let t = h.vertex("t").input(bad.edge(0)).build();

    let solver = h.solver();
    let job = solver.new_job("deps").unwrap();
    job.load(&t.edge(0).vertex).unwrap();
    let err = job.build(&CancelToken::new(), &t.edge(0)).unwrap_err();
    assert!(matches!(*err, SolveError::Dependency { index: 0, .. }), "got {err}");
    assert_eq!(t.execs(), 0, "consumer must not run after dep failure");
    if let Some(snapshot) = err.exec_snapshot() {
        snapshot.release();
    }

    // a second consumer attaching under the same job observes the same
    // error; the failed edge is terminal
    let err2 = job.build(&CancelToken::new(), &t.edge(0)).unwrap_err();
    assert!(matches!(*err2, SolveError::Dependency { .. }));
    assert_eq!(bad.execs(), 1, "failed edge is terminal");
    job.discard();
}

#[test]
fn scheduler_quiesces_after_build() {
    let h = Harness::new();
    let a = h.vertex("a").build();
    let t = h.vertex("t").input(a.edge(0)).build();

    let solver = h.solver();
    let result = solver.build(&CancelToken::new(), &t.edge(0)).unwrap();
    result.release().unwrap();
    wait_quiescent(&solver);

    // no spurious wakeups: dispatch count stays flat once quiescent
    let before = solver.metrics().dispatches;
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(solver.metrics().dispatches, before);
    assert_eq!(solver.queued_wakeups(), 0);
}

#[test]
fn release_exhaustiveness_for_executed_results() {
    let h = Harness::new();
    let v = h.vertex("v").build();
    {
        let solver = h.solver();
        let result = solver.build(&CancelToken::new(), &v.edge(0)).unwrap();
        result.release().unwrap();
        solver.stop();
        drop(solver); // releases the edge-held base reference
    }
    // the executed artifact's share group is fully released exactly once
    assert_eq!(h.underlying_releases.load(Ordering::SeqCst), 1);
}

#[test]
fn ignore_cache_reexecutes_every_build() {
    let h = Harness::new();
    let v = h.vertex("v").ignore_cache().build();

    let solver = h.solver();
    let token = CancelToken::new();
    let r1 = solver.build(&token, &v.edge(0)).unwrap();
    drop(solver);
    let solver = h.solver();
    let r2 = solver.build(&token, &v.edge(0)).unwrap();
    assert_eq!(v.execs(), 2);
    assert_ne!(r1.id(), r2.id());
    r1.release().unwrap();
    r2.release().unwrap();
}

#[test]
fn stop_is_idempotent() {
    let h = Harness::new();
    let solver = h.solver();
    solver.stop();
    solver.stop();
}
