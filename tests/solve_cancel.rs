//! Cancellation: mid-execution cancel reaches the executor, pipes settle,
//! nothing leaks, and the edge stays usable for later requests.

use std::time::Duration;

use kiln::test_harness::Harness;
use kiln::CancelToken;

#[test]
fn cancel_mid_execution_reaches_the_executor() {
    let h = Harness::new();
    let (builder, probe) = h.vertex("slow").exec_gated();
    let v = builder.build();

    let solver = h.solver();
    let token = CancelToken::new();

    std::thread::scope(|scope| {
        let handle = scope.spawn(|| solver.build(&token, &v.edge(0)));

        probe
            .started
            .recv_timeout(Duration::from_secs(5))
            .expect("executor started");
        token.cancel();

        // the executor's token is cancelled within a bounded time
        probe
            .cancelled
            .recv_timeout(Duration::from_secs(5))
            .expect("executor observed cancellation");

        let err = handle.join().unwrap().unwrap_err();
        assert!(err.is_cancelled(), "got {err}");
    });

    // everything settles: no queued wakeups, no result produced, no leaks
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while solver.queued_wakeups() > 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(solver.queued_wakeups(), 0);
    let metrics = solver.metrics();
    assert_eq!(metrics.execs_started, 1);
    assert_eq!(metrics.execs_completed, 0);
    assert_eq!(
        h.underlying_releases.load(std::sync::atomic::Ordering::SeqCst),
        0,
        "no artifact was produced, none leaked"
    );
}

#[test]
fn cancelled_edge_serves_a_later_request() {
    let h = Harness::new();
    let (builder, probe) = h.vertex("slow").exec_gated();
    let v = builder.build();

    let solver = h.solver();
    let job = solver.new_job("retry").unwrap();
    job.load(&v.edge(0).vertex).unwrap();

    // first attempt: cancel while executing
    let token = CancelToken::new();
    std::thread::scope(|scope| {
        let handle = scope.spawn(|| job.build(&token, &v.edge(0)));
        probe
            .started
            .recv_timeout(Duration::from_secs(5))
            .expect("executor started");
        token.cancel();
        assert!(handle.join().unwrap().is_err());
    });

    // second attempt on the same edge: release the gate up front
    probe.release();
    let result = job.build(&CancelToken::new(), &v.edge(0)).unwrap();
    assert_eq!(v.execs(), 2, "cancelled edge re-executes on demand");
    result.release().unwrap();
    job.discard();
}

#[test]
fn pre_cancelled_token_reports_cancellation() {
    let h = Harness::new();
    let (builder, _probe) = h.vertex("v").exec_gated();
    let v = builder.build();
    let solver = h.solver();

    let token = CancelToken::new();
    token.cancel();
    // the gate is never released, so the only way out is cancellation
    let err = solver.build(&token, &v.edge(0)).unwrap_err();
    assert!(err.is_cancelled());
}

#[test]
fn cancelling_one_consumer_leaves_the_other_running() {
    let h = Harness::new();
    let (builder, probe) = h.vertex("shared").exec_gated();
    let v = builder.build();

    let solver = h.solver();
    let job = solver.new_job("two-consumers").unwrap();
    job.load(&v.edge(0).vertex).unwrap();

    let cancelled_token = CancelToken::new();
    let live_token = CancelToken::new();
    std::thread::scope(|scope| {
        // the surviving consumer attaches first and triggers execution
        let live = scope.spawn(|| job.build(&live_token, &v.edge(0)));
        probe
            .started
            .recv_timeout(Duration::from_secs(5))
            .expect("executor started");

        let doomed = scope.spawn(|| job.build(&cancelled_token, &v.edge(0)));
        cancelled_token.cancel();
        assert!(doomed.join().unwrap().unwrap_err().is_cancelled());

        // the in-flight execution was not disturbed
        probe.release();
        let result = live.join().unwrap().unwrap();
        assert_eq!(v.execs(), 1);
        result.release().unwrap();
    });
    job.discard();
}
