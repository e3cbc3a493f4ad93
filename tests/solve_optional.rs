//! Optional inputs: a failed optional input is substituted by the sentinel,
//! the cache key reflects the substitution, and a rebuild hits cache.

use kiln::test_harness::{artifact_data, Harness};
use kiln::{CancelToken, SolveError};

#[test]
fn failed_optional_input_is_substituted() {
    let h = Harness::new();
    let good = h.vertex("good").build();
    let flaky = h.vertex("flaky").exec_err("no such source").build();
    let t = h
        .vertex("t")
        .input(good.edge(0))
        .input(flaky.edge(0))
        .dep_optional(1)
        .build();

    // first build: the optional input fails, the sentinel stands in
    let solver = h.solver();
    let result = solver.build(&CancelToken::new(), &t.edge(0)).unwrap();
    assert_eq!(t.execs(), 1);
    // sentinel contributes no bytes
    assert_eq!(artifact_data(result.reference()), b"t>good>");
    result.release().unwrap();
    drop(solver);

    // identical rebuild: the key reflects the sentinel, so this hits cache
    let solver = h.solver();
    let result = solver.build(&CancelToken::new(), &t.edge(0)).unwrap();
    assert_eq!(t.execs(), 1, "sentinel-keyed result served from cache");
    assert_eq!(flaky.execs(), 2, "the optional input itself re-fails");
    assert_eq!(artifact_data(result.reference()), b"t>good>");
    result.release().unwrap();
}

#[test]
fn required_input_failure_still_fails_the_build() {
    let h = Harness::new();
    let good = h.vertex("good").build();
    let flaky = h.vertex("flaky").exec_err("no such source").build();
    // same shape, but nothing is optional
    let t = h
        .vertex("t")
        .input(good.edge(0))
        .input(flaky.edge(0))
        .build();

    let solver = h.solver();
    let err = solver.build(&CancelToken::new(), &t.edge(0)).unwrap_err();
    assert!(matches!(*err, SolveError::Dependency { index: 1, .. }), "got {err}");
    assert_eq!(t.execs(), 0);
    if let Some(snapshot) = err.exec_snapshot() {
        snapshot.release();
    }
}

#[test]
fn optional_input_that_succeeds_is_used_normally() {
    let h = Harness::new();
    let good = h.vertex("good").build();
    let also_good = h.vertex("also-good").build();
    let t = h
        .vertex("t")
        .input(good.edge(0))
        .input(also_good.edge(0))
        .dep_optional(1)
        .build();

    let solver = h.solver();
    let result = solver.build(&CancelToken::new(), &t.edge(0)).unwrap();
    assert_eq!(artifact_data(result.reference()), b"t>good>also-good>");
    result.release().unwrap();
}
