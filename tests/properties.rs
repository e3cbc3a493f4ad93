//! Property tests: random small DAGs solve, dedupe, and cache fully.

use std::collections::HashSet;
use std::sync::atomic::Ordering;

use proptest::prelude::*;

use kiln::test_harness::{Harness, TestNode};
use kiln::CancelToken;

/// One vertex spec: digest salt plus input picks into earlier nodes.
type VertexSpec = (u8, Vec<prop::sample::Index>);

fn build_dag(h: &Harness, layers: &[Vec<VertexSpec>]) -> (Vec<TestNode>, TestNode) {
    let mut nodes: Vec<TestNode> = Vec::new();
    for (level, layer) in layers.iter().enumerate() {
        let mut layer_nodes = Vec::new();
        for (salt, picks) in layer {
            let mut builder = h
                .vertex(&format!("v{level}"))
                .salt(&format!("s{salt}"));
            if !nodes.is_empty() {
                for pick in picks {
                    let dep = &nodes[pick.index(nodes.len())];
                    builder = builder.input(dep.edge(0));
                }
            }
            layer_nodes.push(builder.build());
        }
        nodes.extend(layer_nodes);
    }
    let mut target = h.vertex("target");
    let tail = nodes.len().saturating_sub(3);
    for node in &nodes[tail..] {
        target = target.input(node.edge(0));
    }
    (nodes, target.build())
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 24, ..ProptestConfig::default() })]

    #[test]
    fn random_dags_solve_dedupe_and_cache(
        layers in prop::collection::vec(
            prop::collection::vec((0u8..3, prop::collection::vec(any::<prop::sample::Index>(), 0..3)), 1..4),
            1..4,
        )
    ) {
        let h = Harness::new();
        let (nodes, target) = build_dag(&h, &layers);

        let distinct: HashSet<_> = nodes
            .iter()
            .map(|n| n.digest())
            .chain(std::iter::once(target.digest()))
            .collect();

        // cold solve: every distinct vertex runs at most once
        let solver = h.solver();
        let result = solver.build(&CancelToken::new(), &target.edge(0)).unwrap();
        result.release().unwrap();
        let cold_execs = h.total_execs.load(Ordering::SeqCst);
        prop_assert!(cold_execs <= distinct.len());
        drop(solver);

        // warm solve on a fresh scheduler: fully served from cache
        let solver = h.solver();
        let result = solver.build(&CancelToken::new(), &target.edge(0)).unwrap();
        result.release().unwrap();
        prop_assert_eq!(h.total_execs.load(Ordering::SeqCst), cold_execs);
        prop_assert_eq!(solver.metrics().execs_started, 0);

        // quiescence: the wake queue drains
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        while solver.queued_wakeups() > 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        prop_assert_eq!(solver.queued_wakeups(), 0);
    }
}
