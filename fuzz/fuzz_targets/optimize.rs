#![no_main]

use libfuzzer_sys::fuzz_target;
use ssa_reassoc_tests::{assert_equivalent, build_graph};

fuzz_target!(|data: &[u8]| {
    let _ = env_logger::try_init();

    let mut bytes = data.iter().copied();
    let graph = build_graph(&mut |n| bytes.next().map_or(0, |b| usize::from(b) % n));
    log::debug!("input graph = \"\"\"\n{}\"\"\"", graph);

    let mut optimized = graph.clone();
    ssa_reassoc::optimize(&mut optimized);
    log::debug!("optimized graph = \"\"\"\n{}\"\"\"", optimized);
    if let Err(e) = optimized.verify() {
        panic!("optimized graph is broken: {}", e);
    }

    let mut seed = data.iter().fold(0i128, |h, &b| h.wrapping_mul(257) ^ i128::from(b));
    assert_equivalent(&graph, &optimized, &mut || {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        seed >> 32
    });
});
