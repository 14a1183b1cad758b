//! Reassociation and bit-wise redundancy elimination over an SSA value graph.
//!
//! This crate rewrites the pure value computations of one function:
//!
//! * chains of commutative, associative operators are rotated so that their
//!   constants meet and fold (`3 + (5 + x)` becomes `x + 8`),
//! * rotations that did not pay off are undone afterwards, moving constants
//!   back towards the root and factoring `a*x + b*x` into `(a + b)*x`,
//! * `and` / `or` nodes whose operands reconverge through bit-wise operators
//!   have the redundant occurrence replaced by a constant (Shannon expansion),
//! * an `a ^ b` operand of an `and` / `or` is used to rewrite `b` in terms of
//!   `a` inside the sibling operand.
//!
//! ## The value graph
//!
//! The graph, its blocks, loops and use-edges live in the `ssa_reassoc::ir`
//! module. Nodes are created through construct-and-fold, which folds
//! constants and reuses structurally identical nodes.
//!
//! ## Running the passes
//!
//! [`optimize`] runs the whole pipeline with default [`Options`];
//! [`optimize_with`] takes explicit options and reports what fired. Each pass
//! is also exposed on its own: [`shannon::run`], [`equality::run`],
//! [`reassoc::run`] and [`reverse::run`].
//!
//! ## Text format
//!
//! When the `parse` Cargo feature is enabled, the `ssa_reassoc::parse` module
//! reads graphs from a small line-oriented text format. When the `stringify`
//! Cargo feature is enabled, graphs implement `Display` in that same format.
//!
//! ```text
//! %x:i32 = var
//! %0:i32 = add 5, %x
//! %1:i32 = add 3, %0
//! return %1
//! ```

#![deny(missing_debug_implementations)]
#![deny(missing_docs)]

pub mod equality;
mod fold;
pub mod ir;
pub mod reassoc;
pub mod reverse;
pub mod shannon;
pub mod tarval;

#[cfg(feature = "parse")]
pub mod parse;
#[cfg(feature = "stringify")]
pub mod stringify;

use ir::{BlockId, Graph, Mode, Op, PinState, ValueId};
use std::collections::HashMap;

/// Knobs for [`optimize_with`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Options {
    /// Allow reassociating floating point computations, which is not bit
    /// exact.
    pub imprecise_float_transforms: bool,
}

/// How often each rewrite fired during one [`optimize_with`] run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// `c1 OP (c2 OP x) => x OP (c1 OP c2)`.
    pub rotations: usize,

    /// `x OP (x OP y) => y OP (x OP x)`.
    pub self_annihilations: usize,

    /// Constant expressions moved back towards the root of a chain.
    pub consts_moved_up: usize,

    /// `a*x ± b*x => (a ± b)*x` and the same for left shifts.
    pub distributive: usize,

    /// Operands replaced by a constant forced through Shannon expansion.
    pub shannon_substitutions: usize,

    /// Shannon candidates that no longer held when their turn came.
    pub shannon_dropped: usize,

    /// Operands rewritten through an `xor` difference.
    pub equality_substitutions: usize,
}

impl Stats {
    /// The total number of rewrites, not counting dropped candidates.
    pub fn rewrites(&self) -> usize {
        self.rotations
            + self.self_annihilations
            + self.consts_moved_up
            + self.distributive
            + self.shannon_substitutions
            + self.equality_substitutions
    }

    /// Did any rewrite fire?
    pub fn changed(&self) -> bool {
        self.rewrites() > 0
    }
}

/// The pass sequence is repeated until a round rewrites nothing, or this many
/// rounds have run.
pub const MAX_ROUNDS: usize = 16;

/// The structure of the live graph with node identities replaced by their
/// position in [`Graph::live_nodes`] order.
type Shape = (Vec<(Op, Mode, BlockId, Vec<usize>)>, Vec<usize>);

fn shape(graph: &Graph) -> Shape {
    let live = graph.live_nodes();
    let position: HashMap<ValueId, usize> =
        live.iter().enumerate().map(|(i, &v)| (v, i)).collect();
    let nodes = live
        .iter()
        .map(|&v| {
            let operands = graph.operands(v).iter().map(|o| position[o]).collect();
            (graph.op(v), graph.mode(v), graph.block(v), operands)
        })
        .collect();
    let results = graph.results().iter().map(|r| position[r]).collect();
    (nodes, results)
}

/// Run every pass over `graph` with default [`Options`].
///
/// # Panics
///
/// Panics if the graph is malformed; see [`optimize_with`].
pub fn optimize(graph: &mut Graph) {
    optimize_with(graph, &Options::default());
}

/// Run every pass over `graph`: Shannon redundancy elimination, equality
/// substitution, forward reassociation and the reverse cleanup, with local
/// folding after the substitution passes and at the end.
///
/// A round can expose work for an earlier pass (the reverse cleanup may
/// leave two constants next to each other, for instance), so the sequence is
/// repeated until a round rewrites nothing. Inside loops, the forward rules
/// gather loop-invariant operands around a constant and the reverse cleanup
/// pulls the constant back out, so a round can rewrite without changing the
/// graph; repetition also stops when a round reproduces the graph the
/// previous round ended with, and after at most [`MAX_ROUNDS`] rounds.
///
/// # Panics
///
/// Panics if the graph is floating or fails [`Graph::verify`]. A broken
/// graph is an internal consistency error of whoever built it.
pub fn optimize_with(graph: &mut Graph, options: &Options) -> Stats {
    assert_eq!(
        graph.pin_state(),
        PinState::Pinned,
        "reassociation needs a pinned graph"
    );
    graph.remove_unreachable();
    if let Err(e) = graph.verify() {
        panic!("cannot optimize a malformed graph: {}", e);
    }

    let mut stats = Stats::default();
    let mut last_shape = None;
    for round in 0..MAX_ROUNDS {
        let before = stats.rewrites();

        shannon::run(graph, &mut stats);
        equality::run(graph, &mut stats);
        graph.local_optimize();

        reassoc::run(graph, options, &mut stats);
        reverse::run(graph, options, &mut stats);
        graph.local_optimize();

        debug_assert!(graph.verify().is_ok());
        if stats.rewrites() == before {
            log::debug!("optimize: fixpoint after {} rounds: {:?}", round + 1, stats);
            return stats;
        }

        let shape = shape(graph);
        if last_shape.as_ref() == Some(&shape) {
            log::debug!(
                "optimize: round {} reproduced the previous graph: {:?}",
                round + 1,
                stats
            );
            return stats;
        }
        last_shape = Some(shape);
    }

    log::debug!("optimize: stopped after {} rounds: {:?}", MAX_ROUNDS, stats);
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tarval::Tarval;

    #[test]
    fn shannon_then_folding() {
        let _ = env_logger::try_init();

        let mut g = Graph::new();
        let start = g.start_block();
        let x = g.var(Mode::I32, start);
        let y = g.var(Mode::I32, start);
        let not_x = g.unop(Op::Not, start, x);
        let other = g.binop(Op::And, start, x, y);
        let base = g.binop(Op::And, start, not_x, other);
        g.add_result(base);

        let stats = optimize_with(&mut g, &Options::default());
        assert_eq!(stats.shannon_substitutions, 1);
        let result = g.results()[0];
        assert_eq!(g.tarval(result), Some(Tarval::null(Mode::I32)));
    }

    #[test]
    fn second_run_changes_nothing() {
        let _ = env_logger::try_init();

        let mut g = Graph::new();
        let start = g.start_block();
        let x = g.var(Mode::I32, start);
        let y = g.var(Mode::I32, start);
        let three = g.constant(Tarval::from_i128(Mode::I32, 3));
        let five = g.constant(Tarval::from_i128(Mode::I32, 5));
        let a = g.binop(Op::Add, start, x, three);
        let b = g.binop(Op::Add, start, a, y);
        let c = g.binop(Op::Add, start, five, b);
        g.add_result(c);

        assert!(optimize_with(&mut g, &Options::default()).changed());
        let stats = optimize_with(&mut g, &Options::default());
        assert!(!stats.changed(), "{:?}", stats);
    }

    #[test]
    fn loop_invariant_sums_settle() {
        let _ = env_logger::try_init();

        let mut g = Graph::new();
        let start = g.start_block();
        let l = g.new_loop(None);
        let body = g.new_block(start, Some(l));
        let n = g.var(Mode::I32, start);
        let i = g.var(Mode::I32, body);
        let one = g.constant(Tarval::from_i128(Mode::I32, 1));
        let a = g.binop(Op::Add, body, i, one);
        let b = g.binop(Op::Add, body, a, n);
        g.add_result(b);

        optimize(&mut g);
        let settled = shape(&g);
        let stats = optimize_with(&mut g, &Options::default());
        assert_eq!(settled, shape(&g), "{:?}", stats);

        let result = g.results()[0];
        assert_eq!(g.op(result), Op::Add);
        assert_eq!(g.operand(result, 1), one);
        assert_eq!(g.operands(g.operand(result, 0)), &[i, n]);
    }

    #[test]
    #[should_panic(expected = "pinned")]
    fn floating_graphs_are_rejected() {
        let mut g = Graph::new();
        g.set_pin_state(PinState::Floating);
        optimize(&mut g);
    }

    #[test]
    #[should_panic(expected = "malformed")]
    fn malformed_graphs_are_rejected() {
        let mut g = Graph::new();
        let start = g.start_block();
        let x = g.var(Mode::I32, start);
        let y = g.var(Mode::I64, start);
        let a = g.node(Op::Or, Mode::I32, start, &[x, y]);
        g.add_result(a);
        optimize(&mut g);
    }
}
