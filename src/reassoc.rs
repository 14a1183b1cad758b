//! Forward reassociation of commutative operator chains.
//!
//! Chains like `c1 + (c2 + x)` are rotated into `x + (c1 + c2)` so that the
//! constants meet and fold. The engine runs a per-node fixpoint nested inside
//! a global worklist fixpoint.

use crate::ir::{BlockId, Graph, Mode, Op, ValueId};
use crate::{Options, Stats};
use std::collections::VecDeque;

/// How constant a value is, relative to some block.
///
/// The discriminants are bit flags so that the rotation guard can combine
/// three classes with a parity test.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConstClass {
    /// Varies within the block's loop, or is not otherwise constant.
    NonConstant = 0,

    /// A literal, or a symbol's address, offset, alignment or size.
    RealConstant = 1,

    /// Invariant within the block's innermost loop, but not foldable.
    RegionConstant = 2,
}

/// Classify `v` relative to `block`.
pub fn const_class(graph: &Graph, v: ValueId, block: BlockId) -> ConstClass {
    let op = graph.op(v);
    if op.is_constlike() {
        return ConstClass::RealConstant;
    }
    // `bad` is trivially loop invariant but must never be folded or hoisted.
    if op != Op::Bad && graph.is_loop_invariant(v, block) {
        return ConstClass::RegionConstant;
    }
    ConstClass::NonConstant
}

/// Order the operands of the commutative binary node `n` into
/// `(value, constant)`, where `constant` is the more constant of the two.
///
/// Real constants win over region constants. When both operands are real
/// constants, a reference-typed left operand is kept as the value so that
/// pointer constants stay in place.
pub fn commutative_operands(graph: &Graph, n: ValueId) -> (ValueId, ValueId) {
    debug_assert!(graph.op(n).is_commutative());
    let (left, right) = (graph.operand(n, 0), graph.operand(n, 1));
    let block = graph.block(n);
    let class_left = const_class(graph, left, block);
    let class_right = const_class(graph, right, block);

    match (class_left, class_right) {
        (ConstClass::RealConstant, ConstClass::RealConstant) => {
            if graph.mode(left).is_reference() {
                (left, right)
            } else {
                (right, left)
            }
        }
        (ConstClass::RealConstant, _)
        | (ConstClass::RegionConstant, ConstClass::NonConstant) => (right, left),
        _ => (left, right),
    }
}

type Rule = fn(&mut Graph, ValueId, &mut Stats) -> Option<ValueId>;

/// The forward rewrite rule for nodes of `op`, if any.
fn reassociate_rule(op: Op) -> Option<Rule> {
    match op {
        Op::Add | Op::Mul | Op::And | Op::Or | Op::Eor => Some(reassoc_commutative),
        _ => None,
    }
}

/// The class of `v` as the rotation guard sees it.
///
/// Only literals fold when they meet. A symbolic constant (address, offset,
/// alignment or size) stays a node next to whatever it is combined with, so
/// for the guard it behaves like a region constant.
fn guard_class(graph: &Graph, v: ValueId, class: ConstClass) -> ConstClass {
    if class == ConstClass::RealConstant && graph.tarval(v).is_none() {
        ConstClass::RegionConstant
    } else {
        class
    }
}

/// Would rotating `c1 OP (c2 OP t2)` produce a node that rotates straight
/// back?
///
/// Two literals around a non-constant always merge into one folded
/// constant, so that case is let through.
fn rotation_cycles(c1: ConstClass, c2: ConstClass, t2: ConstClass) -> bool {
    use ConstClass::*;
    if (c1, c2, t2) == (RealConstant, RealConstant, NonConstant) {
        return false;
    }
    let region = RegionConstant as u8;
    ((c1 as u8 ^ c2 as u8 ^ t2 as u8) & region) == 0
        || (c1 == RegionConstant && c2 == RegionConstant && t2 == RegionConstant)
}

/// Bring `c1` and `c2` to a common integer mode, converting the narrower
/// one. At equal widths the real constant is the one converted.
///
/// In a reference chain of `mode` every offset is extended on its own, by its
/// own signedness. Offsets narrower than the reference are therefore widened
/// to the reference width before they are combined, even when their modes
/// agree: `p + (-2:i32 + 4294967289:u32)` must not become `p + -9:i32`.
fn unify_modes(
    graph: &mut Graph,
    block: BlockId,
    mode: Mode,
    (c1, class_c1): (ValueId, ConstClass),
    c2: ValueId,
) -> (ValueId, ValueId) {
    let (mode_c1, mode_c2) = (graph.mode(c1), graph.mode(c2));
    if !mode_c1.is_int() || !mode_c2.is_int() {
        return (c1, c2);
    }
    if mode.is_reference() && mode_c1.bits().min(mode_c2.bits()) < mode.bits() {
        let offset = Mode::Int {
            bits: mode.bits(),
            signed: true,
        };
        return (graph.conv(block, c1, offset), graph.conv(block, c2, offset));
    }
    if mode_c1 == mode_c2 {
        return (c1, c2);
    }
    if mode_c1.bits() > mode_c2.bits() {
        (c1, graph.conv(block, c2, mode_c1))
    } else if mode_c1.bits() < mode_c2.bits() || class_c1 == ConstClass::RealConstant {
        (graph.conv(block, c1, mode_c2), c2)
    } else {
        (c1, graph.conv(block, c2, mode_c1))
    }
}

fn reassoc_commutative(graph: &mut Graph, n: ValueId, stats: &mut Stats) -> Option<ValueId> {
    let (op, mode) = (graph.op(n), graph.mode(n));
    let block = graph.block(n);
    let (mut t1, mut c1) = commutative_operands(graph, n);
    // An integer sum feeding a reference sum wraps at its own width, so it is
    // not part of the same chain.
    let chained = |graph: &Graph, v: ValueId| graph.op(v) == op && graph.mode(v) == mode;

    if chained(graph, t1) {
        let (t2, c2) = commutative_operands(graph, t1);
        let class_c1 = const_class(graph, c1, block);
        let class_c2 = const_class(graph, c2, block);
        let class_t2 = const_class(graph, t2, block);

        if class_c1 != ConstClass::NonConstant {
            if rotation_cycles(
                guard_class(graph, c1, class_c1),
                guard_class(graph, c2, class_c2),
                guard_class(graph, t2, class_t2),
            ) {
                return None;
            }

            // c1 OP (c2 OP t2) => t2 OP (c1 OP c2)
            let (c1, c2) = unify_modes(graph, block, mode, (c1, class_c1), c2);
            let mode0 = graph.mode_from_operands(c1, c2);
            let irn0 = graph.node(op, mode0, block, &[c1, c2]);
            let mode1 = graph.mode_from_operands(t2, irn0);
            let irn1 = graph.node(op, mode1, block, &[t2, irn0]);
            if irn1 == n {
                return None;
            }

            log::debug!(
                "rotate: {} {op} ({} {op} {}) => {} {op} ({} {op} {})",
                c1,
                c2,
                t2,
                t2,
                c1,
                c2,
                op = op
            );
            graph.exchange(n, irn1);
            stats.rotations += 1;
            return Some(irn1);
        }
    }

    if chained(graph, c1) {
        std::mem::swap(&mut t1, &mut c1);
    }
    // `c1 + c1` of an offset would wrap before it is extended.
    if !chained(graph, t1) || graph.mode(c1) != mode {
        return None;
    }

    let (mut l, mut r) = (graph.operand(t1, 0), graph.operand(t1, 1));
    if r == c1 {
        std::mem::swap(&mut l, &mut r);
    }
    // A constant below would be rotated right back up.
    if const_class(graph, r, block) != ConstClass::NonConstant {
        return None;
    }
    if l != c1 || r == c1 {
        return None;
    }

    // c1 OP (c1 OP r) => r OP (c1 OP c1)
    let irn0 = graph.node(op, mode, block, &[c1, c1]);
    let irn1 = graph.node(op, mode, block, &[r, irn0]);
    if irn1 == n {
        return None;
    }

    log::debug!(
        "self-annihilate: {} {op} ({} {op} {}) => {} {op} ({} {op} {})",
        c1,
        c1,
        r,
        r,
        c1,
        c1,
        op = op
    );
    graph.exchange(n, irn1);
    stats.self_annihilations += 1;
    Some(irn1)
}

fn skip_mode(mode: Mode, options: &Options) -> bool {
    mode.is_float() && !options.imprecise_float_transforms
}

/// Run the forward reassociation engine to its fixpoint.
///
/// # Panics
///
/// Panics if the engine exceeds its rewrite budget, which means the
/// rotation guard failed to prevent a rewrite cycle.
pub fn run(graph: &mut Graph, options: &Options, stats: &mut Stats) {
    log::debug!("reassociation start");

    let mut queue = VecDeque::new();
    let mut queued = vec![];
    for v in graph.live_nodes() {
        enqueue(&mut queue, &mut queued, v);
    }

    let live = queue.len() + 1;
    let mut budget = live.saturating_mul(live).saturating_mul(4);

    while let Some(mut n) = queue.pop_front() {
        queued[n.index()] = false;
        if graph.is_dead(n) {
            continue;
        }

        let mut changed = false;
        loop {
            if skip_mode(graph.mode(n), options) {
                break;
            }
            let rule = match reassociate_rule(graph.op(n)) {
                Some(rule) => rule,
                None => break,
            };
            match rule(graph, n, stats) {
                Some(new) => {
                    assert!(
                        budget > 0,
                        "reassociation does not terminate: rewrite budget exhausted at {}",
                        new
                    );
                    budget -= 1;
                    n = new;
                    changed = true;
                }
                None => break,
            }
        }

        if changed {
            for i in 0..graph.operands(n).len() {
                let operand = graph.operand(n, i);
                enqueue(&mut queue, &mut queued, operand);
            }
        }
    }
}

fn enqueue(queue: &mut VecDeque<ValueId>, queued: &mut Vec<bool>, v: ValueId) {
    if queued.len() <= v.index() {
        queued.resize(v.index() + 1, false);
    }
    if !queued[v.index()] {
        queued[v.index()] = true;
        queue.push_back(v);
    }
}
