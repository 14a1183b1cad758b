//! Cleanup after forward reassociation.
//!
//! Rotations that did not end up collapsing constants leave constant
//! subexpressions buried inside operator chains. This pass moves them back
//! towards the root and factors common multiplicands out of sums.

use crate::ir::{BlockId, Graph, Op, ValueId};
use crate::{Options, Stats};

/// The deepest block in which both `a` and `b` are available, or `current`
/// if that is the start block.
///
/// Both blocks are expected to lie on one dominator chain.
fn earliest_block(graph: &Graph, a: ValueId, b: ValueId, current: BlockId) -> BlockId {
    let (block_a, block_b) = (graph.block(a), graph.block(b));
    let earliest = if graph.dominates(block_a, block_b) {
        block_b
    } else {
        block_a
    };
    if earliest == graph.start_block() {
        current
    } else {
        earliest
    }
}

/// A literal or link-time constant, or the sum of two of them.
fn is_constant_expr(graph: &Graph, v: ValueId) -> bool {
    match graph.op(v) {
        op if op.is_constlike() => true,
        Op::Add => graph.operands(v).iter().all(|&o| graph.op(o).is_constlike()),
        _ => false,
    }
}

/// `(a·x) ± (b·x) => (a ± b)·x` for multiplications, in any operand order,
/// and for left shifts by the same amount.
fn distributive(graph: &mut Graph, n: ValueId, stats: &mut Stats) -> Option<ValueId> {
    let (left, right) = (graph.operand(n, 0), graph.operand(n, 1));
    let op = graph.op(left);
    if op != graph.op(right) || !matches!(op, Op::Shl | Op::Mul) {
        return None;
    }

    let [l0, l1] = [graph.operand(left, 0), graph.operand(left, 1)];
    let [r0, r1] = [graph.operand(right, 0), graph.operand(right, 1)];
    let (x, a, b) = match op {
        Op::Shl if l1 == r1 => (l1, l0, r0),
        Op::Mul if l0 == r0 => (l0, l1, r1),
        Op::Mul if l0 == r1 => (l0, l1, r0),
        Op::Mul if l1 == r1 => (l1, l0, r0),
        Op::Mul if l1 == r0 => (l1, l0, r1),
        _ => return None,
    };

    let (sum_op, mode, current) = (graph.op(n), graph.mode(n), graph.block(n));
    let block = earliest_block(graph, a, b, current);
    let sum = graph.node(sum_op, mode, block, &[a, b]);
    let block = earliest_block(graph, sum, x, current);
    let irn = graph.node(op, mode, block, &[sum, x]);
    if irn == n {
        return None;
    }

    log::debug!("distributive: {} => ({} {} {}) {} {}", n, a, sum_op, b, op, x);
    graph.exchange(n, irn);
    stats.distributive += 1;
    Some(irn)
}

/// `(C OP b) OP r => (r OP b) OP C`, and the three symmetric variants, when
/// neither operand of the root is a constant expression yet.
fn move_consts_up(graph: &mut Graph, n: ValueId, stats: &mut Stats) -> Option<ValueId> {
    let (l, r) = (graph.operand(n, 0), graph.operand(n, 1));
    if is_constant_expr(graph, l) || is_constant_expr(graph, r) {
        return None;
    }

    let (op, mode) = (graph.op(n), graph.mode(n));
    let (a, b, c) = [(l, r), (r, l)].iter().find_map(|&(inner, outer)| {
        if graph.op(inner) != op || graph.mode(inner) != mode {
            return None;
        }
        let (a, b) = (graph.operand(inner, 0), graph.operand(inner, 1));
        if is_constant_expr(graph, a) {
            Some((outer, b, a))
        } else if is_constant_expr(graph, b) {
            Some((a, outer, b))
        } else {
            None
        }
    })?;

    // Two offsets of a reference would be added at their own width.
    let (mode_a, mode_b) = (graph.mode(a), graph.mode(b));
    if mode_a.is_int()
        && mode_b.is_int()
        && (mode_a != mode_b || (mode.is_reference() && mode_a.bits() < mode.bits()))
    {
        return None;
    }

    let current = graph.block(n);
    let block = earliest_block(graph, a, b, current);
    if !graph.dominates(graph.block(a), block) || !graph.dominates(graph.block(b), block) {
        return None;
    }

    let mode0 = graph.mode_from_operands(a, b);
    let mut irn = graph.node(op, mode0, block, &[a, b]);
    // Folding may have produced something other than `op`.
    if matches!(graph.op(irn), Op::Add | Op::Sub) {
        if let Some(factored) = distributive(graph, irn, stats) {
            irn = factored;
        }
    }

    let mode1 = graph.mode_from_operands(irn, c);
    let block = earliest_block(graph, irn, c, current);
    let irn1 = graph.node(op, mode1, block, &[irn, c]);
    if irn1 == n {
        return None;
    }

    log::debug!("move constant up: {} => ({} {} {}) {} {}", n, a, op, b, op, c);
    graph.exchange(n, irn1);
    stats.consts_moved_up += 1;
    Some(irn1)
}

/// Undo forward rewrites that did not collapse constants, visiting every
/// live node once in post-order.
pub fn run(graph: &mut Graph, options: &Options, stats: &mut Stats) {
    log::debug!("reverse cleanup start");

    for mut n in graph.live_nodes() {
        if graph.is_dead(n) {
            continue;
        }
        if graph.mode(n).is_float() && !options.imprecise_float_transforms {
            continue;
        }

        loop {
            let mut changed = false;
            if graph.op(n).is_commutative() {
                if let Some(new) = move_consts_up(graph, n, stats) {
                    n = new;
                    changed = true;
                }
            }
            if matches!(graph.op(n), Op::Add | Op::Sub) {
                if let Some(new) = distributive(graph, n, stats) {
                    n = new;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Mode;
    use crate::tarval::Tarval;

    #[test]
    fn constants_move_to_the_root() {
        let mut g = Graph::new();
        let start = g.start_block();
        let x = g.var(Mode::I32, start);
        let y = g.var(Mode::I32, start);
        let seven = g.constant(Tarval::from_i128(Mode::I32, 7));
        let inner = g.binop(Op::Add, start, x, seven);
        let outer = g.binop(Op::Add, start, inner, y);
        g.add_result(outer);

        let mut stats = Stats::default();
        run(&mut g, &Options::default(), &mut stats);

        let result = g.results()[0];
        assert_eq!(g.op(result), Op::Add);
        assert_eq!(g.operand(result, 1), seven);
        let sum = g.operand(result, 0);
        assert_eq!(g.op(sum), Op::Add);
        assert_eq!(g.operands(sum), &[x, y]);
        assert_eq!(stats.consts_moved_up, 1);
        g.verify().unwrap();
    }

    #[test]
    fn mismatched_widths_are_left_alone() {
        let mut g = Graph::new();
        let start = g.start_block();
        let i = g.var(Mode::I32, start);
        let j = g.var(Mode::I64, start);
        let sym = g.symbol("global");
        let global = g.node(Op::Address(sym), Mode::P64, start, &[]);
        let inner = g.binop(Op::Add, start, i, global);
        let outer = g.binop(Op::Add, start, inner, j);
        g.add_result(outer);
        g.verify().unwrap();

        let mut stats = Stats::default();
        run(&mut g, &Options::default(), &mut stats);

        assert_eq!(g.results(), &[outer]);
        assert_eq!(g.operands(outer), &[inner, j]);
        assert_eq!(stats, Stats::default());
    }

    #[test]
    fn narrow_offsets_are_not_summed_apart_from_the_pointer() {
        let mut g = Graph::new();
        let start = g.start_block();
        let x = g.var(Mode::I32, start);
        let y = g.var(Mode::I32, start);
        let p = g.var(Mode::P64, start);
        let sym = g.symbol("global");
        let global = g.node(Op::Address(sym), Mode::P64, start, &[]);

        // (global + x) + y would need x + y at 32 bits.
        let inner = g.binop(Op::Add, start, global, x);
        let offsets = g.binop(Op::Add, start, inner, y);
        // (x + 3) + p is an i32 sum used as one offset.
        let three = g.constant(Tarval::from_i128(Mode::I32, 3));
        let sum = g.binop(Op::Add, start, x, three);
        let pointer = g.binop(Op::Add, start, sum, p);
        g.add_result(offsets);
        g.add_result(pointer);

        let mut stats = Stats::default();
        run(&mut g, &Options::default(), &mut stats);

        assert_eq!(g.results(), &[offsets, pointer]);
        assert_eq!(g.operands(offsets), &[inner, y]);
        assert_eq!(g.operands(pointer), &[sum, p]);
        assert_eq!(stats, Stats::default());
        g.verify().unwrap();
    }

    #[test]
    fn factor_multiplications() {
        let mut g = Graph::new();
        let start = g.start_block();
        let a = g.var(Mode::I32, start);
        let b = g.var(Mode::I32, start);
        let x = g.var(Mode::I32, start);
        let ax = g.binop(Op::Mul, start, a, x);
        let xb = g.binop(Op::Mul, start, x, b);
        let diff = g.binop(Op::Sub, start, ax, xb);
        g.add_result(diff);

        let mut stats = Stats::default();
        run(&mut g, &Options::default(), &mut stats);

        let result = g.results()[0];
        assert_eq!(g.op(result), Op::Mul);
        assert_eq!(g.operand(result, 1), x);
        let inner = g.operand(result, 0);
        assert_eq!(g.op(inner), Op::Sub);
        assert_eq!(g.operands(inner), &[a, b]);
        assert_eq!(stats.distributive, 1);
        g.verify().unwrap();
    }

    #[test]
    fn shifts_need_the_same_amount_on_the_right() {
        let mut g = Graph::new();
        let start = g.start_block();
        let a = g.var(Mode::I32, start);
        let b = g.var(Mode::I32, start);
        let x = g.var(Mode::I32, start);
        let ax = g.binop(Op::Shl, start, a, x);
        let bx = g.binop(Op::Shl, start, b, x);
        let xb = g.binop(Op::Shl, start, x, b);
        let sum = g.binop(Op::Add, start, ax, bx);
        let other = g.binop(Op::Add, start, ax, xb);
        g.add_result(sum);
        g.add_result(other);

        run(&mut g, &Options::default(), &mut Stats::default());

        let [sum, other] = [g.results()[0], g.results()[1]];
        assert_eq!(g.op(sum), Op::Shl);
        assert_eq!(g.operand(sum, 1), x);
        assert_eq!(g.op(other), Op::Add);
        g.verify().unwrap();
    }

    #[test]
    fn placement_stays_out_of_the_start_block() {
        let mut g = Graph::new();
        let start = g.start_block();
        let body = g.new_block(start, None);
        let x = g.var(Mode::I32, start);
        let y = g.var(Mode::I32, start);
        let seven = g.constant(Tarval::from_i128(Mode::I32, 7));
        let inner = g.binop(Op::Mul, body, seven, x);
        let outer = g.binop(Op::Mul, body, y, inner);
        g.add_result(outer);

        run(&mut g, &Options::default(), &mut Stats::default());

        let result = g.results()[0];
        assert_eq!(g.block(result), body);
        assert_eq!(g.block(g.operand(result, 0)), body);
        g.verify().unwrap();
    }
}
