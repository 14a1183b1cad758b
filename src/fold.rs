//! Local folding applied by construct-and-fold.
//!
//! Only integer and reference computations are folded; float values are
//! carried through untouched.

use crate::ir::{Graph, Mode, Op, ValueId};
use crate::tarval::Tarval;

/// The outcome of folding one node.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Folded {
    /// The node computes an existing value.
    Value(ValueId),
    /// The node computes a constant.
    Constant(Tarval),
    /// Nothing to simplify.
    Unchanged,
}

/// Try to simplify `op(operands)` of `mode` without creating it.
pub(crate) fn fold(graph: &Graph, op: Op, mode: Mode, operands: &[ValueId]) -> Folded {
    if mode.is_float() || operands.is_empty() {
        return Folded::Unchanged;
    }
    if operands.iter().any(|&o| graph.mode(o).is_float()) {
        return Folded::Unchanged;
    }

    let konst = |v: ValueId| graph.tarval(v);
    // A bare operand can only stand in for the node if the modes agree.
    let same = |v: ValueId| {
        if graph.mode(v) == mode {
            Folded::Value(v)
        } else {
            Folded::Unchanged
        }
    };

    if let [x] = *operands {
        return match op {
            Op::Not => match konst(x) {
                Some(c) => Folded::Constant(c.not()),
                None if graph.op(x) == Op::Not => same(graph.operand(x, 0)),
                None => Folded::Unchanged,
            },
            Op::Minus => match konst(x) {
                Some(c) => Folded::Constant(c.neg()),
                None if graph.op(x) == Op::Minus => same(graph.operand(x, 0)),
                None => Folded::Unchanged,
            },
            Op::Conv => match konst(x) {
                _ if graph.mode(x) == mode => Folded::Value(x),
                Some(c) => Folded::Constant(c.convert(mode)),
                None => Folded::Unchanged,
            },
            _ => Folded::Unchanged,
        };
    }

    let (a, b) = match *operands {
        [a, b] => (a, b),
        _ => return Folded::Unchanged,
    };
    let (ka, kb) = (konst(a), konst(b));

    if let (Some(x), Some(y)) = (ka, kb) {
        let x = x.convert(mode);
        let tv = match op {
            Op::Add => x.add(y.convert(mode)),
            Op::Sub => x.sub(y.convert(mode)),
            Op::Mul => x.mul(y.convert(mode)),
            Op::And => x.and(y.convert(mode)),
            Op::Or => x.or(y.convert(mode)),
            Op::Eor => x.eor(y.convert(mode)),
            Op::Shl => x.shl(y),
            Op::Shr => x.shr(y),
            Op::Shrs => x.shrs(y),
            _ => return Folded::Unchanged,
        };
        return Folded::Constant(tv);
    }

    let null = |k: Option<Tarval>| k.map_or(false, |t| t.is_null());
    let all_one = |k: Option<Tarval>| k.map_or(false, |t| t.is_all_one());
    let one = |k: Option<Tarval>| k.map_or(false, |t| t.is_one());
    let complement = || {
        (graph.op(a) == Op::Not && graph.operand(a, 0) == b)
            || (graph.op(b) == Op::Not && graph.operand(b, 0) == a)
    };

    match op {
        Op::Add if null(kb) => same(a),
        Op::Add if null(ka) => same(b),
        Op::Sub if null(kb) => same(a),
        Op::Sub if a == b => Folded::Constant(Tarval::null(mode)),
        Op::Mul if null(ka) || null(kb) => Folded::Constant(Tarval::null(mode)),
        Op::Mul if one(kb) => same(a),
        Op::Mul if one(ka) => same(b),
        Op::And if a == b => same(a),
        Op::And if null(ka) || null(kb) => Folded::Constant(Tarval::null(mode)),
        Op::And if all_one(kb) => same(a),
        Op::And if all_one(ka) => same(b),
        Op::And if complement() => Folded::Constant(Tarval::null(mode)),
        Op::Or if a == b => same(a),
        Op::Or if null(kb) => same(a),
        Op::Or if null(ka) => same(b),
        Op::Or if all_one(ka) || all_one(kb) => Folded::Constant(Tarval::all_one(mode)),
        Op::Or if complement() => Folded::Constant(Tarval::all_one(mode)),
        Op::Eor if a == b => Folded::Constant(Tarval::null(mode)),
        Op::Eor if null(kb) => same(a),
        Op::Eor if null(ka) => same(b),
        Op::Eor if complement() => Folded::Constant(Tarval::all_one(mode)),
        Op::Shl | Op::Shr | Op::Shrs if null(kb) => same(a),
        Op::Shl | Op::Shr | Op::Shrs if null(ka) => Folded::Constant(Tarval::null(mode)),
        _ => Folded::Unchanged,
    }
}
