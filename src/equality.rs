//! Equality substitution through an `xor` difference.
//!
//! Wherever `a ^ b` is one, `b == ~a`; wherever it is zero, `b == a`. So
//! inside a bit-wise sibling subtree of an `and` / `or` with `a ^ b`, one of
//! the two variables can be rewritten in terms of the other:
//!
//! ```text
//!  (a ^ b) & f(a, b)  =>   (a ^ b) & f(a, ~a)
//! ~(a ^ b) & f(a, b)  =>  ~(a ^ b) & f(a,  a)
//!  (a ^ b) | f(a, b)  =>   (a ^ b) | f(a,  a)
//! ~(a ^ b) | f(a, b)  =>  ~(a ^ b) | f(a, ~a)
//! ```

use crate::ir::{Graph, Op, ValueId};
use crate::Stats;

/// Which of the two variables a subtree search ran into first.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Match {
    NotFound,
    FoundFirst,
    FoundSecond,
}

struct Frame {
    node: ValueId,
    next_slot: usize,
    a: ValueId,
    b: ValueId,
    replace: bool,
    ret: Match,
}

impl Frame {
    fn new(node: ValueId, a: ValueId, b: ValueId, replace: bool) -> Self {
        Frame {
            node,
            next_slot: 0,
            a,
            b,
            replace,
            ret: if replace {
                Match::FoundFirst
            } else {
                Match::NotFound
            },
        }
    }

    /// Fold a child's search result into this frame.
    fn absorb(&mut self, child: Match) {
        if child == Match::NotFound {
            return;
        }
        if child == Match::FoundSecond {
            std::mem::swap(&mut self.a, &mut self.b);
        }
        if !self.replace {
            self.ret = child;
        }
        self.replace = true;
    }
}

/// Only nodes whose single consumer is the one we came from may be rewritten.
fn eligible(graph: &Graph, v: ValueId) -> bool {
    graph.op(v).is_bitop() && graph.use_count(v) == 1
}

/// Walk the single-consumer bit-wise tree below `root`, replacing `a` with
/// `b` (or `~b` when `need_not`) once both have been seen along the walk.
fn replace_until_other_user(
    graph: &mut Graph,
    stats: &mut Stats,
    root: ValueId,
    a: ValueId,
    b: ValueId,
    need_not: bool,
    replace: bool,
) {
    if !eligible(graph, root) {
        return;
    }

    let mut stack = vec![Frame::new(root, a, b, replace)];
    while let Some(frame) = stack.last_mut() {
        if frame.next_slot == graph.operands(frame.node).len() {
            let ret = frame.ret;
            stack.pop();
            if let Some(parent) = stack.last_mut() {
                parent.absorb(ret);
            }
            continue;
        }

        let slot = frame.next_slot;
        frame.next_slot += 1;
        let t = graph.operand(frame.node, slot);

        if t == frame.a {
            if frame.replace {
                substitute(graph, stats, frame.node, slot, frame.b, need_not);
            } else {
                frame.replace = true;
                std::mem::swap(&mut frame.a, &mut frame.b);
                frame.ret = Match::FoundSecond;
            }
        } else if t == frame.b {
            if !frame.replace {
                frame.replace = true;
                frame.ret = Match::FoundFirst;
            }
        } else if eligible(graph, t) {
            let child = Frame::new(t, frame.a, frame.b, frame.replace);
            stack.push(child);
        }
    }
}

fn substitute(
    graph: &mut Graph,
    stats: &mut Stats,
    node: ValueId,
    slot: usize,
    b: ValueId,
    need_not: bool,
) {
    // `b` has to be available where `node` is computed.
    if !graph.dominates(graph.block(b), graph.block(node)) {
        return;
    }
    let value = if need_not {
        let block = graph.block(b);
        graph.unop(Op::Not, block, b)
    } else {
        b
    };
    log::debug!(
        "equality: {} operand {} ({}) => {}",
        node,
        slot,
        graph.operand(node, slot),
        value
    );
    graph.set_operand(node, slot, value);
    stats.equality_substitutions += 1;
}

fn walk_equality(graph: &mut Graph, stats: &mut Stats, node: ValueId) {
    let op = graph.op(node);
    if op != Op::And && op != Op::Or {
        return;
    }

    let (l, r) = (graph.operand(node, 0), graph.operand(node, 1));
    let mut need_not = op == Op::And;
    let wrapped_eor = |v: ValueId| {
        if graph.op(v) == Op::Not && graph.op(graph.operand(v, 0)) == Op::Eor {
            Some(graph.operand(v, 0))
        } else {
            None
        }
    };

    let (eor, f) = if let Some(eor) = wrapped_eor(l) {
        need_not = !need_not;
        (eor, r)
    } else if graph.op(l) == Op::Eor {
        (l, r)
    } else if let Some(eor) = wrapped_eor(r) {
        need_not = !need_not;
        (eor, l)
    } else if graph.op(r) == Op::Eor {
        (r, l)
    } else {
        return;
    };

    let (mut a, mut b) = (graph.operand(eor, 0), graph.operand(eor, 1));
    if a == b {
        return;
    }

    if graph.op(b).is_constlike() {
        replace_until_other_user(graph, stats, f, a, b, need_not, true);
    } else if graph.op(a).is_constlike() {
        replace_until_other_user(graph, stats, f, b, a, need_not, true);
    } else {
        if graph.op(a) == Op::Not {
            need_not = !need_not;
            a = graph.operand(a, 0);
        }
        if graph.op(b) == Op::Not {
            need_not = !need_not;
            b = graph.operand(b, 0);
        }
        replace_until_other_user(graph, stats, f, a, b, need_not, false);
    }
}

/// Apply equality substitution below every `and` / `or` node. Substituted
/// operands are left for [`Graph::local_optimize`] to fold.
pub fn run(graph: &mut Graph, stats: &mut Stats) {
    log::debug!("equality substitution start");

    for node in graph.live_nodes() {
        if !graph.is_dead(node) {
            walk_equality(graph, stats, node);
        }
    }
}
