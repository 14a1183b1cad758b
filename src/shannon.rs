//! Shannon redundancy elimination for bit-wise `and` / `or`.
//!
//! In `base = middle & other` where `middle` is `~top` or `top ^ C`, every bit
//! in which `base` can be one has `middle` equal to one, which pins `top` to
//! a known value. If `other` reaches `top` again purely through bit-wise
//! operators, that occurrence can be replaced by the pinned constant. `or`
//! works the same way with zeros.
//!
//! Candidates are collected in a read-only search first and applied
//! afterwards, revalidating each one right before it is committed.

use crate::ir::{Graph, Op, ValueId};
use crate::tarval::Tarval;
use crate::Stats;
use std::collections::HashMap;

/// A detected redundancy: `top` inside `other` is forced by `base`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    /// The `and` / `or` node.
    pub base: ValueId,
    /// `~top` or `top ^ C`, when `top` is wrapped.
    pub middle: Option<ValueId>,
    /// The value whose occurrence is replaced.
    pub top: ValueId,
    /// The node that reads `top` along the reconverging path.
    pub other: ValueId,
}

/// If `v` is `~t` or `t ^ C`, return `t`.
fn top_of_middle(graph: &Graph, v: ValueId) -> Option<ValueId> {
    match graph.op(v) {
        Op::Not => Some(graph.operand(v, 0)),
        Op::Eor => {
            let (l, r) = (graph.operand(v, 0), graph.operand(v, 1));
            if graph.tarval(r).is_some() {
                Some(l)
            } else if graph.tarval(l).is_some() {
                Some(r)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// The constant operand of a `t ^ C` middle node.
fn eor_tarval(graph: &Graph, v: ValueId) -> Option<Tarval> {
    graph
        .operands(v)
        .iter()
        .find_map(|&o| graph.tarval(o))
}

struct Search<'a> {
    graph: &'a Graph,
    counters: HashMap<ValueId, u32>,
    walk_base: u32,
    walk_max: u32,
    candidates: Vec<Candidate>,
}

impl<'a> Search<'a> {
    fn new(graph: &'a Graph) -> Self {
        Search {
            graph,
            counters: HashMap::new(),
            walk_base: 0,
            walk_max: 0,
            candidates: vec![],
        }
    }

    fn try_base(&mut self, base: ValueId) {
        if !matches!(self.graph.op(base), Op::And | Op::Or) {
            return;
        }
        let (mut l, mut r) = (self.graph.operand(base, 0), self.graph.operand(base, 1));
        for _ in 0..2 {
            let (middle, top) = match top_of_middle(self.graph, l) {
                Some(top) => (Some(l), top),
                None => (None, l),
            };
            self.walk_base = self.walk_max;
            self.find_path_to_top(r, base, middle, top);
            std::mem::swap(&mut l, &mut r);
        }
    }

    /// Depth-first search from `start` for `top` (or a shared `middle`),
    /// expanding each bit-wise node only once all of its users have reached
    /// it during this walk.
    fn find_path_to_top(
        &mut self,
        start: ValueId,
        base: ValueId,
        middle: Option<ValueId>,
        top: ValueId,
    ) {
        let graph = self.graph;
        let shared_middle = middle.map_or(false, |m| graph.use_count(m) > 1);

        let mut stack = vec![(start, base)];
        while let Some((current, from)) = stack.pop() {
            let (top2, middle2) = if Some(current) == middle {
                (current, None)
            } else {
                (top, middle)
            };

            if current == top2 && (shared_middle || from != base) {
                let candidate = Candidate {
                    base,
                    middle: middle2,
                    top: top2,
                    other: from,
                };
                log::trace!("shannon candidate: {:?}", candidate);
                self.candidates.push(candidate);
                continue;
            }

            let counter = self.counters.entry(current).or_insert(0);
            *counter = (*counter).max(self.walk_base) + 1;
            let visits = *counter - self.walk_base;
            self.walk_max = self.walk_max.max(*counter);

            if visits as usize == graph.use_count(current) && graph.op(current).is_bitop() {
                for &operand in graph.operands(current).iter().rev() {
                    stack.push((operand, current));
                }
            }
        }
    }
}

/// Is `operand` one of `node`'s operands?
fn has_operand(graph: &Graph, node: ValueId, operand: ValueId) -> bool {
    graph.operands(node).contains(&operand)
}

fn still_valid(graph: &Graph, c: &Candidate) -> bool {
    let live = [Some(c.base), c.middle, Some(c.top), Some(c.other)];
    if live.iter().flatten().any(|&v| graph.is_dead(v)) {
        return false;
    }
    let chain = match c.middle {
        Some(middle) => has_operand(graph, middle, c.top) && has_operand(graph, c.base, middle),
        None => has_operand(graph, c.base, c.top),
    };
    chain && has_operand(graph, c.other, c.top)
}

/// Collect every Shannon candidate of the graph without mutating it.
pub fn find_candidates(graph: &Graph) -> Vec<Candidate> {
    let mut search = Search::new(graph);
    for base in graph.live_nodes() {
        search.try_base(base);
    }
    search.candidates
}

/// Find and apply all Shannon redundancies. Substituted operands are left for
/// [`Graph::local_optimize`] to fold.
pub fn run(graph: &mut Graph, stats: &mut Stats) {
    log::debug!("shannon start");

    for candidate in find_candidates(graph) {
        if !still_valid(graph, &candidate) {
            log::trace!("shannon candidate no longer valid: {:?}", candidate);
            stats.shannon_dropped += 1;
            continue;
        }

        let Candidate {
            base,
            middle,
            top,
            other,
        } = candidate;
        let mode = graph.mode(top);
        let replacement = match middle {
            None => Tarval::null(mode),
            Some(m) if graph.op(m) == Op::Not => Tarval::all_one(mode),
            Some(m) => match eor_tarval(graph, m) {
                Some(tv) => tv,
                None => continue,
            },
        };
        let base_val = match graph.op(base) {
            Op::And => Tarval::all_one(mode),
            _ => Tarval::null(mode),
        };
        let value = graph.constant(base_val.eor(replacement.convert(mode)));

        let slot = match graph.operands(other).iter().position(|&o| o == top) {
            Some(slot) => slot,
            None => continue,
        };
        log::debug!(
            "shannon: {} operand {} ({}) => {}",
            other,
            slot,
            top,
            value
        );
        graph.set_operand(other, slot, value);
        stats.shannon_substitutions += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::Mode;

    #[test]
    fn not_middle_forces_zero() {
        let mut g = Graph::new();
        let start = g.start_block();
        let x = g.var(Mode::I32, start);
        let y = g.var(Mode::I32, start);
        let not_x = g.unop(Op::Not, start, x);
        let other = g.binop(Op::And, start, x, y);
        let base = g.binop(Op::And, start, not_x, other);
        g.add_result(base);

        assert_eq!(
            find_candidates(&g),
            vec![Candidate {
                base,
                middle: Some(not_x),
                top: x,
                other,
            }]
        );

        let mut stats = Stats::default();
        run(&mut g, &mut stats);
        assert_eq!(stats.shannon_substitutions, 1);
        let zero = g.constant(Tarval::null(Mode::I32));
        assert_eq!(g.operands(other), &[zero, y]);
        g.verify().unwrap();

        g.local_optimize();
        assert_eq!(g.results(), &[zero]);
    }

    #[test]
    fn eor_middle_forces_its_constant() {
        let mut g = Graph::new();
        let start = g.start_block();
        let x = g.var(Mode::U8, start);
        let y = g.var(Mode::U8, start);
        let mask = g.constant(Tarval::from_i128(Mode::U8, 0x0f));
        let middle = g.binop(Op::Eor, start, x, mask);
        let other = g.binop(Op::Eor, start, y, x);
        let base = g.binop(Op::Or, start, middle, other);
        g.add_result(base);

        run(&mut g, &mut Stats::default());

        // Under `or`, `x ^ 0x0f` is zero wherever it matters: x = 0x0f.
        let forced = g.constant(Tarval::from_i128(Mode::U8, 0x0f));
        assert_eq!(g.operands(other), &[y, forced]);
        g.verify().unwrap();
    }

    #[test]
    fn plain_operand_reconverges() {
        let mut g = Graph::new();
        let start = g.start_block();
        let x = g.var(Mode::I32, start);
        let y = g.var(Mode::I32, start);
        let inner = g.binop(Op::Or, start, x, y);
        let base = g.binop(Op::Or, start, x, inner);
        g.add_result(base);

        run(&mut g, &mut Stats::default());

        // Under `or`, `x` is zero wherever the rest matters.
        let zero = g.constant(Tarval::null(Mode::I32));
        assert!(g.is_dead(inner) || g.operands(inner) == [zero, y]);
        g.local_optimize();
        let result = g.results()[0];
        assert_eq!(g.op(result), Op::Or);
        let mut operands = g.operands(result).to_vec();
        operands.sort_by_key(|v| v.index());
        assert_eq!(operands, vec![x, y]);
        g.verify().unwrap();
    }

    #[test]
    fn shared_middle_is_its_own_top() {
        let mut g = Graph::new();
        let start = g.start_block();
        let x = g.var(Mode::I32, start);
        let y = g.var(Mode::I32, start);
        let not_x = g.unop(Op::Not, start, x);
        let other = g.binop(Op::Or, start, not_x, y);
        let base = g.binop(Op::And, start, not_x, other);
        g.add_result(base);

        // `~x` has two users, so the walk stops at `~x` itself rather than
        // looking for `x` below it.
        assert_eq!(
            find_candidates(&g),
            vec![Candidate {
                base,
                middle: None,
                top: not_x,
                other,
            }]
        );

        let mut stats = Stats::default();
        run(&mut g, &mut stats);
        assert_eq!(stats.shannon_substitutions, 1);
        let ones = g.constant(Tarval::all_one(Mode::I32));
        assert_eq!(g.operands(other), &[ones, y]);

        g.local_optimize();
        assert_eq!(g.results(), &[not_x]);
        g.verify().unwrap();
    }

    #[test]
    fn direct_operand_is_not_a_match() {
        let mut g = Graph::new();
        let start = g.start_block();
        let x = g.var(Mode::I32, start);
        let y = g.var(Mode::I32, start);
        let base = g.binop(Op::And, start, x, y);
        g.add_result(base);
        assert!(find_candidates(&g).is_empty());
    }

    #[test]
    fn shared_nodes_are_not_expanded_early() {
        let mut g = Graph::new();
        let start = g.start_block();
        let x = g.var(Mode::I32, start);
        let y = g.var(Mode::I32, start);
        let z = g.var(Mode::I32, start);
        let not_x = g.unop(Op::Not, start, x);
        // `shared` is also read from outside the `and` tree.
        let shared = g.binop(Op::Eor, start, x, y);
        let other = g.binop(Op::Or, start, shared, z);
        let base = g.binop(Op::And, start, not_x, other);
        g.add_result(base);
        g.add_result(shared);

        assert!(find_candidates(&g).is_empty());
    }
}
