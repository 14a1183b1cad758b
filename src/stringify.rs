//! Emitting the graph text format.
//!
//! Printing is canonical: loops and blocks come in creation order, live
//! values in a depth-first topological order from the results with fresh
//! names, and constants are written inline with their mode. Two graphs with
//! the same structure print the same text, which is what the fixture tests
//! compare.

use crate::ir::{BlockId, Graph, LoopId, Op, ValueId};
use std::{
    collections::HashMap,
    fmt::{self, Display},
};

/// A value as it appears in operand position.
struct Operand<'a> {
    graph: &'a Graph,
    names: &'a HashMap<ValueId, usize>,
    value: ValueId,
}

impl Display for Operand<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.graph.tarval(self.value) {
            Some(tv) => write!(f, "{}:{}", tv, tv.mode()),
            None => match self.names.get(&self.value) {
                Some(n) => write!(f, "%{}", n),
                // Not reachable from the results; should not happen for
                // live operands.
                None => write!(f, "%{}", self.value),
            },
        }
    }
}

struct LoopName(LoopId);

impl Display for LoopName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "%l{}", self.0.index())
    }
}

struct BlockName(BlockId, BlockId);

impl Display for BlockName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let BlockName(block, start) = *self;
        if block == start {
            write!(f, "%start")
        } else {
            write!(f, "%b{}", block.index())
        }
    }
}

impl Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let start = self.start_block();

        for l in self.loops() {
            write!(f, "{} = loop", LoopName(l))?;
            if let Some(parent) = self.loop_parent(l) {
                write!(f, " in {}", LoopName(parent))?;
            }
            writeln!(f)?;
        }

        for b in self.blocks() {
            let idom = match self.idom(b) {
                Some(idom) => idom,
                None => continue,
            };
            write!(f, "{} = block {}", BlockName(b, start), BlockName(idom, start))?;
            if let Some(l) = self.block_loop(b) {
                write!(f, " in {}", LoopName(l))?;
            }
            writeln!(f)?;
        }

        let mut names = HashMap::new();
        for v in self.live_nodes() {
            let op = self.op(v);
            if let Op::Const(_) = op {
                continue;
            }
            let name = names.len();
            names.insert(v, name);

            write!(f, "%{}:{} = {}", name, self.mode(v), op.name())?;
            match op {
                Op::Address(sym) | Op::Offset(sym) | Op::Align(sym) | Op::Size(sym) => {
                    write!(f, " @{}", self.symbol_name(sym))?;
                }
                _ => {
                    for (i, &o) in self.operands(v).iter().enumerate() {
                        let sep = if i == 0 { " " } else { ", " };
                        let operand = Operand {
                            graph: self,
                            names: &names,
                            value: o,
                        };
                        write!(f, "{}{}", sep, operand)?;
                    }
                }
            }
            if self.block(v) != start {
                write!(f, " in {}", BlockName(self.block(v), start))?;
            }
            writeln!(f)?;
        }

        for &r in self.results() {
            let operand = Operand {
                graph: self,
                names: &names,
                value: r,
            };
            writeln!(f, "return {}", operand)?;
        }
        Ok(())
    }
}
