//! The SSA value graph: nodes, blocks, loops and use-edges.

pub use id_arena::{Arena, Id};

use crate::fold::{self, Folded};
use crate::tarval::Tarval;
use indexmap::IndexSet;
use std::{
    collections::{HashMap, HashSet},
    fmt::{self, Display},
};

/// An identifier for a value node in a [`Graph`][crate::ir::Graph].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ValueId(pub(crate) Id<Node>);

impl ValueId {
    /// The position of this value in its graph's node arena.
    #[inline]
    pub fn index(&self) -> usize {
        self.0.index()
    }
}

impl From<ValueId> for Id<Node> {
    #[inline]
    fn from(id: ValueId) -> Self {
        id.0
    }
}

impl Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "v{}", self.index())
    }
}

/// An identifier for a basic block.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BlockId(pub(crate) Id<Block>);

impl BlockId {
    /// The position of this block in its graph's block arena.
    #[inline]
    pub fn index(&self) -> usize {
        self.0.index()
    }
}

/// An identifier for a loop in the loop nesting tree.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct LoopId(pub(crate) Id<Loop>);

impl LoopId {
    /// The position of this loop in its graph's loop arena.
    #[inline]
    pub fn index(&self) -> usize {
        self.0.index()
    }
}

/// An interned symbol name, referenced by address-like constants.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Symbol(pub(crate) u32);

/// The mode (type) of a value.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Mode {
    /// A two's complement integer.
    Int {
        /// Width in bits, at most 128.
        bits: u16,
        /// Whether conversions from this mode sign-extend.
        signed: bool,
    },

    /// An IEEE floating point number.
    Float {
        /// Either 32 or 64.
        bits: u16,
    },

    /// A pointer-like reference.
    Reference {
        /// Width in bits.
        bits: u16,
    },
}

#[allow(missing_docs)]
impl Mode {
    pub const I8: Mode = Mode::Int { bits: 8, signed: true };
    pub const I16: Mode = Mode::Int { bits: 16, signed: true };
    pub const I32: Mode = Mode::Int { bits: 32, signed: true };
    pub const I64: Mode = Mode::Int { bits: 64, signed: true };
    pub const U8: Mode = Mode::Int { bits: 8, signed: false };
    pub const U16: Mode = Mode::Int { bits: 16, signed: false };
    pub const U32: Mode = Mode::Int { bits: 32, signed: false };
    pub const U64: Mode = Mode::Int { bits: 64, signed: false };
    pub const F32: Mode = Mode::Float { bits: 32 };
    pub const F64: Mode = Mode::Float { bits: 64 };
    pub const P32: Mode = Mode::Reference { bits: 32 };
    pub const P64: Mode = Mode::Reference { bits: 64 };
}

impl Mode {
    /// Is this an integer mode?
    pub fn is_int(&self) -> bool {
        matches!(self, Mode::Int { .. })
    }

    /// Is this a float mode?
    pub fn is_float(&self) -> bool {
        matches!(self, Mode::Float { .. })
    }

    /// Is this a reference mode?
    pub fn is_reference(&self) -> bool {
        matches!(self, Mode::Reference { .. })
    }

    /// Is this a signed integer mode?
    pub fn is_signed(&self) -> bool {
        matches!(self, Mode::Int { signed: true, .. })
    }

    /// The width of this mode in bits.
    pub fn bits(&self) -> u16 {
        match *self {
            Mode::Int { bits, .. } | Mode::Float { bits } | Mode::Reference { bits } => bits,
        }
    }

    /// Parse a mode name like `i32`, `u8`, `f64` or `p64`.
    pub fn from_name(name: &str) -> Option<Mode> {
        let (kind, width) = name.split_at(name.char_indices().nth(1)?.0);
        let bits: u16 = width.parse().ok()?;
        if bits == 0 || bits > 128 {
            return None;
        }
        match kind {
            "i" => Some(Mode::Int { bits, signed: true }),
            "u" => Some(Mode::Int { bits, signed: false }),
            "f" if bits == 32 || bits == 64 => Some(Mode::Float { bits }),
            "p" => Some(Mode::Reference { bits }),
            _ => None,
        }
    }
}

impl Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Mode::Int { bits, signed: true } => write!(f, "i{}", bits),
            Mode::Int { bits, signed: false } => write!(f, "u{}", bits),
            Mode::Float { bits } => write!(f, "f{}", bits),
            Mode::Reference { bits } => write!(f, "p{}", bits),
        }
    }
}

/// An operation kind.
///
/// The number of operands a node has is fixed by its operation; see
/// [`Op::arity`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    /// A literal constant.
    Const(Tarval),

    /// The address of a symbol.
    Address(Symbol),

    /// The offset of a symbol within its enclosing type.
    Offset(Symbol),

    /// The alignment of a symbol's type.
    Align(Symbol),

    /// The size of a symbol's type.
    Size(Symbol),

    /// An opaque input value, e.g. a function parameter or a load.
    Var(u32),

    /// An unreachable or otherwise degenerate value.
    Bad,

    /// Wrapping addition. One operand may be a reference when the result is.
    Add,

    /// Wrapping subtraction. The left operand may be a reference when the
    /// result is.
    Sub,

    /// Wrapping multiplication.
    Mul,

    /// Bit-wise and.
    And,

    /// Bit-wise or.
    Or,

    /// Bit-wise exclusive or.
    Eor,

    /// Bit-wise complement.
    Not,

    /// Two's complement negation.
    Minus,

    /// Shift left.
    Shl,

    /// Logical shift right.
    Shr,

    /// Arithmetic shift right.
    Shrs,

    /// Mode conversion.
    Conv,
}

impl Op {
    /// The number of operands of a node with this operation.
    pub fn arity(&self) -> usize {
        match self {
            Op::Const(_)
            | Op::Address(_)
            | Op::Offset(_)
            | Op::Align(_)
            | Op::Size(_)
            | Op::Var(_)
            | Op::Bad => 0,
            Op::Not | Op::Minus | Op::Conv => 1,
            Op::Add | Op::Sub | Op::Mul | Op::And | Op::Or | Op::Eor | Op::Shl | Op::Shr
            | Op::Shrs => 2,
        }
    }

    /// The name of this operation in the text format.
    pub fn name(&self) -> &'static str {
        match self {
            Op::Const(_) => "const",
            Op::Address(_) => "address",
            Op::Offset(_) => "offset",
            Op::Align(_) => "align",
            Op::Size(_) => "size",
            Op::Var(_) => "var",
            Op::Bad => "bad",
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::And => "and",
            Op::Or => "or",
            Op::Eor => "xor",
            Op::Not => "not",
            Op::Minus => "minus",
            Op::Shl => "shl",
            Op::Shr => "shr",
            Op::Shrs => "shrs",
            Op::Conv => "conv",
        }
    }

    /// Look up an operation without a payload by its text format name.
    pub fn from_name(name: &str) -> Option<Op> {
        Some(match name {
            "bad" => Op::Bad,
            "add" => Op::Add,
            "sub" => Op::Sub,
            "mul" => Op::Mul,
            "and" => Op::And,
            "or" => Op::Or,
            "xor" => Op::Eor,
            "not" => Op::Not,
            "minus" => Op::Minus,
            "shl" => Op::Shl,
            "shr" => Op::Shr,
            "shrs" => Op::Shrs,
            "conv" => Op::Conv,
            _ => return None,
        })
    }

    /// Is `a OP b == b OP a`?
    pub fn is_commutative(&self) -> bool {
        matches!(self, Op::Add | Op::Mul | Op::And | Op::Or | Op::Eor)
    }

    /// Is this one of the bit-wise operations `and`, `or`, `xor`, `not`?
    pub fn is_bitop(&self) -> bool {
        matches!(self, Op::And | Op::Or | Op::Eor | Op::Not)
    }

    /// Is this a link-time constant: a literal, symbol address, offset,
    /// alignment or size?
    pub fn is_constlike(&self) -> bool {
        matches!(
            self,
            Op::Const(_) | Op::Address(_) | Op::Offset(_) | Op::Align(_) | Op::Size(_)
        )
    }
}

impl Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A value node.
#[derive(Clone, Debug)]
pub struct Node {
    op: Op,
    mode: Mode,
    block: BlockId,
    operands: Vec<ValueId>,
    dead: bool,
}

/// A use-edge: one place that reads a value.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Use {
    /// Operand `slot` of node `user`.
    Operand {
        /// The consuming node.
        user: ValueId,
        /// Which of the consumer's operands reads the value.
        slot: usize,
    },

    /// The graph's result at this index.
    Result(usize),
}

/// A basic block, positioned in the dominator tree.
#[derive(Clone, Debug)]
pub struct Block {
    idom: Option<BlockId>,
    depth: u32,
    in_loop: Option<LoopId>,
}

/// A loop in the loop nesting tree.
#[derive(Clone, Debug)]
pub struct Loop {
    parent: Option<LoopId>,
}

/// Whether node placement in blocks is authoritative.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PinState {
    /// Every node's block is final; dominance queries are meaningful.
    Pinned,

    /// Nodes may still be moved between blocks.
    Floating,
}

/// The graph invariant that [`Graph::verify`] found broken.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    /// A node has the wrong number of operands.
    #[error("{node} (`{op}`) has {found} operands, expected {expected}")]
    Arity {
        /// The offending node.
        node: ValueId,
        /// Its operation.
        op: Op,
        /// The number of operands it has.
        found: usize,
        /// The number its operation requires.
        expected: usize,
    },

    /// A live node or result refers to a retired node.
    #[error("{node} refers to retired {operand}")]
    DeadOperand {
        /// The referring node, or the retired result itself.
        node: ValueId,
        /// The retired node.
        operand: ValueId,
    },

    /// An operand has a mode its consumer cannot accept.
    #[error("{node} (`{op}`, {mode}) cannot take a {found} operand in slot {slot}")]
    OperandMode {
        /// The consumer.
        node: ValueId,
        /// The consumer's operation.
        op: Op,
        /// The consumer's mode.
        mode: Mode,
        /// The operand slot.
        slot: usize,
        /// The operand's mode.
        found: Mode,
    },

    /// An operand is defined in a block that does not dominate its consumer.
    #[error("{operand} is not available in the block of its consumer {node}")]
    Dominance {
        /// The consumer.
        node: ValueId,
        /// The operand.
        operand: ValueId,
    },

    /// The recorded use-edges of a node disagree with the operands that
    /// actually read it.
    #[error("use-edges of {node} are inconsistent")]
    UseEdges {
        /// The node whose use-edges are wrong.
        node: ValueId,
    },

    /// The value graph is not acyclic.
    #[error("value graph contains a cycle through {node}")]
    Cycle {
        /// A node on the cycle.
        node: ValueId,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct NodeKey {
    op: Op,
    mode: Mode,
    block: Option<BlockId>,
    operands: Vec<ValueId>,
}

/// The value graph of one function.
///
/// Nodes live in an arena and are addressed by [`ValueId`] handles. Nodes are
/// only created through [`Graph::node`] (or one of its conveniences), which
/// folds constants and reuses structurally identical nodes. Retired nodes
/// stay in the arena, marked dead, so stale handles can be detected with
/// [`Graph::is_dead`].
#[derive(Clone, Debug)]
pub struct Graph {
    nodes: Arena<Node>,
    uses: Vec<Vec<Use>>,
    blocks: Arena<Block>,
    loops: Arena<Loop>,
    start: BlockId,
    results: Vec<ValueId>,
    identities: HashMap<NodeKey, ValueId>,
    symbols: IndexSet<String>,
    next_var: u32,
    pin_state: PinState,
}

impl Default for Graph {
    fn default() -> Self {
        Graph::new()
    }
}

impl Graph {
    /// Create an empty graph containing only the start block.
    pub fn new() -> Self {
        let mut blocks = Arena::new();
        let start = BlockId(blocks.alloc(Block {
            idom: None,
            depth: 0,
            in_loop: None,
        }));
        Graph {
            nodes: Arena::new(),
            uses: vec![],
            blocks,
            loops: Arena::new(),
            start,
            results: vec![],
            identities: HashMap::new(),
            symbols: IndexSet::new(),
            next_var: 0,
            pin_state: PinState::Pinned,
        }
    }

    /// The function's entry block; the root of the dominator tree.
    pub fn start_block(&self) -> BlockId {
        self.start
    }

    /// Create a loop nested inside `parent`, or a top-level loop.
    pub fn new_loop(&mut self, parent: Option<LoopId>) -> LoopId {
        LoopId(self.loops.alloc(Loop { parent }))
    }

    /// Create a block immediately dominated by `idom`, optionally inside
    /// `in_loop`.
    pub fn new_block(&mut self, idom: BlockId, in_loop: Option<LoopId>) -> BlockId {
        let depth = self.blocks[idom.0].depth + 1;
        BlockId(self.blocks.alloc(Block {
            idom: Some(idom),
            depth,
            in_loop,
        }))
    }

    /// All blocks, in creation order.
    pub fn blocks(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.iter().map(|(id, _)| BlockId(id))
    }

    /// All loops, in creation order.
    pub fn loops(&self) -> impl Iterator<Item = LoopId> + '_ {
        self.loops.iter().map(|(id, _)| LoopId(id))
    }

    /// The immediate dominator of `block`; `None` for the start block.
    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        self.blocks[block.0].idom
    }

    /// The innermost loop containing `block`.
    pub fn block_loop(&self, block: BlockId) -> Option<LoopId> {
        self.blocks[block.0].in_loop
    }

    /// The loop enclosing `l`.
    pub fn loop_parent(&self, l: LoopId) -> Option<LoopId> {
        self.loops[l.0].parent
    }

    /// Does `a` dominate `b`? Every block dominates itself.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let depth = self.blocks[a.0].depth;
        let mut cur = b;
        while self.blocks[cur.0].depth > depth {
            match self.blocks[cur.0].idom {
                Some(idom) => cur = idom,
                None => return false,
            }
        }
        cur == a
    }

    /// Is `v` computed outside of the innermost loop containing `block`, so
    /// that it has the same value on every iteration reaching `block`?
    ///
    /// Always false when `block` is not inside any loop.
    pub fn is_loop_invariant(&self, v: ValueId, block: BlockId) -> bool {
        let l = match self.blocks[block.0].in_loop {
            Some(l) => l,
            None => return false,
        };
        let mut cur = self.blocks[self.block(v).0].in_loop;
        while let Some(c) = cur {
            if c == l {
                return false;
            }
            cur = self.loops[c.0].parent;
        }
        true
    }

    /// Intern a symbol name.
    pub fn symbol(&mut self, name: &str) -> Symbol {
        let (index, _) = self.symbols.insert_full(name.to_string());
        Symbol(index as u32)
    }

    /// The name of an interned symbol.
    ///
    /// # Panics
    ///
    /// Panics if `sym` was interned in another graph.
    pub fn symbol_name(&self, sym: Symbol) -> &str {
        &self.symbols[sym.0 as usize]
    }

    /// Whether node placement is final.
    pub fn pin_state(&self) -> PinState {
        self.pin_state
    }

    /// Declare whether node placement is final.
    pub fn set_pin_state(&mut self, state: PinState) {
        self.pin_state = state;
    }

    /// The operation of `v`.
    pub fn op(&self, v: ValueId) -> Op {
        self.nodes[v.0].op
    }

    /// The mode of `v`.
    pub fn mode(&self, v: ValueId) -> Mode {
        self.nodes[v.0].mode
    }

    /// The block `v` is computed in.
    pub fn block(&self, v: ValueId) -> BlockId {
        self.nodes[v.0].block
    }

    /// The operands of `v`.
    pub fn operands(&self, v: ValueId) -> &[ValueId] {
        &self.nodes[v.0].operands
    }

    /// Operand `slot` of `v`.
    pub fn operand(&self, v: ValueId, slot: usize) -> ValueId {
        self.nodes[v.0].operands[slot]
    }

    /// The constant value of `v`, if it is a literal.
    pub fn tarval(&self, v: ValueId) -> Option<Tarval> {
        match self.nodes[v.0].op {
            Op::Const(tv) => Some(tv),
            _ => None,
        }
    }

    /// Has `v` been retired by [`Graph::exchange`] or dead code removal?
    pub fn is_dead(&self, v: ValueId) -> bool {
        self.nodes[v.0].dead
    }

    /// Every place that reads `v`.
    pub fn uses(&self, v: ValueId) -> &[Use] {
        &self.uses[v.index()]
    }

    /// The number of places that read `v`.
    pub fn use_count(&self, v: ValueId) -> usize {
        self.uses[v.index()].len()
    }

    /// The number of nodes ever allocated, dead ones included.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// The values the function returns.
    pub fn results(&self) -> &[ValueId] {
        &self.results
    }

    /// Append a returned value.
    pub fn add_result(&mut self, v: ValueId) {
        assert!(!self.is_dead(v), "cannot return retired {}", v);
        let index = self.results.len();
        self.results.push(v);
        self.uses[v.index()].push(Use::Result(index));
    }

    /// The mode of a binary operation on `a` and `b`: a reference mode wins,
    /// otherwise both modes must agree.
    ///
    /// # Panics
    ///
    /// Panics if neither operand is a reference and their modes differ.
    pub fn mode_from_operands(&self, a: ValueId, b: ValueId) -> Mode {
        let ma = self.mode(a);
        if ma.is_reference() {
            return ma;
        }
        let mb = self.mode(b);
        if mb.is_reference() {
            return mb;
        }
        assert_eq!(ma, mb, "operands {} and {} have different modes", a, b);
        ma
    }

    /// Construct-and-fold: create the node `op(operands)` of `mode` in
    /// `block`, unless local folding simplifies it or a structurally
    /// identical node already exists, in which case that value is returned.
    ///
    /// # Panics
    ///
    /// Panics if the number of operands does not match `op`'s arity, or an
    /// operand is retired.
    pub fn node(&mut self, op: Op, mode: Mode, block: BlockId, operands: &[ValueId]) -> ValueId {
        assert_eq!(
            operands.len(),
            op.arity(),
            "`{}` takes {} operands",
            op,
            op.arity()
        );
        for &o in operands {
            assert!(!self.is_dead(o), "`{}` operand {} is retired", op, o);
        }
        match fold::fold(self, op, mode, operands) {
            Folded::Value(v) => v,
            Folded::Constant(tv) => self.constant(tv),
            Folded::Unchanged => self.intern(op, mode, block, operands),
        }
    }

    /// The literal constant `tv`.
    pub fn constant(&mut self, tv: Tarval) -> ValueId {
        let start = self.start;
        self.intern(Op::Const(tv), tv.mode(), start, &[])
    }

    /// A fresh opaque input of `mode`, computed in `block`.
    pub fn var(&mut self, mode: Mode, block: BlockId) -> ValueId {
        let n = self.next_var;
        self.next_var += 1;
        self.intern(Op::Var(n), mode, block, &[])
    }

    /// The degenerate value of `mode`.
    pub fn bad(&mut self, mode: Mode) -> ValueId {
        let start = self.start;
        self.intern(Op::Bad, mode, start, &[])
    }

    /// A binary operation whose mode is derived from its operands.
    pub fn binop(&mut self, op: Op, block: BlockId, a: ValueId, b: ValueId) -> ValueId {
        let mode = match op {
            Op::Shl | Op::Shr | Op::Shrs => self.mode(a),
            _ => self.mode_from_operands(a, b),
        };
        self.node(op, mode, block, &[a, b])
    }

    /// A unary operation of the same mode as its operand.
    pub fn unop(&mut self, op: Op, block: BlockId, a: ValueId) -> ValueId {
        let mode = self.mode(a);
        self.node(op, mode, block, &[a])
    }

    /// Convert `v` to `mode`.
    pub fn conv(&mut self, block: BlockId, v: ValueId, mode: Mode) -> ValueId {
        self.node(Op::Conv, mode, block, &[v])
    }

    fn key(&self, op: Op, mode: Mode, block: BlockId, operands: Vec<ValueId>) -> NodeKey {
        let block = if op.is_constlike() || op == Op::Bad {
            None
        } else {
            Some(block)
        };
        NodeKey {
            op,
            mode,
            block,
            operands,
        }
    }

    fn node_key(&self, v: ValueId) -> NodeKey {
        let node = &self.nodes[v.0];
        self.key(node.op, node.mode, node.block, node.operands.clone())
    }

    fn lookup(&self, key: &NodeKey) -> Option<ValueId> {
        if let Some(&v) = self.identities.get(key) {
            return Some(v);
        }
        if key.op.is_commutative() && key.operands.len() == 2 && key.operands[0] != key.operands[1]
        {
            let mut swapped = key.clone();
            swapped.operands.swap(0, 1);
            return self.identities.get(&swapped).copied();
        }
        None
    }

    fn intern(&mut self, op: Op, mode: Mode, block: BlockId, operands: &[ValueId]) -> ValueId {
        let key = self.key(op, mode, block, operands.to_vec());
        if let Some(v) = self.lookup(&key) {
            return v;
        }
        let block = key.block.unwrap_or(self.start);
        let id = ValueId(self.nodes.alloc(Node {
            op,
            mode,
            block,
            operands: operands.to_vec(),
            dead: false,
        }));
        if self.uses.len() <= id.index() {
            self.uses.resize(id.index() + 1, vec![]);
        }
        for (slot, &o) in operands.iter().enumerate() {
            self.uses[o.index()].push(Use::Operand { user: id, slot });
        }
        self.identities.insert(key, id);
        id
    }

    fn unregister(&mut self, v: ValueId) {
        let key = self.node_key(v);
        if self.identities.get(&key) == Some(&v) {
            self.identities.remove(&key);
        }
    }

    fn register(&mut self, v: ValueId) {
        let key = self.node_key(v);
        if self.lookup(&key).is_none() {
            self.identities.insert(key, v);
        }
    }

    fn remove_use(&mut self, v: ValueId, u: Use) {
        let uses = &mut self.uses[v.index()];
        if let Some(pos) = uses.iter().position(|x| *x == u) {
            uses.swap_remove(pos);
        }
    }

    /// Mark `v` dead and disconnect it from its operands, returning them.
    fn retire(&mut self, v: ValueId) -> Vec<ValueId> {
        self.unregister(v);
        self.nodes[v.0].dead = true;
        let operands = self.nodes[v.0].operands.clone();
        for (slot, &o) in operands.iter().enumerate() {
            self.remove_use(o, Use::Operand { user: v, slot });
        }
        operands
    }

    /// Retire `v` and, transitively, its operands if nothing reads them
    /// anymore.
    fn collect(&mut self, v: ValueId) {
        let mut stack = vec![v];
        while let Some(v) = stack.pop() {
            if self.is_dead(v) || !self.uses[v.index()].is_empty() {
                continue;
            }
            stack.extend(self.retire(v));
        }
    }

    /// Replace `old` by `new` everywhere: every use-edge of `old` is
    /// repointed to `new`, then `old` is retired. Operands of `old` that are
    /// no longer read by anything are retired too.
    ///
    /// # Panics
    ///
    /// Panics if `old == new` or either is retired.
    pub fn exchange(&mut self, old: ValueId, new: ValueId) {
        assert_ne!(old, new, "cannot exchange {} with itself", old);
        assert!(!self.is_dead(old), "cannot exchange retired {}", old);
        assert!(!self.is_dead(new), "cannot exchange {} with retired {}", old, new);

        let uses = std::mem::take(&mut self.uses[old.index()]);
        for u in uses {
            match u {
                Use::Operand { user, slot } => {
                    self.unregister(user);
                    self.nodes[user.0].operands[slot] = new;
                    self.register(user);
                }
                Use::Result(index) => self.results[index] = new,
            }
            self.uses[new.index()].push(u);
        }

        for o in self.retire(old) {
            self.collect(o);
        }
    }

    /// Replace only operand `slot` of `v` by `new`.
    ///
    /// The previous operand is retired if nothing else reads it.
    pub fn set_operand(&mut self, v: ValueId, slot: usize, new: ValueId) {
        assert!(!self.is_dead(v) && !self.is_dead(new));
        let old = self.nodes[v.0].operands[slot];
        if old == new {
            return;
        }
        self.unregister(v);
        self.nodes[v.0].operands[slot] = new;
        self.remove_use(old, Use::Operand { user: v, slot });
        self.uses[new.index()].push(Use::Operand { user: v, slot });
        self.register(v);
        self.collect(old);
    }

    /// All nodes reachable from the results, operands before their users.
    pub fn live_nodes(&self) -> Vec<ValueId> {
        let mut seq = vec![];
        let mut seen = HashSet::new();

        let mut stack: Vec<_> = self.results.iter().rev().map(|&r| Entry::Trace(r)).collect();
        while let Some(entry) = stack.pop() {
            let v = match entry {
                Entry::Finished(v) => {
                    seq.push(v);
                    continue;
                }
                Entry::Trace(v) if seen.contains(&v) => continue,
                Entry::Trace(v) => {
                    seen.insert(v);
                    v
                }
            };

            stack.push(Entry::Finished(v));
            for &o in self.operands(v).iter().rev() {
                stack.push(Entry::Trace(o));
            }
        }

        return seq;

        enum Entry {
            Trace(ValueId),
            Finished(ValueId),
        }
    }

    /// Retire every node that is not reachable from the results, so that
    /// only live consumers are recorded in use-edges.
    pub fn remove_unreachable(&mut self) {
        let live: HashSet<_> = self.live_nodes().into_iter().collect();
        let unreachable: Vec<_> = self
            .nodes
            .iter()
            .map(|(id, _)| ValueId(id))
            .filter(|v| !self.is_dead(*v) && !live.contains(v))
            .collect();
        for v in unreachable {
            self.retire(v);
        }
    }

    /// Re-run local folding and structural deduplication over every live
    /// node until nothing changes. Returns whether anything changed.
    pub fn local_optimize(&mut self) -> bool {
        let mut changed = false;
        loop {
            let mut progress = false;
            for v in self.live_nodes() {
                if self.is_dead(v) {
                    continue;
                }
                if let Some(new) = self.refold(v) {
                    log::trace!("local_optimize: {} => {}", v, new);
                    self.exchange(v, new);
                    progress = true;
                }
            }
            if !progress {
                return changed;
            }
            changed = true;
        }
    }

    fn refold(&mut self, v: ValueId) -> Option<ValueId> {
        let node = &self.nodes[v.0];
        if node.operands.is_empty() {
            return None;
        }
        let (op, mode, operands) = (node.op, node.mode, node.operands.clone());
        match fold::fold(self, op, mode, &operands) {
            Folded::Value(x) => Some(x),
            Folded::Constant(tv) => Some(self.constant(tv)),
            Folded::Unchanged => match self.lookup(&self.node_key(v)) {
                Some(other) if other != v && !self.is_dead(other) => Some(other),
                Some(_) => None,
                None => {
                    self.register(v);
                    None
                }
            },
        }
    }

    /// Check the graph invariants the optimization passes rely on.
    pub fn verify(&self) -> Result<(), VerifyError> {
        for &r in &self.results {
            if self.is_dead(r) {
                return Err(VerifyError::DeadOperand {
                    node: r,
                    operand: r,
                });
            }
        }

        self.verify_acyclic()?;

        for v in self.live_nodes() {
            let node = &self.nodes[v.0];
            if node.operands.len() != node.op.arity() {
                return Err(VerifyError::Arity {
                    node: v,
                    op: node.op,
                    found: node.operands.len(),
                    expected: node.op.arity(),
                });
            }
            for (slot, &o) in node.operands.iter().enumerate() {
                if self.is_dead(o) {
                    return Err(VerifyError::DeadOperand { node: v, operand: o });
                }
                if !self.operand_mode_ok(v, slot) {
                    return Err(VerifyError::OperandMode {
                        node: v,
                        op: node.op,
                        mode: node.mode,
                        slot,
                        found: self.mode(o),
                    });
                }
                if !self.dominates(self.block(o), node.block) {
                    return Err(VerifyError::Dominance { node: v, operand: o });
                }
                if !self.uses(o).contains(&Use::Operand { user: v, slot }) {
                    return Err(VerifyError::UseEdges { node: o });
                }
            }
            for u in self.uses(v) {
                let consistent = match *u {
                    Use::Operand { user, slot } => {
                        !self.is_dead(user) && self.operands(user).get(slot) == Some(&v)
                    }
                    Use::Result(index) => self.results.get(index) == Some(&v),
                };
                if !consistent {
                    return Err(VerifyError::UseEdges { node: v });
                }
            }
        }
        Ok(())
    }

    fn verify_acyclic(&self) -> Result<(), VerifyError> {
        #[derive(Copy, Clone, PartialEq)]
        enum Color {
            Active,
            Done,
        }

        let mut color = HashMap::new();
        let mut stack = vec![];
        for &root in &self.results {
            stack.push((root, false));
        }
        while let Some((v, finished)) = stack.pop() {
            if finished {
                color.insert(v, Color::Done);
                continue;
            }
            match color.get(&v) {
                Some(Color::Done) => continue,
                Some(Color::Active) => return Err(VerifyError::Cycle { node: v }),
                None => {}
            }
            color.insert(v, Color::Active);
            stack.push((v, true));
            for &o in self.operands(v) {
                match color.get(&o) {
                    Some(Color::Active) => return Err(VerifyError::Cycle { node: o }),
                    Some(Color::Done) => {}
                    None => stack.push((o, false)),
                }
            }
        }
        Ok(())
    }

    fn operand_mode_ok(&self, v: ValueId, slot: usize) -> bool {
        let node = &self.nodes[v.0];
        let mode = node.mode;
        let found = self.mode(node.operands[slot]);
        match node.op {
            // Reference arithmetic: exactly one reference operand, on the left
            // for subtraction.
            Op::Add | Op::Sub if mode.is_reference() => {
                let other = self.mode(node.operands[1 - slot]);
                let (left, right) = if slot == 0 { (found, other) } else { (other, found) };
                (left == mode && right.is_int())
                    || (node.op == Op::Add && left.is_int() && right == mode)
            }
            Op::Add | Op::Sub | Op::Mul => found == mode,
            Op::And | Op::Or | Op::Eor | Op::Not => !mode.is_float() && found == mode,
            Op::Minus => found == mode,
            Op::Shl | Op::Shr | Op::Shrs => {
                !mode.is_float() && if slot == 0 { found == mode } else { found.is_int() }
            }
            Op::Conv => true,
            Op::Const(_)
            | Op::Address(_)
            | Op::Offset(_)
            | Op::Align(_)
            | Op::Size(_)
            | Op::Var(_)
            | Op::Bad => false,
        }
    }
}
