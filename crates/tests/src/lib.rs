//! Fixture, interpreter and randomized tests for `ssa-reassoc`.

use rand::{rngs::StdRng, Rng, SeedableRng};
use ssa_reassoc::{
    ir::{BlockId, Graph, LoopId, Mode, Op, ValueId},
    parse::parse_str,
    tarval::Tarval,
    Options,
};
use std::{collections::HashMap, path::Path};

/// Separates a fixture's input graph from the graph it should optimize to.
pub const EXPECT: &str = "; expect:";

/// Optimize the graph in the fixture at `path` and compare the result with
/// the fixture's expected graph, both printed canonically.
pub fn assert_optimizes(path: &Path) {
    let _ = env_logger::try_init();

    let source = std::fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("failed to read {}: {}", path.display(), e));
    let split = source
        .find(EXPECT)
        .unwrap_or_else(|| panic!("{} has no `{}` section", path.display(), EXPECT));
    let (input, expected) = source.split_at(split);

    let mut graph = parse_str(input, Some(path)).unwrap_or_else(|e| panic!("{}", e));
    let expected = parse_str(expected, Some(path)).unwrap_or_else(|e| panic!("{}", e));
    let before = graph.clone();

    let stats = ssa_reassoc::optimize_with(&mut graph, &Options::default());
    log::debug!("{}: {:?}", path.display(), stats);

    assert_eq!(
        expected.to_string(),
        graph.to_string(),
        "{} optimized to an unexpected graph",
        path.display()
    );

    if is_integral(&before) {
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..16 {
            assert_equivalent(&before, &graph, &mut || rng.gen::<i64>() as i128);
        }
    }
}

/// Does every live value have an integer or reference mode?
pub fn is_integral(graph: &Graph) -> bool {
    graph
        .live_nodes()
        .into_iter()
        .all(|v| !graph.mode(v).is_float())
}

/// A stand-in address for a symbolic constant.
fn symbol_value(name: &str, kind: i128) -> i128 {
    name.bytes()
        .fold(kind, |h, b| h.wrapping_mul(31).wrapping_add(i128::from(b)))
        .wrapping_mul(16)
}

/// Evaluate the results of `graph`, asking `input` for the value of each
/// `var` by its number.
///
/// # Panics
///
/// Panics on float computations, which the interpreter does not model.
pub fn interpret(graph: &Graph, input: &mut impl FnMut(u32, Mode) -> Tarval) -> Vec<Tarval> {
    let mut values: HashMap<ValueId, Tarval> = HashMap::new();

    for v in graph.live_nodes() {
        let mode = graph.mode(v);
        assert!(!mode.is_float(), "cannot interpret float value {}", v);

        let operand = |i: usize| values[&graph.operand(v, i)];
        let value = match graph.op(v) {
            Op::Const(tv) => tv,
            Op::Var(n) => input(n, mode),
            Op::Address(sym) => Tarval::from_i128(mode, symbol_value(graph.symbol_name(sym), 1)),
            Op::Offset(sym) => Tarval::from_i128(mode, symbol_value(graph.symbol_name(sym), 2)),
            Op::Align(sym) => Tarval::from_i128(mode, symbol_value(graph.symbol_name(sym), 3)),
            Op::Size(sym) => Tarval::from_i128(mode, symbol_value(graph.symbol_name(sym), 4)),
            Op::Bad => Tarval::null(mode),
            Op::Not => operand(0).convert(mode).not(),
            Op::Minus => operand(0).convert(mode).neg(),
            Op::Conv => operand(0).convert(mode),
            Op::Shl => operand(0).convert(mode).shl(operand(1)),
            Op::Shr => operand(0).convert(mode).shr(operand(1)),
            Op::Shrs => operand(0).convert(mode).shrs(operand(1)),
            op => {
                let (a, b) = (operand(0).convert(mode), operand(1).convert(mode));
                match op {
                    Op::Add => a.add(b),
                    Op::Sub => a.sub(b),
                    Op::Mul => a.mul(b),
                    Op::And => a.and(b),
                    Op::Or => a.or(b),
                    Op::Eor => a.eor(b),
                    _ => unreachable!("{:?} is not binary", op),
                }
            }
        };
        values.insert(v, value);
    }

    graph.results().iter().map(|r| values[r]).collect()
}

/// Evaluate `before` and `after` on the same random inputs and check that
/// they agree.
pub fn assert_equivalent(before: &Graph, after: &Graph, random: &mut impl FnMut() -> i128) {
    let mut inputs: HashMap<u32, i128> = HashMap::new();
    let mut input = |var: u32, mode: Mode| {
        let bits = *inputs.entry(var).or_insert_with(|| random());
        Tarval::from_i128(mode, bits)
    };

    let expected = interpret(before, &mut input);
    let actual = interpret(after, &mut input);
    assert_eq!(
        expected, actual,
        "optimization changed the results for inputs {:?}\n\nbefore:\n{}\nafter:\n{}",
        inputs, before, after
    );
}

const CONSTANTS: &[i128] = &[0, 1, -1, 2, 3, 5, 7, 8, 0x0f, 0xff];

const SYMBOLS: &[&str] = &["table", "len"];

const BINARY: &[Op] = &[
    Op::Add,
    Op::Sub,
    Op::Mul,
    Op::And,
    Op::Or,
    Op::Eor,
    Op::Shl,
    Op::Shr,
    Op::Shrs,
];

/// Modes that pointer offsets are written in, besides the graph's own.
const OFFSET_MODES: &[Mode] = &[Mode::I64, Mode::U32, Mode::I32, Mode::U8];

/// A literal or, sometimes, a symbolic constant of `mode`.
fn pick_constant(
    graph: &mut Graph,
    choose: &mut impl FnMut(usize) -> usize,
    mode: Mode,
) -> ValueId {
    if choose(4) == 0 {
        let sym = graph.symbol(SYMBOLS[choose(SYMBOLS.len())]);
        let op = [Op::Offset(sym), Op::Align(sym), Op::Size(sym)][choose(3)];
        let start = graph.start_block();
        graph.node(op, mode, start, &[])
    } else {
        let c = CONSTANTS[choose(CONSTANTS.len())];
        graph.constant(Tarval::from_i128(mode, c))
    }
}

/// Pick an operand available in `block`: an earlier value or, sometimes, a
/// constant.
fn pick_operand(
    graph: &mut Graph,
    choose: &mut impl FnMut(usize) -> usize,
    values: &[ValueId],
    mode: Mode,
    block: BlockId,
) -> ValueId {
    let available: Vec<_> = values
        .iter()
        .copied()
        .filter(|&v| graph.dominates(graph.block(v), block))
        .collect();
    if available.is_empty() || choose(4) == 0 {
        pick_constant(graph, choose, mode)
    } else {
        available[choose(available.len())]
    }
}

/// The loop of a block whose immediate dominator is in `outer`: the same
/// loop, one nested directly inside it, or the one around it.
fn pick_loop(
    graph: &Graph,
    choose: &mut impl FnMut(usize) -> usize,
    loops: &[LoopId],
    outer: Option<LoopId>,
) -> Option<LoopId> {
    let mut options = vec![outer];
    options.extend(
        loops
            .iter()
            .filter(|&&l| graph.loop_parent(l) == outer)
            .map(|&l| Some(l)),
    );
    if let Some(l) = outer {
        options.push(graph.loop_parent(l));
    }
    options[choose(options.len())]
}

/// Build a pointer in `block`: an earlier pointer, a symbol's address or a
/// fresh `p64` variable, plus or minus an integer offset.
fn build_pointer(
    graph: &mut Graph,
    choose: &mut impl FnMut(usize) -> usize,
    values: &[ValueId],
    pointers: &[ValueId],
    mode: Mode,
    block: BlockId,
) -> ValueId {
    let available: Vec<_> = pointers
        .iter()
        .copied()
        .filter(|&p| graph.dominates(graph.block(p), block))
        .collect();
    let base = match choose(3) {
        0 if !available.is_empty() => available[choose(available.len())],
        1 => {
            let sym = graph.symbol(SYMBOLS[choose(SYMBOLS.len())]);
            let start = graph.start_block();
            graph.node(Op::Address(sym), Mode::P64, start, &[])
        }
        _ => graph.var(Mode::P64, block),
    };

    let offset = if choose(2) == 0 {
        pick_operand(graph, choose, values, mode, block)
    } else {
        let offset_mode = OFFSET_MODES[choose(OFFSET_MODES.len())];
        pick_constant(graph, choose, offset_mode)
    };

    match choose(3) {
        0 => graph.binop(Op::Add, block, base, offset),
        1 => graph.binop(Op::Add, block, offset, base),
        _ => graph.binop(Op::Sub, block, base, offset),
    }
}

/// Build an integer graph with nested loops, symbolic constants and pointer
/// arithmetic, letting `choose(n)` pick a number below `n` wherever there is
/// a decision to make.
pub fn build_graph(choose: &mut impl FnMut(usize) -> usize) -> Graph {
    let mut g = Graph::new();
    let mode = [Mode::I32, Mode::U8, Mode::I64][choose(3)];

    let mut loops: Vec<LoopId> = vec![];
    for _ in 0..choose(4) {
        let parent = match choose(loops.len() + 1) {
            0 => None,
            i => Some(loops[i - 1]),
        };
        loops.push(g.new_loop(parent));
    }

    let mut blocks = vec![g.start_block()];
    for _ in 0..choose(6) {
        let idom = blocks[choose(blocks.len())];
        let outer = g.block_loop(idom);
        let in_loop = pick_loop(&g, choose, &loops, outer);
        blocks.push(g.new_block(idom, in_loop));
    }

    let mut values = vec![];
    for _ in 0..1 + choose(4) {
        let block = blocks[choose(blocks.len())];
        values.push(g.var(mode, block));
    }

    let mut pointers = vec![];
    for _ in 0..1 + choose(24) {
        let block = blocks[choose(blocks.len())];
        let kind = choose(BINARY.len() + 4);
        if kind == BINARY.len() + 3 {
            let p = build_pointer(&mut g, choose, &values, &pointers, mode, block);
            pointers.push(p);
            continue;
        }

        let a = pick_operand(&mut g, choose, &values, mode, block);
        let v = if kind < BINARY.len() {
            let b = pick_operand(&mut g, choose, &values, mode, block);
            g.binop(BINARY[kind], block, a, b)
        } else if kind == BINARY.len() {
            g.unop(Op::Not, block, a)
        } else if kind == BINARY.len() + 1 {
            g.unop(Op::Minus, block, a)
        } else {
            let narrow = g.conv(block, a, Mode::U8);
            g.conv(block, narrow, mode)
        };
        values.push(v);
    }

    for _ in 0..1 + choose(3) {
        let back = choose(values.len().min(4));
        g.add_result(values[values.len() - 1 - back]);
    }
    if let Some(&p) = pointers.last() {
        g.add_result(p);
    }
    g
}

#[cfg(test)]
mod tests {
    use super::*;

    include!(concat!(env!("OUT_DIR"), "/", "fixture_tests.rs"));

    const SEEDS: u64 = 300;

    fn random_graph(rng: &mut StdRng) -> Graph {
        build_graph(&mut |n| rng.gen_range(0..n))
    }

    #[test]
    fn interpreter_follows_wrapping_semantics() {
        let g = parse_str(
            "\
%x:u8 = var
%0:u8 = add %x, 200
%1:u8 = shrs %0, 1
%2:i16 = conv %0
return %1
return %2
",
            None,
        )
        .unwrap();

        let results = interpret(&g, &mut |_, mode| Tarval::from_i128(mode, 100));
        // 300 wraps to 44; u8 shifts fill with the top bit, which is clear.
        assert_eq!(results[0], Tarval::from_i128(Mode::U8, 22));
        assert_eq!(results[1], Tarval::from_i128(Mode::I16, 44));
    }

    #[test]
    fn optimized_graphs_verify() {
        let _ = env_logger::try_init();

        for seed in 0..SEEDS {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut g = random_graph(&mut rng);
            g.verify()
                .unwrap_or_else(|e| panic!("seed {}: generated a broken graph: {}", seed, e));

            ssa_reassoc::optimize(&mut g);
            if let Err(e) = g.verify() {
                panic!("seed {}: optimized graph is broken: {}\n{}", seed, e, g);
            }
        }
    }

    #[test]
    fn optimization_preserves_results() {
        let _ = env_logger::try_init();

        for seed in 0..SEEDS {
            let mut rng = StdRng::seed_from_u64(seed);
            let before = random_graph(&mut rng);
            let mut after = before.clone();
            ssa_reassoc::optimize(&mut after);

            for _ in 0..8 {
                assert_equivalent(&before, &after, &mut || rng.gen::<i64>() as i128);
            }
        }
    }

    #[test]
    fn optimization_is_idempotent() {
        let _ = env_logger::try_init();

        for seed in 0..SEEDS {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut g = random_graph(&mut rng);

            ssa_reassoc::optimize(&mut g);
            let once = g.to_string();
            ssa_reassoc::optimize(&mut g);
            assert_eq!(once, g.to_string(), "seed {}", seed);
        }
    }

    #[test]
    fn printed_graphs_parse_back() {
        for seed in 0..SEEDS {
            let mut rng = StdRng::seed_from_u64(seed);
            let g = random_graph(&mut rng);

            let printed = g.to_string();
            let reparsed = parse_str(&printed, None)
                .unwrap_or_else(|e| panic!("seed {}: {}\n{}", seed, e, printed));
            assert_eq!(printed, reparsed.to_string(), "seed {}", seed);
        }
    }
}
