//! Parsing the graph text format.
//!
//! ```text
//! %L = loop
//! %body = block %start in %L
//! %x:i32 = var
//! %g:p64 = address @global
//! %0:i32 = add 3, %x in %body
//! return %0
//! ```
//!
//! Every value is built through construct-and-fold, so the parsed graph is
//! already folded and free of duplicates. Untyped constants take the mode of
//! the node they appear in (the integer mode of the same width for reference
//! nodes); `3:u8` spells the mode out.

use crate::ir::{BlockId, Graph, LoopId, Mode, Op, ValueId};
use crate::tarval::Tarval;
use std::{
    collections::HashMap,
    fmt,
    iter::Peekable,
    path::{Path, PathBuf},
    str::CharIndices,
    str::FromStr,
};

/// An error that occurs while reading or parsing a graph.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The file could not be read.
    #[error("{}: {source}", .path.display())]
    Io {
        /// The file that was being read.
        path: PathBuf,
        /// Why reading failed.
        source: std::io::Error,
    },

    /// The text is not a well-formed graph.
    #[error("{0}")]
    Syntax(Box<SyntaxError>),
}

/// A malformed statement, pointed at by its byte offset in the source.
#[derive(Debug)]
pub struct SyntaxError {
    offset: usize,
    message: String,
    file: Option<PathBuf>,
    /// Zero-based line and column, and the text of that line, once the
    /// source is known.
    line: Option<(usize, usize, String)>,
}

impl SyntaxError {
    /// The byte offset the error points at.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// What is wrong, without the location.
    pub fn message(&self) -> &str {
        &self.message
    }

    fn locate(&mut self, source: &str) {
        let mut offset = self.offset.min(source.len());
        while !source.is_char_boundary(offset) {
            offset -= 1;
        }
        let line_start = source[..offset].rfind('\n').map_or(0, |i| i + 1);
        let number = source[..line_start].matches('\n').count();
        let text = source[line_start..].lines().next().unwrap_or("");
        self.line = Some((number, offset - line_start, text.to_string()));
    }
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let file = self.file.as_deref().unwrap_or_else(|| Path::new("<input>"));
        match &self.line {
            Some((line, column, text)) => write!(
                f,
                "{}:{}:{}: error: {}\n     |\n{:4} | {}\n     | {:>width$}",
                file.display(),
                line + 1,
                column + 1,
                self.message,
                line + 1,
                text,
                "^",
                width = column + 1,
            ),
            None => write!(
                f,
                "{}: error at byte {}: {}",
                file.display(),
                self.offset,
                self.message
            ),
        }
    }
}

impl ParseError {
    pub(crate) fn new(offset: usize, message: impl Into<String>) -> Self {
        ParseError::Syntax(Box::new(SyntaxError {
            offset,
            message: message.into(),
            file: None,
            line: None,
        }))
    }

    /// Resolve a syntax error's offset against `source`, read from `file`.
    fn locate(mut self, source: &str, file: Option<&Path>) -> Self {
        if let ParseError::Syntax(e) = &mut self {
            e.locate(source);
            e.file = file.map(Path::to_path_buf);
        }
        self
    }
}

/// A `Result` type for parsing.
pub type Result<T> = std::result::Result<T, ParseError>;

/// Parse an in-memory string into a graph.
pub fn parse_str(source: &str, filename: Option<&Path>) -> Result<Graph> {
    let mut parser = Parser::new(source);
    parser
        .statements()
        .map_err(|e| e.locate(source, filename))?;
    Ok(parser.graph)
}

/// Parse a file from disk into a graph.
pub fn parse_file(path: &Path) -> Result<Graph> {
    let source = std::fs::read_to_string(path).map_err(|source| ParseError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_str(&source, Some(path))
}

#[derive(Debug)]
struct Lexer<'a> {
    source: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token<'a> {
    Ident(&'a str),
    ValName(&'a str),
    Symbol(&'a str),
    Comma,
    Colon,
    Eq,
    Int(i128),
    Float(&'a str),
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Lexer {
            source,
            chars: source.char_indices().peekable(),
        }
    }

    /// Consume characters while `pred` holds, returning the end offset.
    fn eat_while(&mut self, mut end: usize, pred: impl Fn(char) -> bool) -> usize {
        while let Some(&(i, c)) = self.chars.peek() {
            if !pred(c) {
                break;
            }
            self.chars.next();
            end = i + c.len_utf8();
        }
        end
    }

    fn eat_char(&mut self, c: char) -> Option<usize> {
        match self.chars.peek() {
            Some(&(i, c2)) if c2 == c => {
                self.chars.next();
                Some(i + 1)
            }
            _ => None,
        }
    }

    /// A name after a one-character sigil like `%` or `@`.
    fn name(&mut self, start: usize, what: &str) -> Result<&'a str> {
        let end = self.eat_while(start + 1, is_ident_char);
        if start + 1 == end {
            Err(ParseError::new(start, format!("expected {} name", what)))
        } else {
            Ok(&self.source[start..end])
        }
    }

    fn number(&mut self, start: usize) -> Result<Token<'a>> {
        let mut end = self.eat_while(start + 1, |c| c.is_ascii_digit());
        let mut float = false;
        if let Some(dot) = self.eat_char('.') {
            float = true;
            end = self.eat_while(dot, |c| c.is_ascii_digit());
        }
        if let Some(e) = self.eat_char('e').or_else(|| self.eat_char('E')) {
            float = true;
            let sign = self
                .eat_char('-')
                .or_else(|| self.eat_char('+'))
                .unwrap_or(e);
            end = self.eat_while(sign, |c| c.is_ascii_digit());
        }

        let text = &self.source[start..end];
        if float {
            return match f64::from_str(text) {
                Ok(_) => Ok(Token::Float(text)),
                Err(e) => Err(ParseError::new(
                    start,
                    format!("failed to parse float: {}", e),
                )),
            };
        }
        match i128::from_str(text) {
            Ok(x) => Ok(Token::Int(x)),
            // Unsigned 128-bit constants wrap into the same bits.
            Err(e) => match u128::from_str(text) {
                Ok(x) => Ok(Token::Int(x as i128)),
                Err(_) => Err(ParseError::new(
                    start,
                    format!("failed to parse int: {}", e),
                )),
            },
        }
    }

    /// Get the next token.
    ///
    /// Returns `None` at EOF.
    fn next_token(&mut self) -> Result<Option<(usize, Token<'a>)>> {
        loop {
            match self.chars.peek() {
                // EOF.
                None => return Ok(None),

                // Eat whitespace.
                Some((_, c)) if c.is_whitespace() => {
                    self.eat_while(0, char::is_whitespace);
                }

                // Eat comments.
                Some((_, ';')) => {
                    self.eat_while(0, |c| c != '\n');
                }

                _ => break,
            }
        }

        let (start, c) = match self.chars.next() {
            Some(next) => next,
            None => return Ok(None),
        };
        let token = match c {
            ',' => Token::Comma,
            '=' => Token::Eq,
            ':' => Token::Colon,
            '%' => Token::ValName(self.name(start, "value")?),
            '@' => Token::Symbol(&self.name(start, "symbol")?[1..]),
            c if c.is_ascii_alphabetic() => {
                let end = self.eat_while(start + 1, is_ident_char);
                Token::Ident(&self.source[start..end])
            }
            c if c == '-' || c.is_ascii_digit() => self.number(start)?,
            c => return Err(ParseError::new(start, format!("unexpected '{}'", c))),
        };
        Ok(Some((start, token)))
    }
}

/// What a `%name` refers to.
#[derive(Copy, Clone, Debug)]
enum Entity {
    Value(ValueId),
    Block(BlockId),
    Loop(LoopId),
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    lookahead: Option<(usize, Token<'a>)>,
    names: HashMap<&'a str, Entity>,
    graph: Graph,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        let graph = Graph::new();
        let mut names = HashMap::new();
        names.insert("%start", Entity::Block(graph.start_block()));
        Parser {
            lexer: Lexer::new(source),
            lookahead: None,
            names,
            graph,
        }
    }

    fn eof_error(&self) -> ParseError {
        ParseError::new(self.lexer.source.len().saturating_sub(1), "unexpected EOF")
    }

    fn peek_token(&mut self) -> Result<Option<&(usize, Token<'a>)>> {
        if self.lookahead.is_none() {
            self.lookahead = self.lexer.next_token()?;
        }
        Ok(self.lookahead.as_ref())
    }

    fn token(&mut self) -> Result<(usize, Token<'a>)> {
        if let Some(tok) = self.lookahead.take() {
            return Ok(tok);
        }
        match self.lexer.next_token()? {
            Some(tok) => Ok(tok),
            None => Err(self.eof_error()),
        }
    }

    /// Is the next token `tok`? Consumes it if so.
    fn eat(&mut self, tok: Token) -> Result<bool> {
        let found = matches!(self.peek_token()?, Some((_, t)) if *t == tok);
        if found {
            self.lookahead = None;
        }
        Ok(found)
    }

    fn expect(&mut self, tok: Token) -> Result<()> {
        match self.token()? {
            (_, t) if t == tok => Ok(()),
            (pos, t) => Err(ParseError::new(
                pos,
                format!("expected {:?}, found {:?}", tok, t),
            )),
        }
    }

    fn val_name(&mut self) -> Result<(usize, &'a str)> {
        match self.token()? {
            (pos, Token::ValName(name)) => Ok((pos, name)),
            (pos, t) => Err(ParseError::new(
                pos,
                format!("expected a value name, found {:?}", t),
            )),
        }
    }

    fn ident(&mut self) -> Result<(usize, &'a str)> {
        match self.token()? {
            (pos, Token::Ident(ident)) => Ok((pos, ident)),
            (pos, t) => Err(ParseError::new(
                pos,
                format!("expected an identifier, found {:?}", t),
            )),
        }
    }

    fn lookup(&mut self) -> Result<(usize, Entity)> {
        let (pos, name) = self.val_name()?;
        match self.names.get(name) {
            Some(&entity) => Ok((pos, entity)),
            None => Err(ParseError::new(pos, format!("unknown name '{}'", name))),
        }
    }

    fn block_name(&mut self) -> Result<BlockId> {
        match self.lookup()? {
            (_, Entity::Block(b)) => Ok(b),
            (pos, _) => Err(ParseError::new(pos, "expected a block")),
        }
    }

    fn loop_name(&mut self) -> Result<LoopId> {
        match self.lookup()? {
            (_, Entity::Loop(l)) => Ok(l),
            (pos, _) => Err(ParseError::new(pos, "expected a loop")),
        }
    }

    /// An optional `in %b` suffix; the start block otherwise.
    fn placement(&mut self) -> Result<BlockId> {
        if self.eat(Token::Ident("in"))? {
            self.block_name()
        } else {
            Ok(self.graph.start_block())
        }
    }

    /// An optional `:mode` annotation.
    fn mode_annotation(&mut self) -> Result<Option<Mode>> {
        if !self.eat(Token::Colon)? {
            return Ok(None);
        }
        let (pos, name) = self.ident()?;
        match Mode::from_name(name) {
            Some(mode) => Ok(Some(mode)),
            None => Err(ParseError::new(pos, format!("unknown mode '{}'", name))),
        }
    }

    /// A value name or an inline constant. Constants without an annotation
    /// take `default`.
    fn operand(&mut self, default: Option<Mode>) -> Result<ValueId> {
        let (pos, tok) = self.token()?;
        let literal = match tok {
            Token::ValName(_) => {
                self.lookahead = Some((pos, tok));
                return match self.lookup()? {
                    (_, Entity::Value(v)) => Ok(v),
                    (pos, _) => Err(ParseError::new(pos, "expected a value")),
                };
            }
            Token::Int(_) | Token::Float(_) => tok,
            t => {
                return Err(ParseError::new(
                    pos,
                    format!("expected an operand, found {:?}", t),
                ))
            }
        };

        let mode = match self.mode_annotation()?.or(default) {
            Some(mode) => mode,
            None => return Err(ParseError::new(pos, "constant needs a mode, like `1:i32`")),
        };
        let tv = match literal {
            Token::Int(x) => Tarval::from_i128(mode, x),
            Token::Float(text) if mode.is_float() => {
                Tarval::from_f64(mode, f64::from_str(text).unwrap_or(f64::NAN))
            }
            _ => {
                return Err(ParseError::new(
                    pos,
                    format!("float constant of non-float mode {}", mode),
                ))
            }
        };
        Ok(self.graph.constant(tv))
    }

    fn define(&mut self, pos: usize, name: &'a str, entity: Entity) -> Result<()> {
        if self.names.insert(name, entity).is_some() {
            return Err(ParseError::new(pos, format!("redefinition of '{}'", name)));
        }
        Ok(())
    }

    fn statements(&mut self) -> Result<()> {
        while self.peek_token()?.is_some() {
            self.statement()?;
        }
        Ok(())
    }

    fn statement(&mut self) -> Result<()> {
        let (pos, tok) = self.token()?;
        let name = match tok {
            Token::Ident("return") => {
                let v = self.operand(None)?;
                self.graph.add_result(v);
                return Ok(());
            }
            Token::ValName(name) => name,
            t => {
                return Err(ParseError::new(
                    pos,
                    format!("expected a statement, found {:?}", t),
                ))
            }
        };

        let mode = self.mode_annotation()?;
        self.expect(Token::Eq)?;
        let (op_pos, op_name) = self.ident()?;

        let entity = match (op_name, mode) {
            ("loop", None) => {
                let parent = if self.eat(Token::Ident("in"))? {
                    Some(self.loop_name()?)
                } else {
                    None
                };
                Entity::Loop(self.graph.new_loop(parent))
            }
            ("block", None) => {
                let idom = self.block_name()?;
                let in_loop = if self.eat(Token::Ident("in"))? {
                    Some(self.loop_name()?)
                } else {
                    None
                };
                Entity::Block(self.graph.new_block(idom, in_loop))
            }
            ("loop", Some(_)) | ("block", Some(_)) => {
                return Err(ParseError::new(pos, format!("a {} has no mode", op_name)))
            }
            (_, None) => return Err(ParseError::new(pos, format!("'{}' needs a mode", name))),
            (_, Some(mode)) => Entity::Value(self.value(op_pos, op_name, mode)?),
        };
        self.define(pos, name, entity)
    }

    fn value(&mut self, pos: usize, op_name: &str, mode: Mode) -> Result<ValueId> {
        let symbolic: Option<fn(_) -> Op> = match op_name {
            "address" => Some(Op::Address),
            "offset" => Some(Op::Offset),
            "align" => Some(Op::Align),
            "size" => Some(Op::Size),
            _ => None,
        };
        if let Some(make) = symbolic {
            return match self.token()? {
                (_, Token::Symbol(sym)) => {
                    let op = make(self.graph.symbol(sym));
                    let start = self.graph.start_block();
                    Ok(self.graph.node(op, mode, start, &[]))
                }
                (pos, t) => Err(ParseError::new(
                    pos,
                    format!("expected a symbol, found {:?}", t),
                )),
            };
        }

        if op_name == "var" {
            let block = self.placement()?;
            return Ok(self.graph.var(mode, block));
        }

        let op = match Op::from_name(op_name) {
            Some(op) => op,
            None => return Err(ParseError::new(pos, format!("unknown operation '{}'", op_name))),
        };
        if op == Op::Bad {
            return Ok(self.graph.bad(mode));
        }

        let default = match mode {
            Mode::Reference { bits } => Mode::Int { bits, signed: true },
            _ => mode,
        };
        let mut operands = vec![self.operand(Some(default))?];
        while self.eat(Token::Comma)? {
            operands.push(self.operand(Some(default))?);
        }
        if operands.len() != op.arity() {
            return Err(ParseError::new(
                pos,
                format!(
                    "'{}' takes {} operands, found {}",
                    op_name,
                    op.arity(),
                    operands.len()
                ),
            ));
        }

        let block = self.placement()?;
        for &o in &operands {
            if !self.graph.dominates(self.graph.block(o), block) {
                return Err(ParseError::new(
                    pos,
                    "operand is not available in this block",
                ));
            }
        }
        Ok(self.graph.node(op, mode, block, &operands))
    }
}
