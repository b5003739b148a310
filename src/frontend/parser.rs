use std::collections::BTreeMap;

use crate::builtins::Procedure;
use crate::bytecode::op::{CONSTANTS, CONSTANT_FIRST, constant_by_name};
use crate::frontend::lexer::{Lexer, Span, Spanned};
use crate::frontend::parser_error::ParserError;
use crate::frontend::token::Token;
use crate::lang::node::{Node, NodeType};
use crate::lang::value::MAX_VECTOR_SIZE;
use crate::lang::variable::DataType;

/// A `#` line of the script.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// `#input name [size|id] [defaults...]`
    Input {
        name: String,
        data_type: DataType,
        vector_size: u8,
        defaults: Vec<f32>,
        span: Span,
    },
    /// `#output name [size]`
    Output {
        name: String,
        vector_size: Option<u8>,
        span: Span,
    },
    /// `#define name value`
    Define {
        name: String,
        value: String,
        span: Span,
    },
}

/// Parser output: the statement tree and the directives found in the source.
#[derive(Debug, Clone)]
pub struct ParsedScript {
    pub root: Node,
    pub directives: Vec<Directive>,
    /// Effective defines: compiler options overlaid by script defines.
    pub defines: BTreeMap<String, String>,
}

/// Recursive-descent parser for scripts.
///
/// Statements are assignments, procedure calls and control flow. Expressions
/// are parsed as flat *sequences* of operands and operators; precedence is
/// applied later by the transform stage.
///
/// Notes:
/// - Directive tokens are removed and parsed before any statement.
/// - `#define` names are substituted token by token before parsing.
pub struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    /// Span of the most recently consumed token.
    last_span: Option<Span>,
    /// Lower-cased names of callable external functions.
    externals: Vec<String>,
}

impl Parser {
    pub fn new(tokens: Vec<Spanned>) -> Self {
        Parser {
            tokens,
            pos: 0,
            last_span: None,
            externals: Vec::new(),
        }
    }

    /// Names that may be called as statements besides the procedures.
    pub fn with_externals<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.externals = names
            .into_iter()
            .map(|n| n.as_ref().to_ascii_lowercase())
            .collect();
        self
    }

    fn current(&self) -> Option<&Spanned> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Spanned> {
        let token = self.tokens.get(self.pos).cloned();
        if let Some(s) = &token {
            self.last_span = Some(s.span);
        }
        self.pos += 1;
        token
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn peek_next(&self) -> Option<&Token> {
        self.tokens.get(self.pos + 1).map(|s| &s.token)
    }

    fn span(&self) -> Span {
        self.current()
            .map(|s| s.span)
            .or(self.last_span)
            .unwrap_or(Span { line: 1, col: 1 })
    }

    /// Constructs a `ParserError` at the current token, falling back to the
    /// last consumed one.
    fn error(&self, message: impl Into<String>) -> ParserError {
        let span = self.span();
        ParserError {
            message: message.into(),
            line: span.line,
            col: span.col,
        }
    }

    fn expect(&mut self, expected: Token) -> Result<Span, ParserError> {
        match self.current() {
            Some(s) if s.token == expected => {
                let span = s.span;
                self.advance();
                Ok(span)
            }
            Some(s) => Err(self.error(format!(
                "expected '{}', found '{}'",
                expected.text(),
                s.token.text()
            ))),
            None => Err(self.error(format!("expected '{}'", expected.text()))),
        }
    }

    fn at(&self, token: &Token) -> bool {
        self.peek() == Some(token)
    }

    /// Parses a complete script.
    ///
    /// `option_defines` are applied first; `#define` lines in the script
    /// override them.
    pub fn parse(
        &mut self,
        option_defines: &BTreeMap<String, String>,
    ) -> Result<ParsedScript, ParserError> {
        let directives = self.take_directives()?;

        let mut defines: BTreeMap<String, String> = option_defines
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
            .collect();
        for directive in &directives {
            if let Directive::Define { name, value, .. } = directive {
                defines.insert(name.to_ascii_lowercase(), value.clone());
            }
        }
        self.substitute_defines(&defines, &directives)?;

        let start = self.span();
        let mut root = Node::new(NodeType::Root, start);
        while !matches!(self.peek(), Some(Token::Eof) | None) {
            if let Some(statement) = self.parse_statement()? {
                root.children.push(statement);
            }
        }

        Ok(ParsedScript {
            root,
            directives,
            defines,
        })
    }

    // =========================================================================
    // Directives
    // =========================================================================

    fn take_directives(&mut self) -> Result<Vec<Directive>, ParserError> {
        let mut directives = Vec::new();
        let mut rest = Vec::with_capacity(self.tokens.len());
        for spanned in std::mem::take(&mut self.tokens) {
            match &spanned.token {
                Token::Directive(text) => directives.push(parse_directive(text, spanned.span)?),
                _ => rest.push(spanned),
            }
        }
        self.tokens = rest;
        Ok(directives)
    }

    fn substitute_defines(
        &mut self,
        defines: &BTreeMap<String, String>,
        directives: &[Directive],
    ) -> Result<(), ParserError> {
        if defines.is_empty() {
            return Ok(());
        }

        let mut out = Vec::with_capacity(self.tokens.len());
        for spanned in std::mem::take(&mut self.tokens) {
            let replacement = match &spanned.token {
                Token::Ident(name) => defines.get(&name.to_ascii_lowercase()),
                _ => None,
            };
            let Some(value) = replacement else {
                out.push(spanned);
                continue;
            };

            let tokens = Lexer::new(value).tokenize().map_err(|e| {
                let span = define_span(directives, value).unwrap_or(spanned.span);
                ParserError {
                    message: format!("invalid define value '{}': {}", value, e.message),
                    line: span.line,
                    col: span.col,
                }
            })?;
            out.extend(
                tokens
                    .into_iter()
                    .filter(|t| t.token != Token::Eof)
                    .map(|t| Spanned {
                        token: t.token,
                        span: spanned.span,
                    }),
            );
        }
        self.tokens = out;
        Ok(())
    }

    // =========================================================================
    // Statements
    // =========================================================================

    /// Parses one statement; `None` for an empty `;`.
    fn parse_statement(&mut self) -> Result<Option<Node>, ParserError> {
        let span = self.span();
        let token = match self.peek() {
            Some(t) => t.clone(),
            None => return Err(self.error("unexpected end of input")),
        };

        match token {
            Token::Semicolon => {
                self.advance();
                Ok(None)
            }
            Token::If => self.parse_if().map(Some),
            Token::While => self.parse_while().map(Some),
            Token::For => self.parse_for().map(Some),
            Token::Return => {
                self.advance();
                self.expect(Token::Semicolon)?;
                Ok(Some(Node::procedure(Procedure::Return, Vec::new(), span)))
            }
            Token::Ident(name) => {
                if self.peek_next() == Some(&Token::Assign) {
                    let node = self.parse_assignment()?;
                    self.expect(Token::Semicolon)?;
                    return Ok(Some(node));
                }
                if name.eq_ignore_ascii_case("yield") {
                    return self.parse_yield().map(Some);
                }
                if self.peek_next() == Some(&Token::LParen) {
                    return self.parse_call_statement(&name).map(Some);
                }
                Err(self.error(format!("expected '=' after '{}'", name)))
            }
            other => Err(self.error(format!("unexpected '{}'", other.text()))),
        }
    }

    /// `identifier = sequence` without the terminator.
    fn parse_assignment(&mut self) -> Result<Node, ParserError> {
        let span = self.span();
        let name = match self.advance().map(|s| s.token) {
            Some(Token::Ident(name)) => name,
            _ => return Err(self.error("expected identifier")),
        };
        self.expect(Token::Assign)?;

        let mut node = Node::with_identifier(NodeType::Assignment, name, span);
        node.children = self.parse_sequence(&[Token::Semicolon, Token::RParen])?;
        Ok(node)
    }

    fn parse_yield(&mut self) -> Result<Node, ParserError> {
        let span = self.span();
        self.advance(); // 'yield'
        let mut children = Vec::new();
        if !self.at(&Token::Semicolon) {
            children.push(into_argument(
                self.parse_sequence(&[Token::Semicolon])?,
                span,
            ));
        }
        self.expect(Token::Semicolon)?;
        Ok(Node::procedure(Procedure::Yield, children, span))
    }

    /// Root level calls: procedures and external functions.
    fn parse_call_statement(&mut self, name: &str) -> Result<Node, ParserError> {
        let span = self.span();
        let is_known = Procedure::from_name(name).is_some()
            || self.externals.iter().any(|e| e == &name.to_ascii_lowercase());
        if !is_known {
            return Err(self.error(format!("unknown procedure '{}'", name)));
        }
        self.advance(); // name
        let args = self.parse_arguments()?;
        self.expect(Token::Semicolon)?;

        let node = match Procedure::from_name(name) {
            Some(procedure) => Node::procedure(procedure, args, span),
            None => call(name, args, span),
        };
        Ok(node)
    }

    /// `if (condition) [then] block [else block]`
    fn parse_if(&mut self) -> Result<Node, ParserError> {
        let span = self.span();
        self.advance(); // 'if'
        let condition = self.parse_condition()?;
        if self.at(&Token::Then) {
            self.advance();
        }

        let then_span = self.span();
        let then_block = Node::with_children(NodeType::IfThen, self.parse_block()?, then_span);
        let mut children = vec![condition, then_block];

        if self.at(&Token::Else) {
            let else_span = self.span();
            self.advance();
            children.push(Node::with_children(
                NodeType::IfElse,
                self.parse_block()?,
                else_span,
            ));
        }
        Ok(Node::with_children(NodeType::IfThenElse, children, span))
    }

    /// `while (condition) block`
    fn parse_while(&mut self) -> Result<Node, ParserError> {
        let span = self.span();
        self.advance(); // 'while'
        let condition = self.parse_condition()?;
        let body_span = self.span();
        let body = Node::with_children(NodeType::WhileCompound, self.parse_block()?, body_span);
        Ok(Node::with_children(
            NodeType::While,
            vec![condition, body],
            span,
        ))
    }

    /// `for (init; condition; step) block`
    fn parse_for(&mut self) -> Result<Node, ParserError> {
        let span = self.span();
        self.advance(); // 'for'
        self.expect(Token::LParen)?;
        let init = self.parse_assignment()?;
        self.expect(Token::Semicolon)?;

        let condition_span = self.span();
        let condition = Node::with_children(
            NodeType::Condition,
            self.parse_sequence(&[Token::Semicolon])?,
            condition_span,
        );
        self.expect(Token::Semicolon)?;
        let step = self.parse_assignment()?;
        self.expect(Token::RParen)?;

        let body_span = self.span();
        let body = Node::with_children(NodeType::WhileCompound, self.parse_block()?, body_span);
        Ok(Node::with_children(
            NodeType::For,
            vec![init, condition, step, body],
            span,
        ))
    }

    fn parse_condition(&mut self) -> Result<Node, ParserError> {
        let span = self.expect(Token::LParen)?;
        let items = self.parse_sequence(&[Token::RParen])?;
        self.expect(Token::RParen)?;
        Ok(Node::with_children(NodeType::Condition, items, span))
    }

    /// `( statements )`, `{ statements }` or a single statement.
    fn parse_block(&mut self) -> Result<Vec<Node>, ParserError> {
        let close = match self.peek() {
            Some(Token::LParen) => Token::RParen,
            Some(Token::LBrace) => Token::RBrace,
            _ => return Ok(self.parse_statement()?.into_iter().collect()),
        };
        self.advance();

        let mut statements = Vec::new();
        loop {
            match self.peek() {
                Some(t) if *t == close => break,
                Some(Token::Eof) | None => {
                    return Err(self.error(format!("expected '{}'", close.text())));
                }
                _ => {
                    if let Some(statement) = self.parse_statement()? {
                        statements.push(statement);
                    }
                }
            }
        }
        self.advance();
        Ok(statements)
    }

    // =========================================================================
    // Sequences
    // =========================================================================

    /// Parses items until one of `terminators` (not consumed).
    fn parse_sequence(&mut self, terminators: &[Token]) -> Result<Vec<Node>, ParserError> {
        let mut items = Vec::new();
        loop {
            let Some(spanned) = self.current() else {
                return Err(self.error("unexpected end of input"));
            };
            if terminators.contains(&spanned.token) {
                break;
            }
            let span = spanned.span;
            let token = spanned.token.clone();

            if let Some(op) = token.operator() {
                self.advance();
                items.push(Node::operation(op, span));
                continue;
            }

            match token {
                Token::Number(_) | Token::Ident(_) | Token::LParen => {
                    let operand = self.parse_operand()?;
                    items.push(operand);
                }
                Token::Eof => return Err(self.error("unexpected end of input")),
                other => return Err(self.error(format!("unexpected '{}'", other.text()))),
            }
        }

        if items.is_empty() {
            return Err(self.error("expected an expression"));
        }
        Ok(items)
    }

    fn parse_operand(&mut self) -> Result<Node, ParserError> {
        let span = self.span();
        let token = self.advance().map(|s| s.token);

        let operand = match token {
            Some(Token::Number(value)) => Node::literal(value, span),
            Some(Token::LParen) => {
                let items = self.parse_sequence(&[Token::RParen])?;
                self.expect(Token::RParen)?;
                Node::with_children(NodeType::Compound, items, span)
            }
            Some(Token::Ident(name)) => {
                if self.at(&Token::LParen) {
                    let args = self.parse_arguments()?;
                    if name.eq_ignore_ascii_case("pop") && args.is_empty() {
                        Node::pop(span)
                    } else {
                        call(&name, args, span)
                    }
                } else if name.eq_ignore_ascii_case("pop") {
                    Node::pop(span)
                } else if let Some(byte) = constant_by_name(&name) {
                    let value = CONSTANTS[(byte - CONSTANT_FIRST) as usize].value;
                    let mut node = Node::literal(value, span);
                    node.identifier = name.to_ascii_lowercase();
                    node.constant = Some(byte);
                    node
                } else {
                    Node::with_identifier(NodeType::Parameter, name, span)
                }
            }
            _ => return Err(self.error("expected an operand")),
        };

        self.parse_index(operand)
    }

    /// Postfix component access: `.x` or `[n]`, repeatable.
    fn parse_index(&mut self, mut operand: Node) -> Result<Node, ParserError> {
        loop {
            let span = self.span();
            let component = match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    match self.advance().map(|s| s.token) {
                        Some(Token::Ident(name)) => component_index(&name)
                            .ok_or_else(|| self.error(format!("invalid component '{}'", name)))?,
                        _ => return Err(self.error("expected a component after '.'")),
                    }
                }
                Some(Token::LBracket) => {
                    self.advance();
                    let index = match self.advance().map(|s| s.token) {
                        Some(Token::Number(n)) if n.fract() == 0.0 && (0.0..4.0).contains(&n) => {
                            n as usize
                        }
                        _ => return Err(self.error("expected an index 0 to 3")),
                    };
                    self.expect(Token::RBracket)?;
                    index
                }
                _ => return Ok(operand),
            };

            let mut index = Node::with_identifier(NodeType::Index, COMPONENTS[component], span);
            index.children.push(operand);
            operand = index;
        }
    }

    /// `( [sequence (, sequence)*] )`, one node per argument.
    fn parse_arguments(&mut self) -> Result<Vec<Node>, ParserError> {
        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        if self.at(&Token::RParen) {
            self.advance();
            return Ok(args);
        }
        loop {
            let span = self.span();
            let items = self.parse_sequence(&[Token::Comma, Token::RParen])?;
            args.push(into_argument(items, span));
            match self.advance().map(|s| s.token) {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => break,
                _ => return Err(self.error("expected ',' or ')'")),
            }
        }
        Ok(args)
    }
}

fn call(name: &str, args: Vec<Node>, span: Span) -> Node {
    let mut node = Node::with_identifier(NodeType::Function, name, span);
    node.children = args;
    node
}

const COMPONENTS: [&str; 4] = ["x", "y", "z", "w"];

fn component_index(name: &str) -> Option<usize> {
    match name.to_ascii_lowercase().as_str() {
        "x" | "r" => Some(0),
        "y" | "g" => Some(1),
        "z" | "b" => Some(2),
        "w" | "a" => Some(3),
        _ => None,
    }
}

/// A single operand stays as is; anything else becomes a compound.
fn into_argument(mut items: Vec<Node>, span: Span) -> Node {
    if items.len() == 1 && items[0].is_operand() {
        items.remove(0)
    } else {
        Node::with_children(NodeType::Compound, items, span)
    }
}

fn define_span(directives: &[Directive], value: &str) -> Option<Span> {
    directives.iter().find_map(|d| match d {
        Directive::Define { value: v, span, .. } if v == value => Some(*span),
        _ => None,
    })
}

fn parse_directive(text: &str, span: Span) -> Result<Directive, ParserError> {
    let error = |message: String| ParserError {
        message,
        line: span.line,
        col: span.col,
    };
    let mut words = text.split_whitespace();
    let kind = words.next().unwrap_or("").to_ascii_lowercase();
    let name = words
        .next()
        .ok_or_else(|| error(format!("#{} needs a name", kind)))?
        .to_string();
    let rest: Vec<&str> = words.collect();

    let parse_number = |word: &str| -> Result<f32, ParserError> {
        word.trim_end_matches(['f', 'F'])
            .parse::<f32>()
            .map_err(|_| error(format!("invalid number '{}' in #{}", word, kind)))
    };
    let parse_size = |word: &str| -> Result<u8, ParserError> {
        match word.parse::<u8>() {
            Ok(size) if (1..=MAX_VECTOR_SIZE).contains(&size) => Ok(size),
            _ => Err(error(format!("invalid vector size '{}' in #{}", word, kind))),
        }
    };

    match kind.as_str() {
        "input" => {
            let mut data_type = DataType::Numeric;
            let mut vector_size = 1;
            let mut values = rest.as_slice();
            if let Some(first) = values.first() {
                if first.eq_ignore_ascii_case("id") {
                    data_type = DataType::Id;
                } else {
                    vector_size = parse_size(first)?;
                }
                values = &values[1..];
            }
            let mut defaults = values
                .iter()
                .map(|w| parse_number(w))
                .collect::<Result<Vec<f32>, _>>()?;
            if defaults.len() == 1 && vector_size > 1 {
                defaults = vec![defaults[0]; vector_size as usize];
            }
            if !defaults.is_empty() && defaults.len() != vector_size as usize {
                return Err(error(format!(
                    "#input {} expects {} default values, found {}",
                    name,
                    vector_size,
                    defaults.len()
                )));
            }
            Ok(Directive::Input {
                name,
                data_type,
                vector_size,
                defaults,
                span,
            })
        }
        "output" => {
            let vector_size = match rest.first() {
                Some(word) => Some(parse_size(word)?),
                None => None,
            };
            Ok(Directive::Output {
                name,
                vector_size,
                span,
            })
        }
        "define" => {
            if rest.is_empty() {
                return Err(error(format!("#define {} needs a value", name)));
            }
            Ok(Directive::Define {
                name,
                value: rest.join(" "),
                span,
            })
        }
        other => Err(error(format!("unknown directive '#{}'", other))),
    }
}
