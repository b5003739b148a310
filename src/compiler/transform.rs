//! Normalizes the parsed tree.
//!
//! - `for` becomes its init statement followed by a `while`.
//! - `while` becomes `Label L; IfThenElse(cond, IfThen[body.., JumpTo L])`.
//! - Operator precedence is made explicit by wrapping tighter runs into
//!   compounds, since the interpreter evaluates strictly left to right.
//! - Single-element compounds are unwrapped.
//! - Root `pop(x)` becomes `x = pop`.

use tracing::trace;

use crate::builtins::{FunctionRef, Procedure};
use crate::bytecode::op::ScriptOp;
use crate::compiler::{CompilationData, CompileError, CompilerStage};
use crate::frontend::lexer::Span;
use crate::lang::node::{Node, NodeType};

pub struct Transform;

impl CompilerStage for Transform {
    fn name(&self) -> &'static str {
        "transform"
    }

    fn execute(&self, data: &mut CompilationData<'_>) -> Result<(), CompileError> {
        let mut labels = 0;
        let statements = std::mem::take(&mut data.root.children);
        data.root.children = transform_block(statements, &mut labels)?;
        trace!(tree = %data.root.to_tree_string(), "transformed");
        Ok(())
    }
}

/// Precedence levels, loosest first.
const LEVELS: [&[ScriptOp]; 4] = [
    &[ScriptOp::And, ScriptOp::Or, ScriptOp::Xor],
    &[
        ScriptOp::Smaller,
        ScriptOp::Greater,
        ScriptOp::SmallerEquals,
        ScriptOp::GreaterEquals,
        ScriptOp::Equals,
        ScriptOp::NotEquals,
    ],
    &[ScriptOp::Add, ScriptOp::Substract],
    &[ScriptOp::Multiply, ScriptOp::Divide],
];

fn is_unary(op: ScriptOp) -> bool {
    matches!(op, ScriptOp::Add | ScriptOp::Substract | ScriptOp::Not)
}

fn transform_block(statements: Vec<Node>, labels: &mut usize) -> Result<Vec<Node>, CompileError> {
    let mut out = Vec::with_capacity(statements.len());
    for statement in statements {
        out.extend(transform_statement(statement, labels)?);
    }
    Ok(out)
}

fn transform_statement(mut node: Node, labels: &mut usize) -> Result<Vec<Node>, CompileError> {
    match node.kind {
        NodeType::Assignment | NodeType::Condition => {
            node.children = transform_sequence(std::mem::take(&mut node.children))?;
            Ok(vec![node])
        }
        NodeType::Function => {
            if node.is_procedure(Procedure::Pop) && node.children.len() == 1 {
                return pop_into(node);
            }
            node.children = transform_arguments(std::mem::take(&mut node.children))?;
            Ok(vec![node])
        }
        NodeType::IfThenElse => {
            let mut children = Vec::with_capacity(node.children.len());
            for mut child in std::mem::take(&mut node.children) {
                child = match child.kind {
                    NodeType::Condition => transform_statement(child, labels)?.remove(0),
                    _ => {
                        child.children = transform_block(std::mem::take(&mut child.children), labels)?;
                        child
                    }
                };
                children.push(child);
            }
            node.children = children;
            Ok(vec![node])
        }
        NodeType::While => {
            let mut parts = std::mem::take(&mut node.children).into_iter();
            let (Some(condition), Some(body)) = (parts.next(), parts.next()) else {
                return Err(CompileError::Internal("malformed while".to_string()));
            };
            lower_while(condition, body.children, node.span, labels)
        }
        NodeType::For => {
            let mut parts = std::mem::take(&mut node.children).into_iter();
            let (Some(init), Some(condition), Some(step), Some(body)) =
                (parts.next(), parts.next(), parts.next(), parts.next())
            else {
                return Err(CompileError::Internal("malformed for".to_string()));
            };
            let mut out = transform_statement(init, labels)?;
            let mut statements = body.children;
            statements.push(step);
            out.extend(lower_while(condition, statements, node.span, labels)?);
            Ok(out)
        }
        _ => Ok(vec![node]),
    }
}

fn lower_while(
    condition: Node,
    body: Vec<Node>,
    span: Span,
    labels: &mut usize,
) -> Result<Vec<Node>, CompileError> {
    let label = format!("while{}", *labels);
    *labels += 1;

    let condition = transform_statement(condition, labels)?.remove(0);
    let mut statements = transform_block(body, labels)?;
    statements.push(Node::with_identifier(NodeType::JumpTo, label.as_str(), span));

    let then_block = Node::with_children(NodeType::IfThen, statements, span);
    Ok(vec![
        Node::with_identifier(NodeType::Label, label.as_str(), span),
        Node::with_children(NodeType::IfThenElse, vec![condition, then_block], span),
    ])
}

/// `pop(x);` becomes `x = pop;`.
fn pop_into(node: Node) -> Result<Vec<Node>, CompileError> {
    let target = &node.children[0];
    if target.kind != NodeType::Parameter || target.is_literal() {
        return Err(CompileError::unsupported(
            "pop needs a variable to pop into",
            &node,
        ));
    }
    let mut assign = Node::with_identifier(NodeType::Assignment, target.identifier.as_str(), node.span);
    assign.children.push(Node::pop(node.span));
    Ok(vec![assign])
}

/// Function arguments: each argument is one operand or a compound.
fn transform_arguments(args: Vec<Node>) -> Result<Vec<Node>, CompileError> {
    args.into_iter().map(transform_operand).collect()
}

fn transform_operand(mut node: Node) -> Result<Node, CompileError> {
    match node.kind {
        NodeType::Compound => {
            let mut items = transform_sequence(std::mem::take(&mut node.children))?;
            if items.len() == 1 && items[0].is_operand() {
                return Ok(items.remove(0));
            }
            node.children = items;
            Ok(node)
        }
        NodeType::Function => {
            if matches!(node.function, Some(FunctionRef::Procedure(p)) if p != Procedure::Pop) {
                return Err(CompileError::unsupported(
                    format!("'{}' cannot be used as a value", node.identifier),
                    &node,
                ));
            }
            node.children = transform_arguments(std::mem::take(&mut node.children))?;
            Ok(node)
        }
        NodeType::Index => {
            node.children = transform_arguments(std::mem::take(&mut node.children))?;
            Ok(node)
        }
        _ => Ok(node),
    }
}

/// Applies precedence to a sequence and returns the flat item list.
pub fn transform_sequence(items: Vec<Node>) -> Result<Vec<Node>, CompileError> {
    let items = items
        .into_iter()
        .map(transform_operand)
        .collect::<Result<Vec<_>, _>>()?;
    let items = fold_negative_literals(items);
    check_operands(&items)?;

    let components = split_components(items);
    let mut out = Vec::new();
    let multiple = components.len() > 1;
    for component in components {
        let grouped = group(component, 0);
        if multiple && grouped.len() > 1 {
            let span = grouped[0].span;
            out.push(Node::with_children(NodeType::Compound, grouped, span));
        } else {
            out.extend(grouped);
        }
    }

    // A sequence that is one compound is that compound's sequence.
    while out.len() == 1 && out[0].kind == NodeType::Compound {
        let compound = out.remove(0);
        out = compound.children;
    }
    Ok(out)
}

/// `-` directly before a literal in unary position becomes a negative literal.
fn fold_negative_literals(items: Vec<Node>) -> Vec<Node> {
    let mut out: Vec<Node> = Vec::with_capacity(items.len());
    let mut expect_operand = true;
    let mut iter = items.into_iter().peekable();

    while let Some(item) = iter.next() {
        if expect_operand
            && item.is_operation_of(ScriptOp::Substract)
            && iter.peek().is_some_and(|next| next.is_literal())
        {
            if let Some(literal) = iter.next() {
                let value = -literal.value.unwrap_or(0.0);
                out.push(Node::literal(value, item.span));
                expect_operand = false;
                continue;
            }
        }
        expect_operand = item.is_operation();
        out.push(item);
    }
    out
}

/// Every binary operator needs an operand on both sides.
fn check_operands(items: &[Node]) -> Result<(), CompileError> {
    let mut expect_operand = true;
    for item in items {
        match item.op {
            Some(op) if item.is_operation() => {
                if expect_operand && !is_unary(op) {
                    return Err(CompileError::unsupported(
                        format!("operator '{}' without left operand", op.name()),
                        item,
                    ));
                }
                expect_operand = true;
            }
            _ => expect_operand = false,
        }
    }
    if expect_operand {
        if let Some(last) = items.last() {
            return Err(CompileError::unsupported("missing operand", last));
        }
    }
    Ok(())
}

/// Splits a sequence at juxtaposition: an operand (or a `!`) that directly
/// follows an operand starts a new vector component.
fn split_components(items: Vec<Node>) -> Vec<Vec<Node>> {
    let mut components: Vec<Vec<Node>> = Vec::new();
    let mut current = Vec::new();
    let mut expect_operand = true;

    for item in items {
        let starts_component =
            !expect_operand && (!item.is_operation() || item.is_operation_of(ScriptOp::Not));
        if starts_component {
            components.push(std::mem::take(&mut current));
        }
        expect_operand = item.is_operation();
        current.push(item);
    }
    if !current.is_empty() {
        components.push(current);
    }
    components
}

/// Groups one component by precedence starting at `level`.
///
/// The first piece of a split is left unwrapped: it is evaluated first anyway.
fn group(items: Vec<Node>, level: usize) -> Vec<Node> {
    if level == LEVELS.len() {
        return items;
    }

    let mut pieces: Vec<Vec<Node>> = vec![Vec::new()];
    let mut operators = Vec::new();
    let mut expect_operand = true;

    for item in items {
        let splits = !expect_operand
            && item.is_operation()
            && item.op.is_some_and(|op| LEVELS[level].contains(&op));
        if splits {
            operators.push(item);
            pieces.push(Vec::new());
            expect_operand = true;
            continue;
        }
        expect_operand = item.is_operation();
        if let Some(piece) = pieces.last_mut() {
            piece.push(item);
        }
    }

    if pieces.len() == 1 {
        return group(pieces.remove(0), level + 1);
    }

    let mut out = Vec::new();
    let mut operators = operators.into_iter();
    for (i, piece) in pieces.into_iter().enumerate() {
        let grouped = group(piece, level + 1);
        if i == 0 || is_atom(&grouped) {
            out.extend(grouped);
        } else {
            let span = grouped[0].span;
            out.push(Node::with_children(NodeType::Compound, grouped, span));
        }
        if let Some(op) = operators.next() {
            out.push(op);
        }
    }
    out
}

/// Unary operators followed by one operand.
fn is_atom(items: &[Node]) -> bool {
    match items.split_last() {
        Some((last, prefix)) => {
            !last.is_operation()
                && prefix
                    .iter()
                    .all(|n| n.op.is_some_and(is_unary) && n.is_operation())
        }
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::lexer::Lexer;
    use crate::frontend::parser::Parser;
    use std::collections::BTreeMap;

    fn transform(source: &str) -> Node {
        let tokens = Lexer::new(source).tokenize().unwrap();
        let mut root = Parser::new(tokens).parse(&BTreeMap::new()).unwrap().root;
        let mut labels = 0;
        root.children = transform_block(std::mem::take(&mut root.children), &mut labels).unwrap();
        root
    }

    /// Compact rendering: compounds in parentheses, operators by symbol.
    fn render(items: &[Node]) -> String {
        items
            .iter()
            .map(|n| match n.kind {
                NodeType::Compound => format!("({})", render(&n.children)),
                NodeType::Operation => match n.op {
                    Some(ScriptOp::Add) => "+".to_string(),
                    Some(ScriptOp::Substract) => "-".to_string(),
                    Some(ScriptOp::Multiply) => "*".to_string(),
                    Some(ScriptOp::Divide) => "/".to_string(),
                    Some(ScriptOp::Not) => "!".to_string(),
                    Some(op) => op.name().to_string(),
                    None => "?".to_string(),
                },
                _ => n.identifier.clone(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn sequence(source: &str) -> String {
        render(&transform(source).children[0].children)
    }

    #[test]
    fn test_precedence_wraps_tighter_runs() {
        assert_eq!(sequence("a = 1 + 2 * 3;"), "1 + (2 * 3)");
        assert_eq!(sequence("a = 2 * 3 + 1;"), "2 * 3 + 1");
        assert_eq!(sequence("a = x + y * z - w / 2;"), "x + (y * z) - (w / 2)");
        assert_eq!(sequence("a = b < c + 1 & d;"), "b smaller (c + 1) and d");
    }

    #[test]
    fn test_unary_operands_stay_inline() {
        assert_eq!(sequence("a = b * -c;"), "b * - c");
        assert_eq!(sequence("a = -2 * b;"), "-2 * b");
        assert_eq!(sequence("a = !b;"), "! b");
    }

    #[test]
    fn test_juxtaposition_builds_components() {
        assert_eq!(sequence("a = 1 2 * 3;"), "1 (2 * 3)");
        assert_eq!(sequence("a = (1 2 3) * 2;"), "(1 2 3) * 2");
    }

    #[test]
    fn test_single_element_compounds_unwrap() {
        assert_eq!(sequence("a = ((b));"), "b");
        assert_eq!(sequence("a = (b + c);"), "b + c");
        let root = transform("a = max((b), (c * 2));");
        let call = &root.children[0].children[0];
        assert_eq!(call.children[0].kind, NodeType::Parameter);
        assert_eq!(call.children[1].kind, NodeType::Compound);
    }

    #[test]
    fn test_while_lowering() {
        let root = transform("while (i < 3) i = i + 1;");
        assert_eq!(root.children.len(), 2);
        assert_eq!(root.children[0].kind, NodeType::Label);
        let branch = &root.children[1];
        assert_eq!(branch.kind, NodeType::IfThenElse);
        let body = &branch.children[1].children;
        assert_eq!(body.last().unwrap().kind, NodeType::JumpTo);
        assert_eq!(body.last().unwrap().identifier, root.children[0].identifier);
    }

    #[test]
    fn test_for_lowering() {
        let root = transform("for (i = 0; i < 3; i = i + 1) a = a + i;");
        let kinds: Vec<NodeType> = root.children.iter().map(|n| n.kind).collect();
        assert_eq!(
            kinds,
            vec![NodeType::Assignment, NodeType::Label, NodeType::IfThenElse]
        );
        let body = &root.children[2].children[1].children;
        assert_eq!(body.len(), 3);
        assert_eq!(body[1].identifier, "i");
    }

    #[test]
    fn test_root_pop_becomes_assignment() {
        let root = transform("push(1); pop(b);");
        let assign = &root.children[1];
        assert_eq!(assign.kind, NodeType::Assignment);
        assert_eq!(assign.identifier, "b");
        assert!(assign.children[0].is_pop());
    }

    #[test]
    fn test_missing_operand_is_an_error() {
        let tokens = Lexer::new("a = 1 +;").tokenize().unwrap();
        let root = Parser::new(tokens).parse(&BTreeMap::new()).unwrap().root;
        let mut labels = 0;
        assert!(transform_block(root.children, &mut labels).is_err());

        let tokens = Lexer::new("a = * 2;").tokenize().unwrap();
        let root = Parser::new(tokens).parse(&BTreeMap::new()).unwrap().root;
        assert!(transform_block(root.children, &mut labels).is_err());
    }
}
