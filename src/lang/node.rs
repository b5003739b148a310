use crate::builtins::{self, FunctionRef, Procedure};
use crate::bytecode::op::ScriptOp;
use crate::frontend::lexer::Span;

/// Node kinds of the script syntax tree.
///
/// The parser produces the surface kinds; the transform stage rewrites
/// `While` and `For` into `Label`, `IfThenElse` and `JumpTo` so the bytecode
/// compiler only sees conditional primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    // ─────────────────────────────── Structure ─────────────────────────────
    /// Root of a script: its children are the top-level statements.
    Root,

    /// A parenthesized sequence of operands and operations.
    ///
    /// Operands without an operator between them build a vector: `(1 2 3)`.
    Compound,

    /// Placeholder produced by rewrites; never emitted.
    None,

    // ────────────────────────────── Expressions ────────────────────────────
    /// An operator in a sequence: `+ - * / & | ^ ! < > <= >= == !=`.
    Operation,

    /// A leaf value: variable reference or literal.
    Parameter,

    /// A call to a built-in, a procedure or an external function.
    ///
    /// Children are the arguments, one node per argument.
    Function,

    /// Component access `v.x` / `v[1]`; the single child is the indexed operand.
    Index,

    // ────────────────────────────── Statements ─────────────────────────────
    /// `identifier = sequence;` with the sequence as children.
    Assignment,

    /// The condition of an `if`; children form a sequence.
    Condition,

    /// `if` with children `[Condition, IfThen, IfElse?]`.
    IfThenElse,

    /// Statements executed when the condition holds.
    IfThen,

    /// Statements executed when the condition does not hold.
    IfElse,

    /// `while` with children `[Condition, WhileCompound]`.
    While,

    /// Body of a `while`.
    WhileCompound,

    /// `for` with children `[Assignment init, Condition, Assignment step, WhileCompound]`.
    For,

    /// Unconditional jump to the label named by `identifier`.
    JumpTo,

    /// A jump target named by `identifier`.
    Label,
}

/// A node of the syntax tree.
///
/// Nodes own their children; the tree never has cycles. Stages mutate it in
/// place: resolving `variable`, `constant` and `function`, setting
/// `vector_size`, regrouping children and inserting new statements.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeType,
    pub identifier: String,
    /// Operator of an `Operation` node.
    pub op: Option<ScriptOp>,
    /// Resolved variable id.
    pub variable: Option<usize>,
    /// Engine constant byte when a literal maps to the constant table.
    pub constant: Option<u8>,
    /// Numeric value of a literal.
    pub value: Option<f32>,
    pub function: Option<FunctionRef>,
    pub vector_size: u8,
    pub children: Vec<Node>,
    /// Statements that must run right before this node, e.g. hoisted pushes
    /// feeding a loop condition.
    pub depends_on: Vec<Node>,
    pub span: Span,
}

impl Node {
    pub fn new(kind: NodeType, span: Span) -> Self {
        Node {
            kind,
            identifier: String::new(),
            op: None,
            variable: None,
            constant: None,
            value: None,
            function: None,
            vector_size: 0,
            children: Vec::new(),
            depends_on: Vec::new(),
            span,
        }
    }

    pub fn with_identifier(kind: NodeType, identifier: impl Into<String>, span: Span) -> Self {
        let mut node = Node::new(kind, span);
        node.identifier = identifier.into();
        node
    }

    pub fn with_children(kind: NodeType, children: Vec<Node>, span: Span) -> Self {
        let mut node = Node::new(kind, span);
        node.children = children;
        node
    }

    pub fn operation(op: ScriptOp, span: Span) -> Self {
        let mut node = Node::new(NodeType::Operation, span);
        node.op = Some(op);
        node.identifier = op.name().to_string();
        node
    }

    /// A literal leaf holding `value`, not yet resolved to a constant.
    pub fn literal(value: f32, span: Span) -> Self {
        let mut node = Node::with_identifier(NodeType::Parameter, format_literal(value), span);
        node.value = Some(value);
        node.vector_size = 1;
        node
    }

    /// A call to the procedure `procedure` with the given arguments.
    pub fn procedure(procedure: Procedure, children: Vec<Node>, span: Span) -> Self {
        let mut node = Node::with_identifier(NodeType::Function, procedure.name(), span);
        node.function = Some(FunctionRef::Procedure(procedure));
        node.children = children;
        node
    }

    /// A `pop` operand.
    pub fn pop(span: Span) -> Self {
        Node::procedure(Procedure::Pop, Vec::new(), span)
    }

    pub fn is_operation(&self) -> bool {
        self.kind == NodeType::Operation
    }

    pub fn is_operation_of(&self, op: ScriptOp) -> bool {
        self.kind == NodeType::Operation && self.op == Some(op)
    }

    pub fn is_procedure(&self, procedure: Procedure) -> bool {
        self.kind == NodeType::Function
            && matches!(self.function, Some(FunctionRef::Procedure(p)) if p == procedure)
    }

    pub fn is_pop(&self) -> bool {
        self.is_procedure(Procedure::Pop)
            || (self.kind == NodeType::Function
                && self.function.is_none()
                && self.identifier.eq_ignore_ascii_case("pop"))
    }

    /// Literal numbers, before or after constant resolution.
    pub fn is_literal(&self) -> bool {
        self.kind == NodeType::Parameter && self.value.is_some()
    }

    /// A node the interpreter can read as one parameter byte.
    pub fn is_leaf(&self) -> bool {
        (self.kind == NodeType::Parameter && self.children.is_empty()) || self.is_pop()
    }

    /// Any node that yields a value in a sequence.
    pub fn is_operand(&self) -> bool {
        matches!(
            self.kind,
            NodeType::Parameter | NodeType::Function | NodeType::Compound | NodeType::Index
        )
    }

    /// Component selected by an `Index` node.
    pub fn component(&self) -> Option<usize> {
        ["x", "y", "z", "w"]
            .iter()
            .position(|c| self.identifier.eq_ignore_ascii_case(c))
    }

    /// The built-in description when this node calls a built-in function.
    pub fn builtin(&self) -> Option<&'static builtins::FunctionInfo> {
        match self.function {
            Some(FunctionRef::Builtin(index)) => builtins::info(index),
            _ => None,
        }
    }

    /// Short description used in diagnostics.
    pub fn describe(&self) -> String {
        let kind = format!("{:?}", self.kind).to_lowercase();
        if self.identifier.is_empty() {
            format!("{} at {}:{}", kind, self.span.line, self.span.col)
        } else {
            format!(
                "{} '{}' at {}:{}",
                kind, self.identifier, self.span.line, self.span.col
            )
        }
    }

    /// Visits this node and all descendants, `depends_on` included, depth-first.
    pub fn visit(&self, f: &mut impl FnMut(&Node)) {
        f(self);
        for dep in &self.depends_on {
            dep.visit(f);
        }
        for child in &self.children {
            child.visit(f);
        }
    }

    /// Mutable variant of [`Node::visit`].
    pub fn visit_mut(&mut self, f: &mut impl FnMut(&mut Node)) {
        f(self);
        for dep in &mut self.depends_on {
            dep.visit_mut(f);
        }
        for child in &mut self.children {
            child.visit_mut(f);
        }
    }

    /// Indented outline of the tree, used by `--ast`.
    pub fn to_tree_string(&self) -> String {
        let mut out = String::new();
        self.write_tree(&mut out, 0);
        out
    }

    fn write_tree(&self, out: &mut String, depth: usize) {
        use std::fmt::Write;

        let indent = "  ".repeat(depth);
        let _ = write!(out, "{}{:?}", indent, self.kind);
        if !self.identifier.is_empty() {
            let _ = write!(out, " '{}'", self.identifier);
        }
        if self.vector_size > 0 {
            let _ = write!(out, " [{}]", self.vector_size);
        }
        out.push('\n');
        for dep in &self.depends_on {
            let _ = writeln!(out, "{}  <depends>", indent);
            dep.write_tree(out, depth + 2);
        }
        for child in &self.children {
            child.write_tree(out, depth + 1);
        }
    }
}

/// Canonical text of a literal value.
pub fn format_literal(value: f32) -> String {
    format!("{}", value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span() -> Span {
        Span { line: 1, col: 1 }
    }

    #[test]
    fn test_leaf_detection() {
        assert!(Node::literal(2.0, span()).is_leaf());
        assert!(Node::pop(span()).is_leaf());
        let compound = Node::with_children(
            NodeType::Compound,
            vec![Node::literal(1.0, span())],
            span(),
        );
        assert!(!compound.is_leaf());
    }

    #[test]
    fn test_visit_counts_dependencies() {
        let mut cond = Node::new(NodeType::Condition, span());
        cond.depends_on.push(Node::literal(1.0, span()));
        cond.children.push(Node::literal(2.0, span()));
        let mut count = 0;
        cond.visit(&mut |_| count += 1);
        assert_eq!(count, 3);
    }

    #[test]
    fn test_tree_string() {
        let mut root = Node::new(NodeType::Root, span());
        let mut assign = Node::with_identifier(NodeType::Assignment, "a", span());
        assign.children.push(Node::literal(1.0, span()));
        root.children.push(assign);
        let text = root.to_tree_string();
        assert!(text.contains("Assignment 'a'"));
        assert!(text.contains("  Parameter '1'"));
    }
}
