use tracing::debug;

use crate::builtins::{FunctionRef, Procedure};
use crate::compiler::{CompilationData, CompileError, CompilerStage};
use crate::lang::node::{Node, NodeType};

/// Makes every function argument list flat.
///
/// A non-leaf argument is evaluated by a `push` placed before its statement
/// and replaced by a `pop`. Arguments are hoisted last to first so the first
/// argument ends up on top of the stack, which is the order in which the
/// interpreter pops them. The hoists of a condition go into its
/// `depends_on` so loops re-evaluate them on every iteration.
pub struct Flatten;

impl CompilerStage for Flatten {
    fn name(&self) -> &'static str {
        "flatten"
    }

    fn execute(&self, data: &mut CompilationData<'_>) -> Result<(), CompileError> {
        let statements = std::mem::take(&mut data.root.children);
        let mut hoisted = 0;
        data.root.children = flatten_block(statements, &mut hoisted)?;

        verify(&data.root)?;
        debug!(hoisted, "flattened");
        Ok(())
    }
}

fn flatten_block(statements: Vec<Node>, hoisted: &mut usize) -> Result<Vec<Node>, CompileError> {
    let mut out = Vec::with_capacity(statements.len());
    for mut statement in statements {
        match statement.kind {
            NodeType::IfThenElse => {
                let mut children = Vec::with_capacity(statement.children.len());
                for mut child in std::mem::take(&mut statement.children) {
                    if child.kind == NodeType::Condition {
                        let hoists = hoist_statement(&mut child)?;
                        *hoisted += hoists.len();
                        child.depends_on.extend(hoists);
                    } else {
                        child.children = flatten_block(std::mem::take(&mut child.children), hoisted)?;
                    }
                    children.push(child);
                }
                statement.children = children;
                out.push(statement);
            }
            _ => {
                let hoists = hoist_statement(&mut statement)?;
                *hoisted += hoists.len();
                out.extend(hoists);
                out.push(statement);
            }
        }
    }
    Ok(out)
}

/// Hoists what the statement needs and returns the pushes to run before it.
fn hoist_statement(statement: &mut Node) -> Result<Vec<Node>, CompileError> {
    let had_pop = contains_pop(statement);
    let mut hoists = Vec::new();

    match statement.kind {
        NodeType::Assignment | NodeType::Condition => {
            for item in &mut statement.children {
                hoist_operand(item, &mut hoists);
            }
        }
        NodeType::Function => match statement.function {
            // arguments read as single operand bytes
            Some(FunctionRef::Procedure(Procedure::Seed | Procedure::Debug))
            | Some(FunctionRef::External { .. }) => hoist_arguments(statement, &mut hoists),
            _ => {
                for child in &mut statement.children {
                    hoist_operand(child, &mut hoists);
                }
            }
        },
        _ => {}
    }

    if !hoists.is_empty() && had_pop {
        return Err(CompileError::not_flat(
            "a statement that reads the stack cannot also use nested function arguments",
            statement,
        ));
    }
    Ok(hoists)
}

/// Flattens the calls inside an operand.
fn hoist_operand(node: &mut Node, hoists: &mut Vec<Node>) {
    match node.kind {
        NodeType::Compound => {
            for child in &mut node.children {
                hoist_operand(child, hoists);
            }
        }
        NodeType::Function if !node.is_pop() => hoist_arguments(node, hoists),
        NodeType::Index => hoist_arguments(node, hoists),
        _ => {}
    }
}

/// Replaces every non-leaf argument of `node` by a pop, last argument first.
fn hoist_arguments(node: &mut Node, hoists: &mut Vec<Node>) {
    for child in node.children.iter_mut().rev() {
        if child.is_leaf() {
            continue;
        }
        hoist_operand(child, hoists);

        let mut pop = Node::pop(child.span);
        pop.vector_size = child.vector_size;
        let argument = std::mem::replace(child, pop);

        let mut push = Node::procedure(Procedure::Push, Vec::new(), argument.span);
        push.vector_size = argument.vector_size;
        push.children.push(argument);
        hoists.push(push);
    }
}

fn contains_pop(node: &Node) -> bool {
    let mut found = false;
    node.visit(&mut |n| found |= n.is_pop());
    found
}

/// Every call must read its arguments as single operand bytes.
fn verify(root: &Node) -> Result<(), CompileError> {
    let mut offending = None;
    root.visit(&mut |node| {
        let is_call = match node.kind {
            NodeType::Function => matches!(
                node.function,
                Some(FunctionRef::Builtin(_) | FunctionRef::External { .. })
                    | Some(FunctionRef::Procedure(Procedure::Seed | Procedure::Debug))
            ),
            NodeType::Index => true,
            _ => false,
        };
        if offending.is_none() && is_call && !node.children.iter().all(Node::is_leaf) {
            offending = Some(node.describe());
        }
    });
    match offending {
        Some(node) => Err(CompileError::FlattenFailure {
            message: "function parameters are not flat".to_string(),
            node: Some(node),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::analysis::Analysis;
    use crate::compiler::parameters::ParameterAnalysis;
    use crate::compiler::transform::Transform;
    use crate::compiler::{CompilerOptions, Parse, Tokenize};
    use crate::engine::Engine;

    fn flatten<'e>(engine: &'e Engine, source: &str) -> Result<CompilationData<'e>, CompileError> {
        let mut data = CompilationData::new(engine, source, CompilerOptions::default().with_optimize(false));
        Tokenize.execute(&mut data)?;
        Parse.execute(&mut data)?;
        Transform.execute(&mut data)?;
        ParameterAnalysis.execute(&mut data)?;
        Analysis.execute(&mut data)?;
        Flatten.execute(&mut data)?;
        Ok(data)
    }

    #[test]
    fn test_flat_calls_are_untouched() {
        let engine = Engine::new();
        let data = flatten(&engine, "a = max(b, 2) + 1;").unwrap();
        assert_eq!(data.root.children.len(), 1);
    }

    #[test]
    fn test_nested_arguments_are_hoisted_in_reverse() {
        let engine = Engine::new();
        let data = flatten(&engine, "a = max(b + 1, sqrt(b), 2);").unwrap();
        let statements = &data.root.children;
        assert_eq!(statements.len(), 3);

        // last non-leaf argument first, so `b + 1` is on top
        assert!(statements[0].is_procedure(Procedure::Push));
        assert_eq!(statements[0].children[0].kind, NodeType::Function);
        assert!(statements[1].is_procedure(Procedure::Push));
        assert_eq!(statements[1].children[0].kind, NodeType::Compound);

        let call = &statements[2].children[0];
        assert!(call.children[0].is_pop());
        assert!(call.children[1].is_pop());
        assert_eq!(call.children[2].kind, NodeType::Parameter);
    }

    #[test]
    fn test_inner_hoists_come_first() {
        let engine = Engine::new();
        let data = flatten(&engine, "a = sqrt(abs(b * 2));").unwrap();
        let statements = &data.root.children;
        assert_eq!(statements.len(), 3);
        assert_eq!(statements[0].children[0].kind, NodeType::Compound);
        assert_eq!(statements[1].children[0].identifier, "abs");
        assert!(statements[1].children[0].children[0].is_pop());
    }

    #[test]
    fn test_condition_hoists_go_to_depends_on() {
        let engine = Engine::new();
        let data = flatten(&engine, "i = 0; while (abs(i - 4) > 0) i = i + 1;").unwrap();
        let branch = &data.root.children[2];
        assert_eq!(branch.kind, NodeType::IfThenElse);
        assert_eq!(branch.children[0].depends_on.len(), 1);
    }

    #[test]
    fn test_pop_and_hoist_conflict() {
        let engine = Engine::new();
        let err = flatten(&engine, "push(1); a = pop + abs(b + 1);").unwrap_err();
        assert!(matches!(err, CompileError::FlattenFailure { .. }));
    }
}
