use tracing::{debug, trace};

use crate::builtins::{self, FunctionRef, Procedure};
use crate::bytecode::op::constant_by_value;
use crate::compiler::{CompilationData, CompileError, CompilerStage};
use crate::frontend::parser::Directive;
use crate::lang::node::{Node, NodeType};
use crate::lang::value::Value;
use crate::lang::variable::{DataType, Variable};

/// Applies directives and resolves every identifier, literal and function
/// of the tree.
pub struct ParameterAnalysis;

impl CompilerStage for ParameterAnalysis {
    fn name(&self) -> &'static str {
        "parameters"
    }

    fn execute(&self, data: &mut CompilationData<'_>) -> Result<(), CompileError> {
        apply_directives(data)?;

        let span = data.root.span;
        let mut root = std::mem::replace(&mut data.root, Node::new(NodeType::Root, span));
        let result = root
            .children
            .iter_mut()
            .try_for_each(|statement| resolve_statement(data, statement));
        data.root = root;
        result?;

        debug!(variables = data.variables.len(), "parameters resolved");
        Ok(())
    }
}

fn apply_directives(data: &mut CompilationData<'_>) -> Result<(), CompileError> {
    for directive in data.directives.clone() {
        match directive {
            Directive::Input {
                name,
                data_type,
                vector_size,
                defaults,
                ..
            } => {
                let id = data.resolve_variable(&name);
                let variable = &mut data.variables[id];
                variable.is_input = true;
                variable.data_type = data_type;
                variable.vector_size = match data_type {
                    DataType::Id => 1,
                    DataType::Numeric => vector_size,
                };
                if !defaults.is_empty() {
                    variable.value = Some(Value::from_slice(&defaults));
                }
            }
            Directive::Output {
                name, vector_size, ..
            } => {
                let id = data.resolve_variable(&name);
                let variable = &mut data.variables[id];
                variable.is_output = true;
                if let Some(size) = vector_size {
                    if variable.vector_size != 0 && variable.vector_size != size {
                        return Err(CompileError::VectorSizeMismatch {
                            message: format!(
                                "'{}' is declared with size {} and {}",
                                name, variable.vector_size, size
                            ),
                            node: None,
                        });
                    }
                    variable.vector_size = size;
                }
            }
            // applied by the parser
            Directive::Define { .. } => {}
        }
    }
    data.invalidate_offsets();
    Ok(())
}

fn resolve_statement(data: &mut CompilationData<'_>, node: &mut Node) -> Result<(), CompileError> {
    match node.kind {
        NodeType::Assignment => {
            let id = data.resolve_variable(&node.identifier);
            data.variables[id].reference_count += 1;
            node.variable = Some(id);
            resolve_sequence(data, &mut node.children)
        }
        NodeType::Condition => resolve_sequence(data, &mut node.children),
        NodeType::IfThenElse | NodeType::IfThen | NodeType::IfElse => node
            .children
            .iter_mut()
            .try_for_each(|child| resolve_statement(data, child)),
        NodeType::Function => {
            resolve_function(data, node, true)?;
            resolve_sequence(data, &mut node.children)
        }
        NodeType::Label | NodeType::JumpTo => Ok(()),
        _ => Err(CompileError::unsupported("not a statement", node)),
    }
}

fn resolve_sequence(data: &mut CompilationData<'_>, items: &mut [Node]) -> Result<(), CompileError> {
    items.iter_mut().try_for_each(|item| resolve_operand(data, item))
}

fn resolve_operand(data: &mut CompilationData<'_>, node: &mut Node) -> Result<(), CompileError> {
    match node.kind {
        NodeType::Operation => Ok(()),
        NodeType::Parameter if node.is_literal() => {
            resolve_literal(data, node);
            Ok(())
        }
        NodeType::Parameter => {
            let id = data.resolve_variable(&node.identifier);
            data.variables[id].reference_count += 1;
            node.variable = Some(id);
            Ok(())
        }
        NodeType::Function => {
            resolve_function(data, node, false)?;
            resolve_sequence(data, &mut node.children)
        }
        NodeType::Compound | NodeType::Index => resolve_sequence(data, &mut node.children),
        _ => Err(CompileError::unsupported("not a value", node)),
    }
}

/// Maps a literal onto the engine constant table, or onto a data constant.
///
/// Literals that already carry a constant byte are left alone.
pub fn resolve_literal(data: &mut CompilationData<'_>, node: &mut Node) {
    node.vector_size = 1;
    if node.constant.is_some() {
        return;
    }
    let Some(value) = node.value else {
        return;
    };
    if let Some(byte) = constant_by_value(value, data.options.constant_epsilon) {
        node.constant = Some(byte);
        return;
    }
    node.variable = Some(data_constant(data, Value::scalar(value)));
}

/// Id of the data constant holding `value`, shared between equal literals.
fn data_constant(data: &mut CompilationData<'_>, value: Value) -> usize {
    let existing = data.variables.iter().position(|v| {
        v.is_constant
            && v.value.is_some_and(|c| {
                c.size == value.size
                    && c.components()
                        .iter()
                        .zip(value.components())
                        .all(|(a, b)| a.to_bits() == b.to_bits())
            })
    });
    let id = match existing {
        Some(id) => id,
        None => {
            let id = data.variables.len();
            trace!(id, %value, "data constant");
            data.variables.push(Variable::constant(id, value));
            data.invalidate_offsets();
            id
        }
    };
    data.variables[id].reference_count += 1;
    id
}

/// Resolves a call: built-in first, then engine externals, then procedures.
fn resolve_function(
    data: &mut CompilationData<'_>,
    node: &mut Node,
    at_root: bool,
) -> Result<(), CompileError> {
    if node.function.is_none() {
        node.function = if let Some(index) = builtins::lookup(&node.identifier) {
            Some(FunctionRef::Builtin(index))
        } else if let Some(external) = data.engine.function_by_name(&node.identifier) {
            Some(FunctionRef::External {
                id: external.id,
                arity: external.function.arity(),
            })
        } else {
            Procedure::from_name(&node.identifier).map(FunctionRef::Procedure)
        };
    }

    let (min, max) = match node.function {
        Some(FunctionRef::Builtin(index)) => match builtins::info(index) {
            Some(info) => (info.min_params, info.max_params),
            None => return Err(CompileError::Internal(format!("no built-in #{}", index))),
        },
        Some(FunctionRef::External { arity, .. }) => (arity as usize, arity as usize),
        Some(FunctionRef::Procedure(procedure)) => {
            if !at_root && procedure != Procedure::Pop {
                return Err(CompileError::unsupported(
                    format!("'{}' cannot be used as a value", procedure.name()),
                    node,
                ));
            }
            if !at_root && !node.children.is_empty() {
                return Err(CompileError::unsupported("pop takes no parameters here", node));
            }
            procedure.params()
        }
        None => {
            return Err(CompileError::semantic(
                format!("unknown function '{}'", node.identifier),
                node,
            ));
        }
    };

    let count = node.children.len();
    if count < min || count > max {
        let expected = if min == max {
            format!("{}", min)
        } else {
            format!("{} to {}", min, max)
        };
        return Err(CompileError::semantic(
            format!(
                "'{}' takes {} parameters, found {}",
                node.identifier, expected, count
            ),
            node,
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{CompilerOptions, Parse, Tokenize, transform::Transform};
    use crate::engine::{Engine, NativeFunction};

    fn resolve<'e>(engine: &'e Engine, source: &str) -> Result<CompilationData<'e>, CompileError> {
        let mut data = CompilationData::new(engine, source, CompilerOptions::default());
        Tokenize.execute(&mut data)?;
        Parse.execute(&mut data)?;
        Transform.execute(&mut data)?;
        ParameterAnalysis.execute(&mut data)?;
        Ok(data)
    }

    #[test]
    fn test_variables_are_case_insensitive() {
        let engine = Engine::new();
        let data = resolve(&engine, "Speed = 1; speed = SPEED + 2;").unwrap();
        assert_eq!(data.variables.len(), 1);
        assert_eq!(data.variables[0].reference_count, 3);
    }

    #[test]
    fn test_literals_map_to_constants_or_data() {
        let engine = Engine::new();
        let data = resolve(&engine, "a = 2 + 21.5 + 21.5;").unwrap();
        let items = &data.root.children[0].children;
        assert!(items[0].constant.is_some());
        assert_eq!(items[2].constant, None);
        assert_eq!(items[2].variable, items[4].variable);

        let constant = &data.variables[items[2].variable.unwrap()];
        assert!(constant.is_constant);
        assert_eq!(constant.reference_count, 2);
        assert_eq!(constant.value, Some(Value::scalar(21.5)));
    }

    #[test]
    fn test_directives() {
        let engine = Engine::new();
        let data = resolve(&engine, "#input p 3 1 2 3\n#input target id\n#output r\nr = p;").unwrap();
        let p = &data.variables[data.variable_id("p").unwrap()];
        assert!(p.is_input);
        assert_eq!(p.vector_size, 3);
        assert_eq!(p.value, Some(Value::from_slice(&[1.0, 2.0, 3.0])));
        let target = &data.variables[data.variable_id("target").unwrap()];
        assert_eq!(target.data_type, DataType::Id);
        assert!(data.variables[data.variable_id("r").unwrap()].is_output);
    }

    #[test]
    fn test_function_resolution_order() {
        let engine = Engine::new();
        engine
            .register_function("max", NativeFunction::binary(|a, b| a + b))
            .unwrap();
        engine
            .register_function("double", NativeFunction::unary(|a| a * 2.0))
            .unwrap();
        let data = resolve(&engine, "a = max(1, 2) + double(3);").unwrap();
        let items = &data.root.children[0].children;
        assert!(matches!(items[0].function, Some(FunctionRef::Builtin(_))));
        assert!(matches!(
            items[2].function,
            Some(FunctionRef::External { arity: 1, .. })
        ));
    }

    #[test]
    fn test_resolution_errors() {
        let engine = Engine::new();
        let err = resolve(&engine, "a = foo(1);").unwrap_err();
        assert!(matches!(err, CompileError::SemanticResolution { .. }));

        let err = resolve(&engine, "a = sqrt(1, 2);").unwrap_err();
        assert!(err.to_string().contains("takes 1 parameters, found 2"));

        let err = resolve(&engine, "a = push(1);").unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedOperation { .. }));
    }
}
