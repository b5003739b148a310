//! Tree-level constant folding, vector size inference and variable cleanup.

use tracing::{debug, trace};

use crate::builtins::{FunctionRef, Procedure};
use crate::bytecode::op::ScriptOp;
use crate::compiler::parameters::resolve_literal;
use crate::compiler::{CompilationData, CompileError, CompilerStage};
use crate::lang::node::{Node, NodeType};
use crate::lang::value::{MAX_VECTOR_SIZE, Value, broadcast_size};
use crate::runtime::compound::{apply_operator, apply_unary};

pub struct Analysis;

impl CompilerStage for Analysis {
    fn name(&self) -> &'static str {
        "analysis"
    }

    fn execute(&self, data: &mut CompilationData<'_>) -> Result<(), CompileError> {
        let span = data.root.span;
        let mut root = std::mem::replace(&mut data.root, Node::new(NodeType::Root, span));

        if data.options.optimize {
            for statement in &mut root.children {
                fold_statement(data, statement);
            }
        }

        let mut sizes = SizeInference {
            data: &mut *data,
            stack: Vec::new(),
        };
        let result = root
            .children
            .iter_mut()
            .try_for_each(|statement| sizes.statement(statement));
        if result.is_ok() {
            cleanup(data, &mut root);
        }
        data.root = root;
        result?;

        debug!(
            variables = data.variables.len(),
            slots = data.data_slot_count(),
            "analyzed"
        );
        Ok(())
    }
}

// =============================================================================
// Constant folding
// =============================================================================

fn fold_statement(data: &mut CompilationData<'_>, node: &mut Node) {
    match node.kind {
        NodeType::Assignment | NodeType::Condition => fold_sequence(data, &mut node.children),
        NodeType::IfThenElse | NodeType::IfThen | NodeType::IfElse => {
            for child in &mut node.children {
                fold_statement(data, child);
            }
        }
        NodeType::Function => {
            for child in &mut node.children {
                fold_operand(data, child);
            }
        }
        _ => {}
    }
}

fn fold_operand(data: &mut CompilationData<'_>, node: &mut Node) {
    match node.kind {
        NodeType::Compound => {
            fold_sequence(data, &mut node.children);
            if node.children.len() == 1 && node.children[0].is_literal() {
                *node = node.children.remove(0);
            }
        }
        NodeType::Function | NodeType::Index => {
            for child in &mut node.children {
                fold_operand(data, child);
            }
        }
        _ => {}
    }
}

/// Replaces a sequence of scalar literals and operators by its value.
fn fold_sequence(data: &mut CompilationData<'_>, items: &mut Vec<Node>) {
    for item in items.iter_mut() {
        fold_operand(data, item);
    }
    if items.len() < 2 {
        return;
    }
    let Some(value) = evaluate_literals(items) else {
        return;
    };

    for item in items.iter() {
        if let Some(id) = item.variable {
            let variable = &mut data.variables[id];
            variable.reference_count = variable.reference_count.saturating_sub(1);
        }
    }
    let mut literal = Node::literal(value, items[0].span);
    resolve_literal(data, &mut literal);
    trace!(value, "folded constant sequence");
    *items = vec![literal];
}

/// Evaluates the sequence like the interpreter would; `None` unless it only
/// holds literals and operators with an operator between every two literals.
fn evaluate_literals(items: &[Node]) -> Option<f32> {
    let mut acc: Option<Value> = None;
    let mut pending: Option<ScriptOp> = None;
    let (mut negate, mut not) = (false, false);

    for item in items {
        if item.is_operation() {
            let op = item.op?;
            if acc.is_none() || pending.is_some() {
                match op {
                    ScriptOp::Substract => negate = !negate,
                    ScriptOp::Not => not = !not,
                    ScriptOp::Add => {}
                    _ => return None,
                }
            } else {
                pending = Some(op);
            }
            continue;
        }

        if !item.is_literal() {
            return None;
        }
        let value = apply_unary(Value::scalar(item.value?), negate, not);
        negate = false;
        not = false;
        acc = Some(match (acc, pending.take()) {
            (None, _) => value,
            (Some(a), Some(op)) => apply_operator(op, &a, &value)?,
            (Some(_), None) => return None,
        });
    }

    if pending.is_some() || negate || not {
        return None;
    }
    acc.map(|v| v.x())
}

// =============================================================================
// Vector sizes
// =============================================================================

/// Infers the size of every operand the way the interpreter computes it,
/// tracking push and pop on a compile-time stack in tree order.
struct SizeInference<'a, 'e> {
    data: &'a mut CompilationData<'e>,
    stack: Vec<u8>,
}

impl SizeInference<'_, '_> {
    fn statement(&mut self, node: &mut Node) -> Result<(), CompileError> {
        match node.kind {
            NodeType::Assignment => {
                let size = self.sequence(&mut node.children)?;
                let Some(id) = node.variable else {
                    return Err(CompileError::semantic("unresolved assignment", node));
                };
                let variable = &mut self.data.variables[id];
                if variable.vector_size == 0 {
                    variable.vector_size = size;
                    self.data.invalidate_offsets();
                } else if variable.vector_size != size {
                    return Err(CompileError::size_mismatch(
                        format!(
                            "'{}' has size {}, assigned size {}",
                            variable.name, variable.vector_size, size
                        ),
                        node,
                    ));
                }
                node.vector_size = size;
                Ok(())
            }
            NodeType::Condition => {
                node.vector_size = self.sequence(&mut node.children)?;
                Ok(())
            }
            NodeType::IfThenElse | NodeType::IfThen | NodeType::IfElse => node
                .children
                .iter_mut()
                .try_for_each(|child| self.statement(child)),
            NodeType::Function => self.root_call(node),
            _ => Ok(()),
        }
    }

    fn root_call(&mut self, node: &mut Node) -> Result<(), CompileError> {
        match node.function {
            Some(FunctionRef::Procedure(procedure)) => {
                let sizes = self.operands(&mut node.children)?;
                match procedure {
                    Procedure::Push => {
                        let size = sizes.first().copied().unwrap_or(1);
                        node.vector_size = size;
                        self.stack.push(size);
                    }
                    Procedure::Pop => {
                        if self.stack.pop().is_none() {
                            return Err(CompileError::stack_underflow(
                                "pop without a matching push",
                                node,
                            ));
                        }
                    }
                    Procedure::Yield if !self.data.options.support_yield => {
                        return Err(CompileError::unsupported("yield is disabled", node));
                    }
                    _ => {}
                }
                Ok(())
            }
            Some(FunctionRef::External { .. }) => {
                self.operand(node)?;
                Ok(())
            }
            _ => Err(CompileError::unsupported("not a statement", node)),
        }
    }

    fn operands(&mut self, nodes: &mut [Node]) -> Result<Vec<u8>, CompileError> {
        nodes.iter_mut().map(|n| self.operand(n)).collect()
    }

    /// Size of a sequence: binary operators broadcast, juxtaposition grows.
    fn sequence(&mut self, items: &mut [Node]) -> Result<u8, CompileError> {
        let mut acc: Option<u8> = None;
        let mut pending = false;

        for item in items.iter_mut() {
            if item.is_operation() {
                if acc.is_some() && !pending {
                    pending = true;
                }
                continue;
            }

            let size = self.operand(item)?;
            acc = Some(match acc {
                None => size,
                Some(current) if pending => broadcast_size(current, size).ok_or_else(|| {
                    CompileError::size_mismatch(
                        format!("cannot combine sizes {} and {}", current, size),
                        item,
                    )
                })?,
                Some(current) => {
                    let grown = current + size;
                    if grown > MAX_VECTOR_SIZE {
                        return Err(CompileError::size_mismatch(
                            format!("vector grows to {} components", grown),
                            item,
                        ));
                    }
                    grown
                }
            });
            pending = false;
        }
        Ok(acc.unwrap_or(1))
    }

    fn operand(&mut self, node: &mut Node) -> Result<u8, CompileError> {
        let size = match node.kind {
            NodeType::Parameter if node.is_literal() => 1,
            NodeType::Parameter => self.variable_size(node)?,
            NodeType::Compound => self.sequence(&mut node.children)?,
            NodeType::Index => {
                let child_size = self.operands(&mut node.children)?;
                let component = node.component().unwrap_or(0);
                match child_size.as_slice() {
                    [size] if (*size as usize) > component => 1,
                    [size] => {
                        return Err(CompileError::size_mismatch(
                            format!("component {} of a size {} value", node.identifier, size),
                            node,
                        ));
                    }
                    _ => return Err(CompileError::Internal("malformed index".to_string())),
                }
            }
            NodeType::Function => self.call(node)?,
            _ => return Err(CompileError::unsupported("not a value", node)),
        };
        node.vector_size = size;
        Ok(size)
    }

    fn variable_size(&mut self, node: &Node) -> Result<u8, CompileError> {
        let Some(id) = node.variable else {
            return Err(CompileError::semantic(
                format!("unresolved identifier '{}'", node.identifier),
                node,
            ));
        };
        if self.data.variables[id].vector_size == 0 {
            self.data.warn(
                format!("'{}' is read before it is assigned", node.identifier),
                Some(node),
            );
            self.data.variables[id].vector_size = 1;
            self.data.invalidate_offsets();
        }
        Ok(self.data.variables[id].vector_size)
    }

    fn call(&mut self, node: &mut Node) -> Result<u8, CompileError> {
        match node.function {
            Some(FunctionRef::Procedure(Procedure::Pop)) => {
                self.stack.pop().ok_or_else(|| {
                    CompileError::stack_underflow("pop without a matching push", node)
                })
            }
            Some(FunctionRef::Builtin(_)) => {
                let sizes = self.operands(&mut node.children)?;
                let Some(info) = node.builtin() else {
                    return Err(CompileError::Internal("unknown built-in".to_string()));
                };
                let mismatch = || {
                    CompileError::size_mismatch(
                        format!("parameter sizes {:?} do not match", sizes),
                        node,
                    )
                };
                let width = info.operand_width(&sizes).ok_or_else(mismatch)?;
                let size = info.return_size(&sizes).ok_or_else(mismatch)?;
                if !info.support.supports(width) {
                    self.data.warn(
                        format!("'{}' is not implemented for size {}", info.name, width),
                        Some(node),
                    );
                }
                Ok(size)
            }
            Some(FunctionRef::External { arity, .. }) => {
                let sizes = self.operands(&mut node.children)?;
                if sizes.len() != arity as usize {
                    return Err(CompileError::semantic(
                        format!("'{}' takes {} parameters", node.identifier, arity),
                        node,
                    ));
                }
                if sizes.iter().any(|s| *s != 1) {
                    return Err(CompileError::size_mismatch(
                        format!("'{}' takes scalar parameters", node.identifier),
                        node,
                    ));
                }
                Ok(1)
            }
            _ => Err(CompileError::unsupported("not a value", node)),
        }
    }
}

// =============================================================================
// Cleanup
// =============================================================================

/// Drops unreferenced variables and renumbers the rest densely.
fn cleanup(data: &mut CompilationData<'_>, root: &mut Node) {
    let mut remap = vec![None; data.variables.len()];
    let mut kept = Vec::with_capacity(data.variables.len());

    for (old, mut variable) in std::mem::take(&mut data.variables).into_iter().enumerate() {
        if variable.reference_count == 0 && !variable.is_input && !variable.is_output {
            trace!(name = %variable.name, "dropping unreferenced variable");
            continue;
        }
        if variable.vector_size == 0 {
            variable.vector_size = 1;
        }
        variable.id = kept.len();
        remap[old] = Some(variable.id);
        kept.push(variable);
    }

    data.variables = kept;
    data.invalidate_offsets();
    root.visit_mut(&mut |node| {
        node.variable = node.variable.and_then(|id| remap.get(id).copied().flatten());
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{CompilerOptions, Parse, Tokenize, parameters::ParameterAnalysis};
    use crate::compiler::transform::Transform;
    use crate::engine::{Engine, NativeFunction};

    fn analyze<'e>(
        engine: &'e Engine,
        source: &str,
        options: CompilerOptions,
    ) -> Result<CompilationData<'e>, CompileError> {
        let mut data = CompilationData::new(engine, source, options);
        Tokenize.execute(&mut data)?;
        Parse.execute(&mut data)?;
        Transform.execute(&mut data)?;
        ParameterAnalysis.execute(&mut data)?;
        Analysis.execute(&mut data)?;
        Ok(data)
    }

    fn size_of(data: &CompilationData<'_>, name: &str) -> u8 {
        data.variables[data.variable_id(name).unwrap()].vector_size
    }

    #[test]
    fn test_constant_folding() {
        let engine = Engine::new();
        let data = analyze(&engine, "a = 1 + 2 * 3;", CompilerOptions::default()).unwrap();
        let items = &data.root.children[0].children;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].value, Some(7.0));
        assert!(items[0].constant.is_some());

        let data = analyze(
            &engine,
            "a = 1 + 2 * 3;",
            CompilerOptions::default().with_optimize(false),
        )
        .unwrap();
        assert_eq!(data.root.children[0].children.len(), 3);
    }

    #[test]
    fn test_folding_releases_data_constants() {
        let engine = Engine::new();
        let data = analyze(&engine, "a = 21.5 * 2;", CompilerOptions::default()).unwrap();
        // 43 is a new data constant, 21.5 is gone
        assert_eq!(data.variables.len(), 2);
        assert!(data.variables.iter().all(|v| v.reference_count > 0));
        assert!(data.variables[1].is_constant);
        assert_eq!(data.variables[1].value, Some(Value::scalar(43.0)));
    }

    #[test]
    fn test_vector_growth_and_broadcast() {
        let engine = Engine::new();
        let data = analyze(&engine, "a = 1 2 3; b = a * 2; c = a.y 4;", CompilerOptions::default())
            .unwrap();
        assert_eq!(size_of(&data, "a"), 3);
        assert_eq!(size_of(&data, "b"), 3);
        assert_eq!(size_of(&data, "c"), 2);

        let err = analyze(&engine, "a = 1 2 3; b = a a;", CompilerOptions::default()).unwrap_err();
        assert!(matches!(err, CompileError::VectorSizeMismatch { .. }));

        let err = analyze(&engine, "a = 1 2; b = 1 2 3; c = a + b;", CompilerOptions::default())
            .unwrap_err();
        assert!(matches!(err, CompileError::VectorSizeMismatch { .. }));
    }

    #[test]
    fn test_reassignment_must_keep_size() {
        let engine = Engine::new();
        let err = analyze(&engine, "a = 1; a = 1 2;", CompilerOptions::default()).unwrap_err();
        assert!(matches!(err, CompileError::VectorSizeMismatch { .. }));
    }

    #[test]
    fn test_function_return_sizes() {
        let engine = Engine::new();
        let data = analyze(
            &engine,
            "v = 1 2 3; d = dot(v, v); m = max(v, 1); s = any(v);",
            CompilerOptions::default(),
        )
        .unwrap();
        assert_eq!(size_of(&data, "d"), 1);
        assert_eq!(size_of(&data, "m"), 3);
        assert_eq!(size_of(&data, "s"), 1);
    }

    #[test]
    fn test_support_matrix_warns() {
        let engine = Engine::new();
        let data = analyze(&engine, "v = 1 2; r = sqrt(v);", CompilerOptions::default()).unwrap();
        assert_eq!(data.diagnostics.len(), 1);
        assert!(data.diagnostics[0].message.contains("sqrt"));
    }

    #[test]
    fn test_compile_time_stack() {
        let engine = Engine::new();
        let data = analyze(&engine, "push(1 2); a = pop;", CompilerOptions::default()).unwrap();
        assert_eq!(size_of(&data, "a"), 2);

        let err = analyze(&engine, "a = pop;", CompilerOptions::default()).unwrap_err();
        assert!(matches!(err, CompileError::StackUnderflow { .. }));
    }

    #[test]
    fn test_external_arguments() {
        let engine = Engine::new();
        engine
            .register_function("double", NativeFunction::unary(|x| x * 2.0))
            .unwrap();
        assert!(analyze(&engine, "a = double(21);", CompilerOptions::default()).is_ok());
        let err = analyze(&engine, "a = double(1 2);", CompilerOptions::default()).unwrap_err();
        assert!(matches!(err, CompileError::VectorSizeMismatch { .. }));
    }

    #[test]
    fn test_yield_support() {
        let engine = Engine::new();
        let mut options = CompilerOptions::default();
        options.support_yield = false;
        let err = analyze(&engine, "yield 2;", options).unwrap_err();
        assert!(matches!(err, CompileError::UnsupportedOperation { .. }));
    }

    #[test]
    fn test_read_before_assign_warns() {
        let engine = Engine::new();
        let data = analyze(&engine, "a = b + 1;", CompilerOptions::default()).unwrap();
        assert_eq!(size_of(&data, "b"), 1);
        assert!(data.diagnostics[0].message.contains("before"));
    }

    #[test]
    fn test_cleanup_renumbers() {
        let engine = Engine::new();
        let data = analyze(&engine, "a = 2.5 + 2.5; b = a;", CompilerOptions::default()).unwrap();
        let names: Vec<&str> = data.variables.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(data.root.children[1].variable, Some(1));
        assert_eq!(data.root.children[1].children[0].variable, Some(0));
    }
}
