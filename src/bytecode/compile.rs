use rayon::prelude::*;
use tracing::debug;

use crate::builtins::{Emit, FunctionRef, Procedure};
use crate::bytecode::ir::IMByteCodeList;
use crate::bytecode::op::{
    ExtendedOp, MAX_DATA_SLOTS, ScriptOp, constant_byte, identifier, pack_count_size,
};
use crate::compiler::{CompilationData, CompileError, CompilerStage};
use crate::lang::node::{Node, NodeType};

/// Emits intermediate byte code for the flattened tree.
pub struct GenerateBytecode;

impl CompilerStage for GenerateBytecode {
    fn name(&self) -> &'static str {
        "compile"
    }

    fn execute(&self, data: &mut CompilationData<'_>) -> Result<(), CompileError> {
        let slots = data.data_slot_count();
        if slots > MAX_DATA_SLOTS {
            return Err(CompileError::capacity(format!(
                "{} data slots, at most {} are addressable",
                slots, MAX_DATA_SLOTS
            )));
        }
        let offsets = data.variable_offsets().to_vec();
        let statements = &data.root.children;

        let code = if data.options.parallel {
            let segments = segments(statements)
                .into_par_iter()
                .enumerate()
                .map(|(index, group)| {
                    let mut generator = CodeGenerator::new(&offsets, index);
                    for statement in group {
                        generator.statement(statement)?;
                    }
                    Ok(generator.code)
                })
                .collect::<Result<Vec<_>, CompileError>>()?;

            debug!(segments = segments.len(), "compiled in parallel");
            let mut code = IMByteCodeList::new();
            for segment in segments {
                code.append(segment);
            }
            code
        } else {
            let mut generator = CodeGenerator::new(&offsets, 0);
            for statement in statements {
                generator.statement(statement)?;
            }
            generator.code
        };

        debug!(len = code.len(), markers = code.markers.len(), "generated");
        data.code = code;
        Ok(())
    }
}

/// Root statements that compile independently. A label stays with the
/// statement that follows it.
fn segments(statements: &[Node]) -> Vec<&[Node]> {
    let mut groups = Vec::new();
    let mut start = 0;
    for (i, statement) in statements.iter().enumerate() {
        if statement.kind == NodeType::Label {
            continue;
        }
        groups.push(&statements[start..=i]);
        start = i + 1;
    }
    if start < statements.len() {
        groups.push(&statements[start..]);
    }
    groups
}

struct CodeGenerator<'a> {
    offsets: &'a [usize],
    segment: usize,
    branches: usize,
    code: IMByteCodeList,
}

impl<'a> CodeGenerator<'a> {
    fn new(offsets: &'a [usize], segment: usize) -> Self {
        CodeGenerator {
            offsets,
            segment,
            branches: 0,
            code: IMByteCodeList::new(),
        }
    }

    fn label(&self, name: &str) -> String {
        format!("s{}.{}", self.segment, name)
    }

    fn statement(&mut self, node: &Node) -> Result<(), CompileError> {
        match node.kind {
            NodeType::Assignment => {
                let target = self.slot(node)?;
                self.code.push_op(ScriptOp::Assign);
                self.code.push(target);
                self.sequence(&node.children)?;
                self.code.push_op(ScriptOp::Nop);
            }
            NodeType::IfThenElse => self.branch(node)?,
            NodeType::Label => {
                let label = self.label(&node.identifier);
                self.code.place_label(&label);
            }
            NodeType::JumpTo => {
                let label = self.label(&node.identifier);
                self.code.emit_jump(ScriptOp::Jump, &label);
            }
            NodeType::Function => self.root_call(node)?,
            _ => return Err(CompileError::unsupported("cannot compile statement", node)),
        }
        Ok(())
    }

    fn branch(&mut self, node: &Node) -> Result<(), CompileError> {
        let (Some(condition), Some(then_block)) = (node.children.first(), node.children.get(1))
        else {
            return Err(CompileError::Internal("malformed if".to_string()));
        };
        let else_block = node.children.get(2);

        for dependency in &condition.depends_on {
            self.statement(dependency)?;
        }

        let n = self.branches;
        self.branches += 1;
        let else_label = self.label(&format!("else{}", n));
        let end_label = self.label(&format!("end{}", n));

        match condition.children.as_slice() {
            [not, operand] if not.is_operation_of(ScriptOp::Not) && operand.is_operand() => {
                self.code.emit_jump(ScriptOp::Jnz, &else_label);
                self.operand(operand)?;
            }
            items => {
                self.code.emit_jump(ScriptOp::Jz, &else_label);
                self.sequence(items)?;
            }
        }
        self.code.push_op(ScriptOp::Nop);

        for statement in &then_block.children {
            self.statement(statement)?;
        }
        match else_block {
            Some(else_block) => {
                self.code.emit_jump(ScriptOp::Jump, &end_label);
                self.code.place_label(&else_label);
                for statement in &else_block.children {
                    self.statement(statement)?;
                }
                self.code.place_label(&end_label);
            }
            None => self.code.place_label(&else_label),
        }
        Ok(())
    }

    fn root_call(&mut self, node: &Node) -> Result<(), CompileError> {
        let argument = node.children.first();
        match node.function {
            Some(FunctionRef::Procedure(procedure)) => match procedure {
                Procedure::Push => {
                    let argument = argument
                        .ok_or_else(|| CompileError::semantic("push needs a value", node))?;
                    self.push(argument)?;
                }
                Procedure::Pop => self.code.push_op(ScriptOp::Pop),
                Procedure::Yield => {
                    self.code.push_op(ScriptOp::Yield);
                    match argument {
                        Some(argument) => self.expression(argument)?,
                        None => self.code.push(constant_byte(0)),
                    }
                    self.code.push_op(ScriptOp::Nop);
                }
                Procedure::Seed => {
                    self.code.push_op(ScriptOp::Seed);
                    self.leaf_argument(node)?;
                }
                Procedure::Debug => {
                    self.code.push_op(ScriptOp::ExOp);
                    self.code.push(ExtendedOp::Debug.byte());
                    self.leaf_argument(node)?;
                }
                Procedure::DebugStack => {
                    self.code.push_op(ScriptOp::ExOp);
                    self.code.push(ExtendedOp::DebugStack.byte());
                }
                Procedure::Return => self.code.push_op(ScriptOp::Ret),
            },
            Some(FunctionRef::External { .. }) => self.operand(node)?,
            _ => return Err(CompileError::unsupported("cannot compile statement", node)),
        }
        Ok(())
    }

    fn leaf_argument(&mut self, node: &Node) -> Result<(), CompileError> {
        match node.children.first() {
            Some(argument) if argument.is_leaf() => self.operand(argument),
            _ => Err(CompileError::not_flat("expected a single operand", node)),
        }
    }

    /// `pushf <function>`, `pushv packed operands` or `push <expr> nop`.
    fn push(&mut self, argument: &Node) -> Result<(), CompileError> {
        let is_call = matches!(argument.kind, NodeType::Function | NodeType::Index)
            && !argument.is_pop();
        let is_vector = argument.kind == NodeType::Compound
            && argument.children.len() >= 2
            && argument.children.iter().all(Node::is_leaf);

        if is_call {
            self.code.push_op(ScriptOp::PushF);
            self.operand(argument)
        } else if is_vector {
            self.code.push_op(ScriptOp::PushV);
            self.code
                .push(pack_count_size(argument.children.len(), argument.vector_size));
            argument.children.iter().try_for_each(|c| self.operand(c))
        } else {
            self.code.push_op(ScriptOp::Push);
            self.expression(argument)?;
            self.code.push_op(ScriptOp::Nop);
            Ok(())
        }
    }

    /// An argument used as a whole expression: compounds lose their brackets.
    fn expression(&mut self, node: &Node) -> Result<(), CompileError> {
        if node.kind == NodeType::Compound {
            self.sequence(&node.children)
        } else {
            self.operand(node)
        }
    }

    fn sequence(&mut self, items: &[Node]) -> Result<(), CompileError> {
        for item in items {
            match item.op {
                Some(op) if item.is_operation() => self.code.push_op(op),
                _ => self.operand(item)?,
            }
        }
        Ok(())
    }

    fn operand(&mut self, node: &Node) -> Result<(), CompileError> {
        match node.kind {
            NodeType::Parameter => {
                let byte = match node.constant {
                    Some(byte) => byte,
                    None => self.slot(node)?,
                };
                self.code.push(byte);
            }
            NodeType::Compound => {
                self.code.push_op(ScriptOp::Begin);
                self.sequence(&node.children)?;
                self.code.push_op(ScriptOp::End);
            }
            NodeType::Index => {
                let component = node
                    .component()
                    .and_then(ExtendedOp::index)
                    .ok_or_else(|| CompileError::semantic("invalid component", node))?;
                self.code.push_op(ScriptOp::ExOp);
                self.code.push(component.byte());
                self.arguments(node)?;
            }
            NodeType::Function if node.is_pop() => self.code.push_op(ScriptOp::Pop),
            NodeType::Function => match node.function {
                Some(FunctionRef::Builtin(_)) => {
                    let Some(info) = node.builtin() else {
                        return Err(CompileError::semantic("unresolved function", node));
                    };
                    match info.emit {
                        Emit::Op(op) => {
                            self.code.push_op(op);
                            if info.packed() {
                                let sizes: Vec<u8> =
                                    node.children.iter().map(|c| c.vector_size).collect();
                                let width = info.operand_width(&sizes).unwrap_or(1);
                                self.code.push(pack_count_size(node.children.len(), width));
                            }
                        }
                        Emit::Ex(ex) => {
                            self.code.push_op(ScriptOp::ExOp);
                            self.code.push(ex.byte());
                        }
                    }
                    self.arguments(node)?;
                }
                Some(FunctionRef::External { id, .. }) => {
                    self.code.push_op(ScriptOp::ExOp);
                    self.code.push(ExtendedOp::Call.byte());
                    self.code.extend(&id.to_be_bytes());
                    self.arguments(node)?;
                }
                _ => return Err(CompileError::semantic("unresolved function", node)),
            },
            _ => return Err(CompileError::unsupported("not a value", node)),
        }
        Ok(())
    }

    /// Flat argument list: every argument is one operand byte.
    fn arguments(&mut self, node: &Node) -> Result<(), CompileError> {
        for argument in &node.children {
            if !argument.is_leaf() {
                return Err(CompileError::not_flat("parameter is not a leaf", argument));
            }
            self.operand(argument)?;
        }
        Ok(())
    }

    fn slot(&self, node: &Node) -> Result<u8, CompileError> {
        node.variable
            .and_then(|id| self.offsets.get(id))
            .map(|offset| identifier(*offset))
            .ok_or_else(|| {
                CompileError::semantic(format!("unresolved variable '{}'", node.identifier), node)
            })
    }
}
