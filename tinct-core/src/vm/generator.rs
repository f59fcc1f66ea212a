//! Lowers IR to a lane program.
//!
//! Every variable owns a run of slots, one per scalar component, holding the
//! `Val` that currently represents it. There are no branches: an `if` narrows
//! the execution mask for each arm, and every store selects between the new
//! and the old value under the mask, so inactive lanes keep what they had.
//! `return` records the lanes that have returned so later statements leave
//! them alone. The run-once `do { } while (false)` wrapper that inlining puts
//! around early returns is handled the same way, with `break` recording the
//! lanes that left it.

use super::builder::{BinaryOp, Builder, Program as LaneProgram, UnaryOp, Val};
use crate::bail_codegen;
use crate::builtins::{SK_FRAGCOORD_BUILTIN, SK_MAIN_COORDS_BUILTIN};
use crate::error::{CompilerError, ErrorReporter, Offset, Result};
use crate::ir::{
    Expression, ExpressionKind, FuncId, FunctionDefinition, Operator, Program, ProgramElement, Statement,
    StatementKind, VarId, SWIZZLE_ONE, SWIZZLE_ZERO,
};
use crate::modifiers::Modifiers;
use crate::types::{NumberKind, Type, TypeKind};
use log::{debug, trace};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};

/// Lowers the function named `entry`. The lane program takes one argument
/// slot per scalar component of the entry's parameters and one uniform slot
/// per component of each `uniform` global, and returns the entry's result
/// followed by its `out` parameters. Every host-facing slot is a float;
/// integers and booleans are converted at the boundary.
pub fn lower(program: &Program, entry: &str) -> Result<LaneProgram> {
    let Some(definition) = program
        .function_definitions()
        .find(|def| program.function(def.declaration).name == entry)
    else {
        bail_codegen!("no function named '{}' to run", entry);
    };
    debug!("lowering '{}' to the VM", entry);

    let mut generator = Generator::new(program);
    let results = generator.write_entry(definition);
    generator.errors.check(CompilerError::CodegenError)?;
    let Some(results) = results else {
        bail_codegen!("could not lower '{}'", entry);
    };
    let lane_program = generator.builder.done(results);
    trace!("VM program for '{}':\n{}", entry, lane_program);
    Ok(lane_program)
}

/// The slots of one expression result.
#[derive(Debug, Clone, Default)]
struct Value(Vec<Val>);

impl Value {
    fn scalar(&self) -> Val {
        self.0[0]
    }

    fn slots(&self) -> usize {
        self.0.len()
    }

    /// Component `i`, repeating a scalar across every component.
    fn lane(&self, i: usize) -> Val {
        if self.0.len() == 1 {
            self.0[0]
        } else {
            self.0[i]
        }
    }
}

impl From<Val> for Value {
    fn from(val: Val) -> Self {
        Value(vec![val])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intrinsic {
    Abs,
    Sign,
    Sqrt,
    InverseSqrt,
    Sin,
    Cos,
    Tan,
    Exp,
    Exp2,
    Log,
    Log2,
    Pow,
    Floor,
    Ceil,
    Fract,
    Mod,
    Min,
    Max,
    Clamp,
    Saturate,
    Mix,
    Step,
    Smoothstep,
    Dot,
    Length,
    Distance,
    Normalize,
    Cross,
    Inverse,
    Not,
    All,
    Any,
    Equal,
    NotEqual,
    LessThan,
    LessThanEqual,
    GreaterThan,
    GreaterThanEqual,
}

impl Intrinsic {
    fn from_name(name: &str) -> Option<Intrinsic> {
        use Intrinsic::*;
        Some(match name {
            "abs" => Abs,
            "sign" => Sign,
            "sqrt" => Sqrt,
            "inversesqrt" => InverseSqrt,
            "sin" => Sin,
            "cos" => Cos,
            "tan" => Tan,
            "exp" => Exp,
            "exp2" => Exp2,
            "log" => Log,
            "log2" => Log2,
            "pow" => Pow,
            "floor" => Floor,
            "ceil" => Ceil,
            "fract" => Fract,
            "mod" => Mod,
            "min" => Min,
            "max" => Max,
            "clamp" => Clamp,
            "saturate" => Saturate,
            "mix" => Mix,
            "step" => Step,
            "smoothstep" => Smoothstep,
            "dot" => Dot,
            "length" => Length,
            "distance" => Distance,
            "normalize" => Normalize,
            "cross" => Cross,
            "inverse" => Inverse,
            "not" => Not,
            "all" => All,
            "any" => Any,
            "equal" => Equal,
            "notEqual" => NotEqual,
            "lessThan" => LessThan,
            "lessThanEqual" => LessThanEqual,
            "greaterThan" => GreaterThan,
            "greaterThanEqual" => GreaterThanEqual,
            _ => return None,
        })
    }
}

/// Number kind of the scalars making up `ty`.
fn base_kind(ty: &Type) -> NumberKind {
    ty.component_type().number_kind()
}

/// Number kind of every flattened slot of `ty`, in slot order.
fn slot_kinds(ty: &Type, out: &mut Vec<NumberKind>) {
    match &ty.kind {
        TypeKind::Struct { fields } => {
            for field in fields {
                slot_kinds(&field.ty, out);
            }
        }
        TypeKind::Array { component, count } => {
            for _ in 0..count.unwrap_or(0) {
                slot_kinds(component, out);
            }
        }
        _ => out.extend(std::iter::repeat(base_kind(ty)).take(ty.slot_count())),
    }
}

fn field_slot_offset(base: &Type, field_index: usize) -> usize {
    base.fields()[..field_index].iter().map(|field| field.ty.slot_count()).sum()
}

struct Frame {
    function: FuncId,
    return_value: Vec<Val>,
    /// Lanes that have already executed a `return` in this function.
    returned: Val,
    /// Lanes that left each enclosing run-once `do { } while (false)`. Each
    /// entry starts from its parent's, so the innermost entry covers every
    /// lane that has left any enclosing loop.
    breaks: Vec<Val>,
}

struct Generator<'a> {
    program: &'a Program,
    builder: Builder,
    errors: ErrorReporter,
    slots: Vec<Val>,
    variable_slots: HashMap<VarId, usize>,
    condition_mask: Val,
    frames: Vec<Frame>,
    /// Local coordinates of the lane; the entry's `float2` argument if it takes one.
    coords: (Val, Val),
}

/// Narrows the condition mask until dropped.
struct MaskScope<'g, 'a> {
    generator: &'g mut Generator<'a>,
    saved: Val,
}

impl<'a> Deref for MaskScope<'_, 'a> {
    type Target = Generator<'a>;

    fn deref(&self) -> &Generator<'a> {
        self.generator
    }
}

impl<'a> DerefMut for MaskScope<'_, 'a> {
    fn deref_mut(&mut self) -> &mut Generator<'a> {
        self.generator
    }
}

impl Drop for MaskScope<'_, '_> {
    fn drop(&mut self) {
        self.generator.condition_mask = self.saved;
    }
}

impl<'a> Generator<'a> {
    fn new(program: &'a Program) -> Self {
        let mut builder = Builder::new();
        let condition_mask = builder.splat_bool(true);
        let zero = builder.splat_f32(0.0);
        Generator {
            program,
            builder,
            errors: ErrorReporter::new(),
            slots: Vec::new(),
            variable_slots: HashMap::new(),
            condition_mask,
            frames: Vec::new(),
            coords: (zero, zero),
        }
    }

    fn error(&mut self, offset: Offset, message: impl Into<String>) {
        self.errors.error(offset, message);
    }

    fn push_mask(&mut self, mask: Val) -> MaskScope<'_, 'a> {
        let saved = self.condition_mask;
        self.condition_mask = self.builder.and(saved, mask);
        MaskScope { generator: self, saved }
    }

    /// Lanes allowed to have side effects right now.
    fn mask(&mut self) -> Val {
        match self.frames.last() {
            Some(frame) => {
                let (returned, broken) = (frame.returned, frame.breaks.last().copied());
                let exited = match broken {
                    Some(broken) => self.builder.or(returned, broken),
                    None => returned,
                };
                let live = self.builder.not(exited);
                self.builder.and(self.condition_mask, live)
            }
            None => self.condition_mask,
        }
    }

    fn zeros(&mut self, count: usize) -> Vec<Val> {
        let zero = self.builder.splat(0);
        vec![zero; count]
    }

    /// Converts host floats into the representation of each slot's kind.
    fn from_host(&mut self, ty: &Type, values: &[Val]) -> Vec<Val> {
        let mut kinds = Vec::new();
        slot_kinds(ty, &mut kinds);
        let zero = self.builder.splat_f32(0.0);
        values
            .iter()
            .zip(kinds)
            .map(|(&value, kind)| match kind {
                NumberKind::Signed | NumberKind::Unsigned => self.builder.unary(UnaryOp::Trunc, value),
                NumberKind::Boolean => self.builder.binary(BinaryOp::NeqF, value, zero),
                _ => value,
            })
            .collect()
    }

    fn to_host(&mut self, ty: &Type, values: &[Val]) -> Vec<Val> {
        let mut kinds = Vec::new();
        slot_kinds(ty, &mut kinds);
        let one = self.builder.splat_f32(1.0);
        let zero = self.builder.splat_f32(0.0);
        values
            .iter()
            .zip(kinds)
            .map(|(&value, kind)| match kind {
                NumberKind::Signed | NumberKind::Unsigned => self.builder.unary(UnaryOp::ToF32, value),
                NumberKind::Boolean => self.builder.select(value, one, zero),
                _ => value,
            })
            .collect()
    }

    fn write_entry(&mut self, definition: &'a FunctionDefinition) -> Option<Vec<Val>> {
        let program = self.program;
        let declaration = program.function(definition.declaration);

        let mut arguments = Vec::new();
        for &parameter in &declaration.parameters {
            let variable = program.variable(parameter);
            let first = arguments.len();
            let raw: Vec<Val> = (0..variable.ty.slot_count())
                .map(|i| self.builder.argument(first + i))
                .collect();
            if variable.modifiers.layout.builtin == SK_MAIN_COORDS_BUILTIN && raw.len() == 2 {
                self.coords = (raw[0], raw[1]);
            }
            arguments.extend(self.from_host(&variable.ty, &raw));
        }

        self.declare_globals()?;

        let return_value = self.zeros(declaration.return_type.slot_count());
        let return_value = self.write_function(definition, &mut arguments, return_value)?;

        let mut results = self.to_host(&declaration.return_type, &return_value);
        let mut index = 0;
        for &parameter in &declaration.parameters {
            let variable = program.variable(parameter);
            let count = variable.ty.slot_count();
            if variable.modifiers.has(Modifiers::OUT) {
                let written = arguments[index..index + count].to_vec();
                results.extend(self.to_host(&variable.ty, &written));
            }
            index += count;
        }
        Some(results)
    }

    /// Uniforms take host slots in declaration order; other globals start at
    /// their initializer or zero.
    fn declare_globals(&mut self) -> Option<()> {
        let program = self.program;
        let mut next_uniform = 0;
        for element in &program.elements {
            let ProgramElement::GlobalVar(declarations) = element else {
                continue;
            };
            for declaration in &declarations.vars {
                let variable = program.variable(declaration.var);
                if variable.ty.is_opaque() {
                    continue;
                }
                let slot = self.variable_slot(declaration.var, declaration.offset)?;
                let count = variable.ty.slot_count();
                if variable.modifiers.has(Modifiers::UNIFORM) {
                    let raw: Vec<Val> = (0..count)
                        .map(|i| self.builder.uniform(next_uniform + i))
                        .collect();
                    next_uniform += count;
                    let converted = self.from_host(&variable.ty, &raw);
                    self.slots[slot..slot + count].copy_from_slice(&converted);
                } else if let Some(value) = &declaration.value {
                    let value = self.write_expression(value)?;
                    self.slots[slot..slot + count].copy_from_slice(&value.0);
                }
            }
        }
        Some(())
    }

    /// First slot of `var`, allocating zeroed storage on first use.
    fn variable_slot(&mut self, var: VarId, offset: Offset) -> Option<usize> {
        if let Some(slot) = self.variable_slots.get(&var) {
            return Some(*slot);
        }
        let program = self.program;
        let variable = program.variable(var);
        let slot = self.slots.len();
        let initial = match variable.modifiers.layout.builtin {
            -1 => self.zeros(variable.ty.slot_count()),
            SK_FRAGCOORD_BUILTIN => {
                let zero = self.builder.splat_f32(0.0);
                let one = self.builder.splat_f32(1.0);
                vec![self.coords.0, self.coords.1, zero, one]
            }
            SK_MAIN_COORDS_BUILTIN => vec![self.coords.0, self.coords.1],
            _ => {
                let message = format!("builtin variable '{}' is not available to the VM", variable.name);
                self.error(offset, message);
                return None;
            }
        };
        self.slots.extend(initial);
        self.variable_slots.insert(var, slot);
        Some(slot)
    }

    fn write_function(
        &mut self,
        definition: &'a FunctionDefinition,
        arguments: &mut [Val],
        return_value: Vec<Val>,
    ) -> Option<Vec<Val>> {
        let program = self.program;
        let declaration = program.function(definition.declaration);
        if self.frames.iter().any(|frame| frame.function == definition.declaration) {
            let message = format!("recursive call to '{}' is not supported by the VM", declaration.name);
            self.error(definition.offset, message);
            return None;
        }
        trace!("expanding '{}'", declaration.name);

        let returned = self.builder.splat_bool(false);
        self.frames.push(Frame { function: definition.declaration, return_value, returned, breaks: Vec::new() });

        let mut index = 0;
        for &parameter in &declaration.parameters {
            let count = program.variable(parameter).ty.slot_count();
            let slot = self.variable_slot(parameter, definition.offset)?;
            self.slots[slot..slot + count].copy_from_slice(&arguments[index..index + count]);
            index += count;
        }

        let body = self.write_statement(&definition.body);

        // out and inout parameters hand their final values back
        let mut index = 0;
        for &parameter in &declaration.parameters {
            let variable = program.variable(parameter);
            let count = variable.ty.slot_count();
            if variable.modifiers.has(Modifiers::OUT) {
                if let Some(&slot) = self.variable_slots.get(&parameter) {
                    arguments[index..index + count].copy_from_slice(&self.slots[slot..slot + count]);
                }
            }
            index += count;
        }

        let frame = self.frames.pop()?;
        body?;
        Some(frame.return_value)
    }

    fn write_statement(&mut self, statement: &'a Statement) -> Option<()> {
        match &statement.kind {
            StatementKind::Block { statements, .. } => {
                for statement in statements {
                    self.write_statement(statement)?;
                }
            }
            StatementKind::If { test, if_true, if_false, .. } => {
                let test = self.write_expression(test)?.scalar();
                {
                    let mut scope = self.push_mask(test);
                    scope.write_statement(if_true)?;
                }
                if let Some(if_false) = if_false {
                    let inverse = self.builder.not(test);
                    let mut scope = self.push_mask(inverse);
                    scope.write_statement(if_false)?;
                }
            }
            StatementKind::Return { expression } => {
                let returns_here = self.mask();
                if let Some(expression) = expression {
                    let value = self.write_expression(expression)?;
                    let previous = self.frames.last()?.return_value.clone();
                    let updated: Vec<Val> = previous
                        .iter()
                        .enumerate()
                        .map(|(i, &old)| self.builder.select(returns_here, value.lane(i), old))
                        .collect();
                    self.frames.last_mut()?.return_value = updated;
                }
                let returned = self.frames.last()?.returned;
                let returned = self.builder.or(returned, returns_here);
                self.frames.last_mut()?.returned = returned;
            }
            StatementKind::Expression { expression } => {
                self.write_expression(expression)?;
            }
            StatementKind::VarDeclarations { declarations } => {
                for declaration in &declarations.vars {
                    let slot = self.variable_slot(declaration.var, declaration.offset)?;
                    let count = self.program.variable(declaration.var).ty.slot_count();
                    let value = match &declaration.value {
                        Some(value) => self.write_expression(value)?.0,
                        None => self.zeros(count),
                    };
                    self.slots[slot..slot + count].copy_from_slice(&value);
                }
            }
            StatementKind::Do { body, test } if test.as_bool() == Some(false) => {
                let outer = match self.frames.last()?.breaks.last() {
                    Some(&outer) => outer,
                    None => self.builder.splat_bool(false),
                };
                self.frames.last_mut()?.breaks.push(outer);
                let body = self.write_statement(body);
                self.frames.last_mut()?.breaks.pop();
                body?;
            }
            StatementKind::For { .. } | StatementKind::While { .. } | StatementKind::Do { .. } => {
                self.error(statement.offset, "loops are not supported by the VM");
                return None;
            }
            StatementKind::Switch { .. } => {
                self.error(statement.offset, "switch statements are not supported by the VM");
                return None;
            }
            // `continue` jumps to the false test, so it leaves the loop too
            StatementKind::Break | StatementKind::Continue => {
                if self.frames.last()?.breaks.is_empty() {
                    self.error(statement.offset, "break and continue are only supported in do-while(false) by the VM");
                    return None;
                }
                let leaving = self.mask();
                let frame = self.frames.last_mut()?;
                let broken = frame.breaks.pop()?;
                let broken = self.builder.or(broken, leaving);
                self.frames.last_mut()?.breaks.push(broken);
            }
            StatementKind::Discard => {
                self.error(statement.offset, "discard is not supported by the VM");
                return None;
            }
            StatementKind::InlineMarker { .. } | StatementKind::Nop => {}
        }
        Some(())
    }

    fn write_expression(&mut self, expr: &'a Expression) -> Option<Value> {
        match &expr.kind {
            ExpressionKind::BoolLiteral(value) => Some(self.builder.splat_bool(*value).into()),
            ExpressionKind::IntLiteral(value) => Some(self.builder.splat_i32(*value as i32).into()),
            ExpressionKind::FloatLiteral(value) => Some(self.builder.splat_f32(*value as f32).into()),
            ExpressionKind::Setting { value, .. } => self.write_expression(value),
            ExpressionKind::Binary { left, op, right } => self.write_binary(expr, left, *op, right),
            ExpressionKind::Prefix { op, operand } => self.write_prefix(expr, *op, operand),
            ExpressionKind::Postfix { operand, op } => self.write_postfix(expr, operand, *op),
            ExpressionKind::Ternary { test, if_true, if_false } => {
                let test = self.write_expression(test)?.scalar();
                let if_true = {
                    let mut scope = self.push_mask(test);
                    scope.write_expression(if_true)?
                };
                let inverse = self.builder.not(test);
                let if_false = {
                    let mut scope = self.push_mask(inverse);
                    scope.write_expression(if_false)?
                };
                let merged = (0..if_true.slots())
                    .map(|i| self.builder.select(test, if_true.0[i], if_false.0[i]))
                    .collect();
                Some(Value(merged))
            }
            ExpressionKind::Constructor { arguments } => self.write_constructor(expr, arguments),
            ExpressionKind::FunctionCall { function, arguments } => self.write_call(expr, *function, arguments),
            ExpressionKind::ExternalFunctionCall { function, .. } => {
                let message = format!(
                    "external function '{}' cannot be called from the VM",
                    self.program.externals[*function].name
                );
                self.error(expr.offset, message);
                None
            }
            ExpressionKind::FieldAccess { base, field_index, .. } => {
                let value = self.write_expression(base)?;
                let start = field_slot_offset(&base.ty, *field_index);
                Some(Value(value.0[start..start + expr.ty.slot_count()].to_vec()))
            }
            ExpressionKind::Index { base, index } => {
                let value = self.write_expression(base)?;
                let start = self.index_slot_offset(&base.ty, index, &expr.ty)?;
                Some(Value(value.0[start..start + expr.ty.slot_count()].to_vec()))
            }
            ExpressionKind::Swizzle { base, components } => {
                let value = self.write_expression(base)?;
                let float = base_kind(&expr.ty) == NumberKind::Float;
                let swizzled = components
                    .iter()
                    .map(|&component| match component {
                        SWIZZLE_ZERO => self.builder.splat(0),
                        SWIZZLE_ONE if float => self.builder.splat_f32(1.0),
                        SWIZZLE_ONE => self.builder.splat_i32(1),
                        c => value.0[c as usize],
                    })
                    .collect();
                Some(Value(swizzled))
            }
            ExpressionKind::VariableReference { variable, .. } => {
                let slot = self.variable_slot(*variable, expr.offset)?;
                Some(Value(self.slots[slot..slot + expr.ty.slot_count()].to_vec()))
            }
            ExpressionKind::NullLiteral => {
                self.error(expr.offset, "null is not supported by the VM");
                None
            }
            ExpressionKind::FunctionReference { .. } | ExpressionKind::TypeReference { .. } => {
                unreachable!("'{}' reached the VM generator", self.program.describe_expression(expr))
            }
        }
    }

    /// Slot offset selected by a constant index, clamped to the base's bounds.
    fn index_slot_offset(&mut self, base: &Type, index: &'a Expression, element: &Type) -> Option<usize> {
        let value = self.write_expression(index)?.scalar();
        let Some(bits) = self.builder.immediate(value) else {
            self.error(index.offset, "the VM only supports constant indices");
            return None;
        };
        let last = base.columns().max(1) - 1;
        let index = (bits as i32).clamp(0, last as i32) as usize;
        Some(index * element.slot_count())
    }

    /// Stores `value` through the lvalue `target` under the current mask.
    fn write_store(&mut self, target: &'a Expression, value: Value) -> Option<Value> {
        let mut slots: Vec<usize> = (0..value.slots()).collect();
        let mut expr = target;
        let variable = loop {
            match &expr.kind {
                ExpressionKind::VariableReference { variable, .. } => break *variable,
                ExpressionKind::FieldAccess { base, field_index, .. } => {
                    let start = field_slot_offset(&base.ty, *field_index);
                    slots.iter_mut().for_each(|slot| *slot += start);
                    expr = base;
                }
                ExpressionKind::Index { base, index } => {
                    let start = self.index_slot_offset(&base.ty, index, &expr.ty)?;
                    slots.iter_mut().for_each(|slot| *slot += start);
                    expr = base;
                }
                ExpressionKind::Swizzle { base, components } => {
                    slots.iter_mut().for_each(|slot| *slot = components[*slot] as usize);
                    expr = base;
                }
                _ => {
                    let message = format!("cannot assign to '{}' in the VM", self.program.describe_expression(target));
                    self.error(target.offset, message);
                    return None;
                }
            }
        };

        let base = self.variable_slot(variable, target.offset)?;
        let mask = self.mask();
        for (i, slot) in slots.into_iter().enumerate() {
            let current = self.slots[base + slot];
            self.slots[base + slot] = self.builder.select(mask, value.0[i], current);
        }
        Some(value)
    }

    fn write_binary(
        &mut self,
        expr: &'a Expression,
        left: &'a Expression,
        op: Operator,
        right: &'a Expression,
    ) -> Option<Value> {
        match op {
            Operator::Eq => {
                let value = self.write_expression(right)?;
                return self.write_store(left, value);
            }
            Operator::LogicalAnd => {
                let l = self.write_expression(left)?.scalar();
                let r = {
                    let mut scope = self.push_mask(l);
                    scope.write_expression(right)?.scalar()
                };
                return Some(self.builder.and(l, r).into());
            }
            Operator::LogicalOr => {
                let l = self.write_expression(left)?.scalar();
                let inverse = self.builder.not(l);
                let r = {
                    let mut scope = self.push_mask(inverse);
                    scope.write_expression(right)?.scalar()
                };
                return Some(self.builder.or(l, r).into());
            }
            Operator::Comma => {
                self.write_expression(left)?;
                return self.write_expression(right);
            }
            _ => {}
        }

        let is_assignment = op.is_assignment();
        let op = op.remove_assignment();
        let (left_ty, right_ty) = (&left.ty, &right.ty);
        let kind = base_kind(left_ty);
        let l = self.write_expression(left)?;
        let r = self.write_expression(right)?;

        let result = if op == Operator::Star
            && (left_ty.is_vector() || left_ty.is_matrix())
            && (right_ty.is_vector() || right_ty.is_matrix())
            && !(left_ty.is_vector() && right_ty.is_vector())
        {
            self.matrix_multiply(left_ty, &l, right_ty, &r)
        } else {
            let float = kind == NumberKind::Float;
            let pick = |f: BinaryOp, i: BinaryOp| if float { f } else { i };
            match op {
                Operator::EqEq | Operator::Neq => {
                    let (compare, fold) = match op {
                        Operator::EqEq => (pick(BinaryOp::EqF, BinaryOp::EqI), BinaryOp::And),
                        _ => (pick(BinaryOp::NeqF, BinaryOp::NeqI), BinaryOp::Or),
                    };
                    let components = self.zip(&l, &r, compare);
                    let mut folded = components.0[0];
                    for &component in &components.0[1..] {
                        folded = self.builder.binary(fold, folded, component);
                    }
                    folded.into()
                }
                Operator::Lt => self.zip(&l, &r, pick(BinaryOp::LtF, BinaryOp::LtI)),
                Operator::LtEq => self.zip(&l, &r, pick(BinaryOp::LteF, BinaryOp::LteI)),
                Operator::Gt => self.zip(&l, &r, pick(BinaryOp::GtF, BinaryOp::GtI)),
                Operator::GtEq => self.zip(&l, &r, pick(BinaryOp::GteF, BinaryOp::GteI)),
                Operator::Plus => self.zip(&l, &r, pick(BinaryOp::AddF, BinaryOp::AddI)),
                Operator::Minus => self.zip(&l, &r, pick(BinaryOp::SubF, BinaryOp::SubI)),
                Operator::Star => self.zip(&l, &r, pick(BinaryOp::MulF, BinaryOp::MulI)),
                Operator::Slash if float => self.zip(&l, &r, BinaryOp::DivF),
                Operator::Slash => {
                    // integer division is float division truncated toward zero
                    let count = l.slots().max(r.slots());
                    let quotients = (0..count)
                        .map(|i| {
                            let x = self.builder.unary(UnaryOp::ToF32, l.lane(i));
                            let y = self.builder.unary(UnaryOp::ToF32, r.lane(i));
                            let q = self.builder.div_f(x, y);
                            self.builder.unary(UnaryOp::Trunc, q)
                        })
                        .collect();
                    Value(quotients)
                }
                Operator::BitwiseAnd if !float => self.zip(&l, &r, BinaryOp::And),
                Operator::BitwiseOr if !float => self.zip(&l, &r, BinaryOp::Or),
                Operator::BitwiseXor | Operator::LogicalXor if !float => self.zip(&l, &r, BinaryOp::Xor),
                _ => {
                    let message = format!("operator '{}' is not supported by the VM", op);
                    self.error(expr.offset, message);
                    return None;
                }
            }
        };

        if is_assignment {
            self.write_store(left, result)
        } else {
            Some(result)
        }
    }

    /// Applies `op` component-wise, repeating a scalar side.
    fn zip(&mut self, l: &Value, r: &Value, op: BinaryOp) -> Value {
        let count = l.slots().max(r.slots());
        Value((0..count).map(|i| self.builder.binary(op, l.lane(i), r.lane(i))).collect())
    }

    /// Matrix-matrix, matrix-vector and vector-matrix products. A vector on
    /// the right is a column, on the left a row.
    fn matrix_multiply(&mut self, left_ty: &Type, l: &Value, right_ty: &Type, r: &Value) -> Value {
        let (left_columns, left_rows) = if left_ty.is_vector() {
            (left_ty.columns(), 1)
        } else {
            (left_ty.columns(), left_ty.rows())
        };
        let (right_columns, right_rows) = if right_ty.is_vector() {
            (1, right_ty.columns())
        } else {
            (right_ty.columns(), right_ty.rows())
        };
        debug_assert_eq!(left_columns, right_rows);
        let mut result = Vec::with_capacity(left_rows * right_columns);
        for c in 0..right_columns {
            for row in 0..left_rows {
                let mut sum = self.builder.splat_f32(0.0);
                for j in 0..left_columns {
                    let product = self.builder.mul_f(l.0[j * left_rows + row], r.0[c * right_rows + j]);
                    sum = self.builder.add_f(sum, product);
                }
                result.push(sum);
            }
        }
        Value(result)
    }

    fn write_prefix(&mut self, expr: &'a Expression, op: Operator, operand: &'a Expression) -> Option<Value> {
        let value = self.write_expression(operand)?;
        let float = base_kind(&expr.ty) == NumberKind::Float;
        match op {
            Operator::PlusPlus | Operator::MinusMinus => {
                let stepped = self.step(&value, op == Operator::PlusPlus, float);
                self.write_store(operand, stepped)
            }
            Operator::Minus => {
                let negate = if float { UnaryOp::NegF } else { UnaryOp::NegI };
                Some(Value(value.0.iter().map(|&v| self.builder.unary(negate, v)).collect()))
            }
            Operator::Plus => Some(value),
            Operator::LogicalNot | Operator::BitwiseNot => {
                Some(Value(value.0.iter().map(|&v| self.builder.not(v)).collect()))
            }
            _ => unreachable!("'{}' is not a prefix operator", op),
        }
    }

    fn write_postfix(&mut self, expr: &'a Expression, operand: &'a Expression, op: Operator) -> Option<Value> {
        let old = self.write_expression(operand)?;
        let float = base_kind(&expr.ty) == NumberKind::Float;
        let stepped = self.step(&old, op == Operator::PlusPlus, float);
        self.write_store(operand, stepped)?;
        Some(old)
    }

    fn step(&mut self, value: &Value, increment: bool, float: bool) -> Value {
        let delta = match (float, increment) {
            (true, true) => self.builder.splat_f32(1.0),
            (true, false) => self.builder.splat_f32(-1.0),
            (false, true) => self.builder.splat_i32(1),
            (false, false) => self.builder.splat_i32(-1),
        };
        let add = if float { BinaryOp::AddF } else { BinaryOp::AddI };
        Value(value.0.iter().map(|&v| self.builder.binary(add, v, delta)).collect())
    }

    fn write_constructor(&mut self, expr: &'a Expression, arguments: &'a [Expression]) -> Option<Value> {
        let ty = &expr.ty;
        if arguments.len() != 1 || ty.is_array() || ty.is_struct() {
            // aggregate the arguments in order
            let mut slots = Vec::with_capacity(ty.slot_count());
            for argument in arguments {
                slots.extend(self.write_expression(argument)?.0);
            }
            return Some(Value(slots));
        }

        let argument = &arguments[0];
        let source = self.write_expression(argument)?;
        let (from, to) = (base_kind(&argument.ty), base_kind(ty));
        let converted: Vec<Val> = source.0.iter().map(|&v| self.convert(v, from, to)).collect();

        let target_slots = ty.slot_count();
        if ty.is_matrix() {
            let (columns, rows) = (ty.columns(), ty.rows());
            let mut slots = Vec::with_capacity(target_slots);
            if argument.ty.is_matrix() {
                // overlap is copied, the rest is identity
                let (source_columns, source_rows) = (argument.ty.columns(), argument.ty.rows());
                for c in 0..columns {
                    for row in 0..rows {
                        if c < source_columns && row < source_rows {
                            slots.push(converted[c * source_rows + row]);
                        } else {
                            slots.push(self.builder.splat_f32(if c == row { 1.0 } else { 0.0 }));
                        }
                    }
                }
                return Some(Value(slots));
            }
            if argument.ty.is_scalar() {
                let zero = self.builder.splat_f32(0.0);
                for c in 0..columns {
                    for row in 0..rows {
                        slots.push(if c == row { converted[0] } else { zero });
                    }
                }
                return Some(Value(slots));
            }
        }
        if argument.ty.is_scalar() {
            return Some(Value(vec![converted[0]; target_slots]));
        }
        if converted.len() == target_slots {
            return Some(Value(converted));
        }
        let message = format!("cannot construct '{}' from '{}' in the VM", ty.name, argument.ty.name);
        self.error(expr.offset, message);
        None
    }

    fn convert(&mut self, value: Val, from: NumberKind, to: NumberKind) -> Val {
        use NumberKind::*;
        match (from, to) {
            (Signed | Unsigned, Float) => self.builder.unary(UnaryOp::ToF32, value),
            (Float, Signed | Unsigned) => self.builder.unary(UnaryOp::Trunc, value),
            (Boolean, Float) => {
                let (one, zero) = (self.builder.splat_f32(1.0), self.builder.splat_f32(0.0));
                self.builder.select(value, one, zero)
            }
            (Boolean, Signed | Unsigned) => {
                let (one, zero) = (self.builder.splat_i32(1), self.builder.splat_i32(0));
                self.builder.select(value, one, zero)
            }
            (Float, Boolean) => {
                let zero = self.builder.splat_f32(0.0);
                self.builder.binary(BinaryOp::NeqF, value, zero)
            }
            (Signed | Unsigned, Boolean) => {
                let zero = self.builder.splat_i32(0);
                self.builder.binary(BinaryOp::NeqI, value, zero)
            }
            _ => value,
        }
    }

    fn write_call(&mut self, expr: &'a Expression, function: FuncId, arguments: &'a [Expression]) -> Option<Value> {
        let program = self.program;
        let declaration = program.function(function);
        let Some(definition) = program.function_definition(function) else {
            if declaration.builtin {
                return self.write_intrinsic(expr, &declaration.name, arguments);
            }
            let message = format!("function '{}' is declared but never defined", declaration.name);
            self.error(expr.offset, message);
            return None;
        };

        let mut argument_values = Vec::new();
        for argument in arguments {
            argument_values.extend(self.write_expression(argument)?.0);
        }
        let return_value = self.zeros(expr.ty.slot_count());

        // lanes that returned or broke out in the caller stay inactive in the callee
        let live = self.mask();
        let result = {
            let mut scope = self.push_mask(live);
            scope.write_function(definition, &mut argument_values, return_value)?
        };

        let mut index = 0;
        for (&parameter, argument) in declaration.parameters.iter().zip(arguments) {
            let variable = program.variable(parameter);
            let count = variable.ty.slot_count();
            if variable.modifiers.has(Modifiers::OUT) {
                self.write_store(argument, Value(argument_values[index..index + count].to_vec()))?;
            }
            index += count;
        }
        Some(Value(result))
    }

    fn write_intrinsic(&mut self, expr: &'a Expression, name: &str, arguments: &'a [Expression]) -> Option<Value> {
        let Some(intrinsic) = Intrinsic::from_name(name) else {
            let message = format!("intrinsic '{}' is not supported by the VM", name);
            self.error(expr.offset, message);
            return None;
        };
        trace!("intrinsic {:?}", intrinsic);

        let mut args = Vec::with_capacity(arguments.len());
        for argument in arguments {
            args.push(self.write_expression(argument)?);
        }
        let kind = base_kind(&arguments[0].ty);
        let float = kind == NumberKind::Float;

        use Intrinsic::*;
        let result = match intrinsic {
            Abs => self.unary(&args[0], if float { UnaryOp::AbsF } else { UnaryOp::AbsI }),
            Sqrt => self.unary(&args[0], UnaryOp::Sqrt),
            Sin => self.unary(&args[0], UnaryOp::Sin),
            Cos => self.unary(&args[0], UnaryOp::Cos),
            Tan => self.unary(&args[0], UnaryOp::Tan),
            Exp => self.unary(&args[0], UnaryOp::Exp),
            Exp2 => self.unary(&args[0], UnaryOp::Exp2),
            Log => self.unary(&args[0], UnaryOp::Log),
            Log2 => self.unary(&args[0], UnaryOp::Log2),
            Floor => self.unary(&args[0], UnaryOp::Floor),
            Ceil => self.unary(&args[0], UnaryOp::Ceil),
            Fract => self.unary(&args[0], UnaryOp::Fract),
            Not => self.unary(&args[0], UnaryOp::Not),
            InverseSqrt => {
                let one = self.builder.splat_f32(1.0);
                let roots = self.unary(&args[0], UnaryOp::Sqrt);
                self.zip(&one.into(), &roots, BinaryOp::DivF)
            }
            Sign => {
                let (less, greater) = if float {
                    (BinaryOp::LtF, BinaryOp::GtF)
                } else {
                    (BinaryOp::LtI, BinaryOp::GtI)
                };
                let (zero, one, minus_one) = if float {
                    (self.builder.splat_f32(0.0), self.builder.splat_f32(1.0), self.builder.splat_f32(-1.0))
                } else {
                    (self.builder.splat_i32(0), self.builder.splat_i32(1), self.builder.splat_i32(-1))
                };
                let signs = args[0]
                    .0
                    .iter()
                    .map(|&x| {
                        let negative = self.builder.binary(less, x, zero);
                        let positive = self.builder.binary(greater, x, zero);
                        let otherwise = self.builder.select(positive, one, zero);
                        self.builder.select(negative, minus_one, otherwise)
                    })
                    .collect();
                Value(signs)
            }
            Pow => self.zip(&args[0], &args[1], BinaryOp::PowF),
            Mod => {
                let count = args[0].slots().max(args[1].slots());
                let remainders = (0..count)
                    .map(|i| {
                        let (x, y) = (args[0].lane(i), args[1].lane(i));
                        let quotient = self.builder.div_f(x, y);
                        let floored = self.builder.unary(UnaryOp::Floor, quotient);
                        let multiple = self.builder.mul_f(y, floored);
                        self.builder.sub_f(x, multiple)
                    })
                    .collect();
                Value(remainders)
            }
            Min => self.zip(&args[0], &args[1], if float { BinaryOp::MinF } else { BinaryOp::MinI }),
            Max => self.zip(&args[0], &args[1], if float { BinaryOp::MaxF } else { BinaryOp::MaxI }),
            Clamp => {
                let (min, max) = if float {
                    (BinaryOp::MinF, BinaryOp::MaxF)
                } else {
                    (BinaryOp::MinI, BinaryOp::MaxI)
                };
                let raised = self.zip(&args[0], &args[1], max);
                self.zip(&raised, &args[2], min)
            }
            Saturate => {
                let (zero, one) = (self.builder.splat_f32(0.0), self.builder.splat_f32(1.0));
                let raised = self.zip(&args[0], &zero.into(), BinaryOp::MaxF);
                self.zip(&raised, &one.into(), BinaryOp::MinF)
            }
            Mix if base_kind(&arguments[2].ty) == NumberKind::Boolean => {
                let count = args[0].slots().max(args[1].slots());
                let picked = (0..count)
                    .map(|i| self.builder.select(args[2].lane(i), args[1].lane(i), args[0].lane(i)))
                    .collect();
                Value(picked)
            }
            Mix => {
                let count = args[0].slots().max(args[1].slots()).max(args[2].slots());
                let blended = (0..count)
                    .map(|i| {
                        let (x, y, t) = (args[0].lane(i), args[1].lane(i), args[2].lane(i));
                        let span = self.builder.sub_f(y, x);
                        let scaled = self.builder.mul_f(span, t);
                        self.builder.add_f(x, scaled)
                    })
                    .collect();
                Value(blended)
            }
            Step => {
                let (zero, one) = (self.builder.splat_f32(0.0), self.builder.splat_f32(1.0));
                let count = args[0].slots().max(args[1].slots());
                let steps = (0..count)
                    .map(|i| {
                        let below = self.builder.binary(BinaryOp::LtF, args[1].lane(i), args[0].lane(i));
                        self.builder.select(below, zero, one)
                    })
                    .collect();
                Value(steps)
            }
            Smoothstep => {
                let (zero, one) = (self.builder.splat_f32(0.0), self.builder.splat_f32(1.0));
                let (two, three) = (self.builder.splat_f32(2.0), self.builder.splat_f32(3.0));
                let count = args[0].slots().max(args[1].slots()).max(args[2].slots());
                let curve = (0..count)
                    .map(|i| {
                        let (edge0, edge1, x) = (args[0].lane(i), args[1].lane(i), args[2].lane(i));
                        let offset = self.builder.sub_f(x, edge0);
                        let width = self.builder.sub_f(edge1, edge0);
                        let t = self.builder.div_f(offset, width);
                        let t = self.builder.binary(BinaryOp::MaxF, t, zero);
                        let t = self.builder.binary(BinaryOp::MinF, t, one);
                        let twice = self.builder.mul_f(two, t);
                        let falloff = self.builder.sub_f(three, twice);
                        let squared = self.builder.mul_f(t, t);
                        self.builder.mul_f(squared, falloff)
                    })
                    .collect();
                Value(curve)
            }
            Dot => self.dot(&args[0], &args[1]).into(),
            Length => {
                let squared = self.dot(&args[0], &args[0]);
                self.builder.unary(UnaryOp::Sqrt, squared).into()
            }
            Distance => {
                let difference = self.zip(&args[0], &args[1], BinaryOp::SubF);
                let squared = self.dot(&difference, &difference);
                self.builder.unary(UnaryOp::Sqrt, squared).into()
            }
            Normalize => {
                let squared = self.dot(&args[0], &args[0]);
                let length = self.builder.unary(UnaryOp::Sqrt, squared);
                let one = self.builder.splat_f32(1.0);
                let inverse = self.builder.div_f(one, length);
                self.zip(&args[0], &inverse.into(), BinaryOp::MulF)
            }
            Cross => {
                let (a, b) = (&args[0].0, &args[1].0);
                let mut term = |i: usize, j: usize| {
                    let first = self.builder.mul_f(a[i], b[j]);
                    let second = self.builder.mul_f(a[j], b[i]);
                    self.builder.sub_f(first, second)
                };
                Value(vec![term(1, 2), term(2, 0), term(0, 1)])
            }
            Inverse => match args[0].slots() {
                4 => self.inverse2(&args[0]),
                9 => self.inverse3(&args[0]),
                16 => self.inverse4(&args[0]),
                _ => unreachable!("inverse of a non-square matrix reached the VM generator"),
            },
            All | Any => {
                let fold = if intrinsic == All { BinaryOp::And } else { BinaryOp::Or };
                let mut folded = args[0].0[0];
                for &component in &args[0].0[1..] {
                    folded = self.builder.binary(fold, folded, component);
                }
                folded.into()
            }
            Equal | NotEqual | LessThan | LessThanEqual | GreaterThan | GreaterThanEqual => {
                let op = match (intrinsic, float) {
                    (Equal, true) => BinaryOp::EqF,
                    (Equal, false) => BinaryOp::EqI,
                    (NotEqual, true) => BinaryOp::NeqF,
                    (NotEqual, false) => BinaryOp::NeqI,
                    (LessThan, true) => BinaryOp::LtF,
                    (LessThan, false) => BinaryOp::LtI,
                    (LessThanEqual, true) => BinaryOp::LteF,
                    (LessThanEqual, false) => BinaryOp::LteI,
                    (GreaterThan, true) => BinaryOp::GtF,
                    (GreaterThan, false) => BinaryOp::GtI,
                    (GreaterThanEqual, true) => BinaryOp::GteF,
                    _ => BinaryOp::GteI,
                };
                self.zip(&args[0], &args[1], op)
            }
        };
        Some(result)
    }

    fn unary(&mut self, value: &Value, op: UnaryOp) -> Value {
        Value(value.0.iter().map(|&v| self.builder.unary(op, v)).collect())
    }

    fn dot(&mut self, x: &Value, y: &Value) -> Val {
        let mut sum = self.builder.mul_f(x.0[0], y.0[0]);
        for i in 1..x.slots() {
            let product = self.builder.mul_f(x.0[i], y.0[i]);
            sum = self.builder.add_f(sum, product);
        }
        sum
    }

    fn scale(&mut self, values: Vec<Val>, factor: Val) -> Value {
        Value(values.into_iter().map(|v| self.builder.mul_f(v, factor)).collect())
    }

    /// `a*b - c*d`
    fn difference_of_products(&mut self, a: Val, b: Val, c: Val, d: Val) -> Val {
        let first = self.builder.mul_f(a, b);
        let second = self.builder.mul_f(c, d);
        self.builder.sub_f(first, second)
    }

    fn inverse2(&mut self, m: &Value) -> Value {
        let (a, b, c, d) = (m.0[0], m.0[1], m.0[2], m.0[3]);
        let determinant = self.difference_of_products(a, d, b, c);
        let one = self.builder.splat_f32(1.0);
        let inverse_determinant = self.builder.div_f(one, determinant);
        let neg_b = self.builder.unary(UnaryOp::NegF, b);
        let neg_c = self.builder.unary(UnaryOp::NegF, c);
        self.scale(vec![d, neg_b, neg_c, a], inverse_determinant)
    }

    fn inverse3(&mut self, m: &Value) -> Value {
        // a<row><column>, stored column-major
        let (a11, a21, a31) = (m.0[0], m.0[1], m.0[2]);
        let (a12, a22, a32) = (m.0[3], m.0[4], m.0[5]);
        let (a13, a23, a33) = (m.0[6], m.0[7], m.0[8]);

        let cofactors = [
            self.difference_of_products(a22, a33, a23, a32),
            self.difference_of_products(a23, a31, a21, a33),
            self.difference_of_products(a21, a32, a22, a31),
            self.difference_of_products(a13, a32, a12, a33),
            self.difference_of_products(a11, a33, a13, a31),
            self.difference_of_products(a12, a31, a11, a32),
            self.difference_of_products(a12, a23, a13, a22),
            self.difference_of_products(a13, a21, a11, a23),
            self.difference_of_products(a11, a22, a12, a21),
        ];
        // expand along the first row
        let t0 = self.builder.mul_f(a11, cofactors[0]);
        let t1 = self.builder.mul_f(a12, cofactors[1]);
        let t2 = self.builder.mul_f(a13, cofactors[2]);
        let partial = self.builder.add_f(t0, t1);
        let determinant = self.builder.add_f(partial, t2);
        let one = self.builder.splat_f32(1.0);
        let inverse_determinant = self.builder.div_f(one, determinant);
        self.scale(cofactors.to_vec(), inverse_determinant)
    }

    fn inverse4(&mut self, m: &Value) -> Value {
        // a<column><row>
        let v = &m.0;
        let (a00, a01, a02, a03) = (v[0], v[1], v[2], v[3]);
        let (a10, a11, a12, a13) = (v[4], v[5], v[6], v[7]);
        let (a20, a21, a22, a23) = (v[8], v[9], v[10], v[11]);
        let (a30, a31, a32, a33) = (v[12], v[13], v[14], v[15]);

        let b00 = self.difference_of_products(a00, a11, a01, a10);
        let b01 = self.difference_of_products(a00, a12, a02, a10);
        let b02 = self.difference_of_products(a00, a13, a03, a10);
        let b03 = self.difference_of_products(a01, a12, a02, a11);
        let b04 = self.difference_of_products(a01, a13, a03, a11);
        let b05 = self.difference_of_products(a02, a13, a03, a12);
        let b06 = self.difference_of_products(a20, a31, a21, a30);
        let b07 = self.difference_of_products(a20, a32, a22, a30);
        let b08 = self.difference_of_products(a20, a33, a23, a30);
        let b09 = self.difference_of_products(a21, a32, a22, a31);
        let b10 = self.difference_of_products(a21, a33, a23, a31);
        let b11 = self.difference_of_products(a22, a33, a23, a32);

        let mut determinant = self.difference_of_products(b00, b11, b01, b10);
        for (x, y, add) in [(b02, b09, true), (b03, b08, true), (b04, b07, false), (b05, b06, true)] {
            let product = self.builder.mul_f(x, y);
            determinant = if add {
                self.builder.add_f(determinant, product)
            } else {
                self.builder.sub_f(determinant, product)
            };
        }
        let one = self.builder.splat_f32(1.0);
        let inverse_determinant = self.builder.div_f(one, determinant);
        let b = self.scale(vec![b00, b01, b02, b03, b04, b05, b06, b07, b08, b09, b10, b11], inverse_determinant).0;

        // each entry is x*p - y*q + z*r with signs folded into the operand order
        let mut entry = |x: Val, p: Val, y: Val, q: Val, z: Val, r: Val, add_last: bool| {
            let first = self.builder.mul_f(x, p);
            let second = self.builder.mul_f(y, q);
            let third = self.builder.mul_f(z, r);
            let partial = self.builder.sub_f(first, second);
            if add_last {
                self.builder.add_f(partial, third)
            } else {
                self.builder.sub_f(partial, third)
            }
        };
        Value(vec![
            entry(a11, b[11], a12, b[10], a13, b[9], true),
            entry(a02, b[10], a01, b[11], a03, b[9], false),
            entry(a31, b[5], a32, b[4], a33, b[3], true),
            entry(a22, b[4], a21, b[5], a23, b[3], false),
            entry(a12, b[8], a10, b[11], a13, b[7], false),
            entry(a00, b[11], a02, b[8], a03, b[7], true),
            entry(a32, b[2], a30, b[5], a33, b[1], false),
            entry(a20, b[5], a22, b[2], a23, b[1], true),
            entry(a10, b[10], a11, b[8], a13, b[6], true),
            entry(a01, b[8], a00, b[10], a03, b[6], false),
            entry(a30, b[4], a31, b[2], a33, b[0], true),
            entry(a21, b[2], a20, b[4], a23, b[0], false),
            entry(a11, b[7], a10, b[9], a12, b[6], false),
            entry(a00, b[9], a01, b[7], a02, b[6], true),
            entry(a31, b[1], a30, b[3], a32, b[0], false),
            entry(a20, b[3], a21, b[1], a22, b[0], true),
        ])
    }
}
