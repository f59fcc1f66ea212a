use super::IRGenerator;
use crate::ast::{AstKind, AstNode};
use crate::builtins::SK_FRAGCOORD_BUILTIN;
use crate::constant_folding::ConstantFolder;
use crate::error::Offset;
use crate::ir::*;
use crate::modifiers::Modifiers;
use crate::settings::CapValue;
use crate::symbols::Symbol;
use crate::types::{Type, TypeKind, TypeRef};
use log::trace;

/// Operand types and result type chosen for a binary operator.
type BinaryTypes = (TypeRef, TypeRef, TypeRef);

/// The type a literal operand should be treated as: an unsuffixed literal
/// takes the type of a scalar partner of the same numeric family.
fn literal_type(expr: &Expression, other: &Expression) -> TypeRef {
    match expr.kind {
        ExpressionKind::IntLiteral(_) if other.ty.is_scalar() && other.ty.is_integer() => other.ty.clone(),
        ExpressionKind::FloatLiteral(_) if other.ty.is_scalar() && other.ty.is_float() => other.ty.clone(),
        _ => expr.ty.clone(),
    }
}

fn is_matrix_multiply(left: &Type, right: &Type) -> bool {
    (left.is_matrix() && (right.is_matrix() || right.is_vector())) || (left.is_vector() && right.is_matrix())
}

/// Retypes a numeric literal to a scalar type of the same family.
fn retype_literal(expr: &Expression, target: &TypeRef) -> Option<Expression> {
    if !target.is_scalar() {
        return None;
    }
    match expr.kind {
        ExpressionKind::IntLiteral(v) if target.is_integer() => {
            Some(Expression::new(expr.offset, target.clone(), ExpressionKind::IntLiteral(v)))
        }
        ExpressionKind::IntLiteral(v) if target.is_float() => {
            Some(Expression::new(expr.offset, target.clone(), ExpressionKind::FloatLiteral(v as f64)))
        }
        ExpressionKind::FloatLiteral(v) if target.is_float() => {
            Some(Expression::new(expr.offset, target.clone(), ExpressionKind::FloatLiteral(v)))
        }
        _ => None,
    }
}

impl IRGenerator<'_> {
    pub(super) fn convert_expression(&mut self, node: &AstNode) -> Option<Expression> {
        let expr = self.convert_expression_raw(node)?;
        if self.check_valid(&expr) {
            Some(expr)
        } else {
            None
        }
    }

    /// Converts without rejecting bare type and function references, for
    /// positions where those are legal (callees, field and index bases).
    fn convert_expression_raw(&mut self, node: &AstNode) -> Option<Expression> {
        let offset = node.offset;
        match &node.kind {
            AstKind::Bool(b) => Some(Expression::bool_literal(&self.context, offset, *b)),
            AstKind::Int(i) => Some(Expression::new(
                offset,
                self.context.int_literal_type.clone(),
                ExpressionKind::IntLiteral(*i),
            )),
            AstKind::Float(f) => Some(Expression::new(
                offset,
                self.context.float_literal_type.clone(),
                ExpressionKind::FloatLiteral(*f),
            )),
            AstKind::NullLiteral => Some(Expression::new(offset, self.context.null_type.clone(), ExpressionKind::NullLiteral)),
            AstKind::Identifier(name) => self.convert_identifier(offset, name),
            AstKind::Binary(op) => self.convert_binary(node, *op),
            AstKind::Prefix(op) => self.convert_prefix(node, *op),
            AstKind::Postfix(op) => self.convert_postfix(node, *op),
            AstKind::Ternary => self.convert_ternary(node),
            AstKind::Call => self.convert_call(node),
            AstKind::Field(name) => self.convert_field(node, name),
            AstKind::Index => self.convert_index(node),
            other => unreachable!("'{:?}' is not an expression", other),
        }
    }

    fn convert_identifier(&mut self, offset: Offset, name: &str) -> Option<Expression> {
        match self.lookup(name) {
            Some(Symbol::Functions(functions)) => Some(Expression::new(
                offset,
                self.context.invalid_type.clone(),
                ExpressionKind::FunctionReference { functions },
            )),
            Some(Symbol::Variable(id)) => {
                let var = &self.variables[id];
                if var.modifiers.layout.builtin == SK_FRAGCOORD_BUILTIN {
                    self.inputs.rt_flip = true;
                }
                if matches!(var.ty.kind, TypeKind::Enum) {
                    if let Some(value) = &var.initial_value {
                        let mut value = value.clone();
                        value.offset = offset;
                        return Some(value);
                    }
                }
                Some(Expression::variable_reference(offset, var.ty.clone(), id, RefKind::Read))
            }
            Some(Symbol::Field { owner, field_index }) => {
                let base_type = self.variables[owner].ty.clone();
                let ty = base_type.fields()[field_index].ty.clone();
                Some(Expression::new(
                    offset,
                    ty,
                    ExpressionKind::FieldAccess {
                        base: Box::new(Expression::variable_reference(offset, base_type, owner, RefKind::Read)),
                        field_index,
                        owner: FieldOwner::AnonymousInterfaceBlock,
                    },
                ))
            }
            Some(Symbol::Type(value)) => Some(self.type_reference(offset, value)),
            Some(Symbol::External(_)) => {
                self.errors.error(offset, format!("external function '{}' must be called", name));
                None
            }
            None => match self.context.lookup(name) {
                Some(value) => {
                    let value = value.clone();
                    Some(self.type_reference(offset, value))
                }
                None => {
                    self.errors.error(offset, format!("unknown identifier '{}'", name));
                    None
                }
            },
        }
    }

    fn type_reference(&self, offset: Offset, value: TypeRef) -> Expression {
        Expression::new(offset, self.context.invalid_type.clone(), ExpressionKind::TypeReference { value })
    }

    /// Rejects expressions that only make sense as a callee.
    fn check_valid(&mut self, expr: &Expression) -> bool {
        match &expr.kind {
            ExpressionKind::FunctionReference { .. } => {
                self.errors.error(expr.offset, "expected '(' to begin function call");
                false
            }
            ExpressionKind::TypeReference { .. } => {
                self.errors.error(expr.offset, "expected '(' to begin constructor invocation");
                false
            }
            _ if expr.ty == self.context.invalid_type => {
                self.errors.error(expr.offset, "invalid expression");
                false
            }
            _ => true,
        }
    }

    /// Implicitly converts `expr` to `target`, reporting an error when the
    /// types are not coercible.
    pub(super) fn coerce(&mut self, expr: Expression, target: &TypeRef) -> Option<Expression> {
        if expr.ty == *target {
            return Some(expr);
        }
        if !self.check_valid(&expr) {
            return None;
        }
        if let Some(retyped) = retype_literal(&expr, target) {
            return Some(retyped);
        }
        if expr.ty.coercion_cost(target).is_none() {
            self.errors.error(expr.offset, format!("expected '{}', but found '{}'", target, expr.ty));
            return None;
        }
        if target.is_scalar() {
            return self.convert_number_constructor(expr.offset, target, vec![expr]);
        }
        if matches!(expr.kind, ExpressionKind::NullLiteral) || matches!(target.kind, TypeKind::Nullable { .. }) {
            return Some(Expression { ty: target.clone(), ..expr });
        }
        Some(Expression::new(expr.offset, target.clone(), ExpressionKind::Constructor { arguments: vec![expr] }))
    }

    /// Cost of passing `expr` where `target` is expected.
    fn argument_cost(&self, expr: &Expression, target: &TypeRef) -> Option<u32> {
        if expr.ty == *target {
            return Some(0);
        }
        match expr.kind {
            ExpressionKind::IntLiteral(_) if target.is_scalar() && target.is_integer() => Some(1),
            _ => expr.ty.coercion_cost(target),
        }
    }

    // --- operators ---

    fn convert_binary(&mut self, node: &AstNode, op: Operator) -> Option<Expression> {
        let left = self.convert_expression(&node.children[0])?;
        let right = self.convert_expression(&node.children[1])?;
        let (left_type, right_type, result_type) =
            match self.determine_binary_type(op, &literal_type(&left, &right), &literal_type(&right, &left)) {
                Some(types) => types,
                None => {
                    let message = format!("type mismatch: '{}' cannot operate on '{}', '{}'", op, left.ty, right.ty);
                    self.errors.error(node.offset, message);
                    return None;
                }
            };
        let mut left = left;
        if op.is_assignment() {
            let kind = if op == Operator::Eq { RefKind::Write } else { RefKind::ReadWrite };
            if !self.set_ref_kind(&mut left, kind) {
                return None;
            }
        }
        let left = self.coerce(left, &left_type)?;
        let right = self.coerce(right, &right_type)?;
        if !op.is_assignment() {
            let errors_before = self.errors.error_count();
            let folded = ConstantFolder::new(&self.context).fold_binary(self.errors, &left, op, &right);
            if self.errors.error_count() > errors_before {
                return None;
            }
            if let Some(mut folded) = folded {
                trace!("folded '{}' at {}", op, node.offset);
                folded.offset = node.offset;
                return Some(folded);
            }
        }
        Some(Expression::binary(node.offset, left, op, right, result_type))
    }

    /// Picks the operand and result types for `left op right`, or `None` if
    /// the operator does not apply.
    fn determine_binary_type(&self, op: Operator, left: &TypeRef, right: &TypeRef) -> Option<BinaryTypes> {
        self.binary_type(op, left, right, true)
    }

    /// When nothing matches as written, a non-assignment is retried once with
    /// the operands swapped and the operand types swapped back, which covers
    /// `scalar op vector` through the `vector op scalar` rules.
    fn binary_type(&self, op: Operator, left: &TypeRef, right: &TypeRef, try_flipped: bool) -> Option<BinaryTypes> {
        let ctx = &self.context;
        let bool_type = ctx.bool_type.clone();
        let is_assignment = op.is_assignment();
        let (is_relational, vector_op) = match op {
            Operator::Eq => {
                return right.can_coerce_to(left).then(|| (left.clone(), left.clone(), left.clone()));
            }
            Operator::EqEq | Operator::Neq => {
                return if right.can_coerce_to(left) {
                    Some((left.clone(), left.clone(), bool_type))
                } else if left.can_coerce_to(right) {
                    Some((right.clone(), right.clone(), bool_type))
                } else {
                    None
                };
            }
            Operator::Lt | Operator::Gt | Operator::LtEq | Operator::GtEq => (true, false),
            Operator::LogicalAnd
            | Operator::LogicalOr
            | Operator::LogicalXor
            | Operator::LogicalAndEq
            | Operator::LogicalOrEq
            | Operator::LogicalXorEq => {
                let valid = left.can_coerce_to(&bool_type) && right.can_coerce_to(&bool_type);
                return valid.then(|| (bool_type.clone(), bool_type.clone(), bool_type.clone()));
            }
            Operator::Comma => return Some((left.clone(), right.clone(), right.clone())),
            Operator::Star | Operator::StarEq if is_matrix_multiply(left, right) => {
                return self.matrix_multiply_type(op, left, right);
            }
            _ if is_assignment && left.is_scalar() => {
                let valid = right.can_coerce_to(left) && operand_allowed(op, left);
                return valid.then(|| (left.clone(), left.clone(), left.clone()));
            }
            Operator::Plus
            | Operator::Minus
            | Operator::Star
            | Operator::Slash
            | Operator::PlusEq
            | Operator::MinusEq
            | Operator::StarEq
            | Operator::SlashEq => (false, true),
            _ => (false, false),
        };

        if (left.is_vector() || left.is_matrix()) && vector_op && right.is_scalar() {
            let (l, r, result) = self.binary_type(op, &left.component_ref(), right, try_flipped)?;
            let l = ctx.compound(&l, left.columns(), left.rows())?;
            let result = ctx.compound(&result, left.columns(), left.rows())?;
            return Some((l, r, result));
        }

        let right_to_left = right.coercion_cost(left);
        let left_to_right = if is_assignment { None } else { left.coercion_cost(right) };
        let use_left = match (right_to_left, left_to_right) {
            (None, None) if try_flipped && !is_assignment => {
                let (r, l, result) = self.binary_type(op, right, left, false)?;
                return Some((l, r, result));
            }
            (None, None) => return None,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (Some(a), Some(b)) => {
                a < b || (a == b && left.component_type().priority() >= right.component_type().priority())
            }
        };
        let chosen = if use_left { left.clone() } else { right.clone() };
        if !operand_allowed(op, &chosen) {
            return None;
        }
        if is_relational {
            if !chosen.is_number() {
                return None;
            }
            return Some((chosen.clone(), chosen, bool_type));
        }
        Some((chosen.clone(), chosen.clone(), chosen))
    }

    fn matrix_multiply_type(&self, op: Operator, left: &TypeRef, right: &TypeRef) -> Option<BinaryTypes> {
        let ctx = &self.context;
        let (_, _, component) = self.determine_binary_type(Operator::Star, &left.component_ref(), &right.component_ref())?;
        let left_type = ctx.compound(&component, left.columns(), left.rows())?;
        let right_type = ctx.compound(&component, right.columns(), right.rows())?;
        let (left_columns, left_rows) = (left.columns(), left.rows());
        // a vector on the right is a column vector
        let (right_columns, right_rows) =
            if right.is_vector() { (1, right.columns()) } else { (right.columns(), right.rows()) };
        let result = if right_columns > 1 {
            ctx.compound(&component, right_columns, left_rows)?
        } else {
            ctx.compound(&component, left_rows, 1)?
        };
        if op == Operator::StarEq && (result.columns() != left_columns || result.rows() != left_rows) {
            return None;
        }
        (left_columns == right_rows).then(|| (left_type, right_type, result))
    }

    fn convert_prefix(&mut self, node: &AstNode, op: Operator) -> Option<Expression> {
        let mut operand = self.convert_expression(&node.children[0])?;
        let ty = operand.ty.clone();
        let component = ty.component_type();
        let valid = match op {
            Operator::Plus => ty.is_number() || (ty.is_vector() && component.is_number()),
            Operator::Minus => {
                if let Some(folded) = ConstantFolder::new(&self.context).fold_prefix(op, &operand) {
                    return Some(Expression { offset: node.offset, ..folded });
                }
                ty.is_number() || ((ty.is_vector() || ty.is_matrix()) && component.is_number())
            }
            Operator::PlusPlus | Operator::MinusMinus => {
                if !ty.is_number() {
                    self.errors.error(node.offset, format!("'{}' cannot operate on '{}'", op, ty));
                    return None;
                }
                if !self.set_ref_kind(&mut operand, RefKind::ReadWrite) {
                    return None;
                }
                true
            }
            Operator::LogicalNot => {
                if let Some(folded) = ConstantFolder::new(&self.context).fold_prefix(op, &operand) {
                    return Some(Expression { offset: node.offset, ..folded });
                }
                ty.is_boolean()
            }
            Operator::BitwiseNot => component.is_integer() && (ty.is_scalar() || ty.is_vector()),
            _ => unreachable!("'{}' is not a prefix operator", op),
        };
        if !valid {
            self.errors.error(node.offset, format!("'{}' cannot operate on '{}'", op, ty));
            return None;
        }
        if op == Operator::Plus {
            return Some(operand);
        }
        Some(Expression::new(node.offset, ty, ExpressionKind::Prefix { op, operand: Box::new(operand) }))
    }

    fn convert_postfix(&mut self, node: &AstNode, op: Operator) -> Option<Expression> {
        let mut operand = self.convert_expression(&node.children[0])?;
        if !operand.ty.is_number() {
            self.errors.error(node.offset, format!("'{}' cannot operate on '{}'", op, operand.ty));
            return None;
        }
        if !self.set_ref_kind(&mut operand, RefKind::ReadWrite) {
            return None;
        }
        let ty = operand.ty.clone();
        Some(Expression::new(node.offset, ty, ExpressionKind::Postfix { operand: Box::new(operand), op }))
    }

    fn convert_ternary(&mut self, node: &AstNode) -> Option<Expression> {
        let test = self.convert_expression(&node.children[0])?;
        let bool_type = self.context.bool_type.clone();
        let test = self.coerce(test, &bool_type)?;
        let if_true = self.convert_expression(&node.children[1])?;
        let if_false = self.convert_expression(&node.children[2])?;
        let types = self.determine_binary_type(
            Operator::EqEq,
            &literal_type(&if_true, &if_false),
            &literal_type(&if_false, &if_true),
        );
        let (true_type, false_type) = match types {
            Some((t, f, _)) => (t, f),
            None => {
                let message = format!("ternary operator result mismatch: '{}', '{}'", if_true.ty, if_false.ty);
                self.errors.error(node.offset, message);
                return None;
            }
        };
        let if_true = self.coerce(if_true, &true_type)?;
        let if_false = self.coerce(if_false, &false_type)?;
        if let Some(value) = test.as_bool() {
            return Some(if value { if_true } else { if_false });
        }
        Some(Expression::new(
            node.offset,
            true_type,
            ExpressionKind::Ternary { test: Box::new(test), if_true: Box::new(if_true), if_false: Box::new(if_false) },
        ))
    }

    // --- field access, swizzles and indexing ---

    fn convert_field(&mut self, node: &AstNode, name: &str) -> Option<Expression> {
        let base = self.convert_expression_raw(&node.children[0])?;
        if let ExpressionKind::TypeReference { value } = &base.kind {
            let value = value.clone();
            return self.convert_type_field(node.offset, &value, name);
        }
        if base.ty == self.context.sk_caps_type {
            return self.get_cap(node.offset, name);
        }
        if !self.check_valid(&base) {
            return None;
        }
        match &base.ty.kind {
            TypeKind::Struct { fields } => match fields.iter().position(|f| f.name == name) {
                Some(field_index) => {
                    let ty = fields[field_index].ty.clone();
                    Some(Expression::new(
                        node.offset,
                        ty,
                        ExpressionKind::FieldAccess { base: Box::new(base), field_index, owner: FieldOwner::Default },
                    ))
                }
                None => {
                    let message = format!("type '{}' does not have a field named '{}'", base.ty, name);
                    self.errors.error(node.offset, message);
                    None
                }
            },
            TypeKind::Other => {
                let message = format!("type '{}' does not have a field named '{}'", base.ty, name);
                self.errors.error(node.offset, message);
                None
            }
            _ => self.convert_swizzle(node.offset, base, name),
        }
    }

    /// `Enum::CASE` (or `Enum.CASE`) resolves to the case's value.
    fn convert_type_field(&mut self, offset: Offset, ty: &TypeRef, name: &str) -> Option<Expression> {
        if let Some(&symbols) = self.enum_symbols.get(&ty.name) {
            if let Some(Symbol::Variable(id)) = self.symbol_tables.lookup_local(symbols, name) {
                if let Some(value) = &self.variables[*id].initial_value {
                    return Some(Expression { offset, ..value.clone() });
                }
            }
        }
        self.errors.error(offset, format!("type '{}' does not have a field named '{}'", ty, name));
        None
    }

    fn get_cap(&mut self, offset: Offset, name: &str) -> Option<Expression> {
        let value = match self.settings.cap_values.get(name) {
            Some(CapValue::Bool(b)) => Expression::bool_literal(&self.context, offset, *b),
            Some(CapValue::Int(i)) => Expression::int_literal(&self.context, offset, *i),
            Some(CapValue::Float(f)) => Expression::float_literal(&self.context, offset, *f),
            None => {
                self.errors.error(offset, format!("unknown capability flag '{}'", name));
                return None;
            }
        };
        Some(Expression::new(
            offset,
            value.ty.clone(),
            ExpressionKind::Setting { name: name.to_string(), value: Box::new(value) },
        ))
    }

    fn convert_swizzle(&mut self, offset: Offset, base: Expression, mask: &str) -> Option<Expression> {
        if !base.ty.is_vector() {
            self.errors.error(offset, format!("cannot swizzle value of type '{}'", base.ty));
            return None;
        }
        let columns = base.ty.columns();
        let mut components = Vec::with_capacity(mask.len());
        let mut seen_constant = false;
        for c in mask.chars() {
            let component = match c {
                '0' => SWIZZLE_ZERO,
                '1' => SWIZZLE_ONE,
                'x' | 'r' | 's' => 0,
                'y' | 'g' | 't' => 1,
                'z' | 'b' | 'p' => 2,
                'w' | 'a' | 'q' => 3,
                _ => -3,
            };
            if component == -3 || (component >= 0 && component as usize >= columns) {
                self.errors.error(offset, format!("invalid swizzle component '{}'", c));
                return None;
            }
            if component >= 0 && seen_constant {
                self.errors.error(offset, "only the last swizzle component can be a constant");
                return None;
            }
            seen_constant |= component < 0;
            components.push(component);
        }
        if components.len() > 4 {
            self.errors.error(offset, format!("too many components in swizzle mask '{}'", mask));
            return None;
        }
        if components.iter().all(|c| *c < 0) {
            self.errors.error(offset, "swizzle must refer to base expression");
            return None;
        }
        let ty = self.context.compound(base.ty.component_type(), components.len(), 1)?;
        Some(Expression::new(offset, ty, ExpressionKind::Swizzle { base: Box::new(base), components }))
    }

    fn convert_index(&mut self, node: &AstNode) -> Option<Expression> {
        let base = self.convert_expression_raw(&node.children[0])?;
        if let ExpressionKind::TypeReference { value } = &base.kind {
            let value = value.clone();
            let count = match node.children.get(1) {
                Some(size) => self.array_size(size)?,
                None => None,
            };
            return Some(self.type_reference(node.offset, Type::new_array(&value, count)));
        }
        if !self.check_valid(&base) {
            return None;
        }
        let index_node = match node.optional_child(1) {
            Some(index_node) => index_node,
            None => {
                self.errors.error(node.offset, "missing index in '[]'");
                return None;
            }
        };
        let index = self.convert_expression(index_node)?;
        let index = if index.ty.is_unsigned() {
            index
        } else {
            let int = self.context.int_type.clone();
            self.coerce(index, &int)?
        };
        let (element, bound) = match &base.ty.kind {
            TypeKind::Array { component, count } => (component.clone(), *count),
            TypeKind::Matrix { component, columns, rows } => (self.context.compound(component, *rows, 1)?, Some(*columns)),
            TypeKind::Vector { component, columns } => (component.clone(), Some(*columns)),
            _ => {
                self.errors.error(node.offset, format!("expected array, but found '{}'", base.ty));
                return None;
            }
        };
        if let (Some(i), Some(bound)) = (index.as_int(), bound) {
            if i < 0 || i as usize >= bound {
                self.errors.error(index.offset, format!("index {} out of range for '{}'", i, base.ty));
                return None;
            }
        }
        Some(Expression::new(
            node.offset,
            element,
            ExpressionKind::Index { base: Box::new(base), index: Box::new(index) },
        ))
    }

    // --- calls ---

    fn convert_call(&mut self, node: &AstNode) -> Option<Expression> {
        let callee_node = &node.children[0];
        if let AstKind::Identifier(name) = &callee_node.kind {
            if let Some(Symbol::External(id)) = self.lookup(name) {
                let arguments = self.convert_arguments(&node.children[1..])?;
                return self.call_external(node.offset, id, arguments);
            }
        }
        let callee = self.convert_expression_raw(callee_node)?;
        let arguments = self.convert_arguments(&node.children[1..])?;
        self.call(node.offset, callee, arguments)
    }

    fn convert_arguments(&mut self, nodes: &[AstNode]) -> Option<Vec<Expression>> {
        nodes.iter().map(|n| self.convert_expression(n)).collect()
    }

    /// Calls a function reference or constructs a type reference.
    pub(super) fn call(&mut self, offset: Offset, callee: Expression, arguments: Vec<Expression>) -> Option<Expression> {
        let description = self.describe(&callee);
        match callee.kind {
            ExpressionKind::TypeReference { value } => self.convert_constructor(offset, &value, arguments),
            ExpressionKind::FunctionReference { functions } => {
                if let [function] = functions.as_slice() {
                    return self.call_function(offset, *function, arguments);
                }
                let mut best: Option<(FuncId, u32)> = None;
                for function in functions {
                    if let Some(cost) = self.call_cost(function, &arguments) {
                        if best.map_or(true, |(_, best_cost)| cost < best_cost) {
                            best = Some((function, cost));
                        }
                    }
                }
                match best {
                    Some((function, _)) => self.call_function(offset, function, arguments),
                    None => {
                        let message = format!("no match for {}({})", description, self.describe_types(&arguments));
                        self.errors.error(offset, message);
                        None
                    }
                }
            }
            _ => {
                self.errors.error(offset, format!("'{}' is not a function", description));
                None
            }
        }
    }

    fn describe_types(&self, arguments: &[Expression]) -> String {
        arguments.iter().map(|a| a.ty.name.clone()).collect::<Vec<_>>().join(", ")
    }

    fn call_cost(&self, function: FuncId, arguments: &[Expression]) -> Option<u32> {
        if self.functions[function].parameters.len() != arguments.len() {
            return None;
        }
        let (parameter_types, _) = self.determine_final_types(function, arguments)?;
        arguments
            .iter()
            .zip(&parameter_types)
            .map(|(arg, ty)| self.argument_cost(arg, ty))
            .sum()
    }

    /// Resolves generic parameter and return types against the arguments.
    /// Every generic in one signature resolves to the same position in its
    /// list of candidates, picked by the first generic parameter.
    fn determine_final_types(&self, function: FuncId, arguments: &[Expression]) -> Option<(Vec<TypeRef>, TypeRef)> {
        let declaration = &self.functions[function];
        let mut generic_index: Option<usize> = None;
        let mut types = Vec::with_capacity(arguments.len());
        for (param, arg) in declaration.parameters.iter().zip(arguments) {
            let ty = &self.variables[*param].ty;
            if !ty.is_generic() {
                types.push(ty.clone());
                continue;
            }
            let coercibles = ty.coercibles();
            let index = match generic_index {
                Some(index) => index,
                None => {
                    let index = coercibles.iter().position(|t| self.argument_cost(arg, t).is_some())?;
                    generic_index = Some(index);
                    index
                }
            };
            types.push(coercibles.get(index)?.clone());
        }
        let return_type = if declaration.return_type.is_generic() {
            declaration.return_type.coercibles().get(generic_index?)?.clone()
        } else {
            declaration.return_type.clone()
        };
        Some((types, return_type))
    }

    fn call_function(&mut self, offset: Offset, function: FuncId, arguments: Vec<Expression>) -> Option<Expression> {
        let declaration = &self.functions[function];
        let (name, builtin) = (declaration.name.clone(), declaration.builtin);
        let parameters = declaration.parameters.clone();
        if parameters.len() != arguments.len() {
            let message = format!(
                "call to '{}' expected {} argument{}, but found {}",
                name,
                parameters.len(),
                if parameters.len() == 1 { "" } else { "s" },
                arguments.len()
            );
            self.errors.error(offset, message);
            return None;
        }
        let (parameter_types, return_type) = match self.determine_final_types(function, &arguments) {
            Some(types) => types,
            None => {
                let message = format!("no match for {}({})", name, self.describe_types(&arguments));
                self.errors.error(offset, message);
                return None;
            }
        };
        let mut converted = Vec::with_capacity(arguments.len());
        for ((arg, ty), param) in arguments.into_iter().zip(&parameter_types).zip(&parameters) {
            let mut arg = self.coerce(arg, ty)?;
            let flags = self.variables[*param].modifiers.flags;
            if flags & Modifiers::OUT != 0 {
                let kind = if flags & Modifiers::IN != 0 { RefKind::ReadWrite } else { RefKind::Pointer };
                if !self.set_ref_kind(&mut arg, kind) {
                    return None;
                }
            }
            converted.push(arg);
        }
        if builtin && name == "dFdy" {
            self.inputs.rt_flip = true;
        }
        Some(Expression::new(offset, return_type, ExpressionKind::FunctionCall { function, arguments: converted }))
    }

    fn call_external(&mut self, offset: Offset, function: ExternalId, arguments: Vec<Expression>) -> Option<Expression> {
        let external = self.externals[function].clone();
        if external.parameters.len() != arguments.len() {
            let message = format!(
                "call to '{}' expected {} argument{}, but found {}",
                external.name,
                external.parameters.len(),
                if external.parameters.len() == 1 { "" } else { "s" },
                arguments.len()
            );
            self.errors.error(offset, message);
            return None;
        }
        let mut converted = Vec::with_capacity(arguments.len());
        for (arg, ty) in arguments.into_iter().zip(&external.parameters) {
            converted.push(self.coerce(arg, ty)?);
        }
        Some(Expression::new(
            offset,
            external.return_type,
            ExpressionKind::ExternalFunctionCall { function, arguments: converted },
        ))
    }

    // --- constructors ---

    fn convert_constructor(&mut self, offset: Offset, ty: &TypeRef, arguments: Vec<Expression>) -> Option<Expression> {
        if arguments.len() == 1 && arguments[0].ty == *ty && !ty.is_opaque() {
            return arguments.into_iter().next();
        }
        if ty.is_scalar() && ty.is_number() {
            return self.convert_number_constructor(offset, ty, arguments);
        }
        if ty.is_scalar() && ty.is_boolean() {
            return self.convert_bool_constructor(offset, ty, arguments);
        }
        match &ty.kind {
            TypeKind::Array { component, count } => {
                if let Some(count) = count {
                    if *count != arguments.len() {
                        let message = format!(
                            "invalid arguments to '{}' constructor (expected {} elements, but found {})",
                            ty,
                            count,
                            arguments.len()
                        );
                        self.errors.error(offset, message);
                        return None;
                    }
                }
                let component = component.clone();
                let arguments =
                    arguments.into_iter().map(|a| self.coerce(a, &component)).collect::<Option<Vec<_>>>()?;
                let ty = Type::new_array(&component, Some(arguments.len()));
                Some(Expression::new(offset, ty, ExpressionKind::Constructor { arguments }))
            }
            TypeKind::Vector { .. } | TypeKind::Matrix { .. } => self.convert_compound_constructor(offset, ty, arguments),
            TypeKind::Struct { fields } => {
                if fields.len() != arguments.len() {
                    let message = format!(
                        "invalid arguments to '{}' constructor (expected {} elements, but found {})",
                        ty,
                        fields.len(),
                        arguments.len()
                    );
                    self.errors.error(offset, message);
                    return None;
                }
                let field_types: Vec<TypeRef> = fields.iter().map(|f| f.ty.clone()).collect();
                let arguments = arguments
                    .into_iter()
                    .zip(&field_types)
                    .map(|(a, t)| self.coerce(a, t))
                    .collect::<Option<Vec<_>>>()?;
                Some(Expression::new(offset, ty.clone(), ExpressionKind::Constructor { arguments }))
            }
            _ => {
                self.errors.error(offset, format!("cannot construct '{}'", ty));
                None
            }
        }
    }

    fn convert_number_constructor(&mut self, offset: Offset, ty: &TypeRef, arguments: Vec<Expression>) -> Option<Expression> {
        if arguments.len() != 1 {
            let message = format!(
                "invalid arguments to '{}' constructor, (expected exactly 1 argument, but found {})",
                ty,
                arguments.len()
            );
            self.errors.error(offset, message);
            return None;
        }
        let arg = arguments.into_iter().next()?;
        if arg.ty == *ty {
            return Some(arg);
        }
        let literal = |kind| Expression::new(offset, ty.clone(), kind);
        match (&arg.constant_value().kind, ty.is_float()) {
            (ExpressionKind::IntLiteral(v), true) => return Some(literal(ExpressionKind::FloatLiteral(*v as f64))),
            (ExpressionKind::FloatLiteral(v), true) => return Some(literal(ExpressionKind::FloatLiteral(*v))),
            (ExpressionKind::IntLiteral(v), false) => return Some(literal(ExpressionKind::IntLiteral(*v))),
            (ExpressionKind::FloatLiteral(v), false) => return Some(literal(ExpressionKind::IntLiteral(*v as i64))),
            (ExpressionKind::BoolLiteral(b), true) => {
                return Some(literal(ExpressionKind::FloatLiteral(if *b { 1.0 } else { 0.0 })))
            }
            (ExpressionKind::BoolLiteral(b), false) => return Some(literal(ExpressionKind::IntLiteral(*b as i64))),
            _ => {}
        }
        if arg.ty.is_scalar() && arg.ty.is_boolean() {
            let (one, zero) = if ty.is_float() {
                (ExpressionKind::FloatLiteral(1.0), ExpressionKind::FloatLiteral(0.0))
            } else {
                (ExpressionKind::IntLiteral(1), ExpressionKind::IntLiteral(0))
            };
            return Some(Expression::new(
                offset,
                ty.clone(),
                ExpressionKind::Ternary {
                    test: Box::new(arg),
                    if_true: Box::new(literal(one)),
                    if_false: Box::new(literal(zero)),
                },
            ));
        }
        if !arg.ty.is_number() {
            let message = format!(
                "invalid argument to '{}' constructor (expected a number or bool, but found '{}')",
                ty, arg.ty
            );
            self.errors.error(offset, message);
            return None;
        }
        Some(Expression::new(offset, ty.clone(), ExpressionKind::Constructor { arguments: vec![arg] }))
    }

    fn convert_bool_constructor(&mut self, offset: Offset, ty: &TypeRef, arguments: Vec<Expression>) -> Option<Expression> {
        if arguments.len() != 1 {
            let message = format!(
                "invalid arguments to '{}' constructor, (expected exactly 1 argument, but found {})",
                ty,
                arguments.len()
            );
            self.errors.error(offset, message);
            return None;
        }
        let arg = arguments.into_iter().next()?;
        match arg.constant_value().kind {
            ExpressionKind::IntLiteral(v) => return Some(Expression::bool_literal(&self.context, offset, v != 0)),
            ExpressionKind::FloatLiteral(v) => return Some(Expression::bool_literal(&self.context, offset, v != 0.0)),
            _ => {}
        }
        if !arg.ty.is_number() {
            let message = format!(
                "invalid argument to '{}' constructor (expected a number or bool, but found '{}')",
                ty, arg.ty
            );
            self.errors.error(offset, message);
            return None;
        }
        Some(Expression::new(offset, ty.clone(), ExpressionKind::Constructor { arguments: vec![arg] }))
    }

    fn convert_compound_constructor(&mut self, offset: Offset, ty: &TypeRef, arguments: Vec<Expression>) -> Option<Expression> {
        let component = ty.component_ref();
        if ty.is_matrix() && arguments.len() == 1 && arguments[0].ty.is_matrix() {
            return Some(Expression::new(offset, ty.clone(), ExpressionKind::Constructor { arguments }));
        }
        if arguments.len() == 1 && (arguments[0].ty.is_scalar() || matches!(arguments[0].ty.kind, TypeKind::Enum)) {
            let arg = arguments.into_iter().next()?;
            let arg = self.coerce_component(arg, &component)?;
            return Some(Expression::new(offset, ty.clone(), ExpressionKind::Constructor { arguments: vec![arg] }));
        }
        let mut actual = 0;
        let mut converted = Vec::with_capacity(arguments.len());
        for arg in arguments {
            if arg.ty.is_scalar() || matches!(arg.ty.kind, TypeKind::Enum) {
                actual += 1;
                converted.push(self.coerce_component(arg, &component)?);
            } else if arg.ty.is_vector() || arg.ty.is_matrix() {
                let arg_component = arg.ty.component_type();
                if arg_component.is_number() != component.is_number() {
                    let message = format!("'{}' is not a valid parameter to '{}' constructor", arg.ty, ty);
                    self.errors.error(arg.offset, message);
                    return None;
                }
                actual += arg.ty.slot_count();
                if *arg_component != *component {
                    // explicit conversion between vector component types
                    let target = self.context.compound(&component, arg.ty.columns(), arg.ty.rows())?;
                    converted.push(Expression::new(arg.offset, target, ExpressionKind::Constructor { arguments: vec![arg] }));
                } else {
                    converted.push(arg);
                }
            } else {
                let message = format!("'{}' is not a valid parameter to '{}' constructor", arg.ty, ty);
                self.errors.error(arg.offset, message);
                return None;
            }
        }
        if actual != ty.slot_count() {
            let message = format!(
                "invalid arguments to '{}' constructor (expected {} scalars, but found {})",
                ty,
                ty.slot_count(),
                actual
            );
            self.errors.error(offset, message);
            return None;
        }
        Some(Expression::new(offset, ty.clone(), ExpressionKind::Constructor { arguments: converted }))
    }

    /// Scalars inside a vector or matrix constructor convert explicitly.
    fn coerce_component(&mut self, arg: Expression, component: &TypeRef) -> Option<Expression> {
        if arg.ty.can_coerce_to(component) || retype_literal(&arg, component).is_some() {
            return self.coerce(arg, component);
        }
        if component.is_boolean() {
            let offset = arg.offset;
            return self.convert_bool_constructor(offset, component, vec![arg]);
        }
        let offset = arg.offset;
        self.convert_number_constructor(offset, component, vec![arg])
    }

    // --- lvalues ---

    /// Marks the variable under an assignable expression with `kind`.
    pub(super) fn set_ref_kind(&mut self, expr: &mut Expression, kind: RefKind) -> bool {
        match &mut expr.kind {
            ExpressionKind::VariableReference { variable, ref_kind } => {
                let var = &self.variables[*variable];
                if var.modifiers.has(Modifiers::CONST) || var.modifiers.has(Modifiers::UNIFORM) {
                    let message = format!("cannot modify immutable variable '{}'", var.name);
                    self.errors.error(expr.offset, message);
                    return false;
                }
                *ref_kind = kind;
                true
            }
            ExpressionKind::FieldAccess { base, .. } | ExpressionKind::Index { base, .. } => self.set_ref_kind(base, kind),
            ExpressionKind::Swizzle { base, components } => {
                if components.iter().any(|c| *c < 0) {
                    self.errors.error(expr.offset, "cannot write to a swizzle mask containing a constant");
                    return false;
                }
                let mut seen = [false; 4];
                for c in components.iter() {
                    if std::mem::replace(&mut seen[*c as usize], true) {
                        self.errors.error(expr.offset, "cannot write to the same swizzle field more than once");
                        return false;
                    }
                }
                self.set_ref_kind(base, kind)
            }
            ExpressionKind::Ternary { if_true, if_false, .. } => {
                self.set_ref_kind(if_true, kind) && self.set_ref_kind(if_false, kind)
            }
            _ => {
                let message = format!("cannot assign to '{}'", self.describe(expr));
                self.errors.error(expr.offset, message);
                false
            }
        }
    }
}

/// Operand restrictions beyond type agreement: arithmetic needs numbers,
/// bitwise and shift operators need integers.
fn operand_allowed(op: Operator, ty: &Type) -> bool {
    let component = ty.component_type();
    match op.remove_assignment() {
        Operator::Plus | Operator::Minus | Operator::Star | Operator::Slash => {
            component.is_number() && (ty.is_scalar() || ty.is_vector() || ty.is_matrix() || matches!(ty.kind, TypeKind::Enum))
        }
        Operator::Percent
        | Operator::Shl
        | Operator::Shr
        | Operator::BitwiseAnd
        | Operator::BitwiseOr
        | Operator::BitwiseXor => component.is_integer() && (ty.is_scalar() || ty.is_vector() || matches!(ty.kind, TypeKind::Enum)),
        _ => true,
    }
}
