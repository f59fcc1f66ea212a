//! Compile-time evaluation of binary and prefix expressions.
//!
//! The IR generator calls into the folder after both operands have been
//! coerced. Folding needs both operands to be compile-time constants, except
//! for the boolean short-circuit forms where one literal side decides the
//! result on its own.

use crate::error::ErrorReporter;
use crate::ir::{Expression, ExpressionKind, Operator};
use crate::types::{Context, TypeRef};
use log::trace;

/// Evaluates constant expressions over a shared type context.
pub struct ConstantFolder<'a> {
    context: &'a Context,
}

impl<'a> ConstantFolder<'a> {
    pub fn new(context: &'a Context) -> Self {
        ConstantFolder { context }
    }

    /// Folds `left op right` if possible. Division or modulo by zero and
    /// out-of-range shifts are reported as errors and yield `None`.
    pub fn fold_binary(
        &self,
        errors: &mut ErrorReporter,
        left: &Expression,
        op: Operator,
        right: &Expression,
    ) -> Option<Expression> {
        if left.as_bool().is_some() && !right.is_compile_time_constant() {
            return self.short_circuit(left, op, right);
        }
        if right.as_bool().is_some() && !left.is_compile_time_constant() {
            // expressions have no side effects that could be skipped, so the
            // operands may be considered in either order
            return self.short_circuit(right, op, left);
        }
        if !left.is_compile_time_constant() || !right.is_compile_time_constant() {
            return None;
        }
        let offset = left.offset;
        let (l, r) = (left.constant_value(), right.constant_value());
        match (&l.kind, &r.kind) {
            (ExpressionKind::BoolLiteral(a), ExpressionKind::BoolLiteral(b)) => {
                let result = match op {
                    Operator::LogicalAnd => *a && *b,
                    Operator::LogicalOr => *a || *b,
                    Operator::LogicalXor => *a ^ *b,
                    Operator::EqEq => a == b,
                    Operator::Neq => a != b,
                    _ => return None,
                };
                Some(Expression::bool_literal(self.context, offset, result))
            }
            (ExpressionKind::IntLiteral(a), ExpressionKind::IntLiteral(b)) => {
                self.fold_int(errors, left, *a, op, *b, right.offset)
            }
            (ExpressionKind::FloatLiteral(a), ExpressionKind::FloatLiteral(b)) => {
                self.fold_float(errors, &left.ty, offset, *a, op, *b, right.offset)
            }
            _ => self.fold_compound(errors, l, op, r),
        }
    }

    fn short_circuit(&self, literal: &Expression, op: Operator, other: &Expression) -> Option<Expression> {
        let value = literal.as_bool()?;
        trace!("short-circuit fold of {} with constant {}", op, value);
        match (op, value) {
            (Operator::LogicalAnd, true) | (Operator::LogicalOr, false) => Some(other.clone()),
            (Operator::LogicalAnd, false) | (Operator::LogicalOr, true) => {
                Some(Expression::bool_literal(self.context, literal.offset, value))
            }
            _ => None,
        }
    }

    fn fold_int(
        &self,
        errors: &mut ErrorReporter,
        left: &Expression,
        a: i64,
        op: Operator,
        b: i64,
        right_offset: i32,
    ) -> Option<Expression> {
        let unsigned = left.ty.is_unsigned();
        let offset = left.offset;
        let wrap = |v: i64| if unsigned { v as u32 as i64 } else { v as i32 as i64 };
        let int = |v: i64| Expression::new(offset, left.ty.clone(), ExpressionKind::IntLiteral(wrap(v)));
        let boolean = |v: bool| Expression::bool_literal(self.context, offset, v);
        let (a, b) = (wrap(a), wrap(b));
        Some(match op {
            Operator::Plus => int(a.wrapping_add(b)),
            Operator::Minus => int(a.wrapping_sub(b)),
            Operator::Star => int(a.wrapping_mul(b)),
            Operator::Slash | Operator::Percent => {
                if b == 0 {
                    errors.error(right_offset, "division by zero");
                    return None;
                }
                if op == Operator::Slash {
                    int(a.wrapping_div(b))
                } else {
                    int(a.wrapping_rem(b))
                }
            }
            Operator::BitwiseAnd => int(a & b),
            Operator::BitwiseOr => int(a | b),
            Operator::BitwiseXor => int(a ^ b),
            Operator::Shl | Operator::Shr => {
                if !(0..=31).contains(&b) {
                    errors.error(right_offset, "shift value out of range");
                    return None;
                }
                if op == Operator::Shl {
                    int(a << b)
                } else if unsigned {
                    int((a as u32 >> b) as i64)
                } else {
                    int(((a as i32) >> b) as i64)
                }
            }
            Operator::EqEq => boolean(a == b),
            Operator::Neq => boolean(a != b),
            Operator::Gt => boolean(a > b),
            Operator::GtEq => boolean(a >= b),
            Operator::Lt => boolean(a < b),
            Operator::LtEq => boolean(a <= b),
            _ => return None,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn fold_float(
        &self,
        errors: &mut ErrorReporter,
        ty: &TypeRef,
        offset: i32,
        a: f64,
        op: Operator,
        b: f64,
        right_offset: i32,
    ) -> Option<Expression> {
        let float = |v: f64| Expression::new(offset, ty.clone(), ExpressionKind::FloatLiteral(v));
        let boolean = |v: bool| Expression::bool_literal(self.context, offset, v);
        Some(match op {
            Operator::Plus => float(a + b),
            Operator::Minus => float(a - b),
            Operator::Star => float(a * b),
            Operator::Slash => {
                if b == 0.0 {
                    errors.error(right_offset, "division by zero");
                    return None;
                }
                float(a / b)
            }
            Operator::EqEq => boolean(a == b),
            Operator::Neq => boolean(a != b),
            Operator::Gt => boolean(a > b),
            Operator::GtEq => boolean(a >= b),
            Operator::Lt => boolean(a < b),
            Operator::LtEq => boolean(a <= b),
            _ => return None,
        })
    }

    /// Componentwise float vector arithmetic, and equality of constant
    /// vectors and matrices.
    fn fold_compound(
        &self,
        errors: &mut ErrorReporter,
        left: &Expression,
        op: Operator,
        right: &Expression,
    ) -> Option<Expression> {
        if left.ty != right.ty || !(left.ty.is_vector() || left.ty.is_matrix()) {
            return None;
        }
        match op {
            Operator::EqEq => {
                let equal = left.compare_constant(right)?;
                return Some(Expression::bool_literal(self.context, -1, equal));
            }
            Operator::Neq => {
                let equal = left.compare_constant(right)?;
                return Some(Expression::bool_literal(self.context, -1, !equal));
            }
            _ => {}
        }
        if !left.ty.is_vector() || !left.ty.component_type().is_float() {
            return None;
        }
        let component = left.ty.component_ref();
        let mut arguments = Vec::with_capacity(left.ty.columns());
        for i in 0..left.ty.columns() {
            let a = left.constant_float_component(i)?;
            let b = right.constant_float_component(i)?;
            let value = match op {
                Operator::Plus => a + b,
                Operator::Minus => a - b,
                Operator::Star => a * b,
                Operator::Slash => {
                    if b == 0.0 {
                        errors.error(right.offset, "division by zero");
                        return None;
                    }
                    a / b
                }
                _ => return None,
            };
            arguments.push(Expression::new(-1, component.clone(), ExpressionKind::FloatLiteral(value)));
        }
        Some(Expression::new(-1, left.ty.clone(), ExpressionKind::Constructor { arguments }))
    }

    /// Folds `-literal` and `!literal`. Other prefix forms are left alone.
    pub fn fold_prefix(&self, op: Operator, operand: &Expression) -> Option<Expression> {
        let offset = operand.offset;
        match (op, &operand.constant_value().kind) {
            (Operator::Minus, ExpressionKind::IntLiteral(i)) => Some(Expression::new(
                offset,
                operand.ty.clone(),
                ExpressionKind::IntLiteral(i.wrapping_neg()),
            )),
            (Operator::Minus, ExpressionKind::FloatLiteral(f)) => Some(Expression::new(
                offset,
                operand.ty.clone(),
                ExpressionKind::FloatLiteral(-f),
            )),
            (Operator::LogicalNot, ExpressionKind::BoolLiteral(b)) => {
                Some(Expression::bool_literal(self.context, offset, !b))
            }
            _ => None,
        }
    }
}
