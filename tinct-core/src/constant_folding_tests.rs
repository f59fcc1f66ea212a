#![cfg(test)]

use crate::arena::Arena;
use crate::constant_folding::ConstantFolder;
use crate::error::ErrorReporter;
use crate::ir::{Expression, ExpressionKind, Operator, RefKind, Storage, Variable};
use crate::modifiers::Modifiers;
use crate::types::Context;

fn non_constant_bool(ctx: &Context) -> Expression {
    let mut vars = Arena::new();
    let x = vars.append(Variable::new(0, Modifiers::default(), "x", ctx.bool_type.clone(), Storage::Local));
    Expression::variable_reference(7, ctx.bool_type.clone(), x, RefKind::Read)
}

fn float3(ctx: &Context, values: [f64; 3]) -> Expression {
    Expression::new(
        0,
        ctx.float_vector(3),
        ExpressionKind::Constructor {
            arguments: values.iter().map(|v| Expression::float_literal(ctx, 0, *v)).collect(),
        },
    )
}

#[test]
fn test_fold_float_multiplication() {
    let ctx = Context::new();
    let folder = ConstantFolder::new(&ctx);
    let mut errors = ErrorReporter::new();

    let result = folder
        .fold_binary(
            &mut errors,
            &Expression::float_literal(&ctx, 0, 3.0),
            Operator::Star,
            &Expression::float_literal(&ctx, 4, 2.0),
        )
        .unwrap();

    match result.kind {
        ExpressionKind::FloatLiteral(v) => assert_eq!(v, 6.0),
        other => panic!("Expected folded float literal, got {:?}", other),
    }
    assert_eq!(result.ty, ctx.float_type);
}

#[test]
fn test_fold_integer_operators_match_host_arithmetic() {
    let ctx = Context::new();
    let folder = ConstantFolder::new(&ctx);
    let mut errors = ErrorReporter::new();
    let pairs = [(10, 32), (-7, 3), (255, 4), (0, 1), (i32::MAX as i64, 2)];
    for (a, b) in pairs {
        let left = Expression::int_literal(&ctx, 0, a);
        let right = Expression::int_literal(&ctx, 0, b);
        let (a, b) = (a as i32, b as i32);
        let expected_ints = [
            (Operator::Plus, a.wrapping_add(b)),
            (Operator::Minus, a.wrapping_sub(b)),
            (Operator::Star, a.wrapping_mul(b)),
            (Operator::Slash, a.wrapping_div(b)),
            (Operator::Percent, a.wrapping_rem(b)),
            (Operator::BitwiseAnd, a & b),
            (Operator::BitwiseOr, a | b),
            (Operator::BitwiseXor, a ^ b),
            (Operator::Shl, a.wrapping_shl(b as u32)),
            (Operator::Shr, a >> b),
        ];
        for (op, expected) in expected_ints {
            match folder.fold_binary(&mut errors, &left, op, &right).map(|e| e.kind) {
                Some(ExpressionKind::IntLiteral(v)) => assert_eq!(v, expected as i64, "{} {} {}", a, op, b),
                other => panic!("Expected int literal for {} {} {}, got {:?}", a, op, b, other),
            }
        }
        let expected_bools = [
            (Operator::EqEq, a == b),
            (Operator::Neq, a != b),
            (Operator::Lt, a < b),
            (Operator::LtEq, a <= b),
            (Operator::Gt, a > b),
            (Operator::GtEq, a >= b),
        ];
        for (op, expected) in expected_bools {
            assert_eq!(
                folder.fold_binary(&mut errors, &left, op, &right).and_then(|e| e.as_bool()),
                Some(expected)
            );
        }
    }
    assert_eq!(errors.error_count(), 0);
}

#[test]
fn test_division_by_zero_is_an_error() {
    let ctx = Context::new();
    let folder = ConstantFolder::new(&ctx);
    let mut errors = ErrorReporter::new();
    let one = Expression::int_literal(&ctx, 0, 1);
    let zero = Expression::int_literal(&ctx, 4, 0);

    assert!(folder.fold_binary(&mut errors, &one, Operator::Slash, &zero).is_none());
    assert!(folder.fold_binary(&mut errors, &one, Operator::Percent, &zero).is_none());
    let fzero = Expression::float_literal(&ctx, 4, 0.0);
    assert!(folder
        .fold_binary(&mut errors, &Expression::float_literal(&ctx, 0, 1.0), Operator::Slash, &fzero)
        .is_none());

    assert_eq!(errors.error_count(), 3);
    assert_eq!(errors.diagnostics()[0].message, "division by zero");
    assert_eq!(errors.diagnostics()[0].offset, 4);
}

#[test]
fn test_shift_out_of_range_is_an_error() {
    let ctx = Context::new();
    let folder = ConstantFolder::new(&ctx);
    let mut errors = ErrorReporter::new();
    let one = Expression::int_literal(&ctx, 0, 1);
    for amount in [-1, 32, 100] {
        let amount = Expression::int_literal(&ctx, 0, amount);
        assert!(folder.fold_binary(&mut errors, &one, Operator::Shl, &amount).is_none());
        assert!(folder.fold_binary(&mut errors, &one, Operator::Shr, &amount).is_none());
    }
    assert_eq!(errors.error_count(), 6);
    let ok = folder.fold_binary(&mut errors, &one, Operator::Shl, &Expression::int_literal(&ctx, 0, 31));
    assert_eq!(ok.and_then(|e| e.as_int()), Some(i32::MIN as i64));
}

#[test]
fn test_short_circuit_with_non_constant_side() {
    let ctx = Context::new();
    let folder = ConstantFolder::new(&ctx);
    let mut errors = ErrorReporter::new();
    let x = non_constant_bool(&ctx);
    let t = Expression::bool_literal(&ctx, 0, true);
    let f = Expression::bool_literal(&ctx, 0, false);

    assert_eq!(folder.fold_binary(&mut errors, &t, Operator::LogicalAnd, &x), Some(x.clone()));
    assert_eq!(
        folder.fold_binary(&mut errors, &f, Operator::LogicalAnd, &x).and_then(|e| e.as_bool()),
        Some(false)
    );
    assert_eq!(folder.fold_binary(&mut errors, &f, Operator::LogicalOr, &x), Some(x.clone()));
    assert_eq!(
        folder.fold_binary(&mut errors, &t, Operator::LogicalOr, &x).and_then(|e| e.as_bool()),
        Some(true)
    );
    // literal on the right
    assert_eq!(folder.fold_binary(&mut errors, &x, Operator::LogicalAnd, &t), Some(x.clone()));
    // xor needs both sides
    assert_eq!(folder.fold_binary(&mut errors, &t, Operator::LogicalXor, &x), None);
}

#[test]
fn test_fold_float_vectors_componentwise() {
    let ctx = Context::new();
    let folder = ConstantFolder::new(&ctx);
    let mut errors = ErrorReporter::new();
    let a = float3(&ctx, [1.0, 2.0, 3.0]);
    let b = float3(&ctx, [4.0, 5.0, 6.0]);

    let sum = folder.fold_binary(&mut errors, &a, Operator::Plus, &b).unwrap();
    assert_eq!(sum.ty, ctx.float_vector(3));
    for (i, expected) in [5.0, 7.0, 9.0].iter().enumerate() {
        assert_eq!(sum.constant_float_component(i), Some(*expected));
    }

    let splat = Expression::new(
        0,
        ctx.float_vector(3),
        ExpressionKind::Constructor { arguments: vec![Expression::float_literal(&ctx, 0, 2.0)] },
    );
    let product = folder.fold_binary(&mut errors, &a, Operator::Star, &splat).unwrap();
    assert_eq!(product.constant_float_component(2), Some(6.0));

    assert_eq!(folder.fold_binary(&mut errors, &a, Operator::EqEq, &a).and_then(|e| e.as_bool()), Some(true));
    assert_eq!(folder.fold_binary(&mut errors, &a, Operator::Neq, &b).and_then(|e| e.as_bool()), Some(true));
}

#[test]
fn test_fold_prefix() {
    let ctx = Context::new();
    let folder = ConstantFolder::new(&ctx);
    let neg = folder.fold_prefix(Operator::Minus, &Expression::float_literal(&ctx, 0, 1.5)).unwrap();
    assert_eq!(neg.as_float(), Some(-1.5));
    let not = folder.fold_prefix(Operator::LogicalNot, &Expression::bool_literal(&ctx, 0, true)).unwrap();
    assert_eq!(not.as_bool(), Some(false));
    assert!(folder.fold_prefix(Operator::Minus, &non_constant_bool(&ctx)).is_none());
}
