#![cfg(test)]

use crate::error::ErrorReporter;
use crate::inliner::{remove_inline_markers, Inliner};
use crate::ir::*;
use crate::ir_generator::IRGenerator;
use crate::settings::{ProgramKind, Settings, ShaderCaps};
use crate::types::Context;
use std::rc::Rc;

fn compile(settings: &Settings, source: &str) -> Program {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut errors = ErrorReporter::new();
    let program = IRGenerator::new(Rc::new(Context::new()), settings, ProgramKind::Fragment, &mut errors)
        .convert_program(source)
        .expect("Failed to parse program");
    assert_eq!(errors.error_count(), 0, "{:?}", errors.diagnostics());
    program
}

/// Runs inliner passes until nothing changes; returns the number of passes
/// that inlined something.
fn inline_to_fixpoint(program: &mut Program) -> usize {
    let mut inliner = Inliner::new();
    let mut errors = ErrorReporter::new();
    let mut passes = 0;
    while passes < 8 && inliner.inline_pass(program, &mut errors) {
        passes += 1;
    }
    assert_eq!(errors.error_count(), 0, "{:?}", errors.diagnostics());
    passes
}

fn main_body(program: &Program) -> &[Statement] {
    match &program.main().expect("no main").body.kind {
        StatementKind::Block { statements, .. } => statements,
        other => panic!("Expected block, got {:?}", other),
    }
}

/// The synthetic block that replaced the `index`th statement of main: the
/// inlined code followed by the relocated statement.
fn inlined_block(program: &Program, index: usize) -> &[Statement] {
    match &main_body(program)[index].kind {
        StatementKind::Block { statements, is_scope: false, .. } => statements,
        other => panic!("Expected unscoped inline block, got {:?}", other),
    }
}

fn declaration_count(statements: &[Statement]) -> usize {
    statements.iter().filter(|s| matches!(s.kind, StatementKind::VarDeclarations { .. })).count()
}

fn describe_all(program: &Program, statements: &[Statement]) -> Vec<String> {
    statements
        .iter()
        .filter_map(|s| match &s.kind {
            StatementKind::Expression { expression } => Some(program.describe_expression(expression)),
            _ => None,
        })
        .collect()
}

fn contains_call_to(program: &Program, statement: &Statement, name: &str) -> bool {
    use crate::visitor::{walk_expression, ProgramVisitor};
    use std::ops::ControlFlow;
    struct Finder<'a> {
        program: &'a Program,
        name: &'a str,
    }
    impl ProgramVisitor for Finder<'_> {
        type Break = ();
        fn visit_expression(&mut self, expression: &Expression) -> ControlFlow<()> {
            if let ExpressionKind::FunctionCall { function, .. } = expression.kind {
                if self.program.function(function).name == self.name {
                    return ControlFlow::Break(());
                }
            }
            walk_expression(self, expression)
        }
    }
    Finder { program, name }.visit_statement(statement).is_break()
}

#[test]
fn test_inlines_and_folds_literal_argument() {
    let mut program = compile(
        &Settings::default(),
        "float f(float x) { return x * 2.0; } void main() { float y = f(3.0); sk_FragColor = half4(half(y)); }",
    );
    assert_eq!(inline_to_fixpoint(&mut program), 1);
    let block = inlined_block(&program, 0);
    assert!(matches!(block[0].kind, StatementKind::InlineMarker { .. }));
    assert_eq!(describe_all(&program, block), vec!["(_0_f = 6.0)"]);
    match &block.last().unwrap().kind {
        StatementKind::VarDeclarations { declarations } => {
            let value = declarations.vars[0].value.as_ref().unwrap();
            assert_eq!(program.describe_expression(value), "_0_f");
        }
        other => panic!("Expected the original declaration last, got {:?}", other),
    }
    assert!(!contains_call_to(&program, &program.main().unwrap().body, "f"));
}

#[test]
fn test_trivial_argument_is_not_copied() {
    let mut program = compile(
        &Settings::default(),
        "float f(float x) { return x + 1.0; } \
         void main() { float v = sk_FragCoord.x; float y = f(v); sk_FragColor = half4(half(y)); }",
    );
    inline_to_fixpoint(&mut program);
    let block = inlined_block(&program, 1);
    // result variable plus the relocated `float y`
    assert_eq!(declaration_count(block), 2);
    assert_eq!(describe_all(&program, block), vec!["(_0_f = (v + 1.0))"]);
}

#[test]
fn test_written_parameter_gets_a_copy() {
    let mut program = compile(
        &Settings::default(),
        "float f(float x) { x *= 2.0; return x; } \
         void main() { float v = sk_FragCoord.x; float y = f(v); sk_FragColor = half4(half(y)); }",
    );
    inline_to_fixpoint(&mut program);
    let block = inlined_block(&program, 1);
    assert_eq!(declaration_count(block), 3);
    assert_eq!(describe_all(&program, block), vec!["(_0_x *= 2.0)", "(_0_f = _0_x)"]);
}

#[test]
fn test_out_parameter_copy_back() {
    let mut program = compile(
        &Settings::default(),
        "void f(out float r) { r = 1.0; } \
         void main() { float2 v; int i = int(sk_FragCoord.x); f(v.x); f(v[i]); sk_FragColor = half4(half2(v), 0, 1); }",
    );
    inline_to_fixpoint(&mut program);
    // direct substitution for the swizzle
    assert_eq!(describe_all(&program, inlined_block(&program, 2)), vec!["(v.x = 1.0)"]);
    // a temporary plus copy-back for the dynamic index
    let block = inlined_block(&program, 3);
    assert_eq!(describe_all(&program, block), vec!["(_1_r = 1.0)", "(v[i] = _1_r)"]);
}

#[test]
fn test_locals_are_renamed_per_copy() {
    let mut program = compile(
        &Settings::default(),
        "float f(float x) { float t = x * x; return t + x; } \
         void main() { float a = f(sk_FragCoord.x); float b = f(sk_FragCoord.y); sk_FragColor = half4(half(a + b)); }",
    );
    inline_to_fixpoint(&mut program);
    let names: Vec<String> = [0, 1]
        .iter()
        .flat_map(|i| inlined_block(&program, *i).iter())
        .filter_map(|s| match &s.kind {
            StatementKind::VarDeclarations { declarations } => {
                Some(program.variable(declarations.vars[0].var).name.clone())
            }
            _ => None,
        })
        .collect();
    assert_eq!(names, vec!["_0_f", "_0_t", "a", "_1_f", "_1_t", "b"]);
}

#[test]
fn test_early_return_wraps_in_do_while() {
    let source = "float f(float x) { if (x > 0.0) { return 1.0; } return 0.0; } \
                  void main() { float y = f(sk_FragCoord.x); sk_FragColor = half4(half(y)); }";
    let mut program = compile(&Settings::default(), source);
    inline_to_fixpoint(&mut program);
    let block = inlined_block(&program, 0);
    match block.iter().find(|s| matches!(s.kind, StatementKind::Do { .. })).map(|s| &s.kind) {
        Some(StatementKind::Do { test, .. }) => assert_eq!(test.as_bool(), Some(false)),
        other => panic!("Expected do-while wrapper, got {:?}", other),
    }

    let settings = Settings { caps: ShaderCaps::legacy_es2(), ..Settings::default() };
    let mut program = compile(&settings, source);
    assert_eq!(inline_to_fixpoint(&mut program), 0);
    assert!(contains_call_to(&program, &program.main().unwrap().body, "f"));
}

#[test]
fn test_recursion_is_never_inlined() {
    let mut program = compile(
        &Settings::default(),
        "int g(int x); int f(int x) { return x <= 0 ? 0 : g(x - 1); } int g(int x) { return f(x); } \
         int h(int x) { return x <= 0 ? 0 : h(x - 1); } \
         void main() { sk_FragColor = half4(half(f(3) + h(2))); }",
    );
    assert_eq!(inline_to_fixpoint(&mut program), 0);
    let body = &program.main().unwrap().body;
    assert!(contains_call_to(&program, body, "f"));
    assert!(contains_call_to(&program, body, "h"));
}

#[test]
fn test_short_circuit_and_ternary_branches_are_skipped() {
    let mut program = compile(
        &Settings::default(),
        "bool f(float x) { return x > 1.0; } \
         void main() { bool b = sk_FragCoord.x > 0.0 && f(sk_FragCoord.y); \
                       float y = b ? float(f(2.0)) : 0.0; sk_FragColor = half4(half(y)); }",
    );
    assert_eq!(inline_to_fixpoint(&mut program), 0);
}

#[test]
fn test_threshold_applies_only_to_shared_functions() {
    let source_once = "float f(float x) { float a = x * 3.0; float b = a * a; return a + b; } \
                       void main() { sk_FragColor = half4(half(f(sk_FragCoord.x))); }";
    let source_twice = "float f(float x) { float a = x * 3.0; float b = a * a; return a + b; } \
                        void main() { sk_FragColor = half4(half(f(sk_FragCoord.x) + f(sk_FragCoord.y))); }";
    let settings = Settings { inline_threshold: 1, ..Settings::default() };
    let mut program = compile(&settings, source_once);
    assert_eq!(inline_to_fixpoint(&mut program), 1);
    let mut program = compile(&settings, source_twice);
    assert_eq!(inline_to_fixpoint(&mut program), 0);

    let forced = source_twice.replacen("float f", "inline float f", 1);
    let mut program = compile(&settings, &forced);
    assert_eq!(inline_to_fixpoint(&mut program), 1);
}

#[test]
fn test_spliced_body_of_if_is_scoped() {
    let mut program = compile(
        &Settings::default(),
        "float f(float x) { return x + 1.0; } \
         void main() { float y = 0; if (sk_FragCoord.x > 0.0) y = f(sk_FragCoord.y); sk_FragColor = half4(half(y)); }",
    );
    inline_to_fixpoint(&mut program);
    match &main_body(&program)[1].kind {
        StatementKind::If { if_true, .. } => {
            assert!(matches!(if_true.kind, StatementKind::Block { is_scope: true, .. }))
        }
        other => panic!("Expected if, got {:?}", other),
    }
}

#[test]
fn test_void_calls_and_markers_are_cleaned_up() {
    let mut program = compile(
        &Settings::default(),
        "void paint() { sk_FragColor = half4(1); } void main() { paint(); }",
    );
    inline_to_fixpoint(&mut program);
    remove_inline_markers(&mut program);
    let block = inlined_block(&program, 0);
    assert_eq!(block.len(), 1);
    let text = describe_all(&program, block).remove(0);
    assert!(text.starts_with("(sk_FragColor = half4("), "{}", text);
}

#[test]
fn test_nested_calls_inline_in_one_pass() {
    let mut program = compile(
        &Settings::default(),
        "float g(float x) { return x + 1.0; } float f(float x) { return x * 2.0; } \
         void main() { float y = f(g(sk_FragCoord.x)); sk_FragColor = half4(half(y)); }",
    );
    assert_eq!(inline_to_fixpoint(&mut program), 1);
    let block = inlined_block(&program, 0);
    // innermost call first, both spliced into the same block
    assert_eq!(
        describe_all(&program, block),
        vec!["(_0_g = (sk_FragCoord.x + 1.0))", "(_1_f = (_0_g * 2.0))"]
    );
    let markers = block.iter().filter(|s| matches!(s.kind, StatementKind::InlineMarker { .. })).count();
    assert_eq!(markers, 2);
}
