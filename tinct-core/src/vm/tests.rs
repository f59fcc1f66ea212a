use super::{lower, Program as LaneProgram};
use crate::error::{CompilerError, ErrorReporter};
use crate::inliner::{remove_inline_markers, Inliner};
use crate::ir::Program;
use crate::ir_generator::IRGenerator;
use crate::settings::{ProgramKind, Settings};
use crate::types::Context;
use crate::Compiler;
use std::rc::Rc;

fn convert(source: &str) -> Program {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut errors = ErrorReporter::new();
    let program = IRGenerator::new(Rc::new(Context::new()), &Settings::default(), ProgramKind::Pipeline, &mut errors)
        .convert_program(source)
        .expect("Failed to parse program");
    assert_eq!(errors.error_count(), 0, "{:?}", errors.diagnostics());
    program
}

fn build(source: &str) -> LaneProgram {
    lower(&convert(source), "main").expect("VM lowering failed")
}

/// Runs `main(float2 coords)` with `coords.x` set to `xs` and `coords.y` zero.
fn run(source: &str, xs: &[f32], uniforms: &[f32]) -> Vec<Vec<f32>> {
    let program = build(source);
    let ys = vec![0.0; xs.len()];
    program
        .eval(xs.len(), &[xs.to_vec(), ys], uniforms)
        .expect("evaluation failed")
}

fn lower_error(source: &str) -> String {
    match lower(&convert(source), "main") {
        Err(CompilerError::CodegenError(message, _)) => message,
        other => panic!("Expected a codegen error, got {:?}", other),
    }
}

#[test]
fn test_if_only_writes_active_lanes() {
    let out = run(
        "half4 main(float2 coords) { float y = coords.x; if (coords.x > 2) { y = 100; } return half4(y); }",
        &[1.0, 2.0, 3.0, 4.0],
        &[],
    );
    assert_eq!(out[0], vec![1.0, 2.0, 100.0, 100.0]);
    assert_eq!(out[3], vec![1.0, 2.0, 100.0, 100.0]);
}

#[test]
fn test_else_branch_uses_inverse_mask() {
    let out = run(
        "half4 main(float2 coords) { float y; if (coords.x > 2) { y = 1; } else { y = -1; } return half4(y); }",
        &[1.0, 2.0, 3.0, 4.0],
        &[],
    );
    assert_eq!(out[0], vec![-1.0, -1.0, 1.0, 1.0]);
}

#[test]
fn test_returned_lanes_are_not_overwritten() {
    let out = run(
        "half4 main(float2 coords) { if (coords.x > 2) { return half4(1); } return half4(0); }",
        &[1.0, 2.0, 3.0, 4.0],
        &[],
    );
    assert_eq!(out[0], vec![0.0, 0.0, 1.0, 1.0]);
}

#[test]
fn test_calls_are_expanded() {
    let source = "float twice(float v) { return v * 2; } \
                  float pick(float v) { if (v > 2) { return 1; } return 0; } \
                  half4 main(float2 coords) { return half4(twice(coords.x), pick(coords.x), 0, 1); }";
    let out = run(source, &[1.0, 2.0, 3.0, 4.0], &[]);
    assert_eq!(out[0], vec![2.0, 4.0, 6.0, 8.0]);
    assert_eq!(out[1], vec![0.0, 0.0, 1.0, 1.0]);
    assert_eq!(out[3], vec![1.0; 4]);
}

#[test]
fn test_inout_parameters_write_back() {
    let out = run(
        "void bump(inout float v) { if (v > 2) { v += 10; } } \
         half4 main(float2 coords) { float x = coords.x; bump(x); return half4(x); }",
        &[1.0, 2.0, 3.0, 4.0],
        &[],
    );
    assert_eq!(out[0], vec![1.0, 2.0, 13.0, 14.0]);
}

#[test]
fn test_uniforms_are_converted() {
    let out = run(
        "uniform float scale; uniform int bias; \
         half4 main(float2 coords) { return half4(coords.x * scale + float(bias)); }",
        &[1.0, 2.0, 3.0, 4.0],
        &[2.0, 3.0],
    );
    assert_eq!(out[0], vec![5.0, 7.0, 9.0, 11.0]);
}

#[test]
fn test_intrinsics() {
    let out = run(
        "half4 main(float2 coords) { float2 v = float2(coords.x, coords.y); \
         return half4(length(v), clamp(coords.x, 1.5, 3.5), mix(0.0, 10.0, 0.5), step(2.5, coords.x)); }",
        &[1.0, 2.0, 3.0, 4.0],
        &[],
    );
    assert_eq!(out[0], vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(out[1], vec![1.5, 2.0, 3.0, 3.5]);
    assert_eq!(out[2], vec![5.0; 4]);
    assert_eq!(out[3], vec![0.0, 0.0, 1.0, 1.0]);
}

#[test]
fn test_matrix_inverse_and_product() {
    let out = run(
        "half4 main(float2 coords) { float2x2 m = float2x2(2); float2 v = inverse(m) * float2(coords.x, 4); \
         return half4(v, 0, 1); }",
        &[2.0, 6.0],
        &[],
    );
    assert_eq!(out[0], vec![1.0, 3.0]);
    assert_eq!(out[1], vec![2.0, 2.0]);
}

#[test]
fn test_swizzle_store_and_ternary() {
    let out = run(
        "half4 main(float2 coords) { float4 c = float4(0); c.yx = float2(coords.x, 7); \
         c.z = coords.x > 2 ? 1 : 2; return half4(c); }",
        &[1.0, 3.0],
        &[],
    );
    assert_eq!(out[0], vec![7.0, 7.0]);
    assert_eq!(out[1], vec![1.0, 3.0]);
    assert_eq!(out[2], vec![2.0, 1.0]);
}

#[test]
fn test_integer_division_truncates() {
    let out = run(
        "half4 main(float2 coords) { int n = int(coords.x); return half4(float(n / 2)); }",
        &[5.0, -5.0],
        &[],
    );
    assert_eq!(out[0], vec![2.0, -2.0]);
}

#[test]
fn test_frag_coord_reads_coordinates() {
    let out = run("half4 main(float2 coords) { return half4(sk_FragCoord); }", &[3.0], &[]);
    assert_eq!(out, vec![vec![3.0], vec![0.0], vec![0.0], vec![1.0]]);
}

#[test]
fn test_loops_are_rejected() {
    let message = lower_error(
        "half4 main(float2 coords) { float s = 0; for (int i = 0; i < 2; i++) { s += 1; } return half4(s); }",
    );
    assert!(message.contains("loops"), "{}", message);
}

#[test]
fn test_inlined_early_return_runs_once() {
    let mut program = convert(
        "float pick(float v) { if (v > 2) { return 1; } return 0; } \
         half4 main(float2 coords) { return half4(pick(coords.x)); }",
    );
    let mut inliner = Inliner::new();
    let mut errors = ErrorReporter::new();
    assert!(inliner.inline_pass(&mut program, &mut errors));
    remove_inline_markers(&mut program);
    let out = lower(&program, "main")
        .expect("VM lowering failed")
        .eval(4, &[vec![1.0, 2.0, 3.0, 4.0], vec![0.0; 4]], &[])
        .expect("evaluation failed");
    assert_eq!(out[0], vec![0.0, 0.0, 1.0, 1.0]);
}

#[test]
fn test_break_keeps_lanes_retired_in_nested_loops() {
    let out = run(
        "half4 main(float2 coords) { float y = 0; \
         do { if (coords.x > 2) { break; } do { y = 5; } while (false); } while (false); \
         return half4(y); }",
        &[1.0, 2.0, 3.0, 4.0],
        &[],
    );
    assert_eq!(out[0], vec![5.0, 5.0, 0.0, 0.0]);
}

/// Compiles through the full pipeline and runs `main` over `xs`.
fn run_compiled(source: &str, optimize: bool, xs: &[f32]) -> Vec<Vec<f32>> {
    let _ = env_logger::builder().is_test(true).try_init();
    let settings = Settings { optimize, ..Settings::default() };
    Compiler::new(settings)
        .compile(ProgramKind::Pipeline, source)
        .expect("compile failed")
        .to_vm("main")
        .expect("VM lowering failed")
        .eval(xs.len(), &[xs.to_vec(), vec![0.0; xs.len()]], &[])
        .expect("evaluation failed")
}

#[test]
fn test_inlining_preserves_lane_values() {
    let sources = [
        // early return nested inside another early-returning function
        "float g = 0; \
         void h() { if (g > 100) { return; } g = 5; } \
         float f(float x) { if (x > 2) { return 1; } h(); return 2; } \
         half4 main(float2 coords) { float r = f(coords.x); return half4(g + r); }",
        // inlined early return inside an explicit run-once loop
        "float pick(float v) { if (v > 3) { return 10; } return v; } \
         half4 main(float2 coords) { float y = -1; \
         do { if (coords.x < 2) { break; } y = pick(coords.x); } while (false); \
         return half4(y); }",
    ];
    let xs = [1.0, 2.0, 3.0, 4.0];
    for source in sources {
        let optimized = run_compiled(source, true, &xs);
        let unoptimized = run_compiled(source, false, &xs);
        assert_eq!(optimized, unoptimized, "{}", source);
    }
    assert_eq!(run_compiled(sources[0], true, &xs)[0], vec![7.0, 7.0, 1.0, 1.0]);
    assert_eq!(run_compiled(sources[1], true, &xs)[0], vec![-1.0, 2.0, 3.0, 10.0]);
}

#[test]
fn test_recursion_is_rejected() {
    let message = lower_error(
        "float f(float v) { return f(v); } half4 main(float2 coords) { return half4(f(coords.x)); }",
    );
    assert!(message.contains("recursive"), "{}", message);
}

#[test]
fn test_unknown_entry_point() {
    let program = convert("half4 main(float2 coords) { return half4(1); }");
    assert!(matches!(lower(&program, "missing"), Err(CompilerError::CodegenError(..))));
}

#[test]
fn test_host_slots() {
    let program = build("uniform float4 tint; half4 main(float2 coords) { return half4(tint); }");
    assert_eq!(program.argument_count(), 2);
    assert_eq!(program.uniform_count(), 4);
    assert_eq!(program.result_count(), 4);
}
