use super::lower;
use crate::error::{CompilerError, ErrorReporter};
use crate::ir::Program;
use crate::ir_generator::IRGenerator;
use crate::settings::{ProgramKind, Settings};
use crate::types::Context;
use std::rc::Rc;

fn convert(kind: ProgramKind, settings: &Settings, source: &str) -> Program {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut errors = ErrorReporter::new();
    let program = IRGenerator::new(Rc::new(Context::new()), settings, kind, &mut errors)
        .convert_program(source)
        .expect("Failed to parse program");
    assert_eq!(errors.error_count(), 0, "{:?}", errors.diagnostics());
    program
}

fn metal_with(settings: &Settings, source: &str) -> String {
    let program = convert(ProgramKind::Fragment, settings, source);
    lower(&program).expect("Metal lowering failed")
}

fn metal(source: &str) -> String {
    metal_with(&Settings::default(), source)
}

#[test]
fn test_interface_structs_and_entry_point() {
    let out = metal(
        "layout(location=0) in float2 v; uniform half4 color; layout(binding=1) uniform sampler2D s; \
         void main() { sk_FragColor = color * sample(s, v); }",
    );
    assert!(out.starts_with("#include <metal_stdlib>\n#include <simd/simd.h>\nusing namespace metal;\n"), "{}", out);
    assert!(out.contains("struct Uniforms {\n    half4 color;\n};\n"), "{}", out);
    assert!(out.contains("struct Inputs {\n    float2 v  [[user(locn0)]];\n};\n"), "{}", out);
    assert!(out.contains("    half4 sk_FragColor [[color(0)]];\n"), "{}", out);
    assert!(out.contains("struct Globals {\n    texture2d<half> s;\n    sampler sSmplr;\n};\n"), "{}", out);
    assert!(
        out.contains(
            "fragment Outputs fragmentMain(Inputs _in [[stage_in]], constant Uniforms& _uniforms [[buffer(0)]], \
             texture2d<half> s [[texture(1)]], sampler sSmplr [[sampler(1)]], \
             bool _frontFacing [[front_facing]], float4 _fragCoord [[position]]) {\n"
        ),
        "{}",
        out
    );
    assert!(out.contains("    Globals _globals{s, sSmplr};\n    (void)_globals;\n"), "{}", out);
    assert!(out.contains("    Outputs _out;\n    (void)_out;\n"), "{}", out);
    assert!(out.contains("_out.sk_FragColor = _uniforms.color * _globals.s.sample(_globals.sSmplr, _in.v);"), "{}", out);
    assert!(out.ends_with("    return _out;\n}\n"), "{}", out);
}

#[test]
fn test_helpers_receive_only_the_structs_they_use() {
    let out = metal(
        "uniform half4 color; half4 get() { return color; } half4 twice(half4 c) { return c * 2; } \
         void main() { sk_FragColor = twice(get()); }",
    );
    assert!(out.contains("half4 get(constant Uniforms& _uniforms) {"), "{}", out);
    assert!(out.contains("half4 twice(half4 c) {"), "{}", out);
    assert!(out.contains("twice(get(_uniforms))"), "{}", out);
}

#[test]
fn test_out_parameters_are_pointers() {
    let out = metal("void fill(out half4 c) { c = half4(1); } void main() { fill(sk_FragColor); }");
    assert!(out.contains("void fill(thread half4* c) {"), "{}", out);
    assert!(out.contains("(*c) = "), "{}", out);
    assert!(out.contains("fill(&_out.sk_FragColor);"), "{}", out);
}

#[test]
fn test_intrinsic_renames() {
    let out = metal(
        "void main() { float x = sk_FragCoord.x; \
         sk_FragColor = half4(half(atan(x, 2.0) + inversesqrt(x) + dFdx(x))); }",
    );
    assert!(out.contains("atan2(x, 2.0)"), "{}", out);
    assert!(out.contains("rsqrt(x)"), "{}", out);
    assert!(out.contains("dfdx(x)"), "{}", out);
    assert!(out.contains("float4(_fragCoord.x, _fragCoord.y, 0.0, _fragCoord.w).x"), "{}", out);
}

#[test]
fn test_matrix_helpers_are_shared() {
    let out = metal(
        "void main() { float2x2 a = float2x2(sk_FragCoord.x); float2x2 b = float2x2(sk_FragCoord.y); \
         sk_FragColor = half4(half(a[0].x + b[1].y)); }",
    );
    assert_eq!(out.matches("float2x2 float2x2_from_float(float x0) {").count(), 1, "{}", out);
    assert!(out.contains("return float2x2(float2(x0, 0), float2(0, x0));"), "{}", out);
    assert_eq!(out.matches("= float2x2_from_float(").count(), 2, "{}", out);
}

#[test]
fn test_inverse_helper_builds_columns() {
    let out = metal(
        "void main() { float3x3 m = float3x3(sk_FragCoord.x); sk_FragColor = half4(half(inverse(m)[0].x)); }",
    );
    assert!(out.contains("float3x3 float3x3_inverse(float3x3 m) {"), "{}", out);
    assert!(out.contains("float3x3_inverse(m)[0].x"), "{}", out);
}

#[test]
fn test_compound_assignment_to_swizzle_is_expanded() {
    let out = metal("void main() { float4 v = sk_FragCoord; v.xy *= 2.0; sk_FragColor = half4(v); }");
    assert!(out.contains("v.xy = v.xy * 2.0;"), "{}", out);
    assert!(!out.contains("*="), "{}", out);
}

#[test]
fn test_flipped_frag_coord_reads_synthetic_uniform() {
    let settings = Settings { flip_y: true, ..Settings::default() };
    let out = metal_with(&settings, "void main() { sk_FragColor = half4(half(sk_FragCoord.y)); }");
    assert!(out.contains("struct sksl_synthetic_uniforms {\n    float2 u_skRTFlip;\n};\n"), "{}", out);
    assert!(out.contains("constant sksl_synthetic_uniforms& _rtFlip [[buffer(0)]]"), "{}", out);
    assert!(out.contains("Globals _globals{&_rtFlip};"), "{}", out);
    assert!(
        out.contains("_globals._rtFlip->u_skRTFlip.x + _globals._rtFlip->u_skRTFlip.y * _fragCoord.y"),
        "{}",
        out
    );
}

#[test]
fn test_discard_and_early_return_in_main() {
    let out = metal(
        "void main() { if (sk_FragCoord.x < 0.0) { discard; } if (sk_FragCoord.y < 0.0) { return; } \
         sk_FragColor = half4(0); }",
    );
    assert!(out.contains("discard_fragment();"), "{}", out);
    assert_eq!(out.matches("return _out;").count(), 2, "{}", out);
}

#[test]
fn test_vertex_program() {
    let program = convert(
        ProgramKind::Vertex,
        &Settings::default(),
        "layout(location=0) in float2 pos; layout(location=1) out float2 uv; \
         void main() { uv = pos; sk_Position = float4(pos, 0, 1); }",
    );
    let out = lower(&program).expect("Metal lowering failed");
    assert!(out.contains("float2 pos  [[attribute(0)]];"), "{}", out);
    assert!(out.contains("    float4 sk_Position [[position]];\n    float2 uv [[user(locn1)]];\n"), "{}", out);
    assert!(out.contains("vertex Outputs vertexMain(Inputs _in [[stage_in]], "), "{}", out);
    assert!(out.contains("_out.uv = _in.pos;"), "{}", out);
    assert!(out.contains("_out.sk_Position = "), "{}", out);
}

#[test]
fn test_sampler_without_binding_is_rejected() {
    let program = convert(
        ProgramKind::Fragment,
        &Settings::default(),
        "uniform sampler2D s; void main() { sk_FragColor = sample(s, float2(0.5)); }",
    );
    match lower(&program) {
        Err(CompilerError::CodegenError(message, _)) => assert!(message.contains("binding"), "{}", message),
        other => panic!("Expected a codegen error, got {:?}", other),
    }
}

#[test]
fn test_mixed_uniform_sets_are_rejected() {
    let program = convert(
        ProgramKind::Fragment,
        &Settings::default(),
        "layout(set=0) uniform half a; layout(set=1) uniform half b; void main() { sk_FragColor = half4(a + b); }",
    );
    match lower(&program) {
        Err(CompilerError::CodegenError(message, _)) => assert!(message.contains("layout(set"), "{}", message),
        other => panic!("Expected a codegen error, got {:?}", other),
    }
}

#[test]
fn test_pipeline_programs_are_rejected() {
    let program = convert(ProgramKind::Pipeline, &Settings::default(), "half4 main() { return half4(1); }");
    assert!(matches!(lower(&program), Err(CompilerError::CodegenError(..))));
}
