use super::lower;
use crate::error::{CompilerError, ErrorReporter};
use crate::ir::Program;
use crate::ir_generator::IRGenerator;
use crate::settings::{ProgramKind, Settings, ShaderCaps};
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

fn glsl_with(settings: &Settings, source: &str) -> String {
    let program = convert(ProgramKind::Fragment, settings, source);
    lower(&program).expect("GLSL lowering failed")
}

fn glsl(source: &str) -> String {
    glsl_with(&Settings::default(), source)
}

fn legacy() -> Settings {
    Settings { caps: ShaderCaps::legacy_es2(), ..Settings::default() }
}

#[test]
fn test_version_and_output_declaration() {
    let out = glsl("void main() { sk_FragColor = half4(1.0); }");
    assert!(out.starts_with(ShaderCaps::standalone().generation.version_declaration()), "{}", out);
    assert!(out.contains("out vec4 sk_FragColor;\n"), "{}", out);
    assert!(out.contains("void main() {\n"), "{}", out);

    let out = glsl_with(&legacy(), "void main() { sk_FragColor = half4(1.0); }");
    assert!(out.starts_with("#version 100\n"), "{}", out);
    assert!(out.contains("precision mediump float;\n"), "{}", out);
    assert!(out.contains("gl_FragColor = "), "{}", out);
    assert!(!out.contains("out mediump vec4 sk_FragColor"), "{}", out);
}

#[test]
fn test_emission_is_deterministic() {
    let source = "uniform half4 color; half4 tint(half4 c) { return c * 0.5; } \
                  void main() { sk_FragColor = tint(color) + half4(half(sk_FragCoord.x)); }";
    let program = convert(ProgramKind::Fragment, &legacy(), source);
    let first = lower(&program).unwrap();
    let second = lower(&program).unwrap();
    assert_eq!(first, second);
    // functions follow every other element
    let uniform = first.find("uniform mediump vec4 color;").expect("uniform missing");
    let function = first.find("vec4 tint(").expect("function missing");
    assert!(uniform < function);
}

#[test]
fn test_saturate_becomes_clamp() {
    let out = glsl("void main() { sk_FragColor = saturate(half4(sk_FragCoord.x)); }");
    assert!(out.contains("clamp(vec4(gl_FragCoord.x), 0.0, 1.0)"), "{}", out);
}

#[test]
fn test_do_while_rewrite() {
    let source = "void main() { int i = 0; do { i++; } while (i < 4); sk_FragColor = half4(half(i)); }";
    let out = glsl_with(&legacy(), source);
    assert!(out.contains("bool _tmpLoopSeenOnce0 = false;\n"), "{}", out);
    assert!(out.contains("if (!(i < 4)) {"), "{}", out);
    assert!(out.contains("_tmpLoopSeenOnce0 = true;"), "{}", out);
    assert!(!out.contains("do "), "{}", out);

    let out = glsl(source);
    assert!(out.contains("do {"), "{}", out);
    assert!(out.contains("} while (i < 4);"), "{}", out);
}

#[test]
fn test_min_abs_workaround_hoists_temporaries() {
    let out = glsl_with(
        &legacy(),
        "void main() { float x = min(abs(sk_FragCoord.x), 1.0); sk_FragColor = half4(half(x)); }",
    );
    assert!(out.contains("void main() {\n    highp float minAbsHackVar0;\n    highp float minAbsHackVar1;\n"), "{}", out);
    assert!(
        out.contains("((minAbsHackVar0 = abs(gl_FragCoord.x)) < (minAbsHackVar1 = 1.0) ? minAbsHackVar0 : minAbsHackVar1)"),
        "{}",
        out
    );
}

#[test]
fn test_default_only_switch_gets_a_case() {
    let out = glsl(
        "void main() { int i = int(sk_FragCoord.x); switch (i) { default: i = 1; } sk_FragColor = half4(half(i)); }",
    );
    let case = out.find("case 0:\n").expect("case 0 missing");
    let default = out.find("default:\n").expect("default missing");
    assert!(case < default, "{}", out);
}

#[test]
fn test_flip_y_declares_rt_flip_uniform() {
    let settings = Settings { flip_y: true, ..Settings::default() };
    let out = glsl_with(&settings, "void main() { sk_FragColor = half4(half(sk_FragCoord.y)); }");
    assert!(out.contains("uniform vec2 u_skRTFlip;\n"), "{}", out);
    assert!(
        out.contains(
            "vec4 sk_FragCoord = vec4(gl_FragCoord.x, u_skRTFlip.x + u_skRTFlip.y * gl_FragCoord.y, \
             gl_FragCoord.z, gl_FragCoord.w);"
        ),
        "{}",
        out
    );

    let out = glsl("void main() { sk_FragColor = half4(half(sk_FragCoord.y)); }");
    assert!(!out.contains("u_skRTFlip"), "{}", out);
    assert!(out.contains("gl_FragCoord.y"), "{}", out);
}

#[test]
fn test_unreferenced_global_is_skipped() {
    let out = glsl("uniform half4 used; half4 unused; void main() { sk_FragColor = used; }");
    assert!(out.contains("uniform vec4 used;\n"), "{}", out);
    assert!(!out.contains("unused"), "{}", out);
}

#[test]
fn test_reserved_identifiers_are_escaped() {
    let out = glsl("void main() { float a__b = sk_FragCoord.x; sk_FragColor = half4(half(a__b)); }");
    assert!(out.contains("float a_X_Xb = gl_FragCoord.x;"), "{}", out);
}

#[test]
fn test_pipeline_programs_are_rejected() {
    let program = convert(ProgramKind::Pipeline, &Settings::default(), "half4 main(float2 coords) { return half4(1); }");
    match lower(&program) {
        Err(CompilerError::CodegenError(message, _)) => assert!(message.contains("VM"), "{}", message),
        other => panic!("Expected CodegenError, got {:?}", other),
    }
}
