use rspirv::spirv::{ExecutionModel, Op};
use tinct_core::error::CompilerError;
use tinct_core::settings::{ProgramKind, Settings};
use tinct_core::Compiler;

const DOUBLER: &str = "float f(float x) { return x * 2.0; } \
                       void main() { float y = f(3.0); sk_FragColor = half4(half(y)); }";

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_inlined_call_is_folded() {
    init();
    let glsl = Compiler::default()
        .compile(ProgramKind::Fragment, DOUBLER)
        .expect("compile failed")
        .to_glsl()
        .expect("GLSL generation failed");
    assert!(!glsl.contains("f(3.0)"), "{}", glsl);
    assert!(glsl.contains("= 6.0;"), "{}", glsl);
}

#[test]
fn test_optimization_can_be_disabled() {
    init();
    let settings = Settings { optimize: false, ..Settings::default() };
    let glsl = Compiler::new(settings)
        .compile(ProgramKind::Fragment, DOUBLER)
        .expect("compile failed")
        .to_glsl()
        .expect("GLSL generation failed");
    assert!(glsl.contains("f(3.0)"), "{}", glsl);
}

#[test]
fn test_glsl_is_deterministic_across_compiles() {
    init();
    let source = "uniform half4 color; in float2 uv; \
                  half4 shade(half4 c, float2 p) { return c * half(p.x); } \
                  void main() { sk_FragColor = shade(color, uv); }";
    let first = Compiler::default().compile(ProgramKind::Fragment, source).unwrap().to_glsl().unwrap();
    let second = Compiler::default().compile(ProgramKind::Fragment, source).unwrap().to_glsl().unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_spirv_module_loads() {
    init();
    let words = Compiler::default()
        .compile(ProgramKind::Fragment, DOUBLER)
        .unwrap()
        .to_spirv()
        .expect("SPIR-V generation failed");
    assert_eq!(words[0], 0x0723_0203);

    let module = rspirv::dr::load_words(&words).expect("module does not parse");
    assert_eq!(module.entry_points.len(), 1);
    let entry = &module.entry_points[0];
    assert_eq!(entry.class.opcode, Op::EntryPoint);
    assert!(matches!(
        entry.operands[0],
        rspirv::dr::Operand::ExecutionModel(ExecutionModel::Fragment)
    ));
}

#[test]
fn test_metal_has_fragment_entry() {
    init();
    let metal = Compiler::default().compile(ProgramKind::Fragment, DOUBLER).unwrap().to_metal().unwrap();
    assert!(metal.contains("fragment Outputs fragmentMain("), "{}", metal);
}

#[test]
fn test_semantic_errors_fail_conversion() {
    init();
    let result = Compiler::default().convert(ProgramKind::Fragment, "void main() { x = 1; }");
    match result {
        Err(CompilerError::SemanticError(message, Some(_))) => {
            assert!(message.contains("unknown identifier 'x'"), "{}", message)
        }
        Err(other) => panic!("Expected a semantic error, got {:?}", other),
        Ok(_) => panic!("Expected a semantic error"),
    }
}

#[test]
fn test_pipeline_runs_on_the_vm() {
    init();
    let source = "uniform float gain; \
                  float shade(float x) { if (x > 1) { return x * gain; } return 0; } \
                  half4 main(float2 coords) { return half4(shade(coords.x)); }";
    let compiled = Compiler::default().compile(ProgramKind::Pipeline, source).unwrap();
    assert!(compiled.to_glsl().is_err());

    let program = compiled.to_vm("main").expect("VM lowering failed");
    let xs = vec![0.5, 1.0, 2.0, 3.0];
    let out = program.eval(4, &[xs, vec![0.0; 4]], &[10.0]).expect("evaluation failed");
    assert_eq!(out.len(), 4);
    assert_eq!(out[0], vec![0.0, 0.0, 20.0, 30.0]);
}
