use super::lower;
use crate::error::{CompilerError, ErrorReporter};
use crate::ir::Program;
use crate::ir_generator::IRGenerator;
use crate::settings::{ProgramKind, Settings};
use crate::types::Context;
use rspirv::dr::{load_words, Instruction, Module, Operand};
use rspirv::spirv::{self, Decoration, ExecutionMode, ExecutionModel, Op, StorageClass};
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

fn compile_with(kind: ProgramKind, settings: &Settings, source: &str) -> Module {
    let program = convert(kind, settings, source);
    let words = lower(&program).expect("SPIR-V lowering failed");
    assert_eq!(words[0], spirv::MAGIC_NUMBER);
    load_words(&words).expect("Generated SPIR-V does not parse")
}

fn compile(source: &str) -> Module {
    compile_with(ProgramKind::Fragment, &Settings::default(), source)
}

fn count(module: &Module, op: Op) -> usize {
    module.all_inst_iter().filter(|i| i.class.opcode == op).count()
}

fn execution_modes(module: &Module) -> Vec<ExecutionMode> {
    module
        .execution_modes
        .iter()
        .filter_map(|i| match i.operands.get(1) {
            Some(Operand::ExecutionMode(mode)) => Some(*mode),
            _ => None,
        })
        .collect()
}

fn is_decoration(inst: &Instruction, decoration: Decoration) -> bool {
    let index = if inst.class.opcode == Op::MemberDecorate { 2 } else { 1 };
    matches!(inst.operands.get(index), Some(Operand::Decoration(d)) if *d == decoration)
}

/// Literal operands of every member decoration of `decoration`, in order.
fn member_literals(module: &Module, decoration: Decoration) -> Vec<u32> {
    module
        .annotations
        .iter()
        .filter(|i| i.class.opcode == Op::MemberDecorate && is_decoration(i, decoration))
        .filter_map(|i| match i.operands.get(3) {
            Some(Operand::LiteralBit32(value)) => Some(*value),
            _ => None,
        })
        .collect()
}

fn has_variable(module: &Module, storage: StorageClass) -> bool {
    module.types_global_values.iter().any(|i| {
        i.class.opcode == Op::Variable && matches!(i.operands.first(), Some(Operand::StorageClass(s)) if *s == storage)
    })
}

#[test]
fn test_fragment_entry_point() {
    let module = compile("void main() { sk_FragColor = half4(1.0); }");
    assert_eq!(module.entry_points.len(), 1);
    let entry = &module.entry_points[0];
    assert!(matches!(entry.operands[0], Operand::ExecutionModel(ExecutionModel::Fragment)));
    assert!(matches!(&entry.operands[2], Operand::LiteralString(name) if name == "main"));
    // sk_FragColor is the only interface variable
    assert_eq!(entry.operands.len(), 4);
    assert_eq!(execution_modes(&module), vec![ExecutionMode::OriginUpperLeft]);
    assert!(module.annotations.iter().any(|i| is_decoration(i, Decoration::Location)));
    assert!(module.annotations.iter().any(|i| is_decoration(i, Decoration::Index)));
}

#[test]
fn test_discard_becomes_kill() {
    let module = compile(
        "void main() { if (sk_FragCoord.x < 0.5) { discard; } sk_FragColor = half4(1.0); }",
    );
    assert_eq!(count(&module, Op::Kill), 1);
    assert_eq!(count(&module, Op::SelectionMerge), 1);
    assert!(module.annotations.iter().any(|i| is_decoration(i, Decoration::BuiltIn)));
}

#[test]
fn test_control_flow_constructs() {
    let module = compile(
        "void main() { int n = int(sk_FragCoord.x); half sum = 0; \
         for (int i = 0; i < 4; i++) { if (i == n) { continue; } sum += 0.25; } \
         switch (n) { case 0: sum = 0; break; case 1: sum = 1; default: sum += 1; } \
         do { sum *= 0.5; } while (sum > 1); \
         sk_FragColor = half4(sum); }",
    );
    assert_eq!(count(&module, Op::LoopMerge), 2);
    assert_eq!(count(&module, Op::Switch), 1);
    assert!(count(&module, Op::SelectionMerge) >= 2);
}

#[test]
fn test_loose_uniforms_share_a_block() {
    let module = compile(
        "layout(set=1) uniform float a; layout(set=1) uniform float4 b; \
         void main() { sk_FragColor = half4(b * a); }",
    );
    assert_eq!(member_literals(&module, Decoration::Offset), vec![0, 16]);
    assert!(module.annotations.iter().any(|i| is_decoration(i, Decoration::Block)));
    let set = module.annotations.iter().find_map(|i| match (i.operands.get(1), i.operands.get(2)) {
        (Some(Operand::Decoration(Decoration::DescriptorSet)), Some(Operand::LiteralBit32(set))) => Some(*set),
        _ => None,
    });
    assert_eq!(set, Some(1));
    assert!(has_variable(&module, StorageClass::Uniform));
}

#[test]
fn test_mixed_uniform_sets_are_rejected() {
    let program = convert(
        ProgramKind::Fragment,
        &Settings::default(),
        "layout(set=0) uniform half a; layout(set=1) uniform half b; void main() { sk_FragColor = half4(a + b); }",
    );
    assert!(matches!(lower(&program), Err(CompilerError::SpirvError(..))));
}

#[test]
fn test_flip_y_uses_push_constant() {
    let settings = Settings { flip_y: true, ..Settings::default() };
    let source = "void main() { sk_FragColor = half4(half(sk_FragCoord.y)); }";
    let module = compile_with(ProgramKind::Fragment, &settings, source);
    assert!(has_variable(&module, StorageClass::PushConstant));

    let module = compile(source);
    assert!(!has_variable(&module, StorageClass::PushConstant));
}

#[test]
fn test_matrix_equality_is_column_wise() {
    let module = compile(
        "void main() { float2x2 a = float2x2(sk_FragCoord.x); float2x2 b = float2x2(1); \
         sk_FragColor = a == b ? half4(1) : half4(0); }",
    );
    assert_eq!(count(&module, Op::All), 2);
    assert_eq!(count(&module, Op::LogicalAnd), 1);
    assert_eq!(count(&module, Op::Phi), 1);
}

#[test]
fn test_vector_types_are_shared() {
    let module = compile(
        "void main() { float4 a = sk_FragCoord; half4 b = half4(a); float4 c = a * 2; sk_FragColor = b + half4(c); }",
    );
    assert_eq!(count(&module, Op::TypeVector), 1);
    assert_eq!(count(&module, Op::TypeFloat), 1);
}

#[test]
fn test_out_parameters_copy_back() {
    let module = compile("void fill(out half4 c) { c = half4(1); } void main() { fill(sk_FragColor); }");
    assert_eq!(count(&module, Op::FunctionCall), 1);
    assert_eq!(count(&module, Op::Function), 2);
}

#[test]
fn test_vertex_builtins_are_decorated() {
    let module = compile_with(
        ProgramKind::Vertex,
        &Settings::default(),
        "layout(location=0) in float2 pos; void main() { sk_Position = float4(pos, 0, 1); }",
    );
    let entry = &module.entry_points[0];
    assert!(matches!(entry.operands[0], Operand::ExecutionModel(ExecutionModel::Vertex)));
    assert!(execution_modes(&module).is_empty());
    let builtins: Vec<_> = module
        .annotations
        .iter()
        .filter_map(|i| match i.operands.get(3) {
            Some(Operand::BuiltIn(b)) if i.class.opcode == Op::MemberDecorate => Some(*b),
            _ => None,
        })
        .collect();
    assert!(builtins.contains(&spirv::BuiltIn::Position), "{:?}", builtins);
    assert!(builtins.contains(&spirv::BuiltIn::PointSize), "{:?}", builtins);
}

#[test]
fn test_geometry_execution_modes() {
    let module = compile_with(
        ProgramKind::Geometry,
        &Settings::default(),
        "layout(points) in; layout(line_strip, max_vertices = 2) out; \
         void main() { sk_Position = sk_in[0].sk_Position; EmitVertex(); \
         sk_Position = sk_in[0].sk_Position + float4(1, 0, 0, 0); EmitVertex(); EndPrimitive(); }",
    );
    let modes = execution_modes(&module);
    assert!(modes.contains(&ExecutionMode::InputPoints), "{:?}", modes);
    assert!(modes.contains(&ExecutionMode::OutputLineStrip), "{:?}", modes);
    assert!(modes.contains(&ExecutionMode::OutputVertices), "{:?}", modes);
    assert_eq!(count(&module, Op::EmitVertex), 2);
    assert_eq!(count(&module, Op::EndPrimitive), 1);
}

#[test]
fn test_sampling() {
    let module = compile(
        "layout(binding=0) uniform sampler2D s; layout(location=0) in float2 uv; \
         void main() { sk_FragColor = sample(s, uv) + sample(s, float3(uv, 1)); }",
    );
    assert_eq!(count(&module, Op::ImageSampleImplicitLod), 1);
    assert_eq!(count(&module, Op::ImageSampleProjImplicitLod), 1);
    assert!(has_variable(&module, StorageClass::UniformConstant));
}

#[test]
fn test_pipeline_programs_are_rejected() {
    let program = convert(ProgramKind::Pipeline, &Settings::default(), "half4 main() { return half4(1); }");
    match lower(&program) {
        Err(CompilerError::SpirvError(message, _)) => assert!(message.contains("VM"), "{}", message),
        other => panic!("Expected SpirvError, got {:?}", other),
    }
}
