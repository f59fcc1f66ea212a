use super::*;
use crate::settings::CapValue;
use crate::types::Context;

fn convert_with(kind: ProgramKind, settings: &Settings, source: &str) -> (Program, Vec<String>) {
    let mut errors = ErrorReporter::new();
    let program = IRGenerator::new(Rc::new(Context::new()), settings, kind, &mut errors)
        .convert_program(source)
        .expect("Failed to parse program");
    let messages = errors.diagnostics().iter().map(|d| d.message.clone()).collect();
    (program, messages)
}

fn convert(kind: ProgramKind, source: &str) -> Program {
    let (program, errors) = convert_with(kind, &Settings::default(), source);
    assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
    program
}

fn errors(kind: ProgramKind, source: &str) -> Vec<String> {
    convert_with(kind, &Settings::default(), source).1
}

fn main_statements(program: &Program) -> &[Statement] {
    match &program.main().expect("program has no main").body.kind {
        StatementKind::Block { statements, .. } => statements,
        other => panic!("Expected block body, got {:?}", other),
    }
}

/// Initializer of the `index`th local declared at the top of `main`.
fn local_value(program: &Program, index: usize) -> &Expression {
    let declarations: Vec<&VarDeclarations> = main_statements(program)
        .iter()
        .filter_map(|s| match &s.kind {
            StatementKind::VarDeclarations { declarations } => Some(declarations),
            _ => None,
        })
        .collect();
    declarations[index].vars[0].value.as_ref().expect("declaration has no initializer")
}

#[test]
fn test_converts_simple_fragment_program() {
    let program = convert(
        ProgramKind::Fragment,
        "uniform half4 color; void main() { sk_FragColor = color * 0.5; }",
    );
    assert!(program.main().is_some());
    assert!(matches!(program.elements[0], ProgramElement::GlobalVar(_)));
    match &main_statements(&program)[0].kind {
        StatementKind::Expression { expression } => match &expression.kind {
            ExpressionKind::Binary { op: Operator::Eq, right, .. } => assert_eq!(right.ty.name, "half4"),
            other => panic!("Expected assignment, got {:?}", other),
        },
        other => panic!("Expected expression statement, got {:?}", other),
    }
}

#[test]
fn test_unknown_identifier() {
    assert_eq!(errors(ProgramKind::Fragment, "void main() { x = 1; }"), vec!["unknown identifier 'x'"]);
}

#[test]
fn test_coercion_errors() {
    assert_eq!(
        errors(ProgramKind::Fragment, "void main() { float2 a = float3(1); }"),
        vec!["expected 'float2', but found 'float3'"]
    );
    assert_eq!(
        errors(ProgramKind::Fragment, "void main() { float3 a = float3(1, 2); }"),
        vec!["invalid arguments to 'float3' constructor (expected 3 scalars, but found 2)"]
    );
    assert_eq!(
        errors(ProgramKind::Fragment, "void main() { bool b = true + 1; }"),
        vec!["type mismatch: '+' cannot operate on 'bool', 'int'"]
    );
}

#[test]
fn test_literals_adopt_partner_type() {
    let program = convert(ProgramKind::Fragment, "void main() { half h = 1; half r = h * 2.0; int i = 2 * 3; }");
    assert_eq!(local_value(&program, 1).ty.name, "half");
    assert_eq!(local_value(&program, 2).as_int(), Some(6));
}

#[test]
fn test_scalar_on_the_left_of_vector_operators() {
    let program = convert(
        ProgramKind::Fragment,
        "void main() { float2 v = float2(1, 2); float2 a = 2 * v; half3 h = half3(1); half s = 1; \
         half3 b = s - h; float2x2 m = float2x2(1); float2x2 c = 2.0 / m; }",
    );
    assert_eq!(local_value(&program, 1).ty.name, "float2");
    assert_eq!(local_value(&program, 6).ty.name, "float2x2");
    match &local_value(&program, 4).kind {
        ExpressionKind::Binary { left, op: Operator::Minus, right } => {
            assert_eq!(left.ty.name, "half");
            assert_eq!(right.ty.name, "half3");
        }
        other => panic!("Expected subtraction, got {:?}", other),
    }
    assert_eq!(local_value(&program, 4).ty.name, "half3");
    assert_eq!(
        errors(ProgramKind::Fragment, "void main() { float f = 1; f += float2(1); }"),
        vec!["type mismatch: '+=' cannot operate on 'float', 'float2'"]
    );
}

#[test]
fn test_constant_folding_during_conversion() {
    let program = convert(ProgramKind::Fragment, "void main() { float x = 3.0 * 2.0; bool b = 1 < 2 && true; }");
    assert_eq!(local_value(&program, 0).as_float(), Some(6.0));
    assert_eq!(local_value(&program, 1).as_bool(), Some(true));
    assert_eq!(errors(ProgramKind::Fragment, "void main() { int x = 1 / 0; }"), vec!["division by zero"]);
}

#[test]
fn test_overload_resolution_prefers_cheapest() {
    let program = convert(
        ProgramKind::Fragment,
        "float f(float x) { return x; } float f(int x) { return 1.0; } void main() { float a = f(2); float b = f(2.0); }",
    );
    for (index, expected) in [(0, "int"), (1, "float")] {
        match &local_value(&program, index).kind {
            ExpressionKind::FunctionCall { function, .. } => {
                let param = program.functions[*function].parameters[0];
                assert_eq!(program.variables[param].ty.name, expected);
            }
            other => panic!("Expected call, got {:?}", other),
        }
    }
}

#[test]
fn test_generic_builtins_resolve_concrete_types() {
    let program = convert(
        ProgramKind::Fragment,
        "void main() { float3 v = abs(float3(1)); half h = length(half2(1)); float m = mix(1.0, 2.0, 0.5); }",
    );
    assert_eq!(local_value(&program, 0).ty.name, "float3");
    assert_eq!(local_value(&program, 1).ty.name, "half");
    assert_eq!(local_value(&program, 2).ty.name, "float");
}

#[test]
fn test_call_arity_error() {
    assert_eq!(
        errors(ProgramKind::Fragment, "float f(float x) { return x; } void main() { f(1, 2); }"),
        vec!["call to 'f' expected 1 argument, but found 2"]
    );
}

#[test]
fn test_function_must_return() {
    assert_eq!(
        errors(ProgramKind::Fragment, "float f(bool b) { if (b) { return 1; } } void main() {}"),
        vec!["function 'f' can exit without returning a value"]
    );
    convert(
        ProgramKind::Fragment,
        "float f(int x) { switch (x) { case 0: return 1; default: return 2; } } void main() {}",
    );
}

#[test]
fn test_control_flow_placement() {
    assert_eq!(
        errors(ProgramKind::Fragment, "void main() { break; }"),
        vec!["break statement must be inside a loop or switch"]
    );
    assert_eq!(
        errors(ProgramKind::Fragment, "void main() { switch (1) { case 1: continue; } }"),
        vec!["continue statement must be inside a loop"]
    );
    assert_eq!(
        errors(ProgramKind::Vertex, "void main() { discard; }"),
        vec!["discard statement is only permitted in fragment shaders"]
    );
}

#[test]
fn test_immutable_and_swizzle_writes() {
    assert_eq!(
        errors(ProgramKind::Fragment, "const float x = 1; void main() { x = 2; }"),
        vec!["cannot modify immutable variable 'x'"]
    );
    assert_eq!(
        errors(ProgramKind::Fragment, "void main() { float4 v; v.xx = float2(1); }"),
        vec!["cannot write to the same swizzle field more than once"]
    );
    assert_eq!(
        errors(ProgramKind::Fragment, "void main() { float2 v; v.xz = float2(1); }"),
        vec!["invalid swizzle component 'z'"]
    );
}

#[test]
fn test_static_switch_folds_with_fallthrough() {
    let program = convert(
        ProgramKind::Fragment,
        "void main() { int x = 0; @switch (2) { case 1: x = 1; break; case 2: x = 2; case 3: x = 3; break; default: x = 4; } }",
    );
    match &main_statements(&program)[1].kind {
        StatementKind::Block { statements, .. } => assert_eq!(statements.len(), 2),
        other => panic!("Expected folded block, got {:?}", other),
    }
    assert_eq!(
        errors(ProgramKind::Fragment, "void main() { int x = 0; switch (x) { case 1: break; case 1: break; } }"),
        vec!["duplicate case value"]
    );
}

#[test]
fn test_enum_cases_are_constants() {
    let program = convert(
        ProgramKind::Fragment,
        "enum class Mode { A, B = 5, C }; void main() { int x = int(Mode::C); }",
    );
    assert_eq!(local_value(&program, 0).as_int(), Some(6));
    assert!(program.elements.iter().any(|e| matches!(e, ProgramElement::Enum(_))));
}

#[test]
fn test_caps_fold_static_if() {
    let mut settings = Settings::default();
    settings.cap_values.insert("integerSupport".into(), CapValue::Bool(false));
    let (program, errors) = convert_with(
        ProgramKind::Fragment,
        &settings,
        "void main() { @if (sk_Caps.integerSupport) { sk_FragColor = half4(1); } }",
    );
    assert!(errors.is_empty(), "{:?}", errors);
    match &main_statements(&program)[0].kind {
        StatementKind::Block { statements, .. } => assert!(statements.is_empty()),
        other => panic!("Expected empty block, got {:?}", other),
    }
    let (_, errors) = convert_with(ProgramKind::Fragment, &settings, "void main() { bool b = sk_Caps.missing; }");
    assert_eq!(errors, vec!["unknown capability flag 'missing'"]);
}

#[test]
fn test_vertex_main_normalizes_position() {
    let program = convert(
        ProgramKind::Vertex,
        "uniform float4 sk_RTAdjust; void main() { sk_Position = float4(1); }",
    );
    let statements = main_statements(&program);
    assert_eq!(statements.len(), 2);
    match &statements[1].kind {
        StatementKind::Expression { expression } => {
            let text = program.describe_expression(expression);
            assert!(text.starts_with("(sk_Position = float4("), "{}", text);
            assert!(text.contains("sk_RTAdjust.xz"), "{}", text);
        }
        other => panic!("Expected normalize statement, got {:?}", other),
    }
    let program = convert(ProgramKind::Vertex, "void main() { sk_Position = float4(1); }");
    assert_eq!(main_statements(&program).len(), 1);
}

#[test]
fn test_geometry_invocations_without_support() {
    let mut settings = Settings::default();
    settings.caps.gs_invocations_support = false;
    let (program, errors) = convert_with(
        ProgramKind::Geometry,
        &settings,
        "layout(points, invocations = 2) in; layout(points, max_vertices = 1) out; \
         void main() { sk_Position = float4(sk_InvocationID); EmitVertex(); }",
    );
    assert!(errors.is_empty(), "{:?}", errors);
    let invoke = program.functions.iter().find(|(_, f)| f.name == "_invoke");
    assert!(invoke.is_some());
    let max_vertices = program.elements.iter().find_map(|e| match e {
        ProgramElement::Modifiers { modifiers, .. } if modifiers.layout.max_vertices >= 0 => {
            Some(modifiers.layout.max_vertices)
        }
        _ => None,
    });
    assert_eq!(max_vertices, Some(2));
    match &main_statements(&program)[0].kind {
        StatementKind::For { .. } => {}
        other => panic!("Expected invocation loop, got {:?}", other),
    }
}

#[test]
fn test_frag_coord_requests_rt_flip() {
    let program = convert(ProgramKind::Fragment, "void main() { sk_FragColor = half4(sk_FragCoord); }");
    assert!(program.inputs.rt_flip);
    let program = convert(ProgramKind::Fragment, "void main() { sk_FragColor = half4(1); }");
    assert!(!program.inputs.rt_flip);
}

#[test]
fn test_pipeline_main_signature() {
    convert(ProgramKind::Pipeline, "half4 main(float2 coords) { return half4(half2(coords), 0, 1); }");
    assert_eq!(
        errors(ProgramKind::Pipeline, "half4 main(int x) { return half4(1); }"),
        vec!["pipeline stage 'main' must be declared main() or main(float2)"]
    );
    assert_eq!(
        errors(ProgramKind::Fragment, "void main(float x) {}"),
        vec!["shader 'main' must have zero parameters"]
    );
}

#[test]
fn test_prototype_then_definition() {
    let program = convert(
        ProgramKind::Fragment,
        "float f(float x); void main() { float y = f(1); } float f(float value) { return value * 2; }",
    );
    assert!(matches!(program.elements[0], ProgramElement::FunctionPrototype { .. }));
    assert_eq!(
        errors(ProgramKind::Fragment, "float f(float x); int f(float x) { return 1; } void main() {}"),
        vec!["functions 'f' differ only in return type ('float' and 'int')"]
    );
    assert_eq!(
        errors(ProgramKind::Fragment, "void f() {} void f() {} void main() {}"),
        vec!["duplicate definition of 'f'"]
    );
}

#[test]
fn test_external_functions() {
    let context = Rc::new(Context::new());
    let mut errors = ErrorReporter::new();
    let mut generator = IRGenerator::new(context.clone(), &Settings::default(), ProgramKind::Pipeline, &mut errors);
    generator.add_external("scale", vec![context.float_type.clone()], context.float_type.clone());
    let program = generator.convert_program("half4 main() { return half4(half(scale(2))); }").unwrap();
    assert_eq!(errors.error_count(), 0);
    assert_eq!(program.externals.len(), 1);

    let mut errors = ErrorReporter::new();
    let mut generator = IRGenerator::new(context.clone(), &Settings::default(), ProgramKind::Pipeline, &mut errors);
    generator.add_external("scale", vec![context.float_type.clone()], context.float_type.clone());
    generator.convert_program("half4 main() { float f = scale; return half4(1); }").unwrap();
    assert_eq!(errors.diagnostics()[0].message, "external function 'scale' must be called");
}
