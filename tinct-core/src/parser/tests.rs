use super::*;
use crate::lexer::tokenize;
use crate::types::Context;

fn type_names() -> HashSet<String> {
    Context::new().named_types().map(|(name, _)| name.clone()).collect()
}

fn parse(input: &str) -> AstNode {
    let tokens = tokenize(input).expect("Failed to tokenize input");
    let mut parser = Parser::new(tokens.clone(), type_names());
    match parser.parse() {
        Ok(file) => file,
        Err(e) => {
            println!("Tokens were: {:#?}", tokens);
            panic!("Failed to parse input: {:?}", e);
        }
    }
}

fn parse_expr(input: &str) -> AstNode {
    let file = parse(&format!("void main() {{ {}; }}", input));
    let body = file.children[0].children.last().unwrap().clone();
    body.children[0].clone()
}

#[test]
fn test_parse_function_with_parameters() {
    let file = parse("float f(float x, inout int y[2]) { return x; }");
    assert_eq!(file.children.len(), 1);
    let function = &file.children[0];
    match &function.kind {
        AstKind::Function { name, parameter_count, .. } => {
            assert_eq!(name, "f");
            assert_eq!(*parameter_count, 2);
        }
        other => panic!("Expected function, got {:?}", other),
    }
    match &function.children[2].kind {
        AstKind::Parameter { modifiers, name, size_count } => {
            assert_eq!(name, "y");
            assert_eq!(*size_count, 1);
            assert!(modifiers.has(Modifiers::IN) && modifiers.has(Modifiers::OUT));
        }
        other => panic!("Expected parameter, got {:?}", other),
    }
    assert_eq!(function.children[3].kind, AstKind::Block);
}

#[test]
fn test_parse_prototype_and_void_parameter_list() {
    let file = parse("void f(void);");
    assert_eq!(
        file.children[0].kind,
        AstKind::Function { modifiers: Modifiers::default(), name: "f".into(), parameter_count: 0 }
    );
    assert_eq!(file.children[0].children.len(), 1);
}

#[test]
fn test_operator_precedence() {
    // a + b * c  ==>  a + (b * c)
    let e = parse_expr("a + b * c");
    assert_eq!(e.kind, AstKind::Binary(Operator::Plus));
    assert_eq!(e.children[1].kind, AstKind::Binary(Operator::Star));

    // a || b && c  ==>  a || (b && c)
    let e = parse_expr("a || b && c");
    assert_eq!(e.kind, AstKind::Binary(Operator::LogicalOr));
    assert_eq!(e.children[1].kind, AstKind::Binary(Operator::LogicalAnd));

    // a - b - c  ==>  (a - b) - c
    let e = parse_expr("a - b - c");
    assert_eq!(e.children[0].kind, AstKind::Binary(Operator::Minus));
    assert_eq!(e.children[1].kind, AstKind::Identifier("c".into()));
}

#[test]
fn test_assignment_is_right_associative() {
    let e = parse_expr("a = b += c");
    assert_eq!(e.kind, AstKind::Binary(Operator::Eq));
    assert_eq!(e.children[1].kind, AstKind::Binary(Operator::PlusEq));
}

#[test]
fn test_ternary_and_postfix_chain() {
    let e = parse_expr("x > 0 ? v.xy[1] : f(1, 2)++");
    assert_eq!(e.kind, AstKind::Ternary);
    assert_eq!(e.children[1].kind, AstKind::Index);
    assert_eq!(e.children[1].children[0].kind, AstKind::Field("xy".into()));
    assert_eq!(e.children[2].kind, AstKind::Postfix(Operator::PlusPlus));
    assert_eq!(e.children[2].children[0].kind, AstKind::Call);
    assert_eq!(e.children[2].children[0].children.len(), 3);
}

#[test]
fn test_declaration_versus_expression_statement() {
    let file = parse("void main() { float2 x = float2(1); x * y; float[2] a; }");
    let body = &file.children[0].children[1];
    assert_eq!(body.children[0].kind, AstKind::VarDeclarations(Modifiers::default()));
    assert_eq!(body.children[1].kind, AstKind::Binary(Operator::Star));
    let decls = &body.children[2];
    match &decls.children[0].kind {
        AstKind::Type { name, .. } => assert_eq!(name, "float"),
        other => panic!("Expected type, got {:?}", other),
    }
    assert_eq!(decls.children[0].children[0].kind, AstKind::Int(2));
}

#[test]
fn test_struct_declares_type_name() {
    let file = parse("struct S { float x; int y[3]; }; S s; void main() { S t; }");
    match &file.children[0].children[0].kind {
        AstKind::Type { name, is_structure, .. } => {
            assert_eq!(name, "S");
            assert!(is_structure);
        }
        other => panic!("Expected struct, got {:?}", other),
    }
    assert_eq!(file.children[0].children[0].children.len(), 2);
    assert_eq!(file.children[1].children[1].kind, AstKind::VarDeclaration { name: "s".into(), size_count: 0 });
}

#[test]
fn test_layout_and_modifiers() {
    let file = parse("layout(location = 1, set = 0, binding = 2, std140) uniform highp float4 color;");
    match &file.children[0].kind {
        AstKind::VarDeclarations(modifiers) => {
            assert_eq!(modifiers.layout.location, 1);
            assert_eq!(modifiers.layout.set, 0);
            assert_eq!(modifiers.layout.binding, 2);
            assert!(modifiers.layout.flags & Layout::STD140 != 0);
            assert!(modifiers.has(Modifiers::UNIFORM));
            assert!(modifiers.has(Modifiers::HIGHP));
        }
        other => panic!("Expected declarations, got {:?}", other),
    }
}

#[test]
fn test_modifiers_declaration_and_primitive() {
    let file = parse("layout(triangles, invocations = 2) in;");
    match &file.children[0].kind {
        AstKind::Modifiers(modifiers) => {
            assert_eq!(modifiers.layout.primitive, Some(Primitive::Triangles));
            assert_eq!(modifiers.layout.invocations, 2);
            assert!(modifiers.has(Modifiers::IN));
        }
        other => panic!("Expected modifiers, got {:?}", other),
    }
}

#[test]
fn test_interface_block() {
    let file = parse("uniform Globals { float4 a; float b; } globals[2];");
    match &file.children[0].kind {
        AstKind::InterfaceBlock { type_name, instance_name, size_count, .. } => {
            assert_eq!(type_name, "Globals");
            assert_eq!(instance_name, "globals");
            assert_eq!(*size_count, 1);
        }
        other => panic!("Expected interface block, got {:?}", other),
    }
    assert_eq!(file.children[0].children.len(), 3);
}

#[test]
fn test_enum_extension_and_section() {
    let file = parse("#extension GL_EXT_foo : enable\nenum class E { A, B = 5, C };\n@header { raw }");
    assert_eq!(file.children[0].kind, AstKind::Extension("GL_EXT_foo".into()));
    assert_eq!(file.children[1].kind, AstKind::Enum("E".into()));
    assert_eq!(file.children[1].children.len(), 3);
    assert_eq!(file.children[1].children[1].children[0].kind, AstKind::Int(5));
    match &file.children[2].kind {
        AstKind::Section { name, text, .. } => {
            assert_eq!(name, "header");
            assert_eq!(text.trim(), "raw");
        }
        other => panic!("Expected section, got {:?}", other),
    }
}

#[test]
fn test_control_flow_statements() {
    let file = parse(
        "void main() { for (int i = 0; i < 4; i++) { if (i == 2) break; else continue; } \
         do { discard; } while (false); switch (x) { case 1: return; default: } @if (true) {} }",
    );
    let body = &file.children[0].children[1];
    let for_loop = &body.children[0];
    assert_eq!(for_loop.kind, AstKind::For);
    assert_eq!(for_loop.children.len(), 4);
    assert!(matches!(for_loop.children[0].kind, AstKind::VarDeclarations(_)));
    assert_eq!(body.children[1].kind, AstKind::Do);
    let switch = &body.children[2];
    assert_eq!(switch.kind, AstKind::Switch { is_static: false });
    assert_eq!(switch.children.len(), 3);
    assert!(switch.children[2].children[0].is_null());
    assert_eq!(body.children[3].kind, AstKind::If { is_static: true });
}

#[test]
fn test_for_with_empty_clauses() {
    let file = parse("void main() { for (;;) {} }");
    let for_loop = &file.children[0].children[1].children[0];
    assert!(for_loop.children[0].is_null());
    assert!(for_loop.children[1].is_null());
    assert!(for_loop.children[2].is_null());
}

#[test]
fn test_unknown_type_is_an_error() {
    let tokens = tokenize("widget w;").unwrap();
    let mut parser = Parser::new(tokens, type_names());
    match parser.parse() {
        Err(CompilerError::ParseError(msg, Some(0))) => assert!(msg.contains("widget")),
        other => panic!("Expected parse error, got {:?}", other),
    }
}
