//! Untyped syntax tree produced by the parser and consumed by the IR generator.
//!
//! Every node is an `AstNode { offset, kind, children }`. The meaning of the
//! children depends on the kind:
//!
//! | kind | children |
//! |---|---|
//! | `File` | top-level declarations |
//! | `VarDeclarations` | `Type`, then one or more `VarDeclaration` |
//! | `VarDeclaration` | `size_count` sizes (`Null` for `[]`), then an optional initializer |
//! | `Function` | return `Type`, `parameter_count` `Parameter`s, optional body `Block` |
//! | `Parameter` | `Type`, then `size_count` sizes |
//! | `Type` | array sizes, or field `VarDeclarations` when `is_structure` |
//! | `InterfaceBlock` | field `VarDeclarations`, then `size_count` sizes |
//! | `Enum` | `EnumCase`s; an `EnumCase` has an optional value |
//! | `Binary` | left, right |
//! | `Prefix` / `Postfix` | operand |
//! | `Ternary` | test, if-true, if-false |
//! | `Call` | callee, arguments |
//! | `Field` | base |
//! | `Index` | base, optional index |
//! | `Block` | statements |
//! | `If` | test, if-true, optional if-false |
//! | `For` | initializer, test, next (each may be `Null`), body |
//! | `While` | test, body |
//! | `Do` | body, test |
//! | `Switch` | value, `SwitchCase`s |
//! | `SwitchCase` | value (`Null` for `default`), statements |
//! | `Return` | optional value |
//!
//! An expression kind in statement position is an expression statement.

use crate::error::Offset;
use crate::ir::Operator;
use crate::modifiers::Modifiers;

#[derive(Debug, Clone, PartialEq)]
pub enum AstKind {
    /// Placeholder for an absent optional child.
    Null,
    Binary(Operator),
    Block,
    Bool(bool),
    Break,
    Call,
    Continue,
    Discard,
    Do,
    Enum(String),
    EnumCase(String),
    Extension(String),
    Field(String),
    File,
    Float(f64),
    For,
    Function { modifiers: Modifiers, name: String, parameter_count: usize },
    Identifier(String),
    Index,
    If { is_static: bool },
    Int(i64),
    InterfaceBlock { modifiers: Modifiers, type_name: String, instance_name: String, size_count: usize },
    Modifiers(Modifiers),
    NullLiteral,
    Parameter { modifiers: Modifiers, name: String, size_count: usize },
    Postfix(Operator),
    Prefix(Operator),
    Return,
    Section { name: String, argument: String, text: String },
    Switch { is_static: bool },
    SwitchCase,
    Ternary,
    Type { name: String, is_structure: bool, is_nullable: bool },
    VarDeclaration { name: String, size_count: usize },
    VarDeclarations(Modifiers),
    While,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AstNode {
    pub offset: Offset,
    pub kind: AstKind,
    pub children: Vec<AstNode>,
}

impl AstNode {
    pub fn new(offset: Offset, kind: AstKind, children: Vec<AstNode>) -> Self {
        AstNode { offset, kind, children }
    }

    pub fn leaf(offset: Offset, kind: AstKind) -> Self {
        AstNode::new(offset, kind, Vec::new())
    }

    pub fn null(offset: Offset) -> Self {
        AstNode::leaf(offset, AstKind::Null)
    }

    pub fn is_null(&self) -> bool {
        self.kind == AstKind::Null
    }

    /// The child at `index` unless it is an absent (`Null`) placeholder.
    pub fn optional_child(&self, index: usize) -> Option<&AstNode> {
        self.children.get(index).filter(|c| !c.is_null())
    }

    pub fn is_expression(&self) -> bool {
        matches!(
            self.kind,
            AstKind::Binary(_)
                | AstKind::Bool(_)
                | AstKind::Call
                | AstKind::Field(_)
                | AstKind::Float(_)
                | AstKind::Identifier(_)
                | AstKind::Index
                | AstKind::Int(_)
                | AstKind::NullLiteral
                | AstKind::Postfix(_)
                | AstKind::Prefix(_)
                | AstKind::Ternary
        )
    }
}
