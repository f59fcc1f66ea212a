//! Read-only traversal over the IR.
//!
//! Queries implement `ProgramVisitor` and override only the hooks they need;
//! the `walk_*` functions recurse into every child in structural order
//! (binary left before right; loop initializer, test, next, body). Returning
//! `ControlFlow::Break` from any hook stops the whole traversal.

use crate::ir::*;
use std::ops::ControlFlow;

pub trait ProgramVisitor: Sized {
    type Break;

    fn visit_program_element(&mut self, element: &ProgramElement) -> ControlFlow<Self::Break> {
        walk_program_element(self, element)
    }

    fn visit_statement(&mut self, statement: &Statement) -> ControlFlow<Self::Break> {
        walk_statement(self, statement)
    }

    fn visit_expression(&mut self, expression: &Expression) -> ControlFlow<Self::Break> {
        walk_expression(self, expression)
    }
}

pub fn walk_program<V: ProgramVisitor>(v: &mut V, program: &Program) -> ControlFlow<V::Break> {
    for element in &program.elements {
        v.visit_program_element(element)?;
    }
    ControlFlow::Continue(())
}

pub fn walk_program_element<V: ProgramVisitor>(
    v: &mut V,
    element: &ProgramElement,
) -> ControlFlow<V::Break> {
    match element {
        ProgramElement::Function(def) => v.visit_statement(&def.body),
        ProgramElement::GlobalVar(decls) => walk_var_declarations(v, decls),
        ProgramElement::InterfaceBlock(block) => {
            for size in block.sizes.iter().flatten() {
                v.visit_expression(size)?;
            }
            ControlFlow::Continue(())
        }
        ProgramElement::FunctionPrototype { .. }
        | ProgramElement::Extension { .. }
        | ProgramElement::Modifiers { .. }
        | ProgramElement::Enum(_)
        | ProgramElement::StructDefinition { .. }
        | ProgramElement::Section(_) => ControlFlow::Continue(()),
    }
}

pub fn walk_var_declarations<V: ProgramVisitor>(
    v: &mut V,
    decls: &VarDeclarations,
) -> ControlFlow<V::Break> {
    for decl in &decls.vars {
        for size in decl.sizes.iter().flatten() {
            v.visit_expression(size)?;
        }
        if let Some(value) = &decl.value {
            v.visit_expression(value)?;
        }
    }
    ControlFlow::Continue(())
}

pub fn walk_statement<V: ProgramVisitor>(v: &mut V, statement: &Statement) -> ControlFlow<V::Break> {
    match &statement.kind {
        StatementKind::Block { statements, .. } => {
            for s in statements {
                v.visit_statement(s)?;
            }
            ControlFlow::Continue(())
        }
        StatementKind::If { test, if_true, if_false, .. } => {
            v.visit_expression(test)?;
            v.visit_statement(if_true)?;
            if let Some(if_false) = if_false {
                v.visit_statement(if_false)?;
            }
            ControlFlow::Continue(())
        }
        StatementKind::For { initializer, test, next, body, .. } => {
            if let Some(init) = initializer {
                v.visit_statement(init)?;
            }
            if let Some(test) = test {
                v.visit_expression(test)?;
            }
            if let Some(next) = next {
                v.visit_expression(next)?;
            }
            v.visit_statement(body)
        }
        StatementKind::While { test, body } => {
            v.visit_expression(test)?;
            v.visit_statement(body)
        }
        StatementKind::Do { body, test } => {
            v.visit_statement(body)?;
            v.visit_expression(test)
        }
        StatementKind::Switch { value, cases, .. } => {
            v.visit_expression(value)?;
            for case in cases {
                if let Some(case_value) = &case.value {
                    v.visit_expression(case_value)?;
                }
                for s in &case.statements {
                    v.visit_statement(s)?;
                }
            }
            ControlFlow::Continue(())
        }
        StatementKind::Return { expression } => match expression {
            Some(e) => v.visit_expression(e),
            None => ControlFlow::Continue(()),
        },
        StatementKind::Expression { expression } => v.visit_expression(expression),
        StatementKind::VarDeclarations { declarations } => walk_var_declarations(v, declarations),
        StatementKind::Break
        | StatementKind::Continue
        | StatementKind::Discard
        | StatementKind::InlineMarker { .. }
        | StatementKind::Nop => ControlFlow::Continue(()),
    }
}

pub fn walk_expression<V: ProgramVisitor>(v: &mut V, expression: &Expression) -> ControlFlow<V::Break> {
    match &expression.kind {
        ExpressionKind::BoolLiteral(_)
        | ExpressionKind::IntLiteral(_)
        | ExpressionKind::FloatLiteral(_)
        | ExpressionKind::NullLiteral
        | ExpressionKind::VariableReference { .. }
        | ExpressionKind::FunctionReference { .. }
        | ExpressionKind::TypeReference { .. }
        | ExpressionKind::Setting { .. } => ControlFlow::Continue(()),
        ExpressionKind::Binary { left, right, .. } => {
            v.visit_expression(left)?;
            v.visit_expression(right)
        }
        ExpressionKind::Prefix { operand, .. } | ExpressionKind::Postfix { operand, .. } => {
            v.visit_expression(operand)
        }
        ExpressionKind::Ternary { test, if_true, if_false } => {
            v.visit_expression(test)?;
            v.visit_expression(if_true)?;
            v.visit_expression(if_false)
        }
        ExpressionKind::Constructor { arguments }
        | ExpressionKind::FunctionCall { arguments, .. }
        | ExpressionKind::ExternalFunctionCall { arguments, .. } => {
            for arg in arguments {
                v.visit_expression(arg)?;
            }
            ControlFlow::Continue(())
        }
        ExpressionKind::FieldAccess { base, .. } | ExpressionKind::Swizzle { base, .. } => {
            v.visit_expression(base)
        }
        ExpressionKind::Index { base, index } => {
            v.visit_expression(base)?;
            v.visit_expression(index)
        }
    }
}
