use super::IRGenerator;
use crate::ast::{AstKind, AstNode};
use crate::error::Offset;
use crate::ir::*;
use crate::settings::ProgramKind;
use crate::symbols::SymbolTableId;
use crate::types::TypeKind;
use log::trace;

/// True if `statement` holds a `break` that would leave an enclosing switch.
fn contains_switch_break(statement: &Statement) -> bool {
    match &statement.kind {
        StatementKind::Break => true,
        StatementKind::Block { statements, .. } => statements.iter().any(contains_switch_break),
        StatementKind::If { if_true, if_false, .. } => {
            contains_switch_break(if_true) || if_false.as_deref().map_or(false, contains_switch_break)
        }
        _ => false,
    }
}

impl IRGenerator<'_> {
    pub(super) fn convert_statement(&mut self, node: &AstNode) -> Option<Statement> {
        match &node.kind {
            AstKind::Block => self.convert_block(node),
            AstKind::VarDeclarations(_) => {
                let declarations = self.convert_var_declarations(node, Storage::Local)?;
                if declarations.vars.is_empty() {
                    return Some(Statement::nop());
                }
                Some(Statement::new(node.offset, StatementKind::VarDeclarations { declarations }))
            }
            AstKind::If { is_static } => self.convert_if(node, *is_static),
            AstKind::For => self.convert_for(node),
            AstKind::While => self.convert_while(node),
            AstKind::Do => self.convert_do(node),
            AstKind::Switch { is_static } => {
                let is_static = *is_static;
                self.with_switch_level(|this| this.with_scope(|this, scope| this.convert_switch(node, is_static, scope)))
            }
            AstKind::Return => self.convert_return(node),
            AstKind::Break => {
                if self.loop_level == 0 && self.switch_level == 0 {
                    self.errors.error(node.offset, "break statement must be inside a loop or switch");
                    return None;
                }
                Some(Statement::new(node.offset, StatementKind::Break))
            }
            AstKind::Continue => {
                if self.loop_level == 0 {
                    self.errors.error(node.offset, "continue statement must be inside a loop");
                    return None;
                }
                Some(Statement::new(node.offset, StatementKind::Continue))
            }
            AstKind::Discard => {
                if !matches!(self.kind, ProgramKind::Fragment | ProgramKind::Pipeline) {
                    self.errors.error(node.offset, "discard statement is only permitted in fragment shaders");
                    return None;
                }
                Some(Statement::new(node.offset, StatementKind::Discard))
            }
            _ => self.convert_expression_statement(node),
        }
    }

    fn convert_block(&mut self, node: &AstNode) -> Option<Statement> {
        self.with_scope(|this, scope| {
            let mut statements = Vec::with_capacity(node.children.len());
            for child in &node.children {
                statements.push(this.convert_statement(child)?);
            }
            Some(Statement::block(node.offset, statements, Some(scope), true))
        })
    }

    fn convert_condition(&mut self, node: &AstNode) -> Option<Expression> {
        let test = self.convert_expression(node)?;
        let bool_type = self.context.bool_type.clone();
        self.coerce(test, &bool_type)
    }

    fn convert_if(&mut self, node: &AstNode, is_static: bool) -> Option<Statement> {
        let test = self.convert_condition(&node.children[0])?;
        let if_true = self.convert_statement(&node.children[1])?;
        let if_false = match node.children.get(2) {
            Some(child) => Some(self.convert_statement(child)?),
            None => None,
        };
        let constant = match test.kind {
            ExpressionKind::BoolLiteral(value) => Some(value),
            _ if is_static => test.as_bool(),
            _ => None,
        };
        if let Some(value) = constant {
            trace!("folded if at {} to its {} branch", node.offset, value);
            return Some(if value {
                if_true
            } else {
                if_false.unwrap_or_else(|| Statement::block(node.offset, Vec::new(), None, true))
            });
        }
        if is_static {
            self.errors.error(test.offset, "static if has non-static test");
            return None;
        }
        Some(Statement::new(
            node.offset,
            StatementKind::If { is_static, test, if_true: Box::new(if_true), if_false: if_false.map(Box::new) },
        ))
    }

    fn convert_for(&mut self, node: &AstNode) -> Option<Statement> {
        self.with_scope(|this, scope| {
            let initializer = match node.optional_child(0) {
                Some(child) => Some(Box::new(this.convert_statement(child)?)),
                None => None,
            };
            let test = match node.optional_child(1) {
                Some(child) => Some(this.convert_condition(child)?),
                None => None,
            };
            let next = match node.optional_child(2) {
                Some(child) => Some(this.convert_expression(child)?),
                None => None,
            };
            let body = this.with_loop_level(|this| this.convert_statement(&node.children[3]))?;
            Some(Statement::new(
                node.offset,
                StatementKind::For { initializer, test, next, body: Box::new(body), symbols: Some(scope) },
            ))
        })
    }

    fn convert_while(&mut self, node: &AstNode) -> Option<Statement> {
        let test = self.convert_condition(&node.children[0])?;
        let body = self.with_loop_level(|this| this.convert_statement(&node.children[1]))?;
        Some(Statement::new(node.offset, StatementKind::While { test, body: Box::new(body) }))
    }

    fn convert_do(&mut self, node: &AstNode) -> Option<Statement> {
        let body = self.with_loop_level(|this| this.convert_statement(&node.children[0]))?;
        let test = self.convert_condition(&node.children[1])?;
        Some(Statement::new(node.offset, StatementKind::Do { body: Box::new(body), test }))
    }

    fn convert_switch(&mut self, node: &AstNode, is_static: bool, scope: SymbolTableId) -> Option<Statement> {
        let value = self.convert_expression(&node.children[0])?;
        let value = if value.ty.is_unsigned() || matches!(value.ty.kind, TypeKind::Enum) {
            value
        } else {
            let int = self.context.int_type.clone();
            self.coerce(value, &int)?
        };
        let mut cases = Vec::with_capacity(node.children.len() - 1);
        let mut seen_values: Vec<i64> = Vec::new();
        let mut seen_default = false;
        for case_node in &node.children[1..] {
            let case_value = match case_node.optional_child(0) {
                Some(value_node) => {
                    let case_value = self.convert_expression(value_node)?;
                    let case_value = self.coerce(case_value, &value.ty)?;
                    let constant = match case_value.as_int() {
                        Some(constant) => constant,
                        None => {
                            self.errors.error(value_node.offset, "case value must be a constant integer");
                            return None;
                        }
                    };
                    if seen_values.contains(&constant) {
                        self.errors.error(value_node.offset, "duplicate case value");
                        return None;
                    }
                    seen_values.push(constant);
                    Some(case_value)
                }
                None => {
                    if seen_default {
                        self.errors.error(case_node.offset, "duplicate default case");
                        return None;
                    }
                    seen_default = true;
                    None
                }
            };
            let mut statements = Vec::with_capacity(case_node.children.len() - 1);
            for child in &case_node.children[1..] {
                statements.push(self.convert_statement(child)?);
            }
            cases.push(SwitchCase { offset: case_node.offset, value: case_value, statements });
        }
        if is_static {
            return match value.as_int() {
                Some(target) => self.fold_static_switch(node.offset, target, cases, scope),
                None => {
                    self.errors.error(value.offset, "static switch has non-static test");
                    None
                }
            };
        }
        Some(Statement::new(
            node.offset,
            StatementKind::Switch { is_static, value, cases, symbols: Some(scope) },
        ))
    }

    /// Keeps the statements from the matching case (or `default`) up to the
    /// first top-level `break`, following fallthrough.
    fn fold_static_switch(
        &mut self,
        offset: Offset,
        target: i64,
        cases: Vec<SwitchCase>,
        scope: SymbolTableId,
    ) -> Option<Statement> {
        let start = cases
            .iter()
            .position(|c| c.value.as_ref().and_then(Expression::as_int) == Some(target))
            .or_else(|| cases.iter().position(|c| c.value.is_none()));
        let start = match start {
            Some(start) => start,
            None => return Some(Statement::block(offset, Vec::new(), Some(scope), true)),
        };
        let mut statements = Vec::new();
        'cases: for case in cases.into_iter().skip(start) {
            for statement in case.statements {
                if matches!(statement.kind, StatementKind::Break) {
                    break 'cases;
                }
                if contains_switch_break(&statement) {
                    self.errors.error(statement.offset, "static switch contains non-static conditional break");
                    return None;
                }
                statements.push(statement);
            }
        }
        Some(Statement::block(offset, statements, Some(scope), true))
    }

    fn convert_return(&mut self, node: &AstNode) -> Option<Statement> {
        let function = self.current_function?;
        let return_type = self.functions[function].return_type.clone();
        let expression = match node.children.first() {
            Some(value_node) => {
                if return_type.is_void() {
                    self.errors.error(value_node.offset, "may not return a value from a void function");
                    return None;
                }
                let value = self.convert_expression(value_node)?;
                Some(self.coerce(value, &return_type)?)
            }
            None => {
                if !return_type.is_void() {
                    self.errors.error(node.offset, format!("expected function to return '{}'", return_type));
                    return None;
                }
                None
            }
        };
        Some(Statement::new(node.offset, StatementKind::Return { expression }))
    }

    fn convert_expression_statement(&mut self, node: &AstNode) -> Option<Statement> {
        let expression = self.convert_expression(node)?;
        let emits_vertex = self.kind == ProgramKind::Geometry
            && matches!(
                &expression.kind,
                ExpressionKind::FunctionCall { function, .. }
                    if self.functions[*function].builtin && self.functions[*function].name == "EmitVertex"
            );
        let statement = Statement::expression(expression);
        if emits_vertex {
            if let Some(normalize) = self.normalize_sk_position() {
                return Some(Statement::block(node.offset, vec![normalize, statement], None, true));
            }
        }
        Some(statement)
    }
}
