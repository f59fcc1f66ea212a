//! Per-variable reference counts and per-function call counts.

use crate::ir::*;
use crate::modifiers::Modifiers;
use crate::visitor::{walk_expression, walk_statement, walk_var_declarations, ProgramVisitor};
use std::collections::HashMap;
use std::ops::ControlFlow;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VariableCounts {
    pub declared: usize,
    pub read: usize,
    pub write: usize,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgramUsage {
    variables: HashMap<VarId, VariableCounts>,
    calls: HashMap<FuncId, usize>,
}

impl ProgramUsage {
    /// Counts every reference and call in the program's elements.
    pub fn compute(program: &Program) -> Self {
        let mut counter = UsageCounter { usage: ProgramUsage::default() };
        for element in &program.elements {
            let _ = counter.visit_program_element(element);
        }
        counter.usage
    }

    pub fn get(&self, var: VarId) -> VariableCounts {
        self.variables.get(&var).copied().unwrap_or_default()
    }

    pub fn call_count(&self, function: FuncId) -> usize {
        self.calls.get(&function).copied().unwrap_or(0)
    }

    /// A variable nothing reads and the outside world cannot observe.
    pub fn is_dead(&self, program: &Program, var: VarId) -> bool {
        let v = program.variable(var);
        if v.builtin
            || v.modifiers.flags & (Modifiers::IN | Modifiers::OUT | Modifiers::UNIFORM | Modifiers::BUFFER) != 0
            || v.storage == Storage::InterfaceBlock
        {
            return false;
        }
        self.get(var).read == 0
    }
}

struct UsageCounter {
    usage: ProgramUsage,
}

impl ProgramVisitor for UsageCounter {
    type Break = ();

    fn visit_statement(&mut self, statement: &Statement) -> ControlFlow<()> {
        if let StatementKind::VarDeclarations { declarations } = &statement.kind {
            for decl in &declarations.vars {
                self.usage.variables.entry(decl.var).or_default().declared += 1;
            }
            return walk_var_declarations(self, declarations);
        }
        walk_statement(self, statement)
    }

    fn visit_expression(&mut self, expression: &Expression) -> ControlFlow<()> {
        match &expression.kind {
            ExpressionKind::VariableReference { variable, ref_kind } => {
                let counts = self.usage.variables.entry(*variable).or_default();
                match ref_kind {
                    RefKind::Read => counts.read += 1,
                    RefKind::Write => counts.write += 1,
                    RefKind::ReadWrite | RefKind::Pointer => {
                        counts.read += 1;
                        counts.write += 1;
                    }
                }
            }
            ExpressionKind::FunctionCall { function, .. } => {
                *self.usage.calls.entry(*function).or_insert(0) += 1;
            }
            _ => {}
        }
        walk_expression(self, expression)
    }

    fn visit_program_element(&mut self, element: &ProgramElement) -> ControlFlow<()> {
        if let ProgramElement::GlobalVar(decls) = element {
            for decl in &decls.vars {
                self.usage.variables.entry(decl.var).or_default().declared += 1;
            }
        }
        crate::visitor::walk_program_element(self, element)
    }
}
