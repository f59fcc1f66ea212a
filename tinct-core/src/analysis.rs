//! Read-only queries over the IR, built on `ProgramVisitor`.

use crate::builtins::{SK_FRAGCOORD_BUILTIN, SK_MAIN_COORDS_BUILTIN};
use crate::ir::*;
use crate::modifiers::Modifiers;
use crate::visitor::{walk_expression, walk_program, walk_program_element, walk_statement, ProgramVisitor};
use std::ops::ControlFlow;

/// How a child shader is sampled, ordered from least to most general.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleUsage {
    None,
    PassThrough,
    /// Sampled at explicit 2D coordinates.
    Explicit,
    /// Sampled through a matrix that is constant per draw. Holds the matrix
    /// expression text.
    UniformMatrix(String),
    /// Sampled through a matrix that varies per invocation.
    VariableMatrix,
}

impl SampleUsage {
    fn rank(&self) -> u8 {
        match self {
            SampleUsage::None => 0,
            SampleUsage::PassThrough => 1,
            SampleUsage::Explicit => 2,
            SampleUsage::UniformMatrix(_) => 3,
            SampleUsage::VariableMatrix => 4,
        }
    }

    /// Least upper bound of two usages. Two different uniform matrices cannot
    /// share one uniform, so they widen to `VariableMatrix`.
    pub fn merge(self, other: SampleUsage) -> SampleUsage {
        match (self, other) {
            (SampleUsage::UniformMatrix(a), SampleUsage::UniformMatrix(b)) => {
                if a == b {
                    SampleUsage::UniformMatrix(a)
                } else {
                    SampleUsage::VariableMatrix
                }
            }
            (a, b) => {
                if a.rank() >= b.rank() {
                    a
                } else {
                    b
                }
            }
        }
    }
}

struct SampleUsageVisitor<'a> {
    program: &'a Program,
    child: VarId,
    usage: SampleUsage,
}

impl<'a> SampleUsageVisitor<'a> {
    fn classify(&self, arguments: &[Expression]) -> SampleUsage {
        let last = match arguments.last() {
            Some(last) if arguments.len() > 1 => last,
            _ => return SampleUsage::PassThrough,
        };
        let ty = &last.ty;
        if ty.is_vector() && ty.columns() == 2 && ty.component_type().is_float() {
            SampleUsage::Explicit
        } else if ty.is_matrix() {
            if is_constant_or_uniform(self.program, last) {
                SampleUsage::UniformMatrix(self.program.describe_expression(last))
            } else {
                SampleUsage::VariableMatrix
            }
        } else {
            SampleUsage::PassThrough
        }
    }
}

impl<'a> ProgramVisitor for SampleUsageVisitor<'a> {
    type Break = ();

    fn visit_expression(&mut self, expression: &Expression) -> ControlFlow<()> {
        if let ExpressionKind::FunctionCall { function, arguments } = &expression.kind {
            if self.program.function(*function).name == "sample" {
                if let Some(ExpressionKind::VariableReference { variable, .. }) =
                    arguments.first().map(|a| &a.kind)
                {
                    if *variable == self.child {
                        let usage = self.classify(arguments);
                        self.usage = std::mem::replace(&mut self.usage, SampleUsage::None).merge(usage);
                    }
                }
            }
        }
        walk_expression(self, expression)
    }
}

/// Merged sampling strategy across every `sample(child, ...)` call.
pub fn get_sample_usage(program: &Program, child: VarId) -> SampleUsage {
    let mut visitor = SampleUsageVisitor { program, child, usage: SampleUsage::None };
    let _ = walk_program(&mut visitor, program);
    visitor.usage
}

struct BuiltinVisitor<'a> {
    program: &'a Program,
    builtin: i32,
}

impl<'a> ProgramVisitor for BuiltinVisitor<'a> {
    type Break = ();

    fn visit_expression(&mut self, expression: &Expression) -> ControlFlow<()> {
        if let ExpressionKind::VariableReference { variable, .. } = &expression.kind {
            if self.program.variable(*variable).modifiers.layout.builtin == self.builtin {
                return ControlFlow::Break(());
            }
        }
        walk_expression(self, expression)
    }
}

pub fn references_builtin(program: &Program, builtin: i32) -> bool {
    let mut visitor = BuiltinVisitor { program, builtin };
    walk_program(&mut visitor, program).is_break()
}

pub fn references_sample_coords(program: &Program) -> bool {
    references_builtin(program, SK_MAIN_COORDS_BUILTIN)
}

pub fn references_frag_coords(program: &Program) -> bool {
    references_builtin(program, SK_FRAGCOORD_BUILTIN)
}

struct NodeCountVisitor {
    count: usize,
}

impl ProgramVisitor for NodeCountVisitor {
    type Break = ();

    fn visit_program_element(&mut self, element: &ProgramElement) -> ControlFlow<()> {
        self.count += 1;
        walk_program_element(self, element)
    }

    fn visit_statement(&mut self, statement: &Statement) -> ControlFlow<()> {
        self.count += 1;
        walk_statement(self, statement)
    }

    fn visit_expression(&mut self, expression: &Expression) -> ControlFlow<()> {
        self.count += 1;
        walk_expression(self, expression)
    }
}

/// Size of a function in IR nodes, used by the inliner's size heuristic.
pub fn node_count(function: &FunctionDefinition) -> usize {
    let mut visitor = NodeCountVisitor { count: 1 };
    let _ = visitor.visit_statement(&function.body);
    visitor.count
}

struct VariableWriteVisitor {
    var: VarId,
}

impl ProgramVisitor for VariableWriteVisitor {
    type Break = ();

    fn visit_expression(&mut self, expression: &Expression) -> ControlFlow<()> {
        if let ExpressionKind::VariableReference { variable, ref_kind } = &expression.kind {
            if *variable == self.var && *ref_kind != RefKind::Read {
                return ControlFlow::Break(());
            }
        }
        walk_expression(self, expression)
    }
}

/// True if `statement` writes `var` anywhere (plain, compound, or through an
/// out parameter).
pub fn statement_writes_to_variable(statement: &Statement, var: VarId) -> bool {
    VariableWriteVisitor { var }.visit_statement(statement).is_break()
}

struct SideEffectVisitor<'a> {
    program: &'a Program,
}

impl<'a> ProgramVisitor for SideEffectVisitor<'a> {
    type Break = ();

    fn visit_expression(&mut self, expression: &Expression) -> ControlFlow<()> {
        match &expression.kind {
            ExpressionKind::Binary { op, .. } if op.is_assignment() => return ControlFlow::Break(()),
            ExpressionKind::Prefix { op: Operator::PlusPlus | Operator::MinusMinus, .. }
            | ExpressionKind::Postfix { .. }
            | ExpressionKind::ExternalFunctionCall { .. } => return ControlFlow::Break(()),
            ExpressionKind::FunctionCall { function, .. } => {
                let decl = self.program.function(*function);
                if !decl.builtin || decl.modifiers.has(Modifiers::HAS_SIDE_EFFECTS) {
                    return ControlFlow::Break(());
                }
            }
            _ => {}
        }
        walk_expression(self, expression)
    }
}

/// True if evaluating `expression` can change program state. Calls to
/// user-defined functions are assumed to have side effects.
pub fn has_side_effects(program: &Program, expression: &Expression) -> bool {
    SideEffectVisitor { program }.visit_expression(expression).is_break()
}

/// An expression cheap and pure enough to duplicate instead of copying into a
/// temporary: literals and variables, optionally wrapped in swizzles, field
/// accesses, single-argument constructors and constant-index lookups.
pub fn is_trivial_expression(expression: &Expression) -> bool {
    match &expression.kind {
        ExpressionKind::BoolLiteral(_)
        | ExpressionKind::IntLiteral(_)
        | ExpressionKind::FloatLiteral(_)
        | ExpressionKind::VariableReference { .. } => true,
        ExpressionKind::Swizzle { base, .. } | ExpressionKind::FieldAccess { base, .. } => {
            is_trivial_expression(base)
        }
        ExpressionKind::Constructor { arguments } => {
            arguments.len() == 1 && is_trivial_expression(&arguments[0])
        }
        ExpressionKind::Index { base, index } => {
            matches!(index.kind, ExpressionKind::IntLiteral(_)) && is_trivial_expression(base)
        }
        _ => false,
    }
}

/// True if every variable read by `expression` is a uniform or a constant and
/// it calls nothing with side effects.
pub fn is_constant_or_uniform(program: &Program, expression: &Expression) -> bool {
    struct Visitor<'a> {
        program: &'a Program,
    }
    impl<'a> ProgramVisitor for Visitor<'a> {
        type Break = ();
        fn visit_expression(&mut self, expression: &Expression) -> ControlFlow<()> {
            match &expression.kind {
                ExpressionKind::VariableReference { variable, .. } => {
                    let v = self.program.variable(*variable);
                    if !v.modifiers.has(Modifiers::UNIFORM) && !v.modifiers.has(Modifiers::CONST) {
                        return ControlFlow::Break(());
                    }
                    ControlFlow::Continue(())
                }
                ExpressionKind::FunctionCall { .. } | ExpressionKind::ExternalFunctionCall { .. } => {
                    ControlFlow::Break(())
                }
                _ => walk_expression(self, expression),
            }
        }
    }
    Visitor { program }.visit_expression(expression).is_continue()
}

/// True if `statement` contains a `return` nested inside a loop or switch.
pub fn contains_return_inside_breakable(statement: &Statement) -> bool {
    fn scan(statement: &Statement, depth: usize) -> bool {
        match &statement.kind {
            StatementKind::Return { .. } => depth > 0,
            StatementKind::Block { statements, .. } => statements.iter().any(|s| scan(s, depth)),
            StatementKind::If { if_true, if_false, .. } => {
                scan(if_true, depth) || if_false.as_ref().map_or(false, |s| scan(s, depth))
            }
            StatementKind::For { body, .. }
            | StatementKind::While { body, .. }
            | StatementKind::Do { body, .. } => scan(body, depth + 1),
            StatementKind::Switch { cases, .. } => cases
                .iter()
                .any(|c| c.statements.iter().any(|s| scan(s, depth + 1))),
            _ => false,
        }
    }
    scan(statement, 0)
}

/// Number of `return` statements in `statement`.
pub fn count_returns(statement: &Statement) -> usize {
    struct Counter(usize);
    impl ProgramVisitor for Counter {
        type Break = ();
        fn visit_statement(&mut self, statement: &Statement) -> ControlFlow<()> {
            if let StatementKind::Return { .. } = statement.kind {
                self.0 += 1;
            }
            walk_statement(self, statement)
        }
        fn visit_expression(&mut self, _: &Expression) -> ControlFlow<()> {
            ControlFlow::Continue(())
        }
    }
    let mut counter = Counter(0);
    let _ = counter.visit_statement(statement);
    counter.0
}

/// True if the only `return`s in `body` are in tail position: the last
/// statement of the body, or the tail of both branches of a trailing `if`.
pub fn returns_only_at_end(body: &Statement) -> bool {
    fn tail_returns(statement: &Statement) -> usize {
        match &statement.kind {
            StatementKind::Return { .. } => 1,
            StatementKind::Block { statements, .. } => statements
                .iter()
                .rev()
                .find(|s| !s.is_empty())
                .map_or(0, tail_returns),
            StatementKind::If { if_true, if_false: Some(if_false), .. } => {
                let t = tail_returns(if_true);
                let f = tail_returns(if_false);
                if t > 0 && f > 0 {
                    t + f
                } else {
                    0
                }
            }
            _ => 0,
        }
    }
    count_returns(body) == tail_returns(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_usage_merge_is_a_lattice() {
        use SampleUsage::*;
        let all = [
            None,
            PassThrough,
            Explicit,
            UniformMatrix("m".into()),
            UniformMatrix("n".into()),
            VariableMatrix,
        ];
        for a in &all {
            for b in &all {
                assert_eq!(a.clone().merge(b.clone()), b.clone().merge(a.clone()));
                for c in &all {
                    assert_eq!(
                        a.clone().merge(b.clone()).merge(c.clone()),
                        a.clone().merge(b.clone().merge(c.clone()))
                    );
                }
            }
        }
        assert_eq!(Explicit.merge(PassThrough), Explicit);
        assert_eq!(UniformMatrix("m".into()).merge(Explicit), UniformMatrix("m".into()));
        assert_eq!(UniformMatrix("m".into()).merge(UniformMatrix("n".into())), VariableMatrix);
    }
}
