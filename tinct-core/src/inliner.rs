//! Function inlining.
//!
//! Each pass runs in two phases over every function body.
//!
//! Discovery walks the bodies read-only and records every call as a
//! candidate. A candidate is identified by its function element, the pre-order
//! index of the statement that will receive the inlined code, and the
//! post-order index of the call among that statement's own expressions.
//! Ternary branches, the right side of `&&`/`||` and loop tests are never
//! searched, since hoisting a call out of them would change how often it runs.
//!
//! Candidates are then filtered, and application walks the bodies again in the
//! same order. It splices an unscoped block holding the inlined body in front
//! of each receiving statement and replaces the call with a reference to the
//! result variable. The tree is never rewritten while discovery holds
//! references into it.

use crate::analysis::{
    contains_return_inside_breakable, is_trivial_expression, node_count, returns_only_at_end,
    statement_writes_to_variable,
};
use crate::constant_folding::ConstantFolder;
use crate::error::{ErrorReporter, Offset};
use crate::ir::*;
use crate::modifiers::Modifiers;
use crate::symbols::{Symbol, SymbolTableId};
use crate::types::TypeRef;
use crate::usage::ProgramUsage;
use crate::visitor::{walk_expression, walk_statement, ProgramVisitor};
use log::debug;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::ControlFlow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InlineCandidate {
    element: usize,
    statement: usize,
    call: usize,
    caller: FuncId,
    callee: FuncId,
}

/// Call ordinals to inline, keyed by receiving statement index.
type StatementPlan = HashMap<usize, HashSet<usize>>;

#[derive(Debug, Default)]
pub struct Inliner {
    /// Source of the `_N_` prefixes on synthesized names; shared by all passes
    /// so names stay unique across the fixpoint.
    next_id: usize,
}

impl Inliner {
    pub fn new() -> Self {
        Inliner::default()
    }

    /// Runs one discovery and application pass. Returns true if any call was
    /// inlined.
    pub fn inline_pass(&mut self, program: &mut Program, errors: &mut ErrorReporter) -> bool {
        program.usage = ProgramUsage::compute(program);
        let candidates = find_candidates(program);
        let recursive = recursive_functions(program);

        let mut plan: BTreeMap<usize, StatementPlan> = BTreeMap::new();
        for candidate in &candidates {
            match is_safe_to_inline(program, candidate, &recursive) {
                Ok(()) => {
                    debug!(
                        "inlining call to '{}' in '{}'",
                        program.functions[candidate.callee].name, program.functions[candidate.caller].name
                    );
                    plan.entry(candidate.element)
                        .or_default()
                        .entry(candidate.statement)
                        .or_default()
                        .insert(candidate.call);
                }
                Err(reason) => debug!(
                    "not inlining call to '{}' in '{}': {}",
                    program.functions[candidate.callee].name, program.functions[candidate.caller].name, reason
                ),
            }
        }
        if plan.is_empty() {
            return false;
        }

        let scope = program.symbols;
        for (element, calls) in &plan {
            let mut body = match &mut program.elements[*element] {
                ProgramElement::Function(def) => std::mem::replace(&mut def.body, Statement::nop()),
                other => unreachable!("inline candidate outside a function: {:?}", other),
            };
            let mut applier = InlineApplier {
                program: &mut *program,
                errors: &mut *errors,
                next_id: &mut self.next_id,
                calls,
                statement_index: 0,
            };
            applier.apply_statement(&mut body, scope, false);
            if let ProgramElement::Function(def) = &mut program.elements[*element] {
                def.body = body;
            }
        }

        remove_dead_statements(program);
        program.usage = ProgramUsage::compute(program);
        true
    }
}

/// Drops the recursion sentinels once inlining has reached its fixpoint.
pub fn remove_inline_markers(program: &mut Program) {
    fn strip(statement: &mut Statement) {
        for_each_child_statement(statement, &mut strip);
        if let StatementKind::InlineMarker { .. } = statement.kind {
            *statement = Statement::nop();
        }
    }
    for element in &mut program.elements {
        if let ProgramElement::Function(def) = element {
            strip(&mut def.body);
        }
    }
    remove_dead_statements(program);
}

fn is_safe_to_inline(
    program: &Program,
    candidate: &InlineCandidate,
    recursive: &HashSet<FuncId>,
) -> Result<(), &'static str> {
    let callee = &program.functions[candidate.callee];
    let definition = program.function_definition(candidate.callee).ok_or("no definition available")?;
    if callee.modifiers.has(Modifiers::NO_INLINE) {
        return Err("marked noinline");
    }
    if recursive.contains(&candidate.callee) {
        return Err("function is recursive");
    }
    if contains_return_inside_breakable(&definition.body) {
        return Err("return inside a loop or switch");
    }
    if !returns_only_at_end(&definition.body) && !program.settings.caps.can_use_do_while {
        return Err("early return needs do-while");
    }
    if !callee.modifiers.has(Modifiers::INLINE)
        && program.usage.call_count(candidate.callee) > 1
        && node_count(definition) > program.settings.inline_threshold
    {
        return Err("too large to duplicate");
    }
    Ok(())
}

// --- discovery ---

fn find_candidates(program: &Program) -> Vec<InlineCandidate> {
    let mut finder = CandidateFinder { candidates: Vec::new(), element: 0, caller: None, statement_index: 0 };
    for (element, e) in program.elements.iter().enumerate() {
        if let ProgramElement::Function(def) = e {
            finder.element = element;
            finder.caller = Some(def.declaration);
            finder.statement_index = 0;
            finder.visit_statement(&def.body);
        }
    }
    finder.candidates
}

struct CandidateFinder {
    candidates: Vec<InlineCandidate>,
    element: usize,
    caller: Option<FuncId>,
    statement_index: usize,
}

impl CandidateFinder {
    fn visit_statement(&mut self, statement: &Statement) {
        let index = self.statement_index;
        self.statement_index += 1;
        for child in child_statements(statement) {
            self.visit_statement(child);
        }
        let mut call = 0;
        for expression in own_expressions(statement) {
            self.visit_expression(expression, index, &mut call);
        }
    }

    fn visit_expression(&mut self, expression: &Expression, statement: usize, call: &mut usize) {
        for child in candidate_children(expression) {
            self.visit_expression(child, statement, call);
        }
        if let ExpressionKind::FunctionCall { function, .. } = expression.kind {
            if let Some(caller) = self.caller {
                self.candidates.push(InlineCandidate {
                    element: self.element,
                    statement,
                    call: *call,
                    caller,
                    callee: function,
                });
            }
            *call += 1;
        }
    }
}

// The next four helpers define the traversal order shared by discovery and
// application; their shared-reference and mutable forms must stay in step.

fn child_statements(statement: &Statement) -> Vec<&Statement> {
    match &statement.kind {
        StatementKind::Block { statements, .. } => statements.iter().collect(),
        StatementKind::If { if_true, if_false, .. } => {
            let mut children = vec![if_true.as_ref()];
            children.extend(if_false.as_deref());
            children
        }
        StatementKind::For { body, .. } | StatementKind::While { body, .. } | StatementKind::Do { body, .. } => {
            vec![body.as_ref()]
        }
        StatementKind::Switch { cases, .. } => cases.iter().flat_map(|c| c.statements.iter()).collect(),
        _ => Vec::new(),
    }
}

/// Expressions evaluated by `statement` itself, whose calls can be hoisted in
/// front of it. Only the first declarator of a declaration qualifies, since
/// later initializers may read the earlier variables.
fn own_expressions(statement: &Statement) -> Vec<&Expression> {
    match &statement.kind {
        StatementKind::Expression { expression } => vec![expression],
        StatementKind::VarDeclarations { declarations } => {
            declarations.vars.first().and_then(|v| v.value.as_ref()).into_iter().collect()
        }
        StatementKind::If { test, .. } => vec![test],
        StatementKind::Switch { value, .. } => vec![value],
        StatementKind::Return { expression } => expression.iter().collect(),
        StatementKind::For { initializer: Some(initializer), .. } => own_expressions(initializer),
        _ => Vec::new(),
    }
}

fn own_expressions_mut(statement: &mut Statement) -> Vec<&mut Expression> {
    match &mut statement.kind {
        StatementKind::Expression { expression } => vec![expression],
        StatementKind::VarDeclarations { declarations } => {
            declarations.vars.first_mut().and_then(|v| v.value.as_mut()).into_iter().collect()
        }
        StatementKind::If { test, .. } => vec![test],
        StatementKind::Switch { value, .. } => vec![value],
        StatementKind::Return { expression } => expression.iter_mut().collect(),
        StatementKind::For { initializer: Some(initializer), .. } => own_expressions_mut(initializer),
        _ => Vec::new(),
    }
}

fn candidate_children(expression: &Expression) -> Vec<&Expression> {
    match &expression.kind {
        ExpressionKind::Binary { left, op: Operator::LogicalAnd | Operator::LogicalOr, .. } => vec![left.as_ref()],
        ExpressionKind::Binary { left, right, .. } => vec![left.as_ref(), right.as_ref()],
        ExpressionKind::Ternary { test, .. } => vec![test.as_ref()],
        ExpressionKind::Prefix { operand, .. } | ExpressionKind::Postfix { operand, .. } => vec![operand.as_ref()],
        ExpressionKind::Constructor { arguments }
        | ExpressionKind::FunctionCall { arguments, .. }
        | ExpressionKind::ExternalFunctionCall { arguments, .. } => arguments.iter().collect(),
        ExpressionKind::FieldAccess { base, .. } | ExpressionKind::Swizzle { base, .. } => vec![base.as_ref()],
        ExpressionKind::Index { base, index } => vec![base.as_ref(), index.as_ref()],
        _ => Vec::new(),
    }
}

fn candidate_children_mut(expression: &mut Expression) -> Vec<&mut Expression> {
    match &mut expression.kind {
        ExpressionKind::Binary { left, op: Operator::LogicalAnd | Operator::LogicalOr, .. } => vec![left.as_mut()],
        ExpressionKind::Binary { left, right, .. } => vec![left.as_mut(), right.as_mut()],
        ExpressionKind::Ternary { test, .. } => vec![test.as_mut()],
        ExpressionKind::Prefix { operand, .. } | ExpressionKind::Postfix { operand, .. } => vec![operand.as_mut()],
        ExpressionKind::Constructor { arguments }
        | ExpressionKind::FunctionCall { arguments, .. }
        | ExpressionKind::ExternalFunctionCall { arguments, .. } => arguments.iter_mut().collect(),
        ExpressionKind::FieldAccess { base, .. } | ExpressionKind::Swizzle { base, .. } => vec![base.as_mut()],
        ExpressionKind::Index { base, index } => vec![base.as_mut(), index.as_mut()],
        _ => Vec::new(),
    }
}

fn for_each_child_statement(statement: &mut Statement, f: &mut impl FnMut(&mut Statement)) {
    match &mut statement.kind {
        StatementKind::Block { statements, .. } => statements.iter_mut().for_each(f),
        StatementKind::If { if_true, if_false, .. } => {
            f(if_true.as_mut());
            if let Some(if_false) = if_false {
                f(if_false.as_mut());
            }
        }
        StatementKind::For { body, .. } | StatementKind::While { body, .. } | StatementKind::Do { body, .. } => {
            f(body.as_mut())
        }
        StatementKind::Switch { cases, .. } => {
            cases.iter_mut().flat_map(|c| c.statements.iter_mut()).for_each(f)
        }
        _ => {}
    }
}

// --- recursion ---

struct CallCollector {
    callees: Vec<FuncId>,
}

impl ProgramVisitor for CallCollector {
    type Break = ();

    fn visit_statement(&mut self, statement: &Statement) -> ControlFlow<()> {
        if let StatementKind::InlineMarker { function } = statement.kind {
            self.callees.push(function);
        }
        walk_statement(self, statement)
    }

    fn visit_expression(&mut self, expression: &Expression) -> ControlFlow<()> {
        if let ExpressionKind::FunctionCall { function, .. } = expression.kind {
            self.callees.push(function);
        }
        walk_expression(self, expression)
    }
}

/// Functions that can reach themselves through calls or through the markers
/// of bodies already inlined into them.
fn recursive_functions(program: &Program) -> HashSet<FuncId> {
    let mut graph: HashMap<FuncId, Vec<FuncId>> = HashMap::new();
    for def in program.function_definitions() {
        let mut collector = CallCollector { callees: Vec::new() };
        let _ = collector.visit_statement(&def.body);
        graph.entry(def.declaration).or_default().extend(collector.callees);
    }
    let mut recursive = HashSet::new();
    for &start in graph.keys() {
        let mut stack: Vec<FuncId> = graph[&start].clone();
        let mut seen = HashSet::new();
        while let Some(next) = stack.pop() {
            if next == start {
                recursive.insert(start);
                break;
            }
            if seen.insert(next) {
                if let Some(callees) = graph.get(&next) {
                    stack.extend(callees.iter().copied());
                }
            }
        }
    }
    recursive
}

// --- application ---

struct InlineApplier<'a> {
    program: &'a mut Program,
    errors: &'a mut ErrorReporter,
    next_id: &'a mut usize,
    calls: &'a StatementPlan,
    statement_index: usize,
}

/// Per-call state while cloning the callee body.
struct CloneContext {
    prefix: String,
    scope: SymbolTableId,
    remap: HashMap<VarId, Expression>,
    result: Option<(VarId, TypeRef)>,
    early_return: bool,
}

impl InlineApplier<'_> {
    fn apply_statement(&mut self, statement: &mut Statement, scope: SymbolTableId, control_body: bool) {
        let index = self.statement_index;
        self.statement_index += 1;
        let inner_scope = match &statement.kind {
            StatementKind::Block { symbols: Some(symbols), .. }
            | StatementKind::For { symbols: Some(symbols), .. }
            | StatementKind::Switch { symbols: Some(symbols), .. } => *symbols,
            _ => scope,
        };
        match &mut statement.kind {
            StatementKind::Block { statements, .. } => {
                for child in statements {
                    self.apply_statement(child, inner_scope, false);
                }
            }
            StatementKind::If { if_true, if_false, .. } => {
                self.apply_statement(if_true, scope, true);
                if let Some(if_false) = if_false {
                    self.apply_statement(if_false, scope, true);
                }
            }
            StatementKind::For { body, .. } => self.apply_statement(body, inner_scope, true),
            StatementKind::While { body, .. } | StatementKind::Do { body, .. } => {
                self.apply_statement(body, scope, true)
            }
            StatementKind::Switch { cases, .. } => {
                for child in cases.iter_mut().flat_map(|c| c.statements.iter_mut()) {
                    self.apply_statement(child, inner_scope, false);
                }
            }
            _ => {}
        }

        let calls = self.calls;
        let selected = match calls.get(&index) {
            Some(selected) => selected,
            None => return,
        };
        let mut inlined = Vec::new();
        let mut call = 0;
        for expression in own_expressions_mut(statement) {
            self.rewrite_calls(expression, scope, selected, &mut call, &mut inlined);
        }
        if inlined.is_empty() {
            return;
        }
        let offset = statement.offset;
        inlined.push(std::mem::replace(statement, Statement::nop()));
        *statement = Statement::block(offset, inlined, None, false);
        if control_body {
            ensure_scoped_blocks(statement);
        }
    }

    fn rewrite_calls(
        &mut self,
        expression: &mut Expression,
        scope: SymbolTableId,
        selected: &HashSet<usize>,
        call: &mut usize,
        inlined: &mut Vec<Statement>,
    ) {
        for child in candidate_children_mut(expression) {
            self.rewrite_calls(child, scope, selected, call, inlined);
        }
        if let ExpressionKind::FunctionCall { .. } = expression.kind {
            let ordinal = *call;
            *call += 1;
            if selected.contains(&ordinal) {
                let placeholder = Expression::bool_literal(&self.program.context, expression.offset, false);
                let original = std::mem::replace(expression, placeholder);
                let (statements, replacement) = self.inline_call(original, scope);
                inlined.extend(statements);
                *expression = replacement;
            }
        }
    }

    /// Builds the statements that compute `call` and the expression that
    /// stands in for the call afterwards.
    fn inline_call(&mut self, call: Expression, scope: SymbolTableId) -> (Vec<Statement>, Expression) {
        let offset = call.offset;
        let (function, arguments) = match call.kind {
            ExpressionKind::FunctionCall { function, arguments } => (function, arguments),
            other => unreachable!("inline candidate is not a call: {:?}", other),
        };
        let declaration = self.program.functions[function].clone();
        let body = match self.program.function_definition(function) {
            Some(def) => def.body.clone(),
            None => unreachable!("inline candidate '{}' has no definition", declaration.name),
        };
        let prefix = format!("_{}_", *self.next_id);
        *self.next_id += 1;

        let mut statements = vec![Statement::new(offset, StatementKind::InlineMarker { function })];
        let result = if declaration.return_type.is_void() {
            None
        } else {
            let ty = declaration.return_type.clone();
            let var = self.declare_local(scope, Modifiers::default(), format!("{}{}", prefix, declaration.name), ty.clone());
            statements.push(var_declaration(offset, var, ty.clone(), None));
            Some((var, ty))
        };

        let mut remap = HashMap::new();
        let mut copy_back = Vec::new();
        for (param, argument) in declaration.parameters.iter().zip(arguments) {
            let variable = self.program.variables[*param].clone();
            let is_out = variable.modifiers.has(Modifiers::OUT);
            if is_trivial_expression(&argument) && (is_out || !statement_writes_to_variable(&body, *param)) {
                remap.insert(*param, argument);
                continue;
            }
            let name = format!("{}{}", prefix, variable.name);
            let temp = self.declare_local(scope, Modifiers::default(), name, variable.ty.clone());
            let value = if is_out && !variable.modifiers.has(Modifiers::IN) {
                None
            } else {
                Some(with_ref_kind(argument.clone(), RefKind::Read))
            };
            statements.push(var_declaration(offset, temp, variable.ty.clone(), value));
            if is_out {
                let target = with_ref_kind(argument, RefKind::Write);
                let source = Expression::variable_reference(offset, variable.ty.clone(), temp, RefKind::Read);
                let ty = target.ty.clone();
                copy_back.push(Statement::expression(Expression::binary(offset, target, Operator::Eq, source, ty)));
            }
            remap.insert(*param, Expression::variable_reference(offset, variable.ty, temp, RefKind::Read));
        }

        let mut context = CloneContext {
            prefix,
            scope,
            remap,
            result: result.clone(),
            early_return: !returns_only_at_end(&body),
        };
        let inlined = self.clone_statement(&body, &mut context);
        if context.early_return {
            let test = Expression::bool_literal(&self.program.context, offset, false);
            statements.push(Statement::new(offset, StatementKind::Do { body: Box::new(inlined), test }));
        } else {
            match inlined.kind {
                StatementKind::Block { statements: body, .. } => statements.extend(body),
                _ => statements.push(inlined),
            }
        }
        statements.extend(copy_back);

        let replacement = match result {
            Some((var, ty)) => Expression::variable_reference(offset, ty, var, RefKind::Read),
            None => Expression::bool_literal(&self.program.context, offset, false),
        };
        (statements, replacement)
    }

    fn declare_local(&mut self, scope: SymbolTableId, modifiers: Modifiers, name: String, ty: TypeRef) -> VarId {
        let var = self.program.variables.append(Variable::new(-1, modifiers, name.clone(), ty, Storage::Local));
        self.program.symbol_tables.add(scope, &name, Symbol::Variable(var));
        var
    }

    fn clone_statement(&mut self, statement: &Statement, cx: &mut CloneContext) -> Statement {
        let kind = match &statement.kind {
            StatementKind::Block { statements, symbols, is_scope } => StatementKind::Block {
                statements: statements.iter().map(|s| self.clone_statement(s, cx)).collect(),
                symbols: *symbols,
                is_scope: *is_scope,
            },
            StatementKind::If { is_static, test, if_true, if_false } => StatementKind::If {
                is_static: *is_static,
                test: self.clone_expression(test, cx),
                if_true: Box::new(self.clone_statement(if_true, cx)),
                if_false: if_false.as_ref().map(|s| Box::new(self.clone_statement(s, cx))),
            },
            StatementKind::For { initializer, test, next, body, symbols } => StatementKind::For {
                initializer: initializer.as_ref().map(|s| Box::new(self.clone_statement(s, cx))),
                test: test.as_ref().map(|e| self.clone_expression(e, cx)),
                next: next.as_ref().map(|e| self.clone_expression(e, cx)),
                body: Box::new(self.clone_statement(body, cx)),
                symbols: *symbols,
            },
            StatementKind::While { test, body } => StatementKind::While {
                test: self.clone_expression(test, cx),
                body: Box::new(self.clone_statement(body, cx)),
            },
            StatementKind::Do { body, test } => StatementKind::Do {
                body: Box::new(self.clone_statement(body, cx)),
                test: self.clone_expression(test, cx),
            },
            StatementKind::Switch { is_static, value, cases, symbols } => StatementKind::Switch {
                is_static: *is_static,
                value: self.clone_expression(value, cx),
                cases: cases
                    .iter()
                    .map(|case| SwitchCase {
                        offset: case.offset,
                        value: case.value.as_ref().map(|v| self.clone_expression(v, cx)),
                        statements: case.statements.iter().map(|s| self.clone_statement(s, cx)).collect(),
                    })
                    .collect(),
                symbols: *symbols,
            },
            StatementKind::Return { expression } => return self.clone_return(statement.offset, expression.as_ref(), cx),
            StatementKind::Expression { expression } => {
                StatementKind::Expression { expression: self.clone_expression(expression, cx) }
            }
            StatementKind::VarDeclarations { declarations } => {
                StatementKind::VarDeclarations { declarations: self.clone_var_declarations(declarations, cx) }
            }
            other => other.clone(),
        };
        Statement::new(statement.offset, kind)
    }

    /// Callee locals get fresh names so two copies of one body can share a
    /// scope.
    fn clone_var_declarations(&mut self, declarations: &VarDeclarations, cx: &mut CloneContext) -> VarDeclarations {
        let mut vars = Vec::with_capacity(declarations.vars.len());
        for declaration in &declarations.vars {
            let sizes = declaration.sizes.iter().map(|s| s.as_ref().map(|e| self.clone_expression(e, cx))).collect();
            let value = declaration.value.as_ref().map(|e| self.clone_expression(e, cx));
            let original = self.program.variables[declaration.var].clone();
            let name = format!("{}{}", cx.prefix, original.name);
            let var = self.declare_local(cx.scope, original.modifiers.clone(), name, original.ty.clone());
            self.program.variables[var].initial_value = original.initial_value.clone();
            cx.remap.insert(declaration.var, Expression::variable_reference(declaration.offset, original.ty, var, RefKind::Read));
            vars.push(VarDeclaration { offset: declaration.offset, var, sizes, value });
        }
        VarDeclarations { offset: declarations.offset, base_type: declarations.base_type.clone(), vars }
    }

    fn clone_return(&mut self, offset: Offset, expression: Option<&Expression>, cx: &mut CloneContext) -> Statement {
        let result = cx.result.clone();
        let assignment = match (expression, result) {
            (Some(value), Some((var, ty))) => {
                let value = self.clone_expression(value, cx);
                let target = Expression::variable_reference(offset, ty.clone(), var, RefKind::Write);
                Some(Statement::expression(Expression::binary(offset, target, Operator::Eq, value, ty)))
            }
            _ => None,
        };
        match (assignment, cx.early_return) {
            (Some(assignment), true) => {
                Statement::block(offset, vec![assignment, Statement::new(offset, StatementKind::Break)], None, true)
            }
            (Some(assignment), false) => assignment,
            (None, true) => Statement::new(offset, StatementKind::Break),
            (None, false) => Statement::nop(),
        }
    }

    fn clone_expression(&mut self, expression: &Expression, cx: &mut CloneContext) -> Expression {
        let clone_all = |this: &mut Self, cx: &mut CloneContext, arguments: &[Expression]| -> Vec<Expression> {
            arguments.iter().map(|a| this.clone_expression(a, cx)).collect()
        };
        let kind = match &expression.kind {
            ExpressionKind::VariableReference { variable, ref_kind } => {
                return match cx.remap.get(variable) {
                    Some(replacement) => with_ref_kind(replacement.clone(), *ref_kind),
                    None => expression.clone(),
                };
            }
            ExpressionKind::Binary { left, op, right } => {
                let left = self.clone_expression(left, cx);
                let right = self.clone_expression(right, cx);
                if !op.is_assignment() {
                    let folder = ConstantFolder::new(&self.program.context);
                    if let Some(folded) = folder.fold_binary(self.errors, &left, *op, &right) {
                        return folded;
                    }
                }
                ExpressionKind::Binary { left: Box::new(left), op: *op, right: Box::new(right) }
            }
            ExpressionKind::Prefix { op, operand } => {
                let operand = self.clone_expression(operand, cx);
                if let Some(folded) = ConstantFolder::new(&self.program.context).fold_prefix(*op, &operand) {
                    return folded;
                }
                ExpressionKind::Prefix { op: *op, operand: Box::new(operand) }
            }
            ExpressionKind::Postfix { operand, op } => {
                ExpressionKind::Postfix { operand: Box::new(self.clone_expression(operand, cx)), op: *op }
            }
            ExpressionKind::Ternary { test, if_true, if_false } => {
                let test = self.clone_expression(test, cx);
                if let ExpressionKind::BoolLiteral(value) = test.kind {
                    return self.clone_expression(if value { if_true } else { if_false }, cx);
                }
                ExpressionKind::Ternary {
                    test: Box::new(test),
                    if_true: Box::new(self.clone_expression(if_true, cx)),
                    if_false: Box::new(self.clone_expression(if_false, cx)),
                }
            }
            ExpressionKind::Constructor { arguments } => {
                ExpressionKind::Constructor { arguments: clone_all(self, cx, arguments) }
            }
            ExpressionKind::FunctionCall { function, arguments } => {
                ExpressionKind::FunctionCall { function: *function, arguments: clone_all(self, cx, arguments) }
            }
            ExpressionKind::ExternalFunctionCall { function, arguments } => {
                ExpressionKind::ExternalFunctionCall { function: *function, arguments: clone_all(self, cx, arguments) }
            }
            ExpressionKind::FieldAccess { base, field_index, owner } => ExpressionKind::FieldAccess {
                base: Box::new(self.clone_expression(base, cx)),
                field_index: *field_index,
                owner: *owner,
            },
            ExpressionKind::Index { base, index } => ExpressionKind::Index {
                base: Box::new(self.clone_expression(base, cx)),
                index: Box::new(self.clone_expression(index, cx)),
            },
            ExpressionKind::Swizzle { base, components } => ExpressionKind::Swizzle {
                base: Box::new(self.clone_expression(base, cx)),
                components: components.clone(),
            },
            _ => return expression.clone(),
        };
        Expression::new(expression.offset, expression.ty.clone(), kind)
    }
}

fn var_declaration(offset: Offset, var: VarId, ty: TypeRef, value: Option<Expression>) -> Statement {
    Statement::new(
        offset,
        StatementKind::VarDeclarations {
            declarations: VarDeclarations {
                offset,
                base_type: ty,
                vars: vec![VarDeclaration { offset, var, sizes: Vec::new(), value }],
            },
        },
    )
}

/// Re-targets the variable at the root of an lvalue chain.
fn with_ref_kind(mut expression: Expression, kind: RefKind) -> Expression {
    fn set(expression: &mut Expression, kind: RefKind) {
        match &mut expression.kind {
            ExpressionKind::VariableReference { ref_kind, .. } => *ref_kind = kind,
            ExpressionKind::FieldAccess { base, .. }
            | ExpressionKind::Swizzle { base, .. }
            | ExpressionKind::Index { base, .. } => set(base, kind),
            _ => {}
        }
    }
    set(&mut expression, kind);
    expression
}

/// A block spliced in as the body of an `if` or loop must keep its braces,
/// through any chain of single-statement unscoped blocks.
fn ensure_scoped_blocks(statement: &mut Statement) {
    if let StatementKind::Block { statements, is_scope, .. } = &mut statement.kind {
        if *is_scope {
            return;
        }
        match statements.as_mut_slice() {
            [only @ Statement { kind: StatementKind::Block { .. }, .. }] => ensure_scoped_blocks(only),
            _ => *is_scope = true,
        }
    }
}

/// Removes `Nop`s, empty unscoped blocks and the literal placeholders left
/// where void calls were inlined.
fn remove_dead_statements(program: &mut Program) {
    fn is_dead(statement: &Statement) -> bool {
        statement.is_empty()
            || matches!(&statement.kind, StatementKind::Expression { expression } if expression.is_literal())
    }
    fn clean(statement: &mut Statement) {
        for_each_child_statement(statement, &mut clean);
        match &mut statement.kind {
            StatementKind::Block { statements, .. } => statements.retain(|s| !is_dead(s)),
            StatementKind::Switch { cases, .. } => {
                for case in cases {
                    case.statements.retain(|s| !is_dead(s));
                }
            }
            _ => {}
        }
    }
    for element in &mut program.elements {
        if let ProgramElement::Function(def) = element {
            clean(&mut def.body);
        }
    }
}
