//! Typed intermediate representation.
//!
//! Expressions, statements and program elements are closed enums that own
//! their children exclusively. Variables, function declarations and symbol
//! tables live in `Program` arenas and are referenced by handle, so a
//! `VariableReference` never owns the variable it names.

use crate::arena::{Arena, Handle};
use crate::error::Offset;
use crate::modifiers::Modifiers;
use crate::settings::{ProgramKind, Settings};
use crate::symbols::{SymbolTableId, SymbolTables};
use crate::types::{Context, TypeRef};
use crate::usage::ProgramUsage;
use std::fmt;
use std::rc::Rc;

pub type VarId = Handle<Variable>;
pub type FuncId = Handle<FunctionDeclaration>;
pub type ExternalId = Handle<ExternalFunction>;

/// Swizzle component selecting a constant zero.
pub const SWIZZLE_ZERO: i8 = -2;
/// Swizzle component selecting a constant one.
pub const SWIZZLE_ONE: i8 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Shl,
    Shr,
    LogicalNot,
    LogicalAnd,
    LogicalOr,
    LogicalXor,
    BitwiseNot,
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    Eq,
    EqEq,
    Neq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    PlusEq,
    MinusEq,
    StarEq,
    SlashEq,
    PercentEq,
    ShlEq,
    ShrEq,
    BitwiseAndEq,
    BitwiseOrEq,
    BitwiseXorEq,
    LogicalAndEq,
    LogicalOrEq,
    LogicalXorEq,
    PlusPlus,
    MinusMinus,
    Comma,
}

/// Operator binding strength, lowest value binds tightest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
    Parentheses = 1,
    Postfix = 2,
    Prefix = 3,
    Multiplicative = 4,
    Additive = 5,
    Shift = 6,
    Relational = 7,
    Equality = 8,
    BitwiseAnd = 9,
    BitwiseXor = 10,
    BitwiseOr = 11,
    LogicalAnd = 12,
    LogicalXor = 13,
    LogicalOr = 14,
    Ternary = 15,
    Assignment = 16,
    Sequence = 17,
    TopLevel = 18,
}

impl Operator {
    pub fn name(self) -> &'static str {
        use Operator::*;
        match self {
            Plus => "+",
            Minus => "-",
            Star => "*",
            Slash => "/",
            Percent => "%",
            Shl => "<<",
            Shr => ">>",
            LogicalNot => "!",
            LogicalAnd => "&&",
            LogicalOr => "||",
            LogicalXor => "^^",
            BitwiseNot => "~",
            BitwiseAnd => "&",
            BitwiseOr => "|",
            BitwiseXor => "^",
            Eq => "=",
            EqEq => "==",
            Neq => "!=",
            Lt => "<",
            Gt => ">",
            LtEq => "<=",
            GtEq => ">=",
            PlusEq => "+=",
            MinusEq => "-=",
            StarEq => "*=",
            SlashEq => "/=",
            PercentEq => "%=",
            ShlEq => "<<=",
            ShrEq => ">>=",
            BitwiseAndEq => "&=",
            BitwiseOrEq => "|=",
            BitwiseXorEq => "^=",
            LogicalAndEq => "&&=",
            LogicalOrEq => "||=",
            LogicalXorEq => "^^=",
            PlusPlus => "++",
            MinusMinus => "--",
            Comma => ",",
        }
    }

    pub fn is_assignment(self) -> bool {
        use Operator::*;
        matches!(
            self,
            Eq | PlusEq
                | MinusEq
                | StarEq
                | SlashEq
                | PercentEq
                | ShlEq
                | ShrEq
                | BitwiseAndEq
                | BitwiseOrEq
                | BitwiseXorEq
                | LogicalAndEq
                | LogicalOrEq
                | LogicalXorEq
        )
    }

    /// `+=` becomes `+`; other operators are returned unchanged.
    pub fn remove_assignment(self) -> Operator {
        use Operator::*;
        match self {
            PlusEq => Plus,
            MinusEq => Minus,
            StarEq => Star,
            SlashEq => Slash,
            PercentEq => Percent,
            ShlEq => Shl,
            ShrEq => Shr,
            BitwiseAndEq => BitwiseAnd,
            BitwiseOrEq => BitwiseOr,
            BitwiseXorEq => BitwiseXor,
            LogicalAndEq => LogicalAnd,
            LogicalOrEq => LogicalOr,
            LogicalXorEq => LogicalXor,
            other => other,
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Operator::EqEq | Operator::Neq | Operator::Lt | Operator::Gt | Operator::LtEq | Operator::GtEq
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, Operator::LogicalAnd | Operator::LogicalOr | Operator::LogicalXor)
    }

    pub fn binary_precedence(self) -> Precedence {
        use Operator::*;
        match self {
            Star | Slash | Percent => Precedence::Multiplicative,
            Plus | Minus => Precedence::Additive,
            Shl | Shr => Precedence::Shift,
            Lt | Gt | LtEq | GtEq => Precedence::Relational,
            EqEq | Neq => Precedence::Equality,
            BitwiseAnd => Precedence::BitwiseAnd,
            BitwiseXor => Precedence::BitwiseXor,
            BitwiseOr => Precedence::BitwiseOr,
            LogicalAnd => Precedence::LogicalAnd,
            LogicalXor => Precedence::LogicalXor,
            LogicalOr => Precedence::LogicalOr,
            Comma => Precedence::Sequence,
            op if op.is_assignment() => Precedence::Assignment,
            op => unreachable!("'{}' is not a binary operator", op.name()),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a `VariableReference` touches its variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Read,
    Write,
    ReadWrite,
    /// Passed to an `out` parameter: the callee writes through it.
    Pointer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    Global,
    InterfaceBlock,
    Local,
    Parameter,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub offset: Offset,
    pub modifiers: Modifiers,
    pub name: String,
    pub ty: TypeRef,
    pub storage: Storage,
    pub builtin: bool,
    /// Compile-time value of a `const` variable, used by constant folding.
    pub initial_value: Option<Expression>,
}

impl Variable {
    pub fn new(offset: Offset, modifiers: Modifiers, name: impl Into<String>, ty: TypeRef, storage: Storage) -> Self {
        Variable {
            offset,
            modifiers,
            name: name.into(),
            ty,
            storage,
            builtin: false,
            initial_value: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDeclaration {
    pub offset: Offset,
    pub modifiers: Modifiers,
    pub name: String,
    pub parameters: Vec<VarId>,
    pub return_type: TypeRef,
    pub builtin: bool,
    pub defined: bool,
}

impl FunctionDeclaration {
    pub fn new(
        offset: Offset,
        modifiers: Modifiers,
        name: impl Into<String>,
        parameters: Vec<VarId>,
        return_type: TypeRef,
        builtin: bool,
    ) -> Self {
        FunctionDeclaration {
            offset,
            modifiers,
            name: name.into(),
            parameters,
            return_type,
            builtin,
            defined: false,
        }
    }
}

/// A host-provided function callable from shader code.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalFunction {
    pub name: String,
    pub parameters: Vec<TypeRef>,
    pub return_type: TypeRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOwner {
    Default,
    /// The base is an anonymous interface block; the field is written bare.
    AnonymousInterfaceBlock,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    pub offset: Offset,
    pub ty: TypeRef,
    pub kind: ExpressionKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExpressionKind {
    BoolLiteral(bool),
    IntLiteral(i64),
    FloatLiteral(f64),
    NullLiteral,
    Binary { left: Box<Expression>, op: Operator, right: Box<Expression> },
    Prefix { op: Operator, operand: Box<Expression> },
    Postfix { operand: Box<Expression>, op: Operator },
    Ternary { test: Box<Expression>, if_true: Box<Expression>, if_false: Box<Expression> },
    Constructor { arguments: Vec<Expression> },
    FunctionCall { function: FuncId, arguments: Vec<Expression> },
    ExternalFunctionCall { function: ExternalId, arguments: Vec<Expression> },
    FieldAccess { base: Box<Expression>, field_index: usize, owner: FieldOwner },
    Index { base: Box<Expression>, index: Box<Expression> },
    Swizzle { base: Box<Expression>, components: Vec<i8> },
    VariableReference { variable: VarId, ref_kind: RefKind },
    FunctionReference { functions: Vec<FuncId> },
    TypeReference { value: TypeRef },
    /// `sk_Caps.name`, already resolved to a literal.
    Setting { name: String, value: Box<Expression> },
}

impl Expression {
    pub fn new(offset: Offset, ty: TypeRef, kind: ExpressionKind) -> Self {
        Expression { offset, ty, kind }
    }

    pub fn bool_literal(context: &Context, offset: Offset, value: bool) -> Self {
        Expression::new(offset, context.bool_type.clone(), ExpressionKind::BoolLiteral(value))
    }

    pub fn int_literal(context: &Context, offset: Offset, value: i64) -> Self {
        Expression::new(offset, context.int_type.clone(), ExpressionKind::IntLiteral(value))
    }

    pub fn float_literal(context: &Context, offset: Offset, value: f64) -> Self {
        Expression::new(offset, context.float_type.clone(), ExpressionKind::FloatLiteral(value))
    }

    pub fn variable_reference(offset: Offset, ty: TypeRef, variable: VarId, ref_kind: RefKind) -> Self {
        Expression::new(offset, ty, ExpressionKind::VariableReference { variable, ref_kind })
    }

    pub fn binary(offset: Offset, left: Expression, op: Operator, right: Expression, ty: TypeRef) -> Self {
        Expression::new(
            offset,
            ty,
            ExpressionKind::Binary { left: Box::new(left), op, right: Box::new(right) },
        )
    }

    pub fn is_literal(&self) -> bool {
        matches!(
            self.kind,
            ExpressionKind::BoolLiteral(_)
                | ExpressionKind::IntLiteral(_)
                | ExpressionKind::FloatLiteral(_)
                | ExpressionKind::NullLiteral
        )
    }

    /// Literals, settings, and constructors built only from constants.
    pub fn is_compile_time_constant(&self) -> bool {
        match &self.kind {
            ExpressionKind::BoolLiteral(_)
            | ExpressionKind::IntLiteral(_)
            | ExpressionKind::FloatLiteral(_)
            | ExpressionKind::NullLiteral
            | ExpressionKind::Setting { .. } => true,
            ExpressionKind::Constructor { arguments } => {
                arguments.iter().all(Expression::is_compile_time_constant)
            }
            _ => false,
        }
    }

    /// Peels `Setting` wrappers so folding sees the underlying literal.
    pub fn constant_value(&self) -> &Expression {
        match &self.kind {
            ExpressionKind::Setting { value, .. } => value.constant_value(),
            _ => self,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.constant_value().kind {
            ExpressionKind::BoolLiteral(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.constant_value().kind {
            ExpressionKind::IntLiteral(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self.constant_value().kind {
            ExpressionKind::FloatLiteral(f) => Some(f),
            _ => None,
        }
    }

    /// Scalar component `index` of a constant vector or matrix constructor,
    /// as a float. Single-argument scalar constructors splat.
    pub fn constant_float_component(&self, index: usize) -> Option<f64> {
        let value = self.constant_value();
        match &value.kind {
            ExpressionKind::FloatLiteral(f) => Some(*f),
            ExpressionKind::IntLiteral(i) => Some(*i as f64),
            ExpressionKind::Constructor { arguments } => {
                if arguments.len() == 1 && arguments[0].ty.is_scalar() {
                    if value.ty.is_matrix() {
                        // diagonal matrix
                        let rows = value.ty.rows();
                        let (col, row) = (index / rows, index % rows);
                        return if col == row { arguments[0].constant_float_component(0) } else { Some(0.0) };
                    }
                    return arguments[0].constant_float_component(0);
                }
                let mut current = 0;
                for arg in arguments {
                    let slots = arg.ty.slot_count();
                    if index < current + slots {
                        return arg.constant_float_component(index - current);
                    }
                    current += slots;
                }
                None
            }
            _ => None,
        }
    }

    pub fn constant_int_component(&self, index: usize) -> Option<i64> {
        let value = self.constant_value();
        match &value.kind {
            ExpressionKind::IntLiteral(i) => Some(*i),
            ExpressionKind::BoolLiteral(b) => Some(*b as i64),
            ExpressionKind::Constructor { arguments } => {
                if arguments.len() == 1 && arguments[0].ty.is_scalar() {
                    return arguments[0].constant_int_component(0);
                }
                let mut current = 0;
                for arg in arguments {
                    let slots = arg.ty.slot_count();
                    if index < current + slots {
                        return arg.constant_int_component(index - current);
                    }
                    current += slots;
                }
                None
            }
            _ => None,
        }
    }

    /// Compares two compile-time constants of the same type. `None` if either
    /// side cannot be evaluated.
    pub fn compare_constant(&self, other: &Expression) -> Option<bool> {
        let (a, b) = (self.constant_value(), other.constant_value());
        match (&a.kind, &b.kind) {
            (ExpressionKind::BoolLiteral(x), ExpressionKind::BoolLiteral(y)) => Some(x == y),
            (ExpressionKind::IntLiteral(x), ExpressionKind::IntLiteral(y)) => Some(x == y),
            (ExpressionKind::FloatLiteral(x), ExpressionKind::FloatLiteral(y)) => Some(x == y),
            (ExpressionKind::Constructor { .. }, _) | (_, ExpressionKind::Constructor { .. }) => {
                if a.ty != b.ty {
                    return None;
                }
                let slots = a.ty.slot_count();
                let component = a.ty.component_type();
                for i in 0..slots {
                    let equal = if component.is_float() {
                        a.constant_float_component(i)? == b.constant_float_component(i)?
                    } else {
                        a.constant_int_component(i)? == b.constant_int_component(i)?
                    };
                    if !equal {
                        return Some(false);
                    }
                }
                Some(true)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarDeclaration {
    pub offset: Offset,
    pub var: VarId,
    /// Array sizes written after the name; `None` for `[]`.
    pub sizes: Vec<Option<Expression>>,
    pub value: Option<Expression>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarDeclarations {
    pub offset: Offset,
    pub base_type: TypeRef,
    pub vars: Vec<VarDeclaration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchCase {
    pub offset: Offset,
    /// `None` for `default:`.
    pub value: Option<Expression>,
    pub statements: Vec<Statement>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub offset: Offset,
    pub kind: StatementKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementKind {
    Block {
        statements: Vec<Statement>,
        symbols: Option<SymbolTableId>,
        /// False for synthetic groupings that must not introduce braces.
        is_scope: bool,
    },
    If {
        is_static: bool,
        test: Expression,
        if_true: Box<Statement>,
        if_false: Option<Box<Statement>>,
    },
    For {
        initializer: Option<Box<Statement>>,
        test: Option<Expression>,
        next: Option<Expression>,
        body: Box<Statement>,
        symbols: Option<SymbolTableId>,
    },
    While {
        test: Expression,
        body: Box<Statement>,
    },
    Do {
        body: Box<Statement>,
        test: Expression,
    },
    Switch {
        is_static: bool,
        value: Expression,
        cases: Vec<SwitchCase>,
        symbols: Option<SymbolTableId>,
    },
    Return {
        expression: Option<Expression>,
    },
    Break,
    Continue,
    Discard,
    Expression {
        expression: Expression,
    },
    VarDeclarations {
        declarations: VarDeclarations,
    },
    /// Left at an inlined call site so recursion through it can be detected.
    InlineMarker {
        function: FuncId,
    },
    Nop,
}

impl Statement {
    pub fn new(offset: Offset, kind: StatementKind) -> Self {
        Statement { offset, kind }
    }

    pub fn nop() -> Self {
        Statement::new(-1, StatementKind::Nop)
    }

    pub fn block(offset: Offset, statements: Vec<Statement>, symbols: Option<SymbolTableId>, is_scope: bool) -> Self {
        Statement::new(offset, StatementKind::Block { statements, symbols, is_scope })
    }

    pub fn expression(expression: Expression) -> Self {
        Statement::new(expression.offset, StatementKind::Expression { expression })
    }

    /// True for statements that produce no code.
    pub fn is_empty(&self) -> bool {
        match &self.kind {
            StatementKind::Nop => true,
            StatementKind::Block { statements, is_scope, .. } => {
                !is_scope && statements.iter().all(Statement::is_empty)
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDefinition {
    pub offset: Offset,
    pub declaration: FuncId,
    pub body: Statement,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceBlock {
    pub offset: Offset,
    pub variable: VarId,
    pub type_name: String,
    /// Empty for anonymous blocks.
    pub instance_name: String,
    pub sizes: Vec<Option<Expression>>,
    pub symbols: SymbolTableId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumDefinition {
    pub offset: Offset,
    pub type_name: String,
    pub symbols: SymbolTableId,
}

/// `@name(argument) { text }` host-side text attached to the program.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub offset: Offset,
    pub name: String,
    pub argument: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgramElement {
    Function(FunctionDefinition),
    FunctionPrototype { offset: Offset, declaration: FuncId },
    GlobalVar(VarDeclarations),
    InterfaceBlock(InterfaceBlock),
    Extension { offset: Offset, name: String },
    Modifiers { offset: Offset, modifiers: Modifiers },
    Enum(EnumDefinition),
    StructDefinition { offset: Offset, ty: TypeRef },
    Section(Section),
}

/// Facts the IR generator discovered that backends need to know about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgramInputs {
    /// The program reads `sk_FragCoord` or derivatives and needs the
    /// render-target flip uniform when `flip_y` is set.
    pub rt_flip: bool,
}

#[derive(Debug, Clone)]
pub struct Program {
    pub kind: ProgramKind,
    pub settings: Settings,
    pub context: Rc<Context>,
    pub elements: Vec<ProgramElement>,
    pub symbol_tables: SymbolTables,
    /// The program's top-level scope (child of the built-in scope).
    pub symbols: SymbolTableId,
    pub variables: Arena<Variable>,
    pub functions: Arena<FunctionDeclaration>,
    pub externals: Arena<ExternalFunction>,
    pub inputs: ProgramInputs,
    pub usage: ProgramUsage,
}

impl Program {
    pub fn variable(&self, id: VarId) -> &Variable {
        &self.variables[id]
    }

    pub fn function(&self, id: FuncId) -> &FunctionDeclaration {
        &self.functions[id]
    }

    pub fn function_definition(&self, id: FuncId) -> Option<&FunctionDefinition> {
        self.elements.iter().find_map(|e| match e {
            ProgramElement::Function(def) if def.declaration == id => Some(def),
            _ => None,
        })
    }

    pub fn main(&self) -> Option<&FunctionDefinition> {
        self.elements.iter().find_map(|e| match e {
            ProgramElement::Function(def) if self.functions[def.declaration].name == "main" => Some(def),
            _ => None,
        })
    }

    pub fn function_definitions(&self) -> impl Iterator<Item = &FunctionDefinition> {
        self.elements.iter().filter_map(|e| match e {
            ProgramElement::Function(def) => Some(def),
            _ => None,
        })
    }

    /// Source-like text for an expression, for diagnostics and keys.
    pub fn describe_expression(&self, expr: &Expression) -> String {
        describe_expression(expr, &self.variables, &self.functions, &self.externals)
    }
}

/// Source-like text for `expr`, resolving handles through the given arenas.
pub fn describe_expression(
    expr: &Expression,
    variables: &Arena<Variable>,
    functions: &Arena<FunctionDeclaration>,
    externals: &Arena<ExternalFunction>,
) -> String {
    let describe = |e: &Expression| describe_expression(e, variables, functions, externals);
    let describe_arguments = |arguments: &[Expression]| {
        arguments.iter().map(|a| describe(a)).collect::<Vec<_>>().join(", ")
    };
    match &expr.kind {
        ExpressionKind::BoolLiteral(b) => b.to_string(),
        ExpressionKind::IntLiteral(i) => i.to_string(),
        ExpressionKind::FloatLiteral(f) => format_float(*f),
        ExpressionKind::NullLiteral => "null".to_string(),
        ExpressionKind::Binary { left, op, right } => {
            format!("({} {} {})", describe(left), op, describe(right))
        }
        ExpressionKind::Prefix { op, operand } => format!("{}{}", op, describe(operand)),
        ExpressionKind::Postfix { operand, op } => format!("{}{}", describe(operand), op),
        ExpressionKind::Ternary { test, if_true, if_false } => format!(
            "({} ? {} : {})",
            describe(test),
            describe(if_true),
            describe(if_false)
        ),
        ExpressionKind::Constructor { arguments } => {
            format!("{}({})", expr.ty.name, describe_arguments(arguments))
        }
        ExpressionKind::FunctionCall { function, arguments } => {
            format!("{}({})", functions[*function].name, describe_arguments(arguments))
        }
        ExpressionKind::ExternalFunctionCall { function, arguments } => {
            format!("{}({})", externals[*function].name, describe_arguments(arguments))
        }
        ExpressionKind::FieldAccess { base, field_index, owner } => {
            let field = &base.ty.fields()[*field_index].name;
            match owner {
                FieldOwner::Default => format!("{}.{}", describe(base), field),
                FieldOwner::AnonymousInterfaceBlock => field.clone(),
            }
        }
        ExpressionKind::Index { base, index } => format!("{}[{}]", describe(base), describe(index)),
        ExpressionKind::Swizzle { base, components } => {
            let mask: String = components
                .iter()
                .map(|c| match *c {
                    SWIZZLE_ZERO => '0',
                    SWIZZLE_ONE => '1',
                    c => ['x', 'y', 'z', 'w'][c as usize],
                })
                .collect();
            format!("{}.{}", describe(base), mask)
        }
        ExpressionKind::VariableReference { variable, .. } => variables[*variable].name.clone(),
        ExpressionKind::FunctionReference { functions: set } => set
            .first()
            .map(|f| functions[*f].name.clone())
            .unwrap_or_default(),
        ExpressionKind::TypeReference { value } => value.name.clone(),
        ExpressionKind::Setting { name, .. } => format!("sk_Caps.{}", name),
    }
}

/// Formats a float so it always reads back as a float literal.
pub fn format_float(value: f64) -> String {
    if value.is_finite() && value == value.trunc() && value.abs() < 1e15 {
        format!("{:.1}", value)
    } else {
        let text = format!("{}", value);
        if text.contains('.') || text.contains('e') || text.contains("inf") || text.contains("NaN") {
            text
        } else {
            format!("{}.0", text)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floats_print_as_float_literals() {
        assert_eq!(format_float(6.0), "6.0");
        assert_eq!(format_float(-0.5), "-0.5");
        assert_eq!(format_float(0.125), "0.125");
    }

    #[test]
    fn constant_vector_components_and_comparison() {
        let ctx = Context::new();
        let splat = Expression::new(
            0,
            ctx.float_vector(3),
            ExpressionKind::Constructor { arguments: vec![Expression::float_literal(&ctx, 0, 2.0)] },
        );
        let explicit = Expression::new(
            0,
            ctx.float_vector(3),
            ExpressionKind::Constructor {
                arguments: vec![
                    Expression::float_literal(&ctx, 0, 2.0),
                    Expression::float_literal(&ctx, 0, 2.0),
                    Expression::float_literal(&ctx, 0, 2.0),
                ],
            },
        );
        assert_eq!(splat.constant_float_component(2), Some(2.0));
        assert_eq!(splat.compare_constant(&explicit), Some(true));
        assert!(explicit.is_compile_time_constant());
    }

    #[test]
    fn operator_assignment_helpers() {
        assert!(Operator::PlusEq.is_assignment());
        assert_eq!(Operator::ShlEq.remove_assignment(), Operator::Shl);
        assert_eq!(Operator::Plus.remove_assignment(), Operator::Plus);
        assert!(Operator::Star.binary_precedence() < Operator::Plus.binary_precedence());
    }
}
