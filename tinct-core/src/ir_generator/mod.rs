//! Conversion from the untyped syntax tree to the typed IR.
//!
//! The generator resolves names through a chain of symbol tables, types every
//! expression, inserts implicit coercions and folds constants. Semantic errors
//! go to the `ErrorReporter`; the conversion function that hit the error
//! returns `None` and its caller abandons that subtree, while sibling
//! declarations are still converted so several errors can be reported from
//! one compile.
//!
//! Built-in functions and variables are parsed from source into a root scope
//! before the user program, which gets its own child scope.

mod declarations;
mod expressions;
mod statements;

#[cfg(test)]
mod tests;

use crate::arena::Arena;
use crate::ast::{AstKind, AstNode};
use crate::builtins::{self, BUILTIN_FUNCTIONS};
use crate::error::{ErrorReporter, Offset, Result};
use crate::ir::*;
use crate::lexer::tokenize;
use crate::modifiers::Modifiers;
use crate::parser::Parser;
use crate::settings::{ProgramKind, Settings};
use crate::symbols::{Symbol, SymbolTableId, SymbolTables};
use crate::types::{Context, TypeRef};
use crate::usage::ProgramUsage;
use log::{debug, trace};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

/// Where the render-target adjustment lives, once the program declares it.
#[derive(Debug, Clone, Copy)]
enum RtAdjust {
    Uniform(VarId),
    BlockField { block: VarId, field_index: usize, owner: FieldOwner },
}

pub struct IRGenerator<'a> {
    context: Rc<Context>,
    settings: Settings,
    kind: ProgramKind,
    errors: &'a mut ErrorReporter,
    symbol_tables: SymbolTables,
    builtin_symbols: SymbolTableId,
    program_symbols: SymbolTableId,
    current_symbols: SymbolTableId,
    variables: Arena<Variable>,
    functions: Arena<FunctionDeclaration>,
    externals: Arena<ExternalFunction>,
    elements: Vec<ProgramElement>,
    /// Case tables of every enum seen so far, by enum name.
    enum_symbols: HashMap<String, SymbolTableId>,
    in_builtin: bool,
    current_function: Option<FuncId>,
    loop_level: usize,
    switch_level: usize,
    /// Geometry `invocations` count from a modifiers declaration.
    invocations: i32,
    rt_adjust: Option<RtAdjust>,
    inputs: ProgramInputs,
}

impl<'a> IRGenerator<'a> {
    pub fn new(context: Rc<Context>, settings: &Settings, kind: ProgramKind, errors: &'a mut ErrorReporter) -> Self {
        let mut symbol_tables = SymbolTables::new();
        let builtin_symbols = symbol_tables.push(None, true);
        let program_symbols = symbol_tables.push(Some(builtin_symbols), false);
        let mut variables = Arena::new();
        let mut caps = Variable::new(-1, Modifiers::default(), "sk_Caps", context.sk_caps_type.clone(), Storage::Global);
        caps.builtin = true;
        let caps = variables.append(caps);
        symbol_tables.add(builtin_symbols, "sk_Caps", Symbol::Variable(caps));
        IRGenerator {
            context,
            settings: settings.clone(),
            kind,
            errors,
            symbol_tables,
            builtin_symbols,
            program_symbols,
            current_symbols: builtin_symbols,
            variables,
            functions: Arena::new(),
            externals: Arena::new(),
            elements: Vec::new(),
            enum_symbols: HashMap::new(),
            in_builtin: false,
            current_function: None,
            loop_level: 0,
            switch_level: 0,
            invocations: -1,
            rt_adjust: None,
            inputs: ProgramInputs::default(),
        }
    }

    /// Makes a host function callable from shader source under `name`.
    pub fn add_external(&mut self, name: &str, parameters: Vec<TypeRef>, return_type: TypeRef) -> ExternalId {
        let id = self.externals.append(ExternalFunction { name: name.to_string(), parameters, return_type });
        if !self.symbol_tables.add(self.builtin_symbols, name, Symbol::External(id)) {
            self.symbol_tables.replace(self.builtin_symbols, name, Symbol::External(id));
        }
        id
    }

    /// Parses and converts `source`. Only tokenizer and parser failures are
    /// returned as `Err`; semantic errors are left in the reporter and the
    /// partially converted program is still returned.
    pub fn convert_program(mut self, source: &str) -> Result<Program> {
        debug!("converting {} program ({} bytes)", self.kind, source.len());
        self.load_builtins()?;

        self.in_builtin = false;
        self.current_symbols = self.program_symbols;
        let file = self.parse(source)?;
        for declaration in &file.children {
            self.convert_declaration(declaration);
        }
        Ok(self.finish())
    }

    fn load_builtins(&mut self) -> Result<()> {
        self.in_builtin = true;
        self.current_symbols = self.builtin_symbols;
        for source in [BUILTIN_FUNCTIONS, builtins::variables_source(self.kind)] {
            let file = self.parse(source)?;
            for declaration in &file.children {
                self.convert_declaration(declaration);
            }
        }
        trace!("loaded {} builtin functions", self.functions.len());
        Ok(())
    }

    fn parse(&self, source: &str) -> Result<AstNode> {
        let type_names: HashSet<String> = self.context.named_types().map(|(name, _)| name.clone()).collect();
        let tokens = tokenize(source)?;
        Parser::new(tokens, type_names).parse()
    }

    fn finish(self) -> Program {
        let mut program = Program {
            kind: self.kind,
            settings: self.settings,
            context: self.context,
            elements: self.elements,
            symbol_tables: self.symbol_tables,
            symbols: self.program_symbols,
            variables: self.variables,
            functions: self.functions,
            externals: self.externals,
            inputs: self.inputs,
            usage: ProgramUsage::default(),
        };
        program.usage = ProgramUsage::compute(&program);
        program
    }

    fn convert_declaration(&mut self, node: &AstNode) {
        match &node.kind {
            AstKind::VarDeclarations(_) => {
                if let Some(declarations) = self.convert_var_declarations(node, Storage::Global) {
                    if !declarations.vars.is_empty() {
                        self.push_element(ProgramElement::GlobalVar(declarations));
                    }
                }
            }
            AstKind::Enum(name) => self.convert_enum(node, name),
            AstKind::Function { .. } => self.convert_function(node),
            AstKind::Modifiers(modifiers) => self.convert_modifiers_declaration(node.offset, modifiers),
            AstKind::InterfaceBlock { .. } => {
                if let Some(block) = self.convert_interface_block(node) {
                    self.push_element(ProgramElement::InterfaceBlock(block));
                }
            }
            AstKind::Extension(name) => {
                self.push_element(ProgramElement::Extension { offset: node.offset, name: name.clone() })
            }
            AstKind::Section { name, argument, text } => self.push_element(ProgramElement::Section(Section {
                offset: node.offset,
                name: name.clone(),
                argument: argument.clone(),
                text: text.clone(),
            })),
            other => unreachable!("'{:?}' is not a top-level declaration", other),
        }
    }

    /// Built-in declarations only populate the root scope.
    fn push_element(&mut self, element: ProgramElement) {
        if !self.in_builtin {
            self.elements.push(element);
        }
    }

    fn describe(&self, expr: &Expression) -> String {
        describe_expression(expr, &self.variables, &self.functions, &self.externals)
    }

    fn lookup(&self, name: &str) -> Option<Symbol> {
        self.symbol_tables.lookup(self.current_symbols, name)
    }

    /// Runs `f` in a fresh child scope of the current one.
    fn with_scope<R>(&mut self, f: impl FnOnce(&mut Self, SymbolTableId) -> R) -> R {
        let previous = self.current_symbols;
        let scope = self.symbol_tables.push(Some(previous), self.in_builtin);
        self.current_symbols = scope;
        let result = f(self, scope);
        self.current_symbols = previous;
        result
    }

    fn with_loop_level<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.loop_level += 1;
        let result = f(self);
        self.loop_level -= 1;
        result
    }

    fn with_switch_level<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.switch_level += 1;
        let result = f(self);
        self.switch_level -= 1;
        result
    }

    /// Adds `symbol` to the current scope, reporting a redefinition.
    fn declare(&mut self, offset: Offset, name: &str, symbol: Symbol) -> bool {
        if self.symbol_tables.add(self.current_symbols, name, symbol) {
            true
        } else {
            self.errors.error(offset, format!("symbol '{}' was already defined", name));
            false
        }
    }
}
