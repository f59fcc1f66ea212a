//! Chained lexical scopes. Tables live in an arena; each table points at its
//! parent by handle, and lookups walk the chain outward.

use crate::arena::{Arena, Handle};
use crate::ir::{ExternalId, FuncId, VarId};
use crate::types::TypeRef;
use std::collections::HashMap;

pub type SymbolTableId = Handle<SymbolTable>;

#[derive(Debug, Clone, PartialEq)]
pub enum Symbol {
    Variable(VarId),
    /// One declaration, or an overload set still waiting on argument types.
    Functions(Vec<FuncId>),
    Type(TypeRef),
    /// A field of an anonymous interface block, visible at global scope.
    Field { owner: VarId, field_index: usize },
    External(ExternalId),
}

#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    pub parent: Option<SymbolTableId>,
    pub is_builtin: bool,
    symbols: HashMap<String, Symbol>,
    order: Vec<String>,
}

impl SymbolTable {
    /// Symbols declared directly in this scope, in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Symbol)> {
        self.order.iter().filter_map(move |name| self.symbols.get(name).map(|s| (name, s)))
    }
}

#[derive(Debug, Clone, Default)]
pub struct SymbolTables {
    tables: Arena<SymbolTable>,
}

impl SymbolTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, parent: Option<SymbolTableId>, is_builtin: bool) -> SymbolTableId {
        self.tables.append(SymbolTable {
            parent,
            is_builtin,
            ..SymbolTable::default()
        })
    }

    pub fn get(&self, id: SymbolTableId) -> &SymbolTable {
        &self.tables[id]
    }

    pub fn parent(&self, id: SymbolTableId) -> Option<SymbolTableId> {
        self.tables[id].parent
    }

    pub fn lookup_local(&self, id: SymbolTableId, name: &str) -> Option<&Symbol> {
        self.tables[id].symbols.get(name)
    }

    /// Resolves `name` through the scope chain. Function overloads declared in
    /// enclosing scopes are merged into one set; other symbols shadow.
    pub fn lookup(&self, id: SymbolTableId, name: &str) -> Option<Symbol> {
        let mut current = Some(id);
        let mut functions: Vec<FuncId> = Vec::new();
        while let Some(table_id) = current {
            let table = &self.tables[table_id];
            match table.symbols.get(name) {
                Some(Symbol::Functions(found)) => {
                    for f in found {
                        if !functions.contains(f) {
                            functions.push(*f);
                        }
                    }
                }
                Some(other) => {
                    if functions.is_empty() {
                        return Some(other.clone());
                    }
                    break;
                }
                None => {}
            }
            current = table.parent;
        }
        if functions.is_empty() {
            None
        } else {
            Some(Symbol::Functions(functions))
        }
    }

    /// Adds a symbol to `id`, replacing nothing. Returns false if the name is
    /// already declared in that exact scope.
    pub fn add(&mut self, id: SymbolTableId, name: &str, symbol: Symbol) -> bool {
        let table = &mut self.tables[id];
        if table.symbols.contains_key(name) {
            return false;
        }
        table.order.push(name.to_string());
        table.symbols.insert(name.to_string(), symbol);
        true
    }

    /// Adds a function declaration, extending an overload set in the same scope.
    pub fn add_function(&mut self, id: SymbolTableId, name: &str, function: FuncId) -> bool {
        let table = &mut self.tables[id];
        match table.symbols.get_mut(name) {
            Some(Symbol::Functions(set)) => {
                set.push(function);
                true
            }
            Some(_) => false,
            None => {
                table.order.push(name.to_string());
                table.symbols.insert(name.to_string(), Symbol::Functions(vec![function]));
                true
            }
        }
    }

    /// Replaces an existing symbol in `id` (used when a declaration is renamed
    /// or retyped after the fact).
    pub fn replace(&mut self, id: SymbolTableId, name: &str, symbol: Symbol) {
        let table = &mut self.tables[id];
        if !table.symbols.contains_key(name) {
            table.order.push(name.to_string());
        }
        table.symbols.insert(name.to_string(), symbol);
    }

    pub fn remove(&mut self, id: SymbolTableId, name: &str) -> Option<Symbol> {
        let table = &mut self.tables[id];
        table.order.retain(|n| n != name);
        table.symbols.remove(name)
    }

    /// True if `descendant` is `ancestor` or nested inside it.
    pub fn is_within(&self, descendant: SymbolTableId, ancestor: SymbolTableId) -> bool {
        let mut current = Some(descendant);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.tables[id].parent;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::ir::{FunctionDeclaration, Storage, Variable};
    use crate::modifiers::Modifiers;
    use crate::types::Context;

    #[test]
    fn inner_scopes_shadow_and_pop() {
        let ctx = Context::new();
        let mut vars = Arena::new();
        let outer_x = vars.append(Variable::new(0, Modifiers::default(), "x", ctx.float_type.clone(), Storage::Global));
        let inner_x = vars.append(Variable::new(5, Modifiers::default(), "x", ctx.int_type.clone(), Storage::Local));

        let mut tables = SymbolTables::new();
        let root = tables.push(None, false);
        let inner = tables.push(Some(root), false);
        assert!(tables.add(root, "x", Symbol::Variable(outer_x)));
        assert!(tables.add(inner, "x", Symbol::Variable(inner_x)));
        assert!(!tables.add(inner, "x", Symbol::Variable(inner_x)));

        assert_eq!(tables.lookup(inner, "x"), Some(Symbol::Variable(inner_x)));
        assert_eq!(tables.lookup(root, "x"), Some(Symbol::Variable(outer_x)));
        assert_eq!(tables.lookup(inner, "y"), None);
        assert!(tables.is_within(inner, root));
        assert!(!tables.is_within(root, inner));
    }

    #[test]
    fn overloads_merge_across_scopes() {
        let ctx = Context::new();
        let mut funcs = Arena::new();
        let f1 = funcs.append(FunctionDeclaration::new(0, Modifiers::default(), "f", vec![], ctx.void_type.clone(), true));
        let f2 = funcs.append(FunctionDeclaration::new(0, Modifiers::default(), "f", vec![], ctx.float_type.clone(), false));

        let mut tables = SymbolTables::new();
        let root = tables.push(None, true);
        let program = tables.push(Some(root), false);
        tables.add_function(root, "f", f1);
        tables.add_function(program, "f", f2);
        assert_eq!(tables.lookup(program, "f"), Some(Symbol::Functions(vec![f2, f1])));
    }
}
