//! Variables, types, interface blocks, enums and functions.

use super::{IRGenerator, RtAdjust};
use crate::ast::{AstKind, AstNode};
use crate::builtins::{SK_MAIN_COORDS_BUILTIN, SK_RTADJUST_NAME};
use crate::error::Offset;
use crate::ir::*;
use crate::modifiers::{Layout, Modifiers};
use crate::settings::ProgramKind;
use crate::symbols::Symbol;
use crate::types::{Field, Type, TypeKind, TypeRef};
use log::trace;

const FLAG_NAMES: &[(u32, &str)] = &[
    (Modifiers::CONST, "const"),
    (Modifiers::IN, "in"),
    (Modifiers::OUT, "out"),
    (Modifiers::UNIFORM, "uniform"),
    (Modifiers::FLAT, "flat"),
    (Modifiers::NO_PERSPECTIVE, "noperspective"),
    (Modifiers::READONLY, "readonly"),
    (Modifiers::WRITEONLY, "writeonly"),
    (Modifiers::COHERENT, "coherent"),
    (Modifiers::VOLATILE, "volatile"),
    (Modifiers::RESTRICT, "restrict"),
    (Modifiers::BUFFER, "buffer"),
    (Modifiers::HAS_SIDE_EFFECTS, "sk_has_side_effects"),
    (Modifiers::HIGHP, "highp"),
    (Modifiers::MEDIUMP, "mediump"),
    (Modifiers::LOWP, "lowp"),
    (Modifiers::INLINE, "inline"),
    (Modifiers::NO_INLINE, "noinline"),
];

const PRECISION: u32 = Modifiers::HIGHP | Modifiers::MEDIUMP | Modifiers::LOWP;

const GLOBAL_FLAGS: u32 = Modifiers::CONST
    | Modifiers::IN
    | Modifiers::OUT
    | Modifiers::UNIFORM
    | Modifiers::FLAT
    | Modifiers::NO_PERSPECTIVE
    | Modifiers::READONLY
    | Modifiers::WRITEONLY
    | Modifiers::COHERENT
    | Modifiers::VOLATILE
    | Modifiers::RESTRICT
    | Modifiers::BUFFER
    | PRECISION;

const LOCAL_FLAGS: u32 = Modifiers::CONST | PRECISION;
const PARAMETER_FLAGS: u32 = Modifiers::CONST | Modifiers::IN | Modifiers::OUT | PRECISION;
const FUNCTION_FLAGS: u32 = Modifiers::INLINE | Modifiers::NO_INLINE;
const STORAGE_FLAGS: u32 = Modifiers::CONST | Modifiers::IN | Modifiers::OUT | Modifiers::UNIFORM | Modifiers::BUFFER;

impl<'a> IRGenerator<'a> {
    /// Reports every flag in `modifiers` outside `permitted`.
    fn check_modifiers(&mut self, offset: Offset, modifiers: &Modifiers, permitted: u32) -> bool {
        let mut ok = true;
        for (flag, name) in FLAG_NAMES {
            if modifiers.has(*flag) && permitted & flag == 0 {
                self.errors.error(offset, format!("'{}' is not permitted here", name));
                ok = false;
            }
        }
        ok
    }

    pub(super) fn convert_var_declarations(&mut self, node: &AstNode, storage: Storage) -> Option<VarDeclarations> {
        let modifiers = match &node.kind {
            AstKind::VarDeclarations(modifiers) => modifiers.clone(),
            other => unreachable!("expected variable declarations, found {:?}", other),
        };
        let base_type = self.convert_type(&node.children[0])?;
        if !self.in_builtin {
            let permitted = match storage {
                Storage::Global => GLOBAL_FLAGS,
                Storage::Local => LOCAL_FLAGS,
                Storage::Parameter => PARAMETER_FLAGS,
                Storage::InterfaceBlock => PRECISION,
            };
            if !self.check_modifiers(node.offset, &modifiers, permitted) {
                return None;
            }
        }
        if base_type.is_void() {
            self.errors.error(node.offset, "variables of type 'void' are not permitted");
            return None;
        }
        let mut vars = Vec::new();
        for child in &node.children[1..] {
            let (name, size_count) = match &child.kind {
                AstKind::VarDeclaration { name, size_count } => (name, *size_count),
                other => unreachable!("expected variable declaration, found {:?}", other),
            };
            let mut ty = base_type.clone();
            let mut sizes = Vec::with_capacity(size_count);
            for size_node in &child.children[..size_count] {
                let count = self.array_size(size_node)?;
                sizes.push(count.map(|n| Expression::int_literal(&self.context, size_node.offset, n as i64)));
                ty = Type::new_array(&ty, count);
            }
            let mut var = Variable::new(child.offset, modifiers.clone(), name.clone(), ty.clone(), storage);
            var.builtin = self.in_builtin;
            let mut value = None;
            if let Some(initializer) = child.children.get(size_count) {
                if modifiers.has(Modifiers::IN) || modifiers.has(Modifiers::UNIFORM) {
                    let qualifier = if modifiers.has(Modifiers::IN) { "in" } else { "uniform" };
                    self.errors.error(
                        initializer.offset,
                        format!("'{}' variables cannot use initializer expressions", qualifier),
                    );
                    return None;
                }
                let converted = self.convert_expression(initializer)?;
                let converted = self.coerce(converted, &ty)?;
                if modifiers.has(Modifiers::CONST) && converted.is_compile_time_constant() {
                    var.initial_value = Some(converted.clone());
                }
                value = Some(converted);
            } else if modifiers.has(Modifiers::CONST) && storage != Storage::Parameter && !self.in_builtin {
                self.errors.error(child.offset, "'const' variables must be initialized");
                return None;
            }
            let is_rt_adjust = name == SK_RTADJUST_NAME && storage == Storage::Global;
            if is_rt_adjust && ty.name != "float4" {
                self.errors.error(child.offset, "sk_RTAdjust must have type 'float4'");
                return None;
            }
            let id = self.variables.append(var);
            if is_rt_adjust {
                self.rt_adjust = Some(RtAdjust::Uniform(id));
            }
            trace!("declared {:?} variable '{}' as {:?}", storage, name, id);
            if !self.declare(child.offset, name, Symbol::Variable(id)) {
                return None;
            }
            vars.push(VarDeclaration { offset: child.offset, var: id, sizes, value });
        }
        Some(VarDeclarations { offset: node.offset, base_type, vars })
    }

    /// Evaluates one `[N]` array size. `Some(None)` for an unsized `[]`.
    pub(super) fn array_size(&mut self, node: &AstNode) -> Option<Option<usize>> {
        if node.is_null() {
            return Some(None);
        }
        let size = self.convert_expression(node)?;
        let size = if size.ty.is_unsigned() { size } else { self.coerce(size, &self.context.int_type.clone())? };
        let value = match (&size.kind, size.as_int()) {
            (_, Some(value)) => Some(value),
            (ExpressionKind::VariableReference { variable, .. }, None) => {
                self.variables[*variable].initial_value.as_ref().and_then(Expression::as_int)
            }
            _ => None,
        };
        match value {
            None => {
                self.errors.error(node.offset, "array size must be a constant");
                None
            }
            Some(value) if value <= 0 => {
                self.errors.error(node.offset, "array size must be positive");
                None
            }
            Some(value) => Some(Some(value as usize)),
        }
    }

    pub(super) fn convert_type(&mut self, node: &AstNode) -> Option<TypeRef> {
        let (name, is_structure, is_nullable) = match &node.kind {
            AstKind::Type { name, is_structure, is_nullable } => (name, *is_structure, *is_nullable),
            other => unreachable!("expected a type, found {:?}", other),
        };
        if is_structure {
            return self.convert_struct(node, name);
        }
        let mut ty = match self.lookup(name) {
            Some(Symbol::Type(ty)) => ty,
            _ => match self.context.lookup(name) {
                Some(ty) => ty.clone(),
                None => {
                    self.errors.error(node.offset, format!("unknown type '{}'", name));
                    return None;
                }
            },
        };
        if is_nullable {
            if ty != self.context.fragment_processor_type {
                self.errors.error(node.offset, format!("type '{}' may not be nullable", name));
                return None;
            }
            ty = Type::new(format!("{}?", name), TypeKind::Nullable { component: ty });
        }
        for size in &node.children {
            let count = self.array_size(size)?;
            ty = Type::new_array(&ty, count);
        }
        Some(ty)
    }

    fn convert_struct(&mut self, node: &AstNode, name: &str) -> Option<TypeRef> {
        let fields = self.convert_fields(&node.children, "struct fields")?;
        let ty = Type::new_struct(name, fields);
        if !self.declare(node.offset, name, Symbol::Type(ty.clone())) {
            return None;
        }
        self.push_element(ProgramElement::StructDefinition { offset: node.offset, ty: ty.clone() });
        Some(ty)
    }

    /// Field declarations of a struct or interface block.
    fn convert_fields(&mut self, declarations: &[AstNode], what: &str) -> Option<Vec<Field>> {
        let mut fields: Vec<Field> = Vec::new();
        for declaration in declarations {
            let modifiers = match &declaration.kind {
                AstKind::VarDeclarations(modifiers) => modifiers.clone(),
                other => unreachable!("expected field declarations, found {:?}", other),
            };
            let base_type = self.convert_type(&declaration.children[0])?;
            for child in &declaration.children[1..] {
                let (name, size_count) = match &child.kind {
                    AstKind::VarDeclaration { name, size_count } => (name, *size_count),
                    other => unreachable!("expected field declaration, found {:?}", other),
                };
                if child.children.len() > size_count {
                    self.errors.error(child.offset, format!("initializers are not permitted on {}", what));
                    return None;
                }
                if fields.iter().any(|f| &f.name == name) {
                    self.errors.error(child.offset, format!("field '{}' was already defined", name));
                    return None;
                }
                let mut ty = base_type.clone();
                for size in &child.children {
                    let count = self.array_size(size)?;
                    ty = Type::new_array(&ty, count);
                }
                fields.push(Field { modifiers: modifiers.clone(), name: name.clone(), ty });
            }
        }
        Some(fields)
    }

    pub(super) fn convert_modifiers_declaration(&mut self, offset: Offset, modifiers: &Modifiers) {
        let mut modifiers = modifiers.clone();
        if modifiers.layout.invocations != -1 {
            if self.kind != ProgramKind::Geometry {
                self.errors.error(offset, "'invocations' is only legal in geometry shaders");
                return;
            }
            self.invocations = modifiers.layout.invocations;
            if !self.settings.caps.gs_invocations_support {
                // sk_InvocationID becomes an ordinary global driven by an explicit loop in main
                modifiers.layout.invocations = -1;
                if let Some(Symbol::Variable(id)) = self.lookup("sk_InvocationID") {
                    let var = &mut self.variables[id];
                    var.modifiers.flags = 0;
                    var.modifiers.layout.builtin = -1;
                    var.builtin = false;
                    let base_type = var.ty.clone();
                    self.push_element(ProgramElement::GlobalVar(VarDeclarations {
                        offset: -1,
                        base_type,
                        vars: vec![VarDeclaration { offset: -1, var: id, sizes: Vec::new(), value: None }],
                    }));
                }
                if modifiers.layout.description().is_empty() && modifiers.flags == 0 {
                    return;
                }
            }
        }
        if modifiers.layout.max_vertices != -1 && self.invocations > 0 && !self.settings.caps.gs_invocations_support {
            modifiers.layout.max_vertices *= self.invocations;
        }
        self.push_element(ProgramElement::Modifiers { offset, modifiers });
    }

    pub(super) fn convert_interface_block(&mut self, node: &AstNode) -> Option<InterfaceBlock> {
        let (modifiers, type_name, instance_name, size_count) = match &node.kind {
            AstKind::InterfaceBlock { modifiers, type_name, instance_name, size_count } => {
                (modifiers.clone(), type_name.clone(), instance_name.clone(), *size_count)
            }
            other => unreachable!("expected an interface block, found {:?}", other),
        };
        let field_count = node.children.len() - size_count;
        let fields = self.convert_fields(&node.children[..field_count], "interface block fields")?;
        for (i, field) in fields.iter().enumerate() {
            if field.modifiers.flags & STORAGE_FLAGS != 0 {
                self.errors.error(node.offset, "interface block fields may not have storage qualifiers");
                return None;
            }
            if matches!(field.ty.kind, TypeKind::Array { count: None, .. }) && i != fields.len() - 1 {
                self.errors.error(
                    node.offset,
                    "only the last entry in an interface block may be a runtime-sized array",
                );
                return None;
            }
        }
        let rt_adjust_index = fields.iter().position(|f| f.name == SK_RTADJUST_NAME);
        if let Some(index) = rt_adjust_index {
            if fields[index].ty.name != "float4" {
                self.errors.error(node.offset, "sk_RTAdjust must have type 'float4'");
                return None;
            }
        }

        let mut ty = Type::new_struct(type_name.clone(), fields.clone());
        let mut sizes = Vec::with_capacity(size_count);
        for size_node in &node.children[field_count..] {
            let count = self.array_size(size_node)?;
            sizes.push(count.map(|n| Expression::int_literal(&self.context, size_node.offset, n as i64)));
            ty = Type::new_array(&ty, count);
        }
        let name = if instance_name.is_empty() { type_name.clone() } else { instance_name.clone() };
        let mut var = Variable::new(node.offset, modifiers, name, ty, Storage::InterfaceBlock);
        var.builtin = self.in_builtin;
        let id = self.variables.append(var);

        let symbols = self.symbol_tables.push(Some(self.current_symbols), self.in_builtin);
        for (i, field) in fields.iter().enumerate() {
            self.symbol_tables.add(symbols, &field.name, Symbol::Field { owner: id, field_index: i });
        }
        if instance_name.is_empty() {
            for (i, field) in fields.iter().enumerate() {
                if !self.declare(node.offset, &field.name, Symbol::Field { owner: id, field_index: i }) {
                    return None;
                }
            }
        } else if !self.declare(node.offset, &instance_name, Symbol::Variable(id)) {
            return None;
        }
        if let Some(field_index) = rt_adjust_index {
            let owner = if instance_name.is_empty() { FieldOwner::AnonymousInterfaceBlock } else { FieldOwner::Default };
            self.rt_adjust = Some(RtAdjust::BlockField { block: id, field_index, owner });
        }
        Some(InterfaceBlock { offset: node.offset, variable: id, type_name, instance_name, sizes, symbols })
    }

    pub(super) fn convert_enum(&mut self, node: &AstNode, name: &str) {
        let ty = Type::new(name, TypeKind::Enum);
        if !self.declare(node.offset, name, Symbol::Type(ty.clone())) {
            return;
        }
        let symbols = self.with_scope(|this, symbols| {
            let mut next = 0i64;
            for case in &node.children {
                let case_name = match &case.kind {
                    AstKind::EnumCase(case_name) => case_name,
                    other => unreachable!("expected an enum case, found {:?}", other),
                };
                if let Some(value) = case.children.first() {
                    let converted = match this.convert_expression(value) {
                        Some(converted) => converted,
                        None => continue,
                    };
                    match converted.as_int() {
                        Some(v) => next = v,
                        None => {
                            this.errors.error(value.offset, "enum value must be a constant integer");
                            continue;
                        }
                    }
                }
                let literal = Expression::new(case.offset, ty.clone(), ExpressionKind::IntLiteral(next));
                let mut var = Variable::new(
                    case.offset,
                    Modifiers::new(Layout::default(), Modifiers::CONST),
                    case_name.clone(),
                    ty.clone(),
                    Storage::Global,
                );
                var.builtin = this.in_builtin;
                var.initial_value = Some(literal);
                let id = this.variables.append(var);
                this.declare(case.offset, case_name, Symbol::Variable(id));
                next += 1;
            }
            symbols
        });
        self.enum_symbols.insert(name.to_string(), symbols);
        self.push_element(ProgramElement::Enum(EnumDefinition {
            offset: node.offset,
            type_name: name.to_string(),
            symbols,
        }));
    }

    pub(super) fn convert_function(&mut self, node: &AstNode) {
        let (modifiers, name, parameter_count) = match &node.kind {
            AstKind::Function { modifiers, name, parameter_count } => (modifiers.clone(), name.clone(), *parameter_count),
            other => unreachable!("expected a function, found {:?}", other),
        };
        trace!("convert_function {}", name);
        let return_type = match self.convert_type(&node.children[0]) {
            Some(ty) => ty,
            None => return,
        };
        if !self.in_builtin {
            if !self.check_modifiers(node.offset, &modifiers, FUNCTION_FLAGS) {
                return;
            }
            if modifiers.has(Modifiers::INLINE) && modifiers.has(Modifiers::NO_INLINE) {
                self.errors.error(node.offset, "functions cannot be both 'inline' and 'noinline'");
                return;
            }
        }

        // parameter variables, in declaration order
        let mut parameters = Vec::with_capacity(parameter_count);
        for param in &node.children[1..=parameter_count] {
            let (param_modifiers, param_name, size_count) = match &param.kind {
                AstKind::Parameter { modifiers, name, size_count } => (modifiers.clone(), name.clone(), *size_count),
                other => unreachable!("expected a parameter, found {:?}", other),
            };
            if !self.in_builtin && !self.check_modifiers(param.offset, &param_modifiers, PARAMETER_FLAGS) {
                return;
            }
            let mut ty = match self.convert_type(&param.children[0]) {
                Some(ty) => ty,
                None => return,
            };
            for size in &param.children[1..=size_count] {
                match self.array_size(size) {
                    Some(count) => ty = Type::new_array(&ty, count),
                    None => return,
                }
            }
            let mut var = Variable::new(param.offset, param_modifiers, param_name, ty, Storage::Parameter);
            var.builtin = self.in_builtin;
            parameters.push(self.variables.append(var));
        }

        if name == "main" && !self.in_builtin && !self.check_main_signature(node.offset, &parameters) {
            return;
        }

        let declaration = match self.find_or_declare_function(node, &modifiers, &name, &parameters, &return_type) {
            Some(declaration) => declaration,
            None => return,
        };

        let body = match node.children.get(parameter_count + 1) {
            Some(body) => body,
            None => {
                self.push_element(ProgramElement::FunctionPrototype { offset: node.offset, declaration });
                return;
            }
        };
        if self.functions[declaration].defined {
            let message = format!("duplicate definition of '{}'", name);
            self.errors.error(node.offset, message);
            return;
        }
        self.functions[declaration].defined = true;

        // a definition after a prototype reuses the prototype's parameters under the new names
        let declared = self.functions[declaration].parameters.clone();
        for (declared, defined) in declared.iter().zip(&parameters) {
            let defined_name = self.variables[*defined].name.clone();
            self.variables[*declared].name = defined_name;
        }

        let previous_function = self.current_function.replace(declaration);
        let converted = self.with_scope(|this, scope| {
            for param in &declared {
                let name = this.variables[*param].name.clone();
                let offset = this.variables[*param].offset;
                if !this.declare(offset, &name, Symbol::Variable(*param)) {
                    return None;
                }
            }
            let mut statements = Vec::with_capacity(body.children.len());
            for child in &body.children {
                statements.push(this.convert_statement(child)?);
            }
            Some(Statement::block(body.offset, statements, Some(scope), true))
        });
        self.current_function = previous_function;
        let mut body = match converted {
            Some(body) => body,
            None => return,
        };

        if !return_type.is_void() && !always_returns(&body) {
            self.errors.error(node.offset, format!("function '{}' can exit without returning a value", name));
            return;
        }
        if name == "main" && !self.in_builtin {
            if self.kind == ProgramKind::Vertex {
                if let Some(normalize) = self.normalize_sk_position() {
                    if let StatementKind::Block { statements, .. } = &mut body.kind {
                        statements.push(normalize);
                    }
                }
            }
            if self.kind == ProgramKind::Geometry
                && self.invocations > 0
                && !self.settings.caps.gs_invocations_support
            {
                body = match self.apply_invocation_id_workaround(body) {
                    Some(body) => body,
                    None => return,
                };
            }
        }
        self.push_element(ProgramElement::Function(FunctionDefinition { offset: node.offset, declaration, body }));
    }

    fn check_main_signature(&mut self, offset: Offset, parameters: &[VarId]) -> bool {
        match self.kind {
            ProgramKind::Pipeline => {
                let valid = match parameters {
                    [] => true,
                    [coords] => self.variables[*coords].ty == self.context.float_vector(2),
                    _ => false,
                };
                if !valid {
                    self.errors.error(offset, "pipeline stage 'main' must be declared main() or main(float2)");
                    return false;
                }
                if let [coords] = parameters {
                    self.variables[*coords].modifiers.layout.builtin = SK_MAIN_COORDS_BUILTIN;
                }
                true
            }
            _ => {
                if !parameters.is_empty() {
                    self.errors.error(offset, "shader 'main' must have zero parameters");
                    return false;
                }
                true
            }
        }
    }

    /// Finds the earlier prototype this function matches, or declares a new
    /// overload in the current scope.
    fn find_or_declare_function(
        &mut self,
        node: &AstNode,
        modifiers: &Modifiers,
        name: &str,
        parameters: &[VarId],
        return_type: &TypeRef,
    ) -> Option<FuncId> {
        match self.symbol_tables.lookup_local(self.current_symbols, name).cloned() {
            Some(Symbol::Functions(overloads)) => {
                for other in overloads {
                    let existing = &self.functions[other];
                    if existing.builtin != self.in_builtin || existing.parameters.len() != parameters.len() {
                        continue;
                    }
                    let same_types = existing
                        .parameters
                        .iter()
                        .zip(parameters)
                        .all(|(a, b)| self.variables[*a].ty == self.variables[*b].ty);
                    if !same_types {
                        continue;
                    }
                    if existing.return_type != *return_type {
                        let message = format!(
                            "functions '{}' differ only in return type ('{}' and '{}')",
                            name, existing.return_type, return_type
                        );
                        self.errors.error(node.offset, message);
                        return None;
                    }
                    for (i, (a, b)) in existing.parameters.iter().zip(parameters).enumerate() {
                        if self.variables[*a].modifiers.flags != self.variables[*b].modifiers.flags {
                            let message =
                                format!("modifiers on parameter {} differ between declaration and definition", i + 1);
                            self.errors.error(node.offset, message);
                            return None;
                        }
                    }
                    return Some(other);
                }
            }
            Some(_) => {
                self.errors.error(node.offset, format!("symbol '{}' was already defined", name));
                return None;
            }
            None => {}
        }
        let declaration = self.functions.append(FunctionDeclaration::new(
            node.offset,
            modifiers.clone(),
            name,
            parameters.to_vec(),
            return_type.clone(),
            self.in_builtin,
        ));
        self.symbol_tables.add_function(self.current_symbols, name, declaration);
        Some(declaration)
    }

    /// `sk_Position = float4(sk_Position.xy * sk_RTAdjust.xz + sk_Position.ww * sk_RTAdjust.yw, 0, sk_Position.w);`
    pub(super) fn normalize_sk_position(&mut self) -> Option<Statement> {
        let rt_adjust = self.rt_adjust?;
        let (owner, field_index) = match self.symbol_tables.lookup(self.builtin_symbols, "sk_Position") {
            Some(Symbol::Field { owner, field_index }) => (owner, field_index),
            _ => return None,
        };
        let float4 = self.context.float_vector(4);
        let position = |kind: RefKind, generator: &Self| {
            let base_type = generator.variables[owner].ty.clone();
            Expression::new(
                -1,
                float4.clone(),
                ExpressionKind::FieldAccess {
                    base: Box::new(Expression::variable_reference(-1, base_type, owner, kind)),
                    field_index,
                    owner: FieldOwner::AnonymousInterfaceBlock,
                },
            )
        };
        let adjust = |generator: &Self| match rt_adjust {
            RtAdjust::Uniform(var) => Expression::variable_reference(-1, float4.clone(), var, RefKind::Read),
            RtAdjust::BlockField { block, field_index, owner } => Expression::new(
                -1,
                float4.clone(),
                ExpressionKind::FieldAccess {
                    base: Box::new(Expression::variable_reference(
                        -1,
                        generator.variables[block].ty.clone(),
                        block,
                        RefKind::Read,
                    )),
                    field_index,
                    owner,
                },
            ),
        };
        let swizzle = |base: Expression, components: Vec<i8>, generator: &Self| {
            Expression::new(
                -1,
                generator.context.float_vector(components.len()),
                ExpressionKind::Swizzle { base: Box::new(base), components },
            )
        };
        let float2 = self.context.float_vector(2);
        let scaled = Expression::binary(
            -1,
            swizzle(position(RefKind::Read, self), vec![0, 1], self),
            Operator::Star,
            swizzle(adjust(self), vec![0, 2], self),
            float2.clone(),
        );
        let offset = Expression::binary(
            -1,
            swizzle(position(RefKind::Read, self), vec![3, 3], self),
            Operator::Star,
            swizzle(adjust(self), vec![1, 3], self),
            float2.clone(),
        );
        let sum = Expression::binary(-1, scaled, Operator::Plus, offset, float2);
        let constructor = Expression::new(
            -1,
            float4.clone(),
            ExpressionKind::Constructor {
                arguments: vec![
                    sum,
                    Expression::float_literal(&self.context, -1, 0.0),
                    swizzle(position(RefKind::Read, self), vec![3], self),
                ],
            },
        );
        let assignment = Expression::binary(-1, position(RefKind::Write, self), Operator::Eq, constructor, float4);
        Some(Statement::expression(assignment))
    }

    /// Moves `main`'s body into `_invoke()` and makes `main` call it once per
    /// requested invocation, ending a primitive after each.
    fn apply_invocation_id_workaround(&mut self, main_body: Statement) -> Option<Statement> {
        let void = self.context.void_type.clone();
        let mut invoke = FunctionDeclaration::new(
            -1,
            Modifiers::new(Layout::default(), Modifiers::HAS_SIDE_EFFECTS),
            "_invoke",
            Vec::new(),
            void.clone(),
            false,
        );
        invoke.defined = true;
        let invoke = self.functions.append(invoke);
        self.symbol_tables.add_function(self.program_symbols, "_invoke", invoke);
        self.push_element(ProgramElement::Function(FunctionDefinition {
            offset: -1,
            declaration: invoke,
            body: main_body,
        }));

        let loop_index = match self.lookup("sk_InvocationID") {
            Some(Symbol::Variable(id)) => id,
            _ => unreachable!("geometry builtins declare sk_InvocationID"),
        };
        let int = self.context.int_type.clone();
        let index = |kind| Expression::variable_reference(-1, int.clone(), loop_index, kind);
        let test = Expression::binary(
            -1,
            index(RefKind::Read),
            Operator::Lt,
            Expression::int_literal(&self.context, -1, self.invocations as i64),
            self.context.bool_type.clone(),
        );
        let next = Expression::new(
            -1,
            int.clone(),
            ExpressionKind::Postfix { operand: Box::new(index(RefKind::ReadWrite)), op: Operator::PlusPlus },
        );
        let end_primitive = match self.lookup("EndPrimitive") {
            Some(Symbol::Functions(functions)) => {
                let callee = Expression::new(-1, self.context.invalid_type.clone(), ExpressionKind::FunctionReference { functions });
                self.call(-1, callee, Vec::new())?
            }
            _ => unreachable!("builtins declare EndPrimitive"),
        };
        let invoke_call = Expression::new(-1, void, ExpressionKind::FunctionCall { function: invoke, arguments: Vec::new() });
        let body = Statement::block(
            -1,
            vec![Statement::expression(invoke_call), Statement::expression(end_primitive)],
            None,
            true,
        );
        let initializer = Statement::expression(Expression::binary(
            -1,
            index(RefKind::Write),
            Operator::Eq,
            Expression::int_literal(&self.context, -1, 0),
            int.clone(),
        ));
        let for_loop = Statement::new(
            -1,
            StatementKind::For {
                initializer: Some(Box::new(initializer)),
                test: Some(test),
                next: Some(next),
                body: Box::new(body),
                symbols: None,
            },
        );
        Some(Statement::block(-1, vec![for_loop], None, true))
    }
}

/// Conservative check that every path through `statement` ends in a
/// `return` or `discard`.
fn always_returns(statement: &Statement) -> bool {
    match &statement.kind {
        StatementKind::Return { .. } | StatementKind::Discard => true,
        StatementKind::Block { statements, .. } => statements.iter().any(always_returns),
        StatementKind::If { if_true, if_false: Some(if_false), .. } => {
            always_returns(if_true) && always_returns(if_false)
        }
        StatementKind::For { test: None, .. } => true,
        StatementKind::While { test, .. } => test.as_bool() == Some(true),
        StatementKind::Do { body, .. } => always_returns(body),
        StatementKind::Switch { cases, .. } => {
            cases.iter().any(|c| c.value.is_none())
                && cases.last().map_or(false, |c| c.statements.iter().any(always_returns))
                && cases
                    .iter()
                    .all(|c| c.statements.is_empty() || c.statements.iter().any(always_returns))
        }
        _ => false,
    }
}
