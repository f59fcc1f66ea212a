//! GLSL Lowering
//!
//! Emits GLSL source text from the IR. Non-function elements are written
//! first and function definitions last, because inlining can leave a
//! function's code depending on a declaration that appears after it in the
//! source. Extension directives, synthesized uniforms and polyfill helpers
//! are collected in separate buffers and spliced in ahead of the body.

use crate::analysis::has_side_effects;
use crate::builtins::*;
use crate::error::{Offset, Result};
use crate::ir::*;
use crate::lowering_common::{
    contains_rt_adjust, is_unreferenced_global, swizzle_constants, swizzle_letters, CodeWriter, HelperSet,
};
use crate::modifiers::Modifiers;
use crate::settings::{GlslGeneration, ProgramKind, Settings, ShaderCaps};
use crate::types::{NumberKind, SamplerDim, Type, TypeKind};
use crate::{bail_codegen, bail_codegen_at};
use log::{debug, trace};
use std::collections::HashSet;

/// Uniform holding the render-target flip: `y' = flip.x + flip.y * y`.
pub const RTFLIP_NAME: &str = "u_skRTFlip";

const SHARPEN_TEXTURES_BIAS: &str = "-0.5";

/// Lower a program to GLSL source.
pub fn lower(program: &Program) -> Result<String> {
    if program.kind == ProgramKind::Pipeline {
        bail_codegen!("pipeline programs can only be lowered to the VM");
    }
    LowerCtx::new(program).lower_program()
}

const DETERMINANT2: &str = "
float _determinant2(mat2 m) {
return m[0].x*m[1].y - m[0].y*m[1].x;
}
";

const DETERMINANT3: &str = "
float _determinant3(mat3 m) {
float
 a00 = m[0].x, a01 = m[0].y, a02 = m[0].z,
 a10 = m[1].x, a11 = m[1].y, a12 = m[1].z,
 a20 = m[2].x, a21 = m[2].y, a22 = m[2].z,
 b01 = a22*a11 - a12*a21,
 b11 =-a22*a10 + a12*a20,
 b21 = a21*a10 - a11*a20;
return a00*b01 + a01*b11 + a02*b21;
}
";

const DETERMINANT4: &str = "
float _determinant4(mat4 m) {
float
 a00 = m[0].x, a01 = m[0].y, a02 = m[0].z, a03 = m[0].w,
 a10 = m[1].x, a11 = m[1].y, a12 = m[1].z, a13 = m[1].w,
 a20 = m[2].x, a21 = m[2].y, a22 = m[2].z, a23 = m[2].w,
 a30 = m[3].x, a31 = m[3].y, a32 = m[3].z, a33 = m[3].w,
 b00 = a00*a11 - a01*a10,
 b01 = a00*a12 - a02*a10,
 b02 = a00*a13 - a03*a10,
 b03 = a01*a12 - a02*a11,
 b04 = a01*a13 - a03*a11,
 b05 = a02*a13 - a03*a12,
 b06 = a20*a31 - a21*a30,
 b07 = a20*a32 - a22*a30,
 b08 = a20*a33 - a23*a30,
 b09 = a21*a32 - a22*a31,
 b10 = a21*a33 - a23*a31,
 b11 = a22*a33 - a23*a32;
return b00*b11 - b01*b10 + b02*b09 + b03*b08 - b04*b07 + b05*b06;
}
";

const INVERSE2: &str = "
mat2 _inverse2(mat2 m) {
return mat2(m[1].y, -m[0].y, -m[1].x, m[0].x) / (m[0].x * m[1].y - m[0].y * m[1].x);
}
";

const INVERSE3: &str = "
mat3 _inverse3(mat3 m) {
float
 a00 = m[0].x, a01 = m[0].y, a02 = m[0].z,
 a10 = m[1].x, a11 = m[1].y, a12 = m[1].z,
 a20 = m[2].x, a21 = m[2].y, a22 = m[2].z,
 b01 = a22*a11 - a12*a21,
 b11 =-a22*a10 + a12*a20,
 b21 = a21*a10 - a11*a20,
 det = a00*b01 + a01*b11 + a02*b21;
return mat3(
 b01, (-a22*a01 + a02*a21), ( a12*a01 - a02*a11),
 b11, ( a22*a00 - a02*a20), (-a12*a00 + a02*a10),
 b21, (-a21*a00 + a01*a20), ( a11*a00 - a01*a10)) / det;
}
";

const INVERSE4: &str = "
mat4 _inverse4(mat4 m) {
float
 a00 = m[0].x, a01 = m[0].y, a02 = m[0].z, a03 = m[0].w,
 a10 = m[1].x, a11 = m[1].y, a12 = m[1].z, a13 = m[1].w,
 a20 = m[2].x, a21 = m[2].y, a22 = m[2].z, a23 = m[2].w,
 a30 = m[3].x, a31 = m[3].y, a32 = m[3].z, a33 = m[3].w,
 b00 = a00*a11 - a01*a10,
 b01 = a00*a12 - a02*a10,
 b02 = a00*a13 - a03*a10,
 b03 = a01*a12 - a02*a11,
 b04 = a01*a13 - a03*a11,
 b05 = a02*a13 - a03*a12,
 b06 = a20*a31 - a21*a30,
 b07 = a20*a32 - a22*a30,
 b08 = a20*a33 - a23*a30,
 b09 = a21*a32 - a22*a31,
 b10 = a21*a33 - a23*a31,
 b11 = a22*a33 - a23*a32,
 det = b00*b11 - b01*b10 + b02*b09 + b03*b08 - b04*b07 + b05*b06;
return mat4(
 a11*b11 - a12*b10 + a13*b09,
 a02*b10 - a01*b11 - a03*b09,
 a31*b05 - a32*b04 + a33*b03,
 a22*b04 - a21*b05 - a23*b03,
 a12*b08 - a10*b11 - a13*b07,
 a00*b11 - a02*b08 + a03*b07,
 a32*b02 - a30*b05 - a33*b01,
 a20*b05 - a22*b02 + a23*b01,
 a10*b10 - a11*b08 + a13*b06,
 a01*b08 - a00*b10 - a03*b06,
 a30*b04 - a31*b02 + a33*b00,
 a21*b02 - a20*b04 - a23*b00,
 a11*b07 - a10*b09 - a12*b06,
 a00*b09 - a01*b07 + a02*b06,
 a31*b01 - a30*b03 - a32*b00,
 a20*b03 - a21*b01 + a22*b00) / det;
}
";

/// GLSL reserves identifiers with two underscores in a row.
fn identifier(name: &str) -> String {
    if name.contains("__") || name.contains("_X") {
        name.replace('_', "_X")
    } else {
        name.to_string()
    }
}

/// Pre-1.30 targets lack `texture()`, `inverse()`, `transpose()` and
/// `inversesqrt()`.
fn is_legacy(generation: GlslGeneration) -> bool {
    !generation.has_unified_texture_function()
}

/// Context for lowering the IR to GLSL
struct LowerCtx<'a> {
    program: &'a Program,
    settings: &'a Settings,
    caps: &'a ShaderCaps,
    out: CodeWriter,
    extensions: String,
    /// Synthesized global declarations, deduplicated by text.
    globals: String,
    declared_globals: HashSet<String>,
    helpers: HelperSet,
    /// Temporaries hoisted to the top of the function being written.
    function_header: String,
    var_count: usize,
    setup_frag_coord: bool,
    setup_clockwise: bool,
    found_derivatives: bool,
    found_external_sampler: bool,
    found_rect_sampler: bool,
}

impl<'a> LowerCtx<'a> {
    fn new(program: &'a Program) -> Self {
        LowerCtx {
            program,
            settings: &program.settings,
            caps: &program.settings.caps,
            out: CodeWriter::new(),
            extensions: String::new(),
            globals: String::new(),
            declared_globals: HashSet::new(),
            helpers: HelperSet::default(),
            function_header: String::new(),
            var_count: 0,
            setup_frag_coord: false,
            setup_clockwise: false,
            found_derivatives: false,
            found_external_sampler: false,
            found_rect_sampler: false,
        }
    }

    fn lower_program(mut self) -> Result<String> {
        debug!("lowering {} program to GLSL ({:?})", self.program.kind, self.caps.generation);
        for element in &self.program.elements {
            if !matches!(element, ProgramElement::Function(_)) {
                self.lower_element(element)?;
            }
        }
        for element in &self.program.elements {
            if matches!(element, ProgramElement::Function(_)) {
                self.lower_element(element)?;
            }
        }
        let body = self.out.take();

        let mut output = String::new();
        output.push_str(self.caps.generation.version_declaration());
        output.push_str(&self.extensions);
        if self.settings.flip_y && self.program.inputs.rt_flip && self.caps.can_use_fragcoord {
            output.push_str(&format!("uniform {}vec2 {};\n", self.high_precision(), RTFLIP_NAME));
        }
        output.push_str(&self.globals);
        if !self.caps.can_use_fragcoord {
            let modifiers = match self.program.kind {
                ProgramKind::Vertex => Some(Modifiers::new(Default::default(), Modifiers::OUT)),
                ProgramKind::Fragment => Some(Modifiers::new(Default::default(), Modifiers::IN)),
                _ => None,
            };
            if let Some(modifiers) = modifiers {
                output.push_str(&self.modifiers_text(&modifiers, true));
                output.push_str(&format!("{}vec4 sk_FragCoord_Workaround;\n", self.high_precision()));
            }
        }
        if self.caps.uses_precision_modifiers {
            let precision = if self.settings.force_high_precision { "highp" } else { "mediump" };
            output.push_str(&format!("precision {} float;\n", precision));
            output.push_str(&format!("precision {} sampler2D;\n", precision));
            if self.found_external_sampler {
                output.push_str(&format!("precision {} samplerExternalOES;\n", precision));
            }
            if self.found_rect_sampler {
                output.push_str(&format!("precision {} sampler2DRect;\n", precision));
            }
        }
        output.push_str(self.helpers.text());
        output.push_str(&body);
        Ok(output)
    }

    fn high_precision(&self) -> &'static str {
        if self.caps.uses_precision_modifiers {
            "highp "
        } else {
            ""
        }
    }

    fn add_extension(&mut self, name: &str) {
        let line = format!("#extension {} : enable\n", name);
        if !self.extensions.contains(&line) {
            self.extensions.push_str(&line);
        }
    }

    fn add_global(&mut self, text: String) {
        if self.declared_globals.insert(text.clone()) {
            self.globals.push_str(&text);
        }
    }

    fn next_temp(&mut self, prefix: &str) -> String {
        let name = format!("{}{}", prefix, self.var_count);
        self.var_count += 1;
        name
    }

    /// Declares a temporary at the top of the current function.
    fn hoist_temp(&mut self, prefix: &str, ty: &Type) -> String {
        let name = self.next_temp(prefix);
        let declaration = format!("    {}{} {};\n", self.type_precision(ty), self.type_name(ty), name);
        self.function_header.push_str(&declaration);
        name
    }

    // --- types ---

    fn type_name(&self, ty: &Type) -> String {
        match &ty.kind {
            TypeKind::Vector { component, columns } => {
                let prefix = match component.number_kind() {
                    NumberKind::Float => "vec",
                    NumberKind::Signed => "ivec",
                    NumberKind::Unsigned => "uvec",
                    _ => "bvec",
                };
                format!("{}{}", prefix, columns)
            }
            TypeKind::Matrix { columns, rows, .. } => {
                if columns == rows {
                    format!("mat{}", columns)
                } else {
                    format!("mat{}x{}", columns, rows)
                }
            }
            TypeKind::Array { component, count } => match count {
                Some(n) => format!("{}[{}]", self.type_name(component), n),
                None => format!("{}[]", self.type_name(component)),
            },
            TypeKind::Scalar { .. } => match ty.name.as_str() {
                "half" => "float".to_string(),
                other => other.to_string(),
            },
            TypeKind::Enum => "int".to_string(),
            _ => identifier(&ty.name),
        }
    }

    fn type_precision(&self, ty: &Type) -> &'static str {
        if !self.caps.uses_precision_modifiers {
            return "";
        }
        match &ty.kind {
            TypeKind::Scalar { .. } | TypeKind::Enum => match ty.name.as_str() {
                "half" => {
                    if self.settings.force_high_precision {
                        "highp "
                    } else {
                        "mediump "
                    }
                }
                "float" | "int" | "uint" => "highp ",
                _ if matches!(ty.kind, TypeKind::Enum) => "highp ",
                _ => "",
            },
            TypeKind::Vector { component, .. }
            | TypeKind::Matrix { component, .. }
            | TypeKind::Array { component, .. } => self.type_precision(component),
            _ => "",
        }
    }

    fn modifiers_text(&self, modifiers: &Modifiers, global: bool) -> String {
        let mut text = String::new();
        let layout = modifiers.layout.description();
        if !layout.is_empty() {
            text.push_str(&layout);
            text.push(' ');
        }
        if modifiers.has(Modifiers::FLAT) {
            text.push_str("flat ");
        }
        if modifiers.has(Modifiers::NO_PERSPECTIVE) {
            text.push_str("noperspective ");
        }
        if modifiers.has(Modifiers::CONST) {
            text.push_str("const ");
        }
        if modifiers.has(Modifiers::UNIFORM) {
            text.push_str("uniform ");
        }
        let legacy = global && is_legacy(self.caps.generation);
        match (modifiers.has(Modifiers::IN), modifiers.has(Modifiers::OUT)) {
            (true, true) => text.push_str("inout "),
            (true, false) if legacy => {
                text.push_str(if self.program.kind == ProgramKind::Vertex { "attribute " } else { "varying " })
            }
            (true, false) => text.push_str("in "),
            (false, true) if legacy => text.push_str("varying "),
            (false, true) => text.push_str("out "),
            (false, false) => {}
        }
        if modifiers.has(Modifiers::READONLY) {
            text.push_str("readonly ");
        }
        if modifiers.has(Modifiers::WRITEONLY) {
            text.push_str("writeonly ");
        }
        if modifiers.has(Modifiers::BUFFER) {
            text.push_str("buffer ");
        }
        text
    }

    // --- program elements ---

    fn lower_element(&mut self, element: &ProgramElement) -> Result<()> {
        match element {
            ProgramElement::Extension { name, .. } => self.add_extension(name),
            ProgramElement::GlobalVar(declarations) => {
                self.lower_var_declarations(declarations, true)?;
                self.out.finish_line();
            }
            ProgramElement::InterfaceBlock(block) => self.lower_interface_block(block)?,
            ProgramElement::Function(def) => self.lower_function(def)?,
            ProgramElement::FunctionPrototype { declaration, .. } => {
                let signature = self.function_signature(*declaration);
                self.out.write_line(&format!("{};", signature));
            }
            ProgramElement::Modifiers { modifiers, .. } => {
                let text = self.modifiers_text(modifiers, true);
                self.out.write_line(&format!("{};", text.trim_end()));
            }
            ProgramElement::StructDefinition { ty, .. } => self.lower_struct(ty),
            // enum cases are folded to integer literals at every use
            ProgramElement::Enum(_) => {}
            ProgramElement::Section(_) => {}
        }
        Ok(())
    }

    fn lower_struct(&mut self, ty: &Type) {
        self.out.write_line(&format!("struct {} {{", identifier(&ty.name)));
        self.out.indent();
        for field in ty.fields() {
            let (base, suffix) = match &field.ty.kind {
                TypeKind::Array { component, count } => {
                    (component.clone(), format!("[{}]", count.map(|n| n.to_string()).unwrap_or_default()))
                }
                _ => (field.ty.clone(), String::new()),
            };
            let line = format!(
                "{}{}{} {}{};",
                self.modifiers_text(&field.modifiers, false),
                self.type_precision(&base),
                self.type_name(&base),
                identifier(&field.name),
                suffix
            );
            self.out.write_line(&line);
        }
        self.out.dedent();
        self.out.write_line("};");
    }

    fn lower_interface_block(&mut self, block: &InterfaceBlock) -> Result<()> {
        if block.type_name == "sk_PerVertex" {
            return Ok(());
        }
        let var = self.program.variable(block.variable);
        let struct_type = match &var.ty.kind {
            TypeKind::Array { component, .. } => component.clone(),
            _ => var.ty.clone(),
        };
        let header = format!("{}{} {{", self.modifiers_text(&var.modifiers, true), identifier(&block.type_name));
        self.out.write_line(&header);
        self.out.indent();
        for field in struct_type.fields() {
            let line = format!(
                "{}{}{} {};",
                self.modifiers_text(&field.modifiers, false),
                self.type_precision(&field.ty),
                self.type_name(&field.ty),
                identifier(&field.name)
            );
            self.out.write_line(&line);
        }
        self.out.dedent();
        self.out.write("}");
        if !block.instance_name.is_empty() {
            self.out.write(&format!(" {}", identifier(&block.instance_name)));
            for size in &block.sizes {
                match size.as_ref().and_then(Expression::as_int) {
                    Some(n) => self.out.write(&format!("[{}]", n)),
                    None => self.out.write("[]"),
                }
            }
        }
        self.out.write_line(";");
        Ok(())
    }

    fn function_signature(&self, id: FuncId) -> String {
        let function = self.program.function(id);
        let mut text = format!(
            "{}{} {}(",
            self.type_precision(&function.return_type),
            self.type_name(&function.return_type),
            identifier(&function.name)
        );
        let mut first = true;
        for param in &function.parameters {
            let param = self.program.variable(*param);
            // coordinate parameters of main are bound to builtins, not passed
            if function.name == "main" && param.modifiers.layout.builtin != -1 {
                continue;
            }
            if !first {
                text.push_str(", ");
            }
            first = false;
            let (base, suffix) = match &param.ty.kind {
                TypeKind::Array { component, count } => {
                    (component.clone(), format!("[{}]", count.map(|n| n.to_string()).unwrap_or_default()))
                }
                _ => (param.ty.clone(), String::new()),
            };
            text.push_str(&self.modifiers_text(&param.modifiers, false));
            text.push_str(self.type_precision(&base));
            text.push_str(&self.type_name(&base));
            text.push(' ');
            text.push_str(&identifier(&param.name));
            text.push_str(&suffix);
        }
        text.push(')');
        text
    }

    fn lower_function(&mut self, def: &FunctionDefinition) -> Result<()> {
        trace!("lowering function '{}'", self.program.function(def.declaration).name);
        self.setup_frag_coord = false;
        self.setup_clockwise = false;
        self.function_header.clear();

        let signature = self.function_signature(def.declaration);
        self.out.write_line(&format!("{} {{", signature));
        let before = self.out.take();
        self.out.indent();
        match &def.body.kind {
            StatementKind::Block { statements, .. } => {
                for statement in statements {
                    if !statement.is_empty() {
                        self.lower_statement(statement)?;
                        self.out.finish_line();
                    }
                }
            }
            _ => {
                self.lower_statement(&def.body)?;
                self.out.finish_line();
            }
        }
        self.out.dedent();
        self.out.write_line("}");
        let body = self.out.take();

        self.out.append(&before);
        let header = std::mem::take(&mut self.function_header);
        self.out.append(&header);
        self.out.append(&body);
        Ok(())
    }

    fn lower_var_declarations(&mut self, declarations: &VarDeclarations, global: bool) -> Result<()> {
        let vars: Vec<&VarDeclaration> = declarations
            .vars
            .iter()
            .filter(|decl| !global || !is_unreferenced_global(self.program, decl.var))
            .collect();
        let first = match vars.first() {
            Some(first) => self.program.variable(first.var),
            None => return Ok(()),
        };
        let base = &declarations.base_type;
        let head = format!(
            "{}{}{} ",
            self.modifiers_text(&first.modifiers, global),
            self.type_precision(base),
            self.type_name(base)
        );
        self.out.write(&head);
        for (i, decl) in vars.iter().enumerate() {
            if i > 0 {
                self.out.write(", ");
            }
            let var = self.program.variable(decl.var);
            self.out.write(&identifier(&var.name));
            for size in &decl.sizes {
                match size.as_ref().and_then(Expression::as_int) {
                    Some(n) => self.out.write(&format!("[{}]", n)),
                    None => self.out.write("[]"),
                }
            }
            if let Some(value) = &decl.value {
                self.out.write(" = ");
                self.lower_expression(value, Precedence::TopLevel)?;
            }
            let component = var.ty.component_type();
            if component.name == "samplerExternalOES" && !self.found_external_sampler {
                self.found_external_sampler = true;
                let extension = if self.caps.generation == GlslGeneration::Es300 {
                    "GL_OES_EGL_image_external_essl3"
                } else {
                    "GL_OES_EGL_image_external"
                };
                self.add_extension(extension);
            }
            if component.name == "sampler2DRect" {
                self.found_rect_sampler = true;
            }
        }
        self.out.write(";");
        Ok(())
    }

    // --- statements ---

    fn lower_statement(&mut self, statement: &Statement) -> Result<()> {
        match &statement.kind {
            StatementKind::Block { statements, is_scope, .. } => {
                let braces = *is_scope || statement.is_empty();
                if braces {
                    self.out.write_line("{");
                    self.out.indent();
                }
                for child in statements {
                    if !child.is_empty() {
                        self.lower_statement(child)?;
                        self.out.finish_line();
                    }
                }
                if braces {
                    self.out.dedent();
                    self.out.write("}");
                }
            }
            StatementKind::Expression { expression } => {
                if self.settings.optimize && !has_side_effects(self.program, expression) {
                    return Ok(());
                }
                self.lower_expression(expression, Precedence::TopLevel)?;
                self.out.write(";");
            }
            StatementKind::Return { expression } => {
                self.out.write("return");
                if let Some(expression) = expression {
                    self.out.write(" ");
                    self.lower_expression(expression, Precedence::TopLevel)?;
                }
                self.out.write(";");
            }
            StatementKind::VarDeclarations { declarations } => self.lower_var_declarations(declarations, false)?,
            StatementKind::If { test, if_true, if_false, .. } => {
                self.out.write("if (");
                self.lower_expression(test, Precedence::TopLevel)?;
                self.out.write(") ");
                self.lower_statement(if_true)?;
                if let Some(if_false) = if_false {
                    self.out.write(" else ");
                    self.lower_statement(if_false)?;
                }
            }
            StatementKind::For { initializer, test, next, body, .. } => {
                self.lower_for(initializer.as_deref(), test.as_ref(), next.as_ref(), body)?
            }
            StatementKind::While { test, body } => {
                self.out.write("while (");
                self.lower_expression(test, Precedence::TopLevel)?;
                self.out.write(") ");
                self.lower_statement(body)?;
            }
            StatementKind::Do { body, test } => self.lower_do(body, test)?,
            StatementKind::Switch { value, cases, .. } => self.lower_switch(value, cases)?,
            StatementKind::Break => self.out.write("break;"),
            StatementKind::Continue => self.out.write("continue;"),
            StatementKind::Discard => self.out.write("discard;"),
            StatementKind::InlineMarker { .. } => {}
            StatementKind::Nop => self.out.write(";"),
        }
        Ok(())
    }

    fn lower_for(
        &mut self,
        initializer: Option<&Statement>,
        test: Option<&Expression>,
        next: Option<&Expression>,
        body: &Statement,
    ) -> Result<()> {
        // `for (;test;)` reads better as a while loop
        if initializer.is_none() && next.is_none() {
            if let Some(test) = test {
                self.out.write("while (");
                self.lower_expression(test, Precedence::TopLevel)?;
                self.out.write(") ");
                return self.lower_statement(body);
            }
        }
        self.out.write("for (");
        match initializer {
            Some(initializer) if !initializer.is_empty() => self.lower_statement(initializer)?,
            _ => self.out.write(";"),
        }
        self.out.write(" ");
        if let Some(test) = test {
            if self.caps.add_and_true_to_loop_condition {
                self.out.write("(");
                self.lower_expression(test, Precedence::LogicalAnd)?;
                self.out.write(" && true)");
            } else {
                self.lower_expression(test, Precedence::TopLevel)?;
            }
        }
        self.out.write("; ");
        if let Some(next) = next {
            self.lower_expression(next, Precedence::TopLevel)?;
        }
        self.out.write(") ");
        self.lower_statement(body)
    }

    fn lower_do(&mut self, body: &Statement, test: &Expression) -> Result<()> {
        if !self.caps.rewrite_do_while_loops {
            self.out.write("do ");
            self.lower_statement(body)?;
            self.out.write(" while (");
            self.lower_expression(test, Precedence::TopLevel)?;
            self.out.write(");");
            return Ok(());
        }
        // do { BODY } while (TEST) becomes
        //     bool seen = false;
        //     while (true) { if (seen) { if (!TEST) break; } seen = true; BODY }
        let seen = self.next_temp("_tmpLoopSeenOnce");
        self.out.write_line(&format!("bool {} = false;", seen));
        self.out.write_line("while (true) {");
        self.out.indent();
        self.out.write_line(&format!("if ({}) {{", seen));
        self.out.indent();
        self.out.write("if (!");
        self.lower_expression(test, Precedence::Prefix)?;
        self.out.write_line(") {");
        self.out.indent();
        self.out.write_line("break;");
        self.out.dedent();
        self.out.write_line("}");
        self.out.dedent();
        self.out.write_line("}");
        self.out.write_line(&format!("{} = true;", seen));
        self.lower_statement(body)?;
        self.out.finish_line();
        self.out.dedent();
        self.out.write("}");
        Ok(())
    }

    fn lower_switch(&mut self, value: &Expression, cases: &[SwitchCase]) -> Result<()> {
        self.out.write("switch (");
        self.lower_expression(value, Precedence::TopLevel)?;
        self.out.write_line(") {");
        self.out.indent();
        // a lone `default` confuses some drivers
        if cases.len() == 1 && cases[0].value.is_none() {
            self.out.write_line("case 0:");
        }
        let mut last_was_empty = false;
        for case in cases {
            match &case.value {
                None => self.out.write_line("default:"),
                Some(value) => {
                    self.out.write("case ");
                    match value.as_int() {
                        Some(n) => self.out.write(&n.to_string()),
                        None => self.lower_expression(value, Precedence::TopLevel)?,
                    }
                    self.out.write_line(":");
                }
            }
            last_was_empty = case.statements.iter().all(Statement::is_empty);
            self.out.indent();
            for statement in &case.statements {
                if !statement.is_empty() {
                    self.lower_statement(statement)?;
                    self.out.finish_line();
                }
            }
            self.out.dedent();
        }
        // the last case needs a statement of its own
        if last_was_empty {
            self.out.indent();
            self.out.write_line("break;");
            self.out.dedent();
        }
        self.out.dedent();
        self.out.finish_line();
        self.out.write("}");
        Ok(())
    }

    // --- expressions ---

    fn lower_expression(&mut self, expr: &Expression, parent: Precedence) -> Result<()> {
        match &expr.kind {
            ExpressionKind::BoolLiteral(b) => self.out.write(if *b { "true" } else { "false" }),
            ExpressionKind::IntLiteral(i) => {
                if expr.ty.is_unsigned() {
                    self.out.write(&format!("{}u", *i & 0xffff_ffff));
                } else {
                    self.out.write(&i.to_string());
                }
            }
            ExpressionKind::FloatLiteral(f) => self.out.write(&format_float(*f)),
            ExpressionKind::Setting { value, .. } => self.lower_expression(value, parent)?,
            ExpressionKind::Binary { left, op, right } => self.lower_binary(left, *op, right, parent)?,
            ExpressionKind::Prefix { op, operand } => {
                let parens = Precedence::Prefix >= parent;
                if parens {
                    self.out.write("(");
                }
                self.out.write(op.name());
                self.lower_expression(operand, Precedence::Prefix)?;
                if parens {
                    self.out.write(")");
                }
            }
            ExpressionKind::Postfix { operand, op } => {
                let parens = Precedence::Postfix >= parent;
                if parens {
                    self.out.write("(");
                }
                self.lower_expression(operand, Precedence::Postfix)?;
                self.out.write(op.name());
                if parens {
                    self.out.write(")");
                }
            }
            ExpressionKind::Ternary { test, if_true, if_false } => {
                let parens = Precedence::Ternary >= parent;
                if parens {
                    self.out.write("(");
                }
                self.lower_expression(test, Precedence::Ternary)?;
                self.out.write(" ? ");
                self.lower_expression(if_true, Precedence::Ternary)?;
                self.out.write(" : ");
                self.lower_expression(if_false, Precedence::Ternary)?;
                if parens {
                    self.out.write(")");
                }
            }
            ExpressionKind::Constructor { arguments } => self.lower_constructor(expr, arguments, parent)?,
            ExpressionKind::FunctionCall { function, arguments } => {
                self.lower_call(expr.offset, *function, arguments)?
            }
            ExpressionKind::FieldAccess { base, field_index, owner } => {
                if *owner == FieldOwner::Default {
                    self.lower_expression(base, Precedence::Postfix)?;
                    self.out.write(".");
                }
                let field = &base.ty.fields()[*field_index];
                let name = match field.modifiers.layout.builtin {
                    SK_POSITION_BUILTIN => "gl_Position".to_string(),
                    SK_POINTSIZE_BUILTIN => "gl_PointSize".to_string(),
                    _ => identifier(&field.name),
                };
                self.out.write(&name);
            }
            ExpressionKind::Index { base, index } => {
                self.lower_expression(base, Precedence::Postfix)?;
                self.out.write("[");
                self.lower_expression(index, Precedence::TopLevel)?;
                self.out.write("]");
            }
            ExpressionKind::Swizzle { base, components } => {
                let letters = swizzle_letters(components);
                if letters.len() == components.len() {
                    self.lower_expression(base, Precedence::Postfix)?;
                    self.out.write(".");
                    self.out.write(&letters);
                } else {
                    // trailing constant components become constructor arguments
                    self.out.write(&format!("{}(", self.type_name(&expr.ty)));
                    self.lower_expression(base, Precedence::Postfix)?;
                    self.out.write(".");
                    self.out.write(&letters);
                    for constant in swizzle_constants(components, expr.ty.is_float()) {
                        self.out.write(", ");
                        self.out.write(constant);
                    }
                    self.out.write(")");
                }
            }
            ExpressionKind::VariableReference { variable, .. } => self.lower_variable_reference(expr.offset, *variable)?,
            ExpressionKind::NullLiteral => bail_codegen_at!(expr.offset, "null is not supported in GLSL"),
            ExpressionKind::ExternalFunctionCall { function, .. } => bail_codegen_at!(
                expr.offset,
                "external function '{}' cannot be called from GLSL",
                self.program.externals[*function].name
            ),
            ExpressionKind::FunctionReference { .. } | ExpressionKind::TypeReference { .. } => {
                bail_codegen_at!(expr.offset, "unsupported expression: {}", self.program.describe_expression(expr))
            }
        }
        Ok(())
    }

    fn lower_binary(&mut self, left: &Expression, op: Operator, right: &Expression, parent: Precedence) -> Result<()> {
        if self.caps.unfolded_short_circuit_as_ternary && matches!(op, Operator::LogicalAnd | Operator::LogicalOr) {
            // a && b  =>  a ? b : false
            // a || b  =>  a ? true : b
            let parens = Precedence::Ternary >= parent;
            if parens {
                self.out.write("(");
            }
            self.lower_expression(left, Precedence::Ternary)?;
            self.out.write(" ? ");
            if op == Operator::LogicalAnd {
                self.lower_expression(right, Precedence::Ternary)?;
                self.out.write(" : false");
            } else {
                self.out.write("true : ");
                self.lower_expression(right, Precedence::Ternary)?;
            }
            if parens {
                self.out.write(")");
            }
            return Ok(());
        }

        let precedence = op.binary_precedence();
        let parens = precedence >= parent;
        if parens {
            self.out.write("(");
        }
        let position_workaround = self.program.kind == ProgramKind::Vertex
            && op.is_assignment()
            && !self.caps.can_use_fragcoord
            && is_sk_position(left)
            && !contains_rt_adjust(self.program, right);
        if position_workaround {
            self.out.write("sk_FragCoord_Workaround = (");
        }
        self.lower_expression(left, precedence)?;
        if op == Operator::Comma {
            self.out.write(", ");
        } else {
            self.out.write(&format!(" {} ", op.name()));
        }
        self.lower_expression(right, precedence)?;
        if position_workaround {
            self.out.write(")");
        }
        if parens {
            self.out.write(")");
        }
        Ok(())
    }

    fn lower_constructor(&mut self, expr: &Expression, arguments: &[Expression], parent: Precedence) -> Result<()> {
        if let [argument] = arguments {
            // half(float) and friends are the same type in GLSL
            let same_type = (argument.ty.is_scalar() || argument.ty.is_vector() || argument.ty.is_matrix())
                && self.type_name(&argument.ty) == self.type_name(&expr.ty);
            if same_type {
                return self.lower_expression(argument, parent);
            }
        }
        self.out.write(&format!("{}(", self.type_name(&expr.ty)));
        for (i, argument) in arguments.iter().enumerate() {
            if i > 0 {
                self.out.write(", ");
            }
            self.lower_expression(argument, Precedence::Sequence)?;
        }
        self.out.write(")");
        Ok(())
    }

    fn lower_arguments(&mut self, arguments: &[Expression]) -> Result<()> {
        for (i, argument) in arguments.iter().enumerate() {
            if i > 0 {
                self.out.write(", ");
            }
            self.lower_expression(argument, Precedence::Sequence)?;
        }
        Ok(())
    }

    fn lower_variable_reference(&mut self, offset: Offset, variable: VarId) -> Result<()> {
        let var = self.program.variable(variable);
        match var.modifiers.layout.builtin {
            SK_FRAGCOLOR_BUILTIN => {
                if self.caps.generation.has_out_variables() {
                    let precision = if self.caps.uses_precision_modifiers { "mediump " } else { "" };
                    self.add_global(format!("out {}vec4 sk_FragColor;\n", precision));
                    self.out.write("sk_FragColor");
                } else {
                    self.out.write("gl_FragColor");
                }
            }
            SK_FRAGCOORD_BUILTIN => self.lower_frag_coord(),
            SK_CLOCKWISE_BUILTIN => {
                if !self.setup_clockwise {
                    self.setup_clockwise = true;
                    // flipping Y reverses the winding order
                    let facing = if self.settings.flip_y { "!gl_FrontFacing" } else { "gl_FrontFacing" };
                    self.function_header.push_str(&format!("    bool sk_Clockwise = {};\n", facing));
                }
                self.out.write("sk_Clockwise");
            }
            SK_VERTEXID_BUILTIN => self.out.write("gl_VertexID"),
            SK_INSTANCEID_BUILTIN => self.out.write("gl_InstanceID"),
            SK_INVOCATIONID_BUILTIN => self.out.write("gl_InvocationID"),
            SK_IN_BUILTIN => self.out.write("gl_in"),
            SK_SAMPLEMASKIN_BUILTIN => self.out.write("gl_SampleMaskIn"),
            SK_SAMPLEMASK_BUILTIN => self.out.write("gl_SampleMask"),
            SK_LASTFRAGCOLOR_BUILTIN => {
                if !self.caps.fbfetch_support {
                    bail_codegen_at!(offset, "sk_LastFragColor requires framebuffer fetch support");
                }
                self.out.write("gl_LastFragData[0]");
            }
            SK_WIDTH_BUILTIN | SK_HEIGHT_BUILTIN => {
                let declaration = format!("uniform {}float {};\n", self.high_precision(), var.name);
                self.add_global(declaration);
                self.out.write(&var.name);
            }
            _ => {
                let name = identifier(&var.name);
                self.out.write(&name);
            }
        }
        Ok(())
    }

    fn lower_frag_coord(&mut self) {
        if !self.caps.can_use_fragcoord {
            if !self.setup_frag_coord {
                self.setup_frag_coord = true;
                let precision = self.high_precision();
                self.function_header.push_str(&format!(
                    "    {}float sk_FragCoord_InvW = 1.0 / sk_FragCoord_Workaround.w;\n",
                    precision
                ));
                self.function_header.push_str(&format!(
                    "    {}vec4 sk_FragCoord_Resolved = \
                     vec4(sk_FragCoord_Workaround.xyz * sk_FragCoord_InvW, sk_FragCoord_InvW);\n",
                    precision
                ));
                // exact .5 pixel centers
                self.function_header
                    .push_str("    sk_FragCoord_Resolved.xy = floor(sk_FragCoord_Resolved.xy) + vec2(0.5);\n");
            }
            self.out.write("sk_FragCoord_Resolved");
            return;
        }
        if !self.settings.flip_y && !self.settings.inverse_w {
            self.out.write("gl_FragCoord");
            return;
        }
        if !self.setup_frag_coord {
            self.setup_frag_coord = true;
            let y = if self.settings.flip_y {
                format!("{0}.x + {0}.y * gl_FragCoord.y", RTFLIP_NAME)
            } else {
                "gl_FragCoord.y".to_string()
            };
            let w = if self.settings.inverse_w { "1.0 / gl_FragCoord.w" } else { "gl_FragCoord.w" };
            self.function_header.push_str(&format!(
                "    {}vec4 sk_FragCoord = vec4(gl_FragCoord.x, {}, gl_FragCoord.z, {});\n",
                self.high_precision(),
                y,
                w
            ));
        }
        self.out.write("sk_FragCoord");
    }

    // --- calls ---

    fn lower_call(&mut self, offset: Offset, function: FuncId, arguments: &[Expression]) -> Result<()> {
        let declaration = self.program.function(function);
        if !declaration.builtin {
            self.out.write(&format!("{}(", identifier(&declaration.name)));
            self.lower_arguments(arguments)?;
            self.out.write(")");
            return Ok(());
        }
        let name = declaration.name.as_str();
        let legacy = is_legacy(self.caps.generation);
        match name {
            "abs" if self.caps.emulate_abs_int_function && arguments[0].ty.name == "int" => {
                self.helpers.add("_absemulation", || "int _absemulation(int x) { return x * sign(x); }\n".into());
                return self.lower_plain_call("_absemulation", arguments, ")");
            }
            "atan" if self.caps.must_force_negated_atan_param_to_float && arguments.len() == 2 => {
                if let ExpressionKind::Prefix { op: Operator::Minus, operand } = &arguments[1].kind {
                    self.out.write("atan(");
                    self.lower_expression(&arguments[0], Precedence::Sequence)?;
                    self.out.write(", -1.0 * ");
                    self.lower_expression(operand, Precedence::Multiplicative)?;
                    self.out.write(")");
                    return Ok(());
                }
            }
            "dFdx" | "dFdy" | "fwidth" => {
                if !self.found_derivatives {
                    if let Some(extension) = self.caps.shader_derivative_extension_string.clone() {
                        self.add_extension(&extension);
                    }
                    self.found_derivatives = true;
                }
                if name == "dFdy" && self.settings.flip_y {
                    // flipping Y also negates Y derivatives
                    self.out.write(&format!("({}.y * ", RTFLIP_NAME));
                    return self.lower_plain_call("dFdy", arguments, "))");
                }
            }
            "determinant" if !self.caps.builtin_determinant_support => {
                let (helper, text) = match arguments[0].ty.columns() {
                    2 => ("_determinant2", DETERMINANT2),
                    3 => ("_determinant3", DETERMINANT3),
                    _ => ("_determinant4", DETERMINANT4),
                };
                self.helpers.add(helper, || text.to_string());
                return self.lower_plain_call(helper, arguments, ")");
            }
            "inverse" if !self.caps.builtin_inverse_support || legacy => {
                let (helper, text) = match arguments[0].ty.columns() {
                    2 => ("_inverse2", INVERSE2),
                    3 => ("_inverse3", INVERSE3),
                    _ => ("_inverse4", INVERSE4),
                };
                self.helpers.add(helper, || text.to_string());
                return self.lower_plain_call(helper, arguments, ")");
            }
            "transpose" if !self.caps.builtin_transpose_support || legacy => {
                return self.lower_transpose_hack(&arguments[0]);
            }
            "inversesqrt" if legacy => {
                self.out.write("(1.0 / sqrt(");
                self.lower_expression(&arguments[0], Precedence::TopLevel)?;
                self.out.write("))");
                return Ok(());
            }
            "fract" if !self.caps.can_use_fract_for_negative_values => {
                self.out.write("(0.5 - sign(");
                self.lower_expression(&arguments[0], Precedence::Sequence)?;
                self.out.write(") * (0.5 - fract(abs(");
                self.lower_expression(&arguments[0], Precedence::Sequence)?;
                self.out.write("))))");
                return Ok(());
            }
            "min" if !self.caps.can_use_min_and_abs_together => {
                if is_abs_call(self.program, &arguments[0]) {
                    return self.lower_min_abs_hack(&arguments[0], &arguments[1]);
                }
                if is_abs_call(self.program, &arguments[1]) {
                    // evaluates the arguments out of source order
                    return self.lower_min_abs_hack(&arguments[1], &arguments[0]);
                }
            }
            "pow" if self.caps.remove_pow_with_constant_exponent && arguments[1].is_compile_time_constant() => {
                self.out.write("exp2(");
                self.lower_expression(&arguments[1], Precedence::Multiplicative)?;
                self.out.write(" * log2(");
                self.lower_expression(&arguments[0], Precedence::Sequence)?;
                self.out.write("))");
                return Ok(());
            }
            "saturate" => {
                self.out.write("clamp(");
                self.lower_expression(&arguments[0], Precedence::Sequence)?;
                self.out.write(", 0.0, 1.0)");
                return Ok(());
            }
            "sample" => return self.lower_sample(offset, arguments),
            _ => {}
        }
        self.lower_plain_call(name, arguments, ")")
    }

    fn lower_plain_call(&mut self, name: &str, arguments: &[Expression], closing: &str) -> Result<()> {
        self.out.write(name);
        self.out.write("(");
        self.lower_arguments(arguments)?;
        self.out.write(closing);
        Ok(())
    }

    /// `min(abs(x), y)` becomes `((t1 = abs(x)) < (t2 = y) ? t1 : t2)`.
    fn lower_min_abs_hack(&mut self, abs: &Expression, other: &Expression) -> Result<()> {
        let first = self.hoist_temp("minAbsHackVar", &abs.ty);
        let second = self.hoist_temp("minAbsHackVar", &other.ty);
        self.out.write(&format!("(({} = ", first));
        self.lower_expression(abs, Precedence::TopLevel)?;
        self.out.write(&format!(") < ({} = ", second));
        self.lower_expression(other, Precedence::Assignment)?;
        self.out.write(&format!(") ? {} : {})", first, second));
        Ok(())
    }

    fn lower_transpose_hack(&mut self, matrix: &Expression) -> Result<()> {
        let (columns, rows) = (matrix.ty.columns(), matrix.ty.rows());
        let name = format!("transpose{}{}", columns, rows);
        let transposed = match self.program.context.compound(matrix.ty.component_type(), rows, columns) {
            Some(ty) => self.type_name(&ty),
            None => bail_codegen_at!(matrix.offset, "cannot transpose '{}'", matrix.ty),
        };
        let type_name = self.type_name(&matrix.ty);
        self.helpers.add(&name, || {
            let mut elements = Vec::with_capacity(columns * rows);
            for row in 0..rows {
                for column in 0..columns {
                    elements.push(format!("m[{}][{}]", column, row));
                }
            }
            format!(
                "{} {}({} m) {{ return {}({}); }}\n",
                transposed,
                name,
                type_name,
                transposed,
                elements.join(", ")
            )
        });
        self.lower_plain_call(&name, std::slice::from_ref(matrix), ")")
    }

    fn lower_sample(&mut self, offset: Offset, arguments: &[Expression]) -> Result<()> {
        let sampler = &arguments[0].ty;
        let dim = match &sampler.kind {
            TypeKind::Sampler { texture } => match &texture.kind {
                TypeKind::Texture { dim, .. } => *dim,
                _ => bail_codegen_at!(offset, "'{}' is not a sampler", sampler),
            },
            _ => bail_codegen_at!(offset, "sampling '{}' is not supported in GLSL", sampler),
        };
        let coords = arguments[1].ty.columns();
        let (legacy_dim, proj, biasable) = match dim {
            SamplerDim::D1 => ("1D", coords == 2, true),
            SamplerDim::D2 => ("2D", coords == 3, true),
            SamplerDim::External => ("2D", coords == 3, false),
            SamplerDim::D3 => ("3D", coords == 4, true),
            SamplerDim::Cube => ("Cube", false, true),
            SamplerDim::Rect => ("2DRect", false, false),
            SamplerDim::Buffer | SamplerDim::SubpassData => {
                bail_codegen_at!(offset, "sampling '{}' is not supported in GLSL", sampler)
            }
        };
        let mut name = "texture".to_string();
        if is_legacy(self.caps.generation) {
            name.push_str(legacy_dim);
        }
        if proj {
            name.push_str("Proj");
        }
        self.out.write(&name);
        self.out.write("(");
        self.lower_arguments(arguments)?;
        if self.settings.sharpen_textures && biasable && arguments.len() == 2 {
            self.out.write(&format!(", {}", SHARPEN_TEXTURES_BIAS));
        }
        self.out.write(")");
        Ok(())
    }
}

fn is_sk_position(expr: &Expression) -> bool {
    match &expr.kind {
        ExpressionKind::FieldAccess { base, field_index, .. } => {
            base.ty.fields()[*field_index].modifiers.layout.builtin == SK_POSITION_BUILTIN
        }
        _ => false,
    }
}

fn is_abs_call(program: &Program, expr: &Expression) -> bool {
    match &expr.kind {
        ExpressionKind::FunctionCall { function, .. } => {
            let function = program.function(*function);
            function.builtin && function.name == "abs"
        }
        _ => false,
    }
}
