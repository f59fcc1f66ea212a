//! Metal Lowering
//!
//! Metal has no mutable globals, so shader state travels in structs:
//! `Inputs` (stage-in), `Outputs` (stage-out), `Uniforms` (one constant
//! buffer) and `Globals` (plain globals, textures and interface blocks).
//! `main` builds them; every other function receives the ones its body
//! needs as extra leading parameters, as computed by `requirements`.

use crate::builtins::*;
use crate::error::{CompilerError, Offset, Result};
use crate::glsl::RTFLIP_NAME;
use crate::ir::*;
use crate::lowering_common::{is_unreferenced_global, swizzle_constants, swizzle_letters, CodeWriter, HelperSet};
use crate::memory_layout::{LayoutStandard, MemoryLayout};
use crate::modifiers::Modifiers;
use crate::settings::{ProgramKind, Settings};
use crate::types::{SamplerDim, Type, TypeKind};
use crate::visitor::{walk_expression, ProgramVisitor};
use crate::{bail_codegen, bail_codegen_at};
use log::{debug, trace};
use std::collections::HashMap;
use std::ops::ControlFlow;

const INPUTS: u32 = 1 << 0;
const OUTPUTS: u32 = 1 << 1;
const UNIFORMS: u32 = 1 << 2;
const GLOBALS: u32 = 1 << 3;
const FRAG_COORD: u32 = 1 << 4;
const FRONT_FACING: u32 = 1 << 5;
const VERTEX_ID: u32 = 1 << 6;
const INSTANCE_ID: u32 = 1 << 7;

const SAMPLER_SUFFIX: &str = "Smplr";
const RTFLIP_STRUCT: &str = "sksl_synthetic_uniforms";
const RTFLIP_PARAM: &str = "_rtFlip";

const INVERSE2: &str = "
float2x2 float2x2_inverse(float2x2 m) {
return float2x2(float2(m[1].y, -m[0].y), float2(-m[1].x, m[0].x)) * (1 / (m[0].x * m[1].y - m[0].y * m[1].x));
}
";

const INVERSE3: &str = "
float3x3 float3x3_inverse(float3x3 m) {
float
 a00 = m[0].x, a01 = m[0].y, a02 = m[0].z,
 a10 = m[1].x, a11 = m[1].y, a12 = m[1].z,
 a20 = m[2].x, a21 = m[2].y, a22 = m[2].z,
 b01 = a22*a11 - a12*a21,
 b11 =-a22*a10 + a12*a20,
 b21 = a21*a10 - a11*a20,
 det = a00*b01 + a01*b11 + a02*b21;
return float3x3(
 float3(b01, (-a22*a01 + a02*a21), ( a12*a01 - a02*a11)),
 float3(b11, ( a22*a00 - a02*a20), (-a12*a00 + a02*a10)),
 float3(b21, (-a21*a00 + a01*a20), ( a11*a00 - a01*a10))) * (1 / det);
}
";

const INVERSE4: &str = "
float4x4 float4x4_inverse(float4x4 m) {
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
return float4x4(
 float4(a11*b11 - a12*b10 + a13*b09, a02*b10 - a01*b11 - a03*b09, a31*b05 - a32*b04 + a33*b03, a22*b04 - a21*b05 - a23*b03),
 float4(a12*b08 - a10*b11 - a13*b07, a00*b11 - a02*b08 + a03*b07, a32*b02 - a30*b05 - a33*b01, a20*b05 - a22*b02 + a23*b01),
 float4(a10*b10 - a11*b08 + a13*b06, a01*b08 - a00*b10 - a03*b06, a30*b04 - a31*b02 + a33*b00, a21*b02 - a20*b04 - a23*b00),
 float4(a11*b07 - a10*b09 - a12*b06, a00*b09 - a01*b07 + a02*b06, a31*b01 - a30*b03 - a32*b00, a20*b03 - a21*b01 + a22*b00)) * (1 / det);
}
";

/// Lower a program to Metal Shading Language source.
pub fn lower(program: &Program) -> Result<String> {
    match program.kind {
        ProgramKind::Vertex | ProgramKind::Fragment => {}
        ProgramKind::Geometry => bail_codegen!("Metal does not support geometry shaders"),
        ProgramKind::Pipeline => bail_codegen!("pipeline programs can only be lowered to the VM"),
    }
    LowerCtx::new(program)?.lower_program()
}

/// Where a global variable lives in the generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GlobalClass {
    Builtin,
    Input,
    Output,
    Uniform,
    Texture,
    Constant,
    Global,
}

fn classify(var: &Variable) -> GlobalClass {
    if var.modifiers.layout.builtin != -1 {
        GlobalClass::Builtin
    } else if var.ty.is_opaque() {
        GlobalClass::Texture
    } else if var.modifiers.has(Modifiers::IN) {
        GlobalClass::Input
    } else if var.modifiers.has(Modifiers::OUT) {
        GlobalClass::Output
    } else if var.modifiers.has(Modifiers::UNIFORM) {
        GlobalClass::Uniform
    } else if var.modifiers.has(Modifiers::CONST) {
        GlobalClass::Constant
    } else {
        GlobalClass::Global
    }
}

/// A member of the `Globals` struct.
#[derive(Debug, Clone)]
enum GlobalEntry<'a> {
    Variable { var: VarId, value: Option<&'a Expression> },
    Texture { var: VarId, binding: i32 },
    Block { name: String, type_name: String, binding: i32 },
    RtFlip { binding: i32 },
}

struct RequirementsFinder<'a, 'c> {
    program: &'a Program,
    rt_flip: bool,
    cache: &'c mut HashMap<FuncId, u32>,
    requirements: u32,
}

impl ProgramVisitor for RequirementsFinder<'_, '_> {
    type Break = ();

    fn visit_expression(&mut self, expression: &Expression) -> ControlFlow<()> {
        match &expression.kind {
            ExpressionKind::FunctionCall { function, .. } => {
                let declaration = self.program.function(*function);
                if declaration.builtin {
                    if declaration.name == "dFdy" && self.rt_flip {
                        self.requirements |= GLOBALS;
                    }
                } else {
                    self.requirements |= function_requirements(self.program, self.rt_flip, *function, self.cache);
                }
            }
            ExpressionKind::FieldAccess { base, field_index, owner } => {
                let builtin = base.ty.fields()[*field_index].modifiers.layout.builtin;
                if builtin == SK_POSITION_BUILTIN || builtin == SK_POINTSIZE_BUILTIN {
                    self.requirements |= OUTPUTS;
                    return ControlFlow::Continue(());
                }
                if *owner == FieldOwner::AnonymousInterfaceBlock {
                    self.requirements |= GLOBALS;
                    return ControlFlow::Continue(());
                }
            }
            ExpressionKind::VariableReference { variable, .. } => {
                let var = self.program.variable(*variable);
                let flip = if self.rt_flip { GLOBALS } else { 0 };
                self.requirements |= match var.modifiers.layout.builtin {
                    SK_FRAGCOORD_BUILTIN => FRAG_COORD | flip,
                    SK_CLOCKWISE_BUILTIN => FRONT_FACING | flip,
                    SK_FRAGCOLOR_BUILTIN => OUTPUTS,
                    SK_VERTEXID_BUILTIN => VERTEX_ID,
                    SK_INSTANCEID_BUILTIN => INSTANCE_ID,
                    SK_WIDTH_BUILTIN | SK_HEIGHT_BUILTIN => UNIFORMS,
                    _ => match var.storage {
                        Storage::InterfaceBlock => GLOBALS,
                        Storage::Global => match classify(var) {
                            GlobalClass::Input => INPUTS,
                            GlobalClass::Output => OUTPUTS,
                            GlobalClass::Uniform => UNIFORMS,
                            GlobalClass::Texture | GlobalClass::Global => GLOBALS,
                            GlobalClass::Constant | GlobalClass::Builtin => 0,
                        },
                        Storage::Local | Storage::Parameter => 0,
                    },
                };
            }
            _ => {}
        }
        walk_expression(self, expression)
    }
}

/// The implicit parameters a function needs, including those of its callees.
fn function_requirements(
    program: &Program,
    rt_flip: bool,
    function: FuncId,
    cache: &mut HashMap<FuncId, u32>,
) -> u32 {
    if let Some(requirements) = cache.get(&function) {
        return *requirements;
    }
    // recursion is rejected earlier; this only guards the walk itself
    cache.insert(function, 0);
    let Some(def) = program.function_definition(function) else {
        return 0;
    };
    let mut finder = RequirementsFinder { program, rt_flip, cache, requirements: 0 };
    let _ = finder.visit_statement(&def.body);
    let requirements = finder.requirements;
    cache.insert(function, requirements);
    requirements
}

fn identifier(name: &str) -> String {
    const RESERVED: &[&str] = &[
        "constant", "device", "thread", "threadgroup", "kernel", "vertex", "fragment", "sampler", "texture",
        "using", "namespace", "template", "class", "private", "public",
    ];
    if RESERVED.contains(&name) {
        format!("{}_", name)
    } else {
        name.to_string()
    }
}

/// Context for lowering the IR to Metal
struct LowerCtx<'a> {
    program: &'a Program,
    settings: &'a Settings,
    out: CodeWriter,
    helpers: HelperSet,
    requirements: HashMap<FuncId, u32>,
    rt_flip: bool,
    uniform_buffer: i32,
    globals: Vec<GlobalEntry<'a>>,
    /// Accessor for each interface block variable, relative to `_globals`.
    block_names: HashMap<VarId, String>,
    in_main: bool,
}

impl<'a> LowerCtx<'a> {
    fn new(program: &'a Program) -> Result<Self> {
        let mut ctx = LowerCtx {
            program,
            settings: &program.settings,
            out: CodeWriter::new(),
            helpers: HelperSet::default(),
            requirements: HashMap::new(),
            rt_flip: program.settings.flip_y && program.inputs.rt_flip,
            uniform_buffer: -1,
            globals: Vec::new(),
            block_names: HashMap::new(),
            in_main: false,
        };
        ctx.collect_globals()?;
        Ok(ctx)
    }

    fn requirements(&mut self, function: FuncId) -> u32 {
        function_requirements(self.program, self.rt_flip, function, &mut self.requirements)
    }

    fn collect_globals(&mut self) -> Result<()> {
        let program = self.program;
        let mut anonymous = 0;
        let mut max_buffer = -1;
        for element in &program.elements {
            match element {
                ProgramElement::GlobalVar(declarations) => {
                    for decl in &declarations.vars {
                        let var = program.variable(decl.var);
                        if is_unreferenced_global(program, decl.var) {
                            continue;
                        }
                        match classify(var) {
                            GlobalClass::Global => {
                                self.globals.push(GlobalEntry::Variable { var: decl.var, value: decl.value.as_ref() })
                            }
                            GlobalClass::Texture => {
                                let binding = var.modifiers.layout.binding;
                                if binding == -1 {
                                    bail_codegen_at!(var.offset, "Metal samplers must have 'layout(binding=...)'");
                                }
                                self.globals.push(GlobalEntry::Texture { var: decl.var, binding });
                            }
                            GlobalClass::Uniform => {
                                let set = var.modifiers.layout.set.max(0);
                                if self.uniform_buffer == -1 {
                                    self.uniform_buffer = set;
                                } else if set != self.uniform_buffer {
                                    bail_codegen_at!(
                                        var.offset,
                                        "Metal backend requires all uniforms to have the same 'layout(set=...)'"
                                    );
                                }
                                max_buffer = max_buffer.max(set);
                            }
                            _ => {}
                        }
                    }
                }
                ProgramElement::InterfaceBlock(block) if block.type_name != "sk_PerVertex" => {
                    let var = program.variable(block.variable);
                    if !block.sizes.is_empty() {
                        bail_codegen_at!(block.offset, "arrayed interface blocks are not supported in Metal");
                    }
                    let binding = var.modifiers.layout.binding;
                    if binding == -1 {
                        bail_codegen_at!(block.offset, "Metal interface blocks must have 'layout(binding=...)'");
                    }
                    max_buffer = max_buffer.max(binding);
                    let name = if block.instance_name.is_empty() {
                        let name = format!("_anonInterface{}", anonymous);
                        anonymous += 1;
                        name
                    } else {
                        identifier(&block.instance_name)
                    };
                    self.block_names.insert(block.variable, name.clone());
                    self.globals.push(GlobalEntry::Block {
                        name,
                        type_name: identifier(&block.type_name),
                        binding,
                    });
                }
                _ => {}
            }
        }
        let uses_dimensions = crate::analysis::references_builtin(self.program, SK_WIDTH_BUILTIN)
            || crate::analysis::references_builtin(self.program, SK_HEIGHT_BUILTIN);
        if uses_dimensions && self.uniform_buffer == -1 {
            self.uniform_buffer = 0;
            max_buffer = max_buffer.max(0);
        }
        if self.rt_flip && self.program.kind == ProgramKind::Fragment {
            self.globals.push(GlobalEntry::RtFlip { binding: max_buffer + 1 });
        }
        Ok(())
    }

    fn lower_program(mut self) -> Result<String> {
        debug!("lowering {} program to Metal", self.program.kind);
        for element in &self.program.elements {
            self.lower_element(element)?;
        }
        let body = self.out.take();
        let mut output = self.header()?;
        output.push_str(self.helpers.text());
        output.push_str(&body);
        Ok(output)
    }

    fn rt_flip_name(&self) -> String {
        format!("_globals.{}->{}", RTFLIP_PARAM, RTFLIP_NAME)
    }

    // --- types ---

    fn type_name(&self, ty: &Type) -> String {
        match &ty.kind {
            TypeKind::Vector { component, columns } => format!("{}{}", self.type_name(component), columns),
            TypeKind::Matrix { component, columns, rows } => {
                format!("{}{}x{}", self.type_name(component), columns, rows)
            }
            TypeKind::Array { component, count } => {
                // runtime-sized arrays are indexed past their declared length
                format!("array<{}, {}>", self.type_name(component), count.unwrap_or(1))
            }
            TypeKind::Enum => "int".to_string(),
            TypeKind::Sampler { .. } => "texture2d<half>".to_string(),
            _ => identifier(&ty.name),
        }
    }

    // --- header ---

    fn header(&self) -> Result<String> {
        let mut text = String::new();
        text.push_str("#include <metal_stdlib>\n");
        text.push_str("#include <simd/simd.h>\n");
        text.push_str("using namespace metal;\n");

        for element in &self.program.elements {
            match element {
                ProgramElement::StructDefinition { ty, .. } => {
                    text.push_str(&format!("struct {} {{\n", identifier(&ty.name)));
                    for field in ty.fields() {
                        text.push_str(&format!("    {} {};\n", self.type_name(&field.ty), identifier(&field.name)));
                    }
                    text.push_str("};\n");
                }
                ProgramElement::InterfaceBlock(block) if block.type_name != "sk_PerVertex" => {
                    let var = self.program.variable(block.variable);
                    text.push_str(&format!("struct {} {{\n", identifier(&block.type_name)));
                    for field in var.ty.fields() {
                        text.push_str(&format!("    {} {};\n", self.type_name(&field.ty), identifier(&field.name)));
                    }
                    text.push_str("};\n");
                }
                _ => {}
            }
        }
        if self.globals.iter().any(|g| matches!(g, GlobalEntry::RtFlip { .. })) {
            text.push_str(&format!("struct {} {{\n    float2 {};\n}};\n", RTFLIP_STRUCT, RTFLIP_NAME));
        }
        text.push_str(&self.uniform_struct()?);
        text.push_str(&self.input_struct());
        text.push_str(&self.output_struct()?);
        text.push_str(&self.globals_struct());
        Ok(text)
    }

    /// Uniforms are packed with Metal rules; explicit `layout(offset=...)`
    /// values are honored with `char` padding.
    fn uniform_struct(&self) -> Result<String> {
        if self.uniform_buffer == -1 {
            return Ok(String::new());
        }
        let layout = MemoryLayout::new(LayoutStandard::Metal);
        let mut text = "struct Uniforms {\n".to_string();
        let mut current = 0;
        let mut pad_count = 0;
        let mut add_field = |text: &mut String, offset_hint: i32, var_offset: Offset, ty: &Type, name: &str| {
            let (Some(alignment), Some(size)) = (layout.alignment(ty), layout.size(ty)) else {
                return Err(CompilerError::CodegenError(
                    format!("type '{}' is not permitted in a Metal uniform block", ty),
                    Some(var_offset),
                ));
            };
            if offset_hint >= 0 {
                let offset = offset_hint as usize;
                if offset < current {
                    return Err(CompilerError::CodegenError(
                        format!("offset of field '{}' must be at least {}", name, current),
                        Some(var_offset),
                    ));
                }
                if offset > current {
                    text.push_str(&format!("    char pad{}[{}];\n", pad_count, offset - current));
                    pad_count += 1;
                    current = offset;
                }
                if offset % alignment != 0 {
                    return Err(CompilerError::CodegenError(
                        format!("offset of field '{}' must be a multiple of {}", name, alignment),
                        Some(var_offset),
                    ));
                }
            } else if current % alignment != 0 {
                current += alignment - current % alignment;
            }
            current += size;
            Ok(())
        };
        for element in &self.program.elements {
            if let ProgramElement::GlobalVar(declarations) = element {
                for decl in &declarations.vars {
                    let var = self.program.variable(decl.var);
                    if classify(var) != GlobalClass::Uniform || is_unreferenced_global(self.program, decl.var) {
                        continue;
                    }
                    add_field(&mut text, var.modifiers.layout.offset, var.offset, &var.ty, &var.name)?;
                    text.push_str(&format!("    {} {};\n", self.type_name(&var.ty), identifier(&var.name)));
                }
            }
        }
        for builtin in [SK_WIDTH_BUILTIN, SK_HEIGHT_BUILTIN] {
            if crate::analysis::references_builtin(self.program, builtin) {
                let name = if builtin == SK_WIDTH_BUILTIN { "sk_Width" } else { "sk_Height" };
                add_field(&mut text, -1, -1, &self.program.context.float_type, name)?;
                text.push_str(&format!("    float {};\n", name));
            }
        }
        text.push_str("};\n");
        Ok(text)
    }

    fn input_struct(&self) -> String {
        let mut text = "struct Inputs {\n".to_string();
        for var in self.interface_vars(GlobalClass::Input) {
            text.push_str(&format!("    {} {}", self.type_name(&var.ty), identifier(&var.name)));
            let location = var.modifiers.layout.location;
            if location != -1 {
                if self.program.kind == ProgramKind::Vertex {
                    text.push_str(&format!("  [[attribute({})]]", location));
                } else {
                    text.push_str(&format!("  [[user(locn{})]]", location));
                }
            }
            text.push_str(";\n");
        }
        text.push_str("};\n");
        text
    }

    fn output_struct(&self) -> Result<String> {
        let mut text = "struct Outputs {\n".to_string();
        if self.program.kind == ProgramKind::Vertex {
            text.push_str("    float4 sk_Position [[position]];\n");
        } else {
            text.push_str("    half4 sk_FragColor [[color(0)]];\n");
        }
        for var in self.interface_vars(GlobalClass::Output) {
            let location = var.modifiers.layout.location;
            if location < 0 {
                bail_codegen_at!(var.offset, "Metal out variables must have 'layout(location=...)'");
            }
            text.push_str(&format!("    {} {}", self.type_name(&var.ty), identifier(&var.name)));
            if self.program.kind == ProgramKind::Vertex {
                text.push_str(&format!(" [[user(locn{})]]", location));
            } else {
                text.push_str(&format!(" [[color({})", location));
                if var.modifiers.layout.index > 0 {
                    text.push_str(&format!(", index({})", var.modifiers.layout.index));
                }
                text.push_str("]]");
            }
            text.push_str(";\n");
        }
        if self.program.kind == ProgramKind::Vertex {
            text.push_str("    float sk_PointSize [[point_size]];\n");
        }
        text.push_str("};\n");
        Ok(text)
    }

    fn interface_vars(&self, class: GlobalClass) -> Vec<&'a Variable> {
        let program = self.program;
        program
            .elements
            .iter()
            .filter_map(|element| match element {
                ProgramElement::GlobalVar(declarations) => Some(declarations.vars.iter()),
                _ => None,
            })
            .flatten()
            .map(|decl| program.variable(decl.var))
            .filter(|var| classify(var) == class)
            .collect()
    }

    fn globals_struct(&self) -> String {
        if self.globals.is_empty() {
            return String::new();
        }
        let mut text = "struct Globals {\n".to_string();
        for global in &self.globals {
            match global {
                GlobalEntry::Variable { var, .. } => {
                    let var = self.program.variable(*var);
                    text.push_str(&format!("    {} {};\n", self.type_name(&var.ty), identifier(&var.name)));
                }
                GlobalEntry::Texture { var, .. } => {
                    let var = self.program.variable(*var);
                    let name = identifier(&var.name);
                    text.push_str(&format!("    {} {};\n", self.type_name(&var.ty), name));
                    text.push_str(&format!("    sampler {}{};\n", name, SAMPLER_SUFFIX));
                }
                GlobalEntry::Block { name, type_name, .. } => {
                    text.push_str(&format!("    constant {}* {};\n", type_name, name));
                }
                GlobalEntry::RtFlip { .. } => {
                    text.push_str(&format!("    constant {}* {};\n", RTFLIP_STRUCT, RTFLIP_PARAM));
                }
            }
        }
        text.push_str("};\n");
        text
    }

    // --- program elements ---

    fn lower_element(&mut self, element: &ProgramElement) -> Result<()> {
        match element {
            ProgramElement::GlobalVar(declarations) => {
                for decl in &declarations.vars {
                    let var = self.program.variable(decl.var);
                    if classify(var) != GlobalClass::Constant || is_unreferenced_global(self.program, decl.var) {
                        continue;
                    }
                    self.out.write(&format!("constant {} {}", self.type_name(&var.ty), identifier(&var.name)));
                    if let Some(value) = &decl.value {
                        self.out.write(" = ");
                        self.lower_expression(value, Precedence::TopLevel)?;
                    }
                    self.out.write_line(";");
                }
            }
            ProgramElement::Function(def) => self.lower_function(def)?,
            ProgramElement::FunctionPrototype { declaration, .. } => {
                if self.program.function(*declaration).name != "main" {
                    let signature = self.function_signature(*declaration)?;
                    self.out.write_line(&format!("{};", signature));
                }
            }
            // structs and interface blocks are part of the header
            ProgramElement::StructDefinition { .. } | ProgramElement::InterfaceBlock(_) => {}
            ProgramElement::Extension { .. }
            | ProgramElement::Modifiers { .. }
            | ProgramElement::Enum(_)
            | ProgramElement::Section(_) => {}
        }
        Ok(())
    }

    fn main_signature(&self) -> String {
        let mut params = vec!["Inputs _in [[stage_in]]".to_string()];
        if self.uniform_buffer != -1 {
            params.push(format!("constant Uniforms& _uniforms [[buffer({})]]", self.uniform_buffer));
        }
        for global in &self.globals {
            match global {
                GlobalEntry::Texture { var, binding } => {
                    let var = self.program.variable(*var);
                    let name = identifier(&var.name);
                    params.push(format!(
                        "{} {} [[texture({})]], sampler {}{} [[sampler({})]]",
                        self.type_name(&var.ty),
                        name,
                        binding,
                        name,
                        SAMPLER_SUFFIX,
                        binding
                    ));
                }
                GlobalEntry::Block { name, type_name, binding } => {
                    params.push(format!("constant {}& {} [[buffer({})]]", type_name, name, binding));
                }
                GlobalEntry::RtFlip { binding } => {
                    params.push(format!("constant {}& {} [[buffer({})]]", RTFLIP_STRUCT, RTFLIP_PARAM, binding));
                }
                GlobalEntry::Variable { .. } => {}
            }
        }
        match self.program.kind {
            ProgramKind::Vertex => {
                params.push("uint sk_VertexID [[vertex_id]]".to_string());
                params.push("uint sk_InstanceID [[instance_id]]".to_string());
                format!("vertex Outputs vertexMain({})", params.join(", "))
            }
            _ => {
                params.push("bool _frontFacing [[front_facing]]".to_string());
                params.push("float4 _fragCoord [[position]]".to_string());
                format!("fragment Outputs fragmentMain({})", params.join(", "))
            }
        }
    }

    fn function_signature(&mut self, id: FuncId) -> Result<String> {
        let requirements = self.requirements(id);
        let function = self.program.function(id);
        let mut params = Vec::new();
        for (flag, param) in [
            (INPUTS, "Inputs _in"),
            (OUTPUTS, "thread Outputs& _out"),
            (UNIFORMS, "constant Uniforms& _uniforms"),
            (GLOBALS, "thread Globals& _globals"),
            (FRAG_COORD, "float4 _fragCoord"),
            (FRONT_FACING, "bool _frontFacing"),
            (VERTEX_ID, "uint sk_VertexID"),
            (INSTANCE_ID, "uint sk_InstanceID"),
        ] {
            if requirements & flag != 0 {
                params.push(param.to_string());
            }
        }
        for param in &function.parameters {
            let param = self.program.variable(*param);
            if param.ty.is_opaque() {
                bail_codegen_at!(param.offset, "Metal does not support opaque parameters");
            }
            let mut text = String::new();
            if param.modifiers.has(Modifiers::OUT) {
                text.push_str(&format!("thread {}* ", self.type_name(&param.ty)));
            } else {
                if param.modifiers.has(Modifiers::CONST) {
                    text.push_str("const ");
                }
                text.push_str(&self.type_name(&param.ty));
                text.push(' ');
            }
            text.push_str(&identifier(&param.name));
            params.push(text);
        }
        Ok(format!(
            "{} {}({})",
            self.type_name(&function.return_type),
            identifier(&function.name),
            params.join(", ")
        ))
    }

    fn lower_function(&mut self, def: &FunctionDefinition) -> Result<()> {
        let function = self.program.function(def.declaration);
        trace!("lowering function '{}'", function.name);
        self.in_main = function.name == "main";
        let signature = if self.in_main {
            self.main_signature()
        } else {
            self.function_signature(def.declaration)?
        };
        self.out.write_line(&format!("{} {{", signature));
        self.out.indent();
        if self.in_main {
            self.lower_global_init()?;
            self.out.write_line("Outputs _out;");
            self.out.write_line("(void)_out;");
        }
        let statements = match &def.body.kind {
            StatementKind::Block { statements, .. } => statements.as_slice(),
            _ => std::slice::from_ref(&def.body),
        };
        for statement in statements {
            if !statement.is_empty() {
                self.lower_statement(statement)?;
                self.out.finish_line();
            }
        }
        let ends_with_return = matches!(statements.last().map(|s| &s.kind), Some(StatementKind::Return { .. }));
        if self.in_main && !ends_with_return {
            self.out.write_line("return _out;");
        }
        self.out.dedent();
        self.out.write_line("}");
        self.in_main = false;
        Ok(())
    }

    fn lower_global_init(&mut self) -> Result<()> {
        if self.globals.is_empty() {
            return Ok(());
        }
        self.out.write("Globals _globals{");
        let globals = self.globals.clone();
        for (i, global) in globals.iter().enumerate() {
            if i > 0 {
                self.out.write(", ");
            }
            match global {
                GlobalEntry::Variable { value: Some(value), .. } => self.lower_expression(value, Precedence::Sequence)?,
                GlobalEntry::Variable { value: None, .. } => self.out.write("{}"),
                GlobalEntry::Texture { var, .. } => {
                    let name = identifier(&self.program.variable(*var).name);
                    self.out.write(&format!("{}, {}{}", name, name, SAMPLER_SUFFIX));
                }
                GlobalEntry::Block { name, .. } => self.out.write(&format!("&{}", name)),
                GlobalEntry::RtFlip { .. } => self.out.write(&format!("&{}", RTFLIP_PARAM)),
            }
        }
        self.out.write_line("};");
        self.out.write_line("(void)_globals;");
        Ok(())
    }

    fn lower_var_declarations(&mut self, declarations: &VarDeclarations) -> Result<()> {
        let types: Vec<String> =
            declarations.vars.iter().map(|d| self.type_name(&self.program.variable(d.var).ty)).collect();
        let shared = types.windows(2).all(|w| w[0] == w[1]);
        for (i, decl) in declarations.vars.iter().enumerate() {
            let var = self.program.variable(decl.var);
            if i == 0 || !shared {
                if i > 0 {
                    self.out.write(" ");
                }
                if var.modifiers.has(Modifiers::CONST) {
                    self.out.write("const ");
                }
                self.out.write(&types[i]);
                self.out.write(" ");
            } else {
                self.out.write(", ");
            }
            self.out.write(&identifier(&var.name));
            if let Some(value) = &decl.value {
                self.out.write(" = ");
                self.lower_expression(value, Precedence::Sequence)?;
            }
            if !shared {
                self.out.write(";");
            }
        }
        if shared {
            self.out.write(";");
        }
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
                self.lower_expression(expression, Precedence::TopLevel)?;
                self.out.write(";");
            }
            StatementKind::Return { expression } => {
                if self.in_main {
                    self.out.write("return _out;");
                    return Ok(());
                }
                self.out.write("return");
                if let Some(expression) = expression {
                    self.out.write(" ");
                    self.lower_expression(expression, Precedence::TopLevel)?;
                }
                self.out.write(";");
            }
            StatementKind::VarDeclarations { declarations } => self.lower_var_declarations(declarations)?,
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
                self.out.write("for (");
                match initializer {
                    Some(initializer) if !initializer.is_empty() => self.lower_statement(initializer)?,
                    _ => self.out.write(";"),
                }
                self.out.write(" ");
                if let Some(test) = test {
                    self.lower_expression(test, Precedence::TopLevel)?;
                }
                self.out.write("; ");
                if let Some(next) = next {
                    self.lower_expression(next, Precedence::TopLevel)?;
                }
                self.out.write(") ");
                self.lower_statement(body)?;
            }
            StatementKind::While { test, body } => {
                self.out.write("while (");
                self.lower_expression(test, Precedence::TopLevel)?;
                self.out.write(") ");
                self.lower_statement(body)?;
            }
            StatementKind::Do { body, test } => {
                self.out.write("do ");
                self.lower_statement(body)?;
                self.out.write(" while (");
                self.lower_expression(test, Precedence::TopLevel)?;
                self.out.write(");");
            }
            StatementKind::Switch { value, cases, .. } => {
                self.out.write("switch (");
                self.lower_expression(value, Precedence::TopLevel)?;
                self.out.write_line(") {");
                self.out.indent();
                for case in cases {
                    match &case.value {
                        Some(value) => {
                            self.out.write("case ");
                            self.lower_expression(value, Precedence::TopLevel)?;
                            self.out.write_line(":");
                        }
                        None => self.out.write_line("default:"),
                    }
                    self.out.indent();
                    for statement in &case.statements {
                        if !statement.is_empty() {
                            self.lower_statement(statement)?;
                            self.out.finish_line();
                        }
                    }
                    self.out.dedent();
                }
                self.out.dedent();
                self.out.write("}");
            }
            StatementKind::Break => self.out.write("break;"),
            StatementKind::Continue => self.out.write("continue;"),
            StatementKind::Discard => self.out.write("discard_fragment();"),
            StatementKind::InlineMarker { .. } => {}
            StatementKind::Nop => self.out.write(";"),
        }
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
                    self.out.write(&(*i as i32).to_string());
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
                let field = &base.ty.fields()[*field_index];
                match field.modifiers.layout.builtin {
                    SK_POSITION_BUILTIN => self.out.write("_out.sk_Position"),
                    SK_POINTSIZE_BUILTIN => self.out.write("_out.sk_PointSize"),
                    _ => {
                        match owner {
                            FieldOwner::Default => {
                                self.lower_expression(base, Precedence::Postfix)?;
                                self.out.write(".");
                            }
                            FieldOwner::AnonymousInterfaceBlock => {
                                let block = match &base.kind {
                                    ExpressionKind::VariableReference { variable, .. } => {
                                        self.block_names.get(variable).cloned()
                                    }
                                    _ => None,
                                };
                                match block {
                                    Some(block) => self.out.write(&format!("_globals.{}->", block)),
                                    None => bail_codegen_at!(
                                        expr.offset,
                                        "unsupported expression: {}",
                                        self.program.describe_expression(expr)
                                    ),
                                }
                            }
                        }
                        self.out.write(&identifier(&field.name));
                    }
                }
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
            ExpressionKind::NullLiteral => bail_codegen_at!(expr.offset, "null is not supported in Metal"),
            ExpressionKind::ExternalFunctionCall { function, .. } => bail_codegen_at!(
                expr.offset,
                "external function '{}' cannot be called from Metal",
                self.program.externals[*function].name
            ),
            ExpressionKind::FunctionReference { .. } | ExpressionKind::TypeReference { .. } => {
                bail_codegen_at!(expr.offset, "unsupported expression: {}", self.program.describe_expression(expr))
            }
        }
        Ok(())
    }

    fn lower_binary(&mut self, left: &Expression, op: Operator, right: &Expression, parent: Precedence) -> Result<()> {
        let precedence = op.binary_precedence();
        let parens = precedence >= parent;
        if parens {
            self.out.write("(");
        }
        self.lower_expression(left, precedence)?;
        let swizzle_target = matches!(left.kind, ExpressionKind::Swizzle { .. })
            && !crate::analysis::has_side_effects(self.program, left);
        if op.is_assignment() && op != Operator::Eq && swizzle_target {
            // Metal cannot bind a reference to a vector swizzle
            let inner = op.remove_assignment();
            self.out.write(" = ");
            self.lower_expression(left, inner.binary_precedence())?;
            self.out.write(&format!(" {} ", inner.name()));
            self.lower_expression(right, inner.binary_precedence())?;
        } else {
            match op {
                Operator::Comma => self.out.write(", "),
                Operator::LogicalXor => self.out.write(" != "),
                _ => self.out.write(&format!(" {} ", op.name())),
            }
            self.lower_expression(right, precedence)?;
        }
        if parens {
            self.out.write(")");
        }
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

    fn lower_constructor(&mut self, expr: &Expression, arguments: &[Expression], parent: Precedence) -> Result<()> {
        let type_name = self.type_name(&expr.ty);
        if let [argument] = arguments {
            if (argument.ty.is_scalar() || argument.ty.is_vector()) && self.type_name(&argument.ty) == type_name {
                return self.lower_expression(argument, parent);
            }
        }
        if expr.ty.is_matrix() {
            if let Some(helper) = self.matrix_helper(&expr.ty, arguments) {
                self.out.write(&format!("{}(", helper));
                self.lower_arguments(arguments)?;
                self.out.write(")");
                return Ok(());
            }
            return self.lower_matrix_columns(&expr.ty, arguments);
        }
        if expr.ty.is_array() {
            self.out.write(&format!("{}{{", type_name));
            self.lower_arguments(arguments)?;
            self.out.write("}");
            return Ok(());
        }
        self.out.write(&format!("{}(", type_name));
        self.lower_arguments(arguments)?;
        self.out.write(")");
        Ok(())
    }

    /// Metal matrices are built from whole columns. Arguments that already
    /// line up with column boundaries are grouped inline.
    fn lower_matrix_columns(&mut self, ty: &Type, arguments: &[Expression]) -> Result<()> {
        let rows = ty.rows();
        let column_type = format!("{}{}", self.type_name(ty.component_type()), rows);
        self.out.write(&format!("{}(", self.type_name(ty)));
        let mut filled = 0;
        for (i, argument) in arguments.iter().enumerate() {
            if i > 0 {
                self.out.write(", ");
            }
            let width = argument.ty.columns();
            if filled == 0 && width < rows {
                self.out.write(&format!("{}(", column_type));
            }
            self.lower_expression(argument, Precedence::Sequence)?;
            filled += width;
            if filled == rows {
                if width < rows {
                    self.out.write(")");
                }
                filled = 0;
            }
        }
        self.out.write(")");
        Ok(())
    }

    /// A helper is needed for diagonal and resizing constructors and when an
    /// argument straddles a column boundary.
    fn matrix_helper(&mut self, ty: &Type, arguments: &[Expression]) -> Option<String> {
        let rows = ty.rows();
        let needed = match arguments {
            [single] if single.ty.is_scalar() => true,
            [single] if single.ty.is_matrix() => single.ty.columns() != ty.columns() || single.ty.rows() != rows,
            _ => {
                let mut position = 0;
                let mut straddles = false;
                for argument in arguments {
                    if argument.ty.is_matrix() {
                        straddles = true;
                        break;
                    }
                    position += argument.ty.columns();
                    if position > rows {
                        straddles = true;
                        break;
                    }
                    if position == rows {
                        position = 0;
                    }
                }
                straddles
            }
        };
        if !needed {
            return None;
        }
        let type_name = self.type_name(ty);
        let arg_types: Vec<String> = arguments.iter().map(|a| self.type_name(&a.ty)).collect();
        let name = format!("{}_from_{}", type_name, arg_types.join("_"));
        let column_type = format!("{}{}", self.type_name(ty.component_type()), rows);
        let columns = ty.columns();
        let helper_name = name.clone();
        self.helpers.add(&name, || {
            let params: Vec<String> = arg_types.iter().enumerate().map(|(i, t)| format!("{} x{}", t, i)).collect();
            let mut scalars = Vec::new();
            match arguments {
                [single] if single.ty.is_scalar() => {
                    for c in 0..columns {
                        for r in 0..rows {
                            scalars.push(if c == r { "x0".to_string() } else { "0".to_string() });
                        }
                    }
                }
                [single] if single.ty.is_matrix() => {
                    for c in 0..columns {
                        for r in 0..rows {
                            scalars.push(if c < single.ty.columns() && r < single.ty.rows() {
                                format!("x0[{}][{}]", c, r)
                            } else if c == r {
                                "1".to_string()
                            } else {
                                "0".to_string()
                            });
                        }
                    }
                }
                _ => {
                    for (i, argument) in arguments.iter().enumerate() {
                        match &argument.ty.kind {
                            TypeKind::Vector { columns, .. } => {
                                for c in 0..*columns {
                                    scalars.push(format!("x{}.{}", i, ['x', 'y', 'z', 'w'][c]));
                                }
                            }
                            TypeKind::Matrix { columns, rows, .. } => {
                                for c in 0..*columns {
                                    for r in 0..*rows {
                                        scalars.push(format!("x{}[{}][{}]", i, c, r));
                                    }
                                }
                            }
                            _ => scalars.push(format!("x{}", i)),
                        }
                    }
                }
            }
            let column_text: Vec<String> =
                scalars.chunks(rows).map(|chunk| format!("{}({})", column_type, chunk.join(", "))).collect();
            format!(
                "{} {}({}) {{\n    return {}({});\n}}\n",
                type_name,
                helper_name,
                params.join(", "),
                type_name,
                column_text.join(", ")
            )
        });
        Some(name)
    }

    fn lower_variable_reference(&mut self, offset: Offset, variable: VarId) -> Result<()> {
        let var = self.program.variable(variable);
        match var.modifiers.layout.builtin {
            SK_FRAGCOLOR_BUILTIN => self.out.write("_out.sk_FragColor"),
            SK_FRAGCOORD_BUILTIN => {
                if self.rt_flip {
                    let flip = self.rt_flip_name();
                    self.out.write(&format!(
                        "float4(_fragCoord.x, {0}.x + {0}.y * _fragCoord.y, 0.0, _fragCoord.w)",
                        flip
                    ));
                } else {
                    self.out.write("float4(_fragCoord.x, _fragCoord.y, 0.0, _fragCoord.w)");
                }
            }
            SK_CLOCKWISE_BUILTIN => {
                if self.rt_flip {
                    let flip = self.rt_flip_name();
                    self.out.write(&format!("({}.y < 0 ? _frontFacing : !_frontFacing)", flip));
                } else {
                    self.out.write("_frontFacing");
                }
            }
            SK_VERTEXID_BUILTIN => self.out.write("sk_VertexID"),
            SK_INSTANCEID_BUILTIN => self.out.write("sk_InstanceID"),
            SK_WIDTH_BUILTIN | SK_HEIGHT_BUILTIN => self.out.write(&format!("_uniforms.{}", var.name)),
            -1 => {
                let name = identifier(&var.name);
                match var.storage {
                    Storage::Global => match classify(var) {
                        GlobalClass::Input => self.out.write(&format!("_in.{}", name)),
                        GlobalClass::Output => self.out.write(&format!("_out.{}", name)),
                        GlobalClass::Uniform => self.out.write(&format!("_uniforms.{}", name)),
                        GlobalClass::Texture | GlobalClass::Global => self.out.write(&format!("_globals.{}", name)),
                        GlobalClass::Constant | GlobalClass::Builtin => self.out.write(&name),
                    },
                    Storage::InterfaceBlock => match self.block_names.get(&variable) {
                        Some(block) => self.out.write(&format!("(*_globals.{})", block)),
                        None => self.out.write(&name),
                    },
                    Storage::Parameter if var.modifiers.has(Modifiers::OUT) => {
                        self.out.write(&format!("(*{})", name))
                    }
                    Storage::Parameter | Storage::Local => self.out.write(&name),
                }
            }
            _ => bail_codegen_at!(offset, "'{}' is not supported in Metal", var.name),
        }
        Ok(())
    }

    // --- calls ---

    fn lower_call(&mut self, offset: Offset, function: FuncId, arguments: &[Expression]) -> Result<()> {
        let declaration = self.program.function(function);
        if !declaration.builtin {
            let requirements = self.requirements(function);
            self.out.write(&format!("{}(", identifier(&declaration.name)));
            let mut implicit = Vec::new();
            for (flag, arg) in [
                (INPUTS, "_in"),
                (OUTPUTS, "_out"),
                (UNIFORMS, "_uniforms"),
                (GLOBALS, "_globals"),
                (FRAG_COORD, "_fragCoord"),
                (FRONT_FACING, "_frontFacing"),
                (VERTEX_ID, "sk_VertexID"),
                (INSTANCE_ID, "sk_InstanceID"),
            ] {
                if requirements & flag != 0 {
                    implicit.push(arg);
                }
            }
            self.out.write(&implicit.join(", "));
            for (i, argument) in arguments.iter().enumerate() {
                if i > 0 || !implicit.is_empty() {
                    self.out.write(", ");
                }
                let param = self.program.variable(declaration.parameters[i]);
                if param.modifiers.has(Modifiers::OUT) {
                    self.out.write("&");
                    self.lower_expression(argument, Precedence::Prefix)?;
                } else {
                    self.lower_expression(argument, Precedence::Sequence)?;
                }
            }
            self.out.write(")");
            return Ok(());
        }

        let name = declaration.name.as_str();
        let comparison = match name {
            "lessThan" => Some("<"),
            "lessThanEqual" => Some("<="),
            "greaterThan" => Some(">"),
            "greaterThanEqual" => Some(">="),
            "equal" => Some("=="),
            "notEqual" => Some("!="),
            _ => None,
        };
        if let Some(op) = comparison {
            self.out.write("(");
            self.lower_expression(&arguments[0], Precedence::Relational)?;
            self.out.write(&format!(" {} ", op));
            self.lower_expression(&arguments[1], Precedence::Relational)?;
            self.out.write(")");
            return Ok(());
        }
        match name {
            "atan" if arguments.len() == 2 => return self.lower_plain_call("atan2", arguments),
            "inversesqrt" => return self.lower_plain_call("rsqrt", arguments),
            "dFdx" => return self.lower_plain_call("dfdx", arguments),
            "dFdy" => {
                if self.rt_flip {
                    // flipping Y also negates Y derivatives
                    let flip = self.rt_flip_name();
                    self.out.write(&format!("({}.y * ", flip));
                    self.lower_plain_call("dfdy", arguments)?;
                    self.out.write(")");
                    return Ok(());
                }
                return self.lower_plain_call("dfdy", arguments);
            }
            "not" => {
                self.out.write("!");
                return self.lower_expression(&arguments[0], Precedence::Prefix);
            }
            "mod" => {
                let x = self.type_name(&arguments[0].ty);
                let y = self.type_name(&arguments[1].ty);
                let key = format!("mod_{}_{}", x, y);
                self.helpers.add(&key, || {
                    format!("{0} mod({0} x, {1} y) {{\n    return x - y * floor(x / y);\n}}\n", x, y)
                });
                return self.lower_plain_call("mod", arguments);
            }
            "inverse" => {
                let (helper, text) = match arguments[0].ty.columns() {
                    2 => ("float2x2_inverse", INVERSE2),
                    3 => ("float3x3_inverse", INVERSE3),
                    _ => ("float4x4_inverse", INVERSE4),
                };
                self.helpers.add(helper, || text.to_string());
                return self.lower_plain_call(helper, arguments);
            }
            "matrixCompMult" => {
                let ty = self.type_name(&arguments[0].ty);
                let columns = arguments[0].ty.columns();
                self.helpers.add(&format!("matrixCompMult_{}", ty), || {
                    format!(
                        "{0} matrixCompMult({0} a, const {0} b) {{\n    \
                         for (int c = 0; c < {1}; ++c) {{\n        a[c] *= b[c];\n    }}\n    return a;\n}}\n",
                        ty, columns
                    )
                });
                return self.lower_plain_call("matrixCompMult", arguments);
            }
            "sample" => return self.lower_sample(offset, arguments),
            "EmitVertex" | "EndPrimitive" => bail_codegen_at!(offset, "'{}' is not supported in Metal", name),
            _ => {}
        }
        self.lower_plain_call(name, arguments)
    }

    fn lower_plain_call(&mut self, name: &str, arguments: &[Expression]) -> Result<()> {
        self.out.write(name);
        self.out.write("(");
        self.lower_arguments(arguments)?;
        self.out.write(")");
        Ok(())
    }

    fn lower_sample(&mut self, offset: Offset, arguments: &[Expression]) -> Result<()> {
        let sampler = match &arguments[0].kind {
            ExpressionKind::VariableReference { variable, .. } => self.program.variable(*variable),
            _ => bail_codegen_at!(offset, "Metal can only sample a global sampler"),
        };
        match &sampler.ty.kind {
            TypeKind::Sampler { texture } => match &texture.kind {
                TypeKind::Texture { dim: SamplerDim::D2, .. } => {}
                _ => bail_codegen_at!(offset, "unsupported texture dimensions"),
            },
            _ => bail_codegen_at!(offset, "'{}' cannot be sampled in Metal", sampler.ty),
        }
        let name = format!("_globals.{}", identifier(&sampler.name));
        self.out.write(&format!("{}.sample({}{}, ", name, name, SAMPLER_SUFFIX));
        let coords = &arguments[1];
        if coords.ty.columns() == 3 {
            // projective lookup
            self.lower_expression(coords, Precedence::Postfix)?;
            self.out.write(".xy / ");
            self.lower_expression(coords, Precedence::Postfix)?;
            self.out.write(".z");
        } else {
            self.lower_expression(coords, Precedence::Sequence)?;
        }
        if let Some(bias) = arguments.get(2) {
            self.out.write(", bias(");
            self.lower_expression(bias, Precedence::Sequence)?;
            self.out.write(")");
        } else if self.settings.sharpen_textures {
            self.out.write(", bias(-0.5)");
        }
        self.out.write(")");
        Ok(())
    }
}
