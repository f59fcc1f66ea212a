//! SPIR-V Lowering
//!
//! This module converts the IR directly to a SPIR-V module with `rspirv`.
//! It uses a Constructor wrapper that hoists function-local variables into
//! the entry block, caches types and constants, and tracks whether the
//! current block is still open. Globals are created before any function is
//! lowered so that they land in the module's global section.

/// Early return with a SPIR-V error
macro_rules! bail_spirv {
    ($($arg:tt)*) => {
        return Err(CompilerError::SpirvError(format!($($arg)*), None))
    };
}

macro_rules! bail_spirv_at {
    ($offset:expr, $($arg:tt)*) => {
        return Err(CompilerError::SpirvError(format!($($arg)*), Some($offset)))
    };
}

use crate::builtins::*;
use crate::error::{CompilerError, Offset, Result};
use crate::glsl::RTFLIP_NAME;
use crate::ir::*;
use crate::lowering_common::is_unreferenced_global;
use crate::memory_layout::{LayoutStandard, MemoryLayout};
use crate::modifiers::{Layout, Modifiers, Primitive};
use crate::settings::ProgramKind;
use crate::types::{Field, NumberKind, SamplerDim, Type, TypeKind, TypeRef};
use crate::visitor::{walk_expression, walk_program, ProgramVisitor};
use log::{debug, trace};
use rspirv::binary::Assemble;
use rspirv::dr::{Builder, Operand};
use rspirv::spirv::{
    self, AddressingModel, BuiltIn, Capability, Decoration, ExecutionMode, ExecutionModel, GLOp, MemoryModel,
    StorageClass, Word,
};
use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;

/// Name of the synthesized block holding loose uniforms.
const UNIFORM_BUFFER_NAME: &str = "_UniformBuffer";
const RTFLIP_STRUCT: &str = "sksl_synthetic_uniforms";

/// Lower a program to a SPIR-V binary.
pub fn lower(program: &Program) -> Result<Vec<u32>> {
    let model = match program.kind {
        ProgramKind::Vertex => ExecutionModel::Vertex,
        ProgramKind::Fragment => ExecutionModel::Fragment,
        ProgramKind::Geometry => ExecutionModel::Geometry,
        ProgramKind::Pipeline => bail_spirv!("pipeline programs can only be lowered to the VM"),
    };
    LowerCtx::new(program).run(model)
}

/// Constructor wraps rspirv::Builder with an ergonomic API that handles:
/// - Automatic variable hoisting to function entry block
/// - Block management with implicit branch from variables block to code
/// - Value and type caching
struct Constructor {
    builder: Builder,

    void_type: Word,
    bool_type: Word,
    i32_type: Word,
    u32_type: Word,
    f32_type: Word,
    glsl_ext_inst_id: Word,

    int_const_cache: HashMap<i32, Word>,
    uint_const_cache: HashMap<u32, Word>,
    float_const_cache: HashMap<u32, Word>, // bits as u32
    bool_const_cache: HashMap<bool, Word>,
    composite_const_cache: HashMap<(Word, Vec<Word>), Word>,
    ptr_type_cache: HashMap<(StorageClass, Word), Word>,
    capabilities: HashSet<Capability>,

    // Current function state
    current_block: Option<Word>,
    variables_block: Option<Word>,
    first_code_block: Option<Word>,
}

impl Constructor {
    fn new() -> Self {
        let mut builder = Builder::new();
        builder.set_version(1, 0);
        builder.capability(Capability::Shader);
        builder.memory_model(AddressingModel::Logical, MemoryModel::GLSL450);

        let void_type = builder.type_void();
        let bool_type = builder.type_bool();
        let i32_type = builder.type_int(32, 1);
        let u32_type = builder.type_int(32, 0);
        let f32_type = builder.type_float(32);
        let glsl_ext_inst_id = builder.ext_inst_import("GLSL.std.450");

        let mut capabilities = HashSet::new();
        capabilities.insert(Capability::Shader);

        Constructor {
            builder,
            void_type,
            bool_type,
            i32_type,
            u32_type,
            f32_type,
            glsl_ext_inst_id,
            int_const_cache: HashMap::new(),
            uint_const_cache: HashMap::new(),
            float_const_cache: HashMap::new(),
            bool_const_cache: HashMap::new(),
            composite_const_cache: HashMap::new(),
            ptr_type_cache: HashMap::new(),
            capabilities,
            current_block: None,
            variables_block: None,
            first_code_block: None,
        }
    }

    fn require_capability(&mut self, capability: Capability) {
        if self.capabilities.insert(capability) {
            self.builder.capability(capability);
        }
    }

    fn ptr_type(&mut self, storage: StorageClass, pointee: Word) -> Word {
        if let Some(&id) = self.ptr_type_cache.get(&(storage, pointee)) {
            return id;
        }
        let id = self.builder.type_pointer(None, storage, pointee);
        self.ptr_type_cache.insert((storage, pointee), id);
        id
    }

    /// Begin a function whose id was allocated up front. Returns the
    /// parameter ids.
    fn begin_function(&mut self, id: Word, return_type: Word, param_types: &[Word]) -> Result<Vec<Word>> {
        let func_type = self.builder.type_function(return_type, param_types.to_vec());
        self.builder.begin_function(return_type, Some(id), spirv::FunctionControl::NONE, func_type)?;

        let mut params = Vec::with_capacity(param_types.len());
        for &ty in param_types {
            params.push(self.builder.function_parameter(ty)?);
        }

        // Create two blocks: one for variables, one for code
        let vars_block_id = self.builder.id();
        let code_block_id = self.builder.id();
        self.variables_block = Some(vars_block_id);
        self.first_code_block = Some(code_block_id);

        // Begin variables block (leave it open - no terminator yet)
        self.builder.begin_block(Some(vars_block_id))?;
        self.builder.select_block(None)?;

        self.builder.begin_block(Some(code_block_id))?;
        self.current_block = Some(code_block_id);

        Ok(params)
    }

    fn variables_block_index(&self) -> Result<Option<usize>> {
        let Some(vars_block) = self.variables_block else {
            bail_spirv!("no function is being lowered");
        };
        let Some(func) = self.builder.module_ref().functions.last() else {
            bail_spirv!("no function is being lowered");
        };
        Ok(func.blocks.iter().position(|b| b.label.as_ref().map(|l| l.result_id) == Some(Some(vars_block))))
    }

    /// End the current function, closing a block left open by falling off
    /// the end of its body.
    fn end_function(&mut self, returns_void: bool) -> Result<()> {
        if self.is_open() {
            if returns_void {
                self.ret()?;
            } else {
                self.unreachable()?;
            }
        }

        // Terminate the variables block with a branch to the code block
        if let Some(code_block) = self.first_code_block {
            if let Some(idx) = self.variables_block_index()? {
                self.builder.select_block(Some(idx))?;
                self.builder.branch(code_block)?;
            }
        }

        self.builder.end_function()?;

        self.current_block = None;
        self.variables_block = None;
        self.first_code_block = None;
        Ok(())
    }

    /// Declare a variable in the function's variables block
    fn declare_variable(&mut self, value_type: Word) -> Result<Word> {
        let ptr_type = self.ptr_type(StorageClass::Function, value_type);

        let current_idx = self.builder.selected_block();
        let Some(vars_idx) = self.variables_block_index()? else {
            bail_spirv!("variables block not found");
        };
        self.builder.select_block(Some(vars_idx))?;
        let var_id = self.builder.variable(ptr_type, None, StorageClass::Function, None);
        self.builder.select_block(current_idx)?;

        Ok(var_id)
    }

    fn const_i32(&mut self, value: i32) -> Word {
        if let Some(&id) = self.int_const_cache.get(&value) {
            return id;
        }
        let id = self.builder.constant_bit32(self.i32_type, value as u32);
        self.int_const_cache.insert(value, id);
        id
    }

    fn const_u32(&mut self, value: u32) -> Word {
        if let Some(&id) = self.uint_const_cache.get(&value) {
            return id;
        }
        let id = self.builder.constant_bit32(self.u32_type, value);
        self.uint_const_cache.insert(value, id);
        id
    }

    fn const_f32(&mut self, value: f32) -> Word {
        let bits = value.to_bits();
        if let Some(&id) = self.float_const_cache.get(&bits) {
            return id;
        }
        let id = self.builder.constant_bit32(self.f32_type, bits);
        self.float_const_cache.insert(bits, id);
        id
    }

    fn const_bool(&mut self, value: bool) -> Word {
        if let Some(&id) = self.bool_const_cache.get(&value) {
            return id;
        }
        let id = if value {
            self.builder.constant_true(self.bool_type)
        } else {
            self.builder.constant_false(self.bool_type)
        };
        self.bool_const_cache.insert(value, id);
        id
    }

    fn const_composite(&mut self, ty: Word, constituents: Vec<Word>) -> Word {
        let key = (ty, constituents);
        if let Some(&id) = self.composite_const_cache.get(&key) {
            return id;
        }
        let id = self.builder.constant_composite(ty, key.1.iter().copied());
        self.composite_const_cache.insert(key, id);
        id
    }

    fn is_open(&self) -> bool {
        self.current_block.is_some()
    }

    fn current_block(&self) -> Result<Word> {
        match self.current_block {
            Some(block) => Ok(block),
            None => bail_spirv!("instruction emitted outside of a block"),
        }
    }

    /// Begin a block (must be called before emitting instructions into it)
    fn begin_block(&mut self, block_id: Word) -> Result<()> {
        self.builder.begin_block(Some(block_id))?;
        self.current_block = Some(block_id);
        Ok(())
    }

    fn branch(&mut self, target: Word) -> Result<()> {
        self.builder.branch(target)?;
        self.current_block = None;
        Ok(())
    }

    fn branch_conditional(&mut self, cond: Word, true_block: Word, false_block: Word) -> Result<()> {
        self.builder.branch_conditional(cond, true_block, false_block, [])?;
        self.current_block = None;
        Ok(())
    }

    /// Emit a conditional branch with selection merge
    fn selection(&mut self, cond: Word, true_block: Word, false_block: Word, merge_block: Word) -> Result<()> {
        self.builder.selection_merge(merge_block, spirv::SelectionControl::NONE)?;
        self.branch_conditional(cond, true_block, false_block)
    }

    fn ret(&mut self) -> Result<()> {
        self.builder.ret()?;
        self.current_block = None;
        Ok(())
    }

    fn ret_value(&mut self, value: Word) -> Result<()> {
        self.builder.ret_value(value)?;
        self.current_block = None;
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        self.builder.kill()?;
        self.current_block = None;
        Ok(())
    }

    fn unreachable(&mut self) -> Result<()> {
        self.builder.unreachable()?;
        self.current_block = None;
        Ok(())
    }
}

/// Where a variable's storage lives.
#[derive(Debug, Clone, Copy)]
struct VarSlot {
    pointer: Word,
    storage: StorageClass,
    layout: Option<LayoutStandard>,
}

/// An assignable location.
#[derive(Debug, Clone)]
enum LValue {
    Pointer { pointer: Word, ty: TypeRef, storage: StorageClass, layout: Option<LayoutStandard> },
    /// Components of a vector reached through `base`.
    Swizzle { base: Box<LValue>, vector: TypeRef, components: Vec<i8> },
}

/// Globals referenced anywhere in the program, and whether anything reads
/// the render-target flip.
struct GlobalFinder<'a> {
    program: &'a Program,
    globals: Vec<VarId>,
    seen: HashSet<VarId>,
    uses_flip: bool,
}

impl ProgramVisitor for GlobalFinder<'_> {
    type Break = ();

    fn visit_expression(&mut self, expression: &Expression) -> ControlFlow<()> {
        match &expression.kind {
            ExpressionKind::VariableReference { variable, .. } => {
                let var = self.program.variable(*variable);
                if matches!(var.storage, Storage::Global | Storage::InterfaceBlock) && self.seen.insert(*variable) {
                    self.globals.push(*variable);
                }
                if matches!(var.modifiers.layout.builtin, SK_FRAGCOORD_BUILTIN | SK_CLOCKWISE_BUILTIN) {
                    self.uses_flip = true;
                }
            }
            ExpressionKind::FunctionCall { function, .. } => {
                let declaration = self.program.function(*function);
                if declaration.builtin && declaration.name == "dFdy" {
                    self.uses_flip = true;
                }
            }
            _ => {}
        }
        walk_expression(self, expression)
    }
}

fn is_loose_uniform(var: &Variable) -> bool {
    var.storage == Storage::Global && var.modifiers.has(Modifiers::UNIFORM) && !var.ty.is_opaque()
}

fn spirv_builtin(builtin: i32) -> Option<BuiltIn> {
    Some(match builtin {
        SK_POSITION_BUILTIN => BuiltIn::Position,
        SK_POINTSIZE_BUILTIN => BuiltIn::PointSize,
        SK_CLIPDISTANCE_BUILTIN => BuiltIn::ClipDistance,
        SK_INVOCATIONID_BUILTIN => BuiltIn::InvocationId,
        SK_FRAGCOORD_BUILTIN => BuiltIn::FragCoord,
        SK_CLOCKWISE_BUILTIN => BuiltIn::FrontFacing,
        SK_SAMPLEMASKIN_BUILTIN | SK_SAMPLEMASK_BUILTIN => BuiltIn::SampleMask,
        SK_VERTEXID_BUILTIN => BuiltIn::VertexIndex,
        SK_INSTANCEID_BUILTIN => BuiltIn::InstanceIndex,
        _ => return None,
    })
}

/// Storage class implied by a built-in variable's number.
fn builtin_storage(builtin: i32) -> Option<StorageClass> {
    match builtin {
        SK_FRAGCOORD_BUILTIN
        | SK_CLOCKWISE_BUILTIN
        | SK_SAMPLEMASKIN_BUILTIN
        | SK_VERTEXID_BUILTIN
        | SK_INSTANCEID_BUILTIN
        | SK_INVOCATIONID_BUILTIN
        | SK_IN_BUILTIN => Some(StorageClass::Input),
        SK_FRAGCOLOR_BUILTIN | SK_SAMPLEMASK_BUILTIN => Some(StorageClass::Output),
        _ => None,
    }
}

fn vertices_per_primitive(primitive: Primitive) -> usize {
    match primitive {
        Primitive::Points => 1,
        Primitive::Lines | Primitive::LineStrip => 2,
        Primitive::LinesAdjacency => 4,
        Primitive::Triangles | Primitive::TriangleStrip => 3,
        Primitive::TrianglesAdjacency => 6,
    }
}

/// Context for lowering the IR to SPIR-V
struct LowerCtx<'a> {
    program: &'a Program,
    constructor: Constructor,
    rt_flip: bool,
    /// Named types, keyed by name and buffer layout.
    type_cache: HashMap<(String, Option<LayoutStandard>), Word>,
    named_types: HashSet<Word>,
    laid_out_types: HashSet<Word>,
    blocks: HashSet<Word>,
    variables: HashMap<VarId, VarSlot>,
    functions: HashMap<FuncId, Word>,
    interface: Vec<Word>,
    /// Loose uniforms gathered into one block: variable, member index and type.
    uniform_buffer: Option<Word>,
    uniform_members: HashMap<VarId, (u32, TypeRef)>,
    rt_flip_block: Option<Word>,
    input_primitive: Option<Primitive>,
    output_primitive: Option<Primitive>,
    max_vertices: i32,
    invocations: i32,
    break_targets: Vec<Word>,
    continue_targets: Vec<Word>,
}

impl<'a> LowerCtx<'a> {
    fn new(program: &'a Program) -> Self {
        LowerCtx {
            program,
            constructor: Constructor::new(),
            rt_flip: program.settings.flip_y && program.inputs.rt_flip,
            type_cache: HashMap::new(),
            named_types: HashSet::new(),
            laid_out_types: HashSet::new(),
            blocks: HashSet::new(),
            variables: HashMap::new(),
            functions: HashMap::new(),
            interface: Vec::new(),
            uniform_buffer: None,
            uniform_members: HashMap::new(),
            rt_flip_block: None,
            input_primitive: None,
            output_primitive: None,
            max_vertices: -1,
            invocations: -1,
            break_targets: Vec::new(),
            continue_targets: Vec::new(),
        }
    }

    fn run(mut self, model: ExecutionModel) -> Result<Vec<u32>> {
        let program = self.program;
        debug!("Lowering {} elements to SPIR-V ({:?})", program.elements.len(), model);
        if model == ExecutionModel::Geometry {
            self.constructor.require_capability(Capability::Geometry);
        }
        self.collect_layout_modifiers();
        self.declare_globals()?;

        // Allocate function ids up front so calls may precede definitions
        for def in program.function_definitions() {
            let id = self.constructor.builder.id();
            self.functions.insert(def.declaration, id);
        }
        for element in &program.elements {
            if let ProgramElement::Function(def) = element {
                self.lower_function(def)?;
            }
        }

        let Some(main) = program.main() else {
            bail_spirv!("program has no main function");
        };
        let main_id = self.function_id(main.declaration, main.offset)?;
        self.constructor.builder.entry_point(model, main_id, "main", self.interface.clone());
        match model {
            ExecutionModel::Fragment => {
                self.constructor.builder.execution_mode(main_id, ExecutionMode::OriginUpperLeft, []);
            }
            ExecutionModel::Geometry => self.geometry_execution_modes(main_id)?,
            _ => {}
        }
        Ok(self.constructor.builder.module().assemble())
    }

    fn collect_layout_modifiers(&mut self) {
        for element in &self.program.elements {
            if let ProgramElement::Modifiers { modifiers, .. } = element {
                let layout = &modifiers.layout;
                if modifiers.has(Modifiers::IN) {
                    if layout.primitive.is_some() {
                        self.input_primitive = layout.primitive;
                    }
                    if layout.invocations > 0 {
                        self.invocations = layout.invocations;
                    }
                } else if modifiers.has(Modifiers::OUT) {
                    if layout.primitive.is_some() {
                        self.output_primitive = layout.primitive;
                    }
                    if layout.max_vertices >= 0 {
                        self.max_vertices = layout.max_vertices;
                    }
                }
            }
        }
    }

    fn geometry_execution_modes(&mut self, main_id: Word) -> Result<()> {
        let input = match self.input_primitive {
            Some(Primitive::Points) => ExecutionMode::InputPoints,
            Some(Primitive::Lines) => ExecutionMode::InputLines,
            Some(Primitive::LinesAdjacency) => ExecutionMode::InputLinesAdjacency,
            Some(Primitive::Triangles) => ExecutionMode::Triangles,
            Some(Primitive::TrianglesAdjacency) => ExecutionMode::InputTrianglesAdjacency,
            _ => bail_spirv!("geometry shaders require an input primitive layout"),
        };
        let output = match self.output_primitive {
            Some(Primitive::Points) => ExecutionMode::OutputPoints,
            Some(Primitive::LineStrip) => ExecutionMode::OutputLineStrip,
            Some(Primitive::TriangleStrip) => ExecutionMode::OutputTriangleStrip,
            _ => bail_spirv!("geometry shaders require an output primitive layout"),
        };
        if self.max_vertices < 0 {
            bail_spirv!("geometry shaders require 'max_vertices'");
        }
        let builder = &mut self.constructor.builder;
        builder.execution_mode(main_id, input, []);
        builder.execution_mode(main_id, ExecutionMode::Invocations, [self.invocations.max(1) as u32]);
        builder.execution_mode(main_id, output, []);
        builder.execution_mode(main_id, ExecutionMode::OutputVertices, [self.max_vertices as u32]);
        Ok(())
    }

    fn function_id(&self, function: FuncId, offset: Offset) -> Result<Word> {
        match self.functions.get(&function) {
            Some(&id) => Ok(id),
            None => bail_spirv_at!(
                offset,
                "function '{}' is declared but never defined",
                self.program.function(function).name
            ),
        }
    }

    // ---------------------------------------------------------------------
    // Types
    // ---------------------------------------------------------------------

    fn get_type(&mut self, ty: &Type, layout: Option<LayoutStandard>) -> Result<Word> {
        let key = (ty.name.clone(), layout);
        if let Some(&id) = self.type_cache.get(&key) {
            return Ok(id);
        }
        let id = match &ty.kind {
            TypeKind::Scalar { number_kind, .. } => match number_kind {
                NumberKind::Float => self.constructor.f32_type,
                NumberKind::Signed => self.constructor.i32_type,
                NumberKind::Unsigned => self.constructor.u32_type,
                NumberKind::Boolean => self.constructor.bool_type,
                NumberKind::NonNumeric => bail_spirv!("type '{}' cannot be represented in SPIR-V", ty),
            },
            TypeKind::Enum => self.constructor.i32_type,
            TypeKind::Vector { component, columns } => {
                let component = self.get_type(component, layout)?;
                self.constructor.builder.type_vector(component, *columns as u32)
            }
            TypeKind::Matrix { component, columns, rows } => {
                let component = self.get_type(component, layout)?;
                let column = self.constructor.builder.type_vector(component, *rows as u32);
                self.constructor.builder.type_matrix(column, *columns as u32)
            }
            TypeKind::Array { component, count } => {
                let element = self.get_type(component, layout)?;
                let id = match count {
                    Some(n) => {
                        let length = self.constructor.const_i32(*n as i32);
                        self.constructor.builder.type_array(element, length)
                    }
                    None => self.constructor.builder.type_runtime_array(element),
                };
                if let Some(standard) = layout {
                    if self.laid_out_types.insert(id) {
                        let Some(stride) = MemoryLayout::new(standard).array_stride(component) else {
                            bail_spirv!("type '{}' cannot be placed in a buffer", ty);
                        };
                        self.constructor.builder.decorate(
                            id,
                            Decoration::ArrayStride,
                            [Operand::LiteralBit32(stride as u32)],
                        );
                    }
                }
                id
            }
            TypeKind::Struct { fields } => {
                let mut members = Vec::with_capacity(fields.len());
                for field in fields {
                    members.push(self.get_type(&field.ty, layout)?);
                }
                let id = self.constructor.builder.type_struct(members);
                if self.named_types.insert(id) {
                    self.constructor.builder.name(id, ty.name.clone());
                    for (i, field) in fields.iter().enumerate() {
                        self.constructor.builder.member_name(id, i as u32, field.name.clone());
                        if let Some(builtin) = spirv_builtin(field.modifiers.layout.builtin) {
                            self.constructor.builder.member_decorate(
                                id,
                                i as u32,
                                Decoration::BuiltIn,
                                [Operand::BuiltIn(builtin)],
                            );
                        }
                    }
                }
                if let Some(standard) = layout {
                    if self.laid_out_types.insert(id) {
                        self.decorate_members(id, ty, standard)?;
                    }
                }
                id
            }
            TypeKind::Texture { dim, depth, arrayed, multisampled, sampled } => {
                let dim = match dim {
                    SamplerDim::D1 => {
                        self.constructor.require_capability(Capability::Sampled1D);
                        spirv::Dim::Dim1D
                    }
                    SamplerDim::D2 | SamplerDim::External => spirv::Dim::Dim2D,
                    SamplerDim::D3 => spirv::Dim::Dim3D,
                    SamplerDim::Cube => spirv::Dim::DimCube,
                    SamplerDim::Rect => {
                        self.constructor.require_capability(Capability::SampledRect);
                        spirv::Dim::DimRect
                    }
                    SamplerDim::Buffer => {
                        self.constructor.require_capability(Capability::SampledBuffer);
                        spirv::Dim::DimBuffer
                    }
                    SamplerDim::SubpassData => {
                        self.constructor.require_capability(Capability::InputAttachment);
                        spirv::Dim::DimSubpassData
                    }
                };
                let f32_type = self.constructor.f32_type;
                self.constructor.builder.type_image(
                    f32_type,
                    dim,
                    *depth as u32,
                    *arrayed as u32,
                    *multisampled as u32,
                    if *sampled { 1 } else { 2 },
                    spirv::ImageFormat::Unknown,
                    None,
                )
            }
            TypeKind::Sampler { texture } => {
                let image = self.get_type(texture, None)?;
                self.constructor.builder.type_sampled_image(image)
            }
            TypeKind::SeparateSampler => self.constructor.builder.type_sampler(),
            TypeKind::Void => self.constructor.void_type,
            _ => bail_spirv!("type '{}' cannot be represented in SPIR-V", ty),
        };
        self.type_cache.insert(key, id);
        Ok(id)
    }

    fn decorate_members(&mut self, id: Word, ty: &Type, standard: LayoutStandard) -> Result<()> {
        let layout = MemoryLayout::new(standard);
        let Some(offsets) = layout.field_offsets(ty) else {
            bail_spirv!("type '{}' cannot be placed in a buffer", ty);
        };
        for (i, (field, natural)) in ty.fields().iter().zip(offsets).enumerate() {
            let offset = if field.modifiers.layout.offset >= 0 { field.modifiers.layout.offset as usize } else { natural };
            let builder = &mut self.constructor.builder;
            builder.member_decorate(id, i as u32, Decoration::Offset, [Operand::LiteralBit32(offset as u32)]);
            let matrix = match &field.ty.kind {
                TypeKind::Matrix { .. } => Some(&field.ty),
                TypeKind::Array { component, .. } if component.is_matrix() => Some(component),
                _ => None,
            };
            if let Some(stride) = matrix.and_then(|matrix| layout.stride(matrix)) {
                builder.member_decorate(id, i as u32, Decoration::ColMajor, []);
                builder.member_decorate(id, i as u32, Decoration::MatrixStride, [Operand::LiteralBit32(stride as u32)]);
            }
        }
        Ok(())
    }

    fn decorate_block(&mut self, struct_id: Word, buffer: bool) {
        if self.blocks.insert(struct_id) {
            let decoration = if buffer { Decoration::BufferBlock } else { Decoration::Block };
            self.constructor.builder.decorate(struct_id, decoration, []);
        }
    }

    // ---------------------------------------------------------------------
    // Globals
    // ---------------------------------------------------------------------

    /// Create every global the program references, plus the synthesized
    /// uniform and flip blocks.
    fn declare_globals(&mut self) -> Result<()> {
        let program = self.program;
        let mut finder = GlobalFinder { program, globals: Vec::new(), seen: HashSet::new(), uses_flip: false };
        let _ = walk_program(&mut finder, program);

        let mut globals = Vec::new();
        for element in &program.elements {
            match element {
                ProgramElement::GlobalVar(decls) => {
                    for decl in &decls.vars {
                        if !is_unreferenced_global(program, decl.var) {
                            globals.push(decl.var);
                        }
                    }
                }
                ProgramElement::InterfaceBlock(block) => globals.push(block.variable),
                _ => {}
            }
        }
        for var in finder.globals {
            if !globals.contains(&var) {
                globals.push(var);
            }
        }

        let loose: Vec<VarId> = globals.iter().copied().filter(|v| is_loose_uniform(program.variable(*v))).collect();
        self.declare_uniform_buffer(&loose)?;
        for var in globals {
            if !self.uniform_members.contains_key(&var) {
                self.declare_global(var)?;
            }
        }
        if self.rt_flip && finder.uses_flip {
            self.declare_rt_flip()?;
        }
        Ok(())
    }

    fn declare_uniform_buffer(&mut self, members: &[VarId]) -> Result<()> {
        if members.is_empty() {
            return Ok(());
        }
        let program = self.program;
        let mut set = None;
        let mut fields = Vec::with_capacity(members.len());
        for (i, &id) in members.iter().enumerate() {
            let var = program.variable(id);
            let var_set = var.modifiers.layout.set.max(0);
            match set {
                Some(existing) if existing != var_set => bail_spirv_at!(
                    var.offset,
                    "all uniforms must share one layout(set=...), found {} and {}",
                    existing,
                    var_set
                ),
                _ => set = Some(var_set),
            }
            fields.push(Field { modifiers: var.modifiers.clone(), name: var.name.clone(), ty: var.ty.clone() });
            self.uniform_members.insert(id, (i as u32, var.ty.clone()));
        }
        let block_type = Type::new_struct(UNIFORM_BUFFER_NAME, fields);
        let struct_id = self.get_type(&block_type, Some(LayoutStandard::Std140))?;
        self.decorate_block(struct_id, false);
        let pointer_type = self.constructor.ptr_type(StorageClass::Uniform, struct_id);
        let buffer = self.constructor.builder.variable(pointer_type, None, StorageClass::Uniform, None);
        let builder = &mut self.constructor.builder;
        builder.decorate(buffer, Decoration::Binding, [Operand::LiteralBit32(0)]);
        builder.decorate(buffer, Decoration::DescriptorSet, [Operand::LiteralBit32(set.unwrap_or(0) as u32)]);
        self.uniform_buffer = Some(buffer);
        debug!("Gathered {} loose uniforms into {}", members.len(), UNIFORM_BUFFER_NAME);
        Ok(())
    }

    fn declare_rt_flip(&mut self) -> Result<()> {
        let vec2 = self.program.context.float_vector(2);
        let vec2 = self.get_type(&vec2, None)?;
        let builder = &mut self.constructor.builder;
        let struct_id = builder.type_struct([vec2]);
        builder.name(struct_id, RTFLIP_STRUCT);
        builder.member_name(struct_id, 0, RTFLIP_NAME);
        builder.member_decorate(struct_id, 0, Decoration::Offset, [Operand::LiteralBit32(0)]);
        self.decorate_block(struct_id, false);
        let pointer_type = self.constructor.ptr_type(StorageClass::PushConstant, struct_id);
        let block = self.constructor.builder.variable(pointer_type, None, StorageClass::PushConstant, None);
        self.rt_flip_block = Some(block);
        Ok(())
    }

    fn declare_global(&mut self, id: VarId) -> Result<()> {
        let program = self.program;
        let var = program.variable(id);
        let modifiers = &var.modifiers;
        let builtin = modifiers.layout.builtin;
        if builtin == SK_LASTFRAGCOLOR_BUILTIN {
            bail_spirv_at!(var.offset, "sk_LastFragColor is not supported in SPIR-V");
        }
        let storage = if let Some(storage) = builtin_storage(builtin) {
            storage
        } else if modifiers.has(Modifiers::IN) {
            StorageClass::Input
        } else if modifiers.has(Modifiers::OUT) {
            StorageClass::Output
        } else if modifiers.has(Modifiers::UNIFORM) || modifiers.has(Modifiers::BUFFER) {
            if var.ty.is_opaque() {
                StorageClass::UniformConstant
            } else if modifiers.layout.flags & Layout::PUSH_CONSTANT != 0 {
                StorageClass::PushConstant
            } else {
                StorageClass::Uniform
            }
        } else {
            StorageClass::Private
        };
        let layout = match storage {
            StorageClass::Uniform if modifiers.has(Modifiers::BUFFER) || modifiers.layout.flags & Layout::STD430 != 0 => {
                Some(LayoutStandard::Std430)
            }
            StorageClass::Uniform => Some(LayoutStandard::Std140),
            StorageClass::PushConstant => Some(LayoutStandard::Std430),
            _ => None,
        };

        let mut ty = var.ty.clone();
        if storage == StorageClass::Input && program.kind == ProgramKind::Geometry && ty.is_array() && ty.array_count().is_none() {
            let Some(primitive) = self.input_primitive else {
                bail_spirv_at!(var.offset, "geometry inputs require an input primitive layout");
            };
            ty = Type::new_array(&ty.component_ref(), Some(vertices_per_primitive(primitive)));
        }
        let type_id = self.get_type(&ty, layout)?;
        if var.storage == Storage::InterfaceBlock {
            let struct_id = if ty.is_array() { self.get_type(ty.component_type(), layout)? } else { type_id };
            self.decorate_block(struct_id, modifiers.has(Modifiers::BUFFER));
        }

        let pointer_type = self.constructor.ptr_type(storage, type_id);
        let pointer = self.constructor.builder.variable(pointer_type, None, storage, None);
        if !var.name.is_empty() {
            self.constructor.builder.name(pointer, var.name.clone());
        }
        self.decorate_variable(pointer, modifiers);
        if matches!(storage, StorageClass::Input | StorageClass::Output) {
            self.interface.push(pointer);
        }
        trace!("Declared global '{}' as %{} ({:?})", var.name, pointer, storage);
        self.variables.insert(id, VarSlot { pointer, storage, layout });
        Ok(())
    }

    fn decorate_variable(&mut self, pointer: Word, modifiers: &Modifiers) {
        let layout = &modifiers.layout;
        let builder = &mut self.constructor.builder;
        if layout.location >= 0 {
            builder.decorate(pointer, Decoration::Location, [Operand::LiteralBit32(layout.location as u32)]);
        }
        if layout.index >= 0 {
            builder.decorate(pointer, Decoration::Index, [Operand::LiteralBit32(layout.index as u32)]);
        }
        if layout.binding >= 0 {
            builder.decorate(pointer, Decoration::Binding, [Operand::LiteralBit32(layout.binding as u32)]);
            builder.decorate(pointer, Decoration::DescriptorSet, [Operand::LiteralBit32(layout.set.max(0) as u32)]);
        }
        if layout.input_attachment_index >= 0 {
            builder.decorate(
                pointer,
                Decoration::InputAttachmentIndex,
                [Operand::LiteralBit32(layout.input_attachment_index as u32)],
            );
        }
        if modifiers.has(Modifiers::FLAT) {
            builder.decorate(pointer, Decoration::Flat, []);
        }
        if modifiers.has(Modifiers::NO_PERSPECTIVE) {
            builder.decorate(pointer, Decoration::NoPerspective, []);
        }
        if let Some(builtin) = spirv_builtin(layout.builtin) {
            builder.decorate(pointer, Decoration::BuiltIn, [Operand::BuiltIn(builtin)]);
            match builtin {
                BuiltIn::SampleMask => self.constructor.require_capability(Capability::SampleRateShading),
                BuiltIn::ClipDistance => self.constructor.require_capability(Capability::ClipDistance),
                _ => {}
            }
        }
    }

    fn variable_slot(&mut self, id: VarId, offset: Offset) -> Result<VarSlot> {
        if let Some(&slot) = self.variables.get(&id) {
            return Ok(slot);
        }
        if let (Some(buffer), Some((index, ty))) = (self.uniform_buffer, self.uniform_members.get(&id).cloned()) {
            let member_type = self.get_type(&ty, Some(LayoutStandard::Std140))?;
            let pointer_type = self.constructor.ptr_type(StorageClass::Uniform, member_type);
            let index = self.constructor.const_i32(index as i32);
            let pointer = self.constructor.builder.access_chain(pointer_type, None, buffer, [index])?;
            return Ok(VarSlot { pointer, storage: StorageClass::Uniform, layout: Some(LayoutStandard::Std140) });
        }
        bail_spirv_at!(offset, "variable '{}' has no storage", self.program.variable(id).name)
    }

    /// The `u_skRTFlip` vector.
    fn rt_flip_value(&mut self) -> Result<Word> {
        let Some(block) = self.rt_flip_block else {
            bail_spirv!("render target flip requested but never declared");
        };
        let vec2 = self.program.context.float_vector(2);
        let vec2 = self.get_type(&vec2, None)?;
        let pointer_type = self.constructor.ptr_type(StorageClass::PushConstant, vec2);
        let zero = self.constructor.const_i32(0);
        let pointer = self.constructor.builder.access_chain(pointer_type, None, block, [zero])?;
        Ok(self.constructor.builder.load(vec2, None, pointer, None, [])?)
    }

    // ---------------------------------------------------------------------
    // Functions and statements
    // ---------------------------------------------------------------------

    fn lower_function(&mut self, def: &FunctionDefinition) -> Result<()> {
        let program = self.program;
        let declaration = program.function(def.declaration);
        trace!("Lowering function '{}'", declaration.name);
        let id = self.function_id(def.declaration, def.offset)?;
        let return_type = self.get_type(&declaration.return_type, None)?;

        let mut param_types = Vec::with_capacity(declaration.parameters.len());
        let mut storages = Vec::with_capacity(declaration.parameters.len());
        for &param in &declaration.parameters {
            let var = program.variable(param);
            let storage = if var.ty.is_opaque() { StorageClass::UniformConstant } else { StorageClass::Function };
            let ty = self.get_type(&var.ty, None)?;
            param_types.push(self.constructor.ptr_type(storage, ty));
            storages.push(storage);
        }

        let params = self.constructor.begin_function(id, return_type, &param_types)?;
        self.constructor.builder.name(id, declaration.name.clone());
        for ((&param, pointer), storage) in declaration.parameters.iter().zip(params).zip(storages) {
            self.constructor.builder.name(pointer, program.variable(param).name.clone());
            self.variables.insert(param, VarSlot { pointer, storage, layout: None });
        }
        if declaration.name == "main" {
            self.initialize_globals()?;
        }
        self.lower_statement(&def.body)?;
        self.constructor.end_function(declaration.return_type.is_void())
    }

    /// Private globals with initializers are assigned on entry to `main`.
    fn initialize_globals(&mut self) -> Result<()> {
        let program = self.program;
        for element in &program.elements {
            let ProgramElement::GlobalVar(decls) = element else { continue };
            for decl in &decls.vars {
                let (Some(value), Some(slot)) = (&decl.value, self.variables.get(&decl.var).copied()) else {
                    continue;
                };
                if slot.storage != StorageClass::Private {
                    continue;
                }
                let value = self.lower_expression(value)?;
                self.constructor.builder.store(slot.pointer, value, None, [])?;
            }
        }
        Ok(())
    }

    fn lower_statement(&mut self, statement: &Statement) -> Result<()> {
        if !self.constructor.is_open() {
            // Unreachable code after a terminator
            return Ok(());
        }
        match &statement.kind {
            StatementKind::Block { statements, .. } => {
                for statement in statements {
                    self.lower_statement(statement)?;
                }
                Ok(())
            }
            StatementKind::Expression { expression } => {
                self.lower_expression(expression)?;
                Ok(())
            }
            StatementKind::VarDeclarations { declarations } => {
                for decl in &declarations.vars {
                    let var = self.program.variable(decl.var);
                    let ty = self.get_type(&var.ty, None)?;
                    let pointer = self.constructor.declare_variable(ty)?;
                    self.constructor.builder.name(pointer, var.name.clone());
                    self.variables.insert(decl.var, VarSlot { pointer, storage: StorageClass::Function, layout: None });
                    if let Some(value) = &decl.value {
                        let value = self.lower_expression(value)?;
                        self.constructor.builder.store(pointer, value, None, [])?;
                    }
                }
                Ok(())
            }
            StatementKind::If { test, if_true, if_false, .. } => {
                let cond = self.lower_expression(test)?;
                let true_block = self.constructor.builder.id();
                let merge_block = self.constructor.builder.id();
                let false_block = if if_false.is_some() { self.constructor.builder.id() } else { merge_block };
                self.constructor.selection(cond, true_block, false_block, merge_block)?;

                self.constructor.begin_block(true_block)?;
                self.lower_statement(if_true)?;
                if self.constructor.is_open() {
                    self.constructor.branch(merge_block)?;
                }
                if let Some(if_false) = if_false {
                    self.constructor.begin_block(false_block)?;
                    self.lower_statement(if_false)?;
                    if self.constructor.is_open() {
                        self.constructor.branch(merge_block)?;
                    }
                }
                self.constructor.begin_block(merge_block)
            }
            StatementKind::For { initializer, test, next, body, .. } => {
                if let Some(initializer) = initializer {
                    self.lower_statement(initializer)?;
                }
                self.lower_loop(test.as_ref(), next.as_ref(), body)
            }
            StatementKind::While { test, body } => self.lower_loop(Some(test), None, body),
            StatementKind::Do { body, test } => {
                let header = self.constructor.builder.id();
                let body_block = self.constructor.builder.id();
                let continue_block = self.constructor.builder.id();
                let merge_block = self.constructor.builder.id();

                self.constructor.branch(header)?;
                self.constructor.begin_block(header)?;
                self.constructor.builder.loop_merge(merge_block, continue_block, spirv::LoopControl::NONE, [])?;
                self.constructor.branch(body_block)?;

                self.constructor.begin_block(body_block)?;
                self.break_targets.push(merge_block);
                self.continue_targets.push(continue_block);
                let result = self.lower_statement(body);
                self.break_targets.pop();
                self.continue_targets.pop();
                result?;
                if self.constructor.is_open() {
                    self.constructor.branch(continue_block)?;
                }

                self.constructor.begin_block(continue_block)?;
                let cond = self.lower_expression(test)?;
                self.constructor.branch_conditional(cond, header, merge_block)?;
                self.constructor.begin_block(merge_block)
            }
            StatementKind::Switch { value, cases, .. } => self.lower_switch(value, cases),
            StatementKind::Return { expression } => match expression {
                Some(expression) => {
                    let value = self.lower_expression(expression)?;
                    self.constructor.ret_value(value)
                }
                None => self.constructor.ret(),
            },
            StatementKind::Break => match self.break_targets.last() {
                Some(&target) => self.constructor.branch(target),
                None => bail_spirv_at!(statement.offset, "'break' outside of a loop or switch"),
            },
            StatementKind::Continue => match self.continue_targets.last() {
                Some(&target) => self.constructor.branch(target),
                None => bail_spirv_at!(statement.offset, "'continue' outside of a loop"),
            },
            StatementKind::Discard => self.constructor.kill(),
            StatementKind::InlineMarker { .. } | StatementKind::Nop => Ok(()),
        }
    }

    /// header -> start (test) -> body -> continue (next) -> header
    fn lower_loop(&mut self, test: Option<&Expression>, next: Option<&Expression>, body: &Statement) -> Result<()> {
        let header = self.constructor.builder.id();
        let start = self.constructor.builder.id();
        let body_block = self.constructor.builder.id();
        let continue_block = self.constructor.builder.id();
        let merge_block = self.constructor.builder.id();

        self.constructor.branch(header)?;
        self.constructor.begin_block(header)?;
        self.constructor.builder.loop_merge(merge_block, continue_block, spirv::LoopControl::NONE, [])?;
        self.constructor.branch(start)?;

        self.constructor.begin_block(start)?;
        match test {
            Some(test) => {
                let cond = self.lower_expression(test)?;
                self.constructor.branch_conditional(cond, body_block, merge_block)?;
            }
            None => self.constructor.branch(body_block)?,
        }

        self.constructor.begin_block(body_block)?;
        self.break_targets.push(merge_block);
        self.continue_targets.push(continue_block);
        let result = self.lower_statement(body);
        self.break_targets.pop();
        self.continue_targets.pop();
        result?;
        if self.constructor.is_open() {
            self.constructor.branch(continue_block)?;
        }

        self.constructor.begin_block(continue_block)?;
        if let Some(next) = next {
            self.lower_expression(next)?;
        }
        self.constructor.branch(header)?;
        self.constructor.begin_block(merge_block)
    }

    fn lower_switch(&mut self, value: &Expression, cases: &[SwitchCase]) -> Result<()> {
        let selector = self.lower_expression(value)?;
        let merge_block = self.constructor.builder.id();
        let blocks: Vec<Word> = cases.iter().map(|_| self.constructor.builder.id()).collect();

        let mut default = merge_block;
        let mut targets = Vec::with_capacity(cases.len());
        for (case, &block) in cases.iter().zip(&blocks) {
            match &case.value {
                Some(label) => match label.as_int() {
                    Some(n) => targets.push((Operand::LiteralBit32(n as u32), block)),
                    None => bail_spirv_at!(case.offset, "switch case labels must be integer constants"),
                },
                None => default = block,
            }
        }
        self.constructor.builder.selection_merge(merge_block, spirv::SelectionControl::NONE)?;
        self.constructor.builder.switch(selector, default, targets)?;
        self.constructor.current_block = None;

        self.break_targets.push(merge_block);
        for (i, case) in cases.iter().enumerate() {
            self.constructor.begin_block(blocks[i])?;
            for statement in &case.statements {
                self.lower_statement(statement)?;
            }
            if self.constructor.is_open() {
                // fall through
                let next = blocks.get(i + 1).copied().unwrap_or(merge_block);
                self.constructor.branch(next)?;
            }
        }
        self.break_targets.pop();
        self.constructor.begin_block(merge_block)
    }

    // ---------------------------------------------------------------------
    // Expressions
    // ---------------------------------------------------------------------

    fn lower_expression(&mut self, expr: &Expression) -> Result<Word> {
        match &expr.kind {
            ExpressionKind::BoolLiteral(value) => Ok(self.constructor.const_bool(*value)),
            ExpressionKind::IntLiteral(value) => {
                if expr.ty.is_unsigned() {
                    Ok(self.constructor.const_u32(*value as u32))
                } else {
                    Ok(self.constructor.const_i32(*value as i32))
                }
            }
            ExpressionKind::FloatLiteral(value) => Ok(self.constructor.const_f32(*value as f32)),
            ExpressionKind::Setting { value, .. } => self.lower_expression(value),
            ExpressionKind::Binary { left, op, right } => self.lower_binary(expr, left, *op, right),
            ExpressionKind::Prefix { op, operand } => self.lower_prefix(expr, *op, operand),
            ExpressionKind::Postfix { operand, op } => {
                let lvalue = self.lvalue(operand)?;
                let old = self.load(&lvalue)?;
                let one = self.constant_like(&operand.ty, 1.0)?;
                let op = if *op == Operator::PlusPlus { Operator::Plus } else { Operator::Minus };
                let new = self.arithmetic(op, &operand.ty, old, &operand.ty, one, &operand.ty)?;
                self.store(&lvalue, new)?;
                Ok(old)
            }
            ExpressionKind::Ternary { test, if_true, if_false } => {
                let cond = self.lower_expression(test)?;
                let true_block = self.constructor.builder.id();
                let false_block = self.constructor.builder.id();
                let merge_block = self.constructor.builder.id();
                self.constructor.selection(cond, true_block, false_block, merge_block)?;

                self.constructor.begin_block(true_block)?;
                let true_value = self.lower_expression(if_true)?;
                let true_end = self.constructor.current_block()?;
                self.constructor.branch(merge_block)?;

                self.constructor.begin_block(false_block)?;
                let false_value = self.lower_expression(if_false)?;
                let false_end = self.constructor.current_block()?;
                self.constructor.branch(merge_block)?;

                self.constructor.begin_block(merge_block)?;
                let ty = self.get_type(&expr.ty, None)?;
                Ok(self.constructor.builder.phi(ty, None, [(true_value, true_end), (false_value, false_end)])?)
            }
            ExpressionKind::Constructor { arguments } => self.lower_constructor(&expr.ty, arguments),
            ExpressionKind::FunctionCall { function, arguments } => self.lower_call(expr, *function, arguments),
            ExpressionKind::FieldAccess { base, field_index, .. } => {
                if self.is_addressable(expr) {
                    let lvalue = self.lvalue(expr)?;
                    return self.load(&lvalue);
                }
                let base = self.lower_expression(base)?;
                let ty = self.get_type(&expr.ty, None)?;
                Ok(self.constructor.builder.composite_extract(ty, None, base, [*field_index as u32])?)
            }
            ExpressionKind::Index { base, index } => self.lower_index(expr, base, index),
            ExpressionKind::Swizzle { base, components } => {
                let value = self.lower_expression(base)?;
                self.swizzle_value(&base.ty, value, components, &expr.ty)
            }
            ExpressionKind::VariableReference { variable, .. } => self.lower_variable_reference(expr, *variable),
            ExpressionKind::NullLiteral
            | ExpressionKind::ExternalFunctionCall { .. }
            | ExpressionKind::FunctionReference { .. }
            | ExpressionKind::TypeReference { .. } => bail_spirv_at!(
                expr.offset,
                "'{}' cannot be lowered to SPIR-V",
                self.program.describe_expression(expr)
            ),
        }
    }

    fn lower_variable_reference(&mut self, expr: &Expression, id: VarId) -> Result<Word> {
        let builtin = self.program.variable(id).modifiers.layout.builtin;
        if self.rt_flip && builtin == SK_FRAGCOORD_BUILTIN {
            return self.flipped_frag_coord(expr, id);
        }
        if self.rt_flip && builtin == SK_CLOCKWISE_BUILTIN {
            // Facing flips along with the Y axis
            let slot = self.variable_slot(id, expr.offset)?;
            let bool_type = self.constructor.bool_type;
            let front_facing = self.constructor.builder.load(bool_type, None, slot.pointer, None, [])?;
            let flip = self.rt_flip_value()?;
            let f32_type = self.constructor.f32_type;
            let flip_y = self.constructor.builder.composite_extract(f32_type, None, flip, [1])?;
            let zero = self.constructor.const_f32(0.0);
            let flipped = self.constructor.builder.f_ord_less_than(bool_type, None, flip_y, zero)?;
            let negated = self.constructor.builder.logical_not(bool_type, None, front_facing)?;
            return Ok(self.constructor.builder.select(bool_type, None, flipped, negated, front_facing)?);
        }
        let lvalue = self.lvalue(expr)?;
        self.load(&lvalue)
    }

    /// `float4(x, flip.x + flip.y * y, z, w)`
    fn flipped_frag_coord(&mut self, expr: &Expression, id: VarId) -> Result<Word> {
        let slot = self.variable_slot(id, expr.offset)?;
        let vec4 = self.get_type(&expr.ty, None)?;
        let f32_type = self.constructor.f32_type;
        let coord = self.constructor.builder.load(vec4, None, slot.pointer, None, [])?;
        let flip = self.rt_flip_value()?;
        let builder = &mut self.constructor.builder;
        let flip_x = builder.composite_extract(f32_type, None, flip, [0])?;
        let flip_y = builder.composite_extract(f32_type, None, flip, [1])?;
        let y = builder.composite_extract(f32_type, None, coord, [1])?;
        let scaled = builder.f_mul(f32_type, None, flip_y, y)?;
        let flipped = builder.f_add(f32_type, None, flip_x, scaled)?;
        Ok(builder.composite_insert(vec4, None, flipped, coord, [1])?)
    }

    fn is_addressable(&self, expr: &Expression) -> bool {
        match &expr.kind {
            ExpressionKind::VariableReference { variable, .. } => {
                let builtin = self.program.variable(*variable).modifiers.layout.builtin;
                !(self.rt_flip && matches!(builtin, SK_FRAGCOORD_BUILTIN | SK_CLOCKWISE_BUILTIN))
            }
            ExpressionKind::FieldAccess { base, .. } | ExpressionKind::Index { base, .. } => self.is_addressable(base),
            _ => false,
        }
    }

    fn lvalue(&mut self, expr: &Expression) -> Result<LValue> {
        match &expr.kind {
            ExpressionKind::VariableReference { variable, .. } => {
                let slot = self.variable_slot(*variable, expr.offset)?;
                Ok(LValue::Pointer { pointer: slot.pointer, ty: expr.ty.clone(), storage: slot.storage, layout: slot.layout })
            }
            ExpressionKind::FieldAccess { base, field_index, .. } => {
                let base = self.lvalue(base)?;
                let index = self.constructor.const_i32(*field_index as i32);
                self.chain(base, index, &expr.ty, expr.offset)
            }
            ExpressionKind::Index { base, index } => {
                let base = self.lvalue(base)?;
                let index = self.lower_expression(index)?;
                self.chain(base, index, &expr.ty, expr.offset)
            }
            ExpressionKind::Swizzle { base, components } => {
                let vector = base.ty.clone();
                let base = self.lvalue(base)?;
                Ok(LValue::Swizzle { base: Box::new(base), vector, components: components.clone() })
            }
            ExpressionKind::Ternary { test, if_true, if_false } => {
                // Both arms are addressed, then merged with a phi of pointers
                let cond = self.lower_expression(test)?;
                let true_block = self.constructor.builder.id();
                let false_block = self.constructor.builder.id();
                let merge_block = self.constructor.builder.id();
                self.constructor.selection(cond, true_block, false_block, merge_block)?;

                self.constructor.begin_block(true_block)?;
                let true_lvalue = self.lvalue(if_true)?;
                let (true_pointer, storage, layout) = self.pointer_parts(&true_lvalue, if_true.offset)?;
                let true_end = self.constructor.current_block()?;
                self.constructor.branch(merge_block)?;

                self.constructor.begin_block(false_block)?;
                let false_lvalue = self.lvalue(if_false)?;
                let (false_pointer, false_storage, _) = self.pointer_parts(&false_lvalue, if_false.offset)?;
                let false_end = self.constructor.current_block()?;
                self.constructor.branch(merge_block)?;
                if storage != false_storage {
                    bail_spirv_at!(expr.offset, "both arms of an assigned ternary must share a storage class");
                }

                self.constructor.begin_block(merge_block)?;
                let pointee = self.get_type(&expr.ty, layout)?;
                let pointer_type = self.constructor.ptr_type(storage, pointee);
                let pointer = self.constructor.builder.phi(
                    pointer_type,
                    None,
                    [(true_pointer, true_end), (false_pointer, false_end)],
                )?;
                Ok(LValue::Pointer { pointer, ty: expr.ty.clone(), storage, layout })
            }
            _ => bail_spirv_at!(
                expr.offset,
                "'{}' cannot be assigned to",
                self.program.describe_expression(expr)
            ),
        }
    }

    fn pointer_parts(
        &self,
        lvalue: &LValue,
        offset: Offset,
    ) -> Result<(Word, StorageClass, Option<LayoutStandard>)> {
        match lvalue {
            LValue::Pointer { pointer, storage, layout, .. } => Ok((*pointer, *storage, *layout)),
            LValue::Swizzle { .. } => bail_spirv_at!(offset, "a swizzle cannot be an arm of an assigned ternary"),
        }
    }

    fn chain(&mut self, base: LValue, index: Word, ty: &TypeRef, offset: Offset) -> Result<LValue> {
        match base {
            LValue::Pointer { pointer, storage, layout, .. } => {
                let element = self.get_type(ty, layout)?;
                let pointer_type = self.constructor.ptr_type(storage, element);
                let pointer = self.constructor.builder.access_chain(pointer_type, None, pointer, [index])?;
                Ok(LValue::Pointer { pointer, ty: ty.clone(), storage, layout })
            }
            LValue::Swizzle { .. } => bail_spirv_at!(offset, "a swizzle cannot be indexed"),
        }
    }

    fn load(&mut self, lvalue: &LValue) -> Result<Word> {
        match lvalue {
            LValue::Pointer { pointer, ty, layout, .. } => {
                let ty = self.get_type(ty, *layout)?;
                Ok(self.constructor.builder.load(ty, None, *pointer, None, [])?)
            }
            LValue::Swizzle { base, vector, components } => {
                let value = self.load(base)?;
                let result = self.swizzle_type(vector, components.len())?;
                self.swizzle_value(vector, value, components, &result)
            }
        }
    }

    fn store(&mut self, lvalue: &LValue, value: Word) -> Result<()> {
        match lvalue {
            LValue::Pointer { pointer, .. } => {
                self.constructor.builder.store(*pointer, value, None, [])?;
                Ok(())
            }
            LValue::Swizzle { base, vector, components } => {
                let old = self.load(base)?;
                let vector_type = self.get_type(vector, None)?;
                let new = if components.len() == 1 {
                    self.constructor.builder.composite_insert(vector_type, None, value, old, [components[0] as u32])?
                } else {
                    let indices: Vec<u32> = (0..vector.columns() as i8)
                        .map(|i| match components.iter().position(|c| *c == i) {
                            Some(position) => vector.columns() as u32 + position as u32,
                            None => i as u32,
                        })
                        .collect();
                    self.constructor.builder.vector_shuffle(vector_type, None, old, value, indices)?
                };
                self.store(base, new)
            }
        }
    }

    fn swizzle_type(&self, vector: &Type, width: usize) -> Result<TypeRef> {
        match self.program.context.compound(vector.component_type(), width, 1) {
            Some(ty) => Ok(ty),
            None => bail_spirv!("no {}-component vector of '{}'", width, vector.component_type()),
        }
    }

    /// Components are indices into the base, or -1 for zero and -2 for one.
    fn swizzle_value(&mut self, base_ty: &Type, value: Word, components: &[i8], result_ty: &Type) -> Result<Word> {
        let result = self.get_type(result_ty, None)?;
        let scalar = base_ty.component_type();
        let scalar_type = self.get_type(scalar, None)?;
        if components.iter().all(|c| *c >= 0) {
            if !base_ty.is_vector() {
                if components.len() == 1 {
                    return Ok(value);
                }
                return Ok(self.constructor.builder.composite_construct(result, None, vec![value; components.len()])?);
            }
            if components.len() == 1 {
                return Ok(self.constructor.builder.composite_extract(result, None, value, [components[0] as u32])?);
            }
            let indices: Vec<u32> = components.iter().map(|c| *c as u32).collect();
            return Ok(self.constructor.builder.vector_shuffle(result, None, value, value, indices)?);
        }
        let mut parts = Vec::with_capacity(components.len());
        for &c in components {
            let part = match c {
                c if c >= 0 && base_ty.is_vector() => {
                    self.constructor.builder.composite_extract(scalar_type, None, value, [c as u32])?
                }
                c if c >= 0 => value,
                -1 => self.scalar_constant(scalar.number_kind(), 0.0),
                _ => self.scalar_constant(scalar.number_kind(), 1.0),
            };
            parts.push(part);
        }
        Ok(self.constructor.builder.composite_construct(result, None, parts)?)
    }

    fn lower_index(&mut self, expr: &Expression, base: &Expression, index: &Expression) -> Result<Word> {
        if self.is_addressable(expr) {
            let lvalue = self.lvalue(expr)?;
            return self.load(&lvalue);
        }
        let ty = self.get_type(&expr.ty, None)?;
        let base_value = self.lower_expression(base)?;
        if base.ty.is_vector() {
            let index = self.lower_expression(index)?;
            return Ok(self.constructor.builder.vector_extract_dynamic(ty, None, base_value, index)?);
        }
        if let Some(n) = index.as_int() {
            return Ok(self.constructor.builder.composite_extract(ty, None, base_value, [n as u32])?);
        }
        // Dynamic index into a temporary aggregate
        let base_type = self.get_type(&base.ty, None)?;
        let temp = self.constructor.declare_variable(base_type)?;
        self.constructor.builder.store(temp, base_value, None, [])?;
        let index = self.lower_expression(index)?;
        let pointer_type = self.constructor.ptr_type(StorageClass::Function, ty);
        let pointer = self.constructor.builder.access_chain(pointer_type, None, temp, [index])?;
        Ok(self.constructor.builder.load(ty, None, pointer, None, [])?)
    }

    fn scalar_constant(&mut self, kind: NumberKind, value: f64) -> Word {
        match kind {
            NumberKind::Signed => self.constructor.const_i32(value as i32),
            NumberKind::Unsigned => self.constructor.const_u32(value as u32),
            NumberKind::Boolean => self.constructor.const_bool(value != 0.0),
            NumberKind::Float | NumberKind::NonNumeric => self.constructor.const_f32(value as f32),
        }
    }

    /// A constant of a scalar or vector type with every component `value`.
    fn constant_like(&mut self, ty: &Type, value: f64) -> Result<Word> {
        let scalar = self.scalar_constant(ty.component_type().number_kind(), value);
        if !ty.is_vector() {
            return Ok(scalar);
        }
        let type_id = self.get_type(ty, None)?;
        Ok(self.constructor.const_composite(type_id, vec![scalar; ty.columns()]))
    }

    /// Replicate a scalar across a vector type.
    fn splat(&mut self, value: Word, vector: &Type) -> Result<Word> {
        let type_id = self.get_type(vector, None)?;
        Ok(self.constructor.builder.composite_construct(type_id, None, vec![value; vector.columns()])?)
    }

    fn column_type(&self, matrix: &Type) -> Result<TypeRef> {
        self.swizzle_type(matrix, matrix.rows())
    }

    fn lower_binary(&mut self, expr: &Expression, left: &Expression, op: Operator, right: &Expression) -> Result<Word> {
        match op {
            Operator::Eq => {
                let lvalue = self.lvalue(left)?;
                let value = self.lower_expression(right)?;
                self.store(&lvalue, value)?;
                Ok(value)
            }
            Operator::LogicalAnd | Operator::LogicalOr => self.lower_short_circuit(op, left, right),
            Operator::Comma => {
                self.lower_expression(left)?;
                self.lower_expression(right)
            }
            op if op.is_assignment() => {
                let lvalue = self.lvalue(left)?;
                let old = self.load(&lvalue)?;
                let value = self.lower_expression(right)?;
                let new = self.arithmetic(op.remove_assignment(), &left.ty, old, &right.ty, value, &left.ty)?;
                self.store(&lvalue, new)?;
                Ok(new)
            }
            _ => {
                let l = self.lower_expression(left)?;
                let r = self.lower_expression(right)?;
                self.arithmetic(op, &left.ty, l, &right.ty, r, &expr.ty)
            }
        }
    }

    fn lower_short_circuit(&mut self, op: Operator, left: &Expression, right: &Expression) -> Result<Word> {
        let l = self.lower_expression(left)?;
        let start = self.constructor.current_block()?;
        let rhs_block = self.constructor.builder.id();
        let merge_block = self.constructor.builder.id();
        if op == Operator::LogicalAnd {
            self.constructor.selection(l, rhs_block, merge_block, merge_block)?;
        } else {
            self.constructor.selection(l, merge_block, rhs_block, merge_block)?;
        }

        self.constructor.begin_block(rhs_block)?;
        let r = self.lower_expression(right)?;
        let rhs_end = self.constructor.current_block()?;
        self.constructor.branch(merge_block)?;

        self.constructor.begin_block(merge_block)?;
        let bool_type = self.constructor.bool_type;
        Ok(self.constructor.builder.phi(bool_type, None, [(l, start), (r, rhs_end)])?)
    }

    fn lower_prefix(&mut self, expr: &Expression, op: Operator, operand: &Expression) -> Result<Word> {
        match op {
            Operator::Plus => self.lower_expression(operand),
            Operator::Minus => {
                let value = self.lower_expression(operand)?;
                let ty = self.get_type(&expr.ty, None)?;
                if expr.ty.is_matrix() {
                    let minus_one = self.constructor.const_f32(-1.0);
                    Ok(self.constructor.builder.matrix_times_scalar(ty, None, value, minus_one)?)
                } else if expr.ty.component_type().is_float() {
                    Ok(self.constructor.builder.f_negate(ty, None, value)?)
                } else {
                    Ok(self.constructor.builder.s_negate(ty, None, value)?)
                }
            }
            Operator::LogicalNot => {
                let value = self.lower_expression(operand)?;
                let ty = self.get_type(&expr.ty, None)?;
                Ok(self.constructor.builder.logical_not(ty, None, value)?)
            }
            Operator::BitwiseNot => {
                let value = self.lower_expression(operand)?;
                let ty = self.get_type(&expr.ty, None)?;
                Ok(self.constructor.builder.not(ty, None, value)?)
            }
            Operator::PlusPlus | Operator::MinusMinus => {
                let lvalue = self.lvalue(operand)?;
                let old = self.load(&lvalue)?;
                let one = self.constant_like(&operand.ty, 1.0)?;
                let op = if op == Operator::PlusPlus { Operator::Plus } else { Operator::Minus };
                let new = self.arithmetic(op, &operand.ty, old, &operand.ty, one, &operand.ty)?;
                self.store(&lvalue, new)?;
                Ok(new)
            }
            _ => bail_spirv_at!(expr.offset, "unsupported prefix operator '{}'", op.name()),
        }
    }

    fn arithmetic(
        &mut self,
        op: Operator,
        left_ty: &Type,
        l: Word,
        right_ty: &Type,
        r: Word,
        result_ty: &Type,
    ) -> Result<Word> {
        if left_ty.is_matrix() || right_ty.is_matrix() {
            return self.matrix_arithmetic(op, left_ty, l, right_ty, r, result_ty);
        }
        if matches!(op, Operator::EqEq | Operator::Neq) {
            return self.equality(op, left_ty, l, r);
        }
        let result = self.get_type(result_ty, None)?;
        let (l, r) = if left_ty.is_vector() && right_ty.is_scalar() {
            if op == Operator::Star && left_ty.is_float() {
                return Ok(self.constructor.builder.vector_times_scalar(result, None, l, r)?);
            }
            (l, self.splat(r, left_ty)?)
        } else if left_ty.is_scalar() && right_ty.is_vector() {
            if op == Operator::Star && right_ty.is_float() {
                return Ok(self.constructor.builder.vector_times_scalar(result, None, r, l)?);
            }
            (self.splat(l, right_ty)?, r)
        } else {
            (l, r)
        };
        let operand_ty = if left_ty.is_vector() { left_ty } else { right_ty };
        let kind = operand_ty.component_type().number_kind();
        if op.is_comparison() {
            return self.comparison(op, kind, result, l, r);
        }
        let builder = &mut self.constructor.builder;
        Ok(match (op, kind) {
            (Operator::Plus, NumberKind::Float) => builder.f_add(result, None, l, r)?,
            (Operator::Plus, _) => builder.i_add(result, None, l, r)?,
            (Operator::Minus, NumberKind::Float) => builder.f_sub(result, None, l, r)?,
            (Operator::Minus, _) => builder.i_sub(result, None, l, r)?,
            (Operator::Star, NumberKind::Float) => builder.f_mul(result, None, l, r)?,
            (Operator::Star, _) => builder.i_mul(result, None, l, r)?,
            (Operator::Slash, NumberKind::Float) => builder.f_div(result, None, l, r)?,
            (Operator::Slash, NumberKind::Signed) => builder.s_div(result, None, l, r)?,
            (Operator::Slash, _) => builder.u_div(result, None, l, r)?,
            (Operator::Percent, NumberKind::Float) => builder.f_mod(result, None, l, r)?,
            (Operator::Percent, NumberKind::Signed) => builder.s_mod(result, None, l, r)?,
            (Operator::Percent, _) => builder.u_mod(result, None, l, r)?,
            (Operator::Shl, _) => builder.shift_left_logical(result, None, l, r)?,
            (Operator::Shr, NumberKind::Signed) => builder.shift_right_arithmetic(result, None, l, r)?,
            (Operator::Shr, _) => builder.shift_right_logical(result, None, l, r)?,
            (Operator::BitwiseAnd, _) => builder.bitwise_and(result, None, l, r)?,
            (Operator::BitwiseOr, _) => builder.bitwise_or(result, None, l, r)?,
            (Operator::BitwiseXor, _) => builder.bitwise_xor(result, None, l, r)?,
            (Operator::LogicalXor, _) => builder.logical_not_equal(result, None, l, r)?,
            _ => bail_spirv!("unsupported binary operator '{}' on '{}'", op.name(), left_ty),
        })
    }

    /// Component-wise comparison; `result` is a bool or bool vector type.
    fn comparison(&mut self, op: Operator, kind: NumberKind, result: Word, l: Word, r: Word) -> Result<Word> {
        let builder = &mut self.constructor.builder;
        Ok(match (op, kind) {
            (Operator::EqEq, NumberKind::Float) => builder.f_ord_equal(result, None, l, r)?,
            (Operator::EqEq, NumberKind::Boolean) => builder.logical_equal(result, None, l, r)?,
            (Operator::EqEq, _) => builder.i_equal(result, None, l, r)?,
            (Operator::Neq, NumberKind::Float) => builder.f_ord_not_equal(result, None, l, r)?,
            (Operator::Neq, NumberKind::Boolean) => builder.logical_not_equal(result, None, l, r)?,
            (Operator::Neq, _) => builder.i_not_equal(result, None, l, r)?,
            (Operator::Lt, NumberKind::Float) => builder.f_ord_less_than(result, None, l, r)?,
            (Operator::Lt, NumberKind::Signed) => builder.s_less_than(result, None, l, r)?,
            (Operator::Lt, _) => builder.u_less_than(result, None, l, r)?,
            (Operator::LtEq, NumberKind::Float) => builder.f_ord_less_than_equal(result, None, l, r)?,
            (Operator::LtEq, NumberKind::Signed) => builder.s_less_than_equal(result, None, l, r)?,
            (Operator::LtEq, _) => builder.u_less_than_equal(result, None, l, r)?,
            (Operator::Gt, NumberKind::Float) => builder.f_ord_greater_than(result, None, l, r)?,
            (Operator::Gt, NumberKind::Signed) => builder.s_greater_than(result, None, l, r)?,
            (Operator::Gt, _) => builder.u_greater_than(result, None, l, r)?,
            (Operator::GtEq, NumberKind::Float) => builder.f_ord_greater_than_equal(result, None, l, r)?,
            (Operator::GtEq, NumberKind::Signed) => builder.s_greater_than_equal(result, None, l, r)?,
            (Operator::GtEq, _) => builder.u_greater_than_equal(result, None, l, r)?,
            _ => bail_spirv!("'{}' is not a comparison", op.name()),
        })
    }

    /// `==` and `!=` over any comparable type, reduced to one bool.
    fn equality(&mut self, op: Operator, ty: &Type, l: Word, r: Word) -> Result<Word> {
        let bool_type = self.constructor.bool_type;
        match &ty.kind {
            TypeKind::Vector { component, columns } => {
                let bvec = self.program.context.bool_vector(*columns);
                let bvec = self.get_type(&bvec, None)?;
                let equal = self.comparison(op, component.number_kind(), bvec, l, r)?;
                if op == Operator::EqEq {
                    Ok(self.constructor.builder.all(bool_type, None, equal)?)
                } else {
                    Ok(self.constructor.builder.any(bool_type, None, equal)?)
                }
            }
            TypeKind::Matrix { columns, .. } => {
                let column = self.column_type(ty)?;
                let equal = self.aggregate_equality(&vec![column; *columns], l, r)?;
                self.negate_if(op, equal)
            }
            TypeKind::Array { component, count } => {
                let elements = vec![component.clone(); count.unwrap_or(0)];
                let equal = self.aggregate_equality(&elements, l, r)?;
                self.negate_if(op, equal)
            }
            TypeKind::Struct { fields } => {
                let members: Vec<TypeRef> = fields.iter().map(|f| f.ty.clone()).collect();
                let equal = self.aggregate_equality(&members, l, r)?;
                self.negate_if(op, equal)
            }
            _ => self.comparison(op, ty.number_kind(), bool_type, l, r),
        }
    }

    fn aggregate_equality(&mut self, members: &[TypeRef], l: Word, r: Word) -> Result<Word> {
        let bool_type = self.constructor.bool_type;
        let mut result = self.constructor.const_bool(true);
        for (i, member) in members.iter().enumerate() {
            let member_type = self.get_type(member, None)?;
            let lm = self.constructor.builder.composite_extract(member_type, None, l, [i as u32])?;
            let rm = self.constructor.builder.composite_extract(member_type, None, r, [i as u32])?;
            let equal = self.equality(Operator::EqEq, member, lm, rm)?;
            result = if i == 0 { equal } else { self.constructor.builder.logical_and(bool_type, None, result, equal)? };
        }
        Ok(result)
    }

    fn negate_if(&mut self, op: Operator, value: Word) -> Result<Word> {
        if op == Operator::Neq {
            let bool_type = self.constructor.bool_type;
            Ok(self.constructor.builder.logical_not(bool_type, None, value)?)
        } else {
            Ok(value)
        }
    }

    fn matrix_arithmetic(
        &mut self,
        op: Operator,
        left_ty: &Type,
        l: Word,
        right_ty: &Type,
        r: Word,
        result_ty: &Type,
    ) -> Result<Word> {
        if matches!(op, Operator::EqEq | Operator::Neq) {
            return self.equality(op, left_ty, l, r);
        }
        let result = self.get_type(result_ty, None)?;
        if op == Operator::Star {
            let builder = &mut self.constructor.builder;
            return Ok(match (left_ty.is_matrix(), right_ty.is_matrix()) {
                (true, true) => builder.matrix_times_matrix(result, None, l, r)?,
                (true, false) if right_ty.is_vector() => builder.matrix_times_vector(result, None, l, r)?,
                (true, false) => builder.matrix_times_scalar(result, None, l, r)?,
                (false, true) if left_ty.is_vector() => builder.vector_times_matrix(result, None, l, r)?,
                (false, _) => builder.matrix_times_scalar(result, None, r, l)?,
            });
        }
        // +, - and / apply column by column
        let matrix = if left_ty.is_matrix() { left_ty } else { right_ty };
        let column = self.column_type(matrix)?;
        let column_type = self.get_type(&column, None)?;
        let mut columns = Vec::with_capacity(matrix.columns());
        for i in 0..matrix.columns() as u32 {
            let lc = if left_ty.is_matrix() {
                self.constructor.builder.composite_extract(column_type, None, l, [i])?
            } else {
                self.splat(l, &column)?
            };
            let rc = if right_ty.is_matrix() {
                self.constructor.builder.composite_extract(column_type, None, r, [i])?
            } else {
                self.splat(r, &column)?
            };
            columns.push(self.arithmetic(op, &column, lc, &column, rc, &column)?);
        }
        Ok(self.constructor.builder.composite_construct(result, None, columns)?)
    }

    /// Convert between scalar or vector types of the same width.
    fn convert(&mut self, value: Word, from: &Type, to: &Type) -> Result<Word> {
        let from_kind = from.component_type().number_kind();
        let to_kind = to.component_type().number_kind();
        if from_kind == to_kind {
            return Ok(value);
        }
        let ty = self.get_type(to, None)?;
        match (from_kind, to_kind) {
            (NumberKind::Float, NumberKind::Signed) => Ok(self.constructor.builder.convert_f_to_s(ty, None, value)?),
            (NumberKind::Float, NumberKind::Unsigned) => Ok(self.constructor.builder.convert_f_to_u(ty, None, value)?),
            (NumberKind::Signed, NumberKind::Float) => Ok(self.constructor.builder.convert_s_to_f(ty, None, value)?),
            (NumberKind::Unsigned, NumberKind::Float) => Ok(self.constructor.builder.convert_u_to_f(ty, None, value)?),
            (NumberKind::Signed, NumberKind::Unsigned) | (NumberKind::Unsigned, NumberKind::Signed) => {
                Ok(self.constructor.builder.bitcast(ty, None, value)?)
            }
            (NumberKind::Boolean, _) => {
                let one = self.constant_like(to, 1.0)?;
                let zero = self.constant_like(to, 0.0)?;
                Ok(self.constructor.builder.select(ty, None, value, one, zero)?)
            }
            (_, NumberKind::Boolean) => {
                let zero = self.constant_like(from, 0.0)?;
                if from_kind == NumberKind::Float {
                    Ok(self.constructor.builder.f_ord_not_equal(ty, None, value, zero)?)
                } else {
                    Ok(self.constructor.builder.i_not_equal(ty, None, value, zero)?)
                }
            }
            _ => bail_spirv!("cannot convert '{}' to '{}'", from, to),
        }
    }

    /// Every scalar of a constructor argument, converted to `component`.
    fn flatten_argument(&mut self, arg: &Expression, component: &Type, out: &mut Vec<Word>) -> Result<()> {
        let value = self.lower_expression(arg)?;
        let from = arg.ty.component_type();
        let from_type = self.get_type(from, None)?;
        match &arg.ty.kind {
            TypeKind::Vector { columns, .. } => {
                for i in 0..*columns as u32 {
                    let scalar = self.constructor.builder.composite_extract(from_type, None, value, [i])?;
                    out.push(self.convert(scalar, from, component)?);
                }
            }
            TypeKind::Matrix { columns, rows, .. } => {
                for c in 0..*columns as u32 {
                    for r in 0..*rows as u32 {
                        let scalar = self.constructor.builder.composite_extract(from_type, None, value, [c, r])?;
                        out.push(self.convert(scalar, from, component)?);
                    }
                }
            }
            _ => out.push(self.convert(value, &arg.ty, component)?),
        }
        Ok(())
    }

    fn lower_constructor(&mut self, ty: &TypeRef, arguments: &[Expression]) -> Result<Word> {
        let type_id = self.get_type(ty, None)?;
        match &ty.kind {
            TypeKind::Scalar { .. } | TypeKind::Enum => {
                let [arg] = arguments else {
                    bail_spirv!("scalar constructors take exactly one argument");
                };
                let mut scalars = Vec::new();
                self.flatten_argument(arg, ty, &mut scalars)?;
                match scalars.first() {
                    Some(&first) => Ok(first),
                    None => bail_spirv!("empty constructor argument"),
                }
            }
            TypeKind::Vector { component, columns } => {
                if let [arg] = arguments {
                    if arg.ty.is_scalar() {
                        let value = self.lower_expression(arg)?;
                        let value = self.convert(value, &arg.ty, component)?;
                        return self.splat(value, ty);
                    }
                    if arg.ty.is_vector() && arg.ty.columns() == *columns {
                        let value = self.lower_expression(arg)?;
                        return self.convert(value, &arg.ty, ty);
                    }
                }
                let mut parts = Vec::with_capacity(*columns);
                for arg in arguments {
                    if arg.ty.is_vector() && arg.ty.component_type().number_kind() == component.number_kind() {
                        parts.push(self.lower_expression(arg)?);
                    } else {
                        self.flatten_argument(arg, component, &mut parts)?;
                    }
                }
                Ok(self.constructor.builder.composite_construct(type_id, None, parts)?)
            }
            TypeKind::Matrix { component, columns, rows } => {
                let column = self.column_type(ty)?;
                let column_type = self.get_type(&column, None)?;
                let zero = self.constructor.const_f32(0.0);
                let one = self.constructor.const_f32(1.0);
                let mut cells = Vec::with_capacity(columns * rows);
                match arguments {
                    [arg] if arg.ty.is_scalar() => {
                        let value = self.lower_expression(arg)?;
                        let value = self.convert(value, &arg.ty, component)?;
                        for c in 0..*columns {
                            for r in 0..*rows {
                                cells.push(if c == r { value } else { zero });
                            }
                        }
                    }
                    [arg] if arg.ty.is_matrix() => {
                        let value = self.lower_expression(arg)?;
                        let scalar = self.constructor.f32_type;
                        for c in 0..*columns {
                            for r in 0..*rows {
                                let cell = if c < arg.ty.columns() && r < arg.ty.rows() {
                                    self.constructor.builder.composite_extract(scalar, None, value, [c as u32, r as u32])?
                                } else if c == r {
                                    one
                                } else {
                                    zero
                                };
                                cells.push(cell);
                            }
                        }
                    }
                    _ => {
                        for arg in arguments {
                            self.flatten_argument(arg, component, &mut cells)?;
                        }
                    }
                }
                if cells.len() != columns * rows {
                    bail_spirv!("wrong number of components in '{}' constructor", ty);
                }
                let mut column_ids = Vec::with_capacity(*columns);
                for chunk in cells.chunks(*rows) {
                    column_ids.push(self.constructor.builder.composite_construct(column_type, None, chunk.to_vec())?);
                }
                Ok(self.constructor.builder.composite_construct(type_id, None, column_ids)?)
            }
            TypeKind::Array { .. } | TypeKind::Struct { .. } => {
                let mut parts = Vec::with_capacity(arguments.len());
                for arg in arguments {
                    parts.push(self.lower_expression(arg)?);
                }
                Ok(self.constructor.builder.composite_construct(type_id, None, parts)?)
            }
            _ => bail_spirv!("cannot construct '{}'", ty),
        }
    }

    fn lower_call(&mut self, expr: &Expression, function: FuncId, arguments: &[Expression]) -> Result<Word> {
        let program = self.program;
        let declaration = program.function(function);
        if declaration.builtin {
            return self.lower_intrinsic(expr, &declaration.name, arguments);
        }
        let function_id = self.function_id(function, expr.offset)?;
        let mut args = Vec::with_capacity(arguments.len());
        let mut copy_back = Vec::new();
        for (arg, &param) in arguments.iter().zip(&declaration.parameters) {
            let param = program.variable(param);
            if param.ty.is_opaque() {
                let ExpressionKind::VariableReference { variable, .. } = &arg.kind else {
                    bail_spirv_at!(arg.offset, "opaque arguments must be variables");
                };
                args.push(self.variable_slot(*variable, arg.offset)?.pointer);
                continue;
            }
            let param_type = self.get_type(&param.ty, None)?;
            let temp = self.constructor.declare_variable(param_type)?;
            if param.modifiers.has(Modifiers::OUT) {
                let lvalue = self.lvalue(arg)?;
                if param.modifiers.has(Modifiers::IN) {
                    let value = self.load(&lvalue)?;
                    self.constructor.builder.store(temp, value, None, [])?;
                }
                copy_back.push((lvalue, temp, param_type));
            } else {
                let value = self.lower_expression(arg)?;
                self.constructor.builder.store(temp, value, None, [])?;
            }
            args.push(temp);
        }
        let return_type = self.get_type(&expr.ty, None)?;
        let result = self.constructor.builder.function_call(return_type, None, function_id, args)?;
        for (lvalue, temp, ty) in copy_back {
            let value = self.constructor.builder.load(ty, None, temp, None, [])?;
            self.store(&lvalue, value)?;
        }
        Ok(result)
    }

    fn ext_inst(&mut self, result: Word, op: GLOp, operands: &[Word]) -> Result<Word> {
        let set = self.constructor.glsl_ext_inst_id;
        let operands: Vec<Operand> = operands.iter().map(|id| Operand::IdRef(*id)).collect();
        Ok(self.constructor.builder.ext_inst(result, None, set, op as u32, operands)?)
    }

    fn lower_intrinsic(&mut self, expr: &Expression, name: &str, arguments: &[Expression]) -> Result<Word> {
        let kind = arguments.first().map(|a| a.ty.component_type().number_kind()).unwrap_or(NumberKind::Float);
        let result = self.get_type(&expr.ty, None)?;
        let by_kind = |float: GLOp, signed: GLOp, unsigned: GLOp| match kind {
            NumberKind::Signed => signed,
            NumberKind::Unsigned => unsigned,
            _ => float,
        };
        let last_is_bool = arguments.last().is_some_and(|a| a.ty.component_type().is_boolean());
        let glsl = match name {
            "round" => Some(GLOp::Round),
            "roundEven" => Some(GLOp::RoundEven),
            "trunc" => Some(GLOp::Trunc),
            "abs" => Some(by_kind(GLOp::FAbs, GLOp::SAbs, GLOp::SAbs)),
            "sign" => Some(by_kind(GLOp::FSign, GLOp::SSign, GLOp::SSign)),
            "floor" => Some(GLOp::Floor),
            "ceil" => Some(GLOp::Ceil),
            "fract" => Some(GLOp::Fract),
            "radians" => Some(GLOp::Radians),
            "degrees" => Some(GLOp::Degrees),
            "sin" => Some(GLOp::Sin),
            "cos" => Some(GLOp::Cos),
            "tan" => Some(GLOp::Tan),
            "asin" => Some(GLOp::Asin),
            "acos" => Some(GLOp::Acos),
            "atan" if arguments.len() == 2 => Some(GLOp::Atan2),
            "atan" => Some(GLOp::Atan),
            "sinh" => Some(GLOp::Sinh),
            "cosh" => Some(GLOp::Cosh),
            "tanh" => Some(GLOp::Tanh),
            "pow" => Some(GLOp::Pow),
            "exp" => Some(GLOp::Exp),
            "log" => Some(GLOp::Log),
            "exp2" => Some(GLOp::Exp2),
            "log2" => Some(GLOp::Log2),
            "sqrt" => Some(GLOp::Sqrt),
            "inversesqrt" => Some(GLOp::InverseSqrt),
            "determinant" => Some(GLOp::Determinant),
            "inverse" => Some(GLOp::MatrixInverse),
            "min" => Some(by_kind(GLOp::FMin, GLOp::SMin, GLOp::UMin)),
            "max" => Some(by_kind(GLOp::FMax, GLOp::SMax, GLOp::UMax)),
            "clamp" => Some(by_kind(GLOp::FClamp, GLOp::SClamp, GLOp::UClamp)),
            "mix" if !last_is_bool => Some(GLOp::FMix),
            "step" => Some(GLOp::Step),
            "smoothstep" => Some(GLOp::SmoothStep),
            "fma" => Some(GLOp::Fma),
            "ldexp" => Some(GLOp::Ldexp),
            "packHalf2x16" => Some(GLOp::PackHalf2x16),
            "unpackHalf2x16" => Some(GLOp::UnpackHalf2x16),
            "packUnorm2x16" => Some(GLOp::PackUnorm2x16),
            "unpackUnorm2x16" => Some(GLOp::UnpackUnorm2x16),
            "packSnorm2x16" => Some(GLOp::PackSnorm2x16),
            "unpackSnorm2x16" => Some(GLOp::UnpackSnorm2x16),
            "length" => Some(GLOp::Length),
            "distance" => Some(GLOp::Distance),
            "cross" => Some(GLOp::Cross),
            "normalize" => Some(GLOp::Normalize),
            "faceforward" => Some(GLOp::FaceForward),
            "reflect" => Some(GLOp::Reflect),
            "refract" => Some(GLOp::Refract),
            "findLSB" => Some(GLOp::FindILsb),
            "findMSB" => Some(by_kind(GLOp::FindUMsb, GLOp::FindSMsb, GLOp::FindUMsb)),
            _ => None,
        };
        if let Some(op) = glsl {
            // Scalar arguments of the vector forms are splatted
            let splat = matches!(name, "min" | "max" | "clamp" | "mix" | "step" | "smoothstep") && expr.ty.is_vector();
            let mut operands = Vec::with_capacity(arguments.len());
            for arg in arguments {
                let mut value = self.lower_expression(arg)?;
                if splat && arg.ty.is_scalar() {
                    value = self.splat(value, &expr.ty)?;
                }
                operands.push(value);
            }
            return self.ext_inst(result, op, &operands);
        }

        let mut values = Vec::with_capacity(arguments.len());
        if name != "sample" {
            for arg in arguments {
                values.push(self.lower_expression(arg)?);
            }
        }
        match (name, values.as_slice()) {
            ("saturate", &[x]) => {
                let zero = self.constant_like(&expr.ty, 0.0)?;
                let one = self.constant_like(&expr.ty, 1.0)?;
                self.ext_inst(result, GLOp::FClamp, &[x, zero, one])
            }
            ("mix", &[x, y, a]) => {
                let a = if expr.ty.is_vector() && arguments[2].ty.is_scalar() {
                    let bvec = self.program.context.bool_vector(expr.ty.columns());
                    self.splat(a, &bvec)?
                } else {
                    a
                };
                Ok(self.constructor.builder.select(result, None, a, y, x)?)
            }
            ("mod", &[x, y]) => {
                let y = if expr.ty.is_vector() && arguments[1].ty.is_scalar() { self.splat(y, &expr.ty)? } else { y };
                Ok(self.constructor.builder.f_mod(result, None, x, y)?)
            }
            ("dot", &[a, b]) => Ok(self.constructor.builder.dot(result, None, a, b)?),
            ("transpose", &[m]) => Ok(self.constructor.builder.transpose(result, None, m)?),
            ("dFdx", &[v]) => Ok(self.constructor.builder.d_pdx(result, None, v)?),
            ("fwidth", &[v]) => Ok(self.constructor.builder.fwidth(result, None, v)?),
            ("dFdy", &[v]) => {
                let derivative = self.constructor.builder.d_pdy(result, None, v)?;
                if !self.rt_flip {
                    return Ok(derivative);
                }
                let flip = self.rt_flip_value()?;
                let f32_type = self.constructor.f32_type;
                let flip_y = self.constructor.builder.composite_extract(f32_type, None, flip, [1])?;
                if expr.ty.is_vector() {
                    Ok(self.constructor.builder.vector_times_scalar(result, None, derivative, flip_y)?)
                } else {
                    Ok(self.constructor.builder.f_mul(result, None, derivative, flip_y)?)
                }
            }
            ("matrixCompMult", &[a, b]) => {
                let column = self.column_type(&expr.ty)?;
                let column_type = self.get_type(&column, None)?;
                let mut columns = Vec::with_capacity(expr.ty.columns());
                for i in 0..expr.ty.columns() as u32 {
                    let ac = self.constructor.builder.composite_extract(column_type, None, a, [i])?;
                    let bc = self.constructor.builder.composite_extract(column_type, None, b, [i])?;
                    columns.push(self.constructor.builder.f_mul(column_type, None, ac, bc)?);
                }
                Ok(self.constructor.builder.composite_construct(result, None, columns)?)
            }
            ("lessThan", &[a, b]) => self.comparison(Operator::Lt, kind, result, a, b),
            ("lessThanEqual", &[a, b]) => self.comparison(Operator::LtEq, kind, result, a, b),
            ("greaterThan", &[a, b]) => self.comparison(Operator::Gt, kind, result, a, b),
            ("greaterThanEqual", &[a, b]) => self.comparison(Operator::GtEq, kind, result, a, b),
            ("equal", &[a, b]) => self.comparison(Operator::EqEq, kind, result, a, b),
            ("notEqual", &[a, b]) => self.comparison(Operator::Neq, kind, result, a, b),
            ("any", &[v]) => Ok(self.constructor.builder.any(result, None, v)?),
            ("all", &[v]) => Ok(self.constructor.builder.all(result, None, v)?),
            ("not", &[v]) => Ok(self.constructor.builder.logical_not(result, None, v)?),
            ("sample", _) => self.lower_sample(expr, arguments, result),
            ("EmitVertex", &[]) => {
                self.constructor.builder.emit_vertex()?;
                Ok(self.constructor.const_i32(0))
            }
            ("EndPrimitive", &[]) => {
                self.constructor.builder.end_primitive()?;
                Ok(self.constructor.const_i32(0))
            }
            _ => bail_spirv_at!(expr.offset, "unsupported intrinsic '{}'", name),
        }
    }

    fn lower_sample(&mut self, expr: &Expression, arguments: &[Expression], result: Word) -> Result<Word> {
        let (sampler, coords) = match arguments {
            [sampler, coords, ..] if matches!(sampler.ty.kind, TypeKind::Sampler { .. }) => (sampler, coords),
            _ => bail_spirv_at!(expr.offset, "only sampler arguments can be sampled in SPIR-V"),
        };
        let sampled_image = self.lower_expression(sampler)?;
        let coordinate = self.lower_expression(coords)?;
        let bias = match arguments.get(2) {
            Some(bias) => Some(self.lower_expression(bias)?),
            None if self.program.settings.sharpen_textures => Some(self.constructor.const_f32(-0.5)),
            None => None,
        };
        let (mask, operands) = match bias {
            Some(bias) => (Some(spirv::ImageOperands::BIAS), vec![Operand::IdRef(bias)]),
            None => (None, Vec::new()),
        };
        let builder = &mut self.constructor.builder;
        let projected = coords.ty.columns() == 3
            && matches!(&sampler.ty.kind, TypeKind::Sampler { texture } if matches!(texture.kind, TypeKind::Texture { dim: SamplerDim::D2, .. }));
        if projected {
            Ok(builder.image_sample_proj_implicit_lod(result, None, sampled_image, coordinate, mask, operands)?)
        } else {
            Ok(builder.image_sample_implicit_lod(result, None, sampled_image, coordinate, mask, operands)?)
        }
    }
}
