//! The closed type system: scalars, vectors, matrices, arrays, structs and
//! opaque sampler/texture types, plus the `Context` registry of built-in
//! types shared by every phase.

use crate::modifiers::Modifiers;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

pub type TypeRef = Rc<Type>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumberKind {
    Float,
    Signed,
    Unsigned,
    Boolean,
    NonNumeric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SamplerDim {
    D1,
    D2,
    D3,
    Cube,
    Rect,
    Buffer,
    SubpassData,
    External,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub modifiers: Modifiers,
    pub name: String,
    pub ty: TypeRef,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeKind {
    Scalar { number_kind: NumberKind, priority: i32 },
    Vector { component: TypeRef, columns: usize },
    Matrix { component: TypeRef, columns: usize, rows: usize },
    /// `count == None` is a runtime-sized (unsized) array.
    Array { component: TypeRef, count: Option<usize> },
    Struct { fields: Vec<Field> },
    Enum,
    Texture { dim: SamplerDim, depth: bool, arrayed: bool, multisampled: bool, sampled: bool },
    Sampler { texture: TypeRef },
    SeparateSampler,
    Nullable { component: TypeRef },
    /// Placeholder used only by built-in declarations during overload resolution.
    Generic { coercibles: Vec<TypeRef> },
    Void,
    Other,
}

/// An immutable, structurally compared type descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Type {
    pub name: String,
    pub kind: TypeKind,
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl Type {
    pub fn new(name: impl Into<String>, kind: TypeKind) -> TypeRef {
        Rc::new(Type { name: name.into(), kind })
    }

    pub fn new_array(component: &TypeRef, count: Option<usize>) -> TypeRef {
        let name = match count {
            Some(n) => format!("{}[{}]", component.name, n),
            None => format!("{}[]", component.name),
        };
        Type::new(name, TypeKind::Array { component: component.clone(), count })
    }

    pub fn new_struct(name: impl Into<String>, fields: Vec<Field>) -> TypeRef {
        Type::new(name, TypeKind::Struct { fields })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn number_kind(&self) -> NumberKind {
        match &self.kind {
            TypeKind::Scalar { number_kind, .. } => *number_kind,
            TypeKind::Enum => NumberKind::Signed,
            _ => NumberKind::NonNumeric,
        }
    }

    pub fn priority(&self) -> i32 {
        match &self.kind {
            TypeKind::Scalar { priority, .. } => *priority,
            _ => -1,
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self.kind, TypeKind::Scalar { .. })
    }

    pub fn is_vector(&self) -> bool {
        matches!(self.kind, TypeKind::Vector { .. })
    }

    pub fn is_matrix(&self) -> bool {
        matches!(self.kind, TypeKind::Matrix { .. })
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, TypeKind::Array { .. })
    }

    pub fn is_struct(&self) -> bool {
        matches!(self.kind, TypeKind::Struct { .. })
    }

    pub fn is_void(&self) -> bool {
        matches!(self.kind, TypeKind::Void)
    }

    pub fn is_generic(&self) -> bool {
        matches!(self.kind, TypeKind::Generic { .. })
    }

    pub fn is_number(&self) -> bool {
        matches!(
            self.number_kind(),
            NumberKind::Float | NumberKind::Signed | NumberKind::Unsigned
        )
    }

    pub fn is_float(&self) -> bool {
        self.number_kind() == NumberKind::Float
    }

    pub fn is_signed(&self) -> bool {
        self.number_kind() == NumberKind::Signed
    }

    pub fn is_unsigned(&self) -> bool {
        self.number_kind() == NumberKind::Unsigned
    }

    pub fn is_integer(&self) -> bool {
        self.is_signed() || self.is_unsigned()
    }

    pub fn is_boolean(&self) -> bool {
        self.number_kind() == NumberKind::Boolean
    }

    /// Samplers, textures and other types that cannot be copied or compared.
    pub fn is_opaque(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Texture { .. }
                | TypeKind::Sampler { .. }
                | TypeKind::SeparateSampler
                | TypeKind::Nullable { .. }
                | TypeKind::Other
        )
    }

    /// Vector/matrix/array element type; scalars are their own component.
    pub fn component_type(&self) -> &Type {
        match &self.kind {
            TypeKind::Vector { component, .. }
            | TypeKind::Matrix { component, .. }
            | TypeKind::Array { component, .. }
            | TypeKind::Nullable { component } => component,
            _ => self,
        }
    }

    pub fn component_ref(self: &TypeRef) -> TypeRef {
        match &self.kind {
            TypeKind::Vector { component, .. }
            | TypeKind::Matrix { component, .. }
            | TypeKind::Array { component, .. }
            | TypeKind::Nullable { component } => component.clone(),
            _ => self.clone(),
        }
    }

    /// Scalars are 1; vectors their length; matrices their column count;
    /// arrays their length (0 when unsized).
    pub fn columns(&self) -> usize {
        match &self.kind {
            TypeKind::Scalar { .. } | TypeKind::Enum => 1,
            TypeKind::Vector { columns, .. } => *columns,
            TypeKind::Matrix { columns, .. } => *columns,
            TypeKind::Array { count, .. } => count.unwrap_or(0),
            _ => 1,
        }
    }

    pub fn rows(&self) -> usize {
        match &self.kind {
            TypeKind::Matrix { rows, .. } => *rows,
            _ => 1,
        }
    }

    pub fn array_count(&self) -> Option<usize> {
        match &self.kind {
            TypeKind::Array { count, .. } => *count,
            _ => None,
        }
    }

    pub fn fields(&self) -> &[Field] {
        match &self.kind {
            TypeKind::Struct { fields } => fields,
            _ => &[],
        }
    }

    pub fn coercibles(&self) -> &[TypeRef] {
        match &self.kind {
            TypeKind::Generic { coercibles } => coercibles,
            _ => &[],
        }
    }

    /// Number of scalar slots this type occupies when flattened.
    pub fn slot_count(&self) -> usize {
        match &self.kind {
            TypeKind::Scalar { .. } | TypeKind::Enum => 1,
            TypeKind::Vector { columns, .. } => *columns,
            TypeKind::Matrix { columns, rows, .. } => columns * rows,
            TypeKind::Array { component, count } => component.slot_count() * count.unwrap_or(0),
            TypeKind::Struct { fields } => fields.iter().map(|f| f.ty.slot_count()).sum(),
            _ => 0,
        }
    }

    /// Cost of implicitly converting a value of this type to `other`.
    /// `None` means the conversion is impossible.
    pub fn coercion_cost(&self, other: &Type) -> Option<u32> {
        if self == other {
            return Some(0);
        }
        match (&self.kind, &other.kind) {
            (_, TypeKind::Nullable { component }) => {
                if self.name == "null" {
                    Some(0)
                } else {
                    self.coercion_cost(component).map(|c| c + 1)
                }
            }
            (
                TypeKind::Vector { component: a, columns: ca },
                TypeKind::Vector { component: b, columns: cb },
            ) => {
                if ca == cb {
                    a.coercion_cost(b)
                } else {
                    None
                }
            }
            (
                TypeKind::Matrix { component: a, columns: ca, rows: ra },
                TypeKind::Matrix { component: b, columns: cb, rows: rb },
            ) => {
                if ca == cb && ra == rb {
                    a.coercion_cost(b)
                } else {
                    None
                }
            }
            (TypeKind::Scalar { .. }, TypeKind::Scalar { .. }) => {
                if self.is_number() && other.is_float() {
                    Some(1)
                } else if (self.is_signed() && other.is_signed())
                    || (self.is_unsigned() && other.is_unsigned())
                {
                    if other.priority() >= self.priority() {
                        Some((other.priority() - self.priority()) as u32)
                    } else {
                        None
                    }
                } else {
                    None
                }
            }
            (TypeKind::Enum, TypeKind::Scalar { .. }) if other.is_signed() => Some(1),
            (_, TypeKind::Generic { coercibles }) => coercibles
                .iter()
                .position(|t| **t == *self)
                .map(|i| i as u32 + 1),
            _ => None,
        }
    }

    pub fn can_coerce_to(&self, other: &Type) -> bool {
        self.coercion_cost(other).is_some()
    }
}

/// Registry of built-in types. Shared read-only by every phase of a compile.
#[derive(Debug)]
pub struct Context {
    pub void_type: TypeRef,
    pub float_type: TypeRef,
    pub half_type: TypeRef,
    pub int_type: TypeRef,
    pub uint_type: TypeRef,
    pub bool_type: TypeRef,
    pub float_literal_type: TypeRef,
    pub int_literal_type: TypeRef,
    pub sampler2d_type: TypeRef,
    pub sampler_external_type: TypeRef,
    pub sampler2d_rect_type: TypeRef,
    pub texture2d_type: TypeRef,
    pub sampler_type: TypeRef,
    pub fragment_processor_type: TypeRef,
    pub sk_caps_type: TypeRef,
    pub null_type: TypeRef,
    pub invalid_type: TypeRef,
    float_vectors: Vec<TypeRef>,
    half_vectors: Vec<TypeRef>,
    int_vectors: Vec<TypeRef>,
    uint_vectors: Vec<TypeRef>,
    bool_vectors: Vec<TypeRef>,
    float_matrices: Vec<TypeRef>,
    half_matrices: Vec<TypeRef>,
    /// Every named built-in type, including GLSL-style aliases and generics.
    by_name: BTreeMap<String, TypeRef>,
}

fn scalar(name: &str, number_kind: NumberKind, priority: i32) -> TypeRef {
    Type::new(name, TypeKind::Scalar { number_kind, priority })
}

fn vectors(base: &TypeRef, prefix: &str) -> Vec<TypeRef> {
    (2..=4)
        .map(|n| {
            Type::new(
                format!("{}{}", prefix, n),
                TypeKind::Vector { component: base.clone(), columns: n },
            )
        })
        .collect()
}

fn matrices(base: &TypeRef, prefix: &str) -> Vec<TypeRef> {
    let mut result = Vec::with_capacity(9);
    for columns in 2..=4 {
        for rows in 2..=4 {
            result.push(Type::new(
                format!("{}{}x{}", prefix, columns, rows),
                TypeKind::Matrix { component: base.clone(), columns, rows },
            ));
        }
    }
    result
}

fn generic(name: &str, coercibles: Vec<TypeRef>) -> TypeRef {
    Type::new(name, TypeKind::Generic { coercibles })
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    pub fn new() -> Self {
        let float_type = scalar("float", NumberKind::Float, 10);
        let half_type = scalar("half", NumberKind::Float, 9);
        let int_type = scalar("int", NumberKind::Signed, 7);
        let uint_type = scalar("uint", NumberKind::Unsigned, 6);
        let bool_type = scalar("bool", NumberKind::Boolean, 0);
        let float_vectors = vectors(&float_type, "float");
        let half_vectors = vectors(&half_type, "half");
        let int_vectors = vectors(&int_type, "int");
        let uint_vectors = vectors(&uint_type, "uint");
        let bool_vectors = vectors(&bool_type, "bool");
        let float_matrices = matrices(&float_type, "float");
        let half_matrices = matrices(&half_type, "half");

        let texture = |name: &str, dim: SamplerDim| {
            Type::new(
                name,
                TypeKind::Texture {
                    dim,
                    depth: false,
                    arrayed: false,
                    multisampled: false,
                    sampled: true,
                },
            )
        };
        let texture2d_type = texture("texture2D", SamplerDim::D2);
        let sampler = |name: &str, texture: &TypeRef| {
            Type::new(name, TypeKind::Sampler { texture: texture.clone() })
        };
        let sampler2d_type = sampler("sampler2D", &texture2d_type);
        let sampler_external_type =
            sampler("samplerExternalOES", &texture("textureExternalOES", SamplerDim::External));
        let sampler2d_rect_type =
            sampler("sampler2DRect", &texture("texture2DRect", SamplerDim::Rect));
        let sampler1d_type = sampler("sampler1D", &texture("texture1D", SamplerDim::D1));
        let sampler3d_type = sampler("sampler3D", &texture("texture3D", SamplerDim::D3));
        let sampler_cube_type = sampler("samplerCube", &texture("textureCube", SamplerDim::Cube));
        let sampler_type = Type::new("sampler", TypeKind::SeparateSampler);
        let fragment_processor_type = Type::new("fragmentProcessor", TypeKind::Other);

        let mut by_name = BTreeMap::new();
        let mut register = |name: &str, ty: &TypeRef| {
            by_name.insert(name.to_string(), ty.clone());
        };
        for ty in [&float_type, &half_type, &int_type, &uint_type, &bool_type] {
            register(&ty.name, ty);
        }
        let void_type = Type::new("void", TypeKind::Void);
        register("void", &void_type);
        for (i, n) in (2..=4).enumerate() {
            register(&float_vectors[i].name, &float_vectors[i]);
            register(&format!("vec{}", n), &float_vectors[i]);
            register(&half_vectors[i].name, &half_vectors[i]);
            register(&int_vectors[i].name, &int_vectors[i]);
            register(&format!("ivec{}", n), &int_vectors[i]);
            register(&uint_vectors[i].name, &uint_vectors[i]);
            register(&format!("uvec{}", n), &uint_vectors[i]);
            register(&bool_vectors[i].name, &bool_vectors[i]);
            register(&format!("bvec{}", n), &bool_vectors[i]);
        }
        for m in float_matrices.iter().chain(half_matrices.iter()) {
            register(&m.name, m);
        }
        for m in &float_matrices {
            let (columns, rows) = (m.columns(), m.rows());
            register(&format!("mat{}x{}", columns, rows), m);
            if columns == rows {
                register(&format!("mat{}", columns), m);
            }
        }
        for ty in [
            &texture2d_type,
            &sampler2d_type,
            &sampler_external_type,
            &sampler2d_rect_type,
            &sampler1d_type,
            &sampler3d_type,
            &sampler_cube_type,
            &sampler_type,
            &fragment_processor_type,
        ] {
            register(&ty.name, ty);
        }

        let square = |ms: &Vec<TypeRef>| -> Vec<TypeRef> {
            ms.iter().filter(|m| m.columns() == m.rows()).cloned().collect()
        };
        let with_scalar = |s: &TypeRef, vs: &Vec<TypeRef>| -> Vec<TypeRef> {
            std::iter::once(s.clone()).chain(vs.iter().cloned()).collect()
        };
        let generics = [
            generic("$genType", with_scalar(&float_type, &float_vectors)),
            generic("$genHType", with_scalar(&half_type, &half_vectors)),
            generic("$genIType", with_scalar(&int_type, &int_vectors)),
            generic("$genUType", with_scalar(&uint_type, &uint_vectors)),
            generic("$genBType", with_scalar(&bool_type, &bool_vectors)),
            generic("$vec", float_vectors.clone()),
            generic("$hvec", half_vectors.clone()),
            generic("$ivec", int_vectors.clone()),
            generic("$uvec", uint_vectors.clone()),
            generic("$bvec", bool_vectors.clone()),
            generic("$mat", float_matrices.clone()),
            generic("$hmat", half_matrices.clone()),
            generic("$squareMat", square(&float_matrices)),
            generic("$squareHMat", square(&half_matrices)),
        ];
        for g in &generics {
            register(&g.name, g);
        }

        Context {
            void_type,
            float_literal_type: float_type.clone(),
            int_literal_type: int_type.clone(),
            float_type,
            half_type,
            int_type,
            uint_type,
            bool_type,
            sampler2d_type,
            sampler_external_type,
            sampler2d_rect_type,
            texture2d_type,
            sampler_type,
            fragment_processor_type,
            sk_caps_type: Type::new("$sk_Caps", TypeKind::Other),
            null_type: Type::new("null", TypeKind::Other),
            invalid_type: Type::new("<INVALID>", TypeKind::Other),
            float_vectors,
            half_vectors,
            int_vectors,
            uint_vectors,
            bool_vectors,
            float_matrices,
            half_matrices,
            by_name,
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&TypeRef> {
        self.by_name.get(name)
    }

    /// All named built-in types in a stable order.
    pub fn named_types(&self) -> impl Iterator<Item = (&String, &TypeRef)> {
        self.by_name.iter()
    }

    pub fn float_vector(&self, n: usize) -> TypeRef {
        if n == 1 {
            self.float_type.clone()
        } else {
            self.float_vectors[n - 2].clone()
        }
    }

    pub fn bool_vector(&self, n: usize) -> TypeRef {
        if n == 1 {
            self.bool_type.clone()
        } else {
            self.bool_vectors[n - 2].clone()
        }
    }

    /// The vector (`rows == 1`) or matrix type with the given scalar
    /// component, or the component itself for 1x1.
    pub fn compound(&self, component: &Type, columns: usize, rows: usize) -> Option<TypeRef> {
        if !(1..=4).contains(&columns) || !(1..=4).contains(&rows) {
            return None;
        }
        if rows == 1 {
            let (scalar, vecs) = match component.name.as_str() {
                "float" => (&self.float_type, &self.float_vectors),
                "half" => (&self.half_type, &self.half_vectors),
                "int" => (&self.int_type, &self.int_vectors),
                "uint" => (&self.uint_type, &self.uint_vectors),
                "bool" => (&self.bool_type, &self.bool_vectors),
                _ => return None,
            };
            return Some(if columns == 1 { scalar.clone() } else { vecs[columns - 2].clone() });
        }
        if columns == 1 {
            return None;
        }
        let matrices = match component.name.as_str() {
            "float" => &self.float_matrices,
            "half" => &self.half_matrices,
            _ => return None,
        };
        Some(matrices[(columns - 2) * 3 + (rows - 2)].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structurally_equal_types_coerce_for_free() {
        let a = Context::new();
        let b = Context::new();
        assert_eq!(a.float_vector(3), b.float_vector(3));
        assert_eq!(a.float_vector(3).coercion_cost(&b.float_vector(3)), Some(0));
    }

    #[test]
    fn numeric_promotion_costs() {
        let ctx = Context::new();
        assert_eq!(ctx.int_type.coercion_cost(&ctx.float_type), Some(1));
        assert_eq!(ctx.half_type.coercion_cost(&ctx.float_type), Some(1));
        assert_eq!(ctx.float_type.coercion_cost(&ctx.int_type), None);
        assert_eq!(ctx.int_type.coercion_cost(&ctx.uint_type), None);
        assert_eq!(ctx.float_vector(2).coercion_cost(&ctx.float_vector(3)), None);
        let int3 = ctx.lookup("int3").unwrap();
        assert_eq!(int3.coercion_cost(&ctx.float_vector(3)), Some(1));
    }

    #[test]
    fn compound_lookup_and_aliases() {
        let ctx = Context::new();
        let m = ctx.compound(&ctx.float_type, 3, 2).unwrap();
        assert_eq!(m.name, "float3x2");
        assert_eq!(m.columns(), 3);
        assert_eq!(m.rows(), 2);
        assert_eq!(ctx.lookup("mat3").unwrap().name, "float3x3");
        assert_eq!(ctx.lookup("vec4").unwrap().name, "float4");
        assert_eq!(m.slot_count(), 6);
    }
}
