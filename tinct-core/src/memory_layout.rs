//! Size, alignment and stride rules for buffer-backed aggregates.

use crate::types::{Type, TypeKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayoutStandard {
    Std140,
    Std430,
    Metal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    pub standard: LayoutStandard,
}

/// `half` is the only reduced-precision number type.
fn is_high_precision(ty: &Type) -> bool {
    ty.name != "half"
}

fn align_to(offset: usize, alignment: usize) -> usize {
    if alignment == 0 {
        offset
    } else {
        (offset + alignment - 1) / alignment * alignment
    }
}

/// Vectors of three align like vectors of four.
fn vector_alignment(component_size: usize, columns: usize) -> usize {
    component_size * (columns + columns % 2)
}

impl MemoryLayout {
    pub fn new(standard: LayoutStandard) -> Self {
        MemoryLayout { standard }
    }

    /// std140 rounds array and struct alignment up to a vec4.
    fn round_up_if_needed(&self, raw: usize) -> usize {
        match self.standard {
            LayoutStandard::Std140 => (raw + 15) & !15,
            LayoutStandard::Std430 | LayoutStandard::Metal => raw,
        }
    }

    /// `None` for types with no memory layout, such as samplers.
    pub fn alignment(&self, ty: &Type) -> Option<usize> {
        let alignment = match &ty.kind {
            TypeKind::Scalar { .. } | TypeKind::Enum => return self.size(ty),
            TypeKind::Vector { component, columns } => vector_alignment(self.size(component)?, *columns),
            TypeKind::Matrix { component, rows, .. } => {
                self.round_up_if_needed(vector_alignment(self.size(component)?, *rows))
            }
            TypeKind::Array { component, .. } => self.round_up_if_needed(self.alignment(component)?),
            TypeKind::Struct { fields } => {
                let mut widest = 0;
                for field in fields {
                    widest = widest.max(self.alignment(&field.ty)?);
                }
                self.round_up_if_needed(widest)
            }
            _ => return None,
        };
        Some(alignment)
    }

    /// Distance between consecutive matrix columns or array elements.
    pub fn stride(&self, ty: &Type) -> Option<usize> {
        match &ty.kind {
            TypeKind::Matrix { component, rows, .. } => {
                Some(self.round_up_if_needed(vector_alignment(self.size(component)?, *rows)))
            }
            TypeKind::Array { component, .. } => self.array_stride(component),
            _ => None,
        }
    }

    /// Stride between elements of an array of `element`.
    pub fn array_stride(&self, element: &Type) -> Option<usize> {
        let size = self.size(element)?;
        if size == 0 {
            return Some(0);
        }
        let align = self.alignment(element)?;
        Some(self.round_up_if_needed((size + align - 1) / align * align))
    }

    pub fn size(&self, ty: &Type) -> Option<usize> {
        let size = match &ty.kind {
            TypeKind::Scalar { .. } | TypeKind::Enum => {
                if ty.is_boolean() {
                    1
                } else if self.standard == LayoutStandard::Metal && !is_high_precision(ty) {
                    2
                } else {
                    4
                }
            }
            TypeKind::Vector { component, columns } => {
                if self.standard == LayoutStandard::Metal && *columns == 3 {
                    4 * self.size(component)?
                } else {
                    columns * self.size(component)?
                }
            }
            TypeKind::Matrix { columns, .. } => columns * self.stride(ty)?,
            TypeKind::Array { count, .. } => count.unwrap_or(0) * self.stride(ty)?,
            TypeKind::Struct { fields } => {
                let mut total = 0;
                for field in fields {
                    total = align_to(total, self.alignment(&field.ty)?);
                    total += self.size(&field.ty)?;
                }
                align_to(total, self.alignment(ty)?)
            }
            _ => return None,
        };
        Some(size)
    }

    /// Byte offset of each field of a struct.
    pub fn field_offsets(&self, ty: &Type) -> Option<Vec<usize>> {
        let mut offsets = Vec::with_capacity(ty.fields().len());
        let mut offset = 0;
        for field in ty.fields() {
            offset = align_to(offset, self.alignment(&field.ty)?);
            offsets.push(offset);
            offset += self.size(&field.ty)?;
        }
        Some(offsets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modifiers::Modifiers;
    use crate::types::{Context, Field};

    fn field(name: &str, ty: &crate::types::TypeRef) -> Field {
        Field { modifiers: Modifiers::default(), name: name.to_string(), ty: ty.clone() }
    }

    #[test]
    fn test_vector_and_matrix_rules() {
        let context = Context::new();
        let std140 = MemoryLayout::new(LayoutStandard::Std140);
        let metal = MemoryLayout::new(LayoutStandard::Metal);
        let float3 = context.float_vector(3);
        assert_eq!(std140.alignment(&float3), Some(16));
        assert_eq!(std140.size(&float3), Some(12));
        assert_eq!(metal.size(&float3), Some(16));

        let float3x3 = context.lookup("float3x3").unwrap();
        assert_eq!(std140.stride(float3x3), Some(16));
        assert_eq!(std140.size(float3x3), Some(48));
        let float2x2 = context.lookup("float2x2").unwrap();
        assert_eq!(std140.stride(float2x2), Some(16));
        assert_eq!(MemoryLayout::new(LayoutStandard::Std430).stride(float2x2), Some(8));

        let half2 = context.lookup("half2").unwrap();
        assert_eq!(metal.size(half2), Some(4));
        assert_eq!(std140.size(half2), Some(8));
    }

    #[test]
    fn test_array_stride_differs_between_std140_and_std430() {
        let context = Context::new();
        let floats = Type::new_array(&context.float_type, Some(4));
        assert_eq!(MemoryLayout::new(LayoutStandard::Std140).stride(&floats), Some(16));
        assert_eq!(MemoryLayout::new(LayoutStandard::Std140).size(&floats), Some(64));
        assert_eq!(MemoryLayout::new(LayoutStandard::Std430).stride(&floats), Some(4));
        assert_eq!(MemoryLayout::new(LayoutStandard::Std430).size(&floats), Some(16));
    }

    #[test]
    fn test_struct_field_offsets() {
        let context = Context::new();
        let s = Type::new_struct(
            "S",
            vec![
                field("a", &context.float_type),
                field("b", &context.float_vector(3)),
                field("c", &context.float_type),
                field("d", &context.float_vector(2)),
            ],
        );
        let std140 = MemoryLayout::new(LayoutStandard::Std140);
        assert_eq!(std140.field_offsets(&s), Some(vec![0, 16, 28, 32]));
        assert_eq!(std140.size(&s), Some(48));
    }

    #[test]
    fn test_opaque_types_have_no_layout() {
        let context = Context::new();
        let sampler = context.lookup("sampler2D").unwrap();
        let std430 = MemoryLayout::new(LayoutStandard::Std430);
        assert_eq!(std430.size(sampler), None);
        assert_eq!(std430.alignment(sampler), None);
        let samplers = Type::new_array(sampler, Some(2));
        assert_eq!(std430.stride(&samplers), None);
        let s = Type::new_struct("S", vec![field("a", &context.float_type), field("t", sampler)]);
        assert_eq!(std430.field_offsets(&s), None);
        assert_eq!(std430.size(&s), None);
    }
}
