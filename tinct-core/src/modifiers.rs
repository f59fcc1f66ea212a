//! Storage qualifiers and `layout(...)` data attached to variables,
//! parameters, struct fields and interface blocks.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    Points,
    Lines,
    LinesAdjacency,
    Triangles,
    TrianglesAdjacency,
    LineStrip,
    TriangleStrip,
}

impl Primitive {
    pub fn from_name(name: &str) -> Option<Primitive> {
        Some(match name {
            "points" => Primitive::Points,
            "lines" => Primitive::Lines,
            "lines_adjacency" => Primitive::LinesAdjacency,
            "triangles" => Primitive::Triangles,
            "triangles_adjacency" => Primitive::TrianglesAdjacency,
            "line_strip" => Primitive::LineStrip,
            "triangle_strip" => Primitive::TriangleStrip,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Primitive::Points => "points",
            Primitive::Lines => "lines",
            Primitive::LinesAdjacency => "lines_adjacency",
            Primitive::Triangles => "triangles",
            Primitive::TrianglesAdjacency => "triangles_adjacency",
            Primitive::LineStrip => "line_strip",
            Primitive::TriangleStrip => "triangle_strip",
        }
    }
}

/// `layout(...)` qualifier contents. Integer fields use `-1` for "unset".
#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    pub flags: u32,
    pub location: i32,
    pub offset: i32,
    pub binding: i32,
    pub index: i32,
    pub set: i32,
    pub builtin: i32,
    pub input_attachment_index: i32,
    pub primitive: Option<Primitive>,
    pub max_vertices: i32,
    pub invocations: i32,
}

impl Layout {
    pub const ORIGIN_UPPER_LEFT: u32 = 1 << 0;
    pub const OVERRIDE_COVERAGE: u32 = 1 << 1;
    pub const PUSH_CONSTANT: u32 = 1 << 2;
    pub const BLEND_SUPPORT_ALL_EQUATIONS: u32 = 1 << 3;
    pub const STD140: u32 = 1 << 4;
    pub const STD430: u32 = 1 << 5;

    pub fn builtin(builtin: i32) -> Self {
        Layout {
            builtin,
            ..Layout::default()
        }
    }

    /// Text for a GLSL `layout (...)` qualifier, or empty if nothing is set.
    pub fn description(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if self.location >= 0 {
            parts.push(format!("location = {}", self.location));
        }
        if self.offset >= 0 {
            parts.push(format!("offset = {}", self.offset));
        }
        if self.binding >= 0 {
            parts.push(format!("binding = {}", self.binding));
        }
        if self.index >= 0 {
            parts.push(format!("index = {}", self.index));
        }
        if self.set >= 0 {
            parts.push(format!("set = {}", self.set));
        }
        if self.input_attachment_index >= 0 {
            parts.push(format!("input_attachment_index = {}", self.input_attachment_index));
        }
        if self.flags & Self::ORIGIN_UPPER_LEFT != 0 {
            parts.push("origin_upper_left".into());
        }
        if self.flags & Self::OVERRIDE_COVERAGE != 0 {
            parts.push("override_coverage".into());
        }
        if self.flags & Self::BLEND_SUPPORT_ALL_EQUATIONS != 0 {
            parts.push("blend_support_all_equations".into());
        }
        if self.flags & Self::PUSH_CONSTANT != 0 {
            parts.push("push_constant".into());
        }
        if self.flags & Self::STD140 != 0 {
            parts.push("std140".into());
        }
        if self.flags & Self::STD430 != 0 {
            parts.push("std430".into());
        }
        if let Some(primitive) = self.primitive {
            parts.push(primitive.name().into());
        }
        if self.max_vertices >= 0 {
            parts.push(format!("max_vertices = {}", self.max_vertices));
        }
        if self.invocations >= 0 {
            parts.push(format!("invocations = {}", self.invocations));
        }
        if parts.is_empty() {
            String::new()
        } else {
            format!("layout ({})", parts.join(", "))
        }
    }
}

impl Default for Layout {
    fn default() -> Self {
        Layout {
            flags: 0,
            location: -1,
            offset: -1,
            binding: -1,
            index: -1,
            set: -1,
            builtin: -1,
            input_attachment_index: -1,
            primitive: None,
            max_vertices: -1,
            invocations: -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Modifiers {
    pub layout: Layout,
    pub flags: u32,
}

impl Modifiers {
    pub const CONST: u32 = 1 << 0;
    pub const IN: u32 = 1 << 1;
    pub const OUT: u32 = 1 << 2;
    pub const UNIFORM: u32 = 1 << 3;
    pub const FLAT: u32 = 1 << 4;
    pub const NO_PERSPECTIVE: u32 = 1 << 5;
    pub const READONLY: u32 = 1 << 6;
    pub const WRITEONLY: u32 = 1 << 7;
    pub const COHERENT: u32 = 1 << 8;
    pub const VOLATILE: u32 = 1 << 9;
    pub const RESTRICT: u32 = 1 << 10;
    pub const BUFFER: u32 = 1 << 11;
    pub const HAS_SIDE_EFFECTS: u32 = 1 << 12;
    pub const HIGHP: u32 = 1 << 13;
    pub const MEDIUMP: u32 = 1 << 14;
    pub const LOWP: u32 = 1 << 15;
    pub const INLINE: u32 = 1 << 16;
    pub const NO_INLINE: u32 = 1 << 17;

    pub fn new(layout: Layout, flags: u32) -> Self {
        Modifiers { layout, flags }
    }

    pub fn has(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }
}

impl fmt::Display for Modifiers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let layout = self.layout.description();
        if !layout.is_empty() {
            write!(f, "{} ", layout)?;
        }
        const NAMES: &[(u32, &str)] = &[
            (Modifiers::INLINE, "inline"),
            (Modifiers::NO_INLINE, "noinline"),
            (Modifiers::FLAT, "flat"),
            (Modifiers::NO_PERSPECTIVE, "noperspective"),
            (Modifiers::CONST, "const"),
            (Modifiers::UNIFORM, "uniform"),
            (Modifiers::READONLY, "readonly"),
            (Modifiers::WRITEONLY, "writeonly"),
            (Modifiers::COHERENT, "coherent"),
            (Modifiers::VOLATILE, "volatile"),
            (Modifiers::RESTRICT, "restrict"),
            (Modifiers::BUFFER, "buffer"),
            (Modifiers::HIGHP, "highp"),
            (Modifiers::MEDIUMP, "mediump"),
            (Modifiers::LOWP, "lowp"),
        ];
        for (flag, name) in NAMES {
            if self.flags & flag != 0 {
                write!(f, "{} ", name)?;
            }
        }
        match (self.has(Modifiers::IN), self.has(Modifiers::OUT)) {
            (true, true) => f.write_str("inout "),
            (true, false) => f.write_str("in "),
            (false, true) => f.write_str("out "),
            (false, false) => Ok(()),
        }
    }
}
