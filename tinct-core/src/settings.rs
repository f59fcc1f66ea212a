//! Compile configuration: program kind, target capabilities and the
//! `sk_Caps` value table visible to shader source.

use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramKind {
    Vertex,
    Fragment,
    Geometry,
    /// A fragment-processor style program evaluated by the VM backend.
    Pipeline,
}

impl fmt::Display for ProgramKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProgramKind::Vertex => "vertex",
            ProgramKind::Fragment => "fragment",
            ProgramKind::Geometry => "geometry",
            ProgramKind::Pipeline => "pipeline",
        };
        f.write_str(name)
    }
}

/// A value exposed to shader source as `sk_Caps.<name>`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CapValue {
    Bool(bool),
    Int(i64),
    Float(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GlslGeneration {
    /// GLSL ES 1.00
    Es100,
    /// GLSL ES 3.00
    Es300,
    /// GLSL 1.10
    V110,
    /// GLSL 1.30
    V130,
    /// GLSL 1.40
    V140,
    /// GLSL 3.30
    V330,
    /// GLSL 4.00
    V400,
    /// GLSL 4.20
    V420,
}

impl GlslGeneration {
    pub fn version_declaration(self) -> &'static str {
        match self {
            GlslGeneration::Es100 => "#version 100\n",
            GlslGeneration::Es300 => "#version 300 es\n",
            GlslGeneration::V110 => "#version 110\n",
            GlslGeneration::V130 => "#version 130\n",
            GlslGeneration::V140 => "#version 140\n",
            GlslGeneration::V330 => "#version 330\n",
            GlslGeneration::V400 => "#version 400\n",
            GlslGeneration::V420 => "#version 420\n",
        }
    }

    pub fn is_es(self) -> bool {
        matches!(self, GlslGeneration::Es100 | GlslGeneration::Es300)
    }

    /// Whether `texture()` replaces `texture2D()` and friends.
    pub fn has_unified_texture_function(self) -> bool {
        !matches!(self, GlslGeneration::Es100 | GlslGeneration::V110)
    }

    /// Whether fragment outputs are declared `out` instead of using `gl_FragColor`.
    pub fn has_out_variables(self) -> bool {
        self.has_unified_texture_function()
    }
}

/// Target-specific capability and driver-workaround flags consumed by the
/// code generators.
#[derive(Debug, Clone, PartialEq)]
pub struct ShaderCaps {
    pub generation: GlslGeneration,
    pub uses_precision_modifiers: bool,
    pub can_use_min_and_abs_together: bool,
    pub remove_pow_with_constant_exponent: bool,
    pub must_force_negated_atan_param_to_float: bool,
    pub can_use_fract_for_negative_values: bool,
    pub can_use_fragcoord: bool,
    pub rewrite_do_while_loops: bool,
    pub can_use_do_while: bool,
    pub unfolded_short_circuit_as_ternary: bool,
    pub builtin_determinant_support: bool,
    pub builtin_inverse_support: bool,
    pub builtin_transpose_support: bool,
    pub add_and_true_to_loop_condition: bool,
    pub emulate_abs_int_function: bool,
    pub fbfetch_support: bool,
    pub gs_invocations_support: bool,
    pub shader_derivative_extension_string: Option<String>,
    pub flat_interpolation_support: bool,
    pub no_perspective_interpolation_support: bool,
    pub sample_variables_support: bool,
    pub external_texture_support: bool,
    pub incomplete_short_int_precision: bool,
    pub must_guard_division_even_after_explicit_zero_check: bool,
    pub can_use_any_function_in_shader: bool,
}

impl ShaderCaps {
    /// A fully capable desktop target with no workarounds enabled.
    pub fn standalone() -> Self {
        ShaderCaps {
            generation: GlslGeneration::V400,
            uses_precision_modifiers: false,
            can_use_min_and_abs_together: true,
            remove_pow_with_constant_exponent: false,
            must_force_negated_atan_param_to_float: false,
            can_use_fract_for_negative_values: true,
            can_use_fragcoord: true,
            rewrite_do_while_loops: false,
            can_use_do_while: true,
            unfolded_short_circuit_as_ternary: false,
            builtin_determinant_support: true,
            builtin_inverse_support: true,
            builtin_transpose_support: true,
            add_and_true_to_loop_condition: false,
            emulate_abs_int_function: false,
            fbfetch_support: false,
            gs_invocations_support: true,
            shader_derivative_extension_string: None,
            flat_interpolation_support: true,
            no_perspective_interpolation_support: true,
            sample_variables_support: true,
            external_texture_support: true,
            incomplete_short_int_precision: false,
            must_guard_division_even_after_explicit_zero_check: false,
            can_use_any_function_in_shader: true,
        }
    }

    /// An ES 2 class mobile target with every workaround switched on.
    pub fn legacy_es2() -> Self {
        ShaderCaps {
            generation: GlslGeneration::Es100,
            uses_precision_modifiers: true,
            can_use_min_and_abs_together: false,
            remove_pow_with_constant_exponent: true,
            must_force_negated_atan_param_to_float: true,
            can_use_fract_for_negative_values: false,
            can_use_fragcoord: true,
            rewrite_do_while_loops: true,
            can_use_do_while: false,
            unfolded_short_circuit_as_ternary: true,
            builtin_determinant_support: false,
            builtin_inverse_support: false,
            builtin_transpose_support: false,
            add_and_true_to_loop_condition: true,
            emulate_abs_int_function: true,
            fbfetch_support: false,
            gs_invocations_support: false,
            shader_derivative_extension_string: Some("GL_OES_standard_derivatives".to_string()),
            flat_interpolation_support: false,
            no_perspective_interpolation_support: false,
            sample_variables_support: false,
            external_texture_support: false,
            incomplete_short_int_precision: true,
            must_guard_division_even_after_explicit_zero_check: true,
            can_use_any_function_in_shader: false,
        }
    }
}

impl Default for ShaderCaps {
    fn default() -> Self {
        Self::standalone()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Render target is bottom-up; fragment Y and derivative signs need flipping.
    pub flip_y: bool,
    /// Multiply `sk_FragCoord.w` back out (w holds 1/w on some targets).
    pub inverse_w: bool,
    pub force_high_precision: bool,
    /// Bias texture lookups by -0.5 to sharpen mip selection.
    pub sharpen_textures: bool,
    /// Node-count above which a function called more than once is not inlined.
    pub inline_threshold: usize,
    /// Run the inliner after IR generation.
    pub optimize: bool,
    pub caps: ShaderCaps,
    pub cap_values: BTreeMap<String, CapValue>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            flip_y: false,
            inverse_w: false,
            force_high_precision: false,
            sharpen_textures: false,
            inline_threshold: 50,
            optimize: true,
            caps: ShaderCaps::standalone(),
            cap_values: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Parses a `name=value` pair into the `sk_Caps` table. Values are
    /// `true`/`false`, integers, or floats.
    pub fn set_cap_from_str(&mut self, assignment: &str) -> Result<(), String> {
        let (name, value) = assignment
            .split_once('=')
            .ok_or_else(|| format!("expected name=value, got '{}'", assignment))?;
        let name = name.trim();
        let value = value.trim();
        let parsed = match value {
            "true" => CapValue::Bool(true),
            "false" => CapValue::Bool(false),
            _ => {
                if let Ok(i) = value.parse::<i64>() {
                    CapValue::Int(i)
                } else if let Ok(f) = value.parse::<f64>() {
                    CapValue::Float(f)
                } else {
                    return Err(format!("invalid value '{}' for capability '{}'", value, name));
                }
            }
        };
        self.cap_values.insert(name.to_string(), parsed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_assignments_parse() {
        let mut settings = Settings::default();
        settings.set_cap_from_str("integerSupport=true").unwrap();
        settings.set_cap_from_str("maxSamples = 4").unwrap();
        settings.set_cap_from_str("scale=0.5").unwrap();
        assert_eq!(settings.cap_values["integerSupport"], CapValue::Bool(true));
        assert_eq!(settings.cap_values["maxSamples"], CapValue::Int(4));
        assert_eq!(settings.cap_values["scale"], CapValue::Float(0.5));
        assert!(settings.set_cap_from_str("broken").is_err());
        assert!(settings.set_cap_from_str("x=maybe").is_err());
    }
}
