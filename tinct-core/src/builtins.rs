//! Built-in declarations compiled into the root scope of every program.
//!
//! Intrinsic functions are declared in shading-language source over the
//! generic placeholder types (`$genType` and friends) and resolved to
//! concrete overloads at each call site. Built-in variables carry a
//! `layout(builtin = N)` id that the backends map to their own names.

use crate::settings::ProgramKind;

pub const SK_POSITION_BUILTIN: i32 = 0;
pub const SK_POINTSIZE_BUILTIN: i32 = 1;
pub const SK_CLIPDISTANCE_BUILTIN: i32 = 3;
pub const SK_INVOCATIONID_BUILTIN: i32 = 8;
pub const SK_FRAGCOORD_BUILTIN: i32 = 15;
pub const SK_CLOCKWISE_BUILTIN: i32 = 17;
pub const SK_SAMPLEMASKIN_BUILTIN: i32 = 20;
pub const SK_VERTEXID_BUILTIN: i32 = 42;
pub const SK_INSTANCEID_BUILTIN: i32 = 43;
pub const SK_FRAGCOLOR_BUILTIN: i32 = 10001;
pub const SK_IN_BUILTIN: i32 = 10002;
pub const SK_LASTFRAGCOLOR_BUILTIN: i32 = 10008;
pub const SK_MAIN_COORDS_BUILTIN: i32 = 10009;
pub const SK_WIDTH_BUILTIN: i32 = 10011;
pub const SK_HEIGHT_BUILTIN: i32 = 10012;
pub const SK_SAMPLEMASK_BUILTIN: i32 = 10020;

/// Name of the uniform (or interface block field) holding the render-target
/// adjustment applied to `sk_Position`.
pub const SK_RTADJUST_NAME: &str = "sk_RTAdjust";

/// Intrinsic functions shared by every program kind.
pub const BUILTIN_FUNCTIONS: &str = r#"
$genType radians($genType degrees);
$genHType radians($genHType degrees);
$genType degrees($genType radians);
$genHType degrees($genHType radians);
$genType sin($genType angle);
$genHType sin($genHType angle);
$genType cos($genType angle);
$genHType cos($genHType angle);
$genType tan($genType angle);
$genHType tan($genHType angle);
$genType asin($genType x);
$genHType asin($genHType x);
$genType acos($genType x);
$genHType acos($genHType x);
$genType atan($genType y, $genType x);
$genHType atan($genHType y, $genHType x);
$genType atan($genType y_over_x);
$genHType atan($genHType y_over_x);

$genType pow($genType x, $genType y);
$genHType pow($genHType x, $genHType y);
$genType exp($genType x);
$genHType exp($genHType x);
$genType log($genType x);
$genHType log($genHType x);
$genType exp2($genType x);
$genHType exp2($genHType x);
$genType log2($genType x);
$genHType log2($genHType x);
$genType sqrt($genType x);
$genHType sqrt($genHType x);
$genType inversesqrt($genType x);
$genHType inversesqrt($genHType x);

$genType abs($genType x);
$genHType abs($genHType x);
$genIType abs($genIType x);
$genType sign($genType x);
$genHType sign($genHType x);
$genIType sign($genIType x);
$genType floor($genType x);
$genHType floor($genHType x);
$genType ceil($genType x);
$genHType ceil($genHType x);
$genType fract($genType x);
$genHType fract($genHType x);
$genType trunc($genType x);
$genHType trunc($genHType x);
$genType round($genType x);
$genHType round($genHType x);
$genType mod($genType x, float y);
$genType mod($genType x, $genType y);
$genHType mod($genHType x, half y);
$genHType mod($genHType x, $genHType y);
$genType min($genType x, $genType y);
$genType min($genType x, float y);
$genHType min($genHType x, $genHType y);
$genHType min($genHType x, half y);
$genIType min($genIType x, $genIType y);
$genIType min($genIType x, int y);
$genUType min($genUType x, $genUType y);
$genUType min($genUType x, uint y);
$genType max($genType x, $genType y);
$genType max($genType x, float y);
$genHType max($genHType x, $genHType y);
$genHType max($genHType x, half y);
$genIType max($genIType x, $genIType y);
$genIType max($genIType x, int y);
$genUType max($genUType x, $genUType y);
$genUType max($genUType x, uint y);
$genType clamp($genType x, $genType minVal, $genType maxVal);
$genType clamp($genType x, float minVal, float maxVal);
$genHType clamp($genHType x, $genHType minVal, $genHType maxVal);
$genHType clamp($genHType x, half minVal, half maxVal);
$genIType clamp($genIType x, $genIType minVal, $genIType maxVal);
$genIType clamp($genIType x, int minVal, int maxVal);
$genType saturate($genType x);
$genHType saturate($genHType x);
$genType mix($genType x, $genType y, $genType a);
$genType mix($genType x, $genType y, float a);
$genHType mix($genHType x, $genHType y, $genHType a);
$genHType mix($genHType x, $genHType y, half a);
$genType mix($genType x, $genType y, $genBType a);
$genType step($genType edge, $genType x);
$genType step(float edge, $genType x);
$genHType step($genHType edge, $genHType x);
$genHType step(half edge, $genHType x);
$genType smoothstep($genType edge0, $genType edge1, $genType x);
$genType smoothstep(float edge0, float edge1, $genType x);
$genHType smoothstep($genHType edge0, $genHType edge1, $genHType x);
$genHType smoothstep(half edge0, half edge1, $genHType x);
$genType fma($genType a, $genType b, $genType c);

float length($genType x);
half length($genHType x);
float distance($genType p0, $genType p1);
half distance($genHType p0, $genHType p1);
float dot($genType x, $genType y);
half dot($genHType x, $genHType y);
float3 cross(float3 x, float3 y);
half3 cross(half3 x, half3 y);
$genType normalize($genType x);
$genHType normalize($genHType x);
$genType faceforward($genType N, $genType I, $genType Nref);
$genHType faceforward($genHType N, $genHType I, $genHType Nref);
$genType reflect($genType I, $genType N);
$genHType reflect($genHType I, $genHType N);
$genType refract($genType I, $genType N, float eta);
$genHType refract($genHType I, $genHType N, float eta);

$mat matrixCompMult($mat x, $mat y);
$hmat matrixCompMult($hmat x, $hmat y);
$squareMat transpose($squareMat m);
$squareHMat transpose($squareHMat m);
float2x3 transpose(float3x2 m);
float3x2 transpose(float2x3 m);
float2x4 transpose(float4x2 m);
float4x2 transpose(float2x4 m);
float3x4 transpose(float4x3 m);
float4x3 transpose(float3x4 m);
float determinant($squareMat m);
half determinant($squareHMat m);
$squareMat inverse($squareMat m);
$squareHMat inverse($squareHMat m);

$bvec lessThan($vec x, $vec y);
$bvec lessThan($hvec x, $hvec y);
$bvec lessThan($ivec x, $ivec y);
$bvec lessThan($uvec x, $uvec y);
$bvec lessThanEqual($vec x, $vec y);
$bvec lessThanEqual($hvec x, $hvec y);
$bvec lessThanEqual($ivec x, $ivec y);
$bvec lessThanEqual($uvec x, $uvec y);
$bvec greaterThan($vec x, $vec y);
$bvec greaterThan($hvec x, $hvec y);
$bvec greaterThan($ivec x, $ivec y);
$bvec greaterThan($uvec x, $uvec y);
$bvec greaterThanEqual($vec x, $vec y);
$bvec greaterThanEqual($hvec x, $hvec y);
$bvec greaterThanEqual($ivec x, $ivec y);
$bvec greaterThanEqual($uvec x, $uvec y);
$bvec equal($vec x, $vec y);
$bvec equal($hvec x, $hvec y);
$bvec equal($ivec x, $ivec y);
$bvec equal($uvec x, $uvec y);
$bvec equal($bvec x, $bvec y);
$bvec notEqual($vec x, $vec y);
$bvec notEqual($hvec x, $hvec y);
$bvec notEqual($ivec x, $ivec y);
$bvec notEqual($uvec x, $uvec y);
$bvec notEqual($bvec x, $bvec y);
bool any($bvec x);
bool all($bvec x);
$bvec not($bvec x);

$genType dFdx($genType p);
$genHType dFdx($genHType p);
$genType dFdy($genType p);
$genHType dFdy($genHType p);
$genType fwidth($genType p);
$genHType fwidth($genHType p);

half4 sample(sampler2D s, float2 P);
half4 sample(sampler2D s, float3 P);
half4 sample(sampler2D s, float2 P, float bias);
half4 sample(samplerExternalOES s, float2 P);
half4 sample(sampler2DRect s, float2 P);
half4 sample(fragmentProcessor? fp);
half4 sample(fragmentProcessor? fp, float2 coords);
half4 sample(fragmentProcessor? fp, float3x3 transform);

sk_has_side_effects void EmitVertex();
sk_has_side_effects void EndPrimitive();
"#;

const VERTEX_VARIABLES: &str = r#"
out sk_PerVertex {
    layout(builtin=0) float4 sk_Position;
    layout(builtin=1) float sk_PointSize;
};
layout(builtin=42) in int sk_VertexID;
layout(builtin=43) in int sk_InstanceID;
"#;

const FRAGMENT_VARIABLES: &str = r#"
layout(builtin=15) float4 sk_FragCoord;
layout(builtin=17) bool sk_Clockwise;
layout(builtin=20) in int sk_SampleMaskIn[1];
layout(builtin=10020) out int sk_SampleMask[1];
layout(location=0, index=0, builtin=10001) out half4 sk_FragColor;
layout(builtin=10008) half4 sk_LastFragColor;
layout(builtin=10011) uniform float sk_Width;
layout(builtin=10012) uniform float sk_Height;
"#;

const GEOMETRY_VARIABLES: &str = r#"
layout(builtin=10002) in sk_PerVertex {
    layout(builtin=0) float4 sk_Position;
    layout(builtin=1) float sk_PointSize;
} sk_in[];
out sk_PerVertex {
    layout(builtin=0) float4 sk_Position;
    layout(builtin=1) float sk_PointSize;
};
layout(builtin=8) in int sk_InvocationID;
"#;

const PIPELINE_VARIABLES: &str = r#"
layout(builtin=15) float4 sk_FragCoord;
layout(builtin=10009) float2 sk_SampleCoord;
"#;

/// Built-in variable declarations visible to a program of `kind`.
pub fn variables_source(kind: ProgramKind) -> &'static str {
    match kind {
        ProgramKind::Vertex => VERTEX_VARIABLES,
        ProgramKind::Fragment => FRAGMENT_VARIABLES,
        ProgramKind::Geometry => GEOMETRY_VARIABLES,
        ProgramKind::Pipeline => PIPELINE_VARIABLES,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::parser::Parser;
    use crate::types::Context;

    fn parses(source: &str) {
        let names = Context::new().named_types().map(|(n, _)| n.clone()).collect();
        let tokens = tokenize(source).unwrap();
        let mut parser = Parser::new(tokens, names);
        let file = parser.parse().unwrap();
        assert!(!file.children.is_empty());
    }

    #[test]
    fn builtin_sources_parse() {
        parses(BUILTIN_FUNCTIONS);
        for kind in [ProgramKind::Vertex, ProgramKind::Fragment, ProgramKind::Geometry, ProgramKind::Pipeline] {
            parses(variables_source(kind));
        }
    }
}
