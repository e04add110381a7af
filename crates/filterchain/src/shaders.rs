//! GLSL sources shared by every stage.
//!
//! Filters are written as a `mainImage(out vec4 color, in vec2 uv)` body. [`wrap_fragment`]
//! prepends [`FRAGMENT_HEADER`] (inputs, uniform block, texture bindings) and appends
//! [`FRAGMENT_FOOTER`] which calls `mainImage` with the transformed texture coordinate.
//!
//! The `FilterParams` block is std140 and identical in both stages:
//!
//! | member             | offset | size |
//! |--------------------|--------|------|
//! | `textureTransform` | 0      | 64   |
//! | `tint`             | 64     | 16   |
//! | `texelSize`        | 80     | 8    |
//! | `intensity`        | 88     | 4    |
//! | `time`             | 92     | 4    |

use crate::types::FilterSpec;

pub const VERTEX_SHADER: &str = r"#version 450
layout(location = 0) in vec2 position;
layout(location = 1) in vec2 inputTextureCoordinate;
layout(location = 0) out vec2 textureCoordinate;

layout(std140, set = 0, binding = 0) uniform FilterParams {
    mat4 textureTransform;
    vec4 tint;
    vec2 texelSize;
    float intensity;
    float time;
} params;

void main() {
    textureCoordinate = (params.textureTransform * vec4(inputTextureCoordinate, 0.0, 1.0)).xy;
    gl_Position = vec4(position, 0.0, 1.0);
#ifdef FLIP_Y
    gl_Position.y = -gl_Position.y;
#endif
}
";

pub const FRAGMENT_HEADER: &str = r"#version 450
layout(location = 0) in vec2 textureCoordinate;
layout(location = 0) out vec4 fragColor;

layout(std140, set = 0, binding = 0) uniform FilterParams {
    mat4 textureTransform;
    vec4 tint;
    vec2 texelSize;
    float intensity;
    float time;
} params;

layout(set = 0, binding = 1) uniform texture2D inputImage;
layout(set = 0, binding = 2) uniform sampler inputSampler;

#define inputImageTexture sampler2D(inputImage, inputSampler)
";

pub const FRAGMENT_FOOTER: &str = r"
void main() {
    vec4 color = vec4(0.0);
    mainImage(color, textureCoordinate);
    fragColor = color;
}
";

pub const IDENTITY_BODY: &str = r"void mainImage(out vec4 color, in vec2 uv) {
    color = texture(inputImageTexture, uv) * params.tint;
}
";

pub const GRAYSCALE_BODY: &str = r"void mainImage(out vec4 color, in vec2 uv) {
    vec4 source = texture(inputImageTexture, uv);
    float luma = dot(source.rgb, vec3(0.299, 0.587, 0.114));
    color = vec4(mix(source.rgb, vec3(luma), params.intensity), source.a);
}
";

pub const SEPIA_BODY: &str = r"void mainImage(out vec4 color, in vec2 uv) {
    vec4 source = texture(inputImageTexture, uv);
    vec3 toned = vec3(
        dot(source.rgb, vec3(0.393, 0.769, 0.189)),
        dot(source.rgb, vec3(0.349, 0.686, 0.168)),
        dot(source.rgb, vec3(0.272, 0.534, 0.131))
    );
    color = vec4(mix(source.rgb, min(toned, vec3(1.0)), params.intensity), source.a);
}
";

pub const INVERT_BODY: &str = r"void mainImage(out vec4 color, in vec2 uv) {
    vec4 source = texture(inputImageTexture, uv);
    color = vec4(mix(source.rgb, vec3(1.0) - source.rgb, params.intensity), source.a);
}
";

/// Straight texture copy used by the overlay and blit passes.
pub const BLIT_BODY: &str = r"void mainImage(out vec4 color, in vec2 uv) {
    color = texture(inputImageTexture, uv);
}
";

/// Fragment body for a built-in or custom filter.
pub fn fragment_body(spec: &FilterSpec) -> &str {
    match spec {
        FilterSpec::Identity | FilterSpec::Rotation(_) | FilterSpec::Watermark => IDENTITY_BODY,
        FilterSpec::Grayscale => GRAYSCALE_BODY,
        FilterSpec::Sepia => SEPIA_BODY,
        FilterSpec::Invert => INVERT_BODY,
        FilterSpec::Custom { fragment, .. } => fragment,
    }
}

/// Produces a complete fragment shader from a `mainImage` body.
///
/// Any `#version` directive in the body is dropped so the header's wins, and a
/// `#line 1` directive keeps error locations relative to the body.
pub fn wrap_fragment(body: &str) -> String {
    let mut sanitized = String::with_capacity(body.len());
    for line in body.lines() {
        if line.trim_start().starts_with("#version") {
            continue;
        }
        sanitized.push_str(line);
        sanitized.push('\n');
    }
    format!("{FRAGMENT_HEADER}\n#line 1\n{sanitized}{FRAGMENT_FOOTER}")
}
