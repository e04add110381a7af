//! Column-major 4x4 helpers for the texture transform.
//!
//! Matrices follow the OpenGL layout (`m[column * 4 + row]`), which is also what
//! std140 expects for a `mat4` uniform, so they are uploaded without transposing.

use crate::types::Size;

pub type Mat4 = [f32; 16];

pub const IDENTITY: Mat4 = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

/// Orthographic projection, same parameters as `glOrtho`.
pub fn ortho(left: f32, right: f32, bottom: f32, top: f32, near: f32, far: f32) -> Mat4 {
    let mut m = [0.0; 16];
    m[0] = 2.0 / (right - left);
    m[5] = 2.0 / (top - bottom);
    m[10] = -2.0 / (far - near);
    m[12] = -(right + left) / (right - left);
    m[13] = -(top + bottom) / (top - bottom);
    m[14] = -(far + near) / (far - near);
    m[15] = 1.0;
    m
}

/// Returns `lhs * rhs`.
pub fn multiply(lhs: &Mat4, rhs: &Mat4) -> Mat4 {
    let mut out = [0.0; 16];
    for column in 0..4 {
        for row in 0..4 {
            out[column * 4 + row] = (0..4)
                .map(|k| lhs[k * 4 + row] * rhs[column * 4 + k])
                .sum();
        }
    }
    out
}

/// Applies `m` to the point `(x, y, 0, 1)` and returns the resulting `(x, y)`.
pub fn transform_point(m: &Mat4, x: f32, y: f32) -> (f32, f32) {
    (
        m[0] * x + m[4] * y + m[12],
        m[1] * x + m[5] * y + m[13],
    )
}

fn long_over_short(size: Size) -> f32 {
    let long = size.width.max(size.height) as f32;
    let short = size.width.min(size.height) as f32;
    long / short
}

/// Projection that compensates for the display and preview having different
/// aspect ratios. Identity until both sizes are known.
pub fn display_projection(display: Size, preview: Size) -> Mat4 {
    if display.is_empty() || preview.is_empty() {
        return IDENTITY;
    }
    let aspect = long_over_short(display) / long_over_short(preview);
    if display.width > display.height {
        ortho(-1.0, 1.0, -aspect, aspect, -1.0, 1.0)
    } else {
        ortho(-aspect, aspect, -1.0, 1.0, -1.0, 1.0)
    }
}

/// Shrinks `display` so it has the preview's aspect ratio without growing either side.
pub fn fit_display_to_preview(display: Size, preview: Size) -> Size {
    if display.is_empty() || preview.is_empty() {
        return display;
    }
    let (dw, dh) = (u64::from(display.width), u64::from(display.height));
    let (pw, ph) = (u64::from(preview.width), u64::from(preview.height));
    if dw < dh * pw / ph {
        Size::new(display.width, (dw * ph / pw) as u32)
    } else {
        Size::new((dh * pw / ph) as u32, display.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(lhs: &Mat4, rhs: &Mat4) -> bool {
        lhs.iter().zip(rhs).all(|(a, b)| (a - b).abs() < 1e-5)
    }

    #[test]
    fn identity_is_neutral() {
        let m = ortho(-2.0, 2.0, -1.0, 1.0, -1.0, 1.0);
        assert!(approx_eq(&multiply(&IDENTITY, &m), &m));
        assert!(approx_eq(&multiply(&m, &IDENTITY), &m));
    }

    #[test]
    fn ortho_maps_bounds_to_clip_space() {
        let m = ortho(-2.0, 2.0, -0.5, 0.5, -1.0, 1.0);
        let (x, y) = transform_point(&m, 2.0, -0.5);
        assert!((x - 1.0).abs() < 1e-6);
        assert!((y + 1.0).abs() < 1e-6);
    }

    #[test]
    fn multiply_applies_rhs_first() {
        let scale = ortho(-2.0, 2.0, -2.0, 2.0, -1.0, 1.0);
        let mut translate = IDENTITY;
        translate[12] = 1.0;
        let combined = multiply(&translate, &scale);
        let (x, _) = transform_point(&combined, 2.0, 0.0);
        assert!((x - 2.0).abs() < 1e-6);
    }

    #[test]
    fn projection_keeps_xy_for_matching_aspects() {
        let m = display_projection(Size::new(1920, 1080), Size::new(1280, 720));
        let (x, y) = transform_point(&m, 0.25, -0.75);
        assert!((x - 0.25).abs() < 1e-6);
        assert!((y + 0.75).abs() < 1e-6);
    }

    #[test]
    fn projection_is_identity_until_sizes_are_known() {
        assert_eq!(display_projection(Size::new(0, 720), Size::new(1280, 720)), IDENTITY);
    }

    #[test]
    fn projection_stretches_vertical_axis_on_wide_display() {
        // 2:1 display showing a 4:3 preview.
        let m = display_projection(Size::new(800, 400), Size::new(640, 480));
        let aspect = 2.0 / (4.0 / 3.0);
        assert!((m[0] - 1.0).abs() < 1e-6);
        assert!((m[5] - 1.0 / aspect).abs() < 1e-6);
    }

    #[test]
    fn fit_display_keeps_preview_aspect() {
        assert_eq!(
            fit_display_to_preview(Size::new(1080, 1920), Size::new(1280, 720)),
            Size::new(1080, 607)
        );
        assert_eq!(
            fit_display_to_preview(Size::new(1920, 1200), Size::new(1280, 720)),
            Size::new(1920, 1080)
        );
        assert_eq!(
            fit_display_to_preview(Size::new(2000, 1080), Size::new(1280, 720)),
            Size::new(1920, 1080)
        );
    }
}
