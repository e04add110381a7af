use crate::error::FilterResult;
use crate::gpu::{BufferId, GpuBackend};
use crate::types::Rotation;

/// Full-viewport quad as a triangle strip: bottom-left, bottom-right, top-left, top-right.
pub const POSITION_QUAD: [f32; 8] = [-1.0, -1.0, 1.0, -1.0, -1.0, 1.0, 1.0, 1.0];

const TEXTURE_NO_ROTATION: [f32; 8] = [0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0];
const TEXTURE_ROTATED_90: [f32; 8] = [0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 1.0, 0.0];
const TEXTURE_ROTATED_270: [f32; 8] = [1.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 1.0];

/// Texture coordinates used when drawing the overlay bitmap.
pub const OVERLAY_TEXTURE_COORDINATES: [f32; 8] = [1.0, 1.0, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0];

/// Texture coordinates paired with [`POSITION_QUAD`] for a content rotation.
///
/// Half turns have no table of their own and render unrotated.
pub fn texture_coordinates(rotation: Rotation) -> [f32; 8] {
    match rotation {
        Rotation::Deg90 => TEXTURE_ROTATED_90,
        Rotation::Deg270 => TEXTURE_ROTATED_270,
        Rotation::Deg0 | Rotation::Deg180 => TEXTURE_NO_ROTATION,
    }
}

/// Coordinates for drawing only part of a quad.
///
/// `visible` is `[left, bottom, right, top]` as fractions of the full quad;
/// each corner is interpolated bilinearly from `table`.
pub fn crop_coordinates(table: &[f32; 8], visible: [f32; 4]) -> [f32; 8] {
    let [left, bottom, right, top] = visible;
    let sample = |x: f32, y: f32| -> [f32; 2] {
        let weights = [(1.0 - x) * (1.0 - y), x * (1.0 - y), (1.0 - x) * y, x * y];
        let mut out = [0.0; 2];
        for (corner, weight) in weights.iter().enumerate() {
            out[0] += table[corner * 2] * weight;
            out[1] += table[corner * 2 + 1] * weight;
        }
        out
    };
    let corners = [
        sample(left, bottom),
        sample(right, bottom),
        sample(left, top),
        sample(right, top),
    ];
    let mut coordinates = [0.0; 8];
    for (index, [u, v]) in corners.into_iter().enumerate() {
        coordinates[index * 2] = u;
        coordinates[index * 2 + 1] = v;
    }
    coordinates
}

/// Vertex buffers for one quad: positions plus a coordinate table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryBuffers {
    pub positions: BufferId,
    pub tex_coords: BufferId,
}

impl GeometryBuffers {
    pub fn create(gpu: &mut dyn GpuBackend, rotation: Rotation) -> FilterResult<Self> {
        Self::with_coordinates(gpu, &texture_coordinates(rotation))
    }

    pub fn with_coordinates(gpu: &mut dyn GpuBackend, coordinates: &[f32; 8]) -> FilterResult<Self> {
        let positions = gpu.create_vertex_buffer(&POSITION_QUAD)?;
        let tex_coords = match gpu.create_vertex_buffer(coordinates) {
            Ok(buffer) => buffer,
            Err(err) => {
                gpu.delete_buffer(positions);
                return Err(err);
            }
        };
        Ok(Self {
            positions,
            tex_coords,
        })
    }

    pub fn destroy(self, gpu: &mut dyn GpuBackend) {
        gpu.delete_buffer(self.positions);
        gpu.delete_buffer(self.tex_coords);
    }
}
