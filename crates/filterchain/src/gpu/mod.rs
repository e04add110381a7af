//! GPU abstraction used by the filter stages.
//!
//! Stages never talk to a graphics API directly; they go through [`GpuBackend`],
//! which models the small slice of a GL-style API the pipeline needs:
//! - programs compiled from GLSL 450 sources with a single uniform block,
//!   one sampled texture and two `vec2` vertex streams,
//! - RGBA8 textures and framebuffers wrapping exactly one colour texture,
//! - quad draws into a framebuffer or the display at a viewport,
//! - synchronous readback of a framebuffer.
//!
//! Coordinates follow GL conventions: viewports are measured from the
//! bottom-left corner and [`GpuBackend::read_pixels`] returns rows bottom to top.
//!
//! Two implementations exist:
//! - `wgpu_backend` renders headless through `wgpu`; `context` and `pipeline`
//!   hold its device wiring and pipeline cache.
//! - `recording` is a CPU backend that records every call and paints
//!   predictable marker pixels, for tests and dry runs.

mod context;
mod pipeline;
pub mod recording;
mod wgpu_backend;

use std::fmt;
use std::str::FromStr;

use anyhow::Result;

use crate::error::FilterResult;
use crate::types::{Rect, Size};

pub use recording::{GpuCall, RecordingBackend};
pub use wgpu_backend::{PowerPreference, WgpuBackend, WgpuOptions};

macro_rules! gpu_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) u64);

        impl $name {
            pub fn raw(&self) -> u64 {
                self.0
            }
        }
    };
}

gpu_handle!(
    /// Linked vertex + fragment program.
    ProgramId
);
gpu_handle!(
    /// RGBA8 2D texture.
    TextureId
);
gpu_handle!(
    /// Vertex buffer holding `vec2` attributes.
    BufferId
);
gpu_handle!(
    /// Off-screen render target with one colour attachment.
    FramebufferId
);

/// Sources handed to the backend once the program has passed validation.
#[derive(Debug, Clone, Copy)]
pub struct ProgramSource<'a> {
    pub label: &'a str,
    pub vertex: &'a str,
    pub fragment: &'a str,
    /// Byte size of the `FilterParams` uniform block.
    pub uniform_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderTarget {
    Framebuffer(FramebufferId),
    Display,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendMode {
    Replace,
    /// `src * SRC_COLOR + dst * DST_ALPHA`, the overlay blend.
    Overlay,
}

/// One textured quad draw.
#[derive(Debug, Clone, Copy)]
pub struct DrawCall<'a> {
    pub program: ProgramId,
    pub positions: BufferId,
    pub tex_coords: BufferId,
    pub texture: TextureId,
    pub uniforms: &'a [u8],
    pub target: RenderTarget,
    pub viewport: Rect,
    pub blend: BlendMode,
    /// Clears the whole target before drawing when set.
    pub clear: Option<[f32; 4]>,
}

/// Count of GPU objects currently alive in a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveObjects {
    pub programs: usize,
    pub buffers: usize,
    pub textures: usize,
    pub framebuffers: usize,
}

impl LiveObjects {
    pub fn total(&self) -> usize {
        self.programs + self.buffers + self.textures + self.framebuffers
    }
}

pub trait GpuBackend {
    fn label(&self) -> &str;

    fn create_program(&mut self, source: &ProgramSource<'_>) -> FilterResult<ProgramId>;
    fn delete_program(&mut self, program: ProgramId);

    fn create_vertex_buffer(&mut self, data: &[f32]) -> FilterResult<BufferId>;
    fn delete_buffer(&mut self, buffer: BufferId);

    fn create_texture(&mut self, size: Size) -> FilterResult<TextureId>;
    /// Replaces the whole texture; `rgba` must hold exactly `width * height * 4` bytes.
    fn upload_texture(&mut self, texture: TextureId, rgba: &[u8]) -> FilterResult<()>;
    fn delete_texture(&mut self, texture: TextureId);

    fn create_framebuffer(&mut self, color: TextureId) -> FilterResult<FramebufferId>;
    fn delete_framebuffer(&mut self, framebuffer: FramebufferId);

    fn configure_display(&mut self, size: Size) -> FilterResult<()>;
    fn draw(&mut self, call: &DrawCall<'_>) -> FilterResult<()>;

    /// Reads the framebuffer's colour attachment into `out` as tightly packed
    /// RGBA8, bottom row first. Returns the framebuffer size.
    fn read_pixels(&mut self, framebuffer: FramebufferId, out: &mut Vec<u8>)
        -> FilterResult<Size>;

    /// Submits everything drawn to the display since the last call.
    fn present(&mut self) -> FilterResult<()>;

    fn live_objects(&self) -> LiveObjects;
}

pub type BoxedBackend = Box<dyn GpuBackend>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Wgpu,
    Recording,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Wgpu => f.write_str("wgpu"),
            BackendKind::Recording => f.write_str("recording"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "wgpu" | "gpu" => Ok(BackendKind::Wgpu),
            "recording" | "cpu" | "dry-run" => Ok(BackendKind::Recording),
            other => Err(format!(
                "unknown backend '{other}'; expected wgpu or recording"
            )),
        }
    }
}

/// Builds a backend of the requested kind. Must be called on the thread that
/// will own the GPU context.
pub fn create_backend(kind: BackendKind, options: WgpuOptions) -> Result<BoxedBackend> {
    match kind {
        BackendKind::Wgpu => Ok(Box::new(WgpuBackend::new(options)?)),
        BackendKind::Recording => Ok(Box::new(RecordingBackend::new())),
    }
}
