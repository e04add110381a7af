//! Filter stages: the units the host renders every frame.
//!
//! A stage goes through `Inert -> init -> Ready | Failed -> render* -> destroy -> Destroyed`.
//! `Failed` holds no GPU objects and accepts another `init`.
//! Other threads never touch a stage directly; they push [`StageCommand`]s
//! through a [`StageHandle`] and the render thread drains them, in order,
//! right before the next draw.

mod basic;
mod composite;

use std::sync::Arc;

use crossbeam_channel::Sender;
use image::RgbaImage;

use crate::compile::UniformValue;
use crate::error::FilterResult;
use crate::gpu::{FramebufferId, GpuBackend, TextureId};
use crate::matrix::Mat4;
use crate::types::{FilterSpec, OverlayPlacement, Rotation, Size};

pub use basic::{FilterStage, FramebufferTarget};
pub use composite::{decode_overlay, overlay_rect, CompositeFilterStage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Inert,
    Ready,
    Failed,
    Destroyed,
}

/// Result of a render call. The two sentinels mean nothing was drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutput {
    /// The off-screen texture now holding this frame.
    Drawn(TextureId),
    Uninitialized,
    NoFramebuffer,
}

/// Deferred mutation applied on the render thread before the next draw.
#[derive(Debug, Clone)]
pub enum StageCommand {
    SetUniform { name: String, value: UniformValue },
    SetOverlayImage(Arc<RgbaImage>),
    SetOverlayPlacement(OverlayPlacement),
}

/// Cloneable sender into one stage's command queue.
///
/// Commands sent after the stage is dropped are discarded.
#[derive(Debug, Clone)]
pub struct StageHandle {
    label: Arc<str>,
    sender: Sender<StageCommand>,
}

impl StageHandle {
    pub(crate) fn new(label: &str, sender: Sender<StageCommand>) -> Self {
        Self {
            label: Arc::from(label),
            sender,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Queues `command`; returns `false` when the stage no longer exists.
    pub fn send(&self, command: StageCommand) -> bool {
        self.sender.send(command).is_ok()
    }

    pub fn set_uniform(&self, name: impl Into<String>, value: UniformValue) -> bool {
        self.send(StageCommand::SetUniform {
            name: name.into(),
            value,
        })
    }
}

/// The closed set of stage variants the host can run.
#[derive(Debug)]
pub enum Stage {
    Basic(FilterStage),
    Composite(CompositeFilterStage),
}

macro_rules! dispatch {
    ($self:ident, $stage:ident => $body:expr) => {
        match $self {
            Stage::Basic($stage) => $body,
            Stage::Composite($stage) => $body,
        }
    };
}

impl Stage {
    pub fn new(spec: FilterSpec, rotation: Rotation, clear_color: [f32; 4]) -> Self {
        if spec.is_composite() {
            Stage::Composite(CompositeFilterStage::new(spec, rotation, clear_color))
        } else {
            Stage::Basic(FilterStage::new(spec, rotation, clear_color))
        }
    }

    pub fn spec(&self) -> &FilterSpec {
        dispatch!(self, stage => stage.spec())
    }

    pub fn state(&self) -> StageState {
        dispatch!(self, stage => stage.state())
    }

    pub fn handle(&self) -> StageHandle {
        dispatch!(self, stage => stage.handle())
    }

    pub fn init(&mut self, gpu: &mut dyn GpuBackend) -> FilterResult<()> {
        dispatch!(self, stage => stage.init(gpu))
    }

    pub fn on_input_size_changed(&mut self, gpu: &mut dyn GpuBackend, size: Size) -> FilterResult<()> {
        dispatch!(self, stage => stage.on_input_size_changed(gpu, size))
    }

    pub fn on_display_size_changed(&mut self, size: Size) {
        dispatch!(self, stage => stage.on_display_size_changed(size))
    }

    pub fn set_texture_transform(&mut self, transform: &Mat4) {
        dispatch!(self, stage => stage.set_texture_transform(transform))
    }

    pub fn set_time(&mut self, seconds: f32) {
        dispatch!(self, stage => stage.set_time(seconds))
    }

    pub fn render(&mut self, gpu: &mut dyn GpuBackend, input: TextureId) -> FilterResult<RenderOutput> {
        dispatch!(self, stage => stage.render(gpu, input))
    }

    pub fn read_pixels(&self, gpu: &mut dyn GpuBackend, out: &mut Vec<u8>) -> FilterResult<Size> {
        dispatch!(self, stage => stage.read_pixels(gpu, out))
    }

    pub fn framebuffer(&self) -> Option<FramebufferId> {
        dispatch!(self, stage => stage.framebuffer())
    }

    pub fn destroy(&mut self, gpu: &mut dyn GpuBackend) {
        dispatch!(self, stage => stage.destroy(gpu))
    }
}
