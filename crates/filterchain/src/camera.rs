//! Camera collaborator seam.
//!
//! The host asks its [`CameraSource`] for the latest frame once per tick. Real
//! devices live outside this crate; [`SyntheticCamera`] produces moving colour
//! bars so the pipeline can run headless.

use crate::error::FilterResult;
use crate::gpu::{GpuBackend, TextureId};
use crate::matrix::{Mat4, IDENTITY};
use crate::types::Size;

/// One camera frame as seen by the render thread. The texture is borrowed for
/// the duration of the tick; the source keeps ownership.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraFrame {
    pub texture: TextureId,
    pub size: Size,
    /// Sensor to texture-coordinate mapping for this frame.
    pub transform: Mat4,
}

pub trait CameraSource: Send {
    /// Returns the latest frame, or `None` when nothing new is available.
    /// Must not block.
    fn acquire(&mut self, gpu: &mut dyn GpuBackend) -> FilterResult<Option<CameraFrame>>;

    /// Called on the render thread when the preview resolution changes.
    fn on_preview_size_changed(&mut self, _size: Size) {}

    /// Releases every GPU object owned by the source.
    fn release(&mut self, gpu: &mut dyn GpuBackend);
}

const BARS: [[u8; 4]; 8] = [
    [235, 235, 235, 255],
    [235, 235, 16, 255],
    [16, 235, 235, 255],
    [16, 235, 16, 255],
    [235, 16, 235, 255],
    [235, 16, 16, 255],
    [16, 16, 235, 255],
    [16, 16, 16, 255],
];

/// Colour-bar generator. Bars scroll one column per frame unless motion is off.
#[derive(Debug)]
pub struct SyntheticCamera {
    size: Size,
    motion: bool,
    frame: u64,
    texture: Option<(TextureId, Size)>,
    pixels: Vec<u8>,
}

impl SyntheticCamera {
    pub fn new(size: Size) -> Self {
        Self {
            size,
            motion: true,
            frame: 0,
            texture: None,
            pixels: Vec::new(),
        }
    }

    pub fn with_motion(mut self, motion: bool) -> Self {
        self.motion = motion;
        self
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn frames_produced(&self) -> u64 {
        self.frame
    }

    fn paint(&mut self) {
        let Size { width, height } = self.size;
        self.pixels.resize(self.size.rgba_len(), 0);
        let shift = if self.motion { self.frame as u32 } else { 0 };
        let bar_width = (width / BARS.len() as u32).max(1);
        for y in 0..height {
            let row = (y * width * 4) as usize;
            for x in 0..width {
                let bar = (((x + shift) % width) / bar_width) as usize;
                let colour = BARS[bar.min(BARS.len() - 1)];
                let offset = row + (x * 4) as usize;
                self.pixels[offset..offset + 4].copy_from_slice(&colour);
            }
        }
    }

    fn texture(&mut self, gpu: &mut dyn GpuBackend) -> FilterResult<TextureId> {
        match self.texture {
            Some((texture, size)) if size == self.size => Ok(texture),
            previous => {
                if let Some((texture, _)) = previous {
                    gpu.delete_texture(texture);
                    self.texture = None;
                }
                let texture = gpu.create_texture(self.size)?;
                self.texture = Some((texture, self.size));
                Ok(texture)
            }
        }
    }
}

impl CameraSource for SyntheticCamera {
    fn acquire(&mut self, gpu: &mut dyn GpuBackend) -> FilterResult<Option<CameraFrame>> {
        if self.size.is_empty() {
            return Ok(None);
        }
        let texture = self.texture(gpu)?;
        self.paint();
        gpu.upload_texture(texture, &self.pixels)?;
        self.frame += 1;
        Ok(Some(CameraFrame {
            texture,
            size: self.size,
            transform: IDENTITY,
        }))
    }

    fn on_preview_size_changed(&mut self, size: Size) {
        self.size = size;
    }

    fn release(&mut self, gpu: &mut dyn GpuBackend) {
        if let Some((texture, _)) = self.texture.take() {
            gpu.delete_texture(texture);
        }
        self.pixels = Vec::new();
    }
}
