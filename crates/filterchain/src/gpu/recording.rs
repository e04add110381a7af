//! CPU backend that records calls instead of rendering.
//!
//! Every draw paints its clamped viewport with a marker pixel:
//!
//! ```text
//!   [ program id, first byte of the sampled texture, 0x00 (replace) | 0xFF (overlay), 0xFF ]
//! ```
//!
//! which is enough to tell which program wrote where, what it sampled and
//! whether the overlay blend was active.

use std::collections::HashMap;

use crate::error::{FilterError, FilterResult};
use crate::types::{Rect, Size};

use super::{
    BlendMode, BufferId, DrawCall, FramebufferId, GpuBackend, LiveObjects, ProgramId,
    ProgramSource, RenderTarget, TextureId,
};

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq)]
pub enum GpuCall {
    CreateProgram { id: ProgramId, label: String },
    DeleteProgram(ProgramId),
    CreateBuffer(BufferId),
    DeleteBuffer(BufferId),
    CreateTexture { id: TextureId, size: Size },
    UploadTexture(TextureId),
    DeleteTexture(TextureId),
    CreateFramebuffer { id: FramebufferId, color: TextureId },
    DeleteFramebuffer(FramebufferId),
    ConfigureDisplay(Size),
    Draw {
        program: ProgramId,
        texture: TextureId,
        target: RenderTarget,
        viewport: Rect,
        blend: BlendMode,
        uniforms: Vec<u8>,
    },
    ReadPixels(FramebufferId),
    Present,
}

#[derive(Debug)]
struct CpuTexture {
    size: Size,
    pixels: Vec<u8>,
}

impl CpuTexture {
    fn new(size: Size) -> Self {
        Self {
            size,
            pixels: vec![0; size.rgba_len()],
        }
    }

    fn clear(&mut self, color: [f32; 4]) {
        let pixel = color.map(|channel| (channel.clamp(0.0, 1.0) * 255.0).round() as u8);
        for chunk in self.pixels.chunks_exact_mut(4) {
            chunk.copy_from_slice(&pixel);
        }
    }

    fn fill(&mut self, viewport: Rect, pixel: [u8; 4]) {
        let Some(area) = viewport.clamp_to(self.size) else {
            return;
        };
        let stride = self.size.width as usize * 4;
        for row in area.y as usize..(area.y as usize + area.height as usize) {
            let start = row * stride + area.x as usize * 4;
            let end = start + area.width as usize * 4;
            for chunk in self.pixels[start..end].chunks_exact_mut(4) {
                chunk.copy_from_slice(&pixel);
            }
        }
    }
}

/// Backend that keeps all state in memory and logs every call.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    next_id: u64,
    programs: HashMap<ProgramId, String>,
    buffers: HashMap<BufferId, Vec<f32>>,
    textures: HashMap<TextureId, CpuTexture>,
    framebuffers: HashMap<FramebufferId, TextureId>,
    display: Option<CpuTexture>,
    calls: Vec<GpuCall>,
    failing_framebuffers: usize,
    failing_buffers: usize,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` framebuffer allocations fail with a resource error.
    pub fn fail_framebuffer_allocations(&mut self, count: usize) {
        self.failing_framebuffers = count;
    }

    /// Makes the next `count` vertex buffer allocations fail with a resource error.
    pub fn fail_buffer_allocations(&mut self, count: usize) {
        self.failing_buffers = count;
    }

    pub fn calls(&self) -> &[GpuCall] {
        &self.calls
    }

    pub fn take_calls(&mut self) -> Vec<GpuCall> {
        std::mem::take(&mut self.calls)
    }

    pub fn program_label(&self, program: ProgramId) -> Option<&str> {
        self.programs.get(&program).map(String::as_str)
    }

    pub fn buffer_contents(&self, buffer: BufferId) -> Option<&[f32]> {
        self.buffers.get(&buffer).map(Vec::as_slice)
    }

    pub fn texture_pixels(&self, texture: TextureId) -> Option<&[u8]> {
        self.textures.get(&texture).map(|texture| texture.pixels.as_slice())
    }

    pub fn display_pixels(&self) -> Option<&[u8]> {
        self.display.as_ref().map(|display| display.pixels.as_slice())
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

impl GpuBackend for RecordingBackend {
    fn label(&self) -> &str {
        "recording"
    }

    fn create_program(&mut self, source: &ProgramSource<'_>) -> FilterResult<ProgramId> {
        let id = ProgramId(self.allocate_id());
        self.programs.insert(id, source.label.to_string());
        self.calls.push(GpuCall::CreateProgram {
            id,
            label: source.label.to_string(),
        });
        Ok(id)
    }

    fn delete_program(&mut self, program: ProgramId) {
        if self.programs.remove(&program).is_some() {
            self.calls.push(GpuCall::DeleteProgram(program));
        }
    }

    fn create_vertex_buffer(&mut self, data: &[f32]) -> FilterResult<BufferId> {
        if self.failing_buffers > 0 {
            self.failing_buffers -= 1;
            return Err(FilterError::Resource("vertex buffer allocation failed".to_string()));
        }
        let id = BufferId(self.allocate_id());
        self.buffers.insert(id, data.to_vec());
        self.calls.push(GpuCall::CreateBuffer(id));
        Ok(id)
    }

    fn delete_buffer(&mut self, buffer: BufferId) {
        if self.buffers.remove(&buffer).is_some() {
            self.calls.push(GpuCall::DeleteBuffer(buffer));
        }
    }

    fn create_texture(&mut self, size: Size) -> FilterResult<TextureId> {
        if size.is_empty() {
            return Err(FilterError::Resource(format!(
                "cannot create a {size} texture"
            )));
        }
        let id = TextureId(self.allocate_id());
        self.textures.insert(id, CpuTexture::new(size));
        self.calls.push(GpuCall::CreateTexture { id, size });
        Ok(id)
    }

    fn upload_texture(&mut self, texture: TextureId, rgba: &[u8]) -> FilterResult<()> {
        let target = self
            .textures
            .get_mut(&texture)
            .ok_or_else(|| FilterError::Resource(format!("unknown texture {}", texture.raw())))?;
        if rgba.len() != target.pixels.len() {
            return Err(FilterError::Resource(format!(
                "texture upload of {} bytes does not match {} texture",
                rgba.len(),
                target.size
            )));
        }
        target.pixels.copy_from_slice(rgba);
        self.calls.push(GpuCall::UploadTexture(texture));
        Ok(())
    }

    fn delete_texture(&mut self, texture: TextureId) {
        if self.textures.remove(&texture).is_some() {
            self.calls.push(GpuCall::DeleteTexture(texture));
        }
    }

    fn create_framebuffer(&mut self, color: TextureId) -> FilterResult<FramebufferId> {
        if self.failing_framebuffers > 0 {
            self.failing_framebuffers -= 1;
            return Err(FilterError::Resource(
                "framebuffer allocation failed".to_string(),
            ));
        }
        if !self.textures.contains_key(&color) {
            return Err(FilterError::Resource(format!(
                "framebuffer colour attachment {} does not exist",
                color.raw()
            )));
        }
        let id = FramebufferId(self.allocate_id());
        self.framebuffers.insert(id, color);
        self.calls.push(GpuCall::CreateFramebuffer { id, color });
        Ok(id)
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferId) {
        if self.framebuffers.remove(&framebuffer).is_some() {
            self.calls.push(GpuCall::DeleteFramebuffer(framebuffer));
        }
    }

    fn configure_display(&mut self, size: Size) -> FilterResult<()> {
        if size.is_empty() {
            return Err(FilterError::Resource(format!(
                "cannot configure a {size} display"
            )));
        }
        self.display = Some(CpuTexture::new(size));
        self.calls.push(GpuCall::ConfigureDisplay(size));
        Ok(())
    }

    fn draw(&mut self, call: &DrawCall<'_>) -> FilterResult<()> {
        if !self.programs.contains_key(&call.program) {
            return Err(FilterError::Resource(format!(
                "unknown program {}",
                call.program.raw()
            )));
        }
        for buffer in [call.positions, call.tex_coords] {
            if !self.buffers.contains_key(&buffer) {
                return Err(FilterError::Resource(format!(
                    "unknown vertex buffer {}",
                    buffer.raw()
                )));
            }
        }
        let sampled = self
            .textures
            .get(&call.texture)
            .map(|texture| texture.pixels.first().copied().unwrap_or(0))
            .ok_or_else(|| {
                FilterError::Resource(format!("unknown texture {}", call.texture.raw()))
            })?;
        let blend_marker = match call.blend {
            BlendMode::Replace => 0x00,
            BlendMode::Overlay => 0xFF,
        };
        let pixel = [call.program.0 as u8, sampled, blend_marker, 0xFF];

        let target = match call.target {
            RenderTarget::Framebuffer(framebuffer) => {
                let texture = self.framebuffers.get(&framebuffer).copied().ok_or_else(|| {
                    FilterError::Resource(format!("unknown framebuffer {}", framebuffer.raw()))
                })?;
                if texture == call.texture {
                    return Err(FilterError::Resource(
                        "draw samples its own render target".to_string(),
                    ));
                }
                self.textures.get_mut(&texture)
            }
            RenderTarget::Display => self.display.as_mut(),
        }
        .ok_or_else(|| FilterError::Resource("render target is not configured".to_string()))?;

        if let Some(color) = call.clear {
            target.clear(color);
        }
        target.fill(call.viewport, pixel);

        self.calls.push(GpuCall::Draw {
            program: call.program,
            texture: call.texture,
            target: call.target,
            viewport: call.viewport,
            blend: call.blend,
            uniforms: call.uniforms.to_vec(),
        });
        Ok(())
    }

    fn read_pixels(
        &mut self,
        framebuffer: FramebufferId,
        out: &mut Vec<u8>,
    ) -> FilterResult<Size> {
        let texture = self
            .framebuffers
            .get(&framebuffer)
            .and_then(|texture| self.textures.get(texture))
            .ok_or_else(|| {
                FilterError::Resource(format!("unknown framebuffer {}", framebuffer.raw()))
            })?;
        out.clear();
        out.extend_from_slice(&texture.pixels);
        let size = texture.size;
        self.calls.push(GpuCall::ReadPixels(framebuffer));
        Ok(size)
    }

    fn present(&mut self) -> FilterResult<()> {
        self.calls.push(GpuCall::Present);
        Ok(())
    }

    fn live_objects(&self) -> LiveObjects {
        LiveObjects {
            programs: self.programs.len(),
            buffers: self.buffers.len(),
            textures: self.textures.len(),
            framebuffers: self.framebuffers.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad(gpu: &mut RecordingBackend) -> (BufferId, BufferId) {
        let positions = gpu.create_vertex_buffer(&[0.0; 8]).unwrap();
        let coords = gpu.create_vertex_buffer(&[0.0; 8]).unwrap();
        (positions, coords)
    }

    #[test]
    fn draw_paints_marker_inside_viewport_only() {
        let mut gpu = RecordingBackend::new();
        let program = gpu
            .create_program(&ProgramSource {
                label: "marker",
                vertex: "",
                fragment: "",
                uniform_size: 0,
            })
            .unwrap();
        let (positions, tex_coords) = quad(&mut gpu);
        let source = gpu.create_texture(Size::new(1, 1)).unwrap();
        gpu.upload_texture(source, &[42, 0, 0, 255]).unwrap();
        let color = gpu.create_texture(Size::new(4, 2)).unwrap();
        let framebuffer = gpu.create_framebuffer(color).unwrap();

        gpu.draw(&DrawCall {
            program,
            positions,
            tex_coords,
            texture: source,
            uniforms: &[],
            target: RenderTarget::Framebuffer(framebuffer),
            viewport: Rect::new(2, 1, 10, 10),
            blend: BlendMode::Overlay,
            clear: Some([0.0, 0.0, 0.0, 0.0]),
        })
        .unwrap();

        let mut pixels = Vec::new();
        assert_eq!(gpu.read_pixels(framebuffer, &mut pixels).unwrap(), Size::new(4, 2));
        let marker = [program.0 as u8, 42, 0xFF, 0xFF];
        // Bottom row untouched, top row painted from x = 2.
        assert_eq!(&pixels[0..16], &[0u8; 16]);
        assert_eq!(&pixels[16..24], &[0u8; 8]);
        assert_eq!(&pixels[24..28], &marker);
        assert_eq!(&pixels[28..32], &marker);
    }

    #[test]
    fn injected_framebuffer_failures_are_consumed() {
        let mut gpu = RecordingBackend::new();
        let color = gpu.create_texture(Size::new(2, 2)).unwrap();
        gpu.fail_framebuffer_allocations(1);
        assert!(gpu.create_framebuffer(color).unwrap_err().is_resource());
        assert!(gpu.create_framebuffer(color).is_ok());
    }
}
