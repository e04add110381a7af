use std::collections::HashMap;

use anyhow::Result;
use wgpu::util::DeviceExt;

use crate::error::{FilterError, FilterResult, ShaderKind};
use crate::types::{Rect, Size};

use super::context::GpuContext;
use super::pipeline::{PipelineLayouts, ProgramPipelines, TARGET_FORMAT};
use super::{
    BlendMode, BufferId, DrawCall, FramebufferId, GpuBackend, LiveObjects, ProgramId, ProgramSource,
    RenderTarget, TextureId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerPreference {
    #[default]
    Low,
    High,
}

/// Adapter selection for [`WgpuBackend`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WgpuOptions {
    pub power: PowerPreference,
    /// Prefer a software adapter, useful on machines without a GPU.
    pub force_fallback_adapter: bool,
}

struct GpuTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    size: Size,
}

impl GpuTexture {
    fn new(device: &wgpu::Device, size: Size, label: &str) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: extent(size),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TARGET_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::COPY_SRC
                | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Self {
            texture,
            view,
            size,
        }
    }
}

struct ReadbackBuffer {
    buffer: wgpu::Buffer,
    size: wgpu::BufferAddress,
}

/// Headless `wgpu` implementation of [`GpuBackend`].
///
/// The display is an off-screen texture of the configured size; `present`
/// only flushes outstanding work.
pub struct WgpuBackend {
    context: GpuContext,
    layouts: PipelineLayouts,
    next_id: u64,
    programs: HashMap<ProgramId, ProgramPipelines>,
    buffers: HashMap<BufferId, wgpu::Buffer>,
    textures: HashMap<TextureId, GpuTexture>,
    framebuffers: HashMap<FramebufferId, TextureId>,
    display: Option<GpuTexture>,
    readback: Option<ReadbackBuffer>,
    label: String,
}

impl WgpuBackend {
    pub fn new(options: WgpuOptions) -> Result<Self> {
        let context = GpuContext::new(&options)?;
        let layouts = PipelineLayouts::new(&context.device);
        let label = format!("wgpu ({})", context.adapter_name);
        Ok(Self {
            context,
            layouts,
            next_id: 0,
            programs: HashMap::new(),
            buffers: HashMap::new(),
            textures: HashMap::new(),
            framebuffers: HashMap::new(),
            display: None,
            readback: None,
            label,
        })
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_dimensions(&self, size: Size) -> FilterResult<()> {
        let max = self.context.max_texture_dimension;
        if size.is_empty() || size.width > max || size.height > max {
            return Err(FilterError::Resource(format!(
                "texture size {size} outside supported range 1..={max}"
            )));
        }
        Ok(())
    }

    fn ensure_readback_buffer(&mut self, required: wgpu::BufferAddress) {
        let reuse = self
            .readback
            .as_ref()
            .is_some_and(|readback| readback.size >= required);
        if !reuse {
            let buffer = self.context.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("filterchain readback"),
                size: required,
                usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
                mapped_at_creation: false,
            });
            self.readback = Some(ReadbackBuffer {
                buffer,
                size: required,
            });
        }
    }
}

fn extent(size: Size) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: size.width,
        height: size.height,
        depth_or_array_layers: 1,
    }
}

fn padded_bytes_per_row(width: u32) -> u32 {
    let unpadded = width * 4;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    unpadded.div_ceil(align) * align
}

impl GpuBackend for WgpuBackend {
    fn label(&self) -> &str {
        &self.label
    }

    fn create_program(&mut self, source: &ProgramSource<'_>) -> FilterResult<ProgramId> {
        let device = &self.context.device;
        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let mut pipelines = ProgramPipelines::new(
            device,
            source.label,
            source.vertex,
            source.fragment,
            source.uniform_size,
        );
        pipelines.pipeline(device, &self.layouts, BlendMode::Replace);
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(FilterError::Compile {
                label: source.label.to_string(),
                stage: ShaderKind::Fragment,
                message: err.to_string(),
            });
        }
        let id = ProgramId(self.allocate_id());
        self.programs.insert(id, pipelines);
        Ok(id)
    }

    fn delete_program(&mut self, program: ProgramId) {
        self.programs.remove(&program);
    }

    fn create_vertex_buffer(&mut self, data: &[f32]) -> FilterResult<BufferId> {
        let buffer = self
            .context
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("quad vertices"),
                contents: bytemuck::cast_slice(data),
                usage: wgpu::BufferUsages::VERTEX,
            });
        let id = BufferId(self.allocate_id());
        self.buffers.insert(id, buffer);
        Ok(id)
    }

    fn delete_buffer(&mut self, buffer: BufferId) {
        if let Some(buffer) = self.buffers.remove(&buffer) {
            buffer.destroy();
        }
    }

    fn create_texture(&mut self, size: Size) -> FilterResult<TextureId> {
        self.check_dimensions(size)?;
        let texture = GpuTexture::new(&self.context.device, size, "filter texture");
        let id = TextureId(self.allocate_id());
        self.textures.insert(id, texture);
        Ok(id)
    }

    fn upload_texture(&mut self, texture: TextureId, rgba: &[u8]) -> FilterResult<()> {
        let target = self
            .textures
            .get(&texture)
            .ok_or_else(|| FilterError::Resource(format!("unknown texture {}", texture.raw())))?;
        if rgba.len() != target.size.rgba_len() {
            return Err(FilterError::Resource(format!(
                "texture upload of {} bytes does not match {} texture",
                rgba.len(),
                target.size
            )));
        }
        self.context.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            rgba,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(target.size.width * 4),
                rows_per_image: Some(target.size.height),
            },
            extent(target.size),
        );
        Ok(())
    }

    fn delete_texture(&mut self, texture: TextureId) {
        if let Some(texture) = self.textures.remove(&texture) {
            texture.texture.destroy();
        }
    }

    fn create_framebuffer(&mut self, color: TextureId) -> FilterResult<FramebufferId> {
        if !self.textures.contains_key(&color) {
            return Err(FilterError::Resource(format!(
                "framebuffer colour attachment {} does not exist",
                color.raw()
            )));
        }
        let id = FramebufferId(self.allocate_id());
        self.framebuffers.insert(id, color);
        Ok(id)
    }

    fn delete_framebuffer(&mut self, framebuffer: FramebufferId) {
        self.framebuffers.remove(&framebuffer);
    }

    fn configure_display(&mut self, size: Size) -> FilterResult<()> {
        self.check_dimensions(size)?;
        if self.display.as_ref().is_some_and(|display| display.size == size) {
            return Ok(());
        }
        self.display = Some(GpuTexture::new(&self.context.device, size, "display"));
        tracing::debug!(%size, "configured display target");
        Ok(())
    }

    fn draw(&mut self, call: &DrawCall<'_>) -> FilterResult<()> {
        let (target_view, target_size) = match call.target {
            RenderTarget::Framebuffer(framebuffer) => {
                let texture = self
                    .framebuffers
                    .get(&framebuffer)
                    .and_then(|texture| self.textures.get(texture))
                    .ok_or_else(|| {
                        FilterError::Resource(format!("unknown framebuffer {}", framebuffer.raw()))
                    })?;
                (&texture.view, texture.size)
            }
            RenderTarget::Display => {
                let display = self.display.as_ref().ok_or_else(|| {
                    FilterError::Resource("display target is not configured".to_string())
                })?;
                (&display.view, display.size)
            }
        };
        let source = self.textures.get(&call.texture).ok_or_else(|| {
            FilterError::Resource(format!("unknown texture {}", call.texture.raw()))
        })?;
        let positions = self.buffers.get(&call.positions);
        let tex_coords = self.buffers.get(&call.tex_coords);
        let (Some(positions), Some(tex_coords)) = (positions, tex_coords) else {
            return Err(FilterError::Resource("unknown vertex buffer".to_string()));
        };
        let program = self.programs.get_mut(&call.program).ok_or_else(|| {
            FilterError::Resource(format!("unknown program {}", call.program.raw()))
        })?;

        let device = &self.context.device;
        let mut uniforms = call.uniforms.to_vec();
        let uniform_len = (program.uniform_size as usize).max(uniforms.len()).max(16);
        uniforms.resize(uniform_len.next_multiple_of(16), 0);
        let uniform_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("filter uniforms"),
            contents: &uniforms,
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("filter bind group"),
            layout: &self.layouts.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&source.view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::Sampler(&self.layouts.sampler),
                },
            ],
        });
        let pipeline = program.pipeline(device, &self.layouts, call.blend);

        let load = match call.clear {
            Some([r, g, b, a]) => wgpu::LoadOp::Clear(wgpu::Color {
                r: f64::from(r),
                g: f64::from(g),
                b: f64::from(b),
                a: f64::from(a),
            }),
            None => wgpu::LoadOp::Load,
        };

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("filter draw"),
        });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("filter pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: target_view,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            // Viewports use the bottom-left origin; with the flipped clip space
            // that is also the first row in texture memory.
            if let Some(Rect {
                x,
                y,
                width,
                height,
            }) = call.viewport.clamp_to(target_size)
            {
                pass.set_viewport(x as f32, y as f32, width as f32, height as f32, 0.0, 1.0);
                pass.set_pipeline(pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.set_vertex_buffer(0, positions.slice(..));
                pass.set_vertex_buffer(1, tex_coords.slice(..));
                pass.draw(0..4, 0..1);
            }
        }
        self.context.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn read_pixels(
        &mut self,
        framebuffer: FramebufferId,
        out: &mut Vec<u8>,
    ) -> FilterResult<Size> {
        let size = self
            .framebuffers
            .get(&framebuffer)
            .and_then(|texture| self.textures.get(texture))
            .map(|texture| texture.size)
            .ok_or_else(|| {
                FilterError::Resource(format!("unknown framebuffer {}", framebuffer.raw()))
            })?;
        let padded_row = padded_bytes_per_row(size.width);
        let required = wgpu::BufferAddress::from(padded_row) * wgpu::BufferAddress::from(size.height);
        self.ensure_readback_buffer(required);

        let (Some(readback), Some(texture)) = (
            self.readback.as_ref(),
            self.framebuffers
                .get(&framebuffer)
                .and_then(|texture| self.textures.get(texture)),
        ) else {
            return Err(FilterError::Resource("readback target vanished".to_string()));
        };

        let device = &self.context.device;
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("filter readback"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &texture.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &readback.buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(size.height),
                },
            },
            extent(size),
        );
        self.context.queue.submit(Some(encoder.finish()));

        let slice = readback.buffer.slice(..required);
        let (tx, rx) = crossbeam_channel::bounded(1);
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        device
            .poll(wgpu::PollType::Wait)
            .map_err(|err| FilterError::Resource(format!("GPU poll failed: {err}")))?;
        rx.recv()
            .map_err(|_| FilterError::Resource("readback channel closed".to_string()))?
            .map_err(|err| FilterError::Resource(format!("readback map failed: {err}")))?;

        {
            let mapped = slice.get_mapped_range();
            let row_bytes = size.width as usize * 4;
            out.clear();
            out.reserve(size.rgba_len());
            for row in mapped.chunks(padded_row as usize).take(size.height as usize) {
                out.extend_from_slice(&row[..row_bytes]);
            }
        }
        readback.buffer.unmap();
        Ok(size)
    }

    fn present(&mut self) -> FilterResult<()> {
        self.context
            .device
            .poll(wgpu::PollType::Poll)
            .map_err(|err| FilterError::Resource(format!("GPU poll failed: {err}")))?;
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

    #[test]
    fn rows_are_padded_to_copy_alignment() {
        assert_eq!(padded_bytes_per_row(64), 256);
        assert_eq!(padded_bytes_per_row(65), 512);
        assert_eq!(padded_bytes_per_row(1), 256);
    }
}
