use std::sync::Arc;

use image::RgbaImage;

use crate::compile::{ShaderProgram, UniformBlock, UniformValue};
use crate::error::{FilterError, FilterResult};
use crate::geometry::{
    crop_coordinates, texture_coordinates, GeometryBuffers, OVERLAY_TEXTURE_COORDINATES,
};
use crate::gpu::{BlendMode, DrawCall, FramebufferId, GpuBackend, RenderTarget, TextureId};
use crate::matrix::{Mat4, IDENTITY};
use crate::shaders::{wrap_fragment, BLIT_BODY, VERTEX_SHADER};
use crate::types::{FilterSpec, OverlayAnchor, OverlayPlacement, Rect, Rotation, Size};

use super::basic::FramebufferTarget;
use super::{FilterStage, RenderOutput, StageCommand, StageHandle, StageState};

/// Decodes overlay bytes (PNG, JPEG, BMP or GIF) into RGBA on the calling thread.
pub fn decode_overlay(bytes: &[u8]) -> FilterResult<Arc<RgbaImage>> {
    let decoded =
        image::load_from_memory(bytes).map_err(|err| FilterError::Overlay(err.to_string()))?;
    let rgba = decoded.to_rgba8();
    if rgba.width() == 0 || rgba.height() == 0 {
        return Err(FilterError::Overlay("overlay image is empty".to_string()));
    }
    Ok(Arc::new(rgba))
}

/// Overlay viewport inside an `input`-sized target, origin bottom-left.
pub fn overlay_rect(placement: OverlayPlacement, input: Size, overlay: Size) -> Option<Rect> {
    match placement {
        OverlayPlacement::Anchor(anchor) => {
            if input.is_empty() || overlay.is_empty() {
                return None;
            }
            let free_x = input.width as i32 - overlay.width as i32;
            let free_y = input.height as i32 - overlay.height as i32;
            let (x, y) = match anchor {
                OverlayAnchor::LeftBottom => (0, 0),
                OverlayAnchor::RightBottom => (free_x, 0),
                OverlayAnchor::LeftTop => (0, free_y),
                OverlayAnchor::RightTop => (free_x, free_y),
                OverlayAnchor::Center => (free_x / 2, free_y / 2),
            };
            Some(Rect::new(x, y, overlay.width, overlay.height))
        }
        OverlayPlacement::Custom(rect) => {
            let width = if rect.width == 0 {
                overlay.width
            } else {
                rect.width
            };
            let height = if rect.height == 0 {
                overlay.height
            } else {
                rect.height
            };
            (width > 0 && height > 0).then_some(Rect::new(rect.x, rect.y, width, height))
        }
    }
}

/// Part of an overlay rectangle that lies inside the target, plus the texture
/// coordinates that crop the bitmap to it.
#[derive(Debug, Clone, Copy, PartialEq)]
struct VisibleOverlay {
    viewport: Rect,
    coordinates: [f32; 8],
}

impl VisibleOverlay {
    fn new(rect: Rect, target: Size) -> Option<Self> {
        let viewport = rect.clamp_to(target)?;
        let fraction = |offset: i32, origin: i32, extent: u32| (offset - origin) as f32 / extent as f32;
        let visible = [
            fraction(viewport.x, rect.x, rect.width),
            fraction(viewport.y, rect.y, rect.height),
            fraction(viewport.x + viewport.width as i32, rect.x, rect.width),
            fraction(viewport.y + viewport.height as i32, rect.y, rect.height),
        ];
        Some(Self {
            viewport,
            coordinates: crop_coordinates(&OVERLAY_TEXTURE_COORDINATES, visible),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct OverlayTexture {
    texture: TextureId,
    size: Size,
}

/// Watermark stage: base filter pass, overlay blended at a rectangle, then a
/// blit of the composited target onto the display.
#[derive(Debug)]
pub struct CompositeFilterStage {
    base: FilterStage,
    overlay_program: Option<ShaderProgram>,
    overlay_uniforms: Option<UniformBlock>,
    overlay_geometry: Option<GeometryBuffers>,
    /// Coordinates currently held by `overlay_geometry`.
    overlay_coordinates: [f32; 8],
    blit_geometry: Option<GeometryBuffers>,
    overlay: Option<OverlayTexture>,
    placement: OverlayPlacement,
    overlay_rect: Option<Rect>,
    visible_overlay: Option<VisibleOverlay>,
}

impl CompositeFilterStage {
    pub fn new(spec: FilterSpec, rotation: Rotation, clear_color: [f32; 4]) -> Self {
        Self {
            base: FilterStage::new(spec, rotation, clear_color),
            overlay_program: None,
            overlay_uniforms: None,
            overlay_geometry: None,
            overlay_coordinates: OVERLAY_TEXTURE_COORDINATES,
            blit_geometry: None,
            overlay: None,
            placement: OverlayPlacement::default(),
            overlay_rect: None,
            visible_overlay: None,
        }
    }

    pub fn spec(&self) -> &FilterSpec {
        self.base.spec()
    }

    pub fn state(&self) -> StageState {
        self.base.state()
    }

    pub fn handle(&self) -> StageHandle {
        self.base.handle()
    }

    pub fn base(&self) -> &FilterStage {
        &self.base
    }

    pub fn placement(&self) -> OverlayPlacement {
        self.placement
    }

    /// Current overlay viewport; `None` until an overlay image has been uploaded.
    pub fn overlay_viewport(&self) -> Option<Rect> {
        self.overlay_rect
    }

    pub fn overlay_size(&self) -> Option<Size> {
        self.overlay.map(|overlay| overlay.size)
    }

    /// Decodes `bytes` on the calling thread and queues the upload for the render thread.
    pub fn set_overlay_image(&self, bytes: &[u8]) -> FilterResult<()> {
        let image = decode_overlay(bytes)?;
        self.base.enqueue(StageCommand::SetOverlayImage(image));
        Ok(())
    }

    pub fn set_overlay_placement(&self, placement: OverlayPlacement) {
        self.base.enqueue(StageCommand::SetOverlayPlacement(placement));
    }

    pub fn init(&mut self, gpu: &mut dyn GpuBackend) -> FilterResult<()> {
        self.base.init(gpu)?;
        let label = format!("{} overlay", self.base.spec().name());
        let program =
            match ShaderProgram::compile(gpu, &label, VERTEX_SHADER, &wrap_fragment(BLIT_BODY)) {
                Ok(program) => program,
                Err(err) => {
                    self.base.mark_failed(gpu);
                    return Err(err);
                }
            };
        let overlay_geometry =
            match GeometryBuffers::with_coordinates(gpu, &OVERLAY_TEXTURE_COORDINATES) {
                Ok(geometry) => geometry,
                Err(err) => {
                    program.destroy(gpu);
                    self.base.mark_failed(gpu);
                    return Err(err);
                }
            };
        let blit_geometry =
            match GeometryBuffers::with_coordinates(gpu, &texture_coordinates(Rotation::Deg0)) {
                Ok(geometry) => geometry,
                Err(err) => {
                    overlay_geometry.destroy(gpu);
                    program.destroy(gpu);
                    self.base.mark_failed(gpu);
                    return Err(err);
                }
            };

        let mut uniforms = program.uniform_block();
        uniforms.set("textureTransform", UniformValue::Mat4(IDENTITY));
        uniforms.set("tint", UniformValue::Vec4([1.0; 4]));
        uniforms.set("intensity", UniformValue::Float(1.0));
        self.overlay_program = Some(program);
        self.overlay_uniforms = Some(uniforms);
        self.overlay_geometry = Some(overlay_geometry);
        self.overlay_coordinates = OVERLAY_TEXTURE_COORDINATES;
        self.blit_geometry = Some(blit_geometry);
        Ok(())
    }

    pub fn on_input_size_changed(&mut self, gpu: &mut dyn GpuBackend, size: Size) -> FilterResult<()> {
        let result = self.base.on_input_size_changed(gpu, size);
        self.recompute_overlay_rect();
        result
    }

    pub fn on_display_size_changed(&mut self, size: Size) {
        self.base.on_display_size_changed(size);
    }

    pub fn set_texture_transform(&mut self, transform: &Mat4) {
        self.base.set_texture_transform(transform);
    }

    pub fn set_time(&mut self, seconds: f32) {
        self.base.set_time(seconds);
    }

    fn recompute_overlay_rect(&mut self) {
        let overlay = self.overlay.map(|overlay| overlay.size).unwrap_or_default();
        self.overlay_rect = overlay_rect(self.placement, self.base.input_size(), overlay);
        self.visible_overlay = self
            .overlay_rect
            .and_then(|rect| VisibleOverlay::new(rect, self.base.input_size()));
    }

    /// Rebuilds the overlay quad when the visible part of the overlay changed.
    fn sync_overlay_geometry(
        &mut self,
        gpu: &mut dyn GpuBackend,
        coordinates: [f32; 8],
    ) -> FilterResult<()> {
        if coordinates == self.overlay_coordinates {
            return Ok(());
        }
        let geometry = GeometryBuffers::with_coordinates(gpu, &coordinates)?;
        if let Some(previous) = self.overlay_geometry.replace(geometry) {
            previous.destroy(gpu);
        }
        self.overlay_coordinates = coordinates;
        Ok(())
    }

    fn apply(&mut self, gpu: &mut dyn GpuBackend, command: StageCommand) {
        match command {
            StageCommand::SetOverlayImage(image) => {
                if let Err(err) = self.upload_overlay(gpu, &image) {
                    tracing::warn!(%err, "overlay upload failed");
                }
                self.recompute_overlay_rect();
            }
            StageCommand::SetOverlayPlacement(placement) => {
                self.placement = placement;
                self.recompute_overlay_rect();
            }
            StageCommand::SetUniform { .. } => {}
        }
    }

    fn upload_overlay(&mut self, gpu: &mut dyn GpuBackend, image: &RgbaImage) -> FilterResult<()> {
        let size = Size::new(image.width(), image.height());
        let texture = match self.overlay {
            Some(existing) if existing.size == size => existing.texture,
            existing => {
                if let Some(existing) = existing {
                    gpu.delete_texture(existing.texture);
                    self.overlay = None;
                }
                gpu.create_texture(size)?
            }
        };
        self.overlay = Some(OverlayTexture { texture, size });
        gpu.upload_texture(texture, image.as_raw())?;
        tracing::debug!(%size, "uploaded overlay image");
        Ok(())
    }

    pub fn render(&mut self, gpu: &mut dyn GpuBackend, input: TextureId) -> FilterResult<RenderOutput> {
        let target = match self.base.ready_target() {
            Ok(target) => target,
            Err(sentinel) => return Ok(sentinel),
        };
        let mut deferred = Vec::new();
        self.base.drain_commands(|command| deferred.push(command));
        for command in deferred {
            self.apply(gpu, command);
        }

        self.base.draw_offscreen(gpu, input, target)?;
        self.draw_overlay(gpu, target)?;
        self.blit_to_display(gpu, target)?;
        Ok(RenderOutput::Drawn(target.texture))
    }

    fn draw_overlay(&mut self, gpu: &mut dyn GpuBackend, target: FramebufferTarget) -> FilterResult<()> {
        let (Some(overlay), Some(visible)) = (self.overlay, self.visible_overlay) else {
            return Ok(());
        };
        self.sync_overlay_geometry(gpu, visible.coordinates)?;
        let (Some(program), Some(geometry), Some(uniforms)) = (
            &self.overlay_program,
            &self.overlay_geometry,
            &self.overlay_uniforms,
        ) else {
            return Err(FilterError::state("draw overlay", self.state()));
        };
        gpu.draw(&DrawCall {
            program: program.id(),
            positions: geometry.positions,
            tex_coords: geometry.tex_coords,
            texture: overlay.texture,
            uniforms: uniforms.as_bytes(),
            target: RenderTarget::Framebuffer(target.framebuffer),
            viewport: visible.viewport,
            blend: BlendMode::Overlay,
            clear: None,
        })
    }

    fn blit_to_display(&self, gpu: &mut dyn GpuBackend, target: FramebufferTarget) -> FilterResult<()> {
        let display = self.base.display_size();
        if display.is_empty() {
            return Ok(());
        }
        let (Some(program), Some(geometry), Some(uniforms)) = (
            &self.overlay_program,
            &self.blit_geometry,
            &self.overlay_uniforms,
        ) else {
            return Err(FilterError::state("blit to display", self.state()));
        };
        gpu.draw(&DrawCall {
            program: program.id(),
            positions: geometry.positions,
            tex_coords: geometry.tex_coords,
            texture: target.texture,
            uniforms: uniforms.as_bytes(),
            target: RenderTarget::Display,
            viewport: Rect::full(display),
            blend: BlendMode::Replace,
            clear: Some(self.base.clear_color()),
        })
    }

    pub fn read_pixels(&self, gpu: &mut dyn GpuBackend, out: &mut Vec<u8>) -> FilterResult<Size> {
        self.base.read_pixels(gpu, out)
    }

    pub fn framebuffer(&self) -> Option<FramebufferId> {
        self.base.framebuffer()
    }

    pub fn destroy(&mut self, gpu: &mut dyn GpuBackend) {
        if let Some(overlay) = self.overlay.take() {
            gpu.delete_texture(overlay.texture);
        }
        if let Some(geometry) = self.overlay_geometry.take() {
            geometry.destroy(gpu);
        }
        if let Some(geometry) = self.blit_geometry.take() {
            geometry.destroy(gpu);
        }
        if let Some(program) = self.overlay_program.take() {
            program.destroy(gpu);
        }
        self.overlay_uniforms = None;
        self.overlay_rect = None;
        self.visible_overlay = None;
        self.overlay_coordinates = OVERLAY_TEXTURE_COORDINATES;
        self.base.destroy(gpu);
    }
}
