use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::compile::{ShaderProgram, UniformBlock, UniformValue};
use crate::error::{FilterError, FilterResult};
use crate::geometry::GeometryBuffers;
use crate::gpu::{BlendMode, DrawCall, FramebufferId, GpuBackend, RenderTarget, TextureId};
use crate::matrix::{Mat4, IDENTITY};
use crate::shaders::{fragment_body, wrap_fragment, VERTEX_SHADER};
use crate::types::{FilterSpec, Rect, Rotation, Size};

use super::{RenderOutput, StageCommand, StageHandle, StageState};

/// Off-screen render target: a framebuffer and the texture it renders into.
/// Never resized; a new size means a new target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferTarget {
    pub framebuffer: FramebufferId,
    pub texture: TextureId,
    pub size: Size,
}

impl FramebufferTarget {
    fn allocate(gpu: &mut dyn GpuBackend, size: Size) -> FilterResult<Self> {
        let texture = gpu.create_texture(size)?;
        match gpu.create_framebuffer(texture) {
            Ok(framebuffer) => Ok(Self {
                framebuffer,
                texture,
                size,
            }),
            Err(err) => {
                gpu.delete_texture(texture);
                Err(err)
            }
        }
    }

    fn release(self, gpu: &mut dyn GpuBackend) {
        gpu.delete_framebuffer(self.framebuffer);
        gpu.delete_texture(self.texture);
    }
}

/// Single-program filter: renders the input into an off-screen target at
/// input resolution, then again onto the display.
#[derive(Debug)]
pub struct FilterStage {
    spec: FilterSpec,
    state: StageState,
    rotation: Rotation,
    clear_color: [f32; 4],
    program: Option<ShaderProgram>,
    geometry: Option<GeometryBuffers>,
    uniforms: Option<UniformBlock>,
    target: Option<FramebufferTarget>,
    input_size: Size,
    display_size: Size,
    transform: Mat4,
    time: f32,
    sender: Sender<StageCommand>,
    commands: Receiver<StageCommand>,
}

impl FilterStage {
    pub fn new(spec: FilterSpec, rotation: Rotation, clear_color: [f32; 4]) -> Self {
        let rotation = match spec {
            FilterSpec::Rotation(fixed) => fixed,
            _ => rotation,
        };
        let (sender, commands) = unbounded();
        Self {
            spec,
            state: StageState::Inert,
            rotation,
            clear_color,
            program: None,
            geometry: None,
            uniforms: None,
            target: None,
            input_size: Size::default(),
            display_size: Size::default(),
            transform: IDENTITY,
            time: 0.0,
            sender,
            commands,
        }
    }

    pub fn spec(&self) -> &FilterSpec {
        &self.spec
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    pub fn handle(&self) -> StageHandle {
        StageHandle::new(self.spec.name(), self.sender.clone())
    }

    /// Thread-safe append to the command queue.
    pub fn enqueue(&self, command: StageCommand) {
        // The receiver lives as long as `self`, so this cannot fail here.
        let _ = self.sender.send(command);
    }

    pub fn framebuffer(&self) -> Option<FramebufferId> {
        self.target.map(|target| target.framebuffer)
    }

    pub fn output_texture(&self) -> Option<TextureId> {
        self.target.map(|target| target.texture)
    }

    pub fn target(&self) -> Option<FramebufferTarget> {
        self.target
    }

    pub fn input_size(&self) -> Size {
        self.input_size
    }

    pub fn display_size(&self) -> Size {
        self.display_size
    }

    pub fn uniforms(&self) -> Option<&UniformBlock> {
        self.uniforms.as_ref()
    }

    /// Compiles the program and allocates the quad. A `Failed` stage may be
    /// initialised again; everything from the failed attempt is already released.
    pub fn init(&mut self, gpu: &mut dyn GpuBackend) -> FilterResult<()> {
        if !matches!(self.state, StageState::Inert | StageState::Failed) {
            return Err(FilterError::state("initialise stage", self.state));
        }
        let label = self.spec.name().to_string();
        let fragment = wrap_fragment(fragment_body(&self.spec));
        let program = match ShaderProgram::compile(gpu, &label, VERTEX_SHADER, &fragment) {
            Ok(program) => program,
            Err(err) => {
                self.state = StageState::Failed;
                return Err(err);
            }
        };
        let geometry = match GeometryBuffers::create(gpu, self.rotation) {
            Ok(geometry) => geometry,
            Err(err) => {
                program.destroy(gpu);
                self.state = StageState::Failed;
                return Err(err);
            }
        };

        let mut uniforms = program.uniform_block();
        uniforms.set("textureTransform", UniformValue::Mat4(self.transform));
        uniforms.set("tint", UniformValue::Vec4([1.0; 4]));
        uniforms.set("intensity", UniformValue::Float(1.0));
        uniforms.set("time", UniformValue::Float(self.time));

        self.program = Some(program);
        self.geometry = Some(geometry);
        self.uniforms = Some(uniforms);
        self.state = StageState::Ready;
        tracing::debug!(filter = %label, rotation = self.rotation.degrees(), "filter stage ready");

        if !self.input_size.is_empty() {
            // A failed allocation is logged and retried on the next size change.
            let size = self.input_size;
            let _ = self.allocate_target(gpu, size);
        }
        Ok(())
    }

    /// Ensures the off-screen target matches `size`. Zero sizes and an
    /// unchanged size with a live target are no-ops.
    pub fn on_input_size_changed(&mut self, gpu: &mut dyn GpuBackend, size: Size) -> FilterResult<()> {
        if size.is_empty() {
            return Ok(());
        }
        self.input_size = size;
        if self.state != StageState::Ready {
            // Allocated by `init` once the program exists.
            return Ok(());
        }
        if self.target.is_some_and(|target| target.size == size) {
            return Ok(());
        }
        self.allocate_target(gpu, size)
    }

    fn allocate_target(&mut self, gpu: &mut dyn GpuBackend, size: Size) -> FilterResult<()> {
        if let Some(previous) = self.target.take() {
            previous.release(gpu);
        }
        let target = FramebufferTarget::allocate(gpu, size).inspect_err(|err| {
            tracing::warn!(%size, %err, "off-screen target allocation failed");
        })?;
        tracing::debug!(
            %size,
            framebuffer = target.framebuffer.raw(),
            "allocated off-screen target"
        );
        self.target = Some(target);
        if let Some(uniforms) = self.uniforms.as_mut() {
            uniforms.set(
                "texelSize",
                UniformValue::Vec2([1.0 / size.width as f32, 1.0 / size.height as f32]),
            );
        }
        Ok(())
    }

    pub fn on_display_size_changed(&mut self, size: Size) {
        self.display_size = size;
    }

    pub fn set_texture_transform(&mut self, transform: &Mat4) {
        self.transform = *transform;
        if let Some(uniforms) = self.uniforms.as_mut() {
            uniforms.set("textureTransform", UniformValue::Mat4(*transform));
        }
    }

    pub fn set_time(&mut self, seconds: f32) {
        self.time = seconds;
        if let Some(uniforms) = self.uniforms.as_mut() {
            uniforms.set("time", UniformValue::Float(seconds));
        }
    }

    /// Returns the ready target, or the sentinel explaining why nothing can be drawn.
    pub(crate) fn ready_target(&self) -> Result<FramebufferTarget, RenderOutput> {
        match self.state {
            StageState::Ready => self.target.ok_or(RenderOutput::NoFramebuffer),
            StageState::Inert | StageState::Destroyed => {
                if cfg!(debug_assertions) {
                    tracing::error!(
                        filter = %self.spec.name(),
                        state = ?self.state,
                        "render called outside of the stage lifecycle"
                    );
                }
                Err(RenderOutput::Uninitialized)
            }
            StageState::Failed => Err(RenderOutput::Uninitialized),
        }
    }

    /// Drains queued commands in FIFO order, handing the ones this stage does
    /// not understand to `other`.
    pub(crate) fn drain_commands(&mut self, mut other: impl FnMut(StageCommand)) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                StageCommand::SetUniform { name, value } => self.apply_uniform(&name, value),
                command => other(command),
            }
        }
    }

    fn apply_uniform(&mut self, name: &str, value: UniformValue) {
        if let Some(uniforms) = self.uniforms.as_mut() {
            if !uniforms.set(name, value) {
                tracing::debug!(filter = %self.spec.name(), name, "uniform update ignored");
            }
        }
    }

    pub fn render(&mut self, gpu: &mut dyn GpuBackend, input: TextureId) -> FilterResult<RenderOutput> {
        let target = match self.ready_target() {
            Ok(target) => target,
            Err(sentinel) => return Ok(sentinel),
        };
        let filter = self.spec.name().to_string();
        self.drain_commands(|command| {
            tracing::debug!(%filter, ?command, "command not supported by this filter");
        });
        self.draw_offscreen(gpu, input, target)?;
        self.draw_display(gpu, input)?;
        Ok(RenderOutput::Drawn(target.texture))
    }

    /// Draws `input` into the off-screen target, clearing it first.
    pub(crate) fn draw_offscreen(
        &self,
        gpu: &mut dyn GpuBackend,
        input: TextureId,
        target: FramebufferTarget,
    ) -> FilterResult<()> {
        self.draw(
            gpu,
            input,
            RenderTarget::Framebuffer(target.framebuffer),
            Rect::full(target.size),
        )
    }

    fn draw_display(&self, gpu: &mut dyn GpuBackend, input: TextureId) -> FilterResult<()> {
        if self.display_size.is_empty() {
            return Ok(());
        }
        self.draw(gpu, input, RenderTarget::Display, Rect::full(self.display_size))
    }

    fn draw(
        &self,
        gpu: &mut dyn GpuBackend,
        texture: TextureId,
        target: RenderTarget,
        viewport: Rect,
    ) -> FilterResult<()> {
        let (Some(program), Some(geometry), Some(uniforms)) =
            (&self.program, &self.geometry, &self.uniforms)
        else {
            return Err(FilterError::state("draw", self.state));
        };
        gpu.draw(&DrawCall {
            program: program.id(),
            positions: geometry.positions,
            tex_coords: geometry.tex_coords,
            texture,
            uniforms: uniforms.as_bytes(),
            target,
            viewport,
            blend: BlendMode::Replace,
            clear: Some(self.clear_color),
        })
    }

    pub(crate) fn clear_color(&self) -> [f32; 4] {
        self.clear_color
    }

    /// Reads the off-screen target back, bottom row first.
    pub fn read_pixels(&self, gpu: &mut dyn GpuBackend, out: &mut Vec<u8>) -> FilterResult<Size> {
        let target = self
            .target
            .ok_or_else(|| FilterError::Resource("no off-screen target allocated".to_string()))?;
        gpu.read_pixels(target.framebuffer, out)
    }

    /// Releases every GPU object and discards pending commands. Idempotent.
    /// Releases what a successful `init` built and marks the stage `Failed`,
    /// keeping its command queue. Used when a wrapping stage fails after this one.
    pub(super) fn mark_failed(&mut self, gpu: &mut dyn GpuBackend) {
        self.release_gpu_objects(gpu);
        self.state = StageState::Failed;
    }

    fn release_gpu_objects(&mut self, gpu: &mut dyn GpuBackend) {
        if let Some(target) = self.target.take() {
            target.release(gpu);
        }
        if let Some(geometry) = self.geometry.take() {
            geometry.destroy(gpu);
        }
        if let Some(program) = self.program.take() {
            program.destroy(gpu);
        }
        self.uniforms = None;
    }

    pub fn destroy(&mut self, gpu: &mut dyn GpuBackend) {
        if self.state == StageState::Destroyed {
            return;
        }
        self.release_gpu_objects(gpu);
        let discarded = self.commands.try_iter().count();
        if discarded > 0 {
            tracing::debug!(filter = %self.spec.name(), discarded, "dropped pending commands");
        }
        self.state = StageState::Destroyed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{GpuCall, RecordingBackend};

    fn ready_stage(gpu: &mut RecordingBackend, spec: FilterSpec) -> FilterStage {
        let mut stage = FilterStage::new(spec, Rotation::Deg0, [0.0; 4]);
        stage.init(gpu).unwrap();
        stage
    }

    fn camera_texture(gpu: &mut RecordingBackend) -> TextureId {
        let texture = gpu.create_texture(Size::new(2, 2)).unwrap();
        gpu.upload_texture(texture, &[7; 16]).unwrap();
        texture
    }

    #[test]
    fn same_input_size_keeps_framebuffer() {
        let mut gpu = RecordingBackend::new();
        let mut stage = ready_stage(&mut gpu, FilterSpec::Identity);
        stage.on_input_size_changed(&mut gpu, Size::new(64, 32)).unwrap();
        let first = stage.framebuffer().unwrap();
        stage.on_input_size_changed(&mut gpu, Size::new(64, 32)).unwrap();
        assert_eq!(stage.framebuffer(), Some(first));

        stage.on_input_size_changed(&mut gpu, Size::new(32, 64)).unwrap();
        assert_ne!(stage.framebuffer(), Some(first));
        assert_eq!(gpu.live_objects().framebuffers, 1);
    }

    #[test]
    fn zero_size_is_ignored() {
        let mut gpu = RecordingBackend::new();
        let mut stage = ready_stage(&mut gpu, FilterSpec::Identity);
        stage.on_input_size_changed(&mut gpu, Size::new(0, 32)).unwrap();
        assert!(stage.framebuffer().is_none());
    }

    #[test]
    fn render_before_init_is_a_sentinel() {
        let mut gpu = RecordingBackend::new();
        let input = camera_texture(&mut gpu);
        let mut stage = FilterStage::new(FilterSpec::Identity, Rotation::Deg0, [0.0; 4]);
        stage.on_input_size_changed(&mut gpu, Size::new(4, 4)).unwrap();
        assert_eq!(stage.render(&mut gpu, input).unwrap(), RenderOutput::Uninitialized);
        assert!(!gpu.calls().iter().any(|call| matches!(call, GpuCall::CreateProgram { .. })));
    }

    #[test]
    fn failed_allocation_reports_missing_framebuffer_then_recovers() {
        let mut gpu = RecordingBackend::new();
        let input = camera_texture(&mut gpu);
        let mut stage = ready_stage(&mut gpu, FilterSpec::Identity);
        gpu.fail_framebuffer_allocations(1);
        let err = stage.on_input_size_changed(&mut gpu, Size::new(8, 8)).unwrap_err();
        assert!(err.is_resource());
        assert!(stage.framebuffer().is_none());
        assert_eq!(stage.render(&mut gpu, input).unwrap(), RenderOutput::NoFramebuffer);
        // The half-built texture is not leaked.
        assert_eq!(gpu.live_objects().textures, 1);

        stage.on_input_size_changed(&mut gpu, Size::new(8, 8)).unwrap();
        assert!(matches!(stage.render(&mut gpu, input).unwrap(), RenderOutput::Drawn(_)));
    }

    #[test]
    fn commands_apply_in_order_before_draw() {
        let mut gpu = RecordingBackend::new();
        let input = camera_texture(&mut gpu);
        let mut stage = ready_stage(&mut gpu, FilterSpec::Grayscale);
        stage.on_input_size_changed(&mut gpu, Size::new(4, 4)).unwrap();
        let handle = stage.handle();
        handle.set_uniform("intensity", UniformValue::Float(0.25));
        handle.set_uniform("intensity", UniformValue::Float(0.75));
        stage.render(&mut gpu, input).unwrap();
        assert_eq!(stage.uniforms().unwrap().get_f32("intensity"), Some(0.75));
    }

    #[test]
    fn render_draws_offscreen_then_display() {
        let mut gpu = RecordingBackend::new();
        gpu.configure_display(Size::new(8, 8)).unwrap();
        let input = camera_texture(&mut gpu);
        let mut stage = ready_stage(&mut gpu, FilterSpec::Identity);
        stage.on_input_size_changed(&mut gpu, Size::new(4, 4)).unwrap();
        stage.on_display_size_changed(Size::new(8, 8));
        gpu.take_calls();

        let output = stage.render(&mut gpu, input).unwrap();
        let targets: Vec<(RenderTarget, Rect)> = gpu
            .calls()
            .iter()
            .filter_map(|call| match call {
                GpuCall::Draw {
                    target, viewport, ..
                } => Some((*target, *viewport)),
                _ => None,
            })
            .collect();
        let framebuffer = stage.framebuffer().unwrap();
        assert_eq!(
            targets,
            vec![
                (RenderTarget::Framebuffer(framebuffer), Rect::new(0, 0, 4, 4)),
                (RenderTarget::Display, Rect::new(0, 0, 8, 8)),
            ]
        );
        assert_eq!(output, RenderOutput::Drawn(stage.output_texture().unwrap()));
    }

    #[test]
    fn destroy_releases_everything_and_is_idempotent() {
        let mut gpu = RecordingBackend::new();
        let mut stage = ready_stage(&mut gpu, FilterSpec::Sepia);
        stage.on_input_size_changed(&mut gpu, Size::new(4, 4)).unwrap();
        stage.handle().set_uniform("intensity", UniformValue::Float(0.5));
        stage.destroy(&mut gpu);
        stage.destroy(&mut gpu);
        assert_eq!(gpu.live_objects().total(), 0);
        assert_eq!(stage.state(), StageState::Destroyed);
    }

    #[test]
    fn failed_stage_can_be_initialised_again() {
        let mut gpu = RecordingBackend::new();
        let mut stage = FilterStage::new(FilterSpec::Grayscale, Rotation::Deg0, [0.0; 4]);
        stage.on_input_size_changed(&mut gpu, Size::new(4, 2)).unwrap();
        gpu.fail_buffer_allocations(1);
        assert!(stage.init(&mut gpu).unwrap_err().is_resource());
        assert_eq!(stage.state(), StageState::Failed);
        assert_eq!(gpu.live_objects().total(), 0);

        stage.init(&mut gpu).unwrap();
        assert_eq!(stage.state(), StageState::Ready);
        assert!(stage.framebuffer().is_some());

        let err = stage.init(&mut gpu).unwrap_err();
        assert!(matches!(err, FilterError::State { .. }));
    }

    #[test]
    fn rotation_filter_overrides_device_rotation() {
        let stage = FilterStage::new(FilterSpec::Rotation(Rotation::Deg270), Rotation::Deg90, [0.0; 4]);
        assert_eq!(stage.rotation(), Rotation::Deg270);
    }
}
