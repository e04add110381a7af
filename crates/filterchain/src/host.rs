use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use image::RgbaImage;
use tracing::{debug, info, warn};

use crate::camera::CameraSource;
use crate::compile::{reflect, UniformValue};
use crate::error::{FilterError, FilterResult};
use crate::gpu::BoxedBackend;
use crate::matrix::{display_projection, fit_display_to_preview, multiply, Mat4};
use crate::relay::{FrameRelay, FrameSink, RelayStats};
use crate::shaders::{fragment_body, wrap_fragment, VERTEX_SHADER};
use crate::stage::{decode_overlay, RenderOutput, Stage, StageCommand};
use crate::types::{FilterSpec, HostConfig, Orientation, OverlayPlacement, Rotation, Size};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Created,
    SurfaceReady,
    Running,
    Reconfiguring,
    Destroyed,
}

enum WorkItem {
    FrameAvailable,
    Redraw,
    SwapFilter {
        spec: FilterSpec,
        reply: Sender<FilterResult<()>>,
    },
    SetPreviewSize(Size),
    SetDisplaySize(Size),
    SetRotation(Rotation),
    SetOrientation(Orientation),
    SetOverlayImage(Arc<RgbaImage>),
    SetOverlayPlacement(OverlayPlacement),
    SetUniform {
        name: String,
        value: UniformValue,
    },
    SetCaptureSink(Option<Box<dyn FrameSink>>),
    Flush(Sender<()>),
    Shutdown,
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkItem::FrameAvailable => f.write_str("FrameAvailable"),
            WorkItem::Redraw => f.write_str("Redraw"),
            WorkItem::SwapFilter { spec, .. } => write!(f, "SwapFilter({})", spec.name()),
            WorkItem::SetPreviewSize(size) => write!(f, "SetPreviewSize({size})"),
            WorkItem::SetDisplaySize(size) => write!(f, "SetDisplaySize({size})"),
            WorkItem::SetRotation(rotation) => write!(f, "SetRotation({rotation:?})"),
            WorkItem::SetOrientation(orientation) => write!(f, "SetOrientation({orientation:?})"),
            WorkItem::SetOverlayImage(image) => {
                write!(f, "SetOverlayImage({}x{})", image.width(), image.height())
            }
            WorkItem::SetOverlayPlacement(placement) => {
                write!(f, "SetOverlayPlacement({placement:?})")
            }
            WorkItem::SetUniform { name, .. } => write!(f, "SetUniform({name})"),
            WorkItem::SetCaptureSink(sink) => {
                write!(f, "SetCaptureSink({})", if sink.is_some() { "some" } else { "none" })
            }
            WorkItem::Flush(_) => f.write_str("Flush"),
            WorkItem::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Outcome of one [`FilterChainHost::tick`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Work items applied at the start of the tick.
    pub work_items: usize,
    /// What the active stage produced, when a render happened.
    pub output: Option<RenderOutput>,
    pub relayed: bool,
    pub captured: bool,
    pub shutdown: bool,
}

impl TickReport {
    pub fn rendered(&self) -> bool {
        matches!(self.output, Some(RenderOutput::Drawn(_)))
    }
}

/// Pending reply to [`HostHandle::set_filter`].
#[derive(Debug)]
pub struct FilterSwap {
    reply: Receiver<FilterResult<()>>,
}

impl FilterSwap {
    fn host_gone() -> FilterError {
        FilterError::state("swap filter", HostState::Destroyed)
    }

    /// Blocks until the render thread has applied (or rejected) the swap.
    pub fn wait(self) -> FilterResult<()> {
        self.reply.recv().map_err(|_| Self::host_gone())?
    }

    /// Like [`FilterSwap::wait`], giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<FilterResult<()>> {
        match self.reply.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(Self::host_gone())),
        }
    }

    /// Returns the result if the swap has already been processed.
    pub fn try_result(&self) -> Option<FilterResult<()>> {
        match self.reply.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(Self::host_gone())),
        }
    }
}

/// Cloneable, thread-safe front door to a [`FilterChainHost`].
///
/// Everything except encoding control and capture requests is queued and
/// applied on the render thread at the start of its next tick.
#[derive(Clone)]
pub struct HostHandle {
    work: Sender<WorkItem>,
    relay: Arc<FrameRelay>,
    capture_requested: Arc<AtomicBool>,
}

impl fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostHandle")
            .field("pending_work", &self.work.len())
            .field("relay", &self.relay)
            .finish()
    }
}

impl HostHandle {
    fn send(&self, item: WorkItem) -> bool {
        self.work.send(item).is_ok()
    }

    /// Signals that the camera produced a new frame.
    pub fn frame_available(&self) -> bool {
        self.send(WorkItem::FrameAvailable)
    }

    pub fn request_redraw(&self) -> bool {
        self.send(WorkItem::Redraw)
    }

    pub fn set_filter(&self, spec: FilterSpec) -> FilterSwap {
        let (reply, receiver) = bounded(1);
        // A dropped request leaves `reply` disconnected, which `wait` reports.
        let _ = self.work.send(WorkItem::SwapFilter { spec, reply });
        FilterSwap { reply: receiver }
    }

    pub fn set_preview_size(&self, size: Size) -> bool {
        self.send(WorkItem::SetPreviewSize(size))
    }

    pub fn set_display_size(&self, size: Size) -> bool {
        self.send(WorkItem::SetDisplaySize(size))
    }

    pub fn set_rotation(&self, rotation: Rotation) -> bool {
        self.send(WorkItem::SetRotation(rotation))
    }

    pub fn set_orientation(&self, orientation: Orientation) -> bool {
        self.send(WorkItem::SetOrientation(orientation))
    }

    /// Decodes `bytes` on the calling thread; the upload happens on the render thread.
    pub fn set_overlay_image(&self, bytes: &[u8]) -> FilterResult<bool> {
        let image = decode_overlay(bytes)?;
        Ok(self.send(WorkItem::SetOverlayImage(image)))
    }

    pub fn set_overlay_placement(&self, placement: OverlayPlacement) -> bool {
        self.send(WorkItem::SetOverlayPlacement(placement))
    }

    /// Queues a uniform write for whichever stage is active when the item is processed.
    pub fn set_uniform(&self, name: impl Into<String>, value: UniformValue) -> bool {
        self.send(WorkItem::SetUniform {
            name: name.into(),
            value,
        })
    }

    pub fn enable_encoding(&self, sink: impl FrameSink + 'static) -> FilterResult<()> {
        self.relay.enable(Box::new(sink))
    }

    pub fn disable_encoding(&self) {
        self.relay.disable();
    }

    pub fn is_encoding(&self) -> bool {
        self.relay.is_active()
    }

    pub fn relay_stats(&self) -> RelayStats {
        self.relay.stats()
    }

    /// Asks for the next rendered frame to be handed to the capture callback once.
    pub fn request_capture_frame(&self) {
        self.capture_requested.store(true, Ordering::Release);
    }

    pub fn capture_pending(&self) -> bool {
        self.capture_requested.load(Ordering::Acquire)
    }

    pub fn set_capture_callback(&self, sink: impl FrameSink + 'static) -> bool {
        self.send(WorkItem::SetCaptureSink(Some(Box::new(sink))))
    }

    pub fn clear_capture_callback(&self) -> bool {
        self.send(WorkItem::SetCaptureSink(None))
    }

    /// Blocks until the render thread has finished a tick that applied all
    /// work queued before this call. Returns `false` on timeout or when the host is gone.
    pub fn flush(&self, timeout: Duration) -> bool {
        let (done, wait) = bounded(1);
        self.send(WorkItem::Flush(done)) && wait.recv_timeout(timeout).is_ok()
    }

    pub fn pending_work(&self) -> usize {
        self.work.len()
    }

    pub fn shutdown(&self) -> bool {
        self.send(WorkItem::Shutdown)
    }
}

struct RenderStats {
    last_update: Instant,
    frames_since_update: u32,
    frame_count: u64,
}

impl RenderStats {
    fn new() -> Self {
        Self {
            last_update: Instant::now(),
            frames_since_update: 0,
            frame_count: 0,
        }
    }

    fn record(&mut self, relay: &RelayStats, filter: &str) {
        self.frame_count += 1;
        self.frames_since_update += 1;
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_update);
        if elapsed >= Duration::from_secs(1) {
            let fps = self.frames_since_update as f32 / elapsed.as_secs_f32();
            self.frames_since_update = 0;
            self.last_update = now;
            debug!(
                fps = fps.round(),
                frame_count = self.frame_count,
                filter,
                relayed = relay.pushed,
                dropped = relay.dropped,
                "render stats"
            );
        }
    }
}

/// Owner of the GPU backend and the active filter stage. Lives on exactly one
/// thread; other threads reach it through [`HostHandle`].
pub struct FilterChainHost {
    gpu: BoxedBackend,
    camera: Box<dyn CameraSource>,
    state: HostState,
    stage: Option<Stage>,
    filter: FilterSpec,
    preview: Size,
    display: Size,
    rotation: Rotation,
    orientation: Orientation,
    fit_display: bool,
    clear_color: [f32; 4],
    projection: Mat4,
    overlay_image: Option<Arc<RgbaImage>>,
    overlay_placement: OverlayPlacement,
    /// Uniform writes for the current filter, replayed into rebuilt stages.
    uniforms: BTreeMap<String, UniformValue>,
    relay: Arc<FrameRelay>,
    capture_requested: Arc<AtomicBool>,
    capture_sink: Option<Box<dyn FrameSink>>,
    work_tx: Sender<WorkItem>,
    work_rx: Receiver<WorkItem>,
    backlog: VecDeque<WorkItem>,
    flush_waiters: Vec<Sender<()>>,
    redraw: bool,
    shutdown: bool,
    started: Instant,
    stats: RenderStats,
}

impl fmt::Debug for FilterChainHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChainHost")
            .field("backend", &self.gpu.label())
            .field("state", &self.state)
            .field("filter", &self.filter.name())
            .field("preview", &self.preview)
            .field("display", &self.display)
            .field("rotation", &self.rotation)
            .finish()
    }
}

impl FilterChainHost {
    pub fn new(gpu: BoxedBackend, camera: Box<dyn CameraSource>, config: HostConfig) -> Self {
        let (work_tx, work_rx) = unbounded();
        let preview = match config.orientation {
            Orientation::Portrait if config.preview.width > config.preview.height => {
                config.preview.swapped()
            }
            _ => config.preview,
        };
        let display = if config.fit_display_to_preview {
            fit_display_to_preview(config.display, preview)
        } else {
            config.display
        };
        let mut camera = camera;
        camera.on_preview_size_changed(preview);
        Self {
            gpu,
            camera,
            state: HostState::Created,
            stage: None,
            filter: config.filter,
            preview,
            display,
            rotation: config.rotation,
            orientation: config.orientation,
            fit_display: config.fit_display_to_preview,
            clear_color: config.clear_color,
            projection: display_projection(display, preview),
            overlay_image: None,
            overlay_placement: OverlayPlacement::default(),
            uniforms: BTreeMap::new(),
            relay: Arc::new(FrameRelay::new(config.relay_capacity, config.relay_wait)),
            capture_requested: Arc::new(AtomicBool::new(false)),
            capture_sink: None,
            work_tx,
            work_rx,
            backlog: VecDeque::new(),
            flush_waiters: Vec::new(),
            redraw: false,
            shutdown: false,
            started: Instant::now(),
            stats: RenderStats::new(),
        }
    }

    pub fn handle(&self) -> HostHandle {
        HostHandle {
            work: self.work_tx.clone(),
            relay: Arc::clone(&self.relay),
            capture_requested: Arc::clone(&self.capture_requested),
        }
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn filter(&self) -> &FilterSpec {
        &self.filter
    }

    pub fn stage(&self) -> Option<&Stage> {
        self.stage.as_ref()
    }

    pub fn preview_size(&self) -> Size {
        self.preview
    }

    pub fn display_size(&self) -> Size {
        self.display
    }

    pub fn rotation(&self) -> Rotation {
        self.rotation
    }

    pub fn projection(&self) -> &Mat4 {
        &self.projection
    }

    pub fn backend(&self) -> &dyn crate::gpu::GpuBackend {
        self.gpu.as_ref()
    }

    pub fn backend_mut(&mut self) -> &mut dyn crate::gpu::GpuBackend {
        self.gpu.as_mut()
    }

    /// Reads the active stage's off-screen target, bottom row first.
    pub fn read_output(&mut self, out: &mut Vec<u8>) -> FilterResult<Size> {
        let stage = self
            .stage
            .as_ref()
            .ok_or_else(|| FilterError::state("read output", self.state))?;
        stage.read_pixels(self.gpu.as_mut(), out)
    }

    /// Brings up the display surface and the configured filter. A filter that
    /// fails to compile is replaced by `Identity`.
    pub fn surface_created(&mut self) -> FilterResult<()> {
        if self.state != HostState::Created {
            return Err(FilterError::state("create surface", self.state));
        }
        self.gpu.configure_display(self.display)?;
        let spec = self.filter.clone();
        let stage = match self.build_stage(spec) {
            Ok(stage) => stage,
            Err(err) if err.is_compile() => {
                warn!(filter = %self.filter.name(), %err, "falling back to identity filter");
                self.filter = FilterSpec::Identity;
                self.build_stage(FilterSpec::Identity)?
            }
            Err(err) => return Err(err),
        };
        self.stage = Some(stage);
        self.state = HostState::SurfaceReady;
        self.redraw = true;
        info!(
            backend = %self.gpu.label(),
            filter = %self.filter.name(),
            preview = %self.preview,
            display = %self.display,
            "filter chain surface ready"
        );
        Ok(())
    }

    /// Blocks until work arrives or `timeout` elapses. Returns `true` when work is pending.
    pub fn wait_for_work(&mut self, timeout: Duration) -> bool {
        if !self.backlog.is_empty() || !self.work_rx.is_empty() {
            return true;
        }
        match self.work_rx.recv_timeout(timeout) {
            Ok(item) => {
                self.backlog.push_back(item);
                true
            }
            Err(_) => false,
        }
    }

    /// Applies queued work in FIFO order, then renders if a frame or redraw is pending.
    pub fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();
        if self.state == HostState::Destroyed {
            report.shutdown = true;
            return report;
        }

        // Only what is queued now; items arriving meanwhile wait for the next tick.
        let queued = self.backlog.len() + self.work_rx.len();
        while report.work_items < queued {
            let Some(item) = self.next_work_item() else {
                break;
            };
            report.work_items += 1;
            self.apply(item);
            if self.shutdown {
                break;
            }
        }
        if self.shutdown {
            report.shutdown = true;
            return report;
        }

        let ready = matches!(self.state, HostState::SurfaceReady | HostState::Running);
        if ready && std::mem::take(&mut self.redraw) {
            self.render_frame(&mut report);
        }
        for waiter in self.flush_waiters.drain(..) {
            let _ = waiter.send(());
        }
        report
    }

    fn next_work_item(&mut self) -> Option<WorkItem> {
        self.backlog
            .pop_front()
            .or_else(|| self.work_rx.try_recv().ok())
    }

    fn apply(&mut self, item: WorkItem) {
        match item {
            WorkItem::FrameAvailable | WorkItem::Redraw => self.redraw = true,
            WorkItem::SwapFilter { spec, reply } => {
                let result = self.swap_filter(spec);
                let _ = reply.send(result);
            }
            WorkItem::SetPreviewSize(size) => self.set_preview_size(size),
            WorkItem::SetDisplaySize(size) => self.set_display_size(size),
            WorkItem::SetRotation(rotation) => {
                if rotation != self.rotation {
                    self.rotation = rotation;
                    self.rebuild("rotation changed");
                }
            }
            WorkItem::SetOrientation(orientation) => self.set_orientation(orientation),
            WorkItem::SetOverlayImage(image) => {
                self.overlay_image = Some(Arc::clone(&image));
                self.send_overlay(StageCommand::SetOverlayImage(image));
            }
            WorkItem::SetOverlayPlacement(placement) => {
                self.overlay_placement = placement;
                self.send_overlay(StageCommand::SetOverlayPlacement(placement));
            }
            WorkItem::SetUniform { name, value } => {
                if let Some(stage) = self.stage.as_ref() {
                    stage.handle().set_uniform(name.clone(), value);
                    self.redraw = true;
                }
                self.uniforms.insert(name, value);
            }
            WorkItem::SetCaptureSink(sink) => self.capture_sink = sink,
            WorkItem::Flush(waiter) => self.flush_waiters.push(waiter),
            WorkItem::Shutdown => self.shutdown = true,
        }
    }

    fn send_overlay(&mut self, command: StageCommand) {
        if let Some(Stage::Composite(stage)) = self.stage.as_ref() {
            stage.handle().send(command);
            self.redraw = true;
        }
    }

    /// Builds, initialises and sizes a new stage for `spec`.
    fn build_stage(&mut self, spec: FilterSpec) -> FilterResult<Stage> {
        let mut stage = Stage::new(spec, self.rotation, self.clear_color);
        if let Err(err) = stage.init(self.gpu.as_mut()) {
            stage.destroy(self.gpu.as_mut());
            return Err(err);
        }
        stage.on_display_size_changed(self.display);
        if let Err(err) = stage.on_input_size_changed(self.gpu.as_mut(), self.preview) {
            // Retried on the next preview size change.
            warn!(filter = %stage.spec().name(), %err, "stage has no off-screen target yet");
        }
        let handle = stage.handle();
        for (name, value) in &self.uniforms {
            handle.set_uniform(name.clone(), *value);
        }
        if matches!(stage, Stage::Composite(_)) {
            handle.send(StageCommand::SetOverlayPlacement(self.overlay_placement));
            if let Some(image) = &self.overlay_image {
                handle.send(StageCommand::SetOverlayImage(Arc::clone(image)));
            }
        }
        Ok(stage)
    }

    fn swap_filter(&mut self, spec: FilterSpec) -> FilterResult<()> {
        match self.state {
            HostState::Destroyed => return Err(FilterError::state("swap filter", self.state)),
            HostState::Created => {
                // No surface yet; validate on the CPU and defer the build.
                if let FilterSpec::Custom { label, .. } = &spec {
                    reflect(label, VERTEX_SHADER, &wrap_fragment(fragment_body(&spec)))?;
                }
                self.uniforms.clear();
                self.filter = spec;
                return Ok(());
            }
            _ => {}
        }

        let previous = self.state;
        self.state = HostState::Reconfiguring;
        // Writes meant for the outgoing filter do not carry over.
        let uniforms = std::mem::take(&mut self.uniforms);
        let result = self.install(spec);
        if result.is_err() {
            self.uniforms = uniforms;
        }
        self.state = previous;
        result
    }

    fn install(&mut self, spec: FilterSpec) -> FilterResult<()> {
        let name = spec.name().to_string();
        let stage = self.build_stage(spec.clone()).inspect_err(|err| {
            warn!(filter = %name, %err, "filter swap rejected; keeping current filter");
        })?;
        if let Some(mut old) = self.stage.replace(stage) {
            old.destroy(self.gpu.as_mut());
        }
        debug!(from = %self.filter.name(), to = %name, "filter swapped");
        self.filter = spec;
        self.redraw = true;
        Ok(())
    }

    /// Replaces the active stage with a fresh one for the current filter.
    fn rebuild(&mut self, reason: &'static str) {
        if !matches!(self.state, HostState::SurfaceReady | HostState::Running) {
            return;
        }
        let previous = self.state;
        self.state = HostState::Reconfiguring;
        if let Err(err) = self.install(self.filter.clone()) {
            warn!(reason, %err, "failed to rebuild filter stage");
        }
        self.state = previous;
    }

    fn set_preview_size(&mut self, size: Size) {
        if size.is_empty() || size == self.preview {
            return;
        }
        self.preview = size;
        self.camera.on_preview_size_changed(size);
        if self.fit_display {
            let fitted = fit_display_to_preview(self.display, size);
            if fitted != self.display {
                self.apply_display_size(fitted);
            }
        }
        self.projection = display_projection(self.display, self.preview);
        if let Some(stage) = self.stage.as_mut() {
            if let Err(err) = stage.on_input_size_changed(self.gpu.as_mut(), size) {
                warn!(%size, %err, "failed to resize off-screen target");
            }
        }
        self.redraw = true;
    }

    fn set_display_size(&mut self, size: Size) {
        let size = if self.fit_display {
            fit_display_to_preview(size, self.preview)
        } else {
            size
        };
        if size == self.display {
            return;
        }
        self.apply_display_size(size);
        self.projection = display_projection(self.display, self.preview);
        self.redraw = true;
    }

    fn apply_display_size(&mut self, size: Size) {
        self.display = size;
        if self.state != HostState::Created {
            if let Err(err) = self.gpu.configure_display(size) {
                warn!(%size, %err, "failed to configure display");
            }
        }
        if let Some(stage) = self.stage.as_mut() {
            stage.on_display_size_changed(size);
        }
    }

    fn set_orientation(&mut self, orientation: Orientation) {
        if orientation == self.orientation {
            return;
        }
        self.orientation = orientation;
        self.preview = self.preview.swapped();
        self.camera.on_preview_size_changed(self.preview);
        if self.fit_display {
            let fitted = fit_display_to_preview(self.display, self.preview);
            if fitted != self.display {
                self.apply_display_size(fitted);
            }
        }
        self.projection = display_projection(self.display, self.preview);
        debug!(?orientation, preview = %self.preview, "orientation changed");
        self.rebuild("orientation changed");
    }

    fn render_frame(&mut self, report: &mut TickReport) {
        let Some(stage) = self.stage.as_mut() else {
            return;
        };
        let frame = match self.camera.acquire(self.gpu.as_mut()) {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(err) => {
                warn!(%err, "failed to acquire camera frame");
                return;
            }
        };

        let transform = multiply(&frame.transform, &self.projection);
        stage.set_texture_transform(&transform);
        stage.set_time(self.started.elapsed().as_secs_f32());
        let output = match stage.render(self.gpu.as_mut(), frame.texture) {
            Ok(output) => output,
            Err(err) => {
                warn!(filter = %stage.spec().name(), %err, "render failed");
                return;
            }
        };
        report.output = Some(output);
        if let Err(err) = self.gpu.present() {
            warn!(%err, "present failed");
        }
        if !matches!(output, RenderOutput::Drawn(_)) {
            return;
        }
        self.state = HostState::Running;

        let relay_active = self.relay.is_active();
        let capture = self.capture_sink.is_some() && self.capture_requested.load(Ordering::Acquire);
        if relay_active || capture {
            let mut buffer = self.relay.acquire_buffer();
            match stage.read_pixels(self.gpu.as_mut(), &mut buffer) {
                Ok(size) => {
                    if capture && self.capture_requested.swap(false, Ordering::AcqRel) {
                        if let Some(sink) = self.capture_sink.as_mut() {
                            if let Err(err) = sink.on_frame(&buffer, size.width, size.height) {
                                warn!(%err, "capture callback failed");
                            }
                            report.captured = true;
                        }
                    }
                    if relay_active {
                        report.relayed = self.relay.push(buffer, size);
                    }
                }
                Err(err) => warn!(%err, "readback failed; skipping frame delivery"),
            }
        }

        let filter = stage.spec().name().to_string();
        self.stats.record(&self.relay.stats(), &filter);
    }

    /// Disables the relay, releases every GPU object and the camera. Idempotent.
    pub fn destroy(&mut self) {
        if self.state == HostState::Destroyed {
            return;
        }
        self.relay.disable();
        if let Some(mut stage) = self.stage.take() {
            stage.destroy(self.gpu.as_mut());
        }
        self.camera.release(self.gpu.as_mut());
        self.capture_sink = None;
        let dropped = self.backlog.len() + self.work_rx.try_iter().count();
        self.backlog.clear();
        self.flush_waiters.clear();
        self.state = HostState::Destroyed;
        info!(
            frames = self.stats.frame_count,
            dropped_work = dropped,
            live = ?self.gpu.live_objects(),
            "filter chain destroyed"
        );
    }
}

impl Drop for FilterChainHost {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::SyntheticCamera;
    use crate::gpu::RecordingBackend;

    fn host(config: HostConfig) -> FilterChainHost {
        let camera = SyntheticCamera::new(config.preview).with_motion(false);
        FilterChainHost::new(Box::new(RecordingBackend::new()), Box::new(camera), config)
    }

    fn small_config() -> HostConfig {
        HostConfig {
            preview: Size::new(8, 4),
            display: Size::new(16, 8),
            ..HostConfig::default()
        }
    }

    #[test]
    fn nothing_renders_before_the_surface_exists() {
        let mut host = host(small_config());
        host.handle().frame_available();
        let report = host.tick();
        assert_eq!(report.work_items, 1);
        assert_eq!(report.output, None);
        assert_eq!(host.state(), HostState::Created);
    }

    #[test]
    fn first_drawn_frame_moves_to_running() {
        let mut host = host(small_config());
        host.surface_created().unwrap();
        assert_eq!(host.state(), HostState::SurfaceReady);
        assert!(host.tick().rendered());
        assert_eq!(host.state(), HostState::Running);
        // No new frame, no render.
        assert_eq!(host.tick().output, None);
    }

    #[test]
    fn broken_initial_filter_falls_back_to_identity() {
        let mut config = small_config();
        config.filter = FilterSpec::custom("broken", "void mainImage(");
        let mut host = host(config);
        host.surface_created().unwrap();
        assert_eq!(host.filter(), &FilterSpec::Identity);
    }

    #[test]
    fn deferred_swap_validates_custom_shaders() {
        let mut host = host(small_config());
        let swap = host.handle().set_filter(FilterSpec::custom("broken", "void mainImage("));
        host.tick();
        assert!(swap.wait().unwrap_err().is_compile());

        let swap = host.handle().set_filter(FilterSpec::Sepia);
        host.tick();
        swap.wait().unwrap();
        assert_eq!(host.filter(), &FilterSpec::Sepia);
    }

    #[test]
    fn orientation_swaps_preview_and_rebuilds() {
        let mut host = host(small_config());
        host.surface_created().unwrap();
        let before = host.stage().unwrap().framebuffer();
        host.handle().set_orientation(Orientation::Portrait);
        host.tick();
        assert_eq!(host.preview_size(), Size::new(4, 8));
        assert_ne!(host.stage().unwrap().framebuffer(), before);
        assert_eq!(host.backend().live_objects().framebuffers, 1);
    }

    #[test]
    fn display_is_fitted_to_preview_aspect() {
        let mut config = small_config();
        config.fit_display_to_preview = true;
        config.display = Size::new(100, 100);
        let mut host = host(config);
        assert_eq!(host.display_size(), Size::new(100, 50));
        host.surface_created().unwrap();
        host.handle().set_preview_size(Size::new(4, 8));
        host.tick();
        assert_eq!(host.display_size(), Size::new(25, 50));
    }

    #[test]
    fn orientation_refits_the_display() {
        let mut config = small_config();
        config.fit_display_to_preview = true;
        config.display = Size::new(100, 100);
        let mut host = host(config);
        host.surface_created().unwrap();
        assert_eq!(host.display_size(), Size::new(100, 50));

        host.handle().set_orientation(Orientation::Portrait);
        host.tick();
        assert_eq!(host.preview_size(), Size::new(4, 8));
        assert_eq!(host.display_size(), Size::new(25, 50));
        assert_eq!(host.projection(), &display_projection(Size::new(25, 50), Size::new(4, 8)));
    }

    #[test]
    fn destroy_releases_stage_and_camera() {
        let mut host = host(small_config());
        host.surface_created().unwrap();
        host.handle().frame_available();
        host.tick();
        host.destroy();
        assert_eq!(host.state(), HostState::Destroyed);
        assert_eq!(host.backend().live_objects().total(), 0);
        assert!(host.tick().shutdown);
    }
}
