use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::unbounded;
use filterchain::gpu::RecordingBackend;
use filterchain::{
    FilterChainHost, FilterSpec, HostConfig, Orientation, OverlayAnchor, OverlayPlacement,
    RenderOutput, RenderThread, Rotation, Size, Stage, SyntheticCamera, UniformValue,
};
use image::{ImageFormat, Rgba, RgbaImage};

fn config(filter: FilterSpec) -> HostConfig {
    HostConfig {
        preview: Size::new(8, 4),
        display: Size::new(16, 8),
        filter,
        relay_wait: Duration::from_millis(50),
        ..HostConfig::default()
    }
}

fn ready_host(filter: FilterSpec) -> FilterChainHost {
    let config = config(filter);
    let camera = SyntheticCamera::new(config.preview).with_motion(false);
    let mut host = FilterChainHost::new(Box::new(RecordingBackend::new()), Box::new(camera), config);
    host.surface_created().unwrap();
    host
}

fn render(host: &mut FilterChainHost) -> Option<RenderOutput> {
    host.handle().frame_available();
    host.tick().output
}

fn intensity(host: &FilterChainHost) -> Option<f32> {
    match host.stage()? {
        Stage::Basic(stage) => stage.uniforms()?.get_f32("intensity"),
        Stage::Composite(stage) => stage.base().uniforms()?.get_f32("intensity"),
    }
}

fn png(width: u32, height: u32, pixel: [u8; 4]) -> Vec<u8> {
    let image = RgbaImage::from_pixel(width, height, Rgba(pixel));
    let mut bytes = Cursor::new(Vec::new());
    image.write_to(&mut bytes, ImageFormat::Png).unwrap();
    bytes.into_inner()
}

#[test]
fn uniform_queued_before_swap_is_discarded_with_the_old_stage() {
    let mut host = ready_host(FilterSpec::Grayscale);
    let handle = host.handle();
    handle.set_uniform("intensity", UniformValue::Float(0.25));
    let swap = handle.set_filter(FilterSpec::Sepia);
    handle.frame_available();
    host.tick();

    swap.wait().unwrap();
    assert_eq!(host.filter(), &FilterSpec::Sepia);
    assert_eq!(intensity(&host), Some(1.0));

    handle.set_uniform("intensity", UniformValue::Float(0.5));
    render(&mut host);
    assert_eq!(intensity(&host), Some(0.5));
}

#[test]
fn uniforms_survive_rotation_and_orientation_rebuilds() {
    let mut host = ready_host(FilterSpec::Grayscale);
    let handle = host.handle();
    handle.set_uniform("intensity", UniformValue::Float(0.25));
    render(&mut host);
    assert_eq!(intensity(&host), Some(0.25));

    handle.set_rotation(Rotation::Deg90);
    render(&mut host);
    assert_eq!(intensity(&host), Some(0.25));

    handle.set_orientation(Orientation::Portrait);
    render(&mut host);
    assert_eq!(intensity(&host), Some(0.25));

    // A rejected swap leaves the running filter's values in place.
    let swap = handle.set_filter(FilterSpec::custom("broken", "void mainImage("));
    host.tick();
    assert!(swap.wait().unwrap_err().is_compile());
    handle.set_rotation(Rotation::Deg270);
    render(&mut host);
    assert_eq!(intensity(&host), Some(0.25));
}

#[test]
fn uniform_sent_before_the_surface_reaches_the_first_stage() {
    let config = config(FilterSpec::Sepia);
    let camera = SyntheticCamera::new(config.preview).with_motion(false);
    let mut host = FilterChainHost::new(Box::new(RecordingBackend::new()), Box::new(camera), config);
    host.handle().set_uniform("intensity", UniformValue::Float(0.75));
    host.tick();
    host.surface_created().unwrap();
    render(&mut host);
    assert_eq!(intensity(&host), Some(0.75));
}

#[test]
fn failed_compile_keeps_previous_filter_output() {
    let mut host = ready_host(FilterSpec::Invert);
    assert!(matches!(render(&mut host), Some(RenderOutput::Drawn(_))));
    let mut before = Vec::new();
    host.read_output(&mut before).unwrap();

    let swap = host
        .handle()
        .set_filter(FilterSpec::custom("broken", "void mainImage(out vec4 color, in vec2 uv) {"));
    assert!(matches!(render(&mut host), Some(RenderOutput::Drawn(_))));
    let err = swap.wait().unwrap_err();
    assert!(err.is_compile(), "{err}");
    assert_eq!(host.filter(), &FilterSpec::Invert);

    let mut after = Vec::new();
    host.read_output(&mut after).unwrap();
    assert_eq!(before, after);
}

#[test]
fn swaps_do_not_leak_gpu_objects() {
    let mut host = ready_host(FilterSpec::Identity);
    render(&mut host);
    let baseline = host.backend().live_objects();

    for spec in [
        FilterSpec::Watermark,
        FilterSpec::Grayscale,
        FilterSpec::custom("broken", "nope"),
        FilterSpec::Sepia,
        FilterSpec::Identity,
    ] {
        let _ = host.handle().set_filter(spec);
        render(&mut host);
    }
    assert_eq!(host.backend().live_objects(), baseline);

    host.destroy();
    assert_eq!(host.backend().live_objects().total(), 0);
}

#[test]
fn capture_callback_fires_once_per_request() {
    let mut host = ready_host(FilterSpec::Identity);
    let captures = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&captures);
    let handle = host.handle();
    handle.set_capture_callback(move |rgba: &[u8], width: u32, height: u32| -> anyhow::Result<()> {
        assert_eq!(rgba.len(), (width * height * 4) as usize);
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    handle.request_capture_frame();
    let reports: Vec<bool> = (0..3)
        .map(|_| {
            handle.frame_available();
            host.tick().captured
        })
        .collect();
    assert_eq!(reports, vec![true, false, false]);
    assert_eq!(captures.load(Ordering::SeqCst), 1);
    assert!(!handle.capture_pending());
}

#[test]
fn encoding_relays_every_rendered_frame() {
    let mut host = ready_host(FilterSpec::Identity);
    let (tx, rx) = unbounded();
    let handle = host.handle();
    handle
        .enable_encoding(move |rgba: &[u8], width: u32, height: u32| -> anyhow::Result<()> {
            tx.send((rgba.len(), width, height))?;
            Ok(())
        })
        .unwrap();

    for _ in 0..3 {
        handle.frame_available();
        assert!(host.tick().relayed);
    }
    for _ in 0..3 {
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (8 * 4 * 4, 8, 4));
    }

    handle.disable_encoding();
    handle.frame_available();
    assert!(!host.tick().relayed);
    assert_eq!(handle.relay_stats().pushed, 3);
}

#[test]
fn watermark_overlay_lands_at_its_anchor() {
    let mut host = ready_host(FilterSpec::Watermark);
    let handle = host.handle();
    handle.set_overlay_placement(OverlayPlacement::Anchor(OverlayAnchor::LeftBottom));
    handle.set_overlay_image(&png(2, 2, [200, 10, 10, 255])).unwrap();
    render(&mut host);

    let mut pixels = Vec::new();
    let size = host.read_output(&mut pixels).unwrap();
    assert_eq!(size, Size::new(8, 4));
    let pixel = |x: u32, y: u32| {
        let offset = ((y * size.width + x) * 4) as usize;
        (pixels[offset + 1], pixels[offset + 2])
    };
    // Recording draws store (sampled byte, blend marker).
    assert_eq!(pixel(0, 0), (200, 0xFF));
    assert_eq!(pixel(1, 1), (200, 0xFF));
    assert_eq!(pixel(2, 0).1, 0x00);
    assert_eq!(pixel(0, 2).1, 0x00);
}

#[test]
fn render_thread_runs_and_shuts_down() {
    let config = config(FilterSpec::Grayscale);
    let camera = SyntheticCamera::new(config.preview);
    let thread = RenderThread::spawn(
        config,
        || Ok(Box::new(RecordingBackend::new()) as filterchain::BoxedBackend),
        Box::new(camera),
    )
    .unwrap();

    let handle = thread.handle();
    let (tx, rx) = unbounded();
    handle
        .enable_encoding(move |_: &[u8], width: u32, height: u32| -> anyhow::Result<()> {
            tx.send((width, height))?;
            Ok(())
        })
        .unwrap();
    for _ in 0..3 {
        handle.frame_available();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (8, 4));
    }

    let err = handle
        .set_filter(FilterSpec::custom("broken", "void mainImage("))
        .wait()
        .unwrap_err();
    assert!(err.is_compile());

    handle.set_preview_size(Size::new(6, 2));
    assert!(handle.flush(Duration::from_secs(5)));
    assert_eq!(handle.pending_work(), 0);

    thread.shutdown().unwrap();
    assert!(!handle.is_encoding());
    assert!(!handle.frame_available());
}
