use std::fs;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::bounded;
use filterchain::compile::reflect;
use filterchain::shaders::{wrap_fragment, VERTEX_SHADER};
use filterchain::{create_backend, FilterSpec, HostHandle, RenderThread, SyntheticCamera, UniformValue};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::bootstrap::{build_plan, RunPlan};
use crate::cli::{CheckShaderArgs, Cli, Command, RunArgs};
use crate::sink::{write_png, PngSequenceSink};

/// Upper bound on waiting for the consumer to finish queued frames.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(10);

pub fn run(cli: Cli) -> Result<()> {
    initialise_tracing();
    match cli.command {
        Command::Run(args) => run_pipeline(&args),
        Command::CheckShader(args) => check_shader(&args),
        Command::Filters => {
            list_filters();
            Ok(())
        }
    }
}

fn initialise_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn list_filters() {
    for name in FilterSpec::BUILTIN {
        println!("{name}");
    }
}

fn check_shader(args: &CheckShaderArgs) -> Result<()> {
    let body = fs::read_to_string(&args.path)
        .with_context(|| format!("failed to read fragment shader {}", args.path.display()))?;
    let label = args
        .path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("custom");
    let reflection = reflect(label, VERTEX_SHADER, &wrap_fragment(&body))?;
    println!("{}: ok ({} byte uniform block)", args.path.display(), reflection.uniform_size);
    for (name, field) in &reflection.uniforms {
        println!("  {name:<18} offset {:>3} size {:>2}", field.offset, field.size);
    }
    Ok(())
}

fn run_pipeline(args: &RunArgs) -> Result<()> {
    let plan = build_plan(args)?;
    info!(
        backend = %plan.backend,
        filter = %plan.host.filter.name(),
        preview = %plan.host.preview,
        display = %plan.host.display,
        frames = plan.frames,
        "starting filter chain"
    );

    let overlay_bytes = plan
        .overlay
        .as_ref()
        .map(|overlay| {
            fs::read(&overlay.image)
                .with_context(|| format!("failed to read overlay image {}", overlay.image.display()))
        })
        .transpose()?;

    let camera = SyntheticCamera::new(plan.host.preview);
    let (backend, wgpu) = (plan.backend, plan.wgpu);
    let thread = RenderThread::spawn(
        plan.host.clone(),
        move || create_backend(backend, wgpu),
        Box::new(camera),
    )?;
    let handle = thread.handle();

    let result = drive(&plan, &handle, overlay_bytes.as_deref());
    let stats = handle.relay_stats();
    thread.shutdown()?;
    let written = result?;

    info!(
        pushed = stats.pushed,
        delivered = stats.delivered,
        dropped = stats.dropped,
        failed = stats.failed,
        written,
        "filter chain finished"
    );
    println!(
        "relayed {} frames ({} delivered, {} dropped, {} failed), wrote {} files",
        stats.pushed, stats.delivered, stats.dropped, stats.failed, written
    );
    Ok(())
}

/// Feeds frames to the render thread and waits for the sinks. Returns the number of PNGs written.
fn drive(plan: &RunPlan, handle: &HostHandle, overlay: Option<&[u8]>) -> Result<u64> {
    if let (Some(bytes), Some(overlay)) = (overlay, plan.overlay.as_ref()) {
        if !plan.host.filter.is_composite() {
            warn!(filter = %plan.host.filter.name(), "overlay ignored; use the watermark filter");
        }
        handle.set_overlay_placement(overlay.placement);
        handle
            .set_overlay_image(bytes)
            .with_context(|| format!("invalid overlay image {}", overlay.image.display()))?;
    }
    if let Some(intensity) = plan.intensity {
        handle.set_uniform("intensity", UniformValue::Float(intensity));
    }

    let written = match &plan.output {
        Some(directory) => {
            let sink = PngSequenceSink::create(directory, plan.every)?;
            let written = sink.written();
            handle.enable_encoding(sink)?;
            Some(written)
        }
        None => None,
    };

    let capture = match &plan.capture {
        Some(path) => Some(arm_capture(handle, path.clone())?),
        None => None,
    };

    let started = Instant::now();
    for frame in 0..plan.frames {
        if !handle.frame_available() {
            bail!("render thread stopped unexpectedly");
        }
        if let Some(interval) = plan.frame_interval {
            let due = started + interval.mul_f64((frame + 1) as f64);
            if let Some(wait) = due.checked_duration_since(Instant::now()) {
                thread::sleep(wait);
            }
        }
    }

    if let Some(done) = capture {
        done.recv_timeout(CAPTURE_TIMEOUT)
            .map_err(|_| anyhow!("timed out waiting for the capture frame"))??;
    }

    if !handle.flush(DRAIN_TIMEOUT) {
        warn!("render thread did not finish queued frames");
    }
    if written.is_some() {
        wait_for_drain(handle);
        handle.disable_encoding();
    }
    Ok(written.map_or(0, |written| written.load(Ordering::Relaxed)))
}

fn arm_capture(
    handle: &HostHandle,
    path: PathBuf,
) -> Result<crossbeam_channel::Receiver<Result<()>>> {
    let (done_tx, done_rx) = bounded(1);
    let callback = move |rgba: &[u8], width: u32, height: u32| -> Result<()> {
        let result = write_png(&path, rgba, width, height);
        if result.is_ok() {
            info!(path = %path.display(), width, height, "captured frame");
        }
        let reported = result.as_ref().map(|_| ()).map_err(|err| anyhow!("{err:#}"));
        let _ = done_tx.try_send(reported);
        result
    };
    if !handle.set_capture_callback(callback) {
        bail!("render thread stopped before the capture was armed");
    }
    handle.request_capture_frame();
    Ok(done_rx)
}

/// Waits until every pushed frame has reached the sink, or the timeout passes.
fn wait_for_drain(handle: &HostHandle) {
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    loop {
        let stats = handle.relay_stats();
        if stats.delivered + stats.failed >= stats.pushed {
            return;
        }
        if Instant::now() >= deadline {
            warn!(
                pushed = stats.pushed,
                delivered = stats.delivered,
                "relay did not drain before shutdown"
            );
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
}
