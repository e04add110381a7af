use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chainconfig::PipelineConfig;
use filterchain::{BackendKind, HostConfig, OverlayPlacement, PowerPreference, Size, WgpuOptions};
use tracing::debug;

use crate::bindings::{
    filter_from_section, load_fragment, map_orientation, map_resolution, placement_from_section,
    resolve_relative,
};
use crate::cli::RunArgs;

const DEFAULT_FRAMES: u64 = 120;
const DEFAULT_FPS: f32 = 30.0;

/// Overlay image and where it goes.
#[derive(Debug, Clone)]
pub struct OverlayPlan {
    pub image: PathBuf,
    pub placement: OverlayPlacement,
}

/// Everything a run needs, after merging the config file and the flags.
#[derive(Debug)]
pub struct RunPlan {
    pub host: HostConfig,
    pub backend: BackendKind,
    pub wgpu: WgpuOptions,
    pub intensity: Option<f32>,
    pub overlay: Option<OverlayPlan>,
    pub frames: u64,
    /// `None` runs the camera as fast as the render thread accepts frames.
    pub frame_interval: Option<Duration>,
    pub output: Option<PathBuf>,
    pub every: u64,
    pub capture: Option<PathBuf>,
}

pub fn parse_surface_size(spec: &str) -> Result<Size> {
    let trimmed = spec.trim();
    let (width, height) = trimmed
        .split_once(['x', 'X', '×'])
        .ok_or_else(|| anyhow::anyhow!("expected WxH format, e.g. 1280x720"))?;

    let width: u32 = width
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid width in size argument"))?;
    let height: u32 = height
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid height in size argument"))?;

    if width == 0 || height == 0 {
        bail!("surface dimensions must be greater than zero");
    }

    Ok(Size::new(width, height))
}

pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read pipeline config {}", path.display()))?;
    let config = PipelineConfig::from_toml_str(&raw)
        .with_context(|| format!("invalid pipeline config {}", path.display()))?;
    debug!(path = %path.display(), "loaded pipeline config");
    Ok(config)
}

pub fn build_plan(args: &RunArgs) -> Result<RunPlan> {
    let (config, base) = match &args.config {
        Some(path) => (load_config(path)?, path.parent().map(Path::to_path_buf)),
        None => (PipelineConfig::default(), None),
    };
    let base = base.as_deref();

    let preview = match &args.size {
        Some(size) => parse_surface_size(size)?,
        None => map_resolution(config.preview),
    };
    let display = match (&args.display, &args.size, config.display) {
        (Some(display), _, _) => parse_surface_size(display)?,
        // An explicit preview size on the command line also sizes the display.
        (None, Some(_), _) => preview,
        (None, None, Some(display)) => map_resolution(display),
        (None, None, None) => preview,
    };

    let filter = if let Some(fragment) = &args.fragment {
        load_fragment(fragment)?
    } else if let Some(filter) = &args.filter {
        filter.clone()
    } else {
        filter_from_section(&config.filter, base)?
    };

    let intensity = args.intensity.or(config.filter.intensity);
    if let Some(intensity) = intensity {
        if !(0.0..=1.0).contains(&intensity) {
            bail!("intensity must be within 0..=1; got {intensity}");
        }
    }

    let overlay = match (&args.overlay, &config.overlay) {
        (Some(image), section) => {
            let placement = match (args.anchor, section) {
                (Some(anchor), _) => OverlayPlacement::Anchor(anchor),
                (None, Some(section)) => placement_from_section(section)?,
                (None, None) => OverlayPlacement::default(),
            };
            Some(OverlayPlan {
                image: image.clone(),
                placement,
            })
        }
        (None, Some(section)) => Some(OverlayPlan {
            image: resolve_relative(base, &section.image),
            placement: match args.anchor {
                Some(anchor) => OverlayPlacement::Anchor(anchor),
                None => placement_from_section(section)?,
            },
        }),
        (None, None) => None,
    };

    let rotation = match args.rotation {
        Some(rotation) => rotation,
        None => filterchain::Rotation::from_degrees(config.rotation),
    };
    let orientation = args
        .orientation
        .or(config.orientation.map(map_orientation))
        .unwrap_or_default();

    let host = HostConfig {
        preview,
        display,
        rotation,
        orientation,
        filter,
        relay_capacity: config.relay.capacity,
        relay_wait: config.relay.wait_timeout,
        fit_display_to_preview: args.fit_display || config.fit_display,
        ..HostConfig::default()
    };

    let fps = args.fps.or(config.run.fps).unwrap_or(DEFAULT_FPS);
    if !fps.is_finite() || fps < 0.0 {
        bail!("fps must be >= 0; got {fps}");
    }
    let frame_interval = (fps > 0.0).then(|| Duration::from_secs_f32(1.0 / fps));

    if args.every == 0 {
        bail!("--every must be at least 1");
    }

    Ok(RunPlan {
        host,
        backend: args.backend,
        wgpu: WgpuOptions {
            power: PowerPreference::default(),
            force_fallback_adapter: args.fallback_adapter,
        },
        intensity,
        overlay,
        frames: args.frames.or(config.run.frames).unwrap_or(DEFAULT_FRAMES),
        frame_interval,
        output: args.output.clone(),
        every: args.every,
        capture: args.capture.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use filterchain::{FilterSpec, OverlayAnchor};

    #[test]
    fn parses_surface_sizes() {
        assert_eq!(parse_surface_size("1280x720").unwrap(), Size::new(1280, 720));
        assert_eq!(parse_surface_size(" 64 X 32 ").unwrap(), Size::new(64, 32));
        assert!(parse_surface_size("0x720").is_err());
        assert!(parse_surface_size("1280").is_err());
    }

    #[test]
    fn flags_fill_in_defaults() {
        let args = RunArgs {
            size: Some("64x32".to_string()),
            filter: Some(FilterSpec::Grayscale),
            fps: Some(0.0),
            every: 1,
            ..RunArgs::default()
        };
        let plan = build_plan(&args).unwrap();
        assert_eq!(plan.host.preview, Size::new(64, 32));
        assert_eq!(plan.host.display, Size::new(64, 32));
        assert_eq!(plan.host.filter, FilterSpec::Grayscale);
        assert_eq!(plan.frames, DEFAULT_FRAMES);
        assert!(plan.frame_interval.is_none());
        assert!(plan.overlay.is_none());
    }

    #[test]
    fn overlay_flag_uses_anchor_flag() {
        let args = RunArgs {
            overlay: Some(PathBuf::from("logo.png")),
            anchor: Some(OverlayAnchor::LeftTop),
            every: 1,
            ..RunArgs::default()
        };
        let plan = build_plan(&args).unwrap();
        let overlay = plan.overlay.unwrap();
        assert_eq!(overlay.placement, OverlayPlacement::Anchor(OverlayAnchor::LeftTop));
    }

    #[test]
    fn zero_every_is_rejected() {
        let args = RunArgs::default();
        assert!(build_plan(&args).is_err());
    }
}
