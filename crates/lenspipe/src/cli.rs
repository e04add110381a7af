use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use filterchain::{BackendKind, FilterSpec, Orientation, OverlayAnchor, Rotation};

#[derive(Parser, Debug)]
#[command(
    name = "lenspipe",
    author,
    version,
    about = "Runs camera frames through a GPU filter chain and relays the result"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Render frames from the synthetic camera through a filter.
    Run(RunArgs),
    /// Compile a custom `mainImage` fragment body and print its uniforms.
    CheckShader(CheckShaderArgs),
    /// List the built-in filter identifiers.
    Filters,
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Pipeline configuration TOML; command-line flags override its values.
    #[arg(long, value_name = "PATH", env = "LENSPIPE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Built-in filter (`identity`, `rotation:90`, `grayscale`, `sepia`, `invert`, `watermark`).
    #[arg(long, value_name = "NAME", value_parser = parse_filter)]
    pub filter: Option<FilterSpec>,

    /// Custom fragment body defining `mainImage`; overrides `--filter`.
    #[arg(long, value_name = "PATH", conflicts_with = "filter")]
    pub fragment: Option<PathBuf>,

    /// Value of the `intensity` uniform (0..1).
    #[arg(long, value_name = "VALUE")]
    pub intensity: Option<f32>,

    /// Overlay image for the watermark filter.
    #[arg(long, value_name = "PATH")]
    pub overlay: Option<PathBuf>,

    /// Overlay anchor: `center`, `left-top`, `right-top`, `left-bottom`, `right-bottom`.
    #[arg(long, value_name = "ANCHOR", value_parser = parse_anchor)]
    pub anchor: Option<OverlayAnchor>,

    /// Camera preview resolution (e.g. `1280x720`).
    #[arg(long, value_name = "WIDTHxHEIGHT")]
    pub size: Option<String>,

    /// Display surface size; defaults to the preview resolution.
    #[arg(long, value_name = "WIDTHxHEIGHT")]
    pub display: Option<String>,

    /// Device rotation in degrees (0, 90, 180, 270).
    #[arg(long, value_name = "DEGREES", value_parser = parse_rotation)]
    pub rotation: Option<Rotation>,

    /// `landscape` or `portrait`; portrait swaps the preview dimensions.
    #[arg(long, value_name = "ORIENTATION", value_parser = parse_orientation)]
    pub orientation: Option<Orientation>,

    /// Shrink the display to the preview aspect ratio.
    #[arg(long)]
    pub fit_display: bool,

    /// Number of camera frames to produce.
    #[arg(long, value_name = "COUNT")]
    pub frames: Option<u64>,

    /// Camera frame rate (0 = as fast as possible).
    #[arg(long, value_name = "FPS")]
    pub fps: Option<f32>,

    /// GPU backend: `wgpu` or `recording` (CPU, no GPU required).
    #[arg(
        long,
        value_name = "BACKEND",
        value_parser = parse_backend,
        default_value_t = BackendKind::default()
    )]
    pub backend: BackendKind,

    /// Prefer a software adapter when using the wgpu backend.
    #[arg(long)]
    pub fallback_adapter: bool,

    /// Directory receiving relayed frames as numbered PNG files.
    #[arg(long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Keep every Nth relayed frame.
    #[arg(long, value_name = "N", default_value_t = 1)]
    pub every: u64,

    /// Capture one frame to this PNG path.
    #[arg(long, value_name = "PATH")]
    pub capture: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct CheckShaderArgs {
    /// Fragment body file.
    #[arg(value_name = "PATH")]
    pub path: PathBuf,
}

pub fn parse() -> Cli {
    Cli::parse()
}

pub fn parse_filter(value: &str) -> Result<FilterSpec, String> {
    if value.trim().is_empty() {
        return Err("filter name must not be empty".to_string());
    }
    value.parse()
}

pub fn parse_anchor(value: &str) -> Result<OverlayAnchor, String> {
    value.parse()
}

pub fn parse_orientation(value: &str) -> Result<Orientation, String> {
    value.parse()
}

pub fn parse_backend(value: &str) -> Result<BackendKind, String> {
    value.parse()
}

pub fn parse_rotation(value: &str) -> Result<Rotation, String> {
    let trimmed = value.trim().trim_end_matches("deg");
    let degrees: i32 = trimmed
        .parse()
        .map_err(|_| format!("invalid rotation '{value}'; expected 0, 90, 180 or 270"))?;
    if degrees.rem_euclid(90) != 0 {
        return Err(format!(
            "unsupported rotation {degrees}; expected a multiple of 90"
        ));
    }
    Ok(Rotation::from_degrees(degrees))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_accepts_multiples_of_ninety() {
        assert_eq!(parse_rotation("270").unwrap(), Rotation::Deg270);
        assert_eq!(parse_rotation("-90").unwrap(), Rotation::Deg270);
        assert_eq!(parse_rotation("90deg").unwrap(), Rotation::Deg90);
        assert!(parse_rotation("45").is_err());
        assert!(parse_rotation("up").is_err());
    }

    #[test]
    fn filter_parser_rejects_unknown_names() {
        assert_eq!(parse_filter("Sepia").unwrap(), FilterSpec::Sepia);
        assert!(parse_filter("").is_err());
        assert!(parse_filter("blur").is_err());
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from([
            "lenspipe",
            "run",
            "--filter",
            "rotation:270",
            "--backend",
            "recording",
            "--frames",
            "3",
            "--anchor",
            "center",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run subcommand");
        };
        assert_eq!(args.filter, Some(FilterSpec::Rotation(Rotation::Deg270)));
        assert_eq!(args.backend, BackendKind::Recording);
        assert_eq!(args.frames, Some(3));
        assert_eq!(args.anchor, Some(OverlayAnchor::Center));
        assert_eq!(args.every, 1);
    }
}
