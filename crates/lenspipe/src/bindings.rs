use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chainconfig::{AnchorSetting, FilterSection, OrientationSetting, OverlaySection, Resolution};
use filterchain::{FilterSpec, Orientation, OverlayAnchor, OverlayPlacement, Rect, Size};

pub fn map_resolution(resolution: Resolution) -> Size {
    Size::new(resolution.width, resolution.height)
}

pub fn map_orientation(orientation: OrientationSetting) -> Orientation {
    match orientation {
        OrientationSetting::Landscape => Orientation::Landscape,
        OrientationSetting::Portrait => Orientation::Portrait,
    }
}

pub fn map_anchor(anchor: AnchorSetting) -> OverlayAnchor {
    match anchor {
        AnchorSetting::Center => OverlayAnchor::Center,
        AnchorSetting::LeftTop => OverlayAnchor::LeftTop,
        AnchorSetting::RightTop => OverlayAnchor::RightTop,
        AnchorSetting::LeftBottom => OverlayAnchor::LeftBottom,
        AnchorSetting::RightBottom => OverlayAnchor::RightBottom,
    }
}

/// Resolves `path` against the directory of the config file it came from.
pub fn resolve_relative(base: Option<&Path>, path: &Path) -> PathBuf {
    match base {
        Some(base) if path.is_relative() => base.join(path),
        _ => path.to_path_buf(),
    }
}

pub fn load_fragment(path: &Path) -> Result<FilterSpec> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read fragment shader {}", path.display()))?;
    let label = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("custom")
        .to_string();
    Ok(FilterSpec::custom(label, body))
}

pub fn filter_from_section(section: &FilterSection, base: Option<&Path>) -> Result<FilterSpec> {
    if let Some(fragment) = &section.fragment {
        return load_fragment(&resolve_relative(base, fragment));
    }
    section
        .kind
        .parse()
        .map_err(|err: String| anyhow::anyhow!(err))
        .context("invalid filter.kind in configuration")
}

pub fn placement_from_section(section: &OverlaySection) -> Result<OverlayPlacement> {
    if let Some(rect) = section.rect()? {
        return Ok(OverlayPlacement::Custom(Rect::new(
            rect.x,
            rect.y,
            rect.width,
            rect.height,
        )));
    }
    Ok(OverlayPlacement::Anchor(
        section.anchor.map(map_anchor).unwrap_or_default(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_follow_the_config_file() {
        let base = Path::new("/etc/lenspipe");
        assert_eq!(
            resolve_relative(Some(base), Path::new("logo.png")),
            PathBuf::from("/etc/lenspipe/logo.png")
        );
        assert_eq!(
            resolve_relative(Some(base), Path::new("/tmp/logo.png")),
            PathBuf::from("/tmp/logo.png")
        );
        assert_eq!(
            resolve_relative(None, Path::new("logo.png")),
            PathBuf::from("logo.png")
        );
    }

    #[test]
    fn overlay_rect_wins_over_default_anchor() {
        let section = OverlaySection {
            image: PathBuf::from("logo.png"),
            anchor: None,
            rect: Some([4, 2, 0, 10]),
        };
        assert_eq!(
            placement_from_section(&section).unwrap(),
            OverlayPlacement::Custom(Rect::new(4, 2, 0, 10))
        );

        let anchored = OverlaySection {
            rect: None,
            anchor: Some(AnchorSetting::Center),
            ..section
        };
        assert_eq!(
            placement_from_section(&anchored).unwrap(),
            OverlayPlacement::Anchor(OverlayAnchor::Center)
        );
    }

    #[test]
    fn filter_kind_is_parsed() {
        let section = FilterSection {
            kind: "invert".to_string(),
            intensity: None,
            fragment: None,
        };
        assert_eq!(filter_from_section(&section, None).unwrap(), FilterSpec::Invert);
    }
}
