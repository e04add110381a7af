use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Pixel dimensions of a texture, framebuffer or surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// True when either dimension is zero; such sizes never allocate GPU objects.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Number of bytes in a tightly packed RGBA8 image of this size.
    pub fn rgba_len(&self) -> usize {
        self.area() * 4
    }

    pub fn swapped(&self) -> Self {
        Self::new(self.height, self.width)
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Content rotation applied through the texture-coordinate table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Maps a device rotation in degrees. Anything that is not a right angle maps to `Deg0`.
    pub fn from_degrees(degrees: i32) -> Self {
        match degrees.rem_euclid(360) {
            90 => Rotation::Deg90,
            180 => Rotation::Deg180,
            270 => Rotation::Deg270,
            _ => Rotation::Deg0,
        }
    }

    pub fn degrees(&self) -> u32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }
}

/// Physical orientation of the preview.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    #[default]
    Landscape,
    Portrait,
}

impl FromStr for Orientation {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "landscape" => Ok(Orientation::Landscape),
            "portrait" => Ok(Orientation::Portrait),
            other => Err(format!(
                "unknown orientation '{other}'; expected landscape or portrait"
            )),
        }
    }
}

/// Viewport rectangle in framebuffer pixels, origin at the bottom-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub const fn full(size: Size) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    /// Intersects the rectangle with `0..size`; `None` when nothing remains visible.
    pub fn clamp_to(&self, size: Size) -> Option<Rect> {
        let left = i64::from(self.x).max(0);
        let bottom = i64::from(self.y).max(0);
        let right = (i64::from(self.x) + i64::from(self.width)).min(i64::from(size.width));
        let top = (i64::from(self.y) + i64::from(self.height)).min(i64::from(size.height));
        if right <= left || top <= bottom {
            return None;
        }
        Some(Rect::new(
            left as i32,
            bottom as i32,
            (right - left) as u32,
            (top - bottom) as u32,
        ))
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        let (x, y) = (i64::from(x), i64::from(y));
        x >= i64::from(self.x)
            && y >= i64::from(self.y)
            && x < i64::from(self.x) + i64::from(self.width)
            && y < i64::from(self.y) + i64::from(self.height)
    }
}

/// Named placement of the overlay relative to the input frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverlayAnchor {
    Center,
    LeftTop,
    RightTop,
    LeftBottom,
    #[default]
    RightBottom,
}

impl FromStr for OverlayAnchor {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "center" | "centre" => Ok(OverlayAnchor::Center),
            "left-top" | "top-left" => Ok(OverlayAnchor::LeftTop),
            "right-top" | "top-right" => Ok(OverlayAnchor::RightTop),
            "left-bottom" | "bottom-left" => Ok(OverlayAnchor::LeftBottom),
            "right-bottom" | "bottom-right" => Ok(OverlayAnchor::RightBottom),
            _ => Err(format!(
                "unknown overlay anchor '{}'; expected center, left-top, right-top, left-bottom or right-bottom",
                value.trim()
            )),
        }
    }
}

/// Where the overlay lands on the off-screen target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayPlacement {
    Anchor(OverlayAnchor),
    /// Explicit rectangle. A zero width or height falls back to the bitmap's dimension.
    Custom(Rect),
}

impl Default for OverlayPlacement {
    fn default() -> Self {
        OverlayPlacement::Anchor(OverlayAnchor::default())
    }
}

/// Enumerated filter identifiers accepted by the host.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterSpec {
    /// Passthrough using the device rotation.
    Identity,
    /// Passthrough with a fixed content rotation that overrides the device rotation.
    Rotation(Rotation),
    Grayscale,
    Sepia,
    Invert,
    /// Passthrough base pass plus a blended overlay.
    Watermark,
    /// User supplied `mainImage` body.
    Custom { label: String, fragment: String },
}

impl FilterSpec {
    pub const BUILTIN: [&'static str; 6] = [
        "identity",
        "rotation",
        "grayscale",
        "sepia",
        "invert",
        "watermark",
    ];

    pub fn name(&self) -> &str {
        match self {
            FilterSpec::Identity => "identity",
            FilterSpec::Rotation(_) => "rotation",
            FilterSpec::Grayscale => "grayscale",
            FilterSpec::Sepia => "sepia",
            FilterSpec::Invert => "invert",
            FilterSpec::Watermark => "watermark",
            FilterSpec::Custom { label, .. } => label,
        }
    }

    pub fn custom(label: impl Into<String>, fragment: impl Into<String>) -> Self {
        FilterSpec::Custom {
            label: label.into(),
            fragment: fragment.into(),
        }
    }

    /// True for filters that composite an overlay.
    pub fn is_composite(&self) -> bool {
        matches!(self, FilterSpec::Watermark)
    }
}

impl Default for FilterSpec {
    fn default() -> Self {
        FilterSpec::Identity
    }
}

impl FromStr for FilterSpec {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        if let Some(degrees) = normalized.strip_prefix("rotation") {
            let degrees = degrees.trim_start_matches([':', '-', '@']);
            if degrees.is_empty() {
                return Ok(FilterSpec::Rotation(Rotation::Deg90));
            }
            let parsed: i32 = degrees
                .parse()
                .map_err(|_| format!("invalid rotation filter angle '{degrees}'"))?;
            return Ok(FilterSpec::Rotation(Rotation::from_degrees(parsed)));
        }
        match normalized.as_str() {
            "identity" | "none" | "normal" => Ok(FilterSpec::Identity),
            "grayscale" | "greyscale" | "gray" => Ok(FilterSpec::Grayscale),
            "sepia" => Ok(FilterSpec::Sepia),
            "invert" | "negative" => Ok(FilterSpec::Invert),
            "watermark" | "overlay" => Ok(FilterSpec::Watermark),
            _ => Err(format!(
                "unknown filter '{}'; expected one of {}",
                value.trim(),
                Self::BUILTIN.join(", ")
            )),
        }
    }
}

/// Settings the host starts with. Everything except `relay_*` can be changed
/// later through [`crate::HostHandle`].
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Camera preview resolution; the off-screen target is allocated at this size.
    pub preview: Size,
    /// Display surface size; the final blit covers this viewport.
    pub display: Size,
    pub rotation: Rotation,
    pub orientation: Orientation,
    pub filter: FilterSpec,
    /// Maximum frames waiting for the consumer before new frames are dropped.
    pub relay_capacity: usize,
    /// Idle wait of the consumer thread between queue checks.
    pub relay_wait: Duration,
    /// Shrink the display to the preview aspect ratio when the preview size changes.
    pub fit_display_to_preview: bool,
    pub clear_color: [f32; 4],
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            preview: Size::new(1280, 720),
            display: Size::new(1280, 720),
            rotation: Rotation::Deg0,
            orientation: Orientation::Landscape,
            filter: FilterSpec::Identity,
            relay_capacity: 8,
            relay_wait: Duration::from_millis(500),
            fit_display_to_preview: false,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}
