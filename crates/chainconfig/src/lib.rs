use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    pub version: u32,
    #[serde(default)]
    pub preview: Resolution,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<Resolution>,
    #[serde(default)]
    pub rotation: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orientation: Option<OrientationSetting>,
    #[serde(default)]
    pub fit_display: bool,
    #[serde(default)]
    pub filter: FilterSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overlay: Option<OverlaySection>,
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub run: RunSection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Default for Resolution {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrientationSetting {
    Landscape,
    Portrait,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilterSection {
    #[serde(default = "default_filter_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intensity: Option<f32>,
    /// Custom `mainImage` body; overrides `kind`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment: Option<PathBuf>,
}

impl Default for FilterSection {
    fn default() -> Self {
        Self {
            kind: default_filter_kind(),
            intensity: None,
            fragment: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnchorSetting {
    Center,
    LeftTop,
    RightTop,
    LeftBottom,
    RightBottom,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OverlaySection {
    pub image: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<AnchorSetting>,
    /// `[x, y, width, height]`, origin bottom-left. Zero width/height uses the image size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rect: Option<[i64; 4]>,
}

/// Overlay rectangle after range checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverlayRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl OverlaySection {
    pub fn rect(&self) -> Result<Option<OverlayRect>, ConfigError> {
        let Some([x, y, width, height]) = self.rect else {
            return Ok(None);
        };
        let position = |value: i64, name: &str| {
            i32::try_from(value)
                .map_err(|_| ConfigError::Invalid(format!("overlay.rect {name} {value} is out of range")))
        };
        let extent = |value: i64, name: &str| {
            u32::try_from(value).map_err(|_| {
                ConfigError::Invalid(format!("overlay.rect {name} must be >= 0, got {value}"))
            })
        };
        Ok(Some(OverlayRect {
            x: position(x, "x")?,
            y: position(y, "y")?,
            width: extent(width, "width")?,
            height: extent(height, "height")?,
        }))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelaySection {
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(
        default = "default_wait_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub wait_timeout: Duration,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            wait_timeout: default_wait_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RunSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frames: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<f32>,
}

fn default_filter_kind() -> String {
    "identity".to_string()
}

fn default_capacity() -> usize {
    8
}

fn default_wait_timeout() -> Duration {
    Duration::from_millis(500)
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Duration;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a duration as number of seconds or human-readable string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v)
                .map_err(|err| E::custom(format!("invalid duration '{v}': {err}")))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v < 0 {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Duration::from_secs(v as u64))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.is_nan() || v.is_sign_negative() {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Duration::from_secs_f64(v))
        }
    }

    deserializer.deserialize_any(Visitor)
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            version: 1,
            preview: Resolution::default(),
            display: None,
            rotation: 0,
            orientation: None,
            fit_display: false,
            filter: FilterSection::default(),
            overlay: None,
            relay: RelaySection::default(),
            run: RunSection::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: PipelineConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    /// Display size, falling back to the preview resolution.
    pub fn display(&self) -> Resolution {
        self.display.unwrap_or(self.preview)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != 1 {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}; expected 1",
                self.version
            )));
        }

        validate_resolution("preview", self.preview)?;
        if let Some(display) = self.display {
            validate_resolution("display", display)?;
        }

        if !matches!(self.rotation, 0 | 90 | 180 | 270) {
            return Err(ConfigError::Invalid(format!(
                "rotation must be one of 0, 90, 180 or 270; got {}",
                self.rotation
            )));
        }

        if self.filter.kind.trim().is_empty() && self.filter.fragment.is_none() {
            return Err(ConfigError::Invalid(
                "filter.kind may not be empty".into(),
            ));
        }

        if let Some(intensity) = self.filter.intensity {
            if !intensity.is_finite() || !(0.0..=1.0).contains(&intensity) {
                return Err(ConfigError::Invalid(format!(
                    "filter.intensity must be within 0..=1; got {intensity}"
                )));
            }
        }

        if let Some(overlay) = &self.overlay {
            if overlay.image.as_os_str().is_empty() {
                return Err(ConfigError::Invalid("overlay.image may not be empty".into()));
            }
            if overlay.anchor.is_some() && overlay.rect.is_some() {
                return Err(ConfigError::Invalid(
                    "overlay accepts either anchor or rect, not both".into(),
                ));
            }
            overlay.rect()?;
        }

        if self.relay.capacity == 0 {
            return Err(ConfigError::Invalid(
                "relay.capacity must be greater than zero".into(),
            ));
        }

        if self.relay.wait_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "relay.wait_timeout must be greater than zero".into(),
            ));
        }

        if let Some(fps) = self.run.fps {
            if !fps.is_finite() || fps <= 0.0 {
                return Err(ConfigError::Invalid(format!("run.fps must be > 0; got {fps}")));
            }
        }

        Ok(())
    }
}

fn validate_resolution(name: &str, resolution: Resolution) -> Result<(), ConfigError> {
    if resolution.width == 0 || resolution.height == 0 {
        return Err(ConfigError::Invalid(format!(
            "{name} resolution must be non-zero; got {}x{}",
            resolution.width, resolution.height
        )));
    }
    Ok(())
}
