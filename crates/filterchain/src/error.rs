use std::fmt;

/// Shader stage a compile error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderKind {
    Vertex,
    Fragment,
}

impl fmt::Display for ShaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShaderKind::Vertex => f.write_str("vertex"),
            ShaderKind::Fragment => f.write_str("fragment"),
        }
    }
}

/// Errors surfaced by filter stages, the host and the frame relay.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    /// A GPU object (texture, framebuffer, buffer) could not be created or read.
    /// Recoverable: the next reconfiguration retries the allocation.
    #[error("GPU resource error: {0}")]
    Resource(String),
    /// Shader parse, validation or link failure. Fatal to the stage being built.
    #[error("failed to compile {stage} shader for `{label}`: {message}")]
    Compile {
        label: String,
        stage: ShaderKind,
        message: String,
    },
    /// Operation invoked outside of its lifecycle window.
    #[error("cannot {operation} while {state}")]
    State {
        operation: &'static str,
        state: String,
    },
    /// Overlay bytes could not be decoded into an image.
    #[error("failed to decode overlay image: {0}")]
    Overlay(String),
}

impl FilterError {
    pub(crate) fn state(operation: &'static str, state: impl fmt::Debug) -> Self {
        FilterError::State {
            operation,
            state: format!("{state:?}").to_ascii_lowercase(),
        }
    }

    pub fn is_compile(&self) -> bool {
        matches!(self, FilterError::Compile { .. })
    }

    pub fn is_resource(&self) -> bool {
        matches!(self, FilterError::Resource(_))
    }
}

pub type FilterResult<T> = Result<T, FilterError>;
