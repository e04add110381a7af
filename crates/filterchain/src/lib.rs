//! GPU camera filter chain.
//!
//! Camera frames are rendered through a swappable filter stage into an
//! off-screen target, shown on the display, and read back for an encoder that
//! runs on its own thread. The overall flow is:
//!
//! ```text
//!   CameraSource ──▶ FilterChainHost::tick ──▶ Stage::render ──▶ display
//!                          ▲        │             (base → overlay → blit)
//!        HostHandle ───────┘        │ read_pixels
//!   (swap, sizes, uniforms)         ▼
//!                              FrameRelay ──▶ consumer thread ──▶ FrameSink
//! ```
//!
//! `FilterChainHost` owns the GPU backend and must stay on one thread
//! ([`RenderThread`] provides one). Every request from other threads goes
//! through [`HostHandle`] and is applied at the start of the next tick, which
//! is what keeps filter swaps and resizes safe while frames are in flight.

pub mod camera;
pub mod compile;
pub mod error;
pub mod geometry;
pub mod gpu;
pub mod matrix;
pub mod shaders;
pub mod stage;
pub mod types;

mod host;
mod relay;
mod render_thread;

pub use camera::{CameraFrame, CameraSource, SyntheticCamera};
pub use compile::{ShaderProgram, UniformValue};
pub use error::{FilterError, FilterResult, ShaderKind};
pub use gpu::{create_backend, BackendKind, BoxedBackend, GpuBackend, PowerPreference, WgpuOptions};
pub use host::{FilterChainHost, FilterSwap, HostHandle, HostState, TickReport};
pub use relay::{FrameRelay, FrameSink, PixelBuffer, RelayStats};
pub use render_thread::RenderThread;
pub use stage::{RenderOutput, Stage, StageState};
pub use types::{
    FilterSpec, HostConfig, Orientation, OverlayAnchor, OverlayPlacement, Rect, Rotation, Size,
};
