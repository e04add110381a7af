use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use filterchain::FrameSink;
use image::imageops::flip_vertical_in_place;
use image::RgbaImage;

/// Writes an RGBA frame read back bottom row first as a top-down PNG.
pub fn write_png(path: &Path, rgba: &[u8], width: u32, height: u32) -> Result<()> {
    let mut image = RgbaImage::from_raw(width, height, rgba.to_vec()).with_context(|| {
        format!(
            "frame buffer holds {} bytes, expected {}x{} RGBA",
            rgba.len(),
            width,
            height
        )
    })?;
    flip_vertical_in_place(&mut image);
    image
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))
}

/// Encoder stand-in: stores every Nth relayed frame as `frame-00000.png`, ...
pub struct PngSequenceSink {
    directory: PathBuf,
    every: u64,
    received: u64,
    written: Arc<AtomicU64>,
}

impl PngSequenceSink {
    pub fn create(directory: &Path, every: u64) -> Result<Self> {
        fs::create_dir_all(directory)
            .with_context(|| format!("failed to create output directory {}", directory.display()))?;
        Ok(Self {
            directory: directory.to_path_buf(),
            every: every.max(1),
            received: 0,
            written: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Shared counter of files written so far.
    pub fn written(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.written)
    }
}

impl FrameSink for PngSequenceSink {
    fn on_frame(&mut self, rgba: &[u8], width: u32, height: u32) -> Result<()> {
        let index = self.received;
        self.received += 1;
        if index % self.every != 0 {
            return Ok(());
        }
        let path = self.directory.join(format!("frame-{index:05}.png"));
        write_png(&path, rgba, width, height)?;
        self.written.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(path = %path.display(), "wrote frame");
        Ok(())
    }
}
