//! Screen capture module
//! Uses `xcap` for screenshots of the primary display, cropped to the
//! configured board region (left, top, image_size).
//! `ReplaySource` feeds saved regions from disk for offline runs.
//! Debug: set env var `DEBUG_CAPTURE=1` to also save the raw crop to `screenshots/debug_capture.png`.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use image::{DynamicImage, GenericImageView, RgbImage};
use tracing::debug;
use xcap::Monitor;

use crate::config::BoardConfig;

/// A captured board region and where it sits on screen.
#[derive(Clone, Debug)]
pub struct Frame {
    pub image: RgbImage,
    pub left: u32,
    pub top: u32,
}

/// Supplier of board regions, polled by the scheduler.
pub trait FrameSource: Send {
    fn capture(&mut self) -> Result<Frame>;
}

pub struct ScreenCapture {
    left: u32,
    top: u32,
    size: u32,
    debug_dump: bool,
}

impl ScreenCapture {
    pub fn new(config: &BoardConfig) -> Self {
        Self {
            left: config.left,
            top: config.top,
            size: config.image_size,
            debug_dump: env::var_os("DEBUG_CAPTURE").is_some(),
        }
    }
}

impl FrameSource for ScreenCapture {
    /// Permissions note: On macOS, grant "Screen & System Audio Recording" permission to the terminal.
    fn capture(&mut self) -> Result<Frame> {
        let start = Instant::now();

        let monitors = Monitor::all().context("Failed to enumerate monitors")?;
        let primary_monitor = monitors.first().cloned().context("No monitors found")?;
        let screenshot_raw = primary_monitor
            .capture_image()
            .context("Failed to capture image. On macOS, ensure the terminal has Screen Recording permission")?;

        let screenshot = DynamicImage::ImageRgba8(screenshot_raw);
        if screenshot.dimensions() == (0, 0) {
            bail!("Captured empty screenshot - possible permission issue or no display");
        }

        let (screen_w, screen_h) = screenshot.dimensions();
        if self.left.saturating_add(self.size) > screen_w
            || self.top.saturating_add(self.size) > screen_h
        {
            bail!(
                "Board region ({},{},{}x{}) exceeds screenshot dimensions {}x{}",
                self.left, self.top, self.size, self.size, screen_w, screen_h
            );
        }

        let cropped = screenshot
            .crop_imm(self.left, self.top, self.size, self.size)
            .to_rgb8();
        if self.debug_dump {
            fs::create_dir_all("screenshots")
                .context("Failed to create screenshots/ debug directory")?;
            cropped
                .save("screenshots/debug_capture.png")
                .context("Failed to save debug capture to screenshots/")?;
        }

        debug!(latency = ?start.elapsed(), "capture + crop");
        Ok(Frame {
            image: cropped,
            left: self.left,
            top: self.top,
        })
    }
}

/// Plays back image files from a directory in name order, holding the last one.
pub struct ReplaySource {
    files: Vec<PathBuf>,
    next: usize,
    left: u32,
    top: u32,
}

impl ReplaySource {
    pub fn open(dir: &Path, config: &BoardConfig) -> Result<Self> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .with_context(|| format!("Failed to read replay directory {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| {
                        matches!(
                            ext.to_ascii_lowercase().as_str(),
                            "png" | "jpg" | "jpeg" | "bmp"
                        )
                    })
                    .unwrap_or(false)
            })
            .collect();
        if files.is_empty() {
            bail!("No images found in {}", dir.display());
        }
        files.sort();
        Ok(Self {
            files,
            next: 0,
            left: config.left,
            top: config.top,
        })
    }
}

impl FrameSource for ReplaySource {
    fn capture(&mut self) -> Result<Frame> {
        let idx = self.next.min(self.files.len() - 1);
        self.next += 1;
        let path = &self.files[idx];
        let image = image::open(path)
            .with_context(|| format!("Failed to open replay frame {}", path.display()))?
            .to_rgb8();
        Ok(Frame {
            image,
            left: self.left,
            top: self.top,
        })
    }
}
