//! Screen capture for the tracker. [GenericScreenCapturer] picks the backend compiled in through
//! the `x11` or `win` features, [DiskScreenshotProvider] turns its frames into PNG files.

pub mod idle;
#[cfg(feature = "win")]
pub mod win;
#[cfg(feature = "x11")]
pub mod x11;

#[cfg(feature = "win")]
extern crate windows;

#[cfg(feature = "x11")]
extern crate xcb;

use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use image::RgbaImage;
use tracing::{debug, instrument, warn};

use crate::{
    tracker::{
        capture::{ScreenshotProvider, UnavailableScreenshotProvider},
        state::Screenshot,
    },
    utils::clock::Clock,
};

/// Uncompressed screen contents, 4 bytes per pixel in RGBA order, rows top to bottom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

/// Contract windows and linux backends implement. Capturing blocks the calling thread.
pub trait ScreenCapturer: Send {
    fn capture_frame(&mut self) -> Result<RawFrame>;
}

/// Serves as a cross-compatible ScreenCapturer implementation.
pub struct GenericScreenCapturer {
    inner: Box<dyn ScreenCapturer>,
}

impl GenericScreenCapturer {
    pub fn new() -> Result<Self> {
        cfg_if::cfg_if! {
            if #[cfg(feature = "win")] {
                use win::WindowsScreenCapturer;
                Ok(Self {
                    inner: Box::new(WindowsScreenCapturer::new()),
                })
            }
            else if #[cfg(feature = "x11")] {
                use x11::LinuxScreenCapturer;
                Ok(Self {
                    inner: Box::new(LinuxScreenCapturer::new()?),
                })
            }
            else {
                Err(anyhow!("No screen capture backend was compiled in"))
            }
        }
    }
}

impl ScreenCapturer for GenericScreenCapturer {
    fn capture_frame(&mut self) -> Result<RawFrame> {
        self.inner.capture_frame()
    }
}

/// Converts rows of 32 bit BGRX pixels, as both X11 and GDI hand them out, into RGBA.
#[cfg(any(feature = "x11", feature = "win"))]
pub(crate) fn bgrx_to_rgba(mut data: Vec<u8>) -> Vec<u8> {
    for pixel in data.chunks_exact_mut(4) {
        pixel.swap(0, 2);
        pixel[3] = u8::MAX;
    }
    data
}

/// Stores every capture as `<dir>/<YYYY-MM-DD>/<HH-MM-SS>.png`.
pub struct DiskScreenshotProvider {
    capturer: Arc<Mutex<Box<dyn ScreenCapturer>>>,
    screenshot_dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl DiskScreenshotProvider {
    pub fn new(
        capturer: impl ScreenCapturer + 'static,
        screenshot_dir: PathBuf,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            capturer: Arc::new(Mutex::new(Box::new(capturer))),
            screenshot_dir,
            clock,
        }
    }
}

#[async_trait]
impl ScreenshotProvider for DiskScreenshotProvider {
    #[instrument(skip(self))]
    async fn capture(&self) -> Result<Screenshot> {
        let taken_at = self.clock.time();
        let day_dir = self
            .screenshot_dir
            .join(taken_at.format("%Y-%m-%d").to_string());
        let path = day_dir.join(taken_at.format("%H-%M-%S.png").to_string());

        let capturer = self.capturer.clone();
        let target = path.clone();
        let (width, height) = tokio::task::spawn_blocking(move || -> Result<(u32, u32)> {
            let frame = capturer
                .lock()
                .map_err(|_| anyhow!("Screen capturer was poisoned by a previous capture"))?
                .capture_frame()?;
            let (width, height) = (frame.width, frame.height);
            let image = RgbaImage::from_raw(width, height, frame.rgba)
                .ok_or_else(|| anyhow!("Frame of {width}x{height} has a wrong buffer size"))?;
            std::fs::create_dir_all(&day_dir)
                .with_context(|| format!("Failed to create {day_dir:?}"))?;
            image.save(&target)?;
            Ok((width, height))
        })
        .await??;

        debug!("Saved {width}x{height} screenshot to {path:?}");
        Ok(Screenshot {
            path,
            taken_at,
            width,
            height,
        })
    }
}

/// Provider backed by the compiled in capture backend. Falls back to skipping every capture when
/// no backend is usable.
pub fn create_screenshot_provider(
    screenshot_dir: PathBuf,
    clock: Arc<dyn Clock>,
) -> Arc<dyn ScreenshotProvider> {
    match GenericScreenCapturer::new() {
        Ok(capturer) => Arc::new(DiskScreenshotProvider::new(capturer, screenshot_dir, clock)),
        Err(e) => {
            warn!("Screenshots are disabled: {e:?}");
            Arc::new(UnavailableScreenshotProvider)
        }
    }
}
