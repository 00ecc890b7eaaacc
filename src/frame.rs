use crate::error::PipelineError;
use bytes::Bytes;
use image::RgbImage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::Notify;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed 8-bit RGB.
    Rgb8,
    /// Planar Y, then U, then V at quarter resolution.
    I420,
    /// Y plane followed by interleaved V/U at quarter resolution.
    Nv21,
}

impl PixelFormat {
    /// Buffer length for a frame of the given size, or None on overflow.
    pub fn buffer_len(self, width: u32, height: u32) -> Option<usize> {
        let luma = (width as usize).checked_mul(height as usize)?;
        match self {
            PixelFormat::Rgb8 => luma.checked_mul(3),
            PixelFormat::I420 | PixelFormat::Nv21 => {
                let chroma = (width as usize).div_ceil(2) * (height as usize).div_ceil(2);
                luma.checked_add(chroma.checked_mul(2)?)
            }
        }
    }
}

/// One frame from the preview stream. Immutable once built.
#[derive(Debug)]
pub struct Frame {
    pub data: Bytes,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
}

impl Frame {
    pub fn new(
        data: impl Into<Bytes>,
        format: PixelFormat,
        width: u32,
        height: u32,
        timestamp: Instant,
    ) -> Self {
        Frame {
            data: data.into(),
            format,
            width,
            height,
            timestamp,
        }
    }

    /// Consumes the frame, producing an owned RGB bitmap.
    pub fn into_rgb(self) -> Result<RgbImage, PipelineError> {
        let expected = self.format.buffer_len(self.width, self.height).ok_or_else(|| {
            PipelineError::Capture(format!(
                "frame dimensions {}x{} overflow",
                self.width, self.height
            ))
        })?;
        if self.data.len() < expected {
            return Err(PipelineError::Capture(format!(
                "{:?} frame {}x{} needs {} bytes, got {}",
                self.format,
                self.width,
                self.height,
                expected,
                self.data.len()
            )));
        }
        match self.format {
            PixelFormat::Rgb8 => {
                RgbImage::from_raw(self.width, self.height, self.data[..expected].to_vec())
                    .ok_or_else(|| PipelineError::Capture("invalid RGB buffer".to_string()))
            }
            PixelFormat::I420 | PixelFormat::Nv21 => Ok(self.yuv_to_rgb()),
        }
    }

    fn yuv_to_rgb(&self) -> RgbImage {
        let width = self.width as usize;
        let chroma_width = width.div_ceil(2);
        let luma_len = width * self.height as usize;
        let chroma_len = chroma_width * (self.height as usize).div_ceil(2);
        let data = &self.data;
        RgbImage::from_fn(self.width, self.height, |x, y| {
            let (x, y) = (x as usize, y as usize);
            let luma = data[y * width + x];
            let chroma = (y / 2) * chroma_width + x / 2;
            let (u, v) = match self.format {
                PixelFormat::Nv21 => (
                    data[luma_len + chroma * 2 + 1],
                    data[luma_len + chroma * 2],
                ),
                _ => (data[luma_len + chroma], data[luma_len + chroma_len + chroma]),
            };
            image::Rgb(yuv_pixel(luma, u, v))
        })
    }
}

// Full-range BT.601, as used by JFIF.
fn yuv_pixel(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;
    [
        clamp_channel(y + 1.402 * v),
        clamp_channel(y - 0.344_136 * u - 0.714_136 * v),
        clamp_channel(y + 1.772 * u),
    ]
}

fn clamp_channel(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

/// Single-slot mailbox between the frame producer and the delivery lane.
///
/// Offering a frame replaces whatever has not been consumed yet, so the
/// consumer only ever sees the latest frame and the producer never waits.
#[derive(Debug, Default)]
pub struct FrameSlot {
    latest: Mutex<Option<Frame>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offer(&self, frame: Frame) {
        let replaced = self
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(frame);
        if replaced.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
    }

    pub fn take(&self) -> Option<Frame> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Waits for and takes the next frame.
    pub async fn next(&self) -> Frame {
        loop {
            if let Some(frame) = self.take() {
                return frame;
            }
            self.notify.notified().await;
        }
    }

    /// Frames overwritten before anyone consumed them.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
