use crate::error::PipelineError;
use crate::types::BoundingBox;
use image::codecs::jpeg::JpegEncoder;
use image::{ImageResult, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use serde::Serialize;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_STROKE: u32 = 3;

/// Draws one rectangle per box onto the image.
pub fn annotate(mut image: RgbImage, boxes: &[BoundingBox]) -> RgbImage {
    for b in boxes {
        for inset in 0..BOX_STROKE {
            let left = b.left.round() as i32 + inset as i32;
            let top = b.top.round() as i32 + inset as i32;
            let width = b.width().round() as i64 - 2 * inset as i64;
            let height = b.height().round() as i64 - 2 * inset as i64;
            if width < 1 || height < 1 {
                break;
            }
            let rect = Rect::at(left, top).of_size(width as u32, height as u32);
            draw_hollow_rect_mut(&mut image, rect, BOX_COLOR);
        }
    }
    image
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> ImageResult<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)).encode_image(image)?;
    Ok(buffer)
}

/// Writes the image as a JPEG under `dir`, named after the current time.
pub fn persist(image: &RgbImage, dir: &Path, quality: u8) -> Result<PathBuf, PipelineError> {
    fs::create_dir_all(dir)
        .map_err(|e| PipelineError::Persistence(format!("creating {:?}: {}", dir, e)))?;
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let suffix = Uuid::new_v4().simple().to_string();
    let path = dir.join(format!("{}-{}.jpeg", millis, &suffix[..8]));

    let file = File::create(&path)
        .map_err(|e| PipelineError::Persistence(format!("creating {:?}: {}", path, e)))?;
    JpegEncoder::new_with_quality(BufWriter::new(file), quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|e| PipelineError::Persistence(format!("writing {:?}: {}", path, e)))?;
    Ok(path)
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct OverlayRect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    pub score: f32,
}

/// Boxes projected onto a preview surface.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Overlay {
    pub width: u32,
    pub height: u32,
    pub rects: Vec<OverlayRect>,
}

impl Overlay {
    pub fn empty(width: u32, height: u32) -> Self {
        Overlay {
            width,
            height,
            rects: Vec::new(),
        }
    }
}

/// Maps boxes from `source` image space onto a `target` preview that shows the
/// image scaled to fill and center-cropped. Boxes falling entirely outside
/// the visible area are dropped; the rest are clipped to it.
pub fn overlay(boxes: &[BoundingBox], source: (u32, u32), target: (u32, u32)) -> Overlay {
    let (source_w, source_h) = (source.0 as f32, source.1 as f32);
    let (target_w, target_h) = (target.0 as f32, target.1 as f32);
    if source_w <= 0.0 || source_h <= 0.0 {
        return Overlay::empty(target.0, target.1);
    }
    let scale = (target_w / source_w).max(target_h / source_h);
    let offset_x = (target_w - source_w * scale) / 2.0;
    let offset_y = (target_h - source_h * scale) / 2.0;

    let rects = boxes
        .iter()
        .map(|b| OverlayRect {
            left: (b.left * scale + offset_x).clamp(0.0, target_w),
            top: (b.top * scale + offset_y).clamp(0.0, target_h),
            right: (b.right * scale + offset_x).clamp(0.0, target_w),
            bottom: (b.bottom * scale + offset_y).clamp(0.0, target_h),
            score: b.score,
        })
        .filter(|r| r.right > r.left && r.bottom > r.top)
        .collect();
    Overlay {
        width: target.0,
        height: target.1,
        rects,
    }
}
