#[cfg(feature = "backend-tract")]
pub mod tract;

use crate::error::PipelineError;
use crate::types::{BoundingBox, DetectionResult, DETECTION_THRESHOLD};
use failure::Error;
use image::imageops::{self, FilterType};
use image::RgbImage;
use log::{debug, error, info, warn};
use std::path::Path;

/// Upper bound on candidate boxes read from one inference.
pub const MAX_DETECTIONS: usize = 100;

/// Model output exactly as the engine emits it: one normalized
/// `[ymin, xmin, ymax, xmax]` box per score.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawDetections {
    pub boxes: Vec<[f32; 4]>,
    pub scores: Vec<f32>,
}

/// A loaded object-detection model with a fixed input geometry.
///
/// `infer` takes `&mut self`; engines are not assumed to be re-entrant.
pub trait InferenceEngine: Send {
    fn name(&self) -> &'static str;

    /// Width and height the model expects.
    fn input_size(&self) -> (u32, u32);

    fn infer(&mut self, input: &RgbImage) -> Result<RawDetections, PipelineError>;
}

/// Finds vehicles in captured images. Fails closed: any error yields an
/// empty result.
pub struct Detector {
    engine: Option<Box<dyn InferenceEngine>>,
    threshold: f32,
}

impl Detector {
    pub fn new(engine: Box<dyn InferenceEngine>) -> Self {
        Detector {
            engine: Some(engine),
            threshold: DETECTION_THRESHOLD,
        }
    }

    /// A detector with no model; every call returns an empty result.
    pub fn unloaded() -> Self {
        Detector {
            engine: None,
            threshold: DETECTION_THRESHOLD,
        }
    }

    /// Loads the configured model, falling back to an unloaded detector.
    pub fn load(model_path: Option<&Path>, input_edge: u32) -> Self {
        let path = match model_path {
            Some(path) => path,
            None => {
                warn!("No detection model configured; vehicle detection disabled");
                return Detector::unloaded();
            }
        };
        match open_engine(path, input_edge) {
            Ok(engine) => {
                info!(
                    "Loaded {} detection model from {:?} ({}x{} input)",
                    engine.name(),
                    path,
                    engine.input_size().0,
                    engine.input_size().1
                );
                Detector::new(engine)
            }
            Err(e) => {
                error!("Unable to load detection model {:?}: {}", path, e);
                Detector::unloaded()
            }
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.engine.is_some()
    }

    pub fn detect(&mut self, image: &RgbImage) -> DetectionResult {
        match self.try_detect(image) {
            Ok(result) => result,
            Err(e) => {
                if self.is_loaded() {
                    warn!("{}", e);
                } else {
                    debug!("{}", e);
                }
                DetectionResult::default()
            }
        }
    }

    fn try_detect(&mut self, image: &RgbImage) -> Result<DetectionResult, PipelineError> {
        let engine = self
            .engine
            .as_mut()
            .ok_or_else(|| PipelineError::Inference("model not loaded".to_string()))?;
        let (input_width, input_height) = engine.input_size();
        let raw = if image.dimensions() == (input_width, input_height) {
            engine.infer(image)?
        } else {
            let resized = imageops::resize(image, input_width, input_height, FilterType::Triangle);
            engine.infer(&resized)?
        };
        if raw.boxes.len() != raw.scores.len() {
            return Err(PipelineError::Inference(format!(
                "{} boxes but {} scores",
                raw.boxes.len(),
                raw.scores.len()
            )));
        }

        let (width, height) = (image.width() as f32, image.height() as f32);
        let boxes = raw
            .boxes
            .iter()
            .zip(&raw.scores)
            .take(MAX_DETECTIONS)
            .filter(|(_, score)| **score > self.threshold)
            .map(|(b, score)| BoundingBox {
                left: (b[1] * width).clamp(0.0, width),
                top: (b[0] * height).clamp(0.0, height),
                right: (b[3] * width).clamp(0.0, width),
                bottom: (b[2] * height).clamp(0.0, height),
                score: *score,
            })
            .collect();
        Ok(DetectionResult { boxes })
    }
}

#[cfg(feature = "backend-tract")]
fn open_engine(path: &Path, input_edge: u32) -> Result<Box<dyn InferenceEngine>, Error> {
    Ok(Box::new(tract::TractEngine::load(path, input_edge)?))
}

#[cfg(not(feature = "backend-tract"))]
fn open_engine(_path: &Path, _input_edge: u32) -> Result<Box<dyn InferenceEngine>, Error> {
    Err(format_err!(
        "built without an inference backend (enable the `backend-tract` feature)"
    ))
}
