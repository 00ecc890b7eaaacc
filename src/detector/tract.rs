use crate::detector::{InferenceEngine, RawDetections};
use crate::error::PipelineError;
use failure::Error;
use image::RgbImage;
use std::path::Path;
use tract_onnx::prelude::*;

// Output order of the SSD-MobileNet ONNX export:
// detection_boxes, detection_classes, detection_scores, num_detections.
const BOXES_OUTPUT: usize = 0;
const SCORES_OUTPUT: usize = 2;

/// SSD-style detector running on tract. Takes `uint8 [1, H, W, 3]` input.
pub struct TractEngine {
    model: TypedRunnableModel<TypedModel>,
    edge: u32,
}

impl TractEngine {
    pub fn load(path: &Path, edge: u32) -> Result<Self, Error> {
        let model = tract_onnx::onnx()
            .model_for_path(path)
            .and_then(|model| {
                model.with_input_fact(
                    0,
                    InferenceFact::dt_shape(
                        u8::datum_type(),
                        tvec!(1, edge as usize, edge as usize, 3),
                    ),
                )
            })
            .and_then(|model| model.into_optimized())
            .and_then(|model| model.into_runnable())
            .map_err(|e| format_err!("failed to prepare ONNX model {:?}: {:#}", path, e))?;
        Ok(TractEngine { model, edge })
    }

    fn output_values(outputs: &TVec<TValue>, index: usize) -> Result<Vec<f32>, PipelineError> {
        let tensor = outputs
            .get(index)
            .ok_or_else(|| PipelineError::Inference(format!("model has no output {}", index)))?;
        let view = tensor
            .to_array_view::<f32>()
            .map_err(|e| PipelineError::Inference(format!("output {} is not f32: {}", index, e)))?;
        Ok(view.iter().copied().collect())
    }
}

impl InferenceEngine for TractEngine {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn input_size(&self) -> (u32, u32) {
        (self.edge, self.edge)
    }

    fn infer(&mut self, input: &RgbImage) -> Result<RawDetections, PipelineError> {
        let (width, height) = input.dimensions();
        let tensor: Tensor = tract_ndarray::Array4::from_shape_fn(
            (1, height as usize, width as usize, 3),
            |(_, y, x, c)| input.get_pixel(x as u32, y as u32)[c],
        )
        .into();
        let outputs = self
            .model
            .run(tvec!(tensor.into()))
            .map_err(|e| PipelineError::Inference(format!("{:#}", e)))?;

        let boxes = Self::output_values(&outputs, BOXES_OUTPUT)?;
        let scores = Self::output_values(&outputs, SCORES_OUTPUT)?;
        Ok(RawDetections {
            boxes: boxes
                .chunks_exact(4)
                .map(|b| [b[0], b[1], b[2], b[3]])
                .collect(),
            scores,
        })
    }
}
