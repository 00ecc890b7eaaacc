use crate::error::UploadFailure;
use serde::Serialize;

/// Minimum score a box must exceed to count as a vehicle.
pub const DETECTION_THRESHOLD: f32 = 0.5;

/// Pixel-space box around a detected vehicle.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct BoundingBox {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    pub score: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        (self.right - self.left).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.bottom - self.top).max(0.0)
    }
}

/// Boxes above the detection threshold, in model output order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DetectionResult {
    pub boxes: Vec<BoundingBox>,
}

impl DetectionResult {
    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SpottedPlate {
    pub plate: String,
    pub score: Option<f64>,
    pub vehicle_type: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum UploadOutcome {
    Recognized(SpottedPlate),
    NoPlate,
    Failure(UploadFailure),
}

impl UploadOutcome {
    pub fn plate(&self) -> Option<&str> {
        match self {
            UploadOutcome::Recognized(spotted) => Some(&spotted.plate),
            _ => None,
        }
    }

    pub fn kind(&self) -> OutcomeKind {
        match self {
            UploadOutcome::Recognized(_) => OutcomeKind::Recognized,
            UploadOutcome::NoPlate => OutcomeKind::NoPlate,
            UploadOutcome::Failure(UploadFailure::Encode(_)) => OutcomeKind::EncodeFailure,
            UploadOutcome::Failure(UploadFailure::Network(_)) => OutcomeKind::NetworkFailure,
            UploadOutcome::Failure(UploadFailure::Server { status }) => {
                OutcomeKind::ServerFailure { status: *status }
            }
            UploadOutcome::Failure(UploadFailure::Malformed(_)) => OutcomeKind::Malformed,
        }
    }
}

/// Flattened `UploadOutcome` carried by the published status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutcomeKind {
    Recognized,
    NoPlate,
    EncodeFailure,
    NetworkFailure,
    ServerFailure { status: u16 },
    Malformed,
}

impl OutcomeKind {
    pub fn label(&self) -> &'static str {
        match self {
            OutcomeKind::Recognized => "recognized",
            OutcomeKind::NoPlate => "no_plate",
            OutcomeKind::EncodeFailure => "encode_failure",
            OutcomeKind::NetworkFailure => "network_failure",
            OutcomeKind::ServerFailure { .. } => "server_failure",
            OutcomeKind::Malformed => "malformed",
        }
    }
}
