/// Stage failures that end a pipeline cycle without touching the status.
#[derive(Debug, Fail)]
pub enum PipelineError {
    #[fail(display = "capture failed: {}", _0)]
    Capture(String),
    #[fail(display = "inference failed: {}", _0)]
    Inference(String),
    #[fail(display = "could not persist image: {}", _0)]
    Persistence(String),
}

/// Why a recognition upload did not produce a usable answer.
///
/// Kept apart from `UploadOutcome::NoPlate` so callers can decide whether a
/// retry or an alert is warranted.
#[derive(Clone, Debug, PartialEq, Eq, Fail)]
pub enum UploadFailure {
    #[fail(display = "could not encode image for upload: {}", _0)]
    Encode(String),
    #[fail(display = "network error: {}", _0)]
    Network(String),
    #[fail(display = "recognition service responded with status {}", status)]
    Server { status: u16 },
    #[fail(display = "malformed recognition response: {}", _0)]
    Malformed(String),
}
