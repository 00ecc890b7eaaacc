//! Capture → detect → upload cycle and the frame delivery lane feeding it.
//!
//! Frames reach the pipeline on a single delivery lane that only consults the
//! throttle gate and the capture trigger, so it never waits on a cycle. Each
//! accepted frame starts a cycle task: capture and upload run as async I/O,
//! inference and annotation run on the blocking pool. At most one cycle is
//! outstanding at any time.

use crate::annotate::{annotate, persist};
use crate::camera::StillCapture;
use crate::db::History;
use crate::detector::Detector;
use crate::frame::{Frame, FrameSlot};
use crate::gate::{CaptureTrigger, InFlight, ThrottleGate, DEFAULT_THROTTLE_WINDOW};
use crate::recognizer::PlateReader;
use crate::shutdown::wait_for_shutdown;
use crate::status::{DetectionStatus, StatusPublisher};
use crate::types::{BoundingBox, UploadOutcome};
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How a cycle ended.
#[derive(Debug, PartialEq)]
pub enum CycleEnd {
    CaptureFailed,
    InferenceFailed,
    NoVehicle,
    Completed(UploadOutcome),
    Cancelled,
}

/// Boxes from the latest inference together with the image size they refer
/// to, for drawing on a live preview.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionSnapshot {
    pub width: u32,
    pub height: u32,
    pub boxes: Vec<BoundingBox>,
}

struct Inner {
    gate: ThrottleGate,
    trigger: CaptureTrigger,
    camera: Arc<dyn StillCapture>,
    detector: Arc<Mutex<Detector>>,
    reader: Arc<dyn PlateReader>,
    status: Arc<StatusPublisher>,
    detections: watch::Sender<Option<DetectionSnapshot>>,
    history: Option<Arc<History>>,
    save_dir: Option<PathBuf>,
    jpeg_quality: u8,
    shutdown: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

pub struct PipelineBuilder {
    camera: Arc<dyn StillCapture>,
    detector: Detector,
    reader: Arc<dyn PlateReader>,
    throttle_window: Duration,
    history: Option<Arc<History>>,
    save_dir: Option<PathBuf>,
    jpeg_quality: u8,
}

impl PipelineBuilder {
    pub fn throttle_window(mut self, window: Duration) -> Self {
        self.throttle_window = window;
        self
    }

    pub fn history(mut self, history: Arc<History>) -> Self {
        self.history = Some(history);
        self
    }

    /// Persist annotated detections under `dir`.
    pub fn save_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.save_dir = Some(dir.into());
        self
    }

    pub fn jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality;
        self
    }

    pub fn build(self) -> Pipeline {
        let (detections, _) = watch::channel(None);
        let (shutdown, _) = watch::channel(false);
        Pipeline {
            inner: Arc::new(Inner {
                gate: ThrottleGate::new(self.throttle_window),
                trigger: CaptureTrigger::new(),
                camera: self.camera,
                detector: Arc::new(Mutex::new(self.detector)),
                reader: self.reader,
                status: Arc::new(StatusPublisher::new()),
                detections,
                history: self.history,
                save_dir: self.save_dir,
                jpeg_quality: self.jpeg_quality,
                shutdown,
            }),
        }
    }
}

impl Pipeline {
    pub fn builder(
        camera: Arc<dyn StillCapture>,
        detector: Detector,
        reader: Arc<dyn PlateReader>,
    ) -> PipelineBuilder {
        PipelineBuilder {
            camera,
            detector,
            reader,
            throttle_window: DEFAULT_THROTTLE_WINDOW,
            history: None,
            save_dir: None,
            jpeg_quality: 90,
        }
    }

    pub fn status(&self) -> Arc<StatusPublisher> {
        self.inner.status.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DetectionStatus> {
        self.inner.status.subscribe()
    }

    pub fn detections(&self) -> watch::Receiver<Option<DetectionSnapshot>> {
        self.inner.detections.subscribe()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    /// Stops the delivery lane and abandons any in-flight upload without
    /// publishing its result.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    /// Runs the gate and trigger for one frame. Returns the spawned cycle when
    /// the frame was accepted. Must be called from within a tokio runtime.
    pub fn offer_frame(&self, frame: Frame) -> Option<JoinHandle<CycleEnd>> {
        if !self.inner.gate.should_capture(frame.timestamp) {
            return None;
        }
        let in_flight = match self.inner.trigger.try_begin() {
            Some(in_flight) => in_flight,
            None => {
                debug!("Capture still in flight; dropping trigger");
                return None;
            }
        };
        Some(tokio::spawn(run_cycle(
            self.inner.clone(),
            frame,
            in_flight,
        )))
    }

    /// Delivery lane: hands each frame from `frames` to the gate until
    /// shutdown.
    pub async fn run(&self, frames: Arc<FrameSlot>) {
        let stop = wait_for_shutdown(self.shutdown_signal());
        futures::pin_mut!(stop);
        loop {
            let frame = tokio::select! {
                _ = &mut stop => break,
                frame = frames.next() => frame,
            };
            self.offer_frame(frame);
        }
        info!(
            "Frame delivery stopped ({} frames dropped unseen)",
            frames.dropped()
        );
    }
}

async fn run_cycle(inner: Arc<Inner>, frame: Frame, _in_flight: InFlight) -> CycleEnd {
    let captured = tokio::select! {
        biased;
        _ = wait_for_shutdown(inner.shutdown.subscribe()) => {
            info!("Cycle cancelled during capture");
            return CycleEnd::Cancelled;
        }
        captured = inner.camera.capture(frame) => captured,
    };
    let image = match captured {
        Ok(image) => image,
        Err(e) => {
            warn!("{}", e);
            return CycleEnd::CaptureFailed;
        }
    };

    let detector = inner.detector.clone();
    let inference = tokio::task::spawn_blocking(move || {
        let result = detector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .detect(&image);
        (image, result)
    });
    let detection = tokio::select! {
        biased;
        _ = wait_for_shutdown(inner.shutdown.subscribe()) => {
            info!("Cycle cancelled during inference");
            return CycleEnd::Cancelled;
        }
        detection = inference => detection,
    };
    let (image, result) = match detection {
        Ok(detection) => detection,
        Err(e) => {
            error!("Inference task failed: {}", e);
            return CycleEnd::InferenceFailed;
        }
    };
    inner.detections.send_replace(Some(DetectionSnapshot {
        width: image.width(),
        height: image.height(),
        boxes: result.boxes.clone(),
    }));
    if result.is_empty() {
        debug!("No vehicle in captured image");
        return CycleEnd::NoVehicle;
    }
    info!("Detected {} vehicle(s); sending image", result.len());

    let persisted = inner.save_dir.clone().map(|dir| {
        let copy = image.clone();
        let boxes = result.boxes;
        let quality = inner.jpeg_quality;
        tokio::task::spawn_blocking(move || persist(&annotate(copy, &boxes), &dir, quality))
    });

    if *inner.shutdown.borrow() {
        info!("Shutdown requested; not starting upload");
        return CycleEnd::Cancelled;
    }
    let ticket = inner.status.begin_cycle();
    let outcome = tokio::select! {
        outcome = inner.reader.read(image) => outcome,
        _ = wait_for_shutdown(inner.shutdown.subscribe()) => {
            info!("Upload cycle {} cancelled", ticket.id());
            return CycleEnd::Cancelled;
        }
    };

    let image_path = match persisted {
        Some(task) => match task.await {
            Ok(Ok(path)) => {
                debug!("Saved annotated image to {:?}", path);
                Some(path)
            }
            Ok(Err(e)) => {
                warn!("{}", e);
                None
            }
            Err(e) => {
                warn!("Persist task failed: {}", e);
                None
            }
        },
        None => None,
    };

    match &outcome {
        UploadOutcome::Recognized(spotted) => info!("Spotted plate {:?}", spotted),
        UploadOutcome::NoPlate => info!("No plate found in uploaded image"),
        UploadOutcome::Failure(e) => warn!("Upload failed: {}", e),
    }
    inner.status.complete(ticket, &outcome);
    if let Some(history) = &inner.history {
        history.record(&outcome, image_path.as_deref()).await;
    }
    CycleEnd::Completed(outcome)
}
