use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use image::RgbImage;
use plate_watcher::camera::{FrameCapture, StillCapture};
use plate_watcher::db::History;
use plate_watcher::detector::{Detector, InferenceEngine, RawDetections};
use plate_watcher::error::{PipelineError, UploadFailure};
use plate_watcher::frame::{Frame, FrameSlot, PixelFormat};
use plate_watcher::pipeline::{CycleEnd, Pipeline};
use plate_watcher::recognizer::{PlateReader, PlateRecognizerClient};
use plate_watcher::status::DetectionStatus;
use plate_watcher::types::{OutcomeKind, UploadOutcome};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use url::Url;
use warp::http::StatusCode;
use warp::Filter;

const WINDOW: Duration = Duration::from_millis(10_000);
const TOKEN: &str = "test-token";

/// Returns the same detections for every image.
struct FixedEngine(RawDetections);

impl InferenceEngine for FixedEngine {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn input_size(&self) -> (u32, u32) {
        (300, 300)
    }

    fn infer(&mut self, _input: &RgbImage) -> Result<RawDetections, PipelineError> {
        Ok(self.0.clone())
    }
}

fn detector_with_scores(scores: &[f32]) -> Detector {
    Detector::new(Box::new(FixedEngine(RawDetections {
        boxes: vec![[0.25, 0.25, 0.75, 0.75]; scores.len()],
        scores: scores.to_vec(),
    })))
}

struct FailingCamera;

impl StillCapture for FailingCamera {
    fn capture(&self, _trigger: Frame) -> BoxFuture<'_, Result<RgbImage, PipelineError>> {
        async { Err(PipelineError::Capture("camera closed".to_string())) }.boxed()
    }
}

/// Holds every capture until released.
struct GatedCamera {
    release: Arc<Notify>,
}

impl StillCapture for GatedCamera {
    fn capture(&self, trigger: Frame) -> BoxFuture<'_, Result<RgbImage, PipelineError>> {
        async move {
            self.release.notified().await;
            trigger.into_rgb()
        }
        .boxed()
    }
}

/// Counts uploads and answers with a fixed outcome.
struct CountingReader {
    calls: AtomicUsize,
    outcome: UploadOutcome,
}

impl PlateReader for CountingReader {
    fn read(&self, _image: RgbImage) -> BoxFuture<'_, UploadOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        futures::future::ready(self.outcome.clone()).boxed()
    }
}

struct StalledReader;

impl PlateReader for StalledReader {
    fn read(&self, _image: RgbImage) -> BoxFuture<'_, UploadOutcome> {
        futures::future::pending().boxed()
    }
}

fn frame_at(timestamp: Instant) -> Frame {
    Frame::new(vec![90u8; 64 * 48 * 3], PixelFormat::Rgb8, 64, 48, timestamp)
}

/// Fake recognition service: checks the credential and the multipart fields,
/// then answers with `status` and `body`.
fn serve_recognizer(status: StatusCode, body: &'static str) -> SocketAddr {
    let route = warp::post()
        .and(warp::path!("v1" / "plate-reader"))
        .and(warp::header::<String>("authorization"))
        .and(warp::multipart::form())
        .and_then(move |auth: String, form: warp::multipart::FormData| async move {
            let names: Vec<String> = form
                .filter_map(|part| async move { part.ok().map(|p| p.name().to_string()) })
                .collect()
                .await;
            let valid = auth == format!("Token {}", TOKEN)
                && names.iter().any(|n| n == "upload")
                && names.iter().any(|n| n == "regions");
            let code = if valid { status } else { StatusCode::BAD_REQUEST };
            Ok::<_, warp::Rejection>(warp::reply::with_status(body, code))
        });
    let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    addr
}

fn client_for(addr: SocketAddr) -> Arc<PlateRecognizerClient> {
    let url = Url::parse(&format!("http://{}/v1/plate-reader", addr)).unwrap();
    Arc::new(
        PlateRecognizerClient::new(
            url,
            TOKEN.to_string(),
            "br".to_string(),
            90,
            Duration::from_secs(5),
        )
        .unwrap(),
    )
}

fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

#[tokio::test]
async fn recognized_plate_is_published() {
    let addr = serve_recognizer(
        StatusCode::OK,
        r#"{"results": [{"plate": "abc1234", "score": 0.9, "vehicle": {"type": "Sedan"}}]}"#,
    );
    let history = Arc::new(History::open_in_memory().unwrap());
    let pipeline = Pipeline::builder(
        Arc::new(FrameCapture),
        detector_with_scores(&[0.8]),
        client_for(addr),
    )
    .history(history.clone())
    .build();
    let mut status = pipeline.subscribe();

    let cycle = pipeline.offer_frame(frame_at(Instant::now())).expect("gate open");
    match cycle.await.unwrap() {
        CycleEnd::Completed(UploadOutcome::Recognized(spotted)) => {
            assert_eq!(spotted.plate, "ABC1234");
            assert_eq!(spotted.vehicle_type.as_deref(), Some("Sedan"));
        }
        other => panic!("unexpected cycle end: {:?}", other),
    }

    let latest = status.borrow_and_update().clone();
    assert_eq!(
        latest,
        DetectionStatus {
            is_sending: false,
            last_plate: Some("ABC1234".to_string()),
            last_outcome: Some(OutcomeKind::Recognized),
            completed_cycles: 1,
        }
    );
    let rows = history.recent(5).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].plate.as_deref(), Some("ABC1234"));

    let snapshot = pipeline.detections().borrow().clone().unwrap();
    assert_eq!((snapshot.width, snapshot.height), (64, 48));
    assert_eq!(snapshot.boxes.len(), 1);
}

#[tokio::test]
async fn empty_results_are_no_plate_not_failure() {
    let addr = serve_recognizer(StatusCode::OK, r#"{"results": []}"#);
    let pipeline = Pipeline::builder(
        Arc::new(FrameCapture),
        detector_with_scores(&[0.8]),
        client_for(addr),
    )
    .build();

    let end = pipeline
        .offer_frame(frame_at(Instant::now()))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(end, CycleEnd::Completed(UploadOutcome::NoPlate));
    let status = pipeline.status().current();
    assert_eq!(status.last_plate, None);
    assert_eq!(status.last_outcome, Some(OutcomeKind::NoPlate));
}

#[tokio::test]
async fn server_error_and_malformed_body_are_failures() {
    let broken = serve_recognizer(StatusCode::SERVICE_UNAVAILABLE, "{}");
    let pipeline = Pipeline::builder(
        Arc::new(FrameCapture),
        detector_with_scores(&[0.8]),
        client_for(broken),
    )
    .build();
    let end = pipeline
        .offer_frame(frame_at(Instant::now()))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(
        end,
        CycleEnd::Completed(UploadOutcome::Failure(UploadFailure::Server { status: 503 }))
    );

    let garbled = serve_recognizer(StatusCode::OK, "<html>gateway</html>");
    let pipeline = Pipeline::builder(
        Arc::new(FrameCapture),
        detector_with_scores(&[0.8]),
        client_for(garbled),
    )
    .build();
    let end = pipeline
        .offer_frame(frame_at(Instant::now()))
        .unwrap()
        .await
        .unwrap();
    assert!(matches!(
        end,
        CycleEnd::Completed(UploadOutcome::Failure(UploadFailure::Malformed(_)))
    ));
    assert_eq!(
        pipeline.status().current().last_outcome,
        Some(OutcomeKind::Malformed)
    );
}

#[tokio::test]
async fn network_failure_clears_plate_and_pipeline_recovers() {
    let pipeline = Pipeline::builder(
        Arc::new(FrameCapture),
        detector_with_scores(&[0.8]),
        client_for(closed_port()),
    )
    .throttle_window(WINDOW)
    .build();
    let base = Instant::now();

    let end = pipeline.offer_frame(frame_at(base)).unwrap().await.unwrap();
    assert!(matches!(
        end,
        CycleEnd::Completed(UploadOutcome::Failure(UploadFailure::Network(_)))
    ));
    let status = pipeline.status().current();
    assert!(!status.is_sending);
    assert_eq!(status.last_plate, None);
    assert_eq!(status.last_outcome, Some(OutcomeKind::NetworkFailure));

    assert!(pipeline.offer_frame(frame_at(base + WINDOW / 2)).is_none());
    let next = pipeline.offer_frame(frame_at(base + WINDOW));
    assert!(next.is_some());
    next.unwrap().await.unwrap();
    assert_eq!(pipeline.status().current().completed_cycles, 2);
}

#[tokio::test]
async fn no_detection_leaves_status_untouched() {
    let reader = Arc::new(CountingReader {
        calls: AtomicUsize::new(0),
        outcome: UploadOutcome::NoPlate,
    });
    let pipeline = Pipeline::builder(
        Arc::new(FrameCapture),
        detector_with_scores(&[0.3, 0.5, 0.1]),
        reader.clone(),
    )
    .build();
    let before = pipeline.status().current();

    let end = pipeline
        .offer_frame(frame_at(Instant::now()))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(end, CycleEnd::NoVehicle);
    assert_eq!(pipeline.status().current(), before);
    assert_eq!(reader.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn capture_and_model_failures_end_the_cycle_quietly() {
    let reader = Arc::new(CountingReader {
        calls: AtomicUsize::new(0),
        outcome: UploadOutcome::NoPlate,
    });
    let pipeline = Pipeline::builder(
        Arc::new(FailingCamera),
        detector_with_scores(&[0.9]),
        reader.clone(),
    )
    .throttle_window(WINDOW)
    .build();
    let base = Instant::now();
    let end = pipeline.offer_frame(frame_at(base)).unwrap().await.unwrap();
    assert_eq!(end, CycleEnd::CaptureFailed);
    assert_eq!(pipeline.status().current(), DetectionStatus::default());
    assert!(pipeline.offer_frame(frame_at(base + WINDOW)).is_some());

    let unloaded = Pipeline::builder(Arc::new(FrameCapture), Detector::unloaded(), reader.clone())
        .build();
    let end = unloaded
        .offer_frame(frame_at(Instant::now()))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(end, CycleEnd::NoVehicle);
    assert_eq!(reader.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn only_one_cycle_in_flight() {
    let release = Arc::new(Notify::new());
    let reader = Arc::new(CountingReader {
        calls: AtomicUsize::new(0),
        outcome: UploadOutcome::NoPlate,
    });
    let pipeline = Pipeline::builder(
        Arc::new(GatedCamera {
            release: release.clone(),
        }),
        detector_with_scores(&[0.9]),
        reader.clone(),
    )
    .throttle_window(WINDOW)
    .build();
    let base = Instant::now();

    let first = pipeline.offer_frame(frame_at(base)).expect("first trigger");
    // The gate opens again, but the first cycle still holds the trigger.
    assert!(pipeline.offer_frame(frame_at(base + WINDOW)).is_none());
    assert!(pipeline
        .offer_frame(frame_at(base + WINDOW * 2))
        .is_none());

    release.notify_one();
    first.await.unwrap();
    assert_eq!(reader.calls.load(Ordering::SeqCst), 1);

    let third = pipeline
        .offer_frame(frame_at(base + WINDOW * 3))
        .expect("trigger free again");
    release.notify_one();
    third.await.unwrap();
    assert_eq!(reader.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn shutdown_abandons_upload_without_publishing() {
    let pipeline = Pipeline::builder(
        Arc::new(FrameCapture),
        detector_with_scores(&[0.9]),
        Arc::new(StalledReader),
    )
    .build();
    let mut status = pipeline.subscribe();

    let cycle = pipeline.offer_frame(frame_at(Instant::now())).unwrap();
    status.wait_for(|s| s.is_sending).await.unwrap();
    pipeline.shutdown();

    assert_eq!(cycle.await.unwrap(), CycleEnd::Cancelled);
    let status = pipeline.status().current();
    assert!(status.is_sending);
    assert_eq!(status.completed_cycles, 0);
}

#[tokio::test]
async fn delivery_lane_throttles_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let reader = Arc::new(CountingReader {
        calls: AtomicUsize::new(0),
        outcome: UploadOutcome::NoPlate,
    });
    let pipeline = Pipeline::builder(
        Arc::new(FrameCapture),
        detector_with_scores(&[0.9]),
        reader.clone(),
    )
    .throttle_window(Duration::from_secs(3600))
    .save_dir(dir.path())
    .build();
    let mut status = pipeline.subscribe();

    let slot = Arc::new(FrameSlot::new());
    let lane = tokio::spawn({
        let pipeline = pipeline.clone();
        let slot = slot.clone();
        async move { pipeline.run(slot).await }
    });
    for _ in 0..5 {
        slot.offer(frame_at(Instant::now()));
        tokio::task::yield_now().await;
    }

    tokio::time::timeout(
        Duration::from_secs(10),
        status.wait_for(|s| s.completed_cycles == 1),
    )
    .await
    .expect("cycle completed")
    .unwrap();
    pipeline.shutdown();
    tokio::time::timeout(Duration::from_secs(10), lane)
        .await
        .expect("lane stopped")
        .unwrap();

    assert_eq!(reader.calls.load(Ordering::SeqCst), 1);
    let saved: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(saved.len(), 1);
}

#[tokio::test]
async fn shutdown_during_capture_publishes_nothing() {
    let release = Arc::new(Notify::new());
    let reader = Arc::new(CountingReader {
        calls: AtomicUsize::new(0),
        outcome: UploadOutcome::NoPlate,
    });
    let pipeline = Pipeline::builder(
        Arc::new(GatedCamera {
            release: release.clone(),
        }),
        detector_with_scores(&[0.9]),
        reader.clone(),
    )
    .build();

    let cycle = pipeline.offer_frame(frame_at(Instant::now())).unwrap();
    pipeline.shutdown();
    release.notify_one();

    assert_eq!(cycle.await.unwrap(), CycleEnd::Cancelled);
    assert_eq!(pipeline.status().current(), DetectionStatus::default());
    assert_eq!(reader.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn persistence_failure_does_not_block_upload() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let reader = Arc::new(CountingReader {
        calls: AtomicUsize::new(0),
        outcome: UploadOutcome::NoPlate,
    });
    let history = Arc::new(History::open_in_memory().unwrap());
    let pipeline = Pipeline::builder(
        Arc::new(FrameCapture),
        detector_with_scores(&[0.9]),
        reader.clone(),
    )
    .history(history.clone())
    .save_dir(file.path().join("sub"))
    .build();

    let end = pipeline
        .offer_frame(frame_at(Instant::now()))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(end, CycleEnd::Completed(UploadOutcome::NoPlate));
    let status = pipeline.status().current();
    assert!(!status.is_sending);
    assert_eq!(status.completed_cycles, 1);
    assert_eq!(status.last_outcome, Some(OutcomeKind::NoPlate));
    assert_eq!(reader.calls.load(Ordering::SeqCst), 1);
    let rows = history.recent(5).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].image_path, None);
}
