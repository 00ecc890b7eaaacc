use crate::error::PipelineError;
use crate::frame::{Frame, FrameSlot, PixelFormat};
use crate::shutdown::wait_for_shutdown;
use bytes::Bytes;
use failure::Error;
use futures::future::BoxFuture;
use futures::FutureExt;
use image::RgbImage;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use url::Url;

/// Produces the full-resolution still for a frame that passed the gate.
pub trait StillCapture: Send + Sync {
    fn capture(&self, trigger: Frame) -> BoxFuture<'_, Result<RgbImage, PipelineError>>;
}

/// Uses the triggering frame itself as the still.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameCapture;

impl StillCapture for FrameCapture {
    fn capture(&self, trigger: Frame) -> BoxFuture<'_, Result<RgbImage, PipelineError>> {
        async move {
            tokio::task::spawn_blocking(move || trigger.into_rgb())
                .await
                .map_err(|e| PipelineError::Capture(e.to_string()))?
        }
        .boxed()
    }
}

/// An HTTP camera exposing JPEG snapshot endpoints.
///
/// `preview_url` feeds the frame stream; `still_url`, when present, is
/// fetched for each capture instead of reusing the triggering frame.
pub struct SnapshotCamera {
    client: reqwest::Client,
    preview_url: Url,
    still_url: Option<Url>,
}

impl SnapshotCamera {
    pub fn new(preview_url: Url, still_url: Option<Url>) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| format_err!("Unable to build camera HTTP client: {}", e))?;
        Ok(SnapshotCamera {
            client,
            preview_url,
            still_url,
        })
    }

    async fn fetch(&self, url: &Url) -> Result<RgbImage, PipelineError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| PipelineError::Capture(format!("fetching {}: {}", url, e)))?;
        let body = response
            .bytes()
            .await
            .map_err(|e| PipelineError::Capture(format!("reading {}: {}", url, e)))?;
        tokio::task::spawn_blocking(move || decode_snapshot(&body))
            .await
            .map_err(|e| PipelineError::Capture(e.to_string()))?
    }

    /// Polls the preview endpoint into `slot` until shutdown.
    pub async fn feed(
        &self,
        slot: Arc<FrameSlot>,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) {
        info!("Polling {} every {:?}", self.preview_url, interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let stop = wait_for_shutdown(shutdown);
        futures::pin_mut!(stop);
        let mut failing = false;
        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = ticker.tick() => {}
            }
            match self.fetch(&self.preview_url).await {
                Ok(image) => {
                    if failing {
                        info!("Preview stream recovered");
                        failing = false;
                    }
                    let (width, height) = image.dimensions();
                    slot.offer(Frame::new(
                        image.into_raw(),
                        PixelFormat::Rgb8,
                        width,
                        height,
                        Instant::now(),
                    ));
                }
                Err(e) if failing => debug!("{}", e),
                Err(e) => {
                    warn!("{}", e);
                    failing = true;
                }
            }
        }
        info!("Preview feed stopped");
    }
}

impl StillCapture for SnapshotCamera {
    fn capture(&self, trigger: Frame) -> BoxFuture<'_, Result<RgbImage, PipelineError>> {
        match &self.still_url {
            Some(url) => async move {
                drop(trigger);
                self.fetch(url).await
            }
            .boxed(),
            None => FrameCapture.capture(trigger),
        }
    }
}

fn decode_snapshot(body: &Bytes) -> Result<RgbImage, PipelineError> {
    image::load_from_memory(body)
        .map(|image| image.to_rgb8())
        .map_err(|e| PipelineError::Capture(format!("decoding snapshot: {}", e)))
}
