use crate::annotate::encode_jpeg;
use crate::config::Config;
use crate::error::UploadFailure;
use crate::types::{SpottedPlate, UploadOutcome};
use failure::Error;
use futures::future::BoxFuture;
use futures::FutureExt;
use image::RgbImage;
use log::{debug, info, warn};
use reqwest::header::AUTHORIZATION;
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use std::time::Duration;
use url::Url;

/// Sends an image to a plate-recognition service.
pub trait PlateReader: Send + Sync {
    fn read(&self, image: RgbImage) -> BoxFuture<'_, UploadOutcome>;
}

/// Client for the Plate Recognizer `plate-reader` endpoint.
pub struct PlateRecognizerClient {
    client: reqwest::Client,
    endpoint: Url,
    token: String,
    region: String,
    jpeg_quality: u8,
}

impl PlateRecognizerClient {
    pub fn new(
        endpoint: Url,
        token: String,
        region: String,
        jpeg_quality: u8,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| format_err!("Unable to build HTTP client: {}", e))?;
        Ok(PlateRecognizerClient {
            client,
            endpoint,
            token,
            region,
            jpeg_quality,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, Error> {
        PlateRecognizerClient::new(
            config.api_url.clone(),
            config.api_token.clone(),
            config.region.clone(),
            config.jpeg_quality,
            config.upload_timeout,
        )
    }

    pub async fn upload(&self, image: RgbImage) -> UploadOutcome {
        let quality = self.jpeg_quality;
        let jpeg = match tokio::task::spawn_blocking(move || encode_jpeg(&image, quality)).await {
            Ok(Ok(jpeg)) => jpeg,
            Ok(Err(e)) => return UploadOutcome::Failure(UploadFailure::Encode(e.to_string())),
            Err(e) => return UploadOutcome::Failure(UploadFailure::Encode(e.to_string())),
        };
        debug!("Uploading {} byte image to {}", jpeg.len(), self.endpoint);

        let upload = match Part::bytes(jpeg)
            .file_name("image.jpg")
            .mime_str("image/jpeg")
        {
            Ok(part) => part,
            Err(e) => return UploadOutcome::Failure(UploadFailure::Encode(e.to_string())),
        };
        let form = Form::new()
            .part("upload", upload)
            .text("regions", self.region.clone());

        let response = match self
            .client
            .post(self.endpoint.clone())
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .multipart(form)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("Error posting image to recognition service: {}", e);
                return UploadOutcome::Failure(UploadFailure::Network(e.to_string()));
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!("Recognition service responded with {}", status);
            return UploadOutcome::Failure(UploadFailure::Server {
                status: status.as_u16(),
            });
        }

        match response.json::<Value>().await {
            Ok(json) => parse_response(&json),
            Err(e) if e.is_decode() => {
                UploadOutcome::Failure(UploadFailure::Malformed(e.to_string()))
            }
            Err(e) => UploadOutcome::Failure(UploadFailure::Network(e.to_string())),
        }
    }
}

impl PlateReader for PlateRecognizerClient {
    fn read(&self, image: RgbImage) -> BoxFuture<'_, UploadOutcome> {
        self.upload(image).boxed()
    }
}

/// Picks the highest-scoring plate from a `plate-reader` response. Ties go to
/// the earlier candidate; candidates without a plate string are skipped.
pub fn parse_response(json: &Value) -> UploadOutcome {
    let results = match json["results"].as_array() {
        Some(results) => results,
        None => {
            return UploadOutcome::Failure(UploadFailure::Malformed(
                "missing results in JSON".to_string(),
            ))
        }
    };
    if results.is_empty() {
        info!("Recognition service found no plate");
        return UploadOutcome::NoPlate;
    }

    let mut best: Option<SpottedPlate> = None;
    for result in results {
        let plate = match result["plate"].as_str() {
            Some(plate) if !plate.trim().is_empty() => plate,
            _ => {
                warn!("Ignoring result without plate field: {}", result);
                continue;
            }
        };
        let candidate = SpottedPlate {
            plate: plate.trim().to_ascii_uppercase(),
            score: result["score"].as_f64(),
            vehicle_type: result["vehicle"]["type"].as_str().map(str::to_string),
        };
        let better = match &best {
            None => true,
            Some(current) => candidate.score.unwrap_or(0.0) > current.score.unwrap_or(0.0),
        };
        if better {
            best = Some(candidate);
        }
    }

    match best {
        Some(spotted) => {
            info!("Recognized plate {}", spotted.plate);
            UploadOutcome::Recognized(spotted)
        }
        None => UploadOutcome::Failure(UploadFailure::Malformed(
            "no usable plate candidates".to_string(),
        )),
    }
}
