use crate::gate::DEFAULT_THROTTLE_WINDOW;
use failure::Error;
use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

pub const DEFAULT_API_URL: &str = "https://api.platerecognizer.com/v1/plate-reader/";

/// Runtime settings, read from environment variables.
#[derive(Clone, Debug)]
pub struct Config {
    pub api_url: Url,
    pub api_token: String,
    pub region: String,
    pub snapshot_url: Url,
    pub still_url: Option<Url>,
    pub frame_interval: Duration,
    pub throttle_window: Duration,
    pub model_path: Option<PathBuf>,
    pub model_input: u32,
    pub save_dir: Option<PathBuf>,
    pub jpeg_quality: u8,
    pub upload_timeout: Duration,
    pub history_db: PathBuf,
    pub listen_port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self, Error> {
        Config::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let api_token = var("PLATE_API_TOKEN")
            .ok_or_else(|| format_err!("PLATE_API_TOKEN environment variable unset"))?;
        let snapshot_url = var("SNAPSHOT_URL")
            .ok_or_else(|| format_err!("SNAPSHOT_URL environment variable unset"))
            .and_then(|value| parse_url("SNAPSHOT_URL", &value))?;
        let api_url = parse_url(
            "PLATE_API_URL",
            &var("PLATE_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
        )?;
        let still_url = match var("STILL_URL") {
            Some(value) => Some(parse_url("STILL_URL", &value)?),
            None => None,
        };

        let jpeg_quality: u8 = parse_or(&var, "JPEG_QUALITY", 90)?;
        if !(1..=100).contains(&jpeg_quality) {
            bail!("JPEG_QUALITY must be between 1 and 100, got {}", jpeg_quality);
        }
        let model_input: u32 = parse_or(&var, "MODEL_INPUT", 300)?;
        if model_input == 0 {
            bail!("MODEL_INPUT must be positive");
        }
        let frame_interval_ms: u64 = parse_or(&var, "FRAME_INTERVAL_MS", 200)?;
        if frame_interval_ms == 0 {
            bail!("FRAME_INTERVAL_MS must be positive");
        }
        let upload_timeout_secs: u64 = parse_or(&var, "UPLOAD_TIMEOUT_SECS", 30)?;
        if upload_timeout_secs == 0 {
            bail!("UPLOAD_TIMEOUT_SECS must be positive");
        }

        Ok(Config {
            api_url,
            api_token,
            region: var("PLATE_REGION").unwrap_or_else(|| "br".to_string()),
            snapshot_url,
            still_url,
            frame_interval: Duration::from_millis(frame_interval_ms),
            throttle_window: Duration::from_millis(parse_or(
                &var,
                "THROTTLE_MS",
                DEFAULT_THROTTLE_WINDOW.as_millis() as u64,
            )?),
            model_path: var("MODEL_PATH").map(PathBuf::from),
            model_input,
            save_dir: var("SAVE_DIR").map(PathBuf::from),
            jpeg_quality,
            upload_timeout: Duration::from_secs(upload_timeout_secs),
            history_db: var("HISTORY_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("plates.db")),
            listen_port: parse_or(&var, "LISTEN_PORT", 8402)?,
        })
    }
}

fn parse_url(key: &str, value: &str) -> Result<Url, Error> {
    Url::parse(value).map_err(|e| format_err!("{} is not a valid URL ({}): {}", key, value, e))
}

fn parse_or<T, F>(var: &F, key: &str, default: T) -> Result<T, Error>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| format_err!("Invalid value for {} ({}): {}", key, value, e)),
        None => Ok(default),
    }
}
