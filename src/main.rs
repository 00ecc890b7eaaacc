use env_logger::Env;
use failure::Error;
use log::{error, info};
use plate_watcher::camera::SnapshotCamera;
use plate_watcher::config::Config;
use plate_watcher::db::History;
use plate_watcher::detector::Detector;
use plate_watcher::frame::FrameSlot;
use plate_watcher::pipeline::Pipeline;
use plate_watcher::recognizer::PlateRecognizerClient;
use plate_watcher::server::{self, ServerState};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    info!("Starting plate-watcher");
    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(1);
    }
    info!("Exiting main");
}

async fn run() -> Result<(), Error> {
    let config = Config::from_env()?;

    let camera = Arc::new(SnapshotCamera::new(
        config.snapshot_url.clone(),
        config.still_url.clone(),
    )?);
    let reader = Arc::new(PlateRecognizerClient::from_config(&config)?);
    let detector = Detector::load(config.model_path.as_deref(), config.model_input);
    let history = match History::open(&config.history_db) {
        Ok(history) => Some(Arc::new(history)),
        Err(e) => {
            error!("Unable to open history db {:?}: {}", config.history_db, e);
            None
        }
    };

    let mut builder = Pipeline::builder(camera.clone(), detector, reader)
        .throttle_window(config.throttle_window)
        .jpeg_quality(config.jpeg_quality);
    if let Some(dir) = &config.save_dir {
        builder = builder.save_dir(dir);
    }
    if let Some(history) = &history {
        builder = builder.history(history.clone());
    }
    let pipeline = builder.build();

    let slot = Arc::new(FrameSlot::new());
    let feed_task = tokio::spawn({
        let slot = slot.clone();
        let shutdown = pipeline.shutdown_signal();
        let interval = config.frame_interval;
        async move { camera.feed(slot, interval, shutdown).await }
    });
    let delivery_task = tokio::spawn({
        let pipeline = pipeline.clone();
        async move { pipeline.run(slot).await }
    });
    let server_task = tokio::spawn(server::run(
        ServerState::new(&pipeline, history),
        config.listen_port,
    ));

    tokio::select! {
        result = server_task => {
            if let Err(e) = result {
                error!("Status server task failed: {}", e);
            }
        }
        result = delivery_task => {
            if let Err(e) = result {
                error!("Frame delivery task failed: {}", e);
            }
        }
        result = feed_task => {
            if let Err(e) = result {
                error!("Camera feed task failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C, shutting down"),
    }
    pipeline.shutdown();
    Ok(())
}
