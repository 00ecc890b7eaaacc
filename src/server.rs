use crate::annotate::{overlay, Overlay};
use crate::db::History;
use crate::pipeline::{DetectionSnapshot, Pipeline};
use crate::status::{DetectionStatus, StatusPublisher};
use futures::SinkExt;
use log::{debug, error, info};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::watch;
use warp::ws::{Message, WebSocket, Ws};
use warp::Filter;

const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_HISTORY_LIMIT: usize = 500;

/// What the status endpoints read from.
#[derive(Clone)]
pub struct ServerState {
    status: Arc<StatusPublisher>,
    detections: watch::Receiver<Option<DetectionSnapshot>>,
    history: Option<Arc<History>>,
}

impl ServerState {
    pub fn new(pipeline: &Pipeline, history: Option<Arc<History>>) -> Self {
        ServerState {
            status: pipeline.status(),
            detections: pipeline.detections(),
            history,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OverlayQuery {
    width: u32,
    height: u32,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

pub fn routes(
    state: ServerState,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let with_state = warp::any().map(move || state.clone());

    let status = warp::get()
        .and(warp::path!("status"))
        .and(with_state.clone())
        .map(|state: ServerState| warp::reply::json(&state.status.current()));

    let status_ws = warp::path!("status" / "ws")
        .and(warp::ws())
        .and(with_state.clone())
        .map(|ws: Ws, state: ServerState| {
            let rx = state.status.subscribe();
            ws.on_upgrade(move |socket| stream_status(socket, rx))
        });

    let overlay_route = warp::get()
        .and(warp::path!("overlay"))
        .and(warp::query::<OverlayQuery>())
        .and(with_state.clone())
        .map(|query: OverlayQuery, state: ServerState| {
            let snapshot = state.detections.borrow().clone();
            let reply: Overlay = match snapshot {
                Some(d) => overlay(&d.boxes, (d.width, d.height), (query.width, query.height)),
                None => Overlay::empty(query.width, query.height),
            };
            warp::reply::json(&reply)
        });

    let history = warp::get()
        .and(warp::path!("history"))
        .and(warp::query::<HistoryQuery>())
        .and(with_state)
        .and_then(|query: HistoryQuery, state: ServerState| async move {
            let limit = query
                .limit
                .unwrap_or(DEFAULT_HISTORY_LIMIT)
                .min(MAX_HISTORY_LIMIT);
            let rows = match &state.history {
                Some(history) => history.recent(limit).await,
                None => Vec::new(),
            };
            Ok::<_, warp::Rejection>(warp::reply::json(&rows))
        });

    status_ws.or(status).or(overlay_route).or(history)
}

pub async fn run(state: ServerState, port: u16) {
    info!("Serving status on port {}", port);
    warp::serve(routes(state)).run(([0, 0, 0, 0], port)).await;
}

/// Sends the current status, then every change, until the client goes away.
async fn stream_status(mut socket: WebSocket, mut rx: watch::Receiver<DetectionStatus>) {
    loop {
        let text = serde_json::to_string(&*rx.borrow_and_update());
        match text {
            Ok(text) => {
                if let Err(e) = socket.send(Message::text(text)).await {
                    debug!("Status websocket closed: {}", e);
                    break;
                }
            }
            Err(e) => {
                error!("Unable to serialize status: {}", e);
                break;
            }
        }
        if rx.changed().await.is_err() {
            break;
        }
    }
}
