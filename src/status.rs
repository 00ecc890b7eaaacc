use crate::types::{OutcomeKind, UploadOutcome};
use log::{debug, warn};
use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;

/// What observers see of the pipeline.
///
/// While `is_sending` is true, `last_plate` and `last_outcome` still describe
/// the previous completed cycle.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionStatus {
    pub is_sending: bool,
    pub last_plate: Option<String>,
    pub last_outcome: Option<OutcomeKind>,
    pub completed_cycles: u64,
}

/// Identifies one upload cycle. Only the most recently started cycle may
/// complete.
#[derive(Debug)]
#[must_use]
pub struct CycleTicket {
    id: u64,
}

impl CycleTicket {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Owner of the published `DetectionStatus`. Subscribers get the current
/// value immediately, then every later change.
#[derive(Debug)]
pub struct StatusPublisher {
    tx: watch::Sender<DetectionStatus>,
    started: Mutex<u64>,
}

impl StatusPublisher {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(DetectionStatus::default());
        StatusPublisher {
            tx,
            started: Mutex::new(0),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<DetectionStatus> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> DetectionStatus {
        self.tx.borrow().clone()
    }

    /// Marks an upload as in flight, leaving the last result untouched.
    pub fn begin_cycle(&self) -> CycleTicket {
        let mut started = self.started.lock().unwrap_or_else(PoisonError::into_inner);
        *started += 1;
        self.tx.send_modify(|status| status.is_sending = true);
        debug!("Upload cycle {} started", *started);
        CycleTicket { id: *started }
    }

    /// Publishes the result of an upload. Returns false, leaving the status
    /// alone, when a newer cycle has started since `ticket` was issued.
    pub fn complete(&self, ticket: CycleTicket, outcome: &UploadOutcome) -> bool {
        let started = self.started.lock().unwrap_or_else(PoisonError::into_inner);
        if ticket.id != *started {
            warn!(
                "Ignoring stale completion of cycle {} (latest is {})",
                ticket.id, *started
            );
            return false;
        }
        self.tx.send_modify(|status| {
            status.is_sending = false;
            status.last_plate = outcome.plate().map(str::to_string);
            status.last_outcome = Some(outcome.kind());
            status.completed_cycles += 1;
        });
        true
    }
}

impl Default for StatusPublisher {
    fn default() -> Self {
        StatusPublisher::new()
    }
}
