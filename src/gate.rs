use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

pub const DEFAULT_THROTTLE_WINDOW: Duration = Duration::from_millis(10_000);

/// Lets at most one frame per window through to capture.
#[derive(Debug)]
pub struct ThrottleGate {
    window: Duration,
    last_capture: Mutex<Option<Instant>>,
}

impl ThrottleGate {
    pub fn new(window: Duration) -> Self {
        ThrottleGate {
            window,
            last_capture: Mutex::new(None),
        }
    }

    /// Returns true, and records `now` as the last capture, when at least one
    /// window has elapsed since the previous accepted frame.
    pub fn should_capture(&self, now: Instant) -> bool {
        let mut last = self
            .last_capture
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let pass = match *last {
            None => true,
            Some(previous) => now.saturating_duration_since(previous) >= self.window,
        };
        if pass {
            *last = Some(now);
        }
        pass
    }
}

/// Single-flight guard for capture cycles. New triggers are dropped while a
/// cycle is outstanding, never queued.
#[derive(Debug, Default)]
pub struct CaptureTrigger {
    in_flight: Arc<AtomicBool>,
}

impl CaptureTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_begin(&self) -> Option<InFlight> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight {
                flag: self.in_flight.clone(),
            })
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Held for the whole cycle; releases the trigger when dropped.
#[derive(Debug)]
pub struct InFlight {
    flag: Arc<AtomicBool>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}
