//! Emergency-stop state and the shared pump-activity gauge.
//!
//! Both live for the whole process, are never persisted, and are the only
//! mutable state shared across session tasks. Each is a single atomic: no
//! task reads one and conditionally writes the other, so no lock is needed.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{info, warn};

use crate::protocol::{topics, ErrorCode, ErrorContext, ErrorEvent, Qos, Severity};
use crate::transport::Publisher;

/// How long the stop signal stays armed before releasing on its own.
pub const STOP_RESET_DELAY_MS: u64 = 2000;

#[derive(Debug)]
struct StopState {
    armed: AtomicBool,
    /// Bumped on every arm so a stale cooldown cannot release a newer arm.
    generation: AtomicU64,
}

/// Process-wide stop signal. Preemptible sessions poll [`is_armed`] at their
/// tick boundaries; nothing blocks on it.
///
/// [`is_armed`]: StopController::is_armed
#[derive(Debug, Clone)]
pub struct StopController {
    state: Arc<StopState>,
}

impl StopController {
    pub fn new() -> Self {
        Self {
            state: Arc::new(StopState {
                armed: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.state.armed.load(Ordering::SeqCst)
    }

    /// Arm the stop signal and return the arm generation. Re-arming while
    /// already armed just moves to a new generation.
    pub fn arm(&self) -> u64 {
        let generation = self.state.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.armed.store(true, Ordering::SeqCst);
        generation
    }

    /// Release the signal, but only if `generation` is still the most recent
    /// arm. Returns whether the release happened.
    pub fn clear_if(&self, generation: u64) -> bool {
        if self.state.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        self.state.armed.store(false, Ordering::SeqCst);
        if self.state.generation.load(Ordering::SeqCst) != generation {
            // a re-arm raced the release; restore it
            self.state.armed.store(true, Ordering::SeqCst);
            return false;
        }
        true
    }
}

impl Default for StopController {
    fn default() -> Self {
        Self::new()
    }
}

/// Count of pumps currently running a session. Reporting only: this is not
/// an admission lock, and two sessions may drive the same pump id at once.
/// Signed because an emergency stop forces it to zero while in-flight
/// sessions still decrement on their way out.
#[derive(Debug, Clone)]
pub struct PumpActivity {
    count: Arc<AtomicI64>,
}

impl PumpActivity {
    pub fn new() -> Self {
        Self {
            count: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn add(&self, n: i64) {
        self.count.fetch_add(n, Ordering::SeqCst);
    }

    pub fn sub(&self, n: i64) {
        self.count.fetch_sub(n, Ordering::SeqCst);
    }

    pub fn get(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
    }
}

impl Default for PumpActivity {
    fn default() -> Self {
        Self::new()
    }
}

/// Applies the emergency-stop transition: arm the signal, zero the activity
/// gauge, report the stop, and schedule the automatic release.
#[derive(Debug, Clone)]
pub struct EmergencyStopHandler {
    stop: StopController,
    pumps: PumpActivity,
    publisher: Publisher,
    engine_started: Instant,
}

impl EmergencyStopHandler {
    pub fn new(
        stop: StopController,
        pumps: PumpActivity,
        publisher: Publisher,
        engine_started: Instant,
    ) -> Self {
        Self {
            stop,
            pumps,
            publisher,
            engine_started,
        }
    }

    /// Side effects run synchronously, in order; only the release countdown
    /// is spawned. Returns the countdown task.
    pub fn engage(&self, reason: &str) -> JoinHandle<()> {
        warn!("EMERGENCY STOP: {}", reason);
        let generation = self.stop.arm();
        self.pumps.reset();

        let event = ErrorEvent::now(
            0,
            ErrorCode::EmergencyStop,
            Severity::Critical,
            format!("Emergency stop: {}", reason),
            ErrorContext {
                uptime_ms: self.engine_started.elapsed().as_millis() as u64,
                pumps_active: self.pumps.get(),
            },
        );
        self.publisher
            .publish(topics::ERROR, &event, Qos::AtLeastOnce, false);

        let stop = self.stop.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(STOP_RESET_DELAY_MS)).await;
            if stop.clear_if(generation) {
                info!("emergency stop released, ready for new commands");
            }
        })
    }
}
