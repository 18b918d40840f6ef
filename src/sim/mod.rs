//! Session simulators. Each accepted command runs as one tokio task owning a
//! [`SessionContext`]; the task publishes zero or more progress events and
//! exactly one terminal event (completion or error), then drops the session.

pub mod dispense;
pub mod maintenance;
pub mod recipe;

use tokio::time::Instant;

use crate::protocol::{topics, ErrorCode, ErrorContext, ErrorEvent, IngredientStep, Qos, Severity};
use crate::rng::SimRng;
use crate::safety::{PumpActivity, StopController};
use crate::transport::Publisher;

/// Everything a session task needs: the outbound bus, the two process-wide
/// gauges, the engine epoch for error context, and a private RNG stream.
pub struct SessionContext {
    pub publisher: Publisher,
    pub stop: StopController,
    pub pumps: PumpActivity,
    pub engine_started: Instant,
    pub rng: SimRng,
}

impl SessionContext {
    pub fn publish_error(
        &self,
        pump_id: i32,
        error_code: ErrorCode,
        severity: Severity,
        message: impl Into<String>,
    ) {
        let event = ErrorEvent::now(
            pump_id,
            error_code,
            severity,
            message,
            ErrorContext {
                uptime_ms: self.engine_started.elapsed().as_millis() as u64,
                pumps_active: self.pumps.get(),
            },
        );
        self.publisher
            .publish(topics::ERROR, &event, Qos::AtLeastOnce, false);
    }
}

#[derive(Debug, Clone)]
pub struct DispenseParams {
    pub pump_id: i32,
    pub amount_ml: f64,
    pub duration_ms: u64,
    pub recipe_name: String,
}

#[derive(Debug, Clone)]
pub struct RecipeParams {
    pub steps: Vec<IngredientStep>,
    pub recipe_name: String,
}

#[derive(Debug, Clone)]
pub struct FlushParams {
    pub pump_ids: Vec<i32>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct CalibrationParams {
    pub pump_id: i32,
    pub test_amount_ml: f64,
}
