//! Single-pump timed dispense.

use tokio::time::{sleep, Duration, Instant};
use tracing::info;

use super::{DispenseParams, SessionContext};
use crate::protocol::{
    round2, topics, utc_timestamp, DispenseComplete, ErrorCode, PumpState, Qos, Severity,
    StatusEvent, STATUS_TICK_MS,
};

/// Deliver `amount_ml` over `duration_ms`, publishing a status event every
/// 500 ms and one completion at the end. The stop signal is polled at each
/// tick; an armed stop aborts the session with a single error event and no
/// completion.
pub async fn run(mut ctx: SessionContext, params: DispenseParams) {
    info!(
        "starting dispense: pump {}, {}ml, {}ms",
        params.pump_id, params.amount_ml, params.duration_ms
    );

    ctx.pumps.add(1);
    let started = Instant::now();
    let steps = (params.duration_ms / STATUS_TICK_MS).max(1);

    for i in 0..=steps {
        if ctx.stop.is_armed() {
            info!("dispense stopped (emergency): pump {}", params.pump_id);
            ctx.publish_error(
                params.pump_id,
                ErrorCode::EmergencyStop,
                Severity::Warning,
                "Emergency stop triggered",
            );
            ctx.pumps.sub(1);
            return;
        }

        let progress = i as f64 / steps as f64;
        let current_ml = params.amount_ml * progress;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let flow_rate_ml_s = if elapsed_ms > 0 {
            current_ml / elapsed_ms as f64 * 1000.0
        } else {
            0.0
        };

        let status = StatusEvent {
            pump_id: params.pump_id,
            state: if progress < 1.0 {
                PumpState::Dispensing
            } else {
                PumpState::Idle
            },
            progress_ml: round2(current_ml),
            target_ml: round2(params.amount_ml),
            flow_rate_ml_s: round2(flow_rate_ml_s),
            elapsed_ms,
            timestamp: utc_timestamp(),
        };
        ctx.publisher
            .publish(topics::STATUS, &status, Qos::AtMostOnce, false);

        if i < steps {
            sleep(Duration::from_millis(STATUS_TICK_MS)).await;
        }
    }

    // Physical pumps never hit the requested volume exactly
    let actual_ml = round2(params.amount_ml * ctx.rng.range_f64(0.95, 1.05));

    let complete = DispenseComplete {
        pump_id: params.pump_id,
        recipe_name: params.recipe_name,
        requested_ml: round2(params.amount_ml),
        actual_ml,
        duration_ms: started.elapsed().as_millis() as u64,
        timestamp: utc_timestamp(),
    };
    ctx.publisher
        .publish(topics::DISPENSE_COMPLETE, &complete, Qos::AtLeastOnce, false);
    info!("dispense complete: pump {}, {}ml", params.pump_id, actual_ml);

    ctx.pumps.sub(1);
}
