//! Flush and calibration sessions.
//!
//! Neither polls the stop signal: a flush or calibration in flight runs to
//! completion even while an emergency stop is armed. The asymmetry with the
//! dispense simulators is intentional controller behavior, not an oversight.

use tokio::time::{sleep, Duration};
use tracing::info;

use super::{CalibrationParams, FlushParams, SessionContext};
use crate::protocol::{round2, topics, utc_timestamp, MaintenanceComplete, Qos};

/// Per-ml calibration timing bounds, ms. A real pump lands near 100 ms/ml.
const CALIBRATION_MS_PER_ML_MIN: f64 = 80.0;
const CALIBRATION_MS_PER_ML_MAX: f64 = 120.0;

/// Rinse one pump or all of them: a single timed soak, then one completion
/// event per pump in the set. No progress events.
pub async fn run_flush(ctx: SessionContext, params: FlushParams) {
    info!(
        "starting flush: pumps {:?}, {}ms",
        params.pump_ids, params.duration_ms
    );

    let set_size = params.pump_ids.len() as i64;
    ctx.pumps.add(set_size);

    sleep(Duration::from_millis(params.duration_ms)).await;

    for &pump_id in &params.pump_ids {
        let complete = MaintenanceComplete::Flush {
            pump_id,
            duration_ms: params.duration_ms,
            timestamp: utc_timestamp(),
        };
        ctx.publisher.publish(
            topics::MAINTENANCE_COMPLETE,
            &complete,
            Qos::AtLeastOnce,
            false,
        );
        info!("flush complete: pump {}", pump_id);
    }

    ctx.pumps.sub(set_size);
}

/// Timed test dispense that derives the pump's empirical flow rate.
pub async fn run_calibration(mut ctx: SessionContext, params: CalibrationParams) {
    info!(
        "starting calibration: pump {}, {}ml",
        params.pump_id, params.test_amount_ml
    );

    ctx.pumps.add(1);

    let ms_per_ml = ctx
        .rng
        .range_f64(CALIBRATION_MS_PER_ML_MIN, CALIBRATION_MS_PER_ML_MAX);
    let actual_duration_ms = (params.test_amount_ml * ms_per_ml) as u64;

    sleep(Duration::from_millis(actual_duration_ms)).await;

    let ml_per_second = round2(params.test_amount_ml / (actual_duration_ms as f64 / 1000.0));
    let complete = MaintenanceComplete::Calibration {
        pump_id: params.pump_id,
        test_amount_ml: params.test_amount_ml,
        actual_duration_ms,
        ml_per_second,
        timestamp: utc_timestamp(),
    };
    ctx.publisher.publish(
        topics::MAINTENANCE_COMPLETE,
        &complete,
        Qos::AtLeastOnce,
        false,
    );
    info!(
        "calibration complete: pump {}, {} ml/s",
        params.pump_id, ml_per_second
    );

    ctx.pumps.sub(1);
}
