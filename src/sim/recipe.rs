//! Multi-pump recipe dispense.
//!
//! Steps run strictly in array order, one pump at a time. Status events carry
//! cumulative recipe progress against the whole recipe's volume, not the
//! current step's, so a client can render one continuous progress bar.

use tokio::time::{sleep, Duration, Instant};
use tracing::info;

use super::{RecipeParams, SessionContext};
use crate::protocol::{
    derive_duration_ms, round2, topics, utc_timestamp, DispenseComplete, ErrorCode, PumpState,
    Qos, Severity, StatusEvent, INTER_PUMP_DELAY_MS, MIN_STEP_DURATION_MS, STATUS_TICK_MS,
};

pub async fn run(mut ctx: SessionContext, params: RecipeParams) {
    let recipe_started = Instant::now();
    let step_count = params.steps.len();
    let total_recipe_ml: f64 = params.steps.iter().map(|s| s.quantity_ml).sum();

    info!(
        "starting recipe '{}': {} ingredients, {:.1}ml total",
        params.recipe_name, step_count, total_recipe_ml
    );

    // Actual delivered volume so far; feeds the cumulative progress the next
    // step reports on top of.
    let mut cumulative_ml = 0.0_f64;
    let mut total_actual_ml = 0.0_f64;
    let mut total_requested_ml = 0.0_f64;

    for (idx, step) in params.steps.iter().enumerate() {
        let order = step.order.unwrap_or(idx as u32 + 1);
        info!(
            "[{}/{}] pump {}: {}ml of {} (cumulative {:.1}/{:.1}ml)",
            order,
            step_count,
            step.pump_number,
            step.quantity_ml,
            step.ingredient,
            cumulative_ml,
            total_recipe_ml
        );

        let duration_ms = derive_duration_ms(step.quantity_ml).max(MIN_STEP_DURATION_MS);

        ctx.pumps.add(1);
        let ticks = (duration_ms / STATUS_TICK_MS).max(1);

        for i in 0..=ticks {
            if ctx.stop.is_armed() {
                info!("recipe '{}' stopped (emergency)", params.recipe_name);
                ctx.publish_error(
                    step.pump_number,
                    ErrorCode::EmergencyStop,
                    Severity::Warning,
                    "Emergency stop triggered",
                );
                ctx.pumps.sub(1);
                // Later steps never run
                return;
            }

            let progress = i as f64 / ticks as f64;
            let current_step_ml = step.quantity_ml * progress;
            let recipe_progress_ml = cumulative_ml + current_step_ml;
            let recipe_elapsed_ms = recipe_started.elapsed().as_millis() as u64;
            let flow_rate_ml_s = if recipe_elapsed_ms > 0 {
                recipe_progress_ml / recipe_elapsed_ms as f64 * 1000.0
            } else {
                0.0
            };

            let status = StatusEvent {
                pump_id: step.pump_number,
                state: if progress < 1.0 {
                    PumpState::Dispensing
                } else {
                    PumpState::Idle
                },
                progress_ml: round2(recipe_progress_ml),
                target_ml: round2(total_recipe_ml),
                flow_rate_ml_s: round2(flow_rate_ml_s),
                elapsed_ms: recipe_elapsed_ms,
                timestamp: utc_timestamp(),
            };
            ctx.publisher
                .publish(topics::STATUS, &status, Qos::AtMostOnce, false);

            if i < ticks {
                sleep(Duration::from_millis(STATUS_TICK_MS)).await;
            }
        }

        let actual_ml = round2(step.quantity_ml * ctx.rng.range_f64(0.95, 1.05));
        total_actual_ml += actual_ml;
        total_requested_ml += step.quantity_ml;
        cumulative_ml += actual_ml;
        ctx.pumps.sub(1);

        info!(
            "pump {} complete: {}ml (cumulative {:.1}ml)",
            step.pump_number, actual_ml, cumulative_ml
        );

        if idx < step_count - 1 {
            sleep(Duration::from_millis(INTER_PUMP_DELAY_MS)).await;
        }
    }

    let complete = DispenseComplete {
        // 0 marks a whole-recipe completion
        pump_id: 0,
        recipe_name: params.recipe_name,
        requested_ml: round2(total_requested_ml),
        actual_ml: round2(total_actual_ml),
        duration_ms: recipe_started.elapsed().as_millis() as u64,
        timestamp: utc_timestamp(),
    };
    info!(
        "recipe complete: {:.1}ml total in {}ms",
        complete.actual_ml, complete.duration_ms
    );
    ctx.publisher
        .publish(topics::DISPENSE_COMPLETE, &complete, Qos::AtLeastOnce, false);
}
