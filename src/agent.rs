//! Command Router: classifies inbound bus messages by topic and payload
//! shape, validates required fields, and launches simulator sessions as
//! independent tasks.
//!
//! Dispatch is fire-and-forget: the router never waits for a session to
//! finish, and sessions for the same pump id may overlap freely. The
//! returned [`JoinHandle`]s exist for observability; dropping them detaches
//! the session.

use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, trace, warn};

use crate::fault_injection::{FaultInjectionConfig, FaultInjector};
use crate::protocol::{
    derive_duration_ms, flush_targets, topics, CalibrationCommand, DispenseAmount,
    DispenseCommand, EmergencyStopCommand, ErrorCode, ErrorContext, ErrorEvent, FlushCommand,
    Qos, Severity,
};
use crate::rng::{SimRng, DEFAULT_SEED};
use crate::safety::{EmergencyStopHandler, PumpActivity, StopController};
use crate::sim::{
    self, CalibrationParams, DispenseParams, FlushParams, RecipeParams, SessionContext,
};
use crate::telemetry::TelemetryPublisher;
use crate::transport::Publisher;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Probability that a dispense fails with a simulated hardware error.
    pub error_rate: f64,
    /// Seed for every random draw the engine makes.
    pub seed: u64,
    /// Label reported in heartbeats.
    pub firmware_version: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            error_rate: 0.0,
            seed: DEFAULT_SEED,
            firmware_version: "SIM_v1.0.0".into(),
        }
    }
}

/// The simulation engine's front door. One instance per process; the hosting
/// transport feeds it decoded messages one at a time.
pub struct PumpAgent {
    publisher: Publisher,
    stop: StopController,
    pumps: PumpActivity,
    started: Instant,
    stop_handler: EmergencyStopHandler,
    injector: FaultInjector,
    rng: SimRng,
    firmware_version: String,
}

impl PumpAgent {
    pub fn new(config: AgentConfig, publisher: Publisher) -> Self {
        let stop = StopController::new();
        let pumps = PumpActivity::new();
        let started = Instant::now();
        let stop_handler = EmergencyStopHandler::new(
            stop.clone(),
            pumps.clone(),
            publisher.clone(),
            started,
        );

        Self {
            publisher,
            stop,
            pumps,
            started,
            stop_handler,
            injector: FaultInjector::new(FaultInjectionConfig {
                error_rate: config.error_rate,
            }),
            rng: SimRng::new(config.seed),
            firmware_version: config.firmware_version,
        }
    }

    /// Handle to the stop signal shared with every preemptible session.
    pub fn stop_signal(&self) -> StopController {
        self.stop.clone()
    }

    /// Handle to the shared pump-activity gauge.
    pub fn activity(&self) -> PumpActivity {
        self.pumps.clone()
    }

    /// Launch the heartbeat task. Runs until aborted, regardless of command
    /// traffic or the stop signal.
    pub fn spawn_telemetry(&mut self) -> JoinHandle<()> {
        let telemetry = TelemetryPublisher::new(
            self.publisher.clone(),
            self.pumps.clone(),
            self.started,
            self.firmware_version.clone(),
            self.rng.fork(),
        );
        tokio::spawn(telemetry.run())
    }

    /// Route one inbound bus message. Unknown topics are ignored; payloads
    /// that fail to decode are logged and dropped without an error event.
    /// Returns the session task when one was launched.
    pub fn handle_message(&mut self, topic: &str, payload: &[u8]) -> Option<JoinHandle<()>> {
        match topic {
            topics::DISPENSE_COMMAND => self.handle_dispense(payload),
            topics::MAINTENANCE_FLUSH => self.handle_flush(payload),
            topics::CALIBRATION_START => self.handle_calibration(payload),
            topics::EMERGENCY_STOP => self.handle_emergency_stop(payload),
            other => {
                trace!("ignoring message on unhandled topic: {}", other);
                None
            }
        }
    }

    fn handle_dispense(&mut self, payload: &[u8]) -> Option<JoinHandle<()>> {
        let cmd: DispenseCommand = self.decode(topics::DISPENSE_COMMAND, payload)?;

        let (Some(pump_id), Some(amount)) = (cmd.pump_id, cmd.amount_ml) else {
            self.publish_error(
                cmd.pump_id.unwrap_or(0),
                ErrorCode::InvalidCommand,
                Severity::Critical,
                "Missing required fields: pump_id and amount_ml",
            );
            return None;
        };
        let recipe_name = cmd.recipe_name.unwrap_or_else(|| "Unknown".to_owned());

        match amount {
            DispenseAmount::Recipe(steps) => {
                let first_pump = steps.first().map(|s| s.pump_number).unwrap_or(1);
                if let Some(code) = self.injector.try_inject(&mut self.rng) {
                    self.publish_error(
                        first_pump,
                        code,
                        Severity::Critical,
                        format!("Simulated error: {}", code),
                    );
                    return None;
                }
                info!(
                    "multi-pump recipe '{}': {} ingredients",
                    recipe_name,
                    steps.len()
                );
                let ctx = self.session_context();
                Some(tokio::spawn(sim::recipe::run(
                    ctx,
                    RecipeParams { steps, recipe_name },
                )))
            }
            DispenseAmount::Single(amount_ml) => {
                let duration_ms = cmd
                    .duration_ms
                    .unwrap_or_else(|| derive_duration_ms(amount_ml));
                if let Some(code) = self.injector.try_inject(&mut self.rng) {
                    self.publish_error(
                        pump_id,
                        code,
                        Severity::Critical,
                        format!("Simulated error: {}", code),
                    );
                    return None;
                }
                let ctx = self.session_context();
                Some(tokio::spawn(sim::dispense::run(
                    ctx,
                    DispenseParams {
                        pump_id,
                        amount_ml,
                        duration_ms,
                        recipe_name,
                    },
                )))
            }
        }
    }

    fn handle_flush(&mut self, payload: &[u8]) -> Option<JoinHandle<()>> {
        let cmd: FlushCommand = self.decode(topics::MAINTENANCE_FLUSH, payload)?;

        let (Some(pump_id), Some(duration_ms)) = (cmd.pump_id, cmd.duration_ms) else {
            self.publish_error(
                0,
                ErrorCode::InvalidCommand,
                Severity::Warning,
                "Missing pump_id or duration_ms",
            );
            return None;
        };

        let pump_ids = flush_targets(pump_id);
        let ctx = self.session_context();
        Some(tokio::spawn(sim::maintenance::run_flush(
            ctx,
            FlushParams {
                pump_ids,
                duration_ms,
            },
        )))
    }

    fn handle_calibration(&mut self, payload: &[u8]) -> Option<JoinHandle<()>> {
        let cmd: CalibrationCommand = self.decode(topics::CALIBRATION_START, payload)?;

        // No required fields beyond the defaults; timeout_ms is carried in
        // the command but not enforced here.
        let ctx = self.session_context();
        Some(tokio::spawn(sim::maintenance::run_calibration(
            ctx,
            CalibrationParams {
                pump_id: cmd.pump_id,
                test_amount_ml: cmd.test_amount_ml,
            },
        )))
    }

    fn handle_emergency_stop(&mut self, payload: &[u8]) -> Option<JoinHandle<()>> {
        let cmd: EmergencyStopCommand = self.decode(topics::EMERGENCY_STOP, payload)?;
        Some(self.stop_handler.engage(&cmd.reason))
    }

    fn decode<T: DeserializeOwned>(&self, topic: &str, payload: &[u8]) -> Option<T> {
        match serde_json::from_slice(payload) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("undecodable payload on {}: {}", topic, e);
                None
            }
        }
    }

    fn session_context(&mut self) -> SessionContext {
        SessionContext {
            publisher: self.publisher.clone(),
            stop: self.stop.clone(),
            pumps: self.pumps.clone(),
            engine_started: self.started,
            rng: self.rng.fork(),
        }
    }

    fn publish_error(
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
                uptime_ms: self.started.elapsed().as_millis() as u64,
                pumps_active: self.pumps.get(),
            },
        );
        self.publisher
            .publish(topics::ERROR, &event, Qos::AtLeastOnce, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{self, Envelope};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn test_agent(error_rate: f64) -> (PumpAgent, UnboundedReceiver<Envelope>) {
        let (publisher, rx) = transport::channel();
        let agent = PumpAgent::new(
            AgentConfig {
                error_rate,
                seed: 42,
                ..AgentConfig::default()
            },
            publisher,
        );
        (agent, rx)
    }

    #[tokio::test]
    async fn test_unknown_topic_is_ignored() {
        let (mut agent, mut rx) = test_agent(0.0);
        let handle = agent.handle_message("pumpbus/unknown", b"{}");
        assert!(handle.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_payload_publishes_nothing() {
        let (mut agent, mut rx) = test_agent(0.0);
        let handle = agent.handle_message(topics::DISPENSE_COMMAND, b"not json at all");
        assert!(handle.is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispense_missing_fields_rejected() {
        let (mut agent, mut rx) = test_agent(0.0);
        let handle = agent.handle_message(topics::DISPENSE_COMMAND, b"{}");
        assert!(handle.is_none());

        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.topic, topics::ERROR);
        assert_eq!(envelope.payload["error_code"], "INVALID_COMMAND");
        assert_eq!(envelope.payload["severity"], "critical");
        assert_eq!(envelope.payload["pump_id"], 0);
        // Exactly one event, no session started
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispense_missing_amount_keeps_supplied_pump_id() {
        let (mut agent, mut rx) = test_agent(0.0);
        let handle = agent.handle_message(topics::DISPENSE_COMMAND, br#"{"pump_id": 5}"#);
        assert!(handle.is_none());

        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.payload["pump_id"], 5);
        assert_eq!(envelope.payload["error_code"], "INVALID_COMMAND");
    }

    #[tokio::test]
    async fn test_flush_missing_fields_is_warning() {
        let (mut agent, mut rx) = test_agent(0.0);
        let handle = agent.handle_message(topics::MAINTENANCE_FLUSH, br#"{"pump_id": 2}"#);
        assert!(handle.is_none());

        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.topic, topics::ERROR);
        assert_eq!(envelope.payload["error_code"], "INVALID_COMMAND");
        assert_eq!(envelope.payload["severity"], "warning");
        assert_eq!(envelope.payload["pump_id"], 0);
    }

    #[tokio::test]
    async fn test_injected_fault_blocks_session() {
        let (mut agent, mut rx) = test_agent(1.0);
        let handle =
            agent.handle_message(topics::DISPENSE_COMMAND, br#"{"pump_id": 3, "amount_ml": 10.0}"#);
        assert!(handle.is_none());

        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.topic, topics::ERROR);
        assert_eq!(envelope.payload["severity"], "critical");
        assert_eq!(envelope.payload["pump_id"], 3);
        let code = envelope.payload["error_code"].as_str().unwrap();
        assert!(["PUMP_STUCK", "FLOW_SENSOR_ERROR", "TIMEOUT"].contains(&code));
        let message = envelope.payload["message"].as_str().unwrap();
        assert_eq!(message, format!("Simulated error: {}", code));
    }

    #[tokio::test]
    async fn test_error_context_carries_uptime_and_activity() {
        let (mut agent, mut rx) = test_agent(0.0);
        agent.handle_message(topics::DISPENSE_COMMAND, b"{}");

        let envelope = rx.try_recv().unwrap();
        assert!(envelope.payload["context"]["uptime_ms"].is_u64());
        assert_eq!(envelope.payload["context"]["pumps_active"], 0);
    }
}
