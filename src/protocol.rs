use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Nominal pump flow rate used to derive durations when a command omits them.
pub const NOMINAL_FLOW_RATE_ML_S: f64 = 20.0;
/// Status publishing cadence for dispense sessions.
pub const STATUS_TICK_MS: u64 = 500;
/// Lower bound on a per-step dispense duration in a recipe.
pub const MIN_STEP_DURATION_MS: u64 = 500;
/// Pause between consecutive pumps in a recipe.
pub const INTER_PUMP_DELAY_MS: u64 = 500;
/// Number of physical pumps addressed by a bulk flush.
pub const PUMP_COUNT: i32 = 8;
/// Sentinel pump id meaning "all pumps".
pub const ALL_PUMPS: i32 = -1;

pub mod topics {
    // Subscribed (commands in)
    pub const DISPENSE_COMMAND: &str = "pumpbus/dispense/command";
    pub const MAINTENANCE_FLUSH: &str = "pumpbus/maintenance/flush";
    pub const CALIBRATION_START: &str = "pumpbus/calibration/start";
    pub const EMERGENCY_STOP: &str = "pumpbus/emergency/stop";

    // Published (events out)
    pub const STATUS: &str = "pumpbus/status";
    pub const DISPENSE_COMPLETE: &str = "pumpbus/dispense/complete";
    pub const MAINTENANCE_COMPLETE: &str = "pumpbus/maintenance/complete";
    pub const ERROR: &str = "pumpbus/error";
    pub const HEARTBEAT: &str = "pumpbus/heartbeat";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl From<u8> for Qos {
    fn from(level: u8) -> Self {
        match level {
            2 => Qos::ExactlyOnce,
            1 => Qos::AtLeastOnce,
            _ => Qos::AtMostOnce,
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

/// Dispense request. `amount_ml` is either a single volume or an ordered
/// ingredient list; the router decides which simulator runs based on the
/// shape. Required-field checks happen in the router, not here, so a payload
/// with missing fields decodes cleanly and is reported as `INVALID_COMMAND`
/// rather than swallowed as a decode failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispenseCommand {
    pub pump_id: Option<i32>,
    pub amount_ml: Option<DispenseAmount>,
    pub duration_ms: Option<u64>,
    pub recipe_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DispenseAmount {
    Single(f64),
    Recipe(Vec<IngredientStep>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngredientStep {
    #[serde(default = "default_pump_number")]
    pub pump_number: i32,
    #[serde(default)]
    pub quantity_ml: f64,
    #[serde(default = "default_ingredient")]
    pub ingredient: String,
    /// Display sequence; defaults to array position + 1 when absent.
    #[serde(default)]
    pub order: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushCommand {
    pub pump_id: Option<i32>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationCommand {
    #[serde(default)]
    pub pump_id: i32,
    #[serde(default = "default_test_amount")]
    pub test_amount_ml: f64,
    /// Accepted for wire compatibility; the simulator does not enforce it.
    #[serde(default = "default_calibration_timeout")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyStopCommand {
    #[serde(default = "default_reason")]
    pub reason: String,
}

fn default_pump_number() -> i32 {
    1
}

fn default_ingredient() -> String {
    "Unknown".into()
}

fn default_test_amount() -> f64 {
    50.0
}

fn default_calibration_timeout() -> u64 {
    30_000
}

fn default_reason() -> String {
    "Unknown".into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpState {
    Dispensing,
    Idle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub pump_id: i32,
    pub state: PumpState,
    pub progress_ml: f64,
    pub target_ml: f64,
    pub flow_rate_ml_s: f64,
    pub elapsed_ms: u64,
    pub timestamp: String,
}

/// Terminal event for a dispense session. `pump_id` 0 marks a whole-recipe
/// completion; any other value is the single pump that ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispenseComplete {
    pub pump_id: i32,
    pub recipe_name: String,
    pub requested_ml: f64,
    pub actual_ml: f64,
    pub duration_ms: u64,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action_type", rename_all = "lowercase")]
pub enum MaintenanceComplete {
    Flush {
        pump_id: i32,
        duration_ms: u64,
        timestamp: String,
    },
    Calibration {
        pump_id: i32,
        test_amount_ml: f64,
        actual_duration_ms: u64,
        ml_per_second: f64,
        timestamp: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidCommand,
    PumpStuck,
    FlowSensorError,
    Timeout,
    EmergencyStop,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidCommand => "INVALID_COMMAND",
            ErrorCode::PumpStuck => "PUMP_STUCK",
            ErrorCode::FlowSensorError => "FLOW_SENSOR_ERROR",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::EmergencyStop => "EMERGENCY_STOP",
        }
    }
}

impl core::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    pub uptime_ms: u64,
    pub pumps_active: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub pump_id: i32,
    pub error_code: ErrorCode,
    pub severity: Severity,
    pub message: String,
    pub timestamp: String,
    pub context: ErrorContext,
}

impl ErrorEvent {
    /// Build an error event stamped with the current time.
    pub fn now(
        pump_id: i32,
        error_code: ErrorCode,
        severity: Severity,
        message: impl Into<String>,
        context: ErrorContext,
    ) -> Self {
        Self {
            pump_id,
            error_code,
            severity,
            message: message.into(),
            timestamp: utc_timestamp(),
            context,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub uptime_ms: u64,
    pub wifi_rssi: i64,
    pub free_heap: i64,
    pub total_heap: i64,
    pub pumps_active: i64,
    pub firmware_version: String,
    pub timestamp: String,
}

/// Volumes are rounded to 2 decimal places at publish time.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// UTC ISO-8601 timestamp with millisecond precision and `Z` suffix.
pub fn utc_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Duration for a volume at the nominal 20 ml/s flow rate, truncated to
/// whole milliseconds.
pub fn derive_duration_ms(amount_ml: f64) -> u64 {
    ((amount_ml / NOMINAL_FLOW_RATE_ML_S) * 1000.0) as u64
}

/// Expand a flush target: `-1` addresses every pump, anything else is a
/// singleton set.
pub fn flush_targets(pump_id: i32) -> Vec<i32> {
    if pump_id == ALL_PUMPS {
        (1..=PUMP_COUNT).collect()
    } else {
        vec![pump_id]
    }
}
