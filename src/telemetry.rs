//! Periodic health heartbeat, published independently of command activity.

use tokio::time::{interval, Duration, Instant};
use tracing::debug;

use crate::protocol::{topics, utc_timestamp, Heartbeat, Qos};
use crate::rng::SimRng;
use crate::safety::PumpActivity;
use crate::transport::Publisher;

pub const HEARTBEAT_PERIOD_MS: u64 = 10_000;

// Fixed bounds for the simulated radio and memory readings.
const WIFI_RSSI_MIN_DBM: i64 = -90;
const WIFI_RSSI_MAX_DBM: i64 = -30;
const FREE_HEAP_MIN: i64 = 200_000;
const FREE_HEAP_MAX: i64 = 300_000;
const TOTAL_HEAP: i64 = 327_680;

/// Emits one independent health snapshot every 10 seconds, starting
/// immediately. Snapshots never accumulate state and ignore the stop signal.
pub struct TelemetryPublisher {
    publisher: Publisher,
    pumps: PumpActivity,
    engine_started: Instant,
    firmware_version: String,
    rng: SimRng,
}

impl TelemetryPublisher {
    pub fn new(
        publisher: Publisher,
        pumps: PumpActivity,
        engine_started: Instant,
        firmware_version: String,
        rng: SimRng,
    ) -> Self {
        Self {
            publisher,
            pumps,
            engine_started,
            firmware_version,
            rng,
        }
    }

    pub fn snapshot(&mut self) -> Heartbeat {
        Heartbeat {
            uptime_ms: self.engine_started.elapsed().as_millis() as u64,
            wifi_rssi: self.rng.range_i64(WIFI_RSSI_MIN_DBM, WIFI_RSSI_MAX_DBM),
            free_heap: self.rng.range_i64(FREE_HEAP_MIN, FREE_HEAP_MAX),
            total_heap: TOTAL_HEAP,
            pumps_active: self.pumps.get(),
            firmware_version: self.firmware_version.clone(),
            timestamp: utc_timestamp(),
        }
    }

    pub async fn run(mut self) {
        let mut ticker = interval(Duration::from_millis(HEARTBEAT_PERIOD_MS));
        loop {
            ticker.tick().await;
            let heartbeat = self.snapshot();
            debug!(
                "heartbeat: uptime {}s, rssi {}dBm, {} pumps active",
                heartbeat.uptime_ms / 1000,
                heartbeat.wifi_rssi,
                heartbeat.pumps_active
            );
            self.publisher
                .publish(topics::HEARTBEAT, &heartbeat, Qos::AtMostOnce, false);
        }
    }
}
