//! Outbound message plumbing between the simulators and whatever carries the
//! bus. Simulators publish typed payloads wrapped in an [`Envelope`]; the
//! simulator binary drains the channel into its TCP clients, tests drain it
//! directly. Connection management, QoS delivery, and retained messages are
//! the transport's concern; the engine only records the levels it wants.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use crate::protocol::Qos;

/// One bus message: topic, delivery parameters, and a JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub qos: Qos,
    #[serde(default)]
    pub retain: bool,
    pub payload: serde_json::Value,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("bus channel closed")]
    Closed,
}

/// Clonable publishing handle. Cheap to hand to every session task.
#[derive(Debug, Clone)]
pub struct Publisher {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Publisher {
    pub fn try_publish<T: Serialize>(
        &self,
        topic: &str,
        payload: &T,
        qos: Qos,
        retain: bool,
    ) -> Result<(), TransportError> {
        let envelope = Envelope {
            topic: topic.to_owned(),
            qos,
            retain,
            payload: serde_json::to_value(payload)?,
        };
        self.tx.send(envelope).map_err(|_| TransportError::Closed)
    }

    /// Publish and log instead of propagating. Sessions report through the
    /// bus itself, so a transport failure has nowhere better to go.
    pub fn publish<T: Serialize>(&self, topic: &str, payload: &T, qos: Qos, retain: bool) {
        if let Err(e) = self.try_publish(topic, payload, qos, retain) {
            warn!("dropping {} event: {}", topic, e);
        }
    }
}

/// In-process bus endpoint: a publisher and the stream of everything it sends.
pub fn channel() -> (Publisher, mpsc::UnboundedReceiver<Envelope>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Publisher { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_publish_delivers_envelope() {
        let (publisher, mut rx) = channel();
        publisher
            .try_publish(
                "pumpbus/status",
                &json!({"pump_id": 1}),
                Qos::AtMostOnce,
                false,
            )
            .unwrap();

        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.topic, "pumpbus/status");
        assert_eq!(envelope.qos, Qos::AtMostOnce);
        assert!(!envelope.retain);
        assert_eq!(envelope.payload["pump_id"], 1);
    }

    #[test]
    fn test_publish_after_receiver_dropped() {
        let (publisher, rx) = channel();
        drop(rx);
        let result = publisher.try_publish("pumpbus/error", &json!({}), Qos::AtLeastOnce, false);
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[test]
    fn test_envelope_wire_format() {
        let envelope = Envelope {
            topic: "pumpbus/heartbeat".into(),
            qos: Qos::AtMostOnce,
            retain: false,
            payload: json!({"uptime_ms": 12}),
        };
        let line = serde_json::to_string(&envelope).unwrap();
        let back: Envelope = serde_json::from_str(&line).unwrap();
        assert_eq!(back.topic, "pumpbus/heartbeat");
        assert_eq!(back.payload["uptime_ms"], 12);
    }
}
