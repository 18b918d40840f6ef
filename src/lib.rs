//! # Pump Bus Simulator
//!
//! Simulates a networked multi-pump liquid-dispensing controller driven
//! entirely by commands on a publish/subscribe bus. It exists so a control
//! application can be built and tested against realistic device behavior
//! before real firmware is available.
//!
//! ## Features
//!
//! - **Timed dispense simulation**: single-pump and sequential multi-pump
//!   recipes with live progress, flow-rate, and cumulative-volume reporting
//! - **Maintenance cycles**: fixed-duration flushes (single pump or all
//!   eight) and flow-rate calibration runs
//! - **Emergency stop**: a process-wide stop signal polled by running
//!   dispenses, with an automatic 2-second release
//! - **Fault injection**: configurable probability of simulated hardware
//!   failures, deterministic under a fixed seed
//! - **Health telemetry**: an independent 10-second heartbeat
//!
//! ## Quick Start
//!
//! ```rust
//! use pumpbus::agent::{AgentConfig, PumpAgent};
//! use pumpbus::protocol::topics;
//! use pumpbus::transport;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (publisher, mut events) = transport::channel();
//! let mut agent = PumpAgent::new(AgentConfig::default(), publisher);
//!
//! // Commands arrive as raw bus payloads; events come back on the channel.
//! let session = agent.handle_message(
//!     topics::DISPENSE_COMMAND,
//!     br#"{"pump_id": 1, "amount_ml": 10.0}"#,
//! );
//! if let Some(session) = session {
//!     session.await.unwrap();
//! }
//! while let Ok(event) = events.try_recv() {
//!     println!("{} -> {}", event.topic, event.payload);
//! }
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`agent`] - command routing, validation, and session launch
//! - [`sim`] - dispense, recipe, flush, and calibration session tasks
//! - [`safety`] - stop signal, activity gauge, emergency-stop handling
//! - [`fault_injection`] - pre-session simulated hardware failures
//! - [`telemetry`] - periodic heartbeat snapshots
//! - [`protocol`] - wire types, topics, QoS levels
//! - [`transport`] - outbound envelope channel consumed by the bus host

pub mod agent;
pub mod fault_injection;
pub mod protocol;
pub mod rng;
pub mod safety;
pub mod sim;
pub mod telemetry;
pub mod transport;

// Re-export main public types for convenience
pub use agent::{AgentConfig, PumpAgent};
pub use protocol::{Qos, topics};
pub use transport::{Envelope, Publisher};
