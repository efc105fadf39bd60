//! # Guardian - Resource-health admission control
//!
//! Protects a serving pipeline from overload by turning host resource
//! readings into a health state, and that state into per-request
//! allow/degrade/block decisions.
//!
//! ## Key Features
//!
//! - **Hysteresis**: sustained pressure (full sliding window) for brownout,
//!   dwell time before recovery
//! - **Hard limits**: RAM, temperature and battery breaches go straight to
//!   emergency
//! - **Cached admission**: one health fetch per TTL, collapsed across
//!   concurrent requests
//! - **Fail-safe**: health source failures fail open briefly, then closed
//!
//! ## Quick Start
//!
//! ```rust
//! use guardian::{AdmissionGate, FixedSampler, HealthPublisher, PublisherSource, Thresholds};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let publisher = Arc::new(HealthPublisher::new(FixedSampler::nominal(), Thresholds::default()));
//! let gate = AdmissionGate::new(PublisherSource::new(Arc::clone(&publisher)));
//!
//! let decision = gate.check("/v1/generate").await;
//! assert!(decision.allowed);
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Thresholds and gate settings
//! - [`sampler`]: Metric sampling contract
//! - [`window`]: Fixed-capacity sliding window
//! - [`state`]: Resource state machine
//! - [`report`]: Health query wire contract
//! - [`publisher`]: Health publisher
//! - [`gate`]: Admission gate

// Modules
pub mod config;
pub mod error;
pub mod gate;
pub mod publisher;
pub mod report;
pub mod sampler;
pub mod state;
pub mod window;

// Re-exports for convenient access
pub use config::{GateConfig, GuardianConfig, Thresholds};
pub use error::{GuardianError, Result, SensorError};
pub use gate::{
    AdmissionDecision, AdmissionGate, BlockedBody, CachedStatus, GuardianStatus, HealthSource,
    PublisherSource, RETRY_AFTER_HEADER, STATE_HEADER, WARNING_HEADER,
};
pub use publisher::HealthPublisher;
pub use report::{HealthReport, HEALTH_CONTRACT_VERSION};
pub use sampler::{FixedSampler, Sample, Sampler, SensorReadings};
pub use state::{BrownoutLevel, GuardianState, ResourceState, ResourceStateMachine, TransitionReason};
pub use window::SlidingWindow;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
