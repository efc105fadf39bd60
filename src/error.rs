// Guardian - Resource-health admission control
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Error types for Guardian
//!
//! None of these ever reach a request caller: the gate folds every failure
//! into one of its admission outcomes. They exist for sensors, health
//! sources and configuration loading.

use thiserror::Error;

/// Result type alias for Guardian operations
pub type Result<T> = std::result::Result<T, GuardianError>;

/// Main error type for Guardian operations
#[derive(Error, Debug)]
pub enum GuardianError {
    /// A metric read failed
    #[error("Sensor error: {0}")]
    Sensor(#[from] SensorError),

    /// The health source could not be queried
    #[error("Health source unreachable: {0}")]
    HealthUnreachable(String),

    /// The health fetch exceeded its deadline
    #[error("Health fetch timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// A status string outside the known set
    #[error("Unrecognized guardian status: {0}")]
    UnrecognizedStatus(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Health payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors reading a single metric
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SensorError {
    /// The read failed on this attempt
    #[error("Sensor unavailable: {metric}")]
    Unavailable { metric: &'static str },

    /// The host has no such sensor
    #[error("Sensor unsupported on this host: {metric}")]
    Unsupported { metric: &'static str },
}

impl SensorError {
    /// Name of the metric that failed
    pub fn metric(&self) -> &'static str {
        match self {
            Self::Unavailable { metric } | Self::Unsupported { metric } => metric,
        }
    }
}
