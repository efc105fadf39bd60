// Guardian - Resource-health admission control
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Health query wire contract (version "1").
//!
//! ```json
//! {"v":"1","state":"BROWNOUT","brownout_level":"LIGHT","reason":"SOFT_TRIGGER",
//!  "since_s":12.5,"ram_pct":81.0,"cpu_pct":40.2,"temp_c":null,"battery_pct":null}
//! ```
//!
//! State names stay plain strings so consumers can receive values this
//! version does not know about and decide what to do with them.

use crate::error::Result;
use crate::sampler::Sample;
use crate::state::GuardianState;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Contract version emitted in the `v` field
pub const HEALTH_CONTRACT_VERSION: &str = "1";

/// Health snapshot as served to and consumed by admission gates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    #[serde(default = "default_version")]
    pub v: String,
    pub state: String,
    #[serde(default)]
    pub brownout_level: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub since_s: f64,
    #[serde(default)]
    pub ram_pct: f64,
    #[serde(default)]
    pub cpu_pct: f64,
    #[serde(default)]
    pub temp_c: Option<f64>,
    #[serde(default)]
    pub battery_pct: Option<f64>,
}

fn default_version() -> String {
    HEALTH_CONTRACT_VERSION.to_string()
}

impl HealthReport {
    /// Build a report from a state snapshot and the sample that produced it.
    pub fn new(state: &GuardianState, sample: Option<&Sample>, now: Instant) -> Self {
        Self {
            v: default_version(),
            state: state.state.as_str().to_string(),
            brownout_level: state.brownout_level.as_str().to_string(),
            reason: state.reason.as_str().to_string(),
            since_s: round_to(state.time_in_state(now).as_secs_f64(), 3),
            ram_pct: sample.map_or(0.0, |s| round_to(s.ram_frac * 100.0, 1)),
            cpu_pct: sample.map_or(0.0, |s| round_to(s.cpu_frac * 100.0, 1)),
            temp_c: sample.and_then(|s| s.temp_c),
            battery_pct: sample.and_then(|s| s.battery_pct),
        }
    }

    /// Parse a report from JSON bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Encode as JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}
