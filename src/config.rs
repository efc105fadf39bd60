// Guardian - Resource-health admission control
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Guardian configuration.
//!
//! Every field has a default, so a config file only needs to name what it
//! overrides.

use crate::error::{GuardianError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Master configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardianConfig {
    /// State machine thresholds.
    pub thresholds: Thresholds,
    /// Admission gate settings.
    pub gate: GateConfig,
}

impl GuardianConfig {
    /// Parse a JSON config document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check all sections for internally consistent values.
    pub fn validate(&self) -> Result<()> {
        self.thresholds.validate()?;
        self.gate.validate()
    }
}

/// Thresholds driving the resource state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Sustained RAM fraction that triggers a brownout.
    pub ram_soft: f64,
    /// Instantaneous RAM fraction that triggers an emergency.
    pub ram_hard: f64,
    /// Window RAM maximum below which recovery is possible.
    pub recover_ram: f64,
    /// Sustained CPU fraction that triggers a brownout; also the recovery ceiling.
    pub cpu_soft: f64,
    /// Temperature in °C at or above which an emergency is declared.
    pub temp_hard_c: f64,
    /// Battery percentage at or below which an emergency is declared.
    pub battery_hard_pct: f64,
    /// Number of samples per sliding window.
    pub window_size: usize,
    /// Minimum seconds in a degraded state before recovery.
    pub recovery_dwell_s: u64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            ram_soft: 0.80,
            ram_hard: 0.92,
            recover_ram: 0.70,
            cpu_soft: 0.80,
            temp_hard_c: 85.0,
            battery_hard_pct: 25.0,
            window_size: 5,
            recovery_dwell_s: 60,
        }
    }
}

impl Thresholds {
    /// Recovery dwell as a duration.
    pub fn recovery_dwell(&self) -> Duration {
        Duration::from_secs(self.recovery_dwell_s)
    }

    /// Validate ordering and ranges.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("ram_soft", self.ram_soft),
            ("ram_hard", self.ram_hard),
            ("recover_ram", self.recover_ram),
            ("cpu_soft", self.cpu_soft),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(GuardianError::InvalidConfig(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.ram_soft > self.ram_hard {
            return Err(GuardianError::InvalidConfig(format!(
                "ram_soft ({}) exceeds ram_hard ({})",
                self.ram_soft, self.ram_hard
            )));
        }
        if self.recover_ram > self.ram_soft {
            return Err(GuardianError::InvalidConfig(format!(
                "recover_ram ({}) exceeds ram_soft ({})",
                self.recover_ram, self.ram_soft
            )));
        }
        if !self.temp_hard_c.is_finite() || !self.battery_hard_pct.is_finite() {
            return Err(GuardianError::InvalidConfig(
                "temperature and battery limits must be finite".to_string(),
            ));
        }
        if self.window_size == 0 {
            return Err(GuardianError::InvalidConfig(
                "window_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Admission gate configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// How long a fetched snapshot is reused without re-polling.
    pub cache_ttl_ms: u64,
    /// Hard deadline for one health fetch, in seconds.
    pub fetch_timeout_s: f64,
    /// Consecutive fetch failures tolerated before failing closed.
    pub unknown_hysteresis_count: u32,
    /// Paths that always bypass the gate.
    pub bypass_paths: Vec<String>,
    /// Path prefixes that always bypass the gate.
    pub bypass_prefixes: Vec<String>,
    /// File extensions treated as static assets.
    pub static_extensions: Vec<String>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 250,
            fetch_timeout_s: 0.5,
            unknown_hysteresis_count: 3,
            bypass_paths: vec![
                "/health".to_string(),
                "/healthz".to_string(),
                "/ready".to_string(),
                "/status".to_string(),
                "/metrics".to_string(),
                "/favicon.ico".to_string(),
            ],
            bypass_prefixes: vec![
                "/guardian/".to_string(),
                "/health/".to_string(),
                "/static/".to_string(),
                "/assets/".to_string(),
            ],
            static_extensions: ["css", "js", "map", "png", "jpg", "jpeg", "gif", "svg", "ico", "woff", "woff2"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl GateConfig {
    /// Cache TTL as a duration.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    /// Fetch timeout as a duration.
    ///
    /// Only meaningful after [`GateConfig::validate`] has accepted the value.
    pub fn fetch_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.fetch_timeout_s).unwrap_or(Duration::from_millis(500))
    }

    /// Whether a request path skips admission entirely.
    pub fn is_bypassed(&self, path: &str) -> bool {
        if self.bypass_paths.iter().any(|p| p == path) {
            return true;
        }
        if self.bypass_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
            return true;
        }
        let last_segment = path.rsplit('/').next().unwrap_or(path);
        match last_segment.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => self
                .static_extensions
                .iter()
                .any(|e| e.eq_ignore_ascii_case(ext)),
            _ => false,
        }
    }

    /// Validate timing and hysteresis values.
    pub fn validate(&self) -> Result<()> {
        if !self.fetch_timeout_s.is_finite() || self.fetch_timeout_s <= 0.0 {
            return Err(GuardianError::InvalidConfig(format!(
                "fetch_timeout_s must be positive, got {}",
                self.fetch_timeout_s
            )));
        }
        if self.unknown_hysteresis_count == 0 {
            return Err(GuardianError::InvalidConfig(
                "unknown_hysteresis_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
