// Guardian Server - Prometheus metrics definitions
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Prometheus metrics for Guardian.
//!
//! Health gauges are refreshed whenever the health contract is served;
//! admission counters on every gated request.

use guardian::{HealthReport, ResourceState};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, CounterVec, Encoder, Gauge, TextEncoder,
};
use tracing::error;

lazy_static! {
    /// Resource state as a number.
    /// Values: 0 = Normal, 1 = Brownout, 2 = Emergency, 3 = Lockdown, -1 = unrecognized
    pub static ref GUARDIAN_STATE: Gauge = register_gauge!(
        "guardian_state",
        "Guardian resource state (0=Normal, 1=Brownout, 2=Emergency, 3=Lockdown)"
    ).unwrap();

    /// Seconds since the last state transition.
    pub static ref GUARDIAN_STATE_SECONDS: Gauge = register_gauge!(
        "guardian_state_seconds",
        "Seconds spent in the current Guardian state"
    ).unwrap();

    pub static ref GUARDIAN_RAM_PCT: Gauge = register_gauge!(
        "guardian_ram_pct",
        "Last sampled RAM usage in percent"
    ).unwrap();

    pub static ref GUARDIAN_CPU_PCT: Gauge = register_gauge!(
        "guardian_cpu_pct",
        "Last sampled CPU usage in percent"
    ).unwrap();

    /// Admission outcomes (labeled allow, allow_degraded, block, bypass).
    pub static ref ADMISSION_TOTAL: CounterVec = register_counter_vec!(
        "guardian_admission_total",
        "Admission decisions by outcome",
        &["outcome"]
    ).unwrap();

    /// Consecutive failed health fetches as seen by the gate.
    pub static ref UNKNOWN_STREAK: Gauge = register_gauge!(
        "guardian_unknown_streak",
        "Consecutive failed health fetches"
    ).unwrap();
}

/// Numeric code of a wire state name.
pub fn state_code(state: &str) -> f64 {
    match state.parse::<ResourceState>() {
        Ok(ResourceState::Normal) => 0.0,
        Ok(ResourceState::Brownout) => 1.0,
        Ok(ResourceState::Emergency) => 2.0,
        Ok(ResourceState::Lockdown) => 3.0,
        Err(_) => -1.0,
    }
}

/// Update the health gauges from a served report.
pub fn update_health_metrics(report: &HealthReport) {
    GUARDIAN_STATE.set(state_code(&report.state));
    GUARDIAN_STATE_SECONDS.set(report.since_s);
    GUARDIAN_RAM_PCT.set(report.ram_pct);
    GUARDIAN_CPU_PCT.set(report.cpu_pct);
}

/// Count one admission decision.
pub fn record_admission(outcome: &str, unknown_streak: u32) {
    ADMISSION_TOTAL.with_label_values(&[outcome]).inc();
    UNKNOWN_STREAK.set(unknown_streak as f64);
}

/// Encode all metrics in Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
