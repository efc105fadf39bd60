// Guardian - Resource-health admission control
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Resource state machine
//!
//! Turns a stream of [`Sample`]s into a [`GuardianState`]. Rules are
//! evaluated on every sample in priority order:
//!
//! 1. Hard trigger: RAM at or above `ram_hard`, temperature at or above
//!    `temp_hard_c`, or battery at or below `battery_hard_pct`. Moves
//!    NORMAL/BROWNOUT to EMERGENCY. While a hard condition holds nothing
//!    else is evaluated, so recovery cannot fire mid-breach.
//! 2. Soft trigger: a full window of RAM or CPU at or above the soft limit
//!    moves NORMAL to BROWNOUT.
//! 3. Recovery: BROWNOUT/EMERGENCY return to NORMAL once both window maxima
//!    are under the recovery limits and the dwell time since the last
//!    transition has elapsed.
//!
//! LOCKDOWN is only entered and left by an operator.
//!
//! The machine is deterministic: the same ordered samples always produce
//! the same states. Time comes from the samples, never from the wall clock.

use crate::config::Thresholds;
use crate::error::GuardianError;
use crate::sampler::Sample;
use crate::window::SlidingWindow;
use log::info;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// Coarse operating state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResourceState {
    /// Within all limits
    #[default]
    Normal,
    /// Sustained pressure; still serving
    Brownout,
    /// Hard limit breached; new work is rejected
    Emergency,
    /// Operator-imposed shutdown
    Lockdown,
}

impl ResourceState {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::Brownout => "BROWNOUT",
            Self::Emergency => "EMERGENCY",
            Self::Lockdown => "LOCKDOWN",
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceState {
    type Err = GuardianError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NORMAL" => Ok(Self::Normal),
            "BROWNOUT" => Ok(Self::Brownout),
            "EMERGENCY" => Ok(Self::Emergency),
            "LOCKDOWN" => Ok(Self::Lockdown),
            _ => Err(GuardianError::UnrecognizedStatus(s.to_string())),
        }
    }
}

/// How much optional work the pipeline should shed
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum BrownoutLevel {
    /// Nothing shed
    #[default]
    None,
    /// Non-essential features disabled
    Light,
    /// Some features disabled
    Moderate,
    /// Only essential work
    Heavy,
}

impl BrownoutLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Light => "LIGHT",
            Self::Moderate => "MODERATE",
            Self::Heavy => "HEAVY",
        }
    }
}

impl fmt::Display for BrownoutLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the machine is in its current state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransitionReason {
    /// Initial state, no transition yet
    #[default]
    Startup,
    HardTrigger,
    SoftTrigger,
    Recover,
    OperatorLockdown,
    OperatorRelease,
}

impl TransitionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Startup => "STARTUP",
            Self::HardTrigger => "HARD_TRIGGER",
            Self::SoftTrigger => "SOFT_TRIGGER",
            Self::Recover => "RECOVER",
            Self::OperatorLockdown => "OPERATOR_LOCKDOWN",
            Self::OperatorRelease => "OPERATOR_RELEASE",
        }
    }
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable snapshot of the machine's state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardianState {
    pub state: ResourceState,
    pub brownout_level: BrownoutLevel,
    pub reason: TransitionReason,
    /// Time of the last transition
    pub since: Instant,
}

impl GuardianState {
    fn initial(at: Instant) -> Self {
        Self {
            state: ResourceState::Normal,
            brownout_level: BrownoutLevel::None,
            reason: TransitionReason::Startup,
            since: at,
        }
    }

    /// Time spent in the current state as of `now`
    pub fn time_in_state(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.since)
    }
}

/// Single-owner state machine over RAM/CPU windows and point sensors.
///
/// Not synchronized; wrap it in a mutex or give it a dedicated task when
/// more than one caller can sample.
#[derive(Debug, Clone)]
pub struct ResourceStateMachine {
    thresholds: Thresholds,
    ram_window: SlidingWindow,
    cpu_window: SlidingWindow,
    state: GuardianState,
}

impl ResourceStateMachine {
    /// Create a machine in NORMAL as of now
    pub fn new(thresholds: Thresholds) -> Self {
        Self::starting_at(thresholds, Instant::now())
    }

    /// Create a machine in NORMAL as of `at`
    pub fn starting_at(thresholds: Thresholds, at: Instant) -> Self {
        Self {
            ram_window: SlidingWindow::new(thresholds.window_size),
            cpu_window: SlidingWindow::new(thresholds.window_size),
            thresholds,
            state: GuardianState::initial(at),
        }
    }

    /// Feed one sample and return the resulting state.
    pub fn sample_and_update(&mut self, sample: &Sample) -> GuardianState {
        self.ram_window.push(sample.ram_frac);
        self.cpu_window.push(sample.cpu_frac);

        if self.hard_breach(sample) {
            if matches!(
                self.state.state,
                ResourceState::Normal | ResourceState::Brownout
            ) {
                self.transition(
                    ResourceState::Emergency,
                    BrownoutLevel::Heavy,
                    TransitionReason::HardTrigger,
                    sample.at,
                );
            }
            return self.state;
        }

        match self.state.state {
            ResourceState::Normal if self.soft_breach() => {
                self.transition(
                    ResourceState::Brownout,
                    BrownoutLevel::Light,
                    TransitionReason::SoftTrigger,
                    sample.at,
                );
            }
            ResourceState::Brownout | ResourceState::Emergency
                if self.recovery_ready(sample.at) =>
            {
                self.transition(
                    ResourceState::Normal,
                    BrownoutLevel::None,
                    TransitionReason::Recover,
                    sample.at,
                );
            }
            _ => {}
        }

        self.state
    }

    /// Current state without sampling
    pub fn state(&self) -> GuardianState {
        self.state
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn ram_window(&self) -> &SlidingWindow {
        &self.ram_window
    }

    pub fn cpu_window(&self) -> &SlidingWindow {
        &self.cpu_window
    }

    /// Enter LOCKDOWN regardless of readings. No-op if already locked down.
    pub fn force_lockdown(&mut self, at: Instant) -> GuardianState {
        if self.state.state != ResourceState::Lockdown {
            self.transition(
                ResourceState::Lockdown,
                BrownoutLevel::Heavy,
                TransitionReason::OperatorLockdown,
                at,
            );
        }
        self.state
    }

    /// Leave LOCKDOWN for NORMAL. Subsequent samples re-evaluate from there.
    pub fn release_lockdown(&mut self, at: Instant) -> GuardianState {
        if self.state.state == ResourceState::Lockdown {
            self.transition(
                ResourceState::Normal,
                BrownoutLevel::None,
                TransitionReason::OperatorRelease,
                at,
            );
        }
        self.state
    }

    fn hard_breach(&self, sample: &Sample) -> bool {
        let t = &self.thresholds;
        sample.ram_frac >= t.ram_hard
            || sample.temp_c.is_some_and(|c| c >= t.temp_hard_c)
            || sample.battery_pct.is_some_and(|b| b <= t.battery_hard_pct)
    }

    fn soft_breach(&self) -> bool {
        self.ram_window.all_at_least(self.thresholds.ram_soft)
            || self.cpu_window.all_at_least(self.thresholds.cpu_soft)
    }

    fn recovery_ready(&self, now: Instant) -> bool {
        let calm_ram = self
            .ram_window
            .max()
            .is_some_and(|m| m < self.thresholds.recover_ram);
        let calm_cpu = self
            .cpu_window
            .max()
            .is_some_and(|m| m < self.thresholds.cpu_soft);
        calm_ram
            && calm_cpu
            && self.state.time_in_state(now) >= self.thresholds.recovery_dwell()
    }

    fn transition(
        &mut self,
        to: ResourceState,
        level: BrownoutLevel,
        reason: TransitionReason,
        at: Instant,
    ) {
        info!(
            "guardian state {} -> {} (level={}, reason={})",
            self.state.state, to, level, reason
        );
        self.state = GuardianState {
            state: to,
            brownout_level: level,
            reason,
            since: at,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine(t0: Instant) -> ResourceStateMachine {
        ResourceStateMachine::starting_at(Thresholds::default(), t0)
    }

    fn at(t0: Instant, secs: u64) -> Instant {
        t0 + Duration::from_secs(secs)
    }

    #[test]
    fn test_initial_state() {
        let t0 = Instant::now();
        let m = machine(t0);
        let s = m.state();
        assert_eq!(s.state, ResourceState::Normal);
        assert_eq!(s.brownout_level, BrownoutLevel::None);
        assert_eq!(s.reason, TransitionReason::Startup);
        assert_eq!(s.since, t0);
    }

    #[test]
    fn test_soft_trigger_needs_full_window() {
        let t0 = Instant::now();
        let mut m = machine(t0);

        for i in 0..4 {
            let s = m.sample_and_update(&Sample::new(0.81, 0.1, at(t0, i)));
            assert_eq!(s.state, ResourceState::Normal);
        }

        let s = m.sample_and_update(&Sample::new(0.81, 0.1, at(t0, 4)));
        assert_eq!(s.state, ResourceState::Brownout);
        assert_eq!(s.brownout_level, BrownoutLevel::Light);
        assert_eq!(s.reason, TransitionReason::SoftTrigger);
        assert_eq!(s.since, at(t0, 4));
    }

    #[test]
    fn test_recovery_dwell_counts_from_transition() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        for i in 0..5 {
            m.sample_and_update(&Sample::new(0.81, 0.1, at(t0, i)));
        }
        assert_eq!(m.state().state, ResourceState::Brownout);

        // Below the soft limit but above the recovery limit for minutes.
        for i in 5..300 {
            let s = m.sample_and_update(&Sample::new(0.75, 0.1, at(t0, i)));
            assert_eq!(s.state, ResourceState::Brownout);
        }

        // The dwell has long elapsed, so recovery fires as soon as the
        // window is calm, without waiting another 60s of calm samples.
        for i in 300..304 {
            let s = m.sample_and_update(&Sample::new(0.40, 0.1, at(t0, i)));
            assert_eq!(s.state, ResourceState::Brownout);
        }
        let s = m.sample_and_update(&Sample::new(0.40, 0.1, at(t0, 304)));
        assert_eq!(s.state, ResourceState::Normal);
        assert_eq!(s.reason, TransitionReason::Recover);
        assert_eq!(s.since, at(t0, 304));
    }

    #[test]
    fn test_soft_trigger_on_cpu() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        let mut last = m.state();
        for i in 0..5 {
            last = m.sample_and_update(&Sample::new(0.2, 0.95, at(t0, i)));
        }
        assert_eq!(last.state, ResourceState::Brownout);
    }

    #[test]
    fn test_single_dip_breaks_soft_window() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        for (i, ram) in [0.85, 0.85, 0.79, 0.85, 0.85].iter().enumerate() {
            m.sample_and_update(&Sample::new(*ram, 0.1, at(t0, i as u64)));
        }
        assert_eq!(m.state().state, ResourceState::Normal);
    }

    #[test]
    fn test_hard_trigger_overrides_soft() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        for i in 0..4 {
            m.sample_and_update(&Sample::new(0.85, 0.1, at(t0, i)));
        }
        // Fifth sample completes the soft window but also breaches hard.
        let s = m.sample_and_update(&Sample::new(0.93, 0.1, at(t0, 4)));
        assert_eq!(s.state, ResourceState::Emergency);
        assert_eq!(s.brownout_level, BrownoutLevel::Heavy);
        assert_eq!(s.reason, TransitionReason::HardTrigger);
    }

    #[test]
    fn test_hard_trigger_from_brownout() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        for i in 0..5 {
            m.sample_and_update(&Sample::new(0.85, 0.1, at(t0, i)));
        }
        assert_eq!(m.state().state, ResourceState::Brownout);

        let s = m.sample_and_update(&Sample::new(0.95, 0.1, at(t0, 5)));
        assert_eq!(s.state, ResourceState::Emergency);
        assert_eq!(s.since, at(t0, 5));
    }

    #[test]
    fn test_temperature_and_battery_triggers() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        let s = m.sample_and_update(&Sample::new(0.3, 0.2, t0).with_temp(85.0));
        assert_eq!(s.state, ResourceState::Emergency);

        let mut m = machine(t0);
        let s = m.sample_and_update(&Sample::new(0.3, 0.2, t0).with_battery(25.0));
        assert_eq!(s.state, ResourceState::Emergency);

        let mut m = machine(t0);
        let s = m.sample_and_update(&Sample::new(0.3, 0.2, t0).with_battery(26.0).with_temp(84.9));
        assert_eq!(s.state, ResourceState::Normal);
    }

    #[test]
    fn test_absent_sensors_never_breach() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        for i in 0..10 {
            let s = m.sample_and_update(&Sample::new(0.3, 0.2, at(t0, i)));
            assert_eq!(s.state, ResourceState::Normal);
        }
    }

    #[test]
    fn test_no_op_keeps_since() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        m.sample_and_update(&Sample::new(0.95, 0.1, at(t0, 1)));
        let entered = m.state().since;

        // Repeated hard breach while already in EMERGENCY is a no-op.
        m.sample_and_update(&Sample::new(0.99, 0.1, at(t0, 2)));
        m.sample_and_update(&Sample::new(0.5, 0.1, at(t0, 3)));
        assert_eq!(m.state().since, entered);
        assert_eq!(m.state().time_in_state(at(t0, 11)), Duration::from_secs(10));
    }

    #[test]
    fn test_recovery_requires_dwell() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        m.sample_and_update(&Sample::new(0.95, 0.1, t0));
        assert_eq!(m.state().state, ResourceState::Emergency);

        for i in 1..=59 {
            let s = m.sample_and_update(&Sample::new(0.4, 0.1, at(t0, i)));
            assert_eq!(s.state, ResourceState::Emergency, "recovered early at {}s", i);
        }

        let s = m.sample_and_update(&Sample::new(0.4, 0.1, at(t0, 60)));
        assert_eq!(s.state, ResourceState::Normal);
        assert_eq!(s.brownout_level, BrownoutLevel::None);
        assert_eq!(s.reason, TransitionReason::Recover);
        assert_eq!(s.since, at(t0, 60));
    }

    #[test]
    fn test_recovery_requires_calm_window() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        for i in 0..5 {
            m.sample_and_update(&Sample::new(0.85, 0.1, at(t0, i)));
        }
        assert_eq!(m.state().state, ResourceState::Brownout);

        // Long after the dwell, but the window still holds a 0.85 reading.
        let s = m.sample_and_update(&Sample::new(0.5, 0.1, at(t0, 120)));
        assert_eq!(s.state, ResourceState::Brownout);

        for i in 121..124 {
            m.sample_and_update(&Sample::new(0.5, 0.1, at(t0, i)));
        }
        assert_eq!(m.state().state, ResourceState::Brownout);

        // Fifth calm reading flushes the last high one.
        let s = m.sample_and_update(&Sample::new(0.5, 0.1, at(t0, 124)));
        assert_eq!(s.state, ResourceState::Normal);
    }

    #[test]
    fn test_recovery_blocked_by_busy_cpu() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        m.sample_and_update(&Sample::new(0.95, 0.85, t0));
        for i in 1..100 {
            m.sample_and_update(&Sample::new(0.3, 0.85, at(t0, i)));
        }
        assert_eq!(m.state().state, ResourceState::Emergency);
    }

    #[test]
    fn test_hard_condition_blocks_recovery() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        m.sample_and_update(&Sample::new(0.3, 0.1, t0).with_temp(90.0));
        for i in 1..=120 {
            let s = m.sample_and_update(&Sample::new(0.3, 0.1, at(t0, i)).with_temp(90.0));
            assert_eq!(s.state, ResourceState::Emergency);
        }
        let s = m.sample_and_update(&Sample::new(0.3, 0.1, at(t0, 121)).with_temp(60.0));
        assert_eq!(s.state, ResourceState::Normal);
    }

    #[test]
    fn test_lockdown_is_operator_only() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        let s = m.force_lockdown(at(t0, 1));
        assert_eq!(s.state, ResourceState::Lockdown);
        assert_eq!(s.reason, TransitionReason::OperatorLockdown);

        // No sampled rule leaves LOCKDOWN.
        for i in 2..200 {
            m.sample_and_update(&Sample::new(0.1, 0.1, at(t0, i)));
        }
        m.sample_and_update(&Sample::new(0.99, 0.1, at(t0, 200)));
        assert_eq!(m.state().state, ResourceState::Lockdown);
        assert_eq!(m.state().since, at(t0, 1));

        let s = m.release_lockdown(at(t0, 201));
        assert_eq!(s.state, ResourceState::Normal);
        assert_eq!(s.reason, TransitionReason::OperatorRelease);
    }

    #[test]
    fn test_release_without_lockdown_is_noop() {
        let t0 = Instant::now();
        let mut m = machine(t0);
        let s = m.release_lockdown(at(t0, 5));
        assert_eq!(s.reason, TransitionReason::Startup);
        assert_eq!(s.since, t0);
    }

    #[test]
    fn test_deterministic_replay() {
        let t0 = Instant::now();
        let script: Vec<Sample> = (0..300u64)
            .map(|i| {
                let ram = 0.5 + 0.45 * ((i as f64) / 17.0).sin();
                Sample::new(ram, 0.3, at(t0, i))
            })
            .collect();

        let mut a = machine(t0);
        let mut b = machine(t0);
        for s in &script {
            assert_eq!(a.sample_and_update(s), b.sample_and_update(s));
        }
    }

    #[test]
    fn test_state_parsing() {
        assert_eq!("normal".parse::<ResourceState>().unwrap(), ResourceState::Normal);
        assert_eq!(
            " Lockdown ".parse::<ResourceState>().unwrap(),
            ResourceState::Lockdown
        );
        assert!(matches!(
            "melting".parse::<ResourceState>(),
            Err(GuardianError::UnrecognizedStatus(_))
        ));
    }

    #[test]
    fn test_brownout_level_ordering() {
        assert!(BrownoutLevel::None < BrownoutLevel::Light);
        assert!(BrownoutLevel::Light < BrownoutLevel::Moderate);
        assert!(BrownoutLevel::Moderate < BrownoutLevel::Heavy);
    }
}
