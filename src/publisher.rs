// Guardian - Resource-health admission control
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Health publisher
//!
//! Synchronous query surface over the state machine. Every [`query`]
//! takes a fresh reading, feeds it to the machine and returns the
//! resulting [`HealthReport`]. Sensor failures never escape: RAM and CPU
//! fall back to their last-known values, temperature and battery to absent.
//!
//! The sampler and machine sit behind one mutex, so concurrent callers are
//! serialized into a single writer.
//!
//! [`query`]: HealthPublisher::query

use crate::config::Thresholds;
use crate::error::SensorError;
use crate::report::HealthReport;
use crate::sampler::{clamp_frac, Sample, Sampler, SensorReadings};
use crate::state::{GuardianState, ResourceStateMachine};
use log::{debug, warn};
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

struct PublisherInner {
    sampler: Box<dyn Sampler>,
    machine: ResourceStateMachine,
    last_ram: Option<f64>,
    last_cpu: Option<f64>,
    last_sample: Option<Sample>,
}

/// Owner of the sampler and the resource state machine.
pub struct HealthPublisher {
    inner: Mutex<PublisherInner>,
}

impl fmt::Debug for HealthPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("HealthPublisher")
            .field("machine", &inner.machine)
            .field("last_sample", &inner.last_sample)
            .finish_non_exhaustive()
    }
}

impl HealthPublisher {
    /// Create a publisher with a fresh machine
    pub fn new(sampler: impl Sampler + 'static, thresholds: Thresholds) -> Self {
        Self::with_machine(sampler, ResourceStateMachine::new(thresholds))
    }

    /// Create a publisher around an existing machine
    pub fn with_machine(sampler: impl Sampler + 'static, machine: ResourceStateMachine) -> Self {
        Self::from_parts(Box::new(sampler), machine)
    }

    /// Create a publisher from a sampler chosen at runtime
    pub fn boxed(sampler: Box<dyn Sampler>, thresholds: Thresholds) -> Self {
        Self::from_parts(sampler, ResourceStateMachine::new(thresholds))
    }

    fn from_parts(sampler: Box<dyn Sampler>, machine: ResourceStateMachine) -> Self {
        Self {
            inner: Mutex::new(PublisherInner {
                sampler,
                machine,
                last_ram: None,
                last_cpu: None,
                last_sample: None,
            }),
        }
    }

    /// Sample now and report the updated state.
    pub fn query(&self) -> HealthReport {
        let mut inner = self.lock();
        let readings = inner.sampler.read();
        // Stamped after the read; waiting on the lock or a slow sensor must
        // not produce a sample dated in the past.
        Self::apply(&mut inner, readings, Instant::now())
    }

    /// Sample with an explicit timestamp and report the updated state.
    pub fn query_at(&self, now: Instant) -> HealthReport {
        let mut inner = self.lock();
        let readings = inner.sampler.read();
        Self::apply(&mut inner, readings, now)
    }

    fn apply(inner: &mut PublisherInner, readings: SensorReadings, now: Instant) -> HealthReport {
        let ram_frac = substitute_frac(readings.ram_frac, &mut inner.last_ram);
        let cpu_frac = substitute_frac(readings.cpu_frac, &mut inner.last_cpu);
        let sample = Sample {
            ram_frac,
            cpu_frac,
            temp_c: optional_reading(readings.temp_c),
            battery_pct: optional_reading(readings.battery_pct),
            at: now,
        };

        let state = inner.machine.sample_and_update(&sample);
        inner.last_sample = Some(sample);
        HealthReport::new(&state, Some(&sample), now)
    }

    /// Report the current state without taking a new reading.
    pub fn current(&self) -> HealthReport {
        let inner = self.lock();
        HealthReport::new(
            &inner.machine.state(),
            inner.last_sample.as_ref(),
            Instant::now(),
        )
    }

    /// Current state snapshot
    pub fn state(&self) -> GuardianState {
        self.lock().machine.state()
    }

    /// Operator override into LOCKDOWN
    pub fn force_lockdown(&self) -> HealthReport {
        let now = Instant::now();
        let mut inner = self.lock();
        let state = inner.machine.force_lockdown(now);
        HealthReport::new(&state, inner.last_sample.as_ref(), now)
    }

    /// Operator release from LOCKDOWN
    pub fn release_lockdown(&self) -> HealthReport {
        let now = Instant::now();
        let mut inner = self.lock();
        let state = inner.machine.release_lockdown(now);
        HealthReport::new(&state, inner.last_sample.as_ref(), now)
    }

    fn lock(&self) -> MutexGuard<'_, PublisherInner> {
        // The guarded values are replaced whole, never left half-written.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn substitute_frac(reading: Result<f64, SensorError>, last: &mut Option<f64>) -> f64 {
    match reading {
        Ok(value) => {
            let value = clamp_frac(value);
            *last = Some(value);
            value
        }
        Err(e) => {
            let fallback = last.unwrap_or(0.0);
            warn!("{}; using last-known value {}", e, fallback);
            fallback
        }
    }
}

fn optional_reading(reading: Result<f64, SensorError>) -> Option<f64> {
    match reading {
        Ok(value) if value.is_finite() => Some(value),
        Ok(value) => {
            warn!("discarding non-finite sensor reading {}", value);
            None
        }
        Err(e @ SensorError::Unsupported { .. }) => {
            debug!("{}", e);
            None
        }
        Err(e) => {
            warn!("{}; treating as absent", e);
            None
        }
    }
}
