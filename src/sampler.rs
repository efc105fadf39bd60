// Guardian - Resource-health admission control
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Metric sampling contract.
//!
//! How readings are obtained from the host is up to the [`Sampler`]
//! implementation; Guardian only consumes the point readings.

use crate::error::SensorError;
use std::time::Instant;

/// One point reading, consumed once by the state machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    /// RAM usage fraction in [0, 1].
    pub ram_frac: f64,
    /// CPU usage fraction in [0, 1].
    pub cpu_frac: f64,
    /// Temperature in °C, when a sensor is present.
    pub temp_c: Option<f64>,
    /// Battery charge percentage, when running on battery.
    pub battery_pct: Option<f64>,
    /// When the reading was taken.
    pub at: Instant,
}

impl Sample {
    /// Create a sample with only RAM and CPU readings.
    pub fn new(ram_frac: f64, cpu_frac: f64, at: Instant) -> Self {
        Self {
            ram_frac: clamp_frac(ram_frac),
            cpu_frac: clamp_frac(cpu_frac),
            temp_c: None,
            battery_pct: None,
            at,
        }
    }

    /// Set the temperature reading
    pub fn with_temp(mut self, temp_c: f64) -> Self {
        self.temp_c = Some(temp_c).filter(|t| t.is_finite());
        self
    }

    /// Set the battery reading
    pub fn with_battery(mut self, battery_pct: f64) -> Self {
        self.battery_pct = Some(battery_pct).filter(|b| b.is_finite());
        self
    }
}

/// Clamp a usage fraction into [0, 1]. NaN reads as idle.
pub(crate) fn clamp_frac(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Raw result of one sampler pass. Each metric fails independently.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReadings {
    pub ram_frac: Result<f64, SensorError>,
    pub cpu_frac: Result<f64, SensorError>,
    pub temp_c: Result<f64, SensorError>,
    pub battery_pct: Result<f64, SensorError>,
}

impl SensorReadings {
    /// Readings with RAM and CPU only; temperature and battery unsupported.
    pub fn basic(ram_frac: f64, cpu_frac: f64) -> Self {
        Self {
            ram_frac: Ok(ram_frac),
            cpu_frac: Ok(cpu_frac),
            temp_c: Err(SensorError::Unsupported { metric: "temp_c" }),
            battery_pct: Err(SensorError::Unsupported {
                metric: "battery_pct",
            }),
        }
    }
}

/// Source of resource readings.
pub trait Sampler: Send {
    /// Take one reading of every metric.
    fn read(&mut self) -> SensorReadings;
}

impl<F> Sampler for F
where
    F: FnMut() -> SensorReadings + Send,
{
    fn read(&mut self) -> SensorReadings {
        self()
    }
}

/// Sampler returning the same configured readings on every pass.
#[derive(Debug, Clone)]
pub struct FixedSampler {
    readings: SensorReadings,
}

impl FixedSampler {
    /// Nominal host: idle RAM and CPU, no temperature or battery sensor.
    pub fn nominal() -> Self {
        Self::new(SensorReadings::basic(0.30, 0.20))
    }

    /// Create a sampler from explicit readings
    pub fn new(readings: SensorReadings) -> Self {
        Self { readings }
    }

    /// Replace the readings returned from now on
    pub fn set(&mut self, readings: SensorReadings) {
        self.readings = readings;
    }
}

impl Default for FixedSampler {
    fn default() -> Self {
        Self::nominal()
    }
}

impl Sampler for FixedSampler {
    fn read(&mut self) -> SensorReadings {
        self.readings.clone()
    }
}
