// Guardian Server - Reading replay
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Replay of recorded resource readings.
//!
//! Feeds a CSV recording through the publisher one row per sample, so a
//! load scenario can be rehearsed against a running gate. Expected layout:
//!
//! ```text
//! ram_frac,cpu_frac,temp_c,battery_pct
//! 0.42,0.10,61.5,
//! 0.81,0.35,,
//! ```
//!
//! `ram_frac` and `cpu_frac` are required columns; `temp_c` and
//! `battery_pct` are optional. An empty cell reads as a failed sensor.

use guardian::{Sampler, SensorError, SensorReadings};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// One recorded row. `None` means the cell was empty.
#[derive(Debug, Clone, PartialEq)]
struct ReplayRow {
    ram_frac: Option<f64>,
    cpu_frac: Option<f64>,
    temp_c: Option<f64>,
    battery_pct: Option<f64>,
}

/// Sampler replaying a CSV recording.
#[derive(Debug)]
pub struct ReplaySampler {
    rows: Vec<ReplayRow>,
    position: usize,
    loop_replay: bool,
    has_temp: bool,
    has_battery: bool,
}

impl ReplaySampler {
    /// Load a recording from disk.
    pub fn from_csv(path: impl AsRef<Path>, loop_replay: bool) -> Result<Self, ReplayError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ReplayError::FileNotFound(path.display().to_string()));
        }
        let reader = csv::Reader::from_path(path)?;
        let sampler = Self::from_reader(reader, loop_replay)?;
        info!(
            "Loaded replay: {} rows from {} (loop={})",
            sampler.rows.len(),
            path.display(),
            loop_replay
        );
        Ok(sampler)
    }

    fn from_reader<R: std::io::Read>(
        mut reader: csv::Reader<R>,
        loop_replay: bool,
    ) -> Result<Self, ReplayError> {
        let headers = reader.headers()?.clone();
        let column = |name: &str| headers.iter().position(|h| h.trim() == name);

        let ram_col = column("ram_frac")
            .ok_or_else(|| ReplayError::InvalidFormat("missing 'ram_frac' column".to_string()))?;
        let cpu_col = column("cpu_frac")
            .ok_or_else(|| ReplayError::InvalidFormat("missing 'cpu_frac' column".to_string()))?;
        let temp_col = column("temp_c");
        let battery_col = column("battery_pct");

        let mut rows = Vec::new();
        for (line, result) in reader.records().enumerate() {
            let record = result?;
            let cell = |col: Option<usize>| -> Result<Option<f64>, ReplayError> {
                match col.and_then(|c| record.get(c)).map(str::trim) {
                    None | Some("") => Ok(None),
                    Some(s) => s.parse().map(Some).map_err(|_| {
                        ReplayError::InvalidFormat(format!("row {}: invalid number '{}'", line + 1, s))
                    }),
                }
            };
            rows.push(ReplayRow {
                ram_frac: cell(Some(ram_col))?,
                cpu_frac: cell(Some(cpu_col))?,
                temp_c: cell(temp_col)?,
                battery_pct: cell(battery_col)?,
            });
        }

        if rows.is_empty() {
            return Err(ReplayError::EmptyDataset);
        }

        Ok(Self {
            rows,
            position: 0,
            loop_replay,
            has_temp: temp_col.is_some(),
            has_battery: battery_col.is_some(),
        })
    }

    /// Index of the next row to be read.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn reading(
    value: Option<f64>,
    column_present: bool,
    metric: &'static str,
) -> Result<f64, SensorError> {
    match value {
        Some(v) => Ok(v),
        None if column_present => Err(SensorError::Unavailable { metric }),
        None => Err(SensorError::Unsupported { metric }),
    }
}

impl Sampler for ReplaySampler {
    fn read(&mut self) -> SensorReadings {
        let row = &self.rows[self.position];
        let readings = SensorReadings {
            ram_frac: reading(row.ram_frac, true, "ram_frac"),
            cpu_frac: reading(row.cpu_frac, true, "cpu_frac"),
            temp_c: reading(row.temp_c, self.has_temp, "temp_c"),
            battery_pct: reading(row.battery_pct, self.has_battery, "battery_pct"),
        };

        if self.position + 1 < self.rows.len() {
            self.position += 1;
        } else if self.loop_replay {
            debug!("Replay complete, looping");
            self.position = 0;
        }
        // Without looping the last row repeats.

        readings
    }
}

/// Errors loading a replay file.
#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Empty dataset")]
    EmptyDataset,
}
