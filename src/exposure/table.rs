//! Shutter-speed table and brightness band.

use serde::{Deserialize, Serialize};

/// Exposure table used when none is configured, in seconds.
pub const DEFAULT_SHUTTER_SPEEDS: [f64; 16] = [
    0.125, 0.25, 0.5, 0.75, 1.0, 2.0, 4.0, 6.0, 8.0, 10.0, 12.0, 15.0, 20.0, 30.0, 45.0, 60.0,
];

/// Errors raised when validating exposure configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExposureError {
    #[error("shutter table is empty")]
    EmptyTable,
    #[error("shutter speed at index {index} must be positive, got {value}")]
    NonPositive { index: usize, value: f64 },
    #[error("shutter speeds must be strictly increasing (index {index})")]
    NotIncreasing { index: usize },
    #[error("brightness target min {min} is above max {max}")]
    InvertedTarget { min: f64, max: f64 },
}

/// Ordered, strictly increasing exposure durations.
#[derive(Debug, Clone, PartialEq)]
pub struct ShutterTable {
    speeds: Vec<f64>,
}

impl ShutterTable {
    pub fn new(speeds: Vec<f64>) -> Result<Self, ExposureError> {
        if speeds.is_empty() {
            return Err(ExposureError::EmptyTable);
        }
        for (index, &value) in speeds.iter().enumerate() {
            if !(value > 0.0) {
                return Err(ExposureError::NonPositive { index, value });
            }
            if index > 0 && value <= speeds[index - 1] {
                return Err(ExposureError::NotIncreasing { index });
            }
        }
        Ok(Self { speeds })
    }

    pub fn len(&self) -> usize {
        self.speeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.speeds.is_empty()
    }

    /// Duration in seconds at `index`.
    pub fn get(&self, index: usize) -> Option<f64> {
        self.speeds.get(index).copied()
    }

    /// Duration at `index` in whole microseconds.
    pub fn exposure_us(&self, index: usize) -> Option<u64> {
        self.get(index).map(|secs| (secs * 1_000_000.0).round() as u64)
    }

    /// Starting point for a search without history.
    pub fn midpoint(&self) -> usize {
        self.speeds.len() / 2
    }

    pub fn last_index(&self) -> usize {
        self.speeds.len() - 1
    }

    /// Index to start a search from, given the persisted one.
    pub fn resolve_start(&self, last_known: Option<usize>) -> usize {
        match last_known {
            None => self.midpoint(),
            Some(index) if index < self.speeds.len() => index,
            Some(index) => {
                log::warn!(
                    "Stored exposure index {} is outside the table (0..{}), using {}",
                    index,
                    self.speeds.len(),
                    self.last_index()
                );
                self.last_index()
            }
        }
    }

    pub fn speeds(&self) -> &[f64] {
        &self.speeds
    }
}

impl Default for ShutterTable {
    fn default() -> Self {
        Self {
            speeds: DEFAULT_SHUTTER_SPEEDS.to_vec(),
        }
    }
}

/// Acceptable mean-brightness band, inclusive at both ends.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BrightnessTarget {
    pub min: f64,
    pub max: f64,
}

impl BrightnessTarget {
    pub fn new(min: f64, max: f64) -> Result<Self, ExposureError> {
        if min > max {
            return Err(ExposureError::InvertedTarget { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn contains(&self, brightness: f64) -> bool {
        brightness >= self.min && brightness <= self.max
    }

    pub fn midpoint(&self) -> f64 {
        (self.min + self.max) / 2.0
    }
}

impl Default for BrightnessTarget {
    fn default() -> Self {
        Self {
            min: 40.0,
            max: 55.0,
        }
    }
}
