//! Status publishing and the diagnostics snapshot.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::day_period::DayPeriod;

/// Receives human-readable status strings ("Capturing Image", "Idle", ...).
pub trait DiagnosticsPublisher: Send + Sync {
    fn publish(&self, status: &str);

    /// Record a finished capture. Publishers that only care about status
    /// strings can ignore it.
    fn record_capture(&self, _period: DayPeriod, _shot_counter: u32) {}
}

/// Host health figures, when the platform exposes them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HardwareStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_average: Option<[f64; 3]>,
}

impl HardwareStats {
    pub fn read() -> Self {
        Self {
            cpu_temperature: read_cpu_temperature(Path::new("/sys/class/thermal/thermal_zone0/temp")),
            load_average: read_load_average(Path::new("/proc/loadavg")),
        }
    }
}

/// Millidegrees in `path` as degrees Celsius.
pub fn read_cpu_temperature(path: &Path) -> Option<f64> {
    let raw = std::fs::read_to_string(path).ok()?;
    raw.trim().parse::<f64>().ok().map(|m| m / 1000.0)
}

/// First three fields of `/proc/loadavg`.
pub fn read_load_average(path: &Path) -> Option<[f64; 3]> {
    let raw = std::fs::read_to_string(path).ok()?;
    let mut fields = raw.split_whitespace().map(|f| f.parse::<f64>().ok());
    Some([fields.next()??, fields.next()??, fields.next()??])
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub device_id: String,
    pub status: String,
    pub updated_at: DateTime<Local>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_capture: Option<DateTime<Local>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_period: Option<DayPeriod>,
    pub shot_counter: u32,
    #[serde(flatten)]
    pub hardware: HardwareStats,
}

/// Keeps the last published status and mirrors it to an optional JSON file.
pub struct StatusBoard {
    state: Mutex<Diagnostics>,
    status_file: Option<PathBuf>,
}

impl StatusBoard {
    pub fn new(device_id: impl Into<String>, status_file: Option<PathBuf>) -> Self {
        Self {
            state: Mutex::new(Diagnostics {
                device_id: device_id.into(),
                status: "Starting".to_string(),
                updated_at: Local::now(),
                last_capture: None,
                last_period: None,
                shot_counter: 0,
                hardware: HardwareStats::default(),
            }),
            status_file,
        }
    }

    /// Last published status string.
    pub fn status(&self) -> String {
        self.lock().status.clone()
    }

    pub fn snapshot(&self) -> Diagnostics {
        self.lock().clone()
    }

    /// Refresh hardware figures and log a one-line summary.
    pub fn publish_diagnostics(&self) -> Diagnostics {
        let snapshot = {
            let mut state = self.lock();
            state.hardware = HardwareStats::read();
            state.updated_at = Local::now();
            state.clone()
        };
        log::info!(
            "Diagnostics: status={} shots={} temp={} load={}",
            snapshot.status,
            snapshot.shot_counter,
            snapshot
                .hardware
                .cpu_temperature
                .map(|t| format!("{:.1}C", t))
                .unwrap_or_else(|| "n/a".to_string()),
            snapshot
                .hardware
                .load_average
                .map(|l| format!("{:.2}", l[0]))
                .unwrap_or_else(|| "n/a".to_string()),
        );
        self.write_file(&snapshot);
        snapshot
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Diagnostics> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_file(&self, snapshot: &Diagnostics) {
        let Some(path) = &self.status_file else {
            return;
        };
        let result = serde_json::to_vec_pretty(snapshot)
            .map_err(std::io::Error::other)
            .and_then(|json| std::fs::write(path, json));
        if let Err(e) = result {
            log::warn!("Failed to write status file {}: {}", path.display(), e);
        }
    }
}

impl DiagnosticsPublisher for StatusBoard {
    fn publish(&self, status: &str) {
        let snapshot = {
            let mut state = self.lock();
            state.status = status.to_string();
            state.updated_at = Local::now();
            state.clone()
        };
        log::debug!("Status: {}", status);
        self.write_file(&snapshot);
    }

    fn record_capture(&self, period: DayPeriod, shot_counter: u32) {
        let mut state = self.lock();
        state.last_capture = Some(Local::now());
        state.last_period = Some(period);
        state.shot_counter = shot_counter;
    }
}
