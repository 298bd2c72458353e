//! Adaptive exposure bracketing.
//!
//! Walks the shutter table one step at a time from the last index that
//! worked, towards longer exposures when the frame is too dark and shorter
//! ones when it is too bright, until a frame lands inside the brightness
//! band. A search that never converges falls back to the attempt closest to
//! the middle of the band. Revisiting an index means the scene sits between
//! two table entries, so the search stops there.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::camera::{CameraDevice, CameraError, CapturedFrame, Controls};

use super::meter::BrightnessMeter;
use super::store::ExposureStore;
use super::table::{BrightnessTarget, ShutterTable};

/// Attempts before a search gives up and falls back.
pub const DEFAULT_MAX_ATTEMPTS: usize = 30;
/// Wait between starting the sensor and grabbing the frame.
pub const DEFAULT_SETTLE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct SearchSettings {
    pub max_attempts: usize,
    pub settle: Duration,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            settle: DEFAULT_SETTLE,
        }
    }
}

/// One measured frame of a search, in the order it was taken.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attempt {
    pub index: usize,
    pub brightness: f64,
}

/// Outcome of a search that produced a frame.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub index: usize,
    pub brightness: f64,
    pub frame: CapturedFrame,
    /// Frames measured, not counting skipped ones.
    pub attempts: usize,
    /// Whether the frame is inside the band or only the closest one tried.
    pub converged: bool,
}

/// Position in `attempts` whose brightness is nearest the band midpoint.
///
/// On ties the earliest attempt wins.
pub fn pick_closest(attempts: &[Attempt], target: &BrightnessTarget) -> Option<usize> {
    let mid = target.midpoint();
    let mut best: Option<(usize, f64)> = None;
    for (pos, attempt) in attempts.iter().enumerate() {
        let distance = (attempt.brightness - mid).abs();
        match best {
            Some((_, d)) if distance >= d => {}
            _ => best = Some((pos, distance)),
        }
    }
    best.map(|(pos, _)| pos)
}

/// Exposure state: the last index that produced a usable frame plus the log
/// of the most recent search.
pub struct ExposureSearch {
    store: ExposureStore,
    meter: Arc<dyn BrightnessMeter>,
    settings: SearchSettings,
    last_index: Option<usize>,
    attempts: Vec<Attempt>,
}

impl ExposureSearch {
    /// Build the search, seeding the last index from `store`.
    pub fn new(
        store: ExposureStore,
        meter: Arc<dyn BrightnessMeter>,
        settings: SearchSettings,
    ) -> Self {
        let last_index = store.load();
        match last_index {
            Some(index) => log::info!("Loaded exposure index {} from {}", index, store.path().display()),
            None => log::info!("No stored exposure index, starting mid-table"),
        }
        Self {
            store,
            meter,
            settings,
            last_index,
            attempts: Vec::new(),
        }
    }

    pub fn last_index(&self) -> Option<usize> {
        self.last_index
    }

    /// Attempts of the most recent search.
    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    pub fn settings(&self) -> SearchSettings {
        self.settings
    }

    pub fn set_settings(&mut self, settings: SearchSettings) {
        self.settings = settings;
    }

    /// Run one search.
    ///
    /// `Ok(None)` means no attempt produced a measurable frame; the stored
    /// index is left alone in that case. Hardware failures stop the device
    /// and are returned as errors.
    pub fn run(
        &mut self,
        device: &mut dyn CameraDevice,
        table: &ShutterTable,
        target: &BrightnessTarget,
    ) -> Result<Option<SearchResult>, CameraError> {
        self.attempts.clear();
        let mut frames: Vec<CapturedFrame> = Vec::new();
        let mut index = table.resolve_start(self.last_index);

        log::info!(
            "Exposure search from index {} ({}s), target {}-{}",
            index,
            table.get(index).unwrap_or_default(),
            target.min,
            target.max
        );
        device.set_controls(&Controls::manual_exposure())?;

        for attempt in 0..self.settings.max_attempts {
            let Some(exposure_us) = table.exposure_us(index) else {
                log::info!("Exposure index {} is past the end of the table", index);
                break;
            };
            if self.attempts.iter().any(|a| a.index == index) {
                log::info!("Exposure index {} already tried, stopping search", index);
                break;
            }

            let frame = match self.expose(device, exposure_us) {
                Ok(frame) => frame,
                Err(e) if e.is_transient() => {
                    log::warn!("Attempt {} at index {} failed: {}", attempt + 1, index, e);
                    continue;
                }
                Err(e) => {
                    let _ = device.stop();
                    return Err(e);
                }
            };
            let brightness = match self.meter.measure(&frame) {
                Ok(b) => b,
                Err(e) => {
                    log::warn!("Could not measure attempt {} at index {}: {}", attempt + 1, index, e);
                    continue;
                }
            };
            log::info!(
                "Attempt {}: index {} ({:.3}s) brightness {:.1}",
                attempt + 1,
                index,
                exposure_us as f64 / 1_000_000.0,
                brightness
            );

            self.attempts.push(Attempt { index, brightness });

            if target.contains(brightness) {
                self.commit(index);
                return Ok(Some(SearchResult {
                    index,
                    brightness,
                    frame,
                    attempts: self.attempts.len(),
                    converged: true,
                }));
            }
            frames.push(frame);

            if brightness < target.min {
                index += 1;
            } else if index == 0 {
                log::info!("Frame too bright at the shortest exposure");
                break;
            } else {
                index -= 1;
            }
        }

        let Some(pos) = pick_closest(&self.attempts, target) else {
            log::warn!("Exposure search produced no usable frame");
            return Ok(None);
        };
        let best = self.attempts[pos];
        log::info!(
            "No exposure inside target, using closest: index {} brightness {:.1}",
            best.index,
            best.brightness
        );
        self.commit(best.index);
        Ok(Some(SearchResult {
            index: best.index,
            brightness: best.brightness,
            frame: frames.swap_remove(pos),
            attempts: self.attempts.len(),
            converged: false,
        }))
    }

    fn expose(
        &self,
        device: &mut dyn CameraDevice,
        exposure_us: u64,
    ) -> Result<CapturedFrame, CameraError> {
        device.set_controls(&Controls::default().with_exposure_time(exposure_us))?;
        device.start()?;
        thread::sleep(self.settings.settle);
        let frame = device.capture_still();
        let stopped = device.stop();
        let frame = frame?;
        stopped?;
        if frame.is_empty() {
            return Err(CameraError::EmptyFrame);
        }
        Ok(frame)
    }

    fn commit(&mut self, index: usize) {
        self.last_index = Some(index);
        if let Err(e) = self.store.save(index) {
            log::error!("Failed to persist exposure index {}: {}", index, e);
        }
    }
}
