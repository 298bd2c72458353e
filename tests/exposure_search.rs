//! Exposure bracketing against a scripted sensor.
//!
//! The scripted camera encodes the exposure time of each frame in the frame
//! bytes, and the meter maps that exposure through a response curve, so each
//! test controls exactly what brightness every table index produces.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use lapsecam::camera::{
    CameraDevice, CameraError, CapturedFrame, Controls, DeviceSettings, FrameMetadata,
    StreamSession, StreamSettings,
};
use lapsecam::exposure::{
    BrightnessMeter, BrightnessTarget, ExposureSearch, ExposureStore, MeterError, SearchSettings,
    ShutterTable,
};
use tempfile::TempDir;

struct ScriptedCamera {
    exposure_us: u64,
    started: bool,
    stills: usize,
    failures: VecDeque<CameraError>,
}

impl ScriptedCamera {
    fn new() -> Self {
        Self {
            exposure_us: 0,
            started: false,
            stills: 0,
            failures: VecDeque::new(),
        }
    }

    fn failing_with(failures: Vec<CameraError>) -> Self {
        Self {
            failures: failures.into(),
            ..Self::new()
        }
    }
}

impl CameraDevice for ScriptedCamera {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn update_config(&mut self, _settings: &DeviceSettings) {}

    fn configure_still(&mut self) -> Result<(), CameraError> {
        Ok(())
    }

    fn set_controls(&mut self, controls: &Controls) -> Result<(), CameraError> {
        if let Some(us) = controls.exposure_time_us {
            self.exposure_us = us;
        }
        Ok(())
    }

    fn start(&mut self) -> Result<(), CameraError> {
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CameraError> {
        self.started = false;
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started
    }

    fn capture_still(&mut self) -> Result<CapturedFrame, CameraError> {
        if let Some(err) = self.failures.pop_front() {
            return Err(err);
        }
        self.stills += 1;
        Ok(CapturedFrame::new(
            self.exposure_us.to_le_bytes().to_vec(),
            FrameMetadata {
                exposure_time_us: Some(self.exposure_us),
                ..FrameMetadata::default()
            },
        ))
    }

    fn open_stream(
        &mut self,
        _settings: &StreamSettings,
    ) -> Result<Box<dyn StreamSession>, CameraError> {
        Err(CameraError::StreamFailed("not supported".to_string()))
    }

    fn close(&mut self) {}
}

/// Brightness as a function of exposure seconds.
struct ResponseMeter(fn(f64) -> f64);

impl BrightnessMeter for ResponseMeter {
    fn measure(&self, frame: &CapturedFrame) -> Result<f64, MeterError> {
        let bytes: [u8; 8] = frame.jpeg.as_slice().try_into().map_err(|_| MeterError::Empty)?;
        let secs = u64::from_le_bytes(bytes) as f64 / 1_000_000.0;
        Ok((self.0)(secs))
    }
}

fn settings() -> SearchSettings {
    SearchSettings {
        max_attempts: 30,
        settle: Duration::ZERO,
    }
}

fn search(dir: &TempDir, response: fn(f64) -> f64) -> ExposureSearch {
    ExposureSearch::new(
        ExposureStore::new(dir.path().join(".capture_info")),
        Arc::new(ResponseMeter(response)),
        settings(),
    )
}

fn indices(search: &ExposureSearch) -> Vec<usize> {
    search.attempts().iter().map(|a| a.index).collect()
}

#[test]
fn test_converges_by_stepping_up() {
    let dir = TempDir::new().unwrap();
    let mut search = search(&dir, |secs| 2.5 * secs);
    let mut camera = ScriptedCamera::new();
    let table = ShutterTable::default();

    let result = search
        .run(&mut camera, &table, &BrightnessTarget::default())
        .unwrap()
        .unwrap();
    assert!(result.converged);
    assert_eq!(result.index, 12);
    assert_eq!(result.brightness, 50.0);
    assert_eq!(indices(&search), [8, 9, 10, 11, 12]);
    assert_eq!(result.frame.metadata.exposure_time_us, Some(20_000_000));
    assert!(!camera.is_started());
}

#[test]
fn test_next_search_starts_from_stored_index() {
    let dir = TempDir::new().unwrap();
    let table = ShutterTable::default();
    let target = BrightnessTarget::default();
    {
        let mut first = search(&dir, |secs| 2.5 * secs);
        first.run(&mut ScriptedCamera::new(), &table, &target).unwrap();
    }

    assert_eq!(ExposureStore::new(dir.path().join(".capture_info")).load(), Some(12));
    let mut second = search(&dir, |secs| 2.5 * secs);
    assert_eq!(second.last_index(), Some(12));
    let mut camera = ScriptedCamera::new();
    let result = second.run(&mut camera, &table, &target).unwrap().unwrap();
    assert_eq!(result.index, 12);
    assert_eq!(camera.stills, 1);
}

#[test]
fn test_oscillation_picks_best_tried() {
    let dir = TempDir::new().unwrap();
    // jumps straight over the band between 10 s and 12 s
    let mut search = search(&dir, |secs| if secs <= 10.0 { 30.0 } else { 60.0 });
    let result = search
        .run(
            &mut ScriptedCamera::new(),
            &ShutterTable::default(),
            &BrightnessTarget::default(),
        )
        .unwrap()
        .unwrap();

    assert_eq!(indices(&search), [8, 9, 10]);
    assert!(!result.converged);
    assert_eq!(result.index, 10);
    assert_eq!(result.brightness, 60.0);
    assert_eq!(result.frame.metadata.exposure_time_us, Some(12_000_000));
    assert_eq!(search.last_index(), Some(10));
}

#[test]
fn test_too_bright_stops_at_shortest_exposure() {
    let dir = TempDir::new().unwrap();
    let mut search = search(&dir, |secs| 100.0 + secs);
    let result = search
        .run(
            &mut ScriptedCamera::new(),
            &ShutterTable::default(),
            &BrightnessTarget::default(),
        )
        .unwrap()
        .unwrap();
    assert_eq!(indices(&search), [8, 7, 6, 5, 4, 3, 2, 1, 0]);
    assert_eq!(result.index, 0);
    assert!(!result.converged);
}

#[test]
fn test_too_dark_stops_past_longest_exposure() {
    let dir = TempDir::new().unwrap();
    let mut search = search(&dir, |secs| secs / 2.0);
    let result = search
        .run(
            &mut ScriptedCamera::new(),
            &ShutterTable::default(),
            &BrightnessTarget::default(),
        )
        .unwrap()
        .unwrap();
    assert_eq!(search.attempts().len(), 8);
    assert_eq!(result.index, 15);
    assert_eq!(result.brightness, 30.0);
}

#[test]
fn test_no_frames_returns_none_and_persists_nothing() {
    let dir = TempDir::new().unwrap();
    let mut search = search(&dir, |secs| secs);
    let failures = (0..30).map(|_| CameraError::EmptyFrame).collect();
    let mut camera = ScriptedCamera::failing_with(failures);

    let result = search
        .run(&mut camera, &ShutterTable::default(), &BrightnessTarget::default())
        .unwrap();
    assert!(result.is_none());
    assert!(search.attempts().is_empty());
    assert_eq!(search.last_index(), None);
    assert!(!dir.path().join(".capture_info").exists());
}

#[test]
fn test_transient_errors_are_skipped() {
    let dir = TempDir::new().unwrap();
    let mut search = search(&dir, |secs| 2.5 * secs);
    let mut camera = ScriptedCamera::failing_with(vec![
        CameraError::EmptyFrame,
        CameraError::Undecodable("truncated".to_string()),
    ]);

    let result = search
        .run(&mut camera, &ShutterTable::default(), &BrightnessTarget::default())
        .unwrap()
        .unwrap();
    assert_eq!(result.index, 12);
    assert_eq!(result.attempts, 5);
}

#[test]
fn test_hardware_error_aborts_search() {
    let dir = TempDir::new().unwrap();
    let mut search = search(&dir, |secs| secs);
    let mut camera = ScriptedCamera::failing_with(vec![CameraError::Closed]);

    let err = search
        .run(&mut camera, &ShutterTable::default(), &BrightnessTarget::default())
        .unwrap_err();
    assert!(matches!(err, CameraError::Closed));
    assert!(!camera.is_started());
    assert_eq!(search.last_index(), None);
}

#[test]
fn test_stored_index_outside_table_is_clamped() {
    let dir = TempDir::new().unwrap();
    let store = ExposureStore::new(dir.path().join(".capture_info"));
    store.save(99).unwrap();

    let mut search = search(&dir, |secs| secs);
    assert_eq!(search.last_index(), Some(99));
    let result = search
        .run(
            &mut ScriptedCamera::new(),
            &ShutterTable::default(),
            &BrightnessTarget::default(),
        )
        .unwrap()
        .unwrap();
    assert_eq!(indices(&search), [15, 14]);
    assert_eq!(result.index, 14);
    assert_eq!(store.load(), Some(14));
}

#[test]
fn test_attempt_budget_is_respected() {
    let dir = TempDir::new().unwrap();
    let mut search = ExposureSearch::new(
        ExposureStore::new(dir.path().join(".capture_info")),
        Arc::new(ResponseMeter(|secs| secs / 2.0)),
        SearchSettings {
            max_attempts: 3,
            settle: Duration::ZERO,
        },
    );
    let result = search
        .run(
            &mut ScriptedCamera::new(),
            &ShutterTable::default(),
            &BrightnessTarget::default(),
        )
        .unwrap()
        .unwrap();
    assert_eq!(indices(&search), [8, 9, 10]);
    assert_eq!(result.index, 10);
    assert!(!result.converged);
}

#[test]
fn test_converges_from_every_start_index() {
    let table = ShutterTable::default();
    for start in 0..table.len() {
        let dir = TempDir::new().unwrap();
        ExposureStore::new(dir.path().join(".capture_info"))
            .save(start)
            .unwrap();
        let mut search = search(&dir, |secs| 2.5 * secs);
        let result = search
            .run(&mut ScriptedCamera::new(), &table, &BrightnessTarget::default())
            .unwrap()
            .unwrap();
        assert!(result.converged, "start {}", start);
        assert_eq!(result.index, 12, "start {}", start);
        assert!(search.attempts().len() <= table.len(), "start {}", start);
        assert_eq!(search.attempts()[0].index, start);
    }
}
