//! Configuration file handling for lapsecam.
//!
//! Loads configuration from `~/.config/lapsecam/config.toml` or a custom path.
//! [`ConfigStore`] keeps the live copy and re-reads the file on demand.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::NaiveTime;

use crate::camera::{
    BackendOptions, CameraBackend, Controls, DayControls, DeviceSettings, FakeSettings, RpicamSettings,
    StreamSettings, Transform,
};
use crate::day_period::{DailySchedule, DayPeriod, DayPeriodOracle, FixedPeriod};
use crate::exposure::{
    BrightnessTarget, ExposureError, SearchSettings, ShutterTable, DEFAULT_SHUTTER_SPEEDS,
    DEFAULT_STATE_FILE,
};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "LAPSECAM_CONFIG";
/// Environment variable overriding `device.id`.
pub const DEVICE_ID_ENV: &str = "DEVICE_ID";

/// Configuration file structure for lapsecam.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub camera: CameraConfig,
    pub stream: StreamConfig,
    pub annotation: AnnotationConfig,
    pub overlays: Vec<OverlayConfig>,
    pub upload: UploadConfig,
    pub day_period: DayPeriodConfig,
    pub diagnostics: DiagnosticsConfig,
    pub focus: FocusConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub id: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: "lapsecam".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub backend: CameraBackend,
    pub hflip: bool,
    pub vflip: bool,
    pub still_width: Option<u32>,
    pub still_height: Option<u32>,
    /// Seconds between scheduled captures.
    pub shot_interval_secs: u64,
    /// Captures between camera hard resets; 0 disables them.
    pub hard_reset_interval: u32,
    pub shutter_speeds: Vec<f64>,
    pub max_attempts: usize,
    pub settle_secs: f64,
    pub teardown_secs: f64,
    pub state_file: PathBuf,
    pub latest_image: PathBuf,
    pub archive: bool,
    pub archive_dir: PathBuf,
    pub unsharp_mask: bool,
    pub crop: CropConfig,
    pub privacy_mask_file: Option<PathBuf>,
    pub fake: FakeConfig,
    pub rpicam: RpicamConfig,
    /// Keyed by period name (`dawn`, `day`, `dusk`, `night`).
    pub periods: BTreeMap<String, PeriodConfig>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            backend: CameraBackend::Fake,
            hflip: false,
            vflip: false,
            still_width: None,
            still_height: None,
            shot_interval_secs: 300,
            hard_reset_interval: 0,
            shutter_speeds: DEFAULT_SHUTTER_SPEEDS.to_vec(),
            max_attempts: 30,
            settle_secs: 2.0,
            teardown_secs: 2.0,
            state_file: PathBuf::from(DEFAULT_STATE_FILE),
            latest_image: PathBuf::from("latest.jpg"),
            archive: false,
            archive_dir: PathBuf::from("images"),
            unsharp_mask: false,
            crop: CropConfig::default(),
            privacy_mask_file: None,
            fake: FakeConfig::default(),
            rpicam: RpicamConfig::default(),
            periods: BTreeMap::new(),
        }
    }
}

/// Per-period still settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeriodConfig {
    pub brightness_min: f64,
    pub brightness_max: f64,
    pub awb_mode: i32,
    pub metering_mode: i32,
    pub hdr_mode: i32,
    pub noise_reduction_mode: i32,
    pub sharpness: f32,
}

impl Default for PeriodConfig {
    fn default() -> Self {
        let target = BrightnessTarget::default();
        let day = DayControls::default();
        Self {
            brightness_min: target.min,
            brightness_max: target.max,
            awb_mode: day.awb_mode,
            metering_mode: day.metering_mode,
            hdr_mode: day.hdr_mode,
            noise_reduction_mode: day.noise_reduction_mode,
            sharpness: day.sharpness,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CropConfig {
    pub enabled: bool,
    pub width: u32,
    pub height: u32,
    pub x_offset: i32,
    pub y_offset: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FakeConfig {
    pub width: u32,
    pub height: u32,
    pub scene_brightness: f64,
}

impl Default for FakeConfig {
    fn default() -> Self {
        let fake = FakeSettings::default();
        Self {
            width: fake.width,
            height: fake.height,
            scene_brightness: fake.scene_brightness,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpicamConfig {
    pub still_program: String,
    pub video_program: String,
    pub ffmpeg_program: String,
    pub capture_timeout_ms: u64,
    pub quality: u8,
}

impl Default for RpicamConfig {
    fn default() -> Self {
        let rpicam = RpicamSettings::default();
        Self {
            still_program: rpicam.still_program,
            video_program: rpicam.video_program,
            ffmpeg_program: rpicam.ffmpeg_program,
            capture_timeout_ms: rpicam.capture_timeout_ms,
            quality: rpicam.quality,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub enabled: bool,
    pub youtube_key: Option<String>,
    pub width: u32,
    pub height: u32,
    pub bitrate: String,
    pub bufsize: String,
    /// Keyed by period name.
    pub periods: BTreeMap<String, StreamPeriodConfig>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            youtube_key: None,
            width: 1280,
            height: 720,
            bitrate: "4500k".to_string(),
            bufsize: "9000k".to_string(),
            periods: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamPeriodConfig {
    pub enabled: bool,
    pub framerate: u32,
    pub exposure_value: Option<f32>,
    pub analogue_gain: Option<f32>,
}

impl Default for StreamPeriodConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            framerate: 10,
            exposure_value: None,
            analogue_gain: None,
        }
    }
}

/// RGBA color, 0-255 per channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotationConfig {
    pub text: String,
    pub datetime_format: String,
    pub font_path: Option<PathBuf>,
    pub font_size: u32,
    pub offset: u32,
    pub text_color: Rgba,
    pub bar_color: Rgba,
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            text: "{device}".to_string(),
            datetime_format: "%Y-%m-%d %H:%M:%S".to_string(),
            font_path: None,
            font_size: 24,
            offset: 8,
            text_color: Rgba {
                r: 255,
                g: 255,
                b: 255,
                a: 255,
            },
            bar_color: Rgba {
                r: 0,
                g: 0,
                b: 0,
                a: 128,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub name: String,
    pub enabled: bool,
    /// Local path or http(s) URL.
    pub source: String,
    /// Percent of the original size.
    pub scale: u32,
    pub x: i64,
    pub y: i64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            source: String::new(),
            scale: 100,
            x: 0,
            y: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub enabled: bool,
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            username: None,
            password: None,
            timeout_secs: 30,
        }
    }
}

/// Where the day period comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DayPeriodConfig {
    /// Pin the period instead of following the schedule.
    pub fixed: Option<DayPeriod>,
    pub dawn: String,
    pub sunrise: String,
    pub sunset: String,
    pub dusk: String,
}

impl Default for DayPeriodConfig {
    fn default() -> Self {
        Self {
            fixed: None,
            dawn: "06:00".to_string(),
            sunrise: "06:30".to_string(),
            sunset: "19:30".to_string(),
            dusk: "20:00".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub interval_secs: u64,
    pub status_file: Option<PathBuf>,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            status_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FocusConfig {
    pub preview_path: PathBuf,
    pub frame_interval_ms: u64,
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            preview_path: PathBuf::from("focus.jpg"),
            frame_interval_ms: 500,
        }
    }
}

impl Config {
    /// Load configuration from a file path.
    /// Returns default config if the file doesn't exist.
    /// Returns an error if the file exists but cannot be parsed or is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(PathBuf::from).unwrap_or_else(default_path);

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::IoError {
                path: path.clone(),
                source: e,
            })?;
            Self::parse(&content).map_err(|e| match e {
                ConfigError::ParseError { source, .. } => ConfigError::ParseError {
                    path: path.clone(),
                    source,
                },
                other => other,
            })?
        } else {
            log::info!("No config file at {}, using defaults", path.display());
            Config::default()
        };

        if let Ok(id) = std::env::var(DEVICE_ID_ENV) {
            if !id.is_empty() {
                config.device.id = id;
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML text without touching the environment.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError {
            path: PathBuf::new(),
            source: e,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shutter_table()?;
        for period in DayPeriod::KNOWN {
            self.brightness_target(period)?;
        }
        if self.day_period.fixed.is_none() {
            self.schedule()?;
        }
        if self.upload.enabled && self.upload.url.is_empty() {
            return Err(ConfigError::Invalid("upload.url is required when upload is enabled".to_string()));
        }
        Ok(())
    }

    pub fn shutter_table(&self) -> Result<ShutterTable, ConfigError> {
        ShutterTable::new(self.camera.shutter_speeds.clone()).map_err(ConfigError::Exposure)
    }

    fn period(&self, period: DayPeriod) -> PeriodConfig {
        self.camera.periods.get(period.as_str()).cloned().unwrap_or_default()
    }

    pub fn brightness_target(&self, period: DayPeriod) -> Result<BrightnessTarget, ConfigError> {
        let p = self.period(period);
        BrightnessTarget::new(p.brightness_min, p.brightness_max).map_err(ConfigError::Exposure)
    }

    pub fn day_controls(&self) -> DayControls {
        let p = self.period(DayPeriod::Day);
        DayControls {
            awb_mode: p.awb_mode,
            metering_mode: p.metering_mode,
            hdr_mode: p.hdr_mode,
            noise_reduction_mode: p.noise_reduction_mode,
            sharpness: p.sharpness,
        }
    }

    pub fn device_settings(&self) -> DeviceSettings {
        DeviceSettings {
            transform: Transform {
                hflip: self.camera.hflip,
                vflip: self.camera.vflip,
            },
            still_size: self.camera.still_width.zip(self.camera.still_height),
        }
    }

    pub fn backend_options(&self) -> BackendOptions {
        let rpicam = &self.camera.rpicam;
        BackendOptions {
            fake: FakeSettings {
                width: self.camera.fake.width,
                height: self.camera.fake.height,
                scene_brightness: self.camera.fake.scene_brightness,
            },
            rpicam: RpicamSettings {
                still_program: rpicam.still_program.clone(),
                video_program: rpicam.video_program.clone(),
                ffmpeg_program: rpicam.ffmpeg_program.clone(),
                capture_timeout_ms: rpicam.capture_timeout_ms,
                quality: rpicam.quality,
                ..RpicamSettings::default()
            },
        }
    }

    pub fn search_settings(&self) -> SearchSettings {
        SearchSettings {
            max_attempts: self.camera.max_attempts,
            settle: secs(self.camera.settle_secs),
        }
    }

    pub fn settle(&self) -> Duration {
        secs(self.camera.settle_secs)
    }

    pub fn teardown(&self) -> Duration {
        secs(self.camera.teardown_secs)
    }

    /// Stream parameters for `period`, or `None` when streaming is off then.
    pub fn stream_settings(&self, period: DayPeriod) -> Option<StreamSettings> {
        if !self.stream.enabled || !period.is_known() {
            return None;
        }
        let p = self.stream.periods.get(period.as_str()).cloned().unwrap_or_default();
        if !p.enabled {
            return None;
        }
        Some(StreamSettings {
            width: self.stream.width,
            height: self.stream.height,
            framerate: p.framerate,
            bitrate: self.stream.bitrate.clone(),
            bufsize: self.stream.bufsize.clone(),
            youtube_key: self.stream.youtube_key.clone(),
            controls: Controls {
                exposure_value: p.exposure_value,
                analogue_gain: p.analogue_gain,
                frame_rate: Some(p.framerate as f32),
                hdr_mode: Some(0),
                ..Default::default()
            },
        })
    }

    pub fn schedule(&self) -> Result<DailySchedule, ConfigError> {
        let c = &self.day_period;
        Ok(DailySchedule {
            dawn: parse_time("day_period.dawn", &c.dawn)?,
            sunrise: parse_time("day_period.sunrise", &c.sunrise)?,
            sunset: parse_time("day_period.sunset", &c.sunset)?,
            dusk: parse_time("day_period.dusk", &c.dusk)?,
        })
    }

    pub fn day_period_oracle(&self) -> Result<Arc<dyn DayPeriodOracle>, ConfigError> {
        match self.day_period.fixed {
            Some(period) => Ok(Arc::new(FixedPeriod(period))),
            None => Ok(Arc::new(self.schedule()?)),
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

fn parse_time(key: &str, value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|_| ConfigError::Invalid(format!("{} is not a HH:MM time: '{}'", key, value)))
}

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },
    Exposure(ExposureError),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError { path, source } => {
                write!(
                    f,
                    "Failed to read config file '{}': {}",
                    path.display(),
                    source
                )
            }
            ConfigError::ParseError { path, source } => {
                write!(
                    f,
                    "Failed to parse config file '{}': {}",
                    path.display(),
                    source
                )
            }
            ConfigError::Exposure(e) => write!(f, "Invalid exposure settings: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::IoError { source, .. } => Some(source),
            ConfigError::ParseError { source, .. } => Some(source),
            ConfigError::Exposure(source) => Some(source),
            ConfigError::Invalid(_) => None,
        }
    }
}

/// Get the default config file path.
pub fn default_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    dirs::config_dir()
        .map(|d| d.join("lapsecam").join("config.toml"))
        .unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config/lapsecam/config.toml")
        })
}

/// The live configuration, shared between components.
pub struct ConfigStore {
    path: Option<PathBuf>,
    current: RwLock<Arc<Config>>,
}

impl ConfigStore {
    /// Load from `path` (or the default location).
    pub fn open(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = Config::load(path)?;
        Ok(Self {
            path: Some(path.map(PathBuf::from).unwrap_or_else(default_path)),
            current: RwLock::new(Arc::new(config)),
        })
    }

    /// A store that never reloads.
    pub fn fixed(config: Config) -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(config)),
        }
    }

    pub fn get(&self) -> Arc<Config> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Re-read the file. On failure the previous configuration stays live.
    pub fn reload(&self) -> Arc<Config> {
        let Some(path) = &self.path else {
            return self.get();
        };
        match Config::load(Some(path)) {
            Ok(config) => {
                let config = Arc::new(config);
                let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
                if **current != *config {
                    log::info!("Configuration changed on disk, reloaded");
                }
                *current = Arc::clone(&config);
                config
            }
            Err(e) => {
                log::error!("Config reload failed, keeping previous configuration: {}", e);
                self.get()
            }
        }
    }
}

/// Keys whose values never reach the log.
const SECRET_KEYS: [&str; 6] = ["password", "pass", "pwd", "key", "youtube_key", "token"];

/// Render `config` one key per line, secrets masked.
pub fn redacted_lines(config: &Config) -> Vec<String> {
    let mut lines = Vec::new();
    match serde_json::to_value(config) {
        Ok(value) => walk(&value, 0, &mut lines),
        Err(e) => lines.push(format!("<unprintable configuration: {}>", e)),
    }
    lines
}

fn walk(value: &serde_json::Value, indent: usize, lines: &mut Vec<String>) {
    use serde_json::Value;

    let pad = "  ".repeat(indent);
    match value {
        Value::Object(map) => {
            for (key, value) in map {
                if SECRET_KEYS.contains(&key.to_lowercase().as_str()) && !value.is_null() {
                    lines.push(format!("{}{}: *****", pad, key));
                } else if value.is_object() || value.is_array() {
                    lines.push(format!("{}{}:", pad, key));
                    walk(value, indent + 1, lines);
                } else {
                    lines.push(format!("{}{}: {}", pad, key, value));
                }
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                lines.push(format!("{}[{}]:", pad, i));
                walk(item, indent + 1, lines);
            }
        }
        other => lines.push(format!("{}{}", pad, other)),
    }
}

/// Log the effective configuration at info.
pub fn log_config(config: &Config) {
    log::info!("Effective configuration:");
    for line in redacted_lines(config) {
        log::info!("  {}", line);
    }
}
