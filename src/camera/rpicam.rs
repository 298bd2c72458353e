//! Raspberry Pi camera backend built on the rpicam-apps tools.
//!
//! Stills run one `rpicam-still` process per frame with the current controls
//! translated to flags. Streaming pipes raw YUV420 from `rpicam-vid` into
//! `ffmpeg`, which pushes H.264 over RTMP.

use std::path::PathBuf;
use std::process::Stdio;
use std::thread;
use std::time::Duration;

use super::device::{CameraDevice, StreamSession, StreamStatus};
use super::process::{run_to_completion, ManagedChild};
use super::types::{
    CameraError, CapturedFrame, Controls, DeviceSettings, FrameMetadata, StreamSettings,
};

/// Base RTMP ingest URL; the stream key is appended.
pub const YOUTUBE_RTMP_URL: &str = "rtmp://a.rtmp.youtube.com/live2";

#[derive(Debug, Clone)]
pub struct RpicamSettings {
    pub still_program: String,
    pub video_program: String,
    pub ffmpeg_program: String,
    /// `-t` passed to rpicam-still, in milliseconds.
    pub capture_timeout_ms: u64,
    /// JPEG quality of stills.
    pub quality: u8,
    /// Where rpicam-still drops the per-frame metadata JSON.
    pub metadata_path: PathBuf,
}

impl Default for RpicamSettings {
    fn default() -> Self {
        Self {
            still_program: "rpicam-still".to_string(),
            video_program: "rpicam-vid".to_string(),
            ffmpeg_program: "ffmpeg".to_string(),
            capture_timeout_ms: 1000,
            quality: 93,
            metadata_path: std::env::temp_dir().join("lapsecam-still-metadata.json"),
        }
    }
}

pub struct RpicamCamera {
    settings: RpicamSettings,
    device: DeviceSettings,
    controls: Controls,
    started: bool,
    closed: bool,
}

impl RpicamCamera {
    /// Verify a sensor is attached and build the device.
    pub fn open(settings: RpicamSettings, device: DeviceSettings) -> Result<Self, CameraError> {
        let listing = run_to_completion(&settings.still_program, &["--list-cameras".to_string()])?;
        let listing = String::from_utf8_lossy(&listing);
        if !listing.contains("Available cameras") {
            return Err(CameraError::OpenFailed(format!(
                "no camera reported by {}",
                settings.still_program
            )));
        }
        if let Some(sensor) = listing.lines().find(|l| l.trim_start().starts_with("0 :")) {
            log::info!("Using sensor {}", sensor.trim());
        }

        Ok(Self::with_settings(settings, device))
    }

    /// Build without probing the hardware.
    pub fn with_settings(settings: RpicamSettings, device: DeviceSettings) -> Self {
        Self {
            settings,
            device,
            controls: Controls::default(),
            started: false,
            closed: false,
        }
    }

    fn ensure_open(&self) -> Result<(), CameraError> {
        if self.closed {
            Err(CameraError::Closed)
        } else {
            Ok(())
        }
    }

    /// Command line for one still with the current controls.
    pub fn still_args(&self) -> Vec<String> {
        let mut args = vec![
            "-n".to_string(),
            "-t".to_string(),
            self.settings.capture_timeout_ms.to_string(),
            "-e".to_string(),
            "jpg".to_string(),
            "-q".to_string(),
            self.settings.quality.to_string(),
            "--metadata".to_string(),
            self.settings.metadata_path.display().to_string(),
            "--metadata-format".to_string(),
            "json".to_string(),
        ];
        if let Some((width, height)) = self.device.still_size {
            push_pair(&mut args, "--width", width);
            push_pair(&mut args, "--height", height);
        }
        push_transform(&mut args, &self.device);
        push_controls(&mut args, &self.controls);
        args.push("-o".to_string());
        args.push("-".to_string());
        args
    }

    /// Command line for the raw video source of a stream.
    pub fn video_args(&self, stream: &StreamSettings) -> Vec<String> {
        let mut args = vec![
            "-n".to_string(),
            "-t".to_string(),
            "0".to_string(),
            "--codec".to_string(),
            "yuv420".to_string(),
        ];
        push_pair(&mut args, "--width", stream.width);
        push_pair(&mut args, "--height", stream.height);
        push_pair(&mut args, "--framerate", stream.framerate);
        push_transform(&mut args, &self.device);
        let mut controls = self.controls.clone();
        controls.merge(&stream.controls);
        push_controls(&mut args, &controls);
        args.push("-o".to_string());
        args.push("-".to_string());
        args
    }

    fn read_metadata(&self) -> FrameMetadata {
        let raw = match std::fs::read_to_string(&self.settings.metadata_path) {
            Ok(raw) => raw,
            Err(e) => {
                log::debug!("No still metadata available: {}", e);
                return self.requested_metadata();
            }
        };
        match parse_metadata(&raw) {
            Some(meta) => meta,
            None => {
                log::warn!("Could not parse still metadata, using requested controls");
                self.requested_metadata()
            }
        }
    }

    fn requested_metadata(&self) -> FrameMetadata {
        FrameMetadata {
            exposure_time_us: self.controls.exposure_time_us.filter(|us| *us > 0),
            analogue_gain: self.controls.analogue_gain,
            ..FrameMetadata::default()
        }
    }
}

/// Extract the fields we care about from rpicam's JSON metadata dump.
pub fn parse_metadata(raw: &str) -> Option<FrameMetadata> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    let object = value.as_object()?;
    let float = |key: &str| object.get(key).and_then(|v| v.as_f64()).map(|v| v as f32);
    Some(FrameMetadata {
        exposure_time_us: object.get("ExposureTime").and_then(|v| v.as_u64()),
        analogue_gain: float("AnalogueGain"),
        digital_gain: float("DigitalGain"),
        lux: float("Lux"),
        colour_temperature: object
            .get("ColourTemperature")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32),
    })
}

fn push_pair(args: &mut Vec<String>, flag: &str, value: impl ToString) {
    args.push(flag.to_string());
    args.push(value.to_string());
}

fn push_transform(args: &mut Vec<String>, device: &DeviceSettings) {
    if device.transform.hflip {
        args.push("--hflip".to_string());
    }
    if device.transform.vflip {
        args.push("--vflip".to_string());
    }
}

fn push_controls(args: &mut Vec<String>, controls: &Controls) {
    if !controls.auto_exposure() {
        if let Some(us) = controls.exposure_time_us.filter(|us| *us > 0) {
            push_pair(args, "--shutter", us);
        }
    }
    if let Some(gain) = controls.analogue_gain {
        push_pair(args, "--gain", gain);
    }
    if let Some(mode) = controls.awb_mode {
        push_pair(args, "--awb", awb_name(mode));
    }
    if let Some(mode) = controls.metering_mode {
        push_pair(args, "--metering", metering_name(mode));
    }
    if let Some(ev) = controls.exposure_value.filter(|ev| *ev != 0.0) {
        push_pair(args, "--ev", ev);
    }
    if let Some(mode) = controls.hdr_mode {
        push_pair(args, "--hdr", if mode == 0 { "off" } else { "auto" });
    }
    if let Some(mode) = controls.noise_reduction_mode {
        push_pair(args, "--denoise", denoise_name(mode));
    }
    if let Some(sharpness) = controls.sharpness {
        push_pair(args, "--sharpness", sharpness);
    }
}

fn awb_name(mode: i32) -> &'static str {
    match mode {
        1 => "incandescent",
        2 => "tungsten",
        3 => "fluorescent",
        4 => "indoor",
        5 => "daylight",
        6 => "cloudy",
        _ => "auto",
    }
}

fn metering_name(mode: i32) -> &'static str {
    match mode {
        1 => "spot",
        2 => "average",
        _ => "centre",
    }
}

fn denoise_name(mode: i32) -> &'static str {
    match mode {
        0 => "off",
        1 => "cdn_fast",
        2 => "cdn_hq",
        _ => "auto",
    }
}

/// ffmpeg arguments for pushing raw YUV420 from stdin to YouTube.
pub fn ffmpeg_args(stream: &StreamSettings, key: &str) -> Vec<String> {
    let fr = stream.framerate.max(1);
    [
        "-f",
        "rawvideo",
        "-pix_fmt",
        "yuv420p",
        "-s",
        &format!("{}x{}", stream.width, stream.height),
        "-r",
        &fr.to_string(),
        "-i",
        "-",
        "-f",
        "lavfi",
        "-i",
        "anullsrc=channel_layout=stereo:sample_rate=44100",
        "-c:v",
        "libx264",
        "-preset",
        "veryfast",
        "-b:v",
        &stream.bitrate,
        "-maxrate",
        &stream.bitrate,
        "-bufsize",
        &stream.bufsize,
        "-g",
        &(fr * 2).to_string(),
        "-c:a",
        "aac",
        "-ar",
        "44100",
        "-b:a",
        "128k",
        "-f",
        "flv",
        &format!("{}/{}", YOUTUBE_RTMP_URL, key),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl CameraDevice for RpicamCamera {
    fn name(&self) -> &'static str {
        "rpicam"
    }

    fn update_config(&mut self, settings: &DeviceSettings) {
        self.device = settings.clone();
    }

    fn configure_still(&mut self) -> Result<(), CameraError> {
        self.ensure_open()
    }

    fn set_controls(&mut self, controls: &Controls) -> Result<(), CameraError> {
        self.ensure_open()?;
        self.controls.merge(controls);
        Ok(())
    }

    fn start(&mut self) -> Result<(), CameraError> {
        self.ensure_open()?;
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
        self.ensure_open()?;
        if !self.started {
            return Err(CameraError::NotStarted);
        }
        let _ = std::fs::remove_file(&self.settings.metadata_path);
        let jpeg = run_to_completion(&self.settings.still_program, &self.still_args())?;
        if jpeg.is_empty() {
            return Err(CameraError::EmptyFrame);
        }
        Ok(CapturedFrame::new(jpeg, self.read_metadata()))
    }

    fn open_stream(
        &mut self,
        settings: &StreamSettings,
    ) -> Result<Box<dyn StreamSession>, CameraError> {
        self.ensure_open()?;
        let key = settings.youtube_key.as_deref().ok_or_else(|| {
            CameraError::StreamFailed("no stream destination configured".to_string())
        })?;

        let mut video = ManagedChild::spawn(
            &self.settings.video_program,
            &self.video_args(settings),
            Stdio::null(),
            Stdio::piped(),
        )?;
        let raw = video.take_stdout().ok_or_else(|| {
            CameraError::StreamFailed(format!("{} has no stdout", video.program()))
        })?;
        log::info!("Starting ffmpeg for YouTube stream...");
        let ffmpeg = ManagedChild::spawn(
            &self.settings.ffmpeg_program,
            &ffmpeg_args(settings, key),
            Stdio::from(raw),
            Stdio::null(),
        )?;

        Ok(Box::new(RpicamStream { video, ffmpeg }))
    }

    fn close(&mut self) {
        self.started = false;
        self.closed = true;
    }
}

/// Poll interval while the processes do the actual work.
const STREAM_POLL: Duration = Duration::from_millis(200);

struct RpicamStream {
    video: ManagedChild,
    ffmpeg: ManagedChild,
}

impl StreamSession for RpicamStream {
    fn pump(&mut self) -> Result<StreamStatus, CameraError> {
        for child in [&mut self.video, &mut self.ffmpeg] {
            if let Some(status) = child.exit_status() {
                let stderr = child.take_stderr_output();
                return Err(CameraError::StreamFailed(format!(
                    "{} exited ({}): {}",
                    child.program(),
                    status,
                    stderr.last().map(String::as_str).unwrap_or("")
                )));
            }
        }
        thread::sleep(STREAM_POLL);
        Ok(StreamStatus::Idle)
    }

    fn finish(&mut self) -> Result<(), CameraError> {
        // stopping the source first lets ffmpeg see EOF and flush
        let video = self.video.shutdown();
        let ffmpeg = self.ffmpeg.shutdown();
        video?;
        ffmpeg?;
        log::info!("rpicam stream processes stopped");
        Ok(())
    }
}
