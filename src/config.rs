use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Result, VigilError};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// HTTP control API bind address.
    #[serde(default)]
    pub http: HttpConfig,
    /// WebSocket hub bind address.
    #[serde(default)]
    pub websocket: WebSocketConfig,
    /// Motion detector tuning.
    #[serde(default)]
    pub motion_detection: MotionConfig,
    /// Recording output and encoder profile.
    #[serde(default)]
    pub recording: RecordingConfig,
    /// Stream open / read pacing knobs.
    #[serde(default)]
    pub performance: PerformanceConfig,
    /// Logging configuration.
    #[serde(default)]
    pub log: LogConfig,
    /// Cameras started at boot. More can be added at runtime over HTTP.
    #[serde(default)]
    pub cameras: Vec<CameraSeed>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { host: default_host(), port: default_http_port() }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebSocketConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_ws_port")]
    pub port: u16,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self { host: default_host(), port: default_ws_port() }
    }
}

/// Frame-difference detector parameters. Per-camera constants, not adaptive.
#[derive(Debug, Deserialize, Clone)]
pub struct MotionConfig {
    /// Pixel delta required to mark a pixel as changed (1–255).
    #[serde(default = "default_threshold")]
    pub threshold: u8,
    /// Minimum contour area in pixels at detect resolution.
    #[serde(default = "default_min_area")]
    pub min_area: u32,
    /// Only every Nth frame is run through detection.
    #[serde(default = "default_skip_frames")]
    pub skip_frames: u32,
    /// Sustained absence of motion required to end a recording.
    #[serde(default = "default_post_buffer")]
    pub post_buffer_seconds: u64,
    /// Downscaled detection resolution.
    #[serde(default = "default_detect_width")]
    pub detect_width: u32,
    #[serde(default = "default_detect_height")]
    pub detect_height: u32,
    /// Gaussian blur kernel size (odd).
    #[serde(default = "default_blur_kernel")]
    pub blur_kernel: u32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            min_area: default_min_area(),
            skip_frames: default_skip_frames(),
            post_buffer_seconds: default_post_buffer(),
            detect_width: default_detect_width(),
            detect_height: default_detect_height(),
            blur_kernel: default_blur_kernel(),
        }
    }
}

/// Recording output layout and ffmpeg profile.
#[derive(Debug, Deserialize, Clone)]
pub struct RecordingConfig {
    /// Root directory for `<camera_id>/<YYYY-MM-DD>/` recording trees.
    #[serde(default = "default_recordings_dir")]
    pub recordings_dir: PathBuf,
    /// Recordings older than this many days are removed by the janitor.
    #[serde(default = "default_cleanup_days")]
    pub cleanup_days: u64,
    /// Duration of a single MP4 segment in seconds (10–3600).
    #[serde(default = "default_chunk_duration")]
    pub chunk_duration_seconds: u64,
    /// Re-encode with libx264 when true, stream-copy when false.
    #[serde(default = "default_reencode")]
    pub reencode: bool,
    /// Encoder binary invoked as a child process.
    #[serde(default = "default_ffmpeg_bin")]
    pub ffmpeg_bin: String,
    #[serde(default = "default_ffmpeg_preset")]
    pub ffmpeg_preset: String,
    #[serde(default = "default_ffmpeg_crf")]
    pub ffmpeg_crf: u32,
    #[serde(default = "default_ffmpeg_fps")]
    pub ffmpeg_fps: u32,
    #[serde(default = "default_ffmpeg_resolution")]
    pub ffmpeg_resolution: String,
    #[serde(default = "default_ffmpeg_audio_bitrate")]
    pub ffmpeg_audio_bitrate: String,
    #[serde(default = "default_ffmpeg_threads")]
    pub ffmpeg_threads: u32,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            recordings_dir: default_recordings_dir(),
            cleanup_days: default_cleanup_days(),
            chunk_duration_seconds: default_chunk_duration(),
            reencode: default_reencode(),
            ffmpeg_bin: default_ffmpeg_bin(),
            ffmpeg_preset: default_ffmpeg_preset(),
            ffmpeg_crf: default_ffmpeg_crf(),
            ffmpeg_fps: default_ffmpeg_fps(),
            ffmpeg_resolution: default_ffmpeg_resolution(),
            ffmpeg_audio_bitrate: default_ffmpeg_audio_bitrate(),
            ffmpeg_threads: default_ffmpeg_threads(),
        }
    }
}

/// Stream open and pacing knobs.
#[derive(Debug, Deserialize, Clone)]
pub struct PerformanceConfig {
    /// Appsink / channel depth in frames. Small to drop backlog over latency.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Attempts to read the first frame after opening a stream.
    #[serde(default = "default_max_init_frames")]
    pub max_init_frames: u32,
    /// Wait between initial-frame attempts, milliseconds.
    #[serde(default = "default_init_frame_wait_ms")]
    pub init_frame_wait_ms: u64,
    /// Worker loop sleep while recording, milliseconds.
    #[serde(default = "default_sleep_motion_ms")]
    pub adaptive_sleep_motion_ms: u64,
    /// Worker loop sleep while idle, milliseconds.
    #[serde(default = "default_sleep_no_motion_ms")]
    pub adaptive_sleep_no_motion_ms: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            max_init_frames: default_max_init_frames(),
            init_frame_wait_ms: default_init_frame_wait_ms(),
            adaptive_sleep_motion_ms: default_sleep_motion_ms(),
            adaptive_sleep_no_motion_ms: default_sleep_no_motion_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Optional log file; stdout only when unset.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: default_log_level(), file: None }
    }
}

/// A camera monitored from process start.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CameraSeed {
    /// Unique identifier used for directory/file naming.
    pub id: String,
    /// RTSP (or HTTP/file) URL of the camera stream.
    pub url: String,
}

fn default_host() -> String { "0.0.0.0".into() }
fn default_http_port() -> u16 { 8083 }
fn default_ws_port() -> u16 { 8084 }
fn default_threshold() -> u8 { 30 }
fn default_min_area() -> u32 { 800 }
fn default_skip_frames() -> u32 { 10 }
fn default_post_buffer() -> u64 { 3 }
fn default_detect_width() -> u32 { 320 }
fn default_detect_height() -> u32 { 240 }
fn default_blur_kernel() -> u32 { 21 }
fn default_recordings_dir() -> PathBuf { PathBuf::from("recordings") }
fn default_cleanup_days() -> u64 { 3 }
fn default_chunk_duration() -> u64 { 60 }
fn default_reencode() -> bool { true }
fn default_ffmpeg_bin() -> String { "ffmpeg".into() }
fn default_ffmpeg_preset() -> String { "ultrafast".into() }
fn default_ffmpeg_crf() -> u32 { 28 }
fn default_ffmpeg_fps() -> u32 { 15 }
fn default_ffmpeg_resolution() -> String { "1280x720".into() }
fn default_ffmpeg_audio_bitrate() -> String { "64k".into() }
fn default_ffmpeg_threads() -> u32 { 2 }
fn default_buffer_size() -> usize { 1 }
fn default_max_init_frames() -> u32 { 50 }
fn default_init_frame_wait_ms() -> u64 { 200 }
fn default_sleep_motion_ms() -> u64 { 30 }
fn default_sleep_no_motion_ms() -> u64 { 50 }
fn default_log_level() -> String { "info".into() }

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| VigilError::Config(format!("Cannot read config file: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| VigilError::Config(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.motion_detection.threshold == 0 {
            return Err(VigilError::Config("motion_detection.threshold must be 1–255".into()));
        }
        if self.motion_detection.min_area == 0 {
            return Err(VigilError::Config("motion_detection.min_area must be > 0".into()));
        }
        if self.motion_detection.skip_frames == 0 {
            return Err(VigilError::Config("motion_detection.skip_frames must be > 0".into()));
        }
        if self.motion_detection.post_buffer_seconds == 0 {
            return Err(VigilError::Config("motion_detection.post_buffer_seconds must be > 0".into()));
        }
        if self.motion_detection.blur_kernel % 2 == 0 {
            return Err(VigilError::Config("motion_detection.blur_kernel must be odd".into()));
        }
        if self.motion_detection.detect_width == 0 || self.motion_detection.detect_height == 0 {
            return Err(VigilError::Config("motion_detection detect resolution must be > 0".into()));
        }
        if self.recording.cleanup_days == 0 {
            return Err(VigilError::Config("recording.cleanup_days must be >= 1".into()));
        }
        if !(10..=3600).contains(&self.recording.chunk_duration_seconds) {
            return Err(VigilError::Config("recording.chunk_duration_seconds must be 10–3600".into()));
        }
        if self.performance.buffer_size == 0 {
            return Err(VigilError::Config("performance.buffer_size must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg: Config = toml::from_str("").expect("empty config parses");
        cfg.validate().expect("defaults validate");
        assert_eq!(cfg.motion_detection.threshold, 30);
        assert_eq!(cfg.motion_detection.skip_frames, 10);
        assert_eq!(cfg.recording.chunk_duration_seconds, 60);
        assert_eq!(cfg.http.port, 8083);
        assert_eq!(cfg.websocket.port, 8084);
        assert!(cfg.cameras.is_empty());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut cfg: Config = toml::from_str("").unwrap();
        cfg.recording.chunk_duration_seconds = 5;
        assert!(cfg.validate().is_err());

        let mut cfg: Config = toml::from_str("").unwrap();
        cfg.motion_detection.blur_kernel = 20;
        assert!(cfg.validate().is_err());

        let mut cfg: Config = toml::from_str("").unwrap();
        cfg.recording.cleanup_days = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parses_camera_seeds_and_sections() {
        let toml = r#"
            [http]
            port = 9000

            [motion_detection]
            threshold = 40
            skip_frames = 5

            [recording]
            chunk_duration_seconds = 120
            reencode = false

            [[cameras]]
            id = "front-door"
            url = "rtsp://10.0.0.5/stream1"
        "#;
        let cfg: Config = toml::from_str(toml).expect("parses");
        cfg.validate().expect("valid");
        assert_eq!(cfg.http.port, 9000);
        assert_eq!(cfg.motion_detection.threshold, 40);
        assert!(!cfg.recording.reencode);
        assert_eq!(cfg.cameras.len(), 1);
        assert_eq!(cfg.cameras[0].id, "front-door");
    }
}
