//! External encoder lifecycle.
//!
//! A [`Recorder`] owns at most one ffmpeg child process. The encoder pulls
//! the RTSP source itself over TCP and writes time-segmented MP4 files
//! through the segment muxer, so the detection path never touches encoded
//! bytes. `stop` asks for a graceful quit on stdin first and force-kills
//! after a grace period; the handle is cleared on every exit path.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::RecordingConfig;
use crate::error::{Result, VigilError};

/// Grace period between the quit request and a forced kill.
const STOP_GRACE: Duration = Duration::from_secs(5);

pub struct Recorder {
    camera_id: String,
    cfg: RecordingConfig,
    grace: Duration,
    child: Option<Child>,
}

impl Recorder {
    pub fn new(camera_id: impl Into<String>, cfg: RecordingConfig) -> Self {
        Self::with_grace(camera_id, cfg, STOP_GRACE)
    }

    pub fn with_grace(camera_id: impl Into<String>, cfg: RecordingConfig, grace: Duration) -> Self {
        Self {
            camera_id: camera_id.into(),
            cfg,
            grace,
            child: None,
        }
    }

    /// Encoder command line for one recording session.
    ///
    /// The template must contain a `%03d` placeholder; the segment muxer
    /// substitutes the chunk counter starting at 001 and resets timestamps
    /// at each boundary.
    pub fn build_args(cfg: &RecordingConfig, rtsp_url: &str, output_template: &Path) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-y".into(),
            "-hide_banner".into(),
            "-loglevel".into(),
            "warning".into(),
        ];
        if rtsp_url.starts_with("rtsp://") || rtsp_url.starts_with("rtsps://") {
            args.push("-rtsp_transport".into());
            args.push("tcp".into());
        }
        args.push("-i".into());
        args.push(rtsp_url.into());

        if cfg.reencode {
            args.extend([
                "-c:v".into(),
                "libx264".into(),
                "-preset".into(),
                cfg.ffmpeg_preset.clone(),
                "-crf".into(),
                cfg.ffmpeg_crf.to_string(),
                "-r".into(),
                cfg.ffmpeg_fps.to_string(),
                "-s".into(),
                cfg.ffmpeg_resolution.clone(),
                "-c:a".into(),
                "aac".into(),
                "-b:a".into(),
                cfg.ffmpeg_audio_bitrate.clone(),
                "-pix_fmt".into(),
                "yuv420p".into(),
                "-threads".into(),
                cfg.ffmpeg_threads.to_string(),
            ]);
        } else {
            args.extend(["-c".into(), "copy".into()]);
        }

        args.extend([
            "-f".into(),
            "segment".into(),
            "-segment_time".into(),
            cfg.chunk_duration_seconds.to_string(),
            "-reset_timestamps".into(),
            "1".into(),
            "-segment_start_number".into(),
            "1".into(),
            "-segment_format".into(),
            "mp4".into(),
            output_template.to_string_lossy().into_owned(),
        ]);
        args
    }

    /// Spawn the encoder. Returns `Ok(false)` when a process is already
    /// owned (idempotent no-op).
    pub fn start(&mut self, output_template: &Path, rtsp_url: &str) -> Result<bool> {
        if self.child.is_some() {
            return Ok(false);
        }

        let args = Self::build_args(&self.cfg, rtsp_url, output_template);
        let mut child = Command::new(&self.cfg.ffmpeg_bin)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VigilError::SpawnFailed(format!("{}: {e}", self.cfg.ffmpeg_bin)))?;

        if let Some(stderr) = child.stderr.take() {
            let camera = self.camera_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(camera = %camera, "encoder: {line}");
                }
            });
        }

        info!(
            camera = self.camera_id,
            template = %output_template.display(),
            "Encoder started"
        );
        self.child = Some(child);
        Ok(true)
    }

    /// Stop the owned encoder, if any. Returns false when nothing is owned.
    pub async fn stop(&mut self) -> bool {
        let Some(mut child) = self.child.take() else {
            return false;
        };

        if let Some(mut stdin) = child.stdin.take() {
            // ffmpeg finalizes its output and exits on 'q' (or stdin EOF).
            let _ = stdin.write_all(b"q").await;
            let _ = stdin.flush().await;
        }

        match timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(camera = self.camera_id, %status, "Encoder exited");
            }
            Ok(Err(e)) => {
                warn!(camera = self.camera_id, error = %e, "Encoder wait failed, killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
            Err(_) => {
                warn!(camera = self.camera_id, "Encoder ignored quit request, killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
        true
    }

    /// True iff a process is owned and has not exited.
    pub fn alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.child.is_some()
    }

    /// Drop the handle of an encoder that already exited on its own.
    pub fn clear(&mut self) {
        self.child = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn template() -> PathBuf {
        PathBuf::from("/tmp/recordings/cam1/2026-08-01/cam1_120000_chunk%03d.mp4")
    }

    #[tokio::test]
    async fn stop_without_start_is_noop() {
        let mut rec = Recorder::new("cam1", RecordingConfig::default());
        assert!(!rec.stop().await);
        assert!(!rec.alive());
        assert!(!rec.is_recording());
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_and_owns_nothing() {
        let cfg = RecordingConfig {
            ffmpeg_bin: "/nonexistent/encoder-binary".into(),
            ..RecordingConfig::default()
        };
        let mut rec = Recorder::new("cam1", cfg);
        let err = rec.start(&template(), "rtsp://example/1").unwrap_err();
        assert!(matches!(err, VigilError::SpawnFailed(_)));
        assert!(!rec.is_recording());
        assert!(!rec.stop().await);
    }

    #[test]
    fn args_use_tcp_transport_and_segment_muxer() {
        let cfg = RecordingConfig::default();
        let args = Recorder::build_args(&cfg, "rtsp://example/1", &template());

        let transport = args.iter().position(|a| a == "-rtsp_transport");
        assert!(transport.is_some());
        assert_eq!(args[transport.unwrap() + 1], "tcp");

        let seg = args.iter().position(|a| a == "-segment_time").unwrap();
        assert_eq!(args[seg + 1], "60");
        assert!(args.contains(&"-reset_timestamps".to_string()));
        assert_eq!(args.last().unwrap(), &template().to_string_lossy());
        assert!(args.last().unwrap().contains("chunk%03d.mp4"));
    }

    #[test]
    fn args_omit_tcp_transport_for_file_sources() {
        let cfg = RecordingConfig::default();
        let args = Recorder::build_args(&cfg, "file:///tmp/clip.mp4", &template());
        assert!(!args.contains(&"-rtsp_transport".to_string()));
    }

    #[test]
    fn copy_profile_skips_encode_flags() {
        let cfg = RecordingConfig { reencode: false, ..RecordingConfig::default() };
        let args = Recorder::build_args(&cfg, "rtsp://example/1", &template());
        assert!(args.contains(&"copy".to_string()));
        assert!(!args.contains(&"libx264".to_string()));
        assert!(!args.contains(&"-crf".to_string()));
    }

    #[test]
    fn reencode_profile_carries_configured_values() {
        let cfg = RecordingConfig {
            ffmpeg_preset: "veryfast".into(),
            ffmpeg_crf: 23,
            ..RecordingConfig::default()
        };
        let args = Recorder::build_args(&cfg, "rtsp://example/1", &template());
        let preset = args.iter().position(|a| a == "-preset").unwrap();
        assert_eq!(args[preset + 1], "veryfast");
        let crf = args.iter().position(|a| a == "-crf").unwrap();
        assert_eq!(args[crf + 1], "23");
    }
}
