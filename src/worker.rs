//! Per-camera worker: glues the frame source, the motion detector, and the
//! recorder together under a supervised loop.
//!
//! The worker owns one stream session at a time. A crashed session (open
//! failure, dead stream, persistent read failures) is restarted after a
//! fixed backoff until the registry raises the stop signal. Motion
//! hysteresis is asymmetric: a single motion frame starts a recording,
//! while exiting requires `post_buffer_seconds` without motion.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::detector::{Decision, MotionDetector};
use crate::error::{Result, VigilError};
use crate::events::{EventBus, MotionEvent};
use crate::recorder::Recorder;
use crate::stream::{FrameSource, ReadOutcome};

/// Wait before re-opening a crashed stream.
const RESTART_BACKOFF: Duration = Duration::from_secs(5);

/// Consecutive failed reads before the session is recycled.
const MAX_READ_FAILURES: u32 = 5;

/// Idle sleep multiplier once the camera has been quiet for a while.
const LONG_IDLE_MULTIPLIER: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Initializing,
    Watching,
    Recording,
    Stopping,
    Crashed,
}

/// Start or stop the recorder, as decided by the hysteresis policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Start,
    Stop,
}

/// Motion-hysteresis policy, separated from the I/O loop.
///
/// Skipped detector decisions carry no information and never advance the
/// policy; only `Motion` and `NoMotion` move it.
pub struct Hysteresis {
    post_buffer: Duration,
    recording: bool,
    motion_since: Option<Instant>,
    last_motion_seen: Option<Instant>,
}

impl Hysteresis {
    pub fn new(post_buffer: Duration) -> Self {
        Self {
            post_buffer,
            recording: false,
            motion_since: None,
            last_motion_seen: None,
        }
    }

    pub fn on_decision(&mut self, decision: Decision, now: Instant) -> Option<Action> {
        match decision {
            Decision::Skipped => None,
            Decision::Motion => {
                self.last_motion_seen = Some(now);
                if self.recording {
                    None
                } else {
                    self.recording = true;
                    self.motion_since = Some(now);
                    Some(Action::Start)
                }
            }
            Decision::NoMotion => {
                if self.recording {
                    if let Some(last) = self.last_motion_seen {
                        if now.duration_since(last) > self.post_buffer {
                            self.recording = false;
                            return Some(Action::Stop);
                        }
                    }
                }
                None
            }
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Instant of the first motion frame of the current burst.
    pub fn motion_since(&self) -> Option<Instant> {
        self.motion_since
    }

    /// Forget the current burst, e.g. after the encoder died on its own.
    pub fn reset(&mut self) {
        self.recording = false;
        self.motion_since = None;
        self.last_motion_seen = None;
    }
}

pub struct CameraWorker {
    camera_id: String,
    rtsp_url: String,
    config: Arc<Config>,
    bus: EventBus,
}

impl CameraWorker {
    pub fn new(
        camera_id: impl Into<String>,
        rtsp_url: impl Into<String>,
        config: Arc<Config>,
        bus: EventBus,
    ) -> Self {
        Self {
            camera_id: camera_id.into(),
            rtsp_url: rtsp_url.into(),
            config,
            bus,
        }
    }

    /// Spawn the supervised worker loop as an async task.
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    async fn run(self, cancel: CancellationToken) {
        info!(camera = self.camera_id, url = self.rtsp_url, "Camera worker started");

        loop {
            match self.session(&cancel).await {
                Ok(()) => break,
                Err(e) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    warn!(
                        camera = self.camera_id,
                        error = %e,
                        "Session crashed, restarting after backoff"
                    );
                    debug!(camera = self.camera_id, state = ?WorkerState::Crashed, "State change");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(RESTART_BACKOFF) => {}
                    }
                }
            }
        }

        info!(camera = self.camera_id, "Camera worker stopped");
    }

    /// One stream session: open, watch, record, until stop or crash.
    async fn session(&self, cancel: &CancellationToken) -> Result<()> {
        let mut state = WorkerState::Initializing;
        debug!(camera = self.camera_id, ?state, "State change");

        let mut source = FrameSource::open(
            &self.camera_id,
            &self.rtsp_url,
            &self.config.performance,
        )?;
        let first = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = source.initial_frame(&self.config.performance) => frame?,
        };

        let mut detector = MotionDetector::new(&self.config.motion_detection);
        detector.initialize(&first);

        let mut recorder = Recorder::new(self.camera_id.clone(), self.config.recording.clone());
        let mut hysteresis =
            Hysteresis::new(Duration::from_secs(self.config.motion_detection.post_buffer_seconds));
        let mut read_failures = 0u32;
        let mut video_path: Option<String> = None;

        state = WorkerState::Watching;
        debug!(camera = self.camera_id, ?state, "State change");

        loop {
            if cancel.is_cancelled() {
                state = WorkerState::Stopping;
                debug!(camera = self.camera_id, ?state, "State change");
                if recorder.is_recording() {
                    recorder.stop().await;
                    self.bus
                        .publish(MotionEvent::stop(&self.camera_id, video_path.take()));
                }
                return Ok(());
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => continue,
                outcome = source.next_frame() => outcome,
            };

            let frame = match outcome {
                ReadOutcome::Frame(frame) => {
                    read_failures = 0;
                    frame
                }
                ReadOutcome::Eos => {
                    warn!(camera = self.camera_id, "Stream ended");
                    if recorder.is_recording() {
                        recorder.stop().await;
                        self.bus
                            .publish(MotionEvent::stop(&self.camera_id, video_path.take()));
                    }
                    return Err(VigilError::PersistentReadFailure {
                        id: self.camera_id.clone(),
                        failures: read_failures,
                    });
                }
                ReadOutcome::TimedOut => {
                    read_failures += 1;
                    if read_failures >= MAX_READ_FAILURES {
                        if recorder.is_recording() {
                            recorder.stop().await;
                            self.bus
                                .publish(MotionEvent::stop(&self.camera_id, video_path.take()));
                        }
                        return Err(VigilError::PersistentReadFailure {
                            id: self.camera_id.clone(),
                            failures: read_failures,
                        });
                    }
                    continue;
                }
            };

            // A silently dead encoder ends the session the same way a
            // post-buffer timeout would.
            if hysteresis.is_recording() && !recorder.alive() {
                warn!(camera = self.camera_id, "Encoder exited unexpectedly");
                recorder.clear();
                hysteresis.reset();
                self.bus
                    .publish(MotionEvent::stop(&self.camera_id, video_path.take()));
                state = WorkerState::Watching;
                debug!(camera = self.camera_id, ?state, "State change");
            }

            let decision = detector.process(&frame);
            match hysteresis.on_decision(decision, Instant::now()) {
                Some(Action::Start) => match self.begin_recording(&mut recorder) {
                    Ok(template) => {
                        state = WorkerState::Recording;
                        debug!(camera = self.camera_id, ?state, "State change");
                        info!(camera = self.camera_id, path = %template, "Motion detected, recording");
                        video_path = Some(template.clone());
                        self.bus
                            .publish(MotionEvent::start(&self.camera_id, Some(template)));
                    }
                    Err(e) => {
                        error!(camera = self.camera_id, error = %e, "Failed to start encoder");
                        hysteresis.reset();
                    }
                },
                Some(Action::Stop) => {
                    recorder.stop().await;
                    state = WorkerState::Watching;
                    debug!(camera = self.camera_id, ?state, "State change");
                    info!(
                        camera = self.camera_id,
                        post_buffer = self.config.motion_detection.post_buffer_seconds,
                        "Motion stopped, recording closed after post-buffer"
                    );
                    self.bus
                        .publish(MotionEvent::stop(&self.camera_id, video_path.take()));
                }
                None => {}
            }

            let pause = self.adaptive_sleep(&hysteresis, &detector);
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = sleep(pause) => {}
            }
        }
    }

    /// Create today's output directory and launch the encoder into it.
    fn begin_recording(&self, recorder: &mut Recorder) -> Result<String> {
        let now = Local::now();
        let dir: PathBuf = self
            .config
            .recording
            .recordings_dir
            .join(&self.camera_id)
            .join(now.format("%Y-%m-%d").to_string());
        std::fs::create_dir_all(&dir)
            .map_err(|e| VigilError::Storage(format!("Cannot create {}: {e}", dir.display())))?;

        let template = dir.join(format!(
            "{}_{}_chunk%03d.mp4",
            self.camera_id,
            now.format("%H%M%S")
        ));
        recorder.start(&template, &self.rtsp_url)?;
        Ok(template.to_string_lossy().into_owned())
    }

    fn adaptive_sleep(&self, hysteresis: &Hysteresis, detector: &MotionDetector) -> Duration {
        let perf = &self.config.performance;
        if hysteresis.is_recording() {
            Duration::from_millis(perf.adaptive_sleep_motion_ms)
        } else if detector.long_idle() {
            Duration::from_millis(perf.adaptive_sleep_no_motion_ms * LONG_IDLE_MULTIPLIER as u64)
        } else {
            Duration::from_millis(perf.adaptive_sleep_no_motion_ms)
        }
    }
}
