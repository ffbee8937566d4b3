//! Camera frame source using GStreamer.
//!
//! Each camera runs a GStreamer pipeline:
//!   uridecodebin → videoconvert → appsink (GRAY8)
//!
//! The appsink emits decoded grayscale frames that the worker feeds into the
//! motion detector. The appsink and the forwarding channel are both kept
//! shallow (`drop=true`) so a slow consumer sheds backlog instead of
//! accumulating latency.

use std::time::Duration;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use gstreamer_video::VideoFrameExt;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::info;

use crate::config::PerformanceConfig;
use crate::error::{Result, VigilError};

/// Per-read deadline on a live stream before the read counts as failed.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// One decoded grayscale frame at native resolution.
#[derive(Debug, Clone)]
pub struct Frame {
    /// GRAY8 pixels, row-major, `width * height` bytes.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Outcome of a single `next_frame` read.
#[derive(Debug)]
pub enum ReadOutcome {
    Frame(Frame),
    /// The pipeline reached end-of-stream or errored out.
    Eos,
    /// No frame arrived within the read deadline.
    TimedOut,
}

/// Handle to a running decode pipeline for one camera.
pub struct FrameSource {
    camera_id: String,
    pipeline: gst::Pipeline,
    rx: mpsc::Receiver<Frame>,
}

impl FrameSource {
    /// Build and start the decode pipeline for the given camera URL.
    pub fn open(camera_id: &str, url: &str, perf: &PerformanceConfig) -> Result<Self> {
        gst::init().map_err(|e| VigilError::StreamOpenFailed {
            id: camera_id.to_owned(),
            reason: format!("gst::init: {e}"),
        })?;

        let depth = perf.buffer_size.max(1);
        let (tx, rx) = mpsc::channel::<Frame>(depth);

        let pipeline_str = format!(
            "uridecodebin uri=\"{url}\" ! videoconvert ! video/x-raw,format=GRAY8 ! \
             appsink name=sink emit-signals=true max-buffers={depth} drop=true sync=false",
        );

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| VigilError::StreamOpenFailed {
                id: camera_id.to_owned(),
                reason: format!("parse_launch: {e}"),
            })?
            .downcast::<gst::Pipeline>()
            .map_err(|_| VigilError::StreamOpenFailed {
                id: camera_id.to_owned(),
                reason: "Not a pipeline".into(),
            })?;

        let appsink: gst_app::AppSink = pipeline
            .by_name("sink")
            .ok_or_else(|| VigilError::StreamOpenFailed {
                id: camera_id.to_owned(),
                reason: "appsink not found".into(),
            })?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| VigilError::StreamOpenFailed {
                id: camera_id.to_owned(),
                reason: "Cast to AppSink failed".into(),
            })?;

        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Error)?;
                    let caps = sample.caps().ok_or(gst::FlowError::Error)?;
                    let info = gst_video::VideoInfo::from_caps(caps)
                        .map_err(|_| gst::FlowError::Error)?;
                    let buffer = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let vframe = gst_video::VideoFrameRef::from_buffer_ref_readable(buffer, &info)
                        .map_err(|_| gst::FlowError::Error)?;

                    let width = info.width();
                    let height = info.height();
                    let stride = vframe.plane_stride()[0] as usize;
                    let plane = vframe.plane_data(0).map_err(|_| gst::FlowError::Error)?;

                    // Strip row padding so downstream sees tightly packed pixels.
                    let mut data = Vec::with_capacity((width * height) as usize);
                    for row in 0..height as usize {
                        let start = row * stride;
                        data.extend_from_slice(&plane[start..start + width as usize]);
                    }

                    // Non-blocking send; drop if the worker is behind.
                    let _ = tx.try_send(Frame { data, width, height });
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| VigilError::StreamOpenFailed {
                id: camera_id.to_owned(),
                reason: format!("set_state Playing: {e}"),
            })?;

        Ok(FrameSource {
            camera_id: camera_id.to_owned(),
            pipeline,
            rx,
        })
    }

    /// Wait for the first decoded frame after opening.
    ///
    /// Polls up to `max_init_frames` times, `init_frame_wait_ms` apart, then
    /// fails with `NoInitialFrame`.
    pub async fn initial_frame(&mut self, perf: &PerformanceConfig) -> Result<Frame> {
        let wait = Duration::from_millis(perf.init_frame_wait_ms.max(1));
        for _ in 0..perf.max_init_frames.max(1) {
            match timeout(wait, self.rx.recv()).await {
                Ok(Some(frame)) => {
                    info!(
                        camera = self.camera_id,
                        width = frame.width,
                        height = frame.height,
                        "Stream opened"
                    );
                    return Ok(frame);
                }
                Ok(None) => break,
                Err(_) => continue,
            }
        }
        Err(VigilError::NoInitialFrame { id: self.camera_id.clone() })
    }

    /// Receive the next decoded frame, bounded by the read deadline.
    pub async fn next_frame(&mut self) -> ReadOutcome {
        match timeout(READ_TIMEOUT, self.rx.recv()).await {
            Ok(Some(frame)) => ReadOutcome::Frame(frame),
            Ok(None) => ReadOutcome::Eos,
            Err(_) => ReadOutcome::TimedOut,
        }
    }

    /// Stop the pipeline cleanly.
    pub fn stop(&self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}
