//! In-process motion event bus.
//!
//! Workers publish [`MotionEvent`]s through a bounded `mpsc` channel whose
//! single consumer is the WebSocket hub. Publishing never blocks the
//! producing worker: when the channel is full a `start` event is dropped
//! with a warning, while a `stop` event is handed off to a spawned task so
//! that every recording session still delivers at least one stop.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Start,
    Stop,
}

/// A motion start/stop notification produced by a camera worker.
#[derive(Debug, Clone)]
pub struct MotionEvent {
    pub camera_id: String,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    /// Segment template path of the recording session, when known.
    pub video_path: Option<String>,
}

impl MotionEvent {
    pub fn start(camera_id: impl Into<String>, video_path: Option<String>) -> Self {
        Self {
            camera_id: camera_id.into(),
            kind: EventKind::Start,
            timestamp: Utc::now(),
            video_path,
        }
    }

    pub fn stop(camera_id: impl Into<String>, video_path: Option<String>) -> Self {
        Self {
            camera_id: camera_id.into(),
            kind: EventKind::Stop,
            timestamp: Utc::now(),
            video_path,
        }
    }
}

/// Cloneable producer half of the event channel.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::Sender<MotionEvent>,
}

impl EventBus {
    /// Create the bus and its single consumer end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<MotionEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Best-effort, non-blocking publish.
    pub fn publish(&self, event: MotionEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                if event.kind == EventKind::Stop {
                    // A stop must not be lost; push it from a detached task
                    // so the worker loop is never stalled.
                    let tx = self.tx.clone();
                    tokio::spawn(async move {
                        if tx.send(event).await.is_err() {
                            warn!("Event channel closed, motion-stop lost");
                        }
                    });
                } else {
                    warn!(camera = %event.camera_id, "Event channel full, motion-start dropped");
                }
            }
            Err(TrySendError::Closed(event)) => {
                warn!(camera = %event.camera_id, "Event channel closed, event dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn publish_delivers_in_order() {
        let (bus, mut rx) = EventBus::channel(8);
        bus.publish(MotionEvent::start("cam1", Some("/tmp/a.mp4".into())));
        bus.publish(MotionEvent::stop("cam1", Some("/tmp/a.mp4".into())));

        let first = rx.recv().await.expect("start");
        let second = rx.recv().await.expect("stop");
        assert_eq!(first.kind, EventKind::Start);
        assert_eq!(second.kind, EventKind::Stop);
        assert_eq!(second.video_path.as_deref(), Some("/tmp/a.mp4"));
    }

    #[tokio::test]
    async fn start_dropped_when_full_but_stop_survives() {
        let (bus, mut rx) = EventBus::channel(1);
        bus.publish(MotionEvent::start("cam1", None));
        // Channel is now full: this start is dropped silently.
        bus.publish(MotionEvent::start("cam2", None));
        // The stop is deferred to a background send instead of being lost.
        bus.publish(MotionEvent::stop("cam1", None));

        let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("recv")
            .expect("event");
        assert_eq!(first.kind, EventKind::Start);
        assert_eq!(first.camera_id, "cam1");

        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("recv")
            .expect("event");
        assert_eq!(second.kind, EventKind::Stop);
        assert_eq!(second.camera_id, "cam1");
    }
}
