//! Camera registry: concurrent map of camera id → running worker.
//!
//! Supports dynamic camera add/remove at runtime. The mutex guards only
//! membership changes; worker lifetimes run outside the lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::config::Config;
use crate::error::{Result, VigilError};
use crate::events::EventBus;
use crate::worker::CameraWorker;

/// How long `delete` waits for a worker to observe its stop signal.
const DELETE_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

const ALLOWED_SCHEMES: &[&str] = &["rtsp", "rtsps", "http", "https", "file"];

struct WorkerEntry {
    rtsp_url: String,
    started_at: Instant,
    cancel: CancellationToken,
    /// Taken by the `delete` that joins the worker; the entry itself stays
    /// in the map until the join resolves.
    handle: Option<JoinHandle<()>>,
}

/// Point-in-time view of one registered camera.
#[derive(Debug, Clone, Serialize)]
pub struct CameraSnapshot {
    pub camera_id: String,
    pub rtsp_url: String,
    pub uptime_seconds: u64,
    pub alive: bool,
}

pub struct CameraRegistry {
    workers: Mutex<HashMap<String, WorkerEntry>>,
    config: Arc<Config>,
    bus: EventBus,
}

impl CameraRegistry {
    pub fn new(config: Arc<Config>, bus: EventBus) -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            config,
            bus,
        }
    }

    /// Register a camera and spawn its worker.
    ///
    /// Returns synchronously; stream startup is asynchronous, so success
    /// here does not mean the stream is healthy.
    pub fn add(&self, camera_id: &str, rtsp_url: &str) -> Result<()> {
        if camera_id.trim().is_empty() {
            return Err(VigilError::Validation("camera_id must not be empty".into()));
        }
        let url = Url::parse(rtsp_url)
            .map_err(|e| VigilError::Validation(format!("Invalid rtsp_url: {e}")))?;
        if !ALLOWED_SCHEMES.contains(&url.scheme()) {
            return Err(VigilError::Validation(format!(
                "Unsupported URL scheme '{}'",
                url.scheme()
            )));
        }

        let mut workers = self.workers.lock();
        if workers.contains_key(camera_id) {
            return Err(VigilError::AlreadyExists { id: camera_id.to_owned() });
        }

        let cancel = CancellationToken::new();
        let worker = CameraWorker::new(
            camera_id,
            rtsp_url,
            self.config.clone(),
            self.bus.clone(),
        );
        let handle = worker.spawn(cancel.clone());

        workers.insert(
            camera_id.to_owned(),
            WorkerEntry {
                rtsp_url: rtsp_url.to_owned(),
                started_at: Instant::now(),
                cancel,
                handle: Some(handle),
            },
        );
        info!(camera = camera_id, url = rtsp_url, "Camera registered");
        Ok(())
    }

    /// Stop and remove a camera.
    ///
    /// Raises the worker's stop signal and waits up to 10 s for the loop to
    /// observe it; a worker that ignores the deadline is aborted with a
    /// warning. The entry stays in the map until the join resolves, so a
    /// concurrent `add` of the same id fails with `AlreadyExists` instead
    /// of racing a second worker into existence.
    pub async fn delete(&self, camera_id: &str) -> Result<()> {
        let (cancel, handle) = {
            let mut workers = self.workers.lock();
            let Some(entry) = workers.get_mut(camera_id) else {
                return Err(VigilError::NotFound { id: camera_id.to_owned() });
            };
            (entry.cancel.clone(), entry.handle.take())
        };

        cancel.cancel();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            match tokio::time::timeout(DELETE_JOIN_TIMEOUT, handle).await {
                Ok(_) => info!(camera = camera_id, "Camera removed"),
                Err(_) => {
                    warn!(camera = camera_id, "Worker did not stop within timeout, aborting");
                    abort.abort();
                }
            }
        }

        self.workers.lock().remove(camera_id);
        Ok(())
    }

    /// Snapshot of all registered cameras.
    pub fn list(&self) -> Vec<CameraSnapshot> {
        self.workers
            .lock()
            .iter()
            .map(|(id, entry)| CameraSnapshot {
                camera_id: id.clone(),
                rtsp_url: entry.rtsp_url.clone(),
                uptime_seconds: entry.started_at.elapsed().as_secs(),
                alive: entry.handle.as_ref().is_some_and(|h| !h.is_finished()),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.lock().is_empty()
    }

    /// Delete every camera; used during process shutdown.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.workers.lock().keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.delete(&id).await {
                warn!(camera = id, error = %e, "Failed to stop camera during shutdown");
            }
        }
    }
}
