//! WebSocket hub: fans motion events out to connected clients.
//!
//! Each client connection runs its own task with a bounded outbound queue.
//! The broadcast pass snapshots the subscriber set, sends outside the lock,
//! and removes clients whose queue is gone or full at the end of the pass;
//! one dead subscriber never blocks delivery to the others.
//!
//! Wire surface:
//!   on connect → `{type:"connection", message, timestamp}`
//!   inbound `{type:"ping"}` → `{type:"pong", timestamp}`
//!   broadcast → `{type:"motion_event", camera_id, motion_detected,
//!                 timestamp, video_path}`
//!   on shutdown → `{type:"server_shutdown"}` then close.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant as TokioInstant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, VigilError};
use crate::events::{EventKind, MotionEvent};

/// Protocol-level keepalive cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Grace allowed for the pong after each ping.
const PONG_DEADLINE: Duration = Duration::from_secs(10);

/// Outbound frames queued per client before it counts as stalled.
const CLIENT_QUEUE_DEPTH: usize = 32;

pub struct WsHub {
    clients: Mutex<HashMap<u64, mpsc::Sender<Message>>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl WsHub {
    pub fn new(shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown,
        })
    }

    /// Bind and serve until the shutdown token fires.
    ///
    /// The given receiver is the single consumer end of the event bus; its
    /// events are fanned out to every connected client.
    pub async fn serve(
        self: Arc<Self>,
        host: &str,
        port: u16,
        mut events: mpsc::Receiver<MotionEvent>,
    ) -> Result<()> {
        let addr = format!("{host}:{port}");
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| VigilError::Config(format!("Cannot bind WebSocket hub on {addr}: {e}")))?;
        info!(addr, "WebSocket hub listening");

        let hub = self.clone();
        let pump = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                hub.broadcast(&event);
            }
        });

        let app = Router::new().route("/", get(ws_handler)).with_state(self.clone());
        let shutdown = self.shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(VigilError::Io)?;

        pump.abort();
        Ok(())
    }

    pub fn subscriber_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Serialize one event and deliver it to every subscriber.
    fn broadcast(&self, event: &MotionEvent) {
        let frame = motion_frame(event).to_string();
        let snapshot: Vec<(u64, mpsc::Sender<Message>)> = self
            .clients
            .lock()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        if snapshot.is_empty() {
            debug!(camera = %event.camera_id, "No subscribers, broadcast skipped");
            return;
        }

        let mut dead = Vec::new();
        for (id, tx) in &snapshot {
            if tx.try_send(Message::Text(frame.clone().into())).is_err() {
                dead.push(*id);
            }
        }

        if !dead.is_empty() {
            let mut clients = self.clients.lock();
            for id in dead {
                clients.remove(&id);
                info!(subscriber = id, "Subscriber removed after write failure");
            }
        }
    }

    async fn handle_client(self: Arc<Self>, socket: WebSocket) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, mut outbound) = mpsc::channel::<Message>(CLIENT_QUEUE_DEPTH);
        let total = {
            let mut clients = self.clients.lock();
            clients.insert(id, tx);
            clients.len()
        };
        info!(subscriber = id, total, "WebSocket client connected");

        let (mut sink, mut source) = socket.split();

        let welcome = serde_json::json!({
            "type": "connection",
            "message": "Connected to motion event stream",
            "timestamp": Utc::now().to_rfc3339(),
        });
        if sink.send(Message::Text(welcome.to_string().into())).await.is_err() {
            self.clients.lock().remove(&id);
            return;
        }

        let mut ping_timer = interval_at(TokioInstant::now() + PING_INTERVAL, PING_INTERVAL);
        let mut last_pong = TokioInstant::now();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    let bye = serde_json::json!({"type": "server_shutdown"});
                    let _ = sink.send(Message::Text(bye.to_string().into())).await;
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                queued = outbound.recv() => match queued {
                    Some(msg) => {
                        if sink.send(msg).await.is_err() {
                            break;
                        }
                    }
                    // Sender side was removed by a broadcast pass.
                    None => break,
                },
                inbound = source.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = control_reply(&text) {
                            if sink.send(Message::Text(reply.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = TokioInstant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(subscriber = id, error = %e, "Socket read failed");
                        break;
                    }
                },
                _ = ping_timer.tick() => {
                    if last_pong.elapsed() > PING_INTERVAL + PONG_DEADLINE {
                        warn!(subscriber = id, "Pong deadline exceeded, dropping client");
                        break;
                    }
                    if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }

        self.clients.lock().remove(&id);
        info!(subscriber = id, "WebSocket client disconnected");
    }
}

async fn ws_handler(
    State(hub): State<Arc<WsHub>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| hub.handle_client(socket))
}

/// Answer `{type:"ping"}` with a pong frame; malformed input is logged and
/// ignored without closing the connection.
fn control_reply(text: &str) -> Option<String> {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(value) => {
            if value.get("type").and_then(|t| t.as_str()) == Some("ping") {
                Some(
                    serde_json::json!({
                        "type": "pong",
                        "timestamp": Utc::now().to_rfc3339(),
                    })
                    .to_string(),
                )
            } else {
                None
            }
        }
        Err(_) => {
            warn!("Ignoring malformed WebSocket frame");
            None
        }
    }
}

fn motion_frame(event: &MotionEvent) -> serde_json::Value {
    serde_json::json!({
        "type": "motion_event",
        "camera_id": event.camera_id,
        "motion_detected": event.kind == EventKind::Start,
        "timestamp": event.timestamp.to_rfc3339(),
        "video_path": event.video_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_hub() -> Arc<WsHub> {
        WsHub::new(CancellationToken::new())
    }

    #[test]
    fn motion_frame_shape_for_start_and_stop() {
        let start = MotionEvent::start("cam1", Some("/rec/cam1/x_chunk%03d.mp4".into()));
        let frame = motion_frame(&start);
        assert_eq!(frame["type"], "motion_event");
        assert_eq!(frame["camera_id"], "cam1");
        assert_eq!(frame["motion_detected"], true);
        assert_eq!(frame["video_path"], "/rec/cam1/x_chunk%03d.mp4");
        assert!(frame["timestamp"].as_str().is_some());

        let stop = MotionEvent::stop("cam1", None);
        let frame = motion_frame(&stop);
        assert_eq!(frame["motion_detected"], false);
        assert!(frame["video_path"].is_null());
    }

    #[test]
    fn ping_gets_pong_and_garbage_is_ignored() {
        let reply = control_reply(r#"{"type":"ping"}"#).expect("pong");
        let value: serde_json::Value = serde_json::from_str(&reply).expect("json");
        assert_eq!(value["type"], "pong");
        assert!(value["timestamp"].as_str().is_some());

        assert!(control_reply("not json at all").is_none());
        assert!(control_reply(r#"{"type":"other"}"#).is_none());
    }

    #[tokio::test]
    async fn dead_subscriber_is_removed_without_affecting_others() {
        let hub = test_hub();

        let (tx_alive, mut rx_alive) = mpsc::channel::<Message>(CLIENT_QUEUE_DEPTH);
        let (tx_dead, rx_dead) = mpsc::channel::<Message>(CLIENT_QUEUE_DEPTH);
        drop(rx_dead);
        {
            let mut clients = hub.clients.lock();
            clients.insert(1, tx_alive);
            clients.insert(2, tx_dead);
        }

        hub.broadcast(&MotionEvent::start("cam1", Some("/rec/a.mp4".into())));

        // The live subscriber received the frame.
        let msg = rx_alive.try_recv().expect("delivered");
        match msg {
            Message::Text(text) => {
                let value: serde_json::Value = serde_json::from_str(&text).expect("json");
                assert_eq!(value["type"], "motion_event");
            }
            other => panic!("unexpected message: {other:?}"),
        }

        // The dead one was removed during the same pass.
        assert_eq!(hub.subscriber_count(), 1);
        assert!(hub.clients.lock().contains_key(&1));
    }

    #[tokio::test]
    async fn per_camera_event_order_is_preserved() {
        let hub = test_hub();
        let (tx, mut rx) = mpsc::channel::<Message>(CLIENT_QUEUE_DEPTH);
        hub.clients.lock().insert(1, tx);

        hub.broadcast(&MotionEvent::start("cam1", Some("/rec/a.mp4".into())));
        hub.broadcast(&MotionEvent::stop("cam1", Some("/rec/a.mp4".into())));

        let kinds: Vec<bool> = (0..2)
            .map(|_| {
                let Ok(Message::Text(text)) = rx.try_recv() else {
                    panic!("expected text frame");
                };
                let value: serde_json::Value = serde_json::from_str(&text).expect("json");
                value["motion_detected"].as_bool().expect("bool")
            })
            .collect();
        assert_eq!(kinds, vec![true, false]);
    }
}
