//! Registry integration tests: add/remove/list lifecycle.
//!
//! Run with: `cargo test`
//!
//! The URLs point at unreachable endpoints on purpose: `add` must succeed
//! synchronously regardless of stream health, and the workers must still
//! observe their stop signal promptly while crash-looping.

use std::sync::Arc;

use vigil::config::Config;
use vigil::error::VigilError;
use vigil::events::{EventBus, MotionEvent};
use vigil::registry::CameraRegistry;

fn test_registry() -> (Arc<CameraRegistry>, tokio::sync::mpsc::Receiver<MotionEvent>) {
    let cfg: Config = toml::from_str("").expect("default config");
    let (bus, rx) = EventBus::channel(16);
    (Arc::new(CameraRegistry::new(Arc::new(cfg), bus)), rx)
}

const DEAD_URL: &str = "rtsp://127.0.0.1:9/stream1";

#[tokio::test(flavor = "multi_thread")]
async fn add_then_delete_round_trip() {
    let (registry, _rx) = test_registry();

    registry.add("C1", DEAD_URL).expect("add");
    let listed = registry.list();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].camera_id, "C1");
    assert_eq!(listed[0].rtsp_url, DEAD_URL);

    registry.delete("C1").await.expect("delete");
    assert!(registry.is_empty(), "registry observably unchanged after round trip");
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_add_is_rejected() {
    let (registry, _rx) = test_registry();

    registry.add("C1", DEAD_URL).expect("first add");
    let err = registry.add("C1", DEAD_URL).unwrap_err();
    assert!(matches!(err, VigilError::AlreadyExists { .. }));
    assert_eq!(registry.len(), 1);

    registry.delete("C1").await.expect("cleanup");
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_unknown_camera_is_not_found() {
    let (registry, _rx) = test_registry();
    let err = registry.delete("ghost").await.unwrap_err();
    assert!(matches!(err, VigilError::NotFound { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn deleted_id_can_be_added_again() {
    let (registry, _rx) = test_registry();

    registry.add("C1", DEAD_URL).expect("add");
    registry.delete("C1").await.expect("delete");
    registry.add("C1", DEAD_URL).expect("re-add after delete");

    registry.delete("C1").await.expect("cleanup");
}

#[tokio::test(flavor = "multi_thread")]
async fn validation_rejects_bad_input() {
    let (registry, _rx) = test_registry();

    assert!(matches!(
        registry.add("", DEAD_URL),
        Err(VigilError::Validation(_))
    ));
    assert!(matches!(
        registry.add("C1", "not a url"),
        Err(VigilError::Validation(_))
    ));
    assert!(matches!(
        registry.add("C1", "ftp://example/stream"),
        Err(VigilError::Validation(_))
    ));
    assert!(registry.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_all_empties_the_registry() {
    let (registry, _rx) = test_registry();

    registry.add("C1", DEAD_URL).expect("add C1");
    registry.add("C2", "file:///nonexistent/clip.mp4").expect("add C2");
    assert_eq!(registry.len(), 2);

    registry.stop_all().await;
    assert!(registry.is_empty());
}
