use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use rbdvol::rbdvol::config::RemoveAction;
use rbdvol::rbdvol::server::build_router;

use crate::support::{driver_with, FakeRbd};

async fn post_json(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap();
    (status, value)
}

async fn post_empty(app: &Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap();
    (status, value)
}

fn router(fake: Arc<FakeRbd>, root: &std::path::Path, can_create: bool) -> Router {
    build_router(driver_with(fake, root, can_create, RemoveAction::Ignore))
}

#[tokio::test]
async fn activate_announces_the_volume_driver() {
    let root = tempfile::tempdir().unwrap();
    let app = router(FakeRbd::new(), root.path(), false);

    let (status, body) = post_empty(&app, "/Plugin.Activate").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"Implements": ["VolumeDriver"]}));
}

#[tokio::test]
async fn capabilities_scope_is_global() {
    let root = tempfile::tempdir().unwrap();
    let app = router(FakeRbd::new(), root.path(), false);

    let (status, body) = post_empty(&app, "/VolumeDriver.Capabilities").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"Capabilities": {"Scope": "global"}}));
}

#[tokio::test]
async fn create_error_is_a_500_with_the_err_field() {
    let root = tempfile::tempdir().unwrap();
    let app = router(FakeRbd::new(), root.path(), false);

    let (status, body) = post_json(&app, "/VolumeDriver.Create", json!({"Name": "foo"})).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["Err"], json!("Ceph RBD Image not found: foo"));
}

#[tokio::test]
async fn create_success_has_an_empty_err() {
    let root = tempfile::tempdir().unwrap();
    let app = router(FakeRbd::with_images(&["rbd/foo"]), root.path(), false);

    let (status, body) = post_json(&app, "/VolumeDriver.Create", json!({"Name": "foo"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["Err"], json!(""));
}

#[tokio::test]
async fn mount_and_unmount_round_trip_over_the_wire() {
    let root = tempfile::tempdir().unwrap();
    let fake = FakeRbd::with_images(&["rbd/foo"]);
    let app = router(fake.clone(), root.path(), false);

    let (status, body) = post_json(
        &app,
        "/VolumeDriver.Mount",
        json!({"Name": "foo", "ID": "container-1"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let expected = root.path().join("rbd").join("foo");
    assert_eq!(body["Mountpoint"], json!(expected.display().to_string()));
    assert_eq!(body["Err"], json!(""));

    let (status, body) = post_json(
        &app,
        "/VolumeDriver.Unmount",
        json!({"Name": "foo", "ID": "container-1"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["Err"], json!(""));
}

#[tokio::test]
async fn mount_failure_reports_the_pipeline_error() {
    let root = tempfile::tempdir().unwrap();
    let fake = FakeRbd::with_images(&["rbd/foo"]);
    fake.fail_lock.store(true, std::sync::atomic::Ordering::SeqCst);
    let app = router(fake, root.path(), false);

    let (status, body) = post_json(
        &app,
        "/VolumeDriver.Mount",
        json!({"Name": "foo", "ID": "container-1"}),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["Err"], json!("Unable to get Exclusive Lock"));
    assert_eq!(body["Mountpoint"], json!(""));
}

#[tokio::test]
async fn path_answers_without_consulting_the_cluster() {
    let root = tempfile::tempdir().unwrap();
    let fake = FakeRbd::new();
    let app = router(fake.clone(), root.path(), false);

    let (status, body) = post_json(&app, "/VolumeDriver.Path", json!({"Name": "foo"})).await;
    assert_eq!(status, StatusCode::OK);
    let expected = root.path().join("rbd").join("foo");
    assert_eq!(body["Mountpoint"], json!(expected.display().to_string()));
    assert!(fake.calls().is_empty());
}

#[tokio::test]
async fn get_returns_the_volume_envelope() {
    let root = tempfile::tempdir().unwrap();
    let app = router(FakeRbd::with_images(&["rbd/foo"]), root.path(), false);

    let (status, body) = post_json(&app, "/VolumeDriver.Get", json!({"Name": "foo"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["Volume"]["Name"], json!("foo"));
    assert_eq!(body["Err"], json!(""));

    let (status, body) = post_json(&app, "/VolumeDriver.Get", json!({"Name": "missing"})).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["Err"], json!("Image missing does not exist"));
    assert!(body.get("Volume").is_none());
}

#[tokio::test]
async fn list_returns_volumes_with_mountpoints() {
    let root = tempfile::tempdir().unwrap();
    let fake = FakeRbd::with_images(&["rbd/foo"]);
    let app = router(fake, root.path(), false);

    post_json(
        &app,
        "/VolumeDriver.Mount",
        json!({"Name": "foo", "ID": "container-1"}),
    )
    .await;

    let (status, body) = post_empty(&app, "/VolumeDriver.List").await;
    assert_eq!(status, StatusCode::OK);
    let expected = root.path().join("rbd").join("foo");
    assert_eq!(
        body["Volumes"],
        json!([{"Name": "foo", "Mountpoint": expected.display().to_string()}])
    );
}

#[tokio::test]
async fn metrics_render_in_the_text_format() {
    let root = tempfile::tempdir().unwrap();
    let app = router(FakeRbd::new(), root.path(), false);

    // Handle a verb first so the counters exist.
    post_empty(&app, "/VolumeDriver.List").await;

    let request = Request::builder()
        .method("GET")
        .uri("/metrics")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("rbdvol_volume_operations_total"));
}
