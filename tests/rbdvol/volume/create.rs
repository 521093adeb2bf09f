use std::collections::HashMap;
use std::sync::atomic::Ordering;

use rbdvol::rbdvol::config::RemoveAction;

use crate::support::{driver_with, FakeRbd};

fn opts(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn create_of_existing_image_is_idempotent() {
    let root = tempfile::tempdir().unwrap();
    let fake = FakeRbd::with_images(&["rbd/foo"]);
    let driver = driver_with(fake.clone(), root.path(), false, RemoveAction::Ignore);

    driver.create("foo", &HashMap::new()).await.unwrap();
    assert_eq!(fake.calls(), vec!["exists rbd/foo"]);
}

#[tokio::test]
async fn create_without_the_create_flag_rejects_missing_images() {
    let root = tempfile::tempdir().unwrap();
    let fake = FakeRbd::new();
    let driver = driver_with(fake.clone(), root.path(), false, RemoveAction::Ignore);

    let err = driver.create("foo", &HashMap::new()).await.unwrap_err();
    assert_eq!(err.to_string(), "Ceph RBD Image not found: foo");
    assert_eq!(fake.calls(), vec!["exists rbd/foo"]);
}

#[tokio::test]
async fn create_provisions_with_name_and_option_overrides() {
    let root = tempfile::tempdir().unwrap();
    let fake = FakeRbd::new();
    let driver = driver_with(fake.clone(), root.path(), true, RemoveAction::Ignore);

    driver.create("foo@1024", &HashMap::new()).await.unwrap();
    assert_eq!(
        fake.calls(),
        vec!["exists rbd/foo", "create rbd/foo 1024 xfs"]
    );
    assert!(fake.has_image("rbd", "foo"));

    fake.clear_calls();
    driver
        .create(
            "bar",
            &opts(&[("pool", "ssd"), ("size", "2048"), ("fstype", "ext4")]),
        )
        .await
        .unwrap();
    assert_eq!(
        fake.calls(),
        vec!["exists ssd/bar", "create ssd/bar 2048 ext4"]
    );
}

#[tokio::test]
async fn create_with_unparseable_size_option_uses_the_default() {
    let root = tempfile::tempdir().unwrap();
    let fake = FakeRbd::new();
    let driver = driver_with(fake.clone(), root.path(), true, RemoveAction::Ignore);

    driver
        .create("foo", &opts(&[("size", "lots")]))
        .await
        .unwrap();
    assert_eq!(
        fake.calls(),
        vec!["exists rbd/foo", "create rbd/foo 20480 xfs"]
    );
}

#[tokio::test]
async fn create_failure_is_reported_with_the_image_name() {
    let root = tempfile::tempdir().unwrap();
    let fake = FakeRbd::new();
    fake.fail_create.store(true, Ordering::SeqCst);
    let driver = driver_with(fake.clone(), root.path(), true, RemoveAction::Ignore);

    let err = driver.create("foo", &HashMap::new()).await.unwrap_err();
    assert!(
        err.to_string()
            .starts_with("Unable to create Ceph RBD Image(foo):"),
        "unexpected error: {err}"
    );
}

#[tokio::test]
async fn remove_with_delete_action_destroys_and_unlocks() {
    let root = tempfile::tempdir().unwrap();
    let fake = FakeRbd::with_images(&["rbd/foo"]);
    let driver = driver_with(fake.clone(), root.path(), false, RemoveAction::Delete);

    driver.remove("foo").await.unwrap();
    assert_eq!(
        fake.calls(),
        vec![
            "exists rbd/foo",
            "lock rbd/foo",
            "remove rbd/foo",
            "unlock rbd/foo",
        ]
    );
    assert!(!fake.has_image("rbd", "foo"));
}

#[tokio::test]
async fn remove_with_rename_action_parks_the_image_and_unlocks_the_new_name() {
    let root = tempfile::tempdir().unwrap();
    let fake = FakeRbd::with_images(&["rbd/foo"]);
    let driver = driver_with(fake.clone(), root.path(), false, RemoveAction::Rename);

    driver.remove("foo").await.unwrap();
    assert_eq!(
        fake.calls(),
        vec![
            "exists rbd/foo",
            "lock rbd/foo",
            "rename rbd/foo zz_foo",
            "unlock rbd/zz_foo",
        ]
    );
    assert!(fake.has_image("rbd", "zz_foo"));
}

#[tokio::test]
async fn remove_with_ignore_action_leaves_the_image_alone() {
    let root = tempfile::tempdir().unwrap();
    let fake = FakeRbd::with_images(&["rbd/foo"]);
    let driver = driver_with(fake.clone(), root.path(), false, RemoveAction::Ignore);

    driver.remove("foo").await.unwrap();
    assert_eq!(
        fake.calls(),
        vec!["exists rbd/foo", "lock rbd/foo", "unlock rbd/foo"]
    );
    assert!(fake.has_image("rbd", "foo"));
}

#[tokio::test]
async fn remove_of_missing_image_is_not_found() {
    let root = tempfile::tempdir().unwrap();
    let fake = FakeRbd::new();
    let driver = driver_with(fake.clone(), root.path(), false, RemoveAction::Delete);

    let err = driver.remove("foo").await.unwrap_err();
    assert_eq!(err.to_string(), "Ceph RBD Image not found: foo");
    assert_eq!(fake.calls(), vec!["exists rbd/foo"]);
}

#[tokio::test]
async fn remove_with_denied_lock_touches_nothing() {
    let root = tempfile::tempdir().unwrap();
    let fake = FakeRbd::with_images(&["rbd/foo"]);
    fake.fail_lock.store(true, Ordering::SeqCst);
    let driver = driver_with(fake.clone(), root.path(), false, RemoveAction::Delete);

    let err = driver.remove("foo").await.unwrap_err();
    assert_eq!(err.to_string(), "Unable to lock image for remove: foo");
    assert!(fake.has_image("rbd", "foo"));
    assert_eq!(fake.calls(), vec!["exists rbd/foo", "lock rbd/foo"]);
}

#[tokio::test]
async fn get_reports_mountpoint_only_for_mounted_volumes() {
    let root = tempfile::tempdir().unwrap();
    let fake = FakeRbd::with_images(&["rbd/foo"]);
    let driver = driver_with(fake.clone(), root.path(), false, RemoveAction::Ignore);

    let status = driver.get("foo").await.unwrap();
    assert_eq!(status.name, "foo");
    assert!(status.mountpoint.is_none());

    driver.mount("foo", "container-1").await.unwrap();
    let status = driver.get("foo").await.unwrap();
    assert_eq!(
        status.mountpoint.as_deref(),
        Some(root.path().join("rbd").join("foo").as_path())
    );
}

#[tokio::test]
async fn get_drops_stale_records_for_vanished_images() {
    let root = tempfile::tempdir().unwrap();
    let fake = FakeRbd::with_images(&["rbd/foo"]);
    let driver = driver_with(fake.clone(), root.path(), false, RemoveAction::Ignore);

    driver.mount("foo", "container-1").await.unwrap();
    fake.drop_image("rbd", "foo");

    let err = driver.get("foo").await.unwrap_err();
    assert_eq!(err.to_string(), "Image foo does not exist");

    // The stale record is gone: once the image reappears, Get no longer
    // claims it is mounted here.
    fake.add_image("rbd", "foo");
    let status = driver.get("foo").await.unwrap();
    assert!(status.mountpoint.is_none());
}

#[tokio::test]
async fn list_covers_the_default_pool_and_marks_mounts() {
    let root = tempfile::tempdir().unwrap();
    let fake = FakeRbd::with_images(&["rbd/bar", "rbd/foo", "ssd/other"]);
    let driver = driver_with(fake.clone(), root.path(), false, RemoveAction::Ignore);

    driver.mount("foo", "container-1").await.unwrap();

    let statuses = driver.list().await.unwrap();
    let names: Vec<&str> = statuses.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["bar", "foo"]);
    assert!(statuses[0].mountpoint.is_none());
    assert_eq!(
        statuses[1].mountpoint.as_deref(),
        Some(root.path().join("rbd").join("foo").as_path())
    );
}

#[tokio::test]
async fn path_is_computed_without_touching_the_backend() {
    let root = tempfile::tempdir().unwrap();
    let fake = FakeRbd::new();
    let driver = driver_with(fake.clone(), root.path(), false, RemoveAction::Ignore);

    let path = driver.path("liverpool/foo").unwrap();
    assert_eq!(path, root.path().join("liverpool").join("foo"));
    assert!(fake.calls().is_empty());

    assert!(driver.path("not a name").is_err());
}
