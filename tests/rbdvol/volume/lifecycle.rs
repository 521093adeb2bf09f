use std::sync::atomic::Ordering;

use rbdvol::rbdvol::config::RemoveAction;
use rbdvol::rbdvol::rbd::is_device_busy;

use crate::support::{driver_with, FakeRbd};

#[tokio::test]
async fn mount_then_unmount_reverses_the_forward_sequence() {
    let root = tempfile::tempdir().unwrap();
    let fake = FakeRbd::with_images(&["rbd/foo"]);
    let driver = driver_with(fake.clone(), root.path(), false, RemoveAction::Ignore);

    let mountpoint = driver.mount("foo", "container-1").await.unwrap();
    assert_eq!(mountpoint, root.path().join("rbd").join("foo"));
    assert!(mountpoint.is_dir());
    assert_eq!(
        fake.calls(),
        vec![
            "lock rbd/foo",
            "map rbd/foo",
            "detect /dev/rbd/rbd/foo",
            "verify /dev/rbd/rbd/foo",
            "mount /dev/rbd/rbd/foo",
        ]
    );

    fake.clear_calls();
    driver.unmount("foo", "container-1").await.unwrap();
    assert_eq!(
        fake.calls(),
        vec![
            "unmount /dev/rbd/rbd/foo",
            "unmap /dev/rbd/rbd/foo",
            "unlock rbd/foo",
        ]
    );

    // The registry forgot the volume: a second unmount is a silent no-op.
    fake.clear_calls();
    driver.unmount("foo", "container-1").await.unwrap();
    assert!(fake.calls().is_empty());
}

#[tokio::test]
async fn failed_lock_makes_no_further_calls() {
    let root = tempfile::tempdir().unwrap();
    let fake = FakeRbd::with_images(&["rbd/foo"]);
    fake.fail_lock.store(true, Ordering::SeqCst);
    let driver = driver_with(fake.clone(), root.path(), false, RemoveAction::Ignore);

    let err = driver.mount("foo", "container-1").await.unwrap_err();
    assert_eq!(err.to_string(), "Unable to get Exclusive Lock");
    assert_eq!(fake.calls(), vec!["lock rbd/foo"]);
}

#[tokio::test]
async fn failed_map_releases_the_lock() {
    let root = tempfile::tempdir().unwrap();
    let fake = FakeRbd::with_images(&["rbd/foo"]);
    fake.fail_map.store(true, Ordering::SeqCst);
    let driver = driver_with(fake.clone(), root.path(), false, RemoveAction::Ignore);

    let err = driver.mount("foo", "container-1").await.unwrap_err();
    assert_eq!(err.to_string(), "Unable to map kernel device");
    assert_eq!(fake.calls(), vec!["lock rbd/foo", "map rbd/foo", "unlock rbd/foo"]);
}

#[tokio::test]
async fn failed_mount_compensates_in_reverse_order() {
    let root = tempfile::tempdir().unwrap();
    let fake = FakeRbd::with_images(&["rbd/foo"]);
    fake.fail_mount.store(true, Ordering::SeqCst);
    let driver = driver_with(fake.clone(), root.path(), false, RemoveAction::Ignore);

    let err = driver.mount("foo", "container-1").await.unwrap_err();
    assert_eq!(err.to_string(), "Unable to mount device");
    assert_eq!(
        fake.calls(),
        vec![
            "lock rbd/foo",
            "map rbd/foo",
            "detect /dev/rbd/rbd/foo",
            "verify /dev/rbd/rbd/foo",
            "mount /dev/rbd/rbd/foo",
            "unmap /dev/rbd/rbd/foo",
            "unlock rbd/foo",
        ]
    );

    // No residue: an unmount for the failed mount is a silent no-op.
    fake.clear_calls();
    driver.unmount("foo", "container-1").await.unwrap();
    assert!(fake.calls().is_empty());
}

#[tokio::test]
async fn failed_verification_unmaps_and_unlocks() {
    let root = tempfile::tempdir().unwrap();
    let fake = FakeRbd::with_images(&["rbd/foo"]);
    fake.fail_verify.store(true, Ordering::SeqCst);
    let driver = driver_with(fake.clone(), root.path(), false, RemoveAction::Ignore);

    let err = driver.mount("foo", "container-1").await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Image filesystem has errors, requires manual repairs"
    );
    assert_eq!(
        fake.calls(),
        vec![
            "lock rbd/foo",
            "map rbd/foo",
            "detect /dev/rbd/rbd/foo",
            "verify /dev/rbd/rbd/foo",
            "unmap /dev/rbd/rbd/foo",
            "unlock rbd/foo",
        ]
    );
}

#[tokio::test]
async fn undetectable_fstype_falls_back_to_the_default() {
    let root = tempfile::tempdir().unwrap();
    let fake = FakeRbd::with_images(&["rbd/foo"]);
    fake.fail_detect.store(true, Ordering::SeqCst);
    let driver = driver_with(fake.clone(), root.path(), false, RemoveAction::Ignore);

    driver.mount("foo", "container-1").await.unwrap();
    assert_eq!(
        fake.calls(),
        vec![
            "lock rbd/foo",
            "map rbd/foo",
            "detect /dev/rbd/rbd/foo",
            "verify /dev/rbd/rbd/foo",
            "mount /dev/rbd/rbd/foo",
        ]
    );
}

#[tokio::test]
async fn unmount_with_mismatched_client_id_is_a_noop() {
    let root = tempfile::tempdir().unwrap();
    let fake = FakeRbd::with_images(&["rbd/foo"]);
    let driver = driver_with(fake.clone(), root.path(), false, RemoveAction::Ignore);

    driver.mount("foo", "container-1").await.unwrap();
    fake.clear_calls();

    driver.unmount("foo", "other-container").await.unwrap();
    assert!(fake.calls().is_empty());

    // The registry still owns the mount: the right client can tear it down.
    driver.unmount("foo", "container-1").await.unwrap();
    assert_eq!(
        fake.calls(),
        vec![
            "unmount /dev/rbd/rbd/foo",
            "unmap /dev/rbd/rbd/foo",
            "unlock rbd/foo",
        ]
    );
}

#[tokio::test]
async fn unmount_of_unknown_volume_succeeds_without_calls() {
    let root = tempfile::tempdir().unwrap();
    let fake = FakeRbd::with_images(&["rbd/foo"]);
    let driver = driver_with(fake.clone(), root.path(), false, RemoveAction::Ignore);

    driver.unmount("foo", "container-1").await.unwrap();
    assert!(fake.calls().is_empty());
}

#[tokio::test]
async fn busy_unmap_aborts_teardown_and_keeps_the_record() {
    let root = tempfile::tempdir().unwrap();
    let fake = FakeRbd::with_images(&["rbd/foo"]);
    let driver = driver_with(fake.clone(), root.path(), false, RemoveAction::Ignore);

    driver.mount("foo", "container-1").await.unwrap();
    fake.busy_unmap.store(true, Ordering::SeqCst);
    fake.clear_calls();

    let err = driver.unmount("foo", "container-1").await.unwrap_err();
    assert!(is_device_busy(err.as_ref()));
    // Teardown stopped at the unmap: no unlock.
    assert_eq!(
        fake.calls(),
        vec!["unmount /dev/rbd/rbd/foo", "unmap /dev/rbd/rbd/foo"]
    );

    // Once the device frees up, the record is still there to finish the job.
    fake.busy_unmap.store(false, Ordering::SeqCst);
    fake.clear_calls();
    driver.unmount("foo", "container-1").await.unwrap();
    assert_eq!(
        fake.calls(),
        vec![
            "unmount /dev/rbd/rbd/foo",
            "unmap /dev/rbd/rbd/foo",
            "unlock rbd/foo",
        ]
    );
}

#[tokio::test]
async fn unmount_accumulates_errors_but_finishes_teardown() {
    let root = tempfile::tempdir().unwrap();
    let fake = FakeRbd::with_images(&["rbd/foo"]);
    let driver = driver_with(fake.clone(), root.path(), false, RemoveAction::Ignore);

    driver.mount("foo", "container-1").await.unwrap();
    fake.fail_unmount.store(true, Ordering::SeqCst);
    fake.fail_unlock.store(true, Ordering::SeqCst);
    fake.clear_calls();

    let err = driver.unmount("foo", "container-1").await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Error unmounting device, Error unlocking image"
    );
    assert_eq!(
        fake.calls(),
        vec![
            "unmount /dev/rbd/rbd/foo",
            "unmap /dev/rbd/rbd/foo",
            "unlock rbd/foo",
        ]
    );

    // The record is gone despite the errors.
    fake.clear_calls();
    driver.unmount("foo", "container-1").await.unwrap();
    assert!(fake.calls().is_empty());
}
