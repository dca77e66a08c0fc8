//! End-to-end lifecycle tests against in-memory fakes of every port

mod common;

use assert_matches::assert_matches;
use common::{credentials, Harness};
use s3_volume_agent::domain::ports::{AccessMode, VolumeCapability};
use s3_volume_agent::driver::{
    CreateVolumeRequest, DeleteVolumeRequest, PublishVolumeRequest, StageVolumeRequest,
    UnpublishVolumeRequest, UnstageVolumeRequest, ValidateCapabilitiesRequest,
};
use s3_volume_agent::mounter::s3fs::credential_file;
use s3_volume_agent::mounter::unit_name;
use s3_volume_agent::Error;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::Ordering;

fn capability() -> VolumeCapability {
    VolumeCapability {
        access_mode: AccessMode::MultiNodeMultiWriter,
        mount_flags: Vec::new(),
    }
}

fn create_request(name: &str, parameters: &[(&str, &str)]) -> CreateVolumeRequest {
    CreateVolumeRequest {
        name: name.into(),
        capacity_bytes: 1 << 30,
        parameters: parameters
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        volume_capabilities: vec![capability()],
        credentials: credentials(),
    }
}

fn stage_request(
    volume_id: &str,
    staging: &Path,
    context: &BTreeMap<String, String>,
) -> StageVolumeRequest {
    StageVolumeRequest {
        volume_id: volume_id.into(),
        staging_target_path: staging.to_path_buf(),
        volume_capability: Some(capability()),
        volume_context: context.clone(),
        credentials: credentials(),
    }
}

fn publish_request(
    volume_id: &str,
    staging: &Path,
    target: &Path,
    context: &BTreeMap<String, String>,
) -> PublishVolumeRequest {
    PublishVolumeRequest {
        volume_id: volume_id.into(),
        staging_target_path: staging.to_path_buf(),
        target_path: target.to_path_buf(),
        volume_capability: Some(capability()),
        readonly: false,
        volume_context: context.clone(),
        credentials: credentials(),
    }
}

fn unstage_request(volume_id: &str, staging: &Path) -> UnstageVolumeRequest {
    UnstageVolumeRequest {
        volume_id: volume_id.into(),
        staging_target_path: staging.to_path_buf(),
    }
}

fn mounter_context(mounter: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("mounter".to_string(), mounter.to_string())])
}

// =============================================================================
// Round trip
// =============================================================================

#[tokio::test]
async fn test_round_trip_leaves_nothing_behind() {
    let h = Harness::new();
    let staging = h.path("stage");
    let target = h.path("pods/target");

    let volume = h.driver.create_volume(&create_request("a", &[])).await.unwrap();
    assert_eq!(volume.volume_id, "a");
    assert_eq!(volume.volume_context.get("capacity").map(String::as_str), Some("1073741824"));
    assert_eq!(h.store.keys("a"), Some(vec![]));

    h.driver
        .stage_volume(&stage_request(&volume.volume_id, &staging, &volume.volume_context))
        .await
        .unwrap();
    assert!(h.host.is_mounted(&staging));
    assert_eq!(h.host.units.lock().len(), 1);

    h.driver
        .publish_volume(&publish_request(
            &volume.volume_id,
            &staging,
            &target,
            &volume.volume_context,
        ))
        .await
        .unwrap();
    assert!(h.host.is_mounted(&target));

    // Workload writes
    h.store.put("a", "dir/file-1");
    h.store.put("a", "file-2");

    h.driver
        .unpublish_volume(&UnpublishVolumeRequest {
            volume_id: volume.volume_id.clone(),
            target_path: target.clone(),
        })
        .await
        .unwrap();
    h.driver
        .unstage_volume(&unstage_request(&volume.volume_id, &staging))
        .await
        .unwrap();
    h.driver
        .delete_volume(&DeleteVolumeRequest {
            volume_id: volume.volume_id.clone(),
            credentials: credentials(),
        })
        .await
        .unwrap();

    assert_eq!(h.store.keys("a"), None);
    assert!(h.host.units.lock().is_empty());
    assert!(h.host.mounts.lock().is_empty());
    assert!(h.host.processes.lock().is_empty());
    assert_eq!(h.metrics.unmounts.with_label_values(&["unit"]).get(), 1);
}

#[tokio::test]
async fn test_direct_backends_round_trip() {
    for mounter in ["s3fs", "rclone", "goofys"] {
        let h = Harness::new();
        let staging = h.path("stage");
        let context = mounter_context(mounter);

        h.driver
            .stage_volume(&stage_request("data/pvc-1", &staging, &context))
            .await
            .unwrap();
        assert!(h.host.is_mounted(&staging), "{} did not mount", mounter);
        assert!(h.host.units.lock().is_empty(), "{} started a unit", mounter);
        assert_eq!(h.host.commands.lock()[0].program, mounter);

        h.driver
            .unstage_volume(&unstage_request("data/pvc-1", &staging))
            .await
            .unwrap();
        assert!(h.host.mounts.lock().is_empty());
        assert!(h.host.processes.lock().is_empty());
        assert_eq!(h.metrics.unmounts.with_label_values(&["process"]).get(), 1);
    }
}

// =============================================================================
// Idempotence and conflicts
// =============================================================================

#[tokio::test]
async fn test_stage_twice_starts_one_unit() {
    let h = Harness::new();
    let staging = h.path("stage");
    let context = BTreeMap::new();

    for _ in 0..2 {
        h.driver
            .stage_volume(&stage_request("data/pvc-1", &staging, &context))
            .await
            .unwrap();
    }

    assert_eq!(h.host.started_units.lock().len(), 1);
    assert_eq!(h.host.units.lock().len(), 1);
    assert!(h
        .host
        .units
        .lock()
        .contains_key(&unit_name("geesefs", "data/pvc-1")));
}

#[tokio::test]
async fn test_stage_to_second_path_conflicts() {
    let h = Harness::new();
    let context = BTreeMap::new();

    h.driver
        .stage_volume(&stage_request("data/pvc-1", &h.path("stage-a"), &context))
        .await
        .unwrap();
    let err = h
        .driver
        .stage_volume(&stage_request("data/pvc-1", &h.path("stage-b"), &context))
        .await
        .unwrap_err();

    assert_matches!(err, Error::Conflict { .. });
    assert_eq!(h.host.started_units.lock().len(), 1);
    assert!(!h.host.is_mounted(&h.path("stage-b")));
}

#[tokio::test]
async fn test_publish_twice_is_noop() {
    let h = Harness::new();
    let staging = h.path("stage");
    let target = h.path("target");
    let context = BTreeMap::new();

    h.driver
        .stage_volume(&stage_request("data/pvc-1", &staging, &context))
        .await
        .unwrap();
    let mut request = publish_request("data/pvc-1", &staging, &target, &context);
    request.readonly = true;
    h.driver.publish_volume(&request).await.unwrap();
    h.driver.publish_volume(&request).await.unwrap();

    assert_eq!(h.host.mounts.lock().get(&target), Some(&true));
    assert_eq!(h.host.started_units.lock().len(), 1);
}

#[tokio::test]
async fn test_unpublish_and_unstage_unmounted_paths() {
    for mounter in ["geesefs", "s3fs", "rclone", "goofys"] {
        let h = Harness::with_config(|config| config.driver.default_mounter = mounter.into());

        h.driver
            .unpublish_volume(&UnpublishVolumeRequest {
                volume_id: "data/pvc-1".into(),
                target_path: h.path("never-published"),
            })
            .await
            .unwrap();
        h.driver
            .unstage_volume(&unstage_request("data/pvc-1", &h.path("never-staged")))
            .await
            .unwrap();

        assert_eq!(
            h.metrics
                .unmounts
                .with_label_values(&["already_unmounted"])
                .get(),
            1,
            "{}",
            mounter
        );
    }
}

// =============================================================================
// Failure handling
// =============================================================================

#[tokio::test]
async fn test_stage_timeout_leaves_no_stale_unit() {
    let h = Harness::new();
    let staging = h.path("stage");
    let context = BTreeMap::new();

    h.host.healthy.store(false, Ordering::SeqCst);
    let err = h
        .driver
        .stage_volume(&stage_request("data/pvc-1", &staging, &context))
        .await
        .unwrap_err();
    assert_matches!(err, Error::Timeout { .. });
    assert!(h.host.units.lock().is_empty());
    assert_eq!(
        h.metrics
            .mounts
            .with_label_values(&["geesefs", "none", "failure"])
            .get(),
        1
    );

    h.host.healthy.store(true, Ordering::SeqCst);
    h.driver
        .stage_volume(&stage_request("data/pvc-1", &staging, &context))
        .await
        .unwrap();
    assert!(h.host.is_mounted(&staging));
    assert_eq!(h.host.started_units.lock().len(), 2);
}

#[tokio::test]
async fn test_unreachable_service_manager_runs_directly() {
    let h = Harness::new();
    let staging = h.path("stage");
    h.host.available.store(false, Ordering::SeqCst);

    h.driver
        .stage_volume(&stage_request("data/pvc-1", &staging, &BTreeMap::new()))
        .await
        .unwrap();

    assert!(h.host.units.lock().is_empty());
    assert_eq!(h.host.commands.lock()[0].program, "geesefs");
    assert_eq!(
        h.metrics
            .mounts
            .with_label_values(&["geesefs", "direct", "success"])
            .get(),
        1
    );
}

#[tokio::test]
async fn test_publish_revives_dead_staging_mount() {
    let h = Harness::new();
    let staging = h.path("stage");
    let target = h.path("target");
    let context = BTreeMap::new();

    h.driver
        .stage_volume(&stage_request("data/pvc-1", &staging, &context))
        .await
        .unwrap();
    h.host.crash_unit(&unit_name("geesefs", "data/pvc-1"));
    assert!(!h.host.is_mounted(&staging));

    h.driver
        .publish_volume(&publish_request("data/pvc-1", &staging, &target, &context))
        .await
        .unwrap();

    assert!(h.host.is_mounted(&staging));
    assert!(h.host.is_mounted(&target));
    assert_eq!(h.host.started_units.lock().len(), 2);
}

#[tokio::test]
async fn test_dead_staging_endpoint_is_an_error() {
    let h = Harness::new();
    let staging = h.path("stage");
    let target = h.path("target");
    let context = BTreeMap::new();

    h.driver
        .stage_volume(&stage_request("data/pvc-1", &staging, &context))
        .await
        .unwrap();
    h.host.crash_unit(&unit_name("geesefs", "data/pvc-1"));
    h.host.kill_endpoint(&staging);

    let err = h
        .driver
        .stage_volume(&stage_request("data/pvc-1", &staging, &context))
        .await
        .unwrap_err();
    assert_matches!(err, Error::MountFailed { .. });
    let err = h
        .driver
        .publish_volume(&publish_request("data/pvc-1", &staging, &target, &context))
        .await
        .unwrap_err();
    assert_matches!(err, Error::MountFailed { .. });
    assert!(!h.host.is_mounted(&target));
    assert_eq!(h.host.started_units.lock().len(), 1);

    // Unstage clears the dead endpoint, after which staging works again
    h.driver
        .unstage_volume(&unstage_request("data/pvc-1", &staging))
        .await
        .unwrap();
    assert!(h.host.dead.lock().is_empty());
    h.driver
        .stage_volume(&stage_request("data/pvc-1", &staging, &context))
        .await
        .unwrap();
    assert!(h.host.is_mounted(&staging));
}

#[tokio::test]
async fn test_unstage_removes_s3fs_credentials() {
    let h = Harness::new();
    let staging = h.path("stage");
    let secret = credential_file(&h.path("secrets"), "data/pvc-1");

    h.driver
        .stage_volume(&stage_request("data/pvc-1", &staging, &mounter_context("s3fs")))
        .await
        .unwrap();
    assert_eq!(std::fs::read_to_string(&secret).unwrap(), "AKIA:secret");

    h.driver
        .unstage_volume(&unstage_request("data/pvc-1", &staging))
        .await
        .unwrap();
    assert!(!secret.exists());
    assert!(h.host.processes.lock().is_empty());
}

#[tokio::test]
async fn test_stage_rejects_incomplete_requests() {
    let h = Harness::new();
    let mut request = stage_request("data/pvc-1", &h.path("stage"), &BTreeMap::new());
    request.volume_capability = None;
    assert_matches!(
        h.driver.stage_volume(&request).await,
        Err(Error::InvalidArgument(_))
    );

    let request = stage_request("", &h.path("stage"), &BTreeMap::new());
    assert_matches!(
        h.driver.stage_volume(&request).await,
        Err(Error::InvalidArgument(_))
    );
    assert!(h.host.started_units.lock().is_empty());
}

// =============================================================================
// Controller
// =============================================================================

#[tokio::test]
async fn test_prefix_volume_create_and_delete() {
    let h = Harness::new();

    let volume = h
        .driver
        .create_volume(&create_request("PVC-1", &[("bucket", "shared")]))
        .await
        .unwrap();
    assert_eq!(volume.volume_id, "shared/pvc-1");
    assert_eq!(volume.volume_context.get("bucket").map(String::as_str), Some("shared"));
    assert_eq!(h.store.keys("shared"), Some(vec!["pvc-1/".to_string()]));

    h.store.put("shared", "pvc-1/data.bin");
    h.store.put("shared", "pvc-10/other.bin");

    h.driver
        .delete_volume(&DeleteVolumeRequest {
            volume_id: volume.volume_id,
            credentials: credentials(),
        })
        .await
        .unwrap();
    assert_eq!(h.store.keys("shared"), Some(vec!["pvc-10/other.bin".to_string()]));
}

#[tokio::test]
async fn test_delete_falls_back_to_per_object() {
    let h = Harness::new();
    for i in 0..50 {
        h.store.put("bulk", &format!("obj-{}", i));
    }
    h.store.fail_batches.store(true, Ordering::SeqCst);

    h.driver
        .delete_volume(&DeleteVolumeRequest {
            volume_id: "bulk".into(),
            credentials: credentials(),
        })
        .await
        .unwrap();

    assert_eq!(h.store.keys("bulk"), None);
    assert_eq!(h.metrics.eradication_fallbacks.get(), 1);
    assert_eq!(
        h.metrics
            .eradicated_objects
            .with_label_values(&["per_object"])
            .get(),
        50
    );
}

#[tokio::test]
async fn test_delete_missing_volume_succeeds() {
    let h = Harness::new();
    for volume_id in ["gone", "gone/pvc-1"] {
        h.driver
            .delete_volume(&DeleteVolumeRequest {
                volume_id: volume_id.into(),
                credentials: credentials(),
            })
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_validate_capabilities() {
    let h = Harness::new();
    h.driver.create_volume(&create_request("data", &[])).await.unwrap();

    let confirmed = h
        .driver
        .validate_volume_capabilities(&ValidateCapabilitiesRequest {
            volume_id: "data".into(),
            volume_capabilities: vec![capability()],
            credentials: credentials(),
        })
        .await
        .unwrap();
    assert!(confirmed.confirmed.is_some());

    let refused = h
        .driver
        .validate_volume_capabilities(&ValidateCapabilitiesRequest {
            volume_id: "data".into(),
            volume_capabilities: vec![VolumeCapability {
                access_mode: AccessMode::SingleNodeWriter,
                mount_flags: Vec::new(),
            }],
            credentials: credentials(),
        })
        .await
        .unwrap();
    assert!(refused.confirmed.is_none());
    assert!(refused.message.is_some());

    let err = h
        .driver
        .validate_volume_capabilities(&ValidateCapabilitiesRequest {
            volume_id: "missing/pvc-1".into(),
            volume_capabilities: vec![capability()],
            credentials: credentials(),
        })
        .await
        .unwrap_err();
    assert_matches!(err, Error::NotFound(_));
}

#[tokio::test]
async fn test_create_requires_credentials() {
    let h = Harness::new();
    let mut request = create_request("data", &[]);
    request.credentials.secrets.clear();
    assert_matches!(
        h.driver.create_volume(&request).await,
        Err(Error::InvalidArgument(_))
    );
    assert_eq!(h.store.keys("data"), None);
}
