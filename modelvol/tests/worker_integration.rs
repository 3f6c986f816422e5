//! Integration tests for the pull/delete engine: single-flight,
//! cancellation on delete, timeouts, conflicts, and failure cleanup.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use common::{default_layers, driver, driver_with_config, image_params, FakeBackend, MODEL_REFERENCE};
use modelvol::api::MountRequest;
use modelvol::config::{Config, Size};
use modelvol::status::State;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_share_one_pull() {
    let root = TempDir::new().unwrap();
    let d = Arc::new(driver(
        root.path(),
        FakeBackend::new().with_delay(Duration::from_millis(50)),
    ));

    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let d = d.clone();
            tokio::spawn(async move {
                let params = image_params(&d.cfg, MODEL_REFERENCE);
                d.service
                    .create_volume("pvc-shared", &params, None)
                    .await
            })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), "pvc-shared");
    }

    // All five callers rendezvoused on one backend pull.
    assert_eq!(d.backend.pull_count(), 1);

    let status = d
        .service
        .status_store()
        .get(&d.cfg.volume_status_path("pvc-shared"))
        .unwrap();
    assert_eq!(status.state, Some(State::PullSucceeded));
    assert!(root
        .path()
        .join("volumes/pvc-shared/model/model-1.safetensor")
        .exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_cancels_inflight_pull() {
    let root = TempDir::new().unwrap();
    let d = Arc::new(driver(
        root.path(),
        FakeBackend::new().with_delay(Duration::from_secs(2)),
    ));

    let create = {
        let d = d.clone();
        tokio::spawn(async move {
            let params = image_params(&d.cfg, MODEL_REFERENCE);
            d.service.create_volume("pvc-doomed", &params, None).await
        })
    };

    // Give the pull time to enter the backend.
    tokio::time::sleep(Duration::from_millis(200)).await;
    d.service.delete_volume("pvc-doomed").await.unwrap();

    let result = create.await.unwrap();
    let err = result.unwrap_err();
    assert!(err.is_canceled(), "expected cancellation, got: {err}");

    // The volume directory is gone.
    assert!(!root.path().join("volumes/pvc-doomed").exists());
}

#[tokio::test]
async fn test_pull_timeout_cleans_up() {
    let root = TempDir::new().unwrap();
    let d = driver(
        root.path(),
        FakeBackend::new().with_delay(Duration::from_secs(2)),
    );

    let params = image_params(&d.cfg, MODEL_REFERENCE);
    let err = d
        .service
        .create_volume("pvc-slow", &params, Some(Duration::from_millis(300)))
        .await
        .unwrap_err();
    assert!(err.is_deadline_exceeded(), "got: {err}");

    assert!(!root.path().join("volumes/pvc-slow").exists());
}

#[tokio::test]
async fn test_pull_failure_tears_down_partial_state() {
    let root = TempDir::new().unwrap();
    let d = driver(
        root.path(),
        FakeBackend::new().fail_with(modelvol::Error::Internal("registry on fire".into())),
    );

    let params = image_params(&d.cfg, MODEL_REFERENCE);
    let err = d
        .service
        .create_volume("pvc-broken", &params, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("registry on fire"));

    assert!(!root.path().join("volumes/pvc-broken").exists());
}

#[tokio::test]
async fn test_dynamic_mount_reference_is_immutable() {
    let root = TempDir::new().unwrap();
    let d = driver(root.path(), FakeBackend::new());

    // A dynamic mount needs its root volume directory in place.
    std::fs::create_dir_all(d.cfg.models_dir("csi-dyn")).unwrap();

    let mut params = image_params(&d.cfg, MODEL_REFERENCE);
    params.insert(d.cfg.parameter_key_mount_id(), "m1".into());
    d.service
        .create_volume("csi-dyn", &params, None)
        .await
        .unwrap();

    // Re-creating the same mount with another reference must conflict.
    let mut params = image_params(&d.cfg, "example.com/model:other");
    params.insert(d.cfg.parameter_key_mount_id(), "m1".into());
    let err = d
        .service
        .create_volume("csi-dyn", &params, None)
        .await
        .unwrap_err();
    assert!(err.is_conflict(), "got: {err}");

    // The original status is untouched.
    let status = d.service.get_dynamic_mount("csi-dyn", "m1").unwrap();
    assert_eq!(status.reference, MODEL_REFERENCE);
    assert_eq!(status.state, Some(State::PullSucceeded));
}

#[tokio::test]
async fn test_same_reference_recreate_is_allowed() {
    let root = TempDir::new().unwrap();
    let d = driver(root.path(), FakeBackend::new());
    std::fs::create_dir_all(d.cfg.models_dir("csi-dyn")).unwrap();

    let mut params = image_params(&d.cfg, MODEL_REFERENCE);
    params.insert(d.cfg.parameter_key_mount_id(), "m1".into());
    d.service
        .create_volume("csi-dyn", &params, None)
        .await
        .unwrap();
    d.service
        .create_volume("csi-dyn", &params, None)
        .await
        .unwrap();

    assert_eq!(d.backend.pull_count(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_create_and_delete_settle() {
    let root = TempDir::new().unwrap();
    let d = Arc::new(driver(
        root.path(),
        FakeBackend::new().with_delay(Duration::from_millis(10)),
    ));

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let d1 = d.clone();
        tasks.push(tokio::spawn(async move {
            let params = image_params(&d1.cfg, MODEL_REFERENCE);
            let _ = d1.service.create_volume("pvc-test", &params, None).await;
        }));
        let d2 = d.clone();
        tasks.push(tokio::spawn(async move {
            let _ = d2.service.delete_volume("pvc-test").await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // Whatever interleaving happened, the tree is consistent: either the
    // volume is fully gone, or it has a parseable status document.
    let volume_dir = root.path().join("volumes/pvc-test");
    if volume_dir.exists() {
        let status = d
            .service
            .status_store()
            .get(&d.cfg.volume_status_path("pvc-test"));
        assert!(status.is_ok(), "left a volume dir without readable status");
    }
}

#[tokio::test]
async fn test_quota_rejects_oversized_model() {
    let root = TempDir::new().unwrap();
    let mut cfg = Config::new("model.csi.example.com", root.path());
    cfg.features.check_disk_quota = true;
    cfg.features.disk_usage_limit = Size::from_mib(1); // model is 10 MiB

    let d = driver_with_config(cfg, FakeBackend::new());

    let mut params = image_params(&d.cfg, MODEL_REFERENCE);
    params.insert(d.cfg.parameter_key_check_disk_quota(), "true".into());
    let err = d
        .service
        .create_volume("pvc-big", &params, None)
        .await
        .unwrap_err();
    assert!(err.is_insufficient_quota(), "got: {err}");
    assert!(!root.path().join("volumes/pvc-big").exists());
}

#[tokio::test]
async fn test_quota_admits_fitting_model() {
    let root = TempDir::new().unwrap();
    let mut cfg = Config::new("model.csi.example.com", root.path());
    cfg.features.check_disk_quota = true;
    cfg.features.disk_usage_limit = Size::from_gib(1);

    let d = driver_with_config(cfg, FakeBackend::new());

    let mut params = image_params(&d.cfg, MODEL_REFERENCE);
    params.insert(d.cfg.parameter_key_check_disk_quota(), "true".into());
    d.service
        .create_volume("pvc-fits", &params, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_quota_skipped_when_artifact_already_local() {
    let root = TempDir::new().unwrap();
    let mut cfg = Config::new("model.csi.example.com", root.path());
    cfg.features.check_disk_quota = true;
    cfg.features.disk_usage_limit = Size::from_mib(1); // way below the model size

    let d = driver_with_config(cfg, FakeBackend::new());

    // First materialization without quota checking.
    let params = image_params(&d.cfg, MODEL_REFERENCE);
    d.service
        .create_volume("pvc-first", &params, None)
        .await
        .unwrap();

    // Second one with quota checking on: the artifact is already on this
    // node, so admission is skipped even though the budget is too small.
    let mut params = image_params(&d.cfg, MODEL_REFERENCE);
    params.insert(d.cfg.parameter_key_check_disk_quota(), "true".into());
    d.service
        .create_volume("pvc-second", &params, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_create_volume_validates_parameters() {
    let root = TempDir::new().unwrap();
    let d = driver(root.path(), FakeBackend::new());

    // Missing everything.
    let err = d
        .service
        .create_volume("pvc-x", &HashMap::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, modelvol::Error::InvalidArgument(_)));

    // Unsupported type.
    let mut params = image_params(&d.cfg, MODEL_REFERENCE);
    params.insert(d.cfg.parameter_key_type(), "tarball".into());
    let err = d
        .service
        .create_volume("pvc-x", &params, None)
        .await
        .unwrap_err();
    assert!(matches!(err, modelvol::Error::InvalidArgument(_)));

    // Missing reference.
    let mut params = HashMap::new();
    params.insert(d.cfg.parameter_key_type(), "image".to_string());
    let err = d
        .service
        .create_volume("pvc-x", &params, None)
        .await
        .unwrap_err();
    assert!(matches!(err, modelvol::Error::InvalidArgument(_)));
}

#[tokio::test]
async fn test_weights_excluded_fetch_skips_weight_files() {
    let root = TempDir::new().unwrap();
    let d = driver(root.path(), FakeBackend::with_layers(default_layers()));
    std::fs::create_dir_all(d.cfg.models_dir("csi-dyn")).unwrap();

    let request = MountRequest {
        mount_id: "m-light".into(),
        reference: MODEL_REFERENCE.into(),
        exclude_model_weights: true,
        ..Default::default()
    };
    let status = d.service.create_mount("csi-dyn", &request).await.unwrap();
    assert_eq!(status.state, Some(State::PullSucceeded));

    let model_dir = root.path().join("volumes/csi-dyn/models/m-light/model");
    assert!(model_dir.join("config.json").exists());
    assert!(model_dir.join("README.md").exists());
    assert!(!model_dir.join("model-1.safetensor").exists());
    // The weights-excluded path goes through fetch, not pull.
    assert_eq!(d.backend.fetches.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert_eq!(d.backend.pulls.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_exclude_file_patterns_filter_fetched_files() {
    let root = TempDir::new().unwrap();
    let d = driver(root.path(), FakeBackend::with_layers(default_layers()));
    std::fs::create_dir_all(d.cfg.models_dir("csi-dyn")).unwrap();

    let request = MountRequest {
        mount_id: "m-nodocs".into(),
        reference: MODEL_REFERENCE.into(),
        exclude_model_weights: true,
        exclude_file_patterns: vec!["*.md".into()],
        ..Default::default()
    };
    d.service.create_mount("csi-dyn", &request).await.unwrap();

    let model_dir = root.path().join("volumes/csi-dyn/models/m-nodocs/model");
    assert!(model_dir.join("config.json").exists());
    assert!(!model_dir.join("README.md").exists());
}

#[tokio::test]
async fn test_malicious_exclude_patterns_are_rejected() {
    let root = TempDir::new().unwrap();
    let d = driver(root.path(), FakeBackend::new());
    std::fs::create_dir_all(d.cfg.models_dir("csi-dyn")).unwrap();

    for pattern in ["/abs/path", "../escape"] {
        let request = MountRequest {
            mount_id: "m-evil".into(),
            reference: MODEL_REFERENCE.into(),
            exclude_model_weights: true,
            exclude_file_patterns: vec![pattern.into()],
            ..Default::default()
        };
        let err = d.service.create_mount("csi-dyn", &request).await.unwrap_err();
        assert!(
            matches!(err, modelvol::Error::InvalidArgument(_)),
            "pattern {pattern} got: {err}"
        );
    }
}
