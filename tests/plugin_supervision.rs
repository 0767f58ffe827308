//! Process supervision against the real mock plugin executable:
//! crash recovery, multiplexing, reload, checksums and metadata mode.

mod support;

use std::path::Path;
use std::sync::Arc;

use lockbox::new_plugin_backend;
use lockbox::supervisor::runner::file_sha256;
use lockbox_logical::BackendType;
use lockbox_logical::Context;
use lockbox_logical::InitializationRequest;
use lockbox_logical::InmemStorage;
use lockbox_logical::LogicalError;
use lockbox_logical::Operation;
use lockbox_logical::PluginVersion;
use lockbox_logical::Storage;
use serde_json::json;
use support::*;

#[tokio::test]
async fn test_classic_plugin_restarts_after_crash() {
    let catalog = catalog(&[4]);
    let storage: Arc<dyn Storage> = Arc::new(InmemStorage::new());
    let backend = mount(&catalog, Arc::clone(&storage)).await;
    let ctx = Context::background();

    let create = request(Operation::Create, "kv/foo").with_data(object(json!({"value": "bar"})));
    backend.handle_request(&ctx, create).await.unwrap();

    // The rebuilt plugin crashes again on the retry; the second failure is reported.
    let err = backend.handle_request(&ctx, request(Operation::Read, "crash")).await.unwrap_err();
    assert_eq!(err, LogicalError::PluginShutdown);

    // The next call rebuilds once more and finds the data in host storage.
    let resp = backend.handle_request(&ctx, request(Operation::Read, "kv/foo")).await.unwrap().unwrap();
    assert_eq!(resp.data["value"], "bar");
    assert_eq!(catalog.processes().await, 1);

    backend.cleanup(&ctx).await;
    assert_eq!(catalog.processes().await, 0);
}

#[tokio::test]
async fn test_classic_plugin_reports_version() {
    let catalog = catalog(&[3, 4]);
    let backend = mount_inmem(&catalog).await;

    assert!(backend.is_external());
    assert_eq!(
        backend.plugin_version().await,
        Some(PluginVersion {
            version: lockbox_plugin_mock::MOCK_VERSION.to_string(),
        })
    );
    backend.cleanup(&Context::background()).await;
}

#[tokio::test]
async fn test_v5_crash_is_not_retried() {
    let catalog = catalog(&[5]);
    let backend = mount_inmem(&catalog).await;
    let ctx = Context::background();

    let err = backend.handle_request(&ctx, request(Operation::Read, "crash")).await.unwrap_err();
    assert_eq!(err, LogicalError::PluginShutdown);
    let err = backend.handle_request(&ctx, request(Operation::Read, "internal")).await.unwrap_err();
    assert_eq!(err, LogicalError::PluginShutdown);

    backend.cleanup(&ctx).await;
    assert_eq!(catalog.processes().await, 0);
}

#[tokio::test]
async fn test_multiplexed_mounts_share_a_process() {
    let catalog = catalog(&[5]);
    let first = mount_inmem(&catalog).await;
    let second = mount_inmem(&catalog).await;
    assert_eq!(catalog.processes().await, 1);
    let ctx = Context::background();

    let create = request(Operation::Create, "kv/foo").with_data(object(json!({"value": "a"})));
    first.handle_request(&ctx, create).await.unwrap();
    let missing = second.handle_request(&ctx, request(Operation::Read, "kv/foo")).await.unwrap();
    assert!(missing.is_none());

    // Instance state is per mount too.
    first.invalidate_key(&ctx, "internal").await;
    let resp = second.handle_request(&ctx, request(Operation::Read, "internal")).await.unwrap().unwrap();
    assert_eq!(resp.data["value"], lockbox_plugin_mock::INTERNAL_VALUE);

    first.cleanup(&ctx).await;
    assert_eq!(catalog.processes().await, 1);
    second.handle_request(&ctx, request(Operation::Read, "internal")).await.unwrap();

    second.cleanup(&ctx).await;
    assert_eq!(catalog.processes().await, 0);
}

#[tokio::test]
async fn test_different_runners_are_not_multiplexed() {
    let catalog = catalog(&[5]);
    let first = mount_inmem(&catalog).await;

    let other = runner().with_env(["MOCK_INSTANCE=2"]);
    let ctx = Context::background();
    let second = new_plugin_backend(&ctx, &catalog, &other, backend_config(Arc::new(InmemStorage::new())), false)
        .await
        .unwrap();
    assert_eq!(catalog.processes().await, 2);

    first.cleanup(&ctx).await;
    second.cleanup(&ctx).await;
    assert_eq!(catalog.processes().await, 0);
}

#[tokio::test]
async fn test_reload_replaces_the_shared_process() {
    let catalog = catalog(&[5]);
    let first = mount_inmem(&catalog).await;
    let second = mount_inmem(&catalog).await;
    let ctx = Context::background();

    first.cleanup(&ctx.clone().with_plugin_reload()).await;
    assert_eq!(catalog.processes().await, 0);

    let err = second.handle_request(&ctx, request(Operation::Read, "internal")).await.unwrap_err();
    assert_eq!(err, LogicalError::PluginShutdown);

    let third = mount_inmem(&catalog).await;
    third.handle_request(&ctx, request(Operation::Read, "internal")).await.unwrap();
    assert_eq!(catalog.processes().await, 1);

    // Closing a client of the old process leaves the new one alone.
    second.cleanup(&ctx).await;
    assert_eq!(catalog.processes().await, 1);
    third.handle_request(&ctx, request(Operation::Read, "internal")).await.unwrap();

    third.cleanup(&ctx).await;
    assert_eq!(catalog.processes().await, 0);
}

#[tokio::test]
async fn test_checksum_is_enforced() {
    let catalog = catalog(&[5]);
    let ctx = Context::background();

    let wrong = runner().with_sha256("00".repeat(32));
    let err = new_plugin_backend(&ctx, &catalog, &wrong, backend_config(Arc::new(InmemStorage::new())), false)
        .await
        .err()
        .unwrap();
    assert!(err.to_string().contains("checksum mismatch"), "{err}");
    assert_eq!(catalog.processes().await, 0);

    let digest = file_sha256(Path::new(MOCK_PLUGIN)).await.unwrap();
    let right = runner().with_sha256(digest);
    let backend = new_plugin_backend(&ctx, &catalog, &right, backend_config(Arc::new(InmemStorage::new())), false)
        .await
        .unwrap();
    backend.cleanup(&ctx).await;
}

#[tokio::test]
async fn test_metadata_mode() {
    let catalog = catalog(&[5]);
    let ctx = Context::background();
    let backend = new_plugin_backend(&ctx, &catalog, &runner(), backend_config(Arc::new(InmemStorage::new())), true)
        .await
        .unwrap();

    assert!(!backend.special_paths().await.unwrap().allow_snapshot_read.is_empty());
    assert_eq!(backend.backend_type().await, BackendType::Logical);

    let err = backend
        .initialize(&ctx, InitializationRequest {
            storage: Arc::new(InmemStorage::new()),
        })
        .await
        .unwrap_err();
    assert!(err.is_metadata_mode());
    let err = backend.handle_request(&ctx, request(Operation::Read, "internal")).await.unwrap_err();
    assert!(err.is_metadata_mode());

    // Metadata-mode processes are never shared with regular mounts.
    let regular = mount_inmem(&catalog).await;
    assert_eq!(catalog.processes().await, 2);

    backend.cleanup(&ctx).await;
    regular.cleanup(&ctx).await;
    assert_eq!(catalog.processes().await, 0);
}

#[tokio::test]
async fn test_catalog_shutdown_stops_everything() {
    let catalog = catalog(&[5]);
    let backend = mount_inmem(&catalog).await;
    let ctx = Context::background();

    catalog.shutdown().await;
    assert_eq!(catalog.processes().await, 0);
    let err = backend.handle_request(&ctx, request(Operation::Read, "internal")).await.unwrap_err();
    assert_eq!(err, LogicalError::PluginShutdown);
}

#[tokio::test]
async fn test_classic_plugin_stays_down_after_shutdown() {
    let catalog = catalog(&[4]);
    let backend = mount_inmem(&catalog).await;
    let ctx = Context::background();

    catalog.shutdown().await;
    for _ in 0..2 {
        let err = backend.handle_request(&ctx, request(Operation::Read, "internal")).await.unwrap_err();
        assert_eq!(err, LogicalError::PluginShutdown);
        assert_eq!(catalog.processes().await, 0);
    }

    let err = new_plugin_backend(&ctx, &catalog, &runner(), backend_config(Arc::new(InmemStorage::new())), false)
        .await
        .err();
    assert_eq!(err, Some(LogicalError::PluginShutdown));
    assert_eq!(catalog.processes().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repeated_mounts_connect_reliably() {
    let ctx = Context::background();
    for versions in [&[4][..], &[5][..]] {
        let catalog = catalog(versions);
        for _ in 0..8 {
            let backend = mount_inmem(&catalog).await;
            backend.handle_request(&ctx, request(Operation::Read, "internal")).await.unwrap();
            backend.cleanup(&ctx).await;
        }
    }

    // The first call on a fresh v5 process asks about multiplexing; losing
    // it would leave every mount on its own process.
    let catalog = catalog(&[5]);
    for _ in 0..8 {
        let first = mount_inmem(&catalog).await;
        let second = mount_inmem(&catalog).await;
        assert_eq!(catalog.processes().await, 1);
        first.cleanup(&ctx).await;
        second.cleanup(&ctx).await;
        assert_eq!(catalog.processes().await, 0);
    }
}
