//! Host talking to the real mock plugin executable over protocol v5.

mod support;

use std::sync::Arc;

use async_trait::async_trait;
use lockbox::AuditFormatter;
use lockbox::audit::HMAC_PREFIX;
use lockbox::audit::MountAuditConfig;
use lockbox_logical::BackendType;
use lockbox_logical::Context;
use lockbox_logical::InmemStorage;
use lockbox_logical::LogicalError;
use lockbox_logical::Operation;
use lockbox_logical::PluginVersion;
use lockbox_logical::Result;
use lockbox_logical::Storage;
use lockbox_logical::StorageEntry;
use serde_json::Value;
use serde_json::json;
use support::*;

#[tokio::test]
async fn test_basic_request() {
    let catalog = catalog(&[5]);
    let backend = mount_inmem(&catalog).await;
    let ctx = Context::background();

    let create = request(Operation::Create, "kv/foo").with_data(object(json!({"value": "bar"})));
    let resp = backend.handle_request(&ctx, create).await.unwrap().unwrap();
    assert_eq!(resp.data["value"], "bar");

    let resp = backend.handle_request(&ctx, request(Operation::Read, "kv/foo")).await.unwrap().unwrap();
    assert_eq!(resp.data["value"], "bar");

    let (found, exists) = backend.handle_existence_check(&ctx, request(Operation::Create, "kv/foo")).await.unwrap();
    assert!(found && exists);

    assert!(backend.is_external());
    assert_eq!(backend.backend_type().await, BackendType::Logical);

    backend.cleanup(&ctx).await;
    assert_eq!(catalog.processes().await, 0);
}

/// Fails every call that does not carry snapshot `abcd`.
struct SnapshotStorage {
    inner: InmemStorage,
}

impl SnapshotStorage {
    fn check(ctx: &Context) -> Result<()> {
        match ctx.snapshot_id() {
            Some("abcd") => Ok(()),
            other => Err(LogicalError::internal(format!("unexpected snapshot id {other:?}"))),
        }
    }
}

#[async_trait]
impl Storage for SnapshotStorage {
    async fn list(&self, ctx: &Context, prefix: &str) -> Result<Vec<String>> {
        Self::check(ctx)?;
        self.inner.list(ctx, prefix).await
    }

    async fn get(&self, ctx: &Context, key: &str) -> Result<Option<StorageEntry>> {
        Self::check(ctx)?;
        self.inner.get(ctx, key).await
    }

    async fn put(&self, ctx: &Context, entry: &StorageEntry) -> Result<()> {
        Self::check(ctx)?;
        self.inner.put(ctx, entry).await
    }

    async fn delete(&self, ctx: &Context, key: &str) -> Result<()> {
        Self::check(ctx)?;
        self.inner.delete(ctx, key).await
    }
}

#[tokio::test]
async fn test_snapshot_id_propagation() {
    let catalog = catalog(&[5]);
    let storage = Arc::new(SnapshotStorage {
        inner: InmemStorage::new(),
    });
    let backend = mount(&catalog, storage).await;
    let ctx = Context::background().with_snapshot_id("abcd");

    let create = request(Operation::Create, "kv/foo").with_data(object(json!({"value": "bar"})));
    backend.handle_request(&ctx, create).await.unwrap();
    let resp = backend.handle_request(&ctx, request(Operation::Read, "kv/foo")).await.unwrap().unwrap();
    assert_eq!(resp.data["value"], "bar");
    let resp = backend.handle_request(&ctx, request(Operation::List, "kv/")).await.unwrap().unwrap();
    assert_eq!(resp.data["keys"], json!(["foo"]));
    backend.handle_request(&ctx, request(Operation::Delete, "kv/foo")).await.unwrap();

    let missing = backend.handle_request(&Context::background(), request(Operation::Read, "kv/foo")).await;
    assert!(missing.is_err());

    backend.cleanup(&Context::background()).await;
}

#[tokio::test]
async fn test_invalidate_key() {
    let catalog = catalog(&[5]);
    let backend = mount_inmem(&catalog).await;
    let ctx = Context::background();

    let resp = backend.handle_request(&ctx, request(Operation::Read, "internal")).await.unwrap().unwrap();
    assert_eq!(resp.data["value"], lockbox_plugin_mock::INTERNAL_VALUE);

    backend.invalidate_key(&ctx, "internal").await;

    let resp = backend.handle_request(&ctx, request(Operation::Read, "internal")).await.unwrap().unwrap();
    assert_eq!(resp.data["value"], "");

    backend.cleanup(&ctx).await;
}

#[tokio::test]
async fn test_version_and_special_paths() {
    let catalog = catalog(&[5]);
    let backend = mount_inmem(&catalog).await;

    assert_eq!(
        backend.plugin_version().await,
        Some(PluginVersion {
            version: lockbox_plugin_mock::MOCK_VERSION.to_string(),
        })
    );
    let paths = backend.special_paths().await.unwrap();
    assert!(!paths.allow_snapshot_read.is_empty());

    backend.cleanup(&Context::background()).await;
}

#[tokio::test]
async fn test_errors_cross_the_process_boundary() {
    let catalog = catalog(&[5]);
    let backend = mount_inmem(&catalog).await;
    let ctx = Context::background();

    let err = backend.handle_request(&ctx, request(Operation::Read, "error")).await.unwrap_err();
    assert_eq!(err, LogicalError::user("mock failure"));

    let err = backend.handle_request(&ctx, request(Operation::Read, "nowhere")).await.unwrap_err();
    assert_eq!(err, LogicalError::UnsupportedPath);

    backend.cleanup(&ctx).await;
}

#[tokio::test]
async fn test_supplemental_audit() {
    let catalog = catalog(&[5]);
    let backend = mount_inmem(&catalog).await;
    let ctx = Context::background();
    let formatter = AuditFormatter::new(b"audit-hmac-key").unwrap();
    let mount = MountAuditConfig::new(["foo"], ["baz", "secret"]);

    let req = request(Operation::Read, "audit");
    let resp = backend.handle_request(&ctx, req.clone()).await.unwrap().unwrap();
    let entry = formatter.format_response(&req, Some(&resp), None, &mount);

    let hashed = |v: &Value| {
        let tail = v.as_str().unwrap().strip_prefix(HMAC_PREFIX).unwrap();
        tail.len() == 64 && tail.chars().all(|c| c.is_ascii_hexdigit())
    };
    let request_data = &entry["request"]["supplemental_audit_data"];
    assert_eq!(request_data["foo"], "bar");
    assert!(hashed(&request_data["baz"]));
    assert_eq!(entry["response"]["data"]["secret"], "my-fancy-secret");
    let response_data = entry["response"]["supplemental_audit_data"].as_object().unwrap();
    assert_eq!(response_data.len(), 3);
    assert!(hashed(&response_data["foo"]));
    assert!(hashed(&response_data["quux"]));
    assert_eq!(response_data["baz"], "qux");

    let req = request(Operation::Read, "audit/plain");
    let resp = backend.handle_request(&ctx, req.clone()).await.unwrap().unwrap();
    let entry = formatter.format_response(&req, Some(&resp), None, &mount);
    assert!(entry["request"].get("supplemental_audit_data").is_none());
    assert!(entry["response"].get("supplemental_audit_data").is_none());

    backend.cleanup(&ctx).await;
}
