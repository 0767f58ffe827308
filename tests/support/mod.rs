//! Shared fixtures for tests that run the real mock plugin executable.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use lockbox::PluginCatalog;
use lockbox::PluginRunner;
use lockbox::PluginSubsystemConfig;
use lockbox::new_plugin_backend;
use lockbox_logical::Backend;
use lockbox_logical::BackendConfig;
use lockbox_logical::Context;
use lockbox_logical::InitializationRequest;
use lockbox_logical::InmemStorage;
use lockbox_logical::Operation;
use lockbox_logical::PluginType;
use lockbox_logical::Request;
use lockbox_logical::StaticSystemView;
use lockbox_logical::Storage;
use serde_json::Map;
use serde_json::Value;

pub const MOCK_PLUGIN: &str = env!("CARGO_BIN_EXE_lockbox-mock-plugin");

pub fn runner() -> PluginRunner {
    PluginRunner::new("mock", PluginType::Secrets, MOCK_PLUGIN)
}

pub fn catalog(protocol_versions: &[u32]) -> Arc<PluginCatalog> {
    lockbox::logging::init_host_tracing();
    let config = PluginSubsystemConfig {
        protocol_versions: protocol_versions.to_vec(),
        ..PluginSubsystemConfig::default()
    };
    let catalog = PluginCatalog::new(config);
    catalog.set(runner());
    Arc::new(catalog)
}

pub fn backend_config(storage: Arc<dyn Storage>) -> BackendConfig {
    BackendConfig {
        storage_view: storage,
        system: Arc::new(StaticSystemView::default()),
        events: None,
        observations: None,
        backend_uuid: uuid::Uuid::new_v4().to_string(),
        config: HashMap::new(),
    }
}

/// Mount the mock plugin and initialize it against `storage`.
pub async fn mount(catalog: &Arc<PluginCatalog>, storage: Arc<dyn Storage>) -> Arc<dyn Backend> {
    let ctx = Context::background();
    let backend = new_plugin_backend(&ctx, catalog, &runner(), backend_config(Arc::clone(&storage)), false)
        .await
        .unwrap();
    backend.initialize(&ctx, InitializationRequest { storage }).await.unwrap();
    backend
}

pub async fn mount_inmem(catalog: &Arc<PluginCatalog>) -> Arc<dyn Backend> {
    mount(catalog, Arc::new(InmemStorage::new())).await
}

pub fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

pub fn request(operation: Operation, path: &str) -> Request {
    Request::new(operation, path)
}
