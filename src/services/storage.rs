//! Storage served from the host to a plugin.

use std::sync::Arc;

use async_trait::async_trait;
use lockbox_logical::Context;
use lockbox_logical::LogicalError;
use lockbox_logical::Storage;
use lockbox_logical::StorageEntry;
use tracing::trace;

use super::STORAGE_SERVICE;
use super::Slot;
use super::invoke;
use crate::rpc::IncomingCall;
use crate::rpc::RpcConnection;
use crate::rpc::Service;
use crate::rpc::Status;
use crate::rpc::metadata;
use crate::rpc::service::encode;
use crate::rpc::service::unknown_method;
use crate::wire::StorageDeleteArgs;
use crate::wire::StorageGetArgs;
use crate::wire::StorageGetReply;
use crate::wire::StorageListArgs;
use crate::wire::StorageListReply;
use crate::wire::StoragePutArgs;
use crate::wire::StorageReply;
use crate::wire::WireStorageEntry;
use crate::wire::decode_err;
use crate::wire::encode_err;

const LIST: &str = "plugin.Storage/List";
const GET: &str = "plugin.Storage/Get";
const PUT: &str = "plugin.Storage/Put";
const DELETE: &str = "plugin.Storage/Delete";

/// Host side. Refuses with `missing-storage` until storage is attached.
#[derive(Debug, Default)]
pub struct StorageServer {
    storage: Slot<dyn Storage>,
}

impl StorageServer {
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage: Slot::with(storage),
        }
    }

    pub fn attach(&self, storage: Arc<dyn Storage>) {
        self.storage.attach(storage);
    }

    pub fn is_attached(&self) -> bool {
        self.storage.is_attached()
    }

    fn storage(&self) -> Result<Arc<dyn Storage>, LogicalError> {
        self.storage.get().ok_or(LogicalError::MissingStorage)
    }
}

#[async_trait]
impl Service for StorageServer {
    fn name(&self) -> &'static str {
        STORAGE_SERVICE
    }

    async fn call(&self, method: &str, call: IncomingCall) -> Result<Vec<u8>, Status> {
        let ctx = metadata::incoming(&call.metadata, call.cancel.clone());
        match method {
            "List" => {
                let args: StorageListArgs = call.decode()?;
                trace!(prefix = %args.prefix, "plugin storage list");
                let result = match self.storage() {
                    Ok(storage) => storage.list(&ctx, &args.prefix).await,
                    Err(e) => Err(e),
                };
                let err = encode_err(&result);
                encode(&StorageListReply {
                    keys: result.unwrap_or_default(),
                    err,
                })
            }
            "Get" => {
                let args: StorageGetArgs = call.decode()?;
                trace!(key = %args.key, "plugin storage get");
                let result = match self.storage() {
                    Ok(storage) => storage.get(&ctx, &args.key).await,
                    Err(e) => Err(e),
                };
                let err = encode_err(&result);
                encode(&StorageGetReply {
                    entry: result.ok().flatten().as_ref().map(WireStorageEntry::from),
                    err,
                })
            }
            "Put" => {
                let args: StoragePutArgs = call.decode()?;
                trace!(key = %args.entry.key, "plugin storage put");
                let entry = StorageEntry::from(args.entry);
                let result = match self.storage() {
                    Ok(storage) => storage.put(&ctx, &entry).await,
                    Err(e) => Err(e),
                };
                encode(&StorageReply {
                    err: encode_err(&result),
                })
            }
            "Delete" => {
                let args: StorageDeleteArgs = call.decode()?;
                trace!(key = %args.key, "plugin storage delete");
                let result = match self.storage() {
                    Ok(storage) => storage.delete(&ctx, &args.key).await,
                    Err(e) => Err(e),
                };
                encode(&StorageReply {
                    err: encode_err(&result),
                })
            }
            other => Err(unknown_method(STORAGE_SERVICE, other)),
        }
    }
}

/// Plugin side: a [`Storage`] that forwards to the host.
#[derive(Debug, Clone)]
pub struct StorageClient {
    conn: RpcConnection,
    channel: u32,
}

impl StorageClient {
    pub fn new(conn: RpcConnection, channel: u32) -> Self {
        Self { conn, channel }
    }
}

#[async_trait]
impl Storage for StorageClient {
    async fn list(&self, ctx: &Context, prefix: &str) -> lockbox_logical::Result<Vec<String>> {
        let args = StorageListArgs {
            prefix: prefix.to_string(),
        };
        let reply: StorageListReply = invoke(&self.conn, self.channel, LIST, ctx, &args).await?;
        decode_err(reply.err)?;
        Ok(reply.keys)
    }

    async fn get(&self, ctx: &Context, key: &str) -> lockbox_logical::Result<Option<StorageEntry>> {
        let args = StorageGetArgs { key: key.to_string() };
        let reply: StorageGetReply = invoke(&self.conn, self.channel, GET, ctx, &args).await?;
        decode_err(reply.err)?;
        Ok(reply.entry.map(StorageEntry::from))
    }

    async fn put(&self, ctx: &Context, entry: &StorageEntry) -> lockbox_logical::Result<()> {
        let args = StoragePutArgs {
            entry: WireStorageEntry::from(entry),
        };
        let reply: StorageReply = invoke(&self.conn, self.channel, PUT, ctx, &args).await?;
        decode_err(reply.err)
    }

    async fn delete(&self, ctx: &Context, key: &str) -> lockbox_logical::Result<()> {
        let args = StorageDeleteArgs { key: key.to_string() };
        let reply: StorageReply = invoke(&self.conn, self.channel, DELETE, ctx, &args).await?;
        decode_err(reply.err)
    }
}
