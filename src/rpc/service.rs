//! Server-side dispatch of incoming calls.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use super::frame::Metadata;
use super::status::Status;

/// A call delivered to a [`Service`].
#[derive(Debug)]
pub struct IncomingCall {
    pub metadata: Metadata,
    pub body: Vec<u8>,
    /// Fires when the caller cancels or the connection closes.
    pub cancel: CancellationToken,
}

impl IncomingCall {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, Status> {
        decode(&self.body)
    }
}

/// A named group of methods served on a channel.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Service name, the part of a method path before the `/`.
    fn name(&self) -> &'static str;

    async fn call(&self, method: &str, call: IncomingCall) -> Result<Vec<u8>, Status>;
}

/// Routes `service/method` paths to registered services.
#[derive(Default, Clone)]
pub struct Router {
    services: HashMap<&'static str, Arc<dyn Service>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: Arc<dyn Service>) -> Self {
        self.services.insert(service.name(), service);
        self
    }

    pub fn service_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.services.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub async fn dispatch(&self, path: &str, call: IncomingCall) -> Result<Vec<u8>, Status> {
        let Some((service, method)) = path.split_once('/') else {
            return Err(Status::invalid_argument(format!("malformed method path '{path}'")));
        };
        match self.services.get(service) {
            Some(svc) => svc.call(method, call).await,
            None => Err(Status::unimplemented(format!("unknown service {service}"))),
        }
    }
}

/// Encode a message body.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, Status> {
    postcard::to_allocvec(msg).map_err(|e| Status::internal(format!("failed to encode message: {e}")))
}

/// Decode a message body.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Status> {
    postcard::from_bytes(bytes).map_err(|e| Status::invalid_argument(format!("malformed message: {e}")))
}

/// The standard reply for a method a service does not implement.
pub fn unknown_method(service: &str, method: &str) -> Status {
    Status::unimplemented(format!("unknown method {service}/{method}"))
}
