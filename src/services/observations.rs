//! Observation recording from a plugin into the host.

use std::sync::Arc;

use async_trait::async_trait;
use lockbox_logical::Context;
use lockbox_logical::ObservationRecorder;
use serde_json::Map;
use serde_json::Value;
use tracing::trace;

use super::OBSERVATIONS_SERVICE;
use super::Slot;
use super::invoke;
use crate::rpc::IncomingCall;
use crate::rpc::RpcConnection;
use crate::rpc::Service;
use crate::rpc::Status;
use crate::rpc::metadata;
use crate::rpc::service::encode;
use crate::rpc::service::unknown_method;
use crate::wire::Empty;
use crate::wire::RecordObservationArgs;
use crate::wire::map_from_wire;
use crate::wire::map_to_wire;

const RECORD_OBSERVATION: &str = "plugin.Observations/RecordObservation";

/// Host side. Observations are dropped when the host records none.
#[derive(Debug, Default)]
pub struct ObservationsServer {
    recorder: Slot<dyn ObservationRecorder>,
}

impl ObservationsServer {
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn attach(&self, recorder: Arc<dyn ObservationRecorder>) {
        self.recorder.attach(recorder);
    }
}

#[async_trait]
impl Service for ObservationsServer {
    fn name(&self) -> &'static str {
        OBSERVATIONS_SERVICE
    }

    async fn call(&self, method: &str, call: IncomingCall) -> Result<Vec<u8>, Status> {
        match method {
            "RecordObservation" => {
                let args: RecordObservationArgs = call.decode()?;
                let Some(recorder) = self.recorder.get() else {
                    trace!(observation_type = %args.observation_type, "no observation recorder, dropping");
                    return encode(&Empty {});
                };
                let ctx = metadata::incoming(&call.metadata, call.cancel.clone());
                let data = map_from_wire(&args.data, "observation.data")?;
                recorder.record_observation(&ctx, &args.observation_type, data).await?;
                encode(&Empty {})
            }
            other => Err(unknown_method(OBSERVATIONS_SERVICE, other)),
        }
    }
}

/// Plugin side: an [`ObservationRecorder`] that forwards to the host.
#[derive(Debug, Clone)]
pub struct ObservationsClient {
    conn: RpcConnection,
    channel: u32,
}

impl ObservationsClient {
    pub fn new(conn: RpcConnection, channel: u32) -> Self {
        Self { conn, channel }
    }
}

#[async_trait]
impl ObservationRecorder for ObservationsClient {
    async fn record_observation(
        &self,
        ctx: &Context,
        observation_type: &str,
        data: Map<String, Value>,
    ) -> lockbox_logical::Result<()> {
        let args = RecordObservationArgs {
            observation_type: observation_type.to_string(),
            data: map_to_wire(&data, "observation.data")?,
        };
        let _: Empty = invoke(&self.conn, self.channel, RECORD_OBSERVATION, ctx, &args).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use lockbox_logical::LogicalError;

    use super::*;
    use crate::rpc::Router;

    struct Reject;

    #[async_trait]
    impl ObservationRecorder for Reject {
        async fn record_observation(
            &self,
            _ctx: &Context,
            _observation_type: &str,
            _data: Map<String, Value>,
        ) -> lockbox_logical::Result<()> {
            Err(LogicalError::PermissionDenied)
        }
    }

    #[tokio::test]
    async fn test_recorder_error_survives() {
        let (host, plugin) = RpcConnection::in_memory_pair();
        let channel = host.allocate_channel();
        let server = Arc::new(ObservationsServer::detached());
        server.attach(Arc::new(Reject));
        host.serve(channel, Router::new().with_service(server));

        let client = ObservationsClient::new(plugin, channel);
        let err = client
            .record_observation(&Context::background(), "login", Map::new())
            .await
            .unwrap_err();
        assert_eq!(err, LogicalError::PermissionDenied);
    }
}
