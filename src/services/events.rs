//! Event publishing from a plugin into the host's event bus.

use std::sync::Arc;

use async_trait::async_trait;
use lockbox_logical::Context;
use lockbox_logical::EventData;
use lockbox_logical::EventSender;
use tracing::trace;

use super::EVENTS_SERVICE;
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
use crate::wire::SendEventArgs;
use crate::wire::WireEventData;

const SEND_EVENT: &str = "plugin.Events/SendEvent";

/// Host side. Events are dropped when the host has no event bus.
#[derive(Debug, Default)]
pub struct EventsServer {
    sender: Slot<dyn EventSender>,
}

impl EventsServer {
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn attach(&self, sender: Arc<dyn EventSender>) {
        self.sender.attach(sender);
    }
}

#[async_trait]
impl Service for EventsServer {
    fn name(&self) -> &'static str {
        EVENTS_SERVICE
    }

    async fn call(&self, method: &str, call: IncomingCall) -> Result<Vec<u8>, Status> {
        match method {
            "SendEvent" => {
                let args: SendEventArgs = call.decode()?;
                let Some(sender) = self.sender.get() else {
                    trace!(event_type = %args.event_type, "no event sender, dropping plugin event");
                    return encode(&Empty {});
                };
                let ctx = metadata::incoming(&call.metadata, call.cancel.clone());
                let event = EventData::try_from(args.event)?;
                sender.send_event(&ctx, &args.event_type, event).await?;
                encode(&Empty {})
            }
            other => Err(unknown_method(EVENTS_SERVICE, other)),
        }
    }
}

/// Plugin side: an [`EventSender`] that forwards to the host.
#[derive(Debug, Clone)]
pub struct EventsClient {
    conn: RpcConnection,
    channel: u32,
}

impl EventsClient {
    pub fn new(conn: RpcConnection, channel: u32) -> Self {
        Self { conn, channel }
    }
}

#[async_trait]
impl EventSender for EventsClient {
    async fn send_event(&self, ctx: &Context, event_type: &str, event: EventData) -> lockbox_logical::Result<()> {
        let args = SendEventArgs {
            event_type: event_type.to_string(),
            event: WireEventData::try_from(&event)?,
        };
        let _: Empty = invoke(&self.conn, self.channel, SEND_EVENT, ctx, &args).await?;
        Ok(())
    }
}
