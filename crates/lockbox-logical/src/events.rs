//! Event and observation sinks a backend may publish into.

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::context::Context;
use crate::error::Result;

/// Payload of a published event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    pub id: String,
    pub metadata: Map<String, Value>,
    pub entity_ids: Vec<String>,
    pub note: String,
}

/// Publishes events into the host's event bus.
#[async_trait]
pub trait EventSender: Send + Sync {
    async fn send_event(&self, ctx: &Context, event_type: &str, event: EventData) -> Result<()>;
}

/// Records structured observations about backend activity.
#[async_trait]
pub trait ObservationRecorder: Send + Sync {
    async fn record_observation(&self, ctx: &Context, observation_type: &str, data: Map<String, Value>) -> Result<()>;
}
