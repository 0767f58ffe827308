//! Context values carried in call metadata.

use lockbox_logical::Context;
use lockbox_logical::IndexState;
use tokio_util::sync::CancellationToken;

use super::frame::Metadata;

pub const SNAPSHOT_ID_KEY: &str = "snapshot_id";
pub const INDEX_STATE_CLUSTER_ID_KEY: &str = "index_state_cluster_id";
pub const INDEX_STATE_LOCAL_KEY: &str = "index_state_local";
pub const INDEX_STATE_REPLICATED_KEY: &str = "index_state_replicated";
/// Routes a call to one backend instance inside a multiplexed plugin.
pub const MULTIPLEX_ID_KEY: &str = "multiplex_id";

/// Metadata to attach to an outgoing call made on behalf of `ctx`.
pub fn outgoing(ctx: &Context) -> Metadata {
    let mut md = Metadata::new();
    if let Some(id) = ctx.snapshot_id() {
        md.insert(SNAPSHOT_ID_KEY.to_string(), id.to_string());
    }
    if let Some(state) = ctx.index_state() {
        md.insert(INDEX_STATE_CLUSTER_ID_KEY.to_string(), state.cluster_id.clone());
        md.insert(INDEX_STATE_LOCAL_KEY.to_string(), state.local.to_string());
        md.insert(INDEX_STATE_REPLICATED_KEY.to_string(), state.replicated.to_string());
    }
    md
}

/// Rebuild the caller's context on the receiving side of a call.
///
/// Index state is only restored when all three counters are present and
/// parse.
pub fn incoming(md: &Metadata, cancel: CancellationToken) -> Context {
    let mut ctx = Context::with_cancel(cancel);
    if let Some(id) = md.get(SNAPSHOT_ID_KEY) {
        ctx = ctx.with_snapshot_id(id.clone());
    }
    let cluster_id = md.get(INDEX_STATE_CLUSTER_ID_KEY);
    let local = md.get(INDEX_STATE_LOCAL_KEY).and_then(|v| v.parse::<u64>().ok());
    let replicated = md.get(INDEX_STATE_REPLICATED_KEY).and_then(|v| v.parse::<u64>().ok());
    if let (Some(cluster_id), Some(local), Some(replicated)) = (cluster_id, local, replicated) {
        ctx = ctx.with_index_state(IndexState {
            cluster_id: cluster_id.clone(),
            local,
            replicated,
        });
    }
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_values_survive() {
        let ctx = Context::background().with_snapshot_id("abcd").with_index_state(IndexState {
            cluster_id: "c1".into(),
            local: 42,
            replicated: u64::MAX,
        });
        let md = outgoing(&ctx);
        assert_eq!(md.get(SNAPSHOT_ID_KEY).map(String::as_str), Some("abcd"));

        let back = incoming(&md, CancellationToken::new());
        assert_eq!(back.snapshot_id(), Some("abcd"));
        assert_eq!(back.index_state(), ctx.index_state());
    }

    #[test]
    fn test_partial_index_state_is_ignored() {
        let mut md = Metadata::new();
        md.insert(INDEX_STATE_LOCAL_KEY.into(), "5".into());
        let ctx = incoming(&md, CancellationToken::new());
        assert!(ctx.index_state().is_none());
        assert!(ctx.snapshot_id().is_none());
    }
}
