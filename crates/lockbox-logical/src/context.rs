//! Per-call context carried across the plugin boundary.
//!
//! A [`Context`] bundles the cancellation signal for one call with the
//! request-scoped values that must follow the call into the plugin and back
//! out through every reverse storage call it makes.

use std::fmt;

use tokio_util::sync::CancellationToken;

/// Consistency-index information propagated between host and plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexState {
    pub cluster_id: String,
    pub local: u64,
    pub replicated: u64,
}

/// Cancellation and request-scoped values for a single call.
#[derive(Clone, Default)]
pub struct Context {
    snapshot_id: Option<String>,
    index_state: Option<IndexState>,
    plugin_reload: bool,
    cancel: CancellationToken,
}

impl Context {
    /// A context that is never cancelled and carries no values.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context cancelled by `cancel`.
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..Self::default()
        }
    }

    /// Snapshot reads route every storage call to this snapshot.
    pub fn with_snapshot_id(mut self, snapshot_id: impl Into<String>) -> Self {
        self.snapshot_id = Some(snapshot_id.into());
        self
    }

    pub fn with_index_state(mut self, state: IndexState) -> Self {
        self.index_state = Some(state);
        self
    }

    /// Marks the call as part of a plugin reload rather than an unmount.
    pub fn with_plugin_reload(mut self) -> Self {
        self.plugin_reload = true;
        self
    }

    pub fn snapshot_id(&self) -> Option<&str> {
        self.snapshot_id.as_deref()
    }

    pub fn index_state(&self) -> Option<&IndexState> {
        self.index_state.as_ref()
    }

    pub fn is_plugin_reload(&self) -> bool {
        self.plugin_reload
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the context is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// A derived context with the same values whose cancellation also fires
    /// when the parent is cancelled.
    pub fn child(&self) -> Self {
        Self {
            snapshot_id: self.snapshot_id.clone(),
            index_state: self.index_state.clone(),
            plugin_reload: self.plugin_reload,
            cancel: self.cancel.child_token(),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("snapshot_id", &self.snapshot_id)
            .field("index_state", &self.index_state)
            .field("plugin_reload", &self.plugin_reload)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
