use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::model::{Session, SessionKey, SessionMutation};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session {0} no longer exists")]
    Gone(SessionKey),
    #[error("session store request failed: {0}")]
    Backend(String),
}

/// The external session store the orchestrator reacts to. The store owns the
/// invariant that at most one session is active; the core reads that state
/// and only writes through the explicit toggle/delete operations below.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// The session currently marked active, if any.
    fn active_session(&self) -> Option<Session>;

    fn audio_enabled(&self) -> bool;

    fn recording_enabled(&self) -> bool;

    /// Subscribes to store mutations. The manager consumes this exactly once
    /// at construction.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionMutation>;

    /// Probes whether the backing workload for a session still exists.
    /// Fails with [`StoreError::Gone`] when it does not.
    async fn session_status(&self, key: &SessionKey) -> Result<(), StoreError>;

    /// Removes a session record locally after the remote side is gone.
    fn delete_session_offline(&self, key: &SessionKey);

    fn toggle_audio(&self, enabled: bool);

    fn toggle_recording(&self, enabled: bool);
}
