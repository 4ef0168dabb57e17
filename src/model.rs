use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unique identity of a desktop session. Equality is structural on the
/// namespace/name pair, never on reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub namespace: String,
    pub name: String,
}

impl SessionKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Which display wire protocol a session speaks. Template metadata that does
/// not declare one gets the VNC-compatible default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketType {
    #[default]
    Vnc,
    Spice,
}

/// One desktop session as the session store exposes it. The core treats this
/// as read-only; `active` is maintained by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    #[serde(flatten)]
    pub key: SessionKey,
    #[serde(default, rename = "socketType")]
    pub socket_type: SocketType,
    #[serde(default)]
    pub active: bool,
    /// Opaque template descriptor, kept only for display purposes.
    #[serde(default)]
    pub template: Option<Value>,
}

impl Session {
    pub fn new(key: SessionKey, socket_type: SocketType) -> Self {
        Self {
            key,
            socket_type,
            active: false,
            template: None,
        }
    }
}

/// Mutation kinds the session store broadcasts to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMutation {
    SetActiveSession,
    DeleteSession,
    ToggleAudio,
    ToggleRecording,
}

/// Boot-status message the status channel delivers for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    pub pod_phase: String,
    pub running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusMessage {
    /// The desktop is ready to serve display and audio connections.
    pub fn is_ready(&self) -> bool {
        self.pod_phase == "Running" && self.running
    }
}
