use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::events::EventChannel;
use crate::model::SocketType;
use crate::transport::TransportError;
use crate::viewport::Viewport;

pub mod spice;
pub mod vnc;

pub use spice::SpiceDisplay;
pub use vnc::VncDisplay;

#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("display transport setup failed: {0}")]
    Connection(#[from] TransportError),
}

/// One display transport to a desktop session.
///
/// The variant is fixed at construction (see [`new_display`]) and never
/// swapped without a full teardown. Unsolicited lifecycle transitions are
/// emitted through [`events`](DisplayProtocol::events); a requested
/// [`disconnect`](DisplayProtocol::disconnect) is quiet, so the owner can
/// tell its own teardowns apart from transport failures.
#[async_trait]
pub trait DisplayProtocol: Send + Sync {
    /// Attaches to the viewport and opens the display transport. Calling
    /// this while already connected is a no-op, not an error.
    async fn connect(&self, viewport: Arc<dyn Viewport>, url: Url) -> Result<(), DisplayError>;

    /// Closes the display transport. Idempotent.
    async fn disconnect(&self);

    fn events(&self) -> &EventChannel;

    fn kind(&self) -> SocketType;

    /// Pushes local clipboard contents to the remote session. Protocols
    /// without clipboard support leave this as the default no-op.
    fn send_clipboard(&self, _text: &str) {}
}

/// Selects the display variant for a session's declared socket type; anything
/// that is not explicitly SPICE gets the VNC-compatible default.
pub fn new_display(socket_type: SocketType) -> Box<dyn DisplayProtocol> {
    match socket_type {
        SocketType::Spice => Box::new(SpiceDisplay::new()),
        SocketType::Vnc => Box::new(VncDisplay::new()),
    }
}
