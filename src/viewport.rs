use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
#[error("clipboard write failed: {0}")]
pub struct ClipboardError(pub String);

/// Viewport dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewportSize {
    pub width: u32,
    pub height: u32,
}

/// A file dragged into the viewport, to be transferred into the session.
#[derive(Debug, Clone)]
pub struct FileDrop {
    pub name: String,
    pub data: Bytes,
}

/// The rendering surface a display protocol attaches to. Frame payloads are
/// opaque to the core; decoding belongs to the surface.
pub trait Viewport: Send + Sync {
    /// Consumes one display frame from the wire.
    fn handle_frame(&self, frame: Bytes);

    /// Writes remote clipboard contents to the local clipboard. Best-effort;
    /// failures are reported but never fatal to the display connection.
    fn write_clipboard(&self, text: &str) -> Result<(), ClipboardError>;

    /// Resize notifications, for protocols that propagate the local window
    /// size to the remote. `None` means the surface does not resize.
    fn resize_events(&self) -> Option<mpsc::UnboundedReceiver<ViewportSize>> {
        None
    }

    /// Files dropped onto the surface, for protocols that support file
    /// transfer. `None` means drag-and-drop is unsupported, which is a
    /// feature no-op rather than an error.
    fn file_drops(&self) -> Option<mpsc::UnboundedReceiver<FileDrop>> {
        None
    }
}

/// Hands out the current rendering surface. Returning `None` at connect time
/// is tolerated (logged, not raised): the surface is UI-owned and may not
/// exist during route transitions.
pub trait ViewportProvider: Send + Sync {
    fn viewport(&self) -> Option<Arc<dyn Viewport>>;
}
