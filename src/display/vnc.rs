use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::events::{ClientEvent, EventChannel};
use crate::model::SocketType;
use crate::transport::{TransportEvent, WsTransport};
use crate::viewport::Viewport;

use super::{DisplayError, DisplayProtocol};

struct VncState {
    transport: Option<Arc<WsTransport>>,
    pump: Option<JoinHandle<()>>,
}

/// VNC-compatible display variant: binary framebuffer stream to the
/// viewport, clipboard sync in both directions.
pub struct VncDisplay {
    events: EventChannel,
    state: Arc<Mutex<VncState>>,
    requested_close: Arc<AtomicBool>,
}

impl VncDisplay {
    pub fn new() -> Self {
        Self {
            events: EventChannel::new(),
            state: Arc::new(Mutex::new(VncState {
                transport: None,
                pump: None,
            })),
            requested_close: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Default for VncDisplay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DisplayProtocol for VncDisplay {
    async fn connect(&self, viewport: Arc<dyn Viewport>, url: Url) -> Result<(), DisplayError> {
        if self.state.lock().transport.is_some() {
            debug!("display transport already connected");
            return Ok(());
        }

        info!("opening vnc display connection");
        let (transport, rx) = WsTransport::connect(&url).await?;
        let transport = Arc::new(transport);

        self.state.lock().transport = Some(transport);
        let pump = tokio::spawn(pump(
            viewport,
            self.events.clone(),
            self.state.clone(),
            self.requested_close.clone(),
            rx,
        ));
        self.state.lock().pump = Some(pump);

        self.events.publish(ClientEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) {
        self.requested_close.store(true, Ordering::SeqCst);
        let mut state = self.state.lock();
        if let Some(pump) = state.pump.take() {
            pump.abort();
        }
        if let Some(transport) = state.transport.take() {
            transport.close();
            debug!("vnc display disconnected");
        }
    }

    fn events(&self) -> &EventChannel {
        &self.events
    }

    fn kind(&self) -> SocketType {
        SocketType::Vnc
    }

    /// Pushes local clipboard contents to the remote session over the
    /// display channel's text lane.
    fn send_clipboard(&self, text: &str) {
        let transport = self.state.lock().transport.clone();
        if let Some(transport) = transport {
            debug!("sending clipboard contents to remote");
            let _ = transport.send_text(text);
        }
    }
}

async fn pump(
    viewport: Arc<dyn Viewport>,
    events: EventChannel,
    state: Arc<Mutex<VncState>>,
    requested_close: Arc<AtomicBool>,
    mut rx: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            TransportEvent::Binary(frame) => viewport.handle_frame(frame),
            // The display channel's text lane carries remote clipboard
            // contents; syncing them locally is best-effort.
            TransportEvent::Text(text) => match viewport.write_clipboard(&text) {
                Ok(()) => debug!("synced remote clipboard contents to local"),
                Err(err) => {
                    warn!(error = %err, "clipboard sync failed");
                    events.publish(ClientEvent::Error(format!(
                        "failed to sync remote clipboard: {err}"
                    )));
                }
            },
            TransportEvent::Closed(info) => {
                let mut guard = state.lock();
                guard.transport = None;
                guard.pump = None;
                drop(guard);
                if !requested_close.load(Ordering::SeqCst) {
                    events.publish(ClientEvent::Disconnected(Some(info)));
                }
                return;
            }
        }
    }
}
