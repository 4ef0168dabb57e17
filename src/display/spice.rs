use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

use crate::events::{ClientEvent, EventChannel};
use crate::model::SocketType;
use crate::transport::{TransportEvent, WsTransport};
use crate::viewport::Viewport;

use super::{DisplayError, DisplayProtocol};

/// Agent message propagating the local window size to the remote display.
#[derive(Debug, Serialize)]
struct ResizeRequest {
    #[serde(rename = "type")]
    kind: &'static str,
    width: u32,
    height: u32,
}

/// Agent message announcing a file transfer; the file bytes follow as one
/// binary frame.
#[derive(Debug, Serialize)]
struct FileTransferHeader {
    #[serde(rename = "type")]
    kind: &'static str,
    name: String,
    size: usize,
}

struct SpiceState {
    transport: Option<Arc<WsTransport>>,
    // Resize / file-drop forwarders.
    aux: Vec<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
}

/// SPICE-compatible display variant: video stream to the viewport, window
/// resize propagation, and file drag-and-drop transfer when the viewport
/// supports it.
pub struct SpiceDisplay {
    events: EventChannel,
    state: Arc<Mutex<SpiceState>>,
    requested_close: Arc<AtomicBool>,
}

impl SpiceDisplay {
    pub fn new() -> Self {
        Self {
            events: EventChannel::new(),
            state: Arc::new(Mutex::new(SpiceState {
                transport: None,
                aux: Vec::new(),
                pump: None,
            })),
            requested_close: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Default for SpiceDisplay {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DisplayProtocol for SpiceDisplay {
    async fn connect(&self, viewport: Arc<dyn Viewport>, url: Url) -> Result<(), DisplayError> {
        if self.state.lock().transport.is_some() {
            debug!("display transport already connected");
            return Ok(());
        }

        info!("opening spice display connection");
        let (transport, rx) = WsTransport::connect(&url).await?;
        let transport = Arc::new(transport);

        let mut tasks = Vec::new();

        if let Some(mut resizes) = viewport.resize_events() {
            let resize_transport = transport.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(size) = resizes.recv().await {
                    let request = ResizeRequest {
                        kind: "resize",
                        width: size.width,
                        height: size.height,
                    };
                    if let Ok(payload) = serde_json::to_string(&request) {
                        if resize_transport.send_text(payload).is_err() {
                            break;
                        }
                    }
                }
            }));
        } else {
            debug!("viewport does not report resizes");
        }

        if let Some(mut drops) = viewport.file_drops() {
            let drop_transport = transport.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(file) = drops.recv().await {
                    debug!(name = %file.name, bytes = file.data.len(), "forwarding dropped file");
                    let header = FileTransferHeader {
                        kind: "file",
                        name: file.name,
                        size: file.data.len(),
                    };
                    let Ok(payload) = serde_json::to_string(&header) else {
                        continue;
                    };
                    if drop_transport.send_text(payload).is_err()
                        || drop_transport.send(file.data).is_err()
                    {
                        break;
                    }
                }
            }));
        } else {
            // Not an error: file transfer is a capability, not a contract.
            debug!("viewport does not support file drops");
        }

        {
            let mut state = self.state.lock();
            state.transport = Some(transport);
            state.aux = tasks;
        }

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
        for task in state.aux.drain(..) {
            task.abort();
        }
        if let Some(pump) = state.pump.take() {
            pump.abort();
        }
        if let Some(transport) = state.transport.take() {
            transport.close();
            debug!("spice display disconnected");
        }
    }

    fn events(&self) -> &EventChannel {
        &self.events
    }

    fn kind(&self) -> SocketType {
        SocketType::Spice
    }
}

async fn pump(
    viewport: Arc<dyn Viewport>,
    events: EventChannel,
    state: Arc<Mutex<SpiceState>>,
    requested_close: Arc<AtomicBool>,
    mut rx: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            TransportEvent::Binary(frame) => viewport.handle_frame(frame),
            TransportEvent::Text(text) => {
                debug!(%text, "ignoring agent message from server");
            }
            TransportEvent::Closed(info) => {
                let mut guard = state.lock();
                guard.transport = None;
                guard.pump = None;
                for task in guard.aux.drain(..) {
                    task.abort();
                }
                drop(guard);
                if !requested_close.load(Ordering::SeqCst) {
                    events.publish(ClientEvent::Disconnected(Some(info)));
                }
                return;
            }
        }
    }
}
