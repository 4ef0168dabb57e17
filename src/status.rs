use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::addresses::DesktopAddresses;
use crate::auth::TokenProvider;
use crate::events::{ClientEvent, EventChannel};
use crate::model::{SessionKey, StatusMessage};
use crate::transport::{TransportEvent, WsTransport};

/// Updates beyond this count get the long-boot guidance appended.
const SLOW_BOOT_THRESHOLD: u32 = 6;

const SLOW_BOOT_GUIDANCE: &str = "\n\nThis is taking a while. The server might be pulling the \
image for the first time, this is a large qemu disk image, \
or the control-plane is having trouble scheduling the desktop.";

/// Polls the status channel for a desktop session until the server reports
/// it ready, surfacing progress as `Update` events and signalling readiness
/// to the owner exactly once.
///
/// An abnormal (1006) closure that has not yet been retried triggers one
/// token refresh and reopen; a second abnormal closure surfaces a single
/// `Error`. [`close`](StatusHandshake::close) makes any pending retry on
/// this instance a no-op, so a superseded handshake cannot interfere with
/// its successor.
pub struct StatusHandshake {
    closed: Arc<AtomicBool>,
    transport: Arc<Mutex<Option<WsTransport>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StatusHandshake {
    pub fn open(
        addresses: DesktopAddresses,
        tokens: Arc<dyn TokenProvider>,
        events: EventChannel,
        ready: mpsc::UnboundedSender<SessionKey>,
    ) -> Self {
        let closed = Arc::new(AtomicBool::new(false));
        let transport = Arc::new(Mutex::new(None));
        let task = tokio::spawn(run(
            addresses,
            tokens,
            events,
            ready,
            closed.clone(),
            transport.clone(),
        ));
        Self {
            closed,
            transport: transport.clone(),
            task: Mutex::new(Some(task)),
        }
    }

    /// True while the handshake task is still polling. Terminal outcomes
    /// (readiness hand-off, a server-reported error, exhausted retries) end
    /// the task without going through [`close`](StatusHandshake::close), so
    /// owners must not treat a held handle as a live connection.
    pub fn is_live(&self) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Closes the status channel. Idempotent. Called both for manager-level
    /// disconnects and as cleanup after readiness hand-off.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(transport) = self.transport.lock().take() {
            transport.close();
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for StatusHandshake {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run(
    addresses: DesktopAddresses,
    tokens: Arc<dyn TokenProvider>,
    events: EventChannel,
    ready: mpsc::UnboundedSender<SessionKey>,
    closed: Arc<AtomicBool>,
    slot: Arc<Mutex<Option<WsTransport>>>,
) {
    let key = addresses.session().clone();
    let mut retried = false;

    'attempt: loop {
        // The URL is rebuilt per attempt so a refreshed token is picked up.
        let url = addresses.status_url();
        let mut rx = match WsTransport::connect(&url).await {
            Ok((transport, rx)) => {
                if closed.load(Ordering::SeqCst) {
                    transport.close();
                    return;
                }
                *slot.lock() = Some(transport);
                rx
            }
            Err(err) => {
                // A browser surfaces connect failures as an abnormal close,
                // so the same one-shot refresh applies here.
                if closed.load(Ordering::SeqCst) {
                    return;
                }
                if !retried {
                    retried = true;
                    match tokens.refresh_token().await {
                        Ok(()) => continue 'attempt,
                        Err(refresh_err) => {
                            // The terminal flag goes first so the handshake
                            // never looks live after its outcome is visible.
                            closed.store(true, Ordering::SeqCst);
                            events.publish(ClientEvent::Error(refresh_err.to_string()));
                            return;
                        }
                    }
                }
                closed.store(true, Ordering::SeqCst);
                events.publish(ClientEvent::Error(format!(
                    "Error getting session status: {err}"
                )));
                return;
            }
        };

        events.publish(ClientEvent::Update(format!("Connecting to {key}")));
        let mut count: u32 = 0;

        while let Some(event) = rx.recv().await {
            // The status channel is JSON; a proxy that frames it as binary
            // gets the same treatment as text.
            let payload = match event {
                TransportEvent::Text(text) => text,
                TransportEvent::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                TransportEvent::Closed(info) => {
                    if closed.load(Ordering::SeqCst) {
                        return;
                    }
                    if info.is_clean() {
                        debug!(code = info.code, reason = %info.reason, "status channel closed cleanly");
                        closed.store(true, Ordering::SeqCst);
                        return;
                    }
                    if info.is_abnormal() && !retried {
                        retried = true;
                        warn!(session = %key, "status channel dropped, retrying with refreshed token");
                        match tokens.refresh_token().await {
                            Ok(()) => continue 'attempt,
                            Err(err) => {
                                closed.store(true, Ordering::SeqCst);
                                events.publish(ClientEvent::Error(err.to_string()));
                                return;
                            }
                        }
                    }
                    closed.store(true, Ordering::SeqCst);
                    events.publish(ClientEvent::Error(format!(
                        "Error getting session status: {} {}",
                        info.code, info.reason
                    )));
                    return;
                }
            };

            count += 1;
            debug!(count, %payload, "status update received");
            let status: StatusMessage = match serde_json::from_str(&payload) {
                Ok(status) => status,
                Err(err) => {
                    closed.store(true, Ordering::SeqCst);
                    events.publish(ClientEvent::Error(format!("invalid status payload: {err}")));
                    close_slot(&slot);
                    return;
                }
            };

            if let Some(message) = status.error {
                closed.store(true, Ordering::SeqCst);
                events.publish(ClientEvent::Disconnected(None));
                events.publish(ClientEvent::Error(message));
                close_slot(&slot);
                return;
            }

            if status.is_ready() {
                info!(session = %key, "desktop is ready, handing off to display");
                closed.store(true, Ordering::SeqCst);
                events.publish(ClientEvent::Update(
                    "Desktop is ready - Launching display".into(),
                ));
                close_slot(&slot);
                let _ = ready.send(key.clone());
                return;
            }

            let mut text = format!("Waiting for {key}");
            if count > SLOW_BOOT_THRESHOLD {
                text.push_str(SLOW_BOOT_GUIDANCE);
            }
            events.publish(ClientEvent::Update(text));
        }
        // Event stream ended without a close event: local close() won.
        return;
    }
}

fn close_slot(slot: &Mutex<Option<WsTransport>>) {
    if let Some(transport) = slot.lock().take() {
        transport.close();
    }
}
