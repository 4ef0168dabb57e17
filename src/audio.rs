use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::addresses::DesktopAddresses;
use crate::auth::{AuthError, TokenProvider};
use crate::events::{ClientEvent, EventChannel};
use crate::transport::{TransportError, TransportEvent, WsTransport};

#[derive(Debug, Error)]
pub enum AudioError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("audio capture failed: {0}")]
    Capture(String),
}

/// The playback half of the host audio pipeline (speaker side). The session
/// feeds it decoded-stream segments in arrival order; while the sink reports
/// `updating()` new segments are queued and flushed on the next update
/// notification, preserving FIFO order.
pub trait AudioSink: Send + Sync {
    /// True while the sink is still consuming the previously appended chunk.
    fn updating(&self) -> bool;

    fn append(&self, chunk: Bytes);

    /// Signalled by the sink each time it finishes consuming a chunk.
    fn updated(&self) -> Arc<Notify>;
}

/// The capture half of the host audio pipeline (microphone side). `start`
/// yields a stream of encoded chunks until `stop` is called.
#[async_trait]
pub trait AudioSource: Send + Sync {
    async fn start(&self) -> Result<mpsc::UnboundedReceiver<Bytes>, AudioError>;

    fn stop(&self);
}

/// Creates playback sinks and capture sources on demand. Injected so the
/// session owns its audio pipeline explicitly instead of sharing a
/// process-wide one.
pub trait AudioBackend: Send + Sync {
    fn create_sink(&self) -> Arc<dyn AudioSink>;

    fn create_source(&self) -> Arc<dyn AudioSource>;
}

struct AudioState {
    transport: Option<Arc<WsTransport>>,
    pump: Option<JoinHandle<()>>,
    recorder: Option<Recorder>,
}

struct Recorder {
    source: Arc<dyn AudioSource>,
    forward: JoinHandle<()>,
}

/// One bidirectional audio stream for a desktop session: inbound playback,
/// optional microphone capture, and a one-shot token-refresh reconnect on an
/// abnormal transport closure.
pub struct AudioSession {
    addresses: DesktopAddresses,
    tokens: Arc<dyn TokenProvider>,
    backend: Arc<dyn AudioBackend>,
    events: EventChannel,
    state: Arc<AsyncMutex<AudioState>>,
    closed: Arc<AtomicBool>,
}

impl AudioSession {
    pub fn new(
        addresses: DesktopAddresses,
        tokens: Arc<dyn TokenProvider>,
        backend: Arc<dyn AudioBackend>,
    ) -> Self {
        Self {
            addresses,
            tokens,
            backend,
            events: EventChannel::new(),
            state: Arc::new(AsyncMutex::new(AudioState {
                transport: None,
                pump: None,
                recorder: None,
            })),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Lifecycle events (`Disconnected`, `Error`) for the owner to observe.
    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    /// Opens the audio transport and starts streaming inbound audio into a
    /// fresh playback sink. A no-op when the transport is already up.
    pub async fn start_playback(&self) -> Result<(), AudioError> {
        let mut state = self.state.lock().await;
        if state.transport.is_some() {
            debug!("audio transport already connected");
            return Ok(());
        }

        // A rejected upgrade is how an expired token shows up here, so it
        // gets the same one-shot refresh as an abnormal close.
        let url = self.addresses.audio_url();
        let (transport, rx) = match WsTransport::connect(&url).await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "audio connect failed, retrying with refreshed token");
                self.tokens.refresh_token().await?;
                WsTransport::connect(&self.addresses.audio_url()).await?
            }
        };
        let transport = Arc::new(transport);
        state.transport = Some(transport.clone());

        info!(session = %self.addresses.session(), "audio stream connected");
        let sink = self.backend.create_sink();
        state.pump = Some(tokio::spawn(pump(
            self.addresses.clone(),
            self.tokens.clone(),
            self.events.clone(),
            self.state.clone(),
            self.closed.clone(),
            sink,
            rx,
        )));
        Ok(())
    }

    /// Starts forwarding microphone chunks over the audio transport, opening
    /// the transport first when none exists. A no-op while already recording.
    pub async fn start_recording(&self) -> Result<(), AudioError> {
        {
            let state = self.state.lock().await;
            if state.recorder.is_some() {
                return Ok(());
            }
            if state.transport.is_none() {
                drop(state);
                self.start_playback().await?;
            }
        }

        let source = self.backend.create_source();
        let mut chunks = source.start().await?;
        info!("audio recorder started");

        let shared = self.state.clone();
        let forward = tokio::spawn(async move {
            while let Some(chunk) = chunks.recv().await {
                // Look the transport up per chunk: a refresh-reconnect may
                // have swapped it underneath a live recorder.
                let transport = shared.lock().await.transport.clone();
                match transport {
                    Some(transport) => {
                        let _ = transport.send(chunk);
                    }
                    None => break,
                }
            }
        });

        self.state.lock().await.recorder = Some(Recorder { source, forward });
        Ok(())
    }

    /// Stops the capture device. Idempotent; safe to call when not recording.
    pub async fn stop_recording(&self) {
        let mut state = self.state.lock().await;
        stop_recorder(&mut state);
    }

    /// Closes the transport and every attached pipeline. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock().await;
        stop_recorder(&mut state);
        if let Some(pump) = state.pump.take() {
            pump.abort();
        }
        if let Some(transport) = state.transport.take() {
            transport.close();
        }
    }
}

fn stop_recorder(state: &mut AudioState) {
    if let Some(recorder) = state.recorder.take() {
        recorder.source.stop();
        recorder.forward.abort();
        debug!("audio recorder stopped");
    }
}

/// Inbound pump: streams audio segments into the sink FIFO with the
/// queue-while-updating discipline, and owns the close/retry policy.
async fn pump(
    addresses: DesktopAddresses,
    tokens: Arc<dyn TokenProvider>,
    events: EventChannel,
    state: Arc<AsyncMutex<AudioState>>,
    closed: Arc<AtomicBool>,
    sink: Arc<dyn AudioSink>,
    mut rx: mpsc::UnboundedReceiver<TransportEvent>,
) {
    let mut queue: VecDeque<Bytes> = VecDeque::new();
    let mut retried = false;
    let updated = sink.updated();

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { return };
                match event {
                    TransportEvent::Binary(chunk) => {
                        if sink.updating() || !queue.is_empty() {
                            queue.push_back(chunk);
                        } else {
                            sink.append(chunk);
                        }
                    }
                    TransportEvent::Text(_) => {}
                    TransportEvent::Closed(info) => {
                        if closed.load(Ordering::SeqCst) {
                            return;
                        }
                        if info.is_abnormal() && !retried {
                            retried = true;
                            warn!("audio stream dropped, retrying with refreshed token");
                            if tokens.refresh_token().await.is_ok() {
                                if let Ok((transport, new_rx)) =
                                    WsTransport::connect(&addresses.audio_url()).await
                                {
                                    // The recorder keeps running and picks up
                                    // the replacement transport on its next
                                    // chunk.
                                    state.lock().await.transport = Some(Arc::new(transport));
                                    rx = new_rx;
                                    continue;
                                }
                            }
                        }
                        let mut guard = state.lock().await;
                        stop_recorder(&mut guard);
                        guard.transport = None;
                        drop(guard);
                        if !info.is_clean() {
                            events.publish(ClientEvent::Error(format!(
                                "unexpected close on audio stream: {} {}",
                                info.code, info.reason
                            )));
                        }
                        events.publish(ClientEvent::Disconnected(Some(info)));
                        return;
                    }
                }
            }
            _ = updated.notified() => {
                if !sink.updating() {
                    if let Some(chunk) = queue.pop_front() {
                        sink.append(chunk);
                    }
                }
            }
        }
    }
}
