#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use url::Url;

use desklink::audio::{AudioBackend, AudioError, AudioSink, AudioSource};
use desklink::auth::{AuthError, TokenProvider};
use desklink::events::{ClientEvent, EventChannel, EventKind};
use desklink::model::{Session, SessionKey, SessionMutation, SocketType};
use desklink::store::{SessionStore, StoreError};
use desklink::viewport::{ClipboardError, Viewport, ViewportProvider};

pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn session(namespace: &str, name: &str) -> Session {
    Session::new(SessionKey::new(namespace, name), SocketType::Vnc)
}

pub fn status_json(phase: &str, running: bool) -> String {
    format!(r#"{{"podPhase":"{phase}","running":{running}}}"#)
}

pub fn status_error_json(message: &str) -> String {
    format!(r#"{{"podPhase":"Failed","running":false,"error":"{message}"}}"#)
}

/// One scripted action the fixture server performs on an accepted websocket.
#[derive(Debug, Clone)]
pub enum Step {
    SendText(String),
    SendBinary(Vec<u8>),
    /// Waits before the next step, recording inbound frames meanwhile.
    Pause(u64),
    /// Performs a proper close handshake with the given code.
    CloseWith(u16, &'static str),
    /// Drops the socket without a close frame; the client sees 1006.
    DropDirty,
    /// Holds the socket open, recording inbound binary frames, until the
    /// client goes away.
    Stay,
}

#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub seq: usize,
    pub namespace: String,
    pub name: String,
    pub endpoint: String,
    pub token: String,
}

#[derive(Default)]
struct FixtureState {
    seq: AtomicUsize,
    plans: Mutex<HashMap<String, VecDeque<Vec<Step>>>>,
    connections: Mutex<Vec<ConnectionRecord>>,
    inbound: Mutex<Vec<(String, Vec<u8>)>>,
    inbound_text: Mutex<Vec<(String, String)>>,
    rejected_tokens: Mutex<Vec<String>>,
}

/// A loopback stand-in for the desktop API's websocket endpoints. Every
/// accepted connection runs the next queued plan for its endpoint; with no
/// plan queued it just holds the socket open.
pub struct WsFixture {
    pub base: Url,
    state: Arc<FixtureState>,
    server: JoinHandle<()>,
}

impl WsFixture {
    pub async fn start() -> Self {
        let state = Arc::new(FixtureState::default());
        let app = Router::new()
            .route("/api/desktops/ws/:namespace/:name/:endpoint", get(upgrade))
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        Self {
            base: Url::parse(&format!("http://{addr}")).unwrap(),
            state,
            server,
        }
    }

    /// Refuses upgrades presenting this token with a 401, like the API does
    /// for an expired session token.
    pub fn reject_token(&self, token: &str) {
        self.state.rejected_tokens.lock().push(token.to_string());
    }

    /// Queues a plan for the next connection on an endpoint.
    pub fn plan(&self, endpoint: &str, steps: Vec<Step>) {
        self.state
            .plans
            .lock()
            .entry(endpoint.to_string())
            .or_default()
            .push_back(steps);
    }

    pub fn connections(&self) -> Vec<ConnectionRecord> {
        self.state.connections.lock().clone()
    }

    pub fn connections_to(&self, endpoint: &str) -> Vec<ConnectionRecord> {
        self.connections()
            .into_iter()
            .filter(|record| record.endpoint == endpoint)
            .collect()
    }

    /// Binary frames the server received on an endpoint, in arrival order.
    pub fn inbound_binary(&self, endpoint: &str) -> Vec<Vec<u8>> {
        self.state
            .inbound
            .lock()
            .iter()
            .filter(|(ep, _)| ep == endpoint)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Text frames the server received on an endpoint, in arrival order.
    pub fn inbound_text(&self, endpoint: &str) -> Vec<String> {
        self.state
            .inbound_text
            .lock()
            .iter()
            .filter(|(ep, _)| ep == endpoint)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

impl Drop for WsFixture {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn upgrade(
    State(state): State<Arc<FixtureState>>,
    Path((namespace, name, endpoint)): Path<(String, String, String)>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> axum::response::Response {
    let token = params.get("token").cloned().unwrap_or_default();
    if state.rejected_tokens.lock().contains(&token) {
        return axum::http::StatusCode::UNAUTHORIZED.into_response();
    }
    let seq = state.seq.fetch_add(1, Ordering::SeqCst);
    state.connections.lock().push(ConnectionRecord {
        seq,
        namespace,
        name,
        endpoint: endpoint.clone(),
        token,
    });
    let plan = state
        .plans
        .lock()
        .get_mut(&endpoint)
        .and_then(|queue| queue.pop_front())
        .unwrap_or_else(|| vec![Step::Stay]);
    ws.on_upgrade(move |socket| run_plan(socket, plan, state, endpoint))
        .into_response()
}

async fn run_plan(
    mut socket: WebSocket,
    plan: Vec<Step>,
    state: Arc<FixtureState>,
    endpoint: String,
) {
    for step in plan {
        match step {
            Step::SendText(text) => {
                if socket.send(WsMessage::Text(text)).await.is_err() {
                    return;
                }
            }
            Step::SendBinary(payload) => {
                if socket.send(WsMessage::Binary(payload)).await.is_err() {
                    return;
                }
            }
            Step::Pause(millis) => {
                let wait = tokio::time::sleep(Duration::from_millis(millis));
                tokio::pin!(wait);
                loop {
                    tokio::select! {
                        _ = &mut wait => break,
                        message = socket.recv() => match message {
                            Some(Ok(message)) => record(&state, &endpoint, message),
                            _ => return,
                        },
                    }
                }
            }
            Step::CloseWith(code, reason) => {
                let _ = socket
                    .send(WsMessage::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                return;
            }
            Step::DropDirty => return,
            Step::Stay => {
                drain(&mut socket, &state, &endpoint).await;
                return;
            }
        }
    }
    drain(&mut socket, &state, &endpoint).await;
}

async fn drain(socket: &mut WebSocket, state: &FixtureState, endpoint: &str) {
    while let Some(Ok(message)) = socket.recv().await {
        record(state, endpoint, message);
    }
}

fn record(state: &FixtureState, endpoint: &str, message: WsMessage) {
    match message {
        WsMessage::Binary(payload) => {
            state.inbound.lock().push((endpoint.to_string(), payload));
        }
        WsMessage::Text(text) => {
            state.inbound_text.lock().push((endpoint.to_string(), text));
        }
        _ => {}
    }
}

/// Token provider with scripted refresh behavior.
pub struct MockTokenProvider {
    token: RwLock<String>,
    refreshes: AtomicUsize,
    fail: AtomicBool,
}

impl MockTokenProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            token: RwLock::new("tok-0".into()),
            refreshes: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        })
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn fail_refreshes(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TokenProvider for MockTokenProvider {
    fn current_token(&self) -> String {
        self.token.read().clone()
    }

    async fn refresh_token(&self) -> Result<(), AuthError> {
        let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail.load(Ordering::SeqCst) {
            return Err(AuthError::Rejected(401));
        }
        *self.token.write() = format!("tok-{n}");
        Ok(())
    }
}

/// In-memory session store that emits mutations like the real one.
pub struct MockSessionStore {
    active: Mutex<Option<Session>>,
    audio: AtomicBool,
    recording: AtomicBool,
    probe_fails: AtomicBool,
    deleted: Mutex<Vec<SessionKey>>,
    tx: Mutex<Option<mpsc::UnboundedSender<SessionMutation>>>,
}

impl MockSessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            active: Mutex::new(None),
            audio: AtomicBool::new(false),
            recording: AtomicBool::new(false),
            probe_fails: AtomicBool::new(false),
            deleted: Mutex::new(Vec::new()),
            tx: Mutex::new(None),
        })
    }

    pub fn set_active(&self, session: Option<Session>) {
        *self.active.lock() = session;
        self.emit(SessionMutation::SetActiveSession);
    }

    /// Sets the active session without emitting a mutation, as if it changed
    /// before anyone subscribed.
    pub fn seed_active(&self, session: Option<Session>) {
        *self.active.lock() = session;
    }

    /// Makes subsequent session probes report the workload gone.
    pub fn fail_probes(&self, fail: bool) {
        self.probe_fails.store(fail, Ordering::SeqCst);
    }

    pub fn deleted(&self) -> Vec<SessionKey> {
        self.deleted.lock().clone()
    }

    fn emit(&self, mutation: SessionMutation) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(mutation);
        }
    }
}

#[async_trait]
impl SessionStore for MockSessionStore {
    fn active_session(&self) -> Option<Session> {
        self.active.lock().clone()
    }

    fn audio_enabled(&self) -> bool {
        self.audio.load(Ordering::SeqCst)
    }

    fn recording_enabled(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<SessionMutation> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.tx.lock() = Some(tx);
        rx
    }

    async fn session_status(&self, key: &SessionKey) -> Result<(), StoreError> {
        if self.probe_fails.load(Ordering::SeqCst) {
            Err(StoreError::Gone(key.clone()))
        } else {
            Ok(())
        }
    }

    fn delete_session_offline(&self, key: &SessionKey) {
        self.deleted.lock().push(key.clone());
        let mut active = self.active.lock();
        if active.as_ref().map(|s| &s.key) == Some(key) {
            *active = None;
        }
        drop(active);
        self.emit(SessionMutation::DeleteSession);
    }

    fn toggle_audio(&self, enabled: bool) {
        self.audio.store(enabled, Ordering::SeqCst);
        self.emit(SessionMutation::ToggleAudio);
    }

    fn toggle_recording(&self, enabled: bool) {
        self.recording.store(enabled, Ordering::SeqCst);
        self.emit(SessionMutation::ToggleRecording);
    }
}

/// Rendering surface that records what reaches it.
pub struct MockViewport {
    frames: Mutex<Vec<Bytes>>,
    clipboard: Mutex<Vec<String>>,
    fail_clipboard: AtomicBool,
}

impl MockViewport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(Vec::new()),
            clipboard: Mutex::new(Vec::new()),
            fail_clipboard: AtomicBool::new(false),
        })
    }

    pub fn frames(&self) -> Vec<Bytes> {
        self.frames.lock().clone()
    }

    pub fn clipboard(&self) -> Vec<String> {
        self.clipboard.lock().clone()
    }

    pub fn fail_clipboard(&self, fail: bool) {
        self.fail_clipboard.store(fail, Ordering::SeqCst);
    }
}

impl Viewport for MockViewport {
    fn handle_frame(&self, frame: Bytes) {
        self.frames.lock().push(frame);
    }

    fn write_clipboard(&self, text: &str) -> Result<(), ClipboardError> {
        if self.fail_clipboard.load(Ordering::SeqCst) {
            return Err(ClipboardError("no clipboard access".into()));
        }
        self.clipboard.lock().push(text.to_string());
        Ok(())
    }
}

pub struct MockViewportProvider {
    viewport: Mutex<Option<Arc<dyn Viewport>>>,
}

impl MockViewportProvider {
    pub fn with_viewport(viewport: Arc<MockViewport>) -> Arc<Self> {
        Arc::new(Self {
            viewport: Mutex::new(Some(viewport)),
        })
    }

    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            viewport: Mutex::new(None),
        })
    }
}

impl ViewportProvider for MockViewportProvider {
    fn viewport(&self) -> Option<Arc<dyn Viewport>> {
        self.viewport.lock().clone()
    }
}

/// Playback sink with an externally controlled busy flag.
pub struct MockSink {
    updating: AtomicBool,
    chunks: Mutex<Vec<Bytes>>,
    updated: Arc<Notify>,
}

impl MockSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            updating: AtomicBool::new(false),
            chunks: Mutex::new(Vec::new()),
            updated: Arc::new(Notify::new()),
        })
    }

    pub fn chunks(&self) -> Vec<Bytes> {
        self.chunks.lock().clone()
    }

    pub fn set_updating(&self, updating: bool) {
        self.updating.store(updating, Ordering::SeqCst);
        if !updating {
            // notify_one stores a permit so the signal is not lost when the
            // consumer is between waits.
            self.updated.notify_one();
        }
    }
}

impl AudioSink for MockSink {
    fn updating(&self) -> bool {
        self.updating.load(Ordering::SeqCst)
    }

    fn append(&self, chunk: Bytes) {
        self.chunks.lock().push(chunk);
    }

    fn updated(&self) -> Arc<Notify> {
        self.updated.clone()
    }
}

/// Capture source fed by the test instead of a microphone.
pub struct MockSource {
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    stopped: AtomicBool,
}

impl MockSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tx: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    /// Feeds one captured chunk. Returns false once the source is stopped.
    pub fn push(&self, chunk: impl Into<Bytes>) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.send(chunk.into()).is_ok(),
            None => false,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioSource for MockSource {
    async fn start(&self) -> Result<mpsc::UnboundedReceiver<Bytes>, AudioError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.tx.lock() = Some(tx);
        self.stopped.store(false, Ordering::SeqCst);
        Ok(rx)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.tx.lock().take();
    }
}

pub struct MockAudioBackend {
    pub sink: Arc<MockSink>,
    pub source: Arc<MockSource>,
}

impl MockAudioBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sink: MockSink::new(),
            source: MockSource::new(),
        })
    }
}

impl AudioBackend for MockAudioBackend {
    fn create_sink(&self) -> Arc<dyn AudioSink> {
        self.sink.clone()
    }

    fn create_source(&self) -> Arc<dyn AudioSource> {
        self.source.clone()
    }
}

/// Captures everything published on an event channel, with polling waits.
#[derive(Clone)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<ClientEvent>>>,
}

impl EventRecorder {
    pub fn attach(channel: &EventChannel) -> Self {
        let events: Arc<Mutex<Vec<ClientEvent>>> = Arc::new(Mutex::new(Vec::new()));
        for kind in [
            EventKind::Connected,
            EventKind::Disconnected,
            EventKind::Update,
            EventKind::Error,
        ] {
            let sink = events.clone();
            channel.subscribe(kind, move |event| sink.lock().push(event.clone()));
        }
        Self { events }
    }

    pub fn snapshot(&self) -> Vec<ClientEvent> {
        self.events.lock().clone()
    }

    pub fn updates(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter_map(|event| match event {
                ClientEvent::Update(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter_map(|event| match event {
                ClientEvent::Error(text) => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn disconnects(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|event| matches!(event, ClientEvent::Disconnected(_)))
            .count()
    }

    pub async fn wait_for(&self, what: &str, pred: impl Fn(&[ClientEvent]) -> bool) {
        let deadline = Duration::from_secs(5);
        let result = tokio::time::timeout(deadline, async {
            loop {
                if pred(&self.events.lock()) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        if result.is_err() {
            panic!("timed out waiting for {what}; events so far: {:?}", self.snapshot());
        }
    }
}

/// Polls an arbitrary condition until it holds or the wait times out.
pub async fn wait_until(what: &str, pred: impl Fn() -> bool) {
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if pred() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    if result.is_err() {
        panic!("timed out waiting for {what}");
    }
}
