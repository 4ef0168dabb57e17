use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::addresses::{self, DesktopAddresses};
use crate::audio::{AudioBackend, AudioSession};
use crate::auth::TokenProvider;
use crate::display::{DisplayError, DisplayProtocol, new_display};
use crate::error::ClientError;
use crate::events::{ClientEvent, EventChannel, EventKind};
use crate::model::{Session, SessionKey, SessionMutation};
use crate::status::StatusHandshake;
use crate::store::SessionStore;
use crate::transport::CloseInfo;
use crate::viewport::ViewportProvider;

/// Internal signals routed back to the driver task so every state change is
/// applied from one place, in arrival order.
enum Notice {
    DisplayClosed(Option<CloseInfo>),
    AudioDisconnected,
}

/// What is currently wired up for the session being followed. All transitions
/// happen under one lock, so a teardown always completes before the setup
/// that replaces it begins.
struct Wiring {
    current: Option<Session>,
    status: Option<StatusHandshake>,
    display: Option<Box<dyn DisplayProtocol>>,
    audio: Option<Arc<AudioSession>>,
}

struct ManagerCore {
    base: Url,
    store: Arc<dyn SessionStore>,
    tokens: Arc<dyn TokenProvider>,
    viewports: Arc<dyn ViewportProvider>,
    audio_backend: Arc<dyn AudioBackend>,
    events: EventChannel,
    ready_tx: mpsc::UnboundedSender<SessionKey>,
    notices: mpsc::UnboundedSender<Notice>,
    state: AsyncMutex<Wiring>,
}

/// Drives the full lifecycle of desktop connections against the session
/// store: reacts to store mutations, runs the status handshake until the
/// desktop is ready, then owns the display and audio channels for the
/// session until it is switched away from, disconnected, or lost.
///
/// UI-facing lifecycle events are published on [`events`]; an explicitly
/// requested [`disconnect`] is quiet.
///
/// [`events`]: SessionConnectionManager::events
/// [`disconnect`]: SessionConnectionManager::disconnect
pub struct SessionConnectionManager {
    core: Arc<ManagerCore>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl SessionConnectionManager {
    pub fn new(
        base_url: &Url,
        store: Arc<dyn SessionStore>,
        tokens: Arc<dyn TokenProvider>,
        viewports: Arc<dyn ViewportProvider>,
        audio_backend: Arc<dyn AudioBackend>,
    ) -> Result<Self, ClientError> {
        let base = addresses::to_ws_base(base_url)?;
        let mutations = store.subscribe();
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let current = store.active_session();

        let core = Arc::new(ManagerCore {
            base,
            store,
            tokens,
            viewports,
            audio_backend,
            events: EventChannel::new(),
            ready_tx,
            notices: notice_tx,
            state: AsyncMutex::new(Wiring {
                current,
                status: None,
                display: None,
                audio: None,
            }),
        });

        let driver = tokio::spawn(drive(core.clone(), mutations, ready_rx, notice_rx));
        Ok(Self {
            core,
            driver: Mutex::new(Some(driver)),
        })
    }

    /// UI-facing lifecycle events for the managed connections.
    pub fn events(&self) -> &EventChannel {
        &self.core.events
    }

    /// Begins connecting to the store's active session by opening the status
    /// handshake. A no-op when there is no active session or a connection is
    /// already being set up.
    pub async fn connect(&self) {
        let mut state = self.core.state.lock().await;
        if state.display.is_some() {
            debug!("connection already live");
            return;
        }
        if state.status.as_ref().is_some_and(|status| status.is_live()) {
            debug!("connection already in progress");
            return;
        }
        // A handshake that terminated on its own still occupies the slot.
        state.status = None;
        if state.current.is_none() {
            state.current = self.core.store.active_session();
        }
        let Some(session) = state.current.clone() else {
            debug!("connect requested with no active session");
            return;
        };
        info!(session = %session.key, "connecting to desktop session");
        self.core.open_status(&mut state, &session);
    }

    /// Tears down every channel for the current session without publishing
    /// lifecycle events. Idempotent.
    pub async fn disconnect(&self) {
        let mut state = self.core.state.lock().await;
        self.core.teardown(&mut state).await;
    }

    /// Forwards local clipboard contents to the connected display, when the
    /// protocol supports it. Ignored while no display is connected.
    pub async fn send_clipboard(&self, text: &str) {
        let state = self.core.state.lock().await;
        match &state.display {
            Some(display) => display.send_clipboard(text),
            None => debug!("clipboard ignored, no display connection"),
        }
    }

    /// The session the manager is currently following, if any.
    pub async fn current_session(&self) -> Option<Session> {
        self.core.state.lock().await.current.clone()
    }

    pub async fn has_current_session(&self) -> bool {
        self.core.state.lock().await.current.is_some()
    }

    /// Stops the driver, tears down every channel, and detaches all event
    /// handlers. The manager is unusable afterwards.
    pub async fn destroy(&self) {
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
        let mut state = self.core.state.lock().await;
        self.core.teardown(&mut state).await;
        drop(state);
        self.core.events.detach_all();
    }
}

impl Drop for SessionConnectionManager {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
    }
}

/// The single event-processing loop: store mutations, readiness hand-offs
/// and transport notices are serialized here so no two transitions race.
async fn drive(
    core: Arc<ManagerCore>,
    mut mutations: mpsc::UnboundedReceiver<SessionMutation>,
    mut ready: mpsc::UnboundedReceiver<SessionKey>,
    mut notices: mpsc::UnboundedReceiver<Notice>,
) {
    loop {
        tokio::select! {
            Some(mutation) = mutations.recv() => core.handle_mutation(mutation).await,
            Some(key) = ready.recv() => core.handle_ready(key).await,
            Some(notice) = notices.recv() => match notice {
                Notice::DisplayClosed(info) => core.handle_display_closed(info).await,
                Notice::AudioDisconnected => core.handle_audio_disconnected().await,
            },
            else => return,
        }
    }
}

impl ManagerCore {
    async fn handle_mutation(&self, mutation: SessionMutation) {
        match mutation {
            SessionMutation::SetActiveSession => {
                let active = self.store.active_session();
                let mut state = self.state.lock().await;
                match active {
                    None => self.teardown(&mut state).await,
                    Some(session) => {
                        let same = state
                            .current
                            .as_ref()
                            .is_some_and(|current| current.key == session.key);
                        if same {
                            debug!(session = %session.key, "already following this session");
                            return;
                        }
                        self.teardown(&mut state).await;
                        info!(session = %session.key, "switching to new active session");
                        state.current = Some(session.clone());
                        self.open_status(&mut state, &session);
                    }
                }
            }
            SessionMutation::DeleteSession => {
                // Deleting the followed session also clears the store's
                // active slot, which arrives as its own mutation.
                let mut state = self.state.lock().await;
                state.current = self.store.active_session();
            }
            SessionMutation::ToggleAudio | SessionMutation::ToggleRecording => {
                self.sync_audio().await;
            }
        }
    }

    /// The status handshake reported the desktop ready: drop the handshake
    /// and open the display channel, with one token-refresh retry.
    async fn handle_ready(&self, key: SessionKey) {
        let mut state = self.state.lock().await;
        let current = match &state.current {
            Some(current) if current.key == key => current.clone(),
            _ => {
                debug!(session = %key, "readiness signal for a superseded session");
                return;
            }
        };
        if state.display.is_some() {
            return;
        }
        if let Some(status) = state.status.take() {
            status.close();
        }

        info!(session = %current.key, "launching display connection");
        if let Err(err) = self.create_connection(&mut state).await {
            warn!(error = %err, "display connection failed, retrying with refreshed token");
            let retry = match self.tokens.refresh_token().await {
                Ok(()) => self
                    .create_connection(&mut state)
                    .await
                    .map_err(ClientError::from),
                Err(err) => Err(err.into()),
            };
            if let Err(err) = retry {
                self.events.publish(ClientEvent::Disconnected(None));
                self.events.publish(ClientEvent::Error(err.to_string()));
            }
        }
    }

    /// Opens the display channel for the current session and wires its
    /// lifecycle events into the manager's channel and driver.
    async fn create_connection(&self, state: &mut Wiring) -> Result<(), DisplayError> {
        let Some(session) = state.current.clone() else {
            return Ok(());
        };
        let Some(viewport) = self.viewports.viewport() else {
            warn!(session = %session.key, "no viewport available, skipping display connection");
            return Ok(());
        };
        let Some(addresses) = self.addresses_for(&session.key) else {
            return Ok(());
        };

        let display = new_display(session.socket_type);

        let ui = self.events.clone();
        display
            .events()
            .subscribe(EventKind::Connected, move |event| ui.publish(event.clone()));
        let ui = self.events.clone();
        display
            .events()
            .subscribe(EventKind::Error, move |event| ui.publish(event.clone()));
        let ui = self.events.clone();
        let notices = self.notices.clone();
        display
            .events()
            .subscribe(EventKind::Disconnected, move |event| {
                ui.publish(event.clone());
                if let ClientEvent::Disconnected(info) = event {
                    let _ = notices.send(Notice::DisplayClosed(info.clone()));
                }
            });

        display.connect(viewport, addresses.display_url()).await?;
        state.display = Some(display);
        Ok(())
    }

    /// The display channel closed without being asked to. A clean close means
    /// the desktop may simply be gone, so the session is probed and pruned;
    /// an unclean close restarts the status handshake to reconnect.
    async fn handle_display_closed(&self, info: Option<CloseInfo>) {
        let mut state = self.state.lock().await;
        let Some(session) = state.current.clone() else {
            return;
        };
        state.display = None;
        if let Some(audio) = state.audio.take() {
            audio.close().await;
            self.store.toggle_audio(false);
            self.store.toggle_recording(false);
        }

        let clean = info.as_ref().map(CloseInfo::is_clean).unwrap_or(true);
        if clean {
            if let Err(err) = self.store.session_status(&session.key).await {
                debug!(session = %session.key, error = %err, "session gone after clean close");
                self.store.delete_session_offline(&session.key);
                self.events
                    .publish(ClientEvent::Error(ClientError::SessionGone.to_string()));
            }
            state.current = self.store.active_session();
        } else {
            warn!(session = %session.key, "display connection lost, restarting status handshake");
            state.current = self.store.active_session();
            if let Some(session) = state.current.clone() {
                self.open_status(&mut state, &session);
            }
        }
    }

    /// The audio pump gave up on its transport. The session object is spent
    /// at this point, so drop it and reset the store toggles to match.
    async fn handle_audio_disconnected(&self) {
        let mut state = self.state.lock().await;
        if let Some(audio) = state.audio.take() {
            audio.close().await;
        }
        self.store.toggle_audio(false);
        self.store.toggle_recording(false);
    }

    /// Reconciles the audio pipeline with the store's toggle state.
    async fn sync_audio(&self) {
        let mut state = self.state.lock().await;
        let Some(session) = state.current.clone() else {
            debug!("audio toggled with no connected session");
            return;
        };

        let audio_on = self.store.audio_enabled();
        let recording_on = self.store.recording_enabled();

        if !audio_on && !recording_on {
            if let Some(audio) = state.audio.take() {
                audio.close().await;
            }
            return;
        }

        let audio = match &state.audio {
            Some(audio) => audio.clone(),
            None => {
                let Some(addresses) = self.addresses_for(&session.key) else {
                    return;
                };
                let audio = Arc::new(AudioSession::new(
                    addresses,
                    self.tokens.clone(),
                    self.audio_backend.clone(),
                ));
                let ui = self.events.clone();
                audio
                    .events()
                    .subscribe(EventKind::Error, move |event| ui.publish(event.clone()));
                let notices = self.notices.clone();
                audio.events().subscribe(EventKind::Disconnected, move |_| {
                    let _ = notices.send(Notice::AudioDisconnected);
                });
                state.audio = Some(audio.clone());
                audio
            }
        };

        if let Err(err) = audio.start_playback().await {
            self.events.publish(ClientEvent::Error(format!(
                "failed to start audio stream: {err}"
            )));
            if let Some(audio) = state.audio.take() {
                audio.close().await;
            }
            return;
        }

        if recording_on {
            if let Err(err) = audio.start_recording().await {
                self.events.publish(ClientEvent::Error(format!(
                    "failed to start audio recording: {err}"
                )));
            }
        } else {
            audio.stop_recording().await;
        }
    }

    fn open_status(&self, state: &mut Wiring, session: &Session) {
        let Some(addresses) = self.addresses_for(&session.key) else {
            return;
        };
        state.status = Some(StatusHandshake::open(
            addresses,
            self.tokens.clone(),
            self.events.clone(),
            self.ready_tx.clone(),
        ));
    }

    /// Endpoint URLs for one session. The base scheme was validated at
    /// construction, so a failure here is a bug; it is surfaced as an error
    /// event rather than a panic.
    fn addresses_for(&self, key: &SessionKey) -> Option<DesktopAddresses> {
        match DesktopAddresses::new(&self.base, self.tokens.clone(), key.clone()) {
            Ok(addresses) => Some(addresses),
            Err(err) => {
                self.events.publish(ClientEvent::Error(err.to_string()));
                None
            }
        }
    }

    /// Quietly closes everything wired up for the current session.
    async fn teardown(&self, state: &mut Wiring) {
        if let Some(status) = state.status.take() {
            status.close();
        }
        if let Some(display) = state.display.take() {
            display.disconnect().await;
        }
        if let Some(audio) = state.audio.take() {
            audio.close().await;
            self.store.toggle_audio(false);
            self.store.toggle_recording(false);
        }
        state.current = None;
    }
}
