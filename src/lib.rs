//! Client-side orchestration for remote desktop sessions.
//!
//! The crate follows a session store's notion of the active desktop and
//! manages the websocket channels that serve it: a status handshake that
//! waits for the desktop to boot, a display channel (VNC- or
//! SPICE-compatible) feeding a [`viewport::Viewport`], and an optional
//! bidirectional audio stream. [`manager::SessionConnectionManager`] ties
//! the pieces together; each piece is also usable on its own.

pub mod addresses;
pub mod audio;
pub mod auth;
pub mod display;
pub mod error;
pub mod events;
pub mod manager;
pub mod model;
pub mod status;
pub mod store;
pub mod transport;
pub mod viewport;

pub use addresses::DesktopAddresses;
pub use audio::{AudioBackend, AudioSession, AudioSink, AudioSource};
pub use auth::{HttpTokenProvider, TokenProvider};
pub use display::{DisplayProtocol, new_display};
pub use error::ClientError;
pub use events::{ClientEvent, EventChannel, EventKind};
pub use manager::SessionConnectionManager;
pub use model::{Session, SessionKey, SessionMutation, SocketType, StatusMessage};
pub use status::StatusHandshake;
pub use store::SessionStore;
pub use transport::{CloseInfo, TransportEvent, WsTransport};
pub use viewport::{Viewport, ViewportProvider};
