use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::transport::CloseInfo;

/// The lifecycle event kinds every stateful component emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    Update,
    Error,
}

/// A lifecycle event with its payload.
///
/// `Disconnected` carries the close details of the underlying transport when
/// the closure was unsolicited; `None` means the closure had no transport
/// detail attached (treated as clean).
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected,
    Disconnected(Option<CloseInfo>),
    Update(String),
    Error(String),
}

impl ClientEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ClientEvent::Connected => EventKind::Connected,
            ClientEvent::Disconnected(_) => EventKind::Disconnected,
            ClientEvent::Update(_) => EventKind::Update,
            ClientEvent::Error(_) => EventKind::Error,
        }
    }
}

type Handler = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

/// Minimal typed publish/subscribe channel.
///
/// Handlers for a kind run synchronously in registration order. Handlers must
/// not panic. The channel is cheaply cloneable; clones share the same
/// handler registry, so a component and its owner can publish through the
/// same channel.
#[derive(Clone, Default)]
pub struct EventChannel {
    handlers: Arc<Mutex<HashMap<EventKind, Vec<Handler>>>>,
}

impl EventChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    pub fn publish(&self, event: ClientEvent) {
        // Snapshot under the lock so a handler can subscribe or publish
        // without deadlocking.
        let handlers: Vec<Handler> = self
            .handlers
            .lock()
            .get(&event.kind())
            .map(|hs| hs.to_vec())
            .unwrap_or_default();
        for handler in handlers {
            handler(&event);
        }
    }

    /// Drops every registered handler. Used when a manager is destroyed so a
    /// recreated one does not leak subscriptions into the old consumers.
    pub fn detach_all(&self) {
        self.handlers.lock().clear();
    }
}

impl std::fmt::Debug for EventChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: Vec<(EventKind, usize)> = self
            .handlers
            .lock()
            .iter()
            .map(|(kind, hs)| (*kind, hs.len()))
            .collect();
        f.debug_struct("EventChannel").field("handlers", &counts).finish()
    }
}
