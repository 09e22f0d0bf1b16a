//! Named asynchronous event fan-out.
//!
//! Every handler registered for an event runs on its own tokio task when
//! the event is pushed; a panicking handler is logged and does not affect
//! the others.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use tracing::{trace, warn};
use uuid::Uuid;

use crate::connection::Connection;
use crate::packet::Packet;

pub type EventHandler = Arc<dyn Fn(NetworkEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handle returned by listener registration; used to remove the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(Uuid);

impl HandlerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ── NetworkEvent ─────────────────────────────────────────────────

/// Arguments delivered to event handlers.
#[derive(Debug, Clone, Default)]
pub struct NetworkEvent {
    pub connection: Option<Connection>,
    pub packet: Option<Arc<Packet>>,
    pub raw: Option<Bytes>,
    pub message: Option<String>,
}

impl NetworkEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_connection(connection: &Connection) -> Self {
        Self {
            connection: Some(connection.clone()),
            ..Self::default()
        }
    }

    pub fn with_packet(mut self, packet: Arc<Packet>) -> Self {
        self.packet = Some(packet);
        self
    }

    pub fn with_raw(mut self, raw: Bytes) -> Self {
        self.raw = Some(raw);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

// ── Event names ──────────────────────────────────────────────────

/// Events fired by a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEvent {
    Started,
    ClientConnected,
    ClientDisconnected,
    DataReceived,
    DataSent,
    Error,
    VerifyClient,
    CommandExecuted,
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Started => "OnServerStarted",
            Self::ClientConnected => "OnClientConnected",
            Self::ClientDisconnected => "OnClientDisconnected",
            Self::DataReceived => "OnDataReceived",
            Self::DataSent => "OnDataSent",
            Self::Error => "OnError",
            Self::VerifyClient => "OnVerifyClient",
            Self::CommandExecuted => "OnCommandExecuted",
        }
    }
}

/// Events fired by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    Received,
    Error,
    DataSent,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected => "OnConnected",
            Self::Disconnected => "OnDisconnected",
            Self::Received => "OnReceived",
            Self::Error => "OnError",
            Self::DataSent => "OnDataSent",
        }
    }
}

// ── EventSystem ──────────────────────────────────────────────────

struct Listener {
    event: String,
    unique_id: Option<String>,
    handler: EventHandler,
}

#[derive(Default)]
pub struct EventSystem {
    by_event: DashMap<String, Vec<HandlerId>>,
    listeners: DashMap<HandlerId, Listener>,
}

impl EventSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener<F, Fut>(&self, event: &str, handler: F) -> HandlerId
    where
        F: Fn(NetworkEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.insert(event, None, boxed(handler))
    }

    /// Register unless a listener with `unique_id` already exists for
    /// `event`; in that case the existing handle is returned.
    pub fn add_listener_with_id<F, Fut>(&self, event: &str, unique_id: &str, handler: F) -> HandlerId
    where
        F: Fn(NetworkEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.insert(event, Some(unique_id.to_string()), boxed(handler))
    }

    fn insert(&self, event: &str, unique_id: Option<String>, handler: EventHandler) -> HandlerId {
        let mut ids = self.by_event.entry(event.to_string()).or_default();
        if let Some(unique) = unique_id.as_deref() {
            let existing = ids.iter().copied().find(|id| {
                self.listeners
                    .get(id)
                    .is_some_and(|l| l.unique_id.as_deref() == Some(unique))
            });
            if let Some(id) = existing {
                return id;
            }
        }
        let id = HandlerId::new();
        self.listeners.insert(
            id,
            Listener {
                event: event.to_string(),
                unique_id,
                handler,
            },
        );
        ids.push(id);
        id
    }

    /// Remove a listener by handle. Returns `false` if it was already gone.
    pub fn remove_listener(&self, id: HandlerId) -> bool {
        let Some((_, listener)) = self.listeners.remove(&id) else {
            return false;
        };
        if let Some(mut ids) = self.by_event.get_mut(&listener.event) {
            ids.retain(|existing| *existing != id);
        }
        true
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.by_event.get(event).map_or(0, |ids| ids.len())
    }

    pub fn clear(&self) {
        self.by_event.clear();
        self.listeners.clear();
    }

    /// Run every handler of `event` concurrently and wait for all of them.
    ///
    /// Returns the number of handlers invoked.
    pub async fn push_event(&self, event: &str, args: NetworkEvent) -> usize {
        let handlers: Vec<(HandlerId, EventHandler)> = match self.by_event.get(event) {
            Some(ids) => ids
                .iter()
                .filter_map(|id| {
                    self.listeners
                        .get(id)
                        .map(|l| (*id, Arc::clone(&l.handler)))
                })
                .collect(),
            None => return 0,
        };
        if handlers.is_empty() {
            return 0;
        }
        trace!(event, handlers = handlers.len(), "pushing event");

        let running: Vec<_> = handlers
            .into_iter()
            .map(|(id, handler)| {
                let args = args.clone();
                (id, tokio::spawn(async move { handler(args).await }))
            })
            .collect();
        let count = running.len();

        let (ids, joins): (Vec<_>, Vec<_>) = running.into_iter().unzip();
        for (id, result) in ids.into_iter().zip(join_all(joins).await) {
            if let Err(e) = result {
                if e.is_panic() {
                    warn!(event, handler = %id, "event handler panicked");
                } else {
                    warn!(event, handler = %id, "event handler was cancelled");
                }
            }
        }
        count
    }
}

fn boxed<F, Fut>(handler: F) -> EventHandler
where
    F: Fn(NetworkEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |args| handler(args).boxed())
}

impl fmt::Debug for EventSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSystem")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(
        counter: &Arc<AtomicUsize>,
    ) -> impl Fn(NetworkEvent) -> BoxFuture<'static, ()> + Send + Sync + 'static {
        let counter = counter.clone();
        move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn every_handler_runs() {
        let events = EventSystem::new();
        let hits = Arc::new(AtomicUsize::new(0));
        events.add_listener("tick", counting(&hits));
        events.add_listener("tick", counting(&hits));
        events.add_listener("other", counting(&hits));

        assert_eq!(events.push_event("tick", NetworkEvent::new()).await, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(events.push_event("missing", NetworkEvent::new()).await, 0);
    }

    #[tokio::test]
    async fn unique_id_deduplicates() {
        let events = EventSystem::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let a = events.add_listener_with_id("tick", "dispatch", counting(&hits));
        let b = events.add_listener_with_id("tick", "dispatch", counting(&hits));
        assert_eq!(a, b);
        assert_eq!(events.listener_count("tick"), 1);

        events.push_event("tick", NetworkEvent::new()).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn removed_listener_is_not_called() {
        let events = EventSystem::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = events.add_listener("tick", counting(&hits));
        assert!(events.remove_listener(id));
        assert!(!events.remove_listener(id));

        events.push_event("tick", NetworkEvent::new()).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_handler_is_isolated() {
        let events = EventSystem::new();
        let hits = Arc::new(AtomicUsize::new(0));
        events.add_listener("tick", |_| async {
            let boom: Option<()> = None;
            boom.expect("handler bug");
        });
        events.add_listener("tick", counting(&hits));

        assert_eq!(events.push_event("tick", NetworkEvent::new()).await, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handlers_see_arguments() {
        let events = EventSystem::new();
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let sink = seen.clone();
        events.add_listener("msg", move |args: NetworkEvent| {
            let sink = sink.clone();
            async move {
                *sink.lock() = args.message;
            }
        });
        events
            .push_event("msg", NetworkEvent::new().with_message("hi"))
            .await;
        assert_eq!(seen.lock().as_deref(), Some("hi"));
    }
}
