use model::Service;

use crate::Error;

/// Subscription mask. Events outside the mask are never queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTypes(u32);

impl EventTypes {
    pub const CONTEXT: EventTypes = EventTypes(1);
    pub const SERVICE: EventTypes = EventTypes(1 << 1);
    pub const ROUTER: EventTypes = EventTypes(1 << 2);
    pub const AUTH: EventTypes = EventTypes(1 << 3);
    pub const ALL: EventTypes = EventTypes(0b1111);

    pub fn contains(&self, other: EventTypes) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for EventTypes {
    type Output = EventTypes;

    fn bitor(self, rhs: EventTypes) -> EventTypes {
        EventTypes(self.0 | rhs.0)
    }
}

impl Default for EventTypes {
    fn default() -> Self {
        Self::ALL
    }
}

/// Controller reachability as seen by the control loop. Emitted only on
/// transitions.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextEvent {
    pub status: Result<(), Error>,
    pub message: Option<String>,
}

/// One catalog refresh worth of changes. The three sets are disjoint.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceEvent {
    pub added: Vec<Service>,
    pub changed: Vec<Service>,
    pub removed: Vec<Service>,
}

impl ServiceEvent {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterStatus {
    Connected,
    Disconnected,
    /// The controller no longer lists the router; its channel was torn down.
    Removed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouterEvent {
    pub name: String,
    pub address: String,
    pub version: Option<String>,
    pub status: RouterStatus,
}

/// Authentication needs attention beyond the certificate exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthEvent {
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Context(ContextEvent),
    Service(ServiceEvent),
    Router(RouterEvent),
    Auth(AuthEvent),
}

impl Event {
    pub(crate) fn kind(&self) -> EventTypes {
        match self {
            Event::Context(_) => EventTypes::CONTEXT,
            Event::Service(_) => EventTypes::SERVICE,
            Event::Router(_) => EventTypes::ROUTER,
            Event::Auth(_) => EventTypes::AUTH,
        }
    }
}

/// Fan-out of context events to subscribers, filtered by the subscription
/// mask from the options.
#[derive(Clone)]
pub(crate) struct EventSink {
    tx: tokio::sync::broadcast::Sender<Event>,
    mask: EventTypes,
}

impl EventSink {
    pub fn new(mask: EventTypes) -> Self {
        Self {
            tx: tokio::sync::broadcast::channel(64).0,
            mask,
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: Event) {
        if self.mask.contains(event.kind()) && self.tx.receiver_count() > 0 {
            let _ = self.tx.send(event);
        }
    }
}
