//! Change notification
//!
//! Every kernel entity is addressed by an [`EntityRef`] handle. Mutating
//! operations queue [`ChangeEvent`]s in an [`EventQueue`] owned by the arena
//! that performed the change; the [`crate::Document`] drains those queues
//! into its [`EventBus`] before returning to the caller, so listeners run
//! synchronously inside the call that produced the change.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

use crate::geometry::Axis;

/// Kind of change carried by an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    ObjectAdded,
    ObjectRemoved,
    ValueChanged,
    BeforeObjectAdded,
    BeforeObjectRemoved,
    Cleared,
    Deleted,
    HiddenChanged,
    ObjectChanged,
}

/// Handle of a kernel entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityRef {
    Scope(Uuid),
    Parameter(Uuid),
    Sketch(Uuid),
    KeyPoint(Uuid),
    Edge(Uuid),
    Area(Uuid),
    Text(Uuid),
    SketchInstance(Uuid),
}

impl EntityRef {
    /// Get the referenced ID
    pub fn id(&self) -> Uuid {
        match self {
            EntityRef::Scope(id)
            | EntityRef::Parameter(id)
            | EntityRef::Sketch(id)
            | EntityRef::KeyPoint(id)
            | EntityRef::Edge(id)
            | EntityRef::Area(id)
            | EntityRef::Text(id)
            | EntityRef::SketchInstance(id) => *id,
        }
    }

    /// Get the entity type name
    pub fn type_name(&self) -> &'static str {
        match self {
            EntityRef::Scope(_) => "Scope",
            EntityRef::Parameter(_) => "Parameter",
            EntityRef::Sketch(_) => "Sketch",
            EntityRef::KeyPoint(_) => "KeyPoint",
            EntityRef::Edge(_) => "Edge",
            EntityRef::Area(_) => "Area",
            EntityRef::Text(_) => "Text",
            EntityRef::SketchInstance(_) => "SketchInstance",
        }
    }
}

/// Payload of a change event
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum ChangeDetail {
    #[default]
    None,
    /// A parameter value changed, for the base value or one instance
    Value {
        old: f64,
        new: f64,
        instance: Option<Uuid>,
        old_formula: Option<String>,
        new_formula: Option<String>,
    },
    /// An entity was renamed
    Renamed { old: String, new: String },
    /// Visibility flag changed
    Hidden { old: bool, new: bool },
    /// Lock flag changed
    Locked { old: bool, new: bool },
    /// A key point coordinate changed
    Coordinate {
        axis: Axis,
        old: f64,
        new: f64,
        instance: Option<Uuid>,
    },
    /// An edge meta-data value changed
    MetaData { name: String, old: f64, new: f64 },
}

/// A single change notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Entity that emitted the event
    pub sender: EntityRef,
    /// Kind of change
    pub kind: ChangeKind,
    /// Entity the change is about (the sender itself, or a child for container events)
    pub object: EntityRef,
    /// Change payload
    pub detail: ChangeDetail,
}

impl ChangeEvent {
    /// Create an event about `object` emitted by `sender`
    pub fn new(sender: EntityRef, kind: ChangeKind, object: EntityRef) -> Self {
        Self {
            sender,
            kind,
            object,
            detail: ChangeDetail::None,
        }
    }

    /// Create an event an entity emits about itself
    pub fn about(entity: EntityRef, kind: ChangeKind) -> Self {
        Self::new(entity, kind, entity)
    }

    /// Deleted notification for an entity
    pub fn deleted(entity: EntityRef) -> Self {
        Self::about(entity, ChangeKind::Deleted)
    }

    /// Attach a payload
    pub fn with_detail(mut self, detail: ChangeDetail) -> Self {
        self.detail = detail;
        self
    }

    /// Check whether this event concerns `entity` as sender or object
    pub fn concerns(&self, entity: EntityRef) -> bool {
        self.sender == entity || self.object == entity
    }
}

/// Pending events of one arena, in emission order
#[derive(Debug, Clone, Default)]
pub struct EventQueue {
    events: Vec<ChangeEvent>,
}

impl EventQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an event
    pub fn push(&mut self, event: ChangeEvent) {
        self.events.push(event);
    }

    /// Queue the usual "before added / added" pair for a container child
    pub fn added(&mut self, container: EntityRef, child: EntityRef) {
        self.push(ChangeEvent::new(container, ChangeKind::BeforeObjectAdded, child));
        self.push(ChangeEvent::new(container, ChangeKind::ObjectAdded, child));
    }

    /// Queue the usual "before removed / removed" pair followed by the child's own Deleted
    pub fn removed(&mut self, container: EntityRef, child: EntityRef) {
        self.push(ChangeEvent::new(container, ChangeKind::BeforeObjectRemoved, child));
        self.push(ChangeEvent::new(container, ChangeKind::ObjectRemoved, child));
        self.push(ChangeEvent::deleted(child));
    }

    /// Number of pending events
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if no events are pending
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Peek at pending events
    pub fn pending(&self) -> &[ChangeEvent] {
        &self.events
    }

    /// Take all pending events
    pub fn drain(&mut self) -> Vec<ChangeEvent> {
        std::mem::take(&mut self.events)
    }
}

/// Subscription handle for unsubscribing from events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sub({})", &self.0.to_string()[..8])
    }
}

/// Filter to receive only some events
#[derive(Debug, Clone, Default)]
pub enum EventFilter {
    /// Receive all events
    #[default]
    All,
    /// Receive events of any of these kinds
    Kinds(Vec<ChangeKind>),
    /// Receive events sent by or about one entity
    Entity(EntityRef),
}

impl EventFilter {
    /// Check if an event matches this filter
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Kinds(kinds) => kinds.contains(&event.kind),
            EventFilter::Entity(entity) => event.concerns(*entity),
        }
    }
}

type EventHandler = Box<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Configuration for the event bus
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Whether to keep published events
    pub enable_history: bool,
    /// Maximum number of events to retain in history
    pub max_history_size: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            enable_history: false,
            max_history_size: 1000,
        }
    }
}

impl EventBusConfig {
    /// Enable history with the given capacity
    pub fn with_history(mut self, max_history_size: usize) -> Self {
        self.enable_history = true;
        self.max_history_size = max_history_size;
        self
    }
}

/// Synchronous dispatcher for change events.
///
/// Handlers are called in subscription order.
#[derive(Default)]
pub struct EventBus {
    handlers: Vec<(SubscriptionId, EventFilter, EventHandler)>,
    history: VecDeque<ChangeEvent>,
    config: EventBusConfig,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.handlers.len())
            .field("history", &self.history.len())
            .field("config", &self.config)
            .finish()
    }
}

impl EventBus {
    /// Create a new event bus with default configuration
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    /// Create a new event bus with custom configuration
    pub fn with_config(config: EventBusConfig) -> Self {
        Self {
            handlers: Vec::new(),
            history: VecDeque::new(),
            config,
        }
    }

    /// Publish an event to all matching subscribers.
    ///
    /// Returns the number of handlers that received it.
    pub fn publish(&mut self, event: ChangeEvent) -> usize {
        let mut delivered = 0;
        for (_, filter, handler) in &self.handlers {
            if filter.matches(&event) {
                handler(&event);
                delivered += 1;
            }
        }
        if self.config.enable_history {
            self.history.push_back(event);
            while self.history.len() > self.config.max_history_size {
                self.history.pop_front();
            }
        }
        delivered
    }

    /// Publish a batch of events in order
    pub fn publish_all(&mut self, events: impl IntoIterator<Item = ChangeEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    /// Subscribe to events with a synchronous handler
    pub fn subscribe<F>(&mut self, filter: EventFilter, handler: F) -> SubscriptionId
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId::new();
        self.handlers.push((id, filter, Box::new(handler)));
        tracing::debug!("Subscription {} added", id);
        id
    }

    /// Unsubscribe from events.
    ///
    /// Returns true if the subscription was found and removed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(sub, _, _)| *sub != id);
        let removed = self.handlers.len() != before;
        if removed {
            tracing::debug!("Subscription {} removed", id);
        }
        removed
    }

    /// Get the number of active subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.handlers.len()
    }

    /// Get retained events, oldest first
    pub fn history(&self) -> impl Iterator<Item = &ChangeEvent> {
        self.history.iter()
    }

    /// Clear retained events
    pub fn clear_history(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_publish_respects_filter() {
        let mut bus = EventBus::new();
        let received = Arc::new(Mutex::new(Vec::new()));

        let sink = received.clone();
        bus.subscribe(EventFilter::Kinds(vec![ChangeKind::Deleted]), move |e| {
            sink.lock().push(e.clone());
        });

        let entity = EntityRef::Edge(Uuid::new_v4());
        assert_eq!(bus.publish(ChangeEvent::about(entity, ChangeKind::ValueChanged)), 0);
        assert_eq!(bus.publish(ChangeEvent::deleted(entity)), 1);

        let received = received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].kind, ChangeKind::Deleted);
    }

    #[test]
    fn test_entity_filter() {
        let mut bus = EventBus::new();
        let count = Arc::new(Mutex::new(0));
        let watched = EntityRef::KeyPoint(Uuid::new_v4());

        let sink = count.clone();
        bus.subscribe(EventFilter::Entity(watched), move |_| *sink.lock() += 1);

        bus.publish(ChangeEvent::deleted(watched));
        bus.publish(ChangeEvent::deleted(EntityRef::KeyPoint(Uuid::new_v4())));
        bus.publish(ChangeEvent::new(
            EntityRef::Sketch(Uuid::new_v4()),
            ChangeKind::ObjectRemoved,
            watched,
        ));

        assert_eq!(*count.lock(), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let mut bus = EventBus::new();
        let id = bus.subscribe(EventFilter::All, |_| {});
        assert_eq!(bus.subscriber_count(), 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut bus = EventBus::with_config(EventBusConfig::default().with_history(2));
        for _ in 0..5 {
            bus.publish(ChangeEvent::deleted(EntityRef::Area(Uuid::new_v4())));
        }
        assert_eq!(bus.history().count(), 2);
    }

    #[test]
    fn test_queue_removed_sequence() {
        let mut queue = EventQueue::new();
        let sketch = EntityRef::Sketch(Uuid::new_v4());
        let edge = EntityRef::Edge(Uuid::new_v4());
        queue.removed(sketch, edge);

        let kinds: Vec<_> = queue.drain().into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ChangeKind::BeforeObjectRemoved,
                ChangeKind::ObjectRemoved,
                ChangeKind::Deleted
            ]
        );
        assert!(queue.is_empty());
    }
}
