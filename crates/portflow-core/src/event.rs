/*!
 * Event system for portflow.
 *
 * A typed broadcast bus. Each event type gets its own channel, created on
 * first use. Devices publish "state updated" and activation notifications
 * here; whatever orchestration layer is wired in subscribes, optionally
 * narrowing the stream to a single source device.
 */
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::types::Id;

/// Maximum number of events that can be buffered in a channel
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// An event that can travel over the [`EventBus`]
pub trait Event: Clone + Debug + Send + Sync + 'static {
    /// Short, stable name of the event kind
    fn event_type(&self) -> &'static str;

    /// The resource that emitted the event
    fn source(&self) -> &Id;
}

/// Event bus for publishing and subscribing to events
#[derive(Debug)]
pub struct EventBus {
    channels: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
    channel_capacity: usize,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new event bus with a specific channel capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            channel_capacity: capacity.max(1),
        }
    }

    fn sender<E: Event>(&self) -> Result<broadcast::Sender<E>> {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let entry = channels.entry(TypeId::of::<E>()).or_insert_with(|| {
            let (sender, _) = broadcast::channel::<E>(self.channel_capacity);
            Box::new(sender)
        });

        entry
            .downcast_ref::<broadcast::Sender<E>>()
            .cloned()
            .ok_or_else(|| Error::event("event channel registered with a different type"))
    }

    /// Publish an event, returning the number of subscribers that received it
    pub fn publish<E: Event>(&self, event: E) -> Result<usize> {
        let sender = self.sender::<E>()?;
        if sender.receiver_count() == 0 {
            trace!(event = event.event_type(), source = %event.source(), "No subscribers");
            return Ok(0);
        }

        trace!(event = event.event_type(), source = %event.source(), "Publishing event");
        sender
            .send(event)
            .map_err(|e| Error::event(format!("Failed to publish event: {}", e)))
    }

    /// Subscribe to every event of type `E`
    pub fn subscribe<E: Event>(&self) -> Result<Subscriber<E>> {
        Ok(Subscriber {
            rx: self.sender::<E>()?.subscribe(),
            source: None,
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving half of a subscription
#[derive(Debug)]
pub struct Subscriber<E: Event> {
    rx: broadcast::Receiver<E>,
    source: Option<Id>,
}

impl<E: Event> Subscriber<E> {
    /// Only deliver events emitted by `source`
    pub fn for_source(mut self, source: Id) -> Self {
        self.source = Some(source);
        self
    }

    fn wanted(&self, event: &E) -> bool {
        self.source.as_ref().map_or(true, |s| s == event.source())
    }

    /// Wait for the next matching event.
    ///
    /// Lagged receivers skip the lost events and keep going; an error is only
    /// returned once every sender is gone.
    pub async fn recv(&mut self) -> Result<E> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.wanted(&event) => return Ok(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(n)) => {
                    warn!("Subscriber lagged behind by {} events", n);
                }
                Err(RecvError::Closed) => return Err(Error::event("event channel closed")),
            }
        }
    }

    /// Take the next matching event if one is already buffered
    pub fn try_recv(&mut self) -> Option<E> {
        loop {
            match self.rx.try_recv() {
                Ok(event) if self.wanted(&event) => return Some(event),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(n)) => {
                    warn!("Subscriber lagged behind by {} events", n);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drain every buffered matching event
    pub fn drain(&mut self) -> Vec<E> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

/// A shared event bus that can be cloned
#[derive(Debug, Clone, Default)]
pub struct SharedEventBus(Arc<EventBus>);

impl SharedEventBus {
    /// Create a new shared event bus
    pub fn new() -> Self {
        Self(Arc::new(EventBus::new()))
    }

    /// Create a new shared event bus with a specific channel capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self(Arc::new(EventBus::with_capacity(capacity)))
    }

    /// Publish an event
    pub fn publish<E: Event>(&self, event: E) -> Result<usize> {
        self.0.publish(event)
    }

    /// Subscribe to events of a specific type
    pub fn subscribe<E: Event>(&self) -> Result<Subscriber<E>> {
        self.0.subscribe()
    }
}
