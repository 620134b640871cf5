//! Fan-out of decoded server events to registered listeners.
//!
//! Listeners are kept per event type in registration order. Audio frames from
//! the backend have their own registry since they carry no discriminator.

use crate::protocol::{self, Decoded, InboundFrame, ServerEvent, ServerEventType};
use bytes::Bytes;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};
use tracing::{debug, warn};

/// Something that reacts to one kind of server event.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &ServerEvent);
}

impl<F> EventHandler for F
where
    F: Fn(&ServerEvent) + Send + Sync,
{
    fn handle(&self, event: &ServerEvent) {
        self(event)
    }
}

/// Something that consumes audio synthesized by the backend.
pub trait AudioHandler: Send + Sync {
    fn handle_audio(&self, audio: &Bytes);
}

impl<F> AudioHandler for F
where
    F: Fn(&Bytes) + Send + Sync,
{
    fn handle_audio(&self, audio: &Bytes) {
        self(audio)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Topic {
    Event(ServerEventType),
    Audio,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    events: HashMap<ServerEventType, Vec<(u64, Arc<dyn EventHandler>)>>,
    audio: Vec<(u64, Arc<dyn AudioHandler>)>,
}

impl Registry {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn remove(&mut self, topic: Topic, id: u64) -> bool {
        match topic {
            Topic::Event(kind) => match self.events.get_mut(&kind) {
                Some(list) => {
                    let before = list.len();
                    list.retain(|(entry, _)| *entry != id);
                    list.len() != before
                }
                None => false,
            },
            Topic::Audio => {
                let before = self.audio.len();
                self.audio.retain(|(entry, _)| *entry != id);
                self.audio.len() != before
            }
        }
    }
}

/// Handle returned by every subscription. Dropping it keeps the listener
/// registered; call [`Subscription::unsubscribe`] to remove it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    topic: Topic,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    /// Removes the listener. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => lock(&registry).remove(self.topic, self.id),
            None => false,
        }
    }
}

/// Routes server events to listeners keyed by event type.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    registry: Arc<Mutex<Registry>>,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        kind: ServerEventType,
        handler: impl EventHandler + 'static,
    ) -> Subscription {
        self.subscribe_shared(kind, Arc::new(handler))
    }

    /// Registers an already shared handler, e.g. one listening to several types.
    pub fn subscribe_shared(
        &self,
        kind: ServerEventType,
        handler: Arc<dyn EventHandler>,
    ) -> Subscription {
        let mut registry = lock(&self.registry);
        let id = registry.allocate_id();
        registry.events.entry(kind).or_default().push((id, handler));
        Subscription {
            id,
            topic: Topic::Event(kind),
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn subscribe_audio(&self, handler: impl AudioHandler + 'static) -> Subscription {
        let mut registry = lock(&self.registry);
        let id = registry.allocate_id();
        registry.audio.push((id, Arc::new(handler)));
        Subscription {
            id,
            topic: Topic::Audio,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn listener_count(&self, kind: ServerEventType) -> usize {
        lock(&self.registry).events.get(&kind).map_or(0, Vec::len)
    }

    /// Delivers `event` to its listeners in registration order and returns how
    /// many were called.
    pub fn emit(&self, event: &ServerEvent) -> usize {
        // Snapshot first so handlers may subscribe or unsubscribe re-entrantly.
        let handlers: Vec<Arc<dyn EventHandler>> = lock(&self.registry)
            .events
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        for handler in &handlers {
            handler.handle(event);
        }
        handlers.len()
    }

    pub fn emit_audio(&self, audio: &Bytes) -> usize {
        let handlers: Vec<Arc<dyn AudioHandler>> = lock(&self.registry)
            .audio
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in &handlers {
            handler.handle_audio(audio);
        }
        handlers.len()
    }

    /// Decodes a raw frame and emits it. Frames that fail to decode are logged
    /// and dropped.
    pub fn dispatch(&self, frame: InboundFrame) {
        match protocol::decode_frame(frame) {
            Ok(Decoded::Event(event)) => {
                let delivered = self.emit(&event);
                debug!(kind = %event.kind(), delivered, "Dispatched server event");
            }
            Ok(Decoded::Audio(audio)) => {
                let delivered = self.emit_audio(&audio);
                debug!(bytes = audio.len(), delivered, "Dispatched backend audio");
            }
            Err(crate::error::ProtocolError::UnknownType(kind)) => {
                debug!(%kind, "Ignoring unrecognized server event");
            }
            Err(e) => warn!(error = %e, "Dropping undecodable frame"),
        }
    }
}
