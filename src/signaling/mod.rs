//! Conversation-scoped signaling channel.
//!
//! One [`SignalingChannel`] sits on top of one server connection. Opening it
//! for a conversation joins that conversation's room and returns a
//! [`ChannelHandle`]; opening it for a different conversation tears down
//! every subscription made through the previous handle.

pub mod events;
pub mod socketio;
pub mod websocket;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::Value;

pub use events::{InboundEvent, OutboundEvent};

/// Failures on the send path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// No live connection. The event may not have been delivered.
    #[error("transport unavailable, event may not have been delivered")]
    TransportUnavailable,
    /// The handle belongs to a conversation that is no longer open.
    #[error("channel for conversation {0} is closed")]
    Closed(String),
}

/// The underlying connection.
pub trait Transport: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Emit a named event. Must not block.
    fn emit(&self, event: &str, payload: Value) -> Result<(), ChannelError>;
}

type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Default)]
struct Registry {
    conversation: Option<String>,
    epoch: u64,
    next_id: u64,
    handlers: HashMap<String, Vec<(u64, Handler)>>,
}

#[derive(Clone)]
pub struct SignalingChannel {
    transport: Arc<dyn Transport>,
    registry: Arc<Mutex<Registry>>,
}

impl SignalingChannel {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open the channel for a conversation.
    ///
    /// Re-opening the current conversation returns a handle to the same
    /// subscription set. Opening another conversation disposes all handlers
    /// registered for the previous one.
    pub fn open(&self, conversation_id: &str) -> ChannelHandle {
        let epoch = {
            let mut reg = self.registry();
            if reg.conversation.as_deref() == Some(conversation_id) {
                return ChannelHandle {
                    conversation_id: conversation_id.to_string(),
                    epoch: reg.epoch,
                    channel: self.clone(),
                };
            }
            if let Some(previous) = reg.conversation.take() {
                let dropped: usize = reg.handlers.values().map(Vec::len).sum();
                tracing::debug!(
                    "Closing channel for {} ({} handlers disposed)",
                    previous,
                    dropped
                );
            }
            reg.handlers.clear();
            reg.epoch += 1;
            reg.conversation = Some(conversation_id.to_string());
            reg.epoch
        };

        tracing::info!("Opening channel for conversation {}", conversation_id);
        let join = OutboundEvent::JoinChat {
            chat_id: conversation_id.to_string(),
        };
        if let Err(e) = self.transport.emit(join.name(), join.payload()) {
            // The transport re-joins the open conversation when it connects.
            tracing::debug!("joinChat deferred: {}", e);
        }

        ChannelHandle {
            conversation_id: conversation_id.to_string(),
            epoch,
            channel: self.clone(),
        }
    }

    /// Dispose every handler and forget the open conversation.
    pub fn close(&self) {
        let mut reg = self.registry();
        if let Some(previous) = reg.conversation.take() {
            tracing::info!("Closing channel for conversation {}", previous);
        }
        reg.handlers.clear();
        reg.epoch += 1;
    }

    /// Conversation currently open, if any.
    pub fn current(&self) -> Option<String> {
        self.registry().conversation.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Deliver an inbound event to its subscribers, in subscription order.
    ///
    /// Handlers run outside the registry lock so they may subscribe or
    /// dispose without deadlocking.
    pub fn dispatch(&self, event: &str, payload: &Value) {
        let handlers: Vec<Handler> = {
            let reg = self.registry();
            match reg.handlers.get(event) {
                Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => Vec::new(),
            }
        };
        if handlers.is_empty() {
            tracing::debug!("No subscriber for event {}", event);
        }
        for handler in handlers {
            handler(payload);
        }
    }

    #[cfg(test)]
    pub(crate) fn handler_count(&self) -> usize {
        self.registry().handlers.values().map(Vec::len).sum()
    }
}

/// Conversation-scoped view of the channel.
#[derive(Clone)]
pub struct ChannelHandle {
    conversation_id: String,
    epoch: u64,
    channel: SignalingChannel,
}

impl ChannelHandle {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// False once the channel has been re-opened for another conversation.
    pub fn is_open(&self) -> bool {
        let reg = self.channel.registry();
        reg.epoch == self.epoch && reg.conversation.as_deref() == Some(self.conversation_id.as_str())
    }

    /// Close the channel if this handle's conversation is still the open one.
    pub fn close(&self) {
        if self.is_open() {
            self.channel.close();
        }
    }

    /// Send an event. There is no retry or queueing: an `Err` means the
    /// event may not have been delivered and the caller decides what that
    /// means for its own state.
    pub fn send(&self, event: &OutboundEvent) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed(self.conversation_id.clone()));
        }
        tracing::debug!("Emit {} for {}", event.name(), self.conversation_id);
        self.channel.transport.emit(event.name(), event.payload())
    }

    /// Register a handler for an inbound event name. The handler stays
    /// registered until the returned [`Subscription`] is dropped or the
    /// channel moves to another conversation.
    pub fn subscribe<F>(&self, event: &str, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let mut reg = self.channel.registry();
        reg.next_id += 1;
        let id = reg.next_id;
        if reg.epoch == self.epoch {
            reg.handlers
                .entry(event.to_string())
                .or_default()
                .push((id, Arc::new(handler)));
        } else {
            tracing::warn!(
                "Subscribe to {} on closed channel for {}",
                event,
                self.conversation_id
            );
        }
        Subscription {
            registry: Arc::downgrade(&self.channel.registry),
            event: event.to_string(),
            id,
        }
    }
}

/// Disposer for a handler registration.
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    event: String,
    id: u64,
}

impl Subscription {
    pub fn dispose(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut reg = registry.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = reg.handlers.get_mut(&self.event) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                reg.handlers.remove(&self.event);
            }
        }
    }
}
