use std::{
    any::Any,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use chrono::{DateTime, Utc};
use shared::protocol::{WireEnvelope, WireFrame};
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Message,
    Typing,
    Status,
    Error,
    Heartbeat,
}

/// One frame received from the transport. Frames that are not a valid
/// envelope are still delivered, as opaque `Message` frames with no body.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub kind: FrameKind,
    pub payload: String,
    pub body: Option<WireFrame>,
    pub received_at: DateTime<Utc>,
}

impl InboundFrame {
    pub fn from_text(payload: String) -> Self {
        let body = WireEnvelope::decode(&payload).ok().map(|envelope| envelope.body);
        let kind = match &body {
            Some(WireFrame::Message(_)) | None => FrameKind::Message,
            Some(WireFrame::Typing { .. }) => FrameKind::Typing,
            Some(WireFrame::Status { .. }) => FrameKind::Status,
            Some(WireFrame::Error(_)) => FrameKind::Error,
            Some(WireFrame::Heartbeat) => FrameKind::Heartbeat,
        };
        Self {
            kind,
            payload,
            body,
            received_at: Utc::now(),
        }
    }
}

type FrameCallback = dyn Fn(&InboundFrame) + Send + Sync;

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    entries: Vec<(u64, Arc<FrameCallback>)>,
}

#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&InboundFrame) + Send + Sync + 'static,
    {
        let mut state = lock(&self.state);
        state.next_id += 1;
        let id = state.next_id;
        state.entries.push((id, Arc::new(callback)));
        Subscription {
            id,
            registry: Arc::downgrade(&self.state),
        }
    }

    /// Runs every registered callback in registration order and returns how
    /// many completed without panicking. The registry lock is released before
    /// any callback runs, so callbacks may subscribe or unsubscribe.
    pub fn dispatch(&self, frame: &InboundFrame) -> usize {
        let callbacks: Vec<(u64, Arc<FrameCallback>)> = lock(&self.state).entries.clone();

        let mut completed = 0;
        for (id, callback) in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(frame))) {
                Ok(()) => completed += 1,
                Err(panic) => error!(
                    subscriber = id,
                    panic = panic_message(panic.as_ref()),
                    "subscribers: callback panicked"
                ),
            }
        }
        completed
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keeps a callback registered. Dropping it (or calling `unsubscribe`)
/// removes exactly that callback.
#[must_use = "dropping a Subscription unsubscribes its callback"]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<RegistryState>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(state) = self.registry.upgrade() {
            lock(&state).entries.retain(|(id, _)| *id != self.id);
        }
    }
}

fn lock(state: &Mutex<RegistryState>) -> MutexGuard<'_, RegistryState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
#[path = "tests/subscribers_tests.rs"]
mod tests;
