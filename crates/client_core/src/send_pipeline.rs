use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::Utc;
use shared::{
    domain::{ClientMessageId, ConversationId, UserId},
    protocol::{ChatPayload, WireEnvelope, WireFrame},
};
use tokio::{sync::oneshot, task::JoinHandle, time};
use tracing::{debug, info, warn};

use crate::{connection::ConnectionManager, error::ClientError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredOutcome {
    Transmitted,
    Dropped,
}

#[derive(Debug)]
pub enum SendOutcome {
    Transmitted,
    /// The transport was not open. One retry is scheduled; the receiver
    /// resolves once it has run. A cancelled retry closes the receiver.
    Deferred(oneshot::Receiver<DeferredOutcome>),
}

/// Serializes outbound chat frames and hands them to the connection manager.
pub struct SendPipeline {
    connection: Arc<ConnectionManager>,
    retry_delay: Duration,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl SendPipeline {
    pub fn new(connection: Arc<ConnectionManager>, retry_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            connection,
            retry_delay,
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn send_message(
        &self,
        content: &str,
        conversation_id: ConversationId,
        recipient_id: UserId,
    ) -> Result<SendOutcome, ClientError> {
        self.send_message_with_id(content, conversation_id, recipient_id, ClientMessageId::new())
    }

    pub fn send_message_with_id(
        &self,
        content: &str,
        conversation_id: ConversationId,
        recipient_id: UserId,
        client_message_id: ClientMessageId,
    ) -> Result<SendOutcome, ClientError> {
        let sender_id = self.connection.session().ok_or(ClientError::NoSession)?;
        let payload = WireEnvelope::new(WireFrame::Message(ChatPayload {
            conversation_id,
            sender_id,
            recipient_id,
            content: content.to_string(),
            client_message_id: Some(client_message_id),
            sent_at: Some(Utc::now()),
        }))
        .encode()?;

        if self.connection.is_open() {
            self.connection.transmit(payload)?;
            debug!(
                conversation_id = conversation_id.0,
                %client_message_id,
                "send: message transmitted"
            );
            return Ok(SendOutcome::Transmitted);
        }

        info!(
            conversation_id = conversation_id.0,
            %client_message_id,
            delay_ms = self.retry_delay.as_millis() as u64,
            "send: transport not open, deferring one retry"
        );
        Ok(SendOutcome::Deferred(self.defer(payload, conversation_id)))
    }

    /// Typing notices are best effort: nothing is sent or retried while the
    /// transport is down.
    pub fn send_typing(
        &self,
        conversation_id: ConversationId,
        is_typing: bool,
    ) -> Result<bool, ClientError> {
        let user_id = self.connection.session().ok_or(ClientError::NoSession)?;
        if !self.connection.is_open() {
            return Ok(false);
        }
        let payload = WireEnvelope::new(WireFrame::Typing {
            conversation_id,
            user_id,
            is_typing,
        })
        .encode()?;
        self.connection.transmit(payload)?;
        Ok(true)
    }

    pub fn pending_count(&self) -> usize {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|task| !task.is_finished());
        pending.len()
    }

    pub fn cancel_pending(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        for task in pending.drain(..) {
            task.abort();
        }
    }

    fn defer(
        &self,
        payload: String,
        conversation_id: ConversationId,
    ) -> oneshot::Receiver<DeferredOutcome> {
        let (tx, rx) = oneshot::channel();
        let connection = Arc::clone(&self.connection);
        let delay = self.retry_delay;
        let task = tokio::spawn(async move {
            time::sleep(delay).await;
            let outcome = if connection.is_open() && connection.transmit(payload).is_ok() {
                info!(conversation_id = conversation_id.0, "send: deferred message transmitted");
                DeferredOutcome::Transmitted
            } else {
                warn!(
                    conversation_id = conversation_id.0,
                    "send: transport still closed, deferred message dropped"
                );
                DeferredOutcome::Dropped
            };
            let _ = tx.send(outcome);
        });

        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|task| !task.is_finished());
        pending.push(task);
        rx
    }
}

#[cfg(test)]
#[path = "tests/send_pipeline_tests.rs"]
mod tests;
