use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{ClientMessageId, ConversationId, DeliveryStatus, MessageId, UserId},
    error::ApiError,
    protocol::{HistoryMessage, WireFrame},
};
use tokio::{sync::broadcast, task::JoinHandle, time};
use tracing::{debug, info, warn};

use crate::{
    config::ClientSettings,
    error::ClientError,
    send_pipeline::SendPipeline,
    subscribers::{InboundFrame, Subscription},
};

/// Source of conversation history for a chat session.
#[async_trait]
pub trait ChatHistory: Send + Sync {
    async fn load_messages(
        &self,
        conversation_id: ConversationId,
    ) -> anyhow::Result<Vec<HistoryMessage>>;

    async fn mark_read(&self, conversation_id: ConversationId) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKey {
    Server(MessageId),
    Local(ClientMessageId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub key: MessageKey,
    pub conversation_id: ConversationId,
    pub sender_id: Option<UserId>,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    pub outgoing: bool,
    /// Set only on messages sent from this session.
    pub status: Option<DeliveryStatus>,
}

impl ChatMessage {
    fn from_history(message: HistoryMessage, me: Option<UserId>) -> Self {
        Self {
            key: MessageKey::Server(message.message_id),
            conversation_id: message.conversation_id,
            sender_id: Some(message.sender_id),
            content: message.content,
            sent_at: message.sent_at,
            outgoing: me == Some(message.sender_id),
            status: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    HistoryLoaded {
        conversation_id: ConversationId,
        count: usize,
    },
    MessageAdded(ChatMessage),
    StatusChanged {
        client_message_id: ClientMessageId,
        status: DeliveryStatus,
    },
    TypingChanged {
        user_id: UserId,
        is_typing: bool,
    },
    ServerError(ApiError),
}

#[derive(Default)]
struct ChatState {
    active: Option<(ConversationId, UserId)>,
    messages: Vec<ChatMessage>,
    typing: BTreeSet<UserId>,
    receipt_tasks: Vec<JoinHandle<()>>,
    load_generation: u64,
}

struct Shared {
    state: Mutex<ChatState>,
    events: broadcast::Sender<ChatEvent>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ChatState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ChatEvent) {
        let _ = self.events.send(event);
    }

    fn advance(&self, client_message_id: ClientMessageId, next: DeliveryStatus) -> bool {
        {
            let mut state = self.lock();
            let Some(message) = state
                .messages
                .iter_mut()
                .find(|message| message.outgoing && message.key == MessageKey::Local(client_message_id))
            else {
                return false;
            };
            let Some(current) = message.status else {
                return false;
            };
            if !current.can_advance_to(next) {
                debug!(%client_message_id, ?current, ?next, "chat: ignoring backward status change");
                return false;
            }
            message.status = Some(next);
        }
        self.emit(ChatEvent::StatusChanged {
            client_message_id,
            status: next,
        });
        true
    }

    fn push_message(&self, message: ChatMessage) {
        self.lock().messages.push(message.clone());
        self.emit(ChatEvent::MessageAdded(message));
    }

    fn apply_frame(&self, frame: &InboundFrame) {
        let active = self.lock().active.map(|(conversation_id, _)| conversation_id);

        match &frame.body {
            None => {
                let Some(conversation_id) = active else {
                    debug!("chat: opaque frame without an active conversation");
                    return;
                };
                self.push_message(ChatMessage {
                    key: MessageKey::Local(ClientMessageId::new()),
                    conversation_id,
                    sender_id: None,
                    content: frame.payload.clone(),
                    sent_at: frame.received_at,
                    outgoing: false,
                    status: None,
                });
            }
            Some(WireFrame::Message(payload)) => {
                if active != Some(payload.conversation_id) {
                    debug!(
                        conversation_id = payload.conversation_id.0,
                        "chat: message for inactive conversation"
                    );
                    return;
                }
                self.push_message(ChatMessage {
                    key: MessageKey::Local(
                        payload.client_message_id.unwrap_or_default(),
                    ),
                    conversation_id: payload.conversation_id,
                    sender_id: Some(payload.sender_id),
                    content: payload.content.clone(),
                    sent_at: payload.sent_at.unwrap_or(frame.received_at),
                    outgoing: false,
                    status: None,
                });
            }
            Some(WireFrame::Typing {
                conversation_id,
                user_id,
                is_typing,
            }) => {
                if active != Some(*conversation_id) {
                    return;
                }
                let changed = {
                    let mut state = self.lock();
                    if *is_typing {
                        state.typing.insert(*user_id)
                    } else {
                        state.typing.remove(user_id)
                    }
                };
                if changed {
                    self.emit(ChatEvent::TypingChanged {
                        user_id: *user_id,
                        is_typing: *is_typing,
                    });
                }
            }
            Some(WireFrame::Status {
                client_message_id,
                status,
                ..
            }) => {
                self.advance(*client_message_id, *status);
            }
            Some(WireFrame::Error(err)) => {
                warn!(code = ?err.code, message = %err.message, "chat: server reported an error");
                self.emit(ChatEvent::ServerError(err.clone()));
            }
            Some(WireFrame::Heartbeat) => {}
        }
    }
}

/// In-memory state of the conversation currently on screen.
pub struct ChatSession {
    pipeline: Arc<SendPipeline>,
    history: Arc<dyn ChatHistory>,
    delivered_after: Duration,
    read_after: Duration,
    shared: Arc<Shared>,
    _subscription: Subscription,
}

impl ChatSession {
    pub fn new(
        pipeline: Arc<SendPipeline>,
        history: Arc<dyn ChatHistory>,
        settings: &ClientSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let shared = Arc::new(Shared {
            state: Mutex::new(ChatState::default()),
            events,
        });
        let frame_sink = Arc::clone(&shared);
        let subscription = pipeline
            .connection()
            .subscribe(move |frame| frame_sink.apply_frame(frame));

        Self {
            pipeline,
            history,
            delivered_after: settings.delivered_after(),
            read_after: settings.read_after(),
            shared,
            _subscription: subscription,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.shared.events.subscribe()
    }

    pub fn active_conversation(&self) -> Option<ConversationId> {
        self.shared.lock().active.map(|(conversation_id, _)| conversation_id)
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.shared.lock().messages.clone()
    }

    pub fn status_of(&self, client_message_id: ClientMessageId) -> Option<DeliveryStatus> {
        self.shared
            .lock()
            .messages
            .iter()
            .find(|message| message.key == MessageKey::Local(client_message_id))
            .and_then(|message| message.status)
    }

    pub fn typing_users(&self) -> Vec<UserId> {
        self.shared.lock().typing.iter().copied().collect()
    }

    /// Switches to another conversation: pending receipt timers of the
    /// previous one are cancelled and the history is reloaded. A failed load
    /// leaves an empty list; only a rejected session is reported to the
    /// caller.
    pub async fn open_conversation(
        &self,
        conversation_id: ConversationId,
        recipient_id: UserId,
    ) -> Result<(), ClientError> {
        let generation = {
            let mut state = self.shared.lock();
            for task in state.receipt_tasks.drain(..) {
                task.abort();
            }
            state.active = Some((conversation_id, recipient_id));
            state.messages.clear();
            state.typing.clear();
            state.load_generation += 1;
            state.load_generation
        };

        let me = self.pipeline.connection().session();
        let (messages, loaded) = match self.history.load_messages(conversation_id).await {
            Ok(history) => (
                history
                    .into_iter()
                    .map(|message| ChatMessage::from_history(message, me))
                    .collect::<Vec<_>>(),
                true,
            ),
            Err(err) if session_rejected(&err) => {
                warn!(conversation_id = conversation_id.0, "chat: history load rejected the session");
                return Err(ClientError::Unauthorized);
            }
            Err(err) => {
                warn!(
                    conversation_id = conversation_id.0,
                    err = %format!("{err:#}"),
                    "chat: history load failed, showing an empty conversation"
                );
                (Vec::new(), false)
            }
        };

        let count = messages.len();
        {
            let mut state = self.shared.lock();
            if state.load_generation != generation {
                debug!(conversation_id = conversation_id.0, "chat: stale history load discarded");
                return Ok(());
            }
            state.messages = messages;
        }
        info!(conversation_id = conversation_id.0, count, "chat: history loaded");
        self.shared.emit(ChatEvent::HistoryLoaded {
            conversation_id,
            count,
        });

        if loaded {
            match self.history.mark_read(conversation_id).await {
                Ok(()) => {}
                Err(err) if session_rejected(&err) => return Err(ClientError::Unauthorized),
                Err(err) => {
                    warn!(conversation_id = conversation_id.0, %err, "chat: mark as read failed");
                }
            }
        }
        Ok(())
    }

    /// Adds `content` optimistically and hands it to the send pipeline. The
    /// returned id tracks the message's status.
    pub fn send(&self, content: &str) -> Result<ClientMessageId, ClientError> {
        let (conversation_id, recipient_id) = self
            .shared
            .lock()
            .active
            .ok_or(ClientError::NoActiveConversation)?;

        let client_message_id = ClientMessageId::new();
        self.shared.push_message(ChatMessage {
            key: MessageKey::Local(client_message_id),
            conversation_id,
            sender_id: self.pipeline.connection().session(),
            content: content.to_string(),
            sent_at: Utc::now(),
            outgoing: true,
            status: Some(DeliveryStatus::Sending),
        });

        match self.pipeline.send_message_with_id(
            content,
            conversation_id,
            recipient_id,
            client_message_id,
        ) {
            Ok(_) => {
                self.shared.advance(client_message_id, DeliveryStatus::Sent);
                self.schedule_receipts(client_message_id);
            }
            Err(err) => {
                warn!(%client_message_id, %err, "chat: send failed");
                self.shared.advance(client_message_id, DeliveryStatus::Failed);
            }
        }
        Ok(client_message_id)
    }

    pub fn set_typing(&self, is_typing: bool) -> Result<bool, ClientError> {
        let conversation_id = self
            .active_conversation()
            .ok_or(ClientError::NoActiveConversation)?;
        self.pipeline.send_typing(conversation_id, is_typing)
    }

    fn schedule_receipts(&self, client_message_id: ClientMessageId) {
        let shared = Arc::clone(&self.shared);
        let delivered_after = self.delivered_after;
        let read_after = self.read_after;
        let task = tokio::spawn(async move {
            time::sleep(delivered_after).await;
            if !shared.advance(client_message_id, DeliveryStatus::Delivered) {
                return;
            }
            time::sleep(read_after).await;
            shared.advance(client_message_id, DeliveryStatus::Read);
        });

        let mut state = self.shared.lock();
        state.receipt_tasks.retain(|task| !task.is_finished());
        state.receipt_tasks.push(task);
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        for task in self.shared.lock().receipt_tasks.drain(..) {
            task.abort();
        }
    }
}

fn session_rejected(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ClientError>()
        .is_some_and(ClientError::is_unauthorized)
}

#[cfg(test)]
#[path = "tests/chat_session_tests.rs"]
mod tests;
