use std::sync::Arc;

use shared::domain::{ConversationId, UserId};
use tracing::{info, warn};

pub mod api;
pub mod chat_session;
pub mod config;
pub mod connection;
pub mod error;
pub mod oauth;
pub mod send_pipeline;
pub mod session_store;
pub mod subscribers;
pub mod transport;

pub use api::ApiClient;
pub use chat_session::{ChatEvent, ChatHistory, ChatMessage, ChatSession, MessageKey};
pub use config::{load_settings, ClientSettings};
pub use connection::{ConnectionManager, ConnectionStatus, ReconnectPolicy};
pub use error::ClientError;
pub use oauth::{GithubOAuth, OAuthCallback};
pub use send_pipeline::{DeferredOutcome, SendOutcome, SendPipeline};
pub use session_store::{open_store, AuthSession, FileStore, KeyValueStore, MemoryStore};
pub use subscribers::{FrameKind, InboundFrame, Subscription};
pub use transport::{Connector, WsConnector};

/// Ties the REST client, the persisted session and the realtime connection
/// together for a front-end.
pub struct ChatClient {
    settings: ClientSettings,
    api: ApiClient,
    connection: Arc<ConnectionManager>,
    pipeline: Arc<SendPipeline>,
}

impl ChatClient {
    pub fn new(settings: ClientSettings, store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_connector(settings, store, Arc::new(WsConnector))
    }

    pub fn with_connector(
        settings: ClientSettings,
        store: Arc<dyn KeyValueStore>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let api = ApiClient::new(&settings, AuthSession::new(store));
        let connection = ConnectionManager::new(settings.clone(), connector);
        let pipeline = SendPipeline::new(Arc::clone(&connection), settings.send_retry_delay());
        Self {
            settings,
            api,
            connection,
            pipeline,
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn auth(&self) -> &AuthSession {
        self.api.auth()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn pipeline(&self) -> &Arc<SendPipeline> {
        &self.pipeline
    }

    /// Reconnects with the persisted session, if there is one. Returns
    /// whether a connection was started.
    pub fn resume(&self) -> Result<bool, ClientError> {
        let (Some(_), Some(user_id)) = (self.auth().token(), self.auth().user_id()) else {
            return Ok(false);
        };
        info!(user_id = user_id.0, "client: resuming stored session");
        self.connection.connect(&user_id.to_string())?;
        Ok(true)
    }

    pub fn logout(&self) -> Result<(), ClientError> {
        self.pipeline.cancel_pending();
        self.connection.disconnect();
        self.auth().clear()?;
        info!("client: signed out");
        Ok(())
    }

    pub fn open_chat(&self) -> ChatSession {
        ChatSession::new(
            Arc::clone(&self.pipeline),
            Arc::new(self.api.clone()),
            &self.settings,
        )
    }

    /// Loads a conversation into `chat`. A rejected session also tears
    /// down the realtime connection.
    pub async fn open_conversation(
        &self,
        chat: &ChatSession,
        conversation_id: ConversationId,
        recipient_id: UserId,
    ) -> Result<(), ClientError> {
        chat.open_conversation(conversation_id, recipient_id)
            .await
            .inspect_err(|err| self.handle_error(err))
    }

    /// Drops the realtime connection once the backend rejects the session.
    /// The stored session was already cleared by the REST client.
    pub fn handle_error(&self, err: &ClientError) {
        if err.is_unauthorized() {
            warn!("client: session rejected, dropping realtime connection");
            self.pipeline.cancel_pending();
            self.connection.disconnect();
        }
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
