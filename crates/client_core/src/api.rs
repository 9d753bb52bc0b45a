use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ChatSummary, ConversationId, UserId, UserSummary},
    error::ApiError,
    protocol::{
        CreatePrivateChatRequest, GithubCodeExchangeRequest, HistoryMessage, LoginRequest,
        LoginResponse, RegisterRequest, SendMessageRequest,
    },
};
use tracing::{info, warn};

use crate::{
    chat_session::ChatHistory, config::ClientSettings, error::ClientError,
    session_store::AuthSession,
};

const DEFAULT_CONFLICT_MESSAGE: &str = "a chat with this user already exists";

/// JSON client for the chat backend's REST surface. Requests carry the bearer
/// token from the persisted [`AuthSession`].
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base: String,
    auth: AuthSession,
}

impl ApiClient {
    pub fn new(settings: &ClientSettings, auth: AuthSession) -> Self {
        Self {
            http: Client::new(),
            base: settings.api_base().to_string(),
            auth,
        }
    }

    pub fn auth(&self) -> &AuthSession {
        &self.auth
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, ClientError> {
        let request = self.http.post(self.url("/v1/auth/login")).json(&LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        });
        self.sign_in(request).await
    }

    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<LoginResponse, ClientError> {
        let request = self
            .http
            .post(self.url("/v1/auth/register"))
            .json(&RegisterRequest {
                username: username.to_string(),
                email: email.to_string(),
                password: password.to_string(),
            });
        self.sign_in(request).await
    }

    pub async fn exchange_github_code(&self, code: &str) -> Result<LoginResponse, ClientError> {
        let request = self
            .http
            .post(self.url("/v1/auth/github/callback"))
            .json(&GithubCodeExchangeRequest {
                code: code.to_string(),
            });
        self.sign_in(request).await
    }

    pub async fn list_users(&self) -> Result<Vec<UserSummary>, ClientError> {
        self.read_list(self.http.get(self.url("/v1/users"))).await
    }

    pub async fn search_users(&self, query: &str) -> Result<Vec<UserSummary>, ClientError> {
        self.read_list(
            self.http
                .get(self.url("/v1/users/search"))
                .query(&[("q", query)]),
        )
        .await
    }

    pub async fn list_private_chats(&self) -> Result<Vec<ChatSummary>, ClientError> {
        self.read_list(self.http.get(self.url("/v1/chats/private"))).await
    }

    pub async fn chat_messages(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<HistoryMessage>, ClientError> {
        self.read_list(
            self.http
                .get(self.url(&format!("/v1/chats/{conversation_id}/messages"))),
        )
        .await
    }

    pub async fn post_message(
        &self,
        conversation_id: ConversationId,
        content: &str,
    ) -> Result<(), ClientError> {
        let request = self
            .http
            .post(self.url(&format!("/v1/chats/{conversation_id}/messages")))
            .json(&SendMessageRequest {
                content: content.to_string(),
            });
        self.execute(request).await?;
        Ok(())
    }

    pub async fn mark_read(&self, conversation_id: ConversationId) -> Result<(), ClientError> {
        let request = self
            .http
            .post(self.url(&format!("/v1/chats/{conversation_id}/read")));
        self.execute(request).await?;
        Ok(())
    }

    /// Opens a private chat with `participant_id`. An existing chat with the
    /// same user is reported as [`ClientError::Conflict`].
    pub async fn create_private_chat(
        &self,
        participant_id: UserId,
    ) -> Result<ChatSummary, ClientError> {
        let request = self
            .http
            .post(self.url("/v1/chats/private"))
            .json(&CreatePrivateChatRequest { participant_id });
        let chat: ChatSummary = self.execute(request).await?.json().await?;
        info!(
            conversation_id = chat.conversation_id.0,
            participant_id = participant_id.0,
            "api: private chat created"
        );
        Ok(chat)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.auth.token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn sign_in(&self, request: RequestBuilder) -> Result<LoginResponse, ClientError> {
        let login: LoginResponse = self.execute(request).await?.json().await?;
        self.auth.save(&login)?;
        info!(user_id = login.user_id.0, username = %login.username, "api: signed in");
        Ok(login)
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response, ClientError> {
        let response = self.authorized(request).send().await?;
        self.check(response).await
    }

    async fn check(&self, response: Response) -> Result<Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::UNAUTHORIZED {
            warn!(url = %response.url(), "api: unauthorized, clearing stored session");
            self.auth.clear()?;
            return Err(ClientError::Unauthorized);
        }

        let message = error_message(response).await;
        if status == StatusCode::CONFLICT {
            let message = if message.is_empty() {
                DEFAULT_CONFLICT_MESSAGE.to_string()
            } else {
                message
            };
            return Err(ClientError::Conflict(message));
        }

        Err(ClientError::Http {
            status: status.as_u16(),
            message,
        })
    }

    /// Read endpoints degrade to an empty list on 404 or a body that does not
    /// parse.
    async fn read_list<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<Vec<T>, ClientError> {
        let response = self.authorized(request).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            info!(url = %response.url(), "api: resource not found, returning empty list");
            return Ok(Vec::new());
        }

        let response = self.check(response).await?;
        let url = response.url().clone();
        let raw = response.text().await?;
        match serde_json::from_str(&raw) {
            Ok(items) => Ok(items),
            Err(err) => {
                warn!(%url, %err, "api: malformed response body, returning empty list");
                Ok(Vec::new())
            }
        }
    }
}

async fn error_message(response: Response) -> String {
    let raw = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ApiError>(&raw) {
        Ok(err) => err.message,
        Err(_) => raw.trim().to_string(),
    }
}

#[async_trait]
impl ChatHistory for ApiClient {
    async fn load_messages(
        &self,
        conversation_id: ConversationId,
    ) -> anyhow::Result<Vec<HistoryMessage>> {
        Ok(self.chat_messages(conversation_id).await?)
    }

    async fn mark_read(&self, conversation_id: ConversationId) -> anyhow::Result<()> {
        Ok(ApiClient::mark_read(self, conversation_id).await?)
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
