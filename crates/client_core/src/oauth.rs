use shared::protocol::LoginResponse;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::{api::ApiClient, config::ClientSettings, error::ClientError, session_store::AuthSession};

pub const GITHUB_AUTHORIZE_URL: &str = "https://github.com/login/oauth/authorize";
pub const GITHUB_SCOPE: &str = "read:user user:email";

#[derive(Debug, Clone)]
pub struct GithubOAuth {
    client_id: String,
    redirect_uri: String,
}

impl GithubOAuth {
    pub fn new(client_id: impl Into<String>, redirect_uri: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            redirect_uri: redirect_uri.into(),
        }
    }

    pub fn from_settings(settings: &ClientSettings) -> Result<Self, ClientError> {
        let client_id = settings
            .github_client_id
            .clone()
            .ok_or_else(|| ClientError::Config("github_client_id is not set".into()))?;
        let redirect_uri = settings
            .github_redirect_uri
            .clone()
            .ok_or_else(|| ClientError::Config("github_redirect_uri is not set".into()))?;
        Ok(Self::new(client_id, redirect_uri))
    }

    /// Builds the provider's authorize URL with a fresh CSRF state, which is
    /// stored until the callback arrives.
    pub fn authorization_url(&self, auth: &AuthSession) -> Result<Url, ClientError> {
        let state = Uuid::new_v4().simple().to_string();
        auth.set_oauth_state(&state)?;

        let mut url = Url::parse(GITHUB_AUTHORIZE_URL)
            .map_err(|err| ClientError::Config(format!("authorize url: {err}")))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("scope", GITHUB_SCOPE)
            .append_pair("state", &state);
        Ok(url)
    }

    /// Finishes the redirect round trip. The stored state is cleared whatever
    /// the outcome.
    pub async fn complete(
        &self,
        api: &ApiClient,
        callback: OAuthCallback,
    ) -> Result<LoginResponse, ClientError> {
        let expected = api.auth().take_oauth_state()?;
        let (code, state) = match callback {
            OAuthCallback::Denied { error, description } => {
                warn!(%error, "oauth: provider denied authorization");
                return Err(ClientError::OAuthDenied(description.unwrap_or(error)));
            }
            OAuthCallback::Code { code, state } => (code, state),
        };

        if expected.as_deref() != Some(state.as_str()) {
            warn!("oauth: callback state does not match the stored state");
            return Err(ClientError::OAuthStateMismatch);
        }

        let login = api.exchange_github_code(&code).await?;
        info!(user_id = login.user_id.0, "oauth: github sign-in completed");
        Ok(login)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OAuthCallback {
    Code {
        code: String,
        state: String,
    },
    Denied {
        error: String,
        description: Option<String>,
    },
}

impl OAuthCallback {
    pub fn from_redirect_url(raw: &str) -> Result<Self, ClientError> {
        let url = Url::parse(raw).map_err(|err| ClientError::InvalidCallback(err.to_string()))?;

        let mut code = None;
        let mut state = None;
        let mut error = None;
        let mut description = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                "error" => error = Some(value.into_owned()),
                "error_description" => description = Some(value.into_owned()),
                _ => {}
            }
        }

        if let Some(error) = error {
            return Ok(Self::Denied { error, description });
        }
        let code = code
            .filter(|code| !code.is_empty())
            .ok_or_else(|| ClientError::InvalidCallback("missing code".into()))?;
        let state = state.ok_or_else(|| ClientError::InvalidCallback("missing state".into()))?;
        Ok(Self::Code { code, state })
    }
}

#[cfg(test)]
#[path = "tests/oauth_tests.rs"]
mod tests;
