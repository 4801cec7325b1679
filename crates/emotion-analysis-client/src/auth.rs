use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::errors::{ClientError, TransportError};
use crate::model::{Credential, require_credential};

const EXCHANGE_PATH: &str = "/auth/google";
const USER_PATH: &str = "/auth/user";
const LOGOUT_PATH: &str = "/auth/logout";

/// Account details returned by the auth endpoints.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
}

#[derive(Deserialize)]
struct UserEnvelope {
    user: UserProfile,
}

/// Exchanges provider tokens for credentials and checks them.
///
/// The provider token itself is the bearer credential used for every later
/// request; the server only verifies it.
pub struct AuthClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl AuthClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ClientError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Client id of the external identity provider, if configured.
    pub fn provider_client_id(&self) -> Option<&str> {
        self.config.auth_client_id.as_deref()
    }

    /// Registers a provider token with the server and returns it as a
    /// credential together with the signed-in user.
    pub async fn exchange(
        &self,
        provider_token: &str,
    ) -> Result<(Credential, UserProfile), ClientError> {
        let credential = require_credential(Some(Credential::bearer(provider_token)))?;
        let response = self
            .client
            .post(self.config.endpoint(EXCHANGE_PATH))
            .json(&serde_json::json!({ "token": credential.token() }))
            .send()
            .await
            .map_err(|e| TransportError::connect(format!("login request failed: {e}")))?;
        let user = read_user(response).await?;
        debug!(user = ?user.email, "login accepted");
        Ok((credential, user))
    }

    /// Returns the user a stored credential belongs to. A rejected credential
    /// comes back as `ClientError::Rejected` and should be discarded.
    pub async fn current_user(&self, credential: &Credential) -> Result<UserProfile, ClientError> {
        let response = self
            .client
            .get(self.config.endpoint(USER_PATH))
            .bearer_auth(credential.token())
            .send()
            .await
            .map_err(|e| TransportError::connect(format!("user request failed: {e}")))?;
        read_user(response).await
    }

    /// Tells the server the credential is no longer in use. Failures are
    /// logged and otherwise ignored; the caller drops the credential either
    /// way.
    pub async fn logout(&self, credential: &Credential) {
        let result = self
            .client
            .post(self.config.endpoint(LOGOUT_PATH))
            .bearer_auth(credential.token())
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => debug!("logged out"),
            Ok(response) => warn!(status = %response.status(), "logout call rejected"),
            Err(err) => warn!(error = %err, "logout call failed"),
        }
    }
}

async fn read_user(response: reqwest::Response) -> Result<UserProfile, ClientError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        return Err(TransportError::status(status.as_u16(), body).into());
    }
    let envelope: UserEnvelope = response
        .json()
        .await
        .map_err(|e| ClientError::protocol_msg(format!("unreadable user response: {e}")))?;
    Ok(envelope.user)
}
