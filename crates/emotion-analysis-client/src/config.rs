use std::time::Duration;

use crate::errors::ClientError;
use crate::supervisor::ReconnectPolicy;

/// Default API endpoint for a locally running analysis server.
pub const DEFAULT_BASE_URL: &str = "http://localhost:5000";

/// Values injected at process start for every client in this crate.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base URL of the analysis API.
    pub base_url: String,
    /// Client id of the external auth provider, for collaborators rendering a
    /// login surface.
    pub auth_client_id: Option<String>,
    /// Connect timeout for every request. Streams themselves are long-lived and
    /// have no overall timeout.
    pub connect_timeout: Duration,
    /// Overall timeout for short request/response calls (auth).
    pub request_timeout: Duration,
    /// Reconnect behaviour for job streams.
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            auth_client_id: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Creates a config for the given base URL with default timeouts.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Builds a config from the environment.
    ///
    /// - `EMOTION_API_URL`: base URL (default `http://localhost:5000`).
    /// - `EMOTION_AUTH_CLIENT_ID`: optional auth provider client id.
    /// - `EMOTION_RECONNECT_DELAY_MS`: optional reconnect delay override.
    pub fn from_env() -> Result<Self, ClientError> {
        let mut config = match std::env::var("EMOTION_API_URL") {
            Ok(url) if !url.trim().is_empty() => Self::new(url.trim()),
            _ => Self::default(),
        };
        config.auth_client_id = std::env::var("EMOTION_AUTH_CLIENT_ID")
            .ok()
            .filter(|id| !id.trim().is_empty());
        if let Ok(raw) = std::env::var("EMOTION_RECONNECT_DELAY_MS") {
            let millis = raw.trim().parse::<u64>().map_err(|e| {
                ClientError::Config(format!("invalid EMOTION_RECONNECT_DELAY_MS `{raw}`: {e}"))
            })?;
            config.reconnect.delay = Duration::from_millis(millis);
        }
        config.validate()?;
        Ok(config)
    }

    /// Sets the auth provider client id.
    pub fn auth_client_id(mut self, id: impl Into<String>) -> Self {
        self.auth_client_id = Some(id.into());
        self
    }

    /// Overrides the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Overrides the request timeout for short calls.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Overrides the reconnect policy.
    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        let base = self.base_url.trim();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(ClientError::Config(format!(
                "base_url must be an http(s) URL, got `{}`",
                self.base_url
            )));
        }
        Ok(())
    }

    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_without_double_slashes() {
        let config = ClientConfig::new("http://api.example.test/");
        assert_eq!(
            config.endpoint("/analyze-clips"),
            "http://api.example.test/analyze-clips"
        );
    }

    #[test]
    fn validate_rejects_non_http_urls() {
        assert!(ClientConfig::new("ftp://example.test").validate().is_err());
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn defaults_use_single_reconnect() {
        let config = ClientConfig::default().auth_client_id("client-123");
        assert_eq!(config.reconnect.max_attempts, 1);
        assert_eq!(config.auth_client_id.as_deref(), Some("client-123"));
    }
}
