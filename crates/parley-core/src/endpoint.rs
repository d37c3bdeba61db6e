use url::Url;

use crate::errors::ConnectionError;
use crate::ids::ConversationId;
use crate::security::Credential;

/// A validated `ws://` or `wss://` endpoint, without any credential attached.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    url: Url,
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self, ConnectionError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ConnectionError::InvalidEndpoint("endpoint is empty".into()));
        }

        let url = Url::parse(trimmed).map_err(|e| ConnectionError::InvalidEndpoint(e.to_string()))?;

        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(ConnectionError::InvalidEndpoint(format!(
                    "unsupported scheme {other} (expected ws or wss)"
                )))
            }
        }

        if url.host_str().map_or(true, str::is_empty) {
            return Err(ConnectionError::InvalidEndpoint("no host in endpoint".into()));
        }

        // The credential travels as a query parameter, never as userinfo.
        if !url.username().is_empty() || url.password().is_some() {
            return Err(ConnectionError::InvalidEndpoint(
                "endpoint must not embed credentials".into(),
            ));
        }

        Ok(Self { url })
    }

    /// Append the conversation id as the last path segment of `base`.
    pub fn for_conversation(base: &str, conversation: &ConversationId) -> Result<Self, ConnectionError> {
        let mut endpoint = Self::parse(base)?;
        endpoint
            .url
            .path_segments_mut()
            .map_err(|()| ConnectionError::InvalidEndpoint("endpoint cannot take a path".into()))?
            .pop_if_empty()
            .push(conversation.as_str())
            .push("");
        Ok(endpoint)
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// The URL actually dialed: the endpoint plus the credential under `token_param`.
    pub fn connect_url(&self, credential: &Credential, token_param: &str) -> Url {
        let mut url = self.url.clone();
        if !credential.is_empty() {
            url.query_pairs_mut().append_pair(token_param, credential.expose());
        }
        url
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.url.as_str())
    }
}
