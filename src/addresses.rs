use std::sync::Arc;

use thiserror::Error;
use url::Url;

use crate::auth::TokenProvider;
use crate::model::SessionKey;

#[derive(Debug, Error)]
pub enum AddressError {
    #[error("unsupported endpoint scheme '{0}', expected http(s) or ws(s)")]
    InvalidScheme(String),
}

/// Rewrites an API base URL to its websocket equivalent, rejecting schemes
/// the desktop endpoints cannot live under.
pub(crate) fn to_ws_base(base: &Url) -> Result<Url, AddressError> {
    let scheme = match base.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => return Err(AddressError::InvalidScheme(other.to_string())),
    };
    let mut url = base.clone();
    // http(s)/ws(s) are all "special" schemes, so the rewrite cannot fail
    // once the scheme is validated above.
    let _ = url.set_scheme(scheme);
    Ok(url)
}

/// Builds authenticated endpoint URLs for one desktop session.
///
/// The token is read from the provider at every call, never cached, so a
/// just-refreshed token is transparently picked up by the next connection
/// attempt.
#[derive(Clone)]
pub struct DesktopAddresses {
    ws_base: Url,
    tokens: Arc<dyn TokenProvider>,
    key: SessionKey,
}

impl DesktopAddresses {
    pub fn new(
        base: &Url,
        tokens: Arc<dyn TokenProvider>,
        key: SessionKey,
    ) -> Result<Self, AddressError> {
        Ok(Self {
            ws_base: to_ws_base(base)?,
            tokens,
            key,
        })
    }

    pub fn session(&self) -> &SessionKey {
        &self.key
    }

    fn ws_endpoint(&self, endpoint: &str) -> Url {
        let mut url = self.ws_base.clone();
        url.set_path(&format!(
            "/api/desktops/ws/{}/{}/{}",
            self.key.namespace, self.key.name, endpoint
        ));
        url.query_pairs_mut()
            .clear()
            .append_pair("token", &self.tokens.current_token());
        url
    }

    /// Websocket address for display connections.
    pub fn display_url(&self) -> Url {
        self.ws_endpoint("display")
    }

    /// Websocket address for audio connections.
    pub fn audio_url(&self) -> Url {
        self.ws_endpoint("audio")
    }

    /// Websocket address for querying desktop boot status.
    pub fn status_url(&self) -> Url {
        self.ws_endpoint("status")
    }

    /// Websocket address following a container's logs.
    pub fn logs_follow_url(&self, container: &str) -> Url {
        self.ws_endpoint(&format!("logs/{container}"))
    }

    /// Plain API path for fetching a container's logs.
    pub fn logs_url(&self, container: &str) -> String {
        format!(
            "/api/desktops/{}/{}/logs/{}",
            self.key.namespace, self.key.name, container
        )
    }
}
