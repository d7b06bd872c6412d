use std::time::Duration;

use reqwest::{Method, RequestBuilder, Url};
use tokio::sync::watch;
use tracing::info;

use crate::gateway::GatewayError;

/// Where and how to reach the flow engine.
#[derive(Debug, Clone)]
pub struct RpcSettings {
    pub base_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Delay between outcome polls for a running flow.
    pub poll_interval: Duration,
    pub request_timeout: Duration,
}

impl RpcSettings {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            username: None,
            password: None,
            poll_interval: Duration::from_millis(500),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Owned connection to the flow engine.
///
/// Opened once at startup and closed at shutdown. Closing stops every
/// outcome watcher spawned through this connection.
pub struct RpcConnection {
    client: reqwest::Client,
    base_url: Url,
    settings: RpcSettings,
    closed: watch::Sender<bool>,
}

impl RpcConnection {
    pub fn open(settings: RpcSettings) -> Result<Self, GatewayError> {
        let base_url = Url::parse(&settings.base_url).map_err(|e| {
            GatewayError::Connection(format!("invalid engine URL '{}': {}", settings.base_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(GatewayError::Connection(format!(
                "engine URL '{}' cannot carry a path",
                settings.base_url
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| GatewayError::Connection(format!("failed to build HTTP client: {}", e)))?;

        info!(
            engine = %base_url,
            username = settings.username.as_deref().unwrap_or("-"),
            "Opened RPC connection"
        );

        let (closed, _) = watch::channel(false);
        Ok(Self {
            client,
            base_url,
            settings,
            closed,
        })
    }

    /// Build a request to `base_url/<segments...>`; segments are percent-encoded.
    pub fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }

        let builder = self.client.request(method, url);
        match &self.settings.username {
            Some(user) => builder.basic_auth(user, self.settings.password.as_ref()),
            None => builder,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.settings.poll_interval
    }

    /// Receiver that flips to `true` once the connection is closed.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Close the connection. Safe to call more than once.
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            info!(engine = %self.base_url, "Closed RPC connection");
        }
    }
}

impl Drop for RpcConnection {
    fn drop(&mut self) {
        self.close();
    }
}
