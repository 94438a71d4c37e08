use std::env;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

use crate::channel::ChannelError;
use crate::transport::webrtc::WebRtcConfig;
use crate::transport::webrtc::config::DEFAULT_STUN_URL;

pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:9527/ws/client";
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(5000);

/// Client configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// WebSocket endpoint of the signaling server
    pub signaling_url: String,
    /// Local identity announced in `client_connect`
    pub client_id: String,
    /// STUN servers; empty means host candidates only
    pub stun_urls: Vec<String>,
    pub reconnect_delay: Duration,
    /// Unset disables negotiation expiry
    pub negotiation_timeout: Option<Duration>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_vars(|name| env::var(name).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(url) = var("VOX_SIGNALING_URL").filter(|url| !url.trim().is_empty()) {
            config.signaling_url = url.trim().to_string();
        }
        if let Some(client_id) = var("VOX_CLIENT_ID").filter(|id| !id.trim().is_empty()) {
            config.client_id = client_id.trim().to_string();
        }
        if let Some(urls) = var("VOX_STUN_URLS") {
            config.stun_urls = urls
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect();
        }
        if var("VOX_LOCALHOST_ONLY").is_some_and(|v| v != "0" && !v.is_empty()) {
            config.stun_urls.clear();
        }
        if let Some(delay) = var("VOX_RECONNECT_DELAY_MS").and_then(|v| v.trim().parse::<u64>().ok()) {
            config.reconnect_delay = Duration::from_millis(delay);
        }
        config.negotiation_timeout = var("VOX_NEGOTIATION_TIMEOUT_SECS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        config
    }

    /// Parsed signaling URL. `localhost` is pinned to IPv4 so a server bound
    /// to 127.0.0.1 is reachable on hosts that prefer `::1`.
    pub fn signaling_url(&self) -> Result<Url, ChannelError> {
        let invalid = |reason: String| ChannelError::InvalidUrl {
            url: self.signaling_url.clone(),
            reason,
        };
        let mut url = Url::parse(&self.signaling_url).map_err(|err| invalid(err.to_string()))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => return Err(invalid(format!("unsupported scheme {other}"))),
        }
        if url.host_str() == Some("localhost") {
            url.set_host(Some("127.0.0.1"))
                .map_err(|err| invalid(err.to_string()))?;
        }
        Ok(url)
    }

    pub fn webrtc(&self) -> WebRtcConfig {
        WebRtcConfig::from_stun_urls(&self.stun_urls)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            client_id: Uuid::new_v4().to_string(),
            stun_urls: vec![DEFAULT_STUN_URL.to_string()],
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            negotiation_timeout: None,
        }
    }
}
