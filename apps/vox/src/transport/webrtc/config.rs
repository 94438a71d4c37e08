use webrtc::ice_transport::ice_server::RTCIceServer;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Configuration for the WebRTC transport capability
#[derive(Clone, Debug)]
pub struct WebRtcConfig {
    /// ICE servers for connection establishment
    pub ice_servers: Vec<RTCIceServer>,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![RTCIceServer {
                urls: vec![DEFAULT_STUN_URL.to_string()],
                ..Default::default()
            }],
        }
    }
}

impl WebRtcConfig {
    /// One ICE server per STUN url; an empty list means host candidates only.
    pub fn from_stun_urls(urls: &[String]) -> Self {
        Self {
            ice_servers: urls
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
        }
    }

    /// Create a localhost-only configuration (no STUN/TURN)
    pub fn localhost() -> Self {
        Self {
            ice_servers: vec![],
        }
    }
}

/// Builder for WebRTC configuration
#[derive(Default)]
pub struct WebRtcConfigBuilder {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_ice_server(mut self, urls: Vec<String>) -> Self {
        self.ice_servers.push(RTCIceServer {
            urls,
            ..Default::default()
        });
        self
    }

    pub fn add_ice_server_with_credentials(
        mut self,
        urls: Vec<String>,
        username: String,
        credential: String,
    ) -> Self {
        self.ice_servers.push(RTCIceServer {
            urls,
            username,
            credential,
            ..Default::default()
        });
        self
    }

    pub fn build(self) -> WebRtcConfig {
        WebRtcConfig {
            ice_servers: self.ice_servers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_uses_public_stun() {
        let config = WebRtcConfig::default();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].urls, vec![DEFAULT_STUN_URL.to_string()]);
    }

    #[test]
    fn builder_keeps_turn_credentials() {
        let config = WebRtcConfigBuilder::new()
            .add_ice_server(vec!["stun:stun.example.org:3478".into()])
            .add_ice_server_with_credentials(
                vec!["turn:turn.example.org:3478".into()],
                "alice".into(),
                "secret".into(),
            )
            .build();

        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[1].username, "alice");
        assert_eq!(config.ice_servers[1].credential, "secret");
    }

    #[test]
    fn empty_stun_list_is_localhost_only() {
        assert!(WebRtcConfig::from_stun_urls(&[]).ice_servers.is_empty());
        assert!(WebRtcConfig::localhost().ice_servers.is_empty());
    }
}
