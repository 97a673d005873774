//! Client configuration

use std::time::Duration;

use crate::{DEFAULT_ADAPTER_SET, REST_API_BASE, STREAM_API_BASE};

/// Endpoints and connection settings shared by the REST and streaming sides
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub rest_url: String,
    pub stream_url: String,
    /// Lightstreamer adapter set requested at session creation
    pub adapter_set: String,
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    /// Timeout of each REST request; push connections have none
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            rest_url: REST_API_BASE.to_string(),
            stream_url: STREAM_API_BASE.to_string(),
            adapter_set: DEFAULT_ADAPTER_SET.to_string(),
            http_proxy: None,
            https_proxy: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    pub fn with_rest_url(mut self, url: impl Into<String>) -> Self {
        self.rest_url = url.into();
        self
    }

    pub fn with_stream_url(mut self, url: impl Into<String>) -> Self {
        self.stream_url = url.into();
        self
    }

    pub fn with_proxies(mut self, http_proxy: Option<String>, https_proxy: Option<String>) -> Self {
        self.http_proxy = http_proxy;
        self.https_proxy = https_proxy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_point_at_production() {
        let config = ClientConfig::default();
        assert_eq!(config.rest_url, REST_API_BASE);
        assert_eq!(config.stream_url, STREAM_API_BASE);
        assert_eq!(config.adapter_set, "STREAMINGALL");
        assert_eq!(config.http_proxy, None);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_proxies_reach_both_transports() {
        let config = ClientConfig::default().with_proxies(
            Some("http://proxy.example.com:3128".to_string()),
            Some("http://proxy.example.com:3129".to_string()),
        );
        assert_eq!(config.http_proxy.as_deref(), Some("http://proxy.example.com:3128"));
        assert_eq!(config.https_proxy.as_deref(), Some("http://proxy.example.com:3129"));

        let credentials = crate::Credentials::new("alice", "secret", "app-key");
        assert!(crate::ForexClient::with_config(credentials, config.clone()).is_ok());

        let broken = config.with_proxies(Some("not a proxy url".to_string()), None);
        let credentials = crate::Credentials::new("alice", "secret", "app-key");
        assert!(crate::ForexClient::with_config(credentials, broken).is_err());
    }
}
