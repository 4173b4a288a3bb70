//! HTTP configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// HTTP client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Per-attempt request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Maximum number of redirects to follow
    pub max_redirects: u32,

    /// User agent string
    pub user_agent: String,

    /// Whether to verify SSL certificates
    pub verify_ssl: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_redirects: 10,
            user_agent: concat!("conduit/", env!("CARGO_PKG_VERSION")).to_string(),
            verify_ssl: true,
        }
    }
}

impl HttpConfig {
    /// Build a `reqwest` client with these settings
    pub fn build_client(&self) -> Result<reqwest::Client, reqwest::Error> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(&self.user_agent)
            .danger_accept_invalid_certs(!self.verify_ssl)
            .redirect(reqwest::redirect::Policy::limited(
                self.max_redirects as usize,
            ))
            .build()
    }
}
