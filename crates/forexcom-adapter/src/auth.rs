//! Credentials for the FOREX.com trading API
//!
//! The REST login uses username, password and app key. The streaming
//! server is then logged into with the username and the REST session token
//! in place of the password.

use serde::{Deserialize, Serialize};

/// Trading API credentials
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub app_key: String,
}

impl Credentials {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        app_key: impl Into<String>,
    ) -> Self {
        Self { username: username.into(), password: password.into(), app_key: app_key.into() }
    }

    /// Create credentials from environment variables
    ///
    /// Expected env vars:
    /// - FOREXCOM_USERNAME
    /// - FOREXCOM_PASSWORD
    /// - FOREXCOM_APP_KEY
    pub fn from_env() -> Option<Self> {
        let username = std::env::var("FOREXCOM_USERNAME").ok()?;
        let password = std::env::var("FOREXCOM_PASSWORD").ok()?;
        let app_key = std::env::var("FOREXCOM_APP_KEY").ok()?;

        Some(Self { username, password, app_key })
    }

    /// Check if credentials are present (non-empty)
    pub fn is_valid(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty() && !self.app_key.is_empty()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("app_key", &mask_secret(&self.app_key))
            .finish()
    }
}

/// Keep the first and last three characters of a secret for log lines
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 6 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 3..].iter().collect();
    format!("{}{}{}", head, "*".repeat(chars.len() - 6), tail)
}
