//! REST client for the FOREX.com trading API
//!
//! Base URL: https://ciapi.cityindex.com/tradingapi
//!
//! # Endpoints
//! - POST /session - Log in, returns the session token
//! - GET /UserAccount/ClientAndTradingAccount - Account ids
//! - GET /cfd/markets?MarketName={name} - Market lookup by name
//! - GET /market/{id}/information - Market lookup by id
//!
//! Every request after login carries `UserName` and `Session` headers.

use std::sync::RwLock;

use anyhow::{Context, Result};
use reqwest::{Client, Proxy, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::auth::Credentials;
use crate::config::ClientConfig;
use crate::types::InstructionStatus;

/// Answers the trading API gave instead of the expected payload
#[derive(Error, Debug)]
pub enum RestError {
    /// Instruction not accepted or payload missing; the raw body is kept
    #[error("Request rejected by server: {0}")]
    Rejected(Value),

    #[error("Not logged in")]
    NotLoggedIn,
}

impl RestError {
    fn field(&self, key: &str) -> Option<&Value> {
        match self {
            RestError::Rejected(body) => body.get(key),
            RestError::NotLoggedIn => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        self.field("ErrorMessage").and_then(Value::as_str)
    }

    pub fn error_code(&self) -> Option<i64> {
        self.field("ErrorCode").and_then(Value::as_i64)
    }

    pub fn http_status(&self) -> Option<i64> {
        self.field("HttpStatus").and_then(Value::as_i64)
    }
}

/// Trading account as listed by `/UserAccount/ClientAndTradingAccount`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TradingAccount {
    pub trading_account_id: i64,

    /// Extra fields for forward compatibility
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Client and trading account ids of the logged in user
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AccountInfo {
    pub client_account_id: i64,
    #[serde(default)]
    pub trading_accounts: Vec<TradingAccount>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AccountInfo {
    /// Id of the first trading account
    pub fn trading_account_id(&self) -> Option<i64> {
        self.trading_accounts.first().map(|account| account.trading_account_id)
    }
}

/// REST client for the trading API
pub struct RestClient {
    client: Client,
    base_url: String,
    credentials: Credentials,
    session_token: RwLock<Option<String>>,
}

impl RestClient {
    /// Create a new REST client with the default configuration
    pub fn new(credentials: Credentials) -> Result<Self> {
        Self::with_config(credentials, &ClientConfig::default())
    }

    pub fn with_config(credentials: Credentials, config: &ClientConfig) -> Result<Self> {
        let mut builder = Client::builder().timeout(config.request_timeout);
        if let Some(proxy) = &config.http_proxy {
            builder = builder.proxy(Proxy::http(proxy).context("Invalid HTTP proxy")?);
        }
        if let Some(proxy) = &config.https_proxy {
            builder = builder.proxy(Proxy::https(proxy).context("Invalid HTTPS proxy")?);
        }
        let client = builder.build().context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.rest_url.trim_end_matches('/').to_string(),
            credentials,
            session_token: RwLock::new(None),
        })
    }

    pub fn username(&self) -> &str {
        &self.credentials.username
    }

    pub fn session_token(&self) -> Option<String> {
        self.session_token.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_logged_in(&self) -> bool {
        self.session_token().is_some()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn with_session(&self, request: RequestBuilder) -> RequestBuilder {
        match self.session_token() {
            Some(token) => {
                request.header("UserName", &self.credentials.username).header("Session", token)
            }
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, url: &str) -> Result<Value> {
        let response = request.send().await.context("HTTP request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // API errors come back as a JSON body with ErrorMessage/ErrorCode
            if let Ok(error @ Value::Object(_)) = serde_json::from_str::<Value>(&body) {
                return Err(anyhow::Error::new(RestError::Rejected(error))
                    .context(format!("HTTP {} for {}", status, url)));
            }
            anyhow::bail!("HTTP {} for {}: {}", status, url, body);
        }

        let json: Value = response.json().await.context("Failed to parse JSON")?;
        Ok(json)
    }

    /// GET request returning raw JSON
    pub async fn get_raw(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        let url = self.url(path);
        debug!("GET {} {:?}", url, query);
        let request = self.with_session(self.client.get(&url).query(query));
        self.send(request, &url).await
    }

    /// POST a JSON body, returning raw JSON
    pub async fn post_raw(&self, path: &str, body: &Value) -> Result<Value> {
        let url = self.url(path);
        debug!("POST {}", url);
        let request = self.with_session(self.client.post(&url).json(body));
        self.send(request, &url).await
    }

    /// Log in and keep the session token
    ///
    /// Endpoint: POST /session
    pub async fn login(&self) -> Result<String> {
        debug!("Connecting to REST API");
        let body = json!({
            "UserName": self.credentials.username,
            "Password": self.credentials.password,
            "AppKey": self.credentials.app_key,
        });
        let res = self.post_raw("/session", &body).await?;

        let status =
            res.get("StatusCode").and_then(Value::as_i64).and_then(InstructionStatus::from_id);
        if status != Some(InstructionStatus::Accepted) {
            return Err(RestError::Rejected(res).into());
        }
        let token = res
            .get("Session")
            .and_then(Value::as_str)
            .ok_or_else(|| RestError::Rejected(res.clone()))?
            .to_string();

        *self.session_token.write().unwrap_or_else(|e| e.into_inner()) = Some(token.clone());
        info!("Logged in as {}", self.credentials.username);
        Ok(token)
    }

    /// Endpoint: GET /UserAccount/ClientAndTradingAccount
    pub async fn get_account_info(&self) -> Result<AccountInfo> {
        debug!("Getting account info");
        let res = self.get_raw("/UserAccount/ClientAndTradingAccount", &[]).await?;
        let info: AccountInfo =
            serde_json::from_value(res.clone()).map_err(|_| RestError::Rejected(res))?;
        if info.trading_accounts.is_empty() {
            return Err(RestError::Rejected(serde_json::to_value(&info)?).into());
        }
        Ok(info)
    }

    /// Market id for a market name (e.g. `EUR/USD`)
    ///
    /// Endpoint: GET /cfd/markets?MarketName={name}
    pub async fn get_market_id(&self, name: &str) -> Result<i64> {
        debug!("Getting symbol details for {}", name);
        let res = self.get_raw("/cfd/markets", &[("MarketName", name)]).await?;
        res.pointer("/Markets/0/MarketId")
            .and_then(Value::as_i64)
            .ok_or_else(|| RestError::Rejected(res.clone()).into())
    }

    /// Market name for a market id
    ///
    /// Endpoint: GET /market/{id}/information
    pub async fn get_market_name(&self, market_id: i64) -> Result<String> {
        debug!("Getting symbol name for {}", market_id);
        let res = self.get_raw(&format!("/market/{}/information", market_id), &[]).await?;
        res.pointer("/MarketInformation/Name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| RestError::Rejected(res.clone()).into())
    }
}

impl std::fmt::Debug for RestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url)
            .field("credentials", &self.credentials)
            .field("logged_in", &self.is_logged_in())
            .finish()
    }
}
