//! FOREX.com client facade
//!
//! Ties the REST side (login, account, market lookups) to the streaming
//! side (session, subscriptions, listener multiplexing).
//!
//! # Flow
//! 1. `connect()` logs in over REST, then opens a streaming session with
//!    the username and the REST session token
//! 2. `price_symbol_subscribe()` / `orders_subscribe()` add listeners that
//!    receive typed [`Price`] / [`Order`] records
//! 3. `disconnect()` drops every subscription and destroys the session

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::auth::Credentials;
use crate::config::ClientConfig;
use crate::error::StreamError;
use crate::lightstream::{
    HttpTransport, ListenerIndex, StreamerClient, SubscriberMultiplexer, Subscription,
    SubscriptionMode, Transport, UpdateEvent, UpdateListener,
};
use crate::resolver::SymbolResolver;
use crate::rest::{AccountInfo, RestClient, RestError};
use crate::types::{Order, Price, ORDER_FIELDS, PRICE_FIELDS};

/// Subscriber name, item and data adapter of the order channel
pub const ORDERS_CHANNEL: &str = "ORDERS";

/// Data adapter serving price items
pub const PRICES_ADAPTER: &str = "PRICES";

/// Streaming item of a market's prices
pub fn price_item(market_id: i64) -> String {
    format!("PRICE.{}", market_id)
}

pub struct ForexClient {
    rest: Arc<RestClient>,
    resolver: Arc<SymbolResolver>,
    subscribers: SubscriberMultiplexer,
    account_info: tokio::sync::Mutex<Option<AccountInfo>>,
}

impl ForexClient {
    pub fn new(credentials: Credentials) -> Result<Self> {
        Self::with_config(credentials, ClientConfig::default())
    }

    pub fn with_config(credentials: Credentials, config: ClientConfig) -> Result<Self> {
        let transport = HttpTransport::with_proxies(
            config.http_proxy.as_deref(),
            config.https_proxy.as_deref(),
        )?;
        Self::with_transport(credentials, config, Arc::new(transport))
    }

    /// Client whose streaming side runs over `transport`
    pub fn with_transport(
        credentials: Credentials,
        config: ClientConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let rest = Arc::new(RestClient::with_config(credentials, &config)?);
        let resolver = Arc::new(SymbolResolver::new(rest.clone()));
        let streamer =
            StreamerClient::with_transport(&config.stream_url, &config.adapter_set, transport)
                .context("Invalid stream URL")?;

        Ok(Self {
            rest,
            resolver,
            subscribers: SubscriberMultiplexer::new(Arc::new(streamer)),
            account_info: tokio::sync::Mutex::new(None),
        })
    }

    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    pub fn resolver(&self) -> &SymbolResolver {
        &self.resolver
    }

    pub fn streamer(&self) -> &StreamerClient {
        self.subscribers.client()
    }

    pub fn subscribers(&self) -> &SubscriberMultiplexer {
        &self.subscribers
    }

    pub fn is_connected(&self) -> bool {
        self.rest.is_logged_in() && self.streamer().is_connected()
    }

    /// Log in over REST if needed, then open the streaming session
    pub async fn connect(&self) -> Result<()> {
        if self.rest.is_logged_in() {
            debug!("Rest connected before.");
        } else {
            self.rest.login().await?;
        }

        let token = self.rest.session_token().ok_or(RestError::NotLoggedIn)?;
        self.streamer().connect(self.rest.username(), &token).await?;
        Ok(())
    }

    /// Remove every subscription, then destroy the streaming session
    pub async fn disconnect(&self) -> Result<()> {
        if let Err(e) = self.subscribers.remove_everything().await {
            warn!("Unsubscribe during disconnect failed: {}", e);
        }
        self.streamer().disconnect().await?;
        info!("Disconnected");
        Ok(())
    }

    /// Listen to price ticks of `symbol` (e.g. `EUR/USD`)
    ///
    /// The first listener of a symbol subscribes to its price item; later
    /// ones share that subscription.
    pub async fn price_symbol_subscribe<F>(
        &self,
        symbol: &str,
        callback: F,
    ) -> Result<ListenerIndex>
    where
        F: Fn(&Price) + Send + Sync + 'static,
    {
        self.ensure_streaming()?;

        let market_id = self.resolver.symbol_id(symbol).await?;
        let subscription = Subscription::new(
            SubscriptionMode::Merge,
            vec![price_item(market_id)],
            PRICE_FIELDS.iter().map(|f| f.to_string()).collect(),
            PRICES_ADAPTER,
        );

        let resolver = self.resolver.clone();
        let fallback = symbol.to_string();
        let listener: UpdateListener = Arc::new(move |event: &UpdateEvent| {
            let name = event
                .get("MarketId")
                .and_then(|id| id.trim().parse().ok())
                .and_then(|id| resolver.cached_name(id))
                .unwrap_or_else(|| fallback.clone());
            match Price::from_update(event, Some(name)) {
                Ok(price) => {
                    debug!("Price update: {}", price);
                    callback(&price);
                }
                Err(e) => warn!("Skipping price update: {}", e),
            }
        });

        let index = self.subscribers.subscribe(symbol, subscription, listener).await?;
        debug!("Subscribed to {} as {}", symbol, index);
        Ok(index)
    }

    /// Listen to order updates of the logged in account
    pub async fn orders_subscribe<F>(&self, callback: F) -> Result<ListenerIndex>
    where
        F: Fn(&Order) + Send + Sync + 'static,
    {
        self.ensure_streaming()?;

        let subscription = Subscription::new(
            SubscriptionMode::Merge,
            vec![ORDERS_CHANNEL.to_string()],
            ORDER_FIELDS.iter().map(|f| f.to_string()).collect(),
            ORDERS_CHANNEL,
        );

        let resolver = self.resolver.clone();
        let listener: UpdateListener = Arc::new(move |event: &UpdateEvent| {
            let name = event
                .get("MarketId")
                .and_then(|id| id.trim().parse().ok())
                .and_then(|id| resolver.cached_name(id));
            match Order::from_update(event, name) {
                Ok(order) => {
                    debug!("Orders update: {}", order);
                    callback(&order);
                }
                Err(e) => warn!("Skipping order update: {}", e),
            }
        });

        Ok(self.subscribers.subscribe(ORDERS_CHANNEL, subscription, listener).await?)
    }

    /// Remove one listener; the subscription goes with the last one
    pub async fn unsubscribe_listener(&self, index: &ListenerIndex) -> Result<()> {
        self.subscribers.remove_listener(index).await?;
        Ok(())
    }

    /// Remove every listener of `name` (a symbol or `ORDERS`)
    pub async fn unsubscribe(&self, name: &str) -> Result<()> {
        self.subscribers.remove_all(name).await?;
        Ok(())
    }

    pub async fn orders_unsubscribe(&self) -> Result<()> {
        self.unsubscribe(ORDERS_CHANNEL).await
    }

    /// Fetch account info and keep it for the id accessors
    pub async fn get_account_info(&self) -> Result<AccountInfo> {
        let info = self.rest.get_account_info().await?;
        *self.account_info.lock().await = Some(info.clone());
        Ok(info)
    }

    async fn account_info(&self) -> Result<AccountInfo> {
        if let Some(info) = self.account_info.lock().await.clone() {
            return Ok(info);
        }
        self.get_account_info().await
    }

    pub async fn client_account_id(&self) -> Result<i64> {
        Ok(self.account_info().await?.client_account_id)
    }

    pub async fn trading_account_id(&self) -> Result<i64> {
        let info = self.account_info().await?;
        info.trading_account_id().ok_or_else(|| anyhow::anyhow!("No trading account"))
    }

    fn ensure_streaming(&self) -> Result<()> {
        if !self.streamer().is_connected() {
            debug!("Streamer not connected.");
            return Err(StreamError::NoSession.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lightstream::testing::{wait_for, FakeTransport, StreamFeed};
    use serde_json::json;
    use std::sync::Mutex;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn trading_api() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"StatusCode": 1, "Session": "token-1"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/cfd/markets"))
            .and(query_param("MarketName", "EUR/USD"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"Markets": [{"MarketId": 401484347}]})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/UserAccount/ClientAndTradingAccount"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ClientAccountId": 10,
                "TradingAccounts": [{"TradingAccountId": 20}]
            })))
            .mount(&server)
            .await;
        server
    }

    async fn connected(server: &MockServer) -> (ForexClient, Arc<FakeTransport>, StreamFeed) {
        let transport = FakeTransport::new();
        let feed = transport.queue_stream();
        feed.send_lines(&["OK", "SessionId:S1", ""]);

        let config = ClientConfig::default()
            .with_rest_url(server.uri())
            .with_stream_url("https://push.example.com/");
        let client = ForexClient::with_transport(
            Credentials::new("alice", "pw", "key"),
            config,
            transport.clone(),
        )
        .unwrap();
        client.connect().await.unwrap();
        (client, transport, feed)
    }

    #[tokio::test]
    async fn test_connect_uses_session_token_for_streaming() {
        let server = trading_api().await;
        let (client, transport, _feed) = connected(&server).await;

        assert!(client.is_connected());
        let create = &transport.opened()[0];
        assert_eq!(create.param("LS_user"), Some("alice"));
        assert_eq!(create.param("LS_password"), Some("token-1"));
        assert_eq!(create.param("LS_adapter_set"), Some("STREAMINGALL"));

        // Already logged in: no second login
        client.connect().await.unwrap();
        let logins = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == "/session")
            .count();
        assert_eq!(logins, 1);
    }

    #[tokio::test]
    async fn test_subscribe_before_connect_fails() {
        let server = trading_api().await;
        let config = ClientConfig::default().with_rest_url(server.uri());
        let client = ForexClient::with_transport(
            Credentials::new("alice", "pw", "key"),
            config,
            FakeTransport::new(),
        )
        .unwrap();

        let err = client.price_symbol_subscribe("EUR/USD", |_| {}).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<StreamError>(), Some(StreamError::NoSession)));
    }

    #[tokio::test]
    async fn test_price_listeners_share_one_subscription() {
        let server = trading_api().await;
        let (client, transport, feed) = connected(&server).await;

        let prices = Arc::new(Mutex::new(Vec::new()));
        let sink = prices.clone();
        let first = client
            .price_symbol_subscribe("EUR/USD", move |p: &Price| {
                sink.lock().unwrap().push(p.clone())
            })
            .await
            .unwrap();
        let second = client.price_symbol_subscribe("EUR/USD", |_| {}).await.unwrap();
        assert_eq!(first.name(), "EUR/USD");
        assert_ne!(first, second);

        let adds = transport.controls_with_op("add");
        assert_eq!(adds.len(), 1);
        assert_eq!(adds[0].param("LS_id"), Some("PRICE.401484347"));
        assert_eq!(adds[0].param("LS_data_adapter"), Some("PRICES"));
        assert_eq!(adds[0].param("LS_mode"), Some("MERGE"));
        assert_eq!(adds[0].param("LS_schema"), Some(PRICE_FIELDS.join(" ").as_str()));

        feed.send_lines(&[
            "1,1|401484347|/Date(1700000000000)/|1.08513|1.08521|1.08517|1.0866|1.0841|-0.0004|1|A1|0",
        ]);
        wait_for(|| prices.lock().unwrap().len() == 1).await;

        let price = prices.lock().unwrap()[0].clone();
        assert_eq!(price.symbol_name.as_deref(), Some("EUR/USD"));
        assert_eq!(price.offer, "1.08521");
        assert_eq!(price.direction, 1);

        client.unsubscribe_listener(&first).await.unwrap();
        assert!(transport.controls_with_op("delete").is_empty());
        client.unsubscribe_listener(&second).await.unwrap();
        assert_eq!(transport.controls_with_op("delete").len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_price_is_skipped() {
        let server = trading_api().await;
        let (client, _transport, feed) = connected(&server).await;

        let prices = Arc::new(Mutex::new(Vec::new()));
        let sink = prices.clone();
        client
            .price_symbol_subscribe("EUR/USD", move |p: &Price| {
                sink.lock().unwrap().push(p.bid.clone())
            })
            .await
            .unwrap();

        feed.send_lines(&[
            "1,1|401484347|not a date|1.1|1.2|1.15|1.3|1.0|0|1|A1|0",
            "1,1||/Date(1700000000000)/|2.0",
        ]);
        wait_for(|| prices.lock().unwrap().len() == 1).await;
        assert_eq!(prices.lock().unwrap()[0], "2.0");
    }

    #[tokio::test]
    async fn test_orders_subscribe_and_unsubscribe() {
        let server = trading_api().await;
        let (client, transport, _feed) = connected(&server).await;

        client.orders_subscribe(|_| {}).await.unwrap();
        let adds = transport.controls_with_op("add");
        assert_eq!(adds[0].param("LS_id"), Some("ORDERS"));
        assert_eq!(adds[0].param("LS_data_adapter"), Some("ORDERS"));
        assert!(client.subscribers().contains(ORDERS_CHANNEL));

        client.orders_unsubscribe().await.unwrap();
        assert!(!client.subscribers().contains(ORDERS_CHANNEL));
        assert_eq!(transport.controls_with_op("delete").len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_removes_subscriptions_then_destroys() {
        let server = trading_api().await;
        let (client, transport, feed) = connected(&server).await;
        transport.on_destroy(feed);

        client.price_symbol_subscribe("EUR/USD", |_| {}).await.unwrap();
        client.orders_subscribe(|_| {}).await.unwrap();
        client.disconnect().await.unwrap();

        let ops: Vec<String> = transport
            .controls()
            .iter()
            .filter_map(|c| c.param("LS_op").map(str::to_string))
            .collect();
        assert_eq!(ops, vec!["add", "add", "delete", "delete", "destroy"]);
        assert!(!client.streamer().is_connected());
        assert!(client.subscribers().names().is_empty());
    }

    #[tokio::test]
    async fn test_account_ids_are_cached() {
        let server = trading_api().await;
        let (client, _transport, _feed) = connected(&server).await;

        assert_eq!(client.client_account_id().await.unwrap(), 10);
        assert_eq!(client.trading_account_id().await.unwrap(), 20);
    }
}
