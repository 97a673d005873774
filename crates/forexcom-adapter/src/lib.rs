//! FOREX.com Trading Adapter
//!
//! - `lightstream`: Lightstreamer HTTP-streaming engine (session, subscriptions, stream reader)
//! - `rest`: trading API REST client (login, account, market lookups)
//! - `resolver`: cached market name <-> id resolution
//! - `client`: facade combining both sides into typed price/order feeds
//!
//! # Endpoints
//! - Trading API: https://ciapi.cityindex.com/tradingapi
//! - Push server: https://push.cityindex.com

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod lightstream;
pub mod resolver;
pub mod rest;
pub mod types;

pub use auth::Credentials;
pub use client::ForexClient;
pub use config::ClientConfig;
pub use error::StreamError;
pub use types::*;

/// Trading API REST base URL
pub const REST_API_BASE: &str = "https://ciapi.cityindex.com/tradingapi/";

/// Lightstreamer push server base URL
pub const STREAM_API_BASE: &str = "https://push.cityindex.com/";

/// Adapter set carrying prices and orders
pub const DEFAULT_ADAPTER_SET: &str = "STREAMINGALL";
