//! HTTP transport for push and control connections
//!
//! The engine only needs two exchanges: a long-lived POST whose body is
//! read line by line (create/bind), and a short POST whose first response
//! line is the answer (control). [`Transport`] abstracts both so the engine
//! can run against an in-memory server in tests.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Proxy, Response};
use tracing::debug;
use url::Url;

use crate::error::{Result, StreamError};
use crate::lightstream::protocol::ControlRequest;

/// Longest line accepted from a push connection
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Raw body chunks of a push connection
pub type ChunkStream = BoxStream<'static, Result<Vec<u8>>>;

/// Line reader over a streamed response body
pub struct PushStream {
    chunks: ChunkStream,
    buffer: Vec<u8>,
    eof: bool,
}

impl PushStream {
    pub fn new(chunks: ChunkStream) -> Self {
        Self { chunks, buffer: Vec::new(), eof: false }
    }

    /// Read the next line, right-trimmed. Suspends until a line terminator
    /// or end of body. `Ok(None)` once the body is exhausted.
    ///
    /// A line longer than [`MAX_LINE_LENGTH`] fails with `Malformed`.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
                return Ok(Some(String::from_utf8_lossy(&raw).trim_end().to_string()));
            }

            if self.buffer.len() > MAX_LINE_LENGTH {
                let head = String::from_utf8_lossy(&self.buffer[..64]).to_string();
                self.buffer.clear();
                return Err(StreamError::Malformed(format!(
                    "line exceeds {} bytes: {}...",
                    MAX_LINE_LENGTH, head
                )));
            }

            if self.eof {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                let raw = std::mem::take(&mut self.buffer);
                return Ok(Some(String::from_utf8_lossy(&raw).trim_end().to_string()));
            }

            match self.chunks.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(e),
                None => self.eof = true,
            }
        }
    }

    /// Drain everything left in the body. Stops quietly on read errors.
    pub async fn read_remaining(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(Some(line)) = self.read_line().await {
            lines.push(line);
        }
        lines
    }
}

impl fmt::Debug for PushStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushStream")
            .field("buffered", &self.buffer.len())
            .field("eof", &self.eof)
            .finish()
    }
}

/// Push/control exchange with the Lightstreamer server
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST `request` to `base/path` and stream the response body
    async fn open_stream(
        &self,
        base_url: &Url,
        path: &str,
        request: &ControlRequest,
    ) -> Result<PushStream>;

    /// POST `request` to `base/path` and return the first response line
    async fn control(&self, base_url: &Url, path: &str, request: &ControlRequest)
        -> Result<String>;
}

/// Join a base URL and an endpoint path the way the server expects
pub fn endpoint_url(base_url: &Url, path: &str) -> Result<Url> {
    let joined =
        format!("{}/{}", base_url.as_str().trim_end_matches('/'), path.trim_start_matches('/'));
    Ok(Url::parse(&joined)?)
}

/// reqwest-backed transport
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Transport without proxies
    pub fn new() -> Result<Self> {
        Self::with_proxies(None, None)
    }

    /// Transport routing through optional HTTP/HTTPS proxies
    ///
    /// No request timeout is set: a push connection stays open for as long
    /// as the server streams.
    pub fn with_proxies(http_proxy: Option<&str>, https_proxy: Option<&str>) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(proxy) = http_proxy {
            builder = builder.proxy(Proxy::http(proxy)?);
        }
        if let Some(proxy) = https_proxy {
            builder = builder.proxy(Proxy::https(proxy)?);
        }
        let client = builder.build()?;
        Ok(Self { client })
    }

    async fn post(&self, base_url: &Url, path: &str, request: &ControlRequest) -> Result<Response> {
        let url = endpoint_url(base_url, path)?;
        debug!("POST {} {:?}", url, request);

        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(request.encode())
            .send()
            .await?;

        // Error statuses still carry the diagnostic body the caller reports
        if !response.status().is_success() {
            debug!("Server answered HTTP {}", response.status());
        }
        Ok(response)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open_stream(
        &self,
        base_url: &Url,
        path: &str,
        request: &ControlRequest,
    ) -> Result<PushStream> {
        let response = self.post(base_url, path, request).await?;

        let chunks = futures::stream::unfold(Some(response), |state| async move {
            let mut response = state?;
            match response.chunk().await {
                Ok(Some(bytes)) => Some((Ok(bytes.to_vec()), Some(response))),
                Ok(None) => None,
                Err(e) => Some((Err(StreamError::from(e)), None)),
            }
        });

        Ok(PushStream::new(chunks.boxed()))
    }

    async fn control(
        &self,
        base_url: &Url,
        path: &str,
        request: &ControlRequest,
    ) -> Result<String> {
        let response = self.post(base_url, path, request).await?;
        let body = response.text().await?;
        Ok(body.lines().next().unwrap_or_default().trim_end().to_string())
    }
}
