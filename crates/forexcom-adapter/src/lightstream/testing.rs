//! In-memory Lightstreamer server for engine tests
//!
//! Push streams are queued up front and fed line by line from the test;
//! every create/bind/control request is recorded.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::channel::oneshot;
use futures::StreamExt;
use url::Url;

use crate::error::{Result, StreamError};
use crate::lightstream::protocol::{ControlOp, ControlRequest, OK_CMD};
use crate::lightstream::transport::{PushStream, Transport};

#[derive(Clone, Debug)]
pub(crate) struct RecordedRequest {
    pub base_url: String,
    pub path: String,
    pub params: Vec<(String, String)>,
}

impl RecordedRequest {
    fn new(base_url: &Url, path: &str, request: &ControlRequest) -> Self {
        Self {
            base_url: base_url.to_string(),
            path: path.to_string(),
            params: request.params().iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        }
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

/// Server side of one push connection
#[derive(Clone)]
pub(crate) struct StreamFeed {
    tx: UnboundedSender<Result<Vec<u8>>>,
}

impl StreamFeed {
    pub fn send_lines(&self, lines: &[&str]) {
        for line in lines {
            let _ = self.tx.unbounded_send(Ok(format!("{}\r\n", line).into_bytes()));
        }
    }

    pub fn fail(&self, reason: &str) {
        let _ = self.tx.unbounded_send(Err(StreamError::Transport(reason.to_string())));
    }

    pub fn close(&self) {
        self.tx.close_channel();
    }
}

#[derive(Default)]
struct FakeInner {
    streams: VecDeque<PushStream>,
    opened: Vec<RecordedRequest>,
    controls: Vec<RecordedRequest>,
    responses: VecDeque<String>,
    held: VecDeque<oneshot::Receiver<String>>,
    destroy_feeds: Vec<StreamFeed>,
}

#[derive(Default)]
pub(crate) struct FakeTransport {
    inner: Mutex<FakeInner>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue the push stream handed out by the next create/bind
    pub fn queue_stream(&self) -> StreamFeed {
        let (tx, rx) = unbounded();
        self.inner.lock().unwrap().streams.push_back(PushStream::new(rx.boxed()));
        StreamFeed { tx }
    }

    /// Answer the next control request with `response` instead of OK
    pub fn respond_control(&self, response: &str) {
        self.inner.lock().unwrap().responses.push_back(response.to_string());
    }

    /// Hold the next control request until a response is sent on the
    /// returned channel
    pub fn hold_control(&self) -> oneshot::Sender<String> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().unwrap().held.push_back(rx);
        tx
    }

    /// Close `feed` when a destroy request arrives
    pub fn on_destroy(&self, feed: StreamFeed) {
        self.inner.lock().unwrap().destroy_feeds.push(feed);
    }

    pub fn opened(&self) -> Vec<RecordedRequest> {
        self.inner.lock().unwrap().opened.clone()
    }

    pub fn controls(&self) -> Vec<RecordedRequest> {
        self.inner.lock().unwrap().controls.clone()
    }

    /// Control requests with the given `LS_op`
    pub fn controls_with_op(&self, op: &str) -> Vec<RecordedRequest> {
        self.controls().into_iter().filter(|c| c.param("LS_op") == Some(op)).collect()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open_stream(
        &self,
        base_url: &Url,
        path: &str,
        request: &ControlRequest,
    ) -> Result<PushStream> {
        let mut inner = self.inner.lock().unwrap();
        inner.opened.push(RecordedRequest::new(base_url, path, request));
        inner
            .streams
            .pop_front()
            .ok_or_else(|| StreamError::Transport("connection refused".to_string()))
    }

    async fn control(
        &self,
        base_url: &Url,
        path: &str,
        request: &ControlRequest,
    ) -> Result<String> {
        let held = {
            let mut inner = self.inner.lock().unwrap();
            inner.controls.push(RecordedRequest::new(base_url, path, request));
            if request.op() == ControlOp::Destroy {
                for feed in inner.destroy_feeds.drain(..) {
                    feed.close();
                }
            }
            match inner.held.pop_front() {
                Some(rx) => rx,
                None => {
                    return Ok(inner.responses.pop_front().unwrap_or_else(|| OK_CMD.to_string()))
                }
            }
        };
        held.await.map_err(|_| StreamError::Transport("control request dropped".to_string()))
    }
}

/// Poll `condition` until it holds; panics after two seconds
pub(crate) async fn wait_for(condition: impl Fn() -> bool) {
    let polled = tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "condition not reached in time");
}
