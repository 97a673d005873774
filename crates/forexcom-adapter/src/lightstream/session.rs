//! Session lifecycle against a Lightstreamer server
//!
//! # State Machine
//! Disconnected -> Connecting -> Connected -> (Binding -> Connected)* -> Disconnected
//!
//! `connect` opens the push connection, reads the session info header and
//! spawns the stream reader on its own task. The reader rebinds on `LOOP`
//! and clears all session and subscription state on any other termination.
//! `disconnect` destroys the session and joins the reader, so no listener
//! runs once it returns.
//!
//! Session, subscription table and subscriber entries share one lock. It is
//! never held across an await or while listeners run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::auth::mask_secret;
use crate::error::{Result, StreamError};
use crate::lightstream::protocol::{
    parse_session_info, ControlRequest, BIND_SESSION_PATH, CONTROL_PATH, CREATE_SESSION_PATH,
    OK_CMD,
};
use crate::lightstream::reader;
use crate::lightstream::subscriber::SubscriberEntry;
use crate::lightstream::table::{Subscription, SubscriptionTable};
use crate::lightstream::transport::{HttpTransport, PushStream, Transport};

const SESSION_ID_KEY: &str = "SessionId";
const CONTROL_ADDRESS_KEY: &str = "ControlAddress";

/// Live session as announced by the server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    /// Where control requests and rebinds go
    pub control_url: Url,
    /// Every `key:value` pair of the session header
    pub info: HashMap<String, String>,
    /// A push connection is currently attached
    pub bound: bool,
}

impl Session {
    fn from_info(base_url: &Url, info: HashMap<String, String>) -> Result<Self> {
        let session_id = info.get(SESSION_ID_KEY).cloned().ok_or_else(|| StreamError::Session {
            message: "session info has no SessionId".to_string(),
            diagnostic: Vec::new(),
        })?;
        let control_url =
            control_link(base_url, info.get(CONTROL_ADDRESS_KEY).map(String::as_str))?;

        Ok(Self { session_id, control_url, info, bound: true })
    }
}

/// Control link for a session: the base URL unless the server names a
/// dedicated control address (load-balanced deployments)
pub fn control_link(base_url: &Url, control_address: Option<&str>) -> Result<Url> {
    match control_address {
        Some(address) if !address.trim().is_empty() => {
            Ok(Url::parse(&format!("{}://{}/", base_url.scheme(), address.trim()))?)
        }
        _ => Ok(base_url.clone()),
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Binding,
}

/// Why a stream reader stopped
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamTermination {
    /// Blank line or end of body
    Closed,
    /// IO failure while reading
    ReadFailed(String),
    /// `ERROR` from the server
    ServerError(String),
    /// `SYNC ERROR`: the session must be recreated from scratch
    SyncError,
    /// `END`: session closed by the server
    ServerEnd(String),
    /// Rebind after `LOOP` failed
    BindFailed(String),
    /// Reader cancelled by `disconnect`
    Aborted,
}

impl StreamTermination {
    /// Termination initiated by the server protocol
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            StreamTermination::ServerError(_)
                | StreamTermination::SyncError
                | StreamTermination::ServerEnd(_)
        )
    }

    /// Typed error for callers that treat the termination as a failure
    pub fn to_error(&self) -> StreamError {
        match self {
            StreamTermination::ServerError(reason) => {
                StreamError::ProtocolTermination(format!("ERROR {}", reason).trim().to_string())
            }
            StreamTermination::SyncError => {
                StreamError::ProtocolTermination("SYNC ERROR".to_string())
            }
            StreamTermination::ServerEnd(cause) => {
                StreamError::ProtocolTermination(format!("END {}", cause).trim().to_string())
            }
            StreamTermination::ReadFailed(reason) | StreamTermination::BindFailed(reason) => {
                StreamError::Transport(reason.clone())
            }
            StreamTermination::Closed => {
                StreamError::Transport("push connection closed".to_string())
            }
            StreamTermination::Aborted => {
                StreamError::Transport("stream reader aborted".to_string())
            }
        }
    }
}

/// Observable session status
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Why the last stream ended, if one did
    pub termination: Option<StreamTermination>,
}

/// Everything guarded by the engine lock
#[derive(Default)]
pub(crate) struct EngineState {
    pub(crate) session: Option<Session>,
    pub(crate) table: SubscriptionTable,
    pub(crate) subscribers: HashMap<String, SubscriberEntry>,
    /// Bumped on every successful connect
    pub(crate) epoch: u64,
}

pub(crate) struct Shared {
    transport: Arc<dyn Transport>,
    base_url: Url,
    adapter_set: String,
    state: Mutex<EngineState>,
    status: watch::Sender<SessionStatus>,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SessionState) {
        self.status.send_modify(|status| status.state = state);
    }

    /// Rebind the push connection of the session created at `epoch`
    pub(crate) async fn bind(&self, epoch: u64) -> Result<PushStream> {
        let (session_id, control_url) = {
            let mut state = self.lock();
            if state.epoch != epoch {
                return Err(StreamError::NoSession);
            }
            let session = state.session.as_mut().ok_or(StreamError::NoSession)?;
            session.bound = false;
            (session.session_id.clone(), session.control_url.clone())
        };

        self.set_state(SessionState::Binding);
        debug!("Binding to <{}>", control_url);

        let request = ControlRequest::bind_session(&session_id);
        let mut stream =
            self.transport.open_stream(&control_url, BIND_SESSION_PATH, &request).await?;
        let info = read_session_header(&mut stream).await?;

        {
            let mut state = self.lock();
            if state.epoch != epoch {
                return Err(StreamError::NoSession);
            }
            let session = state.session.as_mut().ok_or(StreamError::NoSession)?;
            session.info.extend(info);
            session.control_url = control_link(
                &self.base_url,
                session.info.get(CONTROL_ADDRESS_KEY).map(String::as_str),
            )?;
            session.bound = true;
        }

        self.set_state(SessionState::Connected);
        info!("Bound to <{}>", control_url);
        Ok(stream)
    }

    /// Drop session, subscriptions and subscriber entries of `epoch`
    pub(crate) fn clear_session(&self, epoch: u64, termination: StreamTermination) {
        {
            let mut state = self.lock();
            if state.epoch != epoch {
                debug!("Stale reader (epoch {}) finished, current session untouched", epoch);
                return;
            }
            debug!("Clearing internal session data for <{}>", self.base_url);
            state.session = None;
            state.table.clear();
            state.subscribers.clear();
        }

        self.status.send_modify(|status| {
            status.state = SessionState::Disconnected;
            status.termination = Some(termination);
        });
    }
}

/// Read `OK` plus the `key:value` header of a fresh push connection
async fn read_session_header(stream: &mut PushStream) -> Result<HashMap<String, String>> {
    let first = stream.read_line().await?.unwrap_or_default();
    debug!("Stream line is <{}>", first);

    if first != OK_CMD {
        let mut diagnostic = vec![first.clone()];
        diagnostic.extend(stream.read_remaining().await);
        error!("Server response error:\n{}", diagnostic.join("\n"));
        return Err(StreamError::Session { message: first, diagnostic });
    }

    let mut info = HashMap::new();
    while let Some(line) = stream.read_line().await? {
        if line.is_empty() {
            break;
        }
        match parse_session_info(&line) {
            Some((key, value)) => {
                info.insert(key.to_string(), value.to_string());
            }
            None => warn!("Skipping session info line without key: <{}>", line),
        }
    }
    Ok(info)
}

struct ReaderTask {
    handle: JoinHandle<StreamTermination>,
    epoch: u64,
}

/// Session manager for one Lightstreamer server
///
/// Owns the session, the subscription table and the stream reader task.
pub struct StreamerClient {
    shared: Arc<Shared>,
    reader: tokio::sync::Mutex<Option<ReaderTask>>,
}

impl StreamerClient {
    /// Client over the default HTTP transport
    pub fn new(base_url: &str, adapter_set: &str) -> Result<Self> {
        Self::with_transport(base_url, adapter_set, Arc::new(HttpTransport::new()?))
    }

    /// Client over a caller-provided transport (proxies, tests)
    pub fn with_transport(
        base_url: &str,
        adapter_set: &str,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let base_url = Url::parse(base_url)?;
        let (status, _) = watch::channel(SessionStatus::default());

        Ok(Self {
            shared: Arc::new(Shared {
                transport,
                base_url,
                adapter_set: adapter_set.to_string(),
                state: Mutex::new(EngineState::default()),
                status,
            }),
            reader: tokio::sync::Mutex::new(None),
        })
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub fn base_url(&self) -> &Url {
        &self.shared.base_url
    }

    /// A session id is held
    pub fn is_connected(&self) -> bool {
        self.shared.lock().session.is_some()
    }

    pub fn session(&self) -> Option<Session> {
        self.shared.lock().session.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status.borrow().clone()
    }

    /// Receiver notified on every state change and stream termination
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status.subscribe()
    }

    /// Handles currently in the subscription table
    pub fn subscription_handles(&self) -> Vec<u64> {
        self.shared.lock().table.handles()
    }

    /// Create a session and start the stream reader
    ///
    /// Fails with `Session` if the server does not answer OK; nothing is
    /// retried.
    pub async fn connect(&self, user: &str, password: &str) -> Result<()> {
        let mut reader = self.reader.lock().await;

        if self.is_connected() {
            debug!("Streamer connected before.");
            return Ok(());
        }
        if let Some(previous) = reader.take() {
            // Finished reader of a terminated session
            let _ = previous.handle.await;
        }

        info!("Opening a new session to <{}>", self.shared.base_url);
        debug!("User <{}>, password <{}>", user, mask_secret(password));
        self.shared.set_state(SessionState::Connecting);

        let request = ControlRequest::create_session(&self.shared.adapter_set, user, password);
        let (session, stream) = match self.open_session(&request).await {
            Ok(opened) => opened,
            Err(e) => {
                self.shared.set_state(SessionState::Disconnected);
                return Err(e);
            }
        };

        let epoch = {
            let mut state = self.shared.lock();
            state.epoch += 1;
            state.session = Some(session);
            state.table.clear();
            state.subscribers.clear();
            state.epoch
        };

        self.shared.status.send_modify(|status| {
            status.state = SessionState::Connected;
            status.termination = None;
        });
        info!("Successfully connected to <{}>", self.shared.base_url);

        let handle = tokio::spawn(reader::run(self.shared.clone(), stream, epoch));
        *reader = Some(ReaderTask { handle, epoch });
        debug!("Started handling of real-time stream");

        Ok(())
    }

    async fn open_session(&self, request: &ControlRequest) -> Result<(Session, PushStream)> {
        let mut stream = self
            .shared
            .transport
            .open_stream(&self.shared.base_url, CREATE_SESSION_PATH, request)
            .await?;
        let info = read_session_header(&mut stream).await?;
        let session = Session::from_info(&self.shared.base_url, info)?;
        Ok((session, stream))
    }

    /// Destroy the session and wait for the reader to finish
    ///
    /// Without a session this only logs a warning.
    pub async fn disconnect(&self) -> Result<()> {
        let mut reader = self.reader.lock().await;

        let Some(task) = reader.take() else {
            warn!("No connection to Lightstreamer");
            return Ok(());
        };

        if self.is_connected() {
            info!("Closing session to <{}>", self.shared.base_url);
            match self.issue_control(ControlRequest::destroy_session()).await {
                Ok(response) if response == OK_CMD => {}
                Ok(response) => {
                    warn!("Destroy answered <{}>, aborting stream reader", response);
                    task.handle.abort();
                }
                Err(e) => {
                    warn!("Destroy failed: {}, aborting stream reader", e);
                    task.handle.abort();
                }
            }
        }

        debug!("Waiting for stream reader to terminate");
        match task.handle.await {
            Ok(termination) => debug!("Stream reader terminated: {:?}", termination),
            Err(e) if e.is_cancelled() => {
                self.shared.clear_session(task.epoch, StreamTermination::Aborted);
            }
            Err(e) => {
                error!("Stream reader panicked: {}", e);
                self.shared.clear_session(task.epoch, StreamTermination::Aborted);
            }
        }

        info!("Closed session to <{}>", self.shared.base_url);
        Ok(())
    }

    /// Send a control request on the current session; returns the response
    /// line verbatim
    pub async fn issue_control(&self, request: ControlRequest) -> Result<String> {
        self.control_in(None, request).await
    }

    /// Control request bound to the session created at `epoch`, or to the
    /// current one when `None`
    async fn control_in(&self, epoch: Option<u64>, request: ControlRequest) -> Result<String> {
        let (session_id, control_url) = {
            let state = self.shared.lock();
            if epoch.is_some_and(|epoch| epoch != state.epoch) {
                return Err(StreamError::NoSession);
            }
            let session = state.session.as_ref().ok_or(StreamError::NoSession)?;
            (session.session_id.clone(), session.control_url.clone())
        };

        let request = request.with_session(&session_id);
        let response = self.shared.transport.control(&control_url, CONTROL_PATH, &request).await?;
        debug!("Server response: <{}>", response);
        Ok(response)
    }

    /// Register a subscription and request it from the server
    ///
    /// A rejected add leaves nothing registered. If the session ends while
    /// the add is in flight the call fails with `NoSession` and whatever
    /// session replaced it is left untouched.
    pub async fn subscribe(&self, subscription: Subscription) -> Result<u64> {
        self.subscribe_in_session(subscription).await.map(|(handle, _)| handle)
    }

    /// [`subscribe`](Self::subscribe), also returning the epoch of the
    /// session holding the handle
    pub(crate) async fn subscribe_in_session(
        &self,
        subscription: Subscription,
    ) -> Result<(u64, u64)> {
        let request_parts = (
            subscription.adapter.clone(),
            subscription.mode,
            subscription.fields.clone(),
            subscription.items.clone(),
        );

        let (handle, epoch) = {
            let mut state = self.shared.lock();
            if state.session.is_none() {
                return Err(StreamError::NoSession);
            }
            (state.table.register(subscription), state.epoch)
        };

        debug!("Making a new subscription request");
        let (adapter, mode, fields, items) = request_parts;
        let request = ControlRequest::add_subscription(handle, &adapter, mode, &fields, &items);
        let outcome = self.control_in(Some(epoch), request).await;

        let mut state = self.shared.lock();
        if state.epoch != epoch || state.session.is_none() {
            // Table was cleared; the handle number may belong to a newer session
            warn!("Session ended while subscribing table {}", handle);
            return Err(StreamError::NoSession);
        }

        match outcome {
            Ok(response) if response == OK_CMD => {
                info!("Successfully subscribed table {} ({})", handle, items.join(" "));
                Ok((handle, epoch))
            }
            Ok(response) => {
                warn!("Subscription error for table {}: <{}>", handle, response);
                state.table.unregister(handle);
                Err(StreamError::ControlRejected { op: "add".to_string(), response })
            }
            Err(e) => {
                state.table.unregister(handle);
                Err(e)
            }
        }
    }

    /// Drop a subscription locally and ask the server to delete it
    ///
    /// Unknown handles are a logged no-op. Updates already in flight for the
    /// handle are dropped by the reader.
    pub async fn unsubscribe(&self, handle: u64) -> Result<()> {
        debug!("Making an unsubscription request");
        if self.shared.lock().table.unregister(handle).is_none() {
            warn!("No subscription key {} found!", handle);
            return Ok(());
        }

        let response = self.issue_control(ControlRequest::delete_subscription(handle)).await?;
        if response == OK_CMD {
            info!("Successfully unsubscribed table {}", handle);
            Ok(())
        } else {
            warn!("Unsubscription error for table {}: <{}>", handle, response);
            Err(StreamError::ControlRejected { op: "delete".to_string(), response })
        }
    }
}
