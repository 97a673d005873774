//! Lightstreamer streaming engine
//!
//! HTTP streaming client for the Lightstreamer text protocol used by the
//! FOREX.com push server. One session per [`StreamerClient`], one
//! background reader task per push connection.
//!
//! # Components
//! - `decode`: delta decoding of field tokens
//! - `protocol`: control request bodies and pushed line classification
//! - `transport`: HTTP push/control exchanges
//! - `table`: subscription handles, field schemas, per-item caches
//! - `session`: session lifecycle (create, bind, destroy)
//! - `reader`: background read loop
//! - `subscriber`: listener multiplexing per logical name

pub mod decode;
pub mod protocol;
mod reader;
pub mod session;
pub mod subscriber;
pub mod table;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use protocol::{ControlRequest, SubscriptionMode};
pub use session::{Session, SessionState, SessionStatus, StreamTermination, StreamerClient};
pub use subscriber::{ListenerIndex, SubscriberMultiplexer};
pub use table::{Subscription, SubscriptionTable, UpdateEvent, UpdateListener};
pub use transport::{HttpTransport, PushStream, Transport};
