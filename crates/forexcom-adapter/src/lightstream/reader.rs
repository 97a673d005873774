//! Stream reader: the background loop of a push connection
//!
//! Reads one line at a time and classifies it. Data lines are decoded
//! against the subscription table and handed to listeners on this task,
//! in arrival order. A slow listener therefore delays every subscription
//! sharing the connection.
//!
//! | Line          | Action                                   |
//! |---------------|------------------------------------------|
//! | blank / EOF   | stop                                     |
//! | `PROBE`       | keep-alive                               |
//! | `ERROR ...`   | stop, fatal                              |
//! | `LOOP ...`    | rebind the same session, keep reading    |
//! | `SYNC ERROR`  | stop, session must be recreated          |
//! | `END ...`     | stop, closed by the server               |
//! | `Preamble...` | ignored                                  |
//! | other         | `<table>,<item line>` update             |

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::error::StreamError;
use crate::lightstream::protocol::StreamLine;
use crate::lightstream::session::{Shared, StreamTermination};
use crate::lightstream::transport::PushStream;

enum ReadOutcome {
    Rebind,
    Terminated(StreamTermination),
}

/// Run until the stream ends without a successful rebind.
///
/// Session and subscription state of `epoch` is cleared before returning.
pub(crate) async fn run(
    shared: Arc<Shared>,
    mut stream: PushStream,
    epoch: u64,
) -> StreamTermination {
    let termination = loop {
        match read_until_end(&shared, &mut stream).await {
            ReadOutcome::Rebind => {
                debug!("Binding to this active session");
                match shared.bind(epoch).await {
                    Ok(next) => stream = next,
                    Err(e) => {
                        error!("Rebind failed: {}", e);
                        break StreamTermination::BindFailed(e.to_string());
                    }
                }
            }
            ReadOutcome::Terminated(termination) => break termination,
        }
    };

    shared.clear_session(epoch, termination.clone());
    termination
}

async fn read_until_end(shared: &Shared, stream: &mut PushStream) -> ReadOutcome {
    loop {
        let line = match stream.read_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                warn!("No new message received, push connection closed");
                return ReadOutcome::Terminated(StreamTermination::Closed);
            }
            Err(e) => {
                error!("Communication error: {}", e);
                return ReadOutcome::Terminated(StreamTermination::ReadFailed(e.to_string()));
            }
        };
        debug!("Received message: <{}>", line);

        match StreamLine::parse(&line) {
            StreamLine::Blank => {
                warn!("No new message received");
                return ReadOutcome::Terminated(StreamTermination::Closed);
            }
            StreamLine::Probe => debug!("PROBE message"),
            StreamLine::Preamble => debug!("Preamble"),
            StreamLine::Ok => debug!("Ignoring stray OK"),
            StreamLine::Error(reason) => {
                error!("ERROR {}", reason);
                return ReadOutcome::Terminated(StreamTermination::ServerError(reason.to_string()));
            }
            StreamLine::Loop => {
                debug!("LOOP");
                return ReadOutcome::Rebind;
            }
            StreamLine::SyncError => {
                error!("SYNC ERROR");
                return ReadOutcome::Terminated(StreamTermination::SyncError);
            }
            StreamLine::End(cause) => {
                info!("Connection closed by the server (cause: {:?})", cause);
                return ReadOutcome::Terminated(StreamTermination::ServerEnd(cause.to_string()));
            }
            StreamLine::Data(data) => forward_update(shared, data.table, data.item_line),
            StreamLine::Malformed(raw) => warn!("Skipping unrecognized line <{}>", raw),
        }
    }
}

/// Decode under the engine lock, dispatch after releasing it
fn forward_update(shared: &Shared, table: u64, item_line: &str) {
    let delivery = shared.lock().table.apply_update(table, item_line);

    match delivery {
        Ok(delivery) => delivery.dispatch(),
        Err(StreamError::UnknownSubscription(handle)) => {
            warn!("No subscription found for table {}, update dropped", handle);
        }
        Err(e) => warn!("Dropping update for table {}: {}", table, e),
    }
}
