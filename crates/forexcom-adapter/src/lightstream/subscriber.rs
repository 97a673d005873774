//! Subscriber multiplexer: many listeners, one network subscription
//!
//! A logical name (a symbol, or a channel such as `ORDERS`) maps to exactly
//! one table handle. Listeners register under the name and are identified
//! by `<name>#<ordinal>`. The add request goes out with the first listener,
//! the delete request with the last.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::error::{Result, StreamError};
use crate::lightstream::session::StreamerClient;
use crate::lightstream::table::{Subscription, UpdateEvent, UpdateListener};

type ListenerSet = Arc<Mutex<BTreeMap<u64, UpdateListener>>>;

fn lock_set(set: &ListenerSet) -> MutexGuard<'_, BTreeMap<u64, UpdateListener>> {
    set.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Opaque listener identifier, rendered `<name>#<ordinal>`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ListenerIndex {
    name: String,
    ordinal: u64,
}

impl ListenerIndex {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ordinal(&self) -> u64 {
        self.ordinal
    }
}

impl fmt::Display for ListenerIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.ordinal)
    }
}

impl FromStr for ListenerIndex {
    type Err = StreamError;

    /// Names may contain `#`; the ordinal is after the last one
    fn from_str(s: &str) -> Result<Self> {
        let (name, ordinal) =
            s.rsplit_once('#').ok_or_else(|| StreamError::InvalidListenerIndex(s.to_string()))?;
        let ordinal =
            ordinal.parse().map_err(|_| StreamError::InvalidListenerIndex(s.to_string()))?;
        if name.is_empty() {
            return Err(StreamError::InvalidListenerIndex(s.to_string()));
        }
        Ok(Self { name: name.to_string(), ordinal })
    }
}

/// Listeners sharing one subscription handle
pub(crate) struct SubscriberEntry {
    handle: u64,
    listeners: ListenerSet,
    last_ordinal: u64,
}

impl SubscriberEntry {
    fn add(&mut self, name: &str, listener: UpdateListener) -> ListenerIndex {
        self.last_ordinal += 1;
        lock_set(&self.listeners).insert(self.last_ordinal, listener);
        ListenerIndex { name: name.to_string(), ordinal: self.last_ordinal }
    }
}

/// Fan-out layer over [`StreamerClient`] subscriptions
pub struct SubscriberMultiplexer {
    client: Arc<StreamerClient>,
    /// Serializes entry creation/removal across the control round trip
    ops: tokio::sync::Mutex<()>,
}

impl SubscriberMultiplexer {
    pub fn new(client: Arc<StreamerClient>) -> Self {
        Self { client, ops: tokio::sync::Mutex::new(()) }
    }

    pub fn client(&self) -> &Arc<StreamerClient> {
        &self.client
    }

    /// Add `listener` under `name`, subscribing on first use
    ///
    /// `subscription` is only sent when `name` has no entry yet.
    pub async fn subscribe(
        &self,
        name: &str,
        subscription: Subscription,
        listener: UpdateListener,
    ) -> Result<ListenerIndex> {
        let _ops = self.ops.lock().await;

        {
            let mut state = self.client.shared().lock();
            if let Some(entry) = state.subscribers.get_mut(name) {
                debug!("Subscribed before {}", name);
                return Ok(entry.add(name, listener));
            }
        }

        let listeners: ListenerSet = Arc::new(Mutex::new(BTreeMap::new()));
        let fan_out = {
            let listeners = listeners.clone();
            Arc::new(move |event: &UpdateEvent| {
                let current: Vec<UpdateListener> = lock_set(&listeners).values().cloned().collect();
                for listener in current {
                    listener(event);
                }
            })
        };

        let (handle, epoch) =
            self.client.subscribe_in_session(subscription.with_listener(fan_out)).await?;

        let mut state = self.client.shared().lock();
        if state.epoch != epoch || !state.table.contains(handle) {
            // Stream terminated after the add was accepted
            return Err(StreamError::NoSession);
        }
        let entry = state
            .subscribers
            .entry(name.to_string())
            .or_insert(SubscriberEntry { handle, listeners, last_ordinal: 0 });
        debug!("Subscribed from {} (table {})", name, handle);
        Ok(entry.add(name, listener))
    }

    /// Remove one listener; the last one takes the subscription with it
    pub async fn remove_listener(&self, index: &ListenerIndex) -> Result<()> {
        let _ops = self.ops.lock().await;

        let emptied = {
            let mut state = self.client.shared().lock();
            let Some(entry) = state.subscribers.get(index.name()) else {
                warn!("No subscriber {} for listener {}", index.name(), index);
                return Ok(());
            };

            let mut listeners = lock_set(&entry.listeners);
            if listeners.remove(&index.ordinal()).is_none() {
                warn!("Listener {} not found", index);
            }
            let empty = listeners.is_empty();
            let handle = entry.handle;
            drop(listeners);

            if empty {
                state.subscribers.remove(index.name());
                Some(handle)
            } else {
                None
            }
        };

        debug!("Unsubscribed listener {}", index);
        match emptied {
            Some(handle) => self.client.unsubscribe(handle).await,
            None => Ok(()),
        }
    }

    /// Remove `name` and its subscription regardless of remaining listeners
    pub async fn remove_all(&self, name: &str) -> Result<()> {
        let _ops = self.ops.lock().await;

        let removed = self.client.shared().lock().subscribers.remove(name);
        match removed {
            Some(entry) => {
                debug!("Unsubscribed from {}", name);
                self.client.unsubscribe(entry.handle).await
            }
            None => {
                warn!("No subscriber {} found", name);
                Ok(())
            }
        }
    }

    /// Remove every entry; failures are logged and the first one returned
    pub async fn remove_everything(&self) -> Result<()> {
        let mut first_error = None;
        for name in self.names() {
            if let Err(e) = self.remove_all(&name).await {
                warn!("Failed to unsubscribe {}: {}", name, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.client.shared().lock().subscribers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.client.shared().lock().subscribers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Table handle backing `name`
    pub fn handle(&self, name: &str) -> Option<u64> {
        self.client.shared().lock().subscribers.get(name).map(|entry| entry.handle)
    }

    pub fn listener_count(&self, name: &str) -> usize {
        self.client
            .shared()
            .lock()
            .subscribers
            .get(name)
            .map_or(0, |entry| lock_set(&entry.listeners).len())
    }
}
