//! Subscription table: handle allocation, field schemas and delta state
//!
//! Every subscription is keyed by a locally assigned table handle. The
//! server echoes that handle on each data line, which is how a line is
//! matched with its field schema and with the per-item cache needed to
//! resolve delta-encoded fields.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, StreamError};
use crate::lightstream::decode::{decode, FieldValue};
use crate::lightstream::protocol::{ItemLine, SubscriptionMode};

/// Callback receiving decoded updates. Runs on the stream reader task.
pub type UpdateListener = Arc<dyn Fn(&UpdateEvent) + Send + Sync>;

/// A subscription as requested from the server
#[derive(Clone)]
pub struct Subscription {
    pub mode: SubscriptionMode,
    pub items: Vec<String>,
    pub fields: Vec<String>,
    pub adapter: String,
    listeners: Vec<UpdateListener>,
}

impl Subscription {
    pub fn new(
        mode: SubscriptionMode,
        items: Vec<String>,
        fields: Vec<String>,
        adapter: impl Into<String>,
    ) -> Self {
        Self { mode, items, fields, adapter: adapter.into(), listeners: Vec::new() }
    }

    pub fn add_listener(&mut self, listener: UpdateListener) {
        self.listeners.push(listener);
    }

    pub fn with_listener(mut self, listener: UpdateListener) -> Self {
        self.add_listener(listener);
        self
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("mode", &self.mode)
            .field("items", &self.items)
            .field("fields", &self.fields)
            .field("adapter", &self.adapter)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Decoded update for one item of one subscription
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateEvent {
    pub handle: u64,
    /// 1-based position of the item in the subscription's item list
    pub position: usize,
    pub item_name: String,
    pub fields: HashMap<String, FieldValue>,
}

impl UpdateEvent {
    /// Field value, `None` when null or absent
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(|v| v.as_deref())
    }
}

/// An update plus the listeners it is owed to
///
/// Built while the table is locked, dispatched after the lock is released.
pub struct Delivery {
    pub event: UpdateEvent,
    listeners: Vec<UpdateListener>,
}

impl Delivery {
    /// Invoke every listener in registration order
    pub fn dispatch(&self) {
        for listener in &self.listeners {
            listener(&self.event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

struct Entry {
    subscription: Subscription,
    /// item position -> field name -> last decoded value
    cache: HashMap<usize, HashMap<String, FieldValue>>,
}

/// Active subscriptions of one session
#[derive(Default)]
pub struct SubscriptionTable {
    last_handle: u64,
    entries: HashMap<u64, Entry>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a subscription under the next handle
    pub fn register(&mut self, subscription: Subscription) -> u64 {
        self.last_handle += 1;
        let handle = self.last_handle;
        debug!("Registered table {} ({:?})", handle, subscription.items);
        self.entries.insert(handle, Entry { subscription, cache: HashMap::new() });
        handle
    }

    /// Drop a subscription and its cache
    pub fn unregister(&mut self, handle: u64) -> Option<Subscription> {
        self.entries.remove(&handle).map(|entry| entry.subscription)
    }

    pub fn add_listener(&mut self, handle: u64, listener: UpdateListener) -> Result<()> {
        let entry = self.entries.get_mut(&handle).ok_or(StreamError::UnknownSubscription(handle))?;
        entry.subscription.add_listener(listener);
        Ok(())
    }

    pub fn get(&self, handle: u64) -> Option<&Subscription> {
        self.entries.get(&handle).map(|entry| &entry.subscription)
    }

    pub fn contains(&self, handle: u64) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn handles(&self) -> Vec<u64> {
        let mut handles: Vec<u64> = self.entries.keys().copied().collect();
        handles.sort_unstable();
        handles
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every subscription; handle numbering restarts with the next session
    pub fn clear(&mut self) {
        self.entries.clear();
        self.last_handle = 0;
    }

    /// Decode one item line for `handle`, updating the item's cached values
    pub fn apply_update(&mut self, handle: u64, item_line: &str) -> Result<Delivery> {
        let entry = self.entries.get_mut(&handle).ok_or(StreamError::UnknownSubscription(handle))?;
        let item = ItemLine::parse(item_line)?;

        let item_name = entry
            .subscription
            .items
            .get(item.position - 1)
            .cloned()
            .ok_or_else(|| StreamError::Malformed(format!("item position {}", item.position)))?;

        let cached = entry.cache.entry(item.position).or_default();
        for (index, field) in entry.subscription.fields.iter().enumerate() {
            let value = decode(item.token(index), cached.get(field));
            cached.insert(field.clone(), value);
        }

        Ok(Delivery {
            event: UpdateEvent {
                handle,
                position: item.position,
                item_name,
                fields: cached.clone(),
            },
            listeners: entry.subscription.listeners.clone(),
        })
    }
}

impl fmt::Debug for SubscriptionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionTable")
            .field("last_handle", &self.last_handle)
            .field("handles", &self.handles())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn price_subscription() -> Subscription {
        Subscription::new(
            SubscriptionMode::Merge,
            strings(&["PRICE.400"]),
            strings(&["Bid", "Offer"]),
            "PRICES",
        )
    }

    #[test]
    fn test_handles_are_sequential() {
        let mut table = SubscriptionTable::new();
        let a = table.register(price_subscription());
        let b = table.register(price_subscription());
        assert_eq!((a, b), (1, 2));

        table.unregister(a);
        let c = table.register(price_subscription());
        assert_eq!(c, 3);
        assert_eq!(table.handles(), vec![2, 3]);
    }

    #[test]
    fn test_first_update_extra_tokens_ignored() {
        let mut table = SubscriptionTable::new();
        let handle = table.register(price_subscription());

        let delivery = table.apply_update(handle, "1|100|0.5|1.2").unwrap();
        assert_eq!(delivery.event.position, 1);
        assert_eq!(delivery.event.item_name, "PRICE.400");
        assert_eq!(delivery.event.get("Bid"), Some("100"));
        assert_eq!(delivery.event.get("Offer"), Some("0.5"));
        assert_eq!(delivery.event.fields.len(), 2);
    }

    #[test]
    fn test_short_line_resolves_to_previous() {
        let mut table = SubscriptionTable::new();
        let handle = table.register(price_subscription());

        let first = table.apply_update(handle, "1|100").unwrap();
        assert_eq!(first.event.get("Bid"), Some("100"));
        assert_eq!(first.event.fields.get("Offer"), Some(&None));

        table.apply_update(handle, "1|101|0.7").unwrap();
        let third = table.apply_update(handle, "1|102").unwrap();
        assert_eq!(third.event.get("Bid"), Some("102"));
        assert_eq!(third.event.get("Offer"), Some("0.7"));
    }

    #[test]
    fn test_empty_token_keeps_previous_value() {
        let mut table = SubscriptionTable::new();
        let handle = table.register(price_subscription());

        table.apply_update(handle, "1|100|0.5").unwrap();
        let delivery = table.apply_update(handle, "1||0.6").unwrap();
        assert_eq!(delivery.event.get("Bid"), Some("100"));
        assert_eq!(delivery.event.get("Offer"), Some("0.6"));
    }

    #[test]
    fn test_items_have_separate_caches() {
        let mut table = SubscriptionTable::new();
        let handle = table.register(Subscription::new(
            SubscriptionMode::Merge,
            strings(&["A", "B"]),
            strings(&["Bid"]),
            "PRICES",
        ));

        table.apply_update(handle, "1|10").unwrap();
        let b = table.apply_update(handle, "2|").unwrap();
        assert_eq!(b.event.item_name, "B");
        assert_eq!(b.event.get("Bid"), None);
    }

    #[test]
    fn test_listeners_called_in_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let first = calls.clone();
        let second = calls.clone();

        let mut table = SubscriptionTable::new();
        let handle = table.register(
            price_subscription()
                .with_listener(Arc::new(move |e: &UpdateEvent| {
                    first.lock().unwrap().push(format!("first:{}", e.position))
                }))
                .with_listener(Arc::new(move |e: &UpdateEvent| {
                    second.lock().unwrap().push(format!("second:{}", e.position))
                })),
        );

        table.apply_update(handle, "1|1|2").unwrap().dispatch();
        assert_eq!(*calls.lock().unwrap(), vec!["first:1", "second:1"]);
    }

    #[test]
    fn test_unregistered_handle_is_unknown() {
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();

        let mut table = SubscriptionTable::new();
        let handle = table.register(
            price_subscription()
                .with_listener(Arc::new(move |_: &UpdateEvent| *counter.lock().unwrap() += 1)),
        );
        table.unregister(handle);

        let result = table.apply_update(handle, "1|100|0.5");
        assert!(matches!(result, Err(StreamError::UnknownSubscription(h)) if h == handle));
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[test]
    fn test_bad_position_is_malformed() {
        let mut table = SubscriptionTable::new();
        let handle = table.register(price_subscription());
        assert!(matches!(table.apply_update(handle, "5|1"), Err(StreamError::Malformed(_))));
        assert!(matches!(table.apply_update(handle, "x|1"), Err(StreamError::Malformed(_))));
    }

    #[test]
    fn test_clear_restarts_numbering() {
        let mut table = SubscriptionTable::new();
        table.register(price_subscription());
        table.register(price_subscription());
        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.register(price_subscription()), 1);
    }
}
