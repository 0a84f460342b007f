//! The relay contract and implementations.
//!
//! A relay is a store-and-forward pubsub server. The transport only needs
//! three operations: publish an event, subscribe to a filter (stored
//! events replayed first, then live), and query stored events
//! newest-first for backlog pagination.
//!
//! [`MemoryRelay`] is the in-process implementation used by tests and
//! colocated deployments. [`RelaySet`] treats several relays as redundant
//! paths to the same peer: publish goes to all (success = any accepted),
//! queries merge, subscriptions fan in.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::error::RelayError;
use crate::event::{KIND_CURSOR, RelayEvent, unix_now};

/// Event selection for subscriptions and queries.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub authors: Option<Vec<String>>,
    pub kinds: Option<Vec<u32>>,
    /// Matches the `p` tag (recipient pubkey).
    pub recipient: Option<String>,
    /// Matches the `r` tag (stream id).
    pub stream: Option<String>,
    /// Inclusive lower bound on `created_at`.
    pub since: Option<u64>,
    /// Inclusive upper bound on `created_at`.
    pub until: Option<u64>,
    pub limit: Option<usize>,
}

impl Filter {
    pub fn matches(&self, event: &RelayEvent) -> bool {
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == &event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(recipient) = &self.recipient {
            if event.tag_value("p") != Some(recipient.as_str()) {
                return false;
            }
        }
        if let Some(stream) = &self.stream {
            if event.tag_value("r") != Some(stream.as_str()) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        true
    }
}

/// One item on a subscription.
#[derive(Debug, Clone)]
pub enum SubMessage {
    Event(RelayEvent),
    /// All stored events matching the filter have been replayed.
    EndOfStored,
    /// The relay dropped the subscription; resubscribe after a pause.
    Closed,
}

/// A live subscription handle.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::UnboundedReceiver<SubMessage>,
}

#[async_trait]
pub trait Relay: Send + Sync {
    fn url(&self) -> &str;

    /// Store the event and fan it out to live subscriptions. Rejects
    /// events that fail signature verification.
    async fn publish(&self, event: &RelayEvent) -> Result<(), RelayError>;

    /// Replay stored events matching `filter` (oldest first), send
    /// [`SubMessage::EndOfStored`], then stream live matches.
    async fn subscribe(&self, filter: Filter) -> Result<Subscription, RelayError>;

    async fn unsubscribe(&self, id: u64);

    /// Stored events matching `filter`, newest first (backlog pagination).
    async fn query(&self, filter: Filter) -> Result<Vec<RelayEvent>, RelayError>;
}

struct MemoryInner {
    events: Vec<RelayEvent>,
    subs: HashMap<u64, (Filter, mpsc::UnboundedSender<SubMessage>)>,
}

/// In-process relay with replaceable-event semantics and expiration.
pub struct MemoryRelay {
    url: String,
    inner: Mutex<MemoryInner>,
    next_sub: AtomicU64,
}

impl MemoryRelay {
    pub fn new(url: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            url: url.into(),
            inner: Mutex::new(MemoryInner {
                events: Vec::new(),
                subs: HashMap::new(),
            }),
            next_sub: AtomicU64::new(1),
        })
    }

    /// Every stored event (observation point for tests).
    pub async fn events(&self) -> Vec<RelayEvent> {
        self.inner.lock().await.events.clone()
    }

    pub async fn event_count(&self) -> usize {
        self.inner.lock().await.events.len()
    }

    /// Drop stored events older than `created_at` (relay retention).
    pub async fn evict_older_than(&self, created_at: u64) {
        self.inner
            .lock()
            .await
            .events
            .retain(|e| e.created_at >= created_at);
    }

    /// Drop one stored event by id (relay retention).
    pub async fn evict(&self, id: &str) {
        self.inner.lock().await.events.retain(|e| e.id != id);
    }

    /// Close every live subscription, as a relay restart would.
    pub async fn close_subscriptions(&self) {
        let mut inner = self.inner.lock().await;
        for (_, (_, tx)) in inner.subs.drain() {
            let _ = tx.send(SubMessage::Closed);
        }
    }

    fn sweep_expired(inner: &mut MemoryInner) {
        let now = unix_now();
        inner
            .events
            .retain(|e| e.expiration().map(|exp| exp >= now).unwrap_or(true));
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    fn url(&self) -> &str {
        &self.url
    }

    async fn publish(&self, event: &RelayEvent) -> Result<(), RelayError> {
        event.verify()?;
        let mut inner = self.inner.lock().await;
        Self::sweep_expired(&mut inner);
        if event.kind == KIND_CURSOR {
            // Replaceable per (author, recipient): the new request overrides.
            let recipient = event.tag_value("p").map(str::to_string);
            inner.events.retain(|e| {
                !(e.kind == KIND_CURSOR
                    && e.pubkey == event.pubkey
                    && e.tag_value("p").map(str::to_string) == recipient)
            });
        }
        inner.events.push(event.clone());
        inner.subs.retain(|_, (filter, tx)| {
            if !filter.matches(event) {
                return true;
            }
            tx.send(SubMessage::Event(event.clone())).is_ok()
        });
        Ok(())
    }

    async fn subscribe(&self, filter: Filter) -> Result<Subscription, RelayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_sub.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().await;
        Self::sweep_expired(&mut inner);
        let mut stored: Vec<&RelayEvent> =
            inner.events.iter().filter(|e| filter.matches(e)).collect();
        stored.sort_by_key(|e| e.created_at);
        for event in stored {
            let _ = tx.send(SubMessage::Event(event.clone()));
        }
        let _ = tx.send(SubMessage::EndOfStored);
        inner.subs.insert(id, (filter, tx));
        Ok(Subscription { id, rx })
    }

    async fn unsubscribe(&self, id: u64) {
        self.inner.lock().await.subs.remove(&id);
    }

    async fn query(&self, filter: Filter) -> Result<Vec<RelayEvent>, RelayError> {
        let mut inner = self.inner.lock().await;
        Self::sweep_expired(&mut inner);
        let mut matched: Vec<RelayEvent> = inner
            .events
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }
}

/// A merged subscription over every relay in a set.
pub struct MergedSubscription {
    pub rx: mpsc::UnboundedReceiver<SubMessage>,
    subs: Vec<(Arc<dyn Relay>, u64)>,
    tasks: Vec<JoinHandle<()>>,
}

impl MergedSubscription {
    pub async fn close(mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        for (relay, id) in self.subs.drain(..) {
            relay.unsubscribe(id).await;
        }
    }
}

/// Redundant paths to one peer: publish to all, merge reads.
pub struct RelaySet {
    relays: Vec<Arc<dyn Relay>>,
    publish_timeout: Duration,
}

impl RelaySet {
    pub fn new(relays: Vec<Arc<dyn Relay>>) -> Self {
        Self {
            relays,
            publish_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Publish to every relay in parallel; success means at least one
    /// relay accepted within the per-relay timeout.
    pub async fn publish_all(&self, event: &RelayEvent) -> Result<(), RelayError> {
        let attempts = self.relays.iter().map(|relay| {
            let relay = relay.clone();
            let event = event.clone();
            let timeout = self.publish_timeout;
            async move {
                match tokio::time::timeout(timeout, relay.publish(&event)).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        tracing::warn!(relay = relay.url(), "publish failed: {e}");
                        false
                    }
                    Err(_) => {
                        tracing::warn!(relay = relay.url(), "publish timed out");
                        false
                    }
                }
            }
        });
        let results = futures::future::join_all(attempts).await;
        if results.iter().any(|ok| *ok) {
            Ok(())
        } else {
            Err(RelayError::Relay("publish failed on every relay".into()))
        }
    }

    /// Query every relay, dedupe by event id, newest first.
    pub async fn query_merged(&self, filter: Filter) -> Result<Vec<RelayEvent>, RelayError> {
        let queries = self.relays.iter().map(|relay| {
            let relay = relay.clone();
            let filter = filter.clone();
            async move {
                match relay.query(filter).await {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::warn!(relay = relay.url(), "query failed: {e}");
                        Vec::new()
                    }
                }
            }
        });
        let pages = futures::future::join_all(queries).await;
        let mut seen = HashSet::new();
        let mut merged: Vec<RelayEvent> = pages
            .into_iter()
            .flatten()
            .filter(|e| seen.insert(e.id.clone()))
            .collect();
        merged.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            merged.truncate(limit);
        }
        Ok(merged)
    }

    /// Subscribe on every relay and fan the items into one channel.
    /// `EndOfStored` is forwarded once, after every relay reported it; a
    /// `Closed` from any relay closes the merged stream.
    pub async fn subscribe_merged(&self, filter: Filter) -> Result<MergedSubscription, RelayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subs = Vec::new();
        let mut tasks = Vec::new();
        let total = self.relays.len();
        let eose_seen = Arc::new(AtomicU64::new(0));
        for relay in &self.relays {
            match relay.subscribe(filter.clone()).await {
                Ok(sub) => {
                    subs.push((relay.clone(), sub.id));
                    let tx = tx.clone();
                    let eose_seen = eose_seen.clone();
                    let mut sub_rx = sub.rx;
                    tasks.push(tokio::spawn(async move {
                        while let Some(msg) = sub_rx.recv().await {
                            match msg {
                                SubMessage::Event(_) => {
                                    if tx.send(msg).is_err() {
                                        return;
                                    }
                                }
                                SubMessage::EndOfStored => {
                                    let seen = eose_seen.fetch_add(1, Ordering::Relaxed) + 1;
                                    if seen as usize == total
                                        && tx.send(SubMessage::EndOfStored).is_err()
                                    {
                                        return;
                                    }
                                }
                                SubMessage::Closed => {
                                    let _ = tx.send(SubMessage::Closed);
                                    return;
                                }
                            }
                        }
                        let _ = tx.send(SubMessage::Closed);
                    }));
                }
                Err(e) => tracing::warn!(relay = relay.url(), "subscribe failed: {e}"),
            }
        }
        if subs.is_empty() {
            return Err(RelayError::Relay("subscribe failed on every relay".into()));
        }
        Ok(MergedSubscription { rx, subs, tasks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{KIND_CHANGES, new_stream_id};
    use k256::ecdsa::SigningKey;
    use rand::rngs::OsRng;

    fn signed(key: &SigningKey, kind: u32, tags: Vec<Vec<String>>, at: u64) -> RelayEvent {
        RelayEvent::sign(kind, tags, "x".into(), at, key).unwrap()
    }

    #[tokio::test]
    async fn stored_then_live_with_eose_marker() {
        let relay = MemoryRelay::new("mem://a");
        let key = SigningKey::random(&mut OsRng);
        let stream = new_stream_id();
        let tags = vec![vec!["r".into(), stream.clone()]];
        relay.publish(&signed(&key, KIND_CHANGES, tags.clone(), 10)).await.unwrap();

        let mut sub = relay
            .subscribe(Filter {
                kinds: Some(vec![KIND_CHANGES]),
                stream: Some(stream.clone()),
                ..Filter::default()
            })
            .await
            .unwrap();

        assert!(matches!(sub.rx.recv().await, Some(SubMessage::Event(_))));
        assert!(matches!(sub.rx.recv().await, Some(SubMessage::EndOfStored)));

        relay.publish(&signed(&key, KIND_CHANGES, tags, 11)).await.unwrap();
        assert!(matches!(sub.rx.recv().await, Some(SubMessage::Event(_))));
    }

    #[tokio::test]
    async fn cursor_is_replaceable_per_recipient() {
        let relay = MemoryRelay::new("mem://a");
        let key = SigningKey::random(&mut OsRng);
        let to_b = vec![vec!["p".into(), "bb".into()]];
        let to_c = vec![vec!["p".into(), "cc".into()]];
        relay.publish(&signed(&key, KIND_CURSOR, to_b.clone(), 1)).await.unwrap();
        relay.publish(&signed(&key, KIND_CURSOR, to_c, 2)).await.unwrap();
        relay.publish(&signed(&key, KIND_CURSOR, to_b, 3)).await.unwrap();

        let events = relay.events().await;
        let to_b_count = events
            .iter()
            .filter(|e| e.kind == KIND_CURSOR && e.tag_value("p") == Some("bb"))
            .count();
        assert_eq!(to_b_count, 1, "older CURSOR to the same recipient must be replaced");
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn query_is_newest_first_with_until() {
        let relay = MemoryRelay::new("mem://a");
        let key = SigningKey::random(&mut OsRng);
        for at in [5, 1, 9, 3] {
            relay.publish(&signed(&key, KIND_CHANGES, vec![], at)).await.unwrap();
        }
        let page = relay
            .query(Filter {
                until: Some(5),
                limit: Some(2),
                ..Filter::default()
            })
            .await
            .unwrap();
        let stamps: Vec<u64> = page.iter().map(|e| e.created_at).collect();
        assert_eq!(stamps, vec![5, 3]);
    }

    #[tokio::test]
    async fn unsigned_event_rejected() {
        let relay = MemoryRelay::new("mem://a");
        let key = SigningKey::random(&mut OsRng);
        let mut ev = signed(&key, KIND_CHANGES, vec![], 1);
        ev.content = "tampered".into();
        assert!(relay.publish(&ev).await.is_err());
        assert_eq!(relay.event_count().await, 0);
    }

    #[tokio::test]
    async fn relay_set_merges_and_dedupes() {
        let a = MemoryRelay::new("mem://a");
        let b = MemoryRelay::new("mem://b");
        let set = RelaySet::new(vec![a.clone() as Arc<dyn Relay>, b.clone() as Arc<dyn Relay>]);
        let key = SigningKey::random(&mut OsRng);

        let shared = signed(&key, KIND_CHANGES, vec![], 1);
        set.publish_all(&shared).await.unwrap();
        // one relay has an extra event
        a.publish(&signed(&key, KIND_CHANGES, vec![], 2)).await.unwrap();

        assert_eq!(a.event_count().await, 2);
        assert_eq!(b.event_count().await, 1);

        let merged = set.query_merged(Filter::default()).await.unwrap();
        assert_eq!(merged.len(), 2);
    }
}
