//! Subscription registry and push dispatcher.
//!
//! The registry maps [`SubscriptionKey`]s to live [`Subscription`] handles behind a single
//! read/write lock. Every handle owns a one-slot `watch` channel: pushes overwrite the slot
//! (latest wins), so a dispatcher never blocks on a slow stream and a stream that falls
//! behind only ever observes the newest secret.
//!
//! A handle is terminal once closed. Closing writes `Delivery::Closed` into the slot and
//! later pushes never overwrite it.

use crate::prelude::debug;
use crate::resource::SubscriptionKey;
use crate::secret::SecretItem;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// What a push carries.
#[derive(Debug, Clone)]
pub enum Push {
    /// A new secret for the key.
    Secret(Arc<SecretItem>),
    /// The subscription must end; the stream closes cleanly.
    Tombstone,
}

impl From<Option<Arc<SecretItem>>> for Push {
    fn from(secret: Option<Arc<SecretItem>>) -> Self {
        secret.map_or(Self::Tombstone, Self::Secret)
    }
}

impl From<Arc<SecretItem>> for Push {
    fn from(secret: Arc<SecretItem>) -> Self {
        Self::Secret(secret)
    }
}

/// Result of [`SubscriptionRegistry::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The push was stored in the subscription slot.
    Delivered,
    /// No subscription exists for the key; nothing happened.
    NoSubscription,
    /// The subscription is closing; the push was dropped.
    Closed,
}

/// Content of a subscription slot.
#[derive(Debug, Clone)]
pub(crate) enum Delivery {
    Idle,
    Secret(Arc<SecretItem>),
    Tombstone,
    Closed,
}

pub(crate) type DeliveryReceiver = watch::Receiver<Delivery>;

#[derive(Debug, Default)]
struct AckState {
    in_flight: Option<SentResponse>,
    last_sent_nonce: Option<String>,
    last_sent_version: Option<String>,
    acked_version: Option<String>,
    acked_nonce: Option<String>,
    suspended: bool,
}

#[derive(Debug)]
struct SentResponse {
    nonce: String,
    version: String,
}

/// Live state of one subscription.
pub struct Subscription {
    key: SubscriptionKey,
    slot: watch::Sender<Delivery>,
    last_active: Mutex<Instant>,
    ack: Mutex<AckState>,
    closed: AtomicBool,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("closed", &self.is_closed())
            .field("acked_version", &self.acked_version())
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub(crate) fn new(key: SubscriptionKey) -> (Arc<Self>, DeliveryReceiver) {
        let (slot, rx) = watch::channel(Delivery::Idle);
        let subscription = Arc::new(Self {
            key,
            slot,
            last_active: Mutex::new(Instant::now()),
            ack: Mutex::new(AckState::default()),
            closed: AtomicBool::new(false),
        });
        (subscription, rx)
    }

    /// Key of this subscription.
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Returns `true` once the subscription has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Last time a request or push touched the subscription.
    pub fn last_active(&self) -> Instant {
        *lock(&self.last_active)
    }

    /// Version the proxy last acknowledged.
    pub fn acked_version(&self) -> Option<String> {
        lock(&self.ack).acked_version.clone()
    }

    /// Nonce the proxy last acknowledged.
    pub fn acked_nonce(&self) -> Option<String> {
        lock(&self.ack).acked_nonce.clone()
    }

    pub(crate) fn touch(&self) {
        *lock(&self.last_active) = Instant::now();
    }

    fn idle_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active())
    }

    pub(crate) fn deliver(&self, push: Push) -> bool {
        if self.is_closed() {
            return false;
        }
        let next = match push {
            Push::Secret(item) => Delivery::Secret(item),
            Push::Tombstone => Delivery::Tombstone,
        };
        self.slot.send_if_modified(move |current| {
            if matches!(current, Delivery::Closed) {
                return false;
            }
            *current = next;
            true
        })
    }

    /// Closes the slot. Returns `false` if it was already closed.
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.slot.send_replace(Delivery::Closed);
        true
    }

    pub(crate) fn mark_sent(&self, nonce: &str, version: &str) {
        let mut ack = lock(&self.ack);
        ack.in_flight = Some(SentResponse {
            nonce: nonce.to_owned(),
            version: version.to_owned(),
        });
        ack.last_sent_nonce = Some(nonce.to_owned());
        ack.last_sent_version = Some(version.to_owned());
        ack.suspended = false;
    }

    /// Commits an ACK if `nonce` matches the response in flight.
    pub(crate) fn acknowledge(&self, nonce: &str, version: &str) -> bool {
        let mut ack = lock(&self.ack);
        if !ack.in_flight.as_ref().is_some_and(|sent| sent.nonce == nonce) {
            return false;
        }
        ack.in_flight = None;
        ack.acked_version = Some(version.to_owned());
        ack.acked_nonce = Some(nonce.to_owned());
        true
    }

    /// Treats a cache hit on the in-flight version as its ACK.
    pub(crate) fn acknowledge_version(&self, version: &str) -> bool {
        let nonce = {
            let ack = lock(&self.ack);
            match &ack.in_flight {
                Some(sent) if sent.version == version => sent.nonce.clone(),
                _ => return false,
            }
        };
        self.acknowledge(&nonce, version)
    }

    /// Records a NACK: the response in flight is settled and the key is suspended.
    pub(crate) fn reject(&self) {
        let mut ack = lock(&self.ack);
        ack.in_flight = None;
        ack.suspended = true;
    }

    pub(crate) fn is_in_flight(&self) -> bool {
        lock(&self.ack).in_flight.is_some()
    }

    pub(crate) fn is_suspended(&self) -> bool {
        lock(&self.ack).suspended
    }

    /// Returns `true` if `version` is in flight, acknowledged or was the last one sent.
    pub(crate) fn has_sent_version(&self, version: &str) -> bool {
        let ack = lock(&self.ack);
        ack.in_flight.as_ref().is_some_and(|sent| sent.version == version)
            || ack.acked_version.as_deref() == Some(version)
            || ack.last_sent_version.as_deref() == Some(version)
    }

    pub(crate) fn sent_nonce_matches(&self, nonce: &str) -> bool {
        lock(&self.ack)
            .last_sent_nonce
            .as_deref()
            .is_some_and(|sent| sent == nonce)
    }
}

/// Live subscriptions of every stream served by one server.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subscriptions: RwLock<HashMap<SubscriptionKey, Arc<Subscription>>>,
}

impl SubscriptionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `subscription`, closing any previous handle registered under the same key.
    pub(crate) fn register(&self, subscription: Arc<Subscription>) -> Option<Arc<Subscription>> {
        let previous = self
            .write()
            .insert(subscription.key().clone(), Arc::clone(&subscription));
        if let Some(previous) = &previous {
            if !Arc::ptr_eq(previous, &subscription) {
                debug!("Replacing subscription: key={}", subscription.key());
                previous.close();
            }
        }
        previous
    }

    /// Returns the handle registered under `key`.
    pub fn lookup(&self, key: &SubscriptionKey) -> Option<Arc<Subscription>> {
        self.read().get(key).cloned()
    }

    /// Removes and closes the handle registered under `key`.
    ///
    /// Idempotent: returns `false` if nothing was registered.
    pub fn deregister(&self, key: &SubscriptionKey) -> bool {
        let removed = self.write().remove(key);
        match removed {
            Some(subscription) => {
                subscription.close();
                true
            }
            None => false,
        }
    }

    /// Removes `subscription` only if it is still the registered handle for its key, then
    /// closes it.
    pub(crate) fn deregister_handle(&self, subscription: &Arc<Subscription>) -> bool {
        let removed = {
            let mut subscriptions = self.write();
            let current = subscriptions
                .get(subscription.key())
                .is_some_and(|registered| Arc::ptr_eq(registered, subscription));
            current && subscriptions.remove(subscription.key()).is_some()
        };
        subscription.close();
        removed
    }

    /// Delivers `push` to the subscription registered under `key`.
    ///
    /// Never blocks. A missing key is a no-op.
    pub fn dispatch(&self, key: &SubscriptionKey, push: impl Into<Push>) -> DispatchOutcome {
        let Some(subscription) = self.lookup(key) else {
            debug!("No subscription for push: key={}", key);
            return DispatchOutcome::NoSubscription;
        };
        if subscription.deliver(push.into()) {
            DispatchOutcome::Delivered
        } else {
            DispatchOutcome::Closed
        }
    }

    /// Removes and closes every subscription idle for at least `max_idle`.
    ///
    /// Candidates are collected under the read lock and removed under the write lock only
    /// if they are still registered and still idle. Handles are closed after the lock is
    /// released.
    pub fn sweep_idle(&self, max_idle: Duration) -> Vec<Arc<Subscription>> {
        let now = Instant::now();
        let candidates: Vec<Arc<Subscription>> = self
            .read()
            .values()
            .filter(|subscription| subscription.idle_at(now) >= max_idle)
            .cloned()
            .collect();
        if candidates.is_empty() {
            return candidates;
        }

        let reaped: Vec<Arc<Subscription>> = {
            let mut subscriptions = self.write();
            candidates
                .into_iter()
                .filter(|candidate| {
                    let current = subscriptions
                        .get(candidate.key())
                        .is_some_and(|registered| Arc::ptr_eq(registered, candidate));
                    current
                        && candidate.idle_at(now) >= max_idle
                        && subscriptions.remove(candidate.key()).is_some()
                })
                .collect()
        };

        for subscription in &reaped {
            subscription.close();
        }
        reaped
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns `true` if no subscription is live.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Keys of every live subscription.
    pub fn keys(&self) -> Vec<SubscriptionKey> {
        self.read().keys().cloned().collect()
    }

    /// Returns the connection id of a live subscription whose connection id starts with
    /// `prefix` (typically a proxy's node id).
    pub fn find_connection_id(&self, prefix: &str) -> Option<String> {
        self.read()
            .keys()
            .find(|key| key.connection_id().starts_with(prefix))
            .map(|key| key.connection_id().to_owned())
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SubscriptionKey, Arc<Subscription>>> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SubscriptionKey, Arc<Subscription>>> {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable entry point for pushing secrets to subscribed proxies.
#[derive(Debug, Clone)]
pub struct PushDispatcher {
    registry: Arc<SubscriptionRegistry>,
}

impl PushDispatcher {
    pub(crate) fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self { registry }
    }

    /// Pushes `secret` to the subscription under `key`; `None` closes its stream.
    pub fn notify(
        &self,
        key: &SubscriptionKey,
        secret: Option<Arc<SecretItem>>,
    ) -> DispatchOutcome {
        self.registry.dispatch(key, secret)
    }

    /// Pushes `secret` to the subscription under `key`.
    pub fn push(&self, key: &SubscriptionKey, secret: Arc<SecretItem>) -> DispatchOutcome {
        self.registry.dispatch(key, secret)
    }

    /// Asks the stream serving `key` to close.
    pub fn close(&self, key: &SubscriptionKey) -> DispatchOutcome {
        self.registry.dispatch(key, Push::Tombstone)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
