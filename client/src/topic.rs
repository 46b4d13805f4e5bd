//! Topic engine: local cache, write coalescing and lifecycle of one topic
//!
//! A [`Topic`] keeps the last known key/value state of one named topic and
//! translates local mutations into outbound entry batches. Depending on its
//! [`TopicPolicy`] it applies writes optimistically or waits for the relay
//! to echo them, batches writes behind a rate limit, seeds the relay when
//! this participant opens a fresh game, and retracts per-participant keys
//! when the session ends.
//!
//! All state lives behind `Rc<RefCell<..>>`: engines run on a single
//! thread (inside a [`tokio::task::LocalSet`] when a rate limit is set), and
//! every transition runs to completion before the next one starts.

use crate::connection::Connection;
use crate::observer::{IdSource, Registry, SubscriptionId};
use log::{debug, error, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared::{
    decode_value, encode_value, DataEntry, Entry, Key, PolicyOption, SessionInfo, TopicPolicy,
    OFFLINE_KEY,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::rc::{Rc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("policy option {option} of topic {topic} cannot change during a session")]
    PolicyLocked { topic: String, option: &'static str },
}

/// Key types usable for a topic
pub trait TopicKey: Clone + Eq + Hash + fmt::Debug + 'static {
    fn to_key(&self) -> Key;

    /// Converts a wire key, or `None` if it does not fit this key type
    fn from_key(key: &Key) -> Option<Self>;
}

impl TopicKey for String {
    fn to_key(&self) -> Key {
        Key::Str(self.clone())
    }

    fn from_key(key: &Key) -> Option<Self> {
        key.as_str().map(str::to_string)
    }
}

macro_rules! int_topic_key {
    ($($ty:ty),*) => {
        $(
            impl TopicKey for $ty {
                fn to_key(&self) -> Key {
                    Key::Int(i64::from(*self))
                }

                fn from_key(key: &Key) -> Option<Self> {
                    key.as_int().and_then(|value| <$ty>::try_from(value).ok())
                }
            }
        )*
    };
}

int_topic_key!(u8, u16, u32, i32, i64);

/// Value types usable for a topic
pub trait TopicValue: Clone + Serialize + DeserializeOwned + 'static {}

impl<T: Clone + Serialize + DeserializeOwned + 'static> TopicValue for T {}

/// Change notification delivered to `update` observers
#[derive(Debug, Clone, PartialEq)]
pub struct TopicUpdate<K, V> {
    /// Entries just applied to the cache, in order. `None` is a deletion.
    pub entries: Vec<(K, Option<V>)>,
    /// True if the cache was cleared before applying `entries`
    pub full: bool,
    /// The [`OFFLINE_KEY`] marker: set when this participant's own key was
    /// retracted on disconnect, carrying its last known value. Never part
    /// of `entries` or the cache.
    pub offline: Option<(K, V)>,
}

/// Anything the [`Dispatcher`](crate::dispatcher::Dispatcher) can deliver
/// inbound batches and lifecycle events to
pub trait TopicSink {
    fn name(&self) -> &str;

    fn receive(&self, entries: &[Entry], full: bool);

    /// Starts the session. Rate-limited topics spawn their flush timer
    /// with [`tokio::task::spawn_local`], so this panics when called
    /// outside a [`tokio::task::LocalSet`] for such a topic.
    fn on_connect(&self, session: &SessionInfo, is_first: bool);

    fn on_disconnect(&self, session: Option<&SessionInfo>);
}

/// Recurring flush of the pending buffer while a rate-limited topic is
/// connected. Dropping the timer cancels the task.
struct FlushTimer {
    handle: JoinHandle<()>,
}

impl FlushTimer {
    fn start<K: TopicKey, V: TopicValue>(
        period: Duration,
        state: Weak<RefCell<TopicState<K, V>>>,
        connection: Rc<dyn Connection>,
    ) -> Self {
        let handle = tokio::task::spawn_local(async move {
            let mut ticks = time::interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticks.tick().await;
                let Some(state) = state.upgrade() else {
                    break;
                };
                state.borrow_mut().flush(connection.as_ref());
            }
        });

        Self { handle }
    }
}

impl Drop for FlushTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Writes not yet transmitted, one slot per key in first-write order
struct Pending<K, V> {
    writes: Vec<(K, Option<V>)>,
    slots: HashMap<K, usize>,
}

impl<K: TopicKey, V> Pending<K, V> {
    fn new() -> Self {
        Self {
            writes: Vec::new(),
            slots: HashMap::new(),
        }
    }

    /// Overwrites an earlier write of the same key in place
    fn insert(&mut self, key: K, value: Option<V>) {
        match self.slots.get(&key) {
            Some(&slot) => self.writes[slot].1 = value,
            None => {
                self.slots.insert(key.clone(), self.writes.len());
                self.writes.push((key, value));
            }
        }
    }

    fn take(&mut self) -> Vec<(K, Option<V>)> {
        self.slots.clear();
        std::mem::take(&mut self.writes)
    }

    fn clear(&mut self) {
        self.slots.clear();
        self.writes.clear();
    }

    fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

struct TopicState<K, V> {
    name: Rc<str>,
    policy: TopicPolicy,
    cache: HashMap<K, V>,
    pending: Pending<K, V>,
    /// `None` until the first flush, so the first flush is never delayed
    last_flush: Option<Instant>,
    timer: Option<FlushTimer>,
    session_active: bool,
    last_offline: Option<(K, V)>,
}

impl<K: TopicKey, V: TopicValue> TopicState<K, V> {
    fn cache_entries(&mut self, entries: &[(K, Option<V>)]) {
        for (key, value) in entries {
            match value {
                Some(value) => {
                    self.cache.insert(key.clone(), value.clone());
                }
                None => {
                    self.cache.remove(key);
                }
            }
        }
    }

    fn should_flush(&self, now: Instant) -> bool {
        match (self.policy.rate_limit_interval(), self.last_flush) {
            (None, _) | (_, None) => true,
            (Some(interval), Some(last)) => now.duration_since(last) > interval,
        }
    }

    fn flush(&mut self, connection: &dyn Connection) {
        if self.pending.is_empty() {
            return;
        }

        let writes = self.pending.take();
        let mut entries = Vec::with_capacity(writes.len());
        for (key, value) in writes {
            match encode_optional(&value) {
                Ok(payload) => entries.push(Entry::data(&*self.name, key.to_key(), payload)),
                Err(e) => error!("Failed to encode {:?} for topic {}: {}", key, self.name, e),
            }
        }

        debug!("Flushing {} entries for topic {}", entries.len(), self.name);
        connection.transmit(entries);
        self.last_flush = Some(Instant::now());
    }

    fn snapshot(&self) -> Vec<Entry> {
        self.cache
            .iter()
            .filter_map(|(key, value)| match encode_value(value) {
                Ok(payload) => Some(Entry::data(&*self.name, key.to_key(), Some(payload))),
                Err(e) => {
                    error!("Failed to encode {:?} for topic {}: {}", key, self.name, e);
                    None
                }
            })
            .collect()
    }

    fn decode(&self, data: &DataEntry) -> Option<(K, Option<V>)> {
        let Some(key) = K::from_key(&data.key) else {
            warn!("Ignoring key {} of unexpected type on topic {}", data.key, self.name);
            return None;
        };

        match data.value.as_deref().map(decode_value::<V>).transpose() {
            Ok(value) => Some((key, value)),
            Err(e) => {
                warn!("Ignoring malformed value for {} on topic {}: {}", data.key, self.name, e);
                None
            }
        }
    }
}

fn encode_optional<V: Serialize>(value: &Option<V>) -> Result<Option<Vec<u8>>, shared::CodecError> {
    value.as_ref().map(encode_value).transpose()
}

struct Observers<K, V> {
    ids: IdSource,
    update: Registry<TopicUpdate<K, V>>,
    policy: Registry<TopicPolicy>,
}

/// Handle to one synchronized topic. Clones share the same engine.
pub struct Topic<K, V> {
    name: Rc<str>,
    state: Rc<RefCell<TopicState<K, V>>>,
    observers: Rc<Observers<K, V>>,
    connection: Rc<dyn Connection>,
}

impl<K, V> Clone for Topic<K, V> {
    fn clone(&self) -> Self {
        Self {
            name: Rc::clone(&self.name),
            state: Rc::clone(&self.state),
            observers: Rc::clone(&self.observers),
            connection: Rc::clone(&self.connection),
        }
    }
}

impl<K: TopicKey, V: TopicValue> Topic<K, V> {
    /// Creates a detached engine. Rate-limited topics must be driven from
    /// inside a [`tokio::task::LocalSet`]; see [`TopicSink::on_connect`].
    pub fn new(name: &str, policy: TopicPolicy, connection: Rc<dyn Connection>) -> Self {
        let name: Rc<str> = Rc::from(name);
        Self {
            name: Rc::clone(&name),
            state: Rc::new(RefCell::new(TopicState {
                name,
                policy,
                cache: HashMap::new(),
                pending: Pending::new(),
                last_flush: None,
                timer: None,
                session_active: false,
                last_offline: None,
            })),
            observers: Rc::new(Observers {
                ids: IdSource::new(),
                update: Registry::new(),
                policy: Registry::new(),
            }),
            connection,
        }
    }

    /// Applies a batch of local writes. `None` deletes a key.
    ///
    /// Unless the topic is write-protected the cache changes immediately.
    /// While connected the writes are buffered and flushed subject to the
    /// rate limit; while disconnected they never leave this participant.
    pub fn update(&self, entries: Vec<(K, Option<V>)>) {
        let write_protected = self.state.borrow().policy.is_write_protected();
        if !write_protected {
            self.apply(entries.clone(), false, None);
        }

        if !self.connection.connected() {
            return;
        }

        let mut state = self.state.borrow_mut();
        for (key, value) in entries {
            state.pending.insert(key, value);
        }
        if state.should_flush(Instant::now()) {
            state.flush(self.connection.as_ref());
        }
    }

    pub fn set(&self, key: K, value: Option<V>) {
        self.update(vec![(key, value)]);
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.state.borrow().cache.get(key).cloned()
    }

    /// Snapshot of the cache at call time
    pub fn entries(&self) -> Vec<(K, V)> {
        self.state
            .borrow()
            .cache
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.borrow().cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().cache.is_empty()
    }

    pub fn policy(&self) -> TopicPolicy {
        self.state.borrow().policy.clone()
    }

    /// Last value of this participant's own key, kept under the
    /// [`OFFLINE_KEY`] marker when a per-participant topic was retracted
    /// on disconnect
    pub fn last_offline(&self) -> Option<(K, V)> {
        self.state.borrow().last_offline.clone()
    }

    pub fn is_flush_timer_active(&self) -> bool {
        self.state.borrow().timer.is_some()
    }

    pub fn on_update(&self, handler: impl Fn(&TopicUpdate<K, V>) + 'static) -> SubscriptionId {
        let id = self.observers.ids.next();
        self.observers.update.subscribe(id, Rc::new(handler));
        id
    }

    pub fn on_policy_changed(&self, handler: impl Fn(&TopicPolicy) + 'static) -> SubscriptionId {
        let id = self.observers.ids.next();
        self.observers.policy.subscribe(id, Rc::new(handler));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.update.unsubscribe(id) || self.observers.policy.unsubscribe(id)
    }

    /// Changes one policy option.
    ///
    /// Returns `Ok(false)` if the value is unchanged. Once a session is
    /// active only write protection may change; the new value is then also
    /// sent to the relay.
    pub fn set_policy_option(&self, option: PolicyOption) -> Result<bool, TopicError> {
        let policy = {
            let mut state = self.state.borrow_mut();
            if state.session_active && !matches!(option, PolicyOption::WriteProtected(_)) {
                return Err(TopicError::PolicyLocked {
                    topic: self.name.to_string(),
                    option: option.name(),
                });
            }
            if !state.policy.apply(&option) {
                return Ok(false);
            }
            if option.is_declared_upstream() && self.connection.connected() {
                self.connection
                    .transmit(vec![Entry::policy(&*self.name, option)]);
            }
            state.policy.clone()
        };

        self.observers.policy.emit(&policy);
        Ok(true)
    }

    /// Applies entries to the cache and notifies observers
    fn apply(&self, entries: Vec<(K, Option<V>)>, full: bool, offline: Option<(K, V)>) {
        {
            let mut state = self.state.borrow_mut();
            if full {
                state.cache.clear();
            }
            state.cache_entries(&entries);
            if offline.is_some() {
                state.last_offline = offline.clone();
            }
        }

        if full || !entries.is_empty() || offline.is_some() {
            self.observers.update.emit(&TopicUpdate {
                entries,
                full,
                offline,
            });
        }
    }
}

impl<K: TopicKey, V: TopicValue> TopicSink for Topic<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn receive(&self, entries: &[Entry], full: bool) {
        let (decoded, policy) = {
            let mut state = self.state.borrow_mut();
            let mut decoded = Vec::with_capacity(entries.len());
            let mut policy_changed = false;

            for entry in entries {
                if entry.topic() != &*self.name {
                    continue;
                }
                match entry {
                    Entry::Policy(declared) => match declared.option {
                        PolicyOption::WriteProtected(_) => {
                            policy_changed |= state.policy.apply(&declared.option);
                        }
                        _ => debug!(
                            "Ignoring inbound {} declaration on topic {}",
                            declared.option.name(),
                            self.name
                        ),
                    },
                    Entry::Data(data) => {
                        if let Some(change) = state.decode(data) {
                            decoded.push(change);
                        }
                    }
                }
            }

            (decoded, policy_changed.then(|| state.policy.clone()))
        };

        if let Some(policy) = policy {
            self.observers.policy.emit(&policy);
        }
        self.apply(decoded, full, None);
    }

    fn on_connect(&self, session: &SessionInfo, is_first: bool) {
        let mut state = self.state.borrow_mut();
        state.session_active = true;

        if is_first {
            let declarations = state
                .policy
                .declarations()
                .into_iter()
                .map(|option| Entry::policy(&*self.name, option))
                .collect();
            self.connection.transmit(declarations);

            if state.policy.sends_on_connect() {
                let snapshot = state.snapshot();
                debug!(
                    "Seeding game {} with {} entries of topic {}",
                    session.game_id,
                    snapshot.len(),
                    self.name
                );
                self.connection.transmit(snapshot);
            }
        }

        if let Some(period) = state.policy.rate_limit_interval() {
            state.timer = Some(FlushTimer::start(
                period,
                Rc::downgrade(&self.state),
                Rc::clone(&self.connection),
            ));
        }
    }

    fn on_disconnect(&self, session: Option<&SessionInfo>) {
        let retraction = {
            let mut state = self.state.borrow_mut();
            state.timer = None;
            state.pending.clear();
            state.session_active = false;

            match session {
                Some(session) if state.policy.is_per_participant() => {
                    let own = K::from_key(&Key::from(session.player_id.as_str()));
                    let mut offline = None;
                    let entries: Vec<(K, Option<V>)> = state
                        .cache
                        .iter()
                        .map(|(key, value)| {
                            if own.as_ref() == Some(key) {
                                offline = Some((key.clone(), value.clone()));
                            }
                            (key.clone(), None)
                        })
                        .collect();
                    Some((entries, offline))
                }
                _ => None,
            }
        };

        if let Some((entries, offline)) = retraction {
            debug!(
                "Retracting {} keys of topic {} ({} marker)",
                entries.len(),
                self.name,
                if offline.is_some() { OFFLINE_KEY } else { "no" }
            );
            self.apply(entries, true, offline);
        }
    }
}
