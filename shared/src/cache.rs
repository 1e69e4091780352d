//! Per-kind, per-key store of the latest server view of each record collection.
//!
//! Entries are replaced whole under a write lock, so readers never see a partial
//! write. Invalidation keeps the data and only marks it stale; subscribers learn
//! about every change through [`CacheEvent`].

use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::model::{CaseId, OwnerId, RecordId, UnixTimeMs};

/// Type-erased cached payload. Each [`RecordKind`] maps to exactly one concrete type.
pub type CachedValue = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Profile,
    Prescriptions,
    Prescription,
    Reminders,
    DrugInteractions,
    DietHistory,
    HospitalHistory,
    PriceHistory,
    EmergencyCase,
    MyEmergencies,
}

impl RecordKind {
    pub const ALL: [Self; 10] = [
        Self::Profile,
        Self::Prescriptions,
        Self::Prescription,
        Self::Reminders,
        Self::DrugInteractions,
        Self::DietHistory,
        Self::HospitalHistory,
        Self::PriceHistory,
        Self::EmergencyCase,
        Self::MyEmergencies,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Profile => "profile",
            Self::Prescriptions => "prescriptions",
            Self::Prescription => "prescription",
            Self::Reminders => "reminders",
            Self::DrugInteractions => "drug_interactions",
            Self::DietHistory => "diet_history",
            Self::HospitalHistory => "hospital_history",
            Self::PriceHistory => "price_history",
            Self::EmergencyCase => "emergency_case",
            Self::MyEmergencies => "my_emergencies",
        }
    }

    /// Only the two emergency kinds change server-side without a local write.
    #[must_use]
    pub const fn poll_interval(self, config: &SyncConfig) -> Option<Duration> {
        match self {
            Self::EmergencyCase => Some(config.emergency_case_poll()),
            Self::MyEmergencies => Some(config.emergency_list_poll()),
            _ => None,
        }
    }

    /// Kinds whose reply depends on who the caller is rather than on a discriminator.
    #[must_use]
    pub const fn is_identity_scoped(self) -> bool {
        matches!(self, Self::Profile | Self::MyEmergencies)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Discriminator {
    Owner(OwnerId),
    Record(RecordId),
    Case(CaseId),
    /// Singleton kinds scoped to whoever is calling.
    Caller,
}

impl fmt::Display for Discriminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owner(owner) => write!(f, "owner:{}", owner.fingerprint()),
            Self::Record(id) => write!(f, "record:{id}"),
            Self::Case(id) => write!(f, "case:{id}"),
            Self::Caller => f.write_str("caller"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub kind: RecordKind,
    pub discriminator: Discriminator,
}

impl QueryKey {
    #[must_use]
    pub const fn new(kind: RecordKind, discriminator: Discriminator) -> Self {
        Self {
            kind,
            discriminator,
        }
    }

    #[must_use]
    pub fn owner(kind: RecordKind, owner: &OwnerId) -> Self {
        Self::new(kind, Discriminator::Owner(owner.clone()))
    }

    #[must_use]
    pub fn case(id: &CaseId) -> Self {
        Self::new(RecordKind::EmergencyCase, Discriminator::Case(id.clone()))
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.kind, self.discriminator)
    }
}

/// Target of an invalidation: one key, or every key of a kind (`(kind, *)`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Invalidation {
    Key(QueryKey),
    Kind(RecordKind),
}

impl Invalidation {
    #[must_use]
    pub fn matches(&self, key: &QueryKey) -> bool {
        match self {
            Self::Key(target) => target == key,
            Self::Kind(kind) => *kind == key.kind,
        }
    }
}

impl fmt::Display for Invalidation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => key.fmt(f),
            Self::Kind(kind) => write!(f, "({kind}, *)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
}

/// What a fetch observed when it started: the session epoch and the key's
/// last invalidation mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FetchTicket {
    pub epoch: u64,
    pub generation: u64,
}

/// Result of [`RecordCache::write_at`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Fresh,
    /// The key was invalidated while the fetch ran; stored but already stale.
    Stale,
    /// A fetch started after this one already wrote the key.
    Superseded,
    /// A flush happened since the ticket was issued.
    OldEpoch,
}

#[derive(Clone)]
pub struct CachedEntry {
    value: CachedValue,
    freshness: Freshness,
    updated_at: UnixTimeMs,
    version: u64,
    generation: u64,
}

impl CachedEntry {
    #[must_use]
    pub fn downcast<T: Clone + 'static>(&self) -> Option<T> {
        self.value.downcast_ref::<T>().cloned()
    }

    #[must_use]
    pub fn value(&self) -> CachedValue {
        Arc::clone(&self.value)
    }

    #[must_use]
    pub const fn is_fresh(&self) -> bool {
        matches!(self.freshness, Freshness::Fresh)
    }

    #[must_use]
    pub const fn freshness(&self) -> Freshness {
        self.freshness
    }

    #[must_use]
    pub const fn updated_at(&self) -> UnixTimeMs {
        self.updated_at
    }

    /// Store-wide write counter at the time this entry was written.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }
}

impl fmt::Debug for CachedEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedEntry")
            .field("freshness", &self.freshness)
            .field("updated_at", &self.updated_at)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Written(QueryKey),
    Invalidated(Invalidation),
    Flushed,
}

struct CacheState {
    entries: LruCache<QueryKey, CachedEntry>,
    epoch: u64,
    next_version: u64,
    /// Monotonic counter handed out as invalidation marks.
    next_mark: u64,
    key_marks: LruCache<QueryKey, u64>,
    kind_marks: HashMap<RecordKind, u64>,
    /// Highest mark pushed out of `key_marks`; stands in for any key not tracked.
    evicted_mark: u64,
}

impl CacheState {
    /// Last invalidation mark that covers `key`.
    fn mark(&self, key: &QueryKey) -> u64 {
        let by_key = self.key_marks.peek(key).copied().unwrap_or(self.evicted_mark);
        let by_kind = self.kind_marks.get(&key.kind).copied().unwrap_or(0);
        by_key.max(by_kind)
    }

    fn record_mark(&mut self, target: &Invalidation) {
        self.next_mark += 1;
        let mark = self.next_mark;
        match target {
            Invalidation::Key(key) => {
                if let Some((evicted, old)) = self.key_marks.push(key.clone(), mark) {
                    if &evicted != key {
                        self.evicted_mark = self.evicted_mark.max(old);
                    }
                }
            }
            Invalidation::Kind(kind) => {
                self.kind_marks.insert(*kind, mark);
            }
        }
    }
}

pub struct RecordCache {
    state: RwLock<CacheState>,
    events: broadcast::Sender<CacheEvent>,
}

impl RecordCache {
    #[must_use]
    pub fn new(config: &SyncConfig) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            state: RwLock::new(CacheState {
                entries: LruCache::new(capacity),
                epoch: 0,
                next_version: 1,
                next_mark: 0,
                key_marks: LruCache::new(capacity),
                kind_marks: HashMap::new(),
                evicted_mark: 0,
            }),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Side-effect free lookup; does not touch recency.
    pub async fn read(&self, key: &QueryKey) -> Option<CachedEntry> {
        self.state.read().await.entries.peek(key).cloned()
    }

    pub async fn write(&self, key: QueryKey, value: CachedValue) {
        let mut state = self.state.write().await;
        let generation = state.mark(&key);
        Self::insert(&mut state, key.clone(), value, Freshness::Fresh, generation);
        drop(state);
        self.emit(CacheEvent::Written(key));
    }

    /// Ticket for a fetch of `key` started under session `epoch`.
    pub async fn ticket(&self, key: &QueryKey, epoch: u64) -> FetchTicket {
        FetchTicket {
            epoch,
            generation: self.state.read().await.mark(key),
        }
    }

    /// Stores a fetch result taken with `ticket`. Results from before a flush
    /// are dropped; results from before an invalidation of `key` are stored
    /// stale, or not at all when a newer fetch already wrote the key.
    pub async fn write_at(&self, key: QueryKey, value: CachedValue, ticket: FetchTicket) -> WriteOutcome {
        let mut state = self.state.write().await;
        if state.epoch != ticket.epoch {
            debug!(key = %key, written_epoch = ticket.epoch, current_epoch = state.epoch, "dropping write from a previous epoch");
            return WriteOutcome::OldEpoch;
        }
        let current = state.mark(&key);
        let outcome = if current <= ticket.generation {
            WriteOutcome::Fresh
        } else if state
            .entries
            .peek(&key)
            .is_some_and(|entry| entry.generation > ticket.generation)
        {
            debug!(key = %key, "newer fetch already wrote this key");
            return WriteOutcome::Superseded;
        } else {
            debug!(key = %key, "key invalidated while fetching; storing as stale");
            WriteOutcome::Stale
        };
        let freshness = if outcome == WriteOutcome::Fresh {
            Freshness::Fresh
        } else {
            Freshness::Stale
        };
        Self::insert(&mut state, key.clone(), value, freshness, ticket.generation);
        drop(state);
        self.emit(CacheEvent::Written(key));
        outcome
    }

    /// Marks the entry stale without dropping its data. Returns whether an entry existed.
    pub async fn invalidate(&self, key: &QueryKey) -> bool {
        self.invalidate_target(&Invalidation::Key(key.clone())).await > 0
    }

    pub async fn invalidate_kind(&self, kind: RecordKind) -> usize {
        self.invalidate_target(&Invalidation::Kind(kind)).await
    }

    /// Marks every matching entry stale and always notifies subscribers, even
    /// for keys that have no entry yet (e.g. a binding whose first fetch failed).
    pub async fn invalidate_target(&self, target: &Invalidation) -> usize {
        let mut state = self.state.write().await;
        state.record_mark(target);
        let mut marked = 0;
        for (key, entry) in state.entries.iter_mut() {
            if target.matches(key) {
                entry.freshness = Freshness::Stale;
                marked += 1;
            }
        }
        drop(state);
        debug!(target = %target, marked, "invalidated");
        self.emit(CacheEvent::Invalidated(target.clone()));
        marked
    }

    /// Drops every entry and starts a new epoch. Called by the session on identity change.
    pub(crate) async fn flush(&self) -> u64 {
        let mut state = self.state.write().await;
        let dropped = state.entries.len();
        state.entries.clear();
        state.key_marks.clear();
        state.kind_marks.clear();
        state.evicted_mark = 0;
        state.epoch = state.epoch.wrapping_add(1);
        let epoch = state.epoch;
        drop(state);
        info!(dropped, epoch, "record cache flushed");
        self.emit(CacheEvent::Flushed);
        epoch
    }

    pub async fn epoch(&self) -> u64 {
        self.state.read().await.epoch
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn insert(
        state: &mut CacheState,
        key: QueryKey,
        value: CachedValue,
        freshness: Freshness,
        generation: u64,
    ) {
        let version = state.next_version;
        state.next_version = state.next_version.wrapping_add(1);
        let entry = CachedEntry {
            value,
            freshness,
            updated_at: UnixTimeMs::now(),
            version,
            generation,
        };
        if let Some((evicted, _)) = state.entries.push(key.clone(), entry) {
            if evicted != key {
                debug!(key = %evicted, "evicted least recently written entry");
            }
        }
    }

    fn emit(&self, event: CacheEvent) {
        // No receivers simply means nothing is being observed.
        let _ = self.events.send(event);
    }
}

impl fmt::Debug for RecordCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordCache").finish_non_exhaustive()
    }
}
