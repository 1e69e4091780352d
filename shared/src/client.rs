use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, debug_span, info, instrument, warn, Instrument};

use crate::cache::{
    CacheEvent, CachedValue, Discriminator, FetchTicket, QueryKey, RecordCache, RecordKind,
    WriteOutcome,
};
use crate::capabilities::{RemoteConnector, RemoteError, RemoteProxy};
use crate::config::{ConfigError, SyncConfig};
use crate::mutation::MutationDef;
use crate::query::{DisabledReason, QueryDef, QueryState, Subscription};
use crate::session::{Session, SessionSnapshot};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("remote proxy is not ready")]
    ProxyNotReady,

    #[error("{operation} failed: {source}")]
    RemoteCallFailed {
        operation: &'static str,
        #[source]
        source: RemoteError,
    },

    #[error("fetch for {kind} was abandoned before it completed")]
    FetchAbandoned { kind: RecordKind },

    #[error("cached {kind} entry holds an unexpected type")]
    CacheTypeMismatch { kind: RecordKind },

    #[error("records of owner {owner} are not accessible to this identity")]
    ForeignOwner { owner: String },
}

type FetchResult = Result<CachedValue, SyncError>;
/// Keyed by ticket as well as key: a fetch started before an invalidation is
/// never joined by one started after it.
type InFlight = Arc<Mutex<HashMap<(QueryKey, FetchTicket), watch::Receiver<Option<FetchResult>>>>>;

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Default)]
pub struct SyncMetrics {
    pub remote_fetches: AtomicU64,
    pub deduplicated_reads: AtomicU64,
    pub cache_hits: AtomicU64,
    pub mutations_applied: AtomicU64,
    pub mutations_failed: AtomicU64,
    pub invalidations: AtomicU64,
    pub stale_writes_dropped: AtomicU64,
}

impl SyncMetrics {
    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        SyncMetricsSnapshot {
            remote_fetches: self.remote_fetches.load(Ordering::Relaxed),
            deduplicated_reads: self.deduplicated_reads.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            mutations_applied: self.mutations_applied.load(Ordering::Relaxed),
            mutations_failed: self.mutations_failed.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            stale_writes_dropped: self.stale_writes_dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncMetricsSnapshot {
    pub remote_fetches: u64,
    pub deduplicated_reads: u64,
    pub cache_hits: u64,
    pub mutations_applied: u64,
    pub mutations_failed: u64,
    pub invalidations: u64,
    pub stale_writes_dropped: u64,
}

// ============================================================================
// Client
// ============================================================================

/// Everything an enabled binding needs for one fetch.
#[derive(Debug, Clone)]
struct Gate {
    key: QueryKey,
    proxy: RemoteProxy,
    epoch: u64,
}

/// Entry point of the sync layer: read-through queries, observed bindings and
/// pessimistic mutations over one session and one record cache.
pub struct SyncClient {
    session: Arc<Session>,
    cache: Arc<RecordCache>,
    config: SyncConfig,
    in_flight: InFlight,
    metrics: Arc<SyncMetrics>,
}

impl SyncClient {
    pub fn new(connector: Arc<dyn RemoteConnector>, config: SyncConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let cache = Arc::new(RecordCache::new(&config));
        let session = Arc::new(Session::new(connector, Arc::clone(&cache)));
        Ok(Self {
            session,
            cache,
            config,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            metrics: Arc::new(SyncMetrics::default()),
        })
    }

    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<RecordCache> {
        &self.cache
    }

    #[must_use]
    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn metrics(&self) -> SyncMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Read-through access. `Ok(None)` while the binding is disabled.
    #[instrument(skip(self, query), fields(kind = %Q::KIND))]
    pub async fn fetch_query<Q: QueryDef>(&self, query: &Q) -> Result<Option<Q::Output>, SyncError> {
        self.read(query, false).await
    }

    /// Like [`Self::fetch_query`] but always goes to the remote store.
    #[instrument(skip(self, query), fields(kind = %Q::KIND))]
    pub async fn refetch<Q: QueryDef>(&self, query: &Q) -> Result<Option<Q::Output>, SyncError> {
        self.read(query, true).await
    }

    /// Observes a binding until the returned handle is dropped.
    pub fn watch<Q: QueryDef>(self: &Arc<Self>, query: Q) -> Subscription<Q::Output> {
        let (_, queries) = watch::channel(query);
        self.watch_with(queries)
    }

    /// Observes a binding whose parameters change over time. Every new value
    /// of `queries` is gated again, so clearing its discriminator disables the
    /// binding and stops its timer until a known one is set.
    pub fn watch_with<Q: QueryDef>(
        self: &Arc<Self>,
        queries: watch::Receiver<Q>,
    ) -> Subscription<Q::Output> {
        let (tx, rx) = watch::channel(QueryState::Loading);
        let client = Arc::clone(self);
        let span = debug_span!("query_watch", kind = %Q::KIND);
        let task = tokio::spawn(client.drive(queries, tx).instrument(span));
        Subscription::new(rx, task)
    }

    /// Primary write. `Ok(None)` if the proxy is not ready; a failed call is
    /// returned to the caller and invalidates nothing.
    #[instrument(skip(self, mutation), fields(mutation = M::NAME))]
    pub async fn mutate<M: MutationDef>(&self, mutation: &M) -> Result<Option<M::Output>, SyncError> {
        let snapshot = self.session.snapshot();
        let Some(proxy) = snapshot.proxy else {
            debug!("remote proxy not ready; mutation skipped");
            return Ok(None);
        };
        if let Some(owner) = mutation.owner() {
            if snapshot.identity.principal() != Some(owner) {
                warn!(owner = %owner.fingerprint(), "refusing to write another identity's records");
                return Err(SyncError::ForeignOwner {
                    owner: owner.fingerprint(),
                });
            }
        }

        let remote = proxy.remote();
        let output = match mutation.execute(remote.as_ref()).await {
            Ok(output) => output,
            Err(source) => {
                self.metrics.mutations_failed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %source, "mutation failed");
                return Err(SyncError::RemoteCallFailed {
                    operation: M::NAME,
                    source,
                });
            }
        };

        let targets = mutation.invalidates();
        for target in &targets {
            self.cache.invalidate_target(target).await;
        }
        self.metrics
            .invalidations
            .fetch_add(targets.len() as u64, Ordering::Relaxed);
        self.metrics.mutations_applied.fetch_add(1, Ordering::Relaxed);
        info!(invalidated = targets.len(), "mutation applied");
        Ok(Some(output))
    }

    /// Secondary history write that accompanies a result already shown to the
    /// user. Failures are logged and dropped.
    pub async fn record_history<M: MutationDef>(&self, mutation: &M) {
        if let Err(e) = self.mutate(mutation).await {
            warn!(mutation = M::NAME, error = %e, "history save failed; ignoring");
        }
    }

    fn gate<Q: QueryDef>(query: &Q, snapshot: &SessionSnapshot) -> Result<Gate, DisabledReason> {
        let proxy = snapshot.proxy.clone().ok_or(DisabledReason::ProxyNotReady)?;
        let key = query.key().ok_or(DisabledReason::DiscriminatorUnknown)?;
        let principal = snapshot.identity.principal();
        match &key.discriminator {
            Discriminator::Owner(owner) => match principal {
                None => return Err(DisabledReason::IdentityAbsent),
                Some(p) if p != owner => return Err(DisabledReason::ForeignOwner),
                Some(_) => {}
            },
            _ if Q::KIND.is_identity_scoped() && principal.is_none() => {
                return Err(DisabledReason::IdentityAbsent);
            }
            _ => {}
        }
        Ok(Gate {
            key,
            proxy,
            epoch: snapshot.epoch,
        })
    }

    async fn read<Q: QueryDef>(&self, query: &Q, force: bool) -> Result<Option<Q::Output>, SyncError> {
        let gate = match Self::gate(query, &self.session.snapshot()) {
            Ok(gate) => gate,
            Err(reason) => {
                debug!(%reason, "binding disabled");
                return Ok(None);
            }
        };

        if !force {
            if let Some(entry) = self.cache.read(&gate.key).await {
                if entry.is_fresh() {
                    self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return downcast::<Q>(&entry.value()).map(Some);
                }
            }
        }

        let value = self.fetch_shared(query, &gate).await?;
        downcast::<Q>(&value).map(Some)
    }

    /// Joins the in-flight fetch for this key and ticket, or starts one.
    async fn fetch_shared<Q: QueryDef>(&self, query: &Q, gate: &Gate) -> FetchResult {
        let ticket = self.cache.ticket(&gate.key, gate.epoch).await;
        let slot = (gate.key.clone(), ticket);
        let mut rx = {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(rx) = in_flight.get(&slot) {
                self.metrics.deduplicated_reads.fetch_add(1, Ordering::Relaxed);
                debug!(key = %gate.key, "joining in-flight fetch");
                rx.clone()
            } else {
                let (tx, rx) = watch::channel(None);
                in_flight.insert(slot, rx.clone());
                self.spawn_fetch(query.clone(), gate.clone(), ticket, tx);
                rx
            }
        };

        let outcome = rx.wait_for(Option::is_some).await.map(|result| result.clone());
        match outcome {
            Ok(Some(result)) => result,
            Ok(None) | Err(_) => Err(SyncError::FetchAbandoned { kind: Q::KIND }),
        }
    }

    /// The remote call runs detached so that abandoning interest never cancels it.
    fn spawn_fetch<Q: QueryDef>(
        &self,
        query: Q,
        gate: Gate,
        ticket: FetchTicket,
        tx: watch::Sender<Option<FetchResult>>,
    ) {
        let cache = Arc::clone(&self.cache);
        let in_flight = Arc::clone(&self.in_flight);
        let metrics = Arc::clone(&self.metrics);
        let span = debug_span!(
            "remote_fetch",
            key = %gate.key,
            epoch = ticket.epoch,
            generation = ticket.generation
        );

        tokio::spawn(
            async move {
                metrics.remote_fetches.fetch_add(1, Ordering::Relaxed);
                let remote = gate.proxy.remote();
                let result = match query.fetch(remote.as_ref()).await {
                    Ok(output) => {
                        let value: CachedValue = Arc::new(output);
                        match cache.write_at(gate.key.clone(), Arc::clone(&value), ticket).await {
                            WriteOutcome::OldEpoch => {
                                metrics.stale_writes_dropped.fetch_add(1, Ordering::Relaxed);
                                Err(SyncError::FetchAbandoned { kind: Q::KIND })
                            }
                            WriteOutcome::Fresh | WriteOutcome::Stale | WriteOutcome::Superseded => {
                                Ok(value)
                            }
                        }
                    }
                    Err(source) => {
                        warn!(error = %source, "remote fetch failed");
                        Err(SyncError::RemoteCallFailed {
                            operation: Q::KIND.as_str(),
                            source,
                        })
                    }
                };
                in_flight.lock().await.remove(&(gate.key, ticket));
                // Nobody waiting is fine; the cache already holds the result.
                let _ = tx.send(Some(result));
            }
            .instrument(span),
        );
    }

    async fn drive<Q: QueryDef>(
        self: Arc<Self>,
        mut queries: watch::Receiver<Q>,
        tx: watch::Sender<QueryState<Q::Output>>,
    ) {
        let mut session_rx = self.session.subscribe();
        let mut events = self.cache.subscribe();
        loop {
            let snapshot = session_rx.borrow_and_update().clone();
            let query = queries.borrow_and_update().clone();
            match Self::gate(&query, &snapshot) {
                Ok(gate) => {
                    let flow = self
                        .run_enabled(&query, &gate, &mut session_rx, &mut queries, &mut events, &tx)
                        .await;
                    if flow.is_break() {
                        return;
                    }
                }
                Err(reason) => {
                    debug!(%reason, "binding disabled");
                    tx.send_replace(QueryState::Disabled(reason));
                    tokio::select! {
                        changed = session_rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                        () = query_changed(&mut queries) => {}
                    }
                }
            }
        }
    }

    /// Serves one enabled period. `Continue` means the session or the query
    /// changed and the binding must be gated again.
    async fn run_enabled<Q: QueryDef>(
        &self,
        query: &Q,
        gate: &Gate,
        session_rx: &mut watch::Receiver<SessionSnapshot>,
        queries: &mut watch::Receiver<Q>,
        events: &mut tokio::sync::broadcast::Receiver<CacheEvent>,
        tx: &watch::Sender<QueryState<Q::Output>>,
    ) -> ControlFlow<()> {
        let mut last: Option<Q::Output> = None;
        let mut seen_version: Option<u64> = None;
        let mut ticker = Q::KIND.poll_interval(&self.config).map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        let mut pending = Some(false);

        loop {
            if let Some(force) = pending.take() {
                tokio::select! {
                    biased;
                    changed = session_rx.changed() => return session_flow(changed.is_ok()),
                    () = query_changed(queries) => return ControlFlow::Continue(()),
                    () = self.load(query, gate, force, tx, &mut last, &mut seen_version) => {}
                }
            }

            tokio::select! {
                biased;
                changed = session_rx.changed() => return session_flow(changed.is_ok()),
                () = query_changed(queries) => return ControlFlow::Continue(()),
                event = events.recv() => match event {
                    Ok(CacheEvent::Invalidated(target)) if target.matches(&gate.key) => {
                        pending = Some(true);
                    }
                    Ok(CacheEvent::Written(key)) if key == gate.key => {
                        self.mirror::<Q>(gate, tx, &mut last, &mut seen_version).await;
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "cache events lagged; re-reading");
                        pending = Some(false);
                    }
                    Err(RecvError::Closed) => return ControlFlow::Break(()),
                },
                () = next_tick(&mut ticker) => pending = Some(true),
            }
        }
    }

    async fn load<Q: QueryDef>(
        &self,
        query: &Q,
        gate: &Gate,
        force: bool,
        tx: &watch::Sender<QueryState<Q::Output>>,
        last: &mut Option<Q::Output>,
        seen_version: &mut Option<u64>,
    ) {
        if !force {
            if let Some(entry) = self.cache.read(&gate.key).await {
                if entry.is_fresh() {
                    if let Ok(data) = downcast::<Q>(&entry.value()) {
                        self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
                        *seen_version = Some(entry.version());
                        *last = Some(data.clone());
                        tx.send_replace(QueryState::Ready { data });
                        return;
                    }
                }
            }
        }

        // Keep showing the previous value while refetching.
        if last.is_none() {
            tx.send_replace(QueryState::Loading);
        }

        match self.fetch_shared(query, gate).await.and_then(|v| downcast::<Q>(&v)) {
            Ok(data) => {
                *seen_version = self.cache.read(&gate.key).await.map(|e| e.version());
                *last = Some(data.clone());
                tx.send_replace(QueryState::Ready { data });
            }
            Err(error) => {
                tx.send_replace(QueryState::Failed {
                    error,
                    last: last.clone(),
                });
            }
        }
    }

    /// Picks up a fresh value some other reader wrote for the same key. Stale
    /// writes are left alone; the invalidation that made them stale already
    /// queued a reload.
    async fn mirror<Q: QueryDef>(
        &self,
        gate: &Gate,
        tx: &watch::Sender<QueryState<Q::Output>>,
        last: &mut Option<Q::Output>,
        seen_version: &mut Option<u64>,
    ) {
        let Some(entry) = self.cache.read(&gate.key).await else {
            return;
        };
        if !entry.is_fresh() || *seen_version == Some(entry.version()) {
            return;
        }
        if let Ok(data) = downcast::<Q>(&entry.value()) {
            *seen_version = Some(entry.version());
            *last = Some(data.clone());
            tx.send_replace(QueryState::Ready { data });
        }
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("session", &self.session)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn downcast<Q: QueryDef>(value: &CachedValue) -> Result<Q::Output, SyncError> {
    value
        .downcast_ref::<Q::Output>()
        .cloned()
        .ok_or(SyncError::CacheTypeMismatch { kind: Q::KIND })
}

const fn session_flow(open: bool) -> ControlFlow<()> {
    if open {
        ControlFlow::Continue(())
    } else {
        ControlFlow::Break(())
    }
}

/// Resolves when the observed query is replaced. Never resolves once the
/// sender is gone, which leaves the binding on its last query.
async fn query_changed<Q>(queries: &mut watch::Receiver<Q>) {
    if queries.changed().await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}
