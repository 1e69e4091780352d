//! Emergency dispatch: submission, tracking view and the local ETA estimate.
//!
//! The lifecycle itself is owned by the remote side. The controller only
//! renders whatever status the polled case query reports.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::capabilities::{acquire_position, LocationError, LocationProvider, PositionRequest};
use crate::client::{SyncClient, SyncError};
use crate::config::SyncConfig;
use crate::model::{CaseId, Coordinate, EmergencyCase, EmergencyStatus};
use crate::mutation::{RequestAmbulance, UpdateEmergencyStatus};
use crate::query::{EmergencyCaseQuery, QueryState, Subscription};

const LAST_STEP: usize = EmergencyStatus::ALL.len() - 1;

/// Position of the status along the fixed lifecycle, in `[0, 1]`. Unknown is 0.
#[must_use]
pub fn progress_fraction(status: Option<EmergencyStatus>) -> f64 {
    status.map_or(0.0, |s| s.index() as f64 / LAST_STEP as f64)
}

/// True until the case reports `Arrived`. An unknown status counts as en route.
#[must_use]
pub fn before_arrival(status: Option<EmergencyStatus>) -> bool {
    status.map_or(true, |s| s.index() < EmergencyStatus::Arrived.index())
}

/// Locally simulated minutes-to-arrival. Never reconciled with the server.
// TODO: switch to a server-supplied ETA once the case record carries one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EtaCountdown {
    minutes: u32,
}

impl EtaCountdown {
    pub const FLOOR: u32 = 1;

    #[must_use]
    pub fn new(initial_minutes: u32) -> Self {
        Self {
            minutes: initial_minutes.max(Self::FLOOR),
        }
    }

    #[must_use]
    pub const fn minutes(self) -> u32 {
        self.minutes
    }

    /// One elapsed minute. Returns whether the estimate changed.
    pub fn tick(&mut self, status: Option<EmergencyStatus>) -> bool {
        if before_arrival(status) && self.minutes > Self::FLOOR {
            self.minutes -= 1;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StepMarker {
    pub status: EmergencyStatus,
    pub reached: bool,
}

/// Everything the tracking overlay renders.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackingView {
    pub case_id: CaseId,
    pub short_id: String,
    pub status: Option<EmergencyStatus>,
    /// No confirmed status from the server yet (or the last poll failed).
    pub syncing: bool,
    pub progress: f64,
    /// Shown only while the case is still before `Arrived`.
    pub eta_minutes: Option<u32>,
    pub steps: Vec<StepMarker>,
}

impl TrackingView {
    #[must_use]
    pub fn build(
        case_id: &CaseId,
        status: Option<EmergencyStatus>,
        syncing: bool,
        countdown: EtaCountdown,
    ) -> Self {
        let reached = status.map(EmergencyStatus::index);
        let steps = EmergencyStatus::ALL
            .iter()
            .map(|&step| StepMarker {
                status: step,
                reached: reached.is_some_and(|current| step.index() <= current),
            })
            .collect();
        Self {
            case_id: case_id.clone(),
            short_id: case_id.short().to_string(),
            status,
            syncing,
            progress: progress_fraction(status),
            eta_minutes: (!syncing && before_arrival(status)).then(|| countdown.minutes()),
            steps,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DispatchPhase {
    #[default]
    Idle,
    Locating,
    Dispatching,
    Tracking(CaseId),
}

impl DispatchPhase {
    #[must_use]
    pub const fn is_busy(&self) -> bool {
        matches!(self, Self::Locating | Self::Dispatching)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DispatchView {
    pub phase: DispatchPhase,
    /// User-facing text of the last failed submission.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("an ambulance request is already in progress")]
    InProgress,

    #[error("location unavailable: {0}")]
    Location(#[from] LocationError),

    #[error(transparent)]
    Remote(#[from] SyncError),
}

impl DispatchError {
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::InProgress => "An ambulance request is already in progress.".into(),
            Self::Location(LocationError::Unsupported) => {
                "Geolocation is not supported on this device.".into()
            }
            Self::Location(_) => {
                "Unable to retrieve your location. Please ensure location services are enabled."
                    .into()
            }
            Self::Remote(_) => "Failed to request ambulance. Please try again.".into(),
        }
    }
}

/// Running tracking overlay. Dropping it stops local rendering and releases the
/// case subscription; the case itself is untouched.
struct Tracker {
    case_id: CaseId,
    task: JoinHandle<()>,
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct DispatchController {
    client: Arc<SyncClient>,
    locator: Option<Arc<dyn LocationProvider>>,
    view: watch::Sender<DispatchView>,
    tracking: Arc<watch::Sender<Option<TrackingView>>>,
    /// Id of the only tracker allowed to publish. Zero when none is.
    active: Arc<AtomicU64>,
    next_tracker: AtomicU64,
    tracker: Mutex<Option<Tracker>>,
}

impl DispatchController {
    /// `locator` is `None` on devices without location services.
    pub fn new(client: Arc<SyncClient>, locator: Option<Arc<dyn LocationProvider>>) -> Self {
        let (view, _) = watch::channel(DispatchView::default());
        let (tracking, _) = watch::channel(None);
        Self {
            client,
            locator,
            view,
            tracking: Arc::new(tracking),
            active: Arc::new(AtomicU64::new(0)),
            next_tracker: AtomicU64::new(1),
            tracker: Mutex::new(None),
        }
    }

    pub fn view(&self) -> watch::Receiver<DispatchView> {
        self.view.subscribe()
    }

    /// `None` while nothing is being tracked.
    pub fn tracking(&self) -> watch::Receiver<Option<TrackingView>> {
        self.tracking.subscribe()
    }

    pub async fn tracked_case(&self) -> Option<CaseId> {
        self.tracker.lock().await.as_ref().map(|t| t.case_id.clone())
    }

    /// Locates the device, submits the request and starts tracking the new case.
    ///
    /// `Ok(None)` when the remote proxy is not ready. Failures are also
    /// published as user-facing text on [`Self::view`]; nothing is retried.
    #[instrument(skip(self))]
    pub async fn request_ambulance(&self) -> Result<Option<CaseId>, DispatchError> {
        if self.client.session().proxy().is_none() {
            debug!("remote proxy not ready; nothing submitted");
            return Ok(None);
        }
        let started = self.view.send_if_modified(|view| {
            if view.phase.is_busy() {
                return false;
            }
            view.phase = DispatchPhase::Locating;
            view.error = None;
            true
        });
        if !started {
            warn!("ambulance request already in progress");
            return Err(DispatchError::InProgress);
        }

        let location = match self.locate().await {
            Ok(location) => location,
            Err(e) => {
                warn!(error = %e, "could not locate device");
                return Err(self.abort(e.into()));
            }
        };

        self.view.send_modify(|view| view.phase = DispatchPhase::Dispatching);
        match self.client.mutate(&RequestAmbulance { location }).await {
            Ok(Some(case_id)) => {
                info!(case = %case_id.short(), "ambulance requested");
                self.track(case_id.clone()).await;
                Ok(Some(case_id))
            }
            Ok(None) => {
                debug!("remote proxy not ready; nothing submitted");
                self.view.send_modify(|view| view.phase = DispatchPhase::Idle);
                Ok(None)
            }
            Err(e) => {
                error!(error = %e, "ambulance request failed");
                Err(self.abort(e.into()))
            }
        }
    }

    /// Opens the tracking overlay for `case_id`, replacing any current one.
    #[instrument(skip(self), fields(case = %case_id.short()))]
    pub async fn track(&self, case_id: CaseId) {
        let mut tracker = self.tracker.lock().await;
        let id = self.next_tracker.fetch_add(1, Ordering::Relaxed);
        self.active.store(id, Ordering::Release);
        drop(tracker.take());

        let subscription = self.client.watch(EmergencyCaseQuery::new(&case_id));
        let task = tokio::spawn(
            run_tracker(
                subscription,
                case_id.clone(),
                self.client.config().clone(),
                Publisher {
                    id,
                    active: Arc::clone(&self.active),
                    out: Arc::clone(&self.tracking),
                },
            )
            .in_current_span(),
        );
        *tracker = Some(Tracker {
            case_id: case_id.clone(),
            task,
        });
        self.view.send_modify(|view| {
            view.phase = DispatchPhase::Tracking(case_id);
            view.error = None;
        });
    }

    /// Closes the overlay. The case keeps running server-side and stays
    /// visible through the case list.
    pub async fn minimize(&self) {
        let mut tracker = self.tracker.lock().await;
        self.active.store(0, Ordering::Release);
        if let Some(closed) = tracker.take() {
            debug!(case = %closed.case_id.short(), "tracking minimized");
        }
        self.tracking.send_replace(None);
        drop(tracker);
        self.view.send_if_modified(|view| {
            if matches!(view.phase, DispatchPhase::Tracking(_)) {
                view.phase = DispatchPhase::Idle;
                true
            } else {
                false
            }
        });
    }

    /// Requests a status transition. The remote side decides whether it applies.
    #[instrument(skip(self), fields(case = %case_id.short()))]
    pub async fn update_status(
        &self,
        case_id: &CaseId,
        status: EmergencyStatus,
    ) -> Result<Option<bool>, DispatchError> {
        let update = UpdateEmergencyStatus {
            case_id: case_id.clone(),
            status,
        };
        Ok(self.client.mutate(&update).await?)
    }

    async fn locate(&self) -> Result<Coordinate, LocationError> {
        let Some(locator) = &self.locator else {
            return Err(LocationError::Unsupported);
        };
        let request = PositionRequest::one_shot(self.client.config().location_timeout());
        acquire_position(locator.as_ref(), &request).await
    }

    fn abort(&self, error: DispatchError) -> DispatchError {
        let message = error.user_message();
        self.view.send_modify(|view| {
            view.phase = DispatchPhase::Idle;
            view.error = Some(message);
        });
        error
    }
}

impl std::fmt::Debug for DispatchController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchController")
            .field("view", &*self.view.borrow())
            .field("has_locator", &self.locator.is_some())
            .finish_non_exhaustive()
    }
}

/// Folds one query state into (status to show, syncing). Keeps the last
/// confirmed status while the server has nothing newer.
fn observe(
    state: &QueryState<Option<EmergencyCase>>,
    last_status: &mut Option<EmergencyStatus>,
) -> bool {
    match state {
        QueryState::Ready { data: Some(case) } => {
            *last_status = Some(case.status);
            false
        }
        QueryState::Failed {
            last: Some(Some(case)),
            ..
        } => {
            *last_status = Some(case.status);
            true
        }
        QueryState::Ready { data: None }
        | QueryState::Failed { .. }
        | QueryState::Loading
        | QueryState::Disabled(_) => true,
    }
}

/// Publishing handle of one tracker. Aborting a task does not stop a poll
/// that is already running, so every publish re-checks that the tracker is
/// still the active one.
struct Publisher {
    id: u64,
    active: Arc<AtomicU64>,
    out: Arc<watch::Sender<Option<TrackingView>>>,
}

impl Publisher {
    fn publish(&self, view: TrackingView) -> bool {
        self.out.send_if_modified(|current| {
            if self.active.load(Ordering::Acquire) != self.id {
                return false;
            }
            *current = Some(view);
            true
        })
    }
}

async fn run_tracker(
    subscription: Subscription<Option<EmergencyCase>>,
    case_id: CaseId,
    config: SyncConfig,
    out: Publisher,
) {
    let mut states = subscription.receiver();
    let mut countdown = EtaCountdown::new(config.initial_eta_minutes);
    let mut last_status = None;
    let period = config.eta_tick();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let syncing = observe(&states.borrow_and_update(), &mut last_status);
        if !out.publish(TrackingView::build(&case_id, last_status, syncing, countdown)) {
            debug!(case = %case_id.short(), "tracker replaced; stopping");
            break;
        }

        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if countdown.tick(last_status) {
                    debug!(minutes = countdown.minutes(), "eta estimate decremented");
                }
            }
        }
    }
    drop(subscription);
}
