//! In-process doubles for the remote store and the device location service.
//!
//! The backend keeps every record in memory, enforces per-caller ownership the
//! way the real store does, and lets a test inject latency or failures per
//! operation.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::capabilities::{
    LocationError, LocationProvider, Position, PositionRequest, RemoteConnector, RemoteError,
    RemoteStore,
};
use crate::model::{
    CaseId, Coordinate, DietRecord, DrugInteractionRecord, EmergencyCase, EmergencyStatus,
    HospitalRecord, HospitalSearchLog, MedicationReminder, OwnerId, Prescription, PriceRecord,
    RecordId, UnixTimeMs, UserProfile,
};
use crate::session::Identity;

#[derive(Default)]
struct BackendState {
    profiles: HashMap<OwnerId, UserProfile>,
    prescriptions: Vec<Prescription>,
    reminders: Vec<MedicationReminder>,
    interactions: Vec<DrugInteractionRecord>,
    diets: Vec<DietRecord>,
    hospitals: Vec<HospitalRecord>,
    prices: Vec<PriceRecord>,
    cases: Vec<EmergencyCase>,
    search_logs: Vec<HospitalSearchLog>,
    calls: HashMap<String, u64>,
    failing: HashSet<String>,
    latency: Duration,
    reply_delays: HashMap<String, Duration>,
    cases_hidden: bool,
}

/// Shared in-memory remote store. Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    inner: Arc<Mutex<BackendState>>,
}

impl InMemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BackendState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of calls made to `operation`, including failed ones.
    #[must_use]
    pub fn calls(&self, operation: &str) -> u64 {
        self.state().calls.get(operation).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn total_calls(&self) -> u64 {
        self.state().calls.values().sum()
    }

    pub fn fail_operation(&self, operation: &str) {
        self.state().failing.insert(operation.to_string());
    }

    pub fn heal_operation(&self, operation: &str) {
        self.state().failing.remove(operation);
    }

    /// Delay applied to every call before it is answered.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Holds the reply of a read for `delay` after its data was taken, so the
    /// answer can be overtaken by a later write.
    pub fn delay_reply(&self, operation: &str, delay: Duration) {
        self.state().reply_delays.insert(operation.to_string(), delay);
    }

    /// While hidden, `get_case` answers with an empty list.
    pub fn hide_cases(&self, hidden: bool) {
        self.state().cases_hidden = hidden;
    }

    /// Moves a case one step along the lifecycle, as the dispatch desk would.
    pub fn advance_case(&self, id: &CaseId) -> Option<EmergencyStatus> {
        let mut state = self.state();
        let case = state.cases.iter_mut().find(|c| &c.id == id)?;
        let next = EmergencyStatus::ALL.get(case.status.index() + 1).copied()?;
        case.status = next;
        Some(next)
    }

    #[must_use]
    pub fn case(&self, id: &CaseId) -> Option<EmergencyCase> {
        self.state().cases.iter().find(|c| &c.id == id).cloned()
    }

    #[must_use]
    pub fn search_logs(&self, owner: &OwnerId) -> Vec<HospitalSearchLog> {
        self.state()
            .search_logs
            .iter()
            .filter(|log| &log.owner_id == owner)
            .cloned()
            .collect()
    }

    async fn enter(&self, operation: &str) -> Result<(), RemoteError> {
        let latency = {
            let mut state = self.state();
            *state.calls.entry(operation.to_string()).or_default() += 1;
            state.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.state().failing.contains(operation) {
            debug!(operation, "injected failure");
            return Err(RemoteError::Transport(format!("{operation} unavailable")));
        }
        Ok(())
    }

    async fn reply<T>(&self, operation: &str, value: T) -> T {
        let delay = self.state().reply_delays.get(operation).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        value
    }
}

impl RemoteConnector for InMemoryBackend {
    fn connect(&self, identity: &Identity) -> Arc<dyn RemoteStore> {
        Arc::new(CallerHandle {
            backend: self.clone(),
            caller: identity.principal().cloned(),
        })
    }
}

/// The backend as seen by one caller.
struct CallerHandle {
    backend: InMemoryBackend,
    caller: Option<OwnerId>,
}

impl CallerHandle {
    fn caller(&self) -> Result<&OwnerId, RemoteError> {
        self.caller
            .as_ref()
            .ok_or_else(|| RemoteError::Rejected("sign in required".into()))
    }

    fn authorize(&self, owner: &OwnerId) -> Result<(), RemoteError> {
        if self.caller()? == owner {
            Ok(())
        } else {
            Err(RemoteError::Rejected("caller does not own these records".into()))
        }
    }

    fn owned_by<T: Clone>(records: &[T], owner: &OwnerId, owner_of: impl Fn(&T) -> &OwnerId) -> Vec<T> {
        records
            .iter()
            .filter(|r| owner_of(r) == owner)
            .cloned()
            .collect()
    }
}

fn new_id() -> RecordId {
    RecordId::new(Uuid::new_v4().to_string())
}

#[async_trait]
impl RemoteStore for CallerHandle {
    async fn get_profile(&self) -> Result<Option<UserProfile>, RemoteError> {
        self.backend.enter("get_profile").await?;
        let profile = self
            .caller
            .as_ref()
            .and_then(|caller| self.backend.state().profiles.get(caller).cloned());
        Ok(self.backend.reply("get_profile", profile).await)
    }

    async fn save_profile(&self, profile: UserProfile) -> Result<(), RemoteError> {
        self.backend.enter("save_profile").await?;
        let caller = self.caller()?.clone();
        self.backend.state().profiles.insert(caller, profile);
        Ok(())
    }

    async fn list_prescriptions(&self, owner: &OwnerId) -> Result<Vec<Prescription>, RemoteError> {
        self.backend.enter("list_prescriptions").await?;
        self.authorize(owner)?;
        let records = Self::owned_by(&self.backend.state().prescriptions, owner, |r| &r.owner_id);
        Ok(self.backend.reply("list_prescriptions", records).await)
    }

    async fn get_prescription(&self, id: &RecordId) -> Result<Option<Prescription>, RemoteError> {
        self.backend.enter("get_prescription").await?;
        let caller = self.caller()?;
        let found = self
            .backend
            .state()
            .prescriptions
            .iter()
            .find(|p| &p.id == id && &p.owner_id == caller)
            .cloned();
        Ok(self.backend.reply("get_prescription", found).await)
    }

    async fn save_prescription(
        &self,
        owner: &OwnerId,
        raw_text: &str,
        analysis: &str,
    ) -> Result<RecordId, RemoteError> {
        self.backend.enter("save_prescription").await?;
        self.authorize(owner)?;
        let id = new_id();
        self.backend.state().prescriptions.push(Prescription {
            id: id.clone(),
            owner_id: owner.clone(),
            raw_text: raw_text.to_string(),
            analysis_result: analysis.to_string(),
            created_at: UnixTimeMs::now(),
        });
        Ok(id)
    }

    async fn delete_prescription(&self, id: &RecordId) -> Result<bool, RemoteError> {
        self.backend.enter("delete_prescription").await?;
        let caller = self.caller()?.clone();
        let mut state = self.backend.state();
        let before = state.prescriptions.len();
        state
            .prescriptions
            .retain(|p| !(&p.id == id && p.owner_id == caller));
        Ok(state.prescriptions.len() != before)
    }

    async fn list_reminders(
        &self,
        owner: &OwnerId,
    ) -> Result<Vec<MedicationReminder>, RemoteError> {
        self.backend.enter("list_reminders").await?;
        self.authorize(owner)?;
        let records = Self::owned_by(&self.backend.state().reminders, owner, |r| &r.owner_id);
        Ok(self.backend.reply("list_reminders", records).await)
    }

    async fn add_reminder(
        &self,
        owner: &OwnerId,
        medicine_name: &str,
        dosage: &str,
        scheduled_at: UnixTimeMs,
    ) -> Result<RecordId, RemoteError> {
        self.backend.enter("add_reminder").await?;
        self.authorize(owner)?;
        let id = new_id();
        self.backend.state().reminders.push(MedicationReminder {
            id: id.clone(),
            owner_id: owner.clone(),
            medicine_name: medicine_name.to_string(),
            dosage: dosage.to_string(),
            scheduled_at,
            active: true,
        });
        Ok(id)
    }

    async fn set_reminder_active(&self, id: &RecordId, active: bool) -> Result<bool, RemoteError> {
        self.backend.enter("set_reminder_active").await?;
        let caller = self.caller()?.clone();
        let mut state = self.backend.state();
        match state
            .reminders
            .iter_mut()
            .find(|r| &r.id == id && r.owner_id == caller)
        {
            Some(reminder) => {
                reminder.active = active;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_reminder(&self, id: &RecordId) -> Result<bool, RemoteError> {
        self.backend.enter("delete_reminder").await?;
        let caller = self.caller()?.clone();
        let mut state = self.backend.state();
        let before = state.reminders.len();
        state.reminders.retain(|r| !(&r.id == id && r.owner_id == caller));
        Ok(state.reminders.len() != before)
    }

    async fn list_drug_interactions(
        &self,
        owner: &OwnerId,
    ) -> Result<Vec<DrugInteractionRecord>, RemoteError> {
        self.backend.enter("list_drug_interactions").await?;
        self.authorize(owner)?;
        let records = Self::owned_by(&self.backend.state().interactions, owner, |r| &r.owner_id);
        Ok(self.backend.reply("list_drug_interactions", records).await)
    }

    async fn save_drug_interaction(
        &self,
        owner: &OwnerId,
        medications: &[String],
        summary: &str,
    ) -> Result<RecordId, RemoteError> {
        self.backend.enter("save_drug_interaction").await?;
        self.authorize(owner)?;
        let record = DrugInteractionRecord {
            id: new_id(),
            owner_id: owner.clone(),
            medications: medications.to_vec(),
            summary: summary.to_string(),
            created_at: UnixTimeMs::now(),
        };
        if !record.has_valid_medication_count() {
            return Err(RemoteError::Rejected(format!(
                "at least {} medications required",
                DrugInteractionRecord::MIN_MEDICATIONS
            )));
        }
        let id = record.id.clone();
        self.backend.state().interactions.push(record);
        Ok(id)
    }

    async fn list_diet_records(&self, owner: &OwnerId) -> Result<Vec<DietRecord>, RemoteError> {
        self.backend.enter("list_diet_records").await?;
        self.authorize(owner)?;
        let records = Self::owned_by(&self.backend.state().diets, owner, |r| &r.owner_id);
        Ok(self.backend.reply("list_diet_records", records).await)
    }

    async fn save_diet_recommendation(
        &self,
        owner: &OwnerId,
        plan: &str,
    ) -> Result<RecordId, RemoteError> {
        self.backend.enter("save_diet_recommendation").await?;
        self.authorize(owner)?;
        let id = new_id();
        self.backend.state().diets.push(DietRecord {
            id: id.clone(),
            owner_id: owner.clone(),
            plan: plan.to_string(),
            created_at: UnixTimeMs::now(),
        });
        Ok(id)
    }

    async fn list_hospital_records(
        &self,
        owner: &OwnerId,
    ) -> Result<Vec<HospitalRecord>, RemoteError> {
        self.backend.enter("list_hospital_records").await?;
        self.authorize(owner)?;
        let records = Self::owned_by(&self.backend.state().hospitals, owner, |r| &r.owner_id);
        Ok(self.backend.reply("list_hospital_records", records).await)
    }

    async fn save_hospital_search(
        &self,
        owner: &OwnerId,
        location: &str,
        results: &str,
    ) -> Result<RecordId, RemoteError> {
        self.backend.enter("save_hospital_search").await?;
        self.authorize(owner)?;
        let id = new_id();
        self.backend.state().hospitals.push(HospitalRecord {
            id: id.clone(),
            owner_id: owner.clone(),
            location: location.to_string(),
            results: results.to_string(),
            created_at: UnixTimeMs::now(),
        });
        Ok(id)
    }

    async fn list_price_records(&self, owner: &OwnerId) -> Result<Vec<PriceRecord>, RemoteError> {
        self.backend.enter("list_price_records").await?;
        self.authorize(owner)?;
        let records = Self::owned_by(&self.backend.state().prices, owner, |r| &r.owner_id);
        Ok(self.backend.reply("list_price_records", records).await)
    }

    async fn save_price_comparison(
        &self,
        owner: &OwnerId,
        medicine_name: &str,
        links: &str,
    ) -> Result<RecordId, RemoteError> {
        self.backend.enter("save_price_comparison").await?;
        self.authorize(owner)?;
        let id = new_id();
        self.backend.state().prices.push(PriceRecord {
            id: id.clone(),
            owner_id: owner.clone(),
            medicine_name: medicine_name.to_string(),
            links: links.to_string(),
            created_at: UnixTimeMs::now(),
        });
        Ok(id)
    }

    async fn request_dispatch(&self, location: Coordinate) -> Result<CaseId, RemoteError> {
        self.backend.enter("request_dispatch").await?;
        let owner = self.caller()?.clone();
        let id = CaseId::new(Uuid::new_v4().to_string());
        let now = UnixTimeMs::now();
        let mut state = self.backend.state();
        state.cases.push(EmergencyCase {
            id: id.clone(),
            owner_id: owner.clone(),
            latitude: location.lat(),
            longitude: location.lon(),
            status: EmergencyStatus::Requested,
            hospital_id: None,
            created_at: now,
        });
        state.search_logs.push(HospitalSearchLog {
            id: new_id(),
            owner_id: owner,
            query: "emergency dispatch".into(),
            latitude: location.lat(),
            longitude: location.lon(),
            emergency: true,
            created_at: now,
        });
        Ok(id)
    }

    async fn get_case(&self, id: &CaseId) -> Result<Vec<EmergencyCase>, RemoteError> {
        self.backend.enter("get_case").await?;
        let cases: Vec<EmergencyCase> = {
            let state = self.backend.state();
            if state.cases_hidden {
                Vec::new()
            } else {
                state.cases.iter().filter(|c| &c.id == id).cloned().collect()
            }
        };
        Ok(self.backend.reply("get_case", cases).await)
    }

    async fn list_my_cases(&self) -> Result<Vec<EmergencyCase>, RemoteError> {
        self.backend.enter("list_my_cases").await?;
        let Some(caller) = &self.caller else {
            return Ok(Vec::new());
        };
        let cases = Self::owned_by(&self.backend.state().cases, caller, |c| &c.owner_id);
        Ok(self.backend.reply("list_my_cases", cases).await)
    }

    async fn set_case_status(
        &self,
        id: &CaseId,
        status: EmergencyStatus,
    ) -> Result<bool, RemoteError> {
        self.backend.enter("set_case_status").await?;
        let mut state = self.backend.state();
        match state.cases.iter_mut().find(|c| &c.id == id) {
            Some(case) if status > case.status => {
                case.status = status;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

// ============================================================================
// Location
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum LocatorScript {
    Fix(Position),
    Fail(LocationError),
    NeverAnswer,
}

/// Location provider with a fixed answer.
#[derive(Debug)]
pub struct ScriptedLocator {
    script: LocatorScript,
    requests: AtomicU64,
    last_request: Mutex<Option<PositionRequest>>,
}

impl ScriptedLocator {
    fn with(script: LocatorScript) -> Self {
        Self {
            script,
            requests: AtomicU64::new(0),
            last_request: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn at(latitude: f64, longitude: f64) -> Self {
        Self::with(LocatorScript::Fix(Position {
            latitude,
            longitude,
            accuracy_m: Some(5.0),
        }))
    }

    #[must_use]
    pub fn failing(error: LocationError) -> Self {
        Self::with(LocatorScript::Fail(error))
    }

    /// Never resolves; the caller's own bound has to fire.
    #[must_use]
    pub fn silent() -> Self {
        Self::with(LocatorScript::NeverAnswer)
    }

    #[must_use]
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn last_request(&self) -> Option<PositionRequest> {
        *self.last_request.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl LocationProvider for ScriptedLocator {
    async fn current_position(&self, request: &PositionRequest) -> Result<Position, LocationError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap_or_else(PoisonError::into_inner) = Some(*request);
        match self.script {
            LocatorScript::Fix(position) => Ok(position),
            LocatorScript::Fail(error) => Err(error),
            LocatorScript::NeverAnswer => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signed_in(backend: &InMemoryBackend, owner: &str) -> Arc<dyn RemoteStore> {
        backend.connect(&Identity::Authenticated {
            principal: OwnerId::new(owner),
            token: Arc::new(secrecy::SecretString::new("t".into())),
        })
    }

    #[tokio::test]
    async fn test_drug_interaction_round_trip() {
        let backend = InMemoryBackend::new();
        let remote = signed_in(&backend, "u1");
        let owner = OwnerId::new("u1");
        let meds = vec!["Aspirin".to_string(), "Warfarin".to_string()];

        remote
            .save_drug_interaction(&owner, &meds, "severe interaction")
            .await
            .unwrap();
        let listed = remote.list_drug_interactions(&owner).await.unwrap();

        assert!(listed
            .iter()
            .any(|r| r.medications == meds && r.summary == "severe interaction"));
    }

    #[tokio::test]
    async fn test_dispatch_creates_requested_case_and_search_log() {
        let backend = InMemoryBackend::new();
        let remote = signed_in(&backend, "u1");

        let id = remote
            .request_dispatch(Coordinate::new(12.97, 77.59).unwrap())
            .await
            .unwrap();
        let cases = remote.get_case(&id).await.unwrap();

        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].status, EmergencyStatus::Requested);
        let logs = backend.search_logs(&OwnerId::new("u1"));
        assert_eq!(logs.len(), 1);
        assert!(logs[0].emergency);
    }

    #[tokio::test]
    async fn test_status_only_moves_forward() {
        let backend = InMemoryBackend::new();
        let remote = signed_in(&backend, "u1");
        let id = remote
            .request_dispatch(Coordinate::new(0.0, 0.0).unwrap())
            .await
            .unwrap();

        assert!(remote.set_case_status(&id, EmergencyStatus::Arriving).await.unwrap());
        assert!(!remote.set_case_status(&id, EmergencyStatus::Dispatched).await.unwrap());
        assert_eq!(backend.advance_case(&id), Some(EmergencyStatus::Arrived));
        assert_eq!(backend.advance_case(&id), Some(EmergencyStatus::Completed));
        assert_eq!(backend.advance_case(&id), None);
    }

    #[tokio::test]
    async fn test_ownership_is_enforced() {
        let backend = InMemoryBackend::new();
        let remote = signed_in(&backend, "u1");
        let anonymous = backend.connect(&Identity::Anonymous);

        assert!(remote.list_prescriptions(&OwnerId::new("u2")).await.is_err());
        assert!(anonymous.list_reminders(&OwnerId::new("u1")).await.is_err());
        assert_eq!(anonymous.get_profile().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_injected_failures_are_counted() {
        let backend = InMemoryBackend::new();
        let remote = signed_in(&backend, "u1");
        backend.fail_operation("get_profile");

        assert!(matches!(
            remote.get_profile().await,
            Err(RemoteError::Transport(_))
        ));
        backend.heal_operation("get_profile");
        assert!(remote.get_profile().await.is_ok());
        assert_eq!(backend.calls("get_profile"), 2);
    }

    #[tokio::test]
    async fn test_rejects_single_medication() {
        let backend = InMemoryBackend::new();
        let remote = signed_in(&backend, "u1");
        let result = remote
            .save_drug_interaction(&OwnerId::new("u1"), &["Aspirin".to_string()], "n/a")
            .await;
        assert!(matches!(result, Err(RemoteError::Rejected(_))));
    }
}
