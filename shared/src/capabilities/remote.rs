use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::model::{
    CaseId, Coordinate, DietRecord, DrugInteractionRecord, EmergencyCase, EmergencyStatus,
    HospitalRecord, MedicationReminder, OwnerId, Prescription, PriceRecord, RecordId, UnixTimeMs,
    UserProfile,
};
use crate::session::Identity;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("call rejected: {0}")]
    Rejected(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("malformed reply: {0}")]
    Malformed(String),
}

/// Call contract of the authoritative record store.
///
/// Every method is a single request/response round trip. Implementations carry no
/// client-side timeout; a hung call stays pending until the transport gives up.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get_profile(&self) -> Result<Option<UserProfile>, RemoteError>;
    async fn save_profile(&self, profile: UserProfile) -> Result<(), RemoteError>;

    async fn list_prescriptions(&self, owner: &OwnerId) -> Result<Vec<Prescription>, RemoteError>;
    async fn get_prescription(&self, id: &RecordId) -> Result<Option<Prescription>, RemoteError>;
    async fn save_prescription(
        &self,
        owner: &OwnerId,
        raw_text: &str,
        analysis: &str,
    ) -> Result<RecordId, RemoteError>;
    async fn delete_prescription(&self, id: &RecordId) -> Result<bool, RemoteError>;

    async fn list_reminders(&self, owner: &OwnerId)
        -> Result<Vec<MedicationReminder>, RemoteError>;
    async fn add_reminder(
        &self,
        owner: &OwnerId,
        medicine_name: &str,
        dosage: &str,
        scheduled_at: UnixTimeMs,
    ) -> Result<RecordId, RemoteError>;
    async fn set_reminder_active(&self, id: &RecordId, active: bool) -> Result<bool, RemoteError>;
    async fn delete_reminder(&self, id: &RecordId) -> Result<bool, RemoteError>;

    async fn list_drug_interactions(
        &self,
        owner: &OwnerId,
    ) -> Result<Vec<DrugInteractionRecord>, RemoteError>;
    async fn save_drug_interaction(
        &self,
        owner: &OwnerId,
        medications: &[String],
        summary: &str,
    ) -> Result<RecordId, RemoteError>;

    async fn list_diet_records(&self, owner: &OwnerId) -> Result<Vec<DietRecord>, RemoteError>;
    async fn save_diet_recommendation(
        &self,
        owner: &OwnerId,
        plan: &str,
    ) -> Result<RecordId, RemoteError>;

    async fn list_hospital_records(
        &self,
        owner: &OwnerId,
    ) -> Result<Vec<HospitalRecord>, RemoteError>;
    async fn save_hospital_search(
        &self,
        owner: &OwnerId,
        location: &str,
        results: &str,
    ) -> Result<RecordId, RemoteError>;

    async fn list_price_records(&self, owner: &OwnerId) -> Result<Vec<PriceRecord>, RemoteError>;
    async fn save_price_comparison(
        &self,
        owner: &OwnerId,
        medicine_name: &str,
        links: &str,
    ) -> Result<RecordId, RemoteError>;

    async fn request_dispatch(&self, location: Coordinate) -> Result<CaseId, RemoteError>;
    /// Zero or one case; an empty reply means the case is not visible (yet).
    async fn get_case(&self, id: &CaseId) -> Result<Vec<EmergencyCase>, RemoteError>;
    async fn list_my_cases(&self) -> Result<Vec<EmergencyCase>, RemoteError>;
    async fn set_case_status(
        &self,
        id: &CaseId,
        status: EmergencyStatus,
    ) -> Result<bool, RemoteError>;
}

/// Builds a caller-bound store handle once the session has resolved an identity.
pub trait RemoteConnector: Send + Sync {
    fn connect(&self, identity: &Identity) -> Arc<dyn RemoteStore>;
}

/// Capability handle to the remote store, bound to the identity it was built for.
#[derive(Clone)]
pub struct RemoteProxy {
    remote: Arc<dyn RemoteStore>,
    caller: Option<OwnerId>,
}

impl RemoteProxy {
    pub fn new(remote: Arc<dyn RemoteStore>, caller: Option<OwnerId>) -> Self {
        Self { remote, caller }
    }

    #[must_use]
    pub fn remote(&self) -> Arc<dyn RemoteStore> {
        Arc::clone(&self.remote)
    }

    #[must_use]
    pub fn caller(&self) -> Option<&OwnerId> {
        self.caller.as_ref()
    }
}

impl fmt::Debug for RemoteProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteProxy")
            .field("caller", &self.caller.as_ref().map(OwnerId::fingerprint))
            .finish_non_exhaustive()
    }
}
