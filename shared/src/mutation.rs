//! Write bindings. Each declares the cache targets it invalidates on success;
//! [`crate::SyncClient::mutate`] is the single place that applies them.

use async_trait::async_trait;

use crate::cache::{Discriminator, Invalidation, QueryKey, RecordKind};
use crate::capabilities::{RemoteError, RemoteStore};
use crate::model::{CaseId, Coordinate, EmergencyStatus, OwnerId, RecordId, UnixTimeMs, UserProfile};

#[async_trait]
pub trait MutationDef: Send + Sync {
    type Output: Send + 'static;

    const NAME: &'static str;

    /// Owner whose records this write touches, if it is owner-scoped.
    fn owner(&self) -> Option<&OwnerId> {
        None
    }

    fn invalidates(&self) -> Vec<Invalidation>;

    async fn execute(&self, remote: &dyn RemoteStore) -> Result<Self::Output, RemoteError>;
}

fn owner_key(kind: RecordKind, owner: &OwnerId) -> Invalidation {
    Invalidation::Key(QueryKey::owner(kind, owner))
}

#[derive(Debug, Clone)]
pub struct SaveProfile {
    pub profile: UserProfile,
}

#[async_trait]
impl MutationDef for SaveProfile {
    type Output = ();
    const NAME: &'static str = "save_profile";

    fn invalidates(&self) -> Vec<Invalidation> {
        vec![Invalidation::Key(QueryKey::new(
            RecordKind::Profile,
            Discriminator::Caller,
        ))]
    }

    async fn execute(&self, remote: &dyn RemoteStore) -> Result<(), RemoteError> {
        remote.save_profile(self.profile.clone()).await
    }
}

#[derive(Debug, Clone)]
pub struct SavePrescription {
    pub owner: OwnerId,
    pub raw_text: String,
    pub analysis: String,
}

#[async_trait]
impl MutationDef for SavePrescription {
    type Output = RecordId;
    const NAME: &'static str = "save_prescription";

    fn owner(&self) -> Option<&OwnerId> {
        Some(&self.owner)
    }

    fn invalidates(&self) -> Vec<Invalidation> {
        vec![owner_key(RecordKind::Prescriptions, &self.owner)]
    }

    async fn execute(&self, remote: &dyn RemoteStore) -> Result<RecordId, RemoteError> {
        remote
            .save_prescription(&self.owner, &self.raw_text, &self.analysis)
            .await
    }
}

#[derive(Debug, Clone)]
pub struct DeletePrescription {
    pub id: RecordId,
    pub owner: OwnerId,
}

#[async_trait]
impl MutationDef for DeletePrescription {
    type Output = bool;
    const NAME: &'static str = "delete_prescription";

    fn owner(&self) -> Option<&OwnerId> {
        Some(&self.owner)
    }

    fn invalidates(&self) -> Vec<Invalidation> {
        vec![
            owner_key(RecordKind::Prescriptions, &self.owner),
            Invalidation::Key(QueryKey::new(
                RecordKind::Prescription,
                Discriminator::Record(self.id.clone()),
            )),
        ]
    }

    async fn execute(&self, remote: &dyn RemoteStore) -> Result<bool, RemoteError> {
        remote.delete_prescription(&self.id).await
    }
}

#[derive(Debug, Clone)]
pub struct AddReminder {
    pub owner: OwnerId,
    pub medicine_name: String,
    pub dosage: String,
    pub scheduled_at: UnixTimeMs,
}

#[async_trait]
impl MutationDef for AddReminder {
    type Output = RecordId;
    const NAME: &'static str = "add_reminder";

    fn owner(&self) -> Option<&OwnerId> {
        Some(&self.owner)
    }

    fn invalidates(&self) -> Vec<Invalidation> {
        vec![owner_key(RecordKind::Reminders, &self.owner)]
    }

    async fn execute(&self, remote: &dyn RemoteStore) -> Result<RecordId, RemoteError> {
        remote
            .add_reminder(&self.owner, &self.medicine_name, &self.dosage, self.scheduled_at)
            .await
    }
}

#[derive(Debug, Clone)]
pub struct SetReminderActive {
    pub id: RecordId,
    pub owner: OwnerId,
    pub active: bool,
}

#[async_trait]
impl MutationDef for SetReminderActive {
    type Output = bool;
    const NAME: &'static str = "set_reminder_active";

    fn owner(&self) -> Option<&OwnerId> {
        Some(&self.owner)
    }

    fn invalidates(&self) -> Vec<Invalidation> {
        vec![owner_key(RecordKind::Reminders, &self.owner)]
    }

    async fn execute(&self, remote: &dyn RemoteStore) -> Result<bool, RemoteError> {
        remote.set_reminder_active(&self.id, self.active).await
    }
}

#[derive(Debug, Clone)]
pub struct DeleteReminder {
    pub id: RecordId,
    pub owner: OwnerId,
}

#[async_trait]
impl MutationDef for DeleteReminder {
    type Output = bool;
    const NAME: &'static str = "delete_reminder";

    fn owner(&self) -> Option<&OwnerId> {
        Some(&self.owner)
    }

    fn invalidates(&self) -> Vec<Invalidation> {
        vec![owner_key(RecordKind::Reminders, &self.owner)]
    }

    async fn execute(&self, remote: &dyn RemoteStore) -> Result<bool, RemoteError> {
        remote.delete_reminder(&self.id).await
    }
}

#[derive(Debug, Clone)]
pub struct SaveDrugInteraction {
    pub owner: OwnerId,
    pub medications: Vec<String>,
    pub summary: String,
}

#[async_trait]
impl MutationDef for SaveDrugInteraction {
    type Output = RecordId;
    const NAME: &'static str = "save_drug_interaction";

    fn owner(&self) -> Option<&OwnerId> {
        Some(&self.owner)
    }

    fn invalidates(&self) -> Vec<Invalidation> {
        vec![owner_key(RecordKind::DrugInteractions, &self.owner)]
    }

    async fn execute(&self, remote: &dyn RemoteStore) -> Result<RecordId, RemoteError> {
        remote
            .save_drug_interaction(&self.owner, &self.medications, &self.summary)
            .await
    }
}

#[derive(Debug, Clone)]
pub struct SaveDietRecommendation {
    pub owner: OwnerId,
    pub plan: String,
}

#[async_trait]
impl MutationDef for SaveDietRecommendation {
    type Output = RecordId;
    const NAME: &'static str = "save_diet_recommendation";

    fn owner(&self) -> Option<&OwnerId> {
        Some(&self.owner)
    }

    fn invalidates(&self) -> Vec<Invalidation> {
        vec![owner_key(RecordKind::DietHistory, &self.owner)]
    }

    async fn execute(&self, remote: &dyn RemoteStore) -> Result<RecordId, RemoteError> {
        remote.save_diet_recommendation(&self.owner, &self.plan).await
    }
}

#[derive(Debug, Clone)]
pub struct SaveHospitalSearch {
    pub owner: OwnerId,
    pub location: String,
    pub results: String,
}

#[async_trait]
impl MutationDef for SaveHospitalSearch {
    type Output = RecordId;
    const NAME: &'static str = "save_hospital_search";

    fn owner(&self) -> Option<&OwnerId> {
        Some(&self.owner)
    }

    fn invalidates(&self) -> Vec<Invalidation> {
        vec![owner_key(RecordKind::HospitalHistory, &self.owner)]
    }

    async fn execute(&self, remote: &dyn RemoteStore) -> Result<RecordId, RemoteError> {
        remote
            .save_hospital_search(&self.owner, &self.location, &self.results)
            .await
    }
}

#[derive(Debug, Clone)]
pub struct SavePriceComparison {
    pub owner: OwnerId,
    pub medicine_name: String,
    /// Serialized pharmacy name to URL mapping.
    pub links: String,
}

#[async_trait]
impl MutationDef for SavePriceComparison {
    type Output = RecordId;
    const NAME: &'static str = "save_price_comparison";

    fn owner(&self) -> Option<&OwnerId> {
        Some(&self.owner)
    }

    fn invalidates(&self) -> Vec<Invalidation> {
        vec![owner_key(RecordKind::PriceHistory, &self.owner)]
    }

    async fn execute(&self, remote: &dyn RemoteStore) -> Result<RecordId, RemoteError> {
        remote
            .save_price_comparison(&self.owner, &self.medicine_name, &self.links)
            .await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RequestAmbulance {
    pub location: Coordinate,
}

#[async_trait]
impl MutationDef for RequestAmbulance {
    type Output = CaseId;
    const NAME: &'static str = "request_dispatch";

    fn invalidates(&self) -> Vec<Invalidation> {
        vec![Invalidation::Kind(RecordKind::MyEmergencies)]
    }

    async fn execute(&self, remote: &dyn RemoteStore) -> Result<CaseId, RemoteError> {
        remote.request_dispatch(self.location).await
    }
}

/// Asks for a transition; the remote side decides whether it happens.
#[derive(Debug, Clone)]
pub struct UpdateEmergencyStatus {
    pub case_id: CaseId,
    pub status: EmergencyStatus,
}

#[async_trait]
impl MutationDef for UpdateEmergencyStatus {
    type Output = bool;
    const NAME: &'static str = "set_case_status";

    fn invalidates(&self) -> Vec<Invalidation> {
        vec![
            Invalidation::Key(QueryKey::case(&self.case_id)),
            Invalidation::Kind(RecordKind::MyEmergencies),
        ]
    }

    async fn execute(&self, remote: &dyn RemoteStore) -> Result<bool, RemoteError> {
        remote.set_case_status(&self.case_id, self.status).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds_of<M: MutationDef>(mutation: &M) -> Vec<RecordKind> {
        mutation
            .invalidates()
            .iter()
            .map(|target| match target {
                Invalidation::Key(key) => key.kind,
                Invalidation::Kind(kind) => *kind,
            })
            .collect()
    }

    #[test]
    fn test_dependency_table() {
        let owner = OwnerId::new("u1");
        let id = RecordId::new("r1");
        let case_id = CaseId::new("c1");
        let location = Coordinate::new(12.97, 77.59).unwrap();

        let table: Vec<(&str, Vec<RecordKind>)> = vec![
            (
                SaveProfile::NAME,
                kinds_of(&SaveProfile {
                    profile: UserProfile::default(),
                }),
            ),
            (
                SavePrescription::NAME,
                kinds_of(&SavePrescription {
                    owner: owner.clone(),
                    raw_text: String::new(),
                    analysis: String::new(),
                }),
            ),
            (
                DeletePrescription::NAME,
                kinds_of(&DeletePrescription {
                    id: id.clone(),
                    owner: owner.clone(),
                }),
            ),
            (
                AddReminder::NAME,
                kinds_of(&AddReminder {
                    owner: owner.clone(),
                    medicine_name: String::new(),
                    dosage: String::new(),
                    scheduled_at: UnixTimeMs(0),
                }),
            ),
            (
                SetReminderActive::NAME,
                kinds_of(&SetReminderActive {
                    id: id.clone(),
                    owner: owner.clone(),
                    active: false,
                }),
            ),
            (
                DeleteReminder::NAME,
                kinds_of(&DeleteReminder {
                    id: id.clone(),
                    owner: owner.clone(),
                }),
            ),
            (
                SaveDrugInteraction::NAME,
                kinds_of(&SaveDrugInteraction {
                    owner: owner.clone(),
                    medications: vec![],
                    summary: String::new(),
                }),
            ),
            (
                SaveDietRecommendation::NAME,
                kinds_of(&SaveDietRecommendation {
                    owner: owner.clone(),
                    plan: String::new(),
                }),
            ),
            (
                SaveHospitalSearch::NAME,
                kinds_of(&SaveHospitalSearch {
                    owner: owner.clone(),
                    location: String::new(),
                    results: String::new(),
                }),
            ),
            (
                SavePriceComparison::NAME,
                kinds_of(&SavePriceComparison {
                    owner: owner.clone(),
                    medicine_name: String::new(),
                    links: String::new(),
                }),
            ),
            (RequestAmbulance::NAME, kinds_of(&RequestAmbulance { location })),
            (
                UpdateEmergencyStatus::NAME,
                kinds_of(&UpdateEmergencyStatus {
                    case_id,
                    status: EmergencyStatus::Arrived,
                }),
            ),
        ];

        use RecordKind::*;
        let expected: Vec<(&str, Vec<RecordKind>)> = vec![
            ("save_profile", vec![Profile]),
            ("save_prescription", vec![Prescriptions]),
            ("delete_prescription", vec![Prescriptions, Prescription]),
            ("add_reminder", vec![Reminders]),
            ("set_reminder_active", vec![Reminders]),
            ("delete_reminder", vec![Reminders]),
            ("save_drug_interaction", vec![DrugInteractions]),
            ("save_diet_recommendation", vec![DietHistory]),
            ("save_hospital_search", vec![HospitalHistory]),
            ("save_price_comparison", vec![PriceHistory]),
            ("request_dispatch", vec![MyEmergencies]),
            ("set_case_status", vec![EmergencyCase, MyEmergencies]),
        ];
        assert_eq!(table, expected);
    }

    #[test]
    fn test_emergency_writes_target_every_case_list() {
        let location = Coordinate::new(0.0, 0.0).unwrap();
        assert_eq!(
            RequestAmbulance { location }.invalidates(),
            vec![Invalidation::Kind(RecordKind::MyEmergencies)]
        );
        let update = UpdateEmergencyStatus {
            case_id: CaseId::new("c9"),
            status: EmergencyStatus::Completed,
        };
        assert!(update.invalidates()[0].matches(&QueryKey::case(&CaseId::new("c9"))));
        assert!(!update.invalidates()[0].matches(&QueryKey::case(&CaseId::new("c8"))));
    }

    #[test]
    fn test_owner_scoped_writes_expose_owner() {
        let owner = OwnerId::new("u1");
        let save = SaveDietRecommendation {
            owner: owner.clone(),
            plan: "low sodium".into(),
        };
        assert_eq!(save.owner(), Some(&owner));
        assert_eq!(
            SaveProfile {
                profile: UserProfile::default()
            }
            .owner(),
            None
        );
    }
}
