//! Read bindings, one per record kind.
//!
//! A binding only describes *what* to read: its kind, the discriminator that
//! selects a cache entry, and the remote call that fills it. Gating, caching,
//! deduplication and polling are handled uniformly by [`crate::SyncClient`].

use async_trait::async_trait;
use std::fmt;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::cache::{Discriminator, QueryKey, RecordKind};
use crate::capabilities::{RemoteError, RemoteStore};
use crate::client::SyncError;
use crate::model::{
    CaseId, DietRecord, DrugInteractionRecord, EmergencyCase, HospitalRecord, MedicationReminder,
    OwnerId, Prescription, PriceRecord, RecordId, UserProfile,
};

#[async_trait]
pub trait QueryDef: Clone + Send + Sync + 'static {
    type Output: Clone + Send + Sync + 'static;

    const KIND: RecordKind;

    /// `None` while the parameter that selects the entry is not known yet.
    fn discriminator(&self) -> Option<Discriminator>;

    async fn fetch(&self, remote: &dyn RemoteStore) -> Result<Self::Output, RemoteError>;

    fn key(&self) -> Option<QueryKey> {
        self.discriminator().map(|d| QueryKey::new(Self::KIND, d))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisabledReason {
    ProxyNotReady,
    DiscriminatorUnknown,
    IdentityAbsent,
    ForeignOwner,
}

impl fmt::Display for DisabledReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ProxyNotReady => "remote proxy not ready",
            Self::DiscriminatorUnknown => "discriminator unknown",
            Self::IdentityAbsent => "no signed-in identity",
            Self::ForeignOwner => "owner is not the signed-in identity",
        })
    }
}

/// What an observed binding currently shows.
#[derive(Debug, Clone)]
pub enum QueryState<T> {
    Disabled(DisabledReason),
    Loading,
    Ready { data: T },
    /// The last good value stays visible after a failed refetch.
    Failed { error: SyncError, last: Option<T> },
}

impl<T> QueryState<T> {
    #[must_use]
    pub fn data(&self) -> Option<&T> {
        match self {
            Self::Ready { data } => Some(data),
            Self::Failed { last, .. } => last.as_ref(),
            Self::Disabled(_) | Self::Loading => None,
        }
    }

    #[must_use]
    pub const fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled(_))
    }

    #[must_use]
    pub const fn is_loading(&self) -> bool {
        matches!(self, Self::Loading)
    }

    #[must_use]
    pub const fn error(&self) -> Option<&SyncError> {
        match self {
            Self::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Handle to an observed binding. Dropping it stops the poll timer and abandons
/// interest in any in-flight fetch; the remote call itself is left to finish.
pub struct Subscription<T> {
    rx: watch::Receiver<QueryState<T>>,
    task: JoinHandle<()>,
}

impl<T: Clone> Subscription<T> {
    pub(crate) fn new(rx: watch::Receiver<QueryState<T>>, task: JoinHandle<()>) -> Self {
        Self { rx, task }
    }

    #[must_use]
    pub fn state(&self) -> QueryState<T> {
        self.rx.borrow().clone()
    }

    #[must_use]
    pub fn receiver(&self) -> watch::Receiver<QueryState<T>> {
        self.rx.clone()
    }

    /// Waits for the next published state. `None` once the binding has stopped.
    pub async fn changed(&mut self) -> Option<QueryState<T>> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(&QueryState<T>) -> bool,
    ) -> Option<QueryState<T>> {
        self.rx
            .wait_for(|state| predicate(state))
            .await
            .ok()
            .map(|state| state.clone())
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("finished", &self.task.is_finished())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Bindings
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct ProfileQuery;

#[async_trait]
impl QueryDef for ProfileQuery {
    type Output = Option<UserProfile>;
    const KIND: RecordKind = RecordKind::Profile;

    fn discriminator(&self) -> Option<Discriminator> {
        Some(Discriminator::Caller)
    }

    async fn fetch(&self, remote: &dyn RemoteStore) -> Result<Self::Output, RemoteError> {
        remote.get_profile().await
    }
}

macro_rules! owner_list_query {
    ($(#[$meta:meta])* $name:ident, $kind:expr, $record:ty, $call:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone)]
        pub struct $name {
            pub owner: Option<OwnerId>,
        }

        impl $name {
            #[must_use]
            pub fn new(owner: Option<OwnerId>) -> Self {
                Self { owner }
            }

            #[must_use]
            pub fn for_owner(owner: &OwnerId) -> Self {
                Self::new(Some(owner.clone()))
            }
        }

        #[async_trait]
        impl QueryDef for $name {
            type Output = Vec<$record>;
            const KIND: RecordKind = $kind;

            fn discriminator(&self) -> Option<Discriminator> {
                self.owner.clone().map(Discriminator::Owner)
            }

            async fn fetch(&self, remote: &dyn RemoteStore) -> Result<Self::Output, RemoteError> {
                match &self.owner {
                    Some(owner) => remote.$call(owner).await,
                    None => Ok(Vec::new()),
                }
            }
        }
    };
}

owner_list_query!(PrescriptionsQuery, RecordKind::Prescriptions, Prescription, list_prescriptions);
owner_list_query!(RemindersQuery, RecordKind::Reminders, MedicationReminder, list_reminders);
owner_list_query!(
    DrugInteractionsQuery,
    RecordKind::DrugInteractions,
    DrugInteractionRecord,
    list_drug_interactions
);
owner_list_query!(DietHistoryQuery, RecordKind::DietHistory, DietRecord, list_diet_records);
owner_list_query!(
    HospitalHistoryQuery,
    RecordKind::HospitalHistory,
    HospitalRecord,
    list_hospital_records
);
owner_list_query!(PriceHistoryQuery, RecordKind::PriceHistory, PriceRecord, list_price_records);

#[derive(Debug, Clone)]
pub struct PrescriptionQuery {
    pub id: Option<RecordId>,
}

#[async_trait]
impl QueryDef for PrescriptionQuery {
    type Output = Option<Prescription>;
    const KIND: RecordKind = RecordKind::Prescription;

    fn discriminator(&self) -> Option<Discriminator> {
        self.id.clone().map(Discriminator::Record)
    }

    async fn fetch(&self, remote: &dyn RemoteStore) -> Result<Self::Output, RemoteError> {
        match &self.id {
            Some(id) => remote.get_prescription(id).await,
            None => Ok(None),
        }
    }
}

/// Status of one dispatch case. Polled.
#[derive(Debug, Clone)]
pub struct EmergencyCaseQuery {
    pub case_id: Option<CaseId>,
}

impl EmergencyCaseQuery {
    #[must_use]
    pub fn new(case_id: &CaseId) -> Self {
        Self {
            case_id: Some(case_id.clone()),
        }
    }
}

#[async_trait]
impl QueryDef for EmergencyCaseQuery {
    /// An empty reply is "no current status", not an error.
    type Output = Option<EmergencyCase>;
    const KIND: RecordKind = RecordKind::EmergencyCase;

    fn discriminator(&self) -> Option<Discriminator> {
        self.case_id.clone().map(Discriminator::Case)
    }

    async fn fetch(&self, remote: &dyn RemoteStore) -> Result<Self::Output, RemoteError> {
        let Some(id) = &self.case_id else {
            return Ok(None);
        };
        Ok(remote.get_case(id).await?.into_iter().next())
    }
}

/// Every case the caller has requested. Polled.
#[derive(Debug, Clone, Default)]
pub struct MyEmergenciesQuery;

#[async_trait]
impl QueryDef for MyEmergenciesQuery {
    type Output = Vec<EmergencyCase>;
    const KIND: RecordKind = RecordKind::MyEmergencies;

    fn discriminator(&self) -> Option<Discriminator> {
        Some(Discriminator::Caller)
    }

    async fn fetch(&self, remote: &dyn RemoteStore) -> Result<Self::Output, RemoteError> {
        remote.list_my_cases().await
    }
}
