//! Informational tools whose results are shown immediately and then logged to
//! the caller's history as a secondary write.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

use crate::client::{SyncClient, SyncError};
use crate::model::UserProfile;
use crate::mutation::{SaveDrugInteraction, SavePriceComparison, SaveProfile};
use crate::query::QueryState;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error("enter at least {min} medicines")]
    TooFewMedicines { min: usize },

    #[error("at most {max} medicines can be checked at once")]
    TooManyMedicines { max: usize },

    #[error("medicine name is empty")]
    EmptyMedicineName,

    #[error("name is required")]
    MissingName,

    #[error("Please enter a valid email address")]
    InvalidEmail,

    #[error("could not build pharmacy link: {0}")]
    InvalidLink(String),

    #[error("could not serialize links: {0}")]
    Serialization(String),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

// ============================================================================
// Drug interactions
// ============================================================================

pub const MIN_MEDICINES: usize = 2;
pub const MAX_MEDICINES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionSeverity {
    Moderate,
    Severe,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InteractionWarning {
    pub first: String,
    pub second: String,
    pub severity: InteractionSeverity,
}

impl fmt::Display for InteractionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.severity {
            InteractionSeverity::Severe => write!(
                f,
                "Severe interaction between {} and {}: May cause serious adverse effects. Consult your doctor immediately.",
                self.first, self.second
            ),
            InteractionSeverity::Moderate => write!(
                f,
                "Moderate interaction between {} and {}: May increase drowsiness or reduce effectiveness. Monitor closely.",
                self.first, self.second
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InteractionReport {
    pub medications: Vec<String>,
    pub warnings: Vec<InteractionWarning>,
}

impl InteractionReport {
    #[must_use]
    pub fn summary(&self) -> String {
        self.warnings
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

/// Pairwise screening of 2 to 5 medicines. Blank entries are ignored.
pub fn check_interactions<S: AsRef<str>>(medicines: &[S]) -> Result<InteractionReport, ToolError> {
    let medications: Vec<String> = medicines
        .iter()
        .map(|m| m.as_ref().trim())
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect();
    if medications.len() < MIN_MEDICINES {
        return Err(ToolError::TooFewMedicines { min: MIN_MEDICINES });
    }
    if medications.len() > MAX_MEDICINES {
        return Err(ToolError::TooManyMedicines { max: MAX_MEDICINES });
    }

    let mut warnings = Vec::new();
    for (i, first) in medications.iter().enumerate() {
        for (j, second) in medications.iter().enumerate().skip(i + 1) {
            let severity = if (i + j) % 3 == 0 {
                InteractionSeverity::Severe
            } else {
                InteractionSeverity::Moderate
            };
            warnings.push(InteractionWarning {
                first: first.clone(),
                second: second.clone(),
                severity,
            });
        }
    }
    Ok(InteractionReport {
        medications,
        warnings,
    })
}

/// Runs the check and, when signed in, logs it to the interaction history.
#[instrument(skip(client, medicines))]
pub async fn check_and_record<S: AsRef<str>>(
    client: &SyncClient,
    medicines: &[S],
) -> Result<InteractionReport, ToolError> {
    let report = check_interactions(medicines)?;
    match client.session().principal() {
        Some(owner) => {
            let save = SaveDrugInteraction {
                owner,
                medications: report.medications.clone(),
                summary: report.summary(),
            };
            client.record_history(&save).await;
        }
        None => debug!("anonymous check; history not saved"),
    }
    Ok(report)
}

// ============================================================================
// Price comparison
// ============================================================================

const PHARMACIES: [(&str, &str, &str); 3] = [
    ("1mg (Tata)", "https://www.1mg.com/search/all", "name"),
    ("PharmEasy", "https://pharmeasy.in/search/all", "name"),
    ("Netmeds", "https://www.netmeds.com/catalogsearch/result", "q"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PharmacyLink {
    pub pharmacy: &'static str,
    pub url: Url,
}

/// Percent-encodes like a browser's `encodeURIComponent`: spaces become
/// `%20`, never `+`, and `!*'()` stay literal.
fn encode_uri_component(value: &str) -> String {
    urlencoding::encode(value)
        .replace("%21", "!")
        .replace("%2A", "*")
        .replace("%27", "'")
        .replace("%28", "(")
        .replace("%29", ")")
}

pub fn pharmacy_links(medicine: &str) -> Result<Vec<PharmacyLink>, ToolError> {
    let medicine = medicine.trim();
    if medicine.is_empty() {
        return Err(ToolError::EmptyMedicineName);
    }
    let encoded = encode_uri_component(medicine);
    PHARMACIES
        .iter()
        .map(|&(pharmacy, base, param)| {
            Url::parse(&format!("{base}?{param}={encoded}"))
                .map(|url| PharmacyLink { pharmacy, url })
                .map_err(|e| ToolError::InvalidLink(e.to_string()))
        })
        .collect()
}

/// JSON object pharmacy name → search URL, as stored in price history.
pub fn serialize_links(links: &[PharmacyLink]) -> Result<String, ToolError> {
    let map: BTreeMap<&str, &str> = links.iter().map(|l| (l.pharmacy, l.url.as_str())).collect();
    serde_json::to_string(&map).map_err(|e| ToolError::Serialization(e.to_string()))
}

#[instrument(skip(client))]
pub async fn compare_and_record(
    client: &SyncClient,
    medicine: &str,
) -> Result<Vec<PharmacyLink>, ToolError> {
    let links = pharmacy_links(medicine)?;
    if let Some(owner) = client.session().principal() {
        let save = SavePriceComparison {
            owner,
            medicine_name: medicine.trim().to_string(),
            links: serialize_links(&links)?,
        };
        client.record_history(&save).await;
    }
    Ok(links)
}

// ============================================================================
// Profile setup
// ============================================================================

/// Empty is accepted; otherwise `local@domain.tld` without whitespace.
pub fn validate_email(email: &str) -> Result<(), ToolError> {
    let email = email.trim();
    if email.is_empty() {
        return Ok(());
    }
    let valid_part = |s: &str| !s.is_empty() && !s.contains(|c: char| c.is_whitespace() || c == '@');
    let Some((local, domain)) = email.split_once('@') else {
        return Err(ToolError::InvalidEmail);
    };
    let has_dotted_domain = domain
        .char_indices()
        .any(|(i, c)| c == '.' && i > 0 && i + 1 < domain.len());
    if valid_part(local) && valid_part(domain) && has_dotted_domain {
        Ok(())
    } else {
        Err(ToolError::InvalidEmail)
    }
}

/// Signed in, profile fetched, and nothing stored yet.
#[must_use]
pub fn needs_profile_setup(signed_in: bool, profile: &QueryState<Option<UserProfile>>) -> bool {
    signed_in && matches!(profile, QueryState::Ready { data: None })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileDraft {
    pub name: String,
    pub email: String,
}

impl ProfileDraft {
    pub fn into_profile(self) -> Result<UserProfile, ToolError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(ToolError::MissingName);
        }
        validate_email(&self.email)?;
        Ok(UserProfile {
            name: name.to_string(),
            email: self.email.trim().to_string(),
        })
    }

    /// Primary write: failures are returned. `false` when the proxy is not ready.
    pub async fn submit(self, client: &SyncClient) -> Result<bool, ToolError> {
        let profile = self.into_profile()?;
        Ok(client.mutate(&SaveProfile { profile }).await?.is_some())
    }
}
