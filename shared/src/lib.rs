// lib.rs - health record sync layer and emergency dispatch tracker

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod cache;
pub mod capabilities;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod model;
pub mod mutation;
pub mod query;
pub mod session;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tools;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use cache::{
    CacheEvent, Discriminator, FetchTicket, Invalidation, QueryKey, RecordCache, RecordKind,
    WriteOutcome,
};
pub use capabilities::{
    LocationError, LocationProvider, RemoteConnector, RemoteError, RemoteProxy, RemoteStore,
};
pub use client::{SyncClient, SyncError, SyncMetricsSnapshot};
pub use config::{ConfigError, SyncConfig};
pub use dispatch::{DispatchController, DispatchError, DispatchPhase, DispatchView, TrackingView};
pub use model::*;
pub use mutation::MutationDef;
pub use query::{DisabledReason, QueryDef, QueryState, Subscription};
pub use session::{Identity, LoginPhase, Session, SessionError, SessionSnapshot};
pub use tools::ToolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    NotReady,
    Authentication,
    Authorization,
    Validation,
    NotFound,
    Conflict,
    Rejected,
    Serialization,
    Deserialization,
    Location,
    LocationPermissionDenied,
    FeatureUnavailable,
    InvalidState,
    Internal,
    Unknown,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::NotReady => "NOT_READY",
            Self::Authentication => "AUTH_ERROR",
            Self::Authorization => "FORBIDDEN",
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::Rejected => "REJECTED",
            Self::Serialization => "SERIALIZATION_ERROR",
            Self::Deserialization => "DESERIALIZATION_ERROR",
            Self::Location => "LOCATION_ERROR",
            Self::LocationPermissionDenied => "LOCATION_PERMISSION_DENIED",
            Self::FeatureUnavailable => "FEATURE_UNAVAILABLE",
            Self::InvalidState => "INVALID_STATE",
            Self::Internal => "INTERNAL_ERROR",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Network | Self::Timeout | Self::NotReady | Self::Conflict | Self::Location => {
                ErrorSeverity::Transient
            }

            Self::Serialization | Self::Deserialization | Self::Internal | Self::InvalidState => {
                ErrorSeverity::Fatal
            }

            Self::Authentication
            | Self::Authorization
            | Self::Validation
            | Self::NotFound
            | Self::Rejected
            | Self::LocationPermissionDenied
            | Self::FeatureUnavailable
            | Self::Unknown => ErrorSeverity::Permanent,
        }
    }

    /// Whether the user may simply try again. Nothing in this crate retries on its own.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::NotReady | Self::Conflict | Self::Location
        )
    }
}

/// UI-facing error. Every subsystem error converts into it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub internal_message: Option<String>,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            internal_message: None,
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal_message = Some(internal.into());
        self
    }

    #[must_use]
    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable() && !matches!(self.severity, ErrorSeverity::Fatal)
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::Network => {
                "Unable to connect. Please check your internet connection and try again.".into()
            }
            ErrorKind::Timeout => "The request timed out. Please try again.".into(),
            ErrorKind::NotReady => "Still connecting. Please try again in a moment.".into(),
            ErrorKind::Authentication => "Please sign in again to continue.".into(),
            ErrorKind::Authorization => {
                "You don't have permission to perform this action.".into()
            }
            ErrorKind::Validation | ErrorKind::FeatureUnavailable | ErrorKind::Rejected => {
                self.message.clone()
            }
            ErrorKind::NotFound => "The requested item could not be found.".into(),
            ErrorKind::Conflict => {
                "This action is already in progress. Please wait for it to finish.".into()
            }
            ErrorKind::Serialization | ErrorKind::Deserialization => {
                "A data error occurred. Please contact support if this persists.".into()
            }
            ErrorKind::Location => {
                "Unable to retrieve your location. Please ensure location services are enabled."
                    .into()
            }
            ErrorKind::LocationPermissionDenied => {
                "Location access is required. Please enable location permissions in Settings."
                    .into()
            }
            ErrorKind::InvalidState => {
                "The app is in an invalid state. Please restart the app.".into()
            }
            ErrorKind::Internal | ErrorKind::Unknown => {
                "An unexpected error occurred. Please try again or contact support.".into()
            }
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {internal})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<RemoteError> for AppError {
    fn from(e: RemoteError) -> Self {
        let kind = match &e {
            RemoteError::Rejected(_) => ErrorKind::Rejected,
            RemoteError::Transport(_) => ErrorKind::Network,
            RemoteError::Malformed(_) => ErrorKind::Deserialization,
        };
        AppError::new(kind, "The server could not complete this request.").with_internal(e.to_string())
    }
}

impl From<SyncError> for AppError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::ProxyNotReady => AppError::new(ErrorKind::NotReady, "Remote store not ready"),
            SyncError::RemoteCallFailed { operation, source } => {
                AppError::from(source).with_context("operation", operation)
            }
            SyncError::FetchAbandoned { kind } => {
                AppError::new(ErrorKind::NotReady, "Request abandoned after a session change")
                    .with_context("record_kind", kind.as_str())
            }
            SyncError::CacheTypeMismatch { kind } => {
                AppError::new(ErrorKind::Internal, "Cached record has an unexpected shape")
                    .with_context("record_kind", kind.as_str())
            }
            SyncError::ForeignOwner { owner } => {
                AppError::new(ErrorKind::Authorization, "Records belong to another account")
                    .with_context("owner", owner)
            }
        }
    }
}

impl From<LocationError> for AppError {
    fn from(e: LocationError) -> Self {
        match e {
            LocationError::PermissionDenied => {
                AppError::new(ErrorKind::LocationPermissionDenied, e.to_string())
            }
            LocationError::Unsupported => AppError::new(
                ErrorKind::FeatureUnavailable,
                "Location services are not available on this device.",
            ),
            LocationError::Unavailable | LocationError::Timeout => {
                AppError::new(ErrorKind::Location, e.to_string())
            }
        }
    }
}

impl From<DispatchError> for AppError {
    fn from(e: DispatchError) -> Self {
        let message = e.user_message();
        let base = match e {
            DispatchError::InProgress => AppError::new(ErrorKind::Conflict, message.clone()),
            DispatchError::Location(inner) => AppError::from(inner),
            DispatchError::Remote(inner) => AppError::from(inner),
        };
        AppError {
            message,
            ..base
        }
    }
}

impl From<SessionError> for AppError {
    fn from(e: SessionError) -> Self {
        let kind = match e {
            SessionError::AlreadyAuthenticating | SessionError::AlreadyAuthenticated => {
                ErrorKind::Conflict
            }
            SessionError::NotAuthenticating => ErrorKind::Authentication,
        };
        AppError::new(kind, e.to_string())
    }
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        AppError::new(ErrorKind::Validation, e.to_string())
    }
}

impl From<CoordinateError> for AppError {
    fn from(e: CoordinateError) -> Self {
        AppError::new(ErrorKind::Validation, e.to_string())
    }
}

impl From<ToolError> for AppError {
    fn from(e: ToolError) -> Self {
        match e {
            ToolError::Sync(inner) => AppError::from(inner),
            ToolError::Serialization(_) => {
                AppError::new(ErrorKind::Serialization, "Could not save the result")
                    .with_internal(e.to_string())
            }
            ToolError::InvalidLink(_) => {
                AppError::new(ErrorKind::Internal, "Could not build pharmacy link")
                    .with_internal(e.to_string())
            }
            ToolError::TooFewMedicines { .. }
            | ToolError::TooManyMedicines { .. }
            | ToolError::EmptyMedicineName
            | ToolError::MissingName
            | ToolError::InvalidEmail => AppError::new(ErrorKind::Validation, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_failure_is_retryable() {
        let err = AppError::from(SyncError::RemoteCallFailed {
            operation: "list_prescriptions",
            source: RemoteError::Transport("reset".into()),
        });
        assert_eq!(err.kind, ErrorKind::Network);
        assert!(err.is_retryable());
        assert_eq!(err.context.get("operation").map(String::as_str), Some("list_prescriptions"));
        assert!(err.internal_message.unwrap().contains("reset"));
    }

    #[test]
    fn test_location_errors_map_to_location_kinds() {
        assert_eq!(
            AppError::from(LocationError::PermissionDenied).kind,
            ErrorKind::LocationPermissionDenied
        );
        let timeout = AppError::from(LocationError::Timeout);
        assert_eq!(timeout.kind, ErrorKind::Location);
        assert_eq!(
            timeout.user_facing_message(),
            "Unable to retrieve your location. Please ensure location services are enabled."
        );
    }

    #[test]
    fn test_dispatch_error_keeps_user_message() {
        let err = AppError::from(DispatchError::Remote(SyncError::RemoteCallFailed {
            operation: "request_dispatch",
            source: RemoteError::Rejected("sign in required".into()),
        }));
        assert_eq!(err.kind, ErrorKind::Rejected);
        assert_eq!(err.user_facing_message(), "Failed to request ambulance. Please try again.");
        assert_eq!(AppError::from(DispatchError::InProgress).code(), "CONFLICT");
    }

    #[test]
    fn test_validation_errors_surface_their_message() {
        let err = AppError::from(ToolError::InvalidEmail);
        assert_eq!(err.user_facing_message(), "Please enter a valid email address");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_display_includes_code_and_internal() {
        let err = AppError::new(ErrorKind::Internal, "boom").with_internal("cache slot");
        assert_eq!(err.to_string(), "[INTERNAL_ERROR] boom (internal: cache slot)");
    }
}
