use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::model::Coordinate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LocationError {
    #[error("location services are not available on this device")]
    Unsupported,

    #[error("location permission denied")]
    PermissionDenied,

    #[error("position unavailable")]
    Unavailable,

    #[error("timed out waiting for a position fix")]
    Timeout,
}

/// Raw fix reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_m: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionRequest {
    pub high_accuracy: bool,
    pub timeout: Duration,
    /// Zero disables any cached or stale fix.
    pub maximum_age: Duration,
}

impl PositionRequest {
    /// Single fresh high-accuracy fix bounded by `timeout`.
    #[must_use]
    pub const fn one_shot(timeout: Duration) -> Self {
        Self {
            high_accuracy: true,
            timeout,
            maximum_age: Duration::ZERO,
        }
    }
}

#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn current_position(&self, request: &PositionRequest) -> Result<Position, LocationError>;
}

/// Asks the provider for one fix and enforces the request's bound even if the provider ignores it.
pub async fn acquire_position(
    provider: &dyn LocationProvider,
    request: &PositionRequest,
) -> Result<Coordinate, LocationError> {
    let position = tokio::time::timeout(request.timeout, provider.current_position(request))
        .await
        .map_err(|_| LocationError::Timeout)??;

    Coordinate::new(position.latitude, position.longitude).map_err(|e| {
        warn!(error = %e, "device reported an invalid position");
        LocationError::Unavailable
    })
}
