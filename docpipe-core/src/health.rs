//! Health reporting types
//!
//! Circuit breaker state doubles as a health signal for the collaborator it
//! guards, so both live here.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// CIRCUIT STATE
// ============================================================================

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Circuit is half-open, calls are let through until enough succeed or one fails
    HalfOpen,
}

impl CircuitState {
    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            Self::Closed => "Closed",
            Self::Open => "Open",
            Self::HalfOpen => "HalfOpen",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, CircuitStateParseError> {
        match s {
            "Closed" => Ok(Self::Closed),
            "Open" => Ok(Self::Open),
            "HalfOpen" => Ok(Self::HalfOpen),
            _ => Err(CircuitStateParseError(s.to_string())),
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

impl FromStr for CircuitState {
    type Err = CircuitStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

/// Error parsing CircuitState from string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitStateParseError(pub String);

impl fmt::Display for CircuitStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid circuit state: {}", self.0)
    }
}

impl std::error::Error for CircuitStateParseError {}

// ============================================================================
// HEALTH
// ============================================================================

/// Health status for a collaborator or component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Component is fully operational
    Healthy,
    /// Component is operational but degraded
    Degraded,
    /// Component is not operational
    Unhealthy,
    /// Health status is unknown (e.g., not yet checked)
    Unknown,
}

impl From<CircuitState> for HealthStatus {
    fn from(state: CircuitState) -> Self {
        match state {
            CircuitState::Closed => Self::Healthy,
            CircuitState::HalfOpen => Self::Degraded,
            CircuitState::Open => Self::Unhealthy,
        }
    }
}

/// Detailed health check result for a component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub component: String,
    pub message: Option<String>,
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl HealthCheck {
    /// Create a healthy check result.
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            component: component.into(),
            message: None,
            metadata: None,
        }
    }

    /// Create a degraded check result.
    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            component: component.into(),
            message: Some(message.into()),
            metadata: None,
        }
    }

    /// Create an unhealthy check result.
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            component: component.into(),
            message: Some(message.into()),
            metadata: None,
        }
    }

    /// Health of the collaborator guarded by a breaker.
    pub fn for_circuit(
        component: impl Into<String>,
        state: CircuitState,
        consecutive_failures: u32,
        retry_in: Option<Duration>,
    ) -> Self {
        let component = component.into();
        let check = match state {
            CircuitState::Closed => Self::healthy(component),
            CircuitState::HalfOpen => Self::degraded(component, "circuit half-open"),
            CircuitState::Open => Self::unhealthy(component, "circuit open"),
        };
        let check = check
            .with_metadata("circuit_state", state.as_db_str().into())
            .with_metadata("consecutive_failures", consecutive_failures.into());
        match retry_in {
            Some(d) => check.with_metadata("retry_in_ms", (d.as_millis() as u64).into()),
            None => check,
        }
    }

    /// Add metadata.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value);
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Worst status across a set of checks; `Unknown` when there are none.
pub fn aggregate_status<'a>(checks: impl IntoIterator<Item = &'a HealthCheck>) -> HealthStatus {
    let mut worst: Option<HealthStatus> = None;
    for check in checks {
        worst = Some(match (worst, check.status) {
            (_, HealthStatus::Unhealthy) | (Some(HealthStatus::Unhealthy), _) => {
                HealthStatus::Unhealthy
            }
            (_, HealthStatus::Degraded) | (Some(HealthStatus::Degraded), _) => {
                HealthStatus::Degraded
            }
            (_, HealthStatus::Unknown) | (Some(HealthStatus::Unknown), _) => HealthStatus::Unknown,
            _ => HealthStatus::Healthy,
        });
    }
    worst.unwrap_or(HealthStatus::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_state_db_roundtrip() {
        for state in [CircuitState::Closed, CircuitState::Open, CircuitState::HalfOpen] {
            assert_eq!(CircuitState::from_db_str(state.as_db_str()), Ok(state));
        }
        assert!(CircuitState::from_db_str("Ajar").is_err());
    }

    #[test]
    fn test_for_circuit_maps_status() {
        let open = HealthCheck::for_circuit("object-store", CircuitState::Open, 5, None);
        assert_eq!(open.status, HealthStatus::Unhealthy);
        let half = HealthCheck::for_circuit("object-store", CircuitState::HalfOpen, 0, None);
        assert_eq!(half.status, HealthStatus::Degraded);
        let closed = HealthCheck::for_circuit("object-store", CircuitState::Closed, 0, None);
        assert!(closed.is_healthy());
    }

    #[test]
    fn test_for_circuit_metadata() {
        let check = HealthCheck::for_circuit(
            "formatter",
            CircuitState::Open,
            7,
            Some(Duration::from_millis(1500)),
        );
        let metadata = check.metadata.unwrap();
        assert_eq!(metadata["circuit_state"], "Open");
        assert_eq!(metadata["consecutive_failures"], 7);
        assert_eq!(metadata["retry_in_ms"], 1500);
    }

    #[test]
    fn test_aggregate_status() {
        let healthy = HealthCheck::healthy("a");
        let degraded = HealthCheck::degraded("b", "slow");
        let unhealthy = HealthCheck::unhealthy("c", "down");

        assert_eq!(aggregate_status([]), HealthStatus::Unknown);
        assert_eq!(aggregate_status([&healthy]), HealthStatus::Healthy);
        assert_eq!(aggregate_status([&healthy, &degraded]), HealthStatus::Degraded);
        assert_eq!(
            aggregate_status([&degraded, &unhealthy, &healthy]),
            HealthStatus::Unhealthy
        );
    }
}
