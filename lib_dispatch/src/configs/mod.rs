//! # Dispatch Policy
//!
//! Tunables for the assignment lifecycle, read from a JSON5 file. Every field
//! has a default, so an empty object (or no file at all) is a valid policy.
//!
//! ```json5
//! {
//!   // assignments per report before giving up
//!   cancellation_cap: 3,
//!   exclude_cancelled_drivers: true,
//!   notify_mode: "assigned_driver", // or "broadcast"
//!   response_timeout_secs: 120,
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading a policy file.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The file could not be read.
    #[error("I/O error reading policy: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not valid JSON5 or has the wrong shape.
    #[error("Invalid policy file: {0}")]
    Parse(String),
    /// A value is out of range.
    #[error("Invalid policy value: {0}")]
    Invalid(String),
}

/// Who receives the live push for a new assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyMode {
    /// Only the matched driver's connection.
    #[default]
    AssignedDriver,
    /// Every connected responder.
    Broadcast,
}

/// Lifecycle policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchPolicy {
    /// Assignments a report may accumulate before it is given up as Unassignable.
    pub cancellation_cap: u32,
    /// Skip drivers who already cancelled this report when rematching it.
    pub exclude_cancelled_drivers: bool,
    /// Mark a cancelling driver Offline so they leave the available fleet.
    pub release_on_cancel: bool,
    /// Delivery target for new-assignment pushes.
    pub notify_mode: NotifyMode,
    /// Attempts for a transition that hits a transient store failure.
    pub store_retry_attempts: u32,
    /// Base backoff between attempts; doubled after each failure.
    pub store_retry_backoff_ms: u64,
    /// Pending assignments older than this are cancelled by the sweeper. Disabled when unset.
    pub response_timeout_secs: Option<u64>,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            cancellation_cap: 3,
            exclude_cancelled_drivers: true,
            release_on_cancel: false,
            notify_mode: NotifyMode::AssignedDriver,
            store_retry_attempts: 3,
            store_retry_backoff_ms: 50,
            response_timeout_secs: None,
        }
    }
}

impl DispatchPolicy {
    /// Parses a policy from JSON5 text and validates it.
    pub fn from_json5(text: &str) -> Result<Self, PolicyError> {
        let policy: Self = json5::from_str(text).map_err(|e| PolicyError::Parse(e.to_string()))?;
        policy.validate()?;
        Ok(policy)
    }

    /// Reads and validates a policy file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json5(&text)
    }

    /// Rejects values the lifecycle cannot work with.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.cancellation_cap == 0 {
            return Err(PolicyError::Invalid("cancellation_cap must be at least 1".into()));
        }
        if self.store_retry_attempts == 0 {
            return Err(PolicyError::Invalid("store_retry_attempts must be at least 1".into()));
        }
        if self.response_timeout_secs == Some(0) {
            return Err(PolicyError::Invalid("response_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    /// The response timeout, if enabled.
    pub fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout_secs.map(Duration::from_secs)
    }

    /// Backoff before retry number `attempt` (1-based).
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(6);
        Duration::from_millis(self.store_retry_backoff_ms.saturating_mul(factor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_object_yields_defaults() {
        let policy = DispatchPolicy::from_json5("{}").unwrap();
        assert_eq!(policy, DispatchPolicy::default());
        assert_eq!(policy.cancellation_cap, 3);
        assert!(policy.exclude_cancelled_drivers);
        assert!(policy.response_timeout().is_none());
    }

    #[test]
    fn loads_json5_file_with_comments() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "{{\n  // tighter cap\n  cancellation_cap: 2,\n  notify_mode: 'broadcast',\n  response_timeout_secs: 90,\n}}"
        )
        .unwrap();

        let policy = DispatchPolicy::load(file.path()).unwrap();
        assert_eq!(policy.cancellation_cap, 2);
        assert_eq!(policy.notify_mode, NotifyMode::Broadcast);
        assert_eq!(policy.response_timeout(), Some(Duration::from_secs(90)));
        assert_eq!(policy.store_retry_attempts, 3);
    }

    #[test]
    fn zero_cap_is_rejected() {
        let err = DispatchPolicy::from_json5("{ cancellation_cap: 0 }").unwrap_err();
        assert!(matches!(err, PolicyError::Invalid(_)));
    }

    #[test]
    fn unknown_notify_mode_is_a_parse_error() {
        let err = DispatchPolicy::from_json5("{ notify_mode: 'carrier_pigeon' }").unwrap_err();
        assert!(matches!(err, PolicyError::Parse(_)));
    }

    #[test]
    fn backoff_doubles() {
        let policy = DispatchPolicy::default();
        assert_eq!(policy.retry_backoff(1), Duration::from_millis(50));
        assert_eq!(policy.retry_backoff(2), Duration::from_millis(100));
        assert_eq!(policy.retry_backoff(3), Duration::from_millis(200));
    }
}
