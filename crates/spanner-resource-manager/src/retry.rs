//! Retry policy for the provisioning sequence.
//!
//! Only resource exhaustion on the remote control plane is considered
//! transient. The remote SDK frequently buries the real status inside a
//! generic error message, so besides the typed [`ErrorCode`] the textual
//! `RESOURCE_EXHAUSTED` marker is matched anywhere in the error chain.

use crate::client::{ErrorCode, RemoteError};
use std::error::Error as StdError;
use std::time::Duration;

/// Marker identifying resource exhaustion in error text.
pub const RESOURCE_EXHAUSTED_MARKER: &str = "RESOURCE_EXHAUSTED";

/// Whether `error`, or any error it was caused by, signals resource exhaustion.
pub fn is_transient(error: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(error) = current {
        if let Some(remote) = error.downcast_ref::<RemoteError>() {
            if remote.code() == ErrorCode::ResourceExhausted {
                return true;
            }
        }
        if error.to_string().contains(RESOURCE_EXHAUSTED_MARKER) {
            return true;
        }
        current = error.source();
    }
    false
}

/// How often, and how patiently, the provisioning sequence is re-run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningRetryPolicy {
    /// Re-runs after the first attempt.
    max_retries: u32,
    /// Pause before each re-run.
    backoff: Duration,
}

impl Default for ProvisioningRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            backoff: Self::DEFAULT_BACKOFF,
        }
    }
}

impl ProvisioningRetryPolicy {
    pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

    /// Single retry after `backoff`.
    pub fn with_backoff(backoff: Duration) -> Self {
        Self {
            backoff,
            ..Self::default()
        }
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Whether a failure of attempt number `attempt` (starting at 1) should lead to another run.
    pub fn should_retry(&self, attempt: u32, error: &(dyn StdError + 'static)) -> bool {
        attempt < self.max_attempts() && is_transient(error)
    }
}
