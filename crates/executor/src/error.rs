use std::time::Duration;

use conduit_provider::ProviderError;
use thiserror::Error;

/// Final failure of a dispatch after all permitted attempts.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The provider returned an error on the last attempt.
    #[error("{error} (after {attempts} attempt(s))")]
    Failed {
        error: ProviderError,
        attempts: u32,
    },

    /// The last attempt did not finish within its deadline.
    #[error("timed out after {after:?} (after {attempts} attempt(s))")]
    TimedOut { after: Duration, attempts: u32 },

    /// The executor has been shut down.
    #[error("executor is closed")]
    Closed,
}

impl ExecutionError {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Failed { attempts, .. } | Self::TimedOut { attempts, .. } => *attempts,
            Self::Closed => 0,
        }
    }

    /// Whether the same request could succeed later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Failed { error, .. } => error.is_retryable(),
            Self::TimedOut { .. } => true,
            Self::Closed => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::TimedOut { .. }
                | Self::Failed {
                    error: ProviderError::Timeout(_),
                    ..
                }
        )
    }
}
