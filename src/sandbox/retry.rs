use thiserror::Error;

use super::provider::ProviderError;

/// Retry eligibility of a provider operation.
///
/// Safe operations are idempotent (listing, metadata, file I/O, snapshot
/// management, start/stop) and may be replayed on transient failures. Unsafe
/// operations (code execution) can leave partial side effects behind, so the
/// gate never replays them on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    Safe,
    Unsafe,
}

pub const MAX_ATTEMPTS: u32 = 5;
pub const INITIAL_BACKOFF_MS: u64 = 250;

#[derive(Debug, Error)]
pub enum SandboxError {
    /// A transient transport failure on a non-retryable operation. The caller
    /// decides whether the logical operation itself is safe to re-run;
    /// `reconnected` says whether the gate already restored the connection.
    #[error("sandbox disconnected during command execution; {}", transient_hint(.reconnected))]
    Transient { reconnected: bool },
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("sandbox not initialized")]
    NotInitialized,
    #[error("cannot reconnect to sandbox in state {0}; expected stopped or started")]
    InvalidState(String),
    #[error("failed to find sandbox {sandbox_id}; it may have been deleted: {message}")]
    Missing {
        sandbox_id: String,
        message: String,
    },
    /// A request refused before reaching the provider (path validation, edit
    /// preconditions).
    #[error("{0}")]
    Rejected(String),
}

fn transient_hint(reconnected: &bool) -> &'static str {
    if *reconnected {
        "sandbox reconnected, please retry"
    } else {
        "please retry after recovery"
    }
}

impl SandboxError {
    pub fn is_transient(&self) -> bool {
        match self {
            SandboxError::Transient { .. } => true,
            SandboxError::Provider(e) => e.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_variant_carries_reconnect_state() {
        let err = SandboxError::Transient { reconnected: true };
        assert!(err.is_transient());
        assert!(err.to_string().contains("sandbox reconnected"));

        let err = SandboxError::Transient { reconnected: false };
        assert!(err.to_string().contains("after recovery"));
    }

    #[test]
    fn provider_transience_passes_through() {
        let err = SandboxError::Provider(ProviderError::Timeout);
        assert!(err.is_transient());
        let err = SandboxError::Provider(ProviderError::Other("denied".into()));
        assert!(!err.is_transient());
    }
}
