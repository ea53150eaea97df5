//! Error types.
//!
//! Validation failures are data, never errors: they live in the error
//! snapshot and in [`SubmitOutcome`](crate::SubmitOutcome). `FormError` only
//! covers the hardened request/reply rounds and failing effect actions.

use crate::core::FieldName;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FormError {
    /// A request/reply round did not complete in time.
    ///
    /// Only returned by the `*_timeout` variants; the plain operations wait
    /// forever for a missing responder.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// An effect action returned an error. Remaining effects for that change
    /// are skipped.
    #[error("effect on field '{field}' failed: {source}")]
    EffectFailed {
        field: FieldName,
        #[source]
        source: anyhow::Error,
    },
}

impl FormError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FormError::Timeout { .. })
    }
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let timeout = FormError::Timeout {
            operation: "submit",
            after: Duration::from_millis(50),
        };
        assert!(timeout.is_timeout());
        assert_eq!(timeout.to_string(), "submit timed out after 50ms");

        let failed = FormError::EffectFailed {
            field: "city".into(),
            source: anyhow::anyhow!("lookup failed"),
        };
        assert!(!failed.is_timeout());
        assert_eq!(
            failed.to_string(),
            "effect on field 'city' failed: lookup failed"
        );
    }
}
