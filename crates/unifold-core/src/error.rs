// ── Core error types ──
//
// Errors surfaced by unifold-core. Source adapters report their own
// `SourceError`; the hub tags it with the source name and re-raises it
// from `refresh_all()` once the cycle has otherwise completed.

use thiserror::Error;

/// Error returned by a source adapter.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("refresh failed: {0}")]
    Refresh(String),

    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// Unified error type for the core crate.
#[derive(Debug, Error)]
pub enum CoreError {
    // ── Refresh errors ───────────────────────────────────────────────
    #[error("Source '{source_name}' failed to refresh: {message}")]
    SourceFailed { source_name: String, message: String },

    #[error("Job '{job}' panicked: {message}")]
    JobPanicked { job: String, message: String },

    /// More than one job failed in the same batch. Every failure is kept.
    #[error("{} jobs failed, first: {}", .0.len(), first_message(.0))]
    JobsFailed(Vec<CoreError>),

    // ── Lookup errors ────────────────────────────────────────────────
    #[error("Device not found: {identifier}")]
    DeviceNotFound { identifier: String },

    #[error("Unknown source: {name}")]
    UnknownSource { name: String },

    // ── Routing errors ───────────────────────────────────────────────
    #[error("Malformed payload: {message}")]
    MalformedPayload { message: String },

    #[error("Status item for {device_id} could not be resolved: missing {missing}")]
    Unresolved { device_id: String, missing: String },

    // ── Setup errors ─────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl CoreError {
    /// Flatten into the list of individual failures.
    pub fn into_failures(self) -> Vec<CoreError> {
        match self {
            CoreError::JobsFailed(all) => all,
            other => vec![other],
        }
    }

    /// Collapse a batch of failures: none is `Ok`, one is itself, many are grouped.
    pub(crate) fn from_failures(mut failures: Vec<CoreError>) -> Result<(), CoreError> {
        match failures.len() {
            0 => Ok(()),
            1 => Err(failures.remove(0)),
            _ => Err(CoreError::JobsFailed(failures)),
        }
    }
}

fn first_message(failures: &[CoreError]) -> String {
    failures
        .first()
        .map(ToString::to_string)
        .unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn single_failure_is_not_grouped() {
        let err = CoreError::from_failures(vec![CoreError::UnknownSource { name: "a".into() }])
            .unwrap_err();
        assert!(matches!(err, CoreError::UnknownSource { .. }));
    }

    #[test]
    fn grouped_failures_keep_every_entry() {
        let err = CoreError::from_failures(vec![
            CoreError::UnknownSource { name: "a".into() },
            CoreError::UnknownSource { name: "b".into() },
        ])
        .unwrap_err();
        assert!(err.to_string().starts_with("2 jobs failed"));
        assert_eq!(err.into_failures().len(), 2);
    }

    #[test]
    fn empty_batch_is_ok() {
        assert!(CoreError::from_failures(Vec::new()).is_ok());
    }
}
