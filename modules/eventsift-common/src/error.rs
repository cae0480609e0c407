//! Typed errors for scrape pipeline operations.

use thiserror::Error;
use uuid::Uuid;

use crate::types::SessionStatus;

/// Errors the pipeline surfaces to callers. The HTTP layer maps these onto
/// status codes: not-found → 404, state violations → 409, bad input → 400.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("session {0} not found")]
    SessionNotFound(Uuid),

    #[error("method {0} not found")]
    MethodNotFound(Uuid),

    #[error("batch {0} not found")]
    BatchNotFound(Uuid),

    /// Approval attempted on a session that is not in `events_found`.
    #[error("session {id} is {status}, only events_found sessions can be approved")]
    NotApprovable { id: Uuid, status: SessionStatus },

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type ScrapeResult<T> = std::result::Result<T, ScrapeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_approvable_names_the_state() {
        let id = Uuid::new_v4();
        let err = ScrapeError::NotApprovable {
            id,
            status: SessionStatus::NoEvents,
        };
        let msg = err.to_string();
        assert!(msg.contains("no_events"), "message was: {msg}");
        assert!(msg.contains(&id.to_string()));
    }
}
