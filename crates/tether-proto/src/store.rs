//! Collaborator contract for the conversation store.
//!
//! The supervisor only needs to remember one thing per session: the agent-side
//! conversation id it can later resume. Message history and everything else
//! the store keeps is outside this contract.

/// Errors raised by a [`ResumeStore`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed store contents: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Get/set of the resumable conversation id per UI session.
///
/// Implementations must be cheap to call from the event path; the supervisor
/// invokes `set_resume_id` while processing an agent's init event.
pub trait ResumeStore: Send + Sync {
    /// Returns the stored resume id for a session, if any.
    fn resume_id(&self, session_id: &str) -> Option<String>;

    /// Records the resume id for a session, replacing any previous value.
    fn set_resume_id(&self, session_id: &str, resume_id: &str) -> Result<(), StoreError>;
}
