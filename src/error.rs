//! Errors surfaced to callers of the session handle

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The runtime task exited; the handle is no longer usable
    #[error("Session runtime has stopped")]
    RuntimeStopped,
}
