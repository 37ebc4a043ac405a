//! Call operation errors.

use crate::call::{CallId, CallStatus};
use parley_protocol::UserId;
use thiserror::Error;

/// Precondition failures of call operations.
///
/// The signaling loop swallows these; the HTTP layer reports them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// The callee has no live connection.
    #[error("User {0} is not online")]
    Offline(UserId),

    /// Caller and callee are the same identity.
    #[error("Cannot call yourself")]
    SelfCall,

    /// The requested call kind is neither audio nor video.
    #[error("Invalid call type: {0}")]
    InvalidKind(String),

    /// The response is neither accept nor reject.
    #[error("Invalid call response: {0}")]
    InvalidDecision(String),

    /// No session with this id.
    #[error("Call not found: {0}")]
    NotFound(CallId),

    /// Only the callee may answer a ringing call.
    #[error("Only the callee can respond to call {0}")]
    NotCallee(CallId),

    /// The identity is not part of the session.
    #[error("Not a participant of call {0}")]
    NotParticipant(CallId),

    /// The session is not in a state that allows the transition.
    #[error("Call {id} is already {status}")]
    InvalidState { id: CallId, status: CallStatus },
}
