//! Call session types.

use parley_protocol::{CallKind, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A call session identifier.
///
/// Built from a store-wide sequence number and both participants, so the same
/// pair calling each other repeatedly never collides.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// Build the identifier for a new session.
    #[must_use]
    pub fn new(caller: UserId, callee: UserId, seq: u64) -> Self {
        Self(format!("call_{}_{}_{}", caller, callee, seq))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CallId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of a call.
///
/// `Ringing` is initial. `Active` only moves to `Ended`. `Rejected` and
/// `Ended` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Active,
    Rejected,
    Ended,
}

impl CallStatus {
    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Rejected | CallStatus::Ended)
    }

    /// Wire name of the status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Ringing => "ringing",
            CallStatus::Active => "active",
            CallStatus::Rejected => "rejected",
            CallStatus::Ended => "ended",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One call attempt between two identities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSession {
    pub id: CallId,
    pub caller: UserId,
    pub callee: UserId,
    pub kind: CallKind,
    pub status: CallStatus,
    /// When the call started ringing (epoch millis).
    pub created_at: u64,
    /// When the callee accepted.
    pub started_at: Option<u64>,
    /// When the call was rejected or ended.
    pub ended_at: Option<u64>,
    /// Who rejected or ended the call.
    pub ended_by: Option<UserId>,
}

impl CallSession {
    /// Create a ringing session.
    #[must_use]
    pub fn new(id: CallId, caller: UserId, callee: UserId, kind: CallKind) -> Self {
        Self {
            id,
            caller,
            callee,
            kind,
            status: CallStatus::Ringing,
            created_at: now_millis(),
            started_at: None,
            ended_at: None,
            ended_by: None,
        }
    }

    /// Whether the identity is the caller or the callee.
    #[must_use]
    pub fn involves(&self, user: UserId) -> bool {
        self.caller == user || self.callee == user
    }

    /// The participant that is not `user`.
    #[must_use]
    pub fn other_party(&self, user: UserId) -> Option<UserId> {
        if user == self.caller {
            Some(self.callee)
        } else if user == self.callee {
            Some(self.caller)
        } else {
            None
        }
    }

    /// Whether the session reached a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id_format() {
        assert_eq!(CallId::new(1, 2, 7).as_str(), "call_1_2_7");
        assert_ne!(CallId::new(1, 2, 7), CallId::new(1, 2, 8));
        assert_ne!(CallId::new(12, 3, 4), CallId::new(1, 23, 4));
    }

    #[test]
    fn test_session_participants() {
        let session = CallSession::new(CallId::new(1, 2, 1), 1, 2, CallKind::Audio);
        assert_eq!(session.status, CallStatus::Ringing);
        assert!(session.involves(1));
        assert!(session.involves(2));
        assert!(!session.involves(3));
        assert_eq!(session.other_party(1), Some(2));
        assert_eq!(session.other_party(2), Some(1));
        assert_eq!(session.other_party(3), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!CallStatus::Ringing.is_terminal());
        assert!(!CallStatus::Active.is_terminal());
        assert!(CallStatus::Rejected.is_terminal());
        assert!(CallStatus::Ended.is_terminal());
    }

    #[test]
    fn test_session_serializes_status_lowercase() {
        let session = CallSession::new(CallId::from("c"), 1, 2, CallKind::Video);
        let value = serde_json::to_value(&session).unwrap();
        assert_eq!(value["id"], "c");
        assert_eq!(value["status"], "ringing");
        assert_eq!(value["kind"], "video");
    }
}
