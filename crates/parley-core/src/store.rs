//! Call session store.
//!
//! Owns every call session and applies the state machine:
//!
//! ```text
//! ringing ──accept──▶ active ──end──▶ ended
//!    │
//!    ├──reject──▶ rejected
//!    └──end─────▶ ended
//! ```
//!
//! Each transition checks and mutates one session while holding that
//! session's map entry, so racing transitions on the same call resolve to
//! exactly one winner. Transitions return the notification the caller must
//! deliver; the store itself never routes.

use crate::call::{now_millis, CallId, CallSession, CallStatus};
use crate::error::CallError;
use dashmap::DashMap;
use parley_protocol::{CallDecision, CallKind, ServerEvent, UserId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error};

/// Default retention of terminal sessions.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(300);

/// A completed transition and the notification it owes.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// The session after the transition.
    pub session: CallSession,
    /// The participant to notify.
    pub notify: UserId,
    /// The envelope to deliver.
    pub event: ServerEvent,
}

/// In-memory store of call sessions.
#[derive(Debug)]
pub struct CallStore {
    sessions: DashMap<CallId, CallSession>,
    next_seq: AtomicU64,
    retention: Duration,
}

impl CallStore {
    /// Create a store with the default retention.
    #[must_use]
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    /// Create a store that keeps terminal sessions for `retention`.
    #[must_use]
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            next_seq: AtomicU64::new(0),
            retention,
        }
    }

    /// Create a ringing session with a fresh id.
    ///
    /// Preconditions (callee online, distinct participants) are the caller's
    /// responsibility.
    pub fn create(&self, caller: UserId, callee: UserId, kind: CallKind) -> CallSession {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let session = CallSession::new(CallId::new(caller, callee, seq), caller, callee, kind);
        self.sessions.insert(session.id.clone(), session.clone());
        debug!(call = %session.id, caller = caller, callee = callee, kind = %kind, "Call created");
        session
    }

    /// Remove a session outright, whatever its state.
    pub fn discard(&self, id: &CallId) -> Option<CallSession> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    /// Get a snapshot of a session.
    #[must_use]
    pub fn get(&self, id: &CallId) -> Option<CallSession> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Accept or reject a ringing call on behalf of its callee.
    ///
    /// # Errors
    ///
    /// Fails without side effects if the session is unknown, `user` is not
    /// the callee, or the session is no longer ringing.
    pub fn respond(
        &self,
        id: &CallId,
        user: UserId,
        decision: CallDecision,
    ) -> Result<Transition, CallError> {
        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| CallError::NotFound(id.clone()))?;
        let session = entry.value_mut();

        if session.callee != user {
            return Err(CallError::NotCallee(id.clone()));
        }
        if session.status != CallStatus::Ringing {
            return Err(CallError::InvalidState {
                id: id.clone(),
                status: session.status,
            });
        }

        let now = now_millis();
        let event = match decision {
            CallDecision::Accept => {
                session.status = CallStatus::Active;
                session.started_at = Some(now);
                ServerEvent::CallAccepted {
                    call_id: id.to_string(),
                    kind: session.kind,
                }
            }
            CallDecision::Reject => {
                session.status = CallStatus::Rejected;
                session.ended_at = Some(now);
                session.ended_by = Some(user);
                ServerEvent::CallRejected {
                    call_id: id.to_string(),
                }
            }
        };

        debug!(call = %id, user = user, status = %session.status, "Call answered");
        Ok(Transition {
            notify: session.caller,
            session: session.clone(),
            event,
        })
    }

    /// End a ringing or active call on behalf of a participant.
    ///
    /// Ending a ringing call cancels it.
    ///
    /// # Errors
    ///
    /// Fails without side effects if the session is unknown, `user` is not a
    /// participant, or the session is already terminal.
    pub fn end(&self, id: &CallId, user: UserId) -> Result<Transition, CallError> {
        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| CallError::NotFound(id.clone()))?;
        let session = entry.value_mut();

        let Some(other) = session.other_party(user) else {
            return Err(CallError::NotParticipant(id.clone()));
        };
        if session.is_terminal() {
            return Err(CallError::InvalidState {
                id: id.clone(),
                status: session.status,
            });
        }
        if other == user {
            error!(call = %id, user = user, "Call session has the same identity on both sides");
        }

        session.status = CallStatus::Ended;
        session.ended_at = Some(now_millis());
        session.ended_by = Some(user);

        debug!(call = %id, user = user, "Call ended");
        Ok(Transition {
            notify: other,
            session: session.clone(),
            event: ServerEvent::CallEnded {
                call_id: id.to_string(),
                ended_by: user,
            },
        })
    }

    /// End every live call of a disconnecting identity.
    ///
    /// Sessions that reach a terminal state concurrently are skipped.
    pub fn end_all_for(&self, user: UserId) -> Vec<Transition> {
        let ids: Vec<CallId> = self
            .sessions
            .iter()
            .filter(|entry| entry.involves(user) && !entry.is_terminal())
            .map(|entry| entry.key().clone())
            .collect();

        ids.into_iter()
            .filter_map(|id| match self.end(&id, user) {
                Ok(transition) => Some(transition),
                Err(e) => {
                    debug!(call = %id, user = user, error = %e, "Cascade lost race");
                    None
                }
            })
            .collect()
    }

    /// Live (ringing or active) sessions of an identity, oldest first.
    #[must_use]
    pub fn active_for(&self, user: UserId) -> Vec<CallSession> {
        let mut sessions: Vec<CallSession> = self
            .sessions
            .iter()
            .filter(|entry| entry.involves(user) && !entry.is_terminal())
            .map(|entry| entry.value().clone())
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        sessions
    }

    /// Evict terminal sessions that ended more than the retention ago.
    ///
    /// Returns the number of evicted sessions.
    pub fn prune_terminal(&self, now: u64) -> usize {
        let retention_ms = self.retention.as_millis() as u64;
        let mut removed = 0;
        self.sessions.retain(|_, session| {
            let expired = session.is_terminal()
                && session
                    .ended_at
                    .map_or(true, |ended| now.saturating_sub(ended) >= retention_ms);
            if expired {
                removed += 1;
            }
            !expired
        });
        if removed > 0 {
            debug!(removed = removed, "Pruned terminal calls");
        }
        removed
    }

    /// Number of stored sessions, terminal ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of ringing or active sessions.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.sessions.iter().filter(|e| !e.is_terminal()).count()
    }
}

impl Default for CallStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    #[test]
    fn test_accept_notifies_caller() {
        let store = CallStore::new();
        let session = store.create(1, 2, CallKind::Audio);

        let t = store.respond(&session.id, 2, CallDecision::Accept).unwrap();
        assert_eq!(t.notify, 1);
        assert_eq!(t.session.status, CallStatus::Active);
        assert!(t.session.started_at.is_some());
        assert_eq!(
            t.event,
            ServerEvent::CallAccepted {
                call_id: session.id.to_string(),
                kind: CallKind::Audio,
            }
        );
    }

    #[test]
    fn test_accept_only_once() {
        let store = CallStore::new();
        let session = store.create(1, 2, CallKind::Video);

        store.respond(&session.id, 2, CallDecision::Accept).unwrap();
        assert!(matches!(
            store.respond(&session.id, 2, CallDecision::Accept),
            Err(CallError::InvalidState { status: CallStatus::Active, .. })
        ));
        assert!(store.respond(&session.id, 2, CallDecision::Reject).is_err());
        assert_eq!(store.get(&session.id).unwrap().status, CallStatus::Active);
    }

    #[test]
    fn test_reject_from_ringing() {
        let store = CallStore::new();
        let session = store.create(1, 2, CallKind::Audio);

        let t = store.respond(&session.id, 2, CallDecision::Reject).unwrap();
        assert_eq!(t.notify, 1);
        assert_eq!(t.session.status, CallStatus::Rejected);
        assert!(t.session.ended_at.is_some());
        assert!(matches!(t.event, ServerEvent::CallRejected { .. }));

        // Terminal: nothing moves it any more
        assert!(store.end(&session.id, 1).is_err());
        assert!(store.respond(&session.id, 2, CallDecision::Accept).is_err());
    }

    #[test]
    fn test_respond_mismatches_leave_session_untouched() {
        let store = CallStore::new();
        let session = store.create(1, 2, CallKind::Audio);

        assert_eq!(
            store.respond(&session.id, 1, CallDecision::Accept),
            Err(CallError::NotCallee(session.id.clone()))
        );
        assert_eq!(
            store.respond(&session.id, 3, CallDecision::Reject),
            Err(CallError::NotCallee(session.id.clone()))
        );
        let unknown = CallId::from("call_9_9_9");
        assert_eq!(
            store.respond(&unknown, 2, CallDecision::Accept),
            Err(CallError::NotFound(unknown))
        );
        assert_eq!(store.get(&session.id).unwrap().status, CallStatus::Ringing);
    }

    #[test]
    fn test_end_ringing_is_cancel() {
        let store = CallStore::new();
        let session = store.create(1, 2, CallKind::Audio);

        let t = store.end(&session.id, 1).unwrap();
        assert_eq!(t.notify, 2);
        assert_eq!(t.session.status, CallStatus::Ended);
        assert_eq!(t.session.ended_by, Some(1));
        assert_eq!(
            t.event,
            ServerEvent::CallEnded {
                call_id: session.id.to_string(),
                ended_by: 1,
            }
        );
    }

    #[test]
    fn test_end_by_non_participant() {
        let store = CallStore::new();
        let session = store.create(1, 2, CallKind::Audio);
        store.respond(&session.id, 2, CallDecision::Accept).unwrap();

        assert_eq!(
            store.end(&session.id, 3),
            Err(CallError::NotParticipant(session.id.clone()))
        );
        assert_eq!(store.get(&session.id).unwrap().status, CallStatus::Active);

        let t = store.end(&session.id, 2).unwrap();
        assert_eq!(t.notify, 1);
        assert!(store.end(&session.id, 1).is_err());
    }

    #[test]
    fn test_end_all_for_skips_terminal_and_strangers() {
        let store = CallStore::new();
        let ringing = store.create(1, 2, CallKind::Audio);
        let active = store.create(3, 1, CallKind::Video);
        let rejected = store.create(1, 4, CallKind::Audio);
        let unrelated = store.create(5, 6, CallKind::Audio);
        store.respond(&active.id, 1, CallDecision::Accept).unwrap();
        store.respond(&rejected.id, 4, CallDecision::Reject).unwrap();

        let mut notified: Vec<UserId> = store.end_all_for(1).into_iter().map(|t| t.notify).collect();
        notified.sort_unstable();
        assert_eq!(notified, vec![2, 3]);

        assert_eq!(store.get(&ringing.id).unwrap().status, CallStatus::Ended);
        assert_eq!(store.get(&active.id).unwrap().status, CallStatus::Ended);
        assert_eq!(store.get(&rejected.id).unwrap().status, CallStatus::Rejected);
        assert_eq!(store.get(&unrelated.id).unwrap().status, CallStatus::Ringing);

        assert!(store.end_all_for(1).is_empty());
    }

    #[test]
    fn test_ids_unique_for_repeated_pair() {
        let store = CallStore::new();
        let a = store.create(1, 2, CallKind::Audio);
        let b = store.create(1, 2, CallKind::Audio);
        let c = store.create(2, 1, CallKind::Audio);
        assert_ne!(a.id, b.id);
        assert_ne!(b.id, c.id);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_active_for() {
        let store = CallStore::new();
        let first = store.create(1, 2, CallKind::Audio);
        let second = store.create(3, 1, CallKind::Audio);
        let done = store.create(1, 4, CallKind::Audio);
        store.end(&done.id, 1).unwrap();

        let ids: Vec<CallId> = store.active_for(1).into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![first.id, second.id]);
        assert_eq!(store.live_count(), 2);
        assert!(store.active_for(7).is_empty());
    }

    #[test]
    fn test_prune_respects_retention() {
        let store = CallStore::with_retention(Duration::from_secs(60));
        let ended = store.create(1, 2, CallKind::Audio);
        let live = store.create(3, 4, CallKind::Audio);
        let ended_at = store.end(&ended.id, 1).unwrap().session.ended_at.unwrap();

        assert_eq!(store.prune_terminal(ended_at + 59_999), 0);
        assert!(store.get(&ended.id).is_some());

        assert_eq!(store.prune_terminal(ended_at + 60_000), 1);
        assert!(store.get(&ended.id).is_none());
        assert!(store.get(&live.id).is_some());
    }

    #[test]
    fn test_accept_racing_end_has_one_winner() {
        for _ in 0..64 {
            let store = Arc::new(CallStore::new());
            let session = store.create(1, 2, CallKind::Audio);
            let barrier = Arc::new(Barrier::new(2));

            let accept = {
                let (store, barrier, id) = (store.clone(), barrier.clone(), session.id.clone());
                std::thread::spawn(move || {
                    barrier.wait();
                    store.respond(&id, 2, CallDecision::Accept)
                })
            };
            let hangup = {
                let (store, barrier, id) = (store.clone(), barrier.clone(), session.id.clone());
                std::thread::spawn(move || {
                    barrier.wait();
                    store.end_all_for(1)
                })
            };

            let accepted = accept.join().unwrap();
            let ended = hangup.join().unwrap();
            let final_status = store.get(&session.id).unwrap().status;

            // The cascade always ends the call; accept only wins if it went first.
            assert_eq!(ended.len(), 1);
            assert_eq!(final_status, CallStatus::Ended);
            match accepted {
                Ok(t) => assert_eq!(t.session.status, CallStatus::Active),
                Err(e) => assert!(matches!(
                    e,
                    CallError::InvalidState { status: CallStatus::Ended, .. }
                )),
            }
        }
    }

    #[test]
    fn test_concurrent_reject_and_accept() {
        let store = Arc::new(CallStore::new());
        let session = store.create(1, 2, CallKind::Audio);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                let id = session.id.clone();
                std::thread::spawn(move || {
                    let decision = if i % 2 == 0 {
                        CallDecision::Accept
                    } else {
                        CallDecision::Reject
                    };
                    store.respond(&id, 2, decision).is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
