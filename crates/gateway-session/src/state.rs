//! Session state record and the lock that guards it.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use gateway_session_core::{Communicator, ObjectAdapter, RouterPrx, SessionPrx};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{HookId, SessionError};

/// Lifecycle phase of a session helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Created, connect not called yet.
    #[default]
    Idle,
    /// Connect in progress.
    Connecting,
    /// Session established.
    Connected,
    /// Destroy called, teardown in progress.
    DestroyRequested,
    /// Terminal. The helper cannot be reused.
    Destroyed,
}

impl Phase {
    /// Whether `next` may follow `self`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Connecting | Self::Destroyed)
                | (
                    Self::Connecting,
                    Self::Connected | Self::DestroyRequested | Self::Destroyed
                )
                | (Self::Connected, Self::DestroyRequested)
                | (Self::DestroyRequested, Self::Destroyed)
        )
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Destroyed)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::DestroyRequested => "destroy_requested",
            Self::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Mutable state of one session helper.
#[derive(Default)]
pub(crate) struct SessionState {
    phase: Phase,
    pub(crate) runtime: Option<Arc<dyn Communicator>>,
    pub(crate) router: Option<Arc<dyn RouterPrx>>,
    pub(crate) session: Option<Arc<dyn SessionPrx>>,
    pub(crate) adapter: Option<Arc<dyn ObjectAdapter>>,
    pub(crate) category: Option<String>,
    pub(crate) exit_hook: Option<HookId>,
}

impl SessionState {
    pub(crate) const fn phase(&self) -> Phase {
        self.phase
    }

    /// Router of the established session.
    pub(crate) fn router(&self) -> Result<&Arc<dyn RouterPrx>, SessionError> {
        self.router.as_ref().ok_or(SessionError::NoSession)
    }

    /// Callback adapter of the established session.
    pub(crate) fn adapter(
        &self,
        use_callbacks: bool,
    ) -> Result<&Arc<dyn ObjectAdapter>, SessionError> {
        self.router()?;
        if !use_callbacks {
            return Err(SessionError::CallbacksDisabled);
        }
        self.adapter.as_ref().ok_or(SessionError::NoSession)
    }

    /// Move every session resource out of the record.
    pub(crate) fn take_teardown(&mut self) -> Teardown {
        self.session = None;
        self.category = None;
        Teardown {
            router: self.router.take(),
            runtime: self.runtime.take(),
            adapter: self.adapter.take(),
        }
    }

    fn check_invariants(&self) {
        let phase = self.phase();
        debug_assert_eq!(
            self.router.is_some(),
            self.session.is_some(),
            "router and session must be set together"
        );
        debug_assert_eq!(
            self.router.is_some(),
            self.category.is_some(),
            "category is cached with the router"
        );
        debug_assert!(
            self.router.is_none() || phase == Phase::Connected,
            "router set outside the connected phase ({phase})"
        );
        debug_assert!(
            self.adapter.is_none() || phase == Phase::Connected,
            "adapter set outside the connected phase ({phase})"
        );
        debug_assert!(
            self.exit_hook.is_none() || phase == Phase::Connected,
            "exit hook registered outside the connected phase ({phase})"
        );
        debug_assert!(
            !phase.is_terminal() || self.runtime.is_none(),
            "runtime still owned after destroy"
        );
    }
}

/// Resources released by finalize-destroy.
pub(crate) struct Teardown {
    pub(crate) router: Option<Arc<dyn RouterPrx>>,
    pub(crate) runtime: Option<Arc<dyn Communicator>>,
    pub(crate) adapter: Option<Arc<dyn ObjectAdapter>>,
}

/// The single lock over a helper's [`SessionState`].
///
/// Phase changes are mirrored into a watch channel so observers never need
/// the lock.
pub(crate) struct StateLock {
    state: Mutex<SessionState>,
    phase_tx: watch::Sender<Phase>,
}

impl StateLock {
    pub(crate) fn new() -> Self {
        let (phase_tx, _) = watch::channel(Phase::Idle);
        Self {
            state: Mutex::new(SessionState::default()),
            phase_tx,
        }
    }

    /// Lock the state. Invariants are checked on entry and again when the
    /// guard is dropped.
    pub(crate) fn lock(&self) -> StateGuard<'_> {
        let guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        guard.check_invariants();
        StateGuard {
            guard,
            phase_tx: &self.phase_tx,
        }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase_tx.subscribe()
    }

    /// Last published phase, read without taking the lock.
    pub(crate) fn current_phase(&self) -> Phase {
        *self.phase_tx.borrow()
    }
}

pub(crate) struct StateGuard<'a> {
    guard: MutexGuard<'a, SessionState>,
    phase_tx: &'a watch::Sender<Phase>,
}

impl StateGuard<'_> {
    pub(crate) fn set_phase(&mut self, next: Phase) {
        let current = self.guard.phase();
        if current == next {
            return;
        }
        debug_assert!(
            current.can_transition_to(next),
            "invalid phase transition {current} -> {next}"
        );
        self.guard.phase = next;
        self.phase_tx.send_replace(next);
        tracing::debug!(from = %current, to = %next, "Session phase changed");
    }
}

impl Deref for StateGuard<'_> {
    type Target = SessionState;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for StateGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            self.guard.check_invariants();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destroyed_is_terminal() {
        for next in [
            Phase::Idle,
            Phase::Connecting,
            Phase::Connected,
            Phase::DestroyRequested,
        ] {
            assert!(!Phase::Destroyed.can_transition_to(next));
        }
        assert!(Phase::Destroyed.is_terminal());
    }

    #[test]
    fn test_connected_only_from_connecting() {
        assert!(Phase::Connecting.can_transition_to(Phase::Connected));
        assert!(!Phase::Idle.can_transition_to(Phase::Connected));
        assert!(!Phase::DestroyRequested.can_transition_to(Phase::Connected));
    }

    #[test]
    fn test_set_phase_publishes() {
        let lock = StateLock::new();
        let rx = lock.subscribe();
        lock.lock().set_phase(Phase::Connecting);
        assert_eq!(*rx.borrow(), Phase::Connecting);
        assert_eq!(lock.lock().phase(), Phase::Connecting);
        assert_eq!(lock.current_phase(), Phase::Connecting);
    }

    #[test]
    fn test_accessors_without_session() {
        let lock = StateLock::new();
        let state = lock.lock();
        assert_eq!(state.router().err(), Some(SessionError::NoSession));
        assert_eq!(state.adapter(true).err(), Some(SessionError::NoSession));
        assert_eq!(state.adapter(false).err(), Some(SessionError::NoSession));
    }

    #[test]
    fn test_phase_serializes_snake_case() {
        let json = serde_json::to_string(&Phase::DestroyRequested).unwrap();
        assert_eq!(json, "\"destroy_requested\"");
    }
}
