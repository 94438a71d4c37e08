use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use super::Session;

pub type SessionHandle = Arc<tokio::sync::Mutex<Session>>;

/// Remote identity to session, at most one entry per remote.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live session for `remote`, creating one if there is none.
    ///
    /// A terminal session is replaced by a fresh one. A session whose lock is
    /// currently held is in use and therefore live.
    pub fn assign(&self, remote: &str) -> SessionHandle {
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(remote) {
            let terminal = existing
                .try_lock()
                .map(|session| session.state().is_terminal())
                .unwrap_or(false);
            if !terminal {
                return Arc::clone(existing);
            }
            tracing::debug!(
                target = "negotiation",
                remote,
                "replacing terminal session"
            );
        }
        let handle = Arc::new(tokio::sync::Mutex::new(Session::new(remote)));
        sessions.insert(remote.to_string(), Arc::clone(&handle));
        handle
    }

    pub fn lookup(&self, remote: &str) -> Option<SessionHandle> {
        self.sessions.lock().get(remote).cloned()
    }

    pub fn remove(&self, remote: &str) -> Option<SessionHandle> {
        self.sessions.lock().remove(remote)
    }

    pub fn drain(&self) -> Vec<SessionHandle> {
        self.sessions.lock().drain().map(|(_, handle)| handle).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    pub fn remotes(&self) -> Vec<String> {
        let mut remotes: Vec<_> = self.sessions.lock().keys().cloned().collect();
        remotes.sort();
        remotes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{FailureCause, NegotiationState};

    #[test]
    fn assign_is_idempotent_for_live_sessions() {
        let registry = SessionRegistry::new();
        let first = registry.assign("s1");
        let second = registry.assign("s1");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn assign_replaces_terminal_sessions() {
        let registry = SessionRegistry::new();
        let first = registry.assign("s1");
        first
            .lock()
            .await
            .set_state(NegotiationState::Failed(FailureCause::Timeout));

        let second = registry.assign("s1");

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.lock().await.state(), NegotiationState::Idle);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn lookup_and_remove() {
        let registry = SessionRegistry::new();
        assert!(registry.lookup("s1").is_none());

        let handle = registry.assign("s1");
        registry.assign("s2");
        assert!(Arc::ptr_eq(&registry.lookup("s1").unwrap(), &handle));
        assert_eq!(registry.remotes(), vec!["s1".to_string(), "s2".to_string()]);

        assert!(registry.remove("s1").is_some());
        assert!(registry.remove("s1").is_none());
        assert_eq!(registry.drain().len(), 1);
        assert!(registry.is_empty());
    }
}
