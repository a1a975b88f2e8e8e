//! Per-job cancellation tokens.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A token and the lifecycle (`insertion_seq`) it belongs to.
#[derive(Debug, Clone)]
struct Lifecycle {
    seq: i64,
    token: CancellationToken,
}

impl Lifecycle {
    fn fresh(seq: i64) -> Self {
        Self {
            seq,
            token: CancellationToken::new(),
        }
    }
}

/// Maps job ids to cancellation tokens.
///
/// Each token is tagged with the `insertion_seq` of the lifecycle it was
/// created for. Asking for a newer lifecycle replaces the token, so a job
/// re-enqueued after a cancel never inherits the cancelled signal, however
/// the re-enqueue interleaves with the old worker's terminal write.
#[derive(Debug, Clone, Default)]
pub struct CancelRegistry {
    tokens: Arc<DashMap<String, Lifecycle>>,
}

impl CancelRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a new, uncancelled token for lifecycle `seq` of `id`,
    /// replacing any previous one.
    pub fn register_fresh(&self, id: &str, seq: i64) -> CancellationToken {
        let lifecycle = Lifecycle::fresh(seq);
        let token = lifecycle.token.clone();
        self.tokens.insert(id.to_string(), lifecycle);
        token
    }

    /// Returns the token for lifecycle `seq` of `id`.
    ///
    /// An unknown id or an older registered lifecycle gets a fresh token. A
    /// request for a lifecycle older than the registered one gets a detached
    /// token, so stale callers can never signal the current lifecycle.
    pub fn token_for(&self, id: &str, seq: i64) -> CancellationToken {
        match self.tokens.entry(id.to_string()) {
            Entry::Occupied(mut entry) => {
                let current = entry.get().seq;
                if current == seq {
                    entry.get().token.clone()
                } else if current < seq {
                    debug!(id, seq, replaced = current, "new lifecycle, fresh token");
                    let lifecycle = Lifecycle::fresh(seq);
                    let token = lifecycle.token.clone();
                    entry.insert(lifecycle);
                    token
                } else {
                    debug!(id, seq, current, "stale lifecycle, detached token");
                    CancellationToken::new()
                }
            }
            Entry::Vacant(entry) => {
                let lifecycle = Lifecycle::fresh(seq);
                let token = lifecycle.token.clone();
                entry.insert(lifecycle);
                token
            }
        }
    }

    /// Signals cancellation for the current lifecycle of `id`. Returns
    /// `false` if no token was registered.
    pub fn cancel(&self, id: &str) -> bool {
        match self.tokens.get(id) {
            Some(lifecycle) => {
                lifecycle.token.cancel();
                debug!(id, seq = lifecycle.seq, "cancellation signalled");
                true
            }
            None => false,
        }
    }

    /// Whether cancellation has been signalled for the current lifecycle of `id`.
    #[must_use]
    pub fn is_cancelled(&self, id: &str) -> bool {
        self.tokens
            .get(id)
            .is_some_and(|lifecycle| lifecycle.token.is_cancelled())
    }

    /// Drops the token for `id`.
    pub fn discard(&self, id: &str) {
        self.tokens.remove(id);
    }

    /// Signals every registered token. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let mut count = 0;
        for entry in self.tokens.iter() {
            if !entry.value().token.is_cancelled() {
                entry.value().token.cancel();
                count += 1;
            }
        }
        count
    }

    /// Number of registered tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether no tokens are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_unknown_id_returns_false() {
        let registry = CancelRegistry::new();
        assert!(!registry.cancel("missing"));
        assert!(!registry.is_cancelled("missing"));
    }

    #[test]
    fn test_cancel_is_sticky_within_a_lifecycle() {
        let registry = CancelRegistry::new();
        let first = registry.register_fresh("a", 1);
        assert!(registry.cancel("a"));
        assert!(first.is_cancelled());
        assert!(registry.token_for("a", 1).is_cancelled());

        let second = registry.register_fresh("a", 1);
        assert!(!second.is_cancelled());
        assert!(!registry.is_cancelled("a"));
        // the replaced token stays cancelled
        assert!(first.is_cancelled());
    }

    #[test]
    fn test_newer_lifecycle_replaces_cancelled_token() {
        let registry = CancelRegistry::new();
        let old = registry.token_for("a", 1);
        registry.cancel("a");

        let renewed = registry.token_for("a", 2);
        assert!(old.is_cancelled());
        assert!(!renewed.is_cancelled());
        assert!(!registry.is_cancelled("a"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_stale_lifecycle_cannot_signal_current_one() {
        let registry = CancelRegistry::new();
        let current = registry.token_for("a", 5);

        registry.token_for("a", 4).cancel();
        assert!(!current.is_cancelled());
        assert!(!registry.is_cancelled("a"));
    }

    #[test]
    fn test_token_for_same_lifecycle_shares_state() {
        let registry = CancelRegistry::new();
        let token = registry.token_for("a", 1);
        registry.cancel("a");
        assert!(token.is_cancelled());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_cancel_all_and_discard() {
        let registry = CancelRegistry::new();
        registry.register_fresh("a", 1);
        registry.register_fresh("b", 2);
        registry.cancel("b");

        assert_eq!(registry.cancel_all(), 1);
        assert!(registry.is_cancelled("a"));

        registry.discard("a");
        registry.discard("b");
        assert!(registry.is_empty());
    }
}
