//! Presence tracking for Hark.
//!
//! The registry keeps two inverse views of the same relation: user to
//! connection and connection to user. Every mutation updates both views
//! together, so at any instant `by_user[u] == c` exactly when
//! `by_connection[c] == u`.
//!
//! The registry itself is not synchronized. The hub holds it behind a single
//! lock whose write guard covers each paired update.

use crate::ids::{ConnectionId, UserId};
use std::collections::HashMap;
use tracing::debug;

/// Sequence number of a binding.
///
/// Every new binding gets a fresh generation. Work deferred past an `.await`
/// compares its generation with the current one to find out whether the
/// binding it was started for still exists.
pub type Generation = u64;

#[derive(Debug, Clone)]
struct Binding {
    connection: ConnectionId,
    generation: Generation,
}

/// Result of [`PresenceRegistry::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Generation of the new (or unchanged) binding.
    pub generation: Generation,
    /// Connection that was bound to this user before and no longer is.
    pub displaced: Option<ConnectionId>,
    /// User that was bound to this connection before and no longer is.
    pub replaced: Option<UserId>,
}

impl Registration {
    /// Whether the call changed nothing.
    #[must_use]
    pub fn is_unchanged(&self) -> bool {
        self.displaced.is_none() && self.replaced.is_none()
    }
}

/// Bidirectional mapping between online users and their connections.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    by_user: HashMap<UserId, Binding>,
    by_connection: HashMap<ConnectionId, UserId>,
    last_generation: Generation,
}

impl PresenceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `user` to `connection`.
    ///
    /// The last registration for a user wins. Any binding that used either key
    /// is removed in both directions first, and what was removed is reported
    /// back. Retrying with the same pair is a no-op that returns the existing
    /// generation.
    pub fn register(&mut self, user: UserId, connection: ConnectionId) -> Registration {
        if let Some(binding) = self.by_user.get(&user) {
            if binding.connection == connection {
                return Registration {
                    generation: binding.generation,
                    displaced: None,
                    replaced: None,
                };
            }
        }

        let replaced = self.by_connection.remove(&connection).map(|previous| {
            self.by_user.remove(&previous);
            previous
        });

        let displaced = self.by_user.remove(&user).map(|binding| {
            self.by_connection.remove(&binding.connection);
            binding.connection
        });

        self.last_generation += 1;
        let generation = self.last_generation;

        debug!(
            user = %user,
            connection = %connection,
            generation,
            displaced = ?displaced,
            "Presence: registered"
        );

        self.by_connection.insert(connection.clone(), user.clone());
        self.by_user.insert(
            user,
            Binding {
                connection,
                generation,
            },
        );

        Registration {
            generation,
            displaced,
            replaced,
        }
    }

    /// Remove the binding of `connection`.
    ///
    /// Returns the user that was bound to it. Unknown connections are a no-op.
    pub fn unregister(&mut self, connection: &str) -> Option<UserId> {
        let user = self.by_connection.remove(connection)?;

        let owned = self
            .by_user
            .get(&user)
            .is_some_and(|binding| binding.connection.as_str() == connection);
        if owned {
            self.by_user.remove(&user);
        }

        debug!(user = %user, connection = %connection, "Presence: unregistered");
        Some(user)
    }

    /// Connection currently bound to `user`.
    #[must_use]
    pub fn lookup_connection(&self, user: &str) -> Option<&ConnectionId> {
        self.by_user.get(user).map(|binding| &binding.connection)
    }

    /// User currently bound to `connection`.
    #[must_use]
    pub fn lookup_user(&self, connection: &str) -> Option<&UserId> {
        self.by_connection.get(connection)
    }

    /// Whether `user` has a live connection.
    #[must_use]
    pub fn is_online(&self, user: &str) -> bool {
        self.by_user.contains_key(user)
    }

    /// Generation of the current binding of `user`.
    #[must_use]
    pub fn generation(&self, user: &str) -> Option<Generation> {
        self.by_user.get(user).map(|binding| binding.generation)
    }

    /// Whether `user` is still bound with the given generation.
    #[must_use]
    pub fn is_current(&self, user: &str, generation: Generation) -> bool {
        self.generation(user) == Some(generation)
    }

    /// Number of online users.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.by_user.len()
    }

    /// Snapshot of online users.
    #[must_use]
    pub fn online_users(&self) -> Vec<UserId> {
        self.by_user.keys().cloned().collect()
    }

    /// Check if nobody is online.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_user.is_empty()
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        assert_eq!(self.by_user.len(), self.by_connection.len());
        for (user, binding) in &self.by_user {
            assert_eq!(self.by_connection.get(&binding.connection), Some(user));
        }
        for (connection, user) in &self.by_connection {
            assert_eq!(
                self.by_user.get(user).map(|b| &b.connection),
                Some(connection)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::from(id)
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = PresenceRegistry::new();
        let registration = registry.register("alice".into(), conn("c1"));

        assert!(registration.is_unchanged());
        assert!(registry.is_online("alice"));
        assert_eq!(registry.lookup_connection("alice"), Some(&conn("c1")));
        assert_eq!(registry.lookup_user("c1"), Some(&UserId::from("alice")));
        assert!(!registry.is_online("bob"));
        registry.assert_consistent();
    }

    #[test]
    fn test_register_is_idempotent() {
        let mut registry = PresenceRegistry::new();
        let first = registry.register("alice".into(), conn("c1"));
        let second = registry.register("alice".into(), conn("c1"));

        assert_eq!(first, second);
        assert_eq!(registry.online_count(), 1);
        registry.assert_consistent();
    }

    #[test]
    fn test_last_registration_wins() {
        let mut registry = PresenceRegistry::new();
        let first = registry.register("alice".into(), conn("c1"));
        let second = registry.register("alice".into(), conn("c2"));

        assert_eq!(second.displaced, Some(conn("c1")));
        assert!(second.generation > first.generation);
        assert_eq!(registry.lookup_connection("alice"), Some(&conn("c2")));
        assert!(registry.lookup_user("c1").is_none());
        registry.assert_consistent();

        // The stale connection going away must not take alice offline.
        assert!(registry.unregister("c1").is_none());
        assert!(registry.is_online("alice"));
        registry.assert_consistent();
    }

    #[test]
    fn test_rebind_connection_to_new_user() {
        let mut registry = PresenceRegistry::new();
        registry.register("alice".into(), conn("c1"));
        let registration = registry.register("bob".into(), conn("c1"));

        assert_eq!(registration.replaced, Some(UserId::from("alice")));
        assert!(!registry.is_online("alice"));
        assert_eq!(registry.lookup_user("c1"), Some(&UserId::from("bob")));
        registry.assert_consistent();
    }

    #[test]
    fn test_unregister_unknown_connection() {
        let mut registry = PresenceRegistry::new();
        registry.register("alice".into(), conn("c1"));

        assert!(registry.unregister("c9").is_none());
        assert_eq!(registry.online_count(), 1);
        registry.assert_consistent();
    }

    #[test]
    fn test_generation_tracks_binding() {
        let mut registry = PresenceRegistry::new();
        let registration = registry.register("alice".into(), conn("c1"));
        assert!(registry.is_current("alice", registration.generation));

        registry.unregister("c1");
        assert!(!registry.is_current("alice", registration.generation));

        let again = registry.register("alice".into(), conn("c2"));
        assert!(!registry.is_current("alice", registration.generation));
        assert!(registry.is_current("alice", again.generation));
    }

    #[test]
    fn test_bijection_holds_across_operation_sequences() {
        let users = ["alice", "bob", "carol", "dave"];
        let connections = ["c1", "c2", "c3", "c4", "c5"];
        let mut registry = PresenceRegistry::new();

        // Deterministic linear congruential sequence covering mixed operations.
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for _ in 0..2_000 {
            seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            let user = users[(seed >> 33) as usize % users.len()];
            let connection = connections[(seed >> 17) as usize % connections.len()];

            if seed % 3 == 0 {
                registry.unregister(connection);
            } else {
                registry.register(user.into(), conn(connection));
            }
            registry.assert_consistent();
        }
    }

    #[test]
    fn test_online_users_snapshot() {
        let mut registry = PresenceRegistry::new();
        registry.register("alice".into(), conn("c1"));
        registry.register("bob".into(), conn("c2"));

        let mut users = registry.online_users();
        users.sort();
        assert_eq!(users, vec![UserId::from("alice"), UserId::from("bob")]);
        assert!(!registry.is_empty());
    }
}
