//! User store collaborator.
//!
//! The relay needs two things from account storage: whether a user exists,
//! and a place to record the user's last known online status. Both are
//! best-effort from the relay's point of view.

use crate::ids::UserId;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The user has no backing record.
    #[error("User not found: {0}")]
    NotFound(UserId),

    /// The store could not be reached or failed the operation.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// A user account as seen by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub name: String,
    /// Last persisted online status.
    #[serde(default)]
    pub online: bool,
}

impl User {
    #[must_use]
    pub fn new(id: impl Into<UserId>) -> Self {
        let id = id.into();
        Self {
            username: id.to_string(),
            name: String::new(),
            online: false,
            id,
        }
    }
}

/// Account storage used by the hub.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Look up a user by id. Never creates a record.
    async fn find_user(&self, id: &UserId) -> Result<Option<User>, StoreError>;

    /// Resolve a user that is registering.
    ///
    /// Stores that create accounts on first contact do it here. The default
    /// is a plain lookup.
    async fn admit_user(&self, id: &UserId) -> Result<Option<User>, StoreError> {
        self.find_user(id).await
    }

    /// Persist the online status of a user.
    async fn set_user_status(&self, id: &UserId, online: bool) -> Result<(), StoreError>;
}

/// In-memory user store.
///
/// With `auto_admit` enabled, any id that registers gets a record on first
/// registration, so the relay runs without an account backend. Lookups and
/// status writes never create records.
#[derive(Debug, Default)]
pub struct MemoryUserStore {
    users: DashMap<UserId, User>,
    auto_admit: bool,
}

impl MemoryUserStore {
    /// Create a store that only knows the users it is given.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that admits every registering id.
    #[must_use]
    pub fn auto_admit() -> Self {
        Self {
            users: DashMap::new(),
            auto_admit: true,
        }
    }

    /// Add a user record.
    #[must_use]
    pub fn with_user(self, user: User) -> Self {
        self.insert(user);
        self
    }

    /// Insert or replace a user record.
    pub fn insert(&self, user: User) {
        self.users.insert(user.id.clone(), user);
    }

    /// Get a copy of a user record.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<User> {
        self.users.get(id).map(|u| u.clone())
    }

    /// Number of known users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl FromIterator<User> for MemoryUserStore {
    fn from_iter<I: IntoIterator<Item = User>>(iter: I) -> Self {
        let store = Self::new();
        for user in iter {
            store.insert(user);
        }
        store
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_user(&self, id: &UserId) -> Result<Option<User>, StoreError> {
        Ok(self.get(id.as_str()))
    }

    async fn admit_user(&self, id: &UserId) -> Result<Option<User>, StoreError> {
        if !self.auto_admit {
            return self.find_user(id).await;
        }

        debug!(user = %id, "Admitting unknown user");
        let user = self
            .users
            .entry(id.clone())
            .or_insert_with(|| User::new(id.clone()))
            .clone();
        Ok(Some(user))
    }

    async fn set_user_status(&self, id: &UserId, online: bool) -> Result<(), StoreError> {
        match self.users.get_mut(id) {
            Some(mut user) => {
                user.online = online;
                Ok(())
            }
            None => Err(StoreError::NotFound(id.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closed_store_rejects_unknown_users() {
        let store = MemoryUserStore::new().with_user(User::new("alice"));

        assert!(store.find_user(&"alice".into()).await.unwrap().is_some());
        assert!(store.find_user(&"mallory".into()).await.unwrap().is_none());
        assert!(store.admit_user(&"mallory".into()).await.unwrap().is_none());
        assert!(matches!(
            store.set_user_status(&"mallory".into(), true).await,
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_auto_admit_creates_records_on_admission_only() {
        let store = MemoryUserStore::auto_admit();

        assert!(store.find_user(&"alice".into()).await.unwrap().is_none());
        assert!(store.set_user_status(&"alice".into(), true).await.is_err());
        assert!(store.is_empty());

        let user = store.admit_user(&"alice".into()).await.unwrap().unwrap();
        assert_eq!(user.username, "alice");
        assert!(!user.online);
        assert_eq!(store.len(), 1);

        // A second admission returns the existing record.
        store.set_user_status(&"alice".into(), true).await.unwrap();
        let again = store.admit_user(&"alice".into()).await.unwrap().unwrap();
        assert!(again.online);
        assert!(store.find_user(&"alice".into()).await.unwrap().is_some());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_status_is_persisted() {
        let store: MemoryUserStore = [User::new("alice")].into_iter().collect();

        store.set_user_status(&"alice".into(), true).await.unwrap();
        assert!(store.get("alice").unwrap().online);

        store.set_user_status(&"alice".into(), false).await.unwrap();
        assert!(!store.get("alice").unwrap().online);
    }
}
