//! In-memory FTP user store

use crate::auth::{Authenticator, Proof};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

/// Permissions granted on top of the implicit read access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    Write,
}

/// A registered FTP user.
#[derive(Clone)]
pub struct User {
    pub name: String,
    pub password: Option<String>,
    pub home_directory: PathBuf,
    pub authorities: Vec<Authority>,
}

impl User {
    #[must_use]
    pub fn can_write(&self) -> bool {
        self.authorities.contains(&Authority::Write)
    }
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("name", &self.name)
            .field("home_directory", &self.home_directory)
            .field("authorities", &self.authorities)
            .finish_non_exhaustive()
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum UserStoreError {
    #[error("user name must not be empty")]
    EmptyName,

    #[error("user {0} has no password")]
    MissingPassword(String),

    #[error("user {0} has no home directory")]
    MissingHome(String),
}

/// One-off user store held in memory for the fixture's lifetime.
#[derive(Debug, Default)]
pub struct UserStore {
    users: RwLock<HashMap<String, User>>,
}

impl UserStore {
    /// Register or replace a user.
    ///
    /// # Errors
    ///
    /// Rejects users with an empty name, no password, or no home
    /// directory.
    pub fn save(&self, user: User) -> Result<(), UserStoreError> {
        if user.name.is_empty() {
            return Err(UserStoreError::EmptyName);
        }
        if user.password.is_none() {
            return Err(UserStoreError::MissingPassword(user.name));
        }
        if user.home_directory.as_os_str().is_empty() {
            return Err(UserStoreError::MissingHome(user.name));
        }
        self.users
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user.name.clone(), user);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<User> {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.users.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Authenticator for UserStore {
    fn authenticate(&self, username: &str, proof: Proof<'_>) -> bool {
        let Proof::Password(password) = proof else {
            return false;
        };
        self.get(username)
            .and_then(|user| user.password)
            .is_some_and(|stored| stored == password)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str, password: Option<&str>) -> User {
        User {
            name: name.to_string(),
            password: password.map(str::to_string),
            home_directory: PathBuf::from("/srv/ftp"),
            authorities: vec![Authority::Write],
        }
    }

    #[test]
    fn save_and_get() {
        let store = UserStore::default();
        store.save(user("admin", Some("secret"))).unwrap();
        let saved = store.get("admin").unwrap();
        assert_eq!(saved.home_directory, PathBuf::from("/srv/ftp"));
        assert!(saved.can_write());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn save_rejects_empty_name() {
        let store = UserStore::default();
        assert_eq!(
            store.save(user("", Some("x"))),
            Err(UserStoreError::EmptyName)
        );
        assert!(store.is_empty());
    }

    #[test]
    fn save_rejects_missing_password() {
        let store = UserStore::default();
        assert_eq!(
            store.save(user("admin", None)),
            Err(UserStoreError::MissingPassword("admin".to_string()))
        );
    }

    #[test]
    fn password_must_match() {
        let store = UserStore::default();
        store.save(user("admin", Some("secret"))).unwrap();
        assert!(store.authenticate("admin", Proof::Password("secret")));
        assert!(!store.authenticate("admin", Proof::Password("Secret")));
        assert!(!store.authenticate("nobody", Proof::Password("secret")));
    }

    #[test]
    fn public_keys_are_not_accepted() {
        let store = UserStore::default();
        store.save(user("admin", Some("secret"))).unwrap();
        assert!(!store.authenticate("admin", Proof::PublicKey(b"key")));
    }

    #[test]
    fn debug_hides_password() {
        assert!(!format!("{:?}", user("admin", Some("secret"))).contains("secret"));
    }
}
