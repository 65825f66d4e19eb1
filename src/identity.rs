//! Credential collaborators.
//!
//! [`User`] is the identity a connection authenticates as: a name, a password and
//! a modification count snapshotted at connect time. [`Accounts`] is the
//! server-side directory the responder looks names up in and registers new users
//! into.

use crate::config::KdfParams;
use crate::error::{constants, ProtocolError, Result};
use crate::transport::cipher::{self, Iv, OpenReader, Role, Salt, SealWriter};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::info;
use zeroize::Zeroizing;

struct UserState {
    password: Zeroizing<String>,
    modifications: u64,
}

/// An account: name, password and modification count.
pub struct User {
    name: String,
    state: Mutex<UserState>,
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User").field("name", &self.name).finish_non_exhaustive()
    }
}

impl User {
    pub fn new(name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(UserState {
                password: Zeroizing::new(password.into()),
                modifications: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> Result<MutexGuard<'_, UserState>> {
        self.state
            .lock()
            .map_err(|_| ProtocolError::Corrupted(constants::ERR_LOCK_POISONED.into()))
    }

    /// A copy of the password, wiped when dropped.
    pub fn password(&self) -> Result<Zeroizing<String>> {
        Ok(self.state()?.password.clone())
    }

    /// Replace the password. Counts as a modification.
    pub fn set_password(&self, password: &str) -> Result<()> {
        let mut state = self.state()?;
        state.password = Zeroizing::new(password.to_owned());
        state.modifications += 1;
        Ok(())
    }

    pub fn modification_count(&self) -> Result<u64> {
        Ok(self.state()?.modifications)
    }

    /// Record a modification of the account's data; returns the new count.
    pub fn touch(&self) -> Result<u64> {
        let mut state = self.state()?;
        state.modifications += 1;
        Ok(state.modifications)
    }

    /// Fill `buf` with cryptographically secure random bytes.
    pub fn fill_random(&self, buf: &mut [u8]) -> Result<()> {
        cipher::fill_random(buf)
    }

    /// Derive the cipher pair from this user's password and snapshot the
    /// modification count under the same lock.
    pub fn open_cipher<R, W>(
        &self,
        salt: &Salt,
        iv: &Iv,
        role: Role,
        kdf: &KdfParams,
        reader: R,
        writer: W,
    ) -> Result<(OpenReader<R>, SealWriter<W>, u64)> {
        let state = self.state()?;
        let (reader, writer) =
            cipher::open_pair(state.password.as_bytes(), salt, iv, role, kdf, reader, writer)?;
        Ok((reader, writer, state.modifications))
    }
}

/// Server-side directory of users.
#[derive(Default)]
pub struct Accounts {
    users: RwLock<HashMap<String, Arc<User>>>,
    registration_password: Option<Zeroizing<String>>,
}

impl fmt::Debug for Accounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accounts")
            .field("users", &self.len())
            .field("registration", &self.registration_enabled())
            .finish()
    }
}

impl Accounts {
    /// Directory without self-registration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory that accepts new users who know `password`.
    pub fn with_registration_password(password: impl Into<String>) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            registration_password: Some(Zeroizing::new(password.into())),
        }
    }

    pub fn registration_enabled(&self) -> bool {
        self.registration_password.is_some()
    }

    pub(crate) fn registration_password(&self) -> Option<&str> {
        self.registration_password.as_ref().map(|p| p.as_str())
    }

    /// Add an existing user.
    ///
    /// # Errors
    /// [`ProtocolError::DuplicateName`] when the name is taken.
    pub fn insert(&self, user: User) -> Result<Arc<User>> {
        let mut users = self
            .users
            .write()
            .map_err(|_| ProtocolError::Corrupted(constants::ERR_LOCK_POISONED.into()))?;
        if users.contains_key(user.name()) {
            return Err(ProtocolError::DuplicateName(user.name().to_owned()));
        }
        let user = Arc::new(user);
        users.insert(user.name().to_owned(), Arc::clone(&user));
        Ok(user)
    }

    /// Create and add a user in one step.
    pub fn create(&self, name: &str, password: &str) -> Result<Arc<User>> {
        let user = self.insert(User::new(name, password))?;
        info!(user = %name, "Registered new user");
        Ok(user)
    }

    /// Drop `name` if it still maps to `user`. Returns whether it did.
    pub(crate) fn remove_if_same(&self, name: &str, user: &Arc<User>) -> bool {
        let Ok(mut users) = self.users.write() else {
            return false;
        };
        match users.get(name) {
            Some(current) if Arc::ptr_eq(current, user) => {
                users.remove(name);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<User>> {
        self.users.read().ok()?.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.users.read().map(|users| users.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
