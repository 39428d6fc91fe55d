//! Shared user table for RFC 1929 authentication.
//!
//! Grounded in `original_source/src/shared/include/args.h`: a bounded,
//! ordered list of (name, password) pairs. `auth_required` is derived,
//! not stored, matching the original's "non-empty user list implies
//! auth is mandatory" policy.

/// Maximum number of users the table holds at once (mirrors `MAX_USERS` in
/// the original `args.h`).
pub const MAX_USERS: usize = 10;

/// Ordered (name, password) table, mutated only from the selector thread
/// (by the management protocol) and read only from the selector thread
/// (by the AUTH handler) — no locking required.
#[derive(Debug, Default)]
pub struct UserTable {
    users: Vec<(String, String)>,
}

impl UserTable {
    pub fn new() -> Self {
        Self { users: Vec::new() }
    }

    pub fn auth_required(&self) -> bool {
        !self.users.is_empty()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// First exact (name, password) match wins.
    pub fn check(&self, name: &str, password: &str) -> bool {
        self.users
            .iter()
            .any(|(n, p)| n == name && p == password)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.users.iter().map(|(n, _)| n.as_str())
    }

    /// Insert a user, replacing an existing entry with the same name.
    /// Fails if the table is full and `name` is not already present.
    pub fn add(&mut self, name: &str, password: &str) -> Result<(), UserTableError> {
        if let Some(entry) = self.users.iter_mut().find(|(n, _)| n == name) {
            entry.1 = password.to_string();
            return Ok(());
        }
        if self.users.len() >= MAX_USERS {
            return Err(UserTableError::Full);
        }
        self.users.push((name.to_string(), password.to_string()));
        Ok(())
    }

    /// Remove a user by name. Returns an error if the name wasn't present.
    pub fn remove(&mut self, name: &str) -> Result<(), UserTableError> {
        let before = self.users.len();
        self.users.retain(|(n, _)| n != name);
        if self.users.len() == before {
            Err(UserTableError::NotFound)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserTableError {
    Full,
    NotFound,
}

impl std::fmt::Display for UserTableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserTableError::Full => write!(f, "user table is full"),
            UserTableError::NotFound => write!(f, "user not found"),
        }
    }
}

impl std::error::Error for UserTableError {}
