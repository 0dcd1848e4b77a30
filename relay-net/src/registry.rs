//! Who is online: the nickname → connection map.
//!
//! Every operation runs under one mutex, so a roster snapshot never sees a
//! half-applied login or disconnect. The registry only holds references;
//! closing connections is the server's job.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::connection::{lock, BindError, Connection};

/// Why a nickname could not be registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Another live connection holds the nickname.
    Conflict(String),
    /// The connection could not take the nickname.
    Bind(BindError),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict(nickname) => write!(f, "nickname '{}' is already in use", nickname),
            Self::Bind(e) => write!(f, "cannot bind nickname: {}", e),
        }
    }
}

impl std::error::Error for RegistryError {}

#[derive(Default)]
pub struct Registry {
    members: Mutex<BTreeMap<String, Arc<Connection>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `conn` under `nickname`, binding the nickname on the
    /// connection in the same critical section.
    ///
    /// An existing holder is never evicted.
    pub fn insert(&self, nickname: &str, conn: Arc<Connection>) -> Result<(), RegistryError> {
        let mut members = lock(&self.members);
        if members.contains_key(nickname) {
            return Err(RegistryError::Conflict(nickname.to_string()));
        }
        conn.bind_nickname(nickname.to_string())
            .map_err(RegistryError::Bind)?;
        members.insert(nickname.to_string(), conn);
        Ok(())
    }

    /// Remove the entry for `nickname`, if any.
    pub fn remove(&self, nickname: &str) -> Option<Arc<Connection>> {
        lock(&self.members).remove(nickname)
    }

    /// Remove `conn`'s entry if it still owns its nickname.
    pub fn remove_connection(&self, conn: &Connection) -> Option<String> {
        let nickname = conn.nickname()?;
        let mut members = lock(&self.members);
        match members.get(nickname) {
            Some(entry) if entry.id() == conn.id() => {
                members.remove(nickname);
                Some(nickname.to_string())
            }
            _ => None,
        }
    }

    pub fn lookup(&self, nickname: &str) -> Option<Arc<Connection>> {
        lock(&self.members).get(nickname).cloned()
    }

    pub fn contains(&self, nickname: &str) -> bool {
        lock(&self.members).contains_key(nickname)
    }

    /// Nicknames currently online, sorted.
    pub fn snapshot_members(&self) -> Vec<String> {
        lock(&self.members).keys().cloned().collect()
    }

    /// Every member with its connection, taken atomically.
    pub fn snapshot(&self) -> Vec<(String, Arc<Connection>)> {
        lock(&self.members)
            .iter()
            .map(|(nickname, conn)| (nickname.clone(), Arc::clone(conn)))
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.members).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.members).is_empty()
    }
}
