//! Resolution of the security subject a stream's records are ingested under.

use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;

/// Opaque principal attached to every record a stream creates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Subject(String);

impl Subject {
    pub fn new(principal: impl Into<String>) -> Self {
        Self(principal.into())
    }

    pub fn principal(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Maps the sender of a stream to the subject its records are owned by.
pub trait SubjectProvider: Send + Sync {
    fn subject_for(&self, sender: SocketAddr) -> Subject;
}

/// Names the subject after the sending host, e.g. `videographer@10.0.0.7`.
#[derive(Debug, Clone)]
pub struct AddressSubjectProvider {
    role: String,
}

impl AddressSubjectProvider {
    pub fn new(role: impl Into<String>) -> Self {
        Self { role: role.into() }
    }
}

impl Default for AddressSubjectProvider {
    fn default() -> Self {
        Self::new("videographer")
    }
}

impl SubjectProvider for AddressSubjectProvider {
    fn subject_for(&self, sender: SocketAddr) -> Subject {
        Subject::new(format!("{}@{}", self.role, sender.ip()))
    }
}
