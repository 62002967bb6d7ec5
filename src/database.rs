//! Logical databases owning an outbox table.
//!
//! Every logical database keeps its own outbox so that an event can be written
//! in the same transaction as the mutation that produced it. Records never move
//! between databases and no operation spans more than one of them.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// The logical databases of the identity platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalDatabase {
    /// Accounts and profiles.
    Identity,
    /// Credentials, sessions and OAuth configuration.
    Auth,
    /// Consents and legal documents.
    Legal,
}

impl LogicalDatabase {
    /// All known databases, in a stable order.
    pub const ALL: [LogicalDatabase; 3] = [Self::Identity, Self::Auth, Self::Legal];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Auth => "auth",
            Self::Legal => "legal",
        }
    }

    /// Conventional outbox table name when several logical databases share a
    /// physical server, e.g. `identity_outbox`.
    pub fn outbox_table(&self) -> String {
        format!("{}_outbox", self.as_str())
    }
}

impl fmt::Display for LogicalDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an unknown database name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownDatabaseName(String);

impl fmt::Display for UnknownDatabaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown logical database `{}`", self.0)
    }
}

impl std::error::Error for UnknownDatabaseName {}

impl FromStr for LogicalDatabase {
    type Err = UnknownDatabaseName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "identity" => Ok(Self::Identity),
            "auth" => Ok(Self::Auth),
            "legal" => Ok(Self::Legal),
            _ => Err(UnknownDatabaseName(s.to_owned())),
        }
    }
}
