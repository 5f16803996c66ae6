//! Lifecycle mode guard.
//!
//! A node's mode is read once from configuration at startup and never changes for the
//! lifetime of the process. Moving a node between modes means changing its configuration
//! and restarting it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeMode {
    /// Full create/read/update/delete
    Edit,
    /// Create/read/update, no delete
    Rw,
    /// Read only
    Ro,
    /// Archive: read only and exempt from retention expiry
    Ar,
}

/// Operations the File Service exposes, as seen by the mode guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
    Transfer,
    /// Deletion triggered by a retention policy rather than a caller
    Expire,
}

/// Whether `operation` may run on a node in `mode`.
pub fn allowed(mode: NodeMode, operation: Operation) -> bool {
    use NodeMode::*;
    use Operation::*;

    match (mode, operation) {
        (_, Read) => true,
        (Edit, _) => true,
        (Rw, Create | Update | Expire) => true,
        (Rw, Delete | Transfer) => false,
        (Ro, Expire) => true,
        (Ro, _) => false,
        (Ar, _) => false,
    }
}

impl NodeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeMode::Edit => "edit",
            NodeMode::Rw => "rw",
            NodeMode::Ro => "ro",
            NodeMode::Ar => "ar",
        }
    }

    pub fn is_read_only(&self) -> bool {
        !allowed(*self, Operation::Create)
    }
}

impl fmt::Display for NodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Transfer => "transfer",
            Operation::Expire => "expire",
        };
        f.write_str(name)
    }
}

impl FromStr for NodeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "edit" => Ok(NodeMode::Edit),
            "rw" => Ok(NodeMode::Rw),
            "ro" => Ok(NodeMode::Ro),
            "ar" => Ok(NodeMode::Ar),
            other => Err(format!("unknown node mode '{other}' (expected edit, rw, ro or ar)")),
        }
    }
}
