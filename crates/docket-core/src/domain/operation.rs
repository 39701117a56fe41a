//! Resource operations and the admission response they produce.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An operation a call declares against one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceOperation {
    Create,
    Read,
    Update,
    Delete,
    Sync,
    Publish,
}

impl ResourceOperation {
    /// Every known operation, in matrix order.
    pub const ALL: [ResourceOperation; 6] = [
        ResourceOperation::Create,
        ResourceOperation::Read,
        ResourceOperation::Update,
        ResourceOperation::Delete,
        ResourceOperation::Sync,
        ResourceOperation::Publish,
    ];

    /// Row/column position inside the operation matrix.
    pub const fn index(self) -> usize {
        match self {
            ResourceOperation::Create => 0,
            ResourceOperation::Read => 1,
            ResourceOperation::Update => 2,
            ResourceOperation::Delete => 3,
            ResourceOperation::Sync => 4,
            ResourceOperation::Publish => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceOperation::Create => "create",
            ResourceOperation::Read => "read",
            ResourceOperation::Update => "update",
            ResourceOperation::Delete => "delete",
            ResourceOperation::Sync => "sync",
            ResourceOperation::Publish => "publish",
        }
    }
}

impl fmt::Display for ResourceOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown resource operation: {0}")]
pub struct UnknownOperation(pub String);

impl FromStr for ResourceOperation {
    type Err = UnknownOperation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceOperation::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| UnknownOperation(s.to_string()))
    }
}

/// Admission decision for a proposed call.
///
/// A rejected call is not an error; it is reported back with its reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Response {
    Accepted,
    Postponed,
    Rejected,
}

impl Response {
    pub fn as_str(self) -> &'static str {
        match self {
            Response::Accepted => "accepted",
            Response::Postponed => "postponed",
            Response::Rejected => "rejected",
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
