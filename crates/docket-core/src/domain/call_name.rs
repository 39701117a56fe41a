use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Operation tag naming the unit of work a call performs.
///
/// Handlers are registered per tag at startup; nothing is resolved by name at
/// call time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallName {
    RepoCreate,
    RepoUpdate,
    RepoDelete,
    RepoSync,
    RepoPublish,
    ContentUpload,
    ConsumerBind,
    ConsumerUnbind,
    ConsumerContentInstall,
    OrphanRemove,
}

impl CallName {
    pub const ALL: [CallName; 10] = [
        CallName::RepoCreate,
        CallName::RepoUpdate,
        CallName::RepoDelete,
        CallName::RepoSync,
        CallName::RepoPublish,
        CallName::ContentUpload,
        CallName::ConsumerBind,
        CallName::ConsumerUnbind,
        CallName::ConsumerContentInstall,
        CallName::OrphanRemove,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CallName::RepoCreate => "repo_create",
            CallName::RepoUpdate => "repo_update",
            CallName::RepoDelete => "repo_delete",
            CallName::RepoSync => "repo_sync",
            CallName::RepoPublish => "repo_publish",
            CallName::ContentUpload => "content_upload",
            CallName::ConsumerBind => "consumer_bind",
            CallName::ConsumerUnbind => "consumer_unbind",
            CallName::ConsumerContentInstall => "consumer_content_install",
            CallName::OrphanRemove => "orphan_remove",
        }
    }

    /// Manager family the operation belongs to; searchable as `class_name`.
    pub fn class_name(self) -> &'static str {
        match self {
            CallName::RepoCreate | CallName::RepoUpdate | CallName::RepoDelete => "RepoManager",
            CallName::RepoSync => "RepoSyncManager",
            CallName::RepoPublish => "RepoPublishManager",
            CallName::ContentUpload => "ContentUploadManager",
            CallName::ConsumerBind | CallName::ConsumerUnbind => "ConsumerBindManager",
            CallName::ConsumerContentInstall => "ConsumerAgentManager",
            CallName::OrphanRemove => "OrphanManager",
        }
    }
}

impl fmt::Display for CallName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown call name: {0}")]
pub struct UnknownCallName(pub String);

impl FromStr for CallName {
    type Err = UnknownCallName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CallName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| UnknownCallName(s.to_string()))
    }
}
