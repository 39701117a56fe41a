//! CallRequest: a caller's description of one unit of work.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::call_name::CallName;
use super::ids::{GroupId, TaskId};
use super::operation::ResourceOperation;
use super::state::CallState;
use crate::ports::hooks::LifeCycleCallback;

/// `{resource_type: {resource_id: operation}}`
pub type ResourceMap = BTreeMap<String, BTreeMap<String, ResourceOperation>>;

/// Callbacks invoked by the coordinator when the call enters or leaves the
/// live queue. Not persisted: recovery re-attaches the built-in ones.
#[derive(Clone, Default)]
pub struct LifeCycleHooks {
    pub on_enqueue: Vec<Arc<dyn LifeCycleCallback>>,
    pub on_dequeue: Vec<Arc<dyn LifeCycleCallback>>,
}

impl fmt::Debug for LifeCycleHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |hooks: &[Arc<dyn LifeCycleCallback>]| {
            hooks.iter().map(|h| h.name().to_string()).collect::<Vec<_>>()
        };
        f.debug_struct("LifeCycleHooks")
            .field("on_enqueue", &names(&self.on_enqueue))
            .field("on_dequeue", &names(&self.on_dequeue))
            .finish()
    }
}

/// One unit of work a caller wants performed.
///
/// Immutable once submitted; the coordinator only fills in `group_id` for
/// batch submissions and appends its own life-cycle hooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRequest {
    pub id: TaskId,
    pub call_name: CallName,

    #[serde(default)]
    pub args: Vec<serde_json::Value>,

    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,

    #[serde(default)]
    pub resources: ResourceMap,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Prerequisite call id -> exit states it must end in for this call to run.
    #[serde(default)]
    pub dependencies: BTreeMap<TaskId, Vec<CallState>>,

    /// Asynchronous calls stay running after their handler returns until
    /// completion is reported back to the coordinator.
    #[serde(default)]
    pub asynchronous: bool,

    /// Carried and persisted; no admission logic consults it.
    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(default)]
    pub group_id: Option<GroupId>,

    #[serde(default)]
    pub principal: Option<String>,

    #[serde(skip)]
    pub hooks: LifeCycleHooks,
}

fn default_weight() -> u32 {
    1
}

impl CallRequest {
    pub fn new(id: TaskId, call_name: CallName) -> Self {
        Self {
            id,
            call_name,
            args: Vec::new(),
            kwargs: serde_json::Map::new(),
            resources: ResourceMap::new(),
            tags: Vec::new(),
            dependencies: BTreeMap::new(),
            asynchronous: false,
            weight: default_weight(),
            group_id: None,
            principal: None,
            hooks: LifeCycleHooks::default(),
        }
    }

    pub fn with_arg(mut self, arg: serde_json::Value) -> Self {
        self.args.push(arg);
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.asynchronous = true;
        self
    }

    /// Declare `operation` on `resource_type`/`resource_id`.
    ///
    /// A later declaration on the same resource replaces the earlier one.
    pub fn with_resource(
        mut self,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        operation: ResourceOperation,
    ) -> Self {
        self.resources
            .entry(resource_type.into())
            .or_default()
            .insert(resource_id.into(), operation);
        self
    }

    pub fn creates_resource(self, resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        self.with_resource(resource_type, resource_id, ResourceOperation::Create)
    }

    pub fn reads_resource(self, resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        self.with_resource(resource_type, resource_id, ResourceOperation::Read)
    }

    pub fn updates_resource(self, resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        self.with_resource(resource_type, resource_id, ResourceOperation::Update)
    }

    pub fn deletes_resource(self, resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        self.with_resource(resource_type, resource_id, ResourceOperation::Delete)
    }

    pub fn syncs_resource(self, resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        self.with_resource(resource_type, resource_id, ResourceOperation::Sync)
    }

    pub fn publishes_resource(self, resource_type: impl Into<String>, resource_id: impl Into<String>) -> Self {
        self.with_resource(resource_type, resource_id, ResourceOperation::Publish)
    }

    /// Run only after `other` has completed, in any complete state.
    pub fn depends_on(self, other: TaskId) -> Self {
        self.depends_on_states(other, CallState::COMPLETE.to_vec())
    }

    /// Run only after `other` has completed in one of `states`; otherwise
    /// this call is skipped.
    pub fn depends_on_states(mut self, other: TaskId, states: Vec<CallState>) -> Self {
        self.dependencies.insert(other, states);
        self
    }

    pub fn on_enqueue(mut self, callback: Arc<dyn LifeCycleCallback>) -> Self {
        self.hooks.on_enqueue.push(callback);
        self
    }

    pub fn on_dequeue(mut self, callback: Arc<dyn LifeCycleCallback>) -> Self {
        self.hooks.on_dequeue.push(callback);
        self
    }

    /// Declared resources flattened to `(type, id, operation)`, sorted.
    pub fn resource_entries(&self) -> Vec<(&str, &str, ResourceOperation)> {
        self.resources
            .iter()
            .flat_map(|(resource_type, ids)| {
                ids.iter()
                    .map(move |(resource_id, op)| (resource_type.as_str(), resource_id.as_str(), *op))
            })
            .collect()
    }
}
