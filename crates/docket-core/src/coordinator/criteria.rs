//! Search criteria for `find_tasks` / `find_call_reports`.
//!
//! Only a fixed set of keys is understood. An unknown key is an error, never
//! silently ignored. Every given criterion must hold (AND):
//! - `task_id`, `state`, `call_name`, `class_name`: one of the given values
//! - `task_group_id`: equality
//! - `args`, `tags`: every given value is contained
//! - `kwargs`: every given key is present with the given value
//! - `resources`: every given `{type: {id: op}}` entry is declared

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::domain::{
    CallName, CallReport, CallState, GroupId, ResourceMap, ResourceOperation, TaskId,
};
use crate::error::DispatchError;

use super::task::Task;

pub const RECOGNIZED_KEYS: [&str; 9] = [
    "task_id",
    "task_group_id",
    "state",
    "call_name",
    "class_name",
    "args",
    "kwargs",
    "resources",
    "tags",
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchCriteria {
    pub task_ids: Option<Vec<TaskId>>,
    pub task_group_id: Option<GroupId>,
    pub states: Option<Vec<CallState>>,
    pub call_names: Option<Vec<CallName>>,
    pub class_names: Option<Vec<String>>,
    pub args: Option<Vec<Value>>,
    pub kwargs: Option<serde_json::Map<String, Value>>,
    pub resources: Option<ResourceMap>,
    pub tags: Option<Vec<String>>,
}

fn invalid(key: &str, err: impl std::fmt::Display) -> DispatchError {
    DispatchError::InvalidSearchCriteria {
        key: key.to_string(),
        message: err.to_string(),
    }
}

/// A single value or an array of them.
fn one_or_many<T: DeserializeOwned>(key: &str, value: Value) -> Result<Vec<T>, DispatchError> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| serde_json::from_value(item).map_err(|e| invalid(key, e)))
            .collect(),
        single => Ok(vec![serde_json::from_value(single).map_err(|e| invalid(key, e))?]),
    }
}

impl SearchCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse loosely typed `key = value` pairs (CLI, JSON bodies).
    ///
    /// All unknown keys are reported together.
    pub fn from_pairs<I, K>(pairs: I) -> Result<Self, DispatchError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let pairs: Vec<(String, Value)> = pairs.into_iter().map(|(k, v)| (k.into(), v)).collect();
        let mut unknown: Vec<String> = pairs
            .iter()
            .filter(|(key, _)| !RECOGNIZED_KEYS.contains(&key.as_str()))
            .map(|(key, _)| key.clone())
            .collect();
        if !unknown.is_empty() {
            unknown.sort();
            unknown.dedup();
            return Err(DispatchError::UnrecognizedSearchCriteria(unknown));
        }

        let mut criteria = Self::new();
        for (key, value) in pairs {
            match key.as_str() {
                "task_id" => criteria.task_ids = Some(one_or_many(&key, value)?),
                "task_group_id" => {
                    criteria.task_group_id =
                        Some(serde_json::from_value(value).map_err(|e| invalid(&key, e))?)
                }
                "state" => criteria.states = Some(one_or_many(&key, value)?),
                "call_name" => criteria.call_names = Some(one_or_many(&key, value)?),
                "class_name" => criteria.class_names = Some(one_or_many(&key, value)?),
                "args" => criteria.args = Some(one_or_many(&key, value)?),
                "kwargs" => {
                    criteria.kwargs =
                        Some(serde_json::from_value(value).map_err(|e| invalid(&key, e))?)
                }
                "resources" => {
                    criteria.resources =
                        Some(serde_json::from_value(value).map_err(|e| invalid(&key, e))?)
                }
                "tags" => criteria.tags = Some(one_or_many(&key, value)?),
                _ => return Err(DispatchError::UnrecognizedSearchCriteria(vec![key.clone()])),
            }
        }
        Ok(criteria)
    }

    pub fn with_task_id(mut self, task_id: TaskId) -> Self {
        self.task_ids.get_or_insert_with(Vec::new).push(task_id);
        self
    }

    pub fn with_group_id(mut self, group_id: GroupId) -> Self {
        self.task_group_id = Some(group_id);
        self
    }

    pub fn with_state(mut self, state: CallState) -> Self {
        self.states.get_or_insert_with(Vec::new).push(state);
        self
    }

    pub fn with_call_name(mut self, call_name: CallName) -> Self {
        self.call_names.get_or_insert_with(Vec::new).push(call_name);
        self
    }

    pub fn with_class_name(mut self, class_name: impl Into<String>) -> Self {
        self.class_names
            .get_or_insert_with(Vec::new)
            .push(class_name.into());
        self
    }

    pub fn with_arg(mut self, arg: Value) -> Self {
        self.args.get_or_insert_with(Vec::new).push(arg);
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs
            .get_or_insert_with(serde_json::Map::new)
            .insert(key.into(), value);
        self
    }

    pub fn with_resource(
        mut self,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        operation: ResourceOperation,
    ) -> Self {
        self.resources
            .get_or_insert_with(ResourceMap::new)
            .entry(resource_type.into())
            .or_default()
            .insert(resource_id.into(), operation);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.get_or_insert_with(Vec::new).push(tag.into());
        self
    }

    /// `report` is the task's current report; a task without one counts as
    /// waiting.
    pub fn matches(&self, task: &Task, report: Option<&CallReport>) -> bool {
        let request = &task.request;

        if let Some(ids) = &self.task_ids
            && !ids.contains(&request.id)
        {
            return false;
        }
        if let Some(group) = self.task_group_id
            && request.group_id != Some(group)
        {
            return false;
        }
        if let Some(states) = &self.states {
            let state = report.map_or(CallState::Waiting, |r| r.state);
            if !states.contains(&state) {
                return false;
            }
        }
        if let Some(names) = &self.call_names
            && !names.contains(&request.call_name)
        {
            return false;
        }
        if let Some(classes) = &self.class_names
            && !classes.iter().any(|c| c == request.call_name.class_name())
        {
            return false;
        }
        if let Some(args) = &self.args
            && !args.iter().all(|a| request.args.contains(a))
        {
            return false;
        }
        if let Some(kwargs) = &self.kwargs
            && !kwargs
                .iter()
                .all(|(k, v)| request.kwargs.get(k) == Some(v))
        {
            return false;
        }
        if let Some(resources) = &self.resources {
            let declared = resources.iter().all(|(resource_type, ids)| {
                ids.iter().all(|(resource_id, op)| {
                    request
                        .resources
                        .get(resource_type)
                        .and_then(|held| held.get(resource_id))
                        == Some(op)
                })
            });
            if !declared {
                return false;
            }
        }
        if let Some(tags) = &self.tags
            && !tags.iter().all(|t| request.tags.contains(t))
        {
            return false;
        }
        true
    }
}
