//! Cloud stack vocabulary: references, descriptions, events and statuses.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Resource type reported for events about the stack itself.
pub const STACK_RESOURCE_TYPE: &str = "AWS::CloudFormation::Stack";

/// Immutable identifier naming a stack (plain name or ARN).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StackRef(String);

impl StackRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_arn(&self) -> bool {
        self.0.starts_with("arn:")
    }

    /// Stack name, extracted from the ARN when needed.
    ///
    /// `arn:aws:cloudformation:<region>:<account>:stack/<name>/<uuid>`
    pub fn name(&self) -> &str {
        if !self.is_arn() {
            return &self.0;
        }
        self.0
            .split_once(":stack/")
            .and_then(|(_, rest)| rest.split('/').next())
            .unwrap_or(&self.0)
    }

    /// True when `event` is about the stack itself rather than a child resource.
    pub fn is_root_event(&self, event: &StackEvent) -> bool {
        if event.resource_type != STACK_RESOURCE_TYPE {
            return false;
        }
        event.logical_resource_id == self.name()
            || event.physical_resource_id.as_deref() == Some(self.as_str())
    }
}

impl fmt::Display for StackRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Provider-reported status of a stack or of one of its resources.
///
/// Kept as the raw provider string so unknown statuses survive; the predicates
/// classify by the provider's naming scheme.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StackStatus(String);

impl StackStatus {
    pub const CREATE_IN_PROGRESS: &'static str = "CREATE_IN_PROGRESS";
    pub const CREATE_COMPLETE: &'static str = "CREATE_COMPLETE";
    pub const CREATE_FAILED: &'static str = "CREATE_FAILED";
    pub const UPDATE_IN_PROGRESS: &'static str = "UPDATE_IN_PROGRESS";
    pub const UPDATE_COMPLETE: &'static str = "UPDATE_COMPLETE";
    pub const UPDATE_FAILED: &'static str = "UPDATE_FAILED";
    pub const UPDATE_ROLLBACK_IN_PROGRESS: &'static str = "UPDATE_ROLLBACK_IN_PROGRESS";
    pub const UPDATE_ROLLBACK_COMPLETE: &'static str = "UPDATE_ROLLBACK_COMPLETE";
    pub const ROLLBACK_IN_PROGRESS: &'static str = "ROLLBACK_IN_PROGRESS";
    pub const ROLLBACK_COMPLETE: &'static str = "ROLLBACK_COMPLETE";
    pub const ROLLBACK_FAILED: &'static str = "ROLLBACK_FAILED";
    pub const DELETE_IN_PROGRESS: &'static str = "DELETE_IN_PROGRESS";
    pub const DELETE_COMPLETE: &'static str = "DELETE_COMPLETE";
    pub const DELETE_FAILED: &'static str = "DELETE_FAILED";

    pub fn new(status: impl Into<String>) -> Self {
        Self(status.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_in_progress(&self) -> bool {
        self.0.ends_with("_IN_PROGRESS")
    }

    pub fn is_complete(&self) -> bool {
        self.0.ends_with("_COMPLETE")
    }

    pub fn is_failed(&self) -> bool {
        self.0.ends_with("_FAILED")
    }

    /// Any status reporting that the provider is reverting (or has reverted) a change.
    pub fn is_rollback(&self) -> bool {
        self.0.contains("ROLLBACK")
    }

    /// The operation has stopped changing the stack.
    pub fn is_terminal(&self) -> bool {
        !self.is_in_progress()
    }
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StackStatus {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackOutput {
    pub key: String,
    pub value: Option<String>,
    pub description: Option<String>,
}

/// Current metadata of a stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackDescription {
    pub stack_id: String,
    pub stack_name: String,
    pub status: StackStatus,
    pub status_reason: Option<String>,
    pub outputs: Vec<StackOutput>,
}

/// One entry of a stack's event history. Providers list these newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackEvent {
    pub event_id: String,
    pub logical_resource_id: String,
    pub physical_resource_id: Option<String>,
    pub resource_type: String,
    pub status: StackStatus,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for StackEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.resource_type,
            self.logical_resource_id,
            self.status
        )?;
        if let Some(reason) = &self.reason {
            write!(f, " ({reason})")?;
        }
        Ok(())
    }
}

/// Selects which stack events count for a watcher or poller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    /// Only accept events about this stack itself.
    pub root_of: Option<StackRef>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn root_of(mut self, stack: &StackRef) -> Self {
        self.root_of = Some(stack.clone());
        self
    }

    pub fn matches(&self, event: &StackEvent) -> bool {
        match &self.root_of {
            Some(stack) => stack.is_root_event(event),
            None => true,
        }
    }
}
