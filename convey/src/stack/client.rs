//! Capability traits for talking to the stack provider.
//!
//! The orchestrator only sees these traits; the AWS CLI client and the
//! scripted test client both implement them.

use std::fmt;

use crate::core::stack::{EventFilter, StackDescription, StackEvent, StackRef};

/// Broad class of a provider error, used to pick the error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudErrorKind {
    AccessDenied,
    /// The stack does not exist.
    NotFound,
    /// An update was requested but the template and parameters are unchanged.
    NoUpdates,
    Throttled,
    Validation,
    Other,
}

/// Error returned by the provider (or the transport reaching it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudError {
    pub kind: CloudErrorKind,
    /// Provider error code, e.g. `AccessDenied` or `ValidationError`.
    pub code: String,
    pub message: String,
    pub http_status: Option<u16>,
    pub detail: Option<String>,
}

impl CloudError {
    pub fn new(kind: CloudErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            http_status: None,
            detail: None,
        }
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::AccessDenied, "AccessDenied", message)
    }

    pub fn not_found(stack: &StackRef) -> Self {
        Self::new(
            CloudErrorKind::NotFound,
            "ValidationError",
            format!("Stack with id {stack} does not exist"),
        )
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(CloudErrorKind::Other, "Unknown", message)
    }

    pub fn with_http(mut self, status: u16, detail: Option<String>) -> Self {
        self.http_status = Some(status);
        self.detail = detail;
        self
    }

    pub fn is_access_denied(&self) -> bool {
        self.kind == CloudErrorKind::AccessDenied
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == CloudErrorKind::NotFound
    }
}

impl fmt::Display for CloudError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(status) = self.http_status {
            write!(f, " (HTTP {status})")?;
        }
        Ok(())
    }
}

impl std::error::Error for CloudError {}

/// Everything needed to create or update a stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackDeployment {
    pub stack: StackRef,
    pub template_body: String,
    pub parameters: Vec<(String, String)>,
    pub capabilities: Vec<String>,
    pub role_arn: Option<String>,
}

pub trait StackClient {
    /// Describe the stack. A missing stack is an error of kind `NotFound`.
    fn describe_stack(&self, stack: &StackRef) -> Result<StackDescription, CloudError>;

    /// Newest event accepted by `filter`, if any.
    fn last_stack_event(
        &self,
        stack: &StackRef,
        filter: &EventFilter,
    ) -> Result<Option<StackEvent>, CloudError>;

    /// Recent events, newest first.
    fn recent_stack_events(&self, stack: &StackRef) -> Result<Vec<StackEvent>, CloudError>;

    /// Returns the new stack id.
    fn create_stack(&self, deployment: &StackDeployment) -> Result<String, CloudError>;

    /// Returns the stack id. Unchanged stacks fail with kind `NoUpdates`.
    fn update_stack(&self, deployment: &StackDeployment) -> Result<String, CloudError>;

    fn delete_stack(&self, stack: &StackRef) -> Result<(), CloudError>;
}

impl<T: StackClient + ?Sized> StackClient for &T {
    fn describe_stack(&self, stack: &StackRef) -> Result<StackDescription, CloudError> {
        (**self).describe_stack(stack)
    }

    fn last_stack_event(
        &self,
        stack: &StackRef,
        filter: &EventFilter,
    ) -> Result<Option<StackEvent>, CloudError> {
        (**self).last_stack_event(stack, filter)
    }

    fn recent_stack_events(&self, stack: &StackRef) -> Result<Vec<StackEvent>, CloudError> {
        (**self).recent_stack_events(stack)
    }

    fn create_stack(&self, deployment: &StackDeployment) -> Result<String, CloudError> {
        (**self).create_stack(deployment)
    }

    fn update_stack(&self, deployment: &StackDeployment) -> Result<String, CloudError> {
        (**self).update_stack(deployment)
    }

    fn delete_stack(&self, stack: &StackRef) -> Result<(), CloudError> {
        (**self).delete_stack(stack)
    }
}

/// Builds a client per operation, so credentials can be refreshed between calls.
pub trait StackClientFactory {
    fn client(&self) -> Result<Box<dyn StackClient + '_>, CloudError>;
}

impl<T: StackClientFactory + ?Sized> StackClientFactory for &T {
    fn client(&self) -> Result<Box<dyn StackClient + '_>, CloudError> {
        (**self).client()
    }
}
