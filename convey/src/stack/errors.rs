use thiserror::Error;

use crate::core::error_code::ErrorCode;
use crate::core::stack::{StackRef, StackStatus};
use crate::stack::client::CloudError;

/// Terminal failure of a stack operation.
///
/// Every variant with an [`ErrorCode`] renders the code and its remediation URL.
#[derive(Debug, Error)]
pub enum StackError {
    #[error("{message} [{code}] see {}", .code.help_url())]
    Permission {
        code: ErrorCode,
        message: String,
        #[source]
        source: CloudError,
    },
    #[error("{message}: {source} [{code}] see {}", .code.help_url())]
    Unknown {
        code: ErrorCode,
        message: String,
        #[source]
        source: CloudError,
    },
    #[error(
        "stack {stack} rolled back: {resource_type} reported {status}{} [{code}] see {url}",
        reasons(.reason, .failed_reason),
        code = ErrorCode::STACK_ROLLED_BACK,
        url = ErrorCode::STACK_ROLLED_BACK.help_url()
    )]
    RolledBack {
        stack: StackRef,
        status: StackStatus,
        resource_type: String,
        reason: Option<String>,
        /// Reason of the most recent failed event before the rollback began.
        failed_reason: Option<String>,
    },
    #[error(
        "no events found for stack {stack} [{code}] see {url}",
        code = ErrorCode::STACK_EVENTS_MISSING,
        url = ErrorCode::STACK_EVENTS_MISSING.help_url()
    )]
    MissingEvent { stack: StackRef },
    #[error(
        "stack {stack} did not finish within {waited_secs}s [{code}] see {url}",
        code = ErrorCode::STACK_WAIT_TIMED_OUT,
        url = ErrorCode::STACK_WAIT_TIMED_OUT.help_url()
    )]
    TimedOut { stack: StackRef, waited_secs: u64 },
    #[error("cancelled while waiting for stack {stack}")]
    Cancelled { stack: StackRef },
}

impl StackError {
    pub fn permission(code: ErrorCode, message: impl Into<String>, source: CloudError) -> Self {
        Self::Permission {
            code,
            message: message.into(),
            source,
        }
    }

    pub fn unknown(code: ErrorCode, message: impl Into<String>, source: CloudError) -> Self {
        Self::Unknown {
            code,
            message: message.into(),
            source,
        }
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Permission { code, .. } | Self::Unknown { code, .. } => Some(*code),
            Self::RolledBack { .. } => Some(ErrorCode::STACK_ROLLED_BACK),
            Self::MissingEvent { .. } => Some(ErrorCode::STACK_EVENTS_MISSING),
            Self::TimedOut { .. } => Some(ErrorCode::STACK_WAIT_TIMED_OUT),
            Self::Cancelled { .. } => None,
        }
    }
}

fn reasons(reason: &Option<String>, failed_reason: &Option<String>) -> String {
    let mut out = String::new();
    if let Some(reason) = reason {
        out.push_str(&format!(" ({reason})"));
    }
    if let Some(failed) = failed_reason {
        out.push_str(&format!("; first failure: {failed}"));
    }
    out
}
