//! Stable documentation codes attached to stack failures and warnings.
//!
//! Codes are part of the external contract: operators search for them, and
//! remediation pages are keyed by them. Never renumber an existing code.

use std::fmt;

pub const HELP_BASE_URL: &str = "https://convey.dev/docs/errors";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(&'static str);

impl ErrorCode {
    /// The stack operation reported a rollback.
    pub const STACK_ROLLED_BACK: ErrorCode = ErrorCode("AWS-CLOUDFORMATION-ERROR-0001");
    /// Missing permission to read stack events (diagnostics only).
    pub const DESCRIBE_EVENTS_DENIED: ErrorCode = ErrorCode("AWS-CLOUDFORMATION-ERROR-0002");
    /// The provider returned an error response.
    pub const SERVICE_ERROR: ErrorCode = ErrorCode("AWS-CLOUDFORMATION-ERROR-0003");
    /// Missing permission to describe the stack.
    pub const DESCRIBE_STACK_DENIED: ErrorCode = ErrorCode("AWS-CLOUDFORMATION-ERROR-0004");
    /// Unexpected provider error while describing the stack.
    pub const DESCRIBE_STACK_FAILED: ErrorCode = ErrorCode("AWS-CLOUDFORMATION-ERROR-0005");
    /// No stack events were found while some were required.
    pub const STACK_EVENTS_MISSING: ErrorCode = ErrorCode("AWS-CLOUDFORMATION-ERROR-0006");
    /// Missing permission to create, update or delete the stack.
    pub const MODIFY_STACK_DENIED: ErrorCode = ErrorCode("AWS-CLOUDFORMATION-ERROR-0007");
    /// Unexpected provider error while creating, updating or deleting the stack.
    pub const MODIFY_STACK_FAILED: ErrorCode = ErrorCode("AWS-CLOUDFORMATION-ERROR-0008");
    /// The stack did not reach a terminal state in time.
    pub const STACK_WAIT_TIMED_OUT: ErrorCode = ErrorCode("AWS-CLOUDFORMATION-ERROR-0009");

    pub fn as_str(&self) -> &'static str {
        self.0
    }

    /// Remediation page for this code.
    pub fn help_url(&self) -> String {
        format!("{HELP_BASE_URL}#{}", self.0.to_ascii_lowercase())
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn help_url_uses_lowercase_anchor() {
        assert_eq!(
            ErrorCode::DESCRIBE_STACK_DENIED.help_url(),
            "https://convey.dev/docs/errors#aws-cloudformation-error-0004"
        );
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            ErrorCode::DESCRIBE_STACK_DENIED.as_str(),
            "AWS-CLOUDFORMATION-ERROR-0004"
        );
        assert_eq!(
            ErrorCode::STACK_ROLLED_BACK.as_str(),
            "AWS-CLOUDFORMATION-ERROR-0001"
        );
    }
}
