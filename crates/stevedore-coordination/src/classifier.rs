//! Fatal vs recoverable failure classification.

use std::fmt;

use serde::{Deserialize, Serialize};
use stevedore_types::{Severity, WorkflowError};

/// Error-type fragments that always make a failure fatal.
pub const FATAL_ERROR_TYPES: [&str; 5] = [
    "authentication_failure",
    "permission_denied",
    "system_error",
    "configuration_invalid",
    "quota_exceeded",
];

/// Outcome of classifying a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// Never retried or escalated.
    Fatal,
    /// Eligible for escalation or retry.
    Recoverable,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Fatal => write!(f, "fatal"),
            ErrorClass::Recoverable => write!(f, "recoverable"),
        }
    }
}

/// Whether a failure must stop the workflow.
///
/// Critical severity is fatal. Otherwise the failure is fatal when its error
/// type contains one of [`FATAL_ERROR_TYPES`], ignoring case.
pub fn is_fatal(failure: &WorkflowError) -> bool {
    if failure.severity == Severity::Critical {
        return true;
    }
    let error_type = failure.error_type.to_lowercase();
    FATAL_ERROR_TYPES
        .iter()
        .any(|fragment| error_type.contains(fragment))
}

pub fn classify(failure: &WorkflowError) -> ErrorClass {
    if is_fatal(failure) {
        ErrorClass::Fatal
    } else {
        ErrorClass::Recoverable
    }
}
