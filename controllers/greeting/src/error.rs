//! Controller-specific error types.

use operator_runtime::OperatorError;
use thiserror::Error;

/// Errors that can occur in the Greeting Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Operator runtime error
    #[error("Runtime error: {0}")]
    Runtime(#[from] OperatorError),

    /// Greeting object does not match the CRD schema
    #[error("Invalid Greeting {name}: {reason}")]
    InvalidSpec {
        /// metadata.name of the offending object
        name: String,
        /// Decode error
        reason: String,
    },
}
