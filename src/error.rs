//! Error taxonomy for the agent run.
//!
//! Three classes matter to the orchestrator: connection errors (fatal for the
//! whole run, reported but exiting 0 so the monitoring server does not flap on
//! transient auth issues), constraint violations (a section was configured
//! with an impossible scope/region combination), and everything else (one
//! section's results are lost for this poll cycle, the run continues).

use thiserror::Error;

/// Authentication or connectivity failure while talking to AWS.
///
/// Raised once, before any section runs; the agent reports it in the
/// exceptions block and exits 0.
#[derive(Debug, Error)]
#[error("connection error: {0}")]
pub struct ConnectionError(pub String);

/// A section was built with parameters that can never be valid, e.g. the
/// WAFV2 CLOUDFRONT scope outside us-east-1.
#[derive(Debug, Error)]
#[error("constraint violation: {0}")]
pub struct ConstraintViolation(pub String);

/// How the orchestrator should treat a caught error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Logged and dropped, never counted towards the exit code.
    Constraint,
    /// Logged, recorded in the exceptions block, counted towards the exit code.
    Generic,
}

/// Classify an error caught around one section's run.
pub fn classify(err: &anyhow::Error) -> Severity {
    if err.downcast_ref::<ConstraintViolation>().is_some() {
        Severity::Constraint
    } else {
        Severity::Generic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_violations_are_classified() {
        let err = anyhow::Error::new(ConstraintViolation("bad scope".to_string()));
        assert_eq!(classify(&err), Severity::Constraint);

        let err = anyhow::anyhow!("Throttling: Rate exceeded");
        assert_eq!(classify(&err), Severity::Generic);
    }

    #[test]
    fn test_connection_error_message() {
        let err = ConnectionError("InvalidClientTokenId".to_string());
        assert_eq!(err.to_string(), "connection error: InvalidClientTokenId");
    }
}
