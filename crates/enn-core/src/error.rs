// SPDX-License-Identifier: MIT OR Apache-2.0

#![forbid(unsafe_code)]

/// Structured error type for elastic nearest-neighbour APIs.
///
/// # Error Philosophy
/// - Error messages are operational and actionable.
/// - Variants are structured for reliable pattern matching.
/// - Expected failures are represented as `EnnError` (not panics).
///
/// # Recovery
/// - `InvalidInput` is raised at configuration or binding time and never mid-build.
/// - `NumericalIssue` aborts the current build; a half-built frontier is never reported as final.
/// - `Checkpoint` is recoverable: engines fall back to a fresh build.
/// - `InvalidState` signals an operation called from the wrong lifecycle phase.
#[derive(thiserror::Error, Debug)]
pub enum EnnError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("numerical issue: {0}")]
    NumericalIssue(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
}

impl EnnError {
    /// Creates an `EnnError::InvalidInput`.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Creates an `EnnError::NumericalIssue`.
    pub fn numerical_issue(msg: impl Into<String>) -> Self {
        Self::NumericalIssue(msg.into())
    }

    /// Creates an `EnnError::NotSupported`.
    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported(msg.into())
    }

    /// Creates an `EnnError::ResourceLimit`.
    pub fn resource_limit(msg: impl Into<String>) -> Self {
        Self::ResourceLimit(msg.into())
    }

    /// Creates an `EnnError::InvalidState`.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Creates an `EnnError::Checkpoint`.
    pub fn checkpoint(msg: impl Into<String>) -> Self {
        Self::Checkpoint(msg.into())
    }

    /// True when the error should abort an in-flight build.
    pub fn is_fatal_to_build(&self) -> bool {
        matches!(
            self,
            Self::NumericalIssue(_) | Self::ResourceLimit(_) | Self::InvalidState(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::EnnError;

    #[test]
    fn helper_constructors_create_expected_variants() {
        match EnnError::invalid_input("k must be >= 1; got 0") {
            EnnError::InvalidInput(msg) => assert_eq!(msg, "k must be >= 1; got 0"),
            _ => panic!("expected InvalidInput"),
        }

        match EnnError::numerical_issue("distance(3, 7) returned NaN") {
            EnnError::NumericalIssue(msg) => assert_eq!(msg, "distance(3, 7) returned NaN"),
            _ => panic!("expected NumericalIssue"),
        }

        match EnnError::not_supported("lower bound for unequal lengths") {
            EnnError::NotSupported(msg) => assert_eq!(msg, "lower bound for unequal lengths"),
            _ => panic!("expected NotSupported"),
        }

        match EnnError::resource_limit("ticks counter overflow") {
            EnnError::ResourceLimit(msg) => assert_eq!(msg, "ticks counter overflow"),
            _ => panic!("expected ResourceLimit"),
        }

        match EnnError::invalid_state("finalize requires Complete; got Paused") {
            EnnError::InvalidState(msg) => {
                assert_eq!(msg, "finalize requires Complete; got Paused")
            }
            _ => panic!("expected InvalidState"),
        }

        match EnnError::checkpoint("dataset fingerprint mismatch") {
            EnnError::Checkpoint(msg) => assert_eq!(msg, "dataset fingerprint mismatch"),
            _ => panic!("expected Checkpoint"),
        }
    }

    #[test]
    fn display_messages_have_required_prefixes() {
        assert!(
            EnnError::invalid_input("k must be >= 1; got 0")
                .to_string()
                .starts_with("invalid input:")
        );
        assert!(
            EnnError::numerical_issue("distance(3, 7) returned NaN")
                .to_string()
                .starts_with("numerical issue:")
        );
        assert!(
            EnnError::resource_limit("ticks counter overflow")
                .to_string()
                .starts_with("resource limit exceeded:")
        );
        assert!(
            EnnError::invalid_state("finalize requires Complete")
                .to_string()
                .starts_with("invalid state:")
        );
        assert!(
            EnnError::checkpoint("truncated payload")
                .to_string()
                .starts_with("checkpoint error:")
        );
    }

    #[test]
    fn build_fatality_matches_recovery_policy() {
        assert!(EnnError::numerical_issue("nan").is_fatal_to_build());
        assert!(EnnError::invalid_state("redundant add").is_fatal_to_build());
        assert!(!EnnError::checkpoint("corrupt").is_fatal_to_build());
        assert!(!EnnError::invalid_input("k=0").is_fatal_to_build());
    }

    #[test]
    fn enn_error_is_usable_as_std_error_trait_object() {
        let err: Box<dyn std::error::Error> = Box::new(EnnError::checkpoint("missing file"));
        assert_eq!(err.to_string(), "checkpoint error: missing file");
    }
}
