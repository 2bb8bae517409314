use thiserror::Error;

use crate::job::JobId;

/// Main error type for the autocycle system
#[derive(Error, Debug)]
pub enum AcError {
    #[error("Sampling error: {0}")]
    Sampling(#[from] SamplingError),

    #[error("Synthesis error: {0}")]
    Synthesis(#[from] SynthesisError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Run deadline of {seconds} seconds exceeded")]
    DeadlineExceeded { seconds: f64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AcError {
    /// Whether retrying the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, AcError::Backend(e) if e.is_transient())
    }
}

/// Condition sampling errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SamplingError {
    #[error("Invalid sampling parameter: {message}")]
    InvalidParameter { message: String },

    #[error("Oversampling pool is empty (batch size {batch_size}, factor {factor})")]
    EmptyPool { batch_size: usize, factor: f64 },
}

/// Trial sequence synthesis errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SynthesisError {
    #[error("Invalid constraint: {message}")]
    InvalidConstraint { message: String },

    #[error("Constraints cannot be satisfied: {message}")]
    ConstraintUnsatisfiable { message: String },
}

/// Errors surfaced by the remote execution backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend unavailable: {message}")]
    Unavailable { message: String },

    #[error("job {job_id} is not finished; observations are not ready")]
    NotReady { job_id: JobId },

    #[error("unknown job: {job_id}")]
    UnknownJob { job_id: JobId },

    #[error("request rejected by backend: {reason}")]
    Rejected { reason: String },

    #[error("malformed backend payload: {message}")]
    Decode { message: String },
}

impl BackendError {
    /// Only connectivity failures are worth retrying; everything else is a
    /// caller or payload defect.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable { .. })
    }
}

/// Model fitting errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Insufficient data: {message}")]
    InsufficientData { message: String },

    #[error("Shape mismatch: expected {expected} columns, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("Design matrix is singular")]
    Singular,
}

/// Result type alias for autocycle operations
pub type AcResult<T> = Result<T, AcError>;

/// Macro for creating invalid-parameter errors
#[macro_export]
macro_rules! invalid_parameter {
    ($($arg:tt)*) => {
        $crate::AcError::InvalidParameter(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::AcError::Internal(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = BackendError::NotReady { job_id: JobId(3) };
        assert!(error.to_string().contains("job 3"));
        assert!(error.to_string().contains("not ready"));
    }

    #[test]
    fn test_error_conversion() {
        let synth_error = SynthesisError::ConstraintUnsatisfiable {
            message: "too few trials".to_string(),
        };
        let ac_error: AcError = synth_error.into();

        match ac_error {
            AcError::Synthesis(SynthesisError::ConstraintUnsatisfiable { .. }) => (),
            _ => panic!("Expected Synthesis error"),
        }
    }

    #[test]
    fn test_transient_classification() {
        let unavailable: AcError = BackendError::Unavailable {
            message: "connection refused".into(),
        }
        .into();
        assert!(unavailable.is_transient());

        let not_ready: AcError = BackendError::NotReady { job_id: JobId(0) }.into();
        assert!(!not_ready.is_transient());
        assert!(!AcError::Cancelled.is_transient());
    }

    #[test]
    fn test_macros() {
        let err = invalid_parameter!("cycles_total must be positive, got {}", 0);
        assert!(matches!(err, AcError::InvalidParameter(ref m) if m.contains("cycles_total")));
        let err = internal_error!("Something went wrong");
        assert!(matches!(err, AcError::Internal(_)));
    }
}
