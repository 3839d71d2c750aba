use std::fmt;

/// Failure classes of a run. Attached as the root cause of an
/// `anyhow::Error`; recover with `error.downcast_ref::<PipelineError>()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Missing or malformed stream metadata.
    Probe(String),
    /// Short read/write, wrong byte count, or an engine exiting out of turn.
    Protocol(String),
    /// Invalid run parameters, detected before any engine is launched.
    Configuration(String),
    /// Internal bookkeeping disagreed with itself.
    Consistency(String),
    /// An engine request outlived its deadline.
    Timeout(String),
    /// The caller cancelled the run.
    Cancelled,
}

impl PipelineError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Probe(_) => "probe",
            Self::Protocol(_) => "protocol",
            Self::Configuration(_) => "configuration",
            Self::Consistency(_) => "consistency",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Probe(msg) => write!(f, "probe error: {msg}"),
            Self::Protocol(msg) => write!(f, "engine protocol violation: {msg}"),
            Self::Configuration(msg) => write!(f, "configuration error: {msg}"),
            Self::Consistency(msg) => write!(f, "consistency violation: {msg}"),
            Self::Timeout(msg) => write!(f, "engine request timed out: {msg}"),
            Self::Cancelled => f.write_str("run cancelled"),
        }
    }
}

impl std::error::Error for PipelineError {}

/// Find the first [`PipelineError`] anywhere in an error chain.
pub fn classify(error: &anyhow::Error) -> Option<&PipelineError> {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<PipelineError>())
}
