use thiserror::Error;

/// Errors raised by the signal-processing stages.
///
/// These indicate a caller bug (wrong frame shape) or a missing capability
/// at construction time, and are never retried.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PipelineError {
    #[error("invalid channel layout: {samples} samples with {channels} channels (mixer expects {expected})")]
    InvalidChannelLayout {
        samples: usize,
        channels: u16,
        expected: u16,
    },

    #[error("invalid frame size: got {actual} bytes, expected {expected}")]
    InvalidFrameSize { actual: usize, expected: usize },

    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),
}

/// Errors raised by a streaming session.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SessionError {
    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("cost guard exceeded: {cost:.4} >= {ceiling:.4}")]
    CostGuardExceeded { cost: f64, ceiling: f64 },

    #[error("session already closed")]
    Closed,
}

impl SessionError {
    pub fn connection(err: impl std::fmt::Display) -> Self {
        SessionError::ConnectionError(err.to_string())
    }
}
