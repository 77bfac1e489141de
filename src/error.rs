// src/error.rs

use thiserror::Error;

/// Errors raised by the EOF engine and its helpers.
///
/// Every error is raised at the point of detection and returned unchanged;
/// nothing is retried and no partially constructed solver is ever handed out.
#[derive(Error, Debug)]
pub enum EofError {
    /// Malformed shapes, incompatible weights or masks, an unusable missing-value
    /// pattern, an unknown scaling code, or an inconsistent persisted model.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// More modes (or zero modes) were requested than the decomposition holds.
    #[error("requested {requested} modes but only {available} are available")]
    OutOfRange { requested: usize, available: usize },

    /// The SVD did not converge or produced non-finite values.
    #[error("numerical instability: {0}")]
    NumericalInstability(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl EofError {
    pub(crate) fn invalid<S: Into<String>>(msg: S) -> Self {
        EofError::InvalidInput(msg.into())
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, EofError>;
