// Empirical orthogonal function (EOF) analysis

#![doc = include_str!("../README.md")]

pub mod eof;
pub mod error;
pub mod field;
pub mod linalg_backends;
pub mod stats;
pub mod weights;

pub use eof::{Eof, EofOptions, EofScaling, PcScaling};
pub use error::{EofError, Result};
pub use field::{Centering, MissingPolicy};
