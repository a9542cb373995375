//! Error type shared by every deconvolution stage
//!
//! Numeric kernels never fail on values (non-finite results are absorbed by the
//! soft-fail arithmetic); only violated preconditions surface here.

use crate::volume::Dims;
use thiserror::Error;

/// Precondition failures raised before any numeric work starts
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeconvError {
    #[error("dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: Dims, right: Dims },

    #[error("buffer of length {len} does not fit a {dims} volume")]
    BufferLength { dims: Dims, len: usize },

    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("{encoding} input requires a second (phase/imaginary) channel")]
    MissingSecondaryChannel { encoding: &'static str },

    #[error("cannot normalize a volume whose total is {total}")]
    DegenerateNormalization { total: f64 },

    #[error("{estimates} estimate frame(s) against {references} reference frame(s)")]
    FrameCountMismatch { estimates: usize, references: usize },

    #[error("no image frames supplied")]
    EmptyInput,

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T, E = DeconvError> = std::result::Result<T, E>;

impl DeconvError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        DeconvError::InvalidParameter { name, reason: reason.into() }
    }
}
