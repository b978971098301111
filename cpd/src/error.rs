use std::io;

use thiserror::Error;

use crate::driver::Guard;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("unsupported dimensionality {0}, only 3D point sets are supported")]
    InvalidDimension(usize),

    #[error("unknown basis construction method {0}")]
    UnknownMethod(i32),

    #[error("basis was built for {expected} model points, got {found}")]
    BasisMismatch { expected: usize, found: usize },

    #[error("numeric error: {0:?}")]
    Numeric(Guard),

    #[error("no convergence after {iterations} iterations")]
    NotConverged { iterations: usize },

    #[error("registration was cancelled")]
    Cancelled,

    #[error("E-step backend {backend} failed: {reason}")]
    Backend { backend: &'static str, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn status(&self) -> Status {
        match self {
            Error::InvalidArgument(_)
            | Error::InvalidDimension(_)
            | Error::UnknownMethod(_)
            | Error::BasisMismatch { .. }
            | Error::Io(_) => Status::InvalidArgument,
            Error::Numeric(_) => Status::NumericError,
            Error::NotConverged { .. } => Status::NonConvergence,
            Error::Cancelled => Status::Cancelled,
            Error::Backend { .. } => Status::InternalError,
        }
    }
}

/// Outcome of a call as a flat status code. `-2` is not used.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    InvalidArgument,
    NonConvergence,
    NumericError,
    Cancelled,
    InternalError,
}

impl Status {
    pub fn code(self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::InvalidArgument => -1,
            Status::NonConvergence => -3,
            Status::NumericError => -4,
            Status::Cancelled => -5,
            Status::InternalError => -6,
        }
    }

    #[inline]
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}
