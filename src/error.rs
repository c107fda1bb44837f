//! # Error
//!
//! Handler errors carry an HTTP-aligned status code and a human-readable
//! detail. Convergence checks return explicit values; errors are reserved for
//! rejected messages and store failures.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error codes returned by message handlers.
#[derive(Error, Debug, Deserialize, PartialEq, Eq)]
pub enum Error {
    /// The message was malformed or carried an invalid reference.
    #[error("{0}")]
    BadRequest(String),

    /// Authentication or authorization failed.
    #[error("{0}")]
    Unauthorized(String),

    /// No matching state was found.
    #[error("{0}")]
    NotFound(String),

    /// The message lost a convergence race against stored state.
    #[error("{0}")]
    Conflict(String),

    /// An internal (store or serialization) failure.
    #[error("{0}")]
    Unexpected(String),
}

impl Error {
    /// The HTTP-aligned status code for the error.
    #[must_use]
    pub const fn code(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::Unauthorized(_) => 401,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Unexpected(_) => 500,
        }
    }

    /// The human-readable error detail.
    #[must_use]
    pub fn detail(&self) -> &str {
        match self {
            Self::BadRequest(detail)
            | Self::Unauthorized(detail)
            | Self::NotFound(detail)
            | Self::Conflict(detail)
            | Self::Unexpected(detail) => detail,
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Unexpected(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl From<base64ct::Error> for Error {
    fn from(err: base64ct::Error) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl Serialize for Error {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.detail())
    }
}

/// Construct a 400 `Error::BadRequest` error from a string or message format.
#[doc(hidden)]
#[macro_export]
macro_rules! unexpected {
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::BadRequest(format!($fmt, $($arg)*))
    };
    ($err:expr $(,)?) => {
        $crate::Error::BadRequest(format!($err))
    };
}

/// Construct a 401 `Error::Unauthorized` error from a string or message format.
#[doc(hidden)]
#[macro_export]
macro_rules! unauthorized {
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::Unauthorized(format!($fmt, $($arg)*))
    };
    ($err:expr $(,)?) => {
        $crate::Error::Unauthorized(format!($err))
    };
}

/// Construct a 409 `Error::Conflict` error from a string or message format.
#[doc(hidden)]
#[macro_export]
macro_rules! conflict {
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::Conflict(format!($fmt, $($arg)*))
    };
    ($err:expr $(,)?) => {
        $crate::Error::Conflict(format!($err))
    };
}
