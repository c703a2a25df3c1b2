//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

use serde::{Deserialize, Serialize};

/// Customized error type for Synlease. Serializable, so that the lease
/// service can hand the exact kind back to clients.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum SynleaseError {
    /// A register round could not gather a quorum, or was preempted by a
    /// higher ballot. Retrying with a fresh ballot may succeed.
    RoundAborted(String),

    /// A remote party did not answer within its deadline.
    Timeout(String),

    /// Invalid configuration detected at setup time.
    Config(String),

    /// A client request that can never succeed as given.
    InvalidRequest(String),

    /// Anything else.
    Msg(String),
}

impl SynleaseError {
    pub fn msg(msg: impl ToString) -> Self {
        SynleaseError::Msg(msg.to_string())
    }

    pub fn aborted(msg: impl ToString) -> Self {
        SynleaseError::RoundAborted(msg.to_string())
    }

    pub fn timeout(msg: impl ToString) -> Self {
        SynleaseError::Timeout(msg.to_string())
    }

    pub fn config(msg: impl ToString) -> Self {
        SynleaseError::Config(msg.to_string())
    }

    pub fn invalid(msg: impl ToString) -> Self {
        SynleaseError::InvalidRequest(msg.to_string())
    }

    /// True if the failed operation is worth retrying with a new ballot.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SynleaseError::RoundAborted(_) | SynleaseError::Timeout(_)
        )
    }
}

impl fmt::Display for SynleaseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // do not display literal quotes
        match self {
            SynleaseError::RoundAborted(s)
            | SynleaseError::Timeout(s)
            | SynleaseError::Config(s)
            | SynleaseError::InvalidRequest(s)
            | SynleaseError::Msg(s) => write!(f, "{}", s),
        }
    }
}

impl error::Error for SynleaseError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `SynleaseError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for SynleaseError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                SynleaseError::Msg(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `SynleaseError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for SynleaseError {
            fn from(e: $error) -> SynleaseError {
                SynleaseError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(ctrlc::Error);
impl_from_error!(tokio::sync::oneshot::error::RecvError);
impl_from_error!(tokio::task::JoinError);

impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);
impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);

impl From<tokio::time::error::Elapsed> for SynleaseError {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        SynleaseError::Timeout(e.to_string())
    }
}
