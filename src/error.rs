//! Contains the `Error` and `Result` types that `mongodb_replset` uses.

use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::options::ServerAddress;

/// The message used when no server satisfies the selection criteria.
pub(crate) const NO_ELIGIBLE_SERVERS_MESSAGE: &str = "No replica set members available for query";

/// The message used when a primary read preference is combined with tag sets.
pub(crate) const PRIMARY_WITH_TAGS_MESSAGE: &str = "PRIMARY cannot be combined with tags";

/// The result type for all methods that can return an error in the `mongodb_replset` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error that can occur in the `mongodb_replset` crate. The inner [`ErrorKind`] is wrapped in
/// an `Arc` to allow the errors to be cloned.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Arc<ErrorKind>,
}

impl Error {
    pub(crate) fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Error {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Error {
        ErrorKind::InvalidResponse {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn network_timeout() -> Error {
        ErrorKind::Io(Arc::new(std::io::ErrorKind::TimedOut.into())).into()
    }

    pub(crate) fn no_eligible_servers() -> Error {
        ErrorKind::NoEligibleServers {
            message: NO_ELIGIBLE_SERVERS_MESSAGE.to_string(),
        }
        .into()
    }

    pub(crate) fn pool_closed(address: &ServerAddress) -> Error {
        ErrorKind::PoolClosed {
            address: address.clone(),
        }
        .into()
    }

    pub(crate) fn checkout_timeout(address: &ServerAddress) -> Error {
        ErrorKind::CheckoutTimeout {
            address: address.clone(),
        }
        .into()
    }

    /// Whether this error was caused by a failure on the network (including timeouts).
    pub fn is_network_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(..))
    }

    /// Whether this error is a network timeout.
    pub fn is_network_timeout(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::TimedOut)
    }

    /// Whether this error was returned because no server satisfied the selection criteria.
    pub fn is_no_eligible_servers(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::NoEligibleServers { .. })
    }

    /// Whether this error is a pool checkout timeout.
    pub fn is_checkout_timeout(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::CheckoutTimeout { .. })
    }

    /// Whether this error was returned because the pool or the client has been closed.
    pub fn is_closed(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::PoolClosed { .. } | ErrorKind::Shutdown
        )
    }
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Self {
            kind: Arc::new(err.into()),
        }
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<std::io::ErrorKind> for ErrorKind {
    fn from(err: std::io::ErrorKind) -> Self {
        Self::Io(Arc::new(err.into()))
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An invalid argument was provided.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// No replica set member satisfied the read preference.
    #[error("{message}")]
    #[non_exhaustive]
    NoEligibleServers { message: String },

    /// The read preference is not valid, e.g. a primary read preference with tag sets.
    #[error("{message}")]
    #[non_exhaustive]
    InvalidPreference { message: String },

    /// Checking out a connection took longer than the allowed wait time.
    #[error("Timed out while checking out a connection from connection pool with address {address}")]
    #[non_exhaustive]
    CheckoutTimeout { address: ServerAddress },

    /// The connection pool was closed, either because the server was removed from the topology
    /// or because the client shut down.
    #[error("Connection pool for {address} is closed: client closed")]
    #[non_exhaustive]
    PoolClosed { address: ServerAddress },

    /// The client has been shut down.
    #[error("The client has been shut down")]
    Shutdown,

    /// Wrapper around [`std::io::Error`].
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The server returned an invalid reply.
    #[error("The server returned an invalid reply: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    /// The server returned an error to a command.
    #[error("{0}")]
    Command(CommandError),

    /// A member reported a replica set name other than the one the topology uses.
    #[error(
        "Server {address} reported replica set name {actual:?}, but the topology is configured \
         for {expected:?}"
    )]
    #[non_exhaustive]
    SetNameMismatch {
        address: ServerAddress,
        expected: String,
        actual: String,
    },

    /// Wrapper around `bson::de::Error`.
    #[error("{0}")]
    BsonDeserialization(#[from] bson::de::Error),

    /// Wrapper around `bson::ser::Error`.
    #[error("{0}")]
    BsonSerialization(#[from] bson::ser::Error),

    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },
}

/// An error that occurred due to a database command failing.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error.
    pub code: i32,

    /// The name associated with the error code.
    pub code_name: String,

    /// A description of the error that occurred.
    pub message: String,
}

impl fmt::Display for CommandError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "Command failed ({}): {}", self.code_name, self.message)?;
        if self.code != 0 {
            write!(fmt, " (code {})", self.code)?;
        }
        Ok(())
    }
}
