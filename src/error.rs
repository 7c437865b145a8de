use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};
use sqlx::error::ErrorKind;
use tide_disco::{RequestError, StatusCode};

/// Errors surfaced by the service.
///
/// The variants mirror the failure classes of the fetch pipeline. Transport
/// failures are absorbed inside the adapters (which serve fallback data
/// instead of propagating), duplicate keys are swallowed by the orchestrator,
/// constraint violations are counted per batch, and only [`InvalidState`] and
/// [`InvalidArgument`] from direct scheduler API misuse reach callers as hard
/// failures.
///
/// [`InvalidState`]: Error::InvalidState
/// [`InvalidArgument`]: Error::InvalidArgument
#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum Error {
    /// A network, timeout or malformed-response failure from an upstream
    /// source.
    Transport { message: String },

    /// A keyed write against an already-existing unique key.
    ///
    /// The write still takes effect (latest state wins); this condition exists
    /// so callers can distinguish a replace from a fresh insert and swallow
    /// it when re-fetching unchanged upstream state.
    DuplicateKey { message: String },

    /// A malformed record rejected by the store.
    ConstraintViolation { message: String },

    /// An operation that requires the scheduler to be running was invoked
    /// while it was stopped.
    InvalidState { message: String },

    /// A malformed argument, e.g. an unparseable cadence expression.
    InvalidArgument { message: String },

    /// A requested object does not exist.
    NotFound { message: String },

    /// An error internal to the service, including unexpected store failures.
    Internal { message: String },
}

impl Error {
    pub fn transport(message: impl Display) -> Self {
        Self::Transport {
            message: message.to_string(),
        }
    }

    pub fn duplicate_key(message: impl Display) -> Self {
        Self::DuplicateKey {
            message: message.to_string(),
        }
    }

    pub fn constraint_violation(message: impl Display) -> Self {
        Self::ConstraintViolation {
            message: message.to_string(),
        }
    }

    pub fn invalid_state(message: impl Display) -> Self {
        Self::InvalidState {
            message: message.to_string(),
        }
    }

    pub fn invalid_argument(message: impl Display) -> Self {
        Self::InvalidArgument {
            message: message.to_string(),
        }
    }

    pub fn not_found(message: impl Display) -> Self {
        Self::NotFound {
            message: message.to_string(),
        }
    }

    pub fn internal(message: impl Display) -> Self {
        Self::Internal {
            message: message.to_string(),
        }
    }

    /// Extend an error message with additional context, keeping the same
    /// variant.
    pub fn context(self, context: impl Display) -> Self {
        let message = format!("{context}: {}", self.message());
        self.with_message(message)
    }

    /// Whether this is the swallowable duplicate-key condition.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, Self::DuplicateKey { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transport { message }
            | Self::DuplicateKey { message }
            | Self::ConstraintViolation { message }
            | Self::InvalidState { message }
            | Self::InvalidArgument { message }
            | Self::NotFound { message }
            | Self::Internal { message } => message,
        }
    }

    fn with_message(self, message: String) -> Self {
        match self {
            Self::Transport { .. } => Self::Transport { message },
            Self::DuplicateKey { .. } => Self::DuplicateKey { message },
            Self::ConstraintViolation { .. } => Self::ConstraintViolation { message },
            Self::InvalidState { .. } => Self::InvalidState { message },
            Self::InvalidArgument { .. } => Self::InvalidArgument { message },
            Self::NotFound { .. } => Self::NotFound { message },
            Self::Internal { .. } => Self::Internal { message },
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport failure",
            Self::DuplicateKey { .. } => "duplicate key",
            Self::ConstraintViolation { .. } => "constraint violation",
            Self::InvalidState { .. } => "invalid state",
            Self::InvalidArgument { .. } => "invalid argument",
            Self::NotFound { .. } => "not found",
            Self::Internal { .. } => "internal error",
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.label(), self.message())
    }
}

impl std::error::Error for Error {}

impl tide_disco::Error for Error {
    fn catch_all(status: StatusCode, message: String) -> Self {
        match status {
            StatusCode::BAD_REQUEST => Self::InvalidArgument { message },
            StatusCode::NOT_FOUND => Self::NotFound { message },
            _ => Self::Internal { message },
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Transport { .. } => StatusCode::BAD_GATEWAY,
            Self::DuplicateKey { .. } => StatusCode::CONFLICT,
            Self::ConstraintViolation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InvalidState { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidArgument { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RequestError> for Error {
    fn from(err: RequestError) -> Self {
        Self::invalid_argument(err)
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{err:#}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::transport(err)
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        if let Some(db_err) = err.as_database_error() {
            match db_err.kind() {
                ErrorKind::UniqueViolation => return Self::duplicate_key(db_err),
                ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation
                | ErrorKind::ForeignKeyViolation => {
                    return Self::constraint_violation(db_err);
                }
                _ => {}
            }
        }
        Self::internal(err)
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Extension functions for converting other result types into [`Result`].
pub trait ResultExt {
    type Ok;

    /// Wrap an error into a service [`Error`], preserving the original error
    /// message as context.
    fn context(self, f: impl FnOnce() -> Error) -> Result<Self::Ok>;
}

impl<T, E> ResultExt for Result<T, E>
where
    E: Display,
{
    type Ok = T;

    fn context(self, f: impl FnOnce() -> Error) -> Result<<Self as ResultExt>::Ok> {
        self.map_err(|err| f().context(err))
    }
}

macro_rules! ensure {
    ($cond:expr, $err:expr) => {
        if !$cond {
            return Err($err);
        }
    };
}
pub(crate) use ensure;
