//! Error type shared by the registry, the listeners and store adapters.

use crate::types::CallerId;

pub type MxResult<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
	// data absence
	/// A requested document does not exist (store answered, id absent)
	NotFound(Box<str>),
	/// A document that existed was reported as missing by its subscription
	DocumentVanished(Box<str>),

	// caller misuse
	AlreadyUnregistered(CallerId),
	ListenerShutDown(Box<str>),
	UnknownCaller,
	InvalidArgument(String),
	/// A value type the query canonicalizer cannot render
	UnsupportedValue(&'static str),

	// store failures, passed through to callers unchanged
	PermissionDenied,
	Unavailable(String),
	DbError(String),

	/// A multi-batch write failed after `committed` batches were applied
	BatchFailed { committed: usize, source: Box<Error> },
}

impl Error {
	/// True for errors that originate in the backing store.
	pub fn is_store_error(&self) -> bool {
		matches!(self, Error::PermissionDenied | Error::Unavailable(_) | Error::DbError(_))
	}
}

impl std::fmt::Display for Error {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match self {
			Error::NotFound(path) => write!(f, "document not found: {}", path),
			Error::DocumentVanished(path) => write!(f, "document no longer exists: {}", path),
			Error::AlreadyUnregistered(caller) => {
				write!(f, "caller {} was already unregistered", caller)
			}
			Error::ListenerShutDown(path) => write!(f, "listener for {} was shut down", path),
			Error::UnknownCaller => write!(f, "unknown caller"),
			Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
			Error::UnsupportedValue(kind) => write!(f, "unsupported value type in query: {}", kind),
			Error::PermissionDenied => write!(f, "permission denied"),
			Error::Unavailable(msg) => write!(f, "store unavailable: {}", msg),
			Error::DbError(msg) => write!(f, "store error: {}", msg),
			Error::BatchFailed { committed, source } => {
				write!(f, "batch write failed after {} committed batches: {}", committed, source)
			}
		}
	}
}

impl std::error::Error for Error {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Error::BatchFailed { source, .. } => Some(source.as_ref()),
			_ => None,
		}
	}
}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Self::InvalidArgument(err.to_string())
	}
}

// vim: ts=4
