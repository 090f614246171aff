pub use crate::error::{Error, MxResult};
pub use crate::types::{CallerId, Document, LogicalKey};

pub use tracing::{debug, error, info, warn};

// vim: ts=4
