//! Client-side realtime subscription multiplexer.
//!
//! Many consumers ask for the same documents, collections or queries; the
//! registry keeps one store subscription per logical key, hands ownership
//! over when consumers come and go, and serves collections by id through
//! bounded chunk subscriptions.
//!
//! ```ignore
//! let registry = SubscriptionRegistry::new(store);
//! let facade = Facade::new(registry);
//! let mount = facade.mount();
//! mount.use_docs("tags", &["a", "b"], on_result, Some(on_error))?;
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![forbid(unsafe_code)]

pub mod batch;
pub mod cache;
pub mod canonical;
pub mod chunked;
mod collection;
pub mod config;
pub mod deliver;
pub mod facade;
pub mod ownership;
pub mod prelude;
pub mod registry;
mod shared;

pub use docmux_types as types;

pub use batch::{Cascade, DeleteReport, LinkKind, OnDelete};
pub use canonical::canonical_key;
pub use chunked::{ChunkedIdListener, ListenerState};
pub use config::RegistryConfig;
pub use deliver::{DocCallback, DocsCallback, ErrorCallback};
pub use facade::{Facade, HookValue, Mount, Registered, ResultCallback, Want};
pub use registry::{
	DocRegistration, DocsRegistration, QueryRegistration, Registration, RegistryStats,
	SubscriptionRegistry,
};

// vim: ts=4
