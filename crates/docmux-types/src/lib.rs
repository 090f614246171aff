//! Shared types, the store adapter trait, and errors for docmux.
//!
//! Kept apart from the multiplexer itself so store adapters only depend on
//! the interface they implement.

#![forbid(unsafe_code)]

pub mod error;
pub mod patch;
pub mod prelude;
pub mod query;
pub mod store_adapter;
pub mod types;
pub mod utils;
pub mod value;

// vim: ts=4
