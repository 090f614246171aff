pub use docmux_types::prelude::*;

// vim: ts=4
