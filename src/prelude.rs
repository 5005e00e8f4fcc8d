//! Common imports used throughout the crate.
//!
//! Mirrors the control-api-mock's `prelude` module: re-exports the `slog`
//! logging macros so call sites don't need to import them individually.

pub use slog::{debug, error, info, trace, warn};
