//! Internal diagnostic logging helpers (`SPEC_FULL.md` §0.2).
//!
//! This is the crate's own `tracing`-based diagnostic logging, layered
//! underneath the public `ContextLogger` observability middleware
//! (`crate::observability::logging`) — the two coexist, the latter being
//! part of the dispatch pipeline's public surface, this one being internal
//! plumbing (discovery phases, registration, middleware errors).

pub mod throttled_log;

pub use throttled_log::ThrottledLog;
