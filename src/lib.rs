//! Concurrent execution core for a search/indexing extension embedded in a
//! single-threaded host database server.
//!
//! The host serves clients from one event loop and guards all of its data
//! with a single process-wide lock. Anything slow (full-text search,
//! document indexing) must leave that loop. This crate provides the three
//! pieces that make that safe:
//!
//! - [`concurrent::PoolRegistry`] and [`concurrent::handle_command`]: fixed
//!   worker pools plus a dispatcher that copies a command's arguments,
//!   suspends its client, and completes it on a pool thread.
//! - [`concurrent::SearchContext`]: cooperative yielding of the host lock
//!   for long-running tasks, with tracked key handles that are closed on
//!   yield and reopened on resume.
//! - [`indexing::queue::AsyncIndexQueue`]: a dedicated worker that batches
//!   per-index document mutations and drains the deepest queue first.
//!
//! [`runtime::Runtime`] wires the three together from a
//! [`config::RuntimeConfig`]. The host itself stays abstract behind
//! [`host::Host`]; [`host::sim::SimHost`] is an in-process stand-in for
//! tests.

pub mod concurrent;
pub mod config;
pub mod error;
pub mod host;
pub mod indexing;
pub mod runtime;

pub use config::RuntimeConfig;
pub use error::{GriddleError, Result};
pub use runtime::Runtime;
