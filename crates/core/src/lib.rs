//! CloudBox function engine domain logic.
//!
//! Everything in this crate is free of database access so it can be unit
//! tested in isolation:
//!
//! - [`runtime`] — the catalogue of supported runtimes and languages.
//! - [`functions`] — function status machine, defaults and validation.
//! - [`execution`] — ledger status and error-code constants.
//! - [`sandbox`] — the pluggable [`SandboxProvider`](sandbox::SandboxProvider)
//!   interface and its process/container implementations.
//! - [`build`] — turning function source into a runnable artifact.

pub mod build;
pub mod error;
pub mod execution;
pub mod functions;
pub mod runtime;
pub mod sandbox;
pub mod types;
