//! Refinery - merge queue CLI
//!
//! Submits merge requests to a file-backed queue, inspects it, and runs the
//! refinery engine that merges queued branches into their targets.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod cli;
pub mod commands;
pub mod context;
pub mod output;
pub mod setup;

pub use context::AppContext;
pub use output::OutputFormat;
