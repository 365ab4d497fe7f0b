//! tspfix library crate
//!
//! The build-fix engine behind the `tspfix` binary: subprocess execution,
//! error extraction, line-range patching with synchronized versions, and the
//! agent conversation that turns fixes into spec edits.

pub mod agent;
pub mod cancel;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod orchestrator;
pub mod parse;
pub mod patch;
pub mod process;
pub mod sources;
pub mod toolchain;
pub mod util;
pub mod versions;

pub use error::{Error, Result};
