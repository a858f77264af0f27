//! Pure data types for shellpipe: failures, execution results, command configuration.
//!
//! This crate is a leaf dependency with no processes, no threads, no I/O.
//! It exists so that consumers can inspect and serialize shellpipe results
//! without pulling in the execution engine.

pub mod config;
pub mod failure;
pub mod result;
pub mod status;

// Flat re-exports for convenience
pub use config::*;
pub use failure::*;
pub use result::*;
pub use status::*;
