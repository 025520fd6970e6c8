//! CLI command implementations.
//!
//! Each submodule implements a boxrun CLI command with pure core logic
//! separated from IO for testability.

pub mod fetch;
pub mod init;
pub mod run;
pub mod sandbox;
pub mod serve;
