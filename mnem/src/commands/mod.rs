//! Command implementations for mnem CLI.
//!
//! Each submodule implements the logic for a command group.

pub mod auth;
pub mod connect;
pub mod memory;
