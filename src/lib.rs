//! Concurrent register-machine runner.
//!
//! Loads raw bytecode programs, runs each on its own VM thread and tracks
//! which VMs are still alive.

pub mod config;
pub mod utils;
pub mod virtual_machine;
