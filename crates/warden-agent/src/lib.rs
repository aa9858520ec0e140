//! Supervision of externally launched game server processes.

pub mod backup;
pub mod config;
pub mod launcher;
pub mod log_tail;
pub mod logging;
pub mod notify;
pub mod os_process;
pub mod process;
pub mod query;
pub mod rcon;
pub mod sequence;
mod support;

#[cfg(test)]
mod testing;

pub use support::format_error_chain;
