//! End-to-end tests against a real server binary
//!
//! Every scenario here skips unless `WEBPROBE_SUT_BIN` (or `WEBSERV_BIN`)
//! names a server, and they run serially since they share fixed ports.

pub mod infrastructure;

pub use infrastructure::{RunningSut, SutTestHarness};
