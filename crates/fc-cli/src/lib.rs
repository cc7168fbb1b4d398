//! foris-client: command-line front ends for foris-controller
//!
//! Provides the `foris-client` binary, which sends one request and prints the
//! reply, and `foris-listener`, which prints notifications as they arrive.
//! Both are thin layers over `fc_bus`.

pub mod args;
pub mod commands;
pub mod logging;
pub mod output;
