//! Command implementations

mod listen;
mod send;

pub use listen::listen_command;
pub use send::{send_command, SendRequest};
