//! Output sinks for replies and notifications

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use serde_json::Value;

use fc_core::ControllerId;
use fc_protocol::Notification;

/// Write a reply payload as compact JSON to `path`, or stdout
pub fn write_reply(path: Option<&Path>, reply: &Value) -> io::Result<()> {
    let json = serde_json::to_string(reply)?;
    match path {
        Some(path) => std::fs::write(path, json),
        None => {
            let mut stdout = io::stdout().lock();
            writeln!(stdout, "{}", json)
        }
    }
}

/// Where notifications are written, one line each
pub enum NotificationSink {
    Stdout,
    File(File),
}

impl NotificationSink {
    /// Truncate and open `path`, or fall back to stdout
    pub fn open(path: Option<&Path>) -> io::Result<Self> {
        match path {
            Some(path) => Ok(Self::File(File::create(path)?)),
            None => Ok(Self::Stdout),
        }
    }

    /// Write `"{controller_id} {json}"` and flush
    pub fn write(&mut self, controller_id: &ControllerId, notification: &Notification) -> io::Result<()> {
        let line = format_notification(controller_id, notification)?;
        match self {
            Self::Stdout => {
                let mut stdout = io::stdout().lock();
                writeln!(stdout, "{}", line)?;
                stdout.flush()
            }
            Self::File(file) => {
                writeln!(file, "{}", line)?;
                file.flush()
            }
        }
    }
}

pub fn format_notification(
    controller_id: &ControllerId,
    notification: &Notification,
) -> io::Result<String> {
    Ok(format!(
        "{} {}",
        controller_id,
        serde_json::to_string(notification)?
    ))
}

/// Print an error message in red to stderr
pub fn print_error(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print("✗ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}
