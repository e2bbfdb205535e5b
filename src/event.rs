//! Event line protocol
//!
//! Tools talk to the framework with one event per line on their standard
//! streams: `TYPE|sender|payload`. Only the first two `|` are structural; the
//! payload keeps any further delimiters. Routing never looks at the payload.

use std::fmt;

use crate::error::{FrameError, Result};

/// Field delimiter on the wire.
pub const DELIMITER: char = '|';

/// A parsed event. Ephemeral: created by the router and consumed immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub event_type: String,
    /// Sender as written on the wire. Informational only, never used for routing.
    pub sender: String,
    pub payload: String,
    /// The line exactly as received, without its line terminator
    pub raw: String,
}

impl Event {
    /// Parse one line. A line needs at least `TYPE|sender`; the type must be
    /// a non-empty token without whitespace.
    pub fn parse(line: &str) -> Result<Self> {
        let raw = line.trim_end_matches(['\r', '\n']);
        let mut fields = raw.splitn(3, DELIMITER);

        let event_type = fields.next().unwrap_or_default().trim();
        let sender = fields
            .next()
            .ok_or_else(|| FrameError::MalformedEvent(format!("missing sender field: {:?}", raw)))?;
        let payload = fields.next().unwrap_or_default();

        if event_type.is_empty() {
            return Err(FrameError::MalformedEvent(format!("empty event type: {:?}", raw)));
        }
        if event_type.contains(char::is_whitespace) {
            return Err(FrameError::MalformedEvent(format!("invalid event type: {:?}", raw)));
        }

        Ok(Self {
            event_type: event_type.to_string(),
            sender: sender.to_string(),
            payload: payload.to_string(),
            raw: raw.to_string(),
        })
    }

    /// The line to write to a destination, newline included
    pub fn to_line(&self) -> String {
        format!("{}\n", self.raw)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}
