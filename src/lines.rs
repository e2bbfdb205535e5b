//! Bounded newline-delimited decoding
//!
//! Used for tool stdout/stderr and for control socket commands. A line longer
//! than the limit is reported once as `Overlong` and its bytes are dropped up
//! to the next newline, so a peer that never sends `\n` cannot grow the buffer.

use std::io;

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

/// One decoded line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundedLine {
    /// Line text without its terminator. Invalid UTF-8 is replaced.
    Line(String),
    /// The line exceeded the length limit and was discarded
    Overlong,
}

fn to_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end_matches('\r').to_string()
}

#[derive(Debug, Clone)]
pub struct BoundedLines {
    max_length: usize,
    /// Dropping the rest of an overlong line
    discarding: bool,
}

impl BoundedLines {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            discarding: false,
        }
    }
}

impl Decoder for BoundedLines {
    type Item = BoundedLine;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let newline = src.iter().position(|&b| b == b'\n');

        match (self.discarding, newline) {
            (true, Some(pos)) => {
                src.advance(pos + 1);
                self.discarding = false;
                // Report once the peer has finished sending the line
                Ok(Some(BoundedLine::Overlong))
            }
            (true, None) => {
                src.clear();
                Ok(None)
            }
            (false, Some(pos)) => {
                let line = src.split_to(pos + 1);
                if pos > self.max_length {
                    return Ok(Some(BoundedLine::Overlong));
                }
                Ok(Some(BoundedLine::Line(to_text(&line[..pos]))))
            }
            (false, None) if src.len() > self.max_length => {
                src.clear();
                self.discarding = true;
                Ok(None)
            }
            (false, None) => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        if self.discarding {
            self.discarding = false;
            src.clear();
            return Ok(Some(BoundedLine::Overlong));
        }
        if src.is_empty() {
            return Ok(None);
        }
        // Final line without a trailing newline
        let line = src.split_to(src.len());
        Ok(Some(BoundedLine::Line(to_text(&line))))
    }
}
