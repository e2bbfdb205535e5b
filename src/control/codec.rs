//! Control socket codecs.
//!
//! `ControlCodec` is the server side: it decodes newline-terminated command
//! lines and encodes dot-terminated responses. `ResponseCodec` is the mirror
//! image used by `ControlClient`.

use std::io;

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{MAX_COMMAND_LENGTH, Response, TERMINATOR};
use crate::lines::{BoundedLine, BoundedLines};

/// Longest response line a client accepts
const MAX_RESPONSE_LINE: usize = 1024 * 1024;

/// One inbound command line
pub type CommandLine = BoundedLine;

fn to_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end_matches('\r').to_string()
}

/// Server-side codec
#[derive(Debug, Clone)]
pub struct ControlCodec {
    lines: BoundedLines,
}

impl ControlCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_COMMAND_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            lines: BoundedLines::new(max_length),
        }
    }
}

impl Default for ControlCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ControlCodec {
    type Item = CommandLine;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.lines.decode(src)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.lines.decode_eof(src)
    }
}

impl Encoder<Response> for ControlCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Response, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_response(&item, dst);
        Ok(())
    }
}

fn encode_response(response: &Response, dst: &mut BytesMut) {
    for line in response.lines() {
        dst.reserve(line.len() + 2);
        if line.starts_with('.') {
            dst.put_u8(b'.');
        }
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
    }
    dst.put_slice(TERMINATOR.as_bytes());
    dst.put_u8(b'\n');
}

/// Client-side codec: encodes commands, decodes dot-terminated responses
#[derive(Debug, Default)]
pub struct ResponseCodec {
    pending: Vec<String>,
}

impl ResponseCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for ResponseCodec {
    type Item = Response;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(pos) = src.iter().position(|&b| b == b'\n') {
            let raw = src.split_to(pos + 1);
            let line = to_text(&raw[..pos]);

            if line == TERMINATOR {
                return Ok(Some(Response::from_lines(std::mem::take(&mut self.pending))));
            }
            let line = match line.strip_prefix('.') {
                Some(unstuffed) => unstuffed.to_string(),
                None => line,
            };
            self.pending.push(line);
        }

        if src.len() > MAX_RESPONSE_LINE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Response line too long: {} > {}", src.len(), MAX_RESPONSE_LINE),
            ));
        }
        Ok(None)
    }
}

impl Encoder<&str> for ResponseCodec {
    type Error = io::Error;

    fn encode(&mut self, item: &str, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.contains('\n') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Command must be a single line",
            ));
        }
        dst.reserve(item.len() + 1);
        dst.put_slice(item.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}
