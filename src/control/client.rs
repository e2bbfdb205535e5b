//! Control client.
//!
//! Sends one command line at a time and reads the dot-terminated response.
//! No timing heuristics: a response is complete when its terminator arrives.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;

use super::codec::ResponseCodec;
use super::protocol::Response;
use crate::error::{FrameError, Result};

/// Default time to wait for a complete response
const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct ControlClient {
    framed: Framed<TcpStream, ResponseCodec>,
    response_timeout: Duration,
}

impl ControlClient {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| FrameError::Connection(format!("Failed to connect: {}", e)))?;
        Ok(Self {
            framed: Framed::new(stream, ResponseCodec::new()),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        })
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Send `command` and wait for its response
    pub async fn send(&mut self, command: &str) -> Result<Response> {
        self.framed
            .send(command)
            .await
            .map_err(|e| FrameError::Connection(format!("Failed to send command: {}", e)))?;
        self.recv().await
    }

    /// Read the next response frame
    pub async fn recv(&mut self) -> Result<Response> {
        let next = tokio::time::timeout(self.response_timeout, self.framed.next())
            .await
            .map_err(|_| FrameError::Connection("Timed out waiting for response".to_string()))?;
        match next {
            Some(Ok(response)) => Ok(response),
            Some(Err(e)) => Err(FrameError::Connection(e.to_string())),
            None => Err(FrameError::Connection("Connection closed by server".to_string())),
        }
    }
}
