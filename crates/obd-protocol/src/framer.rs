//! Prompt-terminated response framing
//!
//! The adapter has no message framing beyond the `>` prompt it prints when it
//! is ready for the next command. Everything read up to that prompt is one
//! response, possibly split across many reads and padded with progress text.

use crate::error::{ObdError, ProtocolError};
use crate::transport::{escape, Transport};
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tracing::debug;

/// Prompt printed by the adapter when a response is complete
pub const PROMPT: u8 = b'>';

/// Marker some links emit in place of a reply when the adapter stays silent
pub const NO_RESPONSE_SENTINEL: &[u8] = b"-1";

/// Progress text printed while the adapter detects the bus protocol
pub const SEARCHING: &str = "SEARCHING...";

/// Read buffer size for a single transport read
pub const READ_CHUNK: usize = 512;

/// Accumulates transport bytes into one cleaned response
#[derive(Debug, Default)]
pub struct ResponseFramer {
    accumulator: Vec<u8>,
}

impl ResponseFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read until the prompt arrives and return the cleaned response text
    ///
    /// Once `closed` turns true the read is abandoned with a transport error,
    /// even if the adapter never sends the prompt.
    pub async fn read_response<T: Transport + ?Sized>(
        &mut self,
        io: &mut T,
        closed: &mut watch::Receiver<bool>,
    ) -> Result<String, ObdError> {
        self.accumulator.clear();
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let n = tokio::select! {
                biased;
                _ = wait_closed(closed) => {
                    return Err(ObdError::Transport(format!(
                        "closed while reading. Received [{}]",
                        escape(&self.accumulator)
                    )));
                }
                read = io.read(&mut chunk) => read?,
            };
            if n == 0 {
                return Err(ObdError::Transport(format!(
                    "connection closed. Received [{}]",
                    escape(&self.accumulator)
                )));
            }
            self.accumulator.extend_from_slice(&chunk[..n]);

            if self.accumulator.starts_with(NO_RESPONSE_SENTINEL) {
                return Err(ObdError::Timeout {
                    received: escape(&self.accumulator),
                });
            }

            if chunk[..n].contains(&PROMPT) {
                break;
            }
        }

        debug!("Received: {}", escape(&self.accumulator));
        classify(&String::from_utf8_lossy(&self.accumulator))
    }
}

/// Resolves once the close flag is set; never resolves if its sender is gone
/// without setting it
async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let was_closed = closed.wait_for(|closed| *closed).await.is_ok();
    if !was_closed {
        std::future::pending::<()>().await;
    }
}

/// Clean a complete response and map adapter error text to errors
pub fn classify(response: &str) -> Result<String, ObdError> {
    let cleaned = response.replace(SEARCHING, "");
    let cleaned = cleaned.trim();

    if let Some(condition) = ProtocolError::scan(cleaned) {
        return Err(condition.into());
    }

    Ok(cleaned
        .replace(PROMPT as char, "")
        .trim_end_matches(['\r', '\n', ' '])
        .to_string())
}
