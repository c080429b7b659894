//! Serialized command/response exchanges over one transport

use crate::command::{Command, Expect};
use crate::error::ObdError;
use crate::framer::ResponseFramer;
use crate::transport::{discard_buffered, Transport};
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

/// Text in a reply that belongs to a reset banner rather than our command
pub const UNEXPECTED_MARKER: &str = "ELM";

/// Text a setup command must answer with
pub const CONFIRMATION: &str = "OK";

struct Link<T> {
    io: T,
    framer: ResponseFramer,
    closed: watch::Receiver<bool>,
}

/// Owns the transport and allows one exchange in flight at a time
///
/// The lock covers the write and the whole response read, so a second
/// caller's command is never written while a reply is still arriving.
/// The close flag lives outside the lock so [`CommandChannel::close`] can
/// fail a read that is stuck waiting for the prompt.
pub struct CommandChannel<T> {
    link: Mutex<Link<T>>,
    closing: watch::Sender<bool>,
}

impl<T: Transport> CommandChannel<T> {
    pub fn new(io: T) -> Self {
        let (closing, closed) = watch::channel(false);
        Self {
            link: Mutex::new(Link {
                io,
                framer: ResponseFramer::new(),
                closed,
            }),
            closing,
        }
    }

    /// Send a command and return its cleaned response
    pub async fn submit(&self, command: &Command) -> Result<String, ObdError> {
        debug!("doing {}", command);
        let mut link = self.link.lock().await;
        link.exchange(command)
            .await
            .map_err(|e| e.during(command.text()))
    }

    /// Throw away any bytes the adapter sent outside an exchange
    pub async fn discard_pending(&self) -> Result<usize, ObdError> {
        let mut link = self.link.lock().await;
        let discarded = discard_buffered(&mut link.io).await?;
        if discarded > 0 {
            debug!("Discarded {} stale bytes", discarded);
        }
        Ok(discarded)
    }

    /// Close the channel and shut down the transport
    ///
    /// An exchange in flight fails with a transport error, and so does every
    /// later submit.
    pub async fn close(&self) -> Result<(), ObdError> {
        info!("Closing adapter transport");
        self.closing.send_replace(true);
        let mut link = self.link.lock().await;
        link.io.shutdown().await?;
        Ok(())
    }
}

impl<T: Transport> Link<T> {
    async fn exchange(&mut self, command: &Command) -> Result<String, ObdError> {
        match command.expect() {
            Expect::Raw => self.send_and_read(command).await,
            Expect::Confirmation => self.confirm(command).await,
        }
    }

    /// Setup commands succeed only on `OK`; anything short of a timeout or
    /// a broken link is reported as a failed setup step
    async fn confirm(&mut self, command: &Command) -> Result<String, ObdError> {
        let mut response = self
            .send_and_read(command)
            .await
            .map_err(|e| rejected(command, e))?;

        if response.contains(UNEXPECTED_MARKER) {
            info!("Early response to {}, trying again", command);
            response = self
                .send_and_read(command)
                .await
                .map_err(|e| rejected(command, e))?;
        }
        if !response.contains(CONFIRMATION) {
            return Err(ObdError::Initialization {
                step: command.description().to_string(),
                response,
            });
        }

        Ok(response)
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn send_and_read(&mut self, command: &Command) -> Result<String, ObdError> {
        if self.is_closed() {
            return Err(ObdError::Transport("channel closed".to_string()));
        }
        discard_buffered(&mut self.io).await?;
        self.io.write_all(&command.to_wire()).await?;
        self.io.flush().await?;
        self.framer.read_response(&mut self.io, &mut self.closed).await
    }
}

fn rejected(command: &Command, error: ObdError) -> ObdError {
    match error {
        ObdError::Timeout { .. } | ObdError::Transport(_) => error,
        ObdError::Protocol(condition) => ObdError::Initialization {
            step: command.description().to_string(),
            response: condition.token().to_string(),
        },
        other => ObdError::Initialization {
            step: command.description().to_string(),
            response: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};

    async fn read_command(far: &mut DuplexStream) -> String {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            far.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'\r' {
                return String::from_utf8(line).unwrap();
            }
            line.push(byte[0]);
        }
    }

    #[tokio::test]
    async fn test_submit_returns_cleaned_text() {
        let (near, mut far) = tokio::io::duplex(256);
        let channel = CommandChannel::new(near);

        let adapter = tokio::spawn(async move {
            assert_eq!(read_command(&mut far).await, "010C");
            far.write_all(b"41 0C 1A F8\r\r>").await.unwrap();
            far
        });

        let text = channel.submit(&Command::raw("010C", "rpm")).await.unwrap();
        assert_eq!(text, "41 0C 1A F8");
        adapter.await.unwrap();
    }

    #[tokio::test]
    async fn test_no_data_carries_command() {
        let (near, mut far) = tokio::io::duplex(256);
        let channel = CommandChannel::new(near);

        let adapter = tokio::spawn(async move {
            read_command(&mut far).await;
            far.write_all(b"NO DATA\r\r>").await.unwrap();
            far
        });

        let err = channel.submit(&Command::raw("0111", "throttle")).await.unwrap_err();
        assert!(matches!(err.kind(), ObdError::Protocol(ProtocolError::NoData)));
        assert!(err.to_string().contains("[0111]"));
        adapter.await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_bytes_are_discarded_before_send() {
        let (near, mut far) = tokio::io::duplex(256);
        far.write_all(b"41 0D 32\r\r>").await.unwrap();
        let channel = CommandChannel::new(near);

        let adapter = tokio::spawn(async move {
            read_command(&mut far).await;
            far.write_all(b"41 0C 1A F8\r\r>").await.unwrap();
            far
        });

        let text = channel.submit(&Command::raw("010C", "rpm")).await.unwrap();
        assert_eq!(text, "41 0C 1A F8");
        adapter.await.unwrap();
    }

    #[tokio::test]
    async fn test_confirmation_retries_once_on_banner() {
        let (near, mut far) = tokio::io::duplex(256);
        let channel = CommandChannel::new(near);

        let adapter = tokio::spawn(async move {
            assert_eq!(read_command(&mut far).await, "ATE0");
            far.write_all(b"ELM327 v1.5\r\r>").await.unwrap();
            assert_eq!(read_command(&mut far).await, "ATE0");
            far.write_all(b"OK\r\r>").await.unwrap();
            far
        });

        let text = channel.submit(&Command::echo_off()).await.unwrap();
        assert_eq!(text, "OK");
        adapter.await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_confirmation_is_initialization_error() {
        let (near, mut far) = tokio::io::duplex(256);
        let channel = CommandChannel::new(near);

        let adapter = tokio::spawn(async move {
            read_command(&mut far).await;
            far.write_all(b"ATL0\r\r>").await.unwrap();
            far
        });

        let err = channel.submit(&Command::linefeeds_off()).await.unwrap_err();
        match err.kind() {
            ObdError::Initialization { step, .. } => assert_eq!(step, "disable linefeed"),
            other => panic!("unexpected error {:?}", other),
        }
        adapter.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_token_on_setup_step_is_initialization_error() {
        let (near, mut far) = tokio::io::duplex(256);
        let channel = CommandChannel::new(near);

        let adapter = tokio::spawn(async move {
            read_command(&mut far).await;
            far.write_all(b"?\r\r>").await.unwrap();
            far
        });

        let err = channel.submit(&Command::headers_off()).await.unwrap_err();
        match err.kind() {
            ObdError::Initialization { step, response } => {
                assert_eq!(step, "disable headers");
                assert_eq!(response, "?");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!err.is_fatal());
        adapter.await.unwrap();
    }

    #[tokio::test]
    async fn test_timeout_sentinel_keeps_its_kind() {
        let (near, mut far) = tokio::io::duplex(256);
        let channel = CommandChannel::new(near);

        let adapter = tokio::spawn(async move {
            assert_eq!(read_command(&mut far).await, "010C");
            far.write_all(b"-1").await.unwrap();
            assert_eq!(read_command(&mut far).await, "ATE0");
            far.write_all(b"-1").await.unwrap();
            far
        });

        let err = channel.submit(&Command::raw("010C", "rpm")).await.unwrap_err();
        assert!(matches!(err.kind(), ObdError::Timeout { .. }));
        assert!(err.to_string().contains("[010C]"));

        let err = channel.submit(&Command::echo_off()).await.unwrap_err();
        assert!(matches!(err.kind(), ObdError::Timeout { .. }));
        adapter.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_fails_in_flight_submit() {
        let (near, mut far) = tokio::io::duplex(256);
        let channel = Arc::new(CommandChannel::new(near));

        let pending = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.submit(&Command::raw("010C", "rpm")).await })
        };
        // The command arrives but the prompt never does
        assert_eq!(read_command(&mut far).await, "010C");
        far.write_all(b"41 0C").await.unwrap();

        tokio::time::timeout(Duration::from_millis(500), channel.close())
            .await
            .expect("close blocked behind the in-flight read")
            .unwrap();

        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is_fatal());

        let err = channel.submit(&Command::raw("010D", "speed")).await.unwrap_err();
        assert!(err.is_fatal());
    }

    fn reply_to(command: &str) -> &'static [u8] {
        match command {
            "010C" => &b"41 0C 1A F8\r\r>"[..],
            _ => &b"41 0D 32\r\r>"[..],
        }
    }

    #[tokio::test]
    async fn test_concurrent_submits_are_serialized() {
        let (near, mut far) = tokio::io::duplex(256);
        let channel = Arc::new(CommandChannel::new(near));

        let adapter = tokio::spawn(async move {
            let first = read_command(&mut far).await;
            let reply = reply_to(&first);
            far.write_all(&reply[..5]).await.unwrap();

            // Mid-response: the other caller must not have written anything yet
            let mut probe = [0u8; 1];
            let early = tokio::time::timeout(Duration::from_millis(50), far.read(&mut probe)).await;
            assert!(early.is_err(), "second command written before first response completed");

            far.write_all(&reply[5..]).await.unwrap();
            let second = read_command(&mut far).await;
            far.write_all(reply_to(&second)).await.unwrap();
            (first, second, far)
        });

        let rpm = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.submit(&Command::raw("010C", "rpm")).await })
        };
        let speed = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.submit(&Command::raw("010D", "speed")).await })
        };

        let (first, second, _far) = adapter.await.unwrap();
        assert_ne!(first, second);
        assert_eq!(rpm.await.unwrap().unwrap(), "41 0C 1A F8");
        assert_eq!(speed.await.unwrap().unwrap(), "41 0D 32");
    }
}
