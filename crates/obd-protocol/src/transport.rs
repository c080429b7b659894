//! Byte-stream transport to the adapter
//!
//! Anything that reads and writes bytes asynchronously can carry the
//! protocol: a serial port, a TCP socket to a Wi-Fi dongle, or an in-memory
//! duplex pipe in tests.

use crate::error::ObdError;
use std::future::poll_fn;
use std::pin::Pin;
use std::task::Poll;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_serial::SerialPortBuilderExt;
use tracing::info;

/// Bidirectional byte stream to an ELM327-compatible adapter
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Boxed transport for callers that pick the link at runtime
pub type DynTransport = Box<dyn Transport>;

/// Open a serial port with the 8N1 settings ELM327 adapters expect
pub fn open_serial(device: &str, baud_rate: u32) -> Result<DynTransport, ObdError> {
    info!("Opening serial port {} at {} baud", device, baud_rate);
    let port = tokio_serial::new(device, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(|e| ObdError::Transport(format!("{}: {}", device, e)))?;
    Ok(Box::new(port))
}

/// Discard whatever bytes are already buffered on the transport
///
/// Never waits for new data: reading stops as soon as the stream has nothing
/// ready. Returns the number of bytes thrown away.
pub async fn discard_buffered<T: Transport + ?Sized>(io: &mut T) -> Result<usize, ObdError> {
    let mut scratch = [0u8; 256];
    let mut discarded = 0;

    loop {
        let ready = poll_fn(|cx| {
            let mut buf = ReadBuf::new(&mut scratch);
            match Pin::new(&mut *io).poll_read(cx, &mut buf) {
                Poll::Ready(Ok(())) => Poll::Ready(Ok(Some(buf.filled().len()))),
                Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                Poll::Pending => Poll::Ready(Ok(None)),
            }
        })
        .await?;

        match ready {
            // EOF is left for the next real read to report
            Some(0) | None => return Ok(discarded),
            Some(n) => discarded += n,
        }
    }
}

/// Render raw adapter bytes with control characters made visible
pub fn escape(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        match b {
            b'\r' => out.push_str("\\r"),
            b'\n' => out.push_str("\\n"),
            b if b.is_ascii_alphanumeric() || b == b' ' => out.push(b as char),
            b => out.push_str(&format!("\\{:02x}", b)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_discard_buffered_drains_without_waiting() {
        let (mut near, mut far) = tokio::io::duplex(64);
        far.write_all(b"stale\r>").await.unwrap();

        let discarded = discard_buffered(&mut near).await.unwrap();
        assert_eq!(discarded, 7);

        // Nothing left: returns immediately instead of blocking
        assert_eq!(discard_buffered(&mut near).await.unwrap(), 0);

        far.write_all(b"fresh").await.unwrap();
        let mut buf = [0u8; 5];
        near.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"fresh");
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape(b"ATZ\r\nELM327 v1.5\r>"), "ATZ\\r\\nELM327 v1\\2e5\\r\\3e");
    }
}
