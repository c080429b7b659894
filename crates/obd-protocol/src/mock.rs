//! Scripted ELM327 emulator for tests and hardware-free runs
//!
//! Speaks the adapter side of the protocol over an in-memory duplex pipe:
//! echo until `ATE0`, `OK` for the supported AT settings, canned mode 01
//! replies, and `>` after every response.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Notify;
use tracing::debug;

/// Banner printed on reset
pub const MOCK_BANNER: &str = "ELM327 v1.5";

const LATE_BANNER_DELAY: Duration = Duration::from_millis(50);

/// Emulated adapter configuration
#[derive(Debug, Clone)]
pub struct MockAdapter {
    echo_enabled: bool,
    linefeeds_enabled: bool,
    headers_enabled: bool,
    timeout_code: Option<u8>,
    pids: HashMap<u8, String>,
    replies: Arc<Mutex<HashMap<String, String>>>,
    unreliable_timeouts: HashSet<u8>,
    late_banner: Option<String>,
}

/// Observes a running [`MockAdapter`]
#[derive(Clone)]
pub struct MockHandle {
    log: Arc<Mutex<Vec<String>>>,
    replies: Arc<Mutex<HashMap<String, String>>>,
    hangup: Arc<Notify>,
}

impl MockHandle {
    /// Every command received so far, in order
    pub fn commands(&self) -> Vec<String> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Change the verbatim reply to `command` while the adapter runs
    pub fn set_reply(&self, command: &str, body: &str) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.insert(command.to_uppercase(), body.to_string());
        }
    }

    /// Go back to built-in handling for `command`
    pub fn clear_reply(&self, command: &str) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.remove(&command.to_uppercase());
        }
    }

    /// Drop the adapter's end of the pipe
    pub fn disconnect(&self) {
        self.hangup.notify_one();
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        let pids = [
            (0x00, "BE3FA813"), // PIDs supported 01-20
            (0x04, "64"),       // Engine load: 39.2%
            (0x05, "4F"),       // Coolant temp: 39°C
            (0x0C, "1AF8"),     // RPM: 1726
            (0x0D, "28"),       // Speed: 40 km/h
            (0x0E, "8C"),       // Timing advance: 6°
            (0x10, "0028"),     // MAF: 10 g/s
            (0x11, "45"),       // Throttle: 27%
            (0x1F, "012C"),     // Run time: 300 s
        ];
        Self {
            echo_enabled: true,
            linefeeds_enabled: true,
            headers_enabled: false,
            timeout_code: None,
            pids: pids.into_iter().map(|(pid, data)| (pid, data.to_string())).collect(),
            replies: Arc::new(Mutex::new(HashMap::new())),
            unreliable_timeouts: HashSet::new(),
            late_banner: None,
        }
    }
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer mode 01 `pid` with compact hex `data`
    pub fn with_pid(mut self, pid: u8, data: &str) -> Self {
        self.pids.insert(pid, data.to_string());
        self
    }

    /// Answer `command` with `body` verbatim, ahead of any built-in handling
    pub fn with_reply(self, command: &str, body: &str) -> Self {
        if let Ok(mut replies) = self.replies.lock() {
            replies.insert(command.to_uppercase(), body.to_string());
        }
        self
    }

    /// Data queries answer `NO DATA` while one of these `ATST` values is set
    pub fn with_unreliable_timeouts(mut self, codes: impl IntoIterator<Item = u8>) -> Self {
        self.unreliable_timeouts.extend(codes);
        self
    }

    /// Send `text` again shortly after answering `ATZ`
    pub fn with_late_banner(mut self, text: &str) -> Self {
        self.late_banner = Some(text.to_string());
        self
    }

    /// Start serving on a new duplex pipe and return the client end
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(self) -> (DuplexStream, MockHandle) {
        let (client, adapter) = tokio::io::duplex(4096);
        let handle = MockHandle {
            log: Arc::new(Mutex::new(Vec::new())),
            replies: Arc::clone(&self.replies),
            hangup: Arc::new(Notify::new()),
        };
        tokio::spawn(self.serve(adapter, handle.clone()));
        (client, handle)
    }

    async fn serve(mut self, mut stream: DuplexStream, handle: MockHandle) {
        let mut buffer = Vec::new();
        let mut byte = [0u8; 1];

        loop {
            let read = tokio::select! {
                read = stream.read(&mut byte) => read,
                _ = handle.hangup.notified() => {
                    debug!("Mock adapter hanging up");
                    return;
                }
            };

            match read {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }

            if self.echo_enabled && stream.write_all(&byte).await.is_err() {
                return;
            }

            match byte[0] {
                b'\r' => {
                    let command = String::from_utf8_lossy(&buffer).trim().to_uppercase();
                    buffer.clear();
                    if command.is_empty() {
                        continue;
                    }

                    if let Ok(mut log) = handle.log.lock() {
                        log.push(command.clone());
                    }
                    let response = self.process_command(&command);
                    if stream.write_all(response.as_bytes()).await.is_err() {
                        return;
                    }

                    if command == "ATZ" {
                        if let Some(banner) = self.late_banner.clone() {
                            tokio::time::sleep(LATE_BANNER_DELAY).await;
                            if stream.write_all(banner.as_bytes()).await.is_err() {
                                return;
                            }
                        }
                    }
                }
                b'\n' => {}
                ch => buffer.push(ch),
            }
        }
    }

    fn line_ending(&self) -> &'static str {
        if self.linefeeds_enabled {
            "\r\n"
        } else {
            "\r"
        }
    }

    fn process_command(&mut self, cmd: &str) -> String {
        let le = self.line_ending();

        let scripted = self.replies.lock().ok().and_then(|r| r.get(cmd).cloned());
        if let Some(body) = scripted {
            return format!("{body}{le}{le}>");
        }

        let body = match cmd {
            "ATZ" => {
                let pids = std::mem::take(&mut self.pids);
                let replies = Arc::clone(&self.replies);
                let unreliable = std::mem::take(&mut self.unreliable_timeouts);
                let late_banner = self.late_banner.take();
                *self = Self {
                    pids,
                    replies,
                    unreliable_timeouts: unreliable,
                    late_banner,
                    ..Self::default()
                };
                let le = self.line_ending();
                return format!("{le}{le}{MOCK_BANNER}{le}{le}>");
            }
            "ATE0" | "ATE1" => {
                self.echo_enabled = cmd == "ATE1";
                "OK".to_string()
            }
            "ATL0" | "ATL1" => {
                self.linefeeds_enabled = cmd == "ATL1";
                "OK".to_string()
            }
            "ATH0" | "ATH1" => {
                self.headers_enabled = cmd == "ATH1";
                "OK".to_string()
            }
            _ if cmd.starts_with("ATST") => match u8::from_str_radix(&cmd[4..], 16) {
                Ok(code) => {
                    self.timeout_code = Some(code);
                    "OK".to_string()
                }
                Err(_) => "?".to_string(),
            },
            c if c.len() == 4 && c.starts_with("01") => self.current_data(&c[2..]),
            _ => "?".to_string(),
        };

        format!("{body}{le}{le}>")
    }

    fn current_data(&self, pid_hex: &str) -> String {
        let Ok(pid) = u8::from_str_radix(pid_hex, 16) else {
            return "?".to_string();
        };
        if self
            .timeout_code
            .is_some_and(|code| self.unreliable_timeouts.contains(&code))
        {
            return "NO DATA".to_string();
        }
        let Some(data) = self.pids.get(&pid) else {
            return "NO DATA".to_string();
        };

        let frame = spaced(&format!("41{:02X}{}", pid, data));
        if self.headers_enabled {
            return format!("7E8 {:02X} {}", 2 + data.len() / 2, frame);
        }
        frame
    }
}

/// Insert a space between every pair of hex digits
fn spaced(hex: &str) -> String {
    hex.as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exchange(stream: &mut DuplexStream, command: &str) -> String {
        stream.write_all(format!("{command}\r").as_bytes()).await.unwrap();
        let mut response = Vec::new();
        let mut byte = [0u8; 1];
        while !response.ends_with(b">") {
            stream.read_exact(&mut byte).await.unwrap();
            response.push(byte[0]);
        }
        String::from_utf8(response).unwrap()
    }

    #[tokio::test]
    async fn test_echo_until_disabled() {
        let (mut stream, handle) = MockAdapter::new().spawn();

        assert_eq!(exchange(&mut stream, "ATE0").await, "ATE0\rOK\r\n\r\n>");
        assert_eq!(exchange(&mut stream, "ATL0").await, "OK\r\n\r\n>");
        assert_eq!(exchange(&mut stream, "010C").await, "41 0C 1A F8\r\r>");
        assert_eq!(handle.commands(), ["ATE0", "ATL0", "010C"]);
    }

    #[tokio::test]
    async fn test_unknown_pid_and_command() {
        let (mut stream, _handle) = MockAdapter::new().spawn();
        exchange(&mut stream, "ATE0").await;
        exchange(&mut stream, "ATL0").await;

        assert_eq!(exchange(&mut stream, "0142").await, "NO DATA\r\r>");
        assert_eq!(exchange(&mut stream, "XYZ").await, "?\r\r>");
    }

    #[tokio::test]
    async fn test_reset_keeps_script() {
        let (mut stream, _handle) = MockAdapter::new().with_pid(0x0D, "32").spawn();
        exchange(&mut stream, "ATE0").await;

        let banner = exchange(&mut stream, "ATZ").await;
        assert!(banner.contains(MOCK_BANNER));
        // Echo is back on after reset
        assert_eq!(exchange(&mut stream, "010D").await, "010D\r41 0D 32\r\n\r\n>");
    }

    #[tokio::test]
    async fn test_headers() {
        let (mut stream, _handle) = MockAdapter::new().spawn();
        exchange(&mut stream, "ATE0").await;
        exchange(&mut stream, "ATL0").await;
        exchange(&mut stream, "ATH1").await;
        assert_eq!(exchange(&mut stream, "010D").await, "7E8 03 41 0D 28\r\r>");
    }

    #[test]
    fn test_spaced() {
        assert_eq!(spaced("410C1AF8"), "41 0C 1A F8");
    }
}
