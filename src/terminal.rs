use crate::transport::{Transport, TransportError};
use crate::wire_protocol::OutputPacket;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const READ_CHUNK: usize = 4096;

/// Shared flag used to cancel an in-flight read from another thread
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TerminalError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Timeout error: Expected {expected} but got '{actual}'. Likely due to a timeout.")]
    Timeout { expected: String, actual: String },

    #[error("Read cancelled")]
    Cancelled,

    #[error("UTF-8 conversion error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Line and binary reader on top of a [`Transport`].
///
/// All timeouts are inactivity timeouts: the clock restarts whenever bytes
/// arrive.
pub struct AnalyzerTerminal {
    transport: Box<dyn Transport>,
    pending: VecDeque<u8>,
}

impl AnalyzerTerminal {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            pending: VecDeque::new(),
        }
    }

    pub fn describe(&self) -> String {
        self.transport.describe()
    }

    /// Frame and send a packet
    pub fn send(&mut self, packet: &OutputPacket) -> Result<(), TerminalError> {
        self.transport.write_all(&packet.to_bytes())?;
        Ok(())
    }

    /// Send bytes outside of framing
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<(), TerminalError> {
        self.transport.write_all(bytes)?;
        Ok(())
    }

    /// Drop buffered input on both sides
    pub fn flush(&mut self) -> Result<(), TerminalError> {
        self.pending.clear();
        self.transport.clear()?;
        Ok(())
    }

    /// Read and discard input until nothing arrives for `quiet`
    pub fn drain(&mut self, quiet: Duration) -> Result<usize, TerminalError> {
        let mut discarded = self.pending.len();
        self.pending.clear();
        let mut last_activity = Instant::now();
        while last_activity.elapsed() < quiet {
            let n = self.fill()?;
            if n > 0 {
                discarded += n;
                self.pending.clear();
                last_activity = Instant::now();
            }
        }
        Ok(discarded)
    }

    /// Read one `\n` terminated line, without the terminator
    pub fn read_line(
        &mut self,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> Result<String, TerminalError> {
        let mut last_activity = Instant::now();
        loop {
            if let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.pending.drain(..=end).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(String::from_utf8(line)?);
            }

            self.check_cancel(cancel)?;
            if last_activity.elapsed() >= timeout {
                return Err(TerminalError::Timeout {
                    expected: "a line terminated by \\n".to_string(),
                    actual: self.pending_tail(),
                });
            }
            if self.fill()? > 0 {
                last_activity = Instant::now();
            }
        }
    }

    /// Read exactly `count` bytes
    pub fn read_exact(
        &mut self,
        count: usize,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<u8>, TerminalError> {
        let mut last_activity = Instant::now();
        while self.pending.len() < count {
            self.check_cancel(cancel)?;
            if last_activity.elapsed() >= timeout {
                return Err(TerminalError::Timeout {
                    expected: format!("{} bytes", count),
                    actual: format!("{} bytes", self.pending.len()),
                });
            }
            if self.fill()? > 0 {
                last_activity = Instant::now();
            }
        }
        Ok(self.pending.drain(..count).collect())
    }

    pub fn read_u32(
        &mut self,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> Result<u32, TerminalError> {
        let bytes = self.read_exact(4, timeout, cancel)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn check_cancel(&self, cancel: Option<&CancelToken>) -> Result<(), TerminalError> {
        match cancel {
            Some(token) if token.is_cancelled() => Err(TerminalError::Cancelled),
            _ => Ok(()),
        }
    }

    fn fill(&mut self) -> Result<usize, TerminalError> {
        let mut buf = [0u8; READ_CHUNK];
        let n = self.transport.read(&mut buf)?;
        self.pending.extend(&buf[..n]);
        Ok(n)
    }

    fn pending_tail(&self) -> String {
        let skip = self.pending.len().saturating_sub(16);
        let tail: Vec<u8> = self.pending.iter().skip(skip).copied().collect();
        String::from_utf8_lossy(&tail).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Replays a fixed byte script, a few bytes per read
    struct ScriptedTransport {
        script: VecDeque<u8>,
        written: Vec<u8>,
    }

    impl Transport for ScriptedTransport {
        fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
            self.written.extend_from_slice(bytes);
            Ok(())
        }

        fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
            let n = buf.len().min(3).min(self.script.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.script.pop_front().unwrap_or_default();
            }
            Ok(n)
        }

        fn clear(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn describe(&self) -> String {
            "script".to_string()
        }
    }

    fn terminal(script: &[u8]) -> AnalyzerTerminal {
        AnalyzerTerminal::new(Box::new(ScriptedTransport {
            script: script.iter().copied().collect(),
            written: Vec::new(),
        }))
    }

    #[test]
    fn test_read_lines_and_binary() {
        let mut script = b"HELLO\r\nFREQ:100\n".to_vec();
        script.extend_from_slice(&7u32.to_le_bytes());
        let mut term = terminal(&script);
        let timeout = Duration::from_millis(100);

        assert_eq!(term.read_line(timeout, None).unwrap(), "HELLO");
        assert_eq!(term.read_line(timeout, None).unwrap(), "FREQ:100");
        assert_eq!(term.read_u32(timeout, None).unwrap(), 7);
    }

    #[test]
    fn test_read_line_times_out() {
        let mut term = terminal(b"partial");
        let result = term.read_line(Duration::from_millis(20), None);
        assert!(matches!(result, Err(TerminalError::Timeout { actual, .. }) if actual == "partial"));
    }

    #[test]
    fn test_read_exact_cancelled() {
        let mut term = terminal(b"");
        let token = CancelToken::new();
        token.cancel();
        let result = term.read_exact(10, Duration::from_secs(5), Some(&token));
        assert!(matches!(result, Err(TerminalError::Cancelled)));
    }
}
