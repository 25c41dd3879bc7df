//! In-memory analyzer that speaks the device side of the wire protocol.
//!
//! Plugs into [`LogicAnalyzerDriver`](crate::driver::LogicAnalyzerDriver) through
//! the [`Transport`] trait, which makes it possible to exercise connection,
//! capture and cancellation without hardware.

use crate::capture_models::HardwareCapabilities;
use crate::transport::{Transport, TransportError};
use crate::wire_protocol::{
    CaptureRequest, Command, FrameScanner, ParsedResponse, STOP_CAPTURE_BYTE,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Produces the sample word (bit `i` = channel `i`) for a sample index
pub type SignalFn = Arc<dyn Fn(u64) -> u32 + Send + Sync>;

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// First identification line
    pub version: String,
    pub max_frequency: u32,
    pub blast_frequency: u32,
    pub buffer_size: u32,
    pub channel_count: u8,
    /// When false the device arms but never triggers
    pub trigger_fires: bool,
    /// Stop streaming after this many samples, leaving the host waiting
    pub stall_after_samples: Option<u32>,
    /// Sample count to announce and send instead of the requested total
    pub announced_samples: Option<u32>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            version: "LOGIC_ANALYZER_V6_5".to_string(),
            max_frequency: 100_000_000,
            blast_frequency: 200_000_000,
            buffer_size: 393_216,
            channel_count: 24,
            trigger_fires: true,
            stall_after_samples: None,
            announced_samples: None,
        }
    }
}

pub struct SimulatedAnalyzer {
    config: SimulatorConfig,
    signal: SignalFn,
    scanner: FrameScanner,
    output: VecDeque<u8>,
    requests: Arc<Mutex<Vec<CaptureRequest>>>,
    name: String,
}

impl SimulatedAnalyzer {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            signal: Arc::new(|i: u64| (i & 0xFFFF_FFFF) as u32),
            scanner: FrameScanner::new(),
            output: VecDeque::new(),
            requests: Arc::new(Mutex::new(Vec::new())),
            name: "sim://analyzer".to_string(),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_signal(mut self, signal: SignalFn) -> Self {
        self.signal = signal;
        self
    }

    /// Drive channels with fixed waveforms; past their end a channel holds
    /// its last value, unlisted channels read 0.
    pub fn with_waveforms(self, waveforms: Vec<(u8, Vec<u8>)>) -> Self {
        self.with_signal(Arc::new(move |i: u64| {
            waveforms.iter().fold(0u32, |word, (channel, samples)| {
                let value = samples
                    .get(i as usize)
                    .or_else(|| samples.last())
                    .copied()
                    .unwrap_or(0);
                if value != 0 && *channel < 32 {
                    word | (1 << channel)
                } else {
                    word
                }
            })
        }))
    }

    /// Capture requests received so far, shared with the caller
    pub fn requests(&self) -> Arc<Mutex<Vec<CaptureRequest>>> {
        Arc::clone(&self.requests)
    }

    fn push_line(&mut self, line: &str) {
        self.output.extend(line.as_bytes());
        self.output.push_back(b'\n');
    }

    fn handle(&mut self, frame: &ParsedResponse) {
        match Command::from_byte(frame.command) {
            Some(Command::Identify) => {
                let version = self.config.version.clone();
                self.push_line(&version);
                self.push_line(&format!("FREQ:{}", self.config.max_frequency));
                self.push_line(&format!("BLASTFREQ:{}", self.config.blast_frequency));
                self.push_line(&format!("BUFFER:{}", self.config.buffer_size));
                self.push_line(&format!("CHANNELS:{}", self.config.channel_count));
            }
            Some(Command::StartCapture) => match frame.capture_request() {
                Ok(request) => self.start_capture(request),
                Err(e) => {
                    log::debug!("Simulator rejected capture request: {}", e);
                    self.push_line("CAPTURE_ERROR");
                }
            },
            None => log::debug!("Simulator ignoring command 0x{:02X}", frame.command),
        }
    }

    fn start_capture(&mut self, request: CaptureRequest) {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        self.push_line("CAPTURE_STARTED");
        if !self.config.trigger_fires {
            return;
        }

        let total = self.config.announced_samples.unwrap_or_else(|| {
            request
                .pre_trigger_samples
                .saturating_add(request.post_trigger_samples)
        });
        let highest = 31u32.saturating_sub(request.channels.leading_zeros()) as u8;
        let width = HardwareCapabilities::bytes_per_sample(highest) as usize;

        self.output.extend(&total.to_le_bytes());
        let streamed = self.config.stall_after_samples.map_or(total, |n| n.min(total));
        for i in 0..streamed {
            let word = (self.signal)(u64::from(i)) & request.channels;
            self.output.extend(&word.to_le_bytes()[..width]);
        }
        if streamed < total {
            return;
        }

        if request.measure & 1 == 1 {
            self.output.push_back(1);
            for burst in 0..u32::from(request.loop_count) + 2 {
                self.output.extend(&(burst * 1000).to_le_bytes());
            }
        } else {
            self.output.push_back(0);
        }
    }
}

impl Transport for SimulatedAnalyzer {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if bytes == [STOP_CAPTURE_BYTE] {
            self.output.clear();
            self.push_line("CAPTURE_STOPPED");
            return Ok(());
        }
        for frame in self.scanner.feed_bytes(bytes) {
            self.handle(&frame);
        }
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.output.is_empty() {
            std::thread::sleep(Duration::from_millis(1));
            return Ok(0);
        }
        let n = buf.len().min(self.output.len());
        for (slot, byte) in buf.iter_mut().zip(self.output.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn clear(&mut self) -> Result<(), TransportError> {
        self.output.clear();
        Ok(())
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}
