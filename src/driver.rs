//! Device drivers: connection lifecycle, capability negotiation and capture
//! orchestration over the wire protocol.

use crate::capture_models::{
    AnalyzerChannel, CaptureConfigError, CaptureResult, CaptureSession, CaptureStatus,
    ChannelCapabilities, ConnectionParams, ConnectionResult, ConnectionTarget, DeviceFailure,
    DeviceInfo, DriverType, FeatureFlags, HardwareCapabilities, SamplingCapabilities,
    TriggerCapabilities,
};
use crate::connector::{ConnectionError, Connector};
use crate::terminal::{AnalyzerTerminal, CancelToken, TerminalError};
use crate::transport::Transport;
use crate::trigger_config::{EdgeTrigger, TriggerConfig, TriggerType, EXTERNAL_TRIGGER_CHANNEL};
use crate::wire_protocol::{Command, OutputPacket, STOP_CAPTURE_BYTE};
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Identification line prefix sent by supported firmware
pub const IDENTIFY_PREFIX: &str = "LOGIC_ANALYZER_";

/// Samples per `Data` event
pub const CHUNK_SAMPLES: usize = 4096;

const CAPTURE_STARTED: &str = "CAPTURE_STARTED";
const DRAIN_QUIET: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    Connected,
    Configuring,
    WaitingForTrigger,
    Capturing,
    ProcessingData,
    CaptureCompleted,
    CaptureCancelled,
    Disconnected,
}

/// Raw sample words as received, bit `i` = channel `i` of the sending device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChunk {
    pub first_sample: u64,
    pub total_samples: u64,
    pub words: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    Status { device_id: String, status: DriverStatus },
    Data { device_id: String, chunk: DataChunk },
    Error { device_id: String, message: String },
}

impl DriverEvent {
    pub fn device_id(&self) -> &str {
        match self {
            DriverEvent::Status { device_id, .. }
            | DriverEvent::Data { device_id, .. }
            | DriverEvent::Error { device_id, .. } => device_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Observer list with explicit unsubscribe
#[derive(Debug, Default)]
struct EventBus {
    next_id: AtomicU64,
    observers: Mutex<Vec<(SubscriptionId, Sender<DriverEvent>)>>,
}

impl EventBus {
    fn observers(&self) -> MutexGuard<'_, Vec<(SubscriptionId, Sender<DriverEvent>)>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribe(&self) -> (SubscriptionId, Receiver<DriverEvent>) {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = crossbeam_channel::unbounded();
        self.observers().push((id, tx));
        (id, rx)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    /// Deliver to every observer, dropping those whose receiver is gone
    fn emit(&self, event: &DriverEvent) {
        self.observers()
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Device {device_id} is not connected")]
    NotConnected { device_id: String },

    #[error("Device {device_id} is busy with another capture")]
    Busy { device_id: String },

    #[error("Capture timed out on {device_id}: {reason}")]
    CaptureTimeout { device_id: String, reason: String },

    #[error("Invalid capture configuration: {0}")]
    InvalidConfiguration(#[from] CaptureConfigError),

    #[error("Device {device_id} rejected the capture: '{response}'")]
    CaptureRejected { device_id: String, response: String },

    #[error("Device {device_id} announced {announced} samples, {expected} were requested")]
    SampleCountMismatch {
        device_id: String,
        expected: u64,
        announced: u64,
    },

    #[error("Communication error on {device_id}: {source}")]
    Terminal {
        device_id: String,
        #[source]
        source: TerminalError,
    },

    #[error("Capture failed on member device {device_id}: {source}")]
    MultiDevice {
        device_id: String,
        #[source]
        source: Box<DriverError>,
    },
}

/// Capability contract shared by single and multi-device drivers
pub trait AnalyzerDriver: Send + Sync {
    fn device_id(&self) -> &str;

    fn connect(&mut self, params: &ConnectionParams) -> Result<ConnectionResult, ConnectionError>;

    fn disconnect(&mut self);

    fn device_info(&self) -> Option<DeviceInfo>;

    fn capabilities(&self) -> Option<HardwareCapabilities>;

    /// Run one capture to completion, cancellation or failure
    fn start_capture(&self, session: CaptureSession) -> Result<CaptureResult, DriverError>;

    /// Request cancellation of the running capture. Returns false when idle.
    fn stop_capture(&self) -> bool;

    fn is_capturing(&self) -> bool;

    fn subscribe(&self) -> (SubscriptionId, Receiver<DriverEvent>);

    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

/// Busy flag and stop request of one device, changed under a single lock
#[derive(Debug, Default)]
struct CaptureGate {
    busy: Mutex<bool>,
    cancel: CancelToken,
}

impl CaptureGate {
    fn busy(&self) -> MutexGuard<'_, bool> {
        self.busy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the device and clear any stop left over from an earlier capture
    fn acquire(&self) -> Option<BusyGuard<'_>> {
        let mut busy = self.busy();
        if *busy {
            return None;
        }
        *busy = true;
        self.cancel.reset();
        Some(BusyGuard(self))
    }

    /// Flag the running capture for cancellation. Returns false when idle.
    fn request_stop(&self) -> bool {
        let busy = self.busy();
        if *busy {
            self.cancel.cancel();
        }
        *busy
    }

    fn is_busy(&self) -> bool {
        *self.busy()
    }
}

/// Marks a device busy for the lifetime of the guard
struct BusyGuard<'a>(&'a CaptureGate);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        *self.0.busy() = false;
    }
}

struct Connection {
    terminal: AnalyzerTerminal,
    params: ConnectionParams,
}

enum CaptureAbort {
    Cancelled,
    Failed(DriverError),
}

/// Driver for a single analyzer reached over serial or network
pub struct LogicAnalyzerDriver {
    device_id: String,
    /// Held for the whole of a capture
    connection: Mutex<Option<Connection>>,
    /// Identity and capabilities, readable while a capture runs
    negotiated: Mutex<Option<ConnectionResult>>,
    gate: CaptureGate,
    events: EventBus,
}

impl LogicAnalyzerDriver {
    pub fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            connection: Mutex::new(None),
            negotiated: Mutex::new(None),
            gate: CaptureGate::default(),
            events: EventBus::default(),
        }
    }

    fn connection(&self) -> MutexGuard<'_, Option<Connection>> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn negotiated(&self) -> MutexGuard<'_, Option<ConnectionResult>> {
        self.negotiated.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit_status(&self, status: DriverStatus) {
        self.events.emit(&DriverEvent::Status {
            device_id: self.device_id.clone(),
            status,
        });
    }

    /// Perform the identification handshake on an already open transport
    pub fn connect_with_transport(
        &mut self,
        transport: Box<dyn Transport>,
        params: &ConnectionParams,
        driver_type: DriverType,
    ) -> Result<ConnectionResult, ConnectionError> {
        let mut terminal = AnalyzerTerminal::new(transport);

        let mut attempt = 0;
        let (info, capabilities) = loop {
            match Self::handshake(&mut terminal, params, driver_type) {
                Ok(negotiated) => break negotiated,
                Err(ConnectionError::Timeout(e)) if attempt < params.retries => {
                    attempt += 1;
                    log::debug!("Timeout during handshake ({}), retrying", e);
                }
                Err(e) => return Err(e),
            }
        };

        log::debug!(
            "Connected to {} firmware {} at {} ({} channels, {} Hz max)",
            info.name,
            info.firmware_version,
            info.connection_path,
            capabilities.channels.digital,
            capabilities.sampling.max_rate
        );

        let result = ConnectionResult {
            device_info: info,
            capabilities,
        };
        *self.connection() = Some(Connection {
            terminal,
            params: params.clone(),
        });
        *self.negotiated() = Some(result.clone());
        self.emit_status(DriverStatus::Connected);

        Ok(result)
    }

    fn handshake(
        terminal: &mut AnalyzerTerminal,
        params: &ConnectionParams,
        driver_type: DriverType,
    ) -> Result<(DeviceInfo, HardwareCapabilities), ConnectionError> {
        terminal.flush()?;
        terminal.send(&OutputPacket::new(Command::Identify))?;

        let timeout = params.handshake_timeout;
        let version_line = terminal.read_line(timeout, None)?;
        let version = version_line
            .strip_prefix(IDENTIFY_PREFIX)
            .ok_or_else(|| ConnectionError::HandshakeMismatch {
                expected: format!("{}<version>", IDENTIFY_PREFIX),
                actual: version_line.clone(),
            })?
            .to_string();

        let max_rate = Self::read_key(terminal, "FREQ", timeout)?;
        let blast_rate = Self::read_key(terminal, "BLASTFREQ", timeout)?;
        let buffer_size = Self::read_key(terminal, "BUFFER", timeout)?;
        let channels = Self::read_key(terminal, "CHANNELS", timeout)?;
        let channels = u8::try_from(channels).map_err(|_| ConnectionError::HandshakeMismatch {
            expected: "CHANNELS:<0-255>".to_string(),
            actual: format!("CHANNELS:{}", channels),
        })?;

        let is_network = driver_type == DriverType::Network;
        let info = DeviceInfo {
            name: "LogicAnalyzer".to_string(),
            firmware_version: version,
            driver_type,
            connection_path: terminal.describe(),
            is_network,
        };
        let capabilities =
            HardwareCapabilities::from_limits(max_rate, blast_rate, buffer_size, channels, is_network);

        Ok((info, capabilities))
    }

    fn read_key(
        terminal: &mut AnalyzerTerminal,
        key: &str,
        timeout: Duration,
    ) -> Result<u32, ConnectionError> {
        let line = terminal.read_line(timeout, None)?;
        line.strip_prefix(key)
            .and_then(|rest| rest.strip_prefix(':'))
            .and_then(|value| value.trim().parse().ok())
            .ok_or_else(|| ConnectionError::HandshakeMismatch {
                expected: format!("{}:<number>", key),
                actual: line.clone(),
            })
    }

    fn terminal_error(&self, source: TerminalError) -> CaptureAbort {
        match source {
            TerminalError::Cancelled => CaptureAbort::Cancelled,
            source => CaptureAbort::Failed(DriverError::Terminal {
                device_id: self.device_id.clone(),
                source,
            }),
        }
    }

    /// Map a read failure, turning timeouts into `CaptureTimeout`
    fn read_step<T>(
        &self,
        result: Result<T, TerminalError>,
        timeout_reason: impl FnOnce() -> String,
    ) -> Result<T, CaptureAbort> {
        result.map_err(|e| match e {
            TerminalError::Timeout { .. } => CaptureAbort::Failed(DriverError::CaptureTimeout {
                device_id: self.device_id.clone(),
                reason: timeout_reason(),
            }),
            e => self.terminal_error(e),
        })
    }

    fn run_capture(
        &self,
        conn: &mut Connection,
        session: &mut CaptureSession,
    ) -> Result<Vec<u32>, CaptureAbort> {
        let cancel = Some(&self.gate.cancel);
        let params = conn.params.clone();
        let terminal = &mut conn.terminal;

        self.emit_status(DriverStatus::Configuring);
        let request = session.to_request();
        log::debug!("Sending capture request {:?}", request);
        terminal
            .flush()
            .and_then(|()| terminal.send(&OutputPacket::capture(&request)))
            .map_err(|e| self.terminal_error(e))?;

        let ack = self.read_step(terminal.read_line(params.command_timeout, cancel), || {
            "device did not acknowledge the capture request".to_string()
        })?;
        if ack != CAPTURE_STARTED {
            return Err(CaptureAbort::Failed(DriverError::CaptureRejected {
                device_id: self.device_id.clone(),
                response: ack,
            }));
        }

        self.emit_status(DriverStatus::WaitingForTrigger);
        let count = self.read_step(terminal.read_u32(params.trigger_timeout, cancel), || {
            format!("no trigger within {:?}", params.trigger_timeout)
        })?;
        let count = u64::from(count);
        if count != session.total_samples() {
            return Err(CaptureAbort::Failed(DriverError::SampleCountMismatch {
                device_id: self.device_id.clone(),
                expected: session.total_samples(),
                announced: count,
            }));
        }

        self.emit_status(DriverStatus::Capturing);
        #[cfg(feature = "cpu-profiling")]
        let _span = tracy_client::span!("LogicAnalyzerDriver::read_samples");

        let width = session.bytes_per_sample() as usize;
        let expected = session.total_samples() as usize;
        for channel in &mut session.channels {
            channel.samples.reserve(expected);
        }

        let mut received: u64 = 0;
        while received < count {
            let n = (count - received).min(CHUNK_SAMPLES as u64) as usize;
            let bytes = self.read_step(
                terminal.read_exact(n * width, params.read_timeout, cancel),
                || format!("received {} of {} samples", received, count),
            )?;

            let words: Vec<u32> = bytes
                .chunks_exact(width)
                .map(|raw| {
                    let mut le = [0u8; 4];
                    le[..width].copy_from_slice(raw);
                    u32::from_le_bytes(le)
                })
                .collect();

            for channel in &mut session.channels {
                let bit = channel.index;
                channel
                    .samples
                    .extend(words.iter().map(|w| ((w >> bit) & 1) as u8));
            }

            self.events.emit(&DriverEvent::Data {
                device_id: self.device_id.clone(),
                chunk: DataChunk {
                    first_sample: received,
                    total_samples: count,
                    words,
                },
            });
            received += n as u64;
        }

        self.emit_status(DriverStatus::ProcessingData);
        let flag = self.read_step(terminal.read_exact(1, params.read_timeout, cancel), || {
            "missing burst timestamp flag".to_string()
        })?;

        let mut timestamps = Vec::new();
        if flag[0] == 1 {
            for _ in 0..u32::from(session.loop_count) + 2 {
                timestamps.push(self.read_step(
                    terminal.read_u32(params.read_timeout, cancel),
                    || "incomplete burst timestamps".to_string(),
                )?);
            }
        }

        Ok(timestamps)
    }

    /// Abort the device side of a capture and discard whatever it still sends
    fn abort_device(&self, conn: &mut Connection) {
        let result = conn
            .terminal
            .send_raw(&[STOP_CAPTURE_BYTE])
            .and_then(|()| conn.terminal.drain(DRAIN_QUIET));
        match result {
            Ok(discarded) => log::debug!("Stopped capture, discarded {} bytes", discarded),
            Err(e) => log::warn!("Failed to stop capture on {}: {}", self.device_id, e),
        }
    }
}

impl AnalyzerDriver for LogicAnalyzerDriver {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn connect(&mut self, params: &ConnectionParams) -> Result<ConnectionResult, ConnectionError> {
        let transport = Connector::open(&params.target, params.handshake_timeout)?;
        let driver_type = match params.target {
            ConnectionTarget::Serial { .. } => DriverType::Serial,
            ConnectionTarget::Network { .. } => DriverType::Network,
        };
        self.connect_with_transport(transport, params, driver_type)
    }

    fn disconnect(&mut self) {
        self.negotiated().take();
        if self.connection().take().is_some() {
            log::debug!("Disconnected {}", self.device_id);
            self.emit_status(DriverStatus::Disconnected);
        }
    }

    fn device_info(&self) -> Option<DeviceInfo> {
        self.negotiated().as_ref().map(|n| n.device_info.clone())
    }

    fn capabilities(&self) -> Option<HardwareCapabilities> {
        self.negotiated().as_ref().map(|n| n.capabilities.clone())
    }

    fn start_capture(&self, mut session: CaptureSession) -> Result<CaptureResult, DriverError> {
        let _busy = self.gate.acquire().ok_or_else(|| DriverError::Busy {
            device_id: self.device_id.clone(),
        })?;

        let not_connected = || DriverError::NotConnected {
            device_id: self.device_id.clone(),
        };
        let capabilities = self.capabilities().ok_or_else(not_connected)?;
        session.validate(&capabilities)?;
        session.clear_samples();

        let mut guard = self.connection();
        let conn = guard.as_mut().ok_or_else(not_connected)?;

        let started = Instant::now();
        match self.run_capture(conn, &mut session) {
            Ok(burst_timestamps) => {
                self.emit_status(DriverStatus::CaptureCompleted);
                Ok(CaptureResult {
                    status: CaptureStatus::Completed,
                    session,
                    burst_timestamps,
                    failed_devices: Vec::new(),
                    duration: started.elapsed(),
                })
            }
            Err(CaptureAbort::Cancelled) => {
                log::debug!("Capture on {} cancelled", self.device_id);
                self.abort_device(conn);
                self.emit_status(DriverStatus::CaptureCancelled);
                Ok(CaptureResult {
                    status: CaptureStatus::Cancelled,
                    session,
                    burst_timestamps: Vec::new(),
                    failed_devices: Vec::new(),
                    duration: started.elapsed(),
                })
            }
            Err(CaptureAbort::Failed(error)) => {
                if matches!(
                    error,
                    DriverError::CaptureTimeout { .. } | DriverError::SampleCountMismatch { .. }
                ) {
                    self.abort_device(conn);
                }
                self.events.emit(&DriverEvent::Error {
                    device_id: self.device_id.clone(),
                    message: error.to_string(),
                });
                Err(error)
            }
        }
    }

    fn stop_capture(&self) -> bool {
        self.gate.request_stop()
    }

    fn is_capturing(&self) -> bool {
        self.gate.is_busy()
    }

    fn subscribe(&self) -> (SubscriptionId, Receiver<DriverEvent>) {
        self.events.subscribe()
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }
}

struct Member {
    driver: Box<dyn AnalyzerDriver>,
    params: ConnectionParams,
}

/// Several analyzers driven as one logical device.
///
/// Global channel `offset_k + i` maps to channel `i` of member `k`, where
/// `offset_k` is the sum of channel counts of the members before it.
pub struct MultiAnalyzerDriver {
    device_id: String,
    members: Vec<Member>,
    best_effort: bool,
    negotiated: Option<ConnectionResult>,
    gate: CaptureGate,
    events: EventBus,
}

impl MultiAnalyzerDriver {
    /// With `best_effort` a failing member yields a partial result instead of
    /// aborting the whole capture.
    pub fn new(device_id: &str, best_effort: bool) -> Self {
        Self {
            device_id: device_id.to_string(),
            members: Vec::new(),
            best_effort,
            negotiated: None,
            gate: CaptureGate::default(),
            events: EventBus::default(),
        }
    }

    /// `params` is used when the member is not connected yet
    pub fn with_member(mut self, driver: Box<dyn AnalyzerDriver>, params: ConnectionParams) -> Self {
        self.members.push(Member { driver, params });
        self
    }

    fn emit_status(&self, status: DriverStatus) {
        self.events.emit(&DriverEvent::Status {
            device_id: self.device_id.clone(),
            status,
        });
    }

    fn combine(&self, results: Vec<ConnectionResult>) -> ConnectionResult {
        let info = DeviceInfo {
            name: format!("Multi analyzer ({} devices)", results.len()),
            firmware_version: results
                .iter()
                .map(|r| r.device_info.firmware_version.as_str())
                .collect::<Vec<_>>()
                .join(","),
            driver_type: DriverType::Multi,
            connection_path: results
                .iter()
                .map(|r| r.device_info.connection_path.as_str())
                .collect::<Vec<_>>()
                .join(";"),
            is_network: results.iter().any(|r| r.device_info.is_network),
        };

        let caps: Vec<&HardwareCapabilities> = results.iter().map(|r| &r.capabilities).collect();
        let min_of = |f: fn(&HardwareCapabilities) -> u32| caps.iter().map(|c| f(c)).min().unwrap_or(0);

        let max_rate = min_of(|c| c.sampling.max_rate);
        let min_rate = caps.iter().map(|c| c.sampling.min_rate).max().unwrap_or(0);
        let supported_rates = caps.first().map_or_else(Vec::new, |first| {
            first
                .sampling
                .supported_rates
                .iter()
                .copied()
                .filter(|rate| caps.iter().all(|c| c.sampling.supported_rates.contains(rate)))
                .collect()
        });
        let trigger_types = caps.first().map_or_else(Vec::new, |first| {
            first
                .triggers
                .types
                .iter()
                .copied()
                .filter(|t| caps.iter().all(|c| c.triggers.types.contains(t)))
                .collect()
        });

        let capabilities = HardwareCapabilities {
            channels: ChannelCapabilities {
                digital: caps
                    .iter()
                    .map(|c| u32::from(c.channels.digital))
                    .sum::<u32>()
                    .min(u32::from(u8::MAX)) as u8,
                max_voltage: caps
                    .iter()
                    .map(|c| c.channels.max_voltage)
                    .fold(f32::INFINITY, f32::min),
            },
            sampling: SamplingCapabilities {
                max_rate,
                min_rate,
                blast_rate: min_of(|c| c.sampling.blast_rate),
                supported_rates,
                buffer_size: min_of(|c| c.sampling.buffer_size),
                streaming: caps.iter().all(|c| c.sampling.streaming),
            },
            triggers: TriggerCapabilities {
                types: trigger_types,
                max_pattern_width: caps
                    .iter()
                    .map(|c| c.triggers.max_pattern_width)
                    .min()
                    .unwrap_or(0),
                max_fast_pattern_width: caps
                    .iter()
                    .map(|c| c.triggers.max_fast_pattern_width)
                    .min()
                    .unwrap_or(0),
            },
            connectivity: caps
                .first()
                .map(|c| c.connectivity.clone())
                .unwrap_or_default(),
            features: FeatureFlags {
                burst_measurement: caps.iter().all(|c| c.features.burst_measurement),
                blast_mode: caps.iter().all(|c| c.features.blast_mode),
                voltage_monitoring: caps.iter().all(|c| c.features.voltage_monitoring),
            },
        };

        ConnectionResult {
            device_info: info,
            capabilities,
        }
    }

    /// Split the session into one session per member, keyed by member position.
    ///
    /// The member owning the trigger channels arms on their local indices and
    /// captures them even when none were requested from it. Every other member
    /// arms on its external trigger input.
    fn split_session(
        &self,
        session: &CaptureSession,
    ) -> Result<Vec<(usize, u8, CaptureSession)>, CaptureConfigError> {
        let trigger = session.trigger;
        let (first, last) = (u16::from(trigger.channel), u16::from(trigger.highest_channel()));
        let mut external = EdgeTrigger::on_channel(EXTERNAL_TRIGGER_CHANNEL);
        if trigger.trigger_type == TriggerType::Blast {
            external = external.blast();
        }
        let external = external.rising_edge();

        let mut parts = Vec::new();
        let mut trigger_owned = false;
        let mut offset: u16 = 0;
        for (position, member) in self.members.iter().enumerate() {
            let count = member
                .driver
                .capabilities()
                .map_or(0, |c| u16::from(c.channels.digital));
            let range = offset..offset + count;
            let mut channels: Vec<_> = session
                .channels
                .iter()
                .filter(|c| range.contains(&u16::from(c.index)))
                .map(|c| {
                    let mut local = c.clone();
                    local.index = (u16::from(c.index) - offset) as u8;
                    local
                })
                .collect();

            let local_trigger = match (range.contains(&first), range.contains(&last)) {
                (true, true) => {
                    trigger_owned = true;
                    let local_first = (first - offset) as u8;
                    if !channels.iter().any(|c| c.index == local_first) {
                        channels.push(AnalyzerChannel::new(local_first));
                    }
                    TriggerConfig {
                        channel: local_first,
                        ..trigger
                    }
                }
                (false, false) => external,
                _ => {
                    return Err(CaptureConfigError::TriggerSpansDevices {
                        first: trigger.channel,
                        last: trigger.highest_channel(),
                    })
                }
            };

            if !channels.is_empty() {
                let mut part = session.clone();
                part.channels = channels;
                part.trigger = local_trigger;
                parts.push((position, offset as u8, part));
            }
            offset += count;
        }

        if !trigger_owned {
            return Err(CaptureConfigError::TriggerChannelOutOfRange {
                channel: trigger.highest_channel(),
                available: offset.min(u16::from(u8::MAX)) as u8,
            });
        }
        Ok(parts)
    }

    fn stop_members(&self) {
        for member in &self.members {
            member.driver.stop_capture();
        }
    }
}

impl AnalyzerDriver for MultiAnalyzerDriver {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn connect(&mut self, _params: &ConnectionParams) -> Result<ConnectionResult, ConnectionError> {
        let mut results = Vec::with_capacity(self.members.len());
        for member in &mut self.members {
            let result = match (member.driver.device_info(), member.driver.capabilities()) {
                (Some(device_info), Some(capabilities)) => ConnectionResult {
                    device_info,
                    capabilities,
                },
                _ => member.driver.connect(&member.params).map_err(|e| {
                    ConnectionError::Member {
                        device_id: member.driver.device_id().to_string(),
                        source: Box::new(e),
                    }
                })?,
            };
            results.push(result);
        }

        let combined = self.combine(results);
        self.negotiated = Some(combined.clone());
        self.emit_status(DriverStatus::Connected);
        Ok(combined)
    }

    fn disconnect(&mut self) {
        for member in &mut self.members {
            member.driver.disconnect();
        }
        if self.negotiated.take().is_some() {
            self.emit_status(DriverStatus::Disconnected);
        }
    }

    fn device_info(&self) -> Option<DeviceInfo> {
        self.negotiated.as_ref().map(|n| n.device_info.clone())
    }

    fn capabilities(&self) -> Option<HardwareCapabilities> {
        self.negotiated.as_ref().map(|n| n.capabilities.clone())
    }

    fn start_capture(&self, mut session: CaptureSession) -> Result<CaptureResult, DriverError> {
        let _busy = self.gate.acquire().ok_or_else(|| DriverError::Busy {
            device_id: self.device_id.clone(),
        })?;
        let capabilities = self.capabilities().ok_or_else(|| DriverError::NotConnected {
            device_id: self.device_id.clone(),
        })?;
        session.validate(&capabilities)?;
        session.clear_samples();

        let started = Instant::now();
        let parts = self.split_session(&session)?;
        self.emit_status(DriverStatus::Capturing);

        let outcomes: Vec<(usize, u8, Result<CaptureResult, DriverError>)> =
            std::thread::scope(|scope| {
                let handles: Vec<_> = parts
                    .into_iter()
                    .map(|(position, offset, part)| {
                        let driver = &self.members[position].driver;
                        let (subscription, events) = driver.subscribe();
                        scope.spawn(move || {
                            for event in events.iter() {
                                self.events.emit(&event);
                            }
                        });
                        scope.spawn(move || {
                            let result = driver.start_capture(part);
                            driver.unsubscribe(subscription);
                            if result.is_err() && !self.best_effort {
                                self.stop_members();
                            }
                            (position, offset, result)
                        })
                    })
                    .collect();

                handles
                    .into_iter()
                    .filter_map(|handle| handle.join().ok())
                    .collect()
            });

        let mut failures = Vec::new();
        let mut first_error = None;
        let mut cancelled = false;
        let mut burst_timestamps = Vec::new();
        let mut completed = 0;

        for (position, offset, outcome) in outcomes {
            let member_id = self.members[position].driver.device_id().to_string();
            match outcome {
                Ok(result) => {
                    completed += 1;
                    cancelled |= result.status == CaptureStatus::Cancelled;
                    if burst_timestamps.is_empty() {
                        burst_timestamps = result.burst_timestamps;
                    }
                    for local in result.session.channels {
                        let global = local.index.saturating_add(offset);
                        if let Some(channel) =
                            session.channels.iter_mut().find(|c| c.index == global)
                        {
                            channel.samples = local.samples;
                        }
                    }
                }
                Err(error) => {
                    log::warn!("Member {} failed: {}", member_id, error);
                    failures.push(DeviceFailure {
                        device_id: member_id.clone(),
                        message: error.to_string(),
                    });
                    if first_error.is_none() {
                        first_error = Some((member_id, error));
                    }
                }
            }
        }

        if let Some((device_id, source)) = first_error {
            if !self.best_effort || completed == 0 {
                self.events.emit(&DriverEvent::Error {
                    device_id: self.device_id.clone(),
                    message: source.to_string(),
                });
                return Err(DriverError::MultiDevice {
                    device_id,
                    source: Box::new(source),
                });
            }
        }

        let status = if cancelled {
            CaptureStatus::Cancelled
        } else if !failures.is_empty() {
            CaptureStatus::PartialSuccess
        } else {
            CaptureStatus::Completed
        };
        self.emit_status(if cancelled {
            DriverStatus::CaptureCancelled
        } else {
            DriverStatus::CaptureCompleted
        });

        Ok(CaptureResult {
            status,
            session,
            burst_timestamps,
            failed_devices: failures,
            duration: started.elapsed(),
        })
    }

    fn stop_capture(&self) -> bool {
        if !self.gate.request_stop() {
            return false;
        }
        self.stop_members();
        true
    }

    fn is_capturing(&self) -> bool {
        self.gate.is_busy()
    }

    fn subscribe(&self) -> (SubscriptionId, Receiver<DriverEvent>) {
        self.events.subscribe()
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{SimulatedAnalyzer, SimulatorConfig};
    use crate::trigger_config::{BitState, EdgeTrigger, PatternTrigger};
    use crate::wire_protocol::CaptureRequest;
    use std::sync::Arc;

    fn params() -> ConnectionParams {
        ConnectionParams::serial("sim")
            .handshake_timeout(Duration::from_millis(200))
            .trigger_timeout(Duration::from_millis(200))
            .read_timeout(Duration::from_millis(200))
    }

    fn connected(id: &str, sim: SimulatedAnalyzer) -> LogicAnalyzerDriver {
        let mut driver = LogicAnalyzerDriver::new(id);
        driver
            .connect_with_transport(Box::new(sim), &params(), DriverType::Simulated)
            .unwrap();
        driver
    }

    #[test]
    fn test_handshake_negotiates_capabilities() {
        let mut driver = LogicAnalyzerDriver::new("la0");
        let result = driver
            .connect_with_transport(
                Box::new(SimulatedAnalyzer::new(SimulatorConfig::default())),
                &params(),
                DriverType::Simulated,
            )
            .unwrap();

        assert_eq!(result.device_info.firmware_version, "V6_5");
        assert_eq!(result.capabilities.channels.digital, 24);
        assert_eq!(result.capabilities.sampling.max_rate, 100_000_000);
        assert_eq!(result.capabilities.sampling.blast_rate, 200_000_000);
        assert_eq!(driver.device_info().unwrap().connection_path, "sim://analyzer");
    }

    #[test]
    fn test_handshake_mismatch() {
        let config = SimulatorConfig {
            version: "SOMETHING_ELSE".to_string(),
            ..Default::default()
        };
        let mut driver = LogicAnalyzerDriver::new("la0");
        let result = driver.connect_with_transport(
            Box::new(SimulatedAnalyzer::new(config)),
            &params(),
            DriverType::Simulated,
        );
        assert!(matches!(result, Err(ConnectionError::HandshakeMismatch { .. })));
        assert!(driver.capabilities().is_none());
    }

    #[test]
    fn test_capture_populates_channels() {
        let sim = SimulatedAnalyzer::new(SimulatorConfig::default())
            .with_waveforms(vec![(0, vec![0, 1, 0, 1, 0, 1]), (9, vec![1, 1, 1, 0, 0, 0])]);
        let requests = sim.requests();
        let driver = connected("la0", sim);

        let session = CaptureSession::new(1_000_000, 2, 4)
            .with_channels(&[0, 9])
            .with_trigger(EdgeTrigger::on_channel(0).rising_edge());
        let result = driver.start_capture(session).unwrap();

        assert_eq!(result.status, CaptureStatus::Completed);
        assert_eq!(result.session.channels[0].samples, vec![0, 1, 0, 1, 0, 1]);
        assert_eq!(result.session.channels[1].samples, vec![1, 1, 1, 0, 0, 0]);
        assert_eq!(requests.lock().unwrap()[0].channels, (1 << 0) | (1 << 9));
        assert!(!driver.is_capturing());
    }

    #[test]
    fn test_capture_emits_ordered_data_events() {
        let driver = connected("la0", SimulatedAnalyzer::new(SimulatorConfig::default()));
        let (_, events) = driver.subscribe();

        let session = CaptureSession::new(1_000_000, 100, 9_900).with_channels(&[0]);
        driver.start_capture(session).unwrap();

        let events: Vec<DriverEvent> = events.try_iter().collect();
        let firsts: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                DriverEvent::Data { chunk, .. } => Some(chunk.first_sample),
                _ => None,
            })
            .collect();
        assert_eq!(firsts, vec![0, 4096, 8192]);
        assert!(events.contains(&DriverEvent::Status {
            device_id: "la0".to_string(),
            status: DriverStatus::CaptureCompleted,
        }));
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let driver = connected("la0", SimulatedAnalyzer::new(SimulatorConfig::default()));
        let (id, events) = driver.subscribe();
        assert!(driver.unsubscribe(id));
        assert!(!driver.unsubscribe(id));

        driver
            .start_capture(CaptureSession::new(1_000_000, 2, 2).with_channels(&[0]))
            .unwrap();
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_capture_burst_timestamps() {
        let driver = connected("la0", SimulatedAnalyzer::new(SimulatorConfig::default()));
        let mut session = CaptureSession::new(1_000_000, 2, 2).with_channels(&[0]);
        session.measure_bursts = true;
        session.loop_count = 1;

        let result = driver.start_capture(session).unwrap();
        assert_eq!(result.burst_timestamps, vec![0, 1000, 2000]);
    }

    #[test]
    fn test_capture_requires_connection() {
        let driver = LogicAnalyzerDriver::new("la0");
        let result = driver.start_capture(CaptureSession::new(1_000_000, 2, 2).with_channels(&[0]));
        assert!(matches!(result, Err(DriverError::NotConnected { .. })));
    }

    #[test]
    fn test_invalid_session_rejected_before_sending() {
        let sim = SimulatedAnalyzer::new(SimulatorConfig::default());
        let requests = sim.requests();
        let driver = connected("la0", sim);

        let result = driver.start_capture(CaptureSession::new(1_000_000, 2, 2));
        assert!(matches!(
            result,
            Err(DriverError::InvalidConfiguration(CaptureConfigError::NoChannels))
        ));
        assert!(requests.lock().unwrap().is_empty());
    }

    #[test]
    fn test_trigger_timeout() {
        let config = SimulatorConfig {
            trigger_fires: false,
            ..Default::default()
        };
        let driver = connected("la0", SimulatedAnalyzer::new(config));
        let (_, events) = driver.subscribe();

        let result = driver.start_capture(CaptureSession::new(1_000_000, 2, 2).with_channels(&[0]));
        assert!(matches!(result, Err(DriverError::CaptureTimeout { .. })));
        assert!(events
            .try_iter()
            .any(|e| matches!(e, DriverEvent::Error { .. })));
        assert!(!driver.is_capturing());
    }

    #[test]
    fn test_sample_count_mismatch_fails_capture() {
        let config = SimulatorConfig {
            announced_samples: Some(2),
            ..Default::default()
        };
        let driver = connected("la0", SimulatedAnalyzer::new(config));
        let (_, events) = driver.subscribe();

        let result = driver.start_capture(CaptureSession::new(1_000_000, 2, 2).with_channels(&[0]));
        match result {
            Err(DriverError::SampleCountMismatch {
                expected,
                announced,
                ..
            }) => assert_eq!((expected, announced), (4, 2)),
            other => panic!("Unexpected result: {:?}", other),
        }
        assert!(events
            .try_iter()
            .any(|e| matches!(e, DriverEvent::Error { .. })));
        assert!(!driver.is_capturing());
    }

    #[test]
    fn test_busy_and_cancel() {
        let config = SimulatorConfig {
            stall_after_samples: Some(10),
            ..Default::default()
        };
        let driver = Arc::new(connected("la0", SimulatedAnalyzer::new(config)));
        let (_, events) = driver.subscribe();
        let long_params = CaptureSession::new(1_000_000, 100, 1_000).with_channels(&[0]);

        let worker = {
            let driver = Arc::clone(&driver);
            let session = long_params.clone();
            std::thread::spawn(move || driver.start_capture(session))
        };

        loop {
            match events.recv_timeout(Duration::from_secs(2)) {
                Ok(DriverEvent::Status {
                    status: DriverStatus::Capturing,
                    ..
                }) => break,
                Ok(_) => {}
                Err(e) => panic!("Unexpected error: {:?}", e),
            }
        }
        assert!(matches!(
            driver.start_capture(long_params),
            Err(DriverError::Busy { .. })
        ));

        // Readable while the capture holds the connection
        let started = Instant::now();
        assert_eq!(driver.capabilities().unwrap().channels.digital, 24);
        assert!(driver.device_info().is_some());
        assert!(started.elapsed() < Duration::from_millis(100));

        assert!(driver.stop_capture());

        let result = worker.join().unwrap().unwrap();
        assert_eq!(result.status, CaptureStatus::Cancelled);
        assert!(!driver.stop_capture());

        // A stop must not leak into the next capture
        let result = driver
            .start_capture(CaptureSession::new(1_000_000, 2, 8).with_channels(&[0]))
            .unwrap();
        assert_eq!(result.status, CaptureStatus::Completed);
    }

    #[test]
    fn test_stale_stop_cleared_on_start() {
        let driver = connected("la0", SimulatedAnalyzer::new(SimulatorConfig::default()));
        driver.gate.cancel.cancel();

        let result = driver
            .start_capture(CaptureSession::new(1_000_000, 2, 2).with_channels(&[0]))
            .unwrap();
        assert_eq!(result.status, CaptureStatus::Completed);
    }

    #[test]
    fn test_stop_while_idle_is_ignored() {
        let driver = connected("la0", SimulatedAnalyzer::new(SimulatorConfig::default()));
        assert!(!driver.stop_capture());
        assert!(!driver.gate.cancel.is_cancelled());
    }

    #[test]
    fn test_disconnect() {
        let mut driver = connected("la0", SimulatedAnalyzer::new(SimulatorConfig::default()));
        driver.disconnect();
        assert!(driver.device_info().is_none());
        assert!(matches!(
            driver.start_capture(CaptureSession::new(1_000_000, 2, 2).with_channels(&[0])),
            Err(DriverError::NotConnected { .. })
        ));
    }

    type Requests = Arc<Mutex<Vec<CaptureRequest>>>;

    fn multi_with_requests(
        best_effort: bool,
        second: SimulatorConfig,
    ) -> (MultiAnalyzerDriver, [Requests; 2]) {
        let first = SimulatedAnalyzer::new(SimulatorConfig {
            channel_count: 8,
            ..Default::default()
        })
        .with_waveforms(vec![(1, vec![1, 0, 1, 0])]);
        let second = SimulatedAnalyzer::new(SimulatorConfig {
            channel_count: 8,
            ..second
        })
        .with_waveforms(vec![(2, vec![0, 0, 1, 1])]);
        let requests = [first.requests(), second.requests()];

        let mut driver = MultiAnalyzerDriver::new("multi", best_effort)
            .with_member(Box::new(connected("la0", first)), params())
            .with_member(Box::new(connected("la1", second)), params());
        driver.connect(&params()).unwrap();
        (driver, requests)
    }

    fn multi(best_effort: bool, second: SimulatorConfig) -> MultiAnalyzerDriver {
        multi_with_requests(best_effort, second).0
    }

    #[test]
    fn test_multi_combines_capabilities_and_samples() {
        let driver = multi(false, SimulatorConfig::default());
        let caps = driver.capabilities().unwrap();
        assert_eq!(caps.channels.digital, 16);
        assert_eq!(driver.device_info().unwrap().driver_type, DriverType::Multi);

        let session = CaptureSession::new(1_000_000, 2, 2).with_channels(&[1, 10]);
        let result = driver.start_capture(session).unwrap();

        assert_eq!(result.status, CaptureStatus::Completed);
        assert_eq!(result.session.channel(1).unwrap().samples, vec![1, 0, 1, 0]);
        assert_eq!(result.session.channel(10).unwrap().samples, vec![0, 0, 1, 1]);
    }

    #[test]
    fn test_multi_best_effort_reports_partial_success() {
        let driver = multi(
            true,
            SimulatorConfig {
                trigger_fires: false,
                ..Default::default()
            },
        );
        let session = CaptureSession::new(1_000_000, 2, 2).with_channels(&[1, 10]);
        let result = driver.start_capture(session).unwrap();

        assert_eq!(result.status, CaptureStatus::PartialSuccess);
        assert_eq!(result.failed_devices.len(), 1);
        assert_eq!(result.failed_devices[0].device_id, "la1");
        assert_eq!(result.session.channel(1).unwrap().samples, vec![1, 0, 1, 0]);
    }

    #[test]
    fn test_multi_strict_mode_aborts() {
        let driver = multi(
            false,
            SimulatorConfig {
                trigger_fires: false,
                ..Default::default()
            },
        );
        let session = CaptureSession::new(1_000_000, 2, 2).with_channels(&[1, 10]);
        let result = driver.start_capture(session);
        assert!(matches!(
            result,
            Err(DriverError::MultiDevice { ref device_id, .. }) if device_id == "la1"
        ));
    }

    #[test]
    fn test_multi_trigger_maps_to_owning_member() {
        let (driver, [la0, la1]) = multi_with_requests(false, SimulatorConfig::default());
        let session = CaptureSession::new(1_000_000, 2, 2)
            .with_channels(&[1, 10])
            .with_trigger(EdgeTrigger::on_channel(10).falling_edge());
        let result = driver.start_capture(session).unwrap();

        assert_eq!(result.status, CaptureStatus::Completed);
        let owner = la1.lock().unwrap()[0];
        assert_eq!((owner.trigger, owner.trigger_value), (2, 1));
        let follower = la0.lock().unwrap()[0];
        assert_eq!(follower.trigger, EXTERNAL_TRIGGER_CHANNEL);
        assert_eq!(follower.trigger_type, TriggerType::Edge.as_byte());
    }

    #[test]
    fn test_multi_trigger_member_without_captured_channels() {
        let (driver, [la0, la1]) = multi_with_requests(false, SimulatorConfig::default());
        let session = CaptureSession::new(1_000_000, 2, 2)
            .with_channels(&[10])
            .with_trigger(EdgeTrigger::on_channel(3).rising_edge());
        let result = driver.start_capture(session).unwrap();

        assert_eq!(result.status, CaptureStatus::Completed);
        assert_eq!(la0.lock().unwrap()[0].trigger, 3);
        assert_eq!(la0.lock().unwrap()[0].channels, 1 << 3);
        assert_eq!(la1.lock().unwrap()[0].trigger, EXTERNAL_TRIGGER_CHANNEL);
        assert_eq!(result.session.channels.len(), 1);
        assert_eq!(result.session.channel(10).unwrap().samples, vec![0, 0, 1, 1]);
    }

    #[test]
    fn test_multi_pattern_spanning_devices_rejected() {
        let (driver, [la0, la1]) = multi_with_requests(false, SimulatorConfig::default());
        let trigger = PatternTrigger::start_capturing_when()
            .set_bit(7, BitState::High)
            .set_bit(8, BitState::Low)
            .matches()
            .unwrap();
        let session = CaptureSession::new(1_000_000, 2, 2)
            .with_channels(&[1, 10])
            .with_trigger(trigger);

        assert!(matches!(
            driver.start_capture(session),
            Err(DriverError::InvalidConfiguration(
                CaptureConfigError::TriggerSpansDevices { first: 7, last: 8 }
            ))
        ));
        assert!(la0.lock().unwrap().is_empty());
        assert!(la1.lock().unwrap().is_empty());
    }
}
