use crate::trigger_config::{TriggerConfig, TriggerType, MAX_FAST_PATTERN_WIDTH, MAX_PATTERN_WIDTH};
use crate::wire_protocol::CaptureRequest;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const SAMPLE_COLUMN_NAME: &str = "sample";
const TIME_COLUMN_NAME: &str = "time";

/// Lowest sample rate the capture engine can be clocked at
pub const MIN_SAMPLE_RATE: u32 = 3_100;

/// Minimum number of samples on either side of the trigger
pub const MIN_TRIGGER_SAMPLES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverType {
    Serial,
    Network,
    Multi,
    Simulated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub firmware_version: String,
    pub driver_type: DriverType,
    pub connection_path: String,
    pub is_network: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionKind {
    Usb,
    Serial,
    Ethernet,
    Wifi,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelCapabilities {
    pub digital: u8,
    pub max_voltage: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingCapabilities {
    pub max_rate: u32,
    pub min_rate: u32,
    pub blast_rate: u32,
    pub supported_rates: Vec<u32>,
    /// Sample memory in bytes
    pub buffer_size: u32,
    pub streaming: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerCapabilities {
    pub types: Vec<TriggerType>,
    pub max_pattern_width: u8,
    pub max_fast_pattern_width: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub burst_measurement: bool,
    pub blast_mode: bool,
    pub voltage_monitoring: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareCapabilities {
    pub channels: ChannelCapabilities,
    pub sampling: SamplingCapabilities,
    pub triggers: TriggerCapabilities,
    pub connectivity: Vec<ConnectionKind>,
    pub features: FeatureFlags,
}

impl HardwareCapabilities {
    /// Capabilities of a device reporting the given identification limits
    pub fn from_limits(
        max_rate: u32,
        blast_rate: u32,
        buffer_size: u32,
        channel_count: u8,
        network: bool,
    ) -> Self {
        let connectivity = if network {
            vec![ConnectionKind::Usb, ConnectionKind::Wifi]
        } else {
            vec![ConnectionKind::Usb]
        };

        Self {
            channels: ChannelCapabilities {
                digital: channel_count,
                max_voltage: 5.0,
            },
            sampling: SamplingCapabilities {
                max_rate,
                min_rate: MIN_SAMPLE_RATE,
                blast_rate,
                supported_rates: Self::standard_rates(MIN_SAMPLE_RATE, max_rate),
                buffer_size,
                streaming: false,
            },
            triggers: TriggerCapabilities {
                types: vec![
                    TriggerType::Edge,
                    TriggerType::Complex,
                    TriggerType::Fast,
                    TriggerType::Blast,
                ],
                max_pattern_width: MAX_PATTERN_WIDTH as u8,
                max_fast_pattern_width: MAX_FAST_PATTERN_WIDTH as u8,
            },
            connectivity,
            features: FeatureFlags {
                burst_measurement: true,
                blast_mode: blast_rate > 0,
                voltage_monitoring: network,
            },
        }
    }

    /// 1-2-5 decade steps between `min` and `max`, plus `max` itself
    pub fn standard_rates(min: u32, max: u32) -> Vec<u32> {
        let mut rates = Vec::new();
        let mut decade: u64 = 1_000;
        while decade <= u64::from(max) {
            for step in [1, 2, 5] {
                let rate = decade * step;
                if rate >= u64::from(min) && rate <= u64::from(max) {
                    rates.push(rate as u32);
                }
            }
            decade *= 10;
        }
        if rates.last() != Some(&max) && max >= min {
            rates.push(max);
        }
        rates
    }

    /// Bytes the firmware uses per sample when `highest_channel` is captured
    pub fn bytes_per_sample(highest_channel: u8) -> u32 {
        match highest_channel {
            0..=7 => 1,
            8..=15 => 2,
            _ => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionTarget {
    Serial { port: String, baud_rate: u32 },
    Network { host: String, port: u16 },
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionTarget::Serial { port, .. } => write!(f, "{}", port),
            ConnectionTarget::Network { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub target: ConnectionTarget,
    pub handshake_timeout: Duration,
    pub command_timeout: Duration,
    /// How long to wait for the trigger to fire once the capture is armed
    pub trigger_timeout: Duration,
    /// Inactivity limit while sample data is streaming in
    pub read_timeout: Duration,
    /// Extra handshake attempts after a timeout
    pub retries: u32,
}

impl ConnectionParams {
    pub const DEFAULT_BAUD_RATE: u32 = 115_200;
    pub const DEFAULT_NETWORK_PORT: u16 = 4045;

    pub fn serial(port: &str) -> Self {
        Self::with_target(ConnectionTarget::Serial {
            port: port.to_string(),
            baud_rate: Self::DEFAULT_BAUD_RATE,
        })
    }

    pub fn network(host: &str, port: u16) -> Self {
        Self::with_target(ConnectionTarget::Network {
            host: host.to_string(),
            port,
        })
    }

    pub fn with_target(target: ConnectionTarget) -> Self {
        Self {
            target,
            handshake_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_secs(1),
            trigger_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(2),
            retries: 1,
        }
    }

    pub fn trigger_timeout(mut self, timeout: Duration) -> Self {
        self.trigger_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionResult {
    pub device_info: DeviceInfo,
    pub capabilities: HardwareCapabilities,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyzerChannel {
    pub index: u8,
    pub name: String,
    /// One byte per sample, 0 or 1
    pub samples: Vec<u8>,
}

impl AnalyzerChannel {
    pub fn new(index: u8) -> Self {
        Self {
            index,
            name: format!("Channel {}", u32::from(index) + 1),
            samples: Vec::new(),
        }
    }

    pub fn named(index: u8, name: &str) -> Self {
        Self {
            index,
            name: name.to_string(),
            samples: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CaptureConfigError {
    #[error("No channels selected for capture")]
    NoChannels,

    #[error("Channel {0} selected more than once")]
    DuplicateChannel(u8),

    #[error("Channel {channel} out of range (device has {available} channels)")]
    ChannelOutOfRange { channel: u8, available: u8 },

    #[error("Sample rate {frequency} Hz outside supported range {min}..={max} Hz")]
    FrequencyOutOfRange { frequency: u32, min: u32, max: u32 },

    #[error("At least {min} pre-trigger samples required")]
    TooFewPreTriggerSamples { min: u32 },

    #[error("At least {min} post-trigger samples required")]
    TooFewPostTriggerSamples { min: u32 },

    #[error("Capture needs {requested} samples but the device buffer holds {capacity}")]
    BufferExceeded { requested: u64, capacity: u64 },

    #[error("Trigger type {0:?} is not supported by this device")]
    TriggerNotSupported(TriggerType),

    #[error("Trigger channel {channel} out of range (device has {available} channels)")]
    TriggerChannelOutOfRange { channel: u8, available: u8 },

    #[error("Trigger pattern is {width} bits wide (max {max})")]
    PatternTooWide { width: u8, max: u8 },

    #[error("Trigger channels {first}..={last} span more than one device")]
    TriggerSpansDevices { first: u8, last: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureSession {
    pub frequency: u32,
    pub pre_trigger_samples: u32,
    pub post_trigger_samples: u32,
    /// Additional post-trigger bursts, 0 for a single capture
    pub loop_count: u8,
    pub measure_bursts: bool,
    pub trigger: TriggerConfig,
    pub channels: Vec<AnalyzerChannel>,
}

impl CaptureSession {
    pub fn new(frequency: u32, pre_trigger_samples: u32, post_trigger_samples: u32) -> Self {
        Self {
            frequency,
            pre_trigger_samples,
            post_trigger_samples,
            loop_count: 0,
            measure_bursts: false,
            trigger: TriggerConfig::default(),
            channels: Vec::new(),
        }
    }

    pub fn with_channels(mut self, indices: &[u8]) -> Self {
        self.channels = indices.iter().map(|&i| AnalyzerChannel::new(i)).collect();
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerConfig) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn total_samples(&self) -> u64 {
        u64::from(self.pre_trigger_samples) + u64::from(self.post_trigger_samples)
    }

    pub fn channel_bitmap(&self) -> u32 {
        self.channels
            .iter()
            .filter(|c| c.index < 32)
            .fold(0u32, |bitmap, c| bitmap | (1 << c.index))
    }

    pub fn highest_channel(&self) -> u8 {
        self.channels.iter().map(|c| c.index).max().unwrap_or(0)
    }

    pub fn bytes_per_sample(&self) -> u32 {
        HardwareCapabilities::bytes_per_sample(self.highest_channel())
    }

    pub fn channel(&self, index: u8) -> Option<&AnalyzerChannel> {
        self.channels.iter().find(|c| c.index == index)
    }

    pub fn clear_samples(&mut self) {
        for channel in &mut self.channels {
            channel.samples.clear();
        }
    }

    pub fn to_request(&self) -> CaptureRequest {
        let (trigger_type, trigger, trigger_value) = self.trigger.request_fields();
        CaptureRequest {
            trigger_type,
            trigger,
            trigger_value,
            frequency: self.frequency,
            channels: self.channel_bitmap(),
            pre_trigger_samples: self.pre_trigger_samples,
            post_trigger_samples: self.post_trigger_samples,
            loop_count: self.loop_count,
            measure: u8::from(self.measure_bursts),
        }
    }

    /// Check the session against what the device can do
    pub fn validate(&self, capabilities: &HardwareCapabilities) -> Result<(), CaptureConfigError> {
        if self.channels.is_empty() {
            return Err(CaptureConfigError::NoChannels);
        }

        let available = capabilities.channels.digital;
        let mut seen = 0u64;
        for channel in &self.channels {
            if channel.index >= available || channel.index >= 32 {
                return Err(CaptureConfigError::ChannelOutOfRange {
                    channel: channel.index,
                    available,
                });
            }
            if seen & (1 << channel.index) != 0 {
                return Err(CaptureConfigError::DuplicateChannel(channel.index));
            }
            seen |= 1 << channel.index;
        }

        let sampling = &capabilities.sampling;
        let max = if self.trigger.trigger_type == TriggerType::Blast {
            sampling.blast_rate.max(sampling.max_rate)
        } else {
            sampling.max_rate
        };
        if self.frequency < sampling.min_rate || self.frequency > max {
            return Err(CaptureConfigError::FrequencyOutOfRange {
                frequency: self.frequency,
                min: sampling.min_rate,
                max,
            });
        }

        if self.pre_trigger_samples < MIN_TRIGGER_SAMPLES {
            return Err(CaptureConfigError::TooFewPreTriggerSamples {
                min: MIN_TRIGGER_SAMPLES,
            });
        }
        if self.post_trigger_samples < MIN_TRIGGER_SAMPLES {
            return Err(CaptureConfigError::TooFewPostTriggerSamples {
                min: MIN_TRIGGER_SAMPLES,
            });
        }

        let capacity = u64::from(sampling.buffer_size / self.bytes_per_sample());
        let requested = self.total_samples() * (u64::from(self.loop_count) + 1);
        if requested > capacity {
            return Err(CaptureConfigError::BufferExceeded {
                requested,
                capacity,
            });
        }

        let triggers = &capabilities.triggers;
        if !triggers.types.contains(&self.trigger.trigger_type) {
            return Err(CaptureConfigError::TriggerNotSupported(
                self.trigger.trigger_type,
            ));
        }
        if !self.trigger.is_external() && self.trigger.highest_channel() >= available {
            return Err(CaptureConfigError::TriggerChannelOutOfRange {
                channel: self.trigger.highest_channel(),
                available,
            });
        }
        let max_width = match self.trigger.trigger_type {
            TriggerType::Fast => triggers.max_fast_pattern_width,
            TriggerType::Complex => triggers.max_pattern_width,
            TriggerType::Edge | TriggerType::Blast => 1,
        };
        if self.trigger.bit_count > max_width {
            return Err(CaptureConfigError::PatternTooWide {
                width: self.trigger.bit_count,
                max: max_width,
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureStatus {
    Completed,
    /// Some member devices of a multi-device capture failed
    PartialSuccess,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceFailure {
    pub device_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureResult {
    pub status: CaptureStatus,
    pub session: CaptureSession,
    pub burst_timestamps: Vec<u32>,
    pub failed_devices: Vec<DeviceFailure>,
    pub duration: Duration,
}

impl CaptureResult {
    pub fn is_complete(&self) -> bool {
        self.status == CaptureStatus::Completed
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureDataError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Inconsistent capture data: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureMetadata {
    pub device: DeviceInfo,
    pub sample_rate: u32,
    pub total_samples: u64,
    pub trigger_position: Option<u64>,
    /// Unix time in milliseconds
    pub captured_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub index: u8,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleRun {
    pub value: u8,
    pub length: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEncoding {
    Binary,
    RunLength,
}

/// Per-channel sample payload, in the order of `UnifiedCaptureData::channels`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "channels", rename_all = "snake_case")]
pub enum DigitalSamples {
    Binary(Vec<Vec<u8>>),
    RunLength(Vec<Vec<SampleRun>>),
}

impl DigitalSamples {
    pub fn encoding(&self) -> SampleEncoding {
        match self {
            DigitalSamples::Binary(_) => SampleEncoding::Binary,
            DigitalSamples::RunLength(_) => SampleEncoding::RunLength,
        }
    }

    pub fn channel_count(&self) -> usize {
        match self {
            DigitalSamples::Binary(channels) => channels.len(),
            DigitalSamples::RunLength(channels) => channels.len(),
        }
    }

    /// Expanded samples of the channel at `position`
    pub fn channel(&self, position: usize) -> Option<Vec<u8>> {
        match self {
            DigitalSamples::Binary(channels) => channels.get(position).cloned(),
            DigitalSamples::RunLength(channels) => channels.get(position).map(|r| run_length_decode(r)),
        }
    }
}

pub fn run_length_encode(samples: &[u8]) -> Vec<SampleRun> {
    let mut runs: Vec<SampleRun> = Vec::new();
    for &value in samples {
        match runs.last_mut() {
            Some(run) if run.value == value && run.length < u32::MAX => run.length += 1,
            _ => runs.push(SampleRun { value, length: 1 }),
        }
    }
    runs
}

pub fn run_length_decode(runs: &[SampleRun]) -> Vec<u8> {
    let total: usize = runs.iter().map(|r| r.length as usize).sum();
    let mut samples = Vec::with_capacity(total);
    for run in runs {
        samples.extend(std::iter::repeat(run.value).take(run.length as usize));
    }
    samples
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CaptureQuality {
    pub lost_samples: u64,
    pub error_rate: f64,
}

/// Finished capture in the canonical container shared with export and
/// visualization consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedCaptureData {
    pub metadata: CaptureMetadata,
    pub channels: Vec<ChannelInfo>,
    pub samples: DigitalSamples,
    pub quality: CaptureQuality,
}

impl UnifiedCaptureData {
    pub fn from_session(device: DeviceInfo, session: &CaptureSession) -> Self {
        let total_samples = session.total_samples();
        let lost_samples: u64 = session
            .channels
            .iter()
            .map(|c| total_samples.saturating_sub(c.samples.len() as u64))
            .sum();
        let expected = total_samples * session.channels.len() as u64;
        let error_rate = if expected == 0 {
            0.0
        } else {
            lost_samples as f64 / expected as f64
        };

        let captured_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            metadata: CaptureMetadata {
                device,
                sample_rate: session.frequency,
                total_samples,
                trigger_position: (total_samples > 0)
                    .then_some(u64::from(session.pre_trigger_samples)),
                captured_at_ms,
            },
            channels: session
                .channels
                .iter()
                .map(|c| ChannelInfo {
                    index: c.index,
                    name: c.name.clone(),
                })
                .collect(),
            samples: DigitalSamples::Binary(
                session.channels.iter().map(|c| c.samples.clone()).collect(),
            ),
            quality: CaptureQuality {
                lost_samples,
                error_rate,
            },
        }
    }

    /// Re-encode the sample payload as runs
    pub fn into_run_length(mut self) -> Self {
        if let DigitalSamples::Binary(channels) = &self.samples {
            self.samples =
                DigitalSamples::RunLength(channels.iter().map(|c| run_length_encode(c)).collect());
        }
        self
    }

    /// Samples of the channel with physical `index`
    pub fn channel_samples(&self, index: u8) -> Option<Vec<u8>> {
        let position = self.channels.iter().position(|c| c.index == index)?;
        self.samples.channel(position)
    }

    /// Table view with `sample`, one boolean column per channel, and `time` in seconds
    pub fn to_dataframe(&self) -> Result<DataFrame, PolarsError> {
        #[cfg(feature = "cpu-profiling")]
        let _span = tracy_client::span!("UnifiedCaptureData::to_dataframe");

        let mut columns: Vec<Column> = Vec::with_capacity(self.channels.len());
        for (position, info) in self.channels.iter().enumerate() {
            let values: Vec<bool> = self
                .samples
                .channel(position)
                .unwrap_or_default()
                .into_iter()
                .map(|v| v != 0)
                .collect();
            columns.push(Series::new(info.name.as_str().into(), values).into());
        }

        let period = 1.0 / f64::from(self.metadata.sample_rate.max(1));
        DataFrame::new(columns)?
            .lazy()
            .with_row_index(SAMPLE_COLUMN_NAME, Some(0))
            .with_column(
                (col(SAMPLE_COLUMN_NAME).cast(DataType::Float64) * lit(period))
                    .alias(TIME_COLUMN_NAME),
            )
            .collect()
    }

    pub fn to_json(&self) -> Result<String, CaptureDataError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, CaptureDataError> {
        let data: Self = serde_json::from_str(json)?;
        data.check_consistency()?;
        Ok(data)
    }

    fn check_consistency(&self) -> Result<(), CaptureDataError> {
        if self.channels.len() != self.samples.channel_count() {
            return Err(CaptureDataError::Inconsistent(format!(
                "{} channels described but {} sample arrays present",
                self.channels.len(),
                self.samples.channel_count()
            )));
        }
        Ok(())
    }
}
