//! # Logic Analyzer RS
//!
//! A Rust library for acquiring, decoding and monitoring captures from
//! multi-channel logic analyzer hardware.
//!
//! ## Features
//!
//! - **Device discovery**: Uses `serialport` for finding analyzers on USB serial ports
//! - **Serial and network transports**: Same binary protocol over a serial line or TCP
//! - **Trigger configuration**: Edge, complex pattern and fast pattern triggers with builders
//! - **Multi-device captures**: Several analyzers combined into one wide capture
//! - **Protocol decoders**: I2C, SPI and UART decoding on captured channels
//! - **Progress monitoring**: Session phases, device health and performance statistics
//! - **DataFrame output**: Uses `polars` for tabular export of captured samples
//!
//! ## Examples
//!
//! ### Capture from a serial analyzer
//!
//! ```rust,no_run
//! use logic_analyzer_rs::{
//!     AnalyzerDriver, CaptureSession, ConnectionParams, EdgeTrigger, LogicAnalyzerDriver,
//! };
//!
//! let mut driver = LogicAnalyzerDriver::new("la0");
//! let connected = driver.connect(&ConnectionParams::serial("/dev/ttyACM0"))?;
//! println!("Connected to {}", connected.device_info.name);
//!
//! let session = CaptureSession::new(1_000_000, 100, 900)
//!     .with_channels(&[0, 1])
//!     .with_trigger(EdgeTrigger::on_channel(0).rising_edge());
//! let result = driver.start_capture(session)?;
//! println!("{:?}: {} samples", result.status, result.session.channels[0].samples.len());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Pattern trigger
//!
//! ```rust
//! use logic_analyzer_rs::{BitState, PatternTrigger};
//!
//! let trigger = PatternTrigger::start_capturing_when()
//!     .bit0(BitState::High)
//!     .bit1(BitState::Low)
//!     .matches()
//!     .unwrap();
//! assert_eq!(trigger.highest_channel(), 1);
//! ```
//!
//! ### Decoding
//!
//! ```rust,no_run
//! use logic_analyzer_rs::{CaptureSession, DecoderRegistry};
//!
//! # fn decode(session: &CaptureSession) -> Result<(), Box<dyn std::error::Error>> {
//! let registry = DecoderRegistry::new();
//! let frames = registry.decode_session("i2c", session, &[("scl", 0), ("sda", 1)], &[])?;
//! for frame in frames {
//!     println!("{}..{} {:?}", frame.start_sample, frame.end_sample, frame.values);
//! }
//! # Ok(())
//! # }
//! ```

pub mod capture_models;
pub mod connector;
pub mod decoders;
pub mod driver;
pub mod monitor;
pub mod simulator;
pub mod terminal;
pub mod transport;
pub mod trigger_config;
pub mod wire_protocol;

// Re-export the main types for convenience
pub use capture_models::{
    AnalyzerChannel, CaptureConfigError, CaptureResult, CaptureSession, CaptureStatus,
    ConnectionParams, ConnectionResult, ConnectionTarget, DeviceInfo, DriverType,
    HardwareCapabilities, UnifiedCaptureData,
};

pub use trigger_config::{
    BitState, BitTriggerBuilder, EdgeTrigger, EdgeTriggerBuilder, PatternTrigger, TriggerConfig,
    TriggerConfigError, TriggerType,
};

pub use connector::{AnalyzerDevice, ConnectionError, Connector};

pub use driver::{
    AnalyzerDriver, DataChunk, DriverError, DriverEvent, DriverStatus, LogicAnalyzerDriver,
    MultiAnalyzerDriver, SubscriptionId,
};

pub use decoders::{DecodeError, DecoderRegistry, DecoderResult, ProtocolDecoder};

pub use monitor::{CapturePhase, CaptureProgress, CaptureProgressMonitor, MonitorConfig};

pub use simulator::{SimulatedAnalyzer, SimulatorConfig};
