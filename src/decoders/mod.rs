//! Protocol decoders over captured channel samples.
//!
//! Decoders are independent of drivers and transports: they take plain
//! per-channel sample arrays (one byte per sample, 0 or 1) and produce
//! annotations. Each decoder walks its input with a [`SampleCursor`], waiting
//! for edge/level conditions and emitting annotations as it goes.

mod cursor;
mod i2c;
mod registry;
mod spi;
mod uart;

pub use cursor::{Condition, Edge, Level, Pins, SampleCursor};
pub use i2c::I2cDecoder;
pub use registry::DecoderRegistry;
pub use spi::SpiDecoder;
pub use uart::UartDecoder;

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRole {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationType {
    pub id: &'static str,
    pub description: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OptionValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl OptionValue {
    fn same_kind(&self, other: &OptionValue) -> bool {
        matches!(
            (self, other),
            (OptionValue::Int(_), OptionValue::Int(_))
                | (OptionValue::Float(_), OptionValue::Float(_) | OptionValue::Int(_))
                | (OptionValue::Str(_), OptionValue::Str(_))
        )
    }

    fn kind(&self) -> &'static str {
        match self {
            OptionValue::Int(_) => "integer",
            OptionValue::Float(_) => "float",
            OptionValue::Str(_) => "string",
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Int(v) => write!(f, "{}", v),
            OptionValue::Float(v) => write!(f, "{}", v),
            OptionValue::Str(v) => write!(f, "'{}'", v),
        }
    }
}

impl From<i64> for OptionValue {
    fn from(value: i64) -> Self {
        OptionValue::Int(value)
    }
}

impl From<f64> for OptionValue {
    fn from(value: f64) -> Self {
        OptionValue::Float(value)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::Str(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecoderOption {
    pub id: &'static str,
    pub description: &'static str,
    pub default: OptionValue,
    /// Allowed values, empty when any value of the default's kind is accepted
    pub values: Vec<OptionValue>,
}

impl DecoderOption {
    fn new(id: &'static str, description: &'static str, default: OptionValue) -> Self {
        Self {
            id,
            description,
            default,
            values: Vec::new(),
        }
    }

    fn one_of(mut self, values: &[&str]) -> Self {
        self.values = values.iter().map(|&v| OptionValue::from(v)).collect();
        self
    }
}

/// Static description of a decoder
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub long_name: &'static str,
    pub description: &'static str,
    pub channels: Vec<ChannelRole>,
    pub optional_channels: Vec<ChannelRole>,
    pub annotations: Vec<AnnotationType>,
    pub options: Vec<DecoderOption>,
}

impl DecoderInfo {
    /// Required roles first, then optional ones
    pub fn roles(&self) -> impl Iterator<Item = &ChannelRole> {
        self.channels.iter().chain(&self.optional_channels)
    }

    /// Binding index of the role with `id`
    pub fn role_index(&self, id: &str) -> Option<usize> {
        self.roles().position(|role| role.id == id)
    }

    pub fn annotation_index(&self, id: &str) -> Option<usize> {
        self.annotations.iter().position(|a| a.id == id)
    }
}

/// Samples bound to the role at `channel_number` in [`DecoderInfo::roles`]
#[derive(Debug, Clone, Copy)]
pub struct ChannelData<'a> {
    pub channel_number: usize,
    pub samples: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderOptionValue {
    pub option_index: usize,
    pub value: OptionValue,
}

/// A decoded event over the half-open sample range `start_sample..end_sample`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderResult {
    pub start_sample: usize,
    pub end_sample: usize,
    /// Index into [`DecoderInfo::annotations`]
    pub annotation_type: usize,
    /// Display strings, longest first
    pub values: Vec<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Channel configuration error: {0}")]
    ChannelConfiguration(String),

    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(String),

    #[error("Unknown decoder '{0}'")]
    UnknownDecoder(String),
}

/// Problems with caller-supplied option values. These are logged and the
/// option falls back to its default.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DecoderOptionError {
    #[error("Option index {0} does not exist")]
    UnknownOption(usize),

    #[error("Option '{option}' expects a {expected} value, got {actual}")]
    WrongKind {
        option: &'static str,
        expected: &'static str,
        actual: OptionValue,
    },

    #[error("Option '{option}' does not accept {value}")]
    NotAllowed {
        option: &'static str,
        value: OptionValue,
    },

    #[error("Option '{option}' value {value} outside {min}..={max}")]
    OutOfRange {
        option: &'static str,
        value: OptionValue,
        min: f64,
        max: f64,
    },
}

/// Check a numeric option against an inclusive range
pub(crate) fn check_range(
    option: &'static str,
    value: &OptionValue,
    min: f64,
    max: f64,
) -> Result<(), DecoderOptionError> {
    let number = match value {
        OptionValue::Int(v) => *v as f64,
        OptionValue::Float(v) => *v,
        OptionValue::Str(_) => return Ok(()),
    };
    if number < min || number > max {
        return Err(DecoderOptionError::OutOfRange {
            option,
            value: value.clone(),
            min,
            max,
        });
    }
    Ok(())
}

/// Option values after validation, one per declared option
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedOptions {
    entries: Vec<(&'static str, OptionValue)>,
}

impl ResolvedOptions {
    /// Apply `supplied` over the defaults of `info`.
    ///
    /// Invalid entries are logged and ignored; `check` adds decoder specific
    /// constraints.
    pub fn resolve(
        info: &DecoderInfo,
        supplied: &[DecoderOptionValue],
        check: impl Fn(&'static str, &OptionValue) -> Result<(), DecoderOptionError>,
    ) -> Self {
        let mut entries: Vec<(&'static str, OptionValue)> = info
            .options
            .iter()
            .map(|o| (o.id, o.default.clone()))
            .collect();

        for entry in supplied {
            match Self::validate(info, entry, &check) {
                Ok(value) => entries[entry.option_index].1 = value,
                Err(e) => warn!("{}: {}, using default", info.id, e),
            }
        }

        Self { entries }
    }

    fn validate(
        info: &DecoderInfo,
        entry: &DecoderOptionValue,
        check: &impl Fn(&'static str, &OptionValue) -> Result<(), DecoderOptionError>,
    ) -> Result<OptionValue, DecoderOptionError> {
        let option = info
            .options
            .get(entry.option_index)
            .ok_or(DecoderOptionError::UnknownOption(entry.option_index))?;

        if !option.default.same_kind(&entry.value) {
            return Err(DecoderOptionError::WrongKind {
                option: option.id,
                expected: option.default.kind(),
                actual: entry.value.clone(),
            });
        }
        if !option.values.is_empty() && !option.values.contains(&entry.value) {
            return Err(DecoderOptionError::NotAllowed {
                option: option.id,
                value: entry.value.clone(),
            });
        }
        check(option.id, &entry.value)?;

        Ok(match (&option.default, &entry.value) {
            (OptionValue::Float(_), OptionValue::Int(v)) => OptionValue::Float(*v as f64),
            (_, value) => value.clone(),
        })
    }

    fn get(&self, id: &str) -> Option<&OptionValue> {
        self.entries
            .iter()
            .find(|(option, _)| *option == id)
            .map(|(_, value)| value)
    }

    pub fn int(&self, id: &str) -> i64 {
        match self.get(id) {
            Some(OptionValue::Int(v)) => *v,
            Some(OptionValue::Float(v)) => *v as i64,
            _ => 0,
        }
    }

    pub fn float(&self, id: &str) -> f64 {
        match self.get(id) {
            Some(OptionValue::Float(v)) => *v,
            Some(OptionValue::Int(v)) => *v as f64,
            _ => 0.0,
        }
    }

    pub fn str(&self, id: &str) -> &str {
        match self.get(id) {
            Some(OptionValue::Str(v)) => v,
            _ => "",
        }
    }
}

/// A bus protocol decoder.
///
/// Instances keep state for the duration of one `decode` call and must not be
/// shared between concurrent calls.
pub trait ProtocolDecoder: Send {
    fn info(&self) -> &DecoderInfo;

    /// Decoder specific constraints on option values
    fn check_option(&self, _id: &'static str, _value: &OptionValue) -> Result<(), DecoderOptionError> {
        Ok(())
    }

    fn decode(
        &mut self,
        sample_rate: u32,
        channels: &[ChannelData<'_>],
        options: &[DecoderOptionValue],
    ) -> Result<Vec<DecoderResult>, DecodeError>;

    fn resolve_options(&self, options: &[DecoderOptionValue]) -> ResolvedOptions {
        ResolvedOptions::resolve(self.info(), options, |id, value| self.check_option(id, value))
    }
}

/// Map supplied channel data onto the decoder's roles.
///
/// Entries are indexed like [`DecoderInfo::roles`]; a role is bound when a
/// non-empty sample array was supplied for it.
pub(crate) fn bind_channels<'a>(
    info: &DecoderInfo,
    sample_rate: u32,
    channels: &[ChannelData<'a>],
) -> Result<Vec<Option<&'a [u8]>>, DecodeError> {
    if sample_rate == 0 {
        return Err(DecodeError::InvalidSampleRate(
            "sample rate must be greater than zero".to_string(),
        ));
    }

    let lines: Vec<Option<&'a [u8]>> = (0..info.roles().count())
        .map(|role| {
            channels
                .iter()
                .find(|c| c.channel_number == role && !c.samples.is_empty())
                .map(|c| c.samples)
        })
        .collect();

    let missing: Vec<&str> = info
        .channels
        .iter()
        .zip(&lines)
        .filter(|(_, line)| line.is_none())
        .map(|(role, _)| role.name)
        .collect();
    if !missing.is_empty() {
        return Err(DecodeError::ChannelConfiguration(format!(
            "{} requires {} channel(s) to be bound",
            info.name,
            missing.join(" and ")
        )));
    }

    Ok(lines)
}
