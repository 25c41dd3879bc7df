//! UART decoder
//!
//! Each bound line (RX, then TX) is decoded in its own pass. Lines idle high;
//! a falling edge opens a frame and every bit is sampled at `sample_point`
//! percent into its bit window.

use super::cursor::{Condition, Edge, SampleCursor};
use super::{
    bind_channels, check_range, AnnotationType, ChannelData, ChannelRole, DecodeError,
    DecoderInfo, DecoderOption, DecoderOptionError, DecoderOptionValue, DecoderResult,
    OptionValue, ProtocolDecoder, ResolvedOptions,
};
use tracing::{debug, trace};

const RX: usize = 0;
const TX: usize = 1;

/// Annotation offsets within a line's block; RX uses even, TX odd indices
const ANN_DATA: usize = 0;
const ANN_START: usize = 2;
const ANN_PARITY_OK: usize = 4;
const ANN_PARITY_ERR: usize = 6;
const ANN_STOP: usize = 8;
const ANN_WARNING: usize = 10;
const ANN_PACKET: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Parity {
    None,
    Odd,
    Even,
    Mark,
    Space,
    Ignore,
}

impl Parity {
    fn from_option(value: &str) -> Self {
        match value {
            "odd" => Parity::Odd,
            "even" => Parity::Even,
            "mark" => Parity::Mark,
            "space" => Parity::Space,
            "ignore" => Parity::Ignore,
            _ => Parity::None,
        }
    }

    /// Whether the received parity bit is consistent with `data`, `None` if
    /// it is not checked
    fn check(self, data: u32, bit: u8) -> Option<bool> {
        let ones = data.count_ones() + u32::from(bit);
        match self {
            Parity::None | Parity::Ignore => None,
            Parity::Odd => Some(ones % 2 == 1),
            Parity::Even => Some(ones % 2 == 0),
            Parity::Mark => Some(bit == 1),
            Parity::Space => Some(bit == 0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Settings {
    baud_rate: u32,
    data_bits: u32,
    parity: Parity,
    stop_bits: f64,
    msb_first: bool,
    /// Fraction of a bit window, 0..1
    sample_point: f64,
    packet_len: usize,
}

impl Settings {
    fn from_options(options: &ResolvedOptions) -> Self {
        Self {
            baud_rate: options.int("baudrate").max(1) as u32,
            data_bits: options.int("data_bits").clamp(5, 9) as u32,
            parity: Parity::from_option(options.str("parity")),
            stop_bits: options.float("stop_bits"),
            msb_first: options.str("bit_order") == "msb-first",
            sample_point: options.int("sample_point").clamp(1, 99) as f64 / 100.0,
            packet_len: options.int("packet_len").max(0) as usize,
        }
    }

    fn has_parity_bit(&self) -> bool {
        self.parity != Parity::None
    }
}

/// Consecutive bytes waiting to be grouped into a packet
#[derive(Debug, Default)]
struct Packet {
    start: usize,
    end: usize,
    bytes: Vec<u32>,
}

pub struct UartDecoder {
    info: DecoderInfo,
}

impl Default for UartDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl UartDecoder {
    pub fn new() -> Self {
        Self {
            info: Self::describe(),
        }
    }

    fn describe() -> DecoderInfo {
        let annotation = |id, description| AnnotationType { id, description };
        DecoderInfo {
            id: "uart",
            name: "UART",
            long_name: "Universal Asynchronous Receiver/Transmitter",
            description: "Asynchronous, serial bus.",
            channels: vec![],
            optional_channels: vec![
                ChannelRole {
                    id: "rx",
                    name: "RX",
                    description: "UART receive line",
                },
                ChannelRole {
                    id: "tx",
                    name: "TX",
                    description: "UART transmit line",
                },
            ],
            annotations: vec![
                annotation("rx-data", "RX data"),
                annotation("tx-data", "TX data"),
                annotation("rx-start", "RX start bit"),
                annotation("tx-start", "TX start bit"),
                annotation("rx-parity-ok", "RX parity OK bit"),
                annotation("tx-parity-ok", "TX parity OK bit"),
                annotation("rx-parity-err", "RX parity error bit"),
                annotation("tx-parity-err", "TX parity error bit"),
                annotation("rx-stop", "RX stop bit"),
                annotation("tx-stop", "TX stop bit"),
                annotation("rx-warning", "RX warning"),
                annotation("tx-warning", "TX warning"),
                annotation("rx-packet", "RX packet"),
                annotation("tx-packet", "TX packet"),
            ],
            options: vec![
                DecoderOption::new("baudrate", "Baud rate", OptionValue::Int(115_200)),
                DecoderOption::new("data_bits", "Data bits", OptionValue::Int(8)),
                DecoderOption::new("parity", "Parity", "none".into())
                    .one_of(&["none", "odd", "even", "mark", "space", "ignore"]),
                DecoderOption::new("stop_bits", "Stop bits", OptionValue::Float(1.0)),
                DecoderOption::new("bit_order", "Bit order", "lsb-first".into())
                    .one_of(&["lsb-first", "msb-first"]),
                DecoderOption::new(
                    "sample_point",
                    "Sample point (%)",
                    OptionValue::Int(50),
                ),
                DecoderOption::new("invert_rx", "Invert RX", "no".into()).one_of(&["yes", "no"]),
                DecoderOption::new("invert_tx", "Invert TX", "no".into()).one_of(&["yes", "no"]),
                DecoderOption::new(
                    "packet_len",
                    "Bytes per packet annotation, 0 to disable",
                    OptionValue::Int(0),
                ),
            ],
        }
    }

    fn decode_line(
        cursor: &mut SampleCursor<'_>,
        line: usize,
        settings: &Settings,
        bit_width: f64,
        inverted: bool,
    ) {
        let ann = |offset: usize| offset + line;
        let start_edge = if inverted { Edge::Rising } else { Edge::Falling };
        let frame_bits = 1.0
            + f64::from(settings.data_bits)
            + if settings.has_parity_bit() { 1.0 } else { 0.0 }
            + settings.stop_bits;

        let mut packet = Packet::default();
        let mut frames = 0usize;

        'frames: while let Some(edge) = cursor.wait(&[Condition::Edge(line, start_edge)]) {
            let frame_start = edge.sample as f64;
            let at = |bits: f64| (frame_start + bits * bit_width) as usize;
            let frame_end = at(frame_bits);
            let sample_bit = |cursor: &mut SampleCursor<'_>, position: f64| {
                Self::sample_line(cursor, at(position), line, inverted)
            };

            let Some(start_bit) = sample_bit(&mut *cursor, settings.sample_point) else {
                break;
            };
            if start_bit != 0 {
                cursor.put(
                    edge.sample,
                    at(1.0),
                    ann(ANN_WARNING),
                    vec!["Frame error: start bit high".to_string(), "Frame error".to_string()],
                );
                continue;
            }

            let mut data = 0u32;
            for i in 0..settings.data_bits {
                let Some(bit) = sample_bit(&mut *cursor, 1.0 + f64::from(i) + settings.sample_point)
                else {
                    break 'frames;
                };
                if settings.msb_first {
                    data = (data << 1) | u32::from(bit);
                } else {
                    data |= u32::from(bit) << i;
                }
            }

            let mut position = 1.0 + f64::from(settings.data_bits);
            let mut parity = None;
            if settings.has_parity_bit() {
                let Some(bit) = sample_bit(&mut *cursor, position + settings.sample_point) else {
                    break;
                };
                parity = settings.parity.check(data, bit);
                position += 1.0;
            }

            let stop_start = position;
            let mut stop_ok = true;
            let mut stop_index = 0.0;
            while stop_index < settings.stop_bits {
                let fraction = (settings.stop_bits - stop_index).min(1.0);
                let Some(bit) =
                    sample_bit(&mut *cursor, stop_start + stop_index + settings.sample_point * fraction)
                else {
                    break 'frames;
                };
                stop_ok &= bit == 1;
                stop_index += 1.0;
            }

            trace!("UART line {} byte {:#04X} at {}", line, data, edge.sample);
            let hex = format!("0x{:02X}", data);
            cursor.put(edge.sample, frame_end, ann(ANN_DATA), vec![hex.clone()]);
            cursor.put(
                edge.sample,
                at(1.0),
                ann(ANN_START),
                vec!["Start bit".to_string(), "S".to_string()],
            );
            match parity {
                Some(true) => cursor.put(
                    at(stop_start - 1.0),
                    at(stop_start),
                    ann(ANN_PARITY_OK),
                    vec!["Parity OK".to_string(), "P".to_string()],
                ),
                Some(false) => cursor.put(
                    at(stop_start - 1.0),
                    at(stop_start),
                    ann(ANN_PARITY_ERR),
                    vec!["Parity error".to_string(), "PE".to_string()],
                ),
                None => {}
            }
            cursor.put(
                at(stop_start),
                frame_end,
                ann(ANN_STOP),
                vec!["Stop bit".to_string(), "T".to_string()],
            );
            if !stop_ok {
                cursor.put(
                    at(stop_start),
                    frame_end,
                    ann(ANN_WARNING),
                    vec!["Frame error: stop bit low".to_string(), "Frame error".to_string()],
                );
            }
            frames += 1;

            if settings.packet_len > 0 {
                if packet.bytes.is_empty() {
                    packet.start = edge.sample;
                }
                packet.bytes.push(data);
                packet.end = frame_end;
                if packet.bytes.len() == settings.packet_len {
                    Self::put_packet(cursor, ann(ANN_PACKET), &mut packet);
                }
            }
        }

        if !packet.bytes.is_empty() {
            Self::put_packet(cursor, ann(ANN_PACKET), &mut packet);
        }
        debug!("UART line {} decoded {} frames", line, frames);
    }

    /// Logical level of `line` at `sample`
    fn sample_line(
        cursor: &mut SampleCursor<'_>,
        sample: usize,
        line: usize,
        inverted: bool,
    ) -> Option<u8> {
        cursor
            .skip_to(sample)
            .map(|pins| pins.bit(line) ^ u8::from(inverted))
    }

    fn put_packet(cursor: &mut SampleCursor<'_>, annotation: usize, packet: &mut Packet) {
        let text = packet
            .bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ");
        cursor.put(packet.start, packet.end, annotation, vec![text]);
        packet.bytes.clear();
    }
}

impl ProtocolDecoder for UartDecoder {
    fn info(&self) -> &DecoderInfo {
        &self.info
    }

    fn check_option(&self, id: &'static str, value: &OptionValue) -> Result<(), DecoderOptionError> {
        match id {
            "baudrate" => check_range(id, value, 1.0, f64::from(u32::MAX)),
            "data_bits" => check_range(id, value, 5.0, 9.0),
            "stop_bits" => check_range(id, value, 0.5, 2.0),
            "sample_point" => check_range(id, value, 1.0, 99.0),
            "packet_len" => check_range(id, value, 0.0, 4096.0),
            _ => Ok(()),
        }
    }

    fn decode(
        &mut self,
        sample_rate: u32,
        channels: &[ChannelData<'_>],
        options: &[DecoderOptionValue],
    ) -> Result<Vec<DecoderResult>, DecodeError> {
        let lines = bind_channels(&self.info, sample_rate, channels)?;
        if lines.iter().all(Option::is_none) {
            return Err(DecodeError::ChannelConfiguration(
                "UART requires at least one of RX and TX to be bound".to_string(),
            ));
        }

        let options = self.resolve_options(options);
        let settings = Settings::from_options(&options);
        if sample_rate < settings.baud_rate {
            return Err(DecodeError::InvalidSampleRate(format!(
                "sample rate {} Hz is below the baud rate {}",
                sample_rate, settings.baud_rate
            )));
        }
        let bit_width = f64::from(sample_rate) / f64::from(settings.baud_rate);
        debug!("UART decode with {:?}, {:.2} samples per bit", settings, bit_width);

        let mut results = Vec::new();
        for (line, invert_option) in [(RX, "invert_rx"), (TX, "invert_tx")] {
            if lines[line].is_none() {
                continue;
            }
            let mut cursor = SampleCursor::new(lines.clone());
            let inverted = options.str(invert_option) == "yes";
            Self::decode_line(&mut cursor, line, &settings, bit_width, inverted);
            results.extend(cursor.into_results());
        }

        Ok(results)
    }
}
