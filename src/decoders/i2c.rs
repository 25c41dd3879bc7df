//! I2C decoder
//!
//! START is SDA falling while SCL is high, STOP is SDA rising while SCL is
//! high. In between, SDA is sampled on every SCL rising edge: eight bits
//! MSB-first followed by the ACK bit (low = ACK). The first byte after a
//! (repeated) START is the address with R/W in its LSB.

use super::cursor::{Condition, Edge, Level, SampleCursor};
use super::{
    bind_channels, AnnotationType, ChannelData, ChannelRole, DecodeError, DecoderInfo,
    DecoderOption, DecoderOptionValue, DecoderResult, OptionValue, ProtocolDecoder,
};
use tracing::{debug, trace};

const SCL: usize = 0;
const SDA: usize = 1;

const ANN_START: usize = 0;
const ANN_REPEAT_START: usize = 1;
const ANN_STOP: usize = 2;
const ANN_ACK: usize = 3;
const ANN_NACK: usize = 4;
const ANN_BIT: usize = 5;
const ANN_ADDRESS_READ: usize = 6;
const ANN_ADDRESS_WRITE: usize = 7;
const ANN_DATA_READ: usize = 8;
const ANN_DATA_WRITE: usize = 9;
const ANN_WARNING: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    FindStart,
    FindAddress,
    FindData,
}

/// Bits of the byte being assembled
#[derive(Debug, Default)]
struct ByteAccumulator {
    value: u8,
    /// Rising edge sample of each bit received so far
    edges: Vec<usize>,
}

impl ByteAccumulator {
    fn reset(&mut self) {
        self.value = 0;
        self.edges.clear();
    }

    fn push(&mut self, sample: usize, bit: u8) {
        self.value = (self.value << 1) | bit;
        self.edges.push(sample);
    }

    fn is_complete(&self) -> bool {
        self.edges.len() == 8
    }
}

pub struct I2cDecoder {
    info: DecoderInfo,
    state: State,
    byte: ByteAccumulator,
    reading: bool,
    shifted_address: bool,
}

impl Default for I2cDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl I2cDecoder {
    pub fn new() -> Self {
        Self {
            info: Self::describe(),
            state: State::FindStart,
            byte: ByteAccumulator::default(),
            reading: false,
            shifted_address: true,
        }
    }

    fn describe() -> DecoderInfo {
        let annotation = |id, description| AnnotationType { id, description };
        DecoderInfo {
            id: "i2c",
            name: "I²C",
            long_name: "Inter-Integrated Circuit",
            description: "Two-wire, multi-master, serial bus.",
            channels: vec![
                ChannelRole {
                    id: "scl",
                    name: "SCL",
                    description: "Serial clock line",
                },
                ChannelRole {
                    id: "sda",
                    name: "SDA",
                    description: "Serial data line",
                },
            ],
            optional_channels: vec![],
            annotations: vec![
                annotation("start", "Start condition"),
                annotation("repeat-start", "Repeat start condition"),
                annotation("stop", "Stop condition"),
                annotation("ack", "ACK"),
                annotation("nack", "NACK"),
                annotation("bit", "Data/address bit"),
                annotation("address-read", "Address read"),
                annotation("address-write", "Address write"),
                annotation("data-read", "Data read"),
                annotation("data-write", "Data write"),
                annotation("warning", "Warning"),
            ],
            options: vec![DecoderOption::new(
                "address_format",
                "Displayed slave address format",
                OptionValue::from("shifted"),
            )
            .one_of(&["shifted", "unshifted"])],
        }
    }

    fn reset(&mut self) {
        self.state = State::FindStart;
        self.byte.reset();
        self.reading = false;
    }

    /// A STOP or repeated START is preceded by its own SCL rising edge, so a
    /// single pending bit is expected.
    fn warn_incomplete(&mut self, cursor: &mut SampleCursor<'_>, sample: usize) {
        if self.byte.edges.len() > 1 {
            let first = self.byte.edges[0];
            debug!("I2C byte interrupted after {} bits", self.byte.edges.len());
            cursor.put(
                first,
                sample,
                ANN_WARNING,
                vec![
                    format!("Incomplete byte ({} bits)", self.byte.edges.len()),
                    "Incomplete".to_string(),
                    "!".to_string(),
                ],
            );
        }
        self.byte.reset();
    }

    fn on_start(&mut self, cursor: &mut SampleCursor<'_>, sample: usize) {
        if self.state == State::FindStart {
            cursor.put(
                sample,
                sample + 1,
                ANN_START,
                vec!["Start".to_string(), "S".to_string()],
            );
        } else {
            self.warn_incomplete(cursor, sample);
            cursor.put(
                sample,
                sample + 1,
                ANN_REPEAT_START,
                vec!["Start repeat".to_string(), "Sr".to_string()],
            );
        }
        self.byte.reset();
        self.state = State::FindAddress;
    }

    fn on_stop(&mut self, cursor: &mut SampleCursor<'_>, sample: usize) {
        self.warn_incomplete(cursor, sample);
        cursor.put(
            sample,
            sample + 1,
            ANN_STOP,
            vec!["Stop".to_string(), "P".to_string()],
        );
        self.reset();
    }

    fn on_clock(&mut self, cursor: &mut SampleCursor<'_>, sample: usize, sda: u8) {
        if !self.byte.is_complete() {
            self.byte.push(sample, sda);
            return;
        }

        // Ninth clock: ACK/NACK
        let edges = &self.byte.edges;
        let first = edges[0];
        let bit_width = edges[7] - edges[6];
        let value = self.byte.value;

        let (annotation, long, short) = if self.state == State::FindAddress {
            self.reading = value & 1 == 1;
            let address = if self.shifted_address { value >> 1 } else { value };
            let (annotation, label, tag) = if self.reading {
                (ANN_ADDRESS_READ, "Address read", "AR")
            } else {
                (ANN_ADDRESS_WRITE, "Address write", "AW")
            };
            (
                annotation,
                format!("{}: 0x{:02X}", label, address),
                format!("{}: 0x{:02X}", tag, address),
            )
        } else if self.reading {
            (
                ANN_DATA_READ,
                format!("Data read: 0x{:02X}", value),
                format!("DR: 0x{:02X}", value),
            )
        } else {
            (
                ANN_DATA_WRITE,
                format!("Data write: 0x{:02X}", value),
                format!("DW: 0x{:02X}", value),
            )
        };
        trace!("I2C byte 0x{:02X} at {}..{}", value, first, sample);

        cursor.put(first, sample, annotation, vec![long, short, format!("{:02X}", value)]);
        for (i, &edge) in edges.iter().enumerate() {
            let end = edges.get(i + 1).copied().unwrap_or(sample);
            let bit = (value >> (7 - i)) & 1;
            cursor.put(edge, end, ANN_BIT, vec![bit.to_string()]);
        }

        let (annotation, values) = if sda == 0 {
            (ANN_ACK, vec!["ACK".to_string(), "A".to_string()])
        } else {
            (ANN_NACK, vec!["NACK".to_string(), "N".to_string()])
        };
        cursor.put(sample, sample + bit_width.max(1), annotation, values);

        self.byte.reset();
        self.state = State::FindData;
    }
}

impl ProtocolDecoder for I2cDecoder {
    fn info(&self) -> &DecoderInfo {
        &self.info
    }

    fn decode(
        &mut self,
        sample_rate: u32,
        channels: &[ChannelData<'_>],
        options: &[DecoderOptionValue],
    ) -> Result<Vec<DecoderResult>, DecodeError> {
        let lines = bind_channels(&self.info, sample_rate, channels)?;
        let options = self.resolve_options(options);
        self.shifted_address = options.str("address_format") == "shifted";
        self.reset();

        let mut cursor = SampleCursor::new(lines);
        let start: &[Condition] = &[
            Condition::Level(SCL, Level::High),
            Condition::Edge(SDA, Edge::Falling),
        ];
        let stop: &[Condition] = &[
            Condition::Level(SCL, Level::High),
            Condition::Edge(SDA, Edge::Rising),
        ];
        let clock: &[Condition] = &[Condition::Edge(SCL, Edge::Rising)];

        loop {
            if self.state == State::FindStart {
                match cursor.wait(start) {
                    Some(pins) => self.on_start(&mut cursor, pins.sample),
                    None => break,
                }
                continue;
            }

            match cursor.wait_any(&[clock, start, stop]) {
                Some((0, pins)) => self.on_clock(&mut cursor, pins.sample, pins.bit(SDA)),
                Some((1, pins)) => self.on_start(&mut cursor, pins.sample),
                Some((_, pins)) => self.on_stop(&mut cursor, pins.sample),
                None => break,
            }
        }

        let results = cursor.into_results();
        debug!("I2C decode produced {} annotations", results.len());
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds SCL/SDA waveforms, four samples per bit
    #[derive(Default)]
    struct Bus {
        scl: Vec<u8>,
        sda: Vec<u8>,
    }

    impl Bus {
        fn hold(&mut self, scl: u8, sda: u8, n: usize) {
            self.scl.extend(std::iter::repeat(scl).take(n));
            self.sda.extend(std::iter::repeat(sda).take(n));
        }

        fn start(&mut self) {
            self.hold(1, 1, 4);
            self.hold(1, 0, 2);
            self.hold(0, 0, 2);
        }

        fn bit(&mut self, value: u8) {
            self.hold(0, value, 2);
            self.hold(1, value, 2);
            self.hold(0, value, 1);
        }

        fn byte(&mut self, value: u8, ack: bool) {
            for i in (0..8).rev() {
                self.bit((value >> i) & 1);
            }
            self.bit(u8::from(!ack));
        }

        fn stop(&mut self) {
            self.hold(0, 0, 2);
            self.hold(1, 0, 2);
            self.hold(1, 1, 4);
        }

        fn decode(&self, options: &[DecoderOptionValue]) -> Vec<DecoderResult> {
            I2cDecoder::new()
                .decode(
                    1_000_000,
                    &[
                        ChannelData {
                            channel_number: SCL,
                            samples: &self.scl,
                        },
                        ChannelData {
                            channel_number: SDA,
                            samples: &self.sda,
                        },
                    ],
                    options,
                )
                .unwrap()
        }
    }

    fn of_type(results: &[DecoderResult], annotation: usize) -> Vec<&DecoderResult> {
        results
            .iter()
            .filter(|r| r.annotation_type == annotation)
            .collect()
    }

    #[test]
    fn test_start_then_stop() {
        let mut bus = Bus::default();
        bus.hold(1, 1, 5);
        bus.hold(1, 0, 5);
        bus.hold(1, 1, 5);

        let results = bus.decode(&[]);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].annotation_type, ANN_START);
        assert_eq!(results[1].annotation_type, ANN_STOP);
        assert!(results[0].end_sample <= results[1].start_sample);
    }

    #[test]
    fn test_write_transaction() {
        let mut bus = Bus::default();
        bus.start();
        bus.byte(0xA0, true);
        bus.byte(0x3C, false);
        bus.stop();

        let results = bus.decode(&[]);
        let address = of_type(&results, ANN_ADDRESS_WRITE);
        assert_eq!(address.len(), 1);
        assert_eq!(address[0].values[0], "Address write: 0x50");

        let data = of_type(&results, ANN_DATA_WRITE);
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].values[2], "3C");

        assert_eq!(of_type(&results, ANN_ACK).len(), 1);
        assert_eq!(of_type(&results, ANN_NACK).len(), 1);
        assert_eq!(of_type(&results, ANN_BIT).len(), 16);
        assert_eq!(results.last().map(|r| r.annotation_type), Some(ANN_STOP));
    }

    #[test]
    fn test_repeated_start_read_unshifted() {
        let mut bus = Bus::default();
        bus.start();
        bus.byte(0xA0, true);
        bus.hold(0, 1, 2);
        bus.start();
        bus.byte(0xA1, true);
        bus.byte(0x7F, false);
        bus.stop();

        let results = bus.decode(&[DecoderOptionValue {
            option_index: 0,
            value: OptionValue::from("unshifted"),
        }]);
        assert_eq!(of_type(&results, ANN_REPEAT_START).len(), 1);
        let read = of_type(&results, ANN_ADDRESS_READ);
        assert_eq!(read[0].values[0], "Address read: 0xA1");
        assert_eq!(of_type(&results, ANN_DATA_READ)[0].values[2], "7F");
    }

    #[test]
    fn test_stop_mid_byte_warns() {
        let mut bus = Bus::default();
        bus.start();
        bus.bit(1);
        bus.bit(0);
        bus.stop();

        let results = bus.decode(&[]);
        assert_eq!(of_type(&results, ANN_WARNING).len(), 1);
        assert_eq!(results.last().map(|r| r.annotation_type), Some(ANN_STOP));
    }

    #[test]
    fn test_missing_sda_is_configuration_error() {
        let scl = [1u8, 0, 1];
        let result = I2cDecoder::new().decode(
            1_000_000,
            &[ChannelData {
                channel_number: SCL,
                samples: &scl,
            }],
            &[],
        );
        assert!(matches!(result, Err(DecodeError::ChannelConfiguration(_))));
    }

    #[test]
    fn test_length_mismatch_uses_shorter_line() {
        let mut bus = Bus::default();
        bus.start();
        bus.byte(0xA0, true);
        bus.stop();
        let truncated = &bus.sda[..10];

        let results = I2cDecoder::new()
            .decode(
                1_000_000,
                &[
                    ChannelData {
                        channel_number: SCL,
                        samples: &bus.scl,
                    },
                    ChannelData {
                        channel_number: SDA,
                        samples: truncated,
                    },
                ],
                &[],
            )
            .unwrap();
        assert_eq!(results[0].annotation_type, ANN_START);
        assert!(results.iter().all(|r| r.start_sample < 10));
    }
}
