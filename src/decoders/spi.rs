//! SPI decoder
//!
//! Samples MISO/MOSI on the active clock edge of the configured mode:
//!
//! | cpol | cpha | sampling edge |
//! |------|------|---------------|
//! | 0    | 0    | rising        |
//! | 0    | 1    | falling       |
//! | 1    | 0    | falling       |
//! | 1    | 1    | rising        |
//!
//! With CS bound, clock edges outside the active CS window are ignored and a
//! CS transition flushes a partially assembled word as a warning.

use super::cursor::{Condition, Edge, SampleCursor};
use super::{
    bind_channels, check_range, AnnotationType, ChannelData, ChannelRole, DecodeError,
    DecoderInfo, DecoderOption, DecoderOptionError, DecoderOptionValue, DecoderResult,
    OptionValue, ProtocolDecoder,
};
use tracing::{debug, trace};

const CLK: usize = 0;
const MISO: usize = 1;
const MOSI: usize = 2;
const CS: usize = 3;

const ANN_MISO_DATA: usize = 0;
const ANN_MOSI_DATA: usize = 1;
const ANN_MISO_BIT: usize = 2;
const ANN_MOSI_BIT: usize = 3;
const ANN_WARNING: usize = 4;

pub const MAX_WORD_SIZE: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Settings {
    sample_edge: Edge,
    cs_active_low: bool,
    msb_first: bool,
    word_size: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            sample_edge: Edge::Rising,
            cs_active_low: true,
            msb_first: true,
            word_size: 8,
        }
    }
}

/// Word under assembly on both data lines
#[derive(Debug, Default)]
struct Word {
    miso: u32,
    mosi: u32,
    /// Sampling edge of each bit
    edges: Vec<usize>,
    miso_bits: Vec<u8>,
    mosi_bits: Vec<u8>,
}

impl Word {
    fn clear(&mut self) {
        self.miso = 0;
        self.mosi = 0;
        self.edges.clear();
        self.miso_bits.clear();
        self.mosi_bits.clear();
    }
}

pub struct SpiDecoder {
    info: DecoderInfo,
    settings: Settings,
    word: Word,
}

impl Default for SpiDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl SpiDecoder {
    pub fn new() -> Self {
        Self {
            info: Self::describe(),
            settings: Settings::default(),
            word: Word::default(),
        }
    }

    fn describe() -> DecoderInfo {
        let role = |id, name, description| ChannelRole {
            id,
            name,
            description,
        };
        let annotation = |id, description| AnnotationType { id, description };
        DecoderInfo {
            id: "spi",
            name: "SPI",
            long_name: "Serial Peripheral Interface",
            description: "Full-duplex, synchronous, serial bus.",
            channels: vec![role("clk", "CLK", "Clock")],
            optional_channels: vec![
                role("miso", "MISO", "Master in, slave out"),
                role("mosi", "MOSI", "Master out, slave in"),
                role("cs", "CS#", "Chip-select"),
            ],
            annotations: vec![
                annotation("miso-data", "MISO data"),
                annotation("mosi-data", "MOSI data"),
                annotation("miso-bit", "MISO bit"),
                annotation("mosi-bit", "MOSI bit"),
                annotation("warning", "Warning"),
            ],
            options: vec![
                DecoderOption::new("cs_polarity", "Chip-select polarity", "active-low".into())
                    .one_of(&["active-low", "active-high"]),
                DecoderOption::new("cpol", "Clock polarity", OptionValue::Int(0)),
                DecoderOption::new("cpha", "Clock phase", OptionValue::Int(0)),
                DecoderOption::new("bitorder", "Bit order", "msb-first".into())
                    .one_of(&["msb-first", "lsb-first"]),
                DecoderOption::new("wordsize", "Word size", OptionValue::Int(8)),
            ],
        }
    }

    fn cs_active(&self, cs: u8) -> bool {
        (cs == 0) == self.settings.cs_active_low
    }

    fn hex(&self, value: u32) -> String {
        let digits = self.settings.word_size.div_ceil(4) as usize;
        format!("0x{:0width$X}", value, width = digits)
    }

    fn flush_partial(&mut self, cursor: &mut SampleCursor<'_>, sample: usize) {
        if let Some(&first) = self.word.edges.first() {
            debug!(
                "SPI CS transition with {} of {} bits pending",
                self.word.edges.len(),
                self.settings.word_size
            );
            cursor.put(
                first,
                sample,
                ANN_WARNING,
                vec![
                    format!(
                        "CS# transition with incomplete word ({} bits)",
                        self.word.edges.len()
                    ),
                    "Incomplete word".to_string(),
                    "!".to_string(),
                ],
            );
        }
        self.word.clear();
    }

    fn on_clock(&mut self, cursor: &mut SampleCursor<'_>, sample: usize, miso: u8, mosi: u8) {
        let bit = self.word.edges.len() as u32;
        let word = &mut self.word;
        if self.settings.msb_first {
            word.miso = (word.miso << 1) | u32::from(miso);
            word.mosi = (word.mosi << 1) | u32::from(mosi);
        } else {
            word.miso |= u32::from(miso) << bit;
            word.mosi |= u32::from(mosi) << bit;
        }
        word.edges.push(sample);
        word.miso_bits.push(miso);
        word.mosi_bits.push(mosi);

        if word.edges.len() as u32 == self.settings.word_size {
            self.emit_word(cursor);
        }
    }

    fn emit_word(&mut self, cursor: &mut SampleCursor<'_>) {
        let edges = &self.word.edges;
        let (first, last) = match (edges.first(), edges.last()) {
            (Some(&first), Some(&last)) => (first, last),
            _ => return,
        };
        let period = if edges.len() > 1 {
            last - edges[edges.len() - 2]
        } else {
            1
        };
        let end = last + period;
        trace!(
            "SPI word miso={:#X} mosi={:#X} at {}..{}",
            self.word.miso,
            self.word.mosi,
            first,
            end
        );

        let has_miso = cursor.is_bound(MISO);
        let has_mosi = cursor.is_bound(MOSI);
        if has_miso {
            cursor.put(first, end, ANN_MISO_DATA, vec![self.hex(self.word.miso)]);
        }
        if has_mosi {
            cursor.put(first, end, ANN_MOSI_DATA, vec![self.hex(self.word.mosi)]);
        }
        for (i, &edge) in edges.iter().enumerate() {
            let bit_end = edges.get(i + 1).copied().unwrap_or(end);
            if has_miso {
                cursor.put(edge, bit_end, ANN_MISO_BIT, vec![self.word.miso_bits[i].to_string()]);
            }
            if has_mosi {
                cursor.put(edge, bit_end, ANN_MOSI_BIT, vec![self.word.mosi_bits[i].to_string()]);
            }
        }
        self.word.clear();
    }
}

impl ProtocolDecoder for SpiDecoder {
    fn info(&self) -> &DecoderInfo {
        &self.info
    }

    fn check_option(&self, id: &'static str, value: &OptionValue) -> Result<(), DecoderOptionError> {
        match id {
            "cpol" | "cpha" => check_range(id, value, 0.0, 1.0),
            "wordsize" => check_range(id, value, 1.0, f64::from(MAX_WORD_SIZE)),
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
        if lines[MISO].is_none() && lines[MOSI].is_none() {
            return Err(DecodeError::ChannelConfiguration(
                "SPI requires at least one of MISO and MOSI to be bound".to_string(),
            ));
        }

        let options = self.resolve_options(options);
        let mode = (options.int("cpol"), options.int("cpha"));
        self.settings = Settings {
            sample_edge: if mode.0 == mode.1 {
                Edge::Rising
            } else {
                Edge::Falling
            },
            cs_active_low: options.str("cs_polarity") == "active-low",
            msb_first: options.str("bitorder") == "msb-first",
            word_size: options.int("wordsize").clamp(1, i64::from(MAX_WORD_SIZE)) as u32,
        };
        self.word.clear();
        debug!("SPI decode with {:?}", self.settings);

        let mut cursor = SampleCursor::new(lines);
        let has_cs = cursor.is_bound(CS);
        let clock: &[Condition] = &[Condition::Edge(CLK, self.settings.sample_edge)];
        let cs_edge: &[Condition] = &[Condition::Edge(CS, Edge::Either)];

        // CS edges take precedence so a flush is never lost to a clock edge on
        // the same sample. That clock edge still counts if CS is now active.
        while let Some((set, pins)) = cursor.wait_any(&[cs_edge, clock]) {
            if set == 0 {
                self.flush_partial(&mut cursor, pins.sample);
                if !cursor.holds_at(pins.sample, clock) {
                    continue;
                }
            }
            if has_cs && !self.cs_active(pins.bit(CS)) {
                continue;
            }
            self.on_clock(&mut cursor, pins.sample, pins.bit(MISO), pins.bit(MOSI));
        }

        Ok(cursor.into_results())
    }
}
