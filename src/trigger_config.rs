use serde::{Deserialize, Serialize};

/// Largest pattern the complex trigger engine can match
pub const MAX_PATTERN_WIDTH: usize = 16;

/// Largest pattern the fast trigger engine can match
pub const MAX_FAST_PATTERN_WIDTH: usize = 5;

/// Edge channel index that selects the external trigger input
pub const EXTERNAL_TRIGGER_CHANNEL: u8 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerType {
    Edge,
    Complex,
    Fast,
    Blast,
}

impl TriggerType {
    pub fn as_byte(&self) -> u8 {
        match self {
            TriggerType::Edge => 0,
            TriggerType::Complex => 1,
            TriggerType::Fast => 2,
            TriggerType::Blast => 3,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(TriggerType::Edge),
            1 => Some(TriggerType::Complex),
            2 => Some(TriggerType::Fast),
            3 => Some(TriggerType::Blast),
            _ => None,
        }
    }

    pub fn is_pattern(&self) -> bool {
        matches!(self, TriggerType::Complex | TriggerType::Fast)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitState {
    High,
    Low,
    DontCare,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TriggerConfigError {
    #[error("Bit index {bit} out of range, must be between 0 and {max}")]
    BitOutOfRange { bit: usize, max: usize },

    #[error("Pattern trigger needs at least one bit that is not DontCare")]
    EmptyPattern,

    #[error("Pattern bits must be contiguous, found DontCare at bit {bit}")]
    NonContiguousPattern { bit: usize },

    #[error("Fast pattern is {width} bits wide (max {max})")]
    FastPatternTooWide { width: usize, max: usize },
}

/// Trigger settings carried by a capture session.
///
/// `channel` is the edge channel for edge/blast triggers and the first
/// channel of the pattern for pattern triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub trigger_type: TriggerType,
    pub channel: u8,
    pub inverted: bool,
    pub pattern: u16,
    pub bit_count: u8,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        EdgeTrigger::on_channel(0).rising_edge()
    }
}

impl TriggerConfig {
    /// Values for the `triggerType`, `trigger` and `triggerValue` request fields
    pub fn request_fields(&self) -> (u8, u8, u16) {
        match self.trigger_type {
            TriggerType::Edge | TriggerType::Blast => (
                self.trigger_type.as_byte(),
                self.channel,
                u16::from(self.inverted),
            ),
            TriggerType::Complex | TriggerType::Fast => {
                (self.trigger_type.as_byte(), self.channel, self.pattern)
            }
        }
    }

    /// Highest channel index the trigger looks at
    pub fn highest_channel(&self) -> u8 {
        if self.trigger_type.is_pattern() {
            self.channel.saturating_add(self.bit_count.saturating_sub(1))
        } else {
            self.channel
        }
    }

    /// Whether the trigger waits on the external trigger input
    pub fn is_external(&self) -> bool {
        !self.trigger_type.is_pattern() && self.channel == EXTERNAL_TRIGGER_CHANNEL
    }
}

#[derive(Debug)]
pub struct EdgeTriggerBuilder {
    channel: u8,
    blast: bool,
}

impl EdgeTriggerBuilder {
    /// Capture at the maximum blast rate without pre-trigger history
    pub fn blast(mut self) -> Self {
        self.blast = true;
        self
    }

    pub fn rising_edge(self) -> TriggerConfig {
        self.into_trigger(false)
    }

    pub fn falling_edge(self) -> TriggerConfig {
        self.into_trigger(true)
    }

    fn into_trigger(self, inverted: bool) -> TriggerConfig {
        TriggerConfig {
            trigger_type: if self.blast {
                TriggerType::Blast
            } else {
                TriggerType::Edge
            },
            channel: self.channel,
            inverted,
            pattern: 0,
            bit_count: 1,
        }
    }
}

pub struct EdgeTrigger;

impl EdgeTrigger {
    pub fn on_channel(channel: u8) -> EdgeTriggerBuilder {
        EdgeTriggerBuilder {
            channel,
            blast: false,
        }
    }
}

#[derive(Debug)]
pub struct BitTriggerBuilder {
    bit_states: [BitState; MAX_PATTERN_WIDTH],
    out_of_range: Option<usize>,
}

impl BitTriggerBuilder {
    pub fn new() -> Self {
        Self {
            bit_states: [BitState::DontCare; MAX_PATTERN_WIDTH],
            out_of_range: None,
        }
    }

    pub fn set_bit(mut self, bit: usize, state: BitState) -> Self {
        match self.bit_states.get_mut(bit) {
            Some(slot) => *slot = state,
            None => self.out_of_range = Some(bit),
        }
        self
    }

    pub fn bit0(self, state: BitState) -> Self {
        self.set_bit(0, state)
    }

    pub fn bit1(self, state: BitState) -> Self {
        self.set_bit(1, state)
    }

    pub fn bit2(self, state: BitState) -> Self {
        self.set_bit(2, state)
    }

    pub fn bit3(self, state: BitState) -> Self {
        self.set_bit(3, state)
    }

    /// Trigger when the channels match the pattern
    pub fn matches(self) -> Result<TriggerConfig, TriggerConfigError> {
        self.into_trigger(TriggerType::Complex)
    }

    /// Same as `matches`, using the low-latency engine limited to 5 bits
    pub fn matches_fast(self) -> Result<TriggerConfig, TriggerConfigError> {
        self.into_trigger(TriggerType::Fast)
    }

    fn into_trigger(self, trigger_type: TriggerType) -> Result<TriggerConfig, TriggerConfigError> {
        if let Some(bit) = self.out_of_range {
            return Err(TriggerConfigError::BitOutOfRange {
                bit,
                max: MAX_PATTERN_WIDTH - 1,
            });
        }

        let relevant: Vec<usize> = self
            .bit_states
            .iter()
            .enumerate()
            .filter(|(_, state)| **state != BitState::DontCare)
            .map(|(i, _)| i)
            .collect();

        let (first, last) = match (relevant.first(), relevant.last()) {
            (Some(&first), Some(&last)) => (first, last),
            _ => return Err(TriggerConfigError::EmptyPattern),
        };

        if let Some(bit) = (first..=last).find(|&i| self.bit_states[i] == BitState::DontCare) {
            return Err(TriggerConfigError::NonContiguousPattern { bit });
        }

        let width = last - first + 1;
        if trigger_type == TriggerType::Fast && width > MAX_FAST_PATTERN_WIDTH {
            return Err(TriggerConfigError::FastPatternTooWide {
                width,
                max: MAX_FAST_PATTERN_WIDTH,
            });
        }

        let mut pattern = 0u16;
        for (offset, state) in self.bit_states[first..=last].iter().enumerate() {
            if *state == BitState::High {
                pattern |= 1 << offset;
            }
        }

        Ok(TriggerConfig {
            trigger_type,
            channel: first as u8,
            inverted: false,
            pattern,
            bit_count: width as u8,
        })
    }
}

impl Default for BitTriggerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PatternTrigger;

impl PatternTrigger {
    pub fn start_capturing_when() -> BitTriggerBuilder {
        BitTriggerBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_trigger_fields() {
        let trigger = EdgeTrigger::on_channel(5).falling_edge();
        assert_eq!(trigger.request_fields(), (0, 5, 1));

        let blast = EdgeTrigger::on_channel(2).blast().rising_edge();
        assert_eq!(blast.trigger_type, TriggerType::Blast);
        assert_eq!(blast.request_fields(), (3, 2, 0));
    }

    #[test]
    fn test_pattern_trigger_offsets_to_first_bit() {
        let trigger = PatternTrigger::start_capturing_when()
            .bit1(BitState::High)
            .bit2(BitState::Low)
            .bit3(BitState::High)
            .matches()
            .unwrap();

        assert_eq!(trigger.channel, 1);
        assert_eq!(trigger.bit_count, 3);
        assert_eq!(trigger.pattern, 0b101);
        assert_eq!(trigger.highest_channel(), 3);
        assert_eq!(trigger.request_fields(), (1, 1, 0b101));
    }

    #[test]
    fn test_pattern_trigger_rejects_gaps() {
        let result = PatternTrigger::start_capturing_when()
            .bit0(BitState::High)
            .bit2(BitState::High)
            .matches();
        assert_eq!(result, Err(TriggerConfigError::NonContiguousPattern { bit: 1 }));
    }

    #[test]
    fn test_pattern_trigger_rejects_empty_and_out_of_range() {
        assert_eq!(
            PatternTrigger::start_capturing_when().matches(),
            Err(TriggerConfigError::EmptyPattern)
        );
        assert_eq!(
            PatternTrigger::start_capturing_when()
                .set_bit(16, BitState::High)
                .matches(),
            Err(TriggerConfigError::BitOutOfRange { bit: 16, max: 15 })
        );
    }

    #[test]
    fn test_fast_pattern_width_limit() {
        let builder = (0..6).fold(PatternTrigger::start_capturing_when(), |b, i| {
            b.set_bit(i, BitState::Low)
        });
        assert_eq!(
            builder.matches_fast(),
            Err(TriggerConfigError::FastPatternTooWide { width: 6, max: 5 })
        );
    }
}
