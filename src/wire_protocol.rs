//! Frame encoding and decoding for the analyzer wire protocol.
//!
//! Frame format:
//! ```text
//! ┌───────────┬──────────────────────────────┬───────────┐
//! │ 0x55 0xAA │ escaped <command> <data ...> │ 0xAA 0x55 │
//! └───────────┴──────────────────────────────┴───────────┘
//! ```
//!
//! Inside the payload every `0xAA`, `0x55` and `0xF0` is sent as `0xF0` followed
//! by the byte XOR `0xF0`, so the markers never appear unescaped between the
//! start and end of a frame.

/// Frame start marker
pub const FRAME_START: [u8; 2] = [0x55, 0xAA];

/// Frame end marker
pub const FRAME_END: [u8; 2] = [0xAA, 0x55];

/// Escape prefix for reserved payload bytes
pub const ESCAPE_BYTE: u8 = 0xF0;

/// Smallest valid decoded payload: the command byte
pub const MIN_PAYLOAD_LEN: usize = 1;

/// Upper bound on an escaped frame body accepted by [`FrameScanner`]
pub const MAX_FRAME_BODY: usize = 1024;

/// Raw byte written outside of framing to abort a running capture
pub const STOP_CAPTURE_BYTE: u8 = 0xFF;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("Truncated escape sequence at end of payload")]
    TruncatedEscape,

    #[error("Invalid escape sequence 0xF0 0x{follow:02X}")]
    InvalidEscape { follow: u8 },

    #[error("Frame does not begin with the 0x55 0xAA start marker")]
    MissingStart,

    #[error("Frame does not end with the 0xAA 0x55 end marker")]
    MissingEnd,

    #[error("Unescaped marker byte 0x{byte:02X} inside payload at offset {offset}")]
    UnescapedMarker { byte: u8, offset: usize },

    #[error("Frame payload too short: {len} bytes (minimum {min})")]
    TooShort { len: usize, min: usize },

    #[error("Invalid data length for command 0x{command:02X}: expected {expected}, got {actual}")]
    InvalidLength {
        command: u8,
        expected: usize,
        actual: usize,
    },

    #[error("Frame body exceeds {max} bytes")]
    Oversized { max: usize },
}

fn is_reserved(byte: u8) -> bool {
    matches!(byte, 0xAA | 0x55 | ESCAPE_BYTE)
}

/// Escape a payload so it can be placed between frame markers.
pub fn escape(payload: &[u8]) -> Vec<u8> {
    let mut escaped = Vec::with_capacity(payload.len() + payload.len() / 8 + 1);
    for &byte in payload {
        if is_reserved(byte) {
            escaped.push(ESCAPE_BYTE);
            escaped.push(byte ^ ESCAPE_BYTE);
        } else {
            escaped.push(byte);
        }
    }
    escaped
}

/// Reverse [`escape`].
pub fn unescape(escaped: &[u8]) -> Result<Vec<u8>, FramingError> {
    let mut payload = Vec::with_capacity(escaped.len());
    let mut bytes = escaped.iter().copied();
    while let Some(byte) = bytes.next() {
        if byte != ESCAPE_BYTE {
            payload.push(byte);
            continue;
        }
        let follow = bytes.next().ok_or(FramingError::TruncatedEscape)?;
        let original = follow ^ ESCAPE_BYTE;
        if !is_reserved(original) {
            return Err(FramingError::InvalidEscape { follow });
        }
        payload.push(original);
    }
    Ok(payload)
}

/// Host to device command identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Identify = 0x00,
    StartCapture = 0x01,
}

impl Command {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Identify),
            0x01 => Some(Self::StartCapture),
            _ => None,
        }
    }
}

/// Binary capture command understood by the analyzer firmware.
///
/// Serialized packed, in field order, multi-byte fields little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureRequest {
    pub trigger_type: u8,
    pub trigger: u8,
    pub trigger_value: u16,
    pub frequency: u32,
    /// Bit `i` set when channel `i` is captured
    pub channels: u32,
    pub pre_trigger_samples: u32,
    pub post_trigger_samples: u32,
    pub loop_count: u8,
    pub measure: u8,
}

impl CaptureRequest {
    pub const SIZE: usize = 22;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = self.trigger_type;
        out[1] = self.trigger;
        out[2..4].copy_from_slice(&self.trigger_value.to_le_bytes());
        out[4..8].copy_from_slice(&self.frequency.to_le_bytes());
        out[8..12].copy_from_slice(&self.channels.to_le_bytes());
        out[12..16].copy_from_slice(&self.pre_trigger_samples.to_le_bytes());
        out[16..20].copy_from_slice(&self.post_trigger_samples.to_le_bytes());
        out[20] = self.loop_count;
        out[21] = self.measure;
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FramingError> {
        let bytes: &[u8; Self::SIZE] =
            bytes
                .try_into()
                .map_err(|_| FramingError::InvalidLength {
                    command: Command::StartCapture as u8,
                    expected: Self::SIZE,
                    actual: bytes.len(),
                })?;

        let u16_at = |i: usize| u16::from_le_bytes([bytes[i], bytes[i + 1]]);
        let u32_at =
            |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);

        Ok(Self {
            trigger_type: bytes[0],
            trigger: bytes[1],
            trigger_value: u16_at(2),
            frequency: u32_at(4),
            channels: u32_at(8),
            pre_trigger_samples: u32_at(12),
            post_trigger_samples: u32_at(16),
            loop_count: bytes[20],
            measure: bytes[21],
        })
    }
}

/// A command ready to be framed and written to the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPacket {
    pub command: u8,
    pub data: Vec<u8>,
}

impl OutputPacket {
    pub fn new(command: Command) -> Self {
        Self {
            command: command as u8,
            data: Vec::new(),
        }
    }

    pub fn capture(request: &CaptureRequest) -> Self {
        Self {
            command: Command::StartCapture as u8,
            data: request.to_bytes().to_vec(),
        }
    }

    /// Escape and frame the packet
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(1 + self.data.len());
        payload.push(self.command);
        payload.extend_from_slice(&self.data);

        let escaped = escape(&payload);
        let mut framed = Vec::with_capacity(escaped.len() + 4);
        framed.extend_from_slice(&FRAME_START);
        framed.extend_from_slice(&escaped);
        framed.extend_from_slice(&FRAME_END);
        framed
    }
}

/// A frame with markers stripped and payload unescaped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    pub command: u8,
    pub data: Vec<u8>,
}

impl ParsedResponse {
    fn from_payload(payload: Vec<u8>) -> Result<Self, FramingError> {
        match payload.split_first() {
            Some((&command, data)) => Ok(Self {
                command,
                data: data.to_vec(),
            }),
            None => Err(FramingError::TooShort {
                len: 0,
                min: MIN_PAYLOAD_LEN,
            }),
        }
    }

    pub fn capture_request(&self) -> Result<CaptureRequest, FramingError> {
        CaptureRequest::from_bytes(&self.data)
    }
}

/// Frame a capture request for the wire
pub fn encode_request(request: &CaptureRequest) -> Vec<u8> {
    OutputPacket::capture(request).to_bytes()
}

/// Parse exactly one complete frame
pub fn decode_response(frame: &[u8]) -> Result<ParsedResponse, FramingError> {
    if !frame.starts_with(&FRAME_START) {
        return Err(FramingError::MissingStart);
    }
    if frame.len() < FRAME_START.len() + FRAME_END.len() || !frame.ends_with(&FRAME_END) {
        return Err(FramingError::MissingEnd);
    }

    let body = &frame[FRAME_START.len()..frame.len() - FRAME_END.len()];
    if let Some(offset) = body.iter().position(|&b| b == 0xAA || b == 0x55) {
        return Err(FramingError::UnescapedMarker {
            byte: body[offset],
            offset,
        });
    }

    ParsedResponse::from_payload(unescape(body)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanState {
    /// Discarding bytes until a start marker
    Idle,
    /// Got 0x55, expecting 0xAA
    StartHigh,
    /// Collecting escaped body bytes
    InFrame,
    /// Got 0xAA inside a frame, expecting 0x55
    EndHigh,
}

/// Incremental frame boundary scanner over a byte stream.
///
/// Malformed frames are reported and the scanner resynchronizes by discarding
/// bytes until the next start marker.
#[derive(Debug, Clone)]
pub struct FrameScanner {
    state: ScanState,
    body: Vec<u8>,
    framing_errors: u64,
}

impl Default for FrameScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameScanner {
    pub fn new() -> Self {
        Self {
            state: ScanState::Idle,
            body: Vec::new(),
            framing_errors: 0,
        }
    }

    pub fn reset(&mut self) {
        self.state = ScanState::Idle;
        self.body.clear();
    }

    /// Number of malformed frames dropped so far
    pub fn framing_errors(&self) -> u64 {
        self.framing_errors
    }

    /// Feed one byte.
    ///
    /// Returns `Ok(Some(_))` when a frame completes, `Ok(None)` when more bytes
    /// are needed, `Err` when the current frame is malformed.
    pub fn feed(&mut self, byte: u8) -> Result<Option<ParsedResponse>, FramingError> {
        match self.state {
            ScanState::Idle => {
                if byte == FRAME_START[0] {
                    self.state = ScanState::StartHigh;
                }
                Ok(None)
            }
            ScanState::StartHigh => {
                self.state = match byte {
                    b if b == FRAME_START[1] => {
                        self.body.clear();
                        ScanState::InFrame
                    }
                    b if b == FRAME_START[0] => ScanState::StartHigh,
                    _ => ScanState::Idle,
                };
                Ok(None)
            }
            ScanState::InFrame => match byte {
                0xAA => {
                    self.state = ScanState::EndHigh;
                    Ok(None)
                }
                0x55 => {
                    // may be the start of the next frame
                    let offset = self.body.len();
                    self.body.clear();
                    self.state = ScanState::StartHigh;
                    self.fail(FramingError::UnescapedMarker { byte, offset })
                }
                _ => {
                    if self.body.len() >= MAX_FRAME_BODY {
                        self.reset();
                        return self.fail(FramingError::Oversized {
                            max: MAX_FRAME_BODY,
                        });
                    }
                    self.body.push(byte);
                    Ok(None)
                }
            },
            ScanState::EndHigh => {
                if byte != FRAME_END[1] {
                    let offset = self.body.len();
                    self.reset();
                    return self.fail(FramingError::UnescapedMarker { byte: 0xAA, offset });
                }
                let body = std::mem::take(&mut self.body);
                self.state = ScanState::Idle;
                match unescape(&body).and_then(ParsedResponse::from_payload) {
                    Ok(frame) => Ok(Some(frame)),
                    Err(e) => self.fail(e),
                }
            }
        }
    }

    /// Feed a chunk of bytes, returning every complete frame.
    ///
    /// Malformed frames are logged and dropped.
    pub fn feed_bytes(&mut self, bytes: &[u8]) -> Vec<ParsedResponse> {
        let mut frames = Vec::new();
        for &byte in bytes {
            match self.feed(byte) {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => {}
                Err(e) => log::warn!("Dropping malformed frame: {}", e),
            }
        }
        frames
    }

    fn fail(&mut self, error: FramingError) -> Result<Option<ParsedResponse>, FramingError> {
        self.framing_errors += 1;
        Err(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_escape_reserved_bytes() {
        assert_eq!(escape(&[0xAA]), vec![0xF0, 0x5A]);
        assert_eq!(escape(&[0x55]), vec![0xF0, 0xA5]);
        assert_eq!(escape(&[0xF0]), vec![0xF0, 0x00]);
        assert_eq!(escape(&[0x01, 0x02]), vec![0x01, 0x02]);
    }

    #[test]
    fn test_unescape_truncated() {
        assert_eq!(unescape(&[0x01, 0xF0]), Err(FramingError::TruncatedEscape));
    }

    #[test]
    fn test_unescape_invalid_follow_byte() {
        assert_eq!(
            unescape(&[0xF0, 0x12]),
            Err(FramingError::InvalidEscape { follow: 0x12 })
        );
    }

    #[test]
    fn test_capture_request_layout() {
        let request = CaptureRequest {
            trigger_type: 1,
            trigger: 2,
            trigger_value: 0x0304,
            frequency: 0x0506_0708,
            channels: 0x090A_0B0C,
            pre_trigger_samples: 0x0D0E_0F10,
            post_trigger_samples: 0x1112_1314,
            loop_count: 0x15,
            measure: 0x16,
        };
        assert_eq!(
            request.to_bytes(),
            [
                0x01, 0x02, 0x04, 0x03, 0x08, 0x07, 0x06, 0x05, 0x0C, 0x0B, 0x0A, 0x09, 0x10,
                0x0F, 0x0E, 0x0D, 0x14, 0x13, 0x12, 0x11, 0x15, 0x16
            ]
        );
    }

    #[test]
    fn test_encode_frames_with_markers() {
        let framed = encode_request(&CaptureRequest::default());
        assert_eq!(&framed[..2], &FRAME_START);
        assert_eq!(&framed[framed.len() - 2..], &FRAME_END);
        assert_eq!(framed[2], Command::StartCapture as u8);
    }

    #[test]
    fn test_decode_boundary_values() {
        let request = CaptureRequest {
            trigger_type: 0xAA,
            trigger: 0x55,
            trigger_value: u16::MAX,
            frequency: u32::MAX,
            channels: 0,
            pre_trigger_samples: u32::MAX,
            post_trigger_samples: 0,
            loop_count: 0xF0,
            measure: 0xFF,
        };
        let parsed = decode_response(&encode_request(&request)).unwrap();
        assert_eq!(parsed.command, Command::StartCapture as u8);
        assert_eq!(parsed.capture_request().unwrap(), request);
    }

    #[test]
    fn test_decode_rejects_empty_payload() {
        assert_eq!(
            decode_response(&[0x55, 0xAA, 0xAA, 0x55]),
            Err(FramingError::TooShort { len: 0, min: 1 })
        );
    }

    #[test]
    fn test_decode_rejects_missing_markers() {
        assert_eq!(decode_response(&[0x00, 0xAA, 0x01, 0xAA, 0x55]), Err(FramingError::MissingStart));
        assert_eq!(decode_response(&[0x55, 0xAA, 0x01]), Err(FramingError::MissingEnd));
    }

    #[test]
    fn test_decode_rejects_truncated_escape() {
        assert_eq!(
            decode_response(&[0x55, 0xAA, 0x01, 0xF0, 0xAA, 0x55]),
            Err(FramingError::TruncatedEscape)
        );
    }

    #[test]
    fn test_capture_request_wrong_length() {
        let parsed = decode_response(&OutputPacket::new(Command::StartCapture).to_bytes()).unwrap();
        assert!(matches!(
            parsed.capture_request(),
            Err(FramingError::InvalidLength { expected: 22, actual: 0, .. })
        ));
    }

    #[test]
    fn test_scanner_resync_after_garbage() {
        let frame = OutputPacket::new(Command::Identify).to_bytes();
        let mut data = vec![0x00, 0xFF, 0x55, 0x12, 0xAA];
        data.extend_from_slice(&frame);

        let mut scanner = FrameScanner::new();
        let frames = scanner.feed_bytes(&data);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].command, Command::Identify as u8);
    }

    #[test]
    fn test_scanner_drops_malformed_frame_and_recovers() {
        let mut data = vec![0x55, 0xAA, 0x01, 0xF0, 0xAA, 0x55];
        data.extend_from_slice(&encode_request(&CaptureRequest::default()));

        let mut scanner = FrameScanner::new();
        let frames = scanner.feed_bytes(&data);
        assert_eq!(frames.len(), 1);
        assert_eq!(scanner.framing_errors(), 1);
        assert_eq!(frames[0].capture_request().unwrap(), CaptureRequest::default());
    }

    #[test]
    fn test_scanner_split_across_chunks() {
        let framed = encode_request(&CaptureRequest {
            frequency: 100_000_000,
            ..Default::default()
        });
        let (first, second) = framed.split_at(7);

        let mut scanner = FrameScanner::new();
        assert!(scanner.feed_bytes(first).is_empty());
        let frames = scanner.feed_bytes(second);
        assert_eq!(frames[0].capture_request().unwrap().frequency, 100_000_000);
    }

    fn arb_request() -> impl Strategy<Value = CaptureRequest> {
        (
            any::<u8>(),
            any::<u8>(),
            any::<u16>(),
            any::<u32>(),
            any::<u32>(),
            any::<u32>(),
            any::<u32>(),
            any::<u8>(),
            any::<u8>(),
        )
            .prop_map(|(tt, t, tv, f, c, pre, post, lc, m)| CaptureRequest {
                trigger_type: tt,
                trigger: t,
                trigger_value: tv,
                frequency: f,
                channels: c,
                pre_trigger_samples: pre,
                post_trigger_samples: post,
                loop_count: lc,
                measure: m,
            })
    }

    proptest! {
        #[test]
        fn prop_unescape_inverts_escape(payload in proptest::collection::vec(any::<u8>(), 0..512)) {
            prop_assert_eq!(unescape(&escape(&payload)).unwrap(), payload);
        }

        #[test]
        fn prop_reserved_bytes_always_escaped(payload in proptest::collection::vec(any::<u8>(), 0..256)) {
            let escaped = escape(&payload);
            let reserved = payload.iter().filter(|&&b| is_reserved(b)).count();
            prop_assert_eq!(escaped.len(), payload.len() + reserved);
            prop_assert!(!escaped.iter().any(|&b| b == 0xAA || b == 0x55));
        }

        #[test]
        fn prop_request_roundtrip(request in arb_request()) {
            let parsed = decode_response(&encode_request(&request)).unwrap();
            prop_assert_eq!(parsed.capture_request().unwrap(), request);
        }
    }
}
