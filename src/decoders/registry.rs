use super::{
    ChannelData, DecodeError, DecoderInfo, DecoderOptionValue, DecoderResult, I2cDecoder,
    ProtocolDecoder, SpiDecoder, UartDecoder,
};
use crate::capture_models::CaptureSession;
use tracing::debug;

type Constructor = fn() -> Box<dyn ProtocolDecoder>;

fn construct<D: ProtocolDecoder + Default + 'static>() -> Box<dyn ProtocolDecoder> {
    Box::new(D::default())
}

/// Built-in decoders by id
pub struct DecoderRegistry {
    constructors: Vec<(&'static str, Constructor)>,
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self {
            constructors: vec![
                ("i2c", construct::<I2cDecoder> as Constructor),
                ("spi", construct::<SpiDecoder> as Constructor),
                ("uart", construct::<UartDecoder> as Constructor),
            ],
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.constructors.iter().map(|(id, _)| *id)
    }

    /// Metadata of every registered decoder
    pub fn available(&self) -> Vec<DecoderInfo> {
        self.constructors
            .iter()
            .map(|(_, create)| create().info().clone())
            .collect()
    }

    /// A fresh decoder instance
    pub fn create(&self, id: &str) -> Result<Box<dyn ProtocolDecoder>, DecodeError> {
        self.constructors
            .iter()
            .find(|(known, _)| *known == id)
            .map(|(_, create)| create())
            .ok_or_else(|| DecodeError::UnknownDecoder(id.to_string()))
    }

    /// Decode captured channels, binding decoder roles to capture channel
    /// indices with `bindings` (`(role id, channel index)`).
    pub fn decode_session(
        &self,
        id: &str,
        session: &CaptureSession,
        bindings: &[(&str, u8)],
        options: &[DecoderOptionValue],
    ) -> Result<Vec<DecoderResult>, DecodeError> {
        #[cfg(feature = "cpu-profiling")]
        let _span = tracy_client::span!("DecoderRegistry::decode_session");

        let mut decoder = self.create(id)?;
        let mut channels = Vec::with_capacity(bindings.len());
        for &(role, index) in bindings {
            let channel_number = decoder.info().role_index(role).ok_or_else(|| {
                DecodeError::ChannelConfiguration(format!("{} has no channel role '{}'", id, role))
            })?;
            let channel = session.channel(index).ok_or_else(|| {
                DecodeError::ChannelConfiguration(format!(
                    "channel {} is not part of the capture",
                    index
                ))
            })?;
            channels.push(ChannelData {
                channel_number,
                samples: &channel.samples,
            });
        }

        debug!("Decoding {} with {} bound channels", id, channels.len());
        decoder.decode(session.frequency, &channels, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoders::OptionValue;

    #[test]
    fn test_lists_builtin_decoders() {
        let registry = DecoderRegistry::new();
        assert_eq!(registry.ids().collect::<Vec<_>>(), vec!["i2c", "spi", "uart"]);

        let uart = registry
            .available()
            .into_iter()
            .find(|info| info.id == "uart")
            .unwrap();
        assert_eq!(uart.role_index("tx"), Some(1));
        assert_eq!(uart.annotation_index("rx-data"), Some(0));
        assert!(matches!(
            registry.create("can"),
            Err(DecodeError::UnknownDecoder(_))
        ));
    }

    #[test]
    fn test_decode_session_with_bindings() {
        // 0x55 8N1 at 10 samples per bit on channel 3
        let mut bits = vec![1u8, 1, 0];
        bits.extend((0..8).map(|i| (0x55u8 >> i) & 1));
        bits.extend([1, 1, 1]);
        let samples: Vec<u8> = bits.iter().flat_map(|&b| [b; 10]).collect();

        let mut session = CaptureSession::new(96_000, 2, samples.len() as u32 - 2)
            .with_channels(&[3]);
        session.channels[0].samples = samples;

        let registry = DecoderRegistry::new();
        let baud = DecoderOptionValue {
            option_index: 0,
            value: OptionValue::Int(9600),
        };
        let results = registry
            .decode_session("uart", &session, &[("rx", 3)], &[baud])
            .unwrap();
        assert_eq!(results[0].values[0], "0x55");

        assert!(matches!(
            registry.decode_session("uart", &session, &[("rx", 5)], &[]),
            Err(DecodeError::ChannelConfiguration(_))
        ));
        assert!(matches!(
            registry.decode_session("uart", &session, &[("clk", 3)], &[]),
            Err(DecodeError::ChannelConfiguration(_))
        ));
    }
}
