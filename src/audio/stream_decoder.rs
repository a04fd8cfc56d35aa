//! Generic stream decoder trait for multi-format downlink audio.

use super::i16_to_f32;
use super::opus_codec::OpusDecoder;
use crate::error::CodecError;

/// A trait for audio stream decoders that convert one downlink payload into
/// normalized f32 PCM at the stream's own rate and channel count.
pub trait StreamDecoder: Send {
    /// Decode one payload. A failure concerns that payload only; the
    /// decoder stays usable for the next one.
    fn decode(&mut self, data: &[u8]) -> Result<Vec<f32>, CodecError>;

    /// Release native resources early. Later calls to `decode` fail.
    fn destroy(&mut self) {}
}

/// Raw 16-bit little-endian PCM passthrough.
pub struct PcmDecoder {
    destroyed: bool,
}

impl PcmDecoder {
    pub fn new() -> Self {
        Self { destroyed: false }
    }
}

impl Default for PcmDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamDecoder for PcmDecoder {
    fn decode(&mut self, data: &[u8]) -> Result<Vec<f32>, CodecError> {
        if self.destroyed {
            return Err(CodecError::Destroyed);
        }
        if data.is_empty() || data.len() % 2 != 0 {
            return Err(CodecError::ImplausibleFrame(data.len()));
        }
        Ok(data
            .chunks_exact(2)
            .map(|b| i16_to_f32(i16::from_le_bytes([b[0], b[1]])))
            .collect())
    }

    fn destroy(&mut self) {
        self.destroyed = true;
    }
}

/// Factory function: create a decoder based on the configured stream format.
pub fn create_decoder(
    stream_format: &str,
    sample_rate: u32,
    channels: u32,
) -> Result<Box<dyn StreamDecoder>, CodecError> {
    match stream_format {
        "opus" => Ok(Box::new(OpusDecoder::new(sample_rate, channels)?)),
        "pcm" => Ok(Box::new(PcmDecoder::new())),
        other => Err(CodecError::UnsupportedFormat(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_decoder_normalizes_samples() {
        let mut decoder = PcmDecoder::new();
        let bytes = [0x00, 0x40, 0x00, 0x80, 0xff, 0x7f];
        let samples = decoder.decode(&bytes).unwrap();
        assert_eq!(samples.len(), 3);
        assert!((samples[0] - 0.5).abs() < 1e-3);
        assert_eq!(samples[1], -1.0);
        assert_eq!(samples[2], 1.0);
    }

    #[test]
    fn pcm_decoder_rejects_odd_payloads() {
        let mut decoder = PcmDecoder::new();
        assert!(matches!(decoder.decode(&[1, 2, 3]), Err(CodecError::ImplausibleFrame(3))));
        assert!(decoder.decode(&[0, 0]).is_ok());
    }

    #[test]
    fn unknown_format_is_rejected() {
        assert!(matches!(
            create_decoder("mp3", 24000, 1),
            Err(CodecError::UnsupportedFormat(_))
        ));
        assert!(create_decoder("opus", 24000, 1).is_ok());
    }
}
