//! Opus encoder/decoder gateway.
//!
//! Each instance is pinned to one sample rate, channel count and (for the
//! encoder) frame size for its whole lifetime; renegotiating means building a
//! new instance. Native state is released by `destroy()` or on drop,
//! whichever comes first.

use super::stream_decoder::StreamDecoder;
use crate::error::CodecError;
use bytes::Bytes;

/// Upper bound for one accepted packet (three maximal Opus frames).
pub const MAX_PACKET_SIZE: usize = 1275 * 3;

/// Longest Opus packet duration in ms (sizes the decode buffer).
const MAX_PACKET_DURATION_MS: u32 = 120;

fn opus_channels(channels: u32) -> opus::Channels {
    if channels == 1 {
        opus::Channels::Mono
    } else {
        opus::Channels::Stereo
    }
}

// ======================== Opus Encoder ========================

pub struct OpusEncoder {
    encoder: Option<opus::Encoder>,
    sample_rate: u32,
    channels: u32,
    duration_ms: u32,
}

impl OpusEncoder {
    /// Create a new Opus encoder.
    ///
    /// * `sample_rate` - Codec sample rate (e.g. 16000)
    /// * `channels`    - Codec channels (1 or 2)
    /// * `duration_ms` - Frame duration in ms (e.g. 60)
    /// * `bitrate`     - Bitrate in bits/s (e.g. 16000)
    pub fn new(sample_rate: u32, channels: u32, duration_ms: u32, bitrate: i32) -> Result<Self, CodecError> {
        let mut encoder = opus::Encoder::new(sample_rate, opus_channels(channels), opus::Application::Voip)?;
        encoder.set_bitrate(opus::Bitrate::Bits(bitrate))?;

        log::info!(
            "Opus encoder ready: rate={}, ch={}, frame={}ms, bitrate={}",
            sample_rate,
            channels,
            duration_ms,
            bitrate
        );

        Ok(Self {
            encoder: Some(encoder),
            sample_rate,
            channels,
            duration_ms,
        })
    }

    /// Number of samples per channel for one frame.
    pub fn frame_size(&self) -> usize {
        (self.sample_rate * self.duration_ms / 1000) as usize
    }

    /// Total number of interleaved samples per frame.
    pub fn frame_samples(&self) -> usize {
        self.frame_size() * self.channels as usize
    }

    /// Encode exactly one frame of interleaved PCM.
    pub fn encode(&mut self, pcm: &[f32]) -> Result<Bytes, CodecError> {
        let expected = self.frame_samples();
        let encoder = self.encoder.as_mut().ok_or(CodecError::Destroyed)?;
        if pcm.len() != expected {
            return Err(CodecError::FrameLength {
                expected,
                actual: pcm.len(),
            });
        }

        let mut opus_buf = vec![0u8; MAX_PACKET_SIZE];
        let encoded_len = encoder.encode_float(pcm, &mut opus_buf)?;
        opus_buf.truncate(encoded_len);
        Ok(Bytes::from(opus_buf))
    }

    pub fn is_destroyed(&self) -> bool {
        self.encoder.is_none()
    }

    pub fn destroy(&mut self) {
        if self.encoder.take().is_some() {
            log::debug!("Opus encoder destroyed");
        }
    }
}

// ======================== Opus Decoder ========================

pub struct OpusDecoder {
    decoder: Option<opus::Decoder>,
    channels: u32,
    max_frame_size: usize,
}

impl OpusDecoder {
    /// * `sample_rate` - Opus stream sample rate (e.g. 24000)
    /// * `channels`    - Opus stream channels (e.g. 1)
    pub fn new(sample_rate: u32, channels: u32) -> Result<Self, CodecError> {
        let decoder = opus::Decoder::new(sample_rate, opus_channels(channels))?;
        Ok(Self {
            decoder: Some(decoder),
            channels,
            max_frame_size: (sample_rate * MAX_PACKET_DURATION_MS / 1000) as usize,
        })
    }

    /// Decode one Opus packet to interleaved f32 PCM.
    pub fn decode(&mut self, opus_data: &[u8]) -> Result<Vec<f32>, CodecError> {
        let decoder = self.decoder.as_mut().ok_or(CodecError::Destroyed)?;
        if opus_data.is_empty() || opus_data.len() > MAX_PACKET_SIZE {
            return Err(CodecError::ImplausibleFrame(opus_data.len()));
        }

        let mut pcm_buf = vec![0f32; self.max_frame_size * self.channels as usize];
        let decoded_per_channel = decoder.decode_float(opus_data, &mut pcm_buf, false)?;
        pcm_buf.truncate(decoded_per_channel * self.channels as usize);
        Ok(pcm_buf)
    }

    pub fn destroy(&mut self) {
        if self.decoder.take().is_some() {
            log::debug!("Opus decoder destroyed");
        }
    }
}

impl StreamDecoder for OpusDecoder {
    fn decode(&mut self, data: &[u8]) -> Result<Vec<f32>, CodecError> {
        OpusDecoder::decode(self, data)
    }

    fn destroy(&mut self) {
        OpusDecoder::destroy(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(len: usize, rate: u32) -> Vec<f32> {
        (0..len)
            .map(|i| (i as f32 * 440.0 * 2.0 * std::f32::consts::PI / rate as f32).sin() * 0.4)
            .collect()
    }

    #[test]
    fn encoded_frame_decodes_to_full_frame() {
        let mut encoder = OpusEncoder::new(16000, 1, 60, 16000).unwrap();
        let mut decoder = OpusDecoder::new(16000, 1).unwrap();
        assert_eq!(encoder.frame_samples(), 960);

        let packet = encoder.encode(&sine(960, 16000)).unwrap();
        assert!(!packet.is_empty());
        assert!(packet.len() <= MAX_PACKET_SIZE);

        let pcm = decoder.decode(&packet).unwrap();
        assert_eq!(pcm.len(), 960);
        assert!(pcm.iter().all(|s| (-1.0..=1.0).contains(s)));
    }

    #[test]
    fn encoder_rejects_wrong_frame_length() {
        let mut encoder = OpusEncoder::new(16000, 1, 60, 16000).unwrap();
        let err = encoder.encode(&[0.0; 100]).unwrap_err();
        assert!(matches!(err, CodecError::FrameLength { expected: 960, actual: 100 }));
    }

    #[test]
    fn decoder_rejects_implausible_sizes() {
        let mut decoder = OpusDecoder::new(24000, 1).unwrap();
        assert!(matches!(decoder.decode(&[]), Err(CodecError::ImplausibleFrame(0))));
        let oversized = vec![0u8; MAX_PACKET_SIZE + 1];
        assert!(matches!(
            decoder.decode(&oversized),
            Err(CodecError::ImplausibleFrame(_))
        ));
    }

    #[test]
    fn destroyed_instances_refuse_work() {
        let mut encoder = OpusEncoder::new(16000, 1, 60, 16000).unwrap();
        encoder.destroy();
        encoder.destroy();
        assert!(encoder.is_destroyed());
        assert!(matches!(encoder.encode(&[0.0; 960]), Err(CodecError::Destroyed)));

        let mut decoder = OpusDecoder::new(16000, 1).unwrap();
        StreamDecoder::destroy(&mut decoder);
        assert!(matches!(decoder.decode(&[0xf8, 0xff, 0xfe]), Err(CodecError::Destroyed)));
    }
}
