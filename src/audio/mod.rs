//! audio - Audio capture, playback, and codec library
//!
//! ALSA for audio I/O, Opus for encoding/decoding, and SpeexDSP for noise
//! suppression, AGC and resampling. The device-facing parts live behind the
//! `alsa-backend` feature; traits and codecs are always available.

#[cfg(feature = "alsa-backend")]
mod alsa_device;
pub mod opus_codec;
pub mod play;
pub mod record;
#[cfg(feature = "alsa-backend")]
mod speex;
pub mod stream_decoder;

pub use opus_codec::{OpusDecoder, OpusEncoder};
pub use play::{AudioPlayer, OutputDevice, create_player};
pub use record::{AudioCapture, create_capture};
pub use stream_decoder::{StreamDecoder, create_decoder};

/// 16-bit sample to [-1, 1], asymmetric so both extremes map exactly.
pub fn i16_to_f32(sample: i16) -> f32 {
    if sample < 0 {
        sample as f32 / 32768.0
    } else {
        sample as f32 / 32767.0
    }
}

/// [-1, 1] to 16-bit, clamping out-of-range input.
pub fn f32_to_i16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_conversion_hits_both_rails() {
        assert_eq!(i16_to_f32(i16::MIN), -1.0);
        assert_eq!(i16_to_f32(i16::MAX), 1.0);
        assert_eq!(f32_to_i16(-1.0), i16::MIN);
        assert_eq!(f32_to_i16(1.0), i16::MAX);
        assert_eq!(f32_to_i16(3.0), i16::MAX);
        assert_eq!(f32_to_i16(0.0), 0);
    }
}
