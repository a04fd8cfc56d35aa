//! Safe wrappers around SpeexDSP's preprocessor (denoise/AGC) and resampler.

use anyhow::{Result, bail};
use std::ffi::{c_int, c_void};

#[repr(C)]
pub struct SpeexPreprocessState {
    _private: [u8; 0],
}

#[repr(C)]
pub struct SpeexResamplerState {
    _private: [u8; 0],
}

const SPEEX_PREPROCESS_SET_DENOISE: c_int = 0;
const SPEEX_PREPROCESS_SET_AGC: c_int = 2;
const SPEEX_PREPROCESS_SET_AGC_LEVEL: c_int = 6;
const SPEEX_PREPROCESS_SET_NOISE_SUPPRESS: c_int = 8;

const SPEEX_RESAMPLER_QUALITY_DEFAULT: c_int = 4;
const RESAMPLER_ERR_SUCCESS: c_int = 0;

unsafe extern "C" {
    fn speex_preprocess_state_init(frame_size: c_int, sampling_rate: c_int) -> *mut SpeexPreprocessState;
    fn speex_preprocess_state_destroy(st: *mut SpeexPreprocessState);
    fn speex_preprocess_run(st: *mut SpeexPreprocessState, x: *mut i16) -> c_int;
    fn speex_preprocess_ctl(st: *mut SpeexPreprocessState, request: c_int, ptr: *mut c_void) -> c_int;

    fn speex_resampler_init(
        nb_channels: u32,
        in_rate: u32,
        out_rate: u32,
        quality: c_int,
        err: *mut c_int,
    ) -> *mut SpeexResamplerState;
    fn speex_resampler_destroy(st: *mut SpeexResamplerState);
    fn speex_resampler_process_int(
        st: *mut SpeexResamplerState,
        channel_index: u32,
        in_: *const i16,
        in_len: *mut u32,
        out: *mut i16,
        out_len: *mut u32,
    ) -> c_int;
}

// ======================== Preprocessor (denoise + AGC) ========================

/// One mono channel's denoise + AGC state, sized for a fixed period.
pub struct Preprocessor {
    state: *mut SpeexPreprocessState,
    frame_size: usize,
}

// Owned and driven by the capture thread only.
unsafe impl Send for Preprocessor {}

impl Preprocessor {
    /// Preprocessor for speech capture: denoise at `noise_suppress_db`
    /// (negative, e.g. -25) and AGC toward `agc_level`.
    pub fn for_voice(frame_size: usize, sample_rate: u32, noise_suppress_db: i32, agc_level: f32) -> Result<Self> {
        let state = unsafe { speex_preprocess_state_init(frame_size as c_int, sample_rate as c_int) };
        if state.is_null() {
            bail!("Failed to initialize speex preprocessor");
        }
        let mut pp = Self { state, frame_size };
        let mut on: c_int = 1;
        let mut suppress: c_int = noise_suppress_db;
        let mut level: f32 = agc_level;
        pp.ctl(SPEEX_PREPROCESS_SET_DENOISE, &mut on);
        pp.ctl(SPEEX_PREPROCESS_SET_NOISE_SUPPRESS, &mut suppress);
        pp.ctl(SPEEX_PREPROCESS_SET_AGC, &mut on);
        pp.ctl(SPEEX_PREPROCESS_SET_AGC_LEVEL, &mut level);
        Ok(pp)
    }

    fn ctl<T>(&mut self, request: c_int, value: &mut T) {
        unsafe {
            speex_preprocess_ctl(self.state, request, value as *mut T as *mut c_void);
        }
    }

    /// Process one period in place. Short periods are zero-padded for the
    /// call; only the given samples are written back.
    pub fn process(&mut self, samples: &mut [i16]) {
        if samples.len() >= self.frame_size {
            unsafe {
                speex_preprocess_run(self.state, samples.as_mut_ptr());
            }
            return;
        }
        let mut padded = vec![0i16; self.frame_size];
        padded[..samples.len()].copy_from_slice(samples);
        unsafe {
            speex_preprocess_run(self.state, padded.as_mut_ptr());
        }
        let n = samples.len();
        samples.copy_from_slice(&padded[..n]);
    }
}

impl Drop for Preprocessor {
    fn drop(&mut self) {
        unsafe {
            speex_preprocess_state_destroy(self.state);
        }
    }
}

// ======================== Resampler ========================

/// Mono 16-bit resampler between two fixed rates.
pub struct Resampler {
    state: *mut SpeexResamplerState,
    in_rate: u32,
    out_rate: u32,
}

unsafe impl Send for Resampler {}

impl Resampler {
    pub fn new(in_rate: u32, out_rate: u32) -> Result<Self> {
        let mut err: c_int = 0;
        let state = unsafe { speex_resampler_init(1, in_rate, out_rate, SPEEX_RESAMPLER_QUALITY_DEFAULT, &mut err) };
        if err != RESAMPLER_ERR_SUCCESS || state.is_null() {
            bail!("Failed to initialize speex resampler: err={}", err);
        }
        Ok(Self { state, in_rate, out_rate })
    }

    /// Resample a whole block, returning the produced samples.
    pub fn resample(&mut self, input: &[i16]) -> Result<Vec<i16>> {
        let capacity = input.len() as u64 * self.out_rate as u64 / self.in_rate.max(1) as u64 + 64;
        let mut output = vec![0i16; capacity as usize];
        let mut in_len = input.len() as u32;
        let mut out_len = output.len() as u32;
        let err = unsafe {
            speex_resampler_process_int(
                self.state,
                0,
                input.as_ptr(),
                &mut in_len,
                output.as_mut_ptr(),
                &mut out_len,
            )
        };
        if err != RESAMPLER_ERR_SUCCESS {
            bail!("Speex resampler error: {}", err);
        }
        output.truncate(out_len as usize);
        Ok(output)
    }
}

impl Drop for Resampler {
    fn drop(&mut self) {
        unsafe {
            speex_resampler_destroy(self.state);
        }
    }
}
