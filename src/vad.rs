//! Voice activity detection over uplink frames.
//!
//! [`SpeechDetector`] turns per-frame speech probabilities into debounced
//! start/end edges. The probability source is pluggable; the default is the
//! WebRTC VAD, which only answers voiced/unvoiced per 10/20/30 ms window, so
//! a frame's probability is the share of its windows judged voiced.

use crate::audio::f32_to_i16;
use crate::config::VadConfig;
use anyhow::{Result, bail};
use std::collections::VecDeque;
use webrtc_vad::{SampleRate, Vad, VadMode};

pub trait SpeechClassifier: Send {
    /// Probability in [0, 1] that the frame contains speech.
    fn probability(&mut self, frame: &[f32]) -> Result<f32>;
}

pub struct WebRtcClassifier {
    vad: Vad,
    window: usize,
}

// The VAD handle is only ever touched by the task that owns the detector.
unsafe impl Send for WebRtcClassifier {}

impl WebRtcClassifier {
    /// * `sample_rate` - 8000, 16000, 32000 or 48000
    /// * `mode`        - aggressiveness 0-3
    /// * `frame_size`  - samples per frame the detector will be fed
    pub fn new(sample_rate: u32, mode: u8, frame_size: usize) -> Result<Self> {
        let rate = match sample_rate {
            8000 => SampleRate::Rate8kHz,
            16000 => SampleRate::Rate16kHz,
            32000 => SampleRate::Rate32kHz,
            48000 => SampleRate::Rate48kHz,
            other => bail!("WebRTC VAD does not support {} Hz", other),
        };
        let vad_mode = match mode {
            0 => VadMode::Quality,
            1 => VadMode::LowBitrate,
            2 => VadMode::Aggressive,
            _ => VadMode::VeryAggressive,
        };

        // Largest supported window that tiles the frame exactly.
        let window = [30, 20, 10]
            .iter()
            .map(|ms| (sample_rate * ms / 1000) as usize)
            .find(|w| frame_size % w == 0)
            .ok_or_else(|| anyhow::anyhow!("frame of {} samples cannot be split into VAD windows", frame_size))?;

        log::info!("WebRTC VAD ready: rate={}, mode={}, window={} samples", sample_rate, mode, window);
        Ok(Self {
            vad: Vad::new_with_rate_and_mode(rate, vad_mode),
            window,
        })
    }
}

impl SpeechClassifier for WebRtcClassifier {
    fn probability(&mut self, frame: &[f32]) -> Result<f32> {
        let pcm: Vec<i16> = frame.iter().map(|s| f32_to_i16(*s)).collect();
        let mut total = 0usize;
        let mut voiced = 0usize;
        for chunk in pcm.chunks_exact(self.window) {
            total += 1;
            match self.vad.is_voice_segment(chunk) {
                Ok(true) => voiced += 1,
                Ok(false) => {}
                Err(_) => bail!("VAD rejected a {} sample window", chunk.len()),
            }
        }
        if total == 0 {
            bail!("frame shorter than one VAD window ({} < {})", frame.len(), self.window);
        }
        Ok(voiced as f32 / total as f32)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VadEvent {
    /// Speech confirmed. `pre_roll` holds the padding frames seen before the
    /// candidate followed by every candidate frame, oldest first, so the
    /// frame that confirmed speech is last.
    SpeechStart { pre_roll: Vec<Vec<f32>> },
    SpeechEnd,
    /// A candidate never reached the speech threshold and was discarded.
    Misfire,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Silence,
    Candidate { positive: u32, negative: u32 },
    Speech { redemption: u32 },
}

pub struct SpeechDetector {
    classifier: Box<dyn SpeechClassifier>,
    config: VadConfig,
    state: State,
    padding: VecDeque<Vec<f32>>,
    candidate: Vec<Vec<f32>>,
}

impl SpeechDetector {
    pub fn new(classifier: Box<dyn SpeechClassifier>, config: VadConfig) -> Self {
        Self {
            classifier,
            config,
            state: State::Silence,
            padding: VecDeque::new(),
            candidate: Vec::new(),
        }
    }

    /// True while confirmed speech is in progress.
    pub fn in_speech(&self) -> bool {
        matches!(self.state, State::Speech { .. })
    }

    pub fn reset(&mut self) {
        self.state = State::Silence;
        self.padding.clear();
        self.candidate.clear();
    }

    /// Feed one frame; returns an event when the frame crosses an edge.
    pub fn process(&mut self, frame: &[f32]) -> Option<VadEvent> {
        let probability = match self.classifier.probability(frame) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("VAD classification failed, treating frame as silence: {}", e);
                0.0
            }
        };
        let positive = probability >= self.config.positive_threshold;
        let negative = probability < self.config.negative_threshold;

        match self.state {
            State::Silence => {
                if positive {
                    self.candidate.push(frame.to_vec());
                    self.state = State::Candidate { positive: 1, negative: 0 };
                    return self.confirm_if_ready();
                }
                self.remember(frame.to_vec());
                None
            }
            State::Candidate {
                positive: pos,
                negative: neg,
            } => {
                self.candidate.push(frame.to_vec());
                if positive {
                    self.state = State::Candidate {
                        positive: pos + 1,
                        negative: 0,
                    };
                    return self.confirm_if_ready();
                }
                if negative {
                    let neg = neg + 1;
                    if neg >= self.config.min_silence_frames {
                        log::debug!("VAD misfire after {} speech frames", pos);
                        for f in std::mem::take(&mut self.candidate) {
                            self.remember(f);
                        }
                        self.state = State::Silence;
                        return Some(VadEvent::Misfire);
                    }
                    self.state = State::Candidate { positive: pos, negative: neg };
                }
                None
            }
            State::Speech { redemption } => {
                if positive {
                    self.state = State::Speech { redemption: 0 };
                } else if negative {
                    let redemption = redemption + 1;
                    if redemption >= self.config.redemption_frames {
                        self.state = State::Silence;
                        return Some(VadEvent::SpeechEnd);
                    }
                    self.state = State::Speech { redemption };
                }
                None
            }
        }
    }

    fn confirm_if_ready(&mut self) -> Option<VadEvent> {
        let State::Candidate { positive, .. } = self.state else {
            return None;
        };
        if positive < self.config.min_speech_frames.max(1) {
            return None;
        }
        let mut pre_roll: Vec<Vec<f32>> = self.padding.drain(..).collect();
        pre_roll.append(&mut self.candidate);
        self.state = State::Speech { redemption: 0 };
        Some(VadEvent::SpeechStart { pre_roll })
    }

    fn remember(&mut self, frame: Vec<f32>) {
        let cap = self.config.pre_speech_pad_frames as usize;
        if cap == 0 {
            return;
        }
        self.padding.push_back(frame);
        while self.padding.len() > cap {
            self.padding.pop_front();
        }
    }
}
