//! Capture adapter: microphone to fixed-size mono f32 frames.

use tokio::sync::mpsc;

use crate::error::AudioError;

pub trait AudioCapture: Send {
    /// Begin delivering frames. Fails, leaving the adapter stopped, when the
    /// device cannot be opened.
    fn start(&mut self, frames_tx: mpsc::Sender<Vec<f32>>) -> Result<(), AudioError>;
    /// Release the device. Safe to call when not started.
    fn stop(&mut self);
    fn is_running(&self) -> bool;
}

#[cfg(feature = "alsa-backend")]
pub use alsa_capture::AlsaCapture;

#[cfg(feature = "alsa-backend")]
mod alsa_capture {
    use super::AudioCapture;
    use crate::audio::alsa_device;
    use crate::audio::i16_to_f32;
    use crate::audio::speex::{Preprocessor, Resampler};
    use crate::error::AudioError;
    use anyhow::Result;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread::{self, JoinHandle};
    use tokio::sync::mpsc;

    const NOISE_SUPPRESS_DB: i32 = -25;
    const AGC_LEVEL: f32 = 24000.0;

    /// ALSA capture with per-channel SpeexDSP denoise + AGC, downmixed and
    /// resampled to the codec rate on a dedicated thread.
    pub struct AlsaCapture {
        device: String,
        channels: u32,
        sample_rate: u32,
        frame_size: usize,
        running: Arc<AtomicBool>,
        handle: Option<JoinHandle<()>>,
    }

    impl AlsaCapture {
        /// * `sample_rate` / `frame_size` - codec rate and samples per emitted frame
        pub fn new(device: &str, channels: u32, sample_rate: u32, frame_size: usize) -> Self {
            Self {
                device: device.to_string(),
                channels,
                sample_rate,
                frame_size,
                running: Arc::new(AtomicBool::new(false)),
                handle: None,
            }
        }
    }

    impl AudioCapture for AlsaCapture {
        fn start(&mut self, frames_tx: mpsc::Sender<Vec<f32>>) -> Result<(), AudioError> {
            if self.is_running() {
                return Err(AudioError::AlreadyRunning);
            }
            // Reap a thread that ended on its own (device error, receiver gone).
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }

            let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<(), String>>(1);
            let running = self.running.clone();
            running.store(true, Ordering::SeqCst);
            let params = CaptureParams {
                device: self.device.clone(),
                channels: self.channels,
                sample_rate: self.sample_rate,
                frame_size: self.frame_size,
            };

            let handle = thread::Builder::new().name("audio-record".into()).spawn(move || {
                if let Err(e) = record_thread(&params, frames_tx, &running, ready_tx) {
                    log::error!("Record thread error: {:#}", e);
                }
                running.store(false, Ordering::SeqCst);
            });
            let handle = match handle {
                Ok(handle) => handle,
                Err(e) => {
                    self.running.store(false, Ordering::SeqCst);
                    return Err(AudioError::Io(e));
                }
            };

            match ready_rx.recv() {
                Ok(Ok(())) => {
                    self.handle = Some(handle);
                    Ok(())
                }
                Ok(Err(e)) => {
                    let _ = handle.join();
                    Err(AudioError::Device(e))
                }
                Err(_) => {
                    let _ = handle.join();
                    Err(AudioError::Device("record thread exited during startup".into()))
                }
            }
        }

        fn stop(&mut self) {
            self.running.store(false, Ordering::SeqCst);
            if let Some(handle) = self.handle.take() {
                if handle.join().is_err() {
                    log::error!("Record thread panicked");
                }
            }
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
    }

    impl Drop for AlsaCapture {
        fn drop(&mut self) {
            self.stop();
        }
    }

    struct CaptureParams {
        device: String,
        channels: u32,
        sample_rate: u32,
        frame_size: usize,
    }

    fn record_thread(
        params: &CaptureParams,
        frames_tx: mpsc::Sender<Vec<f32>>,
        running: &AtomicBool,
        ready: std::sync::mpsc::SyncSender<Result<(), String>>,
    ) -> Result<()> {
        // 1. Open ALSA capture device
        let opened = alsa_device::open_capture(&params.device, params.sample_rate, params.channels);
        let (pcm, hw) = match opened {
            Ok(v) => v,
            Err(e) => {
                let _ = ready.send(Err(format!("{:#}", e)));
                return Ok(());
            }
        };
        let actual_rate = hw.sample_rate;
        let actual_channels = hw.channels as usize;
        let period_size = hw.period_size;

        // 2. One Speex preprocessor per channel for independent denoise/AGC
        let mut preprocessors = (0..actual_channels)
            .map(|_| Preprocessor::for_voice(period_size, actual_rate, NOISE_SUPPRESS_DB, AGC_LEVEL))
            .collect::<Result<Vec<_>>>()?;

        // 3. Resample the downmix when the hardware refused the codec rate
        let mut resampler = if actual_rate != params.sample_rate {
            log::info!("Resampling capture {} -> {} Hz", actual_rate, params.sample_rate);
            Some(Resampler::new(actual_rate, params.sample_rate)?)
        } else {
            None
        };

        let mut channel_buffers: Vec<Vec<i16>> = (0..actual_channels).map(|_| vec![0i16; period_size]).collect();
        let mut read_buf = vec![0i16; period_size * actual_channels];
        let mut accum: Vec<f32> = Vec::with_capacity(params.frame_size * 2);

        let io = pcm.io_i16()?;
        let _ = ready.send(Ok(()));

        log::info!(
            "Recording started: rate={}, ch={}, period={}, frame_size={}",
            actual_rate,
            actual_channels,
            period_size,
            params.frame_size,
        );

        while running.load(Ordering::Relaxed) {
            let frames = match io.readi(&mut read_buf) {
                Ok(frames) => frames,
                Err(e) => {
                    log::warn!("ALSA capture error: {}, recovering...", e);
                    pcm.prepare()?;
                    continue;
                }
            };

            // Split interleaved -> per-channel, preprocess each
            for i in 0..frames {
                for ch in 0..actual_channels {
                    channel_buffers[ch][i] = read_buf[i * actual_channels + ch];
                }
            }
            for (pp, buf) in preprocessors.iter_mut().zip(channel_buffers.iter_mut()) {
                pp.process(&mut buf[..frames]);
            }

            // Downmix to mono
            let mono: Vec<i16> = (0..frames)
                .map(|i| {
                    let sum: i32 = channel_buffers.iter().map(|b| b[i] as i32).sum();
                    (sum / actual_channels as i32) as i16
                })
                .collect();

            match resampler.as_mut() {
                Some(r) => accum.extend(r.resample(&mono)?.into_iter().map(i16_to_f32)),
                None => accum.extend(mono.iter().map(|s| i16_to_f32(*s))),
            }

            // Emit complete frames
            while accum.len() >= params.frame_size {
                let frame: Vec<f32> = accum.drain(..params.frame_size).collect();
                if frames_tx.blocking_send(frame).is_err() {
                    log::warn!("Capture receiver dropped, stopping");
                    return Ok(());
                }
            }
        }

        log::info!("Recording stopped");
        Ok(())
    }
}

/// Build the capture adapter for this build's backend.
pub fn create_capture(config: &crate::config::Config) -> Result<Box<dyn AudioCapture>, AudioError> {
    #[cfg(feature = "alsa-backend")]
    {
        Ok(Box::new(AlsaCapture::new(
            &config.audio.capture_device,
            config.audio.capture_channels,
            config.hello.sample_rate,
            config.hello.frame_size(),
        )))
    }
    #[cfg(not(feature = "alsa-backend"))]
    {
        let _ = config;
        Err(AudioError::Unsupported)
    }
}
