//! Playback adapter: a dedicated OS thread writing decoded PCM buffers back
//! to back into an output device.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{Result, anyhow};
use tokio::sync::mpsc;

use super::stream_decoder::StreamDecoder;
use crate::streaming::PcmSink;

/// Samples written per device call, so `stop()` can cut a buffer short.
const WRITE_CHUNK: usize = 960;

/// Blocking sink for mono f32 samples at the stream rate.
pub trait OutputDevice {
    fn write(&mut self, samples: &[f32]) -> Result<()>;
    /// Throw away whatever the device has buffered but not yet played.
    fn drop_pending(&mut self);
}

enum PlayerCommand {
    Pcm { generation: u64, samples: Vec<f32> },
    Flush,
    Close,
}

struct PlayerShared {
    generation: AtomicU64,
    pending: AtomicUsize,
}

pub struct AudioPlayer {
    tx: mpsc::UnboundedSender<PlayerCommand>,
    shared: Arc<PlayerShared>,
    decoder: Mutex<Box<dyn StreamDecoder>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AudioPlayer {
    /// Start the playback thread. `open` runs on that thread, so the device
    /// handle never crosses threads; its failure is returned here.
    pub fn new<F>(open: F, decoder: Box<dyn StreamDecoder>) -> Result<Self>
    where
        F: FnOnce() -> Result<Box<dyn OutputDevice>> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<(), String>>(1);
        let shared = Arc::new(PlayerShared {
            generation: AtomicU64::new(0),
            pending: AtomicUsize::new(0),
        });

        let thread_shared = shared.clone();
        let handle = thread::Builder::new().name("audio-play".into()).spawn(move || {
            let device = match open() {
                Ok(device) => {
                    let _ = ready_tx.send(Ok(()));
                    device
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(format!("{:#}", e)));
                    return;
                }
            };
            play_thread(device, rx, &thread_shared);
        })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(anyhow!("Failed to open playback device: {}", e));
            }
            Err(_) => return Err(anyhow!("Playback thread exited during startup")),
        }

        Ok(Self {
            tx,
            shared,
            decoder: Mutex::new(decoder),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Decode one frame and queue it as its own buffer. Undecodable frames
    /// are dropped.
    pub fn play_frame(&self, frame: &[u8]) {
        let decoded = {
            let mut decoder = self.decoder.lock().unwrap_or_else(|p| p.into_inner());
            decoder.decode(frame)
        };
        match decoded {
            Ok(pcm) if !pcm.is_empty() => self.enqueue_pcm(pcm),
            Ok(_) => {}
            Err(e) => log::warn!("Audio decode error, dropping frame: {}", e),
        }
    }

    pub fn enqueue_pcm(&self, samples: Vec<f32>) {
        let generation = self.shared.generation.load(Ordering::SeqCst);
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(PlayerCommand::Pcm { generation, samples }).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::SeqCst);
            log::warn!("Playback thread gone, dropping buffer");
        }
    }

    /// Cut the in-flight buffer short and discard everything queued.
    pub fn stop(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.send(PlayerCommand::Flush);
    }

    pub fn is_playing(&self) -> bool {
        self.shared.pending.load(Ordering::SeqCst) > 0
    }

    /// Stop playback and end the thread. Safe to call more than once.
    pub fn close(&self) {
        self.stop();
        let _ = self.tx.send(PlayerCommand::Close);
        let handle = self.handle.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("Playback thread panicked");
            }
            self.decoder.lock().unwrap_or_else(|p| p.into_inner()).destroy();
        }
    }
}

impl Drop for AudioPlayer {
    fn drop(&mut self) {
        let _ = self.tx.send(PlayerCommand::Close);
    }
}

impl PcmSink for AudioPlayer {
    fn play(&self, samples: Vec<f32>) {
        self.enqueue_pcm(samples);
    }

    fn stop(&self) {
        AudioPlayer::stop(self);
    }
}

fn play_thread(
    mut device: Box<dyn OutputDevice>,
    mut rx: mpsc::UnboundedReceiver<PlayerCommand>,
    shared: &PlayerShared,
) {
    log::info!("Playback started");

    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            PlayerCommand::Pcm { generation, samples } => {
                for chunk in samples.chunks(WRITE_CHUNK) {
                    if shared.generation.load(Ordering::SeqCst) != generation {
                        break;
                    }
                    if let Err(e) = device.write(chunk) {
                        log::error!("Playback write failed, dropping rest of buffer: {:#}", e);
                        break;
                    }
                }
                shared.pending.fetch_sub(1, Ordering::SeqCst);
            }
            PlayerCommand::Flush => device.drop_pending(),
            PlayerCommand::Close => break,
        }
    }

    log::info!("Playback stopped");
}

/// Build the playback adapter for this build's backend, decoding the
/// configured downlink stream format.
pub fn create_player(config: &crate::config::Config) -> Result<AudioPlayer> {
    let decoder = super::create_decoder(&config.audio.stream_format, config.audio.output_sample_rate, 1)?;
    #[cfg(feature = "alsa-backend")]
    {
        let audio = config.audio.clone();
        AudioPlayer::new(
            move || {
                let output = AlsaOutput::open(
                    &audio.playback_device,
                    audio.output_sample_rate,
                    audio.playback_channels,
                    audio.playback_period_size,
                )?;
                Ok(Box::new(output) as Box<dyn OutputDevice>)
            },
            decoder,
        )
    }
    #[cfg(not(feature = "alsa-backend"))]
    {
        drop(decoder);
        Err(crate::error::AudioError::Unsupported.into())
    }
}

#[cfg(feature = "alsa-backend")]
pub use alsa_output::AlsaOutput;

#[cfg(feature = "alsa-backend")]
mod alsa_output {
    use super::OutputDevice;
    use crate::audio::alsa_device;
    use crate::audio::f32_to_i16;
    use crate::audio::speex::Resampler;
    use alsa::pcm::PCM;
    use anyhow::Result;

    /// ALSA playback at the stream rate, resampled when the hardware
    /// negotiates something else, duplicated across output channels.
    pub struct AlsaOutput {
        pcm: PCM,
        channels: usize,
        resampler: Option<Resampler>,
    }

    impl AlsaOutput {
        pub fn open(device: &str, stream_rate: u32, channels: u32, period_size: usize) -> Result<Self> {
            let period = if period_size > 0 { Some(period_size) } else { None };
            let (pcm, params) = alsa_device::open_playback(device, stream_rate, channels, period)?;

            let resampler = if params.sample_rate != stream_rate {
                log::info!("Resampling playback {} -> {} Hz", stream_rate, params.sample_rate);
                Some(Resampler::new(stream_rate, params.sample_rate)?)
            } else {
                None
            };

            Ok(Self {
                pcm,
                channels: params.channels as usize,
                resampler,
            })
        }
    }

    impl OutputDevice for AlsaOutput {
        fn write(&mut self, samples: &[f32]) -> Result<()> {
            let mono: Vec<i16> = samples.iter().map(|s| f32_to_i16(*s)).collect();
            let mono = match self.resampler.as_mut() {
                Some(resampler) => resampler.resample(&mono)?,
                None => mono,
            };

            let mut interleaved = Vec::with_capacity(mono.len() * self.channels);
            for s in mono {
                interleaved.extend(std::iter::repeat_n(s, self.channels));
            }

            // Short writes and XRUN recovery without losing frames.
            let io = self.pcm.io_i16()?;
            let total_frames = interleaved.len() / self.channels;
            let mut frames_written = 0;
            let mut retry_count = 0u32;
            while frames_written < total_frames {
                let offset = frames_written * self.channels;
                match io.writei(&interleaved[offset..]) {
                    Ok(n) => {
                        frames_written += n;
                        retry_count = 0;
                    }
                    Err(e) => {
                        log::warn!("ALSA XRUN or error: {}, recovering...", e);
                        retry_count += 1;
                        self.pcm.prepare()?;
                        if retry_count >= 3 {
                            log::error!(
                                "Max recovery retries reached, dropping {} unwritten frames",
                                total_frames - frames_written
                            );
                            break;
                        }
                    }
                }
            }
            Ok(())
        }

        fn drop_pending(&mut self) {
            if let Err(e) = self.pcm.drop() {
                log::warn!("ALSA drop failed: {}", e);
            }
            if let Err(e) = self.pcm.prepare() {
                log::warn!("ALSA prepare after drop failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::stream_decoder::PcmDecoder;
    use std::sync::atomic::AtomicBool;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Recorded {
        samples: Mutex<Vec<f32>>,
        drops: AtomicUsize,
        gate_open: AtomicBool,
    }

    /// Records writes; blocks each write until `gate_open` when gated.
    struct FakeOutput {
        log: Arc<Recorded>,
        gated: bool,
    }

    impl OutputDevice for FakeOutput {
        fn write(&mut self, samples: &[f32]) -> Result<()> {
            while self.gated && !self.log.gate_open.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
            self.log.samples.lock().unwrap().extend_from_slice(samples);
            Ok(())
        }

        fn drop_pending(&mut self) {
            self.log.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn player(gated: bool) -> (AudioPlayer, Arc<Recorded>) {
        let log = Arc::new(Recorded::default());
        let dev_log = log.clone();
        let player = AudioPlayer::new(
            move || Ok(Box::new(FakeOutput { log: dev_log, gated }) as Box<dyn OutputDevice>),
            Box::new(PcmDecoder::new()),
        )
        .unwrap();
        (player, log)
    }

    fn wait_until(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn frames_play_back_to_back_in_order() {
        let (player, log) = player(false);
        player.play_frame(&[0x00, 0x40]);
        player.play_frame(&[0x01]); // odd length, dropped
        player.enqueue_pcm(vec![0.25, 0.75]);

        wait_until(|| !player.is_playing());
        let samples = log.samples.lock().unwrap().clone();
        assert_eq!(samples.len(), 3);
        assert!((samples[0] - 0.5).abs() < 1e-3);
        assert_eq!(&samples[1..], &[0.25, 0.75]);
        player.close();
    }

    #[test]
    fn stop_discards_queued_buffers() {
        let (player, log) = player(true);
        player.enqueue_pcm(vec![0.1; WRITE_CHUNK * 4]);
        player.enqueue_pcm(vec![0.2; 10]);
        assert!(player.is_playing());

        player.stop();
        log.gate_open.store(true, Ordering::SeqCst);
        wait_until(|| !player.is_playing());

        // At most the chunk that was already blocked in the device got out.
        let written = log.samples.lock().unwrap().len();
        assert!(written <= WRITE_CHUNK);
        wait_until(|| log.drops.load(Ordering::SeqCst) == 1);
        assert_eq!(log.drops.load(Ordering::SeqCst), 1);
        player.close();
        player.close();
    }

    #[test]
    fn open_failure_is_reported() {
        let result = AudioPlayer::new(|| Err(anyhow!("no such device")), Box::new(PcmDecoder::new()));
        assert!(result.is_err());
    }
}
