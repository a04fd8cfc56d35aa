//! Jitter-buffered downlink playback.
//!
//! Two long-lived tasks share a [`StreamingContext`]: the decode loop turns
//! queued frames into samples on the active queue, and the playback loop
//! holds output back until a full pre-roll is buffered, then hands ~1 s
//! slices to a [`PcmSink`]. Both stop on the context's cancellation token.

use crate::audio::StreamDecoder;
use crate::blocking_queue::BlockingQueue;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const FADE_MS: u32 = 20;

/// Where decoded audio ends up. Implementations must not block.
pub trait PcmSink: Send + Sync {
    /// Queue interleaved samples behind whatever is already queued.
    fn play(&self, samples: Vec<f32>);
    /// Discard everything queued but not yet heard.
    fn stop(&self);
}

#[derive(Debug, Clone)]
pub struct StreamingConfig {
    pub sample_rate: u32,
    pub channels: u32,
    pub pre_roll_ms: u32,
    /// Safety factor applied on top of `pre_roll_ms`
    pub pre_roll_factor: u32,
    pub underrun_grace: Duration,
}

impl StreamingConfig {
    /// Samples that must be buffered before playback starts.
    pub fn pre_roll_samples(&self) -> usize {
        let per_channel = self.sample_rate as u64 * self.pre_roll_ms as u64 / 1000;
        (per_channel * self.pre_roll_factor.max(1) as u64 * self.channels.max(1) as u64) as usize
    }

    fn slice_samples(&self) -> usize {
        (self.sample_rate * self.channels.max(1)) as usize
    }

    fn fade_frames(&self) -> usize {
        (self.sample_rate * FADE_MS / 1000) as usize
    }

    fn duration_of(&self, samples: usize) -> Duration {
        let frames = samples as u64 / self.channels.max(1) as u64;
        Duration::from_micros(frames * 1_000_000 / self.sample_rate.max(1) as u64)
    }
}

struct Shared {
    config: StreamingConfig,
    input: BlockingQueue<Bytes>,
    active: BlockingQueue<f32>,
    playing: AtomicBool,
    last_play_time: Mutex<Option<Instant>>,
    /// Held while clearing both queues and while moving decoded audio from
    /// one to the other, so a reset cannot land between the two.
    handoff: Mutex<()>,
    sink: Arc<dyn PcmSink>,
}

impl Shared {
    fn handoff(&self) -> std::sync::MutexGuard<'_, ()> {
        self.handoff.lock().unwrap_or_else(|p| p.into_inner())
    }
}

pub struct StreamingContext {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl StreamingContext {
    /// Spawn the decode and playback loops. Must be called inside a Tokio runtime.
    pub fn start(decoder: Box<dyn StreamDecoder>, sink: Arc<dyn PcmSink>, config: StreamingConfig) -> Self {
        log::info!(
            "Streaming context: rate={}, ch={}, pre_roll={} samples",
            config.sample_rate,
            config.channels,
            config.pre_roll_samples()
        );
        let shared = Arc::new(Shared {
            config,
            input: BlockingQueue::new(),
            active: BlockingQueue::new(),
            playing: AtomicBool::new(false),
            last_play_time: Mutex::new(None),
            handoff: Mutex::new(()),
            sink,
        });
        let cancel = CancellationToken::new();

        let tasks = vec![
            tokio::spawn(decode_loop(shared.clone(), decoder, cancel.clone())),
            tokio::spawn(playback_loop(shared.clone(), cancel.clone())),
        ];

        Self { shared, cancel, tasks }
    }

    /// Queue encoded frames for decoding, in arrival order.
    pub fn push_frames<I: IntoIterator<Item = Bytes>>(&self, frames: I) {
        self.shared.input.enqueue(frames);
    }

    /// Queue already-decoded samples, bypassing the decoder.
    pub fn push_samples(&self, samples: &[f32]) {
        self.shared.active.enqueue(samples.iter().copied());
    }

    pub fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::SeqCst)
    }

    pub fn last_play_time(&self) -> Option<Instant> {
        *self.shared.last_play_time.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Drop all buffered audio; the next utterance waits for a full pre-roll.
    pub fn reset(&self) {
        {
            let _guard = self.shared.handoff();
            self.shared.input.clear();
            self.shared.active.clear();
        }
        self.shared.playing.store(false, Ordering::SeqCst);
        self.shared.sink.stop();
    }

    /// Stop both loops and wait for them to exit.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                log::warn!("Streaming task ended abnormally: {}", e);
            }
        }
        self.shared.playing.store(false, Ordering::SeqCst);
    }
}

impl Drop for StreamingContext {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn decode_loop(shared: Arc<Shared>, mut decoder: Box<dyn StreamDecoder>, cancel: CancellationToken) {
    loop {
        let generation = shared.input.generation();
        let pending = tokio::select! {
            _ = cancel.cancelled() => break,
            frames = shared.input.dequeue_in(generation, 1, None) => frames,
        };

        let mut decoded = Vec::new();
        for frame in pending {
            match decoder.decode(&frame) {
                Ok(pcm) => decoded.extend(pcm),
                Err(e) => log::debug!("Dropping undecodable frame ({} bytes): {}", frame.len(), e),
            }
        }
        if !decoded.is_empty() {
            let _guard = shared.handoff();
            // Frames taken before a reset belong to the interrupted utterance.
            if shared.input.generation() == generation {
                shared.active.enqueue(decoded);
            }
        }
    }
    decoder.destroy();
    log::debug!("Decode loop stopped");
}

async fn playback_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let config = &shared.config;
    let pre_roll = config.pre_roll_samples().max(1);
    let mut queue: Vec<f32> = Vec::new();
    let mut generation = shared.active.generation();
    let mut scheduled_until = Instant::now();

    loop {
        let current = shared.active.generation();
        if current != generation {
            generation = current;
            queue.clear();
        }

        if !shared.playing.load(Ordering::SeqCst) && queue.len() < pre_roll {
            let need = pre_roll - queue.len();
            tokio::select! {
                _ = cancel.cancelled() => break,
                got = shared.active.dequeue_in(generation, need, None) => queue.extend(got),
            }
            if queue.len() < pre_roll {
                continue;
            }
        }
        shared.playing.store(true, Ordering::SeqCst);

        while !queue.is_empty() && shared.active.generation() == generation {
            let take = queue.len().min(config.slice_samples());
            let mut slice: Vec<f32> = queue.drain(..take).collect();
            apply_fade(&mut slice, config.fade_frames(), config.channels.max(1) as usize);

            let now = Instant::now();
            scheduled_until = scheduled_until.max(now) + config.duration_of(slice.len());
            *shared.last_play_time.lock().unwrap_or_else(|p| p.into_inner()) = Some(now);
            shared.sink.play(slice);

            queue.extend(shared.active.try_drain_in(generation));
        }

        // Buffer ran dry: give the network until the scheduled audio runs out
        // plus the grace period before treating it as the end of an utterance.
        let wait = scheduled_until.saturating_duration_since(Instant::now()) + config.underrun_grace;
        let got = tokio::select! {
            _ = cancel.cancelled() => break,
            got = shared.active.dequeue_in(generation, 1, Some(wait)) => got,
        };
        if got.is_empty() {
            log::debug!("Playback buffer drained");
            shared.playing.store(false, Ordering::SeqCst);
        } else {
            queue.extend(got);
        }
    }
    log::debug!("Playback loop stopped");
}

/// Linear fade-in at the head of every slice; fade-out at the tail only when
/// the slice is longer than two fades.
fn apply_fade(slice: &mut [f32], fade_frames: usize, channels: usize) {
    let frames = slice.len() / channels;
    if fade_frames == 0 || frames == 0 {
        return;
    }

    let fade_in = fade_frames.min(frames);
    for frame in 0..fade_in {
        let gain = frame as f32 / fade_frames as f32;
        for s in &mut slice[frame * channels..(frame + 1) * channels] {
            *s *= gain;
        }
    }

    if frames > fade_frames * 2 {
        for i in 0..fade_frames {
            let frame = frames - 1 - i;
            let gain = i as f32 / fade_frames as f32;
            for s in &mut slice[frame * channels..(frame + 1) * channels] {
                *s *= gain;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::stream_decoder::PcmDecoder;
    use crate::error::CodecError;
    use std::sync::atomic::AtomicU64;

    #[derive(Default)]
    struct RecordingSink {
        played: Mutex<Vec<Vec<f32>>>,
        stops: AtomicU64,
    }

    impl RecordingSink {
        fn total_samples(&self) -> usize {
            self.played.lock().unwrap().iter().map(Vec::len).sum()
        }
    }

    impl PcmSink for RecordingSink {
        fn play(&self, samples: Vec<f32>) {
            self.played.lock().unwrap().push(samples);
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Decodes one byte into one sample; 0xFF is treated as corrupt.
    struct ByteDecoder;

    impl StreamDecoder for ByteDecoder {
        fn decode(&mut self, data: &[u8]) -> Result<Vec<f32>, CodecError> {
            if data.contains(&0xFF) {
                return Err(CodecError::ImplausibleFrame(data.len()));
            }
            Ok(data.iter().map(|b| *b as f32 / 100.0).collect())
        }
    }

    fn config(pre_roll_ms: u32) -> StreamingConfig {
        StreamingConfig {
            sample_rate: 16000,
            channels: 1,
            pre_roll_ms,
            pre_roll_factor: 3,
            underrun_grace: Duration::from_millis(500),
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn pre_roll_scales_with_factor() {
        assert_eq!(config(100).pre_roll_samples(), 4800);
        let stereo = StreamingConfig { channels: 2, ..config(100) };
        assert_eq!(stereo.pre_roll_samples(), 9600);
    }

    #[tokio::test]
    async fn playback_waits_for_full_pre_roll() {
        let sink = Arc::new(RecordingSink::default());
        let mut ctx = StreamingContext::start(Box::new(PcmDecoder::new()), sink.clone(), config(100));

        ctx.push_samples(&vec![0.25; 4799]);
        settle().await;
        assert!(!ctx.is_playing());
        assert_eq!(sink.total_samples(), 0);
        assert!(ctx.last_play_time().is_none());

        ctx.push_samples(&[0.25]);
        settle().await;
        assert!(ctx.is_playing());
        assert_eq!(sink.total_samples(), 4800);
        assert!(ctx.last_play_time().is_some());

        ctx.shutdown().await;
        assert!(!ctx.is_playing());
    }

    #[tokio::test]
    async fn corrupt_frame_does_not_stop_decoding() {
        let sink = Arc::new(RecordingSink::default());
        let cfg = StreamingConfig {
            pre_roll_ms: 0,
            ..config(0)
        };
        let mut ctx = StreamingContext::start(Box::new(ByteDecoder), sink.clone(), cfg);

        ctx.push_frames([Bytes::from_static(&[10, 20]), Bytes::from_static(&[0xFF, 1])]);
        settle().await;
        ctx.push_frames([Bytes::from_static(&[30, 40, 50])]);
        settle().await;

        assert_eq!(sink.total_samples(), 5);
        ctx.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn underrun_past_grace_requires_new_pre_roll() {
        let sink = Arc::new(RecordingSink::default());
        let mut ctx = StreamingContext::start(Box::new(PcmDecoder::new()), sink.clone(), config(100));

        ctx.push_samples(&vec![0.1; 4800]);
        settle().await;
        assert!(ctx.is_playing());

        // 4800 samples = 300 ms of audio, then 500 ms grace.
        tokio::time::sleep(Duration::from_millis(900)).await;
        settle().await;
        assert!(!ctx.is_playing());

        ctx.push_samples(&vec![0.1; 100]);
        settle().await;
        assert!(!ctx.is_playing());
        assert_eq!(sink.total_samples(), 4800);

        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn reset_drops_buffered_audio() {
        let sink = Arc::new(RecordingSink::default());
        let mut ctx = StreamingContext::start(Box::new(PcmDecoder::new()), sink.clone(), config(100));

        ctx.push_samples(&vec![0.5; 1000]);
        settle().await;
        ctx.reset();
        assert_eq!(sink.stops.load(Ordering::SeqCst), 1);

        ctx.push_samples(&vec![0.5; 4000]);
        settle().await;
        assert!(!ctx.is_playing());
        assert_eq!(sink.total_samples(), 0);

        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn full_pre_roll_after_reset_starts_playback() {
        let sink = Arc::new(RecordingSink::default());
        let mut ctx = StreamingContext::start(Box::new(PcmDecoder::new()), sink.clone(), config(100));

        // The playback loop is parked waiting for the first pre-roll.
        ctx.push_samples(&vec![0.5; 1000]);
        settle().await;
        ctx.reset();

        ctx.push_samples(&vec![0.25; 4800]);
        settle().await;
        assert!(ctx.is_playing());
        assert_eq!(sink.total_samples(), 4800);
        let played = sink.played.lock().unwrap().concat();
        // Middle of the slice is past the fade-in, so none of the old 0.5 leaked.
        assert_eq!(played[2400], 0.25);

        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn decoded_audio_after_reset_belongs_to_new_utterance() {
        let sink = Arc::new(RecordingSink::default());
        let cfg = StreamingConfig {
            pre_roll_ms: 0,
            ..config(0)
        };
        let mut ctx = StreamingContext::start(Box::new(ByteDecoder), sink.clone(), cfg);

        ctx.push_frames([Bytes::from_static(&[10, 20])]);
        settle().await;
        assert_eq!(sink.total_samples(), 2);

        ctx.reset();
        ctx.push_frames([Bytes::from_static(&[30, 40, 50])]);
        settle().await;

        assert_eq!(sink.total_samples(), 5);
        assert!(ctx.is_playing());
        ctx.shutdown().await;
    }

    #[test]
    fn fade_shapes_slice_edges() {
        let mut long = vec![1.0f32; 1000];
        apply_fade(&mut long, 100, 1);
        assert_eq!(long[0], 0.0);
        assert!(long[50] > 0.4 && long[50] < 0.6);
        assert_eq!(long[500], 1.0);
        assert_eq!(long[999], 0.0);

        // Too short for a fade-out: tail stays at full gain.
        let mut short = vec![1.0f32; 150];
        apply_fade(&mut short, 100, 1);
        assert_eq!(short[0], 0.0);
        assert_eq!(short[149], 1.0);
    }
}
