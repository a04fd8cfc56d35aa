//! ALSA PCM open/negotiate helpers shared by capture and playback.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

/// What the hardware actually agreed to.
#[derive(Debug, Clone, Copy)]
pub struct AlsaParams {
    pub sample_rate: u32,
    pub channels: u32,
    /// Period size in frames
    pub period_size: usize,
}

pub fn open_capture(device: &str, sample_rate: u32, channels: u32) -> Result<(PCM, AlsaParams)> {
    open_pcm(device, Direction::Capture, sample_rate, channels, None)
}

pub fn open_playback(
    device: &str,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> Result<(PCM, AlsaParams)> {
    open_pcm(device, Direction::Playback, sample_rate, channels, period_size)
}

fn open_pcm(
    device: &str,
    direction: Direction,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> Result<(PCM, AlsaParams)> {
    let dir_name = match direction {
        Direction::Capture => "capture",
        Direction::Playback => "playback",
    };
    let pcm = PCM::new(device, direction, false)
        .with_context(|| format!("Failed to open PCM device '{}' for {}", device, dir_name))?;

    {
        let hwp = HwParams::any(&pcm).context("Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(channels)
            .with_context(|| format!("{} device '{}' rejected {} channels", dir_name, device, channels))?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        if let Some(ps) = period_size {
            hwp.set_period_size_near(ps as alsa::pcm::Frames, ValueOr::Nearest)?;
        }
        pcm.hw_params(&hwp)?;
    }

    let params = {
        let hwp = pcm.hw_params_current()?;
        AlsaParams {
            sample_rate: hwp.get_rate()?,
            channels: hwp.get_channels()?,
            period_size: hwp.get_period_size()? as usize,
        }
    };

    if params.sample_rate != sample_rate || params.channels != channels {
        log::warn!(
            "ALSA {} '{}' negotiated {} Hz x{} (asked {} Hz x{})",
            dir_name,
            device,
            params.sample_rate,
            params.channels,
            sample_rate,
            channels
        );
    }
    log::info!(
        "ALSA {}: device={}, rate={}, channels={}, period_size={}",
        dir_name,
        device,
        params.sample_rate,
        params.channels,
        params.period_size,
    );

    Ok((pcm, params))
}
