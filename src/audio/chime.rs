//! Two-tone alert chime played before every queued message.
//!
//! A G4 tone decays into a lower D4 tone ("ding-dong"), peak-normalized to
//! -3 dBFS and followed by a short silence so the player never clips the tail.
//! The result is a mono 16-bit PCM WAV at 48 kHz.

use byteorder::{LittleEndian, WriteBytesExt};
use std::f64::consts::PI;
use std::io::{self, Write};
use std::path::Path;

pub const SAMPLE_RATE: u32 = 48_000;

const TONE_SECONDS: f64 = 1.0;
const TAIL_SILENCE_SECONDS: f64 = 0.1;
const PEAK_DBFS: f64 = -3.0;

const HIGH_HZ: f64 = 392.0;
const LOW_HZ: f64 = 294.0;
const LOW_ONSET: f64 = 0.4;
const FADE_SECONDS: f64 = 0.15;

/// Raw float samples of the chime before quantization, silence tail included.
pub fn synthesize() -> Vec<f64> {
    let tone_len = (f64::from(SAMPLE_RATE) * TONE_SECONDS) as usize;
    let tail_len = (f64::from(SAMPLE_RATE) * TAIL_SILENCE_SECONDS) as usize;

    let mut samples: Vec<f64> = (0..tone_len)
        .map(|n| sample_at(n as f64 / f64::from(SAMPLE_RATE)))
        .collect();

    let peak = samples.iter().fold(0.0_f64, |acc, s| acc.max(s.abs()));
    if peak > 0.0 {
        let scale = 10f64.powf(PEAK_DBFS / 20.0) / peak;
        for sample in &mut samples {
            *sample = (*sample * scale).clamp(-1.0, 1.0);
        }
    }

    samples.resize(tone_len + tail_len, 0.0);
    samples
}

fn sample_at(t: f64) -> f64 {
    let mut value = 0.0;

    if t < LOW_ONSET + FADE_SECONDS {
        let attack = 1.0 - (-20.0 * t).exp();
        let decay = (-3.0 * t).exp();
        value += attack * decay * fade_out(t, LOW_ONSET) * (2.0 * PI * HIGH_HZ * t).sin();
    }

    if t >= LOW_ONSET {
        let local = t - LOW_ONSET;
        let attack = 1.0 - (-20.0 * local).exp();
        let decay = (-2.5 * local).exp();
        let fade = fade_out(t, TONE_SECONDS - FADE_SECONDS);
        value += attack * decay * fade * (2.0 * PI * LOW_HZ * local).sin();
    }

    value
}

/// Raised-cosine fade from 1 to 0 starting at `start`.
fn fade_out(t: f64, start: f64) -> f64 {
    if t <= start {
        1.0
    } else {
        let progress = ((t - start) / FADE_SECONDS).min(1.0);
        0.5 * (1.0 + (PI * progress).cos())
    }
}

/// Encode the chime as WAV bytes.
pub fn render_wav() -> io::Result<Vec<u8>> {
    let pcm: Vec<i16> = synthesize()
        .into_iter()
        .map(|s| (s * f64::from(i16::MAX)) as i16)
        .collect();
    encode_wav(&pcm, SAMPLE_RATE)
}

/// Write the chime to `path`, replacing any existing file.
pub fn write_chime(path: &Path) -> io::Result<()> {
    let bytes = render_wav()?;
    std::fs::write(path, bytes)
}

fn encode_wav(samples: &[i16], sample_rate: u32) -> io::Result<Vec<u8>> {
    const CHANNELS: u16 = 1;
    const BITS_PER_SAMPLE: u16 = 16;

    let block_align = CHANNELS * BITS_PER_SAMPLE / 8;
    let data_len = u32::try_from(samples.len() * usize::from(block_align))
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "chime too long for WAV"))?;

    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.write_all(b"RIFF")?;
    out.write_u32::<LittleEndian>(36 + data_len)?;
    out.write_all(b"WAVE")?;

    out.write_all(b"fmt ")?;
    out.write_u32::<LittleEndian>(16)?;
    out.write_u16::<LittleEndian>(1)?; // PCM
    out.write_u16::<LittleEndian>(CHANNELS)?;
    out.write_u32::<LittleEndian>(sample_rate)?;
    out.write_u32::<LittleEndian>(sample_rate * u32::from(block_align))?;
    out.write_u16::<LittleEndian>(block_align)?;
    out.write_u16::<LittleEndian>(BITS_PER_SAMPLE)?;

    out.write_all(b"data")?;
    out.write_u32::<LittleEndian>(data_len)?;
    for sample in samples {
        out.write_i16::<LittleEndian>(*sample)?;
    }

    Ok(out)
}
