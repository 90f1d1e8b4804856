//! Audio frame plumbing
//!
//! The wire carries Opus packets: 16 kHz, mono, 60 ms per frame (960 samples).
//! This module decodes inbound frames to PCM for the VAD, re-encodes TTS and
//! music output back into the same frame shape, and parses the `.p3` packet
//! container used for pre-encoded audio files.

use anyhow::{bail, Context, Result};
use std::io::Cursor;
use std::path::Path;
use tokio::io::AsyncWriteExt;

/// Wire sample rate in Hz.
pub const SAMPLE_RATE: u32 = 16_000;
/// Nominal duration of one encoded frame.
pub const FRAME_DURATION_MS: u64 = 60;
/// Samples per frame at the wire rate.
pub const FRAME_SAMPLES: usize = 960;
/// Silero evaluation window (32 ms at 16 kHz).
pub const VAD_WINDOW_SAMPLES: usize = 512;

/// Stateful decoder for one session's inbound Opus stream.
pub struct FrameDecoder {
    decoder: opus::Decoder,
}

impl FrameDecoder {
    pub fn new() -> Result<Self> {
        let decoder = opus::Decoder::new(SAMPLE_RATE, opus::Channels::Mono)
            .context("failed to create Opus decoder")?;
        Ok(Self { decoder })
    }

    /// Decode one inbound packet to PCM samples.
    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>> {
        let mut pcm = vec![0i16; FRAME_SAMPLES];
        let decoded = self
            .decoder
            .decode(packet, &mut pcm, false)
            .context("Opus decode failed")?;
        pcm.truncate(decoded);
        Ok(pcm)
    }
}

/// Encode 16 kHz mono PCM into 60 ms Opus frames. The final partial frame is
/// zero-padded to a full frame so the client-side jitter buffer stays aligned.
pub fn pcm_to_opus_frames(samples: &[i16]) -> Result<Vec<Vec<u8>>> {
    let mut encoder =
        opus::Encoder::new(SAMPLE_RATE, opus::Channels::Mono, opus::Application::Voip)
            .context("failed to create Opus encoder")?;
    let mut frames = Vec::with_capacity(samples.len() / FRAME_SAMPLES + 1);
    for chunk in samples.chunks(FRAME_SAMPLES) {
        let packet = if chunk.len() == FRAME_SAMPLES {
            encoder.encode_vec(chunk, 4000)?
        } else {
            let mut padded = chunk.to_vec();
            padded.resize(FRAME_SAMPLES, 0);
            encoder.encode_vec(&padded, 4000)?
        };
        frames.push(packet);
    }
    Ok(frames)
}

/// Convert PCM samples to WAV bytes in memory (for ASR upload).
pub fn pcm_to_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer =
        hound::WavWriter::new(&mut cursor, spec).context("failed to create WAV writer")?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(cursor.into_inner())
}

/// Parse WAV bytes (as returned by TTS backends) into wire-rate mono PCM.
/// Handles 16-bit int and 32-bit float sources; other rates are resampled
/// with linear interpolation, stereo is downmixed by taking channel 0.
pub fn wav_to_pcm(wav: &[u8]) -> Result<Vec<i16>> {
    let mut reader =
        hound::WavReader::new(Cursor::new(wav)).context("failed to parse WAV data")?;
    let spec = reader.spec();
    let channels = spec.channels as usize;

    let mono: Vec<i16> = match spec.sample_format {
        hound::SampleFormat::Int => match spec.bits_per_sample {
            16 => reader
                .samples::<i16>()
                .step_by(channels)
                .collect::<std::result::Result<_, _>>()?,
            32 => reader
                .samples::<i32>()
                .step_by(channels)
                .map(|s| s.map(|v| (v >> 16) as i16))
                .collect::<std::result::Result<_, _>>()?,
            bits => bail!("unsupported WAV bit depth: {}", bits),
        },
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .step_by(channels)
            .map(|s| s.map(|v| (v * 32767.0).clamp(-32768.0, 32767.0) as i16))
            .collect::<std::result::Result<_, _>>()?,
    };

    if spec.sample_rate == SAMPLE_RATE {
        return Ok(mono);
    }
    Ok(resample_linear(&mono, spec.sample_rate, SAMPLE_RATE))
}

/// WAV bytes straight to wire frames.
pub fn wav_to_opus_frames(wav: &[u8]) -> Result<Vec<Vec<u8>>> {
    pcm_to_opus_frames(&wav_to_pcm(wav)?)
}

fn resample_linear(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if samples.is_empty() {
        return Vec::new();
    }
    let out_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos as usize;
            let frac = pos - idx as f64;
            let a = samples[idx.min(samples.len() - 1)] as f64;
            let b = samples[(idx + 1).min(samples.len() - 1)] as f64;
            (a + (b - a) * frac) as i16
        })
        .collect()
}

/// Read a `.p3` file: a sequence of pre-encoded Opus packets, each prefixed
/// with a 4-byte header (type, reserved, big-endian payload length).
pub fn read_p3_frames(path: &Path) -> Result<Vec<Vec<u8>>> {
    let data = std::fs::read(path)
        .with_context(|| format!("failed to read p3 file {}", path.display()))?;
    let mut frames = Vec::new();
    let mut pos = 0usize;
    while pos + 4 <= data.len() {
        let len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;
        if pos + len > data.len() {
            bail!("truncated p3 packet at offset {}", pos);
        }
        frames.push(data[pos..pos + len].to_vec());
        pos += len;
    }
    Ok(frames)
}

/// Decode an arbitrary media file (mp3 and friends) to wire-rate PCM via an
/// ffmpeg subprocess. WAV and p3 files have native paths and skip this.
pub async fn decode_media_to_pcm(path: &Path) -> Result<Vec<i16>> {
    let mut child = tokio::process::Command::new("ffmpeg")
        .args(["-i"])
        .arg(path)
        .args(["-f", "s16le", "-ar", "16000", "-ac", "1", "-loglevel", "error", "pipe:1"])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .context("failed to spawn ffmpeg")?;

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.shutdown().await;
    }
    let output = child.wait_with_output().await.context("ffmpeg error")?;
    if !output.status.success() {
        bail!("ffmpeg: {}", String::from_utf8_lossy(&output.stderr).trim());
    }
    Ok(output
        .stdout
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect())
}

/// Convert i16 PCM samples to f32 normalized [-1.0, 1.0] for VAD inference.
pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_to_wav_header() {
        let samples = vec![0i16; 16000];
        let wav = pcm_to_wav(&samples, 16000).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(wav.len(), 44 + 32000);
    }

    #[test]
    fn test_wav_roundtrip() {
        let samples: Vec<i16> = (0..4800).map(|i| ((i % 100) * 300) as i16).collect();
        let wav = pcm_to_wav(&samples, 16000).unwrap();
        let back = wav_to_pcm(&wav).unwrap();
        assert_eq!(back, samples);
    }

    #[test]
    fn test_resample_halves_length() {
        let samples = vec![100i16; 32000];
        let out = resample_linear(&samples, 32000, 16000);
        assert_eq!(out.len(), 16000);
        assert_eq!(out[0], 100);
    }

    #[test]
    fn test_opus_frame_roundtrip() {
        // Two full frames plus a partial one.
        let samples = vec![0i16; FRAME_SAMPLES * 2 + 100];
        let frames = pcm_to_opus_frames(&samples).unwrap();
        assert_eq!(frames.len(), 3);

        let mut decoder = FrameDecoder::new().unwrap();
        let pcm = decoder.decode(&frames[0]).unwrap();
        assert_eq!(pcm.len(), FRAME_SAMPLES);
    }

    #[test]
    fn test_read_p3_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.p3");
        let mut data = Vec::new();
        for payload in [&b"abc"[..], &b"defgh"[..]] {
            data.extend_from_slice(&[0, 0]);
            data.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            data.extend_from_slice(payload);
        }
        std::fs::write(&path, &data).unwrap();

        let frames = read_p3_frames(&path).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], b"abc");
        assert_eq!(frames[1], b"defgh");
    }
}
