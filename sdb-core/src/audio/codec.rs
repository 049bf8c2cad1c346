//! Chunked Opus framing used for audio columns inside SDB files.
//!
//! ## Layout (all integers big-endian, unsigned)
//!
//! ```text
//! u32 pcm_len | u32 rate | u8 channels | u8 width | (u16 chunk_len | chunk)*
//! ```
//!
//! Each chunk holds one independently encoded 60 ms frame. The final
//! partial frame is zero-padded up to the fixed frame size before encoding;
//! a short tail would make the encoder's output depend on the uninitialized
//! remainder of its input window. Decoding truncates back to the declared
//! PCM length, so padding never leaks into the signal.
//!
//! libopus only accepts rates of 8, 12, 16, 24 or 48 kHz and 16-bit
//! samples; other inputs surface as [`SdbError::Codec`] /
//! [`SdbError::UnsupportedSampleWidth`] at encode time.

use crate::audio::{pcm_duration, AudioFormat};
use crate::error::{Result, SdbError};

const PCM_LEN_SIZE: usize = 4;
const RATE_SIZE: usize = 4;
const CHANNELS_SIZE: usize = 1;
const WIDTH_SIZE: usize = 1;
const HEADER_SIZE: usize = PCM_LEN_SIZE + RATE_SIZE + CHANNELS_SIZE + WIDTH_SIZE;
const CHUNK_LEN_SIZE: usize = 2;

/// Frame duration of one encoded chunk.
const FRAME_MS: usize = 60;

/// Recommended maximum packet size for a single libopus frame.
const MAX_PACKET: usize = 4000;

/// Samples per channel in one 60 ms frame at `rate`.
pub fn frame_size(rate: u32) -> usize {
    FRAME_MS * rate as usize / 1000
}

fn channels_arg(channels: u16) -> Result<opus::Channels> {
    match channels {
        1 => Ok(opus::Channels::Mono),
        2 => Ok(opus::Channels::Stereo),
        n => Err(SdbError::UnsupportedChannelCount(n)),
    }
}

/// Read `(declared_pcm_len, format)` from a framing header.
pub fn probe_format(data: &[u8]) -> Result<(usize, AudioFormat)> {
    if data.len() < HEADER_SIZE {
        return Err(SdbError::Corrupt("opus framing header truncated".into()));
    }
    let pcm_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let rate = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    let format = AudioFormat {
        rate,
        channels: data[8] as u16,
        width: data[9] as u16,
    };
    Ok((pcm_len, format))
}

/// Duration in seconds, from the header alone.
pub fn probe_duration(data: &[u8]) -> Result<f64> {
    let (pcm_len, format) = probe_format(data)?;
    Ok(pcm_duration(pcm_len, format))
}

/// Encode raw PCM into the chunked framing at an optional target bitrate.
pub fn encode(pcm: &[u8], format: AudioFormat, bitrate: Option<i32>) -> Result<Vec<u8>> {
    if format.width != 2 {
        return Err(SdbError::UnsupportedSampleWidth(format.width));
    }
    let channels = channels_arg(format.channels)?;
    let mut encoder = opus::Encoder::new(format.rate, channels, opus::Application::Audio)
        .map_err(|e| SdbError::Codec(format!("encoder init: {e}")))?;
    if let Some(bits) = bitrate {
        encoder
            .set_bitrate(opus::Bitrate::Bits(bits))
            .map_err(|e| SdbError::Codec(format!("set bitrate: {e}")))?;
    }

    let frame = frame_size(format.rate);
    let chunk_bytes = frame * format.frame_bytes();

    let mut out = Vec::with_capacity(HEADER_SIZE + pcm.len() / 8);
    out.extend_from_slice(&(pcm.len() as u32).to_be_bytes());
    out.extend_from_slice(&format.rate.to_be_bytes());
    out.push(format.channels as u8);
    out.push(format.width as u8);

    let mut packet = vec![0u8; MAX_PACKET];
    let mut padded = vec![0u8; chunk_bytes];
    for chunk in pcm.chunks(chunk_bytes) {
        let chunk = if chunk.len() == chunk_bytes {
            chunk
        } else {
            padded[..chunk.len()].copy_from_slice(chunk);
            padded[chunk.len()..].fill(0);
            &padded[..]
        };
        let samples: Vec<i16> = chunk
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        let written = encoder
            .encode(&samples, &mut packet)
            .map_err(|e| SdbError::Codec(format!("encode frame: {e}")))?;
        out.extend_from_slice(&(written as u16).to_be_bytes());
        out.extend_from_slice(&packet[..written]);
    }
    Ok(out)
}

/// Decode the chunked framing back into raw PCM bytes plus its format.
pub fn decode(data: &[u8]) -> Result<(Vec<u8>, AudioFormat)> {
    let (pcm_len, format) = probe_format(data)?;
    let channels = channels_arg(format.channels)?;
    let mut decoder = opus::Decoder::new(format.rate, channels)
        .map_err(|e| SdbError::Codec(format!("decoder init: {e}")))?;

    let frame = frame_size(format.rate);
    let mut samples = vec![0i16; frame * format.channels as usize];
    let mut pcm = Vec::with_capacity(pcm_len);
    let mut pos = HEADER_SIZE;
    while pcm.len() < pcm_len {
        if pos + CHUNK_LEN_SIZE > data.len() {
            return Err(SdbError::Corrupt("opus framing ended mid-stream".into()));
        }
        let chunk_len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
        pos += CHUNK_LEN_SIZE;
        if pos + chunk_len > data.len() {
            return Err(SdbError::Corrupt("opus chunk truncated".into()));
        }
        let decoded = decoder
            .decode(&data[pos..pos + chunk_len], &mut samples, false)
            .map_err(|e| SdbError::Codec(format!("decode frame: {e}")))?;
        pos += chunk_len;
        for &s in &samples[..decoded * format.channels as usize] {
            pcm.extend_from_slice(&s.to_le_bytes());
        }
    }
    pcm.truncate(pcm_len);
    Ok((pcm, format))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sine_pcm(seconds: f64, rate: u32) -> Vec<u8> {
        let n = (seconds * rate as f64) as usize;
        let mut pcm = Vec::with_capacity(n * 2);
        for i in 0..n {
            let t = i as f64 / rate as f64;
            let v = ((t * 440.0 * std::f64::consts::TAU).sin() * 0.6 * i16::MAX as f64) as i16;
            pcm.extend_from_slice(&v.to_le_bytes());
        }
        pcm
    }

    #[test]
    fn roundtrip_preserves_declared_length() {
        let format = AudioFormat::default();
        // 1000 samples: not a multiple of the 960-sample frame, so the tail
        // frame is padded on encode and truncated on decode.
        let pcm = sine_pcm(0.0625, format.rate);
        assert_eq!(pcm.len(), 2000);
        let encoded = encode(&pcm, format, None).unwrap();
        let (decoded, decoded_format) = decode(&encoded).unwrap();
        assert_eq!(decoded.len(), pcm.len());
        assert_eq!(decoded_format, format);
    }

    #[test]
    fn duration_is_probed_from_header_without_decoding() {
        let format = AudioFormat::default();
        let encoded = encode(&sine_pcm(0.5, format.rate), format, None).unwrap();
        assert_relative_eq!(probe_duration(&encoded).unwrap(), 0.5);
    }

    #[test]
    fn lossy_roundtrip_keeps_signal_energy() {
        let format = AudioFormat::default();
        let pcm = sine_pcm(0.5, format.rate);
        let encoded = encode(&pcm, format, Some(32_000)).unwrap();
        assert!(encoded.len() < pcm.len() / 4, "opus should compress a sine");
        let (decoded, _) = decode(&encoded).unwrap();
        let energy: f64 = decoded
            .chunks_exact(2)
            .map(|c| (i16::from_le_bytes([c[0], c[1]]) as f64).powi(2))
            .sum();
        assert!(energy > 0.0, "decoded signal is silent");
    }

    #[test]
    fn empty_input_roundtrips() {
        let format = AudioFormat::default();
        let encoded = encode(&[], format, None).unwrap();
        let (decoded, _) = decode(&encoded).unwrap();
        assert!(decoded.is_empty());
        assert_relative_eq!(probe_duration(&encoded).unwrap(), 0.0);
    }

    #[test]
    fn wide_samples_are_rejected() {
        let format = AudioFormat {
            width: 4,
            ..AudioFormat::default()
        };
        let err = encode(&[0u8; 8], format, None).unwrap_err();
        assert!(matches!(err, SdbError::UnsupportedSampleWidth(4)));
    }

    #[test]
    fn truncated_stream_is_corrupt() {
        let format = AudioFormat::default();
        let encoded = encode(&sine_pcm(0.2, format.rate), format, None).unwrap();
        let err = decode(&encoded[..encoded.len() / 2]).unwrap_err();
        assert!(matches!(err, SdbError::Corrupt(_)));
    }
}
