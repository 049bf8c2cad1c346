//! WAV container read/write on in-memory byte buffers.
//!
//! Only integer PCM payloads are handled: 16-bit and 32-bit. The sample
//! format travels in the container header, so no [`AudioFormat`] needs to
//! accompany WAV images.

use std::io::Cursor;

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::audio::AudioFormat;
use crate::error::{Result, SdbError};

fn spec_to_format(spec: WavSpec) -> AudioFormat {
    AudioFormat {
        rate: spec.sample_rate,
        channels: spec.channels,
        width: spec.bits_per_sample / 8,
    }
}

/// Read the sample format from a WAV image without touching the payload.
pub fn probe_format(data: &[u8]) -> Result<AudioFormat> {
    let reader = WavReader::new(Cursor::new(data))?;
    Ok(spec_to_format(reader.spec()))
}

/// Read the duration in seconds from a WAV image without decoding samples.
pub fn probe_duration(data: &[u8]) -> Result<f64> {
    let reader = WavReader::new(Cursor::new(data))?;
    let spec = reader.spec();
    Ok(reader.duration() as f64 / spec.sample_rate as f64)
}

/// Decode a WAV image into raw little-endian PCM bytes plus its format.
pub fn decode(data: &[u8]) -> Result<(Vec<u8>, AudioFormat)> {
    let mut reader = WavReader::new(Cursor::new(data))?;
    let spec = reader.spec();
    let format = spec_to_format(spec);
    if spec.sample_format != SampleFormat::Int {
        return Err(SdbError::UnsupportedSampleWidth(format.width));
    }
    let mut pcm = Vec::with_capacity(reader.len() as usize * format.width as usize);
    match format.width {
        2 => {
            for sample in reader.samples::<i16>() {
                pcm.extend_from_slice(&sample?.to_le_bytes());
            }
        }
        4 => {
            for sample in reader.samples::<i32>() {
                pcm.extend_from_slice(&sample?.to_le_bytes());
            }
        }
        w => return Err(SdbError::UnsupportedSampleWidth(w)),
    }
    Ok((pcm, format))
}

/// Encode raw little-endian PCM bytes into a WAV image.
pub fn encode(pcm: &[u8], format: AudioFormat) -> Result<Vec<u8>> {
    let spec = WavSpec {
        channels: format.channels,
        sample_rate: format.rate,
        bits_per_sample: format.width * 8,
        sample_format: SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        match format.width {
            2 => {
                for chunk in pcm.chunks_exact(2) {
                    writer.write_sample(i16::from_le_bytes([chunk[0], chunk[1]]))?;
                }
            }
            4 => {
                for chunk in pcm.chunks_exact(4) {
                    writer.write_sample(i32::from_le_bytes([
                        chunk[0], chunk[1], chunk[2], chunk[3],
                    ]))?;
                }
            }
            w => return Err(SdbError::UnsupportedSampleWidth(w)),
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}
