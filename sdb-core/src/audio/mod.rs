//! In-memory audio values and representation conversion.
//!
//! ## Representations
//!
//! An [`AudioBuffer`] holds one utterance's audio in exactly one of four
//! representations:
//!
//! - `Wav`: a complete WAV file image (header + PCM payload)
//! - `Opus`: the chunked lossy framing used inside SDB files (see
//!   [`codec`])
//! - `Pcm`: headerless integer PCM bytes plus an explicit [`AudioFormat`]
//! - `Samples`: decoded mono `f32` samples in `[-1, 1]`, the form all
//!   signal transforms operate on
//!
//! Any-to-any conversion routes through `Pcm` as the canonical
//! intermediate. The duration is computed once at construction (from the
//! payload, or from the container header without a full decode) and is
//! never recomputed by conversions.

pub mod codec;
pub mod wav;

use crate::error::{Result, SdbError};

pub const DEFAULT_RATE: u32 = 16_000;
pub const DEFAULT_CHANNELS: u16 = 1;
pub const DEFAULT_WIDTH: u16 = 2;

/// Sample format of raw PCM data; required wherever no container header
/// carries this information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Sample rate in Hz.
    pub rate: u32,
    /// Channel count. Signal transforms only support mono.
    pub channels: u16,
    /// Bytes per sample (1, 2 or 4).
    pub width: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            rate: DEFAULT_RATE,
            channels: DEFAULT_CHANNELS,
            width: DEFAULT_WIDTH,
        }
    }
}

impl AudioFormat {
    /// Bytes occupied by one frame (one sample across all channels).
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * self.width as usize
    }
}

/// Tag for the four audio representations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioKind {
    Wav,
    Opus,
    Pcm,
    Samples,
}

impl AudioKind {
    pub fn label(self) -> &'static str {
        match self {
            AudioKind::Wav => "wav",
            AudioKind::Opus => "opus",
            AudioKind::Pcm => "pcm",
            AudioKind::Samples => "samples",
        }
    }

    /// Whether this representation can be stored in an SDB column.
    pub fn is_serializable(self) -> bool {
        matches!(self, AudioKind::Wav | AudioKind::Opus)
    }

    /// Mime type written into the SDB schema for this representation.
    pub fn mime_type(self) -> Option<&'static str> {
        match self {
            AudioKind::Wav => Some("audio/wav"),
            AudioKind::Opus => Some("audio/x-sdb-opus"),
            _ => None,
        }
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime {
            "audio/wav" => Some(AudioKind::Wav),
            "audio/x-sdb-opus" => Some(AudioKind::Opus),
            _ => None,
        }
    }

    /// Representation for a loadable audio-file extension (without dot).
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "wav" => Some(AudioKind::Wav),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
enum Repr {
    Wav(Vec<u8>),
    Opus(Vec<u8>),
    Pcm(Vec<u8>, AudioFormat),
    Samples(Vec<f32>, AudioFormat),
}

/// One utterance's audio data in a convertible representation.
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    repr: Repr,
    duration: f64,
}

impl AudioBuffer {
    /// Wrap a WAV file image. Duration is read from the header without
    /// decoding the payload.
    pub fn from_wav(data: Vec<u8>) -> Result<Self> {
        let duration = wav::probe_duration(&data)?;
        Ok(Self {
            repr: Repr::Wav(data),
            duration,
        })
    }

    /// Wrap a chunked-Opus image. Duration is read from the framing header
    /// without decoding any frame.
    pub fn from_opus(data: Vec<u8>) -> Result<Self> {
        let duration = codec::probe_duration(&data)?;
        Ok(Self {
            repr: Repr::Opus(data),
            duration,
        })
    }

    /// Wrap headerless PCM bytes.
    pub fn from_pcm(data: Vec<u8>, format: AudioFormat) -> Self {
        let duration = pcm_duration(data.len(), format);
        Self {
            repr: Repr::Pcm(data, format),
            duration,
        }
    }

    /// Wrap decoded float samples.
    pub fn from_samples(data: Vec<f32>, format: AudioFormat) -> Self {
        let duration = data.len() as f64 / format.rate as f64;
        Self {
            repr: Repr::Samples(data, format),
            duration,
        }
    }

    pub fn kind(&self) -> AudioKind {
        match self.repr {
            Repr::Wav(_) => AudioKind::Wav,
            Repr::Opus(_) => AudioKind::Opus,
            Repr::Pcm(..) => AudioKind::Pcm,
            Repr::Samples(..) => AudioKind::Samples,
        }
    }

    /// Audio duration in seconds, fixed at construction.
    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Sample format: stored for `Pcm`/`Samples`, probed from the container
    /// header for encoded representations.
    pub fn format(&self) -> Result<AudioFormat> {
        match &self.repr {
            Repr::Pcm(_, f) | Repr::Samples(_, f) => Ok(*f),
            Repr::Wav(data) => wav::probe_format(data),
            Repr::Opus(data) => codec::probe_format(data).map(|(_, f)| f),
        }
    }

    /// Serialized container bytes, available for `Wav`/`Opus` only.
    pub fn encoded_bytes(&self) -> Option<&[u8]> {
        match &self.repr {
            Repr::Wav(data) | Repr::Opus(data) => Some(data),
            _ => None,
        }
    }

    /// Decoded float samples, available for the `Samples` representation.
    pub fn samples(&self) -> Option<&[f32]> {
        match &self.repr {
            Repr::Samples(data, _) => Some(data),
            _ => None,
        }
    }

    pub fn samples_mut(&mut self) -> Option<&mut Vec<f32>> {
        match &mut self.repr {
            Repr::Samples(data, _) => Some(data),
            _ => None,
        }
    }

    /// Convert to the `Samples` representation and borrow the sample
    /// vector; the working form of every signal transform.
    pub(crate) fn samples_vec(&mut self) -> Result<&mut Vec<f32>> {
        self.convert(AudioKind::Samples, None)?;
        match &mut self.repr {
            Repr::Samples(data, _) => Ok(data),
            _ => unreachable!("convert to samples succeeded"),
        }
    }

    /// In-place conversion to another representation, always routed through
    /// raw PCM. Converting to the current representation is a no-op.
    ///
    /// `bitrate` applies only when the target is the lossy `Opus`
    /// representation.
    pub fn convert(&mut self, target: AudioKind, bitrate: Option<i32>) -> Result<()> {
        if self.kind() == target {
            return Ok(());
        }
        match target {
            AudioKind::Pcm => self.to_pcm(),
            AudioKind::Samples => {
                self.to_pcm()?;
                let (data, format) = match &self.repr {
                    Repr::Pcm(data, format) => (pcm_to_samples(data, *format)?, *format),
                    _ => unreachable!("to_pcm always leaves a Pcm representation"),
                };
                self.repr = Repr::Samples(data, format);
                Ok(())
            }
            AudioKind::Wav => {
                self.to_pcm()?;
                let encoded = match &self.repr {
                    Repr::Pcm(data, format) => wav::encode(data, *format)?,
                    _ => unreachable!("to_pcm always leaves a Pcm representation"),
                };
                self.repr = Repr::Wav(encoded);
                Ok(())
            }
            AudioKind::Opus => {
                self.to_pcm()?;
                let encoded = match &self.repr {
                    Repr::Pcm(data, format) => codec::encode(data, *format, bitrate)?,
                    _ => unreachable!("to_pcm always leaves a Pcm representation"),
                };
                self.repr = Repr::Opus(encoded);
                Ok(())
            }
        }
    }

    fn to_pcm(&mut self) -> Result<()> {
        let (data, format) = match &self.repr {
            Repr::Pcm(..) => return Ok(()),
            Repr::Wav(data) => wav::decode(data)?,
            Repr::Opus(data) => codec::decode(data)?,
            Repr::Samples(data, format) => (samples_to_pcm(data, *format)?, *format),
        };
        self.repr = Repr::Pcm(data, format);
        Ok(())
    }
}

/// Number of (multi-channel) frames held by a PCM byte buffer.
pub fn pcm_num_samples(byte_len: usize, format: AudioFormat) -> usize {
    byte_len / format.frame_bytes()
}

/// Duration in seconds of a PCM byte buffer.
pub fn pcm_duration(byte_len: usize, format: AudioFormat) -> f64 {
    pcm_num_samples(byte_len, format) as f64 / format.rate as f64
}

fn pcm_to_samples(data: &[u8], format: AudioFormat) -> Result<Vec<f32>> {
    if format.channels != 1 {
        return Err(SdbError::UnsupportedChannelCount(format.channels));
    }
    let samples = match format.width {
        1 => data
            .iter()
            .map(|&b| b as i8 as f32 / i8::MAX as f32)
            .collect(),
        2 => data
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]) as f32 / i16::MAX as f32)
            .collect(),
        4 => data
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f32 / i32::MAX as f32)
            .collect(),
        w => return Err(SdbError::UnsupportedSampleWidth(w)),
    };
    Ok(samples)
}

fn samples_to_pcm(data: &[f32], format: AudioFormat) -> Result<Vec<u8>> {
    if format.channels != 1 {
        return Err(SdbError::UnsupportedChannelCount(format.channels));
    }
    let mut out = Vec::with_capacity(data.len() * format.width as usize);
    // Rounding (not truncation) keeps int → float → int round-trips exact.
    match format.width {
        1 => {
            for &s in data {
                out.push(((s.clamp(-1.0, 1.0) * i8::MAX as f32).round() as i8) as u8);
            }
        }
        2 => {
            for &s in data {
                let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        4 => {
            for &s in data {
                let v = (s.clamp(-1.0, 1.0) * i32::MAX as f32).round() as i32;
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        w => return Err(SdbError::UnsupportedSampleWidth(w)),
    }
    Ok(out)
}

// ── Level helpers ────────────────────────────────────────────────────────

/// Convert a linear RMS/peak level to dBFS (full scale = a full-scale
/// square wave, hence the +3.0103 dB offset).
pub fn rms_to_dbfs(rms: f64) -> f64 {
    20.0 * rms.max(1e-16).log10() + 3.0103
}

/// Peak dBFS based on the maximum-energy sample. Safe for normalization
/// without overdrive.
pub fn max_dbfs(samples: &[f32]) -> f64 {
    let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
    rms_to_dbfs(peak as f64)
}

/// Convert a gain in dB to a linear amplitude ratio.
pub fn gain_db_to_ratio(gain_db: f64) -> f64 {
    10.0f64.powf(gain_db / 20.0)
}

/// Rescale so the peak level hits `target_dbfs`, clamping to `[-1, 1]`.
pub fn normalize(samples: &mut [f32], target_dbfs: f64) {
    let gain = gain_db_to_ratio(target_dbfs - max_dbfs(samples)) as f32;
    for s in samples.iter_mut() {
        *s = (*s * gain).clamp(-1.0, 1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn fmt16k() -> AudioFormat {
        AudioFormat::default()
    }

    #[test]
    fn pcm_duration_counts_frames() {
        // 16 kHz mono 16-bit: 32000 bytes = 16000 samples = 1 s
        assert_relative_eq!(pcm_duration(32_000, fmt16k()), 1.0);
        let stereo = AudioFormat {
            channels: 2,
            ..fmt16k()
        };
        assert_relative_eq!(pcm_duration(32_000, stereo), 0.5);
    }

    #[test]
    fn pcm_samples_roundtrip_16bit() {
        let samples = vec![0.0f32, 0.25, -0.25, 0.99, -0.99];
        let pcm = samples_to_pcm(&samples, fmt16k()).unwrap();
        let back = pcm_to_samples(&pcm, fmt16k()).unwrap();
        for (a, b) in samples.iter().zip(&back) {
            assert!((a - b).abs() < 1.0 / i16::MAX as f32, "{a} vs {b}");
        }
    }

    #[test]
    fn integer_pcm_roundtrip_is_byte_exact() {
        let mut pcm = Vec::new();
        for v in [-32767i16, -1234, -1, 0, 1, 3, 1234, 32767] {
            pcm.extend_from_slice(&v.to_le_bytes());
        }
        let samples = pcm_to_samples(&pcm, fmt16k()).unwrap();
        let back = samples_to_pcm(&samples, fmt16k()).unwrap();
        assert_eq!(back, pcm);
    }

    #[test]
    fn pcm_conversion_rejects_stereo() {
        let stereo = AudioFormat {
            channels: 2,
            ..fmt16k()
        };
        let err = pcm_to_samples(&[0, 0, 0, 0], stereo).unwrap_err();
        assert!(matches!(err, SdbError::UnsupportedChannelCount(2)));
    }

    #[test]
    fn pcm_conversion_rejects_odd_width() {
        let odd = AudioFormat {
            width: 3,
            ..fmt16k()
        };
        let err = pcm_to_samples(&[0, 0, 0], odd).unwrap_err();
        assert!(matches!(err, SdbError::UnsupportedSampleWidth(3)));
    }

    #[test]
    fn convert_to_current_kind_is_noop() {
        let mut buf = AudioBuffer::from_samples(vec![0.5; 160], fmt16k());
        let before = buf.samples().unwrap().to_vec();
        buf.convert(AudioKind::Samples, None).unwrap();
        assert_eq!(buf.samples().unwrap(), &before[..]);
    }

    #[test]
    fn duration_survives_lossless_conversions() {
        let samples: Vec<f32> = (0..16_000)
            .map(|i| (i as f32 * 0.01).sin() * 0.5)
            .collect();
        let mut buf = AudioBuffer::from_samples(samples, fmt16k());
        let duration = buf.duration();
        assert_relative_eq!(duration, 1.0);

        for kind in [AudioKind::Pcm, AudioKind::Wav, AudioKind::Pcm, AudioKind::Samples] {
            buf.convert(kind, None).unwrap();
            assert_relative_eq!(buf.duration(), duration);
        }
    }

    #[test]
    fn wav_roundtrip_is_byte_exact() {
        let samples: Vec<f32> = (0..800).map(|i| ((i % 64) as f32 - 32.0) / 64.0).collect();
        let mut buf = AudioBuffer::from_samples(samples, fmt16k());
        buf.convert(AudioKind::Pcm, None).unwrap();
        let pcm = match &buf.repr {
            Repr::Pcm(data, _) => data.clone(),
            _ => unreachable!(),
        };
        buf.convert(AudioKind::Wav, None).unwrap();
        buf.convert(AudioKind::Pcm, None).unwrap();
        let back = match &buf.repr {
            Repr::Pcm(data, _) => data.clone(),
            _ => unreachable!(),
        };
        assert_eq!(pcm, back);
    }

    #[test]
    fn max_dbfs_of_full_scale_square_is_about_3dbfs() {
        let samples: Vec<f32> = (0..256).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        assert_relative_eq!(max_dbfs(&samples), 3.0103, epsilon = 1e-6);
    }

    #[test]
    fn normalize_reaches_target_peak() {
        let mut samples = vec![0.1f32; 100];
        normalize(&mut samples, 0.0);
        let peak = max_dbfs(&samples);
        assert_relative_eq!(peak, 0.0, epsilon = 1e-3);
    }
}
