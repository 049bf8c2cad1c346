//! Signal-domain transforms: volume, resample, codec, reverb.
//!
//! All of them work on the decoded `Samples` representation (converting
//! the buffer in place when needed) and preserve the sample count, so a
//! buffer's duration never drifts under augmentation.

use rand::Rng;
use rubato::{FastFixedIn, PolynomialDegree, Resampler};

use crate::audio::{gain_db_to_ratio, max_dbfs, normalize, AudioKind};
use crate::augment::{Params, ValueRange};
use crate::error::{Result, SdbError};
use crate::samples::LabeledSample;

/// Rescale amplitude so the peak level hits a target dBFS.
#[derive(Debug, Clone)]
pub struct Volume {
    pub probability: f64,
    target_dbfs: ValueRange,
}

impl Volume {
    pub(crate) fn from_params(params: &mut Params) -> Result<Self> {
        Ok(Self {
            probability: params.probability()?,
            target_dbfs: params.range("dbfs", ValueRange::fixed(3.0103))?,
        })
    }

    pub(crate) fn apply<R: Rng>(
        &self,
        sample: &mut LabeledSample,
        clock: f64,
        rng: &mut R,
    ) -> Result<()> {
        let target_dbfs = self.target_dbfs.pick(clock, rng);
        let data = sample.audio.samples_vec()?;
        normalize(data, target_dbfs);
        Ok(())
    }
}

/// Simulate bandwidth loss: downsample to a picked rate, then upsample
/// back, restoring the original sample count.
#[derive(Debug, Clone)]
pub struct Resample {
    pub probability: f64,
    rate: ValueRange,
}

impl Resample {
    pub(crate) fn from_params(params: &mut Params) -> Result<Self> {
        Ok(Self {
            probability: params.probability()?,
            rate: params.range("rate", ValueRange::fixed(8000.0))?,
        })
    }

    pub(crate) fn apply<R: Rng>(
        &self,
        sample: &mut LabeledSample,
        clock: f64,
        rng: &mut R,
    ) -> Result<()> {
        sample.audio.convert(AudioKind::Samples, None)?;
        let rate = sample.audio.format()?.rate;
        let target = self.rate.pick_int(clock, rng).max(1) as u32;
        let data = sample.audio.samples_vec()?;
        let original_len = data.len();

        let down = resample_buffer(data, rate, target)?;
        let mut up = resample_buffer(&down, target, rate)?;
        // The round-trip can be off by an interpolation tail; pin the
        // length so duration stays exact.
        up.resize(original_len, 0.0);
        *data = up;
        Ok(())
    }
}

/// Run one buffer through a `rubato` session at a fixed ratio.
fn resample_buffer(input: &[f32], from: u32, to: u32) -> Result<Vec<f32>> {
    if from == to || input.is_empty() {
        return Ok(input.to_vec());
    }
    const CHUNK: usize = 1024;
    let ratio = to as f64 / from as f64;
    let mut resampler = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, CHUNK, 1)
        .map_err(|e| SdbError::Codec(format!("resampler init: {e}")))?;
    let mut output_buf = vec![vec![0f32; resampler.output_frames_max()]; 1];

    let expected = (input.len() as f64 * ratio).round() as usize;
    let mut out = Vec::with_capacity(expected + CHUNK);
    let mut fed = 0;
    let mut flush_blocks = 0;
    while out.len() < expected {
        let end = (fed + CHUNK).min(input.len());
        let mut block = vec![0f32; CHUNK];
        block[..end - fed].copy_from_slice(&input[fed..end]);
        if fed == end {
            // Input exhausted: flush with silence until the interpolator
            // has produced the expected tail.
            flush_blocks += 1;
            if flush_blocks > 64 {
                break;
            }
        }
        let (_consumed, produced) = resampler
            .process_into_buffer(&[&block[..]], &mut output_buf, None)
            .map_err(|e| SdbError::Codec(format!("resampler process: {e}")))?;
        out.extend_from_slice(&output_buf[0][..produced]);
        fed = end;
    }
    out.truncate(expected);
    Ok(out)
}

/// Inject lossy-compression artifacts by forcing a re-encode at a picked
/// bitrate. The buffer is left in the encoded representation; the
/// pipeline's final conversion decodes it again downstream.
#[derive(Debug, Clone)]
pub struct Codec {
    pub probability: f64,
    bitrate: ValueRange,
}

impl Codec {
    pub(crate) fn from_params(params: &mut Params) -> Result<Self> {
        Ok(Self {
            probability: params.probability()?,
            bitrate: params.range("bitrate", ValueRange::fixed(3200.0))?,
        })
    }

    pub(crate) fn apply<R: Rng>(
        &self,
        sample: &mut LabeledSample,
        clock: f64,
        rng: &mut R,
    ) -> Result<()> {
        let bitrate = self.bitrate.pick_int(clock, rng) as i32;
        // Decode first so an already-encoded buffer really gets re-quantized.
        sample.audio.convert(AudioKind::Pcm, None)?;
        sample.audio.convert(AudioKind::Opus, Some(bitrate))?;
        Ok(())
    }
}

/// Delay lengths scale with these primes so the reflection paths stay
/// incommensurate; commensurate delays would pile up into comb-filter
/// resonances.
const DELAY_PRIMES: [u64; 5] = [17, 19, 23, 29, 31];

/// Minimum delay-line length in samples; shorter lines degenerate into a
/// per-sample feedback loop.
const MIN_DELAY_SAMPLES: usize = 16;

/// Synthesize comb-filter reverberation: several delay lines at
/// prime-ratio lengths, each feeding windowed segments back into itself
/// with exponential decay, summed onto the dry signal and renormalized to
/// the original peak level.
#[derive(Debug, Clone)]
pub struct Reverb {
    pub probability: f64,
    delay_ms: ValueRange,
    decay_db: ValueRange,
}

impl Reverb {
    pub(crate) fn from_params(params: &mut Params) -> Result<Self> {
        Ok(Self {
            probability: params.probability()?,
            delay_ms: params.range("delay", ValueRange::fixed(20.0))?,
            decay_db: params.range("decay", ValueRange::fixed(10.0))?,
        })
    }

    pub(crate) fn apply<R: Rng>(
        &self,
        sample: &mut LabeledSample,
        clock: f64,
        rng: &mut R,
    ) -> Result<()> {
        sample.audio.convert(AudioKind::Samples, None)?;
        let rate = sample.audio.format()?.rate;
        let delay_ms = self.delay_ms.pick(clock, rng);
        let decay = gain_db_to_ratio(-self.decay_db.pick(clock, rng));

        let data = sample.audio.samples_vec()?;
        let original_dbfs = max_dbfs(data);
        let audio: Vec<f64> = data.iter().map(|&s| s as f64).collect();
        let mut result = audio.clone();

        for prime in DELAY_PRIMES {
            let mut layer = audio.clone();
            let n_delay = ((delay_ms * (prime as f64 / DELAY_PRIMES[0] as f64) * rate as f64
                / 1000.0)
                .floor() as usize)
                .max(MIN_DELAY_SAMPLES);
            for window in 0..audio.len() / n_delay {
                let w1 = window * n_delay;
                let w2 = w1 + n_delay;
                // The last window can be shorter than the delay line.
                let width = (audio.len() - w2).min(n_delay);
                for k in 0..width {
                    layer[w2 + k] += decay * layer[w1 + k];
                }
            }
            for (r, l) in result.iter_mut().zip(&layer) {
                *r += l;
            }
        }

        let mut wet: Vec<f32> = result.iter().map(|&s| s as f32).collect();
        normalize(&mut wet, original_dbfs);
        *data = wet;
        Ok(())
    }
}
