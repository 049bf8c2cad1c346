//! The sample preparation pipeline: bounded parallel augmentation plus
//! conversion to the representation the training consumer wants.
//!
//! ## Per-sample flow (inside one worker)
//!
//! ```text
//! 1. Bernoulli trial per configured transform (spec order)
//! 2. Passing transforms apply in place, parameters resolved at the
//!    sample's clock
//! 3. Convert to the target representation
//! 4. Failures wrap into Augmentation { transform name, sample id }
//! ```
//!
//! Workers never share samples; each owns its clone of the transform
//! chain (overlays share only their noise queue) and a thread-local RNG.
//! Results stream out unordered by default; `ordered` restores submission
//! order behind the same lookahead gate. Dropping the returned stream
//! stops the feeder, joins the workers and tears down any noise feed.

pub mod pool;

use rand::rngs::{StdRng, ThreadRng};
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::audio::AudioKind;
use crate::augment::Augmentation;
use crate::error::{Result, SdbError};
use crate::pipeline::pool::{LimitingPool, PoolConfig};
use crate::samples::LabeledSample;

/// Configuration for [`augment_samples`] / [`convert_samples`].
#[derive(Debug, Clone)]
pub struct AugmentOptions {
    /// Representation handed to the consumer. Default: `Samples`.
    pub target: AudioKind,
    /// Bitrate for a lossy target representation.
    pub bitrate: Option<i32>,
    /// Worker thread count. Default: available parallelism.
    pub workers: usize,
    /// Dispatched-but-unconsumed cap. `None` uses the worker count;
    /// `Some(0)` runs everything inline on the caller's thread.
    pub lookahead: Option<usize>,
    /// Deliver results in submission order instead of completion order.
    pub ordered: bool,
    /// Clock for the first sample (or all samples, without `final_clock`).
    pub clock: f64,
    /// Clock reached by the last sample; linearly ramped in between.
    pub final_clock: Option<f64>,
}

impl Default for AugmentOptions {
    fn default() -> Self {
        Self {
            target: AudioKind::Samples,
            bitrate: None,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            lookahead: None,
            ordered: false,
            clock: 0.0,
            final_clock: None,
        }
    }
}

enum Inner {
    Serial(Box<dyn Iterator<Item = Result<LabeledSample>> + Send>),
    Pooled(LimitingPool<Result<LabeledSample>>),
}

/// Lazy stream of augmented samples; the only interface the training
/// consumer depends on.
pub struct AugmentedSamples {
    inner: Inner,
}

impl Iterator for AugmentedSamples {
    type Item = Result<LabeledSample>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            Inner::Serial(iter) => iter.next(),
            Inner::Pooled(pool) => pool.next(),
        }
    }
}

fn process_sample<R: Rng>(
    chain: &mut [Augmentation],
    rng: &mut R,
    target: AudioKind,
    bitrate: Option<i32>,
    item: Result<LabeledSample>,
    clock: f64,
) -> Result<LabeledSample> {
    let mut sample = item?;
    for augmentation in chain.iter_mut() {
        if rng.gen::<f64>() < augmentation.probability() {
            augmentation
                .apply(&mut sample, clock, rng)
                .map_err(|e| SdbError::Augmentation {
                    name: augmentation.name(),
                    sample_id: sample.sample_id.clone(),
                    source: Box::new(e),
                })?;
        }
    }
    sample.audio.convert(target, bitrate)?;
    Ok(sample)
}

/// Run samples through the configured augmentation chain and convert them
/// to the target representation.
///
/// `total` is the expected sample count, used only to ramp the clock from
/// `clock` to `final_clock`; pass the source's `len()`.
///
/// Transforms apply in specification order, each gated by an independent
/// Bernoulli trial of its probability. A failure inside one transform
/// surfaces as an error item attributed to that sample; siblings in
/// flight are unaffected.
pub fn augment_samples<I>(
    samples: I,
    total: usize,
    mut augmentations: Vec<Augmentation>,
    options: AugmentOptions,
) -> Result<AugmentedSamples>
where
    I: IntoIterator<Item = Result<LabeledSample>>,
    I::IntoIter: Send + 'static,
{
    if !(0.0..=1.0).contains(&options.clock) {
        return Err(SdbError::Other(anyhow::anyhow!(
            "clock {} outside [0, 1]",
            options.clock
        )));
    }
    if let Some(final_clock) = options.final_clock {
        if !(options.clock..=1.0).contains(&final_clock) {
            return Err(SdbError::Other(anyhow::anyhow!(
                "final clock {final_clock} outside [{}, 1]",
                options.clock
            )));
        }
    }

    for augmentation in &mut augmentations {
        augmentation.start(options.workers)?;
    }
    info!(
        transforms = augmentations.len(),
        target = options.target.label(),
        workers = options.workers,
        ordered = options.ordered,
        "augmentation pipeline starting"
    );

    let start_clock = options.clock;
    let clock_step = options
        .final_clock
        .map(|f| (f - start_clock) / total.max(1) as f64)
        .unwrap_or(0.0);
    let timed = samples
        .into_iter()
        .enumerate()
        .map(move |(index, item)| (item, start_clock + clock_step * index as f64));

    let target = options.target;
    let bitrate = options.bitrate;

    if options.lookahead == Some(0) {
        debug!("lookahead 0: applying augmentations inline");
        let mut chain = augmentations;
        // The boxed iterator must stay Send, so no ThreadRng here.
        let mut rng = StdRng::from_entropy();
        let iter = timed
            .map(move |(item, clock)| {
                process_sample(&mut chain, &mut rng, target, bitrate, item, clock)
            });
        return Ok(AugmentedSamples {
            inner: Inner::Serial(Box::new(iter)),
        });
    }

    let config = PoolConfig {
        workers: options.workers,
        lookahead: options.lookahead.unwrap_or(options.workers),
        ordered: options.ordered,
        ..PoolConfig::default()
    };
    let prototype = augmentations;
    let make_worker = move || {
        let mut chain = prototype.clone();
        let mut rng: ThreadRng = rand::thread_rng();
        move |(item, clock): (Result<LabeledSample>, f64)| {
            process_sample(&mut chain, &mut rng, target, bitrate, item, clock)
        }
    };
    let pool = LimitingPool::spawn(timed, make_worker, config);
    Ok(AugmentedSamples {
        inner: Inner::Pooled(pool),
    })
}

/// Bulk representation conversion through the same bounded pool, with no
/// transforms configured. Useful when (re)building containers from
/// existing corpora.
pub fn convert_samples<I>(samples: I, options: AugmentOptions) -> Result<AugmentedSamples>
where
    I: IntoIterator<Item = Result<LabeledSample>>,
    I::IntoIter: Send + 'static,
{
    augment_samples(samples, 0, Vec::new(), options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{max_dbfs, AudioBuffer, AudioFormat};
    use crate::augment::parse_augmentations;
    use approx::assert_relative_eq;

    fn quiet_sample(id: usize, n: usize) -> Result<LabeledSample> {
        let samples: Vec<f32> = (0..n).map(|i| ((i as f32) * 0.3).sin() * 0.1).collect();
        Ok(LabeledSample::new(
            format!("mem:{id}"),
            AudioBuffer::from_samples(samples, AudioFormat::default()),
            Some(format!("transcript {id}")),
        ))
    }

    fn serial_options() -> AugmentOptions {
        AugmentOptions {
            lookahead: Some(0),
            ..AugmentOptions::default()
        }
    }

    #[test]
    fn zero_probability_never_applies() {
        let augs = parse_augmentations(&["volume[dbfs=0,p=0]"]).unwrap();
        let inputs: Vec<_> = (0..10_000).map(|i| quiet_sample(i, 16)).collect();
        let stream = augment_samples(inputs, 10_000, augs, serial_options()).unwrap();
        for item in stream {
            let sample = item.unwrap();
            let peak = max_dbfs(sample.audio.samples().unwrap());
            assert!(peak < -10.0, "volume was applied: peak {peak}");
        }
    }

    #[test]
    fn unit_probability_always_applies() {
        let augs = parse_augmentations(&["volume[dbfs=0,p=1]"]).unwrap();
        let inputs: Vec<_> = (0..10_000).map(|i| quiet_sample(i, 16)).collect();
        let stream = augment_samples(inputs, 10_000, augs, serial_options()).unwrap();
        for item in stream {
            let sample = item.unwrap();
            let peak = max_dbfs(sample.audio.samples().unwrap());
            assert_relative_eq!(peak, 0.0, epsilon = 0.2);
        }
    }

    #[test]
    fn clock_ramps_across_the_run() {
        // Volume target ramps -40 → 0 dBFS with the clock; the first
        // sample sits at clock 0, so its peak lands at -40.
        let augs = parse_augmentations(&["volume[dbfs=-40:0]"]).unwrap();
        let inputs: Vec<_> = (0..4).map(|i| quiet_sample(i, 1000)).collect();
        let options = AugmentOptions {
            final_clock: Some(1.0),
            ..serial_options()
        };
        let peaks: Vec<f64> = augment_samples(inputs, 4, augs, options)
            .unwrap()
            .map(|item| max_dbfs(item.unwrap().audio.samples().unwrap()))
            .collect();
        assert_relative_eq!(peaks[0], -40.0, epsilon = 0.5);
        // Later samples sit higher on the ramp.
        assert!(peaks[3] > peaks[0] + 20.0, "{peaks:?}");
    }

    #[test]
    fn transform_failures_name_the_transform_and_sample() {
        // 44.1 kHz is not a valid libopus rate, so the codec transform
        // fails for this sample.
        let augs = parse_augmentations(&["codec[bitrate=3200]"]).unwrap();
        let odd_rate = AudioFormat {
            rate: 44_100,
            ..AudioFormat::default()
        };
        let sample = LabeledSample::new(
            "mem:odd",
            AudioBuffer::from_samples(vec![0.1; 4410], odd_rate),
            None,
        );
        let mut stream =
            augment_samples(vec![Ok(sample)], 1, augs, serial_options()).unwrap();
        let err = stream.next().unwrap().unwrap_err();
        match err {
            SdbError::Augmentation {
                name, sample_id, ..
            } => {
                assert_eq!(name, "codec");
                assert_eq!(sample_id, "mem:odd");
            }
            other => panic!("expected Augmentation error, got {other:?}"),
        }
    }

    #[test]
    fn source_errors_pass_through_untouched() {
        let inputs: Vec<Result<LabeledSample>> = vec![
            quiet_sample(0, 100),
            Err(SdbError::Corrupt("bad record".into())),
            quiet_sample(2, 100),
        ];
        let stream = augment_samples(inputs, 3, Vec::new(), serial_options()).unwrap();
        let results: Vec<_> = stream.collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(SdbError::Corrupt(_))));
        assert!(results[2].is_ok());
    }

    #[test]
    fn pooled_ordered_run_preserves_order_and_count() {
        let augs = parse_augmentations(&["volume[dbfs=-3]"]).unwrap();
        let inputs: Vec<_> = (0..64).map(|i| quiet_sample(i, 400)).collect();
        let options = AugmentOptions {
            workers: 4,
            lookahead: Some(4),
            ordered: true,
            ..AugmentOptions::default()
        };
        let ids: Vec<String> = augment_samples(inputs, 64, augs, options)
            .unwrap()
            .map(|item| item.unwrap().sample_id)
            .collect();
        let expected: Vec<String> = (0..64).map(|i| format!("mem:{i}")).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    fn invalid_clock_is_rejected() {
        let options = AugmentOptions {
            clock: 1.5,
            ..serial_options()
        };
        assert!(augment_samples(vec![quiet_sample(0, 10)], 1, Vec::new(), options).is_err());
    }

    #[test]
    fn convert_samples_changes_representation() {
        let options = AugmentOptions {
            target: AudioKind::Wav,
            ..serial_options()
        };
        let stream = convert_samples(vec![quiet_sample(0, 1600)], options).unwrap();
        for item in stream {
            assert_eq!(item.unwrap().audio.kind(), AudioKind::Wav);
        }
    }
}
