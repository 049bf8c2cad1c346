//! Noise overlay: additively mix a separately streamed noise corpus into
//! samples at a target signal-to-noise ratio.
//!
//! ## Topology
//!
//! ```text
//! noise corpus ──► feeder thread (sole owner, cycles forever)
//!                        │ bounded channel, undecoded samples
//!        ┌───────────────┼────────────────┐
//!   worker clone    worker clone     worker clone
//!   (own tail)      (own tail)       (own tail)
//! ```
//!
//! One feeder thread owns the noise source and pushes whole undecoded
//! samples into a bounded channel; decoding happens on the consuming
//! workers. Each worker keeps the unused tail of a partially consumed
//! noise sample for its next call, so noise audio is sliced exactly to
//! the lengths required and never discarded.
//!
//! The feeder loop polls a cancellation flag between bounded-send
//! attempts, so tearing the transform down always releases it. Nothing is
//! persisted: a restarted pipeline begins again at the corpus start.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::audio::{gain_db_to_ratio, max_dbfs, normalize, AudioBuffer, AudioKind};
use crate::augment::{Params, ValueRange};
use crate::error::{Result, SdbError};
use crate::samples::{open_source, LabeledSample, SampleSource};

/// How long a bounded send may block before the feeder re-checks the
/// cancellation flag.
const SEND_POLL: Duration = Duration::from_millis(100);

/// Handle over the feeder thread; joined when the last overlay clone
/// drops or `stop` is called explicitly.
#[derive(Debug)]
struct NoiseFeed {
    cancel: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl NoiseFeed {
    fn shutdown(&self) {
        self.cancel.store(true, Ordering::Release);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for NoiseFeed {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn feed_noise(source: Arc<dyn SampleSource>, queue: Sender<AudioBuffer>, cancel: Arc<AtomicBool>) {
    if source.is_empty() {
        warn!("noise source is empty; overlay workers will starve");
        return;
    }
    loop {
        for index in 0..source.len() {
            let mut item = match source.get(index) {
                Ok(sample) => sample.audio,
                Err(e) => {
                    warn!(index, error = %e, "skipping unreadable noise sample");
                    continue;
                }
            };
            loop {
                match queue.send_timeout(item, SEND_POLL) {
                    Ok(()) => break,
                    Err(SendTimeoutError::Timeout(back)) => {
                        if cancel.load(Ordering::Acquire) {
                            return;
                        }
                        item = back;
                    }
                    Err(SendTimeoutError::Disconnected(_)) => return,
                }
            }
            if cancel.load(Ordering::Acquire) {
                return;
            }
        }
        debug!("noise source exhausted; wrapping to start");
    }
}

/// Additively mix `layers` independent noise contributions at a target
/// SNR, then renormalize to the original signal's peak level.
#[derive(Debug)]
pub struct Overlay {
    pub probability: f64,
    source: PathBuf,
    snr_db: ValueRange,
    layers: ValueRange,
    queue: Option<Receiver<AudioBuffer>>,
    feed: Option<Arc<NoiseFeed>>,
    /// Unused tail of a partially consumed noise sample; strictly
    /// worker-local, never shared across clones.
    tail: Option<Vec<f32>>,
}

impl Clone for Overlay {
    fn clone(&self) -> Self {
        Self {
            probability: self.probability,
            source: self.source.clone(),
            snr_db: self.snr_db,
            layers: self.layers,
            queue: self.queue.clone(),
            feed: self.feed.clone(),
            tail: None,
        }
    }
}

impl Overlay {
    pub(crate) fn from_params(params: &mut Params) -> Result<Self> {
        Ok(Self {
            probability: params.probability()?,
            source: PathBuf::from(params.required("source")?),
            snr_db: params.range("snr", ValueRange::fixed(3.0))?,
            layers: params.range("layers", ValueRange::fixed(1.0))?,
            queue: None,
            feed: None,
            tail: None,
        })
    }

    /// Open the noise source and spawn the feeder thread. Idempotent.
    ///
    /// The queue holds at most `p · max_layers · workers` undecoded noise
    /// samples, enough to keep every worker busy without buffering the
    /// corpus.
    pub(crate) fn start(&mut self, workers: usize) -> Result<()> {
        if self.queue.is_some() {
            return Ok(());
        }
        let capacity = ((self.probability * self.layers.end.max(1.0) * workers as f64) as usize)
            .max(1);
        let source = open_source(&self.source, Some(false), false)?;
        let (tx, rx) = bounded(capacity);
        let cancel = Arc::new(AtomicBool::new(false));
        let thread = {
            let cancel = Arc::clone(&cancel);
            std::thread::spawn(move || feed_noise(source, tx, cancel))
        };
        info!(
            source = %self.source.display(),
            capacity,
            "overlay noise feed started"
        );
        self.queue = Some(rx);
        self.feed = Some(Arc::new(NoiseFeed {
            cancel,
            thread: Mutex::new(Some(thread)),
        }));
        Ok(())
    }

    /// Pull and decode the next whole noise sample from the feed.
    fn next_noise(&self) -> Result<Vec<f32>> {
        let queue = self.queue.as_ref().ok_or_else(|| {
            SdbError::Other(anyhow::anyhow!("overlay augmentation was not started"))
        })?;
        let mut audio = queue
            .recv()
            .map_err(|_| SdbError::Other(anyhow::anyhow!("overlay noise feed terminated")))?;
        Ok(std::mem::take(audio.samples_vec()?))
    }

    pub(crate) fn apply<R: Rng>(
        &mut self,
        sample: &mut LabeledSample,
        clock: f64,
        rng: &mut R,
    ) -> Result<()> {
        let n_layers = self.layers.pick_int(clock, rng).max(0) as usize;
        let snr_db = self.snr_db.pick(clock, rng);

        sample.audio.convert(AudioKind::Samples, None)?;
        let audio_len = sample
            .audio
            .samples()
            .map(<[f32]>::len)
            .unwrap_or_default();
        let mut overlay_data = vec![0.0f32; audio_len];

        for _ in 0..n_layers {
            let mut offset = 0;
            while offset < audio_len {
                let current = match self.tail.take() {
                    Some(tail) => tail,
                    None => self.next_noise()?,
                };
                if current.is_empty() {
                    continue;
                }
                let required = audio_len - offset;
                if required >= current.len() {
                    // Consume the noise sample completely.
                    for (o, n) in overlay_data[offset..].iter_mut().zip(&current) {
                        *o += n;
                    }
                    offset += current.len();
                } else {
                    // Slice off the head, keep the tail for the next layer
                    // or the next sample.
                    for (o, n) in overlay_data[offset..].iter_mut().zip(&current[..required]) {
                        *o += n;
                    }
                    self.tail = Some(current[required..].to_vec());
                    offset += required;
                }
            }
        }

        let data = sample.audio.samples_vec()?;
        let original_dbfs = max_dbfs(data);
        let overlay_gain = original_dbfs - max_dbfs(&overlay_data) - snr_db;
        let ratio = gain_db_to_ratio(overlay_gain) as f32;
        for (a, n) in data.iter_mut().zip(&overlay_data) {
            *a += n * ratio;
        }
        normalize(data, original_dbfs);
        Ok(())
    }

    pub(crate) fn stop(&mut self) {
        if let Some(feed) = self.feed.take() {
            feed.shutdown();
        }
        self.queue = None;
        self.tail = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFormat;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Build an overlay wired to a hand-fed queue, no feeder thread.
    fn test_overlay(layers: f64, snr: f64) -> (Overlay, Sender<AudioBuffer>) {
        let (tx, rx) = bounded(16);
        (
            Overlay {
                probability: 1.0,
                source: PathBuf::new(),
                snr_db: ValueRange::fixed(snr),
                layers: ValueRange::fixed(layers),
                queue: Some(rx),
                feed: None,
                tail: None,
            },
            tx,
        )
    }

    fn noise_buffer(value: f32, len: usize) -> AudioBuffer {
        AudioBuffer::from_samples(vec![value; len], AudioFormat::default())
    }

    fn signal(len: usize) -> LabeledSample {
        let samples: Vec<f32> = (0..len)
            .map(|i| ((i as f32) * 0.05).sin() * 0.5)
            .collect();
        LabeledSample::new(
            "sig",
            AudioBuffer::from_samples(samples, AudioFormat::default()),
            None,
        )
    }

    #[test]
    fn zero_amplitude_noise_preserves_peak_level() {
        let (mut overlay, tx) = test_overlay(1.0, 3.0);
        for _ in 0..4 {
            tx.send(noise_buffer(0.0, 1000)).unwrap();
        }
        let mut sample = signal(3000);
        let peak_before = max_dbfs(sample.audio.samples().unwrap());
        overlay
            .apply(&mut sample, 0.0, &mut StdRng::seed_from_u64(1))
            .unwrap();
        let peak_after = max_dbfs(sample.audio.samples().unwrap());
        assert_relative_eq!(peak_after, peak_before, epsilon = 0.05);
    }

    #[test]
    fn tail_of_a_partial_noise_sample_is_carried_over() {
        let (mut overlay, tx) = test_overlay(1.0, 0.0);
        // One 5000-sample noise buffer covers a 3000-sample signal with
        // 2000 left over; the next apply must start from that tail and
        // only pull one more sample.
        tx.send(noise_buffer(0.25, 5000)).unwrap();
        tx.send(noise_buffer(0.25, 5000)).unwrap();

        let mut rng = StdRng::seed_from_u64(2);
        let mut first = signal(3000);
        overlay.apply(&mut first, 0.0, &mut rng).unwrap();
        assert_eq!(overlay.tail.as_ref().map(Vec::len), Some(2000));

        let mut second = signal(3000);
        overlay.apply(&mut second, 0.0, &mut rng).unwrap();
        assert_eq!(overlay.tail.as_ref().map(Vec::len), Some(4000));
    }

    #[test]
    fn layers_accumulate_independent_passes() {
        let (mut overlay, tx) = test_overlay(3.0, 0.0);
        for _ in 0..12 {
            tx.send(noise_buffer(0.1, 1000)).unwrap();
        }
        let mut sample = signal(2000);
        overlay
            .apply(&mut sample, 0.0, &mut StdRng::seed_from_u64(3))
            .unwrap();
        // 3 layers over a 2000-sample signal consume 6 whole noise samples.
        assert_eq!(tx.len(), 12 - 6);
    }

    #[test]
    fn clones_share_the_queue_but_not_the_tail() {
        let (mut overlay, tx) = test_overlay(1.0, 0.0);
        tx.send(noise_buffer(0.2, 4000)).unwrap();
        tx.send(noise_buffer(0.2, 4000)).unwrap();

        let mut rng = StdRng::seed_from_u64(4);
        let mut sample = signal(3000);
        overlay.apply(&mut sample, 0.0, &mut rng).unwrap();
        assert!(overlay.tail.is_some());

        let clone = overlay.clone();
        assert!(clone.tail.is_none());
        assert!(clone.queue.is_some());
    }

    #[test]
    fn apply_without_start_reports_an_error() {
        let mut overlay = Overlay {
            probability: 1.0,
            source: PathBuf::from("noise.sdb"),
            snr_db: ValueRange::fixed(3.0),
            layers: ValueRange::fixed(1.0),
            queue: None,
            feed: None,
            tail: None,
        };
        let mut sample = signal(100);
        let err = overlay
            .apply(&mut sample, 0.0, &mut StdRng::seed_from_u64(5))
            .unwrap_err();
        assert!(err.to_string().contains("not started"), "{err}");
    }
}
