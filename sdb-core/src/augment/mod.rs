//! Stochastic signal augmentations and their specification mini-language.
//!
//! ## Spec grammar
//!
//! ```text
//! name[ key=value (, key=value)* ]
//! value ∈ literal | start:end | start:end~jitter
//! ```
//!
//! Examples: `volume`, `reverb[delay=20:40,decay=5,p=0.3]`,
//! `overlay[source=noise.sdb,snr=3:30~2,layers=1:3]`.
//!
//! Ranged values resolve per sample against the training **clock** (a
//! `[0, 1]` progress value): linear interpolation from `start` to `end`,
//! then uniform jitter of ± the `~` amount. The `p` parameter (default 1)
//! is the per-sample Bernoulli probability of the transform being applied
//! at all.
//!
//! Transform names map to constructors through a static match; every
//! variant lives in the [`Augmentation`] enum.

pub mod overlay;
pub mod signal;

use std::sync::OnceLock;

use rand::Rng;
use regex::Regex;

use crate::error::{Result, SdbError};
use crate::samples::LabeledSample;

/// A literal-or-ranged parameter: `start == end` with `r == 0` encodes a
/// fixed value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueRange {
    pub start: f64,
    pub end: f64,
    /// Uniform jitter radius applied after clock interpolation.
    pub r: f64,
}

impl ValueRange {
    pub fn fixed(value: f64) -> Self {
        Self {
            start: value,
            end: value,
            r: 0.0,
        }
    }

    pub fn new(start: f64, end: f64, r: f64) -> Self {
        Self { start, end, r }
    }

    /// Parse `literal | start:end | start:end~jitter`.
    fn parse(text: &str) -> std::result::Result<Self, String> {
        let (value, r) = match text.split('~').collect::<Vec<_>>()[..] {
            [value] => (value, 0.0),
            [value, r] => (
                value,
                r.trim()
                    .parse::<f64>()
                    .map_err(|e| format!("bad jitter {r:?}: {e}"))?,
            ),
            _ => return Err("more than one '~'".into()),
        };
        if r < 0.0 {
            return Err(format!("negative jitter {r}"));
        }
        let (start, end) = match value.split(':').collect::<Vec<_>>()[..] {
            [v] => (v, v),
            [start, end] => (start, end),
            _ => return Err("more than one ':'".into()),
        };
        let start = start
            .trim()
            .parse::<f64>()
            .map_err(|e| format!("bad value {start:?}: {e}"))?;
        let end = end
            .trim()
            .parse::<f64>()
            .map_err(|e| format!("bad value {end:?}: {e}"))?;
        Ok(Self { start, end, r })
    }

    /// Resolve to a concrete value at `clock`: linear interpolation
    /// between `start` and `end`, then uniform jitter of ±`r`.
    pub fn pick<R: Rng>(&self, clock: f64, rng: &mut R) -> f64 {
        let clock = clock.clamp(0.0, 1.0);
        let value = self.start + clock * (self.end - self.start);
        if self.r == 0.0 {
            value
        } else {
            rng.gen_range((value - self.r)..=(value + self.r))
        }
    }

    /// Integer pick: the float pick rounded to the nearest integer.
    pub fn pick_int<R: Rng>(&self, clock: f64, rng: &mut R) -> i64 {
        self.pick(clock, rng).round() as i64
    }
}

fn spec_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?P<name>[a-z_]+)(\[(?P<params>.*)\])?$").unwrap())
}

fn parse_err(spec: &str, reason: impl Into<String>) -> SdbError {
    SdbError::AugmentationSpecParse {
        spec: spec.to_string(),
        reason: reason.into(),
    }
}

/// Key/value parameters of one spec, consumed by transform constructors.
pub(crate) struct Params<'s> {
    spec: &'s str,
    entries: Vec<(String, String)>,
}

impl<'s> Params<'s> {
    fn take(&mut self, key: &str) -> Option<String> {
        self.entries
            .iter()
            .position(|(k, _)| k == key)
            .map(|i| self.entries.swap_remove(i).1)
    }

    /// The shared `p` (probability) parameter, default 1.
    pub(crate) fn probability(&mut self) -> Result<f64> {
        let Some(text) = self.take("p") else {
            return Ok(1.0);
        };
        let p = text
            .parse::<f64>()
            .map_err(|e| parse_err(self.spec, format!("bad probability {text:?}: {e}")))?;
        if !(0.0..=1.0).contains(&p) {
            return Err(parse_err(self.spec, format!("probability {p} outside [0, 1]")));
        }
        Ok(p)
    }

    pub(crate) fn range(&mut self, key: &str, default: ValueRange) -> Result<ValueRange> {
        match self.take(key) {
            None => Ok(default),
            Some(text) => ValueRange::parse(&text)
                .map_err(|reason| parse_err(self.spec, format!("parameter {key}: {reason}"))),
        }
    }

    pub(crate) fn required(&mut self, key: &str) -> Result<String> {
        self.take(key)
            .ok_or_else(|| parse_err(self.spec, format!("missing required parameter {key}")))
    }

    /// Reject any parameter no constructor consumed.
    fn finish(self) -> Result<()> {
        if let Some((key, _)) = self.entries.first() {
            return Err(parse_err(self.spec, format!("unknown parameter {key}")));
        }
        Ok(())
    }
}

/// One configured transform. Cloning yields an independent per-worker
/// instance; clones of an overlay share its noise queue but carry their
/// own partial-sample state.
#[derive(Debug, Clone)]
pub enum Augmentation {
    Volume(signal::Volume),
    Resample(signal::Resample),
    Codec(signal::Codec),
    Reverb(signal::Reverb),
    Overlay(overlay::Overlay),
}

impl Augmentation {
    pub fn name(&self) -> &'static str {
        match self {
            Augmentation::Volume(_) => "volume",
            Augmentation::Resample(_) => "resample",
            Augmentation::Codec(_) => "codec",
            Augmentation::Reverb(_) => "reverb",
            Augmentation::Overlay(_) => "overlay",
        }
    }

    /// Per-sample Bernoulli probability of this transform being applied.
    pub fn probability(&self) -> f64 {
        match self {
            Augmentation::Volume(a) => a.probability,
            Augmentation::Resample(a) => a.probability,
            Augmentation::Codec(a) => a.probability,
            Augmentation::Reverb(a) => a.probability,
            Augmentation::Overlay(a) => a.probability,
        }
    }

    /// Spin up any background machinery (the overlay noise feed). Called
    /// once per pipeline run, before worker chains are cloned off.
    pub(crate) fn start(&mut self, workers: usize) -> Result<()> {
        match self {
            Augmentation::Overlay(a) => a.start(workers),
            _ => Ok(()),
        }
    }

    /// Apply this transform to one sample at the given clock.
    pub(crate) fn apply<R: Rng>(
        &mut self,
        sample: &mut LabeledSample,
        clock: f64,
        rng: &mut R,
    ) -> Result<()> {
        match self {
            Augmentation::Volume(a) => a.apply(sample, clock, rng),
            Augmentation::Resample(a) => a.apply(sample, clock, rng),
            Augmentation::Codec(a) => a.apply(sample, clock, rng),
            Augmentation::Reverb(a) => a.apply(sample, clock, rng),
            Augmentation::Overlay(a) => a.apply(sample, clock, rng),
        }
    }

    /// Tear down background machinery. Also happens implicitly when the
    /// last clone is dropped.
    pub fn stop(&mut self) {
        if let Augmentation::Overlay(a) = self {
            a.stop();
        }
    }
}

/// Parse one augmentation specification string.
pub fn parse_augmentation(spec: &str) -> Result<Augmentation> {
    let caps = spec_regex()
        .captures(spec.trim())
        .ok_or_else(|| parse_err(spec, "expected name[key=value,...]"))?;
    let name = caps["name"].to_string();

    let mut entries = Vec::new();
    if let Some(params) = caps.name("params") {
        for part in params.as_str().split(',') {
            if part.trim().is_empty() {
                continue;
            }
            let (key, value) = part.split_once('=').ok_or_else(|| {
                parse_err(spec, format!("parameter {part:?} is not a key=value assignment"))
            })?;
            entries.push((key.trim().to_string(), value.trim().to_string()));
        }
    }
    let mut params = Params { spec, entries };

    let augmentation = match name.as_str() {
        "volume" => Augmentation::Volume(signal::Volume::from_params(&mut params)?),
        "resample" => Augmentation::Resample(signal::Resample::from_params(&mut params)?),
        "codec" => Augmentation::Codec(signal::Codec::from_params(&mut params)?),
        "reverb" => Augmentation::Reverb(signal::Reverb::from_params(&mut params)?),
        "overlay" => Augmentation::Overlay(overlay::Overlay::from_params(&mut params)?),
        _ => return Err(SdbError::UnknownAugmentation(name)),
    };
    params.finish()?;
    Ok(augmentation)
}

/// Parse a list of specification strings, preserving their order (which is
/// also the per-sample application order).
pub fn parse_augmentations<S: AsRef<str>>(specs: &[S]) -> Result<Vec<Augmentation>> {
    specs.iter().map(|s| parse_augmentation(s.as_ref())).collect()
}
