//! # sdb-core
//!
//! Sample storage and augmentation pipeline for speech training corpora.
//!
//! ## Architecture
//!
//! ```text
//! SDB / CSV sources ──► Interleaved (duration-ordered k-way merge)
//!                             │
//!                       LimitingPool (bounded-lookahead worker threads)
//!                             │  per-sample: Bernoulli-gated transforms
//!                             │  (volume, resample, codec, reverb, overlay)
//!                             │  + conversion to the target representation
//!                             ▼
//!                  Iterator<Result<LabeledSample>>  (training consumer)
//! ```
//!
//! The overlay transform pulls noise audio from a dedicated feeder thread
//! through a bounded channel, so noise mixing never blocks the main merge.
//!
//! Sources are read-only after open and shareable across workers; the SDB
//! container itself is append-then-seal (no mutation, no concurrent writers).

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod augment;
pub mod error;
pub mod pipeline;
pub mod samples;

// Convenience re-exports for downstream crates
pub use audio::{AudioBuffer, AudioFormat, AudioKind};
pub use augment::{parse_augmentation, parse_augmentations, Augmentation, ValueRange};
pub use error::{Result, SdbError};
pub use pipeline::{augment_samples, convert_samples, AugmentOptions, AugmentedSamples};
pub use pipeline::pool::{LimitingPool, PoolConfig};
pub use samples::interleave::Interleaved;
pub use samples::sdb::{SdbReader, SdbWriter};
pub use samples::{load_sample, open_source, open_sources, LabeledSample, SampleSource};
