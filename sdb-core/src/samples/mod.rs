//! Sample sources: labeled utterances behind a uniform capability set.
//!
//! Every source exposes `{ len, duration_key, get }`:
//!
//! - `duration_key(i)` is the ascending sort key of sample `i`, obtained
//!   without decoding audio (container header, or file-size hint for
//!   tabular sources). The interleaving merge relies on it.
//! - `get(i)` is order-independent random access; sources keep no cursor
//!   state beyond their cached index.
//!
//! Sources are read-only after open and shareable across worker threads.

pub mod csv;
pub mod interleave;
pub mod sdb;

use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::audio::{AudioBuffer, AudioKind};
use crate::error::{Result, SdbError};
use crate::samples::interleave::Interleaved;

/// One labeled utterance: audio plus an optional transcript and a tracking
/// id assigned by the source that produced it.
#[derive(Debug, Clone)]
pub struct LabeledSample {
    /// Tracking id, unique within a source (`"<prefix>:<ordinal>"` for
    /// container sources, the audio path for file-backed sources).
    pub sample_id: String,
    pub audio: AudioBuffer,
    /// `None` for samples read from an unlabeled source.
    pub transcript: Option<String>,
}

impl LabeledSample {
    pub fn new(sample_id: impl Into<String>, audio: AudioBuffer, transcript: Option<String>) -> Self {
        Self {
            sample_id: sample_id.into(),
            audio,
            transcript,
        }
    }
}

/// Uniform random-access view over a duration-ordered sample collection.
pub trait SampleSource: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sort key of sample `index` (seconds, or a monotone proxy such as a
    /// file size). Must not decode audio.
    fn duration_key(&self, index: usize) -> Result<f64>;

    /// Load sample `index`. Valid for any `0 <= index < len()` in any
    /// order, any number of times.
    fn get(&self, index: usize) -> Result<LabeledSample>;
}

/// Lazy, restartable in-order iteration over a shared source.
pub struct SourceIter {
    source: Arc<dyn SampleSource>,
    next: usize,
}

impl SourceIter {
    pub fn new(source: Arc<dyn SampleSource>) -> Self {
        Self { source, next: 0 }
    }
}

impl Iterator for SourceIter {
    type Item = Result<LabeledSample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.source.len() {
            return None;
        }
        let item = self.source.get(self.next);
        self.next += 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.source.len() - self.next;
        (remaining, Some(remaining))
    }
}

/// Load a standalone audio file as a (labeled or unlabeled) sample.
///
/// The representation is chosen by file extension; the file's own path
/// becomes the sample id.
pub fn load_sample(path: &Path, label: Option<&str>) -> Result<LabeledSample> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    let kind = AudioKind::from_extension(ext)
        .ok_or_else(|| SdbError::UnknownSourceType(path.display().to_string()))?;
    let data = std::fs::read(path)?;
    let audio = match kind {
        AudioKind::Wav => AudioBuffer::from_wav(data)?,
        AudioKind::Opus => AudioBuffer::from_opus(data)?,
        _ => return Err(SdbError::UnknownSourceType(path.display().to_string())),
    };
    Ok(LabeledSample::new(
        path.display().to_string(),
        audio,
        label.map(str::to_owned),
    ))
}

/// Open a single sample source file, dispatched by extension (`.sdb` or
/// `.csv`).
///
/// `labeled`: `Some(true)` requires transcripts, `Some(false)` ignores
/// them, `None` auto-detects from the source's schema/header.
pub fn open_source(
    path: &Path,
    labeled: Option<bool>,
    reverse: bool,
) -> Result<Arc<dyn SampleSource>> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let source: Arc<dyn SampleSource> = match ext.as_str() {
        "sdb" => Arc::new(sdb::SdbReader::open(path, labeled, reverse)?),
        "csv" => Arc::new(csv::CsvSource::open(path, labeled, reverse)?),
        _ => return Err(SdbError::UnknownSourceType(path.display().to_string())),
    };
    debug!(path = %path.display(), samples = source.len(), "sample source opened");
    Ok(source)
}

/// Open several source files and merge them into one globally
/// duration-ordered collection.
///
/// Sources are combined lazily (k-way interleave), so the default
/// shortest-to-longest training order survives across heterogeneous files
/// without materializing anything.
pub fn open_sources(
    paths: &[std::path::PathBuf],
    labeled: Option<bool>,
    reverse: bool,
) -> Result<Interleaved> {
    if paths.is_empty() {
        return Err(SdbError::Other(anyhow::anyhow!(
            "no sample source files given"
        )));
    }
    let sources = paths
        .iter()
        .map(|p| open_source(p, labeled, reverse))
        .collect::<Result<Vec<_>>>()?;
    Ok(Interleaved::new(sources, reverse))
}
