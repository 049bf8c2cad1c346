//! The SDB container: append-then-seal storage for millions of labeled
//! audio samples with random access.
//!
//! ## On-disk layout (all integers big-endian, unsigned)
//!
//! ```text
//! MAGIC "SAMPLEDB"
//! u64 meta_len | meta (JSON: {"schema":[{"content":..,"mime-type":..},..]})
//! u64 index_chunk_len | u64 sample_count          ← reserved at open,
//! sample_record*                                     written at seal
//! u64 sample_count | u64 offset*                  ← trailing index
//! ```
//!
//! Each `sample_record` is `u32 total_len | (u32 col_len | col_bytes)+`
//! with one chunk per schema column, in schema order.
//!
//! `index_chunk_len` counts every byte after the header's `sample_count`
//! field: the records, the trailing count and the offset array. A reader
//! therefore skips `index_chunk_len - 8 * (sample_count + 1)` bytes to land
//! on the trailing index. An empty sealed container carries
//! `index_chunk_len == 8`.
//!
//! ## Lifecycle
//!
//! The writer is an explicit two-state machine:
//!
//! ```text
//! Writing { reserved header slot, in-memory offsets } ──close()──► Sealed
//! ```
//!
//! The index header is only valid once the file is sealed; a file whose
//! reserved slot still holds zeros is unreadable and must be deleted and
//! rewritten. `close()` is idempotent; any I/O failure while writing is
//! fatal for the writer instance (no partial-recovery contract).

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audio::{codec, wav, AudioBuffer, AudioKind};
use crate::error::{Result, SdbError};
use crate::samples::{LabeledSample, SampleSource};

const MAGIC: &[u8; 8] = b"SAMPLEDB";
const BIGINT_SIZE: u64 = 8;
/// Reserved slot: `index_chunk_len` + `sample_count`.
const RESERVED_HEADER_SIZE: u64 = 2 * BIGINT_SIZE;

const CONTENT_SPEECH: &str = "speech";
const CONTENT_TRANSCRIPT: &str = "transcript";
const MIME_TEXT: &str = "text/plain";

/// Upper bound on the schema JSON; anything larger is a corrupt file, not
/// a schema.
const MAX_META_LEN: u64 = 1 << 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ColumnDescriptor {
    content: String,
    #[serde(rename = "mime-type")]
    mime_type: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Meta {
    schema: Vec<ColumnDescriptor>,
}

fn read_u32_be(reader: &mut impl Read) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64_be(reader: &mut impl Read) -> std::io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

// ── Writer ───────────────────────────────────────────────────────────────

/// File position of the reserved `(index_chunk_len, sample_count)` slot.
#[derive(Debug, Clone, Copy)]
struct ReservedHeader(u64);

impl ReservedHeader {
    /// First byte after the reserved slot, where sample records begin.
    fn samples_start(self) -> u64 {
        self.0 + RESERVED_HEADER_SIZE
    }
}

enum WriterState {
    Writing {
        file: BufWriter<File>,
        reserved: ReservedHeader,
        offsets: Vec<u64>,
    },
    Sealed,
}

/// Single-pass SDB creator: `open` → `add`* → `close`.
pub struct SdbWriter {
    path: PathBuf,
    id_prefix: String,
    target: AudioKind,
    bitrate: Option<i32>,
    labeled: bool,
    state: WriterState,
}

impl SdbWriter {
    /// Create a new SDB file.
    ///
    /// Every added sample is re-encoded to `target` (a serializable
    /// representation) so the whole file shares one bitrate and format.
    ///
    /// # Errors
    /// `SdbError::UnserializableAudio` if `target` cannot be stored.
    pub fn open(
        path: &Path,
        target: AudioKind,
        bitrate: Option<i32>,
        labeled: bool,
    ) -> Result<Self> {
        if !target.is_serializable() {
            return Err(SdbError::UnserializableAudio(target.label()));
        }
        let mime = target
            .mime_type()
            .ok_or(SdbError::UnserializableAudio(target.label()))?;

        let mut file = BufWriter::new(File::create(path)?);
        file.write_all(MAGIC)?;

        let mut schema = vec![ColumnDescriptor {
            content: CONTENT_SPEECH.into(),
            mime_type: mime.into(),
        }];
        if labeled {
            schema.push(ColumnDescriptor {
                content: CONTENT_TRANSCRIPT.into(),
                mime_type: MIME_TEXT.into(),
            });
        }
        let meta =
            serde_json::to_vec(&Meta { schema }).map_err(|e| SdbError::Other(e.into()))?;
        file.write_all(&(meta.len() as u64).to_be_bytes())?;
        file.write_all(&meta)?;

        let reserved = ReservedHeader(file.stream_position()?);
        file.write_all(&[0u8; RESERVED_HEADER_SIZE as usize])?;

        debug!(path = %path.display(), target = target.label(), labeled, "sample database created");
        Ok(Self {
            path: path.to_path_buf(),
            id_prefix: path.display().to_string(),
            target,
            bitrate,
            labeled,
            state: WriterState::Writing {
                file,
                reserved,
                offsets: Vec::new(),
            },
        })
    }

    /// Number of samples added so far.
    pub fn len(&self) -> usize {
        match &self.state {
            WriterState::Writing { offsets, .. } => offsets.len(),
            WriterState::Sealed => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append one sample, returning its assigned id (`"<path>:<ordinal>"`).
    ///
    /// The sample's audio is decoded to raw PCM and re-encoded to the
    /// writer's target even when it already arrives in a serializable
    /// representation; passing encoded audio through unchanged would leak
    /// foreign bitrates into the file.
    pub fn add(&mut self, mut sample: LabeledSample) -> Result<String> {
        let labeled = self.labeled;
        let target = self.target;
        let bitrate = self.bitrate;
        let WriterState::Writing { file, offsets, .. } = &mut self.state else {
            return Err(SdbError::Other(anyhow::anyhow!(
                "cannot add to a sealed sample database"
            )));
        };

        let ordinal = offsets.len();
        let sample_id = format!("{}:{}", self.id_prefix, ordinal);

        sample.audio.convert(AudioKind::Pcm, None)?;
        sample.audio.convert(target, bitrate)?;
        let speech = sample
            .audio
            .encoded_bytes()
            .ok_or(SdbError::UnserializableAudio(target.label()))?;

        let transcript = if labeled {
            Some(
                sample
                    .transcript
                    .as_deref()
                    .ok_or_else(|| SdbError::MissingTranscript(sample_id.clone()))?
                    .as_bytes(),
            )
        } else {
            None
        };

        let mut record_len = 4 + speech.len();
        if let Some(t) = transcript {
            record_len += 4 + t.len();
        }

        offsets.push(file.stream_position()?);
        file.write_all(&(record_len as u32).to_be_bytes())?;
        file.write_all(&(speech.len() as u32).to_be_bytes())?;
        file.write_all(speech)?;
        if let Some(t) = transcript {
            file.write_all(&(t.len() as u32).to_be_bytes())?;
            file.write_all(t)?;
        }
        Ok(sample_id)
    }

    /// Seal the file: fill the reserved header slot and append the offset
    /// index. A second `close` is a no-op.
    pub fn close(&mut self) -> Result<()> {
        let state = std::mem::replace(&mut self.state, WriterState::Sealed);
        let WriterState::Writing {
            mut file,
            reserved,
            offsets,
        } = state
        else {
            return Ok(());
        };

        let records_end = file.stream_position()?;
        let records_len = records_end - reserved.samples_start();
        let index_chunk_len = records_len + BIGINT_SIZE * (offsets.len() as u64 + 1);

        file.seek(SeekFrom::Start(reserved.0))?;
        file.write_all(&index_chunk_len.to_be_bytes())?;
        file.write_all(&(offsets.len() as u64).to_be_bytes())?;

        file.seek(SeekFrom::Start(records_end))?;
        file.write_all(&(offsets.len() as u64).to_be_bytes())?;
        for offset in &offsets {
            file.write_all(&offset.to_be_bytes())?;
        }
        file.flush()?;
        file.get_ref().sync_all()?;

        info!(path = %self.path.display(), samples = offsets.len(), "sample database sealed");
        Ok(())
    }
}

impl Drop for SdbWriter {
    fn drop(&mut self) {
        if matches!(self.state, WriterState::Writing { .. }) {
            warn!(
                path = %self.path.display(),
                "sample database writer dropped without close; file left unsealed"
            );
        }
    }
}

// ── Reader ───────────────────────────────────────────────────────────────

/// Random-access SDB reader.
///
/// The offset index is cached at open; `get` is valid for any index in any
/// order. The file handle lives behind a mutex so one reader can be shared
/// read-only across worker threads (workers may equally open their own).
#[derive(Debug)]
pub struct SdbReader {
    id_prefix: String,
    file: Mutex<BufReader<File>>,
    schema: Vec<ColumnDescriptor>,
    speech_index: usize,
    speech_kind: AudioKind,
    transcript_index: Option<usize>,
    offsets: Vec<u64>,
}

impl SdbReader {
    /// Open a sealed SDB file.
    ///
    /// `labeled`: `Some(true)` fails with `NoTranscriptColumn` when the
    /// schema carries no transcripts, `Some(false)` ignores them, `None`
    /// auto-detects. `reverse` flips iteration order by reversing the
    /// cached offsets only; the file itself is never rewritten.
    pub fn open(path: &Path, labeled: Option<bool>, reverse: bool) -> Result<Self> {
        let mut file = BufReader::new(File::open(path)?);

        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(SdbError::NotASampleDatabase);
        }

        let meta_len = read_u64_be(&mut file)?;
        if meta_len > MAX_META_LEN {
            return Err(SdbError::Corrupt(format!(
                "schema chunk of {meta_len} bytes exceeds the sane maximum"
            )));
        }
        let mut meta_bytes = vec![0u8; meta_len as usize];
        file.read_exact(&mut meta_bytes)?;
        let meta: Meta = serde_json::from_slice(&meta_bytes)
            .map_err(|e| SdbError::Corrupt(format!("schema: {e}")))?;
        let schema = meta.schema;

        let (speech_index, speech_kind) = schema
            .iter()
            .enumerate()
            .find_map(|(i, col)| {
                (col.content == CONTENT_SPEECH)
                    .then(|| AudioKind::from_mime(&col.mime_type).map(|k| (i, k)))
                    .flatten()
            })
            .ok_or(SdbError::NoSpeechColumn)?;

        let transcript_index = if labeled == Some(false) {
            None
        } else {
            let found = schema
                .iter()
                .position(|col| col.content == CONTENT_TRANSCRIPT && col.mime_type == MIME_TEXT);
            if found.is_none() && labeled == Some(true) {
                return Err(SdbError::NoTranscriptColumn);
            }
            found
        };

        let index_chunk_len = read_u64_be(&mut file)?;
        let count = read_u64_be(&mut file)?;
        let records_len = index_chunk_len
            .checked_sub(BIGINT_SIZE * (count + 1))
            .ok_or_else(|| SdbError::Corrupt("index chunk shorter than its own index".into()))?;
        file.seek_relative(records_len as i64)?;

        let trailing_count = read_u64_be(&mut file)?;
        if trailing_count != count {
            return Err(SdbError::Corrupt(format!(
                "header claims {count} samples, trailing index claims {trailing_count}"
            )));
        }
        let mut offsets = Vec::with_capacity(count as usize);
        for _ in 0..count {
            offsets.push(read_u64_be(&mut file)?);
        }
        if reverse {
            offsets.reverse();
        }

        debug!(
            path = %path.display(),
            samples = offsets.len(),
            speech = speech_kind.label(),
            labeled = transcript_index.is_some(),
            reverse,
            "sample database opened"
        );
        Ok(Self {
            id_prefix: path.display().to_string(),
            file: Mutex::new(file),
            schema,
            speech_index,
            speech_kind,
            transcript_index,
            offsets,
        })
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.offsets.len() {
            return Err(SdbError::IndexOutOfRange {
                index,
                len: self.offsets.len(),
            });
        }
        Ok(())
    }

    /// Read the requested columns of one record, skipping the rest via
    /// seeks and stopping early once everything wanted has been read.
    fn read_columns(&self, index: usize, want_transcript: bool) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
        self.check_index(index)?;
        let transcript_index = self.transcript_index.filter(|_| want_transcript);
        let wanted = 1 + usize::from(transcript_index.is_some());

        let mut file = self.file.lock();
        // Skip the record's total-length prefix; column prefixes drive the walk.
        file.seek(SeekFrom::Start(self.offsets[index] + 4))?;

        let mut speech = None;
        let mut transcript = None;
        let mut found = 0;
        for col in 0..self.schema.len() {
            let len = read_u32_be(&mut *file)? as usize;
            if col == self.speech_index {
                let mut data = vec![0u8; len];
                file.read_exact(&mut data)?;
                speech = Some(data);
                found += 1;
            } else if Some(col) == transcript_index {
                let mut data = vec![0u8; len];
                file.read_exact(&mut data)?;
                transcript = Some(data);
                found += 1;
            } else {
                file.seek_relative(len as i64)?;
            }
            if found == wanted {
                break;
            }
        }
        let speech =
            speech.ok_or_else(|| SdbError::Corrupt("record is missing its speech chunk".into()))?;
        Ok((speech, transcript))
    }
}

impl SampleSource for SdbReader {
    fn len(&self) -> usize {
        self.offsets.len()
    }

    fn duration_key(&self, index: usize) -> Result<f64> {
        let (speech, _) = self.read_columns(index, false)?;
        match self.speech_kind {
            AudioKind::Wav => wav::probe_duration(&speech),
            AudioKind::Opus => codec::probe_duration(&speech),
            _ => Err(SdbError::UnserializableAudio(self.speech_kind.label())),
        }
    }

    fn get(&self, index: usize) -> Result<LabeledSample> {
        let (speech, transcript) = self.read_columns(index, true)?;
        let audio = match self.speech_kind {
            AudioKind::Wav => AudioBuffer::from_wav(speech)?,
            AudioKind::Opus => AudioBuffer::from_opus(speech)?,
            _ => return Err(SdbError::UnserializableAudio(self.speech_kind.label())),
        };
        let transcript = transcript
            .map(|t| {
                String::from_utf8(t)
                    .map_err(|e| SdbError::Corrupt(format!("transcript is not UTF-8: {e}")))
            })
            .transpose()?;
        Ok(LabeledSample::new(
            format!("{}:{}", self.id_prefix, index),
            audio,
            transcript,
        ))
    }
}
