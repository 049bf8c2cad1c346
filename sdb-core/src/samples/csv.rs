//! Tabular sample source: a CSV of audio paths, size hints and
//! transcripts.
//!
//! Expected header: `wav_filename,wav_filesize[,transcript]`. Rows are
//! sorted once at load time by `wav_filesize`, a cheap monotone proxy for
//! duration that avoids decoding anything before the merge. Relative
//! paths resolve against the CSV file's directory.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Result, SdbError};
use crate::samples::{load_sample, LabeledSample, SampleSource};

const COL_FILENAME: &str = "wav_filename";
const COL_FILESIZE: &str = "wav_filesize";
const COL_TRANSCRIPT: &str = "transcript";

#[derive(Debug, Clone)]
struct Row {
    path: PathBuf,
    size_hint: u64,
    transcript: Option<String>,
}

/// Sample source backed by a CSV index of standalone audio files.
#[derive(Debug)]
pub struct CsvSource {
    rows: Vec<Row>,
}

impl CsvSource {
    /// Load and sort a CSV index.
    ///
    /// `labeled`: `Some(true)` fails with `NoTranscriptColumn` when the
    /// header has none, `Some(false)` ignores transcripts, `None`
    /// auto-detects from the header.
    pub fn open(path: &Path, labeled: Option<bool>, reverse: bool) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));

        let mut lines = text.lines().enumerate();
        let (_, header) = lines
            .next()
            .ok_or_else(|| SdbError::Corrupt(format!("{}: empty CSV", path.display())))?;
        let columns = split_fields(header);
        let find = |name: &str| columns.iter().position(|c| c == name);

        let filename_col = find(COL_FILENAME).ok_or_else(|| {
            SdbError::Corrupt(format!("{}: missing {COL_FILENAME} column", path.display()))
        })?;
        let filesize_col = find(COL_FILESIZE);
        let transcript_col = find(COL_TRANSCRIPT);

        let labeled = match labeled {
            Some(false) => false,
            Some(true) => {
                if transcript_col.is_none() {
                    return Err(SdbError::NoTranscriptColumn);
                }
                true
            }
            None => transcript_col.is_some(),
        };

        let mut rows = Vec::new();
        for (line_no, line) in lines {
            if line.trim().is_empty() {
                continue;
            }
            let fields = split_fields(line);
            let field = |col: usize| {
                fields.get(col).cloned().ok_or_else(|| {
                    SdbError::Corrupt(format!(
                        "{}:{}: row has {} fields, header has {}",
                        path.display(),
                        line_no + 1,
                        fields.len(),
                        columns.len()
                    ))
                })
            };

            let mut file = PathBuf::from(field(filename_col)?);
            if file.is_relative() {
                file = base_dir.join(file);
            }
            let size_hint = match filesize_col {
                Some(col) => field(col)?.parse::<u64>().map_err(|e| {
                    SdbError::Corrupt(format!(
                        "{}:{}: bad {COL_FILESIZE}: {e}",
                        path.display(),
                        line_no + 1
                    ))
                })?,
                None => 0,
            };
            let transcript = match transcript_col {
                Some(col) if labeled => Some(field(col)?),
                _ => None,
            };
            rows.push(Row {
                path: file,
                size_hint,
                transcript,
            });
        }

        rows.sort_by_key(|r| r.size_hint);
        if reverse {
            rows.reverse();
        }

        debug!(path = %path.display(), rows = rows.len(), labeled, "CSV source loaded");
        Ok(Self { rows })
    }
}

impl SampleSource for CsvSource {
    fn len(&self) -> usize {
        self.rows.len()
    }

    fn duration_key(&self, index: usize) -> Result<f64> {
        let row = self.rows.get(index).ok_or(SdbError::IndexOutOfRange {
            index,
            len: self.rows.len(),
        })?;
        Ok(row.size_hint as f64)
    }

    fn get(&self, index: usize) -> Result<LabeledSample> {
        let row = self.rows.get(index).ok_or(SdbError::IndexOutOfRange {
            index,
            len: self.rows.len(),
        })?;
        load_sample(&row.path, row.transcript.as_deref())
    }
}

/// Split one CSV line into fields, honoring double-quoted fields with
/// `""` escapes.
fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                current.push(c);
            }
        } else {
            match c {
                ',' => fields.push(std::mem::take(&mut current)),
                '"' => in_quotes = true,
                _ => current.push(c),
            }
        }
    }
    fields.push(current);
    fields
}
