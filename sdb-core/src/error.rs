use thiserror::Error;

/// All errors produced by sdb-core.
#[derive(Debug, Error)]
pub enum SdbError {
    #[error("not a sample database (bad magic)")]
    NotASampleDatabase,

    #[error("schema has no speech column")]
    NoSpeechColumn,

    #[error("schema has no transcript column")]
    NoTranscriptColumn,

    #[error("sample index {index} out of range (collection holds {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("unsupported channel count: {0}")]
    UnsupportedChannelCount(u16),

    #[error("unsupported sample width: {0} bytes")]
    UnsupportedSampleWidth(u16),

    #[error("audio representation {0} cannot be stored in a sample database")]
    UnserializableAudio(&'static str),

    #[error("labeled writer requires a transcript (sample {0})")]
    MissingTranscript(String),

    #[error("unknown augmentation: {0}")]
    UnknownAugmentation(String),

    #[error("cannot parse augmentation spec {spec:?}: {reason}")]
    AugmentationSpecParse { spec: String, reason: String },

    #[error("augmentation {name} failed for sample {sample_id}: {source}")]
    Augmentation {
        name: &'static str,
        sample_id: String,
        #[source]
        source: Box<SdbError>,
    },

    #[error("unknown sample source type: {0}")]
    UnknownSourceType(String),

    #[error("malformed sample database: {0}")]
    Corrupt(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SdbError>;
