//! Engine-wide error taxonomy.
//!
//! Decode-side failures live in [`DecodeError`], a cloneable subset that can
//! be fanned out to every caller waiting on a coalesced song load. Everything
//! else is an [`EngineError`].

use std::path::PathBuf;

/// Failure while turning one source file into canonical PCM.
///
/// Clone is required because a single in-flight decode may have several
/// waiters, each of which receives its own copy of the first error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DecodeError {
    #[error("file not found: {path}")]
    FileNotFound { path: PathBuf },
    #[error("unsupported audio format: {path}")]
    UnsupportedFormat { path: PathBuf },
    #[error("corrupt audio stream in {path}: {detail}")]
    CorruptStream { path: PathBuf, detail: String },
    #[error("i/o error reading {path}: {detail}")]
    Io { path: PathBuf, detail: String },
    #[error("load cancelled")]
    Cancelled,
}

/// Whole-song load failure carrying the first stem error observed.
#[derive(Debug, Clone, thiserror::Error)]
#[error("song {song_id} failed to load: {first_error}")]
pub struct SongLoadError {
    pub song_id: String,
    pub first_error: DecodeError,
}

/// Top-level error type returned by every engine command.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    SongLoadFailed(#[from] SongLoadError),

    #[error("duplicate source file: {path}")]
    DuplicateSource { path: PathBuf },
    #[error("metadata extraction failed for {path}: {detail}")]
    MetadataExtractionFailed { path: PathBuf, detail: String },
    #[error("import requires at least one audio file")]
    EmptyImport,
    #[error("song has {count} stems, the engine mixes at most {max}")]
    TooManyStems { count: usize, max: usize },

    #[error("audio device unavailable: {name}")]
    DeviceUnavailable { name: String },
    #[error("audio device disconnected")]
    DeviceDisconnected,
    #[error("sample rate {requested} Hz not supported by the output device")]
    SampleRateUnsupported { requested: u32 },

    #[error("no song loaded")]
    NoSongLoaded,
    #[error("invalid seek position: {seconds}")]
    InvalidSeekPosition { seconds: f64 },

    /// Warning condition only: pins keep more bytes alive than the budget.
    #[error("cache budget {budget_bytes} B is below the pinned set ({pinned_bytes} B)")]
    BudgetBelowPinnedSet { budget_bytes: u64, pinned_bytes: u64 },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("unique constraint violated: {detail}")]
    UniqueViolation { detail: String },
    #[error("library store is corrupt: {detail}")]
    StoreCorrupt { detail: String },
    #[error("store error: {0}")]
    Store(rusqlite::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Stable machine-readable kind string used in `audio:error` payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Decode(DecodeError::FileNotFound { .. }) => "FileNotFound",
            EngineError::Decode(DecodeError::UnsupportedFormat { .. }) => "UnsupportedFormat",
            EngineError::Decode(DecodeError::CorruptStream { .. }) => "CorruptStream",
            EngineError::Decode(DecodeError::Io { .. }) => "IoError",
            EngineError::Decode(DecodeError::Cancelled) => "LoadCancelled",
            EngineError::SongLoadFailed(_) => "SongLoadFailed",
            EngineError::DuplicateSource { .. } => "DuplicateSource",
            EngineError::MetadataExtractionFailed { .. } => "MetadataExtractionFailed",
            EngineError::EmptyImport => "EmptyImport",
            EngineError::TooManyStems { .. } => "TooManyStems",
            EngineError::DeviceUnavailable { .. } => "DeviceUnavailable",
            EngineError::DeviceDisconnected => "DeviceDisconnected",
            EngineError::SampleRateUnsupported { .. } => "SampleRateUnsupported",
            EngineError::NoSongLoaded => "NoSongLoaded",
            EngineError::InvalidSeekPosition { .. } => "InvalidSeekPosition",
            EngineError::BudgetBelowPinnedSet { .. } => "BudgetBelowPinnedSet",
            EngineError::NotFound { .. } => "NotFound",
            EngineError::UniqueViolation { .. } => "UniqueViolation",
            EngineError::StoreCorrupt { .. } => "StoreCorrupt",
            EngineError::Store(_) => "StoreError",
            EngineError::Io(_) => "IoError",
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, ref message) = err {
            let detail = message.clone().unwrap_or_else(|| failure.to_string());
            match failure.code {
                rusqlite::ErrorCode::ConstraintViolation
                    if detail.contains("UNIQUE constraint") =>
                {
                    return EngineError::UniqueViolation { detail };
                }
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase => {
                    return EngineError::StoreCorrupt { detail };
                }
                _ => {}
            }
        }
        EngineError::Store(err)
    }
}
