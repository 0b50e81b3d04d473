//! Shared payload types for the engine's command/event surface and the
//! lock-free exchange between the control plane and the mixer callback.

use std::sync::Arc;

use crate::audio::DecodedSong;
use crate::config::MAX_STEMS;

/// Transport state of the mixer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub enum TransportState {
    Stopped,
    Playing,
    Paused,
}

/// One song row as stored in the library.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SongRecord {
    pub id: String,
    pub name: String,
    pub artist: Option<String>,
    pub key: Option<String>,
    pub tempo: Option<f64>,
    pub time_signature: Option<String>,
    pub duration_secs: f64,
    /// Optional rendered mixdown used by UI shells for waveform display.
    /// The engine persists it but never reads the file.
    pub mixdown_path: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One stem row as stored in the library.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct StemRecord {
    pub id: String,
    pub song_id: String,
    pub name: String,
    pub file_path: String,
    pub file_size: u64,
    pub sample_rate: u32,
    pub channels: u16,
    pub duration_secs: f64,
    pub gain: f32,
    pub muted: bool,
    pub position: u32,
}

/// One setlist with its ordered song ids.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct SetlistRecord {
    pub id: String,
    pub name: String,
    pub song_ids: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Sort orders accepted by song listing/filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SongSort {
    #[default]
    Name,
    Artist,
    Tempo,
    Duration,
    DateAdded,
}

/// Filter parameters for `filter_songs`.
#[derive(Debug, Clone, Default)]
pub struct SongFilter {
    pub query: Option<String>,
    pub tempo_min: Option<f64>,
    pub tempo_max: Option<f64>,
    pub key: Option<String>,
    pub sort_by: SongSort,
}

/// Peak level of one stem in a levels event.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct StemLevel {
    pub stem_id: String,
    pub peak: f32,
}

/// Events pushed to UI subscribers over the broadcast bus.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    PlaybackPosition {
        seconds: f64,
    },
    PlaybackState {
        state: TransportState,
    },
    PlaybackLevels {
        stems: Vec<StemLevel>,
        master: f32,
    },
    LoadProgress {
        song_id: String,
        current: usize,
        total: usize,
    },
    LoadComplete {
        song_id: String,
    },
    PreloadProgress {
        setlist_id: String,
        current: usize,
        total: usize,
    },
    PreloadComplete {
        setlist_id: String,
    },
    ImportProgress {
        current: usize,
        total: usize,
    },
    AudioError {
        kind: String,
        message: String,
    },
    CacheWarning {
        kind: String,
        message: String,
    },
}

/// Commands consumed by the mixer callback through its lock-free inbox.
///
/// Stems are addressed by index into the active song's stem list; the control
/// plane resolves stem ids before sending so the callback never hashes or
/// compares strings.
#[derive(Clone)]
pub enum MixerCommand {
    /// Install a song: transport forced to `Stopped`, position reset to 0.
    /// The sender must keep its own reference to the outgoing song alive
    /// until after this command is applied so the callback never drops the
    /// last `Arc` to a PCM buffer.
    LoadSong(Arc<DecodedSong>),
    /// Drop the active song (transport stops, position resets).
    Unload,
    Play,
    Pause,
    Stop,
    Seek { frame: u64 },
    SetStemGain { stem: usize, gain: f32 },
    SetStemMute { stem: usize, muted: bool },
    SetStemSolo { stem: usize, solo: bool },
    SetMasterGain { gain: f32 },
}

/// Telemetry pushed out of the mixer callback.
///
/// Level payloads are fixed-size arrays so pushing an event never allocates.
/// `session` increments whenever transport stops or a song is (un)loaded;
/// consumers use it to discard stale position/level samples.
#[derive(Debug, Clone, Copy)]
pub enum MixerTelemetry {
    Position {
        frame: u64,
        session: u64,
    },
    State {
        state: TransportState,
        session: u64,
    },
    Levels {
        stem_peaks: [f32; MAX_STEMS],
        stem_count: usize,
        master_peak: f32,
        session: u64,
    },
}
