//! File ingest: groups user-chosen audio files into one new song.
//!
//! Each file is probed for its technical facts (rate, channels, duration,
//! size), fingerprinted for duplicate detection, given a stem display name
//! synthesized from its filename, and persisted together with the song in a
//! single transaction. Audio files are never copied; the library stores
//! absolute paths only.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;
use sha2::{Digest, Sha256};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use uuid::Uuid;

use crate::config::MAX_STEMS;
use crate::error::{DecodeError, EngineError};
use crate::library::metadata_store::MetadataStore;
use crate::protocol::{SongRecord, StemRecord};

/// Bytes hashed for the duplicate fingerprint.
const FINGERPRINT_PREFIX_BYTES: usize = 1024 * 1024;

/// Filename fragments mapped to stem display names. First match wins, so the
/// more specific fragments come first.
const STEM_KEYWORDS: &[(&str, &str)] = &[
    ("acoustic", "Acoustic Guitar"),
    ("electric", "Electric Guitar"),
    ("vocal", "Vocals"),
    ("vox", "Vocals"),
    ("choir", "Choir"),
    ("kick", "Kick"),
    ("snare", "Snare"),
    ("overhead", "Overheads"),
    ("drum", "Drums"),
    ("perc", "Percussion"),
    ("bass", "Bass"),
    ("keys", "Keys"),
    ("piano", "Piano"),
    ("organ", "Organ"),
    ("pad", "Pads"),
    ("synth", "Synth"),
    ("gtr", "Guitar"),
    ("guitar", "Guitar"),
    ("click", "Click"),
    ("guide", "Guide"),
    ("cue", "Cues"),
    ("string", "Strings"),
    ("brass", "Brass"),
    ("orch", "Orchestra"),
    ("loop", "Loops"),
    ("fx", "FX"),
];

/// Parameters for one import.
#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub paths: Vec<PathBuf>,
    pub title: String,
    pub artist: Option<String>,
    pub key: Option<String>,
    pub time_signature: Option<String>,
}

/// Per-file progress callback: `(analyzed, total)`.
pub type ImportProgressFn<'a> = dyn Fn(usize, usize) + 'a;

struct SourceFacts {
    sample_rate: u32,
    channels: u16,
    duration_secs: f64,
    file_size: u64,
    fingerprint: String,
}

/// Imports `request.paths` as the stems of one new song and returns its id.
/// All-or-nothing: any failing file aborts before anything is persisted.
pub fn import_song(
    store: &mut MetadataStore,
    request: &ImportRequest,
    on_progress: &ImportProgressFn<'_>,
) -> Result<String, EngineError> {
    if request.paths.is_empty() {
        return Err(EngineError::EmptyImport);
    }
    if request.paths.len() > MAX_STEMS {
        return Err(EngineError::TooManyStems {
            count: request.paths.len(),
            max: MAX_STEMS,
        });
    }

    let total = request.paths.len();
    let mut facts = Vec::with_capacity(total);
    let mut seen_fingerprints = Vec::with_capacity(total);
    for (index, path) in request.paths.iter().enumerate() {
        let file_facts = probe_source_file(path)?;
        if seen_fingerprints.contains(&file_facts.fingerprint)
            || store.fingerprint_exists(&file_facts.fingerprint)?
        {
            return Err(EngineError::DuplicateSource { path: path.clone() });
        }
        seen_fingerprints.push(file_facts.fingerprint.clone());
        facts.push(file_facts);
        on_progress(index + 1, total);
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0);
    let song_id = Uuid::new_v4().to_string();
    let duration_secs = facts
        .iter()
        .map(|fact| fact.duration_secs)
        .fold(0.0f64, f64::max);

    let song = SongRecord {
        id: song_id.clone(),
        name: request.title.clone(),
        artist: request.artist.clone(),
        key: request.key.clone(),
        tempo: None,
        time_signature: request.time_signature.clone(),
        duration_secs,
        mixdown_path: None,
        created_at: now,
        updated_at: now,
    };

    let stems: Vec<StemRecord> = request
        .paths
        .iter()
        .zip(facts.iter())
        .enumerate()
        .map(|(position, (path, fact))| StemRecord {
            id: Uuid::new_v4().to_string(),
            song_id: song_id.clone(),
            name: stem_display_name(path),
            file_path: path.to_string_lossy().into_owned(),
            file_size: fact.file_size,
            sample_rate: fact.sample_rate,
            channels: fact.channels,
            duration_secs: fact.duration_secs,
            gain: 1.0,
            muted: false,
            position: position as u32,
        })
        .collect();
    let fingerprints: Vec<String> = facts.into_iter().map(|fact| fact.fingerprint).collect();

    store.insert_song_with_stems(&song, &stems, &fingerprints)?;
    debug!(
        "ImportManager: imported '{}' as song {} with {} stems",
        request.title,
        song_id,
        stems.len()
    );
    Ok(song_id)
}

/// Probes one source file for rate/channels/duration and fingerprints it.
fn probe_source_file(path: &Path) -> Result<SourceFacts, EngineError> {
    if !path.is_file() {
        return Err(DecodeError::FileNotFound {
            path: path.to_path_buf(),
        }
        .into());
    }
    let file_size = std::fs::metadata(path)?.len();
    let fingerprint = fingerprint_source(path, file_size)?;

    let file = std::fs::File::open(path)?;
    let media_source = MediaSourceStream::new(Box::new(file), Default::default());
    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
        hint.with_extension(extension);
    }
    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            media_source,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|_| DecodeError::UnsupportedFormat {
            path: path.to_path_buf(),
        })?;

    let track = probed
        .format
        .default_track()
        .ok_or_else(|| DecodeError::UnsupportedFormat {
            path: path.to_path_buf(),
        })?;
    let params = &track.codec_params;
    let sample_rate = params
        .sample_rate
        .ok_or_else(|| EngineError::MetadataExtractionFailed {
            path: path.to_path_buf(),
            detail: "source reports no sample rate".to_string(),
        })?;
    if !(8_000..=192_000).contains(&sample_rate) {
        return Err(EngineError::MetadataExtractionFailed {
            path: path.to_path_buf(),
            detail: format!("sample rate {sample_rate} Hz outside supported range"),
        });
    }
    let native_channels = params
        .channels
        .map(|channels| channels.count() as u16)
        .unwrap_or(0);
    if native_channels == 0 {
        return Err(EngineError::MetadataExtractionFailed {
            path: path.to_path_buf(),
            detail: "source reports no channels".to_string(),
        });
    }
    let duration_secs = params
        .n_frames
        .map(|frames| frames as f64 / sample_rate as f64)
        .unwrap_or(0.0);

    Ok(SourceFacts {
        sample_rate,
        // Stored channel count describes the decoded representation, which
        // is capped at stereo (wider sources are downmixed at decode time).
        channels: native_channels.min(2),
        duration_secs,
        file_size,
        fingerprint,
    })
}

/// sha256 over the first 1 MiB plus the file size.
fn fingerprint_source(path: &Path, file_size: u64) -> Result<String, EngineError> {
    use std::io::Read;
    let mut file = std::fs::File::open(path)?;
    let mut buffer = vec![0u8; FINGERPRINT_PREFIX_BYTES];
    let mut read_total = 0usize;
    while read_total < buffer.len() {
        let read = file.read(&mut buffer[read_total..])?;
        if read == 0 {
            break;
        }
        read_total += read;
    }
    let mut hasher = Sha256::new();
    hasher.update(&buffer[..read_total]);
    hasher.update(file_size.to_le_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Synthesizes a stem display name from the filename: a known instrument
/// keyword when present, otherwise the prettified file stem.
fn stem_display_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("Stem");
    let lowered = stem.to_lowercase();
    for (fragment, label) in STEM_KEYWORDS {
        if lowered.contains(fragment) {
            return (*label).to_string();
        }
    }
    prettify(stem)
}

fn prettify(raw: &str) -> String {
    raw.split(|c: char| c == '_' || c == '-' || c.is_whitespace())
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CANONICAL_SAMPLE_RATE;
    use crate::protocol::SongSort;

    fn write_wav(path: &PathBuf, frames: usize, seed: i16) {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: CANONICAL_SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).expect("create wav");
        for frame in 0..frames {
            let value = seed.wrapping_add((frame % 300) as i16);
            writer.write_sample(value).expect("write L");
            writer.write_sample(value).expect("write R");
        }
        writer.finalize().expect("finalize wav");
    }

    fn request(paths: Vec<PathBuf>, title: &str) -> ImportRequest {
        ImportRequest {
            paths,
            title: title.to_string(),
            artist: Some("Worship Team".to_string()),
            key: Some("A".to_string()),
            time_signature: Some("4/4".to_string()),
        }
    }

    #[test]
    fn test_import_creates_song_with_ordered_named_stems() {
        let dir = tempfile::tempdir().expect("tempdir");
        let vocals = dir.path().join("Lead_Vocals.wav");
        let click = dir.path().join("click_track.wav");
        write_wav(&vocals, CANONICAL_SAMPLE_RATE as usize, 1); // 1.0 s
        write_wav(&click, CANONICAL_SAMPLE_RATE as usize / 2, 2); // 0.5 s

        let mut store = MetadataStore::new_in_memory().expect("store");
        let mut progress = Vec::new();
        let song_id = {
            let progress_cell = std::cell::RefCell::new(&mut progress);
            import_song(
                &mut store,
                &request(vec![vocals.clone(), click.clone()], "New Song"),
                &|current, total| progress_cell.borrow_mut().push((current, total)),
            )
            .expect("import succeeds")
        };

        let song = store.get_song(&song_id).expect("song stored");
        assert_eq!(song.name, "New Song");
        assert!((song.duration_secs - 1.0).abs() < 0.01);

        let stems = store.get_song_stems(&song_id).expect("stems stored");
        assert_eq!(stems.len(), 2);
        assert_eq!(stems[0].name, "Vocals");
        assert_eq!(stems[1].name, "Click");
        assert_eq!(stems[0].position, 0);
        assert_eq!(stems[1].position, 1);
        assert_eq!(stems[0].sample_rate, CANONICAL_SAMPLE_RATE);
        assert_eq!(stems[0].channels, 2);
        assert_eq!(progress, vec![(1, 2), (2, 2)]);
    }

    #[test]
    fn test_empty_import_is_rejected() {
        let mut store = MetadataStore::new_in_memory().expect("store");
        let result = import_song(&mut store, &request(Vec::new(), "Empty"), &|_, _| {});
        assert!(matches!(result, Err(EngineError::EmptyImport)));
    }

    #[test]
    fn test_import_rejects_more_stems_than_the_mixer_can_hold() {
        let paths: Vec<PathBuf> = (0..MAX_STEMS + 1)
            .map(|index| PathBuf::from(format!("/audio/wide/stem_{index}.wav")))
            .collect();
        let mut store = MetadataStore::new_in_memory().expect("store");
        let result = import_song(&mut store, &request(paths, "Too Wide"), &|_, _| {});
        assert!(matches!(
            result,
            Err(EngineError::TooManyStems { count, max })
                if count == MAX_STEMS + 1 && max == MAX_STEMS
        ));
    }

    #[test]
    fn test_failed_file_leaves_no_rows_behind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let good = dir.path().join("drums.wav");
        write_wav(&good, 1000, 3);
        let missing = dir.path().join("gone.wav");

        let mut store = MetadataStore::new_in_memory().expect("store");
        let result = import_song(
            &mut store,
            &request(vec![good, missing], "Partial"),
            &|_, _| {},
        );
        assert!(matches!(
            result,
            Err(EngineError::Decode(DecodeError::FileNotFound { .. }))
        ));
        assert!(store
            .get_all_songs(SongSort::Name)
            .expect("query works")
            .is_empty());
    }

    #[test]
    fn test_duplicate_content_is_rejected_across_imports() {
        let dir = tempfile::tempdir().expect("tempdir");
        let original = dir.path().join("bass.wav");
        write_wav(&original, 2000, 4);
        // Same bytes at a different path: same fingerprint.
        let copy = dir.path().join("bass_copy.wav");
        std::fs::copy(&original, &copy).expect("copy file");

        let mut store = MetadataStore::new_in_memory().expect("store");
        import_song(&mut store, &request(vec![original], "First"), &|_, _| {})
            .expect("first import");
        let result = import_song(&mut store, &request(vec![copy], "Second"), &|_, _| {});
        assert!(matches!(result, Err(EngineError::DuplicateSource { .. })));
    }

    #[test]
    fn test_duplicate_within_one_batch_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let original = dir.path().join("keys.wav");
        write_wav(&original, 2000, 5);
        let copy = dir.path().join("keys_again.wav");
        std::fs::copy(&original, &copy).expect("copy file");

        let mut store = MetadataStore::new_in_memory().expect("store");
        let result = import_song(
            &mut store,
            &request(vec![original, copy], "Doubled"),
            &|_, _| {},
        );
        assert!(matches!(result, Err(EngineError::DuplicateSource { .. })));
    }

    #[test]
    fn test_stem_display_name_keywords_and_fallback() {
        assert_eq!(stem_display_name(Path::new("/x/Lead_Vocals.wav")), "Vocals");
        assert_eq!(stem_display_name(Path::new("/x/ac_gtr_L.wav")), "Guitar");
        assert_eq!(
            stem_display_name(Path::new("/x/Acoustic_01.wav")),
            "Acoustic Guitar"
        );
        assert_eq!(stem_display_name(Path::new("/x/CLICK.wav")), "Click");
        assert_eq!(
            stem_display_name(Path::new("/x/weird_part_02.wav")),
            "Weird Part 02"
        );
    }

    #[test]
    fn test_fingerprint_depends_on_content_and_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        std::fs::write(&a, vec![1u8; 2048]).expect("write a");
        std::fs::write(&b, vec![2u8; 2048]).expect("write b");
        let fa = fingerprint_source(&a, 2048).expect("fp a");
        let fb = fingerprint_source(&b, 2048).expect("fp b");
        assert_ne!(fa, fb);

        let a2 = dir.path().join("a2.bin");
        std::fs::copy(&a, &a2).expect("copy");
        let fa2 = fingerprint_source(&a2, 2048).expect("fp a2");
        assert_eq!(fa, fa2);
    }
}
