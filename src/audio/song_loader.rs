//! Parallel song load orchestration.
//!
//! Decodes every stem of one song on a bounded worker pool and assembles the
//! results into a [`DecodedSong`] in stem display order. One failing stem
//! fails the whole load; partial songs would break the sample-lock guarantee
//! between stems.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

use log::{debug, warn};

use crate::audio::stem_decoder::decode_stem_file;
use crate::audio::{DecodedSong, DecodedStem};
use crate::error::{DecodeError, SongLoadError};

/// Hard cap on decode workers; beyond this the load is I/O bound anyway.
const MAX_DECODE_WORKERS: usize = 8;

/// Everything the loader needs to know about one stem to decode.
#[derive(Debug, Clone)]
pub struct StemSource {
    pub stem_id: String,
    pub name: String,
    pub path: PathBuf,
    pub default_gain: f32,
    pub default_muted: bool,
}

/// Per-stem completion callback: `(completed, total)`.
pub type ProgressFn<'a> = dyn Fn(usize, usize) + Sync + 'a;

/// Number of decode workers for `stem_count` stems.
pub fn worker_count(stem_count: usize) -> usize {
    let cpus = thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(4);
    cpus.min(MAX_DECODE_WORKERS).min(stem_count).max(1)
}

/// Decodes all stems of a song and assembles the result.
///
/// `cancel` is polled between stems, not mid-stem; a cancelled load returns
/// [`DecodeError::Cancelled`] as its first error. Progress fires once per
/// completed stem in completion order.
pub fn load_song(
    song_id: &str,
    stems: &[StemSource],
    cancel: &AtomicBool,
    on_progress: &ProgressFn<'_>,
) -> Result<DecodedSong, SongLoadError> {
    if stems.is_empty() {
        return Err(SongLoadError {
            song_id: song_id.to_string(),
            first_error: DecodeError::CorruptStream {
                path: PathBuf::new(),
                detail: "song has no stems".to_string(),
            },
        });
    }

    let total = stems.len();
    let workers = worker_count(total);
    debug!(
        "SongLoader: decoding {} stems of song {} on {} workers",
        total, song_id, workers
    );

    let next_job = AtomicUsize::new(0);
    let failed = AtomicBool::new(false);
    let (result_sender, result_receiver) = mpsc::channel::<(usize, Result<DecodedStem, DecodeError>)>();

    thread::scope(|scope| {
        for _ in 0..workers {
            let result_sender = result_sender.clone();
            let next_job = &next_job;
            let failed = &failed;
            scope.spawn(move || loop {
                if cancel.load(Ordering::Relaxed) || failed.load(Ordering::Relaxed) {
                    return;
                }
                let index = next_job.fetch_add(1, Ordering::Relaxed);
                if index >= total {
                    return;
                }
                let source = &stems[index];
                let result = decode_stem_file(&source.path).map(|decoded| DecodedStem {
                    stem_id: source.stem_id.clone(),
                    name: source.name.clone(),
                    default_gain: source.default_gain,
                    default_muted: source.default_muted,
                    pcm: decoded.pcm,
                    frames: decoded.frames,
                });
                if result.is_err() {
                    failed.store(true, Ordering::Relaxed);
                }
                if result_sender.send((index, result)).is_err() {
                    return;
                }
            });
        }
        drop(result_sender);

        let mut slots: Vec<Option<DecodedStem>> = (0..total).map(|_| None).collect();
        let mut completed = 0usize;
        let mut first_error: Option<DecodeError> = None;

        while let Ok((index, result)) = result_receiver.recv() {
            match result {
                Ok(stem) => {
                    slots[index] = Some(stem);
                    completed += 1;
                    on_progress(completed, total);
                }
                Err(err) => {
                    warn!(
                        "SongLoader: stem {} of song {} failed: {}",
                        stems[index].stem_id, song_id, err
                    );
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        if cancel.load(Ordering::Relaxed) && first_error.is_none() {
            first_error = Some(DecodeError::Cancelled);
        }

        match first_error {
            Some(first_error) => Err(SongLoadError {
                song_id: song_id.to_string(),
                first_error,
            }),
            None if completed == total => {
                let assembled: Vec<DecodedStem> =
                    slots.into_iter().map(|slot| slot.expect("all slots filled")).collect();
                Ok(DecodedSong::new(song_id.to_string(), assembled))
            }
            // Workers bailed early (cancel raced a failure flag without an
            // error reaching the channel).
            None => Err(SongLoadError {
                song_id: song_id.to_string(),
                first_error: DecodeError::Cancelled,
            }),
        }
    })
}
