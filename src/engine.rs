//! Engine facade: command dispatch, event emission, component wiring.
//!
//! [`Engine`] owns the metadata store, the song cache, the mixer's shared
//! state, and a dedicated output thread that holds the cpal stream (host
//! streams are not `Send`, so all stream work happens on that thread through
//! a small request channel). Commands are plain methods returning
//! `Result<_, EngineError>`; everything asynchronous flows to subscribers as
//! [`EngineEvent`]s over a broadcast bus, throttled by rate limiters.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use log::{debug, error, warn};
use tokio::sync::broadcast;

use crate::audio::mixer::{MixerSeed, MixerShared, StemMix};
use crate::audio::output::{OutputDriver, OutputStreamInfo};
use crate::audio::song_loader::{self, StemSource};
use crate::audio::DecodedSong;
use crate::config::{AudioSettings, CANONICAL_SAMPLE_RATE, MAX_STEMS};
use crate::error::EngineError;
use crate::library::import_manager::{self, ImportRequest};
use crate::library::metadata_store::MetadataStore;
use crate::protocol::{
    EngineEvent, MixerCommand, MixerTelemetry, SetlistRecord, SongFilter, SongRecord, SongSort,
    StemLevel, StemRecord, TransportState,
};
use crate::song_cache::{CacheStats, SongCache};

/// Event bus depth for UI subscribers.
const EVENT_BUS_CAPACITY: usize = 256;
/// Telemetry drain cadence of the event pump.
const PUMP_INTERVAL: Duration = Duration::from_millis(20);

/// Control-plane mirror of the mixer's runtime mix state. The mixer owns the
/// live values; this copy resolves stem ids to indices, seeds replacement
/// cores after a stream rebuild, and answers toggles.
#[derive(Default)]
struct MixMirror {
    song: Option<Arc<DecodedSong>>,
    song_id: Option<String>,
    stem_ids: Vec<String>,
    stems: Vec<StemMix>,
    master_gain: f32,
}

impl MixMirror {
    fn seed(&self) -> MixerSeed {
        MixerSeed {
            song: self.song.clone(),
            stems: self.stems.clone(),
        }
    }

    fn stem_index(&self, stem_id: &str) -> Option<usize> {
        self.stem_ids.iter().position(|id| id == stem_id)
    }
}

enum OutputRequest {
    Open {
        device_name: Option<String>,
        sample_rate: u32,
        buffer_frames: u32,
        seed: MixerSeed,
        reply: mpsc::Sender<Result<OutputStreamInfo, EngineError>>,
    },
    Enumerate {
        reply: mpsc::Sender<Vec<String>>,
    },
    Shutdown,
}

/// The backing-track engine. One instance per process; safe to share across
/// control threads.
pub struct Engine {
    store: Mutex<MetadataStore>,
    cache: Arc<SongCache>,
    shared: Arc<MixerShared>,
    events: broadcast::Sender<EngineEvent>,
    mix: Arc<Mutex<MixMirror>>,
    settings: Mutex<AudioSettings>,
    preloaded: Mutex<HashMap<String, Vec<String>>>,
    /// Commands that did not fit the mixer inbox, staged control-side until
    /// the ring has room again. See [`stage_mixer_command`].
    outbox: Arc<Mutex<VecDeque<MixerCommand>>>,
    output_requests: Mutex<mpsc::Sender<OutputRequest>>,
    output_thread: Option<JoinHandle<()>>,
    pump_shutdown: Arc<AtomicBool>,
    pump_thread: Option<JoinHandle<()>>,
}

impl Engine {
    /// Opens the default on-disk library and starts the audio stack.
    pub fn new() -> Result<Self, EngineError> {
        Self::with_store(MetadataStore::new()?)
    }

    /// Builds an engine over an already-opened store. A missing or failing
    /// output device is tolerated at startup; playback commands simply queue
    /// until a device is opened via `switch_audio_device`.
    pub fn with_store(store: MetadataStore) -> Result<Self, EngineError> {
        let settings = store.get_audio_settings()?;
        let shared = Arc::new(MixerShared::new());
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let events_for_cache = events.clone();
        let cache = Arc::new(SongCache::with_warning_sink(
            settings.cache_budget_bytes,
            Some(Box::new(move |warning| {
                let _ = events_for_cache.send(EngineEvent::CacheWarning {
                    kind: warning.kind().to_string(),
                    message: warning.to_string(),
                });
            })),
        ));
        let device_lost = Arc::new(AtomicBool::new(false));
        let mix = Arc::new(Mutex::new(MixMirror {
            master_gain: 1.0,
            ..MixMirror::default()
        }));
        let outbox = Arc::new(Mutex::new(VecDeque::new()));

        let (output_requests, output_receiver) = mpsc::channel();
        let output_thread = spawn_output_thread(shared.clone(), device_lost.clone(), output_receiver);

        let engine = Self {
            store: Mutex::new(store),
            cache,
            shared: shared.clone(),
            events: events.clone(),
            mix: mix.clone(),
            settings: Mutex::new(settings.clone()),
            preloaded: Mutex::new(HashMap::new()),
            outbox: outbox.clone(),
            output_requests: Mutex::new(output_requests),
            output_thread: Some(output_thread),
            pump_shutdown: Arc::new(AtomicBool::new(false)),
            pump_thread: None,
        };

        // Best-effort initial stream; library commands work without one.
        if let Err(err) = engine.reopen_output(&settings) {
            warn!("Engine: no output stream at startup: {}", err);
        }

        let mut engine = engine;
        engine.pump_thread = Some(spawn_event_pump(
            shared,
            events,
            mix,
            outbox,
            device_lost,
            engine.pump_shutdown.clone(),
        ));
        Ok(engine)
    }

    /// Subscribes to the engine's push events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    // --- playback ---

    /// Loads (or fetches from cache) a song, installs it in the mixer, and
    /// starts playback from the top.
    pub fn play_song(&self, song_id: &str) -> Result<(), EngineError> {
        let song = self.load_into_cache(song_id)?;

        let previous = {
            let mix = self.mix.lock().expect("mix mirror poisoned");
            mix.song_id.clone()
        };
        // Pin before unpinning the previous song so a same-song replay never
        // drops the pin.
        self.cache.pin(song_id);
        if let Some(previous) = previous {
            self.cache.unpin(&previous);
        }

        {
            let mut mix = self.mix.lock().expect("mix mirror poisoned");
            mix.stem_ids = song.stems.iter().map(|stem| stem.stem_id.clone()).collect();
            mix.stems = song
                .stems
                .iter()
                .map(|stem| StemMix {
                    gain: stem.default_gain.clamp(0.0, 1.0),
                    muted: stem.default_muted,
                    solo: false,
                })
                .collect();
            mix.song = Some(song.clone());
            mix.song_id = Some(song_id.to_string());
        }

        self.send_mixer(MixerCommand::LoadSong(song));
        self.send_mixer(MixerCommand::Play);
        Ok(())
    }

    pub fn pause_playback(&self) -> Result<(), EngineError> {
        self.require_song()?;
        self.send_mixer(MixerCommand::Pause);
        Ok(())
    }

    pub fn resume_playback(&self) -> Result<(), EngineError> {
        self.require_song()?;
        self.send_mixer(MixerCommand::Play);
        Ok(())
    }

    pub fn stop_playback(&self) -> Result<(), EngineError> {
        self.require_song()?;
        self.send_mixer(MixerCommand::Stop);
        Ok(())
    }

    pub fn seek_to_position(&self, seconds: f64) -> Result<(), EngineError> {
        self.require_song()?;
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(EngineError::InvalidSeekPosition { seconds });
        }
        let frame = (seconds * CANONICAL_SAMPLE_RATE as f64).round() as u64;
        self.send_mixer(MixerCommand::Seek { frame });
        Ok(())
    }

    /// Current transport position in seconds (frames are canonical-rate).
    pub fn current_position(&self) -> f64 {
        self.shared.position_frames() as f64 / CANONICAL_SAMPLE_RATE as f64
    }

    pub fn transport_state(&self) -> TransportState {
        self.shared.transport()
    }

    pub fn set_master_volume(&self, volume: f32) -> Result<(), EngineError> {
        let clamped = volume.clamp(0.0, 1.0);
        self.mix.lock().expect("mix mirror poisoned").master_gain = clamped;
        self.send_mixer(MixerCommand::SetMasterGain { gain: clamped });
        Ok(())
    }

    // --- stems ---

    pub fn set_stem_volume(&self, stem_id: &str, volume: f32) -> Result<(), EngineError> {
        let clamped = volume.clamp(0.0, 1.0);
        let stem = self.resolve_stem(stem_id, |mix, index| {
            mix.stems[index].gain = clamped;
            index
        })?;
        self.send_mixer(MixerCommand::SetStemGain {
            stem,
            gain: clamped,
        });
        Ok(())
    }

    /// Flips one stem's mute flag and returns the new state.
    pub fn toggle_stem_mute(&self, stem_id: &str) -> Result<bool, EngineError> {
        let mut muted = false;
        let stem = self.resolve_stem(stem_id, |mix, index| {
            mix.stems[index].muted = !mix.stems[index].muted;
            muted = mix.stems[index].muted;
            index
        })?;
        self.send_mixer(MixerCommand::SetStemMute { stem, muted });
        Ok(muted)
    }

    /// Flips one stem's solo flag and returns the new state.
    pub fn toggle_stem_solo(&self, stem_id: &str) -> Result<bool, EngineError> {
        let mut solo = false;
        let stem = self.resolve_stem(stem_id, |mix, index| {
            mix.stems[index].solo = !mix.stems[index].solo;
            solo = mix.stems[index].solo;
            index
        })?;
        self.send_mixer(MixerCommand::SetStemSolo { stem, solo });
        Ok(solo)
    }

    // --- library ---

    pub fn import_files(
        &self,
        paths: Vec<PathBuf>,
        title: String,
        artist: Option<String>,
        key: Option<String>,
        time_signature: Option<String>,
    ) -> Result<String, EngineError> {
        let request = ImportRequest {
            paths,
            title,
            artist,
            key,
            time_signature,
        };
        let mut store = self.store.lock().expect("store poisoned");
        import_manager::import_song(&mut store, &request, &|current, total| {
            let _ = self.events.send(EngineEvent::ImportProgress { current, total });
        })
    }

    pub fn get_all_songs(&self) -> Result<Vec<SongRecord>, EngineError> {
        self.store
            .lock()
            .expect("store poisoned")
            .get_all_songs(SongSort::Name)
    }

    pub fn get_song(&self, song_id: &str) -> Result<SongRecord, EngineError> {
        self.store.lock().expect("store poisoned").get_song(song_id)
    }

    pub fn get_song_stems(&self, song_id: &str) -> Result<Vec<StemRecord>, EngineError> {
        self.store
            .lock()
            .expect("store poisoned")
            .get_song_stems(song_id)
    }

    pub fn search_songs(&self, query: &str) -> Result<Vec<SongRecord>, EngineError> {
        self.store.lock().expect("store poisoned").search_songs(query)
    }

    pub fn filter_songs(&self, filter: &SongFilter) -> Result<Vec<SongRecord>, EngineError> {
        self.store.lock().expect("store poisoned").filter_songs(filter)
    }

    pub fn update_song_metadata(
        &self,
        song_id: &str,
        name: &str,
        artist: Option<&str>,
        key: Option<&str>,
        tempo: Option<f64>,
        time_signature: Option<&str>,
    ) -> Result<(), EngineError> {
        self.store
            .lock()
            .expect("store poisoned")
            .update_song_metadata(song_id, name, artist, key, tempo, time_signature)
    }

    /// Deletes a song everywhere: mixer (if active), cache, pins, store.
    pub fn delete_song(&self, song_id: &str) -> Result<(), EngineError> {
        let was_active = {
            let mut mix = self.mix.lock().expect("mix mirror poisoned");
            if mix.song_id.as_deref() == Some(song_id) {
                mix.song = None;
                mix.song_id = None;
                mix.stem_ids.clear();
                mix.stems.clear();
                true
            } else {
                false
            }
        };
        if was_active {
            self.send_mixer(MixerCommand::Unload);
            self.cache.unpin(song_id);
        }

        // Release any setlist-preload pins referencing this song.
        {
            let mut preloaded = self.preloaded.lock().expect("preload map poisoned");
            for songs in preloaded.values_mut() {
                let before = songs.len();
                songs.retain(|id| id != song_id);
                for _ in songs.len()..before {
                    self.cache.unpin(song_id);
                }
            }
        }

        self.cache.evict(song_id);
        self.store.lock().expect("store poisoned").delete_song(song_id)
    }

    // --- setlists ---

    pub fn create_setlist(&self, name: &str) -> Result<SetlistRecord, EngineError> {
        self.store.lock().expect("store poisoned").create_setlist(name)
    }

    pub fn get_setlist(&self, setlist_id: &str) -> Result<SetlistRecord, EngineError> {
        self.store.lock().expect("store poisoned").get_setlist(setlist_id)
    }

    pub fn get_all_setlists(&self) -> Result<Vec<SetlistRecord>, EngineError> {
        self.store.lock().expect("store poisoned").get_all_setlists()
    }

    pub fn update_setlist(
        &self,
        setlist_id: &str,
        name: &str,
        song_ids: &[String],
    ) -> Result<(), EngineError> {
        self.store
            .lock()
            .expect("store poisoned")
            .update_setlist(setlist_id, name, song_ids)
    }

    pub fn delete_setlist(&self, setlist_id: &str) -> Result<(), EngineError> {
        self.release_preload(setlist_id);
        self.store
            .lock()
            .expect("store poisoned")
            .delete_setlist(setlist_id)
    }

    pub fn add_song_to_setlist(&self, setlist_id: &str, song_id: &str) -> Result<(), EngineError> {
        self.store
            .lock()
            .expect("store poisoned")
            .add_song_to_setlist(setlist_id, song_id)
    }

    pub fn remove_song_from_setlist(
        &self,
        setlist_id: &str,
        song_id: &str,
    ) -> Result<(), EngineError> {
        self.store
            .lock()
            .expect("store poisoned")
            .remove_song_from_setlist(setlist_id, song_id)
    }

    pub fn reorder_setlist_songs(
        &self,
        setlist_id: &str,
        song_ids: &[String],
    ) -> Result<(), EngineError> {
        self.store
            .lock()
            .expect("store poisoned")
            .reorder_setlist_songs(setlist_id, song_ids)
    }

    /// Loads and pins every song of a setlist. A re-preload (or preloading a
    /// different setlist) releases the previous working set's pins first.
    pub fn preload_setlist(&self, setlist_id: &str) -> Result<(), EngineError> {
        let setlist = {
            let store = self.store.lock().expect("store poisoned");
            store.get_setlist(setlist_id)?
        };
        self.release_preload(setlist_id);

        let total = setlist.song_ids.len();
        let mut pinned = Vec::with_capacity(total);
        for (index, song_id) in setlist.song_ids.iter().enumerate() {
            match self.load_into_cache(song_id) {
                Ok(_) => {
                    self.cache.pin(song_id);
                    pinned.push(song_id.clone());
                    let _ = self.events.send(EngineEvent::PreloadProgress {
                        setlist_id: setlist_id.to_string(),
                        current: index + 1,
                        total,
                    });
                }
                Err(err) => {
                    // Roll back this preload's pins; earlier setlists keep theirs.
                    for song_id in &pinned {
                        self.cache.unpin(song_id);
                    }
                    return Err(err);
                }
            }
        }

        self.preloaded
            .lock()
            .expect("preload map poisoned")
            .insert(setlist_id.to_string(), pinned);
        let _ = self.events.send(EngineEvent::PreloadComplete {
            setlist_id: setlist_id.to_string(),
        });
        Ok(())
    }

    // --- audio configuration ---

    pub fn get_audio_devices(&self) -> Vec<String> {
        let (reply, response) = mpsc::channel();
        if self.send_output(OutputRequest::Enumerate { reply }) {
            response.recv().unwrap_or_default()
        } else {
            Vec::new()
        }
    }

    /// Switches the output stream to another device without touching
    /// transport state. On failure the previous stream keeps running.
    pub fn switch_audio_device(&self, device_name: Option<&str>) -> Result<(), EngineError> {
        let mut settings = self.settings.lock().expect("settings poisoned").clone();
        settings.output_device_name = device_name.map(str::to_string);
        let info = self.reopen_output(&settings)?;
        debug!("Engine: output switched to '{}'", info.device_name);
        self.persist_settings(settings)?;
        Ok(())
    }

    pub fn set_buffer_size(&self, frames: u32) -> Result<(), EngineError> {
        let mut settings = self.settings.lock().expect("settings poisoned").clone();
        settings.buffer_size_frames = frames.clamp(16, 16_384);
        self.reopen_output(&settings)?;
        self.persist_settings(settings)?;
        Ok(())
    }

    pub fn set_sample_rate(&self, sample_rate_hz: u32) -> Result<(), EngineError> {
        if !(8_000..=192_000).contains(&sample_rate_hz) {
            return Err(EngineError::SampleRateUnsupported {
                requested: sample_rate_hz,
            });
        }
        let mut settings = self.settings.lock().expect("settings poisoned").clone();
        settings.sample_rate_hz = sample_rate_hz;
        self.reopen_output(&settings)?;
        self.persist_settings(settings)?;
        Ok(())
    }

    pub fn get_audio_settings(&self) -> AudioSettings {
        self.settings.lock().expect("settings poisoned").clone()
    }

    // --- cache ---

    pub fn get_cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn set_cache_size(&self, bytes: u64) -> Result<(), EngineError> {
        self.cache.set_byte_budget(bytes);
        let mut settings = self.settings.lock().expect("settings poisoned").clone();
        settings.cache_budget_bytes = bytes;
        self.persist_settings(settings)?;
        Ok(())
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    // --- internals ---

    fn require_song(&self) -> Result<(), EngineError> {
        if self.mix.lock().expect("mix mirror poisoned").song.is_none() {
            return Err(EngineError::NoSongLoaded);
        }
        Ok(())
    }

    fn resolve_stem<F>(&self, stem_id: &str, apply: F) -> Result<usize, EngineError>
    where
        F: FnOnce(&mut MixMirror, usize) -> usize,
    {
        let mut mix = self.mix.lock().expect("mix mirror poisoned");
        if mix.song.is_none() {
            return Err(EngineError::NoSongLoaded);
        }
        match mix.stem_index(stem_id) {
            Some(index) => Ok(apply(&mut mix, index)),
            None => Err(EngineError::NotFound {
                entity: "stem",
                id: stem_id.to_string(),
            }),
        }
    }

    fn load_into_cache(&self, song_id: &str) -> Result<Arc<DecodedSong>, EngineError> {
        let stems: Vec<StemSource> = {
            let store = self.store.lock().expect("store poisoned");
            store
                .get_song_stems(song_id)?
                .into_iter()
                .map(|stem| StemSource {
                    stem_id: stem.id,
                    name: stem.name,
                    path: PathBuf::from(stem.file_path),
                    default_gain: stem.gain,
                    default_muted: stem.muted,
                })
                .collect()
        };
        // Import refuses wider songs; this guards libraries written before
        // that limit existed, before any decode work starts.
        if stems.len() > MAX_STEMS {
            return Err(EngineError::TooManyStems {
                count: stems.len(),
                max: MAX_STEMS,
            });
        }

        let events = self.events.clone();
        let id = song_id.to_string();
        self.cache.get_or_load(song_id, move |cancel| {
            let result = song_loader::load_song(&id, &stems, cancel, &|current, total| {
                let _ = events.send(EngineEvent::LoadProgress {
                    song_id: id.clone(),
                    current,
                    total,
                });
            });
            if result.is_ok() {
                let _ = events.send(EngineEvent::LoadComplete { song_id: id.clone() });
            }
            result
        })
    }

    fn release_preload(&self, setlist_id: &str) {
        let released = self
            .preloaded
            .lock()
            .expect("preload map poisoned")
            .remove(setlist_id);
        if let Some(song_ids) = released {
            for song_id in song_ids {
                self.cache.unpin(&song_id);
            }
        }
    }

    fn send_mixer(&self, command: MixerCommand) {
        let mut outbox = self.outbox.lock().expect("mixer outbox poisoned");
        // Direct push is only safe while nothing is staged, otherwise the
        // command would overtake earlier ones.
        if outbox.is_empty() {
            match self.shared.inbox.push(command) {
                Ok(()) => return,
                Err(command) => {
                    warn!("Engine: mixer inbox full, staging commands control-side");
                    stage_mixer_command(&mut outbox, command);
                }
            }
        } else {
            stage_mixer_command(&mut outbox, command);
        }
        flush_mixer_outbox(&mut outbox, &self.shared);
    }

    fn send_output(&self, request: OutputRequest) -> bool {
        self.output_requests
            .lock()
            .expect("output channel poisoned")
            .send(request)
            .is_ok()
    }

    fn reopen_output(&self, settings: &AudioSettings) -> Result<OutputStreamInfo, EngineError> {
        let seed = self.mix.lock().expect("mix mirror poisoned").seed();
        let (reply, response) = mpsc::channel();
        let sent = self.send_output(OutputRequest::Open {
            device_name: settings.output_device_name.clone(),
            sample_rate: settings.sample_rate_hz,
            buffer_frames: settings.buffer_size_frames,
            seed,
            reply,
        });
        if !sent {
            return Err(EngineError::DeviceUnavailable {
                name: "output thread".to_string(),
            });
        }
        response.recv().map_err(|_| EngineError::DeviceUnavailable {
            name: "output thread".to_string(),
        })?
    }

    fn persist_settings(&self, settings: AudioSettings) -> Result<(), EngineError> {
        self.store
            .lock()
            .expect("store poisoned")
            .set_audio_settings(&settings)?;
        *self.settings.lock().expect("settings poisoned") = settings;
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.pump_shutdown.store(true, Ordering::Relaxed);
        if let Some(pump) = self.pump_thread.take() {
            let _ = pump.join();
        }
        let _ = self.send_output(OutputRequest::Shutdown);
        if let Some(output) = self.output_thread.take() {
            let _ = output.join();
        }
    }
}

/// Adds a command to the staging queue. Repeated gain updates for one stem
/// collapse to the newest value; transport and every other command kind are
/// queued untouched, so overflow never costs a `Play`/`Stop`/`Seek`/
/// `LoadSong`.
fn stage_mixer_command(outbox: &mut VecDeque<MixerCommand>, command: MixerCommand) {
    if let MixerCommand::SetStemGain { stem, .. } = command {
        outbox.retain(|queued| {
            !matches!(queued, MixerCommand::SetStemGain { stem: queued_stem, .. }
                if *queued_stem == stem)
        });
    }
    outbox.push_back(command);
}

/// Moves staged commands into the lock-free inbox in submission order,
/// stopping at the first full push. Returns true when the stage is empty.
fn flush_mixer_outbox(outbox: &mut VecDeque<MixerCommand>, shared: &MixerShared) -> bool {
    while let Some(command) = outbox.pop_front() {
        if let Err(command) = shared.inbox.push(command) {
            outbox.push_front(command);
            return false;
        }
    }
    true
}

/// Output thread: the only place cpal streams live.
fn spawn_output_thread(
    shared: Arc<MixerShared>,
    device_lost: Arc<AtomicBool>,
    requests: mpsc::Receiver<OutputRequest>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("backline-output".to_string())
        .spawn(move || {
            let mut driver = OutputDriver::new(shared, device_lost);
            while let Ok(request) = requests.recv() {
                match request {
                    OutputRequest::Open {
                        device_name,
                        sample_rate,
                        buffer_frames,
                        seed,
                        reply,
                    } => {
                        let result =
                            driver.open(device_name.as_deref(), sample_rate, buffer_frames, seed);
                        let _ = reply.send(result);
                    }
                    OutputRequest::Enumerate { reply } => {
                        let _ = reply.send(OutputDriver::enumerate_devices());
                    }
                    OutputRequest::Shutdown => break,
                }
            }
            driver.stop();
        })
        .expect("output thread spawns")
}

/// Event pump: drains mixer telemetry into broadcast events, throttling
/// position to ~10 Hz and levels to ~20 Hz, retries staged mixer commands,
/// and watches for device loss.
fn spawn_event_pump(
    shared: Arc<MixerShared>,
    events: broadcast::Sender<EngineEvent>,
    mix: Arc<Mutex<MixMirror>>,
    outbox: Arc<Mutex<VecDeque<MixerCommand>>>,
    device_lost: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name("backline-events".to_string())
        .spawn(move || {
            let position_limit: DefaultDirectRateLimiter =
                RateLimiter::direct(Quota::per_second(NonZeroU32::new(10).expect("nonzero")));
            let levels_limit: DefaultDirectRateLimiter =
                RateLimiter::direct(Quota::per_second(NonZeroU32::new(20).expect("nonzero")));

            while !shutdown.load(Ordering::Relaxed) {
                {
                    let mut outbox = outbox.lock().expect("mixer outbox poisoned");
                    if !outbox.is_empty() {
                        flush_mixer_outbox(&mut outbox, &shared);
                    }
                }

                let mut latest_position: Option<u64> = None;
                let mut latest_levels: Option<([f32; MAX_STEMS], usize, f32)> = None;
                while let Some(telemetry) = shared.telemetry.pop() {
                    match telemetry {
                        MixerTelemetry::Position { frame, .. } => latest_position = Some(frame),
                        MixerTelemetry::State { state, .. } => {
                            let _ = events.send(EngineEvent::PlaybackState { state });
                        }
                        MixerTelemetry::Levels {
                            stem_peaks,
                            stem_count,
                            master_peak,
                            ..
                        } => latest_levels = Some((stem_peaks, stem_count, master_peak)),
                    }
                }

                if let Some(frame) = latest_position {
                    if position_limit.check().is_ok() {
                        let _ = events.send(EngineEvent::PlaybackPosition {
                            seconds: frame as f64 / CANONICAL_SAMPLE_RATE as f64,
                        });
                    }
                }
                if let Some((stem_peaks, stem_count, master_peak)) = latest_levels {
                    if levels_limit.check().is_ok() {
                        let stem_ids = {
                            let mix = mix.lock().expect("mix mirror poisoned");
                            mix.stem_ids.clone()
                        };
                        let stems = stem_ids
                            .into_iter()
                            .take(stem_count)
                            .enumerate()
                            .map(|(index, stem_id)| StemLevel {
                                stem_id,
                                peak: stem_peaks[index],
                            })
                            .collect();
                        let _ = events.send(EngineEvent::PlaybackLevels {
                            stems,
                            master: master_peak,
                        });
                    }
                }

                if device_lost.swap(false, Ordering::Relaxed) {
                    error!("Engine: output device lost; pausing transport");
                    shared.force_transport(TransportState::Paused);
                    let _ = events.send(EngineEvent::PlaybackState {
                        state: TransportState::Paused,
                    });
                    let _ = events.send(EngineEvent::AudioError {
                        kind: "DeviceDisconnected".to_string(),
                        message: "output device disconnected; transport paused".to_string(),
                    });
                }

                thread::sleep(PUMP_INTERVAL);
            }
        })
        .expect("event pump spawns")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CANONICAL_SAMPLE_RATE;
    use crate::error::EngineError;

    fn engine() -> Engine {
        let store = MetadataStore::new_in_memory().expect("store");
        Engine::with_store(store).expect("engine builds")
    }

    fn write_wav(path: &std::path::Path, frames: usize, seed: i16) {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: CANONICAL_SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).expect("create wav");
        for frame in 0..frames {
            let value = seed.wrapping_add((frame % 100) as i16);
            writer.write_sample(value).expect("write L");
            writer.write_sample(value).expect("write R");
        }
        writer.finalize().expect("finalize wav");
    }

    fn import_fixture(engine: &Engine, dir: &std::path::Path, title: &str, seed: i16) -> String {
        let vocals = dir.join(format!("{title}-vocals.wav"));
        let drums = dir.join(format!("{title}-drums.wav"));
        write_wav(&vocals, 4_800, seed);
        write_wav(&drums, 2_400, seed.wrapping_add(64));
        engine
            .import_files(
                vec![vocals, drums],
                title.to_string(),
                Some("Team".to_string()),
                Some("D".to_string()),
                Some("4/4".to_string()),
            )
            .expect("import succeeds")
    }

    #[test]
    fn test_import_then_query_library() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine();
        let song_id = import_fixture(&engine, dir.path(), "Oceans", 1);

        let songs = engine.get_all_songs().expect("list");
        assert_eq!(songs.len(), 1);
        assert_eq!(songs[0].id, song_id);

        let stems = engine.get_song_stems(&song_id).expect("stems");
        assert_eq!(stems.len(), 2);
        assert_eq!(stems[0].name, "Vocals");

        let hits = engine.search_songs("ocean").expect("search");
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_play_song_loads_pins_and_installs_mix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine();
        let song_id = import_fixture(&engine, dir.path(), "Cornerstone", 2);

        engine.play_song(&song_id).expect("play");
        let stats = engine.get_cache_stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.used_bytes, (4_800 + 2_400) * 2 * 4);

        // The active song is pinned: a zero budget cannot evict it.
        engine.set_cache_size(0).expect("budget");
        assert_eq!(engine.get_cache_stats().entries, 1);
    }

    #[test]
    fn test_playback_commands_without_song_fail() {
        let engine = engine();
        assert!(matches!(
            engine.pause_playback(),
            Err(EngineError::NoSongLoaded)
        ));
        assert!(matches!(
            engine.seek_to_position(1.0),
            Err(EngineError::NoSongLoaded)
        ));
        assert!(matches!(
            engine.set_stem_volume("nope", 0.5),
            Err(EngineError::NoSongLoaded)
        ));
    }

    #[test]
    fn test_seek_rejects_negative_and_non_finite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine();
        let song_id = import_fixture(&engine, dir.path(), "SeekMe", 3);
        engine.play_song(&song_id).expect("play");

        assert!(matches!(
            engine.seek_to_position(-1.0),
            Err(EngineError::InvalidSeekPosition { .. })
        ));
        assert!(matches!(
            engine.seek_to_position(f64::NAN),
            Err(EngineError::InvalidSeekPosition { .. })
        ));
        engine.seek_to_position(0.5).expect("valid seek");
    }

    #[test]
    fn test_toggle_stem_mute_twice_restores_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine();
        let song_id = import_fixture(&engine, dir.path(), "ToggleMe", 4);
        engine.play_song(&song_id).expect("play");
        let stems = engine.get_song_stems(&song_id).expect("stems");
        let stem_id = &stems[0].id;

        let first = engine.toggle_stem_mute(stem_id).expect("toggle on");
        let second = engine.toggle_stem_mute(stem_id).expect("toggle off");
        assert!(first);
        assert!(!second);

        assert!(matches!(
            engine.toggle_stem_mute("unknown-stem"),
            Err(EngineError::NotFound { entity: "stem", .. })
        ));
    }

    #[test]
    fn test_delete_song_unloads_and_evicts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine();
        let song_id = import_fixture(&engine, dir.path(), "DeleteMe", 5);
        engine.play_song(&song_id).expect("play");
        assert_eq!(engine.get_cache_stats().entries, 1);

        engine.delete_song(&song_id).expect("delete");
        assert_eq!(engine.get_cache_stats().entries, 0);
        assert!(engine.get_song(&song_id).is_err());
        assert!(matches!(
            engine.pause_playback(),
            Err(EngineError::NoSongLoaded)
        ));
    }

    #[test]
    fn test_preload_setlist_pins_all_members() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine();
        let first = import_fixture(&engine, dir.path(), "First", 6);
        let second = import_fixture(&engine, dir.path(), "Second", 7);
        let setlist = engine.create_setlist("Sunday").expect("setlist");
        engine
            .update_setlist(&setlist.id, "Sunday", &[first.clone(), second.clone()])
            .expect("members");

        let mut events = engine.subscribe();
        engine.preload_setlist(&setlist.id).expect("preload");
        assert_eq!(engine.get_cache_stats().entries, 2);

        // Preloaded songs are pinned: zero budget evicts nothing.
        engine.set_cache_size(0).expect("budget");
        assert_eq!(engine.get_cache_stats().entries, 2);

        let mut saw_progress = false;
        let mut saw_complete = false;
        while let Ok(event) = events.try_recv() {
            match event {
                EngineEvent::PreloadProgress { .. } => saw_progress = true,
                EngineEvent::PreloadComplete { .. } => saw_complete = true,
                _ => {}
            }
        }
        assert!(saw_progress);
        assert!(saw_complete);

        // Deleting the setlist releases its pins; the budget now bites.
        engine.delete_setlist(&setlist.id).expect("delete setlist");
        assert_eq!(engine.get_cache_stats().entries, 0);
    }

    #[test]
    fn test_load_events_are_emitted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine();
        let song_id = import_fixture(&engine, dir.path(), "Evented", 8);

        let mut events = engine.subscribe();
        engine.play_song(&song_id).expect("play");

        let mut progress = 0;
        let mut complete = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                EngineEvent::LoadProgress { song_id: id, .. } if id == song_id => progress += 1,
                EngineEvent::LoadComplete { song_id: id } if id == song_id => complete += 1,
                _ => {}
            }
        }
        assert_eq!(progress, 2);
        assert_eq!(complete, 1);
    }

    #[test]
    fn test_settings_persist_through_store() {
        let engine = engine();
        engine.set_cache_size(123_456).expect("cache size");
        assert_eq!(engine.get_audio_settings().cache_budget_bytes, 123_456);
        assert_eq!(engine.get_cache_stats().budget_bytes, 123_456);

        assert!(matches!(
            engine.set_sample_rate(1_000),
            Err(EngineError::SampleRateUnsupported { .. })
        ));
    }

    #[test]
    fn test_state_telemetry_reaches_subscribers() {
        let engine = engine();
        let mut events = engine.subscribe();
        let _ = engine.shared.telemetry.force_push(MixerTelemetry::State {
            state: TransportState::Playing,
            session: 0,
        });

        let mut saw_state = false;
        for _ in 0..20 {
            std::thread::sleep(Duration::from_millis(15));
            while let Ok(event) = events.try_recv() {
                if matches!(
                    event,
                    EngineEvent::PlaybackState {
                        state: TransportState::Playing
                    }
                ) {
                    saw_state = true;
                }
            }
            if saw_state {
                break;
            }
        }
        assert!(saw_state);
    }

    #[test]
    fn test_stage_coalesces_gain_updates_per_stem() {
        let mut outbox = VecDeque::new();
        stage_mixer_command(&mut outbox, MixerCommand::SetStemGain { stem: 0, gain: 0.1 });
        stage_mixer_command(&mut outbox, MixerCommand::SetStemGain { stem: 1, gain: 0.2 });
        stage_mixer_command(&mut outbox, MixerCommand::Play);
        stage_mixer_command(&mut outbox, MixerCommand::SetStemGain { stem: 0, gain: 0.9 });

        // Stem 0 keeps only its newest value; Play and stem 1 are untouched.
        assert_eq!(outbox.len(), 3);
        assert!(matches!(
            outbox[0],
            MixerCommand::SetStemGain { stem: 1, gain } if gain == 0.2
        ));
        assert!(matches!(outbox[1], MixerCommand::Play));
        assert!(matches!(
            outbox[2],
            MixerCommand::SetStemGain { stem: 0, gain } if gain == 0.9
        ));
    }

    #[test]
    fn test_overflow_never_displaces_transport_commands() {
        let shared = MixerShared::new();
        while shared
            .inbox
            .push(MixerCommand::SetMasterGain { gain: 0.5 })
            .is_ok()
        {}
        let queued_before = shared.inbox.len();

        let mut outbox = VecDeque::new();
        stage_mixer_command(&mut outbox, MixerCommand::Play);
        stage_mixer_command(&mut outbox, MixerCommand::Seek { frame: 480 });
        assert!(!flush_mixer_outbox(&mut outbox, &shared));

        // Nothing in the full ring was displaced; the stage holds both.
        assert_eq!(shared.inbox.len(), queued_before);
        assert_eq!(outbox.len(), 2);

        // Once the mixer drains some slots, the stage flushes in order.
        shared.inbox.pop();
        shared.inbox.pop();
        assert!(flush_mixer_outbox(&mut outbox, &shared));
        assert!(outbox.is_empty());
        let mut drained = Vec::new();
        while let Some(command) = shared.inbox.pop() {
            drained.push(command);
        }
        assert!(matches!(drained[drained.len() - 2], MixerCommand::Play));
        assert!(matches!(
            drained[drained.len() - 1],
            MixerCommand::Seek { frame: 480 }
        ));
    }

    #[test]
    fn test_play_song_rejects_wider_songs_than_the_mixer_mixes() {
        let engine = engine();
        let now = 1_700_000_000;
        let song = SongRecord {
            id: "wide".to_string(),
            name: "Wall of Sound".to_string(),
            artist: None,
            key: None,
            tempo: None,
            time_signature: None,
            duration_secs: 10.0,
            mixdown_path: None,
            created_at: now,
            updated_at: now,
        };
        // Inserted directly: import refuses this many files up front.
        let stems: Vec<StemRecord> = (0..MAX_STEMS + 1)
            .map(|index| StemRecord {
                id: format!("wide-stem-{index}"),
                song_id: "wide".to_string(),
                name: format!("Stem {index}"),
                file_path: format!("/audio/wide/{index}.wav"),
                file_size: 1_024,
                sample_rate: 48_000,
                channels: 2,
                duration_secs: 10.0,
                gain: 1.0,
                muted: false,
                position: index as u32,
            })
            .collect();
        let fingerprints: Vec<String> =
            (0..MAX_STEMS + 1).map(|index| format!("fp-wide-{index}")).collect();
        engine
            .store
            .lock()
            .expect("store poisoned")
            .insert_song_with_stems(&song, &stems, &fingerprints)
            .expect("insert succeeds");

        assert!(matches!(
            engine.play_song("wide"),
            Err(EngineError::TooManyStems { count, max })
                if count == MAX_STEMS + 1 && max == MAX_STEMS
        ));
        // Nothing was decoded or cached for the rejected song.
        assert_eq!(engine.get_cache_stats().entries, 0);
    }

    #[test]
    fn test_cache_warning_event_on_pinned_overflow() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine();
        let song_id = import_fixture(&engine, dir.path(), "Pinned", 9);
        engine.play_song(&song_id).expect("play");

        let mut events = engine.subscribe();
        engine.set_cache_size(16).expect("tiny budget");
        let mut saw_warning = false;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::CacheWarning { kind, .. } = event {
                assert_eq!(kind, "BudgetBelowPinnedSet");
                saw_warning = true;
            }
        }
        assert!(saw_warning);
    }
}
