//! Byte-bounded LRU cache of decoded songs.
//!
//! Holds shared references to [`DecodedSong`]s, tracks recency through
//! `get_or_load`, and evicts least-recently-used unpinned entries when the
//! byte budget is exceeded. Pinned entries (the active song, preloaded
//! setlists) are never evicted; if pins alone push usage past the budget the
//! cache stays over budget and reports a warning instead.
//!
//! Concurrent misses for the same song coalesce onto one in-flight decode:
//! later callers block on the first caller's ticket and receive the same
//! `Arc`. Only control threads touch the cache; the audio callback holds its
//! own `Arc` to the active song and never comes near this mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use log::{debug, warn};
use lru::LruCache;

use crate::audio::DecodedSong;
use crate::error::{DecodeError, EngineError, SongLoadError};

/// Snapshot returned by [`SongCache::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub used_bytes: u64,
    pub budget_bytes: u64,
}

/// Callback invoked for non-fatal cache conditions (budget below pinned set).
pub type WarningSink = dyn Fn(&EngineError) + Send + Sync;

/// One in-flight load that later callers can wait on.
struct LoadTicket {
    result: Mutex<Option<Result<Arc<DecodedSong>, SongLoadError>>>,
    ready: Condvar,
    /// Polled by the loader between stems.
    cancel: AtomicBool,
}

impl LoadTicket {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            ready: Condvar::new(),
            cancel: AtomicBool::new(false),
        }
    }

    fn wait(&self) -> Result<Arc<DecodedSong>, SongLoadError> {
        let mut guard = self.result.lock().expect("load ticket poisoned");
        while guard.is_none() {
            guard = self.ready.wait(guard).expect("load ticket poisoned");
        }
        guard.as_ref().expect("checked above").clone()
    }

    fn fulfill(&self, result: Result<Arc<DecodedSong>, SongLoadError>) {
        let mut guard = self.result.lock().expect("load ticket poisoned");
        *guard = Some(result);
        self.ready.notify_all();
    }
}

struct CacheState {
    entries: LruCache<String, Arc<DecodedSong>>,
    in_flight: HashMap<String, Arc<LoadTicket>>,
    pins: HashMap<String, usize>,
    used_bytes: u64,
    budget_bytes: u64,
    /// Set while usage exceeds budget so the warning fires once per episode.
    over_budget_warned: bool,
}

impl CacheState {
    fn pinned(&self, song_id: &str) -> bool {
        self.pins.contains_key(song_id)
    }

    fn pinned_bytes(&self) -> u64 {
        self.entries
            .iter()
            .filter(|(id, _)| self.pins.contains_key(id.as_str()))
            .map(|(_, song)| song.bytes)
            .sum()
    }

    /// Evicts unpinned entries tail-first until usage fits the budget.
    /// `keep` (the entry being returned to a caller right now) survives the
    /// pass even when unpinned.
    fn evict_to_budget(&mut self, keep: Option<&str>) -> Option<EngineError> {
        if self.used_bytes > self.budget_bytes {
            // iter() yields MRU first; walk the reverse for the LRU tail.
            let mut victims: Vec<String> = self
                .entries
                .iter()
                .map(|(id, _)| id.clone())
                .filter(|id| !self.pinned(id) && Some(id.as_str()) != keep)
                .collect();
            victims.reverse();
            for victim in victims {
                if self.used_bytes <= self.budget_bytes {
                    break;
                }
                if let Some(song) = self.entries.pop(&victim) {
                    self.used_bytes = self.used_bytes.saturating_sub(song.bytes);
                    debug!(
                        "SongCache: evicted song {} ({} bytes), used now {} bytes",
                        victim, song.bytes, self.used_bytes
                    );
                }
            }
        }

        if self.used_bytes <= self.budget_bytes {
            self.over_budget_warned = false;
            return None;
        }
        if self.over_budget_warned {
            return None;
        }
        self.over_budget_warned = true;
        let warning = EngineError::BudgetBelowPinnedSet {
            budget_bytes: self.budget_bytes,
            pinned_bytes: self.pinned_bytes(),
        };
        warn!("SongCache: {}", warning);
        Some(warning)
    }
}

/// Byte-bounded LRU over decoded songs with pinning and load coalescing.
pub struct SongCache {
    state: Mutex<CacheState>,
    warning_sink: Option<Box<WarningSink>>,
}

impl SongCache {
    pub fn new(budget_bytes: u64) -> Self {
        Self::with_warning_sink(budget_bytes, None)
    }

    pub fn with_warning_sink(budget_bytes: u64, warning_sink: Option<Box<WarningSink>>) -> Self {
        Self {
            state: Mutex::new(CacheState {
                // The LRU is unbounded by entry count; bytes are the budget.
                entries: LruCache::unbounded(),
                in_flight: HashMap::new(),
                pins: HashMap::new(),
                used_bytes: 0,
                budget_bytes,
                over_budget_warned: false,
            }),
            warning_sink,
        }
    }

    fn emit_warning(&self, warning: Option<EngineError>) {
        if let (Some(warning), Some(sink)) = (warning, self.warning_sink.as_ref()) {
            sink(&warning);
        }
    }

    /// Returns the cached song (promoting it) or decodes it via `load`.
    ///
    /// `load` runs outside the cache lock; concurrent callers for the same id
    /// block until the first caller finishes and observe the same `Arc`.
    pub fn get_or_load<F>(&self, song_id: &str, load: F) -> Result<Arc<DecodedSong>, EngineError>
    where
        F: FnOnce(&AtomicBool) -> Result<DecodedSong, SongLoadError>,
    {
        let ticket = {
            let mut state = self.state.lock().expect("cache lock poisoned");
            if let Some(song) = state.entries.get(song_id) {
                return Ok(song.clone());
            }
            if let Some(ticket) = state.in_flight.get(song_id) {
                let ticket = ticket.clone();
                drop(state);
                return ticket.wait().map_err(EngineError::from);
            }
            let ticket = Arc::new(LoadTicket::new());
            state.in_flight.insert(song_id.to_string(), ticket.clone());
            ticket
        };

        let loaded = load(&ticket.cancel);
        let outcome = {
            let mut state = self.state.lock().expect("cache lock poisoned");
            state.in_flight.remove(song_id);
            match loaded {
                Ok(song) if ticket.cancel.load(Ordering::Relaxed) => {
                    drop(song);
                    Err(SongLoadError {
                        song_id: song_id.to_string(),
                        first_error: DecodeError::Cancelled,
                    })
                }
                Ok(song) => {
                    let song = Arc::new(song);
                    state.used_bytes += song.bytes;
                    state.entries.put(song_id.to_string(), song.clone());
                    let warning = state.evict_to_budget(Some(song_id));
                    drop(state);
                    self.emit_warning(warning);
                    Ok(song)
                }
                Err(err) => Err(err),
            }
        };

        ticket.fulfill(outcome.clone());
        outcome.map_err(EngineError::from)
    }

    /// Returns the cached song without loading or promoting it.
    pub fn peek(&self, song_id: &str) -> Option<Arc<DecodedSong>> {
        let state = self.state.lock().expect("cache lock poisoned");
        state.entries.peek(song_id).cloned()
    }

    /// Marks an entry as unevictable. Pins nest; each `pin` needs an `unpin`.
    pub fn pin(&self, song_id: &str) {
        let mut state = self.state.lock().expect("cache lock poisoned");
        *state.pins.entry(song_id.to_string()).or_insert(0) += 1;
    }

    pub fn unpin(&self, song_id: &str) {
        let warning = {
            let mut state = self.state.lock().expect("cache lock poisoned");
            if let Some(count) = state.pins.get_mut(song_id) {
                *count -= 1;
                if *count == 0 {
                    state.pins.remove(song_id);
                }
            }
            state.evict_to_budget(None)
        };
        self.emit_warning(warning);
    }

    /// Updates the byte budget and immediately enforces it.
    pub fn set_byte_budget(&self, budget_bytes: u64) {
        let warning = {
            let mut state = self.state.lock().expect("cache lock poisoned");
            state.budget_bytes = budget_bytes;
            state.evict_to_budget(None)
        };
        self.emit_warning(warning);
    }

    /// Drops one entry (if unpinned) and cancels any in-flight load for it.
    /// Used when a song is deleted from the library.
    pub fn evict(&self, song_id: &str) {
        let mut state = self.state.lock().expect("cache lock poisoned");
        if let Some(ticket) = state.in_flight.get(song_id) {
            ticket.cancel.store(true, Ordering::Relaxed);
        }
        if state.pinned(song_id) {
            return;
        }
        if let Some(song) = state.entries.pop(song_id) {
            state.used_bytes = state.used_bytes.saturating_sub(song.bytes);
        }
        if state.used_bytes <= state.budget_bytes {
            state.over_budget_warned = false;
        }
    }

    /// Evicts every unpinned entry and cancels unpinned in-flight loads.
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("cache lock poisoned");
        for (id, ticket) in state.in_flight.iter() {
            if !state.pins.contains_key(id) {
                ticket.cancel.store(true, Ordering::Relaxed);
            }
        }
        let victims: Vec<String> = state
            .entries
            .iter()
            .map(|(id, _)| id.clone())
            .filter(|id| !state.pinned(id))
            .collect();
        for victim in victims {
            if let Some(song) = state.entries.pop(&victim) {
                state.used_bytes = state.used_bytes.saturating_sub(song.bytes);
            }
        }
        if state.used_bytes <= state.budget_bytes {
            state.over_budget_warned = false;
        }
        debug!("SongCache: cleared, {} bytes still pinned", state.used_bytes);
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock().expect("cache lock poisoned");
        CacheStats {
            entries: state.entries.len(),
            used_bytes: state.used_bytes,
            budget_bytes: state.budget_bytes,
        }
    }
}
