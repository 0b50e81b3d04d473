//! SQLite-backed persistence for songs, stems, setlists, and settings.
//!
//! One on-disk database in the per-user data directory. Schema changes go
//! through numbered migrations, each applied exactly once and recorded in the
//! `migrations` table. Foreign keys cascade song deletion into stems and
//! setlist membership; uniqueness and value ranges are enforced by the schema
//! so no caller can persist an invalid row.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, warn};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::config::AudioSettings;
use crate::error::EngineError;
use crate::protocol::{SetlistRecord, SongFilter, SongRecord, SongSort, StemRecord};

struct Migration {
    id: i64,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        id: 1,
        name: "initial_schema",
        sql: "
            CREATE TABLE songs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                artist TEXT,
                song_key TEXT,
                tempo REAL CHECK (tempo IS NULL OR (tempo >= 20 AND tempo <= 300)),
                time_signature TEXT,
                duration_secs REAL NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE stems (
                id TEXT PRIMARY KEY,
                song_id TEXT NOT NULL REFERENCES songs(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                file_path TEXT NOT NULL UNIQUE,
                file_size INTEGER NOT NULL,
                sample_rate INTEGER NOT NULL CHECK (sample_rate BETWEEN 8000 AND 192000),
                channels INTEGER NOT NULL CHECK (channels IN (1, 2)),
                duration_secs REAL NOT NULL,
                gain REAL NOT NULL DEFAULT 1.0 CHECK (gain >= 0.0 AND gain <= 1.0),
                muted INTEGER NOT NULL DEFAULT 0,
                position INTEGER NOT NULL,
                fingerprint TEXT NOT NULL UNIQUE
            );
            CREATE INDEX idx_stems_song ON stems(song_id);
            CREATE TABLE setlists (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE setlist_items (
                setlist_id TEXT NOT NULL REFERENCES setlists(id) ON DELETE CASCADE,
                song_id TEXT NOT NULL REFERENCES songs(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                PRIMARY KEY (setlist_id, song_id),
                UNIQUE (setlist_id, position)
            );
            CREATE TABLE app_settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
        ",
    },
    Migration {
        id: 2,
        name: "song_mixdown_path",
        sql: "ALTER TABLE songs ADD COLUMN mixdown_path TEXT;",
    },
];

const SETTINGS_KEY: &str = "audio_settings";

fn now_unix_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

/// Database gateway for the song library.
///
/// Writes are serialized by the owning side (the engine keeps the store
/// behind one mutex); reads go through the same connection.
pub struct MetadataStore {
    conn: Connection,
}

impl MetadataStore {
    /// Opens (creating if needed) the on-disk database, verifies integrity,
    /// and applies pending migrations.
    pub fn new() -> Result<Self, EngineError> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| EngineError::StoreCorrupt {
                detail: "no per-user data directory available".to_string(),
            })?
            .join("backline");
        std::fs::create_dir_all(&data_dir)?;
        Self::open(data_dir.join("library.db"))
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        let conn = Connection::open(path)?;
        Self::initialize(conn)
    }

    /// In-memory database for tests.
    pub fn new_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn)
    }

    fn initialize(conn: Connection) -> Result<Self, EngineError> {
        conn.pragma_update(None, "foreign_keys", true)?;
        let verdict: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        if verdict != "ok" {
            warn!("MetadataStore: integrity check failed: {}", verdict);
            return Err(EngineError::StoreCorrupt { detail: verdict });
        }
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), EngineError> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS migrations (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at INTEGER NOT NULL
            )",
            [],
        )?;
        for migration in MIGRATIONS {
            let applied: Option<i64> = self
                .conn
                .query_row(
                    "SELECT id FROM migrations WHERE id = ?1",
                    params![migration.id],
                    |row| row.get(0),
                )
                .optional()?;
            if applied.is_some() {
                continue;
            }
            debug!(
                "MetadataStore: applying migration {} ({})",
                migration.id, migration.name
            );
            self.conn.execute_batch(migration.sql)?;
            self.conn.execute(
                "INSERT INTO migrations (id, name, applied_at) VALUES (?1, ?2, ?3)",
                params![migration.id, migration.name, now_unix_secs()],
            )?;
        }
        Ok(())
    }

    // --- songs ---

    /// Persists a song and all of its stems in one transaction. Any failing
    /// row rolls back the whole insert.
    pub fn insert_song_with_stems(
        &mut self,
        song: &SongRecord,
        stems: &[StemRecord],
        fingerprints: &[String],
    ) -> Result<(), EngineError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO songs (id, name, artist, song_key, tempo, time_signature,
                                duration_secs, mixdown_path, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                song.id,
                song.name,
                song.artist,
                song.key,
                song.tempo,
                song.time_signature,
                song.duration_secs,
                song.mixdown_path,
                song.created_at,
                song.updated_at,
            ],
        )?;
        for (stem, fingerprint) in stems.iter().zip(fingerprints) {
            tx.execute(
                "INSERT INTO stems (id, song_id, name, file_path, file_size, sample_rate,
                                    channels, duration_secs, gain, muted, position, fingerprint)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    stem.id,
                    stem.song_id,
                    stem.name,
                    stem.file_path,
                    stem.file_size as i64,
                    stem.sample_rate,
                    stem.channels,
                    stem.duration_secs,
                    stem.gain,
                    stem.muted,
                    stem.position,
                    fingerprint,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_song(&self, song_id: &str) -> Result<SongRecord, EngineError> {
        self.conn
            .query_row(
                &format!("{SONG_SELECT} WHERE id = ?1"),
                params![song_id],
                song_from_row,
            )
            .optional()?
            .ok_or_else(|| EngineError::NotFound {
                entity: "song",
                id: song_id.to_string(),
            })
    }

    pub fn get_all_songs(&self, sort: SongSort) -> Result<Vec<SongRecord>, EngineError> {
        let sql = format!("{SONG_SELECT} ORDER BY {}", sort_clause(sort));
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], song_from_row)?;
        collect_rows(rows)
    }

    /// Substring search over song name and artist.
    pub fn search_songs(&self, query: &str) -> Result<Vec<SongRecord>, EngineError> {
        let pattern = format!("%{}%", query.trim());
        let sql = format!(
            "{SONG_SELECT} WHERE name LIKE ?1 OR artist LIKE ?1 ORDER BY {}",
            sort_clause(SongSort::Name)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![pattern], song_from_row)?;
        collect_rows(rows)
    }

    /// Combined text/tempo/key filter with a caller-chosen sort order.
    pub fn filter_songs(&self, filter: &SongFilter) -> Result<Vec<SongRecord>, EngineError> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(query) = filter.query.as_ref().filter(|query| !query.trim().is_empty()) {
            values.push(Box::new(format!("%{}%", query.trim())));
            let index = values.len();
            clauses.push(format!("(name LIKE ?{index} OR artist LIKE ?{index})"));
        }
        if let Some(tempo_min) = filter.tempo_min {
            values.push(Box::new(tempo_min));
            clauses.push(format!("tempo >= ?{}", values.len()));
        }
        if let Some(tempo_max) = filter.tempo_max {
            values.push(Box::new(tempo_max));
            clauses.push(format!("tempo <= ?{}", values.len()));
        }
        if let Some(key) = filter.key.as_ref().filter(|key| !key.trim().is_empty()) {
            values.push(Box::new(key.trim().to_string()));
            clauses.push(format!("song_key = ?{}", values.len()));
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "{SONG_SELECT}{where_clause} ORDER BY {}",
            sort_clause(filter.sort_by)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let params = rusqlite::params_from_iter(values.iter().map(|value| value.as_ref()));
        let rows = stmt.query_map(params, song_from_row)?;
        collect_rows(rows)
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
        let updated = self.conn.execute(
            "UPDATE songs SET name = ?1, artist = ?2, song_key = ?3, tempo = ?4,
                              time_signature = ?5, updated_at = ?6
             WHERE id = ?7",
            params![name, artist, key, tempo, time_signature, now_unix_secs(), song_id],
        )?;
        if updated == 0 {
            return Err(EngineError::NotFound {
                entity: "song",
                id: song_id.to_string(),
            });
        }
        Ok(())
    }

    /// Deletes a song; stems and setlist memberships cascade.
    pub fn delete_song(&self, song_id: &str) -> Result<(), EngineError> {
        let deleted = self
            .conn
            .execute("DELETE FROM songs WHERE id = ?1", params![song_id])?;
        if deleted == 0 {
            return Err(EngineError::NotFound {
                entity: "song",
                id: song_id.to_string(),
            });
        }
        Ok(())
    }

    // --- stems ---

    pub fn get_song_stems(&self, song_id: &str) -> Result<Vec<StemRecord>, EngineError> {
        // Distinguish "no stems" from "no song".
        self.get_song(song_id)?;
        let mut stmt = self.conn.prepare(
            "SELECT id, song_id, name, file_path, file_size, sample_rate, channels,
                    duration_secs, gain, muted, position
             FROM stems WHERE song_id = ?1 ORDER BY position ASC",
        )?;
        let rows = stmt.query_map(params![song_id], stem_from_row)?;
        collect_rows(rows)
    }

    /// True when a source fingerprint is already known to the library.
    pub fn fingerprint_exists(&self, fingerprint: &str) -> Result<bool, EngineError> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM stems WHERE fingerprint = ?1",
                params![fingerprint],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // --- setlists ---

    pub fn create_setlist(&self, name: &str) -> Result<SetlistRecord, EngineError> {
        let now = now_unix_secs();
        let id = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO setlists (id, name, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, name, now, now],
        )?;
        Ok(SetlistRecord {
            id,
            name: name.to_string(),
            song_ids: Vec::new(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_setlist(&self, setlist_id: &str) -> Result<SetlistRecord, EngineError> {
        let header = self
            .conn
            .query_row(
                "SELECT id, name, created_at, updated_at FROM setlists WHERE id = ?1",
                params![setlist_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| EngineError::NotFound {
                entity: "setlist",
                id: setlist_id.to_string(),
            })?;

        let mut stmt = self.conn.prepare(
            "SELECT song_id FROM setlist_items WHERE setlist_id = ?1 ORDER BY position ASC",
        )?;
        let rows = stmt.query_map(params![setlist_id], |row| row.get::<_, String>(0))?;
        let song_ids = collect_rows(rows)?;
        Ok(SetlistRecord {
            id: header.0,
            name: header.1,
            song_ids,
            created_at: header.2,
            updated_at: header.3,
        })
    }

    pub fn get_all_setlists(&self) -> Result<Vec<SetlistRecord>, EngineError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM setlists ORDER BY name ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let ids = collect_rows(rows)?;
        ids.iter().map(|id| self.get_setlist(id)).collect()
    }

    /// Renames a setlist and atomically replaces its membership/order.
    pub fn update_setlist(
        &mut self,
        setlist_id: &str,
        name: &str,
        song_ids: &[String],
    ) -> Result<(), EngineError> {
        let tx = self.conn.transaction()?;
        let updated = tx.execute(
            "UPDATE setlists SET name = ?1, updated_at = ?2 WHERE id = ?3",
            params![name, now_unix_secs(), setlist_id],
        )?;
        if updated == 0 {
            return Err(EngineError::NotFound {
                entity: "setlist",
                id: setlist_id.to_string(),
            });
        }
        tx.execute(
            "DELETE FROM setlist_items WHERE setlist_id = ?1",
            params![setlist_id],
        )?;
        for (position, song_id) in song_ids.iter().enumerate() {
            tx.execute(
                "INSERT INTO setlist_items (setlist_id, song_id, position) VALUES (?1, ?2, ?3)",
                params![setlist_id, song_id, position as i64],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn delete_setlist(&self, setlist_id: &str) -> Result<(), EngineError> {
        let deleted = self
            .conn
            .execute("DELETE FROM setlists WHERE id = ?1", params![setlist_id])?;
        if deleted == 0 {
            return Err(EngineError::NotFound {
                entity: "setlist",
                id: setlist_id.to_string(),
            });
        }
        Ok(())
    }

    /// Appends a song at the end of a setlist.
    pub fn add_song_to_setlist(
        &self,
        setlist_id: &str,
        song_id: &str,
    ) -> Result<(), EngineError> {
        // Surface NotFound rather than bare FK failures.
        self.get_song(song_id)?;
        let setlist_exists: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM setlists WHERE id = ?1",
                params![setlist_id],
                |row| row.get(0),
            )
            .optional()?;
        if setlist_exists.is_none() {
            return Err(EngineError::NotFound {
                entity: "setlist",
                id: setlist_id.to_string(),
            });
        }
        let next_position: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM setlist_items WHERE setlist_id = ?1",
            params![setlist_id],
            |row| row.get(0),
        )?;
        self.conn.execute(
            "INSERT INTO setlist_items (setlist_id, song_id, position) VALUES (?1, ?2, ?3)",
            params![setlist_id, song_id, next_position],
        )?;
        self.touch_setlist(setlist_id)?;
        Ok(())
    }

    /// Removes a song and re-compacts positions in one transaction.
    pub fn remove_song_from_setlist(
        &mut self,
        setlist_id: &str,
        song_id: &str,
    ) -> Result<(), EngineError> {
        let remaining = {
            let tx = self.conn.transaction()?;
            let removed = tx.execute(
                "DELETE FROM setlist_items WHERE setlist_id = ?1 AND song_id = ?2",
                params![setlist_id, song_id],
            )?;
            if removed == 0 {
                return Err(EngineError::NotFound {
                    entity: "setlist song",
                    id: song_id.to_string(),
                });
            }
            let remaining: Vec<String> = {
                let mut stmt = tx.prepare(
                    "SELECT song_id FROM setlist_items WHERE setlist_id = ?1 ORDER BY position ASC",
                )?;
                let rows = stmt.query_map(params![setlist_id], |row| row.get::<_, String>(0))?;
                collect_rows(rows)?
            };
            tx.execute(
                "DELETE FROM setlist_items WHERE setlist_id = ?1",
                params![setlist_id],
            )?;
            for (position, id) in remaining.iter().enumerate() {
                tx.execute(
                    "INSERT INTO setlist_items (setlist_id, song_id, position) VALUES (?1, ?2, ?3)",
                    params![setlist_id, id, position as i64],
                )?;
            }
            tx.commit()?;
            remaining
        };
        debug!(
            "MetadataStore: removed song {} from setlist {} ({} remain)",
            song_id,
            setlist_id,
            remaining.len()
        );
        self.touch_setlist(setlist_id)?;
        Ok(())
    }

    /// Atomically rewrites a setlist's order. `song_ids` must be a
    /// permutation of the current membership.
    pub fn reorder_setlist_songs(
        &mut self,
        setlist_id: &str,
        song_ids: &[String],
    ) -> Result<(), EngineError> {
        let current = self.get_setlist(setlist_id)?.song_ids;
        let mut expected = current.clone();
        expected.sort();
        let mut proposed = song_ids.to_vec();
        proposed.sort();
        if expected != proposed {
            return Err(EngineError::NotFound {
                entity: "setlist song",
                id: format!("reorder of {setlist_id} must permute its current songs"),
            });
        }

        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM setlist_items WHERE setlist_id = ?1",
            params![setlist_id],
        )?;
        for (position, song_id) in song_ids.iter().enumerate() {
            tx.execute(
                "INSERT INTO setlist_items (setlist_id, song_id, position) VALUES (?1, ?2, ?3)",
                params![setlist_id, song_id, position as i64],
            )?;
        }
        tx.execute(
            "UPDATE setlists SET updated_at = ?1 WHERE id = ?2",
            params![now_unix_secs(), setlist_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn touch_setlist(&self, setlist_id: &str) -> Result<(), EngineError> {
        self.conn.execute(
            "UPDATE setlists SET updated_at = ?1 WHERE id = ?2",
            params![now_unix_secs(), setlist_id],
        )?;
        Ok(())
    }

    // --- settings ---

    pub fn get_audio_settings(&self) -> Result<AudioSettings, EngineError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM app_settings WHERE key = ?1",
                params![SETTINGS_KEY],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(settings) => Ok(settings),
                Err(err) => {
                    warn!("MetadataStore: discarding unreadable settings: {}", err);
                    Ok(AudioSettings::default())
                }
            },
            None => Ok(AudioSettings::default()),
        }
    }

    pub fn set_audio_settings(&self, settings: &AudioSettings) -> Result<(), EngineError> {
        let serialized = serde_json::to_string(settings).map_err(|err| {
            EngineError::StoreCorrupt {
                detail: format!("settings serialization failed: {err}"),
            }
        })?;
        self.conn.execute(
            "INSERT INTO app_settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![SETTINGS_KEY, serialized],
        )?;
        Ok(())
    }
}

const SONG_SELECT: &str = "SELECT id, name, artist, song_key, tempo, time_signature,
                                  duration_secs, mixdown_path, created_at, updated_at
                           FROM songs";

fn sort_clause(sort: SongSort) -> &'static str {
    match sort {
        SongSort::Name => "name COLLATE NOCASE ASC",
        SongSort::Artist => "artist COLLATE NOCASE ASC, name COLLATE NOCASE ASC",
        SongSort::Tempo => "tempo ASC, name COLLATE NOCASE ASC",
        SongSort::Duration => "duration_secs ASC, name COLLATE NOCASE ASC",
        SongSort::DateAdded => "created_at DESC, name COLLATE NOCASE ASC",
    }
}

fn song_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SongRecord> {
    Ok(SongRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        artist: row.get(2)?,
        key: row.get(3)?,
        tempo: row.get(4)?,
        time_signature: row.get(5)?,
        duration_secs: row.get(6)?,
        mixdown_path: row.get(7)?,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
    })
}

fn stem_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StemRecord> {
    Ok(StemRecord {
        id: row.get(0)?,
        song_id: row.get(1)?,
        name: row.get(2)?,
        file_path: row.get(3)?,
        file_size: row.get::<_, i64>(4)? as u64,
        sample_rate: row.get(5)?,
        channels: row.get(6)?,
        duration_secs: row.get(7)?,
        gain: row.get(8)?,
        muted: row.get(9)?,
        position: row.get(10)?,
    })
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> Result<Vec<T>, EngineError> {
    let mut collected = Vec::new();
    for row in rows {
        collected.push(row?);
    }
    Ok(collected)
}

/// Default on-disk database location, exposed for diagnostics.
pub fn default_db_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("backline").join("library.db"))
}
