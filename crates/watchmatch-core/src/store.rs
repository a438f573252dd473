use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info};
use watchmatch_models::{
    Friend, FriendId, GenerationId, JobState, MovieMetadata, NormalizedKey, RawEntry, SyncJob, WatchlistEntry,
};
use crate::normalize::normalize_entry;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Corrupt row in {table}: {message}")]
    Corrupt { table: &'static str, message: String },

    #[error("Store worker failed: {0}")]
    Worker(String),
}

/// A watchlist row ready to be committed
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEntry {
    pub key: NormalizedKey,
    pub raw_title: String,
    pub year: Option<u16>,
}

impl NormalizedEntry {
    pub fn from_raw(entry: &RawEntry) -> Self {
        Self {
            key: normalize_entry(entry),
            raw_title: entry.title.clone(),
            year: entry.year,
        }
    }
}

/// One row of `sync_job_history`
#[derive(Debug, Clone, Serialize)]
pub struct JobHistoryRow {
    pub batch_id: String,
    pub friend_id: FriendId,
    pub generation_id: Option<GenerationId>,
    pub outcome: JobState,
    pub pages_fetched: u32,
    pub entries_found: usize,
    pub error: Option<String>,
    pub reused_cached: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct StoreStats {
    pub primary_user: Option<String>,
    pub friends: usize,
    pub watchlist_entries: usize,
    pub metadata_cached: usize,
    pub metadata_not_found: usize,
    pub metadata_expired: usize,
    pub job_history: usize,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS friends (
    id TEXT PRIMARY KEY,
    handle TEXT NOT NULL,
    display_name TEXT NOT NULL,
    is_primary INTEGER NOT NULL DEFAULT 0,
    last_synced_at TEXT,
    sync_state TEXT
);

CREATE TABLE IF NOT EXISTS watchlist_entries (
    friend_id TEXT NOT NULL,
    normalized_key TEXT NOT NULL,
    generation_id INTEGER NOT NULL,
    raw_title TEXT NOT NULL,
    year INTEGER,
    PRIMARY KEY (friend_id, normalized_key, generation_id)
);

CREATE TABLE IF NOT EXISTS current_generation (
    friend_id TEXT PRIMARY KEY,
    generation_id INTEGER NOT NULL,
    committed_at TEXT NOT NULL,
    entry_count INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS metadata_cache (
    normalized_key TEXT PRIMARY KEY,
    external_id INTEGER,
    title TEXT,
    poster_url TEXT,
    rating REAL,
    overview TEXT,
    release_date TEXT,
    runtime_minutes INTEGER,
    genres TEXT,
    director TEXT,
    fetched_at TEXT NOT NULL,
    ttl_expires_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_job_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    batch_id TEXT NOT NULL,
    friend_id TEXT NOT NULL,
    generation_id INTEGER,
    outcome TEXT NOT NULL,
    pages_fetched INTEGER NOT NULL,
    entries_found INTEGER NOT NULL,
    error TEXT,
    reused_cached INTEGER NOT NULL DEFAULT 0,
    started_at TEXT,
    finished_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_job_history_friend ON sync_job_history (friend_id, id);
";

/// SQLite-backed persistent store.
///
/// A friend's watchlist is stored as numbered generations; the
/// `current_generation` table points at the committed one. Readers always
/// join through that pointer, and [`Store::replace_watchlist`] inserts the new
/// generation, moves the pointer and drops the old rows in one `IMMEDIATE`
/// transaction, so a half-written generation is never visible.
///
/// The connection sits behind a mutex; async callers go through
/// [`Store::call`] to keep SQLite work off the runtime threads.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(StoreError::CreateDir)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Self::migrate(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Bring databases created before the details columns existed up to date
    fn migrate(conn: &Connection) -> Result<(), StoreError> {
        for (column, kind) in [("runtime_minutes", "INTEGER"), ("genres", "TEXT"), ("director", "TEXT")] {
            let present = conn
                .prepare(&format!("SELECT {} FROM metadata_cache LIMIT 0", column))
                .is_ok();
            if !present {
                conn.execute_batch(&format!("ALTER TABLE metadata_cache ADD COLUMN {} {};", column, kind))?;
                info!(operation = "migrate", table = "metadata_cache", column, "Added column");
            }
        }
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // Every write runs inside a transaction that is rolled back on error, so a
        // poisoned lock still guards a consistent database
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run blocking store work on the blocking thread pool
    pub async fn call<T, F>(self: &Arc<Self>, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Store) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StoreError::Worker(e.to_string()))?
    }

    /// Execute `f` within a SQLite transaction. Commits on Ok, rolls back on Err.
    fn with_transaction<T, F>(conn: &Connection, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(conn) {
            Ok(value) => {
                conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    // Friends

    pub fn upsert_friend(&self, friend: &Friend) -> Result<(), StoreError> {
        self.upsert_friends(std::slice::from_ref(friend))
    }

    /// Insert or rename friends; sync bookkeeping on existing rows is kept
    pub fn upsert_friends(&self, friends: &[Friend]) -> Result<(), StoreError> {
        let conn = self.conn();
        Self::with_transaction(&conn, |conn| {
            let mut stmt = conn.prepare(
                "INSERT INTO friends (id, handle, display_name) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET handle = excluded.handle, display_name = excluded.display_name",
            )?;
            for friend in friends {
                stmt.execute(params![friend.id.as_str(), friend.handle, friend.display_name])?;
            }
            Ok(())
        })
    }

    /// Record `friend` as the primary user (the account every friend is compared against)
    pub fn set_primary_user(&self, friend: &Friend) -> Result<(), StoreError> {
        let conn = self.conn();
        Self::with_transaction(&conn, |conn| {
            conn.execute("UPDATE friends SET is_primary = 0 WHERE is_primary = 1", [])?;
            conn.execute(
                "INSERT INTO friends (id, handle, display_name, is_primary) VALUES (?1, ?2, ?3, 1)
                 ON CONFLICT(id) DO UPDATE SET handle = excluded.handle, display_name = excluded.display_name, is_primary = 1",
                params![friend.id.as_str(), friend.handle, friend.display_name],
            )?;
            Ok(())
        })
    }

    pub fn primary_user(&self) -> Result<Option<Friend>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, handle, display_name, last_synced_at, sync_state FROM friends WHERE is_primary = 1",
        )?;
        let row = stmt.query_row([], friend_from_row).optional()?;
        row.map(finish_friend).transpose()
    }

    pub fn get_friend(&self, id: &FriendId) -> Result<Option<Friend>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, handle, display_name, last_synced_at, sync_state FROM friends WHERE id = ?1",
        )?;
        let row = stmt.query_row([id.as_str()], friend_from_row).optional()?;
        row.map(finish_friend).transpose()
    }

    /// Every known friend except the primary user, ordered by id
    pub fn list_friends(&self) -> Result<Vec<Friend>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, handle, display_name, last_synced_at, sync_state FROM friends
             WHERE is_primary = 0 ORDER BY id",
        )?;
        let rows = stmt.query_map([], friend_from_row)?;
        let mut friends = Vec::new();
        for row in rows {
            friends.push(finish_friend(row?)?);
        }
        Ok(friends)
    }

    /// Set the latest job state without touching `last_synced_at`
    pub fn update_sync_state(&self, id: &FriendId, state: JobState) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE friends SET sync_state = ?2 WHERE id = ?1",
            params![id.as_str(), state.as_str()],
        )?;
        Ok(())
    }

    // Watchlist generations

    /// Atomically replace `friend_id`'s committed watchlist.
    ///
    /// Inserts `entries` as a new generation, points `current_generation` at
    /// it, deletes older generations and marks the friend synced, all in one
    /// transaction. Entries sharing a normalized key keep the first one. On
    /// any error the previous generation stays current.
    pub fn replace_watchlist(&self, friend_id: &FriendId, entries: &[NormalizedEntry]) -> Result<GenerationId, StoreError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();

        let (generation, inserted) = Self::with_transaction(&conn, |conn| {
            let previous: Option<i64> = conn
                .query_row(
                    "SELECT MAX(generation_id) FROM (
                        SELECT generation_id FROM current_generation WHERE friend_id = ?1
                        UNION ALL
                        SELECT generation_id FROM watchlist_entries WHERE friend_id = ?1
                    )",
                    [friend_id.as_str()],
                    |row| row.get(0),
                )?;
            let generation = GenerationId(previous.unwrap_or(0) + 1);

            let mut inserted = 0usize;
            {
                let mut stmt = conn.prepare(
                    "INSERT OR IGNORE INTO watchlist_entries (friend_id, normalized_key, generation_id, raw_title, year)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for entry in entries {
                    inserted += stmt.execute(params![
                        friend_id.as_str(),
                        entry.key.storage_key(),
                        generation.0,
                        entry.raw_title,
                        entry.year,
                    ])?;
                }
            }

            conn.execute(
                "INSERT INTO current_generation (friend_id, generation_id, committed_at, entry_count)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(friend_id) DO UPDATE SET generation_id = excluded.generation_id,
                    committed_at = excluded.committed_at, entry_count = excluded.entry_count",
                params![friend_id.as_str(), generation.0, now, inserted as i64],
            )?;
            conn.execute(
                "DELETE FROM watchlist_entries WHERE friend_id = ?1 AND generation_id <> ?2",
                params![friend_id.as_str(), generation.0],
            )?;
            conn.execute(
                "INSERT INTO friends (id, handle, display_name, last_synced_at, sync_state)
                 VALUES (?1, ?1, ?1, ?2, 'completed')
                 ON CONFLICT(id) DO UPDATE SET last_synced_at = excluded.last_synced_at, sync_state = 'completed'",
                params![friend_id.as_str(), now],
            )?;
            Ok((generation, inserted))
        })?;

        debug!(
            operation = "replace_watchlist",
            friend = %friend_id,
            generation = %generation,
            entries = inserted,
            "Committed watchlist generation"
        );
        Ok(generation)
    }

    pub fn current_generation(&self, friend_id: &FriendId) -> Result<Option<GenerationId>, StoreError> {
        let generation = self
            .conn()
            .query_row(
                "SELECT generation_id FROM current_generation WHERE friend_id = ?1",
                [friend_id.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(generation.map(GenerationId))
    }

    /// Committed entries for one owner, ordered by normalized key
    pub fn load_watchlist(&self, friend_id: &FriendId) -> Result<Vec<WatchlistEntry>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT e.normalized_key, e.raw_title, e.year, e.generation_id
             FROM watchlist_entries e
             JOIN current_generation g ON g.friend_id = e.friend_id AND g.generation_id = e.generation_id
             WHERE e.friend_id = ?1
             ORDER BY e.normalized_key",
        )?;
        let rows = stmt.query_map([friend_id.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<u16>>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (key, raw_title, year, generation) = row?;
            entries.push(WatchlistEntry {
                normalized_key: parse_key("watchlist_entries", &key)?,
                raw_title,
                year,
                friend_id: friend_id.clone(),
                generation_id: GenerationId(generation),
            });
        }
        Ok(entries)
    }

    /// Committed key sets for several owners. Owners with no committed
    /// generation are omitted.
    pub fn load_keys(&self, friend_ids: &BTreeSet<FriendId>) -> Result<BTreeMap<FriendId, BTreeSet<NormalizedKey>>, StoreError> {
        let mut keys = BTreeMap::new();
        for friend_id in friend_ids {
            if self.current_generation(friend_id)?.is_none() {
                continue;
            }
            let entries = self.load_watchlist(friend_id)?;
            keys.insert(
                friend_id.clone(),
                entries.into_iter().map(|e| e.normalized_key).collect(),
            );
        }
        Ok(keys)
    }

    // Metadata cache

    /// Cached metadata for `key`, expired or not
    pub fn get_metadata(&self, key: &NormalizedKey) -> Result<Option<MovieMetadata>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT normalized_key, external_id, title, poster_url, rating, overview, release_date,
                    runtime_minutes, genres, director, fetched_at, ttl_expires_at
             FROM metadata_cache WHERE normalized_key = ?1",
        )?;
        let row = stmt.query_row([key.storage_key()], metadata_from_row).optional()?;
        row.map(finish_metadata).transpose()
    }

    pub fn put_metadata(&self, metadata: &MovieMetadata) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT OR REPLACE INTO metadata_cache
                (normalized_key, external_id, title, poster_url, rating, overview, release_date,
                 runtime_minutes, genres, director, fetched_at, ttl_expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                metadata.normalized_key.storage_key(),
                metadata.external_id.map(|id| id as i64),
                metadata.title,
                metadata.poster_url,
                metadata.rating.map(f64::from),
                metadata.overview,
                metadata.release_date,
                metadata.runtime_minutes,
                (!metadata.genres.is_empty()).then(|| metadata.genres.join(GENRE_SEPARATOR)),
                metadata.director,
                metadata.fetched_at.to_rfc3339(),
                metadata.ttl_expires_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Delete cache entries whose TTL has passed; returns how many were removed
    pub fn purge_expired_metadata(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.conn();
        let expired: Vec<String> = {
            let mut stmt = conn.prepare("SELECT normalized_key, ttl_expires_at FROM metadata_cache")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
            let mut expired = Vec::new();
            for row in rows {
                let (key, expires) = row?;
                if parse_time("metadata_cache", &expires)? <= now {
                    expired.push(key);
                }
            }
            expired
        };

        Self::with_transaction(&conn, |conn| {
            let mut stmt = conn.prepare("DELETE FROM metadata_cache WHERE normalized_key = ?1")?;
            for key in &expired {
                stmt.execute([key])?;
            }
            Ok(())
        })?;
        info!(operation = "purge_metadata", removed = expired.len(), "Purged expired metadata");
        Ok(expired.len())
    }

    // Job history

    pub fn record_job(&self, batch_id: &str, job: &SyncJob) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO sync_job_history
                (batch_id, friend_id, generation_id, outcome, pages_fetched, entries_found, error, reused_cached, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                batch_id,
                job.friend_id.as_str(),
                job.generation_id.map(|g| g.0),
                job.state.as_str(),
                job.pages_fetched,
                job.entries_found as i64,
                job.error,
                job.reused_cached,
                job.started_at.map(|t| t.to_rfc3339()),
                job.finished_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Most recent job records first, optionally for one friend
    pub fn job_history(&self, friend_id: Option<&FriendId>, limit: usize) -> Result<Vec<JobHistoryRow>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT batch_id, friend_id, generation_id, outcome, pages_fetched, entries_found, error, reused_cached, started_at, finished_at
             FROM sync_job_history
             WHERE (?1 IS NULL OR friend_id = ?1)
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![friend_id.map(|f| f.as_str()), limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<i64>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, u32>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, bool>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, Option<String>>(9)?,
            ))
        })?;

        let mut history = Vec::new();
        for row in rows {
            let (batch_id, friend, generation, outcome, pages, entries, error, reused, started, finished) = row?;
            history.push(JobHistoryRow {
                batch_id,
                friend_id: FriendId::new(friend),
                generation_id: generation.map(GenerationId),
                outcome: outcome.parse().map_err(|message| StoreError::Corrupt {
                    table: "sync_job_history",
                    message,
                })?,
                pages_fetched: pages,
                entries_found: entries.max(0) as usize,
                error,
                reused_cached: reused,
                started_at: started.map(|s| parse_time("sync_job_history", &s)).transpose()?,
                finished_at: finished.map(|s| parse_time("sync_job_history", &s)).transpose()?,
            });
        }
        Ok(history)
    }

    // Maintenance

    pub fn stats(&self, now: DateTime<Utc>) -> Result<StoreStats, StoreError> {
        let primary_user = self.primary_user()?.map(|f| f.handle);
        let conn = self.conn();
        let count = |sql: &str| -> Result<usize, StoreError> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n.max(0) as usize)
        };

        let mut metadata_expired = 0;
        {
            let mut stmt = conn.prepare("SELECT ttl_expires_at FROM metadata_cache")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for row in rows {
                if parse_time("metadata_cache", &row?)? <= now {
                    metadata_expired += 1;
                }
            }
        }

        Ok(StoreStats {
            primary_user,
            friends: count("SELECT COUNT(*) FROM friends WHERE is_primary = 0")?,
            watchlist_entries: count(
                "SELECT COUNT(*) FROM watchlist_entries e
                 JOIN current_generation g ON g.friend_id = e.friend_id AND g.generation_id = e.generation_id",
            )?,
            metadata_cached: count("SELECT COUNT(*) FROM metadata_cache WHERE external_id IS NOT NULL")?,
            metadata_not_found: count("SELECT COUNT(*) FROM metadata_cache WHERE external_id IS NULL")?,
            metadata_expired,
            job_history: count("SELECT COUNT(*) FROM sync_job_history")?,
        })
    }

    /// Remove every row from every table
    pub fn clear(&self) -> Result<(), StoreError> {
        let conn = self.conn();
        Self::with_transaction(&conn, |conn| {
            conn.execute_batch(
                "DELETE FROM watchlist_entries;
                 DELETE FROM current_generation;
                 DELETE FROM metadata_cache;
                 DELETE FROM sync_job_history;
                 DELETE FROM friends;",
            )?;
            Ok(())
        })?;
        info!(operation = "clear_store", "Cleared all stored data");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<(), StoreError> {
        self.conn().execute_batch(sql)?;
        Ok(())
    }
}

type FriendRow = (String, String, String, Option<String>, Option<String>);

fn friend_from_row(row: &rusqlite::Row) -> rusqlite::Result<FriendRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn finish_friend((id, handle, display_name, last_synced_at, sync_state): FriendRow) -> Result<Friend, StoreError> {
    Ok(Friend {
        id: FriendId::new(id),
        display_name,
        handle,
        last_synced_at: last_synced_at.map(|s| parse_time("friends", &s)).transpose()?,
        sync_state: sync_state
            .map(|s| s.parse::<JobState>())
            .transpose()
            .map_err(|message| StoreError::Corrupt { table: "friends", message })?,
    })
}

/// Genres are stored in one column
const GENRE_SEPARATOR: &str = "|";

struct MetadataRow {
    key: String,
    external_id: Option<i64>,
    title: Option<String>,
    poster_url: Option<String>,
    rating: Option<f64>,
    overview: Option<String>,
    release_date: Option<String>,
    runtime_minutes: Option<u32>,
    genres: Option<String>,
    director: Option<String>,
    fetched_at: String,
    ttl_expires_at: String,
}

fn metadata_from_row(row: &rusqlite::Row) -> rusqlite::Result<MetadataRow> {
    Ok(MetadataRow {
        key: row.get(0)?,
        external_id: row.get(1)?,
        title: row.get(2)?,
        poster_url: row.get(3)?,
        rating: row.get(4)?,
        overview: row.get(5)?,
        release_date: row.get(6)?,
        runtime_minutes: row.get(7)?,
        genres: row.get(8)?,
        director: row.get(9)?,
        fetched_at: row.get(10)?,
        ttl_expires_at: row.get(11)?,
    })
}

fn finish_metadata(row: MetadataRow) -> Result<MovieMetadata, StoreError> {
    Ok(MovieMetadata {
        normalized_key: parse_key("metadata_cache", &row.key)?,
        external_id: row.external_id.map(|id| id as u64),
        title: row.title,
        poster_url: row.poster_url,
        rating: row.rating.map(|r| r as f32),
        overview: row.overview,
        release_date: row.release_date,
        runtime_minutes: row.runtime_minutes,
        genres: row
            .genres
            .map(|joined| {
                joined
                    .split(GENRE_SEPARATOR)
                    .filter(|g| !g.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        director: row.director,
        fetched_at: parse_time("metadata_cache", &row.fetched_at)?,
        ttl_expires_at: parse_time("metadata_cache", &row.ttl_expires_at)?,
    })
}

fn parse_key(table: &'static str, raw: &str) -> Result<NormalizedKey, StoreError> {
    NormalizedKey::from_storage_key(raw).ok_or_else(|| StoreError::Corrupt {
        table,
        message: format!("bad normalized key '{}'", raw),
    })
}

fn parse_time(table: &'static str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            table,
            message: format!("bad timestamp '{}': {}", raw, e),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entries(titles: &[(&str, u16)]) -> Vec<NormalizedEntry> {
        titles
            .iter()
            .map(|(t, y)| NormalizedEntry::from_raw(&RawEntry::new(*t, Some(*y))))
            .collect()
    }

    fn titles(store: &Store, id: &FriendId) -> Vec<String> {
        store.load_watchlist(id).unwrap().into_iter().map(|e| e.raw_title).collect()
    }

    #[test]
    fn test_replace_watchlist_swaps_generations() {
        let store = Store::open_in_memory().unwrap();
        let alice = FriendId::new("alice");

        let g1 = store.replace_watchlist(&alice, &entries(&[("Heat", 1995), ("Alien", 1979)])).unwrap();
        let g2 = store.replace_watchlist(&alice, &entries(&[("Jaws", 1975)])).unwrap();

        assert!(g2 > g1);
        assert_eq!(store.current_generation(&alice).unwrap(), Some(g2));
        assert_eq!(titles(&store, &alice), vec!["Jaws"]);
        assert_eq!(store.stats(Utc::now()).unwrap().watchlist_entries, 1);

        let friend = store.get_friend(&alice).unwrap().unwrap();
        assert_eq!(friend.sync_state, Some(JobState::Completed));
        assert!(friend.last_synced_at.is_some());
    }

    #[test]
    fn test_failed_commit_keeps_previous_generation() {
        let store = Store::open_in_memory().unwrap();
        let alice = FriendId::new("alice");
        let g1 = store.replace_watchlist(&alice, &entries(&[("Heat", 1995)])).unwrap();

        store
            .execute_raw(
                "CREATE TRIGGER fail_boom BEFORE INSERT ON watchlist_entries
                 WHEN NEW.raw_title = 'BOOM' BEGIN SELECT RAISE(ABORT, 'boom'); END;",
            )
            .unwrap();

        let result = store.replace_watchlist(&alice, &entries(&[("Jaws", 1975), ("BOOM", 2000)]));
        assert!(matches!(result, Err(StoreError::Sqlite(_))));
        assert_eq!(store.current_generation(&alice).unwrap(), Some(g1));
        assert_eq!(titles(&store, &alice), vec!["Heat"]);
    }

    #[test]
    fn test_duplicate_keys_within_generation_keep_first() {
        let store = Store::open_in_memory().unwrap();
        let bob = FriendId::new("bob");
        let rows = vec![
            NormalizedEntry::from_raw(&RawEntry::new("Amélie", Some(2001))),
            NormalizedEntry::from_raw(&RawEntry::new("Amelie (2001)", None)),
        ];
        store.replace_watchlist(&bob, &rows).unwrap();
        assert_eq!(titles(&store, &bob), vec!["Amélie"]);
    }

    #[test]
    fn test_friends_and_primary_user() {
        let store = Store::open_in_memory().unwrap();
        store.set_primary_user(&Friend::new("me", "Me")).unwrap();
        store
            .upsert_friends(&[Friend::new("bob", "Bob"), Friend::new("alice", "Alice")])
            .unwrap();
        store.upsert_friend(&Friend::new("alice", "Alice Renamed")).unwrap();

        let friends = store.list_friends().unwrap();
        let names: Vec<&str> = friends.iter().map(|f| f.display_name.as_str()).collect();
        assert_eq!(names, vec!["Alice Renamed", "Bob"]);
        assert_eq!(store.primary_user().unwrap().unwrap().handle, "me");

        store.update_sync_state(&FriendId::new("bob"), JobState::Failed).unwrap();
        assert_eq!(
            store.get_friend(&FriendId::new("bob")).unwrap().unwrap().sync_state,
            Some(JobState::Failed)
        );
    }

    #[test]
    fn test_metadata_round_trip_and_purge() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("data").join("watchmatch.db")).unwrap();
        let now = Utc::now();
        let key = NormalizedKey::from_parts("inception", Some(2010));

        let found = MovieMetadata {
            normalized_key: key.clone(),
            external_id: Some(27205),
            title: Some("Inception".to_string()),
            poster_url: Some("https://image.test/p.jpg".to_string()),
            rating: Some(8.4),
            overview: None,
            release_date: Some("2010-07-15".to_string()),
            runtime_minutes: Some(148),
            genres: vec!["Action".to_string(), "Science Fiction".to_string()],
            director: Some("Christopher Nolan".to_string()),
            fetched_at: now,
            ttl_expires_at: now + chrono::Duration::days(30),
        };
        store.put_metadata(&found).unwrap();
        let missing = MovieMetadata::not_found(
            NormalizedKey::from_parts("obscure short", None),
            now - chrono::Duration::days(10),
            chrono::Duration::days(1),
        );
        store.put_metadata(&missing).unwrap();

        let loaded = store.get_metadata(&key).unwrap().unwrap();
        assert_eq!(loaded.external_id, Some(27205));
        assert_eq!(loaded.poster_url, found.poster_url);
        assert_eq!(loaded.runtime_minutes, Some(148));
        assert_eq!(loaded.genres, found.genres);
        assert_eq!(loaded.director, found.director);
        let loaded_missing = store.get_metadata(&missing.normalized_key).unwrap().unwrap();
        assert!(loaded_missing.genres.is_empty());

        let stats = store.stats(now).unwrap();
        assert_eq!((stats.metadata_cached, stats.metadata_not_found, stats.metadata_expired), (1, 1, 1));

        assert_eq!(store.purge_expired_metadata(now).unwrap(), 1);
        assert!(store.get_metadata(&missing.normalized_key).unwrap().is_none());
        assert!(store.get_metadata(&key).unwrap().is_some());
    }

    #[test]
    fn test_open_adds_details_columns_to_older_cache() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("watchmatch.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE metadata_cache (
                    normalized_key TEXT PRIMARY KEY,
                    external_id INTEGER,
                    title TEXT,
                    poster_url TEXT,
                    rating REAL,
                    overview TEXT,
                    release_date TEXT,
                    fetched_at TEXT NOT NULL,
                    ttl_expires_at TEXT NOT NULL
                );
                INSERT INTO metadata_cache (normalized_key, external_id, title, fetched_at, ttl_expires_at)
                VALUES ('heat|1995', 949, 'Heat', '2026-01-01T00:00:00+00:00', '2026-02-01T00:00:00+00:00');",
            )
            .unwrap();
        }

        let store = Store::open(&path).unwrap();
        let old = store
            .get_metadata(&NormalizedKey::from_parts("heat", Some(1995)))
            .unwrap()
            .unwrap();
        assert_eq!(old.external_id, Some(949));
        assert_eq!(old.runtime_minutes, None);
        assert!(old.genres.is_empty());
        assert_eq!(old.director, None);

        let mut updated = old.clone();
        updated.director = Some("Michael Mann".to_string());
        store.put_metadata(&updated).unwrap();
        drop(store);

        // Reopening an already migrated database is a no-op
        let store = Store::open(&path).unwrap();
        let reloaded = store.get_metadata(&updated.normalized_key).unwrap().unwrap();
        assert_eq!(reloaded.director.as_deref(), Some("Michael Mann"));
    }

    #[test]
    fn test_job_history_and_clear() {
        let store = Store::open_in_memory().unwrap();
        let mut job = SyncJob::new(FriendId::new("alice"));
        job.transition(JobState::Running);
        job.pages_fetched = 3;
        job.error = Some("HTTP 404".to_string());
        job.transition(JobState::Failed);
        store.record_job("batch-1", &job).unwrap();
        store.record_job("batch-2", &SyncJob::new(FriendId::new("bob"))).unwrap();

        let history = store.job_history(Some(&FriendId::new("alice")), 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, JobState::Failed);
        assert_eq!(history[0].pages_fetched, 3);
        assert_eq!(store.job_history(None, 10).unwrap()[0].batch_id, "batch-2");

        store.clear().unwrap();
        assert_eq!(store.stats(Utc::now()).unwrap(), StoreStats::default());
    }

    #[tokio::test]
    async fn test_call_runs_on_blocking_pool() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let alice = FriendId::new("alice");
        let id = alice.clone();
        store
            .call(move |s| s.replace_watchlist(&id, &entries(&[("Heat", 1995)])))
            .await
            .unwrap();
        let loaded = store.call(move |s| s.load_watchlist(&alice)).await.unwrap();
        assert_eq!(loaded.len(), 1);
    }
}
