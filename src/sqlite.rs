//! SQLite-backed [`Store`] + [`PageDirectory`] (feature `sqlite`).
//!
//! Layout: `page`, `rotator_member`, `experiment`, `variant`, plus one
//! `variant_history_NN` table per shard keyed by `(variant_key, day)`.
//!
//! Duplicate tolerance is pushed into SQL: `INSERT OR IGNORE` for provisioning rows and
//! `INSERT .. ON CONFLICT DO UPDATE SET c = c + 1` for counters, so no write ever reads
//! a counter back. One connection is shared behind a mutex; SQLite serializes writers
//! anyway.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::NaiveDate;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::{
    ContentKey, Counter, ExperimentId, ExperimentRecord, ExperimentStatus, FunnelCounters,
    HistoryKey, PageDirectory, PageRecord, ShardLocator, Store, StoreError, VariantId,
    VariantRecord, VariantStats,
};

const DAY_FORMAT: &str = "%Y-%m-%d";

const BASE_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS page (
        page_id    TEXT PRIMARY KEY,
        url        TEXT NOT NULL,
        url_key    TEXT NOT NULL UNIQUE,
        is_rotator INTEGER NOT NULL DEFAULT 0,
        user_id    INTEGER NOT NULL DEFAULT 0,
        site_id    INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS rotator_member (
        rotator_id TEXT NOT NULL,
        page_id    TEXT NOT NULL,
        PRIMARY KEY (rotator_id, page_id)
    );
    CREATE TABLE IF NOT EXISTS experiment (
        key         TEXT PRIMARY KEY,
        id          TEXT NOT NULL UNIQUE,
        campaign    TEXT NOT NULL,
        rotator_id  TEXT NOT NULL,
        rotator_key TEXT NOT NULL,
        status      INTEGER NOT NULL DEFAULT 1
    );
    CREATE TABLE IF NOT EXISTS variant (
        key            TEXT PRIMARY KEY,
        id             TEXT NOT NULL UNIQUE,
        experiment_id  TEXT NOT NULL,
        experiment_key TEXT NOT NULL,
        page_id        TEXT NOT NULL,
        page_key       TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS variant_by_experiment ON variant (experiment_key);
";

fn history_schema(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            variant_key    TEXT NOT NULL,
            day            TEXT NOT NULL,
            experiment_id  TEXT NOT NULL,
            experiment_key TEXT NOT NULL,
            variant_id     TEXT NOT NULL,
            impression     INTEGER NOT NULL DEFAULT 0,
            cta            INTEGER NOT NULL DEFAULT 0,
            lead           INTEGER NOT NULL DEFAULT 0,
            mql            INTEGER NOT NULL DEFAULT 0,
            prospek        INTEGER NOT NULL DEFAULT 0,
            purchase       INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (variant_key, day)
        );
        CREATE INDEX IF NOT EXISTS {table}_by_experiment ON {table} (experiment_key);"
    )
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Db(e.to_string())
    }
}

fn to_u64(v: i64, what: &str) -> Result<u64, StoreError> {
    u64::try_from(v).map_err(|_| StoreError::Invalid(format!("negative {what}: {v}")))
}

fn to_i64(v: u64, what: &str) -> Result<i64, StoreError> {
    i64::try_from(v).map_err(|_| StoreError::Invalid(format!("{what} out of range: {v}")))
}

/// Durable store over a single SQLite database.
#[derive(Debug)]
pub struct SqliteStore {
    shard_count: u32,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file and ensure the schema for `shard_count` shards.
    pub fn open(path: impl AsRef<Path>, shard_count: u32) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init(conn, shard_count)
    }

    /// Private in-memory database, mainly for tests.
    pub fn open_in_memory(shard_count: u32) -> Result<Self, StoreError> {
        let conn =
            Connection::open_in_memory().map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Self::init(conn, shard_count)
    }

    fn init(conn: Connection, shard_count: u32) -> Result<Self, StoreError> {
        let shard_count = shard_count.max(1);
        conn.execute_batch(BASE_SCHEMA)?;
        for idx in 0..shard_count {
            conn.execute_batch(&history_schema(&ShardLocator::new(idx).table_name()))?;
        }
        debug!(shard_count, "sqlite schema ready");
        Ok(Self {
            shard_count,
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("sqlite connection mutex poisoned".to_string()))
    }

    fn table(&self, shard: ShardLocator) -> Result<String, StoreError> {
        if shard.index() < self.shard_count {
            Ok(shard.table_name())
        } else {
            Err(StoreError::UnknownShard {
                shard: shard.index(),
                shard_count: self.shard_count,
            })
        }
    }

    /// Insert or replace a page (seeding helper; page CRUD lives elsewhere).
    pub fn put_page(&self, page: &PageRecord) -> Result<(), StoreError> {
        self.lock()?.execute(
            "INSERT INTO page (page_id, url, url_key, is_rotator, user_id, site_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(page_id) DO UPDATE SET
                url = excluded.url, url_key = excluded.url_key,
                is_rotator = excluded.is_rotator,
                user_id = excluded.user_id, site_id = excluded.site_id",
            params![
                page.page_id,
                page.url,
                page.url_key().as_str(),
                page.is_rotator,
                to_i64(page.user_id, "user_id")?,
                to_i64(page.site_id, "site_id")?,
            ],
        )?;
        Ok(())
    }

    /// Attach a page to a rotator's member set. Idempotent.
    pub fn attach_member(&self, rotator_id: &str, page_id: &str) -> Result<(), StoreError> {
        self.lock()?.execute(
            "INSERT OR IGNORE INTO rotator_member (rotator_id, page_id) VALUES (?1, ?2)",
            params![rotator_id, page_id],
        )?;
        Ok(())
    }
}

fn read_experiment(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExperimentRecord> {
    Ok(ExperimentRecord {
        key: ContentKey::from_hex(row.get::<_, String>(0)?),
        id: ExperimentId::from_stored(row.get::<_, String>(1)?),
        campaign: row.get(2)?,
        rotator_id: row.get(3)?,
        rotator_key: ContentKey::from_hex(row.get::<_, String>(4)?),
        status: ExperimentStatus::from_code(row.get(5)?),
    })
}

fn read_variant(row: &rusqlite::Row<'_>) -> rusqlite::Result<VariantRecord> {
    Ok(VariantRecord {
        key: ContentKey::from_hex(row.get::<_, String>(0)?),
        id: VariantId::from_stored(row.get::<_, String>(1)?),
        experiment_id: ExperimentId::from_stored(row.get::<_, String>(2)?),
        experiment_key: ContentKey::from_hex(row.get::<_, String>(3)?),
        page_id: row.get(4)?,
        page_key: ContentKey::from_hex(row.get::<_, String>(5)?),
    })
}

/// Six counter columns starting at `offset`, in funnel order.
fn read_counters(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<[i64; 6]> {
    let mut out = [0i64; 6];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = row.get(offset + i)?;
    }
    Ok(out)
}

fn counters_from(raw: [i64; 6]) -> Result<FunnelCounters, StoreError> {
    Ok(FunnelCounters {
        impression: to_u64(raw[0], "impression")?,
        cta: to_u64(raw[1], "cta")?,
        lead: to_u64(raw[2], "lead")?,
        mql: to_u64(raw[3], "mql")?,
        prospek: to_u64(raw[4], "prospek")?,
        purchase: to_u64(raw[5], "purchase")?,
    })
}

impl Store for SqliteStore {
    fn shard_count(&self) -> u32 {
        self.shard_count
    }

    fn insert_experiment(&self, rec: &ExperimentRecord) -> Result<bool, StoreError> {
        let n = self.lock()?.execute(
            "INSERT OR IGNORE INTO experiment (key, id, campaign, rotator_id, rotator_key, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                rec.key.as_str(),
                rec.id.as_str(),
                rec.campaign,
                rec.rotator_id,
                rec.rotator_key.as_str(),
                rec.status.code(),
            ],
        )?;
        Ok(n == 1)
    }

    fn experiment(&self, key: &ContentKey) -> Result<Option<ExperimentRecord>, StoreError> {
        let conn = self.lock()?;
        let rec = conn
            .prepare_cached(
                "SELECT key, id, campaign, rotator_id, rotator_key, status
                 FROM experiment WHERE key = ?1",
            )?
            .query_row(params![key.as_str()], read_experiment)
            .optional()?;
        Ok(rec)
    }

    fn set_experiment_status(
        &self,
        key: &ContentKey,
        status: ExperimentStatus,
    ) -> Result<bool, StoreError> {
        let n = self.lock()?.execute(
            "UPDATE experiment SET status = ?1 WHERE key = ?2",
            params![status.code(), key.as_str()],
        )?;
        Ok(n == 1)
    }

    fn insert_variant(&self, rec: &VariantRecord) -> Result<bool, StoreError> {
        let n = self.lock()?.execute(
            "INSERT OR IGNORE INTO variant
                (key, id, experiment_id, experiment_key, page_id, page_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                rec.key.as_str(),
                rec.id.as_str(),
                rec.experiment_id.as_str(),
                rec.experiment_key.as_str(),
                rec.page_id,
                rec.page_key.as_str(),
            ],
        )?;
        Ok(n == 1)
    }

    fn variant(&self, key: &ContentKey) -> Result<Option<VariantRecord>, StoreError> {
        let conn = self.lock()?;
        let rec = conn
            .prepare_cached(
                "SELECT key, id, experiment_id, experiment_key, page_id, page_key
                 FROM variant WHERE key = ?1",
            )?
            .query_row(params![key.as_str()], read_variant)
            .optional()?;
        Ok(rec)
    }

    fn variants(&self, experiment_key: &ContentKey) -> Result<Vec<VariantRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT key, id, experiment_id, experiment_key, page_id, page_key
             FROM variant WHERE experiment_key = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![experiment_key.as_str()], read_variant)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn insert_history(&self, shard: ShardLocator, key: &HistoryKey) -> Result<bool, StoreError> {
        let table = self.table(shard)?;
        let n = self.lock()?.execute(
            &format!(
                "INSERT OR IGNORE INTO {table}
                    (variant_key, day, experiment_id, experiment_key, variant_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)"
            ),
            params![
                key.variant_key.as_str(),
                key.day.format(DAY_FORMAT).to_string(),
                key.experiment_id.as_str(),
                key.experiment_key.as_str(),
                key.variant_id.as_str(),
            ],
        )?;
        Ok(n == 1)
    }

    fn increment(
        &self,
        shard: ShardLocator,
        key: &HistoryKey,
        counter: Counter,
    ) -> Result<(), StoreError> {
        let table = self.table(shard)?;
        let col = counter.column();
        self.lock()?.execute(
            &format!(
                "INSERT INTO {table}
                    (variant_key, day, experiment_id, experiment_key, variant_id, {col})
                 VALUES (?1, ?2, ?3, ?4, ?5, 1)
                 ON CONFLICT(variant_key, day) DO UPDATE SET {col} = {col} + 1"
            ),
            params![
                key.variant_key.as_str(),
                key.day.format(DAY_FORMAT).to_string(),
                key.experiment_id.as_str(),
                key.experiment_key.as_str(),
                key.variant_id.as_str(),
            ],
        )?;
        Ok(())
    }

    fn variant_totals(
        &self,
        shard: ShardLocator,
        experiment_key: &ContentKey,
    ) -> Result<Vec<VariantStats>, StoreError> {
        let table = self.table(shard)?;
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT variant_id, SUM(impression), SUM(cta), SUM(lead),
                    SUM(mql), SUM(prospek), SUM(purchase)
             FROM {table} WHERE experiment_key = ?1
             GROUP BY variant_id ORDER BY variant_id"
        ))?;
        let raw = stmt
            .query_map(params![experiment_key.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, read_counters(row, 1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        raw.into_iter()
            .map(|(id, counters)| {
                Ok(VariantStats {
                    variant_id: VariantId::from_stored(id),
                    counters: counters_from(counters)?,
                })
            })
            .collect()
    }

    fn history(
        &self,
        shard: ShardLocator,
        variant_key: &ContentKey,
        day: NaiveDate,
    ) -> Result<Option<FunnelCounters>, StoreError> {
        let table = self.table(shard)?;
        let conn = self.lock()?;
        let raw = conn
            .prepare_cached(&format!(
                "SELECT impression, cta, lead, mql, prospek, purchase
                 FROM {table} WHERE variant_key = ?1 AND day = ?2"
            ))?
            .query_row(
                params![variant_key.as_str(), day.format(DAY_FORMAT).to_string()],
                |row| read_counters(row, 0),
            )
            .optional()?;
        raw.map(counters_from).transpose()
    }
}

impl PageDirectory for SqliteStore {
    fn page_by_url_key(&self, url_key: &ContentKey) -> Result<Option<PageRecord>, StoreError> {
        let conn = self.lock()?;
        let raw = conn
            .prepare_cached(
                "SELECT page_id, url, is_rotator, user_id, site_id FROM page WHERE url_key = ?1",
            )?
            .query_row(params![url_key.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .optional()?;
        raw.map(|(page_id, url, is_rotator, user_id, site_id)| {
            Ok(PageRecord {
                page_id,
                url,
                is_rotator,
                user_id: to_u64(user_id, "user_id")?,
                site_id: to_u64(site_id, "site_id")?,
            })
        })
        .transpose()
    }

    fn rotator_pages(&self, rotator_id: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT page_id FROM rotator_member WHERE rotator_id = ?1 ORDER BY page_id",
        )?;
        let pages = stmt
            .query_map(params![rotator_id], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(pages)
    }
}
