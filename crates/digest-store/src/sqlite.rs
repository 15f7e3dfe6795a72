//! SQLite-backed `DigestStore` implementation with durable persistence.

use crate::{digest_entry_id, rank_by_similarity, DigestStore, StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use digest_types::{DigestEntry, DigestSection, Item, Reader};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Persistent SQLite store backend.
#[derive(Debug)]
pub struct SqliteDigestStore {
    db_path: PathBuf,
}

impl SqliteDigestStore {
    /// Creates a SQLite-backed store at `path`, creating schema if needed.
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self { db_path };
        let connection = store.open_connection()?;
        store.initialize_schema(&connection)?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_connection(&self) -> StoreResult<Connection> {
        let connection = Connection::open(&self.db_path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        Ok(connection)
    }

    fn initialize_schema(&self, connection: &Connection) -> StoreResult<()> {
        connection.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS items (
                item_id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                title TEXT NOT NULL,
                summary TEXT NOT NULL,
                embedding_json TEXT NULL,
                image TEXT NULL,
                created_at TEXT NOT NULL,
                created_at_us INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_items_created ON items (created_at_us, item_id);

            CREATE TABLE IF NOT EXISTS digest_entries (
                entry_id TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                sequence_id INTEGER NOT NULL,
                group_label TEXT NOT NULL,
                section_json TEXT NOT NULL,
                embedding_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (version, sequence_id)
            );

            CREATE INDEX IF NOT EXISTS idx_digest_entries_version ON digest_entries (version);

            CREATE TABLE IF NOT EXISTS readers (
                reader_id TEXT PRIMARY KEY,
                embedding_json TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }
}

#[async_trait]
impl DigestStore for SqliteDigestStore {
    async fn fetch_items(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> StoreResult<Vec<Item>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(
            r#"
            SELECT item_id, url, title, summary, embedding_json, image, created_at
            FROM items
            WHERE created_at_us >= ?1 AND created_at_us <= ?2
            ORDER BY created_at_us, item_id
            "#,
        )?;
        let rows = statement.query_map(
            params![
                window_start.timestamp_micros(),
                window_end.timestamp_micros()
            ],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        )?;

        let mut items = Vec::new();
        for row in rows {
            let (id, url, title, summary, embedding_json, image, created_at) = row?;
            items.push(Item {
                id,
                url,
                title,
                summary,
                embedding: embedding_json
                    .as_deref()
                    .map(deserialize_json)
                    .transpose()?,
                image,
                created_at: timestamp_from_db(&created_at)?,
            });
        }
        Ok(items)
    }

    async fn insert_item(&self, item: Item) -> StoreResult<()> {
        let connection = self.open_connection()?;
        connection.execute(
            r#"
            INSERT OR REPLACE INTO items (
                item_id, url, title, summary, embedding_json, image, created_at, created_at_us
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                item.id,
                item.url,
                item.title,
                item.summary,
                item.embedding.as_ref().map(serialize_json).transpose()?,
                item.image,
                timestamp_to_db(item.created_at),
                item.created_at.timestamp_micros(),
            ],
        )?;
        Ok(())
    }

    async fn insert_digest_entry(&self, entry: DigestEntry) -> StoreResult<String> {
        entry.validate()?;
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let sequence: i64 = transaction.query_row(
            "SELECT COUNT(*) FROM digest_entries WHERE version = ?1",
            params![entry.version],
            |row| row.get(0),
        )?;
        let sequence = i64_to_usize("sequence_id", sequence)?;
        let entry_id = digest_entry_id(entry.version, sequence);

        transaction.execute(
            r#"
            INSERT INTO digest_entries (
                entry_id, version, sequence_id, group_label, section_json, embedding_json,
                created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                entry_id,
                entry.version,
                sequence as i64,
                entry.group_label,
                serialize_json(&entry.section)?,
                serialize_json(&entry.embedding)?,
                timestamp_to_db(entry.created_at),
            ],
        )?;
        transaction.commit()?;
        Ok(entry_id)
    }

    async fn get_digest_entry(&self, entry_id: &str) -> StoreResult<Option<DigestEntry>> {
        let connection = self.open_connection()?;
        connection
            .query_row(
                r#"
                SELECT entry_id, version, group_label, section_json, embedding_json, created_at
                FROM digest_entries
                WHERE entry_id = ?1
                "#,
                params![entry_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?
            .map(
                |(entry_id, version, group_label, section_json, embedding_json, created_at)|
                 -> StoreResult<DigestEntry> {
                    Ok(DigestEntry {
                        id: Some(entry_id),
                        section: deserialize_json::<DigestSection>(&section_json)?,
                        embedding: deserialize_json(&embedding_json)?,
                        group_label,
                        version,
                        created_at: timestamp_from_db(&created_at)?,
                    })
                },
            )
            .transpose()
    }

    async fn latest_digest_version(&self) -> StoreResult<Option<i64>> {
        let connection = self.open_connection()?;
        let version = connection.query_row(
            "SELECT MAX(version) FROM digest_entries",
            [],
            |row| row.get::<_, Option<i64>>(0),
        )?;
        Ok(version)
    }

    async fn vector_search_digests(
        &self,
        query: &[f32],
        version: i64,
        num_candidates: usize,
        limit: usize,
    ) -> StoreResult<Vec<String>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(
            "SELECT entry_id, embedding_json FROM digest_entries WHERE version = ?1",
        )?;
        let rows = statement.query_map(params![version], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut candidates = Vec::new();
        for row in rows {
            let (entry_id, embedding_json) = row?;
            let embedding: Vec<f32> = deserialize_json(&embedding_json)?;
            candidates.push((entry_id, embedding));
        }
        tracing::debug!(version, candidates = candidates.len(), "ranking digest entries");

        Ok(rank_by_similarity(
            query,
            candidates
                .iter()
                .map(|(entry_id, embedding)| (entry_id.as_str(), embedding.as_slice())),
            num_candidates,
            limit,
        ))
    }

    async fn get_reader(&self, reader_id: &str) -> StoreResult<Reader> {
        let connection = self.open_connection()?;
        let embedding_json = connection
            .query_row(
                "SELECT embedding_json FROM readers WHERE reader_id = ?1",
                params![reader_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound {
                kind: "reader",
                id: reader_id.to_string(),
            })?;
        Ok(Reader {
            id: reader_id.to_string(),
            embedding: deserialize_json(&embedding_json)?,
        })
    }

    async fn upsert_reader(&self, reader: Reader) -> StoreResult<()> {
        let connection = self.open_connection()?;
        connection.execute(
            r#"
            INSERT INTO readers (reader_id, embedding_json) VALUES (?1, ?2)
            ON CONFLICT(reader_id) DO UPDATE SET embedding_json = excluded.embedding_json
            "#,
            params![reader.id, serialize_json(&reader.embedding)?],
        )?;
        Ok(())
    }
}

fn serialize_json<T: Serialize>(value: &T) -> StoreResult<String> {
    serde_json::to_string(value).map_err(StoreError::from)
}

fn deserialize_json<T: DeserializeOwned>(value: &str) -> StoreResult<T> {
    serde_json::from_str(value).map_err(StoreError::from)
}

fn timestamp_to_db(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn timestamp_from_db(value: &str) -> StoreResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn i64_to_usize(field: &'static str, value: i64) -> StoreResult<usize> {
    usize::try_from(value).map_err(|_| StoreError::InvalidPersistedValue {
        field,
        value: value.to_string(),
    })
}
