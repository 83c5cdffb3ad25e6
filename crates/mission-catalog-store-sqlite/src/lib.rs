use std::fmt::Display;
use std::path::Path;

use anyhow::{Context, Result};
use mission_catalog_core::{
    CumulusId, EntityKind, ExecutionRow, FileRow, GranuleRow, MigrationError, PdrRow,
    RecordFailure, SkipReason, WriteOutcome,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Key-value scope names, one logical table per entity kind.
pub const EXECUTIONS_SCOPE: &str = "executions";
pub const GRANULES_SCOPE: &str = "granules";
pub const PDRS_SCOPE: &str = "pdrs";

const KV_SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS kv_records (
  scope TEXT NOT NULL,
  record_key TEXT NOT NULL,
  attributes TEXT NOT NULL,
  PRIMARY KEY (scope, record_key)
);
";

const RELATIONAL_SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS collections (
  cumulus_id INTEGER PRIMARY KEY,
  name TEXT NOT NULL,
  version TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE (name, version)
);

CREATE TABLE IF NOT EXISTS providers (
  cumulus_id INTEGER PRIMARY KEY,
  name TEXT NOT NULL UNIQUE,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS async_operations (
  cumulus_id INTEGER PRIMARY KEY,
  id TEXT NOT NULL UNIQUE,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS executions (
  cumulus_id INTEGER PRIMARY KEY,
  arn TEXT NOT NULL UNIQUE,
  name TEXT,
  status TEXT NOT NULL CHECK (status IN ('running','completed','failed','unknown')),
  url TEXT,
  workflow_name TEXT,
  duration REAL,
  original_payload TEXT,
  final_payload TEXT,
  tasks TEXT,
  error TEXT,
  cumulus_version TEXT,
  timestamp TEXT,
  parent_cumulus_id INTEGER REFERENCES executions(cumulus_id),
  async_operation_cumulus_id INTEGER REFERENCES async_operations(cumulus_id),
  collection_cumulus_id INTEGER REFERENCES collections(cumulus_id),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS granules (
  cumulus_id INTEGER PRIMARY KEY,
  granule_id TEXT NOT NULL,
  collection_cumulus_id INTEGER NOT NULL REFERENCES collections(cumulus_id),
  status TEXT NOT NULL CHECK (status IN ('running','completed','failed')),
  published INTEGER,
  cmr_link TEXT,
  error TEXT,
  product_volume TEXT,
  duration REAL,
  time_to_archive REAL,
  time_to_process REAL,
  beginning_date_time TEXT,
  ending_date_time TEXT,
  production_date_time TEXT,
  last_update_date_time TEXT,
  processing_start_date_time TEXT,
  processing_end_date_time TEXT,
  timestamp TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE (granule_id, collection_cumulus_id)
);

CREATE TABLE IF NOT EXISTS files (
  cumulus_id INTEGER PRIMARY KEY,
  granule_cumulus_id INTEGER NOT NULL REFERENCES granules(cumulus_id),
  bucket TEXT,
  key TEXT,
  file_name TEXT,
  file_size TEXT,
  checksum_type TEXT,
  checksum_value TEXT,
  source TEXT,
  path TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pdrs (
  cumulus_id INTEGER PRIMARY KEY,
  name TEXT NOT NULL UNIQUE,
  collection_cumulus_id INTEGER NOT NULL REFERENCES collections(cumulus_id),
  provider_cumulus_id INTEGER NOT NULL REFERENCES providers(cumulus_id),
  execution_cumulus_id INTEGER REFERENCES executions(cumulus_id),
  status TEXT NOT NULL CHECK (status IN ('running','completed','failed')),
  progress REAL,
  pan_sent INTEGER,
  pan_message TEXT,
  timestamp TEXT,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS granules_executions (
  granule_cumulus_id INTEGER NOT NULL REFERENCES granules(cumulus_id),
  execution_cumulus_id INTEGER NOT NULL REFERENCES executions(cumulus_id),
  UNIQUE (granule_cumulus_id, execution_cumulus_id)
);

CREATE INDEX IF NOT EXISTS idx_executions_parent ON executions(parent_cumulus_id);
CREATE INDEX IF NOT EXISTS idx_granules_collection ON granules(collection_cumulus_id);
CREATE INDEX IF NOT EXISTS idx_files_granule ON files(granule_cumulus_id);
CREATE INDEX IF NOT EXISTS idx_files_location ON files(bucket, key);
";

/// One loosely-typed record read from the key-value store.
#[derive(Debug, Clone, PartialEq)]
pub struct KvRecord {
    pub key: String,
    pub attributes: Value,
}

/// One page of a key-value scan. `next_token` is the continuation token for
/// the following page; `None` means the scan may be exhausted.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanPage {
    pub records: Vec<KvRecord>,
    pub next_token: Option<String>,
}

/// The schemaless key-value store: the source of bulk migration and the
/// durability floor of the steady-state dual write. No schema is enforced
/// here; enforcement happens at translation.
pub struct KvStore {
    conn: Connection,
}

impl KvStore {
    /// Open a SQLite-backed key-value store.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or initialized.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open kv database at {}", path.display()))?;
        Self::init(conn)
    }

    /// Open an in-memory key-value store.
    ///
    /// # Errors
    /// Returns an error when initialization fails.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory kv database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure kv pragmas")?;
        conn.execute_batch(KV_SCHEMA_SQL).context("failed to apply kv schema")?;
        Ok(Self { conn })
    }

    /// Upsert one attribute map under `(scope, key)`.
    ///
    /// # Errors
    /// Returns an error when serialization or the write fails.
    pub fn put(&mut self, scope: &str, key: &str, attributes: &Value) -> Result<()> {
        let payload =
            serde_json::to_string(attributes).context("failed to serialize kv attributes")?;
        self.conn
            .execute(
                "INSERT INTO kv_records (scope, record_key, attributes) VALUES (?1, ?2, ?3)
                 ON CONFLICT (scope, record_key) DO UPDATE SET attributes = excluded.attributes",
                params![scope, key, payload],
            )
            .with_context(|| format!("failed to put kv record {scope}/{key}"))?;
        Ok(())
    }

    /// Fetch one attribute map by `(scope, key)`.
    ///
    /// # Errors
    /// Returns an error when the read or JSON decoding fails.
    pub fn get(&self, scope: &str, key: &str) -> Result<Option<Value>> {
        let raw = self
            .conn
            .query_row(
                "SELECT attributes FROM kv_records WHERE scope = ?1 AND record_key = ?2",
                params![scope, key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("failed to read kv record {scope}/{key}"))?;

        match raw {
            Some(payload) => {
                let attributes = serde_json::from_str(&payload)
                    .with_context(|| format!("invalid JSON stored for kv record {scope}/{key}"))?;
                Ok(Some(attributes))
            }
            None => Ok(None),
        }
    }

    /// Scan one page of a scope in native key order, resuming after
    /// `exclusive_start_key` when given.
    ///
    /// # Errors
    /// Returns an error when the read or JSON decoding fails.
    pub fn scan(
        &self,
        scope: &str,
        exclusive_start_key: Option<&str>,
        limit: usize,
    ) -> Result<ScanPage> {
        let limit_i64 = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self
            .conn
            .prepare(
                "SELECT record_key, attributes FROM kv_records
                 WHERE scope = ?1 AND (?2 IS NULL OR record_key > ?2)
                 ORDER BY record_key ASC
                 LIMIT ?3",
            )
            .context("failed to prepare kv scan")?;

        let rows = stmt
            .query_map(params![scope, exclusive_start_key, limit_i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .context("failed to run kv scan")?;

        let mut records = Vec::new();
        for row in rows {
            let (key, payload) = row.context("failed to read kv scan row")?;
            let attributes = serde_json::from_str(&payload)
                .with_context(|| format!("invalid JSON stored for kv record {scope}/{key}"))?;
            records.push(KvRecord { key, attributes });
        }

        let next_token = if limit > 0 && records.len() == limit {
            records.last().map(|record| record.key.clone())
        } else {
            None
        };

        Ok(ScanPage { records, next_token })
    }

    /// Number of records currently stored under a scope.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count(&self, scope: &str) -> Result<u64> {
        let count = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM kv_records WHERE scope = ?1",
                params![scope],
                |row| row.get::<_, i64>(0),
            )
            .with_context(|| format!("failed to count kv records in {scope}"))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

/// Resolved surrogate references for an execution write. Every field is
/// nullable in the execution schema.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionReferences {
    pub collection: Option<CumulusId>,
    pub parent: Option<CumulusId>,
    pub async_operation: Option<CumulusId>,
}

/// Resolved surrogate references for a PDR write. Collection and provider
/// are hard prerequisites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdrReferences {
    pub collection: CumulusId,
    pub provider: CumulusId,
    pub execution: Option<CumulusId>,
}

/// Outcome of one granule-plus-files transaction. File failures are recorded
/// per file and never roll back siblings or the granule row.
#[derive(Debug, Clone, PartialEq)]
pub struct GranuleWriteReport {
    pub granule: WriteOutcome,
    pub files_written: u64,
    pub file_failures: Vec<RecordFailure>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredExecution {
    pub cumulus_id: CumulusId,
    pub status: String,
    pub workflow_name: Option<String>,
    pub cumulus_version: Option<String>,
    pub parent_cumulus_id: Option<CumulusId>,
    pub async_operation_cumulus_id: Option<CumulusId>,
    pub collection_cumulus_id: Option<CumulusId>,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredGranule {
    pub cumulus_id: CumulusId,
    pub status: String,
    pub published: Option<bool>,
    pub cmr_link: Option<String>,
    pub product_volume: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredFile {
    pub cumulus_id: CumulusId,
    pub bucket: Option<String>,
    pub key: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredPdr {
    pub cumulus_id: CumulusId,
    pub status: String,
    pub execution_cumulus_id: Option<CumulusId>,
    pub updated_at: String,
}

/// The normalized relational store: reference resolution plus the idempotent
/// transactional writer. One transaction per top-level record.
pub struct RelationalStore {
    conn: Connection,
}

impl RelationalStore {
    /// Open a SQLite-backed relational store.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas fail.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open relational database at {}", path.display()))?;
        Self::init(conn)
    }

    /// Open an in-memory relational store.
    ///
    /// # Errors
    /// Returns an error when initialization fails.
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("failed to open in-memory relational database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure relational pragmas")?;
        Ok(Self { conn })
    }

    /// Apply the target schema. Idempotent.
    ///
    /// # Errors
    /// Returns an error when the schema batch fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn.execute_batch(RELATIONAL_SCHEMA_SQL).context("failed to apply relational schema")
    }

    /// Create a collection reference target. Collections are never created by
    /// the migration paths themselves; this exists for the external CRUD
    /// surface and tests.
    ///
    /// # Errors
    /// Returns an error when the insert fails (including duplicate keys).
    pub fn create_collection(&mut self, name: &str, version: &str) -> Result<CumulusId> {
        let now = now_rfc3339()?;
        self.conn
            .execute(
                "INSERT INTO collections (name, version, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)",
                params![name, version, now],
            )
            .with_context(|| format!("failed to create collection {name}___{version}"))?;
        Ok(CumulusId(self.conn.last_insert_rowid()))
    }

    /// Create a provider reference target.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn create_provider(&mut self, name: &str) -> Result<CumulusId> {
        let now = now_rfc3339()?;
        self.conn
            .execute(
                "INSERT INTO providers (name, created_at, updated_at) VALUES (?1, ?2, ?2)",
                params![name, now],
            )
            .with_context(|| format!("failed to create provider {name}"))?;
        Ok(CumulusId(self.conn.last_insert_rowid()))
    }

    /// Create an async-operation reference target.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn create_async_operation(&mut self, id: &str) -> Result<CumulusId> {
        let now = now_rfc3339()?;
        self.conn
            .execute(
                "INSERT INTO async_operations (id, created_at, updated_at) VALUES (?1, ?2, ?2)",
                params![id, now],
            )
            .with_context(|| format!("failed to create async operation {id}"))?;
        Ok(CumulusId(self.conn.last_insert_rowid()))
    }

    /// Resolve a collection natural key to its surrogate id.
    ///
    /// # Errors
    /// Returns an error when the lookup query fails.
    pub fn collection_cumulus_id(&self, name: &str, version: &str) -> Result<Option<CumulusId>> {
        self.lookup_id(
            "SELECT cumulus_id FROM collections WHERE name = ?1 AND version = ?2",
            params![name, version],
        )
        .with_context(|| format!("failed to resolve collection {name}___{version}"))
    }

    /// Resolve a provider natural key to its surrogate id.
    ///
    /// # Errors
    /// Returns an error when the lookup query fails.
    pub fn provider_cumulus_id(&self, name: &str) -> Result<Option<CumulusId>> {
        self.lookup_id("SELECT cumulus_id FROM providers WHERE name = ?1", params![name])
            .with_context(|| format!("failed to resolve provider {name}"))
    }

    /// Resolve an async-operation natural key to its surrogate id.
    ///
    /// # Errors
    /// Returns an error when the lookup query fails.
    pub fn async_operation_cumulus_id(&self, id: &str) -> Result<Option<CumulusId>> {
        self.lookup_id("SELECT cumulus_id FROM async_operations WHERE id = ?1", params![id])
            .with_context(|| format!("failed to resolve async operation {id}"))
    }

    /// Resolve an execution arn to its surrogate id.
    ///
    /// # Errors
    /// Returns an error when the lookup query fails.
    pub fn execution_cumulus_id(&self, arn: &str) -> Result<Option<CumulusId>> {
        self.lookup_id("SELECT cumulus_id FROM executions WHERE arn = ?1", params![arn])
            .with_context(|| format!("failed to resolve execution {arn}"))
    }

    /// Resolve a granule natural key to its surrogate id. Granule ids are
    /// only unique within a collection.
    ///
    /// # Errors
    /// Returns an error when the lookup query fails.
    pub fn granule_cumulus_id(
        &self,
        granule_id: &str,
        collection: CumulusId,
    ) -> Result<Option<CumulusId>> {
        self.lookup_id(
            "SELECT cumulus_id FROM granules WHERE granule_id = ?1 AND collection_cumulus_id = ?2",
            params![granule_id, collection.0],
        )
        .with_context(|| format!("failed to resolve granule {granule_id}"))
    }

    /// Resolve a PDR name to its surrogate id.
    ///
    /// # Errors
    /// Returns an error when the lookup query fails.
    pub fn pdr_cumulus_id(&self, name: &str) -> Result<Option<CumulusId>> {
        self.lookup_id("SELECT cumulus_id FROM pdrs WHERE name = ?1", params![name])
            .with_context(|| format!("failed to resolve pdr {name}"))
    }

    fn lookup_id(
        &self,
        sql: &str,
        query_params: &[&dyn rusqlite::ToSql],
    ) -> Result<Option<CumulusId>> {
        let id = self
            .conn
            .query_row(sql, query_params, |row| row.get::<_, i64>(0))
            .optional()
            .context("lookup query failed")?;
        Ok(id.map(CumulusId))
    }

    /// Idempotent transactional write of one execution row.
    ///
    /// Natural key: arn. Existing row with an `updated_at` not strictly older
    /// than the incoming record is skipped; a strictly newer record updates
    /// in place; a lost conditional update surfaces as a retryable race.
    pub fn write_execution(&mut self, row: &ExecutionRow, refs: ExecutionReferences) -> WriteOutcome {
        match self.write_execution_tx(row, refs) {
            Ok(outcome) => outcome,
            Err(err) => WriteOutcome::Failed(err),
        }
    }

    fn write_execution_tx(
        &mut self,
        row: &ExecutionRow,
        refs: ExecutionReferences,
    ) -> Result<WriteOutcome, MigrationError> {
        let key = row.arn.clone();
        let tx = self.conn.transaction().map_err(|err| storage(&key, &err))?;

        let existing = tx
            .query_row(
                "SELECT cumulus_id, updated_at FROM executions WHERE arn = ?1",
                params![row.arn],
                |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(|err| storage(&key, &err))?;

        let updated_at = effective_updated_at(row.updated_at, &key)?;
        let created_at = optional_rfc3339(row.created_at, &key)?.unwrap_or_else(|| updated_at.clone());
        let timestamp = optional_rfc3339(row.timestamp, &key)?;

        let outcome = match existing {
            None => {
                tx.execute(
                    "INSERT INTO executions (
                        arn, name, status, url, workflow_name, duration,
                        original_payload, final_payload, tasks, error,
                        cumulus_version, timestamp,
                        parent_cumulus_id, async_operation_cumulus_id, collection_cumulus_id,
                        created_at, updated_at
                    ) VALUES (
                        ?1, ?2, ?3, ?4, ?5, ?6,
                        ?7, ?8, ?9, ?10,
                        ?11, ?12,
                        ?13, ?14, ?15,
                        ?16, ?17
                    )",
                    params![
                        row.arn,
                        row.name,
                        row.status.as_str(),
                        row.url,
                        row.workflow_name,
                        row.duration,
                        json_text(row.original_payload.as_ref(), &key)?,
                        json_text(row.final_payload.as_ref(), &key)?,
                        json_text(row.tasks.as_ref(), &key)?,
                        json_text(row.error.as_ref(), &key)?,
                        row.cumulus_version,
                        timestamp,
                        refs.parent.map(|id| id.0),
                        refs.async_operation.map(|id| id.0),
                        refs.collection.map(|id| id.0),
                        created_at,
                        updated_at,
                    ],
                )
                .map_err(|err| storage(&key, &err))?;
                WriteOutcome::Committed(CumulusId(tx.last_insert_rowid()))
            }
            Some((cumulus_id, stored_updated_at)) => {
                if !incoming_is_newer(&updated_at, &stored_updated_at, &key)? {
                    tracing::debug!(arn = %key, "execution already migrated, skipping");
                    drop(tx);
                    return Ok(WriteOutcome::Skipped(SkipReason::AlreadyMigrated {
                        key,
                        existing: CumulusId(cumulus_id),
                    }));
                }

                let affected = tx
                    .execute(
                        "UPDATE executions SET
                            name = ?1, status = ?2, url = ?3, workflow_name = ?4, duration = ?5,
                            original_payload = ?6, final_payload = ?7, tasks = ?8, error = ?9,
                            cumulus_version = ?10, timestamp = ?11,
                            parent_cumulus_id = ?12, async_operation_cumulus_id = ?13,
                            collection_cumulus_id = ?14, updated_at = ?15
                         WHERE cumulus_id = ?16 AND updated_at = ?17",
                        params![
                            row.name,
                            row.status.as_str(),
                            row.url,
                            row.workflow_name,
                            row.duration,
                            json_text(row.original_payload.as_ref(), &key)?,
                            json_text(row.final_payload.as_ref(), &key)?,
                            json_text(row.tasks.as_ref(), &key)?,
                            json_text(row.error.as_ref(), &key)?,
                            row.cumulus_version,
                            timestamp,
                            refs.parent.map(|id| id.0),
                            refs.async_operation.map(|id| id.0),
                            refs.collection.map(|id| id.0),
                            updated_at,
                            cumulus_id,
                            stored_updated_at,
                        ],
                    )
                    .map_err(|err| storage(&key, &err))?;

                if affected == 0 {
                    tracing::warn!(arn = %key, "concurrent writer updated execution first");
                    return Err(MigrationError::UpdateRace { key });
                }
                WriteOutcome::Committed(CumulusId(cumulus_id))
            }
        };

        tx.commit().map_err(|err| storage(&key, &err))?;
        Ok(outcome)
    }

    /// Idempotent transactional write of one granule row together with its
    /// files and its execution join row.
    ///
    /// Files are written independently inside the shared transaction: a file
    /// failure is recorded and does not roll back siblings or the granule. A
    /// granule-row failure rolls back everything, since files carry a
    /// mandatory foreign key to the granule.
    pub fn write_granule_and_files(
        &mut self,
        row: &GranuleRow,
        files: &[FileRow],
        collection: CumulusId,
        execution: Option<CumulusId>,
    ) -> GranuleWriteReport {
        match self.write_granule_tx(row, files, collection, execution) {
            Ok(report) => report,
            Err(err) => GranuleWriteReport {
                granule: WriteOutcome::Failed(err),
                files_written: 0,
                file_failures: Vec::new(),
            },
        }
    }

    fn write_granule_tx(
        &mut self,
        row: &GranuleRow,
        files: &[FileRow],
        collection: CumulusId,
        execution: Option<CumulusId>,
    ) -> Result<GranuleWriteReport, MigrationError> {
        let key = row.granule_id.clone();
        let tx = self.conn.transaction().map_err(|err| storage(&key, &err))?;

        let existing = tx
            .query_row(
                "SELECT cumulus_id, updated_at FROM granules
                 WHERE granule_id = ?1 AND collection_cumulus_id = ?2",
                params![row.granule_id, collection.0],
                |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(|err| storage(&key, &err))?;

        let updated_at = effective_updated_at(row.updated_at, &key)?;
        let created_at = optional_rfc3339(row.created_at, &key)?.unwrap_or_else(|| updated_at.clone());

        let (granule_outcome, granule_cumulus_id) = match existing {
            None => {
                tx.execute(
                    "INSERT INTO granules (
                        granule_id, collection_cumulus_id, status, published, cmr_link, error,
                        product_volume, duration, time_to_archive, time_to_process,
                        beginning_date_time, ending_date_time, production_date_time,
                        last_update_date_time, processing_start_date_time, processing_end_date_time,
                        timestamp, created_at, updated_at
                    ) VALUES (
                        ?1, ?2, ?3, ?4, ?5, ?6,
                        ?7, ?8, ?9, ?10,
                        ?11, ?12, ?13,
                        ?14, ?15, ?16,
                        ?17, ?18, ?19
                    )",
                    params![
                        row.granule_id,
                        collection.0,
                        row.status.as_str(),
                        row.published,
                        row.cmr_link,
                        json_text(row.error.as_ref(), &key)?,
                        row.product_volume,
                        row.duration,
                        row.time_to_archive,
                        row.time_to_process,
                        optional_rfc3339(row.beginning_date_time, &key)?,
                        optional_rfc3339(row.ending_date_time, &key)?,
                        optional_rfc3339(row.production_date_time, &key)?,
                        optional_rfc3339(row.last_update_date_time, &key)?,
                        optional_rfc3339(row.processing_start_date_time, &key)?,
                        optional_rfc3339(row.processing_end_date_time, &key)?,
                        optional_rfc3339(row.timestamp, &key)?,
                        created_at,
                        updated_at,
                    ],
                )
                .map_err(|err| storage(&key, &err))?;
                let id = tx.last_insert_rowid();
                (WriteOutcome::Committed(CumulusId(id)), id)
            }
            Some((cumulus_id, stored_updated_at)) => {
                if !incoming_is_newer(&updated_at, &stored_updated_at, &key)? {
                    // The association to the triggering execution is still
                    // factual for a stale record; the join table is
                    // append-only and tolerates it.
                    if let Some(execution_id) = execution {
                        append_join_row(&tx, cumulus_id, execution_id, &key)?;
                    }
                    tx.commit().map_err(|err| storage(&key, &err))?;
                    tracing::debug!(granule_id = %key, "granule already migrated, skipping");
                    return Ok(GranuleWriteReport {
                        granule: WriteOutcome::Skipped(SkipReason::AlreadyMigrated {
                            key,
                            existing: CumulusId(cumulus_id),
                        }),
                        files_written: 0,
                        file_failures: Vec::new(),
                    });
                }

                let affected = tx
                    .execute(
                        "UPDATE granules SET
                            status = ?1, published = ?2, cmr_link = ?3, error = ?4,
                            product_volume = ?5, duration = ?6, time_to_archive = ?7,
                            time_to_process = ?8, beginning_date_time = ?9, ending_date_time = ?10,
                            production_date_time = ?11, last_update_date_time = ?12,
                            processing_start_date_time = ?13, processing_end_date_time = ?14,
                            timestamp = ?15, updated_at = ?16
                         WHERE cumulus_id = ?17 AND updated_at = ?18",
                        params![
                            row.status.as_str(),
                            row.published,
                            row.cmr_link,
                            json_text(row.error.as_ref(), &key)?,
                            row.product_volume,
                            row.duration,
                            row.time_to_archive,
                            row.time_to_process,
                            optional_rfc3339(row.beginning_date_time, &key)?,
                            optional_rfc3339(row.ending_date_time, &key)?,
                            optional_rfc3339(row.production_date_time, &key)?,
                            optional_rfc3339(row.last_update_date_time, &key)?,
                            optional_rfc3339(row.processing_start_date_time, &key)?,
                            optional_rfc3339(row.processing_end_date_time, &key)?,
                            optional_rfc3339(row.timestamp, &key)?,
                            updated_at,
                            cumulus_id,
                            stored_updated_at,
                        ],
                    )
                    .map_err(|err| storage(&key, &err))?;

                if affected == 0 {
                    tracing::warn!(granule_id = %key, "concurrent writer updated granule first");
                    return Err(MigrationError::UpdateRace { key });
                }
                (WriteOutcome::Committed(CumulusId(cumulus_id)), cumulus_id)
            }
        };

        let mut files_written = 0_u64;
        let mut file_failures = Vec::new();
        for file in files {
            match write_file_in_tx(&tx, granule_cumulus_id, file, &updated_at) {
                Ok(()) => files_written += 1,
                Err(err) => {
                    tracing::error!(file = %file.label(), granule_id = %key, %err, "file write failed");
                    file_failures.push(RecordFailure {
                        kind: EntityKind::File,
                        record_key: file.label(),
                        message: err.to_string(),
                    });
                }
            }
        }

        if let Some(execution_id) = execution {
            append_join_row(&tx, granule_cumulus_id, execution_id, &key)?;
        }

        tx.commit().map_err(|err| storage(&key, &err))?;
        Ok(GranuleWriteReport { granule: granule_outcome, files_written, file_failures })
    }

    /// Idempotent transactional write of one PDR row. Natural key: name.
    pub fn write_pdr(&mut self, row: &PdrRow, refs: PdrReferences) -> WriteOutcome {
        match self.write_pdr_tx(row, refs) {
            Ok(outcome) => outcome,
            Err(err) => WriteOutcome::Failed(err),
        }
    }

    fn write_pdr_tx(
        &mut self,
        row: &PdrRow,
        refs: PdrReferences,
    ) -> Result<WriteOutcome, MigrationError> {
        let key = row.name.clone();
        let tx = self.conn.transaction().map_err(|err| storage(&key, &err))?;

        let existing = tx
            .query_row(
                "SELECT cumulus_id, updated_at FROM pdrs WHERE name = ?1",
                params![row.name],
                |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?)),
            )
            .optional()
            .map_err(|err| storage(&key, &err))?;

        let updated_at = effective_updated_at(row.updated_at, &key)?;
        let created_at = optional_rfc3339(row.created_at, &key)?.unwrap_or_else(|| updated_at.clone());

        let outcome = match existing {
            None => {
                tx.execute(
                    "INSERT INTO pdrs (
                        name, collection_cumulus_id, provider_cumulus_id, execution_cumulus_id,
                        status, progress, pan_sent, pan_message, timestamp, created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        row.name,
                        refs.collection.0,
                        refs.provider.0,
                        refs.execution.map(|id| id.0),
                        row.status.as_str(),
                        row.progress,
                        row.pan_sent,
                        row.pan_message,
                        optional_rfc3339(row.timestamp, &key)?,
                        created_at,
                        updated_at,
                    ],
                )
                .map_err(|err| storage(&key, &err))?;
                WriteOutcome::Committed(CumulusId(tx.last_insert_rowid()))
            }
            Some((cumulus_id, stored_updated_at)) => {
                if !incoming_is_newer(&updated_at, &stored_updated_at, &key)? {
                    tracing::debug!(pdr = %key, "pdr already migrated, skipping");
                    drop(tx);
                    return Ok(WriteOutcome::Skipped(SkipReason::AlreadyMigrated {
                        key,
                        existing: CumulusId(cumulus_id),
                    }));
                }

                let affected = tx
                    .execute(
                        "UPDATE pdrs SET
                            collection_cumulus_id = ?1, provider_cumulus_id = ?2,
                            execution_cumulus_id = ?3, status = ?4, progress = ?5,
                            pan_sent = ?6, pan_message = ?7, timestamp = ?8, updated_at = ?9
                         WHERE cumulus_id = ?10 AND updated_at = ?11",
                        params![
                            refs.collection.0,
                            refs.provider.0,
                            refs.execution.map(|id| id.0),
                            row.status.as_str(),
                            row.progress,
                            row.pan_sent,
                            row.pan_message,
                            optional_rfc3339(row.timestamp, &key)?,
                            updated_at,
                            cumulus_id,
                            stored_updated_at,
                        ],
                    )
                    .map_err(|err| storage(&key, &err))?;

                if affected == 0 {
                    tracing::warn!(pdr = %key, "concurrent writer updated pdr first");
                    return Err(MigrationError::UpdateRace { key });
                }
                WriteOutcome::Committed(CumulusId(cumulus_id))
            }
        };

        tx.commit().map_err(|err| storage(&key, &err))?;
        Ok(outcome)
    }

    /// Load one execution row by arn.
    ///
    /// # Errors
    /// Returns an error when the read fails.
    pub fn execution_by_arn(&self, arn: &str) -> Result<Option<StoredExecution>> {
        self.conn
            .query_row(
                "SELECT cumulus_id, status, workflow_name, cumulus_version,
                        parent_cumulus_id, async_operation_cumulus_id, collection_cumulus_id,
                        updated_at
                 FROM executions WHERE arn = ?1",
                params![arn],
                |row| {
                    Ok(StoredExecution {
                        cumulus_id: CumulusId(row.get(0)?),
                        status: row.get(1)?,
                        workflow_name: row.get(2)?,
                        cumulus_version: row.get(3)?,
                        parent_cumulus_id: row.get::<_, Option<i64>>(4)?.map(CumulusId),
                        async_operation_cumulus_id: row.get::<_, Option<i64>>(5)?.map(CumulusId),
                        collection_cumulus_id: row.get::<_, Option<i64>>(6)?.map(CumulusId),
                        updated_at: row.get(7)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("failed to load execution {arn}"))
    }

    /// Load one granule row by natural key.
    ///
    /// # Errors
    /// Returns an error when the read fails.
    pub fn granule_by_id(
        &self,
        granule_id: &str,
        collection: CumulusId,
    ) -> Result<Option<StoredGranule>> {
        self.conn
            .query_row(
                "SELECT cumulus_id, status, published, cmr_link, product_volume, updated_at
                 FROM granules WHERE granule_id = ?1 AND collection_cumulus_id = ?2",
                params![granule_id, collection.0],
                |row| {
                    Ok(StoredGranule {
                        cumulus_id: CumulusId(row.get(0)?),
                        status: row.get(1)?,
                        published: row.get(2)?,
                        cmr_link: row.get(3)?,
                        product_volume: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("failed to load granule {granule_id}"))
    }

    /// Load the file rows belonging to a granule.
    ///
    /// # Errors
    /// Returns an error when the read fails.
    pub fn files_for_granule(&self, granule: CumulusId) -> Result<Vec<StoredFile>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT cumulus_id, bucket, key, file_name, file_size
                 FROM files WHERE granule_cumulus_id = ?1 ORDER BY cumulus_id ASC",
            )
            .context("failed to prepare file listing")?;
        let rows = stmt
            .query_map(params![granule.0], |row| {
                Ok(StoredFile {
                    cumulus_id: CumulusId(row.get(0)?),
                    bucket: row.get(1)?,
                    key: row.get(2)?,
                    file_name: row.get(3)?,
                    file_size: row.get(4)?,
                })
            })
            .context("failed to list files")?;

        let mut files = Vec::new();
        for row in rows {
            files.push(row.context("failed to read file row")?);
        }
        Ok(files)
    }

    /// Load one PDR row by name.
    ///
    /// # Errors
    /// Returns an error when the read fails.
    pub fn pdr_by_name(&self, name: &str) -> Result<Option<StoredPdr>> {
        self.conn
            .query_row(
                "SELECT cumulus_id, status, execution_cumulus_id, updated_at
                 FROM pdrs WHERE name = ?1",
                params![name],
                |row| {
                    Ok(StoredPdr {
                        cumulus_id: CumulusId(row.get(0)?),
                        status: row.get(1)?,
                        execution_cumulus_id: row.get::<_, Option<i64>>(2)?.map(CumulusId),
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("failed to load pdr {name}"))
    }

    /// Execution ids joined to a granule, in insertion order.
    ///
    /// # Errors
    /// Returns an error when the read fails.
    pub fn executions_for_granule(&self, granule: CumulusId) -> Result<Vec<CumulusId>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT execution_cumulus_id FROM granules_executions
                 WHERE granule_cumulus_id = ?1 ORDER BY rowid ASC",
            )
            .context("failed to prepare join listing")?;
        let rows = stmt
            .query_map(params![granule.0], |row| row.get::<_, i64>(0))
            .context("failed to list join rows")?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(CumulusId(row.context("failed to read join row")?));
        }
        Ok(ids)
    }

    /// Row count of one relational table.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn table_count(&self, table: &str) -> Result<u64> {
        let query = format!("SELECT COUNT(*) FROM {table}");
        let count = self
            .conn
            .query_row(&query, [], |row| row.get::<_, i64>(0))
            .with_context(|| format!("failed to count rows in {table}"))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

fn append_join_row(
    tx: &rusqlite::Transaction<'_>,
    granule: i64,
    execution: CumulusId,
    key: &str,
) -> Result<(), MigrationError> {
    tx.execute(
        "INSERT OR IGNORE INTO granules_executions (granule_cumulus_id, execution_cumulus_id)
         VALUES (?1, ?2)",
        params![granule, execution.0],
    )
    .map_err(|err| storage(key, &err))?;
    Ok(())
}

fn write_file_in_tx(
    tx: &rusqlite::Transaction<'_>,
    granule: i64,
    file: &FileRow,
    updated_at: &str,
) -> Result<(), MigrationError> {
    let label = file.label();

    // Files with a full (bucket, key) location update in place; location-less
    // files only ever insert. Two same-named files without a location
    // coexist, matching the weaker uniqueness the source store enforces.
    if let (Some(bucket), Some(object_key)) = (&file.bucket, &file.key) {
        let existing = tx
            .query_row(
                "SELECT cumulus_id FROM files
                 WHERE granule_cumulus_id = ?1 AND bucket = ?2 AND key = ?3",
                params![granule, bucket, object_key],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map_err(|err| storage(&label, &err))?;

        if let Some(cumulus_id) = existing {
            tx.execute(
                "UPDATE files SET
                    file_name = ?1, file_size = ?2, checksum_type = ?3, checksum_value = ?4,
                    source = ?5, path = ?6, updated_at = ?7
                 WHERE cumulus_id = ?8",
                params![
                    file.file_name,
                    file.file_size,
                    file.checksum_type,
                    file.checksum_value,
                    file.source,
                    file.path,
                    updated_at,
                    cumulus_id,
                ],
            )
            .map_err(|err| storage(&label, &err))?;
            return Ok(());
        }
    }

    tx.execute(
        "INSERT INTO files (
            granule_cumulus_id, bucket, key, file_name, file_size,
            checksum_type, checksum_value, source, path, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        params![
            granule,
            file.bucket,
            file.key,
            file.file_name,
            file.file_size,
            file.checksum_type,
            file.checksum_value,
            file.source,
            file.path,
            updated_at,
        ],
    )
    .map_err(|err| storage(&label, &err))?;
    Ok(())
}

fn storage(key: &str, err: &dyn Display) -> MigrationError {
    MigrationError::Storage { key: key.to_string(), detail: err.to_string() }
}

fn json_text(value: Option<&Value>, key: &str) -> Result<Option<String>, MigrationError> {
    match value {
        Some(value) => serde_json::to_string(value).map(Some).map_err(|err| storage(key, &err)),
        None => Ok(None),
    }
}

fn effective_updated_at(
    updated_at: Option<OffsetDateTime>,
    key: &str,
) -> Result<String, MigrationError> {
    rfc3339(updated_at.unwrap_or_else(OffsetDateTime::now_utc), key)
}

fn optional_rfc3339(
    value: Option<OffsetDateTime>,
    key: &str,
) -> Result<Option<String>, MigrationError> {
    value.map(|v| rfc3339(v, key)).transpose()
}

fn rfc3339(value: OffsetDateTime, key: &str) -> Result<String, MigrationError> {
    value.format(&Rfc3339).map_err(|err| storage(key, &err))
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc().format(&Rfc3339).context("failed to format RFC3339 timestamp")
}

/// Strictly-newer comparison on stored RFC3339 text.
fn incoming_is_newer(
    incoming: &str,
    stored: &str,
    key: &str,
) -> Result<bool, MigrationError> {
    let incoming_at = OffsetDateTime::parse(incoming, &Rfc3339).map_err(|err| storage(key, &err))?;
    let stored_at = OffsetDateTime::parse(stored, &Rfc3339).map_err(|err| storage(key, &err))?;
    Ok(incoming_at > stored_at)
}
