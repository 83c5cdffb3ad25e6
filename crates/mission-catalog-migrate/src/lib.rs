use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use mission_catalog_core::{
    EntityKind, MigrationError, MigrationSummary, RecordFailure, RecordTranslator,
    SummaryAccumulator, WriteOutcome,
};
use mission_catalog_store_sqlite::{
    ExecutionReferences, KvRecord, KvStore, PdrReferences, RelationalStore, ScanPage,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub use mission_catalog_store_sqlite::{EXECUTIONS_SCOPE, GRANULES_SCOPE, PDRS_SCOPE};

const DEFAULT_PAGE_SIZE: usize = 100;

/// Backing contract of [`ForwardCursor`]: one page per call, resumable via
/// the continuation token the previous page returned.
pub trait ScanSource {
    /// Fetch one page, resuming after `exclusive_start_key` when given.
    ///
    /// # Errors
    /// Returns an error when the underlying read fails.
    fn scan_page(&self, exclusive_start_key: Option<&str>, limit: usize) -> Result<ScanPage>;
}

/// One key-value scope exposed as a scan source.
pub struct KvScope<'a> {
    store: &'a KvStore,
    scope: &'a str,
}

impl<'a> KvScope<'a> {
    #[must_use]
    pub fn new(store: &'a KvStore, scope: &'a str) -> Self {
        Self { store, scope }
    }
}

impl ScanSource for KvScope<'_> {
    fn scan_page(&self, exclusive_start_key: Option<&str>, limit: usize) -> Result<ScanPage> {
        self.store.scan(self.scope, exclusive_start_key, limit)
    }
}

/// Lazy, restartable iterator over an unbounded collection. Pages are
/// fetched transparently; memory stays bounded by the page size. Delivery is
/// at-least-once per pass, which the idempotent writer absorbs.
pub struct ForwardCursor<S> {
    source: S,
    page_size: usize,
    buffer: VecDeque<KvRecord>,
    next_token: Option<String>,
    exhausted: bool,
}

impl<S: ScanSource> ForwardCursor<S> {
    #[must_use]
    pub fn new(source: S, page_size: usize) -> Self {
        Self {
            source,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            next_token: None,
            exhausted: false,
        }
    }

    fn refill(&mut self) -> Result<()> {
        while self.buffer.is_empty() && !self.exhausted {
            let page = self.source.scan_page(self.next_token.as_deref(), self.page_size)?;
            if page.next_token.is_none() {
                self.exhausted = true;
            }
            self.next_token = page.next_token;
            self.buffer.extend(page.records);
        }
        Ok(())
    }

    /// Next record without consuming it.
    ///
    /// # Errors
    /// Returns an error when refilling from the backing store fails.
    pub fn peek(&mut self) -> Result<Option<&KvRecord>> {
        self.refill()?;
        Ok(self.buffer.front())
    }

    /// Consume and return the next record.
    ///
    /// # Errors
    /// Returns an error when refilling from the backing store fails.
    pub fn advance(&mut self) -> Result<Option<KvRecord>> {
        self.refill()?;
        Ok(self.buffer.pop_front())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MigrationKind {
    Executions,
    Granules,
    Pdrs,
}

impl MigrationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Executions => "executions",
            Self::Granules => "granules",
            Self::Pdrs => "pdrs",
        }
    }
}

/// Optional server-side-style filters for the granule pass. Records filtered
/// out are never counted.
#[derive(Debug, Clone, Default)]
pub struct GranuleFilter {
    pub collection_id: Option<String>,
    pub granule_id: Option<String>,
}

impl GranuleFilter {
    fn matches(&self, raw: &Value) -> bool {
        if let Some(collection_id) = &self.collection_id {
            if raw.get("collectionId").and_then(Value::as_str) != Some(collection_id.as_str()) {
                return false;
            }
        }
        if let Some(granule_id) = &self.granule_id {
            if raw.get("granuleId").and_then(Value::as_str) != Some(granule_id.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Where the per-run error document is staged and durably stored.
#[derive(Debug, Clone)]
pub struct ErrorArchiveConfig {
    pub staging_dir: PathBuf,
    pub archive_root: PathBuf,
    pub prefix: String,
}

/// Invocation parameters handed in by the external invoker; no CLI surface
/// exists here.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    pub migrations: Vec<MigrationKind>,
    pub page_size: usize,
    pub granule_filter: GranuleFilter,
    pub error_archive: Option<ErrorArchiveConfig>,
    /// Injectable run timestamp for deterministic archive names; `None`
    /// falls back to the wall clock.
    pub run_timestamp: Option<OffsetDateTime>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            migrations: vec![MigrationKind::Executions, MigrationKind::Granules, MigrationKind::Pdrs],
            page_size: DEFAULT_PAGE_SIZE,
            granule_filter: GranuleFilter::default(),
            error_archive: None,
            run_timestamp: None,
        }
    }
}

/// One durable error document written for a migration kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredErrorArchive {
    pub key: String,
    pub sha256: String,
    pub errors: usize,
}

/// Result of one full bulk run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationReport {
    pub summary: MigrationSummary,
    pub failures: Vec<RecordFailure>,
    pub archives: Vec<StoredErrorArchive>,
}

/// Run the configured migration passes sequentially and archive their
/// failures.
///
/// # Errors
/// Returns an error on infrastructure failures (scan, archive I/O); per-record
/// failures are counted and recorded, never propagated.
pub fn run_migration(
    config: &MigrationConfig,
    kv: &KvStore,
    rel: &mut RelationalStore,
) -> Result<MigrationReport> {
    let translator = RecordTranslator::new()?;
    let timestamp = config
        .run_timestamp
        .unwrap_or_else(OffsetDateTime::now_utc)
        .format(&Rfc3339)
        .context("failed to format run timestamp")?;

    let mut summary = MigrationSummary::default();
    let mut failures = Vec::new();
    let mut archives = Vec::new();

    for kind in &config.migrations {
        let acc = match kind {
            MigrationKind::Executions => {
                migrate_executions(kv, rel, &translator, config.page_size)?
            }
            MigrationKind::Granules => migrate_granules_and_files(
                kv,
                rel,
                &translator,
                config.page_size,
                &config.granule_filter,
            )?,
            MigrationKind::Pdrs => migrate_pdrs(kv, rel, &translator, config.page_size)?,
        };

        if !acc.failures.is_empty() {
            if let Some(archive_config) = &config.error_archive {
                let stored = store_errors(archive_config, kind.as_str(), &acc.failures, &timestamp)?;
                archives.push(stored);
            }
        }

        summary.merge(acc.summary);
        failures.extend(acc.failures);
    }

    Ok(MigrationReport { summary, failures, archives })
}

/// Migrate every execution record, parents before children.
///
/// # Errors
/// Returns an error when the scan itself fails; per-record outcomes are
/// folded into the returned accumulator.
pub fn migrate_executions(
    kv: &KvStore,
    rel: &mut RelationalStore,
    translator: &RecordTranslator,
    page_size: usize,
) -> Result<SummaryAccumulator> {
    let mut acc = SummaryAccumulator::default();
    let mut cursor = ForwardCursor::new(KvScope::new(kv, EXECUTIONS_SCOPE), page_size);

    loop {
        let (key, raw) = match cursor.peek()? {
            Some(record) => (record.key.clone(), record.attributes.clone()),
            None => break,
        };

        acc.record_seen(EntityKind::Execution);
        let mut visited = BTreeSet::new();
        let outcome = migrate_execution_record(&raw, kv, rel, translator, &mut visited);
        match &outcome {
            WriteOutcome::Committed(_) => {}
            WriteOutcome::Skipped(reason) => tracing::info!(%reason, "skipping execution"),
            WriteOutcome::Failed(err) => {
                tracing::error!(arn = %key, %err, "could not create execution record");
            }
        }
        acc.record_outcome(EntityKind::Execution, &key, &outcome);

        cursor.advance()?;
    }

    tracing::info!(
        success = acc.summary.executions.success,
        "finished migrating execution records"
    );
    Ok(acc)
}

/// Migrate one execution record, recursively migrating a missing parent
/// first. The visited set turns a cyclic parent chain into an explicit
/// per-record failure instead of an infinite loop.
fn migrate_execution_record(
    raw: &Value,
    kv: &KvStore,
    rel: &mut RelationalStore,
    translator: &RecordTranslator,
    visited: &mut BTreeSet<String>,
) -> WriteOutcome {
    let row = match translator.translate_execution(raw) {
        Ok(row) => row,
        Err(err) => return WriteOutcome::Failed(err),
    };

    if !visited.insert(row.arn.clone()) {
        return WriteOutcome::Failed(MigrationError::CyclicParentChain { arn: row.arn });
    }

    let collection = match &row.collection {
        Some(collection) => {
            match rel.collection_cumulus_id(&collection.name, &collection.version) {
                Ok(resolved) => {
                    if resolved.is_none() {
                        tracing::warn!(
                            arn = %row.arn,
                            collection = %collection,
                            "collection not found, leaving execution reference null"
                        );
                    }
                    resolved
                }
                Err(err) => {
                    return WriteOutcome::Failed(MigrationError::Storage {
                        key: row.arn,
                        detail: err.to_string(),
                    })
                }
            }
        }
        None => None,
    };

    let async_operation = match &row.async_operation_id {
        Some(id) => match rel.async_operation_cumulus_id(id) {
            Ok(resolved) => resolved,
            Err(err) => {
                return WriteOutcome::Failed(MigrationError::Storage {
                    key: row.arn,
                    detail: err.to_string(),
                })
            }
        },
        None => None,
    };

    let parent = match &row.parent_arn {
        None => None,
        Some(parent_arn) => {
            let resolved = match rel.execution_cumulus_id(parent_arn) {
                Ok(resolved) => resolved,
                Err(err) => {
                    return WriteOutcome::Failed(MigrationError::Storage {
                        key: row.arn,
                        detail: err.to_string(),
                    })
                }
            };
            match resolved {
                Some(id) => Some(id),
                None => {
                    let parent_raw = match kv.get(EXECUTIONS_SCOPE, parent_arn) {
                        Ok(Some(parent_raw)) => parent_raw,
                        Ok(None) => {
                            return WriteOutcome::Failed(MigrationError::MissingRequiredReference {
                                key: row.arn,
                                reference: format!("parent execution {parent_arn}"),
                            })
                        }
                        Err(err) => {
                            return WriteOutcome::Failed(MigrationError::Storage {
                                key: row.arn,
                                detail: err.to_string(),
                            })
                        }
                    };
                    let parent_outcome =
                        migrate_execution_record(&parent_raw, kv, rel, translator, visited);
                    match parent_outcome.cumulus_id() {
                        Some(id) => Some(id),
                        None => {
                            let err = match parent_outcome {
                                WriteOutcome::Failed(err) => err,
                                _ => MigrationError::MissingRequiredReference {
                                    key: row.arn.clone(),
                                    reference: format!("parent execution {parent_arn}"),
                                },
                            };
                            return WriteOutcome::Failed(err);
                        }
                    }
                }
            }
        }
    };

    rel.write_execution(&row, ExecutionReferences { collection, parent, async_operation })
}

/// Migrate every granule record together with its files.
///
/// # Errors
/// Returns an error when the scan itself fails; per-record outcomes are
/// folded into the returned accumulator.
pub fn migrate_granules_and_files(
    kv: &KvStore,
    rel: &mut RelationalStore,
    translator: &RecordTranslator,
    page_size: usize,
    filter: &GranuleFilter,
) -> Result<SummaryAccumulator> {
    let mut acc = SummaryAccumulator::default();
    let mut cursor = ForwardCursor::new(KvScope::new(kv, GRANULES_SCOPE), page_size);

    loop {
        let (key, raw) = match cursor.peek()? {
            Some(record) => (record.key.clone(), record.attributes.clone()),
            None => break,
        };

        if !filter.matches(&raw) {
            cursor.advance()?;
            continue;
        }

        acc.record_seen(EntityKind::Granule);
        migrate_granule_and_files(&key, &raw, rel, translator, &mut acc);
        cursor.advance()?;
    }

    tracing::info!(
        granules = acc.summary.granules.success,
        files = acc.summary.files.success,
        "finished migrating granule and file records"
    );
    Ok(acc)
}

fn migrate_granule_and_files(
    key: &str,
    raw: &Value,
    rel: &mut RelationalStore,
    translator: &RecordTranslator,
    acc: &mut SummaryAccumulator,
) {
    let row = match translator.translate_granule(raw) {
        Ok(row) => row,
        Err(err) => {
            tracing::error!(granule_id = %key, %err, "could not translate granule record");
            acc.record_failure(EntityKind::Granule, key, &err.to_string());
            return;
        }
    };

    let collection = match rel.collection_cumulus_id(&row.collection.name, &row.collection.version) {
        Ok(Some(collection)) => collection,
        Ok(None) => {
            // Collections are a hard prerequisite; granules never create
            // them.
            let err = MigrationError::MissingRequiredReference {
                key: row.granule_id.clone(),
                reference: format!("collection {}", row.collection),
            };
            tracing::error!(granule_id = %row.granule_id, %err, "could not migrate granule");
            acc.record_failure(EntityKind::Granule, &row.granule_id, &err.to_string());
            return;
        }
        Err(err) => {
            acc.record_failure(EntityKind::Granule, &row.granule_id, &err.to_string());
            return;
        }
    };

    let raw_files = raw.get("files").and_then(Value::as_array).cloned().unwrap_or_default();
    let mut file_rows = Vec::new();
    let mut translation_failures = Vec::new();
    for raw_file in &raw_files {
        match translator.translate_file(raw_file) {
            Ok(file_row) => file_rows.push(file_row),
            Err(err) => translation_failures.push((file_label(raw_file), err)),
        }
    }

    let report = rel.write_granule_and_files(&row, &file_rows, collection, None);
    match &report.granule {
        WriteOutcome::Committed(_) => {
            acc.record_success(EntityKind::Granule);
            // Files are only processed once their granule row is in place.
            for _ in 0..raw_files.len() {
                acc.record_seen(EntityKind::File);
            }
            for _ in 0..report.files_written {
                acc.record_success(EntityKind::File);
            }
            for (label, err) in &translation_failures {
                tracing::error!(file = %label, %err, "could not translate file record");
                acc.record_failure(EntityKind::File, label, &err.to_string());
            }
            for failure in &report.file_failures {
                acc.record_failure(EntityKind::File, &failure.record_key, &failure.message);
            }
        }
        WriteOutcome::Skipped(reason) => {
            tracing::info!(%reason, "skipping granule");
            acc.record_skip(EntityKind::Granule);
        }
        WriteOutcome::Failed(err) => {
            tracing::error!(granule_id = %row.granule_id, %err, "could not migrate granule and files");
            acc.record_failure(EntityKind::Granule, &row.granule_id, &err.to_string());
        }
    }
}

fn file_label(raw: &Value) -> String {
    let bucket = raw.get("bucket").and_then(Value::as_str);
    let key = raw.get("key").and_then(Value::as_str);
    match (bucket, key) {
        (Some(bucket), Some(key)) => format!("{bucket}/{key}"),
        _ => raw
            .get("fileName")
            .and_then(Value::as_str)
            .map_or_else(|| "<unnamed file>".to_string(), str::to_string),
    }
}

/// Migrate every PDR record.
///
/// # Errors
/// Returns an error when the scan itself fails; per-record outcomes are
/// folded into the returned accumulator.
pub fn migrate_pdrs(
    kv: &KvStore,
    rel: &mut RelationalStore,
    translator: &RecordTranslator,
    page_size: usize,
) -> Result<SummaryAccumulator> {
    let mut acc = SummaryAccumulator::default();
    let mut cursor = ForwardCursor::new(KvScope::new(kv, PDRS_SCOPE), page_size);

    loop {
        let (key, raw) = match cursor.peek()? {
            Some(record) => (record.key.clone(), record.attributes.clone()),
            None => break,
        };

        acc.record_seen(EntityKind::Pdr);
        let outcome = migrate_pdr_record(&raw, rel, translator);
        match &outcome {
            WriteOutcome::Committed(_) => {}
            WriteOutcome::Skipped(reason) => tracing::info!(%reason, "skipping pdr"),
            WriteOutcome::Failed(err) => {
                tracing::error!(pdr = %key, %err, "could not create pdr record");
            }
        }
        acc.record_outcome(EntityKind::Pdr, &key, &outcome);

        cursor.advance()?;
    }

    tracing::info!(success = acc.summary.pdrs.success, "finished migrating pdr records");
    Ok(acc)
}

fn migrate_pdr_record(
    raw: &Value,
    rel: &mut RelationalStore,
    translator: &RecordTranslator,
) -> WriteOutcome {
    let row = match translator.translate_pdr(raw) {
        Ok(row) => row,
        Err(err) => return WriteOutcome::Failed(err),
    };

    let collection = match rel.collection_cumulus_id(&row.collection.name, &row.collection.version) {
        Ok(Some(collection)) => collection,
        Ok(None) => {
            return WriteOutcome::Failed(MigrationError::MissingRequiredReference {
                key: row.name,
                reference: format!("collection {}", row.collection),
            })
        }
        Err(err) => {
            return WriteOutcome::Failed(MigrationError::Storage {
                key: row.name,
                detail: err.to_string(),
            })
        }
    };

    let provider = match rel.provider_cumulus_id(&row.provider_name) {
        Ok(Some(provider)) => provider,
        Ok(None) => {
            return WriteOutcome::Failed(MigrationError::MissingRequiredReference {
                key: row.name,
                reference: format!("provider {}", row.provider_name),
            })
        }
        Err(err) => {
            return WriteOutcome::Failed(MigrationError::Storage {
                key: row.name,
                detail: err.to_string(),
            })
        }
    };

    let execution = match &row.execution_arn {
        Some(arn) => match rel.execution_cumulus_id(arn) {
            Ok(resolved) => resolved,
            Err(err) => {
                return WriteOutcome::Failed(MigrationError::Storage {
                    key: row.name,
                    detail: err.to_string(),
                })
            }
        },
        None => None,
    };

    rel.write_pdr(&row, PdrReferences { collection, provider, execution })
}

/// Stage the per-run error document locally, store it durably under the
/// archive root, and remove the staging artifact.
///
/// # Errors
/// Returns an error when staging, storing, or cleanup fails.
pub fn store_errors(
    config: &ErrorArchiveConfig,
    migration_name: &str,
    failures: &[RecordFailure],
    timestamp: &str,
) -> Result<StoredErrorArchive> {
    let document = serde_json::to_vec_pretty(&json!({ "errors": failures }))
        .context("failed to serialize error document")?;

    fs::create_dir_all(&config.staging_dir).with_context(|| {
        format!("failed to create staging directory {}", config.staging_dir.display())
    })?;
    let staging_path = config.staging_dir.join(format!("{migration_name}ErrorLog-{timestamp}.json"));
    fs::write(&staging_path, &document)
        .with_context(|| format!("failed to stage error log {}", staging_path.display()))?;

    let key = format!("{}/data-migration-{migration_name}-errors-{timestamp}.json", config.prefix);
    let destination = config.archive_root.join(&key);
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!("failed to create archive directory {}", parent.display())
        })?;
    }
    fs::copy(&staging_path, &destination)
        .with_context(|| format!("failed to store error log at {}", destination.display()))?;

    let mut hasher = Sha256::new();
    hasher.update(&document);
    let sha256 = format!("{:x}", hasher.finalize());

    fs::remove_file(&staging_path)
        .with_context(|| format!("failed to remove staging file {}", staging_path.display()))?;

    tracing::info!(%key, errors = failures.len(), "stored error log archive");
    Ok(StoredErrorArchive { key, sha256, errors: failures.len() })
}
