use std::fmt::{Display, Formatter};
use std::str::FromStr;

use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Closed per-record error taxonomy. Callers branch on the kind, never on
/// message text.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum MigrationError {
    #[error("schema validation failed for {key}: {detail}")]
    SchemaValidation { key: String, detail: String },
    #[error("update for {key} affected no rows; a concurrent writer won the race")]
    UpdateRace { key: String },
    #[error("cyclic parent chain detected while migrating execution {arn}")]
    CyclicParentChain { arn: String },
    #[error("missing required {reference} reference for {key}")]
    MissingRequiredReference { key: String, reference: String },
    #[error("storage failure for {key}: {detail}")]
    Storage { key: String, detail: String },
}

impl MigrationError {
    /// Transient errors are safe to re-attempt from outside; per-record fatal
    /// errors are not retryable without a fix to the source record.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpdateRace { .. } | Self::Storage { .. })
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("required configuration value is missing: {0}")]
    MissingValue(String),
    #[error("invalid configuration value for {name}: {detail}")]
    InvalidValue { name: String, detail: String },
}

/// Surrogate relational identity, stable once assigned.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CumulusId(pub i64);

impl Display for CumulusId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Execution,
    Granule,
    File,
    Pdr,
}

impl EntityKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Execution => "execution",
            Self::Granule => "granule",
            Self::File => "file",
            Self::Pdr => "pdr",
        }
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Unknown,
}

impl ExecutionStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GranuleStatus {
    Running,
    Completed,
    Failed,
}

impl GranuleStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PdrStatus {
    Running,
    Completed,
    Failed,
}

impl PdrStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Natural key of a collection. Source records carry it as a single
/// `"name___version"` string.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CollectionName {
    pub name: String,
    pub version: String,
}

impl CollectionName {
    /// Split a packed `name___version` collection id into its parts.
    ///
    /// # Errors
    /// Returns [`MigrationError::SchemaValidation`] when the separator is
    /// missing or either part is empty.
    pub fn parse(collection_id: &str) -> Result<Self, MigrationError> {
        let Some((name, version)) = collection_id.split_once("___") else {
            return Err(MigrationError::SchemaValidation {
                key: collection_id.to_string(),
                detail: "collection id must be formatted as name___version".to_string(),
            });
        };
        if name.is_empty() || version.is_empty() {
            return Err(MigrationError::SchemaValidation {
                key: collection_id.to_string(),
                detail: "collection name and version must be non-empty".to_string(),
            });
        }
        Ok(Self { name: name.to_string(), version: version.to_string() })
    }
}

impl Display for CollectionName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}___{}", self.name, self.version)
    }
}

/// Producer version declared on completion events, ordered numerically.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ProducerVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl FromStr for ProducerVersion {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidValue {
            name: "producer version".to_string(),
            detail: format!("expected major.minor.patch, got {value}"),
        };
        let mut parts = value.split('.');
        let major = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let minor = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let patch = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self { major, minor, patch })
    }
}

impl Display for ProducerVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Configuration for the steady-state dual-write path. Construction fails
/// fast when the minimum version is absent; a missing threshold is never
/// treated as "ineligible".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct DualWriteConfig {
    pub minimum_producer_version: ProducerVersion,
}

impl DualWriteConfig {
    /// Build the config from an optional raw value supplied by the invoker.
    ///
    /// # Errors
    /// Returns [`ConfigError::MissingValue`] when no value was supplied, or
    /// [`ConfigError::InvalidValue`] when it does not parse.
    pub fn from_minimum_version(value: Option<&str>) -> Result<Self, ConfigError> {
        let raw = value
            .ok_or_else(|| ConfigError::MissingValue("minimum producer version".to_string()))?;
        Ok(Self { minimum_producer_version: raw.parse()? })
    }
}

/// Translated execution row, carrying unresolved natural-key references for
/// downstream resolution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRow {
    pub arn: String,
    pub name: Option<String>,
    pub status: ExecutionStatus,
    pub url: Option<String>,
    pub workflow_name: Option<String>,
    pub duration: Option<f64>,
    pub original_payload: Option<Value>,
    pub final_payload: Option<Value>,
    pub tasks: Option<Value>,
    pub error: Option<Value>,
    pub cumulus_version: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub timestamp: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
    pub collection: Option<CollectionName>,
    pub parent_arn: Option<String>,
    pub async_operation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GranuleRow {
    pub granule_id: String,
    pub collection: CollectionName,
    pub status: GranuleStatus,
    pub published: Option<bool>,
    pub cmr_link: Option<String>,
    pub error: Option<Value>,
    /// Decimal string; 64-bit values survive translation without precision
    /// loss.
    pub product_volume: Option<String>,
    pub duration: Option<f64>,
    pub time_to_archive: Option<f64>,
    pub time_to_process: Option<f64>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub beginning_date_time: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub ending_date_time: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub production_date_time: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_update_date_time: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub processing_start_date_time: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub processing_end_date_time: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub timestamp: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRow {
    pub bucket: Option<String>,
    pub key: Option<String>,
    pub file_name: Option<String>,
    /// Decimal string, same policy as granule product volume.
    pub file_size: Option<String>,
    pub checksum_type: Option<String>,
    pub checksum_value: Option<String>,
    pub source: Option<String>,
    pub path: Option<String>,
}

impl FileRow {
    /// Display label used in error accounting. Files are identified by
    /// (bucket, key) when both are present, else by file name alone.
    #[must_use]
    pub fn label(&self) -> String {
        match (&self.bucket, &self.key) {
            (Some(bucket), Some(key)) => format!("{bucket}/{key}"),
            _ => self.file_name.clone().unwrap_or_else(|| "<unnamed file>".to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PdrRow {
    pub name: String,
    pub collection: CollectionName,
    pub provider_name: String,
    pub status: PdrStatus,
    pub progress: Option<f64>,
    pub pan_sent: Option<bool>,
    pub pan_message: Option<String>,
    pub execution_arn: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub timestamp: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

/// Why a write was skipped rather than committed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SkipReason {
    /// The row already exists and the incoming record is not strictly newer.
    /// Carries the existing surrogate id so dependent writes can still link
    /// to the row.
    AlreadyMigrated { key: String, existing: CumulusId },
}

impl Display for SkipReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyMigrated { key, .. } => {
                write!(f, "{key} was already migrated, skipping")
            }
        }
    }
}

/// Three-way outcome of a single logical write. Skips are expected, not
/// faults; failures carry the closed error kind.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Committed(CumulusId),
    Skipped(SkipReason),
    Failed(MigrationError),
}

impl WriteOutcome {
    /// Surrogate id of the row after a committed or skipped write.
    #[must_use]
    pub fn cumulus_id(&self) -> Option<CumulusId> {
        match self {
            Self::Committed(id) => Some(*id),
            Self::Skipped(SkipReason::AlreadyMigrated { existing, .. }) => Some(*existing),
            Self::Failed(_) => None,
        }
    }
}

fn schema_error(key: &str, detail: impl Into<String>) -> MigrationError {
    MigrationError::SchemaValidation { key: key.to_string(), detail: detail.into() }
}

fn object_fields<'a>(key: &str, raw: &'a Value) -> Result<&'a Map<String, Value>, MigrationError> {
    raw.as_object().ok_or_else(|| schema_error(key, "record is not a JSON object"))
}

fn field_str(fields: &Map<String, Value>, name: &str) -> Option<String> {
    fields.get(name).and_then(Value::as_str).map(str::to_string)
}

fn field_f64(fields: &Map<String, Value>, name: &str) -> Option<f64> {
    fields.get(name).and_then(Value::as_f64)
}

fn field_bool(fields: &Map<String, Value>, name: &str) -> Option<bool> {
    fields.get(name).and_then(Value::as_bool)
}

fn field_json(fields: &Map<String, Value>, name: &str) -> Option<Value> {
    match fields.get(name) {
        None | Some(Value::Null) => None,
        Some(value) => Some(value.clone()),
    }
}

/// Render a source numeric field as a decimal string. `serde_json::Number`
/// keeps the original token, so 64-bit integers survive verbatim.
fn field_decimal_string(fields: &Map<String, Value>, name: &str) -> Option<String> {
    match fields.get(name) {
        Some(Value::Number(number)) => Some(number.to_string()),
        Some(Value::String(text)) if !text.is_empty() => Some(text.clone()),
        _ => None,
    }
}

fn datetime_from_value(key: &str, name: &str, value: &Value) -> Result<OffsetDateTime, MigrationError> {
    if let Some(millis) = value.as_i64() {
        return OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
            .map_err(|err| schema_error(key, format!("{name} is out of range: {err}")));
    }
    if let Some(text) = value.as_str() {
        return OffsetDateTime::parse(text, &Rfc3339)
            .map_err(|err| schema_error(key, format!("{name} is not RFC3339: {err}")));
    }
    Err(schema_error(key, format!("{name} must be epoch milliseconds or RFC3339 text")))
}

/// Absent or null date fields stay `None`; the translation layer never
/// substitutes the current time.
fn field_datetime(
    fields: &Map<String, Value>,
    key: &str,
    name: &str,
) -> Result<Option<OffsetDateTime>, MigrationError> {
    match fields.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => datetime_from_value(key, name, value).map(Some),
    }
}

fn execution_schema() -> Value {
    json!({
        "type": "object",
        "required": ["arn", "status", "createdAt", "updatedAt"],
        "properties": {
            "arn": { "type": "string", "minLength": 1 },
            "name": { "type": "string" },
            "status": { "enum": ["running", "completed", "failed", "unknown"] },
            "execution": { "type": "string" },
            "type": { "type": "string" },
            "duration": { "type": "number" },
            "parentArn": { "type": "string", "minLength": 1 },
            "asyncOperationId": { "type": "string", "minLength": 1 },
            "collectionId": { "type": "string", "minLength": 1 },
            "cumulusVersion": { "type": "string" },
            "tasks": { "type": "object" },
            "error": { "type": "object" },
            "originalPayload": { "type": "object" },
            "finalPayload": { "type": "object" },
            "timestamp": { "type": ["number", "string"] },
            "createdAt": { "type": ["number", "string"] },
            "updatedAt": { "type": ["number", "string"] }
        }
    })
}

fn granule_schema() -> Value {
    json!({
        "type": "object",
        "required": ["granuleId", "collectionId", "status", "createdAt", "updatedAt"],
        "properties": {
            "granuleId": { "type": "string", "minLength": 1 },
            "collectionId": { "type": "string", "minLength": 1 },
            "status": { "enum": ["running", "completed", "failed"] },
            "published": { "type": "boolean" },
            "cmrLink": { "type": "string" },
            "error": { "type": "object" },
            "productVolume": { "type": ["number", "string"] },
            "duration": { "type": "number" },
            "timeToArchive": { "type": "number" },
            "timeToPreprocess": { "type": "number" },
            "beginningDateTime": { "type": ["number", "string"] },
            "endingDateTime": { "type": ["number", "string"] },
            "productionDateTime": { "type": ["number", "string"] },
            "lastUpdateDateTime": { "type": ["number", "string"] },
            "processingStartDateTime": { "type": ["number", "string"] },
            "processingEndDateTime": { "type": ["number", "string"] },
            "timestamp": { "type": ["number", "string"] },
            "createdAt": { "type": ["number", "string"] },
            "updatedAt": { "type": ["number", "string"] },
            "files": { "type": "array", "items": { "type": "object" } }
        }
    })
}

fn file_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "bucket": { "type": "string", "minLength": 1 },
            "key": { "type": "string", "minLength": 1 },
            "fileName": { "type": "string", "minLength": 1 },
            "size": { "type": ["number", "string"] },
            "checksum": { "type": "string" },
            "checksumType": { "type": "string" },
            "source": { "type": "string" },
            "path": { "type": "string" }
        }
    })
}

fn pdr_schema() -> Value {
    json!({
        "type": "object",
        "required": ["pdrName", "collectionId", "provider", "status", "createdAt", "updatedAt"],
        "properties": {
            "pdrName": { "type": "string", "minLength": 1 },
            "collectionId": { "type": "string", "minLength": 1 },
            "provider": { "type": "string", "minLength": 1 },
            "status": { "enum": ["running", "completed", "failed"] },
            "progress": { "type": "number" },
            "PANSent": { "type": "boolean" },
            "PANmessage": { "type": "string" },
            "execution": { "type": "string" },
            "timestamp": { "type": ["number", "string"] },
            "createdAt": { "type": ["number", "string"] },
            "updatedAt": { "type": ["number", "string"] }
        }
    })
}

/// Pure mapping from loosely-typed source attribute maps to typed relational
/// rows. Untyped maps do not survive past this boundary.
pub struct RecordTranslator {
    execution: JSONSchema,
    granule: JSONSchema,
    file: JSONSchema,
    pdr: JSONSchema,
}

impl RecordTranslator {
    /// Compile the per-entity-kind source schemas.
    ///
    /// # Errors
    /// Returns [`ConfigError::InvalidValue`] when a declared schema does not
    /// compile.
    pub fn new() -> Result<Self, ConfigError> {
        Ok(Self {
            execution: compile_schema("execution", &execution_schema())?,
            granule: compile_schema("granule", &granule_schema())?,
            file: compile_schema("file", &file_schema())?,
            pdr: compile_schema("pdr", &pdr_schema())?,
        })
    }

    /// Translate a source execution attribute map.
    ///
    /// # Errors
    /// Returns [`MigrationError::SchemaValidation`] when the record does not
    /// match the execution schema or a field cannot be coerced.
    pub fn translate_execution(&self, raw: &Value) -> Result<ExecutionRow, MigrationError> {
        let key = record_key(raw, "arn");
        validate(&self.execution, &key, raw)?;
        let fields = object_fields(&key, raw)?;

        let collection = match field_str(fields, "collectionId") {
            Some(collection_id) => Some(CollectionName::parse(&collection_id)?),
            None => None,
        };

        Ok(ExecutionRow {
            arn: field_str(fields, "arn")
                .ok_or_else(|| schema_error(&key, "arn is required"))?,
            name: field_str(fields, "name"),
            status: field_str(fields, "status")
                .as_deref()
                .and_then(ExecutionStatus::parse)
                .ok_or_else(|| schema_error(&key, "status is not a known execution status"))?,
            url: field_str(fields, "execution"),
            workflow_name: field_str(fields, "type"),
            duration: field_f64(fields, "duration"),
            original_payload: field_json(fields, "originalPayload"),
            final_payload: field_json(fields, "finalPayload"),
            tasks: field_json(fields, "tasks"),
            error: field_json(fields, "error"),
            cumulus_version: field_str(fields, "cumulusVersion"),
            timestamp: field_datetime(fields, &key, "timestamp")?,
            created_at: field_datetime(fields, &key, "createdAt")?,
            updated_at: field_datetime(fields, &key, "updatedAt")?,
            collection,
            parent_arn: field_str(fields, "parentArn"),
            async_operation_id: field_str(fields, "asyncOperationId"),
        })
    }

    /// Translate a source granule attribute map. Nested files are translated
    /// separately via [`Self::translate_file`] so each file can fail on its
    /// own.
    ///
    /// # Errors
    /// Returns [`MigrationError::SchemaValidation`] when the record does not
    /// match the granule schema or a field cannot be coerced.
    pub fn translate_granule(&self, raw: &Value) -> Result<GranuleRow, MigrationError> {
        let key = record_key(raw, "granuleId");
        validate(&self.granule, &key, raw)?;
        let fields = object_fields(&key, raw)?;

        let collection_id = field_str(fields, "collectionId")
            .ok_or_else(|| schema_error(&key, "collectionId is required"))?;

        Ok(GranuleRow {
            granule_id: field_str(fields, "granuleId")
                .ok_or_else(|| schema_error(&key, "granuleId is required"))?,
            collection: CollectionName::parse(&collection_id)?,
            status: field_str(fields, "status")
                .as_deref()
                .and_then(GranuleStatus::parse)
                .ok_or_else(|| schema_error(&key, "status is not a known granule status"))?,
            published: field_bool(fields, "published"),
            cmr_link: field_str(fields, "cmrLink"),
            error: field_json(fields, "error"),
            product_volume: field_decimal_string(fields, "productVolume"),
            duration: field_f64(fields, "duration"),
            time_to_archive: field_f64(fields, "timeToArchive"),
            time_to_process: field_f64(fields, "timeToPreprocess"),
            beginning_date_time: field_datetime(fields, &key, "beginningDateTime")?,
            ending_date_time: field_datetime(fields, &key, "endingDateTime")?,
            production_date_time: field_datetime(fields, &key, "productionDateTime")?,
            last_update_date_time: field_datetime(fields, &key, "lastUpdateDateTime")?,
            processing_start_date_time: field_datetime(fields, &key, "processingStartDateTime")?,
            processing_end_date_time: field_datetime(fields, &key, "processingEndDateTime")?,
            timestamp: field_datetime(fields, &key, "timestamp")?,
            created_at: field_datetime(fields, &key, "createdAt")?,
            updated_at: field_datetime(fields, &key, "updatedAt")?,
        })
    }

    /// Translate one nested file object from a granule record.
    ///
    /// # Errors
    /// Returns [`MigrationError::SchemaValidation`] when the file object does
    /// not match the file schema.
    pub fn translate_file(&self, raw: &Value) -> Result<FileRow, MigrationError> {
        let key = record_key(raw, "fileName");
        validate(&self.file, &key, raw)?;
        let fields = object_fields(&key, raw)?;

        Ok(FileRow {
            bucket: field_str(fields, "bucket"),
            key: field_str(fields, "key"),
            file_name: field_str(fields, "fileName"),
            file_size: field_decimal_string(fields, "size"),
            checksum_type: field_str(fields, "checksumType"),
            checksum_value: field_str(fields, "checksum"),
            source: field_str(fields, "source"),
            path: field_str(fields, "path"),
        })
    }

    /// Translate a source PDR attribute map.
    ///
    /// # Errors
    /// Returns [`MigrationError::SchemaValidation`] when the record does not
    /// match the PDR schema or a field cannot be coerced.
    pub fn translate_pdr(&self, raw: &Value) -> Result<PdrRow, MigrationError> {
        let key = record_key(raw, "pdrName");
        validate(&self.pdr, &key, raw)?;
        let fields = object_fields(&key, raw)?;

        let collection_id = field_str(fields, "collectionId")
            .ok_or_else(|| schema_error(&key, "collectionId is required"))?;

        Ok(PdrRow {
            name: field_str(fields, "pdrName")
                .ok_or_else(|| schema_error(&key, "pdrName is required"))?,
            collection: CollectionName::parse(&collection_id)?,
            provider_name: field_str(fields, "provider")
                .ok_or_else(|| schema_error(&key, "provider is required"))?,
            status: field_str(fields, "status")
                .as_deref()
                .and_then(PdrStatus::parse)
                .ok_or_else(|| schema_error(&key, "status is not a known PDR status"))?,
            progress: field_f64(fields, "progress"),
            pan_sent: field_bool(fields, "PANSent"),
            pan_message: field_str(fields, "PANmessage"),
            execution_arn: field_str(fields, "execution"),
            timestamp: field_datetime(fields, &key, "timestamp")?,
            created_at: field_datetime(fields, &key, "createdAt")?,
            updated_at: field_datetime(fields, &key, "updatedAt")?,
        })
    }
}

fn compile_schema(name: &str, schema: &Value) -> Result<JSONSchema, ConfigError> {
    JSONSchema::compile(schema).map_err(|err| ConfigError::InvalidValue {
        name: format!("{name} schema"),
        detail: err.to_string(),
    })
}

fn validate(schema: &JSONSchema, key: &str, raw: &Value) -> Result<(), MigrationError> {
    if let Err(errors) = schema.validate(raw) {
        let detail = errors.map(|err| err.to_string()).collect::<Vec<_>>().join("; ");
        return Err(schema_error(key, detail));
    }
    Ok(())
}

fn record_key(raw: &Value, name: &str) -> String {
    raw.get(name)
        .and_then(Value::as_str)
        .map_or_else(|| "<unknown>".to_string(), str::to_string)
}

/// A parsed workflow-completion message. Only the fields this engine needs
/// survive parsing; granule and PDR payloads stay raw until translated.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionEvent {
    pub execution_arn: String,
    pub execution_name: Option<String>,
    pub status: ExecutionStatus,
    pub workflow_name: Option<String>,
    pub producer_version: Option<ProducerVersion>,
    pub parent_arn: Option<String>,
    pub async_operation_id: Option<String>,
    pub collection: Option<CollectionName>,
    pub provider_name: Option<String>,
    pub workflow_start_time: Option<OffsetDateTime>,
    pub workflow_stop_time: Option<OffsetDateTime>,
    pub original_payload: Option<Value>,
    pub final_payload: Option<Value>,
    pub granule_payloads: Vec<Value>,
    pub pdr_payload: Option<Value>,
}

impl CompletionEvent {
    /// Parse a completion message. An unparseable message is unprocessable
    /// and belongs on the dead-letter path.
    ///
    /// # Errors
    /// Returns [`MigrationError::SchemaValidation`] when required nested
    /// fields are missing or malformed.
    pub fn parse(message: &Value) -> Result<Self, MigrationError> {
        let meta = message
            .get("meta")
            .and_then(Value::as_object)
            .ok_or_else(|| schema_error("<message>", "meta section is required"))?;

        let execution_arn = field_str(meta, "executionArn")
            .ok_or_else(|| schema_error("<message>", "meta.executionArn is required"))?;

        let status = field_str(meta, "status")
            .as_deref()
            .and_then(ExecutionStatus::parse)
            .ok_or_else(|| {
                schema_error(&execution_arn, "meta.status is not a known execution status")
            })?;

        // An unparseable version is indistinguishable from an absent one for
        // gating purposes: both make the event ineligible.
        let producer_version = field_str(meta, "producerVersion")
            .and_then(|raw| raw.parse::<ProducerVersion>().ok());

        let collection = match meta.get("collection").and_then(Value::as_object) {
            Some(collection) => {
                match (field_str(collection, "name"), field_str(collection, "version")) {
                    (Some(name), Some(version)) => Some(CollectionName { name, version }),
                    _ => None,
                }
            }
            None => None,
        };

        let provider_name = meta
            .get("provider")
            .and_then(Value::as_object)
            .and_then(|provider| field_str(provider, "id"));

        let payload = message.get("payload").and_then(Value::as_object);
        let granule_payloads = payload
            .and_then(|p| p.get("granules"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let pdr_payload = payload.and_then(|p| field_json(p, "pdr"));

        Ok(Self {
            execution_arn: execution_arn.clone(),
            execution_name: field_str(meta, "executionName"),
            status,
            workflow_name: field_str(meta, "workflowName"),
            producer_version,
            parent_arn: field_str(meta, "parentExecutionArn"),
            async_operation_id: field_str(meta, "asyncOperationId"),
            collection,
            provider_name,
            workflow_start_time: field_datetime(meta, &execution_arn, "workflowStartTime")?,
            workflow_stop_time: field_datetime(meta, &execution_arn, "workflowStopTime")?,
            original_payload: meta.get("originalPayload").cloned().filter(|v| !v.is_null()),
            final_payload: meta.get("finalPayload").cloned().filter(|v| !v.is_null()),
            granule_payloads,
            pdr_payload,
        })
    }

    #[must_use]
    pub fn has_granules(&self) -> bool {
        !self.granule_payloads.is_empty()
    }

    #[must_use]
    pub fn has_pdr(&self) -> bool {
        self.pdr_payload.is_some()
    }
}

/// Preconditions checked before a relational write is attempted for an
/// event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    Version,
    Parent,
    AsyncOperation,
    Collection,
    Provider,
}

impl Display for GateKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Version => "version",
            Self::Parent => "parent",
            Self::AsyncOperation => "async operation",
            Self::Collection => "collection",
            Self::Provider => "provider",
        };
        f.write_str(label)
    }
}

/// Surrogate ids the caller resolved from the relational store before gate
/// evaluation. `None` means the lookup found nothing (or the event carries
/// no such reference; the event itself distinguishes the two).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolvedReferences {
    pub collection: Option<CumulusId>,
    pub provider: Option<CumulusId>,
    pub parent_execution: Option<CumulusId>,
    pub async_operation: Option<CumulusId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Ineligible(Vec<GateKind>),
}

impl Eligibility {
    #[must_use]
    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::Eligible)
    }
}

/// Per-entity-kind relational-write eligibility for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EligibilityReport {
    pub execution: Eligibility,
    pub pdr: Eligibility,
    pub granules: Eligibility,
}

/// Evaluate every gate for one event. Pure; existence lookups happen before
/// this call and arrive via `refs`.
#[must_use]
pub fn evaluate_event_gates(
    event: &CompletionEvent,
    refs: &ResolvedReferences,
    config: &DualWriteConfig,
) -> EligibilityReport {
    let version_ok = event
        .producer_version
        .is_some_and(|version| version >= config.minimum_producer_version);
    let collection_ok = refs.collection.is_some();
    let parent_ok = event.parent_arn.is_none() || refs.parent_execution.is_some();
    let async_op_ok = event.async_operation_id.is_none() || refs.async_operation.is_some();
    let provider_ok = refs.provider.is_some();

    let mut execution_failures = Vec::new();
    if !version_ok {
        execution_failures.push(GateKind::Version);
    }
    if !collection_ok {
        execution_failures.push(GateKind::Collection);
    }
    if !parent_ok {
        execution_failures.push(GateKind::Parent);
    }
    if !async_op_ok {
        execution_failures.push(GateKind::AsyncOperation);
    }

    let execution = if execution_failures.is_empty() {
        Eligibility::Eligible
    } else {
        Eligibility::Ineligible(execution_failures.clone())
    };

    // PDR and granule rows reference the execution, so its gates apply
    // transitively.
    let pdr = if execution_failures.is_empty() && provider_ok {
        Eligibility::Eligible
    } else {
        let mut failures = execution_failures.clone();
        if !provider_ok {
            failures.push(GateKind::Provider);
        }
        Eligibility::Ineligible(failures)
    };

    let granules = if execution_failures.is_empty() {
        Eligibility::Eligible
    } else {
        Eligibility::Ineligible(execution_failures)
    };

    EligibilityReport { execution, pdr, granules }
}

/// Non-negative counters for one entity kind within one run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct MigrationCounts {
    pub dynamo_records: u64,
    pub success: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl MigrationCounts {
    pub fn record_seen(&mut self) {
        self.dynamo_records += 1;
    }

    pub fn record_success(&mut self) {
        self.success += 1;
    }

    pub fn record_failure(&mut self) {
        self.failed += 1;
    }

    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }

    pub fn merge(&mut self, other: Self) {
        self.dynamo_records += other.dynamo_records;
        self.success += other.success;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }

    /// Every record seen must be accounted for exactly once.
    #[must_use]
    pub fn is_balanced(&self) -> bool {
        self.success + self.failed + self.skipped == self.dynamo_records
    }
}

/// Aggregate counters across entity kinds, mergeable between independently
/// run passes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct MigrationSummary {
    pub executions: MigrationCounts,
    pub granules: MigrationCounts,
    pub files: MigrationCounts,
    pub pdrs: MigrationCounts,
}

impl MigrationSummary {
    #[must_use]
    pub fn counts(&self, kind: EntityKind) -> MigrationCounts {
        match kind {
            EntityKind::Execution => self.executions,
            EntityKind::Granule => self.granules,
            EntityKind::File => self.files,
            EntityKind::Pdr => self.pdrs,
        }
    }

    pub fn counts_mut(&mut self, kind: EntityKind) -> &mut MigrationCounts {
        match kind {
            EntityKind::Execution => &mut self.executions,
            EntityKind::Granule => &mut self.granules,
            EntityKind::File => &mut self.files,
            EntityKind::Pdr => &mut self.pdrs,
        }
    }

    pub fn merge(&mut self, other: Self) {
        self.executions.merge(other.executions);
        self.granules.merge(other.granules);
        self.files.merge(other.files);
        self.pdrs.merge(other.pdrs);
    }

    #[must_use]
    pub fn is_balanced(&self) -> bool {
        self.executions.is_balanced()
            && self.granules.is_balanced()
            && self.files.is_balanced()
            && self.pdrs.is_balanced()
    }
}

/// One per-record failure, preserved for the durable error archive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecordFailure {
    pub kind: EntityKind,
    pub record_key: String,
    pub message: String,
}

/// Counters plus the detailed failure list for a run. No record is dropped
/// without being counted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SummaryAccumulator {
    pub summary: MigrationSummary,
    pub failures: Vec<RecordFailure>,
}

impl SummaryAccumulator {
    pub fn record_seen(&mut self, kind: EntityKind) {
        self.summary.counts_mut(kind).record_seen();
    }

    pub fn record_success(&mut self, kind: EntityKind) {
        self.summary.counts_mut(kind).record_success();
    }

    pub fn record_skip(&mut self, kind: EntityKind) {
        self.summary.counts_mut(kind).record_skip();
    }

    pub fn record_failure(&mut self, kind: EntityKind, record_key: &str, message: &str) {
        self.summary.counts_mut(kind).record_failure();
        self.failures.push(RecordFailure {
            kind,
            record_key: record_key.to_string(),
            message: message.to_string(),
        });
    }

    /// Fold an outcome into the counters for `kind`, keyed by `record_key`.
    pub fn record_outcome(&mut self, kind: EntityKind, record_key: &str, outcome: &WriteOutcome) {
        match outcome {
            WriteOutcome::Committed(_) => self.record_success(kind),
            WriteOutcome::Skipped(_) => self.record_skip(kind),
            WriteOutcome::Failed(err) => self.record_failure(kind, record_key, &err.to_string()),
        }
    }

    pub fn merge(&mut self, other: Self) {
        self.summary.merge(other.summary);
        self.failures.extend(other.failures);
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn translator() -> RecordTranslator {
        match RecordTranslator::new() {
            Ok(translator) => translator,
            Err(err) => panic!("translator schemas should compile: {err}"),
        }
    }

    fn sample_execution(arn: &str) -> Value {
        json!({
            "arn": arn,
            "name": "run-0001",
            "status": "completed",
            "type": "IngestGranule",
            "execution": "https://console.example.com/executions/run-0001",
            "collectionId": "MOD09GQ___006",
            "duration": 4.5,
            "createdAt": 1_614_094_000_000_i64,
            "updatedAt": 1_614_094_300_000_i64,
            "timestamp": 1_614_094_300_000_i64
        })
    }

    #[test]
    fn translate_execution_maps_fields_and_collection() {
        let row = match translator().translate_execution(&sample_execution("arn:exec:1")) {
            Ok(row) => row,
            Err(err) => panic!("translation should succeed: {err}"),
        };

        assert_eq!(row.arn, "arn:exec:1");
        assert_eq!(row.status, ExecutionStatus::Completed);
        assert_eq!(row.workflow_name.as_deref(), Some("IngestGranule"));
        let collection = match row.collection {
            Some(collection) => collection,
            None => panic!("collection should be present"),
        };
        assert_eq!(collection.name, "MOD09GQ");
        assert_eq!(collection.version, "006");
        assert!(row.parent_arn.is_none());
        assert!(row.async_operation_id.is_none());
    }

    #[test]
    fn translate_execution_leaves_absent_optionals_null() {
        let raw = json!({
            "arn": "arn:exec:sparse",
            "status": "running",
            "createdAt": 1_614_094_000_000_i64,
            "updatedAt": 1_614_094_000_000_i64
        });
        let row = match translator().translate_execution(&raw) {
            Ok(row) => row,
            Err(err) => panic!("translation should succeed: {err}"),
        };

        assert!(row.duration.is_none());
        assert!(row.timestamp.is_none());
        assert!(row.original_payload.is_none());
        assert!(row.collection.is_none());
    }

    #[test]
    fn translate_execution_rejects_unknown_status() {
        let mut raw = sample_execution("arn:exec:bad-status");
        raw["status"] = json!("paused");

        match translator().translate_execution(&raw) {
            Err(MigrationError::SchemaValidation { key, .. }) => {
                assert_eq!(key, "arn:exec:bad-status");
            }
            other => panic!("expected schema validation failure, got {other:?}"),
        }
    }

    #[test]
    fn translate_execution_rejects_missing_arn() {
        let raw = json!({
            "status": "completed",
            "createdAt": 1_614_094_000_000_i64,
            "updatedAt": 1_614_094_000_000_i64
        });

        match translator().translate_execution(&raw) {
            Err(MigrationError::SchemaValidation { .. }) => {}
            other => panic!("expected schema validation failure, got {other:?}"),
        }
    }

    #[test]
    fn translate_granule_keeps_product_volume_as_decimal_string() {
        let raw = json!({
            "granuleId": "G-0001",
            "collectionId": "MOD09GQ___006",
            "status": "completed",
            "productVolume": 9_007_199_254_740_993_i64,
            "createdAt": 1_614_094_000_000_i64,
            "updatedAt": 1_614_094_000_000_i64
        });
        let row = match translator().translate_granule(&raw) {
            Ok(row) => row,
            Err(err) => panic!("translation should succeed: {err}"),
        };

        // One above 2^53; a float round-trip would corrupt it.
        assert_eq!(row.product_volume.as_deref(), Some("9007199254740993"));
    }

    #[test]
    fn translate_granule_missing_size_is_null_not_zero() {
        let raw = json!({
            "granuleId": "G-0002",
            "collectionId": "MOD09GQ___006",
            "status": "running",
            "createdAt": 1_614_094_000_000_i64,
            "updatedAt": 1_614_094_000_000_i64
        });
        let row = match translator().translate_granule(&raw) {
            Ok(row) => row,
            Err(err) => panic!("translation should succeed: {err}"),
        };

        assert!(row.product_volume.is_none());
        assert!(row.duration.is_none());
        assert!(row.time_to_archive.is_none());
        assert!(row.beginning_date_time.is_none());
    }

    #[test]
    fn translate_granule_accepts_rfc3339_dates() {
        let raw = json!({
            "granuleId": "G-0003",
            "collectionId": "MOD09GQ___006",
            "status": "completed",
            "beginningDateTime": "2021-02-23T15:30:00Z",
            "createdAt": 1_614_094_000_000_i64,
            "updatedAt": 1_614_094_000_000_i64
        });
        let row = match translator().translate_granule(&raw) {
            Ok(row) => row,
            Err(err) => panic!("translation should succeed: {err}"),
        };

        let begin = match row.beginning_date_time {
            Some(begin) => begin,
            None => panic!("beginning date should be set"),
        };
        assert_eq!(begin.unix_timestamp(), 1_614_094_200);
    }

    #[test]
    fn translate_granule_rejects_malformed_date() {
        let raw = json!({
            "granuleId": "G-0004",
            "collectionId": "MOD09GQ___006",
            "status": "completed",
            "beginningDateTime": "Tue Feb 23 2021",
            "createdAt": 1_614_094_000_000_i64,
            "updatedAt": 1_614_094_000_000_i64
        });

        match translator().translate_granule(&raw) {
            Err(MigrationError::SchemaValidation { key, .. }) => assert_eq!(key, "G-0004"),
            other => panic!("expected schema validation failure, got {other:?}"),
        }
    }

    #[test]
    fn translate_file_allows_missing_bucket_and_key() {
        let raw = json!({ "fileName": "unlocated.dat", "size": 42 });
        let row = match translator().translate_file(&raw) {
            Ok(row) => row,
            Err(err) => panic!("translation should succeed: {err}"),
        };

        assert!(row.bucket.is_none());
        assert!(row.key.is_none());
        assert_eq!(row.file_size.as_deref(), Some("42"));
        assert_eq!(row.label(), "unlocated.dat");
    }

    #[test]
    fn translate_pdr_maps_provider_and_status() {
        let raw = json!({
            "pdrName": "ingest-batch-01.pdr",
            "collectionId": "MOD09GQ___006",
            "provider": "s3-provider",
            "status": "completed",
            "progress": 100.0,
            "PANSent": true,
            "createdAt": 1_614_094_000_000_i64,
            "updatedAt": 1_614_094_000_000_i64
        });
        let row = match translator().translate_pdr(&raw) {
            Ok(row) => row,
            Err(err) => panic!("translation should succeed: {err}"),
        };

        assert_eq!(row.name, "ingest-batch-01.pdr");
        assert_eq!(row.provider_name, "s3-provider");
        assert_eq!(row.status, PdrStatus::Completed);
        assert_eq!(row.pan_sent, Some(true));
    }

    #[test]
    fn collection_name_parse_rejects_missing_separator() {
        match CollectionName::parse("MOD09GQ-006") {
            Err(MigrationError::SchemaValidation { .. }) => {}
            other => panic!("expected schema validation failure, got {other:?}"),
        }
    }

    #[test]
    fn producer_version_orders_numerically() {
        let older: ProducerVersion = match "9.0.0".parse() {
            Ok(version) => version,
            Err(err) => panic!("version should parse: {err}"),
        };
        let newer: ProducerVersion = match "10.0.1".parse() {
            Ok(version) => version,
            Err(err) => panic!("version should parse: {err}"),
        };

        assert!(newer > older);
    }

    #[test]
    fn producer_version_rejects_garbage() {
        assert!("not-a-version".parse::<ProducerVersion>().is_err());
        assert!("1.2".parse::<ProducerVersion>().is_err());
        assert!("1.2.3.4".parse::<ProducerVersion>().is_err());
    }

    #[test]
    fn dual_write_config_requires_minimum_version() {
        match DualWriteConfig::from_minimum_version(None) {
            Err(ConfigError::MissingValue(name)) => {
                assert!(name.contains("minimum producer version"));
            }
            other => panic!("expected missing-value error, got {other:?}"),
        }
    }

    fn gate_config() -> DualWriteConfig {
        match DualWriteConfig::from_minimum_version(Some("9.0.0")) {
            Ok(config) => config,
            Err(err) => panic!("config should build: {err}"),
        }
    }

    fn sample_event() -> CompletionEvent {
        let message = json!({
            "meta": {
                "executionArn": "arn:exec:event-1",
                "executionName": "event-1",
                "status": "completed",
                "workflowName": "IngestGranule",
                "producerVersion": "9.0.0",
                "collection": { "name": "MOD09GQ", "version": "006" },
                "provider": { "id": "s3-provider" }
            },
            "payload": {}
        });
        match CompletionEvent::parse(&message) {
            Ok(event) => event,
            Err(err) => panic!("event should parse: {err}"),
        }
    }

    #[test]
    fn gates_pass_when_all_references_resolve() {
        let refs = ResolvedReferences {
            collection: Some(CumulusId(1)),
            provider: Some(CumulusId(2)),
            ..ResolvedReferences::default()
        };

        let report = evaluate_event_gates(&sample_event(), &refs, &gate_config());
        assert!(report.execution.is_eligible());
        assert!(report.pdr.is_eligible());
        assert!(report.granules.is_eligible());
    }

    #[test]
    fn version_below_minimum_fails_every_entity_kind() {
        let mut event = sample_event();
        event.producer_version = "8.9.9".parse().ok();
        let refs = ResolvedReferences {
            collection: Some(CumulusId(1)),
            provider: Some(CumulusId(2)),
            ..ResolvedReferences::default()
        };

        let report = evaluate_event_gates(&event, &refs, &gate_config());
        assert_eq!(report.execution, Eligibility::Ineligible(vec![GateKind::Version]));
        assert!(!report.pdr.is_eligible());
        assert!(!report.granules.is_eligible());
    }

    #[test]
    fn absent_version_is_ineligible_not_an_error() {
        let mut event = sample_event();
        event.producer_version = None;
        let refs = ResolvedReferences {
            collection: Some(CumulusId(1)),
            ..ResolvedReferences::default()
        };

        let report = evaluate_event_gates(&event, &refs, &gate_config());
        assert_eq!(report.execution, Eligibility::Ineligible(vec![GateKind::Version]));
    }

    #[test]
    fn unresolved_parent_blocks_execution_write() {
        let mut event = sample_event();
        event.parent_arn = Some("arn:exec:parent".to_string());
        let refs = ResolvedReferences {
            collection: Some(CumulusId(1)),
            provider: Some(CumulusId(2)),
            parent_execution: None,
            ..ResolvedReferences::default()
        };

        let report = evaluate_event_gates(&event, &refs, &gate_config());
        assert_eq!(report.execution, Eligibility::Ineligible(vec![GateKind::Parent]));
    }

    #[test]
    fn missing_provider_only_blocks_pdr_writes() {
        let refs = ResolvedReferences {
            collection: Some(CumulusId(1)),
            provider: None,
            ..ResolvedReferences::default()
        };

        let report = evaluate_event_gates(&sample_event(), &refs, &gate_config());
        assert!(report.execution.is_eligible());
        assert_eq!(report.pdr, Eligibility::Ineligible(vec![GateKind::Provider]));
        assert!(report.granules.is_eligible());
    }

    #[test]
    fn event_parse_requires_execution_arn() {
        let message = json!({ "meta": { "status": "completed" } });
        match CompletionEvent::parse(&message) {
            Err(MigrationError::SchemaValidation { .. }) => {}
            other => panic!("expected schema validation failure, got {other:?}"),
        }
    }

    #[test]
    fn event_parse_collects_granules_and_pdr() {
        let message = json!({
            "meta": {
                "executionArn": "arn:exec:event-2",
                "status": "running",
                "producerVersion": "9.1.0"
            },
            "payload": {
                "granules": [ { "granuleId": "G-1" }, { "granuleId": "G-2" } ],
                "pdr": { "pdrName": "batch.pdr" }
            }
        });
        let event = match CompletionEvent::parse(&message) {
            Ok(event) => event,
            Err(err) => panic!("event should parse: {err}"),
        };

        assert_eq!(event.granule_payloads.len(), 2);
        assert!(event.has_pdr());
    }

    #[test]
    fn unparseable_producer_version_gates_as_absent() {
        let message = json!({
            "meta": {
                "executionArn": "arn:exec:event-3",
                "status": "completed",
                "producerVersion": "release-candidate"
            }
        });
        let event = match CompletionEvent::parse(&message) {
            Ok(event) => event,
            Err(err) => panic!("event should parse: {err}"),
        };

        assert!(event.producer_version.is_none());
    }

    #[test]
    fn summary_merges_independent_passes() {
        let mut first = SummaryAccumulator::default();
        first.record_seen(EntityKind::Execution);
        first.record_success(EntityKind::Execution);

        let mut second = SummaryAccumulator::default();
        second.record_seen(EntityKind::Granule);
        second.record_failure(EntityKind::Granule, "G-1", "missing collection");
        second.record_seen(EntityKind::Granule);
        second.record_skip(EntityKind::Granule);

        first.merge(second);
        assert_eq!(first.summary.executions.success, 1);
        assert_eq!(first.summary.granules.failed, 1);
        assert_eq!(first.summary.granules.skipped, 1);
        assert_eq!(first.summary.granules.dynamo_records, 2);
        assert_eq!(first.failures.len(), 1);
        assert!(first.summary.is_balanced());
    }

    #[test]
    fn record_outcome_counts_each_variant_once() {
        let mut acc = SummaryAccumulator::default();
        acc.record_seen(EntityKind::Execution);
        acc.record_outcome(EntityKind::Execution, "arn:1", &WriteOutcome::Committed(CumulusId(7)));
        acc.record_seen(EntityKind::Execution);
        acc.record_outcome(
            EntityKind::Execution,
            "arn:2",
            &WriteOutcome::Skipped(SkipReason::AlreadyMigrated {
                key: "arn:2".to_string(),
                existing: CumulusId(3),
            }),
        );
        acc.record_seen(EntityKind::Execution);
        acc.record_outcome(
            EntityKind::Execution,
            "arn:3",
            &WriteOutcome::Failed(MigrationError::UpdateRace { key: "arn:3".to_string() }),
        );

        assert_eq!(acc.summary.executions.success, 1);
        assert_eq!(acc.summary.executions.skipped, 1);
        assert_eq!(acc.summary.executions.failed, 1);
        assert!(acc.summary.is_balanced());
        assert_eq!(acc.failures[0].record_key, "arn:3");
    }

    #[test]
    fn write_outcome_exposes_existing_id_on_skip() {
        let outcome = WriteOutcome::Skipped(SkipReason::AlreadyMigrated {
            key: "arn:4".to_string(),
            existing: CumulusId(11),
        });
        assert_eq!(outcome.cumulus_id(), Some(CumulusId(11)));

        let failed = WriteOutcome::Failed(MigrationError::Storage {
            key: "arn:5".to_string(),
            detail: "disk full".to_string(),
        });
        assert_eq!(failed.cumulus_id(), None);
    }

    #[test]
    fn retryable_errors_are_transient_kinds_only() {
        assert!(MigrationError::UpdateRace { key: "k".to_string() }.is_retryable());
        assert!(MigrationError::Storage { key: "k".to_string(), detail: "d".to_string() }
            .is_retryable());
        assert!(!MigrationError::SchemaValidation { key: "k".to_string(), detail: "d".to_string() }
            .is_retryable());
        assert!(!MigrationError::CyclicParentChain { arn: "a".to_string() }.is_retryable());
    }

    proptest! {
        #[test]
        fn counts_stay_balanced_for_any_outcome_sequence(outcomes in prop::collection::vec(0_u8..3, 0..200)) {
            let mut counts = MigrationCounts::default();
            for outcome in outcomes {
                counts.record_seen();
                match outcome {
                    0 => counts.record_success(),
                    1 => counts.record_failure(),
                    _ => counts.record_skip(),
                }
            }
            prop_assert!(counts.is_balanced());
        }

        #[test]
        fn merged_counts_stay_balanced(
            first in prop::collection::vec(0_u8..3, 0..100),
            second in prop::collection::vec(0_u8..3, 0..100),
        ) {
            let fold = |events: &[u8]| {
                let mut counts = MigrationCounts::default();
                for event in events {
                    counts.record_seen();
                    match event {
                        0 => counts.record_success(),
                        1 => counts.record_failure(),
                        _ => counts.record_skip(),
                    }
                }
                counts
            };
            let mut merged = fold(&first);
            merged.merge(fold(&second));
            prop_assert!(merged.is_balanced());
            prop_assert_eq!(merged.dynamo_records as usize, first.len() + second.len());
        }
    }
}
