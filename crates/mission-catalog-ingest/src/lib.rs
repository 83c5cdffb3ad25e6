use anyhow::{Context, Result};
use mission_catalog_core::{
    evaluate_event_gates, CompletionEvent, CumulusId, DualWriteConfig, EligibilityReport,
    EntityKind, ExecutionRow, ExecutionStatus, FileRow, MigrationError, PdrRow, PdrStatus,
    RecordFailure, RecordTranslator, ResolvedReferences, WriteOutcome,
};
use mission_catalog_store_sqlite::{
    ExecutionReferences, KvStore, PdrReferences, RelationalStore, EXECUTIONS_SCOPE, GRANULES_SCOPE,
    PDRS_SCOPE,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use time::OffsetDateTime;

/// Outcome of the companion key-value writes for one event.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KvWriteStatus {
    Succeeded,
    Failed(String),
}

impl KvWriteStatus {
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Per-entity-kind relational outcomes for one event. `None` means the write
/// was never attempted (gated out, absent from the event, or blocked by an
/// earlier failure in the execution → PDR → granule order).
#[derive(Debug, Clone, PartialEq)]
pub struct RelationalWrites {
    pub eligibility: EligibilityReport,
    pub execution: Option<WriteOutcome>,
    pub pdr: Option<WriteOutcome>,
    pub granules: Vec<(String, WriteOutcome)>,
    pub file_failures: Vec<RecordFailure>,
}

impl RelationalWrites {
    fn attempted_failure(&self) -> bool {
        let failed = |outcome: &Option<WriteOutcome>| {
            matches!(outcome, Some(WriteOutcome::Failed(_)))
        };
        failed(&self.execution)
            || failed(&self.pdr)
            || self.granules.iter().any(|(_, outcome)| matches!(outcome, WriteOutcome::Failed(_)))
            || !self.file_failures.is_empty()
    }
}

/// What the caller should do with the triggering message.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Processed,
    DeadLetter,
}

/// Full accounting for one handled event. The key-value writes are the
/// durability floor; relational writes are best-effort-but-consistent, and
/// any attempted write that fails sends the message back for dead-lettering
/// so the idempotent writer can absorb the redelivery.
#[derive(Debug, Clone, PartialEq)]
pub struct EventOutcome {
    pub execution_arn: String,
    pub kv: KvWriteStatus,
    pub relational: RelationalWrites,
    pub disposition: Disposition,
}

/// Handle one workflow-completion message end to end.
///
/// The key-value companion writes always run, for every entity kind present
/// in the event, regardless of relational eligibility. Relational writes run
/// only through the gates, in execution → PDR → granule order, and reuse the
/// idempotent migration writer.
///
/// # Errors
/// Returns an error only when the message itself cannot be parsed; such a
/// message is unprocessable and belongs on the dead-letter path directly.
pub fn handle_completion_event(
    message: &Value,
    kv: &mut KvStore,
    rel: &mut RelationalStore,
    translator: &RecordTranslator,
    config: &DualWriteConfig,
) -> Result<EventOutcome> {
    let event = CompletionEvent::parse(message).context("failed to parse completion message")?;

    let kv_status = write_event_to_kv(&event, kv);
    if let KvWriteStatus::Failed(detail) = &kv_status {
        tracing::error!(arn = %event.execution_arn, %detail, "key-value companion write failed");
    }

    let refs = resolve_references(&event, rel);
    let eligibility = evaluate_event_gates(&event, &refs, config);

    let mut relational = RelationalWrites {
        eligibility,
        execution: None,
        pdr: None,
        granules: Vec::new(),
        file_failures: Vec::new(),
    };

    if relational.eligibility.execution.is_eligible() {
        let row = execution_row_from_event(&event);
        let outcome = rel.write_execution(
            &row,
            ExecutionReferences {
                collection: refs.collection,
                parent: refs.parent_execution,
                async_operation: refs.async_operation,
            },
        );
        let execution_id = outcome.cumulus_id();
        relational.execution = Some(outcome);

        // PDR and granule writes reference the execution row; they are only
        // attempted once the execution write has landed.
        if let Some(execution_id) = execution_id {
            if event.has_pdr() && relational.eligibility.pdr.is_eligible() {
                relational.pdr = write_event_pdr(&event, rel, &refs, Some(execution_id));
            }

            if event.has_granules() && relational.eligibility.granules.is_eligible() {
                write_event_granules(&event, rel, translator, &refs, execution_id, &mut relational);
            }
        }
    } else {
        tracing::info!(
            arn = %event.execution_arn,
            "event ineligible for relational write, key-value store only"
        );
    }

    let disposition = if kv_status.is_failure() || relational.attempted_failure() {
        Disposition::DeadLetter
    } else {
        Disposition::Processed
    };

    Ok(EventOutcome { execution_arn: event.execution_arn, kv: kv_status, relational, disposition })
}

/// Resolve every natural-key reference the event names. Lookup failures are
/// logged and treated as unresolved, which makes the affected gates fail
/// rather than aborting the event.
fn resolve_references(event: &CompletionEvent, rel: &RelationalStore) -> ResolvedReferences {
    let mut refs = ResolvedReferences::default();

    if let Some(collection) = &event.collection {
        refs.collection = match rel.collection_cumulus_id(&collection.name, &collection.version) {
            Ok(resolved) => resolved,
            Err(err) => {
                tracing::error!(%err, "collection lookup failed");
                None
            }
        };
    }
    if let Some(provider) = &event.provider_name {
        refs.provider = match rel.provider_cumulus_id(provider) {
            Ok(resolved) => resolved,
            Err(err) => {
                tracing::error!(%err, "provider lookup failed");
                None
            }
        };
    }
    if let Some(parent_arn) = &event.parent_arn {
        refs.parent_execution = match rel.execution_cumulus_id(parent_arn) {
            Ok(resolved) => resolved,
            Err(err) => {
                tracing::error!(%err, "parent execution lookup failed");
                None
            }
        };
    }
    if let Some(async_operation_id) = &event.async_operation_id {
        refs.async_operation = match rel.async_operation_cumulus_id(async_operation_id) {
            Ok(resolved) => resolved,
            Err(err) => {
                tracing::error!(%err, "async operation lookup failed");
                None
            }
        };
    }

    refs
}

fn execution_row_from_event(event: &CompletionEvent) -> ExecutionRow {
    let duration = match (event.workflow_start_time, event.workflow_stop_time) {
        (Some(start), Some(stop)) => Some((stop - start).as_seconds_f64()),
        _ => None,
    };

    ExecutionRow {
        arn: event.execution_arn.clone(),
        name: event.execution_name.clone(),
        status: event.status,
        url: None,
        workflow_name: event.workflow_name.clone(),
        duration,
        original_payload: event.original_payload.clone(),
        final_payload: event.final_payload.clone(),
        tasks: None,
        error: None,
        cumulus_version: event.producer_version.map(|version| version.to_string()),
        timestamp: event.workflow_stop_time,
        created_at: event.workflow_start_time,
        updated_at: event.workflow_stop_time.or(event.workflow_start_time),
        collection: event.collection.clone(),
        parent_arn: event.parent_arn.clone(),
        async_operation_id: event.async_operation_id.clone(),
    }
}

fn write_event_pdr(
    event: &CompletionEvent,
    rel: &mut RelationalStore,
    refs: &ResolvedReferences,
    execution_id: Option<CumulusId>,
) -> Option<WriteOutcome> {
    let (collection_id, provider_id) = match (refs.collection, refs.provider) {
        (Some(collection_id), Some(provider_id)) => (collection_id, provider_id),
        _ => return None,
    };
    let row = match pdr_row_from_event(event) {
        Ok(row) => row,
        Err(err) => return Some(WriteOutcome::Failed(err)),
    };

    Some(rel.write_pdr(
        &row,
        PdrReferences { collection: collection_id, provider: provider_id, execution: execution_id },
    ))
}

fn pdr_row_from_event(event: &CompletionEvent) -> Result<PdrRow, MigrationError> {
    let payload = event.pdr_payload.as_ref().and_then(Value::as_object).ok_or_else(|| {
        MigrationError::SchemaValidation {
            key: event.execution_arn.clone(),
            detail: "pdr payload is not a JSON object".to_string(),
        }
    })?;

    let name = payload
        .get("name")
        .or_else(|| payload.get("pdrName"))
        .and_then(Value::as_str)
        .ok_or_else(|| MigrationError::SchemaValidation {
            key: event.execution_arn.clone(),
            detail: "pdr payload is missing its name".to_string(),
        })?;

    let collection = event.collection.clone().ok_or_else(|| {
        MigrationError::MissingRequiredReference {
            key: name.to_string(),
            reference: "collection".to_string(),
        }
    })?;
    let provider_name = event.provider_name.clone().ok_or_else(|| {
        MigrationError::MissingRequiredReference {
            key: name.to_string(),
            reference: "provider".to_string(),
        }
    })?;

    Ok(PdrRow {
        name: name.to_string(),
        collection,
        provider_name,
        status: pdr_status_from_workflow(event.status),
        progress: payload.get("progress").and_then(Value::as_f64),
        pan_sent: payload.get("PANSent").and_then(Value::as_bool),
        pan_message: payload.get("PANmessage").and_then(Value::as_str).map(str::to_string),
        execution_arn: Some(event.execution_arn.clone()),
        timestamp: event.workflow_stop_time,
        created_at: event.workflow_start_time,
        updated_at: event.workflow_stop_time.or(event.workflow_start_time),
    })
}

fn pdr_status_from_workflow(status: ExecutionStatus) -> PdrStatus {
    match status {
        ExecutionStatus::Running => PdrStatus::Running,
        ExecutionStatus::Completed => PdrStatus::Completed,
        ExecutionStatus::Failed | ExecutionStatus::Unknown => PdrStatus::Failed,
    }
}

fn write_event_granules(
    event: &CompletionEvent,
    rel: &mut RelationalStore,
    translator: &RecordTranslator,
    refs: &ResolvedReferences,
    execution_id: CumulusId,
    relational: &mut RelationalWrites,
) {
    let Some(collection_id) = refs.collection else {
        return;
    };

    for payload in &event.granule_payloads {
        let augmented = granule_source_attributes(event, payload);
        let label = augmented
            .get("granuleId")
            .and_then(Value::as_str)
            .map_or_else(|| "<unknown>".to_string(), str::to_string);

        let row = match translator.translate_granule(&augmented) {
            Ok(row) => row,
            Err(err) => {
                relational.granules.push((label, WriteOutcome::Failed(err)));
                continue;
            }
        };

        let raw_files =
            augmented.get("files").and_then(Value::as_array).cloned().unwrap_or_default();
        let mut file_rows: Vec<FileRow> = Vec::new();
        for raw_file in &raw_files {
            match translator.translate_file(raw_file) {
                Ok(file_row) => file_rows.push(file_row),
                Err(err) => relational.file_failures.push(RecordFailure {
                    kind: EntityKind::File,
                    record_key: label.clone(),
                    message: err.to_string(),
                }),
            }
        }

        let report =
            rel.write_granule_and_files(&row, &file_rows, collection_id, Some(execution_id));
        relational.file_failures.extend(report.file_failures);
        relational.granules.push((label, report.granule));
    }
}

/// Fill event-level context into a raw granule payload so it matches the
/// source-record shape the translator (and a later bulk pass) expects.
fn granule_source_attributes(event: &CompletionEvent, payload: &Value) -> Value {
    let mut fields = payload.as_object().cloned().unwrap_or_else(Map::new);

    if !fields.contains_key("collectionId") {
        if let Some(collection) = &event.collection {
            fields.insert("collectionId".to_string(), json!(collection.to_string()));
        }
    }
    if !fields.contains_key("status") {
        let status = match event.status {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed | ExecutionStatus::Unknown => "failed",
        };
        fields.insert("status".to_string(), json!(status));
    }
    if !fields.contains_key("createdAt") {
        if let Some(start) = event.workflow_start_time {
            fields.insert("createdAt".to_string(), json!(epoch_millis(start)));
        }
    }
    if !fields.contains_key("updatedAt") {
        if let Some(updated) = event.workflow_stop_time.or(event.workflow_start_time) {
            fields.insert("updatedAt".to_string(), json!(epoch_millis(updated)));
        }
    }

    Value::Object(fields)
}

/// Companion writes to the key-value store, one per entity kind present in
/// the event. These always run and never share a transaction with the
/// relational writes.
fn write_event_to_kv(event: &CompletionEvent, kv: &mut KvStore) -> KvWriteStatus {
    let mut errors = Vec::new();

    let execution = execution_kv_attributes(event);
    if let Err(err) = kv.put(EXECUTIONS_SCOPE, &event.execution_arn, &execution) {
        errors.push(err.to_string());
    }

    for payload in &event.granule_payloads {
        let attributes = granule_source_attributes(event, payload);
        match attributes.get("granuleId").and_then(Value::as_str) {
            Some(granule_id) => {
                let granule_key = granule_id.to_string();
                if let Err(err) = kv.put(GRANULES_SCOPE, &granule_key, &attributes) {
                    errors.push(err.to_string());
                }
            }
            None => errors.push("granule payload is missing granuleId".to_string()),
        }
    }

    if let Some(payload) = &event.pdr_payload {
        let name = payload
            .get("name")
            .or_else(|| payload.get("pdrName"))
            .and_then(Value::as_str)
            .map(str::to_string);
        match name {
            Some(name) => {
                let attributes = pdr_kv_attributes(event, payload, &name);
                if let Err(err) = kv.put(PDRS_SCOPE, &name, &attributes) {
                    errors.push(err.to_string());
                }
            }
            None => errors.push("pdr payload is missing its name".to_string()),
        }
    }

    if errors.is_empty() {
        KvWriteStatus::Succeeded
    } else {
        KvWriteStatus::Failed(errors.join("; "))
    }
}

fn execution_kv_attributes(event: &CompletionEvent) -> Value {
    let mut fields = Map::new();
    fields.insert("arn".to_string(), json!(event.execution_arn));
    if let Some(name) = &event.execution_name {
        fields.insert("name".to_string(), json!(name));
    }
    fields.insert("status".to_string(), json!(event.status.as_str()));
    if let Some(workflow_name) = &event.workflow_name {
        fields.insert("type".to_string(), json!(workflow_name));
    }
    if let Some(version) = event.producer_version {
        fields.insert("cumulusVersion".to_string(), json!(version.to_string()));
    }
    if let Some(parent_arn) = &event.parent_arn {
        fields.insert("parentArn".to_string(), json!(parent_arn));
    }
    if let Some(async_operation_id) = &event.async_operation_id {
        fields.insert("asyncOperationId".to_string(), json!(async_operation_id));
    }
    if let Some(collection) = &event.collection {
        fields.insert("collectionId".to_string(), json!(collection.to_string()));
    }
    if let Some(original_payload) = &event.original_payload {
        fields.insert("originalPayload".to_string(), original_payload.clone());
    }
    if let Some(final_payload) = &event.final_payload {
        fields.insert("finalPayload".to_string(), final_payload.clone());
    }
    if let Some(start) = event.workflow_start_time {
        fields.insert("createdAt".to_string(), json!(epoch_millis(start)));
    }
    if let Some(updated) = event.workflow_stop_time.or(event.workflow_start_time) {
        fields.insert("updatedAt".to_string(), json!(epoch_millis(updated)));
    }
    Value::Object(fields)
}

fn pdr_kv_attributes(event: &CompletionEvent, payload: &Value, name: &str) -> Value {
    let mut fields = payload.as_object().cloned().unwrap_or_else(Map::new);
    fields.insert("pdrName".to_string(), json!(name));
    if let Some(collection) = &event.collection {
        fields.entry("collectionId".to_string()).or_insert_with(|| json!(collection.to_string()));
    }
    if let Some(provider) = &event.provider_name {
        fields.entry("provider".to_string()).or_insert_with(|| json!(provider));
    }
    fields
        .entry("status".to_string())
        .or_insert_with(|| json!(pdr_status_from_workflow(event.status).as_str()));
    if let Some(start) = event.workflow_start_time {
        fields.entry("createdAt".to_string()).or_insert_with(|| json!(epoch_millis(start)));
    }
    if let Some(updated) = event.workflow_stop_time.or(event.workflow_start_time) {
        fields.entry("updatedAt".to_string()).or_insert_with(|| json!(epoch_millis(updated)));
    }
    Value::Object(fields)
}

fn epoch_millis(value: OffsetDateTime) -> i64 {
    i64::try_from(value.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}
