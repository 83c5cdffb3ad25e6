use mission_catalog_migrate::{
    run_migration, ErrorArchiveConfig, MigrationConfig, MigrationKind, EXECUTIONS_SCOPE,
    GRANULES_SCOPE,
};
use mission_catalog_store_sqlite::{KvStore, RelationalStore};
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

fn put(kv: &mut KvStore, scope: &str, key: &str, value: &Value) {
    if let Err(err) = kv.put(scope, key, value) {
        panic!("kv put should succeed: {err}");
    }
}

fn fixture_timestamp() -> OffsetDateTime {
    match OffsetDateTime::from_unix_timestamp(1_614_100_000) {
        Ok(value) => value,
        Err(err) => panic!("fixture timestamp should be valid: {err}"),
    }
}

#[test]
fn full_run_reports_merged_summary_and_archives_failures() {
    let mut kv = match KvStore::open_in_memory() {
        Ok(kv) => kv,
        Err(err) => panic!("kv store should open: {err}"),
    };
    let mut rel = match RelationalStore::open_in_memory() {
        Ok(rel) => rel,
        Err(err) => panic!("relational store should open: {err}"),
    };
    if let Err(err) = rel.migrate() {
        panic!("schema should apply: {err}");
    }
    if let Err(err) = rel.create_collection("MOD09GQ", "006") {
        panic!("collection should seed: {err}");
    }

    put(
        &mut kv,
        EXECUTIONS_SCOPE,
        "arn:exec:run-1",
        &json!({
            "arn": "arn:exec:run-1",
            "status": "completed",
            "collectionId": "MOD09GQ___006",
            "createdAt": 1_614_094_000_000_i64,
            "updatedAt": 1_614_094_300_000_i64
        }),
    );
    put(
        &mut kv,
        GRANULES_SCOPE,
        "G-ok",
        &json!({
            "granuleId": "G-ok",
            "collectionId": "MOD09GQ___006",
            "status": "completed",
            "files": [{ "bucket": "b", "key": "ok.hdf", "fileName": "ok.hdf", "size": 10 }],
            "createdAt": 1_614_094_000_000_i64,
            "updatedAt": 1_614_094_300_000_i64
        }),
    );
    // This granule names a collection the relational store does not have.
    put(
        &mut kv,
        GRANULES_SCOPE,
        "G-orphan",
        &json!({
            "granuleId": "G-orphan",
            "collectionId": "VNGCR___001",
            "status": "completed",
            "files": [],
            "createdAt": 1_614_094_000_000_i64,
            "updatedAt": 1_614_094_300_000_i64
        }),
    );

    let staging = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(err) => panic!("staging dir should create: {err}"),
    };
    let archive = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(err) => panic!("archive dir should create: {err}"),
    };

    let config = MigrationConfig {
        migrations: vec![MigrationKind::Executions, MigrationKind::Granules],
        error_archive: Some(ErrorArchiveConfig {
            staging_dir: staging.path().to_path_buf(),
            archive_root: archive.path().to_path_buf(),
            prefix: "test-stack".to_string(),
        }),
        run_timestamp: Some(fixture_timestamp()),
        ..MigrationConfig::default()
    };

    let report = match run_migration(&config, &kv, &mut rel) {
        Ok(report) => report,
        Err(err) => panic!("run should succeed: {err}"),
    };

    assert_eq!(report.summary.executions.success, 1);
    assert_eq!(report.summary.granules.success, 1);
    assert_eq!(report.summary.granules.failed, 1);
    assert_eq!(report.summary.files.success, 1);
    assert!(report.summary.is_balanced());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].record_key, "G-orphan");

    // One archive for the granules pass, named by kind and run timestamp.
    assert_eq!(report.archives.len(), 1);
    let timestamp = match fixture_timestamp().format(&Rfc3339) {
        Ok(timestamp) => timestamp,
        Err(err) => panic!("timestamp should format: {err}"),
    };
    let expected_key = format!("test-stack/data-migration-granules-errors-{timestamp}.json");
    assert_eq!(report.archives[0].key, expected_key);

    let stored_path = archive.path().join(&expected_key);
    let document = match std::fs::read_to_string(&stored_path) {
        Ok(document) => document,
        Err(err) => panic!("archive document should exist at {}: {err}", stored_path.display()),
    };
    let parsed: Value = match serde_json::from_str(&document) {
        Ok(parsed) => parsed,
        Err(err) => panic!("archive document should be JSON: {err}"),
    };
    assert_eq!(parsed["errors"].as_array().map(Vec::len), Some(1));

    // The staging artifact is cleaned up once the archive write succeeds.
    let leftovers: Vec<_> = match std::fs::read_dir(staging.path()) {
        Ok(entries) => entries.collect(),
        Err(err) => panic!("staging dir should be readable: {err}"),
    };
    assert!(leftovers.is_empty());
}

#[test]
fn rerunning_the_full_migration_is_idempotent() {
    let mut kv = match KvStore::open_in_memory() {
        Ok(kv) => kv,
        Err(err) => panic!("kv store should open: {err}"),
    };
    let mut rel = match RelationalStore::open_in_memory() {
        Ok(rel) => rel,
        Err(err) => panic!("relational store should open: {err}"),
    };
    if let Err(err) = rel.migrate() {
        panic!("schema should apply: {err}");
    }
    if let Err(err) = rel.create_collection("MOD09GQ", "006") {
        panic!("collection should seed: {err}");
    }

    put(
        &mut kv,
        EXECUTIONS_SCOPE,
        "arn:exec:idem",
        &json!({
            "arn": "arn:exec:idem",
            "status": "completed",
            "collectionId": "MOD09GQ___006",
            "createdAt": 1_614_094_000_000_i64,
            "updatedAt": 1_614_094_300_000_i64
        }),
    );

    let config = MigrationConfig {
        migrations: vec![MigrationKind::Executions],
        ..MigrationConfig::default()
    };

    let first = match run_migration(&config, &kv, &mut rel) {
        Ok(report) => report,
        Err(err) => panic!("first run should succeed: {err}"),
    };
    let second = match run_migration(&config, &kv, &mut rel) {
        Ok(report) => report,
        Err(err) => panic!("second run should succeed: {err}"),
    };

    assert_eq!(first.summary.executions.success, 1);
    assert_eq!(second.summary.executions.success, 0);
    assert_eq!(second.summary.executions.skipped, 1);
    assert_eq!(rel.table_count("executions").ok(), Some(1));
}
