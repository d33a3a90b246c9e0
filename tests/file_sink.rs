use export_streamer_lib::codec::{
    frame_rows, ColumnInfo, ColumnType, ColumnValue, RowEncoder, RowHeader, RowOperation, Schema,
};
use export_streamer_lib::config::ExportConfig;
use export_streamer_lib::coordinator::ExportCoordinator;
use export_streamer_lib::sinks::SinkRegistry;
use export_streamer_lib::source::{Block, BlockLog, MemoryBlockLog, SourceDescriptor, SourceKey};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;

fn unique_suffix() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time went backwards")
        .as_nanos();
    format!("{}_{}", std::process::id(), now)
}

fn payments_schema() -> Arc<Schema> {
    Arc::new(Schema::new(
        "PAYMENTS",
        3,
        vec![
            ColumnInfo::new("ID", ColumnType::Integer),
            ColumnInfo::new("MEMO", ColumnType::Varchar),
            ColumnInfo::new("AMOUNT", ColumnType::Decimal),
        ],
    ))
}

fn payments_block(schema: &Arc<Schema>) -> Block {
    let encoder = RowEncoder::new(schema);
    let rows = vec![
        (
            1,
            vec![
                ColumnValue::Integer(1),
                ColumnValue::Varchar("rent".to_string()),
                ColumnValue::Decimal(1_250_500_000_000_000),
            ],
        ),
        (
            2,
            vec![
                ColumnValue::Integer(2),
                ColumnValue::Varchar("said \"hi\", left".to_string()),
                ColumnValue::Null,
            ],
        ),
    ];
    let encoded: Vec<Vec<u8>> = rows
        .iter()
        .map(|(sequence, values)| {
            let header = RowHeader {
                txn_id: 900 + sequence,
                timestamp: 1_700_000_000_000_000,
                sequence: *sequence,
                partition_column: 0,
                site_id: 0,
                operation: RowOperation::Insert,
            };
            encoder.encode(&header, values)
        })
        .collect();
    Block::new(2, schema.clone(), frame_rows(&encoded), 2, Some(2))
}

fn single_entry(dir: &Path) -> PathBuf {
    let entries: Vec<PathBuf> = fs::read_dir(dir)
        .expect("read outdir")
        .map(|entry| entry.expect("dir entry").path())
        .collect();
    assert_eq!(entries.len(), 1, "expected one batch dir, found {entries:?}");
    entries[0].clone()
}

#[tokio::test]
async fn acked_rows_land_in_a_closed_csv_batch() {
    let outdir = std::env::temp_dir().join(format!("export_file_sink_it_{}", unique_suffix()));
    let log = Arc::new(MemoryBlockLog::new());
    let key = SourceKey::new("PAYMENTS", 0);
    log.add_source(SourceDescriptor::new("PAYMENTS", 0, 3));
    log.push_block(&key, payments_block(&payments_schema()))
        .expect("push block");
    log.close_source(&key);

    let config = ExportConfig::from_json(&format!(
        r#"{{ "targets": {{ "archive": {{
            "client": "file",
            "tables": ["payments"],
            "properties": {{ "outdir": "{}", "nonce": "it", "skipinternals": "true" }}
        }} }} }}"#,
        outdir.display()
    ))
    .expect("parse config");

    let coordinator = ExportCoordinator::new(
        log.clone(),
        SinkRegistry::with_builtins(),
        config.pump_config(),
        CancellationToken::new(),
    );
    coordinator
        .configure(&config.targets)
        .await
        .expect("configure");
    coordinator
        .on_sources_ready(log.sources())
        .await
        .expect("route sources");
    coordinator.start_polling().await.expect("start polling");

    tokio::time::timeout(Duration::from_secs(5), coordinator.wait_for_drain())
        .await
        .expect("pumps did not drain");
    assert_eq!(log.acked_through(&key), Some(2));
    assert_eq!(log.last_committed_marker(&key), Some(902));
    coordinator.shutdown().await;

    let batch = single_entry(&outdir);
    let batch_name = batch
        .file_name()
        .and_then(|name| name.to_str())
        .expect("utf-8 batch name")
        .to_string();
    assert!(batch_name.starts_with("it-"), "unexpected batch name {batch_name}");

    let csv = fs::read_to_string(batch.join("PAYMENTS-3.csv")).expect("read csv");
    assert_eq!(
        csv,
        "1,rent,1250.500000000000\n2,\"said \"\"hi\"\", left\",NULL\n"
    );

    let schema: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(batch.join("PAYMENTS-3-schema.json")).expect("read schema"),
    )
    .expect("parse schema json");
    assert_eq!(schema["table name"], "PAYMENTS");
    assert_eq!(schema["generation id"], 3);
    assert_eq!(schema["columns"].as_array().map(Vec::len), Some(3));
    assert_eq!(schema["columns"][2]["type"], "DECIMAL");

    let _ = fs::remove_dir_all(&outdir);
}

#[tokio::test]
async fn missing_outdir_fails_configuration() {
    let log = Arc::new(MemoryBlockLog::new());
    let config = ExportConfig::from_json(
        r#"{ "targets": { "archive": { "client": "file", "tables": ["payments"] } } }"#,
    )
    .expect("parse config");
    let coordinator = ExportCoordinator::new(
        log,
        SinkRegistry::with_builtins(),
        config.pump_config(),
        CancellationToken::new(),
    );

    let err = coordinator
        .configure(&config.targets)
        .await
        .expect_err("outdir is required");
    assert!(err.to_string().contains("archive"), "{err}");
}
