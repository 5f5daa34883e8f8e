/// MySQL binlog CDC 실행 예제
///
/// 지정한 테이블의 행 변경을 읽어 로그로 출력하고, 처리한 위치를 파일에 저장합니다.
use mysql_binlog_cdc::cdc_engine::{CdcConfig, CdcEngine};
use mysql_binlog_cdc::connection::ConnectionConfig;
use mysql_binlog_cdc::events::SchemaAndTable;
use mysql_binlog_cdc::handler::{BinlogEntryHandler, BinlogEntryPublisher, ChannelPublisher};
use mysql_binlog_cdc::monitoring::MonitoringConfig;
use mysql_binlog_cdc::offset::{DebeziumOffsetFile, FileOffsetStore};
use std::env;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_millis(name: &str, default: u64) -> Duration {
    Duration::from_millis(env_parse(name, default))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 초기화
    tracing_subscriber::fmt::init();

    let mut connection = ConnectionConfig::new(env_or("DB_HOST", "localhost"), env_or("DB_USER", "root"));
    connection.port = env_parse("DB_PORT", 3306);
    connection.password = env_or("DB_PASSWORD", "rootpassword");
    connection.database = env::var("DB_NAME").ok();
    connection.server_id = env_parse("CDC_SERVER_ID", 1);
    connection.connect_timeout = env_millis("CDC_CONNECT_TIMEOUT_MS", 30_000);

    let reader_name = env_or("CDC_READER_NAME", "mysql-binlog-reader");
    let config = CdcConfig {
        connection,
        max_connect_attempts: env_parse("CDC_MAX_CONNECT_ATTEMPTS", 5),
        retry_interval: env_millis("CDC_RETRY_INTERVAL_MS", 500),
        monitoring: MonitoringConfig {
            enabled: env_parse("CDC_MONITORING_ENABLED", true),
            schema: env_or("CDC_MONITORING_SCHEMA", "eventuate"),
            reader_id: env_or("CDC_READER_ID", &reader_name),
            lag_measuring_interval: env_millis("CDC_LAG_MEASURING_INTERVAL_MS", 10_000),
            retry_interval: env_millis("CDC_MONITORING_RETRY_INTERVAL_MS", 500),
            retry_attempts: env_parse("CDC_MONITORING_RETRY_ATTEMPTS", 3),
            ..Default::default()
        },
        reader_name,
    };

    let tables: Vec<SchemaAndTable> = env_or("CDC_TABLES", "eventuate.message")
        .split(',')
        .filter_map(|t| {
            let parsed = SchemaAndTable::parse(t);
            if parsed.is_none() {
                warn!("Ignoring invalid table name {:?}", t);
            }
            parsed
        })
        .collect();
    if tables.is_empty() {
        return Err("CDC_TABLES must name at least one schema.table".into());
    }

    // 발행 요청을 받아 로그로 남기고 바로 완료
    let (publisher, mut requests) = ChannelPublisher::new();
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            match serde_json::to_string(&request.record) {
                Ok(json) => info!("{} {}", request.record.op.as_str(), json),
                Err(e) => warn!("Failed to serialize record: {}", e),
            }
            request.completer.complete();
        }
    });
    let publisher: Arc<dyn BinlogEntryPublisher> = Arc::new(publisher);

    let offset_store = Arc::new(FileOffsetStore::new(env_or("CDC_OFFSET_FILE", "binlog-offset.json")));
    let restart_requested = Arc::new(AtomicBool::new(false));

    let mut engine = CdcEngine::mysql(config.clone(), offset_store)?.with_restart_callback({
        let restart_requested = restart_requested.clone();
        move || restart_requested.store(true, Ordering::SeqCst)
    });
    if let Ok(path) = env::var("CDC_MIGRATION_OFFSET_FILE") {
        engine = engine.with_migration_source(Arc::new(DebeziumOffsetFile::new(path)));
    }
    for table in tables {
        info!("Capturing changes of {}", table);
        engine = engine.with_handler(BinlogEntryHandler::new(table, publisher.clone()));
    }
    let engine = Arc::new(engine);

    if let Some(position) = engine.migration_info().await? {
        info!("Migrating from offset {}", position);
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    tokio::spawn({
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down");
                shutdown.store(true, Ordering::SeqCst);
                engine.stop();
            }
        }
    });

    info!(
        "Starting MySQL binlog CDC against {}:{}",
        config.connection.hostname, config.connection.port
    );

    loop {
        engine.start().await?;

        if shutdown.load(Ordering::SeqCst) || !restart_requested.swap(false, Ordering::SeqCst) {
            break;
        }
        if let Some(e) = engine.last_error() {
            error!("Restarting after error: {}", e);
        }
        tokio::time::sleep(config.retry_interval).await;
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
    }

    match engine.processing_status().await {
        Ok(status) => info!(
            "Processed {} binlog entries, caught up: {}",
            engine.metrics().entries_processed(),
            status.caught_up
        ),
        Err(e) => warn!("Failed to query processing status: {}", e),
    }
    Ok(())
}
