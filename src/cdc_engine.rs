//! MySQL CDC 엔진
//!
//! 구성 요소를 묶어 하나의 읽기 작업으로 실행합니다:
//! 1. 시작 위치 결정 (오프셋 저장소 → 마이그레이션 소스 → 가장 앞)
//! 2. 재시도를 포함한 복제 연결
//! 3. 이벤트 디스패치 + 오프셋 커밋 파이프라인
//! 4. 치명적 에러 시 중지 후 재시작 콜백 호출
//!
//! `stop()` 은 최종 중지입니다. 중지된 엔진의 `start()` 는 아무것도 하지 않습니다.

use crate::binlog_client::BinlogClient;
use crate::commit::OffsetCommitPipeline;
use crate::connection::{ConnectionConfig, MySqlConnection};
use crate::dispatcher::EventDispatcher;
use crate::error::{CdcError, Result};
use crate::extractor::{ColumnCatalog, RowEventExtractor};
use crate::handler::{BinlogEntryHandler, HandlerRegistry};
use crate::metrics::CdcMetrics;
use crate::monitoring::{LagHeartbeat, MonitoringConfig, MonitoringWriter};
use crate::offset::{BinlogPosition, MigrationOffsetSource, OffsetStore};
use crate::replication::{
    BinlogTransport, ConnectionState, ConnectionStatus, ReplicationConnection, RetryPolicy,
};
use crate::status::{verify_binlog_format, ProcessingStatus, ServerStatusSource};
use chrono::Utc;
use parking_lot::Mutex;
use prometheus::Registry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 치명적 에러 뒤 외부에서 엔진을 다시 시작하도록 알리는 콜백
pub type RestartCallback = Arc<dyn Fn() + Send + Sync>;

/// CDC 엔진 설정
#[derive(Debug, Clone)]
pub struct CdcConfig {
    pub connection: ConnectionConfig,
    /// 메트릭 라벨과 로그에 쓰이는 이름
    pub reader_name: String,
    pub max_connect_attempts: u32,
    pub retry_interval: Duration,
    pub monitoring: MonitoringConfig,
}

impl Default for CdcConfig {
    fn default() -> Self {
        CdcConfig {
            connection: ConnectionConfig::default(),
            reader_name: "mysql-binlog-reader".to_string(),
            max_connect_attempts: 5,
            retry_interval: Duration::from_millis(500),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl CdcConfig {
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_connect_attempts,
            retry_interval: self.retry_interval,
            connect_timeout: self.connection.connect_timeout,
        }
    }
}

/// 한 번의 실행 동안 치명적 에러를 처리. 첫 에러만 재시작으로 이어짐
#[derive(Clone)]
struct FatalErrorHandler {
    last_error: Arc<Mutex<Option<String>>>,
    restart_callback: Option<RestartCallback>,
    cancel: CancellationToken,
    status: ConnectionStatus,
    triggered: Arc<AtomicBool>,
}

impl FatalErrorHandler {
    fn handle(&self, err: CdcError) -> Result<()> {
        if self.triggered.swap(true, Ordering::SeqCst) {
            debug!("Ignoring follow-up error after restart was requested: {}", err);
            return Ok(());
        }

        error!("Unrecoverable CDC error: {}", err);
        *self.last_error.lock() = Some(err.to_string());
        self.cancel.cancel();
        self.status.set(ConnectionState::Disconnected);

        match &self.restart_callback {
            Some(callback) => {
                info!("Requesting restart");
                callback();
                Ok(())
            }
            None => {
                error!("No restart callback configured");
                Err(CdcError::MissingRestartCallback)
            }
        }
    }
}

/// MySQL CDC 엔진
pub struct CdcEngine {
    config: CdcConfig,
    transport: Arc<dyn BinlogTransport>,
    catalog: Arc<dyn ColumnCatalog>,
    offset_store: Arc<dyn OffsetStore>,
    migration_source: Option<Arc<dyn MigrationOffsetSource>>,
    monitoring_writer: Option<Arc<dyn MonitoringWriter>>,
    status_source: Option<Arc<dyn ServerStatusSource>>,
    handlers: HandlerRegistry,
    restart_callback: Option<RestartCallback>,
    metrics: CdcMetrics,
    status: ConnectionStatus,
    shutdown: CancellationToken,
    pipeline: Mutex<Option<OffsetCommitPipeline>>,
    last_processed: Mutex<Option<BinlogPosition>>,
    last_error: Arc<Mutex<Option<String>>>,
}

impl CdcEngine {
    /// 새 CDC 엔진 생성. 메트릭은 전용 레지스트리에 등록됨
    pub fn new(
        config: CdcConfig,
        transport: Arc<dyn BinlogTransport>,
        catalog: Arc<dyn ColumnCatalog>,
        offset_store: Arc<dyn OffsetStore>,
    ) -> Result<Self> {
        let metrics = CdcMetrics::standalone(&config.reader_name)?;
        Ok(CdcEngine {
            status: ConnectionStatus::new(metrics.clone()),
            metrics,
            config,
            transport,
            catalog,
            offset_store,
            migration_source: None,
            monitoring_writer: None,
            status_source: None,
            handlers: HandlerRegistry::new(),
            restart_callback: None,
            shutdown: CancellationToken::new(),
            pipeline: Mutex::new(None),
            last_processed: Mutex::new(None),
            last_error: Arc::new(Mutex::new(None)),
        })
    }

    /// 실제 MySQL 서버용 구성: binlog 스트림, 컬럼 조회, 모니터링 모두 같은 서버 사용
    pub fn mysql(config: CdcConfig, offset_store: Arc<dyn OffsetStore>) -> Result<Self> {
        let client = Arc::new(BinlogClient::new(config.connection.clone()));
        let connection = Arc::new(MySqlConnection::new(config.connection.clone()));
        Ok(Self::new(config, client, connection.clone(), offset_store)?
            .with_monitoring_writer(connection.clone())
            .with_status_source(connection))
    }

    /// 메트릭을 외부 레지스트리에 등록
    pub fn with_metrics_registry(mut self, registry: &Registry) -> Result<Self> {
        self.metrics = CdcMetrics::new(registry, &self.config.reader_name)?;
        self.status = ConnectionStatus::new(self.metrics.clone());
        Ok(self)
    }

    pub fn with_migration_source(mut self, source: Arc<dyn MigrationOffsetSource>) -> Self {
        self.migration_source = Some(source);
        self
    }

    pub fn with_monitoring_writer(mut self, writer: Arc<dyn MonitoringWriter>) -> Self {
        self.monitoring_writer = Some(writer);
        self
    }

    /// binlog_format 확인과 처리 상태 조회에 쓰임
    pub fn with_status_source(mut self, source: Arc<dyn ServerStatusSource>) -> Self {
        self.status_source = Some(source);
        self
    }

    pub fn with_handler(mut self, handler: BinlogEntryHandler) -> Self {
        self.handlers.add(handler);
        self
    }

    pub fn with_restart_callback(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.restart_callback = Some(Arc::new(callback));
        self
    }

    pub fn metrics(&self) -> &CdcMetrics {
        &self.metrics
    }

    /// 저장소가 비어 있을 때만 마이그레이션 위치를 돌려줌
    pub async fn migration_info(&self) -> Result<Option<BinlogPosition>> {
        if self.offset_store.last_position().await?.is_some() {
            return Ok(None);
        }
        match &self.migration_source {
            Some(source) => source.last_position().await,
            None => Ok(None),
        }
    }

    async fn starting_position(&self) -> Result<BinlogPosition> {
        if let Some(position) = self.offset_store.last_position().await? {
            info!("Resuming from stored offset {}", position);
            return Ok(position);
        }
        if let Some(position) = self.migration_info().await? {
            info!("Resuming from migrated offset {}", position);
            return Ok(position);
        }
        info!("No stored offset, starting from the earliest binlog");
        Ok(BinlogPosition::earliest())
    }

    /// 중지되거나 치명적 에러가 날 때까지 binlog 를 읽음
    ///
    /// 치명적 에러는 재시작 콜백으로 알리고 `Ok(())` 를 돌려줍니다. 콜백이
    /// 없으면 `MissingRestartCallback` 에러입니다. 서버의 binlog_format 이 ROW 가
    /// 아니면 재시작 없이 `ConfigError` 를 돌려줍니다.
    pub async fn start(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            debug!("Binlog reader {} was stopped, not starting", self.config.reader_name);
            return Ok(());
        }
        // 치명적 에러는 이번 실행의 토큰만 취소
        let cancel = self.shutdown.child_token();

        let fatal = FatalErrorHandler {
            last_error: self.last_error.clone(),
            restart_callback: self.restart_callback.clone(),
            cancel: cancel.clone(),
            status: self.status.clone(),
            triggered: Arc::new(AtomicBool::new(false)),
        };

        let position = match self.starting_position().await {
            Ok(position) => position,
            Err(e) => return fatal.handle(e),
        };

        let connection = ReplicationConnection::new(
            self.transport.clone(),
            self.config.retry_policy(),
            self.status.clone(),
            self.metrics.clone(),
            cancel.clone(),
        );
        let mut stream = match connection.start(&position).await {
            Ok(stream) => stream,
            Err(CdcError::Stopped) => {
                info!("Stopped before the binlog stream was opened");
                return Ok(());
            }
            Err(e) => return fatal.handle(e),
        };

        if let Some(source) = &self.status_source {
            match verify_binlog_format(source.as_ref()).await {
                Ok(()) => {}
                Err(e @ CdcError::ConfigError(_)) => {
                    error!("{}", e);
                    *self.last_error.lock() = Some(e.to_string());
                    cancel.cancel();
                    self.status.set(ConnectionState::Disconnected);
                    return Err(e);
                }
                Err(e) => return fatal.handle(e),
            }
        }
        *self.last_error.lock() = None;
        self.metrics.set_processing_start_time(Utc::now());

        let failure_handler = fatal.clone();
        let pipeline = OffsetCommitPipeline::new(
            self.offset_store.clone(),
            self.metrics.clone(),
            Arc::new(move |e: CdcError| {
                let _ = failure_handler.handle(e);
            }),
        );
        *self.pipeline.lock() = Some(pipeline.clone());

        let heartbeat = self.spawn_lag_heartbeat(&cancel);

        let monitoring_table = self
            .config
            .monitoring
            .enabled
            .then(|| self.config.monitoring.monitoring_table());
        let mut dispatcher = EventDispatcher::new(
            self.handlers.clone(),
            monitoring_table,
            RowEventExtractor::new(self.catalog.clone()),
            pipeline,
            self.metrics.clone(),
            &position,
        );

        let outcome = loop {
            let event = match stream.next_event().await {
                Ok(Some(event)) => event,
                Ok(None) if cancel.is_cancelled() => break Ok(()),
                Ok(None) => {
                    break Err(CdcError::ConnectionError(
                        "Binlog stream closed by server".to_string(),
                    ))
                }
                Err(e) => break Err(e),
            };
            if cancel.is_cancelled() {
                break Ok(());
            }

            let started = Instant::now();
            let result = dispatcher.dispatch(&event).await;
            self.metrics.observe_processing(started.elapsed());
            if let Err(e) = result {
                break Err(e);
            }
            if let Some(position) = dispatcher.last_processed() {
                *self.last_processed.lock() = Some(position.clone());
            }
        };

        dispatcher.clear();
        let result = match outcome {
            Ok(()) => {
                info!("Binlog reader {} stopped", self.config.reader_name);
                Ok(())
            }
            Err(e) => fatal.handle(e),
        };

        if let Some(heartbeat) = heartbeat {
            cancel.cancel();
            let _ = heartbeat.await;
        }
        result
    }

    fn spawn_lag_heartbeat(&self, cancel: &CancellationToken) -> Option<tokio::task::JoinHandle<()>> {
        if !self.config.monitoring.enabled {
            return None;
        }
        match &self.monitoring_writer {
            Some(writer) => Some(
                LagHeartbeat::new(
                    writer.clone(),
                    self.config.monitoring.clone(),
                    cancel.child_token(),
                )
                .spawn(),
            ),
            None => {
                warn!("Monitoring is enabled but no monitoring writer is configured");
                None
            }
        }
    }

    /// 멱등. 연결 재시도 대기와 이벤트 수신을 모두 깨움. 이후 `start()` 는 바로 끝남
    pub fn stop(&self) {
        self.shutdown.cancel();
        self.status.set(ConnectionState::Disconnected);
    }

    /// 마지막으로 처리한 이벤트 끝 위치와 서버의 현재 binlog 위치 비교
    pub async fn processing_status(&self) -> Result<ProcessingStatus> {
        let last_processed = self.last_processed.lock().clone();
        let server_position = match &self.status_source {
            Some(source) => source.current_binlog_position().await?,
            None => None,
        };
        Ok(ProcessingStatus::new(last_processed, server_position))
    }

    /// 마지막 치명적 에러. 다음 연결 성공 시 초기화
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn unresolved_count(&self) -> usize {
        self.pipeline
            .lock()
            .as_ref()
            .map(|p| p.unresolved_count())
            .unwrap_or(0)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.status.get()
    }

    /// 마지막으로 스트림을 연 시각 (epoch ms, 아직 없으면 0)
    pub fn event_processing_start_time(&self) -> i64 {
        self.metrics.processing_start_time()
    }
}
