//! 복제 지연 측정
//!
//! `LagHeartbeat` 가 주기적으로 모니터링 테이블에 현재 시각을 기록하고, 그 행이
//! binlog 로 돌아오면 디스패처가 `now - last_time` 을 지연으로 기록합니다.

use crate::connection::MySqlConnection;
use crate::error::Result;
use crate::events::{ChangeRecord, SchemaAndTable};
use async_trait::async_trait;
use backoff::backoff::Constant;
use backoff::future::retry;
use backoff::Error as BackoffError;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub const DEFAULT_MONITORING_TABLE: &str = "cdc_monitoring";
pub const LAST_TIME_COLUMN: &str = "last_time";

#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    pub enabled: bool,
    pub schema: String,
    pub table: String,
    pub reader_id: String,
    pub lag_measuring_interval: Duration,
    pub retry_interval: Duration,
    pub retry_attempts: u32,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            enabled: true,
            schema: "eventuate".to_string(),
            table: DEFAULT_MONITORING_TABLE.to_string(),
            reader_id: "default".to_string(),
            lag_measuring_interval: Duration::from_secs(10),
            retry_interval: Duration::from_millis(500),
            retry_attempts: 3,
        }
    }
}

impl MonitoringConfig {
    pub fn monitoring_table(&self) -> SchemaAndTable {
        SchemaAndTable::new(self.schema.clone(), self.table.clone())
    }
}

/// 모니터링 이벤트의 행들로 지연(ms) 계산. 마지막 행의 `last_time` 사용
pub fn measure_lag(records: &[ChangeRecord], now: DateTime<Utc>) -> Option<i64> {
    let last_time = records
        .last()?
        .column(LAST_TIME_COLUMN)
        .and_then(|value| value.as_i64())?;
    Some(now.timestamp_millis() - last_time)
}

/// 모니터링 테이블에 쓰는 쪽
#[async_trait]
pub trait MonitoringWriter: Send + Sync {
    async fn write_heartbeat(&self, table: &SchemaAndTable, reader_id: &str, last_time: i64) -> Result<()>;
}

#[async_trait]
impl MonitoringWriter for MySqlConnection {
    async fn write_heartbeat(&self, table: &SchemaAndTable, reader_id: &str, last_time: i64) -> Result<()> {
        self.upsert_monitoring_row(table, reader_id, last_time).await
    }
}

pub struct LagHeartbeat {
    writer: Arc<dyn MonitoringWriter>,
    config: MonitoringConfig,
    cancel: CancellationToken,
}

impl LagHeartbeat {
    pub fn new(writer: Arc<dyn MonitoringWriter>, config: MonitoringConfig, cancel: CancellationToken) -> Self {
        LagHeartbeat {
            writer,
            config,
            cancel,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// 취소될 때까지 주기적으로 기록. 재시도 후에도 실패하면 다음 주기에 다시 시도
    pub async fn run(self) {
        let table = self.config.monitoring_table();
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.lag_measuring_interval) => {}
            }

            if let Err(e) = self.write_with_retry(&table).await {
                error!("Failed to update monitoring table {}: {}", table, e);
            }
        }
        debug!("Lag heartbeat for {} stopped", table);
    }

    async fn write_with_retry(&self, table: &SchemaAndTable) -> Result<()> {
        let attempts = self.config.retry_attempts.max(1);
        let mut attempt = 0u32;

        let operation = || {
            attempt += 1;
            let current = attempt;
            async move {
                let now = Utc::now().timestamp_millis();
                self.writer
                    .write_heartbeat(table, &self.config.reader_id, now)
                    .await
                    .map_err(|e| {
                        if current >= attempts {
                            return BackoffError::permanent(e);
                        }
                        warn!("Monitoring update attempt {}/{} failed: {}", current, attempts, e);
                        BackoffError::transient(e)
                    })
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Ok(()),
            result = retry(Constant::new(self.config.retry_interval), operation) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CdcError;
    use crate::events::CellValue;
    use crate::testing::{change_record, eventually};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FlakyWriter {
        failures_left: Mutex<u32>,
        calls: Mutex<Vec<(String, i64)>>,
    }

    #[async_trait]
    impl MonitoringWriter for FlakyWriter {
        async fn write_heartbeat(&self, _table: &SchemaAndTable, reader_id: &str, last_time: i64) -> Result<()> {
            self.calls.lock().push((reader_id.to_string(), last_time));
            let mut failures = self.failures_left.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(CdcError::QueryError("lock wait timeout".to_string()));
            }
            Ok(())
        }
    }

    fn config() -> MonitoringConfig {
        MonitoringConfig {
            reader_id: "reader-7".to_string(),
            lag_measuring_interval: Duration::from_millis(5),
            retry_interval: Duration::from_millis(1),
            retry_attempts: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_measure_lag_uses_last_row() {
        let now = Utc::now();
        let mut first = change_record("eventuate", "cdc_monitoring", 1);
        let mut second = change_record("eventuate", "cdc_monitoring", 2);
        first
            .after
            .as_mut()
            .unwrap()
            .insert(LAST_TIME_COLUMN.to_string(), CellValue::Int64(now.timestamp_millis() - 5_000));
        second
            .after
            .as_mut()
            .unwrap()
            .insert(LAST_TIME_COLUMN.to_string(), CellValue::Int64(now.timestamp_millis() - 250));

        assert_eq!(measure_lag(&[first, second], now), Some(250));
        assert_eq!(measure_lag(&[], now), None);
        assert_eq!(measure_lag(&[change_record("a", "b", 1)], now), None);
    }

    #[tokio::test]
    async fn test_heartbeat_retries_and_stops() {
        let writer = Arc::new(FlakyWriter {
            failures_left: Mutex::new(2),
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let handle = LagHeartbeat::new(writer.clone(), config(), cancel.clone()).spawn();

        eventually(|| writer.calls.lock().len() >= 4).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        let calls = writer.calls.lock().clone();
        assert!(calls.iter().all(|(reader, _)| reader == "reader-7"));
    }

    #[tokio::test]
    async fn test_write_gives_up_after_retry_attempts() {
        let writer = Arc::new(FlakyWriter {
            failures_left: Mutex::new(5),
            ..Default::default()
        });
        let heartbeat = LagHeartbeat::new(writer.clone(), config(), CancellationToken::new());
        let table = heartbeat.config.monitoring_table();

        let result = heartbeat.write_with_retry(&table).await;
        assert!(matches!(result, Err(CdcError::QueryError(_))));
        assert_eq!(writer.calls.lock().len(), 3);
    }
}
