//! CDC 리더 메트릭
//!
//! 모든 메트릭은 호출자가 넘긴 `Registry` 에 등록되며 `reader` 레이블이 붙습니다.

use crate::error::Result;
use crate::replication::ConnectionState;
use chrono::{DateTime, Utc};
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use std::time::Duration;

#[derive(Clone)]
pub struct CdcMetrics {
    unprocessed_offsets: IntGauge,
    first_message_time: IntGauge,
    latest_message_time: IntGauge,
    publishing_duration: Histogram,
    processing_duration: Histogram,
    processing_start_time: IntGauge,
    replication_lag: IntGauge,
    lag_measurements: IntCounter,
    entries_processed: IntCounter,
    connected_to_database: IntGauge,
    connection_state: IntGauge,
    connection_attempts: IntCounter,
}

impl CdcMetrics {
    pub fn new(registry: &Registry, reader_name: &str) -> Result<Self> {
        let gauge = |name: &str, help: &str| -> Result<IntGauge> {
            let gauge = IntGauge::with_opts(Opts::new(name, help).const_label("reader", reader_name))?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };
        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let counter =
                IntCounter::with_opts(Opts::new(name, help).const_label("reader", reader_name))?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };
        let histogram = |name: &str, help: &str| -> Result<Histogram> {
            let histogram = Histogram::with_opts(
                HistogramOpts::new(name, help).const_label("reader", reader_name),
            )?;
            registry.register(Box::new(histogram.clone()))?;
            Ok(histogram)
        };

        Ok(CdcMetrics {
            unprocessed_offsets: gauge(
                "eventuate_cdc_mysql_event_unprocessed_offsets",
                "Number of change records whose publish has not been confirmed",
            )?,
            first_message_time: gauge(
                "eventuate_cdc_mysql_event_first_message_time",
                "Wall clock time (ms) when the first change record was published",
            )?,
            latest_message_time: gauge(
                "eventuate_cdc_mysql_event_latest_message_time",
                "Wall clock time (ms) when the latest change record was published",
            )?,
            publishing_duration: histogram(
                "eventuate_cdc_mysql_message_publishing_duration",
                "Seconds from dispatch until every handler confirmed a record",
            )?,
            processing_duration: histogram(
                "eventuate_cdc_mysql_event_processing_duration",
                "Seconds spent dispatching one binlog event",
            )?,
            processing_start_time: gauge(
                "eventuate_cdc_processing_start_time",
                "Wall clock time (ms) when event processing started",
            )?,
            replication_lag: gauge(
                "eventuate_cdc_replication_lag",
                "Replication lag in milliseconds measured through the monitoring table",
            )?,
            lag_measurements: counter(
                "eventuate_cdc_lag_measurements",
                "Number of replication lag measurements",
            )?,
            entries_processed: counter(
                "eventuate_cdc_binlog_entries_processed",
                "Number of change records handed to publishers",
            )?,
            connected_to_database: gauge(
                "eventuate_cdc_connected_to_database",
                "1 while the replication stream is connected",
            )?,
            connection_state: gauge(
                "eventuate_cdc_connection_state",
                "0 disconnected, 1 connecting, 2 streaming, 3 failed",
            )?,
            connection_attempts: counter(
                "eventuate_cdc_connection_attempts",
                "Number of replication connection attempts",
            )?,
        })
    }

    /// 외부에 노출하지 않는 전용 레지스트리에 등록
    pub fn standalone(reader_name: &str) -> Result<Self> {
        Self::new(&Registry::new(), reader_name)
    }

    pub fn set_unresolved(&self, count: usize) {
        self.unprocessed_offsets.set(count as i64);
    }

    pub fn unresolved(&self) -> i64 {
        self.unprocessed_offsets.get()
    }

    /// 발행된 레코드의 소스 시각. 첫 메시지 시각은 한 번만 기록
    pub fn on_message_published(&self, timestamp: DateTime<Utc>) {
        let millis = timestamp.timestamp_millis();
        if self.first_message_time.get() == 0 {
            self.first_message_time.set(millis);
        }
        self.latest_message_time.set(millis);
        self.entries_processed.inc();
    }

    pub fn first_message_time(&self) -> i64 {
        self.first_message_time.get()
    }

    pub fn latest_message_time(&self) -> i64 {
        self.latest_message_time.get()
    }

    pub fn entries_processed(&self) -> u64 {
        self.entries_processed.get()
    }

    pub fn observe_publishing(&self, elapsed: Duration) {
        self.publishing_duration.observe(elapsed.as_secs_f64());
    }

    pub fn observe_processing(&self, elapsed: Duration) {
        self.processing_duration.observe(elapsed.as_secs_f64());
    }

    pub fn set_processing_start_time(&self, at: DateTime<Utc>) {
        self.processing_start_time.set(at.timestamp_millis());
    }

    pub fn processing_start_time(&self) -> i64 {
        self.processing_start_time.get()
    }

    pub fn record_lag(&self, lag_millis: i64) {
        self.replication_lag.set(lag_millis);
        self.lag_measurements.inc();
    }

    pub fn replication_lag(&self) -> i64 {
        self.replication_lag.get()
    }

    pub fn lag_measurements(&self) -> u64 {
        self.lag_measurements.get()
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        self.connection_state.set(state.gauge_value());
        self.connected_to_database
            .set(if state == ConnectionState::Streaming { 1 } else { 0 });
    }

    pub fn connected(&self) -> bool {
        self.connected_to_database.get() == 1
    }

    pub fn on_connection_attempt(&self) {
        self.connection_attempts.inc();
    }

    pub fn connection_attempts(&self) -> u64 {
        self.connection_attempts.get()
    }
}
