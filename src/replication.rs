//! 복제 연결 관리
//!
//! 연결 시도마다 타임아웃을 걸고, 타임아웃이나 I/O 실패는 정해진 횟수만큼
//! 재시도합니다. `stop()` 은 재시도 대기 중이거나 이벤트를 기다리는 중에도
//! 즉시 깨웁니다.

use crate::error::{CdcError, Result};
use crate::events::RawLogEvent;
use crate::metrics::CdcMetrics;
use crate::offset::BinlogPosition;
use async_trait::async_trait;
use backoff::backoff::Constant;
use backoff::future::retry;
use backoff::Error as BackoffError;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 복제 스트림을 여는 쪽 (실제 MySQL 연결 또는 테스트용 가짜)
#[async_trait]
pub trait BinlogTransport: Send + Sync {
    async fn open(&self, position: &BinlogPosition) -> Result<Box<dyn BinlogEventStream>>;
}

/// binlog 순서대로 이벤트를 내주는 스트림. `None` 은 서버가 스트림을 닫은 것
#[async_trait]
pub trait BinlogEventStream: Send {
    async fn next_event(&mut self) -> Result<Option<RawLogEvent>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Streaming,
    Failed,
}

impl ConnectionState {
    pub fn gauge_value(self) -> i64 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Streaming => 2,
            ConnectionState::Failed => 3,
        }
    }
}

/// 연결 상태 공유 핸들. 바뀔 때마다 게이지도 갱신
#[derive(Clone)]
pub struct ConnectionStatus {
    state: Arc<RwLock<ConnectionState>>,
    metrics: CdcMetrics,
}

impl ConnectionStatus {
    pub fn new(metrics: CdcMetrics) -> Self {
        metrics.set_connection_state(ConnectionState::Disconnected);
        ConnectionStatus {
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            metrics,
        }
    }

    pub fn get(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn set(&self, state: ConnectionState) {
        *self.state.write() = state;
        self.metrics.set_connection_state(state);
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            retry_interval: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

pub struct ReplicationConnection {
    transport: Arc<dyn BinlogTransport>,
    policy: RetryPolicy,
    status: ConnectionStatus,
    metrics: CdcMetrics,
    cancel: CancellationToken,
}

impl ReplicationConnection {
    pub fn new(
        transport: Arc<dyn BinlogTransport>,
        policy: RetryPolicy,
        status: ConnectionStatus,
        metrics: CdcMetrics,
        cancel: CancellationToken,
    ) -> Self {
        ReplicationConnection {
            transport,
            policy,
            status,
            metrics,
            cancel,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.status.get()
    }

    /// 재개 위치에서 스트림 열기
    ///
    /// 일정 간격으로 최대 `max_attempts` 번 시도합니다. 재시도 가능한 에러
    /// (타임아웃, I/O)만 다시 시도하고 나머지는 바로 돌려줍니다.
    pub async fn start(&self, position: &BinlogPosition) -> Result<ReplicationStream> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0u32;

        let operation = || {
            attempt += 1;
            let current = attempt;
            async move {
                self.try_open(position, current, max_attempts)
                    .await
                    .map_err(|e| self.classify(e, current, max_attempts))
            }
        };

        let policy = Constant::new(self.policy.retry_interval);
        let stream = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(CdcError::Stopped),
            result = retry(policy, operation) => result?,
        };

        self.status.set(ConnectionState::Streaming);
        info!("Binlog stream connected at {}", position);
        Ok(ReplicationStream {
            inner: stream,
            cancel: self.cancel.clone(),
            status: self.status.clone(),
        })
    }

    async fn try_open(
        &self,
        position: &BinlogPosition,
        attempt: u32,
        max_attempts: u32,
    ) -> Result<Box<dyn BinlogEventStream>> {
        self.status.set(ConnectionState::Connecting);
        self.metrics.on_connection_attempt();
        info!(
            "Connecting to binlog at {} (attempt {}/{})",
            position, attempt, max_attempts
        );

        match tokio::time::timeout(self.policy.connect_timeout, self.transport.open(position)).await {
            Ok(result) => result,
            Err(_) => Err(CdcError::Timeout),
        }
    }

    /// 재시도 가능한 에러는 마지막 시도 전까지만 transient
    fn classify(&self, err: CdcError, attempt: u32, max_attempts: u32) -> BackoffError<CdcError> {
        self.status.set(ConnectionState::Failed);
        if !err.is_retryable_connect() {
            return BackoffError::permanent(err);
        }

        warn!(
            "Binlog connection attempt {}/{} failed: {}",
            attempt, max_attempts, err
        );
        if attempt >= max_attempts {
            BackoffError::permanent(CdcError::ConnectRetriesExhausted {
                attempts: max_attempts,
                last: Box::new(err),
            })
        } else {
            BackoffError::transient(err)
        }
    }

    /// 멱등. 대기 중인 연결 시도와 이벤트 수신을 모두 깨움
    pub fn stop(&self) {
        self.cancel.cancel();
        self.status.set(ConnectionState::Disconnected);
    }
}

pub struct ReplicationStream {
    inner: Box<dyn BinlogEventStream>,
    cancel: CancellationToken,
    status: ConnectionStatus,
}

impl ReplicationStream {
    /// 다음 이벤트. 중지되었거나 서버가 스트림을 닫으면 `None`
    pub async fn next_event(&mut self) -> Result<Option<RawLogEvent>> {
        let next = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(None),
            next = self.inner.next_event() => next,
        };

        match &next {
            Ok(Some(_)) => {}
            Ok(None) => self.status.set(ConnectionState::Disconnected),
            Err(_) => self.status.set(ConnectionState::Failed),
        }
        next
    }
}
