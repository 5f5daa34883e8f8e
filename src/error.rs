//! CDC 관련 에러 타입
//!
//! 에러는 네 가지 범주로 나뉩니다:
//! - 연결 에러: 제한된 횟수만큼 재시도 후 치명적 에러로 승격
//! - 프로토콜/디코딩 에러: 항상 치명적
//! - 발행 에러: 항상 치명적 (오프셋이 넘어가지 않음)
//! - 오프셋 저장 에러: 항상 치명적

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CdcError {
    #[error("MySQL 연결 에러: {0}")]
    ConnectionError(String),

    #[error("인증 실패: {0}")]
    AuthenticationFailed(String),

    #[error("Binlog 연결 재시도 한도 초과 ({attempts}회): {last}")]
    ConnectRetriesExhausted { attempts: u32, last: Box<CdcError> },

    #[error("Binlog 파싱 에러: {0}")]
    BinlogParseError(String),

    #[error("알 수 없는 테이블 ID: {0} (TABLE_MAP 이벤트 누락)")]
    UnknownTableId(u64),

    #[error("프로토콜 에러: {0}")]
    ProtocolError(String),

    #[error("메시지 발행 실패: {0}")]
    PublishFailed(String),

    #[error("오프셋 저장소 에러: {0}")]
    OffsetStoreError(String),

    #[error("쿼리 실행 에러: {0}")]
    QueryError(String),

    #[error("I/O 에러: {0}")]
    IoError(String),

    #[error("설정 에러: {0}")]
    ConfigError(String),

    #[error("재시작 콜백이 지정되지 않았는데 재시작이 요청되었습니다")]
    MissingRestartCallback,

    #[error("메트릭 에러: {0}")]
    MetricsError(#[from] prometheus::Error),

    #[error("직렬화 에러: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Timeout 에러")]
    Timeout,

    #[error("중지되었습니다")]
    Stopped,

    #[error("채널이 닫혔습니다")]
    ChannelClosed,
}

impl CdcError {
    /// 연결 단계에서 재시도해도 되는 에러인지 여부
    ///
    /// 타임아웃과 I/O 실패만 재시도 대상입니다. 인증 실패나 프로토콜 에러는
    /// 다시 시도해도 결과가 같으므로 곧바로 치명적 에러로 처리합니다.
    pub fn is_retryable_connect(&self) -> bool {
        matches!(
            self,
            CdcError::Timeout | CdcError::IoError(_) | CdcError::ConnectionError(_)
        )
    }
}

impl From<io::Error> for CdcError {
    fn from(err: io::Error) -> Self {
        CdcError::IoError(err.to_string())
    }
}

impl From<mysql_async::Error> for CdcError {
    fn from(err: mysql_async::Error) -> Self {
        CdcError::QueryError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CdcError>;
