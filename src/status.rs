//! 처리 상태
//!
//! 마지막으로 처리한 이벤트의 끝 위치를 서버의 현재 binlog 위치와 비교해
//! 리더가 서버를 따라잡았는지 알려줍니다.

use crate::connection::MySqlConnection;
use crate::error::{CdcError, Result};
use crate::offset::BinlogPosition;
use async_trait::async_trait;
use serde::Serialize;

/// 행 이벤트를 읽으려면 서버의 binlog_format 이 ROW 여야 함
pub const REQUIRED_BINLOG_FORMAT: &str = "ROW";

/// 서버 상태 조회
#[async_trait]
pub trait ServerStatusSource: Send + Sync {
    /// binlog_format 전역 변수 (ROW, STATEMENT, MIXED)
    async fn binlog_format(&self) -> Result<String>;

    /// 서버가 지금 쓰고 있는 binlog 끝 위치
    async fn current_binlog_position(&self) -> Result<Option<BinlogPosition>>;
}

#[async_trait]
impl ServerStatusSource for MySqlConnection {
    async fn binlog_format(&self) -> Result<String> {
        self.get_binlog_format().await
    }

    async fn current_binlog_position(&self) -> Result<Option<BinlogPosition>> {
        self.get_master_status().await
    }
}

/// 형식이 ROW 가 아니면 설정 에러
pub async fn verify_binlog_format(source: &dyn ServerStatusSource) -> Result<()> {
    let format = source.binlog_format().await?;
    if format.eq_ignore_ascii_case(REQUIRED_BINLOG_FORMAT) {
        Ok(())
    } else {
        Err(CdcError::ConfigError(format!(
            "binlog_format must be {}, server uses {}",
            REQUIRED_BINLOG_FORMAT, format
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessingStatus {
    /// 마지막으로 처리한 이벤트의 끝 위치
    pub last_processed: Option<BinlogPosition>,
    /// 서버의 현재 binlog 위치
    pub server_position: Option<BinlogPosition>,
    pub caught_up: bool,
}

impl ProcessingStatus {
    pub fn new(last_processed: Option<BinlogPosition>, server_position: Option<BinlogPosition>) -> Self {
        let caught_up = match (&last_processed, &server_position) {
            (Some(processed), Some(server)) => processed >= server,
            _ => false,
        };
        ProcessingStatus {
            last_processed,
            server_position,
            caught_up,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedServer(&'static str);

    #[async_trait]
    impl ServerStatusSource for FixedServer {
        async fn binlog_format(&self) -> Result<String> {
            Ok(self.0.to_string())
        }

        async fn current_binlog_position(&self) -> Result<Option<BinlogPosition>> {
            Ok(None)
        }
    }

    #[test]
    fn test_caught_up_compares_positions() {
        let server = BinlogPosition::new("mysql-bin.000002", 400);

        let behind = ProcessingStatus::new(Some(BinlogPosition::new("mysql-bin.000002", 120)), Some(server.clone()));
        assert!(!behind.caught_up);

        // 이전 파일의 큰 오프셋은 뒤처진 것
        let old_file = ProcessingStatus::new(Some(BinlogPosition::new("mysql-bin.000001", 9000)), Some(server.clone()));
        assert!(!old_file.caught_up);

        let done = ProcessingStatus::new(Some(server.clone()), Some(server.clone()));
        assert!(done.caught_up);

        assert!(!ProcessingStatus::new(None, Some(server)).caught_up);
        assert!(!ProcessingStatus::new(Some(BinlogPosition::new("mysql-bin.000001", 4)), None).caught_up);
    }

    #[tokio::test]
    async fn test_verify_binlog_format() {
        assert!(verify_binlog_format(&FixedServer("ROW")).await.is_ok());
        assert!(verify_binlog_format(&FixedServer("row")).await.is_ok());

        let err = verify_binlog_format(&FixedServer("STATEMENT")).await.unwrap_err();
        assert!(matches!(err, CdcError::ConfigError(_)));
        assert!(err.to_string().contains("STATEMENT"));
    }
}
