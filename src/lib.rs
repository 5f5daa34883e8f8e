//! MySQL Binlog CDC (Change Data Capture) 핵심 구현
//!
//! 이 라이브러리는 MySQL 바이너리 로그를 읽어 행 변경 사항을 발행합니다.
//! 주요 기능:
//! - Binlog 프로토콜 파싱
//! - 테이블 스키마 캐시와 행 이벤트 추출
//! - 비동기 발행 완료 순서와 무관한 안전한 오프셋 커밋
//! - 연결 재시도 및 재시작
//! - 처리 상태 (서버 binlog 위치 따라잡음 여부)

pub mod auth;
pub mod binlog;
pub mod binlog_client;
pub mod cdc_engine;
pub mod commit;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod extractor;
pub mod handler;
pub mod metrics;
pub mod monitoring;
pub mod offset;
pub mod protocol;
pub mod replication;
pub mod schema_cache;
pub mod status;

#[cfg(test)]
mod testing;

pub use binlog_client::BinlogClient;
pub use cdc_engine::{CdcConfig, CdcEngine};
pub use connection::MySqlConnection;
pub use error::{CdcError, Result};
pub use events::{ChangeRecord, EventType, OperationType, SchemaAndTable};
pub use handler::{BinlogEntryHandler, BinlogEntryPublisher, PublishCompletion};
pub use offset::{BinlogPosition, OffsetStore};
pub use status::ProcessingStatus;
