//! MySQL 데이터베이스 연결 관리
//!
//! 복제 스트림과 별도로 일반 SQL 연결이 필요한 곳:
//! - 컬럼명/기본키 조회 (TABLE_MAP 에 컬럼명이 없는 서버)
//! - 모니터링 테이블 갱신 (복제 지연 측정)
//! - binlog 형식과 서버의 현재 binlog 위치 조회 (처리 상태)

use crate::error::{CdcError, Result};
use crate::events::SchemaAndTable;
use crate::extractor::{ColumnCatalog, TableColumns};
use crate::offset::BinlogPosition;
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Opts, OptsBuilder, Pool, Row};
use std::time::Duration;
use tracing::debug;

/// MySQL 연결 설정
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: Option<String>,
    /// 복제 클라이언트로 등록할 server id (서버 및 다른 복제본과 겹치면 안 됨)
    pub server_id: u32,
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            hostname: "localhost".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            database: None,
            server_id: 1,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl ConnectionConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        ConnectionConfig {
            hostname: hostname.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn build_opts(&self) -> Opts {
        OptsBuilder::default()
            .ip_or_hostname(self.hostname.clone())
            .tcp_port(self.port)
            .user(Some(self.username.clone()))
            .pass(Some(self.password.clone()))
            .db_name(self.database.clone())
            .into()
    }
}

/// MySQL 연결 풀 래퍼
#[derive(Clone)]
pub struct MySqlConnection {
    pool: Pool,
    config: ConnectionConfig,
}

impl MySqlConnection {
    /// 풀 생성. 실제 연결은 첫 쿼리 때 맺어짐
    pub fn new(config: ConnectionConfig) -> Self {
        let pool = Pool::new(config.build_opts());
        MySqlConnection { pool, config }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// 전역 변수 조회
    pub async fn get_variable(&self, name: &str) -> Result<Option<String>> {
        let mut conn = self.pool.get_conn().await?;
        let result: Vec<(String, String)> = conn
            .exec("SHOW GLOBAL VARIABLES LIKE ?", (name,))
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query {}: {}", name, e)))?;

        Ok(result.into_iter().next().map(|(_, v)| v))
    }

    /// Binlog 형식 확인 (ROW, STATEMENT, MIXED)
    pub async fn get_binlog_format(&self) -> Result<String> {
        self.get_variable("binlog_format")
            .await?
            .ok_or_else(|| CdcError::QueryError("Binlog format not found".to_string()))
    }

    /// 테이블 컬럼 조회 (서수 순서)
    pub async fn get_table_schema(&self, table: &SchemaAndTable) -> Result<Vec<ColumnInfo>> {
        let mut conn = self.pool.get_conn().await?;
        let result: Vec<(String, String)> = conn
            .exec(
                "SELECT COLUMN_NAME, COLUMN_KEY \
                 FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
                 ORDER BY ORDINAL_POSITION",
                (&table.schema, &table.table),
            )
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query columns of {}: {}", table, e)))?;

        Ok(result
            .into_iter()
            .map(|(name, column_key)| ColumnInfo {
                name,
                is_key: column_key == "PRI",
            })
            .collect())
    }

    /// 모니터링 테이블에 현재 시각 기록
    pub async fn upsert_monitoring_row(
        &self,
        table: &SchemaAndTable,
        reader_id: &str,
        last_time: i64,
    ) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        let query = format!(
            "INSERT INTO `{}`.`{}` (reader_id, last_time) VALUES (?, ?) \
             ON DUPLICATE KEY UPDATE last_time = VALUES(last_time)",
            table.schema, table.table
        );
        conn.exec_drop(query, (reader_id, last_time)).await?;
        debug!("Updated monitoring row {} = {}", reader_id, last_time);
        Ok(())
    }

    /// 서버가 지금 쓰고 있는 binlog 파일과 위치. binlog 가 꺼져 있으면 `None`
    pub async fn get_master_status(&self) -> Result<Option<BinlogPosition>> {
        let mut conn = self.pool.get_conn().await?;
        let row: Option<Row> = conn
            .query_first("SHOW MASTER STATUS")
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query master status: {}", e)))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let file: Option<String> = row.get("File");
        let position: Option<u64> = row.get("Position");
        match (file, position) {
            (Some(file), Some(position)) => Ok(Some(BinlogPosition::new(file, position))),
            _ => Err(CdcError::QueryError(
                "Unexpected SHOW MASTER STATUS result".to_string(),
            )),
        }
    }
}

#[async_trait]
impl ColumnCatalog for MySqlConnection {
    async fn table_columns(&self, table: &SchemaAndTable) -> Result<TableColumns> {
        let columns = self.get_table_schema(table).await?;
        if columns.is_empty() {
            return Err(CdcError::QueryError(format!("Table {} has no columns", table)));
        }

        Ok(TableColumns {
            key_columns: columns
                .iter()
                .filter(|c| c.is_key)
                .map(|c| c.name.clone())
                .collect(),
            names: columns.into_iter().map(|c| c.name).collect(),
        })
    }
}

/// 테이블 컬럼 정보
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    pub is_key: bool,
}
