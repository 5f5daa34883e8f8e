//! 행 이벤트 → 변경 레코드 변환

use crate::binlog::BinlogParser;
use crate::error::{CdcError, Result};
use crate::events::{
    CellValue, ChangeRecord, EventType, OperationType, RowValues, SchemaAndTable,
};
use crate::offset::BinlogPosition;
use crate::schema_cache::TableMapping;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// 테이블의 컬럼명 (서수 순서) 과 기본키 컬럼명
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TableColumns {
    pub names: Vec<String>,
    pub key_columns: Vec<String>,
}

/// TABLE_MAP 에 컬럼명이 없을 때 컬럼 정보를 조회하는 곳
#[async_trait]
pub trait ColumnCatalog: Send + Sync {
    async fn table_columns(&self, table: &SchemaAndTable) -> Result<TableColumns>;
}

pub struct RowEventExtractor {
    catalog: Arc<dyn ColumnCatalog>,
    columns: HashMap<SchemaAndTable, Arc<TableColumns>>,
}

impl RowEventExtractor {
    pub fn new(catalog: Arc<dyn ColumnCatalog>) -> Self {
        RowEventExtractor {
            catalog,
            columns: HashMap::new(),
        }
    }

    /// 테이블 맵이 다시 공지되면 컬럼 순서를 새로 읽도록 캐시 무효화
    pub fn refresh_column_order(&mut self, table: &SchemaAndTable) {
        if self.columns.remove(table).is_some() {
            debug!("Invalidated column layout of {}", table);
        }
    }

    pub fn clear(&mut self) {
        self.columns.clear();
    }

    async fn columns_for(&mut self, mapping: &TableMapping) -> Result<Arc<TableColumns>> {
        if let Some(names) = &mapping.column_names {
            let key_columns = mapping
                .primary_key
                .iter()
                .flatten()
                .filter_map(|idx| names.get(*idx).cloned())
                .collect();
            return Ok(Arc::new(TableColumns {
                names: names.clone(),
                key_columns,
            }));
        }

        let table = mapping.schema_and_table();
        if let Some(columns) = self.columns.get(&table) {
            return Ok(columns.clone());
        }

        let columns = Arc::new(self.catalog.table_columns(&table).await?);
        if columns.names.len() != mapping.column_count() {
            warn!(
                "Column count of {} differs: binlog has {}, catalog has {}",
                table,
                mapping.column_count(),
                columns.names.len()
            );
        }
        self.columns.insert(table, columns.clone());
        Ok(columns)
    }

    /// 행 이벤트 하나를 행마다 레코드 하나로 변환
    ///
    /// `base_position.rows_to_skip` 은 같은 이벤트 그룹에서 이미 나온 행 수이며,
    /// n 번째 레코드의 위치는 그 값 + n 이 됩니다.
    pub async fn extract(
        &mut self,
        mapping: &TableMapping,
        op: OperationType,
        event_type: EventType,
        payload: &[u8],
        base_position: &BinlogPosition,
        timestamp: DateTime<Utc>,
    ) -> Result<Vec<ChangeRecord>> {
        let table_id = BinlogParser::peek_table_id(payload)?;
        if table_id != mapping.table_id {
            return Err(CdcError::ProtocolError(format!(
                "Table id {} does not match mapping {} of {}.{}",
                table_id, mapping.table_id, mapping.database, mapping.table
            )));
        }

        let rows = BinlogParser::parse_rows_event(payload, event_type, mapping)?;
        let columns = self.columns_for(mapping).await?;
        let table = mapping.schema_and_table();

        let records = rows
            .rows
            .into_iter()
            .enumerate()
            .map(|(i, row)| ChangeRecord {
                table: table.clone(),
                op,
                key_columns: columns.key_columns.clone(),
                before: row.before.map(|values| name_values(values, &columns.names)),
                after: row.after.map(|values| name_values(values, &columns.names)),
                position: base_position
                    .clone()
                    .with_rows_to_skip(base_position.rows_to_skip + i as u32 + 1),
                timestamp,
            })
            .collect();

        Ok(records)
    }
}

fn name_values(values: RowValues, names: &[String]) -> HashMap<String, CellValue> {
    values
        .into_iter()
        .map(|(idx, value)| {
            let name = names
                .get(idx)
                .cloned()
                .unwrap_or_else(|| format!("col_{}", idx));
            (name, value)
        })
        .collect()
}
