//! 테이블 ID → 테이블 레이아웃 캐시
//!
//! TABLE_MAP 이벤트로만 갱신되며 디스패처 태스크 하나만 소유합니다.
//! MySQL 은 테이블 ID 를 다른 테이블에 재사용할 수 있으므로, 관심 없는 테이블이
//! 같은 ID 로 공지되면 이전 매핑을 지워야 합니다.

use crate::events::{SchemaAndTable, TableMapData};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// 캐시에 보관되는 테이블 매핑
pub type TableMapping = TableMapData;

/// `on_table_mapping` 처리 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingOutcome {
    /// 핸들러가 있는 테이블. 컬럼 레이아웃을 새로 읽어야 함
    Retained,
    /// 모니터링 테이블
    Monitoring,
    /// 관심 없는 테이블. 같은 ID 의 이전 매핑 제거
    Evicted,
}

/// `lookup` 결과
#[derive(Debug, Clone)]
pub enum TableLookup {
    Mapped(Arc<TableMapping>),
    /// 이 스트림에서 공지되었지만 관심 없는 테이블
    Ignored,
    /// 한 번도 공지되지 않은 ID
    Unknown,
}

pub struct TableSchemaCache {
    handled: HashSet<SchemaAndTable>,
    monitoring_table: Option<SchemaAndTable>,
    mappings: HashMap<u64, Arc<TableMapping>>,
    ignored: HashSet<u64>,
    monitoring_table_id: Option<u64>,
}

impl TableSchemaCache {
    pub fn new(
        handled: impl IntoIterator<Item = SchemaAndTable>,
        monitoring_table: Option<SchemaAndTable>,
    ) -> Self {
        TableSchemaCache {
            handled: handled.into_iter().collect(),
            monitoring_table,
            mappings: HashMap::new(),
            ignored: HashSet::new(),
            monitoring_table_id: None,
        }
    }

    pub fn on_table_mapping(&mut self, mapping: TableMapping) -> MappingOutcome {
        let table_id = mapping.table_id;
        let table = mapping.schema_and_table();

        if self.monitoring_table_id == Some(table_id) {
            self.monitoring_table_id = None;
        }

        if self.monitoring_table.as_ref() == Some(&table) {
            self.ignored.remove(&table_id);
            self.mappings.insert(table_id, Arc::new(mapping));
            self.monitoring_table_id = Some(table_id);
            return MappingOutcome::Monitoring;
        }

        if self.handled.contains(&table) {
            self.ignored.remove(&table_id);
            self.mappings.insert(table_id, Arc::new(mapping));
            return MappingOutcome::Retained;
        }

        if self.mappings.remove(&table_id).is_some() {
            debug!("Table id {} reused by unhandled table {}", table_id, table);
        }
        self.ignored.insert(table_id);
        MappingOutcome::Evicted
    }

    pub fn lookup(&self, table_id: u64) -> TableLookup {
        if let Some(mapping) = self.mappings.get(&table_id) {
            TableLookup::Mapped(mapping.clone())
        } else if self.ignored.contains(&table_id) {
            TableLookup::Ignored
        } else {
            TableLookup::Unknown
        }
    }

    pub fn is_monitoring(&self, table_id: u64) -> bool {
        self.monitoring_table_id == Some(table_id)
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn clear(&mut self) {
        self.mappings.clear();
        self.ignored.clear();
        self.monitoring_table_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ColumnType;

    fn mapping(table_id: u64, schema: &str, table: &str) -> TableMapping {
        TableMapData {
            table_id,
            database: schema.to_string(),
            table: table.to_string(),
            column_types: vec![ColumnType::Long],
            column_meta: vec![0],
            nullable_bitmap: vec![0],
            column_names: None,
            primary_key: None,
        }
    }

    fn cache() -> TableSchemaCache {
        TableSchemaCache::new(
            vec![SchemaAndTable::new("eventuate", "message")],
            Some(SchemaAndTable::new("eventuate", "cdc_monitoring")),
        )
    }

    #[test]
    fn test_handled_table_is_retained() {
        let mut cache = cache();
        assert_eq!(
            cache.on_table_mapping(mapping(10, "eventuate", "message")),
            MappingOutcome::Retained
        );
        assert!(matches!(cache.lookup(10), TableLookup::Mapped(m) if m.table == "message"));
        assert!(matches!(cache.lookup(11), TableLookup::Unknown));
    }

    #[test]
    fn test_table_id_reuse_by_unhandled_table_evicts() {
        let mut cache = cache();
        cache.on_table_mapping(mapping(10, "eventuate", "message"));
        assert_eq!(
            cache.on_table_mapping(mapping(10, "other", "audit")),
            MappingOutcome::Evicted
        );
        assert!(matches!(cache.lookup(10), TableLookup::Ignored));
        assert!(cache.is_empty());

        // 다시 관심 테이블로 공지되면 복구
        cache.on_table_mapping(mapping(10, "eventuate", "message"));
        assert!(matches!(cache.lookup(10), TableLookup::Mapped(_)));
    }

    #[test]
    fn test_monitoring_table_id_tracking() {
        let mut cache = cache();
        assert_eq!(
            cache.on_table_mapping(mapping(20, "eventuate", "cdc_monitoring")),
            MappingOutcome::Monitoring
        );
        assert!(cache.is_monitoring(20));

        cache.on_table_mapping(mapping(20, "eventuate", "message"));
        assert!(!cache.is_monitoring(20));
    }

    #[test]
    fn test_clear() {
        let mut cache = cache();
        cache.on_table_mapping(mapping(10, "eventuate", "message"));
        cache.on_table_mapping(mapping(11, "x", "y"));
        cache.clear();
        assert!(matches!(cache.lookup(10), TableLookup::Unknown));
        assert!(matches!(cache.lookup(11), TableLookup::Unknown));
    }
}
