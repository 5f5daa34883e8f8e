//! 이벤트 디스패처
//!
//! 복제 스트림의 이벤트를 하나씩 받아:
//! - TABLE_MAP: 스키마 캐시 갱신
//! - ROTATE: 현재 binlog 파일명 변경
//! - WRITE_ROWS / UPDATE_ROWS: 레코드 추출 → 핸들러 발행 → 커밋 파이프라인
//! - 나머지: 디코딩 없이 무시
//!
//! 레코드 위치는 (파일, 이벤트 그룹의 첫 TABLE_MAP 시작 위치, 그룹 안에서의 행 번호) 입니다.
//! 그 위치에서 재시작하면 TABLE_MAP 부터 다시 읽고 이미 처리한 행 수만큼 건너뜁니다.

use crate::binlog::BinlogParser;
use crate::commit::{OffsetCommitPipeline, PendingCommit};
use crate::error::{CdcError, Result};
use crate::events::{ChangeRecord, DispatchKind, OperationType, RawLogEvent, SchemaAndTable};
use crate::extractor::RowEventExtractor;
use crate::handler::HandlerRegistry;
use crate::metrics::CdcMetrics;
use crate::monitoring;
use crate::offset::BinlogPosition;
use crate::schema_cache::{MappingOutcome, TableLookup, TableSchemaCache};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

pub struct EventDispatcher {
    cache: TableSchemaCache,
    extractor: RowEventExtractor,
    handlers: HandlerRegistry,
    pipeline: OffsetCommitPipeline,
    metrics: CdcMetrics,
    binlog_filename: String,
    group_start: Option<u64>,
    group_rows: u32,
    last_was_table_map: bool,
    rows_to_skip: u32,
    last_processed: Option<BinlogPosition>,
}

impl EventDispatcher {
    pub fn new(
        handlers: HandlerRegistry,
        monitoring_table: Option<SchemaAndTable>,
        extractor: RowEventExtractor,
        pipeline: OffsetCommitPipeline,
        metrics: CdcMetrics,
        start: &BinlogPosition,
    ) -> Self {
        EventDispatcher {
            cache: TableSchemaCache::new(handlers.tables(), monitoring_table),
            extractor,
            handlers,
            pipeline,
            metrics,
            binlog_filename: start.filename.clone(),
            group_start: None,
            group_rows: 0,
            last_was_table_map: false,
            rows_to_skip: start.rows_to_skip,
            last_processed: None,
        }
    }

    pub fn binlog_filename(&self) -> &str {
        &self.binlog_filename
    }

    /// 재시작 후 아직 건너뛸 행 수
    pub fn rows_to_skip(&self) -> u32 {
        self.rows_to_skip
    }

    /// 마지막으로 처리한 이벤트의 끝 위치 (파일, 다음 이벤트 시작)
    pub fn last_processed(&self) -> Option<&BinlogPosition> {
        self.last_processed.as_ref()
    }

    pub async fn dispatch(&mut self, event: &RawLogEvent) -> Result<()> {
        self.route(event).await?;

        // ROTATE 는 route 에서 새 파일 위치를 기록함. 가짜 이벤트의 next_pos 는 0
        if event.header.event_type.dispatch_kind() != Some(DispatchKind::Rotate)
            && event.header.next_pos > 0
        {
            self.last_processed = Some(BinlogPosition::new(
                self.binlog_filename.clone(),
                event.header.next_pos as u64,
            ));
        }
        Ok(())
    }

    async fn route(&mut self, event: &RawLogEvent) -> Result<()> {
        let Some(kind) = event.header.event_type.dispatch_kind() else {
            self.last_was_table_map = false;
            return Ok(());
        };

        match kind {
            DispatchKind::Rotate => {
                let rotate = BinlogParser::parse_rotate_event(&event.payload)?;
                if rotate.next_binlog_name != self.binlog_filename {
                    info!("Binlog rotated to {}", rotate.next_binlog_name);
                }
                self.last_processed = Some(BinlogPosition::new(
                    rotate.next_binlog_name.clone(),
                    rotate.position,
                ));
                self.binlog_filename = rotate.next_binlog_name;
                self.group_start = None;
                self.group_rows = 0;
                self.last_was_table_map = false;
                Ok(())
            }
            DispatchKind::TableMapping => {
                if !self.last_was_table_map {
                    self.group_start = Some(event.header.event_start());
                    self.group_rows = 0;
                }
                self.last_was_table_map = true;
                self.on_table_mapping(event)
            }
            DispatchKind::RowInsert => {
                self.last_was_table_map = false;
                self.on_rows(event, OperationType::Insert).await
            }
            DispatchKind::RowUpdate => {
                self.last_was_table_map = false;
                self.on_rows(event, OperationType::Update).await
            }
        }
    }

    fn on_table_mapping(&mut self, event: &RawLogEvent) -> Result<()> {
        let mapping = BinlogParser::parse_table_map_event(&event.payload)?;
        let table = mapping.schema_and_table();
        let table_id = mapping.table_id;

        match self.cache.on_table_mapping(mapping) {
            MappingOutcome::Retained | MappingOutcome::Monitoring => {
                self.extractor.refresh_column_order(&table);
                debug!("Mapped table id {} to {}", table_id, table);
            }
            MappingOutcome::Evicted => {}
        }
        Ok(())
    }

    async fn on_rows(&mut self, event: &RawLogEvent, op: OperationType) -> Result<()> {
        let table_id = BinlogParser::peek_table_id(&event.payload)?;
        let base = BinlogPosition::new(
            self.binlog_filename.clone(),
            self.group_start.unwrap_or_else(|| event.header.event_start()),
        )
        .with_rows_to_skip(self.group_rows);

        let mapping = match self.cache.lookup(table_id) {
            TableLookup::Mapped(mapping) => mapping,
            TableLookup::Ignored => {
                self.pipeline.submit(PendingCommit::resolved(base));
                return Ok(());
            }
            TableLookup::Unknown => return Err(CdcError::UnknownTableId(table_id)),
        };

        let timestamp =
            DateTime::<Utc>::from_timestamp(event.header.timestamp as i64, 0).unwrap_or_default();
        let records = self
            .extractor
            .extract(
                &mapping,
                op,
                event.header.event_type,
                &event.payload,
                &base,
                timestamp,
            )
            .await?;
        self.group_rows += records.len() as u32;

        let mut live = Vec::with_capacity(records.len());
        for record in records {
            if self.rows_to_skip > 0 {
                self.rows_to_skip -= 1;
                debug!("Skipping already processed row at {}", record.position);
                continue;
            }
            live.push(record);
        }

        if self.cache.is_monitoring(table_id) {
            self.on_monitoring_rows(live);
            return Ok(());
        }

        for record in live {
            self.publish(record)?;
        }
        Ok(())
    }

    fn on_monitoring_rows(&mut self, rows: Vec<ChangeRecord>) {
        if let Some(lag) = monitoring::measure_lag(&rows, Utc::now()) {
            debug!("Replication lag {} ms", lag);
            self.metrics.record_lag(lag);
        }
        if let Some(last) = rows.into_iter().last() {
            self.pipeline.submit(PendingCommit::resolved(last.position));
        }
    }

    fn publish(&mut self, record: ChangeRecord) -> Result<()> {
        let mut completions = Vec::new();
        for handler in self.handlers.handlers_for(&record.table) {
            completions.push(handler.publish(&record)?);
        }

        if !completions.is_empty() {
            self.metrics.on_message_published(Utc::now());
        }
        self.pipeline
            .submit(PendingCommit::new(record.position, completions));
        Ok(())
    }

    /// 중지/재시작 시 상태 초기화
    pub fn clear(&mut self) {
        self.cache.clear();
        self.extractor.clear();
        self.group_start = None;
        self.group_rows = 0;
        self.last_was_table_map = false;
    }
}
