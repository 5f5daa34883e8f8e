//! 테스트용 가짜 구현과 binlog 이벤트 빌더

use crate::error::{CdcError, Result};
use crate::events::*;
use crate::extractor::{ColumnCatalog, TableColumns};
use crate::handler::{BinlogEntryPublisher, PublishCompleter, PublishCompletion};
use crate::offset::{BinlogPosition, OffsetStore};
use crate::replication::{BinlogEventStream, BinlogTransport};
use crate::schema_cache::TableMapping;
use crate::binlog::BinlogParser;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

/// 조건이 참이 될 때까지 대기 (최대 약 2초)
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition was not met in time");
}

pub fn change_record(schema: &str, table: &str, offset: u64) -> ChangeRecord {
    let mut after = HashMap::new();
    after.insert("id".to_string(), CellValue::Int64(offset as i64));
    ChangeRecord {
        table: SchemaAndTable::new(schema, table),
        op: OperationType::Insert,
        key_columns: vec!["id".to_string()],
        before: None,
        after: Some(after),
        position: BinlogPosition::new("mysql-bin.000001", offset),
        timestamp: Utc::now(),
    }
}

/// 테스트용 테이블 정의 (LONG, LONGLONG, VARCHAR 컬럼만 지원)
#[derive(Debug, Clone)]
pub struct TableDef {
    pub table_id: u64,
    pub schema: String,
    pub table: String,
    columns: Vec<(String, ColumnType, u16)>,
    primary_key: Vec<usize>,
}

impl TableDef {
    pub fn new(table_id: u64, schema: &str, table: &str) -> Self {
        TableDef {
            table_id,
            schema: schema.to_string(),
            table: table.to_string(),
            columns: Vec::new(),
            primary_key: Vec::new(),
        }
    }

    pub fn long(mut self, name: &str) -> Self {
        self.columns.push((name.to_string(), ColumnType::Long, 0));
        self
    }

    pub fn longlong(mut self, name: &str) -> Self {
        self.columns.push((name.to_string(), ColumnType::LongLong, 0));
        self
    }

    pub fn varchar(mut self, name: &str, max_len: u16) -> Self {
        self.columns.push((name.to_string(), ColumnType::Varchar, max_len));
        self
    }

    pub fn primary_key(mut self, idx: usize) -> Self {
        self.primary_key.push(idx);
        self
    }

    pub fn schema_and_table(&self) -> SchemaAndTable {
        SchemaAndTable::new(self.schema.clone(), self.table.clone())
    }
}

fn write_table_id(buf: &mut Vec<u8>, table_id: u64) {
    buf.extend_from_slice(&table_id.to_le_bytes()[..6]);
}

fn write_lcb(buf: &mut Vec<u8>, value: usize) {
    assert!(value < 251);
    buf.push(value as u8);
}

fn all_set_bitmap(count: usize) -> Vec<u8> {
    let mut bitmap = vec![0u8; count.div_ceil(8)];
    for i in 0..count {
        bitmap[i / 8] |= 1 << (i % 8);
    }
    bitmap
}

pub fn table_map_payload(def: &TableDef, with_metadata: bool) -> Vec<u8> {
    let mut buf = Vec::new();
    write_table_id(&mut buf, def.table_id);
    buf.extend_from_slice(&1u16.to_le_bytes());
    buf.push(def.schema.len() as u8);
    buf.extend_from_slice(def.schema.as_bytes());
    buf.push(0);
    buf.push(def.table.len() as u8);
    buf.extend_from_slice(def.table.as_bytes());
    buf.push(0);

    write_lcb(&mut buf, def.columns.len());
    for (_, column_type, _) in &def.columns {
        buf.push(*column_type as u8);
    }

    let mut meta = Vec::new();
    for (_, column_type, max_len) in &def.columns {
        if *column_type == ColumnType::Varchar {
            meta.extend_from_slice(&max_len.to_le_bytes());
        }
    }
    write_lcb(&mut buf, meta.len());
    buf.extend_from_slice(&meta);
    buf.extend_from_slice(&all_set_bitmap(def.columns.len()));

    if with_metadata {
        let mut names = Vec::new();
        for (name, _, _) in &def.columns {
            write_lcb(&mut names, name.len());
            names.extend_from_slice(name.as_bytes());
        }
        buf.push(4);
        write_lcb(&mut buf, names.len());
        buf.extend_from_slice(&names);

        if !def.primary_key.is_empty() {
            buf.push(8);
            write_lcb(&mut buf, def.primary_key.len());
            for idx in &def.primary_key {
                write_lcb(&mut buf, *idx);
            }
        }
    }

    buf
}

pub fn table_mapping(def: &TableDef, with_metadata: bool) -> TableMapping {
    BinlogParser::parse_table_map_event(&table_map_payload(def, with_metadata)).unwrap()
}

/// 행 이미지들을 순서대로 인코딩. UPDATE 는 (before, after) 가 연달아 옴
pub fn rows_event_payload(def: &TableDef, event_type: EventType, images: &[Vec<CellValue>]) -> Vec<u8> {
    let mut buf = Vec::new();
    write_table_id(&mut buf, def.table_id);
    buf.extend_from_slice(&0u16.to_le_bytes());
    if event_type.is_rows_v2() {
        buf.extend_from_slice(&2u16.to_le_bytes());
    }
    write_lcb(&mut buf, def.columns.len());
    let present = all_set_bitmap(def.columns.len());
    buf.extend_from_slice(&present);
    if matches!(event_type, EventType::UpdateRowsEvent | EventType::UpdateRowsEventV1) {
        buf.extend_from_slice(&present);
    }

    for image in images {
        let mut nulls = vec![0u8; def.columns.len().div_ceil(8)];
        for (i, value) in image.iter().enumerate() {
            if *value == CellValue::Null {
                nulls[i / 8] |= 1 << (i % 8);
            }
        }
        buf.extend_from_slice(&nulls);

        for ((_, column_type, max_len), value) in def.columns.iter().zip(image) {
            match (column_type, value) {
                (_, CellValue::Null) => {}
                (ColumnType::Long, CellValue::Int32(v)) => buf.extend_from_slice(&v.to_le_bytes()),
                (ColumnType::LongLong, CellValue::Int64(v)) => buf.extend_from_slice(&v.to_le_bytes()),
                (ColumnType::Varchar, CellValue::String(s)) => {
                    if *max_len < 256 {
                        buf.push(s.len() as u8);
                    } else {
                        buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
                    }
                    buf.extend_from_slice(s.as_bytes());
                }
                other => panic!("unsupported test value {:?}", other),
            }
        }
    }

    buf
}

/// 연속된 binlog 파일 내용을 위치를 맞춰 생성
pub struct BinlogScript {
    filename: String,
    next_pos: u64,
    timestamp: u32,
    events: Vec<RawLogEvent>,
}

impl BinlogScript {
    pub fn new(filename: &str) -> Self {
        BinlogScript {
            filename: filename.to_string(),
            next_pos: crate::offset::BINLOG_START_OFFSET,
            timestamp: 1_700_000_000,
            events: Vec::new(),
        }
    }

    /// 다음 이벤트가 시작할 위치
    pub fn position(&self) -> u64 {
        self.next_pos
    }

    pub fn event(mut self, event_type: EventType, payload: Vec<u8>) -> Self {
        let event_length = (EventHeader::SIZE + payload.len()) as u32;
        let next_pos = self.next_pos + event_length as u64;
        self.events.push(RawLogEvent {
            header: EventHeader {
                timestamp: self.timestamp,
                event_type,
                server_id: 1,
                event_length,
                next_pos: next_pos as u32,
                flags: 0,
            },
            payload: payload.into(),
        });
        self.next_pos = next_pos;
        self
    }

    pub fn table_map(self, def: &TableDef) -> Self {
        self.event(EventType::TableMapEvent, table_map_payload(def, false))
    }

    pub fn write_rows(self, def: &TableDef, rows: &[Vec<CellValue>]) -> Self {
        self.event(
            EventType::WriteRowsEvent,
            rows_event_payload(def, EventType::WriteRowsEvent, rows),
        )
    }

    pub fn update_rows(self, def: &TableDef, images: &[Vec<CellValue>]) -> Self {
        self.event(
            EventType::UpdateRowsEvent,
            rows_event_payload(def, EventType::UpdateRowsEvent, images),
        )
    }

    pub fn query(self, sql: &str) -> Self {
        self.event(EventType::QueryEvent, sql.as_bytes().to_vec())
    }

    pub fn xid(self) -> Self {
        self.event(EventType::XidEvent, 1u64.to_le_bytes().to_vec())
    }

    pub fn rotate(mut self, next_file: &str) -> Self {
        let mut payload = crate::offset::BINLOG_START_OFFSET.to_le_bytes().to_vec();
        payload.extend_from_slice(next_file.as_bytes());
        self = self.event(EventType::RotateEvent, payload);
        self.filename = next_file.to_string();
        self.next_pos = crate::offset::BINLOG_START_OFFSET;
        self
    }

    pub fn events(self) -> Vec<RawLogEvent> {
        self.events
    }
}

/// 정적인 컬럼 정보. 조회 횟수를 기록
#[derive(Default)]
pub struct StaticCatalog {
    tables: HashMap<SchemaAndTable, TableColumns>,
    lookups: AtomicUsize,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, schema: &str, table: &str, names: &[&str], keys: &[&str]) -> Self {
        self.tables.insert(
            SchemaAndTable::new(schema, table),
            TableColumns {
                names: names.iter().map(|s| s.to_string()).collect(),
                key_columns: keys.iter().map(|s| s.to_string()).collect(),
            },
        );
        self
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ColumnCatalog for StaticCatalog {
    async fn table_columns(&self, table: &SchemaAndTable) -> Result<TableColumns> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.tables
            .get(table)
            .cloned()
            .ok_or_else(|| CdcError::QueryError(format!("Unknown table {}", table)))
    }
}

/// 항상 실패하는 오프셋 저장소
pub struct FailingOffsetStore;

#[async_trait]
impl OffsetStore for FailingOffsetStore {
    async fn last_position(&self) -> Result<Option<BinlogPosition>> {
        Ok(None)
    }

    async fn save_position(&self, _position: &BinlogPosition) -> Result<()> {
        Err(CdcError::OffsetStoreError("disk full".to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishMode {
    /// 즉시 완료
    Complete,
    /// completer 를 보관, 테스트가 직접 완료
    Hold,
    /// 동기 에러
    Reject,
}

/// 발행된 레코드를 기록하는 publisher
pub struct RecordingPublisher {
    mode: PublishMode,
    records: Mutex<Vec<ChangeRecord>>,
    completers: Mutex<VecDeque<PublishCompleter>>,
}

impl RecordingPublisher {
    pub fn new(mode: PublishMode) -> Self {
        RecordingPublisher {
            mode,
            records: Mutex::new(Vec::new()),
            completers: Mutex::new(VecDeque::new()),
        }
    }

    pub fn records(&self) -> Vec<ChangeRecord> {
        self.records.lock().clone()
    }

    pub fn take_completers(&self) -> Vec<PublishCompleter> {
        self.completers.lock().drain(..).collect()
    }
}

impl BinlogEntryPublisher for RecordingPublisher {
    fn publish(&self, record: &ChangeRecord) -> Result<PublishCompletion> {
        match self.mode {
            PublishMode::Reject => Err(CdcError::PublishFailed("rejected".to_string())),
            PublishMode::Complete => {
                self.records.lock().push(record.clone());
                Ok(PublishCompletion::completed())
            }
            PublishMode::Hold => {
                self.records.lock().push(record.clone());
                let (completer, completion) = PublishCompletion::pending();
                self.completers.lock().push_back(completer);
                Ok(completion)
            }
        }
    }
}

/// 미리 정한 이벤트를 재개 위치부터 내주는 transport
pub struct ScriptedTransport {
    events: Vec<(String, RawLogEvent)>,
    failures: AtomicU32,
    hang_at_end: bool,
    opened: Mutex<Vec<BinlogPosition>>,
}

impl ScriptedTransport {
    /// 첫 파일은 "mysql-bin.000001", ROTATE 이후는 새 파일명으로 위치를 계산
    pub fn new(events: Vec<RawLogEvent>) -> Self {
        let mut filename = "mysql-bin.000001".to_string();
        let mut located = Vec::with_capacity(events.len());
        for event in events {
            let rotated = if event.header.event_type == EventType::RotateEvent {
                BinlogParser::parse_rotate_event(&event.payload)
                    .ok()
                    .map(|r| r.next_binlog_name)
            } else {
                None
            };
            located.push((filename.clone(), event));
            if let Some(next) = rotated {
                filename = next;
            }
        }
        ScriptedTransport {
            events: located,
            failures: AtomicU32::new(0),
            hang_at_end: false,
            opened: Mutex::new(Vec::new()),
        }
    }

    /// 처음 n 번의 연결은 I/O 에러
    pub fn with_failures(self, failures: u32) -> Self {
        self.failures.store(failures, Ordering::SeqCst);
        self
    }

    /// 마지막 이벤트 뒤에 스트림을 닫지 않고 대기
    pub fn hang_at_end(mut self) -> Self {
        self.hang_at_end = true;
        self
    }

    pub fn opened(&self) -> Vec<BinlogPosition> {
        self.opened.lock().clone()
    }
}

#[async_trait]
impl BinlogTransport for ScriptedTransport {
    async fn open(&self, position: &BinlogPosition) -> Result<Box<dyn BinlogEventStream>> {
        self.opened.lock().push(position.clone());
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CdcError::IoError("connection refused".to_string()));
        }

        let start = if position.filename.is_empty() {
            0
        } else {
            self.events
                .iter()
                .position(|(file, event)| {
                    file == &position.filename && event.header.event_start() >= position.offset
                })
                .unwrap_or(self.events.len())
        };

        Ok(Box::new(ScriptedStream {
            events: self.events[start..].iter().map(|(_, e)| e.clone()).collect(),
            hang_at_end: self.hang_at_end,
        }))
    }
}

struct ScriptedStream {
    events: VecDeque<RawLogEvent>,
    hang_at_end: bool,
}

#[async_trait]
impl BinlogEventStream for ScriptedStream {
    async fn next_event(&mut self) -> Result<Option<RawLogEvent>> {
        match self.events.pop_front() {
            Some(event) => Ok(Some(event)),
            None if self.hang_at_end => std::future::pending().await,
            None => Ok(None),
        }
    }
}

/// 연결 시도가 끝나지 않는 transport
#[derive(Default)]
pub struct TimeoutTransport {
    attempts: AtomicU32,
}

impl TimeoutTransport {
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BinlogTransport for TimeoutTransport {
    async fn open(&self, _position: &BinlogPosition) -> Result<Box<dyn BinlogEventStream>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        std::future::pending().await
    }
}

/// 매번 같은 에러로 실패하는 transport
pub struct RejectingTransport {
    error: Box<dyn Fn() -> CdcError + Send + Sync>,
    attempts: AtomicU32,
}

impl RejectingTransport {
    pub fn new(error: impl Fn() -> CdcError + Send + Sync + 'static) -> Self {
        RejectingTransport {
            error: Box::new(error),
            attempts: AtomicU32::new(0),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BinlogTransport for RejectingTransport {
    async fn open(&self, _position: &BinlogPosition) -> Result<Box<dyn BinlogEventStream>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err((self.error)())
    }
}
