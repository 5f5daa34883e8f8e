//! MySQL Binlog 이벤트 타입 및 데이터 구조 정의

use crate::offset::BinlogPosition;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// MySQL Binlog 이벤트 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    /// 알 수 없는 이벤트
    Unknown = 0,
    /// 쿼리 이벤트 (DDL, BEGIN)
    QueryEvent = 2,
    /// 로테이션 이벤트 (새 binlog 파일)
    RotateEvent = 4,
    /// 포맷 설명 이벤트
    FormatDescriptionEvent = 15,
    /// 트랜잭션 커밋
    XidEvent = 16,
    /// 테이블 맵 이벤트 (스키마 정보)
    TableMapEvent = 19,
    /// WRITE_ROWS v1
    WriteRowsEventV1 = 23,
    /// UPDATE_ROWS v1
    UpdateRowsEventV1 = 24,
    /// DELETE_ROWS v1
    DeleteRowsEventV1 = 25,
    /// 하트비트
    HeartbeatEvent = 27,
    /// WRITE_ROWS 이벤트 (INSERT)
    WriteRowsEvent = 30,
    /// UPDATE_ROWS 이벤트 (UPDATE)
    UpdateRowsEvent = 31,
    /// DELETE_ROWS 이벤트 (DELETE)
    DeleteRowsEvent = 32,
    /// GTID 이벤트 (Global Transaction ID)
    GtidEvent = 33,
    /// 익명 GTID 이벤트
    AnonymousGtidEvent = 34,
    /// Rows Query 이벤트 (원본 쿼리)
    RowsQueryEvent = 29,
    /// 트랜잭션 페이로드 이벤트
    TransactionPayloadEvent = 40,
}

impl EventType {
    pub fn from_u8(val: u8) -> Self {
        match val {
            2 => EventType::QueryEvent,
            4 => EventType::RotateEvent,
            15 => EventType::FormatDescriptionEvent,
            16 => EventType::XidEvent,
            19 => EventType::TableMapEvent,
            23 => EventType::WriteRowsEventV1,
            24 => EventType::UpdateRowsEventV1,
            25 => EventType::DeleteRowsEventV1,
            27 => EventType::HeartbeatEvent,
            29 => EventType::RowsQueryEvent,
            30 => EventType::WriteRowsEvent,
            31 => EventType::UpdateRowsEvent,
            32 => EventType::DeleteRowsEvent,
            33 => EventType::GtidEvent,
            34 => EventType::AnonymousGtidEvent,
            40 => EventType::TransactionPayloadEvent,
            _ => EventType::Unknown,
        }
    }

    /// 디스패처가 처리하는 이벤트 종류로 분류
    ///
    /// 명시적 허용 목록입니다. 여기에 없는 이벤트는 디코딩하지 않고 무시합니다.
    pub fn dispatch_kind(self) -> Option<DispatchKind> {
        match self {
            EventType::TableMapEvent => Some(DispatchKind::TableMapping),
            EventType::RotateEvent => Some(DispatchKind::Rotate),
            EventType::WriteRowsEventV1 | EventType::WriteRowsEvent => Some(DispatchKind::RowInsert),
            EventType::UpdateRowsEventV1 | EventType::UpdateRowsEvent => {
                Some(DispatchKind::RowUpdate)
            }
            _ => None,
        }
    }

    /// v2 행 이벤트는 post-header 뒤에 extra data 블록이 있음
    pub fn is_rows_v2(self) -> bool {
        matches!(
            self,
            EventType::WriteRowsEvent | EventType::UpdateRowsEvent | EventType::DeleteRowsEvent
        )
    }
}

/// 디스패처 상태 머신의 입력 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    TableMapping,
    Rotate,
    RowInsert,
    RowUpdate,
}

/// Binlog 이벤트 헤더
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHeader {
    /// 이벤트 타입스탬프 (초 단위)
    pub timestamp: u32,
    /// 이벤트 타입
    pub event_type: EventType,
    /// MySQL 서버 ID
    pub server_id: u32,
    /// 이벤트 길이 (헤더 포함, 바이트)
    pub event_length: u32,
    /// 다음 이벤트 위치
    pub next_pos: u32,
    /// 이벤트 플래그
    pub flags: u16,
}

impl EventHeader {
    pub const SIZE: usize = 19;

    /// 현재 binlog 파일 안에서 이 이벤트가 시작하는 위치
    pub fn event_start(&self) -> u64 {
        (self.next_pos as u64).saturating_sub(self.event_length as u64)
    }
}

/// 복제 스트림에서 받은 디코딩 전 이벤트
#[derive(Debug, Clone)]
pub struct RawLogEvent {
    pub header: EventHeader,
    /// 헤더 뒤의 이벤트 본문
    pub payload: Bytes,
}

/// MySQL 컬럼 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ColumnType {
    Decimal = 0,
    Tiny = 1,
    Short = 2,
    Long = 3,
    Float = 4,
    Double = 5,
    Null = 6,
    Timestamp = 7,
    LongLong = 8,
    Int24 = 9,
    Date = 10,
    Time = 11,
    DateTime = 12,
    Year = 13,
    NewDate = 14,
    Varchar = 15,
    Bit = 16,
    Timestamp2 = 17,
    DateTime2 = 18,
    Time2 = 19,
    Json = 245,
    NewDecimal = 246,
    Enum = 247,
    Set = 248,
    TinyBlob = 249,
    MediumBlob = 250,
    LongBlob = 251,
    Blob = 252,
    VarString = 253,
    String = 254,
    Geometry = 255,
}

impl ColumnType {
    pub fn from_u8(value: u8) -> Option<Self> {
        let column_type = match value {
            0 => ColumnType::Decimal,
            1 => ColumnType::Tiny,
            2 => ColumnType::Short,
            3 => ColumnType::Long,
            4 => ColumnType::Float,
            5 => ColumnType::Double,
            6 => ColumnType::Null,
            7 => ColumnType::Timestamp,
            8 => ColumnType::LongLong,
            9 => ColumnType::Int24,
            10 => ColumnType::Date,
            11 => ColumnType::Time,
            12 => ColumnType::DateTime,
            13 => ColumnType::Year,
            14 => ColumnType::NewDate,
            15 => ColumnType::Varchar,
            16 => ColumnType::Bit,
            17 => ColumnType::Timestamp2,
            18 => ColumnType::DateTime2,
            19 => ColumnType::Time2,
            245 => ColumnType::Json,
            246 => ColumnType::NewDecimal,
            247 => ColumnType::Enum,
            248 => ColumnType::Set,
            249 => ColumnType::TinyBlob,
            250 => ColumnType::MediumBlob,
            251 => ColumnType::LongBlob,
            252 => ColumnType::Blob,
            253 => ColumnType::VarString,
            254 => ColumnType::String,
            255 => ColumnType::Geometry,
            _ => return None,
        };
        Some(column_type)
    }
}

/// 테이블 맵 정보 (컬럼 메타데이터)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMapData {
    /// 테이블 ID
    pub table_id: u64,
    /// 데이터베이스명
    pub database: String,
    /// 테이블명
    pub table: String,
    /// 컬럼 타입들
    pub column_types: Vec<ColumnType>,
    /// 컬럼 메타데이터 (타입별 해석)
    pub column_meta: Vec<u16>,
    /// nullable 비트맵
    pub nullable_bitmap: Vec<u8>,
    /// binlog_row_metadata=FULL 인 경우 함께 오는 컬럼명
    pub column_names: Option<Vec<String>>,
    /// binlog_row_metadata=FULL 인 경우 함께 오는 기본키 컬럼 인덱스
    pub primary_key: Option<Vec<usize>>,
}

impl TableMapData {
    pub fn schema_and_table(&self) -> SchemaAndTable {
        SchemaAndTable::new(self.database.clone(), self.table.clone())
    }

    pub fn column_count(&self) -> usize {
        self.column_types.len()
    }
}

/// 회전 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateEventData {
    /// 새 바이너리 로그 파일명
    pub next_binlog_name: String,
    /// 새 파일의 시작 위치
    pub position: u64,
}

/// (컬럼 인덱스, 값). 이벤트 비트맵에 포함된 컬럼만 들어있음
pub type RowValues = Vec<(usize, CellValue)>;

/// 한 행의 변경 전/후 이미지
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowImage {
    pub before: Option<RowValues>,
    pub after: Option<RowValues>,
}

/// WRITE_ROWS / UPDATE_ROWS 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowsEventData {
    /// 테이블 ID
    pub table_id: u64,
    /// 플래그
    pub flags: u16,
    /// 컬럼 개수
    pub column_count: usize,
    /// 사용된 컬럼 비트맵
    pub columns_present: Vec<u8>,
    /// UPDATE 의 변경 후 컬럼 비트맵
    pub columns_after: Option<Vec<u8>>,
    /// 행 데이터들
    pub rows: Vec<RowImage>,
}

/// 셀 값 (다양한 MySQL 타입 지원)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Null,
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    DateTime(DateTime<Utc>),
    Date(String),
    Time(String),
    Decimal(String),
    Year(u16),
    Enum(u16),
    Set(u64),
    Bit(Vec<u8>),
}

impl CellValue {
    pub fn as_string(&self) -> Option<String> {
        match self {
            CellValue::String(s) => Some(s.clone()),
            CellValue::Int8(i) => Some(i.to_string()),
            CellValue::Int16(i) => Some(i.to_string()),
            CellValue::Int32(i) => Some(i.to_string()),
            CellValue::Int64(i) => Some(i.to_string()),
            CellValue::Double(d) => Some(d.to_string()),
            CellValue::Decimal(d) => Some(d.clone()),
            CellValue::DateTime(dt) => Some(dt.to_rfc3339()),
            CellValue::Null => Some("NULL".to_string()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CellValue::Int8(i) => Some(*i as i64),
            CellValue::Int16(i) => Some(*i as i64),
            CellValue::Int32(i) => Some(*i as i64),
            CellValue::Int64(i) => Some(*i),
            CellValue::Decimal(d) | CellValue::String(d) => d.parse().ok(),
            _ => None,
        }
    }
}

/// 스키마 + 테이블 식별자
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaAndTable {
    pub schema: String,
    pub table: String,
}

impl SchemaAndTable {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        SchemaAndTable {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// "db.table" 형식 파싱
    pub fn parse(qualified: &str) -> Option<Self> {
        let (schema, table) = qualified.trim().split_once('.')?;
        if schema.is_empty() || table.is_empty() {
            return None;
        }
        Some(SchemaAndTable::new(schema, table))
    }
}

impl fmt::Display for SchemaAndTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// 변경 연산 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    Insert,
    Update,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "INSERT",
            OperationType::Update => "UPDATE",
        }
    }
}

/// CDC 변경 레코드 (행 하나)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// 대상 테이블
    pub table: SchemaAndTable,
    /// 연산 타입 (INSERT, UPDATE)
    pub op: OperationType,
    /// 기본키 컬럼명
    pub key_columns: Vec<String>,
    /// 변경 전 데이터 (UPDATE 의 경우)
    pub before: Option<HashMap<String, CellValue>>,
    /// 변경 후 데이터
    pub after: Option<HashMap<String, CellValue>>,
    /// 이 행까지 처리했을 때의 재시작 위치
    pub position: BinlogPosition,
    /// 소스에서 이벤트가 기록된 시각
    pub timestamp: DateTime<Utc>,
}

impl ChangeRecord {
    /// 변경 후 값 우선, 없으면 변경 전 값
    pub fn column(&self, name: &str) -> Option<&CellValue> {
        self.after
            .as_ref()
            .and_then(|after| after.get(name))
            .or_else(|| self.before.as_ref().and_then(|before| before.get(name)))
    }
}
