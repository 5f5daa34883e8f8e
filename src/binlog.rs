//! MySQL Binlog 이벤트 파싱
//!
//! 각 이벤트:
//!   - Timestamp (4 bytes)
//!   - Type (1 byte)
//!   - Server ID (4 bytes)
//!   - Event Length (4 bytes)
//!   - Next Position (4 bytes)
//!   - Flags (2 bytes)
//!   - Event Data (variable)
//!
//! 서버에 체크섬을 끄도록 요청하므로 이벤트 끝에 CRC32 가 붙지 않습니다.

use crate::error::{CdcError, Result};
use crate::events::*;
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use std::io::{Cursor, Read};

/// TABLE_MAP optional metadata 타입
const METADATA_COLUMN_NAME: u8 = 4;
const METADATA_SIMPLE_PRIMARY_KEY: u8 = 8;
const METADATA_PRIMARY_KEY_WITH_PREFIX: u8 = 9;

/// Binlog 이벤트 파서
pub struct BinlogParser;

impl BinlogParser {
    /// 이벤트 헤더 파싱
    pub fn parse_header(data: &[u8]) -> Result<EventHeader> {
        if data.len() < EventHeader::SIZE {
            return Err(CdcError::BinlogParseError(format!(
                "Invalid event header: {} bytes",
                data.len()
            )));
        }

        let mut cursor = Cursor::new(data);

        let timestamp = cursor.read_u32::<LittleEndian>()?;
        let event_type = cursor.read_u8()?;
        let server_id = cursor.read_u32::<LittleEndian>()?;
        let event_length = cursor.read_u32::<LittleEndian>()?;
        let next_pos = cursor.read_u32::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;

        Ok(EventHeader {
            timestamp,
            event_type: EventType::from_u8(event_type),
            server_id,
            event_length,
            next_pos,
            flags,
        })
    }

    /// 헤더 + 본문으로 된 이벤트 바이트를 분리
    pub fn parse_event(data: &[u8]) -> Result<RawLogEvent> {
        let header = Self::parse_header(data)?;
        Ok(RawLogEvent {
            header,
            payload: Bytes::copy_from_slice(&data[EventHeader::SIZE..]),
        })
    }

    /// 행 이벤트의 테이블 ID 만 읽기 (본문 디코딩 전)
    pub fn peek_table_id(payload: &[u8]) -> Result<u64> {
        decoding(|| {
            let mut cursor = Cursor::new(payload);
            read_table_id(&mut cursor)
        })
    }

    /// 테이블 맵 이벤트 파싱 (19)
    pub fn parse_table_map_event(data: &[u8]) -> Result<TableMapData> {
        decoding(|| {
            let mut cursor = Cursor::new(data);

            let table_id = read_table_id(&mut cursor)?;
            let _flags = cursor.read_u16::<LittleEndian>()?;

            let database = read_name(&mut cursor)?;
            let table = read_name(&mut cursor)?;

            // 컬럼 개수
            let column_count = read_lcb(&mut cursor)? as usize;
            // 컬럼마다 타입 1 바이트
            ensure_remaining(&cursor, column_count)?;
            let mut column_types = Vec::with_capacity(column_count);
            for _ in 0..column_count {
                let code = cursor.read_u8()?;
                let column_type = ColumnType::from_u8(code).ok_or_else(|| {
                    CdcError::BinlogParseError(format!("Unknown column type {} in {}.{}", code, database, table))
                })?;
                column_types.push(column_type);
            }

            // Metadata
            let metadata_length = read_lcb(&mut cursor)? as usize;
            let metadata = read_bytes(&mut cursor, metadata_length)?;
            let column_meta = parse_column_meta(&column_types, &metadata)?;

            // nullable bitmap
            let mut nullable_bitmap = vec![0u8; column_count.div_ceil(8)];
            cursor.read_exact(&mut nullable_bitmap)?;

            let mut column_names = None;
            let mut primary_key = None;
            while (cursor.position() as usize) < data.len() {
                let field_type = cursor.read_u8()?;
                let field_length = read_lcb(&mut cursor)? as usize;
                let field = read_bytes(&mut cursor, field_length)?;

                match field_type {
                    METADATA_COLUMN_NAME => column_names = Some(parse_column_names(&field)?),
                    METADATA_SIMPLE_PRIMARY_KEY => primary_key = Some(parse_primary_key(&field, false)?),
                    METADATA_PRIMARY_KEY_WITH_PREFIX => {
                        primary_key = Some(parse_primary_key(&field, true)?)
                    }
                    _ => {}
                }
            }

            Ok(TableMapData {
                table_id,
                database,
                table,
                column_types,
                column_meta,
                nullable_bitmap,
                column_names,
                primary_key,
            })
        })
    }

    /// ROTATE 이벤트 파싱 (4)
    pub fn parse_rotate_event(data: &[u8]) -> Result<RotateEventData> {
        decoding(|| {
            if data.len() < 8 {
                return Err(CdcError::BinlogParseError(
                    "Invalid rotate event".to_string(),
                ));
            }

            let mut cursor = Cursor::new(data);

            let position = cursor.read_u64::<LittleEndian>()?;
            let filename_bytes = &data[cursor.position() as usize..];
            let filename = String::from_utf8_lossy(filename_bytes)
                .trim_end_matches('\0')
                .to_string();

            Ok(RotateEventData {
                next_binlog_name: filename,
                position,
            })
        })
    }

    /// WRITE_ROWS / UPDATE_ROWS 이벤트 파싱 (v1: 23/24, v2: 30/31)
    ///
    /// 컬럼 값 해석에는 같은 스트림에서 앞서 받은 테이블 맵이 필요합니다.
    pub fn parse_rows_event(
        data: &[u8],
        event_type: EventType,
        table_map: &TableMapData,
    ) -> Result<RowsEventData> {
        decoding(|| {
            let is_update = matches!(
                event_type,
                EventType::UpdateRowsEventV1 | EventType::UpdateRowsEvent
            );

            let mut cursor = Cursor::new(data);

            let table_id = read_table_id(&mut cursor)?;
            if table_id != table_map.table_id {
                return Err(CdcError::ProtocolError(format!(
                    "Rows event for table id {} decoded with mapping of table id {}",
                    table_id, table_map.table_id
                )));
            }
            let flags = cursor.read_u16::<LittleEndian>()?;

            if event_type.is_rows_v2() {
                // extra data 길이는 자기 자신 2 바이트를 포함
                let extra_len = cursor.read_u16::<LittleEndian>()? as u64;
                if extra_len > 2 {
                    cursor.set_position(cursor.position() + extra_len - 2);
                }
            }

            // 컬럼 개수
            let column_count = read_lcb(&mut cursor)? as usize;
            if column_count != table_map.column_count() {
                return Err(CdcError::ProtocolError(format!(
                    "Rows event has {} columns but table map for {}.{} has {}",
                    column_count,
                    table_map.database,
                    table_map.table,
                    table_map.column_count()
                )));
            }

            // 컬럼 존재 비트맵
            let bitmap_bytes = column_count.div_ceil(8);
            let mut columns_present = vec![0u8; bitmap_bytes];
            cursor.read_exact(&mut columns_present)?;

            // 변경된 컬럼 비트맵
            let columns_after = if is_update {
                let mut bitmap = vec![0u8; bitmap_bytes];
                cursor.read_exact(&mut bitmap)?;
                Some(bitmap)
            } else {
                None
            };

            let mut rows = Vec::new();
            while (cursor.position() as usize) < data.len() {
                if is_update {
                    let before = parse_row_values(&mut cursor, table_map, &columns_present)?;
                    let after_bitmap = columns_after.as_deref().unwrap_or(&columns_present);
                    let after = parse_row_values(&mut cursor, table_map, after_bitmap)?;
                    rows.push(RowImage {
                        before: Some(before),
                        after: Some(after),
                    });
                } else {
                    let after = parse_row_values(&mut cursor, table_map, &columns_present)?;
                    rows.push(RowImage {
                        before: None,
                        after: Some(after),
                    });
                }
            }

            Ok(RowsEventData {
                table_id,
                flags,
                column_count,
                columns_present,
                columns_after,
                rows,
            })
        })
    }
}

/// 본문이 중간에 끊긴 경우 I/O 에러 대신 파싱 에러로 보고
fn decoding<T>(parse: impl FnOnce() -> Result<T>) -> Result<T> {
    parse().map_err(|e| match e {
        CdcError::IoError(msg) => CdcError::BinlogParseError(format!("Truncated event data: {}", msg)),
        other => other,
    })
}

/// 6 바이트 테이블 ID
fn read_table_id(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    Ok(cursor.read_u48::<LittleEndian>()?)
}

/// 길이 1 바이트 + 이름 + NUL
fn read_name(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len = cursor.read_u8()? as usize;
    let bytes = read_bytes(cursor, len)?;
    cursor.read_u8()?;
    Ok(String::from_utf8_lossy(&bytes).to_string())
}

/// LCB (Length-Coded Binary) 읽기
fn read_lcb(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    let byte = cursor.read_u8()?;
    match byte {
        0..=0xfa => Ok(byte as u64),
        0xfb => Ok(0),
        0xfc => Ok(cursor.read_u16::<LittleEndian>()? as u64),
        0xfd => Ok(cursor.read_u24::<LittleEndian>()? as u64),
        0xfe => Ok(cursor.read_u64::<LittleEndian>()?),
        0xff => Err(CdcError::BinlogParseError("Invalid LCB value".to_string())),
    }
}

fn parse_column_meta(column_types: &[ColumnType], metadata: &[u8]) -> Result<Vec<u16>> {
    let mut cursor = Cursor::new(metadata);
    let mut column_meta = Vec::with_capacity(column_types.len());

    for column_type in column_types {
        let meta = match column_type {
            ColumnType::Float
            | ColumnType::Double
            | ColumnType::Blob
            | ColumnType::TinyBlob
            | ColumnType::MediumBlob
            | ColumnType::LongBlob
            | ColumnType::Json
            | ColumnType::Geometry
            | ColumnType::Time2
            | ColumnType::DateTime2
            | ColumnType::Timestamp2 => cursor.read_u8()? as u16,
            ColumnType::Varchar | ColumnType::VarString | ColumnType::Bit => {
                cursor.read_u16::<LittleEndian>()?
            }
            // precision, scale 순서
            ColumnType::NewDecimal => cursor.read_u16::<BigEndian>()?,
            // real type, length 순서
            ColumnType::String | ColumnType::Enum | ColumnType::Set => {
                cursor.read_u16::<BigEndian>()?
            }
            _ => 0,
        };
        column_meta.push(meta);
    }

    Ok(column_meta)
}

fn parse_column_names(field: &[u8]) -> Result<Vec<String>> {
    let mut cursor = Cursor::new(field);
    let mut names = Vec::new();
    while (cursor.position() as usize) < field.len() {
        let len = read_lcb(&mut cursor)? as usize;
        let bytes = read_bytes(&mut cursor, len)?;
        names.push(String::from_utf8_lossy(&bytes).to_string());
    }
    Ok(names)
}

fn parse_primary_key(field: &[u8], with_prefix: bool) -> Result<Vec<usize>> {
    let mut cursor = Cursor::new(field);
    let mut columns = Vec::new();
    while (cursor.position() as usize) < field.len() {
        columns.push(read_lcb(&mut cursor)? as usize);
        if with_prefix {
            read_lcb(&mut cursor)?;
        }
    }
    Ok(columns)
}

fn count_set_bits(bitmap: &[u8]) -> usize {
    bitmap.iter().map(|b| b.count_ones() as usize).sum()
}

pub(crate) fn is_bit_set(bitmap: &[u8], idx: usize) -> bool {
    let byte_idx = idx / 8;
    byte_idx < bitmap.len() && (bitmap[byte_idx] & (1 << (idx % 8))) != 0
}

/// 행 하나의 값들. (컬럼 인덱스, 값) 쌍으로 비트맵에 있는 컬럼만 포함
fn parse_row_values(
    cursor: &mut Cursor<&[u8]>,
    table_map: &TableMapData,
    present_bitmap: &[u8],
) -> Result<Vec<(usize, CellValue)>> {
    let present_count = count_set_bits(present_bitmap);
    let mut null_bitmap = vec![0u8; present_count.div_ceil(8)];
    cursor.read_exact(&mut null_bitmap)?;

    let mut values = Vec::with_capacity(present_count);
    let mut null_idx = 0;

    for col_idx in 0..table_map.column_count() {
        if !is_bit_set(present_bitmap, col_idx) {
            continue;
        }

        let value = if is_bit_set(&null_bitmap, null_idx) {
            CellValue::Null
        } else {
            parse_cell(
                cursor,
                table_map.column_types[col_idx],
                table_map.column_meta[col_idx],
            )?
        };
        values.push((col_idx, value));
        null_idx += 1;
    }

    Ok(values)
}

/// 컬럼 타입과 메타데이터에 따라 값 하나를 파싱
fn parse_cell(cursor: &mut Cursor<&[u8]>, column_type: ColumnType, meta: u16) -> Result<CellValue> {
    let value = match column_type {
        ColumnType::Tiny => CellValue::Int8(cursor.read_i8()?),
        ColumnType::Short => CellValue::Int16(cursor.read_i16::<LittleEndian>()?),
        ColumnType::Int24 => CellValue::Int32(cursor.read_i24::<LittleEndian>()?),
        ColumnType::Long => CellValue::Int32(cursor.read_i32::<LittleEndian>()?),
        ColumnType::LongLong => CellValue::Int64(cursor.read_i64::<LittleEndian>()?),
        ColumnType::Float => CellValue::Float(cursor.read_f32::<LittleEndian>()?),
        ColumnType::Double => CellValue::Double(cursor.read_f64::<LittleEndian>()?),
        ColumnType::Null => CellValue::Null,
        ColumnType::Year => {
            let year = cursor.read_u8()? as u16;
            CellValue::Year(if year == 0 { 0 } else { year + 1900 })
        }
        ColumnType::Date | ColumnType::NewDate => {
            let packed = cursor.read_u24::<LittleEndian>()?;
            CellValue::Date(format!(
                "{:04}-{:02}-{:02}",
                packed >> 9,
                (packed >> 5) & 0x0F,
                packed & 0x1F
            ))
        }
        ColumnType::Time => {
            let packed = cursor.read_u24::<LittleEndian>()?;
            CellValue::Time(format!(
                "{:02}:{:02}:{:02}",
                packed / 10000,
                (packed / 100) % 100,
                packed % 100
            ))
        }
        ColumnType::Time2 => {
            let packed = cursor.read_u24::<BigEndian>()? as i64 - 0x800000;
            let micros = read_fractional_seconds(cursor, meta)?;
            let negative = packed < 0;
            let value = packed.abs();
            CellValue::Time(format!(
                "{}{:02}:{:02}:{:02}.{:06}",
                if negative { "-" } else { "" },
                (value >> 12) & 0x3FF,
                (value >> 6) & 0x3F,
                value & 0x3F,
                micros
            ))
        }
        ColumnType::DateTime => {
            let packed = cursor.read_u64::<LittleEndian>()?;
            let date = packed / 1_000_000;
            let time = packed % 1_000_000;
            datetime_cell(
                (date / 10000) as i32,
                ((date / 100) % 100) as u32,
                (date % 100) as u32,
                (time / 10000) as u32,
                ((time / 100) % 100) as u32,
                (time % 100) as u32,
                0,
            )
        }
        ColumnType::DateTime2 => {
            let packed = cursor.read_uint::<BigEndian>(5)?;
            let micros = read_fractional_seconds(cursor, meta)?;
            let year_month = (packed >> 22) & 0x1FFFF;
            datetime_cell(
                (year_month / 13) as i32,
                (year_month % 13) as u32,
                ((packed >> 17) & 0x1F) as u32,
                ((packed >> 12) & 0x1F) as u32,
                ((packed >> 6) & 0x3F) as u32,
                (packed & 0x3F) as u32,
                micros,
            )
        }
        ColumnType::Timestamp => {
            let seconds = cursor.read_u32::<LittleEndian>()?;
            timestamp_cell(seconds, 0)
        }
        ColumnType::Timestamp2 => {
            let seconds = cursor.read_u32::<BigEndian>()?;
            let micros = read_fractional_seconds(cursor, meta)?;
            timestamp_cell(seconds, micros)
        }
        ColumnType::Varchar | ColumnType::VarString => {
            let len = if meta < 256 {
                cursor.read_u8()? as usize
            } else {
                cursor.read_u16::<LittleEndian>()? as usize
            };
            CellValue::String(read_string(cursor, len)?)
        }
        ColumnType::String => {
            let (real_type, length) = string_real_type(meta);
            if real_type == ColumnType::Enum as u8 {
                CellValue::Enum(cursor.read_uint::<LittleEndian>(length.clamp(1, 2))? as u16)
            } else if real_type == ColumnType::Set as u8 {
                CellValue::Set(cursor.read_uint::<LittleEndian>(length.clamp(1, 8))?)
            } else {
                let len = if length < 256 {
                    cursor.read_u8()? as usize
                } else {
                    cursor.read_u16::<LittleEndian>()? as usize
                };
                CellValue::String(read_string(cursor, len)?)
            }
        }
        ColumnType::Enum => {
            let size = (meta & 0xFF) as usize;
            CellValue::Enum(cursor.read_uint::<LittleEndian>(size.clamp(1, 2))? as u16)
        }
        ColumnType::Set => {
            let size = (meta & 0xFF) as usize;
            CellValue::Set(cursor.read_uint::<LittleEndian>(size.clamp(1, 8))?)
        }
        ColumnType::Blob
        | ColumnType::TinyBlob
        | ColumnType::MediumBlob
        | ColumnType::LongBlob
        | ColumnType::Json
        | ColumnType::Geometry => {
            let len_bytes = (meta as usize).clamp(1, 4);
            let len = cursor.read_uint::<LittleEndian>(len_bytes)? as usize;
            CellValue::Bytes(read_bytes(cursor, len)?)
        }
        ColumnType::Bit => {
            let bits = ((meta >> 8) * 8 + (meta & 0xFF)) as usize;
            CellValue::Bit(read_bytes(cursor, bits.div_ceil(8))?)
        }
        ColumnType::NewDecimal => {
            let precision = (meta >> 8) as usize;
            let scale = (meta & 0xFF) as usize;
            CellValue::Decimal(decode_decimal(cursor, precision, scale)?)
        }
        ColumnType::Decimal => {
            return Err(CdcError::BinlogParseError(
                "Pre-5.0 DECIMAL columns are not supported".to_string(),
            ))
        }
    };

    Ok(value)
}

/// STRING 컬럼 메타데이터에서 실제 타입과 최대 길이 추출
fn string_real_type(meta: u16) -> (u8, usize) {
    if meta >= 256 {
        let meta0 = (meta >> 8) as u8;
        let meta1 = (meta & 0xFF) as usize;
        if (meta0 & 0x30) != 0x30 {
            // 길이가 255 를 넘는 CHAR 는 상위 비트가 real type 에 섞여 있음
            let length = meta1 | ((((meta0 & 0x30) ^ 0x30) as usize) << 4);
            (meta0 | 0x30, length)
        } else {
            (meta0, meta1)
        }
    } else {
        (ColumnType::String as u8, meta as usize)
    }
}

/// 길이 값은 신뢰할 수 없으므로 남은 데이터보다 길면 에러
fn ensure_remaining(cursor: &Cursor<&[u8]>, len: usize) -> Result<()> {
    let remaining = cursor.get_ref().len().saturating_sub(cursor.position() as usize);
    if len > remaining {
        return Err(CdcError::BinlogParseError(format!(
            "Length {} exceeds remaining {} bytes",
            len, remaining
        )));
    }
    Ok(())
}

fn read_bytes(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<Vec<u8>> {
    ensure_remaining(cursor, len)?;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn read_string(cursor: &mut Cursor<&[u8]>, len: usize) -> Result<String> {
    Ok(String::from_utf8_lossy(&read_bytes(cursor, len)?).to_string())
}

/// fsp 자릿수에 따라 1~3 바이트 (big-endian) 를 마이크로초로 변환
fn read_fractional_seconds(cursor: &mut Cursor<&[u8]>, fsp: u16) -> Result<u32> {
    if fsp > 6 {
        return Err(CdcError::BinlogParseError(format!(
            "Invalid fractional seconds precision {}",
            fsp
        )));
    }
    let bytes = (fsp as usize).div_ceil(2);
    if bytes == 0 {
        return Ok(0);
    }
    let value = cursor.read_uint::<BigEndian>(bytes)? as u32;
    Ok(value * 10u32.pow(6 - 2 * bytes as u32))
}

fn datetime_cell(
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
    micros: u32,
) -> CellValue {
    match NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_micro_opt(hour, minute, second, micros))
    {
        Some(naive) => CellValue::DateTime(naive.and_utc()),
        // 0000-00-00 같은 zero date
        None => CellValue::String(format!(
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            year, month, day, hour, minute, second
        )),
    }
}

fn timestamp_cell(seconds: u32, micros: u32) -> CellValue {
    match DateTime::<Utc>::from_timestamp(seconds as i64, micros * 1000) {
        Some(dt) => CellValue::DateTime(dt),
        None => CellValue::Null,
    }
}

/// MySQL DECIMAL 바이너리 형식 디코딩
///
/// 9 자리마다 4 바이트 big-endian 정수, 남는 자리는 DIG2BYTES 만큼.
/// 첫 바이트 최상위 비트가 부호이며 음수는 모든 비트가 반전되어 있음.
fn decode_decimal(cursor: &mut Cursor<&[u8]>, precision: usize, scale: usize) -> Result<String> {
    const DIG2BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];

    if scale > precision {
        return Err(CdcError::BinlogParseError(format!(
            "Invalid DECIMAL({}, {})",
            precision, scale
        )));
    }

    let integral = precision - scale;
    let int_words = integral / 9;
    let int_leftover = integral % 9;
    let frac_words = scale / 9;
    let frac_leftover = scale % 9;

    let size = int_words * 4 + DIG2BYTES[int_leftover] + frac_words * 4 + DIG2BYTES[frac_leftover];
    let mut buf = read_bytes(cursor, size)?;
    if buf.is_empty() {
        return Ok("0".to_string());
    }

    let negative = buf[0] & 0x80 == 0;
    buf[0] ^= 0x80;
    if negative {
        for byte in buf.iter_mut() {
            *byte ^= 0xFF;
        }
    }

    let mut reader = Cursor::new(buf.as_slice());
    let mut int_part = String::new();
    if int_leftover > 0 {
        let value = reader.read_uint::<BigEndian>(DIG2BYTES[int_leftover])?;
        int_part.push_str(&format!("{:0width$}", value, width = int_leftover));
    }
    for _ in 0..int_words {
        let value = reader.read_u32::<BigEndian>()?;
        int_part.push_str(&format!("{:09}", value));
    }
    let int_part = int_part.trim_start_matches('0');

    let mut frac_part = String::new();
    for _ in 0..frac_words {
        let value = reader.read_u32::<BigEndian>()?;
        frac_part.push_str(&format!("{:09}", value));
    }
    if frac_leftover > 0 {
        let value = reader.read_uint::<BigEndian>(DIG2BYTES[frac_leftover])?;
        frac_part.push_str(&format!("{:0width$}", value, width = frac_leftover));
    }

    let mut decimal = String::new();
    if negative {
        decimal.push('-');
    }
    decimal.push_str(if int_part.is_empty() { "0" } else { int_part });
    if !frac_part.is_empty() {
        decimal.push('.');
        decimal.push_str(&frac_part);
    }
    Ok(decimal)
}
