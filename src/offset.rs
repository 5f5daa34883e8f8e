//! Binlog 처리 위치 추적 (Offset) 및 오프셋 저장소
//!
//! Binlog 파일명 + 위치 + 건너뛸 행 수로 정확한 재시작 지점을 추적합니다.
//! 예: "mysql-bin.000003" 파일의 4097 바이트 위치에서 시작하는 이벤트 그룹 중
//! 앞의 2개 행은 이미 발행됨 → `mysql-bin.000003:4097:2`

use crate::error::{CdcError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;
use tracing::debug;

/// MySQL binlog 은 4 바이트 매직 넘버 뒤에서 시작
pub const BINLOG_START_OFFSET: u64 = 4;

/// Binlog 재시작 위치
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BinlogPosition {
    /// 바이너리 로그 파일명 (e.g., "mysql-bin.000001"), 빈 문자열이면 가장 오래된 파일
    pub filename: String,
    /// 바이트 위치
    pub offset: u64,
    /// 해당 위치부터 재시작할 때 건너뛸 행 수
    #[serde(default)]
    pub rows_to_skip: u32,
}

impl BinlogPosition {
    pub fn new(filename: impl Into<String>, offset: u64) -> Self {
        BinlogPosition {
            filename: filename.into(),
            offset,
            rows_to_skip: 0,
        }
    }

    pub fn with_rows_to_skip(mut self, rows_to_skip: u32) -> Self {
        self.rows_to_skip = rows_to_skip;
        self
    }

    /// 서버에 남아있는 가장 오래된 binlog 의 처음
    pub fn earliest() -> Self {
        BinlogPosition::new("", BINLOG_START_OFFSET)
    }

    /// 파일명에서 시퀀스 번호 추출
    pub fn file_sequence(&self) -> Option<u64> {
        split_sequence(&self.filename).map(|(_, seq)| seq)
    }
}

fn split_sequence(filename: &str) -> Option<(&str, u64)> {
    let (base, seq) = filename.rsplit_once('.')?;
    Some((base, seq.parse().ok()?))
}

fn compare_filenames(a: &str, b: &str) -> Ordering {
    match (split_sequence(a), split_sequence(b)) {
        (Some((base_a, seq_a)), Some((base_b, seq_b))) if base_a == base_b => {
            seq_a.cmp(&seq_b).then_with(|| a.cmp(b))
        }
        _ => a.cmp(b),
    }
}

impl Ord for BinlogPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_filenames(&self.filename, &other.filename)
            .then(self.offset.cmp(&other.offset))
            .then(self.rows_to_skip.cmp(&other.rows_to_skip))
    }
}

impl PartialOrd for BinlogPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.filename, self.offset, self.rows_to_skip)
    }
}

/// 처리 위치의 영구 저장소
///
/// `save_position` 은 단조 증가하는 위치로만 호출되며 멱등이어야 합니다.
#[async_trait]
pub trait OffsetStore: Send + Sync {
    async fn last_position(&self) -> Result<Option<BinlogPosition>>;

    async fn save_position(&self, position: &BinlogPosition) -> Result<()>;
}

/// 다른 오프셋 추적 방식에서 넘어올 때 한 번 참조하는 위치
#[async_trait]
pub trait MigrationOffsetSource: Send + Sync {
    async fn last_position(&self) -> Result<Option<BinlogPosition>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredOffset {
    binlog_position: BinlogPosition,
    saved_at: DateTime<Utc>,
}

/// JSON 파일 기반 오프셋 저장소
///
/// 임시 파일에 쓴 뒤 rename 하므로 중간에 죽어도 이전 값이 남습니다.
#[derive(Debug, Clone)]
pub struct FileOffsetStore {
    path: PathBuf,
}

impl FileOffsetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileOffsetStore { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        PathBuf::from(temp)
    }
}

#[async_trait]
impl OffsetStore for FileOffsetStore {
    async fn last_position(&self) -> Result<Option<BinlogPosition>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => {
                let stored: StoredOffset = serde_json::from_str(&content)?;
                Ok(Some(stored.binlog_position))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CdcError::OffsetStoreError(format!(
                "Failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn save_position(&self, position: &BinlogPosition) -> Result<()> {
        let stored = StoredOffset {
            binlog_position: position.clone(),
            saved_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&stored)?;
        let temp_path = self.temp_path();

        tokio::fs::write(&temp_path, &json)
            .await
            .map_err(|e| CdcError::OffsetStoreError(format!("Failed to write offset: {}", e)))?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| CdcError::OffsetStoreError(format!("Failed to replace offset: {}", e)))?;

        debug!("Saved binlog offset {} to {}", position, self.path.display());
        Ok(())
    }
}

/// 메모리 오프셋 저장소. 저장 이력을 모두 보관합니다.
#[derive(Debug, Default)]
pub struct MemoryOffsetStore {
    history: Mutex<Vec<BinlogPosition>>,
}

impl MemoryOffsetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_position(position: BinlogPosition) -> Self {
        MemoryOffsetStore {
            history: Mutex::new(vec![position]),
        }
    }

    /// 지금까지 저장된 위치들 (저장 순서)
    pub fn history(&self) -> Vec<BinlogPosition> {
        self.history.lock().clone()
    }
}

#[async_trait]
impl OffsetStore for MemoryOffsetStore {
    async fn last_position(&self) -> Result<Option<BinlogPosition>> {
        Ok(self.history.lock().last().cloned())
    }

    async fn save_position(&self, position: &BinlogPosition) -> Result<()> {
        self.history.lock().push(position.clone());
        Ok(())
    }
}

/// Debezium 형식의 오프셋 (`{"file": ..., "pos": ..., "row": ...}`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebeziumOffset {
    pub file: String,
    pub pos: u64,
    #[serde(default)]
    pub row: Option<u32>,
}

impl From<DebeziumOffset> for BinlogPosition {
    fn from(offset: DebeziumOffset) -> Self {
        BinlogPosition::new(offset.file, offset.pos).with_rows_to_skip(offset.row.unwrap_or(0))
    }
}

/// Debezium 커넥터가 남긴 오프셋 파일을 마이그레이션 소스로 사용
#[derive(Debug, Clone)]
pub struct DebeziumOffsetFile {
    path: PathBuf,
}

impl DebeziumOffsetFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DebeziumOffsetFile { path: path.into() }
    }
}

#[async_trait]
impl MigrationOffsetSource for DebeziumOffsetFile {
    async fn last_position(&self) -> Result<Option<BinlogPosition>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => {
                let offset: DebeziumOffset = serde_json::from_str(&content)?;
                Ok(Some(offset.into()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CdcError::OffsetStoreError(format!(
                "Failed to read migration offset {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binlog_position_parse() {
        let pos = BinlogPosition::new("mysql-bin.000123", 4096);
        assert_eq!(pos.file_sequence(), Some(123));
        assert_eq!(pos.to_string(), "mysql-bin.000123:4096:0");
    }

    #[test]
    fn test_ordering_follows_rotation() {
        let a = BinlogPosition::new("mysql-bin.000009", 9_000);
        let b = BinlogPosition::new("mysql-bin.000010", 4);
        assert!(a < b);

        // 시퀀스 자릿수가 늘어나도 숫자로 비교
        let c = BinlogPosition::new("mysql-bin.999999", 4);
        let d = BinlogPosition::new("mysql-bin.1000000", 4);
        assert!(c < d);
    }

    #[test]
    fn test_ordering_within_file() {
        let base = BinlogPosition::new("mysql-bin.000001", 400);
        let skipped = base.clone().with_rows_to_skip(2);
        let next = BinlogPosition::new("mysql-bin.000001", 700);
        assert!(base < skipped);
        assert!(skipped < next);
        assert!(BinlogPosition::earliest() < base);
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileOffsetStore::new(dir.path().join("offset.json"));

        assert!(store.last_position().await.unwrap().is_none());

        let position = BinlogPosition::new("mysql-bin.000002", 1234).with_rows_to_skip(3);
        store.save_position(&position).await.unwrap();
        assert_eq!(store.last_position().await.unwrap(), Some(position));
        assert!(!dir.path().join("offset.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_memory_store_history() {
        let store = MemoryOffsetStore::new();
        store.save_position(&BinlogPosition::new("a.1", 10)).await.unwrap();
        store.save_position(&BinlogPosition::new("a.1", 20)).await.unwrap();
        assert_eq!(store.history().len(), 2);
        assert_eq!(
            store.last_position().await.unwrap(),
            Some(BinlogPosition::new("a.1", 20))
        );
    }

    #[tokio::test]
    async fn test_debezium_offset_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("debezium.json");
        tokio::fs::write(&path, r#"{"file":"mysql-bin.000007","pos":154,"row":1}"#)
            .await
            .unwrap();

        let source = DebeziumOffsetFile::new(&path);
        let position = source.last_position().await.unwrap().unwrap();
        assert_eq!(position, BinlogPosition::new("mysql-bin.000007", 154).with_rows_to_skip(1));

        let missing = DebeziumOffsetFile::new(dir.path().join("missing.json"));
        assert!(missing.last_position().await.unwrap().is_none());
    }
}
