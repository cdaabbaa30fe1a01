//! 복제 콜백 페이로드 및 디스패치 큐 메시지 정의

use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;

/// 행 변경 연산 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowAction {
    Insert,
    Update,
    Delete,
}

impl RowAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowAction::Insert => "insert",
            RowAction::Update => "update",
            RowAction::Delete => "delete",
        }
    }
}

impl fmt::Display for RowAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 셀 값 (다양한 MySQL 타입 지원)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    DateTime(DateTime<Utc>),
    Date(String),
    Time(String),
    Json(serde_json::Value),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }
}

/// 레코드 키로 쓰이는 텍스트 표현
impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Null => f.write_str("NULL"),
            CellValue::Int(i) => write!(f, "{}", i),
            CellValue::UInt(u) => write!(f, "{}", u),
            CellValue::Float(v) => write!(f, "{}", v),
            CellValue::Double(v) => write!(f, "{}", v),
            CellValue::String(s) => f.write_str(s),
            CellValue::Bytes(b) => f.write_str(&String::from_utf8_lossy(b)),
            CellValue::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S")),
            CellValue::Date(s) | CellValue::Time(s) => f.write_str(s),
            CellValue::Json(v) => write!(f, "{}", v),
        }
    }
}

/// 복제 클라이언트가 전달하는 원시 행 변경 콜백 데이터
///
/// UPDATE의 경우 `rows`는 (변경 전, 변경 후) 이미지가 번갈아 들어있습니다.
#[derive(Debug, Clone)]
pub struct RowsEvent {
    /// 데이터베이스명
    pub schema: String,
    /// 물리 테이블명 (샤드 접미사 포함)
    pub table: String,
    /// 선언 순서대로의 컬럼명
    pub columns: Vec<String>,
    pub action: RowAction,
    pub rows: Vec<Vec<CellValue>>,
    /// 이벤트 타임스탬프
    pub timestamp: DateTime<Utc>,
}

impl RowsEvent {
    /// 논리적 변경마다 하나의 이미지 (UPDATE는 변경 후 이미지만)
    pub fn images(&self) -> impl Iterator<Item = &Vec<CellValue>> {
        let update = self.action == RowAction::Update;
        self.rows
            .iter()
            .enumerate()
            .filter(move |(i, _)| !update || i % 2 == 1)
            .map(|(_, row)| row)
    }
}

/// 핸들러에 전달되는 행 변경 이벤트
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// 물리 테이블명
    pub table: String,
    pub schema: String,
    pub action: RowAction,
    /// 첫 번째 컬럼 값의 텍스트 표현
    pub record_key: String,
    /// 전체 컬럼 값 (설정된 경우에만)
    pub values: Option<HashMap<String, CellValue>>,
    pub timestamp: DateTime<Utc>,
}

/// 복제 클라이언트가 확정한 재시작 위치
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub gtid_set: String,
}

/// 디스패치 큐 메시지
#[derive(Debug, Clone)]
pub enum SyncMessage {
    Row(ChangeEvent),
    Checkpoint(Checkpoint),
}
