//! 복제 동기화 관련 에러 타입

use thiserror::Error;
use std::io;

#[derive(Error, Debug)]
pub enum CdcError {
    #[error("MySQL 연결 에러: {0}")]
    ConnectionError(String),

    #[error("쿼리 실행 에러: {0}")]
    QueryError(String),

    #[error("GTID 처리 에러: {0}")]
    GtidError(String),

    #[error("동기화 위치 로드 에러: {0}")]
    PositionLoad(String),

    #[error("동기화 위치 저장 에러: {0}")]
    PositionSave(String),

    #[error("I/O 에러: {0}")]
    IoError(String),

    #[error("행 이미지 디코딩 에러: {0}")]
    RowDecode(String),

    #[error("설정 에러: {0}")]
    Config(String),

    #[error("잘못된 핸들러 등록: {0}")]
    InvalidHandler(String),

    #[error("현재 상태({0})에서 허용되지 않는 작업")]
    InvalidState(String),

    #[error("동기화가 취소되었습니다")]
    Cancelled,

    #[error("채널이 닫혔습니다")]
    ChannelClosed,
}

impl From<io::Error> for CdcError {
    fn from(err: io::Error) -> Self {
        CdcError::IoError(err.to_string())
    }
}

impl From<mysql_async::Error> for CdcError {
    fn from(err: mysql_async::Error) -> Self {
        CdcError::ConnectionError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CdcError>;
