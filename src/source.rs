//! 복제 소스(외부 binlog 클라이언트) 추상화
//!
//! 디스패처는 이 트레이트들을 통해서만 복제 스트림과 상호작용합니다.

use crate::connection::ConnectionConfig;
use crate::error::{CdcError, Result};
use crate::events::RowsEvent;
use crate::gtid::GtidSet;
use async_trait::async_trait;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 복제 클라이언트가 호출하는 콜백 집합
///
/// 콜백이 에러를 반환하면 클라이언트는 스트리밍을 중단해야 합니다.
#[async_trait]
pub trait ReplicationEventHandler: Send + Sync {
    /// 행 변경 콜백
    async fn on_row(&self, event: RowsEvent) -> Result<()>;

    /// 위치 확정 콜백 (트랜잭션 커밋 이후)
    async fn on_pos_synced(&self, gtid_set: &GtidSet) -> Result<()>;

    async fn on_rotate(&self, _next_binlog: &str) -> Result<()> {
        Ok(())
    }

    async fn on_ddl(&self, _schema: &str, _query: &str) -> Result<()> {
        Ok(())
    }
}

/// 복제 소스 연결
#[async_trait]
pub trait ReplicationSource: Send + Sync {
    fn set_event_handler(&mut self, handler: Arc<dyn ReplicationEventHandler>);

    /// 주어진 GTID 집합 이후부터 스트리밍 시작
    ///
    /// 스트리밍은 소스가 소유한 태스크에서 진행되며, 이 호출은 시작이
    /// 확인되면 반환합니다.
    async fn start_from_gtid(&mut self, gtid_set: GtidSet) -> Result<()>;

    /// 소스의 현재 라이브 위치부터 스트리밍 시작
    async fn start_from_current(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// 설정으로부터 복제 소스를 여는 팩토리
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// `cancel`이 취소되면 소스의 스트리밍도 멈춰야 합니다.
    async fn connect(
        &self,
        config: SourceConfig,
        cancel: CancellationToken,
    ) -> Result<Box<dyn ReplicationSource>>;
}

/// 복제 소스 설정
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub connection: ConnectionConfig,
    pub charset: String,
    /// `^table(_[0-9]{6})?$` 형태의 테이블 포함 패턴
    pub include_tables: Vec<String>,
    /// 재연결 시도 횟수 (None = 무제한)
    pub max_reconnect_attempts: Option<u32>,
    pub reconnect_delay: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig {
            connection: ConnectionConfig::default(),
            charset: "utf8mb4".to_string(),
            include_tables: Vec::new(),
            max_reconnect_attempts: None,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

impl SourceConfig {
    pub fn new(connection: ConnectionConfig) -> Self {
        SourceConfig {
            connection,
            ..Default::default()
        }
    }

    pub fn with_charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = charset.into();
        self
    }

    /// 논리 테이블과 그 샤드 테이블을 포함 패턴에 추가
    pub fn include_logical_table(mut self, table: &str) -> Self {
        self.include_tables
            .push(format!("^{}(_[0-9]{{6}})?$", regex::escape(table)));
        self
    }

    pub fn with_reconnect(mut self, max_attempts: Option<u32>, delay: Duration) -> Self {
        self.max_reconnect_attempts = max_attempts;
        self.reconnect_delay = delay;
        self
    }

    /// 포함 패턴 컴파일
    pub fn table_filter(&self) -> Result<TableFilter> {
        let patterns = self
            .include_tables
            .iter()
            .map(|p| Regex::new(p).map_err(|e| CdcError::Config(format!("{}: {}", p, e))))
            .collect::<Result<Vec<_>>>()?;
        Ok(TableFilter { patterns })
    }
}

/// 테이블 포함 필터 (패턴이 없으면 모두 포함)
#[derive(Debug, Clone)]
pub struct TableFilter {
    patterns: Vec<Regex>,
}

impl TableFilter {
    pub fn matches(&self, table: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| p.is_match(table))
    }
}
