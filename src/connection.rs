//! MySQL 데이터베이스 연결 관리

use crate::error::{CdcError, Result};
use crate::gtid::GtidSet;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder};
use std::time::Duration;

/// MySQL 연결 설정
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: Option<String>,
    /// 복제 클라이언트로 등록할 서버 ID
    pub server_id: u32,
    pub timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            hostname: "localhost".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            database: None,
            server_id: 1001,
            timeout: Duration::from_secs(30),
        }
    }
}

impl ConnectionConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        ConnectionConfig {
            hostname: hostname.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn build_opts(&self) -> Opts {
        OptsBuilder::default()
            .ip_or_hostname(self.hostname.clone())
            .tcp_port(self.port)
            .user(Some(self.username.clone()))
            .pass(Some(self.password.clone()))
            .db_name(self.database.clone())
            .into()
    }
}

/// MySQL 연결 래퍼
pub struct MySqlConnection {
    conn: Conn,
}

impl MySqlConnection {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let conn = tokio::time::timeout(config.timeout, Conn::new(config.build_opts()))
            .await
            .map_err(|_| {
                CdcError::ConnectionError(format!(
                    "Timed out connecting to {}:{}",
                    config.hostname, config.port
                ))
            })?
            .map_err(|e| CdcError::ConnectionError(format!("Failed to connect to MySQL: {}", e)))?;

        Ok(MySqlConnection { conn })
    }

    /// 현재 실행된 GTID 집합 조회
    pub async fn get_executed_gtid_set(&mut self) -> Result<GtidSet> {
        let result: Option<(String,)> = self
            .conn
            .query_first("SELECT @@GLOBAL.gtid_executed")
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query gtid_executed: {}", e)))?;

        match result {
            Some((gtid_set,)) => GtidSet::parse(&gtid_set),
            None => Ok(GtidSet::new()),
        }
    }

    /// GTID 모드 활성 여부 확인
    pub async fn is_gtid_mode_enabled(&mut self) -> Result<bool> {
        let mode = self.get_variable("gtid_mode").await?;
        Ok(mode.as_deref() == Some("ON"))
    }

    /// 변수 조회
    pub async fn get_variable(&mut self, name: &str) -> Result<Option<String>> {
        let result: Option<(String, String)> = self
            .conn
            .exec_first("SHOW GLOBAL VARIABLES LIKE ?", (name,))
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query {}: {}", name, e)))?;

        Ok(result.map(|(_, v)| v))
    }

    /// 선언 순서대로의 컬럼명 조회
    pub async fn get_column_names(&mut self, database: &str, table: &str) -> Result<Vec<String>> {
        let result: Vec<(String,)> = self
            .conn
            .exec(
                "SELECT COLUMN_NAME FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
                 ORDER BY ORDINAL_POSITION",
                (database, table),
            )
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query table schema: {}", e)))?;

        Ok(result.into_iter().map(|(name,)| name).collect())
    }

    /// 세션 문자셋 설정
    pub async fn set_names(&mut self, charset: &str) -> Result<()> {
        if charset.is_empty() || !charset.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(CdcError::Config(format!("Invalid charset: {}", charset)));
        }
        self.conn
            .query_drop(format!("SET NAMES {}", charset))
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to set charset {}: {}", charset, e)))
    }

    /// 스트리밍용으로 연결 소유권 이전
    pub fn into_inner(self) -> Conn {
        self.conn
    }

    pub async fn close(self) -> Result<()> {
        self.conn.disconnect().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.hostname, "localhost");
        assert_eq!(config.port, 3306);
    }

    #[test]
    fn test_connection_config_opts() {
        let mut config = ConnectionConfig::new("127.0.0.1", "repl");
        config.port = 3307;
        config.database = Some("shop".to_string());

        let opts = config.build_opts();
        assert_eq!(opts.ip_or_hostname(), "127.0.0.1");
        assert_eq!(opts.tcp_port(), 3307);
        assert_eq!(opts.user(), Some("repl"));
        assert_eq!(opts.db_name(), Some("shop"));
    }
}
