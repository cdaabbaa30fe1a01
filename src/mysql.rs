//! mysql_async binlog 스트림 기반 복제 소스
//!
//! COM_BINLOG_DUMP_GTID로 스트림을 열고, 행 이벤트를 `RowsEvent`로 변환해
//! 등록된 콜백에 전달합니다. 트랜잭션 커밋(XID)마다 누적 GTID 집합을
//! 위치 확정 콜백으로 보고합니다. 스트림 오류 시 마지막 커밋 위치부터
//! 재연결합니다.

use crate::connection::MySqlConnection;
use crate::error::{CdcError, Result};
use crate::events::{CellValue, RowAction, RowsEvent};
use crate::gtid::GtidSet;
use crate::source::{
    ReplicationEventHandler, ReplicationSource, SourceConfig, SourceConnector, TableFilter,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use futures_util::StreamExt;
use mysql_async::binlog::events::{EventData, RowsEventData, TableMapEvent};
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::{BinlogStream, BinlogStreamRequest, GnoInterval, Sid, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// MySQL 복제 소스 팩토리
#[derive(Debug, Clone, Copy, Default)]
pub struct MysqlConnector;

#[async_trait]
impl SourceConnector for MysqlConnector {
    async fn connect(
        &self,
        config: SourceConfig,
        cancel: CancellationToken,
    ) -> Result<Box<dyn ReplicationSource>> {
        Ok(Box::new(MysqlSource::new(config, cancel)?))
    }
}

/// MySQL binlog 복제 소스
pub struct MysqlSource {
    config: SourceConfig,
    filter: TableFilter,
    handler: Option<Arc<dyn ReplicationEventHandler>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl MysqlSource {
    /// `cancel`이 취소되면 스트리밍 태스크가 연결을 끊고 종료됩니다.
    pub fn new(config: SourceConfig, cancel: CancellationToken) -> Result<Self> {
        let filter = config.table_filter()?;
        Ok(MysqlSource {
            config,
            filter,
            handler: None,
            cancel: cancel.child_token(),
            task: None,
        })
    }
}

#[async_trait]
impl ReplicationSource for MysqlSource {
    fn set_event_handler(&mut self, handler: Arc<dyn ReplicationEventHandler>) {
        self.handler = Some(handler);
    }

    async fn start_from_gtid(&mut self, gtid_set: GtidSet) -> Result<()> {
        if self.task.is_some() {
            return Err(CdcError::InvalidState("streaming".to_string()));
        }
        let handler = self
            .handler
            .clone()
            .ok_or_else(|| CdcError::Config("event handler is not set".to_string()))?;

        let mut task = StreamTask {
            config: self.config.clone(),
            filter: self.filter.clone(),
            handler,
            cancel: self.cancel.clone(),
            executed: gtid_set,
            columns: HashMap::new(),
            schema_conn: None,
        };

        // 첫 연결 실패는 시작 실패로 보고
        let stream = task.open_stream().await?;
        self.task = Some(tokio::spawn(task.run(stream)));
        Ok(())
    }

    async fn start_from_current(&mut self) -> Result<()> {
        let mut conn = MySqlConnection::connect(&self.config.connection).await?;
        if !conn.is_gtid_mode_enabled().await? {
            return Err(CdcError::GtidError("gtid_mode is not ON".to_string()));
        }
        let executed = conn.get_executed_gtid_set().await?;
        conn.close().await?;

        info!("Current executed GTID set: {}", executed);
        self.start_from_gtid(executed).await
    }

    async fn close(&mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Binlog streaming task terminated abnormally: {}", e);
            }
        }
        Ok(())
    }
}

/// 스트림 종료 사유
enum StreamEnd {
    Cancelled,
    /// 콜백이 에러를 반환해 스트리밍 중단
    Halted(CdcError),
}

struct StreamTask {
    config: SourceConfig,
    filter: TableFilter,
    handler: Arc<dyn ReplicationEventHandler>,
    cancel: CancellationToken,
    /// 마지막으로 커밋이 확인된 GTID 집합
    executed: GtidSet,
    /// (schema, table) → 선언 순서 컬럼명
    columns: HashMap<(String, String), Vec<String>>,
    schema_conn: Option<MySqlConnection>,
}

impl StreamTask {
    async fn run(mut self, stream: BinlogStream) {
        let mut stream = Some(stream);
        let mut attempts: u32 = 0;

        loop {
            let current = match stream.take() {
                Some(s) => s,
                None => match self.open_stream().await {
                    Ok(s) => {
                        info!("Reconnected binlog stream from {}", self.executed);
                        attempts = 0;
                        s
                    }
                    Err(e) => {
                        warn!("Binlog reconnect attempt {} failed: {}", attempts, e);
                        if !self.wait_before_retry(&mut attempts).await {
                            break;
                        }
                        continue;
                    }
                },
            };

            match self.pump(current).await {
                Ok(StreamEnd::Cancelled) => break,
                Ok(StreamEnd::Halted(e)) => {
                    info!("Binlog streaming halted by event handler: {}", e);
                    break;
                }
                Err(e) => {
                    warn!("Binlog stream error: {}", e);
                    self.schema_conn = None;
                    if !self.wait_before_retry(&mut attempts).await {
                        break;
                    }
                }
            }
        }

        if let Some(conn) = self.schema_conn.take() {
            let _ = conn.close().await;
        }
        info!("Binlog streaming ended at {}", self.executed);
    }

    /// 재연결 정책 확인 후 대기. 재시도하지 않으면 false
    async fn wait_before_retry(&self, attempts: &mut u32) -> bool {
        *attempts += 1;
        if let Some(max) = self.config.max_reconnect_attempts {
            if *attempts > max {
                error!("Giving up after {} reconnect attempts", max);
                return false;
            }
        }

        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.config.reconnect_delay) => true,
        }
    }

    async fn open_stream(&mut self) -> Result<BinlogStream> {
        let mut conn = MySqlConnection::connect(&self.config.connection).await?;
        conn.set_names(&self.config.charset).await?;

        let request = BinlogStreamRequest::new(self.config.connection.server_id)
            .with_gtid()
            .with_gtid_set(to_sids(&self.executed));

        let stream = conn
            .into_inner()
            .get_binlog_stream(request)
            .await
            .map_err(|e| CdcError::ConnectionError(format!("Failed to open binlog stream: {}", e)))?;

        info!(
            "Binlog stream opened on {}:{} as server_id {}",
            self.config.connection.hostname,
            self.config.connection.port,
            self.config.connection.server_id
        );
        Ok(stream)
    }

    async fn pump(&mut self, mut stream: BinlogStream) -> Result<StreamEnd> {
        let mut pending: Option<(Uuid, u64)> = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                next = stream.next() => next,
            };

            let event = match next {
                Some(event) => event?,
                None => {
                    return Err(CdcError::ConnectionError("binlog stream closed by server".to_string()))
                }
            };
            let timestamp = DateTime::from_timestamp(i64::from(event.header().timestamp()), 0)
                .unwrap_or_else(Utc::now);

            let Some(data) = event.read_data()? else {
                continue;
            };

            let result = match data {
                EventData::GtidEvent(ev) => {
                    pending = Some((Uuid::from_bytes(ev.sid()), ev.gno()));
                    Ok(())
                }
                EventData::XidEvent(_) => self.commit(&mut pending).await,
                EventData::QueryEvent(ev) => {
                    let query = ev.query();
                    if query.eq_ignore_ascii_case("BEGIN") {
                        Ok(())
                    } else {
                        let schema = ev.schema().into_owned();
                        self.columns.retain(|(db, _), _| *db != schema);
                        match self.handler.on_ddl(&schema, &query).await {
                            Ok(()) => self.commit(&mut pending).await,
                            Err(e) => Err(e),
                        }
                    }
                }
                EventData::RotateEvent(ev) => self.handler.on_rotate(&ev.name()).await,
                EventData::RowsEvent(rows) => {
                    let converted = match stream.get_tme(rows.table_id()) {
                        Some(tme) => {
                            let schema = tme.database_name().into_owned();
                            let table = tme.table_name().into_owned();
                            if self.wants_table(&schema, &table) {
                                match convert_rows(&rows, tme) {
                                    Ok(converted) => Some((schema, table, converted)),
                                    // 재연결해도 같은 이벤트에서 다시 실패
                                    Err(e @ CdcError::RowDecode(_)) => {
                                        return Ok(StreamEnd::Halted(e))
                                    }
                                    Err(e) => return Err(e),
                                }
                            } else {
                                None
                            }
                        }
                        None => {
                            warn!("Rows event for unknown table id {}", rows.table_id());
                            None
                        }
                    };

                    match converted {
                        Some((schema, table, (action, rows))) => {
                            let columns = self.column_names(&schema, &table).await?;
                            self.handler
                                .on_row(RowsEvent {
                                    schema,
                                    table,
                                    columns,
                                    action,
                                    rows,
                                    timestamp,
                                })
                                .await
                        }
                        None => Ok(()),
                    }
                }
                _ => Ok(()),
            };

            if let Err(e) = result {
                return Ok(StreamEnd::Halted(e));
            }
        }
    }

    fn wants_table(&self, schema: &str, table: &str) -> bool {
        if let Some(db) = &self.config.connection.database {
            if db != schema {
                return false;
            }
        }
        self.filter.matches(table)
    }

    /// 진행 중 트랜잭션을 누적 집합에 반영하고 위치 확정 보고
    async fn commit(&mut self, pending: &mut Option<(Uuid, u64)>) -> Result<()> {
        let Some((uuid, gno)) = pending.take() else {
            return Ok(());
        };
        self.executed.add(uuid, gno)?;
        self.handler.on_pos_synced(&self.executed).await
    }

    async fn column_names(&mut self, schema: &str, table: &str) -> Result<Vec<String>> {
        let key = (schema.to_string(), table.to_string());
        if let Some(columns) = self.columns.get(&key) {
            return Ok(columns.clone());
        }

        let mut conn = match self.schema_conn.take() {
            Some(conn) => conn,
            None => MySqlConnection::connect(&self.config.connection).await?,
        };
        let columns = conn.get_column_names(schema, table).await?;
        self.schema_conn = Some(conn);
        debug!("Loaded {} columns for {}.{}", columns.len(), schema, table);

        self.columns.insert(key, columns.clone());
        Ok(columns)
    }
}

/// GTID 집합을 덤프 요청용 SID 목록으로 변환 (구간 끝은 미포함)
fn to_sids(gtid_set: &GtidSet) -> Vec<Sid<'static>> {
    gtid_set
        .sets
        .values()
        .filter(|set| !set.ranges.is_empty())
        .map(|set| {
            set.ranges.iter().fold(Sid::new(*set.uuid.as_bytes()), |sid, range| {
                // GtidRange가 i64::MAX 이하만 허용하므로 넘치지 않음
                sid.with_interval(GnoInterval::new(range.start, range.end + 1))
            })
        })
        .collect()
}

/// 행 이벤트를 연산 타입과 이미지 목록으로 변환
///
/// UPDATE는 (변경 전, 변경 후) 순서로 번갈아 담습니다.
fn convert_rows(
    data: &RowsEventData<'_>,
    tme: &TableMapEvent<'_>,
) -> Result<(RowAction, Vec<Vec<CellValue>>)> {
    let action = match data {
        RowsEventData::WriteRowsEventV1(_) | RowsEventData::WriteRowsEvent(_) => RowAction::Insert,
        RowsEventData::DeleteRowsEventV1(_) | RowsEventData::DeleteRowsEvent(_) => RowAction::Delete,
        _ => RowAction::Update,
    };

    let mut rows = Vec::new();
    for row in data.rows(tme) {
        let (before, after) = row?;
        match action {
            RowAction::Insert => rows.extend(after.map(|r| row_cells(&r)).transpose()?),
            RowAction::Delete => rows.extend(before.map(|r| row_cells(&r)).transpose()?),
            RowAction::Update => {
                rows.push(before.map(|r| row_cells(&r)).transpose()?.unwrap_or_default());
                rows.push(after.map(|r| row_cells(&r)).transpose()?.unwrap_or_default());
            }
        }
    }
    Ok((action, rows))
}

fn row_cells(row: &BinlogRow) -> Result<Vec<CellValue>> {
    (0..row.len())
        .map(|i| match row.as_ref(i) {
            Some(value) => cell_from_binlog(value),
            None => Ok(CellValue::Null),
        })
        .collect()
}

fn cell_from_binlog(value: &BinlogValue<'_>) -> Result<CellValue> {
    match value {
        BinlogValue::Value(value) => Ok(cell_from_value(value)),
        BinlogValue::Jsonb(jsonb) => serde_json::Value::try_from(jsonb.clone())
            .map(CellValue::Json)
            .map_err(|e| CdcError::RowDecode(format!("JSON column: {}", e))),
        BinlogValue::JsonDiff(_) => Err(CdcError::RowDecode(
            "partial JSON update is not supported, set binlog_row_value_options=''".to_string(),
        )),
    }
}

fn cell_from_value(value: &Value) -> CellValue {
    match value {
        Value::NULL => CellValue::Null,
        Value::Bytes(bytes) => match String::from_utf8(bytes.clone()) {
            Ok(s) => CellValue::String(s),
            Err(e) => CellValue::Bytes(e.into_bytes()),
        },
        Value::Int(i) => CellValue::Int(*i),
        Value::UInt(u) => CellValue::UInt(*u),
        Value::Float(f) => CellValue::Float(*f),
        Value::Double(d) => CellValue::Double(*d),
        Value::Date(year, month, day, 0, 0, 0, 0) => {
            CellValue::Date(format!("{:04}-{:02}-{:02}", year, month, day))
        }
        Value::Date(year, month, day, hour, minute, second, micros) => {
            NaiveDate::from_ymd_opt(i32::from(*year), u32::from(*month), u32::from(*day))
                .and_then(|d| {
                    d.and_hms_micro_opt(
                        u32::from(*hour),
                        u32::from(*minute),
                        u32::from(*second),
                        *micros,
                    )
                })
                .map(|dt| CellValue::DateTime(dt.and_utc()))
                .unwrap_or_else(|| {
                    CellValue::String(format!(
                        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                        year, month, day, hour, minute, second
                    ))
                })
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let sign = if *negative { "-" } else { "" };
            let hours = u64::from(*days) * 24 + u64::from(*hours);
            let mut time = format!("{}{:02}:{:02}:{:02}", sign, hours, minutes, seconds);
            if *micros > 0 {
                time.push_str(&format!(".{:06}", micros));
            }
            CellValue::Time(time)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mysql_async::binlog::jsonb;

    #[test]
    fn test_to_sids_skips_empty_sets() {
        let gtid_set = GtidSet::parse(
            "3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5:7,b9b4712a-df64-11e3-b391-60672090eb04:1-3",
        )
        .unwrap();
        assert_eq!(to_sids(&gtid_set).len(), 2);
        assert!(to_sids(&GtidSet::new()).is_empty());

        let widest = GtidSet::parse(&format!(
            "3e11fa47-71ca-11e1-9e33-c80aa9429562:1-{}",
            crate::gtid::MAX_GNO
        ))
        .unwrap();
        assert_eq!(to_sids(&widest).len(), 1);
    }

    #[test]
    fn test_cell_from_value() {
        assert_eq!(cell_from_value(&Value::NULL), CellValue::Null);
        assert_eq!(cell_from_value(&Value::Int(-3)), CellValue::Int(-3));
        assert_eq!(cell_from_value(&Value::UInt(42)).to_string(), "42");
        assert_eq!(
            cell_from_value(&Value::Bytes(b"hello".to_vec())),
            CellValue::String("hello".to_string())
        );
        assert_eq!(
            cell_from_value(&Value::Bytes(vec![0xff, 0xfe])),
            CellValue::Bytes(vec![0xff, 0xfe])
        );
    }

    #[test]
    fn test_cell_from_json_column() {
        let cell = cell_from_binlog(&BinlogValue::Jsonb(jsonb::Value::Bool(true))).unwrap();
        assert_eq!(cell, CellValue::Json(serde_json::Value::Bool(true)));

        let cell = cell_from_binlog(&BinlogValue::Jsonb(jsonb::Value::Null)).unwrap();
        assert_eq!(cell, CellValue::Json(serde_json::Value::Null));
    }

    #[test]
    fn test_partial_json_update_is_rejected() {
        let err = cell_from_binlog(&BinlogValue::JsonDiff(Vec::new())).unwrap_err();
        assert!(matches!(err, CdcError::RowDecode(_)));
    }

    #[test]
    fn test_cell_from_temporal_values() {
        assert_eq!(
            cell_from_value(&Value::Date(2024, 3, 9, 0, 0, 0, 0)),
            CellValue::Date("2024-03-09".to_string())
        );
        assert_eq!(
            cell_from_value(&Value::Date(2024, 3, 9, 13, 5, 7, 0)).to_string(),
            "2024-03-09 13:05:07"
        );
        assert_eq!(
            cell_from_value(&Value::Time(true, 1, 2, 3, 4, 0)),
            CellValue::Time("-26:03:04".to_string())
        );
    }

    #[test]
    fn test_source_validates_table_patterns() {
        let source = MysqlSource::new(
            SourceConfig::default().include_logical_table("orders"),
            CancellationToken::new(),
        );
        assert!(source.is_ok());

        let mut config = SourceConfig::default();
        config.include_tables.push("[".to_string());
        assert!(MysqlSource::new(config, CancellationToken::new()).is_err());
    }
}
