//! MySQL Binlog 기반 테이블 변경 디스패처
//!
//! GTID 복제 스트림을 구독해 행 변경을 테이블별 콜백으로 전달합니다.
//! 주요 기능:
//! - 샤드 테이블(`name_NNNNNN`)을 논리 테이블로 정규화
//! - 제한된 큐와 동시 실행 한도로 백프레셔 적용
//! - GTID 위치를 파일에 저장하고 재시작 시 이어서 구독

pub mod adapter;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod gtid;
pub mod lifecycle;
pub mod mysql;
pub mod position;
pub mod source;

pub use adapter::ChangeEventAdapter;
pub use connection::{ConnectionConfig, MySqlConnection};
pub use dispatcher::{normalize_table, Dispatcher, DispatcherConfig, DispatcherState};
pub use error::{CdcError, Result};
pub use events::{CellValue, ChangeEvent, RowAction, RowsEvent};
pub use gtid::GtidSet;
pub use lifecycle::Server;
pub use mysql::MysqlConnector;
pub use position::PositionStore;
pub use source::{ReplicationEventHandler, ReplicationSource, SourceConfig, SourceConnector};
