//! 변경 이벤트 디스패처
//!
//! 상태 전이: Idle → Starting → Running → Stopping → Stopped
//!
//! 1. Idle에서 논리 테이블별 핸들러 등록
//! 2. 시작 시 저장된 GTID 위치를 읽어 복제 소스를 열고 스트리밍 시작
//! 3. 단일 소비자 루프가 큐를 FIFO로 비우며 체크포인트 저장 / 핸들러 실행
//! 4. 종료 시 취소 신호 전파, 소스 종료, 마지막 위치 강제 저장

use crate::adapter::ChangeEventAdapter;
use crate::error::{CdcError, Result};
use crate::events::{ChangeEvent, RowAction, SyncMessage};
use crate::gtid::GtidSet;
use crate::lifecycle::Server;
use crate::mysql::MysqlConnector;
use crate::position::{PositionStore, DEFAULT_SAVE_INTERVAL};
use crate::source::{ReplicationSource, SourceConfig, SourceConnector};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// `(record_key, action, raw_table)`를 받는 핸들러
pub type KeyedHandler = Arc<dyn Fn(String, RowAction, String) + Send + Sync>;

/// 컬럼 값까지 포함한 전체 이벤트를 받는 핸들러
pub type DetailedHandler = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Keyed(KeyedHandler),
    Detailed(DetailedHandler),
}

impl Handler {
    fn wants_values(&self) -> bool {
        matches!(self, Handler::Detailed(_))
    }

    fn invoke(&self, event: ChangeEvent) {
        match self {
            Handler::Keyed(f) => f(event.record_key, event.action, event.table),
            Handler::Detailed(f) => f(event),
        }
    }
}

/// 디스패처 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for DispatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 디스패처 설정
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// `.master.info`가 위치할 디렉터리
    pub data_dir: PathBuf,
    /// 큐 용량 (가득 차면 복제 클라이언트가 대기)
    pub queue_capacity: usize,
    /// 동시에 실행되는 핸들러 최대 수
    pub max_in_flight: usize,
    /// 이벤트에 전체 컬럼 값 포함 여부
    pub include_values: bool,
    pub save_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            data_dir: PathBuf::from("."),
            queue_capacity: 8 * 1024,
            max_in_flight: 64,
            include_values: false,
            save_interval: DEFAULT_SAVE_INTERVAL,
        }
    }
}

impl DispatcherConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        DispatcherConfig {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    pub fn with_values(mut self, include_values: bool) -> Self {
        self.include_values = include_values;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(CdcError::Config("queue_capacity must be positive".to_string()));
        }
        if self.max_in_flight == 0 {
            return Err(CdcError::Config("max_in_flight must be positive".to_string()));
        }
        Ok(())
    }
}

/// 샤드 접미사(`_` + 정확히 6자리 숫자)를 제거한 논리 테이블명
///
/// `orders_000042` → `orders`, `orders_1` → `orders_1`
pub fn normalize_table(table: &str) -> &str {
    const SUFFIX_LEN: usize = 7;

    let bytes = table.as_bytes();
    if bytes.len() > SUFFIX_LEN {
        let suffix = &bytes[bytes.len() - SUFFIX_LEN..];
        if suffix[0] == b'_' && suffix[1..].iter().all(u8::is_ascii_digit) {
            return &table[..table.len() - SUFFIX_LEN];
        }
    }
    table
}

const SERVER_NAME: &str = "binlog";

/// binlog 변경 이벤트 디스패처
pub struct Dispatcher {
    config: DispatcherConfig,
    source_config: SourceConfig,
    connector: Arc<dyn SourceConnector>,
    handlers: HashMap<String, Handler>,
    /// 취소 감시 태스크와 공유
    state: Arc<Mutex<DispatcherState>>,
    cancel: CancellationToken,
    position: Option<Arc<PositionStore>>,
    shutdown: Option<JoinHandle<()>>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        source_config: SourceConfig,
        connector: impl SourceConnector + 'static,
    ) -> Self {
        Dispatcher {
            config,
            source_config,
            connector: Arc::new(connector),
            handlers: HashMap::new(),
            state: Arc::new(Mutex::new(DispatcherState::Idle)),
            cancel: CancellationToken::new(),
            position: None,
            shutdown: None,
        }
    }

    /// MySQL binlog 스트림을 소스로 사용하는 디스패처
    pub fn mysql(config: DispatcherConfig, source_config: SourceConfig) -> Self {
        Self::new(config, source_config, MysqlConnector)
    }

    pub fn state(&self) -> DispatcherState {
        *self.state.lock()
    }

    fn set_state(&self, state: DispatcherState) {
        *self.state.lock() = state;
    }

    /// 현재 메모리상의 재시작 위치 (시작 전에는 None)
    pub fn position(&self) -> Option<String> {
        self.position.as_ref().map(|p| p.current())
    }

    /// 논리 테이블 핸들러 등록
    pub fn register<F>(&mut self, table: &str, handler: F) -> Result<()>
    where
        F: Fn(String, RowAction, String) + Send + Sync + 'static,
    {
        self.insert_handler(table, Handler::Keyed(Arc::new(handler)))
    }

    /// 전체 이벤트를 받는 핸들러 등록 (컬럼 값 수집이 활성화됨)
    pub fn register_detailed<F>(&mut self, table: &str, handler: F) -> Result<()>
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        self.insert_handler(table, Handler::Detailed(Arc::new(handler)))
    }

    fn insert_handler(&mut self, table: &str, handler: Handler) -> Result<()> {
        let state = self.state();
        if state != DispatcherState::Idle {
            return Err(CdcError::InvalidState(state.to_string()));
        }
        let table = table.trim();
        if table.is_empty() {
            return Err(CdcError::InvalidHandler("table name is empty".to_string()));
        }
        if self.handlers.insert(table.to_string(), handler).is_some() {
            warn!("Replacing handler for table {}", table);
        }
        Ok(())
    }

    /// 디스패처 시작
    ///
    /// `parent`가 취소되면 `stop`과 같은 종료 절차를 거쳐 Stopped가 됩니다.
    /// 실패 시 생성된 자원을 정리하고 Idle로 돌아갑니다.
    pub async fn start(&mut self, parent: &CancellationToken) -> Result<()> {
        let state = self.state();
        if state != DispatcherState::Idle {
            return Err(CdcError::InvalidState(state.to_string()));
        }
        self.config.validate()?;
        self.set_state(DispatcherState::Starting);

        match self.try_start(parent).await {
            Ok(()) => {
                info!("successfully connected to {}.", SERVER_NAME);
                Ok(())
            }
            Err(e) => {
                error!("failed starting {}: {}", SERVER_NAME, e);
                self.set_state(DispatcherState::Idle);
                Err(e)
            }
        }
    }

    async fn try_start(&mut self, parent: &CancellationToken) -> Result<()> {
        let position = Arc::new(
            PositionStore::load(&self.config.data_dir)?.with_save_interval(self.config.save_interval),
        );
        let resume = GtidSet::parse(&position.current())?;

        let mut source_config = self.source_config.clone();
        source_config.include_tables.clear();
        for table in self.handlers.keys() {
            source_config = source_config.include_logical_table(table);
        }
        source_config.max_reconnect_attempts = None;

        let cancel = parent.child_token();
        let mut source = self.connector.connect(source_config, cancel.clone()).await?;

        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        let include_values =
            self.config.include_values || self.handlers.values().any(Handler::wants_values);
        source.set_event_handler(Arc::new(
            ChangeEventAdapter::new(tx, cancel.clone()).with_values(include_values),
        ));

        let consumer = tokio::spawn(
            ConsumerLoop {
                rx,
                cancel: cancel.clone(),
                position: position.clone(),
                handlers: Arc::new(self.handlers.clone()),
                pool: Arc::new(Semaphore::new(self.config.max_in_flight)),
            }
            .run(),
        );

        let started = if resume.is_empty() {
            info!("No saved position, streaming from the current binlog position");
            source.start_from_current().await
        } else {
            info!("Resuming binlog streaming from GTID set {}", resume);
            source.start_from_gtid(resume).await
        };

        // 시작 실패: 이미 저장된 위치 외에는 아무것도 남기지 않음
        if let Err(e) = started {
            cancel.cancel();
            if let Err(close_err) = source.close().await {
                warn!("Failed to close replication source: {}", close_err);
            }
            let _ = consumer.await;
            return Err(e);
        }

        self.set_state(DispatcherState::Running);
        self.cancel = cancel.clone();
        self.position = Some(position.clone());
        self.shutdown = Some(tokio::spawn(
            Shutdown {
                cancel,
                source,
                consumer,
                position,
                state: self.state.clone(),
            }
            .run(),
        ));
        Ok(())
    }

    /// 디스패처 종료
    ///
    /// 이미 시작된 핸들러 실행은 취소하지 않습니다. 상위 취소로 이미
    /// 종료 중이거나 종료된 경우 그 완료를 기다립니다.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(shutdown) = self.shutdown.take() else {
            return match self.state() {
                DispatcherState::Idle => {
                    self.set_state(DispatcherState::Stopped);
                    Ok(())
                }
                state => Err(CdcError::InvalidState(state.to_string())),
            };
        };

        info!("[{}] server stopping", SERVER_NAME);
        self.cancel.cancel();
        if let Err(e) = shutdown.await {
            error!("Shutdown task terminated abnormally: {}", e);
        }
        self.set_state(DispatcherState::Stopped);
        Ok(())
    }

    pub fn name(&self) -> &str {
        SERVER_NAME
    }
}

#[async_trait]
impl Server for Dispatcher {
    fn name(&self) -> &str {
        Dispatcher::name(self)
    }

    async fn start(&mut self, ctx: &CancellationToken) -> Result<()> {
        Dispatcher::start(self, ctx).await
    }

    async fn stop(&mut self) -> Result<()> {
        Dispatcher::stop(self).await
    }
}

/// 취소 신호를 기다렸다가 Stopping 절차를 수행하는 태스크
///
/// `stop()`과 상위 취소가 같은 경로로 종료됩니다.
struct Shutdown {
    cancel: CancellationToken,
    source: Box<dyn ReplicationSource>,
    consumer: JoinHandle<()>,
    position: Arc<PositionStore>,
    state: Arc<Mutex<DispatcherState>>,
}

impl Shutdown {
    async fn run(mut self) {
        self.cancel.cancelled().await;
        {
            let mut state = self.state.lock();
            if *state == DispatcherState::Running {
                *state = DispatcherState::Stopping;
            }
        }

        if let Err(e) = self.source.close().await {
            warn!("Failed to close replication source: {}", e);
        }
        if let Err(e) = self.consumer.await {
            error!("Consumer loop terminated abnormally: {}", e);
        }
        if let Err(e) = self.position.close() {
            error!("Final position save failed: {}", e);
        }

        *self.state.lock() = DispatcherState::Stopped;
        info!("[{}] server stopped", SERVER_NAME);
    }
}

/// 단일 소비자 루프
struct ConsumerLoop {
    rx: mpsc::Receiver<SyncMessage>,
    cancel: CancellationToken,
    position: Arc<PositionStore>,
    handlers: Arc<HashMap<String, Handler>>,
    pool: Arc<Semaphore>,
}

impl ConsumerLoop {
    async fn run(mut self) {
        debug!("Consumer loop started with {} handlers", self.handlers.len());

        loop {
            let msg = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                msg = self.rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            match msg {
                SyncMessage::Checkpoint(checkpoint) => {
                    if let Err(e) = self.position.save(&checkpoint.gtid_set) {
                        error!("save sync position {} err {}", checkpoint.gtid_set, e);
                    }
                }
                SyncMessage::Row(event) => {
                    if !self.dispatch(event).await {
                        break;
                    }
                }
            }
        }

        debug!("Consumer loop exited");
    }

    /// 핸들러 실행 예약. 취소로 중단되면 false
    async fn dispatch(&self, event: ChangeEvent) -> bool {
        let Some(handler) = self.handlers.get(normalize_table(&event.table)).cloned() else {
            trace!("No handler for table {}, dropping event", event.table);
            return true;
        };

        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return false,
            permit = self.pool.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return false,
            },
        };

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let table = event.table.clone();
            let key = event.record_key.clone();
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| handler.invoke(event))) {
                error!(
                    "Handler for {} panicked on record {}: {}",
                    table,
                    key,
                    panic_message(&*panic)
                );
            }
        });
        true
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}
