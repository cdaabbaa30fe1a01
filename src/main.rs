/// 테이블 변경 디스패처 실행 예제
///
/// 등록한 테이블의 변경을 로그로 출력합니다.
use binlog_sync::connection::ConnectionConfig;
use binlog_sync::dispatcher::{Dispatcher, DispatcherConfig};
use binlog_sync::lifecycle::Server;
use binlog_sync::source::SourceConfig;
use std::env;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 초기화
    tracing_subscriber::fmt::init();

    // 연결 설정
    let connection = ConnectionConfig {
        hostname: env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("DB_PORT")
            .unwrap_or_else(|_| "3306".to_string())
            .parse()
            .unwrap_or(3306),
        username: env::var("DB_USER").unwrap_or_else(|_| "testuser".to_string()),
        password: env::var("DB_PASSWORD").unwrap_or_else(|_| "testpass".to_string()),
        database: env::var("DB_NAME").ok(),
        ..Default::default()
    };

    let mut config = DispatcherConfig::new(env::var("DATA_DIR").unwrap_or_else(|_| ".".to_string()));
    if let Some(capacity) = env::var("QUEUE_CAPACITY").ok().and_then(|v| v.parse().ok()) {
        config = config.with_queue_capacity(capacity);
    }

    info!(
        "Connecting to {}:{}",
        connection.hostname, connection.port
    );

    let mut dispatcher = Dispatcher::mysql(config, SourceConfig::new(connection));

    let tables = env::var("TABLES").unwrap_or_else(|_| "orders".to_string());
    for table in tables.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        dispatcher.register(table, |key, action, table| {
            info!("{} {} key={}", table, action, key);
        })?;
    }

    let ctx = CancellationToken::new();
    Server::start(&mut dispatcher, &ctx).await?;
    info!("{} started at {:?}", dispatcher.name(), dispatcher.position());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    Server::stop(&mut dispatcher).await?;
    info!("Stopped at {:?}", dispatcher.position());
    Ok(())
}
