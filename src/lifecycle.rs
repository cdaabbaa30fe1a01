//! 호스트 프로세스가 사용하는 공통 서버 수명주기

use crate::error::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait Server: Send {
    fn name(&self) -> &str;

    /// `ctx`가 취소되면 서버도 멈춰야 합니다.
    async fn start(&mut self, ctx: &CancellationToken) -> Result<()>;

    async fn stop(&mut self) -> Result<()>;
}
