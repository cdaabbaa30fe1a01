//! 복제 콜백 → 디스패치 큐 어댑터
//!
//! 행 변경과 위치 확정을 하나의 FIFO 큐에 넣으므로, 소비자가 보는
//! 체크포인트는 그 이전의 모든 행 이벤트보다 항상 뒤에 있습니다.

use crate::error::{CdcError, Result};
use crate::events::{ChangeEvent, Checkpoint, RowsEvent, SyncMessage};
use crate::gtid::GtidSet;
use crate::source::ReplicationEventHandler;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub struct ChangeEventAdapter {
    tx: mpsc::Sender<SyncMessage>,
    cancel: CancellationToken,
    include_values: bool,
}

impl ChangeEventAdapter {
    pub fn new(tx: mpsc::Sender<SyncMessage>, cancel: CancellationToken) -> Self {
        ChangeEventAdapter {
            tx,
            cancel,
            include_values: false,
        }
    }

    pub fn with_values(mut self, include_values: bool) -> Self {
        self.include_values = include_values;
        self
    }

    /// 큐에 메시지 추가 (가득 차면 대기)
    async fn push(&self, msg: SyncMessage) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(CdcError::Cancelled);
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CdcError::Cancelled),
            sent = self.tx.send(msg) => sent.map_err(|_| CdcError::ChannelClosed),
        }
    }

    fn to_change_events(&self, event: &RowsEvent) -> Vec<ChangeEvent> {
        event
            .images()
            .map(|row| {
                let record_key = row.first().map(|v| v.to_string()).unwrap_or_default();

                let values = self.include_values.then(|| {
                    event
                        .columns
                        .iter()
                        .zip(row.iter())
                        .map(|(name, value)| (name.clone(), value.clone()))
                        .collect::<HashMap<_, _>>()
                });

                ChangeEvent {
                    table: event.table.clone(),
                    schema: event.schema.clone(),
                    action: event.action,
                    record_key,
                    values,
                    timestamp: event.timestamp,
                }
            })
            .collect()
    }
}

#[async_trait]
impl ReplicationEventHandler for ChangeEventAdapter {
    async fn on_row(&self, event: RowsEvent) -> Result<()> {
        for change in self.to_change_events(&event) {
            trace!(
                "Queue {} {}.{} key={}",
                change.action,
                change.schema,
                change.table,
                change.record_key
            );
            self.push(SyncMessage::Row(change)).await?;
        }
        Ok(())
    }

    async fn on_pos_synced(&self, gtid_set: &GtidSet) -> Result<()> {
        self.push(SyncMessage::Checkpoint(Checkpoint {
            gtid_set: gtid_set.to_string(),
        }))
        .await
    }

    async fn on_rotate(&self, next_binlog: &str) -> Result<()> {
        debug!("Binlog rotated to {}", next_binlog);
        Ok(())
    }

    async fn on_ddl(&self, schema: &str, query: &str) -> Result<()> {
        debug!("DDL on {}: {}", schema, query);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CellValue, RowAction};
    use chrono::Utc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn rows_event(action: RowAction, rows: Vec<Vec<CellValue>>) -> RowsEvent {
        RowsEvent {
            schema: "shop".to_string(),
            table: "orders_000007".to_string(),
            columns: vec!["id".to_string(), "status".to_string()],
            action,
            rows,
            timestamp: Utc::now(),
        }
    }

    fn insert(id: i64) -> RowsEvent {
        rows_event(
            RowAction::Insert,
            vec![vec![CellValue::Int(id), CellValue::String("new".into())]],
        )
    }

    #[tokio::test]
    async fn test_update_emits_post_image_only() {
        let (tx, mut rx) = mpsc::channel(16);
        let adapter = ChangeEventAdapter::new(tx, CancellationToken::new()).with_values(true);

        let event = rows_event(
            RowAction::Update,
            vec![
                vec![CellValue::Int(41), CellValue::String("new".into())],
                vec![CellValue::Int(42), CellValue::String("paid".into())],
            ],
        );
        adapter.on_row(event).await.unwrap();
        drop(adapter);

        let Some(SyncMessage::Row(change)) = rx.recv().await else {
            panic!("expected a row message");
        };
        assert_eq!(change.action, RowAction::Update);
        assert_eq!(change.record_key, "42");
        let values = change.values.unwrap();
        assert_eq!(values["status"], CellValue::String("paid".into()));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_values_omitted_by_default() {
        let (tx, mut rx) = mpsc::channel(16);
        let adapter = ChangeEventAdapter::new(tx, CancellationToken::new());

        adapter.on_row(insert(1)).await.unwrap();

        let Some(SyncMessage::Row(change)) = rx.recv().await else {
            panic!("expected a row message");
        };
        assert_eq!(change.record_key, "1");
        assert!(change.values.is_none());
    }

    #[tokio::test]
    async fn test_rows_and_checkpoints_share_one_queue() {
        let (tx, mut rx) = mpsc::channel(16);
        let adapter = ChangeEventAdapter::new(tx, CancellationToken::new());

        adapter.on_row(insert(1)).await.unwrap();
        adapter.on_pos_synced(&GtidSet::new()).await.unwrap();
        adapter.on_row(insert(2)).await.unwrap();

        assert!(matches!(rx.recv().await, Some(SyncMessage::Row(c)) if c.record_key == "1"));
        assert!(matches!(rx.recv().await, Some(SyncMessage::Checkpoint(_))));
        assert!(matches!(rx.recv().await, Some(SyncMessage::Row(c)) if c.record_key == "2"));
    }

    #[tokio::test]
    async fn test_push_blocks_when_queue_full() {
        const CAPACITY: usize = 4;
        let (tx, mut rx) = mpsc::channel(CAPACITY);
        let adapter = ChangeEventAdapter::new(tx, CancellationToken::new());

        for id in 0..CAPACITY as i64 {
            adapter.on_row(insert(id)).await.unwrap();
        }

        let blocked = timeout(Duration::from_millis(50), adapter.on_row(insert(99))).await;
        assert!(blocked.is_err(), "push past capacity should block");

        let pending = adapter.on_row(insert(100));
        tokio::pin!(pending);
        assert!(timeout(Duration::from_millis(20), &mut pending).await.is_err());

        rx.recv().await.unwrap();
        timeout(Duration::from_secs(1), &mut pending)
            .await
            .expect("push should complete after a slot frees")
            .unwrap();
    }

    #[tokio::test]
    async fn test_push_fails_fast_after_cancel() {
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let adapter = ChangeEventAdapter::new(tx, cancel.clone());

        cancel.cancel();
        assert!(matches!(
            adapter.on_row(insert(1)).await,
            Err(CdcError::Cancelled)
        ));
        assert!(matches!(
            adapter.on_pos_synced(&GtidSet::new()).await,
            Err(CdcError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_cancel_unblocks_pending_push() {
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let adapter = ChangeEventAdapter::new(tx, cancel.clone());

        adapter.on_row(insert(1)).await.unwrap();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = timeout(Duration::from_secs(1), adapter.on_row(insert(2)))
            .await
            .expect("cancel should unblock the push");
        assert!(matches!(result, Err(CdcError::Cancelled)));
    }
}
