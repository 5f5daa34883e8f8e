//! 테이블별 발행 핸들러
//!
//! 발행은 비동기로 끝나며 결과는 `PublishCompletion` 으로 돌아옵니다.
//! 디스패처는 완료를 기다리지 않고 커밋 파이프라인에 넘깁니다.

use crate::error::{CdcError, Result};
use crate::events::{ChangeRecord, SchemaAndTable};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// 레코드 하나의 발행 결과 신호
pub struct PublishCompletion {
    inner: CompletionInner,
}

enum CompletionInner {
    Ready(std::result::Result<(), String>),
    Pending(oneshot::Receiver<std::result::Result<(), String>>),
}

impl PublishCompletion {
    pub fn completed() -> Self {
        PublishCompletion {
            inner: CompletionInner::Ready(Ok(())),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        PublishCompletion {
            inner: CompletionInner::Ready(Err(message.into())),
        }
    }

    /// 나중에 완료될 신호와 이를 완료시키는 쪽
    pub fn pending() -> (PublishCompleter, PublishCompletion) {
        let (tx, rx) = oneshot::channel();
        (
            PublishCompleter { tx },
            PublishCompletion {
                inner: CompletionInner::Pending(rx),
            },
        )
    }

    /// 완료 대기. completer 가 완료 없이 drop 되면 실패로 간주
    pub async fn wait(self) -> Result<()> {
        let outcome = match self.inner {
            CompletionInner::Ready(outcome) => outcome,
            CompletionInner::Pending(rx) => rx
                .await
                .unwrap_or_else(|_| Err("publisher dropped the completion".to_string())),
        };
        outcome.map_err(CdcError::PublishFailed)
    }
}

pub struct PublishCompleter {
    tx: oneshot::Sender<std::result::Result<(), String>>,
}

impl PublishCompleter {
    pub fn complete(self) {
        let _ = self.tx.send(Ok(()));
    }

    pub fn fail(self, message: impl Into<String>) {
        let _ = self.tx.send(Err(message.into()));
    }
}

/// 레코드를 외부 브로커로 보내는 쪽
///
/// 동기 에러는 발행 자체를 시작하지 못한 경우만 돌려주고,
/// 비동기 실패는 completion 으로 알립니다.
pub trait BinlogEntryPublisher: Send + Sync {
    fn publish(&self, record: &ChangeRecord) -> Result<PublishCompletion>;
}

#[derive(Clone)]
pub struct BinlogEntryHandler {
    pub table: SchemaAndTable,
    pub publisher: Arc<dyn BinlogEntryPublisher>,
}

impl BinlogEntryHandler {
    pub fn new(table: SchemaAndTable, publisher: Arc<dyn BinlogEntryPublisher>) -> Self {
        BinlogEntryHandler { table, publisher }
    }

    pub fn is_for(&self, table: &SchemaAndTable) -> bool {
        &self.table == table
    }

    pub fn publish(&self, record: &ChangeRecord) -> Result<PublishCompletion> {
        self.publisher.publish(record)
    }
}

/// 등록 순서를 유지하는 핸들러 목록
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Vec<BinlogEntryHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, handler: BinlogEntryHandler) {
        self.handlers.push(handler);
    }

    pub fn handlers_for<'a>(
        &'a self,
        table: &'a SchemaAndTable,
    ) -> impl Iterator<Item = &'a BinlogEntryHandler> + 'a {
        self.handlers.iter().filter(move |h| h.is_for(table))
    }

    pub fn tables(&self) -> Vec<SchemaAndTable> {
        let mut tables: Vec<SchemaAndTable> = self.handlers.iter().map(|h| h.table.clone()).collect();
        tables.sort();
        tables.dedup();
        tables
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// 채널로 넘어가는 발행 요청
pub struct PublishRequest {
    pub record: ChangeRecord,
    pub completer: PublishCompleter,
}

/// 발행 요청을 tokio 채널로 넘기는 publisher
///
/// 수신 쪽 태스크가 브로커 전송 후 `completer` 를 완료시킵니다.
#[derive(Clone)]
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<PublishRequest>,
}

impl ChannelPublisher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PublishRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelPublisher { tx }, rx)
    }
}

impl BinlogEntryPublisher for ChannelPublisher {
    fn publish(&self, record: &ChangeRecord) -> Result<PublishCompletion> {
        let (completer, completion) = PublishCompletion::pending();
        self.tx
            .send(PublishRequest {
                record: record.clone(),
                completer,
            })
            .map_err(|_| CdcError::ChannelClosed)?;
        Ok(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::change_record;

    #[tokio::test]
    async fn test_pending_completion() {
        let (completer, completion) = PublishCompletion::pending();
        completer.complete();
        assert!(completion.wait().await.is_ok());

        let (completer, completion) = PublishCompletion::pending();
        completer.fail("broker down");
        assert!(matches!(completion.wait().await, Err(CdcError::PublishFailed(m)) if m == "broker down"));
    }

    #[tokio::test]
    async fn test_dropped_completer_is_failure() {
        let (completer, completion) = PublishCompletion::pending();
        drop(completer);
        assert!(completion.wait().await.is_err());
    }

    #[tokio::test]
    async fn test_channel_publisher() {
        let (publisher, mut rx) = ChannelPublisher::new();
        let record = change_record("eventuate", "message", 1);

        let completion = publisher.publish(&record).unwrap();
        let request = rx.recv().await.unwrap();
        assert_eq!(request.record.table, record.table);
        request.completer.complete();
        assert!(completion.wait().await.is_ok());

        drop(rx);
        assert!(matches!(publisher.publish(&record), Err(CdcError::ChannelClosed)));
    }

    #[test]
    fn test_registry_order_and_filter() {
        let (publisher, _rx) = ChannelPublisher::new();
        let publisher: Arc<dyn BinlogEntryPublisher> = Arc::new(publisher);
        let message = SchemaAndTable::new("eventuate", "message");
        let events = SchemaAndTable::new("eventuate", "events");

        let mut registry = HandlerRegistry::new();
        registry.add(BinlogEntryHandler::new(message.clone(), publisher.clone()));
        registry.add(BinlogEntryHandler::new(events.clone(), publisher.clone()));
        registry.add(BinlogEntryHandler::new(message.clone(), publisher));

        assert_eq!(registry.handlers_for(&message).count(), 2);
        assert_eq!(registry.handlers_for(&events).count(), 1);
        assert_eq!(registry.handlers_for(&SchemaAndTable::new("x", "y")).count(), 0);
        assert_eq!(registry.tables(), vec![events, message]);
    }
}
