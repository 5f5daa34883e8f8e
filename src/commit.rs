//! 순서 보장 오프셋 커밋 파이프라인
//!
//! 레코드는 binlog 순서대로 제출되지만 발행 완료는 임의 순서로 도착합니다.
//! 앞에서부터 연속으로 완료된 구간만 큐에서 빼고, 그 구간의 마지막 위치만
//! 저장소에 기록합니다. 완료되지 않은 레코드를 넘어서는 위치는 절대 저장되지 않습니다.

use crate::error::CdcError;
use crate::handler::PublishCompletion;
use crate::metrics::CdcMetrics;
use crate::offset::{BinlogPosition, OffsetStore};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error};

/// 치명적 에러 통지 (재시작 트리거)
pub type FailureHandler = Arc<dyn Fn(CdcError) + Send + Sync>;

/// 발행 완료를 기다리는 레코드 하나
pub struct PendingCommit {
    pub position: BinlogPosition,
    pub completions: Vec<PublishCompletion>,
    pub dispatched_at: Instant,
}

impl PendingCommit {
    pub fn new(position: BinlogPosition, completions: Vec<PublishCompletion>) -> Self {
        PendingCommit {
            position,
            completions,
            dispatched_at: Instant::now(),
        }
    }

    /// 핸들러가 없거나 건너뛴 레코드. 바로 완료된 것으로 처리
    pub fn resolved(position: BinlogPosition) -> Self {
        Self::new(position, Vec::new())
    }
}

struct Slot {
    position: BinlogPosition,
    resolved: bool,
}

#[derive(Default)]
struct CommitState {
    slots: VecDeque<Slot>,
    head_seq: u64,
    next_seq: u64,
    watermark: Option<BinlogPosition>,
    persisted: Option<BinlogPosition>,
}

struct Inner {
    state: Mutex<CommitState>,
    persist_gate: tokio::sync::Mutex<()>,
    store: Arc<dyn OffsetStore>,
    on_failure: FailureHandler,
    metrics: CdcMetrics,
}

#[derive(Clone)]
pub struct OffsetCommitPipeline {
    inner: Arc<Inner>,
}

impl OffsetCommitPipeline {
    pub fn new(store: Arc<dyn OffsetStore>, metrics: CdcMetrics, on_failure: FailureHandler) -> Self {
        OffsetCommitPipeline {
            inner: Arc::new(Inner {
                state: Mutex::new(CommitState::default()),
                persist_gate: tokio::sync::Mutex::new(()),
                store,
                on_failure,
                metrics,
            }),
        }
    }

    /// 디스패처 한 곳에서 binlog 순서대로 호출
    pub fn submit(&self, commit: PendingCommit) {
        let seq = {
            let mut state = self.inner.state.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.slots.push_back(Slot {
                position: commit.position,
                resolved: false,
            });
            self.inner.metrics.set_unresolved(state.slots.len());
            seq
        };

        if commit.completions.is_empty() {
            self.resolve(seq);
            return;
        }

        let pipeline = self.clone();
        let completions = commit.completions;
        let dispatched_at = commit.dispatched_at;
        tokio::spawn(async move {
            for completion in completions {
                if let Err(e) = completion.wait().await {
                    error!("Publish failed, offset will not advance past record #{}: {}", seq, e);
                    (pipeline.inner.on_failure)(e);
                    return;
                }
            }
            pipeline.inner.metrics.observe_publishing(dispatched_at.elapsed());
            pipeline.resolve(seq);
        });
    }

    fn resolve(&self, seq: u64) {
        let advanced = {
            let mut state = self.inner.state.lock();
            let Some(idx) = seq.checked_sub(state.head_seq) else {
                return;
            };
            if let Some(slot) = state.slots.get_mut(idx as usize) {
                slot.resolved = true;
            }

            let mut last = None;
            while state.slots.front().is_some_and(|slot| slot.resolved) {
                if let Some(slot) = state.slots.pop_front() {
                    state.head_seq += 1;
                    last = Some(slot.position);
                }
            }
            self.inner.metrics.set_unresolved(state.slots.len());

            match last {
                Some(position) if state.watermark.as_ref().map_or(true, |w| position > *w) => {
                    state.watermark = Some(position);
                    true
                }
                _ => false,
            }
        };

        if advanced {
            let pipeline = self.clone();
            tokio::spawn(async move { pipeline.persist_latest().await });
        }
    }

    /// 저장은 한 번에 하나만. 진행 중에 올라간 워터마크는 끝난 뒤 한 번에 반영
    async fn persist_latest(&self) {
        loop {
            let Ok(gate) = self.inner.persist_gate.try_lock() else {
                return;
            };

            let target = {
                let state = self.inner.state.lock();
                match (&state.watermark, &state.persisted) {
                    (Some(w), Some(p)) if w <= p => return,
                    (Some(w), _) => w.clone(),
                    (None, _) => return,
                }
            };

            if let Err(e) = self.inner.store.save_position(&target).await {
                error!("Failed to persist binlog offset {}: {}", target, e);
                (self.inner.on_failure)(e);
                return;
            }
            debug!("Committed binlog offset {}", target);
            self.inner.state.lock().persisted = Some(target.clone());
            drop(gate);

            let raised = self
                .inner
                .state
                .lock()
                .watermark
                .as_ref()
                .is_some_and(|w| *w > target);
            if !raised {
                return;
            }
        }
    }

    pub fn unresolved_count(&self) -> usize {
        self.inner.state.lock().slots.len()
    }

    /// 메모리상 안전 위치 (아직 저장되지 않았을 수 있음)
    pub fn watermark(&self) -> Option<BinlogPosition> {
        self.inner.state.lock().watermark.clone()
    }

    pub fn persisted(&self) -> Option<BinlogPosition> {
        self.inner.state.lock().persisted.clone()
    }
}
