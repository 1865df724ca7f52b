//! 可注入故障的 CheckpointStore 包装，用于测试持久化重试和冲突处理

use crate::checkpoint::{Checkpoint, CheckpointPatch, CheckpointSnapshot, CheckpointStore, LATEST};
use crate::error::{Result, StoreError};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// 在前 N 次 `create` 上注入错误，其余操作原样转发
///
/// 先消耗冲突计数，再消耗 IO 失败计数。
pub struct FlakyCheckpointStore {
    inner: Arc<dyn CheckpointStore>,
    conflicts: AtomicU32,
    failures: AtomicU32,
    create_calls: AtomicUsize,
}

impl FlakyCheckpointStore {
    pub fn new(inner: Arc<dyn CheckpointStore>) -> Self {
        Self {
            inner,
            conflicts: AtomicU32::new(0),
            failures: AtomicU32::new(0),
            create_calls: AtomicUsize::new(0),
        }
    }

    /// 接下来 n 次 `create` 返回编号冲突
    pub fn conflict_next(self, n: u32) -> Self {
        self.conflicts.store(n, Ordering::SeqCst);
        self
    }

    /// 接下来 n 次 `create` 返回 IO 错误
    pub fn fail_next(self, n: u32) -> Self {
        self.failures.store(n, Ordering::SeqCst);
        self
    }

    /// 包括失败在内的 `create` 调用次数
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl CheckpointStore for FlakyCheckpointStore {
    async fn create(&self, bot_id: u64, snapshot: CheckpointSnapshot) -> Result<u64> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take(&self.conflicts) {
            let taken = match self.inner.get(bot_id, LATEST).await {
                Ok(cp) => cp.checkpoint_number + 1,
                Err(_) => 1,
            };
            return Err(StoreError::Conflict {
                bot_id,
                checkpoint_number: taken,
            }
            .into());
        }
        if Self::take(&self.failures) {
            return Err(StoreError::IoError("injected write failure".to_string()).into());
        }
        self.inner.create(bot_id, snapshot).await
    }

    async fn get(&self, bot_id: u64, checkpoint_number: u64) -> Result<Checkpoint> {
        self.inner.get(bot_id, checkpoint_number).await
    }

    async fn list(&self, bot_id: u64) -> Result<Vec<Checkpoint>> {
        self.inner.list(bot_id).await
    }

    async fn patch_metadata(
        &self,
        bot_id: u64,
        checkpoint_number: u64,
        patch: CheckpointPatch,
    ) -> Result<Checkpoint> {
        self.inner
            .patch_metadata(bot_id, checkpoint_number, patch)
            .await
    }

    async fn delete(&self, bot_id: u64, checkpoint_number: u64) -> Result<()> {
        self.inner.delete(bot_id, checkpoint_number).await
    }
}
