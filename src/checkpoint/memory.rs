use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{Checkpoint, CheckpointBook, CheckpointPatch, CheckpointSnapshot, CheckpointStore};
use crate::error::Result;

/// 进程内存 CheckpointStore，重启后状态丢失，适合测试
pub struct InMemoryCheckpointStore {
    book: RwLock<CheckpointBook>,
}

impl Default for InMemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self {
            book: RwLock::new(CheckpointBook::default()),
        }
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn create(&self, bot_id: u64, snapshot: CheckpointSnapshot) -> Result<u64> {
        let number = self.book.write().await.insert(bot_id, snapshot)?;
        debug!(bot_id, checkpoint_number = number, "Checkpoint 已写入内存");
        Ok(number)
    }

    async fn get(&self, bot_id: u64, checkpoint_number: u64) -> Result<Checkpoint> {
        self.book.read().await.get(bot_id, checkpoint_number)
    }

    async fn list(&self, bot_id: u64) -> Result<Vec<Checkpoint>> {
        Ok(self.book.read().await.list(bot_id))
    }

    async fn patch_metadata(
        &self,
        bot_id: u64,
        checkpoint_number: u64,
        patch: CheckpointPatch,
    ) -> Result<Checkpoint> {
        self.book
            .write()
            .await
            .patch(bot_id, checkpoint_number, patch)
    }

    async fn delete(&self, bot_id: u64, checkpoint_number: u64) -> Result<()> {
        self.book.write().await.remove(bot_id, checkpoint_number)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Turn;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_concurrent_creates_are_gap_free() -> Result<()> {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .create(
                        7,
                        CheckpointSnapshot::from_turns(vec![Turn::user(format!("m{i}"))]),
                    )
                    .await
            }));
        }
        let mut numbers = Vec::new();
        for h in handles {
            numbers.push(h.await.expect("task panicked")?);
        }
        numbers.sort_unstable();
        assert_eq!(numbers, (1..=32).collect::<Vec<u64>>());
        Ok(())
    }

    #[tokio::test]
    async fn test_round_trip_history() -> Result<()> {
        let store = InMemoryCheckpointStore::new();
        let turns = vec![Turn::user("hello"), Turn::assistant("hi there")];
        let number = store
            .create(1, CheckpointSnapshot::from_turns(turns.clone()))
            .await?;
        assert_eq!(store.get(1, number).await?.history()?, turns);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_keeps_other_numbers() -> Result<()> {
        let store = InMemoryCheckpointStore::new();
        for _ in 0..3 {
            store.create(2, CheckpointSnapshot::default()).await?;
        }
        store.delete(2, 2).await?;
        let numbers: Vec<u64> = store
            .list(2)
            .await?
            .iter()
            .map(|c| c.checkpoint_number)
            .collect();
        assert_eq!(numbers, vec![1, 3]);
        assert!(store.delete(2, 2).await.is_err());
        Ok(())
    }
}
