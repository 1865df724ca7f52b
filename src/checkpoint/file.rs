use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Checkpoint, CheckpointBook, CheckpointPatch, CheckpointSnapshot, CheckpointStore};
use crate::config::expand_tilde;
use crate::error::{BotError, Result, StoreError};

/// 基于 JSON 文件的持久化 CheckpointStore
///
/// 读操作直接走内存副本。写操作在后台任务里持锁，先修改副本并落盘，
/// 落盘成功后才替换内存；调用方中途放弃等待时，任务仍会完整执行，
/// 内存和磁盘始终一致。落盘先写 `<path>.tmp` 并 fsync，再 rename 覆盖正式文件。
///
/// 存储格式：
/// ```json
/// {
///   "bots": {
///     "7": { "last_number": 2, "checkpoints": { "1": { ... }, "2": { ... } } }
///   }
/// }
/// ```
pub struct FileCheckpointStore {
    path: PathBuf,
    book: Arc<Mutex<CheckpointBook>>,
}

impl FileCheckpointStore {
    /// 打开或创建存储文件，自动建父目录
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = expand_tilde(path.as_ref());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::IoError(format!("创建目录失败: {e}")))?;
        }
        let book: CheckpointBook = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| StoreError::IoError(format!("读取 checkpoint 文件失败: {e}")))?;
            if raw.trim().is_empty() {
                CheckpointBook::default()
            } else {
                serde_json::from_str(&raw).map_err(|e| {
                    StoreError::SerializationError(format!(
                        "checkpoint 文件 {} 无法解析: {e}",
                        path.display()
                    ))
                })?
            }
        } else {
            CheckpointBook::default()
        };
        info!(path = %path.display(), bots = book.bots.len(), "🗂️ FileCheckpointStore 初始化");
        Ok(Self {
            path,
            book: Arc::new(Mutex::new(book)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 在副本上执行 `change`，落盘成功后替换内存中的账本
    async fn commit<T, F>(&self, change: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut CheckpointBook) -> Result<T> + Send + 'static,
    {
        let book = Arc::clone(&self.book);
        let path = self.path.clone();
        tokio::spawn(async move {
            let mut current = book.lock_owned().await;
            let mut next = current.clone();
            let value = change(&mut next)?;
            let json = serde_json::to_string_pretty(&next)
                .map_err(|e| StoreError::SerializationError(e.to_string()))?;
            write_atomic(path, json).await?;
            *current = next;
            Ok::<T, BotError>(value)
        })
        .await
        .map_err(|e| StoreError::IoError(format!("checkpoint 写入任务异常退出: {e}")))?
    }
}

async fn write_atomic(path: PathBuf, json: String) -> Result<()> {
    let target = path.clone();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let tmp = path.with_extension("json.tmp");
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, &path)
    })
    .await
    .map_err(|e| StoreError::IoError(format!("写入 checkpoint 文件失败: {e}")))?
    .map_err(|e| StoreError::IoError(format!("写入 checkpoint 文件失败: {e}")))?;
    debug!(path = %target.display(), "💾 Checkpoint 已持久化");
    Ok(())
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn create(&self, bot_id: u64, snapshot: CheckpointSnapshot) -> Result<u64> {
        match self.commit(move |book| book.insert(bot_id, snapshot)).await {
            Ok(number) => {
                info!(bot_id, checkpoint_number = number, "🔖 保存 Checkpoint");
                Ok(number)
            }
            Err(e) => {
                warn!(bot_id, error = %e, "checkpoint 未能落盘");
                Err(e)
            }
        }
    }

    async fn get(&self, bot_id: u64, checkpoint_number: u64) -> Result<Checkpoint> {
        self.book.lock().await.get(bot_id, checkpoint_number)
    }

    async fn list(&self, bot_id: u64) -> Result<Vec<Checkpoint>> {
        Ok(self.book.lock().await.list(bot_id))
    }

    async fn patch_metadata(
        &self,
        bot_id: u64,
        checkpoint_number: u64,
        patch: CheckpointPatch,
    ) -> Result<Checkpoint> {
        self.commit(move |book| book.patch(bot_id, checkpoint_number, patch))
            .await
    }

    async fn delete(&self, bot_id: u64, checkpoint_number: u64) -> Result<()> {
        self.commit(move |book| book.remove(bot_id, checkpoint_number))
            .await?;
        info!(bot_id, checkpoint_number, "🗑️ Checkpoint 已删除");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Turn;
    use futures::FutureExt;
    use std::time::Duration;

    #[tokio::test]
    async fn test_reopen_preserves_numbers_and_history() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("checkpoints.json");
        let turns = vec![Turn::user("hello"), Turn::assistant("hi")];
        {
            let store = FileCheckpointStore::new(&path)?;
            store
                .create(7, CheckpointSnapshot::from_turns(turns.clone()))
                .await?;
            store.create(7, CheckpointSnapshot::default()).await?;
            store.delete(7, 2).await?;
        }

        let reopened = FileCheckpointStore::new(&path)?;
        assert_eq!(reopened.get(7, 0).await?.history()?, turns);
        // 已删除的 2 号不会被复用
        assert_eq!(reopened.create(7, CheckpointSnapshot::default()).await?, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_patch_is_durable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("checkpoints.json");
        let store = FileCheckpointStore::new(&path)?;
        store.create(1, CheckpointSnapshot::default()).await?;
        store
            .patch_metadata(
                1,
                0,
                CheckpointPatch {
                    name: Some("renamed".to_string()),
                    description: None,
                },
            )
            .await?;
        drop(store);

        let reopened = FileCheckpointStore::new(&path)?;
        assert_eq!(reopened.get(1, 1).await?.name, "renamed");
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_file_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("checkpoints.json");
        std::fs::write(&path, "{ not json")?;
        assert!(FileCheckpointStore::new(&path).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_abandoned_create_keeps_memory_and_disk_in_step() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("checkpoints.json");
        let store = FileCheckpointStore::new(&path)?;
        let turns = vec![Turn::user("你好"), Turn::assistant("在")];

        // 只 poll 一次就丢弃，写入任务已经派出
        let pending = store.create(7, CheckpointSnapshot::from_turns(turns.clone()));
        assert!(pending.now_or_never().is_none());

        for _ in 0..200 {
            if !store.list(7).await?.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let in_memory = store.get(7, 0).await?;
        let reopened = FileCheckpointStore::new(&path)?.get(7, 0).await?;
        assert_eq!(in_memory, reopened);
        assert_eq!(reopened.history()?, turns);
        assert_eq!(store.create(7, CheckpointSnapshot::default()).await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_write_leaves_memory_untouched() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("checkpoints.json");
        let store = FileCheckpointStore::new(&path)?;
        store.create(7, CheckpointSnapshot::default()).await?;

        // 临时文件的位置被目录占住，rename 前就会失败
        std::fs::create_dir(path.with_extension("json.tmp"))?;
        assert!(store.create(7, CheckpointSnapshot::default()).await.is_err());
        assert!(store.delete(7, 1).await.is_err());

        assert_eq!(store.list(7).await?.len(), 1);
        std::fs::remove_dir(path.with_extension("json.tmp"))?;
        assert_eq!(store.create(7, CheckpointSnapshot::default()).await?, 2);
        Ok(())
    }
}
