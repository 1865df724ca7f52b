use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

use super::{LiveSession, ResumeFrom, Turn};
use crate::checkpoint::{CheckpointStore, LATEST};
use crate::error::{BotError, Result, StoreError};

type Slot = Arc<Mutex<Option<LiveSession>>>;

/// 进程内的 bot → slot 映射
///
/// 两级锁：外层 `RwLock` 只在查找/创建 slot 时短暂持有，
/// 每个 slot 自带一把 `Mutex` 保护该 bot 的 [`LiveSession`]。
/// slot 一旦创建就不会被删除，会话结束只是把里面的 `LiveSession` 取走。
pub struct SessionCache {
    slots: RwLock<HashMap<u64, Slot>>,
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionCache {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }

    async fn slot(&self, bot_id: u64) -> Slot {
        if let Some(slot) = self.slots.read().await.get(&bot_id) {
            return slot.clone();
        }
        self.slots
            .write()
            .await
            .entry(bot_id)
            .or_insert_with(|| {
                debug!(bot_id, "创建 session slot");
                Arc::new(Mutex::new(None))
            })
            .clone()
    }

    /// 获取某个 bot 的 slot，持有期间其他调用方无法读写该 bot 的会话
    ///
    /// 等待可以被取消（drop future），返回的 [`SlotGuard`] 在 drop 时释放。
    pub async fn acquire(&self, bot_id: u64) -> SlotGuard {
        let slot = self.slot(bot_id).await;
        SlotGuard {
            bot_id,
            guard: slot.lock_owned().await,
        }
    }

    /// 在 slot 内读取对话副本
    pub async fn snapshot(&self, bot_id: u64) -> Vec<Turn> {
        self.acquire(bot_id).await.snapshot()
    }

    /// 在 slot 内取走会话
    pub async fn evict(&self, bot_id: u64) -> Option<LiveSession> {
        self.acquire(bot_id).await.evict()
    }

    /// 当前持有会话的 bot（升序）
    ///
    /// 逐个获取 slot，会等待正在进行中的请求。
    pub async fn active_bots(&self) -> Vec<u64> {
        let slots: Vec<(u64, Slot)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(id, slot)| (*id, slot.clone()))
            .collect();
        let mut active = Vec::new();
        for (bot_id, slot) in slots {
            if slot.lock().await.is_some() {
                active.push(bot_id);
            }
        }
        active.sort_unstable();
        active
    }
}

/// 某个 bot 的 slot 的独占句柄
pub struct SlotGuard {
    bot_id: u64,
    guard: OwnedMutexGuard<Option<LiveSession>>,
}

impl SlotGuard {
    pub fn bot_id(&self) -> u64 {
        self.bot_id
    }

    pub fn session(&self) -> Option<&LiveSession> {
        self.guard.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.guard.is_some()
    }

    /// 装载会话
    ///
    /// 已有会话时不做任何事，除非 `reload` 为真；这样不会意外丢掉还没保存的对话。
    /// 请求最新但该 bot 没有 checkpoint 时从空会话开始；指定编号不存在则报错，原会话保持不变。
    pub async fn hydrate(
        &mut self,
        store: &dyn CheckpointStore,
        from: ResumeFrom,
        reload: bool,
    ) -> Result<&LiveSession> {
        if reload || self.guard.is_none() {
            let session = match from {
                ResumeFrom::Fresh => LiveSession::fresh(self.bot_id),
                ResumeFrom::Latest => match store.get(self.bot_id, LATEST).await {
                    Ok(cp) => LiveSession::from_checkpoint(&cp)?,
                    Err(BotError::Store(StoreError::NoCheckpoints(_))) => {
                        LiveSession::fresh(self.bot_id)
                    }
                    Err(e) => return Err(e),
                },
                ResumeFrom::Checkpoint(n) => {
                    LiveSession::from_checkpoint(&store.get(self.bot_id, n).await?)?
                }
            };
            debug!(
                bot_id = self.bot_id,
                origin = ?session.origin,
                turns = session.turns.len(),
                "会话已装载"
            );
            *self.guard = Some(session);
        }
        Ok(self.live_mut())
    }

    fn live_mut(&mut self) -> &mut LiveSession {
        let bot_id = self.bot_id;
        self.guard.get_or_insert_with(|| LiveSession::fresh(bot_id))
    }

    pub fn append_user_turn(&mut self, content: impl Into<String>) {
        self.append_turns([Turn::user(content)]);
    }

    pub fn append_assistant_turn(&mut self, content: impl Into<String>) {
        self.append_turns([Turn::assistant(content)]);
    }

    /// 一次追加若干轮；没有会话时先建一个空会话
    pub fn append_turns(&mut self, turns: impl IntoIterator<Item = Turn>) {
        let session = self.live_mut();
        session.turns.extend(turns);
        session.dirty = true;
    }

    pub fn snapshot(&self) -> Vec<Turn> {
        self.guard
            .as_ref()
            .map(|s| s.turns.clone())
            .unwrap_or_default()
    }

    /// 取走会话，之后该 bot 从空 slot 开始
    pub fn evict(&mut self) -> Option<LiveSession> {
        self.guard.take()
    }

    /// 放回会话（持久化失败时保留对话）
    pub fn install(&mut self, session: LiveSession) {
        *self.guard = Some(session);
    }

    /// 记录已保存为某个 checkpoint
    pub fn mark_saved(&mut self, checkpoint_number: u64) {
        if let Some(session) = self.guard.as_mut() {
            session.origin = Some(checkpoint_number);
            session.dirty = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointSnapshot, InMemoryCheckpointStore};
    use std::time::Duration;

    #[tokio::test]
    async fn test_hydrate_is_noop_when_active() -> Result<()> {
        let store = InMemoryCheckpointStore::new();
        store
            .create(1, CheckpointSnapshot::from_turns(vec![Turn::user("old")]))
            .await?;
        let cache = SessionCache::new();

        let mut slot = cache.acquire(1).await;
        slot.hydrate(&store, ResumeFrom::Fresh, false).await?;
        slot.append_user_turn("in progress");
        let session = slot.hydrate(&store, ResumeFrom::Latest, false).await?;
        assert_eq!(session.turns, vec![Turn::user("in progress")]);

        let session = slot.hydrate(&store, ResumeFrom::Latest, true).await?;
        assert_eq!(session.turns, vec![Turn::user("old")]);
        assert_eq!(session.origin, Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn test_hydrate_latest_without_checkpoints_starts_empty() -> Result<()> {
        let store = InMemoryCheckpointStore::new();
        let cache = SessionCache::new();
        let mut slot = cache.acquire(5).await;
        let session = slot.hydrate(&store, ResumeFrom::Latest, false).await?;
        assert!(session.turns.is_empty());
        assert_eq!(session.origin, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_current_session() -> Result<()> {
        let store = InMemoryCheckpointStore::new();
        let cache = SessionCache::new();
        let mut slot = cache.acquire(5).await;
        slot.append_user_turn("keep me");
        assert!(
            slot.hydrate(&store, ResumeFrom::Checkpoint(9), true)
                .await
                .is_err()
        );
        assert_eq!(slot.snapshot(), vec![Turn::user("keep me")]);
        Ok(())
    }

    #[tokio::test]
    async fn test_evict_then_acquire_starts_fresh() {
        let cache = SessionCache::new();
        {
            let mut slot = cache.acquire(3).await;
            slot.append_user_turn("a");
            slot.append_assistant_turn("b");
        }
        assert_eq!(cache.active_bots().await, vec![3]);
        let evicted = cache.evict(3).await.expect("session present");
        assert_eq!(evicted.turns.len(), 2);
        assert!(evicted.dirty);
        assert!(cache.snapshot(3).await.is_empty());
        assert!(cache.active_bots().await.is_empty());
    }

    #[tokio::test]
    async fn test_slot_serializes_same_bot_only() {
        let cache = Arc::new(SessionCache::new());
        let held = cache.acquire(1).await;

        // 同一个 bot 需要等待
        let blocked = tokio::time::timeout(Duration::from_millis(50), cache.acquire(1)).await;
        assert!(blocked.is_err());

        // 其他 bot 不受影响
        let other = tokio::time::timeout(Duration::from_millis(50), cache.acquire(2)).await;
        assert!(other.is_ok());

        drop(held);
        let reacquired = tokio::time::timeout(Duration::from_millis(50), cache.acquire(1)).await;
        assert!(reacquired.is_ok());
    }
}
