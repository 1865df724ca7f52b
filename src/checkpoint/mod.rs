//! 持久化 Checkpoint
//!
//! 每个 bot 的 checkpoint 以 `(bot_id, checkpoint_number)` 为键，编号从 1 开始严格递增，
//! 删除后也不会复用。编号计算和写入在同一把锁内完成，并发 `create` 不会撞号。
//!
//! ## 内置实现
//!
//! | 类型 | 说明 |
//! |------|------|
//! | [`InMemoryCheckpointStore`] | 进程内存，重启即清空，适合测试 |
//! | [`FileCheckpointStore`] | JSON 文件持久化，先写临时文件再 rename |
//!
//! ```rust,no_run
//! use bot_session::checkpoint::{CheckpointSnapshot, CheckpointStore, FileCheckpointStore};
//! use bot_session::session::Turn;
//!
//! # async fn example() -> bot_session::error::Result<()> {
//! let store = FileCheckpointStore::new("~/.bot-session/checkpoints.json")?;
//! let number = store
//!     .create(7, CheckpointSnapshot::from_turns(vec![Turn::user("hello")]))
//!     .await?;
//! let latest = store.get(7, 0).await?;
//! assert_eq!(latest.checkpoint_number, number);
//! # Ok(())
//! # }
//! ```

mod file;
mod memory;

pub use file::FileCheckpointStore;
pub use memory::InMemoryCheckpointStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Result, StoreError};
use crate::session::Turn;

/// `checkpoint_number` 为 0 时表示“最新”
pub const LATEST: u64 = 0;

const DEFAULT_NAME: &str = "New Checkpoint";
const DEFAULT_VERSION: &str = "1.0";

// ── Checkpoint ────────────────────────────────────────────────────────────────

/// 某个 bot 在某一时刻的不可变快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// 记录唯一 ID（UUID v4）
    pub id: String,
    pub bot_id: u64,
    /// 每个 bot 内从 1 开始的序号
    pub checkpoint_number: u64,
    /// 创建时间（Unix 秒）
    pub created_at: u64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub version: String,
    pub system_prompt: Option<String>,
    /// 序列化后的数据集，核心不解析
    pub datasets: Option<String>,
    /// 序列化后的记忆，核心不解析
    pub memories: Option<String>,
    /// JSON 编码的 `[{role, content}]`
    pub session_history: Option<String>,
    pub model: Option<String>,
}

impl Checkpoint {
    /// 解码对话历史，字段为空时返回空序列
    pub fn history(&self) -> Result<Vec<Turn>> {
        match self.session_history.as_deref() {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw)
                .map_err(|e| StoreError::SerializationError(e.to_string()).into()),
            _ => Ok(Vec::new()),
        }
    }
}

/// 创建 checkpoint 所需的内容，编号和时间由存储分配
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
    pub name: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
    pub system_prompt: Option<String>,
    pub datasets: Option<String>,
    pub memories: Option<String>,
    pub session_history: Vec<Turn>,
    pub model: Option<String>,
}

impl CheckpointSnapshot {
    pub fn from_turns(turns: Vec<Turn>) -> Self {
        Self {
            session_history: turns,
            ..Default::default()
        }
    }

    fn into_checkpoint(self, bot_id: u64, checkpoint_number: u64) -> Result<Checkpoint> {
        let session_history = if self.session_history.is_empty() {
            None
        } else {
            Some(
                serde_json::to_string(&self.session_history)
                    .map_err(|e| StoreError::SerializationError(e.to_string()))?,
            )
        };
        Ok(Checkpoint {
            id: uuid::Uuid::new_v4().to_string(),
            bot_id,
            checkpoint_number,
            created_at: now_secs(),
            name: self.name.unwrap_or_else(|| DEFAULT_NAME.to_string()),
            description: self.description.unwrap_or_default(),
            version: self.version.unwrap_or_else(|| DEFAULT_VERSION.to_string()),
            system_prompt: self.system_prompt,
            datasets: self.datasets,
            memories: self.memories,
            session_history,
            model: self.model,
        })
    }
}

/// 可修改的展示字段，快照内容本身不可改
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointPatch {
    pub name: Option<String>,
    pub description: Option<String>,
}

impl CheckpointPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none()
    }
}

// ── CheckpointStore trait ─────────────────────────────────────────────────────

/// Checkpoint 的持久化接口，所有写操作在返回成功前已落盘
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// 分配下一个编号并写入，返回该编号
    async fn create(&self, bot_id: u64, snapshot: CheckpointSnapshot) -> Result<u64>;

    /// 按编号获取，[`LATEST`] 表示编号最大的那个
    async fn get(&self, bot_id: u64, checkpoint_number: u64) -> Result<Checkpoint>;

    /// 该 bot 的全部 checkpoint（编号升序）
    async fn list(&self, bot_id: u64) -> Result<Vec<Checkpoint>>;

    /// 只更新名称/描述
    async fn patch_metadata(
        &self,
        bot_id: u64,
        checkpoint_number: u64,
        patch: CheckpointPatch,
    ) -> Result<Checkpoint>;

    /// 删除指定编号，其余编号保持不变
    async fn delete(&self, bot_id: u64, checkpoint_number: u64) -> Result<()>;
}

// ── CheckpointBook ────────────────────────────────────────────────────────────

/// 单个 bot 的账本：已分配的最大编号独立于记录保存，删除不会让编号回退
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct BotLedger {
    pub(crate) last_number: u64,
    pub(crate) checkpoints: BTreeMap<u64, Checkpoint>,
}

/// 两种存储共用的内存结构，调用方负责加锁
///
/// 文件存储在副本上修改，落盘成功后才整体替换
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct CheckpointBook {
    pub(crate) bots: HashMap<u64, BotLedger>,
}

impl CheckpointBook {
    /// 分配编号并插入，返回编号
    pub(crate) fn insert(&mut self, bot_id: u64, snapshot: CheckpointSnapshot) -> Result<u64> {
        let ledger = self.bots.entry(bot_id).or_default();
        let highest = ledger.checkpoints.keys().next_back().copied().unwrap_or(0);
        let number = ledger.last_number.max(highest) + 1;
        let checkpoint = snapshot.into_checkpoint(bot_id, number)?;
        ledger.checkpoints.insert(number, checkpoint);
        ledger.last_number = number;
        Ok(number)
    }

    fn resolve(&self, bot_id: u64, checkpoint_number: u64) -> Result<u64> {
        let ledger = self.bots.get(&bot_id);
        if checkpoint_number == LATEST {
            return ledger
                .and_then(|l| l.checkpoints.keys().next_back().copied())
                .ok_or_else(|| StoreError::NoCheckpoints(bot_id).into());
        }
        match ledger {
            Some(l) if l.checkpoints.contains_key(&checkpoint_number) => Ok(checkpoint_number),
            _ => Err(StoreError::CheckpointNotFound {
                bot_id,
                checkpoint_number,
            }
            .into()),
        }
    }

    pub(crate) fn get(&self, bot_id: u64, checkpoint_number: u64) -> Result<Checkpoint> {
        let number = self.resolve(bot_id, checkpoint_number)?;
        self.bots
            .get(&bot_id)
            .and_then(|l| l.checkpoints.get(&number))
            .cloned()
            .ok_or_else(|| {
                StoreError::CheckpointNotFound {
                    bot_id,
                    checkpoint_number: number,
                }
                .into()
            })
    }

    pub(crate) fn list(&self, bot_id: u64) -> Vec<Checkpoint> {
        self.bots
            .get(&bot_id)
            .map(|l| l.checkpoints.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn patch(
        &mut self,
        bot_id: u64,
        checkpoint_number: u64,
        patch: CheckpointPatch,
    ) -> Result<Checkpoint> {
        if patch.is_empty() {
            return Err(StoreError::EmptyPatch.into());
        }
        let number = self.resolve(bot_id, checkpoint_number)?;
        let checkpoint = self
            .bots
            .get_mut(&bot_id)
            .and_then(|l| l.checkpoints.get_mut(&number))
            .ok_or(StoreError::CheckpointNotFound {
                bot_id,
                checkpoint_number: number,
            })?;
        if let Some(name) = patch.name {
            checkpoint.name = name;
        }
        if let Some(description) = patch.description {
            checkpoint.description = description;
        }
        Ok(checkpoint.clone())
    }

    /// 删除只接受精确编号
    pub(crate) fn remove(&mut self, bot_id: u64, checkpoint_number: u64) -> Result<Checkpoint> {
        self.bots
            .get_mut(&bot_id)
            .and_then(|l| l.checkpoints.remove(&checkpoint_number))
            .ok_or_else(|| {
                StoreError::CheckpointNotFound {
                    bot_id,
                    checkpoint_number,
                }
                .into()
            })
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
