//! 实时会话
//!
//! | 类型 | 作用 |
//! |------|------|
//! | [`SessionCache`] | 进程内 bot → slot 映射，每个 bot 一把锁 |
//! | [`SlotGuard`] | 持有某个 bot 的 slot，离开作用域即释放 |
//! | [`SessionManager`] | 编排缓存、checkpoint 存储和 AgentRuntime |
//!
//! 同一个 bot 的所有请求在 slot 上串行，不同 bot 之间完全并行。

mod cache;
mod manager;

pub use cache::{SessionCache, SlotGuard};
pub use manager::{EndOutcome, ReplyStream, SessionManager, SessionOptions};

use serde::{Deserialize, Serialize};

use crate::checkpoint::Checkpoint;
use crate::error::{Result, SessionError};

/// 对话角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// 一轮对话：`{role, content}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// 外部传入的消息，角色保持原样，由 [`UserMessage::validate`] 检查
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessage {
    pub role: String,
    pub content: String,
}

impl UserMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    /// 只接受非空的 user 消息
    pub fn validate(&self) -> Result<Turn> {
        if self.role != "user" {
            return Err(SessionError::InvalidInput(format!(
                "Only user messages are accepted, got role '{}'",
                self.role
            ))
            .into());
        }
        if self.content.trim().is_empty() {
            return Err(SessionError::InvalidInput("Message content is empty".to_string()).into());
        }
        Ok(Turn::user(self.content.clone()))
    }
}

/// 会话从哪里开始
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeFrom {
    /// 空会话
    Fresh,
    /// 该 bot 编号最大的 checkpoint
    Latest,
    /// 指定编号
    Checkpoint(u64),
}

impl ResumeFrom {
    /// `None` 表示从头开始，`Some(0)` 表示最新，其余为精确编号
    pub fn from_number(number: Option<u64>) -> Self {
        match number {
            None => ResumeFrom::Fresh,
            Some(0) => ResumeFrom::Latest,
            Some(n) => ResumeFrom::Checkpoint(n),
        }
    }

    pub fn as_number(&self) -> Option<u64> {
        match self {
            ResumeFrom::Fresh => None,
            ResumeFrom::Latest => Some(0),
            ResumeFrom::Checkpoint(n) => Some(*n),
        }
    }
}

/// 某个 bot 正在进行的会话，只存在于内存
#[derive(Debug, Clone)]
pub struct LiveSession {
    pub bot_id: u64,
    pub turns: Vec<Turn>,
    /// 加载来源的 checkpoint 编号，`None` 为全新会话
    pub origin: Option<u64>,
    /// 自加载或上次保存后是否有新的对话
    pub dirty: bool,
    /// 从来源 checkpoint 原样带过来的序列化字段
    pub datasets: Option<String>,
    pub memories: Option<String>,
}

impl LiveSession {
    pub fn fresh(bot_id: u64) -> Self {
        Self {
            bot_id,
            turns: Vec::new(),
            origin: None,
            dirty: false,
            datasets: None,
            memories: None,
        }
    }

    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Result<Self> {
        Ok(Self {
            bot_id: checkpoint.bot_id,
            turns: checkpoint.history()?,
            origin: Some(checkpoint.checkpoint_number),
            dirty: false,
            datasets: checkpoint.datasets.clone(),
            memories: checkpoint.memories.clone(),
        })
    }

    pub fn state(&self) -> SessionState {
        SessionState {
            bot_id: self.bot_id,
            turns: self.turns.clone(),
            origin: self.origin,
            dirty: self.dirty,
        }
    }
}

/// 会话的只读快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionState {
    pub bot_id: u64,
    pub turns: Vec<Turn>,
    pub origin: Option<u64>,
    pub dirty: bool,
}
