//! Bot 元数据
//!
//! bot 的增删改由外部元数据层负责，会话核心只读。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::{Result, SessionError};

/// 一个已配置的对话 agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bot {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default_system_prompt: Option<String>,
    /// 当前提示词，为空时回退到默认提示词
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub orchestrator_bot: bool,
}

impl Bot {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            description: None,
            default_system_prompt: None,
            system_prompt: None,
            model: None,
            orchestrator_bot: false,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// 实际生效的系统提示词
    pub fn effective_prompt(&self) -> Option<&str> {
        self.system_prompt
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .or(self.default_system_prompt.as_deref())
    }
}

/// bot 元数据的只读查询接口
#[async_trait]
pub trait BotDirectory: Send + Sync {
    /// 未知 bot 返回 `NotFound`
    async fn get(&self, bot_id: u64) -> Result<Bot>;

    async fn list(&self) -> Result<Vec<Bot>>;
}

/// 基于内存表的 BotDirectory，通常由配置文件构建
pub struct InMemoryBotDirectory {
    bots: RwLock<HashMap<u64, Bot>>,
}

impl Default for InMemoryBotDirectory {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl InMemoryBotDirectory {
    pub fn new(bots: impl IntoIterator<Item = Bot>) -> Self {
        Self {
            bots: RwLock::new(bots.into_iter().map(|b| (b.id, b)).collect()),
        }
    }

    /// 新增或替换
    pub async fn upsert(&self, bot: Bot) {
        self.bots.write().await.insert(bot.id, bot);
    }
}

#[async_trait]
impl BotDirectory for InMemoryBotDirectory {
    async fn get(&self, bot_id: u64) -> Result<Bot> {
        self.bots
            .read()
            .await
            .get(&bot_id)
            .cloned()
            .ok_or_else(|| SessionError::BotNotFound(bot_id).into())
    }

    async fn list(&self) -> Result<Vec<Bot>> {
        let mut bots: Vec<Bot> = self.bots.read().await.values().cloned().collect();
        bots.sort_by_key(|b| b.id);
        Ok(bots)
    }
}
