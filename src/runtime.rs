//! AgentRuntime：根据 bot 配置和已有对话生成下一条助手回复
//!
//! 会话核心只依赖 [`AgentRuntime`] trait，具体如何调用模型由实现决定。
//! 必须接受空的对话序列（第一轮）。

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use tracing::debug;

use crate::bot::Bot;
use crate::error::{ConfigError, Result};
use crate::llm::LlmClient;
use crate::llm::types::Message;
use crate::session::Turn;

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// 生成完整回复
    async fn generate(&self, bot: &Bot, turns: &[Turn]) -> Result<String>;

    /// 流式生成，任一元素出错即表示整个回复失败
    ///
    /// 默认实现把 [`generate`](AgentRuntime::generate) 的结果作为单个片段返回。
    async fn generate_stream(
        &self,
        bot: &Bot,
        turns: &[Turn],
    ) -> Result<BoxStream<'static, Result<String>>> {
        let text = self.generate(bot, turns).await?;
        Ok(Box::pin(futures::stream::once(async move { Ok(text) })))
    }

    /// 实际为该 bot 生成回复的模型，写入 checkpoint 的 `model` 字段
    fn resolved_model(&self, bot: &Bot) -> Option<String> {
        bot.model.clone()
    }
}

/// 通过 [`LlmClient`] 调用 Chat Completions 的 AgentRuntime
pub struct LlmAgentRuntime {
    llm: Arc<dyn LlmClient>,
    default_model: Option<String>,
}

impl LlmAgentRuntime {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            default_model: None,
        }
    }

    /// bot 没有指定模型时使用
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    fn model_for<'a>(&'a self, bot: &'a Bot) -> Result<&'a str> {
        bot.model
            .as_deref()
            .or(self.default_model.as_deref())
            .ok_or_else(|| {
                ConfigError::InvalidValue {
                    field: format!("bots[{}].model", bot.id),
                    message: "no model configured and no default_model set".to_string(),
                }
                .into()
            })
    }

    /// `[system] + turns`
    pub fn build_messages(bot: &Bot, turns: &[Turn]) -> Vec<Message> {
        let mut messages = Vec::with_capacity(turns.len() + 1);
        if let Some(prompt) = bot.effective_prompt() {
            messages.push(Message::system(prompt.to_string()));
        }
        messages.extend(turns.iter().map(Message::from));
        messages
    }
}

#[async_trait]
impl AgentRuntime for LlmAgentRuntime {
    async fn generate(&self, bot: &Bot, turns: &[Turn]) -> Result<String> {
        let model = self.model_for(bot)?;
        debug!(bot_id = bot.id, model, turns = turns.len(), "调用 LLM");
        self.llm
            .chat_simple(model, Self::build_messages(bot, turns))
            .await
    }

    async fn generate_stream(
        &self,
        bot: &Bot,
        turns: &[Turn],
    ) -> Result<BoxStream<'static, Result<String>>> {
        let model = self.model_for(bot)?;
        debug!(bot_id = bot.id, model, turns = turns.len(), "流式调用 LLM");
        self.llm
            .chat_stream(model, Self::build_messages(bot, turns))
            .await
    }

    fn resolved_model(&self, bot: &Bot) -> Option<String> {
        self.model_for(bot).ok().map(str::to_string)
    }
}
