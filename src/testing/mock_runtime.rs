//! Mock AgentRuntime，用于测试 [`SessionManager`](crate::session::SessionManager) 的编排逻辑。
//!
//! ```rust
//! use bot_session::bot::Bot;
//! use bot_session::runtime::AgentRuntime;
//! use bot_session::session::Turn;
//! use bot_session::testing::MockRuntime;
//!
//! # #[tokio::main]
//! # async fn main() -> bot_session::error::Result<()> {
//! let runtime = MockRuntime::new().with_response("你好").echo();
//! let bot = Bot::new(1, "demo");
//!
//! assert_eq!(runtime.generate(&bot, &[Turn::user("hi")]).await?, "你好");
//! // 预设响应用完后回显最后一条用户消息
//! assert_eq!(runtime.generate(&bot, &[Turn::user("again")]).await?, "echo: again");
//! assert_eq!(runtime.call_count(), 2);
//! # Ok(())
//! # }
//! ```

use super::lock;
use crate::bot::Bot;
use crate::error::{BotError, LlmError, Result};
use crate::runtime::AgentRuntime;
use crate::session::{Role, Turn};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

enum Scripted {
    Reply(String),
    Fragments(Vec<String>),
    /// 先产出这些片段，再以错误结束
    Broken(Vec<String>, String),
    /// 先产出这些片段，之后再无输出也不结束
    Stalled(Vec<String>),
    Err(BotError),
}

/// 可脚本化的 AgentRuntime
///
/// 队列耗尽后：开启 [`echo`](MockRuntime::echo) 时回显最后一条用户消息，否则返回 `EmptyResponse`。
pub struct MockRuntime {
    script: Arc<Mutex<VecDeque<Scripted>>>,
    calls: Arc<Mutex<Vec<Vec<Turn>>>>,
    echo: bool,
    delay: Option<Duration>,
    model: Option<String>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            echo: false,
            delay: None,
            model: None,
        }
    }

    pub fn with_response(self, text: impl Into<String>) -> Self {
        lock(&self.script).push_back(Scripted::Reply(text.into()));
        self
    }

    pub fn with_error(self, err: BotError) -> Self {
        lock(&self.script).push_back(Scripted::Err(err));
        self
    }

    pub fn with_stream(self, fragments: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let fragments = fragments.into_iter().map(Into::into).collect();
        lock(&self.script).push_back(Scripted::Fragments(fragments));
        self
    }

    /// 产出若干片段后中断
    pub fn with_broken_stream(
        self,
        fragments: impl IntoIterator<Item = impl Into<String>>,
        reason: impl Into<String>,
    ) -> Self {
        let fragments = fragments.into_iter().map(Into::into).collect();
        lock(&self.script).push_back(Scripted::Broken(fragments, reason.into()));
        self
    }

    /// 产出若干片段后挂起，用来触发回复超时
    pub fn with_stalled_stream(
        self,
        fragments: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let fragments = fragments.into_iter().map(Into::into).collect();
        lock(&self.script).push_back(Scripted::Stalled(fragments));
        self
    }

    /// bot 没有指定模型时报告的模型
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn echo(mut self) -> Self {
        self.echo = true;
        self
    }

    /// 每次调用前等待，模拟慢模型
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// 最后一次调用收到的对话
    pub fn last_turns(&self) -> Option<Vec<Turn>> {
        lock(&self.calls).last().cloned()
    }

    async fn next(&self, turns: &[Turn]) -> Result<Scripted> {
        lock(&self.calls).push(turns.to_vec());
        let scripted = lock(&self.script).pop_front();
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match scripted {
            Some(s) => Ok(s),
            None if self.echo => {
                let last = turns
                    .iter()
                    .rev()
                    .find(|t| t.role == Role::User)
                    .map(|t| t.content.as_str())
                    .unwrap_or_default();
                Ok(Scripted::Reply(format!("echo: {}", last)))
            }
            None => Err(LlmError::EmptyResponse.into()),
        }
    }
}

#[async_trait]
impl AgentRuntime for MockRuntime {
    async fn generate(&self, _bot: &Bot, turns: &[Turn]) -> Result<String> {
        match self.next(turns).await? {
            Scripted::Reply(text) => Ok(text),
            Scripted::Fragments(parts) => Ok(parts.concat()),
            Scripted::Broken(_, reason) => Err(LlmError::StreamInterrupted(reason).into()),
            Scripted::Stalled(_) => futures::future::pending().await,
            Scripted::Err(e) => Err(e),
        }
    }

    async fn generate_stream(
        &self,
        _bot: &Bot,
        turns: &[Turn],
    ) -> Result<BoxStream<'static, Result<String>>> {
        let items: Vec<Result<String>> = match self.next(turns).await? {
            Scripted::Reply(text) => vec![Ok(text)],
            Scripted::Fragments(parts) => parts.into_iter().map(Ok).collect(),
            Scripted::Broken(parts, reason) => parts
                .into_iter()
                .map(Ok)
                .chain(std::iter::once(Err(LlmError::StreamInterrupted(reason).into())))
                .collect(),
            Scripted::Stalled(parts) => {
                let stalled = stream::iter(parts.into_iter().map(Ok::<String, BotError>))
                    .chain(stream::pending());
                return Ok(Box::pin(stalled));
            }
            Scripted::Err(e) => return Err(e),
        };
        Ok(Box::pin(stream::iter(items)))
    }

    fn resolved_model(&self, bot: &Bot) -> Option<String> {
        bot.model.clone().or_else(|| self.model.clone())
    }
}
