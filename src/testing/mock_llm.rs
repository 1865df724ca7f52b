//! Mock LLM 客户端，用于在不发起真实 HTTP 请求的情况下测试 [`LlmAgentRuntime`](crate::runtime::LlmAgentRuntime)
//! 以及任何注入了 `Arc<dyn LlmClient>` 的组件。
//!
//! # 示例
//!
//! ```rust
//! use bot_session::testing::MockLlmClient;
//! use bot_session::llm::LlmClient;
//! use bot_session::llm::types::Message;
//!
//! # #[tokio::main]
//! # async fn main() -> bot_session::error::Result<()> {
//! let mock = MockLlmClient::new()
//!     .with_response("第一次响应")
//!     .with_response("第二次响应");
//!
//! let r1 = mock.chat_simple("mock-model", vec![Message::user("hi".to_string())]).await?;
//! assert_eq!(r1, "第一次响应");
//! assert_eq!(mock.call_count(), 1);
//! assert_eq!(mock.last_model().as_deref(), Some("mock-model"));
//! # Ok(())
//! # }
//! ```

use super::lock;
use crate::error::{BotError, LlmError, Result};
use crate::llm::LlmClient;
use crate::llm::types::Message;
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// 预设响应
enum MockLlmResponse {
    Content(String),
    Fragments(Vec<String>),
    Err(BotError),
}

/// 可脚本化的 Mock LLM 客户端。
///
/// 按顺序返回预设的响应；队列耗尽后返回 `EmptyResponse` 错误。
/// `chat_simple` 和 `chat_stream` 共用同一个队列，
/// 文本响应在流式调用中作为单个片段返回，片段响应在普通调用中拼接返回。
pub struct MockLlmClient {
    responses: Arc<Mutex<VecDeque<MockLlmResponse>>>,
    /// (model, messages)，按调用顺序记录
    calls: Arc<Mutex<Vec<(String, Vec<Message>)>>>,
}

impl Default for MockLlmClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// 追加一条成功响应文本
    pub fn with_response(self, text: impl Into<String>) -> Self {
        lock(&self.responses).push_back(MockLlmResponse::Content(text.into()));
        self
    }

    /// 批量追加多条成功响应
    pub fn with_responses(self, texts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        {
            let mut q = lock(&self.responses);
            for t in texts {
                q.push_back(MockLlmResponse::Content(t.into()));
            }
        }
        self
    }

    /// 追加一条流式响应，每个元素为一个片段
    pub fn with_stream(self, fragments: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let fragments = fragments.into_iter().map(Into::into).collect();
        lock(&self.responses).push_back(MockLlmResponse::Fragments(fragments));
        self
    }

    /// 追加一条错误响应
    pub fn with_error(self, err: BotError) -> Self {
        lock(&self.responses).push_back(MockLlmResponse::Err(err));
        self
    }

    pub fn with_network_error(self, msg: impl Into<String>) -> Self {
        self.with_error(LlmError::NetworkError(msg.into()).into())
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// 最后一次调用时传入的 messages
    pub fn last_messages(&self) -> Option<Vec<Message>> {
        lock(&self.calls).last().map(|(_, m)| m.clone())
    }

    /// 最后一次调用使用的模型名
    pub fn last_model(&self) -> Option<String> {
        lock(&self.calls).last().map(|(model, _)| model.clone())
    }

    pub fn remaining(&self) -> usize {
        lock(&self.responses).len()
    }

    fn next(&self, model: &str, messages: Vec<Message>) -> Option<MockLlmResponse> {
        lock(&self.calls).push((model.to_string(), messages));
        lock(&self.responses).pop_front()
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn chat_simple(&self, model: &str, messages: Vec<Message>) -> Result<String> {
        match self.next(model, messages) {
            Some(MockLlmResponse::Content(text)) => Ok(text),
            Some(MockLlmResponse::Fragments(parts)) => Ok(parts.concat()),
            Some(MockLlmResponse::Err(e)) => Err(e),
            None => Err(LlmError::EmptyResponse.into()),
        }
    }

    async fn chat_stream(
        &self,
        model: &str,
        messages: Vec<Message>,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let parts = match self.next(model, messages) {
            Some(MockLlmResponse::Content(text)) => vec![text],
            Some(MockLlmResponse::Fragments(parts)) => parts,
            Some(MockLlmResponse::Err(e)) => return Err(e),
            None => return Err(LlmError::EmptyResponse.into()),
        };
        Ok(Box::pin(stream::iter(parts.into_iter().map(Ok))))
    }
}
