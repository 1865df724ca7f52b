mod client;
pub mod config;
pub mod types;

use crate::error::{BotError, LlmError, Result};
use crate::llm::client::{post, post_stream};
use crate::llm::config::{LlmConfig, ModelConfig};
use crate::llm::types::{ChatCompletionRequest, Message};
use async_trait::async_trait;
use futures::stream::BoxStream;
use reqwest::Client;
use reqwest::header::HeaderMap;
use std::sync::Arc;

pub fn assemble_req_header(model: &ModelConfig) -> Result<HeaderMap> {
    let mut header_map = HeaderMap::new();

    header_map.insert(
        "Authorization",
        format!("Bearer {}", model.apikey)
            .parse()
            .map_err(|e| BotError::Other(format!("Invalid Authorization header: {}", e)))?,
    );
    header_map.insert(
        "Content-Type",
        "application/json"
            .parse()
            .map_err(|e| BotError::Other(format!("Invalid Content-Type header: {}", e)))?,
    );
    Ok(header_map)
}

fn build_request(model: &ModelConfig, messages: Vec<Message>, stream: bool) -> ChatCompletionRequest {
    ChatCompletionRequest {
        model: model.model.clone(),
        messages,
        temperature: None,
        max_tokens: None,
        stream: Some(stream),
    }
}

/// 一次性对话，返回第一个 choice 的文本
pub async fn chat(client: Arc<Client>, model: &ModelConfig, messages: Vec<Message>) -> Result<String> {
    let request_body = build_request(model, messages, false);
    let header_map = assemble_req_header(model)?;
    post(client, &request_body, header_map, model.baseurl.as_str())
        .await?
        .into_content()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| LlmError::EmptyResponse.into())
}

/// 流式对话，逐个产出文本增量
pub async fn stream_chat(
    client: Arc<Client>,
    model: &ModelConfig,
    messages: Vec<Message>,
) -> Result<BoxStream<'static, Result<String>>> {
    let request_body = build_request(model, messages, true);
    let header_map = assemble_req_header(model)?;
    post_stream(client, &request_body, header_map, model.baseurl.as_str()).await
}

/// AgentRuntime 使用的 LLM 调用接口
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 发起一次对话，返回模型的文本内容
    async fn chat_simple(&self, model: &str, messages: Vec<Message>) -> Result<String>;

    /// 流式对话，返回有限、不可重放的文本片段序列
    async fn chat_stream(
        &self,
        model: &str,
        messages: Vec<Message>,
    ) -> Result<BoxStream<'static, Result<String>>>;
}

/// 基于 `chat` / `stream_chat` 的默认实现
pub struct DefaultLlmClient {
    client: Arc<Client>,
    config: LlmConfig,
}

impl DefaultLlmClient {
    pub fn new(client: Arc<Client>, config: LlmConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl LlmClient for DefaultLlmClient {
    async fn chat_simple(&self, model: &str, messages: Vec<Message>) -> Result<String> {
        let model = self.config.get_model(model)?;
        chat(self.client.clone(), &model, messages).await
    }

    async fn chat_stream(
        &self,
        model: &str,
        messages: Vec<Message>,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let model = self.config.get_model(model)?;
        stream_chat(self.client.clone(), &model, messages).await
    }
}
