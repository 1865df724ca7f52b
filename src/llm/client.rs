use crate::error::{BotError, LlmError, Result};
use crate::llm::types::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};
use futures::{Stream, StreamExt};
use futures::stream::BoxStream;
use reqwest::Client;
use reqwest::header::HeaderMap;
use std::sync::Arc;
use tracing::debug;

pub async fn post(
    client: Arc<Client>,
    request_body: &ChatCompletionRequest,
    header_map: HeaderMap,
    url: &str,
) -> Result<ChatCompletionResponse> {
    let response = send(client, request_body, header_map, url).await?;

    let completion_response = response
        .json::<ChatCompletionResponse>()
        .await
        .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;

    debug!("Post completion response: {:?}", completion_response);

    Ok(completion_response)
}

/// 以 SSE 方式请求，逐个产出文本增量，遇到 `[DONE]` 结束
pub async fn post_stream(
    client: Arc<Client>,
    request_body: &ChatCompletionRequest,
    header_map: HeaderMap,
    url: &str,
) -> Result<BoxStream<'static, Result<String>>> {
    let response = send(client, request_body, header_map, url).await?;
    Ok(sse_deltas(response.bytes_stream()))
}

/// 把 SSE 字节流切成行并解析
///
/// 按原始字节缓冲，凑齐一整行再做 UTF-8 解码，跨 chunk 的多字节字符保持完整。
pub(crate) fn sse_deltas<S, B, E>(bytes: S) -> BoxStream<'static, Result<String>>
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut bytes = Box::pin(bytes);
        let mut buffer: Vec<u8> = Vec::new();
        'outer: while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err::<String, BotError>(LlmError::StreamInterrupted(e.to_string()).into());
                    break;
                }
            };
            buffer.extend_from_slice(chunk.as_ref());

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = buffer.drain(..=pos).collect();
                let parsed = String::from_utf8(raw)
                    .map_err(|e| {
                        BotError::Llm(LlmError::InvalidResponse(format!("SSE 行不是合法 UTF-8: {e}")))
                    })
                    .and_then(|line| parse_sse_line(&line));
                match parsed {
                    Ok(SseLine::Delta(text)) => yield Ok(text),
                    Ok(SseLine::Done) => break 'outer,
                    Ok(SseLine::Skip) => {}
                    Err(e) => {
                        yield Err(e);
                        break 'outer;
                    }
                }
            }
        }
    };
    Box::pin(stream)
}

async fn send(
    client: Arc<Client>,
    request_body: &ChatCompletionRequest,
    header_map: HeaderMap,
    url: &str,
) -> Result<reqwest::Response> {
    let response = client
        .post(url)
        .headers(header_map)
        .json(request_body)
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(LlmError::ApiError {
            status,
            message: error_text,
        }
        .into());
    }
    Ok(response)
}

#[derive(Debug, PartialEq)]
pub(crate) enum SseLine {
    Delta(String),
    Done,
    Skip,
}

/// 解析一行 `data: {...}`，空行、注释和无内容的 chunk 跳过
pub(crate) fn parse_sse_line(line: &str) -> Result<SseLine> {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    let chunk: ChatCompletionChunk = serde_json::from_str(data)
        .map_err(|e| BotError::Llm(LlmError::InvalidResponse(e.to_string())))?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|s| !s.is_empty())
        .map(SseLine::Delta)
        .unwrap_or(SseLine::Skip))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sse_line() -> Result<()> {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"你好"}}]}"#)?,
            SseLine::Delta("你好".to_string())
        );
        assert_eq!(parse_sse_line("data: [DONE]")?, SseLine::Done);
        assert_eq!(parse_sse_line(": keep-alive")?, SseLine::Skip);
        assert_eq!(parse_sse_line("")?, SseLine::Skip);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#)?,
            SseLine::Skip
        );
        assert!(parse_sse_line("data: {broken").is_err());
        Ok(())
    }

    fn chunks(parts: Vec<Vec<u8>>) -> impl Stream<Item = std::result::Result<Vec<u8>, std::io::Error>> {
        futures::stream::iter(parts.into_iter().map(Ok))
    }

    #[tokio::test]
    async fn test_multibyte_char_split_across_chunks() -> Result<()> {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"你好\"}}]}\n\ndata: [DONE]\n";
        // 从“你”的第一个字节之后切开
        let cut = body.find('你').expect("body contains 你") + 1;
        let parts = vec![body.as_bytes()[..cut].to_vec(), body.as_bytes()[cut..].to_vec()];

        let deltas: Vec<String> = sse_deltas(chunks(parts))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_>>()?;
        assert_eq!(deltas, vec!["你好".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_is_invalid_response() {
        let parts = vec![b"data: \xff\xfe\n".to_vec()];
        let items: Vec<Result<String>> = sse_deltas(chunks(parts)).collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(
            items[0],
            Err(BotError::Llm(LlmError::InvalidResponse(_)))
        ));
    }
}
