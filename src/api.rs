//! REST 形式的会话接口
//!
//! 不负责 HTTP 路由，只把 [`SessionManager`] 的结果映射成 `(status, JSON body)`，
//! 由外层的 CRUD 服务直接转发。
//!
//! | 方法 | 成功状态码 | body |
//! |------|-----------|------|
//! | `start` | 201 | 当前对话 |
//! | `load` | 200 | 从指定 checkpoint 装载后的对话 |
//! | `post_message` | 201 | 追加后的完整对话 |
//! | `end` | 200 | `[]` |
//! | `history` | 200 | checkpoint 中的对话 |
//! | `checkpoints` / `checkpoint` | 200 | checkpoint 记录 |
//! | `patch_checkpoint` / `delete_checkpoint` | 200 | `{"message": ...}` |
//! | `save` | 201 | `{"message", "checkpoint_number"}` |
//!
//! 错误统一为 `{"error": <描述>, "kind": <分类>}`，部分失败额外带上已记录的 `messages`。

use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::warn;

use crate::checkpoint::CheckpointPatch;
use crate::error::{BotError, ErrorKind, Result, SessionError};
use crate::session::{ResumeFrom, SessionManager, UserMessage};

/// 一次调用的结果
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    fn ok<T: Serialize>(status: u16, body: &T) -> Self {
        match serde_json::to_value(body) {
            Ok(body) => Self { status, body },
            Err(e) => Self::error(&e.into()),
        }
    }

    fn message(status: u16, message: &str) -> Self {
        Self {
            status,
            body: json!({ "message": message }),
        }
    }

    fn error(err: &BotError) -> Self {
        let kind = err.kind();
        if kind == ErrorKind::Internal {
            warn!(error = %err, "请求处理失败");
        }
        let mut body = json!({
            "error": err.to_string(),
            "kind": kind.as_str(),
        });
        if let Some(turns) = err.recorded_turns() {
            body["messages"] = json!(turns);
        }
        Self {
            status: kind.status_code(),
            body,
        }
    }

    fn from_result<T: Serialize>(status: u16, result: Result<T>) -> Self {
        match result {
            Ok(body) => Self::ok(status, &body),
            Err(e) => Self::error(&e),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// 会话相关路由的处理器
pub struct SessionsApi {
    manager: Arc<SessionManager>,
}

impl SessionsApi {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    /// `GET /bot/{id}/start`，可选 `checkpoint` 为 0 时恢复最新
    pub async fn start(&self, bot_id: u64, checkpoint: Option<u64>) -> ApiResponse {
        let result = self
            .manager
            .start(bot_id, ResumeFrom::from_number(checkpoint))
            .await
            .map(|state| state.turns);
        ApiResponse::from_result(201, result)
    }

    /// `GET /bot/{id}/load/{n}`
    pub async fn load(&self, bot_id: u64, checkpoint_number: u64) -> ApiResponse {
        let result = self
            .manager
            .start(bot_id, ResumeFrom::from_number(Some(checkpoint_number)))
            .await
            .map(|state| state.turns);
        ApiResponse::from_result(200, result)
    }

    /// `POST /bot/{id}/message`，body 为 `{role, content}`
    pub async fn post_message(&self, bot_id: u64, body: Value) -> ApiResponse {
        let message: UserMessage = match serde_json::from_value(body) {
            Ok(m) => m,
            Err(_) => {
                return ApiResponse::error(
                    &SessionError::InvalidInput(
                        "Message role and content are required".to_string(),
                    )
                    .into(),
                );
            }
        };
        ApiResponse::from_result(201, self.manager.post_message(bot_id, message).await)
    }

    /// `GET /bot/{id}/end`
    pub async fn end(&self, bot_id: u64) -> ApiResponse {
        let result = self
            .manager
            .end(bot_id)
            .await
            .map(|_| Vec::<Value>::new());
        ApiResponse::from_result(200, result)
    }

    /// `POST /bot/{id}/save`
    pub async fn save(&self, bot_id: u64) -> ApiResponse {
        match self.manager.save_checkpoint(bot_id).await {
            Ok(number) => ApiResponse {
                status: 201,
                body: json!({
                    "message": "Checkpoint created",
                    "checkpoint_number": number,
                }),
            },
            Err(e) => ApiResponse::error(&e),
        }
    }

    /// `GET /checkpoints/{n}/session_history?bot_id=`
    pub async fn history(&self, bot_id: u64, checkpoint_number: u64) -> ApiResponse {
        ApiResponse::from_result(200, self.manager.history(bot_id, checkpoint_number).await)
    }

    /// `GET /checkpoints?bot_id=`
    pub async fn checkpoints(&self, bot_id: u64) -> ApiResponse {
        ApiResponse::from_result(200, self.manager.checkpoints(bot_id).await)
    }

    /// `GET /checkpoints/{n}?bot_id=`
    pub async fn checkpoint(&self, bot_id: u64, checkpoint_number: u64) -> ApiResponse {
        ApiResponse::from_result(200, self.manager.checkpoint(bot_id, checkpoint_number).await)
    }

    /// `PATCH /checkpoints/{n}?bot_id=`，body 只接受 `name` / `description`
    pub async fn patch_checkpoint(
        &self,
        bot_id: u64,
        checkpoint_number: u64,
        body: Value,
    ) -> ApiResponse {
        let patch: CheckpointPatch = match serde_json::from_value(body) {
            Ok(p) => p,
            Err(e) => {
                return ApiResponse::error(&SessionError::InvalidInput(e.to_string()).into());
            }
        };
        match self
            .manager
            .patch_checkpoint(bot_id, checkpoint_number, patch)
            .await
        {
            Ok(_) => ApiResponse::message(200, "Checkpoint updated"),
            Err(e) => ApiResponse::error(&e),
        }
    }

    /// `DELETE /checkpoints/{n}?bot_id=`
    pub async fn delete_checkpoint(&self, bot_id: u64, checkpoint_number: u64) -> ApiResponse {
        match self
            .manager
            .delete_checkpoint(bot_id, checkpoint_number)
            .await
        {
            Ok(()) => ApiResponse::message(200, "Checkpoint deleted"),
            Err(e) => ApiResponse::error(&e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::{Bot, InMemoryBotDirectory};
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::error::LlmError;
    use crate::testing::MockRuntime;

    fn api(runtime: MockRuntime) -> SessionsApi {
        let manager = SessionManager::new(
            Arc::new(InMemoryCheckpointStore::new()),
            Arc::new(InMemoryBotDirectory::new(vec![Bot::new(7, "helper")])),
            Arc::new(runtime),
        );
        SessionsApi::new(Arc::new(manager))
    }

    #[tokio::test]
    async fn test_session_routes_round_trip() {
        let api = api(MockRuntime::new().with_response("hi, how can I help?"));

        let res = api.start(7, None).await;
        assert_eq!(res.status, 201);
        assert_eq!(res.body, json!([]));

        let res = api
            .post_message(7, json!({"role": "user", "content": "hello"}))
            .await;
        assert_eq!(res.status, 201);
        assert_eq!(
            res.body,
            json!([
                {"role": "user", "content": "hello"},
                {"role": "assistant", "content": "hi, how can I help?"},
            ])
        );

        let res = api.end(7).await;
        assert_eq!((res.status, res.body), (200, json!([])));

        let res = api.history(7, 0).await;
        assert_eq!(res.status, 200);
        assert_eq!(res.body.as_array().map(Vec::len), Some(2));

        let res = api.load(7, 1).await;
        assert_eq!(res.status, 200);
        assert_eq!(res.body.as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn test_error_bodies_carry_kind() {
        let api = api(MockRuntime::new());

        let res = api.post_message(7, json!({"role": "assistant", "content": "x"})).await;
        assert_eq!(res.status, 400);
        assert_eq!(res.body["kind"], "invalid_input");

        let res = api.post_message(7, json!({"content": "no role"})).await;
        assert_eq!(res.status, 400);

        let res = api.start(42, None).await;
        assert_eq!(res.status, 404);
        let res = api.end(424242).await;
        assert_eq!(res.status, 404);
        assert_eq!(res.body["kind"], "not_found");
        assert_eq!(api.save(424242).await.status, 404);

        let res = api.history(7, 3).await;
        assert_eq!(res.status, 404);
        assert_eq!(res.body["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_reply_failure_returns_recorded_messages() {
        let api = api(
            MockRuntime::new().with_error(LlmError::NetworkError("down".to_string()).into()),
        );
        let res = api
            .post_message(7, json!({"role": "user", "content": "anyone?"}))
            .await;
        assert_eq!(res.status, 502);
        assert_eq!(res.body["kind"], "upstream_failure");
        assert_eq!(
            res.body["messages"],
            json!([{"role": "user", "content": "anyone?"}])
        );
    }

    #[tokio::test]
    async fn test_checkpoint_metadata_routes() {
        let api = api(MockRuntime::new().echo());
        api.post_message(7, json!({"role": "user", "content": "hi"})).await;

        let res = api.save(7).await;
        assert_eq!(res.status, 201);
        assert_eq!(res.body["checkpoint_number"], 1);

        let res = api.patch_checkpoint(7, 1, json!({"name": "greeting"})).await;
        assert_eq!(res.status, 200);
        let res = api.checkpoint(7, 1).await;
        assert_eq!(res.body["name"], "greeting");

        let res = api.patch_checkpoint(7, 1, json!({})).await;
        assert_eq!(res.status, 400);

        assert_eq!(api.delete_checkpoint(7, 1).await.status, 200);
        assert_eq!(api.delete_checkpoint(7, 1).await.status, 404);
        let res = api.checkpoints(7).await;
        assert_eq!((res.status, res.body), (200, json!([])));
    }
}
