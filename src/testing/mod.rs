//! 测试基础设施
//!
//! 提供在不依赖真实 LLM / 磁盘故障的情况下测试会话核心的工具集。
//!
//! | 类型 | 用途 |
//! |------|------|
//! | [`MockLlmClient`] | 替代真实 LLM，用于测试 `LlmAgentRuntime` |
//! | [`MockRuntime`] | 替代 AgentRuntime，可预设回复、错误、流式片段和延迟 |
//! | [`FlakyCheckpointStore`] | 包装任意 CheckpointStore，在 `create` 上注入冲突或 IO 失败 |
//!
//! # 设计原则
//!
//! - **零网络请求**：所有 Mock 都完全在内存中运行
//! - **可脚本化**：通过 `with_response()` / `with_error()` 精确控制返回值
//! - **可观测**：通过 `call_count()` / `last_turns()` 等方法检查调用情况
//!
//! # 使用示例
//!
//! ```rust
//! use bot_session::bot::{Bot, InMemoryBotDirectory};
//! use bot_session::checkpoint::InMemoryCheckpointStore;
//! use bot_session::session::{ResumeFrom, SessionManager, UserMessage};
//! use bot_session::testing::MockRuntime;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> bot_session::error::Result<()> {
//! let manager = SessionManager::new(
//!     Arc::new(InMemoryCheckpointStore::new()),
//!     Arc::new(InMemoryBotDirectory::new(vec![Bot::new(7, "helper")])),
//!     Arc::new(MockRuntime::new().with_response("hi, how can I help?")),
//! );
//!
//! manager.start(7, ResumeFrom::Fresh).await?;
//! let turns = manager.post_message(7, UserMessage::user("hello")).await?;
//! assert_eq!(turns.len(), 2);
//! assert_eq!(manager.end(7).await?.checkpoint_number, Some(1));
//! # Ok(())
//! # }
//! ```

mod flaky_store;
mod mock_llm;
mod mock_runtime;

pub use flaky_store::FlakyCheckpointStore;
pub use mock_llm::MockLlmClient;
pub use mock_runtime::MockRuntime;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// 测试中某个断言 panic 不应让其他调用也跟着失败
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
