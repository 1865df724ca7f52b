use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{LiveSession, ResumeFrom, SessionCache, SessionState, Turn, UserMessage};
use crate::bot::{Bot, BotDirectory};
use crate::checkpoint::{Checkpoint, CheckpointPatch, CheckpointSnapshot, CheckpointStore, LATEST};
use crate::config::SessionConfig;
use crate::error::{BotError, ErrorKind, LlmError, Result, SessionError, StoreError};
use crate::runtime::AgentRuntime;

/// 流式回复：有限、不可重放的文本片段序列
///
/// 流持有该 bot 的 slot，直到结束或被 drop。只有完整结束时才提交 user + assistant 两轮；
/// 中途出错只提交 user 轮并产出 `ReplyFailed`；被 drop 则什么都不提交。
pub type ReplyStream = BoxStream<'static, Result<String>>;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// 持久化失败时的最大尝试次数
    pub persist_attempts: u32,
    pub retry_backoff: Duration,
    pub reply_timeout: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for SessionOptions {
    fn from(config: &SessionConfig) -> Self {
        Self {
            persist_attempts: config.persist_attempts.max(1),
            retry_backoff: config.retry_backoff(),
            reply_timeout: config.reply_timeout(),
        }
    }
}

/// 结束会话的结果
#[derive(Debug, Clone, PartialEq)]
pub struct EndOutcome {
    /// 新建的 checkpoint；会话不存在或为空时为 `None`
    pub checkpoint_number: Option<u64>,
    /// 被写入 checkpoint 的对话
    pub saved_turns: Vec<Turn>,
}

/// 会话编排：缓存 + checkpoint 存储 + AgentRuntime
///
/// 每个 bot 的状态机：`NoSession → Active → … → Ended(= NoSession)`。
/// 所有操作都在该 bot 的 slot 内完成，AgentRuntime 调用期间也持有 slot，
/// 因此同一 bot 的对话严格有序，不同 bot 互不阻塞。
/// 每个操作先在 [`BotDirectory`] 中确认 bot 存在，slot 只为已知的 bot 创建。
pub struct SessionManager {
    cache: SessionCache,
    store: Arc<dyn CheckpointStore>,
    bots: Arc<dyn BotDirectory>,
    runtime: Arc<dyn AgentRuntime>,
    options: SessionOptions,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn CheckpointStore>,
        bots: Arc<dyn BotDirectory>,
        runtime: Arc<dyn AgentRuntime>,
    ) -> Self {
        Self {
            cache: SessionCache::new(),
            store,
            bots,
            runtime,
            options: SessionOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    // ── 会话生命周期 ──────────────────────────────────────────────────────────

    /// 开始或恢复会话
    ///
    /// 已有会话时：`Fresh` 直接返回当前状态；请求的 checkpoint 与当前来源相同也直接返回；
    /// 否则返回 `ResumeConflict`，由调用方决定继续当前会话还是 [`reload`](Self::reload)。
    pub async fn start(&self, bot_id: u64, from: ResumeFrom) -> Result<SessionState> {
        self.bots.get(bot_id).await?;
        let mut slot = self.cache.acquire(bot_id).await;

        if let Some(current) = slot.session().map(|s| s.state()) {
            if from == ResumeFrom::Fresh {
                return Ok(current);
            }
            let requested = self.resolve_origin(bot_id, from).await?;
            if requested == current.origin {
                debug!(bot_id, origin = ?requested, "会话已在进行，直接返回");
                return Ok(current);
            }
            return Err(SessionError::ResumeConflict {
                bot_id,
                active: current.origin,
                requested,
            }
            .into());
        }

        let session = slot.hydrate(self.store.as_ref(), from, false).await?;
        info!(bot_id, origin = ?session.origin, turns = session.turns.len(), "▶️ 会话开始");
        Ok(session.state())
    }

    /// 丢弃当前会话（包括未保存的对话），重新从指定来源装载
    pub async fn reload(&self, bot_id: u64, from: ResumeFrom) -> Result<SessionState> {
        self.bots.get(bot_id).await?;
        let mut slot = self.cache.acquire(bot_id).await;
        if slot.session().is_some_and(|s| s.dirty) {
            warn!(bot_id, "重新装载，丢弃未保存的对话");
        }
        let session = slot.hydrate(self.store.as_ref(), from, true).await?;
        info!(bot_id, origin = ?session.origin, turns = session.turns.len(), "🔄 会话已重新装载");
        Ok(session.state())
    }

    /// 追加一条用户消息并获取助手回复，返回完整对话
    ///
    /// AgentRuntime 失败时用户消息仍被记录，返回 `ReplyFailed`（携带已记录的对话）。
    /// 调用被取消（future 被 drop）时会话保持原样。
    pub async fn post_message(&self, bot_id: u64, message: UserMessage) -> Result<Vec<Turn>> {
        let user_turn = message.validate()?;
        let bot = self.bots.get(bot_id).await?;
        let mut slot = self.cache.acquire(bot_id).await;
        slot.hydrate(self.store.as_ref(), ResumeFrom::Fresh, false)
            .await?;

        let mut context = slot.snapshot();
        context.push(user_turn.clone());

        match self.generate(&bot, &context).await {
            Ok(reply) => {
                slot.append_turns([user_turn, Turn::assistant(reply)]);
                let turns = slot.snapshot();
                debug!(bot_id, turns = turns.len(), "💬 回复已追加");
                Ok(turns)
            }
            Err(cause) => {
                slot.append_turns([user_turn]);
                warn!(bot_id, error = %cause, "AgentRuntime 失败，仅记录用户消息");
                Err(SessionError::ReplyFailed {
                    bot_id,
                    turns: slot.snapshot(),
                    cause: Box::new(cause),
                }
                .into())
            }
        }
    }

    /// [`post_message`](Self::post_message) 的流式版本
    pub async fn post_message_stream(
        &self,
        bot_id: u64,
        message: UserMessage,
    ) -> Result<ReplyStream> {
        let user_turn = message.validate()?;
        let bot = self.bots.get(bot_id).await?;
        let mut slot = self.cache.acquire(bot_id).await;
        slot.hydrate(self.store.as_ref(), ResumeFrom::Fresh, false)
            .await?;

        let mut context = slot.snapshot();
        context.push(user_turn.clone());

        let deadline = self.options.reply_timeout.map(|t| (Instant::now() + t, t));
        let opened = match deadline {
            Some((at, t)) => tokio::time::timeout_at(at, self.runtime.generate_stream(&bot, &context))
                .await
                .unwrap_or_else(|_| Err(LlmError::Timeout(t.as_secs()).into())),
            None => self.runtime.generate_stream(&bot, &context).await,
        };
        let mut fragments = match opened {
            Ok(fragments) => fragments,
            Err(cause) => {
                slot.append_turns([user_turn]);
                warn!(bot_id, error = %cause, "流式回复无法建立，仅记录用户消息");
                return Err(SessionError::ReplyFailed {
                    bot_id,
                    turns: slot.snapshot(),
                    cause: Box::new(cause),
                }
                .into());
            }
        };

        let stream = async_stream::stream! {
            let mut slot = slot;
            let mut reply = String::new();
            let mut failure: Option<BotError> = None;

            loop {
                let next = match deadline {
                    Some((at, t)) => match tokio::time::timeout_at(at, fragments.next()).await {
                        Ok(next) => next,
                        Err(_) => Some(Err(LlmError::Timeout(t.as_secs()).into())),
                    },
                    None => fragments.next().await,
                };
                match next {
                    Some(Ok(fragment)) => {
                        reply.push_str(&fragment);
                        yield Ok::<String, BotError>(fragment);
                    }
                    Some(Err(e)) => {
                        failure = Some(e);
                        break;
                    }
                    None => break,
                }
            }

            if failure.is_none() && reply.is_empty() {
                failure = Some(LlmError::EmptyResponse.into());
            }

            match failure {
                None => {
                    slot.append_turns([user_turn, Turn::assistant(reply)]);
                    debug!(bot_id, "💬 流式回复已追加");
                }
                Some(cause) => {
                    slot.append_turns([user_turn]);
                    warn!(bot_id, error = %cause, "流式回复中断，丢弃未完成的助手消息");
                    yield Err(SessionError::ReplyFailed {
                        bot_id,
                        turns: slot.snapshot(),
                        cause: Box::new(cause),
                    }
                    .into());
                }
            }
        };
        Ok(Box::pin(stream))
    }

    /// 结束会话：写入新的 checkpoint 并清出缓存
    ///
    /// 只有 checkpoint 写入成功后才清出缓存；失败时对话保留在缓存里，
    /// 返回 `PersistFailed`，调用方可以再次调用 `end`。
    /// 写入和清出在后台任务里完成，调用方中途放弃等待时两者仍一并生效。
    pub async fn end(&self, bot_id: u64) -> Result<EndOutcome> {
        let bot = self.bots.get(bot_id).await?;
        let mut slot = self.cache.acquire(bot_id).await;
        let Some(session) = slot.session().cloned() else {
            debug!(bot_id, "没有进行中的会话");
            return Ok(EndOutcome {
                checkpoint_number: None,
                saved_turns: Vec::new(),
            });
        };

        if session.turns.is_empty() {
            slot.evict();
            info!(bot_id, "⏹️ 空会话结束，不生成 checkpoint");
            return Ok(EndOutcome {
                checkpoint_number: None,
                saved_turns: Vec::new(),
            });
        }

        let writer = self.writer(&bot);
        tokio::spawn(async move {
            let number = writer.persist(&bot, &session).await?;
            slot.evict();
            info!(bot_id, checkpoint_number = number, turns = session.turns.len(), "⏹️ 会话结束");
            Ok::<_, BotError>(EndOutcome {
                checkpoint_number: Some(number),
                saved_turns: session.turns,
            })
        })
        .await
        .map_err(|e| BotError::Other(format!("结束会话的任务异常退出: {e}")))?
    }

    /// 不结束会话，立即保存一个 checkpoint
    pub async fn save_checkpoint(&self, bot_id: u64) -> Result<u64> {
        let bot = self.bots.get(bot_id).await?;
        let mut slot = self.cache.acquire(bot_id).await;
        let session = match slot.session() {
            Some(s) if !s.turns.is_empty() => s.clone(),
            Some(_) => {
                return Err(SessionError::InvalidInput("Session has no messages to save".to_string()).into());
            }
            None => {
                return Err(SessionError::InvalidInput(format!(
                    "Bot {} has no active session",
                    bot_id
                ))
                .into());
            }
        };

        let writer = self.writer(&bot);
        tokio::spawn(async move {
            let number = writer.persist(&bot, &session).await?;
            slot.mark_saved(number);
            info!(bot_id, checkpoint_number = number, "📌 会话快照已保存");
            Ok::<_, BotError>(number)
        })
        .await
        .map_err(|e| BotError::Other(format!("保存会话的任务异常退出: {e}")))?
    }

    // ── 查询 ──────────────────────────────────────────────────────────────────

    /// 当前会话状态，没有会话时为 `None`
    pub async fn state(&self, bot_id: u64) -> Result<Option<SessionState>> {
        self.bots.get(bot_id).await?;
        Ok(self.cache.acquire(bot_id).await.session().map(|s| s.state()))
    }

    pub async fn snapshot(&self, bot_id: u64) -> Result<Vec<Turn>> {
        self.bots.get(bot_id).await?;
        Ok(self.cache.snapshot(bot_id).await)
    }

    pub async fn active_bots(&self) -> Vec<u64> {
        self.cache.active_bots().await
    }

    /// 某个 checkpoint 的对话，`0` 表示最新
    pub async fn history(&self, bot_id: u64, checkpoint_number: u64) -> Result<Vec<Turn>> {
        self.store.get(bot_id, checkpoint_number).await?.history()
    }

    pub async fn checkpoint(&self, bot_id: u64, checkpoint_number: u64) -> Result<Checkpoint> {
        self.store.get(bot_id, checkpoint_number).await
    }

    pub async fn checkpoints(&self, bot_id: u64) -> Result<Vec<Checkpoint>> {
        self.store.list(bot_id).await
    }

    pub async fn patch_checkpoint(
        &self,
        bot_id: u64,
        checkpoint_number: u64,
        patch: CheckpointPatch,
    ) -> Result<Checkpoint> {
        self.store
            .patch_metadata(bot_id, checkpoint_number, patch)
            .await
    }

    pub async fn delete_checkpoint(&self, bot_id: u64, checkpoint_number: u64) -> Result<()> {
        self.store.delete(bot_id, checkpoint_number).await
    }

    // ── 内部 ──────────────────────────────────────────────────────────────────

    /// 把请求的来源换算成 checkpoint 编号，`Latest` 且没有 checkpoint 时为 `None`
    async fn resolve_origin(&self, bot_id: u64, from: ResumeFrom) -> Result<Option<u64>> {
        match from {
            ResumeFrom::Fresh => Ok(None),
            ResumeFrom::Checkpoint(n) => {
                self.store.get(bot_id, n).await?;
                Ok(Some(n))
            }
            ResumeFrom::Latest => match self.store.get(bot_id, LATEST).await {
                Ok(cp) => Ok(Some(cp.checkpoint_number)),
                Err(BotError::Store(StoreError::NoCheckpoints(_))) => Ok(None),
                Err(e) => Err(e),
            },
        }
    }

    async fn generate(&self, bot: &Bot, turns: &[Turn]) -> Result<String> {
        let reply = match self.options.reply_timeout {
            Some(t) => tokio::time::timeout(t, self.runtime.generate(bot, turns))
                .await
                .map_err(|_| LlmError::Timeout(t.as_secs()))??,
            None => self.runtime.generate(bot, turns).await?,
        };
        if reply.is_empty() {
            return Err(LlmError::EmptyResponse.into());
        }
        Ok(reply)
    }

    fn writer(&self, bot: &Bot) -> CheckpointWriter {
        CheckpointWriter {
            store: Arc::clone(&self.store),
            options: self.options.clone(),
            model: self.runtime.resolved_model(bot),
        }
    }
}

/// 把一个会话写成 checkpoint，可以脱离 [`SessionManager`] 在后台任务里运行
struct CheckpointWriter {
    store: Arc<dyn CheckpointStore>,
    options: SessionOptions,
    model: Option<String>,
}

impl CheckpointWriter {
    /// 编号冲突重试一次，存储故障按配置有限重试
    async fn persist(&self, bot: &Bot, session: &LiveSession) -> Result<u64> {
        let snapshot = CheckpointSnapshot {
            system_prompt: bot.effective_prompt().map(str::to_string),
            datasets: session.datasets.clone(),
            memories: session.memories.clone(),
            session_history: session.turns.clone(),
            model: self.model.clone(),
            ..Default::default()
        };

        let mut attempts = 0u32;
        let mut failures = 0u32;
        let mut conflict_retried = false;
        loop {
            attempts += 1;
            let cause = match self.store.create(bot.id, snapshot.clone()).await {
                Ok(number) => return Ok(number),
                Err(e) => e,
            };
            if cause.is_conflict() && !conflict_retried {
                conflict_retried = true;
                warn!(bot_id = bot.id, error = %cause, "checkpoint 编号冲突，重试");
                continue;
            }
            if cause.kind() == ErrorKind::PersistenceFailure {
                failures += 1;
                if failures < self.options.persist_attempts {
                    warn!(bot_id = bot.id, attempt = failures, error = %cause, "checkpoint 写入失败，稍后重试");
                    tokio::time::sleep(self.options.retry_backoff * failures).await;
                    continue;
                }
            }
            warn!(bot_id = bot.id, attempts, error = %cause, "checkpoint 写入放弃，对话保留在缓存");
            return Err(SessionError::PersistFailed {
                bot_id: bot.id,
                turns: session.turns.clone(),
                attempts,
                cause: Box::new(cause),
            }
            .into());
        }
    }
}
