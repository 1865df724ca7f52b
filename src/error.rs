use std::fmt;

use crate::session::Turn;

/// 会话核心的统一错误类型
#[derive(Debug)]
pub enum BotError {
    /// LLM / AgentRuntime 相关错误
    Llm(LlmError),
    /// Checkpoint 存储错误
    Store(StoreError),
    /// 会话编排错误
    Session(SessionError),
    /// 配置错误
    Config(ConfigError),
    /// IO 错误
    Io(std::io::Error),
    /// 其他错误
    Other(String),
}

/// LLM 相关错误
#[derive(Debug)]
pub enum LlmError {
    /// 网络请求失败
    NetworkError(String),
    /// API 返回错误状态码
    ApiError { status: u16, message: String },
    /// 响应格式无效
    InvalidResponse(String),
    /// 没有返回内容
    EmptyResponse,
    /// 流式响应中途中断
    StreamInterrupted(String),
    /// 调用超时
    Timeout(u64),
}

/// Checkpoint 存储错误
#[derive(Debug)]
pub enum StoreError {
    /// 指定编号的 checkpoint 不存在
    CheckpointNotFound { bot_id: u64, checkpoint_number: u64 },
    /// 请求最新 checkpoint，但该 bot 一个都没有
    NoCheckpoints(u64),
    /// 编号竞争，调用方需重试
    Conflict { bot_id: u64, checkpoint_number: u64 },
    /// 元数据补丁为空
    EmptyPatch,
    /// 底层读写失败
    IoError(String),
    /// 序列化/反序列化错误
    SerializationError(String),
}

/// 会话编排错误
#[derive(Debug)]
pub enum SessionError {
    /// 未知 bot
    BotNotFound(u64),
    /// 消息格式不合法
    InvalidInput(String),
    /// 会话已在进行中，且来源与请求的 checkpoint 不同
    ResumeConflict {
        bot_id: u64,
        active: Option<u64>,
        requested: Option<u64>,
    },
    /// 用户消息已记录，但没有生成回复
    ReplyFailed {
        bot_id: u64,
        turns: Vec<Turn>,
        cause: Box<BotError>,
    },
    /// 结束会话时持久化失败，对话仍保留在缓存中
    PersistFailed {
        bot_id: u64,
        turns: Vec<Turn>,
        attempts: u32,
        cause: Box<BotError>,
    },
}

/// 配置错误
#[derive(Debug)]
pub enum ConfigError {
    /// 配置文件未找到
    FileNotFound(String),
    /// 配置解析失败
    ParseFailed(String),
    /// 环境变量格式错误
    EnvFormatError(String),
    /// 环境变量中出现未知配置项
    UnknownKey { key: String, env: String },
    /// 缺少必需的配置项
    MissingField { model_id: String, field: String },
    /// 模型未配置
    ModelNotFound(String),
    /// 配置值无效
    InvalidValue { field: String, message: String },
}

/// 对外暴露的错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidInput,
    Conflict,
    UpstreamFailure,
    PersistenceFailure,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Conflict => "conflict",
            ErrorKind::UpstreamFailure => "upstream_failure",
            ErrorKind::PersistenceFailure => "persistence_failure",
            ErrorKind::Internal => "internal",
        }
    }

    /// REST 层使用的 HTTP 状态码
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::InvalidInput => 400,
            ErrorKind::Conflict => 409,
            ErrorKind::UpstreamFailure => 502,
            ErrorKind::PersistenceFailure => 503,
            ErrorKind::Internal => 500,
        }
    }
}

impl BotError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BotError::Llm(_) => ErrorKind::UpstreamFailure,
            BotError::Store(e) => match e {
                StoreError::CheckpointNotFound { .. } | StoreError::NoCheckpoints(_) => {
                    ErrorKind::NotFound
                }
                StoreError::Conflict { .. } => ErrorKind::Conflict,
                StoreError::EmptyPatch => ErrorKind::InvalidInput,
                StoreError::IoError(_) | StoreError::SerializationError(_) => {
                    ErrorKind::PersistenceFailure
                }
            },
            BotError::Session(e) => match e {
                SessionError::BotNotFound(_) => ErrorKind::NotFound,
                SessionError::InvalidInput(_) => ErrorKind::InvalidInput,
                SessionError::ResumeConflict { .. } => ErrorKind::Conflict,
                SessionError::ReplyFailed { .. } => ErrorKind::UpstreamFailure,
                SessionError::PersistFailed { cause, .. } if cause.is_conflict() => {
                    ErrorKind::Conflict
                }
                SessionError::PersistFailed { .. } => ErrorKind::PersistenceFailure,
            },
            BotError::Io(_) => ErrorKind::PersistenceFailure,
            BotError::Config(_) | BotError::Other(_) => ErrorKind::Internal,
        }
    }

    /// 是否为 checkpoint 编号竞争
    pub fn is_conflict(&self) -> bool {
        matches!(self, BotError::Store(StoreError::Conflict { .. }))
    }

    /// 部分失败时仍然保留下来的对话
    pub fn recorded_turns(&self) -> Option<&[Turn]> {
        match self {
            BotError::Session(SessionError::ReplyFailed { turns, .. })
            | BotError::Session(SessionError::PersistFailed { turns, .. }) => Some(turns),
            _ => None,
        }
    }
}

fn format_origin(n: &Option<u64>) -> String {
    match n {
        Some(n) => format!("checkpoint {}", n),
        None => "fresh".to_string(),
    }
}

// 实现 Display trait
impl fmt::Display for BotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BotError::Llm(e) => write!(f, "LLM Error: {}", e),
            BotError::Store(e) => write!(f, "Store Error: {}", e),
            BotError::Session(e) => write!(f, "Session Error: {}", e),
            BotError::Config(e) => write!(f, "Config Error: {}", e),
            BotError::Io(e) => write!(f, "IO Error: {}", e),
            BotError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            LlmError::ApiError { status, message } => {
                write!(f, "API error (status {}): {}", status, message)
            }
            LlmError::InvalidResponse(msg) => write!(f, "Invalid response: {}", msg),
            LlmError::EmptyResponse => write!(f, "Empty response from LLM"),
            LlmError::StreamInterrupted(msg) => write!(f, "Stream interrupted: {}", msg),
            LlmError::Timeout(secs) => write!(f, "No reply within {}s", secs),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::CheckpointNotFound {
                bot_id,
                checkpoint_number,
            } => write!(
                f,
                "Checkpoint {} not found for bot {}",
                checkpoint_number, bot_id
            ),
            StoreError::NoCheckpoints(bot_id) => write!(f, "Bot {} has no checkpoints", bot_id),
            StoreError::Conflict {
                bot_id,
                checkpoint_number,
            } => write!(
                f,
                "Checkpoint number {} already taken for bot {}",
                checkpoint_number, bot_id
            ),
            StoreError::EmptyPatch => write!(f, "No fields to update"),
            StoreError::IoError(msg) => write!(f, "Storage IO failed: {}", msg),
            StoreError::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::BotNotFound(id) => write!(f, "Bot {} not found", id),
            SessionError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            SessionError::ResumeConflict {
                bot_id,
                active,
                requested,
            } => write!(
                f,
                "Bot {} already has an active session from {}, requested {}",
                bot_id,
                format_origin(active),
                format_origin(requested)
            ),
            SessionError::ReplyFailed { bot_id, cause, .. } => write!(
                f,
                "Message recorded for bot {} but no reply was produced: {}",
                bot_id, cause
            ),
            SessionError::PersistFailed {
                bot_id,
                attempts,
                cause,
                ..
            } => write!(
                f,
                "Session of bot {} kept in memory, checkpoint not saved after {} attempts: {}",
                bot_id, attempts, cause
            ),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => write!(f, "Config file not found: {}", path),
            ConfigError::ParseFailed(msg) => write!(f, "Failed to parse config: {}", msg),
            ConfigError::EnvFormatError(key) => {
                write!(f, "Malformed model env var: {}", key)
            }
            ConfigError::UnknownKey { key, env } => {
                write!(f, "Unknown model config key '{}' in {}", key, env)
            }
            ConfigError::MissingField { model_id, field } => {
                write!(f, "Model '{}' is missing '{}'", model_id, field)
            }
            ConfigError::ModelNotFound(model) => write!(f, "Model '{}' is not configured", model),
            ConfigError::InvalidValue { field, message } => {
                write!(f, "Invalid config value for '{}': {}", field, message)
            }
        }
    }
}

// 实现 std::error::Error trait
impl std::error::Error for BotError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BotError::Io(e) => Some(e),
            BotError::Session(SessionError::ReplyFailed { cause, .. })
            | BotError::Session(SessionError::PersistFailed { cause, .. }) => Some(cause.as_ref()),
            _ => None,
        }
    }
}

impl std::error::Error for LlmError {}
impl std::error::Error for StoreError {}
impl std::error::Error for SessionError {}
impl std::error::Error for ConfigError {}

// From 转换实现
impl From<std::io::Error> for BotError {
    fn from(err: std::io::Error) -> Self {
        BotError::Io(err)
    }
}

impl From<reqwest::Error> for BotError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BotError::Llm(LlmError::NetworkError("Request timeout".to_string()))
        } else if err.is_connect() {
            BotError::Llm(LlmError::NetworkError(format!(
                "Connection failed: {}",
                err
            )))
        } else {
            BotError::Llm(LlmError::NetworkError(err.to_string()))
        }
    }
}

impl From<serde_json::Error> for BotError {
    fn from(err: serde_json::Error) -> Self {
        BotError::Store(StoreError::SerializationError(err.to_string()))
    }
}

impl From<serde_yaml::Error> for BotError {
    fn from(err: serde_yaml::Error) -> Self {
        BotError::Config(ConfigError::ParseFailed(err.to_string()))
    }
}

impl From<LlmError> for BotError {
    fn from(err: LlmError) -> Self {
        BotError::Llm(err)
    }
}

impl From<StoreError> for BotError {
    fn from(err: StoreError) -> Self {
        BotError::Store(err)
    }
}

impl From<SessionError> for BotError {
    fn from(err: SessionError) -> Self {
        BotError::Session(err)
    }
}

impl From<ConfigError> for BotError {
    fn from(err: ConfigError) -> Self {
        BotError::Config(err)
    }
}

// 便捷的 Result 类型别名
pub type Result<T> = std::result::Result<T, BotError>;
