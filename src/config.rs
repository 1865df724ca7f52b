//! 服务配置（YAML）
//!
//! ```yaml
//! default_model: qwen3-max
//! store:
//!   path: ~/.bot-session/checkpoints.json
//! session:
//!   persist_attempts: 3
//!   retry_backoff_ms: 200
//!   reply_timeout_secs: 120
//! bots:
//!   - id: 7
//!     name: helper
//!     default_system_prompt: 你是一个乐于助人的助手。
//!     orchestrator_bot: false
//! ```

use crate::bot::Bot;
use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String {
    "~/.bot-session/checkpoints.json".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SessionConfig {
    /// 结束会话时持久化的最大尝试次数
    #[serde(default = "default_persist_attempts")]
    pub persist_attempts: u32,
    /// 两次尝试之间的退避基数（毫秒，线性递增）
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// AgentRuntime 单次调用的超时，不设置则一直等待
    #[serde(default)]
    pub reply_timeout_secs: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            persist_attempts: default_persist_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            reply_timeout_secs: None,
        }
    }
}

fn default_persist_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    200
}

impl SessionConfig {
    pub fn reply_timeout(&self) -> Option<Duration> {
        self.reply_timeout_secs.map(Duration::from_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    /// bot 未指定模型时使用
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub bots: Vec<Bot>,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let file = std::fs::File::open(expand_tilde(Path::new(path)))
            .map_err(|_| ConfigError::FileNotFound(path.to_string()))?;
        let config: Config = serde_yaml::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.session.persist_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "session.persist_attempts".to_string(),
                message: "must be at least 1".to_string(),
            }
            .into());
        }
        let mut seen = std::collections::HashSet::new();
        for bot in &self.bots {
            if !seen.insert(bot.id) {
                return Err(ConfigError::InvalidValue {
                    field: "bots".to_string(),
                    message: format!("duplicate bot id {}", bot.id),
                }
                .into());
            }
        }
        Ok(())
    }
}

/// 展开 `~/` 前缀
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())
        {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_sections() -> Result<()> {
        let config = Config::from_yaml("bots: []")?;
        assert_eq!(config.session.persist_attempts, 3);
        assert_eq!(config.session.reply_timeout(), None);
        assert!(config.store.path.ends_with("checkpoints.json"));
        Ok(())
    }

    #[test]
    fn test_parse_bots() -> Result<()> {
        let config = Config::from_yaml(
            r#"
default_model: qwen3-max
session:
  reply_timeout_secs: 30
bots:
  - id: 7
    name: helper
    default_system_prompt: be nice
"#,
        )?;
        assert_eq!(config.bots.len(), 1);
        assert_eq!(config.bots[0].id, 7);
        assert!(!config.bots[0].orchestrator_bot);
        assert_eq!(config.session.reply_timeout(), Some(Duration::from_secs(30)));
        Ok(())
    }

    #[test]
    fn test_rejects_zero_attempts_and_duplicate_bots() {
        assert!(Config::from_yaml("session:\n  persist_attempts: 0").is_err());
        let dup = "bots:\n  - {id: 1, name: a}\n  - {id: 1, name: b}";
        assert!(Config::from_yaml(dup).is_err());
    }
}
