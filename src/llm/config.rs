//! LLM 配置加载
//!
//! 从环境变量读取模型配置，格式：
//! ```text
//! BOT_MODEL_<ID>_MODEL=gpt-4o
//! BOT_MODEL_<ID>_BASEURL=https://api.openai.com/v1/chat/completions
//! BOT_MODEL_<ID>_APIKEY=sk-...
//! ```
//! `<ID>` 为自定义标识（如 `GPT4O`、`QWEN`），不区分大小写。

use crate::error::{ConfigError, Result};
use dotenv::dotenv;
use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;

const PREFIX: &str = "BOT_MODEL_";

/// 单个模型的连接配置
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ModelConfig {
    /// LLM 接口中使用的模型名（如 `gpt-4o`）
    pub model: String,
    /// Chat Completions 接口完整 URL
    pub baseurl: String,
    pub apikey: String,
}

/// 所有已加载的模型配置表（key = model 字段值）
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct LlmConfig {
    pub models: HashMap<String, ModelConfig>,
}

impl LlmConfig {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Self> {
        let mut model_configs: HashMap<String, HashMap<String, String>> = HashMap::new();
        for (key, value) in vars {
            if let Some(suffix) = key.strip_prefix(PREFIX) {
                let parts: Vec<&str> = suffix.split('_').collect();
                if parts.len() != 2 {
                    return Err(ConfigError::EnvFormatError(key).into());
                }
                let model_id = parts[0].to_lowercase();
                let config_key = parts[1].to_lowercase();

                match config_key.as_str() {
                    "model" | "baseurl" | "apikey" => {}
                    _ => {
                        return Err(ConfigError::UnknownKey {
                            key: config_key,
                            env: key,
                        }
                        .into());
                    }
                }
                model_configs
                    .entry(model_id)
                    .or_default()
                    .insert(config_key, value);
            }
        }

        let mut models = HashMap::new();
        for (model_id, config_map) in model_configs {
            let field = |name: &str| -> Result<String> {
                config_map.get(name).cloned().ok_or_else(|| {
                    ConfigError::MissingField {
                        model_id: model_id.clone(),
                        field: name.to_string(),
                    }
                    .into()
                })
            };
            let model = field("model")?;
            let baseurl = field("baseurl")?;
            let apikey = field("apikey")?;
            models.insert(
                model.clone(),
                ModelConfig {
                    model,
                    baseurl,
                    apikey,
                },
            );
        }

        Ok(Self { models })
    }

    pub fn get_model(&self, model: &str) -> Result<ModelConfig> {
        self.models
            .get(model)
            .cloned()
            .ok_or_else(|| ConfigError::ModelNotFound(model.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_from_vars_groups_by_id() -> Result<()> {
        let config = LlmConfig::from_vars(vars(&[
            ("BOT_MODEL_QWEN_MODEL", "qwen3-max"),
            ("BOT_MODEL_QWEN_BASEURL", "http://localhost/v1/chat/completions"),
            ("BOT_MODEL_QWEN_APIKEY", "sk-test"),
            ("PATH", "/usr/bin"),
        ]))?;
        let model = config.get_model("qwen3-max")?;
        assert_eq!(model.apikey, "sk-test");
        assert!(config.get_model("gpt-4o").is_err());
        Ok(())
    }

    #[test]
    fn test_malformed_vars_are_rejected() {
        assert!(LlmConfig::from_vars(vars(&[("BOT_MODEL_QWEN", "x")])).is_err());
        assert!(LlmConfig::from_vars(vars(&[("BOT_MODEL_QWEN_TOKEN", "x")])).is_err());
        assert!(LlmConfig::from_vars(vars(&[("BOT_MODEL_QWEN_MODEL", "x")])).is_err());
    }
}
