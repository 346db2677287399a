//! Process configuration, read once at startup from the environment.

use std::path::PathBuf;

use crate::error::{Error, Result};

/// Runtime configuration for the server and its sessions.
#[derive(Debug, Clone)]
pub struct Config {
    /// API key for the chat-completion provider (`OPENAI_API_KEY`).
    pub api_key: String,
    /// Optional base-URL override (`OPENAI_BASE_URL`).
    pub base_url: Option<String>,
    /// Model for policy and synthesis calls (`POLICY_MODEL`).
    pub policy_model: String,
    /// Small model for LLM-as-judge evaluation (`JUDGE_MODEL`).
    pub judge_model: String,
    /// Model exposed to sandboxed code as `llm_query` (`SUB_LLM_MODEL`).
    pub sub_model: String,
    /// Listen address (`BIND_ADDR`).
    pub bind_addr: String,
    /// Scored training records for rubric discovery (`RUBRIC_TRAIN_PATH`).
    pub rubric_train_path: Option<PathBuf>,
    /// Scored eval records for rubric discovery (`RUBRIC_EVAL_PATH`).
    pub rubric_eval_path: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| Error::Config("OPENAI_API_KEY is not set".to_string()))?;

        Ok(Self {
            api_key,
            base_url: std::env::var("OPENAI_BASE_URL").ok(),
            policy_model: env_or("POLICY_MODEL", "gpt-4o"),
            judge_model: env_or("JUDGE_MODEL", "gpt-4o-mini"),
            sub_model: env_or("SUB_LLM_MODEL", "gpt-4o-mini"),
            bind_addr: env_or("BIND_ADDR", "0.0.0.0:8000"),
            rubric_train_path: std::env::var("RUBRIC_TRAIN_PATH").ok().map(PathBuf::from),
            rubric_eval_path: std::env::var("RUBRIC_EVAL_PATH").ok().map(PathBuf::from),
        })
    }

    /// Fixed configuration for tests; no environment reads.
    pub fn for_tests() -> Self {
        Self {
            api_key: "test-key".to_string(),
            base_url: None,
            policy_model: "test-policy".to_string(),
            judge_model: "test-judge".to_string(),
            sub_model: "test-sub".to_string(),
            bind_addr: "127.0.0.1:0".to_string(),
            rubric_train_path: None,
            rubric_eval_path: None,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_tests_is_selfcontained() {
        let config = Config::for_tests();
        assert_eq!(config.judge_model, "test-judge");
        assert!(config.rubric_train_path.is_none());
    }
}
