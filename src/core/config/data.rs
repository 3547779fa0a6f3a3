use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::session::{SessionSettings, DEFAULT_MAX_MESSAGE_LENGTH};
use crate::core::stream::client::{DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS};
use crate::core::stream::ReconnectPolicy;
use crate::utils::url::is_http_url;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000/api";
pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const MAX_TOKENS_LIMIT: u32 = 4096;

/// Where the encrypted API key lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VaultBackend {
    /// A ciphertext file in the user's data directory.
    #[default]
    File,
    /// The platform keyring.
    Keyring,
    /// Process memory only; nothing survives exit.
    Memory,
}

impl VaultBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            VaultBackend::File => "file",
            VaultBackend::Keyring => "keyring",
            VaultBackend::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Chat service root, e.g. `http://localhost:8000/api`.
    pub base_url: String,
    pub default_model: String,
    /// Identity mixed into the vault key.
    pub user_id: String,
    pub vault_backend: VaultBackend,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub max_message_length: usize,
    /// Instructions given to new conversations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Bearer token for the chat service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            user_id: default_user_id(),
            vault_backend: VaultBackend::default(),
            max_reconnect_attempts: DEFAULT_MAX_ATTEMPTS,
            reconnect_base_delay_ms: DEFAULT_BASE_DELAY.as_millis() as u64,
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            system_prompt: None,
            temperature: None,
            max_tokens: None,
            auth_token: None,
        }
    }
}

fn default_user_id() -> String {
    ["USER", "USERNAME"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .unwrap_or_else(|| "local".to_string())
}

impl Config {
    /// Check value ranges, returning a description of the first problem.
    pub fn validate(&self) -> Result<(), String> {
        if !is_http_url(&self.base_url) {
            return Err(format!(
                "base_url must start with http:// or https:// (got {:?})",
                self.base_url
            ));
        }
        if self.default_model.trim().is_empty() {
            return Err("default_model cannot be empty".to_string());
        }
        if self.user_id.trim().is_empty() {
            return Err("user_id cannot be empty".to_string());
        }
        if self.max_message_length == 0 {
            return Err("max_message_length must be at least 1".to_string());
        }
        if let Some(temperature) = self.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(format!(
                    "temperature must be between 0.0 and 2.0 (got {temperature})"
                ));
            }
        }
        if let Some(max_tokens) = self.max_tokens {
            if !(1..=MAX_TOKENS_LIMIT).contains(&max_tokens) {
                return Err(format!(
                    "max_tokens must be between 1 and {MAX_TOKENS_LIMIT} (got {max_tokens})"
                ));
            }
        }
        Ok(())
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            self.max_reconnect_attempts,
            Duration::from_millis(self.reconnect_base_delay_ms),
        )
    }

    /// Session settings, with `model_override` taking precedence over the
    /// configured default model.
    pub fn session_settings(&self, model_override: Option<&str>) -> SessionSettings {
        SessionSettings {
            model: model_override
                .unwrap_or(self.default_model.as_str())
                .to_string(),
            system_prompt: self.system_prompt.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            max_message_length: self.max_message_length,
            reconnect: self.reconnect_policy(),
        }
    }
}

/// Display a path with the home directory shortened to `~`.
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}
