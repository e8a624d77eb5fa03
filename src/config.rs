//! 核心服务配置
//!
//! 所有周期性清扫与超时阈值都在这里集中配置，
//! 支持从 TOML 文件或环境变量路径加载，缺省值与内置常量一致。

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// 配置文件路径环境变量
pub const CONFIG_PATH_ENV: &str = "EMBER_CHAT_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// 在线记录的空闲超时（秒），超过后被周期清扫视为隐式断连
    pub presence_idle_timeout_secs: u64,
    /// 在线状态清扫间隔（秒）
    pub presence_sweep_interval_secs: u64,
    /// 匹配超时阈值（秒），仅对 message_count == 0 的匹配生效
    pub match_timeout_secs: u64,
    /// 匹配超时清扫间隔（秒）
    pub match_sweep_interval_secs: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            presence_idle_timeout_secs: 1800,
            presence_sweep_interval_secs: 60,
            match_timeout_secs: 1800,
            match_sweep_interval_secs: 60,
        }
    }
}

impl CoreConfig {
    /// 从 TOML 文件加载配置
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: CoreConfig = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// 加载配置：优先读取 `EMBER_CHAT_CONFIG` 指向的文件，否则使用缺省值
    pub fn load() -> Result<Self> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.is_empty() => Self::from_path(path),
            _ => Ok(Self::default()),
        }
    }

    pub fn presence_idle_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.presence_idle_timeout_secs as i64)
    }

    pub fn match_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.match_timeout_secs as i64)
    }
}
