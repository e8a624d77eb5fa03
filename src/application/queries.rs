//! 只读查询的响应形状
//!
//! 读接口对合法的空结果返回空集合/缺省值，从不报错。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

/// `/status/{username}` 的响应
#[derive(Debug, Clone, Serialize)]
pub struct UserStatusView {
    pub is_online: bool,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_active: Option<DateTime<Utc>>,
}

/// 在线人数统计
#[derive(Debug, Clone, Serialize)]
pub struct OnlineCountView {
    pub total_count: usize,
    pub status_counts: HashMap<&'static str, usize>,
}

/// 匹配设置
#[derive(Debug, Clone, Serialize)]
pub struct MatchingSettingsView {
    pub allow_random_matching: bool,
}
