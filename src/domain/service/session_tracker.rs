//! 会话绑定：连接 ID 到用户名的索引
//!
//! 断连路径靠它做反向解析，替代对在线表的 O(n) 扫描。
//! 一个连接至多绑定一个用户名；一个用户名可以有多个活跃连接（多标签页）。

use dashmap::DashMap;
use tracing::debug;

/// 连接绑定跟踪器
#[derive(Default)]
pub struct SessionTracker {
    bindings: DashMap<String, String>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 建立/覆盖绑定
    pub fn bind(&self, connection_id: &str, username: &str) {
        self.bindings
            .insert(connection_id.to_string(), username.to_string());
        debug!(connection_id = %connection_id, user = %username, "Session bound");
    }

    /// 反向解析；未知连接返回 None
    pub fn resolve(&self, connection_id: &str) -> Option<String> {
        self.bindings.get(connection_id).map(|e| e.value().clone())
    }

    /// 幂等解绑；未知连接是 no-op
    pub fn unbind(&self, connection_id: &str) -> Option<String> {
        let removed = self.bindings.remove(connection_id).map(|(_, user)| user);
        if let Some(ref user) = removed {
            debug!(connection_id = %connection_id, user = %user, "Session unbound");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
