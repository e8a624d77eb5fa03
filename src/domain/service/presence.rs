//! 在线状态目录
//!
//! 进程内唯一的在线用户权威表：启动时为空，进程退出即全部丢失。
//! 单进程假设是刻意的取舍；水平扩展时应将该表外置到以用户名为键的
//! 共享存储，这里不做。
//!
//! 并发模型：仅要求按键原子性（每个用户名独立更新），没有任何跨条目
//! 不变量，因此不加全局锁。状态变更通过扇出路由器发布到全局主题；
//! 心跳只刷新活跃时间、绝不广播，避免轮询造成的广播风暴。

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::domain::model::{PresenceRecord, StatusEvent, UserStatus};
use crate::domain::repository::{FriendshipGraph, UserDirectory};
use crate::domain::service::session_tracker::SessionTracker;
use crate::infrastructure::messaging::{FanoutRouter, FRIEND_STATUS_TOPIC, ONLINE_COUNT_TOPIC};

/// 在线状态目录
pub struct PresenceDirectory {
    records: DashMap<String, PresenceRecord>,
    sessions: Arc<SessionTracker>,
    users: Arc<dyn UserDirectory>,
    friends: Arc<dyn FriendshipGraph>,
    router: Arc<FanoutRouter>,
}

impl PresenceDirectory {
    pub fn new(
        sessions: Arc<SessionTracker>,
        users: Arc<dyn UserDirectory>,
        friends: Arc<dyn FriendshipGraph>,
        router: Arc<FanoutRouter>,
    ) -> Self {
        Self {
            records: DashMap::new(),
            sessions,
            users,
            friends,
            router,
        }
    }

    /// 上线：插入/覆盖在线记录并广播状态变更。
    /// 用户目录查不到的用户名是 no-op（不报错，也不发事件）。
    pub async fn set_online(&self, username: &str, connection_id: &str) -> Result<()> {
        let Some(identity) = self.users.find_by_username(username).await? else {
            warn!(user = %username, "set_online for unknown user, ignoring");
            return Ok(());
        };

        let record = PresenceRecord::new(
            username,
            &identity.display_name,
            identity.user_id,
            connection_id,
        );
        let event = self.status_event(&record, true);
        self.records.insert(username.to_string(), record);
        info!(user = %username, connection_id = %connection_id, "User online");

        self.publish_status(event);
        self.broadcast_online_count();
        Ok(())
    }

    /// 下线：删除记录并广播；记录不存在则什么都不发生
    pub fn set_offline(&self, username: &str) {
        if let Some((_, record)) = self.records.remove(username) {
            info!(user = %username, "User offline");
            self.publish_offline(&record);
            self.broadcast_online_count();
        }
    }

    /// 按连接 ID 下线：经会话绑定索引解析，未知连接是 no-op
    pub fn set_offline_by_connection(&self, connection_id: &str) {
        if let Some(username) = self.sessions.resolve(connection_id) {
            self.set_offline(&username);
        }
    }

    /// 状态切换（online/away/busy）：记录不存在时 no-op
    pub fn update_status(&self, username: &str, status: UserStatus) {
        let event = match self.records.get_mut(username) {
            Some(mut record) => {
                record.status = status;
                record.touch();
                debug!(user = %username, status = %status.as_str(), "Status updated");
                self.status_event(&record, true)
            }
            None => return,
        };
        self.publish_status(event);
    }

    /// 心跳：只刷新活跃时间。没有在线记录时绝不创建、也绝不广播。
    pub fn heartbeat(&self, username: &str) {
        if let Some(mut record) = self.records.get_mut(username) {
            record.touch();
        }
    }

    pub fn is_online(&self, username: &str) -> bool {
        self.records.contains_key(username)
    }

    pub fn get(&self, username: &str) -> Option<PresenceRecord> {
        self.records.get(username).map(|r| r.clone())
    }

    pub fn all(&self) -> Vec<PresenceRecord> {
        self.records.iter().map(|r| r.clone()).collect()
    }

    /// 状态字符串；离线（无记录）返回 "offline"
    pub fn status_of(&self, username: &str) -> String {
        self.records
            .get(username)
            .map(|r| r.status.as_str().to_string())
            .unwrap_or_else(|| "offline".to_string())
    }

    /// 在线好友：把 all() 经好友关系图过滤
    pub async fn online_friends_of(&self, username: &str) -> Result<Vec<PresenceRecord>> {
        let friends = self.friends.friends_of(username).await?;
        Ok(friends
            .iter()
            .filter_map(|friend| self.get(friend))
            .collect())
    }

    pub fn online_count(&self) -> usize {
        self.records.len()
    }

    /// 按状态统计；三个状态键总是存在
    pub fn count_by_status(&self) -> HashMap<&'static str, usize> {
        let mut counts: HashMap<&'static str, usize> =
            UserStatus::all().iter().map(|s| (s.as_str(), 0)).collect();
        for record in self.records.iter() {
            *counts.entry(record.status.as_str()).or_insert(0) += 1;
        }
        counts
    }

    /// 周期清扫：活跃时间早于 cutoff 的记录按隐式断连处理。
    ///
    /// 删除用条件原子完成：清扫评估期间恰好重连（刷新了活跃时间）的
    /// 用户不会被误删。返回被清掉的用户名。
    pub fn cleanup_inactive(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        let stale: Vec<String> = self
            .records
            .iter()
            .filter(|r| r.last_active < cutoff)
            .map(|r| r.username.clone())
            .collect();

        let mut removed = Vec::new();
        for username in stale {
            if let Some((_, record)) = self
                .records
                .remove_if(&username, |_, r| r.last_active < cutoff)
            {
                info!(user = %username, "Inactive user swept offline");
                // 残留的会话绑定一并清掉，避免断连索引泄漏
                self.sessions.unbind(&record.connection_id);
                // 与 set_offline 完全一致：每清掉一个用户发一组广播
                self.publish_offline(&record);
                self.broadcast_online_count();
                removed.push(username);
            }
        }
        removed
    }

    fn status_event(&self, record: &PresenceRecord, is_online: bool) -> StatusEvent {
        StatusEvent {
            event_type: StatusEvent::EVENT_TYPE,
            user_id: record.user_id,
            username: record.username.clone(),
            display_name: record.display_name.clone(),
            is_online,
            status: if is_online {
                record.status.as_str().to_string()
            } else {
                "offline".to_string()
            },
        }
    }

    fn publish_offline(&self, record: &PresenceRecord) {
        let event = self.status_event(record, false);
        self.publish_status(event);
    }

    fn publish_status(&self, event: StatusEvent) {
        match serde_json::to_value(&event) {
            Ok(payload) => {
                self.router.publish(FRIEND_STATUS_TOPIC, &payload);
            }
            Err(err) => warn!(error = %err, "Failed to serialize status event"),
        }
    }

    fn broadcast_online_count(&self) {
        let payload = json!({
            "type": "online_count_update",
            "total_count": self.online_count(),
            "status_counts": self.count_by_status(),
        });
        self.router.publish(ONLINE_COUNT_TOPIC, &payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::memory::{InMemoryFriendshipGraph, InMemoryUserDirectory};
    use serde_json::Value;
    use tokio::sync::mpsc;

    struct Fixture {
        presence: PresenceDirectory,
        sessions: Arc<SessionTracker>,
        router: Arc<FanoutRouter>,
        friends: Arc<InMemoryFriendshipGraph>,
    }

    fn fixture(usernames: &[&str]) -> Fixture {
        let users = Arc::new(InMemoryUserDirectory::new());
        for (i, name) in usernames.iter().enumerate() {
            users.add_user(i as i64 + 1, name, name, None);
        }
        let friends = Arc::new(InMemoryFriendshipGraph::new());
        let sessions = Arc::new(SessionTracker::new());
        let router = Arc::new(FanoutRouter::new());
        let presence = PresenceDirectory::new(
            sessions.clone(),
            users,
            friends.clone(),
            router.clone(),
        );
        Fixture {
            presence,
            sessions,
            router,
            friends,
        }
    }

    /// 注册一个订阅了状态主题的探针连接，用于断言事件发布
    fn status_probe(router: &FanoutRouter) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        router.register("probe", "probe", tx);
        router.subscribe(FRIEND_STATUS_TOPIC, "probe");
        router.subscribe(ONLINE_COUNT_TOPIC, "probe");
        rx
    }

    #[tokio::test]
    async fn one_record_per_username() {
        let f = fixture(&["alice"]);
        f.presence.set_online("alice", "c1").await.unwrap();
        f.presence.set_online("alice", "c2").await.unwrap();

        assert_eq!(f.presence.all().len(), 1);
        let record = f.presence.get("alice").unwrap();
        assert_eq!(record.connection_id, "c2", "last connection wins");
    }

    #[tokio::test]
    async fn set_online_publishes_status_and_count() {
        let f = fixture(&["alice"]);
        let mut probe = status_probe(&f.router);

        f.presence.set_online("alice", "c1").await.unwrap();

        let event = probe.recv().await.unwrap();
        assert_eq!(event["type"], "friend_status_change");
        assert_eq!(event["is_online"], true);
        assert_eq!(event["status"], "online");
        let count = probe.recv().await.unwrap();
        assert_eq!(count["type"], "online_count_update");
        assert_eq!(count["total_count"], 1);
    }

    #[tokio::test]
    async fn unknown_user_online_is_silent_noop() {
        let f = fixture(&[]);
        let mut probe = status_probe(&f.router);

        f.presence.set_online("ghost", "c1").await.unwrap();
        assert!(!f.presence.is_online("ghost"));
        assert!(probe.try_recv().is_err(), "no event for unknown user");
    }

    #[tokio::test]
    async fn offline_by_unknown_connection_is_noop() {
        let f = fixture(&["alice"]);
        f.presence.set_online("alice", "c1").await.unwrap();
        let mut probe = status_probe(&f.router);

        f.presence.set_offline_by_connection("unknown-conn");
        assert!(f.presence.is_online("alice"));
        assert!(probe.try_recv().is_err());
    }

    #[tokio::test]
    async fn offline_by_connection_uses_binding_index() {
        let f = fixture(&["alice"]);
        f.sessions.bind("c1", "alice");
        f.presence.set_online("alice", "c1").await.unwrap();

        f.presence.set_offline_by_connection("c1");
        assert!(!f.presence.is_online("alice"));
    }

    #[tokio::test]
    async fn heartbeat_never_creates_records_or_events() {
        let f = fixture(&["alice"]);
        let mut probe = status_probe(&f.router);

        for _ in 0..3 {
            f.presence.heartbeat("alice");
        }
        assert!(!f.presence.is_online("alice"));
        assert!(probe.try_recv().is_err(), "heartbeat must stay silent");
    }

    #[tokio::test]
    async fn heartbeat_refreshes_activity() {
        let f = fixture(&["alice"]);
        f.presence.set_online("alice", "c1").await.unwrap();
        let before = f.presence.get("alice").unwrap().last_active;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        f.presence.heartbeat("alice");
        assert!(f.presence.get("alice").unwrap().last_active > before);
    }

    #[tokio::test]
    async fn update_status_republishes_with_new_status() {
        let f = fixture(&["alice"]);
        f.presence.set_online("alice", "c1").await.unwrap();
        let mut probe = status_probe(&f.router);

        f.presence.update_status("alice", UserStatus::Busy);
        let event = probe.recv().await.unwrap();
        assert_eq!(event["status"], "busy");
        assert_eq!(event["is_online"], true);

        // 不存在的用户是 no-op
        f.presence.update_status("ghost", UserStatus::Away);
        assert_eq!(f.presence.status_of("ghost"), "offline");
    }

    #[tokio::test]
    async fn count_by_status_presets_all_statuses() {
        let f = fixture(&["alice", "bob"]);
        f.presence.set_online("alice", "c1").await.unwrap();
        f.presence.set_online("bob", "c2").await.unwrap();
        f.presence.update_status("bob", UserStatus::Away);

        let counts = f.presence.count_by_status();
        assert_eq!(counts["online"], 1);
        assert_eq!(counts["away"], 1);
        assert_eq!(counts["busy"], 0);
    }

    #[tokio::test]
    async fn online_friends_filters_through_graph() {
        let f = fixture(&["alice", "bob", "carol"]);
        f.friends.add_friend("alice", "bob");
        f.presence.set_online("alice", "c1").await.unwrap();
        f.presence.set_online("bob", "c2").await.unwrap();
        f.presence.set_online("carol", "c3").await.unwrap();

        let online = f.presence.online_friends_of("alice").await.unwrap();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].username, "bob");
    }

    #[tokio::test]
    async fn cleanup_broadcasts_per_removed_user() {
        let f = fixture(&["alice", "bob"]);
        f.presence.set_online("alice", "c1").await.unwrap();
        f.presence.set_online("bob", "c2").await.unwrap();
        let mut probe = status_probe(&f.router);

        let removed = f.presence.cleanup_inactive(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(removed.len(), 2);

        // 每清掉一个用户：一条下线事件跟一次人数广播，与显式下线一致
        for expected_total in [1u64, 0] {
            let event = probe.recv().await.unwrap();
            assert_eq!(event["is_online"], false);
            let count = probe.recv().await.unwrap();
            assert_eq!(count["total_count"], expected_total);
        }
    }

    #[tokio::test]
    async fn cleanup_only_removes_stale_records() {
        let f = fixture(&["alice", "bob"]);
        f.sessions.bind("c1", "alice");
        f.presence.set_online("alice", "c1").await.unwrap();
        f.presence.set_online("bob", "c2").await.unwrap();

        // alice 的活跃时间人为调旧
        f.presence
            .records
            .get_mut("alice")
            .unwrap()
            .last_active = Utc::now() - chrono::Duration::minutes(45);

        let removed = f.presence.cleanup_inactive(Utc::now() - chrono::Duration::minutes(30));
        assert_eq!(removed, vec!["alice".to_string()]);
        assert!(!f.presence.is_online("alice"));
        assert!(f.presence.is_online("bob"));
        assert!(f.sessions.resolve("c1").is_none(), "stale binding removed");
    }
}
