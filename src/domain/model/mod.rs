//! 领域模型
//!
//! 在线状态、会话绑定、聊天消息、DM 会话与随机匹配的核心数据结构。
//! 所有时间戳均由服务端生成，消息上的发送者永远来自已认证的连接上下文。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 在线状态（offline 不是状态值：离线即记录不存在）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Online,
    Away,
    Busy,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Online => "online",
            UserStatus::Away => "away",
            UserStatus::Busy => "busy",
        }
    }

    /// 解析客户端提交的状态值；未知值返回 None（调用方负责拒绝）
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "online" => Some(UserStatus::Online),
            "away" => Some(UserStatus::Away),
            "busy" => Some(UserStatus::Busy),
            _ => None,
        }
    }

    pub fn all() -> [UserStatus; 3] {
        [UserStatus::Online, UserStatus::Away, UserStatus::Busy]
    }
}

/// 在线用户记录：每个用户名至多一条，连接时创建、断连/超时清扫时删除
#[derive(Clone, Debug, Serialize)]
pub struct PresenceRecord {
    pub username: String,
    pub display_name: String,
    pub user_id: i64,
    pub status: UserStatus,
    pub last_active: DateTime<Utc>,
    /// 最近一次建立的连接（多标签页时为 last-write-wins）
    pub connection_id: String,
}

impl PresenceRecord {
    pub fn new(username: &str, display_name: &str, user_id: i64, connection_id: &str) -> Self {
        Self {
            username: username.to_string(),
            display_name: display_name.to_string(),
            user_id,
            status: UserStatus::Online,
            last_active: Utc::now(),
            connection_id: connection_id.to_string(),
        }
    }

    pub fn touch(&mut self) {
        self.last_active = Utc::now();
    }
}

/// 好友状态变更广播的载荷（发布到 `friend-status` 主题）
#[derive(Clone, Debug, Serialize)]
pub struct StatusEvent {
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub user_id: i64,
    pub username: String,
    pub display_name: String,
    pub is_online: bool,
    pub status: String,
}

impl StatusEvent {
    pub const EVENT_TYPE: &'static str = "friend_status_change";
}

/// 用户目录返回的身份信息
#[derive(Clone, Debug, Serialize)]
pub struct UserIdentity {
    pub user_id: i64,
    pub username: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

/// 房间类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RoomKind {
    Private,
    Group,
    /// 随机匹配引擎创建的临时私聊房间
    Random,
}

/// 聊天消息类型：JOIN/LEAVE 为系统合成消息，不转发客户端内容
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    Chat,
    Join,
    Leave,
}

/// 房间聊天消息；sender 与 timestamp 永远由服务端填充
#[derive(Clone, Debug, Serialize)]
pub struct ChatMessage {
    pub room_id: String,
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub kind: MessageKind,
}

impl ChatMessage {
    pub fn chat(room_id: &str, sender: &str, content: &str) -> Self {
        Self {
            room_id: room_id.to_string(),
            sender: sender.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            kind: MessageKind::Chat,
        }
    }

    /// 入场系统消息（固定模板）
    pub fn join(room_id: &str, username: &str) -> Self {
        Self {
            room_id: room_id.to_string(),
            sender: "system".to_string(),
            content: format!("{username} joined the chat"),
            timestamp: Utc::now(),
            kind: MessageKind::Join,
        }
    }

    /// 退场系统消息（固定模板）
    pub fn leave(room_id: &str, username: &str) -> Self {
        Self {
            room_id: room_id.to_string(),
            sender: "system".to_string(),
            content: format!("{username} left the chat"),
            timestamp: Utc::now(),
            kind: MessageKind::Leave,
        }
    }
}

/// 1:1 DM 会话。参与者按稳定键排序，保证 (a,b) 与 (b,a) 查到同一会话。
#[derive(Clone, Debug, Serialize)]
pub struct Conversation {
    pub id: String,
    pub user_low: String,
    pub user_high: String,
    pub last_message: Option<String>,
    pub last_sender: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    /// 按用户名记录的未读数
    pub unread_counts: HashMap<String, u32>,
    /// 按用户名记录的最近已读时间
    pub last_read_at: HashMap<String, DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// 规范化参与者顺序（字典序小者在前）
    pub fn canonical_pair(a: &str, b: &str) -> (String, String) {
        if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        }
    }

    pub fn new(a: &str, b: &str) -> Self {
        let (user_low, user_high) = Self::canonical_pair(a, b);
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_low,
            user_high,
            last_message: None,
            last_sender: None,
            last_message_at: None,
            unread_counts: HashMap::new(),
            last_read_at: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn involves(&self, username: &str) -> bool {
        self.user_low == username || self.user_high == username
    }

    pub fn other_user(&self, username: &str) -> Option<&str> {
        if self.user_low == username {
            Some(&self.user_high)
        } else if self.user_high == username {
            Some(&self.user_low)
        } else {
            None
        }
    }
}

/// DM 消息的扇出载荷（不落库，仅投递）
#[derive(Clone, Debug, Serialize)]
pub struct DirectMessagePayload {
    pub message_id: String,
    pub conversation_id: String,
    pub sender: String,
    pub recipient: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

/// 匹配状态机：Active 是唯一非终态，终态之间不可迁移
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MatchStatus {
    Active,
    Ended,
    Abandoned,
    Timeout,
}

impl MatchStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, MatchStatus::Active)
    }
}

/// 随机匹配记录
#[derive(Clone, Debug, Serialize)]
pub struct Match {
    pub id: String,
    pub user_a: String,
    pub user_b: String,
    pub room_id: String,
    pub status: MatchStatus,
    pub matched_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub ended_by: Option<String>,
    pub duration_minutes: Option<i64>,
    pub message_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Match {
    pub fn new(id: &str, user_a: &str, user_b: &str, room_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            user_a: user_a.to_string(),
            user_b: user_b.to_string(),
            room_id: room_id.to_string(),
            status: MatchStatus::Active,
            matched_at: now,
            ended_at: None,
            ended_by: None,
            duration_minutes: None,
            message_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn involves(&self, username: &str) -> bool {
        self.user_a == username || self.user_b == username
    }

    pub fn other_user(&self, username: &str) -> Option<&str> {
        if self.user_a == username {
            Some(&self.user_b)
        } else if self.user_b == username {
            Some(&self.user_a)
        } else {
            None
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == MatchStatus::Active
    }

    /// 迁移到终态并结算时长；对已终止的匹配是 no-op（终态不可逆）
    pub fn finish(&mut self, status: MatchStatus, ended_by: Option<&str>) {
        if self.status.is_terminal() || !status.is_terminal() {
            return;
        }
        let now = Utc::now();
        self.status = status;
        self.ended_at = Some(now);
        self.ended_by = ended_by.map(|u| u.to_string());
        self.duration_minutes = Some((now - self.matched_at).num_minutes());
        self.updated_at = now;
    }

    /// 仅在 Active 状态下递增消息数
    pub fn increment_message_count(&mut self) {
        if self.is_active() {
            self.message_count += 1;
            self.updated_at = Utc::now();
        }
    }
}

/// 匹配统计聚合
#[derive(Clone, Debug, Default, Serialize)]
pub struct MatchingStatistics {
    pub active_matches: usize,
    pub total_matches: usize,
    pub average_duration_minutes: Option<f64>,
    pub average_message_count: Option<f64>,
    pub today_matches: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_pair_is_symmetric() {
        assert_eq!(
            Conversation::canonical_pair("bob", "alice"),
            Conversation::canonical_pair("alice", "bob")
        );
    }

    #[test]
    fn match_terminal_state_never_reverts() {
        let mut m = Match::new("m1", "alice", "bob", "room-1");
        m.finish(MatchStatus::Ended, Some("alice"));
        let ended_at = m.ended_at;

        m.finish(MatchStatus::Timeout, None);
        assert_eq!(m.status, MatchStatus::Ended, "terminal transition is final");
        assert_eq!(m.ended_at, ended_at);
    }

    #[test]
    fn message_count_frozen_after_finish() {
        let mut m = Match::new("m1", "alice", "bob", "room-1");
        m.increment_message_count();
        m.finish(MatchStatus::Abandoned, Some("bob"));
        m.increment_message_count();
        assert_eq!(m.message_count, 1);
    }

    #[test]
    fn status_parse_rejects_unknown_values() {
        assert_eq!(UserStatus::parse("away"), Some(UserStatus::Away));
        assert_eq!(UserStatus::parse("offline"), None);
        assert_eq!(UserStatus::parse("BUSY"), None);
    }
}
