//! 应用层处理器
//!
//! 传输层（WebSocket/HTTP 适配器）把已认证的连接上下文和反序列化后的
//! 命令交到这里；处理器编排领域服务并把领域错误折叠成
//! `{success, message, ...data}` 形状的响应。

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::application::commands::{
    EndMatch, JoinRoom, LeaveRoom, MarkConversationRead, OpenConversation, SendChatMessage,
    SendDirectMessage, UpdateMatchingSettings, UpdateStatus,
};
use crate::application::queries::{MatchingSettingsView, OnlineCountView, UserStatusView};
use crate::domain::model::{ChatMessage, Conversation, Match, PresenceRecord, UserStatus};
use crate::domain::repository::{ProfileStore, UserDirectory};
use crate::domain::service::conversation::ConversationService;
use crate::domain::service::matching::{MatchOutcome, MatchingEngine};
use crate::domain::service::presence::PresenceDirectory;
use crate::domain::service::session_tracker::SessionTracker;
use crate::error::CoreError;
use crate::infrastructure::messaging::{
    room_topic, FanoutRouter, FRIEND_STATUS_TOPIC, ONLINE_COUNT_TOPIC,
};

/// 已认证连接的上下文；消息上的发送者身份只来自这里
#[derive(Clone, Debug)]
pub struct ConnectionContext {
    pub connection_id: String,
    pub username: String,
}

/// 变更类接口的统一响应
#[derive(Clone, Debug, serde::Serialize)]
pub struct MutationResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl MutationResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            message: None,
            data: None,
        }
    }

    pub fn ok_with(data: Value) -> Self {
        Self {
            success: true,
            message: None,
            data: Some(data),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            data: None,
        }
    }
}

impl From<CoreError> for MutationResponse {
    fn from(err: CoreError) -> Self {
        MutationResponse::fail(err.to_string())
    }
}

/// 命令处理器
pub struct CoreCommandHandler {
    presence: Arc<PresenceDirectory>,
    sessions: Arc<SessionTracker>,
    router: Arc<FanoutRouter>,
    conversations: Arc<ConversationService>,
    matching: Arc<MatchingEngine>,
    users: Arc<dyn UserDirectory>,
    profiles: Arc<dyn ProfileStore>,
}

impl CoreCommandHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        presence: Arc<PresenceDirectory>,
        sessions: Arc<SessionTracker>,
        router: Arc<FanoutRouter>,
        conversations: Arc<ConversationService>,
        matching: Arc<MatchingEngine>,
        users: Arc<dyn UserDirectory>,
        profiles: Arc<dyn ProfileStore>,
    ) -> Self {
        Self {
            presence,
            sessions,
            router,
            conversations,
            matching,
            users,
            profiles,
        }
    }

    /// 连接建立钩子：注册扇出句柄、绑定会话、登记在线状态。
    /// 全局状态主题默认订阅，客户端不需要显式拉取。
    pub async fn on_connect(
        &self,
        connection_id: &str,
        username: &str,
        sender: mpsc::UnboundedSender<Value>,
    ) -> Result<()> {
        self.router.register(connection_id, username, sender);
        self.router.subscribe(FRIEND_STATUS_TOPIC, connection_id);
        self.router.subscribe(ONLINE_COUNT_TOPIC, connection_id);
        self.sessions.bind(connection_id, username);
        self.presence.set_online(username, connection_id).await?;
        info!(connection_id = %connection_id, user = %username, "Connection established");
        Ok(())
    }

    /// 断连钩子。重复或乱序的断连事件是安全的：
    /// 每一步对未知 ID 都是 no-op。
    pub fn on_disconnect(&self, connection_id: &str) {
        self.presence.set_offline_by_connection(connection_id);
        self.sessions.unbind(connection_id);
        self.router.unregister(connection_id);
        info!(connection_id = %connection_id, "Connection closed");
    }

    /// 房间消息。sender 与 timestamp 由服务端构造（见 `ChatMessage::chat`）。
    pub fn chat_send(&self, ctx: &ConnectionContext, cmd: SendChatMessage) -> MutationResponse {
        let message = ChatMessage::chat(&cmd.room_id, &ctx.username, &cmd.content);
        match self.router.send_to_room(&cmd.room_id, &message) {
            Ok(delivered) => {
                // 随机匹配房间的活跃度计数；普通房间在引擎里查不到，静默跳过
                self.matching.increment_message_count(&cmd.room_id);
                MutationResponse::ok_with(json!({ "delivered": delivered }))
            }
            Err(err) => {
                warn!(room_id = %cmd.room_id, error = %err, "Room broadcast failed");
                MutationResponse::fail("Failed to deliver message")
            }
        }
    }

    /// 进入房间：订阅房间主题并广播系统合成的入场消息
    pub fn chat_join(&self, ctx: &ConnectionContext, cmd: JoinRoom) -> MutationResponse {
        if !self.router.subscribe(&room_topic(&cmd.room_id), &ctx.connection_id) {
            return MutationResponse::fail("Connection is not registered");
        }
        let message = ChatMessage::join(&cmd.room_id, &ctx.username);
        if let Err(err) = self.router.send_to_room(&cmd.room_id, &message) {
            warn!(room_id = %cmd.room_id, error = %err, "Join notice failed");
        }
        MutationResponse::ok()
    }

    /// 离开房间：退订并广播退场消息
    pub fn chat_leave(&self, ctx: &ConnectionContext, cmd: LeaveRoom) -> MutationResponse {
        self.router
            .unsubscribe(&room_topic(&cmd.room_id), &ctx.connection_id);
        let message = ChatMessage::leave(&cmd.room_id, &ctx.username);
        if let Err(err) = self.router.send_to_room(&cmd.room_id, &message) {
            warn!(room_id = %cmd.room_id, error = %err, "Leave notice failed");
        }
        MutationResponse::ok()
    }

    pub async fn dm_open(&self, ctx: &ConnectionContext, cmd: OpenConversation) -> MutationResponse {
        match self.conversations.open(&ctx.username, &cmd.peer).await {
            Ok(conversation) => match serde_json::to_value(&conversation) {
                Ok(value) => MutationResponse::ok_with(value),
                Err(err) => MutationResponse::fail(err.to_string()),
            },
            Err(err) => err.into(),
        }
    }

    pub fn dm_send(&self, ctx: &ConnectionContext, cmd: SendDirectMessage) -> MutationResponse {
        match self
            .conversations
            .send(&cmd.conversation_id, &ctx.username, &cmd.content)
        {
            Ok(payload) => MutationResponse::ok_with(json!({
                "message_id": payload.message_id,
                "sent_at": payload.sent_at,
            })),
            Err(err) => err.into(),
        }
    }

    pub fn dm_mark_read(
        &self,
        ctx: &ConnectionContext,
        cmd: MarkConversationRead,
    ) -> MutationResponse {
        match self.conversations.mark_read(&cmd.conversation_id, &ctx.username) {
            Ok(()) => MutationResponse::ok(),
            Err(err) => err.into(),
        }
    }

    /// 状态切换；非法状态值直接拒绝
    pub fn update_status(&self, ctx: &ConnectionContext, cmd: UpdateStatus) -> MutationResponse {
        let Some(status) = UserStatus::parse(&cmd.status) else {
            return MutationResponse::fail(format!("Invalid status: {}", cmd.status));
        };
        self.presence.update_status(&ctx.username, status);
        MutationResponse::ok_with(json!({ "status": status.as_str() }))
    }

    /// 心跳：只刷新活跃时间，永不广播
    pub fn heartbeat(&self, ctx: &ConnectionContext) -> MutationResponse {
        self.presence.heartbeat(&ctx.username);
        MutationResponse::ok_with(json!({ "timestamp": Utc::now().timestamp_millis() }))
    }

    /// 发起随机匹配
    pub async fn match_start(&self, ctx: &ConnectionContext) -> MutationResponse {
        let outcome = match self.matching.find_match(&ctx.username).await {
            Ok(outcome) => outcome,
            Err(err) => return err.into(),
        };

        match outcome {
            MatchOutcome::Matched(record) | MatchOutcome::Existing(record) => {
                let other = record
                    .other_user(&ctx.username)
                    .unwrap_or_default()
                    .to_string();
                let matched_user = match self.users.find_by_username(&other).await {
                    Ok(Some(identity)) => json!({
                        "id": identity.user_id,
                        "username": identity.username,
                        "display_name": identity.display_name,
                    }),
                    _ => json!({ "username": other }),
                };
                MutationResponse::ok_with(json!({
                    "match_id": record.id,
                    "room_id": record.room_id,
                    "matched_user": matched_user,
                }))
            }
            MatchOutcome::NoCandidates => {
                MutationResponse::fail("No eligible candidates are available right now")
            }
            MatchOutcome::NotEligible => {
                MutationResponse::fail("Random matching is not enabled for this profile")
            }
        }
    }

    pub async fn match_end(&self, ctx: &ConnectionContext, cmd: EndMatch) -> MutationResponse {
        match self.matching.end_match(&cmd.match_id, &ctx.username).await {
            Ok(record) => MutationResponse::ok_with(json!({
                "match_id": record.id,
                "status": record.status,
                "duration_minutes": record.duration_minutes,
            })),
            Err(err) => err.into(),
        }
    }

    pub async fn match_leave(&self, ctx: &ConnectionContext) -> MutationResponse {
        match self.matching.leave_match(&ctx.username).await {
            Ok(Some(record)) => MutationResponse::ok_with(json!({
                "match_id": record.id,
                "status": record.status,
            })),
            Ok(None) => MutationResponse::ok(),
            Err(err) => err.into(),
        }
    }

    pub async fn update_matching_settings(
        &self,
        ctx: &ConnectionContext,
        cmd: UpdateMatchingSettings,
    ) -> MutationResponse {
        match self
            .profiles
            .set_matching_enabled(&ctx.username, cmd.allow_random_matching)
            .await
        {
            Ok(()) => MutationResponse::ok_with(json!({
                "allow_random_matching": cmd.allow_random_matching,
            })),
            Err(err) => MutationResponse::fail(err.to_string()),
        }
    }
}

/// 查询处理器
pub struct CoreQueryHandler {
    presence: Arc<PresenceDirectory>,
    conversations: Arc<ConversationService>,
    matching: Arc<MatchingEngine>,
}

impl CoreQueryHandler {
    pub fn new(
        presence: Arc<PresenceDirectory>,
        conversations: Arc<ConversationService>,
        matching: Arc<MatchingEngine>,
    ) -> Self {
        Self {
            presence,
            conversations,
            matching,
        }
    }

    pub fn online_users(&self) -> Vec<PresenceRecord> {
        self.presence.all()
    }

    pub async fn online_friends(&self, ctx: &ConnectionContext) -> Result<Vec<PresenceRecord>> {
        self.presence.online_friends_of(&ctx.username).await
    }

    pub fn online_count(&self) -> OnlineCountView {
        OnlineCountView {
            total_count: self.presence.online_count(),
            status_counts: self.presence.count_by_status(),
        }
    }

    pub fn status_of(&self, username: &str) -> UserStatusView {
        match self.presence.get(username) {
            Some(record) => UserStatusView {
                is_online: true,
                status: record.status.as_str().to_string(),
                last_active: Some(record.last_active),
            },
            None => UserStatusView {
                is_online: false,
                status: "offline".to_string(),
                last_active: None,
            },
        }
    }

    pub fn conversations_of(&self, ctx: &ConnectionContext) -> Vec<Conversation> {
        self.conversations.conversations_of(&ctx.username)
    }

    pub fn match_history(&self, ctx: &ConnectionContext) -> Vec<Match> {
        self.matching.match_history(&ctx.username)
    }

    /// 房间到匹配的反查（匹配房间之外的房间返回 None）
    pub fn match_by_room(&self, room_id: &str) -> Option<Match> {
        self.matching.match_by_room(room_id)
    }

    pub fn completed_matches(&self, ctx: &ConnectionContext) -> Vec<Match> {
        self.matching.completed_matches(&ctx.username)
    }

    pub fn matching_statistics(&self) -> crate::domain::model::MatchingStatistics {
        self.matching.statistics()
    }

    pub async fn matching_settings(&self, ctx: &ConnectionContext) -> Result<MatchingSettingsView> {
        Ok(MatchingSettingsView {
            allow_random_matching: self.matching.can_start_match(&ctx.username).await?,
        })
    }
}
