//! DM 会话服务
//!
//! 1:1 会话按规范化的参与者对检索，保证对称性；消息本体不持久化
//! （历史存档属于独立的存储子系统），这里只维护会话的最近消息元数据、
//! 未读数，并把消息扇出到双方的所有活跃连接。

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::model::{Conversation, DirectMessagePayload};
use crate::domain::repository::UserDirectory;
use crate::error::{CoreError, CoreResult};
use crate::infrastructure::messaging::FanoutRouter;

/// DM 会话服务
pub struct ConversationService {
    conversations: DashMap<String, Conversation>,
    /// 规范化参与者对 -> 会话 ID
    pair_index: DashMap<(String, String), String>,
    users: Arc<dyn UserDirectory>,
    router: Arc<FanoutRouter>,
}

impl ConversationService {
    pub fn new(users: Arc<dyn UserDirectory>, router: Arc<FanoutRouter>) -> Self {
        Self {
            conversations: DashMap::new(),
            pair_index: DashMap::new(),
            users,
            router,
        }
    }

    /// 打开（或创建）与 peer 的会话。peer 必须存在于用户目录。
    pub async fn open(&self, username: &str, peer: &str) -> CoreResult<Conversation> {
        if username == peer {
            return Err(CoreError::InvalidState(
                "cannot open a conversation with yourself".to_string(),
            ));
        }
        let peer_exists = self
            .users
            .find_by_username(peer)
            .await
            .map_err(CoreError::from)?
            .is_some();
        if !peer_exists {
            return Err(CoreError::NotFound(format!("user {peer}")));
        }

        let pair = Conversation::canonical_pair(username, peer);
        // 先查索引再建：并发的两次 open 会在 entry 上汇合到同一会话
        let id = self
            .pair_index
            .entry(pair)
            .or_insert_with(|| {
                let conversation = Conversation::new(username, peer);
                let id = conversation.id.clone();
                info!(a = %username, b = %peer, conversation_id = %id, "Conversation created");
                self.conversations.insert(id.clone(), conversation);
                id
            })
            .clone();

        self.conversations
            .get(&id)
            .map(|c| c.clone())
            .ok_or_else(|| CoreError::NotFound(format!("conversation {id}")))
    }

    /// 发送 DM。发送者身份与时间戳由服务端填充；
    /// 客户端载荷里的 sender/timestamp 字段在应用层已被丢弃。
    pub fn send(
        &self,
        conversation_id: &str,
        sender: &str,
        content: &str,
    ) -> CoreResult<DirectMessagePayload> {
        let recipient = {
            let mut conversation = self
                .conversations
                .get_mut(conversation_id)
                .ok_or_else(|| CoreError::NotFound(format!("conversation {conversation_id}")))?;
            let recipient = conversation
                .other_user(sender)
                .ok_or_else(|| {
                    CoreError::Unauthorized(format!(
                        "{sender} is not a participant of conversation {conversation_id}"
                    ))
                })?
                .to_string();

            let now = Utc::now();
            conversation.last_message = Some(content.to_string());
            conversation.last_sender = Some(sender.to_string());
            conversation.last_message_at = Some(now);
            conversation.updated_at = now;
            *conversation
                .unread_counts
                .entry(recipient.clone())
                .or_insert(0) += 1;
            recipient
        };

        let payload = DirectMessagePayload {
            message_id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sender: sender.to_string(),
            recipient: recipient.clone(),
            content: content.to_string(),
            sent_at: Utc::now(),
        };

        match serde_json::to_value(&payload) {
            Ok(value) => {
                // 双方都收到：发送端用于多标签页回显
                self.router.send_to_user(sender, &value);
                self.router.send_to_user(&recipient, &value);
            }
            Err(err) => warn!(error = %err, "Failed to serialize DM payload"),
        }
        debug!(
            conversation_id = %conversation_id,
            sender = %sender,
            recipient = %recipient,
            "Direct message dispatched"
        );
        Ok(payload)
    }

    /// 标记已读：清零调用者在该会话的未读数并记录已读时间
    pub fn mark_read(&self, conversation_id: &str, username: &str) -> CoreResult<()> {
        let mut conversation = self
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| CoreError::NotFound(format!("conversation {conversation_id}")))?;
        if !conversation.involves(username) {
            return Err(CoreError::Unauthorized(format!(
                "{username} is not a participant of conversation {conversation_id}"
            )));
        }
        let now = Utc::now();
        conversation.unread_counts.insert(username.to_string(), 0);
        conversation.last_read_at.insert(username.to_string(), now);
        conversation.updated_at = now;
        Ok(())
    }

    pub fn get(&self, conversation_id: &str) -> Option<Conversation> {
        self.conversations.get(conversation_id).map(|c| c.clone())
    }

    /// 用户参与的全部会话，按最近更新时间倒序
    pub fn conversations_of(&self, username: &str) -> Vec<Conversation> {
        let mut result: Vec<Conversation> = self
            .conversations
            .iter()
            .filter(|c| c.involves(username))
            .map(|c| c.clone())
            .collect();
        result.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        result
    }
}
