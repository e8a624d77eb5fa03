//! 入站命令
//!
//! 所有命令都来自已认证连接。载荷里刻意没有 sender/timestamp 字段：
//! 发送者身份与时间戳一律取自连接上下文与服务端时钟，
//! 客户端多传的字段在反序列化时被直接丢弃。

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct SendChatMessage {
    pub room_id: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JoinRoom {
    pub room_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeaveRoom {
    pub room_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenConversation {
    pub peer: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendDirectMessage {
    pub conversation_id: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarkConversationRead {
    pub conversation_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateStatus {
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndMatch {
    pub match_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateMatchingSettings {
    pub allow_random_matching: bool,
}
