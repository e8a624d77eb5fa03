//! 协作方接口（需要作为 trait 对象使用，保留 async-trait）
//!
//! 用户/档案/好友关系/房间存储都不属于本核心，
//! 这里只声明核心消费的最小查询与写入面。

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::model::{RoomKind, UserIdentity};

/// 用户目录：按用户名/ID 查身份
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_by_username(&self, username: &str) -> Result<Option<UserIdentity>>;
    async fn find_by_id(&self, user_id: i64) -> Result<Option<UserIdentity>>;
}

/// 好友关系图。blocked 与 pending 都是有方向的，调用方自行检查两个方向。
#[async_trait]
pub trait FriendshipGraph: Send + Sync {
    async fn is_friend(&self, a: &str, b: &str) -> Result<bool>;
    /// a 是否屏蔽了 b（单向）
    async fn is_blocked(&self, a: &str, b: &str) -> Result<bool>;
    /// a 是否向 b 发出了待处理的好友申请（单向）
    async fn has_pending_request(&self, a: &str, b: &str) -> Result<bool>;
    async fn friends_of(&self, username: &str) -> Result<Vec<String>>;
}

/// 房间注册表：随机匹配房间的创建与成员管理经由此接口
#[async_trait]
pub trait RoomRegistry: Send + Sync {
    async fn create(&self, kind: RoomKind) -> Result<String>;
    async fn add_member(&self, room_id: &str, username: &str) -> Result<()>;
    async fn remove_member(&self, room_id: &str, username: &str) -> Result<()>;
    /// 停用房间：清空订阅语义由调用方（扇出层）保证，这里只改持久状态
    async fn deactivate(&self, room_id: &str) -> Result<()>;
    async fn members(&self, room_id: &str) -> Result<Vec<String>>;
}

/// 档案存储：只暴露匹配相关的开关
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn matching_enabled(&self, username: &str) -> Result<bool>;
    async fn set_matching_enabled(&self, username: &str, enabled: bool) -> Result<()>;
    /// 所有开启了随机匹配的用户名（候选池的原始来源）
    async fn matching_enabled_users(&self) -> Result<Vec<String>>;
}
