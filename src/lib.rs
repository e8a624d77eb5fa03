//! Ember Chat Core
//!
//! 聊天系统的实时核心：在线状态目录、连接级扇出路由、
//! DM 会话、随机匹配引擎。全部状态都在进程内存里，
//! 用户目录/好友关系/房间注册/偏好存储以 trait 形式注入，
//! 持久化实现由宿主服务提供。
//!
//! 入口是 [`service::wire::initialize`]，按依赖顺序装配全部组件
//! 并启动后台清扫任务。

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod service;

pub use application::handlers::{
    ConnectionContext, CoreCommandHandler, CoreQueryHandler, MutationResponse,
};
pub use config::CoreConfig;
pub use domain::model::{
    ChatMessage, Conversation, Match, MatchStatus, MessageKind, PresenceRecord, RoomKind,
    StatusEvent, UserIdentity, UserStatus,
};
pub use domain::repository::{FriendshipGraph, ProfileStore, RoomRegistry, UserDirectory};
pub use domain::service::matching::{MatchOutcome, MatchingEngine};
pub use domain::service::presence::PresenceDirectory;
pub use error::{CoreError, CoreResult};
pub use infrastructure::messaging::{FanoutRouter, FRIEND_STATUS_TOPIC, ONLINE_COUNT_TOPIC};
pub use service::wire::{initialize, ApplicationContext, Collaborators};
