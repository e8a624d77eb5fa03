//! Wire 风格的依赖注入模块
//!
//! 按依赖顺序构建全部组件。缺省装配使用进程内协作方实现；
//! 接入真实存储时通过 [`Collaborators`] 注入自定义实现。

use std::sync::Arc;

use anyhow::Result;
use tokio::task::JoinHandle;

use crate::application::handlers::{CoreCommandHandler, CoreQueryHandler};
use crate::config::CoreConfig;
use crate::domain::repository::{FriendshipGraph, ProfileStore, RoomRegistry, UserDirectory};
use crate::domain::service::conversation::ConversationService;
use crate::domain::service::matching::MatchingEngine;
use crate::domain::service::presence::PresenceDirectory;
use crate::domain::service::session_tracker::SessionTracker;
use crate::infrastructure::memory::{
    InMemoryFriendshipGraph, InMemoryProfileStore, InMemoryRoomRegistry, InMemoryUserDirectory,
};
use crate::infrastructure::messaging::FanoutRouter;
use crate::service::spawn_maintenance;

/// 核心消费的外部协作方
pub struct Collaborators {
    pub users: Arc<dyn UserDirectory>,
    pub friends: Arc<dyn FriendshipGraph>,
    pub rooms: Arc<dyn RoomRegistry>,
    pub profiles: Arc<dyn ProfileStore>,
}

impl Collaborators {
    /// 进程内缺省实现
    pub fn in_memory() -> Self {
        Self {
            users: Arc::new(InMemoryUserDirectory::new()),
            friends: Arc::new(InMemoryFriendshipGraph::new()),
            rooms: Arc::new(InMemoryRoomRegistry::new()),
            profiles: Arc::new(InMemoryProfileStore::new()),
        }
    }
}

/// 应用上下文 - 包含所有已初始化的服务
pub struct ApplicationContext {
    pub commands: Arc<CoreCommandHandler>,
    pub queries: Arc<CoreQueryHandler>,
    pub router: Arc<FanoutRouter>,
    pub presence: Arc<PresenceDirectory>,
    pub matching: Arc<MatchingEngine>,
    maintenance: Vec<JoinHandle<()>>,
}

impl ApplicationContext {
    /// 停掉后台清扫任务。在线目录是纯内存的，关停即清空，无需额外 teardown。
    pub fn shutdown(&mut self) {
        for handle in self.maintenance.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for ApplicationContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 构建应用上下文
pub fn initialize(config: &CoreConfig, collaborators: Collaborators) -> Result<ApplicationContext> {
    // 1. 扇出路由器与会话绑定索引
    let router = Arc::new(FanoutRouter::new());
    let sessions = Arc::new(SessionTracker::new());

    // 2. 在线状态目录
    let presence = Arc::new(PresenceDirectory::new(
        sessions.clone(),
        collaborators.users.clone(),
        collaborators.friends.clone(),
        router.clone(),
    ));

    // 3. DM 会话服务
    let conversations = Arc::new(ConversationService::new(
        collaborators.users.clone(),
        router.clone(),
    ));

    // 4. 随机匹配引擎
    let matching = Arc::new(MatchingEngine::new(
        collaborators.profiles.clone(),
        collaborators.friends.clone(),
        collaborators.rooms.clone(),
    ));

    // 5. 命令/查询处理器
    let commands = Arc::new(CoreCommandHandler::new(
        presence.clone(),
        sessions,
        router.clone(),
        conversations.clone(),
        matching.clone(),
        collaborators.users,
        collaborators.profiles,
    ));
    let queries = Arc::new(CoreQueryHandler::new(
        presence.clone(),
        conversations,
        matching.clone(),
    ));

    // 6. 后台清扫
    let maintenance = spawn_maintenance(presence.clone(), matching.clone(), config);

    Ok(ApplicationContext {
        commands,
        queries,
        router,
        presence,
        matching,
        maintenance,
    })
}
