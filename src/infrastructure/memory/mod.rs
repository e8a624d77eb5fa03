//! 协作方接口的进程内实现
//!
//! 单进程部署与测试用。真实部署可以把这些换成任何满足
//! `domain::repository` 契约的存储实现。

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dashmap::DashMap;

use crate::domain::model::{RoomKind, UserIdentity};
use crate::domain::repository::{FriendshipGraph, ProfileStore, RoomRegistry, UserDirectory};

/// 进程内用户目录
#[derive(Default)]
pub struct InMemoryUserDirectory {
    by_username: DashMap<String, UserIdentity>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, user_id: i64, username: &str, display_name: &str, avatar_url: Option<&str>) {
        self.by_username.insert(
            username.to_string(),
            UserIdentity {
                user_id,
                username: username.to_string(),
                display_name: display_name.to_string(),
                avatar_url: avatar_url.map(|u| u.to_string()),
            },
        );
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn find_by_username(&self, username: &str) -> Result<Option<UserIdentity>> {
        Ok(self.by_username.get(username).map(|u| u.clone()))
    }

    async fn find_by_id(&self, user_id: i64) -> Result<Option<UserIdentity>> {
        Ok(self
            .by_username
            .iter()
            .find(|u| u.user_id == user_id)
            .map(|u| u.clone()))
    }
}

/// 进程内好友关系图。accepted 是无向的，blocked/pending 有方向。
#[derive(Default)]
pub struct InMemoryFriendshipGraph {
    accepted: DashMap<String, HashSet<String>>,
    blocked: DashMap<String, HashSet<String>>,
    pending: DashMap<String, HashSet<String>>,
}

impl InMemoryFriendshipGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_friend(&self, a: &str, b: &str) {
        self.accepted
            .entry(a.to_string())
            .or_default()
            .insert(b.to_string());
        self.accepted
            .entry(b.to_string())
            .or_default()
            .insert(a.to_string());
    }

    /// a 屏蔽 b（单向）
    pub fn block(&self, a: &str, b: &str) {
        self.blocked
            .entry(a.to_string())
            .or_default()
            .insert(b.to_string());
    }

    /// a 向 b 发出好友申请（单向）
    pub fn add_pending(&self, a: &str, b: &str) {
        self.pending
            .entry(a.to_string())
            .or_default()
            .insert(b.to_string());
    }

    fn contains(map: &DashMap<String, HashSet<String>>, a: &str, b: &str) -> bool {
        map.get(a).map(|set| set.contains(b)).unwrap_or(false)
    }
}

#[async_trait]
impl FriendshipGraph for InMemoryFriendshipGraph {
    async fn is_friend(&self, a: &str, b: &str) -> Result<bool> {
        Ok(Self::contains(&self.accepted, a, b))
    }

    async fn is_blocked(&self, a: &str, b: &str) -> Result<bool> {
        Ok(Self::contains(&self.blocked, a, b))
    }

    async fn has_pending_request(&self, a: &str, b: &str) -> Result<bool> {
        Ok(Self::contains(&self.pending, a, b))
    }

    async fn friends_of(&self, username: &str) -> Result<Vec<String>> {
        Ok(self
            .accepted
            .get(username)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }
}

struct RoomEntry {
    kind: RoomKind,
    members: HashSet<String>,
    active: bool,
}

/// 进程内房间注册表
#[derive(Default)]
pub struct InMemoryRoomRegistry {
    rooms: DashMap<String, RoomEntry>,
    counter: AtomicU64,
}

impl InMemoryRoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self, room_id: &str) -> bool {
        self.rooms.get(room_id).map(|r| r.active).unwrap_or(false)
    }

    pub fn kind_of(&self, room_id: &str) -> Option<RoomKind> {
        self.rooms.get(room_id).map(|r| r.kind)
    }
}

#[async_trait]
impl RoomRegistry for InMemoryRoomRegistry {
    async fn create(&self, kind: RoomKind) -> Result<String> {
        let id = format!("room-{}", self.counter.fetch_add(1, Ordering::Relaxed) + 1);
        self.rooms.insert(
            id.clone(),
            RoomEntry {
                kind,
                members: HashSet::new(),
                active: true,
            },
        );
        Ok(id)
    }

    async fn add_member(&self, room_id: &str, username: &str) -> Result<()> {
        let mut room = self
            .rooms
            .get_mut(room_id)
            .ok_or_else(|| anyhow!("room not found: {room_id}"))?;
        room.members.insert(username.to_string());
        Ok(())
    }

    async fn remove_member(&self, room_id: &str, username: &str) -> Result<()> {
        if let Some(mut room) = self.rooms.get_mut(room_id) {
            room.members.remove(username);
        }
        Ok(())
    }

    async fn deactivate(&self, room_id: &str) -> Result<()> {
        if let Some(mut room) = self.rooms.get_mut(room_id) {
            room.active = false;
        }
        Ok(())
    }

    async fn members(&self, room_id: &str) -> Result<Vec<String>> {
        Ok(self
            .rooms
            .get(room_id)
            .map(|room| room.members.iter().cloned().collect())
            .unwrap_or_default())
    }
}

/// 进程内档案存储（只保存匹配开关）
#[derive(Default)]
pub struct InMemoryProfileStore {
    matching_enabled: DashMap<String, bool>,
}

impl InMemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&self, username: &str) {
        self.matching_enabled.insert(username.to_string(), true);
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn matching_enabled(&self, username: &str) -> Result<bool> {
        Ok(self
            .matching_enabled
            .get(username)
            .map(|v| *v)
            .unwrap_or(false))
    }

    async fn set_matching_enabled(&self, username: &str, enabled: bool) -> Result<()> {
        self.matching_enabled
            .insert(username.to_string(), enabled);
        Ok(())
    }

    async fn matching_enabled_users(&self) -> Result<Vec<String>> {
        Ok(self
            .matching_enabled
            .iter()
            .filter(|entry| *entry.value())
            .map(|entry| entry.key().clone())
            .collect())
    }
}
