//! 随机匹配引擎
//!
//! 每条匹配是一个单向状态机：Active -> Ended | Abandoned | Timeout，
//! 终态不可逆。核心不变量：任意时刻每个用户至多一条 Active 匹配。
//!
//! `find_match` 是 check-then-act 序列（筛池 -> 随机挑选 -> 提交），
//! 池子天然是陈旧快照，这里不用锁而用两层防护：
//! 1. 迭代重试：候选在挑中后发现已被占用就从池中剔除重试，
//!    尝试次数以初始池大小为上限，保证终止；
//! 2. 提交期按用户的原子占位（insert-if-absent 的 claim 表）：
//!    两个并发的 find_match 即使都通过了复查，也只有先占到
//!    候选者名额的那一个能提交，堵上复查与提交之间的窗口。
//! 占位在房间创建或成员写入失败时回滚，不留下任何局部状态。

use std::sync::Arc;

use chrono::{DateTime, NaiveTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::domain::model::{Match, MatchStatus, MatchingStatistics, RoomKind};
use crate::domain::repository::{FriendshipGraph, ProfileStore, RoomRegistry};
use crate::error::{CoreError, CoreResult};

/// `find_match` 的结果。空池与未开启匹配都是正常结果，不是错误。
#[derive(Clone, Debug)]
pub enum MatchOutcome {
    /// 本次调用创建的新匹配
    Matched(Match),
    /// 幂等返回：调用者已有 Active 匹配
    Existing(Match),
    /// 候选池为空
    NoCandidates,
    /// 调用者档案未开启随机匹配
    NotEligible,
}

/// 随机匹配引擎
pub struct MatchingEngine {
    matches: DashMap<String, Match>,
    /// 用户名 -> Active 匹配 ID 的占位表；提交前先占、终止时释放
    active_claims: DashMap<String, String>,
    /// 房间 ID -> 匹配 ID
    room_index: DashMap<String, String>,
    profiles: Arc<dyn ProfileStore>,
    friends: Arc<dyn FriendshipGraph>,
    rooms: Arc<dyn RoomRegistry>,
}

impl MatchingEngine {
    pub fn new(
        profiles: Arc<dyn ProfileStore>,
        friends: Arc<dyn FriendshipGraph>,
        rooms: Arc<dyn RoomRegistry>,
    ) -> Self {
        Self {
            matches: DashMap::new(),
            active_claims: DashMap::new(),
            room_index: DashMap::new(),
            profiles,
            friends,
            rooms,
        }
    }

    /// 发起匹配
    pub async fn find_match(&self, username: &str) -> CoreResult<MatchOutcome> {
        // 幂等重试语义：已有 Active 匹配就直接返回它
        if let Some(existing) = self.active_match_of(username) {
            return Ok(MatchOutcome::Existing(existing));
        }

        if !self
            .profiles
            .matching_enabled(username)
            .await
            .map_err(CoreError::from)?
        {
            return Ok(MatchOutcome::NotEligible);
        }

        let mut pool = self.build_candidate_pool(username).await?;
        if pool.is_empty() {
            return Ok(MatchOutcome::NoCandidates);
        }

        let match_id = uuid::Uuid::new_v4().to_string();

        // 占住调用者本人的名额。失败说明并发的另一次调用抢先了：
        // 能查到对方的匹配就按幂等语义返回；查不到说明对方还在
        // 提交窗口内，按"暂无结果"处理，调用方稍后重试即可拿到它。
        match self.active_claims.entry(username.to_string()) {
            Entry::Occupied(occupied) => {
                // 先释放 entry 持有的分片锁，active_match_of 还要读同一张表
                drop(occupied);
                return match self.active_match_of(username) {
                    Some(existing) => Ok(MatchOutcome::Existing(existing)),
                    None => {
                        debug!(user = %username, "Concurrent match commit in flight");
                        Ok(MatchOutcome::NoCandidates)
                    }
                };
            }
            Entry::Vacant(slot) => {
                slot.insert(match_id.clone());
            }
        }

        // 迭代挑选：每轮随机取一个候选并尝试占位；
        // 占位失败（对方刚获得匹配）就把它剔出池子继续，上限为初始池大小。
        let max_attempts = pool.len();
        let mut candidate: Option<String> = None;
        for _ in 0..max_attempts {
            if pool.is_empty() {
                break;
            }
            let index = rand::thread_rng().gen_range(0..pool.len());
            let picked = pool.swap_remove(index);
            match self.active_claims.entry(picked.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    slot.insert(match_id.clone());
                    candidate = Some(picked);
                    break;
                }
            }
        }

        let Some(candidate) = candidate else {
            self.release_claim(username, &match_id);
            return Ok(MatchOutcome::NoCandidates);
        };

        // 提交：房间与成员全部写入成功后匹配才算成立
        match self.commit_match(username, &candidate).await {
            Ok(room_id) => {
                let record = Match::new(&match_id, username, &candidate, &room_id);
                self.room_index.insert(room_id.clone(), match_id.clone());
                self.matches.insert(match_id.clone(), record.clone());
                info!(
                    match_id = %match_id,
                    user_a = %username,
                    user_b = %candidate,
                    room_id = %room_id,
                    "Match created"
                );
                Ok(MatchOutcome::Matched(record))
            }
            Err(err) => {
                self.release_claim(username, &match_id);
                self.release_claim(&candidate, &match_id);
                warn!(user = %username, error = %err, "Match commit failed, claims released");
                Err(CoreError::Persistence(err.to_string()))
            }
        }
    }

    /// 候选池：开启匹配的所有用户，剔除本人、已是好友、任一方向的
    /// 屏蔽、任一方向的待处理好友申请。
    async fn build_candidate_pool(&self, username: &str) -> CoreResult<Vec<String>> {
        let enabled = self
            .profiles
            .matching_enabled_users()
            .await
            .map_err(CoreError::from)?;

        let mut pool = Vec::new();
        for candidate in enabled {
            if candidate == username {
                continue;
            }
            if self.friends.is_friend(username, &candidate).await.map_err(CoreError::from)? {
                continue;
            }
            if self.friends.is_blocked(username, &candidate).await.map_err(CoreError::from)?
                || self.friends.is_blocked(&candidate, username).await.map_err(CoreError::from)?
            {
                continue;
            }
            if self
                .friends
                .has_pending_request(username, &candidate)
                .await
                .map_err(CoreError::from)?
                || self
                    .friends
                    .has_pending_request(&candidate, username)
                    .await
                    .map_err(CoreError::from)?
            {
                continue;
            }
            pool.push(candidate);
        }
        Ok(pool)
    }

    async fn commit_match(&self, user_a: &str, user_b: &str) -> anyhow::Result<String> {
        let room_id = self.rooms.create(RoomKind::Random).await?;
        self.rooms.add_member(&room_id, user_a).await?;
        self.rooms.add_member(&room_id, user_b).await?;
        Ok(room_id)
    }

    /// 只在占位仍指向本次匹配时释放（避免误删他人的占位）
    fn release_claim(&self, username: &str, match_id: &str) {
        self.active_claims
            .remove_if(username, |_, claimed| claimed == match_id);
    }

    fn release_claims_of(&self, record: &Match) {
        self.release_claim(&record.user_a, &record.id);
        self.release_claim(&record.user_b, &record.id);
    }

    /// 调用者当前的 Active 匹配
    pub fn active_match_of(&self, username: &str) -> Option<Match> {
        let match_id = self.active_claims.get(username)?.value().clone();
        let record = self.matches.get(&match_id)?;
        record.is_active().then(|| record.clone())
    }

    /// 显式终止匹配。只有参与者可以终止；已终止的匹配返回 InvalidState。
    pub async fn end_match(&self, match_id: &str, by_user: &str) -> CoreResult<Match> {
        let snapshot = {
            let mut record = self
                .matches
                .get_mut(match_id)
                .ok_or_else(|| CoreError::NotFound(format!("match {match_id}")))?;
            if !record.involves(by_user) {
                return Err(CoreError::Unauthorized(format!(
                    "{by_user} is not a participant of match {match_id}"
                )));
            }
            if !record.is_active() {
                return Err(CoreError::InvalidState(format!(
                    "match {match_id} is already terminal"
                )));
            }
            record.finish(MatchStatus::Ended, Some(by_user));
            record.clone()
        };

        self.release_claims_of(&snapshot);
        info!(match_id = %match_id, ended_by = %by_user, "Match ended");

        // 停用房间让扇出随之停止；匹配本身已终止，失败只上报不回滚
        self.rooms
            .deactivate(&snapshot.room_id)
            .await
            .map_err(CoreError::from)?;
        Ok(snapshot)
    }

    /// 单方退出：状态记为 Abandoned（与显式 Ended 区分开），
    /// 把退出者移出房间成员后停用房间。没有 Active 匹配时为 no-op。
    pub async fn leave_match(&self, username: &str) -> CoreResult<Option<Match>> {
        let Some(active) = self.active_match_of(username) else {
            return Ok(None);
        };

        let snapshot = {
            let mut record = self
                .matches
                .get_mut(&active.id)
                .ok_or_else(|| CoreError::NotFound(format!("match {}", active.id)))?;
            if !record.is_active() {
                return Ok(None);
            }
            record.finish(MatchStatus::Abandoned, Some(username));
            record.clone()
        };

        self.release_claims_of(&snapshot);
        info!(match_id = %snapshot.id, user = %username, "Match abandoned");

        self.rooms
            .remove_member(&snapshot.room_id, username)
            .await
            .map_err(CoreError::from)?;
        self.rooms
            .deactivate(&snapshot.room_id)
            .await
            .map_err(CoreError::from)?;
        Ok(Some(snapshot))
    }

    /// 房间里每送达一条消息调用一次；匹配已终止时静默忽略
    pub fn increment_message_count(&self, room_id: &str) {
        let Some(match_id) = self.room_index.get(room_id).map(|e| e.value().clone()) else {
            return;
        };
        if let Some(mut record) = self.matches.get_mut(&match_id) {
            record.increment_message_count();
        }
    }

    /// 周期清扫：早于 cutoff 且一条消息都没有的 Active 匹配转 Timeout。
    /// 有过消息的匹配（哪怕只有一条）永不被自动超时。
    pub async fn process_timed_out_matches(&self, cutoff: DateTime<Utc>) -> CoreResult<usize> {
        let stale: Vec<String> = self
            .matches
            .iter()
            .filter(|m| m.is_active() && m.message_count == 0 && m.matched_at < cutoff)
            .map(|m| m.id.clone())
            .collect();

        let mut swept = 0;
        for match_id in stale {
            let snapshot = {
                let Some(mut record) = self.matches.get_mut(&match_id) else {
                    continue;
                };
                // 清扫与实时流量并发：条件在持锁状态下复查，
                // 刚收到消息或刚被终止的匹配放过
                if !record.is_active() || record.message_count > 0 || record.matched_at >= cutoff {
                    continue;
                }
                record.finish(MatchStatus::Timeout, None);
                record.clone()
            };

            self.release_claims_of(&snapshot);
            info!(match_id = %snapshot.id, "Match timed out");
            self.rooms
                .deactivate(&snapshot.room_id)
                .await
                .map_err(CoreError::from)?;
            swept += 1;
        }
        Ok(swept)
    }

    /// 房间到匹配的反查
    pub fn match_by_room(&self, room_id: &str) -> Option<Match> {
        let match_id = self.room_index.get(room_id)?.value().clone();
        self.matches.get(&match_id).map(|m| m.clone())
    }

    pub fn get(&self, match_id: &str) -> Option<Match> {
        self.matches.get(match_id).map(|m| m.clone())
    }

    /// 档案层面的匹配资格探测
    pub async fn can_start_match(&self, username: &str) -> CoreResult<bool> {
        self.profiles
            .matching_enabled(username)
            .await
            .map_err(CoreError::from)
    }

    /// 用户全部匹配历史，按创建时间倒序
    pub fn match_history(&self, username: &str) -> Vec<Match> {
        let mut history: Vec<Match> = self
            .matches
            .iter()
            .filter(|m| m.involves(username))
            .map(|m| m.clone())
            .collect();
        history.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        history
    }

    /// 已终止的匹配历史
    pub fn completed_matches(&self, username: &str) -> Vec<Match> {
        self.match_history(username)
            .into_iter()
            .filter(|m| m.status.is_terminal())
            .collect()
    }

    pub fn active_match_count(&self) -> usize {
        self.matches.iter().filter(|m| m.is_active()).count()
    }

    /// 聚合统计：活跃数、总数、平均时长（按已终止匹配）、
    /// 平均消息数（按全部匹配）、今日创建数
    pub fn statistics(&self) -> MatchingStatistics {
        let mut stats = MatchingStatistics::default();
        let mut duration_sum = 0i64;
        let mut duration_count = 0usize;
        let mut message_sum = 0u64;

        let today_start = Utc::now()
            .date_naive()
            .and_time(NaiveTime::MIN)
            .and_utc();

        for record in self.matches.iter() {
            stats.total_matches += 1;
            if record.is_active() {
                stats.active_matches += 1;
            }
            if let Some(minutes) = record.duration_minutes {
                duration_sum += minutes;
                duration_count += 1;
            }
            message_sum += record.message_count as u64;
            if record.created_at >= today_start {
                stats.today_matches += 1;
            }
        }

        if duration_count > 0 {
            stats.average_duration_minutes = Some(duration_sum as f64 / duration_count as f64);
        }
        if stats.total_matches > 0 {
            stats.average_message_count = Some(message_sum as f64 / stats.total_matches as f64);
        }
        stats
    }
}
