//! 服务运行时
//!
//! 周期性维护任务与依赖装配。清扫任务与实时流量并发运行，
//! 复用交互路径同一套带条件的删除原语，不会产生丢失更新。

pub mod wire;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::CoreConfig;
use crate::domain::service::matching::MatchingEngine;
use crate::domain::service::presence::PresenceDirectory;

/// 启动两个后台清扫：非活跃在线记录、零消息超时匹配。
/// 返回任务句柄，关停时 abort 即可（所有状态都在内存里，无需刷盘）。
pub fn spawn_maintenance(
    presence: Arc<PresenceDirectory>,
    matching: Arc<MatchingEngine>,
    config: &CoreConfig,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    {
        let presence = presence.clone();
        let idle_timeout = config.presence_idle_timeout();
        let period = Duration::from_secs(config.presence_sweep_interval_secs.max(1));
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // 首个 tick 立即返回，跳过以免启动即清扫
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = presence.cleanup_inactive(Utc::now() - idle_timeout);
                if !removed.is_empty() {
                    debug!(count = removed.len(), "Presence sweep removed inactive users");
                }
            }
        }));
    }

    {
        let matching = matching.clone();
        let match_timeout = config.match_timeout();
        let period = Duration::from_secs(config.match_sweep_interval_secs.max(1));
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                match matching.process_timed_out_matches(Utc::now() - match_timeout).await {
                    Ok(swept) if swept > 0 => {
                        debug!(count = swept, "Match sweep timed out idle matches");
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "Match timeout sweep failed"),
                }
            }
        }));
    }

    handles
}
