//! 消息扇出路由
//!
//! 显式的频道注册表：主题名 -> 订阅连接集合，外加 用户名 -> 连接集合 的
//! 按用户投递索引（支持多标签页）。投递语义为 at-most-once、同步且不阻塞：
//! 订阅者句柄是无界发送端，慢订阅者不会拖住其他订阅者；
//! 发送失败（接收端已销毁）的连接会在本次投递后被整体摘除。
//!
//! 顺序保证：对同一主题的发布持有该主题条目的写锁完成全部投递，
//! 因此同一房间的消息在每个订阅者处按路由器接受顺序到达（单房间 FIFO）；
//! 跨主题之间不做任何顺序承诺。

use std::collections::HashSet;

use anyhow::Result;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::model::ChatMessage;

/// 好友状态变更的全局主题
pub const FRIEND_STATUS_TOPIC: &str = "friend-status";
/// 在线人数统计的全局主题
pub const ONLINE_COUNT_TOPIC: &str = "online-count";

/// 房间广播使用的主题名
pub fn room_topic(room_id: &str) -> String {
    format!("room:{room_id}")
}

/// 单个连接的订阅者句柄
struct SubscriberHandle {
    username: String,
    sender: mpsc::UnboundedSender<Value>,
}

/// 扇出路由器
#[derive(Default)]
pub struct FanoutRouter {
    connections: DashMap<String, SubscriberHandle>,
    /// 用户名 -> 该用户当前所有连接
    user_index: DashMap<String, HashSet<String>>,
    /// 主题名 -> 订阅连接集合
    topics: DashMap<String, HashSet<String>>,
}

impl FanoutRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册连接（connect 钩子调用）
    pub fn register(
        &self,
        connection_id: &str,
        username: &str,
        sender: mpsc::UnboundedSender<Value>,
    ) {
        self.connections.insert(
            connection_id.to_string(),
            SubscriberHandle {
                username: username.to_string(),
                sender,
            },
        );
        self.user_index
            .entry(username.to_string())
            .or_default()
            .insert(connection_id.to_string());
        debug!(connection_id = %connection_id, user = %username, "Connection registered");
    }

    /// 注销连接并退订全部主题；未知连接是 no-op
    pub fn unregister(&self, connection_id: &str) {
        let Some((_, handle)) = self.connections.remove(connection_id) else {
            return;
        };
        if let Some(mut conns) = self.user_index.get_mut(&handle.username) {
            conns.remove(connection_id);
        }
        self.user_index
            .remove_if(&handle.username, |_, conns| conns.is_empty());
        for mut entry in self.topics.iter_mut() {
            entry.value_mut().remove(connection_id);
        }
        self.topics.retain(|_, subscribers| !subscribers.is_empty());
        debug!(connection_id = %connection_id, user = %handle.username, "Connection unregistered");
    }

    /// 订阅主题；未注册的连接返回 false
    pub fn subscribe(&self, topic: &str, connection_id: &str) -> bool {
        if !self.connections.contains_key(connection_id) {
            warn!(connection_id = %connection_id, topic = %topic, "Subscribe from unknown connection");
            return false;
        }
        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(connection_id.to_string());
        true
    }

    /// 退订主题；幂等
    pub fn unsubscribe(&self, topic: &str, connection_id: &str) {
        if let Some(mut subscribers) = self.topics.get_mut(topic) {
            subscribers.remove(connection_id);
        }
        self.topics.remove_if(topic, |_, subscribers| subscribers.is_empty());
    }

    /// 向主题发布一条消息，返回成功投递的连接数。
    ///
    /// 持有主题条目的写锁直到所有订阅者入队完毕，以保证单主题 FIFO；
    /// 入队本身不会阻塞，失效连接在释放锁之后统一摘除。
    pub fn publish(&self, topic: &str, payload: &Value) -> usize {
        let mut delivered = 0;
        let mut dead: Vec<String> = Vec::new();

        if let Some(subscribers) = self.topics.get_mut(topic) {
            for connection_id in subscribers.iter() {
                match self.connections.get(connection_id) {
                    Some(handle) => {
                        if handle.sender.send(payload.clone()).is_ok() {
                            delivered += 1;
                        } else {
                            dead.push(connection_id.clone());
                        }
                    }
                    None => dead.push(connection_id.clone()),
                }
            }
        }

        for connection_id in dead {
            warn!(connection_id = %connection_id, topic = %topic, "Dropping dead subscriber");
            self.unregister(&connection_id);
        }
        delivered
    }

    /// 房间广播
    pub fn send_to_room(&self, room_id: &str, message: &ChatMessage) -> Result<usize> {
        let payload = serde_json::to_value(message)?;
        Ok(self.publish(&room_topic(room_id), &payload))
    }

    /// 按用户投递：送达该用户名当前所有活跃连接
    pub fn send_to_user(&self, username: &str, payload: &Value) -> usize {
        let connection_ids: Vec<String> = match self.user_index.get(username) {
            Some(conns) => conns.iter().cloned().collect(),
            None => return 0,
        };

        let mut delivered = 0;
        let mut dead: Vec<String> = Vec::new();
        for connection_id in &connection_ids {
            match self.connections.get(connection_id) {
                Some(handle) => {
                    if handle.sender.send(payload.clone()).is_ok() {
                        delivered += 1;
                    } else {
                        dead.push(connection_id.clone());
                    }
                }
                None => dead.push(connection_id.clone()),
            }
        }
        for connection_id in dead {
            warn!(connection_id = %connection_id, user = %username, "Dropping dead connection");
            self.unregister(&connection_id);
        }
        delivered
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_subscribed(&self, topic: &str, connection_id: &str) -> bool {
        self.topics
            .get(topic)
            .map(|subscribers| subscribers.contains(connection_id))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn connect(router: &FanoutRouter, id: &str, user: &str) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        router.register(id, user, tx);
        rx
    }

    #[tokio::test]
    async fn room_broadcast_reaches_only_subscribers() {
        let router = FanoutRouter::new();
        let mut alice = connect(&router, "c1", "alice");
        let mut bob = connect(&router, "c2", "bob");
        let mut carol = connect(&router, "c3", "carol");

        assert!(router.subscribe(&room_topic("r1"), "c1"));
        assert!(router.subscribe(&room_topic("r1"), "c2"));

        let message = ChatMessage::chat("r1", "alice", "hello");
        let delivered = router.send_to_room("r1", &message).unwrap();
        assert_eq!(delivered, 2);

        assert_eq!(alice.recv().await.unwrap()["content"], "hello");
        assert_eq!(bob.recv().await.unwrap()["content"], "hello");
        assert!(carol.try_recv().is_err(), "non-subscriber must not receive");
    }

    #[tokio::test]
    async fn same_room_messages_arrive_in_publish_order() {
        let router = FanoutRouter::new();
        let mut rx = connect(&router, "c1", "alice");
        router.subscribe(&room_topic("r1"), "c1");

        for i in 0..5 {
            let message = ChatMessage::chat("r1", "bob", &format!("m{i}"));
            router.send_to_room("r1", &message).unwrap();
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await.unwrap()["content"], format!("m{i}"));
        }
    }

    #[tokio::test]
    async fn send_to_user_covers_all_tabs() {
        let router = FanoutRouter::new();
        let mut tab1 = connect(&router, "c1", "alice");
        let mut tab2 = connect(&router, "c2", "alice");

        let delivered = router.send_to_user("alice", &json!({"hello": true}));
        assert_eq!(delivered, 2);
        assert!(tab1.recv().await.is_some());
        assert!(tab2.recv().await.is_some());
    }

    #[tokio::test]
    async fn dead_subscriber_is_reaped_without_blocking_others() {
        let router = FanoutRouter::new();
        let dead_rx = connect(&router, "c1", "alice");
        let mut live = connect(&router, "c2", "bob");
        router.subscribe("t", "c1");
        router.subscribe("t", "c2");

        drop(dead_rx);
        let delivered = router.publish("t", &json!({"n": 1}));
        assert_eq!(delivered, 1);
        assert!(live.recv().await.is_some());
        assert_eq!(router.connection_count(), 1, "dead connection removed");
    }

    #[tokio::test]
    async fn unregister_cleans_user_and_topic_indexes() {
        let router = FanoutRouter::new();
        let _rx = connect(&router, "c1", "alice");
        router.subscribe("t", "c1");

        router.unregister("c1");
        assert_eq!(router.send_to_user("alice", &json!({})), 0);
        assert_eq!(router.publish("t", &json!({})), 0);
        // 再次注销是 no-op
        router.unregister("c1");
    }
}
