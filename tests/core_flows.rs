//! 端到端场景测试
//!
//! 通过 `wire::initialize` 装配完整上下文，从连接建立到匹配结束
//! 走一遍真实的交互路径，只通过公共 API 断言。

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use ember_chat_core::application::commands::{
    EndMatch, JoinRoom, OpenConversation, SendChatMessage, SendDirectMessage, UpdateStatus,
};
use ember_chat_core::infrastructure::memory::{
    InMemoryFriendshipGraph, InMemoryProfileStore, InMemoryRoomRegistry, InMemoryUserDirectory,
};
use ember_chat_core::{
    initialize, ApplicationContext, Collaborators, ConnectionContext, CoreConfig, MatchStatus,
};

struct Harness {
    app: ApplicationContext,
    friends: Arc<InMemoryFriendshipGraph>,
    rooms: Arc<InMemoryRoomRegistry>,
    profiles: Arc<InMemoryProfileStore>,
}

fn harness(usernames: &[&str]) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let users = Arc::new(InMemoryUserDirectory::new());
    for (i, name) in usernames.iter().enumerate() {
        users.add_user(i as i64 + 1, name, name, None);
    }
    let friends = Arc::new(InMemoryFriendshipGraph::new());
    let rooms = Arc::new(InMemoryRoomRegistry::new());
    let profiles = Arc::new(InMemoryProfileStore::new());

    let app = initialize(
        &CoreConfig::default(),
        Collaborators {
            users: users.clone(),
            friends: friends.clone(),
            rooms: rooms.clone(),
            profiles: profiles.clone(),
        },
    )
    .expect("context should initialize");

    Harness {
        app,
        friends,
        rooms,
        profiles,
    }
}

fn ctx(connection_id: &str, username: &str) -> ConnectionContext {
    ConnectionContext {
        connection_id: connection_id.to_string(),
        username: username.to_string(),
    }
}

async fn connect(h: &Harness, connection_id: &str, username: &str) -> mpsc::UnboundedReceiver<Value> {
    let (tx, rx) = mpsc::unbounded_channel();
    h.app
        .commands
        .on_connect(connection_id, username, tx)
        .await
        .expect("connect should succeed");
    rx
}

/// 收取下一条带指定字段的消息，跳过无关的全局广播
async fn next_with_field(rx: &mut mpsc::UnboundedReceiver<Value>, field: &str) -> Value {
    loop {
        let value = rx.recv().await.expect("channel should stay open");
        if value.get(field).is_some() {
            return value;
        }
    }
}

#[tokio::test]
async fn presence_broadcasts_reach_online_peers() {
    let h = harness(&["alice", "bob"]);
    let mut bob = connect(&h, "c-bob", "bob").await;

    // 全局主题是广播，bob 先收到自己上线的事件和人数
    let own = next_with_field(&mut bob, "is_online").await;
    assert_eq!(own["username"], "bob");
    let count = next_with_field(&mut bob, "total_count").await;
    assert_eq!(count["total_count"], 1);

    let _alice = connect(&h, "c-alice", "alice").await;

    // alice 上线：先状态事件，再人数广播
    let event = next_with_field(&mut bob, "is_online").await;
    assert_eq!(event["type"], "friend_status_change");
    assert_eq!(event["username"], "alice");
    assert_eq!(event["status"], "online");

    let count = next_with_field(&mut bob, "total_count").await;
    assert_eq!(count["total_count"], 2);

    // 状态切换再次广播
    let response = h
        .app
        .commands
        .update_status(&ctx("c-alice", "alice"), UpdateStatus { status: "away".into() });
    assert!(response.success);
    let event = next_with_field(&mut bob, "is_online").await;
    assert_eq!(event["status"], "away");

    // 下线广播
    h.app.commands.on_disconnect("c-alice");
    let event = next_with_field(&mut bob, "is_online").await;
    assert_eq!(event["status"], "offline");
    assert_eq!(h.app.queries.online_count().total_count, 1);
}

#[tokio::test]
async fn room_fanout_stays_scoped_and_ordered() {
    let h = harness(&["alice", "bob", "carol"]);
    let _a = connect(&h, "c1", "alice").await;
    let mut b = connect(&h, "c2", "bob").await;
    let mut c = connect(&h, "c3", "carol").await;

    h.app.commands.chat_join(&ctx("c2", "bob"), JoinRoom { room_id: "lobby".into() });
    let join = next_with_field(&mut b, "kind").await;
    assert_eq!(join["kind"], "JOIN");
    assert_eq!(join["content"], "bob joined the chat");

    // carol 不在房间里，只有 bob 收到消息，且按发送顺序
    for i in 0..3 {
        let response = h.app.commands.chat_send(
            &ctx("c1", "alice"),
            SendChatMessage { room_id: "lobby".into(), content: format!("msg-{i}") },
        );
        assert!(response.success);
    }
    for i in 0..3 {
        let message = next_with_field(&mut b, "kind").await;
        assert_eq!(message["content"], format!("msg-{i}"));
        assert_eq!(message["sender"], "alice");
    }
    while let Ok(value) = c.try_recv() {
        assert!(value.get("kind").is_none(), "carol must not receive room traffic");
    }
}

#[tokio::test]
async fn direct_messages_reach_both_parties() {
    let h = harness(&["alice", "bob"]);
    let _a = connect(&h, "c1", "alice").await;
    let mut b = connect(&h, "c2", "bob").await;

    let response = h
        .app
        .commands
        .dm_open(&ctx("c1", "alice"), OpenConversation { peer: "bob".into() })
        .await;
    assert!(response.success);
    let conversation_id = response.data.unwrap()["id"].as_str().unwrap().to_string();

    let response = h.app.commands.dm_send(
        &ctx("c1", "alice"),
        SendDirectMessage { conversation_id: conversation_id.clone(), content: "hi bob".into() },
    );
    assert!(response.success);

    let payload = next_with_field(&mut b, "conversation_id").await;
    assert_eq!(payload["content"], "hi bob");
    assert_eq!(payload["sender"], "alice");

    // 同一对用户重复 open 返回同一会话
    let again = h
        .app
        .commands
        .dm_open(&ctx("c2", "bob"), OpenConversation { peer: "alice".into() })
        .await;
    assert_eq!(again.data.unwrap()["id"], conversation_id.as_str());

    let listed = h.app.queries.conversations_of(&ctx("c2", "bob"));
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].unread_counts.get("bob"), Some(&1));
}

#[tokio::test]
async fn random_match_full_lifecycle() {
    let h = harness(&["alice", "bob", "carol"]);
    h.profiles.enable("alice");
    h.profiles.enable("bob");
    // carol 开了匹配但和 alice 是好友，不能成为候选
    h.profiles.enable("carol");
    h.friends.add_friend("alice", "carol");

    let _a = connect(&h, "c1", "alice").await;
    let _b = connect(&h, "c2", "bob").await;

    let response = h.app.commands.match_start(&ctx("c1", "alice")).await;
    assert!(response.success);
    let data = response.data.unwrap();
    assert_eq!(data["matched_user"]["username"], "bob");
    let match_id = data["match_id"].as_str().unwrap().to_string();
    let room_id = data["room_id"].as_str().unwrap().to_string();
    assert!(h.rooms.is_active(&room_id));

    // 双方都在匹配中，重复发起返回既有匹配
    let repeat = h.app.commands.match_start(&ctx("c2", "bob")).await;
    assert_eq!(repeat.data.unwrap()["match_id"], match_id.as_str());

    // 房间消息计入活跃度
    h.app.commands.chat_join(&ctx("c1", "alice"), JoinRoom { room_id: room_id.clone() });
    let sent = h.app.commands.chat_send(
        &ctx("c1", "alice"),
        SendChatMessage { room_id: room_id.clone(), content: "hey".into() },
    );
    assert!(sent.success);

    let response = h
        .app
        .commands
        .match_end(&ctx("c2", "bob"), EndMatch { match_id: match_id.clone() })
        .await;
    assert!(response.success);
    assert!(!h.rooms.is_active(&room_id));

    let history = h.app.queries.match_history(&ctx("c1", "alice"));
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, MatchStatus::Ended);
    assert_eq!(history[0].message_count, 1);

    // 结束后双方都能再次匹配
    let rematch = h.app.commands.match_start(&ctx("c1", "alice")).await;
    assert!(rematch.success);
}

#[tokio::test]
async fn leaving_a_match_marks_it_abandoned() {
    let h = harness(&["alice", "bob"]);
    h.profiles.enable("alice");
    h.profiles.enable("bob");

    let response = h.app.commands.match_start(&ctx("c1", "alice")).await;
    let room_id = response.data.unwrap()["room_id"].as_str().unwrap().to_string();

    let response = h.app.commands.match_leave(&ctx("c2", "bob")).await;
    assert!(response.success);
    assert_eq!(response.data.unwrap()["status"], "ABANDONED");
    assert!(!h.rooms.is_active(&room_id));

    // 没有活跃匹配时离开是 no-op
    let response = h.app.commands.match_leave(&ctx("c2", "bob")).await;
    assert!(response.success);
    assert!(response.data.is_none());
}

#[tokio::test]
async fn statistics_cover_terminal_and_active_matches() {
    let h = harness(&["alice", "bob", "carol", "dave"]);
    for name in ["alice", "bob", "carol", "dave"] {
        h.profiles.enable(name);
    }
    // 固定配对，避免随机候选影响断言
    h.friends.add_friend("alice", "carol");
    h.friends.add_friend("alice", "dave");
    h.friends.add_friend("bob", "carol");
    h.friends.add_friend("bob", "dave");

    let first = h.app.commands.match_start(&ctx("c1", "alice")).await;
    let match_id = first.data.unwrap()["match_id"].as_str().unwrap().to_string();
    h.app
        .commands
        .match_end(&ctx("c1", "alice"), EndMatch { match_id })
        .await;

    let second = h.app.commands.match_start(&ctx("c3", "carol")).await;
    assert!(second.success);

    let stats = h.app.queries.matching_statistics();
    assert_eq!(stats.total_matches, 2);
    assert_eq!(stats.active_matches, 1);
    assert_eq!(stats.today_matches, 2);
    assert!(stats.average_duration_minutes.is_some());
}

#[tokio::test]
async fn stale_presence_entries_are_swept() {
    let h = harness(&["alice", "bob"]);
    let _a = connect(&h, "c1", "alice").await;
    let _b = connect(&h, "c2", "bob").await;

    // 直接以当前时刻为界清扫，两条记录都早于 cutoff
    let removed = h
        .app
        .presence
        .cleanup_inactive(chrono::Utc::now() + chrono::Duration::seconds(1));
    assert_eq!(removed.len(), 2);
    assert_eq!(h.app.queries.online_count().total_count, 0);
}
