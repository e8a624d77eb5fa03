pub mod fanout;

pub use fanout::{FanoutRouter, room_topic, FRIEND_STATUS_TOPIC, ONLINE_COUNT_TOPIC};
