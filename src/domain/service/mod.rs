//! 领域服务

pub mod conversation;
pub mod matching;
pub mod presence;
pub mod session_tracker;
