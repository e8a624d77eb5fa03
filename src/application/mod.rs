//! 应用层 - 命令与查询处理

pub mod commands;
pub mod handlers;
pub mod queries;
