//! 统一异常处理模块

use thiserror::Error;

/// 核心错误类型
///
/// 注意：空的匹配候选池不是错误（见 `MatchOutcome::NoCandidates`），
/// 对未知用户名的在线状态操作是 no-op，两者都不会走到这里。
#[derive(Debug, Error)]
pub enum CoreError {
    /// 目标实体不存在
    #[error("Not found: {0}")]
    NotFound(String),

    /// 操作者不是参与者
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// 非法状态迁移（如终止一个已经终止的匹配）
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// 持久化失败（匹配/房间写入未全部完成时不提交任何局部状态）
    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        CoreError::Persistence(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
