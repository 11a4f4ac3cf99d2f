use std::result::Result as StdResult;
use thiserror::Error;

/// 页配额的作用范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaScope {
    /// 单个流的配额
    Flow,
    /// 全局页池容量
    Global,
}

impl std::fmt::Display for QuotaScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaScope::Flow => write!(f, "flow"),
            QuotaScope::Global => write!(f, "global"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("配置项 {field} 必须为正整数")]
    NotPositive { field: &'static str },

    #[error("每流页配额 {per_flow} 超过全局页池容量 {total}")]
    FlowQuotaAboveGlobal { per_flow: usize, total: usize },

    #[error("配置文件解析失败: {0}")]
    Parse(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// 页池或流配额耗尽，触发该段的报文被丢弃
    #[error("页池耗尽 ({scope}): 已用 {used} / 上限 {limit}")]
    PoolExhausted {
        scope: QuotaScope,
        used: usize,
        limit: usize,
    },

    #[error("页池未启动")]
    PagerInactive,

    #[error("流正在拆除，丢弃报文")]
    FlowTeardownInProgress,

    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),

    #[error("系统IO错误: {0}")]
    IoError(#[from] std::io::Error),
}

impl EngineError {
    /// 检测路径上预期内的对抗条件，只需记录诊断日志
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            EngineError::PoolExhausted { .. } | EngineError::FlowTeardownInProgress
        )
    }
}

pub type Result<T> = StdResult<T, EngineError>;
