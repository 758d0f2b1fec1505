use thiserror::Error;

/// SIP 引擎层错误
#[derive(Error, Debug)]
pub enum SipError {
    #[error("SIP stack error: {0}")]
    Stack(#[from] rsipstack::Error),

    #[error("Invalid URI: {0}")]
    InvalidUri(#[from] rsip::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("SIP engine not started")]
    NotStarted,

    #[error("SIP engine already started")]
    AlreadyStarted,
}

/// 引擎操作的Result类型别名
pub type SipResult<T> = Result<T, SipError>;

/// 配置错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Missing required field: {0}")]
    Missing(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

/// 话机操作的Result类型别名
pub type CallResult<T> = Result<T, CallError>;

/// 话机生命周期相关错误类型
#[derive(Error, Debug)]
pub enum CallError {
    /// 配置相关错误（配置串格式错误、缺少字段等）
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),

    /// 引擎上报的错误
    #[error("SIP引擎错误: {0}")]
    Engine(#[from] SipError),

    /// 网络不可达，呼叫无法发起
    #[error("网络不可达，无法发起呼叫")]
    NetworkUnreachable,

    #[error("呼叫目标无效: {target}")]
    InvalidTarget { target: String },

    /// 状态相关错误
    #[error("SIP话机未初始化")]
    NotInitialized,
}

impl CallError {
    /// 判断错误是否可恢复（调用方可据此决定是否提示用户重试）
    pub fn is_recoverable(&self) -> bool {
        match self {
            CallError::Config(_) => false,
            CallError::Engine(SipError::Transport(_)) => true,
            CallError::Engine(_) => false,
            CallError::NetworkUnreachable => true,
            CallError::InvalidTarget { .. } => false,
            CallError::NotInitialized => false,
        }
    }

    /// 获取标准错误代码，用于日志分析和接口返回
    pub fn error_code(&self) -> &'static str {
        match self {
            CallError::Config(_) => "INVALID_CONFIG",
            CallError::Engine(SipError::Stack(_)) => "SIP_PROTOCOL_ERROR",
            CallError::Engine(SipError::InvalidUri(_)) => "URI_PARSE_ERROR",
            CallError::Engine(SipError::NotStarted) => "NOT_INITIALIZED",
            CallError::Engine(_) => "ENGINE_ERROR",
            CallError::NetworkUnreachable => "NETWORK_UNREACHABLE",
            CallError::InvalidTarget { .. } => "INVALID_TARGET",
            CallError::NotInitialized => "NOT_INITIALIZED",
        }
    }

    /// 创建无效目标错误
    pub fn invalid_target(target: impl Into<String>) -> Self {
        CallError::InvalidTarget {
            target: target.into(),
        }
    }
}
