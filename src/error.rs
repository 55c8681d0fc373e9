use std::net::SocketAddr;
use crate::SessionId;

/// 统一传输错误类型
///
/// 生命周期错误（配置、监听）作为返回值传给调用者并中止启动；
/// 单次 I/O 错误只会出现在对应票据（Ticket）的完成状态里。
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// 连接相关错误（读写失败、连接重置等）
    #[error("Connection error: {reason} (retryable: {retryable})")]
    Connection {
        reason: String,
        retryable: bool,
    },

    /// 超时错误：票据截止时间已过
    #[error("Operation '{operation}' exceeded its deadline")]
    Timeout {
        operation: String,
    },

    /// 会话已结束
    #[error("Session {session_id} is closed")]
    SessionClosed {
        session_id: SessionId,
    },

    /// 配置相关错误
    #[error("Configuration error in field '{field}': {reason}")]
    Configuration {
        field: String,
        reason: String,
    },

    /// 监听失败
    #[error("Failed to listen on {address}: {reason}")]
    Listen {
        address: SocketAddr,
        reason: String,
    },

    /// 调用方违反了接口约定
    #[error("Contract violation: {reason}")]
    ContractViolation {
        reason: String,
    },

    /// 组件已关闭，不再接受新任务
    #[error("Component is shut down")]
    Shutdown,
}

impl TransportError {
    /// 判断错误是否可重试
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Connection { retryable, .. } => *retryable,
            TransportError::Timeout { .. } => true,
            TransportError::SessionClosed { .. } => false,
            TransportError::Configuration { .. } => false,
            TransportError::Listen { .. } => false,
            TransportError::ContractViolation { .. } => false,
            TransportError::Shutdown => false,
        }
    }

    /// 是否为超时（"可以再试"），区别于连接已损坏
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }

    /// 获取错误代码
    pub fn error_code(&self) -> &'static str {
        match self {
            TransportError::Connection { .. } => "CONNECTION_ERROR",
            TransportError::Timeout { .. } => "TIMEOUT_ERROR",
            TransportError::SessionClosed { .. } => "SESSION_CLOSED",
            TransportError::Configuration { .. } => "CONFIG_ERROR",
            TransportError::Listen { .. } => "LISTEN_ERROR",
            TransportError::ContractViolation { .. } => "CONTRACT_VIOLATION",
            TransportError::Shutdown => "SHUTDOWN",
        }
    }

    /// 添加会话上下文
    pub fn with_session(mut self, session_id: SessionId) -> Self {
        if let TransportError::Connection { reason, .. } = &mut self {
            if !reason.contains("session:") {
                *reason = format!("{} (session: {})", reason, session_id);
            }
        }
        self
    }
}

/// 便利构造函数
impl TransportError {
    /// 创建连接错误
    pub fn connection_error(reason: impl Into<String>, retryable: bool) -> Self {
        Self::Connection {
            reason: reason.into(),
            retryable,
        }
    }

    /// 创建超时错误
    pub fn timeout_error(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// 创建配置错误
    pub fn config_error(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// 创建监听错误
    pub fn listen_error(address: SocketAddr, reason: impl Into<String>) -> Self {
        Self::Listen {
            address,
            reason: reason.into(),
        }
    }

    /// 创建约定违反错误
    pub fn contract_violation(reason: impl Into<String>) -> Self {
        Self::ContractViolation {
            reason: reason.into(),
        }
    }

    pub fn session_closed(session_id: SessionId) -> Self {
        Self::SessionClosed { session_id }
    }
}

/// 从标准IO错误转换
impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            // 阻塞套接字的读写超时在不同平台上分别报告为 WouldBlock 或 TimedOut
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                TransportError::timeout_error(format!("io: {}", error))
            }
            kind => {
                let retryable = matches!(kind, std::io::ErrorKind::Interrupted);
                TransportError::Connection {
                    reason: format!("IO error: {}", error),
                    retryable,
                }
            }
        }
    }
}
