/// transtick - 可替换后端的服务端传输层
///
/// 一个管理器统一协调若干网络后端（基于 reactor 的异步后端、阻塞式 legacy
/// 后端）的生命周期，并把单连接的读写路由到拥有该连接的后端。
/// 每次读写都是一张带截止时间的票据，用 `wait` 阻塞完成或用 `async_wait`
/// 回调完成。执行模型（每连接一个线程 / 绑定 reactor 的自适应线程池）
/// 在构造时依据配置选定。

// 传输层
pub mod transport;

// 核心类型
pub mod error;
pub mod message;
pub mod session;
pub mod ticket;

// 运行时组件
pub mod config;
pub mod context;
pub mod entry_point;
pub mod executor;

/// 会话ID的类型安全包装器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// 创建新的会话ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// 获取原始ID值
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

impl From<u64> for SessionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<SessionId> for u64 {
    fn from(session_id: SessionId) -> Self {
        session_id.0
    }
}

// 重新导出核心类型
pub use error::TransportError;
pub use message::{Message, MAX_MESSAGE_SIZE};
pub use session::{Session, SessionHandle};
pub use ticket::{Completion, Ticket, TicketCallback, TicketKind};
pub use transport::{
    BackendId,
    LegacyBackend,
    ReactorBackend,
    TransportBackend,
    TransportLayerManager,
};
pub use config::{BackendKind, ExecutorKind, TransportLayerConfig};
pub use context::ServiceContext;
pub use entry_point::{MessageHandler, ServiceEntryPoint, SessionLoopEntryPoint};
pub use executor::{ScheduleFlags, ServiceExecutor};

// 便捷的类型别名
pub type Result<T> = std::result::Result<T, TransportError>;
