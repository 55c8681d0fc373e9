/// 传输层
///
/// `TransportBackend` 是每种网络后端必须提供的能力集合；
/// `TransportLayerManager` 负责后端的统一生命周期，并把单连接操作
/// 路由到拥有该连接的后端。

pub mod legacy;
pub mod manager;
pub mod reactor;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::{
    Result,
    message::Message,
    session::SessionHandle,
    ticket::{Completion, Ticket, TicketCallback},
};

pub use legacy::{LegacyBackend, LegacyOptions};
pub use manager::TransportLayerManager;
pub use reactor::{ReactorBackend, ReactorOptions};

static NEXT_BACKEND_ID: AtomicU64 = AtomicU64::new(1);

/// 后端实例标识，票据用它校验归属
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendId(u64);

impl BackendId {
    /// 分配一个进程内唯一的标识
    pub fn next() -> Self {
        Self(NEXT_BACKEND_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for BackendId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "backend-{}", self.0)
    }
}

/// 后端生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LifecycleState {
    Created,
    /// 已绑定监听，尚未接受连接
    Ready,
    Running,
    ShutDown,
}

/// 网络后端能力接口
///
/// 生命周期：`setup`（绑定监听）→ `start`（开始接受连接）→ `shutdown`。
/// 单连接操作返回的票据只能由本后端完成。
pub trait TransportBackend: Send + Sync {
    fn id(&self) -> BackendId;

    /// 后端名称（用于日志）
    fn name(&self) -> &'static str;

    /// 绑定监听资源，但还不接受连接
    ///
    /// 失败时不得留下已绑定的监听套接字。
    fn setup(&self) -> Result<()>;

    /// 开始接受连接
    fn start(&self) -> Result<()>;

    /// 释放全部监听与会话资源；尽力而为，不返回错误
    fn shutdown(&self);

    /// 发起一次读取
    fn source_message(&self, session: &SessionHandle, deadline: Instant) -> Result<Ticket>;

    /// 发起一次写出
    fn sink_message(&self, session: &SessionHandle, message: Message, deadline: Instant) -> Result<Ticket>;

    /// 阻塞等待票据完成
    fn wait(&self, ticket: Ticket) -> Result<Completion>;

    /// 注册票据完成回调
    fn async_wait(&self, ticket: Ticket, callback: TicketCallback);

    /// 强制结束会话
    fn end(&self, session: &SessionHandle);

    /// 实际绑定的监听地址
    fn local_addrs(&self) -> Vec<SocketAddr>;

    /// 当前活跃会话数
    fn session_count(&self) -> usize;
}
