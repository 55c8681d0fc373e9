/// 服务执行器
///
/// 会话数据就绪后，应用层工作交给执行器运行。执行模型在构造时
/// 依据配置选定，运行期间不可更换。

pub mod adaptive;
pub mod thread_per_connection;

use std::time::Duration;

use crate::{Result, config::ExecutorKind};

pub use adaptive::AdaptiveExecutor;
pub use thread_per_connection::ThreadPerConnectionExecutor;

/// 执行器运行的一个工作单元
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// 调度标志
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleFlags {
    /// 新会话的第一个任务
    pub new_session: bool,
}

impl ScheduleFlags {
    pub const NONE: ScheduleFlags = ScheduleFlags { new_session: false };
    pub const NEW_SESSION: ScheduleFlags = ScheduleFlags { new_session: true };
}

/// 执行器统计信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorStats {
    pub kind: ExecutorKind,
    /// 存活的工作线程
    pub threads_running: usize,
    /// 正在执行任务的工作线程
    pub threads_in_use: usize,
    /// 已执行完的任务数
    pub tasks_executed: u64,
}

pub trait ServiceExecutor: Send + Sync {
    fn kind(&self) -> ExecutorKind;

    /// 启动执行器（创建常驻线程等）
    fn start(&self) -> Result<()>;

    /// 调度一个任务；执行器关闭后返回 `TransportError::Shutdown`
    fn schedule(&self, task: Task, flags: ScheduleFlags) -> Result<()>;

    /// 停止接受任务并等待工作线程退出
    fn shutdown(&self, timeout: Duration) -> Result<()>;

    fn stats(&self) -> ExecutorStats;
}

/// 执行一个任务，任务内的 panic 不会带走工作线程
pub(crate) fn run_task(task: Task) {
    if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)) {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        tracing::error!("❌ 执行器任务 panic: {}", reason);
    }
}
