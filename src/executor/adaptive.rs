use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::runtime::Handle;

use crate::{
    Result,
    config::{AdaptiveConfig, ExecutorKind},
    error::TransportError,
    executor::{ExecutorStats, ScheduleFlags, ServiceExecutor, Task, run_task},
};

/// 自适应线程池执行器
///
/// 与 reactor 后端共享同一个 tokio 运行时：工作线程进入运行时上下文，
/// 任务内可以直接 `tokio::spawn`。线程数在 `reserved_threads` 与
/// `max_threads` 之间伸缩：队列中有任务且没有空闲线程时扩容，
/// 超出常驻数量的线程空闲 `idle_timeout` 后退出。
pub struct AdaptiveExecutor {
    inner: Arc<Inner>,
}

struct Inner {
    config: AdaptiveConfig,
    reactor: Handle,
    sender: Mutex<Option<flume::Sender<Task>>>,
    receiver: flume::Receiver<Task>,
    running: AtomicBool,
    threads_running: AtomicUsize,
    threads_in_use: AtomicUsize,
    tasks_executed: AtomicU64,
    next_worker: AtomicU64,
    exit_lock: Mutex<()>,
    worker_exited: Condvar,
}

impl AdaptiveExecutor {
    /// 创建绑定到 reactor 运行时的执行器
    pub fn new(config: AdaptiveConfig, reactor: Handle) -> Self {
        let (sender, receiver) = flume::unbounded();
        Self {
            inner: Arc::new(Inner {
                config,
                reactor,
                sender: Mutex::new(Some(sender)),
                receiver,
                running: AtomicBool::new(false),
                threads_running: AtomicUsize::new(0),
                threads_in_use: AtomicUsize::new(0),
                tasks_executed: AtomicU64::new(0),
                next_worker: AtomicU64::new(0),
                exit_lock: Mutex::new(()),
                worker_exited: Condvar::new(),
            }),
        }
    }
}

/// 排队任务多于空闲线程时扩容，直到 `max_threads`
fn maybe_grow(inner: &Arc<Inner>) -> Result<()> {
    loop {
        let running = inner.threads_running.load(Ordering::SeqCst);
        let in_use = inner.threads_in_use.load(Ordering::SeqCst);
        let idle = running.saturating_sub(in_use);
        if inner.receiver.len() <= idle || running >= inner.config.max_threads {
            return Ok(());
        }
        if inner
            .threads_running
            .compare_exchange(running, running + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return spawn_worker(inner, false);
        }
    }
}

/// 调用方需已为新线程在 `threads_running` 上计数
fn spawn_worker(inner: &Arc<Inner>, reserved: bool) -> Result<()> {
    let worker_id = inner.next_worker.fetch_add(1, Ordering::Relaxed);
    let worker_inner = inner.clone();
    let spawned = std::thread::Builder::new()
        .name(format!("adaptive-{}", worker_id))
        .spawn(move || worker_loop(worker_inner, reserved));

    match spawned {
        Ok(_) => {
            tracing::debug!("🧵 自适应执行器启动工作线程 adaptive-{} (常驻: {})", worker_id, reserved);
            Ok(())
        }
        Err(e) => {
            inner.on_worker_exit();
            Err(TransportError::connection_error(
                format!("failed to spawn adaptive worker: {}", e),
                true,
            ))
        }
    }
}

fn worker_loop(inner: Arc<Inner>, reserved: bool) {
    let _reactor = inner.reactor.enter();
    let idle_timeout = inner.config.idle_timeout();

    loop {
        let task = if reserved {
            match inner.receiver.recv() {
                Ok(task) => task,
                Err(_) => break,
            }
        } else {
            match inner.receiver.recv_timeout(idle_timeout) {
                Ok(task) => task,
                Err(flume::RecvTimeoutError::Timeout) => {
                    tracing::debug!("💤 自适应执行器空闲线程退出");
                    break;
                }
                Err(flume::RecvTimeoutError::Disconnected) => break,
            }
        };

        inner.threads_in_use.fetch_add(1, Ordering::SeqCst);
        if !inner.receiver.is_empty() {
            if let Err(e) = maybe_grow(&inner) {
                tracing::warn!("⚠️ 自适应执行器扩容失败: {}", e);
            }
        }
        run_task(task);
        inner.threads_in_use.fetch_sub(1, Ordering::SeqCst);
        inner.tasks_executed.fetch_add(1, Ordering::Relaxed);
    }

    inner.on_worker_exit();
}

impl Inner {
    fn on_worker_exit(&self) {
        let _guard = self.exit_lock.lock();
        self.threads_running.fetch_sub(1, Ordering::SeqCst);
        self.worker_exited.notify_all();
    }
}

impl ServiceExecutor for AdaptiveExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Adaptive
    }

    fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for _ in 0..self.inner.config.reserved_threads {
            self.inner.threads_running.fetch_add(1, Ordering::SeqCst);
            spawn_worker(&self.inner, true)?;
        }

        tracing::info!(
            "🚀 自适应执行器已启动 (常驻线程: {}, 上限: {})",
            self.inner.config.reserved_threads,
            self.inner.config.max_threads
        );
        Ok(())
    }

    fn schedule(&self, task: Task, _flags: ScheduleFlags) -> Result<()> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(TransportError::Shutdown);
        }

        let sender = self.inner.sender.lock().clone().ok_or(TransportError::Shutdown)?;
        sender.send(task).map_err(|_| TransportError::Shutdown)?;
        maybe_grow(&self.inner)
    }

    fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.inner.running.store(false, Ordering::SeqCst);
        // 丢弃发送端后，工作线程取完剩余任务即退出
        self.inner.sender.lock().take();
        tracing::info!("🛑 关闭自适应执行器");

        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.exit_lock.lock();
        while self.inner.threads_running.load(Ordering::SeqCst) > 0 {
            if self.inner.worker_exited.wait_until(&mut guard, deadline).timed_out() {
                break;
            }
        }

        let remaining = self.inner.threads_running.load(Ordering::SeqCst);
        if remaining > 0 {
            tracing::warn!("⚠️ 关闭超时，仍有 {} 个自适应工作线程", remaining);
            return Err(TransportError::timeout_error("adaptive executor shutdown"));
        }
        Ok(())
    }

    fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            kind: ExecutorKind::Adaptive,
            threads_running: self.inner.threads_running.load(Ordering::SeqCst),
            threads_in_use: self.inner.threads_in_use.load(Ordering::SeqCst),
            tasks_executed: self.inner.tasks_executed.load(Ordering::Relaxed),
        }
    }
}
