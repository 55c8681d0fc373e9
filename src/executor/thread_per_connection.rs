use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::{
    Result,
    config::ExecutorKind,
    error::TransportError,
    executor::{ExecutorStats, ScheduleFlags, ServiceExecutor, Task, run_task},
};

thread_local! {
    /// 当前工作线程的本地任务队列；非工作线程上为 `None`
    static LOCAL_TASKS: RefCell<Option<VecDeque<Task>>> = const { RefCell::new(None) };
}

/// 每连接一个线程的执行器
///
/// 新会话的第一个任务获得专用线程；之后该线程上调度的任务进入线程本地
/// 队列，在当前任务返回后依次执行，不会递归。
pub struct ThreadPerConnectionExecutor {
    inner: Arc<Inner>,
}

struct Inner {
    running: AtomicBool,
    live_workers: Mutex<usize>,
    workers_done: Condvar,
    threads_in_use: AtomicUsize,
    tasks_executed: AtomicU64,
    next_worker: AtomicU64,
}

impl ThreadPerConnectionExecutor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                running: AtomicBool::new(false),
                live_workers: Mutex::new(0),
                workers_done: Condvar::new(),
                threads_in_use: AtomicUsize::new(0),
                tasks_executed: AtomicU64::new(0),
                next_worker: AtomicU64::new(0),
            }),
        }
    }

    fn spawn_worker(&self, task: Task) -> Result<()> {
        let worker_id = self.inner.next_worker.fetch_add(1, Ordering::Relaxed);
        *self.inner.live_workers.lock() += 1;

        let inner = self.inner.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("conn-{}", worker_id))
            .spawn(move || worker_loop(inner, task));

        if let Err(e) = spawned {
            self.inner.worker_exited();
            return Err(TransportError::connection_error(
                format!("failed to spawn connection worker: {}", e),
                true,
            ));
        }
        tracing::debug!("🧵 启动连接工作线程 conn-{}", worker_id);
        Ok(())
    }
}

impl Default for ThreadPerConnectionExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn worker_exited(&self) {
        let mut live = self.live_workers.lock();
        *live = live.saturating_sub(1);
        if *live == 0 {
            self.workers_done.notify_all();
        }
    }
}

fn worker_loop(inner: Arc<Inner>, first: Task) {
    LOCAL_TASKS.with(|tasks| *tasks.borrow_mut() = Some(VecDeque::new()));

    let mut next = Some(first);
    while let Some(task) = next {
        inner.threads_in_use.fetch_add(1, Ordering::SeqCst);
        run_task(task);
        inner.threads_in_use.fetch_sub(1, Ordering::SeqCst);
        inner.tasks_executed.fetch_add(1, Ordering::Relaxed);

        next = LOCAL_TASKS.with(|tasks| tasks.borrow_mut().as_mut().and_then(|queue| queue.pop_front()));
    }

    LOCAL_TASKS.with(|tasks| *tasks.borrow_mut() = None);
    inner.worker_exited();
}

impl ServiceExecutor for ThreadPerConnectionExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::ThreadPerConnection
    }

    fn start(&self) -> Result<()> {
        self.inner.running.store(true, Ordering::SeqCst);
        tracing::info!("🚀 每连接线程执行器已启动");
        Ok(())
    }

    fn schedule(&self, task: Task, flags: ScheduleFlags) -> Result<()> {
        if !self.inner.running.load(Ordering::SeqCst) {
            return Err(TransportError::Shutdown);
        }

        if !flags.new_session {
            // 已在工作线程上：排入本地队列
            let rejected = LOCAL_TASKS.with(|tasks| match tasks.borrow_mut().as_mut() {
                Some(queue) => {
                    queue.push_back(task);
                    None
                }
                None => Some(task),
            });
            match rejected {
                None => return Ok(()),
                Some(task) => return self.spawn_worker(task),
            }
        }

        self.spawn_worker(task)
    }

    fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.inner.running.store(false, Ordering::SeqCst);
        tracing::info!("🛑 关闭每连接线程执行器");

        let deadline = Instant::now() + timeout;
        let mut live = self.inner.live_workers.lock();
        while *live > 0 {
            if self.inner.workers_done.wait_until(&mut live, deadline).timed_out() {
                break;
            }
        }

        if *live > 0 {
            tracing::warn!("⚠️ 关闭超时，仍有 {} 个连接工作线程", *live);
            return Err(TransportError::timeout_error("thread-per-connection executor shutdown"));
        }
        Ok(())
    }

    fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            kind: ExecutorKind::ThreadPerConnection,
            threads_running: *self.inner.live_workers.lock(),
            threads_in_use: self.inner.threads_in_use.load(Ordering::SeqCst),
            tasks_executed: self.inner.tasks_executed.load(Ordering::Relaxed),
        }
    }
}
