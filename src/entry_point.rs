/// 服务入口
///
/// 后端接受连接后把会话交给服务入口。`SessionLoopEntryPoint` 为每个会话
/// 运行 读取 → 处理 → 写回 循环：每连接一个线程时使用阻塞的 `wait`，
/// 自适应执行器下使用 `async_wait`，回调再把后续工作调度回执行器。

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::{
    Result, SessionId,
    config::ExecutorKind,
    context::ServiceContext,
    error::TransportError,
    executor::ScheduleFlags,
    message::Message,
    session::SessionHandle,
    ticket::{Completion, Ticket},
    transport::{BackendId, TransportLayerManager},
};

/// 接收新会话的服务入口
pub trait ServiceEntryPoint: Send + Sync {
    /// 后端接受连接后调用；实现不得阻塞调用线程
    fn start_session(&self, session: SessionHandle);

    /// 结束全部仍在运行的会话
    fn end_all_sessions(&self);

    fn open_sessions(&self) -> usize;
}

/// 请求处理器：返回 `Some` 时写回响应
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, session: &SessionHandle, request: Message) -> Option<Message>;
}

impl<F> MessageHandler for F
where
    F: Fn(&SessionHandle, Message) -> Option<Message> + Send + Sync + 'static,
{
    fn handle(&self, session: &SessionHandle, request: Message) -> Option<Message> {
        self(session, request)
    }
}

/// 默认读超时：超时后重新发起读取，会话不结束
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SessionLoopEntryPoint<H: MessageHandler> {
    shared: Arc<Shared<H>>,
}

struct Shared<H> {
    context: Weak<ServiceContext>,
    handler: H,
    read_timeout: Duration,
    write_timeout: Duration,
    /// 各后端独立编号，会话 id 只在所属后端内唯一
    sessions: Mutex<HashMap<(BackendId, SessionId), SessionHandle>>,
}

fn session_key(session: &SessionHandle) -> (BackendId, SessionId) {
    (session.backend_id(), session.id())
}

impl<H: MessageHandler> SessionLoopEntryPoint<H> {
    pub fn new(context: &Arc<ServiceContext>, handler: H) -> Arc<Self> {
        Self::with_timeouts(context, handler, DEFAULT_READ_TIMEOUT, DEFAULT_WRITE_TIMEOUT)
    }

    pub fn with_timeouts(
        context: &Arc<ServiceContext>,
        handler: H,
        read_timeout: Duration,
        write_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared {
                context: Arc::downgrade(context),
                handler,
                read_timeout,
                write_timeout,
                sessions: Mutex::new(HashMap::new()),
            }),
        })
    }
}

impl<H: MessageHandler> ServiceEntryPoint for SessionLoopEntryPoint<H> {
    fn start_session(&self, session: SessionHandle) {
        self.shared.sessions.lock().insert(session_key(&session), session.clone());
        tracing::debug!("🎬 开始会话循环: {} ({})", session.id(), session.peer_addr());
        self.shared.schedule(session, ScheduleFlags::NEW_SESSION);
    }

    fn end_all_sessions(&self) {
        let sessions: Vec<SessionHandle> = self.shared.sessions.lock().drain().map(|(_, s)| s).collect();
        if sessions.is_empty() {
            return;
        }
        tracing::info!("🛑 结束 {} 个会话", sessions.len());
        let manager = self.shared.manager();
        for session in &sessions {
            match &manager {
                Some(manager) => manager.end(session),
                None => tracing::warn!("⚠️ 无传输层，无法结束 {}", session.id()),
            }
        }
    }

    fn open_sessions(&self) -> usize {
        self.shared.sessions.lock().len()
    }
}

impl<H: MessageHandler> Shared<H> {
    fn manager(&self) -> Option<Arc<TransportLayerManager>> {
        self.context.upgrade().and_then(|context| context.transport_layer())
    }

    /// 把会话的下一轮读取交给执行器
    fn schedule(self: &Arc<Self>, session: SessionHandle, flags: ScheduleFlags) {
        let Some(executor) = self.context.upgrade().and_then(|context| context.service_executor()) else {
            self.finish(&session, TransportError::Shutdown);
            return;
        };

        let this = self.clone();
        let task_session = session.clone();
        if let Err(e) = executor.schedule(Box::new(move || this.read_next(task_session)), flags) {
            self.finish(&session, e);
        }
    }

    fn read_next(self: Arc<Self>, session: SessionHandle) {
        let Some(manager) = self.manager() else {
            self.finish(&session, TransportError::Shutdown);
            return;
        };
        match manager.source_message(&session, Instant::now() + self.read_timeout) {
            Ok(ticket) => self.resolve(&manager, session, ticket, Self::on_request),
            Err(e) => self.finish(&session, e),
        }
    }

    fn on_request(self: Arc<Self>, session: SessionHandle, result: Result<Completion>) {
        match result {
            Ok(completion) => {
                let reply = completion
                    .into_message()
                    .and_then(|request| self.handler.handle(&session, request));
                match reply {
                    Some(reply) => self.write_reply(session, reply),
                    None => self.schedule(session, ScheduleFlags::NONE),
                }
            }
            Err(e) if e.is_timeout() => {
                tracing::debug!("⏰ {} 读取超时，继续等待", session.id());
                self.schedule(session, ScheduleFlags::NONE);
            }
            Err(e) => self.finish(&session, e),
        }
    }

    fn write_reply(self: Arc<Self>, session: SessionHandle, reply: Message) {
        let Some(manager) = self.manager() else {
            self.finish(&session, TransportError::Shutdown);
            return;
        };
        match manager.sink_message(&session, reply, Instant::now() + self.write_timeout) {
            Ok(ticket) => self.resolve(&manager, session, ticket, Self::on_reply_sent),
            Err(e) => self.finish(&session, e),
        }
    }

    fn on_reply_sent(self: Arc<Self>, session: SessionHandle, result: Result<Completion>) {
        match result {
            Ok(_) => self.schedule(session, ScheduleFlags::NONE),
            Err(e) => self.finish(&session, e),
        }
    }

    /// 按执行模型完成票据，并把结果交给 `next`
    fn resolve(
        self: Arc<Self>,
        manager: &TransportLayerManager,
        session: SessionHandle,
        ticket: Ticket,
        next: fn(Arc<Self>, SessionHandle, Result<Completion>),
    ) {
        let executor = self.context.upgrade().and_then(|context| context.service_executor());
        let Some(executor) = executor else {
            self.finish(&session, TransportError::Shutdown);
            return;
        };

        match executor.kind() {
            ExecutorKind::ThreadPerConnection => {
                let result = manager.wait(ticket);
                next(self, session, result);
            }
            ExecutorKind::Adaptive => {
                manager.async_wait(
                    ticket,
                    Box::new(move |result| {
                        // 回调在 reactor 线程上触发，处理逻辑回到执行器上运行
                        let this = self.clone();
                        let task_session = session.clone();
                        let scheduled = executor.schedule(
                            Box::new(move || next(this, task_session, result)),
                            ScheduleFlags::NONE,
                        );
                        if let Err(e) = scheduled {
                            self.finish(&session, e);
                        }
                    }),
                );
            }
        }
    }

    fn finish(&self, session: &SessionHandle, reason: TransportError) {
        if self.sessions.lock().remove(&session_key(session)).is_none() {
            return;
        }
        match &reason {
            TransportError::SessionClosed { .. } | TransportError::Shutdown => {
                tracing::debug!("📴 会话结束: {} ({})", session.id(), reason)
            }
            _ => tracing::info!("📴 会话结束: {} ({})", session.id(), reason),
        }
        if let Some(manager) = self.manager() {
            manager.end(session);
        }
    }
}
