/// 基于 reactor 的异步后端
///
/// 后端拥有一个多线程 tokio 运行时作为 reactor。每个会话由一个 tokio 任务
/// 驱动：`source_message` / `sink_message` 把操作投递到该任务的队列，
/// 任务按投递顺序逐个执行，因此同一会话的读写不会乱序。

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Handle, Runtime, RuntimeFlavor};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::{
    Result, SessionId,
    config::TransportLayerConfig,
    entry_point::ServiceEntryPoint,
    error::TransportError,
    message::{Message, frame_codec},
    session::{Session, SessionHandle},
    ticket::{Completion, OnceCallback, PendingOp, Ticket, TicketCallback, TicketKind},
    transport::{BackendId, LifecycleState, TransportBackend},
};

/// reactor 后端选项
#[derive(Debug, Clone)]
pub struct ReactorOptions {
    pub bind_addresses: Vec<SocketAddr>,
    pub max_connections: usize,
    /// reactor I/O 线程数
    pub worker_threads: usize,
}

impl ReactorOptions {
    pub fn from_config(config: &TransportLayerConfig) -> Self {
        Self {
            bind_addresses: config.bind_addresses.clone(),
            max_connections: config.max_connections,
            worker_threads: config.reactor.worker_threads,
        }
    }
}

/// 会话任务执行的操作
enum SessionOp {
    Source {
        deadline: Instant,
        reply: oneshot::Sender<Result<Completion>>,
    },
    Sink {
        message: Message,
        deadline: Instant,
        reply: oneshot::Sender<Result<Completion>>,
    },
}

/// 会话表中的一项
struct SessionSlot {
    ops: mpsc::UnboundedSender<SessionOp>,
    cancel: CancellationToken,
}

type SessionTable = Arc<Mutex<HashMap<SessionId, SessionSlot>>>;

pub struct ReactorBackend {
    id: BackendId,
    self_ref: Weak<ReactorBackend>,
    options: ReactorOptions,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    entry_point: Arc<dyn ServiceEntryPoint>,
    state: Mutex<LifecycleState>,
    /// setup 绑定、start 取走的监听套接字
    listeners: Mutex<Vec<std::net::TcpListener>>,
    local_addrs: Mutex<Vec<SocketAddr>>,
    sessions: SessionTable,
    next_session_id: AtomicU64,
    shutdown_token: CancellationToken,
}

impl ReactorBackend {
    /// 创建后端及其 reactor 运行时；此时尚未决定执行模型
    pub fn new(options: ReactorOptions, entry_point: Arc<dyn ServiceEntryPoint>) -> Result<Arc<Self>> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(options.worker_threads)
            .thread_name("reactor")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();

        Ok(Arc::new_cyclic(|self_ref| Self {
            id: BackendId::next(),
            self_ref: self_ref.clone(),
            options,
            runtime: Mutex::new(Some(runtime)),
            handle,
            entry_point,
            state: Mutex::new(LifecycleState::Created),
            listeners: Mutex::new(Vec::new()),
            local_addrs: Mutex::new(Vec::new()),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            next_session_id: AtomicU64::new(1),
            shutdown_token: CancellationToken::new(),
        }))
    }

    /// reactor 运行时句柄，自适应执行器与后端共享它
    pub fn reactor_handle(&self) -> Handle {
        self.handle.clone()
    }

    fn check_owner(&self, session: &Session) -> Result<()> {
        if session.backend_id() != self.id {
            return Err(TransportError::contract_violation(format!(
                "{} is owned by {}, not {}",
                session.id(),
                session.backend_id(),
                self.id
            )));
        }
        Ok(())
    }

    fn submit(&self, session: &Session, op: SessionOp) -> Result<()> {
        let sessions = self.sessions.lock();
        let slot = sessions
            .get(&session.id())
            .ok_or_else(|| TransportError::session_closed(session.id()))?;
        slot.ops
            .send(op)
            .map_err(|_| TransportError::session_closed(session.id()))
    }

    fn pending(&self, kind: TicketKind, session: &Session, reply: oneshot::Receiver<Result<Completion>>) -> Box<dyn PendingOp> {
        Box::new(ReactorPendingOp {
            kind,
            session_id: session.id(),
            reply,
            handle: self.handle.clone(),
        })
    }

    /// 接受到新连接
    fn on_accepted(&self, stream: TcpStream, peer_addr: SocketAddr) {
        if self.shutdown_token.is_cancelled() {
            return;
        }

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("设置 TCP_NODELAY 失败 ({}): {}", peer_addr, e);
        }
        let local_addr = match stream.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::warn!("⚠️ 无法获取本地地址，丢弃连接 {}: {}", peer_addr, e);
                return;
            }
        };

        let session_id = SessionId::new(self.next_session_id.fetch_add(1, Ordering::SeqCst));
        let backend: Weak<dyn TransportBackend> = self.self_ref.clone();
        let session = Session::new(session_id, self.id, backend, local_addr, peer_addr);

        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let cancel = self.shutdown_token.child_token();
        {
            // 多个接受循环并发时，计数与插入必须在同一把锁下完成
            let mut sessions = self.sessions.lock();
            if sessions.len() >= self.options.max_connections {
                tracing::warn!(
                    "⚠️ 拒绝来自 {} 的连接：已达到最大连接数 {}",
                    peer_addr,
                    self.options.max_connections
                );
                return;
            }
            sessions.insert(
                session_id,
                SessionSlot {
                    ops: ops_tx,
                    cancel: cancel.clone(),
                },
            );
        }
        self.handle
            .spawn(run_session(session_id, stream, ops_rx, cancel, self.sessions.clone()));

        tracing::info!("🔗 {} 接受新连接 {} ({})", self.id, session_id, peer_addr);
        self.entry_point.start_session(session);
    }
}

async fn accept_loop(backend: Weak<ReactorBackend>, listener: TcpListener, token: CancellationToken) {
    let local_addr = listener.local_addr().ok();
    tracing::debug!("🚀 reactor 接受循环启动: {:?}", local_addr);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    let Some(backend) = backend.upgrade() else { break };
                    backend.on_accepted(stream, peer_addr);
                }
                Err(e) => {
                    tracing::error!("❌ 接受连接失败 ({:?}): {}", local_addr, e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }

    tracing::debug!("🛑 reactor 接受循环结束: {:?}", local_addr);
}

/// 会话任务：按投递顺序执行读写操作
async fn run_session(
    session_id: SessionId,
    stream: TcpStream,
    mut ops: mpsc::UnboundedReceiver<SessionOp>,
    cancel: CancellationToken,
    sessions: SessionTable,
) {
    let mut framed = Framed::new(stream, frame_codec());
    // 已读出但等待者已离开的消息，交给下一次读取
    let mut undelivered: Option<Message> = None;

    loop {
        let op = tokio::select! {
            _ = cancel.cancelled() => break,
            op = ops.recv() => match op {
                Some(op) => op,
                None => break,
            },
        };

        let broken = match op {
            SessionOp::Source { deadline, mut reply } => {
                let (result, broken) = if let Some(message) = undelivered.take() {
                    (Ok(Completion::Received(message)), false)
                } else if reply.is_closed() {
                    // 票据已被丢弃或等待已超时，不替它消费数据
                    continue;
                } else if Instant::now() >= deadline {
                    (Err(TransportError::timeout_error("source")), false)
                } else {
                    tokio::select! {
                        _ = cancel.cancelled() => (Err(TransportError::session_closed(session_id)), true),
                        _ = reply.closed() => continue,
                        // FramedRead 的读取可安全取消，超时不会丢失已缓冲的部分帧
                        read = tokio::time::timeout_at(deadline.into(), framed.next()) => match read {
                            Err(_) => (Err(TransportError::timeout_error("source")), false),
                            Ok(Some(Ok(payload))) => (Ok(Completion::Received(Message::from_payload(&payload))), false),
                            Ok(Some(Err(e))) => (Err(TransportError::from(e).with_session(session_id)), true),
                            Ok(None) => (
                                Err(TransportError::connection_error("connection closed by peer", false).with_session(session_id)),
                                true,
                            ),
                        },
                    }
                };
                if let Err(Ok(Completion::Received(message))) = reply.send(result) {
                    undelivered = Some(message);
                }
                broken
            }
            SessionOp::Sink { message, deadline, reply } => {
                let (result, broken) = if reply.is_closed() {
                    continue;
                } else if Instant::now() >= deadline {
                    (Err(TransportError::timeout_error("sink")), false)
                } else {
                    tokio::select! {
                        _ = cancel.cancelled() => (Err(TransportError::session_closed(session_id)), true),
                        // 写到一半超时会留下不完整的帧，之后连接不可再用
                        written = tokio::time::timeout_at(deadline.into(), framed.send(message.payload())) => match written {
                            Err(_) => (Err(TransportError::timeout_error("sink")), true),
                            Ok(Ok(())) => (Ok(Completion::Sent), false),
                            Ok(Err(e)) => (Err(TransportError::from(e).with_session(session_id)), true),
                        },
                    }
                };
                let _ = reply.send(result);
                broken
            }
        };

        if broken {
            break;
        }
    }

    // 剩余操作的回复端随队列一起丢弃，等待者得到 SessionClosed
    sessions.lock().remove(&session_id);
    tracing::debug!("📥 会话任务结束: {}", session_id);
}

/// reactor 后端的挂起操作：等待会话任务的回复
struct ReactorPendingOp {
    kind: TicketKind,
    session_id: SessionId,
    reply: oneshot::Receiver<Result<Completion>>,
    handle: Handle,
}

async fn await_reply(
    kind: TicketKind,
    session_id: SessionId,
    mut reply: oneshot::Receiver<Result<Completion>>,
    deadline: Instant,
) -> Result<Completion> {
    match tokio::time::timeout_at(deadline.into(), &mut reply).await {
        Err(_) => {
            // 关闭后会话任务不再投递；关闭前已送达的结果仍然交付
            reply.close();
            match reply.try_recv() {
                Ok(result) => result,
                Err(_) => Err(TransportError::timeout_error(kind.as_str())),
            }
        }
        Ok(Err(_)) => Err(TransportError::session_closed(session_id)),
        Ok(Ok(result)) => result,
    }
}

/// 在 reactor 上阻塞等待
///
/// 多线程运行时的工作线程先让出；current-thread 运行时不能让出，
/// 改由临时线程进入 reactor 等待。
fn block_on<F>(handle: &Handle, future: F) -> F::Output
where
    F: Future + Send,
    F::Output: Send,
{
    match Handle::try_current() {
        Err(_) => handle.block_on(future),
        Ok(current) if current.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| handle.block_on(future))
        }
        Ok(_) => std::thread::scope(|scope| {
            match scope.spawn(|| handle.block_on(future)).join() {
                Ok(output) => output,
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }),
    }
}

impl PendingOp for ReactorPendingOp {
    fn wait(self: Box<Self>, deadline: Instant) -> Result<Completion> {
        let ReactorPendingOp { kind, session_id, reply, handle } = *self;
        block_on(&handle, await_reply(kind, session_id, reply, deadline))
    }

    fn async_wait(self: Box<Self>, deadline: Instant, callback: TicketCallback) {
        let ReactorPendingOp { kind, session_id, reply, handle } = *self;
        let callback = OnceCallback::new(callback);
        handle.spawn(async move {
            let result = await_reply(kind, session_id, reply, deadline).await;
            callback.fire(result);
        });
    }
}

impl TransportBackend for ReactorBackend {
    fn id(&self) -> BackendId {
        self.id
    }

    fn name(&self) -> &'static str {
        "reactor"
    }

    fn setup(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            LifecycleState::Created => {}
            LifecycleState::Ready | LifecycleState::Running => return Ok(()),
            LifecycleState::ShutDown => return Err(TransportError::Shutdown),
        }

        let mut bound = Vec::with_capacity(self.options.bind_addresses.len());
        let mut addrs = Vec::with_capacity(self.options.bind_addresses.len());
        for address in &self.options.bind_addresses {
            // 失败时 bound 中已绑定的监听套接字随函数返回一起释放
            let listener = std::net::TcpListener::bind(address)
                .and_then(|listener| listener.set_nonblocking(true).map(|_| listener))
                .map_err(|e| TransportError::listen_error(*address, e.to_string()))?;
            addrs.push(listener.local_addr().map_err(|e| TransportError::listen_error(*address, e.to_string()))?);
            bound.push(listener);
        }

        tracing::info!("📍 {} 绑定监听地址: {:?}", self.id, addrs);
        *self.listeners.lock() = bound;
        *self.local_addrs.lock() = addrs;
        *state = LifecycleState::Ready;
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            LifecycleState::Ready => {}
            LifecycleState::Running => return Ok(()),
            LifecycleState::Created => {
                return Err(TransportError::contract_violation("reactor backend started before setup"));
            }
            LifecycleState::ShutDown => return Err(TransportError::Shutdown),
        }

        let _guard = self.handle.enter();
        let mut listeners = Vec::new();
        for listener in self.listeners.lock().drain(..) {
            let address = listener.local_addr().ok();
            let listener = TcpListener::from_std(listener).map_err(|e| {
                TransportError::connection_error(format!("failed to register listener {:?}: {}", address, e), false)
            })?;
            listeners.push(listener);
        }
        for listener in listeners {
            self.handle
                .spawn(accept_loop(self.self_ref.clone(), listener, self.shutdown_token.child_token()));
        }

        *state = LifecycleState::Running;
        tracing::info!("🌟 {} 开始接受连接", self.id);
        Ok(())
    }

    fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if *state == LifecycleState::ShutDown {
                return;
            }
            *state = LifecycleState::ShutDown;
        }

        self.shutdown_token.cancel();
        self.listeners.lock().clear();
        let ended: Vec<SessionSlot> = self.sessions.lock().drain().map(|(_, slot)| slot).collect();
        for slot in &ended {
            slot.cancel.cancel();
        }
        tracing::info!("🛑 {} 已关闭，结束 {} 个会话", self.id, ended.len());
    }

    fn source_message(&self, session: &SessionHandle, deadline: Instant) -> Result<Ticket> {
        self.check_owner(session)?;
        let (reply_tx, reply_rx) = oneshot::channel();
        self.submit(session, SessionOp::Source { deadline, reply: reply_tx })?;
        tracing::debug!("📥 {} 发起读取", session.id());
        Ok(Ticket::new(TicketKind::Source, session, deadline, self.pending(TicketKind::Source, session, reply_rx)))
    }

    fn sink_message(&self, session: &SessionHandle, message: Message, deadline: Instant) -> Result<Ticket> {
        self.check_owner(session)?;
        message.ensure_sendable()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let size = message.len();
        self.submit(session, SessionOp::Sink { message, deadline, reply: reply_tx })?;
        tracing::debug!("📤 {} 发起写出 ({} bytes)", session.id(), size);
        Ok(Ticket::new(TicketKind::Sink, session, deadline, self.pending(TicketKind::Sink, session, reply_rx)))
    }

    fn wait(&self, ticket: Ticket) -> Result<Completion> {
        let (op, deadline) = ticket.claim(self.id)?;
        op.wait(deadline)
    }

    fn async_wait(&self, ticket: Ticket, callback: TicketCallback) {
        match ticket.claim(self.id) {
            Ok((op, deadline)) => op.async_wait(deadline, callback),
            Err(e) => {
                // 回调总在执行器线程上触发，而不是在调用线程上
                let callback = OnceCallback::new(callback);
                self.handle.spawn(async move { callback.fire(Err(e)) });
            }
        }
    }

    fn end(&self, session: &SessionHandle) {
        if session.backend_id() != self.id {
            tracing::warn!("⚠️ 忽略对非本后端会话 {} 的 end 调用", session.id());
            return;
        }
        if let Some(slot) = self.sessions.lock().remove(&session.id()) {
            slot.cancel.cancel();
            tracing::info!("🗑️ {} 结束会话 {}", self.id, session.id());
        }
    }

    fn local_addrs(&self) -> Vec<SocketAddr> {
        self.local_addrs.lock().clone()
    }

    fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

impl Drop for ReactorBackend {
    fn drop(&mut self) {
        self.shutdown();
        // 最后一个引用可能在 reactor 线程上被释放，不能阻塞等待运行时退出
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
    }
}
