/// 阻塞式 legacy 后端
///
/// 使用 `std::net` 阻塞套接字。读写操作推迟到 `wait` 时在等待线程上执行，
/// 持有会话的流锁期间完成，因此同一会话上的操作按取得锁的顺序串行。
/// 只能与每连接一个线程的执行器搭配。

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::{
    Result, SessionId,
    config::TransportLayerConfig,
    entry_point::ServiceEntryPoint,
    error::TransportError,
    message::{Message, read_message, write_message},
    session::{Session, SessionHandle},
    ticket::{Completion, OnceCallback, PendingOp, Ticket, TicketCallback, TicketKind},
    transport::{BackendId, LifecycleState, TransportBackend},
};

/// 接受循环轮询非阻塞监听套接字的间隔
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// legacy 后端选项
#[derive(Debug, Clone)]
pub struct LegacyOptions {
    pub bind_addresses: Vec<SocketAddr>,
    pub max_connections: usize,
}

impl LegacyOptions {
    pub fn from_config(config: &TransportLayerConfig) -> Self {
        Self {
            bind_addresses: config.bind_addresses.clone(),
            max_connections: config.max_connections,
        }
    }
}

/// 一个阻塞连接
struct LegacyConnection {
    stream: Mutex<TcpStream>,
    /// 用于强制关闭的克隆句柄，不受流锁约束
    control: TcpStream,
    closed: AtomicBool,
}

impl LegacyConnection {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.control.shutdown(Shutdown::Both) {
                if e.kind() != ErrorKind::NotConnected {
                    tracing::debug!("关闭连接失败: {}", e);
                }
            }
        }
    }
}

type ConnectionTable = Arc<Mutex<HashMap<SessionId, Arc<LegacyConnection>>>>;

pub struct LegacyBackend {
    id: BackendId,
    self_ref: Weak<LegacyBackend>,
    options: LegacyOptions,
    entry_point: Arc<dyn ServiceEntryPoint>,
    state: Mutex<LifecycleState>,
    listeners: Mutex<Vec<TcpListener>>,
    local_addrs: Mutex<Vec<SocketAddr>>,
    connections: ConnectionTable,
    next_session_id: AtomicU64,
    accepting: Arc<AtomicBool>,
    accept_threads: Mutex<Vec<JoinHandle<()>>>,
}

impl LegacyBackend {
    pub fn new(options: LegacyOptions, entry_point: Arc<dyn ServiceEntryPoint>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            id: BackendId::next(),
            self_ref: self_ref.clone(),
            options,
            entry_point,
            state: Mutex::new(LifecycleState::Created),
            listeners: Mutex::new(Vec::new()),
            local_addrs: Mutex::new(Vec::new()),
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_session_id: AtomicU64::new(1),
            accepting: Arc::new(AtomicBool::new(false)),
            accept_threads: Mutex::new(Vec::new()),
        })
    }

    fn connection(&self, session: &Session) -> Result<Arc<LegacyConnection>> {
        if session.backend_id() != self.id {
            return Err(TransportError::contract_violation(format!(
                "{} is owned by {}, not {}",
                session.id(),
                session.backend_id(),
                self.id
            )));
        }
        self.connections
            .lock()
            .get(&session.id())
            .filter(|conn| !conn.closed.load(Ordering::SeqCst))
            .cloned()
            .ok_or_else(|| TransportError::session_closed(session.id()))
    }

    fn on_accepted(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let prepared = stream
            .set_nonblocking(false)
            .and_then(|_| stream.set_nodelay(true))
            .and_then(|_| Ok((stream.local_addr()?, stream.try_clone()?)));
        let (local_addr, control) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::warn!("⚠️ 初始化连接 {} 失败: {}", peer_addr, e);
                return;
            }
        };

        let session_id = SessionId::new(self.next_session_id.fetch_add(1, Ordering::SeqCst));
        let backend: Weak<dyn TransportBackend> = self.self_ref.clone();
        let session = Session::new(session_id, self.id, backend, local_addr, peer_addr);
        {
            let mut connections = self.connections.lock();
            if connections.len() >= self.options.max_connections {
                tracing::warn!(
                    "⚠️ 拒绝来自 {} 的连接：已达到最大连接数 {}",
                    peer_addr,
                    self.options.max_connections
                );
                return;
            }
            connections.insert(
                session_id,
                Arc::new(LegacyConnection {
                    stream: Mutex::new(stream),
                    control,
                    closed: AtomicBool::new(false),
                }),
            );
        }

        tracing::info!("🔗 {} 接受新连接 {} ({})", self.id, session_id, peer_addr);
        self.entry_point.start_session(session);
    }
}

fn accept_loop(backend: Weak<LegacyBackend>, listener: TcpListener, accepting: Arc<AtomicBool>) {
    let local_addr = listener.local_addr().ok();
    tracing::debug!("🚀 legacy 接受线程启动: {:?}", local_addr);

    while accepting.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                let Some(backend) = backend.upgrade() else { break };
                backend.on_accepted(stream, peer_addr);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => std::thread::sleep(ACCEPT_POLL_INTERVAL),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::error!("❌ 接受连接失败 ({:?}): {}", local_addr, e);
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }

    tracing::debug!("🛑 legacy 接受线程结束: {:?}", local_addr);
}

/// legacy 后端的挂起操作，真正的 I/O 在等待线程上进行
struct LegacyPendingOp {
    session_id: SessionId,
    connection: Arc<LegacyConnection>,
    connections: ConnectionTable,
    message: Option<Message>,
}

impl LegacyPendingOp {
    fn kind(&self) -> TicketKind {
        if self.message.is_some() { TicketKind::Sink } else { TicketKind::Source }
    }

    fn run(self, deadline: Instant) -> Result<Completion> {
        let kind = self.kind();
        let closed = || TransportError::session_closed(self.session_id);
        if self.connection.closed.load(Ordering::SeqCst) {
            return Err(closed());
        }

        let Some(mut stream) = self.connection.stream.try_lock_until(deadline) else {
            return Err(TransportError::timeout_error(kind.as_str()));
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TransportError::timeout_error(kind.as_str()));
        }

        let result = match &self.message {
            None => stream.set_read_timeout(Some(remaining)).and_then(|_| read_message(&mut *stream)),
            Some(message) => stream
                .set_write_timeout(Some(remaining))
                .and_then(|_| write_message(&mut *stream, message))
                .map(|_| None),
        };
        drop(stream);

        match result {
            Ok(Some(message)) => Ok(Completion::Received(message)),
            Ok(None) if kind == TicketKind::Sink => Ok(Completion::Sent),
            // 被 end 打断的读写
            _ if self.connection.closed.load(Ordering::SeqCst) => Err(closed()),
            Ok(None) => {
                self.discard();
                Err(TransportError::connection_error("connection closed by peer", false).with_session(self.session_id))
            }
            Err(e) => {
                let error = TransportError::from(e);
                // 写超时可能留下半帧；读在帧边界处超时则连接仍可用
                if !error.is_timeout() || kind == TicketKind::Sink {
                    self.discard();
                }
                Err(error.with_session(self.session_id))
            }
        }
    }

    /// 连接已损坏：关闭并移出连接表
    fn discard(&self) {
        self.connection.close();
        self.connections.lock().remove(&self.session_id);
    }
}

impl PendingOp for LegacyPendingOp {
    fn wait(self: Box<Self>, deadline: Instant) -> Result<Completion> {
        self.run(deadline)
    }

    fn async_wait(self: Box<Self>, deadline: Instant, callback: TicketCallback) {
        let callback = OnceCallback::new(callback);
        let session_id = self.session_id;
        let spawned = std::thread::Builder::new()
            .name(format!("legacy-wait-{}", session_id.as_u64()))
            .spawn(move || callback.fire(self.run(deadline)));
        // 线程创建失败时闭包被丢弃，回调守卫以 Shutdown 触发
        if let Err(e) = spawned {
            tracing::error!("❌ 无法为 {} 创建等待线程: {}", session_id, e);
        }
    }
}

impl TransportBackend for LegacyBackend {
    fn id(&self) -> BackendId {
        self.id
    }

    fn name(&self) -> &'static str {
        "legacy"
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
            let listener = TcpListener::bind(address)
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
                return Err(TransportError::contract_violation("legacy backend started before setup"));
            }
            LifecycleState::ShutDown => return Err(TransportError::Shutdown),
        }

        self.accepting.store(true, Ordering::SeqCst);
        let mut threads = self.accept_threads.lock();
        for (index, listener) in self.listeners.lock().drain(..).enumerate() {
            let backend = self.self_ref.clone();
            let accepting = self.accepting.clone();
            let handle = std::thread::Builder::new()
                .name(format!("legacy-accept-{}", index))
                .spawn(move || accept_loop(backend, listener, accepting))
                .map_err(|e| TransportError::connection_error(format!("failed to spawn accept thread: {}", e), true))?;
            threads.push(handle);
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

        self.accepting.store(false, Ordering::SeqCst);
        self.listeners.lock().clear();

        let current = std::thread::current().id();
        for handle in self.accept_threads.lock().drain(..) {
            // 最后一个引用可能在接受线程自身上释放
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::warn!("⚠️ legacy 接受线程异常退出");
            }
        }

        let ended: Vec<Arc<LegacyConnection>> = self.connections.lock().drain().map(|(_, conn)| conn).collect();
        for conn in &ended {
            conn.close();
        }
        tracing::info!("🛑 {} 已关闭，结束 {} 个会话", self.id, ended.len());
    }

    fn source_message(&self, session: &SessionHandle, deadline: Instant) -> Result<Ticket> {
        let connection = self.connection(session)?;
        let op = LegacyPendingOp {
            session_id: session.id(),
            connection,
            connections: self.connections.clone(),
            message: None,
        };
        Ok(Ticket::new(TicketKind::Source, session, deadline, Box::new(op)))
    }

    fn sink_message(&self, session: &SessionHandle, message: Message, deadline: Instant) -> Result<Ticket> {
        let connection = self.connection(session)?;
        message.ensure_sendable()?;
        let op = LegacyPendingOp {
            session_id: session.id(),
            connection,
            connections: self.connections.clone(),
            message: Some(message),
        };
        Ok(Ticket::new(TicketKind::Sink, session, deadline, Box::new(op)))
    }

    fn wait(&self, ticket: Ticket) -> Result<Completion> {
        let (op, deadline) = ticket.claim(self.id)?;
        op.wait(deadline)
    }

    fn async_wait(&self, ticket: Ticket, callback: TicketCallback) {
        match ticket.claim(self.id) {
            Ok((op, deadline)) => op.async_wait(deadline, callback),
            Err(e) => {
                let callback = OnceCallback::new(callback);
                let spawned = std::thread::Builder::new()
                    .name("legacy-wait".to_string())
                    .spawn(move || callback.fire(Err(e)));
                if let Err(e) = spawned {
                    tracing::error!("❌ 无法创建等待线程: {}", e);
                }
            }
        }
    }

    fn end(&self, session: &SessionHandle) {
        if session.backend_id() != self.id {
            tracing::warn!("⚠️ 忽略对非本后端会话 {} 的 end 调用", session.id());
            return;
        }
        if let Some(conn) = self.connections.lock().remove(&session.id()) {
            conn.close();
            tracing::info!("🗑️ {} 结束会话 {}", self.id, session.id());
        }
    }

    fn local_addrs(&self) -> Vec<SocketAddr> {
        self.local_addrs.lock().clone()
    }

    fn session_count(&self) -> usize {
        self.connections.lock().len()
    }
}

impl Drop for LegacyBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}
