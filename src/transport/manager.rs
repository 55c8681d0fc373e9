use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::{
    Result,
    config::{BackendKind, ExecutorKind, TransportLayerConfig},
    context::ServiceContext,
    error::TransportError,
    executor::{AdaptiveExecutor, ServiceExecutor, ThreadPerConnectionExecutor},
    message::Message,
    session::SessionHandle,
    ticket::{Completion, Ticket, TicketCallback},
    transport::{
        LegacyBackend, LegacyOptions, ReactorBackend, ReactorOptions, TransportBackend,
    },
};

/// 传输层管理器
///
/// 持有全部后端的唯一强引用。生命周期操作在锁内依次扇出到每个后端；
/// 单连接操作经会话或票据上的回指找到所属后端直接转发，不碰后端集合，
/// 也不取锁。
pub struct TransportLayerManager {
    backends: Mutex<Vec<Arc<dyn TransportBackend>>>,
}

impl std::fmt::Debug for TransportLayerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLayerManager").finish_non_exhaustive()
    }
}

impl TransportLayerManager {
    pub fn new(backends: Vec<Arc<dyn TransportBackend>>) -> Self {
        Self {
            backends: Mutex::new(backends),
        }
    }

    /// 按配置构造后端与执行器
    ///
    /// 执行器在返回前安装到上下文；返回的管理器只持有一个后端，
    /// 由调用者通过 `ServiceContext::set_transport_layer` 注册。
    /// 服务入口必须已安装在上下文中。
    pub fn create_with_config(config: &TransportLayerConfig, context: &Arc<ServiceContext>) -> Result<Arc<Self>> {
        let (backend_kind, executor_kind) = config.selection()?;
        let entry_point = context
            .service_entry_point()
            .ok_or_else(|| TransportError::contract_violation("service entry point must be installed before the transport layer"))?;

        let backend: Arc<dyn TransportBackend> = match (backend_kind, executor_kind) {
            (BackendKind::Reactor, executor_kind) => {
                let reactor = ReactorBackend::new(ReactorOptions::from_config(config), entry_point)?;
                let executor: Arc<dyn ServiceExecutor> = match executor_kind {
                    ExecutorKind::Adaptive => Arc::new(AdaptiveExecutor::new(config.adaptive.clone(), reactor.reactor_handle())),
                    ExecutorKind::ThreadPerConnection => Arc::new(ThreadPerConnectionExecutor::new()),
                };
                context.set_service_executor(executor)?;
                reactor
            }
            (BackendKind::Legacy, ExecutorKind::ThreadPerConnection) => {
                let legacy = LegacyBackend::new(LegacyOptions::from_config(config), entry_point);
                context.set_service_executor(Arc::new(ThreadPerConnectionExecutor::new()))?;
                legacy
            }
            (BackendKind::Legacy, executor_kind) => {
                return Err(TransportError::config_error(
                    "service_executor",
                    format!("legacy transport layer does not support the '{}' executor", executor_kind.as_str()),
                ));
            }
        };

        tracing::info!(
            "🔧 创建传输层: {} + {}",
            backend_kind.as_str(),
            executor_kind.as_str()
        );
        Ok(Arc::new(Self::new(vec![backend])))
    }

    /// 依次 setup 全部后端
    ///
    /// 第一次失败时清空后端集合（先尽力 shutdown，保证没有遗留监听）
    /// 并返回该错误。
    pub fn setup(&self) -> Result<()> {
        let mut backends = self.backends.lock();
        for backend in backends.iter() {
            if let Err(e) = backend.setup() {
                tracing::error!("❌ {} ({}) setup 失败: {}", backend.id(), backend.name(), e);
                Self::discard_all(&mut backends);
                return Err(e);
            }
        }
        Ok(())
    }

    /// 依次 start 全部后端，失败语义同 `setup`
    pub fn start(&self) -> Result<()> {
        let mut backends = self.backends.lock();
        if backends.is_empty() {
            tracing::warn!("⚠️ 没有可启动的传输后端");
            return Ok(());
        }
        for backend in backends.iter() {
            if let Err(e) = backend.start() {
                tracing::error!("❌ {} ({}) start 失败: {}", backend.id(), backend.name(), e);
                Self::discard_all(&mut backends);
                return Err(e);
            }
        }
        Ok(())
    }

    /// 关闭全部后端，不会因单个后端而提前停止
    pub fn shutdown(&self) {
        let backends = self.backends.lock();
        for backend in backends.iter() {
            tracing::info!("🛑 关闭传输后端 {} ({})", backend.id(), backend.name());
            backend.shutdown();
        }
    }

    /// 追加一个后端并立即启动
    ///
    /// 启动在锁外进行，失败时该后端仍留在集合中，不提供 `start` 的
    /// 全有或全无保证。
    pub fn add_and_start(&self, backend: Arc<dyn TransportBackend>) -> Result<()> {
        self.backends.lock().push(backend.clone());
        tracing::info!("➕ 添加并启动传输后端 {} ({})", backend.id(), backend.name());
        backend.start()
    }

    pub fn backend_count(&self) -> usize {
        self.backends.lock().len()
    }

    /// 全部后端实际绑定的地址
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.backends
            .lock()
            .iter()
            .flat_map(|backend| backend.local_addrs())
            .collect()
    }

    pub fn source_message(&self, session: &SessionHandle, deadline: Instant) -> Result<Ticket> {
        owning_backend(session)?.source_message(session, deadline)
    }

    pub fn sink_message(&self, session: &SessionHandle, message: Message, deadline: Instant) -> Result<Ticket> {
        owning_backend(session)?.sink_message(session, message, deadline)
    }

    pub fn wait(&self, ticket: Ticket) -> Result<Completion> {
        match ticket.transport_backend() {
            Some(backend) => backend.wait(ticket),
            None => Err(TransportError::session_closed(ticket.session_id())),
        }
    }

    pub fn async_wait(&self, ticket: Ticket, callback: TicketCallback) {
        match ticket.transport_backend() {
            Some(backend) => backend.async_wait(ticket, callback),
            None => callback(Err(TransportError::session_closed(ticket.session_id()))),
        }
    }

    pub fn end(&self, session: &SessionHandle) {
        if let Some(backend) = session.transport_backend() {
            backend.end(session);
        }
    }

    fn discard_all(backends: &mut Vec<Arc<dyn TransportBackend>>) {
        for backend in backends.iter() {
            backend.shutdown();
        }
        backends.clear();
    }
}

fn owning_backend(session: &SessionHandle) -> Result<Arc<dyn TransportBackend>> {
    session
        .transport_backend()
        .ok_or_else(|| TransportError::session_closed(session.id()))
}
