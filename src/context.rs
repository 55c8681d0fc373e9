use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::{
    Result,
    entry_point::ServiceEntryPoint,
    error::TransportError,
    executor::ServiceExecutor,
    transport::TransportLayerManager,
};

/// 服务上下文
///
/// 显式传递的进程级对象。传输层、服务执行器与服务入口各自只能设置一次，
/// 之后只读；重复设置返回 `ContractViolation`。
pub struct ServiceContext {
    transport_layer: OnceLock<Arc<TransportLayerManager>>,
    service_executor: OnceLock<Arc<dyn ServiceExecutor>>,
    entry_point: OnceLock<Arc<dyn ServiceEntryPoint>>,
}

impl ServiceContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            transport_layer: OnceLock::new(),
            service_executor: OnceLock::new(),
            entry_point: OnceLock::new(),
        })
    }

    pub fn set_transport_layer(&self, manager: Arc<TransportLayerManager>) -> Result<()> {
        self.transport_layer
            .set(manager)
            .map_err(|_| TransportError::contract_violation("transport layer is already installed"))
    }

    pub fn set_service_executor(&self, executor: Arc<dyn ServiceExecutor>) -> Result<()> {
        let kind = executor.kind();
        self.service_executor
            .set(executor)
            .map_err(|_| TransportError::contract_violation("service executor is already installed"))?;
        tracing::info!("🔧 安装服务执行器: {}", kind.as_str());
        Ok(())
    }

    pub fn set_service_entry_point(&self, entry_point: Arc<dyn ServiceEntryPoint>) -> Result<()> {
        self.entry_point
            .set(entry_point)
            .map_err(|_| TransportError::contract_violation("service entry point is already installed"))
    }

    pub fn transport_layer(&self) -> Option<Arc<TransportLayerManager>> {
        self.transport_layer.get().cloned()
    }

    pub fn service_executor(&self) -> Option<Arc<dyn ServiceExecutor>> {
        self.service_executor.get().cloned()
    }

    pub fn service_entry_point(&self) -> Option<Arc<dyn ServiceEntryPoint>> {
        self.entry_point.get().cloned()
    }

    /// 启动顺序：执行器 → 传输层 setup → 传输层 start
    pub fn startup(&self) -> Result<()> {
        let executor = self
            .service_executor()
            .ok_or_else(|| TransportError::contract_violation("no service executor installed"))?;
        let manager = self
            .transport_layer()
            .ok_or_else(|| TransportError::contract_violation("no transport layer installed"))?;

        executor.start()?;
        manager.setup()?;
        manager.start()?;
        tracing::info!("✅ 服务已启动，监听: {:?}", manager.local_addrs());
        Ok(())
    }

    /// 关闭顺序：传输层 → 全部会话 → 执行器
    pub fn shutdown(&self, timeout: Duration) -> Result<()> {
        if let Some(manager) = self.transport_layer() {
            manager.shutdown();
        }
        if let Some(entry_point) = self.service_entry_point() {
            entry_point.end_all_sessions();
        }
        match self.service_executor() {
            Some(executor) => executor.shutdown(timeout),
            None => Ok(()),
        }
    }
}
