/// 传输层配置
///
/// 启动时由外部加载（例如 TOML 文件），决定后端种类与执行模型。
/// 不支持的组合属于启动期致命错误。

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use serde::{Serialize, Deserialize};

use crate::{Result, error::TransportError};

/// 后端种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// 基于 reactor 的异步后端
    Reactor,
    /// 阻塞式的旧后端
    Legacy,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Reactor => "reactor",
            BackendKind::Legacy => "legacy",
        }
    }
}

impl FromStr for BackendKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "reactor" => Ok(BackendKind::Reactor),
            "legacy" => Ok(BackendKind::Legacy),
            other => Err(TransportError::config_error(
                "transport_layer",
                format!("unknown transport layer '{}', expected 'reactor' or 'legacy'", other),
            )),
        }
    }
}

/// 执行模型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    /// 与 reactor 共享的自适应线程池
    Adaptive,
    /// 每个连接一个专用线程
    ThreadPerConnection,
}

impl ExecutorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorKind::Adaptive => "adaptive",
            ExecutorKind::ThreadPerConnection => "thread-per-connection",
        }
    }
}

impl FromStr for ExecutorKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "adaptive" => Ok(ExecutorKind::Adaptive),
            "thread-per-connection" | "synchronous" => Ok(ExecutorKind::ThreadPerConnection),
            other => Err(TransportError::config_error(
                "service_executor",
                format!("unknown service executor '{}', expected 'adaptive' or 'thread-per-connection'", other),
            )),
        }
    }
}

/// reactor 后端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReactorConfig {
    /// reactor 的 I/O 线程数
    pub worker_threads: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self { worker_threads: 2 }
    }
}

/// 自适应执行器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// 常驻工作线程数
    pub reserved_threads: usize,
    /// 工作线程上限
    pub max_threads: usize,
    /// 超出常驻数量的空闲线程在此时间后退出
    pub idle_timeout_ms: u64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            reserved_threads: 2,
            max_threads: 16,
            idle_timeout_ms: 30_000,
        }
    }
}

impl AdaptiveConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

/// 传输层总配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportLayerConfig {
    /// "reactor" 或 "legacy"
    pub transport_layer: String,
    /// "adaptive" 或 "thread-per-connection"
    pub service_executor: String,
    /// 监听地址
    pub bind_addresses: Vec<SocketAddr>,
    /// 最大并发连接数
    pub max_connections: usize,
    pub reactor: ReactorConfig,
    pub adaptive: AdaptiveConfig,
}

impl Default for TransportLayerConfig {
    fn default() -> Self {
        Self {
            transport_layer: BackendKind::Reactor.as_str().to_string(),
            service_executor: ExecutorKind::ThreadPerConnection.as_str().to_string(),
            bind_addresses: vec![SocketAddr::from(([127, 0, 0, 1], 27017))],
            max_connections: 1000,
            reactor: ReactorConfig::default(),
            adaptive: AdaptiveConfig::default(),
        }
    }
}

impl TransportLayerConfig {
    pub fn new(transport_layer: &str, service_executor: &str) -> Self {
        Self {
            transport_layer: transport_layer.to_string(),
            service_executor: service_executor.to_string(),
            ..Self::default()
        }
    }

    /// 设置监听地址（替换已有地址）
    pub fn with_bind_address(mut self, addr: SocketAddr) -> Self {
        self.bind_addresses = vec![addr];
        self
    }

    /// 追加监听地址
    pub fn add_bind_address(mut self, addr: SocketAddr) -> Self {
        self.bind_addresses.push(addr);
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_reactor_threads(mut self, threads: usize) -> Self {
        self.reactor.worker_threads = threads;
        self
    }

    pub fn with_adaptive(mut self, adaptive: AdaptiveConfig) -> Self {
        self.adaptive = adaptive;
        self
    }

    pub fn backend_kind(&self) -> Result<BackendKind> {
        self.transport_layer.parse()
    }

    pub fn executor_kind(&self) -> Result<ExecutorKind> {
        self.service_executor.parse()
    }

    /// 校验配置并给出后端/执行模型组合
    pub fn selection(&self) -> Result<(BackendKind, ExecutorKind)> {
        self.validate()?;
        let backend = self.backend_kind()?;
        let executor = self.executor_kind()?;

        if backend == BackendKind::Legacy && executor != ExecutorKind::ThreadPerConnection {
            return Err(TransportError::config_error(
                "service_executor",
                format!(
                    "the legacy transport layer only supports the thread-per-connection executor, got '{}'",
                    executor.as_str()
                ),
            ));
        }

        Ok((backend, executor))
    }

    pub fn validate(&self) -> Result<()> {
        if self.bind_addresses.is_empty() {
            return Err(TransportError::config_error("bind_addresses", "at least one address is required"));
        }
        if self.max_connections == 0 {
            return Err(TransportError::config_error("max_connections", "must be > 0"));
        }
        if self.reactor.worker_threads == 0 {
            return Err(TransportError::config_error("reactor.worker_threads", "must be > 0"));
        }
        if self.adaptive.reserved_threads == 0 {
            return Err(TransportError::config_error("adaptive.reserved_threads", "must be > 0"));
        }
        if self.adaptive.max_threads < self.adaptive.reserved_threads {
            return Err(TransportError::config_error(
                "adaptive.max_threads",
                format!(
                    "must be >= reserved_threads ({})",
                    self.adaptive.reserved_threads
                ),
            ));
        }
        Ok(())
    }
}
