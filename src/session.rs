use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::SystemTime;

use crate::SessionId;
use crate::transport::{BackendId, TransportBackend};

/// 会话句柄：后端与上层调用者共同持有
pub type SessionHandle = Arc<Session>;

/// 一个已建立的连接
///
/// 会话只保存指向所属后端的弱引用，不会延长后端的生命周期；
/// 所属后端在创建后不可更改。
pub struct Session {
    id: SessionId,
    backend_id: BackendId,
    backend: Weak<dyn TransportBackend>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    established_at: SystemTime,
}

impl Session {
    /// 由后端在接受连接时调用
    pub fn new(
        id: SessionId,
        backend_id: BackendId,
        backend: Weak<dyn TransportBackend>,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> SessionHandle {
        Arc::new(Self {
            id,
            backend_id,
            backend,
            local_addr,
            peer_addr,
            established_at: SystemTime::now(),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// 所属后端的标识
    pub fn backend_id(&self) -> BackendId {
        self.backend_id
    }

    /// 找回所属后端；后端已被释放时返回 `None`
    pub fn transport_backend(&self) -> Option<Arc<dyn TransportBackend>> {
        self.backend.upgrade()
    }

    pub(crate) fn backend_ref(&self) -> Weak<dyn TransportBackend> {
        self.backend.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn established_at(&self) -> SystemTime {
        self.established_at
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("backend_id", &self.backend_id)
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}
