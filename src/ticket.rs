/// 票据：一次挂起的读（source）或写（sink）操作
///
/// 票据由 `source_message` / `sink_message` 创建，只能被 `wait` 或
/// `async_wait` 消费一次。两者都按值接收票据，重复消费在编译期即被拒绝。

use std::sync::{Arc, Weak};
use std::time::Instant;

use crate::{
    Result, SessionId,
    error::TransportError,
    message::Message,
    session::Session,
    transport::{BackendId, TransportBackend},
};

/// 操作方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketKind {
    /// 读取下一条入站消息
    Source,
    /// 写出一条出站消息
    Sink,
}

impl TicketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketKind::Source => "source",
            TicketKind::Sink => "sink",
        }
    }
}

/// 操作成功完成后的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// 读取到的消息
    Received(Message),
    /// 写出完成
    Sent,
}

impl Completion {
    pub fn into_message(self) -> Option<Message> {
        match self {
            Completion::Received(message) => Some(message),
            Completion::Sent => None,
        }
    }
}

/// 异步完成回调，恰好触发一次
pub type TicketCallback = Box<dyn FnOnce(Result<Completion>) + Send + 'static>;

/// 只触发一次的回调守卫
///
/// 若在触发前被丢弃（例如运行时已关闭导致任务被取消），
/// 以 `TransportError::Shutdown` 调用回调，保证回调恰好触发一次。
pub struct OnceCallback(Option<TicketCallback>);

impl OnceCallback {
    pub fn new(callback: TicketCallback) -> Self {
        Self(Some(callback))
    }

    pub fn fire(mut self, result: Result<Completion>) {
        if let Some(callback) = self.0.take() {
            callback(result);
        }
    }
}

impl Drop for OnceCallback {
    fn drop(&mut self) {
        if let Some(callback) = self.0.take() {
            callback(Err(TransportError::Shutdown));
        }
    }
}

/// 后端私有的挂起操作
///
/// 每个后端提供自己的实现；管理器和上层只通过票据间接接触它。
pub trait PendingOp: Send {
    /// 阻塞当前线程直到完成或到达截止时间
    fn wait(self: Box<Self>, deadline: Instant) -> Result<Completion>;

    /// 注册完成回调，不阻塞调用线程
    fn async_wait(self: Box<Self>, deadline: Instant, callback: TicketCallback);
}

impl std::fmt::Debug for dyn PendingOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingOp").finish_non_exhaustive()
    }
}

pub struct Ticket {
    kind: TicketKind,
    session_id: SessionId,
    backend_id: BackendId,
    backend: Weak<dyn TransportBackend>,
    deadline: Instant,
    op: Box<dyn PendingOp>,
}

impl Ticket {
    /// 为会话创建票据，票据归属于会话所属的后端
    pub fn new(kind: TicketKind, session: &Session, deadline: Instant, op: Box<dyn PendingOp>) -> Self {
        Self {
            kind,
            session_id: session.id(),
            backend_id: session.backend_id(),
            backend: session.backend_ref(),
            deadline,
            op,
        }
    }

    pub fn kind(&self) -> TicketKind {
        self.kind
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn backend_id(&self) -> BackendId {
        self.backend_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// 找回所属后端
    pub fn transport_backend(&self) -> Option<Arc<dyn TransportBackend>> {
        self.backend.upgrade()
    }

    /// 由所属后端领取挂起操作
    ///
    /// 非所属后端领取属于调用约定违反；截止时间已过时直接报告超时，
    /// 挂起操作随之被释放。
    pub fn claim(self, backend_id: BackendId) -> Result<(Box<dyn PendingOp>, Instant)> {
        if self.backend_id != backend_id {
            return Err(TransportError::contract_violation(format!(
                "{} ticket for {} belongs to {}, resolved through {}",
                self.kind.as_str(),
                self.session_id,
                self.backend_id,
                backend_id
            )));
        }
        if self.is_expired() {
            tracing::debug!("⏰ {} 票据在等待前已过期 (会话: {})", self.kind.as_str(), self.session_id);
            return Err(TransportError::timeout_error(self.kind.as_str()));
        }
        Ok((self.op, self.deadline))
    }
}

impl std::fmt::Debug for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket")
            .field("kind", &self.kind)
            .field("session_id", &self.session_id)
            .field("backend_id", &self.backend_id)
            .field("deadline", &self.deadline)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingOp(Arc<AtomicUsize>);

    impl PendingOp for CountingOp {
        fn wait(self: Box<Self>, _deadline: Instant) -> Result<Completion> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Completion::Sent)
        }

        fn async_wait(self: Box<Self>, deadline: Instant, callback: TicketCallback) {
            callback(self.wait(deadline));
        }
    }

    fn detached_session() -> Arc<Session> {
        let backend: Weak<crate::transport::legacy::LegacyBackend> = Weak::new();
        Session::new(
            SessionId::new(1),
            BackendId::next(),
            backend,
            "127.0.0.1:1".parse().unwrap(),
            "127.0.0.1:2".parse().unwrap(),
        )
    }

    #[test]
    fn test_claim_checks_owner() {
        let runs = Arc::new(AtomicUsize::new(0));
        let session = detached_session();
        let ticket = Ticket::new(
            TicketKind::Sink,
            &session,
            Instant::now() + Duration::from_secs(5),
            Box::new(CountingOp(runs.clone())),
        );

        let err = ticket.claim(BackendId::next()).unwrap_err();
        assert_eq!(err.error_code(), "CONTRACT_VIOLATION");
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_expired_ticket_reports_timeout() {
        let runs = Arc::new(AtomicUsize::new(0));
        let session = detached_session();
        let ticket = Ticket::new(
            TicketKind::Source,
            &session,
            Instant::now() - Duration::from_millis(1),
            Box::new(CountingOp(runs.clone())),
        );

        let err = ticket.claim(session.backend_id()).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_once_callback_fires_on_drop() {
        let fired = Arc::new(AtomicUsize::new(0));
        let seen = fired.clone();
        let guard = OnceCallback::new(Box::new(move |result| {
            assert_eq!(result.unwrap_err(), TransportError::Shutdown);
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        drop(guard);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        let seen = fired.clone();
        let guard = OnceCallback::new(Box::new(move |result| {
            assert!(result.is_ok());
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        guard.fire(Ok(Completion::Sent));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_claim_by_owner_runs_op() {
        let runs = Arc::new(AtomicUsize::new(0));
        let session = detached_session();
        let ticket = Ticket::new(
            TicketKind::Sink,
            &session,
            Instant::now() + Duration::from_secs(5),
            Box::new(CountingOp(runs.clone())),
        );

        let (op, deadline) = ticket.claim(session.backend_id()).unwrap();
        assert_eq!(op.wait(deadline).unwrap(), Completion::Sent);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
