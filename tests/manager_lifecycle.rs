//! 传输层管理器生命周期测试
//!
//! 使用记录调用顺序的模拟后端，验证 setup/start 的全有或全无语义、
//! shutdown 扇出，以及按会话/票据回指路由的单连接操作。

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use transtick::{
    BackendId, Completion, Message, Result, Session, SessionHandle, Ticket, TicketCallback, TicketKind,
    TransportBackend, TransportError, TransportLayerManager, SessionId,
    ticket::PendingOp,
};

type CallLog = Arc<Mutex<Vec<String>>>;

/// 模拟后端：记录生命周期调用，可配置在 setup 或 start 时失败
struct MockBackend {
    id: BackendId,
    label: usize,
    log: CallLog,
    fail_setup: bool,
    fail_start: bool,
    setup_delay: Duration,
}

impl MockBackend {
    fn new(label: usize, log: &CallLog) -> Self {
        Self {
            id: BackendId::next(),
            label,
            log: log.clone(),
            fail_setup: false,
            fail_start: false,
            setup_delay: Duration::ZERO,
        }
    }

    fn failing_setup(mut self) -> Self {
        self.fail_setup = true;
        self
    }

    fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    fn slow_setup(mut self, delay: Duration) -> Self {
        self.setup_delay = delay;
        self
    }

    fn record(&self, op: &str) {
        self.log.lock().push(format!("{}:{}", op, self.label));
    }
}

/// 立即完成的挂起操作
struct ImmediateOp {
    completion: Completion,
}

impl PendingOp for ImmediateOp {
    fn wait(self: Box<Self>, _deadline: Instant) -> Result<Completion> {
        Ok(self.completion)
    }

    fn async_wait(self: Box<Self>, deadline: Instant, callback: TicketCallback) {
        callback(self.wait(deadline));
    }
}

impl TransportBackend for MockBackend {
    fn id(&self) -> BackendId {
        self.id
    }

    fn name(&self) -> &'static str {
        "mock"
    }

    fn setup(&self) -> Result<()> {
        std::thread::sleep(self.setup_delay);
        self.record("setup");
        if self.fail_setup {
            return Err(TransportError::listen_error(
                "127.0.0.1:1".parse().unwrap(),
                "address in use",
            ));
        }
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.record("start");
        if self.fail_start {
            return Err(TransportError::connection_error("accept loop failed", false));
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.record("shutdown");
    }

    fn source_message(&self, session: &SessionHandle, deadline: Instant) -> Result<Ticket> {
        self.record("source");
        let op = ImmediateOp {
            completion: Completion::Received(Message::from_payload(b"from-mock")),
        };
        Ok(Ticket::new(TicketKind::Source, session, deadline, Box::new(op)))
    }

    fn sink_message(&self, session: &SessionHandle, _message: Message, deadline: Instant) -> Result<Ticket> {
        self.record("sink");
        let op = ImmediateOp {
            completion: Completion::Sent,
        };
        Ok(Ticket::new(TicketKind::Sink, session, deadline, Box::new(op)))
    }

    fn wait(&self, ticket: Ticket) -> Result<Completion> {
        self.record("wait");
        let (op, deadline) = ticket.claim(self.id)?;
        op.wait(deadline)
    }

    fn async_wait(&self, ticket: Ticket, callback: TicketCallback) {
        self.record("async_wait");
        match ticket.claim(self.id) {
            Ok((op, deadline)) => op.async_wait(deadline, callback),
            Err(e) => callback(Err(e)),
        }
    }

    fn end(&self, _session: &SessionHandle) {
        self.record("end");
    }

    fn local_addrs(&self) -> Vec<SocketAddr> {
        Vec::new()
    }

    fn session_count(&self) -> usize {
        0
    }
}

fn session_on(backend: &Arc<MockBackend>, id: u64) -> SessionHandle {
    let weak: Weak<MockBackend> = Arc::downgrade(backend);
    Session::new(
        SessionId::new(id),
        backend.id(),
        weak,
        "127.0.0.1:27017".parse().unwrap(),
        "127.0.0.1:50000".parse().unwrap(),
    )
}

fn entries(log: &CallLog, op: &str) -> Vec<String> {
    log.lock().iter().filter(|entry| entry.starts_with(op)).cloned().collect()
}

#[test]
fn test_setup_failure_discards_every_backend() {
    let log: CallLog = Arc::default();
    let backends: Vec<Arc<dyn TransportBackend>> = vec![
        Arc::new(MockBackend::new(1, &log)),
        Arc::new(MockBackend::new(2, &log)),
        Arc::new(MockBackend::new(3, &log).failing_setup()),
        Arc::new(MockBackend::new(4, &log)),
    ];
    let manager = TransportLayerManager::new(backends);

    let err = manager.setup().unwrap_err();
    assert_eq!(err.error_code(), "LISTEN_ERROR");
    assert_eq!(entries(&log, "setup"), vec!["setup:1", "setup:2", "setup:3"]);
    assert_eq!(manager.backend_count(), 0);

    // 集合已空，start 不会触达任何后端
    manager.start().unwrap();
    assert!(entries(&log, "start").is_empty());
}

#[test]
fn test_start_failure_discards_every_backend() {
    let log: CallLog = Arc::default();
    let backends: Vec<Arc<dyn TransportBackend>> = vec![
        Arc::new(MockBackend::new(1, &log)),
        Arc::new(MockBackend::new(2, &log).failing_start()),
        Arc::new(MockBackend::new(3, &log)),
    ];
    let manager = TransportLayerManager::new(backends);

    manager.setup().unwrap();
    assert!(manager.start().is_err());
    assert_eq!(entries(&log, "start"), vec!["start:1", "start:2"]);
    assert_eq!(manager.backend_count(), 0);
}

#[test]
fn test_start_on_empty_collection_is_ok() {
    let manager = TransportLayerManager::new(Vec::new());
    assert!(manager.setup().is_ok());
    assert!(manager.start().is_ok());
    manager.shutdown();
}

#[test]
fn test_shutdown_reaches_every_backend() {
    let log: CallLog = Arc::default();
    let backends: Vec<Arc<dyn TransportBackend>> = (1..=3)
        .map(|label| Arc::new(MockBackend::new(label, &log)) as Arc<dyn TransportBackend>)
        .collect();
    let manager = TransportLayerManager::new(backends);

    manager.setup().unwrap();
    manager.start().unwrap();
    manager.shutdown();

    assert_eq!(entries(&log, "shutdown"), vec!["shutdown:1", "shutdown:2", "shutdown:3"]);
    assert_eq!(manager.backend_count(), 3);
}

#[test]
fn test_concurrent_shutdown_and_setup_do_not_interleave() {
    for _ in 0..10 {
        let log: CallLog = Arc::default();
        let backends: Vec<Arc<dyn TransportBackend>> = (1..=3)
            .map(|label| {
                Arc::new(MockBackend::new(label, &log).slow_setup(Duration::from_millis(2))) as Arc<dyn TransportBackend>
            })
            .collect();
        let manager = Arc::new(TransportLayerManager::new(backends));

        let setup_manager = manager.clone();
        let setup = std::thread::spawn(move || setup_manager.setup());
        let shutdown_manager = manager.clone();
        let shutdown = std::thread::spawn(move || shutdown_manager.shutdown());

        setup.join().unwrap().unwrap();
        shutdown.join().unwrap();

        let ops: Vec<String> = log
            .lock()
            .iter()
            .map(|entry| entry.split(':').next().unwrap_or_default().to_string())
            .collect();
        let setup_first = vec!["setup", "setup", "setup", "shutdown", "shutdown", "shutdown"];
        let shutdown_first = vec!["shutdown", "shutdown", "shutdown", "setup", "setup", "setup"];
        assert!(ops == setup_first || ops == shutdown_first, "interleaved fan-out: {:?}", ops);
        assert_eq!(manager.backend_count(), 3);
    }
}

#[test]
fn test_add_and_start_appends_without_rollback() {
    let log: CallLog = Arc::default();
    let initial: Arc<dyn TransportBackend> = Arc::new(MockBackend::new(1, &log));
    let manager = TransportLayerManager::new(vec![initial]);
    manager.setup().unwrap();
    manager.start().unwrap();

    manager.add_and_start(Arc::new(MockBackend::new(2, &log))).unwrap();
    assert_eq!(manager.backend_count(), 2);

    assert!(manager.add_and_start(Arc::new(MockBackend::new(3, &log).failing_start())).is_err());
    assert_eq!(manager.backend_count(), 3);
    assert_eq!(entries(&log, "start"), vec!["start:1", "start:2", "start:3"]);
}

#[test]
fn test_per_session_calls_route_to_owning_backend() {
    let log: CallLog = Arc::default();
    let first = Arc::new(MockBackend::new(1, &log));
    let second = Arc::new(MockBackend::new(2, &log));
    let backends: Vec<Arc<dyn TransportBackend>> = vec![first.clone(), second.clone()];
    let manager = TransportLayerManager::new(backends);

    let session = session_on(&second, 9);
    let deadline = Instant::now() + Duration::from_secs(5);

    let ticket = manager.source_message(&session, deadline).unwrap();
    assert_eq!(ticket.backend_id(), second.id());
    let completion = manager.wait(ticket).unwrap();
    assert_eq!(completion.into_message().unwrap().payload().as_ref(), b"from-mock");

    let ticket = manager.sink_message(&session, Message::from_payload(b"x"), deadline).unwrap();
    let (tx, rx) = std::sync::mpsc::channel();
    manager.async_wait(ticket, Box::new(move |result| tx.send(result).unwrap()));
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap(), Completion::Sent);

    manager.end(&session);

    let calls = log.lock().clone();
    assert_eq!(calls, vec!["source:2", "wait:2", "sink:2", "async_wait:2", "end:2"]);
}

#[test]
fn test_wait_through_foreign_backend_is_contract_violation() {
    let log: CallLog = Arc::default();
    let owner = Arc::new(MockBackend::new(1, &log));
    let stranger = Arc::new(MockBackend::new(2, &log));
    let session = session_on(&owner, 3);

    let ticket = owner
        .source_message(&session, Instant::now() + Duration::from_secs(5))
        .unwrap();
    let err = stranger.wait(ticket).unwrap_err();
    assert_eq!(err.error_code(), "CONTRACT_VIOLATION");
}

#[test]
fn test_released_backend_reports_session_closed() {
    let log: CallLog = Arc::default();
    let backend = Arc::new(MockBackend::new(1, &log));
    let manager = TransportLayerManager::new(Vec::new());
    let session = session_on(&backend, 4);

    let ticket = manager
        .source_message(&session, Instant::now() + Duration::from_secs(5))
        .unwrap();
    drop(backend);

    let err = manager.wait(ticket).unwrap_err();
    assert_eq!(err, TransportError::session_closed(SessionId::new(4)));

    let err = manager
        .sink_message(&session, Message::from_payload(b"late"), Instant::now() + Duration::from_secs(5))
        .unwrap_err();
    assert_eq!(err.error_code(), "SESSION_CLOSED");
}

#[test]
fn test_async_wait_on_released_backend_fires_once() {
    let log: CallLog = Arc::default();
    let backend = Arc::new(MockBackend::new(1, &log));
    let manager = TransportLayerManager::new(Vec::new());
    let session = session_on(&backend, 5);

    let ticket = manager
        .source_message(&session, Instant::now() + Duration::from_secs(5))
        .unwrap();
    drop(backend);

    let fired = Arc::new(AtomicUsize::new(0));
    let seen = fired.clone();
    manager.async_wait(
        ticket,
        Box::new(move |result| {
            assert_eq!(result.unwrap_err().error_code(), "SESSION_CLOSED");
            seen.fetch_add(1, Ordering::SeqCst);
        }),
    );
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}
