//! 端到端回显：服务上下文 + 会话循环入口 + 每种受支持的后端/执行器组合

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{connect, init_tracing, loopback};
use transtick::{
    Message, ReactorBackend, ServiceContext, ServiceEntryPoint, SessionHandle, SessionLoopEntryPoint,
    TransportBackend, TransportLayerConfig, TransportLayerManager,
    config::AdaptiveConfig,
    executor::ThreadPerConnectionExecutor,
    transport::ReactorOptions,
    message::{read_message, write_message},
};

fn upper(_session: &SessionHandle, request: Message) -> Option<Message> {
    let text = String::from_utf8_lossy(&request.payload()).to_uppercase();
    // 空消息只读不回
    if text.is_empty() { None } else { Some(Message::from_payload(text)) }
}

struct Server {
    context: Arc<ServiceContext>,
    entry_point: Arc<SessionLoopEntryPoint<fn(&SessionHandle, Message) -> Option<Message>>>,
    manager: Arc<TransportLayerManager>,
}

fn start_server(layer: &str, executor: &str) -> Server {
    init_tracing();
    let config = TransportLayerConfig::new(layer, executor)
        .with_bind_address("127.0.0.1:0".parse().unwrap())
        .with_reactor_threads(2)
        .with_adaptive(AdaptiveConfig {
            reserved_threads: 1,
            max_threads: 4,
            idle_timeout_ms: 200,
        });

    let context = ServiceContext::new();
    let handler: fn(&SessionHandle, Message) -> Option<Message> = upper;
    let entry_point = SessionLoopEntryPoint::with_timeouts(
        &context,
        handler,
        Duration::from_millis(200),
        Duration::from_secs(2),
    );
    context.set_service_entry_point(entry_point.clone()).unwrap();

    let manager = TransportLayerManager::create_with_config(&config, &context).unwrap();
    context.set_transport_layer(manager.clone()).unwrap();
    context.startup().unwrap();

    Server { context, entry_point, manager }
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn run_echo(layer: &str, executor: &str) {
    let server = start_server(layer, executor);
    let addr = server.manager.local_addrs()[0];

    let clients: Vec<_> = (0..3)
        .map(|c| {
            std::thread::spawn(move || {
                let mut stream = connect(addr);
                for i in 0..5 {
                    let text = format!("client {} message {}", c, i);
                    write_message(&mut stream, &Message::from_payload(&text)).unwrap();
                    let reply = read_message(&mut stream).unwrap().expect("echo reply");
                    assert_eq!(reply.payload().as_ref(), text.to_uppercase().as_bytes());
                }

                // 无回复的消息之后会话仍可继续；读超时也不会结束会话
                write_message(&mut stream, &Message::from_payload(b"")).unwrap();
                std::thread::sleep(Duration::from_millis(300));
                write_message(&mut stream, &Message::from_payload(b"last")).unwrap();
                let reply = read_message(&mut stream).unwrap().expect("echo reply");
                assert_eq!(reply.payload().as_ref(), b"LAST");
            })
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }

    // 客户端断开后会话从入口注销
    assert!(
        wait_until(|| server.entry_point.open_sessions() == 0),
        "{} + {} left {} open sessions",
        layer,
        executor,
        server.entry_point.open_sessions()
    );

    server.context.shutdown(Duration::from_secs(5)).unwrap();
}

#[test]
fn test_echo_reactor_adaptive() {
    run_echo("reactor", "adaptive");
}

#[test]
fn test_echo_reactor_thread_per_connection() {
    run_echo("reactor", "thread-per-connection");
}

#[test]
fn test_echo_legacy_thread_per_connection() {
    run_echo("legacy", "thread-per-connection");
}

#[test]
fn test_shutdown_ends_idle_sessions() {
    for (layer, executor) in [("reactor", "adaptive"), ("legacy", "thread-per-connection")] {
        let server = start_server(layer, executor);
        let mut stream = connect(server.manager.local_addrs()[0]);
        assert!(wait_until(|| server.entry_point.open_sessions() == 1));

        server.context.shutdown(Duration::from_secs(5)).unwrap();
        assert_eq!(server.entry_point.open_sessions(), 0);

        let mut buf = [0u8; 1];
        assert_eq!(std::io::Read::read(&mut stream, &mut buf).unwrap(), 0);
        assert_eq!(server.context.service_executor().unwrap().stats().threads_running, 0);
    }
}

fn echo_once(stream: &mut std::net::TcpStream, text: &str) {
    write_message(stream, &Message::from_payload(text)).unwrap();
    let reply = read_message(stream).unwrap().expect("echo reply");
    assert_eq!(reply.payload().as_ref(), text.to_uppercase().as_bytes());
}

#[test]
fn test_backends_sharing_one_entry_point_keep_sessions_apart() {
    init_tracing();
    let context = ServiceContext::new();
    let handler: fn(&SessionHandle, Message) -> Option<Message> = upper;
    let entry_point = SessionLoopEntryPoint::with_timeouts(
        &context,
        handler,
        Duration::from_millis(200),
        Duration::from_secs(2),
    );
    context.set_service_entry_point(entry_point.clone()).unwrap();

    // 两个后端各自从 1 开始编号，首个会话 id 相同
    let backends: Vec<Arc<dyn TransportBackend>> = (0..2)
        .map(|_| {
            let options = ReactorOptions {
                bind_addresses: vec![loopback()],
                max_connections: 8,
                worker_threads: 1,
            };
            ReactorBackend::new(options, entry_point.clone()).unwrap() as Arc<dyn TransportBackend>
        })
        .collect();
    let manager = Arc::new(TransportLayerManager::new(backends));
    context.set_transport_layer(manager.clone()).unwrap();
    context.set_service_executor(Arc::new(ThreadPerConnectionExecutor::new())).unwrap();
    context.startup().unwrap();

    let addrs = manager.local_addrs();
    assert_eq!(addrs.len(), 2);
    let mut first = connect(addrs[0]);
    let mut second = connect(addrs[1]);
    assert!(wait_until(|| entry_point.open_sessions() == 2));

    echo_once(&mut first, "from first");
    echo_once(&mut second, "from second");

    // 一个会话结束不影响另一个后端上同号的会话
    drop(first);
    assert!(wait_until(|| entry_point.open_sessions() == 1));
    echo_once(&mut second, "still here");

    context.shutdown(Duration::from_secs(5)).unwrap();
    assert_eq!(entry_point.open_sessions(), 0);
    let mut buf = [0u8; 1];
    assert_eq!(std::io::Read::read(&mut second, &mut buf).unwrap(), 0);
}
