//! 集成测试共用的辅助类型
#![allow(dead_code)]

use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use transtick::{SessionHandle, ServiceEntryPoint};

/// 只记录会话、不驱动读写的服务入口，测试线程自行操作会话
pub struct CapturingEntryPoint {
    sender: flume::Sender<SessionHandle>,
    receiver: flume::Receiver<SessionHandle>,
}

impl CapturingEntryPoint {
    pub fn new() -> Self {
        let (sender, receiver) = flume::unbounded();
        Self { sender, receiver }
    }

    /// 等待后端交来下一个会话
    pub fn next_session(&self) -> SessionHandle {
        self.receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("backend did not hand over a session")
    }

    pub fn try_next_session(&self, timeout: Duration) -> Option<SessionHandle> {
        self.receiver.recv_timeout(timeout).ok()
    }
}

impl ServiceEntryPoint for CapturingEntryPoint {
    fn start_session(&self, session: SessionHandle) {
        let _ = self.sender.send(session);
    }

    fn end_all_sessions(&self) {}

    fn open_sessions(&self) -> usize {
        self.receiver.len()
    }
}

pub fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// 连接到后端并设置读超时，避免测试挂死
pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("connect to backend");
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
