/// Echo服务器 - 由配置选择传输后端与执行模型
///
/// 用法: cargo run --example echo_server [config.toml]
/// 不给配置文件时使用 reactor + adaptive，监听 127.0.0.1:9001。
/// 收到任何消息都会立即回显给客户端，Ctrl+C 退出。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use transtick::{
    Message, ServiceContext, SessionHandle, SessionLoopEntryPoint, TransportLayerConfig, TransportLayerManager,
};

fn load_config() -> anyhow::Result<TransportLayerConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path))?;
            toml::from_str(&text).with_context(|| format!("parsing {}", path))
        }
        None => Ok(TransportLayerConfig::new("reactor", "adaptive")
            .with_bind_address("127.0.0.1:9001".parse()?)),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = load_config()?;
    println!("🌟 Echo服务器 - {} + {}", config.transport_layer, config.service_executor);

    let echoed = Arc::new(AtomicU64::new(0));
    let counter = echoed.clone();
    let context = ServiceContext::new();
    let entry_point = SessionLoopEntryPoint::new(&context, move |session: &SessionHandle, request: Message| {
        let count = counter.fetch_add(1, Ordering::Relaxed) + 1;
        println!(
            "📨 [{}] {} 字节: {:?}",
            session.id(),
            request.payload().len(),
            String::from_utf8_lossy(&request.payload())
        );
        if count % 100 == 0 {
            println!("📊 已回显 {} 条消息", count);
        }
        Some(request)
    });
    context.set_service_entry_point(entry_point)?;

    let manager = TransportLayerManager::create_with_config(&config, &context)?;
    context.set_transport_layer(manager.clone())?;
    context.startup()?;

    println!("📡 监听地址: {:?}", manager.local_addrs());
    println!("⏹️  按 Ctrl+C 停止服务器");

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(tokio::signal::ctrl_c())?;

    println!("🛑 正在关闭...");
    context.shutdown(Duration::from_secs(5))?;
    println!("✅ 共回显 {} 条消息", echoed.load(Ordering::Relaxed));
    Ok(())
}
