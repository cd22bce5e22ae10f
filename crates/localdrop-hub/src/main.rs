//! LocalDrop Hub
//!
//! 信令中心守护进程，负责：
//! - 维护在线名单并广播成员变化
//! - 按 `to` 字段转发信令，盖章 `from`
//! - 兜底的服务器中继传输路径

use anyhow::Result;
use clap::Parser;
use localdrop_core::config::AppSettings;
use localdrop_core::hub::{Hub, server_address};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "localdrop-hub", version, about = "LocalDrop 信令中心")]
struct Args {
    /// 监听地址
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,
    /// 监听端口，不传时用设置文件里的 hub_port
    #[arg(short, long)]
    port: Option<u16>,
}

/// 命令行端口优先，否则落回持久化设置
fn listen_port(cli: Option<u16>, settings: &AppSettings) -> u16 {
    cli.unwrap_or(settings.hub_port)
}

#[tokio::main]
async fn main() -> Result<()> {
    // 桥接 log crate（localdrop-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    // 初始化日志
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,localdrop_core=debug")),
        )
        .try_init();

    let args = Args::parse();
    let port = listen_port(args.port, &AppSettings::load());
    let address = server_address(port);
    tracing::info!("LocalDrop Hub starting, clients connect to ws://{}/ws", address);

    let listener = TcpListener::bind((args.bind.as_str(), port)).await?;
    Hub::new(address).serve(listener).await
}
