//! LocalDrop CLI
//!
//! 命令行客户端：查看在线对端、发送文件、在线接收文件

use anyhow::Result;
use clap::{Parser, Subcommand};
use localdrop_core::client::{AutoReject, Client, ClientOptions};
use localdrop_core::config::AppSettings;
use localdrop_core::transfer::TransportKind;
use localdrop_core::workflow::{
    ReceiveOptions, ReceiveProgressCallback, ReceiveRequest, Receiver, SendOptions,
    SendProgressCallback, Sender,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "localdrop", version, about = "LocalDrop - 局域网文件互传")]
struct Cli {
    /// 信令中心地址 (默认读配置文件)
    #[arg(long)]
    hub: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 发送文件
    Send {
        /// 要发送的文件路径
        file: PathBuf,
        /// 目标对端 (ID 或名字)
        peer: String,
        /// 跳过直连，直接走服务器中继
        #[arg(long)]
        relay: bool,
    },
    /// 接收文件
    Receive {
        /// 保存目录 (默认: ~/Downloads)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// 自动接受所有传输请求
        #[arg(short = 'y', long)]
        yes: bool,
        /// 收满 N 个文件后退出 (默认一直在线)
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },
    /// 列出在线对端
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_log::LogTracer::init();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .try_init();

    let cli = Cli::parse();
    let settings = AppSettings::load();
    let hub_url = cli.hub.unwrap_or(settings.hub_url);

    match cli.command {
        Commands::Send { file, peer, relay } => {
            println!("📤 发送文件: {}", file.display());
            let transport = if relay {
                TransportKind::Relay
            } else {
                TransportKind::Direct
            };
            let sender = Sender::new(SendOptions { hub_url, transport });
            sender.send_to_peer(&peer, &file, &ConsoleCallback).await?;
        }
        Commands::Receive { output, yes, count } => {
            let output_dir = output
                .or_else(dirs::download_dir)
                .unwrap_or_else(|| PathBuf::from("."));
            println!("📥 接收模式 (保存到: {})", output_dir.display());
            let receiver = Receiver::new(ReceiveOptions {
                hub_url,
                output_dir,
                auto_accept: yes,
                max_files: count,
            });
            let files = receiver.start(&ConsoleCallback).await?;
            println!("共收到 {} 个文件", files.len());
        }
        Commands::List => {
            let (client, _events) =
                Client::connect(&hub_url, ClientOptions::new(Arc::new(AutoReject))).await?;
            println!(
                "本机身份: {} ({})",
                client.identity().name,
                client.identity().id
            );
            let peers = client.peers().await?;
            if peers.is_empty() {
                println!("当前没有其他在线对端");
            } else {
                for peer in peers {
                    println!("   {} ({})", peer.name, peer.id);
                }
            }
            client.close();
        }
    }

    Ok(())
}

/// 把进度打到终端的回调
struct ConsoleCallback;

fn print_progress(done: u64, total: u64, speed: f64) {
    let percent = if total == 0 {
        100.0
    } else {
        done as f64 / total as f64 * 100.0
    };
    print!(
        "\r   {:.1}% ({}/{} 字节, {:.1} KB/s)   ",
        percent,
        done,
        total,
        speed / 1024.0
    );
    let _ = std::io::stdout().flush();
}

impl SendProgressCallback for ConsoleCallback {
    fn on_status(&self, status: &str) {
        println!("   {}", status);
    }

    fn on_progress(&self, sent: u64, total: u64, speed: f64) {
        print_progress(sent, total, speed);
    }

    fn on_complete(&self) {
        println!("\n✅ 发送完成");
    }

    fn on_error(&self, error: &str) {
        println!("\n❌ 发送失败: {}", error);
    }
}

impl ReceiveProgressCallback for ConsoleCallback {
    fn on_status(&self, status: &str) {
        println!("   {}", status);
    }

    fn on_request(&self, request: &ReceiveRequest) -> bool {
        print!(
            "📨 {} 想发送 '{}' ({} 字节)，接受? [y/N] ",
            request.sender_name, request.file_name, request.size
        );
        let _ = std::io::stdout().flush();
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim(), "y" | "Y" | "yes")
    }

    fn on_progress(&self, received: u64, total: u64, speed: f64) {
        print_progress(received, total, speed);
    }

    fn on_file(&self, path: &Path) {
        println!("\n✅ 已保存: {}", path.display());
    }

    fn on_error(&self, error: &str) {
        println!("\n❌ 接收失败: {}", error);
    }
}
