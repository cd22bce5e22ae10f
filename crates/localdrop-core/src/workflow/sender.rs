//! 发送端工作流
//!
//! 高层 API 封装完整的发送流程:
//! 1. 连接信令中心，等待 welcome
//! 2. 按 ID 或名字找到目标对端
//! 3. 发起传输 (默认直连，失败自动切中继)
//! 4. 跟踪进度直到发完、被拒或失败

use crate::client::{AutoReject, Client, ClientEvent, ClientOptions};
use crate::transfer::TransportKind;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

/// 发送进度回调
pub trait SendProgressCallback: Send + Sync {
    /// 状态更新
    fn on_status(&self, status: &str);
    /// 进度更新
    fn on_progress(&self, sent: u64, total: u64, speed: f64);
    /// 发送完成
    fn on_complete(&self);
    /// 发送失败
    fn on_error(&self, error: &str);
}

/// 发送选项
pub struct SendOptions {
    /// 信令中心地址
    pub hub_url: String,
    /// 初始传输路径
    pub transport: TransportKind,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            hub_url: "ws://127.0.0.1:3000/ws".to_string(),
            transport: TransportKind::Direct,
        }
    }
}

/// 发送端工作流
pub struct Sender {
    options: SendOptions,
}

impl Sender {
    pub fn new(options: SendOptions) -> Self {
        Self { options }
    }

    /// 发送文件到指定对端，`peer` 可以是 ID 或分配的名字
    pub async fn send_to_peer<C: SendProgressCallback>(
        &self,
        peer: &str,
        file: &Path,
        callback: &C,
    ) -> anyhow::Result<()> {
        callback.on_status("连接信令中心...");
        // 发送端不接收文件，一切入站请求直接拒绝
        let (client, mut events) =
            Client::connect(&self.options.hub_url, ClientOptions::new(Arc::new(AutoReject)))
                .await?;
        callback.on_status(&format!(
            "已加入，身份 {} ({})",
            client.identity().name,
            client.identity().id
        ));

        let target = self.resolve_peer(&client, peer).await?;
        callback.on_status(&format!("发送给 {} ({})...", target.name, target.id));
        client
            .send_file(&target.id, file, self.options.transport)
            .await?;

        // 跟踪事件直到本次传输到达终态
        let result = loop {
            let Some(event) = events.recv().await else {
                break Err(anyhow::anyhow!("hub connection lost"));
            };
            match event {
                ClientEvent::TransferProgress { peer_id, bytes, total, speed, .. }
                    if peer_id == target.id =>
                {
                    callback.on_progress(bytes, total, speed);
                }
                ClientEvent::FailoverStarted { peer_id, .. } if peer_id == target.id => {
                    callback.on_status("直连失败，改走服务器中继...");
                }
                ClientEvent::ChannelConnected { peer_id, .. } if peer_id == target.id => {
                    callback.on_status("直连通道已建立");
                }
                ClientEvent::TransferSent { peer_id, .. } if peer_id == target.id => {
                    break Ok(());
                }
                ClientEvent::TransferRejected { peer_id, .. } if peer_id == target.id => {
                    break Err(anyhow::anyhow!("peer rejected the transfer"));
                }
                ClientEvent::TransferFailed { peer_id, reason, .. } if peer_id == target.id => {
                    break Err(anyhow::anyhow!("transfer failed: {reason}"));
                }
                ClientEvent::PeerLeft { peer_id } if peer_id == target.id => {
                    break Err(anyhow::anyhow!("peer disconnected"));
                }
                _ => {}
            }
        };
        client.close();

        match result {
            Ok(()) => {
                callback.on_complete();
                Ok(())
            }
            Err(e) => {
                callback.on_error(&e.to_string());
                Err(e)
            }
        }
    }

    /// 先按 ID 精确匹配，再按名字不区分大小写匹配
    async fn resolve_peer(
        &self,
        client: &Client,
        peer: &str,
    ) -> anyhow::Result<crate::protocol::PeerInfo> {
        let peers = client.peers().await?;
        if let Some(found) = peers.iter().find(|p| p.id == peer) {
            return Ok(found.clone());
        }
        if let Some(found) = peers
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(peer))
        {
            return Ok(found.clone());
        }
        anyhow::bail!(
            "peer '{}' not found ({} peers online)",
            peer,
            peers.len()
        )
    }
}

/// 简化的发送回调实现
pub struct SimpleSendCallback {
    tx: mpsc::Sender<SendEvent>,
}

#[derive(Debug, Clone)]
pub enum SendEvent {
    Status(String),
    Progress { sent: u64, total: u64, speed: f64 },
    Complete,
    Error(String),
}

impl SimpleSendCallback {
    pub fn new() -> (Self, mpsc::Receiver<SendEvent>) {
        let (tx, rx) = mpsc::channel(32);
        (Self { tx }, rx)
    }
}

impl SendProgressCallback for SimpleSendCallback {
    fn on_status(&self, status: &str) {
        let _ = self.tx.try_send(SendEvent::Status(status.to_string()));
    }

    fn on_progress(&self, sent: u64, total: u64, speed: f64) {
        let _ = self.tx.try_send(SendEvent::Progress { sent, total, speed });
    }

    fn on_complete(&self) {
        let _ = self.tx.try_send(SendEvent::Complete);
    }

    fn on_error(&self, error: &str) {
        let _ = self.tx.try_send(SendEvent::Error(error.to_string()));
    }
}
