//! 接收端工作流
//!
//! 高层 API 封装完整的接收流程:
//! 1. 连接信令中心并在线等待
//! 2. 收到传输请求时征询回调 (或自动接受)
//! 3. 接收完成的文件落盘到输出目录

use crate::client::{Client, ClientEvent, ClientOptions, Decision, DecisionHandler};
use crate::protocol::{FileMetadata, PeerInfo};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// 接收进度回调
pub trait ReceiveProgressCallback: Send + Sync {
    /// 状态更新
    fn on_status(&self, status: &str);
    /// 收到发送请求，返回是否接受
    fn on_request(&self, request: &ReceiveRequest) -> bool;
    /// 进度更新
    fn on_progress(&self, received: u64, total: u64, speed: f64);
    /// 一个文件接收完成并已落盘
    fn on_file(&self, path: &Path);
    /// 接收失败
    fn on_error(&self, error: &str);
}

/// 接收请求信息
#[derive(Debug, Clone)]
pub struct ReceiveRequest {
    pub sender_name: String,
    pub file_name: String,
    pub size: u64,
}

/// 接收选项
pub struct ReceiveOptions {
    /// 信令中心地址
    pub hub_url: String,
    /// 文件保存目录
    pub output_dir: PathBuf,
    /// 是否自动接受
    pub auto_accept: bool,
    /// 收满多少个文件后返回，`None` 表示一直在线
    pub max_files: Option<usize>,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            hub_url: "ws://127.0.0.1:3000/ws".to_string(),
            output_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            auto_accept: false,
            max_files: None,
        }
    }
}

/// 接收端工作流
pub struct Receiver {
    options: ReceiveOptions,
}

/// 把异步决策桥接到同步回调：请求连同应答通道一起转出去
struct ChannelDecision {
    tx: mpsc::UnboundedSender<(ReceiveRequest, oneshot::Sender<bool>)>,
}

#[async_trait]
impl DecisionHandler for ChannelDecision {
    async fn on_transfer_request(&self, from: &PeerInfo, metadata: &FileMetadata) -> Decision {
        let request = ReceiveRequest {
            sender_name: from.name.clone(),
            file_name: metadata.name.clone(),
            size: metadata.size,
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send((request, reply_tx)).is_err() {
            return Decision::Rejected;
        }
        match reply_rx.await {
            Ok(true) => Decision::Accepted,
            _ => Decision::Rejected,
        }
    }
}

impl Receiver {
    pub fn new(options: ReceiveOptions) -> Self {
        Self { options }
    }

    /// 开始接收模式，返回保存下来的文件路径
    pub async fn start<C: ReceiveProgressCallback>(
        &self,
        callback: &C,
    ) -> anyhow::Result<Vec<PathBuf>> {
        tokio::fs::create_dir_all(&self.options.output_dir).await?;

        callback.on_status("连接信令中心...");
        let (requests_tx, mut requests) = mpsc::unbounded_channel();
        let options = ClientOptions::new(Arc::new(ChannelDecision { tx: requests_tx }));
        let (client, mut events) = Client::connect(&self.options.hub_url, options).await?;
        callback.on_status(&format!(
            "已上线，身份 {} ({})，等待文件...",
            client.identity().name,
            client.identity().id
        ));

        let mut saved = Vec::new();
        loop {
            tokio::select! {
                Some((request, reply)) = requests.recv() => {
                    let accept = self.options.auto_accept || callback.on_request(&request);
                    let _ = reply.send(accept);
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        // 信令中心断开；已经收到文件就不算失败
                        if saved.is_empty() {
                            anyhow::bail!("hub connection lost");
                        }
                        break;
                    };
                    match event {
                        ClientEvent::TransferProgress { bytes, total, speed, .. } => {
                            callback.on_progress(bytes, total, speed);
                        }
                        ClientEvent::FileReceived(file) => {
                            let path = self.save(&file.metadata.name, &file.bytes).await?;
                            callback.on_file(&path);
                            saved.push(path);
                            if let Some(max) = self.options.max_files {
                                if saved.len() >= max {
                                    break;
                                }
                            }
                        }
                        ClientEvent::TransferFailed { reason, .. } => {
                            callback.on_error(&reason);
                        }
                        _ => {}
                    }
                }
            }
        }
        client.close();
        Ok(saved)
    }

    /// 落盘，同名文件不覆盖而是换个名字
    async fn save(&self, name: &str, bytes: &[u8]) -> anyhow::Result<PathBuf> {
        // 只取文件名部分，丢掉对端可能夹带的路径
        let name = Path::new(name)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("received.bin");
        let path = unique_path(&self.options.output_dir, name);
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }
}

/// 在目录下找一个不和现有文件冲突的路径
fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };
    for n in 1u32.. {
        let renamed = match ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = dir.join(renamed);
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!()
}

/// 简化的接收回调实现
pub struct SimpleReceiveCallback {
    tx: mpsc::Sender<ReceiveEvent>,
    auto_accept: bool,
}

#[derive(Debug, Clone)]
pub enum ReceiveEvent {
    Status(String),
    Request(ReceiveRequest),
    Progress { received: u64, total: u64, speed: f64 },
    File(PathBuf),
    Error(String),
}

impl SimpleReceiveCallback {
    pub fn new(auto_accept: bool) -> (Self, mpsc::Receiver<ReceiveEvent>) {
        let (tx, rx) = mpsc::channel(32);
        (Self { tx, auto_accept }, rx)
    }
}

impl ReceiveProgressCallback for SimpleReceiveCallback {
    fn on_status(&self, status: &str) {
        let _ = self.tx.try_send(ReceiveEvent::Status(status.to_string()));
    }

    fn on_request(&self, request: &ReceiveRequest) -> bool {
        let _ = self.tx.try_send(ReceiveEvent::Request(request.clone()));
        self.auto_accept
    }

    fn on_progress(&self, received: u64, total: u64, speed: f64) {
        let _ = self
            .tx
            .try_send(ReceiveEvent::Progress { received, total, speed });
    }

    fn on_file(&self, path: &Path) {
        let _ = self.tx.try_send(ReceiveEvent::File(path.to_path_buf()));
    }

    fn on_error(&self, error: &str) {
        let _ = self.tx.try_send(ReceiveEvent::Error(error.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_path_avoids_collisions() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            unique_path(dir.path(), "photo.jpg"),
            dir.path().join("photo.jpg")
        );

        std::fs::write(dir.path().join("photo.jpg"), b"x").unwrap();
        assert_eq!(
            unique_path(dir.path(), "photo.jpg"),
            dir.path().join("photo (1).jpg")
        );

        std::fs::write(dir.path().join("photo (1).jpg"), b"x").unwrap();
        assert_eq!(
            unique_path(dir.path(), "photo.jpg"),
            dir.path().join("photo (2).jpg")
        );

        // 无扩展名
        std::fs::write(dir.path().join("README"), b"x").unwrap();
        assert_eq!(
            unique_path(dir.path(), "README"),
            dir.path().join("README (1)")
        );
    }
}
