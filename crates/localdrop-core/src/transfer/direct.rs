//! 直连通道上的分片传输
//!
//! 通道打开后第一帧是元数据控制帧，之后全部是 16 KiB 的二进制
//! 分片，严格串行：上一片被通道接受后才读下一片。接收侧累计
//! 字节数等于声明大小时即完成。
//!
//! 接收方拒绝时会回发一个 `reject` 控制帧，发送方据此停止推送，
//! 而不是继续往已被丢弃的缓冲里灌数据。

use super::progress::SpeedEstimator;
use crate::protocol::{DIRECT_CHUNK_SIZE, FileMetadata};
use crate::session::{ControlFrame, Frame};
use anyhow::{Context, anyhow};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

/// 接收方的决定状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecisionState {
    /// 决定未出，数据照常累积 (对端不等确认就开始推)
    Pending,
    Accepted,
    Rejected,
}

/// 一次 `push` 的结果
#[derive(Debug)]
pub enum DirectPush {
    /// 又收到一片，附当前进度
    Progress { received: u64, speed: f64 },
    /// 累计字节数到达声明大小，文件组装完毕
    Complete(Vec<u8>),
    /// 传输已被拒绝，分片被丢弃
    Discarded,
}

/// 直连传输的接收状态机
///
/// 由元数据帧创建，逐片累积，完成或拒绝后清空。
pub struct DirectReceiver {
    metadata: FileMetadata,
    chunks: Vec<Vec<u8>>,
    received: u64,
    progress: SpeedEstimator,
    decision: DecisionState,
}

impl DirectReceiver {
    pub fn new(metadata: FileMetadata) -> Self {
        Self {
            metadata,
            chunks: Vec::new(),
            received: 0,
            progress: SpeedEstimator::new(),
            decision: DecisionState::Pending,
        }
    }

    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    pub fn accept(&mut self) {
        if self.decision == DecisionState::Pending {
            self.decision = DecisionState::Accepted;
        }
    }

    /// 拒绝传输并丢弃已累积的数据
    pub fn reject(&mut self) {
        self.decision = DecisionState::Rejected;
        self.chunks.clear();
        self.received = 0;
    }

    pub fn is_rejected(&self) -> bool {
        self.decision == DecisionState::Rejected
    }

    /// 累积一个二进制分片
    pub fn push(&mut self, bytes: Vec<u8>) -> DirectPush {
        if self.decision == DecisionState::Rejected {
            return DirectPush::Discarded;
        }
        self.received += bytes.len() as u64;
        self.chunks.push(bytes);
        let speed = self.progress.update(self.received);

        if self.received >= self.metadata.size {
            let mut assembled = Vec::with_capacity(self.received as usize);
            for chunk in self.chunks.drain(..) {
                assembled.extend_from_slice(&chunk);
            }
            self.received = 0;
            DirectPush::Complete(assembled)
        } else {
            DirectPush::Progress {
                received: self.received,
                speed,
            }
        }
    }
}

/// 通过已打开的直连通道串行发送整个文件
///
/// `progress` 在每片发出后以 (累计字节, 速度) 调用；
/// `cancelled` 置位后在下一片边界安静退出。
pub async fn send_direct_file<F>(
    path: &Path,
    metadata: &FileMetadata,
    sink: mpsc::Sender<Frame>,
    cancelled: Arc<AtomicBool>,
    mut progress: F,
) -> anyhow::Result<()>
where
    F: FnMut(u64, f64) + Send,
{
    sink.send(Frame::Control(ControlFrame::Meta(metadata.clone())))
        .await
        .map_err(|_| anyhow!("direct channel closed before metadata"))?;

    let mut file = File::open(path)
        .await
        .with_context(|| format!("open {}", path.display()))?;
    let mut estimator = SpeedEstimator::new();
    let mut sent: u64 = 0;

    while sent < metadata.size {
        if cancelled.load(Ordering::Relaxed) {
            return Ok(());
        }
        let chunk_len = DIRECT_CHUNK_SIZE.min((metadata.size - sent) as usize);
        let mut buf = vec![0u8; chunk_len];
        file.read_exact(&mut buf).await?;
        sink.send(Frame::Binary(buf))
            .await
            .map_err(|_| anyhow!("direct channel closed mid-transfer"))?;
        sent += chunk_len as u64;
        let speed = estimator.update(sent);
        progress(sent, speed);
    }

    Ok(())
}
