//! 经信令中心中继的回退传输
//!
//! 直连失败或显式选择中继时走这条路：`ws-file-start` 请求 →
//! 对端 accept/reject → 128 KiB 分片逐条 `ws-file-chunk` →
//! `ws-file-end` 收尾。分片用 Base64 编成文本安全形式。
//!
//! 中继路径没有传输层的完整性保障，因此每片带序号、结束帧带
//! SHA-256 摘要：序号断档或摘要不符都让传输失败，而不是悄悄
//! 交付一个损坏的文件。

use super::progress::SpeedEstimator;
use crate::protocol::{FileMetadata, RELAY_CHUNK_SIZE, SignalMessage};
use anyhow::{Context, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

/// 中继接收错误
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("chunk out of order: expected seq {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },
    #[error("invalid chunk encoding: {0}")]
    BadChunk(#[from] base64::DecodeError),
    #[error("size mismatch: declared {declared}, received {received}")]
    SizeMismatch { declared: u64, received: u64 },
    #[error("checksum mismatch")]
    ChecksumMismatch,
}

/// 中继传输的接收状态机
///
/// 只有完成了 start→accept 握手才会创建；不存在的接收器
/// 意味着对应的分片应被忽略 (已拒绝或从未请求)。
pub struct RelayReceiver {
    metadata: FileMetadata,
    chunks: Vec<Vec<u8>>,
    received: u64,
    next_seq: u64,
    progress: SpeedEstimator,
}

impl RelayReceiver {
    pub fn new(metadata: FileMetadata) -> Self {
        Self {
            metadata,
            chunks: Vec::new(),
            received: 0,
            next_seq: 0,
            progress: SpeedEstimator::new(),
        }
    }

    pub fn metadata(&self) -> &FileMetadata {
        &self.metadata
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// 解码并累积一个分片，返回 (累计字节, 速度)
    pub fn push_chunk(&mut self, seq: u64, chunk_b64: &str) -> Result<(u64, f64), RelayError> {
        if seq != self.next_seq {
            return Err(RelayError::OutOfOrder {
                expected: self.next_seq,
                got: seq,
            });
        }
        let bytes = BASE64.decode(chunk_b64)?;
        self.next_seq += 1;
        self.received += bytes.len() as u64;
        self.chunks.push(bytes);
        let speed = self.progress.update(self.received);
        Ok((self.received, speed))
    }

    /// 收到 `ws-file-end`：校验大小和摘要后组装文件
    pub fn finish(self, checksum_b64: &str) -> Result<Vec<u8>, RelayError> {
        if self.received != self.metadata.size {
            return Err(RelayError::SizeMismatch {
                declared: self.metadata.size,
                received: self.received,
            });
        }
        let mut assembled = Vec::with_capacity(self.received as usize);
        let mut hasher = Sha256::new();
        for chunk in &self.chunks {
            hasher.update(chunk);
            assembled.extend_from_slice(chunk);
        }
        let digest = BASE64.encode(hasher.finalize());
        if digest != checksum_b64 {
            return Err(RelayError::ChecksumMismatch);
        }
        Ok(assembled)
    }
}

/// 对端接受后，经信令中心串行发送整个文件
///
/// 每片一条 `ws-file-chunk`，随后一条带摘要的 `ws-file-end`。
pub async fn send_relay_file<F>(
    path: &Path,
    metadata: &FileMetadata,
    peer_id: &str,
    hub: mpsc::UnboundedSender<SignalMessage>,
    cancelled: Arc<AtomicBool>,
    mut progress: F,
) -> anyhow::Result<()>
where
    F: FnMut(u64, f64) + Send,
{
    let mut file = File::open(path)
        .await
        .with_context(|| format!("open {}", path.display()))?;
    let mut estimator = SpeedEstimator::new();
    let mut hasher = Sha256::new();
    let mut sent: u64 = 0;
    let mut seq: u64 = 0;

    while sent < metadata.size {
        if cancelled.load(Ordering::Relaxed) {
            return Ok(());
        }
        let chunk_len = RELAY_CHUNK_SIZE.min((metadata.size - sent) as usize);
        let mut buf = vec![0u8; chunk_len];
        file.read_exact(&mut buf).await?;
        hasher.update(&buf);
        let message = SignalMessage::WsFileChunk {
            to: Some(peer_id.to_string()),
            from: None,
            chunk: BASE64.encode(&buf),
            seq,
        };
        hub.send(message)
            .map_err(|_| anyhow!("hub connection closed mid-transfer"))?;
        seq += 1;
        sent += chunk_len as u64;
        let speed = estimator.update(sent);
        progress(sent, speed);
    }

    let end = SignalMessage::WsFileEnd {
        to: Some(peer_id.to_string()),
        from: None,
        checksum: BASE64.encode(hasher.finalize()),
    };
    hub.send(end)
        .map_err(|_| anyhow!("hub connection closed at end of transfer"))?;
    Ok(())
}
