//! 接收决定
//!
//! 收到传输请求时向外征询 accept/reject。决定是一个显式的
//! 异步值而不是回调续体：客户端带超时等待，超时按拒绝处理，
//! 避免一个没人应答的请求永远挂着。

use crate::protocol::{FileMetadata, PeerInfo};
use async_trait::async_trait;
use log::warn;
use std::sync::Arc;
use std::time::Duration;

/// 对一次传输请求的决定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accepted,
    Rejected,
}

/// 传输请求的决策方，通常由 UI 层实现
#[async_trait]
pub trait DecisionHandler: Send + Sync {
    /// 展示来自 `from` 的传输请求，等待用户决定
    async fn on_transfer_request(&self, from: &PeerInfo, metadata: &FileMetadata) -> Decision;
}

/// 无条件接受，用于无人值守的接收端
pub struct AutoAccept;

#[async_trait]
impl DecisionHandler for AutoAccept {
    async fn on_transfer_request(&self, _from: &PeerInfo, _metadata: &FileMetadata) -> Decision {
        Decision::Accepted
    }
}

/// 无条件拒绝
pub struct AutoReject;

#[async_trait]
impl DecisionHandler for AutoReject {
    async fn on_transfer_request(&self, _from: &PeerInfo, _metadata: &FileMetadata) -> Decision {
        Decision::Rejected
    }
}

/// 带超时地征询决定，超时视为拒绝
pub async fn decide_with_timeout(
    handler: Arc<dyn DecisionHandler>,
    from: &PeerInfo,
    metadata: &FileMetadata,
    timeout: Duration,
) -> Decision {
    match tokio::time::timeout(timeout, handler.on_transfer_request(from, metadata)).await {
        Ok(decision) => decision,
        Err(_) => {
            warn!(
                "transfer request from {} for '{}' unanswered, treating as rejected",
                from.id, metadata.name
            );
            Decision::Rejected
        }
    }
}
