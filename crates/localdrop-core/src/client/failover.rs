//! 发送側传输记录与直连回退
//!
//! 每个对端同一时刻至多一笔发送。直连路径失败时整笔传输
//! 切到中继重发，且每笔传输至多切换一次，中继再失败就是
//! 终态失败，不会来回弹。

use crate::protocol::FileMetadata;
use crate::transfer::{TransferState, TransportKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// 一笔进行中的发送
pub struct OutgoingTransfer {
    pub metadata: FileMetadata,
    pub path: PathBuf,
    pub transport: TransportKind,
    pub state: TransferState,
    failover_done: bool,
    cancelled: Arc<AtomicBool>,
}

impl OutgoingTransfer {
    pub fn new(metadata: FileMetadata, path: PathBuf, transport: TransportKind) -> Self {
        Self {
            metadata,
            path,
            transport,
            state: TransferState::Requested,
            failover_done: false,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 直连失败后尝试切到中继
    ///
    /// 成功切换时撤销旧的发送任务、换新的取消令牌，
    /// 状态回到 [`TransferState::Requested`] 等待对方接受。
    /// 已经切换过、走的本来就是中继、或已到终态时返回 `false`。
    pub fn try_failover(&mut self) -> bool {
        if self.transport != TransportKind::Direct
            || self.failover_done
            || self.state.is_terminal()
        {
            return false;
        }
        self.failover_done = true;
        self.cancel();
        self.cancelled = Arc::new(AtomicBool::new(false));
        self.transport = TransportKind::Relay;
        self.state = TransferState::Requested;
        true
    }

    /// 通知任何在跑的发送任务停下
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// 当前发送任务使用的取消令牌
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }
}
