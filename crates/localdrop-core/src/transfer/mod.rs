//! 文件传输模块
//!
//! 包含:
//! - 直连通道的分片收发
//! - 经信令中心中继的回退收发
//! - 两条路径共用的吞吐估算

pub mod direct;
pub mod progress;
pub mod relay;

pub use direct::{DirectPush, DirectReceiver, send_direct_file};
pub use progress::SpeedEstimator;
pub use relay::{RelayError, RelayReceiver, send_relay_file};

/// 传输方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// 当前选用的传输路径
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Direct,
    Relay,
}

/// 单次传输的状态机
///
/// `Requested` 只出现在中继路径：直连路径没有显式的接受步骤，
/// 数据通道自己的 open 事件就是确认。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Requested,
    Accepted,
    Transferring,
    Completed,
    Rejected,
    Failed,
}

impl TransferState {
    /// 终态不再参与任何状态迁移
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Rejected | TransferState::Failed
        )
    }
}
