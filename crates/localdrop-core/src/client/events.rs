//! 客户端事件
//!
//! 事件循环向外推送的状态变化。UI 层只消费这里的事件，
//! 不直接触碰信令或通道内部。

use crate::protocol::{FileMetadata, PeerInfo};
use crate::transfer::Direction;

/// 一个已接收并组装完成的文件
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    /// 发送方
    pub from: PeerInfo,
    /// 文件元数据
    pub metadata: FileMetadata,
    /// 完整内容
    pub bytes: Vec<u8>,
}

/// 客户端事件
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// 已加入服务器，拿到自己的身份
    Welcome {
        identity: PeerInfo,
        server_address: String,
    },
    /// 有对端上线
    PeerJoined(PeerInfo),
    /// 有对端离线
    PeerLeft { peer_id: String },
    /// 点对点通道已建立
    ChannelConnected { peer_id: String, relayed: bool },
    /// 点对点通道建立失败或中途断开（没有牵连到任何传输时）
    ChannelFailed { peer_id: String, reason: String },
    /// 传输进度更新
    TransferProgress {
        peer_id: String,
        file_name: String,
        direction: Direction,
        /// 已传输字节数
        bytes: u64,
        /// 文件总大小
        total: u64,
        /// 估算速度，字节每秒
        speed: f64,
    },
    /// 收完了一个文件
    FileReceived(ReceivedFile),
    /// 发完了一个文件
    TransferSent { peer_id: String, file_name: String },
    /// 对方拒绝了传输
    TransferRejected { peer_id: String, file_name: String },
    /// 传输失败
    TransferFailed {
        peer_id: String,
        file_name: String,
        reason: String,
    },
    /// 直连失败，改走服务器中继重新发起
    FailoverStarted { peer_id: String, file_name: String },
}
