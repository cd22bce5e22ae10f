//! 直连通道抽象
//!
//! 协商状态机通过这层接口驱动具体传输，描述和候选地址
//! 对状态机保持不透明。本 crate 自带基于 TCP 的实现
//! ([`super::tcp::TcpDirectTransport`])，测试也走同一接口。

use crate::protocol::FileMetadata;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// 传输层错误
///
/// 乱序或畸形的描述交换最终都表现为 `Failed` 事件，
/// 状态机不区分更细的失败类型。
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid negotiation state: {0}")]
    InvalidState(&'static str),
    #[error("malformed description: {0}")]
    BadDescription(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// 直连通道上的控制帧 (JSON 文本帧)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "control", rename_all = "kebab-case")]
pub enum ControlFrame {
    /// 通道打开后的第一帧：文件元数据
    Meta(FileMetadata),
    /// 接收方拒绝本次传输，发送方应停止推送
    Reject,
}

/// 直连通道上的一帧
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Control(ControlFrame),
    Binary(Vec<u8>),
}

/// 传输层向上冒泡的事件
#[derive(Debug)]
pub enum TransportEvent {
    /// 发现了一个本地网络路径候选，应经信令中心发给对端
    Candidate(Value),
    /// 通道建立成功；`relayed` 表示路径经过了兜底中继，
    /// 说明网络环境受限，值得单独提示
    Connected { relayed: bool },
    /// 收到对端的一帧
    Frame(Frame),
    /// 通道建立失败或中途断开
    Failed(String),
    /// 对端正常关闭
    Closed,
}

/// 可协商的直连传输
#[async_trait]
pub trait DirectTransport: Send {
    /// 主动方：创建本地描述
    async fn create_offer(&mut self) -> Result<Value, TransportError>;

    /// 应答方：应用远端描述并产生应答描述
    async fn accept_offer(&mut self, offer: &Value) -> Result<Value, TransportError>;

    /// 主动方：应用远端应答
    async fn apply_answer(&mut self, answer: &Value) -> Result<(), TransportError>;

    /// 应用一个远端候选地址
    async fn add_candidate(&mut self, candidate: &Value) -> Result<(), TransportError>;

    /// 出站帧入口；容量即背压，一次只有一帧在途
    fn frame_sink(&self) -> mpsc::Sender<Frame>;

    /// 取走事件流，只能取一次
    fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>>;
}

/// 直连传输工厂，每个会话创建一条新通道
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Box<dyn DirectTransport>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_frame_encoding() {
        let meta = ControlFrame::Meta(FileMetadata {
            name: "photo.jpg".to_string(),
            size: 1024,
            mime_type: "image/jpeg".to_string(),
        });
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("\"control\":\"meta\""));
        assert!(json.contains("\"type\":\"image/jpeg\""));

        let reject = serde_json::to_string(&ControlFrame::Reject).unwrap();
        assert!(reject.contains("\"control\":\"reject\""));

        let parsed: ControlFrame = serde_json::from_str(&reject).unwrap();
        assert_eq!(parsed, ControlFrame::Reject);
    }
}
