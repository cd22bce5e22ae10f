//! LocalDrop Core Library
//!
//! 局域网文件互传的核心实现库：一个轻量信令中心加上
//! 点对点直连/服务器中继两条传输路径
//!
//! # 模块
//!
//! - **protocol**: 信令消息格式和协议常量
//! - **hub**: 信令中心 (WebSocket 路由器 + 成员管理)
//! - **session**: 直连通道的协商状态机和 TCP 传输
//! - **transfer**: 分片收发、进度估算、校验
//! - **client**: 单任务事件循环，驱动一个在线节点
//! - **workflow**: 面向 CLI 的一次性发送/接收流程
//!
//! # 使用示例
//!
//! ## 发送文件
//!
//! ```ignore
//! use localdrop_core::workflow::{SendOptions, Sender, SimpleSendCallback};
//!
//! let sender = Sender::new(SendOptions::default());
//! let (callback, mut events) = SimpleSendCallback::new();
//! sender.send_to_peer("Clever Fox", Path::new("photo.jpg"), &callback).await?;
//! ```
//!
//! ## 接收文件
//!
//! ```ignore
//! use localdrop_core::workflow::{ReceiveOptions, Receiver, SimpleReceiveCallback};
//!
//! let receiver = Receiver::new(ReceiveOptions::default());
//! let (callback, mut events) = SimpleReceiveCallback::new(true);
//! let files = receiver.start(&callback).await?;
//! ```
//!
//! ## 运行信令中心
//!
//! ```ignore
//! use localdrop_core::hub::{Hub, server_address};
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//! Hub::new(server_address(3000)).serve(listener).await?;
//! ```

pub mod client;
pub mod config;
pub mod hub;
pub mod protocol;
pub mod session;
pub mod transfer;
pub mod workflow;

// Protocol re-exports
pub use protocol::{
    DIRECT_CHUNK_SIZE, FileMetadata, PeerInfo, RELAY_CHUNK_SIZE, SignalMessage,
};

// Hub re-exports
pub use hub::Hub;

// Session re-exports
pub use session::{DirectTransport, Negotiator, TcpTransportConfig, TransportFactory};

// Transfer re-exports
pub use transfer::{Direction, TransferState, TransportKind};

// Client re-exports
pub use client::{
    AutoAccept, AutoReject, Client, ClientEvent, ClientOptions, Decision, DecisionHandler,
    ReceivedFile,
};
