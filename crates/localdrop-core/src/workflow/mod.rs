//! 高层工作流
//!
//! 把客户端事件循环封装成一次性的发送/接收流程，供 CLI
//! 等前端直接调用。

pub mod receiver;
pub mod sender;

pub use receiver::{
    ReceiveEvent, ReceiveOptions, ReceiveProgressCallback, ReceiveRequest, Receiver,
    SimpleReceiveCallback,
};
pub use sender::{SendEvent, SendOptions, SendProgressCallback, Sender, SimpleSendCallback};
