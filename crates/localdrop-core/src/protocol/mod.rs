//! 信令协议消息格式
//!
//! 所有经过信令中心的消息都是 JSON 信封: `{type, to?, from?, ...payload}`
//! - type: kebab-case 消息类型
//! - to: 目标节点 ID (客户端填写)
//! - from: 发送者 ID (信令中心转发时盖章)
//!
//! 会话描述和候选地址对信封来说是不透明的 JSON 值，
//! 信令中心和协商状态机都不解释其内容。

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 直连通道单个分片大小 (16 KiB)
pub const DIRECT_CHUNK_SIZE: usize = 16 * 1024;

/// 中继回退路径单个分片大小 (128 KiB)
pub const RELAY_CHUNK_SIZE: usize = 128 * 1024;

/// 速度估算的最小采样间隔
pub const SPEED_SAMPLE_INTERVAL_MS: u64 = 200;

/// 接收决定的默认等待时间，超时视为拒绝
pub const DECISION_TIMEOUT_SECS: u64 = 10;

/// 节点身份 (由信令中心分配，未经认证)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    pub name: String,
}

/// 单个文件的传输元数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    /// MIME 类型，字段名与原始格式保持一致
    #[serde(rename = "type")]
    pub mime_type: String,
}

/// 信令信封
///
/// 路由类消息 (offer/answer/candidate/ws-file-*) 携带可选的
/// `to`/`from`；成员变化类消息由信令中心直接下发。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    #[serde(rename_all = "camelCase")]
    Welcome {
        user: PeerInfo,
        all_users: Vec<PeerInfo>,
        server_address: String,
    },
    UserJoined {
        user: PeerInfo,
    },
    UserLeft {
        id: String,
    },
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        offer: Value,
    },
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        answer: Value,
    },
    Candidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        candidate: Value,
    },
    WsFileStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        metadata: FileMetadata,
    },
    WsFileAccept {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
    WsFileReject {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
    WsFileChunk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        /// Base64 编码的分片数据
        chunk: String,
        /// 分片序号，接收端校验连续性
        seq: u64,
    },
    #[serde(rename_all = "camelCase")]
    WsFileEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        /// 整个文件的 SHA-256 摘要 (Base64)
        checksum: String,
    },
}

impl SignalMessage {
    /// 解析一条入站信封
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// 序列化为 JSON 文本
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("signal message serializes")
    }
}
