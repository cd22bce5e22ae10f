//! 信令中心
//!
//! 维护在线节点集合，在两个命名节点之间转发任意类型的消息，
//! 并向所有节点广播成员变化。
//!
//! # 职责边界
//!
//! 信令中心是纯路由器：除了信封上的 `to` 字段之外不解释任何
//! 载荷，对传输和协商语义一无所知。路由未命中 (目标已下线)
//! 时记录日志并丢弃消息，发送方不会收到投递失败信号。

pub mod addr;
pub mod names;
pub mod registry;

pub use addr::{lan_ip, server_address};
pub use registry::{PeerHandle, PeerRegistry};

use crate::protocol::{PeerInfo, SignalMessage};
use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// 信令中心状态
pub struct HubState {
    registry: PeerRegistry,
    server_address: String,
}

/// 信令中心服务
pub struct Hub {
    state: Arc<HubState>,
}

impl Hub {
    /// `server_address` 会原样放进 `welcome` 消息，
    /// 供客户端展示连接码等带外发现手段。
    pub fn new(server_address: String) -> Self {
        Self {
            state: Arc::new(HubState {
                registry: PeerRegistry::new(),
                server_address,
            }),
        }
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.state.registry
    }

    /// 构建 axum 路由，WebSocket 端点挂在 `/ws`
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .with_state(self.state.clone())
    }

    /// 在给定监听器上运行信令中心
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        info!(
            "signaling hub listening on {} (advertised as {})",
            listener.local_addr()?,
            self.state.server_address
        );
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<HubState>>) -> Response {
    ws.on_upgrade(move |socket| handle_peer(socket, state))
}

/// 处理单个节点连接的完整生命周期
async fn handle_peer(socket: WebSocket, state: Arc<HubState>) {
    let info = PeerInfo {
        id: names::generate_id(),
        name: names::generate_name(),
    };
    info!("new peer connected: {} ({})", info.name, info.id);

    let (mut write, mut read) = socket.split();

    // 每个节点一个写出任务，保证对该节点的投递顺序
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if write.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    state
        .registry
        .register(PeerHandle::new(info.clone(), tx.clone()));

    // 欢迎消息包含自身身份、当前完整列表和信令中心地址
    let welcome = SignalMessage::Welcome {
        user: info.clone(),
        all_users: state.registry.snapshot(),
        server_address: state.server_address.clone(),
    };
    let _ = tx.send(welcome.to_json());

    let joined = SignalMessage::UserJoined { user: info.clone() }.to_json();
    state.registry.broadcast_except(&info.id, &joined);

    while let Some(result) = read.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(e) => {
                debug!("read error from {}: {}", info.id, e);
                break;
            }
        };
        match msg {
            Message::Text(text) => route_message(&state, &info.id, &text),
            Message::Close(_) => break,
            // 心跳帧由 axum 自动应答
            _ => {}
        }
    }

    state.registry.remove(&info.id);
    writer.abort();
    info!("peer disconnected: {} ({})", info.name, info.id);

    let left = SignalMessage::UserLeft {
        id: info.id.clone(),
    }
    .to_json();
    state.registry.broadcast_except(&info.id, &left);
}

/// 按 `to` 字段转发一条消息，盖上 `from` 后原样传递
///
/// 载荷格式错误只丢弃这一条消息，连接保持存活。
fn route_message(state: &HubState, from_id: &str, text: &str) {
    let mut value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("malformed message from {}: {}", from_id, e);
            return;
        }
    };

    let Some(to) = value.get("to").and_then(|v| v.as_str()).map(str::to_string) else {
        warn!("message from {} without 'to' field, dropped", from_id);
        return;
    };

    value["from"] = serde_json::Value::String(from_id.to_string());
    let forwarded = value.to_string();

    if state.registry.send_to(&to, forwarded) {
        debug!("forwarded message from {} to {}", from_id, to);
    } else {
        info!("could not route message from {} to {}", from_id, to);
    }
}
