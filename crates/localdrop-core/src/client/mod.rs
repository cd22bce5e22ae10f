//! 客户端事件循环
//!
//! 单个任务独占全部可变状态：在线对端、协商会话、进行中的
//! 收发。输入来自三路：信令中心的 WebSocket、公开 API 的命令
//! 通道、各会话传输层的事件转发。没有跨任务的共享锁。
//!
//! 传输层事件带着 (对端, 会话) 标签进循环，会话被替换后
//! 旧会话的遗留事件直接忽略。

pub mod decision;
pub mod events;
pub mod failover;

pub use decision::{AutoAccept, AutoReject, Decision, DecisionHandler};
pub use events::{ClientEvent, ReceivedFile};
pub use failover::OutgoingTransfer;

use crate::protocol::{DECISION_TIMEOUT_SECS, FileMetadata, PeerInfo, SignalMessage};
use crate::session::{
    ControlFrame, Frame, Negotiator, TcpTransportConfig, TcpTransportFactory, TransportEvent,
    TransportFactory,
};
use crate::transfer::{
    Direction, DirectPush, DirectReceiver, RelayReceiver, TransferState, TransportKind,
    send_direct_file, send_relay_file,
};
use anyhow::{Context, bail};
use futures_util::{SinkExt, StreamExt, stream::SplitStream};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use uuid::Uuid;

type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// 客户端配置
pub struct ClientOptions {
    /// 传输请求的决策方
    pub decision: Arc<dyn DecisionHandler>,
    /// 直连通道工厂
    pub transport: Arc<dyn TransportFactory>,
    /// 决策等待上限，超时按拒绝处理
    pub decision_timeout: Duration,
}

impl ClientOptions {
    pub fn new(decision: Arc<dyn DecisionHandler>) -> Self {
        Self {
            decision,
            transport: Arc::new(TcpTransportFactory::new(TcpTransportConfig::default())),
            decision_timeout: Duration::from_secs(DECISION_TIMEOUT_SECS),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn TransportFactory>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_decision_timeout(mut self, timeout: Duration) -> Self {
        self.decision_timeout = timeout;
        self
    }
}

/// 公开 API 的命令
enum Command {
    SendFile {
        peer_id: String,
        path: PathBuf,
        transport: TransportKind,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
    Close,
}

/// 事件循环的内部输入
enum Internal {
    /// 某会话的传输层事件，带会话标签以过滤陈旧事件
    Transport {
        peer_id: String,
        session: Uuid,
        event: TransportEvent,
    },
    /// 决策任务出了结果
    Decision {
        peer_id: String,
        kind: TransportKind,
        decision: Decision,
    },
    /// 发送任务结束
    PumpDone {
        peer_id: String,
        kind: TransportKind,
        result: anyhow::Result<()>,
    },
}

/// 已连接信令中心的客户端句柄
///
/// 句柄可以克隆，实际状态都在事件循环任务里。
#[derive(Clone)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    identity: PeerInfo,
    server_address: String,
}

impl Client {
    /// 连接信令中心，等待 welcome 拿到身份后返回
    pub async fn connect(
        hub_url: &str,
        options: ClientOptions,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<ClientEvent>)> {
        let (ws, _) = connect_async(hub_url)
            .await
            .with_context(|| format!("failed to connect to hub at {hub_url}"))?;
        let (mut ws_write, ws_read) = ws.split();

        // 信令出站走专用写者任务，保证发送顺序
        let (hub_tx, mut hub_rx) = mpsc::unbounded_channel::<SignalMessage>();
        tokio::spawn(async move {
            while let Some(msg) = hub_rx.recv().await {
                if ws_write.send(Message::Text(msg.to_json())).await.is_err() {
                    break;
                }
            }
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (welcome_tx, welcome_rx) = oneshot::channel();

        let inner = ClientInner {
            options,
            hub_tx,
            events: events_tx,
            internal_tx,
            welcome_tx: Some(welcome_tx),
            identity: None,
            peers: HashMap::new(),
            sessions: HashMap::new(),
            outgoing: HashMap::new(),
            incoming_direct: HashMap::new(),
            incoming_relay: HashMap::new(),
            pending_relay_offers: HashMap::new(),
        };
        tokio::spawn(run_loop(inner, ws_read, commands_rx, internal_rx));

        let (identity, server_address) = welcome_rx
            .await
            .context("hub closed connection before welcome")?;
        info!("joined hub as {} ({})", identity.name, identity.id);
        Ok((
            Self {
                commands: commands_tx,
                identity,
                server_address,
            },
            events_rx,
        ))
    }

    /// 信令中心分配的身份
    pub fn identity(&self) -> &PeerInfo {
        &self.identity
    }

    /// 信令中心通告的访问地址
    pub fn server_address(&self) -> &str {
        &self.server_address
    }

    /// 当前在线的其他对端
    pub async fn peers(&self) -> anyhow::Result<Vec<PeerInfo>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Peers { reply })
            .map_err(|_| anyhow::anyhow!("client event loop has stopped"))?;
        rx.await.context("client event loop has stopped")
    }

    /// 向对端发送一个文件
    ///
    /// `transport` 选初始路径；选直连时失败会自动切中继。
    /// 同一对端同时只允许一笔发送，重复调用返回错误。
    pub async fn send_file(
        &self,
        peer_id: &str,
        path: impl AsRef<Path>,
        transport: TransportKind,
    ) -> anyhow::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::SendFile {
                peer_id: peer_id.to_string(),
                path: path.as_ref().to_path_buf(),
                transport,
                reply,
            })
            .map_err(|_| anyhow::anyhow!("client event loop has stopped"))?;
        rx.await.context("client event loop has stopped")?
    }

    /// 断开并停止事件循环
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }
}

/// 一个活动会话：协商状态机加上会话标签
struct Session {
    id: Uuid,
    negotiator: Negotiator,
}

struct ClientInner {
    options: ClientOptions,
    hub_tx: mpsc::UnboundedSender<SignalMessage>,
    events: mpsc::UnboundedSender<ClientEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    welcome_tx: Option<oneshot::Sender<(PeerInfo, String)>>,
    identity: Option<PeerInfo>,
    /// 在线对端，不含自己
    peers: HashMap<String, PeerInfo>,
    /// 每对端至多一个会话，新会话直接替换旧的
    sessions: HashMap<String, Session>,
    /// 每对端至多一笔进行中的发送
    outgoing: HashMap<String, OutgoingTransfer>,
    incoming_direct: HashMap<String, DirectReceiver>,
    incoming_relay: HashMap<String, RelayReceiver>,
    /// 已收到 ws-file-start、决策尚未出结果的请求
    pending_relay_offers: HashMap<String, FileMetadata>,
}

async fn run_loop(
    mut inner: ClientInner,
    mut ws_read: WsReader,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut internal: mpsc::UnboundedReceiver<Internal>,
) {
    loop {
        tokio::select! {
            msg = ws_read.next() => match msg {
                Some(Ok(Message::Text(text))) => inner.handle_signal(&text).await,
                Some(Ok(Message::Close(_))) | None => {
                    info!("hub connection closed");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("hub connection error: {}", e);
                    break;
                }
            },
            Some(cmd) = commands.recv() => match cmd {
                Command::Close => break,
                other => inner.handle_command(other).await,
            },
            Some(event) = internal.recv() => inner.handle_internal(event).await,
        }
    }
}

impl ClientInner {
    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn send_signal(&self, msg: SignalMessage) {
        let _ = self.hub_tx.send(msg);
    }

    fn peer_info(&self, peer_id: &str) -> PeerInfo {
        self.peers.get(peer_id).cloned().unwrap_or_else(|| PeerInfo {
            id: peer_id.to_string(),
            name: peer_id.to_string(),
        })
    }

    async fn handle_signal(&mut self, text: &str) {
        let msg = match SignalMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("ignoring malformed signal message: {}", e);
                return;
            }
        };
        match msg {
            SignalMessage::Welcome {
                user,
                all_users,
                server_address,
            } => {
                for peer in all_users {
                    if peer.id != user.id {
                        self.peers.insert(peer.id.clone(), peer);
                    }
                }
                self.identity = Some(user.clone());
                self.emit(ClientEvent::Welcome {
                    identity: user.clone(),
                    server_address: server_address.clone(),
                });
                if let Some(tx) = self.welcome_tx.take() {
                    let _ = tx.send((user, server_address));
                }
            }
            SignalMessage::UserJoined { user } => {
                debug!("peer joined: {} ({})", user.name, user.id);
                self.peers.insert(user.id.clone(), user.clone());
                self.emit(ClientEvent::PeerJoined(user));
            }
            SignalMessage::UserLeft { id } => {
                debug!("peer left: {}", id);
                self.peers.remove(&id);
                self.drop_peer_state(&id);
                self.emit(ClientEvent::PeerLeft { peer_id: id });
            }
            SignalMessage::Offer { from: Some(from), offer, .. } => {
                self.handle_offer(from, &offer).await;
            }
            SignalMessage::Answer { from: Some(from), answer, .. } => {
                if let Some(session) = self.sessions.get_mut(&from) {
                    if let Err(e) = session.negotiator.handle_answer(&answer).await {
                        warn!("failed to apply answer from {}: {}", from, e);
                        session.negotiator.mark_failed();
                        self.handle_direct_failure(&from, e.to_string());
                    }
                } else {
                    debug!("answer from {} without session, ignoring", from);
                }
            }
            SignalMessage::Candidate { from: Some(from), candidate, .. } => {
                if let Some(session) = self.sessions.get_mut(&from) {
                    if let Err(e) = session.negotiator.handle_candidate(&candidate).await {
                        warn!("failed to apply candidate from {}: {}", from, e);
                    }
                } else {
                    debug!("candidate from {} without session, ignoring", from);
                }
            }
            SignalMessage::WsFileStart { from: Some(from), metadata, .. } => {
                self.handle_relay_request(from, metadata);
            }
            SignalMessage::WsFileAccept { from: Some(from), .. } => {
                self.handle_relay_accept(&from);
            }
            SignalMessage::WsFileReject { from: Some(from), .. } => {
                if let Some(transfer) = self.outgoing.remove(&from) {
                    transfer.cancel();
                    info!("peer {} rejected '{}'", from, transfer.metadata.name);
                    self.emit(ClientEvent::TransferRejected {
                        peer_id: from,
                        file_name: transfer.metadata.name,
                    });
                } else {
                    debug!("stale ws-file-reject from {}", from);
                }
            }
            SignalMessage::WsFileChunk { from: Some(from), chunk, seq, .. } => {
                self.handle_relay_chunk(&from, seq, &chunk);
            }
            SignalMessage::WsFileEnd { from: Some(from), checksum, .. } => {
                self.handle_relay_end(&from, &checksum);
            }
            other => {
                debug!("ignoring signal without sender: {:?}", other);
            }
        }
    }

    /// 对端发起直连：建应答方会话并回 answer
    async fn handle_offer(&mut self, from: String, offer: &serde_json::Value) {
        let transport = self.options.transport.create();
        match Negotiator::answer(transport, offer).await {
            Ok((mut negotiator, answer)) => {
                let session_id = Uuid::new_v4();
                if let Some(events) = negotiator.take_events() {
                    self.spawn_session_forwarder(from.clone(), session_id, events);
                }
                self.sessions.insert(
                    from.clone(),
                    Session {
                        id: session_id,
                        negotiator,
                    },
                );
                self.send_signal(SignalMessage::Answer {
                    to: Some(from),
                    from: None,
                    answer,
                });
            }
            Err(e) => {
                warn!("failed to answer offer from {}: {}", from, e);
            }
        }
    }

    /// 收到中继传输请求：挂起等决策
    fn handle_relay_request(&mut self, from: String, metadata: FileMetadata) {
        info!(
            "relay transfer request from {}: '{}' ({} bytes)",
            from, metadata.name, metadata.size
        );
        self.pending_relay_offers
            .insert(from.clone(), metadata.clone());
        self.spawn_decision(from, TransportKind::Relay, metadata);
    }

    /// 对方接受了中继请求：启动发送任务
    fn handle_relay_accept(&mut self, from: &str) {
        let ready = matches!(
            self.outgoing.get(from),
            Some(t) if t.transport == TransportKind::Relay && t.state == TransferState::Requested
        );
        if !ready {
            debug!("stale ws-file-accept from {}", from);
            return;
        }
        let transfer = self.outgoing.get_mut(from).expect("checked above");
        transfer.state = TransferState::Accepted;
        let metadata = transfer.metadata.clone();
        let path = transfer.path.clone();
        let cancelled = transfer.cancel_token();
        // 中继路径接受后立即开始推流
        transfer.state = TransferState::Transferring;

        let hub = self.hub_tx.clone();
        let events = self.events.clone();
        let internal = self.internal_tx.clone();
        let peer_id = from.to_string();
        tokio::spawn(async move {
            let total = metadata.size;
            let file_name = metadata.name.clone();
            let progress_peer = peer_id.clone();
            let result = send_relay_file(&path, &metadata, &peer_id, hub, cancelled, |bytes, speed| {
                let _ = events.send(ClientEvent::TransferProgress {
                    peer_id: progress_peer.clone(),
                    file_name: file_name.clone(),
                    direction: Direction::Outgoing,
                    bytes,
                    total,
                    speed,
                });
            })
            .await;
            let _ = internal.send(Internal::PumpDone {
                peer_id,
                kind: TransportKind::Relay,
                result,
            });
        });
    }

    fn handle_relay_chunk(&mut self, from: &str, seq: u64, chunk: &str) {
        let Some(receiver) = self.incoming_relay.get_mut(from) else {
            debug!("relay chunk from {} without active transfer", from);
            return;
        };
        match receiver.push_chunk(seq, chunk) {
            Ok((bytes, speed)) => {
                let total = receiver.metadata().size;
                let file_name = receiver.metadata().name.clone();
                self.emit(ClientEvent::TransferProgress {
                    peer_id: from.to_string(),
                    file_name,
                    direction: Direction::Incoming,
                    bytes,
                    total,
                    speed,
                });
            }
            Err(e) => {
                let receiver = self.incoming_relay.remove(from).expect("checked above");
                warn!("relay transfer from {} aborted: {}", from, e);
                self.emit(ClientEvent::TransferFailed {
                    peer_id: from.to_string(),
                    file_name: receiver.metadata().name.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    fn handle_relay_end(&mut self, from: &str, checksum: &str) {
        let Some(receiver) = self.incoming_relay.remove(from) else {
            debug!("ws-file-end from {} without active transfer", from);
            return;
        };
        let metadata = receiver.metadata().clone();
        match receiver.finish(checksum) {
            Ok(bytes) => {
                info!("received '{}' from {} via relay", metadata.name, from);
                self.emit(ClientEvent::FileReceived(ReceivedFile {
                    from: self.peer_info(from),
                    metadata,
                    bytes,
                }));
            }
            Err(e) => {
                warn!("relay transfer from {} failed verification: {}", from, e);
                self.emit(ClientEvent::TransferFailed {
                    peer_id: from.to_string(),
                    file_name: metadata.name,
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Peers { reply } => {
                let _ = reply.send(self.peers.values().cloned().collect());
            }
            Command::SendFile {
                peer_id,
                path,
                transport,
                reply,
            } => {
                let _ = reply.send(self.start_send(peer_id, path, transport).await);
            }
            Command::Close => {}
        }
    }

    async fn start_send(
        &mut self,
        peer_id: String,
        path: PathBuf,
        transport: TransportKind,
    ) -> anyhow::Result<()> {
        if !self.peers.contains_key(&peer_id) {
            bail!("unknown peer: {peer_id}");
        }
        if self.outgoing.contains_key(&peer_id) {
            bail!("a transfer to {peer_id} is already in progress");
        }
        let metadata = build_metadata(&path).await?;

        match transport {
            TransportKind::Direct => {
                let channel = self.options.transport.create();
                let (mut negotiator, offer) = Negotiator::offer(channel)
                    .await
                    .context("failed to create direct channel offer")?;
                let session_id = Uuid::new_v4();
                if let Some(events) = negotiator.take_events() {
                    self.spawn_session_forwarder(peer_id.clone(), session_id, events);
                }
                self.sessions.insert(
                    peer_id.clone(),
                    Session {
                        id: session_id,
                        negotiator,
                    },
                );
                self.send_signal(SignalMessage::Offer {
                    to: Some(peer_id.clone()),
                    from: None,
                    offer,
                });
            }
            TransportKind::Relay => {
                self.send_signal(SignalMessage::WsFileStart {
                    to: Some(peer_id.clone()),
                    from: None,
                    metadata: metadata.clone(),
                });
            }
        }
        info!(
            "offering '{}' ({} bytes) to {} via {:?}",
            metadata.name, metadata.size, peer_id, transport
        );
        self.outgoing
            .insert(peer_id, OutgoingTransfer::new(metadata, path, transport));
        Ok(())
    }

    async fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Transport {
                peer_id,
                session,
                event,
            } => {
                let current = self.sessions.get(&peer_id).map(|s| s.id);
                if current != Some(session) {
                    debug!("dropping event from stale session with {}", peer_id);
                    return;
                }
                self.handle_transport_event(&peer_id, event).await;
            }
            Internal::Decision {
                peer_id,
                kind,
                decision,
            } => self.handle_decision(&peer_id, kind, decision).await,
            Internal::PumpDone {
                peer_id,
                kind,
                result,
            } => self.handle_pump_done(&peer_id, kind, result),
        }
    }

    async fn handle_transport_event(&mut self, peer_id: &str, event: TransportEvent) {
        match event {
            TransportEvent::Candidate(candidate) => {
                self.send_signal(SignalMessage::Candidate {
                    to: Some(peer_id.to_string()),
                    from: None,
                    candidate,
                });
            }
            TransportEvent::Connected { relayed } => {
                if let Some(session) = self.sessions.get_mut(peer_id) {
                    session.negotiator.mark_connected();
                }
                info!("direct channel to {} connected (relayed: {})", peer_id, relayed);
                self.emit(ClientEvent::ChannelConnected {
                    peer_id: peer_id.to_string(),
                    relayed,
                });
                self.start_direct_pump(peer_id);
            }
            TransportEvent::Frame(Frame::Control(ControlFrame::Meta(metadata))) => {
                info!(
                    "direct transfer request from {}: '{}' ({} bytes)",
                    peer_id, metadata.name, metadata.size
                );
                self.incoming_direct
                    .insert(peer_id.to_string(), DirectReceiver::new(metadata.clone()));
                self.spawn_decision(peer_id.to_string(), TransportKind::Direct, metadata);
            }
            TransportEvent::Frame(Frame::Control(ControlFrame::Reject)) => {
                if let Some(transfer) = self.outgoing.remove(peer_id) {
                    transfer.cancel();
                    info!("peer {} rejected '{}'", peer_id, transfer.metadata.name);
                    self.emit(ClientEvent::TransferRejected {
                        peer_id: peer_id.to_string(),
                        file_name: transfer.metadata.name,
                    });
                }
            }
            TransportEvent::Frame(Frame::Binary(bytes)) => {
                self.handle_direct_chunk(peer_id, bytes);
            }
            TransportEvent::Failed(reason) => {
                if let Some(session) = self.sessions.get_mut(peer_id) {
                    session.negotiator.mark_failed();
                }
                self.handle_direct_failure(peer_id, reason);
            }
            TransportEvent::Closed => {
                debug!("direct channel to {} closed", peer_id);
                self.sessions.remove(peer_id);
                if let Some(receiver) = self.incoming_direct.remove(peer_id) {
                    if !receiver.is_rejected() {
                        self.emit(ClientEvent::TransferFailed {
                            peer_id: peer_id.to_string(),
                            file_name: receiver.metadata().name.clone(),
                            reason: "channel closed before transfer completed".to_string(),
                        });
                    }
                }
            }
        }
    }

    fn handle_direct_chunk(&mut self, peer_id: &str, bytes: Vec<u8>) {
        let Some(receiver) = self.incoming_direct.get_mut(peer_id) else {
            debug!("binary frame from {} without metadata, dropping", peer_id);
            return;
        };
        let total = receiver.metadata().size;
        let file_name = receiver.metadata().name.clone();
        match receiver.push(bytes) {
            DirectPush::Progress { received, speed } => {
                self.emit(ClientEvent::TransferProgress {
                    peer_id: peer_id.to_string(),
                    file_name,
                    direction: Direction::Incoming,
                    bytes: received,
                    total,
                    speed,
                });
            }
            DirectPush::Complete(bytes) => {
                let receiver = self.incoming_direct.remove(peer_id).expect("checked above");
                let metadata = receiver.metadata().clone();
                info!("received '{}' from {} via direct channel", metadata.name, peer_id);
                self.emit(ClientEvent::FileReceived(ReceivedFile {
                    from: self.peer_info(peer_id),
                    metadata,
                    bytes,
                }));
            }
            DirectPush::Discarded => {}
        }
    }

    /// 直连通道建立后，若本端有等着发的直连传输就开始推
    fn start_direct_pump(&mut self, peer_id: &str) {
        let ready = matches!(
            self.outgoing.get(peer_id),
            Some(t) if t.transport == TransportKind::Direct && t.state == TransferState::Requested
        );
        if !ready {
            return;
        }
        let Some(sink) = self.sessions.get(peer_id).map(|s| s.negotiator.frame_sink()) else {
            return;
        };
        let transfer = self.outgoing.get_mut(peer_id).expect("checked above");
        transfer.state = TransferState::Transferring;
        let metadata = transfer.metadata.clone();
        let path = transfer.path.clone();
        let cancelled = transfer.cancel_token();

        let events = self.events.clone();
        let internal = self.internal_tx.clone();
        let peer_id = peer_id.to_string();
        tokio::spawn(async move {
            let total = metadata.size;
            let file_name = metadata.name.clone();
            let progress_peer = peer_id.clone();
            let result = send_direct_file(&path, &metadata, sink, cancelled, |bytes, speed| {
                let _ = events.send(ClientEvent::TransferProgress {
                    peer_id: progress_peer.clone(),
                    file_name: file_name.clone(),
                    direction: Direction::Outgoing,
                    bytes,
                    total,
                    speed,
                });
            })
            .await;
            let _ = internal.send(Internal::PumpDone {
                peer_id,
                kind: TransportKind::Direct,
                result,
            });
        });
    }

    /// 直连路径失败：进行中的直连发送切到中继重发，
    /// 每笔传输至多切换一次；进行中的直连接收直接判失败，
    /// 没有关联传输时只上报通道错误
    fn handle_direct_failure(&mut self, peer_id: &str, reason: String) {
        self.sessions.remove(peer_id);
        match self.outgoing.get_mut(peer_id) {
            Some(transfer) if transfer.transport == TransportKind::Direct => {
                if transfer.try_failover() {
                    info!(
                        "direct channel to {} failed ({}), retrying '{}' via relay",
                        peer_id, reason, transfer.metadata.name
                    );
                    let metadata = transfer.metadata.clone();
                    self.emit(ClientEvent::FailoverStarted {
                        peer_id: peer_id.to_string(),
                        file_name: metadata.name.clone(),
                    });
                    self.send_signal(SignalMessage::WsFileStart {
                        to: Some(peer_id.to_string()),
                        from: None,
                        metadata,
                    });
                } else {
                    let transfer = self.outgoing.remove(peer_id).expect("checked above");
                    transfer.cancel();
                    warn!("direct channel to {} failed: {}", peer_id, reason);
                    self.emit(ClientEvent::TransferFailed {
                        peer_id: peer_id.to_string(),
                        file_name: transfer.metadata.name,
                        reason,
                    });
                }
            }
            _ => {
                debug!("direct channel to {} failed: {}", peer_id, reason);
                // 半途断掉的接收要丢弃累积数据并判失败，
                // 与 Closed 分支一致
                if let Some(receiver) = self.incoming_direct.remove(peer_id) {
                    if !receiver.is_rejected() {
                        self.emit(ClientEvent::TransferFailed {
                            peer_id: peer_id.to_string(),
                            file_name: receiver.metadata().name.clone(),
                            reason,
                        });
                        return;
                    }
                }
                self.emit(ClientEvent::ChannelFailed {
                    peer_id: peer_id.to_string(),
                    reason,
                });
            }
        }
    }

    async fn handle_decision(&mut self, peer_id: &str, kind: TransportKind, decision: Decision) {
        match kind {
            TransportKind::Relay => {
                let Some(metadata) = self.pending_relay_offers.remove(peer_id) else {
                    debug!("decision for vanished relay offer from {}", peer_id);
                    return;
                };
                match decision {
                    Decision::Accepted => {
                        info!("accepting '{}' from {} via relay", metadata.name, peer_id);
                        self.incoming_relay
                            .insert(peer_id.to_string(), RelayReceiver::new(metadata));
                        self.send_signal(SignalMessage::WsFileAccept {
                            to: Some(peer_id.to_string()),
                            from: None,
                        });
                    }
                    Decision::Rejected => {
                        info!("rejecting '{}' from {}", metadata.name, peer_id);
                        self.send_signal(SignalMessage::WsFileReject {
                            to: Some(peer_id.to_string()),
                            from: None,
                        });
                    }
                }
            }
            TransportKind::Direct => {
                let Some(receiver) = self.incoming_direct.get_mut(peer_id) else {
                    debug!("decision for vanished direct transfer from {}", peer_id);
                    return;
                };
                match decision {
                    Decision::Accepted => receiver.accept(),
                    Decision::Rejected => {
                        // 标记拒绝后后续分片被丢弃，再通知对端停发
                        receiver.reject();
                        if let Some(session) = self.sessions.get(peer_id) {
                            let _ = session
                                .negotiator
                                .frame_sink()
                                .send(Frame::Control(ControlFrame::Reject))
                                .await;
                        }
                    }
                }
            }
        }
    }

    fn handle_pump_done(&mut self, peer_id: &str, kind: TransportKind, result: anyhow::Result<()>) {
        // 切换中继后旧的直连任务还会结束一次，按传输路径过滤
        let current = matches!(
            self.outgoing.get(peer_id),
            Some(t) if t.transport == kind && t.state == TransferState::Transferring
        );
        if !current {
            debug!("ignoring completion of superseded {:?} pump for {}", kind, peer_id);
            return;
        }
        let transfer = self.outgoing.remove(peer_id).expect("checked above");
        match result {
            Ok(()) => {
                info!("sent '{}' to {}", transfer.metadata.name, peer_id);
                self.emit(ClientEvent::TransferSent {
                    peer_id: peer_id.to_string(),
                    file_name: transfer.metadata.name,
                });
            }
            Err(e) => {
                warn!("sending '{}' to {} failed: {}", transfer.metadata.name, peer_id, e);
                self.emit(ClientEvent::TransferFailed {
                    peer_id: peer_id.to_string(),
                    file_name: transfer.metadata.name,
                    reason: e.to_string(),
                });
            }
        }
    }

    /// 对端离线：丢弃与其相关的全部会话与传输
    fn drop_peer_state(&mut self, peer_id: &str) {
        self.sessions.remove(peer_id);
        self.pending_relay_offers.remove(peer_id);
        if let Some(transfer) = self.outgoing.remove(peer_id) {
            transfer.cancel();
            if !transfer.state.is_terminal() {
                self.emit(ClientEvent::TransferFailed {
                    peer_id: peer_id.to_string(),
                    file_name: transfer.metadata.name,
                    reason: "peer disconnected".to_string(),
                });
            }
        }
        if let Some(receiver) = self.incoming_direct.remove(peer_id) {
            if !receiver.is_rejected() {
                self.emit(ClientEvent::TransferFailed {
                    peer_id: peer_id.to_string(),
                    file_name: receiver.metadata().name.clone(),
                    reason: "peer disconnected".to_string(),
                });
            }
        }
        if let Some(receiver) = self.incoming_relay.remove(peer_id) {
            self.emit(ClientEvent::TransferFailed {
                peer_id: peer_id.to_string(),
                file_name: receiver.metadata().name.clone(),
                reason: "peer disconnected".to_string(),
            });
        }
    }

    /// 把会话的传输层事件贴上 (对端, 会话) 标签转进主循环
    fn spawn_session_forwarder(
        &self,
        peer_id: String,
        session_id: Uuid,
        mut events: mpsc::Receiver<TransportEvent>,
    ) {
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if internal
                    .send(Internal::Transport {
                        peer_id: peer_id.clone(),
                        session: session_id,
                        event,
                    })
                    .is_err()
                {
                    break;
                }
            }
        });
    }

    /// 在独立任务里征询决策，避免阻塞主循环
    fn spawn_decision(&self, peer_id: String, kind: TransportKind, metadata: FileMetadata) {
        let handler = Arc::clone(&self.options.decision);
        let timeout = self.options.decision_timeout;
        let from = self.peer_info(&peer_id);
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let decision = decision::decide_with_timeout(handler, &from, &metadata, timeout).await;
            let _ = internal.send(Internal::Decision {
                peer_id,
                kind,
                decision,
            });
        });
    }
}

/// 从文件路径构造传输元数据
async fn build_metadata(path: &Path) -> anyhow::Result<FileMetadata> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .with_context(|| format!("invalid file name: {}", path.display()))?;
    let meta = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    if !meta.is_file() {
        bail!("{} is not a regular file", path.display());
    }
    let mime_type = mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string();
    Ok(FileMetadata {
        name,
        size: meta.len(),
        mime_type,
    })
}
