//! 基于 TCP 的直连通道
//!
//! 局域网里两端可以直接互连，因此描述交换只需要携带监听地址：
//! 主动方绑定一个临时端口，把会话号放进描述，把可达地址作为
//! 候选逐个发出；应答方拿到候选后逐个尝试连接，握手时回写会话
//! 号防止串线。连接失败或超时统一表现为 `Failed` 事件，由上层
//! 的故障转移接管。
//!
//! # 帧格式
//!
//! `kind(1B) + length(4B, BE) + payload`，kind 0 为 JSON 控制帧，
//! kind 1 为原始二进制分片。

use super::transport::{
    ControlFrame, DirectTransport, Frame, TransportError, TransportEvent, TransportFactory,
};
use crate::hub::addr;
use async_trait::async_trait;
use log::{debug, warn};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

const FRAME_CONTROL: u8 = 0;
const FRAME_BINARY: u8 = 1;

/// 单帧大小上限，超出视为协议错误
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// 单个候选地址的连接尝试时限
const CANDIDATE_DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// TCP 直连配置
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// 应答方等待可用候选的总时限
    pub connect_timeout: Duration,
    /// 主动方等待对端连入的时限
    pub accept_timeout: Duration,
    /// 覆盖对外通告的候选地址 (默认为探测到的局域网地址和回环)
    pub advertise: Option<Vec<SocketAddr>>,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            accept_timeout: Duration::from_secs(10),
            advertise: None,
        }
    }
}

/// TCP 直连工厂
#[derive(Debug, Clone, Default)]
pub struct TcpTransportFactory {
    config: TcpTransportConfig,
}

impl TcpTransportFactory {
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }
}

impl TransportFactory for TcpTransportFactory {
    fn create(&self) -> Box<dyn DirectTransport> {
        Box::new(TcpDirectTransport::new(self.config.clone()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Role {
    Offering,
    Answering,
}

/// TCP 直连通道
pub struct TcpDirectTransport {
    config: TcpTransportConfig,
    session: Option<Uuid>,
    role: Option<Role>,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: Option<mpsc::Receiver<TransportEvent>>,
    frames_tx: mpsc::Sender<Frame>,
    frames_rx: Option<mpsc::Receiver<Frame>>,
    candidate_tx: Option<mpsc::UnboundedSender<SocketAddr>>,
}

impl TcpDirectTransport {
    pub fn new(config: TcpTransportConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);
        // 容量 1：一次只有一帧在途，读-发循环天然背压
        let (frames_tx, frames_rx) = mpsc::channel(1);
        Self {
            config,
            session: None,
            role: None,
            events_tx,
            events_rx: Some(events_rx),
            frames_tx,
            frames_rx: Some(frames_rx),
            candidate_tx: None,
        }
    }

    fn candidate_addrs(&self, port: u16) -> Vec<SocketAddr> {
        if let Some(advertise) = &self.config.advertise {
            return advertise.clone();
        }
        let mut addrs = vec![SocketAddr::new(addr::lan_ip(), port)];
        let loopback: SocketAddr = ([127, 0, 0, 1], port).into();
        if !addrs.contains(&loopback) {
            addrs.push(loopback);
        }
        addrs
    }
}

fn parse_description(value: &Value) -> Result<Uuid, TransportError> {
    if value.get("kind").and_then(|v| v.as_str()) != Some("tcp") {
        return Err(TransportError::BadDescription(
            "not a tcp description".to_string(),
        ));
    }
    value
        .get("session")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| TransportError::BadDescription("missing session id".to_string()))
}

#[async_trait]
impl DirectTransport for TcpDirectTransport {
    async fn create_offer(&mut self) -> Result<Value, TransportError> {
        if self.role.is_some() {
            return Err(TransportError::InvalidState("offer already created"));
        }
        let frames_rx = self
            .frames_rx
            .take()
            .ok_or(TransportError::InvalidState("transport already started"))?;

        let session = Uuid::new_v4();
        self.session = Some(session);
        self.role = Some(Role::Offering);

        let listener = TcpListener::bind("0.0.0.0:0").await?;
        let port = listener.local_addr()?.port();
        let candidates = self.candidate_addrs(port);

        let events = self.events_tx.clone();
        let accept_timeout = self.config.accept_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(accept_timeout, listener.accept()).await {
                Ok(Ok((mut stream, remote))) => {
                    let mut preamble = [0u8; 16];
                    if stream.read_exact(&mut preamble).await.is_err()
                        || preamble != *session.as_bytes()
                    {
                        let _ = events
                            .send(TransportEvent::Failed(
                                "direct channel handshake mismatch".to_string(),
                            ))
                            .await;
                        return;
                    }
                    debug!("direct channel accepted from {}", remote);
                    let _ = events.send(TransportEvent::Connected { relayed: false }).await;
                    run_connection(stream, frames_rx, events).await;
                }
                Ok(Err(e)) => {
                    let _ = events
                        .send(TransportEvent::Failed(format!("accept error: {}", e)))
                        .await;
                }
                Err(_) => {
                    let _ = events
                        .send(TransportEvent::Failed("accept timeout".to_string()))
                        .await;
                }
            }
        });

        for candidate in candidates {
            let _ = self
                .events_tx
                .send(TransportEvent::Candidate(
                    json!({ "addr": candidate.to_string() }),
                ))
                .await;
        }

        Ok(json!({ "kind": "tcp", "session": session.to_string() }))
    }

    async fn accept_offer(&mut self, offer: &Value) -> Result<Value, TransportError> {
        if self.role.is_some() {
            return Err(TransportError::InvalidState("offer already applied"));
        }
        let frames_rx = self
            .frames_rx
            .take()
            .ok_or(TransportError::InvalidState("transport already started"))?;

        let session = parse_description(offer)?;
        self.session = Some(session);
        self.role = Some(Role::Answering);

        let (candidate_tx, mut candidate_rx) = mpsc::unbounded_channel::<SocketAddr>();
        self.candidate_tx = Some(candidate_tx);

        let events = self.events_tx.clone();
        let connect_timeout = self.config.connect_timeout;
        tokio::spawn(async move {
            let deadline = Instant::now() + connect_timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    let _ = events
                        .send(TransportEvent::Failed(
                            "connect timeout, no usable candidate".to_string(),
                        ))
                        .await;
                    return;
                }
                let candidate = match tokio::time::timeout(remaining, candidate_rx.recv()).await {
                    Ok(Some(addr)) => addr,
                    // 传输被上层丢弃，静默退出
                    Ok(None) => return,
                    Err(_) => {
                        let _ = events
                            .send(TransportEvent::Failed(
                                "connect timeout, no usable candidate".to_string(),
                            ))
                            .await;
                        return;
                    }
                };
                match tokio::time::timeout(CANDIDATE_DIAL_TIMEOUT, TcpStream::connect(candidate))
                    .await
                {
                    Ok(Ok(mut stream)) => {
                        if stream.write_all(session.as_bytes()).await.is_err() {
                            continue;
                        }
                        debug!("direct channel connected to {}", candidate);
                        let _ = events.send(TransportEvent::Connected { relayed: false }).await;
                        run_connection(stream, frames_rx, events).await;
                        return;
                    }
                    Ok(Err(e)) => {
                        debug!("candidate {} unreachable: {}", candidate, e);
                    }
                    Err(_) => {
                        debug!("candidate {} dial timed out", candidate);
                    }
                }
            }
        });

        Ok(json!({ "kind": "tcp", "session": session.to_string() }))
    }

    async fn apply_answer(&mut self, answer: &Value) -> Result<(), TransportError> {
        if self.role != Some(Role::Offering) {
            return Err(TransportError::InvalidState("not the offering side"));
        }
        let session = parse_description(answer)?;
        if self.session != Some(session) {
            return Err(TransportError::BadDescription(
                "answer for a different session".to_string(),
            ));
        }
        // 监听任务在 create_offer 时就已武装，这里只校验会话号
        Ok(())
    }

    async fn add_candidate(&mut self, candidate: &Value) -> Result<(), TransportError> {
        match self.role {
            Some(Role::Answering) => {
                let addr = candidate
                    .get("addr")
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse::<SocketAddr>().ok())
                    .ok_or_else(|| {
                        TransportError::BadDescription("malformed candidate".to_string())
                    })?;
                if let Some(tx) = &self.candidate_tx {
                    let _ = tx.send(addr);
                }
                Ok(())
            }
            // 主动方只监听不拨号，对端候选无用
            Some(Role::Offering) => Ok(()),
            None => Err(TransportError::InvalidState("no description applied")),
        }
    }

    fn frame_sink(&self) -> mpsc::Sender<Frame> {
        self.frames_tx.clone()
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events_rx.take()
    }
}

/// 连接建立后的读写循环
async fn run_connection(
    stream: TcpStream,
    mut frames_rx: mpsc::Receiver<Frame>,
    events: mpsc::Sender<TransportEvent>,
) {
    let (mut reader, mut writer) = stream.into_split();

    let write_task = tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                warn!("direct channel write error: {}", e);
                break;
            }
        }
    });

    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => {
                if events.send(TransportEvent::Frame(frame)).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                let _ = events.send(TransportEvent::Closed).await;
                break;
            }
            Err(e) => {
                let _ = events
                    .send(TransportEvent::Failed(format!("connection error: {}", e)))
                    .await;
                break;
            }
        }
    }
    write_task.abort();
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &Frame) -> std::io::Result<()> {
    let (kind, payload) = match frame {
        Frame::Control(control) => (
            FRAME_CONTROL,
            serde_json::to_vec(control)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?,
        ),
        Frame::Binary(bytes) => (FRAME_BINARY, bytes.clone()),
    };
    writer.write_u8(kind).await?;
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    Ok(())
}

async fn read_frame(reader: &mut OwnedReadHalf) -> std::io::Result<Option<Frame>> {
    let mut kind = [0u8; 1];
    match reader.read_exact(&mut kind).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes", len),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    match kind[0] {
        FRAME_CONTROL => {
            let control: ControlFrame = serde_json::from_slice(&payload)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            Ok(Some(Frame::Control(control)))
        }
        FRAME_BINARY => Ok(Some(Frame::Binary(payload))),
        other => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unknown frame kind: {}", other),
        )),
    }
}
