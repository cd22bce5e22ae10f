//! 集成测试 - 信令中心与两个客户端的完整互传流程
//!
//! 每个测试起一个真实的信令中心 (随机端口)，两个客户端
//! 走完整的信令、直连或中继路径。

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use localdrop_core::client::{
    AutoAccept, AutoReject, Client, ClientEvent, ClientOptions, Decision, DecisionHandler,
};
use localdrop_core::hub::Hub;
use localdrop_core::protocol::{FileMetadata, PeerInfo, SignalMessage};
use localdrop_core::session::{
    ControlFrame, DirectTransport, Frame, TcpTransportConfig, TcpTransportFactory, TransportError,
    TransportEvent, TransportFactory,
};
use serde_json::Value;
use localdrop_core::transfer::{Direction, TransportKind};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// 起一个信令中心，返回客户端连接用的 URL
async fn start_hub() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hub = Hub::new(addr.to_string());
    tokio::spawn(async move { hub.serve(listener).await });
    format!("ws://{}/ws", addr)
}

/// 等待满足条件的事件，其余事件丢给谓词观察
async fn wait_for<F>(events: &mut mpsc::UnboundedReceiver<ClientEvent>, mut pred: F) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// 写一个内容可校验的测试文件
async fn write_test_file(dir: &tempfile::TempDir, name: &str, size: usize) -> (PathBuf, Vec<u8>) {
    let content: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    let path = dir.path().join(name);
    tokio::fs::write(&path, &content).await.unwrap();
    (path, content)
}

/// 一个专門占着的死端口：先绑再放，短时间内没人会接
async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// 记录被征询次数的接受方
struct CountingAccept {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl DecisionHandler for CountingAccept {
    async fn on_transfer_request(&self, _from: &PeerInfo, _metadata: &FileMetadata) -> Decision {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Decision::Accepted
    }
}

/// 永不应答的接受方，用来触发决策超时
struct NeverAnswers;

#[async_trait]
impl DecisionHandler for NeverAnswers {
    async fn on_transfer_request(&self, _from: &PeerInfo, _metadata: &FileMetadata) -> Decision {
        futures_util::future::pending().await
    }
}

#[tokio::test]
async fn test_hub_membership() {
    let url = start_hub().await;

    let (alice, mut alice_events) =
        Client::connect(&url, ClientOptions::new(Arc::new(AutoReject)))
            .await
            .unwrap();
    assert_eq!(alice.identity().id.len(), 7);
    assert!(alice.identity().name.contains(' '), "name is adjective + noun");
    assert!(alice.peers().await.unwrap().is_empty());

    let (bob, _bob_events) = Client::connect(&url, ClientOptions::new(Arc::new(AutoReject)))
        .await
        .unwrap();

    // alice 看到 bob 上线
    let joined = wait_for(&mut alice_events, |e| {
        matches!(e, ClientEvent::PeerJoined(_))
    })
    .await;
    match joined {
        ClientEvent::PeerJoined(peer) => assert_eq!(peer.id, bob.identity().id),
        _ => unreachable!(),
    }

    // bob 的名单里有 alice
    let bob_peers = bob.peers().await.unwrap();
    assert_eq!(bob_peers.len(), 1);
    assert_eq!(bob_peers[0].id, alice.identity().id);

    // bob 下线，alice 收到通知
    bob.close();
    let bob_id = bob.identity().id.clone();
    wait_for(&mut alice_events, |e| {
        matches!(e, ClientEvent::PeerLeft { peer_id } if *peer_id == bob_id)
    })
    .await;
    assert!(alice.peers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_relay_transfer_end_to_end() {
    let url = start_hub().await;
    let dir = tempfile::tempdir().unwrap();
    let (path, content) = write_test_file(&dir, "report.bin", 500_000).await;

    let (sender, mut sender_events) =
        Client::connect(&url, ClientOptions::new(Arc::new(AutoReject)))
            .await
            .unwrap();
    let (receiver, mut receiver_events) =
        Client::connect(&url, ClientOptions::new(Arc::new(AutoAccept)))
            .await
            .unwrap();
    wait_for(&mut sender_events, |e| {
        matches!(e, ClientEvent::PeerJoined(_))
    })
    .await;

    sender
        .send_file(&receiver.identity().id, &path, TransportKind::Relay)
        .await
        .unwrap();

    // 接收端进度单调递增，最终拿到完整文件
    let mut last_progress = 0u64;
    let received = wait_for(&mut receiver_events, |e| match e {
        ClientEvent::TransferProgress {
            direction: Direction::Incoming,
            bytes,
            ..
        } => {
            assert!(*bytes > last_progress);
            last_progress = *bytes;
            false
        }
        ClientEvent::FileReceived(_) => true,
        _ => false,
    })
    .await;
    match received {
        ClientEvent::FileReceived(file) => {
            assert_eq!(file.metadata.name, "report.bin");
            assert_eq!(file.metadata.size, 500_000);
            assert_eq!(file.from.id, sender.identity().id);
            assert_eq!(file.bytes, content);
        }
        _ => unreachable!(),
    }

    wait_for(&mut sender_events, |e| {
        matches!(e, ClientEvent::TransferSent { .. })
    })
    .await;
}

#[tokio::test]
async fn test_relay_reject() {
    let url = start_hub().await;
    let dir = tempfile::tempdir().unwrap();
    let (path, _) = write_test_file(&dir, "unwanted.bin", 1000).await;

    let (sender, mut sender_events) =
        Client::connect(&url, ClientOptions::new(Arc::new(AutoReject)))
            .await
            .unwrap();
    let (receiver, _receiver_events) =
        Client::connect(&url, ClientOptions::new(Arc::new(AutoReject)))
            .await
            .unwrap();
    wait_for(&mut sender_events, |e| {
        matches!(e, ClientEvent::PeerJoined(_))
    })
    .await;

    sender
        .send_file(&receiver.identity().id, &path, TransportKind::Relay)
        .await
        .unwrap();

    let rejected = wait_for(&mut sender_events, |e| {
        matches!(e, ClientEvent::TransferRejected { .. })
    })
    .await;
    match rejected {
        ClientEvent::TransferRejected { file_name, .. } => assert_eq!(file_name, "unwanted.bin"),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_direct_transfer_end_to_end() {
    let url = start_hub().await;
    let dir = tempfile::tempdir().unwrap();
    // 2 个整分片 + 1 个尾分片
    let (path, content) = write_test_file(&dir, "photo.jpg", 40_000).await;

    let (sender, mut sender_events) =
        Client::connect(&url, ClientOptions::new(Arc::new(AutoReject)))
            .await
            .unwrap();
    let (receiver, mut receiver_events) =
        Client::connect(&url, ClientOptions::new(Arc::new(AutoAccept)))
            .await
            .unwrap();
    wait_for(&mut sender_events, |e| {
        matches!(e, ClientEvent::PeerJoined(_))
    })
    .await;

    sender
        .send_file(&receiver.identity().id, &path, TransportKind::Direct)
        .await
        .unwrap();

    // 两端都看到直连通道建立
    wait_for(&mut sender_events, |e| {
        matches!(e, ClientEvent::ChannelConnected { relayed: false, .. })
    })
    .await;
    wait_for(&mut receiver_events, |e| {
        matches!(e, ClientEvent::ChannelConnected { relayed: false, .. })
    })
    .await;

    let received = wait_for(&mut receiver_events, |e| {
        matches!(e, ClientEvent::FileReceived(_))
    })
    .await;
    match received {
        ClientEvent::FileReceived(file) => {
            assert_eq!(file.metadata.name, "photo.jpg");
            assert_eq!(file.bytes, content);
        }
        _ => unreachable!(),
    }

    wait_for(&mut sender_events, |e| {
        matches!(e, ClientEvent::TransferSent { .. })
    })
    .await;
}

#[tokio::test]
async fn test_direct_reject_stops_sender() {
    let url = start_hub().await;
    let dir = tempfile::tempdir().unwrap();
    // 大到拒绝帧必然在发完之前回到发送端
    let (path, _) = write_test_file(&dir, "large.bin", 30_000_000).await;

    let (sender, mut sender_events) =
        Client::connect(&url, ClientOptions::new(Arc::new(AutoReject)))
            .await
            .unwrap();
    let (receiver, _receiver_events) =
        Client::connect(&url, ClientOptions::new(Arc::new(AutoReject)))
            .await
            .unwrap();
    wait_for(&mut sender_events, |e| {
        matches!(e, ClientEvent::PeerJoined(_))
    })
    .await;

    sender
        .send_file(&receiver.identity().id, &path, TransportKind::Direct)
        .await
        .unwrap();

    // 对端在通道内回拒绝帧，发送端终止
    let rejected = wait_for(&mut sender_events, |e| {
        matches!(e, ClientEvent::TransferRejected { .. })
    })
    .await;
    match rejected {
        ClientEvent::TransferRejected { file_name, .. } => assert_eq!(file_name, "large.bin"),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_direct_failure_fails_over_to_relay() {
    let url = start_hub().await;
    let dir = tempfile::tempdir().unwrap();
    let (path, content) = write_test_file(&dir, "fallback.bin", 300_000).await;

    // 发送端只通告一个死端口，直连必然失败
    let broken_transport = Arc::new(TcpTransportFactory::new(TcpTransportConfig {
        connect_timeout: Duration::from_millis(500),
        accept_timeout: Duration::from_millis(500),
        advertise: Some(vec![dead_addr().await]),
    }));
    let (sender, mut sender_events) = Client::connect(
        &url,
        ClientOptions::new(Arc::new(AutoReject)).with_transport(broken_transport),
    )
    .await
    .unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let (receiver, mut receiver_events) = Client::connect(
        &url,
        ClientOptions::new(Arc::new(CountingAccept {
            calls: calls.clone(),
        })),
    )
    .await
    .unwrap();
    wait_for(&mut sender_events, |e| {
        matches!(e, ClientEvent::PeerJoined(_))
    })
    .await;

    sender
        .send_file(&receiver.identity().id, &path, TransportKind::Direct)
        .await
        .unwrap();

    // 直连失败后自动切中继，恰好一次
    wait_for(&mut sender_events, |e| {
        matches!(e, ClientEvent::FailoverStarted { .. })
    })
    .await;

    let received = wait_for(&mut receiver_events, |e| {
        matches!(e, ClientEvent::FileReceived(_))
    })
    .await;
    match received {
        ClientEvent::FileReceived(file) => {
            // 元数据和内容与直连时完全一致
            assert_eq!(file.metadata.name, "fallback.bin");
            assert_eq!(file.metadata.size, 300_000);
            assert_eq!(file.bytes, content);
        }
        _ => unreachable!(),
    }
    wait_for(&mut sender_events, |e| {
        matches!(e, ClientEvent::TransferSent { .. })
    })
    .await;

    // 中继请求只发过一次
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_decision_timeout_rejects() {
    let url = start_hub().await;
    let dir = tempfile::tempdir().unwrap();
    let (path, _) = write_test_file(&dir, "slow.bin", 1000).await;

    let (sender, mut sender_events) =
        Client::connect(&url, ClientOptions::new(Arc::new(AutoReject)))
            .await
            .unwrap();
    let (receiver, _receiver_events) = Client::connect(
        &url,
        ClientOptions::new(Arc::new(NeverAnswers)).with_decision_timeout(Duration::from_millis(200)),
    )
    .await
    .unwrap();
    wait_for(&mut sender_events, |e| {
        matches!(e, ClientEvent::PeerJoined(_))
    })
    .await;

    sender
        .send_file(&receiver.identity().id, &path, TransportKind::Relay)
        .await
        .unwrap();

    // 没人应答，超时按拒绝处理
    wait_for(&mut sender_events, |e| {
        matches!(e, ClientEvent::TransferRejected { .. })
    })
    .await;
}

#[tokio::test]
async fn test_one_transfer_per_peer() {
    let url = start_hub().await;
    let dir = tempfile::tempdir().unwrap();
    let (path, _) = write_test_file(&dir, "first.bin", 1000).await;

    let (sender, mut sender_events) =
        Client::connect(&url, ClientOptions::new(Arc::new(AutoReject)))
            .await
            .unwrap();
    let (receiver, _receiver_events) = Client::connect(
        &url,
        ClientOptions::new(Arc::new(NeverAnswers)).with_decision_timeout(Duration::from_secs(30)),
    )
    .await
    .unwrap();
    wait_for(&mut sender_events, |e| {
        matches!(e, ClientEvent::PeerJoined(_))
    })
    .await;

    sender
        .send_file(&receiver.identity().id, &path, TransportKind::Relay)
        .await
        .unwrap();
    // 第一笔还挂着，第二笔直接报错
    assert!(
        sender
            .send_file(&receiver.identity().id, &path, TransportKind::Relay)
            .await
            .is_err()
    );

    // 不在线的对端同样报错
    assert!(
        sender
            .send_file("no-such-peer", &path, TransportKind::Relay)
            .await
            .is_err()
    );
}

/// 事件全按脚本走的直连通道：连上、送元数据、送一片、然后断
struct ScriptedDropTransport {
    sink: mpsc::Sender<Frame>,
    _sink_rx: mpsc::Receiver<Frame>,
    events: Option<mpsc::Receiver<TransportEvent>>,
}

struct ScriptedDropFactory;

impl TransportFactory for ScriptedDropFactory {
    fn create(&self) -> Box<dyn DirectTransport> {
        let (frame_tx, frame_rx) = mpsc::channel(1);
        let (event_tx, event_rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let _ = event_tx.send(TransportEvent::Connected { relayed: false }).await;
            let meta = FileMetadata {
                name: "half.bin".to_string(),
                size: 1000,
                mime_type: "application/octet-stream".to_string(),
            };
            let _ = event_tx
                .send(TransportEvent::Frame(Frame::Control(ControlFrame::Meta(meta))))
                .await;
            let _ = event_tx
                .send(TransportEvent::Frame(Frame::Binary(vec![7u8; 100])))
                .await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = event_tx
                .send(TransportEvent::Failed("connection reset".to_string()))
                .await;
        });
        Box::new(ScriptedDropTransport {
            sink: frame_tx,
            _sink_rx: frame_rx,
            events: Some(event_rx),
        })
    }
}

#[async_trait]
impl DirectTransport for ScriptedDropTransport {
    async fn create_offer(&mut self) -> Result<Value, TransportError> {
        Ok(serde_json::json!({}))
    }

    async fn accept_offer(&mut self, _offer: &Value) -> Result<Value, TransportError> {
        Ok(serde_json::json!({}))
    }

    async fn apply_answer(&mut self, _answer: &Value) -> Result<(), TransportError> {
        Ok(())
    }

    async fn add_candidate(&mut self, _candidate: &Value) -> Result<(), TransportError> {
        Ok(())
    }

    fn frame_sink(&self) -> mpsc::Sender<Frame> {
        self.sink.clone()
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events.take()
    }
}

#[tokio::test]
async fn test_direct_channel_drop_fails_incoming_transfer() {
    let url = start_hub().await;

    let (receiver, mut receiver_events) = Client::connect(
        &url,
        ClientOptions::new(Arc::new(AutoAccept)).with_transport(Arc::new(ScriptedDropFactory)),
    )
    .await
    .unwrap();

    // 裸 WebSocket 假扮发送端，推一个 offer 触发应答方会话
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let welcome = ws.next().await.unwrap().unwrap();
    let parsed = SignalMessage::parse(welcome.to_text().unwrap()).unwrap();
    let SignalMessage::Welcome { all_users, .. } = parsed else {
        panic!("expected welcome");
    };
    assert!(all_users.iter().any(|p| p.id == receiver.identity().id));
    let offer = SignalMessage::Offer {
        to: Some(receiver.identity().id.clone()),
        from: None,
        offer: serde_json::json!({}),
    };
    ws.send(tokio_tungstenite::tungstenite::Message::Text(offer.to_json()))
        .await
        .unwrap();

    wait_for(&mut receiver_events, |e| {
        matches!(e, ClientEvent::ChannelConnected { relayed: false, .. })
    })
    .await;

    // 通道半途断开：接收中的传输判失败，而不是只报通道错误
    let failed = wait_for(&mut receiver_events, |e| {
        matches!(
            e,
            ClientEvent::TransferFailed { .. } | ClientEvent::FileReceived(_)
        )
    })
    .await;
    match failed {
        ClientEvent::TransferFailed { file_name, reason, .. } => {
            assert_eq!(file_name, "half.bin");
            assert!(reason.contains("connection reset"));
        }
        other => panic!("expected failed transfer, got {:?}", other),
    }
}
