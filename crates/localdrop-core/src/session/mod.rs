//! 连接协商
//!
//! 每对节点一个会话，角色分主动方 (offering) 和应答方
//! (answering)。状态机只负责 offer/answer/candidate 的交换次序，
//! 描述内容由具体传输解释。
//!
//! 早到的候选 (远端描述尚未应用时收到的) 会被缓存，待描述应用
//! 后统一冲刷，不会丢弃。

pub mod tcp;
pub mod transport;

pub use tcp::{TcpDirectTransport, TcpTransportConfig, TcpTransportFactory};
pub use transport::{
    ControlFrame, DirectTransport, Frame, TransportError, TransportEvent, TransportFactory,
};

use log::debug;
use serde_json::Value;
use tokio::sync::mpsc;

/// 会话角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offering,
    Answering,
}

/// 协商状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// 描述已交换，等待通道建立
    Negotiating,
    Connected,
    Failed,
}

/// 单个会话的协商状态机
pub struct Negotiator {
    role: Role,
    state: NegotiationState,
    /// 远端描述是否已应用；决定候选是立即下发还是先缓存
    remote_described: bool,
    pending_candidates: Vec<Value>,
    transport: Box<dyn DirectTransport>,
}

impl Negotiator {
    /// 主动方：创建会话并产生 offer (经信令中心发给对端)
    pub async fn offer(
        mut transport: Box<dyn DirectTransport>,
    ) -> Result<(Self, Value), TransportError> {
        let offer = transport.create_offer().await?;
        Ok((
            Self {
                role: Role::Offering,
                state: NegotiationState::Negotiating,
                remote_described: false,
                pending_candidates: Vec::new(),
                transport,
            },
            offer,
        ))
    }

    /// 应答方：应用收到的 offer 并产生 answer
    pub async fn answer(
        mut transport: Box<dyn DirectTransport>,
        offer: &Value,
    ) -> Result<(Self, Value), TransportError> {
        let answer = transport.accept_offer(offer).await?;
        Ok((
            Self {
                role: Role::Answering,
                state: NegotiationState::Negotiating,
                remote_described: true,
                pending_candidates: Vec::new(),
                transport,
            },
            answer,
        ))
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// 主动方收到 answer：应用远端描述并冲刷缓存的候选
    pub async fn handle_answer(&mut self, answer: &Value) -> Result<(), TransportError> {
        if self.role != Role::Offering {
            return Err(TransportError::InvalidState("answer on answering side"));
        }
        if self.remote_described {
            return Err(TransportError::InvalidState("answer already applied"));
        }
        self.transport.apply_answer(answer).await?;
        self.remote_described = true;

        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            debug!("flushing {} buffered candidates", pending.len());
        }
        for candidate in pending {
            self.transport.add_candidate(&candidate).await?;
        }
        Ok(())
    }

    /// 收到对端候选：远端描述未就绪时先入队
    pub async fn handle_candidate(&mut self, candidate: &Value) -> Result<(), TransportError> {
        if self.remote_described {
            self.transport.add_candidate(candidate).await
        } else {
            self.pending_candidates.push(candidate.clone());
            Ok(())
        }
    }

    pub fn mark_connected(&mut self) {
        self.state = NegotiationState::Connected;
    }

    pub fn mark_failed(&mut self) {
        self.state = NegotiationState::Failed;
    }

    /// 通道出站帧入口
    pub fn frame_sink(&self) -> mpsc::Sender<Frame> {
        self.transport.frame_sink()
    }

    /// 取走传输层事件流 (只能取一次)
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.transport.take_events()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    /// 记录调用顺序的假传输
    struct MockTransport {
        applied_candidates: Arc<Mutex<Vec<Value>>>,
        answered: Arc<Mutex<bool>>,
        events_rx: Option<mpsc::Receiver<TransportEvent>>,
        frames_tx: mpsc::Sender<Frame>,
    }

    impl MockTransport {
        fn new() -> (Self, Arc<Mutex<Vec<Value>>>, Arc<Mutex<bool>>) {
            let candidates = Arc::new(Mutex::new(Vec::new()));
            let answered = Arc::new(Mutex::new(false));
            let (frames_tx, _frames_rx) = mpsc::channel(1);
            let (_events_tx, events_rx) = mpsc::channel(1);
            (
                Self {
                    applied_candidates: candidates.clone(),
                    answered: answered.clone(),
                    events_rx: Some(events_rx),
                    frames_tx,
                },
                candidates,
                answered,
            )
        }
    }

    #[async_trait]
    impl DirectTransport for MockTransport {
        async fn create_offer(&mut self) -> Result<Value, TransportError> {
            Ok(json!({"mock": "offer"}))
        }

        async fn accept_offer(&mut self, _offer: &Value) -> Result<Value, TransportError> {
            Ok(json!({"mock": "answer"}))
        }

        async fn apply_answer(&mut self, _answer: &Value) -> Result<(), TransportError> {
            *self.answered.lock().unwrap() = true;
            Ok(())
        }

        async fn add_candidate(&mut self, candidate: &Value) -> Result<(), TransportError> {
            assert!(
                *self.answered.lock().unwrap(),
                "candidate applied before remote description"
            );
            self.applied_candidates.lock().unwrap().push(candidate.clone());
            Ok(())
        }

        fn frame_sink(&self) -> mpsc::Sender<Frame> {
            self.frames_tx.clone()
        }

        fn take_events(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
            self.events_rx.take()
        }
    }

    #[tokio::test]
    async fn test_early_candidates_buffered_then_flushed() {
        let (mock, applied, _answered) = MockTransport::new();
        let (mut negotiator, offer) = Negotiator::offer(Box::new(mock)).await.unwrap();
        assert_eq!(offer["mock"], "offer");

        // answer 到来之前收到两个候选：必须缓存，不能下发
        negotiator
            .handle_candidate(&json!({"addr": "10.0.0.1:40000"}))
            .await
            .unwrap();
        negotiator
            .handle_candidate(&json!({"addr": "10.0.0.2:40000"}))
            .await
            .unwrap();
        assert!(applied.lock().unwrap().is_empty());

        // 应用 answer 后按序冲刷
        negotiator
            .handle_answer(&json!({"mock": "answer"}))
            .await
            .unwrap();
        let flushed = applied.lock().unwrap().clone();
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0]["addr"], "10.0.0.1:40000");
        assert_eq!(flushed[1]["addr"], "10.0.0.2:40000");

        // 之后的候选立即下发
        negotiator
            .handle_candidate(&json!({"addr": "10.0.0.3:40000"}))
            .await
            .unwrap();
        assert_eq!(applied.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_answer_side_applies_candidates_directly() {
        let (mock, applied, answered) = MockTransport::new();
        *answered.lock().unwrap() = true; // accept_offer 即视为远端描述已应用
        let (mut negotiator, answer) =
            Negotiator::answer(Box::new(mock), &json!({"mock": "offer"}))
                .await
                .unwrap();
        assert_eq!(answer["mock"], "answer");
        assert_eq!(negotiator.role(), Role::Answering);

        negotiator
            .handle_candidate(&json!({"addr": "10.0.0.1:1"}))
            .await
            .unwrap();
        assert_eq!(applied.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_out_of_order_answer_rejected() {
        let (mock, _, answered) = MockTransport::new();
        *answered.lock().unwrap() = true;
        let (mut negotiator, _) = Negotiator::answer(Box::new(mock), &json!({"mock": "offer"}))
            .await
            .unwrap();
        // 应答方不应收到 answer
        assert!(negotiator.handle_answer(&json!({})).await.is_err());

        let (mock, _, _) = MockTransport::new();
        let (mut negotiator, _) = Negotiator::offer(Box::new(mock)).await.unwrap();
        negotiator.handle_answer(&json!({})).await.unwrap();
        // 重复的 answer 被拒绝
        assert!(negotiator.handle_answer(&json!({})).await.is_err());
    }
}
