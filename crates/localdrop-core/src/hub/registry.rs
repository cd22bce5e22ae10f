//! 在线节点注册表
//!
//! 信令中心唯一的共享可变状态。注册和移除是仅有的两个
//! 变更操作；路由查找可能与断开竞争，未命中时消息被丢弃。

use crate::protocol::PeerInfo;
use log::debug;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// 指向某个在线节点写出任务的句柄
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub info: PeerInfo,
    tx: mpsc::UnboundedSender<String>,
}

impl PeerHandle {
    pub fn new(info: PeerInfo, tx: mpsc::UnboundedSender<String>) -> Self {
        Self { info, tx }
    }

    /// 投递一条出站消息，连接已关闭时返回 false
    pub fn send(&self, text: String) -> bool {
        self.tx.send(text).is_ok()
    }
}

/// 节点注册表
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<String, PeerHandle>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册新节点
    pub fn register(&self, handle: PeerHandle) {
        let mut peers = self.peers.lock().expect("registry lock");
        peers.insert(handle.info.id.clone(), handle);
    }

    /// 移除节点，返回其身份 (若存在)
    pub fn remove(&self, id: &str) -> Option<PeerInfo> {
        let mut peers = self.peers.lock().expect("registry lock");
        peers.remove(id).map(|h| h.info)
    }

    /// 当前在线节点列表
    pub fn snapshot(&self) -> Vec<PeerInfo> {
        let peers = self.peers.lock().expect("registry lock");
        peers.values().map(|h| h.info.clone()).collect()
    }

    /// 在线节点数量
    pub fn len(&self) -> usize {
        self.peers.lock().expect("registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 向指定节点投递消息，目标不在线时返回 false
    pub fn send_to(&self, id: &str, text: String) -> bool {
        let peers = self.peers.lock().expect("registry lock");
        match peers.get(id) {
            Some(handle) => handle.send(text),
            None => {
                debug!("routing miss: peer {} not registered", id);
                false
            }
        }
    }

    /// 向除 `except` 外的所有节点广播
    pub fn broadcast_except(&self, except: &str, text: &str) {
        let peers = self.peers.lock().expect("registry lock");
        for (id, handle) in peers.iter() {
            if id != except {
                handle.send(text.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: &str) -> (PeerHandle, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let info = PeerInfo {
            id: id.to_string(),
            name: format!("Peer {}", id),
        };
        (PeerHandle::new(info, tx), rx)
    }

    #[test]
    fn test_register_snapshot_remove() {
        let registry = PeerRegistry::new();
        let (a, _rx_a) = handle("a");
        let (b, _rx_b) = handle("b");
        registry.register(a);
        registry.register(b);
        assert_eq!(registry.len(), 2);

        let mut ids: Vec<String> = registry.snapshot().into_iter().map(|p| p.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);

        let left = registry.remove("a").unwrap();
        assert_eq!(left.id, "a");
        assert_eq!(registry.len(), 1);
        assert!(registry.remove("a").is_none());
    }

    #[test]
    fn test_routing_miss() {
        let registry = PeerRegistry::new();
        assert!(!registry.send_to("ghost", "hello".to_string()));
    }

    #[test]
    fn test_broadcast_skips_sender() {
        let registry = PeerRegistry::new();
        let (a, mut rx_a) = handle("a");
        let (b, mut rx_b) = handle("b");
        registry.register(a);
        registry.register(b);

        registry.broadcast_except("a", "joined");
        assert_eq!(rx_b.try_recv().unwrap(), "joined");
        assert!(rx_a.try_recv().is_err());
    }
}
