//! 节点标识生成
//!
//! 新连接分配一个短 ID 和一个"形容词+动物"的可读名称。

use rand::Rng;
use rand::seq::SliceRandom;

const ADJECTIVES: &[&str] = &[
    "Clever", "Brave", "Wise", "Swift", "Gentle", "Silent", "Witty", "Keen",
];

const NOUNS: &[&str] = &[
    "Fox", "Badger", "Owl", "Eagle", "Lion", "Tiger", "Bear", "Wolf",
];

const ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const ID_LEN: usize = 7;

/// 生成 7 位小写字母数字 ID
pub fn generate_id() -> String {
    let mut rng = rand::thread_rng();
    (0..ID_LEN)
        .map(|_| ID_CHARSET[rng.gen_range(0..ID_CHARSET.len())] as char)
        .collect()
}

/// 生成随机显示名称，例如 "Clever Fox"
pub fn generate_name() -> String {
    let mut rng = rand::thread_rng();
    let adj = ADJECTIVES.choose(&mut rng).unwrap_or(&"Swift");
    let noun = NOUNS.choose(&mut rng).unwrap_or(&"Fox");
    format!("{} {}", adj, noun)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_shape() {
        let id = generate_id();
        assert_eq!(id.len(), ID_LEN);
        assert!(id.bytes().all(|b| ID_CHARSET.contains(&b)));
    }

    #[test]
    fn test_name_shape() {
        let name = generate_name();
        let parts: Vec<&str> = name.split(' ').collect();
        assert_eq!(parts.len(), 2);
        assert!(ADJECTIVES.contains(&parts[0]));
        assert!(NOUNS.contains(&parts[1]));
    }
}
