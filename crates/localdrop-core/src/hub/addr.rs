//! 局域网地址探测
//!
//! `welcome` 消息携带信令中心的网络地址，供扫码等带外发现使用。
//! 容器环境可通过环境变量 `LOCALDROP_HOST_IP` 覆盖探测结果。

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// 覆盖探测结果的环境变量
pub const HOST_IP_ENV: &str = "LOCALDROP_HOST_IP";

/// 探测本机的局域网 IP
///
/// 通过向外连一个 UDP socket 读取内核选择的源地址，
/// 不会真正发包。探测失败时回退到回环地址。
pub fn lan_ip() -> IpAddr {
    if let Ok(value) = std::env::var(HOST_IP_ENV)
        && let Ok(ip) = value.parse::<IpAddr>()
    {
        return ip;
    }

    probe_lan_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn probe_lan_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("10.255.255.255:1").ok()?;
    let addr = socket.local_addr().ok()?;
    if addr.ip().is_unspecified() {
        None
    } else {
        Some(addr.ip())
    }
}

/// 信令中心的对外地址字符串，例如 "192.168.1.10:3000"
pub fn server_address(port: u16) -> String {
    format!("{}:{}", lan_ip(), port)
}
