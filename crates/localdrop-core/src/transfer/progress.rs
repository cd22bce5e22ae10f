//! 滑动窗口吞吐估算
//!
//! 每条传输路径共用同一套估算逻辑：两次采样间隔超过 200ms
//! 才重新计算速度并滚动采样点，否则沿用上一次速度，避免高频
//! 分片事件带来的噪声。字节数本身每次都如实上报。

use crate::protocol::SPEED_SAMPLE_INTERVAL_MS;
use std::time::{Duration, Instant};

/// 单个传输的速度估算器
#[derive(Debug)]
pub struct SpeedEstimator {
    last_size: u64,
    last_time: Instant,
    last_speed: f64,
}

impl SpeedEstimator {
    pub fn new() -> Self {
        Self {
            last_size: 0,
            last_time: Instant::now(),
            last_speed: 0.0,
        }
    }

    /// 上报新的累计字节数，返回当前速度估计 (字节/秒)
    pub fn update(&mut self, size: u64) -> f64 {
        self.update_at(size, Instant::now())
    }

    /// 带显式时间戳的更新，便于测试
    pub fn update_at(&mut self, size: u64, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_time);
        if elapsed > Duration::from_millis(SPEED_SAMPLE_INTERVAL_MS) {
            let delta = size.saturating_sub(self.last_size) as f64;
            self.last_speed = delta / elapsed.as_secs_f64();
            self.last_size = size;
            self.last_time = now;
        }
        self.last_speed
    }

    /// 当前速度估计，不滚动采样点
    pub fn speed(&self) -> f64 {
        self.last_speed
    }
}

impl Default for SpeedEstimator {
    fn default() -> Self {
        Self::new()
    }
}
