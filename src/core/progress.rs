//! 进度事件、采样与上报
//!
//! 事件按固定最小间隔发出，不会每个块都上报。速度取两次采样之间的瞬时值，
//! 总大小未知时不报百分比和剩余时间。

use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;

use super::item::{ItemId, ItemStatus};
use crate::utils::format::{format_duration, format_speed};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub status: ItemStatus,
    pub percent: Option<f64>,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub throughput_bps: Option<f64>,
    pub throughput_formatted: Option<String>,
    pub eta: Option<Duration>,
    pub eta_formatted: Option<String>,
    pub error: Option<String>,
}

impl ProgressEvent {
    /// 只有状态和字节数的事件，用于状态切换
    pub fn status_only(status: ItemStatus, downloaded_bytes: u64, total_bytes: Option<u64>) -> Self {
        Self {
            status,
            percent: percent_of(downloaded_bytes, total_bytes),
            downloaded_bytes,
            total_bytes,
            throughput_bps: None,
            throughput_formatted: None,
            eta: None,
            eta_formatted: None,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

fn percent_of(downloaded: u64, total: Option<u64>) -> Option<f64> {
    match total {
        Some(total) if total > 0 => Some((downloaded as f64 / total as f64 * 100.0).min(100.0)),
        _ => None,
    }
}

/// 进度接收方，会被多个 worker 的事件调用；下载池在单个分发任务里串行调用
pub trait ProgressReporter: Send + Sync {
    fn on_progress(&self, id: ItemId, event: &ProgressEvent);
}

pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn on_progress(&self, _id: ItemId, _event: &ProgressEvent) {}
}

/// 只写日志
pub struct LogReporter;

impl ProgressReporter for LogReporter {
    fn on_progress(&self, id: ItemId, event: &ProgressEvent) {
        match (event.percent, &event.throughput_formatted) {
            (Some(p), Some(speed)) => log::info!("[{}] {} {:.1}% {}", id, event.status, p, speed),
            _ => log::info!("[{}] {} {} 字节", id, event.status, event.downloaded_bytes),
        }
    }
}

/// 把事件转发到通道，嵌入方自行消费
pub struct ChannelReporter {
    tx: UnboundedSender<(ItemId, ProgressEvent)>,
}

impl ChannelReporter {
    pub fn new(tx: UnboundedSender<(ItemId, ProgressEvent)>) -> Self {
        Self { tx }
    }
}

impl ProgressReporter for ChannelReporter {
    fn on_progress(&self, id: ItemId, event: &ProgressEvent) {
        let _ = self.tx.send((id, event.clone()));
    }
}

/// 单个下载项的进度采样器
pub struct ProgressSampler {
    interval: Duration,
    last_sample: Instant,
    last_bytes: u64,
    last_emitted_bytes: Option<u64>,
}

impl ProgressSampler {
    pub fn new(interval: Duration, start_bytes: u64) -> Self {
        Self {
            interval,
            last_sample: Instant::now(),
            last_bytes: start_bytes,
            last_emitted_bytes: None,
        }
    }

    /// 到了采样间隔则返回一个事件
    pub fn sample(&mut self, downloaded: u64, total: Option<u64>) -> Option<ProgressEvent> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_sample);
        if elapsed < self.interval || self.last_emitted_bytes == Some(downloaded) {
            return None;
        }
        Some(self.build(now, elapsed, downloaded, total))
    }

    /// 不受间隔限制，用于完成时的最后一次上报
    pub fn force(&mut self, downloaded: u64, total: Option<u64>) -> ProgressEvent {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_sample);
        self.build(now, elapsed, downloaded, total)
    }

    /// 暂停期间不计入下一次速度采样
    pub fn reset_clock(&mut self, downloaded: u64) {
        self.last_sample = Instant::now();
        self.last_bytes = downloaded;
    }

    fn build(&mut self, now: Instant, elapsed: Duration, downloaded: u64, total: Option<u64>) -> ProgressEvent {
        let secs = elapsed.as_secs_f64();
        let delta = downloaded.saturating_sub(self.last_bytes);
        let throughput = if secs > 0.0 { Some(delta as f64 / secs) } else { None };
        self.last_sample = now;
        self.last_bytes = downloaded;
        self.last_emitted_bytes = Some(downloaded);

        let eta = match (total, throughput) {
            (Some(total), Some(speed)) if total > 0 && speed > 0.0 => {
                let remaining = total.saturating_sub(downloaded) as f64;
                Some(Duration::from_secs_f64(remaining / speed))
            }
            _ => None,
        };

        ProgressEvent {
            status: ItemStatus::Downloading,
            percent: percent_of(downloaded, total),
            downloaded_bytes: downloaded,
            total_bytes: total,
            throughput_bps: throughput,
            throughput_formatted: throughput.map(format_speed),
            eta,
            eta_formatted: eta.map(format_duration),
            error: None,
        }
    }
}
