use chrono::{DateTime, Local};
use serde::{Serialize, Deserialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use super::error::FailureReason;

/// 下载项ID，由调用方在入队时生成
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemId(Uuid);

impl ItemId {
    pub fn new() -> Self {
        ItemId(Uuid::new_v4())
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 只显示前8位，日志里够用
        let s = self.0.to_string();
        f.write_str(&s[..8])
    }
}

/// 解析器返回的直链信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedInfo {
    pub download_url: String,
    pub filename: String,
    pub size_bytes: Option<u64>,
}

/// 下载项状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemStatus {
    Pending,
    Resolving,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Failed | ItemStatus::Cancelled)
    }

    fn rank(self) -> u8 {
        match self {
            ItemStatus::Pending => 0,
            ItemStatus::Resolving => 1,
            ItemStatus::Downloading | ItemStatus::Paused => 2,
            ItemStatus::Completed | ItemStatus::Failed | ItemStatus::Cancelled => 3,
        }
    }

    /// 状态只能前进，唯一的回边是 Paused <-> Downloading
    pub fn can_transition_to(self, next: ItemStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (ItemStatus::Downloading, ItemStatus::Paused)
            | (ItemStatus::Paused, ItemStatus::Downloading) => true,
            _ => next.rank() > self.rank(),
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemStatus::Pending => "Pending",
            ItemStatus::Resolving => "Resolving",
            ItemStatus::Downloading => "Downloading",
            ItemStatus::Paused => "Paused",
            ItemStatus::Completed => "Completed",
            ItemStatus::Failed => "Failed",
            ItemStatus::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

const FLAG_RUNNING: u8 = 0;
const FLAG_CANCELLED: u8 = 1;
const FLAG_SETTLED: u8 = 2;

/// 取消标志，调用方随时可以设置，worker 在块边界轮询
///
/// worker 在下载项终止前调用 `settle` 封住标志：之后的 `cancel` 不再生效，
/// 先到的 `cancel` 则让 `settle` 失败，下载项只能以取消结束。
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicU8>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// 返回这次调用是否真正设置了标志
    pub fn cancel(&self) -> bool {
        self.0
            .compare_exchange(FLAG_RUNNING, FLAG_CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst) == FLAG_CANCELLED
    }

    /// 封住标志；已被取消时返回 false
    pub fn settle(&self) -> bool {
        match self
            .0
            .compare_exchange(FLAG_RUNNING, FLAG_SETTLED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => true,
            Err(current) => current == FLAG_SETTLED,
        }
    }
}

/// 一个下载请求
///
/// 入队后归队列所有，被 worker 认领后由该 worker 独占修改，
/// 终止后移交给下载池的完成/失败集合。
#[derive(Debug)]
pub struct DownloadItem {
    pub id: ItemId,
    pub source_url: String,
    pub resolved: Option<ResolvedInfo>,
    pub status: ItemStatus,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
    pub started_at: Option<DateTime<Local>>,
    pub destination: Option<PathBuf>,
    pub error: Option<FailureReason>,
    pub error_message: Option<String>,
    cancel: CancelFlag,
    started: Option<Instant>,
    finished: Option<Instant>,
}

impl DownloadItem {
    pub fn new(source_url: impl Into<String>) -> Self {
        Self::with_id(ItemId::new(), source_url)
    }

    pub fn with_id(id: ItemId, source_url: impl Into<String>) -> Self {
        Self {
            id,
            source_url: source_url.into(),
            resolved: None,
            status: ItemStatus::Pending,
            downloaded_bytes: 0,
            total_bytes: None,
            started_at: None,
            destination: None,
            error: None,
            error_message: None,
            cancel: CancelFlag::new(),
            started: None,
            finished: None,
        }
    }

    /// 已经有直链信息时跳过解析阶段
    pub fn resolved(mut self, info: ResolvedInfo) -> Self {
        self.total_bytes = info.size_bytes;
        self.resolved = Some(info);
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn request_cancel(&self) -> bool {
        self.cancel.cancel()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 非法转换会被忽略并返回 false
    pub fn set_status(&mut self, next: ItemStatus) -> bool {
        if self.status == next {
            return true;
        }
        if !self.status.can_transition_to(next) {
            log::warn!("[{}] 忽略非法状态转换 {} -> {}", self.id, self.status, next);
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.finished = Some(Instant::now());
        }
        true
    }

    pub fn mark_started(&mut self) {
        self.started_at = Some(Local::now());
        self.started = Some(Instant::now());
    }

    /// 从开始流式下载到终止（或现在）经过的秒数
    pub fn elapsed_secs(&self) -> f64 {
        match (self.started, self.finished) {
            (Some(start), Some(end)) => end.saturating_duration_since(start).as_secs_f64(),
            (Some(start), None) => start.elapsed().as_secs_f64(),
            _ => 0.0,
        }
    }

    pub fn filename(&self) -> Option<&str> {
        if let Some(path) = &self.destination {
            return path.file_name().and_then(|n| n.to_str());
        }
        self.resolved.as_ref().map(|r| r.filename.as_str())
    }
}
