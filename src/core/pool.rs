//! 下载池：固定数量的 worker 从同一个队列取任务
//!
//! worker 只通过事件通道和协调者通信。唯一的分发任务负责调用进度上报方和历史记录，
//! 并把终止的下载项移入完成/失败/取消集合，所以上报方不会被并发调用。

use reqwest::Client;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::error::{DownloadError, DownloadResult, FailureReason};
use super::history::{HistoryRecord, HistorySink};
use super::item::{DownloadItem, ItemId, ItemStatus};
use super::progress::{ProgressEvent, ProgressReporter};
use super::queue::{DownloadQueue, RemoveOutcome};
use super::resolver::Resolver;
use super::worker::{run_worker, PoolEvent, WorkerContext};
use crate::utils::files::filename_from_url;

pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 10;
/// `wait_idle` 的兜底复查间隔
const IDLE_RECHECK: Duration = Duration::from_millis(200);

/// ================== 下载池配置 ==================
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub download_dir: PathBuf,
    pub max_concurrent: usize,
    /// 连接超时和单次读取超时
    pub timeout: Duration,
    /// 下载池本身不重试，留给调用方使用
    pub retry_attempts: u32,
    pub chunk_size: usize,
    pub progress_interval: Duration,
    pub user_agent: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            max_concurrent: 2,
            timeout: Duration::from_secs(120),
            retry_attempts: 2,
            chunk_size: 64 * 1024,
            progress_interval: Duration::from_millis(500),
            user_agent: format!("sharedown/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl PoolConfig {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            ..Default::default()
        }
    }
}

/// ================== 状态快照 ==================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub queued: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub running: bool,
    pub paused: bool,
}

/// 终止下载项的只读快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinishedItem {
    pub id: ItemId,
    pub source_url: String,
    pub filename: Option<String>,
    pub destination: Option<PathBuf>,
    pub status: ItemStatus,
    pub reason: Option<FailureReason>,
    pub error: Option<String>,
    pub size_bytes: Option<u64>,
    pub downloaded_bytes: u64,
    pub duration_secs: f64,
}

impl From<&DownloadItem> for FinishedItem {
    fn from(item: &DownloadItem) -> Self {
        Self {
            id: item.id,
            source_url: item.source_url.clone(),
            filename: item.filename().map(str::to_string),
            destination: item.destination.clone(),
            status: item.status,
            reason: item.error,
            error: item.error_message.clone(),
            size_bytes: item.total_bytes,
            downloaded_bytes: item.downloaded_bytes,
            duration_secs: item.elapsed_secs(),
        }
    }
}

impl FinishedItem {
    fn history_record(&self) -> HistoryRecord {
        let filename = self
            .filename
            .clone()
            .unwrap_or_else(|| filename_from_url(&self.source_url));
        // 完成的记录以实际写入的字节数为准
        let size = match self.status {
            ItemStatus::Completed => Some(self.downloaded_bytes),
            _ => self.size_bytes,
        };
        let record = HistoryRecord::new(&self.source_url, filename, size, self.status, self.duration_secs);
        match (&self.reason, &self.error) {
            (Some(reason), Some(message)) => record.with_error(format!("{}: {}", reason, message)),
            (Some(reason), None) => record.with_error(reason.to_string()),
            _ => record,
        }
    }
}

#[derive(Default)]
struct FinishedSets {
    completed: Vec<FinishedItem>,
    failed: Vec<FinishedItem>,
    cancelled: Vec<FinishedItem>,
}

/// 分发任务和下载池共享的部分
struct Shared {
    queue: Arc<DownloadQueue>,
    history: Arc<dyn HistorySink>,
    reporter: Arc<dyn ProgressReporter>,
    finished: Mutex<FinishedSets>,
    /// 有下载项终止或被移出队列时通知
    settled: Notify,
}

impl Shared {
    fn finished(&self) -> MutexGuard<'_, FinishedSets> {
        self.finished.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct PoolRuntime {
    workers: Vec<JoinHandle<()>>,
    dispatcher: JoinHandle<()>,
}

/// ================== 下载池 ==================
pub struct DownloadPool {
    config: Arc<PoolConfig>,
    shared: Arc<Shared>,
    resolver: Arc<dyn Resolver>,
    client: Client,
    paused: Arc<AtomicBool>,
    events: UnboundedSender<PoolEvent>,
    receiver: Mutex<Option<UnboundedReceiver<PoolEvent>>>,
    runtime: Mutex<Option<PoolRuntime>>,
}

impl DownloadPool {
    pub fn new(
        config: PoolConfig,
        resolver: Arc<dyn Resolver>,
        history: Arc<dyn HistorySink>,
        reporter: Arc<dyn ProgressReporter>,
    ) -> DownloadResult<Self> {
        let client = Client::builder()
            .connect_timeout(config.timeout)
            .read_timeout(config.timeout)
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| DownloadError::Config(format!("无法创建HTTP客户端: {}", e)))?;
        let (events, receiver) = mpsc::unbounded_channel();

        Ok(Self {
            config: Arc::new(config),
            shared: Arc::new(Shared {
                queue: Arc::new(DownloadQueue::new()),
                history,
                reporter,
                finished: Mutex::new(FinishedSets::default()),
                settled: Notify::new(),
            }),
            resolver,
            client,
            paused: Arc::new(AtomicBool::new(false)),
            events,
            receiver: Mutex::new(Some(receiver)),
            runtime: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn runtime(&self) -> MutexGuard<'_, Option<PoolRuntime>> {
        self.runtime.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 启动 `workers` 个 worker（限制在 1..=10）和分发任务
    pub fn start(&self, workers: usize) -> DownloadResult<()> {
        let mut runtime = self.runtime();
        if runtime.is_some() {
            return Err(DownloadError::AlreadyRunning);
        }
        if self.shared.queue.is_closed() {
            return Err(DownloadError::QueueClosed);
        }
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(DownloadError::AlreadyRunning)?;

        let count = workers.clamp(MIN_WORKERS, MAX_WORKERS);
        if count != workers {
            log::warn!("worker 数量 {} 超出范围，已调整为 {}", workers, count);
        }

        let dispatcher = tokio::spawn(dispatch(receiver, self.shared.clone()));
        let ctx = WorkerContext {
            queue: self.shared.queue.clone(),
            resolver: self.resolver.clone(),
            client: self.client.clone(),
            config: self.config.clone(),
            paused: self.paused.clone(),
            events: self.events.clone(),
        };
        let workers = (0..count)
            .map(|index| tokio::spawn(run_worker(index, ctx.clone())))
            .collect();

        *runtime = Some(PoolRuntime { workers, dispatcher });
        log::info!("下载池已启动: {} 个 worker, 目录 {}", count, self.config.download_dir.display());
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.runtime().is_some()
    }

    /// 入队并上报一次 Pending 事件
    pub fn enqueue(&self, item: DownloadItem) -> DownloadResult<ItemId> {
        let id = item.id;
        // 在队列锁内发出 Pending，保证它先于 worker 的任何事件，且被拒绝的任务不会上报
        self.shared.queue.enqueue_with(item, |item| {
            let event = ProgressEvent::status_only(ItemStatus::Pending, 0, item.total_bytes);
            let _ = self.events.send(PoolEvent::Progress(id, event));
        })?;
        log::debug!("[{}] 已入队", id);
        Ok(id)
    }

    pub fn enqueue_url(&self, url: impl Into<String>) -> DownloadResult<ItemId> {
        self.enqueue(DownloadItem::new(url))
    }

    /// 排队中的直接移出并交还；已被认领的设置取消标志
    pub fn remove(&self, id: ItemId) -> RemoveOutcome {
        let outcome = self.shared.queue.remove(id);
        match &outcome {
            RemoveOutcome::Removed(_) => {
                log::info!("[{}] 已从队列移除", id);
                self.shared.settled.notify_waiters();
            }
            RemoveOutcome::WillCancel => log::info!("[{}] 正在下载，已请求取消", id),
            RemoveOutcome::NotFound => log::debug!("[{}] 不在队列中", id),
        }
        outcome
    }

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            log::info!("下载池已暂停");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            log::info!("下载池已恢复");
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// 取消全部：进行中的在块边界停下，排队中的直接记为已取消。下载池继续运行
    ///
    /// 返回最终会以 Cancelled 结束的数量，已经结束但尚未释放的下载项不计入。
    pub fn cancel_all(&self) -> usize {
        let (active, drained) = self.shared.queue.cancel_all();
        let total = active + drained.len();

        for mut item in drained {
            item.request_cancel();
            item.set_status(ItemStatus::Cancelled);
            item.error = Some(FailureReason::Cancelled);
            let event = ProgressEvent::status_only(ItemStatus::Cancelled, 0, item.total_bytes)
                .with_error(FailureReason::Cancelled.to_string());
            let _ = self.events.send(PoolEvent::Progress(item.id, event));
            let _ = self.events.send(PoolEvent::Finished(item));
        }
        log::info!("已取消 {} 个下载项", total);
        total
    }

    pub fn status(&self) -> PoolStatus {
        let (queued, active) = self.shared.queue.counts();
        let finished = self.shared.finished();
        PoolStatus {
            queued,
            active,
            completed: finished.completed.len(),
            failed: finished.failed.len(),
            cancelled: finished.cancelled.len(),
            running: self.is_running(),
            paused: self.is_paused(),
        }
    }

    /// 等到没有排队和进行中的下载项；下载池未运行时立即返回
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (queued, active) = self.shared.queue.counts();
            if queued == 0 && active == 0 {
                return;
            }
            if !self.is_running() {
                return;
            }
            let _ = tokio::time::timeout(IDLE_RECHECK, notified).await;
        }
    }

    /// 关闭队列，让 worker 处理完剩余任务后退出，再停止分发任务
    pub async fn shutdown(&self) {
        let runtime = self.runtime().take();
        let Some(runtime) = runtime else {
            self.shared.queue.close();
            return;
        };

        // 暂停中的 worker 需要恢复才能处理完剩余任务
        self.resume();
        self.shared.queue.close();
        for handle in runtime.workers {
            if let Err(e) = handle.await {
                log::error!("worker 异常退出: {}", e);
            }
        }
        let _ = self.events.send(PoolEvent::Shutdown);
        if let Err(e) = runtime.dispatcher.await {
            log::error!("分发任务异常退出: {}", e);
        }
        log::info!("下载池已关闭");
    }

    pub fn completed(&self) -> Vec<FinishedItem> {
        self.shared.finished().completed.clone()
    }

    pub fn failed(&self) -> Vec<FinishedItem> {
        self.shared.finished().failed.clone()
    }

    pub fn cancelled(&self) -> Vec<FinishedItem> {
        self.shared.finished().cancelled.clone()
    }
}

impl Drop for DownloadPool {
    fn drop(&mut self) {
        // 没有 shutdown 就被丢弃时，worker 处理完剩余任务后自行退出
        self.shared.queue.close();
    }
}

/// 分发任务：串行调用上报方和历史记录
async fn dispatch(mut receiver: UnboundedReceiver<PoolEvent>, shared: Arc<Shared>) {
    while let Some(event) = receiver.recv().await {
        match event {
            PoolEvent::Progress(id, event) => shared.reporter.on_progress(id, &event),
            PoolEvent::Finished(item) => {
                let snapshot = FinishedItem::from(&item);
                if let Err(e) = shared.history.record(snapshot.history_record()).await {
                    log::warn!("[{}] 写入下载历史失败: {}", item.id, e);
                }
                {
                    let mut finished = shared.finished();
                    match snapshot.status {
                        ItemStatus::Completed => finished.completed.push(snapshot),
                        ItemStatus::Cancelled => finished.cancelled.push(snapshot),
                        _ => finished.failed.push(snapshot),
                    }
                }
                shared.queue.release(item.id);
                shared.settled.notify_waiters();
            }
            PoolEvent::Shutdown => break,
        }
    }
    log::debug!("分发任务退出");
}
