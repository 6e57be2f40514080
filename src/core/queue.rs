//! 下载队列：先进先出，空闲 worker 带超时阻塞等待，不会空转

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

use super::error::{DownloadError, DownloadResult};
use super::item::{CancelFlag, DownloadItem, ItemId};

/// `try_dequeue` 的结果
#[derive(Debug)]
pub enum Dequeued {
    Item(DownloadItem),
    /// 超时内没有新任务，属于正常空闲
    Empty,
    /// 队列已关闭且已清空
    Closed,
}

/// `remove` 的结果
#[derive(Debug)]
pub enum RemoveOutcome {
    /// 还在排队，直接移除并交还给调用方
    Removed(DownloadItem),
    /// 已被 worker 认领，只设置取消标志，由 worker 在块边界自行终止
    WillCancel,
    NotFound,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<DownloadItem>,
    claimed: HashMap<ItemId, CancelFlag>,
    closed: bool,
}

#[derive(Default)]
pub struct DownloadQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl DownloadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // 持锁期间不会 panic，中毒时继续使用内部数据
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 追加到队尾，永不阻塞；关闭后返回 `QueueClosed` 且不做任何事
    pub fn enqueue(&self, item: DownloadItem) -> DownloadResult<()> {
        self.enqueue_with(item, |_| {})
    }

    /// 同 `enqueue`，`on_accept` 在入队前于锁内调用，早于任何 worker 看到该任务
    pub fn enqueue_with(&self, item: DownloadItem, on_accept: impl FnOnce(&DownloadItem)) -> DownloadResult<()> {
        {
            let mut state = self.lock();
            if state.closed {
                log::warn!("[queue] 队列已关闭，丢弃入队请求: {}", item.source_url);
                return Err(DownloadError::QueueClosed);
            }
            on_accept(&item);
            state.pending.push_back(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// 取出队头；队首出队与登记认领在同一把锁下完成
    pub async fn try_dequeue(&self, timeout: Duration) -> Dequeued {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if let Some(item) = state.pending.pop_front() {
                    state.claimed.insert(item.id, item.cancel_flag());
                    // 队列里还有任务时把通知接力给下一个空闲 worker
                    if !state.pending.is_empty() {
                        self.notify.notify_one();
                    }
                    return Dequeued::Item(item);
                }
                if state.closed {
                    return Dequeued::Closed;
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Dequeued::Empty;
            }
        }
    }

    pub fn remove(&self, id: ItemId) -> RemoveOutcome {
        let mut state = self.lock();
        if let Some(pos) = state.pending.iter().position(|item| item.id == id) {
            if let Some(item) = state.pending.remove(pos) {
                return RemoveOutcome::Removed(item);
            }
        }
        match state.claimed.get(&id) {
            // 已封住标志的下载项正在结束，取消不再生效
            Some(flag) if flag.cancel() || flag.is_cancelled() => RemoveOutcome::WillCancel,
            _ => RemoveOutcome::NotFound,
        }
    }

    /// 下载项进入终止状态后释放认领
    pub fn release(&self, id: ItemId) {
        self.lock().claimed.remove(&id);
    }

    /// 在同一把锁内给已认领的下载项设置取消标志，并取出全部排队任务登记为已认领
    ///
    /// 返回 (这次真正被取消的进行中数量, 排队任务)。排队任务由调用方处理完后逐个 `release`。
    pub fn cancel_all(&self) -> (usize, Vec<DownloadItem>) {
        let mut state = self.lock();
        let active = state.claimed.values().filter(|flag| flag.cancel()).count();
        let drained: Vec<DownloadItem> = state.pending.drain(..).collect();
        for item in &drained {
            state.claimed.insert(item.id, item.cancel_flag());
        }
        (active, drained)
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// 排队中的数量
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 已认领未释放的数量
    pub fn active(&self) -> usize {
        self.lock().claimed.len()
    }

    /// 一次性读取 (排队, 活跃)，保证两者一致
    pub fn counts(&self) -> (usize, usize) {
        let state = self.lock();
        (state.pending.len(), state.claimed.len())
    }
}
