//! 下载 worker：一次只处理一个下载项，处理完再取下一个
//!
//! 取消和暂停都在块边界轮询，不会打断正在进行的单次网络读取。
//! 所有失败出口都会删除部分文件。

use futures::StreamExt;
use reqwest::{Client, Response};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

use super::error::{DownloadError, DownloadResult, FailureReason};
use super::item::{DownloadItem, ItemId, ItemStatus};
use super::pool::PoolConfig;
use super::progress::{ProgressEvent, ProgressSampler};
use super::queue::{Dequeued, DownloadQueue};
use super::resolver::Resolver;
use super::writer::ChunkWriter;
use crate::utils::files;

/// 空闲时等待队列的超时，到时重新检查暂停和关闭状态
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// 暂停期间的轮询间隔
pub const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// 写缓冲大小 (512 KB)
const WRITE_BUFFER_SIZE: usize = 512 * 1024;

/// worker 发回给协调者的事件
#[derive(Debug)]
pub(crate) enum PoolEvent {
    Progress(ItemId, ProgressEvent),
    Finished(DownloadItem),
    Shutdown,
}

/// worker 共享的只读上下文
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub queue: Arc<DownloadQueue>,
    pub resolver: Arc<dyn Resolver>,
    pub client: Client,
    pub config: Arc<PoolConfig>,
    pub paused: Arc<AtomicBool>,
    pub events: UnboundedSender<PoolEvent>,
}

impl WorkerContext {
    fn emit(&self, id: ItemId, event: ProgressEvent) {
        let _ = self.events.send(PoolEvent::Progress(id, event));
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

/// worker 主循环，队列关闭且清空后退出
pub(crate) async fn run_worker(index: usize, ctx: WorkerContext) {
    log::info!("[worker-{}] 启动", index);
    loop {
        // 暂停时空闲 worker 不认领新任务
        if ctx.is_paused() && !ctx.queue.is_closed() {
            tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
            continue;
        }
        match ctx.queue.try_dequeue(IDLE_POLL_INTERVAL).await {
            Dequeued::Item(item) => {
                log::info!("[worker-{}] 开始处理 {} ({})", index, item.id, item.source_url);
                let item = process_item(&ctx, item).await;
                let _ = ctx.events.send(PoolEvent::Finished(item));
            }
            Dequeued::Empty => continue,
            Dequeued::Closed => break,
        }
    }
    log::info!("[worker-{}] 退出", index);
}

/// 处理单个下载项直到终止状态
pub(crate) async fn process_item(ctx: &WorkerContext, mut item: DownloadItem) -> DownloadItem {
    let id = item.id;
    let mut result = download(ctx, &mut item).await;
    // 终止前封住取消标志；在此之前到达的取消一律以 Cancelled 结束
    if !item.cancel_flag().settle() && !matches!(result, Err(DownloadError::Cancelled)) {
        if result.is_ok() {
            if let Some(path) = &item.destination {
                files::remove_partial(path).await;
            }
        }
        result = Err(DownloadError::Cancelled);
    }
    match result {
        Ok(()) => {
            item.set_status(ItemStatus::Completed);
            log::info!(
                "[{}] 下载完成: {} ({} 字节, {:.1}s)",
                id,
                item.filename().unwrap_or("?"),
                item.downloaded_bytes,
                item.elapsed_secs()
            );
            ctx.emit(id, ProgressEvent::status_only(ItemStatus::Completed, item.downloaded_bytes, item.total_bytes));
        }
        Err(e) => {
            let reason = e.reason();
            item.error = Some(reason);
            item.error_message = Some(e.to_string());
            let status = if reason == FailureReason::Cancelled {
                log::info!("[{}] 下载已取消", id);
                ItemStatus::Cancelled
            } else {
                log::error!("[{}] 下载失败 ({}): {}", id, reason, e);
                ItemStatus::Failed
            };
            item.set_status(status);
            ctx.emit(
                id,
                ProgressEvent::status_only(status, item.downloaded_bytes, item.total_bytes).with_error(format!("{}: {}", reason, e)),
            );
        }
    }
    item
}

async fn download(ctx: &WorkerContext, item: &mut DownloadItem) -> DownloadResult<()> {
    if item.is_cancel_requested() {
        return Err(DownloadError::Cancelled);
    }

    let info = match item.resolved.clone() {
        Some(info) => info,
        None => {
            item.set_status(ItemStatus::Resolving);
            ctx.emit(item.id, ProgressEvent::status_only(ItemStatus::Resolving, 0, None));
            let info = ctx.resolver.resolve(&item.source_url).await.map_err(|e| match e {
                e @ DownloadError::ResolutionFailed(_) => e,
                other => DownloadError::resolution(other),
            })?;
            item.total_bytes = info.size_bytes;
            item.resolved = Some(info.clone());
            info
        }
    };

    if item.is_cancel_requested() {
        return Err(DownloadError::Cancelled);
    }

    let dir = ctx.config.download_dir.as_path();
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| DownloadError::filesystem(format!("无法创建下载目录 {}: {}", dir.display(), e)))?;

    let response = ctx.client.get(&info.download_url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::HttpStatus(status.as_u16()));
    }
    // 响应头里的长度比解析器给的大小更可信
    if let Some(len) = response.content_length() {
        item.total_bytes = Some(len);
    }

    let (path, file) = files::create_unique(dir, &info.filename)
        .await
        .map_err(|e| DownloadError::filesystem(format!("无法创建文件 {}: {}", info.filename, e)))?;
    item.destination = Some(path.clone());

    let writer = ChunkWriter::new(file, path.clone(), WRITE_BUFFER_SIZE);
    let result = stream_body(ctx, item, response, writer).await;
    if result.is_err() {
        files::remove_partial(&path).await;
    }
    result
}

async fn stream_body(
    ctx: &WorkerContext,
    item: &mut DownloadItem,
    response: Response,
    mut writer: ChunkWriter,
) -> DownloadResult<()> {
    let chunk_size = ctx.config.chunk_size.max(1);
    let mut sampler = ProgressSampler::new(ctx.config.progress_interval, 0);

    item.set_status(ItemStatus::Downloading);
    item.mark_started();
    ctx.emit(item.id, ProgressEvent::status_only(ItemStatus::Downloading, 0, item.total_bytes));

    let mut stream = response.bytes_stream();
    while let Some(next) = stream.next().await {
        let bytes = next?;
        for piece in bytes.chunks(chunk_size) {
            if item.is_cancel_requested() {
                return Err(DownloadError::Cancelled);
            }
            if ctx.is_paused() {
                wait_while_paused(ctx, item, &mut writer, &mut sampler).await?;
            }

            let accepted = item.downloaded_bytes + piece.len() as u64;
            if let Some(total) = item.total_bytes.filter(|t| *t > 0) {
                if accepted > total {
                    return Err(DownloadError::NetworkError(format!(
                        "响应体超过声明的长度: 预期 {} 字节",
                        total
                    )));
                }
            }
            writer.write(piece).await?;
            item.downloaded_bytes = accepted;

            if let Some(event) = sampler.sample(item.downloaded_bytes, item.total_bytes) {
                ctx.emit(item.id, event);
            }
            if item.is_cancel_requested() {
                return Err(DownloadError::Cancelled);
            }
        }
    }

    let written = writer.finish().await?;
    if let Some(total) = item.total_bytes {
        if written != total {
            return Err(DownloadError::NetworkError(format!(
                "数据不完整: 预期 {} 字节, 实际 {} 字节",
                total, written
            )));
        }
    }
    ctx.emit(item.id, sampler.force(item.downloaded_bytes, item.total_bytes));
    Ok(())
}

/// 暂停期间挂起，不丢弃已写入的数据；暂停中被取消则直接返回
async fn wait_while_paused(
    ctx: &WorkerContext,
    item: &mut DownloadItem,
    writer: &mut ChunkWriter,
    sampler: &mut ProgressSampler,
) -> DownloadResult<()> {
    writer.flush().await?;
    item.set_status(ItemStatus::Paused);
    ctx.emit(item.id, ProgressEvent::status_only(ItemStatus::Paused, item.downloaded_bytes, item.total_bytes));
    log::debug!("[{}] 已暂停于 {} 字节", item.id, item.downloaded_bytes);

    while ctx.is_paused() {
        if item.is_cancel_requested() {
            return Err(DownloadError::Cancelled);
        }
        tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
    }
    if item.is_cancel_requested() {
        return Err(DownloadError::Cancelled);
    }

    item.set_status(ItemStatus::Downloading);
    sampler.reset_clock(item.downloaded_bytes);
    ctx.emit(item.id, ProgressEvent::status_only(ItemStatus::Downloading, item.downloaded_bytes, item.total_bytes));
    log::debug!("[{}] 从 {} 字节继续", item.id, item.downloaded_bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::item::ResolvedInfo;
    use crate::core::resolver::DirectResolver;
    use async_trait::async_trait;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    struct FailingResolver;

    #[async_trait]
    impl Resolver for FailingResolver {
        async fn resolve(&self, share_url: &str) -> DownloadResult<ResolvedInfo> {
            Err(DownloadError::NetworkError(format!("接口不可用: {}", share_url)))
        }
    }

    fn context(dir: &std::path::Path, resolver: Arc<dyn Resolver>) -> (WorkerContext, UnboundedReceiver<PoolEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = PoolConfig {
            chunk_size: 1024,
            progress_interval: Duration::ZERO,
            ..PoolConfig::new(dir)
        };
        let ctx = WorkerContext {
            queue: Arc::new(DownloadQueue::new()),
            resolver,
            client: Client::new(),
            config: Arc::new(config),
            paused: Arc::new(AtomicBool::new(false)),
            events: tx,
        };
        (ctx, rx)
    }

    fn progress_events(rx: &mut UnboundedReceiver<PoolEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let PoolEvent::Progress(_, event) = event {
                events.push(event);
            }
        }
        events
    }

    #[tokio::test]
    async fn test_download_completes() {
        let mut server = mockito::Server::new_async().await;
        let body: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        server
            .mock("GET", "/files/data.bin")
            .with_status(200)
            .with_body(&body)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (ctx, mut rx) = context(dir.path(), Arc::new(DirectResolver));
        let item = process_item(&ctx, DownloadItem::new(format!("{}/files/data.bin", server.url()))).await;

        assert_eq!(item.status, ItemStatus::Completed);
        assert_eq!(item.downloaded_bytes, 10_000);
        assert_eq!(item.total_bytes, Some(10_000));
        let path = item.destination.clone().unwrap();
        assert_eq!(path.file_name().unwrap(), "data.bin");
        assert_eq!(std::fs::read(&path).unwrap(), body);

        let events = progress_events(&mut rx);
        assert_eq!(events.first().unwrap().status, ItemStatus::Resolving);
        assert_eq!(events.last().unwrap().status, ItemStatus::Completed);
        let bytes: Vec<u64> = events.iter().map(|e| e.downloaded_bytes).collect();
        assert!(bytes.windows(2).all(|w| w[0] <= w[1]), "字节数必须单调: {:?}", bytes);
    }

    #[tokio::test]
    async fn test_http_error_leaves_no_file() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/missing.zip").with_status(404).create_async().await;

        let dir = tempfile::tempdir().unwrap();
        let (ctx, mut rx) = context(dir.path(), Arc::new(DirectResolver));
        let item = process_item(&ctx, DownloadItem::new(format!("{}/missing.zip", server.url()))).await;

        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(item.error, Some(FailureReason::NetworkError));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        let last = progress_events(&mut rx).pop().unwrap();
        assert_eq!(last.status, ItemStatus::Failed);
        assert!(last.error.unwrap().starts_with("NetworkError"));
    }

    #[tokio::test]
    async fn test_resolver_error_is_resolution_failed() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _rx) = context(dir.path(), Arc::new(FailingResolver));
        let item = process_item(&ctx, DownloadItem::new("https://share.example.com/s/1abc")).await;

        assert_eq!(item.status, ItemStatus::Failed);
        assert_eq!(item.error, Some(FailureReason::ResolutionFailed));
        assert!(item.destination.is_none());
    }

    #[tokio::test]
    async fn test_cancel_before_claim_processing() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, _rx) = context(dir.path(), Arc::new(DirectResolver));
        let item = DownloadItem::new("https://example.com/a.bin");
        item.request_cancel();
        let item = process_item(&ctx, item).await;

        assert_eq!(item.status, ItemStatus::Cancelled);
        assert_eq!(item.error, Some(FailureReason::Cancelled));
        assert!(!dir.path().join("a.bin").exists());
    }

    #[tokio::test]
    async fn test_same_filename_gets_suffix() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/report.pdf")
            .with_status(200)
            .with_body("pdf")
            .expect(3)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (ctx, _rx) = context(dir.path(), Arc::new(DirectResolver));
        let mut names = Vec::new();
        for _ in 0..3 {
            let item = process_item(&ctx, DownloadItem::new(format!("{}/report.pdf", server.url()))).await;
            assert_eq!(item.status, ItemStatus::Completed);
            names.push(item.filename().unwrap().to_string());
        }
        assert_eq!(names, ["report.pdf", "report (1).pdf", "report (2).pdf"]);
    }
}
