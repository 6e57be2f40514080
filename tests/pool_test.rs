mod common;

use common::{body, BrokenHistory, EventLog, MapResolver, MemoryHistory, Route, TestServer};
use sharedown::core::{
    ChannelReporter, DirectResolver, DownloadItem, DownloadPool, FailureReason, HistorySink, ItemStatus, NullHistory,
    PoolConfig, RemoveOutcome, Resolver,
};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const CHUNK: usize = 1024;

fn config(dir: &Path) -> PoolConfig {
    PoolConfig {
        chunk_size: CHUNK,
        progress_interval: Duration::ZERO,
        timeout: Duration::from_secs(10),
        ..PoolConfig::new(dir)
    }
}

fn pool_with(dir: &Path, resolver: Arc<dyn Resolver>, history: Arc<dyn HistorySink>) -> (DownloadPool, EventLog) {
    pool_with_config(config(dir), resolver, history)
}

fn pool_with_config(
    config: PoolConfig,
    resolver: Arc<dyn Resolver>,
    history: Arc<dyn HistorySink>,
) -> (DownloadPool, EventLog) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pool = DownloadPool::new(config, resolver, history, Arc::new(ChannelReporter::new(tx))).unwrap();
    (pool, EventLog::new(rx))
}

fn files_in(dir: &Path) -> HashSet<String> {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default()
}

async fn idle(pool: &DownloadPool) {
    tokio::time::timeout(Duration::from_secs(10), pool.wait_idle())
        .await
        .expect("下载池没有在时限内空闲");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_items_two_workers_with_one_bad_link() {
    let server = TestServer::start(vec![("/a.bin", Route::Full(body(5000))), ("/c.bin", Route::Full(body(7000)))]).await;
    let resolver = MapResolver::default()
        .with("https://share.example.com/s/a", server.url("/a.bin"), "a.bin")
        .with("https://share.example.com/s/c", server.url("/c.bin"), "c.bin");
    let history = Arc::new(MemoryHistory::default());
    let dir = tempfile::tempdir().unwrap();
    let (pool, _events) = pool_with(dir.path(), Arc::new(resolver), history.clone());

    pool.start(2).unwrap();
    let a = pool.enqueue_url("https://share.example.com/s/a").unwrap();
    let b = pool.enqueue_url("https://share.example.com/s/b").unwrap();
    let c = pool.enqueue_url("https://share.example.com/s/c").unwrap();
    idle(&pool).await;

    let completed: HashSet<_> = pool.completed().iter().map(|i| i.id).collect();
    assert_eq!(completed, HashSet::from([a, c]));
    let failed = pool.failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, b);
    assert_eq!(failed[0].reason, Some(FailureReason::ResolutionFailed));
    assert_eq!(files_in(dir.path()), HashSet::from(["a.bin".to_string(), "c.bin".to_string()]));

    let records = history.records();
    assert_eq!(records.iter().filter(|r| r.status == ItemStatus::Completed).count(), 2);
    assert_eq!(records.iter().filter(|r| r.status == ItemStatus::Failed).count(), 1);
    let a_record = records.iter().find(|r| r.filename == "a.bin").unwrap();
    assert_eq!(a_record.size_bytes, Some(5000));

    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_item_reaches_terminal_state_with_monotonic_progress() {
    let routes: Vec<_> = (0..6).map(|i| (format!("/f{}.bin", i), 3000 + i * 1000)).collect();
    let server = TestServer::start(
        routes.iter().map(|(path, len)| (path.as_str(), Route::Full(body(*len)))).collect(),
    )
    .await;
    let dir = tempfile::tempdir().unwrap();
    let (pool, mut events) = pool_with(dir.path(), Arc::new(DirectResolver), Arc::new(NullHistory));

    pool.start(3).unwrap();
    let ids: Vec<_> = routes.iter().map(|(path, _)| pool.enqueue_url(server.url(path)).unwrap()).collect();
    idle(&pool).await;
    pool.shutdown().await;
    events.drain();

    let status = pool.status();
    assert_eq!((status.queued, status.active, status.completed, status.failed), (0, 0, 6, 0));
    for ((path, len), id) in routes.iter().zip(&ids) {
        let data = std::fs::read(dir.path().join(path.trim_start_matches('/'))).unwrap();
        assert_eq!(data, body(*len));

        let item_events = events.for_item(*id);
        let bytes: Vec<u64> = item_events.iter().map(|e| e.downloaded_bytes).collect();
        assert!(bytes.windows(2).all(|w| w[0] <= w[1]), "{}: {:?}", path, bytes);
        assert_eq!(item_events.first().unwrap().status, ItemStatus::Pending);
        assert_eq!(item_events.last().unwrap().status, ItemStatus::Completed);
        assert_eq!(item_events.last().unwrap().percent, Some(100.0));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_same_name_downloads_get_numbered() {
    let server = TestServer::start(vec![("/report.pdf", Route::Full(body(4096)))]).await;
    let dir = tempfile::tempdir().unwrap();
    let (pool, _events) = pool_with(dir.path(), Arc::new(DirectResolver), Arc::new(NullHistory));

    pool.start(3).unwrap();
    for _ in 0..3 {
        pool.enqueue_url(server.url("/report.pdf")).unwrap();
    }
    idle(&pool).await;

    let expected: HashSet<String> = ["report.pdf", "report (1).pdf", "report (2).pdf"]
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(files_in(dir.path()), expected);
    let names: HashSet<String> = pool.completed().into_iter().filter_map(|i| i.filename).collect();
    assert_eq!(names, expected);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn removing_a_queued_item_never_starts_it() {
    let server = TestServer::start(vec![
        ("/slow.bin", Route::Gated { body: body(64 * 1024), first: 16 * 1024 }),
        ("/later.bin", Route::Full(body(2048))),
    ])
    .await;
    let history = Arc::new(MemoryHistory::default());
    let dir = tempfile::tempdir().unwrap();
    let (pool, mut events) = pool_with(dir.path(), Arc::new(DirectResolver), history.clone());

    pool.start(1).unwrap();
    let slow = pool.enqueue_url(server.url("/slow.bin")).unwrap();
    let later = pool.enqueue_url(server.url("/later.bin")).unwrap();
    events
        .wait_for(|id, e| id == slow && e.status == ItemStatus::Downloading && e.downloaded_bytes > 0)
        .await;

    match pool.remove(later) {
        RemoveOutcome::Removed(item) => assert_eq!(item.status, ItemStatus::Pending),
        other => panic!("排队中的任务应直接移除, 实际 {:?}", other),
    }
    server.open_gate();
    idle(&pool).await;
    pool.shutdown().await;
    events.drain();

    assert_eq!(pool.status().completed, 1);
    assert!(!files_in(dir.path()).contains("later.bin"));
    assert!(events.for_item(later).iter().all(|e| e.status == ItemStatus::Pending));
    assert_eq!(history.records().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelling_a_claimed_item_removes_partial_file() {
    let server = TestServer::start(vec![("/big.iso", Route::Gated { body: body(256 * 1024), first: 16 * 1024 })]).await;
    let history = Arc::new(MemoryHistory::default());
    let dir = tempfile::tempdir().unwrap();
    let (pool, mut events) = pool_with(dir.path(), Arc::new(DirectResolver), history.clone());

    pool.start(2).unwrap();
    let id = pool.enqueue_url(server.url("/big.iso")).unwrap();
    events
        .wait_for(|i, e| i == id && e.status == ItemStatus::Downloading && e.downloaded_bytes > 0)
        .await;

    assert!(matches!(pool.remove(id), RemoveOutcome::WillCancel));
    server.open_gate();
    let last = events.wait_for(|i, e| i == id && e.status.is_terminal()).await;
    idle(&pool).await;

    assert_eq!(last.status, ItemStatus::Cancelled);
    let cancelled = pool.cancelled();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].reason, Some(FailureReason::Cancelled));
    assert!(files_in(dir.path()).is_empty());
    assert_eq!(history.records()[0].status, ItemStatus::Cancelled);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_and_resume_keep_written_bytes() {
    let data = body(128 * 1024);
    let server = TestServer::start(vec![("/video.mp4", Route::Gated { body: data.clone(), first: 16 * 1024 })]).await;
    let dir = tempfile::tempdir().unwrap();
    let (pool, mut events) = pool_with(dir.path(), Arc::new(DirectResolver), Arc::new(NullHistory));

    pool.start(1).unwrap();
    let id = pool.enqueue_url(server.url("/video.mp4")).unwrap();
    events
        .wait_for(|i, e| i == id && e.status == ItemStatus::Downloading && e.downloaded_bytes > 0)
        .await;

    pool.pause();
    server.open_gate();
    let paused = events.wait_for(|i, e| i == id && e.status == ItemStatus::Paused).await;
    assert!(paused.downloaded_bytes > 0);
    assert!(pool.status().paused);

    // 暂停期间不再有新进度
    tokio::time::sleep(Duration::from_millis(300)).await;
    events.drain();
    assert_eq!(events.seen.last().map(|(_, e)| e.status), Some(ItemStatus::Paused));

    pool.resume();
    let done = events.wait_for(|i, e| i == id && e.status.is_terminal()).await;
    assert_eq!(done.status, ItemStatus::Completed);
    assert_eq!(done.downloaded_bytes, data.len() as u64);
    idle(&pool).await;

    let resumed = events
        .for_item(id)
        .into_iter()
        .skip_while(|e| e.status != ItemStatus::Paused)
        .find(|e| e.status == ItemStatus::Downloading)
        .unwrap();
    assert_eq!(resumed.downloaded_bytes, paused.downloaded_bytes);
    assert_eq!(std::fs::read(dir.path().join("video.mp4")).unwrap(), data);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_length_omits_percent_and_eta() {
    let data = body(20_000);
    let server = TestServer::start(vec![("/stream.log", Route::Unknown(data.clone()))]).await;
    let dir = tempfile::tempdir().unwrap();
    let (pool, mut events) = pool_with(dir.path(), Arc::new(DirectResolver), Arc::new(NullHistory));

    pool.start(1).unwrap();
    let id = pool.enqueue_url(server.url("/stream.log")).unwrap();
    idle(&pool).await;
    pool.shutdown().await;
    events.drain();

    let item_events = events.for_item(id);
    assert!(item_events.iter().all(|e| e.percent.is_none() && e.eta.is_none() && e.total_bytes.is_none()));
    let last = item_events.last().unwrap();
    assert_eq!(last.status, ItemStatus::Completed);
    assert_eq!(last.downloaded_bytes, data.len() as u64);

    let completed = pool.completed();
    assert_eq!(completed[0].size_bytes, None);
    assert_eq!(std::fs::read(dir.path().join("stream.log")).unwrap(), data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn history_failure_does_not_fail_download() {
    let server = TestServer::start(vec![("/ok.zip", Route::Full(body(3000)))]).await;
    let dir = tempfile::tempdir().unwrap();
    let (pool, _events) = pool_with(dir.path(), Arc::new(DirectResolver), Arc::new(BrokenHistory));

    pool.start(1).unwrap();
    pool.enqueue_url(server.url("/ok.zip")).unwrap();
    idle(&pool).await;

    let status = pool.status();
    assert_eq!((status.completed, status.failed), (1, 0));
    assert!(dir.path().join("ok.zip").exists());
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn server_error_fails_without_leaving_a_file() {
    let server = TestServer::start(vec![("/gone.zip", Route::Status(503))]).await;
    let dir = tempfile::tempdir().unwrap();
    let (pool, _events) = pool_with(dir.path(), Arc::new(DirectResolver), Arc::new(NullHistory));

    pool.start(1).unwrap();
    pool.enqueue_url(server.url("/gone.zip")).unwrap();
    idle(&pool).await;

    let failed = pool.failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].reason, Some(FailureReason::NetworkError));
    assert!(files_in(dir.path()).is_empty());
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_all_stops_active_and_queued_items() {
    let server = TestServer::start(vec![("/one.bin", Route::Gated { body: body(64 * 1024), first: 16 * 1024 })]).await;
    let history = Arc::new(MemoryHistory::default());
    let dir = tempfile::tempdir().unwrap();
    let (pool, mut events) = pool_with(dir.path(), Arc::new(DirectResolver), history.clone());

    pool.start(1).unwrap();
    let active = pool.enqueue_url(server.url("/one.bin")).unwrap();
    for _ in 0..3 {
        pool.enqueue_url(server.url("/one.bin")).unwrap();
    }
    events
        .wait_for(|i, e| i == active && e.status == ItemStatus::Downloading && e.downloaded_bytes > 0)
        .await;

    assert_eq!(pool.cancel_all(), 4);
    server.open_gate();
    idle(&pool).await;

    let status = pool.status();
    assert_eq!((status.queued, status.active, status.cancelled, status.completed), (0, 0, 4, 0));
    assert!(files_in(dir.path()).is_empty());
    assert_eq!(history.records().len(), 4);

    // 取消后下载池仍可接收新任务
    let again = pool.enqueue(DownloadItem::new(server.url("/one.bin"))).unwrap();
    idle(&pool).await;
    assert_eq!(pool.completed().iter().map(|i| i.id).collect::<Vec<_>>(), vec![again]);
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unwritable_download_dir_is_filesystem_error() {
    let server = TestServer::start(vec![("/a.bin", Route::Full(body(2048)))]).await;
    let root = tempfile::tempdir().unwrap();
    // 下载目录的上级是一个普通文件，目录无法创建
    let blocker = root.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();
    let (pool, _events) = pool_with_config(config(&blocker.join("downloads")), Arc::new(DirectResolver), Arc::new(NullHistory));

    pool.start(1).unwrap();
    pool.enqueue_url(server.url("/a.bin")).unwrap();
    idle(&pool).await;

    let failed = pool.failed();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].reason, Some(FailureReason::FilesystemError));
    assert!(failed[0].destination.is_none());
    assert_eq!(files_in(root.path()), HashSet::from(["blocker".to_string()]));
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stalled_peer_times_out_without_leaving_a_file() {
    // 只发前 16KB，之后一直不发，也不关闭连接
    let server = TestServer::start(vec![("/stuck.bin", Route::Gated { body: body(64 * 1024), first: 16 * 1024 })]).await;
    let dir = tempfile::tempdir().unwrap();
    let config = PoolConfig {
        timeout: Duration::from_secs(1),
        ..config(dir.path())
    };
    let (pool, mut events) = pool_with_config(config, Arc::new(DirectResolver), Arc::new(NullHistory));

    pool.start(1).unwrap();
    let id = pool.enqueue_url(server.url("/stuck.bin")).unwrap();
    events
        .wait_for(|i, e| i == id && e.status == ItemStatus::Downloading && e.downloaded_bytes > 0)
        .await;
    let last = events.wait_for(|i, e| i == id && e.status.is_terminal()).await;
    idle(&pool).await;

    assert_eq!(last.status, ItemStatus::Failed);
    let failed = pool.failed();
    assert_eq!(failed[0].reason, Some(FailureReason::NetworkError));
    assert!(failed[0].error.as_deref().unwrap_or("").contains("超时"), "{:?}", failed[0].error);
    assert!(failed[0].downloaded_bytes > 0);
    assert!(files_in(dir.path()).is_empty());
    pool.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resolver_size_is_checked_when_server_sends_no_length() {
    let data = body(20_000);
    let server = TestServer::start(vec![
        ("/exact.bin", Route::Unknown(data.clone())),
        ("/long.bin", Route::Unknown(data.clone())),
        ("/short.bin", Route::Unknown(data.clone())),
    ])
    .await;
    let resolver = MapResolver::default()
        .with_size("https://share.example.com/s/exact", server.url("/exact.bin"), "exact.bin", Some(20_000))
        .with_size("https://share.example.com/s/long", server.url("/long.bin"), "long.bin", Some(10_000))
        .with_size("https://share.example.com/s/short", server.url("/short.bin"), "short.bin", Some(30_000));
    let dir = tempfile::tempdir().unwrap();
    let (pool, mut events) = pool_with(dir.path(), Arc::new(resolver), Arc::new(NullHistory));

    pool.start(3).unwrap();
    let exact = pool.enqueue_url("https://share.example.com/s/exact").unwrap();
    let long = pool.enqueue_url("https://share.example.com/s/long").unwrap();
    let short = pool.enqueue_url("https://share.example.com/s/short").unwrap();
    idle(&pool).await;
    pool.shutdown().await;
    events.drain();

    // 大小一致：解析器给的大小用于百分比
    let completed = pool.completed();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, exact);
    assert_eq!(events.for_item(exact).last().unwrap().percent, Some(100.0));
    assert_eq!(std::fs::read(dir.path().join("exact.bin")).unwrap(), data);

    // 响应体超过预期，或者连接关闭时还没收够，都算网络错误并删除部分文件
    let failed = pool.failed();
    assert_eq!(failed.len(), 2);
    for id in [long, short] {
        let item = failed.iter().find(|i| i.id == id).unwrap();
        assert_eq!(item.reason, Some(FailureReason::NetworkError));
    }
    let long_item = failed.iter().find(|i| i.id == long).unwrap();
    assert!(long_item.downloaded_bytes <= 10_000);
    let short_item = failed.iter().find(|i| i.id == short).unwrap();
    assert_eq!(short_item.downloaded_bytes, 20_000);
    assert!(short_item.error.as_deref().unwrap_or("").contains("30000"));
    assert_eq!(files_in(dir.path()), HashSet::from(["exact.bin".to_string()]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_all_counts_only_items_that_end_cancelled() {
    let server = TestServer::start(vec![
        ("/done.bin", Route::Full(body(2048))),
        ("/slow.bin", Route::Gated { body: body(64 * 1024), first: 16 * 1024 }),
    ])
    .await;
    let dir = tempfile::tempdir().unwrap();
    let (pool, mut events) = pool_with(dir.path(), Arc::new(DirectResolver), Arc::new(NullHistory));

    pool.start(4).unwrap();
    let done = pool.enqueue_url(server.url("/done.bin")).unwrap();
    events.wait_for(|i, e| i == done && e.status == ItemStatus::Completed).await;
    idle(&pool).await;

    let slow: Vec<_> = (0..6).map(|_| pool.enqueue_url(server.url("/slow.bin")).unwrap()).collect();
    let cancelled = pool.cancel_all();
    server.open_gate();
    idle(&pool).await;

    // 已完成的不计入；刚被 worker 认领的和还在排队的都以 Cancelled 结束，没有漏网的
    assert_eq!(cancelled, 6);
    let status = pool.status();
    assert_eq!((status.completed, status.cancelled, status.failed), (1, 6, 0));
    let ended: HashSet<_> = pool.cancelled().iter().map(|i| i.id).collect();
    assert_eq!(ended, slow.into_iter().collect::<HashSet<_>>());
    assert_eq!(files_in(dir.path()), HashSet::from(["done.bin".to_string()]));
    pool.shutdown().await;
}
