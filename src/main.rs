use anyhow::Context;
use clap::Parser;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal;
use std::collections::{HashMap, HashSet};
use std::io::{BufRead, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver};

use sharedown::cli::{self, Args};
use sharedown::config::Config;
use sharedown::core::{
    ApiResolver, DirectResolver, DownloadItem, DownloadPool, FailureReason, HistorySink, ItemId, JsonHistory,
    LogReporter, NullHistory, PoolConfig, ProgressReporter, Resolver, RetryStrategy,
};
use sharedown::ui::{self, DownloadSummary, HistoryReport, HistoryTable, ProgressManager};
use sharedown::utils::logger;

const KEYBOARD_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// 退出时恢复终端
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Option<Self> {
        if !std::io::stdin().is_terminal() {
            return None;
        }
        match terminal::enable_raw_mode() {
            Ok(()) => Some(RawModeGuard),
            Err(e) => {
                log::debug!("无法进入原始模式，键盘控制不可用: {}", e);
                None
            }
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// 键盘读取在阻塞线程里轮询，按键通过通道送回
fn spawn_key_reader(stop: Arc<AtomicBool>) -> UnboundedReceiver<KeyCode> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::task::spawn_blocking(move || {
        while !stop.load(Ordering::SeqCst) {
            match event::poll(KEYBOARD_POLL_INTERVAL) {
                Ok(true) => {
                    if let Ok(Event::Key(key)) = event::read() {
                        if key.kind == KeyEventKind::Press && tx.send(key.code).is_err() {
                            break;
                        }
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    log::debug!("读取键盘事件失败: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

async fn next_key(keys: &mut Option<UnboundedReceiver<KeyCode>>) -> Option<KeyCode> {
    match keys {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    Idle,
    CancelledByUser,
    Quit,
}

/// 等待下载池空闲，同时处理按键
async fn wait_with_keys(
    pool: &DownloadPool,
    progress: &ProgressManager,
    keys: &mut Option<UnboundedReceiver<KeyCode>>,
) -> LoopExit {
    let mut cancelled = false;
    loop {
        let key = tokio::select! {
            _ = pool.wait_idle() => {
                return if cancelled { LoopExit::CancelledByUser } else { LoopExit::Idle };
            }
            key = next_key(keys) => key,
        };
        match key {
            Some(KeyCode::Char('p' | 'P')) => {
                pool.pause();
                progress.println("已暂停，按 r 恢复");
            }
            Some(KeyCode::Char('r' | 'R')) => {
                pool.resume();
                progress.println("已恢复下载");
            }
            Some(KeyCode::Char('c' | 'C')) => {
                let count = pool.cancel_all();
                progress.println(format!("已取消 {} 个下载", count));
                cancelled = true;
            }
            Some(KeyCode::Char('q' | 'Q')) | Some(KeyCode::Esc) => {
                pool.cancel_all();
                log::info!("用户主动退出下载");
                return LoopExit::Quit;
            }
            Some(_) => {}
            None => *keys = None,
        }
    }
}

fn enqueue_url(pool: &DownloadPool, progress: &ProgressManager, url: &str) -> anyhow::Result<ItemId> {
    let item = DownloadItem::new(url);
    progress.set_label(item.id, url);
    Ok(pool.enqueue(item)?)
}

/// 读取一行确认，只有 y/yes 算同意
fn confirm(prompt: &str) -> anyhow::Result<bool> {
    print!("{}", prompt);
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

/// 查看、导出或清空下载历史
async fn run_history_command(args: &Args, config: &Config) -> anyhow::Result<()> {
    let Some(path) = config.history_path() else {
        println!("未启用下载历史");
        return Ok(());
    };
    let history = JsonHistory::open(&path).await?;
    let filter = args.history_filter();

    if args.clear_history {
        let total = history.stats().await.total;
        if total == 0 {
            println!("下载历史为空");
            return Ok(());
        }
        let prompt = format!("确定要清空全部 {} 条下载历史吗？此操作无法撤销 [y/N] ", total);
        if !args.yes && !confirm(&prompt)? {
            println!("已放弃清空");
            return Ok(());
        }
        let removed = history.clear().await?;
        ui::print_success(&format!("已清空 {} 条下载历史", removed));
        return Ok(());
    }

    if let Some(out) = &args.export_history {
        let count = history.export_csv(out, &filter).await.context("导出历史失败")?;
        ui::print_success(&format!("已导出 {} 条记录到 {}", count, out));
    }
    if args.show_history {
        println!("历史文件: {}", history.path().display());
        let records = history.query(&filter).await;
        print!("{}", HistoryTable(&records));
        println!();
        print!("{}", HistoryReport(&history.stats().await));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.edit_config {
        // 不存在时先写入带说明的默认配置
        Config::load(&args.config).context("无法创建配置文件")?;
        cli::open_config_in_editor(&args.config);
        return Ok(());
    }

    let (config, warning) = args.load_config().context("配置无效")?;
    logger::init(config.log_path().as_deref(), &config.log_level)?;
    log::info!("sharedown {} 启动 (构建于 {})", env!("CARGO_PKG_VERSION"), env!("VERGEN_BUILD_TIMESTAMP"));
    if let Some(warning) = warning {
        log::warn!("{}", warning);
        if config.log_path().is_some() {
            eprintln!("警告: {}", warning);
        }
    }

    if args.is_history_command() {
        return run_history_command(&args, &config).await;
    }

    let urls = args.get_urls()?;
    println!("{}", config.get_summary());

    let endpoints = config.resolver_endpoints();
    let resolver: Arc<dyn Resolver> = if endpoints.is_empty() {
        Arc::new(DirectResolver)
    } else {
        Arc::new(ApiResolver::new(endpoints, Duration::from_secs(config.timeout_secs), &config.user_agent)?)
    };
    let history: Arc<dyn HistorySink> = match config.history_path() {
        Some(path) => Arc::new(JsonHistory::open(path).await?),
        None => Arc::new(NullHistory),
    };
    // 不在终端里运行时没有进度条，进度写进日志
    let interactive = std::io::stderr().is_terminal();
    let progress = Arc::new(if interactive { ProgressManager::new() } else { ProgressManager::hidden() });
    let reporter: Arc<dyn ProgressReporter> = if interactive {
        progress.clone() as Arc<dyn ProgressReporter>
    } else {
        Arc::new(LogReporter)
    };

    let pool = DownloadPool::new(PoolConfig::from(&config), resolver, history, reporter)?;
    pool.start(config.max_concurrent)?;

    for url in &urls {
        enqueue_url(&pool, &progress, url)?;
    }
    log::info!("开始下载 {} 个链接", urls.len());
    println!("\n开始下载... (按 'p' 暂停, 'r' 恢复, 'c' 取消全部, 'q' 退出)");

    let started = Instant::now();
    let stop_keys = Arc::new(AtomicBool::new(false));
    let raw_mode = RawModeGuard::enable();
    let mut keys = raw_mode.as_ref().map(|_| spawn_key_reader(stop_keys.clone()));

    // 下载池本身不重试，网络错误在这里按策略重新入队
    let strategy = RetryStrategy::new(config.retry_attempts);
    let mut attempts: HashMap<String, u32> = HashMap::new();
    let mut retried: HashSet<ItemId> = HashSet::new();
    loop {
        if wait_with_keys(&pool, &progress, &mut keys).await != LoopExit::Idle {
            break;
        }
        let candidates: Vec<_> = pool
            .failed()
            .into_iter()
            .filter(|item| !retried.contains(&item.id))
            .filter(|item| {
                let count = attempts.get(&item.source_url).copied().unwrap_or(0);
                item.reason.is_some_and(|reason| strategy.should_retry(reason, count))
            })
            .collect();
        if candidates.is_empty() {
            break;
        }

        let mut delay = Duration::ZERO;
        for item in &candidates {
            let count = attempts.entry(item.source_url.clone()).or_insert(0);
            delay = delay.max(strategy.get_delay(*count));
            *count += 1;
            retried.insert(item.id);
        }
        progress.println(format!("{:.1} 秒后重试 {} 个失败的下载", delay.as_secs_f64(), candidates.len()));
        tokio::time::sleep(delay).await;
        for item in &candidates {
            log::info!("重试下载 (第 {} 次): {}", attempts.get(&item.source_url).copied().unwrap_or(1), item.source_url);
            enqueue_url(&pool, &progress, &item.source_url)?;
        }
    }

    pool.shutdown().await;
    stop_keys.store(true, Ordering::SeqCst);
    drop(raw_mode);

    let failed: Vec<_> = pool.failed().into_iter().filter(|item| !retried.contains(&item.id)).collect();
    let summary = DownloadSummary::new(&pool.completed(), failed, &pool.cancelled(), started.elapsed());
    println!("{}", summary);
    if summary.success_count > 0 {
        println!("文件保存在: {}", pool.config().download_dir.display());
    }
    if summary.failed.is_empty() && summary.cancelled_count == 0 {
        ui::print_success("全部下载完成");
    } else if summary.failed.iter().any(|item| item.reason == Some(FailureReason::ResolutionFailed)) {
        ui::print_error("部分链接解析失败，请检查解析接口或链接是否有效");
    }
    log::info!(
        "下载结束 - 成功: {}, 失败: {}, 取消: {}",
        summary.success_count,
        summary.failed.len(),
        summary.cancelled_count
    );
    Ok(())
}
