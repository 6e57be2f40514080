#![allow(dead_code)]

use async_trait::async_trait;
use sharedown::core::{
    DownloadError, DownloadResult, HistoryRecord, HistorySink, ItemId, ProgressEvent, ResolvedInfo, Resolver,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Semaphore;

/// 测试服务器上的一个路径
#[derive(Clone)]
pub enum Route {
    /// 一次发完，带 Content-Length
    Full(Vec<u8>),
    /// 先发 `first` 字节，等 `open_gate` 之后再发剩余部分
    Gated { body: Vec<u8>, first: usize },
    /// 不带 Content-Length，发完关闭连接
    Unknown(Vec<u8>),
    Status(u16),
}

/// 手动控制节奏的 HTTP 服务器，用来稳定地测试暂停和取消
pub struct TestServer {
    addr: SocketAddr,
    gate: Arc<Semaphore>,
}

impl TestServer {
    pub async fn start(routes: Vec<(&str, Route)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let gate = Arc::new(Semaphore::new(0));
        let routes: Arc<HashMap<String, Route>> =
            Arc::new(routes.into_iter().map(|(path, route)| (path.to_string(), route)).collect());

        let server_gate = gate.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                let routes = routes.clone();
                let gate = server_gate.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, routes, gate).await;
                });
            }
        });
        Self { addr, gate }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// 放行所有等待中的响应，之后的请求也不再等待
    pub fn open_gate(&self) {
        self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
    }
}

async fn serve(mut stream: TcpStream, routes: Arc<HashMap<String, Route>>, gate: Arc<Semaphore>) -> std::io::Result<()> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        head.extend_from_slice(&buf[..n]);
    }
    let request = String::from_utf8_lossy(&head);
    let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();

    match routes.get(&path).cloned() {
        Some(Route::Full(body)) => {
            stream.write_all(ok_head(Some(body.len())).as_bytes()).await?;
            stream.write_all(&body).await?;
        }
        Some(Route::Gated { body, first }) => {
            stream.write_all(ok_head(Some(body.len())).as_bytes()).await?;
            stream.write_all(&body[..first]).await?;
            stream.flush().await?;
            let _permit = gate.acquire().await;
            stream.write_all(&body[first..]).await?;
        }
        Some(Route::Unknown(body)) => {
            stream.write_all(ok_head(None).as_bytes()).await?;
            stream.write_all(&body).await?;
        }
        Some(Route::Status(code)) => {
            let head = format!("HTTP/1.1 {} Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n", code);
            stream.write_all(head.as_bytes()).await?;
        }
        None => {
            stream
                .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await?;
        }
    }
    stream.flush().await?;
    stream.shutdown().await
}

fn ok_head(len: Option<usize>) -> String {
    match len {
        Some(len) => format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            len
        ),
        None => "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n".to_string(),
    }
}

pub fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// 按表查找的解析器，表中没有的链接解析失败
#[derive(Default)]
pub struct MapResolver {
    entries: HashMap<String, ResolvedInfo>,
}

impl MapResolver {
    pub fn with(self, share_url: &str, download_url: String, filename: &str) -> Self {
        self.with_size(share_url, download_url, filename, None)
    }

    /// 解析结果带上大小，用来模拟解析器给出的大小和实际响应不一致
    pub fn with_size(mut self, share_url: &str, download_url: String, filename: &str, size: Option<u64>) -> Self {
        self.entries.insert(
            share_url.to_string(),
            ResolvedInfo {
                download_url,
                filename: filename.to_string(),
                size_bytes: size,
            },
        );
        self
    }
}

#[async_trait]
impl Resolver for MapResolver {
    async fn resolve(&self, share_url: &str) -> DownloadResult<ResolvedInfo> {
        self.entries
            .get(share_url)
            .cloned()
            .ok_or_else(|| DownloadError::ResolutionFailed(format!("分享链接已失效: {}", share_url)))
    }
}

/// 记在内存里的历史
#[derive(Default)]
pub struct MemoryHistory {
    records: Mutex<Vec<HistoryRecord>>,
}

impl MemoryHistory {
    pub fn records(&self) -> Vec<HistoryRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl HistorySink for MemoryHistory {
    async fn record(&self, record: HistoryRecord) -> DownloadResult<()> {
        self.records.lock().unwrap().push(record);
        Ok(())
    }
}

/// 每次写入都失败的历史
pub struct BrokenHistory;

#[async_trait]
impl HistorySink for BrokenHistory {
    async fn record(&self, _record: HistoryRecord) -> DownloadResult<()> {
        Err(DownloadError::FilesystemError("磁盘已满".to_string()))
    }
}

/// 收集进度事件，直到满足条件或超时
pub struct EventLog {
    rx: UnboundedReceiver<(ItemId, ProgressEvent)>,
    pub seen: Vec<(ItemId, ProgressEvent)>,
}

impl EventLog {
    pub fn new(rx: UnboundedReceiver<(ItemId, ProgressEvent)>) -> Self {
        Self { rx, seen: Vec::new() }
    }

    pub async fn wait_for(&mut self, mut pred: impl FnMut(ItemId, &ProgressEvent) -> bool) -> ProgressEvent {
        let wait = async {
            loop {
                let (id, event) = self.rx.recv().await.expect("事件通道已关闭");
                self.seen.push((id, event.clone()));
                if pred(id, &event) {
                    return event;
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(10), wait)
            .await
            .expect("等待进度事件超时")
    }

    /// 取走通道里已有的事件
    pub fn drain(&mut self) {
        while let Ok(entry) = self.rx.try_recv() {
            self.seen.push(entry);
        }
    }

    pub fn for_item(&self, id: ItemId) -> Vec<ProgressEvent> {
        self.seen.iter().filter(|(i, _)| *i == id).map(|(_, e)| e.clone()).collect()
    }
}
