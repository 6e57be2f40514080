//! 下载历史
//!
//! 每个终止的下载项都会写一条记录。写入失败只记日志，不影响下载结果。

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::{Serialize, Deserialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::error::{DownloadError, DownloadResult};
use super::item::ItemStatus;
use crate::utils::format::format_bytes;

/// 一条历史记录，原始字节数和格式化字符串一起保存
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub source_url: String,
    pub filename: String,
    pub size_bytes: Option<u64>,
    pub size_formatted: String,
    pub status: ItemStatus,
    pub duration_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub recorded_at: DateTime<Local>,
}

impl HistoryRecord {
    pub fn new(
        source_url: impl Into<String>,
        filename: impl Into<String>,
        size_bytes: Option<u64>,
        status: ItemStatus,
        duration_secs: f64,
    ) -> Self {
        Self {
            source_url: source_url.into(),
            filename: filename.into(),
            size_bytes,
            size_formatted: size_bytes.map(format_bytes).unwrap_or_else(|| "Unknown".to_string()),
            status,
            duration_secs,
            error: None,
            recorded_at: Local::now(),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn record(&self, record: HistoryRecord) -> DownloadResult<()>;
}

/// 不保存任何记录
pub struct NullHistory;

#[async_trait]
impl HistorySink for NullHistory {
    async fn record(&self, _record: HistoryRecord) -> DownloadResult<()> {
        Ok(())
    }
}

/// 历史统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total_bytes: u64,
}

/// 历史查询条件：按状态过滤，按关键字在链接和文件名中搜索（不区分大小写）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryFilter {
    pub status: Option<ItemStatus>,
    pub search: Option<String>,
}

impl HistoryFilter {
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.search.as_deref().map_or(true, |s| s.trim().is_empty())
    }

    pub fn matches(&self, record: &HistoryRecord) -> bool {
        if self.status.is_some_and(|status| status != record.status) {
            return false;
        }
        match self.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(keyword) => {
                let keyword = keyword.to_lowercase();
                record.source_url.to_lowercase().contains(&keyword) || record.filename.to_lowercase().contains(&keyword)
            }
            None => true,
        }
    }
}

const CSV_HEADER: [&str; 6] = ["Date", "URL", "Filename", "Size", "Status", "Duration"];

/// 导出为 CSV，包含表头
pub fn to_csv(records: &[HistoryRecord]) -> String {
    let mut out = String::new();
    push_csv_row(&mut out, CSV_HEADER.iter().map(|s| s.to_string()));
    for record in records {
        push_csv_row(
            &mut out,
            [
                record.recorded_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                record.source_url.clone(),
                record.filename.clone(),
                record.size_formatted.clone(),
                record.status.to_string(),
                format!("{:.1}s", record.duration_secs),
            ],
        );
    }
    out
}

fn push_csv_row(out: &mut String, fields: impl IntoIterator<Item = String>) {
    let row: Vec<String> = fields.into_iter().map(|field| csv_field(&field)).collect();
    out.push_str(&row.join(","));
    out.push_str("\r\n");
}

/// 含逗号、引号或换行的字段加引号，内部引号双写
fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// 以 JSON 数组保存在单个文件中
pub struct JsonHistory {
    path: PathBuf,
    records: Mutex<Vec<HistoryRecord>>,
}

impl JsonHistory {
    /// 打开历史文件，不存在则从空开始，损坏则记日志后从空开始
    pub async fn open(path: impl Into<PathBuf>) -> DownloadResult<Self> {
        let path = path.into();
        let records = match tokio::fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => Vec::new(),
            Ok(content) => match serde_json::from_str(&content) {
                Ok(records) => records,
                Err(e) => {
                    log::warn!("历史文件格式错误，将重新开始记录: {} - {}", path.display(), e);
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(DownloadError::filesystem(format!("无法读取历史文件 {}: {}", path.display(), e))),
        };
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn entries(&self) -> Vec<HistoryRecord> {
        self.records.lock().await.clone()
    }

    /// 按条件筛选，保持记录顺序
    pub async fn query(&self, filter: &HistoryFilter) -> Vec<HistoryRecord> {
        self.entries().await.into_iter().filter(|r| filter.matches(r)).collect()
    }

    /// 把符合条件的记录导出为 CSV，返回导出的条数
    pub async fn export_csv(&self, path: impl AsRef<Path>, filter: &HistoryFilter) -> DownloadResult<usize> {
        let path = path.as_ref();
        let records = self.query(filter).await;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::filesystem(format!("无法创建导出目录 {}: {}", parent.display(), e)))?;
        }
        tokio::fs::write(path, to_csv(&records))
            .await
            .map_err(|e| DownloadError::filesystem(format!("无法写入 {}: {}", path.display(), e)))?;
        log::info!("已导出 {} 条历史记录到 {}", records.len(), path.display());
        Ok(records.len())
    }

    /// 统计只使用原始字节数
    pub async fn stats(&self) -> HistoryStats {
        let records = self.records.lock().await;
        let mut stats = HistoryStats {
            total: records.len(),
            ..Default::default()
        };
        for record in records.iter() {
            match record.status {
                ItemStatus::Completed => {
                    stats.completed += 1;
                    stats.total_bytes += record.size_bytes.unwrap_or(0);
                }
                ItemStatus::Failed => stats.failed += 1,
                ItemStatus::Cancelled => stats.cancelled += 1,
                _ => {}
            }
        }
        stats
    }

    /// 清空全部记录，返回清除的条数
    pub async fn clear(&self) -> DownloadResult<usize> {
        let mut records = self.records.lock().await;
        let removed = records.len();
        records.clear();
        save(&self.path, &records).await?;
        log::info!("已清空 {} 条下载历史", removed);
        Ok(removed)
    }
}

async fn save(path: &Path, records: &[HistoryRecord]) -> DownloadResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::filesystem(format!("无法创建历史目录 {}: {}", parent.display(), e)))?;
    }
    let json = serde_json::to_string_pretty(records)?;
    // 先写临时文件再改名，避免写到一半留下损坏的历史
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl HistorySink for JsonHistory {
    async fn record(&self, record: HistoryRecord) -> DownloadResult<()> {
        let mut records = self.records.lock().await;
        records.push(record);
        save(&self.path, &records).await
    }
}
