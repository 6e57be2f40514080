mod progress;

use std::fmt;
use std::time::Duration;

pub use progress::ProgressManager;

use crate::core::history::{HistoryRecord, HistoryStats};
use crate::core::pool::FinishedItem;
use crate::utils::format::{format_bytes, format_duration};

pub fn print_success(message: &str) {
    println!("✓ {}", message);
}

pub fn print_error(message: &str) {
    println!("✗ {}", message);
}

/// 一次运行结束后的摘要
pub struct DownloadSummary {
    pub total_files: usize,
    pub total_size: u64,
    pub elapsed_time: Duration,
    pub success_count: usize,
    pub failed: Vec<FinishedItem>,
    pub cancelled_count: usize,
}

impl DownloadSummary {
    pub fn new(
        completed: &[FinishedItem],
        failed: Vec<FinishedItem>,
        cancelled: &[FinishedItem],
        elapsed_time: Duration,
    ) -> Self {
        Self {
            total_files: completed.len() + failed.len() + cancelled.len(),
            total_size: completed.iter().map(|i| i.downloaded_bytes).sum(),
            elapsed_time,
            success_count: completed.len(),
            failed,
            cancelled_count: cancelled.len(),
        }
    }
}

impl fmt::Display for DownloadSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n下载摘要:")?;
        writeln!(f, "总文件数: {}", self.total_files)?;
        writeln!(f, "总大小: {}", format_bytes(self.total_size))?;
        writeln!(f, "耗时: {}", format_duration(self.elapsed_time))?;
        writeln!(f, "成功: {}", self.success_count)?;
        writeln!(f, "失败: {}", self.failed.len())?;
        writeln!(f, "取消: {}", self.cancelled_count)?;
        for item in &self.failed {
            let reason = item.reason.map(|r| r.to_string()).unwrap_or_default();
            writeln!(f, "  ✗ {} [{}] {}", item.source_url, reason, item.error.as_deref().unwrap_or(""))?;
        }
        Ok(())
    }
}

/// 历史统计的展示
pub struct HistoryReport<'a>(pub &'a HistoryStats);

impl fmt::Display for HistoryReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.0;
        writeln!(f, "下载历史:")?;
        writeln!(f, "记录总数: {}", stats.total)?;
        writeln!(f, "完成: {}", stats.completed)?;
        writeln!(f, "失败: {}", stats.failed)?;
        writeln!(f, "取消: {}", stats.cancelled)?;
        writeln!(f, "已下载: {}", format_bytes(stats.total_bytes))
    }
}

/// 历史记录列表，每条一行
pub struct HistoryTable<'a>(pub &'a [HistoryRecord]);

impl fmt::Display for HistoryTable<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return writeln!(f, "没有符合条件的记录");
        }
        for record in self.0 {
            writeln!(
                f,
                "{}  {:<9} {:>10} {:>7.1}s  {}",
                record.recorded_at.format("%Y-%m-%d %H:%M"),
                record.status.to_string(),
                record.size_formatted,
                record.duration_secs,
                record.filename
            )?;
            writeln!(f, "    {}", record.source_url)?;
            if let Some(error) = &record.error {
                writeln!(f, "    ✗ {}", error)?;
            }
        }
        Ok(())
    }
}
