use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::core::item::{ItemId, ItemStatus};
use crate::core::progress::{ProgressEvent, ProgressReporter};

const BAR_TEMPLATE: &str = "{prefix:.bold} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {msg}";
const SPINNER_TEMPLATE: &str = "{prefix:.bold} {spinner} {bytes} {msg}";

// 结构体：ProgressManager
// 每个下载项一个进度条，总大小未知时显示为转圈
pub struct ProgressManager {
    multi: MultiProgress,
    hidden: bool,
    bars: Mutex<HashMap<ItemId, ProgressBar>>,
    labels: Mutex<HashMap<ItemId, String>>,
}

impl Default for ProgressManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressManager {
    pub fn new() -> Self {
        Self::with_draw_target(ProgressDrawTarget::stderr(), false)
    }

    /// 不绘制进度条，用于非交互环境和测试
    pub fn hidden() -> Self {
        Self::with_draw_target(ProgressDrawTarget::hidden(), true)
    }

    fn with_draw_target(target: ProgressDrawTarget, hidden: bool) -> Self {
        ProgressManager {
            multi: MultiProgress::with_draw_target(target),
            hidden,
            bars: Mutex::new(HashMap::new()),
            labels: Mutex::new(HashMap::new()),
        }
    }

    fn bars(&self) -> MutexGuard<'_, HashMap<ItemId, ProgressBar>> {
        self.bars.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 设置进度条前缀，通常是链接或文件名
    pub fn set_label(&self, id: ItemId, label: impl Into<String>) {
        let label = label.into();
        if let Some(pb) = self.bars().get(&id) {
            pb.set_prefix(label.clone());
        }
        self.labels.lock().unwrap_or_else(|e| e.into_inner()).insert(id, label);
    }

    /// 在进度条上方打印一行，不会打乱进度条
    pub fn println(&self, message: impl AsRef<str>) {
        if self.hidden {
            println!("{}", message.as_ref());
        } else {
            let _ = self.multi.println(message);
        }
    }

    fn bar_for(&self, id: ItemId) -> ProgressBar {
        let mut bars = self.bars();
        if let Some(pb) = bars.get(&id) {
            return pb.clone();
        }
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(spinner_style());
        let label = self
            .labels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
            .unwrap_or_else(|| id.to_string());
        pb.set_prefix(label);
        bars.insert(id, pb.clone());
        pb
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template(SPINNER_TEMPLATE).unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

fn status_message(event: &ProgressEvent) -> String {
    match event.status {
        ItemStatus::Downloading => {
            let mut parts = Vec::new();
            if let Some(p) = event.percent {
                parts.push(format!("{:.0}%", p));
            }
            if let Some(speed) = &event.throughput_formatted {
                parts.push(speed.clone());
            }
            if let Some(eta) = &event.eta_formatted {
                parts.push(format!("ETA:{}", eta));
            }
            parts.join(" | ")
        }
        ItemStatus::Pending => "等待中".to_string(),
        ItemStatus::Resolving => "解析中".to_string(),
        ItemStatus::Paused => "已暂停".to_string(),
        ItemStatus::Completed => "✓ 完成".to_string(),
        ItemStatus::Failed => format!("✗ 失败: {}", event.error.as_deref().unwrap_or("未知错误")),
        ItemStatus::Cancelled => "已取消".to_string(),
    }
}

impl ProgressReporter for ProgressManager {
    fn on_progress(&self, id: ItemId, event: &ProgressEvent) {
        let pb = self.bar_for(id);
        // 知道总大小后切换成进度条
        if let Some(total) = event.total_bytes.filter(|t| *t > 0) {
            if pb.length() != Some(total) {
                pb.set_length(total);
                pb.set_style(bar_style());
            }
        }
        pb.set_position(event.downloaded_bytes);
        let message = status_message(event);
        if event.status.is_terminal() {
            pb.finish_with_message(message);
        } else {
            if event.status == ItemStatus::Downloading {
                pb.tick();
            }
            pb.set_message(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracks_progress_per_item() {
        let manager = ProgressManager::hidden();
        let id = ItemId::new();
        manager.set_label(id, "report.pdf");

        let position = |id: ItemId| manager.bars().get(&id).map(|pb| pb.position());

        manager.on_progress(id, &ProgressEvent::status_only(ItemStatus::Pending, 0, None));
        assert_eq!(position(id), Some(0));

        manager.on_progress(id, &ProgressEvent::status_only(ItemStatus::Downloading, 4096, Some(8192)));
        assert_eq!(position(id), Some(4096));
        assert_eq!(manager.bars()[&id].length(), Some(8192));

        manager.on_progress(id, &ProgressEvent::status_only(ItemStatus::Completed, 8192, Some(8192)));
        assert_eq!(position(id), Some(8192));
        assert_eq!(position(ItemId::new()), None);
    }

    #[test]
    fn test_status_messages() {
        let failed = ProgressEvent::status_only(ItemStatus::Failed, 0, None).with_error("NetworkError: 超时");
        assert_eq!(status_message(&failed), "✗ 失败: NetworkError: 超时");

        let mut downloading = ProgressEvent::status_only(ItemStatus::Downloading, 512, Some(1024));
        downloading.throughput_formatted = Some("1.0 KB/s".into());
        assert_eq!(status_message(&downloading), "50% | 1.0 KB/s");
    }
}
