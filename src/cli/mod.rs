//! CLI: 命令行接口和参数解析模块
//!
//! ## 主要功能
//!
//! - 命令行参数解析
//! - 配置文件路径管理（默认 `~/.sharedown/config.toml`）
//! - URL 列表处理（命令行参数和文件）
//! - 配置文件编辑器集成
//!
//! ## 支持的命令
//!
//! - 直链下载：`sharedown <url>`
//! - 批量下载：`sharedown -f urls.txt`
//! - 解析分享链接：`sharedown -r <接口地址> <分享链接>`
//! - 编辑配置：`sharedown -e`
//! - 查看历史：`sharedown --show-history [--status failed] [--search 关键字]`
//! - 导出历史：`sharedown --export-history history.csv`
//! - 清空历史：`sharedown --clear-history`

use clap::{Parser, ValueEnum};
use std::path::Path;

use crate::config::{app_dir, Config};
use crate::core::error::{DownloadError, DownloadResult};
use crate::core::history::HistoryFilter;
use crate::core::item::ItemStatus;
use crate::utils::validator;

/// 默认配置文件路径
pub fn default_config_path() -> String {
    app_dir().join("config.toml").display().to_string()
}

/// 打开配置文件编辑器
pub fn open_config_in_editor(config_path: &str) {
    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("notepad").arg(config_path).status().ok();
    }
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open").arg("-e").arg(config_path).status().ok();
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        // 优先 $EDITOR，否则 xdg-open，最后 nano
        let editor = std::env::var("EDITOR").ok().filter(|e| !e.trim().is_empty());
        let opened = match editor {
            Some(editor) => std::process::Command::new(editor).arg(config_path).status().is_ok(),
            None => std::process::Command::new("xdg-open").arg(config_path).status().is_ok(),
        };
        if !opened {
            let _ = std::process::Command::new("nano").arg(config_path).status();
        }
    }
}

/// 历史记录的状态过滤
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    Completed,
    Failed,
    Cancelled,
}

impl From<StatusFilter> for ItemStatus {
    fn from(filter: StatusFilter) -> Self {
        match filter {
            StatusFilter::Completed => ItemStatus::Completed,
            StatusFilter::Failed => ItemStatus::Failed,
            StatusFilter::Cancelled => ItemStatus::Cancelled,
        }
    }
}

/// sharedown 命令行参数
///
/// 示例用法：
///   sharedown https://example.com/file.zip
///   sharedown -e  # 编辑配置文件
///   sharedown -r https://api.example.com/resolve https://share.example.com/s/1abc
///
/// 更多用法请加 --help 查看
#[derive(Parser, Debug, Clone)]
#[command(
    name = "sharedown",
    author = "panzhifu",
    version = env!("CARGO_PKG_VERSION"),
    about = "一个用 Rust 编写的分享链接下载队列工具",
    long_about = "把分享链接解析成直链后排队下载，支持并发、暂停/恢复、取消和下载历史。\n\n示例：\n  sharedown https://example.com/file.zip\n  sharedown -j 4 -f urls.txt\n  sharedown -r https://api.example.com/resolve https://share.example.com/s/1abc\n  sharedown --show-history\n"
)]
pub struct Args {
    /// 要下载的链接列表（可同时指定多个）
    #[arg(required = false, help = "要下载的分享链接或直链，可以同时指定多个。")]
    pub urls: Vec<String>,

    /// 包含链接列表的文件路径
    #[arg(short, long, help = "包含链接列表的文件路径，每行一个，# 开头为注释。")]
    pub file: Option<String>,

    /// 配置文件路径
    #[arg(short = 'c', long, default_value_t = default_config_path(), help = "配置文件路径。")]
    pub config: String,

    /// 编辑配置文件（-e 或 --edit）
    #[arg(short = 'e', long = "edit", help = "用系统默认编辑器打开配置文件并退出。")]
    pub edit_config: bool,

    /// 指定下载目录
    #[arg(long, short = 'd', help = "指定下载目录，覆盖配置文件中的设置。")]
    pub download_dir: Option<String>,

    /// 同时下载的数量
    #[arg(long, short = 'j', help = "同时下载的数量 (1-10)，覆盖配置文件中的设置。")]
    pub concurrent: Option<usize>,

    /// 超时时间（秒）
    #[arg(long, short = 't', help = "连接和读取超时（秒），覆盖配置文件中的设置。")]
    pub timeout: Option<u64>,

    /// 解析接口地址
    #[arg(long, short = 'r', help = "分享链接解析接口地址，留空则把链接当作直链。")]
    pub resolver: Option<String>,

    /// 历史文件路径
    #[arg(long, help = "下载历史文件路径。")]
    pub history: Option<String>,

    /// 显示历史统计后退出
    #[arg(long, help = "显示下载历史统计并退出。")]
    pub show_history: bool,

    /// 不记录历史
    #[arg(long, conflicts_with = "history", help = "本次运行不记录下载历史。")]
    pub no_history: bool,

    /// 导出历史为 CSV
    #[arg(long, value_name = "FILE", help = "把下载历史导出为 CSV 文件并退出，可配合 --status 和 --search。")]
    pub export_history: Option<String>,

    /// 清空历史
    #[arg(long, conflicts_with_all = ["show_history", "export_history"], help = "清空下载历史并退出，执行前会要求确认。")]
    pub clear_history: bool,

    /// 跳过确认
    #[arg(short = 'y', long, requires = "clear_history", help = "清空历史时不再确认。")]
    pub yes: bool,

    /// 按状态过滤历史
    #[arg(long, value_enum, help = "只显示或导出该状态的历史记录。")]
    pub status: Option<StatusFilter>,

    /// 按关键字搜索历史
    #[arg(long, value_name = "KEYWORD", help = "只显示或导出链接或文件名中包含该关键字的历史记录。")]
    pub search: Option<String>,
}

impl Args {
    /// 加载配置（不存在则创建），合并命令行参数并校验
    ///
    /// 配置文件格式错误时使用默认配置，并把警告一起返回。
    pub fn load_config(&self) -> DownloadResult<(Config, Option<String>)> {
        let (mut config, warning) = Config::load_checked(&self.config)?;
        config.merge_from_args(self);
        config.validate()?;
        Ok((config, warning))
    }

    /// 是否是历史相关的命令（查看、导出、清空），这些命令不下载
    pub fn is_history_command(&self) -> bool {
        self.show_history || self.export_history.is_some() || self.clear_history
    }

    pub fn history_filter(&self) -> HistoryFilter {
        HistoryFilter {
            status: self.status.map(ItemStatus::from),
            search: self.search.clone(),
        }
    }

    /// 合并命令行和文件中的链接，忽略空行和注释
    pub fn get_urls(&self) -> DownloadResult<Vec<String>> {
        let mut urls = Vec::new();
        urls.extend(self.urls.iter().map(|u| u.trim().to_string()));

        if let Some(file_path) = &self.file {
            if !Path::new(file_path).exists() {
                return Err(DownloadError::Config(format!("链接文件不存在: {}", file_path)));
            }
            let content = std::fs::read_to_string(file_path)
                .map_err(|e| DownloadError::Config(format!("无法读取链接文件: {}", e)))?;
            urls.extend(
                content
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty() && !line.starts_with('#'))
                    .map(str::to_string),
            );
        }

        validator::validate_urls(&urls).map_err(|e| DownloadError::InvalidUrl(e.to_string()))?;
        Ok(urls)
    }
}
