//! sharedown: 分享链接下载队列
//!
//! 把分享链接（或直链）交给可替换的解析器换成直链，再由固定数量的 worker
//! 从先进先出队列中取任务下载。支持整池暂停/恢复、取消、限频进度上报、
//! 重名文件自动编号和下载历史记录。

pub mod cli;
pub mod config;
pub mod core;
pub mod ui;
pub mod utils;

pub use crate::core::{
    DownloadError, DownloadItem, DownloadPool, DownloadResult, ItemId, ItemStatus, PoolConfig,
};
