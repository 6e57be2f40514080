use thiserror::Error;
use serde::{Serialize, Deserialize};
use std::fmt;
use std::io;

/// 单个下载项的终止原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    ResolutionFailed,
    NetworkError,
    FilesystemError,
    Cancelled,
}

impl FailureReason {
    /// 只有网络类失败值得调用方重新入队
    pub fn is_retryable(self) -> bool {
        self == FailureReason::NetworkError
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::ResolutionFailed => "ResolutionFailed",
            FailureReason::NetworkError => "NetworkError",
            FailureReason::FilesystemError => "FilesystemError",
            FailureReason::Cancelled => "Cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("链接解析失败: {0}")]
    ResolutionFailed(String),

    #[error("网络错误: {0}")]
    NetworkError(String),

    #[error("请求超时")]
    Timeout,

    #[error("服务器返回非成功状态码: {0}")]
    HttpStatus(u16),

    #[error("文件系统错误: {0}")]
    FilesystemError(String),

    #[error("下载被取消")]
    Cancelled,

    #[error("下载队列已关闭")]
    QueueClosed,

    #[error("下载池已在运行")]
    AlreadyRunning,

    #[error("无效的URL: {0}")]
    InvalidUrl(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("IO错误: {0}")]
    Io(#[from] io::Error),

    #[error("JSON错误: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for DownloadError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DownloadError::Timeout
        } else if let Some(status) = e.status() {
            DownloadError::HttpStatus(status.as_u16())
        } else {
            DownloadError::NetworkError(e.to_string())
        }
    }
}

impl DownloadError {
    /// 折叠为下载项可见的四类终止原因
    pub fn reason(&self) -> FailureReason {
        match self {
            DownloadError::ResolutionFailed(_) | DownloadError::InvalidUrl(_) => {
                FailureReason::ResolutionFailed
            }
            DownloadError::NetworkError(_)
            | DownloadError::Timeout
            | DownloadError::HttpStatus(_) => FailureReason::NetworkError,
            DownloadError::Cancelled => FailureReason::Cancelled,
            DownloadError::FilesystemError(_)
            | DownloadError::Io(_)
            | DownloadError::Json(_)
            | DownloadError::Config(_)
            | DownloadError::QueueClosed
            | DownloadError::AlreadyRunning => FailureReason::FilesystemError,
        }
    }

    pub fn filesystem(e: impl fmt::Display) -> Self {
        DownloadError::FilesystemError(e.to_string())
    }

    pub fn resolution(e: impl fmt::Display) -> Self {
        DownloadError::ResolutionFailed(e.to_string())
    }
}

pub type DownloadResult<T> = Result<T, DownloadError>;
