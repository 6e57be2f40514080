//! Core: 下载队列、worker 池、解析器、进度和历史等核心逻辑模块

pub mod error;
pub mod history;
pub mod item;
pub mod pool;
pub mod progress;
pub mod queue;
pub mod resolver;
pub mod retry;
pub mod worker;
pub mod writer;

// 只导出主流程和其它模块实际用到的类型
pub use error::{DownloadError, DownloadResult, FailureReason};
pub use history::{HistoryFilter, HistoryRecord, HistorySink, HistoryStats, JsonHistory, NullHistory};
pub use item::{DownloadItem, ItemId, ItemStatus, ResolvedInfo};
pub use pool::{DownloadPool, FinishedItem, PoolConfig, PoolStatus};
pub use progress::{ChannelReporter, LogReporter, NoopReporter, ProgressEvent, ProgressReporter};
pub use queue::RemoveOutcome;
pub use resolver::{ApiResolver, DirectResolver, Resolver};
pub use retry::RetryStrategy;
