use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::error::{DownloadError, DownloadResult};
use crate::core::pool::PoolConfig;
use crate::utils::validator;

/// 应用数据目录 `~/.sharedown`
pub fn app_dir() -> PathBuf {
    let home = std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(".sharedown")
}

/// 配置结构体，缺失的键用默认值补齐
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// 下载目录
    pub download_dir: String,
    /// 同时下载的数量 (1-10)
    pub max_concurrent: usize,
    /// 连接和读取超时（秒）
    pub timeout_secs: u64,
    /// 网络错误的重试次数，只由命令行工具使用
    pub retry_attempts: u32,
    /// 每次写入的块大小（字节）
    pub chunk_size: usize,
    /// 进度上报最小间隔（毫秒）
    pub progress_interval_ms: u64,
    /// User-Agent
    pub user_agent: String,
    /// 解析接口地址，留空表示链接本身就是直链
    pub resolver_endpoint: String,
    /// 主接口失败后依次尝试的备用接口
    pub resolver_backup_endpoints: Vec<String>,
    /// 历史文件，留空表示不记录
    pub history_file: String,
    /// 日志文件，留空表示输出到终端
    pub log_file: String,
    /// 日志级别: error / warn / info / debug / trace
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: "./downloads".to_string(),
            max_concurrent: 2,
            timeout_secs: 120,
            retry_attempts: 2,
            chunk_size: 64 * 1024,
            progress_interval_ms: 500,
            user_agent: format!("sharedown/{}", env!("CARGO_PKG_VERSION")),
            resolver_endpoint: String::new(),
            resolver_backup_endpoints: Vec::new(),
            history_file: app_dir().join("history.json").display().to_string(),
            log_file: String::new(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// 加载配置文件：不存在则写入默认配置，格式错误则警告后使用默认配置
    pub fn load(path: impl AsRef<Path>) -> DownloadResult<Self> {
        let (config, warning) = Self::load_checked(path)?;
        if let Some(warning) = warning {
            eprintln!("警告: {}", warning);
        }
        Ok(config)
    }

    /// 同 `load`，格式错误时把警告交给调用方，日志系统初始化后再输出
    pub fn load_checked(path: impl AsRef<Path>) -> DownloadResult<(Self, Option<String>)> {
        let path = path.as_ref();
        if !path.exists() {
            let config = Config::default();
            config.save_with_tutorial(path)?;
            return Ok((config, None));
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| DownloadError::Config(format!("无法读取配置文件 {}: {}", path.display(), e)))?;
        match toml::from_str(&content) {
            Ok(config) => Ok((config, None)),
            Err(e) => Ok((
                Config::default(),
                Some(format!("配置文件 {} 格式错误: {}，将使用默认配置", path.display(), e)),
            )),
        }
    }

    /// 保存带教程的配置文件（唯一写入方法）
    pub fn save_with_tutorial(&self, path: impl AsRef<Path>) -> DownloadResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| DownloadError::Config(format!("无法创建配置目录: {}", e)))?;
        }
        let config_content = toml::to_string_pretty(self)
            .map_err(|e| DownloadError::Config(format!("无法序列化配置: {}", e)))?;
        let full_content = format!("{}\n{}", TUTORIAL, config_content);
        std::fs::write(path, full_content)
            .map_err(|e| DownloadError::Config(format!("无法写入配置文件 {}: {}", path.display(), e)))?;
        Ok(())
    }

    /// 校验配置合法性
    pub fn validate(&self) -> DownloadResult<()> {
        let invalid = |e: anyhow::Error| DownloadError::Config(e.to_string());

        if self.download_dir.trim().is_empty() {
            return Err(DownloadError::Config("下载目录不能为空".to_string()));
        }
        validator::validate_concurrency(self.max_concurrent).map_err(invalid)?;
        validator::validate_timeout(self.timeout_secs).map_err(invalid)?;
        if self.retry_attempts > 10 {
            return Err(DownloadError::Config("重试次数必须在 0 到 10 之间".to_string()));
        }
        validator::validate_chunk_size(self.chunk_size).map_err(invalid)?;
        if !self.resolver_endpoint.is_empty() && !validator::is_valid_url(&self.resolver_endpoint) {
            return Err(DownloadError::Config(format!("解析接口地址无效: {}", self.resolver_endpoint)));
        }
        if let Some(bad) = self.resolver_backup_endpoints.iter().find(|e| !validator::is_valid_url(e)) {
            return Err(DownloadError::Config(format!("备用解析接口地址无效: {}", bad)));
        }
        Ok(())
    }

    /// 按尝试顺序排列的解析接口；为空表示链接本身就是直链
    pub fn resolver_endpoints(&self) -> Vec<String> {
        let primary = self.resolver_endpoint.trim();
        if primary.is_empty() {
            return Vec::new();
        }
        let mut endpoints = vec![primary.to_string()];
        for backup in &self.resolver_backup_endpoints {
            if !endpoints.contains(backup) {
                endpoints.push(backup.clone());
            }
        }
        endpoints
    }

    /// 合并命令行参数到配置，命令行优先
    pub fn merge_from_args(&mut self, args: &crate::cli::Args) {
        if let Some(dir) = &args.download_dir {
            self.download_dir = dir.clone();
        }
        if let Some(concurrent) = args.concurrent {
            self.max_concurrent = concurrent;
        }
        if let Some(timeout) = args.timeout {
            self.timeout_secs = timeout;
        }
        if let Some(endpoint) = &args.resolver {
            self.resolver_endpoint = endpoint.clone();
        }
        if let Some(history) = &args.history {
            self.history_file = history.clone();
        }
        if args.no_history {
            self.history_file.clear();
        }
    }

    pub fn history_path(&self) -> Option<PathBuf> {
        non_empty_path(&self.history_file)
    }

    pub fn log_path(&self) -> Option<PathBuf> {
        non_empty_path(&self.log_file)
    }

    /// 获取配置摘要信息
    pub fn get_summary(&self) -> String {
        format!(
            "配置摘要:\n\
            - 下载目录: {}\n\
            - 并发数: {}\n\
            - 超时时间: {} 秒\n\
            - 重试次数: {}\n\
            - 解析接口: {}\n\
            - 备用接口: {} 个\n\
            - 历史记录: {}",
            self.download_dir,
            self.max_concurrent,
            self.timeout_secs,
            self.retry_attempts,
            if self.resolver_endpoint.is_empty() { "无（直链）" } else { self.resolver_endpoint.as_str() },
            self.resolver_backup_endpoints.len(),
            if self.history_file.is_empty() { "不记录" } else { self.history_file.as_str() },
        )
    }
}

fn non_empty_path(value: &str) -> Option<PathBuf> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(PathBuf::from(value))
    }
}

impl From<&Config> for PoolConfig {
    fn from(config: &Config) -> Self {
        PoolConfig {
            download_dir: PathBuf::from(&config.download_dir),
            max_concurrent: config.max_concurrent,
            timeout: Duration::from_secs(config.timeout_secs),
            retry_attempts: config.retry_attempts,
            chunk_size: config.chunk_size,
            progress_interval: Duration::from_millis(config.progress_interval_ms),
            user_agent: config.user_agent.clone(),
        }
    }
}

const TUTORIAL: &str = r#"# sharedown 配置文件
# ====================
#
# 这是一个 TOML 格式的配置文件。修改后保存即可，下次启动生效。
# 缺少的配置项会自动使用默认值。
#
# 命令行参数会覆盖配置文件中的设置，优先级：命令行 > 配置文件 > 默认值
#
# 使用示例：
#   sharedown https://example.com/file.zip                 # 直链下载
#   sharedown -r https://api.example.com/resolve <分享链接>  # 通过解析接口下载
#   sharedown -j 4 -f urls.txt                             # 4 个并发，批量下载
#   sharedown --show-history                               # 查看下载历史统计
#
# 下载时的按键：p 暂停，r 恢复，c 取消全部，q 退出
#
# ==================== 配置项说明 ====================
#
# download_dir          下载目录，支持相对路径和绝对路径
# max_concurrent        同时下载的数量，1-10
# timeout_secs          连接和读取超时（秒），1-600
# retry_attempts        网络错误时的重试次数，0-10
# chunk_size            每次写入的块大小（字节），1024-1048576
# progress_interval_ms  进度刷新的最小间隔（毫秒）
# user_agent            请求使用的 User-Agent
# resolver_endpoint     解析接口，请求格式 GET <地址>?url=<分享链接>，留空表示直链
# resolver_backup_endpoints  备用解析接口列表，主接口失败时按顺序尝试，
#                       例如 ["https://backup1.example.com/api", "https://backup2.example.com/api"]
# history_file          历史文件路径，留空表示不记录
# log_file              日志文件路径，留空表示输出到终端
# log_level             日志级别：error / warn / info / debug / trace
#
# ==================== 故障排除 ====================
#
# 问题：经常超时失败
# 解决：增加 timeout_secs 或 retry_attempts
#
# 问题：提示解析失败
# 解决：检查 resolver_endpoint 是否可用，或确认链接本身是否为直链
"#;
