use chrono::Local; // 用于获取本地时间
use log::{LevelFilter, Log, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// 默认单个日志文件上限 (10 MB)
pub const DEFAULT_MAX_SIZE: u64 = 10 * 1024 * 1024;

struct LogState {
    writer: BufWriter<File>,
    current_size: u64,
}

/// 按大小轮转的文件日志
///
/// 超过 `max_size` 后当前文件改名为 `<file>.backup`，只保留一个备份。
pub struct FileLogger {
    state: Mutex<LogState>,
    level: LevelFilter,
    file_path: PathBuf,
    max_size: u64,
}

impl FileLogger {
    pub fn new(file_path: impl Into<PathBuf>, level: LevelFilter, max_size: u64) -> Result<Self, std::io::Error> {
        let file_path = file_path.into();
        // 确保日志目录存在
        if let Some(parent) = file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = open_append(&file_path)?;
        let current_size = file.metadata().map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            state: Mutex::new(LogState {
                writer: BufWriter::new(file),
                current_size,
            }),
            level,
            file_path,
            max_size,
        })
    }

    fn backup_path(&self) -> PathBuf {
        let mut name = self.file_path.as_os_str().to_owned();
        name.push(".backup");
        PathBuf::from(name)
    }

    /// 检查并执行日志轮转
    fn check_rotation(&self, state: &mut LogState) -> Result<(), std::io::Error> {
        if state.current_size > self.max_size {
            state.writer.flush()?;

            let backup_path = self.backup_path();
            if backup_path.exists() {
                std::fs::remove_file(&backup_path)?;
            }
            std::fs::rename(&self.file_path, &backup_path)?;

            state.writer = BufWriter::new(open_append(&self.file_path)?);
            state.current_size = 0;
        }
        Ok(())
    }

    fn write_entry(&self, record: &Record) -> Result<(), std::io::Error> {
        let entry = format!(
            "{} [{}] - {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            record.level(),
            record.args()
        );
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        self.check_rotation(&mut state)?;
        state.writer.write_all(entry.as_bytes())?;
        state.current_size += entry.len() as u64;
        // 警告和错误立即落盘
        if record.level() <= log::Level::Warn {
            state.writer.flush()?;
        }
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File, std::io::Error> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl Log for FileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Err(e) = self.write_entry(record) {
            eprintln!("日志写入失败: {}", e);
        }
    }

    fn flush(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let _ = state.writer.flush();
    }
}

/// 解析日志级别字符串，无法识别时用 info
pub fn parse_level(level: &str) -> LevelFilter {
    level.trim().parse().unwrap_or(LevelFilter::Info)
}

/// 安装全局日志：配置了日志文件时写文件，否则用 env_logger 输出到 stderr
pub fn init(log_file: Option<&Path>, level: &str) -> anyhow::Result<()> {
    let level = parse_level(level);
    match log_file {
        Some(path) => {
            let logger = FileLogger::new(path, level, DEFAULT_MAX_SIZE)?;
            log::set_boxed_logger(Box::new(logger))?;
            log::set_max_level(level);
        }
        None => {
            env_logger::Builder::new()
                .filter_level(level)
                .parse_default_env()
                .try_init()?;
        }
    }
    Ok(())
}
