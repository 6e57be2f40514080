//! 工具函数：格式化、文件名处理、参数校验和日志

pub mod files;
pub mod format;
pub mod logger;
pub mod validator;
