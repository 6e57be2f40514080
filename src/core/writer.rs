use bytes::BytesMut;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use super::error::DownloadError;

/// 写缓冲管理器
///
/// 攒够 `buffer_size` 再落盘，减少小块写入次数。
pub struct ChunkWriter {
    buffer: BytesMut,
    buffer_size: usize,
    file_handle: File,
    path: PathBuf,
    total_written: u64,
}

impl ChunkWriter {
    pub fn new(file_handle: File, path: PathBuf, buffer_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(buffer_size),
            buffer_size,
            file_handle,
            path,
            total_written: 0,
        }
    }

    /// 向缓冲区写入数据，满了就刷盘
    pub async fn write(&mut self, data: &[u8]) -> Result<(), DownloadError> {
        self.buffer.extend_from_slice(data);
        if self.buffer.len() >= self.buffer_size {
            self.flush().await?;
        }
        Ok(())
    }

    /// 把缓冲区内容写入文件
    pub async fn flush(&mut self) -> Result<(), DownloadError> {
        if !self.buffer.is_empty() {
            self.file_handle
                .write_all(&self.buffer)
                .await
                .map_err(|e| DownloadError::filesystem(format!("写入 {} 失败: {}", self.path.display(), e)))?;
            self.total_written += self.buffer.len() as u64;
            self.buffer.clear();
        }
        Ok(())
    }

    /// 刷入剩余数据并同步到磁盘，返回总写入字节数
    pub async fn finish(mut self) -> Result<u64, DownloadError> {
        self.flush().await?;
        self.file_handle
            .flush()
            .await
            .map_err(|e| DownloadError::filesystem(format!("刷新 {} 失败: {}", self.path.display(), e)))?;
        self.file_handle
            .sync_all()
            .await
            .map_err(|e| DownloadError::filesystem(format!("同步 {} 失败: {}", self.path.display(), e)))?;
        Ok(self.total_written)
    }
}
