use anyhow::Result;
use url::Url;

pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 10;
pub const MIN_CHUNK_SIZE: usize = 1024;
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// 只接受带主机名的 http/https 链接
pub fn is_valid_url(url: &str) -> bool {
    match Url::parse(url.trim()) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some(),
        Err(_) => false,
    }
}

pub fn validate_concurrency(workers: usize) -> Result<()> {
    if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&workers) {
        anyhow::bail!("并发数必须在 {} 到 {} 之间", MIN_CONCURRENCY, MAX_CONCURRENCY);
    }
    Ok(())
}

pub fn validate_timeout(secs: u64) -> Result<()> {
    if !(1..=600).contains(&secs) {
        anyhow::bail!("超时时间必须在 1 到 600 秒之间");
    }
    Ok(())
}

pub fn validate_chunk_size(size: usize) -> Result<()> {
    if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&size) {
        anyhow::bail!("分块大小必须在 1KB 到 1MB 之间");
    }
    Ok(())
}

pub fn validate_urls(urls: &[String]) -> Result<()> {
    if urls.is_empty() {
        anyhow::bail!("未提供任何链接，请通过命令行参数或文件提供至少一个链接");
    }
    if let Some(bad) = urls.iter().find(|u| !is_valid_url(u)) {
        anyhow::bail!("不是有效的 http/https 链接: {}", bad);
    }
    Ok(())
}
