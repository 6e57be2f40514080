use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use url::Url;

/// 同名文件编号的上限，超过后改用时间戳
const MAX_COLLISION_INDEX: u32 = 9999;

/// 清理文件名中的非法字符，防止解析器返回的名字跳出下载目录
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if (c as u32) < 32 => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let cleaned = cleaned.trim_matches('.');
    if cleaned.is_empty() {
        return "untitled".to_string();
    }
    if cleaned.len() > 255 {
        let (stem, ext) = split_extension(cleaned);
        let mut keep = 255usize.saturating_sub(ext.len());
        while !stem.is_char_boundary(keep.min(stem.len())) {
            keep -= 1;
        }
        return format!("{}{}", &stem[..keep.min(stem.len())], ext);
    }
    cleaned.to_string()
}

/// 从URL路径中取文件名，取不到时生成默认名称
pub fn filename_from_url(url: &str) -> String {
    let from_path = Url::parse(url).ok().and_then(|u| {
        u.path_segments()
            .and_then(|mut segments| segments.next_back().map(|s| s.to_string()))
            .filter(|s| !s.is_empty() && s.contains('.'))
    });
    match from_path {
        Some(name) => sanitize_filename(&name),
        None => format!("download_{}.bin", chrono::Utc::now().timestamp()),
    }
}

/// 拆成 (主名, 扩展名)，扩展名带点；隐藏文件如 ".env" 视为无扩展名
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    }
}

/// 第 n 个候选名: n=0 为原名，之后为 "name (n).ext"
pub fn candidate_name(name: &str, n: u32) -> String {
    if n == 0 {
        return name.to_string();
    }
    let (stem, ext) = split_extension(name);
    format!("{} ({}){}", stem, n, ext)
}

/// 在目录中独占创建文件，重名时追加 " (n)" 直到找到空闲名称
///
/// 使用 `create_new`，多个 worker 同时下载同名文件也不会互相覆盖。
pub async fn create_unique(dir: &Path, name: &str) -> io::Result<(PathBuf, File)> {
    let name = sanitize_filename(name);
    for n in 0..=MAX_COLLISION_INDEX {
        let path = dir.join(candidate_name(&name, n));
        match OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    let (stem, ext) = split_extension(&name);
    let path = dir.join(format!("{}_{}{}", stem, chrono::Utc::now().timestamp(), ext));
    let file = OpenOptions::new().write(true).create_new(true).open(&path).await?;
    Ok((path, file))
}

/// 删除残留的部分文件，文件不存在不算错误
pub async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => log::debug!("已删除部分文件: {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log::error!("删除部分文件失败: {} - {}", path.display(), e),
    }
}
