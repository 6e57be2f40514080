//! 分享链接解析
//!
//! 下载池只依赖 `Resolver` 的契约：给一个分享链接，返回直链、文件名和可选大小。
//! 任何失败在 worker 里都统一记为 `ResolutionFailed`。

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use super::error::{DownloadError, DownloadResult};
use super::item::ResolvedInfo;
use crate::utils::files::filename_from_url;

const URL_FIELDS: [&str; 5] = ["download_url", "url", "direct_url", "link", "dlink"];
const NAME_FIELDS: [&str; 4] = ["filename", "name", "title", "server_filename"];
const SIZE_FIELDS: [&str; 3] = ["size", "file_size", "filesize"];

#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, share_url: &str) -> DownloadResult<ResolvedInfo>;
}

/// 链接本身就是直链
pub struct DirectResolver;

#[async_trait]
impl Resolver for DirectResolver {
    async fn resolve(&self, share_url: &str) -> DownloadResult<ResolvedInfo> {
        let parsed = Url::parse(share_url).map_err(|e| DownloadError::InvalidUrl(format!("{}: {}", share_url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DownloadError::InvalidUrl(format!("只支持 HTTP 和 HTTPS 协议: {}", share_url)));
        }
        Ok(ResolvedInfo {
            download_url: share_url.to_string(),
            filename: filename_from_url(share_url),
            size_bytes: None,
        })
    }
}

/// 通过第三方 JSON 接口换取直链: `GET <endpoint>?url=<分享链接>`
///
/// 按顺序尝试每个接口，第一个成功的结果生效；全部失败时返回最后一个错误。
pub struct ApiResolver {
    client: Client,
    endpoints: Vec<String>,
}

impl ApiResolver {
    pub fn new<I, S>(endpoints: I, timeout: Duration, user_agent: &str) -> DownloadResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let endpoints: Vec<String> = endpoints
            .into_iter()
            .map(Into::into)
            .filter(|e: &String| !e.trim().is_empty())
            .collect();
        if endpoints.is_empty() {
            return Err(DownloadError::Config("至少需要一个解析接口".to_string()));
        }
        let client = Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| DownloadError::Config(format!("无法创建HTTP客户端: {}", e)))?;
        Ok(Self { client, endpoints })
    }

    async fn try_endpoint(&self, endpoint: &str, share_url: &str) -> DownloadResult<ResolvedInfo> {
        let response = self
            .client
            .get(endpoint)
            .query(&[("url", share_url)])
            .send()
            .await
            .map_err(|e| DownloadError::resolution(format!("接口请求失败: {}", e)))?;
        if !response.status().is_success() {
            return Err(DownloadError::resolution(format!("接口返回状态码 {}", response.status())));
        }
        let body = response
            .text()
            .await
            .map_err(|e| DownloadError::resolution(format!("读取接口响应失败: {}", e)))?;
        let value: Value = serde_json::from_str(&body)
            .map_err(|e| DownloadError::resolution(format!("接口响应不是JSON: {}", e)))?;
        parse_api_response(&value)
            .ok_or_else(|| DownloadError::resolution(format!("接口响应中没有可识别的下载链接: {}", share_url)))
    }
}

#[async_trait]
impl Resolver for ApiResolver {
    async fn resolve(&self, share_url: &str) -> DownloadResult<ResolvedInfo> {
        let mut last_error = None;
        for endpoint in &self.endpoints {
            match self.try_endpoint(endpoint, share_url).await {
                Ok(info) => return Ok(info),
                Err(e) => {
                    log::warn!("解析接口 {} 失败: {}", endpoint, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| DownloadError::resolution("没有可用的解析接口")))
    }
}

/// 按候选字段名提取直链信息，数组取第一个元素
pub fn parse_api_response(value: &Value) -> Option<ResolvedInfo> {
    let obj = match value {
        Value::Array(items) => return items.first().and_then(parse_api_response),
        Value::Object(obj) => obj,
        _ => return None,
    };

    let first_str = |fields: &[&str]| {
        fields.iter().find_map(|f| {
            obj.get(*f)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
    };

    let download_url = first_str(&URL_FIELDS[..])?;
    let filename = first_str(&NAME_FIELDS[..]).unwrap_or_else(|| filename_from_url(&download_url));
    let size_bytes = SIZE_FIELDS.iter().find_map(|f| obj.get(*f).and_then(parse_size));

    Some(ResolvedInfo {
        download_url,
        filename,
        size_bytes,
    })
}

/// 只接受原始字节数（数字或纯数字字符串），"10.5 MB" 这类格式化字符串视为未知
fn parse_size(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().filter(|n| *n > 0),
        Value::String(s) => s.trim().parse::<u64>().ok().filter(|n| *n > 0),
        _ => None,
    }
}
