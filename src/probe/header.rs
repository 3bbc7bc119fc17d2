//! 响应头探测：重新请求页面地址读取响应头，用于识别托管平台
use std::time::Duration;

use reqwest::header::CACHE_CONTROL;
use reqwest::Client;
use tracing::{debug, warn};
use url::Url;

use crate::config::DetectionSettings;
use crate::evidence::{NetworkRequest, RequestKind};
use crate::utils::HeaderConverter;

/// 响应头探测器
#[derive(Debug, Clone)]
pub struct HeaderProbe {
    client: Client,
    timeout: Duration,
}

impl HeaderProbe {
    pub fn new(client: Client, settings: &DetectionSettings) -> Self {
        Self {
            client,
            timeout: settings.header_detection_timeout(),
        }
    }

    /// 请求页面并返回带响应头的文档请求；超时或失败返回 None
    pub async fn probe(&self, url: &Url) -> Option<NetworkRequest> {
        if !matches!(url.scheme(), "http" | "https") {
            debug!("跳过响应头探测，非 HTTP 地址：{}", url);
            return None;
        }

        let request = self
            .client
            .get(url.clone())
            .header(CACHE_CONTROL, "no-store")
            .send();
        let response = match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!("响应头探测失败：{}，{}", url, e);
                return None;
            }
            Err(_) => {
                warn!("响应头探测超时（{:?}）：{}", self.timeout, url);
                return None;
            }
        };

        let headers = HeaderConverter::to_multimap(response.headers());
        debug!("响应头探测完成：{}，状态码 {}，{}个响应头", url, response.status(), headers.len());
        Some(NetworkRequest::new(RequestKind::Document, url.as_str()).with_response_headers(headers))
    }
}
