//! 脚本分块扫描：拉取 Next.js 打包分块正文，只保留分块内容规则命中的片段
use std::collections::HashSet;
use std::time::Duration;

use reqwest::Client;
use tokio::time::Instant;
use tracing::{debug, info};
use url::Url;

use crate::compiler::{CompiledPattern, CompiledRuleLibrary, Matcher};
use crate::config::DetectionSettings;
use crate::error::SpResult;
use crate::evidence::{EvidencePatch, ResourceKind, ResourceRef};

const CHUNK_PATH_MARKER: &str = "/_next/static/chunks/";
/// 单个命中片段的最大字节数
const MAX_MARKER_LEN: usize = 256;
/// 单个分块最多保留的片段数
const MAX_MARKERS_PER_CHUNK: usize = 16;

/// 分块扫描器（文件数与总耗时双重上限）
#[derive(Debug, Clone)]
pub struct ChunkScanner {
    client: Client,
    max_files: usize,
    budget: Duration,
    markers: Vec<CompiledPattern>,
}

impl ChunkScanner {
    /// 标记模式取自规则库中的分块内容谓词
    pub fn new(client: Client, settings: &DetectionSettings, lib: &CompiledRuleLibrary) -> Self {
        Self {
            client,
            max_files: settings.chunk_scan_file_limit(),
            budget: settings.chunk_scan_budget(),
            markers: lib.chunk_patterns(),
        }
    }

    /// 分块正文中命中标记模式的片段（去重，按出现顺序）
    pub fn extract_markers(&self, body: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut markers = Vec::new();
        for pattern in &self.markers {
            let Matcher::Regex(regex) = &pattern.matcher else {
                continue;
            };
            for found in regex.find_iter(body) {
                if markers.len() >= MAX_MARKERS_PER_CHUNK {
                    return markers;
                }
                let snippet = truncate(found.as_str(), MAX_MARKER_LEN);
                if seen.insert(snippet) {
                    markers.push(snippet.to_string());
                }
            }
        }
        markers
    }

    /// 候选分块：路径位于 `/_next/static/chunks/` 下的 `.js` 脚本
    pub fn candidates(resources: &[ResourceRef]) -> Vec<&str> {
        resources
            .iter()
            .filter(|r| r.kind == ResourceKind::Script)
            .map(|r| r.url.as_str())
            .filter(|raw| match Url::parse(raw) {
                Ok(url) => url.path().contains(CHUNK_PATH_MARKER) && url.path().ends_with(".js"),
                Err(_) => false,
            })
            .collect()
    }

    /// 在预算内依次拉取分块，失败的分块跳过
    pub async fn scan(&self, resources: &[ResourceRef]) -> EvidencePatch {
        let deadline = Instant::now() + self.budget;
        let mut patch = EvidencePatch::default();
        let candidates = Self::candidates(resources);
        let mut fetched = 0;

        for url in candidates.iter().take(self.max_files) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!("分块扫描时间预算耗尽，剩余分块跳过");
                break;
            }
            match tokio::time::timeout(remaining, self.fetch(url)).await {
                Ok(Ok(body)) => {
                    fetched += 1;
                    let markers = self.extract_markers(&body);
                    debug!("分块{}（{}字节）命中片段{}个", url, body.len(), markers.len());
                    patch.chunk_contents.extend(markers);
                }
                Ok(Err(e)) => debug!("分块拉取失败，已跳过：{}，{}", url, e),
                Err(_) => {
                    debug!("分块扫描时间预算耗尽：{}", url);
                    break;
                }
            }
        }

        info!("分块扫描完成：候选{}个，成功{}个", candidates.len(), fetched);
        patch
    }

    async fn fetch(&self, url: &str) -> SpResult<String> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.text().await?)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
