//! 证据采集器
//! 页面探针逐项取值，任一探针失败只记录并取默认值，采集本身不会失败

use std::collections::HashSet;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::{
    CookieJar, EvidenceBundle, EvidencePatch, GlobalScope, NetworkEvent, NetworkRequest, RequestKind,
};
use crate::error::{SpResult, StackprintError};
use crate::extractor::HtmlExtractor;
use crate::utils::HeaderConverter;

/// 页面能力探针，每项能力独立检测，不可用时返回 `ProbeUnavailable`
pub trait PageProbe {
    fn location(&self) -> SpResult<Url>;
    fn document_html(&self) -> SpResult<String>;
    fn globals(&self) -> SpResult<GlobalScope>;
    fn cookie_string(&self) -> SpResult<String>;
    fn local_storage_keys(&self) -> SpResult<Vec<String>>;
    fn session_storage_keys(&self) -> SpResult<Vec<String>>;
    fn indexed_db_names(&self) -> SpResult<Vec<String>>;
    fn resource_timing_urls(&self) -> SpResult<Vec<String>>;
}

/// 页面上下文一次性导出的快照（字段缺失即该能力不可用）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PageSnapshot {
    pub location: Option<String>,
    pub document_html: Option<String>,
    pub globals: Option<GlobalScope>,
    pub cookie: Option<String>,
    pub local_storage_keys: Option<Vec<String>>,
    pub session_storage_keys: Option<Vec<String>>,
    pub indexed_db_names: Option<Vec<String>>,
    pub resource_timing_urls: Option<Vec<String>>,
}

fn available<T: Clone>(field: &Option<T>, name: &str) -> SpResult<T> {
    field
        .clone()
        .ok_or_else(|| StackprintError::ProbeUnavailable(name.to_string()))
}

impl PageProbe for PageSnapshot {
    fn location(&self) -> SpResult<Url> {
        let raw = available(&self.location, "location")?;
        Ok(Url::parse(&raw)?)
    }

    fn document_html(&self) -> SpResult<String> {
        available(&self.document_html, "document")
    }

    fn globals(&self) -> SpResult<GlobalScope> {
        available(&self.globals, "window")
    }

    fn cookie_string(&self) -> SpResult<String> {
        available(&self.cookie, "document.cookie")
    }

    fn local_storage_keys(&self) -> SpResult<Vec<String>> {
        available(&self.local_storage_keys, "localStorage")
    }

    fn session_storage_keys(&self) -> SpResult<Vec<String>> {
        available(&self.session_storage_keys, "sessionStorage")
    }

    fn indexed_db_names(&self) -> SpResult<Vec<String>> {
        available(&self.indexed_db_names, "indexedDB")
    }

    fn resource_timing_urls(&self) -> SpResult<Vec<String>> {
        available(&self.resource_timing_urls, "performance")
    }
}

/// 探针结果落空时记录并返回 None
fn probed<T>(name: &str, result: SpResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            debug!("探针 {} 不可用：{}", name, e);
            None
        }
    }
}

/// 相对地址按页面地址解析，无法解析时保留原文
fn resolve_url(raw: &str, base: Option<&Url>) -> String {
    match Url::parse(raw) {
        Ok(url) => url.to_string(),
        Err(_) => base
            .and_then(|b| b.join(raw).ok())
            .map(|u| u.to_string())
            .unwrap_or_else(|| raw.to_string()),
    }
}

/// 证据采集器
pub struct EvidenceCollector;

impl EvidenceCollector {
    /// 采集页面级证据
    pub fn collect_page_evidence(probe: &dyn PageProbe) -> EvidenceBundle {
        let start = Instant::now();
        let page_url = probed("location", probe.location());

        let mut bundle = EvidenceBundle {
            page_url: page_url.clone(),
            globals: probed("globals", probe.globals()).unwrap_or_default(),
            cookies: probed("cookie", probe.cookie_string())
                .map(|raw| CookieJar::parse(&raw))
                .unwrap_or_default(),
            local_storage_keys: probed("localStorage", probe.local_storage_keys()).unwrap_or_default(),
            session_storage_keys: probed("sessionStorage", probe.session_storage_keys()).unwrap_or_default(),
            indexed_db_names: probed("indexedDB", probe.indexed_db_names()).unwrap_or_default(),
            ..EvidenceBundle::default()
        };

        if let Some(html) = probed("document", probe.document_html()) {
            let extraction = HtmlExtractor::with_base(page_url.clone()).extract(&html);
            Self::lift_hydration(&mut bundle.globals, &extraction.hydration);
            bundle.dom = Some(extraction.dom);
            bundle.resources = extraction.resources;
        }

        if let Some(urls) = probed("resourceTiming", probe.resource_timing_urls()) {
            bundle.network = urls
                .iter()
                .map(|u| NetworkRequest::new(RequestKind::Resource, resolve_url(u, page_url.as_ref())))
                .collect();
        }

        debug!(
            "页面证据采集完成：资源{}项，全局变量{}项，网络请求{}项，耗时{:?}",
            bundle.resources.len(),
            bundle.globals.len(),
            bundle.network.len(),
            start.elapsed()
        );
        bundle
    }

    /// 水合数据只补充全局探针未提供的根变量
    fn lift_hydration(globals: &mut GlobalScope, hydration: &GlobalScope) {
        let supplied: HashSet<&str> = hydration
            .paths()
            .filter_map(|p| p.split('.').next())
            .filter(|root| globals.contains(root))
            .collect();

        for (path, value) in hydration.iter() {
            let root = path.split('.').next().unwrap_or(path);
            if !supplied.contains(root) {
                globals.insert(path, value.map(str::to_string));
            }
        }
    }

    /// 网络观测事件转换为增量证据
    pub fn observe_network_event(event: &NetworkEvent, page_url: Option<&Url>) -> EvidencePatch {
        let url = resolve_url(event.url(), page_url);
        let request = match event {
            NetworkEvent::RequestStarted { kind, .. } => NetworkRequest::new(*kind, url),
            NetworkEvent::ResponseReceived { kind, headers, .. } => {
                NetworkRequest::new(*kind, url).with_response_headers(HeaderConverter::from_pairs(headers))
            }
        };
        EvidencePatch::from_request(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::ResourceKind;

    fn snapshot() -> PageSnapshot {
        PageSnapshot {
            location: Some("https://shop.example.com/cart".to_string()),
            document_html: Some(
                r#"<html><head>
                <script src="/_next/static/chunks/main-abc.js"></script>
                <script id="__NEXT_DATA__" type="application/json">{"buildId":"b1","props":{"pageProps":{}}}</script>
                </head><body class="home"></body></html>"#
                    .to_string(),
            ),
            cookie: Some("sb-access-token=abc; theme=dark".to_string()),
            resource_timing_urls: Some(vec!["/api/cart".to_string()]),
            ..PageSnapshot::default()
        }
    }

    #[test]
    fn test_missing_capabilities_default_to_empty() {
        let bundle = EvidenceCollector::collect_page_evidence(&PageSnapshot::default());
        assert!(bundle.is_empty());
    }

    #[test]
    fn test_snapshot_probe_reports_unavailable() {
        let err = PageSnapshot::default().globals().unwrap_err();
        assert!(matches!(err, StackprintError::ProbeUnavailable(_)));
    }

    #[test]
    fn test_collects_dom_cookies_and_timing() {
        let bundle = EvidenceCollector::collect_page_evidence(&snapshot());
        assert_eq!(bundle.hostname(), Some("shop.example.com"));
        assert_eq!(
            bundle.resources_of(ResourceKind::Script).collect::<Vec<_>>(),
            vec!["https://shop.example.com/_next/static/chunks/main-abc.js"]
        );
        assert!(bundle.globals.contains("__NEXT_DATA__"));
        assert_eq!(bundle.globals.value("__NEXT_DATA__.buildId"), Some("b1"));
        assert_eq!(bundle.cookies.iter().count(), 2);
        assert_eq!(bundle.network.len(), 1);
        assert_eq!(bundle.network[0].kind, RequestKind::Resource);
        assert_eq!(bundle.network[0].url, "https://shop.example.com/api/cart");
    }

    #[test]
    fn test_probe_globals_take_precedence_over_hydration() {
        let mut snap = snapshot();
        snap.globals = Some([("__NEXT_DATA__.buildId", Some("live".to_string()))].into_iter().collect());
        let bundle = EvidenceCollector::collect_page_evidence(&snap);
        assert_eq!(bundle.globals.value("__NEXT_DATA__.buildId"), Some("live"));
        assert!(!bundle.globals.contains("__NEXT_DATA__.props"));
    }

    #[test]
    fn test_network_event_resolves_relative_url() {
        let page = Url::parse("https://app.example.com/dashboard").unwrap();
        let event = NetworkEvent::ResponseReceived {
            kind: RequestKind::Fetch,
            url: "/api/session".to_string(),
            headers: vec![("Server".to_string(), "node".to_string())],
        };
        let patch = EvidenceCollector::observe_network_event(&event, Some(&page));
        assert_eq!(patch.network.len(), 1);
        let request = &patch.network[0];
        assert_eq!(request.url, "https://app.example.com/api/session");
        assert_eq!(request.response_header("server"), &["node".to_string()]);
    }

    #[test]
    fn test_request_started_has_no_response_headers() {
        let event = NetworkEvent::RequestStarted {
            kind: RequestKind::Beacon,
            url: "https://collector.example.net/b".to_string(),
        };
        let patch = EvidenceCollector::observe_network_event(&event, None);
        assert!(patch.network[0].response_headers.is_none());
    }
}
