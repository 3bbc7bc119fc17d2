//! 证据模块：页面可观测信号的结构化表示
//! 每个字段都可以独立缺省，探针失败时对应字段保持默认值
pub mod collector;

pub use self::collector::{EvidenceCollector, PageProbe, PageSnapshot};

use std::collections::{BTreeMap, HashSet};
use std::hash::Hash;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// 小写键的多值响应头
pub type HeaderMultiMap = BTreeMap<String, Vec<String>>;

/// JSON 水合数据展开的最大深度
const HYDRATION_DEPTH: usize = 3;

/// 页面中引用的资源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Script,
    Stylesheet,
    Link,
    Image,
    Anchor,
    Form,
    Other,
}

/// 资源引用（URL 已按页面地址解析为绝对地址，无法解析时保留原文）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub url: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
        }
    }
}

/// 发起请求的原语
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Fetch,
    Xhr,
    Beacon,
    WebSocket,
    Document,
    Resource,
}

/// 已观测到的网络请求
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRequest {
    pub kind: RequestKind,
    pub url: String,
    #[serde(default)]
    pub request_headers: HeaderMultiMap,
    #[serde(default)]
    pub response_headers: Option<HeaderMultiMap>,
}

impl NetworkRequest {
    pub fn new(kind: RequestKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            request_headers: HeaderMultiMap::new(),
            response_headers: None,
        }
    }

    pub fn with_response_headers(mut self, headers: HeaderMultiMap) -> Self {
        self.response_headers = Some(headers);
        self
    }

    /// 指定响应头的全部取值（名称大小写不敏感）
    pub fn response_header(&self, name: &str) -> &[String] {
        self.response_headers
            .as_ref()
            .and_then(|h| h.get(&name.to_ascii_lowercase()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// 网络观测事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NetworkEvent {
    RequestStarted {
        kind: RequestKind,
        url: String,
    },
    ResponseReceived {
        kind: RequestKind,
        url: String,
        headers: Vec<(String, String)>,
    },
}

impl NetworkEvent {
    pub fn kind(&self) -> RequestKind {
        match self {
            NetworkEvent::RequestStarted { kind, .. } | NetworkEvent::ResponseReceived { kind, .. } => *kind,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            NetworkEvent::RequestStarted { url, .. } | NetworkEvent::ResponseReceived { url, .. } => url,
        }
    }
}

/// DOM 快照：原始 HTML 与预先提取的内联脚本、class 属性
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomSnapshot {
    pub html: String,
    #[serde(default)]
    pub inline_scripts: Vec<String>,
    #[serde(default)]
    pub class_names: Vec<String>,
}

/// 全局作用域快照：点分路径 -> 可选字符串值
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GlobalScope(BTreeMap<String, Option<String>>);

impl GlobalScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>, value: Option<String>) {
        let path = path.into();
        let path = path.strip_prefix("window.").map(str::to_string).unwrap_or(path);
        self.0.insert(path, value);
    }

    /// 路径本身或任一后代路径存在即视为存在
    pub fn contains(&self, path: &str) -> bool {
        let path = path.strip_prefix("window.").unwrap_or(path);
        if self.0.contains_key(path) {
            return true;
        }
        let prefix = format!("{}.", path);
        self.0
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(key, _)| key.starts_with(&prefix))
    }

    pub fn value(&self, path: &str) -> Option<&str> {
        let path = path.strip_prefix("window.").unwrap_or(path);
        self.0.get(path).and_then(|v| v.as_deref())
    }

    /// 将 JSON 对象按点分路径展开（标量取字符串值）
    pub fn insert_json(&mut self, root: &str, value: &Value) {
        self.insert_json_at(root.to_string(), value, HYDRATION_DEPTH);
    }

    fn insert_json_at(&mut self, path: String, value: &Value, depth: usize) {
        match value {
            Value::Object(map) if depth > 0 => {
                for (key, child) in map {
                    self.insert_json_at(format!("{}.{}", path, key), child, depth - 1);
                }
                self.0.entry(path).or_insert(None);
            }
            Value::String(s) => {
                self.0.insert(path, Some(s.clone()));
            }
            Value::Number(n) => {
                self.0.insert(path, Some(n.to_string()));
            }
            Value::Bool(b) => {
                self.0.insert(path, Some(b.to_string()));
            }
            Value::Null => {}
            _ => {
                self.0.entry(path).or_insert(None);
            }
        }
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, Option<String>)> for GlobalScope {
    fn from_iter<I: IntoIterator<Item = (K, Option<String>)>>(iter: I) -> Self {
        let mut scope = GlobalScope::new();
        for (path, value) in iter {
            scope.insert(path, value);
        }
        scope
    }
}

/// 解析后的 Cookie（保留原始字符串）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookieJar {
    raw: String,
    pairs: Vec<(String, String)>,
}

impl CookieJar {
    /// 解析 `document.cookie` 形式的字符串
    pub fn parse(raw: &str) -> Self {
        let pairs = raw
            .split(';')
            .filter_map(|part| {
                let part = part.trim();
                if part.is_empty() {
                    return None;
                }
                let (name, value) = part.split_once('=').unwrap_or((part, ""));
                Some((name.trim().to_string(), value.trim().to_string()))
            })
            .collect();
        Self {
            raw: raw.to_string(),
            pairs,
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// 增量证据（网络观测、延迟探测产生）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EvidencePatch {
    pub network: Vec<NetworkRequest>,
    pub resources: Vec<ResourceRef>,
    pub indexed_db_names: Vec<String>,
    pub chunk_contents: Vec<String>,
}

impl EvidencePatch {
    pub fn from_request(request: NetworkRequest) -> Self {
        Self {
            network: vec![request],
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.network.is_empty()
            && self.resources.is_empty()
            && self.indexed_db_names.is_empty()
            && self.chunk_contents.is_empty()
    }
}

/// 单次检测的证据集合
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvidenceBundle {
    pub page_url: Option<Url>,
    pub dom: Option<DomSnapshot>,
    pub globals: GlobalScope,
    pub cookies: CookieJar,
    pub resources: Vec<ResourceRef>,
    pub network: Vec<NetworkRequest>,
    pub local_storage_keys: Vec<String>,
    pub session_storage_keys: Vec<String>,
    pub indexed_db_names: Vec<String>,
    pub chunk_contents: Vec<String>,
}

/// 追加未出现过的条目，保持原有顺序
fn push_unique<T: Eq + Hash>(target: &mut Vec<T>, items: impl IntoIterator<Item = T>) {
    let items: Vec<T> = items.into_iter().collect();
    if items.is_empty() {
        return;
    }
    let keep: Vec<bool> = {
        let mut seen: HashSet<&T> = target.iter().collect();
        items.iter().map(|item| seen.insert(item)).collect()
    };
    target.extend(items.into_iter().zip(keep).filter_map(|(item, keep)| keep.then_some(item)));
}

impl EvidenceBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_patch(patch: EvidencePatch) -> Self {
        let mut bundle = Self::new();
        bundle.apply(patch);
        bundle
    }

    /// 追加增量证据（完全相同的条目不重复追加）
    pub fn apply(&mut self, patch: EvidencePatch) {
        push_unique(&mut self.network, patch.network);
        push_unique(&mut self.resources, patch.resources);
        push_unique(&mut self.indexed_db_names, patch.indexed_db_names);
        push_unique(&mut self.chunk_contents, patch.chunk_contents);
    }

    /// 用新的页面快照替换页面级字段，保留已累积的网络与分块证据
    pub fn refresh_page(&mut self, fresh: EvidenceBundle) {
        self.page_url = fresh.page_url;
        self.dom = fresh.dom;
        self.globals = fresh.globals;
        self.cookies = fresh.cookies;
        self.local_storage_keys = fresh.local_storage_keys;
        self.session_storage_keys = fresh.session_storage_keys;

        let accumulated = std::mem::take(&mut self.resources);
        self.resources = fresh.resources;
        push_unique(&mut self.resources, accumulated);

        push_unique(&mut self.network, fresh.network);
        push_unique(&mut self.indexed_db_names, fresh.indexed_db_names);
        push_unique(&mut self.chunk_contents, fresh.chunk_contents);
    }

    pub fn hostname(&self) -> Option<&str> {
        self.page_url.as_ref().and_then(|u| u.host_str())
    }

    pub fn resources_of(&self, kind: ResourceKind) -> impl Iterator<Item = &str> {
        self.resources
            .iter()
            .filter(move |r| r.kind == kind)
            .map(|r| r.url.as_str())
    }

    /// localStorage 与 sessionStorage 的全部键
    pub fn storage_keys(&self) -> impl Iterator<Item = &str> {
        self.local_storage_keys
            .iter()
            .chain(self.session_storage_keys.iter())
            .map(String::as_str)
    }

    /// 与页面同源（无页面地址时无法判断，视为不同源）
    pub fn is_same_origin(&self, url: &Url) -> bool {
        self.page_url
            .as_ref()
            .is_some_and(|page| page.origin() == url.origin())
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_scope_descendant_presence() {
        let scope: GlobalScope = [
            ("window.React.version", Some("18.2.0".to_string())),
            ("$.fn.jquery", Some("3.7.1".to_string())),
        ]
        .into_iter()
        .collect();
        assert!(scope.contains("React"));
        assert!(scope.contains("window.React"));
        assert_eq!(scope.value("React.version"), Some("18.2.0"));
        assert!(scope.contains("$.fn"));
        assert!(!scope.contains("Reac"));
        assert!(!scope.contains("Vue"));
    }

    #[test]
    fn test_global_scope_json_hydration() {
        let mut scope = GlobalScope::new();
        let data: Value = serde_json::from_str(
            r#"{"buildId": "abc", "props": {"pageProps": {}}, "deploymentId": "dpl_1", "isFallback": false}"#,
        )
        .unwrap();
        scope.insert_json("__NEXT_DATA__", &data);
        assert!(scope.contains("__NEXT_DATA__"));
        assert!(scope.contains("__NEXT_DATA__.props"));
        assert_eq!(scope.value("__NEXT_DATA__.deploymentId"), Some("dpl_1"));
        assert_eq!(scope.value("__NEXT_DATA__.isFallback"), Some("false"));
    }

    #[test]
    fn test_cookie_parsing() {
        let jar = CookieJar::parse("sb-access-token=abc; theme=dark;flag");
        let names: Vec<_> = jar.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["sb-access-token", "theme", "flag"]);
        assert_eq!(jar.raw(), "sb-access-token=abc; theme=dark;flag");
        assert!(CookieJar::parse("").is_empty());
    }

    #[test]
    fn test_refresh_keeps_network_evidence() {
        let mut bundle = EvidenceBundle::new();
        bundle.apply(EvidencePatch::from_request(NetworkRequest::new(
            RequestKind::Fetch,
            "https://x.supabase.co/rest/v1/items",
        )));
        bundle.cookies = CookieJar::parse("a=1");

        let mut fresh = EvidenceBundle::new();
        fresh.cookies = CookieJar::parse("b=2");
        bundle.refresh_page(fresh);

        assert_eq!(bundle.network.len(), 1);
        assert_eq!(bundle.cookies.raw(), "b=2");
    }

    #[test]
    fn test_apply_skips_duplicates() {
        let request = NetworkRequest::new(RequestKind::Xhr, "https://example.com/api/a");
        let mut bundle = EvidenceBundle::from_patch(EvidencePatch::from_request(request.clone()));
        bundle.apply(EvidencePatch::from_request(request));
        assert_eq!(bundle.network.len(), 1);
    }

    #[test]
    fn test_response_header_lookup_is_case_insensitive() {
        let mut headers = HeaderMultiMap::new();
        headers.insert("x-vercel-id".to_string(), vec!["abc123".to_string()]);
        let request =
            NetworkRequest::new(RequestKind::Document, "https://example.com/").with_response_headers(headers);
        assert_eq!(request.response_header("X-Vercel-Id"), &["abc123".to_string()]);
        assert!(request.response_header("server").is_empty());
    }
}
