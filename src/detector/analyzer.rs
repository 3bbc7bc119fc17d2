//! 检测分析器：按证据来源对编译后的谓词求值
use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

use crate::compiler::{
    CompiledPattern, CompiledPredicate, CompiledRule, CompiledRuleLibrary, CompiledSelector,
    CompiledVersionProbe, Matcher,
};
use crate::evidence::{EvidenceBundle, ResourceKind};
use crate::utils::VersionExtractor;

static META_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("meta[name]").unwrap());

/// DOM 查询索引：解析一次文档，预先回答规则库中的全部选择器、属性与 meta 查询
#[derive(Debug, Clone, Default)]
pub struct DomIndex {
    // 至少命中一个元素的选择器原文
    matched: HashSet<String>,
    // (选择器原文, 属性名) -> 首个命中元素的属性值
    attrs: HashMap<(String, String), String>,
    // meta[name] 的 (name, content)
    metas: Vec<(String, String)>,
}

impl DomIndex {
    pub fn build(bundle: &EvidenceBundle, lib: &CompiledRuleLibrary) -> Self {
        let Some(dom) = bundle.dom.as_ref() else {
            return Self::default();
        };
        let document = Html::parse_document(&dom.html);
        let metas = document
            .select(&META_SELECTOR)
            .filter_map(|el| {
                let name = el.value().attr("name")?;
                Some((name.to_string(), el.value().attr("content").unwrap_or("").to_string()))
            })
            .collect();

        let mut index = Self {
            metas,
            ..Self::default()
        };
        for rule in &lib.rules {
            index.index_predicate(&document, &rule.predicate);
            for probe in &rule.version {
                if let CompiledVersionProbe::DomAttr { selector, attr } = probe {
                    index.index_attr(&document, selector, attr);
                }
            }
        }
        debug!("DOM 索引完成：命中选择器{}个，meta {}个", index.matched.len(), index.metas.len());
        index
    }

    fn index_predicate(&mut self, document: &Html, predicate: &CompiledPredicate) {
        match predicate {
            CompiledPredicate::Any(children) | CompiledPredicate::All(children) => {
                for child in children {
                    self.index_predicate(document, child);
                }
            }
            CompiledPredicate::Dom(selector) => {
                if !self.matched.contains(&selector.raw) && document.select(&selector.selector).next().is_some() {
                    self.matched.insert(selector.raw.clone());
                }
            }
            _ => {}
        }
    }

    fn index_attr(&mut self, document: &Html, selector: &CompiledSelector, attr: &str) {
        let key = (selector.raw.clone(), attr.to_string());
        if self.attrs.contains_key(&key) {
            return;
        }
        if let Some(value) = document
            .select(&selector.selector)
            .next()
            .and_then(|el| el.value().attr(attr))
        {
            self.attrs.insert(key, value.to_string());
        }
    }

    pub fn matches(&self, selector: &CompiledSelector) -> bool {
        self.matched.contains(&selector.raw)
    }

    pub fn attr(&self, selector: &CompiledSelector, attr: &str) -> Option<&str> {
        self.attrs
            .get(&(selector.raw.clone(), attr.to_string()))
            .map(String::as_str)
    }

    /// 指定 name 的 meta 内容（name 大小写不敏感）
    pub fn meta_contents<'s>(&'s self, name: &'s str) -> impl Iterator<Item = &'s str> + 's {
        self.metas
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, content)| content.as_str())
    }
}

/// 单次求值上下文：累积证据与同一检测器构建的 DOM 索引
pub struct EvaluationContext<'a> {
    pub bundle: &'a EvidenceBundle,
    dom: &'a DomIndex,
}

impl<'a> EvaluationContext<'a> {
    pub fn new(bundle: &'a EvidenceBundle, dom: &'a DomIndex) -> Self {
        Self { bundle, dom }
    }
}

/// 命中结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchOutcome {
    // 响应头证据参与了命中
    pub via_headers: bool,
    // 命中模式带版本模板时提取到的版本
    pub version: Option<String>,
}

impl MatchOutcome {
    fn page(version: Option<String>) -> Self {
        Self {
            via_headers: false,
            version,
        }
    }

    fn headers(version: Option<String>) -> Self {
        Self {
            via_headers: true,
            version,
        }
    }

    /// 合并两个命中结果：先出现的版本优先
    fn combine(self, other: MatchOutcome) -> Self {
        Self {
            via_headers: self.via_headers || other.via_headers,
            version: self.version.or(other.version),
        }
    }
}

/// 文本模式匹配，命中时附带模板版本
fn match_text(pattern: &CompiledPattern, input: &str) -> Option<Option<String>> {
    if pattern.version_template.is_none() {
        return pattern.is_match(input).then_some(None);
    }
    let captures = pattern.matcher.captures(input)?;
    Some(VersionExtractor::extract(pattern.version_template.as_deref(), &captures))
}

fn match_any<'s>(pattern: &CompiledPattern, inputs: impl IntoIterator<Item = &'s str>) -> Option<MatchOutcome> {
    inputs
        .into_iter()
        .find_map(|input| match_text(pattern, input))
        .map(MatchOutcome::page)
}

/// 全局变量分析器
pub struct GlobalAnalyzer;

impl GlobalAnalyzer {
    pub fn analyze(bundle: &EvidenceBundle, path: &str) -> Option<MatchOutcome> {
        bundle.globals.contains(path).then(|| MatchOutcome::page(None))
    }
}

/// DOM分析器（选择器、meta、HTML 文本、内联脚本、class 属性）
pub struct DomAnalyzer;

impl DomAnalyzer {
    pub fn analyze_selector(ctx: &EvaluationContext, selector: &CompiledSelector) -> Option<MatchOutcome> {
        ctx.dom.matches(selector).then(|| MatchOutcome::page(None))
    }

    pub fn analyze_meta(
        ctx: &EvaluationContext,
        name: &str,
        pattern: Option<&CompiledPattern>,
    ) -> Option<MatchOutcome> {
        let mut contents = ctx.dom.meta_contents(name);
        match pattern {
            None => contents.next().map(|_| MatchOutcome::page(None)),
            Some(pattern) => match_any(pattern, contents),
        }
    }

    pub fn analyze_html(bundle: &EvidenceBundle, pattern: &CompiledPattern) -> Option<MatchOutcome> {
        let dom = bundle.dom.as_ref()?;
        match_any(pattern, [dom.html.as_str()])
    }

    pub fn analyze_inline_scripts(bundle: &EvidenceBundle, pattern: &CompiledPattern) -> Option<MatchOutcome> {
        let dom = bundle.dom.as_ref()?;
        match_any(pattern, dom.inline_scripts.iter().map(String::as_str))
    }

    pub fn analyze_class_list(bundle: &EvidenceBundle, pattern: &CompiledPattern) -> Option<MatchOutcome> {
        let dom = bundle.dom.as_ref()?;
        match_any(pattern, dom.class_names.iter().map(String::as_str))
    }
}

/// 资源URL分析器
pub struct ResourceAnalyzer;

impl ResourceAnalyzer {
    pub fn analyze_kind(
        bundle: &EvidenceBundle,
        kind: ResourceKind,
        pattern: &CompiledPattern,
    ) -> Option<MatchOutcome> {
        match_any(pattern, bundle.resources_of(kind))
    }

    /// 任意资源引用
    pub fn analyze(bundle: &EvidenceBundle, pattern: &CompiledPattern) -> Option<MatchOutcome> {
        match_any(pattern, bundle.resources.iter().map(|r| r.url.as_str()))
    }
}

/// Cookie分析器
pub struct CookieAnalyzer;

impl CookieAnalyzer {
    pub fn analyze(
        bundle: &EvidenceBundle,
        name: &Matcher,
        value: Option<&CompiledPattern>,
    ) -> Option<MatchOutcome> {
        bundle
            .cookies
            .iter()
            .filter(|(n, _)| name.is_match(n))
            .find_map(|(_, v)| match value {
                None => Some(None),
                Some(pattern) => match_text(pattern, v),
            })
            .map(MatchOutcome::page)
    }

    pub fn analyze_raw(bundle: &EvidenceBundle, pattern: &CompiledPattern) -> Option<MatchOutcome> {
        if bundle.cookies.raw().is_empty() {
            return None;
        }
        match_any(pattern, [bundle.cookies.raw()])
    }
}

/// Header分析器：任一已观测请求的响应头
pub struct HeaderAnalyzer;

impl HeaderAnalyzer {
    pub fn analyze(
        bundle: &EvidenceBundle,
        name: &str,
        value: Option<&CompiledPattern>,
    ) -> Option<MatchOutcome> {
        bundle
            .network
            .iter()
            .flat_map(|req| req.response_header(name))
            .find_map(|v| match value {
                None => Some(None),
                Some(pattern) => match_text(pattern, v),
            })
            .map(MatchOutcome::headers)
    }
}

/// 网络请求分析器
pub struct NetworkAnalyzer;

impl NetworkAnalyzer {
    pub fn analyze_url(bundle: &EvidenceBundle, pattern: &CompiledPattern) -> Option<MatchOutcome> {
        match_any(pattern, bundle.network.iter().map(|r| r.url.as_str()))
    }

    /// 按请求路径匹配，可限定与页面同源
    pub fn analyze_path(
        bundle: &EvidenceBundle,
        pattern: &CompiledPattern,
        same_origin: bool,
    ) -> Option<MatchOutcome> {
        bundle
            .network
            .iter()
            .filter_map(|req| Url::parse(&req.url).ok())
            .filter(|url| !same_origin || bundle.is_same_origin(url))
            .find_map(|url| match_text(pattern, url.path()))
            .map(MatchOutcome::page)
    }
}

/// 客户端存储分析器
pub struct StorageAnalyzer;

impl StorageAnalyzer {
    pub fn analyze_keys(bundle: &EvidenceBundle, pattern: &CompiledPattern) -> Option<MatchOutcome> {
        match_any(pattern, bundle.storage_keys())
    }

    pub fn analyze_indexed_db(bundle: &EvidenceBundle, pattern: &CompiledPattern) -> Option<MatchOutcome> {
        match_any(pattern, bundle.indexed_db_names.iter().map(String::as_str))
    }
}

/// 谓词求值
pub struct PredicateAnalyzer;

impl PredicateAnalyzer {
    pub fn evaluate(predicate: &CompiledPredicate, ctx: &EvaluationContext) -> Option<MatchOutcome> {
        let bundle = ctx.bundle;
        match predicate {
            // 各分支都求值，以便记录响应头是否参与命中
            CompiledPredicate::Any(children) => children
                .iter()
                .filter_map(|c| Self::evaluate(c, ctx))
                .reduce(MatchOutcome::combine),
            CompiledPredicate::All(children) => {
                if children.is_empty() {
                    return None;
                }
                let mut combined: Option<MatchOutcome> = None;
                for child in children {
                    let outcome = Self::evaluate(child, ctx)?;
                    combined = Some(match combined {
                        Some(acc) => acc.combine(outcome),
                        None => outcome,
                    });
                }
                combined
            }
            CompiledPredicate::Global(path) => GlobalAnalyzer::analyze(bundle, path),
            CompiledPredicate::Dom(selector) => DomAnalyzer::analyze_selector(ctx, selector),
            CompiledPredicate::Meta { name, pattern } => DomAnalyzer::analyze_meta(ctx, name, pattern.as_ref()),
            CompiledPredicate::Html(p) => DomAnalyzer::analyze_html(bundle, p),
            CompiledPredicate::InlineScript(p) => DomAnalyzer::analyze_inline_scripts(bundle, p),
            CompiledPredicate::ClassList(p) => DomAnalyzer::analyze_class_list(bundle, p),
            CompiledPredicate::ScriptSrc(p) => ResourceAnalyzer::analyze_kind(bundle, ResourceKind::Script, p),
            CompiledPredicate::Stylesheet(p) => {
                ResourceAnalyzer::analyze_kind(bundle, ResourceKind::Stylesheet, p)
            }
            CompiledPredicate::Resource(p) => ResourceAnalyzer::analyze(bundle, p),
            CompiledPredicate::Cookie { name, value } => CookieAnalyzer::analyze(bundle, name, value.as_ref()),
            CompiledPredicate::CookieString(p) => CookieAnalyzer::analyze_raw(bundle, p),
            CompiledPredicate::Header { name, value } => HeaderAnalyzer::analyze(bundle, name, value.as_ref()),
            CompiledPredicate::RequestUrl(p) => NetworkAnalyzer::analyze_url(bundle, p),
            CompiledPredicate::RequestPath { pattern, same_origin } => {
                NetworkAnalyzer::analyze_path(bundle, pattern, *same_origin)
            }
            CompiledPredicate::StorageKey(p) => StorageAnalyzer::analyze_keys(bundle, p),
            CompiledPredicate::IndexedDb(p) => StorageAnalyzer::analyze_indexed_db(bundle, p),
            CompiledPredicate::Hostname(p) => match_any(p, bundle.hostname()),
            CompiledPredicate::ChunkContent(p) => {
                match_any(p, bundle.chunk_contents.iter().map(String::as_str))
            }
            CompiledPredicate::Custom(custom) => (custom.0)(bundle).then(|| MatchOutcome::page(None)),
        }
    }
}

/// 版本分析器：按顺序尝试版本探针，首个命中生效
pub struct VersionAnalyzer;

impl VersionAnalyzer {
    pub fn resolve(rule: &CompiledRule, ctx: &EvaluationContext) -> Option<String> {
        let version = rule.version.iter().find_map(|probe| Self::probe(probe, ctx));
        if let Some(v) = &version {
            debug!("版本提取成功：技术={}，版本={}", rule.name, v);
        }
        version
    }

    fn probe(probe: &CompiledVersionProbe, ctx: &EvaluationContext) -> Option<String> {
        let bundle = ctx.bundle;
        let version = match probe {
            CompiledVersionProbe::Global(path) => bundle.globals.value(path).map(str::to_string),
            CompiledVersionProbe::ScriptSrc(pattern) => bundle
                .resources_of(ResourceKind::Script)
                .find_map(|src| match_text(pattern, src).flatten()),
            CompiledVersionProbe::DomAttr { selector, attr } => ctx.dom.attr(selector, attr).map(str::to_string),
            CompiledVersionProbe::Meta { name, pattern } => ctx
                .dom
                .meta_contents(name)
                .find_map(|content| match_text(pattern, content).flatten()),
            CompiledVersionProbe::Fixed { value, when_global } => {
                bundle.globals.contains(when_global).then(|| value.clone())
            }
        };
        version.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::RuleCompiler;
    use crate::rule::Category;
    use crate::evidence::{CookieJar, DomSnapshot, HeaderMultiMap, NetworkRequest, RequestKind, ResourceRef};

    fn pattern(raw: &str) -> CompiledPattern {
        RuleCompiler::compile_single_pattern(raw).unwrap()
    }

    fn library(predicate: CompiledPredicate) -> CompiledRuleLibrary {
        CompiledRuleLibrary {
            rules: vec![CompiledRule {
                name: "Sample".to_string(),
                category: Category::Frameworks,
                inferred: false,
                predicate,
                version: Vec::new(),
                unknown_version: false,
            }],
            ..CompiledRuleLibrary::default()
        }
    }

    fn html_bundle(html: &str) -> EvidenceBundle {
        EvidenceBundle {
            dom: Some(DomSnapshot {
                html: html.to_string(),
                ..DomSnapshot::default()
            }),
            ..EvidenceBundle::default()
        }
    }

    #[test]
    fn test_meta_with_version_template() {
        let bundle = html_bundle(r#"<meta name="Generator" content="WordPress 6.4.2">"#);
        let index = DomIndex::build(&bundle, &CompiledRuleLibrary::default());
        let ctx = EvaluationContext::new(&bundle, &index);
        let outcome =
            DomAnalyzer::analyze_meta(&ctx, "generator", Some(&pattern(r"WordPress ?([\d.]+)?\;version:\1")))
                .unwrap();
        assert_eq!(outcome.version.as_deref(), Some("6.4.2"));
        assert!(!outcome.via_headers);
    }

    #[test]
    fn test_selector_requires_dom() {
        let selector = RuleCompiler::compile_selector("[data-reactroot]").unwrap();
        let lib = library(CompiledPredicate::Dom(selector.clone()));
        let empty = EvidenceBundle::default();
        let index = DomIndex::build(&empty, &lib);
        assert!(DomAnalyzer::analyze_selector(&EvaluationContext::new(&empty, &index), &selector).is_none());

        let bundle = html_bundle(r#"<div data-reactroot=""></div>"#);
        let index = DomIndex::build(&bundle, &lib);
        assert!(DomAnalyzer::analyze_selector(&EvaluationContext::new(&bundle, &index), &selector).is_some());
    }

    #[test]
    fn test_dom_index_answers_library_queries() {
        let mut lib = library(CompiledPredicate::Any(vec![
            CompiledPredicate::Dom(RuleCompiler::compile_selector("[ng-version]").unwrap()),
            CompiledPredicate::Dom(RuleCompiler::compile_selector(".missing").unwrap()),
        ]));
        let version_selector = RuleCompiler::compile_selector("[ng-version]").unwrap();
        lib.rules[0].version = vec![CompiledVersionProbe::DomAttr {
            selector: version_selector.clone(),
            attr: "ng-version".to_string(),
        }];

        let bundle = html_bundle(r#"<app-root ng-version="17.0.1"></app-root>"#);
        let index = DomIndex::build(&bundle, &lib);
        assert!(index.matches(&version_selector));
        assert!(!index.matches(&RuleCompiler::compile_selector(".missing").unwrap()));
        assert_eq!(index.attr(&version_selector, "ng-version"), Some("17.0.1"));

        // 规则库之外的选择器不在索引中
        assert!(!index.matches(&RuleCompiler::compile_selector("app-root").unwrap()));
    }

    #[test]
    fn test_cookie_prefix_match() {
        let bundle = EvidenceBundle {
            cookies: CookieJar::parse("sb-access-token=abc"),
            ..EvidenceBundle::default()
        };
        assert!(CookieAnalyzer::analyze(&bundle, &Matcher::name("sb-*"), None).is_some());
        assert!(CookieAnalyzer::analyze(&bundle, &Matcher::name("PHPSESSID"), None).is_none());
    }

    #[test]
    fn test_header_match_is_header_provenance() {
        let mut headers = HeaderMultiMap::new();
        headers.insert("server".to_string(), vec!["Vercel".to_string()]);
        let bundle = EvidenceBundle {
            network: vec![NetworkRequest::new(RequestKind::Document, "https://a.dev/").with_response_headers(headers)],
            ..EvidenceBundle::default()
        };
        let outcome = HeaderAnalyzer::analyze(&bundle, "server", Some(&pattern("vercel"))).unwrap();
        assert!(outcome.via_headers);
        assert!(HeaderAnalyzer::analyze(&bundle, "x-vercel-id", None).is_none());
    }

    #[test]
    fn test_request_path_same_origin() {
        let bundle = EvidenceBundle {
            page_url: Some(Url::parse("https://app.example.com/dashboard").unwrap()),
            network: vec![
                NetworkRequest::new(RequestKind::Fetch, "https://other.example.net/api/users"),
                NetworkRequest::new(RequestKind::Fetch, "https://app.example.com/trpc/user.get"),
            ],
            ..EvidenceBundle::default()
        };
        let api = pattern("/api/");
        assert!(NetworkAnalyzer::analyze_path(&bundle, &api, true).is_none());
        assert!(NetworkAnalyzer::analyze_path(&bundle, &api, false).is_some());
        assert!(NetworkAnalyzer::analyze_path(&bundle, &pattern("^/trpc"), true).is_some());
    }

    #[test]
    fn test_header_provenance_propagates() {
        let mut headers = HeaderMultiMap::new();
        headers.insert("x-powered-by".to_string(), vec!["Express".to_string()]);
        let bundle = EvidenceBundle {
            resources: vec![ResourceRef::new(ResourceKind::Script, "/_next/app.js")],
            network: vec![NetworkRequest::new(RequestKind::Xhr, "https://a.dev/x").with_response_headers(headers)],
            ..EvidenceBundle::default()
        };
        let index = DomIndex::default();
        let ctx = EvaluationContext::new(&bundle, &index);
        let header = CompiledPredicate::Header {
            name: "x-powered-by".to_string(),
            value: Some(pattern("express")),
        };
        let script = CompiledPredicate::ScriptSrc(pattern("_next"));

        let page_only = CompiledPredicate::All(vec![script.clone()]);
        assert!(!PredicateAnalyzer::evaluate(&page_only, &ctx).unwrap().via_headers);

        let mixed = CompiledPredicate::Any(vec![script, header]);
        assert!(PredicateAnalyzer::evaluate(&mixed, &ctx).unwrap().via_headers);

        assert!(PredicateAnalyzer::evaluate(&CompiledPredicate::Any(Vec::new()), &ctx).is_none());
    }
}
