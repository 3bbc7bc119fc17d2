//! HTML提取器
//! 负责从页面HTML中提取资源引用、内联脚本、class属性与水合数据

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::evidence::{DomSnapshot, GlobalScope, ResourceKind, ResourceRef};

static SCRIPT_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("script").unwrap());
static LINK_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("link[href]").unwrap());
static IMG_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("img[src]").unwrap());
static ANCHOR_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").unwrap());
static FORM_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("form[action]").unwrap());
static CLASS_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("[class]").unwrap());
static NUXT_ASSIGN_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"window\.__NUXT__\s*="#).unwrap());

/// 单次提取结果
#[derive(Debug, Clone, Default)]
pub struct HtmlExtraction {
    pub dom: DomSnapshot,
    pub resources: Vec<ResourceRef>,
    // 水合数据提升出的全局变量
    pub hydration: GlobalScope,
}

/// HTML提取器
#[derive(Debug, Clone, Default)]
pub struct HtmlExtractor {
    base: Option<Url>,
}

impl HtmlExtractor {
    /// 创建新的提取器
    pub fn new() -> Self {
        Self::default()
    }

    /// 相对地址按页面地址解析
    pub fn with_base(base: Option<Url>) -> Self {
        Self { base }
    }

    /// 从HTML字符串提取
    pub fn extract(&self, html: &str) -> HtmlExtraction {
        let document = Html::parse_document(html);
        let mut out = HtmlExtraction {
            dom: DomSnapshot {
                html: html.to_string(),
                ..DomSnapshot::default()
            },
            ..HtmlExtraction::default()
        };

        for script in document.select(&SCRIPT_SELECTOR) {
            if let Some(src) = script.value().attr("src") {
                out.resources.push(self.resource(ResourceKind::Script, src));
                continue;
            }
            let text: String = script.text().collect();
            if script.value().id() == Some("__NEXT_DATA__") {
                match serde_json::from_str::<Value>(text.trim()) {
                    Ok(data) => out.hydration.insert_json("__NEXT_DATA__", &data),
                    Err(e) => {
                        debug!("__NEXT_DATA__ 解析失败：{}", e);
                        out.hydration.insert("__NEXT_DATA__", None);
                    }
                }
            }
            if NUXT_ASSIGN_REGEX.is_match(&text) {
                out.hydration.insert("__NUXT__", None);
            }
            if !text.trim().is_empty() {
                out.dom.inline_scripts.push(text);
            }
        }

        for link in document.select(&LINK_SELECTOR) {
            let Some(href) = link.value().attr("href") else {
                continue;
            };
            let is_stylesheet = link
                .value()
                .attr("rel")
                .is_some_and(|rel| rel.split_ascii_whitespace().any(|r| r.eq_ignore_ascii_case("stylesheet")));
            let kind = if is_stylesheet {
                ResourceKind::Stylesheet
            } else {
                ResourceKind::Link
            };
            out.resources.push(self.resource(kind, href));
        }

        let attr_sources = [
            (&*IMG_SELECTOR, "src", ResourceKind::Image),
            (&*ANCHOR_SELECTOR, "href", ResourceKind::Anchor),
            (&*FORM_SELECTOR, "action", ResourceKind::Form),
        ];
        for (selector, attr, kind) in attr_sources {
            for element in document.select(selector) {
                if let Some(value) = element.value().attr(attr) {
                    out.resources.push(self.resource(kind, value));
                }
            }
        }

        for element in document.select(&CLASS_SELECTOR) {
            if let Some(class) = element.value().attr("class") {
                if !class.trim().is_empty() {
                    out.dom.class_names.push(class.to_string());
                }
            }
        }

        debug!(
            "HTML提取完成：资源{}个、内联脚本{}段、class属性{}个",
            out.resources.len(),
            out.dom.inline_scripts.len(),
            out.dom.class_names.len()
        );
        out
    }

    fn resource(&self, kind: ResourceKind, raw: &str) -> ResourceRef {
        let raw = raw.trim();
        let url = self
            .base
            .as_ref()
            .and_then(|base| base.join(raw).ok())
            .map(|u| u.to_string())
            .unwrap_or_else(|| raw.to_string());
        ResourceRef::new(kind, url)
    }
}
