//! 编译后模式模型
//! 规则中的正则、选择器、名称匹配器编译后的结构

use std::fmt;
use std::sync::Arc;

use regex::Regex;
use scraper::Selector;

use crate::evidence::EvidenceBundle;
use crate::rule::model::{Category, FallbackRule, ImplicationRule, SuppressionRule};

#[derive(Debug, Clone)]
pub enum Matcher {
    Equals(String),     // 全等匹配（忽略大小写）
    StartsWith(String), // 前缀匹配（忽略大小写）
    Regex(Regex),       // 正则匹配
}

impl Matcher {
    /// 名称匹配器：末尾 `*` 表示前缀匹配
    pub fn name(raw: &str) -> Self {
        match raw.strip_suffix('*') {
            Some(prefix) => Matcher::StartsWith(prefix.to_lowercase()),
            None => Matcher::Equals(raw.to_lowercase()),
        }
    }

    /// 匹配输入，返回捕获结果（正则专用）
    pub fn captures<'a>(&'a self, input: &'a str) -> Option<regex::Captures<'a>> {
        match self {
            Matcher::Regex(regex) => regex.captures(input),
            _ => None,
        }
    }

    /// 简单匹配判断
    pub fn is_match(&self, input: &str) -> bool {
        match self {
            Matcher::Equals(s) => input.to_lowercase() == *s,
            Matcher::StartsWith(s) => input.to_lowercase().starts_with(s.as_str()),
            Matcher::Regex(regex) => regex.is_match(input),
        }
    }

    /// 规则描述
    pub fn describe(&self) -> &str {
        match self {
            Matcher::Equals(s) => s,
            Matcher::StartsWith(s) => s,
            Matcher::Regex(r) => r.as_str(),
        }
    }
}

/// 编译后的模式（可带版本模板）
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    pub matcher: Matcher,
    pub version_template: Option<String>,
}

impl CompiledPattern {
    pub fn is_match(&self, input: &str) -> bool {
        self.matcher.is_match(input)
    }
}

/// 编译后的 CSS 选择器，原文作为 DOM 索引的键
#[derive(Debug, Clone)]
pub struct CompiledSelector {
    pub raw: String,
    pub selector: Selector,
}

/// 自定义谓词（以代码形式注册的规则）
#[derive(Clone)]
pub struct CustomPredicate(pub Arc<dyn Fn(&EvidenceBundle) -> bool + Send + Sync>);

impl fmt::Debug for CustomPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomPredicate(..)")
    }
}

/// 编译后的谓词
#[derive(Debug, Clone)]
pub enum CompiledPredicate {
    Any(Vec<CompiledPredicate>),
    All(Vec<CompiledPredicate>),
    Global(String),
    Dom(CompiledSelector),
    Meta {
        name: String,
        pattern: Option<CompiledPattern>,
    },
    Html(CompiledPattern),
    InlineScript(CompiledPattern),
    ClassList(CompiledPattern),
    ScriptSrc(CompiledPattern),
    Stylesheet(CompiledPattern),
    Resource(CompiledPattern),
    Cookie {
        name: Matcher,
        value: Option<CompiledPattern>,
    },
    CookieString(CompiledPattern),
    Header {
        name: String,
        value: Option<CompiledPattern>,
    },
    RequestUrl(CompiledPattern),
    RequestPath {
        pattern: CompiledPattern,
        same_origin: bool,
    },
    StorageKey(CompiledPattern),
    IndexedDb(CompiledPattern),
    Hostname(CompiledPattern),
    ChunkContent(CompiledPattern),
    Custom(CustomPredicate),
}

/// 编译后的版本探针
#[derive(Debug, Clone)]
pub enum CompiledVersionProbe {
    Global(String),
    ScriptSrc(CompiledPattern),
    DomAttr { selector: CompiledSelector, attr: String },
    Meta { name: String, pattern: CompiledPattern },
    Fixed { value: String, when_global: String },
}

/// 编译后的技术规则
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub name: String,
    pub category: Category,
    pub inferred: bool,
    pub predicate: CompiledPredicate,
    pub version: Vec<CompiledVersionProbe>,
    pub unknown_version: bool,
}

/// 编译后的规则库
#[derive(Debug, Clone, Default)]
pub struct CompiledRuleLibrary {
    pub rules: Vec<CompiledRule>,
    pub implications: Vec<ImplicationRule>,
    pub suppressions: Vec<SuppressionRule>,
    pub fallbacks: Vec<FallbackRule>,
}

impl CompiledRuleLibrary {
    /// 注册代码形式的规则，排在已有规则之后
    pub fn add_custom_rule<F>(&mut self, category: Category, name: impl Into<String>, predicate: F)
    where
        F: Fn(&EvidenceBundle) -> bool + Send + Sync + 'static,
    {
        self.rules.push(CompiledRule {
            name: name.into(),
            category,
            inferred: false,
            predicate: CompiledPredicate::Custom(CustomPredicate(Arc::new(predicate))),
            version: Vec::new(),
            unknown_version: false,
        });
    }

    /// 分块内容谓词用到的全部模式（按规则顺序）
    pub fn chunk_patterns(&self) -> Vec<CompiledPattern> {
        fn collect(predicate: &CompiledPredicate, out: &mut Vec<CompiledPattern>) {
            match predicate {
                CompiledPredicate::Any(children) | CompiledPredicate::All(children) => {
                    children.iter().for_each(|c| collect(c, out))
                }
                CompiledPredicate::ChunkContent(pattern) => out.push(pattern.clone()),
                _ => {}
            }
        }
        let mut patterns = Vec::new();
        for rule in &self.rules {
            collect(&rule.predicate, &mut patterns);
        }
        patterns
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
