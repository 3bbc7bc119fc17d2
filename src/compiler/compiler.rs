//! 规则编译器核心
//! 将原始规则记录编译为可执行的谓词、正则与选择器

use std::time::Instant;

use regex::RegexBuilder;
use scraper::Selector;
use tracing::debug;

use super::pattern::{
    CompiledPattern, CompiledPredicate, CompiledRule, CompiledRuleLibrary, CompiledSelector,
    CompiledVersionProbe, Matcher,
};
use crate::error::{SpResult, StackprintError};
use crate::rule::model::{RawPredicate, RawVersionProbe, RuleLibrary, TechRule};

/// 版本模板分隔符
const VERSION_MARKER: &str = ";version:";

/// 规则编译器
pub struct RuleCompiler;

impl RuleCompiler {
    /// 编译规则库
    pub fn compile(rule_lib: &RuleLibrary) -> SpResult<CompiledRuleLibrary> {
        let start = Instant::now();
        let mut stats = CompileStats::default();

        let mut rules = Vec::with_capacity(rule_lib.rules.len());
        for rule in &rule_lib.rules {
            let compiled = Self::compile_rule(rule, &mut stats).map_err(|e| {
                StackprintError::RuleParseError(format!("规则「{}」({})编译失败：{}", rule.name, rule.category, e))
            })?;
            if compiled.inferred {
                stats.inferred_count += 1;
            }
            rules.push(compiled);
        }

        debug!("规则编译完成，共{}条，总耗时{:?}", rules.len(), start.elapsed());
        debug!(
            "编译统计：正则{}条、选择器{}条、全局变量{}条、Cookie{}条、Header{}条、版本探针{}条、推导规则{}条",
            stats.pattern_count,
            stats.selector_count,
            stats.global_count,
            stats.cookie_count,
            stats.header_count,
            stats.version_count,
            stats.inferred_count
        );

        Ok(CompiledRuleLibrary {
            rules,
            implications: rule_lib.implications.clone(),
            suppressions: rule_lib.suppressions.clone(),
            fallbacks: rule_lib.fallbacks.clone(),
        })
    }

    /// 编译单个技术规则
    fn compile_rule(rule: &TechRule, stats: &mut CompileStats) -> SpResult<CompiledRule> {
        let predicate = Self::compile_predicate(&rule.predicate, stats)?;
        let version = rule
            .version
            .iter()
            .map(|probe| Self::compile_version_probe(probe, stats))
            .collect::<SpResult<Vec<_>>>()?;

        Ok(CompiledRule {
            name: rule.name.clone(),
            category: rule.category,
            inferred: rule.inferred,
            predicate,
            version,
            unknown_version: rule.unknown_version,
        })
    }

    /// 递归编译谓词
    fn compile_predicate(raw: &RawPredicate, stats: &mut CompileStats) -> SpResult<CompiledPredicate> {
        let compiled = match raw {
            RawPredicate::Any(children) => CompiledPredicate::Any(
                children
                    .iter()
                    .map(|c| Self::compile_predicate(c, stats))
                    .collect::<SpResult<_>>()?,
            ),
            RawPredicate::All(children) => CompiledPredicate::All(
                children
                    .iter()
                    .map(|c| Self::compile_predicate(c, stats))
                    .collect::<SpResult<_>>()?,
            ),
            RawPredicate::Global(path) => {
                stats.global_count += 1;
                CompiledPredicate::Global(path.clone())
            }
            RawPredicate::Dom(selector) => {
                stats.selector_count += 1;
                CompiledPredicate::Dom(Self::compile_selector(selector)?)
            }
            RawPredicate::Meta { name, pattern: p } => CompiledPredicate::Meta {
                name: name.to_lowercase(),
                pattern: p.as_deref().map(|p| Self::counted_pattern(p, stats)).transpose()?,
            },
            RawPredicate::Html(p) => CompiledPredicate::Html(Self::counted_pattern(p, stats)?),
            RawPredicate::InlineScript(p) => CompiledPredicate::InlineScript(Self::counted_pattern(p, stats)?),
            RawPredicate::ClassList(p) => CompiledPredicate::ClassList(Self::counted_pattern(p, stats)?),
            RawPredicate::ScriptSrc(p) => CompiledPredicate::ScriptSrc(Self::counted_pattern(p, stats)?),
            RawPredicate::Stylesheet(p) => CompiledPredicate::Stylesheet(Self::counted_pattern(p, stats)?),
            RawPredicate::Resource(p) => CompiledPredicate::Resource(Self::counted_pattern(p, stats)?),
            RawPredicate::Cookie { name, value } => CompiledPredicate::Cookie {
                name: Matcher::name(name),
                value: value.as_deref().map(|p| Self::counted_pattern(p, stats)).transpose()?,
            },
            RawPredicate::CookieString(p) => CompiledPredicate::CookieString(Self::counted_pattern(p, stats)?),
            RawPredicate::Header { name, value } => CompiledPredicate::Header {
                name: name.to_lowercase(),
                value: value.as_deref().map(|p| Self::counted_pattern(p, stats)).transpose()?,
            },
            RawPredicate::RequestUrl(p) => CompiledPredicate::RequestUrl(Self::counted_pattern(p, stats)?),
            RawPredicate::RequestPath {
                pattern: p,
                same_origin,
            } => CompiledPredicate::RequestPath {
                pattern: Self::counted_pattern(p, stats)?,
                same_origin: *same_origin,
            },
            RawPredicate::StorageKey(p) => CompiledPredicate::StorageKey(Self::counted_pattern(p, stats)?),
            RawPredicate::IndexedDb(p) => CompiledPredicate::IndexedDb(Self::counted_pattern(p, stats)?),
            RawPredicate::Hostname(p) => CompiledPredicate::Hostname(Self::counted_pattern(p, stats)?),
            RawPredicate::ChunkContent(p) => CompiledPredicate::ChunkContent(Self::counted_pattern(p, stats)?),
        };

        match &compiled {
            CompiledPredicate::Cookie { .. } => stats.cookie_count += 1,
            CompiledPredicate::Header { .. } => stats.header_count += 1,
            _ => {}
        }
        Ok(compiled)
    }

    fn counted_pattern(raw: &str, stats: &mut CompileStats) -> SpResult<CompiledPattern> {
        stats.pattern_count += 1;
        Self::compile_single_pattern(raw)
    }

    /// 编译版本探针（未带模板的模式默认取第一个分组）
    fn compile_version_probe(
        raw: &RawVersionProbe,
        stats: &mut CompileStats,
    ) -> SpResult<CompiledVersionProbe> {
        stats.version_count += 1;
        let with_default_template = |p: &str| -> SpResult<CompiledPattern> {
            let mut compiled = Self::compile_single_pattern(p)?;
            compiled.version_template.get_or_insert_with(|| "\\1".to_string());
            Ok(compiled)
        };

        Ok(match raw {
            RawVersionProbe::Global(path) => CompiledVersionProbe::Global(path.clone()),
            RawVersionProbe::ScriptSrc(p) => CompiledVersionProbe::ScriptSrc(with_default_template(p)?),
            RawVersionProbe::DomAttr { selector, attr } => CompiledVersionProbe::DomAttr {
                selector: Self::compile_selector(selector)?,
                attr: attr.clone(),
            },
            RawVersionProbe::Meta { name, pattern } => CompiledVersionProbe::Meta {
                name: name.to_lowercase(),
                pattern: with_default_template(pattern)?,
            },
            RawVersionProbe::Fixed { value, when_global } => CompiledVersionProbe::Fixed {
                value: value.clone(),
                when_global: when_global.clone(),
            },
        })
    }

    /// 编译单个正则模式（大小写不敏感，拆出版本模板）
    pub fn compile_single_pattern(raw_pattern: &str) -> SpResult<CompiledPattern> {
        let (pattern, version_template) = match raw_pattern.split_once(VERSION_MARKER) {
            Some((pattern, template)) => {
                // `\;version:` 写法中的转义符属于分隔符
                let pattern = pattern.strip_suffix('\\').unwrap_or(pattern);
                (pattern, Some(template.to_string()))
            }
            None => (raw_pattern, None),
        };

        let regex = RegexBuilder::new(pattern).case_insensitive(true).build()?;

        Ok(CompiledPattern {
            matcher: Matcher::Regex(regex),
            version_template,
        })
    }

    /// 编译CSS选择器
    pub fn compile_selector(raw: &str) -> SpResult<CompiledSelector> {
        let selector =
            Selector::parse(raw).map_err(|e| StackprintError::SelectorError(format!("{}：{}", raw, e)))?;
        Ok(CompiledSelector {
            raw: raw.to_string(),
            selector,
        })
    }
}

/// 编译统计信息
#[derive(Debug, Clone, Default)]
struct CompileStats {
    pattern_count: usize,
    selector_count: usize,
    global_count: usize,
    cookie_count: usize,
    header_count: usize,
    version_count: usize,
    inferred_count: usize,
}
