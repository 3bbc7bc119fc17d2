//! 检测器核心：对证据逐条求值规则，输出分类报告
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use super::analyzer::{DomIndex, EvaluationContext, PredicateAnalyzer, VersionAnalyzer};
use super::postprocess::PostProcessor;
use crate::compiler::{CompiledRule, CompiledRuleLibrary, RuleCompiler};
use crate::error::SpResult;
use crate::evidence::EvidenceBundle;
use crate::report::{AggregateReport, Finding, UNKNOWN_VERSION};
use crate::rule::RuleLoader;

/// 技术检测器
#[derive(Debug, Clone)]
pub struct TechDetector {
    compiled_lib: Arc<CompiledRuleLibrary>,
    post: PostProcessor,
}

impl TechDetector {
    /// 基于已编译规则库创建检测器
    pub fn new(compiled_lib: Arc<CompiledRuleLibrary>) -> Self {
        let post = PostProcessor::from_library(&compiled_lib);
        Self { compiled_lib, post }
    }

    /// 使用内置规则库
    pub fn builtin() -> SpResult<Self> {
        let rule_lib = RuleLoader::builtin()?;
        let compiled_lib = RuleCompiler::compile(&rule_lib)?;
        Ok(Self::new(Arc::new(compiled_lib)))
    }

    pub fn rules(&self) -> &CompiledRuleLibrary {
        &self.compiled_lib
    }

    pub fn post_processor(&self) -> &PostProcessor {
        &self.post
    }

    /// 解析证据中的 DOM 并建立本规则库的查询索引
    pub fn index_dom(&self, bundle: &EvidenceBundle) -> DomIndex {
        DomIndex::build(bundle, &self.compiled_lib)
    }

    /// 按规则表顺序逐条求值（不做后处理）
    pub fn evaluate_rules(&self, bundle: &EvidenceBundle) -> AggregateReport {
        self.evaluate_rules_indexed(bundle, &self.index_dom(bundle))
    }

    /// 使用已建立的 DOM 索引求值，索引须来自本检测器的 `index_dom`
    /// 单条规则 panic 时记录告警并视为未命中
    pub fn evaluate_rules_indexed(&self, bundle: &EvidenceBundle, dom: &DomIndex) -> AggregateReport {
        let start = Instant::now();
        let ctx = EvaluationContext::new(bundle, dom);
        let mut report = AggregateReport::new();

        for rule in &self.compiled_lib.rules {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| Self::evaluate_rule(rule, &ctx)));
            match outcome {
                Ok(Some(finding)) => {
                    debug!("规则命中：分类={}，技术={}，版本={:?}", rule.category, finding.name, finding.version);
                    report.get_mut(rule.category).upsert(finding);
                }
                Ok(None) => {}
                Err(_) => warn!("规则求值异常，已跳过：{}（{}）", rule.name, rule.category),
            }
        }

        debug!("规则求值完成，命中{}项，耗时{:?}", report.total(), start.elapsed());
        report
    }

    /// 求值 + 后处理
    pub fn detect(&self, bundle: &EvidenceBundle) -> AggregateReport {
        self.detect_indexed(bundle, &self.index_dom(bundle))
    }

    pub fn detect_indexed(&self, bundle: &EvidenceBundle, dom: &DomIndex) -> AggregateReport {
        let mut report = self.evaluate_rules_indexed(bundle, dom);
        self.post.apply(&mut report);
        report
    }

    fn evaluate_rule(rule: &CompiledRule, ctx: &EvaluationContext) -> Option<Finding> {
        let outcome = PredicateAnalyzer::evaluate(&rule.predicate, ctx)?;

        let mut finding = Finding::new(rule.name.clone());
        if rule.inferred {
            finding = finding.inferred();
        }
        if outcome.via_headers {
            finding = finding.via("headers");
        }

        let version = VersionAnalyzer::resolve(rule, ctx)
            .or(outcome.version)
            .or_else(|| rule.unknown_version.then(|| UNKNOWN_VERSION.to_string()));
        if let Some(version) = version {
            finding = finding.with_version(version);
        }
        Some(finding)
    }
}
