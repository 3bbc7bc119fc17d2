//! 检测后处理：推导、抑制与兜底
//! 三张规则表均来自规则库，按固定顺序执行直至报告不再变化
use tracing::debug;

use crate::compiler::CompiledRuleLibrary;
use crate::report::{AggregateReport, Finding};
use crate::rule::model::{FallbackRule, ImplicationRule, SuppressionRule, TechRef};

/// 单次 apply 内的最大迭代轮数（链式推导的上限）
const MAX_ROUNDS: usize = 8;

/// 后处理器
#[derive(Debug, Clone, Default)]
pub struct PostProcessor {
    implications: Vec<ImplicationRule>,
    suppressions: Vec<SuppressionRule>,
    fallbacks: Vec<FallbackRule>,
}

fn present(report: &AggregateReport, tech: &TechRef) -> bool {
    report.contains(tech.category, &tech.name)
}

impl PostProcessor {
    pub fn new(
        implications: Vec<ImplicationRule>,
        suppressions: Vec<SuppressionRule>,
        fallbacks: Vec<FallbackRule>,
    ) -> Self {
        Self {
            implications,
            suppressions,
            fallbacks,
        }
    }

    pub fn from_library(lib: &CompiledRuleLibrary) -> Self {
        Self::new(
            lib.implications.clone(),
            lib.suppressions.clone(),
            lib.fallbacks.clone(),
        )
    }

    /// 执行后处理，返回报告是否变化
    pub fn apply(&self, report: &mut AggregateReport) -> bool {
        let mut changed = false;
        for _ in 0..MAX_ROUNDS {
            let round = self.apply_implications(report)
                | self.apply_suppressions(report)
                | self.apply_fallbacks(report);
            if !round {
                break;
            }
            changed = true;
        }
        changed
    }

    /// when 存在且 then 缺失时补充推导结果
    fn apply_implications(&self, report: &mut AggregateReport) -> bool {
        let mut changed = false;
        for rule in &self.implications {
            if present(report, &rule.when) && !present(report, &rule.then) {
                debug!("推导：{} -> {}", rule.when.name, rule.then.name);
                report
                    .get_mut(rule.then.category)
                    .upsert(Finding::new(rule.then.name.clone()).inferred());
                changed = true;
            }
        }
        changed
    }

    /// 同分类下存在具体技术时移除泛化技术
    fn apply_suppressions(&self, report: &mut AggregateReport) -> bool {
        let mut changed = false;
        for rule in &self.suppressions {
            let set = report.get_mut(rule.category);
            if !set.contains(&rule.specific) {
                continue;
            }
            for generic in &rule.generic {
                if generic != &rule.specific && set.remove(generic) {
                    debug!("抑制：{} 覆盖 {}", rule.specific, generic);
                    changed = true;
                }
            }
        }
        changed
    }

    /// 分类为空且触发项存在时补充唯一兜底结果；出现其他结果时撤回兜底
    fn apply_fallbacks(&self, report: &mut AggregateReport) -> bool {
        let mut changed = false;
        for rule in &self.fallbacks {
            let triggered = rule.when.iter().any(|t| present(report, t));
            let set = report.get_mut(rule.category);
            let has_others = set.iter().any(|f| f.name != rule.name);
            if has_others {
                if set.remove(&rule.name) {
                    debug!("兜底撤回：{}", rule.name);
                    changed = true;
                }
            } else if triggered && !set.contains(&rule.name) {
                debug!("兜底补充：{}", rule.name);
                set.upsert(Finding::new(rule.name.clone()).inferred());
                changed = true;
            }
        }
        changed
    }
}
