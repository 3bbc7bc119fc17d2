//! 结果聚合器
//! 合并多轮检测产生的报告补丁，并按页面维护当前报告
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::AggregateReport;
use crate::detector::PostProcessor;

/// 页面会话标识（每个标签页/页面视图一个）
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId(pub String);

impl PageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PageId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// 按页面保存的聚合报告
#[derive(Debug, Clone, Default)]
pub struct ResultAggregator {
    reports: HashMap<PageId, AggregateReport>,
    post: PostProcessor,
}

impl ResultAggregator {
    pub fn new(post: PostProcessor) -> Self {
        Self {
            reports: HashMap::new(),
            post,
        }
    }

    /// 将补丁并入报告：按名称取并集（不删除），再执行一次后处理
    /// 返回报告是否发生变化
    pub fn merge_into(
        report: &mut AggregateReport,
        patch: &AggregateReport,
        post: &PostProcessor,
    ) -> bool {
        let mut changed = false;
        for (cat, findings) in patch.iter() {
            let target = report.get_mut(cat);
            for finding in findings {
                changed |= target.upsert(finding.clone());
            }
        }
        changed |= post.apply(report);
        changed
    }

    /// 合并指定页面的补丁
    pub fn merge(&mut self, page_id: &PageId, patch: &AggregateReport) -> bool {
        let report = self.reports.entry(page_id.clone()).or_default();
        let changed = Self::merge_into(report, patch, &self.post);
        if changed {
            debug!("页面{}报告已更新，共{}项", page_id, report.total());
        }
        changed
    }

    /// 查询当前报告；尚未检测过的页面返回空报告
    pub fn query(&self, page_id: &PageId) -> AggregateReport {
        self.reports.get(page_id).cloned().unwrap_or_default()
    }

    pub fn contains(&self, page_id: &PageId) -> bool {
        self.reports.contains_key(page_id)
    }

    /// 以权威快照覆盖缓存
    pub fn replace(&mut self, page_id: &PageId, report: AggregateReport) {
        self.reports.insert(page_id.clone(), report);
    }

    /// 导航时清空页面报告
    pub fn reset(&mut self, page_id: &PageId) {
        self.reports.insert(page_id.clone(), AggregateReport::new());
    }

    pub fn remove(&mut self, page_id: &PageId) -> Option<AggregateReport> {
        self.reports.remove(page_id)
    }

    pub fn post_processor(&self) -> &PostProcessor {
        &self.post
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::Finding;
    use crate::rule::model::{Category, SuppressionRule};

    fn node_suppressor() -> PostProcessor {
        PostProcessor::new(
            Vec::new(),
            vec![SuppressionRule {
                category: Category::Backend,
                specific: "Next.js API".to_string(),
                generic: vec!["Node.js".to_string()],
            }],
            Vec::new(),
        )
    }

    fn patch(category: Category, findings: Vec<Finding>) -> AggregateReport {
        let mut report = AggregateReport::new();
        for finding in findings {
            report.get_mut(category).upsert(finding);
        }
        report
    }

    #[test]
    fn test_query_before_detection_is_empty() {
        let aggregator = ResultAggregator::default();
        let report = aggregator.query(&PageId::from("tab-1"));
        assert!(report.is_empty());
        assert_eq!(report, AggregateReport::new());
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut aggregator = ResultAggregator::new(node_suppressor());
        let page = PageId::from("tab-1");
        let p = patch(
            Category::Frameworks,
            vec![Finding::new("React").with_version("18.2.0"), Finding::new("Next.js")],
        );
        assert!(aggregator.merge(&page, &p));
        let once = aggregator.query(&page);
        assert!(!aggregator.merge(&page, &p));
        assert_eq!(aggregator.query(&page), once);
    }

    #[test]
    fn test_generic_runtime_suppressed_across_merges() {
        let mut aggregator = ResultAggregator::new(node_suppressor());
        let page = PageId::from("tab-1");
        aggregator.merge(&page, &patch(Category::Backend, vec![Finding::new("Node.js")]));
        aggregator.merge(&page, &patch(Category::Backend, vec![Finding::new("Next.js API")]));
        let report = aggregator.query(&page);
        assert_eq!(report.backend.as_slice(), &[Finding::new("Next.js API")]);
    }

    #[test]
    fn test_merge_order_does_not_change_membership() {
        let post = node_suppressor();
        let a = patch(Category::Databases, vec![Finding::new("Supabase")]);
        let b = patch(Category::Databases, vec![Finding::new("Firebase")]);

        let mut left = AggregateReport::new();
        ResultAggregator::merge_into(&mut left, &a, &post);
        ResultAggregator::merge_into(&mut left, &b, &post);
        let mut right = AggregateReport::new();
        ResultAggregator::merge_into(&mut right, &b, &post);
        ResultAggregator::merge_into(&mut right, &a, &post);

        let mut l = left.databases.names();
        let mut r = right.databases.names();
        l.sort();
        r.sort();
        assert_eq!(l, r);
    }

    #[test]
    fn test_version_survives_later_unknown() {
        let mut aggregator = ResultAggregator::default();
        let page = PageId::from("tab-1");
        aggregator.merge(
            &page,
            &patch(Category::Frameworks, vec![Finding::new("Vue.js").with_version("3.4.1")]),
        );
        aggregator.merge(
            &page,
            &patch(Category::Frameworks, vec![Finding::new("Vue.js").with_version("Unknown")]),
        );
        let report = aggregator.query(&page);
        assert_eq!(report.frameworks.get("Vue.js").unwrap().version.as_deref(), Some("3.4.1"));
    }

    #[test]
    fn test_reset_and_remove() {
        let mut aggregator = ResultAggregator::default();
        let page = PageId::from("tab-1");
        aggregator.merge(&page, &patch(Category::Hosting, vec![Finding::new("Vercel")]));
        aggregator.reset(&page);
        assert!(aggregator.query(&page).is_empty());
        assert!(aggregator.remove(&page).is_some());
        assert!(!aggregator.contains(&page));
    }
}
