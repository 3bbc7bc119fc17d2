//! 检测报告模块：单条结果、分类结果集与聚合报告
pub mod aggregator;

pub use self::aggregator::{PageId, ResultAggregator};

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::rule::model::Category;
use crate::utils::DetectionUpdater;

/// 版本未知占位（视同无版本，可被已知版本覆盖）
pub const UNKNOWN_VERSION: &str = "Unknown";

/// 单条检测结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub inferred: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via: Option<String>,
}

fn is_false(v: &bool) -> bool {
    !*v
}

impl Finding {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            inferred: false,
            via: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn inferred(mut self) -> Self {
        self.inferred = true;
        self
    }

    pub fn via(mut self, via: impl Into<String>) -> Self {
        self.via = Some(via.into());
        self
    }

    pub fn has_known_version(&self) -> bool {
        matches!(&self.version, Some(v) if !v.is_empty() && v != UNKNOWN_VERSION)
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) if self.has_known_version() => write!(f, "{} {}", self.name, v)?,
            _ => write!(f, "{}", self.name)?,
        }
        if self.inferred {
            write!(f, " (inferred)")?;
        }
        Ok(())
    }
}

/// 分类结果集：按名称唯一、保持检测顺序
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Finding>", into = "Vec<Finding>")]
pub struct CategoryResultSet(Vec<Finding>);

impl CategoryResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 合并一条结果，返回是否变化
    pub fn upsert(&mut self, finding: Finding) -> bool {
        DetectionUpdater::update(&mut self.0, finding)
    }

    /// 移除指定名称，返回是否存在
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|f| f.name != name);
        self.0.len() != before
    }

    pub fn get(&self, name: &str) -> Option<&Finding> {
        self.0.iter().find(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Finding> {
        self.0.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.0.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[Finding] {
        &self.0
    }
}

impl From<Vec<Finding>> for CategoryResultSet {
    fn from(findings: Vec<Finding>) -> Self {
        let mut set = CategoryResultSet::new();
        for finding in findings {
            set.upsert(finding);
        }
        set
    }
}

impl From<CategoryResultSet> for Vec<Finding> {
    fn from(set: CategoryResultSet) -> Self {
        set.0
    }
}

impl<'a> IntoIterator for &'a CategoryResultSet {
    type Item = &'a Finding;
    type IntoIter = std::slice::Iter<'a, Finding>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// 聚合报告：分类 -> 有序结果集
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AggregateReport {
    pub frameworks: CategoryResultSet,
    pub css_frameworks: CategoryResultSet,
    pub analytics: CategoryResultSet,
    pub cms: CategoryResultSet,
    pub libraries: CategoryResultSet,
    pub backend: CategoryResultSet,
    pub databases: CategoryResultSet,
    pub hosting: CategoryResultSet,
}

impl AggregateReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, category: Category) -> &CategoryResultSet {
        match category {
            Category::Frameworks => &self.frameworks,
            Category::CssFrameworks => &self.css_frameworks,
            Category::Analytics => &self.analytics,
            Category::Cms => &self.cms,
            Category::Libraries => &self.libraries,
            Category::Backend => &self.backend,
            Category::Databases => &self.databases,
            Category::Hosting => &self.hosting,
        }
    }

    pub fn get_mut(&mut self, category: Category) -> &mut CategoryResultSet {
        match category {
            Category::Frameworks => &mut self.frameworks,
            Category::CssFrameworks => &mut self.css_frameworks,
            Category::Analytics => &mut self.analytics,
            Category::Cms => &mut self.cms,
            Category::Libraries => &mut self.libraries,
            Category::Backend => &mut self.backend,
            Category::Databases => &mut self.databases,
            Category::Hosting => &mut self.hosting,
        }
    }

    pub fn contains(&self, category: Category, name: &str) -> bool {
        self.get(category).contains(name)
    }

    /// 按固定分类顺序遍历
    pub fn iter(&self) -> impl Iterator<Item = (Category, &CategoryResultSet)> {
        Category::ALL.into_iter().map(move |cat| (cat, self.get(cat)))
    }

    pub fn is_empty(&self) -> bool {
        self.iter().all(|(_, set)| set.is_empty())
    }

    pub fn total(&self) -> usize {
        self.iter().map(|(_, set)| set.len()).sum()
    }
}

impl fmt::Display for AggregateReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (cat, set) in self.iter().filter(|(_, set)| !set.is_empty()) {
            let items: Vec<String> = set.iter().map(|finding| finding.to_string()).collect();
            writeln!(f, "{}: {}", cat, items.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_report_has_every_category() {
        let json = serde_json::to_value(AggregateReport::new()).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 8);
        for cat in Category::ALL {
            assert_eq!(obj[cat.as_str()], serde_json::json!([]));
        }
    }

    #[test]
    fn test_finding_serialization_omits_defaults() {
        let json = serde_json::to_value(Finding::new("PostgreSQL").inferred()).unwrap();
        assert_eq!(json, serde_json::json!({"name": "PostgreSQL", "inferred": true}));
        let json = serde_json::to_value(Finding::new("Supabase")).unwrap();
        assert_eq!(json, serde_json::json!({"name": "Supabase"}));
    }

    #[test]
    fn test_deserialization_folds_duplicates() {
        let raw = r#"{"backend": [{"name": "PHP", "inferred": true}, {"name": "PHP"}]}"#;
        let report: AggregateReport = serde_json::from_str(raw).unwrap();
        assert_eq!(report.backend.len(), 1);
        assert!(!report.backend.get("PHP").unwrap().inferred);
        assert!(report.frameworks.is_empty());
    }

    #[test]
    fn test_display_lists_non_empty_categories() {
        let mut report = AggregateReport::new();
        report.frameworks.upsert(Finding::new("React").with_version("18.2.0"));
        report.databases.upsert(Finding::new("PostgreSQL").inferred());
        let text = report.to_string();
        assert!(text.contains("frameworks: React 18.2.0"));
        assert!(text.contains("databases: PostgreSQL (inferred)"));
        assert!(!text.contains("hosting"));
    }
}
