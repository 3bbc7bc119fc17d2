//! 规则数据模型定义
//! 仅存储规则数据，无任何业务逻辑，支持序列化/反序列化

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StackprintError;

/// 技术分类（固定集合，顺序即报告中的输出顺序）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Category {
    Frameworks,
    CssFrameworks,
    Analytics,
    Cms,
    Libraries,
    Backend,
    Databases,
    Hosting,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::Frameworks,
        Category::CssFrameworks,
        Category::Analytics,
        Category::Cms,
        Category::Libraries,
        Category::Backend,
        Category::Databases,
        Category::Hosting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Frameworks => "frameworks",
            Category::CssFrameworks => "cssFrameworks",
            Category::Analytics => "analytics",
            Category::Cms => "cms",
            Category::Libraries => "libraries",
            Category::Backend => "backend",
            Category::Databases => "databases",
            Category::Hosting => "hosting",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = StackprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .iter()
            .copied()
            .find(|cat| cat.as_str() == s)
            .ok_or_else(|| StackprintError::InvalidInput(format!("未知分类：{}", s)))
    }
}

/// 规则谓词（原始 JSON 形式）
/// 模式字符串均为大小写不敏感的正则，可带 `\;version:\1` 版本模板后缀
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RawPredicate {
    Any(Vec<RawPredicate>),
    All(Vec<RawPredicate>),
    /// 全局变量路径存在（如 `React`、`$.fn.jquery`）
    Global(String),
    /// CSS 选择器命中
    Dom(String),
    Meta {
        name: String,
        #[serde(default)]
        pattern: Option<String>,
    },
    Html(String),
    InlineScript(String),
    ClassList(String),
    ScriptSrc(String),
    Stylesheet(String),
    Resource(String),
    /// Cookie 名（大小写不敏感，末尾 `*` 表示前缀匹配）
    Cookie {
        name: String,
        #[serde(default)]
        value: Option<String>,
    },
    CookieString(String),
    /// 任一已观测请求的响应头
    Header {
        name: String,
        #[serde(default)]
        value: Option<String>,
    },
    RequestUrl(String),
    RequestPath {
        pattern: String,
        #[serde(default, rename = "sameOrigin")]
        same_origin: bool,
    },
    StorageKey(String),
    IndexedDb(String),
    Hostname(String),
    ChunkContent(String),
}

/// 版本探针（按顺序尝试，首个命中生效）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RawVersionProbe {
    Global(String),
    ScriptSrc(String),
    DomAttr {
        selector: String,
        attr: String,
    },
    Meta {
        name: String,
        pattern: String,
    },
    Fixed {
        value: String,
        #[serde(rename = "whenGlobal")]
        when_global: String,
    },
}

/// 技术签名规则
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TechRule {
    pub name: String,
    pub category: Category,
    // 仅有泛化信号的低置信度规则
    #[serde(default)]
    pub inferred: bool,
    #[serde(rename = "match")]
    pub predicate: RawPredicate,
    #[serde(default)]
    pub version: Vec<RawVersionProbe>,
    // 版本探针全部落空时输出 "Unknown"
    #[serde(default)]
    pub unknown_version: bool,
}

/// 分类 + 技术名
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TechRef {
    pub category: Category,
    pub name: String,
}

impl TechRef {
    pub fn new(category: Category, name: impl Into<String>) -> Self {
        Self {
            category,
            name: name.into(),
        }
    }
}

/// 推导规则：when 存在时补充 then（推导结果）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImplicationRule {
    pub when: TechRef,
    pub then: TechRef,
}

/// 抑制规则：同分类下存在 specific 时移除 generic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuppressionRule {
    pub category: Category,
    pub specific: String,
    pub generic: Vec<String>,
}

/// 兜底规则：分类为空且任一触发项存在时补充唯一的推导结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackRule {
    pub category: Category,
    pub name: String,
    pub when: Vec<TechRef>,
}

/// 完整规则库
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleLibrary {
    #[serde(default)]
    pub rules: Vec<TechRule>,
    #[serde(default)]
    pub implications: Vec<ImplicationRule>,
    #[serde(default)]
    pub suppressions: Vec<SuppressionRule>,
    #[serde(default)]
    pub fallbacks: Vec<FallbackRule>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_names_round_trip() {
        for cat in Category::ALL {
            assert_eq!(cat.as_str().parse::<Category>().unwrap(), cat);
        }
        assert!("frontend".parse::<Category>().is_err());
    }

    #[test]
    fn test_rule_json_shape() {
        let raw = r#"{
            "name": "Supabase",
            "category": "databases",
            "match": {"any": [
                {"cookie": {"name": "sb-*"}},
                {"requestPath": {"pattern": "/rest/v1", "sameOrigin": false}}
            ]}
        }"#;
        let rule: TechRule = serde_json::from_str(raw).unwrap();
        assert_eq!(rule.category, Category::Databases);
        assert!(!rule.inferred);
        let RawPredicate::Any(children) = &rule.predicate else {
            panic!("expected any");
        };
        assert_eq!(
            children[0],
            RawPredicate::Cookie {
                name: "sb-*".to_string(),
                value: None
            }
        );
    }
}
