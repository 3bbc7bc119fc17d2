//! 规则加载管理器
//! 负责加载内置目录或本地规则文件（JSON / MessagePack）

use std::collections::HashSet;
use std::path::Path;

use tracing::{debug, warn};

use super::catalog::BUILTIN_RULES;
use super::model::{Category, RuleLibrary};
use crate::error::{SpResult, StackprintError};

/// 规则文件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleFileType {
    Json,
    MsgPack,
}

impl RuleFileType {
    /// 按扩展名判断，`.mp` / `.msgpack` 为 MessagePack，其余按 JSON 处理
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("mp") || ext.eq_ignore_ascii_case("msgpack") => {
                RuleFileType::MsgPack
            }
            _ => RuleFileType::Json,
        }
    }
}

/// 规则加载管理器
pub struct RuleLoader;

impl RuleLoader {
    /// 加载内置规则库
    pub fn builtin() -> SpResult<RuleLibrary> {
        Self::from_json_str(BUILTIN_RULES)
            .map_err(|e| StackprintError::RuleLoadError(format!("内置规则库解析失败：{}", e)))
    }

    /// 解析 JSON 规则库
    pub fn from_json_str(raw: &str) -> SpResult<RuleLibrary> {
        let rule_lib: RuleLibrary = serde_json::from_str(raw)
            .map_err(|e| StackprintError::RuleParseError(format!("规则 JSON 反序列化失败：{}", e)))?;
        Self::validate(&rule_lib);
        Self::debug_stats(&rule_lib);
        Ok(rule_lib)
    }

    /// 解析 MessagePack 规则库
    pub fn from_msgpack(bytes: &[u8]) -> SpResult<RuleLibrary> {
        let rule_lib: RuleLibrary = rmp_serde::from_slice(bytes)
            .map_err(|e| StackprintError::RuleParseError(format!("反序列化 mp 失败：{}", e)))?;
        Self::validate(&rule_lib);
        Self::debug_stats(&rule_lib);
        Ok(rule_lib)
    }

    /// 序列化为 MessagePack（带字段名）
    pub fn to_msgpack(rule_lib: &RuleLibrary) -> SpResult<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(rule_lib)?)
    }

    /// 从本地文件加载规则库
    pub async fn from_path(path: impl AsRef<Path>) -> SpResult<RuleLibrary> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            StackprintError::RuleLoadError(format!("读取规则文件 {} 失败：{}", path.display(), e))
        })?;
        debug!("读取规则文件：{}（{} 字节）", path.display(), bytes.len());

        match RuleFileType::from_path(path) {
            RuleFileType::MsgPack => Self::from_msgpack(&bytes),
            RuleFileType::Json => {
                let raw = String::from_utf8(bytes).map_err(|e| {
                    StackprintError::RuleLoadError(format!("规则文件不是合法 UTF-8：{}", e))
                })?;
                Self::from_json_str(&raw)
            }
        }
    }

    /// 校验后处理表引用的技术名，未知引用只告警
    fn validate(rule_lib: &RuleLibrary) {
        let mut known: HashSet<(Category, &str)> = rule_lib
            .rules
            .iter()
            .map(|r| (r.category, r.name.as_str()))
            .collect();
        known.extend(
            rule_lib
                .implications
                .iter()
                .map(|i| (i.then.category, i.then.name.as_str())),
        );
        known.extend(rule_lib.fallbacks.iter().map(|f| (f.category, f.name.as_str())));

        let check = |category: Category, name: &str, table: &str| {
            if !known.contains(&(category, name)) {
                warn!("{}引用了未知技术：{}（{}）", table, name, category);
            }
        };

        for rule in &rule_lib.implications {
            check(rule.when.category, &rule.when.name, "推导规则");
        }
        for rule in &rule_lib.suppressions {
            check(rule.category, &rule.specific, "抑制规则");
            for generic in &rule.generic {
                check(rule.category, generic, "抑制规则");
            }
        }
        for rule in &rule_lib.fallbacks {
            for trigger in &rule.when {
                check(trigger.category, &trigger.name, "兜底规则");
            }
        }
    }

    // ===== 规则数据统计 =====
    fn debug_stats(rule_lib: &RuleLibrary) {
        let inferred = rule_lib.rules.iter().filter(|r| r.inferred).count();
        let with_version = rule_lib.rules.iter().filter(|r| !r.version.is_empty()).count();

        debug!("===== 规则库数据统计 =====");
        debug!("  签名规则总数：{}（推断规则 {}）", rule_lib.rules.len(), inferred);
        debug!("  带版本探针的规则数：{}", with_version);
        for cat in Category::ALL {
            let count = rule_lib.rules.iter().filter(|r| r.category == cat).count();
            debug!("  {}：{}", cat, count);
        }
        debug!(
            "  推导/抑制/兜底：{}/{}/{}",
            rule_lib.implications.len(),
            rule_lib.suppressions.len(),
            rule_lib.fallbacks.len()
        );
    }
}
