//! 内置规则目录（编译期嵌入）

/// 内置规则库 JSON 文本
pub const BUILTIN_RULES: &str = include_str!("../../data/rules.json");
