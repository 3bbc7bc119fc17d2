//! 规则模块：负责规则数据模型、内置目录与加载
pub mod catalog;
pub mod loader;
pub mod model;

// 导出核心接口
pub use self::loader::RuleLoader;
pub use self::model::{
    Category, FallbackRule, ImplicationRule, RawPredicate, RawVersionProbe, RuleLibrary,
    SuppressionRule, TechRef, TechRule,
};
