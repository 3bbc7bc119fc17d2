//! 编译模块：将原始规则编译为可执行的谓词与模式
pub mod pattern;
pub mod compiler;

pub use self::pattern::{
    CompiledPattern, CompiledPredicate, CompiledRule, CompiledRuleLibrary, CompiledSelector, CompiledVersionProbe,
    CustomPredicate, Matcher,
};
pub use self::compiler::RuleCompiler;
