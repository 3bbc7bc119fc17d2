//! 检测模块：技术检测核心逻辑
pub mod analyzer;
pub mod detector;
pub mod global;
pub mod postprocess;

// 导出核心接口
pub use self::analyzer::{DomIndex, EvaluationContext, MatchOutcome, PredicateAnalyzer, VersionAnalyzer};
pub use self::detector::TechDetector;
pub use self::global::{detect_with_global, init_global_detector};
pub use self::postprocess::PostProcessor;
