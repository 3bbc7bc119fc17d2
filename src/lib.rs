//! stackprint - 被动式网页技术栈指纹识别引擎

// 导出全局错误类型
pub use self::error::{SpResult, StackprintError};

// 导出配置模块
pub use self::config::{BridgeConfig, ConfigManager, CustomConfigBuilder, DetectionSettings, RetryPolicy};

// 导出规则模块核心接口
pub use self::rule::{Category, RuleLibrary, RuleLoader, TechRule};

// 导出证据模块核心接口
pub use self::evidence::{
    EvidenceBundle, EvidenceCollector, EvidencePatch, NetworkEvent, NetworkRequest, PageProbe,
    PageSnapshot, RequestKind, ResourceKind, ResourceRef,
};

// 导出提取模块核心接口
pub use self::extractor::HtmlExtractor;

// 导出工具模块核心接口
pub use self::utils::{DetectionUpdater, HeaderConverter, VersionExtractor};

// 导出编译模块核心接口
pub use self::compiler::{CompiledPattern, CompiledRule, CompiledRuleLibrary, RuleCompiler};

// 导出检测模块核心接口
pub use self::detector::{detect_with_global, init_global_detector, DomIndex, PostProcessor, TechDetector};

// 导出报告、会话、探测与桥接接口
pub use self::bridge::{BridgeRequest, BridgeResponse, Coordinator, PageAgent, PageHandle, ReportUpdated};
pub use self::probe::{ChunkScanner, HeaderProbe};
pub use self::report::{AggregateReport, CategoryResultSet, Finding, PageId, ResultAggregator};
pub use self::session::{DetectionSession, InstallOutcome};

// 声明所有子模块
pub mod bridge;
pub mod compiler;
pub mod config;
pub mod detector;
pub mod error;
pub mod evidence;
pub mod extractor;
pub mod probe;
pub mod report;
pub mod rule;
pub mod session;
pub mod utils;
