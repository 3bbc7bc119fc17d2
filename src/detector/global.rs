//! 全局检测器单例管理
use once_cell::sync::OnceCell;

use super::detector::TechDetector;
use crate::error::SpResult;
use crate::evidence::EvidenceBundle;
use crate::report::AggregateReport;

/// 全局检测器实例（内置规则库）
static GLOBAL_DETECTOR: OnceCell<TechDetector> = OnceCell::new();

/// 初始化全局检测器（重复调用直接返回已有实例）
pub fn init_global_detector() -> SpResult<&'static TechDetector> {
    GLOBAL_DETECTOR.get_or_try_init(TechDetector::builtin)
}

/// 使用全局检测器检测（首次调用时自动初始化）
pub fn detect_with_global(bundle: &EvidenceBundle) -> SpResult<AggregateReport> {
    Ok(init_global_detector()?.detect(bundle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_detector_is_shared() {
        let first = init_global_detector().unwrap() as *const TechDetector;
        let second = init_global_detector().unwrap() as *const TechDetector;
        assert_eq!(first, second);
        assert!(detect_with_global(&EvidenceBundle::new()).unwrap().is_empty());
    }
}
