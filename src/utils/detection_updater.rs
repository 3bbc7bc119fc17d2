//! 检测结果更新工具
//! 负责按技术名合并单条结果（保留顺序、版本只升不降、推导可转为直接命中）

use crate::report::Finding;

/// 检测结果更新工具
pub struct DetectionUpdater;

impl DetectionUpdater {
    /// 合并一条结果，返回结果集是否发生变化
    pub fn update(findings: &mut Vec<Finding>, incoming: Finding) -> bool {
        let Some(existing) = findings.iter_mut().find(|f| f.name == incoming.name) else {
            findings.push(incoming);
            return true;
        };

        let mut changed = false;

        if !existing.has_known_version() && incoming.has_known_version() {
            existing.version = incoming.version;
            changed = true;
        } else if existing.version.is_none() && incoming.version.is_some() {
            // 仅 "Unknown" 占位
            existing.version = incoming.version;
            changed = true;
        }

        // 直接命中覆盖推导结果，反向永不降级
        if existing.inferred && !incoming.inferred {
            existing.inferred = false;
            changed = true;
        }

        if existing.via.is_none() && incoming.via.is_some() {
            existing.via = incoming.via;
            changed = true;
        }

        changed
    }
}
