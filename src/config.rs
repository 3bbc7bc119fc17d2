//! 检测配置管理
//! 持久化设置由宿主负责存储，这里只负责解析、默认值与取值钳制

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SpResult;

const DEFAULT_CHUNK_SCAN_MAX_FILES: u32 = 15;
const DEFAULT_CHUNK_SCAN_MAX_TIME_MS: u64 = 500;
const DEFAULT_HEADER_TIMEOUT_MS: u64 = 800;

/// 检测设置（与扩展持久化设置的字段名保持一致）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DetectionSettings {
    // 是否拉取并扫描打包后的脚本分块
    pub enable_chunk_scan: bool,
    // 每个会话最多扫描的分块数
    pub chunk_scan_max_files: u32,
    // 分块扫描总耗时预算（毫秒）
    pub chunk_scan_max_time_ms: u64,
    // 仅观察前台页面的网络事件
    pub active_tab_only: bool,
    // 是否通过响应头识别托管平台
    pub enable_header_hosting_detection: bool,
    // 响应头探测超时（毫秒）
    pub header_detection_timeout_ms: u64,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            enable_chunk_scan: false,
            chunk_scan_max_files: DEFAULT_CHUNK_SCAN_MAX_FILES,
            chunk_scan_max_time_ms: DEFAULT_CHUNK_SCAN_MAX_TIME_MS,
            active_tab_only: true,
            enable_header_hosting_detection: true,
            header_detection_timeout_ms: DEFAULT_HEADER_TIMEOUT_MS,
        }
    }
}

impl DetectionSettings {
    /// 从宿主保存的 JSON 设置解析，缺失字段取默认值
    pub fn from_json_str(raw: &str) -> SpResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// 响应头探测超时，钳制在 [200, 2000] 毫秒
    pub fn header_detection_timeout(&self) -> Duration {
        Duration::from_millis(self.header_detection_timeout_ms.clamp(200, 2000))
    }

    /// 分块扫描文件数上限，0 视为未设置，钳制在 [1, 50]
    pub fn chunk_scan_file_limit(&self) -> usize {
        let raw = if self.chunk_scan_max_files == 0 {
            DEFAULT_CHUNK_SCAN_MAX_FILES
        } else {
            self.chunk_scan_max_files
        };
        raw.clamp(1, 50) as usize
    }

    /// 分块扫描时间预算，0 视为未设置，钳制在 [100, 2000] 毫秒
    pub fn chunk_scan_budget(&self) -> Duration {
        let raw = if self.chunk_scan_max_time_ms == 0 {
            DEFAULT_CHUNK_SCAN_MAX_TIME_MS
        } else {
            self.chunk_scan_max_time_ms
        };
        Duration::from_millis(raw.clamp(100, 2000))
    }
}

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    Never,     // 不重试
    Times(u8), // 固定次数重试（不含第一次）
}

impl RetryPolicy {
    /// 总尝试次数（含第一次）
    pub fn attempts(&self) -> usize {
        match self {
            RetryPolicy::Never => 1,
            RetryPolicy::Times(n) => 1 + *n as usize,
        }
    }
}

/// 跨上下文查询配置
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub query_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(1),
            retry: RetryPolicy::Times(2),
        }
    }
}

/// 配置管理器
pub struct ConfigManager;

impl ConfigManager {
    /// 获取默认配置
    pub fn get_default() -> DetectionSettings {
        DetectionSettings::default()
    }

    /// 自定义配置
    pub fn custom() -> CustomConfigBuilder {
        CustomConfigBuilder::new()
    }
}

/// 配置构建器（链式 API）
#[derive(Debug, Clone, Default)]
pub struct CustomConfigBuilder {
    config: DetectionSettings,
}

impl CustomConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable_chunk_scan(mut self, enable: bool) -> Self {
        self.config.enable_chunk_scan = enable;
        self
    }

    pub fn chunk_scan_max_files(mut self, max_files: u32) -> Self {
        self.config.chunk_scan_max_files = max_files;
        self
    }

    pub fn chunk_scan_max_time_ms(mut self, ms: u64) -> Self {
        self.config.chunk_scan_max_time_ms = ms;
        self
    }

    pub fn active_tab_only(mut self, only: bool) -> Self {
        self.config.active_tab_only = only;
        self
    }

    pub fn enable_header_hosting_detection(mut self, enable: bool) -> Self {
        self.config.enable_header_hosting_detection = enable;
        self
    }

    pub fn header_detection_timeout_ms(mut self, ms: u64) -> Self {
        self.config.header_detection_timeout_ms = ms;
        self
    }

    pub fn build(self) -> DetectionSettings {
        self.config
    }
}
