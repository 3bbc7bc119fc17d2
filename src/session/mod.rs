//! 检测会话：每个页面一个会话对象，持有累积证据、当前报告与网络观测状态
//! 导航时显式 reset，不依赖任何全局状态
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};
use url::Url;

use crate::config::DetectionSettings;
use crate::detector::{DomIndex, TechDetector};
use crate::evidence::{
    EvidenceBundle, EvidenceCollector, EvidencePatch, NetworkEvent, PageProbe, RequestKind,
};
use crate::report::{AggregateReport, PageId, ResultAggregator};

/// 各网络原语的观测安装状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallOutcome {
    pub fetch: bool,
    pub xhr: bool,
    pub beacon: bool,
    pub web_socket: bool,
}

impl InstallOutcome {
    pub fn any(&self) -> bool {
        self.fetch || self.xhr || self.beacon || self.web_socket
    }
}

/// 页面检测会话
#[derive(Debug)]
pub struct DetectionSession {
    page_id: PageId,
    settings: DetectionSettings,
    detector: Arc<TechDetector>,
    evidence: EvidenceBundle,
    dom_index: DomIndex,
    report: AggregateReport,
    // 已安装的观测原语
    observers: InstallOutcome,
    notifier: watch::Sender<AggregateReport>,
}

impl DetectionSession {
    pub fn new(page_id: PageId, settings: DetectionSettings, detector: Arc<TechDetector>) -> Self {
        let (notifier, _) = watch::channel(AggregateReport::new());
        Self {
            page_id,
            settings,
            detector,
            evidence: EvidenceBundle::new(),
            dom_index: DomIndex::default(),
            report: AggregateReport::new(),
            observers: InstallOutcome::default(),
            notifier,
        }
    }

    pub fn page_id(&self) -> &PageId {
        &self.page_id
    }

    pub fn settings(&self) -> &DetectionSettings {
        &self.settings
    }

    pub fn detector(&self) -> &TechDetector {
        &self.detector
    }

    pub fn evidence(&self) -> &EvidenceBundle {
        &self.evidence
    }

    /// 导航：丢弃证据、报告与观测状态，返回报告是否因此变化
    pub fn reset(&mut self, page_url: Option<Url>) -> bool {
        info!("页面{}导航，重置检测会话：{:?}", self.page_id, page_url.as_ref().map(Url::as_str));
        self.evidence = EvidenceBundle {
            page_url,
            ..EvidenceBundle::default()
        };
        self.dom_index = DomIndex::default();
        self.observers = InstallOutcome::default();
        if self.report.is_empty() {
            return false;
        }
        self.report = AggregateReport::new();
        self.notifier.send_replace(self.report.clone());
        true
    }

    /// 完整页面检测：采集、刷新累积证据、检测、合并
    /// DOM 只在这里解析，之后的增量证据复用同一份索引
    pub fn run_page_pass(&mut self, probe: &dyn PageProbe) -> bool {
        let fresh = EvidenceCollector::collect_page_evidence(probe);
        self.evidence.refresh_page(fresh);
        self.dom_index = self.detector.index_dom(&self.evidence);
        self.redetect()
    }

    /// 安装网络观测，已安装的原语不会重复安装
    pub fn install_network_observation(&mut self) -> InstallOutcome {
        let installed = InstallOutcome {
            fetch: !self.observers.fetch,
            xhr: !self.observers.xhr,
            beacon: !self.observers.beacon,
            web_socket: !self.observers.web_socket,
        };
        self.observers = InstallOutcome {
            fetch: true,
            xhr: true,
            beacon: true,
            web_socket: true,
        };
        if installed.any() {
            info!("页面{}已安装网络观测：{:?}", self.page_id, installed);
        }
        installed
    }

    /// 文档与资源计时事件不经拦截，始终接收
    pub fn is_observing(&self, kind: RequestKind) -> bool {
        match kind {
            RequestKind::Fetch => self.observers.fetch,
            RequestKind::Xhr => self.observers.xhr,
            RequestKind::Beacon => self.observers.beacon,
            RequestKind::WebSocket => self.observers.web_socket,
            RequestKind::Document | RequestKind::Resource => true,
        }
    }

    /// 处理网络观测事件，未安装对应原语时忽略
    pub fn observe_network_event(&mut self, event: &NetworkEvent) -> bool {
        if !self.is_observing(event.kind()) {
            debug!("未安装{:?}观测，忽略事件：{}", event.kind(), event.url());
            return false;
        }
        let patch = EvidenceCollector::observe_network_event(event, self.evidence.page_url.as_ref());
        self.apply_patch(patch)
    }

    /// 追加增量证据并对累积证据重新检测
    pub fn apply_patch(&mut self, patch: EvidencePatch) -> bool {
        if patch.is_empty() {
            return false;
        }
        self.evidence.apply(patch);
        self.redetect()
    }

    pub fn report(&self) -> &AggregateReport {
        &self.report
    }

    pub fn snapshot(&self) -> AggregateReport {
        self.report.clone()
    }

    /// 订阅报告更新（仅在报告变化时通知）
    pub fn subscribe(&self) -> watch::Receiver<AggregateReport> {
        self.notifier.subscribe()
    }

    fn redetect(&mut self) -> bool {
        let patch = self.detector.detect_indexed(&self.evidence, &self.dom_index);
        let changed = ResultAggregator::merge_into(&mut self.report, &patch, self.detector.post_processor());
        if changed {
            debug!("页面{}报告更新，共{}项", self.page_id, self.report.total());
            self.notifier.send_replace(self.report.clone());
        }
        changed
    }
}
